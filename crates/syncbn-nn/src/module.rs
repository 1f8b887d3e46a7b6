// Module trait — The interface every normalization layer implements
//
// A module exposes a forward computation plus its train/eval state. There is
// no base class: layers are plain structs implementing this trait, and the
// capability set is exactly { forward, parameters, training mode }.
//
// GENERIC OVER BACKEND:
//
// Modules are generic over B: Backend, so the same layer runs on whatever
// backend its tensors live on.

use syncbn_core::backend::Backend;
use syncbn_core::error::Result;
use syncbn_core::tensor::Tensor;

/// The fundamental trait for all layers.
///
/// # Example
/// ```ignore
/// let bn = SyncBatchNorm::new(SyncBatchNormConfig::new(16), &dev, comm)?;
/// bn.train();
/// let y = bn.forward(&x)?;
/// bn.eval();
/// ```
pub trait Module<B: Backend> {
    /// Compute the output tensor from the input tensor.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>>;

    /// Return all trainable parameters of this module.
    fn parameters(&self) -> Vec<Tensor<B>>;

    /// Set training or evaluation mode.
    ///
    /// Uses interior mutability (`Cell<bool>`) so `&self` suffices.
    fn set_training(&self, _training: bool) {}

    /// Whether the module is in training mode (default: true).
    fn is_training(&self) -> bool {
        true
    }

    /// Convenience: set training mode.
    fn train(&self) {
        self.set_training(true);
    }

    /// Convenience: set evaluation mode.
    fn eval(&self) {
        self.set_training(false);
    }

    /// Total number of scalar parameters in this module.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.elem_count()).sum()
    }

    /// Return all trainable parameters with human-readable names.
    ///
    /// The default uses positional indices (`param_0`, `param_1`, …).
    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        self.parameters()
            .into_iter()
            .enumerate()
            .map(|(i, p)| (format!("param_{i}"), p))
            .collect()
    }
}
