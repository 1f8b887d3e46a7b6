// SyncBatchNorm — Batch normalization over the global data-parallel batch
//
// Drop-in replacement for a batch-norm layer when every worker of a
// data-parallel job sees only a shard of the batch. Statistics are computed
// as if the shards were concatenated on one device.
//
// PATH SELECTION (per forward call):
//
//   world_size == 1                      → local batch_norm, no collectives
//   eval mode && track_running_stats     → local batch_norm with running stats
//   otherwise                            → SyncBatchNormFunction (3 all-gathers)
//
// Within the local path, batch statistics are used iff
// `training || !track_running_stats`.
//
// STATE:
//   weight, bias          [C]   learnable, present iff `affine`
//   running mean/var      [C]   present iff `track_running_stats`
//   num_batches_tracked         incremented once per training forward call
//
// Running statistics sit in a RefCell and the training flag in a Cell, so a
// module is driven through `&self` like any other layer. A module is meant
// to be used from one thread at a time.

use std::cell::{Cell, RefCell};

use tracing::debug;

use syncbn_core::backend::{Backend, BackendDevice};
use syncbn_core::bail;
use syncbn_core::collective::Communicator;
use syncbn_core::error::{Error, Result};
use syncbn_core::tensor::Tensor;

use crate::batchnorm::{batch_norm, BatchNormGrads, LocalBatchNormContext, NeedsInputGrad, RunningStats};
use crate::function::{SyncBatchNormContext, SyncBatchNormFunction};
use crate::module::Module;
use crate::stats::check_device;

/// Hyperparameters of a [`SyncBatchNorm`] layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncBatchNormConfig {
    /// Number of channels (C).
    pub num_features: usize,
    /// Added to the variance before the square root.
    pub eps: f64,
    /// Running-statistics momentum. `None` selects a cumulative moving
    /// average over all tracked batches.
    pub momentum: Option<f64>,
    /// Whether the layer has learnable weight and bias.
    pub affine: bool,
    /// Whether the layer keeps running statistics.
    pub track_running_stats: bool,
}

impl Default for SyncBatchNormConfig {
    fn default() -> Self {
        Self {
            num_features: 0,
            eps: 1e-5,
            momentum: Some(0.1),
            affine: true,
            track_running_stats: true,
        }
    }
}

impl SyncBatchNormConfig {
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            ..Self::default()
        }
    }
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }
    pub fn momentum(mut self, momentum: Option<f64>) -> Self {
        self.momentum = momentum;
        self
    }
    pub fn affine(mut self, affine: bool) -> Self {
        self.affine = affine;
        self
    }
    pub fn track_running_stats(mut self, track: bool) -> Self {
        self.track_running_stats = track;
        self
    }

    /// Check that the hyperparameters describe a usable layer.
    pub fn validate(&self) -> Result<()> {
        if self.num_features == 0 {
            bail!("SyncBatchNorm: num_features must be positive");
        }
        if self.eps.is_nan() || self.eps <= 0.0 {
            bail!("SyncBatchNorm: eps must be positive, got {}", self.eps);
        }
        if let Some(m) = self.momentum {
            if !(0.0..=1.0).contains(&m) {
                bail!("SyncBatchNorm: momentum must be in [0, 1], got {m}");
            }
        }
        Ok(())
    }
}

/// Saved state of one [`SyncBatchNorm`] forward call, for whichever path ran.
#[derive(Debug)]
pub enum BatchNormContext<B: Backend> {
    Local(LocalBatchNormContext<B>),
    Synced(SyncBatchNormContext<B>),
}

impl<B: Backend> BatchNormContext<B> {
    pub fn is_synced(&self) -> bool {
        matches!(self, BatchNormContext::Synced(_))
    }
}

/// Synchronized batch normalization layer.
///
/// # Examples
/// ```ignore
/// let bn = SyncBatchNorm::<CpuBackend, _>::new(SyncBatchNormConfig::new(16), &dev, comm)?;
/// let (y, ctx) = bn.forward_with_context(&x)?;   // x: [N, 16, *]
/// let grads = bn.backward(ctx, &dy, NeedsInputGrad::all())?;
/// ```
pub struct SyncBatchNorm<B: Backend, C: Communicator<B>> {
    /// Learnable scale (gamma): [C]
    weight: Option<Tensor<B>>,
    /// Learnable shift (beta): [C]
    bias: Option<Tensor<B>>,
    running: Option<RefCell<RunningStats>>,
    config: SyncBatchNormConfig,
    training: Cell<bool>,
    device: B::Device,
    comm: C,
}

impl<B: Backend, C: Communicator<B>> SyncBatchNorm<B, C> {
    /// Create a layer in training mode with weight = 1, bias = 0,
    /// running mean = 0 and running var = 1.
    pub fn new(config: SyncBatchNormConfig, device: &B::Device, comm: C) -> Result<Self> {
        config.validate()?;
        if device != comm.device() {
            return Err(Error::NotOnExpectedDevice {
                expected: comm.device().name(),
                got: device.name(),
            });
        }
        let c = config.num_features;
        let (weight, bias) = if config.affine {
            (Some(Tensor::ones(c, device)?), Some(Tensor::zeros(c, device)?))
        } else {
            (None, None)
        };
        let running = config
            .track_running_stats
            .then(|| RefCell::new(RunningStats::new(c)));
        Ok(SyncBatchNorm {
            weight,
            bias,
            running,
            config,
            training: Cell::new(true),
            device: device.clone(),
            comm,
        })
    }

    pub fn num_features(&self) -> usize {
        self.config.num_features
    }

    pub fn weight(&self) -> Option<&Tensor<B>> {
        self.weight.as_ref()
    }

    pub fn bias(&self) -> Option<&Tensor<B>> {
        self.bias.as_ref()
    }

    pub fn communicator(&self) -> &C {
        &self.comm
    }

    /// Snapshot of the running statistics, if tracked.
    pub fn running_stats(&self) -> Option<RunningStats> {
        self.running.as_ref().map(|r| r.borrow().clone())
    }

    pub fn num_batches_tracked(&self) -> Option<u64> {
        self.running.as_ref().map(|r| r.borrow().num_batches_tracked)
    }

    /// Running mean 0, running var 1, zero tracked batches.
    pub fn reset_running_stats(&self) {
        if let Some(r) = &self.running {
            r.borrow_mut().reset();
        }
    }

    /// Reset running statistics and set weight = 1, bias = 0.
    pub fn reset_parameters(&mut self) -> Result<()> {
        self.reset_running_stats();
        if self.config.affine {
            let c = self.config.num_features;
            self.weight = Some(Tensor::ones(c, &self.device)?);
            self.bias = Some(Tensor::zeros(c, &self.device)?);
        }
        Ok(())
    }

    /// Replace the affine parameters, e.g. after an optimizer step.
    pub fn set_affine(&mut self, weight: Tensor<B>, bias: Tensor<B>) -> Result<()> {
        if !self.config.affine {
            return Err(Error::msg("SyncBatchNorm: layer was created with affine = false"));
        }
        let c = self.config.num_features;
        for t in [&weight, &bias] {
            if t.dims() != [c] {
                return Err(Error::ChannelMismatch {
                    expected: c,
                    got: t.elem_count(),
                });
            }
            if t.device() != &self.device {
                return Err(Error::NotOnExpectedDevice {
                    expected: self.device.name(),
                    got: t.device().name(),
                });
            }
        }
        self.weight = Some(weight);
        self.bias = Some(bias);
        Ok(())
    }

    /// Forward pass that also returns the context needed for [`backward`](Self::backward).
    pub fn forward_with_context(&self, x: &Tensor<B>) -> Result<(Tensor<B>, BatchNormContext<B>)> {
        let (_, c, _) = x.shape().channel_split()?;
        check_device(x, &self.comm)?;
        if c != self.config.num_features {
            return Err(Error::ChannelMismatch {
                expected: self.config.num_features,
                got: c,
            });
        }

        let training = self.training.get();
        let track = self.config.track_running_stats;
        let use_batch_stats = training || !track;
        if use_batch_stats {
            let count = x.shape().per_channel_count()?;
            if count <= 1 {
                return Err(Error::InsufficientSamples { size: count });
            }
        }

        let mut running = self.running.as_ref().map(|r| r.borrow_mut());
        if training {
            if let Some(rs) = running.as_deref_mut() {
                rs.record_batch();
            }
        }

        let world_size = self.comm.size();
        let local = world_size == 1 || (!training && track);
        debug!(
            rank = self.comm.rank(),
            world_size,
            training,
            use_batch_stats,
            path = if local { "local" } else { "synced" },
            "sync batch norm forward"
        );

        if local {
            let (y, ctx) = batch_norm(
                x,
                running.as_deref_mut(),
                self.weight.as_ref(),
                self.bias.as_ref(),
                use_batch_stats,
                self.config.momentum,
                self.config.eps,
            )?;
            Ok((y, BatchNormContext::Local(ctx)))
        } else {
            let (y, ctx) = SyncBatchNormFunction::new(&self.comm).forward(
                x,
                self.weight.as_ref(),
                self.bias.as_ref(),
                running.as_deref_mut(),
                self.config.eps,
                self.config.momentum,
            )?;
            Ok((y, BatchNormContext::Synced(ctx)))
        }
    }

    /// Backward pass for a context produced by [`forward_with_context`](Self::forward_with_context).
    pub fn backward(
        &self,
        ctx: BatchNormContext<B>,
        grad_output: &Tensor<B>,
        needs: NeedsInputGrad,
    ) -> Result<BatchNormGrads<B>> {
        match ctx {
            BatchNormContext::Local(ctx) => ctx.backward(grad_output, needs),
            BatchNormContext::Synced(ctx) => {
                SyncBatchNormFunction::new(&self.comm).backward(ctx, grad_output, needs)
            }
        }
    }
}

impl<B: Backend, C: Communicator<B>> Module<B> for SyncBatchNorm<B, C> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        self.forward_with_context(x).map(|(y, _)| y)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        self.weight.iter().chain(self.bias.iter()).cloned().collect()
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        let mut out = Vec::new();
        if let Some(w) = &self.weight {
            out.push(("weight".to_string(), w.clone()));
        }
        if let Some(b) = &self.bias {
            out.push(("bias".to_string(), b.clone()));
        }
        out
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    fn is_training(&self) -> bool {
        self.training.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncbn_core::{CpuBackend, CpuDevice, SingleWorker};

    type Bn = SyncBatchNorm<CpuBackend, SingleWorker<CpuBackend>>;

    fn layer(config: SyncBatchNormConfig) -> Bn {
        let dev = CpuDevice(0);
        SyncBatchNorm::new(config, &dev, SingleWorker::new(dev)).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let cfg = SyncBatchNormConfig::new(4);
        assert_eq!(cfg.eps, 1e-5);
        assert_eq!(cfg.momentum, Some(0.1));
        assert!(cfg.affine);
        assert!(cfg.track_running_stats);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert_eq!(
            SyncBatchNormConfig::new(0).validate().unwrap_err().to_string(),
            "SyncBatchNorm: num_features must be positive"
        );
        assert!(SyncBatchNormConfig::new(2).eps(0.0).validate().is_err());
        assert!(SyncBatchNormConfig::new(2).momentum(Some(1.5)).validate().is_err());
        assert!(SyncBatchNormConfig::new(2).momentum(None).validate().is_ok());
    }

    #[test]
    fn test_new_initializes_parameters() {
        let bn = layer(SyncBatchNormConfig::new(3));
        assert_eq!(bn.weight().unwrap().to_f64_vec().unwrap(), vec![1.0; 3]);
        assert_eq!(bn.bias().unwrap().to_f64_vec().unwrap(), vec![0.0; 3]);
        assert_eq!(bn.num_parameters(), 6);
        let names: Vec<String> = bn.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["weight", "bias"]);
        let rs = bn.running_stats().unwrap();
        assert_eq!(rs.mean, vec![0.0; 3]);
        assert_eq!(rs.var, vec![1.0; 3]);
        assert!(bn.is_training());
    }

    #[test]
    fn test_no_affine_no_tracking() {
        let bn = layer(SyncBatchNormConfig::new(2).affine(false).track_running_stats(false));
        assert!(bn.parameters().is_empty());
        assert!(bn.running_stats().is_none());
        assert!(bn.num_batches_tracked().is_none());
    }

    #[test]
    fn test_training_increments_batches() {
        let bn = layer(SyncBatchNormConfig::new(1));
        let x = Tensor::from_f64_slice(&[1.0, 2.0, 3.0], (3, 1), &CpuDevice(0)).unwrap();
        bn.forward(&x).unwrap();
        bn.forward(&x).unwrap();
        assert_eq!(bn.num_batches_tracked(), Some(2));
        bn.eval();
        bn.forward(&x).unwrap();
        assert_eq!(bn.num_batches_tracked(), Some(2));
    }

    #[test]
    fn test_rejected_input_does_not_count() {
        let bn = layer(SyncBatchNormConfig::new(2));
        let x = Tensor::from_f64_slice(&[1.0, 2.0], (1, 2), &CpuDevice(0)).unwrap();
        assert!(matches!(
            bn.forward(&x),
            Err(Error::InsufficientSamples { size: 1 })
        ));
        let wrong_c = Tensor::from_f64_slice(&[1.0, 2.0, 3.0], (1, 3), &CpuDevice(0)).unwrap();
        assert!(matches!(
            bn.forward(&wrong_c),
            Err(Error::ChannelMismatch { expected: 2, got: 3 })
        ));
        assert_eq!(bn.num_batches_tracked(), Some(0));
    }

    #[test]
    fn test_eval_single_sample_ok_with_running_stats() {
        let bn = layer(SyncBatchNormConfig::new(2));
        bn.eval();
        let x = Tensor::from_f64_slice(&[1.0, 2.0], (1, 2), &CpuDevice(0)).unwrap();
        let y = bn.forward(&x).unwrap().to_f64_vec().unwrap();
        let s = 1.0 / (1.0f64 + 1e-5).sqrt();
        assert!((y[0] - s).abs() < 1e-12);
        assert!((y[1] - 2.0 * s).abs() < 1e-12);
    }

    #[test]
    fn test_reset() {
        let mut bn = layer(SyncBatchNormConfig::new(1));
        let x = Tensor::from_f64_slice(&[5.0, 7.0], (2, 1), &CpuDevice(0)).unwrap();
        bn.forward(&x).unwrap();
        assert_ne!(bn.running_stats().unwrap(), RunningStats::new(1));
        let dev = CpuDevice(0);
        bn.set_affine(
            Tensor::from_f64_slice(&[2.0], 1, &dev).unwrap(),
            Tensor::from_f64_slice(&[3.0], 1, &dev).unwrap(),
        )
        .unwrap();
        bn.reset_parameters().unwrap();
        assert_eq!(bn.running_stats().unwrap(), RunningStats::new(1));
        assert_eq!(bn.weight().unwrap().to_f64_vec().unwrap(), vec![1.0]);
        assert_eq!(bn.bias().unwrap().to_f64_vec().unwrap(), vec![0.0]);
    }

    #[test]
    fn test_set_affine_rejects_wrong_size() {
        let mut bn = layer(SyncBatchNormConfig::new(2));
        let dev = CpuDevice(0);
        let r = bn.set_affine(Tensor::ones(3, &dev).unwrap(), Tensor::zeros(2, &dev).unwrap());
        assert!(matches!(r, Err(Error::ChannelMismatch { expected: 2, got: 3 })));
    }

    #[test]
    fn test_wrong_device() {
        let bn = layer(SyncBatchNormConfig::new(1));
        let x = Tensor::from_f64_slice(&[1.0, 2.0], (2, 1), &CpuDevice(3)).unwrap();
        assert!(matches!(bn.forward(&x), Err(Error::NotOnExpectedDevice { .. })));
    }
}
