use crate::error::Result;
use crate::shape::Shape;
use std::fmt;

// Backend — Abstraction over compute devices and their normalization kernels
//
// The Backend trait is where the per-element numerics live. Synchronized
// batch norm only orchestrates these kernels around collective calls; it
// never touches raw elements itself. A backend provides:
//
//   batch_norm_stats           — per-channel mean and invstd of a local shard
//   batch_norm_elemt           — y = (x - mean) * invstd * weight + bias
//   batch_norm_backward_reduce — per-channel mean_dy, mean_dy_xmu, dW, dB
//   batch_norm_backward_elemt  — dx from the (possibly synchronized) reductions
//
// LAYOUT:
//
//   Every kernel receives the logical shape [N, C, *] of the input and
//   assumes contiguous row-major storage. Per-channel tensors are [C].
//
// WHY A TRAIT AND NOT AN ENUM?
//
// Using a trait means new backends can live in separate crates, each with its
// own storage type, and Tensor<B> stays monomorphized over the backend.

/// Identifies a compute device (e.g., "cpu:0").
///
/// Devices are comparable so that callers can check that a tensor lives where
/// a communicator expects it.
pub trait BackendDevice: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// A human-readable name for this device (e.g., "cpu:0").
    fn name(&self) -> String;
}

/// A storage buffer that holds tensor data on a specific device.
pub trait BackendStorage: Clone + Send + Sync + 'static {
    /// Total number of elements in this storage.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which outputs `batch_norm_backward_reduce` should compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackwardMask {
    /// Compute `mean_dy` and `mean_dy_xmu` (needed for the input gradient).
    pub input: bool,
    /// Compute the weight gradient.
    pub weight: bool,
    /// Compute the bias gradient.
    pub bias: bool,
}

impl BackwardMask {
    /// Request every output.
    pub fn all() -> Self {
        BackwardMask {
            input: true,
            weight: true,
            bias: true,
        }
    }
}

/// Per-channel reductions produced by the backward pass, before any
/// cross-worker synchronization. Each field is `None` unless requested.
#[derive(Debug, Clone)]
pub struct BackwardReduce<S> {
    /// mean over the local shard of `grad_output`, per channel.
    pub mean_dy: Option<S>,
    /// mean over the local shard of `grad_output * (x - mean)`, per channel.
    pub mean_dy_xmu: Option<S>,
    /// `sum(grad_output * x_hat)`, per channel.
    pub grad_weight: Option<S>,
    /// `sum(grad_output)`, per channel.
    pub grad_bias: Option<S>,
}

/// The main Backend trait. Implementing this for a struct (e.g., CpuBackend)
/// makes that struct a complete compute backend for syncbn.
///
/// All operations take storage + shape and return new storage (no in-place
/// mutation).
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    /// The device type for this backend.
    type Device: BackendDevice;
    /// The storage type for this backend.
    type Storage: BackendStorage + fmt::Debug;

    //  Creation

    /// Allocate storage filled with a constant value.
    fn full(shape: &Shape, val: f64, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage from a flat f64 slice.
    fn from_f64_slice(data: &[f64], device: &Self::Device) -> Result<Self::Storage>;

    /// Copy data from this storage to a Vec<f64> on the host.
    fn to_f64_vec(input: &Self::Storage) -> Result<Vec<f64>>;

    //  Element-wise

    /// Affine transform: result = input * mul + add.
    fn affine(input: &Self::Storage, mul: f64, add: f64) -> Result<Self::Storage>;

    //  Normalization kernels

    /// Per-channel mean and inverse standard deviation `1 / sqrt(var + eps)`
    /// of an `[N, C, *]` input, using the biased (population) variance.
    fn batch_norm_stats(
        input: &Self::Storage,
        shape: &Shape,
        eps: f64,
    ) -> Result<(Self::Storage, Self::Storage)>;

    /// Element-wise normalization: `(x - mean[c]) * invstd[c] * w[c] + b[c]`.
    /// A missing weight acts as ones, a missing bias as zeros.
    fn batch_norm_elemt(
        input: &Self::Storage,
        shape: &Shape,
        weight: Option<&Self::Storage>,
        bias: Option<&Self::Storage>,
        mean: &Self::Storage,
        invstd: &Self::Storage,
    ) -> Result<Self::Storage>;

    /// Per-channel reductions of the backward pass over the local shard.
    fn batch_norm_backward_reduce(
        grad_output: &Self::Storage,
        input: &Self::Storage,
        shape: &Shape,
        mean: &Self::Storage,
        invstd: &Self::Storage,
        weight: Option<&Self::Storage>,
        mask: BackwardMask,
    ) -> Result<BackwardReduce<Self::Storage>>;

    /// Input gradient:
    /// `(dy - mean_dy[c] - (x - mean[c]) * invstd[c]^2 * mean_dy_xmu[c]) * invstd[c] * w[c]`.
    #[allow(clippy::too_many_arguments)]
    fn batch_norm_backward_elemt(
        grad_output: &Self::Storage,
        input: &Self::Storage,
        shape: &Shape,
        mean: &Self::Storage,
        invstd: &Self::Storage,
        weight: Option<&Self::Storage>,
        mean_dy: &Self::Storage,
        mean_dy_xmu: &Self::Storage,
    ) -> Result<Self::Storage>;
}
