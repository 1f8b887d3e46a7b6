use std::sync::Arc;

use crate::backend::{Backend, BackendDevice, BackendStorage, BackwardMask};
use crate::error::{Error, Result};
use crate::shape::Shape;

// Tensor — The fundamental data structure
//
// A Tensor is an n-dimensional array that lives on a specific device of a
// backend. Tensors are immutable: every operation returns a new tensor.
//
// MEMORY MODEL:
//
//   The inner data is wrapped in Arc, so cloning a Tensor is O(1). Saving
//   the input for the backward pass therefore shares the buffer with the
//   caller instead of copying it. `reshape` creates a new handle over the
//   same storage (all storage is contiguous, so a reshape never copies).

struct TensorInner<B: Backend> {
    storage: Arc<B::Storage>,
    shape: Shape,
    device: B::Device,
}

/// An n-dimensional array of numbers on a specific backend.
///
/// # Example
/// ```ignore
/// let x = Tensor::<CpuBackend>::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), &CpuDevice::default())?;
/// let (mean, invstd) = x.batch_norm_stats(1e-5)?;
/// ```
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(shape={}, device={})",
            self.inner.shape,
            self.inner.device.name(),
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Constructors

    /// Wrap backend storage in a tensor. Fails if the element count of
    /// `storage` does not match `shape`.
    pub fn from_storage(
        storage: B::Storage,
        shape: impl Into<Shape>,
        device: B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if storage.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: storage.len(),
                shape,
            });
        }
        Ok(Tensor {
            inner: Arc::new(TensorInner {
                storage: Arc::new(storage),
                shape,
                device,
            }),
        })
    }

    /// Create a tensor from a flat slice of values in row-major order.
    pub fn from_f64_slice(data: &[f64], shape: impl Into<Shape>, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let storage = B::from_f64_slice(data, device)?;
        Self::from_storage(storage, shape, device.clone())
    }

    /// Tensor filled with `val`.
    pub fn full(shape: impl Into<Shape>, val: f64, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::full(&shape, val, device)?;
        Self::from_storage(storage, shape, device.clone())
    }

    /// Tensor filled with zeros.
    pub fn zeros(shape: impl Into<Shape>, device: &B::Device) -> Result<Self> {
        Self::full(shape, 0.0, device)
    }

    /// Tensor filled with ones.
    pub fn ones(shape: impl Into<Shape>, device: &B::Device) -> Result<Self> {
        Self::full(shape, 1.0, device)
    }

    // Accessors

    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.shape.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.shape.elem_count()
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    /// Raw backend storage.
    pub fn storage(&self) -> &B::Storage {
        &self.inner.storage
    }

    /// Whether two handles point at the same underlying buffer.
    pub fn shares_storage(&self, other: &Tensor<B>) -> bool {
        Arc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }

    /// Copy the data to the host.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        B::to_f64_vec(&self.inner.storage)
    }

    // Shape ops

    /// Same data viewed with a different shape.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: shape,
            });
        }
        Ok(Tensor {
            inner: Arc::new(TensorInner {
                storage: Arc::clone(&self.inner.storage),
                shape,
                device: self.inner.device.clone(),
            }),
        })
    }

    /// Insert a leading axis of size 1: `[C]` → `[1, C]`.
    pub fn unsqueeze0(&self) -> Result<Self> {
        let mut dims = Vec::with_capacity(self.rank() + 1);
        dims.push(1);
        dims.extend_from_slice(self.dims());
        self.reshape(dims)
    }

    // Element-wise

    /// `self * mul + add`.
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let storage = B::affine(self.storage(), mul, add)?;
        Self::from_storage(storage, self.shape().clone(), self.device().clone())
    }

    // Normalization kernels

    /// Per-channel `(mean, invstd)` of an `[N, C, *]` tensor, each of shape `[C]`.
    pub fn batch_norm_stats(&self, eps: f64) -> Result<(Self, Self)> {
        let (_, c, _) = self.shape().channel_split()?;
        let (mean, invstd) = B::batch_norm_stats(self.storage(), self.shape(), eps)?;
        Ok((
            Self::from_storage(mean, c, self.device().clone())?,
            Self::from_storage(invstd, c, self.device().clone())?,
        ))
    }

    /// Normalize with the given per-channel statistics and optional affine
    /// parameters.
    pub fn batch_norm_elemt(
        &self,
        weight: Option<&Tensor<B>>,
        bias: Option<&Tensor<B>>,
        mean: &Tensor<B>,
        invstd: &Tensor<B>,
    ) -> Result<Self> {
        let (_, c, _) = self.shape().channel_split()?;
        for t in [Some(mean), Some(invstd), weight, bias].into_iter().flatten() {
            check_channel_vec(t, c)?;
        }
        let out = B::batch_norm_elemt(
            self.storage(),
            self.shape(),
            weight.map(|w| w.storage()),
            bias.map(|b| b.storage()),
            mean.storage(),
            invstd.storage(),
        )?;
        Self::from_storage(out, self.shape().clone(), self.device().clone())
    }

    /// Per-channel backward reductions with `self` as the forward input.
    pub fn batch_norm_backward_reduce(
        &self,
        grad_output: &Tensor<B>,
        mean: &Tensor<B>,
        invstd: &Tensor<B>,
        weight: Option<&Tensor<B>>,
        mask: BackwardMask,
    ) -> Result<BackwardReduceTensors<B>> {
        let (_, c, _) = self.shape().channel_split()?;
        check_same_shape(self, grad_output)?;
        for t in [Some(mean), Some(invstd), weight].into_iter().flatten() {
            check_channel_vec(t, c)?;
        }
        let r = B::batch_norm_backward_reduce(
            grad_output.storage(),
            self.storage(),
            self.shape(),
            mean.storage(),
            invstd.storage(),
            weight.map(|w| w.storage()),
            mask,
        )?;
        let device = self.device();
        let wrap = |s: Option<B::Storage>| -> Result<Option<Tensor<B>>> {
            s.map(|s| Tensor::from_storage(s, c, device.clone()))
                .transpose()
        };
        Ok(BackwardReduceTensors {
            mean_dy: wrap(r.mean_dy)?,
            mean_dy_xmu: wrap(r.mean_dy_xmu)?,
            grad_weight: wrap(r.grad_weight)?,
            grad_bias: wrap(r.grad_bias)?,
        })
    }

    /// Input gradient with `self` as the forward input.
    pub fn batch_norm_backward_elemt(
        &self,
        grad_output: &Tensor<B>,
        mean: &Tensor<B>,
        invstd: &Tensor<B>,
        weight: Option<&Tensor<B>>,
        mean_dy: &Tensor<B>,
        mean_dy_xmu: &Tensor<B>,
    ) -> Result<Self> {
        let (_, c, _) = self.shape().channel_split()?;
        check_same_shape(self, grad_output)?;
        for t in [Some(mean), Some(invstd), weight, Some(mean_dy), Some(mean_dy_xmu)]
            .into_iter()
            .flatten()
        {
            check_channel_vec(t, c)?;
        }
        let out = B::batch_norm_backward_elemt(
            grad_output.storage(),
            self.storage(),
            self.shape(),
            mean.storage(),
            invstd.storage(),
            weight.map(|w| w.storage()),
            mean_dy.storage(),
            mean_dy_xmu.storage(),
        )?;
        Self::from_storage(out, self.shape().clone(), self.device().clone())
    }
}

/// [`BackwardReduce`](crate::backend::BackwardReduce) lifted to tensors of shape `[C]`.
#[derive(Debug, Clone)]
pub struct BackwardReduceTensors<B: Backend> {
    pub mean_dy: Option<Tensor<B>>,
    pub mean_dy_xmu: Option<Tensor<B>>,
    pub grad_weight: Option<Tensor<B>>,
    pub grad_bias: Option<Tensor<B>>,
}

fn check_channel_vec<B: Backend>(t: &Tensor<B>, c: usize) -> Result<()> {
    if t.dims() != [c] {
        return Err(Error::ShapeMismatch {
            expected: Shape::from(c),
            got: t.shape().clone(),
        });
    }
    Ok(())
}

fn check_same_shape<B: Backend>(a: &Tensor<B>, b: &Tensor<B>) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(Error::ShapeMismatch {
            expected: a.shape().clone(),
            got: b.shape().clone(),
        });
    }
    Ok(())
}
