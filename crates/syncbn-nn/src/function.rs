// SyncBatchNormFunction — Differentiable synchronized batch normalization
//
// Forward normalizes each worker's shard with statistics of the global batch
// and saves what backward needs. Backward is the standard batch-norm
// gradient with its two per-channel reductions averaged across workers:
//
//   local:  mean_dy_w     = mean(dy_w)               over the shard
//           mean_dy_xmu_w = mean(dy_w * (x_w - μ))   over the shard
//
//   global: mean_dy       = Σ_w mean_dy_w / W        (all-reduce Sum, then / W)
//           mean_dy_xmu   = Σ_w mean_dy_xmu_w / W
//
//   dx_w = (dy_w - mean_dy - (x_w - μ) * invstd² * mean_dy_xmu) * invstd * γ
//
// The division is by the worker count, not by the sample count, so uneven
// shards weight every worker equally here.
//
// Weight and bias gradients stay local: summing them across workers is the
// data-parallel optimizer's job, like every other parameter gradient.
//
// COLLECTIVE SEQUENCE PER CALL:
//
//   forward:  allgather sync_batch_norm.count
//             allgather sync_batch_norm.mean
//             allgather sync_batch_norm.invstd
//   backward: allreduce sync_batch_norm.mean_dy        (only if dx is needed)
//             allreduce sync_batch_norm.mean_dy_xmu    (only if dx is needed)

use std::marker::PhantomData;

use tracing::debug;

use syncbn_core::backend::Backend;
use syncbn_core::collective::{Communicator, ReduceOp};
use syncbn_core::error::{Error, Result};
use syncbn_core::shape::Shape;
use syncbn_core::tensor::Tensor;

use crate::batchnorm::{
    backward_reduce, param_grads, take_input_terms, BatchNormGrads, NeedsInputGrad, RunningStats,
};
use crate::stats::{check_device, StatisticsSynchronizer};

/// Collective name for the averaged `mean(dy)`.
pub const MEAN_DY_NAME: &str = "sync_batch_norm.mean_dy";
/// Collective name for the averaged `mean(dy * (x - μ))`.
pub const MEAN_DY_XMU_NAME: &str = "sync_batch_norm.mean_dy_xmu";

/// Gradients returned by [`SyncBatchNormFunction::backward`].
pub type SyncBatchNormGrads<B> = BatchNormGrads<B>;

/// Values saved by [`SyncBatchNormFunction::forward`] for the backward pass.
///
/// `mean` and `invstd` are the global statistics. Consumed by backward.
#[derive(Debug)]
pub struct SyncBatchNormContext<B: Backend> {
    input: Tensor<B>,
    weight: Option<Tensor<B>>,
    mean: Tensor<B>,
    invstd: Tensor<B>,
    world_size: usize,
}

/// Forward and backward of synchronized batch normalization over one
/// communicator.
pub struct SyncBatchNormFunction<'a, B: Backend, C: Communicator<B> + ?Sized> {
    comm: &'a C,
    _backend: PhantomData<B>,
}

impl<'a, B: Backend, C: Communicator<B> + ?Sized> SyncBatchNormFunction<'a, B, C> {
    pub fn new(comm: &'a C) -> Self {
        SyncBatchNormFunction {
            comm,
            _backend: PhantomData,
        }
    }

    /// Normalize `input` with global batch statistics.
    ///
    /// Always uses batch statistics. `running`, if given, receives the
    /// global statistics. Weight and bias are checked before any collective
    /// is issued.
    pub fn forward(
        &self,
        input: &Tensor<B>,
        weight: Option<&Tensor<B>>,
        bias: Option<&Tensor<B>>,
        running: Option<&mut RunningStats>,
        eps: f64,
        momentum: Option<f64>,
    ) -> Result<(Tensor<B>, SyncBatchNormContext<B>)> {
        let (_, channels, _) = input.shape().channel_split()?;
        for param in [weight, bias].into_iter().flatten() {
            if param.dims() != [channels] {
                return Err(Error::ShapeMismatch {
                    expected: Shape::from(channels),
                    got: param.shape().clone(),
                });
            }
            check_device(param, self.comm)?;
        }

        let stats = StatisticsSynchronizer::new(self.comm)
            .synchronize_forward(input, running, eps, momentum)?;
        let output = input.batch_norm_elemt(weight, bias, &stats.mean, &stats.invstd)?;

        let ctx = SyncBatchNormContext {
            input: input.clone(),
            weight: weight.cloned(),
            mean: stats.mean,
            invstd: stats.invstd,
            world_size: self.comm.size(),
        };
        Ok((output, ctx))
    }

    /// Gradients for `(input, weight, bias)`; see [`BatchNormGrads::into_slots`]
    /// for the full per-input layout.
    ///
    /// Issues two all-reduces when `needs.input` is set and none otherwise.
    pub fn backward(
        &self,
        ctx: SyncBatchNormContext<B>,
        grad_output: &Tensor<B>,
        needs: NeedsInputGrad,
    ) -> Result<SyncBatchNormGrads<B>> {
        if grad_output.shape() != ctx.input.shape() {
            return Err(Error::ShapeMismatch {
                expected: ctx.input.shape().clone(),
                got: grad_output.shape().clone(),
            });
        }
        check_device(grad_output, self.comm)?;
        let world_size = self.comm.size();
        if world_size != ctx.world_size {
            return Err(Error::msg(format!(
                "sync batch norm backward: communicator has {world_size} workers, forward ran with {}",
                ctx.world_size
            )));
        }

        let reduce = backward_reduce(
            &ctx.input,
            grad_output,
            &ctx.mean,
            &ctx.invstd,
            ctx.weight.as_ref(),
            needs,
        )?;

        let input = if needs.input {
            let (mean_dy, mean_dy_xmu) = take_input_terms(&reduce)?;
            let dy_h = self.comm.all_reduce_async(&mean_dy, MEAN_DY_NAME, ReduceOp::Sum)?;
            let xmu_h = self
                .comm
                .all_reduce_async(&mean_dy_xmu, MEAN_DY_XMU_NAME, ReduceOp::Sum)?;
            let scale = 1.0 / world_size as f64;
            let mean_dy = self.comm.wait(dy_h)?.affine(scale, 0.0)?;
            let mean_dy_xmu = self.comm.wait(xmu_h)?.affine(scale, 0.0)?;
            debug!(
                rank = self.comm.rank(),
                world_size,
                "averaged backward reductions"
            );

            Some(ctx.input.batch_norm_backward_elemt(
                grad_output,
                &ctx.mean,
                &ctx.invstd,
                ctx.weight.as_ref(),
                &mean_dy,
                &mean_dy_xmu,
            )?)
        } else {
            None
        };

        Ok(param_grads(reduce, input, ctx.weight.is_some(), needs))
    }
}
