// BatchNorm — Local (single-device) batch normalization
//
// This is the plain path: statistics come either from the local batch or
// from the running estimates, and nothing is communicated. SyncBatchNorm
// falls back to it when there is only one worker, and in eval mode with
// tracked running statistics.
//
// FORMULA:
//   x_hat = (x - mean) * invstd,      invstd = 1 / sqrt(var + ε)
//   y     = γ * x_hat + β
//
// RUNNING STATISTICS:
//   running_mean = (1 - f) * running_mean + f * mean_batch
//   running_var  = (1 - f) * running_var  + f * var_batch_unbiased
//
//   where f = momentum, or f = 1 / num_batches_tracked when momentum is
//   None (a cumulative moving average). The running variance uses the
//   Bessel-corrected batch variance; normalization uses the biased one.
//
// BACKWARD:
//   dx = (dy - mean(dy) - (x - mean) * invstd² * mean(dy * (x - mean))) * invstd * γ
//
//   When running statistics were used, mean and invstd are constants, so
//   both correction terms vanish and dx = dy * invstd * γ.

use syncbn_core::backend::{Backend, BackwardMask};
use syncbn_core::error::{Error, Result};
use syncbn_core::tensor::{BackwardReduceTensors, Tensor};

use crate::stats::merge_stats;

/// Running mean/variance estimates owned by a normalization module.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningStats {
    /// Running mean, one entry per channel.
    pub mean: Vec<f64>,
    /// Running (unbiased) variance, one entry per channel.
    pub var: Vec<f64>,
    /// Number of training batches seen while tracking.
    pub num_batches_tracked: u64,
}

impl RunningStats {
    /// Fresh statistics: mean 0, variance 1.
    pub fn new(num_features: usize) -> Self {
        RunningStats {
            mean: vec![0.0; num_features],
            var: vec![1.0; num_features],
            num_batches_tracked: 0,
        }
    }

    pub fn num_features(&self) -> usize {
        self.mean.len()
    }

    /// Reset to mean 0, variance 1 and zero tracked batches.
    pub fn reset(&mut self) {
        self.mean.iter_mut().for_each(|m| *m = 0.0);
        self.var.iter_mut().for_each(|v| *v = 1.0);
        self.num_batches_tracked = 0;
    }

    /// Count one more training batch.
    pub fn record_batch(&mut self) {
        self.num_batches_tracked += 1;
    }

    /// Blend weight for the next update: `momentum`, or `1 / batches` for a
    /// cumulative average when momentum is None.
    pub fn averaging_factor(&self, momentum: Option<f64>) -> f64 {
        match momentum {
            Some(m) => m,
            None => 1.0 / self.num_batches_tracked.max(1) as f64,
        }
    }

    /// Blend new batch statistics into the running estimates.
    pub fn update(&mut self, mean: &[f64], unbiased_var: &[f64], momentum: Option<f64>) -> Result<()> {
        let c = self.num_features();
        if mean.len() != c || unbiased_var.len() != c {
            return Err(Error::ChannelMismatch {
                expected: c,
                got: mean.len().max(unbiased_var.len()),
            });
        }
        let f = self.averaging_factor(momentum);
        for ci in 0..c {
            self.mean[ci] = (1.0 - f) * self.mean[ci] + f * mean[ci];
            self.var[ci] = (1.0 - f) * self.var[ci] + f * unbiased_var[ci];
        }
        Ok(())
    }

    /// `(mean, invstd)` tensors for normalizing with the running estimates.
    pub fn to_tensors<B: Backend>(&self, eps: f64, device: &B::Device) -> Result<(Tensor<B>, Tensor<B>)> {
        let c = self.num_features();
        let invstd: Vec<f64> = self.var.iter().map(|v| 1.0 / (v + eps).sqrt()).collect();
        Ok((
            Tensor::from_f64_slice(&self.mean, c, device)?,
            Tensor::from_f64_slice(&invstd, c, device)?,
        ))
    }
}

/// Which gradients the host autograd engine wants from a backward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NeedsInputGrad {
    pub input: bool,
    pub weight: bool,
    pub bias: bool,
}

impl NeedsInputGrad {
    pub fn all() -> Self {
        NeedsInputGrad {
            input: true,
            weight: true,
            bias: true,
        }
    }
}

/// Gradients of a batch-norm call, one per differentiable forward input.
#[derive(Debug, Clone)]
pub struct BatchNormGrads<B: Backend> {
    pub input: Option<Tensor<B>>,
    pub weight: Option<Tensor<B>>,
    pub bias: Option<Tensor<B>>,
}

impl<B: Backend> BatchNormGrads<B> {
    /// Forward inputs of a batch-norm call, in order: input, weight, bias,
    /// running_mean, running_var, eps, momentum.
    pub const NUM_SLOTS: usize = 7;

    /// One gradient slot per forward input. Slots for the running
    /// statistics and the scalar hyperparameters are always `None`.
    pub fn into_slots(self) -> Vec<Option<Tensor<B>>> {
        let mut slots = vec![self.input, self.weight, self.bias];
        slots.resize_with(Self::NUM_SLOTS, || None);
        slots
    }
}

/// Saved state of a local batch-norm call, consumed by [`LocalBatchNormContext::backward`].
#[derive(Debug)]
pub struct LocalBatchNormContext<B: Backend> {
    input: Tensor<B>,
    weight: Option<Tensor<B>>,
    mean: Tensor<B>,
    invstd: Tensor<B>,
    batch_stats: bool,
}

impl<B: Backend> LocalBatchNormContext<B> {
    /// Whether the forward pass normalized with batch statistics.
    pub fn used_batch_stats(&self) -> bool {
        self.batch_stats
    }

    /// Local backward pass. Never communicates.
    pub fn backward(self, grad_output: &Tensor<B>, needs: NeedsInputGrad) -> Result<BatchNormGrads<B>> {
        let reduce = backward_reduce(
            &self.input,
            grad_output,
            &self.mean,
            &self.invstd,
            self.weight.as_ref(),
            needs,
        )?;

        let input = if needs.input {
            let (mean_dy, mean_dy_xmu) = if self.batch_stats {
                take_input_terms(&reduce)?
            } else {
                let c = self.mean.elem_count();
                let zeros = Tensor::zeros(c, self.input.device())?;
                (zeros.clone(), zeros)
            };
            Some(self.input.batch_norm_backward_elemt(
                grad_output,
                &self.mean,
                &self.invstd,
                self.weight.as_ref(),
                &mean_dy,
                &mean_dy_xmu,
            )?)
        } else {
            None
        };

        Ok(param_grads(reduce, input, self.weight.is_some(), needs))
    }
}

/// Plain batch normalization on one device.
///
/// - `use_batch_stats = true`: normalize with the statistics of `input`
///   (at least 2 samples per channel) and, if `running` is given, blend them
///   into it.
/// - `use_batch_stats = false`: normalize with `running`, which must be given
///   and is left unchanged.
pub fn batch_norm<B: Backend>(
    input: &Tensor<B>,
    running: Option<&mut RunningStats>,
    weight: Option<&Tensor<B>>,
    bias: Option<&Tensor<B>>,
    use_batch_stats: bool,
    momentum: Option<f64>,
    eps: f64,
) -> Result<(Tensor<B>, LocalBatchNormContext<B>)> {
    let (_, c, _) = input.shape().channel_split()?;

    let (mean, invstd) = if use_batch_stats {
        let count = input.shape().per_channel_count()?;
        if count <= 1 {
            return Err(Error::InsufficientSamples { size: count });
        }
        let (mean, invstd) = input.batch_norm_stats(eps)?;
        if let Some(running) = running {
            let merged = merge_stats(
                &[count as f64],
                &mean.to_f64_vec()?,
                &invstd.to_f64_vec()?,
                c,
                eps,
            )?;
            running.update(&merged.mean, &merged.unbiased_var, momentum)?;
        }
        (mean, invstd)
    } else {
        let running = running.ok_or_else(|| {
            Error::msg("batch_norm: running statistics are required when not using batch statistics")
        })?;
        if running.num_features() != c {
            return Err(Error::ChannelMismatch {
                expected: running.num_features(),
                got: c,
            });
        }
        running.to_tensors(eps, input.device())?
    };

    let output = input.batch_norm_elemt(weight, bias, &mean, &invstd)?;
    let ctx = LocalBatchNormContext {
        input: input.clone(),
        weight: weight.cloned(),
        mean,
        invstd,
        batch_stats: use_batch_stats,
    };
    Ok((output, ctx))
}

// Shared between the local and the synchronized backward passes.

pub(crate) fn backward_reduce<B: Backend>(
    input: &Tensor<B>,
    grad_output: &Tensor<B>,
    mean: &Tensor<B>,
    invstd: &Tensor<B>,
    weight: Option<&Tensor<B>>,
    needs: NeedsInputGrad,
) -> Result<BackwardReduceTensors<B>> {
    let has_weight = weight.is_some();
    let mask = BackwardMask {
        input: needs.input,
        weight: needs.weight && has_weight,
        bias: needs.bias && has_weight,
    };
    input.batch_norm_backward_reduce(grad_output, mean, invstd, weight, mask)
}

pub(crate) fn take_input_terms<B: Backend>(
    reduce: &BackwardReduceTensors<B>,
) -> Result<(Tensor<B>, Tensor<B>)> {
    match (&reduce.mean_dy, &reduce.mean_dy_xmu) {
        (Some(a), Some(b)) => Ok((a.clone(), b.clone())),
        _ => Err(Error::msg(
            "batch_norm_backward_reduce did not produce mean_dy / mean_dy_xmu",
        )),
    }
}

/// Parameter gradients are only reported when requested and when the
/// forward call actually had affine parameters.
pub(crate) fn param_grads<B: Backend>(
    reduce: BackwardReduceTensors<B>,
    input: Option<Tensor<B>>,
    has_weight: bool,
    needs: NeedsInputGrad,
) -> BatchNormGrads<B> {
    BatchNormGrads {
        input,
        weight: reduce.grad_weight.filter(|_| has_weight && needs.weight),
        bias: reduce.grad_bias.filter(|_| has_weight && needs.bias),
    }
}
