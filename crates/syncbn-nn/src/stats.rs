// Statistics synchronization — Global batch statistics from per-worker shards
//
// Each worker holds a shard of the global batch. To normalize as if the whole
// batch lived on one device, the workers exchange their local statistics and
// merge them:
//
//   1. count_w          = numel(x_w) / C
//   2. (mean_w, invstd_w) = batch_norm_stats(x_w, ε)
//   3. all-gather count, mean and invstd under fixed names
//   4. merge the W per-worker statistics into one (mean, var) per channel
//
// MERGE (parallel Welford / Chan et al.):
//
//   var_w  = 1 / invstd_w² - ε
//   n      = n_a + n_b
//   δ      = mean_b - mean_a
//   mean   = mean_a + δ * n_b / n
//   M2     = M2_a + M2_b + δ² * n_a * n_b / n          (M2_w = var_w * n_w)
//
//   var (biased)   = M2 / n       → used for normalization
//   var (unbiased) = M2 / (n - 1) → blended into running_var
//
// Shards may have different sizes; the merge weights every worker by its
// own count.

use std::marker::PhantomData;

use tracing::debug;

use syncbn_core::backend::{Backend, BackendDevice};
use syncbn_core::bail;
use syncbn_core::collective::Communicator;
use syncbn_core::error::{Error, Result};
use syncbn_core::tensor::Tensor;

use crate::batchnorm::RunningStats;

/// Collective name for the per-worker sample counts.
pub const COUNT_NAME: &str = "sync_batch_norm.count";
/// Collective name for the per-worker means.
pub const MEAN_NAME: &str = "sync_batch_norm.mean";
/// Collective name for the per-worker inverse standard deviations.
pub const INVSTD_NAME: &str = "sync_batch_norm.invstd";

/// Global per-channel statistics merged from every worker.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedStats {
    pub mean: Vec<f64>,
    /// Population (biased) variance.
    pub var: Vec<f64>,
    /// Bessel-corrected variance.
    pub unbiased_var: Vec<f64>,
    /// `1 / sqrt(var + ε)`.
    pub invstd: Vec<f64>,
    /// Total samples per channel over all workers.
    pub total_count: f64,
}

/// Merge per-worker statistics.
///
/// `counts` has one entry per worker; `means` and `invstds` are row-major
/// `[W, C]` with `C = channels`.
pub fn merge_stats(
    counts: &[f64],
    means: &[f64],
    invstds: &[f64],
    channels: usize,
    eps: f64,
) -> Result<MergedStats> {
    let workers = counts.len();
    if workers == 0 {
        bail!("merge_stats: no worker statistics to merge");
    }
    for (name, len) in [("means", means.len()), ("invstds", invstds.len())] {
        if len != workers * channels {
            bail!("merge_stats: {name} has {len} entries, expected {workers} x {channels}");
        }
    }
    if let Some(&n) = counts.iter().find(|&&n| n <= 1.0) {
        return Err(Error::InsufficientSamples { size: n as usize });
    }

    let total_count: f64 = counts.iter().sum();
    let mut out = MergedStats {
        mean: Vec::with_capacity(channels),
        var: Vec::with_capacity(channels),
        unbiased_var: Vec::with_capacity(channels),
        invstd: Vec::with_capacity(channels),
        total_count,
    };

    for c in 0..channels {
        let mut n = 0.0;
        let mut mean = 0.0;
        let mut m2 = 0.0;
        for (w, &n_w) in counts.iter().enumerate() {
            let mean_w = means[w * channels + c];
            let invstd_w = invstds[w * channels + c];
            let var_w = 1.0 / (invstd_w * invstd_w) - eps;

            let total = n + n_w;
            let delta = mean_w - mean;
            mean += delta * n_w / total;
            m2 += var_w * n_w + delta * delta * n * n_w / total;
            n = total;
        }
        let var = m2 / n;
        out.mean.push(mean);
        out.var.push(var);
        out.unbiased_var.push(m2 / (n - 1.0));
        out.invstd.push(1.0 / (var + eps).sqrt());
    }
    Ok(out)
}

/// One worker's batch statistics.
#[derive(Debug, Clone)]
pub struct LocalStats<B: Backend> {
    /// Samples per channel in this shard.
    pub count: usize,
    pub mean: Tensor<B>,
    pub invstd: Tensor<B>,
}

impl<B: Backend> LocalStats<B> {
    /// Per-channel statistics of an `[N, C, *]` shard. Needs at least two
    /// samples per channel.
    pub fn compute(input: &Tensor<B>, eps: f64) -> Result<Self> {
        let count = input.shape().per_channel_count()?;
        if count <= 1 {
            return Err(Error::InsufficientSamples { size: count });
        }
        let (mean, invstd) = input.batch_norm_stats(eps)?;
        Ok(LocalStats { count, mean, invstd })
    }
}

/// Global statistics as `[C]` tensors on the input's device.
#[derive(Debug, Clone)]
pub struct GlobalStats<B: Backend> {
    pub mean: Tensor<B>,
    pub invstd: Tensor<B>,
    pub total_count: usize,
}

/// Computes global batch statistics across the workers of a communicator.
///
/// Holds no state of its own; every call issues exactly three all-gathers
/// named [`COUNT_NAME`], [`MEAN_NAME`] and [`INVSTD_NAME`], in that order.
pub struct StatisticsSynchronizer<'a, B: Backend, C: Communicator<B> + ?Sized> {
    comm: &'a C,
    _backend: PhantomData<B>,
}

impl<'a, B: Backend, C: Communicator<B> + ?Sized> StatisticsSynchronizer<'a, B, C> {
    pub fn new(comm: &'a C) -> Self {
        StatisticsSynchronizer {
            comm,
            _backend: PhantomData,
        }
    }

    /// Compute global `(mean, invstd)` for `input` and, if `running` is
    /// given, blend the global statistics into it.
    ///
    /// All validation happens before the first collective is issued.
    pub fn synchronize_forward(
        &self,
        input: &Tensor<B>,
        running: Option<&mut RunningStats>,
        eps: f64,
        momentum: Option<f64>,
    ) -> Result<GlobalStats<B>> {
        let (_, channels, _) = input.shape().channel_split()?;
        check_device(input, self.comm)?;
        if let Some(rs) = running.as_deref() {
            if rs.num_features() != channels {
                return Err(Error::ChannelMismatch {
                    expected: rs.num_features(),
                    got: channels,
                });
            }
        }
        let LocalStats { count, mean, invstd } = LocalStats::compute(input, eps)?;

        let device = input.device();
        let count_t = Tensor::full((1, 1), count as f64, device)?;

        let count_h = self.comm.all_gather_async(&count_t, COUNT_NAME)?;
        let mean_h = self.comm.all_gather_async(&mean.unsqueeze0()?, MEAN_NAME)?;
        let invstd_h = self.comm.all_gather_async(&invstd.unsqueeze0()?, INVSTD_NAME)?;

        let count_all = self.comm.wait(count_h)?;
        let mean_all = self.comm.wait(mean_h)?;
        let invstd_all = self.comm.wait(invstd_h)?;

        let workers = count_all.dims().first().copied().unwrap_or(0);
        for (name, t, cols) in [
            (COUNT_NAME, &count_all, 1),
            (MEAN_NAME, &mean_all, channels),
            (INVSTD_NAME, &invstd_all, channels),
        ] {
            if t.dims() != [workers, cols] {
                return Err(Error::transport(
                    name,
                    format!("gathered shape {} does not match [{workers}, {cols}]", t.shape()),
                ));
            }
        }

        let merged = merge_stats(
            &count_all.to_f64_vec()?,
            &mean_all.to_f64_vec()?,
            &invstd_all.to_f64_vec()?,
            channels,
            eps,
        )?;
        debug!(
            rank = self.comm.rank(),
            workers,
            local_count = count,
            total_count = merged.total_count,
            channels,
            "synchronized batch statistics"
        );

        if let Some(rs) = running {
            rs.update(&merged.mean, &merged.unbiased_var, momentum)?;
        }

        Ok(GlobalStats {
            mean: Tensor::from_f64_slice(&merged.mean, channels, device)?,
            invstd: Tensor::from_f64_slice(&merged.invstd, channels, device)?,
            total_count: merged.total_count as usize,
        })
    }
}

/// The input must live on the device the communicator runs collectives on.
pub(crate) fn check_device<B: Backend, C: Communicator<B> + ?Sized>(
    input: &Tensor<B>,
    comm: &C,
) -> Result<()> {
    if input.device() != comm.device() {
        return Err(Error::NotOnExpectedDevice {
            expected: comm.device().name(),
            got: input.device().name(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use syncbn_core::{CpuBackend, CpuDevice, SingleWorker};

    fn pop_stats(xs: &[f64]) -> (f64, f64) {
        let n = xs.len() as f64;
        let mean = xs.iter().sum::<f64>() / n;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        (mean, var)
    }

    fn shard_stats(xs: &[f64], eps: f64) -> (f64, f64, f64) {
        let (m, v) = pop_stats(xs);
        (xs.len() as f64, m, 1.0 / (v + eps).sqrt())
    }

    #[test]
    fn test_merge_two_shards() {
        let eps = 1e-5;
        let (n1, m1, i1) = shard_stats(&[1.0, 2.0, 3.0], eps);
        let (n2, m2, i2) = shard_stats(&[4.0, 5.0], eps);
        let merged = merge_stats(&[n1, n2], &[m1, m2], &[i1, i2], 1, eps).unwrap();
        assert_eq!(merged.total_count, 5.0);
        assert!((merged.mean[0] - 3.0).abs() < 1e-9);
        assert!((merged.var[0] - 2.0).abs() < 1e-9);
        assert!((merged.unbiased_var[0] - 2.5).abs() < 1e-9);
        assert!((merged.invstd[0] - 1.0 / (2.0 + eps).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_merge_rejects_single_sample_worker() {
        let err = merge_stats(&[3.0, 1.0], &[0.0, 0.0], &[1.0, 1.0], 1, 1e-5).unwrap_err();
        assert!(matches!(err, Error::InsufficientSamples { size: 1 }));
    }

    #[test]
    fn test_merge_rejects_bad_lengths() {
        assert!(merge_stats(&[2.0, 2.0], &[0.0], &[1.0, 1.0], 1, 1e-5).is_err());
        assert!(merge_stats(&[], &[], &[], 1, 1e-5).is_err());
    }

    #[test]
    fn test_merge_random_shards_match_pooled() {
        let mut rng = StdRng::seed_from_u64(7);
        let eps = 1e-5;
        let channels = 3;
        let shards: Vec<Vec<Vec<f64>>> = (0..4)
            .map(|_| {
                let n = rng.gen_range(2..9);
                (0..channels)
                    .map(|_| (0..n).map(|_| rng.gen_range(-5.0..5.0)).collect())
                    .collect()
            })
            .collect();

        let mut counts = Vec::new();
        let mut means = Vec::new();
        let mut invstds = Vec::new();
        for shard in &shards {
            counts.push(shard[0].len() as f64);
            for ch in shard {
                let (_, m, i) = shard_stats(ch, eps);
                means.push(m);
                invstds.push(i);
            }
        }
        let merged = merge_stats(&counts, &means, &invstds, channels, eps).unwrap();

        for c in 0..channels {
            let pooled: Vec<f64> = shards.iter().flat_map(|s| s[c].iter().copied()).collect();
            let (m, v) = pop_stats(&pooled);
            assert!((merged.mean[c] - m).abs() < 1e-9);
            assert!((merged.var[c] - v).abs() < 1e-7);
        }
    }

    #[test]
    fn test_synchronizer_single_worker_matches_local() {
        let dev = CpuDevice(0);
        let comm = SingleWorker::<CpuBackend>::new(dev);
        let x = Tensor::<CpuBackend>::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (4, 1), &dev).unwrap();
        let mut rs = RunningStats::new(1);
        let stats = StatisticsSynchronizer::new(&comm)
            .synchronize_forward(&x, Some(&mut rs), 1e-5, Some(0.5))
            .unwrap();
        let (mean, invstd) = x.batch_norm_stats(1e-5).unwrap();
        assert_eq!(stats.total_count, 4);
        assert!((stats.mean.to_f64_vec().unwrap()[0] - mean.to_f64_vec().unwrap()[0]).abs() < 1e-12);
        assert!((stats.invstd.to_f64_vec().unwrap()[0] - invstd.to_f64_vec().unwrap()[0]).abs() < 1e-9);
        // unbiased var of {1,2,3,4} = 5/3
        assert!((rs.mean[0] - 1.25).abs() < 1e-12);
        assert!((rs.var[0] - (0.5 + 0.5 * 5.0 / 3.0)).abs() < 1e-6);
    }

    #[test]
    fn test_synchronizer_rejects_wrong_device() {
        let comm = SingleWorker::<CpuBackend>::new(CpuDevice(1));
        let x = Tensor::<CpuBackend>::zeros((4, 1), &CpuDevice(0)).unwrap();
        let err = StatisticsSynchronizer::new(&comm)
            .synchronize_forward(&x, None, 1e-5, Some(0.1))
            .unwrap_err();
        assert!(matches!(err, Error::NotOnExpectedDevice { .. }));
    }

    #[test]
    fn test_synchronizer_rejects_1d() {
        let dev = CpuDevice(0);
        let comm = SingleWorker::<CpuBackend>::new(dev);
        let x = Tensor::<CpuBackend>::zeros(4, &dev).unwrap();
        let err = StatisticsSynchronizer::new(&comm)
            .synchronize_forward(&x, None, 1e-5, Some(0.1))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInputRank { got: 1 }));
    }

    proptest! {
        #[test]
        fn prop_merge_is_order_independent(
            a in proptest::collection::vec(-100.0f64..100.0, 2..12),
            b in proptest::collection::vec(-100.0f64..100.0, 2..12),
        ) {
            let eps = 1e-3;
            let (na, ma, ia) = shard_stats(&a, eps);
            let (nb, mb, ib) = shard_stats(&b, eps);
            let ab = merge_stats(&[na, nb], &[ma, mb], &[ia, ib], 1, eps).unwrap();
            let ba = merge_stats(&[nb, na], &[mb, ma], &[ib, ia], 1, eps).unwrap();
            prop_assert!((ab.mean[0] - ba.mean[0]).abs() < 1e-8);
            prop_assert!((ab.var[0] - ba.var[0]).abs() < 1e-6 * (1.0 + ab.var[0]));
        }

        #[test]
        fn prop_merged_variance_is_non_negative(
            xs in proptest::collection::vec(-50.0f64..50.0, 4..20),
            split in 2usize..18,
        ) {
            let eps = 1e-5;
            let (left, right) = xs.split_at(split.min(xs.len() - 2));
            let (n1, m1, i1) = shard_stats(left, eps);
            let (n2, m2, i2) = shard_stats(right, eps);
            let merged = merge_stats(&[n1, n2], &[m1, m2], &[i1, i2], 1, eps).unwrap();
            prop_assert!(merged.var[0] > -1e-6);
            prop_assert!(merged.unbiased_var[0] >= merged.var[0] - 1e-9);
        }
    }
}
