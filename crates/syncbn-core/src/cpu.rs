// CpuBackend — Host-memory reference backend
//
// Stores every tensor as a contiguous Vec<f64>. Per-channel kernels are
// parallelized across channels with rayon: each channel's reduction is
// independent, so channels map naturally onto rayon's work-stealing pool.
//
// DEVICES:
//
//   CpuDevice carries an ordinal. All ordinals share host memory, but they
//   compare unequal, which lets a data-parallel simulation give every worker
//   its own "device" and exercise device checks.
//
// NUMERICS:
//
//   batch_norm_stats uses Welford's single-pass update per channel, so the
//   variance stays accurate for inputs with a large mean.

use rayon::prelude::*;

use crate::backend::{Backend, BackendDevice, BackendStorage, BackwardMask, BackwardReduce};
use crate::error::{Error, Result};
use crate::shape::Shape;

/// A host CPU device, identified by an ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuDevice(pub usize);

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        format!("cpu:{}", self.0)
    }
}

/// Contiguous host buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuStorage(pub Vec<f64>);

impl BackendStorage for CpuStorage {
    fn len(&self) -> usize {
        self.0.len()
    }
}

/// The CPU backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

/// Convenience alias.
pub type CpuTensor = crate::tensor::Tensor<CpuBackend>;

/// Visit every element of channel `ch` in an `[outer, C, inner]` buffer.
#[inline]
fn for_channel(outer: usize, c: usize, inner: usize, ch: usize, mut f: impl FnMut(usize)) {
    for n in 0..outer {
        let base = (n * c + ch) * inner;
        for i in base..base + inner {
            f(i);
        }
    }
}

/// Map per-channel `(sum_dy, sum_dy_xmu)` pairs to a `[C]` buffer.
fn per_channel(sums: &[(f64, f64)], f: impl Fn(usize, f64, f64) -> f64) -> CpuStorage {
    CpuStorage(
        sums.iter()
            .enumerate()
            .map(|(ch, &(s, sx))| f(ch, s, sx))
            .collect(),
    )
}

fn check_len(what: &str, s: &CpuStorage, expected: usize) -> Result<()> {
    if s.0.len() != expected {
        return Err(Error::msg(format!(
            "{what}: expected {expected} elements, got {}",
            s.0.len()
        )));
    }
    Ok(())
}

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn full(shape: &Shape, val: f64, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage(vec![val; shape.elem_count()]))
    }

    fn from_f64_slice(data: &[f64], _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage(data.to_vec()))
    }

    fn to_f64_vec(input: &CpuStorage) -> Result<Vec<f64>> {
        Ok(input.0.clone())
    }

    fn affine(input: &CpuStorage, mul: f64, add: f64) -> Result<CpuStorage> {
        Ok(CpuStorage(input.0.iter().map(|&x| x * mul + add).collect()))
    }

    fn batch_norm_stats(input: &CpuStorage, shape: &Shape, eps: f64) -> Result<(CpuStorage, CpuStorage)> {
        let (outer, c, inner) = shape.channel_split()?;
        check_len("batch_norm_stats input", input, shape.elem_count())?;
        let x = &input.0;

        let (mean, invstd): (Vec<f64>, Vec<f64>) = (0..c)
            .into_par_iter()
            .map(|ch| {
                let mut count = 0.0f64;
                let mut mean = 0.0f64;
                let mut m2 = 0.0f64;
                for_channel(outer, c, inner, ch, |i| {
                    count += 1.0;
                    let delta = x[i] - mean;
                    mean += delta / count;
                    m2 += delta * (x[i] - mean);
                });
                let var = if count > 0.0 { m2 / count } else { 0.0 };
                (mean, 1.0 / (var + eps).sqrt())
            })
            .unzip();

        Ok((CpuStorage(mean), CpuStorage(invstd)))
    }

    fn batch_norm_elemt(
        input: &CpuStorage,
        shape: &Shape,
        weight: Option<&CpuStorage>,
        bias: Option<&CpuStorage>,
        mean: &CpuStorage,
        invstd: &CpuStorage,
    ) -> Result<CpuStorage> {
        let (_, c, inner) = shape.channel_split()?;
        check_len("batch_norm_elemt input", input, shape.elem_count())?;
        if inner == 0 {
            return Ok(CpuStorage(Vec::new()));
        }

        let mut out = vec![0.0f64; input.0.len()];
        out.par_chunks_mut(inner)
            .zip(input.0.par_chunks(inner))
            .enumerate()
            .for_each(|(row, (o, x))| {
                let ch = row % c;
                let w = weight.map_or(1.0, |w| w.0[ch]);
                let b = bias.map_or(0.0, |b| b.0[ch]);
                let (m, s) = (mean.0[ch], invstd.0[ch]);
                for (o, &x) in o.iter_mut().zip(x) {
                    *o = (x - m) * s * w + b;
                }
            });
        Ok(CpuStorage(out))
    }

    fn batch_norm_backward_reduce(
        grad_output: &CpuStorage,
        input: &CpuStorage,
        shape: &Shape,
        mean: &CpuStorage,
        invstd: &CpuStorage,
        weight: Option<&CpuStorage>,
        mask: BackwardMask,
    ) -> Result<BackwardReduce<CpuStorage>> {
        let (outer, c, inner) = shape.channel_split()?;
        check_len("batch_norm_backward_reduce input", input, shape.elem_count())?;
        check_len("batch_norm_backward_reduce grad_output", grad_output, shape.elem_count())?;
        let (x, dy) = (&input.0, &grad_output.0);
        let count = (outer * inner) as f64;

        // (sum_dy, sum_dy_xmu) per channel
        let sums: Vec<(f64, f64)> = (0..c)
            .into_par_iter()
            .map(|ch| {
                let m = mean.0[ch];
                let mut sum_dy = 0.0f64;
                let mut sum_dy_xmu = 0.0f64;
                for_channel(outer, c, inner, ch, |i| {
                    sum_dy += dy[i];
                    sum_dy_xmu += dy[i] * (x[i] - m);
                });
                (sum_dy, sum_dy_xmu)
            })
            .collect();

        let (mean_dy, mean_dy_xmu) = if mask.input {
            (
                Some(per_channel(&sums, |_, s, _| s / count)),
                Some(per_channel(&sums, |_, _, sx| sx / count)),
            )
        } else {
            (None, None)
        };
        let grad_weight = (mask.weight && weight.is_some())
            .then(|| per_channel(&sums, |ch, _, sx| sx * invstd.0[ch]));
        let grad_bias = (mask.bias && weight.is_some()).then(|| per_channel(&sums, |_, s, _| s));

        Ok(BackwardReduce {
            mean_dy,
            mean_dy_xmu,
            grad_weight,
            grad_bias,
        })
    }

    fn batch_norm_backward_elemt(
        grad_output: &CpuStorage,
        input: &CpuStorage,
        shape: &Shape,
        mean: &CpuStorage,
        invstd: &CpuStorage,
        weight: Option<&CpuStorage>,
        mean_dy: &CpuStorage,
        mean_dy_xmu: &CpuStorage,
    ) -> Result<CpuStorage> {
        let (_, c, inner) = shape.channel_split()?;
        check_len("batch_norm_backward_elemt input", input, shape.elem_count())?;
        check_len("batch_norm_backward_elemt grad_output", grad_output, shape.elem_count())?;
        if inner == 0 {
            return Ok(CpuStorage(Vec::new()));
        }

        let mut out = vec![0.0f64; input.0.len()];
        out.par_chunks_mut(inner)
            .zip(input.0.par_chunks(inner))
            .zip(grad_output.0.par_chunks(inner))
            .enumerate()
            .for_each(|(row, ((o, x), dy))| {
                let ch = row % c;
                let w = weight.map_or(1.0, |w| w.0[ch]);
                let (m, s) = (mean.0[ch], invstd.0[ch]);
                let (mdy, mdyx) = (mean_dy.0[ch], mean_dy_xmu.0[ch]);
                let proj = s * s * mdyx;
                for ((o, &x), &dy) in o.iter_mut().zip(x).zip(dy) {
                    *o = (dy - mdy - (x - m) * proj) * s * w;
                }
            });
        Ok(CpuStorage(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    const DEV: CpuDevice = CpuDevice(0);

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_stats_per_channel() {
        // [N=2, C=2, 2]: channel 0 = {1,2,5,6}, channel 1 = {3,4,7,8}
        let x = Tensor::<CpuBackend>::from_f64_slice(
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            (2, 2, 2),
            &DEV,
        )
        .unwrap();
        let (mean, invstd) = x.batch_norm_stats(0.0).unwrap();
        let m = mean.to_f64_vec().unwrap();
        assert!(approx(m[0], 3.5) && approx(m[1], 5.5));
        // population var of {1,2,5,6} = 4.25
        let inv = invstd.to_f64_vec().unwrap();
        assert!(approx(inv[0], 1.0 / 4.25f64.sqrt()));
        assert!(approx(inv[1], 1.0 / 4.25f64.sqrt()));
    }

    #[test]
    fn test_elemt_affine() {
        let x = Tensor::<CpuBackend>::from_f64_slice(&[1.0, 3.0], (2, 1), &DEV).unwrap();
        let mean = Tensor::from_f64_slice(&[2.0], 1, &DEV).unwrap();
        let invstd = Tensor::from_f64_slice(&[1.0], 1, &DEV).unwrap();
        let w = Tensor::from_f64_slice(&[2.0], 1, &DEV).unwrap();
        let b = Tensor::from_f64_slice(&[0.5], 1, &DEV).unwrap();
        let y = x.batch_norm_elemt(Some(&w), Some(&b), &mean, &invstd).unwrap();
        assert_eq!(y.to_f64_vec().unwrap(), vec![-1.5, 2.5]);
    }

    #[test]
    fn test_backward_reduce_mask() {
        let x = Tensor::<CpuBackend>::from_f64_slice(&[1.0, 2.0, 3.0], (3, 1), &DEV).unwrap();
        let dy = Tensor::from_f64_slice(&[1.0, 1.0, 4.0], (3, 1), &DEV).unwrap();
        let (mean, invstd) = x.batch_norm_stats(1e-5).unwrap();

        let r = x
            .batch_norm_backward_reduce(&dy, &mean, &invstd, None, BackwardMask::all())
            .unwrap();
        assert!(approx(r.mean_dy.unwrap().to_f64_vec().unwrap()[0], 2.0));
        // dy * (x - 2) = -1 + 0 + 4 = 3, mean = 1
        assert!(approx(r.mean_dy_xmu.unwrap().to_f64_vec().unwrap()[0], 1.0));
        // no weight: no parameter grads
        assert!(r.grad_weight.is_none());
        assert!(r.grad_bias.is_none());

        let w = Tensor::from_f64_slice(&[1.0], 1, &DEV).unwrap();
        let mask = BackwardMask {
            input: false,
            weight: true,
            bias: true,
        };
        let r = x
            .batch_norm_backward_reduce(&dy, &mean, &invstd, Some(&w), mask)
            .unwrap();
        assert!(r.mean_dy.is_none());
        assert!(r.mean_dy_xmu.is_none());
        assert!(approx(r.grad_bias.unwrap().to_f64_vec().unwrap()[0], 6.0));
        let inv = invstd.to_f64_vec().unwrap()[0];
        assert!(approx(r.grad_weight.unwrap().to_f64_vec().unwrap()[0], 3.0 * inv));
    }

    #[test]
    fn test_backward_elemt_matches_finite_difference() {
        // loss = sum(y * g) with y = batch_norm(x); compare dL/dx to a
        // central finite difference.
        let data = [0.3, -1.2, 2.5, 0.7, 1.1, -0.4];
        let g = [0.5, -1.0, 0.25, 2.0, -0.3, 1.5];
        let eps = 1e-5;
        let loss = |xs: &[f64]| -> f64 {
            let x = Tensor::<CpuBackend>::from_f64_slice(xs, (3, 2), &DEV).unwrap();
            let (m, s) = x.batch_norm_stats(eps).unwrap();
            let y = x.batch_norm_elemt(None, None, &m, &s).unwrap();
            y.to_f64_vec().unwrap().iter().zip(&g).map(|(a, b)| a * b).sum()
        };

        let x = Tensor::<CpuBackend>::from_f64_slice(&data, (3, 2), &DEV).unwrap();
        let dy = Tensor::from_f64_slice(&g, (3, 2), &DEV).unwrap();
        let (m, s) = x.batch_norm_stats(eps).unwrap();
        let r = x
            .batch_norm_backward_reduce(&dy, &m, &s, None, BackwardMask::all())
            .unwrap();
        let dx = x
            .batch_norm_backward_elemt(
                &dy,
                &m,
                &s,
                None,
                r.mean_dy.as_ref().unwrap(),
                r.mean_dy_xmu.as_ref().unwrap(),
            )
            .unwrap()
            .to_f64_vec()
            .unwrap();

        let h = 1e-6;
        for i in 0..data.len() {
            let mut plus = data;
            let mut minus = data;
            plus[i] += h;
            minus[i] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            assert!(
                (numeric - dx[i]).abs() < 1e-4,
                "index {i}: analytic {} numeric {numeric}",
                dx[i]
            );
        }
    }

    #[test]
    fn test_shape_checks() {
        let x = Tensor::<CpuBackend>::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), &DEV).unwrap();
        let bad = Tensor::from_f64_slice(&[0.0; 3], 3, &DEV).unwrap();
        let ok = Tensor::from_f64_slice(&[0.0; 2], 2, &DEV).unwrap();
        assert!(x.batch_norm_elemt(None, None, &bad, &ok).is_err());
    }
}
