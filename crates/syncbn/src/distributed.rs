// Distributed — In-process worker groups for collective communication
//
// ThreadGroup is a complete Communicator whose workers are threads of one
// process. It is what the tests and single-node runs use, and it doubles as
// the executable description of the contract any real transport must meet.
//
// COMPONENTS:
//
//   ThreadGroup<B>  — One handle per rank. Collectives are matched across
//                     ranks by (name, per-name sequence number) and complete
//                     when every rank has contributed.
//
//   run_workers()   — Spawns one scoped thread per rank, hands each its
//                     ThreadGroup, and collects the per-rank results.
//
// MATCHING:
//
//   Rank r's k-th operation named "foo" meets every other rank's k-th
//   operation named "foo". The first arrival creates a pending slot; the
//   last arrival computes the result and fulfils every rank's handle. If
//   the ranks disagree on the kind of operation, or contribute tensors
//   whose shapes cannot be combined, every rank receives a
//   TransportFailure for that operation.
//
// RESULTS:
//
//   all-gather  — concatenation along dim 0 in rank order; leading sizes may
//                 differ, trailing dims must agree
//   all-reduce  — element-wise Sum / Average / Min / Max; shapes must agree

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{trace, warn};

use syncbn_core::backend::Backend;
use syncbn_core::collective::{CollectiveHandle, CollectiveKind, Communicator, Completion, ReduceOp};
use syncbn_core::error::{Error, Result};
use syncbn_core::shape::Shape;
use syncbn_core::tensor::Tensor;

type OpKey = (String, u64);

/// One rank's contribution to a pending operation.
struct Contribution<B: Backend> {
    data: Vec<f64>,
    shape: Shape,
    device: B::Device,
    completion: Completion<B>,
}

struct PendingOp<B: Backend> {
    kind: CollectiveKind,
    contributions: Vec<Option<Contribution<B>>>,
    arrived: usize,
    /// First disagreement seen while ranks were arriving.
    mismatch: Option<String>,
}

struct GroupState<B: Backend> {
    pending: HashMap<OpKey, PendingOp<B>>,
}

struct Shared<B: Backend> {
    size: usize,
    state: Mutex<GroupState<B>>,
}

/// Per-rank bookkeeping: sequence counters and the issue history.
#[derive(Default)]
struct RankLog {
    seq: HashMap<String, u64>,
    history: Vec<(CollectiveKind, String)>,
}

/// One rank's handle to an in-process worker group.
///
/// # Example
/// ```ignore
/// let ranks = ThreadGroup::<CpuBackend>::new(4, CpuDevice(0))?;
/// // move one ThreadGroup into each worker thread
/// ```
pub struct ThreadGroup<B: Backend> {
    rank: usize,
    device: B::Device,
    shared: Arc<Shared<B>>,
    log: Mutex<RankLog>,
}

impl<B: Backend> std::fmt::Debug for ThreadGroup<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .field("device", &self.device)
            .finish()
    }
}

impl<B: Backend> ThreadGroup<B> {
    /// Create a group of `size` ranks, all on `device`. Element `r` of the
    /// result is rank `r`.
    pub fn new(size: usize, device: B::Device) -> Result<Vec<Self>> {
        if size == 0 {
            return Err(Error::msg("ThreadGroup: size must be at least 1"));
        }
        let shared = Arc::new(Shared {
            size,
            state: Mutex::new(GroupState {
                pending: HashMap::new(),
            }),
        });
        Ok((0..size)
            .map(|rank| ThreadGroup {
                rank,
                device: device.clone(),
                shared: Arc::clone(&shared),
                log: Mutex::new(RankLog::default()),
            })
            .collect())
    }

    /// Collectives issued by this rank so far, in issue order.
    pub fn history(&self) -> Vec<(CollectiveKind, String)> {
        self.log
            .lock()
            .map(|log| log.history.clone())
            .unwrap_or_default()
    }

    /// Number of collectives issued by this rank so far.
    pub fn issued_ops(&self) -> usize {
        self.log.lock().map(|log| log.history.len()).unwrap_or(0)
    }

    fn state(&self, name: &str) -> Result<MutexGuard<'_, GroupState<B>>> {
        self.shared
            .state
            .lock()
            .map_err(|_| Error::transport(name, "group state poisoned by a panicked worker"))
    }

    fn next_seq(&self, kind: CollectiveKind, name: &str) -> Result<u64> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| Error::transport(name, "rank log poisoned by a panicked worker"))?;
        let seq = log.seq.entry(name.to_string()).or_insert(0);
        let current = *seq;
        *seq += 1;
        log.history.push((kind, name.to_string()));
        Ok(current)
    }

    fn issue(&self, tensor: &Tensor<B>, name: &str, kind: CollectiveKind) -> Result<CollectiveHandle<B>> {
        let size = self.shared.size;
        // read the tensor first so a failed read leaves this rank's sequence untouched
        let data = tensor.to_f64_vec()?;
        let seq = self.next_seq(kind, name)?;
        let (handle, completion) = CollectiveHandle::pending(name, kind);
        let contribution = Contribution {
            data,
            shape: tensor.shape().clone(),
            device: self.device.clone(),
            completion,
        };

        let key = (name.to_string(), seq);
        let mut state = self.state(name)?;
        let op = state.pending.entry(key.clone()).or_insert_with(|| PendingOp {
            kind,
            contributions: (0..size).map(|_| None).collect(),
            arrived: 0,
            mismatch: None,
        });
        if op.kind != kind && op.mismatch.is_none() {
            let reason = format!("rank {} issued {kind} but a peer issued {}", self.rank, op.kind);
            warn!(name, seq, rank = self.rank, %reason, "mismatched collective");
            op.mismatch = Some(reason);
        }
        op.contributions[self.rank] = Some(contribution);
        op.arrived += 1;

        if op.arrived == size {
            if let Some(op) = state.pending.remove(&key) {
                drop(state);
                complete(name, seq, op);
            }
        }
        Ok(handle)
    }
}

/// Compute the result of a fully-arrived operation and fulfil every rank.
fn complete<B: Backend>(name: &str, seq: u64, op: PendingOp<B>) {
    let contributions: Vec<Contribution<B>> = op.contributions.into_iter().flatten().collect();
    let combined = match op.mismatch {
        Some(reason) => Err(reason),
        None => match op.kind {
            CollectiveKind::AllGather => gather(&contributions),
            CollectiveKind::AllReduce(reduce) => reduce_all(&contributions, reduce),
        },
    };
    if let Err(reason) = &combined {
        warn!(name, seq, %reason, "collective failed");
    } else {
        trace!(name, seq, kind = %op.kind, ranks = contributions.len(), "collective complete");
    }

    for c in contributions {
        let result = match &combined {
            Ok((data, shape)) => Tensor::from_f64_slice(data, shape.clone(), &c.device),
            Err(reason) => Err(Error::transport(name, reason.clone())),
        };
        // A rank that dropped its handle no longer wants the result.
        let _ = c.completion.send(result);
    }
}

fn gather<B: Backend>(contributions: &[Contribution<B>]) -> std::result::Result<(Vec<f64>, Shape), String> {
    let first = contributions.first().ok_or("no contributions")?;
    let trailing = first.shape.dims().get(1..).ok_or("cannot gather 0-d tensors")?;
    let mut leading = 0;
    let mut data = Vec::new();
    for (rank, c) in contributions.iter().enumerate() {
        let dims = c.shape.dims();
        if dims.is_empty() || &dims[1..] != trailing {
            return Err(format!(
                "rank {rank} contributed shape {}, incompatible with {}",
                c.shape, first.shape
            ));
        }
        leading += dims[0];
        data.extend_from_slice(&c.data);
    }
    let mut dims = vec![leading];
    dims.extend_from_slice(trailing);
    Ok((data, Shape::new(dims)))
}

fn reduce_all<B: Backend>(
    contributions: &[Contribution<B>],
    op: ReduceOp,
) -> std::result::Result<(Vec<f64>, Shape), String> {
    let first = contributions.first().ok_or("no contributions")?;
    let mut acc = first.data.clone();
    for (rank, c) in contributions.iter().enumerate().skip(1) {
        if c.shape != first.shape {
            return Err(format!(
                "rank {rank} contributed shape {}, expected {}",
                c.shape, first.shape
            ));
        }
        for (a, &v) in acc.iter_mut().zip(&c.data) {
            *a = match op {
                ReduceOp::Sum | ReduceOp::Average => *a + v,
                ReduceOp::Min => a.min(v),
                ReduceOp::Max => a.max(v),
            };
        }
    }
    if op == ReduceOp::Average {
        let n = contributions.len() as f64;
        acc.iter_mut().for_each(|a| *a /= n);
    }
    Ok((acc, first.shape.clone()))
}

impl<B: Backend> Communicator<B> for ThreadGroup<B> {
    fn size(&self) -> usize {
        self.shared.size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn device(&self) -> &B::Device {
        &self.device
    }

    fn all_gather_async(&self, tensor: &Tensor<B>, name: &str) -> Result<CollectiveHandle<B>> {
        self.issue(tensor, name, CollectiveKind::AllGather)
    }

    fn all_reduce_async(
        &self,
        tensor: &Tensor<B>,
        name: &str,
        op: ReduceOp,
    ) -> Result<CollectiveHandle<B>> {
        self.issue(tensor, name, CollectiveKind::AllReduce(op))
    }
}

/// Run `f` once per rank of a fresh `size`-rank group, each on its own
/// thread, and return the results in rank order.
///
/// Every rank must issue the same collectives; a rank that returns early
/// while peers wait on it leaves them blocked.
pub fn run_workers<B, T, F>(size: usize, device: B::Device, f: F) -> Result<Vec<T>>
where
    B: Backend,
    T: Send,
    F: Fn(ThreadGroup<B>) -> Result<T> + Sync,
{
    let groups = ThreadGroup::<B>::new(size, device)?;
    std::thread::scope(|s| {
        let f = &f;
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| s.spawn(move || f(group)))
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, h)| {
                h.join()
                    .map_err(|_| Error::msg(format!("worker {rank} panicked")))
                    .and_then(|r| r)
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncbn_core::{BackwardMask, BackwardReduce, CpuBackend, CpuDevice, CpuStorage};

    type T = Tensor<CpuBackend>;
    const DEV: CpuDevice = CpuDevice(0);

    #[test]
    fn test_all_gather_uneven() {
        let out = run_workers::<CpuBackend, _, _>(3, DEV, |g| {
            let rows = g.rank() + 1;
            let data = vec![g.rank() as f64; rows * 2];
            let t = T::from_f64_slice(&data, (rows, 2), &DEV)?;
            let h = g.all_gather_async(&t, "x")?;
            g.wait(h)
        })
        .unwrap();
        for t in &out {
            assert_eq!(t.dims(), &[6, 2]);
            assert_eq!(
                t.to_f64_vec().unwrap(),
                vec![0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0]
            );
        }
    }

    #[test]
    fn test_all_reduce_ops() {
        for (op, expected) in [
            (ReduceOp::Sum, 6.0),
            (ReduceOp::Average, 2.0),
            (ReduceOp::Min, 1.0),
            (ReduceOp::Max, 3.0),
        ] {
            let out = run_workers::<CpuBackend, _, _>(3, DEV, |g| {
                let t = T::full(2, g.rank() as f64 + 1.0, &DEV)?;
                let h = g.all_reduce_async(&t, "r", op)?;
                g.wait(h)?.to_f64_vec()
            })
            .unwrap();
            assert!(out.iter().all(|v| v == &vec![expected; 2]));
        }
    }

    #[test]
    fn test_same_name_matched_in_order() {
        let out = run_workers::<CpuBackend, _, _>(2, DEV, |g| {
            let a = T::full(1, 1.0 + g.rank() as f64, &DEV)?;
            let b = T::full(1, 10.0, &DEV)?;
            // both in flight under one name before either is waited on
            let ha = g.all_reduce_async(&a, "same", ReduceOp::Sum)?;
            let hb = g.all_reduce_async(&b, "same", ReduceOp::Sum)?;
            Ok((g.wait(ha)?.to_f64_vec()?, g.wait(hb)?.to_f64_vec()?))
        })
        .unwrap();
        for (a, b) in out {
            assert_eq!(a, vec![3.0]);
            assert_eq!(b, vec![20.0]);
        }
    }

    #[test]
    fn test_mismatched_kind_fails_every_rank() {
        let out = run_workers::<CpuBackend, _, _>(2, DEV, |g| {
            let t = T::full((1, 1), 1.0, &DEV)?;
            let h = if g.rank() == 0 {
                g.all_gather_async(&t, "m")?
            } else {
                g.all_reduce_async(&t, "m", ReduceOp::Sum)?
            };
            Ok(g.wait(h))
        })
        .unwrap();
        for r in out {
            assert!(matches!(r, Err(Error::TransportFailure { ref name, .. }) if name == "m"));
        }
    }

    #[test]
    fn test_mismatched_shape_fails() {
        let out = run_workers::<CpuBackend, _, _>(2, DEV, |g| {
            let t = T::zeros(g.rank() + 1, &DEV)?;
            let h = g.all_reduce_async(&t, "s", ReduceOp::Sum)?;
            Ok(g.wait(h))
        })
        .unwrap();
        assert!(out.iter().all(|r| r.is_err()));
    }

    #[test]
    fn test_history() {
        let groups = ThreadGroup::<CpuBackend>::new(1, DEV).unwrap();
        let g = &groups[0];
        let t = T::full(1, 1.0, &DEV).unwrap();
        g.wait(g.all_gather_async(&t, "a").unwrap()).unwrap();
        g.wait(g.all_reduce_async(&t, "b", ReduceOp::Max).unwrap()).unwrap();
        assert_eq!(g.issued_ops(), 2);
        assert_eq!(
            g.history(),
            vec![
                (CollectiveKind::AllGather, "a".to_string()),
                (CollectiveKind::AllReduce(ReduceOp::Max), "b".to_string()),
            ]
        );
    }

    /// CPU backend whose host reads fail on NaN-poisoned buffers.
    #[derive(Debug, Clone, Copy)]
    struct PoisonReadBackend;

    impl Backend for PoisonReadBackend {
        type Device = CpuDevice;
        type Storage = CpuStorage;

        fn full(shape: &Shape, val: f64, device: &CpuDevice) -> Result<CpuStorage> {
            CpuBackend::full(shape, val, device)
        }
        fn from_f64_slice(data: &[f64], device: &CpuDevice) -> Result<CpuStorage> {
            CpuBackend::from_f64_slice(data, device)
        }
        fn to_f64_vec(input: &CpuStorage) -> Result<Vec<f64>> {
            if input.0.iter().any(|x| x.is_nan()) {
                return Err(Error::msg("device read failed"));
            }
            CpuBackend::to_f64_vec(input)
        }
        fn affine(input: &CpuStorage, mul: f64, add: f64) -> Result<CpuStorage> {
            CpuBackend::affine(input, mul, add)
        }
        fn batch_norm_stats(input: &CpuStorage, shape: &Shape, eps: f64) -> Result<(CpuStorage, CpuStorage)> {
            CpuBackend::batch_norm_stats(input, shape, eps)
        }
        fn batch_norm_elemt(
            input: &CpuStorage,
            shape: &Shape,
            weight: Option<&CpuStorage>,
            bias: Option<&CpuStorage>,
            mean: &CpuStorage,
            invstd: &CpuStorage,
        ) -> Result<CpuStorage> {
            CpuBackend::batch_norm_elemt(input, shape, weight, bias, mean, invstd)
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
            CpuBackend::batch_norm_backward_reduce(grad_output, input, shape, mean, invstd, weight, mask)
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
            CpuBackend::batch_norm_backward_elemt(
                grad_output, input, shape, mean, invstd, weight, mean_dy, mean_dy_xmu,
            )
        }
    }

    #[test]
    fn test_failed_read_keeps_sequence() {
        let out = run_workers::<PoisonReadBackend, _, _>(2, DEV, |g| {
            if g.rank() == 0 {
                let bad = Tensor::<PoisonReadBackend>::full(1, f64::NAN, &DEV)?;
                assert!(g.all_reduce_async(&bad, "x", ReduceOp::Sum).is_err());
                assert_eq!(g.issued_ops(), 0);
            }
            // the retry must pair with the peer's first "x"
            let t = Tensor::<PoisonReadBackend>::full(1, 1.0 + g.rank() as f64, &DEV)?;
            let h = g.all_reduce_async(&t, "x", ReduceOp::Sum)?;
            Ok((g.wait(h)?.to_f64_vec()?, g.issued_ops()))
        })
        .unwrap();
        for (v, issued) in out {
            assert_eq!(v, vec![3.0]);
            assert_eq!(issued, 1);
        }
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(ThreadGroup::<CpuBackend>::new(0, DEV).is_err());
    }
}
