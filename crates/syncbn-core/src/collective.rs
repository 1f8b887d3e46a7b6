// Collective — Contract between synchronization code and a transport
//
// A Communicator connects the `size()` workers of a data-parallel job. Every
// collective is issued asynchronously and returns a CollectiveHandle; the
// caller later blocks on `wait(handle)` to obtain the result.
//
// MATCHING RULE:
//
//   Collectives are named. A transport matches the k-th operation issued
//   under a given name on one worker with the k-th operation issued under
//   that name on every other worker. Callers therefore must issue the same
//   names in the same order on every worker. An operation that one worker
//   skips leaves the others blocked in `wait` forever; nothing at this layer
//   times out or cancels.
//
// HANDLES:
//
//   A handle is a one-shot promise backed by an mpsc channel. The transport
//   keeps the sending half and fulfils it when all peers have contributed.
//   Handles are purely local values: no process-wide state is involved, and
//   dropping a handle simply discards the result.

use std::fmt;
use std::sync::mpsc;

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Element-wise reduction applied by an all-reduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Sum over workers.
    Sum,
    /// Sum over workers divided by the worker count.
    Average,
    Min,
    Max,
}

/// Which kind of collective produced a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectiveKind {
    AllGather,
    AllReduce(ReduceOp),
}

impl fmt::Display for CollectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectiveKind::AllGather => write!(f, "allgather"),
            CollectiveKind::AllReduce(op) => write!(f, "allreduce({op:?})"),
        }
    }
}

/// Sending half of a collective's promise, held by the transport.
pub type Completion<B> = mpsc::Sender<Result<Tensor<B>>>;

/// Opaque handle to an in-flight collective operation.
///
/// Consumed by [`Communicator::wait`]; it can be waited on only once.
pub struct CollectiveHandle<B: Backend> {
    name: String,
    kind: CollectiveKind,
    rx: mpsc::Receiver<Result<Tensor<B>>>,
}

impl<B: Backend> fmt::Debug for CollectiveHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectiveHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<B: Backend> CollectiveHandle<B> {
    /// Create a pending handle plus the completion the transport must fulfil.
    pub fn pending(name: impl Into<String>, kind: CollectiveKind) -> (Self, Completion<B>) {
        let (tx, rx) = mpsc::channel();
        let handle = CollectiveHandle {
            name: name.into(),
            kind,
            rx,
        };
        (handle, tx)
    }

    /// A handle whose result is already known (e.g. a single-worker group).
    pub fn ready(name: impl Into<String>, kind: CollectiveKind, result: Result<Tensor<B>>) -> Self {
        let (handle, tx) = Self::pending(name, kind);
        // The receiver is alive in `handle`, so this send cannot fail.
        let _ = tx.send(result);
        handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the operation completes on every worker.
    ///
    /// Fails with `TransportFailure` if the transport dropped the completion
    /// without fulfilling it.
    pub fn wait(self) -> Result<Tensor<B>> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::transport(
                self.name,
                format!("{} was abandoned by the transport", self.kind),
            )),
        }
    }
}

/// A group of workers that can run named collectives together.
///
/// Implementations must preserve the per-name issue order described in the
/// module docs. They report failures as [`Error::TransportFailure`], either
/// from the `*_async` call or through the handle.
pub trait Communicator<B: Backend>: Send + Sync {
    /// Number of workers in the group.
    fn size(&self) -> usize;

    /// This worker's rank in `0..size()`.
    fn rank(&self) -> usize;

    /// Device on which tensors handed to this communicator must live.
    fn device(&self) -> &B::Device;

    /// Gather `tensor` from every worker, concatenated along dim 0 in rank
    /// order. Leading sizes may differ across workers; trailing dims must not.
    fn all_gather_async(&self, tensor: &Tensor<B>, name: &str) -> Result<CollectiveHandle<B>>;

    /// Reduce `tensor` element-wise over every worker.
    fn all_reduce_async(
        &self,
        tensor: &Tensor<B>,
        name: &str,
        op: ReduceOp,
    ) -> Result<CollectiveHandle<B>>;

    /// Block until `handle` completes and return its result.
    fn wait(&self, handle: CollectiveHandle<B>) -> Result<Tensor<B>> {
        handle.wait()
    }
}

impl<B: Backend, C: Communicator<B> + ?Sized> Communicator<B> for &C {
    fn size(&self) -> usize {
        (**self).size()
    }
    fn rank(&self) -> usize {
        (**self).rank()
    }
    fn device(&self) -> &B::Device {
        (**self).device()
    }
    fn all_gather_async(&self, tensor: &Tensor<B>, name: &str) -> Result<CollectiveHandle<B>> {
        (**self).all_gather_async(tensor, name)
    }
    fn all_reduce_async(
        &self,
        tensor: &Tensor<B>,
        name: &str,
        op: ReduceOp,
    ) -> Result<CollectiveHandle<B>> {
        (**self).all_reduce_async(tensor, name, op)
    }
    fn wait(&self, handle: CollectiveHandle<B>) -> Result<Tensor<B>> {
        (**self).wait(handle)
    }
}

impl<B: Backend, C: Communicator<B> + ?Sized> Communicator<B> for std::sync::Arc<C> {
    fn size(&self) -> usize {
        (**self).size()
    }
    fn rank(&self) -> usize {
        (**self).rank()
    }
    fn device(&self) -> &B::Device {
        (**self).device()
    }
    fn all_gather_async(&self, tensor: &Tensor<B>, name: &str) -> Result<CollectiveHandle<B>> {
        (**self).all_gather_async(tensor, name)
    }
    fn all_reduce_async(
        &self,
        tensor: &Tensor<B>,
        name: &str,
        op: ReduceOp,
    ) -> Result<CollectiveHandle<B>> {
        (**self).all_reduce_async(tensor, name, op)
    }
    fn wait(&self, handle: CollectiveHandle<B>) -> Result<Tensor<B>> {
        (**self).wait(handle)
    }
}

/// Trivial communicator for a group of one worker.
///
/// Every collective completes immediately: an all-gather returns the input
/// and an all-reduce returns it unchanged for every [`ReduceOp`].
#[derive(Debug, Clone)]
pub struct SingleWorker<B: Backend> {
    device: B::Device,
}

impl<B: Backend> SingleWorker<B> {
    pub fn new(device: B::Device) -> Self {
        SingleWorker { device }
    }
}

impl<B: Backend> Communicator<B> for SingleWorker<B> {
    fn size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn device(&self) -> &B::Device {
        &self.device
    }

    fn all_gather_async(&self, tensor: &Tensor<B>, name: &str) -> Result<CollectiveHandle<B>> {
        Ok(CollectiveHandle::ready(
            name,
            CollectiveKind::AllGather,
            Ok(tensor.clone()),
        ))
    }

    fn all_reduce_async(
        &self,
        tensor: &Tensor<B>,
        name: &str,
        op: ReduceOp,
    ) -> Result<CollectiveHandle<B>> {
        Ok(CollectiveHandle::ready(
            name,
            CollectiveKind::AllReduce(op),
            Ok(tensor.clone()),
        ))
    }
}
