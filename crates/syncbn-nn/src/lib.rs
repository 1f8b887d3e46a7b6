//! # syncbn-nn
//!
//! Batch normalization whose statistics span every worker of a data-parallel
//! job.
//!
//! 1. **Module trait** — every layer implements `forward()` and train/eval
//! 2. **batch_norm** — plain single-device batch norm with running statistics
//! 3. **StatisticsSynchronizer** — merges per-worker statistics via all-gather
//! 4. **SyncBatchNormFunction** — differentiable forward/backward over a
//!    [`Communicator`](syncbn_core::Communicator)
//! 5. **SyncBatchNorm** — the layer, choosing the local or synchronized path
//!
//! Modules are generic over `Backend` (like `Tensor<B>`) and over the
//! communicator, so the same layer runs in-process, on one worker, or over
//! any transport that implements the collective contract.

pub mod batchnorm;
pub mod function;
pub mod module;
pub mod stats;
pub mod sync_batchnorm;

pub use batchnorm::{batch_norm, BatchNormGrads, LocalBatchNormContext, NeedsInputGrad, RunningStats};
pub use function::{
    SyncBatchNormContext, SyncBatchNormFunction, SyncBatchNormGrads, MEAN_DY_NAME, MEAN_DY_XMU_NAME,
};
pub use module::Module;
pub use stats::{
    merge_stats, GlobalStats, LocalStats, MergedStats, StatisticsSynchronizer, COUNT_NAME,
    INVSTD_NAME, MEAN_NAME,
};
pub use sync_batchnorm::{BatchNormContext, SyncBatchNorm, SyncBatchNormConfig};
