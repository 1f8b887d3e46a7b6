//! # syncbn
//!
//! Synchronized batch normalization for data-parallel training.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use syncbn::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `syncbn-core` | Tensor, Shape, Backend trait, CPU backend, Communicator contract, Error |
//! | `syncbn-nn` | RunningStats, StatisticsSynchronizer, SyncBatchNormFunction, SyncBatchNorm |
//!
//! ## Modules
//!
//! - [`distributed`] — ThreadGroup (in-process Communicator) and `run_workers`

/// Re-export core types.
pub use syncbn_core::{
    backend::{Backend, BackendDevice, BackendStorage, BackwardMask, BackwardReduce},
    collective::{CollectiveHandle, CollectiveKind, Communicator, ReduceOp, SingleWorker},
    Error, Result, Shape, Tensor,
};

/// Re-export CPU backend.
pub use syncbn_core::{CpuBackend, CpuDevice, CpuStorage, CpuTensor};

/// Re-export normalization modules.
pub mod nn {
    pub use syncbn_nn::*;
}

/// Distributed — in-process worker groups implementing the collective contract.
pub mod distributed;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::distributed::{run_workers, ThreadGroup};
    pub use crate::nn::{
        batch_norm, merge_stats, BatchNormContext, BatchNormGrads, Module, NeedsInputGrad,
        RunningStats, StatisticsSynchronizer, SyncBatchNorm, SyncBatchNormConfig,
        SyncBatchNormContext, SyncBatchNormFunction, SyncBatchNormGrads,
    };
    pub use crate::{
        Backend, CollectiveKind, Communicator, CpuBackend, CpuDevice, CpuTensor, Error, ReduceOp,
        Result, Shape, SingleWorker, Tensor,
    };
}
