//! # syncbn-core
//!
//! Core primitives for synchronized batch normalization.
//!
//! This crate provides:
//! - [`Tensor`] — Arc-shared n-dimensional array on a backend device
//! - [`Shape`] — shape representation with `[N, C, *]` helpers
//! - [`Backend`] trait — storage plus the four batch-norm kernels
//! - [`CpuBackend`] — host reference backend (rayon over channels)
//! - [`Communicator`] trait — named async all-gather / all-reduce with
//!   [`CollectiveHandle`]s
//! - [`Error`] / [`Result`] — the error type shared by every syncbn crate

pub mod backend;
pub mod collective;
pub mod cpu;
pub mod error;
pub mod shape;
pub mod tensor;

pub use backend::{Backend, BackendDevice, BackendStorage, BackwardMask, BackwardReduce};
pub use collective::{CollectiveHandle, CollectiveKind, Communicator, Completion, ReduceOp, SingleWorker};
pub use cpu::{CpuBackend, CpuDevice, CpuStorage, CpuTensor};
pub use error::{Error, Result};
pub use shape::Shape;
pub use tensor::{BackwardReduceTensors, Tensor};
