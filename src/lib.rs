// src/lib.rs
//
// =============================================================================
// PARALLEX: LIBRARY ROOT
// =============================================================================
//
// This file declares the module tree and exports public types.

pub mod config;
pub mod degraded;
pub mod error;
pub mod logging;
pub mod probe;
pub mod resource_manager;
pub mod store;
pub mod supervisor;
pub mod types;
pub mod worker;

// Re-exports (the public API): `use parallex::{execute, ExecuteOptions, ...}`.
pub use error::ExecutorError;
pub use supervisor::execute;
pub use types::{Batch, BatchMeta, ErrorRecord, ExecuteOptions, GpuAllowlist, ResourceConfig};
pub use worker::{registry, run_worker_child, CudaHandle, LogHandle, WorkerOutcome, WorkerRegistry};
