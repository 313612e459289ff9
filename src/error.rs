// src/error.rs
//
// The few error kinds a caller of `execute()` is expected to match on.
// Everything below the public boundary (probe reads, process spawn, JSON
// decode) stays in `anyhow::Result` and gets folded into one of these
// variants at the edge — see supervisor.rs.

use crate::types::Batch;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("admission exhausted: refresh_patience exceeded with no headroom progress")]
    AdmissionExhausted,

    #[error("worker '{task_name}' failed: {cause}")]
    WorkerFailure { task_name: String, cause: String },

    #[error("worker '{task_name}' requested termination")]
    WorkerTerminate { task_name: String },

    #[error("interrupted by operator")]
    Interrupted,

    /// Umbrella raised at the end of drain whenever `exceptions` is
    /// non-empty or termination was set. Carries the drained batch so the
    /// caller can still inspect whatever completed before the cutoff.
    #[error("batch failed: {reason}")]
    BatchFailed { batch: Box<Batch>, reason: String },
}
