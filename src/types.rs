// src/types.rs
//
// =============================================================================
// PARALLEX: DATA MODEL
// =============================================================================
//
// Task / Slot / Resource Kind / Worker Record / Shared Result Store entries,
// and the options + batch shapes that make up `execute()`'s public contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

// ============================================================================
// 1. TASKS
// ============================================================================

/// One unit of work: a call of the registered worker with one argument value.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: usize,
    pub task_name: String,
    pub args: Value,
}

/// How GPU device ids are made available to the resource manager.
///
/// `All` mirrors `available_cuda_list: null` (every device NVML enumerates).
/// `Explicit(vec![])` mirrors the empty-list case: no GPU may ever be used,
/// which is the boundary behavior that triggers `ResourceUnavailable` setup
/// failure when `use_cuda` is also true.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum GpuAllowlist {
    #[default]
    All,
    Explicit(Vec<usize>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_refresh_patience")]
    pub refresh_patience: u32,
    #[serde(default)]
    pub gpu_config: GpuAllowlist,
}

fn default_refresh_patience() -> u32 {
    10
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            refresh_patience: default_refresh_patience(),
            gpu_config: GpuAllowlist::All,
        }
    }
}

/// Rust realization of §6's `options` — see SPEC_FULL.md §10.3 for the YAML
/// config-file layer built on top of this.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteOptions {
    pub num_jobs: usize,
    pub sleep: f64,
    pub use_cuda: bool,
    pub name: Option<String>,
    pub meta_name: Option<String>,
    pub logging_folder: Option<PathBuf>,
    pub task_names: Option<Vec<String>>,
    pub resource_config: ResourceConfig,

    /// Additive: overrides `current_exe()` when re-execing into worker mode.
    /// Tests point this at `env!("CARGO_BIN_EXE_parallex")` since
    /// `current_exe()` inside `cargo test` resolves to the test binary, not
    /// this crate's own `main`.
    #[serde(skip)]
    pub worker_exe: Option<PathBuf>,

    /// Additive: opts into the degraded library-pool fallback described in
    /// SPEC_FULL.md §10.5. Never autodetected.
    pub degraded_pool: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            num_jobs: 4,
            sleep: 1.0,
            use_cuda: false,
            name: None,
            meta_name: None,
            logging_folder: None,
            task_names: None,
            resource_config: ResourceConfig::default(),
            worker_exe: None,
            degraded_pool: false,
        }
    }
}

impl ExecuteOptions {
    pub fn logging_folder(&self) -> PathBuf {
        self.logging_folder
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join("_parallel_/logs"))
    }
}

/// §3: "task_name (either user-supplied or synthesized `task_{id}` plus an
/// optional suffix)". Shared by both the supervisor and the degraded pool.
pub fn build_task_names(options: &ExecuteOptions, n_tasks: usize) -> Vec<String> {
    if let Some(names) = &options.task_names {
        if names.len() == n_tasks {
            return names.clone();
        }
        log::warn!(
            "task_names has {} entries but {n_tasks} tasks were submitted; falling back to synthesized names",
            names.len()
        );
    }
    let suffix = options.name.as_deref().unwrap_or("");
    (0..n_tasks).map(|id| format!("task_{id}{suffix}")).collect()
}

// ============================================================================
// 2. RESOURCE BOOKKEEPING
// ============================================================================

/// A live child's accounting record. Created at admission, removed on reap.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub pid: u32,
    pub task_id: usize,
    pub task_name: String,
    pub cuda_device: Option<usize>,
    /// Reservation snapshot taken at admission time — released verbatim on
    /// reap, independent of how the running estimate has drifted since.
    pub reserved_ram: u64,
    pub reserved_gpu: u64,
    /// Most recently observed per-PID reading (refined each refresh cycle).
    pub ram_usage: u64,
    pub gpu_usage: u64,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

// ============================================================================
// 3. SHARED RESULT STORE ENTRIES
// ============================================================================

/// `task_name -> err` and `__exceptions__[task_name] -> err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMeta {
    pub n_jobs: usize,
    pub n_tasks: usize,
    pub terminated: bool,
}

/// What `execute()` returns on every exit path (even the umbrella-error one,
/// where it rides along inside `ExecutorError::BatchFailed`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub results: HashMap<String, Value>,
    pub exceptions: HashMap<String, ErrorRecord>,
    pub meta: BatchMeta,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_names_are_synthesized_from_task_id_and_suffix() {
        let options = ExecuteOptions {
            name: Some("_v2".to_string()),
            ..ExecuteOptions::default()
        };
        assert_eq!(build_task_names(&options, 3), vec!["task_0_v2", "task_1_v2", "task_2_v2"]);
    }

    #[test]
    fn explicit_task_names_are_used_verbatim_when_counts_match() {
        let options = ExecuteOptions {
            task_names: Some(vec!["alpha".to_string(), "beta".to_string()]),
            ..ExecuteOptions::default()
        };
        assert_eq!(build_task_names(&options, 2), vec!["alpha", "beta"]);
    }

    #[test]
    fn mismatched_task_names_fall_back_to_synthesized() {
        let options = ExecuteOptions {
            task_names: Some(vec!["only_one".to_string()]),
            ..ExecuteOptions::default()
        };
        assert_eq!(build_task_names(&options, 2), vec!["task_0", "task_1"]);
    }

    #[test]
    fn execute_options_defaults_match_the_documented_baseline() {
        let options = ExecuteOptions::default();
        assert_eq!(options.num_jobs, 4);
        assert_eq!(options.sleep, 1.0);
        assert!(!options.use_cuda);
        assert!(!options.degraded_pool);
        assert_eq!(options.resource_config.refresh_patience, 10);
        assert!(matches!(options.resource_config.gpu_config, GpuAllowlist::All));
    }
}
