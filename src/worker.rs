// src/worker.rs
//
// The Worker Adapter (§4.C) and its Rust realization (§4.C.1, §4.C.2).
//
// Rust has no runtime introspection of a closure's parameter list and no
// way to carry an arbitrary closure across a process boundary the way a
// pickled Python callable crosses `multiprocessing`'s fork/spawn boundary.
// This implementation takes the explicit builder route the spec prefers:
// the caller never hands the executor a raw closure, only the name of a
// top-level `fn` item registered ahead of time in a `WorkerRegistry`. The
// registry is rebuilt identically in the re-exec'd child (registration is
// pure code, so both process images produce the same map), and the child
// looks its worker up again by name rather than by function pointer, since
// a function pointer's value is only meaningful inside the process image
// that produced it.

use crate::logging::{LogLevel, TaskLogger};
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Read;

// ============================================================================
// CAPABILITY HANDLES
// ============================================================================

/// The `cuda` capability (§4.C step 2): the device id assigned at admission.
#[derive(Debug, Clone, Copy)]
pub struct CudaHandle(pub usize);

/// The `log_method` capability: a handle to the per-task log sink (§6).
#[derive(Clone)]
pub struct LogHandle(TaskLogger);

impl LogHandle {
    pub fn log(&self, msg: &str, level: LogLevel) {
        self.0.log(msg, level);
    }
}

// ============================================================================
// WORKER OUTCOME
// ============================================================================

/// What a worker `fn` returns. `Terminate` mirrors the source's "a mapping
/// containing key `terminate` with truthy value" (§4.C step 4); everything
/// else — including a plain value — is `Value`.
#[derive(Debug, Clone)]
pub enum WorkerOutcome {
    Value(Value),
    Terminate(Value),
}

pub type PlainFn = fn(Value) -> Result<WorkerOutcome>;
pub type CudaFn = fn(Value, CudaHandle) -> Result<WorkerOutcome>;
pub type LoggerFn = fn(Value, LogHandle) -> Result<WorkerOutcome>;
pub type BothFn = fn(Value, CudaHandle, LogHandle) -> Result<WorkerOutcome>;

#[derive(Clone, Copy)]
enum RegisteredWorker {
    Plain(PlainFn),
    Cuda(CudaFn),
    Logger(LoggerFn),
    Both(BothFn),
}

impl RegisteredWorker {
    fn wants_cuda(&self) -> bool {
        matches!(self, RegisteredWorker::Cuda(_) | RegisteredWorker::Both(_))
    }
}

// ============================================================================
// REGISTRY (§4.C.1's builder)
// ============================================================================

/// Maps a stable name to a top-level `fn` item, along with the capabilities
/// that `fn` opted into via the builder that registered it.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<&'static str, RegisteredWorker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plain(mut self, name: &'static str, f: PlainFn) -> Self {
        self.workers.insert(name, RegisteredWorker::Plain(f));
        self
    }

    pub fn with_cuda(mut self, name: &'static str, f: CudaFn) -> Self {
        self.workers.insert(name, RegisteredWorker::Cuda(f));
        self
    }

    pub fn with_logger(mut self, name: &'static str, f: LoggerFn) -> Self {
        self.workers.insert(name, RegisteredWorker::Logger(f));
        self
    }

    pub fn with_both(mut self, name: &'static str, f: BothFn) -> Self {
        self.workers.insert(name, RegisteredWorker::Both(f));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.workers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Whether `name` declared the `cuda` capability. Used by the supervisor
    /// to decide whether to warn when a device was assigned to a worker
    /// that will never see it (§4.C step 2's "log a warning and continue").
    pub fn wants_cuda(&self, name: &str) -> bool {
        self.workers.get(name).is_some_and(RegisteredWorker::wants_cuda)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    fn invoke(
        &self,
        name: &str,
        args: Value,
        cuda: Option<CudaHandle>,
        logger: Option<LogHandle>,
    ) -> Result<WorkerOutcome> {
        match self.workers.get(name) {
            Some(RegisteredWorker::Plain(f)) => f(args),
            Some(RegisteredWorker::Cuda(f)) => {
                let cuda = cuda.ok_or_else(|| anyhow!("worker '{name}' declared cuda but no device was assigned"))?;
                f(args, cuda)
            }
            Some(RegisteredWorker::Logger(f)) => {
                let logger = logger.ok_or_else(|| anyhow!("worker '{name}' declared log_method but no logger was built"))?;
                f(args, logger)
            }
            Some(RegisteredWorker::Both(f)) => {
                let cuda = cuda.ok_or_else(|| anyhow!("worker '{name}' declared cuda but no device was assigned"))?;
                let logger = logger.ok_or_else(|| anyhow!("worker '{name}' declared log_method but no logger was built"))?;
                f(args, cuda, logger)
            }
            None => bail!("no worker registered under name '{name}'"),
        }
    }
}

/// The fixed set of workers this binary knows how to run. Registration is
/// pure code executed identically by the parent (to resolve capabilities)
/// and by the re-exec'd child (to look the worker back up by name) — see
/// the module doc comment. Demo/test workers live here because this crate
/// ships as a single binary with no dynamic worker loading.
pub fn registry() -> WorkerRegistry {
    WorkerRegistry::new()
        .plain("identity", demo::identity)
        .plain("increment", demo::increment)
        .plain("fail_on_two", demo::fail_on_two)
        .plain("terminate_on_one", demo::terminate_on_one)
        .with_cuda("cuda_echo", demo::cuda_echo)
        .with_logger("logger_echo", demo::logger_echo)
        .with_both("cuda_logger_echo", demo::cuda_logger_echo)
}

/// Small, self-contained workers used by the CLI demo and by this crate's
/// own integration tests (§10.4). Not part of the public contract — a
/// caller embedding this crate as a library registers its own workers.
mod demo {
    use super::*;

    pub fn identity(args: Value) -> Result<WorkerOutcome> {
        Ok(WorkerOutcome::Value(args))
    }

    pub fn increment(args: Value) -> Result<WorkerOutcome> {
        let x = args.as_i64().context("increment expects an integer argument")?;
        Ok(WorkerOutcome::Value(Value::from(x + 1)))
    }

    pub fn fail_on_two(args: Value) -> Result<WorkerOutcome> {
        let x = args.as_i64().context("fail_on_two expects an integer argument")?;
        if x == 2 {
            bail!("ValueError: boom");
        }
        Ok(WorkerOutcome::Value(Value::from(x)))
    }

    pub fn terminate_on_one(args: Value) -> Result<WorkerOutcome> {
        let x = args.as_i64().context("terminate_on_one expects an integer argument")?;
        if x == 1 {
            Ok(WorkerOutcome::Terminate(Value::from(x)))
        } else {
            Ok(WorkerOutcome::Value(Value::from(x)))
        }
    }

    pub fn cuda_echo(args: Value, cuda: CudaHandle) -> Result<WorkerOutcome> {
        Ok(WorkerOutcome::Value(serde_json::json!({
            "args": args,
            "cuda": cuda.0,
        })))
    }

    pub fn logger_echo(args: Value, logger: LogHandle) -> Result<WorkerOutcome> {
        logger.log(&format!("logger_echo invoked with {args}"), LogLevel::Info);
        Ok(WorkerOutcome::Value(args))
    }

    pub fn cuda_logger_echo(args: Value, cuda: CudaHandle, logger: LogHandle) -> Result<WorkerOutcome> {
        logger.log(&format!("cuda_logger_echo on device {}", cuda.0), LogLevel::Info);
        Ok(WorkerOutcome::Value(serde_json::json!({
            "args": args,
            "cuda": cuda.0,
        })))
    }
}

// ============================================================================
// ENVELOPE (§4.C.2, §4.E's "envelope")
// ============================================================================

/// The single JSON value a child writes to stdout before exiting.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEnvelope {
    Result { value: Value },
    Terminate { value: Value },
    Error { message: String },
    Interrupted,
}

// ============================================================================
// ENV VAR CONTRACT (§4.C.2)
// ============================================================================

pub const ENV_WORKER_MODE: &str = "EXECUTOR_WORKER_MODE";
pub const ENV_WORKER_NAME: &str = "EXECUTOR_WORKER_NAME";
pub const ENV_TASK_ID: &str = "EXECUTOR_TASK_ID";
pub const ENV_TASK_NAME: &str = "EXECUTOR_TASK_NAME";
pub const ENV_CUDA_DEVICE: &str = "EXECUTOR_CUDA_DEVICE";
pub const ENV_LOGGING_FOLDER: &str = "EXECUTOR_LOGGING_FOLDER";

pub fn is_worker_mode() -> bool {
    std::env::var(ENV_WORKER_MODE).as_deref() == Ok("1")
}

/// The child's entire `main`: read the task from env vars and stdin,
/// invoke the worker, write the envelope, exit. Never returns to the
/// caller in practice (it always ends in `process::exit`) — the crate's
/// own `main` invokes this before doing any CLI argument parsing, per
/// §4.C.2.
pub async fn run_worker_child(registry: &WorkerRegistry) {
    let envelope = run_worker_child_inner(registry).await.unwrap_or_else(|e| WorkerEnvelope::Error {
        message: e.to_string(),
    });
    let stdout = serde_json::to_string(&envelope).unwrap_or_else(|e| {
        format!(r#"{{"kind":"error","message":"failed to encode envelope: {e}"}}"#)
    });
    println!("{stdout}");
    std::process::exit(0);
}

async fn run_worker_child_inner(registry: &WorkerRegistry) -> Result<WorkerEnvelope> {
    let worker_name = std::env::var(ENV_WORKER_NAME).context("missing EXECUTOR_WORKER_NAME")?;
    let task_name = std::env::var(ENV_TASK_NAME).context("missing EXECUTOR_TASK_NAME")?;
    let logging_folder = std::env::var(ENV_LOGGING_FOLDER).context("missing EXECUTOR_LOGGING_FOLDER")?;
    let cuda_device = std::env::var(ENV_CUDA_DEVICE).ok().and_then(|s| s.parse::<usize>().ok());

    let mut args_raw = String::new();
    std::io::stdin()
        .read_to_string(&mut args_raw)
        .context("reading task args from stdin")?;
    let args: Value = serde_json::from_str(&args_raw).context("decoding task args as JSON")?;

    if !registry.contains(&worker_name) {
        bail!("no worker registered under name '{worker_name}'");
    }

    let cuda = cuda_device.map(CudaHandle);
    // `init_logger` is cheap (one file create); every child opens one, but
    // only `with_logger`/`with_both` workers ever receive the handle — see
    // `WorkerRegistry::invoke`, which drops it for `Plain`/`Cuda` workers.
    let logger = crate::logging::init_logger(std::path::Path::new(&logging_folder), &task_name)
        .ok()
        .map(LogHandle);

    let registry = registry.clone();
    let worker_name_blocking = worker_name.clone();
    let outcome_fut = tokio::task::spawn_blocking(move || {
        registry.invoke(&worker_name_blocking, args, cuda, logger)
    });

    tokio::select! {
        result = outcome_fut => {
            let outcome = result.context("worker task panicked")??;
            Ok(match outcome {
                WorkerOutcome::Value(v) => WorkerEnvelope::Result { value: v },
                WorkerOutcome::Terminate(v) => WorkerEnvelope::Terminate { value: v },
            })
        }
        _ = tokio::signal::ctrl_c() => {
            Ok(WorkerEnvelope::Interrupted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_reports_capability_flags() {
        let reg = registry();
        assert!(!reg.wants_cuda("identity"));
        assert!(!reg.wants_cuda("logger_echo"));
        assert!(reg.wants_cuda("cuda_echo"));
        assert!(reg.wants_cuda("cuda_logger_echo"));
        assert!(!reg.wants_cuda("no_such_worker"));
        assert!(reg.contains("increment"));
        assert!(!reg.contains("no_such_worker"));
    }

    #[test]
    fn names_are_sorted() {
        let names = registry().names();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }

    #[test]
    fn demo_workers_behave_as_documented() {
        assert!(matches!(demo::identity(Value::from(5)).unwrap(), WorkerOutcome::Value(v) if v == Value::from(5)));
        assert!(matches!(demo::increment(Value::from(5)).unwrap(), WorkerOutcome::Value(v) if v == Value::from(6)));
        assert!(demo::fail_on_two(Value::from(2)).is_err());
        assert!(matches!(demo::fail_on_two(Value::from(3)).unwrap(), WorkerOutcome::Value(_)));
        assert!(matches!(demo::terminate_on_one(Value::from(1)).unwrap(), WorkerOutcome::Terminate(_)));
        assert!(matches!(demo::terminate_on_one(Value::from(0)).unwrap(), WorkerOutcome::Value(_)));
    }

    #[test]
    fn invoke_requires_declared_capabilities() {
        let reg = registry();
        let err = reg.invoke("cuda_echo", Value::from(1), None, None).unwrap_err();
        assert!(err.to_string().contains("no device was assigned"));

        let ok = reg.invoke("cuda_echo", Value::from(1), Some(CudaHandle(0)), None);
        assert!(ok.is_ok());
    }

    #[test]
    fn invoke_unknown_worker_errors() {
        let reg = registry();
        assert!(reg.invoke("nonexistent", Value::Null, None, None).is_err());
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let original = WorkerEnvelope::Result { value: Value::from(42) };
        let encoded = serde_json::to_string(&original).unwrap();
        let decoded: WorkerEnvelope = serde_json::from_str(&encoded).unwrap();
        match decoded {
            WorkerEnvelope::Result { value } => assert_eq!(value, Value::from(42)),
            other => panic!("expected Result, got {other:?}"),
        }

        let terminated: WorkerEnvelope = serde_json::from_str(r#"{"kind":"interrupted"}"#).unwrap();
        assert!(matches!(terminated, WorkerEnvelope::Interrupted));
    }
}
