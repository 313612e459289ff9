// src/degraded.rs
//
// The degraded fallback executor (§10.5, from original_source): a plain
// fixed-size process pool that collects each child's single envelope
// directly and assembles the `Batch` in argument order once every child
// has exited. No Shared Result Store, no termination-sentinel support, no
// inferred-usage refinement, no GPU/RAM admission at all — this mirrors
// the original implementation's platform fallback path (Design Notes §9b)
// and is reached only via `ExecuteOptions::degraded_pool`, never
// autodetected, so its weaker guarantees are always an explicit opt-in.

use crate::error::ExecutorError;
use crate::types::{build_task_names, Batch, BatchMeta, ErrorRecord, ExecuteOptions, Task};
use crate::worker::{self, WorkerEnvelope, WorkerRegistry};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;

pub async fn execute_degraded(
    worker_name: &'static str,
    args_list: Vec<serde_json::Value>,
    options: ExecuteOptions,
    registry: Arc<WorkerRegistry>,
) -> Result<Batch, ExecutorError> {
    if !registry.contains(worker_name) {
        return Err(ExecutorError::ResourceUnavailable(format!(
            "no worker registered under name '{worker_name}'"
        )));
    }

    let n_tasks = args_list.len();
    if n_tasks == 0 {
        return Ok(Batch {
            results: HashMap::new(),
            exceptions: HashMap::new(),
            meta: BatchMeta { n_jobs: 0, n_tasks: 0, terminated: false },
        });
    }

    let n_jobs = options.num_jobs.min(n_tasks).max(1);
    let worker_exe = options
        .worker_exe
        .clone()
        .unwrap_or(std::env::current_exe().map_err(|e| {
            ExecutorError::ResourceUnavailable(format!("resolving current executable: {e}"))
        })?);
    let logging_folder = options.logging_folder();
    let task_names = build_task_names(&options, n_tasks);

    let tasks: Vec<Task> = args_list
        .into_iter()
        .enumerate()
        .map(|(task_id, args)| Task { task_id, task_name: task_names[task_id].clone(), args })
        .collect();

    let semaphore = Arc::new(Semaphore::new(n_jobs));
    let mut handles = Vec::with_capacity(n_tasks);

    for task in tasks {
        let semaphore = semaphore.clone();
        let worker_exe = worker_exe.clone();
        let logging_folder = logging_folder.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            let task_id = task.task_id;
            let task_name = task.task_name.clone();
            let envelope = run_one(&task, worker_name, &worker_exe, &logging_folder).await;
            (task_id, task_name, envelope)
        }));
    }

    let mut results = HashMap::new();
    let mut exceptions = HashMap::new();

    for handle in handles {
        let (_, task_name, envelope) = handle.await.map_err(|e| ExecutorError::BatchFailed {
            batch: Box::new(Batch {
                results: results.clone(),
                exceptions: exceptions.clone(),
                meta: BatchMeta { n_jobs, n_tasks, terminated: true },
            }),
            reason: format!("worker task join failed: {e}"),
        })?;

        match envelope {
            Ok(WorkerEnvelope::Result { value }) | Ok(WorkerEnvelope::Terminate { value }) => {
                // The degraded pool does not honor the terminate sentinel
                // (§10.5) — a `Terminate` result is recorded as a plain
                // value and the batch keeps running to completion.
                results.insert(task_name, value);
            }
            Ok(WorkerEnvelope::Error { message }) => {
                exceptions.insert(task_name, ErrorRecord::new("WorkerFailure", message));
            }
            Ok(WorkerEnvelope::Interrupted) => {
                exceptions.insert(task_name, ErrorRecord::new("Interrupted", "worker exited on its own interrupt"));
            }
            Err(e) => {
                exceptions.insert(task_name, ErrorRecord::new("WorkerFailure", e.to_string()));
            }
        }
    }

    let terminated = false;
    let batch = Batch { results, exceptions, meta: BatchMeta { n_jobs, n_tasks, terminated } };

    if !batch.exceptions.is_empty() {
        return Err(ExecutorError::BatchFailed {
            batch: Box::new(batch),
            reason: "terminated by unexpected errors".to_string(),
        });
    }

    Ok(batch)
}

async fn run_one(
    task: &Task,
    worker_name: &'static str,
    worker_exe: &std::path::Path,
    logging_folder: &std::path::Path,
) -> Result<WorkerEnvelope> {
    let mut cmd = Command::new(worker_exe);
    cmd.env(worker::ENV_WORKER_MODE, "1")
        .env(worker::ENV_WORKER_NAME, worker_name)
        .env(worker::ENV_TASK_ID, task.task_id.to_string())
        .env(worker::ENV_TASK_NAME, &task.task_name)
        .env(worker::ENV_LOGGING_FOLDER, logging_folder)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().context("spawning worker child process")?;
    let mut stdin = child.stdin.take().context("child stdin was not piped")?;
    let args_json = serde_json::to_vec(&task.args).context("encoding task args as JSON")?;
    stdin.write_all(&args_json).await.context("writing task args to child stdin")?;
    drop(stdin);

    let output = child.wait_with_output().await.context("waiting for worker child")?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if let Some(line) = stdout.lines().last() {
        if let Ok(envelope) = serde_json::from_str::<WorkerEnvelope>(line) {
            return Ok(envelope);
        }
    }
    let stderr_tail: String =
        String::from_utf8_lossy(&output.stderr).lines().rev().take(10).collect::<Vec<_>>().join("\n");
    Ok(WorkerEnvelope::Error {
        message: format!(
            "worker exited with status {:?} and produced no valid envelope. stderr tail:\n{stderr_tail}",
            output.status.code()
        ),
    })
}
