// src/supervisor.rs
//
// The Supervisor Loop (§4.D): holds J worker slots, spawns initial workers,
// waits for any slot to finish, records its result, refills from the
// pending queue, propagates user interrupt, drains and shuts down on exit.
// This is the Rust generalization of the teacher's `NodeGuardian` "Tetris"
// loop — instead of fitting jobs onto a single host's core/GPU bitmask, it
// fits tasks onto the Resource Manager's RAM/GPU headroom, one task id at a
// time, following the admission algorithm in SPEC_FULL.md §4.B.

use crate::error::ExecutorError;
use crate::resource_manager::{Admission, ResourceManager};
use crate::store::ResultStore;
use crate::types::{build_task_names, Batch, ErrorRecord, ExecuteOptions, Task};
use crate::worker::{self, WorkerEnvelope, WorkerRegistry};
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;

/// One finished child's outcome, plus enough identity to reap it.
struct ChildOutcome {
    task_id: usize,
    task_name: String,
    pid: u32,
    envelope: Result<WorkerEnvelope>,
}

/// A supervisor-owned cell holding at most one live worker (§3 "Slot").
struct RunningSlot {
    task_id: usize,
    pid: u32,
    handle: JoinHandle<ChildOutcome>,
}

/// `Execute(f, args_list, options) -> Batch` (§6), specialized to this
/// implementation's realization of `f` as a registered worker name and
/// `args_list` as one JSON value per task id (§6's closing paragraph).
pub async fn execute(
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

    // Boundary: N = 0 -> empty results, empty exceptions, terminated = false.
    if n_tasks == 0 {
        let store = ResultStore::new(0, 0);
        return Ok(store.into_batch());
    }

    // num_jobs > N clamps to N (§8 boundary behavior).
    let n_jobs = options.num_jobs.min(n_tasks).max(1);

    let mut resource_mgr = ResourceManager::new(&options)?;
    let logging_folder = options.logging_folder();
    let task_names = build_task_names(&options, n_tasks);
    let worker_exe = options
        .worker_exe
        .clone()
        .unwrap_or(std::env::current_exe().context("resolving current executable for worker re-exec")?);

    if options.use_cuda && !registry.wants_cuda(worker_name) {
        log::warn!(
            "worker '{worker_name}' does not declare the cuda capability but use_cuda is set; \
             it will run without ever seeing its assigned device"
        );
    }

    let tasks: Vec<Task> = args_list
        .into_iter()
        .enumerate()
        .map(|(task_id, args)| Task {
            task_id,
            task_name: task_names[task_id].clone(),
            args,
        })
        .collect();

    let mut store = ResultStore::new(n_jobs, n_tasks);
    let mut pending: VecDeque<usize> = (0..n_tasks).collect();
    let mut slots: Vec<Option<RunningSlot>> = (0..n_jobs).map(|_| None).collect();
    let mut skip_streak: u32 = 0;
    let sleep_base = options.sleep.max(0.0);

    resource_mgr.refresh();

    // --- initializing -------------------------------------------------
    for slot in slots.iter_mut() {
        if let Some(running) = try_launch_next(
            &mut pending,
            &mut resource_mgr,
            &mut store,
            &mut skip_streak,
            &tasks,
            worker_name,
            &registry,
            &worker_exe,
            &logging_folder,
        )
        .await?
        {
            *slot = Some(running);
        }
    }

    let mut interrupted = false;

    if !store.is_terminated() {
        // --- running ----------------------------------------------------
        'running: loop {
            // Wait for at least one slot to finish, honoring interrupt.
            loop {
                if slots.iter().any(|s| matches!(s, Some(r) if r.handle.is_finished())) {
                    break;
                }
                if pending.is_empty() && slots.iter().all(Option::is_none) {
                    break 'running;
                }

                let jitter: f64 = rand::random();
                let nap = Duration::from_secs_f64(sleep_base + jitter);
                tokio::select! {
                    _ = tokio::time::sleep(nap) => {}
                    _ = tokio::signal::ctrl_c() => {
                        interrupted = true;
                        break;
                    }
                }
                if interrupted {
                    break;
                }
                resource_mgr.refresh();

                // A slot is also "finished" if it is empty while work is
                // still pending (§4.D running step 1) — a prior admission
                // attempt deferred or failed to fill it. Break out so the
                // refill pass below runs and `try_admit`'s patience counter
                // can advance toward `AdmissionExhausted`; otherwise an
                // all-deferred initializing round leaves every slot `None`
                // forever and this loop keeps sleeping without ever
                // retrying admission.
                if !pending.is_empty() && slots.iter().any(Option::is_none) {
                    break;
                }
            }

            if interrupted {
                store.set_terminated();
                store.record_base_exception(ErrorRecord::new("Interrupted", "interrupted by operator"));
                break 'running;
            }

            // Reap finished slots, highest index first (§4.D ordering).
            for idx in (0..slots.len()).rev() {
                let finished = matches!(&slots[idx], Some(r) if r.handle.is_finished());
                if !finished {
                    continue;
                }
                let running = slots[idx].take().expect("checked Some above");
                let outcome = reap_slot(running).await;
                apply_outcome(&mut store, &mut resource_mgr, outcome);
            }

            if store.is_terminated() {
                break 'running;
            }

            // Refill empty slots from the pending queue.
            for slot in slots.iter_mut() {
                if slot.is_some() {
                    continue;
                }
                if let Some(running) = try_launch_next(
                    &mut pending,
                    &mut resource_mgr,
                    &mut store,
                    &mut skip_streak,
                    &tasks,
                    worker_name,
                    &registry,
                    &worker_exe,
                    &logging_folder,
                )
                .await?
                {
                    *slot = Some(running);
                }
            }

            if pending.is_empty() && slots.iter().all(Option::is_none) {
                break 'running;
            }
        }
    }

    // --- terminating ----------------------------------------------------
    for slot in slots.into_iter().flatten() {
        let outcome = reap_slot(slot).await;
        apply_outcome(&mut store, &mut resource_mgr, outcome);
    }

    let terminated = store.is_terminated();
    let exceptions_empty = store.exceptions_is_empty();
    let batch = store.into_batch();

    if terminated || !exceptions_empty {
        let reason = if exceptions_empty {
            "terminated by user action".to_string()
        } else {
            "terminated by unexpected errors".to_string()
        };
        return Err(ExecutorError::BatchFailed {
            batch: Box::new(batch),
            reason,
        });
    }

    Ok(batch)
}

/// §4.B admission, §4.D.1 launch: pop the head of the pending queue, ask
/// the Resource Manager to admit it, spawn the child on success. Returns
/// `Ok(None)` whenever the slot should stay empty this cycle (deferral,
/// rejection, or an empty queue).
#[allow(clippy::too_many_arguments)]
async fn try_launch_next(
    pending: &mut VecDeque<usize>,
    resource_mgr: &mut ResourceManager,
    store: &mut ResultStore,
    skip_streak: &mut u32,
    tasks: &[Task],
    worker_name: &'static str,
    registry: &Arc<WorkerRegistry>,
    worker_exe: &Path,
    logging_folder: &Path,
) -> Result<Option<RunningSlot>, ExecutorError> {
    let Some(task_id) = pending.pop_front() else {
        return Ok(None);
    };

    match resource_mgr.try_admit(task_id, store.is_terminated()) {
        Admission::Rejected => {
            pending.push_front(task_id);
            Ok(None)
        }
        Admission::Defer => {
            pending.push_front(task_id);
            Ok(None)
        }
        Admission::SkipExhausted => {
            pending.push_back(task_id);
            *skip_streak += 1;
            if *skip_streak as usize > pending.len() {
                return Err(ExecutorError::AdmissionExhausted);
            }
            Ok(None)
        }
        Admission::Admit { device } => {
            *skip_streak = 0;
            let task = &tasks[task_id];
            match spawn_child(task, device, worker_name, registry, worker_exe, logging_folder) {
                Ok((pid, handle)) => {
                    resource_mgr.reserve(pid, task_id, task.task_name.clone(), device);
                    Ok(Some(RunningSlot { task_id, pid, handle }))
                }
                Err(e) => {
                    log::error!("failed to spawn worker for task '{}': {e}", task.task_name);
                    store.record_exception(task.task_name.clone(), ErrorRecord::new("WorkerFailure", e.to_string()));
                    store.set_terminated();
                    Ok(None)
                }
            }
        }
    }
}

fn spawn_child(
    task: &Task,
    device: Option<usize>,
    worker_name: &'static str,
    registry: &WorkerRegistry,
    worker_exe: &Path,
    logging_folder: &Path,
) -> Result<(u32, JoinHandle<ChildOutcome>)> {
    if device.is_some() && !registry.wants_cuda(worker_name) {
        log::warn!(
            "task '{}' was assigned a device but worker '{worker_name}' does not declare cuda; \
             it will run without it",
            task.task_name
        );
    }

    let mut cmd = Command::new(worker_exe);
    cmd.env(worker::ENV_WORKER_MODE, "1")
        .env(worker::ENV_WORKER_NAME, worker_name)
        .env(worker::ENV_TASK_ID, task.task_id.to_string())
        .env(worker::ENV_TASK_NAME, &task.task_name)
        .env(worker::ENV_LOGGING_FOLDER, logging_folder)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(d) = device {
        cmd.env(worker::ENV_CUDA_DEVICE, d.to_string());
    }

    let mut child = cmd.spawn().context("spawning worker child process")?;
    let pid = child.id().context("spawned child has no pid (already exited?)")?;
    let mut stdin = child.stdin.take().context("child stdin was not piped")?;
    let args_json = serde_json::to_vec(&task.args).context("encoding task args as JSON")?;

    let task_id = task.task_id;
    let task_name = task.task_name.clone();

    let handle = tokio::spawn(async move {
        if let Err(e) = stdin.write_all(&args_json).await {
            log::warn!("failed writing args to worker '{task_name}' stdin: {e}");
        }
        drop(stdin);

        let envelope = match child.wait_with_output().await {
            Ok(output) => decode_envelope(&output),
            Err(e) => Err(anyhow::Error::new(e).context("waiting for worker child")),
        };

        ChildOutcome {
            task_id,
            task_name,
            pid,
            envelope,
        }
    });

    Ok((pid, handle))
}

fn decode_envelope(output: &std::process::Output) -> Result<WorkerEnvelope> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    if let Some(line) = stdout.lines().last() {
        if let Ok(envelope) = serde_json::from_str::<WorkerEnvelope>(line) {
            return Ok(envelope);
        }
    }

    let stderr_tail: String = String::from_utf8_lossy(&output.stderr)
        .lines()
        .rev()
        .take(10)
        .collect::<Vec<_>>()
        .join("\n");
    Ok(WorkerEnvelope::Error {
        message: format!(
            "worker exited with status {:?} and produced no valid envelope. stderr tail:\n{stderr_tail}",
            output.status.code()
        ),
    })
}

async fn reap_slot(slot: RunningSlot) -> ChildOutcome {
    match slot.handle.await {
        Ok(outcome) => outcome,
        Err(join_err) => ChildOutcome {
            task_id: slot.task_id,
            task_name: format!("task_{}", slot.task_id),
            pid: slot.pid,
            envelope: Err(anyhow::anyhow!("worker task join failed: {join_err}")),
        },
    }
}

fn apply_outcome(store: &mut ResultStore, resource_mgr: &mut ResourceManager, outcome: ChildOutcome) {
    resource_mgr.reap(outcome.pid);

    match outcome.envelope {
        Ok(WorkerEnvelope::Result { value }) => {
            store.record_result(outcome.task_name, value);
        }
        Ok(WorkerEnvelope::Terminate { value }) => {
            log::error!("worker '{}' requested termination", outcome.task_name);
            store.record_result(outcome.task_name, value);
            store.set_terminated();
        }
        Ok(WorkerEnvelope::Error { message }) => {
            log::error!("worker '{}' failed: {message}", outcome.task_name);
            store.record_exception(outcome.task_name, ErrorRecord::new("WorkerFailure", message));
            store.set_terminated();
        }
        Ok(WorkerEnvelope::Interrupted) => {
            log::warn!("worker '{}' observed its own interrupt and exited without a result", outcome.task_name);
        }
        Err(e) => {
            log::error!("worker '{}' could not be joined: {e}", outcome.task_name);
            store.record_exception(outcome.task_name, ErrorRecord::new("WorkerFailure", e.to_string()));
            store.set_terminated();
        }
    }
}

/// Reserved for callers that want the logging folder resolved without
/// running a batch (e.g. pre-creating the directory tree before `Execute`).
pub fn resolve_logging_folder(options: &ExecuteOptions) -> PathBuf {
    options.logging_folder()
}
