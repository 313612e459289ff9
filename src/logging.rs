// src/logging.rs
//
// Per-task log sink (§6, "Logging sink"). The global `log`/`env_logger`
// singleton (wired up in main.rs, same as the teacher's own
// `env_logger::Builder::from_env(...)`) serves process-wide diagnostics; it
// cannot also serve one-file-per-task output opened and closed around a
// single task's lifetime in a *different* process, so this is a small,
// independent, file-backed logger instead — see SPEC_FULL.md §10.1.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// `init_logger(task_name)` — opens `<logging_folder>/<task_name>/<timestamp>.log`.
pub fn init_logger(logging_folder: &Path, task_name: &str) -> Result<TaskLogger> {
    let dir = logging_folder.join(task_name);
    fs::create_dir_all(&dir)
        .with_context(|| format!("creating log directory {:?}", dir))?;
    let path = dir.join(format!("{}.log", Utc::now().format("%Y%m%dT%H%M%S%.3f")));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening log file {:?}", path))?;
    Ok(TaskLogger {
        path,
        file: Arc::new(Mutex::new(file)),
    })
}

/// `log_method(msg, level)` — a thread-unsafe-but-process-confined handle
/// the adapter injects into the child. Process-confined here literally
/// means "confined to the child process": each child opens its own file
/// handle, there is no cross-process sharing to make atomic.
#[derive(Clone)]
pub struct TaskLogger {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl TaskLogger {
    pub fn log(&self, msg: &str, level: LogLevel) {
        let line = format!(
            "[{} {}] {}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            level.tag(),
            msg
        );
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `del_logger(task_name)` — flush and drop. Nothing further to do:
    /// the `File` handle closes on drop once the last clone is gone.
    pub fn close(self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}
