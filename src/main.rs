// src/main.rs
//
// =============================================================================
// PARALLEX: ENTRY POINT
// =============================================================================
//
// Two faces of the same binary:
//
// 1. Worker mode (§4.C.2): when re-exec'd by the supervisor with
//    `EXECUTOR_WORKER_MODE=1` set, this process is a *child* — it never
//    touches the CLI, it reads its task off env vars + stdin, runs the
//    named worker, and writes one JSON envelope to stdout.
// 2. CLI mode: the normal entry point a human or a driver script uses to
//    run a batch (`run`) or inspect what's registered (`list-workers`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parallex::{ExecuteOptions, ExecutorError};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "parallex", version, about = "Resource-aware parallel task executor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a batch of tasks against a registered worker.
    Run {
        /// Name of a worker registered in `parallex::registry()`.
        #[arg(long)]
        worker: String,

        /// Path to a JSON file holding an array of per-task argument values.
        #[arg(long)]
        args_file: PathBuf,

        /// Optional YAML file of `ExecuteOptions` overrides (§10.3).
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        num_jobs: Option<usize>,

        #[arg(long)]
        sleep: Option<f64>,

        #[arg(long)]
        use_cuda: bool,

        #[arg(long)]
        logging_folder: Option<PathBuf>,

        /// Opt into the degraded library-pool fallback (§10.5).
        #[arg(long)]
        degraded_pool: bool,
    },

    /// List the names of workers this binary knows how to run.
    ListWorkers,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let registry = Arc::new(parallex::registry());

    // Worker mode must be checked before any CLI parsing: the re-exec'd
    // child carries no argv the CLI would understand, only env vars.
    if parallex::worker::is_worker_mode() {
        parallex::run_worker_child(&registry).await;
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::ListWorkers => {
            for name in registry.names() {
                println!("{name}");
            }
            Ok(())
        }
        Commands::Run { worker, args_file, config, num_jobs, sleep, use_cuda, logging_folder, degraded_pool } => {
            let mut options = match &config {
                Some(path) => parallex::config::load_options(path)?,
                None => ExecuteOptions::default(),
            };
            if let Some(n) = num_jobs {
                options.num_jobs = n;
            }
            if let Some(s) = sleep {
                options.sleep = s;
            }
            if use_cuda {
                options.use_cuda = true;
            }
            if let Some(folder) = logging_folder {
                options.logging_folder = Some(folder);
            }
            if degraded_pool {
                options.degraded_pool = true;
            }

            let raw = std::fs::read_to_string(&args_file)
                .with_context(|| format!("reading args file {args_file:?}"))?;
            let args_list: Vec<serde_json::Value> = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {args_file:?} as a JSON array"))?;

            let worker_name: &'static str = registry
                .names()
                .into_iter()
                .find(|n| *n == worker.as_str())
                .with_context(|| format!("no worker registered under name '{worker}'"))?;

            let result = if options.degraded_pool {
                parallex::degraded::execute_degraded(worker_name, args_list, options, registry).await
            } else {
                parallex::execute(worker_name, args_list, options, registry).await
            };

            match result {
                Ok(batch) => {
                    println!("{}", serde_json::to_string_pretty(&batch)?);
                    Ok(())
                }
                Err(ExecutorError::BatchFailed { batch, reason }) => {
                    println!("{}", serde_json::to_string_pretty(&batch)?);
                    eprintln!("batch failed: {reason}");
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("setup failed: {e}");
                    std::process::exit(2);
                }
            }
        }
    }
}
