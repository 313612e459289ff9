// End-to-end coverage of §8's literal scenarios. These spawn the actual
// compiled `parallex` binary as worker children — `env!("CARGO_BIN_EXE_parallex")`
// resolves to this crate's own `main`, not the test binary, which is why
// `ExecuteOptions::worker_exe` exists (see SPEC_FULL.md §10.4).

use parallex::{registry, ExecuteOptions, ExecutorError};
use serde_json::json;
use std::sync::Arc;

fn options(num_jobs: usize) -> ExecuteOptions {
    let dir = tempfile::tempdir().unwrap();
    ExecuteOptions {
        num_jobs,
        sleep: 0.05,
        worker_exe: Some(std::path::PathBuf::from(env!("CARGO_BIN_EXE_parallex"))),
        logging_folder: Some(dir.into_path()),
        ..ExecuteOptions::default()
    }
}

#[tokio::test]
async fn trivial_map() {
    let args = vec![json!(0), json!(1), json!(2), json!(3), json!(4)];
    let batch = parallex::execute("increment", args, options(2), Arc::new(registry()))
        .await
        .expect("batch should succeed");

    assert_eq!(batch.results.len(), 5);
    assert!(batch.exceptions.is_empty());
    assert!(!batch.meta.terminated);
    for i in 0..5 {
        assert_eq!(batch.results[&format!("task_{i}")], json!(i as i64 + 1));
    }
}

#[tokio::test]
async fn single_failure() {
    let args = vec![json!(0), json!(1), json!(2), json!(3)];
    let err = parallex::execute("fail_on_two", args, options(4), Arc::new(registry()))
        .await
        .expect_err("batch should surface BatchFailed");

    match err {
        ExecutorError::BatchFailed { batch, .. } => {
            assert!(batch.meta.terminated);
            assert!(batch.exceptions.contains_key("task_2"));
            assert_eq!(batch.exceptions["task_2"].kind, "WorkerFailure");
            // task_2 failed before producing a result; everything that
            // finished before termination was observed still has one.
            assert!(!batch.results.contains_key("task_2"));
        }
        other => panic!("expected BatchFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn worker_initiated_terminate() {
    let args = vec![json!(0), json!(1), json!(2), json!(3)];
    let err = parallex::execute("terminate_on_one", args, options(1), Arc::new(registry()))
        .await
        .expect_err("batch should surface BatchFailed on worker-initiated terminate");

    match err {
        ExecutorError::BatchFailed { batch, .. } => {
            assert!(batch.meta.terminated);
            assert!(batch.results.contains_key("task_0"));
            assert!(batch.results.contains_key("task_1"));
            // At most one task may have been admitted beyond the one that
            // terminated (§8 scenario 3's "may spawn one more ... but not
            // more than one").
            let extra = ["task_2", "task_3"].iter().filter(|k| batch.results.contains_key(**k)).count();
            assert!(extra <= 1, "expected at most one task beyond the terminating one, got {extra}");
        }
        other => panic!("expected BatchFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_batch_is_trivially_drained() {
    let batch = parallex::execute("identity", vec![], options(4), Arc::new(registry()))
        .await
        .expect("an empty batch never fails");

    assert!(batch.results.is_empty());
    assert!(batch.exceptions.is_empty());
    assert!(!batch.meta.terminated);
}

#[tokio::test]
async fn num_jobs_clamps_to_task_count() {
    let args = vec![json!(0), json!(1)];
    let batch = parallex::execute("identity", args, options(50), Arc::new(registry()))
        .await
        .expect("batch should succeed");

    assert_eq!(batch.meta.n_jobs, 2);
    assert_eq!(batch.results.len(), 2);
}

#[tokio::test]
async fn use_cuda_with_empty_allowlist_fails_setup() {
    let mut opts = options(1);
    opts.use_cuda = true;
    opts.resource_config.gpu_config = parallex::GpuAllowlist::Explicit(vec![]);

    let err = parallex::execute("identity", vec![json!(0)], opts, Arc::new(registry()))
        .await
        .expect_err("use_cuda with an empty allowlist must fail at setup");

    assert!(matches!(err, ExecutorError::ResourceUnavailable(_)));
}

#[tokio::test]
async fn degraded_pool_collects_results_without_resource_manager() {
    let mut opts = options(2);
    opts.degraded_pool = true;
    let args = vec![json!(0), json!(1), json!(2), json!(3)];
    let batch = parallex::degraded::execute_degraded("increment", args, opts, Arc::new(registry()))
        .await
        .expect("degraded pool should succeed");

    assert_eq!(batch.results.len(), 4);
    assert!(!batch.meta.terminated);
}

#[tokio::test]
async fn degraded_pool_does_not_honor_terminate_sentinel() {
    let mut opts = options(4);
    opts.degraded_pool = true;
    let args = vec![json!(0), json!(1), json!(2), json!(3)];
    let batch = parallex::degraded::execute_degraded("terminate_on_one", args, opts, Arc::new(registry()))
        .await
        .expect("degraded pool ignores the terminate sentinel entirely");

    // Every task runs to completion; `terminate_on_one`'s sentinel is
    // recorded as a plain value, not honored as early-batch-end (§10.5).
    assert_eq!(batch.results.len(), 4);
    assert!(!batch.meta.terminated);
}
