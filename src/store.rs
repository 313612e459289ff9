// src/store.rs
//
// The Shared Result Store (§4.E). Realized as a plain in-parent map, not a
// concurrent one — see SPEC_FULL.md §4.E: children post their envelope over
// a pipe, the parent is the sole writer, so there is no cross-thread race
// to guard against and no proxy-object aliasing to worry about.

use crate::types::{Batch, BatchMeta, ErrorRecord};
use serde_json::Value;
use std::collections::HashMap;

pub struct ResultStore {
    n_jobs: usize,
    n_tasks: usize,
    terminated: bool,
    results: HashMap<String, Value>,
    exceptions: HashMap<String, ErrorRecord>,
}

impl ResultStore {
    pub fn new(n_jobs: usize, n_tasks: usize) -> Self {
        Self {
            n_jobs,
            n_tasks,
            terminated: false,
            results: HashMap::new(),
            exceptions: HashMap::new(),
        }
    }

    pub fn record_result(&mut self, task_name: String, value: Value) {
        self.results.insert(task_name, value);
    }

    /// Records a task's failure. Deliberately does not also populate
    /// `results[task_name]` — a failed task has no value, only an entry
    /// under `exceptions`, per §4.C step 5.
    pub fn record_exception(&mut self, task_name: String, record: ErrorRecord) {
        self.exceptions.insert(task_name, record);
    }

    /// Records the interrupt/umbrella exception under the reserved `"base"`
    /// key used by the interrupt scenario (§8 scenario 6).
    pub fn record_base_exception(&mut self, record: ErrorRecord) {
        self.exceptions.insert("base".to_string(), record);
    }

    pub fn set_terminated(&mut self) {
        self.terminated = true;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn exceptions_is_empty(&self) -> bool {
        self.exceptions.is_empty()
    }

    pub fn into_batch(self) -> Batch {
        Batch {
            results: self.results,
            exceptions: self.exceptions,
            meta: BatchMeta {
                n_jobs: self.n_jobs,
                n_tasks: self.n_tasks,
                terminated: self.terminated,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_and_meta_reflects_construction() {
        let mut store = ResultStore::new(2, 3);
        store.record_result("task_0".to_string(), Value::from(1));
        store.record_result("task_1".to_string(), Value::from(2));

        let batch = store.into_batch();
        assert_eq!(batch.results.len(), 2);
        assert_eq!(batch.meta.n_jobs, 2);
        assert_eq!(batch.meta.n_tasks, 3);
        assert!(!batch.meta.terminated);
        assert!(batch.exceptions.is_empty());
    }

    #[test]
    fn exception_is_not_mirrored_into_results() {
        let mut store = ResultStore::new(1, 1);
        store.record_exception("task_0".to_string(), ErrorRecord::new("ValueError", "boom"));

        assert!(!store.exceptions_is_empty());
        let batch = store.into_batch();
        assert!(!batch.results.contains_key("task_0"));
        assert_eq!(batch.exceptions["task_0"].kind, "ValueError");
    }

    #[test]
    fn base_exception_uses_reserved_key() {
        let mut store = ResultStore::new(1, 1);
        store.record_base_exception(ErrorRecord::new("Interrupted", "interrupted by operator"));
        store.set_terminated();

        assert!(store.is_terminated());
        let batch = store.into_batch();
        assert!(batch.exceptions.contains_key("base"));
        assert!(batch.meta.terminated);
    }
}
