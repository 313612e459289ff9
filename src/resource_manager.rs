// src/resource_manager.rs
//
// =============================================================================
// PARALLEX: RESOURCE MANAGER (§4.B)
// =============================================================================
//
// Inventories RAM and GPU, estimates each task's expected usage, admits or
// defers launches, and tracks live workers' residency. This is the Rust
// generalization of the teacher's `ResourceLedger` bitmask allocator —
// instead of core/GPU bitmasks it tracks continuous RAM/GPU-memory headroom
// against a running estimate, per the admission algorithm in SPEC_FULL.md.

use crate::error::ExecutorError;
use crate::probe::{GpuProbe, RamProbe};
use crate::types::{ExecuteOptions, GpuAllowlist, WorkerRecord};
use std::collections::{HashMap, HashSet};

const RAM_BOOTSTRAP_BYTES: u64 = 64 * 1024 * 1024;
const GPU_BOOTSTRAP_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug)]
pub enum Admission {
    /// Launch now. `device` is `Some` only when `use_cuda` is set.
    Admit { device: Option<usize> },
    /// Not enough headroom this cycle; try again next poll.
    Defer,
    /// `refresh_patience` exceeded for this task id with no progress;
    /// the supervisor requeues it to the tail of the pending list.
    SkipExhausted,
    /// Termination flag was already set; do not launch.
    Rejected,
}

pub struct ResourceManager {
    ram_probe: RamProbe,
    gpu_probe: Option<GpuProbe>,
    gpu_allowlist: Vec<usize>,
    use_cuda: bool,
    refresh_patience: u32,

    ram_available: u64,
    gpu_available: HashMap<usize, u64>,
    ram_reserved: u64,
    gpu_reserved: HashMap<usize, u64>,
    gpu_busy: HashSet<usize>,

    ram_estimate: u64,
    gpu_estimate: u64,

    patience: HashMap<usize, u32>,
    workers: HashMap<u32, WorkerRecord>,
}

impl ResourceManager {
    /// Registers kinds and resolves the GPU allowlist. Fails setup with
    /// `ResourceUnavailable` exactly when `use_cuda` is requested but no
    /// device is enumerable — either NVML never initialized or the caller
    /// passed an explicit empty `available_cuda_list`.
    pub fn new(options: &ExecuteOptions) -> Result<Self, ExecutorError> {
        let gpu_probe = GpuProbe::init();

        let gpu_allowlist = match &options.resource_config.gpu_config {
            GpuAllowlist::All => match &gpu_probe {
                Some(probe) => {
                    let count = probe.device_count().unwrap_or(0);
                    (0..count).collect()
                }
                None => Vec::new(),
            },
            GpuAllowlist::Explicit(list) => list.clone(),
        };

        if options.use_cuda && (gpu_probe.is_none() || gpu_allowlist.is_empty()) {
            return Err(ExecutorError::ResourceUnavailable(
                "use_cuda requested but no GPU device is enumerable (NVML unavailable or \
                 available_cuda_list resolved to an empty set)"
                    .to_string(),
            ));
        }

        Ok(Self {
            ram_probe: RamProbe::new(),
            gpu_probe,
            gpu_allowlist,
            use_cuda: options.use_cuda,
            refresh_patience: options.resource_config.refresh_patience,
            ram_available: 0,
            gpu_available: HashMap::new(),
            ram_reserved: 0,
            gpu_reserved: HashMap::new(),
            gpu_busy: HashSet::new(),
            ram_estimate: RAM_BOOTSTRAP_BYTES,
            gpu_estimate: GPU_BOOTSTRAP_BYTES,
            patience: HashMap::new(),
            workers: HashMap::new(),
        })
    }

    /// One refresh cycle: re-read `available[*]`, re-read per-PID residency
    /// for running workers, and refine the running estimate from the
    /// maximum observed usage — per the admission algorithm's step 2.
    pub fn refresh(&mut self) {
        self.ram_available = self.ram_probe.available_bytes();

        if let Some(probe) = &self.gpu_probe {
            for &device in &self.gpu_allowlist {
                match probe.available_bytes(device) {
                    Ok(bytes) => {
                        self.gpu_available.insert(device, bytes);
                    }
                    Err(e) => log::debug!("gpu probe unavailable for device {device}: {e}"),
                }
            }
        }

        let pids: Vec<u32> = self.workers.keys().copied().collect();
        let mut max_ram = 0u64;
        let mut max_gpu = 0u64;

        for pid in pids {
            if let Some(bytes) = self.ram_probe.usage_bytes(pid) {
                max_ram = max_ram.max(bytes);
                if let Some(record) = self.workers.get_mut(&pid) {
                    record.ram_usage = bytes;
                }
            }

            let device = self.workers.get(&pid).and_then(|r| r.cuda_device);
            if let (Some(probe), Some(device)) = (&self.gpu_probe, device) {
                if let Ok(usage) = probe.usage_by_pid(device) {
                    if let Some(&bytes) = usage.get(&pid) {
                        max_gpu = max_gpu.max(bytes);
                        if let Some(record) = self.workers.get_mut(&pid) {
                            record.gpu_usage = bytes;
                        }
                    }
                }
            }
        }

        if max_ram > 0 {
            self.ram_estimate = max_ram;
        }
        if max_gpu > 0 {
            self.gpu_estimate = max_gpu;
        }

        log::debug!(
            "refresh: ram_available={} ram_reserved={} ram_estimate={} gpu_available={:?} gpu_reserved={:?}",
            self.ram_available,
            self.ram_reserved,
            self.ram_estimate,
            self.gpu_available,
            self.gpu_reserved
        );
    }

    /// Admission algorithm, §4.B steps 1–4. Step 5 (recording the
    /// reservation) is split out into `reserve` so the supervisor can spawn
    /// the child and learn its PID before committing the reservation under
    /// that PID's key.
    pub fn try_admit(&mut self, task_id: usize, terminated: bool) -> Admission {
        if terminated {
            return Admission::Rejected;
        }

        if self.ram_available < self.ram_estimate + self.ram_reserved {
            return self.defer(task_id);
        }

        let device = if self.use_cuda {
            let best = self
                .gpu_allowlist
                .iter()
                .copied()
                .filter(|d| !self.gpu_busy.contains(d))
                .max_by_key(|d| self.gpu_headroom(*d));

            match best {
                Some(d) if self.gpu_headroom(d) >= self.gpu_estimate => Some(d),
                _ => return self.defer(task_id),
            }
        } else {
            None
        };

        self.patience.remove(&task_id);
        Admission::Admit { device }
    }

    fn gpu_headroom(&self, device: usize) -> u64 {
        let available = *self.gpu_available.get(&device).unwrap_or(&0);
        let reserved = *self.gpu_reserved.get(&device).unwrap_or(&0);
        available.saturating_sub(reserved)
    }

    fn defer(&mut self, task_id: usize) -> Admission {
        let counter = self.patience.entry(task_id).or_insert(0);
        *counter += 1;
        if *counter > self.refresh_patience {
            self.patience.remove(&task_id);
            Admission::SkipExhausted
        } else {
            Admission::Defer
        }
    }

    /// Records the reservation for a newly-spawned child. Must be called
    /// with the same `device` the matching `Admission::Admit` returned.
    pub fn reserve(&mut self, pid: u32, task_id: usize, task_name: String, device: Option<usize>) {
        self.ram_reserved += self.ram_estimate;
        if let Some(d) = device {
            self.gpu_busy.insert(d);
            *self.gpu_reserved.entry(d).or_insert(0) += self.gpu_estimate;
        }

        self.workers.insert(
            pid,
            WorkerRecord {
                pid,
                task_id,
                task_name,
                cuda_device: device,
                reserved_ram: self.ram_estimate,
                reserved_gpu: if device.is_some() { self.gpu_estimate } else { 0 },
                ram_usage: self.ram_estimate,
                gpu_usage: 0,
                start_time: chrono::Utc::now(),
            },
        );
    }

    /// Releases reservations tied to a finished worker and returns its
    /// record so the supervisor can close the per-task logger.
    pub fn reap(&mut self, pid: u32) -> Option<WorkerRecord> {
        let record = self.workers.remove(&pid)?;
        self.ram_reserved = self.ram_reserved.saturating_sub(record.reserved_ram);
        if let Some(device) = record.cuda_device {
            self.gpu_busy.remove(&device);
            if let Some(r) = self.gpu_reserved.get_mut(&device) {
                *r = r.saturating_sub(record.reserved_gpu);
            }
        }
        Some(record)
    }

    pub fn live_worker_count(&self) -> usize {
        self.workers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecuteOptions;

    fn manager(gpu_config: GpuAllowlist) -> ResourceManager {
        let options = ExecuteOptions {
            use_cuda: false,
            resource_config: crate::types::ResourceConfig {
                refresh_patience: 2,
                gpu_config,
            },
            ..ExecuteOptions::default()
        };
        ResourceManager::new(&options).unwrap()
    }

    /// Builds a manager through the normal (non-cuda) constructor path, then
    /// flips it into cuda mode by hand. This test environment has no NVML
    /// device, so constructing directly with `use_cuda: true` would hit the
    /// setup-time `ResourceUnavailable` gate this module also tests below —
    /// these helpers exist to exercise `try_admit`'s GPU branch in isolation
    /// from that gate.
    fn cuda_manager(allowlist: Vec<usize>) -> ResourceManager {
        let mut mgr = manager(GpuAllowlist::Explicit(allowlist.clone()));
        mgr.use_cuda = true;
        mgr.gpu_allowlist = allowlist;
        mgr
    }

    #[test]
    fn use_cuda_with_empty_allowlist_fails_setup() {
        let options = ExecuteOptions {
            use_cuda: true,
            resource_config: crate::types::ResourceConfig {
                refresh_patience: 2,
                gpu_config: GpuAllowlist::Explicit(vec![]),
            },
            ..ExecuteOptions::default()
        };
        assert!(matches!(ResourceManager::new(&options), Err(ExecutorError::ResourceUnavailable(_))));
    }

    #[test]
    fn use_cuda_with_no_gpu_probe_fails_setup() {
        // A non-empty allowlist alone isn't enough: without an initialized
        // NVML handle there is no way to ever read headroom for it, so
        // `use_cuda` must fail setup here too (this sandbox has no NVML).
        let options = ExecuteOptions {
            use_cuda: true,
            resource_config: crate::types::ResourceConfig {
                refresh_patience: 2,
                gpu_config: GpuAllowlist::Explicit(vec![0, 1]),
            },
            ..ExecuteOptions::default()
        };
        assert!(matches!(ResourceManager::new(&options), Err(ExecutorError::ResourceUnavailable(_))));
    }

    #[test]
    fn defers_until_ram_available_then_admits() {
        let mut mgr = manager(GpuAllowlist::All);
        // Freshly constructed: ram_available starts at 0, estimate is the
        // bootstrap figure, so the first admission attempt must defer.
        assert!(matches!(mgr.try_admit(0, false), Admission::Defer));
        mgr.ram_available = RAM_BOOTSTRAP_BYTES * 4;
        assert!(matches!(mgr.try_admit(0, false), Admission::Admit { device: None }));
    }

    #[test]
    fn exhausts_patience_after_repeated_defers() {
        let mut mgr = manager(GpuAllowlist::All);
        // refresh_patience is 2: the 1st and 2nd defer, the 3rd gives up.
        assert!(matches!(mgr.try_admit(7, false), Admission::Defer));
        assert!(matches!(mgr.try_admit(7, false), Admission::Defer));
        assert!(matches!(mgr.try_admit(7, false), Admission::SkipExhausted));
    }

    #[test]
    fn terminated_flag_rejects_before_checking_headroom() {
        let mut mgr = manager(GpuAllowlist::All);
        assert!(matches!(mgr.try_admit(0, true), Admission::Rejected));
    }

    #[test]
    fn gpu_admission_prefers_device_with_more_headroom() {
        let mut mgr = cuda_manager(vec![0, 1]);
        mgr.ram_available = RAM_BOOTSTRAP_BYTES * 4;
        mgr.gpu_available.insert(0, GPU_BOOTSTRAP_BYTES * 4);
        mgr.gpu_available.insert(1, GPU_BOOTSTRAP_BYTES / 2);

        match mgr.try_admit(0, false) {
            Admission::Admit { device: Some(0) } => {}
            other => panic!("expected device 0 to be picked, got {other:?}"),
        }
    }

    #[test]
    fn gpu_admission_defers_when_every_device_is_too_small() {
        let mut mgr = cuda_manager(vec![0]);
        mgr.ram_available = RAM_BOOTSTRAP_BYTES * 4;
        mgr.gpu_available.insert(0, GPU_BOOTSTRAP_BYTES / 2);
        assert!(matches!(mgr.try_admit(0, false), Admission::Defer));
    }

    #[test]
    fn reserve_then_reap_releases_ram_and_gpu_capacity() {
        let mut mgr = cuda_manager(vec![0]);
        mgr.ram_available = RAM_BOOTSTRAP_BYTES * 4;
        mgr.gpu_available.insert(0, GPU_BOOTSTRAP_BYTES * 4);

        mgr.reserve(123, 0, "task_0".to_string(), Some(0));
        assert_eq!(mgr.ram_reserved, RAM_BOOTSTRAP_BYTES);
        assert!(mgr.gpu_busy.contains(&0));
        assert_eq!(mgr.live_worker_count(), 1);

        // The device is busy, so a second task cannot be admitted onto it.
        assert!(matches!(mgr.try_admit(1, false), Admission::Defer));

        let record = mgr.reap(123).expect("worker record should be returned");
        assert_eq!(record.task_name, "task_0");
        assert_eq!(mgr.ram_reserved, 0);
        assert!(!mgr.gpu_busy.contains(&0));
        assert_eq!(mgr.live_worker_count(), 0);
        assert!(mgr.reap(123).is_none());
    }
}
