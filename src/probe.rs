// src/probe.rs
//
// The Probe (§4.A): stateless host queries. Readings are advisory snapshots
// that may briefly disagree with reality after a spawn or exit — callers
// must not assume exactness, only "close enough to gate admission".

use anyhow::{Context, Result};
use nvml_wrapper::Nvml;
use std::collections::HashMap;
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

// ============================================================================
// RAM PROBE
// ============================================================================

pub struct RamProbe {
    sys: System,
}

impl RamProbe {
    pub fn new() -> Self {
        let mut sys = System::new_with_specifics(RefreshKind::nothing().with_memory(Default::default()));
        sys.refresh_memory();
        Self { sys }
    }

    /// `available() -> {total: bytes_free}` for the single synthetic RAM unit.
    pub fn available_bytes(&mut self) -> u64 {
        self.sys.refresh_memory();
        self.sys.available_memory()
    }

    /// `usage(pid) -> amount`, in bytes resident for that process.
    pub fn usage_bytes(&mut self, pid: u32) -> Option<u64> {
        self.sys
            .refresh_processes_specifics(sysinfo::ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true, ProcessRefreshKind::nothing().with_memory());
        self.sys.process(Pid::from_u32(pid)).map(|p| p.memory())
    }
}

impl Default for RamProbe {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// GPU PROBE
// ============================================================================

/// Wraps an initialized NVML handle. Construction is fallible and the
/// caller is expected to treat initialization failure as "no GPU
/// information this cycle" — see `GpuProbe::init`.
pub struct GpuProbe {
    nvml: Nvml,
}

impl GpuProbe {
    /// Attempts to initialize NVML. Returns `None` (rather than erroring)
    /// when no NVIDIA driver is present, matching the graceful-degradation
    /// pattern used for optional GPU support elsewhere in the ecosystem:
    /// log a warning and keep running without GPU accounting.
    pub fn init() -> Option<Self> {
        match Nvml::init() {
            Ok(nvml) => Some(Self { nvml }),
            Err(e) => {
                log::warn!("NVML initialization failed: {e}. Running without GPU support.");
                None
            }
        }
    }

    pub fn device_count(&self) -> Result<usize> {
        Ok(self.nvml.device_count().context("nvml device_count")? as usize)
    }

    /// `available() -> map[unit_id -> amount]`, one entry per visible device.
    pub fn available_bytes(&self, device_id: usize) -> Result<u64> {
        let device = self
            .nvml
            .device_by_index(device_id as u32)
            .with_context(|| format!("nvml device_by_index({device_id})"))?;
        Ok(device.memory_info().context("nvml memory_info")?.free)
    }

    /// `usage_by_pid(pids) -> map[pid -> amount]` for one device.
    pub fn usage_by_pid(&self, device_id: usize) -> Result<HashMap<u32, u64>> {
        let device = self
            .nvml
            .device_by_index(device_id as u32)
            .with_context(|| format!("nvml device_by_index({device_id})"))?;
        let mut out = HashMap::new();
        for proc in device
            .running_compute_processes()
            .context("nvml running_compute_processes")?
        {
            let used = match proc.used_gpu_memory {
                nvml_wrapper::enum_wrappers::device::UsedGpuMemory::Used(bytes) => bytes,
                nvml_wrapper::enum_wrappers::device::UsedGpuMemory::Unavailable => 0,
            };
            out.insert(proc.pid, used);
        }
        Ok(out)
    }
}
