//! Host resource sampling
//!
//! Process memory plus host-wide CPU and memory usage, refreshed once per
//! metrics tick.

use sysinfo::{
    CpuRefreshKind, MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind,
    System,
};

/// One sample of host statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemStats {
    /// Resident memory of this process in bytes
    pub process_memory_bytes: u64,
    /// Host-wide used memory percentage (0.0 - 100.0)
    pub memory_percent: f64,
    /// Host-wide CPU usage percentage (0.0 - 100.0)
    pub cpu_percent: f64,
}

/// Keeps a `sysinfo::System` alive between samples
///
/// CPU usage is computed from the delta between two refreshes, so the first
/// sample reports 0.
pub struct SystemSampler {
    system: System,
    pid: Option<Pid>,
}

impl SystemSampler {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::nothing().with_cpu_usage())
                .with_memory(MemoryRefreshKind::nothing().with_ram()),
        );

        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!("Could not determine own PID, process memory disabled: {}", e);
                None
            }
        };

        let mut sampler = Self { system, pid };
        sampler.refresh();
        sampler
    }

    fn refresh(&mut self) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        if let Some(pid) = self.pid {
            self.system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_memory(),
            );
        }
    }

    /// Refresh and read current statistics
    pub fn sample(&mut self) -> SystemStats {
        self.refresh();

        let process_memory_bytes = self
            .pid
            .and_then(|pid| self.system.process(pid))
            .map(|p| p.memory())
            .unwrap_or(0);

        let total = self.system.total_memory();
        let memory_percent = if total > 0 {
            self.system.used_memory() as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        SystemStats {
            process_memory_bytes,
            memory_percent,
            cpu_percent: f64::from(self.system.global_cpu_usage()),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}
