//! Host pressure checks before each query.
//!
//! A learning run can last days. Results taken while the host is
//! thrashing produce spurious timeouts, so the engine aborts on memory or
//! disk exhaustion and waits out CPU spikes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tracing::warn;

/// Host usage thresholds, in percent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Abort at or above this memory usage.
    pub max_memory_percent: f32,
    /// Abort at or above this usage of the disk holding the log directory.
    pub max_disk_percent: f32,
    /// Pause while CPU usage is above this.
    pub max_cpu_percent: f32,
    /// Pause between CPU rechecks (milliseconds).
    pub cpu_pause_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_percent: 90.0,
            max_disk_percent: 99.0,
            max_cpu_percent: 90.0,
            cpu_pause_ms: 1000,
        }
    }
}

/// One sample of host usage, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostUsage {
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub cpu_percent: f32,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LimitViolation {
    #[error("Memory usage too high ({usage:.1}%, max {max:.1}%)")]
    Memory { usage: f32, max: f32 },

    #[error("Disk usage too high ({usage:.1}%, max {max:.1}%)")]
    Disk { usage: f32, max: f32 },
}

/// Source of host usage samples.
pub trait HostProbe {
    fn sample(&mut self) -> HostUsage;
}

/// Samples the real host through `sysinfo`.
pub struct SysinfoProbe {
    system: System,
    disk_path: PathBuf,
}

impl SysinfoProbe {
    /// Probe the host, measuring disk usage on the disk that holds `path`.
    pub fn new(path: &Path) -> Self {
        let disk_path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        Self {
            system: System::new_all(),
            disk_path,
        }
    }

    fn disk_percent(&self) -> f32 {
        let disks = Disks::new_with_refreshed_list();
        // Longest mount point containing the path.
        disks
            .iter()
            .filter(|d| self.disk_path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| used_percent(d.total_space(), d.available_space()))
            .unwrap_or(0.0)
    }
}

/// Share of `total` not `available`. Filesystems may report more
/// available than total space, which counts as empty.
fn used_percent(total: u64, available: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    let used = total.saturating_sub(available);
    (used as f64 / total as f64 * 100.0) as f32
}

impl HostProbe for SysinfoProbe {
    fn sample(&mut self) -> HostUsage {
        self.system.refresh_memory();
        self.system.refresh_cpu();
        let total = self.system.total_memory();
        let memory_percent = if total > 0 {
            (self.system.used_memory() as f64 / total as f64 * 100.0) as f32
        } else {
            0.0
        };
        HostUsage {
            memory_percent,
            disk_percent: self.disk_percent(),
            cpu_percent: self.system.global_cpu_info().cpu_usage(),
        }
    }
}

/// Check host usage against limits.
pub struct ResourceGuard<P: HostProbe> {
    limits: ResourceLimits,
    probe: P,
}

impl<P: HostProbe> ResourceGuard<P> {
    pub fn new(limits: ResourceLimits, probe: P) -> Self {
        Self { limits, probe }
    }

    /// Block while the CPU is saturated, then fail if memory or disk is
    /// exhausted. Returns how many times it paused.
    pub fn check(&mut self) -> Result<u32, LimitViolation> {
        let mut usage = self.probe.sample();
        if usage.memory_percent >= self.limits.max_memory_percent {
            return Err(LimitViolation::Memory {
                usage: usage.memory_percent,
                max: self.limits.max_memory_percent,
            });
        }
        if usage.disk_percent >= self.limits.max_disk_percent {
            return Err(LimitViolation::Disk {
                usage: usage.disk_percent,
                max: self.limits.max_disk_percent,
            });
        }
        let mut pauses = 0;
        while usage.cpu_percent > self.limits.max_cpu_percent {
            if pauses == 0 {
                warn!(cpu = usage.cpu_percent, "CPU saturated, pausing");
            }
            pauses += 1;
            std::thread::sleep(Duration::from_millis(self.limits.cpu_pause_ms));
            usage = self.probe.sample();
        }
        Ok(pauses)
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }
}
