//! Resource utilization sources for the adaptive limiter.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::System;

/// Full utilization, in per-mille.
pub const FULL_UTILIZATION: u64 = 1000;

/// Something that can report current resource utilization.
pub trait UtilizationSource: Send + Sync {
    /// Current utilization in per-mille (`0..=1000`).
    fn sample(&self) -> u64;
}

/// Host CPU usage normalized against an effective CPU quota.
pub struct SystemCpu {
    system: Mutex<System>,
    /// Cores visible to the process
    cores: f64,
    /// Cores the process is allowed to use
    quota: f64,
}

impl SystemCpu {
    pub fn new(quota: f64) -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        let cores = system.cpus().len().max(1) as f64;
        let quota = if quota > 0.0 { quota.min(cores) } else { cores };
        Self {
            system: Mutex::new(system),
            cores,
            quota,
        }
    }
}

impl UtilizationSource for SystemCpu {
    fn sample(&self) -> u64 {
        let usage = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.global_cpu_usage() as f64
        };
        // global usage is averaged over every core; rescale to the quota
        let permille = usage * 10.0 * self.cores / self.quota;
        (permille.round() as u64).min(FULL_UTILIZATION)
    }
}

/// A utilization value set from outside, e.g. by a supervisor or a test.
#[derive(Debug, Default)]
pub struct StaticUtilization {
    value: AtomicU64,
}

impl StaticUtilization {
    pub fn new(permille: u64) -> Self {
        Self {
            value: AtomicU64::new(permille.min(FULL_UTILIZATION)),
        }
    }

    pub fn set(&self, permille: u64) {
        self.value
            .store(permille.min(FULL_UTILIZATION), Ordering::Relaxed);
    }
}

impl UtilizationSource for StaticUtilization {
    fn sample(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}
