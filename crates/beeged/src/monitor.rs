//! Host metrics sampling for docker status reports.
//!
//! A docker node periodically reports CPU, memory, swap and load of the host
//! it runs on. Samples are taken with `sysinfo` and encoded as
//! [`HostStatus`], the `docker_status` payload.
//!
//! # Panic-Free Guarantees
//!
//! All code follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Missing metrics (e.g. no load average on the platform) read as zero

use sysinfo::System;

use beege_core::unix_now;
use beege_protocol::HostStatus;

/// Samples host-wide metrics.
///
/// CPU usage is computed against the previous refresh, so the first sample
/// after construction reads as 0%. Later samples taken on the status tick
/// use the previous tick as their baseline.
pub struct StatusSampler {
    system: System,
}

impl StatusSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // Baseline for the first CPU delta
        system.refresh_cpu_usage();
        Self { system }
    }

    /// Refreshes and returns the current host status.
    pub fn sample(&mut self) -> HostStatus {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let load = System::load_average();

        HostStatus {
            cpu_percent: self.system.global_cpu_usage(),
            memory_total: self.system.total_memory(),
            memory_used: self.system.used_memory(),
            swap_total: self.system.total_swap(),
            swap_used: self.system.used_swap(),
            load_one: load.one,
            load_five: load.five,
            load_fifteen: load.fifteen,
            timestamp: unix_now(),
        }
    }
}

impl Default for StatusSampler {
    fn default() -> Self {
        Self::new()
    }
}
