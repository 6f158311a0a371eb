//! Host admission control
//!
//! Rejects work that would push host CPU or memory past the configured
//! thresholds. The check is side-effect free; it only samples.

use sysinfo::System;
use tracing::debug;

use crate::error::{DaemonError, Result};

/// Threshold check applied before instance creation and allocation
#[derive(Debug, Clone, Copy)]
pub struct AdmissionController {
    cpu_threshold: f32,
    memory_threshold: f32,
}

impl AdmissionController {
    pub fn new(cpu_threshold: f32, memory_threshold: f32) -> Self {
        Self {
            cpu_threshold,
            memory_threshold,
        }
    }

    /// Fail with `InsufficientResources` when either threshold is met or
    /// exceeded.
    ///
    /// CPU sampling needs two refreshes separated by a short interval to be
    /// meaningful, so the check deliberately sleeps between them.
    pub async fn check(&self) -> Result<()> {
        let mut sys = System::new();

        sys.refresh_memory();
        let memory = sys.used_memory() as f32 / sys.total_memory().max(1) as f32 * 100.0;
        if memory >= self.memory_threshold {
            return Err(DaemonError::InsufficientResources(format!(
                "Operation cancelled: not enough memory. Currently using: {:.2}%.",
                memory
            )));
        }

        sys.refresh_cpu_usage();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        sys.refresh_cpu_usage();
        let cpu = sys.global_cpu_usage();
        if cpu >= self.cpu_threshold {
            return Err(DaemonError::InsufficientResources(format!(
                "Operation cancelled: not enough CPU. Currently using: {:.2}%.",
                cpu
            )));
        }

        debug!("Admission passed: cpu {:.2}%, memory {:.2}%", cpu, memory);
        Ok(())
    }
}
