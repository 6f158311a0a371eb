//! Background job definitions and their executor

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::engine::{JobHandler, RetryPolicy};
use crate::error::DaemonError;
use crate::lifecycle::Coordinator;
use crate::monitor::Monitor;

/// Background work items
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Job {
    /// Create one pool instance
    CreateInstance,

    /// Poll a starting instance until its IPC endpoint answers
    WaitForReady { instance_id: i64 },

    /// Pause an instance so it idles warm in the pool
    Deallocate { instance_id: i64 },

    /// Force-remove a container, unpausing it first if needed
    RemoveContainer { docker_id: String },

    /// Reconciler restart pass
    Monitor,

    /// Reconciler reap pass, sparing the freshly restarted set
    Reap { restarted: Vec<i64> },
}

/// Runs jobs against the lifecycle coordinator and the reconciler
pub struct JobExecutor {
    coordinator: Arc<Coordinator>,
    monitor: Arc<Monitor>,
    ready_policy: RetryPolicy,
}

impl JobExecutor {
    pub fn new(
        coordinator: Arc<Coordinator>,
        monitor: Arc<Monitor>,
        ready_max_retries: u32,
        ready_retry_delay: Duration,
    ) -> Self {
        Self {
            coordinator,
            monitor,
            ready_policy: RetryPolicy {
                max_retries: ready_max_retries,
                delay: ready_retry_delay,
            },
        }
    }
}

#[async_trait]
impl JobHandler for JobExecutor {
    fn retry_policy(&self, job: &Job) -> RetryPolicy {
        match job {
            Job::WaitForReady { .. } => self.ready_policy,
            _ => RetryPolicy::NONE,
        }
    }

    async fn run(&self, job: &Job) -> Result<Option<Job>, DaemonError> {
        match job {
            Job::CreateInstance => {
                self.coordinator.create_instance().await?;
                Ok(None)
            }
            Job::WaitForReady { instance_id } => self.coordinator.check_ready(*instance_id).await,
            Job::Deallocate { instance_id } => {
                self.coordinator.deallocate_instance(*instance_id).await?;
                Ok(None)
            }
            Job::RemoveContainer { docker_id } => {
                self.coordinator.remove_container(docker_id).await;
                Ok(None)
            }
            Job::Monitor => {
                let restarted = self.monitor.restart_pass().await?;
                Ok(Some(Job::Reap { restarted }))
            }
            Job::Reap { restarted } => {
                self.monitor.reap_pass(restarted).await?;
                Ok(None)
            }
        }
    }

    async fn exhausted(&self, job: &Job) {
        if let Job::WaitForReady { instance_id } = job {
            warn!(
                "Instance {} never answered its readiness probe, marking erroneous",
                instance_id
            );
            if let Err(e) = self.coordinator.mark_error(*instance_id).await {
                warn!("Failed to mark instance {} erroneous: {}", instance_id, e);
            }
        }
    }
}
