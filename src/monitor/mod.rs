//! Reconciler restoring invariants between the instance store and the
//! container runtime
//!
//! One pass is a chained pair of jobs: a restart pass that revives cleanly
//! exited containers, then a reap pass that finishes off erroneous instances
//! the restart pass did not rescue.

use std::sync::Arc;

use regex::Regex;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{info, warn};

use crate::database::{Database, InstanceStatus};
use crate::error::Result;
use crate::runtime::ContainerRuntime;
use crate::tasks::{Job, TaskQueue};

/// Periodic sweep over exited and erroneous instances
pub struct Monitor {
    db: Arc<Database>,
    runtime: Arc<dyn ContainerRuntime>,
    queue: TaskQueue,
    image: String,
    exit_pattern: Regex,
}

impl Monitor {
    pub fn new(
        db: Arc<Database>,
        runtime: Arc<dyn ContainerRuntime>,
        queue: TaskQueue,
        image: String,
    ) -> Self {
        Self {
            db,
            runtime,
            queue,
            image,
            // Docker reports exited containers as "Exited (<code>) ...".
            exit_pattern: Regex::new(r"Exited \((\d+)\)").expect("static pattern"),
        }
    }

    fn exit_code(&self, status: &str) -> Option<i64> {
        self.exit_pattern
            .captures(status)
            .and_then(|caps| caps.get(1))
            .and_then(|code| code.as_str().parse().ok())
    }

    /// Restart cleanly exited containers of our image.
    ///
    /// Returns the instances brought back to STARTING so the reap pass
    /// leaves them alone. Containers that exited with a non-zero code, or
    /// whose start call fails, are marked erroneous instead.
    pub async fn restart_pass(&self) -> Result<Vec<i64>> {
        let mut restarted = Vec::new();

        for container in self.runtime.list_exited().await? {
            if container.image != self.image {
                continue;
            }
            let Some(code) = self.exit_code(&container.status) else {
                continue;
            };
            let Some(instance) = self.db.instance_by_docker_id(&container.id).await? else {
                continue;
            };

            if code != 0 {
                warn!(
                    "Instance {} exited with code {}, marking erroneous",
                    instance.id, code
                );
                self.db
                    .set_instance_status(instance.id, InstanceStatus::Error)
                    .await?;
                continue;
            }

            self.db
                .set_instance_status(instance.id, InstanceStatus::Starting)
                .await?;
            match self.runtime.start(&container.id).await {
                Ok(()) => {
                    info!("Restarted instance {}", instance.id);
                    self.queue.enqueue(Job::WaitForReady {
                        instance_id: instance.id,
                    });
                    restarted.push(instance.id);
                }
                Err(e) => {
                    warn!("Failed to restart instance {}: {}", instance.id, e);
                    self.db
                        .set_instance_status(instance.id, InstanceStatus::Error)
                        .await?;
                }
            }
        }

        Ok(restarted)
    }

    /// Finish every erroneous instance the restart pass did not rescue,
    /// releasing its port and scheduling container removal.
    pub async fn reap_pass(&self, restarted: &[i64]) -> Result<Vec<i64>> {
        let mut reaped = Vec::new();

        for instance in self.db.instances_erroneous().await? {
            if restarted.contains(&instance.id) {
                continue;
            }
            info!("Reaping erroneous instance {}", instance.id);
            self.db.finish_instance(instance.id).await?;
            self.queue.enqueue(Job::RemoveContainer {
                docker_id: instance.docker_id.clone(),
            });
            reaped.push(instance.id);
        }

        Ok(reaped)
    }

    /// Reconcile persisted state against the live container list after a
    /// daemon restart.
    ///
    /// Instances whose container is gone or stopped become erroneous (the
    /// next pass restarts or reaps them); starting instances that are still
    /// running get their readiness wait re-scheduled, since the original
    /// wait died with the previous process.
    pub async fn reconcile_on_boot(&self) -> Result<()> {
        for instance in self.db.instances_active().await? {
            match self.runtime.inspect(&instance.docker_id).await {
                Ok(state) if state.running => {
                    if instance.status == InstanceStatus::Starting {
                        self.queue.enqueue(Job::WaitForReady {
                            instance_id: instance.id,
                        });
                    }
                }
                Ok(_) => {
                    warn!(
                        "Instance {} has no running container, marking erroneous",
                        instance.id
                    );
                    self.db
                        .set_instance_status(instance.id, InstanceStatus::Error)
                        .await?;
                }
                Err(e) => {
                    warn!(
                        "Instance {} container cannot be inspected ({}), marking erroneous",
                        instance.id, e
                    );
                    self.db
                        .set_instance_status(instance.id, InstanceStatus::Error)
                        .await?;
                }
            }
        }

        self.queue.enqueue(Job::Monitor);
        Ok(())
    }
}

/// Schedule the periodic reconciler pass.
///
/// Returns the running scheduler; dropping it stops the schedule.
pub async fn start_schedule(schedule: &str, queue: TaskQueue) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let job = CronJob::new(schedule, move |_uuid, _lock| {
        queue.enqueue(Job::Monitor);
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;

    info!("Reconciler scheduled with cron '{}'", schedule);
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::database::Instance;
    use crate::runtime::fake::FakeRuntime;
    use crate::runtime::ContainerSpec;
    use crate::tasks::TaskReceiver;

    async fn harness() -> (Monitor, Arc<Database>, Arc<FakeRuntime>, TaskReceiver) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.seed_ports(50000, 50010).await.unwrap();

        let runtime = Arc::new(FakeRuntime::new());
        let (queue, receiver) = TaskQueue::channel();
        let monitor = Monitor::new(
            db.clone(),
            runtime.clone(),
            queue,
            "packettracer".into(),
        );
        (monitor, db, runtime, receiver)
    }

    /// Create a running container plus its instance row
    async fn running_instance(db: &Database, runtime: &FakeRuntime) -> Instance {
        let spec = ContainerSpec {
            image: "packettracer".into(),
            ..Default::default()
        };
        let created = runtime.create(&spec).await.unwrap();
        runtime.start(&created.id).await.unwrap();

        let port = db.reserve_port().await.unwrap().unwrap();
        db.create_instance(&created.id, port.number, port.number + 10_000)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_restart_pass_revives_clean_exit() {
        let (monitor, db, runtime, mut receiver) = harness().await;

        let instance = running_instance(&db, &runtime).await;
        runtime.mark_exited(&instance.docker_id, 0);

        let restarted = monitor.restart_pass().await.unwrap();
        assert_eq!(restarted, vec![instance.id]);

        let revived = db.instance(instance.id).await.unwrap().unwrap();
        assert_eq!(revived.status, InstanceStatus::Starting);
        assert!(runtime.container(&instance.docker_id).unwrap().state.running);

        let scheduled = receiver.rx.try_recv().unwrap();
        assert_eq!(
            scheduled.job,
            Job::WaitForReady {
                instance_id: instance.id
            }
        );
    }

    #[tokio::test]
    async fn test_restart_pass_marks_dirty_exit_erroneous() {
        let (monitor, db, runtime, _receiver) = harness().await;

        let instance = running_instance(&db, &runtime).await;
        runtime.mark_exited(&instance.docker_id, 137);

        let restarted = monitor.restart_pass().await.unwrap();
        assert!(restarted.is_empty());

        let broken = db.instance(instance.id).await.unwrap().unwrap();
        assert_eq!(broken.status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn test_restart_pass_ignores_foreign_images() {
        let (monitor, db, runtime, _receiver) = harness().await;

        let spec = ContainerSpec {
            image: "postgres".into(),
            ..Default::default()
        };
        let created = runtime.create(&spec).await.unwrap();
        runtime.start(&created.id).await.unwrap();
        let port = db.reserve_port().await.unwrap().unwrap();
        let instance = db
            .create_instance(&created.id, port.number, port.number + 10_000)
            .await
            .unwrap();
        runtime.mark_exited(&created.id, 0);

        let restarted = monitor.restart_pass().await.unwrap();
        assert!(restarted.is_empty());

        let untouched = db.instance(instance.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, InstanceStatus::Starting);
    }

    #[tokio::test]
    async fn test_reap_pass_spares_restarted_set() {
        let (monitor, db, runtime, _receiver) = harness().await;

        let spared = running_instance(&db, &runtime).await;
        let doomed = running_instance(&db, &runtime).await;
        db.set_instance_status(spared.id, InstanceStatus::Error)
            .await
            .unwrap();
        db.set_instance_status(doomed.id, InstanceStatus::Error)
            .await
            .unwrap();

        let reaped = monitor.reap_pass(&[spared.id]).await.unwrap();
        assert_eq!(reaped, vec![doomed.id]);

        let finished = db.instance(doomed.id).await.unwrap().unwrap();
        assert!(!finished.is_active());
        let alive = db.instance(spared.id).await.unwrap().unwrap();
        assert!(alive.is_active());

        // The reaped instance's port went back to the pool
        let port = db.port(doomed.pt_port).await.unwrap().unwrap();
        assert!(port.is_available());
    }

    #[tokio::test]
    async fn test_passes_converge_to_zero_errors() {
        let (monitor, db, runtime, _receiver) = harness().await;

        // One cleanly exited, one dirty, one erroneous with a live container
        let clean = running_instance(&db, &runtime).await;
        runtime.mark_exited(&clean.docker_id, 0);

        let dirty = running_instance(&db, &runtime).await;
        runtime.mark_exited(&dirty.docker_id, 1);

        let broken = running_instance(&db, &runtime).await;
        db.set_instance_status(broken.id, InstanceStatus::Error)
            .await
            .unwrap();

        // Run chained passes until a fixed point
        loop {
            let restarted = monitor.restart_pass().await.unwrap();
            let reaped = monitor.reap_pass(&restarted).await.unwrap();
            if restarted.is_empty() && reaped.is_empty() {
                break;
            }
        }

        assert!(db.instances_erroneous().await.unwrap().is_empty());

        let revived = db.instance(clean.id).await.unwrap().unwrap();
        assert_eq!(revived.status, InstanceStatus::Starting);
        assert!(revived.is_active());

        for reaped in [dirty.id, broken.id] {
            let finished = db.instance(reaped).await.unwrap().unwrap();
            assert!(!finished.is_active());
        }
    }

    #[tokio::test]
    async fn test_boot_reconcile_flags_missing_containers() {
        let (monitor, db, runtime, mut receiver) = harness().await;

        let vanished = {
            let port = db.reserve_port().await.unwrap().unwrap();
            db.create_instance("gone", port.number, port.number + 10_000)
                .await
                .unwrap()
        };
        let starting = running_instance(&db, &runtime).await;

        monitor.reconcile_on_boot().await.unwrap();

        let flagged = db.instance(vanished.id).await.unwrap().unwrap();
        assert_eq!(flagged.status, InstanceStatus::Error);

        // The surviving starting instance gets its readiness wait back,
        // then a full pass is scheduled.
        let first = receiver.rx.try_recv().unwrap();
        assert_eq!(
            first.job,
            Job::WaitForReady {
                instance_id: starting.id
            }
        );
        let second = receiver.rx.try_recv().unwrap();
        assert_eq!(second.job, Job::Monitor);
    }
}
