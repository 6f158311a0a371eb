//! Lifecycle coordination: create, warm-up, allocate, deallocate, delete

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::VNC_PORT_OFFSET;
use crate::database::{Allocation, Database, Instance, InstanceStatus};
use crate::error::{DaemonError, Result};
use crate::probe::ReadinessProbe;
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError, VolumeBind};
use crate::system::AdmissionController;
use crate::tasks::{Job, TaskQueue};

/// Knobs the coordinator reads from configuration
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Image instances are created from
    pub image: String,

    /// Data-only container attached to every instance
    pub data_container: String,

    /// IPC port inside the container
    pub container_pt_port: u16,

    /// VNC port inside the container
    pub container_vnc_port: u16,

    /// Host directory of the shared file cache
    pub cache_dir: String,

    /// Mount point of the cache inside instances
    pub cache_container_dir: String,

    /// Host the readiness probe connects to
    pub probe_host: String,

    /// Per-attempt probe timeout
    pub probe_timeout: Duration,
}

/// The lifecycle state machine.
///
/// Every mutation goes through the store APIs; the store's row update is the
/// linearization point for concurrent operations on one instance.
pub struct Coordinator {
    db: Arc<Database>,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn ReadinessProbe>,
    admission: AdmissionController,
    queue: TaskQueue,
    settings: LifecycleSettings,
}

impl Coordinator {
    pub fn new(
        db: Arc<Database>,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn ReadinessProbe>,
        admission: AdmissionController,
        queue: TaskQueue,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            db,
            runtime,
            probe,
            admission,
            queue,
            settings,
        }
    }

    /// Reserve a port, create and start a container on it, persist the
    /// instance and schedule its readiness wait.
    ///
    /// The reservation is rolled back on every failure path; a port is never
    /// left orphaned without an instance.
    pub async fn create_instance(&self) -> Result<Instance> {
        self.admission.check().await?;

        let port = self.db.reserve_port().await?.ok_or_else(|| {
            DaemonError::InsufficientResources(
                "The server cannot create new instances. Please, wait and retry.".into(),
            )
        })?;

        let pt_port = port.number;
        let vnc_port = pt_port + VNC_PORT_OFFSET;

        match self.start_new_container(pt_port, vnc_port).await {
            Ok(instance) => {
                info!(
                    "Created instance {} on port {} (container {})",
                    instance.id, pt_port, instance.docker_id
                );
                self.queue.enqueue(Job::WaitForReady {
                    instance_id: instance.id,
                });
                Ok(instance)
            }
            Err(e) => {
                if let Err(release_err) = self.db.release_port(pt_port).await {
                    error!("Failed to roll back port {}: {}", pt_port, release_err);
                }
                Err(e)
            }
        }
    }

    async fn start_new_container(&self, pt_port: u16, vnc_port: u16) -> Result<Instance> {
        let spec = self.container_spec(pt_port, vnc_port);
        let created = self.runtime.create(&spec).await?;

        if !created.warnings.is_empty() {
            self.queue.enqueue(Job::RemoveContainer {
                docker_id: created.id.clone(),
            });
            return Err(RuntimeError::Rejected(created.warnings.join("; ")).into());
        }

        if let Err(e) = self.runtime.start(&created.id).await {
            self.queue.enqueue(Job::RemoveContainer {
                docker_id: created.id,
            });
            return Err(e.into());
        }

        let instance = self
            .db
            .create_instance(&created.id, pt_port, vnc_port)
            .await?;
        Ok(instance)
    }

    fn container_spec(&self, pt_port: u16, vnc_port: u16) -> ContainerSpec {
        let mut port_bindings = HashMap::new();
        port_bindings.insert(self.settings.container_pt_port, pt_port);
        port_bindings.insert(self.settings.container_vnc_port, vnc_port);

        ContainerSpec {
            image: self.settings.image.clone(),
            port_bindings,
            volume_binds: vec![VolumeBind {
                host_path: self.settings.cache_dir.clone(),
                container_path: self.settings.cache_container_dir.clone(),
                read_only: true,
            }],
            volumes_from: vec![self.settings.data_container.clone()],
        }
    }

    /// Lease a warm instance, or fall back to creating a cold one.
    ///
    /// Warm candidates are tried ready-first; one whose unpause fails is
    /// marked erroneous and skipped. The cold instance is leased immediately
    /// without waiting for readiness, since a later deallocation will park it
    /// once it answers.
    pub async fn allocate_instance(&self) -> Result<(Allocation, Instance)> {
        self.admission.check().await?;

        for candidate in self.db.instances_deallocated().await? {
            match self.runtime.unpause(&candidate.docker_id).await {
                Ok(()) => {
                    let allocation = self.db.open_allocation(candidate.id).await?;
                    let instance = self.refreshed(candidate.id).await?;
                    info!(
                        "Allocation {} leased warm instance {}",
                        allocation.id, instance.id
                    );
                    return Ok((allocation, instance));
                }
                Err(e) => {
                    warn!("Failed to unpause instance {}: {}", candidate.id, e);
                    self.mark_error(candidate.id).await?;
                }
            }
        }

        let instance = self.create_instance().await?;
        let allocation = self.db.open_allocation(instance.id).await?;
        let instance = self.refreshed(instance.id).await?;
        info!(
            "Allocation {} leased cold instance {}",
            allocation.id, instance.id
        );
        Ok((allocation, instance))
    }

    /// Pause an instance and close its lease.
    ///
    /// Also used to park never-allocated instances once they turn ready.
    /// Deallocating an instance that is already parked is a no-op success.
    pub async fn deallocate_instance(&self, instance_id: i64) -> Result<Instance> {
        let instance = self.get_active(instance_id).await?;

        if !instance.is_allocated() {
            if let Ok(state) = self.runtime.inspect(&instance.docker_id).await {
                if state.paused {
                    return Ok(instance);
                }
            }
        }

        match self.runtime.pause(&instance.docker_id).await {
            Ok(()) => {
                self.db.close_allocation_for(instance_id).await?;
                self.refreshed(instance_id).await
            }
            Err(e) => {
                warn!("Failed to pause instance {}: {}", instance_id, e);
                self.mark_error(instance_id).await?;
                // The lease must not stay pinned to a broken instance; the
                // reconciler repairs the container side later. The caller
                // still gets the completed transition.
                self.db.close_allocation_for(instance_id).await?;
                Ok(self.refreshed(instance_id).await?)
            }
        }
    }

    /// Tear an instance down: close its lease, release its port, mark it
    /// finished and schedule container removal.
    pub async fn delete_instance(&self, instance_id: i64) -> Result<Instance> {
        let instance = self
            .db
            .instance(instance_id)
            .await?
            .ok_or_else(|| DaemonError::NotFound(format!("instance {} does not exist", instance_id)))?;

        if !instance.is_active() {
            return Ok(instance);
        }

        self.db.finish_instance(instance_id).await?;
        self.queue.enqueue(Job::RemoveContainer {
            docker_id: instance.docker_id.clone(),
        });

        info!("Deleted instance {}", instance_id);
        self.refreshed(instance_id).await
    }

    /// One readiness attempt for a starting instance.
    ///
    /// `Ok(Some(job))` chains a pause once an unallocated instance answers;
    /// an `Err` asks the task engine for another attempt.
    pub async fn check_ready(&self, instance_id: i64) -> Result<Option<Job>> {
        let Some(instance) = self.db.instance(instance_id).await? else {
            return Ok(None);
        };
        if !instance.is_active() {
            return Ok(None);
        }

        let state = match self.runtime.inspect(&instance.docker_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to inspect instance {}: {}", instance_id, e);
                self.mark_error(instance_id).await?;
                return Ok(None);
            }
        };

        if !state.running {
            // A dead container will not answer no matter how often we retry
            self.mark_error(instance_id).await?;
            return Ok(None);
        }

        let answered = self
            .probe
            .is_answering(
                &self.settings.probe_host,
                instance.pt_port,
                self.settings.probe_timeout,
            )
            .await;

        if !answered {
            return Err(DaemonError::Timeout(format!(
                "instance {} is not answering yet",
                instance_id
            )));
        }

        self.db
            .set_instance_status(instance_id, InstanceStatus::Ready)
            .await?;
        info!("Instance {} is ready", instance_id);

        if !instance.is_allocated() {
            return Ok(Some(Job::Deallocate { instance_id }));
        }
        Ok(None)
    }

    /// Mark an instance erroneous; the reconciler owns its repair
    pub async fn mark_error(&self, instance_id: i64) -> Result<()> {
        self.db
            .set_instance_status(instance_id, InstanceStatus::Error)
            .await?;
        Ok(())
    }

    /// Force-remove a container, thawing it first if paused.
    ///
    /// Removal failures are logged and swallowed; nothing downstream depends
    /// on them.
    pub async fn remove_container(&self, docker_id: &str) {
        match self.runtime.inspect(docker_id).await {
            Ok(state) if state.paused => {
                if let Err(e) = self.runtime.unpause(docker_id).await {
                    warn!("Failed to unpause container {} for removal: {}", docker_id, e);
                }
            }
            Ok(_) => {}
            Err(RuntimeError::ContainerNotFound(_)) => return,
            Err(e) => {
                warn!("Failed to inspect container {} for removal: {}", docker_id, e);
            }
        }

        if let Err(e) = self.runtime.remove(docker_id, true).await {
            warn!("Failed to remove container {}: {}", docker_id, e);
        }
    }

    async fn get_active(&self, instance_id: i64) -> Result<Instance> {
        let instance = self
            .db
            .instance(instance_id)
            .await?
            .ok_or_else(|| DaemonError::NotFound(format!("instance {} does not exist", instance_id)))?;
        if !instance.is_active() {
            return Err(DaemonError::NotFound(format!(
                "instance {} is finished",
                instance_id
            )));
        }
        Ok(instance)
    }

    async fn refreshed(&self, instance_id: i64) -> Result<Instance> {
        self.db
            .instance(instance_id)
            .await?
            .ok_or_else(|| DaemonError::Internal(format!("instance {} vanished", instance_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use crate::runtime::fake::FakeRuntime;
    use crate::tasks::{spawn_workers, JobExecutor, TaskReceiver};

    struct StaticProbe(bool);

    #[async_trait]
    impl ReadinessProbe for StaticProbe {
        async fn is_answering(&self, _host: &str, _port: u16, _timeout: Duration) -> bool {
            self.0
        }
    }

    fn settings() -> LifecycleSettings {
        LifecycleSettings {
            image: "packettracer".into(),
            data_container: "ptshared".into(),
            container_pt_port: 39000,
            container_vnc_port: 5900,
            cache_dir: "/tmp/ptpool-cache".into(),
            cache_container_dir: "/data/cache".into(),
            probe_host: "localhost".into(),
            probe_timeout: Duration::from_secs(2),
        }
    }

    async fn harness(
        range: (u16, u16),
        probe_answers: bool,
    ) -> (Arc<Coordinator>, Arc<FakeRuntime>, TaskReceiver) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.seed_ports(range.0, range.1).await.unwrap();

        let runtime = Arc::new(FakeRuntime::new());
        let (queue, receiver) = TaskQueue::channel();
        let coordinator = Arc::new(Coordinator::new(
            db,
            runtime.clone(),
            Arc::new(StaticProbe(probe_answers)),
            AdmissionController::new(200.0, 200.0),
            queue,
            settings(),
        ));
        (coordinator, runtime, receiver)
    }

    /// Create an instance and walk it to READY + paused, as the background
    /// jobs would.
    async fn warm_instance(coordinator: &Coordinator) -> Instance {
        let instance = coordinator.create_instance().await.unwrap();
        let follow_up = coordinator.check_ready(instance.id).await.unwrap();
        assert_eq!(
            follow_up,
            Some(Job::Deallocate {
                instance_id: instance.id
            })
        );
        coordinator.deallocate_instance(instance.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_instance_reserves_and_binds_port() {
        let (coordinator, runtime, mut receiver) = harness((50000, 50001), true).await;

        let instance = coordinator.create_instance().await.unwrap();
        assert_eq!(instance.pt_port, 50000);
        assert_eq!(instance.vnc_port, 60000);
        assert_eq!(instance.status, InstanceStatus::Starting);

        // Container was started
        let container = runtime.container(&instance.docker_id).unwrap();
        assert!(container.state.running);

        // Readiness wait was scheduled
        let scheduled = receiver.rx.try_recv().unwrap();
        assert_eq!(
            scheduled.job,
            Job::WaitForReady {
                instance_id: instance.id
            }
        );
    }

    #[tokio::test]
    async fn test_create_instance_port_exhaustion() {
        let (coordinator, _runtime, _receiver) = harness((50000, 50001), true).await;

        coordinator.create_instance().await.unwrap();
        coordinator.create_instance().await.unwrap();

        let err = coordinator.create_instance().await.unwrap_err();
        assert!(matches!(err, DaemonError::InsufficientResources(_)));
    }

    #[tokio::test]
    async fn test_create_failure_rolls_back_port() {
        let (coordinator, runtime, _receiver) = harness((50000, 50000), true).await;
        runtime.fail_create.store(true, Ordering::SeqCst);

        let err = coordinator.create_instance().await.unwrap_err();
        assert!(matches!(err, DaemonError::Runtime(_)));

        // The reservation was rolled back, so the next attempt gets the port
        runtime.fail_create.store(false, Ordering::SeqCst);
        let instance = coordinator.create_instance().await.unwrap();
        assert_eq!(instance.pt_port, 50000);
    }

    #[tokio::test]
    async fn test_create_warning_rolls_back_and_discards_container() {
        let (coordinator, runtime, mut receiver) = harness((50000, 50000), true).await;
        runtime
            .create_warnings
            .lock()
            .push("no space left".to_string());

        let err = coordinator.create_instance().await.unwrap_err();
        assert!(matches!(err, DaemonError::Runtime(RuntimeError::Rejected(_))));

        let scheduled = receiver.rx.try_recv().unwrap();
        assert!(matches!(scheduled.job, Job::RemoveContainer { .. }));
    }

    #[tokio::test]
    async fn test_warm_allocation_happy_path() {
        let (coordinator, runtime, _receiver) = harness((50000, 50001), true).await;

        let warm = warm_instance(&coordinator).await;
        assert_eq!(warm.status, InstanceStatus::Ready);
        assert!(runtime.container(&warm.docker_id).unwrap().state.paused);

        let (allocation, instance) = coordinator.allocate_instance().await.unwrap();
        assert!(allocation.is_current());
        assert_eq!(instance.id, warm.id);
        assert_eq!(instance.allocated_by, Some(allocation.id));
        assert!(!runtime.container(&instance.docker_id).unwrap().state.paused);

        // Returning the lease parks the instance again
        let returned = coordinator.deallocate_instance(instance.id).await.unwrap();
        assert!(!returned.is_allocated());
        assert!(runtime.container(&returned.docker_id).unwrap().state.paused);
    }

    #[tokio::test]
    async fn test_cold_allocation_when_pool_empty() {
        let (coordinator, _runtime, mut receiver) = harness((50000, 50001), true).await;

        let (allocation, instance) = coordinator.allocate_instance().await.unwrap();
        assert!(allocation.is_current());
        assert_eq!(instance.allocated_by, Some(allocation.id));
        assert_eq!(instance.status, InstanceStatus::Starting);
        assert_eq!(instance.pt_port, 50000);

        // Readiness wait still runs against the cold instance
        let scheduled = receiver.rx.try_recv().unwrap();
        assert_eq!(
            scheduled.job,
            Job::WaitForReady {
                instance_id: instance.id
            }
        );
    }

    #[tokio::test]
    async fn test_unpause_failure_falls_through_to_cold_path() {
        let (coordinator, runtime, _receiver) = harness((50000, 50002), true).await;

        let warm = warm_instance(&coordinator).await;
        runtime.fail_unpause.store(true, Ordering::SeqCst);

        let (allocation, instance) = coordinator.allocate_instance().await.unwrap();
        assert_ne!(instance.id, warm.id);
        assert!(allocation.is_current());

        // The failed candidate was marked erroneous
        let broken = coordinator.db.instance(warm.id).await.unwrap().unwrap();
        assert_eq!(broken.status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn test_deallocate_already_parked_is_noop() {
        let (coordinator, _runtime, _receiver) = harness((50000, 50000), true).await;

        let warm = warm_instance(&coordinator).await;
        let again = coordinator.deallocate_instance(warm.id).await.unwrap();
        assert_eq!(again.id, warm.id);
        assert_eq!(again.status, InstanceStatus::Ready);
    }

    #[tokio::test]
    async fn test_deallocate_pause_failure_marks_error_and_frees_lease() {
        let (coordinator, runtime, _receiver) = harness((50000, 50000), true).await;

        let warm = warm_instance(&coordinator).await;
        let (allocation, instance) = coordinator.allocate_instance().await.unwrap();
        assert_eq!(instance.id, warm.id);

        // The caller still sees the completed transition on a pause failure
        runtime.fail_pause.store(true, Ordering::SeqCst);
        let broken = coordinator.deallocate_instance(instance.id).await.unwrap();
        assert_eq!(broken.status, InstanceStatus::Error);
        assert!(!broken.is_allocated());

        let closed = coordinator.db.allocation(allocation.id).await.unwrap().unwrap();
        assert!(!closed.is_current());
    }

    #[tokio::test]
    async fn test_check_ready_dead_container_marks_error() {
        let (coordinator, runtime, _receiver) = harness((50000, 50000), true).await;

        let instance = coordinator.create_instance().await.unwrap();
        runtime.mark_exited(&instance.docker_id, 0);

        let follow_up = coordinator.check_ready(instance.id).await.unwrap();
        assert_eq!(follow_up, None);

        let broken = coordinator.db.instance(instance.id).await.unwrap().unwrap();
        assert_eq!(broken.status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn test_check_ready_unanswered_asks_for_retry() {
        let (coordinator, _runtime, _receiver) = harness((50000, 50000), false).await;

        let instance = coordinator.create_instance().await.unwrap();
        let err = coordinator.check_ready(instance.id).await.unwrap_err();
        assert!(matches!(err, DaemonError::Timeout(_)));

        // Still starting; the task engine owns the retry budget
        let still = coordinator.db.instance(instance.id).await.unwrap().unwrap();
        assert_eq!(still.status, InstanceStatus::Starting);
    }

    #[tokio::test]
    async fn test_delete_instance_round_trips_port() {
        let (coordinator, _runtime, _receiver) = harness((50000, 50000), true).await;

        let warm = warm_instance(&coordinator).await;
        let (allocation, _instance) = coordinator.allocate_instance().await.unwrap();

        let deleted = coordinator.delete_instance(warm.id).await.unwrap();
        assert!(!deleted.is_active());
        assert!(!deleted.is_allocated());

        let port = coordinator.db.port(50000).await.unwrap().unwrap();
        assert!(port.is_available());

        let closed = coordinator.db.allocation(allocation.id).await.unwrap().unwrap();
        assert!(!closed.is_current());

        // Deleting again is a no-op
        coordinator.delete_instance(warm.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_jobs_drive_instance_to_warm_pool() {
        // End to end through the real worker pool: create, readiness chain,
        // pause into the pool.
        let (coordinator, runtime, receiver) = harness((50000, 50000), true).await;
        let monitor = Arc::new(crate::monitor::Monitor::new(
            coordinator.db.clone(),
            runtime.clone(),
            coordinator.queue.clone(),
            "packettracer".into(),
        ));
        let executor = Arc::new(JobExecutor::new(
            coordinator.clone(),
            monitor,
            3,
            Duration::from_millis(10),
        ));
        let shutdown = CancellationToken::new();
        spawn_workers(
            receiver,
            coordinator.queue.clone(),
            executor,
            2,
            shutdown.clone(),
        );

        let instance = coordinator.create_instance().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let warmed = coordinator.db.instance(instance.id).await.unwrap().unwrap();
        assert_eq!(warmed.status, InstanceStatus::Ready);
        assert!(!warmed.is_allocated());
        assert!(runtime.container(&warmed.docker_id).unwrap().state.paused);
        shutdown.cancel();
    }
}
