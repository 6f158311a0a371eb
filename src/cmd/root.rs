//! Main daemon command - wires the collaborators and serves the API

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ptpool_daemon::cache::FileCache;
use ptpool_daemon::config::Configuration;
use ptpool_daemon::database::Database;
use ptpool_daemon::lifecycle::{Coordinator, LifecycleSettings};
use ptpool_daemon::monitor::{self, Monitor};
use ptpool_daemon::probe::PtChecker;
use ptpool_daemon::router::{self, AppState};
use ptpool_daemon::runtime::{ContainerRuntime, DockerRuntime};
use ptpool_daemon::system::AdmissionController;
use ptpool_daemon::tasks::{self, Job, JobExecutor, TaskQueue};

/// Run the daemon
pub async fn run(config: Arc<Configuration>) -> Result<()> {
    info!("Configuration loaded");
    info!("  API: {}", config.api_address());
    info!("  Ports: [{}, {}]", config.ports.lowest, config.ports.highest);
    info!("  Image: {}", config.docker.image);

    // Open the state store and seed the port registry
    let db = Arc::new(Database::open(&config.database.path)?);
    if config.ports.lowest <= config.ports.highest {
        db.seed_ports(config.ports.lowest, config.ports.highest)
            .await?;
    } else {
        warn!("Port range is empty; every instance creation will be rejected");
    }

    // Wire the collaborators
    let runtime: Arc<dyn ContainerRuntime> = match config.docker.url.as_deref() {
        Some(url) => Arc::new(DockerRuntime::connect(url)?),
        None => Arc::new(DockerRuntime::new()?),
    };
    let probe = Arc::new(PtChecker::new(&config.checker.jar_path));
    let admission = AdmissionController::new(config.thresholds.cpu, config.thresholds.memory);

    let (queue, receiver) = TaskQueue::channel();

    let settings = LifecycleSettings {
        image: config.docker.image.clone(),
        data_container: config.docker.data_container.clone(),
        container_pt_port: config.docker.pt_port,
        container_vnc_port: config.docker.vnc_port,
        cache_dir: config.cache.directory.display().to_string(),
        cache_container_dir: config.cache.container_directory.clone(),
        probe_host: config.checker.host.clone(),
        probe_timeout: Duration::from_secs(config.checker.probe_timeout_secs),
    };
    let coordinator = Arc::new(Coordinator::new(
        db.clone(),
        runtime.clone(),
        probe,
        admission,
        queue.clone(),
        settings,
    ));
    let reconciler = Arc::new(Monitor::new(
        db.clone(),
        runtime,
        queue.clone(),
        config.docker.image.clone(),
    ));
    let executor = Arc::new(JobExecutor::new(
        coordinator.clone(),
        reconciler.clone(),
        config.tasks.ready_max_retries,
        Duration::from_secs(config.tasks.ready_retry_delay_secs),
    ));

    // Start the worker pool
    let shutdown = CancellationToken::new();
    tasks::spawn_workers(
        receiver,
        queue.clone(),
        executor,
        config.tasks.workers,
        shutdown.clone(),
    );

    // Reconcile persisted state against the live container list
    if let Err(e) = reconciler.reconcile_on_boot().await {
        warn!("Boot reconciliation failed: {}", e);
    }

    // Pre-warm the pool
    if config.pool.size > 0 {
        for _ in 0..config.pool.size {
            queue.enqueue(Job::CreateInstance);
        }
        info!("Scheduled {} pool instances", config.pool.size);
    }

    // Periodic reconciler passes; dropping the scheduler stops them
    let _scheduler = monitor::start_schedule(&config.monitor.schedule, queue.clone()).await?;

    // Build the HTTP router
    let cache = Arc::new(FileCache::new(
        db.clone(),
        config.cache.directory.clone(),
        config.cache.container_directory.clone(),
    ));
    let state = AppState {
        coordinator,
        db,
        cache,
        config: config.clone(),
    };
    let app = router::build_router(state);

    // Serve until interrupted
    let listener = tokio::net::TcpListener::bind(config.api_address()).await?;
    info!("Starting HTTP server on {}", config.api_address());

    let shutdown_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install CTRL+C handler");
            warn!("Received shutdown signal, stopping daemon...");
            shutdown_token.cancel();
        })
        .await?;

    info!("Daemon stopped");
    Ok(())
}
