//! Background task engine
//!
//! A worker pool drains an unbounded queue of jobs. Each job kind declares a
//! retry policy (bounded attempts, fixed delay); a job may chain a follow-up
//! that only runs after it succeeds. Delivery is at-least-once and there is
//! no ordering across jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::jobs::Job;
use crate::error::DaemonError;

/// Retry policy declared per job kind
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries granted after the first attempt
    pub max_retries: u32,

    /// Fixed delay between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    /// Fail immediately, no retries
    pub const NONE: RetryPolicy = RetryPolicy {
        max_retries: 0,
        delay: Duration::ZERO,
    };
}

/// Executes jobs pulled off the queue
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Retry policy for a job kind
    fn retry_policy(&self, job: &Job) -> RetryPolicy;

    /// Run a job. `Ok(Some(next))` chains a follow-up; `Err` retries under
    /// the job's policy.
    async fn run(&self, job: &Job) -> Result<Option<Job>, DaemonError>;

    /// Called once a job's retry budget is spent
    async fn exhausted(&self, job: &Job);
}

/// One queue entry
#[derive(Debug)]
pub struct Scheduled {
    pub job: Job,
    pub attempt: u32,
}

/// Handle for enqueuing background jobs
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Scheduled>,
}

/// Receiving end handed to the worker pool
pub struct TaskReceiver {
    pub(crate) rx: mpsc::UnboundedReceiver<Scheduled>,
}

impl TaskQueue {
    /// Create the queue and its receiving end
    pub fn channel() -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, TaskReceiver { rx })
    }

    /// Enqueue a job for immediate execution
    pub fn enqueue(&self, job: Job) {
        self.send(Scheduled { job, attempt: 0 });
    }

    /// Enqueue a job after a delay
    pub fn enqueue_after(&self, job: Job, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(Scheduled { job, attempt: 0 }).is_err() {
                warn!("Task queue closed, dropping delayed job");
            }
        });
    }

    fn requeue_after(&self, job: Job, attempt: u32, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(Scheduled { job, attempt }).is_err() {
                warn!("Task queue closed, dropping retry");
            }
        });
    }

    fn send(&self, scheduled: Scheduled) {
        if self.tx.send(scheduled).is_err() {
            warn!("Task queue closed, dropping job");
        }
    }
}

/// Spawn the worker pool draining the queue.
///
/// At most `workers` jobs run concurrently; the pool stops when the token is
/// cancelled or every queue handle is dropped.
pub fn spawn_workers(
    mut receiver: TaskReceiver,
    queue: TaskQueue,
    handler: Arc<dyn JobHandler>,
    workers: usize,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));

        loop {
            let scheduled = tokio::select! {
                _ = shutdown.cancelled() => break,
                scheduled = receiver.rx.recv() => match scheduled {
                    Some(scheduled) => scheduled,
                    None => break,
                },
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let handler = handler.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                let _permit = permit;
                execute(scheduled, handler, queue).await;
            });
        }

        debug!("Task workers stopped");
    })
}

async fn execute(scheduled: Scheduled, handler: Arc<dyn JobHandler>, queue: TaskQueue) {
    let Scheduled { job, attempt } = scheduled;

    match handler.run(&job).await {
        Ok(Some(next)) => queue.enqueue(next),
        Ok(None) => {}
        Err(e) => {
            let policy = handler.retry_policy(&job);
            if attempt < policy.max_retries {
                debug!(
                    "Job {:?} attempt {} failed ({}), retrying in {:?}",
                    job, attempt, e, policy.delay
                );
                queue.requeue_after(job, attempt + 1, policy.delay);
            } else {
                error!("Job {:?} failed with no retries left: {}", job, e);
                handler.exhausted(&job).await;
            }
        }
    }
}
