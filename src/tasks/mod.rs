//! Background task module
//!
//! Queue, worker pool and the job definitions that run on it.

mod engine;
mod jobs;

pub use engine::{spawn_workers, JobHandler, RetryPolicy, Scheduled, TaskQueue, TaskReceiver};
pub use jobs::{Job, JobExecutor};
