//! Job worker for processing queued crawl jobs.
//!
//! The `JobWorker` runs N concurrent claim loops. Each loop:
//! - Claims ready jobs from every queue its handler consumes
//! - Dispatches each job to the `JobHandler`
//! - Marks jobs succeeded or failed, classifying failures by
//!   [`Error::is_retryable`](crate::error::Error::is_retryable)
//!
//! ```text
//! JobWorker
//!     │
//!     ├─► claim (JobQueue)
//!     ├─► JobHandler.handle(job)
//!     └─► mark_succeeded / mark_failed (JobQueue)
//! ```

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::traits::queue::{ClaimedJob, FailureKind, JobQueue};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Number of concurrent claim loops
    pub concurrency: usize,
    /// Maximum number of jobs one loop claims at once
    pub batch_size: usize,
    /// How long a loop sleeps when no job is ready
    pub poll_interval: Duration,
    /// Worker ID for this instance
    pub worker_id: String,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            batch_size: 1,
            poll_interval: Duration::from_millis(100),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl JobWorkerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Handler trait for processing claimed jobs.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Queues this handler consumes, in claim priority order.
    fn queues(&self) -> Vec<&'static str>;

    /// Execute one job. A returned error fails the job.
    async fn handle(&self, job: &ClaimedJob) -> Result<()>;
}

/// Why a claim loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Shutdown,
    Idle,
}

/// A job worker that processes jobs from a queue.
///
/// Each claim loop runs as its own task, so loops run in parallel on a
/// multi-thread runtime.
#[derive(Clone)]
pub struct JobWorker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: JobWorkerConfig,
}

impl JobWorker {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>) -> Self {
        Self::with_config(queue, handler, JobWorkerConfig::default())
    }

    pub fn with_config(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        config: JobWorkerConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    /// Process jobs until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "job worker starting"
        );
        self.run_loops(&shutdown, false).await;
        info!(worker_id = %self.config.worker_id, "job worker stopped");
    }

    /// Process jobs until no job is pending or running, or until `shutdown`
    /// is cancelled.
    pub async fn run_until_idle(&self, shutdown: CancellationToken) {
        debug!(worker_id = %self.config.worker_id, "draining job queues");
        self.run_loops(&shutdown, true).await;
    }

    async fn run_loops(&self, shutdown: &CancellationToken, stop_when_idle: bool) {
        let mut loops = JoinSet::new();
        for index in 0..self.config.concurrency {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            loops.spawn(async move { worker.claim_loop(index, &shutdown, stop_when_idle).await });
        }

        let mut stops = Vec::with_capacity(self.config.concurrency);
        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(stop) => stops.push(stop),
                Err(e) => error!(worker_id = %self.config.worker_id, error = %e, "claim loop aborted"),
            }
        }
        debug!(?stops, "claim loops finished");
    }

    async fn claim_loop(&self, index: usize, shutdown: &CancellationToken, stop_when_idle: bool) -> Stop {
        loop {
            if shutdown.is_cancelled() {
                return Stop::Shutdown;
            }

            let mut claimed_any = false;
            for queue in self.handler.queues() {
                let jobs = match self.queue.claim(queue, self.config.batch_size).await {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        error!(queue, error = %e, "failed to claim jobs");
                        continue;
                    }
                };
                if jobs.is_empty() {
                    continue;
                }

                claimed_any = true;
                debug!(worker = index, queue, count = jobs.len(), "claimed jobs");
                join_all(jobs.into_iter().map(|job| self.process_job(job))).await;
                // Restart from the highest-priority queue
                break;
            }

            if claimed_any {
                // Let sibling loops claim
                tokio::task::yield_now().await;
                continue;
            }

            if stop_when_idle && self.is_idle().await {
                return Stop::Idle;
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Stop::Shutdown,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Process a single claimed job.
    async fn process_job(&self, job: ClaimedJob) {
        let job_id = job.id;
        match self.handler.handle(&job).await {
            Ok(()) => {
                debug!(job_id = %job_id, queue = %job.queue, "job succeeded");
                if let Err(e) = self.queue.mark_succeeded(job_id).await {
                    error!(job_id = %job_id, error = %e, "failed to mark job as succeeded");
                }
            }
            Err(e) => {
                let kind = if e.is_retryable() {
                    FailureKind::Retryable
                } else {
                    FailureKind::NonRetryable
                };
                warn!(
                    job_id = %job_id,
                    queue = %job.queue,
                    attempt = job.attempt,
                    error = %e,
                    "job failed"
                );
                if let Err(e) = self.queue.mark_failed(job_id, &e.to_string(), kind).await {
                    error!(job_id = %job_id, error = %e, "failed to mark job as failed");
                }
            }
        }
    }

    async fn is_idle(&self) -> bool {
        for queue in self.handler.queues() {
            match self.queue.outstanding(queue).await {
                Ok(0) => {}
                Ok(_) => return false,
                Err(e) => {
                    error!(queue, error = %e, "failed to count outstanding jobs");
                    return false;
                }
            }
        }
        true
    }
}
