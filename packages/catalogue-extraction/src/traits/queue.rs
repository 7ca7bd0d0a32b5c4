//! Job queue trait for background page-fetch and data-extraction work.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;
use uuid::Uuid;

use crate::error::QueueError;

/// Result type for enqueue operations that handles idempotency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Job was enqueued, returns new job ID
    Created(Uuid),
    /// A pending or running job holds the same dedup key, returns its ID
    Duplicate(Uuid),
}

impl EnqueueResult {
    /// Get the job ID regardless of whether it was created or duplicate
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    /// Returns true if this was a newly created job
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Per-job scheduling options.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// If set, only one pending or running job may hold this key
    pub dedup_key: Option<String>,

    /// Delay before the job becomes claimable
    pub delay: Duration,

    /// Claim ahead of older jobs in the same queue
    pub lifo: bool,

    /// Attempts before a retryable failure becomes final
    pub max_attempts: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            dedup_key: None,
            delay: Duration::ZERO,
            lifo: false,
            max_attempts: 3,
        }
    }
}

impl JobOptions {
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_lifo(mut self, lifo: bool) -> Self {
        self.lifo = lifo;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }
}

/// How a failed job should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient error - will retry if attempts remain
    Retryable,
    /// Permanent error - will not retry
    NonRetryable,
}

/// A claimed job ready for execution.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,

    /// One-based attempt number of this execution
    pub attempt: u32,

    pub max_attempts: u32,
}

impl ClaimedJob {
    /// Deserialize the job payload.
    pub fn deserialize<C: DeserializeOwned>(&self) -> Result<C, QueueError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| QueueError::InvalidPayload {
            job_type: self.queue.clone(),
            reason: e.to_string(),
        })
    }

    /// Whether a failure now would be final.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Trait for job queue operations.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submit one job.
    ///
    /// If the options carry a dedup key and a pending or running job holds
    /// it, returns `EnqueueResult::Duplicate` with the existing job ID.
    async fn submit_job(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<EnqueueResult, QueueError>;

    /// Submit several jobs sharing the same options (dedup keys excepted).
    async fn submit_jobs(
        &self,
        queue: &str,
        jobs: Vec<(serde_json::Value, Option<String>)>,
        options: JobOptions,
    ) -> Result<Vec<EnqueueResult>, QueueError> {
        let mut results = Vec::with_capacity(jobs.len());
        for (payload, dedup_key) in jobs {
            let options = JobOptions {
                dedup_key,
                ..options.clone()
            };
            results.push(self.submit_job(queue, payload, options).await?);
        }
        Ok(results)
    }

    /// Claim up to `limit` ready jobs from `queue`.
    async fn claim(&self, queue: &str, limit: usize) -> Result<Vec<ClaimedJob>, QueueError>;

    /// Mark a job as successfully completed.
    async fn mark_succeeded(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Mark a job as failed.
    ///
    /// Retryable failures with attempts remaining are rescheduled with
    /// exponential backoff; anything else is dropped.
    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        kind: FailureKind,
    ) -> Result<(), QueueError>;

    /// Jobs in `queue` that are pending (delayed included) or running.
    async fn outstanding(&self, queue: &str) -> Result<usize, QueueError>;
}
