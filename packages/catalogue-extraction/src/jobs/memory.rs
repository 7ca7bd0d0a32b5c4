//! In-memory job queue for tests, development and single-process runs.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::traits::queue::{ClaimedJob, EnqueueResult, FailureKind, JobOptions, JobQueue};

#[derive(Debug, Clone)]
struct QueuedJob {
    id: Uuid,
    queue: String,
    payload: serde_json::Value,
    dedup_key: Option<String>,
    ready_at: Instant,

    /// Executions started so far
    attempts: u32,
    max_attempts: u32,
}

/// A job that failed for good.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    pub error: String,
    pub attempts: u32,
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<String, VecDeque<QueuedJob>>,
    running: HashMap<Uuid, QueuedJob>,
    dedup: HashMap<String, Uuid>,
    dead_letters: Vec<DeadLetter>,
}

impl QueueState {
    fn release_dedup(&mut self, job: &QueuedJob) {
        if let Some(key) = &job.dedup_key {
            if self.dedup.get(key) == Some(&job.id) {
                self.dedup.remove(key);
            }
        }
    }
}

/// Job queue held in process memory.
///
/// One deque per queue name. LIFO jobs go to the front, FIFO jobs to the
/// back, and a claim takes the first jobs whose delay has elapsed. A dedup
/// key is held from submission until the job succeeds or fails for good.
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
    retry_base_delay: Duration,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            retry_base_delay: Duration::from_secs(1),
        }
    }

    /// Base delay of the exponential backoff applied to retried jobs.
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Jobs that exhausted their attempts or failed permanently.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state().dead_letters.clone()
    }

    /// Pending payloads of `queue` in claim order, ignoring delays.
    pub fn pending_payloads(&self, queue: &str) -> Vec<serde_json::Value> {
        self.state()
            .pending
            .get(queue)
            .map(|jobs| jobs.iter().map(|job| job.payload.clone()).collect())
            .unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn backoff(&self, attempts: u32) -> Duration {
        self.retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempts.saturating_sub(1)))
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn submit_job(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<EnqueueResult, QueueError> {
        let mut state = self.state();

        if let Some(key) = &options.dedup_key {
            if let Some(existing) = state.dedup.get(key) {
                debug!(queue, dedup_key = %key, job_id = %existing, "duplicate job");
                return Ok(EnqueueResult::Duplicate(*existing));
            }
        }

        let job = QueuedJob {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            payload,
            dedup_key: options.dedup_key,
            ready_at: Instant::now() + options.delay,
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
        };
        let id = job.id;
        if let Some(key) = &job.dedup_key {
            state.dedup.insert(key.clone(), id);
        }

        let jobs = state.pending.entry(queue.to_string()).or_default();
        if options.lifo {
            jobs.push_front(job);
        } else {
            jobs.push_back(job);
        }
        Ok(EnqueueResult::Created(id))
    }

    async fn claim(&self, queue: &str, limit: usize) -> Result<Vec<ClaimedJob>, QueueError> {
        let mut state = self.state();
        let now = Instant::now();

        let mut claimed = Vec::new();
        if let Some(jobs) = state.pending.get_mut(queue) {
            let mut index = 0;
            while index < jobs.len() && claimed.len() < limit {
                if jobs[index].ready_at <= now {
                    if let Some(job) = jobs.remove(index) {
                        claimed.push(job);
                    }
                } else {
                    index += 1;
                }
            }
        }

        Ok(claimed
            .into_iter()
            .map(|mut job| {
                job.attempts += 1;
                let claimed = ClaimedJob {
                    id: job.id,
                    queue: job.queue.clone(),
                    payload: job.payload.clone(),
                    attempt: job.attempts,
                    max_attempts: job.max_attempts,
                };
                state.running.insert(job.id, job);
                claimed
            })
            .collect())
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut state = self.state();
        let job = state
            .running
            .remove(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;
        state.release_dedup(&job);
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        kind: FailureKind,
    ) -> Result<(), QueueError> {
        let mut state = self.state();
        let mut job = state
            .running
            .remove(&job_id)
            .ok_or(QueueError::JobNotFound(job_id))?;

        if kind == FailureKind::Retryable && job.attempts < job.max_attempts {
            let delay = self.backoff(job.attempts);
            warn!(
                job_id = %job_id,
                queue = %job.queue,
                attempt = job.attempts,
                delay_ms = delay.as_millis() as u64,
                error,
                "job failed, rescheduling"
            );
            job.ready_at = Instant::now() + delay;
            state.pending.entry(job.queue.clone()).or_default().push_back(job);
            return Ok(());
        }

        error!(
            job_id = %job_id,
            queue = %job.queue,
            attempts = job.attempts,
            error,
            "job failed permanently"
        );
        state.release_dedup(&job);
        state.dead_letters.push(DeadLetter {
            id: job.id,
            queue: job.queue,
            payload: job.payload,
            error: error.to_string(),
            attempts: job.attempts,
        });
        Ok(())
    }

    async fn outstanding(&self, queue: &str) -> Result<usize, QueueError> {
        let state = self.state();
        let pending = state.pending.get(queue).map_or(0, VecDeque::len);
        let running = state.running.values().filter(|job| job.queue == queue).count();
        Ok(pending + running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_dedup_key_blocks_resubmission_until_done() {
        let queue = MemoryJobQueue::new();
        let options = JobOptions::default().with_dedup_key("page-a");

        let first = queue.submit_job("fetch", json!(1), options.clone()).await.unwrap();
        let second = queue.submit_job("fetch", json!(2), options.clone()).await.unwrap();
        assert!(first.is_created());
        assert_eq!(second, EnqueueResult::Duplicate(first.job_id()));

        let claimed = queue.claim("fetch", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        // Still held while running
        assert!(!queue.submit_job("fetch", json!(3), options.clone()).await.unwrap().is_created());

        queue.mark_succeeded(claimed[0].id).await.unwrap();
        assert!(queue.submit_job("fetch", json!(4), options).await.unwrap().is_created());
    }

    #[tokio::test]
    async fn test_lifo_jobs_are_claimed_first() {
        let queue = MemoryJobQueue::new();
        queue.submit_job("fetch", json!("old"), JobOptions::default()).await.unwrap();
        queue
            .submit_job("fetch", json!("new"), JobOptions::default().with_lifo(true))
            .await
            .unwrap();

        let claimed = queue.claim("fetch", 1).await.unwrap();
        assert_eq!(claimed[0].payload, json!("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_job_is_not_claimable_early() {
        let queue = MemoryJobQueue::new();
        queue
            .submit_job(
                "fetch",
                json!("later"),
                JobOptions::default().with_delay(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        queue.submit_job("fetch", json!("now"), JobOptions::default()).await.unwrap();

        let claimed = queue.claim("fetch", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload, json!("now"));
        assert_eq!(queue.outstanding("fetch").await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(queue.claim("fetch", 10).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_is_rescheduled_until_exhausted() {
        let queue = MemoryJobQueue::new().with_retry_base_delay(Duration::from_secs(1));
        queue
            .submit_job("fetch", json!("x"), JobOptions::default().with_max_attempts(2))
            .await
            .unwrap();

        let job = queue.claim("fetch", 1).await.unwrap().remove(0);
        assert_eq!(job.attempt, 1);
        assert!(!job.is_final_attempt());
        queue.mark_failed(job.id, "timeout", FailureKind::Retryable).await.unwrap();
        assert!(queue.claim("fetch", 1).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let job = queue.claim("fetch", 1).await.unwrap().remove(0);
        assert_eq!(job.attempt, 2);
        assert!(job.is_final_attempt());
        queue.mark_failed(job.id, "timeout", FailureKind::Retryable).await.unwrap();

        assert_eq!(queue.outstanding("fetch").await.unwrap(), 0);
        assert_eq!(queue.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_final() {
        let queue = MemoryJobQueue::new();
        queue.submit_job("fetch", json!("x"), JobOptions::default()).await.unwrap();
        let job = queue.claim("fetch", 1).await.unwrap().remove(0);
        queue.mark_failed(job.id, "bad payload", FailureKind::NonRetryable).await.unwrap();
        assert_eq!(queue.outstanding("fetch").await.unwrap(), 0);
        assert_eq!(queue.dead_letters()[0].error, "bad payload");
    }
}
