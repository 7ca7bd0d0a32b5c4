//! Retry and majority-vote helpers for noisy, non-deterministic operations.
//!
//! LLM classification answers vary from call to call. Every classification
//! step is wrapped twice: [`exponential_retry`] absorbs transport failures
//! and malformed answers, and [`best_out_of`] runs the retried step several
//! times and keeps the most common answer.

use indexmap::IndexMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::config::RetryPolicy;

/// Run `op` until it succeeds, a non-retryable error occurs, or the policy's
/// attempts are exhausted.
///
/// Waits `base_delay * 2^attempt` after each failed attempt.
pub async fn exponential_retry<T, F, Fut>(policy: &RetryPolicy, task: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    task,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run `op` up to `n` times and return the result from the largest bucket.
///
/// Results are bucketed by `key_fn`. On a tie the bucket that reached the
/// top count first wins. Voting stops early once one bucket holds a strict
/// majority of `n`. Trials failing with a retryable error are skipped; a
/// non-retryable error aborts the vote. If every trial fails, the last error
/// is returned.
pub async fn best_out_of<T, K, F, Fut, KF>(n: usize, task: &str, mut op: F, key_fn: KF) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    K: Eq + Hash + Debug,
    KF: Fn(&T) -> K,
{
    let n = n.max(1);
    let mut buckets: IndexMap<K, (usize, T)> = IndexMap::new();
    let mut leader: Option<(usize, usize)> = None; // (bucket index, count)
    let mut last_error: Option<Error> = None;

    for trial in 0..n {
        let value = match op().await {
            Ok(value) => value,
            Err(e) if e.is_retryable() => {
                warn!(task, trial = trial + 1, error = %e, "vote failed, not counted");
                last_error = Some(e);
                continue;
            }
            Err(e) => return Err(e),
        };

        let key = key_fn(&value);
        debug!(task, trial = trial + 1, vote = ?key, "vote cast");

        let entry = buckets.entry(key);
        let index = entry.index();
        let count = {
            let bucket = entry.or_insert((0, value));
            bucket.0 += 1;
            bucket.0
        };

        if leader.map_or(true, |(_, best)| count > best) {
            leader = Some((index, count));
        }
        if count * 2 > n {
            debug!(task, trial = trial + 1, votes = count, "majority reached");
            break;
        }
    }

    match leader {
        Some((index, _)) => {
            let (_, (_, value)) = buckets
                .swap_remove_index(index)
                .ok_or_else(|| Error::InvalidConfiguration("vote bucket vanished".into()))?;
            Ok(value)
        }
        None => Err(last_error
            .unwrap_or_else(|| Error::InvalidConfiguration(format!("{task}: no votes cast")))),
    }
}
