//! Job payloads and the retry policy applied to failed sends.

use chrono::{DateTime, Utc};
use mailforge_core::email::EmailAddress;
use mailforge_core::id::{BatchId, BatchKey, EmailRecordId, JobId, UploadId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Everything the worker needs to deliver one email without touching the
/// registry first. The `epoch` is stamped at enqueue time; jobs whose epoch
/// no longer matches the batch runtime state are discarded on claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchJob {
    pub email: EmailAddress,
    pub record_id: EmailRecordId,
    pub batch_key: BatchKey,
    pub batch_id: BatchId,
    pub upload_id: UploadId,
    pub subject: String,
    pub body: String,
    pub epoch: u64,
}

/// Lifecycle of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be claimed.
    Waiting,
    /// Parked until `available_at`.
    Delayed,
    /// Claimed by the worker, outcome pending.
    Active,
    /// Delivered and acknowledged.
    Completed,
    /// Exhausted its retry budget.
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// A job as stored by the queue: payload plus bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub payload: DispatchJob,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl QueuedJob {
    pub fn new(payload: DispatchJob, delay: Option<Duration>) -> Self {
        let now = Utc::now();
        let available_at = match delay {
            Some(d) => now + chrono::Duration::from_std(d).unwrap_or_default(),
            None => now,
        };
        Self {
            id: JobId::new(),
            payload,
            attempts: 0,
            enqueued_at: now,
            available_at,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.available_at <= now
    }
}

/// How retry delays grow between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every attempt.
    Fixed,
    /// Delay doubles with each attempt.
    #[default]
    Exponential,
    /// Delay grows linearly with the attempt number.
    Linear,
}

/// Retry configuration for failed deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts before the job is parked as failed.
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling applied after backoff growth.
    pub max_delay: Duration,
    pub backoff: BackoffStrategy,
    /// Jitter factor in `[0.0, 1.0]` applied to the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff: BackoffStrategy::default(),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Every failure is terminal.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            backoff: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Whether a job that has failed `attempt` times earns another try.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before retrying after failure number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let raw = match self.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => base * 2f64.powi(attempt.saturating_sub(1) as i32),
            BackoffStrategy::Linear => base * attempt.max(1) as f64,
        };
        let capped = raw.min(self.max_delay.as_millis() as f64);
        // Deterministic jitter keyed off the attempt number keeps retries
        // spread out without dragging in an RNG.
        let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
        let jittered = capped * (1.0 + self.jitter * (pseudo_random - 0.5));
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// Snapshot of queue depth per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> DispatchJob {
        DispatchJob {
            email: "alice@example.com".parse().unwrap(),
            record_id: EmailRecordId::new(),
            batch_key: BatchKey::new(),
            batch_id: BatchId::new(),
            upload_id: UploadId::new(),
            subject: "Welcome".into(),
            body: "Hello Alice, welcome aboard.".into(),
            epoch: 1,
        }
    }

    #[test]
    fn queued_job_without_delay_is_due_immediately() {
        let queued = QueuedJob::new(job(), None);
        assert!(queued.is_due(Utc::now()));
        assert_eq!(queued.attempts, 0);
    }

    #[test]
    fn queued_job_with_delay_is_parked() {
        let queued = QueuedJob::new(job(), Some(Duration::from_secs(60)));
        assert!(!queued.is_due(Utc::now()));
        assert!(queued.available_at > queued.enqueued_at);
    }

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let policy = RetryPolicy::exponential(
            5,
            Duration::from_millis(100),
            Duration::from_millis(400),
        );
        let d1 = policy.delay_for_attempt(1);
        let d2 = policy.delay_for_attempt(2);
        let d3 = policy.delay_for_attempt(3);
        assert!(d2 > d1);
        assert!(d3 >= d2);
        // Cap plus at most half the jitter factor.
        assert!(d3 <= Duration::from_millis(420));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(1), policy.delay_for_attempt(1));
        let d = policy.delay_for_attempt(2);
        assert!(d >= Duration::from_millis(180) && d <= Duration::from_millis(220));
    }

    #[test]
    fn retry_budget_is_total_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn job_state_terminality() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Waiting.is_terminal());
        assert!(!JobState::Active.is_terminal());
    }

    #[test]
    fn dispatch_job_round_trips_through_json() {
        let original = job();
        let encoded = serde_json::to_string(&original).unwrap();
        let decoded: DispatchJob = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, original);
    }
}
