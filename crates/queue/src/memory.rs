//! In-memory queue used by tests and single-process deployments.

use crate::job::{DispatchJob, JobState, QueueCounts, QueuedJob, RetryPolicy};
use crate::queue::{DispatchQueue, QueueError};
use chrono::Utc;
use mailforge_core::id::{BatchId, JobId};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

struct Entry {
    state: JobState,
    job: QueuedJob,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<JobId, Entry>,
    completed: u64,
}

pub struct InMemoryQueue {
    inner: RwLock<Inner>,
    retry: RetryPolicy,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(retry: RetryPolicy) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            retry,
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DispatchQueue for InMemoryQueue {
    async fn enqueue(&self, job: DispatchJob, delay: Option<Duration>) -> Result<JobId, QueueError> {
        let queued = QueuedJob::new(job, delay);
        let id = queued.id;
        let state = if delay.is_some() {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        let mut inner = self.inner.write().unwrap();
        inner.entries.insert(id, Entry { state, job: queued });
        Ok(id)
    }

    async fn claim_next(&self) -> Result<Option<QueuedJob>, QueueError> {
        let now = Utc::now();
        let mut inner = self.inner.write().unwrap();

        for entry in inner.entries.values_mut() {
            if entry.state == JobState::Delayed && entry.job.is_due(now) {
                entry.state = JobState::Waiting;
            }
        }

        let next = inner
            .entries
            .values()
            .filter(|e| e.state == JobState::Waiting)
            .min_by_key(|e| (e.job.available_at, *e.job.id.as_uuid()))
            .map(|e| e.job.id);

        match next {
            Some(id) => {
                let entry = inner.entries.get_mut(&id).unwrap();
                entry.state = JobState::Active;
                Ok(Some(entry.job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut inner = self.inner.write().unwrap();
        if inner.entries.remove(&job.id).is_none() {
            return Err(QueueError::JobNotFound(job.id));
        }
        inner.completed += 1;
        Ok(())
    }

    async fn release(&self, job: &QueuedJob, delay: Duration) -> Result<(), QueueError> {
        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .entries
            .get_mut(&job.id)
            .ok_or(QueueError::JobNotFound(job.id))?;
        entry.state = JobState::Delayed;
        entry.job.available_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        Ok(())
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.write().unwrap();
        let entry = inner
            .entries
            .get_mut(&job.id)
            .ok_or(QueueError::JobNotFound(job.id))?;
        entry.job.attempts += 1;
        entry.job.last_error = Some(error.to_string());
        if self.retry.should_retry(entry.job.attempts) {
            let delay = self.retry.delay_for_attempt(entry.job.attempts);
            entry.state = JobState::Delayed;
            entry.job.available_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        } else {
            entry.state = JobState::Failed;
        }
        Ok(())
    }

    async fn remove_for_batch(&self, batch_id: BatchId) -> Result<usize, QueueError> {
        let mut inner = self.inner.write().unwrap();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| {
            !(matches!(e.state, JobState::Waiting | JobState::Delayed)
                && e.job.payload.batch_id == batch_id)
        });
        Ok(before - inner.entries.len())
    }

    async fn pending_for_batch(&self, batch_id: BatchId) -> Result<usize, QueueError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .entries
            .values()
            .filter(|e| {
                matches!(e.state, JobState::Waiting | JobState::Delayed | JobState::Active)
                    && e.job.payload.batch_id == batch_id
            })
            .count())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let inner = self.inner.read().unwrap();
        let mut counts = QueueCounts {
            completed: inner.completed,
            ..QueueCounts::default()
        };
        for entry in inner.entries.values() {
            match entry.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailforge_core::id::{BatchKey, EmailRecordId, UploadId};

    fn job_for(batch_id: BatchId, email: &str) -> DispatchJob {
        DispatchJob {
            email: email.parse().unwrap(),
            record_id: EmailRecordId::new(),
            batch_key: BatchKey::new(),
            batch_id,
            upload_id: UploadId::new(),
            subject: "Launch update".into(),
            body: "The new release ships on Friday.".into(),
            epoch: 1,
        }
    }

    #[tokio::test]
    async fn claims_jobs_in_enqueue_order() {
        let queue = InMemoryQueue::new();
        let batch = BatchId::new();
        queue.enqueue(job_for(batch, "a@example.com"), None).await.unwrap();
        queue.enqueue(job_for(batch, "b@example.com"), None).await.unwrap();

        let first = queue.claim_next().await.unwrap().unwrap();
        let second = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(first.payload.email.as_str(), "a@example.com");
        assert_eq!(second.payload.email.as_str(), "b@example.com");
        assert!(queue.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delayed_job_is_invisible_until_due() {
        let queue = InMemoryQueue::new();
        let batch = BatchId::new();
        queue
            .enqueue(job_for(batch, "a@example.com"), Some(Duration::from_millis(50)))
            .await
            .unwrap();

        assert!(queue.claim_next().await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(queue.claim_next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_requeues_without_consuming_an_attempt() {
        let queue = InMemoryQueue::new();
        let batch = BatchId::new();
        queue.enqueue(job_for(batch, "a@example.com"), None).await.unwrap();

        let claimed = queue.claim_next().await.unwrap().unwrap();
        queue.release(&claimed, Duration::ZERO).await.unwrap();

        let again = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(again.id, claimed.id);
        assert_eq!(again.attempts, 0);
    }

    #[tokio::test]
    async fn fail_retries_with_backoff_then_parks_the_job() {
        let queue = InMemoryQueue::with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO));
        let batch = BatchId::new();
        queue.enqueue(job_for(batch, "a@example.com"), None).await.unwrap();

        let first = queue.claim_next().await.unwrap().unwrap();
        queue.fail(&first, "450 mailbox busy").await.unwrap();

        let retried = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.last_error.as_deref(), Some("450 mailbox busy"));

        queue.fail(&retried, "450 mailbox busy").await.unwrap();
        assert!(queue.claim_next().await.unwrap().is_none());
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
    }

    #[tokio::test]
    async fn remove_for_batch_spares_active_and_other_batches() {
        let queue = InMemoryQueue::new();
        let doomed = BatchId::new();
        let other = BatchId::new();
        queue.enqueue(job_for(doomed, "a@example.com"), None).await.unwrap();
        queue.enqueue(job_for(doomed, "b@example.com"), None).await.unwrap();
        queue
            .enqueue(job_for(doomed, "c@example.com"), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        queue.enqueue(job_for(other, "d@example.com"), None).await.unwrap();

        // Claim one job from the doomed batch so it is active.
        let active = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(active.payload.batch_id, doomed);

        let removed = queue.remove_for_batch(doomed).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(queue.pending_for_batch(doomed).await.unwrap(), 1);
        assert_eq!(queue.pending_for_batch(other).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn counts_follow_the_job_lifecycle() {
        let queue = InMemoryQueue::new();
        let batch = BatchId::new();
        queue.enqueue(job_for(batch, "a@example.com"), None).await.unwrap();
        queue
            .enqueue(job_for(batch, "b@example.com"), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!((counts.waiting, counts.delayed), (1, 1));

        let claimed = queue.claim_next().await.unwrap().unwrap();
        let counts = queue.counts().await.unwrap();
        assert_eq!((counts.waiting, counts.active), (0, 1));

        queue.complete(&claimed).await.unwrap();
        let counts = queue.counts().await.unwrap();
        assert_eq!((counts.active, counts.completed), (0, 1));
    }
}
