//! The dispatch queue contract shared by in-memory and Redis backends.

use crate::job::{DispatchJob, QueueCounts, QueuedJob};
use mailforge_core::id::{BatchId, JobId};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("queue serialization error: {0}")]
    Serialization(String),

    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),
}

impl QueueError {
    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }

    pub fn connection(err: impl std::fmt::Display) -> Self {
        Self::Connection(err.to_string())
    }

    pub fn command(err: impl std::fmt::Display) -> Self {
        Self::Command(err.to_string())
    }
}

/// Durable work queue for outbound emails.
///
/// The queue holds one job per recipient and hands them to a single consumer.
/// Completion and failure are explicit acknowledgements: a claimed job stays
/// active until the worker settles it, so a crash mid-send leaves the job
/// recoverable rather than lost.
#[async_trait::async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Add a job, optionally parked for `delay` before it becomes claimable.
    async fn enqueue(&self, job: DispatchJob, delay: Option<Duration>) -> Result<JobId, QueueError>;

    /// Claim the oldest due job, promoting any delayed jobs that have come
    /// due first. Returns `None` when nothing is claimable.
    async fn claim_next(&self) -> Result<Option<QueuedJob>, QueueError>;

    /// Acknowledge a claimed job as delivered.
    async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError>;

    /// Put a claimed job back as delayed without consuming an attempt.
    /// Used when the batch is paused rather than when delivery failed.
    async fn release(&self, job: &QueuedJob, delay: Duration) -> Result<(), QueueError>;

    /// Record a delivery failure. Consumes an attempt; the job is re-parked
    /// with backoff while the retry budget lasts, then marked failed.
    async fn fail(&self, job: &QueuedJob, error: &str) -> Result<(), QueueError>;

    /// Drop every waiting and delayed job for a batch. Active jobs are left
    /// alone; the epoch check discards them on claim. Returns how many jobs
    /// were removed.
    async fn remove_for_batch(&self, batch_id: BatchId) -> Result<usize, QueueError>;

    /// Jobs still in flight for a batch (waiting, delayed or active).
    async fn pending_for_batch(&self, batch_id: BatchId) -> Result<usize, QueueError>;

    /// Depth of each queue state, for health output and tests.
    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}
