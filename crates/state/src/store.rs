//! Runtime state kept per batch while it dispatches.
//!
//! This store is ephemeral and cheap to hit on every job. The durable
//! registry only sees these counters at pause/completion boundaries.

use serde::{Deserialize, Serialize};

use mailforge_core::BatchId;

/// Live dispatch state of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchState {
    /// Sleep between consecutive sends, in milliseconds.
    pub delay_ms: u64,
    /// Successful sends per window before the auto-pause.
    pub window_size: u32,
    /// Successes inside the current window; resets at every boundary.
    pub window_count: u64,
    /// Successes over the batch's whole life. Monotonic; the authoritative
    /// completion signal (never inferred from queue depth).
    pub total_count: u64,
    /// Operator- or window-pause flag.
    pub paused: bool,
    /// Generation number. Bumped on every (re)initialization; jobs carry
    /// the epoch they were enqueued under and self-skip on mismatch.
    pub epoch: u64,
}

/// Values written by [`StateStore::init`].
#[derive(Debug, Clone, Copy)]
pub struct StateSeed {
    pub delay_ms: u64,
    pub window_size: u32,
    /// Carried forward from the registry's reconciled `sent_count` so the
    /// total stays monotonic across restarts.
    pub total_count: u64,
}

/// State store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateError {
    #[error("no runtime state for batch {0}")]
    Missing(BatchId),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("command error: {0}")]
    Command(String),

    #[error("corrupt state for batch {0}: {1}")]
    Corrupt(BatchId, String),
}

/// Ephemeral per-batch state store.
///
/// Increments are atomic server-side. All operations are single round
/// trips; the worker is the only writer of the counters (single-consumer
/// queue), the lifecycle manager writes settings/pause/epoch.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// (Re)initialize state for a batch: settings from `seed`, window
    /// counter zeroed, pause cleared, epoch bumped. Returns the new state
    /// including the fresh epoch, which the caller stamps onto jobs.
    async fn init(&self, batch_id: BatchId, seed: StateSeed) -> Result<BatchState, StateError>;

    /// One read answering paused/stale/settings together.
    async fn get(&self, batch_id: BatchId) -> Result<Option<BatchState>, StateError>;

    /// Atomically bump the in-window success counter; returns the new value.
    async fn incr_window(&self, batch_id: BatchId) -> Result<u64, StateError>;

    /// Atomically bump the lifetime success counter; returns the new value.
    async fn incr_total(&self, batch_id: BatchId) -> Result<u64, StateError>;

    /// Zero the in-window counter (window boundary).
    async fn reset_window(&self, batch_id: BatchId) -> Result<(), StateError>;

    async fn set_paused(&self, batch_id: BatchId, paused: bool) -> Result<(), StateError>;

    /// Drop all state for a batch (completion or purge).
    async fn delete(&self, batch_id: BatchId) -> Result<(), StateError>;
}
