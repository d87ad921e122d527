//! Durable work queue for outbound email jobs.
//!
//! One job per recipient, claimed by a single consumer. The in-memory
//! backend serves tests and single-process runs; the Redis backend keeps
//! jobs across restarts.

pub mod job;
pub mod memory;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis;

pub use job::{BackoffStrategy, DispatchJob, JobState, QueueCounts, QueuedJob, RetryPolicy};
pub use memory::InMemoryQueue;
pub use queue::{DispatchQueue, QueueError};
#[cfg(feature = "redis")]
pub use redis::RedisQueue;
