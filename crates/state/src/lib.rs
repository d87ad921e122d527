//! `mailforge-state` — ephemeral per-batch runtime state.
//!
//! Counters, pause flag, and the generation epoch live here while a batch
//! dispatches. [`InMemoryStateStore`] backs tests/dev; the Redis backend is
//! behind the `redis` feature.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;

pub use memory::InMemoryStateStore;
#[cfg(feature = "redis")]
pub use redis::RedisStateStore;
pub use store::{BatchState, StateError, StateSeed, StateStore};
