//! Redis-backed state store.
//!
//! One hash per batch at `mailforge:batch:{id}`:
//! `delay_ms`, `window_size`, `window_count`, `total_count`, `paused`
//! (0/1), `epoch`. HINCRBY gives the atomic server-side increments the
//! counters rely on; HGETALL makes the worker's per-job check one round
//! trip.

use std::collections::HashMap;

use redis::aio::MultiplexedConnection;
use tracing::instrument;

use mailforge_core::BatchId;

use crate::store::{BatchState, StateError, StateSeed, StateStore};

const STATE_KEY_PREFIX: &str = "mailforge:batch:";

fn state_key(batch_id: BatchId) -> String {
    format!("{STATE_KEY_PREFIX}{batch_id}")
}

#[derive(Clone)]
pub struct RedisStateStore {
    conn: MultiplexedConnection,
}

impl RedisStateStore {
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, StateError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StateError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }

    async fn incr_field(&self, batch_id: BatchId, field: &str) -> Result<u64, StateError> {
        let mut conn = self.conn.clone();
        let key = state_key(batch_id);

        // Single writer per batch, so exists-then-incr has no lost-update
        // window worth guarding; the check keeps a purged batch from being
        // resurrected as a partial hash.
        let exists: bool = redis::cmd("EXISTS")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StateError::Command(e.to_string()))?;
        if !exists {
            return Err(StateError::Missing(batch_id));
        }

        redis::cmd("HINCRBY")
            .arg(&key)
            .arg(field)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| StateError::Command(e.to_string()))
    }

    async fn set_field(
        &self,
        batch_id: BatchId,
        field: &str,
        value: u64,
    ) -> Result<(), StateError> {
        let mut conn = self.conn.clone();
        let key = state_key(batch_id);

        let exists: bool = redis::cmd("EXISTS")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StateError::Command(e.to_string()))?;
        if !exists {
            return Err(StateError::Missing(batch_id));
        }

        redis::cmd("HSET")
            .arg(&key)
            .arg(field)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StateError::Command(e.to_string()))
    }
}

fn parse_field(
    batch_id: BatchId,
    map: &HashMap<String, String>,
    field: &str,
) -> Result<u64, StateError> {
    map.get(field)
        .ok_or_else(|| StateError::Corrupt(batch_id, format!("missing field {field}")))?
        .parse::<u64>()
        .map_err(|e| StateError::Corrupt(batch_id, format!("field {field}: {e}")))
}

#[async_trait::async_trait]
impl StateStore for RedisStateStore {
    #[instrument(skip(self), fields(batch = %batch_id), err)]
    async fn init(&self, batch_id: BatchId, seed: StateSeed) -> Result<BatchState, StateError> {
        let mut conn = self.conn.clone();
        let key = state_key(batch_id);

        // HSET overwrites settings/counters, HINCRBY preserves and bumps
        // the epoch; atomic so a concurrently read state is never half-new.
        let (epoch,): (u64,) = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("delay_ms")
            .arg(seed.delay_ms)
            .arg("window_size")
            .arg(seed.window_size)
            .arg("window_count")
            .arg(0u64)
            .arg("total_count")
            .arg(seed.total_count)
            .arg("paused")
            .arg(0u8)
            .ignore()
            .cmd("HINCRBY")
            .arg(&key)
            .arg("epoch")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| StateError::Command(e.to_string()))?;

        Ok(BatchState {
            delay_ms: seed.delay_ms,
            window_size: seed.window_size,
            window_count: 0,
            total_count: seed.total_count,
            paused: false,
            epoch,
        })
    }

    async fn get(&self, batch_id: BatchId) -> Result<Option<BatchState>, StateError> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(state_key(batch_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| StateError::Command(e.to_string()))?;

        if map.is_empty() {
            return Ok(None);
        }

        Ok(Some(BatchState {
            delay_ms: parse_field(batch_id, &map, "delay_ms")?,
            window_size: parse_field(batch_id, &map, "window_size")? as u32,
            window_count: parse_field(batch_id, &map, "window_count")?,
            total_count: parse_field(batch_id, &map, "total_count")?,
            paused: parse_field(batch_id, &map, "paused")? != 0,
            epoch: parse_field(batch_id, &map, "epoch")?,
        }))
    }

    async fn incr_window(&self, batch_id: BatchId) -> Result<u64, StateError> {
        self.incr_field(batch_id, "window_count").await
    }

    async fn incr_total(&self, batch_id: BatchId) -> Result<u64, StateError> {
        self.incr_field(batch_id, "total_count").await
    }

    async fn reset_window(&self, batch_id: BatchId) -> Result<(), StateError> {
        self.set_field(batch_id, "window_count", 0).await
    }

    async fn set_paused(&self, batch_id: BatchId, paused: bool) -> Result<(), StateError> {
        self.set_field(batch_id, "paused", paused as u64).await
    }

    #[instrument(skip(self), fields(batch = %batch_id), err)]
    async fn delete(&self, batch_id: BatchId) -> Result<(), StateError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(state_key(batch_id))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StateError::Command(e.to_string()))
    }
}
