//! In-memory state store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use mailforge_core::BatchId;

use crate::store::{BatchState, StateError, StateSeed, StateStore};

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: RwLock<HashMap<BatchId, BatchState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait::async_trait]
impl StateStore for InMemoryStateStore {
    async fn init(&self, batch_id: BatchId, seed: StateSeed) -> Result<BatchState, StateError> {
        let mut states = self.states.write().unwrap();
        let epoch = states.get(&batch_id).map_or(0, |s| s.epoch) + 1;
        let state = BatchState {
            delay_ms: seed.delay_ms,
            window_size: seed.window_size,
            window_count: 0,
            total_count: seed.total_count,
            paused: false,
            epoch,
        };
        states.insert(batch_id, state);
        Ok(state)
    }

    async fn get(&self, batch_id: BatchId) -> Result<Option<BatchState>, StateError> {
        Ok(self.states.read().unwrap().get(&batch_id).copied())
    }

    async fn incr_window(&self, batch_id: BatchId) -> Result<u64, StateError> {
        let mut states = self.states.write().unwrap();
        let state = states
            .get_mut(&batch_id)
            .ok_or(StateError::Missing(batch_id))?;
        state.window_count += 1;
        Ok(state.window_count)
    }

    async fn incr_total(&self, batch_id: BatchId) -> Result<u64, StateError> {
        let mut states = self.states.write().unwrap();
        let state = states
            .get_mut(&batch_id)
            .ok_or(StateError::Missing(batch_id))?;
        state.total_count += 1;
        Ok(state.total_count)
    }

    async fn reset_window(&self, batch_id: BatchId) -> Result<(), StateError> {
        let mut states = self.states.write().unwrap();
        let state = states
            .get_mut(&batch_id)
            .ok_or(StateError::Missing(batch_id))?;
        state.window_count = 0;
        Ok(())
    }

    async fn set_paused(&self, batch_id: BatchId, paused: bool) -> Result<(), StateError> {
        let mut states = self.states.write().unwrap();
        let state = states
            .get_mut(&batch_id)
            .ok_or(StateError::Missing(batch_id))?;
        state.paused = paused;
        Ok(())
    }

    async fn delete(&self, batch_id: BatchId) -> Result<(), StateError> {
        self.states.write().unwrap().remove(&batch_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> StateSeed {
        StateSeed {
            delay_ms: 100,
            window_size: 3,
            total_count: 0,
        }
    }

    #[tokio::test]
    async fn init_bumps_epoch_and_resets_window() {
        let store = InMemoryStateStore::new();
        let batch = BatchId::new();

        let first = store.init(batch, seed()).await.unwrap();
        assert_eq!(first.epoch, 1);
        assert!(!first.paused);

        store.incr_window(batch).await.unwrap();
        store.set_paused(batch, true).await.unwrap();

        let second = store.init(batch, seed()).await.unwrap();
        assert_eq!(second.epoch, 2);
        assert_eq!(second.window_count, 0);
        assert!(!second.paused);
    }

    #[tokio::test]
    async fn init_seeds_total_from_reconciled_count() {
        let store = InMemoryStateStore::new();
        let batch = BatchId::new();

        let state = store
            .init(
                batch,
                StateSeed {
                    delay_ms: 0,
                    window_size: 3,
                    total_count: 6,
                },
            )
            .await
            .unwrap();
        assert_eq!(state.total_count, 6);
        assert_eq!(store.incr_total(batch).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn counters_increment_independently() {
        let store = InMemoryStateStore::new();
        let batch = BatchId::new();
        store.init(batch, seed()).await.unwrap();

        assert_eq!(store.incr_window(batch).await.unwrap(), 1);
        assert_eq!(store.incr_window(batch).await.unwrap(), 2);
        assert_eq!(store.incr_total(batch).await.unwrap(), 1);

        store.reset_window(batch).await.unwrap();
        let state = store.get(batch).await.unwrap().unwrap();
        assert_eq!(state.window_count, 0);
        assert_eq!(state.total_count, 1);
    }

    #[tokio::test]
    async fn increment_without_state_errors() {
        let store = InMemoryStateStore::new();
        let batch = BatchId::new();
        assert!(matches!(
            store.incr_window(batch).await,
            Err(StateError::Missing(_))
        ));
    }

    #[tokio::test]
    async fn delete_leaves_no_state() {
        let store = InMemoryStateStore::new();
        let batch = BatchId::new();
        store.init(batch, seed()).await.unwrap();
        store.delete(batch).await.unwrap();
        assert!(store.get(batch).await.unwrap().is_none());
    }
}
