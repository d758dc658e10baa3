//! In-process counter store on a concurrent map.
//!
//! Default store when no external row store is configured.  Each map slot
//! holds the newest window for its `(identity, endpoint)` pair; aged-out
//! windows are overwritten in place rather than cleaned up separately.

use chrono::{Duration, Utc};
use dashmap::DashMap;

use super::{CounterStore, StoreError, WindowRecord};

type SlotKey = (String, String);

#[derive(Default)]
pub struct MemoryCounterStore {
    windows: DashMap<SlotKey, WindowRecord>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        MemoryCounterStore::default()
    }

    fn slot(identity_key: &str, endpoint: &str) -> SlotKey {
        (identity_key.to_string(), endpoint.to_string())
    }
}

#[async_trait::async_trait]
impl CounterStore for MemoryCounterStore {
    async fn active_window(
        &self,
        identity_key: &str,
        endpoint: &str,
        window: Duration,
    ) -> Result<Option<WindowRecord>, StoreError> {
        let cutoff = Utc::now() - window;
        let found = self
            .windows
            .get(&Self::slot(identity_key, endpoint))
            .filter(|record| record.value().window_start >= cutoff)
            .map(|record| record.value().clone());
        Ok(found)
    }

    async fn create_window(
        &self,
        identity_key: &str,
        endpoint: &str,
    ) -> Result<WindowRecord, StoreError> {
        let now = Utc::now();
        let record = WindowRecord {
            id: format!("{}|{}", identity_key, endpoint),
            identity_key: identity_key.to_string(),
            endpoint: endpoint.to_string(),
            window_start: now,
            request_count: 1,
            updated_at: now,
        };
        // Last writer wins under a concurrent first-request race; the
        // resulting over-admission is bounded and tolerated.
        self.windows
            .insert(Self::slot(identity_key, endpoint), record.clone());
        Ok(record)
    }

    async fn increment(&self, window: &WindowRecord) -> Result<u32, StoreError> {
        if let Some(mut slot) = self
            .windows
            .get_mut(&Self::slot(&window.identity_key, &window.endpoint))
        {
            if slot.window_start == window.window_start {
                slot.request_count += 1;
                slot.updated_at = Utc::now();
                return Ok(slot.request_count);
            }
        }
        // The window was replaced underneath us (rollover race); count the
        // request against the snapshot we were handed.
        Ok(window.request_count + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_read_back() {
        let store = MemoryCounterStore::new();
        let created = store.create_window("user:a", "diagnose").await.unwrap();
        assert_eq!(created.request_count, 1);

        let found = store
            .active_window("user:a", "diagnose", Duration::seconds(60))
            .await
            .unwrap()
            .expect("window should be live");
        assert_eq!(found.window_start, created.window_start);
    }

    #[tokio::test]
    async fn stale_window_is_invisible() {
        let store = MemoryCounterStore::new();
        store.create_window("user:a", "diagnose").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let found = store
            .active_window("user:a", "diagnose", Duration::milliseconds(10))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn increment_returns_running_total() {
        let store = MemoryCounterStore::new();
        let window = store.create_window("ip:9.9.9.9", "diagnose").await.unwrap();
        assert_eq!(store.increment(&window).await.unwrap(), 2);
        assert_eq!(store.increment(&window).await.unwrap(), 3);
    }
}
