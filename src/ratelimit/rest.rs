//! Counter store adapter for a managed PostgREST-style row store.
//!
//! Rows live in a `rate_limit_windows` table; increments go through the
//! `increment_window` stored procedure so the count update is a single
//! store-side operation.  Physical cleanup of aged-out rows is the
//! platform's housekeeping job, not ours; `active_window` simply filters
//! them out with a range condition.

use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{CounterStore, StoreError, WindowRecord};

const STORE_TIMEOUT_MS: u64 = 1500;

pub struct RestCounterStore {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl RestCounterStore {
    /// `base_url` is the REST root, e.g. `https://db.example.com/rest/v1`.
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(STORE_TIMEOUT_MS))
            .build()
            .expect("failed to build reqwest client");
        RestCounterStore {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        }
    }

    fn authed(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => rb.header("apikey", key).bearer_auth(key),
            None => rb,
        }
    }

    async fn read_rows(&self, resp: reqwest::Response) -> Result<Vec<WindowRecord>, StoreError> {
        if !resp.status().is_success() {
            return Err(StoreError::Unavailable(format!(
                "store replied with status {}",
                resp.status()
            )));
        }
        resp.json::<Vec<WindowRecord>>()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))
    }
}

#[derive(Deserialize)]
struct IncrementReply {
    request_count: u32,
}

#[async_trait::async_trait]
impl CounterStore for RestCounterStore {
    async fn active_window(
        &self,
        identity_key: &str,
        endpoint: &str,
        window: Duration,
    ) -> Result<Option<WindowRecord>, StoreError> {
        let cutoff = (Utc::now() - window).to_rfc3339();
        let url = format!("{}/rate_limit_windows", self.base_url);
        let resp = self
            .authed(self.client.get(&url).query(&[
                ("identity_key", format!("eq.{}", identity_key)),
                ("endpoint", format!("eq.{}", endpoint)),
                ("window_start", format!("gte.{}", cutoff)),
                ("order", "window_start.desc".to_string()),
                ("limit", "1".to_string()),
            ]))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut rows = self.read_rows(resp).await?;
        let first = rows.drain(..).next();
        Ok(first)
    }

    async fn create_window(
        &self,
        identity_key: &str,
        endpoint: &str,
    ) -> Result<WindowRecord, StoreError> {
        let now = Utc::now();
        let url = format!("{}/rate_limit_windows", self.base_url);
        let resp = self
            .authed(self.client.post(&url))
            .header("prefer", "return=representation")
            .json(&json!({
                "identity_key": identity_key,
                "endpoint": endpoint,
                "window_start": now.to_rfc3339(),
                "request_count": 1,
                "updated_at": now.to_rfc3339(),
            }))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut rows = self.read_rows(resp).await?;
        let first = rows.drain(..).next();
        first.ok_or_else(|| StoreError::Malformed("insert returned no row".into()))
    }

    async fn increment(&self, window: &WindowRecord) -> Result<u32, StoreError> {
        let url = format!("{}/rpc/increment_window", self.base_url);
        let resp = self
            .authed(self.client.post(&url))
            .json(&json!({ "window_id": window.id }))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(StoreError::Unavailable(format!(
                "store replied with status {}",
                resp.status()
            )));
        }
        // The procedure returns either the bare new count or the updated row.
        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        if let Some(count) = value.as_u64() {
            return Ok(count as u32);
        }
        serde_json::from_value::<IncrementReply>(value)
            .map(|r| r.request_count)
            .map_err(|e| StoreError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, routing::post, Json, Router};
    use tokio::net::TcpListener;

    async fn start_store_stub() -> String {
        async fn rows() -> Json<serde_json::Value> {
            Json(serde_json::json!([{
                "id": "w-1",
                "identity_key": "user:a",
                "endpoint": "diagnose",
                "window_start": Utc::now().to_rfc3339(),
                "request_count": 4,
                "updated_at": Utc::now().to_rfc3339(),
            }]))
        }
        async fn bump() -> Json<serde_json::Value> {
            Json(serde_json::json!(5))
        }
        let app = Router::new()
            .route("/rate_limit_windows", get(rows).post(rows))
            .route("/rpc/increment_window", post(bump));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn reads_active_window_row() {
        let base = start_store_stub().await;
        let store = RestCounterStore::new(base, None);
        let found = store
            .active_window("user:a", "diagnose", Duration::seconds(60))
            .await
            .unwrap()
            .expect("row expected");
        assert_eq!(found.id, "w-1");
        assert_eq!(found.request_count, 4);
    }

    #[tokio::test]
    async fn increment_accepts_bare_count_reply() {
        let base = start_store_stub().await;
        let store = RestCounterStore::new(base, None);
        let window = store.create_window("user:a", "diagnose").await.unwrap();
        assert_eq!(store.increment(&window).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn unreachable_store_maps_to_unavailable() {
        let store = RestCounterStore::new("http://127.0.0.1:1".into(), None);
        let err = store
            .active_window("user:a", "diagnose", Duration::seconds(60))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
