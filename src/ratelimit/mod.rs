//! Fixed-window rate limiting backed by a pluggable counter store.
//!
//! The limiter owns all access to [`WindowRecord`]s; no other component
//! reads or writes them.  Counting is correct per identity key only: two
//! concurrent first-requests for the same key may both observe "no window"
//! and each create one.  That race is tolerated: its worst outcome is a
//! slight, bounded over-admission within a single window, and the store
//! implementations keep the race window small by making increments a single
//! store-side operation instead of a read-modify-write round trip.

pub mod memory;
pub mod rest;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One counting bucket, owned by the limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowRecord {
    pub id: String,
    pub identity_key: String,
    pub endpoint: String,
    pub window_start: DateTime<Utc>,
    pub request_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// Failures surfaced by a counter store.  The limiter's policy, not the
/// store, decides what a failure means for the caller.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter store returned an unusable reply: {0}")]
    Malformed(String),
}

/// Keyed counter persistence with increment-or-create semantics.
#[async_trait::async_trait]
pub trait CounterStore: Send + Sync {
    /// The live window for `(identity_key, endpoint)`, if any record's
    /// `window_start` still falls inside `window`.
    async fn active_window(
        &self,
        identity_key: &str,
        endpoint: &str,
        window: Duration,
    ) -> Result<Option<WindowRecord>, StoreError>;

    /// Open a fresh window.  The record is born counting the current
    /// request, so `request_count` is 1.
    async fn create_window(
        &self,
        identity_key: &str,
        endpoint: &str,
    ) -> Result<WindowRecord, StoreError>;

    /// Count one more request in `window`, returning the new total.
    async fn increment(&self, window: &WindowRecord) -> Result<u32, StoreError>;
}

/// Requests-per-window policy applied to one endpoint.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn per_minute(limit: u32) -> Self {
        RateLimitPolicy {
            limit,
            window: Duration::seconds(60),
        }
    }
}

/// Outcome of one admission check.  Ephemeral, never persisted.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// True when the decision was produced by the fail-open path rather
    /// than by counting.  Observability only; never serialized to clients.
    pub fail_open: bool,
}

/// The identity a request is counted under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    User(String),
    Ip(String),
}

impl Identity {
    /// Namespaced store key, so a user id can never collide with an IP.
    pub fn key(&self) -> String {
        match self {
            Identity::User(id) => format!("user:{}", id),
            Identity::Ip(ip) => format!("ip:{}", ip),
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        RateLimiter { store }
    }

    /// Admission check for one request.
    ///
    /// Store failures never deny: the limiter fails open with
    /// `remaining = limit` so an unreachable store cannot become a total
    /// outage of the product.  Every fail-open decision is logged as a
    /// warning; the caller is expected to count them in a metric.
    pub async fn check(
        &self,
        identity_key: &str,
        endpoint: &str,
        policy: &RateLimitPolicy,
    ) -> RateLimitDecision {
        match self.counted_check(identity_key, endpoint, policy).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(
                    identity = %identity_key,
                    endpoint = %endpoint,
                    error = %err,
                    "counter store failure, rate limit failing open"
                );
                RateLimitDecision {
                    allowed: true,
                    remaining: policy.limit,
                    reset_at: Utc::now() + policy.window,
                    fail_open: true,
                }
            }
        }
    }

    async fn counted_check(
        &self,
        identity_key: &str,
        endpoint: &str,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitDecision, StoreError> {
        if let Some(existing) = self
            .store
            .active_window(identity_key, endpoint, policy.window)
            .await?
        {
            let reset_at = existing.window_start + policy.window;
            if existing.request_count >= policy.limit {
                return Ok(RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    reset_at,
                    fail_open: false,
                });
            }
            let new_count = self.store.increment(&existing).await?;
            return Ok(RateLimitDecision {
                allowed: true,
                remaining: policy.limit.saturating_sub(new_count),
                reset_at,
                fail_open: false,
            });
        }

        let window = self.store.create_window(identity_key, endpoint).await?;
        Ok(RateLimitDecision {
            allowed: true,
            remaining: policy.limit.saturating_sub(window.request_count),
            reset_at: window.window_start + policy.window,
            fail_open: false,
        })
    }
}
