//! Fire-and-forget notification dispatch.
//!
//! Side-effect events are POSTed to an external webhook on a spawned task;
//! the HTTP response a user is waiting for never blocks on delivery, and a
//! delivery failure is logged and counted but otherwise swallowed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

const NOTIFY_TIMEOUT_MS: u64 = 3000;

/// Events emitted by the analysis pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Notification {
    CriticalDiagnostic {
        user_id: String,
        diagnostic_id: String,
        code: String,
        description: String,
    },
    DiagnosticCompleted {
        user_id: String,
        diagnostic_id: String,
        total_findings: usize,
        critical_findings: usize,
    },
}

impl Notification {
    fn name(&self) -> &'static str {
        match self {
            Notification::CriticalDiagnostic { .. } => "critical_diagnostic",
            Notification::DiagnosticCompleted { .. } => "diagnostic_completed",
        }
    }
}

struct Channel {
    url: String,
    token: Option<String>,
    client: reqwest::Client,
}

/// Dispatcher for the external notification collaborator.  Cloning is cheap;
/// all clones share the same channel and counters.
#[derive(Clone)]
pub struct NotificationDispatcher {
    channel: Option<Arc<Channel>>,
    sent_total: Arc<AtomicU64>,
    failed_total: Arc<AtomicU64>,
}

impl NotificationDispatcher {
    pub fn new(url: Option<String>, token: Option<String>) -> Self {
        let channel = url.map(|url| {
            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_millis(NOTIFY_TIMEOUT_MS))
                .build()
                .expect("failed to build reqwest client");
            Arc::new(Channel { url, token, client })
        });
        if channel.is_none() {
            tracing::debug!("notification webhook not configured, dispatch disabled");
        }
        NotificationDispatcher {
            channel,
            sent_total: Arc::new(AtomicU64::new(0)),
            failed_total: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn disabled() -> Self {
        NotificationDispatcher::new(None, None)
    }

    /// Queue one event for delivery.  Returns immediately; the POST runs on
    /// its own task and its outcome only shows up in logs and counters.
    pub fn dispatch(&self, notification: Notification) {
        let Some(channel) = self.channel.clone() else {
            return;
        };
        let sent = self.sent_total.clone();
        let failed = self.failed_total.clone();
        tokio::spawn(async move {
            let event = notification.name();
            let mut rb = channel.client.post(&channel.url).json(&notification);
            if let Some(token) = &channel.token {
                rb = rb.bearer_auth(token);
            }
            match rb.send().await {
                Ok(resp) if resp.status().is_success() => {
                    sent.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(event, "notification dispatched");
                }
                Ok(resp) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(event, status = %resp.status(), "notification rejected");
                }
                Err(err) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(event, error = %err, "notification dispatch failed");
                }
            }
        });
    }

    pub fn sent_total(&self) -> &Arc<AtomicU64> {
        &self.sent_total
    }

    pub fn failed_total(&self) -> &Arc<AtomicU64> {
        &self.failed_total
    }
}
