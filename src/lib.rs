//! Core library for Scanwise.  This module wires together the diagnostic
//! analysis pipeline, request/response structures and HTTP handlers: the
//! rate-limit gate, the schema validator, the external reasoner with its
//! deterministic fallback, and the fire-and-forget notification hooks.

mod config;
pub mod fallback;
pub mod notify;
pub mod ratelimit;
pub mod reasoner;
pub mod telemetry;
pub mod validate;

pub use config::{AppConfig, RotationConfig};

use axum::extract::rejection::{BytesRejection, FailedToBufferBody, JsonRejection};
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Instant;

use crate::notify::{Notification, NotificationDispatcher};
use crate::ratelimit::memory::MemoryCounterStore;
use crate::ratelimit::rest::RestCounterStore;
use crate::ratelimit::{CounterStore, Identity, RateLimitPolicy, RateLimiter};
use crate::reasoner::{DisabledReasoner, HttpReasoner, Reasoner};
use crate::telemetry::{AnalysisEvent, RotatingWriter, TelemetrySink};
use crate::validate::Validator;

/// Endpoint name used as the rate-limit bucket for the analysis route.
pub const DIAGNOSE_ENDPOINT: &str = "diagnose";

/// Raw inbound body of `POST /api/diagnose`.  Every field is optional at
/// the wire level so the validator can aggregate all problems instead of
/// serde failing on the first missing field.

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DiagnoseBody {
    #[serde(default)]
    pub dtc_codes: Vec<String>,
    pub vehicle_brand: Option<String>,
    pub vehicle_model: Option<String>,
    pub vehicle_year: Option<i64>,
    pub diagnostic_id: Option<String>,
    pub user_id: Option<String>,
    pub vehicle_id: Option<String>,
}

/// Urgency classification of one finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    Attention,
    Preventive,
}

/// One conclusion per submitted trouble code.  Produced by the reasoner on
/// success and by the fallback synthesizer otherwise; never persisted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticFinding {
    pub code: String,
    pub description: String,
    pub priority: Priority,
    pub severity: u8,
    pub can_diy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diy_difficulty: Option<u8>,
    pub probable_causes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_url: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VehicleInfo {
    pub brand: String,
    pub model: String,
    pub year: i32,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DiagnoseResponse {
    pub success: bool,
    pub diagnostics: Vec<DiagnosticFinding>,
    pub vehicle_info: VehicleInfo,
    pub has_critical: bool,
    pub total_items: usize,
}

#[derive(Debug, Serialize, Clone)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitedBody {
    pub error: String,
    pub retry_after: i64,
    pub remaining: u32,
}

/// Internal application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub limiter: RateLimiter,
    pub policy: RateLimitPolicy,
    pub validator: Validator,
    pub reasoner: Arc<dyn Reasoner>,
    pub notifier: NotificationDispatcher,
    pub telemetry: TelemetrySink,
    pub max_request_bytes: Option<usize>,
    pub store_kind: &'static str,
    pub reasoner_kind: &'static str,
    // Metrics counters
    pub metric_requests_total: Arc<AtomicU64>,
    pub metric_rate_limited_total: Arc<AtomicU64>,
    pub metric_fail_open_total: Arc<AtomicU64>,
    pub metric_validation_failures_total: Arc<AtomicU64>,
    pub metric_fallback_total: Arc<AtomicU64>,
    pub metric_critical_total: Arc<AtomicU64>,
    // Fixed latency histogram (bucket upper bounds in ms) for completed analyses
    pub hist_buckets: Arc<Vec<u64>>,
    pub hist_counts: Arc<Vec<AtomicU64>>,
    pub hist_sum_ms: Arc<AtomicU64>,
    pub hist_count: Arc<AtomicU64>,
    // Process start (epoch secs) and instant for uptime computation
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

/// Build state from a parsed configuration.  Infallible: an unopenable
/// telemetry file disables telemetry with a warning rather than aborting.
pub fn build_state(config: AppConfig) -> AppState {
    let (store, store_kind): (Arc<dyn CounterStore>, &'static str) = match &config.counter_store_url
    {
        Some(url) => (
            Arc::new(RestCounterStore::new(
                url.clone(),
                config.counter_store_key.clone(),
            )),
            "rest",
        ),
        None => (Arc::new(MemoryCounterStore::new()), "memory"),
    };

    let (reasoner, reasoner_kind): (Arc<dyn Reasoner>, &'static str) = match &config.reasoner_url {
        Some(url) => (
            Arc::new(HttpReasoner::new(
                url.clone(),
                config.reasoner_api_key.clone(),
                config.reasoner_model.clone(),
                config.reasoner_timeout_ms,
            )),
            "http",
        ),
        None => {
            tracing::warn!("reasoner endpoint not configured; every analysis will use fallback findings");
            (Arc::new(DisabledReasoner), "disabled")
        }
    };

    let telemetry_writer = match config.log_file.as_deref() {
        Some(path) => match RotatingWriter::open(
            path,
            config.rotation.max_bytes,
            config.rotation.keep,
            config.rotation.compress,
        ) {
            Ok(writer) => Some(Arc::new(Mutex::new(writer))),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Failed to open LOG_FILE for telemetry; telemetry disabled");
                None
            }
        },
        None => None,
    };
    let telemetry = TelemetrySink::new(telemetry_writer, config.log_stdout);

    let buckets: Vec<u64> = vec![1, 2, 5, 10, 20, 50, 100, 200, 500, 1000, 2000, 5000, 10000];

    let start_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();

    AppState {
        limiter: RateLimiter::new(store),
        policy: RateLimitPolicy {
            limit: config.rate_limit,
            window: chrono::Duration::seconds(config.rate_window_secs as i64),
        },
        validator: Validator::for_current_year(),
        reasoner,
        notifier: NotificationDispatcher::new(config.notify_url, config.notify_token),
        telemetry,
        max_request_bytes: config.max_request_bytes,
        store_kind,
        reasoner_kind,
        metric_requests_total: Arc::new(AtomicU64::new(0)),
        metric_rate_limited_total: Arc::new(AtomicU64::new(0)),
        metric_fail_open_total: Arc::new(AtomicU64::new(0)),
        metric_validation_failures_total: Arc::new(AtomicU64::new(0)),
        metric_fallback_total: Arc::new(AtomicU64::new(0)),
        metric_critical_total: Arc::new(AtomicU64::new(0)),
        hist_counts: Arc::new(buckets.iter().map(|_| AtomicU64::new(0)).collect()),
        hist_buckets: Arc::new(buckets),
        hist_sum_ms: Arc::new(AtomicU64::new(0)),
        hist_count: Arc::new(AtomicU64::new(0)),
        process_start_epoch: start_time.as_secs_f64(),
        process_start_instant: Instant::now(),
    }
}

/// Build state from environment variables.  See `AppConfig::from_env` for
/// the variable list.
pub fn build_state_from_env() -> anyhow::Result<AppState> {
    Ok(build_state(AppConfig::from_env()?))
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let router = Router::new()
        .route("/api/diagnose", post(diagnose_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.with_state(state)
}

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

fn rate_limited_response(limit: u32, reset_at: chrono::DateTime<chrono::Utc>) -> axum::response::Response {
    let millis = (reset_at - chrono::Utc::now()).num_milliseconds().max(0);
    let retry_after = (millis + 999) / 1000;
    let body = RateLimitedBody {
        error: "Limite de requisições excedido. Tente novamente em instantes.".into(),
        retry_after,
        remaining: 0,
    };
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u32));
    response
}

/// Rate-limit identity: authenticated user id, else client IP (forwarded
/// hop first), else none; no identity means unconditional denial.
fn select_identity(
    body: &DiagnoseBody,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> Option<Identity> {
    if let Some(user_id) = body
        .user_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return Some(Identity::User(user_id.to_string()));
    }
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            return Some(Identity::Ip(first.to_string()));
        }
    }
    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return Some(Identity::Ip(real_ip.to_string()));
    }
    peer.map(|addr| Identity::Ip(addr.ip().to_string()))
}

/// Handler for `POST /api/diagnose`, the analysis pipeline.
///
/// Gate order is uniform: parse, rate-limit, validate, reason (with
/// fallback substitution), classify, notify, respond.  Rate limiting runs
/// before schema validation so abusive traffic is rejected before any CPU
/// is spent on it; the counter consumed by a request that later fails
/// validation is not refunded.
async fn diagnose_handler(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<DiagnoseBody>, JsonRejection>,
) -> axum::response::Response {
    state.metric_requests_total.fetch_add(1, Ordering::Relaxed);

    let body = match payload {
        Ok(Json(inner)) => inner,
        Err(rejection) => return handle_json_rejection(&state, rejection),
    };

    let identity = match select_identity(&body, &headers, connect_info.map(|ci| ci.0)) {
        Some(identity) => identity,
        None => {
            tracing::warn!("request carried no user id and no client address, denying");
            state
                .metric_rate_limited_total
                .fetch_add(1, Ordering::Relaxed);
            return rate_limited_response(
                state.policy.limit,
                chrono::Utc::now() + state.policy.window,
            );
        }
    };
    let identity_key = identity.key();

    let decision = state
        .limiter
        .check(&identity_key, DIAGNOSE_ENDPOINT, &state.policy)
        .await;
    if decision.fail_open {
        state.metric_fail_open_total.fetch_add(1, Ordering::Relaxed);
    }
    if !decision.allowed {
        state
            .metric_rate_limited_total
            .fetch_add(1, Ordering::Relaxed);
        return rate_limited_response(state.policy.limit, decision.reset_at);
    }

    let request = match state.validator.validate(&body) {
        Ok(request) => request,
        Err(err) => {
            state
                .metric_validation_failures_total
                .fetch_add(1, Ordering::Relaxed);
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: err.to_string(),
                }),
            )
                .into_response();
        }
    };

    let start = Instant::now();
    let (findings, fallback_used) = match state.reasoner.analyze(&request).await {
        Ok(findings) => (findings, false),
        Err(err) => {
            tracing::warn!(error = %err, codes = request.trouble_codes.len(), "reasoner produced no usable result, synthesizing fallback findings");
            state.metric_fallback_total.fetch_add(1, Ordering::Relaxed);
            (fallback::synthesize(&request.trouble_codes), true)
        }
    };

    let critical_count = findings
        .iter()
        .filter(|f| f.priority == Priority::Critical)
        .count();
    let has_critical = critical_count > 0;
    if has_critical {
        state.metric_critical_total.fetch_add(1, Ordering::Relaxed);
    }

    // Side effects: best-effort, never blocking the response.
    if let (Some(user_id), Some(diagnostic_id)) = (&request.user_id, &request.diagnostic_id) {
        if let Some(first_critical) = findings.iter().find(|f| f.priority == Priority::Critical) {
            state.notifier.dispatch(Notification::CriticalDiagnostic {
                user_id: user_id.clone(),
                diagnostic_id: diagnostic_id.clone(),
                code: first_critical.code.clone(),
                description: first_critical.description.clone(),
            });
        }
        state.notifier.dispatch(Notification::DiagnosticCompleted {
            user_id: user_id.clone(),
            diagnostic_id: diagnostic_id.clone(),
            total_findings: findings.len(),
            critical_findings: critical_count,
        });
    }

    let latency_ms = start.elapsed().as_millis();
    let latency_u64 = latency_ms as u64;
    state.hist_sum_ms.fetch_add(latency_u64, Ordering::Relaxed);
    state.hist_count.fetch_add(1, Ordering::Relaxed);
    for (idx, upper) in state.hist_buckets.iter().enumerate() {
        if latency_u64 <= *upper {
            state.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
            break;
        }
    }

    state.telemetry.emit(&AnalysisEvent {
        identity: &identity_key,
        endpoint: DIAGNOSE_ENDPOINT,
        code_count: request.trouble_codes.len(),
        fallback_used,
        has_critical,
        latency_ms,
    });

    let total_items = findings.len();
    let response = DiagnoseResponse {
        success: true,
        diagnostics: findings,
        vehicle_info: VehicleInfo {
            brand: request.vehicle_brand,
            model: request.vehicle_model,
            year: request.vehicle_year,
        },
        has_critical,
        total_items,
    };
    (StatusCode::OK, Json(response)).into_response()
}

fn handle_json_rejection(state: &AppState, rejection: JsonRejection) -> axum::response::Response {
    match rejection {
        JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        )) => {
            if let Some(limit) = state.max_request_bytes {
                tracing::warn!(limit, "request body exceeded configured limit");
            } else {
                tracing::warn!("request body exceeded limit but no max_request_bytes configured");
            }
            let message = match state.max_request_bytes {
                Some(limit) => format!("Request too large (body exceeded limit {} bytes)", limit),
                None => "Request too large".to_string(),
            };
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(ErrorBody { error: message }),
            )
                .into_response()
        }
        other => {
            let status = other.status();
            (
                status,
                Json(ErrorBody {
                    error: other.body_text(),
                }),
            )
                .into_response()
        }
    }
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> axum::response::Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "reasoner": state.reasoner_kind,
        "store": state.store_kind,
        "rateLimit": state.policy.limit,
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition. Text format with simple counters.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    use std::fmt::Write as _;
    let mut buf = String::new();

    let counters: [(&str, &str, u64); 10] = [
        (
            "scanwise_requests_total",
            "Total diagnose requests received",
            state.metric_requests_total.load(Ordering::Relaxed),
        ),
        (
            "scanwise_rate_limited_total",
            "Requests denied by the rate limiter",
            state.metric_rate_limited_total.load(Ordering::Relaxed),
        ),
        (
            "scanwise_rate_limit_fail_open_total",
            "Admissions granted because the counter store was unreachable",
            state.metric_fail_open_total.load(Ordering::Relaxed),
        ),
        (
            "scanwise_validation_failures_total",
            "Requests rejected by schema validation",
            state
                .metric_validation_failures_total
                .load(Ordering::Relaxed),
        ),
        (
            "scanwise_fallback_total",
            "Analyses served from the fallback synthesizer",
            state.metric_fallback_total.load(Ordering::Relaxed),
        ),
        (
            "scanwise_critical_total",
            "Analyses that produced at least one critical finding",
            state.metric_critical_total.load(Ordering::Relaxed),
        ),
        (
            "scanwise_notifications_sent_total",
            "Notification events delivered to the webhook",
            state.notifier.sent_total().load(Ordering::Relaxed),
        ),
        (
            "scanwise_notifications_failed_total",
            "Notification events that could not be delivered",
            state.notifier.failed_total().load(Ordering::Relaxed),
        ),
        (
            "scanwise_telemetry_lines_total",
            "Telemetry JSON lines written",
            state.telemetry.lines_total().load(Ordering::Relaxed),
        ),
        (
            "scanwise_telemetry_write_errors_total",
            "Telemetry JSON line write failures",
            state.telemetry.write_errors_total().load(Ordering::Relaxed),
        ),
    ];
    for (name, help, value) in counters {
        writeln!(&mut buf, "# HELP {} {}", name, help).ok();
        writeln!(&mut buf, "# TYPE {} counter", name).ok();
        writeln!(&mut buf, "{} {}", name, value).ok();
    }

    // Latency histogram over completed analyses
    writeln!(
        &mut buf,
        "# HELP scanwise_analysis_latency_ms Analysis latency histogram milliseconds"
    )
    .ok();
    writeln!(&mut buf, "# TYPE scanwise_analysis_latency_ms histogram").ok();
    let mut cumulative: u64 = 0;
    for (i, upper) in state.hist_buckets.iter().enumerate() {
        cumulative += state.hist_counts[i].load(Ordering::Relaxed);
        writeln!(
            &mut buf,
            "scanwise_analysis_latency_ms_bucket{{le=\"{}\"}} {}",
            upper, cumulative
        )
        .ok();
    }
    let count = state.hist_count.load(Ordering::Relaxed);
    writeln!(
        &mut buf,
        "scanwise_analysis_latency_ms_bucket{{le=\"+Inf\"}} {}",
        count
    )
    .ok();
    writeln!(
        &mut buf,
        "scanwise_analysis_latency_ms_sum {}",
        state.hist_sum_ms.load(Ordering::Relaxed)
    )
    .ok();
    writeln!(&mut buf, "scanwise_analysis_latency_ms_count {}", count).ok();

    writeln!(
        &mut buf,
        "# HELP scanwise_log_file_size_bytes Current size in bytes of active telemetry log file (0 if disabled)\n# TYPE scanwise_log_file_size_bytes gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "scanwise_log_file_size_bytes {}",
        state.telemetry.file_size_bytes().load(Ordering::Relaxed)
    )
    .ok();

    writeln!(
        &mut buf,
        "# HELP scanwise_build_info Build information\n# TYPE scanwise_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "scanwise_build_info{{version=\"{}\",store=\"{}\",reasoner=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION"),
        state.store_kind,
        state.reasoner_kind
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP scanwise_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE scanwise_process_start_time_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "scanwise_process_start_time_seconds {}",
        state.process_start_epoch
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP scanwise_process_uptime_seconds Process uptime seconds\n# TYPE scanwise_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "scanwise_process_uptime_seconds {}",
        state.process_start_instant.elapsed().as_secs_f64()
    )
    .ok();

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buf,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn identity_prefers_authenticated_user() {
        let body = DiagnoseBody {
            user_id: Some("u-7".into()),
            ..DiagnoseBody::default()
        };
        let headers = headers_with(&[("x-forwarded-for", "203.0.113.9")]);
        let peer: SocketAddr = "10.0.0.1:9999".parse().unwrap();
        assert_eq!(
            select_identity(&body, &headers, Some(peer)),
            Some(Identity::User("u-7".into()))
        );
    }

    #[test]
    fn identity_falls_back_to_forwarded_then_peer() {
        let body = DiagnoseBody::default();
        let headers = headers_with(&[("x-forwarded-for", "203.0.113.9, 198.51.100.2")]);
        assert_eq!(
            select_identity(&body, &headers, None),
            Some(Identity::Ip("203.0.113.9".into()))
        );

        let peer: SocketAddr = "10.0.0.1:9999".parse().unwrap();
        assert_eq!(
            select_identity(&body, &HeaderMap::new(), Some(peer)),
            Some(Identity::Ip("10.0.0.1".into()))
        );
    }

    #[test]
    fn no_identity_at_all_is_none() {
        assert_eq!(
            select_identity(&DiagnoseBody::default(), &HeaderMap::new(), None),
            None
        );
    }

    #[test]
    fn finding_serialization_omits_absent_optionals() {
        let finding = DiagnosticFinding {
            code: "P0171".into(),
            description: "Mistura pobre".into(),
            priority: Priority::Attention,
            severity: 5,
            can_diy: false,
            diy_difficulty: None,
            probable_causes: vec!["vacuum leak".into()],
            solution_url: None,
        };
        let v = serde_json::to_value(&finding).unwrap();
        assert_eq!(v["priority"], "attention");
        assert_eq!(v["canDiy"], false);
        assert!(v.get("diyDifficulty").is_none());
        assert!(v.get("solutionUrl").is_none());
    }
}
