//! HTTP listener for review events.
//!
//! - `POST /events` accepts one event in the stream-events JSON shape and
//!   queues it for the dispatcher. When a secret is configured the body must
//!   be signed with `X-Automerger-Signature: sha256=<hex hmac>`.
//! - `GET /health` reports liveness and dispatcher counters.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use automerger_core::ReviewEvent;

use crate::dispatcher::DispatchStats;

pub const SIGNATURE_HEADER: &str = "x-automerger-signature";

/// Shared state accessible from all handlers.
pub struct AppState {
    pub queue: mpsc::Sender<ReviewEvent>,
    /// Shared secret for event signatures; `None` accepts unsigned events.
    pub secret: Option<String>,
    pub stats: Arc<DispatchStats>,
}

#[derive(Debug, Serialize)]
struct EventResponse {
    accepted: bool,
    message: String,
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
    started_at: String,
    uptime_secs: u64,
    received: u64,
    processed: u64,
    ignored: u64,
    failed: u64,
    transient_failures: u64,
    redelivered: u64,
    abandoned: u64,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/events", post(receive_event))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `listen_addr` and serve until the task is aborted.
pub async fn serve(state: Arc<AppState>, listen_addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = listen_addr.parse()?;
    info!(addr = %addr, "starting event listener");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let stats = &state.stats;
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION"),
        started_at: stats.started_at.to_rfc3339(),
        uptime_secs: stats.uptime_secs(),
        received: stats.received.load(Ordering::Relaxed),
        processed: stats.processed.load(Ordering::Relaxed),
        ignored: stats.ignored.load(Ordering::Relaxed),
        failed: stats.failed.load(Ordering::Relaxed),
        transient_failures: stats.transient_failures.load(Ordering::Relaxed),
        redelivered: stats.redelivered.load(Ordering::Relaxed),
        abandoned: stats.abandoned.load(Ordering::Relaxed),
    })
}

async fn receive_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<EventResponse>), AppError> {
    if let Some(secret) = state.secret.as_deref() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("missing X-Automerger-Signature header".into()))?;
        verify_signature(&body, signature, secret)
            .map_err(|e| AppError::Unauthorized(format!("event verification failed: {e}")))?;
    }

    let event: ReviewEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid event payload: {e}")))?;

    if event == ReviewEvent::Other {
        debug!("ignoring unhandled event type");
        return Ok((
            StatusCode::OK,
            Json(EventResponse {
                accepted: false,
                message: "event type ignored".into(),
            }),
        ));
    }

    let kind = event.kind();
    let change = event.change().map(|c| c.number);
    state.queue.try_send(event).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => {
            warn!(kind, ?change, "event queue full, rejecting");
            AppError::Busy("event queue full, retry later".into())
        }
        mpsc::error::TrySendError::Closed(_) => AppError::Internal("dispatcher is not running".into()),
    })?;
    state.stats.received.fetch_add(1, Ordering::Relaxed);
    info!(kind, ?change, "event queued");

    Ok((
        StatusCode::ACCEPTED,
        Json(EventResponse {
            accepted: true,
            message: format!("{kind} queued"),
        }),
    ))
}

fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> Result<(), String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let sig_hex = signature
        .strip_prefix("sha256=")
        .ok_or("signature must start with sha256=")?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| format!("HMAC init failed: {e}"))?;
    mac.update(payload);

    let expected = hex::decode(sig_hex).map_err(|e| format!("invalid hex in signature: {e}"))?;
    mac.verify_slice(&expected)
        .map_err(|_| "signature mismatch".to_string())
}

// ---------------------------------------------------------------------------
// Error type for handlers
// ---------------------------------------------------------------------------

pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Busy(String),
    Internal(String),
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Busy(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}
