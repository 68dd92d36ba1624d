use axum::{
    extract::{Json, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use constant_time_eq::constant_time_eq;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};
use uuid::Uuid;

use crate::crypto::token_fingerprint;
use crate::metrics::metrics_handler;
use crate::models::{EntryStatus, NotificationCandidate, NotificationKind, ScheduledEntry};
use crate::push::PushSender;
use crate::scheduler::Scheduler;
use crate::settings::SettingsProvider;
use crate::store::StateStore;

const MAX_BODY_BYTES: usize = 64 * 1024;
const MAX_CONCURRENT_REQUESTS: usize = 256;

// Request and response models
#[derive(Deserialize)]
struct CancelMatchingRequest {
    recipient_id: String,
    kind: NotificationKind,
}

#[derive(Serialize)]
struct CancelMatchingResponse {
    cancelled: usize,
}

// Operator view; device tokens only appear as fingerprints
#[derive(Serialize)]
struct FailedEntryView {
    id: Uuid,
    recipient_id: String,
    kind: NotificationKind,
    token: String,
    attempts: u32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    failed_at: DateTime<Utc>,
}

impl From<ScheduledEntry> for FailedEntryView {
    fn from(entry: ScheduledEntry) -> Self {
        Self {
            id: entry.id,
            token: token_fingerprint(&entry.candidate.recipient_token),
            recipient_id: entry.candidate.recipient_id,
            kind: entry.candidate.kind,
            attempts: entry.retry_count + 1,
            last_error: entry.last_error,
            created_at: entry.created_at,
            failed_at: entry.updated_at,
        }
    }
}

pub struct ApiState<P, S, K> {
    pub scheduler: Arc<Scheduler<P, S, K>>,
    // Bearer token required on /notifications routes when set
    pub auth_token: Option<String>,
}

pub fn create_api_router<P, S, K>(state: Arc<ApiState<P, S, K>>) -> Router
where
    P: PushSender + Sync + 'static,
    S: SettingsProvider + Sync + 'static,
    K: StateStore + Sync + 'static,
{
    let notifications = Router::new()
        .route("/notifications", post(submit_notification::<P, S, K>))
        .route("/notifications/cancel", post(cancel_matching::<P, S, K>))
        .route("/notifications/failed", get(failed_notifications::<P, S, K>))
        .route("/notifications/:id", delete(cancel_notification::<P, S, K>))
        .route("/notifications/:id/opened", post(record_open::<P, S, K>))
        .route_layer(middleware::from_fn_with_state(state.auth_token.clone(), require_bearer))
        .with_state(state);

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(|| async { metrics_handler() }))
        .merge(notifications)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(CorsLayer::permissive())
}

async fn require_bearer(State(expected): State<Option<String>>, request: Request, next: Next) -> Response {
    if let Some(expected) = expected.as_deref() {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .unwrap_or_default();
        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            tracing::warn!(path = %request.uri().path(), "Rejected request with bad bearer token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(request).await
}

// API handlers
async fn submit_notification<P, S, K>(
    State(state): State<Arc<ApiState<P, S, K>>>,
    Json(candidate): Json<NotificationCandidate>,
) -> StatusCode
where
    P: PushSender + Sync + 'static,
    S: SettingsProvider + Sync + 'static,
    K: StateStore + Sync + 'static,
{
    // Producers are never told whether the candidate was admitted
    state.scheduler.submit(candidate).await;
    StatusCode::ACCEPTED
}

async fn cancel_notification<P, S, K>(
    State(state): State<Arc<ApiState<P, S, K>>>,
    Path(id): Path<Uuid>,
) -> StatusCode
where
    P: PushSender + Sync + 'static,
    S: SettingsProvider + Sync + 'static,
    K: StateStore + Sync + 'static,
{
    if state.scheduler.cancel(id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn cancel_matching<P, S, K>(
    State(state): State<Arc<ApiState<P, S, K>>>,
    Json(req): Json<CancelMatchingRequest>,
) -> Json<CancelMatchingResponse>
where
    P: PushSender + Sync + 'static,
    S: SettingsProvider + Sync + 'static,
    K: StateStore + Sync + 'static,
{
    let cancelled = state.scheduler.cancel_matching(&req.recipient_id, req.kind).await;
    tracing::info!(recipient_id = %req.recipient_id, kind = %req.kind, cancelled, "Bulk cancellation");
    Json(CancelMatchingResponse { cancelled })
}

async fn record_open<P, S, K>(State(state): State<Arc<ApiState<P, S, K>>>, Path(id): Path<Uuid>) -> StatusCode
where
    P: PushSender + Sync + 'static,
    S: SettingsProvider + Sync + 'static,
    K: StateStore + Sync + 'static,
{
    let opened_at = state.scheduler.now();
    if state.scheduler.record_open(id, opened_at) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn failed_notifications<P, S, K>(State(state): State<Arc<ApiState<P, S, K>>>) -> Json<Vec<FailedEntryView>>
where
    P: PushSender + Sync + 'static,
    S: SettingsProvider + Sync + 'static,
    K: StateStore + Sync + 'static,
{
    let failed = state
        .scheduler
        .entries_with_status(EntryStatus::Failed)
        .into_iter()
        .map(FailedEntryView::from)
        .collect();
    Json(failed)
}
