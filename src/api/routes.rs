//! Router, shared state and handlers

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::ApiError;
use crate::application::ReconciliationEngine;
use crate::domain::requests::{
    AuditRequest, ComparisonRequest, OperationRequest, ReconciliationRequest,
    ReconciliationUpdateRequest, SearchRequest, UpdateRequest,
};
use crate::domain::{OperationSummary, StoreId, UpdateBatch};
use crate::infrastructure::history_repository::Exclusion;
use crate::infrastructure::sse::{self, EventStreamEncoder};
use crate::infrastructure::{SqliteExclusionStore, SqliteHistoryRecorder};

pub const OPERATION_ID_HEADER: &str = "x-operation-id";
const DEFAULT_HISTORY_LIMIT: u32 = 50;
const MAX_HISTORY_LIMIT: u32 = 500;

/// Cancellation tokens of operations whose stream is still open
#[derive(Debug, Default)]
pub struct LiveOperations {
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl LiveOperations {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn register(&self, id: Uuid, token: CancellationToken) {
        self.lock().insert(id, token);
    }

    /// Signals the operation; false when no such operation is live.
    pub fn cancel(&self, id: Uuid) -> bool {
        self.lock().get(&id).map(CancellationToken::cancel).is_some()
    }

    pub fn remove(&self, id: Uuid) {
        self.lock().remove(&id);
    }
}

/// Cancels its operation when the response body is dropped, which is also
/// how a client disconnect surfaces.
struct CancelOnDrop {
    id: Uuid,
    token: CancellationToken,
    operations: Arc<LiveOperations>,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.token.is_cancelled() {
            debug!(id = %self.id, "event stream dropped, cancelling operation");
        }
        self.token.cancel();
        self.operations.remove(self.id);
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: ReconciliationEngine,
    pub operations: Arc<LiveOperations>,
    pub encoder: EventStreamEncoder,
    pub history: Arc<SqliteHistoryRecorder>,
    pub exclusions: Arc<SqliteExclusionStore>,
}

impl AppState {
    pub fn new(
        engine: ReconciliationEngine,
        encoder: EventStreamEncoder,
        history: Arc<SqliteHistoryRecorder>,
        exclusions: Arc<SqliteExclusionStore>,
    ) -> Self {
        Self {
            engine,
            operations: Arc::new(LiveOperations::default()),
            encoder,
            history,
            exclusions,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/upc/search", post(search))
        .route("/api/upc/search/stream", post(search_stream))
        .route("/api/upc/update", post(update))
        .route("/api/upc/update/stream", post(update_stream))
        .route("/api/audit/stream", post(audit_stream))
        .route("/api/reconcile/stream", post(reconcile_stream))
        .route("/api/reconcile/update/stream", post(reconcile_update_stream))
        .route("/api/compare/stream", post(compare_stream))
        .route("/api/operations/{id}/cancel", post(cancel_operation))
        .route("/api/history", get(recent_history))
        .route(
            "/api/stores/{store_id}/exclusions",
            get(list_exclusions).post(add_exclusion),
        )
        .route(
            "/api/stores/{store_id}/exclusions/{code}",
            delete(remove_exclusion),
        )
        .with_state(state)
}

/// Validates, launches and answers with the operation's event stream.
fn stream_operation(state: &AppState, request: OperationRequest) -> Result<Response, ApiError> {
    let request = request.validated()?;
    let (handle, receiver) = state.engine.launch(request);
    let id = handle.id();
    let token = handle.cancellation_token();
    state.operations.register(id, token.clone());
    info!(%id, operation = %handle.kind(), "streaming operation");

    let guard = CancelOnDrop {
        id,
        token,
        operations: Arc::clone(&state.operations),
    };
    let frames = state.encoder.encode(receiver).map(move |frame| {
        let _live = &guard;
        frame
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, sse::CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(OPERATION_ID_HEADER, id.to_string())
        .body(Body::from_stream(frames))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<OperationSummary>, ApiError> {
    let request = OperationRequest::Search(request).validated()?;
    Ok(Json(state.engine.execute(request).await?))
}

async fn update(
    State(state): State<AppState>,
    Json(request): Json<UpdateRequest>,
) -> Result<Json<OperationSummary>, ApiError> {
    let request = OperationRequest::Update(request).validated()?;
    Ok(Json(state.engine.execute(request).await?))
}

async fn search_stream(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Response, ApiError> {
    stream_operation(&state, OperationRequest::Search(request))
}

async fn update_stream(
    State(state): State<AppState>,
    Json(request): Json<UpdateRequest>,
) -> Result<Response, ApiError> {
    stream_operation(&state, OperationRequest::Update(request))
}

async fn audit_stream(
    State(state): State<AppState>,
    Json(request): Json<AuditRequest>,
) -> Result<Response, ApiError> {
    stream_operation(&state, OperationRequest::Audit(request))
}

async fn reconcile_stream(
    State(state): State<AppState>,
    Json(request): Json<ReconciliationRequest>,
) -> Result<Response, ApiError> {
    stream_operation(&state, OperationRequest::Reconciliation(request))
}

async fn reconcile_update_stream(
    State(state): State<AppState>,
    Json(request): Json<ReconciliationUpdateRequest>,
) -> Result<Response, ApiError> {
    stream_operation(&state, OperationRequest::ReconciliationUpdate(request))
}

async fn compare_stream(
    State(state): State<AppState>,
    Json(request): Json<ComparisonRequest>,
) -> Result<Response, ApiError> {
    stream_operation(&state, OperationRequest::Comparison(request))
}

async fn cancel_operation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if state.operations.cancel(id) {
        info!(%id, "cancellation requested");
        Ok((StatusCode::ACCEPTED, Json(json!({ "operation_id": id, "cancelled": true }))))
    } else {
        Err(ApiError::NotFound(format!("no running operation {id}")))
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
}

async fn recent_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<UpdateBatch>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
    Ok(Json(state.history.recent(limit).await?))
}

#[derive(Debug, Deserialize)]
struct ExclusionBody {
    code: String,
    reason: Option<String>,
}

async fn list_exclusions(
    State(state): State<AppState>,
    Path(store_id): Path<i64>,
) -> Result<Json<Vec<Exclusion>>, ApiError> {
    Ok(Json(state.exclusions.list(StoreId(store_id)).await?))
}

async fn add_exclusion(
    State(state): State<AppState>,
    Path(store_id): Path<i64>,
    Json(body): Json<ExclusionBody>,
) -> Result<StatusCode, ApiError> {
    let code = body.code.trim();
    if code.is_empty() {
        return Err(ApiError::Validation("code cannot be empty".to_string()));
    }
    state
        .exclusions
        .exclude(StoreId(store_id), code, body.reason.as_deref())
        .await?;
    Ok(StatusCode::CREATED)
}

async fn remove_exclusion(
    State(state): State<AppState>,
    Path((store_id, code)): Path<(i64, String)>,
) -> Result<StatusCode, ApiError> {
    if state.exclusions.remove(StoreId(store_id), &code).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("{code} is not excluded for store {store_id}")))
    }
}
