//! Batch API handlers
//!
//! POST /batches, GET /batches, DELETE /batches/:id

use axum::{
    extract::{Path, State},
    routing::{delete, get},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::assembler::StatusCounts;
use crate::error::{ApiError, ApiResult};
use crate::sink::MemorySink;
use crate::types::{BatchRequest, PhotoOutcome};
use crate::AppState;

/// POST /batches response
#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub batch_id: Uuid,
    pub cancelled: bool,
    pub counts: StatusCounts,
    pub elapsed_ms: u64,
    pub outcomes: Vec<PhotoOutcome>,
}

/// GET /batches response
#[derive(Debug, Serialize)]
pub struct ActiveBatchesResponse {
    pub batch_ids: Vec<Uuid>,
}

/// DELETE /batches/:id response
#[derive(Debug, Serialize)]
pub struct CancelBatchResponse {
    pub batch_id: Uuid,
    pub cancelled: bool,
    pub cancelled_at: chrono::DateTime<chrono::Utc>,
}

/// POST /batches
///
/// Runs the batch to completion and returns one outcome per photo. The
/// batch can be cancelled from another request while this one is pending.
pub async fn run_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> ApiResult<Json<BatchResponse>> {
    if request.photos.is_empty() {
        return Err(ApiError::BadRequest("Batch contains no photos".to_string()));
    }

    let batch_id = request.batch_id;
    let cancel = CancellationToken::new();
    {
        let mut tokens = state.cancellation_tokens.write().await;
        if tokens.contains_key(&batch_id) {
            return Err(ApiError::Conflict(format!(
                "Batch already running: {}",
                batch_id
            )));
        }
        tokens.insert(batch_id, cancel.clone());
    }

    tracing::info!(batch_id = %batch_id, photos = request.photos.len(), "Batch accepted");

    let sink = MemorySink::new();
    let result = state.pipeline.run_batch(request, &sink, &cancel).await;
    state.cancellation_tokens.write().await.remove(&batch_id);

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(batch_id = %batch_id, error = %e, "Batch failed");
            *state.last_error.write().await = Some(e.to_string());
            return Err(e.into());
        }
    };

    Ok(Json(BatchResponse {
        batch_id,
        cancelled: report.cancelled,
        counts: report.counts,
        elapsed_ms: report.elapsed_ms,
        outcomes: report.outcomes,
    }))
}

/// GET /batches
pub async fn list_batches(State(state): State<AppState>) -> Json<ActiveBatchesResponse> {
    let mut batch_ids: Vec<Uuid> = state.cancellation_tokens.read().await.keys().copied().collect();
    batch_ids.sort();
    Json(ActiveBatchesResponse { batch_ids })
}

/// DELETE /batches/:id
///
/// Stops new analysis requests; the pending POST returns with partial
/// (degraded) outcomes.
pub async fn cancel_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<CancelBatchResponse>> {
    let tokens = state.cancellation_tokens.read().await;
    let token = tokens
        .get(&batch_id)
        .ok_or_else(|| ApiError::NotFound(format!("Batch not running: {}", batch_id)))?;

    token.cancel();
    tracing::info!(batch_id = %batch_id, "Batch cancellation requested");

    Ok(Json(CancelBatchResponse {
        batch_id,
        cancelled: true,
        cancelled_at: chrono::Utc::now(),
    }))
}

/// Build batch routes
pub fn batch_routes() -> Router<AppState> {
    Router::new()
        .route("/batches", get(list_batches).post(run_batch))
        .route("/batches/:id", delete(cancel_batch))
}
