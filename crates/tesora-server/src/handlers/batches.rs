//! Batch commit and posting handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::{info, warn};

use crate::{AppError, AppState};
use tesora_core::models::{Batch, BatchDetail, BatchLineInput, NewBatch, PostingOutcome};
use tesora_core::{commit_batch, LearningFeedbackLoop, LedgerPoster};

/// GET /api/batches - List batches, newest first
pub async fn list_batches(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Batch>>, AppError> {
    let batches = state.db.list_batches()?;
    Ok(Json(batches))
}

/// GET /api/batches/:id - Batch with its lines and posting results
pub async fn get_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<BatchDetail>, AppError> {
    let detail = state
        .db
        .get_batch_detail(id)?
        .ok_or_else(|| AppError::not_found("Batch not found"))?;
    Ok(Json(detail))
}

/// POST /api/batches - Commit reviewed rows as a pending batch
///
/// The learning loop runs in the background once the batch is stored; the
/// response does not wait for it.
pub async fn create_batch(
    State(state): State<Arc<AppState>>,
    Json(batch): Json<NewBatch>,
) -> Result<(StatusCode, Json<BatchDetail>), AppError> {
    let detail = commit_batch(&state.db, &batch)?;
    spawn_learning(&state, detail.batch.id, batch.lines);
    Ok((StatusCode::CREATED, Json(detail)))
}

fn spawn_learning(state: &AppState, batch_id: i64, lines: Vec<BatchLineInput>) {
    let learning = LearningFeedbackLoop::new(state.db.clone());
    tokio::task::spawn_blocking(move || match learning.learn(&lines) {
        Ok(outcome) => info!(
            batch_id,
            created = outcome.created,
            reinforced = outcome.reinforced,
            demoted = outcome.demoted,
            "Learned from committed batch"
        ),
        Err(e) => warn!(batch_id, error = %e, "Learning from committed batch failed"),
    });
}

fn poster(state: &AppState) -> Result<LedgerPoster, AppError> {
    let ledger = state
        .ledger
        .clone()
        .ok_or_else(|| AppError::unavailable("Ledger not configured"))?;
    Ok(LedgerPoster::new(state.db.clone(), ledger))
}

/// POST /api/batches/:id/post - Post a pending or failed batch
///
/// Posting runs on its own task so a client that disconnects mid-post does
/// not cut the run short.
pub async fn post_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<PostingOutcome>, AppError> {
    let poster = poster(&state)?;
    let outcome = tokio::spawn(async move { poster.post(id).await }).await??;
    Ok(Json(outcome))
}

/// POST /api/batches/:id/reprocess - Retry the unposted rows of a failed batch
pub async fn reprocess_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<PostingOutcome>, AppError> {
    let poster = poster(&state)?;
    let outcome = tokio::spawn(async move { poster.reprocess(id).await }).await??;
    Ok(Json(outcome))
}
