//! Statement layout handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{AppError, AppState, SuccessResponse};
use tesora_core::layout::fingerprint;
use tesora_core::models::{BankLayoutTemplate, LayoutAnalysis, ParseConfig};
use tesora_core::LayoutInferrer;

/// Request body for layout analysis
#[derive(Debug, Deserialize)]
pub struct AnalyzeLayoutRequest {
    /// Decoded statement text
    pub content: String,
}

/// POST /api/layout/analyze - Infer (or recall) the layout of a statement
pub async fn analyze_layout(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeLayoutRequest>,
) -> Result<Json<LayoutAnalysis>, AppError> {
    if req.content.trim().is_empty() {
        return Err(AppError::bad_request("The statement file is empty"));
    }

    if state.ai.is_none() && state.db.get_layout_template(&fingerprint(&req.content))?.is_none() {
        return Err(AppError::unavailable(
            "AI backend not configured and this statement layout is not cached",
        ));
    }

    let inferrer = LayoutInferrer::new(state.db.clone(), state.ai.clone(), state.prompts.clone());
    let analysis = inferrer.infer(&req.content).await?;

    Ok(Json(analysis))
}

/// GET /api/layout/templates - List cached layouts, most used first
pub async fn list_layout_templates(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<BankLayoutTemplate>>, AppError> {
    let templates = state.db.list_layout_templates()?;
    Ok(Json(templates))
}

/// Request body for remembering a layout
#[derive(Debug, Deserialize)]
pub struct RememberLayoutRequest {
    pub fingerprint: String,
    #[serde(default)]
    pub bank_name_guess: Option<String>,
    pub parse_config: ParseConfig,
}

#[derive(Debug, Serialize)]
pub struct RememberLayoutResponse {
    pub fingerprint: String,
    /// False when a template for the fingerprint already existed
    pub created: bool,
}

/// POST /api/layout/templates - Store a confirmed layout for reuse
pub async fn remember_layout(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RememberLayoutRequest>,
) -> Result<(StatusCode, Json<RememberLayoutResponse>), AppError> {
    if req.fingerprint.trim().is_empty() {
        return Err(AppError::bad_request("Fingerprint is required"));
    }

    let created = state.db.save_layout_template(
        &req.fingerprint,
        req.bank_name_guess.as_deref(),
        &req.parse_config,
    )?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((
        status,
        Json(RememberLayoutResponse {
            fingerprint: req.fingerprint,
            created,
        }),
    ))
}

/// DELETE /api/layout/templates/:fingerprint - Forget a cached layout
pub async fn forget_layout(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    if !state.db.delete_layout_template(&fingerprint)? {
        return Err(AppError::not_found("Layout template not found"));
    }
    Ok(Json(SuccessResponse { success: true }))
}
