//! Health check handler

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::AppState;
use tesora_core::AIBackend;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub ai_available: bool,
    pub ai_backend: Option<&'static str>,
    pub ledger_configured: bool,
}

/// GET /api/health - Server status and collaborator availability
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let ai_available = match &state.ai {
        Some(ai) => ai.health_check().await,
        None => false,
    };

    Json(HealthResponse {
        status: "ok",
        ai_available,
        ai_backend: state.ai.as_ref().map(|ai| ai.backend_name()),
        ledger_configured: state.ledger.is_some(),
    })
}
