//! Chart of accounts cache handler

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct InvalidateChartResponse {
    pub company_db: String,
    /// False when nothing was cached for the company
    pub invalidated: bool,
}

/// DELETE /api/chart-cache/:company_db - Refetch the chart on next use
pub async fn invalidate_chart_cache(
    State(state): State<Arc<AppState>>,
    Path(company_db): Path<String>,
) -> Json<InvalidateChartResponse> {
    let invalidated = state.chart_cache.invalidate(&company_db);
    Json(InvalidateChartResponse {
        company_db,
        invalidated,
    })
}
