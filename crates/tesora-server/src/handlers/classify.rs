//! Statement classification handlers
//!
//! `POST /api/classify` streams the run as server-sent events:
//! - `progress`: one per pipeline event, data is the tagged event JSON
//! - `result`: the classified rows and their totals, sent last
//! - `error`: `{"error": "..."}` in place of `result` when the run fails

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::UnboundedReceiverStream, Stream, StreamExt};
use tracing::{error, info, warn};

use crate::{AppError, AppState};
use tesora_core::models::{
    ClassificationSummary, ClassifiedTransaction, ParseConfig, ProgressEvent, ProgressSink,
};
use tesora_core::{AIClient, BatchClassifier, ChunkedExtractor, MemoAnalyzer, SharedChart};

/// Request body for classification
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifyRequest {
    /// Decoded statement text
    pub content: String,
    pub parse_config: ParseConfig,
    /// Company whose chart of accounts the AI may choose from
    #[serde(default)]
    pub company_db: Option<String>,
    #[serde(default)]
    pub rules_only: bool,
}

#[derive(Debug, Serialize)]
pub struct ClassifyResponse {
    pub transactions: Vec<ClassifiedTransaction>,
    pub summary: ClassificationSummary,
}

fn validate(state: &AppState, req: &ClassifyRequest) -> Result<AIClient, AppError> {
    if req.content.trim().is_empty() {
        return Err(AppError::bad_request("The statement file is empty"));
    }
    state.ai.clone().ok_or_else(|| {
        AppError::unavailable("AI backend not configured; statements cannot be extracted")
    })
}

/// Chart of accounts for a company, empty when it cannot be had
///
/// An empty chart leaves every row no rule matches unclassified.
async fn load_chart(state: &AppState, company_db: Option<&str>) -> SharedChart {
    let company_db = company_db.map(str::trim).filter(|c| !c.is_empty());
    let (Some(company_db), Some(ledger)) = (company_db, state.ledger.as_ref()) else {
        return SharedChart::default();
    };

    match state
        .chart_cache
        .get_or_fetch(company_db, || ledger.fetch_chart(company_db))
        .await
    {
        Ok(chart) => chart,
        Err(e) => {
            warn!(company_db, error = %e, "Chart of accounts unavailable, AI pass disabled");
            SharedChart::default()
        }
    }
}

async fn run_classification(
    state: &AppState,
    ai: AIClient,
    req: &ClassifyRequest,
    progress: &ProgressSink,
) -> tesora_core::Result<ClassifyResponse> {
    let extractor = ChunkedExtractor::new(ai.clone(), state.prompts.clone());
    let transactions = extractor
        .extract(&req.content, &req.parse_config, progress)
        .await?;

    let chart = load_chart(state, req.company_db.as_deref()).await;
    let classifier = BatchClassifier::new(state.db.clone(), Some(ai), state.prompts.clone())
        .with_analyzer(MemoAnalyzer::from_config(&req.parse_config));
    let transactions = classifier
        .classify(transactions, &chart, req.rules_only, progress)
        .await?;

    let summary = ClassificationSummary::from_rows(&transactions);
    info!(
        total = summary.total_records,
        unclassified = summary.unclassified_count,
        "Classified statement"
    );

    Ok(ClassifyResponse {
        transactions,
        summary,
    })
}

fn sse_event<T: Serialize>(name: &str, data: &T) -> Event {
    Event::default()
        .event(name)
        .json_data(data)
        .unwrap_or_else(|e| {
            error!(error = %e, event = name, "Failed to encode SSE event");
            Event::default()
                .event("error")
                .data(r#"{"error":"An internal error occurred"}"#)
        })
}

/// Message safe to show the client for a failed run
fn public_message(err: &tesora_core::Error) -> String {
    if err.is_input_error() {
        err.to_string()
    } else {
        "Classification failed".to_string()
    }
}

/// POST /api/classify - Extract and classify a statement, streaming progress
pub async fn classify_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClassifyRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let ai = validate(&state, &req)?;
    let (tx, rx) = mpsc::unbounded_channel::<Event>();

    tokio::spawn(async move {
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let forward = tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = progress_rx.recv().await {
                if forward.send(sse_event("progress", &event)).is_err() {
                    break;
                }
            }
        });

        let progress: ProgressSink = Some(progress_tx);
        let result = run_classification(&state, ai, &req, &progress).await;

        // Closing the sink lets the forwarder drain and exit before the final event
        drop(progress);
        let _ = forwarder.await;

        let event = match result {
            Ok(response) => sse_event("result", &response),
            Err(e) => {
                warn!(error = %e, "Classification failed");
                sse_event("error", &serde_json::json!({ "error": public_message(&e) }))
            }
        };
        let _ = tx.send(event);
    });

    let stream = UnboundedReceiverStream::new(rx).map(Ok);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// POST /api/classify/preview - Same pipeline, one JSON response
pub async fn classify_preview(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClassifyRequest>,
) -> Result<Json<ClassifyResponse>, AppError> {
    let ai = validate(&state, &req)?;
    let response = run_classification(&state, ai, &req, &None).await?;
    Ok(Json(response))
}
