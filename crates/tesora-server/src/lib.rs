//! Tesora Web Server
//!
//! Axum-based REST API behind the interactive statement review screen.
//!
//! - Layout analysis and the layout template cache
//! - Classification, streamed as server-sent events
//! - Learning rules, batch commit and ledger posting
//! - Sanitized error responses

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use tesora_core::{
    AIBackend, AIClient, ChartOfAccountsCache, Database, LedgerBackend, PromptLibrary,
    ServiceLayerClient,
};

mod handlers;

/// Shared application state
pub struct AppState {
    pub db: Database,
    pub ai: Option<AIClient>,
    pub prompts: PromptLibrary,
    /// External ledger used for posting and the chart of accounts
    pub ledger: Option<Arc<dyn LedgerBackend>>,
    pub chart_cache: ChartOfAccountsCache,
}

impl AppState {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            ai: None,
            prompts: PromptLibrary::new(),
            ledger: None,
            chart_cache: ChartOfAccountsCache::new(),
        }
    }

    /// State configured from the environment
    ///
    /// A ledger that fails to configure is logged and left out; the API
    /// still serves classification without it.
    pub fn from_env(db: Database) -> Self {
        let ai = AIClient::from_env();
        match &ai {
            Some(client) => info!(
                "AI backend configured: {} at {} (default model: {})",
                client.backend_name(),
                client.host(),
                client.model()
            ),
            None => info!("ℹ️  AI backend not configured (set OLLAMA_HOST to enable AI features)"),
        }

        let ledger: Option<Arc<dyn LedgerBackend>> = match ServiceLayerClient::from_env() {
            Ok(Some(client)) => {
                info!("Ledger configured: {}", client.base_url());
                Some(Arc::new(client))
            }
            Ok(None) => {
                info!("ℹ️  Ledger not configured (set SAP_SERVICE_LAYER_URL to enable posting)");
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to configure ledger client");
                None
            }
        };

        Self {
            ai,
            ledger,
            ..Self::new(db)
        }
    }

    pub fn with_ai(mut self, ai: AIClient) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerBackend>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_prompts(mut self, prompts: PromptLibrary) -> Self {
        self.prompts = prompts;
        self
    }
}

/// Create the application router with state from the environment
pub fn create_router(db: Database) -> Router {
    create_router_with_state(AppState::from_env(db))
}

/// Create the application router around prepared state (for testing)
pub fn create_router_with_state(state: AppState) -> Router {
    let state = Arc::new(state);

    let api_routes = Router::new()
        .route("/health", get(handlers::health))
        // Layout
        .route("/layout/analyze", post(handlers::analyze_layout))
        .route(
            "/layout/templates",
            get(handlers::list_layout_templates).post(handlers::remember_layout),
        )
        .route(
            "/layout/templates/:fingerprint",
            delete(handlers::forget_layout),
        )
        // Classification
        .route("/classify", post(handlers::classify_stream))
        .route("/classify/preview", post(handlers::classify_preview))
        // Rules
        .route("/rules", get(handlers::list_rules).post(handlers::save_rule))
        .route("/rules/match", post(handlers::match_rule))
        // Batches
        .route(
            "/batches",
            get(handlers::list_batches).post(handlers::create_batch),
        )
        .route("/batches/:id", get(handlers::get_batch))
        .route("/batches/:id/post", post(handlers::post_batch))
        .route("/batches/:id/reprocess", post(handlers::reprocess_batch))
        // Chart of accounts
        .route(
            "/chart-cache/:company_db",
            delete(handlers::invalidate_chart_cache),
        );

    // Development CORS: the review UI runs on its own dev server
    let cors = CorsLayer::permissive();

    Router::new()
        .nest("/api", api_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Start the server
pub async fn serve(db: Database, host: &str, port: u16) -> anyhow::Result<()> {
    // Batches left mid-post by a previous session can be reprocessed
    match db.recover_stuck_batches() {
        Ok(count) if count > 0 => {
            warn!(
                "⚠️  Recovered {} stuck batch(es) from previous server session",
                count
            );
        }
        Ok(_) => {}
        Err(e) => {
            warn!("Failed to recover stuck batches: {}", e);
        }
    }

    let state = AppState::from_env(db);
    check_ai_connection(state.ai.as_ref()).await;

    let app = create_router_with_state(state);
    let addr = format!("{}:{}", host, port);

    info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Check and log AI backend connection status
async fn check_ai_connection(ai: Option<&AIClient>) {
    let Some(client) = ai else {
        return;
    };

    if client.health_check().await {
        info!(
            "✅ AI backend connected: {} (model: {})",
            client.host(),
            client.model()
        );
    } else {
        warn!(
            "⚠️  AI backend configured but not responding: {} (model: {})",
            client.host(),
            client.model()
        );
    }
}

/// Generic success response
#[derive(serde::Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

// ============================================================================
// Error Handling
// ============================================================================

/// Application error type with proper HTTP status codes
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    internal: Option<anyhow::Error>,
}

impl AppError {
    pub fn bad_request(msg: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.to_string(),
            internal: None,
        }
    }

    pub fn not_found(msg: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.to_string(),
            internal: None,
        }
    }

    pub fn conflict(msg: &str) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.to_string(),
            internal: None,
        }
    }

    /// A collaborator (AI backend, ledger) is not configured
    pub fn unavailable(msg: &str) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: msg.to_string(),
            internal: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Log the full internal error if present
        if let Some(err) = &self.internal {
            error!(error = %err, "Internal error");
        }

        let body = Json(serde_json::json!({
            "error": self.message
        }));

        (self.status, body).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let err = err.into();

        if let Some(core) = err.downcast_ref::<tesora_core::Error>() {
            let status = match core {
                e if e.is_input_error() => Some(StatusCode::BAD_REQUEST),
                tesora_core::Error::NotFound(_) => Some(StatusCode::NOT_FOUND),
                tesora_core::Error::InvalidState(_) => Some(StatusCode::CONFLICT),
                _ => None,
            };
            if let Some(status) = status {
                return Self {
                    status,
                    message: core.to_string(),
                    internal: None,
                };
            }
        }

        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            // Return generic message to client
            message: "An internal error occurred".to_string(),
            // Keep full error for logging
            internal: Some(err),
        }
    }
}

#[cfg(test)]
mod tests;
