//! Test utilities for tesora-core
//!
//! This module provides a mock ledger service layer that speaks enough of the
//! SAP Business One Service Layer protocol to exercise `ServiceLayerClient`
//! end to end: cookie sessions, document creation, and a paginated chart of
//! accounts.
//!
//! Credentials are `manager` / `secret`. Any document whose `Memo` contains
//! `REJECT` is refused with a ledger error.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Json, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use tokio::sync::oneshot;

#[derive(Default)]
struct ServerState {
    sessions: Mutex<HashSet<String>>,
    next_session: AtomicUsize,
    next_document: AtomicI64,
    accounts: AtomicUsize,
    chart_requests: AtomicUsize,
    documents: Mutex<Vec<(String, Value)>>,
}

type SharedState = Arc<ServerState>;

/// Mock ledger service layer for integration tests
pub struct MockServiceLayerServer {
    addr: SocketAddr,
    state: SharedState,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockServiceLayerServer {
    /// Start the mock server on an available port
    pub async fn start() -> Self {
        let state: SharedState = Arc::new(ServerState {
            accounts: AtomicUsize::new(3),
            ..Default::default()
        });

        let app = Router::new()
            .route("/Login", post(handle_login))
            .route("/Logout", post(handle_logout))
            .route("/JournalEntries", post(handle_journal_entry))
            .route("/BankPages", post(handle_bank_page))
            .route("/VendorPayments", post(handle_vendor_payment))
            .route("/ChartOfAccounts", get(handle_chart))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Number of accounts in the generated chart
    pub fn with_accounts(self, count: usize) -> Self {
        self.state.accounts.store(count, Ordering::SeqCst);
        self
    }

    /// Get the base URL for this mock server
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn open_sessions(&self) -> usize {
        self.state.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn chart_requests(&self) -> usize {
        self.state.chart_requests.load(Ordering::SeqCst)
    }

    /// Accepted documents as `(endpoint, payload)`, in order
    pub fn documents(&self) -> Vec<(String, Value)> {
        self.state
            .documents
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// Stop the mock server
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockServiceLayerServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn ledger_error(status: StatusCode, code: i64, message: &str) -> Response {
    let body = json!({
        "error": {
            "code": code,
            "message": { "lang": "en-us", "value": message }
        }
    });
    (status, Json(body)).into_response()
}

fn session_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == "B1SESSION")
        .map(|(_, value)| value.to_string())
}

fn has_session(state: &ServerState, headers: &HeaderMap) -> bool {
    let Some(id) = session_from(headers) else {
        return false;
    };
    state.sessions.lock().map(|s| s.contains(&id)).unwrap_or(false)
}

async fn handle_login(State(state): State<SharedState>, Json(body): Json<Value>) -> Response {
    let user = body["UserName"].as_str().unwrap_or_default();
    let password = body["Password"].as_str().unwrap_or_default();
    if user != "manager" || password != "secret" {
        return ledger_error(StatusCode::UNAUTHORIZED, -304, "Invalid credentials");
    }
    if body["CompanyDB"].as_str().unwrap_or_default().is_empty() {
        return ledger_error(StatusCode::BAD_REQUEST, -1, "Company database is required");
    }

    let id = format!(
        "mock-{:08}",
        state.next_session.fetch_add(1, Ordering::SeqCst) + 1
    );
    state.sessions.lock().unwrap().insert(id.clone());

    (
        [(header::SET_COOKIE, format!("B1SESSION={}; HttpOnly; Path=/b1s/v1", id))],
        Json(json!({ "SessionId": id, "Version": "1000190", "SessionTimeout": 30 })),
    )
        .into_response()
}

async fn handle_logout(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Some(id) = session_from(&headers) {
        state.sessions.lock().unwrap().remove(&id);
    }
    StatusCode::NO_CONTENT.into_response()
}

fn create_document(
    state: &ServerState,
    headers: &HeaderMap,
    endpoint: &str,
    body: Value,
    id_field: &str,
) -> Response {
    if !has_session(state, headers) {
        return ledger_error(StatusCode::UNAUTHORIZED, 301, "Invalid session");
    }
    let memo = body["Memo"].as_str().unwrap_or_default();
    if memo.contains("REJECT") {
        return ledger_error(StatusCode::BAD_REQUEST, -5002, "Document rejected by ledger");
    }

    let number = state.next_document.fetch_add(1, Ordering::SeqCst) + 1;
    state
        .documents
        .lock()
        .unwrap()
        .push((endpoint.to_string(), body));

    (StatusCode::CREATED, Json(json!({ id_field: number }))).into_response()
}

async fn handle_journal_entry(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    create_document(&state, &headers, "JournalEntries", body, "JdtNum")
}

async fn handle_bank_page(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    create_document(&state, &headers, "BankPages", body, "Sequence")
}

async fn handle_vendor_payment(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    create_document(&state, &headers, "VendorPayments", body, "DocNum")
}

async fn handle_chart(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !has_session(&state, &headers) {
        return ledger_error(StatusCode::UNAUTHORIZED, 301, "Invalid session");
    }
    state.chart_requests.fetch_add(1, Ordering::SeqCst);

    let top: usize = params.get("$top").and_then(|v| v.parse().ok()).unwrap_or(20);
    let skip: usize = params.get("$skip").and_then(|v| v.parse().ok()).unwrap_or(0);
    let total = state.accounts.load(Ordering::SeqCst);

    let value: Vec<Value> = (skip..total.min(skip + top))
        .map(|i| {
            json!({
                "Code": format!("{}-{:04}", 1000 + i / 100, i % 100),
                "Name": format!("Cuenta {}", i + 1),
            })
        })
        .collect();

    Json(json!({ "value": value })).into_response()
}
