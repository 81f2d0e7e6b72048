//! Server API tests

use super::*;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use tesora_core::models::{ChartAccount, NewLearningRule};
use tesora_core::{MockBackend, MockLedger};
use tower::ServiceExt;

const STATEMENT: &str = "BANCO DEMO SA\n\
    Fecha\tConcepto\tCargo\tAbono\n\
    03/03/2025\tSPEI RECIBIDO DE ACME SA DE CV\t\t15,000.00\n\
    04/03/2025\tCOMISION MANEJO CTA\t350.00\t\n";

const EXTRACTION: &str = r#"[
    {"sequence": 1, "due_date": "2025-03-03", "memo": "SPEI RECIBIDO DE ACME SA DE CV", "debit_amount": null, "credit_amount": "15,000.00"},
    {"sequence": 2, "due_date": "2025-03-04", "memo": "COMISION MANEJO CTA", "debit_amount": "350.00", "credit_amount": null}
]"#;

struct TestApp {
    router: Router,
    db: Database,
    ai: MockBackend,
    ledger: MockLedger,
}

fn setup_test_app() -> TestApp {
    let db = Database::in_memory().unwrap();
    let ai = MockBackend::new();
    let ledger = MockLedger::new().with_chart(vec![
        ChartAccount::new("401-00", "Ventas"),
        ChartAccount::new("600-10", "Comisiones bancarias"),
    ]);
    let state = AppState::new(db.clone())
        .with_prompts(PromptLibrary::embedded_only())
        .with_ai(AIClient::mock(ai.clone()))
        .with_ledger(Arc::new(ledger.clone()));

    TestApp {
        router: create_router_with_state(state),
        db,
        ai,
        ledger,
    }
}

fn setup_bare_app() -> (Router, Database) {
    let db = Database::in_memory().unwrap();
    let state = AppState::new(db.clone()).with_prompts(PromptLibrary::embedded_only());
    (create_router_with_state(state), db)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn delete_req(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn get_body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn get_body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// (event name, data) pairs of a complete SSE body
fn parse_sse(body: &str) -> Vec<(String, serde_json::Value)> {
    body.split("\n\n")
        .filter_map(|block| {
            let mut name = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(v) = line.strip_prefix("event:") {
                    name = Some(v.trim().to_string());
                } else if let Some(v) = line.strip_prefix("data:") {
                    data = serde_json::from_str(v.trim()).ok();
                }
            }
            Some((name?, data?))
        })
        .collect()
}

fn classify_body(company_db: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "content": STATEMENT,
        "parse_config": {"header_lines_count": 2},
        "company_db": company_db,
        "rules_only": false
    })
}

fn batch_body() -> serde_json::Value {
    serde_json::json!({
        "filename": "marzo.csv",
        "target": {
            "company_db": "SBO_DEMO",
            "bank_account_code": "102-01",
            "mode": "journal_entry"
        },
        "lines": [
            {
                "sequence": 1,
                "due_date": "2025-03-03",
                "memo": "SPEI RECIBIDO DE ACME SA DE CV",
                "credit_amount": "15000.00",
                "sap_account_code": "401-00"
            },
            {
                "sequence": 2,
                "due_date": "2025-03-04",
                "memo": "COMISION MANEJO CTA",
                "debit_amount": "350.00",
                "sap_account_code": "610-20",
                "ai_suggested_account": "600-10"
            }
        ]
    })
}

// ========== Health ==========

#[tokio::test]
async fn test_health_reports_collaborators() {
    let app = setup_test_app();
    let response = app.router.oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = get_body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["ai_available"], true);
    assert_eq!(json["ai_backend"], "mock");
    assert_eq!(json["ledger_configured"], true);
}

#[tokio::test]
async fn test_health_without_collaborators() {
    let (router, _db) = setup_bare_app();
    let json = get_body_json(router.oneshot(get("/api/health")).await.unwrap()).await;
    assert_eq!(json["ai_available"], false);
    assert!(json["ai_backend"].is_null());
    assert_eq!(json["ledger_configured"], false);
}

// ========== Layout ==========

#[tokio::test]
async fn test_analyze_layout_then_cache_hit() {
    let app = setup_test_app();
    app.ai.push_response(
        r#"{"bank_name_guess":"Banco Demo","header_lines_count":2,"column_description":"Fecha, Concepto, Cargo, Abono"}"#,
    );

    let response = app
        .router
        .clone()
        .oneshot(post_json("/api/layout/analyze", serde_json::json!({"content": STATEMENT})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let analysis = get_body_json(response).await;
    assert_eq!(analysis["is_cached"], false);
    assert_eq!(analysis["parse_config"]["header_lines_count"], 2);
    assert_eq!(analysis["bank_name_guess"], "Banco Demo");

    // Explicit remember step
    let response = app
        .router
        .clone()
        .oneshot(post_json(
            "/api/layout/templates",
            serde_json::json!({
                "fingerprint": analysis["fingerprint"],
                "bank_name_guess": analysis["bank_name_guess"],
                "parse_config": analysis["parse_config"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .router
        .oneshot(post_json("/api/layout/analyze", serde_json::json!({"content": STATEMENT})))
        .await
        .unwrap();
    let cached = get_body_json(response).await;
    assert_eq!(cached["is_cached"], true);
    assert_eq!(cached["fingerprint"], analysis["fingerprint"]);
    assert_eq!(app.ai.request_count(), 1);
}

#[tokio::test]
async fn test_analyze_layout_rejects_empty_file() {
    let app = setup_test_app();
    let response = app
        .router
        .oneshot(post_json("/api/layout/analyze", serde_json::json!({"content": "  \n"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.ai.request_count(), 0);
}

#[tokio::test]
async fn test_analyze_unknown_layout_without_ai() {
    let (router, _db) = setup_bare_app();
    let response = router
        .oneshot(post_json("/api/layout/analyze", serde_json::json!({"content": STATEMENT})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = get_body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("not configured"));
}

#[tokio::test]
async fn test_layout_templates_list_and_forget() {
    let (router, db) = setup_bare_app();
    db.save_layout_template("f00d", Some("BBVA"), &Default::default())
        .unwrap();

    let json = get_body_json(router.clone().oneshot(get("/api/layout/templates")).await.unwrap()).await;
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["fingerprint"], "f00d");

    let response = router
        .clone()
        .oneshot(delete_req("/api/layout/templates/f00d"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(delete_req("/api/layout/templates/f00d"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(db.list_layout_templates().unwrap().is_empty());
}

// ========== Classification ==========

#[tokio::test]
async fn test_classify_preview_uses_rules_and_ai() {
    let app = setup_test_app();
    app.db
        .create_rule(&NewLearningRule::contains("COMISION MANEJO", "600-10"))
        .unwrap();
    app.ai.push_response(EXTRACTION);
    app.ai
        .push_response(r#"[{"sequence":1,"sap_code":"401-00","confidence":90}]"#);

    let response = app
        .router
        .oneshot(post_json("/api/classify/preview", classify_body(Some("SBO_DEMO"))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = get_body_json(response).await;
    let rows = json["transactions"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["source"], "ai");
    assert_eq!(rows[0]["sap_account_code"], "401-00");
    assert_eq!(rows[1]["source"], "rule");
    assert_eq!(json["summary"]["total_records"], 2);
    assert_eq!(json["summary"]["unclassified_count"], 0);
    assert_eq!(app.ledger.logins(), 1);
}

#[tokio::test]
async fn test_classify_without_company_skips_ai_pass() {
    let app = setup_test_app();
    app.ai.push_response(EXTRACTION);

    let response = app
        .router
        .oneshot(post_json("/api/classify/preview", classify_body(None)))
        .await
        .unwrap();
    let json = get_body_json(response).await;

    assert_eq!(json["summary"]["unclassified_count"], 2);
    assert_eq!(app.ai.request_count(), 1);
    assert_eq!(app.ledger.logins(), 0);
}

#[tokio::test]
async fn test_classify_stream_ends_with_result() {
    let app = setup_test_app();
    app.ai.push_response(EXTRACTION);
    app.ai.push_response(
        r#"[{"sequence":1,"sap_code":"401-00","confidence":90},{"sequence":2,"sap_code":"600-10","confidence":70}]"#,
    );

    let response = app
        .router
        .oneshot(post_json("/api/classify", classify_body(Some("SBO_DEMO"))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let events = parse_sse(&get_body_text(response).await);
    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names.last(), Some(&"result"));
    assert!(names[..names.len() - 1].iter().all(|n| *n == "progress"));

    let kinds: Vec<&str> = events
        .iter()
        .filter(|(name, _)| name == "progress")
        .filter_map(|(_, data)| data["type"].as_str())
        .collect();
    assert_eq!(kinds.first(), Some(&"extraction_start"));
    assert!(kinds.contains(&"chunk_done"));
    assert!(kinds.contains(&"classification_start"));

    let (_, result) = events.last().unwrap();
    assert_eq!(result["summary"]["total_records"], 2);
    assert_eq!(result["transactions"][1]["sap_account_code"], "600-10");
}

#[tokio::test]
async fn test_classify_stream_reports_errors() {
    let app = setup_test_app();
    app.ai.push_response("I could not find any transactions.");

    let response = app
        .router
        .oneshot(post_json("/api/classify", classify_body(None)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let events = parse_sse(&get_body_text(response).await);
    let (name, data) = events.last().unwrap();
    assert_eq!(name, "error");
    assert!(data["error"].as_str().unwrap().contains("No transactions"));
    assert!(events.iter().all(|(name, _)| name != "result"));
}

#[tokio::test]
async fn test_classify_requires_ai() {
    let (router, _db) = setup_bare_app();
    let response = router
        .oneshot(post_json("/api/classify", classify_body(None)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

// ========== Rules ==========

#[tokio::test]
async fn test_save_rule_then_update() {
    let (router, _db) = setup_bare_app();
    let body = serde_json::json!({
        "memo": "COMISION MANEJO CTA",
        "pattern": "COMISION MANEJO",
        "sap_account_code": "600-10",
        "sap_account_name": "Comisiones bancarias"
    });

    let response = router.clone().oneshot(post_json("/api/rules", body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let saved = get_body_json(response).await;
    assert_eq!(saved["is_new"], true);
    assert_eq!(saved["rule"]["source"], "user_correction");

    let body = serde_json::json!({
        "memo": "COMISION MANEJO CTA",
        "pattern": "COMISION MANEJO",
        "sap_account_code": "610-20"
    });
    let saved = get_body_json(router.clone().oneshot(post_json("/api/rules", body)).await.unwrap()).await;
    assert_eq!(saved["is_new"], false);
    assert_eq!(saved["rule"]["sap_account_code"], "610-20");

    let rules = get_body_json(router.oneshot(get("/api/rules")).await.unwrap()).await;
    assert_eq!(rules.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_save_rule_requires_account() {
    let (router, _db) = setup_bare_app();
    let response = router
        .oneshot(post_json(
            "/api/rules",
            serde_json::json!({"memo": "NOMINA", "sap_account_code": " "}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_match_rule() {
    let (router, db) = setup_bare_app();
    db.create_rule(&NewLearningRule::contains("PAGO CFE", "610-05"))
        .unwrap();

    let json = get_body_json(
        router
            .clone()
            .oneshot(post_json(
                "/api/rules/match",
                serde_json::json!({"memo": "DOMICILIACION PAGO CFE 123"}),
            ))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(json["sap_account_code"], "610-05");

    let json = get_body_json(
        router
            .oneshot(post_json("/api/rules/match", serde_json::json!({"memo": "TELMEX"})))
            .await
            .unwrap(),
    )
    .await;
    assert!(json.is_null());
}

// ========== Batches ==========

#[tokio::test]
async fn test_commit_post_and_repost_conflict() {
    let app = setup_test_app();

    let response = app
        .router
        .clone()
        .oneshot(post_json("/api/batches", batch_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let batch = get_body_json(response).await;
    assert_eq!(batch["statement_number"], "2025-03-001");
    assert_eq!(batch["status"], "pending");
    assert_eq!(batch["lines"].as_array().unwrap().len(), 2);
    let id = batch["id"].as_i64().unwrap();

    let response = app
        .router
        .clone()
        .oneshot(post_json(&format!("/api/batches/{}/post", id), serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let outcome = get_body_json(response).await;
    assert_eq!(outcome["status"], "completed");
    assert_eq!(outcome["posted"], 2);
    assert_eq!(app.ledger.posted().len(), 2);

    let detail = get_body_json(
        app.router
            .clone()
            .oneshot(get(&format!("/api/batches/{}", id)))
            .await
            .unwrap(),
    )
    .await;
    assert!(detail["lines"][0]["external_ref"].is_i64());

    // Completed batches are final
    let response = app
        .router
        .oneshot(post_json(&format!("/api/batches/{}/post", id), serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(app.ledger.posted().len(), 2);
}

#[tokio::test]
async fn test_commit_learns_from_corrections() {
    let app = setup_test_app();
    let response = app
        .router
        .oneshot(post_json("/api/batches", batch_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // Learning runs in the background
    let mut learned = false;
    for _ in 0..50 {
        if app.db.count_rules().unwrap() > 0 {
            learned = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(learned);
    let rules = app.db.list_rules().unwrap();
    assert_eq!(rules[0].sap_account_code, "610-20");
}

#[tokio::test]
async fn test_commit_rejects_unassigned_line() {
    let app = setup_test_app();
    let mut body = batch_body();
    body["lines"][1]["sap_account_code"] = serde_json::Value::Null;

    let response = app
        .router
        .oneshot(post_json("/api/batches", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = get_body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("Line 2"));
    assert!(app.db.list_batches().unwrap().is_empty());
}

#[tokio::test]
async fn test_partial_failure_then_reprocess() {
    let app = setup_test_app();
    app.ledger.fail_memo("COMISION MANEJO CTA");

    let batch = get_body_json(
        app.router
            .clone()
            .oneshot(post_json("/api/batches", batch_body()))
            .await
            .unwrap(),
    )
    .await;
    let id = batch["id"].as_i64().unwrap();

    let outcome = get_body_json(
        app.router
            .clone()
            .oneshot(post_json(&format!("/api/batches/{}/post", id), serde_json::json!({})))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(outcome["status"], "failed");
    assert_eq!(outcome["error_message"], "1 of 2 rows failed to post");

    app.ledger.clear_failures();
    let outcome = get_body_json(
        app.router
            .oneshot(post_json(&format!("/api/batches/{}/reprocess", id), serde_json::json!({})))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(outcome["status"], "completed");
    assert_eq!(outcome["attempted"], 1);
    assert_eq!(app.ledger.posted_memos(), vec!["SPEI RECIBIDO DE ACME SA DE CV", "COMISION MANEJO CTA"]);
}

#[tokio::test]
async fn test_batch_not_found() {
    let app = setup_test_app();
    let response = app.router.clone().oneshot(get("/api/batches/99")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .router
        .oneshot(post_json("/api/batches/99/post", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_post_requires_ledger() {
    let (router, _db) = setup_bare_app();
    let batch = get_body_json(
        router
            .clone()
            .oneshot(post_json("/api/batches", batch_body()))
            .await
            .unwrap(),
    )
    .await;

    let response = router
        .oneshot(post_json(
            &format!("/api/batches/{}/post", batch["id"]),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

// ========== Chart cache ==========

#[tokio::test]
async fn test_invalidate_chart_cache() {
    let app = setup_test_app();
    app.ai.push_response(EXTRACTION);
    app.ai.push_response("[]");
    app.router
        .clone()
        .oneshot(post_json("/api/classify/preview", classify_body(Some("SBO_DEMO"))))
        .await
        .unwrap();

    let json = get_body_json(
        app.router
            .clone()
            .oneshot(delete_req("/api/chart-cache/SBO_DEMO"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(json["invalidated"], true);

    let json = get_body_json(
        app.router
            .oneshot(delete_req("/api/chart-cache/SBO_DEMO"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(json["invalidated"], false);
}

// ========== Error mapping ==========

#[test]
fn test_core_errors_map_to_status() {
    let err: AppError = tesora_core::Error::NotFound("Batch 4".into()).into();
    assert_eq!(err.status(), StatusCode::NOT_FOUND);
    assert_eq!(err.message(), "Not found: Batch 4");

    let err: AppError = tesora_core::Error::EmptyFile.into();
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);

    let err: AppError = tesora_core::Error::InvalidState("completed".into()).into();
    assert_eq!(err.status(), StatusCode::CONFLICT);

    let err: AppError = tesora_core::Error::Ledger("secret detail".into()).into();
    assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(err.message(), "An internal error occurred");
}
