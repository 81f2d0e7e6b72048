//! Learning rule handlers

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Deserialize;

use crate::{AppError, AppState};
use tesora_core::models::{LearningRule, MatchType, RuleType, SavedRule};
use tesora_core::{LearningFeedbackLoop, RuleMatcher};

/// GET /api/rules - List rules in match order
pub async fn list_rules(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<LearningRule>>, AppError> {
    let rules = state.db.list_rules()?;
    Ok(Json(rules))
}

/// Request body for the review screen's "save rule" action
#[derive(Debug, Deserialize)]
pub struct SaveRuleRequest {
    /// Memo of the row the operator is looking at
    pub memo: String,
    /// Explicit pattern; derived from the memo when absent
    #[serde(default)]
    pub pattern: Option<String>,
    pub sap_account_code: String,
    #[serde(default)]
    pub sap_account_name: Option<String>,
    #[serde(default)]
    pub match_type: MatchType,
    #[serde(default)]
    pub rule_type: Option<RuleType>,
}

/// POST /api/rules - Create a rule, or retarget the one for the same pattern
pub async fn save_rule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SaveRuleRequest>,
) -> Result<Json<SavedRule>, AppError> {
    if req.sap_account_code.trim().is_empty() {
        return Err(AppError::bad_request("sap_account_code is required"));
    }

    let saved = LearningFeedbackLoop::new(state.db.clone()).save_rule(
        &req.memo,
        req.pattern.as_deref(),
        req.sap_account_code.trim(),
        req.sap_account_name.as_deref(),
        req.match_type,
        req.rule_type,
    )?;

    Ok(Json(saved))
}

#[derive(Debug, Deserialize)]
pub struct MatchRuleRequest {
    pub memo: String,
}

/// POST /api/rules/match - Best rule for a memo, or null
pub async fn match_rule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MatchRuleRequest>,
) -> Result<Json<Option<LearningRule>>, AppError> {
    let matcher = RuleMatcher::load(&state.db)?;
    Ok(Json(matcher.find_best_match(&req.memo).cloned()))
}
