//! Learning rule operations

use rusqlite::{params, OptionalExtension, Row};

use super::{parse_datetime, Database};
use crate::error::Result;
use crate::models::{LearningRule, MatchType, NewLearningRule, RuleSource};

const RULE_COLUMNS: &str = "id, pattern, match_type, sap_account_code, sap_account_name, \
     confidence_score, source, rule_type, priority, actor, rfc, created_at, updated_at";

fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<LearningRule> {
    let match_type: String = row.get(2)?;
    let confidence: i64 = row.get(5)?;
    let source: String = row.get(6)?;
    let rule_type: Option<String> = row.get(7)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;

    Ok(LearningRule {
        id: row.get(0)?,
        pattern: row.get(1)?,
        match_type: match_type.parse().unwrap_or(MatchType::Contains),
        sap_account_code: row.get(3)?,
        sap_account_name: row.get(4)?,
        confidence_score: confidence.clamp(0, 100) as u8,
        source: source.parse().unwrap_or(RuleSource::Manual),
        rule_type: rule_type.and_then(|t| t.parse().ok()),
        priority: row.get(8)?,
        actor: row.get(9)?,
        rfc: row.get(10)?,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

impl Database {
    /// Create a learning rule, returning its id
    pub fn create_rule(&self, rule: &NewLearningRule) -> Result<i64> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO learning_rules
                (pattern, match_type, sap_account_code, sap_account_name, confidence_score,
                 source, rule_type, priority, actor, rfc)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                rule.pattern,
                rule.match_type.as_str(),
                rule.sap_account_code,
                rule.sap_account_name,
                rule.confidence_score.min(100),
                rule.source.as_str(),
                rule.rule_type.map(|t| t.as_str()),
                rule.priority(),
                rule.actor,
                rule.rfc,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    pub fn get_rule(&self, id: i64) -> Result<Option<LearningRule>> {
        let conn = self.conn()?;
        let rule = conn
            .query_row(
                &format!("SELECT {} FROM learning_rules WHERE id = ?", RULE_COLUMNS),
                params![id],
                row_to_rule,
            )
            .optional()?;
        Ok(rule)
    }

    /// All rules in ranking order: confidence, then priority, then insertion
    pub fn list_rules(&self) -> Result<Vec<LearningRule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM learning_rules ORDER BY confidence_score DESC, priority ASC, id ASC",
            RULE_COLUMNS
        ))?;

        let rules = stmt
            .query_map([], row_to_rule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    /// Highest-confidence rules, used as few-shot context for the AI pass
    pub fn top_rules(&self, min_confidence: u8, limit: usize) -> Result<Vec<LearningRule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM learning_rules
            WHERE confidence_score >= ?
            ORDER BY confidence_score DESC, priority ASC, id ASC
            LIMIT ?
            "#,
            RULE_COLUMNS
        ))?;

        let rules = stmt
            .query_map(params![min_confidence, limit as i64], row_to_rule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    /// Rules sharing a pattern, oldest first
    pub fn rules_for_pattern(&self, pattern: &str) -> Result<Vec<LearningRule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM learning_rules WHERE pattern = ? ORDER BY id ASC",
            RULE_COLUMNS
        ))?;

        let rules = stmt
            .query_map(params![pattern], row_to_rule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    pub fn find_rule_by_pattern_and_account(
        &self,
        pattern: &str,
        sap_account_code: &str,
    ) -> Result<Option<LearningRule>> {
        let conn = self.conn()?;
        let rule = conn
            .query_row(
                &format!(
                    "SELECT {} FROM learning_rules WHERE pattern = ? AND sap_account_code = ? \
                     ORDER BY id ASC LIMIT 1",
                    RULE_COLUMNS
                ),
                params![pattern, sap_account_code],
                row_to_rule,
            )
            .optional()?;
        Ok(rule)
    }

    /// Set a rule's confidence, clamped to 0-100
    pub fn set_rule_confidence(&self, id: i64, confidence: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE learning_rules
            SET confidence_score = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
            params![confidence.clamp(0, 100), id],
        )?;
        Ok(())
    }

    /// Point an existing rule at a different account
    pub fn retarget_rule(
        &self,
        id: i64,
        sap_account_code: &str,
        sap_account_name: Option<&str>,
        confidence: u8,
        source: RuleSource,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE learning_rules
            SET sap_account_code = ?, sap_account_name = ?, confidence_score = ?,
                source = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
            params![
                sap_account_code,
                sap_account_name,
                confidence.min(100),
                source.as_str(),
                id
            ],
        )?;
        Ok(())
    }

    pub fn count_rules(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM learning_rules", [], |row| row.get(0))?;
        Ok(count)
    }
}
