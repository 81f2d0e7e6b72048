//! Learning feedback loop
//!
//! Runs after a batch is committed. Every row where the operator replaced
//! the AI's suggestion teaches a rule: the memo is reduced to a pattern and
//! the accepted account is either created as a new rule or reinforced.
//!
//! Corrections that contradict an earlier mapping do not overwrite it. The
//! new account gets its own rule at full confidence and every other account
//! mapped from the same pattern loses a little confidence, so the latest
//! correction wins while the history stays in the table.

use tracing::{debug, info};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::memo::{extract_rfc, learning_pattern, rule_pattern, MemoAnalyzer};
use crate::models::{
    BatchLineInput, LearningOutcome, MatchType, NewLearningRule, RuleSource, RuleType, SavedRule,
};

/// Confidence gained per repeated correction
pub const REINFORCE_STEP: i64 = 5;

/// Confidence lost by a rule contradicted by a correction
pub const DEMOTE_STEP: i64 = 5;

/// Confidence of a rule created from a correction
pub const LEARNED_CONFIDENCE: u8 = 100;

/// Turns operator corrections into rules
#[derive(Clone)]
pub struct LearningFeedbackLoop {
    db: Database,
}

impl LearningFeedbackLoop {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Learn from the final rows of a committed batch
    pub fn learn(&self, lines: &[BatchLineInput]) -> Result<LearningOutcome> {
        let mut outcome = LearningOutcome::default();

        for line in lines {
            if !line.is_correction() {
                continue;
            }
            let Some(accepted) = line.sap_account_code.as_deref() else {
                continue;
            };
            let Some(pattern) = learning_pattern(&line.memo) else {
                debug!(sequence = line.sequence, "Memo too short to learn from");
                outcome.skipped += 1;
                continue;
            };

            match self.db.find_rule_by_pattern_and_account(&pattern, accepted)? {
                Some(rule) => {
                    let confidence = (i64::from(rule.confidence_score) + REINFORCE_STEP).min(100);
                    self.db.set_rule_confidence(rule.id, confidence)?;
                    debug!(rule_id = rule.id, confidence, pattern = %pattern, "Reinforced rule");
                    outcome.reinforced += 1;
                }
                None => {
                    let mut rule = NewLearningRule::contains(pattern.clone(), accepted)
                        .with_confidence(LEARNED_CONFIDENCE)
                        .with_source(RuleSource::UserCorrection);
                    rule.sap_account_name = line.sap_account_name.clone();
                    let id = self.db.create_rule(&rule)?;
                    debug!(rule_id = id, pattern = %pattern, account = accepted, "Learned rule");
                    outcome.created += 1;
                }
            }

            outcome.demoted += self.demote_competitors(&pattern, accepted)?;
        }

        if outcome.created + outcome.reinforced > 0 {
            info!(
                created = outcome.created,
                reinforced = outcome.reinforced,
                demoted = outcome.demoted,
                "Learned from operator corrections"
            );
        }
        Ok(outcome)
    }

    fn demote_competitors(&self, pattern: &str, accepted: &str) -> Result<usize> {
        let mut demoted = 0;
        for rule in self.db.rules_for_pattern(pattern)? {
            if rule.sap_account_code == accepted || rule.confidence_score == 0 {
                continue;
            }
            let confidence = i64::from(rule.confidence_score) - DEMOTE_STEP;
            self.db.set_rule_confidence(rule.id, confidence)?;
            debug!(rule_id = rule.id, confidence, "Demoted contradicted rule");
            demoted += 1;
        }
        Ok(demoted)
    }

    /// Operator "save rule" action from the review screen
    ///
    /// An existing rule for the pattern is pointed at the new account at
    /// full confidence; otherwise a new rule is created. ACTOR and RFC
    /// rules store the key extracted from the memo.
    pub fn save_rule(
        &self,
        memo: &str,
        pattern: Option<&str>,
        sap_account_code: &str,
        sap_account_name: Option<&str>,
        match_type: MatchType,
        rule_type: Option<RuleType>,
    ) -> Result<SavedRule> {
        let pattern = rule_pattern(memo, pattern)?;

        if let Some(existing) = self.db.rules_for_pattern(&pattern)?.into_iter().next() {
            self.db.retarget_rule(
                existing.id,
                sap_account_code,
                sap_account_name,
                LEARNED_CONFIDENCE,
                RuleSource::UserCorrection,
            )?;
            info!(rule_id = existing.id, pattern = %pattern, account = sap_account_code, "Updated rule");
            let rule = self.db.get_rule(existing.id)?.unwrap_or(existing);
            return Ok(SavedRule { rule, is_new: false });
        }

        let mut rule = NewLearningRule::contains(pattern.clone(), sap_account_code)
            .with_source(RuleSource::UserCorrection);
        rule.match_type = match_type;
        rule.sap_account_name = sap_account_name.map(String::from);
        if let Some(rule_type) = rule_type {
            rule = rule.with_rule_type(rule_type);
            match rule_type {
                RuleType::Actor => rule.actor = MemoAnalyzer::new().actor(memo),
                RuleType::Rfc => rule.rfc = extract_rfc(memo),
                RuleType::Concepto => {}
            }
        }

        let id = self.db.create_rule(&rule)?;
        info!(rule_id = id, pattern = %pattern, account = sap_account_code, "Created rule");
        let rule = self
            .db
            .get_rule(id)?
            .ok_or_else(|| Error::NotFound(format!("Rule {} not found", id)))?;
        Ok(SavedRule { rule, is_new: true })
    }
}
