//! Rule matcher
//!
//! Finds the best learned rule for a memo. Rules are held in ranking order
//! (confidence desc, priority asc, id asc) so the first match in that order
//! is the winner. `exact` rules are looked up through a hash index;
//! everything else is a linear scan, which is fine for a rule set in the low
//! thousands.
//!
//! A pattern is tried against the raw memo and against the memo with its
//! noise stripped, because learned patterns are built from the cleaned form.

use std::collections::HashMap;

use crate::db::Database;
use crate::error::Result;
use crate::memo::{MemoAnalyzer, MemoFeatures};
use crate::models::{LearningRule, MatchType, RuleType};

/// Ranking used everywhere rules compete
pub fn rank_rules(rules: &mut [LearningRule]) {
    rules.sort_by(|a, b| {
        b.confidence_score
            .cmp(&a.confidence_score)
            .then(a.priority.cmp(&b.priority))
            .then(a.id.cmp(&b.id))
    });
}

/// Memo forms a rule can be tested against
struct Candidate<'a> {
    raw: String,
    clean: String,
    features: &'a MemoFeatures,
}

impl Candidate<'_> {
    fn pattern_matches(&self, rule: &LearningRule) -> bool {
        let pattern = rule.pattern.trim().to_lowercase();
        if pattern.is_empty() {
            return false;
        }
        match rule.match_type {
            MatchType::Exact => self.raw == pattern || self.clean == pattern,
            MatchType::Contains => self.raw.contains(&pattern) || self.clean.contains(&pattern),
        }
    }

    fn matches(&self, rule: &LearningRule) -> bool {
        let typed = match rule.rule_type {
            Some(RuleType::Actor) => same_ignoring_case(&rule.actor, &self.features.actor),
            Some(RuleType::Rfc) => same_ignoring_case(&rule.rfc, &self.features.rfc),
            Some(RuleType::Concepto) | None => false,
        };
        typed || self.pattern_matches(rule)
    }
}

fn same_ignoring_case(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => !a.trim().is_empty() && a.trim().eq_ignore_ascii_case(b.trim()),
        _ => false,
    }
}

/// In-memory matcher over a snapshot of the rule table
#[derive(Debug, Clone)]
pub struct RuleMatcher {
    rules: Vec<LearningRule>,
    /// Lowercased pattern of `exact` rules -> indexes into `rules`, ascending
    exact_index: HashMap<String, Vec<usize>>,
    analyzer: MemoAnalyzer,
}

impl RuleMatcher {
    pub fn from_rules(mut rules: Vec<LearningRule>) -> Self {
        rank_rules(&mut rules);

        let mut exact_index: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, rule) in rules.iter().enumerate() {
            if rule.match_type == MatchType::Exact && rule.rule_type.is_none() {
                exact_index
                    .entry(rule.pattern.trim().to_lowercase())
                    .or_default()
                    .push(i);
            }
        }

        Self {
            rules,
            exact_index,
            analyzer: MemoAnalyzer::new(),
        }
    }

    /// Snapshot every rule in the database
    pub fn load(db: &Database) -> Result<Self> {
        Ok(Self::from_rules(db.list_rules()?))
    }

    /// Use a layout's noise and actor patterns for memo features
    pub fn with_analyzer(mut self, analyzer: MemoAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Best rule for a memo, or `None`
    ///
    /// Highest confidence wins regardless of match type; ties go to the
    /// lower priority number, then to the older rule.
    pub fn find_best_match(&self, memo: &str) -> Option<&LearningRule> {
        let features = self.analyzer.analyze(memo);
        self.find_best_match_with(memo, &features)
    }

    /// Same as [`find_best_match`](Self::find_best_match) with precomputed features
    pub fn find_best_match_with(&self, memo: &str, features: &MemoFeatures) -> Option<&LearningRule> {
        let candidate = Candidate {
            raw: memo.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase(),
            clean: features.clean.to_lowercase(),
            features,
        };

        let indexed = [&candidate.raw, &candidate.clean]
            .into_iter()
            .filter_map(|key| self.exact_index.get(key.as_str()))
            .filter_map(|hits| hits.first().copied())
            .min();

        // Only rules ranked above the best indexed hit can still beat it
        let scan_end = indexed.unwrap_or(self.rules.len());
        let scanned = self.rules[..scan_end]
            .iter()
            .enumerate()
            .filter(|(_, rule)| !self.is_indexed(rule))
            .find(|(_, rule)| candidate.matches(rule))
            .map(|(i, _)| i);

        scanned.or(indexed).map(|i| &self.rules[i])
    }

    fn is_indexed(&self, rule: &LearningRule) -> bool {
        rule.match_type == MatchType::Exact && rule.rule_type.is_none()
    }

    /// Rules in ranking order
    pub fn rules(&self) -> &[LearningRule] {
        &self.rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RuleSource, UNTYPED_RULE_PRIORITY};
    use chrono::Utc;

    fn rule(id: i64, pattern: &str, match_type: MatchType, confidence: u8, code: &str) -> LearningRule {
        LearningRule {
            id,
            pattern: pattern.to_string(),
            match_type,
            sap_account_code: code.to_string(),
            sap_account_name: None,
            confidence_score: confidence,
            source: RuleSource::Manual,
            rule_type: None,
            priority: UNTYPED_RULE_PRIORITY,
            actor: None,
            rfc: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn typed(mut r: LearningRule, rule_type: RuleType) -> LearningRule {
        r.priority = rule_type.default_priority();
        r.rule_type = Some(rule_type);
        r
    }

    #[test]
    fn test_contains_beats_lower_confidence_exact() {
        let matcher = RuleMatcher::from_rules(vec![
            rule(1, "comision manejo cta", MatchType::Exact, 80, "EXACT"),
            rule(2, "COMISION", MatchType::Contains, 95, "CONTAINS"),
        ]);
        let best = matcher.find_best_match("COMISION MANEJO CTA").unwrap();
        assert_eq!(best.sap_account_code, "CONTAINS");
    }

    #[test]
    fn test_exact_beats_lower_confidence_contains() {
        let matcher = RuleMatcher::from_rules(vec![
            rule(1, "COMISION", MatchType::Contains, 70, "CONTAINS"),
            rule(2, "Comision Manejo CTA", MatchType::Exact, 90, "EXACT"),
        ]);
        assert_eq!(
            matcher.find_best_match("comision  manejo cta").unwrap().sap_account_code,
            "EXACT"
        );
    }

    #[test]
    fn test_exact_requires_full_equality() {
        let matcher =
            RuleMatcher::from_rules(vec![rule(1, "COMISION", MatchType::Exact, 100, "X")]);
        assert!(matcher.find_best_match("COMISION MANEJO").is_none());
        assert!(matcher.find_best_match("comision").is_some());
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let matcher = RuleMatcher::from_rules(vec![
            rule(5, "SPEI", MatchType::Contains, 90, "LATER"),
            rule(2, "RECIBIDO", MatchType::Contains, 90, "EARLIER"),
        ]);
        assert_eq!(
            matcher.find_best_match("SPEI RECIBIDO").unwrap().sap_account_code,
            "EARLIER"
        );
    }

    #[test]
    fn test_ties_break_by_priority() {
        let mut actor = typed(rule(9, "ZZZ", MatchType::Contains, 90, "ACTOR"), RuleType::Actor);
        actor.actor = Some("ACME".into());
        let matcher = RuleMatcher::from_rules(vec![
            rule(1, "SPEI", MatchType::Contains, 90, "UNTYPED"),
            actor,
        ]);
        let best = matcher
            .find_best_match("SPEI RECIBIDO DE 001-BANAMEX DE ACME SA DE CV")
            .unwrap();
        assert_eq!(best.sap_account_code, "ACTOR");
    }

    #[test]
    fn test_rfc_rule_matches_extracted_rfc() {
        let mut r = typed(rule(1, "unused pattern", MatchType::Contains, 100, "RFC"), RuleType::Rfc);
        r.rfc = Some("acm010101ab1".into());
        let matcher = RuleMatcher::from_rules(vec![r]);
        assert!(matcher.find_best_match("PAGO RFC: ACM010101AB1").is_some());
        assert!(matcher.find_best_match("PAGO RFC ND").is_none());
    }

    #[test]
    fn test_learned_pattern_matches_noisy_memo() {
        // Learned patterns come from the cleaned memo
        let matcher = RuleMatcher::from_rules(vec![rule(
            1,
            "PAGO PROVEEDOR ACME",
            MatchType::Contains,
            100,
            "X",
        )]);
        assert!(matcher
            .find_best_match("PAGO RASTREO ABC123 PROVEEDOR ACME")
            .is_some());
    }

    #[test]
    fn test_blank_pattern_never_matches() {
        let matcher = RuleMatcher::from_rules(vec![rule(1, "  ", MatchType::Contains, 100, "X")]);
        assert!(matcher.find_best_match("anything").is_none());
        assert!(!matcher.is_empty());
    }
}
