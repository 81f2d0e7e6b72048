//! Learning rule command implementations

use anyhow::Result;
use tesora_core::models::{MatchType, NewLearningRule, RuleSource, RuleType};
use tesora_core::{Database, RuleMatcher};

use super::truncate;

pub fn cmd_rules_list(db: &Database) -> Result<()> {
    let rules = db.list_rules()?;

    if rules.is_empty() {
        println!("No learning rules yet. Rules are learned when you commit corrected batches,");
        println!("or add one with 'tesora rules add <pattern> <code>'.");
        return Ok(());
    }

    println!();
    println!("📏 Learning Rules ({})", rules.len());
    println!(
        "   {:>4}  {:30}  {:8}  {:10}  {:>4}  {:8}  {}",
        "ID", "Pattern", "Match", "Account", "Conf", "Type", "Source"
    );
    println!("   {}", "─".repeat(90));

    for rule in &rules {
        println!(
            "   {:>4}  {:30}  {:8}  {:10}  {:>4}  {:8}  {}",
            rule.id,
            truncate(&rule.pattern, 30),
            rule.match_type,
            rule.sap_account_code,
            rule.confidence_score,
            rule.rule_type.map(|t| t.to_string()).unwrap_or_else(|| "-".into()),
            rule.source.as_str(),
        );
    }

    Ok(())
}

pub fn cmd_rules_add(
    db: &Database,
    pattern: &str,
    code: &str,
    name: Option<&str>,
    match_type: MatchType,
    rule_type: Option<RuleType>,
    confidence: u8,
) -> Result<()> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        anyhow::bail!("Pattern must not be empty");
    }
    if confidence > 100 {
        anyhow::bail!("Confidence must be between 0 and 100");
    }

    let mut rule = NewLearningRule::contains(pattern, code.trim())
        .with_confidence(confidence)
        .with_source(RuleSource::Manual);
    rule.match_type = match_type;
    if let Some(name) = name {
        rule = rule.with_name(name);
    }
    if let Some(rule_type) = rule_type {
        rule = rule.with_rule_type(rule_type);
    }

    let id = db.create_rule(&rule)?;
    println!(
        "✅ Created rule {}: '{}' ({}) -> {}",
        id, pattern, match_type, code.trim()
    );

    Ok(())
}

pub fn cmd_rules_match(db: &Database, memo: &str) -> Result<()> {
    let matcher = RuleMatcher::load(db)?;

    match matcher.find_best_match(memo) {
        Some(rule) => {
            println!("✅ Rule {} matches", rule.id);
            println!("   Pattern:    {} ({})", rule.pattern, rule.match_type);
            println!(
                "   Account:    {}{}",
                rule.sap_account_code,
                rule.sap_account_name
                    .as_deref()
                    .map(|n| format!(" ({})", n))
                    .unwrap_or_default()
            );
            println!("   Confidence: {}", rule.confidence_score);
        }
        None => {
            println!(
                "No rule matches '{}' ({} rules checked)",
                memo,
                matcher.len()
            );
        }
    }

    Ok(())
}
