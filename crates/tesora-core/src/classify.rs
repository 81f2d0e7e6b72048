//! Two-pass batch classification
//!
//! Pass one resolves every memo it can against the learned rules. Pass two
//! sends the remainder to the classification model in chunks of
//! `AI_CHUNK_SIZE`, with the strongest rules as few-shot context and an
//! excerpt of the chart of accounts. Suggestions are checked against the
//! full chart; a code the chart does not know is dropped and the row stays
//! unclassified for the operator.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::ai::parsing::{parse_classification_response, AiClassification};
use crate::ai::{AIBackend, AIClient, GenerateRequest};
use crate::db::Database;
use crate::error::Result;
use crate::memo::{MemoAnalyzer, MemoFeatures};
use crate::model_router::TaskType;
use crate::models::{
    emit, ChartAccount, ClassificationSource, ClassifiedTransaction, LearningRule, ProgressEvent,
    ProgressSink, RawTransaction, RuleType,
};
use crate::prompts::{PromptId, PromptLibrary};
use crate::rules::RuleMatcher;

/// Transactions per classification call
pub const AI_CHUNK_SIZE: usize = 50;

/// Chart entries shown to the model
pub const CHART_PROMPT_LIMIT: usize = 100;

/// Learned rules shown to the model as examples
pub const RULE_CONTEXT_LIMIT: usize = 50;

/// Minimum confidence for a rule to be shown to the model
pub const RULE_CONTEXT_MIN_CONFIDENCE: u8 = 80;

/// Classifies extracted transactions with rules first and AI second
#[derive(Clone)]
pub struct BatchClassifier {
    db: Database,
    ai: Option<AIClient>,
    prompts: PromptLibrary,
    analyzer: MemoAnalyzer,
}

impl BatchClassifier {
    pub fn new(db: Database, ai: Option<AIClient>, prompts: PromptLibrary) -> Self {
        Self {
            db,
            ai,
            prompts,
            analyzer: MemoAnalyzer::new(),
        }
    }

    /// Use a layout's memo patterns for actor and noise handling
    pub fn with_analyzer(mut self, analyzer: MemoAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Classify a statement, returning rows sorted by sequence
    ///
    /// With `rules_only`, an empty chart, or no AI backend, rows no rule
    /// matches come back as `none` with confidence 0.
    pub async fn classify(
        &self,
        transactions: Vec<RawTransaction>,
        chart: &[ChartAccount],
        rules_only: bool,
        progress: &ProgressSink,
    ) -> Result<Vec<ClassifiedTransaction>> {
        let total = transactions.len();
        let matcher = RuleMatcher::load(&self.db)?.with_analyzer(self.analyzer.clone());

        // ========== Pass 1: rules ==========
        let mut classified = Vec::with_capacity(total);
        let mut pending: Vec<(RawTransaction, MemoFeatures)> = Vec::new();

        for tx in transactions {
            let features = self.analyzer.analyze(&tx.memo);
            match matcher.find_best_match_with(&tx.memo, &features) {
                Some(rule) => {
                    debug!(sequence = tx.sequence, rule_id = rule.id, "Rule match");
                    classified.push(ClassifiedTransaction::from_rule(tx, rule));
                }
                None => pending.push((tx, features)),
            }
        }

        let rule_matched = classified.len();
        info!(total, rule_matched, pending = pending.len(), "Rule pass complete");
        emit(
            progress,
            ProgressEvent::ClassificationStart {
                total,
                rule_matched,
                pending_ai: pending.len(),
            },
        );

        // ========== Pass 2: AI ==========
        let ai = match &self.ai {
            Some(ai) if !rules_only && !chart.is_empty() && !pending.is_empty() => Some(ai),
            _ => None,
        };

        match ai {
            None => {
                if !pending.is_empty() {
                    debug!(
                        rules_only,
                        chart_size = chart.len(),
                        ai_configured = self.ai.is_some(),
                        "Skipping AI pass"
                    );
                }
                classified.extend(
                    pending
                        .into_iter()
                        .map(|(tx, _)| ClassifiedTransaction::unclassified(tx)),
                );
            }
            Some(ai) => {
                let rules = self
                    .db
                    .top_rules(RULE_CONTEXT_MIN_CONFIDENCE, RULE_CONTEXT_LIMIT)?;
                let context = PromptContext::new(&rules, chart);
                let total_chunks = pending.len().div_ceil(AI_CHUNK_SIZE);

                for (i, chunk) in pending.chunks(AI_CHUNK_SIZE).enumerate() {
                    let rows = self.classify_chunk(ai, chunk, &context, i + 1, total_chunks).await;
                    classified.extend(rows);
                }
            }
        }

        classified.sort_by_key(ClassifiedTransaction::sequence);

        let done = classified.iter().filter(|r| r.is_classified()).count();
        info!(
            classified = done,
            unclassified = classified.len() - done,
            "Classification complete"
        );
        emit(
            progress,
            ProgressEvent::ClassificationComplete {
                classified: done,
                unclassified: classified.len() - done,
            },
        );

        Ok(classified)
    }

    /// One AI call; any failure marks the whole chunk as errored
    async fn classify_chunk(
        &self,
        ai: &AIClient,
        chunk: &[(RawTransaction, MemoFeatures)],
        context: &PromptContext<'_>,
        chunk_number: usize,
        total_chunks: usize,
    ) -> Vec<ClassifiedTransaction> {
        let suggestions = match self.request_suggestions(ai, chunk, context).await {
            Ok(suggestions) => suggestions,
            Err(e) => {
                warn!(
                    chunk = chunk_number,
                    total_chunks,
                    rows = chunk.len(),
                    error = %e,
                    "Classification chunk failed, marking rows as errored"
                );
                return chunk
                    .iter()
                    .map(|(tx, _)| ClassifiedTransaction::errored(tx.clone()))
                    .collect();
            }
        };

        let mut by_sequence: HashMap<u32, AiClassification> = HashMap::new();
        for suggestion in suggestions {
            by_sequence.entry(suggestion.sequence).or_insert(suggestion);
        }

        chunk
            .iter()
            .map(|(tx, _)| {
                let suggestion = by_sequence.remove(&tx.sequence);
                context.resolve(tx.clone(), suggestion)
            })
            .collect()
    }

    async fn request_suggestions(
        &self,
        ai: &AIClient,
        chunk: &[(RawTransaction, MemoFeatures)],
        context: &PromptContext<'_>,
    ) -> Result<Vec<AiClassification>> {
        let prompt = self.prompts.get(PromptId::ClassifyTransactions)?;
        let mut vars = HashMap::new();
        vars.insert("rules", context.rules_table.clone());
        vars.insert("chart", context.chart_excerpt.clone());
        vars.insert("transactions", transaction_lines(chunk));

        let request = GenerateRequest::new(TaskType::Classification, prompt.render_user(&vars))
            .with_system(prompt.render_system(&vars));
        let generation = ai.generate(&request).await?;

        parse_classification_response(&generation.text)
    }
}

/// Prompt material shared by every chunk of one classification run
struct PromptContext<'a> {
    rules_table: String,
    chart_excerpt: String,
    chart: HashMap<&'a str, &'a ChartAccount>,
}

impl<'a> PromptContext<'a> {
    fn new(rules: &[LearningRule], chart: &'a [ChartAccount]) -> Self {
        Self {
            rules_table: rules_table(rules),
            chart_excerpt: chart
                .iter()
                .take(CHART_PROMPT_LIMIT)
                .map(|a| format!("{} | {}", a.code, a.name))
                .collect::<Vec<_>>()
                .join("\n"),
            chart: chart.iter().map(|a| (a.code.as_str(), a)).collect(),
        }
    }

    /// Apply a suggestion if its code exists in the chart
    fn resolve(&self, tx: RawTransaction, suggestion: Option<AiClassification>) -> ClassifiedTransaction {
        let Some(suggestion) = suggestion else {
            return ClassifiedTransaction::unclassified(tx);
        };
        let Some(code) = suggestion.sap_code else {
            return ClassifiedTransaction::unclassified(tx);
        };

        match self.chart.get(code.as_str()) {
            Some(account) => ClassifiedTransaction {
                transaction: tx,
                sap_account_code: Some(account.code.clone()),
                sap_account_name: Some(account.name.clone()),
                confidence: suggestion.confidence.min(100),
                source: ClassificationSource::Ai,
                rule_id: None,
            },
            None => {
                debug!(
                    sequence = tx.sequence,
                    code = %code,
                    "AI suggested an account outside the chart, leaving unclassified"
                );
                ClassifiedTransaction::unclassified(tx)
            }
        }
    }
}

fn rules_table(rules: &[LearningRule]) -> String {
    rules
        .iter()
        .map(|rule| {
            let key = match rule.rule_type {
                Some(RuleType::Rfc) => rule.rfc.as_ref(),
                Some(RuleType::Actor) => rule.actor.as_ref(),
                _ => None,
            };
            let pattern = key.unwrap_or(&rule.pattern);
            format!(
                "| {} | {} | {} | {} |",
                pattern,
                rule.sap_account_code,
                rule.rule_type.map(|t| t.as_str()).unwrap_or("-"),
                rule.confidence_score
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn transaction_lines(chunk: &[(RawTransaction, MemoFeatures)]) -> String {
    chunk
        .iter()
        .map(|(tx, features)| {
            format!(
                "{} | {} | {} | {} | {} | {}",
                tx.sequence,
                tx.movement_type().as_str(),
                tx.amount(),
                features.rfc.as_deref().unwrap_or("-"),
                features.actor.as_deref().unwrap_or("-"),
                features.clean
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{Generation, MockBackend};
    use crate::models::NewLearningRule;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use tokio::sync::mpsc;

    fn tx(sequence: u32, memo: &str) -> RawTransaction {
        RawTransaction {
            sequence,
            due_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            memo: memo.to_string(),
            debit_amount: Some(Decimal::new(12550, 2)),
            credit_amount: None,
        }
    }

    fn chart() -> Vec<ChartAccount> {
        vec![
            ChartAccount::new("600-10", "Comisiones bancarias"),
            ChartAccount::new("610-20", "Gastos de administracion"),
        ]
    }

    fn classifier(mock: Option<MockBackend>) -> (BatchClassifier, Database) {
        let db = Database::in_memory().unwrap();
        let classifier =
            BatchClassifier::new(db.clone(), mock.map(AIClient::mock), PromptLibrary::embedded_only());
        (classifier, db)
    }

    const SPEI: &str = "SPEI RECIBIDO DE 001-BANAMEX DE ACME SA DE CV";

    #[tokio::test]
    async fn test_ai_suggestion_in_chart_is_accepted() {
        let mock = MockBackend::new();
        mock.push_response(r#"[{"sequence":1,"sap_code":"600-10","confidence":92}]"#);
        let (classifier, _db) = classifier(Some(mock));

        let rows = classifier
            .classify(vec![tx(1, SPEI)], &chart(), false, &None)
            .await
            .unwrap();
        assert_eq!(rows[0].source, ClassificationSource::Ai);
        assert_eq!(rows[0].confidence, 92);
        assert_eq!(rows[0].sap_account_code.as_deref(), Some("600-10"));
        assert_eq!(rows[0].sap_account_name.as_deref(), Some("Comisiones bancarias"));
    }

    #[tokio::test]
    async fn test_ai_suggestion_outside_chart_is_dropped() {
        let mock = MockBackend::new();
        mock.push_response(r#"[{"sequence":1,"sap_code":"999-99","confidence":97}]"#);
        let (classifier, _db) = classifier(Some(mock));

        let rows = classifier
            .classify(vec![tx(1, SPEI)], &chart(), false, &None)
            .await
            .unwrap();
        assert_eq!(rows[0].source, ClassificationSource::None);
        assert_eq!(rows[0].confidence, 0);
        assert!(rows[0].sap_account_code.is_none());
    }

    #[tokio::test]
    async fn test_rules_first_then_ai_for_the_rest() {
        let mock = MockBackend::new();
        mock.push_response(r#"```json
[{"sequence":2,"sap_code":"610-20","confidence":70}]
```"#);
        let (classifier, db) = classifier(Some(mock.clone()));
        db.create_rule(&NewLearningRule::contains("COMISION", "600-10").with_confidence(90))
            .unwrap();

        let rows = classifier
            .classify(
                vec![tx(1, "COMISION MANEJO CTA"), tx(2, "PAGO PAPELERIA")],
                &chart(),
                false,
                &None,
            )
            .await
            .unwrap();

        assert_eq!(rows[0].source, ClassificationSource::Rule);
        assert_eq!(rows[0].confidence, 90);
        assert!(rows[0].rule_id.is_some());
        assert_eq!(rows[1].source, ClassificationSource::Ai);

        // Only the unmatched row reaches the model, and the rule is offered as context
        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].prompt.contains("2 | CARGO | -125.50"));
        assert!(!requests[0].prompt.contains("1 | CARGO"));
        assert!(requests[0].prompt.contains("| COMISION | 600-10 | - | 90 |"));
    }

    #[tokio::test]
    async fn test_rules_only_skips_ai() {
        let mock = MockBackend::new();
        let (classifier, _db) = classifier(Some(mock.clone()));

        let rows = classifier
            .classify(vec![tx(1, SPEI)], &chart(), true, &None)
            .await
            .unwrap();
        assert_eq!(rows[0].source, ClassificationSource::None);
        assert_eq!(mock.request_count(), 0);

        let rows = classifier
            .classify(vec![tx(1, SPEI)], &[], false, &None)
            .await
            .unwrap();
        assert_eq!(rows[0].source, ClassificationSource::None);
        assert_eq!(mock.request_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_chunk_marks_rows_errored() {
        let mock = MockBackend::new();
        mock.push_error("model unavailable");
        mock.push_response("[]");
        let (classifier, _db) = classifier(Some(mock));

        let txs: Vec<RawTransaction> = (1..=60).map(|i| tx(i, "PAGO VARIOS")).collect();
        let rows = classifier.classify(txs, &chart(), false, &None).await.unwrap();

        assert_eq!(rows.len(), 60);
        assert!(rows[..50].iter().all(|r| r.source == ClassificationSource::Error));
        assert!(rows[50..].iter().all(|r| r.source == ClassificationSource::None));
        assert!(rows.iter().all(|r| r.confidence == 0));
    }

    #[tokio::test]
    async fn test_malformed_response_marks_rows_errored() {
        let mock = MockBackend::new();
        mock.push_response("Sorry, I cannot help with that.");
        let (classifier, _db) = classifier(Some(mock));

        let rows = classifier
            .classify(vec![tx(1, SPEI)], &chart(), false, &None)
            .await
            .unwrap();
        assert_eq!(rows[0].source, ClassificationSource::Error);
    }

    #[tokio::test]
    async fn test_output_follows_sequence_order() {
        // The model answers in reverse order; output must still be ascending
        let mock = MockBackend::new().with_responder(|req| {
            let mut rows: Vec<String> = req
                .prompt
                .lines()
                .filter_map(|l| l.split(" | ").next()?.parse::<u32>().ok())
                .map(|seq| format!(r#"{{"sequence":{},"sap_code":"600-10","confidence":75}}"#, seq))
                .collect();
            rows.reverse();
            Ok(Generation::complete(format!("[{}]", rows.join(","))))
        });
        let (classifier, db) = classifier(Some(mock));
        db.create_rule(&NewLearningRule::contains("NOMINA", "610-20")).unwrap();

        let txs: Vec<RawTransaction> = (1..=120)
            .map(|i| tx(i, if i % 7 == 0 { "PAGO NOMINA" } else { "PAGO VARIOS" }))
            .collect();
        let rows = classifier.classify(txs, &chart(), false, &None).await.unwrap();

        let seqs: Vec<u32> = rows.iter().map(|r| r.sequence()).collect();
        assert_eq!(seqs, (1..=120).collect::<Vec<u32>>());
        assert!(rows.iter().all(|r| r.is_classified()));
    }

    #[tokio::test]
    async fn test_progress_events() {
        let (classifier, db) = classifier(None);
        db.create_rule(&NewLearningRule::contains("COMISION", "600-10")).unwrap();
        let (sink, mut rx) = mpsc::unbounded_channel();

        classifier
            .classify(
                vec![tx(1, "COMISION"), tx(2, "OTRO"), tx(3, "OTRO MAS")],
                &chart(),
                false,
                &Some(sink),
            )
            .await
            .unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            ProgressEvent::ClassificationStart {
                total: 3,
                rule_matched: 1,
                pending_ai: 2
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ProgressEvent::ClassificationComplete {
                classified: 1,
                unclassified: 2
            }
        );
    }

    #[test]
    fn test_typed_rules_show_their_key() {
        let db = Database::in_memory().unwrap();
        let mut rule = NewLearningRule::contains("SPEI RECIBIDO ACME", "600-10")
            .with_rule_type(RuleType::Rfc);
        rule.rfc = Some("ACM010101AB1".into());
        let id = db.create_rule(&rule).unwrap();
        let stored = db.get_rule(id).unwrap().unwrap();

        let table = rules_table(&[stored]);
        assert_eq!(table, "| ACM010101AB1 | 600-10 | RFC | 100 |");
    }
}
