//! Domain models for Tesora

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

// ========== Transaction Models ==========

/// One parsed bank statement line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    /// 1-based position within the statement, reassigned after chunk merge
    pub sequence: u32,
    pub due_date: NaiveDate,
    pub memo: String,
    pub debit_amount: Option<Decimal>,
    pub credit_amount: Option<Decimal>,
}

impl RawTransaction {
    /// Signed amount: credits are positive, debits negative
    pub fn amount(&self) -> Decimal {
        self.credit_amount.unwrap_or_default() - self.debit_amount.unwrap_or_default()
    }

    pub fn movement_type(&self) -> MovementType {
        if self.debit_amount.is_some_and(|d| d > Decimal::ZERO) {
            MovementType::Cargo
        } else {
            MovementType::Abono
        }
    }
}

/// Direction of money movement as the bank reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MovementType {
    /// Money leaving the account
    Cargo,
    /// Money entering the account
    Abono,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cargo => "CARGO",
            Self::Abono => "ABONO",
        }
    }
}

/// Where a transaction's account assignment came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationSource {
    Rule,
    Ai,
    Manual,
    /// Needs an operator decision
    None,
    /// The backend failed for this row
    Error,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Ai => "ai",
            Self::Manual => "manual",
            Self::None => "none",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for ClassificationSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rule" => Ok(Self::Rule),
            "ai" => Ok(Self::Ai),
            "manual" => Ok(Self::Manual),
            "none" => Ok(Self::None),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown classification source: {}", s)),
        }
    }
}

impl std::fmt::Display for ClassificationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A statement line with its ledger account assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedTransaction {
    #[serde(flatten)]
    pub transaction: RawTransaction,
    pub sap_account_code: Option<String>,
    pub sap_account_name: Option<String>,
    /// 0-100
    pub confidence: u8,
    pub source: ClassificationSource,
    /// Rule that produced the assignment, when `source` is `rule`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<i64>,
}

impl ClassifiedTransaction {
    pub fn unclassified(transaction: RawTransaction) -> Self {
        Self {
            transaction,
            sap_account_code: None,
            sap_account_name: None,
            confidence: 0,
            source: ClassificationSource::None,
            rule_id: None,
        }
    }

    pub fn errored(transaction: RawTransaction) -> Self {
        Self {
            source: ClassificationSource::Error,
            ..Self::unclassified(transaction)
        }
    }

    pub fn from_rule(transaction: RawTransaction, rule: &LearningRule) -> Self {
        Self {
            transaction,
            sap_account_code: Some(rule.sap_account_code.clone()),
            sap_account_name: rule.sap_account_name.clone(),
            confidence: rule.confidence_score,
            source: ClassificationSource::Rule,
            rule_id: Some(rule.id),
        }
    }

    pub fn is_classified(&self) -> bool {
        self.sap_account_code.is_some()
    }

    pub fn sequence(&self) -> u32 {
        self.transaction.sequence
    }
}

/// Totals shown next to a classification preview
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationSummary {
    pub total_records: usize,
    pub total_debit: Decimal,
    pub total_credit: Decimal,
    pub unclassified_count: usize,
}

impl ClassificationSummary {
    pub fn from_rows(rows: &[ClassifiedTransaction]) -> Self {
        let mut summary = Self {
            total_records: rows.len(),
            total_debit: Decimal::ZERO,
            total_credit: Decimal::ZERO,
            unclassified_count: 0,
        };
        for row in rows {
            summary.total_debit += row.transaction.debit_amount.unwrap_or_default();
            summary.total_credit += row.transaction.credit_amount.unwrap_or_default();
            if !row.is_classified() {
                summary.unclassified_count += 1;
            }
        }
        summary
    }
}

// ========== Rule Models ==========

/// How a rule pattern is compared against a memo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    #[default]
    Contains,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Contains => "contains",
        }
    }
}

impl std::str::FromStr for MatchType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "contains" => Ok(Self::Contains),
            _ => Err(format!("Unknown match type: {}", s)),
        }
    }
}

impl std::fmt::Display for MatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a rule was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    #[default]
    Manual,
    UserCorrection,
    AiLearned,
}

impl RuleSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::UserCorrection => "user_correction",
            Self::AiLearned => "ai_learned",
        }
    }
}

impl std::str::FromStr for RuleSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "user_correction" => Ok(Self::UserCorrection),
            "ai_learned" => Ok(Self::AiLearned),
            _ => Err(format!("Unknown rule source: {}", s)),
        }
    }
}

/// Typed rules key on a feature extracted from the memo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleType {
    /// Counterparty name
    Actor,
    /// Mexican tax id
    Rfc,
    /// Known banking concept (NOMINA, COMISION, ...)
    Concepto,
}

/// Priority given to rules without a type
pub const UNTYPED_RULE_PRIORITY: i32 = 3;

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Actor => "ACTOR",
            Self::Rfc => "RFC",
            Self::Concepto => "CONCEPTO",
        }
    }

    /// Lower number wins ties: ACTOR > RFC > CONCEPTO
    pub fn default_priority(&self) -> i32 {
        match self {
            Self::Actor => 1,
            Self::Rfc => 2,
            Self::Concepto => 3,
        }
    }
}

impl std::str::FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ACTOR" => Ok(Self::Actor),
            "RFC" => Ok(Self::Rfc),
            "CONCEPTO" | "CONCEPT" => Ok(Self::Concepto),
            _ => Err(format!("Unknown rule type: {}", s)),
        }
    }
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted pattern to account mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRule {
    pub id: i64,
    pub pattern: String,
    pub match_type: MatchType,
    pub sap_account_code: String,
    pub sap_account_name: Option<String>,
    /// Clamped to 0-100
    pub confidence_score: u8,
    pub source: RuleSource,
    pub rule_type: Option<RuleType>,
    pub priority: i32,
    pub actor: Option<String>,
    pub rfc: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a learning rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLearningRule {
    pub pattern: String,
    #[serde(default)]
    pub match_type: MatchType,
    pub sap_account_code: String,
    #[serde(default)]
    pub sap_account_name: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence_score: u8,
    #[serde(default)]
    pub source: RuleSource,
    #[serde(default)]
    pub rule_type: Option<RuleType>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub rfc: Option<String>,
}

fn default_confidence() -> u8 {
    100
}

impl NewLearningRule {
    /// A `contains` rule at full confidence
    pub fn contains(pattern: impl Into<String>, sap_account_code: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            match_type: MatchType::Contains,
            sap_account_code: sap_account_code.into(),
            sap_account_name: None,
            confidence_score: 100,
            source: RuleSource::Manual,
            rule_type: None,
            actor: None,
            rfc: None,
        }
    }

    pub fn exact(pattern: impl Into<String>, sap_account_code: impl Into<String>) -> Self {
        Self {
            match_type: MatchType::Exact,
            ..Self::contains(pattern, sap_account_code)
        }
    }

    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence_score = confidence.min(100);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.sap_account_name = Some(name.into());
        self
    }

    pub fn with_source(mut self, source: RuleSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_rule_type(mut self, rule_type: RuleType) -> Self {
        self.rule_type = Some(rule_type);
        self
    }

    pub fn priority(&self) -> i32 {
        self.rule_type
            .map(|t| t.default_priority())
            .unwrap_or(UNTYPED_RULE_PRIORITY)
    }
}

/// Result of the operator "save rule" action
#[derive(Debug, Clone, Serialize)]
pub struct SavedRule {
    pub rule: LearningRule,
    pub is_new: bool,
}

/// Counters from one run of the learning loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LearningOutcome {
    pub created: usize,
    pub reinforced: usize,
    pub demoted: usize,
    pub skipped: usize,
}

// ========== Layout Models ==========

/// How to read a statement layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ParseConfig {
    #[serde(default)]
    pub header_lines_count: usize,
    #[serde(default)]
    pub column_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_patterns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_patterns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_strategy: Option<String>,
}

/// Result of layout inference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutAnalysis {
    pub parse_config: ParseConfig,
    pub bank_name_guess: Option<String>,
    pub fingerprint: String,
    pub is_cached: bool,
}

/// A cached statement layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankLayoutTemplate {
    pub id: i64,
    pub fingerprint: String,
    pub bank_name_guess: Option<String>,
    pub parse_config: ParseConfig,
    pub use_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ========== Batch Models ==========

/// Posting lifecycle of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown batch status: {}", s)),
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which ledger document each row becomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PostingMode {
    #[default]
    JournalEntry,
    BankPages,
}

impl PostingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JournalEntry => "journal_entry",
            Self::BankPages => "bank_pages",
        }
    }
}

impl std::str::FromStr for PostingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "journal_entry" | "journal" => Ok(Self::JournalEntry),
            "bank_pages" | "bank_page" => Ok(Self::BankPages),
            _ => Err(format!("Unknown posting mode: {}", s)),
        }
    }
}

/// Where and how a batch posts in the external ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingTarget {
    /// Company database the ledger session is scoped to
    pub company_db: String,
    /// GL account of the bank
    pub bank_account_code: String,
    #[serde(default)]
    pub cost_center: Option<String>,
    /// Branch id; zero or absent means no branch
    #[serde(default)]
    pub bpl_id: Option<i32>,
    #[serde(default)]
    pub mode: PostingMode,
}

/// A committed unit of classified transactions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    /// YYYY-MM-NNN
    pub statement_number: String,
    pub filename: String,
    #[serde(flatten)]
    pub target: PostingTarget,
    pub total_records: i64,
    pub total_debit: Decimal,
    pub total_credit: Decimal,
    pub status: BatchStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One committed row and its posting result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchLine {
    pub id: i64,
    pub batch_id: i64,
    pub sequence: u32,
    pub due_date: NaiveDate,
    pub memo: String,
    pub debit_amount: Option<Decimal>,
    pub credit_amount: Option<Decimal>,
    pub sap_account_code: String,
    pub sap_account_name: Option<String>,
    pub ai_suggested_account: Option<String>,
    /// Document number assigned by the ledger once posted
    pub external_ref: Option<i64>,
    pub error: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
}

impl BatchLine {
    pub fn is_posted(&self) -> bool {
        self.external_ref.is_some()
    }
}

/// Batch together with its lines
#[derive(Debug, Clone, Serialize)]
pub struct BatchDetail {
    #[serde(flatten)]
    pub batch: Batch,
    pub lines: Vec<BatchLine>,
}

/// A reviewed row submitted for commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchLineInput {
    pub sequence: u32,
    pub due_date: NaiveDate,
    pub memo: String,
    #[serde(default)]
    pub debit_amount: Option<Decimal>,
    #[serde(default)]
    pub credit_amount: Option<Decimal>,
    #[serde(default)]
    pub sap_account_code: Option<String>,
    #[serde(default)]
    pub sap_account_name: Option<String>,
    /// Account the AI proposed before operator review
    #[serde(default)]
    pub ai_suggested_account: Option<String>,
}

impl BatchLineInput {
    /// True when the operator overrode an AI suggestion
    pub fn is_correction(&self) -> bool {
        match (&self.ai_suggested_account, &self.sap_account_code) {
            (Some(suggested), Some(accepted)) => !suggested.is_empty() && suggested != accepted,
            _ => false,
        }
    }
}

impl From<&ClassifiedTransaction> for BatchLineInput {
    fn from(row: &ClassifiedTransaction) -> Self {
        let ai_suggested_account = match row.source {
            ClassificationSource::Ai => row.sap_account_code.clone(),
            _ => None,
        };
        Self {
            sequence: row.transaction.sequence,
            due_date: row.transaction.due_date,
            memo: row.transaction.memo.clone(),
            debit_amount: row.transaction.debit_amount,
            credit_amount: row.transaction.credit_amount,
            sap_account_code: row.sap_account_code.clone(),
            sap_account_name: row.sap_account_name.clone(),
            ai_suggested_account,
        }
    }
}

/// Everything needed to commit a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBatch {
    pub filename: String,
    pub target: PostingTarget,
    pub lines: Vec<BatchLineInput>,
}

/// Summary of one posting run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostingOutcome {
    pub batch_id: i64,
    pub status: BatchStatus,
    pub attempted: usize,
    pub posted: usize,
    pub failed: usize,
    pub error_message: Option<String>,
}

/// Batch header with line posting counts
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    #[serde(flatten)]
    pub batch: Batch,
    pub posted_lines: usize,
    pub unposted_lines: usize,
    pub failed_lines: usize,
}

// ========== Ledger Models ==========

/// One entry of the external chart of accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartAccount {
    pub code: String,
    pub name: String,
}

impl ChartAccount {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
        }
    }
}

// ========== Progress Models ==========

/// Lifecycle events emitted while a statement is processed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    ExtractionStart {
        total_lines: usize,
        data_lines: usize,
        total_chunks: usize,
    },
    ChunkProgress {
        chunk: usize,
        total_chunks: usize,
    },
    ChunkDone {
        chunk: usize,
        total_chunks: usize,
        extracted_so_far: usize,
    },
    ExtractionComplete {
        total_transactions: usize,
    },
    ClassificationStart {
        total: usize,
        rule_matched: usize,
        pending_ai: usize,
    },
    ClassificationComplete {
        classified: usize,
        unclassified: usize,
    },
}

/// Optional consumer of progress events; processing never waits on it
pub type ProgressSink = Option<UnboundedSender<ProgressEvent>>;

pub(crate) fn emit(sink: &ProgressSink, event: ProgressEvent) {
    if let Some(tx) = sink {
        // A dropped receiver only means nobody is watching anymore
        let _ = tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn tx(debit: Option<i64>, credit: Option<i64>) -> RawTransaction {
        RawTransaction {
            sequence: 1,
            due_date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            memo: "SPEI RECIBIDO".to_string(),
            debit_amount: debit.map(Decimal::from),
            credit_amount: credit.map(Decimal::from),
        }
    }

    #[test]
    fn test_amount_is_credit_minus_debit() {
        assert_eq!(tx(Some(150), None).amount(), Decimal::from(-150));
        assert_eq!(tx(None, Some(80)).amount(), Decimal::from(80));
        assert_eq!(tx(Some(150), None).movement_type(), MovementType::Cargo);
        assert_eq!(tx(None, Some(80)).movement_type(), MovementType::Abono);
    }

    #[test]
    fn test_classified_serializes_flat() {
        let row = ClassifiedTransaction::unclassified(tx(None, Some(5)));
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["sequence"], 1);
        assert_eq!(json["due_date"], "2025-01-15");
        assert_eq!(json["source"], "none");
        assert!(json["sap_account_code"].is_null());
        assert!(json.get("rule_id").is_none());

        let back: ClassifiedTransaction = serde_json::from_value(json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn test_rule_type_priorities() {
        assert!(RuleType::Actor.default_priority() < RuleType::Rfc.default_priority());
        assert!(RuleType::Rfc.default_priority() < RuleType::Concepto.default_priority());
        assert_eq!(NewLearningRule::contains("X", "1").priority(), UNTYPED_RULE_PRIORITY);
        assert_eq!(RuleType::from_str("concepto").unwrap(), RuleType::Concepto);
    }

    #[test]
    fn test_enum_round_trips_through_as_str() {
        for status in [
            BatchStatus::Pending,
            BatchStatus::Processing,
            BatchStatus::Completed,
            BatchStatus::Failed,
        ] {
            assert_eq!(BatchStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert_eq!(
            RuleSource::from_str("user_correction").unwrap(),
            RuleSource::UserCorrection
        );
        assert_eq!(PostingMode::from_str("bank-pages").unwrap(), PostingMode::BankPages);
        assert!(MatchType::from_str("fuzzy").is_err());
    }

    #[test]
    fn test_correction_detection() {
        let mut line = BatchLineInput {
            sequence: 1,
            due_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            memo: "COMISION".into(),
            debit_amount: Some(Decimal::from(10)),
            credit_amount: None,
            sap_account_code: Some("610-20".into()),
            sap_account_name: None,
            ai_suggested_account: Some("600-10".into()),
        };
        assert!(line.is_correction());
        line.ai_suggested_account = Some("610-20".into());
        assert!(!line.is_correction());
        line.ai_suggested_account = None;
        assert!(!line.is_correction());
    }

    #[test]
    fn test_progress_event_tagging() {
        let event = ProgressEvent::ChunkDone {
            chunk: 2,
            total_chunks: 3,
            extracted_so_far: 40,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "chunk_done");
        assert_eq!(json["extracted_so_far"], 40);
    }
}
