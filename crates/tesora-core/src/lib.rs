//! Tesora Core Library
//!
//! Shared functionality for the Tesora treasury reconciliation pipeline:
//! - Database access and migrations (rules, layouts, batches)
//! - Statement layout inference with a fingerprint cache
//! - Chunked AI extraction of bank statement lines
//! - Two-pass classification: learned rules first, AI for the remainder
//! - Learning loop that turns operator corrections into rules
//! - Ledger client (SAP Business One Service Layer) and batch posting
//! - Pluggable AI backends, model router and prompt library

pub mod ai;
pub mod chart;
pub mod classify;
pub mod commit;
pub mod db;
pub mod error;
pub mod export;
pub mod extract;
pub mod layout;
pub mod learning;
pub mod ledger;
pub mod memo;
pub mod model_router;
pub mod models;
pub mod posting;
pub mod prompts;
pub mod rules;

/// Test utilities including a mock ledger service layer
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use ai::{AIBackend, AIClient, GenerateRequest, MockBackend, OllamaBackend, OpenAICompatibleBackend};
pub use chart::{ChartOfAccountsCache, SharedChart};
pub use classify::BatchClassifier;
pub use commit::{batch_summary, commit_batch};
pub use db::Database;
pub use error::{Error, Result};
pub use export::ExportFormat;
pub use extract::ChunkedExtractor;
pub use layout::LayoutInferrer;
pub use learning::LearningFeedbackLoop;
pub use ledger::{LedgerBackend, LedgerSession, MockLedger, ServiceLayerClient};
pub use memo::{MemoAnalyzer, MemoFeatures};
pub use model_router::{ModelRouter, RouterConfig, TaskConfig, TaskType};
pub use posting::LedgerPoster;
pub use prompts::{Prompt, PromptId, PromptLibrary};
pub use rules::RuleMatcher;
