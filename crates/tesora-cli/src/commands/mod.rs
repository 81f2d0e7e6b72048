//! CLI command implementations
//!
//! Commands are organized by domain:
//! - `core` - Init and shared utilities (open_db, ledger_from_env)
//! - `analyze` - Statement layout inference
//! - `classify` - Extraction and classification of a statement
//! - `rules` - Learning rule commands (list, add, match)
//! - `batches` - Commit, list, show, post and reprocess batches
//! - `serve` - Web server command

pub mod analyze;
pub mod batches;
pub mod classify;
pub mod core;
pub mod rules;
pub mod serve;

// Re-export command functions for main.rs
pub use analyze::*;
pub use batches::*;
pub use classify::*;
pub use core::*;
pub use rules::*;
pub use serve::*;

/// Truncate a string to a maximum number of characters, adding "..." if truncated
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Amount column text, blank when absent
pub fn format_amount(amount: Option<rust_decimal::Decimal>) -> String {
    amount.map(|a| format!("{:.2}", a)).unwrap_or_default()
}
