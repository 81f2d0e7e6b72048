//! CLI argument definitions using clap
//!
//! This module contains all the clap structs and enums for parsing CLI arguments.
//! The actual command implementations are in the `commands` module.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tesora_core::models::{MatchType, PostingMode, RuleType};
use tesora_core::ExportFormat;

/// Tesora - Classify bank statements and post them to the ledger
#[derive(Parser)]
#[command(name = "tesora")]
#[command(about = "Bank statement classification and reconciliation", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Database path
    #[arg(long, default_value = "tesora.db", global = true)]
    pub db: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable database encryption (not recommended for production)
    ///
    /// By default, the database is encrypted using SQLCipher.
    /// Set TESORA_DB_KEY environment variable with your passphrase.
    /// Use --no-encrypt only for development or testing.
    #[arg(long, global = true)]
    pub no_encrypt: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database
    Init,

    /// Infer the layout of a bank statement
    Analyze {
        /// Statement file (CSV or tab-separated text)
        file: PathBuf,

        /// Store the inferred layout so the next upload skips the AI call
        #[arg(long)]
        remember: bool,
    },

    /// Extract and classify the transactions of a bank statement
    Classify {
        /// Statement file (CSV or tab-separated text)
        file: PathBuf,

        /// JSON file with the parse configuration (inferred if not specified)
        #[arg(long)]
        parse_config: Option<PathBuf>,

        /// Only apply learned rules, never ask the AI for accounts
        #[arg(long)]
        rules_only: bool,

        /// Company database whose chart of accounts the AI chooses from
        #[arg(long)]
        company_db: Option<String>,

        /// Output format: table, json, csv
        #[arg(short, long, default_value = "table")]
        format: ExportFormat,

        /// Write the output to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Manage learning rules
    Rules {
        #[command(subcommand)]
        action: Option<RulesAction>,
    },

    /// Commit a reviewed classification (from `classify --format json`) as a batch
    Commit {
        /// Reviewed classification JSON file
        file: PathBuf,

        /// Company database to post into
        #[arg(long)]
        company_db: String,

        /// GL account of the bank
        #[arg(long)]
        bank_account: String,

        /// Cost center applied to every counter line
        #[arg(long)]
        cost_center: Option<String>,

        /// Branch id
        #[arg(long)]
        bpl_id: Option<i32>,

        /// Posting mode: journal_entry, bank_pages
        #[arg(long, default_value = "journal_entry")]
        mode: PostingMode,
    },

    /// Manage committed batches
    Batches {
        #[command(subcommand)]
        action: Option<BatchesAction>,
    },

    /// Start the web server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
}

#[derive(Subcommand)]
pub enum RulesAction {
    /// List rules in match order
    List,

    /// Add a rule
    Add {
        /// Text to look for in the memo
        pattern: String,

        /// Ledger account code
        code: String,

        /// Ledger account name
        #[arg(long)]
        name: Option<String>,

        /// Match type: contains, exact
        #[arg(long, default_value = "contains")]
        match_type: MatchType,

        /// Rule type: actor, rfc, concepto
        #[arg(long)]
        rule_type: Option<RuleType>,

        /// Confidence 0-100
        #[arg(long, default_value = "100")]
        confidence: u8,
    },

    /// Show which rule would classify a memo
    Match {
        /// Memo text
        memo: String,
    },
}

#[derive(Subcommand)]
pub enum BatchesAction {
    /// List batches, newest first
    List,

    /// Show a batch with its lines
    Show {
        /// Batch ID
        id: i64,
    },

    /// Post a pending or failed batch to the ledger
    Post {
        /// Batch ID
        id: i64,
    },

    /// Retry the unposted rows of a failed batch
    Reprocess {
        /// Batch ID
        id: i64,
    },
}
