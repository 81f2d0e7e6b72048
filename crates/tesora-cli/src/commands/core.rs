//! Core command implementations and shared utilities
//!
//! This module contains:
//! - `open_db` - Shared utility to open the database
//! - `read_statement` - Decode a statement file
//! - `ledger_from_env` - Ledger client from the environment
//! - `cmd_init` - Initialize the database

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tesora_core::{Database, LedgerBackend, PromptId, PromptLibrary, ServiceLayerClient};

/// Open database with encryption by default, or unencrypted if --no-encrypt
pub fn open_db(db_path: &Path, no_encrypt: bool) -> Result<Database> {
    let path_str = db_path
        .to_str()
        .with_context(|| format!("Database path is not valid UTF-8: {}", db_path.display()))?;
    if no_encrypt {
        Database::new_unencrypted(path_str).context("Failed to open database (unencrypted)")
    } else {
        Database::new(path_str).context("Failed to open database")
    }
}

/// Read a statement as UTF-8 text, replacing invalid sequences
pub fn read_statement(file: &Path) -> Result<String> {
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to open file: {}", file.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Ledger client configured through `SAP_SERVICE_LAYER_URL`
pub fn ledger_from_env() -> Result<Arc<dyn LedgerBackend>> {
    let client = ServiceLayerClient::from_env()
        .context("Failed to configure ledger client")?
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Ledger not configured.\n\
                 Set SAP_SERVICE_LAYER_URL, SAP_USERNAME and SAP_PASSWORD"
            )
        })?;
    Ok(Arc::new(client))
}

pub fn cmd_init(db_path: &Path, no_encrypt: bool) -> Result<()> {
    println!("🔧 Initializing database at {}...", db_path.display());

    let db = open_db(db_path, no_encrypt)?;

    let rules = db.count_rules().context("Failed to read learning rules")?;
    let layouts = db
        .list_layout_templates()
        .context("Failed to read layout templates")?
        .len();
    println!("   Learning rules: {}", rules);
    println!("   Cached layouts: {}", layouts);

    let prompts = PromptLibrary::new();
    let overridden: Vec<&str> = PromptId::all()
        .iter()
        .filter(|id| prompts.has_override(**id))
        .map(|id| id.as_str())
        .collect();
    if !overridden.is_empty() {
        println!("   📝 Prompt overrides: {}", overridden.join(", "));
    }

    if no_encrypt {
        println!("   ⚠️  Encryption: DISABLED (--no-encrypt)");
    } else {
        println!("   🔒 Encryption: ENABLED");
    }

    println!("✅ Database initialized successfully!");
    println!();
    println!("Next steps:");
    println!("  1. Classify a statement: tesora classify statement.csv --company-db SBO_DEMO --format json -o review.json");
    println!("  2. Commit it: tesora commit review.json --company-db SBO_DEMO --bank-account 102-01");
    println!("  3. Or start the review UI: tesora serve");

    Ok(())
}
