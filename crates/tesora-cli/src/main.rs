//! Tesora CLI - Bank statement classification and reconciliation
//!
//! Usage:
//!   tesora init                         Initialize database
//!   tesora classify statement.csv       Extract and classify a statement
//!   tesora commit reviewed.json ...     Commit reviewed rows as a batch
//!   tesora batches post 1               Post a batch to the ledger
//!   tesora serve --port 3000            Start web server

mod cli;
mod commands;


use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::*;
use tesora_core::models::PostingTarget;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    match cli.command {
        Commands::Init => commands::cmd_init(&cli.db, cli.no_encrypt),
        Commands::Analyze { file, remember } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            commands::cmd_analyze(&db, &file, remember).await
        }
        Commands::Classify {
            file,
            parse_config,
            rules_only,
            company_db,
            format,
            output,
        } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            commands::cmd_classify(
                &db,
                &file,
                parse_config.as_deref(),
                rules_only,
                company_db.as_deref(),
                format,
                output.as_deref(),
            )
            .await
        }
        Commands::Rules { action } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            match action {
                None | Some(RulesAction::List) => commands::cmd_rules_list(&db),
                Some(RulesAction::Add {
                    pattern,
                    code,
                    name,
                    match_type,
                    rule_type,
                    confidence,
                }) => commands::cmd_rules_add(
                    &db,
                    &pattern,
                    &code,
                    name.as_deref(),
                    match_type,
                    rule_type,
                    confidence,
                ),
                Some(RulesAction::Match { memo }) => commands::cmd_rules_match(&db, &memo),
            }
        }
        Commands::Commit {
            file,
            company_db,
            bank_account,
            cost_center,
            bpl_id,
            mode,
        } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            let target = PostingTarget {
                company_db,
                bank_account_code: bank_account,
                cost_center,
                bpl_id,
                mode,
            };
            commands::cmd_commit(&db, &file, target)
        }
        Commands::Batches { action } => {
            let db = commands::open_db(&cli.db, cli.no_encrypt)?;
            match action {
                None | Some(BatchesAction::List) => commands::cmd_batches_list(&db),
                Some(BatchesAction::Show { id }) => commands::cmd_batches_show(&db, id),
                Some(BatchesAction::Post { id }) => {
                    let ledger = commands::ledger_from_env()?;
                    commands::cmd_batches_post(&db, ledger, id).await
                }
                Some(BatchesAction::Reprocess { id }) => {
                    let ledger = commands::ledger_from_env()?;
                    commands::cmd_batches_reprocess(&db, ledger, id).await
                }
            }
        }
        Commands::Serve { port, host } => {
            commands::cmd_serve(&cli.db, &host, port, cli.no_encrypt).await
        }
    }
}
