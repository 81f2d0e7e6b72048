//! Batch command implementations
//!
//! Commit, inspection and ledger posting of batches.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tesora_core::models::{BatchStatus, NewBatch, PostingOutcome, PostingTarget};
use tesora_core::{
    batch_summary, commit_batch, Database, LearningFeedbackLoop, LedgerBackend, LedgerPoster,
};

use super::{format_amount, load_review_file, truncate};

pub fn cmd_commit(db: &Database, file: &Path, target: PostingTarget) -> Result<()> {
    let review = load_review_file(file)?;
    let filename = review.filename.unwrap_or_else(|| {
        file.file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    let batch = NewBatch {
        filename,
        target,
        lines: review.transactions,
    };
    let detail = commit_batch(db, &batch).context("Failed to commit batch")?;

    println!(
        "✅ Committed batch {} (statement {})",
        detail.batch.id, detail.batch.statement_number
    );
    println!("   Records: {}", detail.batch.total_records);
    println!("   Debit:   {:.2}", detail.batch.total_debit);
    println!("   Credit:  {:.2}", detail.batch.total_credit);

    let outcome = LearningFeedbackLoop::new(db.clone()).learn(&batch.lines)?;
    if outcome.created + outcome.reinforced > 0 {
        println!(
            "   🧠 Learned from corrections: {} new rule(s), {} reinforced, {} demoted",
            outcome.created, outcome.reinforced, outcome.demoted
        );
    }

    println!();
    println!("   Post it with: tesora batches post {}", detail.batch.id);

    Ok(())
}

pub fn cmd_batches_list(db: &Database) -> Result<()> {
    let batches = db.list_batches()?;

    if batches.is_empty() {
        println!("No batches yet. Commit a reviewed statement with 'tesora commit'.");
        return Ok(());
    }

    println!();
    println!("📦 Batches");
    println!(
        "   {:>4}  {:12}  {:24}  {:12}  {:>7}  {:>14}  {:>14}  {}",
        "ID", "Statement", "File", "Company", "Records", "Debit", "Credit", "Status"
    );
    println!("   {}", "─".repeat(112));

    for batch in &batches {
        println!(
            "   {:>4}  {:12}  {:24}  {:12}  {:>7}  {:>14.2}  {:>14.2}  {}",
            batch.id,
            batch.statement_number,
            truncate(&batch.filename, 24),
            truncate(&batch.target.company_db, 12),
            batch.total_records,
            batch.total_debit,
            batch.total_credit,
            status_label(batch.status),
        );
    }

    Ok(())
}

pub fn cmd_batches_show(db: &Database, id: i64) -> Result<()> {
    let summary = batch_summary(db, id)?;
    let batch = &summary.batch;
    let lines = db.batch_lines(id)?;

    println!();
    println!("📦 Batch {} - statement {}", batch.id, batch.statement_number);
    println!("   ─────────────────────────────");
    println!("   File:      {}", batch.filename);
    println!("   Company:   {}", batch.target.company_db);
    println!("   Bank GL:   {}", batch.target.bank_account_code);
    println!("   Mode:      {}", batch.target.mode.as_str());
    println!("   Status:    {}", status_label(batch.status));
    if let Some(error) = &batch.error_message {
        println!("   Error:     {}", error);
    }
    println!(
        "   Lines:     {} posted, {} unposted ({} failed)",
        summary.posted_lines, summary.unposted_lines, summary.failed_lines
    );

    println!();
    println!(
        "   {:>4}  {:10}  {:36}  {:>12}  {:>12}  {:10}  {}",
        "Seq", "Date", "Memo", "Debit", "Credit", "Account", "Ledger"
    );
    println!("   {}", "─".repeat(104));

    for line in &lines {
        let ledger = match (line.external_ref, &line.error) {
            (Some(reference), _) => format!("#{}", reference),
            (None, Some(error)) => format!("❌ {}", truncate(error, 40)),
            (None, None) => "-".to_string(),
        };
        println!(
            "   {:>4}  {:10}  {:36}  {:>12}  {:>12}  {:10}  {}",
            line.sequence,
            line.due_date.format("%Y-%m-%d").to_string(),
            truncate(&line.memo, 36),
            format_amount(line.debit_amount),
            format_amount(line.credit_amount),
            line.sap_account_code,
            ledger,
        );
    }

    Ok(())
}

pub async fn cmd_batches_post(
    db: &Database,
    ledger: Arc<dyn LedgerBackend>,
    id: i64,
) -> Result<()> {
    println!("📤 Posting batch {}...", id);
    let outcome = LedgerPoster::new(db.clone(), ledger).post(id).await?;
    print_outcome(&outcome);
    Ok(())
}

pub async fn cmd_batches_reprocess(
    db: &Database,
    ledger: Arc<dyn LedgerBackend>,
    id: i64,
) -> Result<()> {
    println!("🔁 Reprocessing batch {}...", id);
    let outcome = LedgerPoster::new(db.clone(), ledger).reprocess(id).await?;
    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &PostingOutcome) {
    println!(
        "   Attempted: {}   Posted: {}   Failed: {}",
        outcome.attempted, outcome.posted, outcome.failed
    );
    match outcome.status {
        BatchStatus::Completed => println!("✅ Batch {} completed", outcome.batch_id),
        _ => {
            println!(
                "⚠️  Batch {} {}: {}",
                outcome.batch_id,
                outcome.status,
                outcome.error_message.as_deref().unwrap_or("unknown error")
            );
            println!(
                "   Fix the rejected rows in the ledger, then run 'tesora batches reprocess {}'",
                outcome.batch_id
            );
        }
    }
}

fn status_label(status: BatchStatus) -> &'static str {
    match status {
        BatchStatus::Pending => "⏳ pending",
        BatchStatus::Processing => "🔄 processing",
        BatchStatus::Completed => "✅ completed",
        BatchStatus::Failed => "❌ failed",
    }
}
