//! Statement classification command
//!
//! `--format json` writes a review file: the classified rows plus the
//! account the AI proposed for each. Edit `sap_account_code` where the
//! classification is wrong and pass the file to `tesora commit`; edits
//! to AI rows are learned as corrections.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use tesora_core::export::classified_to_csv;
use tesora_core::models::{
    BatchLineInput, ChartAccount, ClassificationSource, ClassificationSummary,
    ClassifiedTransaction, LayoutAnalysis, ParseConfig, ProgressEvent, ProgressSink,
};
use tesora_core::{
    AIClient, BatchClassifier, ChunkedExtractor, Database, ExportFormat, LayoutInferrer,
    LedgerBackend, MemoAnalyzer, PromptLibrary,
};

use super::{format_amount, ledger_from_env, print_layout, read_statement, truncate};

/// Output of one classification run
pub struct ClassifyRun {
    /// Layout that was inferred, when no parse config was supplied
    pub layout: Option<LayoutAnalysis>,
    pub rows: Vec<ClassifiedTransaction>,
    pub summary: ClassificationSummary,
}

#[derive(Serialize)]
struct ReviewRow<'a> {
    #[serde(flatten)]
    row: &'a ClassifiedTransaction,
    #[serde(skip_serializing_if = "Option::is_none")]
    ai_suggested_account: Option<&'a str>,
}

#[derive(Serialize)]
struct ReviewOutput<'a> {
    filename: &'a str,
    transactions: Vec<ReviewRow<'a>>,
    summary: &'a ClassificationSummary,
}

/// A review file read back for commit
#[derive(Debug, Deserialize)]
pub struct ReviewFile {
    #[serde(default)]
    pub filename: Option<String>,
    pub transactions: Vec<BatchLineInput>,
}

pub async fn cmd_classify(
    db: &Database,
    file: &Path,
    parse_config: Option<&Path>,
    rules_only: bool,
    company_db: Option<&str>,
    format: ExportFormat,
    output: Option<&Path>,
) -> Result<()> {
    let content = read_statement(file)?;
    let ai = AIClient::from_env().ok_or_else(|| {
        anyhow::anyhow!(
            "No AI backend configured; statements cannot be extracted.\n\
             Set OLLAMA_HOST (or AI_BACKEND=openai_compatible with OPENAI_COMPATIBLE_HOST)"
        )
    })?;

    let config = match parse_config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read parse config: {}", path.display()))?;
            let config: ParseConfig = serde_json::from_str(&json)
                .with_context(|| "Failed to parse parse config as JSON")?;
            Some(config)
        }
        None => None,
    };

    let chart = match company_db {
        Some(company_db) if !rules_only => {
            let ledger = ledger_from_env()?;
            ledger
                .fetch_chart(company_db)
                .await
                .with_context(|| format!("Failed to fetch chart of accounts for {}", company_db))?
        }
        _ => Vec::new(),
    };

    eprintln!("📄 Processing {}...", file.display());
    if chart.is_empty() && !rules_only {
        eprintln!("   💡 Tip: pass --company-db so the AI can choose ledger accounts");
    }

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            eprintln!("{}", describe_progress(&event));
        }
    });

    let progress: ProgressSink = Some(progress_tx);
    let run = run_classify(
        db,
        ai,
        PromptLibrary::new(),
        &content,
        config,
        &chart,
        rules_only,
        &progress,
    )
    .await;
    drop(progress);
    let _ = printer.await;
    let run = run?;

    if let Some(layout) = &run.layout {
        if matches!(format, ExportFormat::Table) {
            print_layout(layout);
        }
    }

    let filename = file
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let rendered = render_classified(&run, &filename, format)?;

    match output {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("Failed to write output: {}", path.display()))?;
            eprintln!("✅ Wrote {} rows to {}", run.rows.len(), path.display());
        }
        None => print!("{}", rendered),
    }

    Ok(())
}

/// Layout (if needed), extraction and classification of one statement
///
/// An inferred layout is remembered only once extraction succeeds with it.
#[allow(clippy::too_many_arguments)]
pub async fn run_classify(
    db: &Database,
    ai: AIClient,
    prompts: PromptLibrary,
    content: &str,
    parse_config: Option<ParseConfig>,
    chart: &[ChartAccount],
    rules_only: bool,
    progress: &ProgressSink,
) -> Result<ClassifyRun> {
    let inferrer = LayoutInferrer::new(db.clone(), Some(ai.clone()), prompts.clone());
    let (config, layout) = match parse_config {
        Some(config) => (config, None),
        None => {
            let analysis = inferrer.infer(content).await?;
            (analysis.parse_config.clone(), Some(analysis))
        }
    };

    let extractor = ChunkedExtractor::new(ai.clone(), prompts.clone());
    let transactions = extractor.extract(content, &config, progress).await?;

    if let Some(analysis) = &layout {
        if let Err(e) = inferrer.remember(analysis) {
            warn!(error = %e, "Failed to remember statement layout");
        }
    }

    let classifier = BatchClassifier::new(db.clone(), Some(ai), prompts)
        .with_analyzer(MemoAnalyzer::from_config(&config));
    let rows = classifier
        .classify(transactions, chart, rules_only, progress)
        .await?;
    let summary = ClassificationSummary::from_rows(&rows);

    Ok(ClassifyRun {
        layout,
        rows,
        summary,
    })
}

fn describe_progress(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::ExtractionStart {
            data_lines,
            total_chunks,
            ..
        } => format!("   📑 {} data lines in {} chunk(s)", data_lines, total_chunks),
        ProgressEvent::ChunkProgress {
            chunk,
            total_chunks,
        } => format!("   Extracting chunk {}/{}...", chunk, total_chunks),
        ProgressEvent::ChunkDone {
            chunk,
            total_chunks,
            extracted_so_far,
        } => format!(
            "   Chunk {}/{} done ({} transactions so far)",
            chunk, total_chunks, extracted_so_far
        ),
        ProgressEvent::ExtractionComplete { total_transactions } => {
            format!("   ✅ Extracted {} transactions", total_transactions)
        }
        ProgressEvent::ClassificationStart {
            rule_matched,
            pending_ai,
            ..
        } => format!(
            "   🏷️  {} matched by rules, {} left for the AI",
            rule_matched, pending_ai
        ),
        ProgressEvent::ClassificationComplete {
            classified,
            unclassified,
        } => format!(
            "   ✅ Classified {}, {} need review",
            classified, unclassified
        ),
    }
}

/// Render a run in the requested format
pub fn render_classified(run: &ClassifyRun, filename: &str, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Csv => Ok(classified_to_csv(&run.rows)?),
        ExportFormat::Json => {
            let output = ReviewOutput {
                filename,
                transactions: run
                    .rows
                    .iter()
                    .map(|row| ReviewRow {
                        row,
                        ai_suggested_account: match row.source {
                            ClassificationSource::Ai => row.sap_account_code.as_deref(),
                            _ => None,
                        },
                    })
                    .collect(),
                summary: &run.summary,
            };
            Ok(serde_json::to_string_pretty(&output)? + "\n")
        }
        ExportFormat::Table => Ok(render_table(&run.rows, &run.summary)),
    }
}

fn render_table(rows: &[ClassifiedTransaction], summary: &ClassificationSummary) -> String {
    let mut out = String::new();
    out.push('\n');
    out.push_str(&format!(
        "   {:>4}  {:10}  {:40}  {:>12}  {:>12}  {:10}  {:>4}  {}\n",
        "Seq", "Date", "Memo", "Debit", "Credit", "Account", "Conf", "Source"
    ));
    out.push_str(&format!("   {}\n", "─".repeat(112)));

    for row in rows {
        let tx = &row.transaction;
        out.push_str(&format!(
            "   {:>4}  {:10}  {:40}  {:>12}  {:>12}  {:10}  {:>4}  {}\n",
            tx.sequence,
            tx.due_date.format("%Y-%m-%d").to_string(),
            truncate(&tx.memo, 40),
            format_amount(tx.debit_amount),
            format_amount(tx.credit_amount),
            row.sap_account_code.as_deref().unwrap_or("-"),
            row.confidence,
            row.source,
        ));
    }

    out.push('\n');
    out.push_str(&format!(
        "   Records: {}   Debit: {:.2}   Credit: {:.2}   Unclassified: {}\n",
        summary.total_records, summary.total_debit, summary.total_credit, summary.unclassified_count
    ));
    if summary.unclassified_count > 0 {
        out.push_str("   ⚠️  Assign accounts to unclassified rows before committing\n");
    }
    out
}

/// Read a review file written by `classify --format json`
pub fn load_review_file(path: &Path) -> Result<ReviewFile> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to open review file: {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| "Failed to parse review file as JSON")
}
