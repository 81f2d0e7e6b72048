//! Layout analysis command

use std::path::Path;

use anyhow::Result;
use tesora_core::models::LayoutAnalysis;
use tesora_core::{AIClient, Database, LayoutInferrer, PromptLibrary};

use super::read_statement;

pub async fn cmd_analyze(db: &Database, file: &Path, remember: bool) -> Result<()> {
    let content = read_statement(file)?;
    let inferrer = LayoutInferrer::new(db.clone(), AIClient::from_env(), PromptLibrary::new());

    println!("🔍 Analyzing layout of {}...", file.display());
    let analysis = inferrer.infer(&content).await?;
    print_layout(&analysis);

    if remember {
        if inferrer.remember(&analysis)? {
            println!("💾 Layout remembered; the next statement like this skips the AI call");
        } else {
            println!("   Layout already cached");
        }
    }

    Ok(())
}

pub fn print_layout(analysis: &LayoutAnalysis) {
    let config = &analysis.parse_config;
    println!();
    println!("📐 Layout");
    println!("   ─────────────────────────────");
    println!(
        "   Bank:         {}",
        analysis.bank_name_guess.as_deref().unwrap_or("unknown")
    );
    println!("   Header lines: {}", config.header_lines_count);
    if let Some(columns) = &config.column_description {
        println!("   Columns:      {}", columns);
    }
    if let Some(patterns) = &config.noise_patterns {
        println!("   Noise:        {}", patterns.join(", "));
    }
    println!("   Fingerprint:  {}", &analysis.fingerprint);
    println!(
        "   Source:       {}",
        if analysis.is_cached { "cache" } else { "AI" }
    );
}
