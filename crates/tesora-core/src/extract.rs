//! Chunked transaction extraction
//!
//! The statement body is cut into fixed-size line chunks and each chunk is
//! sent to the extraction model together with the literal header lines, so
//! the model always sees the real column labels. Chunks run one after the
//! other; a chunk that fails or returns garbage contributes no rows and the
//! rest of the statement is still processed.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::ai::parsing::{parse_extracted_row, ExtractionResponse};
use crate::ai::{AIBackend, AIClient, GenerateRequest};
use crate::error::{Error, Result};
use crate::model_router::TaskType;
use crate::models::{emit, ParseConfig, ProgressEvent, ProgressSink, RawTransaction};
use crate::prompts::{PromptId, PromptLibrary};

/// Data lines per extraction call
pub const CHUNK_SIZE: usize = 80;

/// A data block up to `CHUNK_SIZE + SINGLE_CHUNK_SLACK` lines is sent whole
pub const SINGLE_CHUNK_SLACK: usize = 10;

/// A statement split into header and data chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan<'a> {
    pub header: Vec<&'a str>,
    pub chunks: Vec<Vec<&'a str>>,
    pub total_lines: usize,
    pub data_lines: usize,
}

/// Split a statement at `header_lines` and chunk the non-blank data lines
pub fn plan_chunks(content: &str, header_lines: usize) -> ChunkPlan<'_> {
    let lines: Vec<&str> = content.lines().collect();
    let split = header_lines.min(lines.len());
    let header = lines[..split].to_vec();
    let data: Vec<&str> = lines[split..]
        .iter()
        .copied()
        .filter(|l| !l.trim().is_empty())
        .collect();

    let chunks = if data.is_empty() {
        Vec::new()
    } else if data.len() <= CHUNK_SIZE + SINGLE_CHUNK_SLACK {
        vec![data.clone()]
    } else {
        data.chunks(CHUNK_SIZE).map(<[&str]>::to_vec).collect()
    };

    ChunkPlan {
        header,
        data_lines: data.len(),
        total_lines: lines.len(),
        chunks,
    }
}

/// Extracts raw transactions from statement text with the AI backend
#[derive(Clone)]
pub struct ChunkedExtractor {
    ai: AIClient,
    prompts: PromptLibrary,
}

impl ChunkedExtractor {
    pub fn new(ai: AIClient, prompts: PromptLibrary) -> Self {
        Self { ai, prompts }
    }

    /// Extract every transaction in file order
    ///
    /// Sequences are reassigned 1..N over the merged result; whatever the
    /// model numbered inside a chunk is discarded.
    pub async fn extract(
        &self,
        content: &str,
        config: &ParseConfig,
        progress: &ProgressSink,
    ) -> Result<Vec<RawTransaction>> {
        if content.trim().is_empty() {
            return Err(Error::EmptyFile);
        }

        let plan = plan_chunks(content, config.header_lines_count);
        let total_chunks = plan.chunks.len();
        let header = plan.header.join("\n");

        info!(
            total_lines = plan.total_lines,
            data_lines = plan.data_lines,
            total_chunks,
            "Starting extraction"
        );
        emit(
            progress,
            ProgressEvent::ExtractionStart {
                total_lines: plan.total_lines,
                data_lines: plan.data_lines,
                total_chunks,
            },
        );

        let prompt = self.prompts.get(PromptId::ExtractTransactions)?;
        let mut transactions = Vec::new();

        for (i, chunk) in plan.chunks.iter().enumerate() {
            let chunk_number = i + 1;
            emit(
                progress,
                ProgressEvent::ChunkProgress {
                    chunk: chunk_number,
                    total_chunks,
                },
            );

            let mut vars = HashMap::new();
            vars.insert("chunk_number", chunk_number.to_string());
            vars.insert("total_chunks", total_chunks.to_string());
            vars.insert(
                "column_description",
                config.column_description.clone().unwrap_or_default(),
            );
            vars.insert("header", header.clone());
            vars.insert("chunk", chunk.join("\n"));

            let request = GenerateRequest::new(TaskType::Extraction, prompt.render_user(&vars))
                .with_system(prompt.render_system(&vars));

            let rows = match self.ai.generate(&request).await {
                Ok(generation) => {
                    let decoded = ExtractionResponse::decode(&generation.text, generation.truncated);
                    match &decoded {
                        ExtractionResponse::Truncated(rows) => warn!(
                            chunk = chunk_number,
                            recovered = rows.len(),
                            "Extraction response was truncated, kept complete rows"
                        ),
                        ExtractionResponse::Invalid => warn!(
                            chunk = chunk_number,
                            truncated = generation.truncated,
                            "Extraction response could not be decoded, skipping chunk"
                        ),
                        _ => {}
                    }
                    decoded.into_rows()
                }
                Err(e) => {
                    warn!(chunk = chunk_number, error = %e, "Extraction call failed, skipping chunk");
                    Vec::new()
                }
            };

            let before = transactions.len();
            transactions.extend(rows.iter().filter_map(parse_extracted_row));
            debug!(
                chunk = chunk_number,
                returned = rows.len(),
                accepted = transactions.len() - before,
                "Chunk extracted"
            );

            emit(
                progress,
                ProgressEvent::ChunkDone {
                    chunk: chunk_number,
                    total_chunks,
                    extracted_so_far: transactions.len(),
                },
            );
        }

        for (i, tx) in transactions.iter_mut().enumerate() {
            tx.sequence = (i + 1) as u32;
        }

        if transactions.is_empty() {
            return Err(Error::NoTransactionsExtracted);
        }

        info!(total = transactions.len(), "Extraction complete");
        emit(
            progress,
            ProgressEvent::ExtractionComplete {
                total_transactions: transactions.len(),
            },
        );

        Ok(transactions)
    }
}
