//! Statement layout inference with a fingerprint cache
//!
//! A new statement format costs one AI call to describe its layout. The
//! result is keyed by a fingerprint of the file's first lines so the next
//! statement from the same bank export skips the call. Inference never
//! stores its own guess: the caller remembers a layout only after it has
//! produced transactions.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::ai::parsing::{parse_layout_response, LayoutGuess};
use crate::ai::{AIBackend, AIClient, GenerateRequest};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::model_router::TaskType;
use crate::models::{LayoutAnalysis, ParseConfig};
use crate::prompts::{PromptId, PromptLibrary};

/// Lines of the file that are hashed and shown to the model
pub const LAYOUT_SAMPLE_LINES: usize = 30;

/// The first lines of a statement, trailing whitespace trimmed
pub fn sample_lines(content: &str) -> String {
    content
        .lines()
        .take(LAYOUT_SAMPLE_LINES)
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

/// SHA-256 hex digest of the layout sample
///
/// Line endings and trailing whitespace do not affect the result, so the
/// same export saved on different systems maps to the same template.
pub fn fingerprint(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sample_lines(content).as_bytes());
    hex::encode(hasher.finalize())
}

/// Infers and caches statement layouts
#[derive(Clone)]
pub struct LayoutInferrer {
    db: Database,
    ai: Option<AIClient>,
    prompts: PromptLibrary,
}

impl LayoutInferrer {
    pub fn new(db: Database, ai: Option<AIClient>, prompts: PromptLibrary) -> Self {
        Self { db, ai, prompts }
    }

    /// Describe the layout of a decoded statement
    ///
    /// Cached fingerprints return immediately without an AI call. A failed
    /// or unreadable AI answer falls back to an empty layout (zero header
    /// lines) instead of failing the upload.
    pub async fn infer(&self, content: &str) -> Result<LayoutAnalysis> {
        if content.trim().is_empty() {
            return Err(Error::EmptyFile);
        }

        let fingerprint = fingerprint(content);

        if let Some(template) = self.db.get_layout_template(&fingerprint)? {
            self.db.touch_layout_template(&fingerprint)?;
            debug!(fingerprint = %fingerprint, "Layout cache hit");
            return Ok(LayoutAnalysis {
                parse_config: template.parse_config,
                bank_name_guess: template.bank_name_guess,
                fingerprint,
                is_cached: true,
            });
        }

        let ai = self.ai.as_ref().ok_or_else(|| {
            Error::Ai("No AI backend configured; cannot infer an unknown statement layout".into())
        })?;

        let guess = match self.ask_model(ai, content).await {
            Ok(guess) => guess,
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "Layout inference failed, assuming no header");
                LayoutGuess::default()
            }
        };

        info!(
            fingerprint = %fingerprint,
            bank = guess.bank_name_guess.as_deref().unwrap_or("unknown"),
            header_lines = guess.header_lines_count,
            "Inferred statement layout"
        );

        Ok(LayoutAnalysis {
            parse_config: ParseConfig {
                header_lines_count: guess.header_lines_count,
                column_description: guess.column_description,
                ..Default::default()
            },
            bank_name_guess: guess.bank_name_guess,
            fingerprint,
            is_cached: false,
        })
    }

    async fn ask_model(&self, ai: &AIClient, content: &str) -> Result<LayoutGuess> {
        let prompt = self.prompts.get(PromptId::InferLayout)?;
        let mut vars = HashMap::new();
        vars.insert("sample", sample_lines(content));

        let request = GenerateRequest::new(TaskType::LayoutInference, prompt.render_user(&vars))
            .with_system(prompt.render_system(&vars))
            .json_object();
        let generation = ai.generate(&request).await?;

        Ok(parse_layout_response(&generation.text))
    }

    /// Store an inferred layout for reuse
    ///
    /// Returns true if a new template was created. Cached analyses are
    /// already stored and are left untouched.
    pub fn remember(&self, analysis: &LayoutAnalysis) -> Result<bool> {
        if analysis.is_cached {
            return Ok(false);
        }
        let created = self.db.save_layout_template(
            &analysis.fingerprint,
            analysis.bank_name_guess.as_deref(),
            &analysis.parse_config,
        )?;
        if created {
            info!(fingerprint = %analysis.fingerprint, "Remembered statement layout");
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockBackend;

    const STATEMENT: &str = "BANCO DEMO\r\nCuenta 0123\r\nFecha\tConcepto\tCargo\tAbono\r\n\
                             01/03/2025\tCOMISION\t10.00\t\r\n";

    fn inferrer(mock: Option<MockBackend>) -> (LayoutInferrer, Database) {
        let db = Database::in_memory().unwrap();
        let ai = mock.map(AIClient::mock);
        (
            LayoutInferrer::new(db.clone(), ai, PromptLibrary::embedded_only()),
            db,
        )
    }

    #[test]
    fn test_fingerprint_ignores_line_endings() {
        let unix = STATEMENT.replace("\r\n", "\n");
        assert_eq!(fingerprint(STATEMENT), fingerprint(&unix));
        assert_eq!(fingerprint(STATEMENT).len(), 64);
        assert_ne!(fingerprint(STATEMENT), fingerprint("BANCO OTRO\n"));
    }

    #[test]
    fn test_fingerprint_uses_first_30_lines() {
        let head: String = (0..30).map(|i| format!("line {}\n", i)).collect();
        let a = format!("{}tail a\n", head);
        let b = format!("{}tail b\nmore\n", head);
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[tokio::test]
    async fn test_empty_file_is_rejected() {
        let (inferrer, _db) = inferrer(Some(MockBackend::new()));
        assert!(matches!(inferrer.infer("  \n\t\n").await, Err(Error::EmptyFile)));
    }

    #[tokio::test]
    async fn test_infer_then_remember_then_cache_hit() {
        let mock = MockBackend::new();
        mock.push_response(
            r#"{"bank_name_guess":"BANCO DEMO","header_lines_count":3,"column_description":"date, memo, cargo, abono"}"#,
        );
        let (inferrer, db) = inferrer(Some(mock.clone()));

        let first = inferrer.infer(STATEMENT).await.unwrap();
        assert!(!first.is_cached);
        assert_eq!(first.parse_config.header_lines_count, 3);
        assert_eq!(first.bank_name_guess.as_deref(), Some("BANCO DEMO"));
        // Inference alone does not populate the cache
        assert!(db.get_layout_template(&first.fingerprint).unwrap().is_none());

        assert!(inferrer.remember(&first).unwrap());
        assert!(!inferrer.remember(&first).unwrap());

        let second = inferrer.infer(STATEMENT).await.unwrap();
        assert!(second.is_cached);
        assert_eq!(second.parse_config, first.parse_config);
        assert_eq!(mock.request_count(), 1);

        let template = db.get_layout_template(&first.fingerprint).unwrap().unwrap();
        assert_eq!(template.use_count, 1);
        assert!(template.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_malformed_answer_falls_back_to_zero_headers() {
        let mock = MockBackend::new();
        mock.push_response("I think this is BBVA");
        let (inferrer, _db) = inferrer(Some(mock));

        let analysis = inferrer.infer(STATEMENT).await.unwrap();
        assert_eq!(analysis.parse_config.header_lines_count, 0);
        assert_eq!(analysis.bank_name_guess, None);
    }

    #[tokio::test]
    async fn test_backend_failure_falls_back_to_zero_headers() {
        let mock = MockBackend::new();
        mock.push_error("connection refused");
        let (inferrer, _db) = inferrer(Some(mock));

        let analysis = inferrer.infer(STATEMENT).await.unwrap();
        assert_eq!(analysis.parse_config, ParseConfig::default());
    }

    #[tokio::test]
    async fn test_unknown_layout_without_ai_fails() {
        let (inferrer, _db) = inferrer(None);
        assert!(matches!(inferrer.infer(STATEMENT).await, Err(Error::Ai(_))));
    }
}
