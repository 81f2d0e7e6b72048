//! Memo feature extraction
//!
//! Bank memos mix the useful signal (counterparty, tax id, operation type)
//! with per-transaction noise (tracking numbers, timestamps, account
//! numbers). This module strips the noise and pulls out the typed features
//! that rules and prompts key on.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::models::ParseConfig;

/// Longest prefix kept when a memo becomes a learned pattern
pub const LEARNING_PATTERN_MAX_CHARS: usize = 50;

/// Shortest pattern accepted for a rule
pub const MIN_PATTERN_CHARS: usize = 3;

const DEFAULT_NOISE_PATTERNS: &[&str] = &[
    r"(?i)RASTREO\s+[A-Z0-9]+",
    r"(?i)REFERENCIA\s+[A-Z0-9]+",
    r"(?i)\bREF\.?\s*[A-Z0-9]+",
    r"(?i)HORA:?\s*\d{2}:\d{2}(:\d{2})?",
    r"(?i)FOLIO\s*:?\s*\d+",
    r"(?i)\bCIE\s*:?\s*\d+",
    r"(?i)DATO NO VERIFICADO[^,]*",
    r"(?i)A LA CTA\.?\s*CLABE[^,]*",
    r"(?i)DE LA CTA\.?\s*CLABE[^,]*",
    r"\d{10,}",
];

const DEFAULT_ACTOR_PATTERNS: &[&str] = &[
    r"(?i)RECIBIDO DE\s+\d+-[A-Z]+\s+DE\s+(.+?)(?:\s+RFC|\s+CONCEPTO|$)",
    r"(?i)ENVIADO A\s+\d+-[A-Z]+\s+A\s+(.+?)(?:\s+RFC|\s+CONCEPTO|$)",
    r"(?i)ORDENANTE:?\s*(.+?)(?:\s+RFC|\s+CONCEPTO|$)",
    r"(?i)BENEFICIARIO:?\s*(.+?)(?:\s+RFC|\s+CONCEPTO|$)",
];

/// Longest first, so "IVA POR COMISION" wins over "COMISION" and "IVA"
const KNOWN_CONCEPTS: &[&str] = &[
    "DEPOSITO EN EFECTIVO",
    "IVA POR COMISION",
    "DEPOSITO VENTAS",
    "RETIRO EFECTIVO",
    "PAGO IMPUESTOS",
    "RENTA TERMINAL",
    "PAGO SERVICIOS",
    "TRANSFERENCIA",
    "AGUINALDO",
    "RENTA TPV",
    "COMISION",
    "NOMINA",
    "IVA",
    "TPV",
];

/// Most specific first
const CORPORATE_SUFFIXES: &[&str] = &[
    "S DE RL DE CV",
    "SAPI DE CV",
    "SA DE CV",
    "SC DE RL",
    "S DE RL",
    "SC",
    "SA",
    "AC",
];

static DEFAULT_NOISE: LazyLock<Vec<Regex>> = LazyLock::new(|| compile_all(DEFAULT_NOISE_PATTERNS));
static DEFAULT_ACTORS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile_all(DEFAULT_ACTOR_PATTERNS));

static RFC_NOT_AVAILABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)RFC\s+ND\b").expect("valid regex"));
static RFC_LABELED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)RFC\s*:?\s*([A-Z]{3,4}\d{6}[A-Z0-9]{3})\b").expect("valid regex")
});
static RFC_STANDALONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z]{3,4}\d{6}[A-Z0-9]{3})\b").expect("valid regex"));

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| compile_pattern(p))
        .collect()
}

/// Compile a layout-supplied pattern
///
/// Accepts plain regexes and `/pattern/flags` literals; matching is always
/// case-insensitive. Invalid patterns are skipped with a warning.
fn compile_pattern(pattern: &str) -> Option<Regex> {
    let body = match pattern.strip_prefix('/').and_then(|rest| rest.rsplit_once('/')) {
        Some((inner, flags)) if flags.chars().all(|c| c.is_ascii_alphabetic()) => inner,
        _ => pattern,
    };
    let source = if body.starts_with("(?i)") {
        body.to_string()
    } else {
        format!("(?i){}", body)
    };

    match Regex::new(&source) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "Skipping invalid memo pattern");
            None
        }
    }
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Features extracted from one memo
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoFeatures {
    pub clean: String,
    pub actor: Option<String>,
    pub rfc: Option<String>,
    pub concept: Option<&'static str>,
}

/// Memo analyzer with the noise and actor patterns for one layout
#[derive(Debug, Clone)]
pub struct MemoAnalyzer {
    noise: Vec<Regex>,
    actors: Vec<Regex>,
}

impl MemoAnalyzer {
    /// Analyzer using the built-in patterns
    pub fn new() -> Self {
        Self {
            noise: DEFAULT_NOISE.clone(),
            actors: DEFAULT_ACTORS.clone(),
        }
    }

    /// Analyzer using a layout's patterns where it defines them
    pub fn from_config(config: &ParseConfig) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| compile_pattern(p)).collect()
        };
        Self {
            noise: config
                .noise_patterns
                .as_deref()
                .map(compile)
                .unwrap_or_else(|| DEFAULT_NOISE.clone()),
            actors: config
                .actor_patterns
                .as_deref()
                .map(compile)
                .unwrap_or_else(|| DEFAULT_ACTORS.clone()),
        }
    }

    /// Remove noise tokens and collapse whitespace
    pub fn clean(&self, memo: &str) -> String {
        let mut cleaned = memo.to_string();
        for re in &self.noise {
            cleaned = re.replace_all(&cleaned, "").into_owned();
        }
        normalize_whitespace(&cleaned)
    }

    /// Counterparty named in the memo, without corporate suffixes
    pub fn actor(&self, memo: &str) -> Option<String> {
        self.actors.iter().find_map(|re| {
            let captured = re.captures(memo)?.get(1)?.as_str().trim();
            (captured.chars().count() >= MIN_PATTERN_CHARS).then(|| clean_actor_name(captured))
        })
    }

    pub fn analyze(&self, memo: &str) -> MemoFeatures {
        let clean = self.clean(memo);
        let concept = extract_concept(&clean);
        MemoFeatures {
            actor: self.actor(memo),
            rfc: extract_rfc(memo),
            concept,
            clean,
        }
    }
}

impl Default for MemoAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Uppercase a counterparty name and drop its corporate suffix
pub fn clean_actor_name(name: &str) -> String {
    let mut clean = normalize_whitespace(&name.to_uppercase());
    for suffix in CORPORATE_SUFFIXES {
        if let Some(stripped) = clean.strip_suffix(suffix) {
            if stripped.is_empty() || stripped.ends_with(' ') {
                clean = stripped.trim_end().to_string();
            }
        }
    }
    clean
}

/// Mexican tax id (RFC) mentioned in the memo
///
/// `RFC ND` ("not available") means none. A labeled `RFC: XXXX999999XXX`
/// wins over a bare token of the same shape.
pub fn extract_rfc(memo: &str) -> Option<String> {
    if RFC_NOT_AVAILABLE.is_match(memo) {
        return None;
    }
    if let Some(caps) = RFC_LABELED.captures(memo) {
        return caps.get(1).map(|m| m.as_str().to_uppercase());
    }
    RFC_STANDALONE
        .captures(&memo.to_uppercase())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Longest known banking concept contained in the memo
pub fn extract_concept(memo: &str) -> Option<&'static str> {
    let upper = memo.to_uppercase();
    KNOWN_CONCEPTS.iter().copied().find(|c| upper.contains(c))
}

/// Pattern learned from an operator correction
///
/// Noise is stripped with the built-in patterns, then the memo is
/// uppercased and cut to its first 50 characters. Returns `None` when
/// fewer than 3 characters remain.
pub fn learning_pattern(memo: &str) -> Option<String> {
    static ANALYZER: LazyLock<MemoAnalyzer> = LazyLock::new(MemoAnalyzer::new);

    let cleaned = ANALYZER.clean(memo).to_uppercase();
    let pattern: String = cleaned.chars().take(LEARNING_PATTERN_MAX_CHARS).collect();
    let pattern = pattern.trim_end().to_string();

    (pattern.chars().count() >= MIN_PATTERN_CHARS).then_some(pattern)
}

/// Pattern for an operator "save rule" action
///
/// Uses the explicit pattern when given, otherwise the whole memo, with
/// whitespace normalized and uppercased.
pub fn rule_pattern(memo: &str, explicit: Option<&str>) -> Result<String> {
    let source = explicit.filter(|p| !p.trim().is_empty()).unwrap_or(memo);
    let pattern = normalize_whitespace(source).to_uppercase();

    if pattern.chars().count() < MIN_PATTERN_CHARS {
        return Err(Error::InvalidInput(format!(
            "Rule pattern must be at least {} characters",
            MIN_PATTERN_CHARS
        )));
    }
    Ok(pattern)
}
