//! JSON parsing helpers for AI backend responses
//!
//! Model output is rarely clean JSON. Responses may be fenced in markdown,
//! preceded by prose, wrapped in an object, or cut off at the token limit.
//! Extraction responses are decoded into [`ExtractionResponse`], which tries
//! each interpretation in order instead of patching strings ad hoc.

use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::RawTransaction;

/// Confidence assumed when the classifier omits one
pub const DEFAULT_AI_CONFIDENCE: u8 = 80;

/// How far back the truncation repair looks for a closing brace
const MAX_REPAIR_ATTEMPTS: usize = 64;

/// Remove surrounding markdown code fences (```json ... ```)
pub fn strip_code_fences(response: &str) -> &str {
    let mut s = response.trim();
    if let Some(rest) = s.strip_prefix("```") {
        // Drop the info string ("json") on the opening fence line
        s = match rest.find('\n') {
            Some(nl) => &rest[nl + 1..],
            None => rest,
        };
    }
    if let Some(rest) = s.trim_end().strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

/// Skip any prose before the first JSON bracket
fn json_start(response: &str) -> &str {
    match response.find(['[', '{']) {
        Some(i) => &response[i..],
        None => response,
    }
}

/// Decoded shape of an extraction (or classification) response
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionResponse {
    /// A well-formed top-level array
    Array(Vec<Value>),
    /// An object holding the row array under some key
    WrappedObject(Vec<Value>),
    /// Cut-off output; only the complete leading rows survive
    Truncated(Vec<Value>),
    Invalid,
}

impl ExtractionResponse {
    /// Decode a raw backend response
    ///
    /// Invalid JSON is always run through the truncation repair, whether or
    /// not the backend reported hitting its token limit.
    pub fn decode(response: &str, truncated: bool) -> Self {
        let body = json_start(strip_code_fences(response));

        match serde_json::from_str::<Value>(body) {
            Ok(Value::Array(rows)) => return Self::Array(rows),
            Ok(Value::Object(map)) => {
                return match unwrap_row_array(&map) {
                    Some(rows) => Self::WrappedObject(rows),
                    None => Self::Invalid,
                };
            }
            Ok(_) => return Self::Invalid,
            Err(e) => {
                debug!(truncated, error = %e, "Response is not valid JSON, attempting repair");
            }
        }

        match repair_truncated_array(body) {
            Some(rows) => Self::Truncated(rows),
            None => Self::Invalid,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid)
    }

    /// The recovered rows, empty for `Invalid`
    pub fn into_rows(self) -> Vec<Value> {
        match self {
            Self::Array(rows) | Self::WrappedObject(rows) | Self::Truncated(rows) => rows,
            Self::Invalid => Vec::new(),
        }
    }
}

/// First array-valued field whose elements are all objects
fn unwrap_row_array(map: &serde_json::Map<String, Value>) -> Option<Vec<Value>> {
    map.values().find_map(|v| match v {
        Value::Array(items) if items.iter().all(Value::is_object) => Some(items.clone()),
        _ => None,
    })
}

/// Recover the complete leading objects of a cut-off JSON array
///
/// Walks backward over `}` positions, closing the array after each one until
/// the prefix parses. Handles both a bare array and an array wrapped in an
/// object (`{"transactions": [...`).
pub fn repair_truncated_array(response: &str) -> Option<Vec<Value>> {
    let body = json_start(response.trim());
    let wrapped = body.starts_with('{');
    let suffix = if wrapped { "]}" } else { "]" };

    let mut end = body.len();
    for _ in 0..MAX_REPAIR_ATTEMPTS {
        let pos = body[..end].rfind('}')?;
        let candidate = format!("{}{}", &body[..=pos], suffix);

        match serde_json::from_str::<Value>(&candidate) {
            Ok(Value::Array(rows)) => return Some(rows),
            Ok(Value::Object(map)) => {
                if let Some(rows) = unwrap_row_array(&map) {
                    return Some(rows);
                }
            }
            _ => {}
        }
        end = pos;
    }
    None
}

// ========== Layout Inference ==========

/// Layout fields proposed by the model; anything missing stays empty
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayoutGuess {
    pub bank_name_guess: Option<String>,
    pub header_lines_count: usize,
    pub column_description: Option<String>,
}

/// Parse a layout inference response, falling back to an empty guess
pub fn parse_layout_response(response: &str) -> LayoutGuess {
    let body = json_start(strip_code_fences(response));
    let end = body.rfind('}').map(|e| e + 1).unwrap_or(body.len());

    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&body[..end]) else {
        debug!("Layout response is not a JSON object, using empty layout");
        return LayoutGuess::default();
    };

    let header_lines_count = map
        .get("header_lines_count")
        .and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .unwrap_or(0) as usize;

    LayoutGuess {
        bank_name_guess: non_empty_str(map.get("bank_name_guess")),
        header_lines_count,
        column_description: non_empty_str(map.get("column_description")),
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        .map(String::from)
}

// ========== Classification ==========

/// One row of a classification response
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AiClassification {
    pub sequence: u32,
    pub sap_code: Option<String>,
    pub confidence: u8,
}

/// Parse a classification response into per-sequence suggestions
///
/// Accepts `seq`, `sap`, and `conf` as aliases. Rows without a usable
/// sequence are skipped. A response with no decodable array is an error so
/// the caller can mark the whole chunk as failed.
pub fn parse_classification_response(response: &str) -> Result<Vec<AiClassification>> {
    let decoded = ExtractionResponse::decode(response, false);
    if decoded.is_invalid() {
        let raw = response.trim();
        let preview = if raw.len() > 200 {
            format!("{}...", raw.chars().take(200).collect::<String>())
        } else {
            raw.to_string()
        };
        return Err(Error::InvalidData(format!(
            "No JSON array in classification response | Raw: {}",
            preview
        )));
    }

    Ok(decoded
        .into_rows()
        .iter()
        .filter_map(|row| {
            let sequence = field(row, &["sequence", "seq"]).and_then(value_to_u64)? as u32;
            let sap_code = field(row, &["sap_code", "sap", "account"])
                .and_then(|v| match v {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .filter(|s| !s.is_empty());
            let confidence = field(row, &["confidence", "conf"])
                .and_then(|v| match v {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                })
                .map(|c| c.round().clamp(0.0, 100.0) as u8)
                .unwrap_or(DEFAULT_AI_CONFIDENCE);

            Some(AiClassification {
                sequence,
                sap_code,
                confidence,
            })
        })
        .collect())
}

fn field<'a>(row: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|n| row.get(*n)).filter(|v| !v.is_null())
}

fn value_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ========== Extraction Rows ==========

/// Parse an amount given as a JSON number or a formatted string
///
/// Strings may carry thousands separators, a currency sign, surrounding
/// spaces, or accounting parentheses. Empty strings and a lone `-` are null.
pub fn parse_amount(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .chars()
                .filter(|c| !matches!(c, ',' | '$' | ' '))
                .collect();
            if cleaned.is_empty() || cleaned == "-" {
                return None;
            }
            let (negative, digits) = match cleaned
                .strip_prefix('(')
                .and_then(|rest| rest.strip_suffix(')'))
            {
                Some(inner) => (true, inner),
                None => (false, cleaned.as_str()),
            };
            let amount = Decimal::from_str(digits).ok()?;
            Some(if negative { -amount } else { amount })
        }
        _ => None,
    }
}

/// Parse a due date in ISO form, with day-first fallbacks common in bank exports
pub fn parse_due_date(value: &Value) -> Option<NaiveDate> {
    let s = value.as_str()?.trim().trim_matches('\'');
    let s = s.get(..10).unwrap_or(s);
    ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d", "%d-%m-%Y", "%d%m%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Turn one extracted row into a transaction, or drop it
///
/// Amounts are netted into a single column: a negative debit becomes a
/// credit and vice versa, and a row carrying both keeps the difference.
/// Rows with no positive amount, no parseable date, or an empty memo are
/// dropped. The sequence is left at 0 for the caller to assign.
pub fn parse_extracted_row(row: &Value) -> Option<RawTransaction> {
    let Some(due_date) = field(row, &["due_date", "date", "fecha"]).and_then(parse_due_date) else {
        debug!(row = %row, "Dropping extracted row without a valid date");
        return None;
    };

    let memo = field(row, &["memo", "description", "concepto"])
        .and_then(Value::as_str)
        .map(|m| m.split_whitespace().collect::<Vec<_>>().join(" "))
        .unwrap_or_default();
    if memo.is_empty() {
        debug!(row = %row, "Dropping extracted row without a memo");
        return None;
    }

    let debit = field(row, &["debit_amount", "debit", "cargo"]).and_then(parse_amount);
    let credit = field(row, &["credit_amount", "credit", "abono"]).and_then(parse_amount);
    let net = credit.unwrap_or_default() - debit.unwrap_or_default();

    let (debit_amount, credit_amount) = if net > Decimal::ZERO {
        (None, Some(net))
    } else if net < Decimal::ZERO {
        (Some(-net), None)
    } else {
        debug!(row = %row, "Dropping extracted row without a positive amount");
        return None;
    };

    Some(RawTransaction {
        sequence: 0,
        due_date,
        memo,
        debit_amount,
        credit_amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n[1,2]\n```"), "[1,2]");
        assert_eq!(strip_code_fences("```\n{}\n```  "), "{}");
        assert_eq!(strip_code_fences("  [] "), "[]");
    }

    #[test]
    fn test_decode_variants() {
        assert_eq!(
            ExtractionResponse::decode("[{\"a\":1}]", false),
            ExtractionResponse::Array(vec![json!({"a": 1})])
        );
        assert_eq!(
            ExtractionResponse::decode("{\"transactions\": [{\"a\":1}]}", false),
            ExtractionResponse::WrappedObject(vec![json!({"a": 1})])
        );
        assert_eq!(
            ExtractionResponse::decode("Here you go:\n```json\n[]\n```", false),
            ExtractionResponse::Array(vec![])
        );
        assert!(ExtractionResponse::decode("no json at all", false).is_invalid());
        assert!(ExtractionResponse::decode("{\"count\": 3}", false).is_invalid());
    }

    #[test]
    fn test_truncated_array_keeps_complete_objects() {
        let cut = r#"[{"sequence":1,"memo":"A"},{"sequence":2,"memo":"B"},{"sequence":3,"me"#;
        let decoded = ExtractionResponse::decode(cut, true);
        match decoded {
            ExtractionResponse::Truncated(rows) => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[1]["memo"], "B");
            }
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_inside_nested_object() {
        // The last '}' closes a nested object, so the repair must step back further
        let cut = r#"[{"a":1,"m":{"x":1}},{"a":2,"m":{"x":2}"#;
        let rows = repair_truncated_array(cut).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["a"], 1);
    }

    #[test]
    fn test_truncated_wrapped_object() {
        let cut = r#"{"transactions":[{"a":1},{"a":2},{"a""#;
        let rows = repair_truncated_array(cut).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_unrepairable_is_invalid() {
        assert!(ExtractionResponse::decode("[{\"a\":", true).is_invalid());
    }

    #[test]
    fn test_parse_layout_response() {
        let guess = parse_layout_response(
            "```json\n{\"bank_name_guess\":\"BBVA\",\"header_lines_count\":\"4\",\"column_description\":\"date, memo\"}\n```",
        );
        assert_eq!(guess.bank_name_guess.as_deref(), Some("BBVA"));
        assert_eq!(guess.header_lines_count, 4);
        assert_eq!(guess.column_description.as_deref(), Some("date, memo"));

        assert_eq!(parse_layout_response("garbage"), LayoutGuess::default());
        assert_eq!(
            parse_layout_response("{\"bank_name_guess\": null}"),
            LayoutGuess::default()
        );
    }

    #[test]
    fn test_parse_classification_aliases_and_defaults() {
        let parsed = parse_classification_response(
            r#"[{"seq":"2","sap":"600-10"},{"sequence":1,"sap_code":null,"confidence":0},{"sap_code":"x"}]"#,
        )
        .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].sequence, 2);
        assert_eq!(parsed[0].sap_code.as_deref(), Some("600-10"));
        assert_eq!(parsed[0].confidence, DEFAULT_AI_CONFIDENCE);
        assert_eq!(parsed[1].sap_code, None);
        assert_eq!(parsed[1].confidence, 0);
    }

    #[test]
    fn test_parse_classification_rejects_prose() {
        assert!(matches!(
            parse_classification_response("I cannot help with that"),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn test_parse_amount_formats() {
        assert_eq!(parse_amount(&json!(1234.5)), Some(Decimal::new(12345, 1)));
        assert_eq!(parse_amount(&json!("1,234.50")), Some(Decimal::new(123450, 2)));
        assert_eq!(parse_amount(&json!(" $ 10 ")), Some(Decimal::from(10)));
        assert_eq!(parse_amount(&json!("(5.00)")), Some(Decimal::new(-500, 2)));
        assert_eq!(parse_amount(&json!("-")), None);
        assert_eq!(parse_amount(&json!("")), None);
        assert_eq!(parse_amount(&Value::Null), None);
    }

    #[test]
    fn test_extracted_row_normalization() {
        let row = parse_extracted_row(&json!({
            "sequence": 9, "due_date": "2025-03-01", "memo": "  PAGO   TPV ",
            "debit_amount": "-150.00", "credit_amount": null
        }))
        .unwrap();
        assert_eq!(row.memo, "PAGO TPV");
        assert_eq!(row.debit_amount, None);
        assert_eq!(row.credit_amount, Some(Decimal::new(15000, 2)));
        assert_eq!(row.sequence, 0);

        let quoted = parse_extracted_row(&json!({
            "due_date": "'31122025'", "memo": "X", "credit_amount": 1
        }))
        .unwrap();
        assert_eq!(quoted.due_date, NaiveDate::from_ymd_opt(2025, 12, 31).unwrap());

        let netted = parse_extracted_row(&json!({
            "due_date": "01/03/2025", "memo": "X", "debit_amount": 100, "credit_amount": 30
        }))
        .unwrap();
        assert_eq!(netted.debit_amount, Some(Decimal::from(70)));
        assert_eq!(netted.credit_amount, None);
    }

    #[test]
    fn test_extracted_row_drops() {
        assert!(parse_extracted_row(&json!({"due_date": "2025-03-01", "memo": "X"})).is_none());
        assert!(parse_extracted_row(
            &json!({"due_date": "not a date", "memo": "X", "debit_amount": 1})
        )
        .is_none());
        assert!(parse_extracted_row(
            &json!({"due_date": "2025-03-01", "memo": " ", "debit_amount": 1})
        )
        .is_none());
    }
}
