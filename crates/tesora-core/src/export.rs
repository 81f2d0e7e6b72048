//! Export of classified statements for offline review
//!
//! Supports:
//! - CSV of classified rows (one line per transaction)
//! - CSV of a committed batch with its posting results

use std::str::FromStr;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::{BatchDetail, ClassifiedTransaction};

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Table,
    Json,
    Csv,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(Error::InvalidInput(format!("Unknown export format: {}", other))),
        }
    }
}

#[derive(Serialize)]
struct ClassifiedRecord<'a> {
    sequence: u32,
    due_date: String,
    movement: &'static str,
    memo: &'a str,
    debit: String,
    credit: String,
    account_code: &'a str,
    account_name: &'a str,
    confidence: u8,
    source: &'static str,
}

#[derive(Serialize)]
struct BatchLineRecord<'a> {
    statement_number: &'a str,
    sequence: u32,
    due_date: String,
    memo: &'a str,
    debit: String,
    credit: String,
    account_code: &'a str,
    external_ref: String,
    error: &'a str,
}

fn amount(value: Option<rust_decimal::Decimal>) -> String {
    value.map(|v| format!("{:.2}", v)).unwrap_or_default()
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<String> {
    let bytes = writer
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))?;
    String::from_utf8(bytes).map_err(|e| Error::InvalidData(e.to_string()))
}

/// Classified rows as CSV with a header line
pub fn classified_to_csv(rows: &[ClassifiedTransaction]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        let tx = &row.transaction;
        writer.serialize(ClassifiedRecord {
            sequence: tx.sequence,
            due_date: tx.due_date.format("%Y-%m-%d").to_string(),
            movement: tx.movement_type().as_str(),
            memo: &tx.memo,
            debit: amount(tx.debit_amount),
            credit: amount(tx.credit_amount),
            account_code: row.sap_account_code.as_deref().unwrap_or(""),
            account_name: row.sap_account_name.as_deref().unwrap_or(""),
            confidence: row.confidence,
            source: row.source.as_str(),
        })?;
    }
    finish(writer)
}

/// A committed batch as CSV, one line per batch line
pub fn batch_to_csv(detail: &BatchDetail) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for line in &detail.lines {
        writer.serialize(BatchLineRecord {
            statement_number: &detail.batch.statement_number,
            sequence: line.sequence,
            due_date: line.due_date.format("%Y-%m-%d").to_string(),
            memo: &line.memo,
            debit: amount(line.debit_amount),
            credit: amount(line.credit_amount),
            account_code: &line.sap_account_code,
            external_ref: line.external_ref.map(|r| r.to_string()).unwrap_or_default(),
            error: line.error.as_deref().unwrap_or(""),
        })?;
    }
    finish(writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClassificationSource, RawTransaction};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn row(sequence: u32, memo: &str, debit: Option<&str>, credit: Option<&str>) -> ClassifiedTransaction {
        ClassifiedTransaction::unclassified(RawTransaction {
            sequence,
            due_date: NaiveDate::from_ymd_opt(2025, 2, 14).unwrap(),
            memo: memo.to_string(),
            debit_amount: debit.map(|d| d.parse::<Decimal>().unwrap()),
            credit_amount: credit.map(|c| c.parse::<Decimal>().unwrap()),
        })
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("xml".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn test_classified_csv_quotes_memos() {
        let mut first = row(1, "COMISION, MANEJO \"CTA\"", Some("35.5"), None);
        first.sap_account_code = Some("600-10".into());
        first.sap_account_name = Some("Comisiones bancarias".into());
        first.confidence = 100;
        first.source = ClassificationSource::Manual;
        let second = row(2, "SPEI RECIBIDO", None, Some("1200"));

        let csv = classified_to_csv(&[first, second]).unwrap();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(
            lines[0],
            "sequence,due_date,movement,memo,debit,credit,account_code,account_name,confidence,source"
        );
        assert_eq!(
            lines[1],
            "1,2025-02-14,CARGO,\"COMISION, MANEJO \"\"CTA\"\"\",35.50,,600-10,Comisiones bancarias,100,manual"
        );
        assert_eq!(lines[2], "2,2025-02-14,ABONO,SPEI RECIBIDO,,1200.00,,,0,none");
    }

    #[test]
    fn test_empty_export_is_empty() {
        assert_eq!(classified_to_csv(&[]).unwrap(), "");
    }
}
