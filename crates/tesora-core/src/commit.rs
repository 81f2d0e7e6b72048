//! Batch commit: validate reviewed rows and persist them as a pending batch

use std::collections::HashSet;

use rust_decimal::Decimal;
use tracing::info;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{BatchDetail, BatchLineInput, BatchSummary, NewBatch};

/// Validate and store a batch with status `pending`
///
/// Nothing is written unless every line passes validation.
pub fn commit_batch(db: &Database, batch: &NewBatch) -> Result<BatchDetail> {
    validate(batch)?;

    let (total_debit, total_credit) = batch.lines.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(debit, credit), line| {
            (
                debit + line.debit_amount.unwrap_or_default(),
                credit + line.credit_amount.unwrap_or_default(),
            )
        },
    );

    let id = db.create_batch(batch, total_debit, total_credit)?;
    let detail = db
        .get_batch_detail(id)?
        .ok_or_else(|| Error::NotFound(format!("Batch {} not found", id)))?;

    info!(
        batch_id = id,
        statement = %detail.batch.statement_number,
        lines = detail.lines.len(),
        %total_debit,
        %total_credit,
        "Committed batch"
    );
    Ok(detail)
}

fn validate(batch: &NewBatch) -> Result<()> {
    if batch.target.company_db.trim().is_empty() {
        return Err(Error::InvalidInput("Company database is required".into()));
    }
    if batch.target.bank_account_code.trim().is_empty() {
        return Err(Error::InvalidInput("Bank account code is required".into()));
    }
    if batch.lines.is_empty() {
        return Err(Error::InvalidInput("A batch needs at least one line".into()));
    }

    let mut seen = HashSet::new();
    for line in &batch.lines {
        if !seen.insert(line.sequence) {
            return Err(Error::InvalidInput(format!(
                "Duplicate sequence {}",
                line.sequence
            )));
        }
        validate_line(line)?;
    }
    Ok(())
}

fn validate_line(line: &BatchLineInput) -> Result<()> {
    let has_account = line
        .sap_account_code
        .as_deref()
        .is_some_and(|code| !code.trim().is_empty());
    if !has_account {
        return Err(Error::InvalidInput(format!(
            "Line {} has no ledger account",
            line.sequence
        )));
    }

    let debit = line.debit_amount.unwrap_or_default();
    let credit = line.credit_amount.unwrap_or_default();
    if debit < Decimal::ZERO || credit < Decimal::ZERO {
        return Err(Error::InvalidInput(format!(
            "Line {} has a negative amount",
            line.sequence
        )));
    }
    if (debit > Decimal::ZERO) == (credit > Decimal::ZERO) {
        return Err(Error::InvalidInput(format!(
            "Line {} must have exactly one of debit or credit",
            line.sequence
        )));
    }
    Ok(())
}

/// Batch header with how many lines are posted, pending and failing
pub fn batch_summary(db: &Database, batch_id: i64) -> Result<BatchSummary> {
    let detail = db
        .get_batch_detail(batch_id)?
        .ok_or_else(|| Error::NotFound(format!("Batch {} not found", batch_id)))?;

    let posted_lines = detail.lines.iter().filter(|l| l.is_posted()).count();
    let failed_lines = detail
        .lines
        .iter()
        .filter(|l| !l.is_posted() && l.error.is_some())
        .count();

    Ok(BatchSummary {
        posted_lines,
        unposted_lines: detail.lines.len() - posted_lines,
        failed_lines,
        batch: detail.batch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BatchStatus, PostingMode, PostingTarget};
    use chrono::NaiveDate;

    fn line(sequence: u32, date: (i32, u32, u32), debit: Option<i64>, credit: Option<i64>) -> BatchLineInput {
        BatchLineInput {
            sequence,
            due_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            memo: format!("MOVIMIENTO {}", sequence),
            debit_amount: debit.map(Decimal::from),
            credit_amount: credit.map(Decimal::from),
            sap_account_code: Some("600-10".into()),
            sap_account_name: Some("Gastos bancarios".into()),
            ai_suggested_account: None,
        }
    }

    fn batch(lines: Vec<BatchLineInput>) -> NewBatch {
        NewBatch {
            filename: "estado.xlsx".into(),
            target: PostingTarget {
                company_db: "SBO_DEMO".into(),
                bank_account_code: "102-01".into(),
                cost_center: Some("ADM".into()),
                bpl_id: Some(1),
                mode: PostingMode::JournalEntry,
            },
            lines,
        }
    }

    #[test]
    fn test_commit_computes_totals() {
        let db = Database::in_memory().unwrap();
        let detail = commit_batch(
            &db,
            &batch(vec![
                line(1, (2025, 3, 4), Some(150), None),
                line(2, (2025, 3, 5), None, Some(1000)),
                line(3, (2025, 3, 6), Some(50), None),
            ]),
        )
        .unwrap();

        assert_eq!(detail.batch.status, BatchStatus::Pending);
        assert_eq!(detail.batch.total_records, 3);
        assert_eq!(detail.batch.total_debit, Decimal::from(200));
        assert_eq!(detail.batch.total_credit, Decimal::from(1000));
        assert_eq!(detail.batch.target.cost_center.as_deref(), Some("ADM"));
        assert_eq!(detail.lines.len(), 3);
        assert!(detail.lines.iter().all(|l| !l.is_posted()));
    }

    #[test]
    fn test_statement_numbers_count_per_month() {
        let db = Database::in_memory().unwrap();
        let first = commit_batch(&db, &batch(vec![line(1, (2025, 3, 9), Some(1), None)])).unwrap();
        let second = commit_batch(
            &db,
            &batch(vec![
                line(1, (2025, 3, 20), Some(1), None),
                line(2, (2025, 3, 2), Some(1), None),
            ]),
        )
        .unwrap();
        let april = commit_batch(&db, &batch(vec![line(1, (2025, 4, 1), Some(1), None)])).unwrap();

        assert_eq!(first.batch.statement_number, "2025-03-001");
        assert_eq!(second.batch.statement_number, "2025-03-002");
        assert_eq!(april.batch.statement_number, "2025-04-001");
    }

    #[test]
    fn test_missing_account_names_sequence() {
        let db = Database::in_memory().unwrap();
        let mut bad = line(7, (2025, 3, 1), Some(10), None);
        bad.sap_account_code = None;

        let err = commit_batch(&db, &batch(vec![line(1, (2025, 3, 1), Some(5), None), bad]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(ref m) if m.contains('7')));
        assert!(db.list_batches().unwrap().is_empty());
    }

    #[test]
    fn test_amount_validation() {
        let db = Database::in_memory().unwrap();
        for bad in [
            line(1, (2025, 3, 1), Some(-5), None),
            line(1, (2025, 3, 1), Some(5), Some(5)),
            line(1, (2025, 3, 1), None, None),
            line(1, (2025, 3, 1), Some(0), Some(0)),
        ] {
            assert!(commit_batch(&db, &batch(vec![bad])).unwrap_err().is_input_error());
        }
    }

    #[test]
    fn test_rejects_empty_and_duplicate_lines() {
        let db = Database::in_memory().unwrap();
        assert!(commit_batch(&db, &batch(vec![])).is_err());

        let dup = batch(vec![
            line(1, (2025, 3, 1), Some(5), None),
            line(1, (2025, 3, 2), Some(6), None),
        ]);
        assert!(matches!(commit_batch(&db, &dup), Err(Error::InvalidInput(_))));

        let mut no_target = batch(vec![line(1, (2025, 3, 1), Some(5), None)]);
        no_target.target.bank_account_code = " ".into();
        assert!(matches!(commit_batch(&db, &no_target), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_batch_summary_counts() {
        let db = Database::in_memory().unwrap();
        let detail = commit_batch(
            &db,
            &batch(vec![
                line(1, (2025, 3, 1), Some(5), None),
                line(2, (2025, 3, 1), Some(6), None),
                line(3, (2025, 3, 1), Some(7), None),
            ]),
        )
        .unwrap();
        db.mark_line_posted(detail.lines[0].id, 501).unwrap();
        db.mark_line_failed(detail.lines[1].id, "Cuenta bloqueada").unwrap();

        let summary = batch_summary(&db, detail.batch.id).unwrap();
        assert_eq!(summary.posted_lines, 1);
        assert_eq!(summary.unposted_lines, 2);
        assert_eq!(summary.failed_lines, 1);

        assert!(matches!(batch_summary(&db, 42), Err(Error::NotFound(_))));
    }
}
