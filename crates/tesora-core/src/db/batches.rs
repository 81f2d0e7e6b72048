//! Batch, batch line, and posting result operations

use chrono::Datelike;
use rust_decimal::Decimal;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

use super::{decimal_to_sql, parse_date, parse_datetime, parse_decimal, Database};
use crate::error::Result;
use crate::models::{
    Batch, BatchDetail, BatchLine, BatchStatus, NewBatch, PostingMode, PostingTarget,
};

const BATCH_COLUMNS: &str = "id, statement_number, filename, company_db, bank_account_code, \
     cost_center, bpl_id, posting_mode, total_records, total_debit, total_credit, status, \
     error_message, created_at, updated_at";

const LINE_COLUMNS: &str = "id, batch_id, sequence, due_date, memo, debit_amount, credit_amount, \
     sap_account_code, sap_account_name, ai_suggested_account, external_ref, error, posted_at";

fn row_to_batch(row: &Row<'_>) -> rusqlite::Result<Batch> {
    let mode: String = row.get(7)?;
    let total_debit: Option<String> = row.get(9)?;
    let total_credit: Option<String> = row.get(10)?;
    let status: String = row.get(11)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;

    Ok(Batch {
        id: row.get(0)?,
        statement_number: row.get(1)?,
        filename: row.get(2)?,
        target: PostingTarget {
            company_db: row.get(3)?,
            bank_account_code: row.get(4)?,
            cost_center: row.get(5)?,
            bpl_id: row.get(6)?,
            mode: mode.parse().unwrap_or(PostingMode::JournalEntry),
        },
        total_records: row.get(8)?,
        total_debit: parse_decimal(total_debit).unwrap_or_default(),
        total_credit: parse_decimal(total_credit).unwrap_or_default(),
        status: status.parse().unwrap_or(BatchStatus::Pending),
        error_message: row.get(12)?,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

fn row_to_line(row: &Row<'_>) -> rusqlite::Result<BatchLine> {
    let due_date: String = row.get(3)?;
    let posted_at: Option<String> = row.get(12)?;

    Ok(BatchLine {
        id: row.get(0)?,
        batch_id: row.get(1)?,
        sequence: row.get(2)?,
        due_date: parse_date(&due_date),
        memo: row.get(4)?,
        debit_amount: parse_decimal(row.get(5)?),
        credit_amount: parse_decimal(row.get(6)?),
        sap_account_code: row.get(7)?,
        sap_account_name: row.get(8)?,
        ai_suggested_account: row.get(9)?,
        external_ref: row.get(10)?,
        error: row.get(11)?,
        posted_at: posted_at.as_deref().map(parse_datetime),
    })
}

impl Database {
    /// Insert a batch and all its lines in one transaction
    ///
    /// The statement number is derived from the earliest line date as
    /// `YYYY-MM-NNN`, numbering batches within that month.
    pub fn create_batch(
        &self,
        batch: &NewBatch,
        total_debit: Decimal,
        total_credit: Decimal,
    ) -> Result<i64> {
        let mut conn = self.conn()?;
        // Take the write lock before counting so concurrent commits number in turn
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let period = batch
            .lines
            .iter()
            .map(|l| l.due_date)
            .min()
            .map(|d| format!("{:04}-{:02}", d.year(), d.month()))
            .unwrap_or_else(|| chrono::Utc::now().format("%Y-%m").to_string());

        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM batches WHERE statement_number LIKE ?",
            params![format!("{}-%", period)],
            |row| row.get(0),
        )?;
        let statement_number = format!("{}-{:03}", period, existing + 1);

        tx.execute(
            r#"
            INSERT INTO batches
                (statement_number, filename, company_db, bank_account_code, cost_center, bpl_id,
                 posting_mode, total_records, total_debit, total_credit, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                statement_number,
                batch.filename,
                batch.target.company_db,
                batch.target.bank_account_code,
                batch.target.cost_center,
                batch.target.bpl_id,
                batch.target.mode.as_str(),
                batch.lines.len() as i64,
                total_debit.to_string(),
                total_credit.to_string(),
                BatchStatus::Pending.as_str(),
            ],
        )?;
        let batch_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO batch_lines
                    (batch_id, sequence, due_date, memo, debit_amount, credit_amount,
                     sap_account_code, sap_account_name, ai_suggested_account)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )?;
            for line in &batch.lines {
                stmt.execute(params![
                    batch_id,
                    line.sequence,
                    line.due_date.format("%Y-%m-%d").to_string(),
                    line.memo,
                    decimal_to_sql(line.debit_amount),
                    decimal_to_sql(line.credit_amount),
                    line.sap_account_code,
                    line.sap_account_name,
                    line.ai_suggested_account,
                ])?;
            }
        }

        tx.commit()?;
        Ok(batch_id)
    }

    pub fn get_batch(&self, id: i64) -> Result<Option<Batch>> {
        let conn = self.conn()?;
        let batch = conn
            .query_row(
                &format!("SELECT {} FROM batches WHERE id = ?", BATCH_COLUMNS),
                params![id],
                row_to_batch,
            )
            .optional()?;
        Ok(batch)
    }

    pub fn get_batch_detail(&self, id: i64) -> Result<Option<BatchDetail>> {
        let Some(batch) = self.get_batch(id)? else {
            return Ok(None);
        };
        let lines = self.batch_lines(id)?;
        Ok(Some(BatchDetail { batch, lines }))
    }

    /// Newest first
    pub fn list_batches(&self) -> Result<Vec<Batch>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM batches ORDER BY id DESC",
            BATCH_COLUMNS
        ))?;
        let batches = stmt
            .query_map([], row_to_batch)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(batches)
    }

    /// Lines in sequence order
    pub fn batch_lines(&self, batch_id: i64) -> Result<Vec<BatchLine>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM batch_lines WHERE batch_id = ? ORDER BY sequence ASC",
            LINE_COLUMNS
        ))?;
        let lines = stmt
            .query_map(params![batch_id], row_to_line)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(lines)
    }

    /// Lines that have no ledger document yet
    pub fn unposted_lines(&self, batch_id: i64) -> Result<Vec<BatchLine>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM batch_lines WHERE batch_id = ? AND external_ref IS NULL \
             ORDER BY sequence ASC",
            LINE_COLUMNS
        ))?;
        let lines = stmt
            .query_map(params![batch_id], row_to_line)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(lines)
    }

    pub fn count_unposted_lines(&self, batch_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM batch_lines WHERE batch_id = ? AND external_ref IS NULL",
            params![batch_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Atomically move a batch to `to` if its status is one of `from`
    ///
    /// Returns false when the batch was not in an allowed state.
    pub fn transition_batch(&self, id: i64, from: &[BatchStatus], to: BatchStatus) -> Result<bool> {
        let conn = self.conn()?;
        let allowed = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let changed = conn.execute(
            &format!(
                "UPDATE batches SET status = ?, updated_at = CURRENT_TIMESTAMP \
                 WHERE id = ? AND status IN ({})",
                allowed
            ),
            params![to.as_str(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn finish_batch(
        &self,
        id: i64,
        status: BatchStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE batches
            SET status = ?, error_message = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
            params![status.as_str(), error_message, id],
        )?;
        Ok(())
    }

    /// Fail batches left in `processing` by an interrupted run
    ///
    /// Their unposted lines stay unposted, so a reprocess picks them up.
    pub fn recover_stuck_batches(&self) -> Result<usize> {
        let conn = self.conn()?;
        let recovered = conn.execute(
            r#"
            UPDATE batches
            SET status = 'failed', error_message = 'Posting interrupted before completion',
                updated_at = CURRENT_TIMESTAMP
            WHERE status = 'processing'
            "#,
            [],
        )?;
        Ok(recovered)
    }

    /// Record a successful post; clears any earlier error
    pub fn mark_line_posted(&self, line_id: i64, external_ref: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE batch_lines
            SET external_ref = ?, error = NULL, posted_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
            params![external_ref, line_id],
        )?;
        Ok(())
    }

    pub fn mark_line_failed(&self, line_id: i64, error: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE batch_lines SET error = ? WHERE id = ?",
            params![error, line_id],
        )?;
        Ok(())
    }

    pub fn record_posting_attempt(
        &self,
        batch_id: i64,
        line_id: i64,
        external_ref: Option<i64>,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO posting_attempts (batch_id, line_id, success, external_ref, error)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![batch_id, line_id, external_ref.is_some(), external_ref, error],
        )?;
        Ok(())
    }

    /// Number of post attempts recorded for a line
    pub fn count_posting_attempts(&self, line_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM posting_attempts WHERE line_id = ?",
            params![line_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
