//! Ledger posting with row-level idempotency
//!
//! A batch moves `pending -> processing -> completed | failed`. Every post
//! runs inside one ledger session and only touches lines that have no
//! external reference yet. Each row's result is stored as soon as the
//! ledger answers, so a reprocess after a partial failure or an
//! interrupted run never sends a row twice.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::ledger::{BankPage, JournalEntry, LedgerBackend, LedgerSession};
use crate::models::{Batch, BatchLine, BatchStatus, PostingMode, PostingOutcome};

/// Posts committed batches to the external ledger
#[derive(Clone)]
pub struct LedgerPoster {
    db: Database,
    ledger: Arc<dyn LedgerBackend>,
}

impl LedgerPoster {
    pub fn new(db: Database, ledger: Arc<dyn LedgerBackend>) -> Self {
        Self { db, ledger }
    }

    /// Post a `pending` or `failed` batch
    pub async fn post(&self, batch_id: i64) -> Result<PostingOutcome> {
        self.start(batch_id, &[BatchStatus::Pending, BatchStatus::Failed])
            .await
    }

    /// Re-send the unposted lines of a `failed` batch
    pub async fn reprocess(&self, batch_id: i64) -> Result<PostingOutcome> {
        self.start(batch_id, &[BatchStatus::Failed]).await
    }

    async fn start(&self, batch_id: i64, allowed: &[BatchStatus]) -> Result<PostingOutcome> {
        let batch = self
            .db
            .get_batch(batch_id)?
            .ok_or_else(|| Error::NotFound(format!("Batch {} not found", batch_id)))?;

        if !self
            .db
            .transition_batch(batch_id, allowed, BatchStatus::Processing)?
        {
            return Err(Error::InvalidState(format!(
                "Batch {} is {} and cannot be posted",
                batch.statement_number, batch.status
            )));
        }

        match self.run(&batch).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Never leave a batch stuck in processing
                let message = e.to_string();
                if let Err(finish_err) =
                    self.db
                        .finish_batch(batch_id, BatchStatus::Failed, Some(&message))
                {
                    warn!(batch_id, error = %finish_err, "Could not mark batch as failed");
                }
                Err(e)
            }
        }
    }

    async fn run(&self, batch: &Batch) -> Result<PostingOutcome> {
        let session = match self.ledger.login(&batch.target.company_db).await {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    batch_id = batch.id,
                    company_db = %batch.target.company_db,
                    error = %e,
                    "Ledger login failed, batch not posted"
                );
                return Err(e);
            }
        };
        let guard = SessionGuard::new(Arc::clone(&self.ledger), session.clone());

        let lines = match self.db.unposted_lines(batch.id) {
            Ok(lines) => lines,
            Err(e) => {
                guard.release(batch.id).await;
                return Err(e);
            }
        };
        info!(
            batch_id = batch.id,
            statement = %batch.statement_number,
            lines = lines.len(),
            mode = batch.target.mode.as_str(),
            "Posting batch"
        );

        let counts = self.post_lines(&session, batch, &lines).await;
        guard.release(batch.id).await;
        let (posted, failed) = counts?;

        let remaining = self.db.count_unposted_lines(batch.id)?;
        let (status, error_message) = if remaining == 0 {
            (BatchStatus::Completed, None)
        } else {
            (
                BatchStatus::Failed,
                Some(format!(
                    "{} of {} rows failed to post",
                    remaining, batch.total_records
                )),
            )
        };
        self.db
            .finish_batch(batch.id, status, error_message.as_deref())?;

        info!(
            batch_id = batch.id,
            posted,
            failed,
            status = status.as_str(),
            "Posting finished"
        );

        Ok(PostingOutcome {
            batch_id: batch.id,
            status,
            attempted: lines.len(),
            posted,
            failed,
            error_message,
        })
    }

    /// Send each line and store its result before the next one goes out
    ///
    /// Returns the posted and failed counts. A storage error stops the run
    /// so no row is sent without its result being kept.
    async fn post_lines(
        &self,
        session: &LedgerSession,
        batch: &Batch,
        lines: &[BatchLine],
    ) -> Result<(usize, usize)> {
        let mut posted = 0;
        let mut failed = 0;

        for line in lines {
            let result = match batch.target.mode {
                PostingMode::JournalEntry => {
                    let entry = JournalEntry::for_line(line, &batch.target);
                    self.ledger.create_journal_entry(session, &entry).await
                }
                PostingMode::BankPages => {
                    let page = BankPage::for_line(line, &batch.target);
                    self.ledger.create_bank_page(session, &page).await
                }
            };

            match result {
                Ok(external_ref) => {
                    self.db.mark_line_posted(line.id, external_ref)?;
                    self.db
                        .record_posting_attempt(batch.id, line.id, Some(external_ref), None)?;
                    debug!(batch_id = batch.id, sequence = line.sequence, external_ref, "Line posted");
                    posted += 1;
                }
                Err(e) => {
                    let error = e.to_string();
                    self.db.mark_line_failed(line.id, &error)?;
                    self.db
                        .record_posting_attempt(batch.id, line.id, None, Some(&error))?;
                    warn!(batch_id = batch.id, sequence = line.sequence, error, "Line rejected by ledger");
                    failed += 1;
                }
            }
        }

        Ok((posted, failed))
    }
}

/// Open ledger session that is logged out even if the post is dropped
///
/// `release` logs out in place. A guard dropped without it (the posting
/// future was cancelled) hands the logout to the runtime.
struct SessionGuard {
    ledger: Arc<dyn LedgerBackend>,
    session: Option<LedgerSession>,
}

impl SessionGuard {
    fn new(ledger: Arc<dyn LedgerBackend>, session: LedgerSession) -> Self {
        Self {
            ledger,
            session: Some(session),
        }
    }

    async fn release(mut self, batch_id: i64) {
        if let Some(session) = self.session.take() {
            if let Err(e) = self.ledger.logout(&session).await {
                warn!(batch_id, error = %e, "Ledger logout failed");
            }
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let ledger = Arc::clone(&self.ledger);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(company_db = %session.company_db, "Posting interrupted, logging out of ledger");
                handle.spawn(async move {
                    if let Err(e) = ledger.logout(&session).await {
                        warn!(error = %e, "Ledger logout failed");
                    }
                });
            }
            Err(_) => warn!(
                company_db = %session.company_db,
                "Posting interrupted outside a runtime, ledger session left open"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::commit_batch;
    use crate::ledger::{MockLedger, PostedDocument};
    use crate::models::{BatchLineInput, NewBatch, PostingTarget};
    use crate::ledger::VendorPayment;
    use crate::models::ChartAccount;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn line(sequence: u32, memo: &str) -> BatchLineInput {
        BatchLineInput {
            sequence,
            due_date: NaiveDate::from_ymd_opt(2025, 3, sequence).unwrap(),
            memo: memo.to_string(),
            debit_amount: Some(Decimal::from(100 + sequence as i64)),
            credit_amount: None,
            sap_account_code: Some("600-10".into()),
            sap_account_name: None,
            ai_suggested_account: None,
        }
    }

    fn setup(mode: PostingMode, memos: &[&str]) -> (LedgerPoster, MockLedger, Database, i64) {
        let db = Database::in_memory().unwrap();
        let ledger = MockLedger::new();
        let batch = NewBatch {
            filename: "estado.csv".into(),
            target: PostingTarget {
                company_db: "SBO_DEMO".into(),
                bank_account_code: "102-01".into(),
                cost_center: None,
                bpl_id: None,
                mode,
            },
            lines: memos
                .iter()
                .enumerate()
                .map(|(i, m)| line(i as u32 + 1, m))
                .collect(),
        };
        let detail = commit_batch(&db, &batch).unwrap();
        let poster = LedgerPoster::new(db.clone(), Arc::new(ledger.clone()));
        (poster, ledger, db, detail.batch.id)
    }

    #[tokio::test]
    async fn test_post_all_lines() {
        let (poster, ledger, db, id) = setup(PostingMode::JournalEntry, &["A", "B", "C"]);

        let outcome = poster.post(id).await.unwrap();
        assert_eq!(outcome.status, BatchStatus::Completed);
        assert_eq!(outcome.posted, 3);
        assert_eq!(outcome.error_message, None);
        assert_eq!(ledger.posted_memos(), vec!["A", "B", "C"]);
        assert_eq!(ledger.open_sessions(), 0);

        let detail = db.get_batch_detail(id).unwrap().unwrap();
        assert!(detail.lines.iter().all(|l| l.is_posted()));
    }

    #[tokio::test]
    async fn test_completed_batch_is_terminal() {
        let (poster, _ledger, _db, id) = setup(PostingMode::JournalEntry, &["A"]);
        poster.post(id).await.unwrap();

        assert!(matches!(poster.post(id).await, Err(Error::InvalidState(_))));
        assert!(matches!(poster.reprocess(id).await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_partial_failure_then_reprocess_sends_only_unposted() {
        let (poster, ledger, db, id) = setup(PostingMode::JournalEntry, &["A", "B", "C", "D"]);
        ledger.fail_memo("B");
        ledger.fail_memo("D");

        let outcome = poster.post(id).await.unwrap();
        assert_eq!(outcome.status, BatchStatus::Failed);
        assert_eq!(outcome.posted, 2);
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.error_message.as_deref(), Some("2 of 4 rows failed to post"));

        let batch = db.get_batch(id).unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);

        ledger.clear_failures();
        let outcome = poster.reprocess(id).await.unwrap();
        assert_eq!(outcome.attempted, 2);
        assert_eq!(outcome.status, BatchStatus::Completed);

        // A and C were never sent twice
        assert_eq!(ledger.posted_memos(), vec!["A", "C", "B", "D"]);

        let lines = db.batch_lines(id).unwrap();
        assert!(lines.iter().all(|l| l.error.is_none()));
        assert_eq!(db.count_posting_attempts(lines[0].id).unwrap(), 1);
        assert_eq!(db.count_posting_attempts(lines[1].id).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reprocess_requires_failed() {
        let (poster, _ledger, _db, id) = setup(PostingMode::JournalEntry, &["A"]);
        assert!(matches!(poster.reprocess(id).await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_login_failure_fails_batch_without_posting() {
        let (poster, ledger, db, id) = setup(PostingMode::JournalEntry, &["A", "B"]);
        ledger.fail_login("Connection refused");

        let err = poster.post(id).await.unwrap_err();
        assert!(matches!(err, Error::Session(_)));

        let batch = db.get_batch(id).unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        assert!(batch.error_message.unwrap().contains("Connection refused"));
        assert!(ledger.posted().is_empty());
        assert_eq!(db.count_unposted_lines(id).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_bank_pages_mode() {
        let (poster, ledger, db, id) = setup(PostingMode::BankPages, &["A", "B"]);
        ledger.fail_memo("A");

        let outcome = poster.post(id).await.unwrap();
        assert_eq!(outcome.posted, 1);
        assert!(matches!(ledger.posted()[0], PostedDocument::BankPage { .. }));

        let lines = db.batch_lines(id).unwrap();
        assert!(lines[0].error.as_deref().unwrap().contains("rejected"));
        assert!(lines[1].external_ref.is_some());
    }

    #[tokio::test]
    async fn test_missing_batch() {
        let (poster, _ledger, _db, _id) = setup(PostingMode::JournalEntry, &["A"]);
        assert!(matches!(poster.post(999).await, Err(Error::NotFound(_))));
    }

    /// Ledger that never answers for one memo, like a connection that hangs
    struct HangingLedger {
        inner: MockLedger,
        hang_on: &'static str,
    }

    #[async_trait]
    impl LedgerBackend for HangingLedger {
        async fn login(&self, company_db: &str) -> Result<LedgerSession> {
            self.inner.login(company_db).await
        }

        async fn logout(&self, session: &LedgerSession) -> Result<()> {
            self.inner.logout(session).await
        }

        async fn create_journal_entry(
            &self,
            session: &LedgerSession,
            entry: &JournalEntry,
        ) -> Result<i64> {
            if entry.memo == self.hang_on {
                std::future::pending::<()>().await;
            }
            self.inner.create_journal_entry(session, entry).await
        }

        async fn create_bank_page(&self, session: &LedgerSession, page: &BankPage) -> Result<i64> {
            self.inner.create_bank_page(session, page).await
        }

        async fn create_vendor_payment(
            &self,
            session: &LedgerSession,
            payment: &VendorPayment,
        ) -> Result<i64> {
            self.inner.create_vendor_payment(session, payment).await
        }

        async fn chart_of_accounts(&self, session: &LedgerSession) -> Result<Vec<ChartAccount>> {
            self.inner.chart_of_accounts(session).await
        }
    }

    #[tokio::test]
    async fn test_interrupted_post_never_resends_posted_rows() {
        let (_poster, ledger, db, id) = setup(PostingMode::JournalEntry, &["A", "B"]);
        let hanging = LedgerPoster::new(
            db.clone(),
            Arc::new(HangingLedger {
                inner: ledger.clone(),
                hang_on: "B",
            }),
        );

        let interrupted = tokio::time::timeout(Duration::from_millis(200), hanging.post(id)).await;
        assert!(interrupted.is_err());

        // A's reference was stored before B went out
        assert_eq!(ledger.posted_memos(), vec!["A"]);
        let lines = db.batch_lines(id).unwrap();
        assert!(lines[0].external_ref.is_some());
        assert!(lines[1].external_ref.is_none());
        assert_eq!(db.count_unposted_lines(id).unwrap(), 1);

        // The dropped run still logs out
        for _ in 0..100 {
            if ledger.open_sessions() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(ledger.open_sessions(), 0);

        assert_eq!(db.get_batch(id).unwrap().unwrap().status, BatchStatus::Processing);
        assert_eq!(db.recover_stuck_batches().unwrap(), 1);

        let poster = LedgerPoster::new(db.clone(), Arc::new(ledger.clone()));
        let outcome = poster.reprocess(id).await.unwrap();
        assert_eq!(outcome.attempted, 1);
        assert_eq!(outcome.status, BatchStatus::Completed);
        assert_eq!(ledger.posted_memos(), vec!["A", "B"]);
    }
}
