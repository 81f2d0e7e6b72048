//! In-memory ledger for tests
//!
//! Documents get increasing numbers starting at 1000. Failures are
//! injected by memo or for login, and every call is recorded.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::ChartAccount;

use super::{BankPage, JournalEntry, LedgerBackend, LedgerSession, VendorPayment};

/// A document the mock ledger accepted
#[derive(Debug, Clone, PartialEq)]
pub enum PostedDocument {
    JournalEntry { number: i64, entry: JournalEntry },
    BankPage { number: i64, page: BankPage },
    VendorPayment { number: i64, payment: VendorPayment },
}

impl PostedDocument {
    pub fn memo(&self) -> &str {
        match self {
            Self::JournalEntry { entry, .. } => &entry.memo,
            Self::BankPage { page, .. } => &page.memo,
            Self::VendorPayment { payment, .. } => &payment.card_code,
        }
    }
}

#[derive(Default)]
struct MockLedgerState {
    chart: Vec<ChartAccount>,
    login_error: Option<String>,
    failing_memos: HashSet<String>,
    next_number: i64,
    next_session: u64,
    open_sessions: HashSet<String>,
    logins: usize,
    posted: Vec<PostedDocument>,
    rejected: usize,
}

#[derive(Clone, Default)]
pub struct MockLedger {
    state: Arc<Mutex<MockLedgerState>>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chart(self, chart: Vec<ChartAccount>) -> Self {
        self.state().chart = chart;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockLedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every login fail with `message`
    pub fn fail_login(&self, message: impl Into<String>) {
        self.state().login_error = Some(message.into());
    }

    /// Reject any document whose memo equals `memo`
    pub fn fail_memo(&self, memo: impl Into<String>) {
        self.state().failing_memos.insert(memo.into());
    }

    /// Accept everything from now on
    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.login_error = None;
        state.failing_memos.clear();
    }

    /// Documents accepted so far, in order
    pub fn posted(&self) -> Vec<PostedDocument> {
        self.state().posted.clone()
    }

    pub fn posted_memos(&self) -> Vec<String> {
        self.state().posted.iter().map(|d| d.memo().to_string()).collect()
    }

    pub fn rejected(&self) -> usize {
        self.state().rejected
    }

    pub fn logins(&self) -> usize {
        self.state().logins
    }

    pub fn open_sessions(&self) -> usize {
        self.state().open_sessions.len()
    }

    fn check_session(state: &MockLedgerState, session: &LedgerSession) -> Result<()> {
        if state.open_sessions.contains(&session.session_id) {
            Ok(())
        } else {
            Err(Error::Ledger("Invalid session".into()))
        }
    }

    fn accept(&self, session: &LedgerSession, memo: &str, build: impl FnOnce(i64) -> PostedDocument) -> Result<i64> {
        let mut state = self.state();
        Self::check_session(&state, session)?;
        if state.failing_memos.contains(memo) {
            state.rejected += 1;
            return Err(Error::Ledger(format!("Document rejected: {}", memo)));
        }
        let number = 1000 + state.next_number;
        state.next_number += 1;
        state.posted.push(build(number));
        Ok(number)
    }
}

#[async_trait]
impl LedgerBackend for MockLedger {
    async fn login(&self, company_db: &str) -> Result<LedgerSession> {
        let mut state = self.state();
        state.logins += 1;
        if let Some(message) = &state.login_error {
            return Err(Error::Session(message.clone()));
        }
        state.next_session += 1;
        let session_id = format!("mock-session-{}", state.next_session);
        state.open_sessions.insert(session_id.clone());
        Ok(LedgerSession {
            company_db: company_db.to_string(),
            session_id,
        })
    }

    async fn logout(&self, session: &LedgerSession) -> Result<()> {
        self.state().open_sessions.remove(&session.session_id);
        Ok(())
    }

    async fn create_journal_entry(&self, session: &LedgerSession, entry: &JournalEntry) -> Result<i64> {
        self.accept(session, &entry.memo, |number| PostedDocument::JournalEntry {
            number,
            entry: entry.clone(),
        })
    }

    async fn create_bank_page(&self, session: &LedgerSession, page: &BankPage) -> Result<i64> {
        self.accept(session, &page.memo, |number| PostedDocument::BankPage {
            number,
            page: page.clone(),
        })
    }

    async fn create_vendor_payment(
        &self,
        session: &LedgerSession,
        payment: &VendorPayment,
    ) -> Result<i64> {
        self.accept(session, &payment.card_code, |number| PostedDocument::VendorPayment {
            number,
            payment: payment.clone(),
        })
    }

    async fn chart_of_accounts(&self, session: &LedgerSession) -> Result<Vec<ChartAccount>> {
        let state = self.state();
        Self::check_session(&state, session)?;
        Ok(state.chart.clone())
    }
}
