//! External ledger abstraction
//!
//! The ledger is an ERP reached through a session-based API: log in to one
//! company database, create documents, log out. Backends:
//! - `service_layer` - SAP Business One Service Layer over HTTPS
//! - `mock` - in-memory ledger for tests

mod mock;
mod service_layer;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::models::{BatchLine, ChartAccount, PostingTarget};

pub use mock::{MockLedger, PostedDocument};
pub use service_layer::ServiceLayerClient;

/// An authenticated session scoped to one company database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSession {
    pub company_db: String,
    pub session_id: String,
}

/// Two-line journal entry moving money between the bank and a counterpart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub date: NaiveDate,
    pub memo: String,
    pub lines: Vec<JournalEntryLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntryLine {
    pub account_code: String,
    pub debit: Decimal,
    pub credit: Decimal,
    pub cost_center: Option<String>,
    /// Branch; omitted from the payload when absent or zero
    pub bpl_id: Option<i32>,
}

impl JournalEntry {
    /// Entry for one statement row
    ///
    /// The bank line mirrors the statement: money in (credit on the
    /// statement) debits the bank account. The counterpart line takes the
    /// opposite side.
    pub fn for_line(line: &BatchLine, target: &PostingTarget) -> Self {
        let debit = line.debit_amount.unwrap_or_default();
        let credit = line.credit_amount.unwrap_or_default();
        let bpl_id = target.bpl_id.filter(|id| *id != 0);

        Self {
            date: line.due_date,
            memo: line.memo.clone(),
            lines: vec![
                JournalEntryLine {
                    account_code: target.bank_account_code.clone(),
                    debit: credit,
                    credit: debit,
                    cost_center: target.cost_center.clone(),
                    bpl_id,
                },
                JournalEntryLine {
                    account_code: line.sap_account_code.clone(),
                    debit,
                    credit,
                    cost_center: target.cost_center.clone(),
                    bpl_id,
                },
            ],
        }
    }
}

/// One bank statement page row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankPage {
    pub account_code: String,
    pub due_date: NaiveDate,
    pub debit_amount: Decimal,
    pub credit_amount: Decimal,
    pub memo: String,
    /// "Egreso" for money out, "Ingreso" for money in
    pub reference: String,
}

impl BankPage {
    pub fn for_line(line: &BatchLine, target: &PostingTarget) -> Self {
        let debit = line.debit_amount.unwrap_or_default();
        Self {
            account_code: target.bank_account_code.clone(),
            due_date: line.due_date,
            debit_amount: debit,
            credit_amount: line.credit_amount.unwrap_or_default(),
            memo: line.memo.clone(),
            reference: if debit > Decimal::ZERO {
                "Egreso".to_string()
            } else {
                "Ingreso".to_string()
            },
        }
    }
}

/// Outgoing payment to a vendor, settling one or more invoices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorPayment {
    pub card_code: String,
    pub doc_date: NaiveDate,
    pub transfer_date: NaiveDate,
    pub transfer_account: String,
    pub invoices: Vec<PaymentInvoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInvoice {
    pub line_num: i32,
    pub doc_entry: i64,
    pub sum_applied: Decimal,
    pub invoice_type: String,
}

impl VendorPayment {
    pub fn transfer_sum(&self) -> Decimal {
        self.invoices.iter().map(|i| i.sum_applied).sum()
    }
}

/// Per-row result of a multi-row post
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowPostResult {
    pub index: usize,
    pub external_ref: Option<i64>,
    pub error: Option<String>,
}

/// Trait for external ledger backends
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Open a session against one company database
    async fn login(&self, company_db: &str) -> Result<LedgerSession>;

    async fn logout(&self, session: &LedgerSession) -> Result<()>;

    /// Returns the journal entry number
    async fn create_journal_entry(&self, session: &LedgerSession, entry: &JournalEntry)
        -> Result<i64>;

    /// Returns the bank page sequence
    async fn create_bank_page(&self, session: &LedgerSession, page: &BankPage) -> Result<i64>;

    /// Returns the payment document number
    async fn create_vendor_payment(
        &self,
        session: &LedgerSession,
        payment: &VendorPayment,
    ) -> Result<i64>;

    async fn chart_of_accounts(&self, session: &LedgerSession) -> Result<Vec<ChartAccount>>;

    /// Post pages one at a time; a rejected row does not stop the rest
    async fn create_bank_pages(
        &self,
        session: &LedgerSession,
        pages: &[BankPage],
    ) -> Vec<RowPostResult> {
        let mut results = Vec::with_capacity(pages.len());
        for (index, page) in pages.iter().enumerate() {
            let result = match self.create_bank_page(session, page).await {
                Ok(sequence) => RowPostResult {
                    index,
                    external_ref: Some(sequence),
                    error: None,
                },
                Err(e) => {
                    warn!(index, error = %e, "Bank page rejected");
                    RowPostResult {
                        index,
                        external_ref: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            results.push(result);
        }
        results
    }

    /// Log in, read the chart of accounts, and log out again
    async fn fetch_chart(&self, company_db: &str) -> Result<Vec<ChartAccount>> {
        let session = self.login(company_db).await?;
        let chart = self.chart_of_accounts(&session).await;
        if let Err(e) = self.logout(&session).await {
            warn!(company_db, error = %e, "Ledger logout failed");
        }
        chart
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(debit: Option<i64>, credit: Option<i64>) -> BatchLine {
        BatchLine {
            id: 1,
            batch_id: 1,
            sequence: 1,
            due_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            memo: "COMISION".into(),
            debit_amount: debit.map(Decimal::from),
            credit_amount: credit.map(Decimal::from),
            sap_account_code: "600-10".into(),
            sap_account_name: None,
            ai_suggested_account: None,
            external_ref: None,
            error: None,
            posted_at: None,
        }
    }

    fn target(bpl_id: Option<i32>) -> PostingTarget {
        PostingTarget {
            company_db: "SBO_DEMO".into(),
            bank_account_code: "102-01".into(),
            cost_center: Some("ADM".into()),
            bpl_id,
            mode: Default::default(),
        }
    }

    #[test]
    fn test_journal_entry_mirrors_bank_line() {
        let entry = JournalEntry::for_line(&line(Some(250), None), &target(Some(0)));
        assert_eq!(entry.lines[0].account_code, "102-01");
        assert_eq!(entry.lines[0].debit, Decimal::ZERO);
        assert_eq!(entry.lines[0].credit, Decimal::from(250));
        assert_eq!(entry.lines[1].account_code, "600-10");
        assert_eq!(entry.lines[1].debit, Decimal::from(250));
        assert_eq!(entry.lines[0].bpl_id, None);

        let entry = JournalEntry::for_line(&line(None, Some(90)), &target(Some(3)));
        assert_eq!(entry.lines[0].debit, Decimal::from(90));
        assert_eq!(entry.lines[1].credit, Decimal::from(90));
        assert_eq!(entry.lines[1].bpl_id, Some(3));
    }

    #[test]
    fn test_bank_page_reference() {
        assert_eq!(BankPage::for_line(&line(Some(1), None), &target(None)).reference, "Egreso");
        assert_eq!(BankPage::for_line(&line(None, Some(1)), &target(None)).reference, "Ingreso");
    }

    #[test]
    fn test_vendor_payment_sum() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let payment = VendorPayment {
            card_code: "P001".into(),
            doc_date: date,
            transfer_date: date,
            transfer_account: "102-01".into(),
            invoices: vec![
                PaymentInvoice {
                    line_num: 0,
                    doc_entry: 10,
                    sum_applied: Decimal::new(10050, 2),
                    invoice_type: "it_PurchaseInvoice".into(),
                },
                PaymentInvoice {
                    line_num: 0,
                    doc_entry: 11,
                    sum_applied: Decimal::new(4950, 2),
                    invoice_type: "it_PurchaseInvoice".into(),
                },
            ],
        };
        assert_eq!(payment.transfer_sum(), Decimal::from(150));
    }

    #[tokio::test]
    async fn test_bank_pages_isolate_row_failures() {
        let ledger = MockLedger::new();
        ledger.fail_memo("BAD");
        let session = ledger.login("SBO_DEMO").await.unwrap();

        let mut bad = line(Some(5), None);
        bad.memo = "BAD".into();
        let pages = vec![
            BankPage::for_line(&line(Some(1), None), &target(None)),
            BankPage::for_line(&bad, &target(None)),
            BankPage::for_line(&line(None, Some(2)), &target(None)),
        ];

        let results = ledger.create_bank_pages(&session, &pages).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].external_ref.is_some());
        assert!(results[1].error.is_some());
        assert_eq!(results[2].index, 2);
        assert!(results[2].external_ref.is_some());
    }

    #[tokio::test]
    async fn test_fetch_chart_always_logs_out() {
        let ledger = MockLedger::new().with_chart(vec![ChartAccount::new("600-10", "Comisiones")]);
        let chart = ledger.fetch_chart("SBO_DEMO").await.unwrap();
        assert_eq!(chart.len(), 1);
        assert_eq!(ledger.open_sessions(), 0);
        assert_eq!(ledger.logins(), 1);
    }
}
