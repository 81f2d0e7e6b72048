//! SAP Business One Service Layer client
//!
//! Session-based REST API: `POST /Login` returns a `B1SESSION` cookie that
//! every later call sends back until `POST /Logout`. Errors come back as
//! `{"error": {"message": {"value": "..."}}}`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{Client, Response};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::ChartAccount;

use super::{BankPage, JournalEntry, LedgerBackend, LedgerSession, VendorPayment};

/// Per-request timeout for document calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Chart pages can be slow on large companies
const CHART_TIMEOUT: Duration = Duration::from_secs(120);

/// Accounts requested per chart page
pub const CHART_PAGE_SIZE: usize = 500;

const SESSION_COOKIE: &str = "B1SESSION";

/// HTTP client for the Service Layer
#[derive(Clone)]
pub struct ServiceLayerClient {
    http_client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl ServiceLayerClient {
    pub fn new(base_url: &str, username: &str, password: &str) -> Result<Self> {
        Self::with_options(base_url, username, password, false)
    }

    /// Build a client, optionally skipping TLS certificate checks
    ///
    /// Skipping checks is only meant for internal endpoints with a
    /// self-signed certificate and is logged every time a client is built.
    pub fn with_options(
        base_url: &str,
        username: &str,
        password: &str,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        if accept_invalid_certs {
            warn!(
                base_url,
                "TLS certificate verification is DISABLED for the ledger service layer"
            );
        }
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// Create from `SAP_SERVICE_LAYER_URL`, `SAP_USERNAME`, `SAP_PASSWORD`
    ///
    /// Returns `Ok(None)` when no URL is configured.
    pub fn from_env() -> Result<Option<Self>> {
        let Ok(url) = std::env::var("SAP_SERVICE_LAYER_URL") else {
            return Ok(None);
        };
        let username = std::env::var("SAP_USERNAME").unwrap_or_default();
        let password = std::env::var("SAP_PASSWORD").unwrap_or_default();
        let accept_invalid_certs = std::env::var("SAP_ACCEPT_INVALID_CERTS")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Self::with_options(&url, &username, &password, accept_invalid_certs).map(Some)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn session_cookie(session: &LedgerSession) -> String {
        format!("{}={}", SESSION_COOKIE, session.session_id)
    }

    /// POST a document and read one numeric field from the response
    async fn create_document<T: Serialize + ?Sized>(
        &self,
        session: &LedgerSession,
        path: &str,
        body: &T,
        id_field: &str,
    ) -> Result<i64> {
        let response = self
            .http_client
            .post(self.url(path))
            .header(COOKIE, Self::session_cookie(session))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Ledger(error_message(response).await));
        }

        let data: Value = response.json().await?;
        data.get(id_field)
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::InvalidData(format!("{} response has no {}", path, id_field)))
    }
}

/// Ledger error text from `error.message.value`, or the raw status and body
async fn error_message(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message/value")
                .and_then(Value::as_str)
                .map(String::from)
        })
        .unwrap_or_else(|| format!("HTTP {}: {}", status, body.trim()))
}

fn sap_datetime(date: NaiveDate) -> String {
    format!("{}T00:00:00Z", date.format("%Y-%m-%d"))
}

// ========== Wire Types ==========

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct LoginRequest<'a> {
    #[serde(rename = "CompanyDB")]
    company_db: &'a str,
    user_name: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(rename = "SessionId")]
    session_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct JournalEntryPayload<'a> {
    reference_date: String,
    tax_date: String,
    due_date: String,
    memo: &'a str,
    journal_entry_lines: Vec<JournalLinePayload<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct JournalLinePayload<'a> {
    account_code: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    debit: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    credit: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    costing_code: Option<&'a str>,
    #[serde(rename = "BPLID", skip_serializing_if = "Option::is_none")]
    bpl_id: Option<i32>,
}

impl<'a> From<&'a JournalEntry> for JournalEntryPayload<'a> {
    fn from(entry: &'a JournalEntry) -> Self {
        let date = sap_datetime(entry.date);
        Self {
            reference_date: date.clone(),
            tax_date: date.clone(),
            due_date: date,
            memo: &entry.memo,
            journal_entry_lines: entry
                .lines
                .iter()
                .map(|line| JournalLinePayload {
                    account_code: &line.account_code,
                    debit: line.debit,
                    credit: line.credit,
                    costing_code: line.cost_center.as_deref(),
                    bpl_id: line.bpl_id.filter(|id| *id != 0),
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct BankPagePayload<'a> {
    account_code: &'a str,
    due_date: String,
    #[serde(with = "rust_decimal::serde::float")]
    debit_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    credit_amount: Decimal,
    doc_number_type: &'static str,
    memo: &'a str,
    reference: &'a str,
}

impl<'a> From<&'a BankPage> for BankPagePayload<'a> {
    fn from(page: &'a BankPage) -> Self {
        Self {
            account_code: &page.account_code,
            due_date: sap_datetime(page.due_date),
            debit_amount: page.debit_amount,
            credit_amount: page.credit_amount,
            doc_number_type: "bpdt_DocNum",
            memo: &page.memo,
            reference: &page.reference,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct VendorPaymentPayload<'a> {
    card_code: &'a str,
    doc_date: String,
    #[serde(with = "rust_decimal::serde::float")]
    transfer_sum: Decimal,
    transfer_account: &'a str,
    transfer_date: String,
    payment_invoices: Vec<PaymentInvoicePayload<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PaymentInvoicePayload<'a> {
    line_num: i32,
    doc_entry: i64,
    #[serde(with = "rust_decimal::serde::float")]
    sum_applied: Decimal,
    invoice_type: &'a str,
}

#[derive(Deserialize)]
struct ChartPage {
    #[serde(default)]
    value: Vec<ChartItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ChartItem {
    code: String,
    name: String,
}

#[async_trait]
impl LedgerBackend for ServiceLayerClient {
    async fn login(&self, company_db: &str) -> Result<LedgerSession> {
        info!(company_db, base_url = %self.base_url, "Ledger login");

        let response = self
            .http_client
            .post(self.url("Login"))
            .json(&LoginRequest {
                company_db,
                user_name: &self.username,
                password: &self.password,
            })
            .send()
            .await
            .map_err(|e| Error::Session(format!("Cannot reach ledger: {}", e)))?;

        if !response.status().is_success() {
            let message = error_message(response).await;
            return Err(Error::Session(format!("Ledger login failed: {}", message)));
        }

        let from_cookie = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|cookie| {
                let pair = cookie.split(';').next()?.trim();
                let (name, value) = pair.split_once('=')?;
                (name == SESSION_COOKIE && !value.is_empty()).then(|| value.to_string())
            });

        let session_id = match from_cookie {
            Some(id) => id,
            None => {
                let body: LoginResponse = response.json().await.map_err(|e| {
                    Error::Session(format!("Ledger login returned no session: {}", e))
                })?;
                body.session_id.ok_or_else(|| {
                    Error::Session("Ledger login returned no session".to_string())
                })?
            }
        };

        Ok(LedgerSession {
            company_db: company_db.to_string(),
            session_id,
        })
    }

    async fn logout(&self, session: &LedgerSession) -> Result<()> {
        let response = self
            .http_client
            .post(self.url("Logout"))
            .header(COOKIE, Self::session_cookie(session))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Ledger(error_message(response).await));
        }
        debug!(company_db = %session.company_db, "Ledger logout");
        Ok(())
    }

    async fn create_journal_entry(&self, session: &LedgerSession, entry: &JournalEntry) -> Result<i64> {
        self.create_document(session, "JournalEntries", &JournalEntryPayload::from(entry), "JdtNum")
            .await
    }

    async fn create_bank_page(&self, session: &LedgerSession, page: &BankPage) -> Result<i64> {
        self.create_document(session, "BankPages", &BankPagePayload::from(page), "Sequence")
            .await
    }

    async fn create_vendor_payment(
        &self,
        session: &LedgerSession,
        payment: &VendorPayment,
    ) -> Result<i64> {
        if payment.invoices.is_empty() {
            return Err(Error::InvalidInput("Vendor payment has no invoices".into()));
        }
        let body = VendorPaymentPayload {
            card_code: &payment.card_code,
            doc_date: sap_datetime(payment.doc_date),
            transfer_sum: payment.transfer_sum(),
            transfer_account: &payment.transfer_account,
            transfer_date: sap_datetime(payment.transfer_date),
            payment_invoices: payment
                .invoices
                .iter()
                .map(|i| PaymentInvoicePayload {
                    line_num: i.line_num,
                    doc_entry: i.doc_entry,
                    sum_applied: i.sum_applied,
                    invoice_type: &i.invoice_type,
                })
                .collect(),
        };
        self.create_document(session, "VendorPayments", &body, "DocNum").await
    }

    async fn chart_of_accounts(&self, session: &LedgerSession) -> Result<Vec<ChartAccount>> {
        let mut accounts = Vec::new();
        let mut skip = 0;

        loop {
            let response = self
                .http_client
                .get(self.url("ChartOfAccounts"))
                .header(COOKIE, Self::session_cookie(session))
                .query(&[
                    ("$select", "Code,Name".to_string()),
                    ("$top", CHART_PAGE_SIZE.to_string()),
                    ("$skip", skip.to_string()),
                ])
                .timeout(CHART_TIMEOUT)
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(Error::Ledger(error_message(response).await));
            }

            let page: ChartPage = response.json().await?;
            let count = page.value.len();
            accounts.extend(
                page.value
                    .into_iter()
                    .map(|item| ChartAccount::new(item.code, item.name)),
            );

            if count < CHART_PAGE_SIZE {
                break;
            }
            skip += CHART_PAGE_SIZE;
        }

        info!(company_db = %session.company_db, accounts = accounts.len(), "Fetched chart of accounts");
        Ok(accounts)
    }
}
