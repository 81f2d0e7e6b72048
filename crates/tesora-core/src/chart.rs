//! Chart of accounts cache
//!
//! Charts are keyed by the company database they belong to and expire after
//! a fixed TTL. Concurrent misses for the same key may both fetch; the last
//! writer wins.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::Result;
use crate::models::ChartAccount;

/// Default time a fetched chart stays valid
pub const DEFAULT_CHART_TTL: Duration = Duration::from_secs(3600);

pub type SharedChart = Arc<Vec<ChartAccount>>;

struct CachedChart {
    accounts: SharedChart,
    fetched_at: Instant,
}

/// TTL cache of charts of accounts, one entry per company database
pub struct ChartOfAccountsCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedChart>>,
}

impl ChartOfAccountsCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_CHART_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fresh cached chart for a company database
    pub fn get(&self, company_db: &str) -> Option<SharedChart> {
        let entries = self.entries.read().ok()?;
        entries
            .get(company_db)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| Arc::clone(&entry.accounts))
    }

    pub fn insert(&self, company_db: &str, accounts: Vec<ChartAccount>) -> SharedChart {
        let accounts = Arc::new(accounts);
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                company_db.to_string(),
                CachedChart {
                    accounts: Arc::clone(&accounts),
                    fetched_at: Instant::now(),
                },
            );
        }
        accounts
    }

    /// Cached chart, or the result of `fetch` stored for next time
    ///
    /// A failed or empty fetch is returned as-is and nothing is cached.
    pub async fn get_or_fetch<F, Fut>(&self, company_db: &str, fetch: F) -> Result<SharedChart>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<ChartAccount>>>,
    {
        if let Some(chart) = self.get(company_db) {
            debug!(company_db, accounts = chart.len(), "Chart of accounts cache hit");
            return Ok(chart);
        }

        let accounts = fetch().await?;
        debug!(company_db, accounts = accounts.len(), "Fetched chart of accounts");
        if accounts.is_empty() {
            warn!(company_db, "Ledger returned an empty chart of accounts, not caching");
            return Ok(Arc::new(accounts));
        }
        Ok(self.insert(company_db, accounts))
    }

    /// Drop one company's chart; returns true if it was cached
    pub fn invalidate(&self, company_db: &str) -> bool {
        self.entries
            .write()
            .map(|mut entries| entries.remove(company_db).is_some())
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}

impl Default for ChartOfAccountsCache {
    fn default() -> Self {
        Self::new()
    }
}
