//! Database access layer with connection pooling and migrations
//!
//! This module is organized by domain:
//! - `rules` - Learning rules (pattern to ledger account mappings)
//! - `layouts` - Cached bank statement layouts keyed by fingerprint
//! - `batches` - Committed batches, their lines, and posting results

use chrono::{DateTime, NaiveDate, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rust_decimal::Decimal;
use tracing::info;

use crate::error::{Error, Result};

mod batches;
mod layouts;
mod rules;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Environment variable for database encryption key
pub const DB_KEY_ENV: &str = "TESORA_DB_KEY";

/// Derive an encryption key from a passphrase using Argon2
///
/// Uses a fixed application salt so the same passphrase always produces the same key,
/// regardless of database path.
fn derive_key(passphrase: &str) -> Result<String> {
    use argon2::{password_hash::SaltString, Argon2, PasswordHasher};

    // Changing this invalidates every existing encrypted database
    const APP_SALT: &[u8; 16] = b"tesora-salt-v001";

    let salt = SaltString::encode_b64(APP_SALT)
        .map_err(|e| Error::Encryption(format!("Failed to create salt: {}", e)))?;

    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(passphrase.as_bytes(), &salt)
        .map_err(|e| Error::Encryption(format!("Failed to derive key: {}", e)))?;

    let hash_str = hash
        .hash
        .ok_or_else(|| Error::Encryption("No hash output".to_string()))?;
    Ok(hex::encode(hash_str.as_bytes()))
}

/// Parse a SQLite datetime string into a DateTime<Utc>
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    // SQLite stores as "YYYY-MM-DD HH:MM:SS" format
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap_or_default()
}

/// Amounts are stored as TEXT so no precision is lost
pub(crate) fn parse_decimal(s: Option<String>) -> Option<Decimal> {
    s.and_then(|v| v.parse().ok())
}

pub(crate) fn decimal_to_sql(d: Option<Decimal>) -> Option<String> {
    d.map(|v| v.to_string())
}

/// Database wrapper with connection pooling
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    /// Path to the database file
    db_path: String,
}

impl Database {
    /// Create a new database connection pool with encryption
    ///
    /// Requires `TESORA_DB_KEY` environment variable to be set.
    /// Use `new_unencrypted()` for development/testing without encryption.
    pub fn new(path: &str) -> Result<Self> {
        match std::env::var(DB_KEY_ENV).ok() {
            Some(key) => Self::new_with_key(path, Some(&key)),
            None => Err(Error::Encryption(format!(
                "Database encryption required. Set {} environment variable with your passphrase, \
                or use --no-encrypt for unencrypted databases (not recommended for production).",
                DB_KEY_ENV
            ))),
        }
    }

    /// Create a new unencrypted database connection pool
    pub fn new_unencrypted(path: &str) -> Result<Self> {
        Self::new_with_key(path, None)
    }

    /// Create a new database with an explicit encryption key
    pub fn new_with_key(path: &str, passphrase: Option<&str>) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path);

        let pool = if let Some(pass) = passphrase {
            let key = derive_key(pass)?;
            let key_pragma = format!("PRAGMA key = 'x\"{}\"';", key);

            let manager = manager.with_init(move |conn| {
                conn.execute_batch(&key_pragma)?;
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                Ok(())
            });

            Pool::builder().max_size(10).build(manager)?
        } else {
            let manager =
                manager.with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
            Pool::builder().max_size(10).build(manager)?
        };

        let db = Self {
            pool,
            db_path: path.to_string(),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Get the path to the database file
    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Create a throwaway database (for testing)
    ///
    /// Uses a temporary file rather than `:memory:` because every pooled
    /// connection must see the same data.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "tesora_test_{}_{}.db",
            std::process::id(),
            id
        ));
        let path = path.to_string_lossy().to_string();

        let _ = std::fs::remove_file(&path);

        Self::new_unencrypted(&path)
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- WAL mode: readers don't block writers
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            -- Learning rules (pattern -> ledger account)
            CREATE TABLE IF NOT EXISTS learning_rules (
                id INTEGER PRIMARY KEY,
                pattern TEXT NOT NULL,
                match_type TEXT NOT NULL DEFAULT 'contains',   -- exact, contains
                sap_account_code TEXT NOT NULL,
                sap_account_name TEXT,
                confidence_score INTEGER NOT NULL DEFAULT 100
                    CHECK (confidence_score BETWEEN 0 AND 100),
                source TEXT NOT NULL DEFAULT 'manual',         -- manual, user_correction, ai_learned
                rule_type TEXT,                                -- ACTOR, RFC, CONCEPTO
                priority INTEGER NOT NULL DEFAULT 3,           -- lower wins ties
                actor TEXT,
                rfc TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_learning_rules_pattern ON learning_rules(pattern);
            CREATE INDEX IF NOT EXISTS idx_learning_rules_pattern_account
                ON learning_rules(pattern, sap_account_code);
            CREATE INDEX IF NOT EXISTS idx_learning_rules_confidence
                ON learning_rules(confidence_score DESC);

            -- Cached statement layouts
            CREATE TABLE IF NOT EXISTS bank_layout_templates (
                id INTEGER PRIMARY KEY,
                fingerprint TEXT NOT NULL UNIQUE,
                bank_name_guess TEXT,
                parse_config TEXT NOT NULL,                    -- JSON ParseConfig
                use_count INTEGER NOT NULL DEFAULT 0,
                last_used_at DATETIME,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- Committed batches
            CREATE TABLE IF NOT EXISTS batches (
                id INTEGER PRIMARY KEY,
                statement_number TEXT NOT NULL UNIQUE,         -- YYYY-MM-NNN
                filename TEXT NOT NULL,
                company_db TEXT NOT NULL,
                bank_account_code TEXT NOT NULL,
                cost_center TEXT,
                bpl_id INTEGER,
                posting_mode TEXT NOT NULL DEFAULT 'journal_entry',
                total_records INTEGER NOT NULL,
                total_debit TEXT NOT NULL,
                total_credit TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',        -- pending, processing, completed, failed
                error_message TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_batches_status ON batches(status);

            -- Lines of a batch, each with its own posting result
            CREATE TABLE IF NOT EXISTS batch_lines (
                id INTEGER PRIMARY KEY,
                batch_id INTEGER NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
                sequence INTEGER NOT NULL,
                due_date DATE NOT NULL,
                memo TEXT NOT NULL,
                debit_amount TEXT,
                credit_amount TEXT,
                sap_account_code TEXT NOT NULL,
                sap_account_name TEXT,
                ai_suggested_account TEXT,
                external_ref INTEGER,                          -- ledger document number
                error TEXT,
                posted_at DATETIME,
                UNIQUE(batch_id, sequence)
            );

            CREATE INDEX IF NOT EXISTS idx_batch_lines_batch ON batch_lines(batch_id);

            -- Audit trail of every row post
            CREATE TABLE IF NOT EXISTS posting_attempts (
                id INTEGER PRIMARY KEY,
                batch_id INTEGER NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
                line_id INTEGER NOT NULL REFERENCES batch_lines(id) ON DELETE CASCADE,
                success BOOLEAN NOT NULL,
                external_ref INTEGER,
                error TEXT,
                attempted_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_posting_attempts_line ON posting_attempts(line_id);
            "#,
        )?;

        info!("Database schema initialized");
        Ok(())
    }
}
