//! Error types for tesora-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("The statement file is empty")]
    EmptyFile,

    #[error("No transactions could be extracted from the statement")]
    NoTransactionsExtracted,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("AI backend error: {0}")]
    Ai(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Ledger session error: {0}")]
    Session(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Errors the caller caused and can fix by changing the request
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::EmptyFile
                | Error::NoTransactionsExtracted
                | Error::InvalidInput(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
