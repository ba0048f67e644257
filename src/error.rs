//! Error types for the crawler

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, CrawlerError>;

/// Main error type for the crawler
#[derive(Debug, Error)]
pub enum CrawlerError {
    /// Chain RPC call failed (disconnect, timeout, bad response)
    #[error("Chain RPC error: {0}")]
    Rpc(String),

    /// Datastore read or write failed
    #[error("Database error: {0}")]
    Database(String),

    /// Job journal request failed
    #[error("Journal error: {0}")]
    Journal(String),

    /// ABI descriptor could not be parsed or resolved
    #[error("ABI error: {0}")]
    Abi(String),

    /// Log or calldata could not be decoded against its ABI
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// A job descriptor is missing a required tag
    #[error("Tag '{tag}' not found in entry {entry_id}")]
    TagNotFound { entry_id: String, tag: String },

    /// Block range bounds violate the crawl direction
    #[error("Invalid block range: {start}..{end} ({reason})")]
    InvalidRange { start: u64, end: u64, reason: String },

    /// Reconnecting to the chain failed after every attempt
    #[error("Failed to connect to {blockchain} after {attempts} attempts: {last_error}")]
    ReconnectExhausted {
        blockchain: String,
        attempts: usize,
        last_error: String,
    },

    /// Too many consecutive cycle failures
    #[error("Crawler failed {failures} times in a row, last error: {last_error}")]
    FailureCeiling { failures: usize, last_error: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CrawlerError {
    /// Errors a scheduler cycle may survive by rolling back and reconnecting.
    ///
    /// Only an exhausted reconnect or the consecutive failure ceiling ends a crawler;
    /// everything else counts towards that ceiling.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CrawlerError::ReconnectExhausted { .. } | CrawlerError::FailureCeiling { .. }
        )
    }
}

impl From<tokio_postgres::Error> for CrawlerError {
    fn from(e: tokio_postgres::Error) -> Self {
        CrawlerError::Database(e.to_string())
    }
}

impl From<alloy::transports::TransportError> for CrawlerError {
    fn from(e: alloy::transports::TransportError) -> Self {
        CrawlerError::Rpc(e.to_string())
    }
}

impl From<reqwest::Error> for CrawlerError {
    fn from(e: reqwest::Error) -> Self {
        CrawlerError::Journal(e.to_string())
    }
}

/// Tagged outcome of a single fetch/write step.
///
/// Scheduler loops match on the tag instead of inspecting error types.
#[derive(Debug)]
pub enum StepOutcome<T> {
    Ok(T),
    Retryable(CrawlerError),
    Fatal(CrawlerError),
}

impl<T> StepOutcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, StepOutcome::Ok(_))
    }

    /// Collapse back into a plain result, dropping the retry classification.
    pub fn into_result(self) -> Result<T> {
        match self {
            StepOutcome::Ok(value) => Ok(value),
            StepOutcome::Retryable(e) | StepOutcome::Fatal(e) => Err(e),
        }
    }
}

impl<T> From<Result<T>> for StepOutcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => StepOutcome::Ok(value),
            Err(e) if e.is_retryable() => StepOutcome::Retryable(e),
            Err(e) => StepOutcome::Fatal(e),
        }
    }
}
