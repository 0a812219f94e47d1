use chrono::NaiveDate;
use thiserror::Error;

/// Top-level error for batch and single-entry pricing.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("marketplace search failed: {0}")]
    Market(#[from] MarketError),
    #[error("daily api quota exhausted for {date}")]
    QuotaExhausted { date: NaiveDate },
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
    #[error("entry {entry_id} has no marketplace query")]
    MissingQuery { entry_id: i64 },
    #[error("entry {entry_id} has no reference price")]
    NoReference { entry_id: i64 },
    #[error("no listing of entry {entry_id} survived normalization")]
    NoValidListings { entry_id: i64 },
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Failure of the external marketplace search collaborator.
///
/// Every variant is retryable from the orchestrator's point of view;
/// retries still consume quota.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("marketplace unavailable: {0}")]
    Unavailable(String),
    #[error("marketplace rejected query: {0}")]
    BadQuery(String),
}

/// Failure of the persistence collaborator. Fatal to a running batch.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(String),
    #[error("unknown entry {0}")]
    UnknownEntry(i64),
}

/// Per-listing normalization rejection. Never fatal; the listing is
/// dropped from the sample.
#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("unknown currency {0}")]
    UnknownCurrency(String),
    #[error("shipping cost neither quoted nor marked included")]
    MissingShipping,
    #[error("non-positive effective price")]
    NonPositive,
}
