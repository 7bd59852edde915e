//! Per-stage error types for the harvest pipeline.
//!
//! Each pipeline stage surfaces its own error union; the cycle driver in
//! [`crate::harvester`] decides continue-vs-abort per kind. None of these are
//! fatal to the process: every path resolves to "try again next cycle".

use thiserror::Error;

/// Transport or decode failure while reading the realtime feed. The cycle
/// aborts with no data loss; the next tick retries naturally.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("feed URL is not valid: {0}")]
    BadUrl(String),

    #[error("feed envelope decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// The dedup ledger's backing store is unreachable. Recoverable: the engine
/// degrades to treat-as-never-seen rather than dropping data.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger backing store unavailable: {0}")]
    Unavailable(String),

    #[error("ledger entry is not parseable: {0}")]
    Corrupt(String),
}

/// The aggregate store rejected or failed a merge. The cycle's entire delta
/// set is discarded; nothing is partially applied.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("aggregate store unavailable: {0}")]
    Unavailable(String),

    #[error("merge transaction failed: {0}")]
    Transaction(String),
}

/// Union of stage failures for one harvest cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Merge(#[from] MergeError),
}
