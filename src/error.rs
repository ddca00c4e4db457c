//! Typed error kinds for the ingestion core.
//!
//! Propagation policy in one line each: time errors reject the caller,
//! chain errors are retried by the facade before surfacing, per-epoch
//! errors are handled by the backfill workers (skip / quarantine), store
//! errors mark the pool unhealthy and retry on the next operation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimeError {
    #[error("invalid time input: {0}")]
    InvalidInput(String),
}

#[derive(Debug, Error)]
pub enum ChainError {
    /// A pull-surface request kept failing after the facade's retries.
    #[error("chain request failed after {attempts} attempts: {message}")]
    RequestFailed { attempts: u32, message: String },

    /// The block-by-timestamp search had no candidate block to return.
    #[error("no block found for target timestamp {target}")]
    RangeOutOfBounds { target: u64 },

    #[error("invalid contract address {0}")]
    InvalidAddress(String),

    #[error("invalid rpc endpoint {0}")]
    InvalidEndpoint(String),

    /// A live log did not decode as any event we subscribe to.
    #[error("undecodable event in tx {tx_hash}: {reason}")]
    BadEvent { tx_hash: String, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database unavailable: {0}")]
    Unavailable(#[from] sea_orm::DbErr),
}

#[derive(Debug, Error)]
pub enum EpochError {
    /// Normal for freshly-live epochs; workers skip silently.
    #[error("round {0} has not closed yet")]
    RoundNotClosed(u64),

    /// The following round has not started, so the ingestion window for
    /// this epoch cannot be bounded yet. Also a silent skip.
    #[error("round {0} cannot be bounded: next round not started")]
    NextRoundNotStarted(u64),

    #[error("integrity check failed for epoch {epoch}: {reason}")]
    IntegrityFailed { epoch: u64, reason: String },

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Time(#[from] TimeError),
}

impl EpochError {
    /// True for the two "not ready yet" conditions that are expected in
    /// steady state and must not be logged as failures.
    pub fn is_silent_skip(&self) -> bool {
        matches!(
            self,
            EpochError::RoundNotClosed(_) | EpochError::NextRoundNotStarted(_)
        )
    }
}
