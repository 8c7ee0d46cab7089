//! Error taxonomy shared across the core.
//!
//! Public API boundaries return `CoreError`; internal plumbing favors
//! `anyhow::Result` with `.context(..)`, converting to `CoreError` only
//! where a caller needs to match on kind.

use std::time::Duration;

use thiserror::Error;

pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("another run is already in progress for this instance")]
    InstanceBusy,

    #[error("rate limited, max wait {max_wait:?} exceeded")]
    RateLimitWait { max_wait: Duration },

    #[error("download failed with status {status} for {url}")]
    Download { status: u16, url: String },

    #[error("transient client error: {0}")]
    Transient(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// HTTP 429 and 5xx are classified rate-limited/transient per §7.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, CoreError::RateLimitWait { .. })
            || matches!(self, CoreError::Download { status: 429, .. })
    }
}
