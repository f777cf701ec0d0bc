//! Error taxonomy shared across the fetcher, queue, and worker pool.
//!
//! Mirrors the classification in the spec's error handling design: every
//! error kind keeps its identity end to end, nothing is re-raised as a
//! different kind.

use thiserror::Error;

/// Errors the upstream fetcher (component C) can surface.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream bearer token expired")]
    TokenExpired,

    #[error("upstream rate-limited (409)")]
    RateLimited,

    #[error("upstream gateway timeout (504)")]
    GatewayTimeout,

    #[error("upstream response truncated at page size {page_size}")]
    Truncated { page_size: u32 },

    #[error("failed to parse upstream response: {0}")]
    ParseError(String),

    #[error("upstream returned unexpected status {0}")]
    UpstreamError(u16),

    #[error("exhausted all page sizes: {0}")]
    Unrecoverable(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl FetchError {
    /// Whether this error kind is transient and the fetcher itself
    /// already retried it internally (so a caller seeing it bubble up
    /// means the internal retry budget was exhausted).
    pub fn is_retryable_by_worker(&self) -> bool {
        matches!(self, FetchError::TokenExpired)
    }
}

/// Retry classification for the job queue (component E), mirroring the
/// teacher's `kernel::jobs::job::ErrorKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "error_kind", rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient error - will retry if attempts remain.
    Retryable,
    /// Permanent error - will not retry.
    NonRetryable,
    /// Job was cancelled.
    Cancelled,
}

impl ErrorKind {
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable)
    }
}

impl From<&FetchError> for ErrorKind {
    fn from(err: &FetchError) -> Self {
        match err {
            FetchError::TokenExpired => ErrorKind::Retryable,
            FetchError::RateLimited | FetchError::GatewayTimeout => ErrorKind::Retryable,
            FetchError::Truncated { .. } | FetchError::ParseError(_) => ErrorKind::Retryable,
            FetchError::Unrecoverable(_) => ErrorKind::NonRetryable,
            FetchError::UpstreamError(status) if (500..600).contains(status) => {
                ErrorKind::Retryable
            }
            FetchError::UpstreamError(_) => ErrorKind::NonRetryable,
            FetchError::Http(_) => ErrorKind::Retryable,
        }
    }
}

/// Errors the persistence gateway (component D) can surface.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("cache error: {0}")]
    Cache(String),
}

/// Errors the core control surface (component J) can surface.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("term {term:?} was enqueued within the cooldown window")]
    EnqueueRateLimited { term: String },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
