//! Historical Quote Port (Driven Port)
//!
//! Interface for fetching the one-minute bars around a day's market open,
//! and for building authenticated fetch sessions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};

use crate::domain::{Bar, Symbol};

/// Error categories for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient failure, worth another attempt.
    Retryable,
    /// Permanent failure for this call.
    NonRetryable,
    /// Rate limited - honour the server's delay if it gave one.
    RateLimited,
}

/// Categorize an HTTP status for retry decisions.
#[must_use]
pub const fn categorize_status(status_code: u16) -> ErrorCategory {
    match status_code {
        429 => ErrorCategory::RateLimited,
        408 => ErrorCategory::Retryable,
        400..=499 => ErrorCategory::NonRetryable,
        500..=599 => ErrorCategory::Retryable,
        _ => ErrorCategory::NonRetryable,
    }
}

/// Failure of one window fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The call exceeded its timeout.
    #[error("request timed out")]
    Timeout,

    /// Connection level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Unexpected HTTP status.
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// The server asked us to slow down.
    #[error("rate limited")]
    RateLimited {
        /// Delay requested by the server.
        retry_after: Option<Duration>,
    },

    /// The server refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The shared session token is no longer accepted.
    #[error("session expired")]
    SessionExpired,
}

impl FetchError {
    /// Retry category of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout | Self::Transport(_) => ErrorCategory::Retryable,
            Self::Status(code) => categorize_status(*code),
            Self::RateLimited { .. } => ErrorCategory::RateLimited,
            Self::Rejected(_) | Self::SessionExpired => ErrorCategory::NonRetryable,
        }
    }

    /// Server requested delay, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Port for fetching historical one-minute bars.
#[async_trait]
pub trait HistoricalQuoteSource: Send + Sync {
    /// Fetch the bars covering the first minutes after `open` on `day`.
    ///
    /// A day without trading is an empty vector, not an error.
    async fn fetch_window(
        &self,
        symbol: &Symbol,
        day: NaiveDate,
        open: NaiveTime,
    ) -> Result<Vec<Bar>, FetchError>;
}

/// Shared session token produced by a login.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    /// Wrap a token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken([REDACTED])")
    }
}

/// Session construction error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// The login itself failed.
    #[error("login failed: {0}")]
    Login(String),

    /// A handle could not be attached to the shared token.
    #[error("session {index} failed to attach: {reason}")]
    Attach {
        /// Handle index.
        index: usize,
        /// Failure details.
        reason: String,
    },
}

/// Port for building authenticated quote sources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Log in once and return the shared token.
    async fn login(&self) -> Result<SessionToken, SessionError>;

    /// Build the `index`-th fetch handle on top of `token`.
    async fn attach(
        &self,
        index: usize,
        token: &SessionToken,
    ) -> Result<Arc<dyn HistoricalQuoteSource>, SessionError>;
}
