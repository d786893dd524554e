//! Error types and failure classification for the API client.
//!
//! Remote failures are classified deterministically into an [`ErrorKind`],
//! which drives the retry table and fallback selection. Classification
//! inspects the HTTP status first, then message patterns.

use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ApiError>;

/// Upper bound on persisted/logged error context.
pub const MAX_ERROR_CONTEXT_BYTES: usize = 1024;

/// Errors produced by the API client.
///
/// Clone is deliberate: merged requests hand the same outcome to every
/// waiter.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Transport failed or timed out before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// The remote rejected the request body (bad filter, bad params).
    #[error("request rejected: status {status}: {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, size-bounded.
        message: String,
    },

    /// The response body could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Retries and fallback were both exhausted.
    #[error("request failed after {attempts} attempts ({kind:?}): {message}")]
    Exhausted {
        /// Classified failure kind of the final attempt.
        kind: ErrorKind,
        /// Total attempts made.
        attempts: u32,
        /// Final error message, size-bounded.
        message: String,
    },

    /// Authentication failed; the whole run must abort.
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl ApiError {
    /// Classifies this error for retry/fallback decisions.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(msg) => classify(None, msg),
            Self::Rejected { status, message } => classify(Some(*status), message),
            Self::Malformed(_) => ErrorKind::Unknown,
            Self::Exhausted { kind, .. } => *kind,
            Self::Auth(_) => ErrorKind::Auth,
        }
    }
}

/// Deterministic failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Timeouts, connection reset/refused.
    Network,
    /// HTTP 429 or rate-limit wording.
    RateLimit,
    /// HTTP 5xx.
    Server,
    /// Query/filter validation rejected by the remote.
    Filter,
    /// HTTP 401/403. Fatal.
    Auth,
    /// Other 4xx. Not retried.
    Client,
    /// Anything unmatched.
    Unknown,
}

impl ErrorKind {
    /// Whether the retry table applies to this kind at all.
    #[must_use]
    pub fn should_retry(&self) -> bool {
        !matches!(self, Self::Auth | Self::Client | Self::Unknown)
    }

    /// Maximum retries (attempts beyond the first) for this kind.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::Network => 3,
            Self::RateLimit => 5,
            Self::Server => 2,
            Self::Filter => 1,
            Self::Auth | Self::Client | Self::Unknown => 0,
        }
    }

    /// Backoff schedule in backoff units (seconds in production).
    ///
    /// The n-th retry sleeps `schedule[n]` units before re-attempting.
    #[must_use]
    pub fn backoff_schedule(&self) -> &'static [u64] {
        match self {
            Self::Network => &[1, 3, 9],
            Self::RateLimit => &[5, 15, 45, 120, 300],
            Self::Server => &[2, 8],
            Self::Filter => &[1],
            Self::Auth | Self::Client | Self::Unknown => &[],
        }
    }
}

/// Classifies a failure from its HTTP status (if any) and message.
///
/// Status takes precedence over wording; a 429 is a rate limit no matter
/// what the body says.
#[must_use]
pub fn classify(status: Option<u16>, message: &str) -> ErrorKind {
    if let Some(status) = status {
        return match status {
            401 | 403 => ErrorKind::Auth,
            429 => ErrorKind::RateLimit,
            500..=599 => ErrorKind::Server,
            400 if looks_like_filter_error(message) => ErrorKind::Filter,
            400..=499 => ErrorKind::Client,
            _ => ErrorKind::Unknown,
        };
    }

    let lower = message.to_ascii_lowercase();
    if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection reset")
        || lower.contains("connection refused")
        || lower.contains("connection closed")
        || lower.contains("dns error")
    {
        ErrorKind::Network
    } else if lower.contains("rate limit") || lower.contains("too many requests") {
        ErrorKind::RateLimit
    } else {
        ErrorKind::Unknown
    }
}

fn looks_like_filter_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("filter")
        || lower.contains("validation")
        || lower.contains("invalid property")
        || lower.contains("does not match the schema")
}

/// Truncates error context to [`MAX_ERROR_CONTEXT_BYTES`] on a char
/// boundary.
#[must_use]
pub fn truncate_context(message: &str) -> String {
    if message.len() <= MAX_ERROR_CONTEXT_BYTES {
        return message.to_string();
    }
    let mut end = MAX_ERROR_CONTEXT_BYTES;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &message[..end])
}
