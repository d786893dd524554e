//! Tagged per-call results.
//!
//! Expected, classifiable failures are data, not exceptions: callers branch
//! on [`ApiOutcome`] instead of catching error hierarchies. An `ApiResult`
//! is consumed immediately by the caller and never persisted.

use crate::error::{truncate_context, ErrorKind};
use std::time::Duration;

/// How a logical API call concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiOutcome {
    /// The primary request path succeeded.
    Success,
    /// A fallback strategy produced a usable result after the primary path
    /// failed.
    FallbackSuccess,
    /// Retries and fallback were both exhausted.
    Failure,
}

/// Outcome of one logical API client call.
#[derive(Debug, Clone)]
pub struct ApiResult<T> {
    /// How the call concluded.
    pub outcome: ApiOutcome,
    /// The payload, present unless `outcome` is `Failure`.
    pub data: Option<T>,
    /// Classified kind of the final error, if any attempt failed.
    pub error_kind: Option<ErrorKind>,
    /// Retries performed (attempts beyond the first).
    pub retry_count: u32,
    /// Wall-clock duration of the whole call including backoff.
    pub duration: Duration,
    /// Human-readable context, size-bounded.
    pub context: String,
}

impl<T> ApiResult<T> {
    /// A clean first-attempt or retried success.
    pub fn success(data: T, retry_count: u32, duration: Duration) -> Self {
        Self {
            outcome: ApiOutcome::Success,
            data: Some(data),
            error_kind: None,
            retry_count,
            duration,
            context: String::new(),
        }
    }

    /// A success obtained through a fallback strategy.
    pub fn fallback(
        data: T,
        kind: ErrorKind,
        retry_count: u32,
        duration: Duration,
        context: &str,
    ) -> Self {
        Self {
            outcome: ApiOutcome::FallbackSuccess,
            data: Some(data),
            error_kind: Some(kind),
            retry_count,
            duration,
            context: truncate_context(context),
        }
    }

    /// A definitive failure.
    pub fn failure(kind: ErrorKind, retry_count: u32, duration: Duration, context: &str) -> Self {
        Self {
            outcome: ApiOutcome::Failure,
            data: None,
            error_kind: Some(kind),
            retry_count,
            duration,
            context: truncate_context(context),
        }
    }

    /// True unless the call failed outright.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.outcome != ApiOutcome::Failure
    }

    /// Maps the payload type.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiResult<U> {
        ApiResult {
            outcome: self.outcome,
            data: self.data.map(f),
            error_kind: self.error_kind,
            retry_count: self.retry_count,
            duration: self.duration,
            context: self.context,
        }
    }
}
