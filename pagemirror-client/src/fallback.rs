//! Fallback strategy selection.
//!
//! Once retries for a call are exhausted, a degraded execution path is
//! chosen from the failure kind and a cheap pre-estimate of the result set
//! size (a 1-item probe query). Auth failures are never downgraded.

use crate::error::ErrorKind;
use serde_json::Value;

/// Result sets at or under this size allow a full unfiltered fetch.
pub const SMALL_DATASET_MAX: usize = 100;
/// Result sets at or under this size allow a simplified filter.
pub const MEDIUM_DATASET_MAX: usize = 1000;

/// Degraded execution path after retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackStrategy {
    /// Drop the filter and fetch everything.
    FullSync,
    /// Strip timestamp conditions, keep property conditions.
    SimplifiedFilter,
    /// Unfiltered fetch with small pages, inter-page delay and a page cap.
    PaginatedSync,
    /// Fixed extra delay, then one retry at reduced concurrency.
    ThrottledRetry,
    /// Small unfiltered batches; the catch-all degradation.
    ConservativeSync,
    /// Give up; the failure cannot self-heal.
    Abort,
}

/// Selects a fallback for the failure kind and estimated result size.
///
/// `None` means no extra fallback applies (the standard backoff table has
/// already run its course).
#[must_use]
pub fn select_fallback(kind: ErrorKind, estimated_size: usize) -> Option<FallbackStrategy> {
    match kind {
        ErrorKind::Filter => Some(if estimated_size <= SMALL_DATASET_MAX {
            FallbackStrategy::FullSync
        } else if estimated_size <= MEDIUM_DATASET_MAX {
            FallbackStrategy::SimplifiedFilter
        } else {
            FallbackStrategy::PaginatedSync
        }),
        ErrorKind::RateLimit => Some(FallbackStrategy::ThrottledRetry),
        ErrorKind::Network => None,
        ErrorKind::Auth => Some(FallbackStrategy::Abort),
        ErrorKind::Server | ErrorKind::Client | ErrorKind::Unknown => {
            Some(FallbackStrategy::ConservativeSync)
        }
    }
}

/// Reads a dataset-size estimate out of a 1-item probe response.
///
/// Prefers an explicit count hint; a probe with `has_more = false` proves
/// the set is tiny; otherwise assume large so selection degrades to the
/// conservative paginated path rather than guessing small.
#[must_use]
pub fn estimate_from_probe(probe: &Value) -> usize {
    if let Some(count) = probe
        .get("estimated_count")
        .or_else(|| probe.get("total_count"))
        .and_then(Value::as_u64)
    {
        return count as usize;
    }
    let has_more = probe.get("has_more").and_then(Value::as_bool).unwrap_or(true);
    if !has_more {
        return probe
            .get("results")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
    }
    MEDIUM_DATASET_MAX + 1
}
