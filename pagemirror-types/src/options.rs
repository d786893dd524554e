//! Sync modes and run options.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a sync run selects and caches remote data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Fetch everything; all caching permitted.
    Full,
    /// Fetch only what changed since the last sync. Dynamic responses are
    /// never cached in this mode: change detection needs live timestamps.
    Incremental,
    /// User-initiated run; dynamic cache TTL is capped low.
    Manual,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

/// Options recognized by a sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Pages per queued batch.
    pub batch_size: usize,
    /// Batch retry ceiling.
    pub max_retries: u32,
    /// Base retry delay in seconds.
    pub retry_delay_secs: u64,
    /// Concurrent outbound requests (clamped to the hard ceiling of 10).
    pub concurrent_requests: usize,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Plans at or under this size are processed inline instead of queued.
    pub inline_threshold: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: 3,
            retry_delay_secs: 60,
            concurrent_requests: 5,
            timeout_secs: 30,
            inline_threshold: 5,
        }
    }
}
