//! Local sync bookkeeping records.

use crate::ids::PageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One bookkeeping row per remote page that has ever been synced.
///
/// Created on first successful sync, updated after every successful sync,
/// never deleted by the engine. Hashes must only change together with the
/// local write they describe; `last_sync_time` is monotonically
/// non-decreasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Remote page id this record tracks.
    pub remote_id: PageId,
    /// Composite content hash (hex-encoded SHA-256).
    pub content_hash: String,
    /// Hash of the title text alone.
    pub title_hash: String,
    /// Hash of the serialized property map.
    pub properties_hash: String,
    /// Hash of the serialized block list.
    pub blocks_hash: String,
    /// When the last successful sync completed.
    pub last_sync_time: DateTime<Utc>,
    /// The remote `last_edited_time` observed at that sync.
    pub last_edited_time_seen: Option<DateTime<Utc>>,
}

impl SyncRecord {
    /// Returns true if every stored hash is present and non-empty.
    ///
    /// Records written by older versions may carry empty hashes; those fall
    /// back to timestamp comparison.
    #[must_use]
    pub fn has_hashes(&self) -> bool {
        !self.content_hash.is_empty()
            && !self.title_hash.is_empty()
            && !self.properties_hash.is_empty()
            && !self.blocks_hash.is_empty()
    }

    /// Advances `last_sync_time`, keeping it monotonically non-decreasing.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_sync_time {
            self.last_sync_time = now;
        }
    }
}
