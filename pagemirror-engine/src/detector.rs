//! Content-hash based change detection.
//!
//! A page's fingerprint is SHA-256 over the ordered tuple `(title_text,
//! json(properties), last_edited_time, json(blocks))`. Properties live in a
//! `BTreeMap`, so serialization and therefore hashing is deterministic.
//!
//! Detection is read-only. [`commit_hashes`] is the separate write step and
//! must only run after the downstream write for that page succeeded,
//! otherwise a failed write would leave the page marked as synced.

use crate::error::EngineResult;
use crate::store::SyncRecordStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pagemirror_types::{PropertyValue, RemotePage, SyncRecord};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Clock skew absorbed by timestamp comparisons.
pub const TIMESTAMP_TOLERANCE_SECS: i64 = 1;

/// Per-field content hashes for one page snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHashes {
    /// Hash of the title text.
    pub title: String,
    /// Hash of the serialized property map.
    pub properties: String,
    /// Hash of the serialized block list.
    pub blocks: String,
    /// Composite hash over all fields plus `last_edited_time`.
    pub composite: String,
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Computes all content hashes for a page snapshot.
pub fn compute_page_hashes(page: &RemotePage) -> EngineResult<PageHashes> {
    let title = page.title_text().unwrap_or_default();
    let properties_json = serde_json::to_string(&page.properties)?;
    let blocks_json = serde_json::to_string(&page.blocks)?;
    let edited = page
        .last_edited_time
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();

    let composite = {
        let mut hasher = Sha256::new();
        // Length-prefixed so adjacent fields cannot alias.
        for part in [title.as_str(), &properties_json, &edited, &blocks_json] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    };

    Ok(PageHashes {
        title: sha256_hex(title.as_bytes()),
        properties: sha256_hex(properties_json.as_bytes()),
        blocks: sha256_hex(blocks_json.as_bytes()),
        composite,
    })
}

/// Property keys that differ between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyDiff {
    /// Keys present only in the new snapshot.
    pub added: Vec<String>,
    /// Keys present in both with different values.
    pub changed: Vec<String>,
    /// Keys present only in the old snapshot.
    pub removed: Vec<String>,
}

impl PropertyDiff {
    /// True when no key differs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Diffs two decoded property maps by key.
#[must_use]
pub fn diff_properties(
    old: &BTreeMap<String, PropertyValue>,
    new: &BTreeMap<String, PropertyValue>,
) -> PropertyDiff {
    let mut diff = PropertyDiff::default();
    for (key, value) in new {
        match old.get(key) {
            None => diff.added.push(key.clone()),
            Some(previous) if previous != value => diff.changed.push(key.clone()),
            Some(_) => {}
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            diff.removed.push(key.clone());
        }
    }
    diff
}

/// Which parts of a page changed since its last sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// No record exists; the page has never been synced.
    pub new_page: bool,
    /// The title text changed.
    pub title: bool,
    /// The property map changed.
    pub properties: bool,
    /// The block list changed.
    pub blocks: bool,
    /// The remote edit timestamp changed.
    pub last_edited_time: bool,
    /// Key-level property diff, populated when a previous snapshot is
    /// available.
    pub property_diff: PropertyDiff,
}

impl ChangeSet {
    /// The changeset for a page with no sync record. Never skippable.
    #[must_use]
    pub fn for_new_page() -> Self {
        Self {
            new_page: true,
            title: true,
            properties: true,
            blocks: true,
            last_edited_time: true,
            property_diff: PropertyDiff::default(),
        }
    }

    /// True when nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !(self.new_page || self.title || self.properties || self.blocks || self.last_edited_time)
    }
}

/// Compares a page snapshot against its sync record.
///
/// `previous` is the last snapshot the collaborator wrote, when it keeps
/// one; it enables the key-level property diff and nothing else.
pub fn detect_changes(
    page: &RemotePage,
    record: Option<&SyncRecord>,
    previous: Option<&RemotePage>,
) -> EngineResult<ChangeSet> {
    let Some(record) = record else {
        return Ok(ChangeSet::for_new_page());
    };

    let hashes = compute_page_hashes(page)?;
    if record.has_hashes() && hashes.composite == record.content_hash {
        return Ok(ChangeSet::default());
    }

    let mut set = ChangeSet {
        title: hashes.title != record.title_hash,
        properties: hashes.properties != record.properties_hash,
        blocks: hashes.blocks != record.blocks_hash,
        last_edited_time: page.last_edited_time != record.last_edited_time_seen,
        ..ChangeSet::default()
    };
    if set.properties {
        if let Some(previous) = previous {
            set.property_diff = diff_properties(&previous.properties, &page.properties);
        }
    }
    Ok(set)
}

/// Decides whether a candidate page can be skipped without re-syncing.
///
/// Hash comparison is primary; timestamp comparison is the fallback for
/// records without hashes. On any ambiguity (hashing failure, missing
/// timestamps) the answer is "needs sync", logged, never an error.
///
/// Candidate pages from a query carry no block tree, and block edits bump
/// `last_edited_time` remotely, so the block hash is not consulted here.
#[must_use]
pub fn should_skip(page: &RemotePage, record: Option<&SyncRecord>) -> bool {
    let Some(record) = record else {
        return false;
    };

    if record.has_hashes() {
        let hashes = match compute_page_hashes(page) {
            Ok(hashes) => hashes,
            Err(e) => {
                warn!("hashing failed for {}, treating as changed: {e}", page.id);
                return false;
            }
        };
        if hashes.title != record.title_hash || hashes.properties != record.properties_hash {
            return false;
        }
        return timestamps_match(page.last_edited_time, record.last_edited_time_seen, &page.id);
    }

    // Legacy record without hashes: timestamp fallback against the last
    // sync time.
    timestamps_match(page.last_edited_time, Some(record.last_sync_time), &page.id)
}

fn timestamps_match(
    remote: Option<DateTime<Utc>>,
    local: Option<DateTime<Utc>>,
    page_id: &pagemirror_types::PageId,
) -> bool {
    let Some(remote) = remote else {
        debug!("{page_id}: remote has no last_edited_time, cannot prove freshness");
        return false;
    };
    let Some(local) = local else {
        return false;
    };
    remote <= local + ChronoDuration::seconds(TIMESTAMP_TOLERANCE_SECS)
}

/// Writes the page's current hashes to its sync record.
///
/// Idempotent upsert keyed by remote id; `last_sync_time` never moves
/// backwards. Call only after the downstream write was confirmed.
pub async fn commit_hashes(page: &RemotePage, store: &dyn SyncRecordStore) -> EngineResult<()> {
    let hashes = compute_page_hashes(page)?;
    let now = Utc::now();

    let mut record = store.get(&page.id).await?.unwrap_or_else(|| SyncRecord {
        remote_id: page.id.clone(),
        content_hash: String::new(),
        title_hash: String::new(),
        properties_hash: String::new(),
        blocks_hash: String::new(),
        last_sync_time: now,
        last_edited_time_seen: None,
    });

    record.content_hash = hashes.composite;
    record.title_hash = hashes.title;
    record.properties_hash = hashes.properties;
    record.blocks_hash = hashes.blocks;
    record.last_edited_time_seen = page.last_edited_time;
    record.touch(now);

    store.upsert(&record).await?;
    debug!("committed hashes for {}", page.id);
    Ok(())
}
