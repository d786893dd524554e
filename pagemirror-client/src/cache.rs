//! Tiered response cache.
//!
//! Two tiers: a session tier scoped to one invocation (discarded when the
//! cache is dropped or cleared) and a persistent tier that survives across
//! runs behind the [`CacheStore`] seam. Eviction is TTL-based only.
//!
//! Cacheability of dynamic endpoints is gated by sync mode: incremental
//! sync needs live timestamps for change detection, so dynamic responses
//! are never cached there. Caching one would corrupt staleness decisions.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pagemirror_types::SyncMode;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Which tier an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Cleared at the end of the invocation.
    Session,
    /// Survives across runs.
    Persistent,
}

/// Static classification of an endpoint's cache behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// User identity, database schema. Long TTL, cacheable in every mode.
    Static,
    /// Content queries, children listings. Short TTL, gated by sync mode.
    Dynamic,
    /// Never cached.
    Bypass,
}

/// Classifies an endpoint path.
#[must_use]
pub fn classify_endpoint(endpoint: &str) -> CachePolicy {
    let path = endpoint.split('?').next().unwrap_or(endpoint);
    if path.ends_with("/query") || path.contains("/blocks/") {
        CachePolicy::Dynamic
    } else if path.starts_with("/users") || path.starts_with("/databases") {
        CachePolicy::Static
    } else {
        CachePolicy::Bypass
    }
}

/// A cached response with its TTL.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Cached response body.
    pub value: Value,
    /// Time-to-live from `created_at`.
    pub ttl: Duration,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    /// True once the TTL has elapsed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now - self.created_at;
        age > ChronoDuration::from_std(self.ttl).unwrap_or(ChronoDuration::MAX)
    }
}

/// Persistence seam for the persistent tier.
pub trait CacheStore: Send + Sync {
    /// Reads an entry, if present.
    fn get(&self, key: &str) -> Option<CacheEntry>;
    /// Writes an entry, replacing any existing one.
    fn put(&self, key: &str, entry: CacheEntry);
    /// Removes an entry.
    fn remove(&self, key: &str);
    /// Removes all expired entries, returning how many were dropped.
    fn evict_expired(&self, now: DateTime<Utc>) -> usize;
}

/// In-memory persistent-tier store (tests, single-process runs).
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn put(&self, key: &str, entry: CacheEntry) {
        self.entries.lock().unwrap().insert(key.to_string(), entry);
    }

    fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }
}

/// SQLite-backed persistent-tier store.
pub struct SqliteCacheStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCacheStore {
    /// Opens (or creates) a cache store at the given path.
    pub fn new(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Opens an in-memory cache store (for testing).
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                ttl_secs INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            ",
        )
    }
}

impl CacheStore for SqliteCacheStore {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT value, ttl_secs, created_at FROM cache_entries WHERE key = ?1",
                params![key],
                |row| {
                    let value: String = row.get(0)?;
                    let ttl_secs: i64 = row.get(1)?;
                    let created_at: String = row.get(2)?;
                    Ok((value, ttl_secs, created_at))
                },
            )
            .ok()?;

        let value: Value = serde_json::from_str(&row.0).ok()?;
        let created_at = DateTime::parse_from_rfc3339(&row.2).ok()?.with_timezone(&Utc);
        Some(CacheEntry {
            value,
            ttl: Duration::from_secs(row.1.max(0) as u64),
            created_at,
        })
    }

    fn put(&self, key: &str, entry: CacheEntry) {
        let serialized = match serde_json::to_string(&entry.value) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to serialize cache entry for {key}: {e}");
                return;
            }
        };
        let conn = self.conn.lock().unwrap();
        if let Err(e) = conn.execute(
            "INSERT INTO cache_entries (key, value, ttl_secs, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
               value = excluded.value,
               ttl_secs = excluded.ttl_secs,
               created_at = excluded.created_at",
            params![
                key,
                serialized,
                entry.ttl.as_secs() as i64,
                entry.created_at.to_rfc3339(),
            ],
        ) {
            warn!("failed to write cache entry for {key}: {e}");
        }
    }

    fn remove(&self, key: &str) {
        let conn = self.conn.lock().unwrap();
        if let Err(e) = conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key]) {
            warn!("failed to remove cache entry for {key}: {e}");
        }
    }

    fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let conn = self.conn.lock().unwrap();
        let result: Result<usize, rusqlite::Error> = (|| {
            let mut stmt =
                conn.prepare("SELECT key, ttl_secs, created_at FROM cache_entries")?;
            let rows = stmt.query_map([], |row| {
                let key: String = row.get(0)?;
                let ttl_secs: i64 = row.get(1)?;
                let created_at: String = row.get(2)?;
                Ok((key, ttl_secs, created_at))
            })?;

            let mut stale = Vec::new();
            for row in rows {
                let (key, ttl_secs, created_at) = row?;
                let expired = DateTime::parse_from_rfc3339(&created_at)
                    .map(|c| {
                        now - c.with_timezone(&Utc)
                            > ChronoDuration::seconds(ttl_secs.max(0))
                    })
                    .unwrap_or(true);
                if expired {
                    stale.push(key);
                }
            }
            for key in &stale {
                conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
            }
            Ok(stale.len())
        })();
        result.unwrap_or_else(|e| {
            warn!("cache eviction sweep failed: {e}");
            0
        })
    }
}

/// Cache TTL configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL for static endpoints.
    pub static_ttl: Duration,
    /// TTL for dynamic endpoints outside incremental mode.
    pub dynamic_ttl: Duration,
    /// TTL cap applied to dynamic endpoints in manual mode.
    pub manual_ttl_cap: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            static_ttl: Duration::from_secs(3600),
            dynamic_ttl: Duration::from_secs(300),
            manual_ttl_cap: Duration::from_secs(60),
        }
    }
}

/// The two-tier cache consulted by the API client before network calls.
pub struct TieredCache {
    session: Mutex<HashMap<String, CacheEntry>>,
    persistent: Arc<dyn CacheStore>,
    config: CacheConfig,
}

impl TieredCache {
    /// Creates a cache over the given persistent store.
    pub fn new(persistent: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self {
            session: Mutex::new(HashMap::new()),
            persistent,
            config,
        }
    }

    /// Builds the request-signature key for an endpoint + params + mode.
    #[must_use]
    pub fn request_key(endpoint: &str, params: &Value, mode: SyncMode) -> String {
        format!("{mode}:{endpoint}:{params}")
    }

    /// Effective TTL for a policy in the given mode; `None` means bypass.
    #[must_use]
    pub fn effective_ttl(&self, policy: CachePolicy, mode: SyncMode) -> Option<Duration> {
        match (policy, mode) {
            (CachePolicy::Bypass, _) => None,
            (CachePolicy::Static, _) => Some(self.config.static_ttl),
            (CachePolicy::Dynamic, SyncMode::Incremental) => None,
            (CachePolicy::Dynamic, SyncMode::Manual) => {
                Some(self.config.dynamic_ttl.min(self.config.manual_ttl_cap))
            }
            (CachePolicy::Dynamic, SyncMode::Full) => Some(self.config.dynamic_ttl),
        }
    }

    /// Looks up a cached response for the endpoint, honoring mode gating.
    pub fn lookup(&self, endpoint: &str, params: &Value, mode: SyncMode) -> Option<Value> {
        let policy = classify_endpoint(endpoint);
        self.effective_ttl(policy, mode)?;

        let key = Self::request_key(endpoint, params, mode);
        let now = Utc::now();

        {
            let mut session = self.session.lock().unwrap();
            if let Some(entry) = session.get(&key) {
                if entry.is_expired(now) {
                    session.remove(&key);
                } else {
                    debug!("cache hit (session): {endpoint}");
                    return Some(entry.value.clone());
                }
            }
        }

        if let Some(entry) = self.persistent.get(&key) {
            if entry.is_expired(now) {
                self.persistent.remove(&key);
            } else {
                debug!("cache hit (persistent): {endpoint}");
                return Some(entry.value.clone());
            }
        }
        None
    }

    /// Stores a response, honoring mode gating. Static responses land in
    /// the persistent tier, dynamic ones in the session tier.
    pub fn store(&self, endpoint: &str, params: &Value, mode: SyncMode, value: Value) {
        let policy = classify_endpoint(endpoint);
        let Some(ttl) = self.effective_ttl(policy, mode) else {
            return;
        };
        let key = Self::request_key(endpoint, params, mode);
        let entry = CacheEntry {
            value,
            ttl,
            created_at: Utc::now(),
        };
        match policy {
            CachePolicy::Static => self.persistent.put(&key, entry),
            CachePolicy::Dynamic => {
                self.session.lock().unwrap().insert(key, entry);
            }
            CachePolicy::Bypass => {}
        }
    }

    /// Discards the session tier. Called at the end of an invocation.
    pub fn clear_session(&self) {
        self.session.lock().unwrap().clear();
    }

    /// Sweeps expired entries from both tiers.
    pub fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let mut dropped = {
            let mut session = self.session.lock().unwrap();
            let before = session.len();
            session.retain(|_, e| !e.is_expired(now));
            before - session.len()
        };
        dropped += self.persistent.evict_expired(now);
        dropped
    }
}
