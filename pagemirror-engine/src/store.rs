//! Persistence boundary for sync records and tasks.
//!
//! Both stores are idempotent-upsert key/value interfaces, keyed by remote
//! page id and task id respectively. In-memory implementations back tests
//! and single-process runs; the SQLite implementations share one
//! `Arc<Mutex<Connection>>` per store.

use crate::error::EngineResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pagemirror_types::{PageId, SyncRecord, Task, TaskId, TaskStatus};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Key/value store for [`SyncRecord`]s, keyed by remote page id.
#[async_trait]
pub trait SyncRecordStore: Send + Sync {
    /// Reads one record.
    async fn get(&self, id: &PageId) -> EngineResult<Option<SyncRecord>>;
    /// Reads many records in one round trip.
    async fn get_many(&self, ids: &[PageId]) -> EngineResult<HashMap<PageId, SyncRecord>>;
    /// Writes a record, replacing any existing one for the same id.
    async fn upsert(&self, record: &SyncRecord) -> EngineResult<()>;
    /// The earliest `last_sync_time` across all records; seeds the
    /// incremental-mode filter.
    async fn low_water_mark(&self) -> EngineResult<Option<DateTime<Utc>>>;
}

/// Store for queued [`Task`]s, keyed by task id.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Reads one task.
    async fn get(&self, id: TaskId) -> EngineResult<Option<Task>>;
    /// Writes a task, replacing any existing one with the same id.
    async fn put(&self, task: &Task) -> EngineResult<()>;
    /// Pending/retrying tasks due at `now`, ordered by priority descending
    /// then creation time ascending, at most `limit` of them.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> EngineResult<Vec<Task>>;
    /// Removes a task.
    async fn remove(&self, id: TaskId) -> EngineResult<()>;
    /// Every stored task. Used by the cleanup sweep.
    async fn all(&self) -> EngineResult<Vec<Task>>;
}

// ── In-memory implementations ───────────────────────────────────

/// In-memory [`SyncRecordStore`].
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<PageId, SyncRecord>>,
}

impl MemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncRecordStore for MemoryRecordStore {
    async fn get(&self, id: &PageId) -> EngineResult<Option<SyncRecord>> {
        Ok(self.records.lock().unwrap().get(id).cloned())
    }

    async fn get_many(&self, ids: &[PageId]) -> EngineResult<HashMap<PageId, SyncRecord>> {
        let records = self.records.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id).map(|r| (id.clone(), r.clone())))
            .collect())
    }

    async fn upsert(&self, record: &SyncRecord) -> EngineResult<()> {
        self.records
            .lock()
            .unwrap()
            .insert(record.remote_id.clone(), record.clone());
        Ok(())
    }

    async fn low_water_mark(&self) -> EngineResult<Option<DateTime<Utc>>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .map(|r| r.last_sync_time)
            .min())
    }
}

/// In-memory [`TaskStore`].
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, Task>>,
}

impl MemoryTaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get(&self, id: TaskId) -> EngineResult<Option<Task>> {
        Ok(self.tasks.lock().unwrap().get(&id).cloned())
    }

    async fn put(&self, task: &Task) -> EngineResult<()> {
        self.tasks.lock().unwrap().insert(task.id, task.clone());
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> EngineResult<Vec<Task>> {
        let tasks = self.tasks.lock().unwrap();
        let mut due: Vec<Task> = tasks
            .values()
            .filter(|t| {
                matches!(t.status, TaskStatus::Pending | TaskStatus::Retrying) && t.is_due(now)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            b.options
                .priority
                .cmp(&a.options.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn remove(&self, id: TaskId) -> EngineResult<()> {
        self.tasks.lock().unwrap().remove(&id);
        Ok(())
    }

    async fn all(&self) -> EngineResult<Vec<Task>> {
        Ok(self.tasks.lock().unwrap().values().cloned().collect())
    }
}

// ── SQLite implementations ──────────────────────────────────────

/// SQLite-backed [`SyncRecordStore`].
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Opens (or creates) a record store at the given path.
    pub fn new(path: &str) -> EngineResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens an in-memory record store (for testing).
    pub fn open_in_memory() -> EngineResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sync_records (
                remote_id TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL,
                title_hash TEXT NOT NULL,
                properties_hash TEXT NOT NULL,
                blocks_hash TEXT NOT NULL,
                last_sync_time TEXT NOT NULL,
                last_edited_time_seen TEXT
            );
            ",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncRecord> {
        let remote_id: String = row.get(0)?;
        let last_sync_time: String = row.get(5)?;
        let last_edited_time_seen: Option<String> = row.get(6)?;
        Ok(SyncRecord {
            remote_id: PageId::new(remote_id),
            content_hash: row.get(1)?,
            title_hash: row.get(2)?,
            properties_hash: row.get(3)?,
            blocks_hash: row.get(4)?,
            last_sync_time: parse_timestamp(&last_sync_time),
            last_edited_time_seen: last_edited_time_seen.as_deref().map(parse_timestamp),
        })
    }
}

/// Parses a stored RFC 3339 timestamp. A malformed value maps to the Unix
/// epoch, which the detector treats as "needs sync".
fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!("malformed stored timestamp {s:?}: {e}");
            DateTime::<Utc>::UNIX_EPOCH
        })
}

#[async_trait]
impl SyncRecordStore for SqliteRecordStore {
    async fn get(&self, id: &PageId) -> EngineResult<Option<SyncRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT remote_id, content_hash, title_hash, properties_hash, blocks_hash,
                    last_sync_time, last_edited_time_seen
             FROM sync_records WHERE remote_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id.as_str()], Self::row_to_record)?;
        rows.next().transpose().map_err(Into::into)
    }

    async fn get_many(&self, ids: &[PageId]) -> EngineResult<HashMap<PageId, SyncRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT remote_id, content_hash, title_hash, properties_hash, blocks_hash,
                    last_sync_time, last_edited_time_seen
             FROM sync_records WHERE remote_id = ?1",
        )?;
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            let mut rows = stmt.query_map(params![id.as_str()], Self::row_to_record)?;
            if let Some(record) = rows.next().transpose()? {
                found.insert(id.clone(), record);
            }
        }
        Ok(found)
    }

    async fn upsert(&self, record: &SyncRecord) -> EngineResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_records
                 (remote_id, content_hash, title_hash, properties_hash, blocks_hash,
                  last_sync_time, last_edited_time_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(remote_id) DO UPDATE SET
               content_hash = excluded.content_hash,
               title_hash = excluded.title_hash,
               properties_hash = excluded.properties_hash,
               blocks_hash = excluded.blocks_hash,
               last_sync_time = MAX(last_sync_time, excluded.last_sync_time),
               last_edited_time_seen = excluded.last_edited_time_seen",
            params![
                record.remote_id.as_str(),
                record.content_hash,
                record.title_hash,
                record.properties_hash,
                record.blocks_hash,
                record.last_sync_time.to_rfc3339(),
                record.last_edited_time_seen.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    async fn low_water_mark(&self) -> EngineResult<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let min: Option<String> = conn.query_row(
            "SELECT MIN(last_sync_time) FROM sync_records",
            [],
            |row| row.get(0),
        )?;
        Ok(min.as_deref().map(parse_timestamp))
    }
}

/// SQLite-backed [`TaskStore`].
///
/// The full task is stored as JSON; status, priority and scheduling columns
/// are duplicated for the due-task query.
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// Opens (or creates) a task store at the given path.
    pub fn new(path: &str) -> EngineResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens an in-memory task store (for testing).
    pub fn open_in_memory() -> EngineResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                next_run_at TEXT,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (status, next_run_at);
            ",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Processing => "processing",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Retrying => "retrying",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn decode_task(payload: &str) -> EngineResult<Task> {
    serde_json::from_str(payload).map_err(Into::into)
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn get(&self, id: TaskId) -> EngineResult<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM tasks WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        payload.as_deref().map(decode_task).transpose()
    }

    async fn put(&self, task: &Task) -> EngineResult<()> {
        let payload = serde_json::to_string(task)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (id, status, priority, created_at, next_run_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
               status = excluded.status,
               priority = excluded.priority,
               created_at = excluded.created_at,
               next_run_at = excluded.next_run_at,
               payload = excluded.payload",
            params![
                task.id.to_string(),
                status_label(task.status),
                task.options.priority,
                task.created_at.to_rfc3339(),
                task.next_run_at.map(|t| t.to_rfc3339()),
                payload,
            ],
        )?;
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> EngineResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT payload FROM tasks
             WHERE status IN ('pending', 'retrying')
               AND (next_run_at IS NULL OR next_run_at <= ?1)
             ORDER BY priority DESC, created_at ASC
             LIMIT ?2",
        )?;
        let payloads = stmt.query_map(params![now.to_rfc3339(), limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut tasks = Vec::new();
        for payload in payloads {
            tasks.push(decode_task(&payload?)?);
        }
        Ok(tasks)
    }

    async fn remove(&self, id: TaskId) -> EngineResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    async fn all(&self) -> EngineResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT payload FROM tasks")?;
        let payloads = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tasks = Vec::new();
        for payload in payloads {
            tasks.push(decode_task(&payload?)?);
        }
        Ok(tasks)
    }
}
