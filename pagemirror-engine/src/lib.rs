//! Incremental sync engine for PageMirror.
//!
//! Decides *what* to sync and drives the work reliably:
//!
//! - **Change detection** ([`detector`]): SHA-256 content fingerprints with
//!   a timestamp fallback; detection reads, [`commit_hashes`] writes, and
//!   only after the downstream write succeeded.
//! - **Orchestration** ([`orchestrator`]): classifies candidates into
//!   create/update/skip and processes them inline or through the queue.
//! - **Durable batch queue** ([`queue`]): resumable tasks executed one
//!   batch per invocation, with linear retry backoff and a wall-clock
//!   budget per run.
//! - **Persistence boundary** ([`store`]): idempotent key/value stores for
//!   sync records and tasks, in memory or on SQLite.
//!
//! [`SyncService`] wires it all together and exposes the three invocation
//! entry points: `run_sync`, `process_queue`, `enqueue_batch_operation`.

mod detector;
mod error;
mod orchestrator;
mod queue;
mod service;
mod store;

pub use detector::{
    commit_hashes, compute_page_hashes, detect_changes, diff_properties, should_skip, ChangeSet,
    PageHashes, PropertyDiff, TIMESTAMP_TOLERANCE_SECS,
};
pub use error::{EngineError, EngineResult};
pub use orchestrator::{
    parse_remote_page, Orchestrator, PageWriter, SyncContext, SyncPlan, SyncSummary, SYNC_PAGES_OP,
};
pub use queue::{BatchWorker, QueueConfig, QueueManager, QueueRunSummary};
pub use service::SyncService;
pub use store::{
    MemoryRecordStore, MemoryTaskStore, SqliteRecordStore, SqliteTaskStore, SyncRecordStore,
    TaskStore,
};
