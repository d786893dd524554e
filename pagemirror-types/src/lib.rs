//! Core type definitions for PageMirror.
//!
//! PageMirror mirrors content from a remote, paginated document API into a
//! local content store. This crate holds the data model shared by the API
//! client and the sync engine: remote page snapshots, local sync records,
//! and queued tasks.

mod ids;
mod options;
mod page;
mod record;
mod task;

pub use ids::{PageId, TaskId};
pub use options::{SyncMode, SyncOptions};
pub use page::{Block, PropertyValue, RemotePage};
pub use record::SyncRecord;
pub use task::{Task, TaskOptions, TaskStatus, TransitionError, WorkItem};
