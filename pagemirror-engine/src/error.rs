//! Engine-level errors.

use pagemirror_types::{TaskId, TransitionError};
use thiserror::Error;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the sync engine.
///
/// Per-page failures are counted and reported in summaries, never raised;
/// these variants cover the failures that invalidate a whole operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// SQLite-backed store failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Serialization of a persisted or hashed value failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A task status transition the state machine forbids.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The referenced task does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// Authentication was rejected by the remote API. Aborts the run.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Fetching candidate pages failed past the client's retries and
    /// fallbacks.
    #[error("failed to fetch candidates: {0}")]
    Fetch(String),
}
