//! The engine's invocation entry points.
//!
//! `SyncService` owns the long-lived pieces (stores, cache, queue, client
//! configuration) and builds the per-invocation pieces (API client, sync
//! context) for each call. All entry points are safe to call repeatedly.

use crate::error::{EngineError, EngineResult};
use crate::orchestrator::{
    process_page, Orchestrator, PageError, PageWriter, SyncContext, SyncSummary, SYNC_PAGES_OP,
};
use crate::queue::{BatchWorker, QueueConfig, QueueManager, QueueRunSummary};
use crate::store::{SyncRecordStore, TaskStore};
use anyhow::bail;
use async_trait::async_trait;
use pagemirror_client::{ApiClient, ClientConfig, TieredCache};
use pagemirror_types::{RemotePage, SyncMode, SyncOptions, Task, TaskId, TaskOptions, WorkItem};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Processes queued `sync_pages` batches.
///
/// Work items are serialized page snapshots from the plan; each batch
/// re-resolves block trees and writes through the same path inline syncs
/// use. A fresh client is built per batch so queued work always sees live
/// data.
struct SyncBatchWorker {
    config: ClientConfig,
    cache: Arc<TieredCache>,
    records: Arc<dyn SyncRecordStore>,
    writer: Arc<dyn PageWriter>,
}

#[async_trait]
impl BatchWorker for SyncBatchWorker {
    async fn run_batch(&self, operation: &str, items: &[WorkItem]) -> anyhow::Result<Value> {
        if operation != SYNC_PAGES_OP {
            bail!("unknown operation {operation:?}");
        }

        let client = ApiClient::new(
            self.config.clone(),
            SyncMode::Incremental,
            self.cache.clone(),
        )?;

        let mut synced = 0usize;
        let mut failures: Vec<String> = Vec::new();
        for item in items {
            let page: RemotePage = serde_json::from_value(item.clone())?;
            match process_page(&client, self.records.as_ref(), self.writer.as_ref(), &page).await
            {
                Ok(()) => synced += 1,
                Err(PageError::Auth(message)) => bail!("authentication failed: {message}"),
                Err(PageError::Other(message)) => {
                    warn!("queued sync failed for one page: {message}");
                    failures.push(message);
                }
            }
        }

        if !failures.is_empty() {
            bail!(
                "{} of {} pages failed, first: {}",
                failures.len(),
                items.len(),
                failures[0]
            );
        }
        Ok(json!({ "synced": synced }))
    }
}

/// Wires the sync engine together and exposes its entry points.
pub struct SyncService {
    config: ClientConfig,
    cache: Arc<TieredCache>,
    records: Arc<dyn SyncRecordStore>,
    writer: Arc<dyn PageWriter>,
    queue: QueueManager,
}

impl SyncService {
    /// Builds a service over the given stores, cache and writer.
    pub fn new(
        config: ClientConfig,
        cache: Arc<TieredCache>,
        records: Arc<dyn SyncRecordStore>,
        tasks: Arc<dyn TaskStore>,
        writer: Arc<dyn PageWriter>,
        queue_config: QueueConfig,
    ) -> Self {
        let worker = Arc::new(SyncBatchWorker {
            config: config.clone(),
            cache: cache.clone(),
            records: records.clone(),
            writer: writer.clone(),
        });
        let queue = QueueManager::new(tasks, worker, queue_config);
        Self {
            config,
            cache,
            records,
            writer,
            queue,
        }
    }

    /// Runs one synchronous sync of a database.
    ///
    /// The session cache tier is scoped to this call and discarded when it
    /// returns, success or not.
    pub async fn run_sync(
        &self,
        database_id: &str,
        mode: SyncMode,
        options: &SyncOptions,
    ) -> EngineResult<SyncSummary> {
        let mut config = self.config.clone();
        config.concurrent_requests = options.concurrent_requests;
        config.timeout = Duration::from_secs(options.timeout_secs);

        let client = ApiClient::new(config, mode, self.cache.clone())
            .map_err(|e| EngineError::Fetch(e.to_string()))?;
        let ctx = SyncContext {
            client: Arc::new(client),
            records: self.records.clone(),
            writer: self.writer.clone(),
        };
        let orchestrator = Orchestrator::new(ctx, self.queue.clone());

        let result = orchestrator.run_sync(database_id, options).await;
        self.cache.clear_session();
        result
    }

    /// Executes one queue invocation.
    pub async fn process_queue(&self) -> EngineResult<QueueRunSummary> {
        self.queue.process_queue().await
    }

    /// Enqueues an arbitrary batch operation.
    pub async fn enqueue_batch_operation(
        &self,
        operation: impl Into<String>,
        items: Vec<WorkItem>,
        options: TaskOptions,
    ) -> EngineResult<TaskId> {
        self.queue.enqueue(operation, items, options).await
    }

    /// Reads a queued task's state.
    pub async fn task_status(&self, id: TaskId) -> EngineResult<Task> {
        self.queue.get_status(id).await
    }

    /// Cancels a pending or retrying task.
    pub async fn cancel_task(&self, id: TaskId) -> EngineResult<Task> {
        self.queue.cancel(id).await
    }

    /// Removes old terminal tasks and expired cache entries.
    pub async fn cleanup(&self) -> EngineResult<usize> {
        self.cache.evict_expired();
        self.queue.cleanup().await
    }
}
