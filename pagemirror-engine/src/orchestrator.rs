//! Sync planning and execution.
//!
//! The orchestrator classifies candidate pages into create/update/skip via
//! the change detector, then either processes the work inline (small plans)
//! or hands it to the queue as batched work. It never writes page content
//! itself; the [`PageWriter`] collaborator does, and hashes are committed
//! only after that write is confirmed.

use crate::detector::{commit_hashes, detect_changes, should_skip};
use crate::error::{EngineError, EngineResult};
use crate::queue::QueueManager;
use crate::store::SyncRecordStore;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use pagemirror_client::{
    truncate_context, ApiClient, ApiOutcome, BlockTreeBudget, ErrorKind, Filter,
};
use pagemirror_types::{
    PageId, PropertyValue, RemotePage, SyncMode, SyncOptions, TaskId, TaskOptions,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Queue operation name for batched page syncs.
pub const SYNC_PAGES_OP: &str = "sync_pages";

/// Writes synced pages into the local content store.
#[async_trait]
pub trait PageWriter: Send + Sync {
    /// Persists one page with its resolved block tree.
    async fn write_page(&self, page: &RemotePage) -> anyhow::Result<()>;
}

/// Everything one sync run needs, passed explicitly through the call
/// chain.
#[derive(Clone)]
pub struct SyncContext {
    /// Client constructed for this invocation's sync mode.
    pub client: Arc<ApiClient>,
    /// Sync record store.
    pub records: Arc<dyn SyncRecordStore>,
    /// Downstream page writer.
    pub writer: Arc<dyn PageWriter>,
}

/// Classification of candidate pages for one run.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    /// Pages with no sync record.
    pub to_create: Vec<RemotePage>,
    /// Pages whose content changed since their last sync.
    pub to_update: Vec<RemotePage>,
    /// Pages proven unchanged.
    pub to_skip: Vec<PageId>,
    /// Per-candidate classification problems, size-bounded.
    pub errors: Vec<String>,
}

impl SyncPlan {
    /// Pages that need work, creates first.
    #[must_use]
    pub fn work_items(&self) -> Vec<(&RemotePage, bool)> {
        self.to_create
            .iter()
            .map(|p| (p, true))
            .chain(self.to_update.iter().map(|p| (p, false)))
            .collect()
    }
}

/// Counts reported by one sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    /// Pages synced for the first time.
    pub created: usize,
    /// Pages re-synced after a detected change.
    pub updated: usize,
    /// Pages skipped as unchanged.
    pub skipped: usize,
    /// Pages whose sync failed.
    pub failed: usize,
    /// Per-page error messages, size-bounded.
    pub errors: Vec<String>,
    /// Set when the work was enqueued instead of processed inline.
    pub queued_task: Option<TaskId>,
}

/// Decodes one query-result object into a page snapshot. Returns `None`
/// when the object has no id.
#[must_use]
pub fn parse_remote_page(value: &Value) -> Option<RemotePage> {
    let id = value.get("id")?.as_str()?;
    let mut page = RemotePage::new(id);
    page.created_time = parse_time_field(value, "created_time");
    page.last_edited_time = parse_time_field(value, "last_edited_time");

    if let Some(properties) = value.get("properties").and_then(Value::as_object) {
        for (name, prop) in properties {
            let Some(kind) = prop.get("type").and_then(Value::as_str) else {
                debug!("{id}: property {name:?} has no type tag, skipping");
                continue;
            };
            let payload = prop.get(kind).cloned().unwrap_or(Value::Null);
            page.properties
                .insert(name.clone(), PropertyValue::new(kind, payload));
        }
    }
    Some(page)
}

fn parse_time_field(value: &Value, field: &str) -> Option<DateTime<Utc>> {
    let raw = value.get(field)?.as_str()?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            warn!("malformed {field} {raw:?}: {e}");
            None
        }
    }
}

pub(crate) enum PageError {
    Auth(String),
    Other(String),
}

/// Syncs one page end to end: resolve its block tree, hand it to the
/// writer, then commit hashes.
pub(crate) async fn process_page(
    client: &ApiClient,
    records: &dyn SyncRecordStore,
    writer: &dyn PageWriter,
    page: &RemotePage,
) -> Result<(), PageError> {
    let blocks = client
        .fetch_block_tree(page.id.as_str(), &BlockTreeBudget::default())
        .await
        .map_err(|e| {
            if e.kind() == ErrorKind::Auth {
                PageError::Auth(e.to_string())
            } else {
                PageError::Other(format!("{}: block fetch failed: {e}", page.id))
            }
        })?;

    let mut full = page.clone();
    full.blocks = blocks;

    let record = records
        .get(&full.id)
        .await
        .map_err(|e| PageError::Other(format!("{}: record read failed: {e}", full.id)))?;
    match detect_changes(&full, record.as_ref(), None) {
        Ok(set) if set.is_empty() => debug!("{}: content identical after full fetch", full.id),
        Ok(set) => debug!(
            "{}: changes title={} properties={} blocks={} edited={}",
            full.id, set.title, set.properties, set.blocks, set.last_edited_time
        ),
        Err(e) => warn!("{}: change detection failed: {e}", full.id),
    }

    writer
        .write_page(&full)
        .await
        .map_err(|e| PageError::Other(format!("{}: write failed: {e:#}", full.id)))?;

    commit_hashes(&full, records)
        .await
        .map_err(|e| PageError::Other(format!("{}: hash commit failed: {e}", full.id)))
}

/// Plans and runs syncs for one invocation.
pub struct Orchestrator {
    ctx: SyncContext,
    queue: QueueManager,
}

impl Orchestrator {
    /// Creates an orchestrator over a sync context and queue.
    pub fn new(ctx: SyncContext, queue: QueueManager) -> Self {
        Self { ctx, queue }
    }

    fn candidate_filter(&self, low_water_mark: Option<DateTime<Utc>>) -> Option<Filter> {
        match (self.ctx.client.mode(), low_water_mark) {
            (SyncMode::Incremental, Some(mark)) => Some(Filter::edited_after(mark)),
            _ => None,
        }
    }

    /// Classifies every candidate page in the database into the plan.
    ///
    /// Records are batch-loaded in one round trip; detection problems land
    /// the page conservatively in `to_update`.
    pub async fn plan_sync(&self, database_id: &str) -> EngineResult<SyncPlan> {
        let mark = self.ctx.records.low_water_mark().await?;
        let filter = self.candidate_filter(mark);
        let result = self
            .ctx
            .client
            .query_database(database_id, filter, None)
            .await;

        let candidates = match result.outcome {
            ApiOutcome::Failure => {
                return Err(match result.error_kind {
                    Some(ErrorKind::Auth) => EngineError::Auth(result.context),
                    _ => EngineError::Fetch(result.context),
                });
            }
            _ => result.data.unwrap_or_default(),
        };

        let mut plan = SyncPlan::default();
        let mut pages = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            match parse_remote_page(candidate) {
                Some(page) => pages.push(page),
                None => plan
                    .errors
                    .push(truncate_context("candidate without id, skipped")),
            }
        }

        let ids: Vec<PageId> = pages.iter().map(|p| p.id.clone()).collect();
        let known = self.ctx.records.get_many(&ids).await?;

        for page in pages {
            match known.get(&page.id) {
                None => plan.to_create.push(page),
                Some(record) => {
                    if should_skip(&page, Some(record)) {
                        plan.to_skip.push(page.id);
                    } else {
                        plan.to_update.push(page);
                    }
                }
            }
        }

        info!(
            "plan for {database_id}: {} create, {} update, {} skip",
            plan.to_create.len(),
            plan.to_update.len(),
            plan.to_skip.len()
        );
        Ok(plan)
    }

    /// Plans, then processes inline or enqueues, per `options`.
    ///
    /// Auth failures abort the whole run; any other per-page failure is
    /// counted and reported.
    pub async fn run_sync(
        &self,
        database_id: &str,
        options: &SyncOptions,
    ) -> EngineResult<SyncSummary> {
        let plan = self.plan_sync(database_id).await?;
        let mut summary = SyncSummary {
            skipped: plan.to_skip.len(),
            errors: plan.errors.clone(),
            ..SyncSummary::default()
        };

        let work = plan.work_items();
        if work.len() > options.inline_threshold {
            let items = work
                .iter()
                .map(|(page, _)| serde_json::to_value(page))
                .collect::<Result<Vec<_>, _>>()?;
            let task_id = self
                .queue
                .enqueue(
                    SYNC_PAGES_OP,
                    items,
                    TaskOptions {
                        batch_size: options.batch_size,
                        max_retries: options.max_retries,
                        retry_delay_secs: options.retry_delay_secs,
                        timeout_secs: options.timeout_secs,
                        priority: 0,
                    },
                )
                .await?;
            info!(
                "{database_id}: {} pages enqueued as {task_id}",
                work.len()
            );
            summary.queued_task = Some(task_id);
            return Ok(summary);
        }

        for (page, is_new) in work {
            match process_page(
                &self.ctx.client,
                self.ctx.records.as_ref(),
                self.ctx.writer.as_ref(),
                page,
            )
            .await
            {
                Ok(()) => {
                    if is_new {
                        summary.created += 1;
                    } else {
                        summary.updated += 1;
                    }
                }
                Err(PageError::Auth(message)) => return Err(EngineError::Auth(message)),
                Err(PageError::Other(message)) => {
                    summary.failed += 1;
                    summary.errors.push(truncate_context(&message));
                }
            }
        }

        info!(
            "{database_id}: {} created, {} updated, {} skipped, {} failed",
            summary.created, summary.updated, summary.skipped, summary.failed
        );
        Ok(summary)
    }
}
