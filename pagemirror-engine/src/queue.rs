//! The durable batch queue.
//!
//! Large operations are enqueued as [`Task`]s and drained incrementally:
//! each `process_queue` invocation executes exactly one batch per due task,
//! re-persisting state between batches. Progress therefore survives the
//! short-lived invocations the engine runs in.

use crate::error::{EngineError, EngineResult};
use crate::store::TaskStore;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use pagemirror_client::truncate_context;
use pagemirror_types::{Task, TaskId, TaskOptions, TaskStatus, WorkItem};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Executes one batch of a queued operation.
///
/// A returned error is recorded on the task and retried; it never aborts
/// sibling tasks in the same run.
#[async_trait]
pub trait BatchWorker: Send + Sync {
    /// Runs one batch, returning a result value stored on the task.
    async fn run_batch(&self, operation: &str, items: &[WorkItem]) -> anyhow::Result<Value>;
}

/// Queue processing configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Due tasks picked up per invocation.
    pub max_tasks_per_run: usize,
    /// Wall-clock budget per invocation; the run stops early once spent.
    pub run_budget: Duration,
    /// How long completed and failed tasks are kept before cleanup.
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_run: 10,
            run_budget: Duration::from_secs(30),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Counts from one `process_queue` invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueRunSummary {
    /// Tasks that executed a batch this run.
    pub processed: usize,
    /// Tasks that reached `Completed` this run.
    pub completed: usize,
    /// Tasks that reached `Failed` this run.
    pub failed: usize,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl QueueRunSummary {
    fn record(&mut self, status: TaskStatus) {
        self.processed += 1;
        match status {
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            _ => {}
        }
    }
}

/// Drives queued tasks batch by batch.
#[derive(Clone)]
pub struct QueueManager {
    store: Arc<dyn TaskStore>,
    worker: Arc<dyn BatchWorker>,
    config: QueueConfig,
}

impl QueueManager {
    /// Creates a queue over the given store and worker.
    pub fn new(store: Arc<dyn TaskStore>, worker: Arc<dyn BatchWorker>, config: QueueConfig) -> Self {
        Self {
            store,
            worker,
            config,
        }
    }

    /// Splits `items` into batches and persists a new pending task.
    pub async fn enqueue(
        &self,
        operation: impl Into<String>,
        items: Vec<WorkItem>,
        options: TaskOptions,
    ) -> EngineResult<TaskId> {
        let task = Task::new(operation, items, options);
        info!(
            "enqueued {} ({} items in {} batches)",
            task.operation,
            task.batches.iter().map(Vec::len).sum::<usize>(),
            task.total_batches()
        );
        self.store.put(&task).await?;
        Ok(task.id)
    }

    /// Executes one batch for each due task, within the run budget.
    ///
    /// Safe to call repeatedly; a task whose batch fails is rescheduled
    /// with linear backoff rather than retried within the same run.
    pub async fn process_queue(&self) -> EngineResult<QueueRunSummary> {
        let started = Instant::now();
        let due = self
            .store
            .due(Utc::now(), self.config.max_tasks_per_run)
            .await?;
        debug!("queue run: {} due tasks", due.len());

        let mut summary = QueueRunSummary::default();
        for mut task in due {
            if started.elapsed() >= self.config.run_budget {
                warn!(
                    "queue run budget {:?} spent, deferring remaining tasks",
                    self.config.run_budget
                );
                break;
            }
            task.transition(TaskStatus::Processing)?;
            self.store.put(&task).await?;
            self.run_one_batch(&mut task).await?;
            self.store.put(&task).await?;
            summary.record(task.status);
        }
        summary.duration = started.elapsed();
        Ok(summary)
    }

    async fn run_one_batch(&self, task: &mut Task) -> EngineResult<()> {
        let Some(batch) = task.pending_batch() else {
            task.transition(TaskStatus::Completed)?;
            task.progress = 100;
            return Ok(());
        };
        let batch = batch.to_vec();
        let timeout = Duration::from_secs(task.options.timeout_secs);

        let outcome = match tokio::time::timeout(
            timeout,
            self.worker.run_batch(&task.operation, &batch),
        )
        .await
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err(format!(
                "batch timed out after {}s",
                task.options.timeout_secs
            )),
        };

        match outcome {
            Ok(result) => {
                task.results.push(result);
                task.current_batch += 1;
                task.retry_count = 0;
                task.next_run_at = None;
                task.update_progress();
                if task.current_batch >= task.total_batches() {
                    task.transition(TaskStatus::Completed)?;
                    task.progress = 100;
                    info!("{} ({}) completed", task.operation, task.id);
                } else {
                    task.transition(TaskStatus::Pending)?;
                    debug!(
                        "{} ({}) batch {}/{} done",
                        task.operation,
                        task.id,
                        task.current_batch,
                        task.total_batches()
                    );
                }
            }
            Err(message) => {
                task.errors.push(truncate_context(&message));
                task.retry_count += 1;
                if task.retry_count >= task.options.max_retries {
                    task.transition(TaskStatus::Failed)?;
                    warn!(
                        "{} ({}) failed after {} attempts: {message}",
                        task.operation, task.id, task.retry_count
                    );
                } else {
                    task.transition(TaskStatus::Retrying)?;
                    let delay = task.options.retry_delay_secs * u64::from(task.retry_count);
                    // One wake-up per failure; overwriting next_run_at
                    // keeps exactly one scheduled run pending.
                    task.next_run_at = Some(Utc::now() + ChronoDuration::seconds(delay as i64));
                    warn!(
                        "{} ({}) batch failed (attempt {}), retrying in {delay}s",
                        task.operation, task.id, task.retry_count
                    );
                }
            }
        }
        Ok(())
    }

    /// Reads a task's current state.
    pub async fn get_status(&self, id: TaskId) -> EngineResult<Task> {
        self.store
            .get(id)
            .await?
            .ok_or(EngineError::TaskNotFound(id))
    }

    /// Cancels a pending or retrying task. Anything else is rejected by
    /// the state machine.
    pub async fn cancel(&self, id: TaskId) -> EngineResult<Task> {
        let mut task = self
            .store
            .get(id)
            .await?
            .ok_or(EngineError::TaskNotFound(id))?;
        task.transition(TaskStatus::Cancelled)?;
        self.store.put(&task).await?;
        info!("cancelled {} ({})", task.operation, task.id);
        Ok(task)
    }

    /// Removes terminal tasks older than the retention window. Live tasks
    /// are never touched regardless of age.
    pub async fn cleanup(&self) -> EngineResult<usize> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.retention)
                .unwrap_or_else(|_| ChronoDuration::days(7));
        let mut removed = 0;
        for task in self.store.all().await? {
            if task.status.is_terminal() && task.created_at < cutoff {
                self.store.remove(task.id).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("cleanup removed {removed} old tasks");
        }
        Ok(removed)
    }
}
