use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use pagemirror_engine::{
    BatchWorker, MemoryTaskStore, QueueConfig, QueueManager, TaskStore,
};
use pagemirror_types::{TaskOptions, TaskStatus, WorkItem};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Worker that counts batches and fails operations listed in `fail_ops`.
#[derive(Default)]
struct ScriptedWorker {
    calls: AtomicUsize,
    fail_ops: Vec<&'static str>,
}

#[async_trait]
impl BatchWorker for ScriptedWorker {
    async fn run_batch(&self, operation: &str, items: &[WorkItem]) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_ops.contains(&operation) {
            anyhow::bail!("scripted failure for {operation}");
        }
        Ok(json!({ "items": items.len() }))
    }
}

fn queue(worker: Arc<ScriptedWorker>) -> (QueueManager, Arc<MemoryTaskStore>) {
    let store = Arc::new(MemoryTaskStore::new());
    let queue = QueueManager::new(store.clone(), worker, QueueConfig::default());
    (queue, store)
}

fn items(n: usize) -> Vec<WorkItem> {
    (0..n).map(|i| json!({ "id": format!("p{i}") })).collect()
}

fn immediate_retry_options() -> TaskOptions {
    TaskOptions {
        retry_delay_secs: 0,
        ..TaskOptions::default()
    }
}

// ── Happy path ──────────────────────────────────────────────────

#[tokio::test]
async fn twenty_five_items_complete_in_three_runs() {
    let worker = Arc::new(ScriptedWorker::default());
    let (queue, _store) = queue(worker.clone());

    let id = queue
        .enqueue("sync_pages", items(25), TaskOptions::default())
        .await
        .unwrap();

    let task = queue.get_status(id).await.unwrap();
    assert_eq!(task.total_batches(), 3);
    assert_eq!(
        task.batches.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![10, 10, 5]
    );

    // One batch per invocation.
    let run = queue.process_queue().await.unwrap();
    assert_eq!(run.processed, 1);
    assert_eq!(run.completed, 0);
    let task = queue.get_status(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.current_batch, 1);
    assert_eq!(task.progress, 33);

    queue.process_queue().await.unwrap();
    let run = queue.process_queue().await.unwrap();
    assert_eq!(run.completed, 1);

    let task = queue.get_status(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
    assert_eq!(task.results.len(), 3);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn empty_task_completes_without_worker_calls() {
    let worker = Arc::new(ScriptedWorker::default());
    let (queue, _store) = queue(worker.clone());

    let id = queue
        .enqueue("sync_pages", vec![], TaskOptions::default())
        .await
        .unwrap();
    queue.process_queue().await.unwrap();

    let task = queue.get_status(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
}

// ── Failure and retry ───────────────────────────────────────────

#[tokio::test]
async fn failed_batches_retry_with_linear_backoff() {
    let worker = Arc::new(ScriptedWorker {
        fail_ops: vec!["sync_pages"],
        ..ScriptedWorker::default()
    });
    let (queue, _store) = queue(worker);

    let options = TaskOptions {
        max_retries: 3,
        retry_delay_secs: 60,
        ..TaskOptions::default()
    };
    let id = queue.enqueue("sync_pages", items(5), options).await.unwrap();

    queue.process_queue().await.unwrap();
    let task = queue.get_status(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Retrying);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.errors.len(), 1);
    // Linear backoff: first retry waits retry_delay * 1.
    let eta = task.next_run_at.unwrap();
    let wait = eta - Utc::now();
    assert!(wait > ChronoDuration::seconds(50) && wait <= ChronoDuration::seconds(60));

    // Not due yet, so the next run leaves it alone.
    let run = queue.process_queue().await.unwrap();
    assert_eq!(run.processed, 0);
}

#[tokio::test]
async fn retries_exhaust_into_failed() {
    let worker = Arc::new(ScriptedWorker {
        fail_ops: vec!["sync_pages"],
        ..ScriptedWorker::default()
    });
    let (queue, _store) = queue(worker.clone());

    let options = TaskOptions {
        max_retries: 2,
        retry_delay_secs: 0,
        ..TaskOptions::default()
    };
    let id = queue.enqueue("sync_pages", items(5), options).await.unwrap();

    queue.process_queue().await.unwrap();
    assert_eq!(
        queue.get_status(id).await.unwrap().status,
        TaskStatus::Retrying
    );

    let run = queue.process_queue().await.unwrap();
    assert_eq!(run.failed, 1);
    let task = queue.get_status(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.errors.len(), 2);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn recorded_errors_are_size_bounded() {
    struct VerboseWorker;
    #[async_trait]
    impl BatchWorker for VerboseWorker {
        async fn run_batch(&self, _op: &str, _items: &[WorkItem]) -> anyhow::Result<Value> {
            anyhow::bail!("{}", "x".repeat(64 * 1024))
        }
    }

    let store = Arc::new(MemoryTaskStore::new());
    let queue = QueueManager::new(store, Arc::new(VerboseWorker), QueueConfig::default());
    let id = queue
        .enqueue("sync_pages", items(1), immediate_retry_options())
        .await
        .unwrap();
    queue.process_queue().await.unwrap();

    let task = queue.get_status(id).await.unwrap();
    assert!(task.errors[0].len() < 1100);
}

#[tokio::test]
async fn one_failing_task_does_not_abort_its_siblings() {
    let worker = Arc::new(ScriptedWorker {
        fail_ops: vec!["bad_op"],
        ..ScriptedWorker::default()
    });
    let (queue, _store) = queue(worker);

    let bad = queue
        .enqueue("bad_op", items(1), immediate_retry_options())
        .await
        .unwrap();
    let good = queue
        .enqueue("sync_pages", items(1), TaskOptions::default())
        .await
        .unwrap();

    let run = queue.process_queue().await.unwrap();
    assert_eq!(run.processed, 2);
    assert_eq!(run.completed, 1);
    assert_eq!(
        queue.get_status(good).await.unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(
        queue.get_status(bad).await.unwrap().status,
        TaskStatus::Retrying
    );
}

// ── Budget ──────────────────────────────────────────────────────

#[tokio::test]
async fn run_budget_stops_the_invocation_early() {
    let worker = Arc::new(ScriptedWorker::default());
    let store = Arc::new(MemoryTaskStore::new());
    let queue = QueueManager::new(
        store,
        worker.clone(),
        QueueConfig {
            run_budget: Duration::ZERO,
            ..QueueConfig::default()
        },
    );

    queue
        .enqueue("sync_pages", items(1), TaskOptions::default())
        .await
        .unwrap();
    let run = queue.process_queue().await.unwrap();

    assert_eq!(run.processed, 0);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
}

// ── Cancellation ────────────────────────────────────────────────

#[tokio::test]
async fn pending_tasks_can_be_cancelled() {
    let worker = Arc::new(ScriptedWorker::default());
    let (queue, _store) = queue(worker.clone());

    let id = queue
        .enqueue("sync_pages", items(5), TaskOptions::default())
        .await
        .unwrap();
    let task = queue.cancel(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);

    // Cancelled tasks are never picked up again.
    let run = queue.process_queue().await.unwrap();
    assert_eq!(run.processed, 0);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn completed_tasks_cannot_be_cancelled() {
    let worker = Arc::new(ScriptedWorker::default());
    let (queue, _store) = queue(worker);

    let id = queue
        .enqueue("sync_pages", items(1), TaskOptions::default())
        .await
        .unwrap();
    queue.process_queue().await.unwrap();

    assert!(queue.cancel(id).await.is_err());
}

// ── Cleanup ─────────────────────────────────────────────────────

#[tokio::test]
async fn cleanup_removes_only_old_terminal_tasks() {
    let worker = Arc::new(ScriptedWorker::default());
    let store = Arc::new(MemoryTaskStore::new());
    let queue = QueueManager::new(store.clone(), worker, QueueConfig::default());

    let mut old_done = pagemirror_types::Task::new("sync_pages", items(1), TaskOptions::default());
    old_done.status = TaskStatus::Completed;
    old_done.created_at = Utc::now() - ChronoDuration::days(8);
    store.put(&old_done).await.unwrap();

    let mut old_live = pagemirror_types::Task::new("sync_pages", items(1), TaskOptions::default());
    old_live.created_at = Utc::now() - ChronoDuration::days(30);
    store.put(&old_live).await.unwrap();

    let mut fresh_done = pagemirror_types::Task::new("sync_pages", items(1), TaskOptions::default());
    fresh_done.status = TaskStatus::Failed;
    store.put(&fresh_done).await.unwrap();

    assert_eq!(queue.cleanup().await.unwrap(), 1);
    assert!(store.get(old_done.id).await.unwrap().is_none());
    assert!(store.get(old_live.id).await.unwrap().is_some());
    assert!(store.get(fresh_done.id).await.unwrap().is_some());
}
