//! In-flight request coalescing.
//!
//! Identical concurrent GETs are merged so only one request is on the wire
//! per signature; the leader executes and every waiter receives a clone of
//! the outcome, retries spent included. The merger is a constructed
//! component owned by the client with an explicit lifecycle — never a
//! process-wide static.

use crate::error::{ApiError, ClientResult};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// Outcome of a merged request: the result plus the retries the leader
/// spent producing it.
type MergedOutcome = (ClientResult<Value>, u32);

/// Coalesces identical concurrent requests by signature.
#[derive(Default)]
pub struct RequestMerger {
    in_flight: Mutex<HashMap<String, Vec<oneshot::Sender<MergedOutcome>>>>,
}

impl RequestMerger {
    /// Creates an empty merger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `fetch` for `key`, unless an identical request is already in
    /// flight — in that case the caller waits for the leader's outcome,
    /// including the leader's retry count.
    pub async fn run<F, Fut>(&self, key: &str, fetch: F) -> MergedOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MergedOutcome>,
    {
        let waiter = {
            let mut map = self.in_flight.lock().await;
            if let Some(waiters) = map.get_mut(key) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            } else {
                map.insert(key.to_string(), Vec::new());
                None
            }
        };

        if let Some(rx) = waiter {
            debug!("merged into in-flight request: {key}");
            return rx.await.unwrap_or_else(|_| {
                (
                    Err(ApiError::Network(
                        "merged request leader was dropped".to_string(),
                    )),
                    0,
                )
            });
        }

        let (result, retries) = fetch().await;

        let waiters = self
            .in_flight
            .lock()
            .await
            .remove(key)
            .unwrap_or_default();
        for tx in waiters {
            let _ = tx.send((result.clone(), retries));
        }
        (result, retries)
    }

    /// Number of distinct requests currently in flight.
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn identical_requests_execute_once() {
        let merger = Arc::new(RequestMerger::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let merger = merger.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                merger
                    .run("GET /users/me", || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            // Hold the slot open long enough for followers
                            // to pile up behind the leader.
                            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                            (Ok(json!({ "id": "user-1" })), 2)
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            let (result, retries) = handle.await.unwrap();
            assert_eq!(result.unwrap()["id"], "user-1");
            // Waiters report the leader's retries, not zero.
            assert_eq!(retries, 2);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(merger.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_merge() {
        let merger = RequestMerger::new();
        let (a, _) = merger.run("GET /a", || async { (Ok(json!(1)), 0) }).await;
        let (b, _) = merger.run("GET /b", || async { (Ok(json!(2)), 0) }).await;
        assert_eq!(a.unwrap(), json!(1));
        assert_eq!(b.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn errors_propagate_to_waiters() {
        let merger = Arc::new(RequestMerger::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let leader = {
            let merger = merger.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                merger
                    .run("GET /fails", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        (Err(ApiError::Network("connection reset".to_string())), 3)
                    })
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let (follower, follower_retries) = {
            let calls = calls.clone();
            merger
                .run("GET /fails", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    (Ok(json!(null)), 0)
                })
                .await
        };

        assert!(leader.await.unwrap().0.is_err());
        assert!(matches!(follower, Err(ApiError::Network(_))));
        assert_eq!(follower_retries, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
