use pagemirror_client::{
    ApiClient, ApiOutcome, CacheConfig, ClientConfig, ErrorKind, MemoryCacheStore, TieredCache,
};
use pagemirror_types::SyncMode;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use wiremock::matchers::{method, path};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

fn test_client_with_unit(base_url: &str, unit: Duration) -> ApiClient {
    let mut config = ClientConfig::new(base_url, "secret-token");
    config.backoff_unit = unit;
    let cache = Arc::new(TieredCache::new(
        Arc::new(MemoryCacheStore::new()),
        CacheConfig::default(),
    ));
    ApiClient::new(config, SyncMode::Incremental, cache).unwrap()
}

fn test_client(base_url: &str) -> ApiClient {
    test_client_with_unit(base_url, Duration::from_millis(1))
}

/// Records the arrival time of every request it sees, then matches.
struct ArrivalLog(Arc<Mutex<Vec<Instant>>>);

impl Match for ArrivalLog {
    fn matches(&self, _request: &Request) -> bool {
        self.0.lock().unwrap().push(Instant::now());
        true
    }
}

// ── Retry bounds ────────────────────────────────────────────────

#[tokio::test]
async fn server_errors_get_two_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pages/p1"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .expect(3) // 1 attempt + 2 retries
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client.get("/pages/p1", &Value::Null).await;

    assert_eq!(result.outcome, ApiOutcome::Failure);
    assert_eq!(result.error_kind, Some(ErrorKind::Server));
    assert_eq!(result.retry_count, 2);
    assert!(result.data.is_none());
}

#[tokio::test]
async fn network_errors_get_three_retries() {
    // Nothing listens on this port; every attempt is a connection failure.
    let client = test_client("http://127.0.0.1:9");
    let result = client.get("/pages/p1", &Value::Null).await;

    assert_eq!(result.outcome, ApiOutcome::Failure);
    assert_eq!(result.error_kind, Some(ErrorKind::Network));
    assert_eq!(result.retry_count, 3); // 4 total attempts
}

#[tokio::test]
async fn transient_failure_recovers_within_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pages/p1"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pages/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "p1" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client.get("/pages/p1", &Value::Null).await;

    assert_eq!(result.outcome, ApiOutcome::Success);
    assert_eq!(result.retry_count, 1);
    assert_eq!(result.data.unwrap()["id"], "p1");
}

// ── Backoff schedules ───────────────────────────────────────────

#[tokio::test]
async fn server_retry_delays_follow_the_schedule() {
    let unit = Duration::from_millis(50);
    let arrivals = Arc::new(Mutex::new(Vec::new()));
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pages/p1"))
        .and(ArrivalLog(arrivals.clone()))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .expect(3)
        .mount(&server)
        .await;

    let client = test_client_with_unit(&server.uri(), unit);
    let result = client.get("/pages/p1", &Value::Null).await;
    assert_eq!(result.retry_count, 2);

    // Server schedule is [2, 8] units: the second gap is clearly longer
    // than the first.
    let arrivals = arrivals.lock().unwrap();
    assert_eq!(arrivals.len(), 3);
    let first_gap = arrivals[1] - arrivals[0];
    let second_gap = arrivals[2] - arrivals[1];
    assert!(
        first_gap >= 2 * unit && first_gap < 8 * unit,
        "first gap {first_gap:?}"
    );
    assert!(second_gap >= 8 * unit, "second gap {second_gap:?}");
}

#[tokio::test]
async fn network_retries_consume_the_full_backoff_schedule() {
    let unit = Duration::from_millis(20);
    // Nothing listens on this port, so every attempt fails immediately and
    // the elapsed time is dominated by the backoff sleeps.
    let client = test_client_with_unit("http://127.0.0.1:9", unit);

    let started = Instant::now();
    let result = client.get("/pages/p1", &Value::Null).await;

    assert_eq!(result.retry_count, 3);
    // Network schedule is [1, 3, 9] units, 13 in total.
    assert!(started.elapsed() >= 13 * unit, "elapsed {:?}", started.elapsed());
}

// ── Never-retried kinds ─────────────────────────────────────────

#[tokio::test]
async fn auth_errors_are_never_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pages/p1"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client.get("/pages/p1", &Value::Null).await;

    assert_eq!(result.outcome, ApiOutcome::Failure);
    assert_eq!(result.error_kind, Some(ErrorKind::Auth));
    assert_eq!(result.retry_count, 0);
}

#[tokio::test]
async fn client_errors_are_never_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pages/p1"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client.get("/pages/p1", &Value::Null).await;

    assert_eq!(result.outcome, ApiOutcome::Failure);
    assert_eq!(result.error_kind, Some(ErrorKind::Client));
    assert_eq!(result.retry_count, 0);
}

// ── Rate limiting ───────────────────────────────────────────────

#[tokio::test]
async fn rate_limit_exhaustion_falls_back_to_throttled_retry() {
    let server = MockServer::start().await;
    // 1 attempt + 5 retries all rate limited; the throttled retry then
    // succeeds.
    Mock::given(method("GET"))
        .and(path("/pages/p1"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .up_to_n_times(6)
        .expect(6)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pages/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "p1" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client.get("/pages/p1", &Value::Null).await;

    assert_eq!(result.outcome, ApiOutcome::FallbackSuccess);
    assert_eq!(result.error_kind, Some(ErrorKind::RateLimit));
    assert_eq!(result.retry_count, 5);
    assert_eq!(result.data.unwrap()["id"], "p1");
}

// ── Merged requests ─────────────────────────────────────────────

#[tokio::test]
async fn merged_requests_share_the_leaders_retry_count() {
    let server = MockServer::start().await;
    // The first attempt fails; the second succeeds slowly enough for a
    // concurrent identical request to merge behind it.
    Mock::given(method("GET"))
        .and(path("/pages/p1"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pages/p1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "id": "p1" }))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = Arc::new(test_client(&server.uri()));
    let leader = {
        let client = client.clone();
        tokio::spawn(async move { client.get("/pages/p1", &Value::Null).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let follower = client.get("/pages/p1", &Value::Null).await;
    let leader = leader.await.unwrap();

    assert_eq!(leader.outcome, ApiOutcome::Success);
    assert_eq!(follower.outcome, ApiOutcome::Success);
    assert_eq!(leader.retry_count, 1);
    // The follower never touched the wire but reports the retries its
    // result actually cost.
    assert_eq!(follower.retry_count, 1);
}

// ── Error context bounds ────────────────────────────────────────

#[tokio::test]
async fn failure_context_is_size_bounded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pages/p1"))
        .respond_with(ResponseTemplate::new(404).set_body_string("x".repeat(64 * 1024)))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client.get("/pages/p1", &Value::Null).await;

    assert_eq!(result.outcome, ApiOutcome::Failure);
    // 1 KiB payload bound plus the surrounding error message framing.
    assert!(result.context.len() < 1200);
}
