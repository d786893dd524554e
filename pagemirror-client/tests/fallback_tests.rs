use pagemirror_client::{
    ApiClient, ApiOutcome, CacheConfig, ClientConfig, ErrorKind, Filter, MemoryCacheStore,
    TieredCache,
};
use pagemirror_types::SyncMode;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

fn test_client(base_url: &str) -> ApiClient {
    let mut config = ClientConfig::new(base_url, "secret-token");
    config.backoff_unit = Duration::from_millis(1);
    let cache = Arc::new(TieredCache::new(
        Arc::new(MemoryCacheStore::new()),
        CacheConfig::default(),
    ));
    ApiClient::new(config, SyncMode::Incremental, cache).unwrap()
}

/// Matches requests whose JSON body contains the given top-level key or
/// substring anywhere in the body.
struct BodyContains(&'static str);

impl Match for BodyContains {
    fn matches(&self, request: &Request) -> bool {
        String::from_utf8_lossy(&request.body).contains(self.0)
    }
}

struct BodyLacks(&'static str);

impl Match for BodyLacks {
    fn matches(&self, request: &Request) -> bool {
        !String::from_utf8_lossy(&request.body).contains(self.0)
    }
}

fn status_filter() -> Filter {
    Filter::property("Status", "select", json!({ "equals": "Done" }))
}

fn combined_filter() -> Filter {
    Filter::and(vec![status_filter(), Filter::edited_after(chrono::Utc::now())]).unwrap()
}

// ── Filter-error fallbacks ──────────────────────────────────────

#[tokio::test]
async fn small_dataset_drops_the_filter() {
    let server = MockServer::start().await;
    // Filtered queries are rejected.
    Mock::given(method("POST"))
        .and(path("/databases/db1/query"))
        .and(BodyContains("filter"))
        .respond_with(ResponseTemplate::new(400).set_body_string("filter validation failed"))
        .expect(2) // 1 attempt + 1 retry
        .mount(&server)
        .await;
    // The probe and the unfiltered full fetch succeed.
    Mock::given(method("POST"))
        .and(path("/databases/db1/query"))
        .and(BodyLacks("filter"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "id": "p1" }, { "id": "p2" }],
            "has_more": false,
            "estimated_count": 50
        })))
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client
        .query_database("db1", Some(status_filter()), None)
        .await;

    assert_eq!(result.outcome, ApiOutcome::FallbackSuccess);
    assert_eq!(result.error_kind, Some(ErrorKind::Filter));
    assert_eq!(result.data.unwrap().len(), 2);
    assert!(result.context.contains("FullSync"));
}

#[tokio::test]
async fn medium_dataset_simplifies_the_filter() {
    let server = MockServer::start().await;
    // Anything carrying a timestamp condition is rejected.
    Mock::given(method("POST"))
        .and(path("/databases/db1/query"))
        .and(BodyContains("last_edited_time"))
        .respond_with(ResponseTemplate::new(400).set_body_string("filter validation failed"))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/databases/db1/query"))
        .and(BodyLacks("last_edited_time"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "id": "p1" }],
            "has_more": false,
            "estimated_count": 500
        })))
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client
        .query_database("db1", Some(combined_filter()), None)
        .await;

    assert_eq!(result.outcome, ApiOutcome::FallbackSuccess);
    assert!(result.context.contains("SimplifiedFilter"));
    assert_eq!(result.data.unwrap().len(), 1);
}

#[tokio::test]
async fn large_dataset_uses_conservative_pagination() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/databases/db1/query"))
        .and(BodyContains("filter"))
        .respond_with(ResponseTemplate::new(400).set_body_string("filter validation failed"))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/databases/db1/query"))
        .and(BodyLacks("filter"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "id": "p1" }],
            "has_more": false,
            "estimated_count": 5000
        })))
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client
        .query_database("db1", Some(status_filter()), None)
        .await;

    assert_eq!(result.outcome, ApiOutcome::FallbackSuccess);
    assert!(result.context.contains("PaginatedSync"));
}

#[tokio::test]
async fn conservative_fallback_keeps_its_small_page_size() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/databases/db1/query"))
        .and(BodyContains("filter"))
        .respond_with(ResponseTemplate::new(400).set_body_string("filter validation failed"))
        .expect(2)
        .mount(&server)
        .await;
    // The size probe reports a large dataset.
    Mock::given(method("POST"))
        .and(path("/databases/db1/query"))
        .and(BodyContains(r#""page_size":1}"#))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "id": "probe" }],
            "has_more": true,
            "estimated_count": 5000
        })))
        .expect(1)
        .mount(&server)
        .await;
    // Every conservative page must request exactly 25 results; a grown
    // page size matches no mock and fails the fetch.
    Mock::given(method("POST"))
        .and(path("/databases/db1/query"))
        .and(BodyContains(r#""page_size":25"#))
        .and(BodyLacks("start_cursor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "id": "p1" }],
            "has_more": true,
            "next_cursor": "c1"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/databases/db1/query"))
        .and(BodyContains(r#""page_size":25"#))
        .and(BodyContains("c1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "id": "p2" }],
            "has_more": true,
            "next_cursor": "c2"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/databases/db1/query"))
        .and(BodyContains(r#""page_size":25"#))
        .and(BodyContains("c2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "id": "p3" }],
            "has_more": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client
        .query_database("db1", Some(status_filter()), None)
        .await;

    assert_eq!(result.outcome, ApiOutcome::FallbackSuccess);
    assert!(result.context.contains("PaginatedSync"));
    assert_eq!(result.data.unwrap().len(), 3);
}

// ── Auth aborts ─────────────────────────────────────────────────

#[tokio::test]
async fn auth_failure_aborts_without_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/databases/db1/query"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client
        .query_database("db1", Some(status_filter()), None)
        .await;

    assert_eq!(result.outcome, ApiOutcome::Failure);
    assert_eq!(result.error_kind, Some(ErrorKind::Auth));
    assert_eq!(result.retry_count, 0);
}

// ── Clean primary path ──────────────────────────────────────────

#[tokio::test]
async fn successful_query_needs_no_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/databases/db1/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "id": "p1" }, { "id": "p2" }],
            "has_more": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client
        .query_database("db1", Some(status_filter()), None)
        .await;

    assert_eq!(result.outcome, ApiOutcome::Success);
    assert_eq!(result.error_kind, None);
    assert_eq!(result.data.unwrap().len(), 2);
}

#[tokio::test]
async fn filterless_query_sends_no_filter_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/databases/db1/query"))
        .and(BodyLacks("filter"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [],
            "has_more": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let result = client.query_database("db1", None, None).await;
    assert_eq!(result.outcome, ApiOutcome::Success);
}
