//! The resilient API client.
//!
//! Issues paginated, authenticated JSON requests to the remote document
//! API. Owns retry/backoff per failure classification, fallback-strategy
//! selection, adaptive request concurrency and in-flight request merging.
//! Consults the tiered cache before touching the network.

use crate::cache::TieredCache;
use crate::concurrency::ConcurrencyController;
use crate::error::{truncate_context, ApiError, ClientResult, ErrorKind};
use crate::fallback::{estimate_from_probe, select_fallback, FallbackStrategy};
use crate::filter::Filter;
use crate::merger::RequestMerger;
use crate::result::ApiResult;
use futures::stream::{self, StreamExt};
use pagemirror_types::SyncMode;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Fixed API-version header sent on every request.
pub const API_VERSION_HEADER: &str = "X-Api-Version";

/// The page size the remote API caps results at.
pub const API_MAX_PAGE_SIZE: u32 = 100;

/// API client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the remote API, without a trailing slash.
    pub base_url: String,
    /// Bearer token.
    pub token: String,
    /// Value of the API-version header.
    pub api_version: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Configured concurrent request limit (adaptively reduced, hard
    /// ceiling 10).
    pub concurrent_requests: usize,
    /// Initial page size for paginated queries.
    pub page_size: u32,
    /// One backoff unit. Production keeps the default of one second so the
    /// retry table reads in seconds; tests shrink it.
    pub backoff_unit: Duration,
    /// Page size used by the conservative/paginated fallbacks.
    pub conservative_page_size: u32,
    /// Hard page cap for the conservative/paginated fallbacks.
    pub conservative_page_cap: usize,
    /// Extra delay, in backoff units, before a throttled retry.
    pub throttle_delay_units: u64,
}

impl ClientConfig {
    /// Creates a config with production defaults for the given endpoint
    /// and token.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            api_version: "2024-05".to_string(),
            timeout: Duration::from_secs(30),
            concurrent_requests: 5,
            page_size: API_MAX_PAGE_SIZE,
            backoff_unit: Duration::from_secs(1),
            conservative_page_size: 25,
            conservative_page_cap: 20,
            throttle_delay_units: 5,
        }
    }
}

/// One page of a paginated response.
#[derive(Debug, Clone)]
struct PageBatch {
    results: Vec<Value>,
    has_more: bool,
    next_cursor: Option<String>,
}

fn parse_batch(value: &Value) -> ClientResult<PageBatch> {
    let results = value
        .get("results")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| ApiError::Malformed("response missing results array".to_string()))?;
    let has_more = value.get("has_more").and_then(Value::as_bool).unwrap_or(false);
    let next_cursor = value
        .get("next_cursor")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(PageBatch {
        results,
        has_more,
        next_cursor,
    })
}

/// The resilient API client.
pub struct ApiClient {
    config: ClientConfig,
    mode: SyncMode,
    http: reqwest::Client,
    cache: Arc<TieredCache>,
    merger: RequestMerger,
    concurrency: ConcurrencyController,
}

impl ApiClient {
    /// Creates a client for one sync invocation.
    pub fn new(
        config: ClientConfig,
        mode: SyncMode,
        cache: Arc<TieredCache>,
    ) -> ClientResult<Self> {
        let concurrency = ConcurrencyController::new(config.concurrent_requests);
        Self::with_concurrency(config, mode, cache, concurrency)
    }

    /// Creates a client with an injected concurrency controller.
    pub fn with_concurrency(
        config: ClientConfig,
        mode: SyncMode,
        cache: Arc<TieredCache>,
        concurrency: ConcurrencyController,
    ) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ApiError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            mode,
            http,
            cache,
            merger: RequestMerger::new(),
            concurrency,
        })
    }

    /// The sync mode this client was constructed for.
    #[must_use]
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// The cache layer, exported for collaborators that need to sweep or
    /// clear it.
    #[must_use]
    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url, endpoint)
    }

    // ── Transport ────────────────────────────────────────────────

    async fn handle_response(response: reqwest::Response) -> ClientResult<Value> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| ApiError::Malformed(format!("failed to decode body: {e}")));
        }
        let body = response.text().await.unwrap_or_default();
        let message = truncate_context(&body);
        match status.as_u16() {
            401 | 403 => Err(ApiError::Auth(message)),
            code => Err(ApiError::Rejected {
                status: code,
                message,
            }),
        }
    }

    fn transport_error(e: &reqwest::Error) -> ApiError {
        if e.is_timeout() {
            ApiError::Network(format!("request timed out: {e}"))
        } else if e.is_connect() {
            ApiError::Network(format!("connection refused: {e}"))
        } else {
            ApiError::Network(e.to_string())
        }
    }

    async fn send_get(&self, endpoint: &str, params: &Value) -> ClientResult<Value> {
        let mut request = self
            .http
            .get(self.url(endpoint))
            .bearer_auth(&self.config.token)
            .header(API_VERSION_HEADER, &self.config.api_version);

        if let Some(object) = params.as_object() {
            let pairs: Vec<(String, String)> = object
                .iter()
                .map(|(k, v)| {
                    let rendered = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), rendered)
                })
                .collect();
            request = request.query(&pairs);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Self::transport_error(&e))?;
        Self::handle_response(response).await
    }

    async fn send_post(&self, endpoint: &str, body: &Value) -> ClientResult<Value> {
        let response = self
            .http
            .post(self.url(endpoint))
            .bearer_auth(&self.config.token)
            .header(API_VERSION_HEADER, &self.config.api_version)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::transport_error(&e))?;
        Self::handle_response(response).await
    }

    // ── Retry ────────────────────────────────────────────────────

    /// Runs `attempt` under the per-kind retry table. Returns the final
    /// outcome and how many retries were spent.
    async fn execute_with_retry<F, Fut>(&self, op: &str, attempt: F) -> (ClientResult<Value>, u32)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ClientResult<Value>>,
    {
        let mut retries: u32 = 0;
        loop {
            match attempt().await {
                Ok(value) => {
                    if retries > 0 {
                        info!("{op} succeeded after {retries} retries");
                    }
                    return (Ok(value), retries);
                }
                Err(err) => {
                    let kind = err.kind();
                    if !kind.should_retry() || retries >= kind.max_retries() {
                        return (Err(err), retries);
                    }
                    let units = kind.backoff_schedule()[retries as usize];
                    let delay = self.config.backoff_unit * units as u32;
                    warn!(
                        "{op} failed ({kind:?}), retry {}/{} in {delay:?}: {err}",
                        retries + 1,
                        kind.max_retries()
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
            }
        }
    }

    // ── Single requests ──────────────────────────────────────────

    /// Cache-aware, retried GET of a single endpoint.
    pub async fn get(&self, endpoint: &str, params: &Value) -> ApiResult<Value> {
        let started = Instant::now();

        if let Some(cached) = self.cache.lookup(endpoint, params, self.mode) {
            return ApiResult::success(cached, 0, started.elapsed());
        }

        let key = TieredCache::request_key(endpoint, params, self.mode);
        let (result, retries) = self
            .merger
            .run(&key, || async {
                self.execute_with_retry(endpoint, || self.send_get(endpoint, params))
                    .await
            })
            .await;

        match result {
            Ok(value) => {
                self.cache
                    .store(endpoint, params, self.mode, value.clone());
                ApiResult::success(value, retries, started.elapsed())
            }
            Err(err) => {
                let kind = err.kind();
                if kind == ErrorKind::RateLimit {
                    // Throttled retry: fixed extra delay, one more attempt
                    // at sequential concurrency.
                    let delay = self.config.backoff_unit * self.config.throttle_delay_units as u32;
                    warn!("{endpoint} rate limited, throttled retry in {delay:?}");
                    tokio::time::sleep(delay).await;
                    if let Ok(value) = self.send_get(endpoint, params).await {
                        self.cache
                            .store(endpoint, params, self.mode, value.clone());
                        return ApiResult::fallback(
                            value,
                            kind,
                            retries,
                            started.elapsed(),
                            "throttled retry",
                        );
                    }
                }
                ApiResult::failure(kind, retries, started.elapsed(), &err.to_string())
            }
        }
    }

    /// Fetches every page of a cursor-paginated GET endpoint.
    ///
    /// The page size starts at the configured value and grows toward the
    /// API maximum once the first page completes cleanly.
    pub async fn get_paginated(&self, endpoint: &str, params: &Value) -> ClientResult<Vec<Value>> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        let mut page_size = self.config.page_size.min(API_MAX_PAGE_SIZE);

        loop {
            let mut page_params = params.as_object().cloned().unwrap_or_default();
            page_params.insert("page_size".to_string(), json!(page_size));
            if let Some(c) = &cursor {
                page_params.insert("start_cursor".to_string(), json!(c));
            }
            let page_params = Value::Object(page_params);

            let (result, _) = self
                .execute_with_retry(endpoint, || self.send_get(endpoint, &page_params))
                .await;
            let batch = parse_batch(&result?)?;

            all.extend(batch.results);
            if !batch.has_more {
                break;
            }
            cursor = batch.next_cursor;
            if cursor.is_none() {
                // has_more without a cursor would loop forever.
                warn!("{endpoint}: has_more with no next_cursor, stopping");
                break;
            }
            page_size = (page_size * 2).min(API_MAX_PAGE_SIZE);
        }

        debug!("{endpoint}: fetched {} results", all.len());
        Ok(all)
    }

    /// Fetches every page of a cursor-paginated POST query. A `None`
    /// filter is omitted from the body entirely — the remote rejects `{}`.
    ///
    /// When `grow_page_size` is set the page size doubles toward the API
    /// maximum after each clean page; the conservative fallbacks disable
    /// it so every page stays small.
    ///
    /// Returns the accumulated results and the retries spent; on failure
    /// the error carries the retries spent so far in the second slot.
    #[allow(clippy::too_many_arguments)]
    async fn query_pages(
        &self,
        endpoint: &str,
        filter: Option<&Filter>,
        sorts: Option<&Value>,
        page_size: u32,
        page_cap: Option<usize>,
        inter_page_delay: Option<Duration>,
        grow_page_size: bool,
        with_retry: bool,
    ) -> Result<(Vec<Value>, u32), (ApiError, u32)> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;
        let mut total_retries = 0u32;
        let mut size = page_size.min(API_MAX_PAGE_SIZE);

        loop {
            let mut body = serde_json::Map::new();
            if let Some(filter) = filter {
                let encoded = serde_json::to_value(filter).map_err(|e| {
                    (
                        ApiError::Malformed(format!("failed to encode filter: {e}")),
                        total_retries,
                    )
                })?;
                body.insert("filter".to_string(), encoded);
            }
            if let Some(sorts) = sorts {
                body.insert("sorts".to_string(), sorts.clone());
            }
            body.insert("page_size".to_string(), json!(size));
            if let Some(c) = &cursor {
                body.insert("start_cursor".to_string(), json!(c));
            }
            let body = Value::Object(body);

            let (result, retries) = if with_retry {
                self.execute_with_retry(endpoint, || self.send_post(endpoint, &body))
                    .await
            } else {
                (self.send_post(endpoint, &body).await, 0)
            };
            total_retries += retries;
            let batch = match result.and_then(|v| parse_batch(&v)) {
                Ok(batch) => batch,
                Err(err) => return Err((err, total_retries)),
            };

            all.extend(batch.results);
            pages += 1;

            if !batch.has_more {
                break;
            }
            if let Some(cap) = page_cap {
                if pages >= cap {
                    warn!("{endpoint}: page cap {cap} reached, stopping early");
                    break;
                }
            }
            cursor = batch.next_cursor;
            if cursor.is_none() {
                warn!("{endpoint}: has_more with no next_cursor, stopping");
                break;
            }
            if grow_page_size {
                size = (size * 2).min(API_MAX_PAGE_SIZE);
            }
            if let Some(delay) = inter_page_delay {
                tokio::time::sleep(delay).await;
            }
        }

        Ok((all, total_retries))
    }

    /// Probes the query endpoint for a cheap result-size estimate.
    async fn estimate_result_size(&self, endpoint: &str) -> usize {
        let body = json!({ "page_size": 1 });
        match self.send_post(endpoint, &body).await {
            Ok(probe) => estimate_from_probe(&probe),
            Err(e) => {
                warn!("{endpoint}: probe failed ({e}), assuming large dataset");
                usize::MAX
            }
        }
    }

    // ── Queries with fallback ────────────────────────────────────

    /// Runs a filtered database query, degrading through the fallback
    /// ladder when the primary path exhausts its retries.
    pub async fn query_database(
        &self,
        database_id: &str,
        filter: Option<Filter>,
        sorts: Option<Value>,
    ) -> ApiResult<Vec<Value>> {
        let endpoint = format!("/databases/{database_id}/query");
        let started = Instant::now();

        let primary = self
            .query_pages(
                &endpoint,
                filter.as_ref(),
                sorts.as_ref(),
                self.config.page_size,
                None,
                None,
                true,
                true,
            )
            .await;

        let (err, retries) = match primary {
            Ok((results, retries)) => {
                return ApiResult::success(results, retries, started.elapsed());
            }
            Err((err, retries)) => (err, retries),
        };

        let kind = err.kind();
        if kind == ErrorKind::Auth {
            return ApiResult::failure(kind, retries, started.elapsed(), &err.to_string());
        }

        let estimated = match kind {
            ErrorKind::Filter => self.estimate_result_size(&endpoint).await,
            _ => 0,
        };
        let Some(strategy) = select_fallback(kind, estimated) else {
            return ApiResult::failure(kind, retries, started.elapsed(), &err.to_string());
        };
        info!(
            "{endpoint}: {kind:?} after retries, falling back to {strategy:?} (est {estimated})"
        );

        let fallback = self
            .run_fallback(&endpoint, strategy, filter.as_ref(), sorts.as_ref())
            .await;
        match fallback {
            Some(Ok((results, _))) => ApiResult::fallback(
                results,
                kind,
                retries,
                started.elapsed(),
                &format!("fallback {strategy:?} after {kind:?}"),
            ),
            Some(Err((fallback_err, _))) => ApiResult::failure(
                kind,
                retries,
                started.elapsed(),
                &format!("fallback {strategy:?} failed: {fallback_err}"),
            ),
            None => ApiResult::failure(kind, retries, started.elapsed(), &err.to_string()),
        }
    }

    async fn run_fallback(
        &self,
        endpoint: &str,
        strategy: FallbackStrategy,
        filter: Option<&Filter>,
        sorts: Option<&Value>,
    ) -> Option<Result<(Vec<Value>, u32), (ApiError, u32)>> {
        match strategy {
            FallbackStrategy::FullSync => Some(
                self.query_pages(
                    endpoint,
                    None,
                    sorts,
                    self.config.page_size,
                    None,
                    None,
                    true,
                    true,
                )
                .await,
            ),
            FallbackStrategy::SimplifiedFilter => {
                let simplified = filter.and_then(Filter::simplify);
                if simplified.is_none() {
                    debug!("{endpoint}: nothing left after simplification, full fetch");
                }
                Some(
                    self.query_pages(
                        endpoint,
                        simplified.as_ref(),
                        sorts,
                        self.config.page_size,
                        None,
                        None,
                        true,
                        true,
                    )
                    .await,
                )
            }
            FallbackStrategy::PaginatedSync | FallbackStrategy::ConservativeSync => Some(
                self.query_pages(
                    endpoint,
                    None,
                    sorts,
                    self.config.conservative_page_size,
                    Some(self.config.conservative_page_cap),
                    Some(self.config.backoff_unit),
                    false,
                    true,
                )
                .await,
            ),
            FallbackStrategy::ThrottledRetry => {
                let delay = self.config.backoff_unit * self.config.throttle_delay_units as u32;
                tokio::time::sleep(delay).await;
                // Single attempt: the rate limit already consumed its
                // retry budget.
                Some(
                    self.query_pages(
                        endpoint,
                        filter,
                        sorts,
                        self.config.conservative_page_size,
                        Some(self.config.conservative_page_cap),
                        Some(self.config.backoff_unit),
                        false,
                        false,
                    )
                    .await,
                )
            }
            FallbackStrategy::Abort => None,
        }
    }

    // ── Batched requests ─────────────────────────────────────────

    /// Fetches several endpoints under the adaptive concurrency limit,
    /// preserving input order. Degrades to strictly sequential requests
    /// when the limit is one.
    pub async fn batch_get(&self, endpoints: &[String]) -> Vec<ApiResult<Value>> {
        let limit = self.concurrency.current_limit();
        debug!("batch_get: {} endpoints, concurrency {limit}", endpoints.len());

        if limit <= 1 {
            let mut results = Vec::with_capacity(endpoints.len());
            for endpoint in endpoints {
                results.push(self.get(endpoint, &Value::Null).await);
            }
            return results;
        }

        stream::iter(endpoints)
            .map(|endpoint| self.get(endpoint, &Value::Null))
            .buffered(limit)
            .collect()
            .await
    }
}
