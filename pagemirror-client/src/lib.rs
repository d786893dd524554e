//! Resilient API client and tiered cache for PageMirror.
//!
//! Talks to the remote document API over authenticated, paginated JSON
//! requests and absorbs its failure modes so callers don't have to:
//!
//! - **Classification**: every failure maps to an [`ErrorKind`] (status
//!   first, message patterns second) which drives the retry table.
//! - **Retry/backoff**: per-kind schedules; auth and client errors are
//!   never retried.
//! - **Fallback**: once retries are exhausted, a degraded strategy is
//!   picked from the failure kind and a cheap result-size probe.
//! - **Concurrency**: batched requests run under an adaptive limit derived
//!   from memory pressure, hard-capped at 10, degrading to sequential.
//! - **Caching**: a session + persistent tiered cache, with dynamic
//!   responses gated by sync mode so incremental change detection always
//!   sees live timestamps.
//!
//! # Example
//!
//! ```no_run
//! use pagemirror_client::{ApiClient, ClientConfig, MemoryCacheStore, CacheConfig, TieredCache};
//! use pagemirror_types::SyncMode;
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let cache = Arc::new(TieredCache::new(
//!     Arc::new(MemoryCacheStore::new()),
//!     CacheConfig::default(),
//! ));
//! let config = ClientConfig::new("https://api.example.com/v1", "secret-token");
//! let client = ApiClient::new(config, SyncMode::Incremental, cache).unwrap();
//! let me = client.get("/users/me", &serde_json::Value::Null).await;
//! # let _ = me;
//! # }
//! ```

mod blocks;
mod cache;
mod client;
mod concurrency;
mod error;
mod fallback;
mod filter;
mod merger;
mod result;

pub use blocks::BlockTreeBudget;
pub use cache::{
    classify_endpoint, CacheConfig, CacheEntry, CachePolicy, CacheStore, CacheTier,
    MemoryCacheStore, SqliteCacheStore, TieredCache,
};
pub use client::{ApiClient, ClientConfig, API_MAX_PAGE_SIZE, API_VERSION_HEADER};
pub use concurrency::{
    ConcurrencyController, FixedPressure, PressureSource, SystemPressure, HARD_CEILING,
};
pub use error::{classify, truncate_context, ApiError, ClientResult, ErrorKind};
pub use fallback::{
    estimate_from_probe, select_fallback, FallbackStrategy, MEDIUM_DATASET_MAX, SMALL_DATASET_MAX,
};
pub use filter::Filter;
pub use merger::RequestMerger;
pub use result::{ApiOutcome, ApiResult};
