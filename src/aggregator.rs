//! Fetch orchestration over the response cache
//!
//! The [`Aggregator`] owns the registered sources and the shared
//! [`ResponseCache`]. Every fetch goes through the same sequence: serve a
//! fresh cached response if there is one, otherwise call the source, fall
//! back to the backup when the call fails, and store the outcome.
//! [`Aggregator::fetch_all`] runs every source on its own task so that one
//! slow or broken upstream never holds back the others.

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::cli::ConfigError;
use crate::clock::SharedClock;
use crate::data::{serialize_timestamp, FetchError, Response, Source, SubEntitySource};

/// Default ceiling on a single source fetch
pub const DEFAULT_SOURCE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Responses of every source, keyed by source name
///
/// Serializes flat: each source name is a top-level key next to `timestamp`.
#[derive(Debug, Clone, Serialize)]
pub struct Combined {
    /// One entry per registered source
    #[serde(flatten)]
    pub sources: BTreeMap<String, Response>,
    /// When the combined view was assembled
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Runs source fetches through the response cache
pub struct Aggregator {
    /// Registered sources in registration order
    sources: Vec<Arc<dyn Source>>,
    cache: ResponseCache,
    clock: SharedClock,
    /// Ceiling on each source fetch
    timeout: std::time::Duration,
}

impl Aggregator {
    /// Creates an aggregator over `sources`
    ///
    /// # Arguments
    /// * `sources` - Sources to serve; names must be unique
    /// * `cache` - Cache shared by every fetch
    /// * `clock` - Time source for assembly timestamps and timeout errors
    /// * `timeout` - Ceiling on a single source fetch
    ///
    /// # Returns
    /// * `Err(ConfigError::DuplicateSource)` if two sources share a name
    pub fn new(
        sources: Vec<Arc<dyn Source>>,
        cache: ResponseCache,
        clock: SharedClock,
        timeout: std::time::Duration,
    ) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for source in &sources {
            if !seen.insert(source.name().to_string()) {
                return Err(ConfigError::DuplicateSource(source.name().to_string()));
            }
        }
        Ok(Self {
            sources,
            cache,
            clock,
            timeout,
        })
    }

    /// Names of the registered sources, in registration order
    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|source| source.name()).collect()
    }

    /// The cache all fetches go through
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Current time as seen by the cache
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Fetches one source by name through the cache
    ///
    /// Returns `None` if no source has that name.
    pub async fn fetch_cached(&self, name: &str) -> Option<Response> {
        let source = self.sources.iter().find(|source| source.name() == name)?;
        Some(self.fetch_source(source.as_ref()).await)
    }

    /// Fetches one source through the cache
    pub async fn fetch_source(&self, source: &dyn Source) -> Response {
        self.fetch_keyed(source.name(), source.degraded_ttl(), source.fetch())
            .await
    }

    /// Fetches one sub-entity of a source through the cache
    ///
    /// Ids the source does not know are passed through uncached so that bogus
    /// requests cannot grow the key set.
    pub async fn fetch_one<S>(&self, source: &S, id: usize) -> Response
    where
        S: SubEntitySource + ?Sized,
    {
        if !source.has_entity(id) {
            return source.fetch_one(id).await;
        }
        let key = source.sub_key(id);
        self.fetch_keyed(&key, source.degraded_ttl(), source.fetch_one(id))
            .await
    }

    /// Fetches every source concurrently and collects the responses
    ///
    /// Each source runs on its own task. A source that exceeds the timeout or
    /// panics gets an error response like any failed fetch. A task that is
    /// lost outside the fetch itself gets an error response that is not
    /// cached.
    pub async fn fetch_all(self: &Arc<Self>) -> Combined {
        let (names, tasks): (Vec<String>, Vec<JoinHandle<Response>>) = self
            .sources
            .iter()
            .map(|source| {
                let aggregator = Arc::clone(self);
                let source = Arc::clone(source);
                let name = source.name().to_string();
                let task =
                    tokio::spawn(async move { aggregator.fetch_source(source.as_ref()).await });
                (name, task)
            })
            .unzip();

        let results = join_all(tasks).await;

        let sources = names
            .into_iter()
            .zip(results)
            .map(|(name, result)| {
                let response = result.unwrap_or_else(|e| {
                    warn!(source = %name, error = %e, "source task failed");
                    FetchError::Internal.into_response(self.clock.now())
                });
                (name, response)
            })
            .collect();

        Combined {
            sources,
            timestamp: self.clock.now(),
        }
    }

    /// Fetches every source once in the background
    pub fn warm_up(self: &Arc<Self>) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            let combined = aggregator.fetch_all().await;
            let failed: Vec<&str> = combined
                .sources
                .iter()
                .filter(|(_, response)| !response.is_success())
                .map(|(name, _)| name.as_str())
                .collect();
            info!(
                sources = combined.sources.len(),
                failed = ?failed,
                "warm-up complete"
            );
        })
    }

    /// Runs `fetch` unless `key` has a fresh cached response
    ///
    /// Failures, timeouts and panics are masked with the backup when one is
    /// still valid, and the outcome is always stored.
    async fn fetch_keyed<F>(&self, key: &str, degraded_ttl: Duration, fetch: F) -> Response
    where
        F: Future<Output = Response>,
    {
        if let Some(cached) = self.cache.get(key) {
            debug!(key, "cache hit");
            return cached;
        }

        let guarded = AssertUnwindSafe(fetch).catch_unwind();
        let response = match tokio::time::timeout(self.timeout, guarded).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                warn!(key, "source panicked");
                FetchError::Internal.into_response(self.clock.now())
            }
            Err(_) => {
                warn!(key, timeout_secs = self.timeout.as_secs(), "fetch timed out");
                FetchError::Unavailable(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                ))
                .into_response(self.clock.now())
            }
        };

        let response = if response.is_success() {
            response
        } else {
            match self.cache.get_backup(key) {
                Some(backup) => {
                    debug!(key, "serving backup");
                    Response::degraded(backup, response)
                }
                None => response,
            }
        };

        self.cache.set(key, response.clone(), degraded_ttl);
        response
    }
}
