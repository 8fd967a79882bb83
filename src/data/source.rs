//! The contract every upstream integration implements

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use super::http::UpstreamError;
use super::Response;

/// One upstream integration producing one data domain on demand
///
/// `fetch` must return within a bounded time and must fold every failure into
/// the returned [`Response`] instead of propagating it.
#[async_trait]
pub trait Source: Send + Sync {
    /// Stable identity, also used as the cache key
    fn name(&self) -> &str;

    /// Computes a fresh response from upstream
    async fn fetch(&self) -> Response;

    /// How long the last success stays servable once fetches start failing
    fn degraded_ttl(&self) -> Duration;
}

/// A source that can also fetch one of its sub-entities on its own
///
/// Sub-entity responses go through the same cache, keyed by [`sub_key`](Self::sub_key).
#[async_trait]
pub trait SubEntitySource: Source {
    /// Whether `id` names a configured sub-entity
    ///
    /// Only valid ids are cached, which keeps the key set bounded.
    fn has_entity(&self, id: usize) -> bool;

    /// Computes a fresh response for one sub-entity
    async fn fetch_one(&self, id: usize) -> Response;

    /// Cache key for a sub-entity
    fn sub_key(&self, id: usize) -> String {
        format!("{}:{}", self.name(), id)
    }
}

/// Why a source could not produce data
///
/// Each kind maps to its own retry TTL so that a broken upstream is neither
/// hammered nor remembered forever.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Missing credentials or settings; no upstream I/O is attempted
    #[error("{0}")]
    Config(String),

    /// Upstream identifiers could not be resolved
    #[error("resolve: {0}")]
    Resolve(#[source] UpstreamError),

    /// One step of an authentication handshake failed
    #[error("auth: {step}: {source}")]
    Auth {
        /// Handshake step that failed
        step: &'static str,
        /// Underlying error
        #[source]
        source: UpstreamError,
    },

    /// Network failure, error status, malformed or provider-reported error
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Upstream answered but had nothing for us
    #[error("{0}")]
    NoData(String),

    /// Upstream answered but nothing usable could be assembled right now
    #[error("{0}")]
    Unavailable(String),

    /// The source itself crashed while fetching
    #[error("internal error")]
    Internal,
}

impl FetchError {
    /// Builds the error returned when a source lacks its settings
    pub fn not_configured(source: &str) -> Self {
        FetchError::Config(format!("{} not configured", source))
    }

    /// How long the resulting error response stays cached
    pub fn retry_ttl(&self) -> Duration {
        match self {
            FetchError::Config(_) | FetchError::Resolve(_) => Duration::hours(1),
            FetchError::Auth { .. }
            | FetchError::Upstream(_)
            | FetchError::NoData(_)
            | FetchError::Internal => Duration::minutes(10),
            FetchError::Unavailable(_) => Duration::minutes(5),
        }
    }

    /// Converts the error into a cacheable error response
    pub fn into_response(self, now: DateTime<Utc>) -> Response {
        let retry_ttl = self.retry_ttl();
        Response::failure(self.to_string(), now, retry_ttl)
    }
}
