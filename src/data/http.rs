//! Shared HTTP plumbing for upstream APIs
//!
//! Every source talks to its provider through [`HttpClient`], which applies a
//! fixed request timeout, reads the whole body, turns non-2xx statuses into
//! errors and lets each provider plug in its own check for errors embedded in
//! an otherwise successful body.

use reqwest::header::{HeaderMap, ACCEPT, LOCATION, SET_COOKIE};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

/// Ceiling applied to every upstream request
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest body excerpt kept in a status error
const ERROR_BODY_LIMIT: usize = 100;

/// Inspects a response body for a provider-specific error message
pub type ErrorCheck = fn(&[u8]) -> Option<String>;

/// Errors that can occur when talking to an upstream API
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The request could not be built, sent, or its body read
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with an error status
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Truncated response body
        body: String,
    },

    /// The body was not the JSON we expected
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The provider reported an error of its own
    #[error("{0}")]
    Api(String),
}

/// A fully read upstream reply
#[derive(Debug)]
pub struct Reply {
    /// Response headers
    pub headers: HeaderMap,
    /// Raw body
    pub body: Vec<u8>,
}

impl Reply {
    /// Decodes the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, UpstreamError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Returns the value of the cookie `name` set by this reply, if any
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split(';').next())
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| key.trim() == name)
            .map(|(_, value)| value.trim().to_string())
    }
}

/// HTTP client with a bounded timeout, shared by all sources
///
/// Cloning is cheap; both inner clients are reference counted.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    no_redirect: Client,
}

impl HttpClient {
    /// Creates a client using [`UPSTREAM_TIMEOUT`]
    pub fn new() -> Result<Self, UpstreamError> {
        Self::with_timeout(UPSTREAM_TIMEOUT)
    }

    /// Creates a client with a custom timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self, UpstreamError> {
        let client = Client::builder().timeout(timeout).build()?;
        let no_redirect = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            no_redirect,
        })
    }

    /// Starts a GET request expecting JSON
    pub fn get(&self, url: &str) -> RequestBuilder {
        self.client.get(url).header(ACCEPT, "application/json")
    }

    /// Starts a POST request expecting JSON
    pub fn post(&self, url: &str) -> RequestBuilder {
        self.client.post(url).header(ACCEPT, "application/json")
    }

    /// Starts a GET request that will not follow redirects
    pub fn get_no_redirect(&self, url: &str) -> RequestBuilder {
        self.no_redirect.get(url).header(ACCEPT, "application/json")
    }

    /// Sends a request and reads the whole reply
    ///
    /// # Returns
    /// * `Ok(Reply)` for a 2xx/3xx status whose body passes `check`
    /// * `Err(UpstreamError::Status)` for a 4xx/5xx status
    /// * `Err(UpstreamError::Api)` if `check` finds an embedded error
    pub async fn execute(
        &self,
        request: RequestBuilder,
        check: Option<ErrorCheck>,
    ) -> Result<Reply, UpstreamError> {
        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        if status.is_client_error() || status.is_server_error() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: truncate(&body, ERROR_BODY_LIMIT),
            });
        }

        if let Some(message) = check.and_then(|check| check(&body)) {
            return Err(UpstreamError::Api(message));
        }

        Ok(Reply { headers, body })
    }

    /// Sends a request and decodes the JSON reply
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        check: Option<ErrorCheck>,
    ) -> Result<T, UpstreamError> {
        self.execute(request, check).await?.json()
    }

    /// Sends a request built with [`get_no_redirect`](Self::get_no_redirect)
    /// and returns the `Location` it redirects to
    pub async fn redirect_location(&self, request: RequestBuilder) -> Result<String, UpstreamError> {
        let reply = self.execute(request, None).await?;
        reply
            .headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .filter(|location| !location.is_empty())
            .map(str::to_string)
            .ok_or_else(|| UpstreamError::Api("no redirect".to_string()))
    }
}

/// Truncates a body to `max_len` bytes for error messages
fn truncate(body: &[u8], max_len: usize) -> String {
    if body.len() <= max_len {
        return String::from_utf8_lossy(body).into_owned();
    }
    format!("{}...", String::from_utf8_lossy(&body[..max_len]))
}
