//! Tariff calendar client (RTE "tempo-like" calendars)
//!
//! Fetches the colour of today's and tomorrow's tariff day. Tomorrow's colour
//! is provisional in the morning and definitive later on, so responses expire
//! on a publication schedule rather than a flat TTL.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use chrono_tz::Tz;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::http::{HttpClient, UpstreamError};
use super::source::{FetchError, Source};
use super::Response;
use crate::clock::SharedClock;
use crate::freshness::{local_day_start, FreshnessPolicy, PublicationCutoff};

/// Retry interval while tomorrow's colour is provisional
const RETRY_TTL_MINUTES: i64 = 60;

/// Tokens are renewed this long before they expire
const TOKEN_MARGIN_SECONDS: i64 = 60;

/// Colour of one tariff day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempoDay {
    /// Day in `YYYY-MM-DD` format
    pub date: String,
    /// Lower-case colour (`blue`, `white`, `red`)
    pub color: String,
}

/// Settings for the tempo source
#[derive(Debug, Clone)]
pub struct TempoConfig {
    /// Base URL of the calendar API
    pub api_url: Option<String>,
    /// OAuth token endpoint
    pub auth_url: Option<String>,
    /// Base64 client credentials
    pub auth_token: Option<String>,
    /// Hour from which tomorrow's colour may be published
    pub provisional_hour: u32,
    /// Hour from which tomorrow's colour is definitive
    pub definitive_hour: u32,
    /// Timezone the publication hours are defined in
    pub timezone: Tz,
}

/// Cached OAuth access token
#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

/// Calendar endpoint response
#[derive(Debug, Deserialize)]
struct CalendarResponse {
    tempo_like_calendars: Calendars,
}

#[derive(Debug, Deserialize)]
struct Calendars {
    #[serde(default)]
    values: Vec<CalendarValue>,
}

#[derive(Debug, Deserialize)]
struct CalendarValue {
    start_date: String,
    value: String,
}

/// Source for the tariff calendar
pub struct TempoSource {
    http: HttpClient,
    clock: SharedClock,
    api_url: Option<String>,
    auth_url: Option<String>,
    auth_token: Option<String>,
    timezone: Tz,
    freshness: PublicationCutoff<[TempoDay]>,
    /// Only one token request in flight at a time
    token: Mutex<Option<AccessToken>>,
}

/// Colours carry no completeness marker; only the clock decides
fn never_confirmed(_: &[TempoDay], _: NaiveDate) -> bool {
    false
}

impl TempoSource {
    /// Creates the source from its settings
    ///
    /// Returns `None` if a publication hour is outside `0..24`.
    pub fn new(config: TempoConfig, http: HttpClient, clock: SharedClock) -> Option<Self> {
        let freshness = PublicationCutoff::at_hours(
            config.timezone,
            config.provisional_hour,
            Some(config.definitive_hour),
            Duration::minutes(RETRY_TTL_MINUTES),
            never_confirmed,
        )?;
        Some(Self {
            http,
            clock,
            api_url: config.api_url,
            auth_url: config.auth_url,
            auth_token: config.auth_token,
            timezone: config.timezone,
            freshness,
            token: Mutex::new(None),
        })
    }

    /// Returns a valid access token, requesting a new one if needed
    async fn access_token(&self, auth_url: &str, credentials: &str) -> Result<String, FetchError> {
        let mut token = self.token.lock().await;
        let now = self.clock.now();
        if let Some(current) = token.as_ref() {
            if now + Duration::seconds(TOKEN_MARGIN_SECONDS) < current.expires_at {
                return Ok(current.value.clone());
            }
        }

        let request = self
            .http
            .post(auth_url)
            .header(AUTHORIZATION, format!("Basic {}", credentials));
        let response: TokenResponse = self
            .http
            .execute_json(request, None)
            .await
            .map_err(|source| FetchError::Auth {
                step: "token",
                source,
            })?;

        if response.access_token.is_empty() {
            return Err(FetchError::Auth {
                step: "token",
                source: UpstreamError::Api("no access token".to_string()),
            });
        }

        info!(
            source = "tempo",
            expires_in = response.expires_in,
            "access token obtained"
        );
        let value = response.access_token;
        *token = Some(AccessToken {
            value: value.clone(),
            expires_at: now + Duration::seconds(response.expires_in.max(0)),
        });
        Ok(value)
    }

    /// Fetches today's and tomorrow's colours
    async fn fetch_calendar(
        &self,
        api_url: &str,
        auth_url: &str,
        credentials: &str,
    ) -> Result<Vec<TempoDay>, FetchError> {
        let token = self.access_token(auth_url, credentials).await?;

        let today = self.clock.now().with_timezone(&self.timezone).date_naive();
        let start = day_start(self.timezone, today);
        let end = today
            .checked_add_days(chrono::Days::new(2))
            .map(|day| day_start(self.timezone, day))
            .unwrap_or_else(|| start.clone());

        let request = self
            .http
            .get(&format!("{}/tempo_like_calendars", api_url))
            .query(&[("start_date", start), ("end_date", end)])
            .header(AUTHORIZATION, format!("Bearer {}", token));
        let response: CalendarResponse = self
            .http
            .execute_json(request, Some(rte_error))
            .await?;

        let values = response.tempo_like_calendars.values;
        if values.is_empty() {
            return Err(FetchError::NoData("no tempo data".to_string()));
        }

        Ok(values
            .into_iter()
            .map(|value| TempoDay {
                date: value
                    .start_date
                    .get(..10)
                    .unwrap_or(&value.start_date)
                    .to_string(),
                color: value.value.to_lowercase(),
            })
            .collect())
    }
}

/// Local midnight of `day` formatted as RFC 3339 with offset
fn day_start(timezone: Tz, day: NaiveDate) -> String {
    local_day_start(timezone, day).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Extracts `{"error", "error_description"}` from an RTE response body
fn rte_error(body: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: String,
        #[serde(default)]
        error_description: String,
    }

    let body: ErrorBody = serde_json::from_slice(body).ok()?;
    match (body.error.is_empty(), body.error_description.is_empty()) {
        (true, _) => None,
        (false, true) => Some(body.error),
        (false, false) => Some(format!("{}: {}", body.error, body.error_description)),
    }
}

#[async_trait]
impl Source for TempoSource {
    fn name(&self) -> &str {
        "tempo"
    }

    fn degraded_ttl(&self) -> Duration {
        Duration::hours(24)
    }

    async fn fetch(&self) -> Response {
        let (Some(api_url), Some(auth_url), Some(credentials)) = (
            self.api_url.as_deref(),
            self.auth_url.as_deref(),
            self.auth_token.as_deref(),
        ) else {
            return FetchError::not_configured(self.name()).into_response(self.clock.now());
        };

        match self.fetch_calendar(api_url, auth_url, credentials).await {
            Ok(days) => {
                let now = self.clock.now();
                let expires_at = self.freshness.expires_at(now, days.as_slice());
                Response::success_until(days, now, expires_at)
            }
            Err(e) => {
                warn!(source = "tempo", error = %e, "fetch failed");
                e.into_response(self.clock.now())
            }
        }
    }
}
