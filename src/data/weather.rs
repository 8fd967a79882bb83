//! Open-Meteo weather API client
//!
//! This module fetches three forecast resolutions from the Open-Meteo API
//! (15-minutely, hourly and daily), keeps each one in its own private cache
//! with its own lifetime, and assembles them into a [`WeatherData`] filtered
//! relative to the current local day.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::http::{HttpClient, UpstreamError};
use super::source::{FetchError, Source};
use super::Response;
use crate::clock::SharedClock;
use crate::freshness::{FreshnessPolicy, MidnightCapped};

/// Lifetime of the 15-minutely series
const CURRENT_TTL_MINUTES: i64 = 60;

/// Lifetime of the hourly series
const HOURLY_TTL_MINUTES: i64 = 180;

/// Lifetime of the daily series
const DAILY_TTL_MINUTES: i64 = 360;

/// Lifetime of an assembled response
const RESPONSE_TTL_MINUTES: i64 = 15;

/// Hours of history kept in the hourly series
const HOURLY_HISTORY_HOURS: i64 = 4;

/// First day, relative to today, covered by the daily series
const DAILY_FIRST_DAY: u64 = 4;

/// Number of days after the first one in the daily series
const DAILY_SPAN_DAYS: u64 = 3;

/// Forecast model used for the 15-minutely and hourly series
const MODEL: &str = "meteofrance_seamless";

/// Variables requested for the 15-minutely and hourly series
const SLOT_VARIABLES: &str = "temperature_2m,apparent_temperature,is_day,weather_code";

/// Variables requested for the daily series
const DAY_VARIABLES: &str = "weather_code,temperature_2m_max,temperature_2m_min";

/// Time format used by Open-Meteo for sub-daily series
const SLOT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// Conditions at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSlot {
    /// Local time (`YYYY-MM-DDTHH:MM`)
    pub time: String,
    /// Temperature in Celsius
    pub temperature: f64,
    /// Apparent temperature in Celsius
    pub feels_like: f64,
    /// Whether the sun is up
    pub is_day: bool,
    /// WMO weather code
    pub code: i32,
}

/// Forecast summary for one day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherDay {
    /// Local date (`YYYY-MM-DD`)
    pub date: String,
    /// Maximum temperature in Celsius
    pub temp_max: f64,
    /// Minimum temperature in Celsius
    pub temp_min: f64,
    /// WMO weather code
    pub code: i32,
}

/// Assembled weather payload
///
/// Any part may be missing when its series could not be fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherData {
    /// Current conditions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<WeatherSlot>,
    /// Hourly forecast, from a few hours ago to the end of day+3
    pub hourly: Vec<WeatherSlot>,
    /// Daily forecast, day+4 to day+7
    pub daily: Vec<WeatherDay>,
}

/// Settings for the weather source
#[derive(Debug, Clone)]
pub struct WeatherConfig {
    /// Forecast endpoint
    pub api_url: Option<String>,
    /// Latitude coordinate
    pub latitude: f64,
    /// Longitude coordinate
    pub longitude: f64,
    /// Timezone of the location, also passed to Open-Meteo
    pub timezone: Tz,
}

/// One fetched series with its own expiry
#[derive(Debug, Clone)]
struct Cached<T> {
    data: T,
    expires_at: DateTime<Utc>,
}

impl<T> Cached<T> {
    fn new(data: T, now: DateTime<Utc>, ttl_minutes: i64) -> Self {
        Self {
            data,
            expires_at: now + Duration::minutes(ttl_minutes),
        }
    }
}

/// Returns the cached series if it has not expired
fn valid<T>(cached: &Option<Cached<T>>, now: DateTime<Utc>) -> Option<&T> {
    cached
        .as_ref()
        .filter(|cached| now < cached.expires_at)
        .map(|cached| &cached.data)
}

/// Private caches of the three series
#[derive(Debug, Default)]
struct Series {
    current: Option<Cached<Vec<WeatherSlot>>>,
    hourly: Option<Cached<Vec<WeatherSlot>>>,
    daily: Option<Cached<Vec<WeatherDay>>>,
}

/// Source for local weather
pub struct WeatherSource {
    http: HttpClient,
    clock: SharedClock,
    api_url: Option<String>,
    latitude: String,
    longitude: String,
    timezone: Tz,
    /// Held for a whole fetch so each series is requested at most once at a time
    series: Mutex<Series>,
}

impl WeatherSource {
    /// Creates the source from its settings
    pub fn new(config: WeatherConfig, http: HttpClient, clock: SharedClock) -> Self {
        Self {
            http,
            clock,
            api_url: config.api_url,
            latitude: format!("{:.4}", config.latitude),
            longitude: format!("{:.4}", config.longitude),
            timezone: config.timezone,
            series: Mutex::new(Series::default()),
        }
    }

    fn freshness(&self) -> MidnightCapped {
        MidnightCapped {
            ttl: Duration::minutes(RESPONSE_TTL_MINUTES),
            timezone: self.timezone,
        }
    }

    /// Current local wall-clock time
    fn local_now(&self) -> NaiveDateTime {
        self.clock.now().with_timezone(&self.timezone).naive_local()
    }

    /// Starts a forecast request with the location parameters
    fn request(&self, api_url: &str) -> reqwest::RequestBuilder {
        self.http.get(api_url).query(&[
            ("latitude", self.latitude.as_str()),
            ("longitude", self.longitude.as_str()),
            ("timezone", self.timezone.name()),
        ])
    }

    /// Fetches the next two hours in 15-minute steps
    async fn fetch_current(&self, api_url: &str) -> Result<Vec<WeatherSlot>, UpstreamError> {
        #[derive(Deserialize)]
        struct Body {
            minutely_15: SlotSeries,
        }

        let request = self.request(api_url).query(&[
            ("models", MODEL),
            ("minutely_15", SLOT_VARIABLES),
            ("forecast_minutely_15", "8"),
        ]);
        let body: Body = self.http.execute_json(request, Some(open_meteo_error)).await?;
        let slots = body.minutely_15.into_slots()?;
        if slots.is_empty() {
            return Err(UpstreamError::Api("no data".to_string()));
        }
        Ok(slots)
    }

    /// Fetches hourly slots covering the filter window for the series lifetime
    async fn fetch_hourly(&self, api_url: &str) -> Result<Vec<WeatherSlot>, UpstreamError> {
        #[derive(Deserialize)]
        struct Body {
            hourly: SlotSeries,
        }

        let now = self.local_now();
        let start = (now - Duration::hours(HOURLY_HISTORY_HOURS)).date();
        let end = (now
            + Duration::days(3)
            + Duration::minutes(HOURLY_TTL_MINUTES + RESPONSE_TTL_MINUTES))
        .date();

        let request = self.request(api_url).query(&[
            ("models", MODEL.to_string()),
            ("hourly", SLOT_VARIABLES.to_string()),
            ("start_date", start.to_string()),
            ("end_date", end.to_string()),
        ]);
        let body: Body = self.http.execute_json(request, Some(open_meteo_error)).await?;
        body.hourly.into_slots()
    }

    /// Fetches the daily summaries covering the filter window for the series lifetime
    async fn fetch_daily(&self, api_url: &str) -> Result<Vec<WeatherDay>, UpstreamError> {
        #[derive(Deserialize)]
        struct Body {
            daily: DaySeries,
        }

        let now = self.local_now();
        let start = now.date() + Duration::days(DAILY_FIRST_DAY as i64);
        let end = (now
            + Duration::days((DAILY_FIRST_DAY + DAILY_SPAN_DAYS) as i64)
            + Duration::minutes(DAILY_TTL_MINUTES + RESPONSE_TTL_MINUTES))
        .date();

        let request = self.request(api_url).query(&[
            ("daily", DAY_VARIABLES.to_string()),
            ("start_date", start.to_string()),
            ("end_date", end.to_string()),
        ]);
        let body: Body = self.http.execute_json(request, Some(open_meteo_error)).await?;
        body.daily.into_days()
    }

    /// Refreshes expired series and assembles what is available
    async fn assemble(&self, api_url: &str) -> Result<WeatherData, FetchError> {
        let mut series = self.series.lock().await;
        let mut last_error = None;

        if valid(&series.current, self.clock.now()).is_none() {
            match self.fetch_current(api_url).await {
                Ok(slots) => {
                    series.current = Some(Cached::new(slots, self.clock.now(), CURRENT_TTL_MINUTES))
                }
                Err(e) => {
                    warn!(source = "weather", series = "current", error = %e, "fetch failed");
                    last_error = Some(e);
                }
            }
        }
        if valid(&series.hourly, self.clock.now()).is_none() {
            match self.fetch_hourly(api_url).await {
                Ok(slots) => {
                    series.hourly = Some(Cached::new(slots, self.clock.now(), HOURLY_TTL_MINUTES))
                }
                Err(e) => {
                    warn!(source = "weather", series = "hourly", error = %e, "fetch failed");
                    last_error = Some(e);
                }
            }
        }
        if valid(&series.daily, self.clock.now()).is_none() {
            match self.fetch_daily(api_url).await {
                Ok(days) => {
                    series.daily = Some(Cached::new(days, self.clock.now(), DAILY_TTL_MINUTES))
                }
                Err(e) => {
                    warn!(source = "weather", series = "daily", error = %e, "fetch failed");
                    last_error = Some(e);
                }
            }
        }

        let now = self.clock.now();
        let local_now = self.local_now();
        let current = valid(&series.current, now);
        let hourly = valid(&series.hourly, now);
        let daily = valid(&series.daily, now);

        if current.is_none() && hourly.is_none() && daily.is_none() {
            let reason = last_error.map_or_else(|| "no data".to_string(), |e| e.to_string());
            return Err(FetchError::Unavailable(format!(
                "weather unavailable: {}",
                reason
            )));
        }

        debug!(
            source = "weather",
            current = current.is_some(),
            hourly = hourly.is_some(),
            daily = daily.is_some(),
            "series assembled"
        );
        Ok(WeatherData {
            current: current.and_then(|slots| current_slot(slots, local_now)),
            hourly: hourly.map(|slots| hourly_window(slots, local_now)).unwrap_or_default(),
            daily: daily
                .map(|days| daily_window(days, local_now.date()))
                .unwrap_or_default(),
        })
    }
}

/// Column-oriented sub-daily series as returned by Open-Meteo
#[derive(Debug, Deserialize)]
struct SlotSeries {
    #[serde(default)]
    time: Vec<String>,
    #[serde(default)]
    temperature_2m: Vec<f64>,
    #[serde(default)]
    apparent_temperature: Vec<f64>,
    #[serde(default)]
    is_day: Vec<u8>,
    #[serde(default)]
    weather_code: Vec<i32>,
}

impl SlotSeries {
    /// Zips the columns into slots, rejecting columns of different lengths
    fn into_slots(self) -> Result<Vec<WeatherSlot>, UpstreamError> {
        let len = self.time.len();
        if self.temperature_2m.len() != len
            || self.apparent_temperature.len() != len
            || self.is_day.len() != len
            || self.weather_code.len() != len
        {
            return Err(UpstreamError::Api(
                "series arrays have inconsistent lengths".to_string(),
            ));
        }

        Ok(self
            .time
            .into_iter()
            .zip(self.temperature_2m)
            .zip(self.apparent_temperature)
            .zip(self.is_day)
            .zip(self.weather_code)
            .map(
                |((((time, temperature), feels_like), is_day), code)| WeatherSlot {
                    time,
                    temperature,
                    feels_like,
                    is_day: is_day == 1,
                    code,
                },
            )
            .collect())
    }
}

/// Column-oriented daily series as returned by Open-Meteo
#[derive(Debug, Deserialize)]
struct DaySeries {
    #[serde(default)]
    time: Vec<String>,
    #[serde(default)]
    weather_code: Vec<i32>,
    #[serde(default)]
    temperature_2m_max: Vec<f64>,
    #[serde(default)]
    temperature_2m_min: Vec<f64>,
}

impl DaySeries {
    fn into_days(self) -> Result<Vec<WeatherDay>, UpstreamError> {
        let len = self.time.len();
        if self.weather_code.len() != len
            || self.temperature_2m_max.len() != len
            || self.temperature_2m_min.len() != len
        {
            return Err(UpstreamError::Api(
                "series arrays have inconsistent lengths".to_string(),
            ));
        }

        Ok(self
            .time
            .into_iter()
            .zip(self.temperature_2m_max)
            .zip(self.temperature_2m_min)
            .zip(self.weather_code)
            .map(|(((date, temp_max), temp_min), code)| WeatherDay {
                date,
                temp_max,
                temp_min,
                code,
            })
            .collect())
    }
}

fn parse_slot_time(time: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(time, SLOT_TIME_FORMAT).ok()
}

/// Picks the first slot after `now`, or the last one if all are past
fn current_slot(slots: &[WeatherSlot], now: NaiveDateTime) -> Option<WeatherSlot> {
    slots
        .iter()
        .find(|slot| parse_slot_time(&slot.time).is_some_and(|time| time > now))
        .or_else(|| slots.last())
        .cloned()
}

/// Keeps slots from a few hours ago up to midnight starting day+4
fn hourly_window(slots: &[WeatherSlot], now: NaiveDateTime) -> Vec<WeatherSlot> {
    let start = now - Duration::hours(HOURLY_HISTORY_HOURS);
    let end = (now.date() + Duration::days(DAILY_FIRST_DAY as i64))
        .and_hms_opt(0, 0, 0)
        .unwrap_or(now);
    slots
        .iter()
        .filter(|slot| {
            parse_slot_time(&slot.time).is_some_and(|time| time >= start && time <= end)
        })
        .cloned()
        .collect()
}

/// Keeps days day+4 to day+7
fn daily_window(days: &[WeatherDay], today: NaiveDate) -> Vec<WeatherDay> {
    let start = today + Duration::days(DAILY_FIRST_DAY as i64);
    let end = start + Duration::days(DAILY_SPAN_DAYS as i64);
    days.iter()
        .filter(|day| {
            NaiveDate::parse_from_str(&day.date, "%Y-%m-%d")
                .is_ok_and(|date| date >= start && date <= end)
        })
        .cloned()
        .collect()
}

/// Extracts `{"error": true, "reason": …}` from an Open-Meteo body
fn open_meteo_error(body: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: bool,
        #[serde(default)]
        reason: String,
    }

    let body: ErrorBody = serde_json::from_slice(body).ok()?;
    body.error.then_some(body.reason)
}

#[async_trait]
impl Source for WeatherSource {
    fn name(&self) -> &str {
        "weather"
    }

    fn degraded_ttl(&self) -> Duration {
        Duration::hours(24)
    }

    async fn fetch(&self) -> Response {
        let Some(api_url) = self.api_url.as_deref() else {
            return FetchError::not_configured(self.name()).into_response(self.clock.now());
        };

        match self.assemble(api_url).await {
            Ok(data) => {
                let now = self.clock.now();
                let expires_at = self.freshness().expires_at(now, &data);
                Response::success_until(data, now, expires_at)
            }
            Err(e) => e.into_response(self.clock.now()),
        }
    }
}
