//! Core data models for the dashboard
//!
//! This module contains the response envelope exchanged between sources and
//! the cache, the payload shapes of every source, and the source clients
//! themselves.

pub mod electricity;
pub mod http;
pub mod source;
pub mod temperature;
pub mod tempo;
pub mod transport;
pub mod weather;

pub use electricity::{Consumption, ElectricityConfig, ElectricityData, ElectricitySource};
pub use http::{HttpClient, UpstreamError};
pub use source::{FetchError, Source, SubEntitySource};
pub use temperature::{TemperatureConfig, TemperatureData, TemperatureSource};
pub use tempo::{TempoConfig, TempoDay, TempoSource};
pub use transport::{
    Departure, Destination, StopConfig, StopData, TransportConfig, TransportData, TransportSource,
};
pub use weather::{WeatherConfig, WeatherData, WeatherDay, WeatherSlot, WeatherSource};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Serialize, Serializer};

/// Payload carried by a successful (or degraded) response
///
/// Each source produces exactly one of these shapes. The cache never looks
/// inside; it only moves the value around.
///
/// Note: This enum only implements `Serialize` (not `Deserialize`) because it
/// is serialized untagged and several shapes would be ambiguous on the way back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    /// Current conditions plus hourly and daily forecasts
    Weather(WeatherData),
    /// Departures for every configured stop
    Transport(TransportData),
    /// Departures for a single stop
    Stop(StopData),
    /// Indoor sensor reading
    Temperature(TemperatureData),
    /// Daily and monthly consumption per tariff
    Electricity(ElectricityData),
    /// Tariff colour per day
    Tempo(Vec<TempoDay>),
}

impl From<WeatherData> for Payload {
    fn from(data: WeatherData) -> Self {
        Payload::Weather(data)
    }
}

impl From<TransportData> for Payload {
    fn from(data: TransportData) -> Self {
        Payload::Transport(data)
    }
}

impl From<StopData> for Payload {
    fn from(data: StopData) -> Self {
        Payload::Stop(data)
    }
}

impl From<TemperatureData> for Payload {
    fn from(data: TemperatureData) -> Self {
        Payload::Temperature(data)
    }
}

impl From<ElectricityData> for Payload {
    fn from(data: ElectricityData) -> Self {
        Payload::Electricity(data)
    }
}

impl From<Vec<TempoDay>> for Payload {
    fn from(data: Vec<TempoDay>) -> Self {
        Payload::Tempo(data)
    }
}

/// The unit exchanged between a source and the cache
///
/// Three shapes reach the HTTP layer:
/// - healthy: `data` present, no `error`
/// - degraded: `data` from the last success alongside the new `error`
/// - failed: `error` only, nothing to render
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    /// Payload, present on success and degraded success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
    /// When the payload was produced, or when the failed attempt was made
    #[serde(rename = "timestamp", serialize_with = "serialize_timestamp")]
    pub produced_at: DateTime<Utc>,
    /// Failure message, present iff the last fetch failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Instant after which this response must not be served as fresh
    #[serde(skip)]
    pub expires_at: DateTime<Utc>,
}

impl Response {
    /// Creates a successful response that stays fresh for `ttl`
    pub fn success(data: impl Into<Payload>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self::success_until(data, now, now + ttl)
    }

    /// Creates a successful response with an explicit expiration instant
    pub fn success_until(
        data: impl Into<Payload>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            data: Some(data.into()),
            produced_at: now,
            error: None,
            expires_at,
        }
    }

    /// Creates an error response retried after `retry_ttl`
    pub fn failure(message: impl Into<String>, now: DateTime<Utc>, retry_ttl: Duration) -> Self {
        Self {
            data: None,
            produced_at: now,
            error: Some(message.into()),
            expires_at: now + retry_ttl,
        }
    }

    /// Copy of a successful response kept for degraded mode
    ///
    /// Keeps the original payload and production time but gets its own,
    /// usually much longer, expiration.
    pub fn backup(&self, now: DateTime<Utc>, degraded_ttl: Duration) -> Self {
        Self {
            data: self.data.clone(),
            produced_at: self.produced_at,
            error: None,
            expires_at: now + degraded_ttl,
        }
    }

    /// Combines backup data with the error of a failed fetch
    ///
    /// The result carries the backup's payload and production time, and the
    /// failure's message and expiration.
    pub fn degraded(backup: Response, failure: Response) -> Self {
        Self {
            data: backup.data,
            produced_at: backup.produced_at,
            error: failure.error,
            expires_at: failure.expires_at,
        }
    }

    /// Whether the fetch that produced this response succeeded
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Whether this response carries stale data alongside an error
    pub fn is_degraded(&self) -> bool {
        self.error.is_some() && self.data.is_some()
    }

    /// Whether this response may still be served as current at `now`
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Serializes an instant as RFC 3339 UTC with second precision (`2025-01-15T12:00:00Z`)
pub fn serialize_timestamp<S: Serializer>(
    timestamp: &DateTime<Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Secs, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reading(value: f64) -> TemperatureData {
        TemperatureData {
            temperature: value,
            humidity: 45.0,
            location: "Living Room".to_string(),
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_success_response_expires_after_ttl() {
        let response = Response::success(reading(21.5), noon(), Duration::minutes(2));

        assert!(response.is_success());
        assert!(!response.is_degraded());
        assert_eq!(response.expires_at, noon() + Duration::minutes(2));
        assert!(response.is_fresh_at(noon() + Duration::seconds(119)));
        assert!(!response.is_fresh_at(noon() + Duration::minutes(2)));
    }

    #[test]
    fn test_failure_response_always_expires() {
        let response = Response::failure("timeout", noon(), Duration::minutes(10));

        assert!(!response.is_success());
        assert!(response.data.is_none());
        assert_eq!(response.expires_at, noon() + Duration::minutes(10));
    }

    #[test]
    fn test_backup_keeps_production_time_with_new_expiry() {
        let original = Response::success(reading(21.5), noon(), Duration::minutes(2));
        let later = noon() + Duration::minutes(1);

        let backup = original.backup(later, Duration::hours(48));

        assert_eq!(backup.data, original.data);
        assert_eq!(backup.produced_at, noon());
        assert_eq!(backup.expires_at, later + Duration::hours(48));
    }

    #[test]
    fn test_degraded_combines_backup_data_and_failure() {
        let backup = Response::success(reading(21.5), noon(), Duration::hours(48));
        let failed_at = noon() + Duration::minutes(5);
        let failure = Response::failure("timeout", failed_at, Duration::minutes(10));

        let degraded = Response::degraded(backup.clone(), failure);

        assert!(degraded.is_degraded());
        assert_eq!(degraded.data, backup.data);
        assert_eq!(degraded.produced_at, noon());
        assert_eq!(degraded.error.as_deref(), Some("timeout"));
        assert_eq!(degraded.expires_at, failed_at + Duration::minutes(10));
    }

    #[test]
    fn test_wire_format_of_healthy_response() {
        let response = Response::success(reading(21.5), noon(), Duration::minutes(5));

        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["timestamp"], "2025-01-15T12:00:00Z");
        assert_eq!(json["data"]["temperature"], 21.5);
        assert!(json.get("error").is_none());
        assert!(json.get("expires_at").is_none());
    }

    #[test]
    fn test_wire_format_of_failed_response_has_no_data() {
        let response = Response::failure("weather not configured", noon(), Duration::hours(1));

        let json = serde_json::to_value(&response).unwrap();

        assert!(json.get("data").is_none());
        assert_eq!(json["error"], "weather not configured");
    }

    #[test]
    fn test_tempo_payload_serializes_as_plain_array() {
        let days = vec![TempoDay {
            date: "2025-01-15".to_string(),
            color: "blue".to_string(),
        }];
        let response = Response::success(days, noon(), Duration::hours(1));

        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["data"][0]["date"], "2025-01-15");
        assert_eq!(json["data"][0]["color"], "blue");
    }
}
