//! Indoor temperature sensor client
//!
//! Reads a single JSON document from a sensor on the local network.

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::http::HttpClient;
use super::source::{FetchError, Source};
use super::Response;
use crate::clock::SharedClock;
use crate::freshness::{FlatTtl, FreshnessPolicy};

/// Readings are cheap to refresh and change slowly
fn freshness() -> FlatTtl {
    FlatTtl(Duration::minutes(5))
}

/// Sensor reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureData {
    /// Temperature in Celsius
    pub temperature: f64,
    /// Relative humidity as reported by the sensor
    ///
    /// Not clamped: some sensors report fractional or out-of-range values.
    pub humidity: f64,
    /// Room the sensor is in
    pub location: String,
}

/// Settings for the temperature source
#[derive(Debug, Clone, Default)]
pub struct TemperatureConfig {
    /// URL of the sensor's JSON endpoint
    pub sensor_url: Option<String>,
}

/// Source reading the indoor sensor
pub struct TemperatureSource {
    http: HttpClient,
    clock: SharedClock,
    sensor_url: Option<String>,
}

impl TemperatureSource {
    /// Creates the source from its settings
    pub fn new(config: TemperatureConfig, http: HttpClient, clock: SharedClock) -> Self {
        Self {
            http,
            clock,
            sensor_url: config.sensor_url,
        }
    }

    async fn fetch_reading(&self, url: &str) -> Result<TemperatureData, FetchError> {
        Ok(self.http.execute_json(self.http.get(url), None).await?)
    }
}

#[async_trait]
impl Source for TemperatureSource {
    fn name(&self) -> &str {
        "temperature"
    }

    fn degraded_ttl(&self) -> Duration {
        Duration::hours(4)
    }

    async fn fetch(&self) -> Response {
        let Some(url) = self.sensor_url.as_deref() else {
            return FetchError::not_configured(self.name()).into_response(self.clock.now());
        };

        match self.fetch_reading(url).await {
            Ok(reading) => {
                let now = self.clock.now();
                let expires_at = freshness().expires_at(now, &reading);
                Response::success_until(reading, now, expires_at)
            }
            Err(e) => {
                warn!(source = "temperature", error = %e, "fetch failed");
                e.into_response(self.clock.now())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::data::Payload;
    use httpmock::prelude::*;
    use std::sync::Arc;

    fn source(sensor_url: Option<String>) -> TemperatureSource {
        TemperatureSource::new(
            TemperatureConfig { sensor_url },
            HttpClient::new().unwrap(),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn test_unconfigured_sensor_is_a_config_error() {
        let response = source(None).fetch().await;

        assert!(response.data.is_none());
        assert_eq!(response.error.as_deref(), Some("temperature not configured"));
        assert_eq!(response.expires_at - response.produced_at, Duration::hours(1));
    }

    #[tokio::test]
    async fn test_fetch_reads_sensor_document() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/sensor");
                then.status(200).json_body(serde_json::json!({
                    "temperature": 21.5,
                    "humidity": 45,
                    "location": "Living Room"
                }));
            })
            .await;

        let response = source(Some(server.url("/sensor"))).fetch().await;

        assert!(response.is_success());
        assert_eq!(response.expires_at - response.produced_at, Duration::minutes(5));
        match response.data {
            Some(Payload::Temperature(reading)) => {
                assert_eq!(reading.temperature, 21.5);
                assert_eq!(reading.humidity, 45.0);
                assert_eq!(reading.location, "Living Room");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unusual_humidity_values_are_kept() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/sensor");
                then.status(200).json_body(serde_json::json!({
                    "temperature": 19.0,
                    "humidity": 300,
                    "location": "Cellar"
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/bathroom");
                then.status(200).json_body(serde_json::json!({
                    "temperature": 24.0,
                    "humidity": 67.5,
                    "location": "Bathroom"
                }));
            })
            .await;

        let cellar = source(Some(server.url("/sensor"))).fetch().await;
        let bathroom = source(Some(server.url("/bathroom"))).fetch().await;

        match (cellar.data, bathroom.data) {
            (Some(Payload::Temperature(cellar)), Some(Payload::Temperature(bathroom))) => {
                assert_eq!(cellar.humidity, 300.0);
                assert_eq!(bathroom.humidity, 67.5);
            }
            other => panic!("unexpected payloads: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sensor_error_status_is_transient() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/sensor");
                then.status(500).body("sensor offline");
            })
            .await;

        let response = source(Some(server.url("/sensor"))).fetch().await;

        assert!(response.data.is_none());
        assert_eq!(
            response.error.as_deref(),
            Some("server returned 500: sensor offline")
        );
        assert_eq!(response.expires_at - response.produced_at, Duration::minutes(10));
    }
}
