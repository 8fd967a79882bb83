//! Public transport departures client (CTS SIRI API)
//!
//! Stops are configured by line, stop name and destination. They are resolved
//! once into SIRI stop references, then polled for upcoming departures. The
//! departures of each stop are cached privately so the combined view and the
//! per-stop live view can share upstream calls with different maximum ages.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use futures::future::join_all;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::http::{HttpClient, UpstreamError};
use super::source::{FetchError, Source, SubEntitySource};
use super::Response;
use crate::clock::SharedClock;
use crate::freshness::{FlatTtl, FreshnessPolicy};

/// Maximum age of departures in the combined view, and its response TTL
const COMBINED_TTL_SECONDS: i64 = 120;

/// Maximum age of departures in the live view, and its response TTL
const LIVE_TTL_SECONDS: i64 = 20;

/// Retry interval of live lookups that failed
const LIVE_RETRY_SECONDS: i64 = 60;

/// Departures requested per line at each stop
const VISITS_PER_LINE: &str = "4";

fn freshness() -> FlatTtl {
    FlatTtl(Duration::seconds(COMBINED_TTL_SECONDS))
}

/// A stop as configured: line, stop name and direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopConfig {
    /// Line reference (e.g. `A`)
    pub line: String,
    /// Substring of the stop name
    pub name: String,
    /// Substring of a destination served from this stop
    pub destination: String,
}

/// Parses `line,stop name,destination` entries separated by `;`
///
/// Malformed entries are skipped with a warning.
pub fn parse_stops(raw: &str) -> Vec<StopConfig> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let mut parts = entry.splitn(3, ',').map(str::trim);
            match (parts.next(), parts.next(), parts.next()) {
                (Some(line), Some(name), Some(destination))
                    if !line.is_empty() && !name.is_empty() && !destination.is_empty() =>
                {
                    Some(StopConfig {
                        line: line.to_string(),
                        name: name.to_string(),
                        destination: destination.to_string(),
                    })
                }
                _ => {
                    warn!(source = "transport", entry, "invalid stop config");
                    None
                }
            }
        })
        .collect()
}

/// Settings for the transport source
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// SIRI API base URL
    pub api_url: Option<String>,
    /// Base64 credentials for Basic authentication
    pub api_key: Option<String>,
    /// Stops to monitor, in display order
    pub stops: Vec<StopConfig>,
}

/// One upcoming departure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Departure {
    /// Expected departure time, RFC 3339
    pub time: String,
    /// Whether the time comes from live vehicle tracking
    pub realtime: bool,
}

/// Departures towards one destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Destination name as announced
    pub name: String,
    /// Upcoming departures, soonest first
    pub departures: Vec<Departure>,
}

/// Departures at one monitored stop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopData {
    /// Index of the stop in the configuration
    pub id: usize,
    /// Configured stop name
    pub name: String,
    /// Line reference
    pub line: String,
    /// Route colour (`#RRGGBB`)
    pub color: String,
    /// Route text colour (`#RRGGBB`)
    pub color_text: String,
    /// Departures grouped by destination
    pub destinations: Vec<Destination>,
}

/// Departures at every resolved stop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportData {
    pub stops: Vec<StopData>,
}

/// A configured stop after resolution
#[derive(Debug, Clone)]
struct ResolvedStop {
    line: String,
    name: String,
    /// `None` if no upstream stop matched the configuration
    stop_ref: Option<String>,
    color: String,
    color_text: String,
}

/// Departures of one stop with the time they were fetched
#[derive(Debug, Clone)]
struct CachedDepartures {
    destinations: Vec<Destination>,
    fetched_at: DateTime<Utc>,
}

/// Source for public transport departures
pub struct TransportSource {
    http: HttpClient,
    clock: SharedClock,
    api_url: Option<String>,
    api_key: Option<String>,
    stops: Vec<StopConfig>,
    /// Filled by the first successful discovery call
    resolved: OnceCell<Vec<ResolvedStop>>,
    /// Departures per stop index
    departures: RwLock<HashMap<usize, CachedDepartures>>,
}

impl TransportSource {
    /// Creates the source from its settings
    pub fn new(config: TransportConfig, http: HttpClient, clock: SharedClock) -> Self {
        Self {
            http,
            clock,
            api_url: config.api_url,
            api_key: config.api_key,
            stops: config.stops,
            resolved: OnceCell::new(),
            departures: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the API URL and key, or the configuration error
    fn settings(&self) -> Result<(&str, &str), FetchError> {
        match (self.api_url.as_deref(), self.api_key.as_deref()) {
            (Some(url), Some(key)) => Ok((url, key)),
            _ => Err(FetchError::not_configured(self.name())),
        }
    }

    /// Resolves configured stops, calling upstream only until it succeeds once
    async fn resolved_stops(&self, api_url: &str, api_key: &str) -> Result<&[ResolvedStop], FetchError> {
        let stops = self
            .resolved
            .get_or_try_init(|| async {
                let discovered = self
                    .discover(api_url, api_key)
                    .await
                    .map_err(FetchError::Resolve)?;
                Ok::<_, FetchError>(
                    self.stops
                        .iter()
                        .map(|stop| resolve_stop(stop, &discovered))
                        .collect(),
                )
            })
            .await?;
        Ok(stops.as_slice())
    }

    /// Lists every stop point with the lines and destinations it serves
    async fn discover(&self, api_url: &str, api_key: &str) -> Result<Vec<StopPoint>, UpstreamError> {
        let request = self
            .http
            .get(&format!("{}/stoppoints-discovery", api_url))
            .query(&[("includeLinesDestinations", "true")])
            .header(AUTHORIZATION, format!("Basic {}", api_key));
        let body: DiscoveryResponse = self.http.execute_json(request, Some(cts_error)).await?;
        Ok(body.stop_points_delivery.annotated_stop_point_ref)
    }

    /// Builds the payload of one stop from departures at most `max_age` old
    async fn stop_data(
        &self,
        id: usize,
        stop: &ResolvedStop,
        max_age: Duration,
        api_url: &str,
        api_key: &str,
    ) -> Result<StopData, UpstreamError> {
        let destinations = self.departures(id, stop, max_age, api_url, api_key).await?;
        Ok(StopData {
            id,
            name: stop.name.clone(),
            line: stop.line.clone(),
            color: stop.color.clone(),
            color_text: stop.color_text.clone(),
            destinations,
        })
    }

    /// Returns cached departures if recent enough, otherwise fetches them
    async fn departures(
        &self,
        id: usize,
        stop: &ResolvedStop,
        max_age: Duration,
        api_url: &str,
        api_key: &str,
    ) -> Result<Vec<Destination>, UpstreamError> {
        let now = self.clock.now();
        let cached = self
            .departures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .filter(|cached| now - cached.fetched_at < max_age)
            .map(|cached| cached.destinations.clone());
        if let Some(destinations) = cached {
            return Ok(destinations);
        }

        let stop_ref = stop.stop_ref.as_deref().unwrap_or_default();
        let destinations = self
            .fetch_departures(&stop.line, stop_ref, api_url, api_key)
            .await?;

        self.departures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                CachedDepartures {
                    destinations: destinations.clone(),
                    fetched_at: self.clock.now(),
                },
            );
        Ok(destinations)
    }

    /// Fetches upcoming departures of one line at one stop
    async fn fetch_departures(
        &self,
        line: &str,
        stop_ref: &str,
        api_url: &str,
        api_key: &str,
    ) -> Result<Vec<Destination>, UpstreamError> {
        let request = self
            .http
            .get(&format!("{}/stop-monitoring", api_url))
            .query(&[
                ("LineRef", line),
                ("MonitoringRef", stop_ref),
                ("MinimumStopVisitsPerLine", VISITS_PER_LINE),
            ])
            .header(AUTHORIZATION, format!("Basic {}", api_key));
        let body: MonitoringResponse = self.http.execute_json(request, Some(cts_error)).await?;

        let visits = body
            .service_delivery
            .stop_monitoring_delivery
            .into_iter()
            .next()
            .map(|delivery| delivery.monitored_stop_visit)
            .unwrap_or_default();
        Ok(group_by_destination(visits, self.clock.now()))
    }
}

/// Matches a configured stop against the discovered stop points
///
/// The first stop point whose name contains the configured name and which
/// serves the configured line towards a destination containing the
/// configured destination wins.
fn resolve_stop(stop: &StopConfig, discovered: &[StopPoint]) -> ResolvedStop {
    let matched = discovered
        .iter()
        .filter(|point| point.stop_name.contains(&stop.name))
        .flat_map(|point| point.lines.iter().map(move |line| (point, line)))
        .filter(|(_, line)| line.line_ref == stop.line)
        .find(|(_, line)| {
            line.destinations
                .iter()
                .flat_map(|dest| &dest.destination_name)
                .any(|name| name.contains(&stop.destination))
        });

    match matched {
        Some((point, line)) => {
            info!(
                source = "transport",
                line = %stop.line,
                stop = %stop.name,
                stop_ref = %point.stop_point_ref,
                "stop resolved"
            );
            ResolvedStop {
                line: stop.line.clone(),
                name: stop.name.clone(),
                stop_ref: Some(point.stop_point_ref.clone()),
                color: format!("#{}", line.extension.route_color),
                color_text: format!("#{}", line.extension.route_text_color),
            }
        }
        None => {
            warn!(
                source = "transport",
                line = %stop.line,
                stop = %stop.name,
                destination = %stop.destination,
                "stop unresolved"
            );
            ResolvedStop {
                line: stop.line.clone(),
                name: stop.name.clone(),
                stop_ref: None,
                color: String::new(),
                color_text: String::new(),
            }
        }
    }
}

/// Groups future visits by destination name, dropping departures before `now`
fn group_by_destination(visits: Vec<StopVisit>, now: DateTime<Utc>) -> Vec<Destination> {
    let mut by_destination: BTreeMap<String, Vec<Departure>> = BTreeMap::new();
    for visit in visits {
        let journey = visit.monitored_vehicle_journey;
        let call = journey.monitored_call;
        let Ok(time) = DateTime::parse_from_rfc3339(&call.expected_departure_time) else {
            continue;
        };
        if time < now {
            continue;
        }
        by_destination
            .entry(journey.destination_name)
            .or_default()
            .push(Departure {
                time: time.to_rfc3339_opts(SecondsFormat::Secs, true),
                realtime: call.extension.is_real_time,
            });
    }

    by_destination
        .into_iter()
        .map(|(name, departures)| Destination { name, departures })
        .collect()
}

/// Extracts `{"error": …}` from a CTS response body
fn cts_error(body: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: String,
    }

    let body: ErrorBody = serde_json::from_slice(body).ok()?;
    (!body.error.is_empty()).then_some(body.error)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiscoveryResponse {
    #[serde(default)]
    stop_points_delivery: StopPointsDelivery,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StopPointsDelivery {
    #[serde(default)]
    annotated_stop_point_ref: Vec<StopPoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StopPoint {
    #[serde(default)]
    stop_point_ref: String,
    #[serde(default)]
    stop_name: String,
    #[serde(default)]
    lines: Vec<StopLine>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StopLine {
    #[serde(default)]
    line_ref: String,
    #[serde(default)]
    destinations: Vec<LineDestination>,
    #[serde(default)]
    extension: LineExtension,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LineDestination {
    #[serde(default)]
    destination_name: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LineExtension {
    #[serde(default)]
    route_color: String,
    #[serde(default)]
    route_text_color: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MonitoringResponse {
    #[serde(default)]
    service_delivery: ServiceDelivery,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceDelivery {
    #[serde(default)]
    stop_monitoring_delivery: Vec<MonitoringDelivery>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MonitoringDelivery {
    #[serde(default)]
    monitored_stop_visit: Vec<StopVisit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StopVisit {
    monitored_vehicle_journey: VehicleJourney,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VehicleJourney {
    #[serde(default)]
    destination_name: String,
    monitored_call: MonitoredCall,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MonitoredCall {
    #[serde(default)]
    expected_departure_time: String,
    #[serde(default)]
    extension: CallExtension,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallExtension {
    #[serde(default)]
    is_real_time: bool,
}

#[async_trait]
impl Source for TransportSource {
    fn name(&self) -> &str {
        "transport"
    }

    fn degraded_ttl(&self) -> Duration {
        Duration::hours(1)
    }

    async fn fetch(&self) -> Response {
        let (api_url, api_key) = match self.settings() {
            Ok(settings) => settings,
            Err(e) => return e.into_response(self.clock.now()),
        };
        if self.stops.is_empty() {
            return FetchError::Config("no stops configured".to_string())
                .into_response(self.clock.now());
        }
        let resolved = match self.resolved_stops(api_url, api_key).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(source = "transport", error = %e, "fetch failed");
                return e.into_response(self.clock.now());
            }
        };

        let max_age = Duration::seconds(COMBINED_TTL_SECONDS);
        let lookups = resolved
            .iter()
            .enumerate()
            .filter(|(_, stop)| stop.stop_ref.is_some())
            .map(|(id, stop)| async move {
                let result = self.stop_data(id, stop, max_age, api_url, api_key).await;
                if let Err(e) = &result {
                    warn!(source = "transport", line = %stop.line, stop = %stop.name, error = %e, "departures failed");
                }
                result.ok()
            });
        let stops: Vec<StopData> = join_all(lookups).await.into_iter().flatten().collect();

        let now = self.clock.now();
        if stops.is_empty() {
            return FetchError::Unavailable("no departure data".to_string()).into_response(now);
        }
        let data = TransportData { stops };
        let expires_at = freshness().expires_at(now, &data);
        Response::success_until(data, now, expires_at)
    }
}

#[async_trait]
impl SubEntitySource for TransportSource {
    fn has_entity(&self, id: usize) -> bool {
        id < self.stops.len()
    }

    async fn fetch_one(&self, id: usize) -> Response {
        let (api_url, api_key) = match self.settings() {
            Ok(settings) => settings,
            Err(e) => return e.into_response(self.clock.now()),
        };
        let retry = Duration::seconds(LIVE_RETRY_SECONDS);
        if !self.has_entity(id) {
            return Response::failure("invalid stop", self.clock.now(), retry);
        }
        let resolved = match self.resolved_stops(api_url, api_key).await {
            Ok(resolved) => resolved,
            Err(e) => return e.into_response(self.clock.now()),
        };
        let Some(stop) = resolved.get(id).filter(|stop| stop.stop_ref.is_some()) else {
            return Response::failure("invalid stop", self.clock.now(), retry);
        };

        let live = Duration::seconds(LIVE_TTL_SECONDS);
        match self.stop_data(id, stop, live, api_url, api_key).await {
            Ok(data) => Response::success(data, self.clock.now(), live),
            Err(e) => {
                warn!(source = "transport", line = %stop.line, stop = %stop.name, error = %e, "departures failed");
                Response::failure("fetch failed", self.clock.now(), retry)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::data::Payload;
    use chrono::TimeZone;
    use httpmock::prelude::*;
    use std::sync::Arc;

    fn stops() -> Vec<StopConfig> {
        parse_stops("A,Homme de Fer,Hautepierre; D,Etoile,Kehl")
    }

    fn source_with(server: Option<&MockServer>, stops: Vec<StopConfig>) -> (TransportSource, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap());
        let config = TransportConfig {
            api_url: server.map(|s| s.url("/api/v1/siri/2.0")),
            api_key: server.map(|_| "a2V5Og==".to_string()),
            stops,
        };
        let source =
            TransportSource::new(config, HttpClient::new().unwrap(), Arc::new(clock.clone()));
        (source, clock)
    }

    async fn mock_discovery(server: &MockServer) -> httpmock::Mock<'_> {
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/v1/siri/2.0/stoppoints-discovery")
                    .header("authorization", "Basic a2V5Og==");
                then.status(200).json_body(serde_json::json!({
                    "StopPointsDelivery": {
                        "AnnotatedStopPointRef": [
                            {
                                "StopPointRef": "HDF_A1",
                                "StopName": "Homme de Fer",
                                "Lines": [{
                                    "LineRef": "A",
                                    "Destinations": [{"DestinationName": ["Illkirch Graffenstaden"]}],
                                    "Extension": {"RouteColor": "E10D19", "RouteTextColor": "FFFFFF"}
                                }]
                            },
                            {
                                "StopPointRef": "HDF_A2",
                                "StopName": "Homme de Fer",
                                "Lines": [{
                                    "LineRef": "A",
                                    "Destinations": [{"DestinationName": ["Hautepierre Maillon"]}],
                                    "Extension": {"RouteColor": "E10D19", "RouteTextColor": "FFFFFF"}
                                }]
                            }
                        ]
                    }
                }));
            })
            .await
    }

    async fn mock_monitoring(server: &MockServer) -> httpmock::Mock<'_> {
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/v1/siri/2.0/stop-monitoring")
                    .query_param("MonitoringRef", "HDF_A2")
                    .query_param("LineRef", "A")
                    .query_param("MinimumStopVisitsPerLine", "4");
                then.status(200).json_body(serde_json::json!({
                    "ServiceDelivery": {
                        "StopMonitoringDelivery": [{
                            "MonitoredStopVisit": [
                                {"MonitoredVehicleJourney": {
                                    "DestinationName": "Hautepierre Maillon",
                                    "MonitoredCall": {
                                        "ExpectedDepartureTime": "2025-01-15T12:55:00+01:00",
                                        "Extension": {"IsRealTime": true}
                                    }
                                }},
                                {"MonitoredVehicleJourney": {
                                    "DestinationName": "Hautepierre Maillon",
                                    "MonitoredCall": {
                                        "ExpectedDepartureTime": "2025-01-15T13:04:00+01:00",
                                        "Extension": {"IsRealTime": true}
                                    }
                                }},
                                {"MonitoredVehicleJourney": {
                                    "DestinationName": "Parc des Sports",
                                    "MonitoredCall": {
                                        "ExpectedDepartureTime": "2025-01-15T13:10:00+01:00",
                                        "Extension": {"IsRealTime": false}
                                    }
                                }}
                            ]
                        }]
                    }
                }));
            })
            .await
    }

    #[test]
    fn test_parse_stops_skips_malformed_entries() {
        let parsed = parse_stops("A,Homme de Fer,Hautepierre;bogus; ;C,Gare,");

        assert_eq!(
            parsed,
            vec![StopConfig {
                line: "A".to_string(),
                name: "Homme de Fer".to_string(),
                destination: "Hautepierre".to_string(),
            }]
        );
        assert!(parse_stops("").is_empty());
    }

    #[test]
    fn test_parse_stops_keeps_commas_in_destination() {
        let parsed = parse_stops("B,Lycée Kléber,Hoenheim, Gare");
        assert_eq!(parsed[0].destination, "Hoenheim, Gare");
    }

    #[test]
    fn test_group_by_destination_drops_past_departures() {
        let visits: Vec<StopVisit> = serde_json::from_value(serde_json::json!([
            {"MonitoredVehicleJourney": {"DestinationName": "Kehl",
                "MonitoredCall": {"ExpectedDepartureTime": "2025-01-15T11:59:00Z"}}},
            {"MonitoredVehicleJourney": {"DestinationName": "Kehl",
                "MonitoredCall": {"ExpectedDepartureTime": "2025-01-15T12:03:00Z",
                    "Extension": {"IsRealTime": true}}}},
            {"MonitoredVehicleJourney": {"DestinationName": "Aristide Briand",
                "MonitoredCall": {"ExpectedDepartureTime": "not a time"}}}
        ]))
        .unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();

        let grouped = group_by_destination(visits, now);

        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].name, "Kehl");
        assert_eq!(
            grouped[0].departures,
            vec![Departure {
                time: "2025-01-15T12:03:00Z".to_string(),
                realtime: true,
            }]
        );
    }

    #[test]
    fn test_cts_error_detection() {
        assert_eq!(
            cts_error(br#"{"error":"Invalid credentials"}"#),
            Some("Invalid credentials".to_string())
        );
        assert_eq!(cts_error(br#"{"ServiceDelivery":{}}"#), None);
    }

    #[tokio::test]
    async fn test_unconfigured_source_returns_config_error() {
        let (source, _clock) = source_with(None, stops());

        let response = source.fetch().await;

        assert_eq!(response.error.as_deref(), Some("transport not configured"));
    }

    #[tokio::test]
    async fn test_fetch_resolves_and_groups_departures() {
        let server = MockServer::start_async().await;
        mock_discovery(&server).await;
        mock_monitoring(&server).await;
        let (source, clock) = source_with(Some(&server), stops());

        let response = source.fetch().await;

        assert!(response.is_success(), "{:?}", response.error);
        assert_eq!(response.expires_at, clock.now() + Duration::minutes(2));
        let Some(Payload::Transport(data)) = response.data else {
            panic!("unexpected payload");
        };
        // The line D stop has no match upstream and is left out
        assert_eq!(data.stops.len(), 1);
        let stop = &data.stops[0];
        assert_eq!(stop.id, 0);
        assert_eq!(stop.color, "#E10D19");
        assert_eq!(stop.color_text, "#FFFFFF");
        let names: Vec<&str> = stop.destinations.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Hautepierre Maillon", "Parc des Sports"]);
        assert_eq!(stop.destinations[0].departures.len(), 1);
        assert_eq!(
            stop.destinations[0].departures[0].time,
            "2025-01-15T13:04:00+01:00"
        );
        assert!(!stop.destinations[1].departures[0].realtime);
    }

    #[tokio::test]
    async fn test_stops_are_resolved_once() {
        let server = MockServer::start_async().await;
        let discovery = mock_discovery(&server).await;
        let monitoring = mock_monitoring(&server).await;
        let (source, clock) = source_with(Some(&server), stops());

        source.fetch().await;
        clock.advance(Duration::minutes(3));
        source.fetch().await;

        assert_eq!(discovery.hits_async().await, 1);
        assert_eq!(monitoring.hits_async().await, 2);
    }

    #[tokio::test]
    async fn test_resolution_failure_retries_after_an_hour() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v1/siri/2.0/stoppoints-discovery");
                then.status(200).json_body(serde_json::json!({"error": "quota exceeded"}));
            })
            .await;
        let (source, _clock) = source_with(Some(&server), stops());

        let response = source.fetch().await;

        assert_eq!(response.error.as_deref(), Some("resolve: quota exceeded"));
        assert_eq!(response.expires_at - response.produced_at, Duration::hours(1));
    }

    #[tokio::test]
    async fn test_no_departures_anywhere_is_unavailable() {
        let server = MockServer::start_async().await;
        mock_discovery(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v1/siri/2.0/stop-monitoring");
                then.status(502).body("upstream down");
            })
            .await;
        let (source, _clock) = source_with(Some(&server), stops());

        let response = source.fetch().await;

        assert_eq!(response.error.as_deref(), Some("no departure data"));
        assert_eq!(response.expires_at - response.produced_at, Duration::minutes(5));
    }

    #[tokio::test]
    async fn test_live_view_uses_shorter_max_age() {
        let server = MockServer::start_async().await;
        mock_discovery(&server).await;
        let monitoring = mock_monitoring(&server).await;
        let (source, clock) = source_with(Some(&server), stops());

        source.fetch().await;
        clock.advance(Duration::seconds(10));
        let live = source.fetch_one(0).await;
        assert!(live.is_success());
        assert_eq!(live.expires_at, clock.now() + Duration::seconds(20));
        assert_eq!(monitoring.hits_async().await, 1);

        clock.advance(Duration::seconds(15));
        source.fetch_one(0).await;
        assert_eq!(monitoring.hits_async().await, 2);
    }

    #[tokio::test]
    async fn test_live_view_rejects_unknown_and_unresolved_stops() {
        let server = MockServer::start_async().await;
        mock_discovery(&server).await;
        let (source, _clock) = source_with(Some(&server), stops());

        let unknown = source.fetch_one(7).await;
        assert_eq!(unknown.error.as_deref(), Some("invalid stop"));
        assert_eq!(unknown.expires_at - unknown.produced_at, Duration::minutes(1));

        let unresolved = source.fetch_one(1).await;
        assert_eq!(unresolved.error.as_deref(), Some("invalid stop"));
    }

    #[tokio::test]
    async fn test_live_view_reports_fetch_failure() {
        let server = MockServer::start_async().await;
        mock_discovery(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v1/siri/2.0/stop-monitoring");
                then.status(500);
            })
            .await;
        let (source, _clock) = source_with(Some(&server), stops());

        let response = source.fetch_one(0).await;

        assert_eq!(response.error.as_deref(), Some("fetch failed"));
    }

    #[test]
    fn test_sub_key_includes_stop_index() {
        let (source, _clock) = source_with(None, stops());
        assert_eq!(source.sub_key(1), "transport:1");
        assert!(source.has_entity(1));
        assert!(!source.has_entity(2));
    }
}
