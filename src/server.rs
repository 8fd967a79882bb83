//! HTTP boundary
//!
//! Thin axum layer over the [`Aggregator`]: every route answers with the JSON
//! encoding of a [`Response`] or a [`Combined`] view. Handlers never fail;
//! upstream problems are already folded into the responses they return.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, instrument};

use crate::aggregator::{Aggregator, Combined};
use crate::data::{serialize_timestamp, Response, SubEntitySource};

/// How long a rejected live request tells clients to wait
const INVALID_ID_RETRY_MINUTES: i64 = 1;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    /// Fetch orchestration over the cache
    pub aggregator: Arc<Aggregator>,
    /// Source answering `/api/transport/live`
    ///
    /// Must be the same instance the aggregator holds so both paths share
    /// its private departure cache.
    pub live: Arc<dyn SubEntitySource>,
}

/// Body of `GET /health`
#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    #[serde(serialize_with = "serialize_timestamp")]
    timestamp: DateTime<Utc>,
    cached_entries: usize,
}

/// Query string of the live departures route
///
/// Kept as a string so that a non-numeric id gets an error response instead
/// of a framework rejection.
#[derive(Debug, Deserialize)]
pub struct LiveQuery {
    id: Option<String>,
}

/// Builds the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/all", get(all))
        .route("/api/transport/live", get(transport_live))
        .route("/api/{source}", get(source))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        timestamp: state.aggregator.now(),
        cached_entries: state.aggregator.cache().len(),
    })
}

#[instrument(skip(state))]
async fn all(State(state): State<AppState>) -> Json<Combined> {
    Json(state.aggregator.fetch_all().await)
}

#[instrument(skip(state))]
async fn transport_live(
    State(state): State<AppState>,
    Query(query): Query<LiveQuery>,
) -> (StatusCode, Json<Response>) {
    let id = query.id.as_deref().and_then(|id| id.trim().parse::<usize>().ok());
    let Some(id) = id else {
        debug!(id = ?query.id, "rejecting live request");
        let response = Response::failure(
            "invalid id",
            state.aggregator.now(),
            Duration::minutes(INVALID_ID_RETRY_MINUTES),
        );
        return (StatusCode::BAD_REQUEST, Json(response));
    };

    let response = state.aggregator.fetch_one(state.live.as_ref(), id).await;
    (StatusCode::OK, Json(response))
}

#[instrument(skip(state))]
async fn source(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> (StatusCode, Json<Response>) {
    match state.aggregator.fetch_cached(&name).await {
        Some(response) => (StatusCode::OK, Json(response)),
        None => {
            let response = Response::failure(
                format!("unknown source: {}", name),
                state.aggregator.now(),
                Duration::zero(),
            );
            (StatusCode::NOT_FOUND, Json(response))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResponseCache;
    use crate::clock::{Clock, ManualClock, SharedClock};
    use crate::data::{Source, TemperatureData};
    use crate::aggregator::DEFAULT_SOURCE_TIMEOUT;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    struct FakeStops {
        clock: ManualClock,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Source for FakeStops {
        fn name(&self) -> &str {
            "transport"
        }

        async fn fetch(&self) -> Response {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Response::failure("transport not configured", self.clock.now(), Duration::hours(1))
        }

        fn degraded_ttl(&self) -> Duration {
            Duration::hours(1)
        }
    }

    #[async_trait]
    impl SubEntitySource for FakeStops {
        fn has_entity(&self, id: usize) -> bool {
            id < 2
        }

        async fn fetch_one(&self, id: usize) -> Response {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reading = TemperatureData {
                temperature: id as f64,
                humidity: 40.0,
                location: format!("stop {}", id),
            };
            Response::success(reading, self.clock.now(), Duration::seconds(20))
        }
    }

    struct Sensor {
        clock: ManualClock,
    }

    #[async_trait]
    impl Source for Sensor {
        fn name(&self) -> &str {
            "temperature"
        }

        async fn fetch(&self) -> Response {
            let reading = TemperatureData {
                temperature: 21.5,
                humidity: 45.0,
                location: "Living Room".to_string(),
            };
            Response::success(reading, self.clock.now(), Duration::minutes(5))
        }

        fn degraded_ttl(&self) -> Duration {
            Duration::hours(4)
        }
    }

    fn create_test_app() -> (Router, Arc<FakeStops>) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap());
        let shared: SharedClock = Arc::new(clock.clone());
        let stops = Arc::new(FakeStops {
            clock: clock.clone(),
            calls: AtomicUsize::new(0),
        });
        let sensor = Arc::new(Sensor { clock });
        let sources: Vec<Arc<dyn Source>> = vec![sensor, stops.clone()];
        let aggregator = Aggregator::new(
            sources,
            ResponseCache::new(shared.clone()),
            shared,
            DEFAULT_SOURCE_TIMEOUT,
        )
        .unwrap();
        let state = AppState {
            aggregator: Arc::new(aggregator),
            live: stops.clone(),
        };
        (router(state), stops)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_cache_size() {
        let (app, _) = create_test_app();

        let (status, body) = get_json(app.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["timestamp"], "2025-01-15T12:00:00Z");
        assert_eq!(body["cached_entries"], 0);

        get_json(app.clone(), "/api/temperature").await;
        let (_, body) = get_json(app, "/health").await;
        assert_eq!(body["cached_entries"], 1);
    }

    #[tokio::test]
    async fn test_source_route_serves_response_envelope() {
        let (app, _) = create_test_app();

        let (status, body) = get_json(app, "/api/temperature").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["temperature"], 21.5);
        assert_eq!(body["data"]["location"], "Living Room");
        assert_eq!(body["timestamp"], "2025-01-15T12:00:00Z");
        assert!(body.get("error").is_none());
        assert!(body.get("expires_at").is_none());
    }

    #[tokio::test]
    async fn test_unknown_source_is_not_found() {
        let (app, _) = create_test_app();

        let (status, body) = get_json(app, "/api/nonexistent").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown source: nonexistent");
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn test_all_returns_every_source_and_timestamp() {
        let (app, _) = create_test_app();

        let (status, body) = get_json(app, "/api/all").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["temperature"]["data"]["humidity"], 45.0);
        assert_eq!(body["transport"]["error"], "transport not configured");
        assert_eq!(body["timestamp"], "2025-01-15T12:00:00Z");
    }

    #[tokio::test]
    async fn test_live_route_wins_over_source_route() {
        let (app, stops) = create_test_app();

        let (status, body) = get_json(app.clone(), "/api/transport/live?id=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["location"], "stop 1");

        // Second request is served from the sub-entity cache
        get_json(app, "/api/transport/live?id=1").await;
        assert_eq!(stops.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_live_route_rejects_non_numeric_id() {
        let (app, stops) = create_test_app();

        for uri in ["/api/transport/live?id=abc", "/api/transport/live", "/api/transport/live?id=-1"] {
            let (status, body) = get_json(app.clone(), uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert_eq!(body["error"], "invalid id");
        }
        assert_eq!(stops.calls.load(Ordering::SeqCst), 0);
    }
}
