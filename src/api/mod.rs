//! HTTP surface
//!
//! One GET route per policy plus `/health` and `/metrics`.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use serde_json::json;

use crate::metrics::{metrics, Metrics};
use crate::router::Policy;
use crate::service::{Routed, RoutingError, RoutingService};
use crate::tunnel::TunnelTable;

pub const ROUTE_POLICY_HEADER: &str = "x-route-policy";
pub const ROUTE_ADDRESS_HEADER: &str = "x-route-address";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RoutingService>,
}

/// Create the API router
pub fn create_router(service: Arc<RoutingService>) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/normal", get(normal))
        .route("/custom", get(custom))
        .route("/random", get(random))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

// ===== Route Handlers =====

/// Always served by the primary
async fn normal(State(state): State<AppState>) -> Result<Routed, RoutingError> {
    state.service.handle(Policy::Direct).await
}

/// Served by the endpoint with the lowest measured latency
async fn custom(State(state): State<AppState>) -> Result<Routed, RoutingError> {
    state.service.handle(Policy::LowestLatency).await
}

/// Served by a random secondary
async fn random(State(state): State<AppState>) -> Result<Routed, RoutingError> {
    state.service.handle(Policy::Random).await
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let tunnels = state.service.tunnels();
    let statuses: Vec<TunnelStatus> = state
        .service
        .cluster()
        .secondaries()
        .iter()
        .map(|s| TunnelStatus {
            name: s.name.clone(),
            local_port: s.port,
            ready: tunnels.is_ready(&s.name),
        })
        .collect();
    let status = if statuses.iter().all(|t| t.ready) {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tunnels: statuses,
    })
}

async fn metrics_text(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        render_metrics(metrics(), state.service.tunnels()),
    )
}

/// Prometheus text with the tunnel gauge read from the live table
///
/// A forward whose ssh process died is counted out at the next scrape.
fn render_metrics(m: &Metrics, tunnels: &TunnelTable) -> String {
    m.set_tunnels_ready(tunnels.ready_count());
    m.gather()
}

// ===== Response Types =====

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    tunnels: Vec<TunnelStatus>,
}

#[derive(Serialize)]
struct TunnelStatus {
    name: String,
    local_port: u16,
    ready: bool,
}

impl IntoResponse for Routed {
    fn into_response(self) -> Response {
        let mut response = Json(self.payload).into_response();
        let headers = response.headers_mut();
        headers.insert(
            ROUTE_POLICY_HEADER,
            HeaderValue::from_static(self.decision.policy.as_str()),
        );
        if let Ok(address) = HeaderValue::from_str(&self.decision.address.to_string()) {
            headers.insert(ROUTE_ADDRESS_HEADER, address);
        }
        response
    }
}

// ===== Error Handling =====

impl IntoResponse for RoutingError {
    fn into_response(self) -> Response {
        let status = match &self {
            RoutingError::NoReachableEndpoint
            | RoutingError::NoSecondariesConfigured
            | RoutingError::TunnelNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            RoutingError::Execute(_) => StatusCode::BAD_GATEWAY,
            RoutingError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RoutingError::Encode(err) => {
                tracing::error!("Failed to encode response: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::executor::ExecuteError;
    use crate::service::tests::{flagged_tunnels, tunnels, Harness, RecordingConnector};

    async fn get(app: Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    fn app(harness: &Harness) -> Router {
        create_router(Arc::new(harness.service()))
    }

    #[tokio::test]
    async fn test_normal_route() {
        let harness = Harness::new();
        let (status, headers, body) = get(app(&harness), "/normal").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "primary");
        let rows: Value =
            serde_json::from_str(body["responseBody"].as_str().unwrap()).unwrap();
        assert_eq!(rows[0]["store_id"], 1);
        assert_eq!(headers[ROUTE_POLICY_HEADER], "direct");
        assert_eq!(headers[ROUTE_ADDRESS_HEADER], "10.0.0.10:3306");
    }

    #[tokio::test]
    async fn test_custom_route_uses_tunnel_address() {
        let mut harness = Harness::new();
        harness.latencies = HashMap::from([(3306, 40), (5001, 25), (5002, 60)]);
        let (status, headers, body) = get(app(&harness), "/custom").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "secondary1");
        assert_eq!(headers[ROUTE_POLICY_HEADER], "lowest_latency");
        assert_eq!(headers[ROUTE_ADDRESS_HEADER], "127.0.0.1:5001");
    }

    #[tokio::test]
    async fn test_random_route_serves_secondary() {
        let harness = Harness::new();
        let (status, _, body) = get(app(&harness), "/random").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body["source"].as_str().unwrap().starts_with("secondary"));
    }

    #[tokio::test]
    async fn test_unreachable_is_503() {
        let harness = Harness::new();
        let (status, _, body) = get(app(&harness), "/custom").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["kind"], "no_reachable_endpoint");
    }

    #[tokio::test]
    async fn test_connection_error_is_502() {
        let mut harness = Harness::new();
        harness.connector = Arc::new(RecordingConnector {
            refuse: HashSet::from([3306]),
            ..Default::default()
        });
        let (status, _, body) = get(app(&harness), "/normal").await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["kind"], "connection_error");
    }

    #[tokio::test]
    async fn test_timeout_is_504() {
        let mut harness = Harness::new();
        harness.options.request_timeout = Duration::from_millis(50);
        harness.connector = Arc::new(RecordingConnector {
            stall: HashSet::from([3306]),
            ..Default::default()
        });
        let (status, _, body) = get(app(&harness), "/normal").await;

        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["kind"], "timeout");
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (RoutingError::NoSecondariesConfigured, StatusCode::SERVICE_UNAVAILABLE),
            (
                RoutingError::TunnelNotReady("secondary1".to_string()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                RoutingError::Execute(ExecuteError::Query {
                    addr: "127.0.0.1:5001".to_string(),
                    reason: "Table 'sakila.store' doesn't exist".to_string(),
                }),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[tokio::test]
    async fn test_health_reports_tunnels() {
        let mut harness = Harness::new();
        let (status, _, body) = get(app(&harness), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["tunnels"].as_array().unwrap().len(), 3);

        harness.tunnels = tunnels(&harness.cluster, &["secondary1"]);
        let (status, _, body) = get(app(&harness), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["tunnels"][0]["ready"], true);
        assert_eq!(body["tunnels"][1]["name"], "secondary2");
        assert_eq!(body["tunnels"][1]["local_port"], 5002);
        assert_eq!(body["tunnels"][1]["ready"], false);
    }

    #[test]
    fn test_tunnel_gauge_follows_dead_forwards() {
        let harness = Harness::new();
        let (table, alive) = flagged_tunnels(&harness.cluster);
        let m = Metrics::new();
        assert!(render_metrics(&m, &table).contains("replica_router_tunnels_ready 3"));

        // What the ssh supervisor does when the process exits
        alive["secondary1"].store(false, std::sync::atomic::Ordering::Release);
        assert!(render_metrics(&m, &table).contains("replica_router_tunnels_ready 2"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let harness = Harness::new();
        let _ = get(app(&harness), "/normal").await;

        let response = app(&harness)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("replica_router_requests_total"));
    }
}
