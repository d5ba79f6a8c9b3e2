//! Integration test entry point
//!
//! Drives a running router over HTTP. The router must be started against a
//! real primary and tunneled secondaries beforehand.
//!
//! Run with: REPLICA_ROUTER_RUN_INTEGRATION_TESTS=1 cargo test --test integration
//!
//! Environment variables:
//! - REPLICA_ROUTER_RUN_INTEGRATION_TESTS: Set to "1" to enable integration tests
//! - REPLICA_ROUTER_TEST_URL: Router base URL (default: http://127.0.0.1:8080)
//! - REPLICA_ROUTER_TEST_PRIMARY: Name of the primary (default: primary)

mod routes;

use std::env;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use serde_json::Value;

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("REPLICA_ROUTER_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip test if integration tests are not enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !crate::should_run_integration_tests() {
            eprintln!(
                "Skipping integration test (set REPLICA_ROUTER_RUN_INTEGRATION_TESTS=1 to run)"
            );
            return;
        }
    };
}

/// Router connection config from environment
#[derive(Debug, Clone)]
pub struct RouterTestConfig {
    pub base_url: String,
    pub primary: String,
}

pub fn get_router_config() -> RouterTestConfig {
    RouterTestConfig {
        base_url: env::var("REPLICA_ROUTER_TEST_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),
        primary: env::var("REPLICA_ROUTER_TEST_PRIMARY").unwrap_or_else(|_| "primary".to_string()),
    }
}

impl RouterTestConfig {
    pub fn client(&self) -> Client {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client")
    }

    pub fn get(&self, path: &str) -> Response {
        self.client()
            .get(format!("{}{}", self.base_url, path))
            .send()
            .unwrap_or_else(|e| panic!("GET {} failed: {}", path, e))
    }
}

/// A successful routed response
#[derive(Debug)]
pub struct RoutedResponse {
    pub source: String,
    pub rows: Vec<Value>,
    pub policy: String,
    pub address: String,
}

/// Assert a 200 response and decode the payload
pub fn expect_routed(response: Response) -> RoutedResponse {
    assert_eq!(response.status().as_u16(), 200, "Expected 200 from router");
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let policy = header("x-route-policy");
    let address = header("x-route-address");

    let body: Value = response.json().expect("Response should be JSON");
    let source = body["source"]
        .as_str()
        .expect("Response should carry a source")
        .to_string();
    let rows: Vec<Value> = serde_json::from_str(
        body["responseBody"]
            .as_str()
            .expect("responseBody should be a string"),
    )
    .expect("responseBody should hold a JSON row list");

    RoutedResponse {
        source,
        rows,
        policy,
        address,
    }
}
