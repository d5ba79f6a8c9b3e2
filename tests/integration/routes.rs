//! Policy route integration tests

use std::collections::HashMap;

use serde_json::Value;

use crate::{expect_routed, get_router_config, skip_if_not_enabled};

#[test]
fn test_normal_is_served_by_primary() {
    skip_if_not_enabled!();

    let config = get_router_config();
    for _ in 0..5 {
        let routed = expect_routed(config.get("/normal"));
        assert_eq!(routed.source, config.primary);
        assert_eq!(routed.policy, "direct");
        assert!(!routed.rows.is_empty(), "store table should not be empty");
    }
}

#[test]
fn test_random_never_uses_primary() {
    skip_if_not_enabled!();

    let config = get_router_config();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..30 {
        let routed = expect_routed(config.get("/random"));
        assert_eq!(routed.policy, "random");
        assert!(routed.address.starts_with("127.0.0.1:"));
        *counts.entry(routed.source).or_insert(0) += 1;
    }
    assert!(!counts.contains_key(&config.primary));
    eprintln!("Random distribution: {:?}", counts);
}

#[test]
fn test_custom_serves_from_some_endpoint() {
    skip_if_not_enabled!();

    let config = get_router_config();
    let routed = expect_routed(config.get("/custom"));
    assert_eq!(routed.policy, "lowest_latency");
    if routed.source == config.primary {
        assert!(!routed.address.starts_with("127.0.0.1:"));
    } else {
        assert!(routed.address.starts_with("127.0.0.1:"));
    }
}

#[test]
fn test_every_route_returns_the_same_rows() {
    skip_if_not_enabled!();

    let config = get_router_config();
    let normal = expect_routed(config.get("/normal"));
    let random = expect_routed(config.get("/random"));
    // Replicas serve the same data as the primary
    assert_eq!(normal.rows.len(), random.rows.len());
}

#[test]
fn test_health_lists_tunnels() {
    skip_if_not_enabled!();

    let config = get_router_config();
    let response = config.get("/health");
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().expect("Health should be JSON");
    assert!(body["status"] == "ok" || body["status"] == "degraded");
    assert!(body["tunnels"].is_array());
}

#[test]
fn test_metrics_exposed() {
    skip_if_not_enabled!();

    let config = get_router_config();
    let _ = config.get("/normal");
    let response = config.get("/metrics");
    assert_eq!(response.status().as_u16(), 200);
    let text = response.text().expect("Metrics should be text");
    assert!(text.contains("replica_router_requests_total"));
}
