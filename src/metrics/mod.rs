//! Prometheus metrics for the replica router
//!
//! Exposed as text at `GET /metrics` on the API listener.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Router metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Request metrics
    /// Requests received by policy
    pub requests_total: IntCounterVec,
    /// Request latency histogram (in seconds)
    pub request_duration_seconds: HistogramVec,
    /// Request errors by kind
    pub request_errors_total: IntCounterVec,

    // Routing metrics
    /// Requests served by policy and endpoint
    pub requests_routed_total: IntCounterVec,
    /// Fallbacks from a secondary to the primary
    pub fallbacks_total: IntCounterVec,

    // Probe metrics
    /// Probe round trip histogram (in seconds)
    pub probe_rtt_seconds: HistogramVec,
    /// Endpoints that answered no probe sample
    pub probe_failures_total: IntCounterVec,

    // Tunnel metrics
    /// Tunnels currently forwarding
    pub tunnels_ready: IntGauge,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new(
                "replica_router_requests_total",
                "Total number of routing requests",
            ),
            &["policy"],
        )
        .unwrap();

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "replica_router_request_duration_seconds",
                "Routing request duration in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0,
            ]),
            &["policy"],
        )
        .unwrap();

        let request_errors_total = IntCounterVec::new(
            Opts::new(
                "replica_router_request_errors_total",
                "Total number of failed routing requests",
            ),
            &["kind"],
        )
        .unwrap();

        let requests_routed_total = IntCounterVec::new(
            Opts::new(
                "replica_router_requests_routed_total",
                "Requests served by policy and endpoint",
            ),
            &["policy", "endpoint"],
        )
        .unwrap();

        let fallbacks_total = IntCounterVec::new(
            Opts::new(
                "replica_router_fallbacks_total",
                "Requests retried on the primary after a secondary connection failure",
            ),
            &["secondary"],
        )
        .unwrap();

        let probe_rtt_seconds = HistogramVec::new(
            HistogramOpts::new(
                "replica_router_probe_rtt_seconds",
                "Mean probe round trip per measurement in seconds",
            )
            .buckets(vec![
                0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0,
            ]),
            &["endpoint"],
        )
        .unwrap();

        let probe_failures_total = IntCounterVec::new(
            Opts::new(
                "replica_router_probe_failures_total",
                "Measurements where no probe sample was answered",
            ),
            &["endpoint"],
        )
        .unwrap();

        let tunnels_ready = IntGauge::new(
            "replica_router_tunnels_ready",
            "Number of SSH tunnels currently forwarding",
        )
        .unwrap();

        registry.register(Box::new(requests_total.clone())).unwrap();
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(request_errors_total.clone()))
            .unwrap();
        registry
            .register(Box::new(requests_routed_total.clone()))
            .unwrap();
        registry.register(Box::new(fallbacks_total.clone())).unwrap();
        registry
            .register(Box::new(probe_rtt_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(probe_failures_total.clone()))
            .unwrap();
        registry.register(Box::new(tunnels_ready.clone())).unwrap();

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            request_errors_total,
            requests_routed_total,
            fallbacks_total,
            probe_rtt_seconds,
            probe_failures_total,
            tunnels_ready,
        }
    }

    /// Record a finished request
    pub fn record_request(&self, policy: &str, duration_secs: f64) {
        self.requests_total.with_label_values(&[policy]).inc();
        self.request_duration_seconds
            .with_label_values(&[policy])
            .observe(duration_secs);
    }

    /// Record a failed request
    pub fn record_request_error(&self, kind: &str) {
        self.request_errors_total.with_label_values(&[kind]).inc();
    }

    /// Record which endpoint served a request
    pub fn record_route(&self, policy: &str, endpoint: &str) {
        self.requests_routed_total
            .with_label_values(&[policy, endpoint])
            .inc();
    }

    /// Record a retry on the primary
    pub fn record_fallback(&self, secondary: &str) {
        self.fallbacks_total.with_label_values(&[secondary]).inc();
    }

    /// Record a latency measurement; `None` means unreachable
    pub fn record_probe(&self, endpoint: &str, round_trip_ms: Option<f64>) {
        match round_trip_ms {
            Some(ms) => self
                .probe_rtt_seconds
                .with_label_values(&[endpoint])
                .observe(ms / 1000.0),
            None => self
                .probe_failures_total
                .with_label_values(&[endpoint])
                .inc(),
        }
    }

    /// Update the ready-tunnel gauge
    pub fn set_tunnels_ready(&self, ready: usize) {
        self.tunnels_ready.set(ready as i64);
    }

    /// Render the registry in Prometheus text format
    ///
    /// An encoding failure is logged and yields whatever was written so far.
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let mut buffer = Vec::new();
        if let Err(e) = prometheus::TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
