//! Request orchestration: select, resolve, execute, respond

mod response;

pub use response::{ResponsePayload, Routed, RoutingDecision};

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cluster::{Address, Cluster, Endpoint};
use crate::config::Config;
use crate::executor::{ExecuteError, QueryExecutor};
use crate::metrics::metrics;
use crate::router::{Policy, ReplicaSelector, SelectError};
use crate::tunnel::TunnelTable;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("No endpoint is reachable")]
    NoReachableEndpoint,

    #[error("No secondaries are configured")]
    NoSecondariesConfigured,

    #[error("Tunnel to secondary '{0}' is not ready")]
    TunnelNotReady(String),

    #[error(transparent)]
    Execute(#[from] ExecuteError),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to encode rows: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<SelectError> for RoutingError {
    fn from(e: SelectError) -> Self {
        match e {
            SelectError::NoReachableEndpoint => RoutingError::NoReachableEndpoint,
            SelectError::NoSecondariesConfigured => RoutingError::NoSecondariesConfigured,
        }
    }
}

impl RoutingError {
    /// Short machine-readable name, used in error bodies and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RoutingError::NoReachableEndpoint => "no_reachable_endpoint",
            RoutingError::NoSecondariesConfigured => "no_secondaries_configured",
            RoutingError::TunnelNotReady(_) => "tunnel_not_ready",
            RoutingError::Execute(ExecuteError::Connection { .. }) => "connection_error",
            RoutingError::Execute(ExecuteError::Query { .. }) => "query_error",
            RoutingError::Timeout(_) => "timeout",
            RoutingError::Encode(_) => "encode_error",
        }
    }
}

/// Per-request behaviour taken from configuration
#[derive(Debug, Clone)]
pub struct RoutingOptions {
    /// The read query every request runs
    pub query: String,
    /// Retry once on the primary when a secondary cannot be connected to
    pub fallback_to_primary: bool,
    /// Bound on one whole request
    pub request_timeout: Duration,
}

impl RoutingOptions {
    /// Time latency probing may take out of one request
    ///
    /// Half the request budget; the other half is left for the query.
    pub fn probe_budget(&self) -> Duration {
        self.request_timeout / 2
    }
}

impl From<&Config> for RoutingOptions {
    fn from(config: &Config) -> Self {
        Self {
            query: config.database.query.clone(),
            fallback_to_primary: config.routing.fallback_to_primary,
            request_timeout: Duration::from_millis(config.routing.request_timeout_ms),
        }
    }
}

/// Serves one request per call; shared by all request tasks
pub struct RoutingService {
    cluster: Arc<Cluster>,
    tunnels: Arc<TunnelTable>,
    selector: ReplicaSelector,
    executor: QueryExecutor,
    options: RoutingOptions,
}

impl RoutingService {
    pub fn new(
        cluster: Arc<Cluster>,
        tunnels: Arc<TunnelTable>,
        selector: ReplicaSelector,
        executor: QueryExecutor,
        options: RoutingOptions,
    ) -> Self {
        Self {
            cluster,
            tunnels,
            selector,
            executor,
            options,
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn tunnels(&self) -> &TunnelTable {
        &self.tunnels
    }

    /// Route the configured query according to `policy`
    pub async fn handle(&self, policy: Policy) -> Result<Routed, RoutingError> {
        let started = Instant::now();
        let limit = self.options.request_timeout;
        let result = match timeout(limit, self.route(policy)).await {
            Ok(result) => result,
            Err(_) => Err(RoutingError::Timeout(limit)),
        };

        let m = metrics();
        m.record_request(policy.as_str(), started.elapsed().as_secs_f64());
        match &result {
            Ok(routed) => {
                m.record_route(policy.as_str(), &routed.payload.source);
                debug!(
                    policy = %policy,
                    source = %routed.payload.source,
                    address = %routed.decision.address,
                    "Request served"
                );
            }
            Err(e) => {
                m.record_request_error(e.kind());
                warn!(policy = %policy, error = %e, "Request failed");
            }
        }
        result
    }

    async fn route(&self, policy: Policy) -> Result<Routed, RoutingError> {
        let endpoint = self
            .selector
            .select(policy, &self.cluster, &self.tunnels, self.options.probe_budget())
            .await?;
        let address = self.resolve(&endpoint)?;

        match self.executor.execute(&address, &self.options.query).await {
            Ok(rows) => Ok(Routed::build(
                RoutingDecision {
                    policy,
                    endpoint,
                    address,
                },
                &rows,
            )?),
            Err(e)
                if e.is_connection()
                    && endpoint.is_secondary()
                    && self.options.fallback_to_primary =>
            {
                warn!(secondary = %endpoint.name, error = %e, "Falling back to primary");
                metrics().record_fallback(&endpoint.name);
                let primary = self.cluster.primary().clone();
                let address = primary.addr();
                let rows = self.executor.execute(&address, &self.options.query).await?;
                Ok(Routed::build(
                    RoutingDecision {
                        policy,
                        endpoint: primary,
                        address,
                    },
                    &rows,
                )?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Address to connect to: the primary directly, a secondary via its tunnel
    fn resolve(&self, endpoint: &Endpoint) -> Result<Address, RoutingError> {
        if endpoint.is_primary() {
            return Ok(endpoint.addr());
        }
        self.tunnels
            .ready_addr(&endpoint.name)
            .ok_or_else(|| RoutingError::TunnelNotReady(endpoint.name.clone()))
    }
}
