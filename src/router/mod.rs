mod selector;

pub use selector::{select_direct, select_lowest_latency, select_random, SelectError};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cluster::{Cluster, Endpoint};
use crate::probe::{LatencyProbe, ProbeTarget};
use crate::tunnel::TunnelTable;

/// Endpoint selection policy, one per HTTP route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    /// Always the primary (`/normal`)
    Direct,
    /// Fastest measured endpoint (`/custom`)
    LowestLatency,
    /// Any secondary (`/random`)
    Random,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Direct => "direct",
            Policy::LowestLatency => "lowest_latency",
            Policy::Random => "random",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Applies a policy to the cluster
///
/// Lowest-latency decisions are measured on every call; nothing is cached.
#[derive(Clone)]
pub struct ReplicaSelector {
    probe: LatencyProbe,
}

impl ReplicaSelector {
    pub fn new(probe: LatencyProbe) -> Self {
        Self { probe }
    }

    /// Pick an endpoint; `probe_budget` caps how long measurement may take
    pub async fn select(
        &self,
        policy: Policy,
        cluster: &Cluster,
        tunnels: &TunnelTable,
        probe_budget: Duration,
    ) -> Result<Arc<Endpoint>, SelectError> {
        match policy {
            Policy::Direct => Ok(select_direct(cluster.primary())),
            Policy::LowestLatency => self.lowest_latency(cluster, tunnels, probe_budget).await,
            Policy::Random => {
                let mut rng = rand::thread_rng();
                select_random(cluster.secondaries(), &mut rng)
            }
        }
    }

    /// Probe the primary directly and each ready secondary through its tunnel
    ///
    /// A secondary without a ready tunnel is not probed and counts as
    /// unreachable.
    async fn lowest_latency(
        &self,
        cluster: &Cluster,
        tunnels: &TunnelTable,
        probe_budget: Duration,
    ) -> Result<Arc<Endpoint>, SelectError> {
        let primary = cluster.primary();
        let mut targets = vec![ProbeTarget::new(primary.name.clone(), primary.addr())];
        let mut probed = vec![primary.clone()];
        let mut skipped = Vec::new();
        for secondary in cluster.secondaries() {
            match tunnels.ready_addr(&secondary.name) {
                Some(addr) => {
                    targets.push(ProbeTarget::new(secondary.name.clone(), addr));
                    probed.push(secondary.clone());
                }
                None => skipped.push(secondary.clone()),
            }
        }

        let measurements = self.probe.measure_all(&targets, probe_budget).await;
        let mut latencies: Vec<_> = probed
            .into_iter()
            .zip(measurements)
            .map(|(endpoint, m)| {
                debug!(
                    endpoint = %m.target,
                    round_trip_ms = ?m.round_trip_ms,
                    measured_at = ?m.measured_at,
                    "Measured latency"
                );
                (endpoint, m.round_trip_ms)
            })
            .collect();

        // Keep configured order among secondaries for the tie-break
        latencies.extend(skipped.into_iter().map(|s| (s, None)));
        let order = |e: &Endpoint| {
            cluster
                .secondaries()
                .iter()
                .position(|s| s.name == e.name)
                .map_or(0, |i| i + 1)
        };
        latencies.sort_by_key(|(e, _)| order(e));

        select_lowest_latency(&latencies)
    }
}
