//! Round-trip latency measurement
//!
//! A measurement is the mean of the answered samples out of `sample_count`
//! attempts. An endpoint that answers none is unreachable. Fan-outs run every
//! target concurrently under one deadline.

mod tcp;

pub use tcp::TcpProber;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use crate::cluster::Address;
use crate::config::ProbeConfig;
use crate::metrics::metrics;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("Probe connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed before the server spoke")]
    Closed,

    #[error("Server refused the connection: {0}")]
    Rejected(String),

    #[error("No probe sample answered")]
    Unreachable,
}

/// Takes one reachability sample
#[async_trait]
pub trait Prober: Send + Sync {
    /// Round trip of one sample, bounded by `limit`
    async fn sample(&self, addr: &Address, limit: Duration) -> Result<Duration, ProbeError>;
}

/// Something to measure, named for logs and metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub name: String,
    pub addr: Address,
}

impl ProbeTarget {
    pub fn new(name: impl Into<String>, addr: Address) -> Self {
        Self {
            name: name.into(),
            addr,
        }
    }
}

/// Result of measuring one target; `None` means unreachable
#[derive(Debug, Clone)]
pub struct LatencyMeasurement {
    pub target: String,
    pub round_trip_ms: Option<f64>,
    pub measured_at: Instant,
}

/// Latency measurement with fixed sampling parameters
#[derive(Clone)]
pub struct LatencyProbe {
    prober: Arc<dyn Prober>,
    sample_count: u32,
    per_sample_timeout: Duration,
    deadline: Duration,
}

impl LatencyProbe {
    pub fn new(prober: Arc<dyn Prober>, config: &ProbeConfig) -> Self {
        Self {
            prober,
            sample_count: config.sample_count,
            per_sample_timeout: Duration::from_millis(config.per_sample_timeout_ms),
            deadline: Duration::from_millis(config.effective_deadline_ms()),
        }
    }

    /// TCP probe using the configured method
    pub fn tcp(config: &ProbeConfig) -> Self {
        Self::new(Arc::new(TcpProber::new(config.method)), config)
    }

    /// Mean round trip in milliseconds over the answered samples
    pub async fn measure(&self, addr: &Address) -> Result<f64, ProbeError> {
        let mut tally = SampleTally::default();
        self.take_samples(addr, &mut tally).await;
        tally.mean_ms().ok_or(ProbeError::Unreachable)
    }

    async fn take_samples(&self, addr: &Address, tally: &mut SampleTally) {
        for _ in 0..self.sample_count {
            match self.prober.sample(addr, self.per_sample_timeout).await {
                Ok(rtt) => tally.record(rtt),
                Err(e) => debug!(addr = %addr, error = %e, "Probe sample lost"),
            }
        }
    }

    /// Measure every target concurrently
    ///
    /// Results come back in target order. The fan-out stops at the probe
    /// deadline or at `budget`, whichever is shorter. A target cut off there
    /// keeps the mean of the samples it already answered; with none it is
    /// reported unreachable.
    pub async fn measure_all(
        &self,
        targets: &[ProbeTarget],
        budget: Duration,
    ) -> Vec<LatencyMeasurement> {
        let limit = self.deadline.min(budget);
        let measurements = targets.iter().map(|target| async move {
            let mut tally = SampleTally::default();
            let finished = timeout(limit, self.take_samples(&target.addr, &mut tally))
                .await
                .is_ok();
            let round_trip_ms = tally.mean_ms();
            match (finished, round_trip_ms) {
                (true, None) => debug!(endpoint = %target.name, "Endpoint unreachable"),
                (false, None) => {
                    debug!(endpoint = %target.name, limit = ?limit, "Probe abandoned at deadline")
                }
                (false, Some(_)) => debug!(
                    endpoint = %target.name,
                    answered = tally.answered,
                    "Probe cut off at deadline, keeping answered samples"
                ),
                (true, Some(_)) => {}
            }
            metrics().record_probe(&target.name, round_trip_ms);
            LatencyMeasurement {
                target: target.name.clone(),
                round_trip_ms,
                measured_at: Instant::now(),
            }
        });
        join_all(measurements).await
    }
}

/// Running total of answered samples
#[derive(Debug, Default, Clone, Copy)]
struct SampleTally {
    total: Duration,
    answered: u32,
}

impl SampleTally {
    fn record(&mut self, rtt: Duration) {
        self.total += rtt;
        self.answered += 1;
    }

    fn mean_ms(&self) -> Option<f64> {
        (self.answered > 0).then(|| self.total.as_secs_f64() * 1000.0 / self.answered as f64)
    }
}
