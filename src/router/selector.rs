//! Endpoint selection strategies
//!
//! Pure functions over already-gathered inputs; probing and tunnel lookups
//! happen in the caller.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

use crate::cluster::Endpoint;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("No endpoint answered the latency probe")]
    NoReachableEndpoint,
    #[error("No secondaries are configured")]
    NoSecondariesConfigured,
}

/// Always the primary
pub fn select_direct(primary: &Arc<Endpoint>) -> Arc<Endpoint> {
    primary.clone()
}

/// Endpoint with the smallest measured round trip
///
/// `candidates` is ordered primary first, then secondaries in configured
/// order; `None` is unreachable. Ties keep the earlier candidate.
pub fn select_lowest_latency(
    candidates: &[(Arc<Endpoint>, Option<f64>)],
) -> Result<Arc<Endpoint>, SelectError> {
    let mut best: Option<(&Arc<Endpoint>, f64)> = None;
    for (endpoint, latency) in candidates {
        let latency = latency.unwrap_or(f64::INFINITY);
        // Unreachable never wins, even over nothing
        if latency.is_infinite() || latency.is_nan() {
            continue;
        }
        match best {
            Some((_, best_latency)) if latency >= best_latency => {}
            _ => best = Some((endpoint, latency)),
        }
    }
    best.map(|(endpoint, _)| endpoint.clone())
        .ok_or(SelectError::NoReachableEndpoint)
}

/// Uniformly random secondary; never the primary
pub fn select_random<R: Rng + ?Sized>(
    secondaries: &[Arc<Endpoint>],
    rng: &mut R,
) -> Result<Arc<Endpoint>, SelectError> {
    secondaries
        .choose(rng)
        .cloned()
        .ok_or(SelectError::NoSecondariesConfigured)
}
