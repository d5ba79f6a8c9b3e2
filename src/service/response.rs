//! Uniform response for every routed query

use std::sync::Arc;

use serde::Serialize;

use crate::cluster::{Address, Endpoint};
use crate::executor::QueryResult;
use crate::router::Policy;

/// Body returned to the HTTP client
///
/// `responseBody` holds the rows serialized as a JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponsePayload {
    pub source: String,
    #[serde(rename = "responseBody")]
    pub response_body: String,
}

/// Where a request was served from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub policy: Policy,
    pub endpoint: Arc<Endpoint>,
    /// Address actually connected to; the tunnel port for a secondary
    pub address: Address,
}

/// A served request: the payload plus how it was routed
#[derive(Debug, Clone)]
pub struct Routed {
    pub payload: ResponsePayload,
    pub decision: RoutingDecision,
}

impl Routed {
    pub fn build(
        decision: RoutingDecision,
        rows: &QueryResult,
    ) -> Result<Self, serde_json::Error> {
        let payload = ResponsePayload {
            source: decision.endpoint.name.clone(),
            response_body: serde_json::to_string(rows)?,
        };
        Ok(Self { payload, decision })
    }
}
