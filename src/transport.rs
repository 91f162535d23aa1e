//! Transport boundary: the only place the core suspends.

use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::walk::JsonMap;

/// Which public operation was in flight when a transport failed. Drives
/// the error's side-effect classification: a mutation has already
/// applied its optimistic pass.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransportPhase {
    Query,
    Mutation,
    Subscription,
}

impl TransportPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportPhase::Query => "query",
            TransportPhase::Mutation => "mutation",
            TransportPhase::Subscription => "subscription",
        }
    }
}

#[derive(Error, Debug, Clone)]
#[error("{phase} transport failed: {message}", phase = .phase.as_str())]
pub struct TransportError {
    pub phase: TransportPhase,
    pub message: String,
}

impl TransportError {
    pub fn new(phase: TransportPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
        }
    }
}

/// A printed operation plus its variable bag, ready to ship.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub variables: JsonMap,
}

/// What a GraphQL endpoint answers: data, a server-reported error, or
/// both.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponsePayload {
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ResponsePayload {
    pub fn data(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }
}

/// The wire seam. Queries and mutations both travel through it; a
/// priority transport (e.g. an open websocket) may stand in for the
/// default one.
///
/// Futures are local: the core is single-threaded and never demands
/// `Send` from a host.
pub trait Transport {
    fn handle_query(
        &self,
        request: QueryRequest,
    ) -> LocalBoxFuture<'_, Result<ResponsePayload, TransportError>>;
}
