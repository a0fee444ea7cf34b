//! Actor-call forwarding during migration.
//!
//! The destination partition starts receiving actor traffic before it
//! owns the state. Until cutover is durable, every incoming call must
//! be routed to the source partition primary; afterwards the local
//! handler runs. The gate is consulted per request because it can flip
//! from "forward" to "local" at the instant Downtime commits.

use crate::error::{Error, Result};
use crate::metrics::MigrationMetrics;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One actor call as seen by the dispatcher: an opaque payload plus
/// the routing identity. The envelope serializes to bytes so a
/// transport can carry it unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorCall {
    /// Identity of the target actor; also the routing key.
    pub actor_id: String,
    /// Method being invoked.
    pub method: String,
    /// Opaque request payload.
    pub payload: Vec<u8>,
}

impl ActorCall {
    /// Create a call envelope.
    pub fn new(
        actor_id: impl Into<String>,
        method: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            method: method.into(),
            payload: payload.into(),
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Internal(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::Internal(e.to_string()))
    }
}

/// The forwarding decision hook. Implemented by the orchestrator:
/// true while `MigrationCurrentStatus != Completed`.
pub trait MigrationGate: Send + Sync {
    /// Whether incoming actor calls must be forwarded to the source.
    fn is_call_forwarding_required(&self) -> bool;
}

/// Handles an actor call, either locally or on the source primary.
/// The transport behind the remote implementation is not this crate's
/// business; it only decides which handler runs.
#[async_trait]
pub trait ActorCallHandler: Send + Sync + std::fmt::Debug {
    /// Handle one call and produce the reply payload.
    async fn handle(&self, call: ActorCall) -> Result<Bytes>;
}

/// Sits in front of the destination's RPC handler and routes each
/// incoming call per the gate's per-request decision.
pub struct ForwardingDispatcher {
    gate: Arc<dyn MigrationGate>,
    local: Arc<dyn ActorCallHandler>,
    remote: Arc<dyn ActorCallHandler>,
    metrics: Arc<MigrationMetrics>,
}

impl std::fmt::Debug for ForwardingDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingDispatcher")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}

impl ForwardingDispatcher {
    /// Create a dispatcher.
    pub fn new(
        gate: Arc<dyn MigrationGate>,
        local: Arc<dyn ActorCallHandler>,
        remote: Arc<dyn ActorCallHandler>,
        metrics: Arc<MigrationMetrics>,
    ) -> Self {
        Self {
            gate,
            local,
            remote,
            metrics,
        }
    }

    /// Route one incoming call.
    pub async fn dispatch(&self, call: ActorCall) -> Result<Bytes> {
        if self.gate.is_call_forwarding_required() {
            self.metrics.record_call_forwarded();
            tracing::trace!(
                actor_id = %call.actor_id,
                method = %call.method,
                "Forwarding actor call to source primary"
            );
            self.remote.handle(call).await
        } else {
            self.metrics.record_call_local();
            self.local.handle(call).await
        }
    }
}

/// Handler that rejects every call. Useful as the local handler while
/// the destination has no actor runtime wired up yet.
#[derive(Debug, Default)]
pub struct RejectingHandler;

#[async_trait]
impl ActorCallHandler for RejectingHandler {
    async fn handle(&self, call: ActorCall) -> Result<Bytes> {
        Err(Error::Internal(format!(
            "no local handler for actor {} method {}",
            call.actor_id, call.method
        )))
    }
}
