//! Swarm events
//!
//! Agents publish completion and detection events; the orchestrator consumes
//! them to maintain per-counterparty pattern counters. Events are ephemeral.

use crate::error::PortError;
use crate::types::{AgentKind, CarrierId, DisputeId, SessionId, ShipmentId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Event kinds with their typed payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwarmEventKind {
    /// A failover saga finished (committed or rolled back)
    FailoverCompleted {
        shipment: ShipmentId,
        from: CarrierId,
        to: Option<CarrierId>,
        success: bool,
        /// Issued by containment rather than by risk detection
        forced: bool,
    },
    /// A carrier misbehaved (missed pickup, tracking outage, degraded score)
    CarrierIncident { carrier: CarrierId, detail: String },
    /// A dispute resolution saga finished
    DisputeResolved {
        dispute: DisputeId,
        respondent: CarrierId,
        in_favor_of_initiator: bool,
        success: bool,
    },
    /// Evidence suggests the counterparty is acting fraudulently
    FraudSuspected {
        counterparty: CarrierId,
        dispute: Option<DisputeId>,
        detail: String,
    },
    /// A human vetoed a proposed action
    ActionVetoed {
        session: SessionId,
        counterparty: Option<CarrierId>,
    },
    /// A proposal was routed to a human
    Escalated { business_key: String, reason: String },
}

impl SwarmEventKind {
    /// Stable type tag
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::FailoverCompleted { .. } => "failover_completed",
            Self::CarrierIncident { .. } => "carrier_incident",
            Self::DisputeResolved { .. } => "dispute_resolved",
            Self::FraudSuspected { .. } => "fraud_suspected",
            Self::ActionVetoed { .. } => "action_vetoed",
            Self::Escalated { .. } => "escalated",
        }
    }
}

/// Message passed through the orchestrator channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmEvent {
    /// Kind and typed payload
    pub kind: SwarmEventKind,
    /// Publishing agent
    pub source: AgentKind,
    /// Free-form extras for provenance
    pub payload: serde_json::Map<String, serde_json::Value>,
    /// When the event was produced
    pub timestamp: DateTime<Utc>,
}

impl SwarmEvent {
    /// Create new event stamped with the current time
    #[must_use]
    pub fn new(source: AgentKind, kind: SwarmEventKind) -> Self {
        Self {
            kind,
            source,
            payload: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// With an extra payload entry
    #[must_use]
    pub fn with_payload(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// With an explicit timestamp
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Stable type tag
    #[inline]
    #[must_use]
    pub fn tag(&self) -> &'static str {
        self.kind.tag()
    }
}

/// Destination for swarm events
pub trait EventSink: Send + Sync {
    /// Publish an event without waiting for it to be processed
    ///
    /// # Errors
    /// Returns `PortError::Unavailable` if the consumer has shut down
    fn publish(&self, event: SwarmEvent) -> Result<(), PortError>;
}

impl EventSink for mpsc::UnboundedSender<SwarmEvent> {
    fn publish(&self, event: SwarmEvent) -> Result<(), PortError> {
        self.send(event)
            .map_err(|_| PortError::unavailable("swarm", "event channel closed"))
    }
}

/// Sink that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: SwarmEvent) -> Result<(), PortError> {
        Ok(())
    }
}
