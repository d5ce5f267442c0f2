//! Collaborator ports
//!
//! Narrow interfaces to the systems Custos does not own:
//! - [`LedgerClient`]: submit a change, get a transaction hash
//! - [`HealthProbe`]: dashboard / notification / operator availability
//! - [`Notifier`]: operator notifications
//! - [`ConfidenceScorer`]: scores one piece of evidence on a 0-100 scale
//! - [`CostRecorder`]: fine-grained cost events for external calls

use crate::error::PortError;
use crate::types::{AgentKind, LedgerHash, OperationKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Change submitted to the external ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerPayload {
    /// Stable business key; the ledger treats submissions idempotently by it
    pub business_key: String,
    /// Operation recorded
    pub operation: OperationKind,
    /// Operation body
    pub body: serde_json::Value,
}

impl LedgerPayload {
    /// Create new payload
    #[inline]
    #[must_use]
    pub fn new(
        business_key: impl Into<String>,
        operation: OperationKind,
        body: serde_json::Value,
    ) -> Self {
        Self {
            business_key: business_key.into(),
            operation,
            body,
        }
    }

    /// Hex SHA-256 of the canonical JSON encoding
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.business_key.as_bytes());
        hasher.update([0]);
        hasher.update(self.operation.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.body.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// External ledger of record
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit a change and return its transaction hash
    async fn submit(&self, payload: LedgerPayload) -> Result<LedgerHash, PortError>;
}

/// Result of a health probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Whether supervision infrastructure is available
    pub healthy: bool,
    /// Why it is not
    pub reason: Option<String>,
}

impl HealthReport {
    /// Healthy report
    #[inline]
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            reason: None,
        }
    }

    /// Unhealthy report with a reason
    #[inline]
    #[must_use]
    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            reason: Some(reason.into()),
        }
    }
}

/// Liveness of the supervision path
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe dashboard, notification channel and operator availability
    async fn check(&self) -> Result<HealthReport, PortError>;
}

/// Operator notification channel
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send `message` on `channel`
    async fn notify(&self, channel: &str, message: &str) -> Result<(), PortError>;
}

/// Sub-check an evidence item feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    /// Are the photos/documents genuine
    Authenticity,
    /// Does the story agree with tracking data
    Consistency,
    /// How badly damaged the goods are
    Damage,
}

/// One piece of supporting evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// Sub-check this item feeds
    pub kind: EvidenceKind,
    /// Where it came from
    pub source: String,
    /// Raw evidence handed to the scorer
    pub payload: serde_json::Value,
}

impl EvidenceItem {
    /// Create new evidence item
    #[inline]
    #[must_use]
    pub fn new(kind: EvidenceKind, source: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            source: source.into(),
            payload,
        }
    }
}

/// Scores evidence on a 0-100 scale
#[async_trait]
pub trait ConfidenceScorer: Send + Sync {
    /// Score one item
    async fn score(&self, item: &EvidenceItem) -> Result<f64, PortError>;
}

/// Billable external call
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostKind {
    /// One ledger submission
    LedgerSubmission,
    /// One evidence-gathering round for a dispute
    EvidenceGathering,
}

/// One cost event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEvent {
    pub kind: CostKind,
    pub agent: AgentKind,
    pub business_key: String,
    /// Billable units (calls, scored items)
    pub units: u32,
    pub at: DateTime<Utc>,
}

impl CostEvent {
    /// Create new single-unit event stamped now
    #[must_use]
    pub fn new(kind: CostKind, agent: AgentKind, business_key: impl Into<String>) -> Self {
        Self {
            kind,
            agent,
            business_key: business_key.into(),
            units: 1,
            at: Utc::now(),
        }
    }

    /// With unit count
    #[inline]
    #[must_use]
    pub fn with_units(mut self, units: u32) -> Self {
        self.units = units;
        self
    }
}

/// Accepts cost events without blocking the caller
pub trait CostRecorder: Send + Sync {
    /// Record one event
    fn record(&self, event: CostEvent);
}

/// Recorder that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCostRecorder;

impl CostRecorder for NoopCostRecorder {
    fn record(&self, _event: CostEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digest_is_stable_and_key_sensitive() {
        let a = LedgerPayload::new("failover:SHP-1", OperationKind::CarrierFailover, json!({"to": "DHL"}));
        let b = a.clone();
        let c = LedgerPayload::new("failover:SHP-2", OperationKind::CarrierFailover, json!({"to": "DHL"}));
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.digest().len(), 64);
    }
}
