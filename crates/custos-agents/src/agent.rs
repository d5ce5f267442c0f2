//! Agent capability
//!
//! An agent turns a context (a shipment at risk, an open dispute) into a
//! [`Proposal`], and executes an approved proposal as a saga. Whether and
//! when a proposal is executed is decided by the governed pipeline.

use crate::dispute::Resolution;
use crate::error::Result;
use crate::failover::FailoverResult;
use crate::saga::CompensationRecord;
use async_trait::async_trait;
use custos_core::{
    AgentKind, CarrierId, DisputeId, LedgerHash, Money, OperationKind, ShipmentId,
    SwarmEventKind,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What an agent is asked to look at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentContext {
    /// Shipment whose carrier is failing
    Shipment { shipment: ShipmentId, reason: String },
    /// Dispute awaiting a ruling
    Dispute { dispute: DisputeId },
}

impl AgentContext {
    /// Shipment context
    #[must_use]
    pub fn shipment(shipment: impl Into<ShipmentId>, reason: impl Into<String>) -> Self {
        Self::Shipment {
            shipment: shipment.into(),
            reason: reason.into(),
        }
    }

    /// Dispute context
    #[must_use]
    pub fn dispute(dispute: impl Into<DisputeId>) -> Self {
        Self::Dispute {
            dispute: dispute.into(),
        }
    }
}

/// Dispute classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeOutcome {
    ResolveForInitiator,
    ResolveForRespondent,
    EscalateToHuman,
    RequestMoreEvidence,
}

impl DisputeOutcome {
    /// Stable tag
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResolveForInitiator => "resolve_for_initiator",
            Self::ResolveForRespondent => "resolve_for_respondent",
            Self::EscalateToHuman => "escalate_to_human",
            Self::RequestMoreEvidence => "request_more_evidence",
        }
    }

    /// Check if the outcome is a ruling an agent can execute
    #[inline]
    #[must_use]
    pub const fn is_ruling(self) -> bool {
        matches!(self, Self::ResolveForInitiator | Self::ResolveForRespondent)
    }
}

impl fmt::Display for DisputeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The change an agent wants to make
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProposedAction {
    /// Move a shipment to another carrier
    CarrierFailover {
        shipment: ShipmentId,
        from: CarrierId,
        to: CarrierId,
    },
    /// Record a ruling on a dispute
    ResolveDispute {
        dispute: DisputeId,
        respondent: CarrierId,
        outcome: DisputeOutcome,
    },
    /// Nothing the agent may do on its own
    NoAction,
}

/// Why a proposal is routed to a human regardless of policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// Confidence between the escalation floor and the auto-resolve threshold
    LowConfidence,
    /// Amount above the agent's autonomous ceiling
    AmountCeiling,
    /// Evidence is too weak to classify
    MoreEvidenceRequired,
    /// Evidence could not be gathered or scored
    EvidenceUnavailable,
    /// No acceptable alternative carrier
    NoAlternative,
}

impl EscalationReason {
    /// Stable tag
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LowConfidence => "low_confidence",
            Self::AmountCeiling => "amount_ceiling",
            Self::MoreEvidenceRequired => "more_evidence_required",
            Self::EvidenceUnavailable => "evidence_unavailable",
            Self::NoAlternative => "no_alternative",
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escalation attached to a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub reason: EscalationReason,
    pub detail: String,
}

impl Escalation {
    /// Create new escalation
    #[inline]
    #[must_use]
    pub fn new(reason: EscalationReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// An agent's proposed action with its provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub agent: AgentKind,
    pub operation: OperationKind,
    pub action: ProposedAction,
    /// Confidence in `0.0..=1.0`
    pub confidence: f64,
    /// Amount governed
    pub amount: Money,
    /// Idempotency key of the saga that would execute it
    pub business_key: String,
    pub shipment_ref: Option<ShipmentId>,
    pub counterparty_ref: Option<CarrierId>,
    /// Routed to a human before policy is consulted
    pub escalation: Option<Escalation>,
    /// Decision provenance persisted with any veto session
    pub context: serde_json::Value,
}

impl Proposal {
    /// Create new proposal
    #[must_use]
    pub fn new(
        agent: AgentKind,
        operation: OperationKind,
        action: ProposedAction,
        business_key: impl Into<String>,
    ) -> Self {
        Self {
            agent,
            operation,
            action,
            confidence: 0.0,
            amount: Money::ZERO,
            business_key: business_key.into(),
            shipment_ref: None,
            counterparty_ref: None,
            escalation: None,
            context: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// With confidence, clamped to `0.0..=1.0`
    #[inline]
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        self
    }

    /// With amount
    #[inline]
    #[must_use]
    pub fn with_amount(mut self, amount: Money) -> Self {
        self.amount = amount;
        self
    }

    /// With shipment reference
    #[inline]
    #[must_use]
    pub fn with_shipment(mut self, shipment: ShipmentId) -> Self {
        self.shipment_ref = Some(shipment);
        self
    }

    /// With counterparty reference
    #[inline]
    #[must_use]
    pub fn with_counterparty(mut self, counterparty: CarrierId) -> Self {
        self.counterparty_ref = Some(counterparty);
        self
    }

    /// With escalation
    #[inline]
    #[must_use]
    pub fn with_escalation(mut self, escalation: Escalation) -> Self {
        self.escalation = Some(escalation);
        self
    }

    /// With provenance
    #[inline]
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Check if the proposal can go through policy evaluation
    #[inline]
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.escalation.is_none() && !matches!(self.action, ProposedAction::NoAction)
    }
}

/// Result of executing a proposal
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Failover(FailoverResult),
    Resolution(Resolution),
}

impl Outcome {
    /// Check if the saga committed
    #[must_use]
    pub fn success(&self) -> bool {
        match self {
            Self::Failover(result) => result.success,
            Self::Resolution(result) => result.success,
        }
    }

    /// Ledger hash of a committed saga
    #[must_use]
    pub fn ledger_hash(&self) -> Option<&LedgerHash> {
        match self {
            Self::Failover(result) => result.ledger_hash.as_ref(),
            Self::Resolution(result) => result.ledger_hash.as_ref(),
        }
    }

    /// Check if the result came from an earlier run
    #[must_use]
    pub fn idempotent(&self) -> bool {
        match self {
            Self::Failover(result) => result.idempotent,
            Self::Resolution(result) => result.idempotent,
        }
    }

    /// Compensation applied after a ledger failure
    #[must_use]
    pub fn compensation(&self) -> Option<&CompensationRecord> {
        match self {
            Self::Failover(result) => result.compensation.as_ref(),
            Self::Resolution(result) => result.compensation.as_ref(),
        }
    }

    /// Error that caused a rollback
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failover(result) => result.error.as_deref(),
            Self::Resolution(result) => result.error.as_deref(),
        }
    }

    /// Swarm event announcing this outcome
    #[must_use]
    pub fn completion_event(&self, forced: bool) -> SwarmEventKind {
        match self {
            Self::Failover(result) => SwarmEventKind::FailoverCompleted {
                shipment: result.shipment.clone(),
                from: result.from.clone(),
                to: Some(result.to.clone()),
                success: result.success,
                forced,
            },
            Self::Resolution(result) => SwarmEventKind::DisputeResolved {
                dispute: result.dispute.clone(),
                respondent: result.respondent.clone(),
                in_favor_of_initiator: result.outcome == DisputeOutcome::ResolveForInitiator,
                success: result.success,
            },
        }
    }
}

/// Autonomous agent
#[async_trait]
pub trait Agent: Send + Sync {
    /// Which agent this is
    fn kind(&self) -> AgentKind;

    /// Build a proposal for `context`
    async fn propose(&self, context: &AgentContext) -> Result<Proposal>;

    /// Execute an approved proposal as a saga
    async fn execute(&self, proposal: &Proposal) -> Result<Outcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped() {
        let proposal = Proposal::new(
            AgentKind::Paolo,
            OperationKind::CarrierFailover,
            ProposedAction::NoAction,
            "k",
        );
        assert!((proposal.clone().with_confidence(1.4).confidence - 1.0).abs() < f64::EPSILON);
        assert!(proposal.clone().with_confidence(f64::NAN).confidence.abs() < f64::EPSILON);
        assert!(!proposal.is_executable());
    }

    #[test]
    fn escalated_proposal_is_not_executable() {
        let proposal = Proposal::new(
            AgentKind::Giulia,
            OperationKind::DisputeResolution,
            ProposedAction::ResolveDispute {
                dispute: "DSP-1".into(),
                respondent: "SDA".into(),
                outcome: DisputeOutcome::ResolveForInitiator,
            },
            "dispute:DSP-1",
        )
        .with_escalation(Escalation::new(EscalationReason::AmountCeiling, "€9000.00"));
        assert!(!proposal.is_executable());
    }

    #[test]
    fn context_serializes_with_type_tag() {
        let json = serde_json::to_value(AgentContext::dispute("DSP-9")).unwrap();
        assert_eq!(json["type"], "dispute");
        assert_eq!(json["dispute"], "DSP-9");
    }
}
