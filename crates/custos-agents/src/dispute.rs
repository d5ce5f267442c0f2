//! Dispute resolution agent (GIULIA)
//!
//! Scores the evidence of an open dispute and classifies it:
//! 1. Claimed amount above the ceiling: escalate
//! 2. Confidence at or above the auto-resolve threshold: rule for the
//!    respondent when delivery is verified, otherwise for the initiator
//! 3. Confidence at or above the escalation floor: escalate
//! 4. Otherwise: request more evidence
//!
//! Confidence is on a 0-100 scale here and on 0-1 in the proposal.

use crate::agent::{
    Agent, AgentContext, DisputeOutcome, Escalation, EscalationReason, Outcome, Proposal,
    ProposedAction,
};
use crate::error::{AgentError, Result, StoreError};
use crate::evidence::{EvidenceGatherer, EvidenceScores};
use crate::saga::{CompensatingAction, CompensationRecord, SagaExecutor, SagaOutcome, SagaStep};
use crate::store::{DisputeRecord, DisputeStatus, Ruling, ShipmentStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use custos_core::{
    AgentKind, CarrierId, CostEvent, CostKind, CostRecorder, DisputeId, EventSink, LedgerHash,
    LedgerPayload, Money, NoopCostRecorder, OperationKind, SwarmEvent, SwarmEventKind,
};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Classification thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisputeConfig {
    /// Minimum confidence (0-100) for an automatic ruling
    pub auto_resolve_threshold: f64,
    /// Minimum confidence (0-100) for escalation instead of more evidence
    pub escalation_floor: f64,
    /// Claims above this always go to a human
    pub amount_ceiling: Money,
    /// Consistency (0-100) below which a verified delivery looks fraudulent
    pub fraud_consistency_cutoff: f64,
}

impl Default for DisputeConfig {
    fn default() -> Self {
        Self {
            auto_resolve_threshold: 85.0,
            escalation_floor: 60.0,
            amount_ceiling: Money::from_euros(5_000),
            fraud_consistency_cutoff: 30.0,
        }
    }
}

/// Classify a dispute
#[must_use]
pub fn classify(
    config: &DisputeConfig,
    claimed_amount: Money,
    confidence: f64,
    delivery_verified: bool,
) -> DisputeOutcome {
    if claimed_amount > config.amount_ceiling {
        DisputeOutcome::EscalateToHuman
    } else if confidence >= config.auto_resolve_threshold {
        if delivery_verified {
            DisputeOutcome::ResolveForRespondent
        } else {
            DisputeOutcome::ResolveForInitiator
        }
    } else if confidence >= config.escalation_floor {
        DisputeOutcome::EscalateToHuman
    } else {
        DisputeOutcome::RequestMoreEvidence
    }
}

/// Result of a resolution saga
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub dispute: DisputeId,
    pub respondent: CarrierId,
    pub outcome: DisputeOutcome,
    pub success: bool,
    pub ledger_hash: Option<LedgerHash>,
    pub compensation: Option<CompensationRecord>,
    pub idempotent: bool,
    pub error: Option<String>,
}

struct ResolutionStep {
    business_key: String,
    dispute: DisputeId,
    ruling: Ruling,
}

#[async_trait]
impl SagaStep for ResolutionStep {
    fn business_key(&self) -> String {
        self.business_key.clone()
    }

    fn agent(&self) -> AgentKind {
        AgentKind::Giulia
    }

    async fn apply_local(
        &self,
        store: &dyn ShipmentStore,
        now: DateTime<Utc>,
    ) -> Result<(CompensatingAction, LedgerPayload)> {
        let before = store
            .get_dispute(&self.dispute)
            .await?
            .ok_or_else(|| StoreError::not_found("dispute", &self.dispute))?;
        if before.status != DisputeStatus::Open {
            return Err(AgentError::Stale {
                business_key: self.business_key.clone(),
                detail: format!("dispute {} is no longer open", self.dispute),
            });
        }

        let mut after = before.clone();
        after.status = DisputeStatus::Resolved;
        after.ruling = Some(self.ruling);
        after.version += 1;
        after.updated_at = now;
        store.update_dispute(after, before.version).await?;

        let payload = LedgerPayload::new(
            self.business_key.clone(),
            OperationKind::DisputeResolution,
            json!({
                "dispute": self.dispute,
                "shipment": before.shipment,
                "respondent": before.respondent,
                "ruling": self.ruling,
                "amount": before.claimed_amount,
            }),
        );
        Ok((CompensatingAction::RestoreDispute(before), payload))
    }

    async fn finalize(
        &self,
        store: &dyn ShipmentStore,
        ledger_hash: &LedgerHash,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let current = store
            .get_dispute(&self.dispute)
            .await?
            .ok_or_else(|| StoreError::not_found("dispute", &self.dispute))?;
        let mut finalized = current.clone();
        finalized.ledger_tx_hash = Some(ledger_hash.clone());
        finalized.version += 1;
        finalized.updated_at = now;
        store.update_dispute(finalized, current.version).await?;
        Ok(())
    }
}

/// GIULIA
pub struct DisputeAgent {
    executor: Arc<SagaExecutor>,
    evidence: EvidenceGatherer,
    events: Arc<dyn EventSink>,
    cost: Arc<dyn CostRecorder>,
    config: DisputeConfig,
    // Open disputes already reported as suspected fraud
    flagged: DashSet<DisputeId>,
}

impl std::fmt::Debug for DisputeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisputeAgent")
            .field("evidence", &self.evidence)
            .field("config", &self.config)
            .field("flagged", &self.flagged.len())
            .finish_non_exhaustive()
    }
}

impl DisputeAgent {
    /// Create new agent
    #[must_use]
    pub fn new(
        executor: Arc<SagaExecutor>,
        evidence: EvidenceGatherer,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            executor,
            evidence,
            events,
            cost: Arc::new(NoopCostRecorder),
            config: DisputeConfig::default(),
            flagged: DashSet::new(),
        }
    }

    /// With config
    #[inline]
    #[must_use]
    pub fn with_config(mut self, config: DisputeConfig) -> Self {
        self.config = config;
        self
    }

    /// With cost recorder
    #[inline]
    #[must_use]
    pub fn with_cost(mut self, cost: Arc<dyn CostRecorder>) -> Self {
        self.cost = cost;
        self
    }

    /// Active config
    #[must_use]
    pub fn config(&self) -> &DisputeConfig {
        &self.config
    }

    fn store(&self) -> &dyn ShipmentStore {
        self.executor.store().as_ref()
    }

    fn publish(&self, kind: SwarmEventKind) {
        let event = SwarmEvent::new(AgentKind::Giulia, kind).at(self.executor.clock().now());
        if let Err(err) = self.events.publish(event) {
            tracing::warn!(error = %err, "failed to publish swarm event");
        }
    }

    /// Flag a verified delivery whose consistency evidence scored low
    ///
    /// Absent consistency evidence proves nothing, and each dispute is
    /// reported once however often it is re-proposed.
    fn check_fraud(&self, record: &DisputeRecord, scores: &EvidenceScores) {
        let contradicted = record.delivery_verified
            && scores.has_consistency()
            && scores.consistency < self.config.fraud_consistency_cutoff;
        if contradicted && self.flagged.insert(record.id.clone()) {
            tracing::warn!(
                dispute = %record.id,
                respondent = %record.respondent,
                consistency = scores.consistency,
                "verified delivery contradicted by evidence"
            );
            self.publish(SwarmEventKind::FraudSuspected {
                counterparty: record.respondent.clone(),
                dispute: Some(record.id.clone()),
                detail: format!(
                    "delivery claimed verified but consistency scored {:.1}",
                    scores.consistency
                ),
            });
        }
    }
}

/// Business key of a dispute ruling
#[must_use]
pub fn dispute_key(dispute: &DisputeId) -> String {
    format!("dispute:{dispute}")
}

#[async_trait]
impl Agent for DisputeAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Giulia
    }

    async fn propose(&self, context: &AgentContext) -> Result<Proposal> {
        let AgentContext::Dispute { dispute } = context else {
            return Err(AgentError::UnsupportedContext {
                agent: AgentKind::Giulia.as_str(),
                detail: "expected a dispute".into(),
            });
        };

        let record = self
            .store()
            .get_dispute(dispute)
            .await?
            .ok_or_else(|| StoreError::not_found("dispute", dispute))?;
        let key = dispute_key(dispute);
        if record.status != DisputeStatus::Open {
            return Err(AgentError::NotExecutable {
                business_key: key,
                reason: format!("dispute {dispute} is no longer open"),
            });
        }

        let collected = self.evidence.collect(&record).await;
        self.cost.record(
            CostEvent::new(CostKind::EvidenceGathering, AgentKind::Giulia, key.clone()).with_units(
                collected
                    .as_ref()
                    .map_or(1, |scores| u32::try_from(scores.items.max(1)).unwrap_or(u32::MAX)),
            ),
        );

        let base = |action: ProposedAction| {
            Proposal::new(AgentKind::Giulia, OperationKind::DisputeResolution, action, key.clone())
                .with_amount(record.claimed_amount)
                .with_shipment(record.shipment.clone())
                .with_counterparty(record.respondent.clone())
        };

        let scores = match collected {
            Ok(scores) => scores,
            Err(err) => {
                tracing::warn!(dispute = %dispute, error = %err, "evidence unavailable, escalating");
                return Ok(base(ProposedAction::NoAction)
                    .with_escalation(Escalation::new(
                        EscalationReason::EvidenceUnavailable,
                        err.to_string(),
                    ))
                    .with_context(json!({ "evidence_error": err.to_string() })));
            }
        };

        self.check_fraud(&record, &scores);

        let confidence = scores.confidence();
        let outcome = classify(
            &self.config,
            record.claimed_amount,
            confidence,
            record.delivery_verified,
        );
        let context = json!({
            "scores": scores,
            "confidence": confidence,
            "outcome": outcome,
            "delivery_verified": record.delivery_verified,
            "auto_resolve_threshold": self.config.auto_resolve_threshold,
        });

        let proposal = match outcome {
            DisputeOutcome::ResolveForInitiator | DisputeOutcome::ResolveForRespondent => {
                base(ProposedAction::ResolveDispute {
                    dispute: dispute.clone(),
                    respondent: record.respondent.clone(),
                    outcome,
                })
            }
            DisputeOutcome::EscalateToHuman => {
                let escalation = if record.claimed_amount > self.config.amount_ceiling {
                    Escalation::new(
                        EscalationReason::AmountCeiling,
                        format!(
                            "claim {} exceeds ceiling {}",
                            record.claimed_amount, self.config.amount_ceiling
                        ),
                    )
                } else {
                    Escalation::new(
                        EscalationReason::LowConfidence,
                        format!(
                            "confidence {confidence:.1} below {:.1}",
                            self.config.auto_resolve_threshold
                        ),
                    )
                };
                base(ProposedAction::NoAction).with_escalation(escalation)
            }
            DisputeOutcome::RequestMoreEvidence => base(ProposedAction::NoAction).with_escalation(
                Escalation::new(
                    EscalationReason::MoreEvidenceRequired,
                    format!(
                        "confidence {confidence:.1} below {:.1}",
                        self.config.escalation_floor
                    ),
                ),
            ),
        };

        tracing::info!(
            dispute = %dispute,
            confidence,
            outcome = %outcome,
            "dispute classified"
        );
        Ok(proposal
            .with_confidence(confidence / 100.0)
            .with_context(context))
    }

    async fn execute(&self, proposal: &Proposal) -> Result<Outcome> {
        if proposal.agent != AgentKind::Giulia {
            return Err(AgentError::WrongAgent {
                expected: AgentKind::Giulia.as_str(),
                actual: proposal.agent.as_str(),
            });
        }
        let ProposedAction::ResolveDispute {
            dispute,
            respondent,
            outcome,
        } = &proposal.action
        else {
            return Err(AgentError::NotExecutable {
                business_key: proposal.business_key.clone(),
                reason: "not a dispute ruling".into(),
            });
        };
        let ruling = match outcome {
            DisputeOutcome::ResolveForInitiator => Ruling::ForInitiator,
            DisputeOutcome::ResolveForRespondent => Ruling::ForRespondent,
            other => {
                return Err(AgentError::NotExecutable {
                    business_key: proposal.business_key.clone(),
                    reason: format!("{other} is not a ruling"),
                })
            }
        };

        let step = ResolutionStep {
            business_key: proposal.business_key.clone(),
            dispute: dispute.clone(),
            ruling,
        };
        let mut resolution = Resolution {
            dispute: dispute.clone(),
            respondent: respondent.clone(),
            outcome: *outcome,
            success: false,
            ledger_hash: None,
            compensation: None,
            idempotent: false,
            error: None,
        };
        match self.executor.run(&step).await? {
            SagaOutcome::Committed {
                ledger_hash,
                idempotent,
            } => {
                resolution.success = true;
                resolution.ledger_hash = Some(ledger_hash);
                resolution.idempotent = idempotent;
                self.flagged.remove(dispute);
            }
            SagaOutcome::RolledBack {
                error,
                compensation,
                ..
            } => {
                resolution.error = Some(error);
                resolution.compensation = Some(compensation);
            }
        }
        Ok(Outcome::Resolution(resolution))
    }
}
