//! Carrier failover agent (PAOLO)
//!
//! Moves shipments away from a failing carrier to the most reliable active
//! alternative. Confidence is the alternative's reliability. Every attempt,
//! committed or rolled back, leaves one [`CarrierChange`].

use crate::agent::{
    Agent, AgentContext, Escalation, EscalationReason, Outcome, Proposal, ProposedAction,
};
use crate::error::{AgentError, Result, StoreError};
use crate::risk::{classify, CarrierRisk};
use crate::saga::{CompensatingAction, CompensationRecord, SagaExecutor, SagaOutcome, SagaStep};
use crate::store::{CarrierChange, CarrierRecord, ShipmentStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use custos_core::{
    AgentKind, CarrierId, EventSink, LedgerHash, LedgerPayload, OperationKind, ShipmentId,
    SwarmEvent, SwarmEventKind,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Failover tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Alternatives below this reliability are never proposed
    pub min_alternative_reliability: f64,
    /// Carriers below this reliability are at risk
    pub risk_threshold: f64,
    /// Background risk scan period
    pub scan_interval_secs: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            min_alternative_reliability: 0.85,
            risk_threshold: 0.85,
            scan_interval_secs: 300,
        }
    }
}

/// Result of a failover saga
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverResult {
    pub shipment: ShipmentId,
    pub from: CarrierId,
    pub to: CarrierId,
    pub success: bool,
    pub ledger_hash: Option<LedgerHash>,
    pub compensation: Option<CompensationRecord>,
    pub idempotent: bool,
    pub error: Option<String>,
}

/// Local half of a failover
struct FailoverStep {
    business_key: String,
    shipment: ShipmentId,
    from: CarrierId,
    to: CarrierId,
    reason: String,
}

#[async_trait]
impl SagaStep for FailoverStep {
    fn business_key(&self) -> String {
        self.business_key.clone()
    }

    fn agent(&self) -> AgentKind {
        AgentKind::Paolo
    }

    async fn apply_local(
        &self,
        store: &dyn ShipmentStore,
        now: DateTime<Utc>,
    ) -> Result<(CompensatingAction, LedgerPayload)> {
        let before = store
            .get_shipment(&self.shipment)
            .await?
            .ok_or_else(|| StoreError::not_found("shipment", &self.shipment))?;
        if before.carrier != self.from {
            return Err(AgentError::Stale {
                business_key: self.business_key.clone(),
                detail: format!(
                    "shipment {} is now with {}, not {}",
                    self.shipment, before.carrier, self.from
                ),
            });
        }

        let mut after = before.clone();
        after.carrier = self.to.clone();
        after.version += 1;
        after.updated_at = now;
        store.update_shipment(after, before.version).await?;

        let payload = LedgerPayload::new(
            self.business_key.clone(),
            OperationKind::CarrierFailover,
            json!({
                "shipment": self.shipment,
                "from": self.from,
                "to": self.to,
                "value": before.value,
                "reason": self.reason,
            }),
        );
        Ok((CompensatingAction::RestoreShipment(before), payload))
    }

    async fn finalize(
        &self,
        store: &dyn ShipmentStore,
        ledger_hash: &LedgerHash,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let current = store
            .get_shipment(&self.shipment)
            .await?
            .ok_or_else(|| StoreError::not_found("shipment", &self.shipment))?;
        let mut finalized = current.clone();
        finalized.ledger_tx_hash = Some(ledger_hash.clone());
        finalized.version += 1;
        finalized.updated_at = now;
        store.update_shipment(finalized, current.version).await?;
        Ok(())
    }
}

/// Business key of a failover away from `from`
#[must_use]
pub fn failover_key(shipment: &ShipmentId, from: &CarrierId) -> String {
    format!("failover:{shipment}:{from}")
}

/// PAOLO
pub struct FailoverAgent {
    executor: Arc<SagaExecutor>,
    events: Arc<dyn EventSink>,
    config: FailoverConfig,
}

impl std::fmt::Debug for FailoverAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverAgent")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FailoverAgent {
    /// Create new agent
    #[must_use]
    pub fn new(executor: Arc<SagaExecutor>, events: Arc<dyn EventSink>) -> Self {
        Self {
            executor,
            events,
            config: FailoverConfig::default(),
        }
    }

    /// With config
    #[inline]
    #[must_use]
    pub fn with_config(mut self, config: FailoverConfig) -> Self {
        self.config = config;
        self
    }

    /// Active config
    #[must_use]
    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Store the agent reads and writes
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ShipmentStore> {
        self.executor.store()
    }

    /// Most reliable active carrier other than `current`
    ///
    /// Ties break on carrier id so the choice is deterministic.
    ///
    /// # Errors
    /// Returns the store error if carriers cannot be listed
    pub async fn best_alternative(&self, current: &CarrierId) -> Result<Option<CarrierRecord>> {
        let carriers = self.store().list_carriers().await?;
        Ok(carriers
            .into_iter()
            .filter(|carrier| {
                carrier.active
                    && &carrier.id != current
                    && carrier.reliability >= self.config.min_alternative_reliability
            })
            .max_by(|a, b| {
                a.reliability
                    .total_cmp(&b.reliability)
                    .then_with(|| b.id.cmp(&a.id))
            }))
    }

    /// Carriers below the risk threshold, worst first
    ///
    /// Publishes a `CarrierIncident` for every carrier at risk.
    ///
    /// # Errors
    /// Returns the store error if carriers cannot be listed
    pub async fn scan_risks(&self) -> Result<Vec<CarrierRisk>> {
        let mut risks: Vec<CarrierRisk> = self
            .store()
            .list_carriers()
            .await?
            .into_iter()
            .filter(|carrier| carrier.active)
            .filter_map(|carrier| {
                classify(carrier.reliability, self.config.risk_threshold).map(|level| CarrierRisk {
                    carrier: carrier.id,
                    reliability: carrier.reliability,
                    level,
                })
            })
            .collect();
        risks.sort_by(|a, b| a.reliability.total_cmp(&b.reliability));

        for risk in &risks {
            tracing::info!(
                carrier = %risk.carrier,
                reliability = risk.reliability,
                level = %risk.level,
                "carrier at risk"
            );
            self.publish(SwarmEventKind::CarrierIncident {
                carrier: risk.carrier.clone(),
                detail: format!("reliability {:.2} ({})", risk.reliability, risk.level),
            });
        }
        Ok(risks)
    }

    /// Fail a shipment over without consulting governance
    ///
    /// Used for containment after a blacklist. The completion event is
    /// published with `forced = true`.
    ///
    /// # Errors
    /// - `AgentError::NotExecutable` if no alternative carrier qualifies
    /// - store errors from the local step
    pub async fn force_failover(&self, shipment: &ShipmentId, reason: &str) -> Result<FailoverResult> {
        let proposal = self.propose(&AgentContext::shipment(shipment.clone(), reason)).await?;
        if !matches!(proposal.action, ProposedAction::CarrierFailover { .. }) {
            return Err(AgentError::NotExecutable {
                business_key: proposal.business_key,
                reason: proposal
                    .escalation
                    .map_or_else(|| "no failover proposed".to_string(), |e| e.detail),
            });
        }

        let result = self.run_failover(&proposal, reason, "system:containment").await?;
        tracing::warn!(
            shipment = %result.shipment,
            from = %result.from,
            to = %result.to,
            success = result.success,
            "forced failover"
        );
        self.publish(Outcome::Failover(result.clone()).completion_event(true));
        Ok(result)
    }

    async fn run_failover(
        &self,
        proposal: &Proposal,
        reason: &str,
        executed_by: &str,
    ) -> Result<FailoverResult> {
        let ProposedAction::CarrierFailover { shipment, from, to } = &proposal.action else {
            return Err(AgentError::NotExecutable {
                business_key: proposal.business_key.clone(),
                reason: "not a carrier failover".into(),
            });
        };

        let step = FailoverStep {
            business_key: proposal.business_key.clone(),
            shipment: shipment.clone(),
            from: from.clone(),
            to: to.clone(),
            reason: reason.to_string(),
        };
        let outcome = self.executor.run(&step).await?;

        let mut result = FailoverResult {
            shipment: shipment.clone(),
            from: from.clone(),
            to: to.clone(),
            success: outcome.is_committed(),
            ledger_hash: None,
            compensation: None,
            idempotent: false,
            error: None,
        };
        match outcome {
            SagaOutcome::Committed {
                ledger_hash,
                idempotent,
            } => {
                result.ledger_hash = Some(ledger_hash);
                result.idempotent = idempotent;
            }
            SagaOutcome::RolledBack {
                error,
                compensation,
                ..
            } => {
                result.error = Some(error);
                result.compensation = Some(compensation);
            }
        }

        if !result.idempotent {
            self.store()
                .insert_carrier_change(CarrierChange {
                    id: Uuid::new_v4(),
                    business_key: proposal.business_key.clone(),
                    shipment_ref: shipment.clone(),
                    old_counterparty: from.clone(),
                    new_counterparty: result.success.then(|| to.clone()),
                    reason: reason.to_string(),
                    executed_by: executed_by.to_string(),
                    ledger_tx_hash: result.ledger_hash.clone(),
                    success: result.success,
                    rollback_tx_hash: None,
                    created_at: self.executor.clock().now(),
                })
                .await?;
        }
        Ok(result)
    }

    fn publish(&self, kind: SwarmEventKind) {
        let event = SwarmEvent::new(AgentKind::Paolo, kind).at(self.executor.clock().now());
        if let Err(err) = self.events.publish(event) {
            tracing::warn!(error = %err, "failed to publish swarm event");
        }
    }
}

#[async_trait]
impl Agent for FailoverAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Paolo
    }

    async fn propose(&self, context: &AgentContext) -> Result<Proposal> {
        let AgentContext::Shipment { shipment, reason } = context else {
            return Err(AgentError::UnsupportedContext {
                agent: AgentKind::Paolo.as_str(),
                detail: "expected a shipment".into(),
            });
        };

        let record = self
            .store()
            .get_shipment(shipment)
            .await?
            .ok_or_else(|| StoreError::not_found("shipment", shipment))?;
        let key = failover_key(shipment, &record.carrier);
        if !record.status.is_active() {
            return Err(AgentError::NotExecutable {
                business_key: key,
                reason: format!("shipment {shipment} is no longer active"),
            });
        }

        let current_reliability = self
            .store()
            .get_carrier(&record.carrier)
            .await?
            .map(|carrier| carrier.reliability);

        let proposal = match self.best_alternative(&record.carrier).await? {
            Some(alternative) => Proposal::new(
                AgentKind::Paolo,
                OperationKind::CarrierFailover,
                ProposedAction::CarrierFailover {
                    shipment: shipment.clone(),
                    from: record.carrier.clone(),
                    to: alternative.id.clone(),
                },
                key,
            )
            .with_confidence(alternative.reliability)
            .with_context(json!({
                "reason": reason,
                "current_reliability": current_reliability,
                "alternative": alternative.id,
                "alternative_reliability": alternative.reliability,
            })),
            None => Proposal::new(
                AgentKind::Paolo,
                OperationKind::CarrierFailover,
                ProposedAction::NoAction,
                key,
            )
            .with_escalation(Escalation::new(
                EscalationReason::NoAlternative,
                format!(
                    "no active carrier at or above {:.2} reliability",
                    self.config.min_alternative_reliability
                ),
            ))
            .with_context(json!({
                "reason": reason,
                "current_reliability": current_reliability,
            })),
        };

        tracing::debug!(
            shipment = %shipment,
            business_key = %proposal.business_key,
            confidence = proposal.confidence,
            "failover proposed"
        );
        Ok(proposal
            .with_amount(record.value)
            .with_shipment(shipment.clone())
            .with_counterparty(record.carrier))
    }

    async fn execute(&self, proposal: &Proposal) -> Result<Outcome> {
        if proposal.agent != AgentKind::Paolo {
            return Err(AgentError::WrongAgent {
                expected: AgentKind::Paolo.as_str(),
                actual: proposal.agent.as_str(),
            });
        }
        let reason = proposal
            .context
            .get("reason")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("carrier failover")
            .to_string();
        let result = self
            .run_failover(proposal, &reason, &AgentKind::Paolo.ai_actor())
            .await?;
        Ok(Outcome::Failover(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryShipmentStore, ShipmentRecord};
    use custos_core::{Money, NullSink, PortError};
    use pretty_assertions::assert_eq;

    struct EchoLedger;

    #[async_trait]
    impl custos_core::LedgerClient for EchoLedger {
        async fn submit(&self, payload: LedgerPayload) -> std::result::Result<LedgerHash, PortError> {
            Ok(LedgerHash::new(payload.digest()))
        }
    }

    async fn agent_with(carriers: &[(&str, f64)]) -> (FailoverAgent, Arc<InMemoryShipmentStore>) {
        let store = Arc::new(InMemoryShipmentStore::new());
        for (id, reliability) in carriers {
            store
                .put_carrier(CarrierRecord::new(*id, *id, *reliability))
                .await
                .unwrap();
        }
        store
            .put_shipment(ShipmentRecord::new("SHP-1", "BRT", Money::from_euros(7_500)))
            .await
            .unwrap();
        let executor = Arc::new(SagaExecutor::new(store.clone(), Arc::new(EchoLedger)));
        (FailoverAgent::new(executor, Arc::new(NullSink)), store)
    }

    #[tokio::test]
    async fn proposes_most_reliable_alternative() {
        let (agent, _) = agent_with(&[("BRT", 0.40), ("GLS", 0.91), ("SDA", 0.97), ("TNT", 0.80)]).await;
        let proposal = agent
            .propose(&AgentContext::shipment("SHP-1", "missed pickups"))
            .await
            .unwrap();

        assert_eq!(
            proposal.action,
            ProposedAction::CarrierFailover {
                shipment: "SHP-1".into(),
                from: "BRT".into(),
                to: "SDA".into(),
            }
        );
        assert!((proposal.confidence - 0.97).abs() < 1e-9);
        assert_eq!(proposal.amount, Money::from_euros(7_500));
        assert_eq!(proposal.business_key, "failover:SHP-1:BRT");
        assert!(proposal.is_executable());
    }

    #[tokio::test]
    async fn escalates_when_no_alternative_qualifies() {
        let (agent, _) = agent_with(&[("BRT", 0.40), ("TNT", 0.80)]).await;
        let proposal = agent
            .propose(&AgentContext::shipment("SHP-1", "missed pickups"))
            .await
            .unwrap();
        assert_eq!(proposal.action, ProposedAction::NoAction);
        assert_eq!(
            proposal.escalation.map(|e| e.reason),
            Some(EscalationReason::NoAlternative)
        );
    }

    #[tokio::test]
    async fn execute_moves_shipment_and_records_change() {
        let (agent, store) = agent_with(&[("BRT", 0.40), ("SDA", 0.97)]).await;
        let proposal = agent
            .propose(&AgentContext::shipment("SHP-1", "missed pickups"))
            .await
            .unwrap();
        let outcome = agent.execute(&proposal).await.unwrap();
        assert!(outcome.success());

        let shipment = store.get_shipment(&"SHP-1".into()).await.unwrap().unwrap();
        assert_eq!(shipment.carrier, CarrierId::new("SDA"));
        assert_eq!(shipment.ledger_tx_hash.as_ref(), outcome.ledger_hash());

        let changes = store.carrier_changes_for(&"SHP-1".into()).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].executed_by, "ai:paolo");
        assert_eq!(changes[0].reason, "missed pickups");
        assert_eq!(changes[0].new_counterparty, Some(CarrierId::new("SDA")));
    }

    #[tokio::test]
    async fn stale_proposal_is_refused() {
        let (agent, store) = agent_with(&[("BRT", 0.40), ("SDA", 0.97)]).await;
        let proposal = agent
            .propose(&AgentContext::shipment("SHP-1", "missed pickups"))
            .await
            .unwrap();
        let mut moved = store.get_shipment(&"SHP-1".into()).await.unwrap().unwrap();
        moved.carrier = "GLS".into();
        store.put_shipment(moved).await.unwrap();

        let err = agent.execute(&proposal).await.unwrap_err();
        assert!(matches!(err, AgentError::Stale { .. }));
    }

    #[tokio::test]
    async fn rejects_dispute_context() {
        let (agent, _) = agent_with(&[]).await;
        let err = agent.propose(&AgentContext::dispute("DSP-1")).await.unwrap_err();
        assert!(matches!(err, AgentError::UnsupportedContext { .. }));
    }
}
