//! Governed execution pipeline
//!
//! propose → evaluate → one of:
//! - `FullAuto`: execute now
//! - `HumanOnTheLoop`: open a veto window, wait for it to resolve, execute
//!   unless vetoed, then commit (or cancel after a rollback)
//! - `HumanInTheLoop` / `DualControl`: notify an operator and stop
//!
//! Proposals that carry their own escalation skip policy evaluation. Every run
//! ends executed, failed with rollback, vetoed, or escalated, and publishes a
//! swarm event.

use crate::agent::{Agent, AgentContext, Outcome, Proposal};
use crate::error::{AgentError, Result};
use custos_core::{
    AgentKind, EventSink, Notifier, SharedClock, SwarmEvent, SwarmEventKind, SystemClock,
};
use custos_policy::{Decision, DecisionMode, GovernanceEngine};
use custos_veto::{OpenParams, VetoService, VetoSession, VetoStatus};
use serde_json::json;
use std::sync::Arc;

/// Default operator channel for escalations
pub const ESCALATION_CHANNEL: &str = "operations";

/// How a governed run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Saga committed
    Executed {
        proposal: Proposal,
        decision: Decision,
        outcome: Outcome,
        session: Option<VetoSession>,
    },
    /// Saga rolled back
    Failed {
        proposal: Proposal,
        decision: Decision,
        outcome: Outcome,
        session: Option<VetoSession>,
    },
    /// A human vetoed or withdrew the action inside its window
    Vetoed {
        proposal: Proposal,
        decision: Decision,
        session: VetoSession,
    },
    /// Routed to a human
    Escalated {
        proposal: Proposal,
        decision: Option<Decision>,
        reason: String,
    },
}

impl RunOutcome {
    /// Stable tag
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Executed { .. } => "executed",
            Self::Failed { .. } => "failed",
            Self::Vetoed { .. } => "vetoed",
            Self::Escalated { .. } => "escalated",
        }
    }

    /// Proposal the run was about
    #[must_use]
    pub fn proposal(&self) -> &Proposal {
        match self {
            Self::Executed { proposal, .. }
            | Self::Failed { proposal, .. }
            | Self::Vetoed { proposal, .. }
            | Self::Escalated { proposal, .. } => proposal,
        }
    }

    /// Check if the action reached the ledger
    #[inline]
    #[must_use]
    pub fn is_executed(&self) -> bool {
        matches!(self, Self::Executed { .. })
    }
}

/// Runs agents under governance
#[derive(Clone)]
pub struct GovernedRunner {
    engine: Arc<GovernanceEngine>,
    veto: VetoService,
    events: Arc<dyn EventSink>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: SharedClock,
    escalation_channel: String,
}

impl std::fmt::Debug for GovernedRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernedRunner")
            .field("escalation_channel", &self.escalation_channel)
            .finish_non_exhaustive()
    }
}

impl GovernedRunner {
    /// Create new runner
    #[must_use]
    pub fn new(engine: Arc<GovernanceEngine>, veto: VetoService, events: Arc<dyn EventSink>) -> Self {
        Self {
            engine,
            veto,
            events,
            notifier: None,
            clock: Arc::new(SystemClock),
            escalation_channel: ESCALATION_CHANNEL.to_string(),
        }
    }

    /// With operator notifier
    #[inline]
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// With clock
    #[inline]
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// With escalation channel
    #[inline]
    #[must_use]
    pub fn with_escalation_channel(mut self, channel: impl Into<String>) -> Self {
        self.escalation_channel = channel.into();
        self
    }

    /// Veto service sessions are opened on
    #[must_use]
    pub fn veto(&self) -> &VetoService {
        &self.veto
    }

    /// Propose for `context` and run the proposal under governance
    ///
    /// # Errors
    /// Returns agent, store or veto errors; ledger failures are reported as
    /// [`RunOutcome::Failed`]
    pub async fn run(&self, agent: &dyn Agent, context: &AgentContext) -> Result<RunOutcome> {
        let proposal = agent.propose(context).await?;
        self.run_proposal(agent, proposal).await
    }

    /// Run an existing proposal under governance
    ///
    /// # Errors
    /// See [`GovernedRunner::run`]
    pub async fn run_proposal(&self, agent: &dyn Agent, proposal: Proposal) -> Result<RunOutcome> {
        if let Some(escalation) = proposal.escalation.clone() {
            let reason = format!("{}: {}", escalation.reason, escalation.detail);
            return Ok(self.escalate(proposal, None, reason).await);
        }

        let decision = self
            .engine
            .evaluate(
                agent.kind(),
                proposal.amount,
                Some(proposal.confidence),
                self.clock.now(),
            )
            .await;

        match decision.mode {
            DecisionMode::FullAuto => {
                let outcome = agent.execute(&proposal).await?;
                Ok(self.finish(proposal, decision, outcome, None))
            }
            DecisionMode::HumanOnTheLoop => self.supervise(agent, proposal, decision).await,
            DecisionMode::HumanInTheLoop | DecisionMode::DualControl => {
                let reason = format!("{} required ({})", decision.mode, decision.reason);
                Ok(self.escalate(proposal, Some(decision), reason).await)
            }
        }
    }

    async fn supervise(
        &self,
        agent: &dyn Agent,
        proposal: Proposal,
        decision: Decision,
    ) -> Result<RunOutcome> {
        let Some(timeout) = decision.supervision_timeout else {
            let reason = "veto window without a timeout".to_string();
            return Ok(self.escalate(proposal, Some(decision), reason).await);
        };

        let mut params = OpenParams::new(proposal.agent, proposal.operation, proposal.amount)
            .with_confidence(proposal.confidence)
            .with_context(json!({
                "business_key": proposal.business_key,
                "action": proposal.action,
                "decision": decision,
                "provenance": proposal.context,
            }));
        if let Some(shipment) = &proposal.shipment_ref {
            params = params.with_shipment(shipment.clone());
        }
        if let Some(counterparty) = &proposal.counterparty_ref {
            params = params.with_counterparty(counterparty.clone());
        }

        let opened = self.veto.open(params, timeout).await?;
        let resolved = self.veto.wait_for_resolution(opened.id).await?;

        match resolved.status {
            VetoStatus::Vetoed | VetoStatus::Cancelled => {
                tracing::info!(
                    session = %resolved.id,
                    business_key = %proposal.business_key,
                    status = %resolved.status,
                    "proposal stopped inside veto window"
                );
                self.publish(
                    proposal.agent,
                    SwarmEventKind::ActionVetoed {
                        session: resolved.id,
                        counterparty: proposal.counterparty_ref.clone(),
                    },
                );
                metrics::counter!("custos_runs_total", "outcome" => "vetoed").increment(1);
                Ok(RunOutcome::Vetoed {
                    proposal,
                    decision,
                    session: resolved,
                })
            }
            VetoStatus::Expired => {
                let outcome = match agent.execute(&proposal).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        self.withdraw(&resolved, proposal.agent, &err.to_string()).await;
                        return Err(err);
                    }
                };
                let session = if outcome.success() {
                    match self.veto.commit(resolved.id, outcome.ledger_hash().cloned()).await {
                        Ok(session) => session,
                        Err(err) => {
                            tracing::error!(
                                session = %resolved.id,
                                business_key = %proposal.business_key,
                                error = %err,
                                "ledger committed but veto session commit failed"
                            );
                            self.publish(proposal.agent, outcome.completion_event(false));
                            return Err(err.into());
                        }
                    }
                } else {
                    let reason = format!(
                        "saga rolled back: {}",
                        outcome.error().unwrap_or("ledger failure")
                    );
                    self.withdraw(&resolved, proposal.agent, &reason)
                        .await
                        .unwrap_or(resolved)
                };
                Ok(self.finish(proposal, decision, outcome, Some(session)))
            }
            other => Err(AgentError::Stale {
                business_key: proposal.business_key,
                detail: format!("veto session {} resolved as {other}", resolved.id),
            }),
        }
    }

    async fn withdraw(&self, session: &VetoSession, agent: AgentKind, reason: &str) -> Option<VetoSession> {
        match self.veto.cancel(session.id, &agent.ai_actor(), reason).await {
            Ok(cancelled) => Some(cancelled),
            Err(err) => {
                tracing::error!(session = %session.id, error = %err, "failed to cancel veto session");
                None
            }
        }
    }

    fn finish(
        &self,
        proposal: Proposal,
        decision: Decision,
        outcome: Outcome,
        session: Option<VetoSession>,
    ) -> RunOutcome {
        self.publish(proposal.agent, outcome.completion_event(false));
        if outcome.success() {
            tracing::info!(
                business_key = %proposal.business_key,
                mode = %decision.mode,
                idempotent = outcome.idempotent(),
                "proposal executed"
            );
            metrics::counter!("custos_runs_total", "outcome" => "executed").increment(1);
            RunOutcome::Executed {
                proposal,
                decision,
                outcome,
                session,
            }
        } else {
            tracing::warn!(
                business_key = %proposal.business_key,
                error = outcome.error().unwrap_or_default(),
                "proposal rolled back"
            );
            metrics::counter!("custos_runs_total", "outcome" => "failed").increment(1);
            RunOutcome::Failed {
                proposal,
                decision,
                outcome,
                session,
            }
        }
    }

    async fn escalate(
        &self,
        proposal: Proposal,
        decision: Option<Decision>,
        reason: String,
    ) -> RunOutcome {
        let message = format!(
            "{} proposes {} for {} ({}): {reason}",
            proposal.agent,
            proposal.operation,
            proposal.business_key,
            proposal.amount,
        );
        if let Some(notifier) = &self.notifier {
            if let Err(err) = notifier.notify(&self.escalation_channel, &message).await {
                tracing::warn!(error = %err, business_key = %proposal.business_key, "escalation notification failed");
            }
        }
        tracing::info!(business_key = %proposal.business_key, reason = %reason, "proposal escalated");
        metrics::counter!("custos_runs_total", "outcome" => "escalated").increment(1);
        self.publish(
            proposal.agent,
            SwarmEventKind::Escalated {
                business_key: proposal.business_key.clone(),
                reason: reason.clone(),
            },
        );
        RunOutcome::Escalated {
            proposal,
            decision,
            reason,
        }
    }

    fn publish(&self, source: AgentKind, kind: SwarmEventKind) {
        let event = SwarmEvent::new(source, kind).at(self.clock.now());
        if let Err(err) = self.events.publish(event) {
            tracing::warn!(error = %err, "failed to publish swarm event");
        }
    }
}
