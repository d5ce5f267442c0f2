//! Governance engine
//!
//! Maps an action's amount and confidence to a supervision level:
//! 1. Governance disabled: full autonomy
//! 2. Supervision path unhealthy above the health floor: pre-authorization
//! 3. Calendar restriction: pre-authorization
//! 4. Amount tier for the agent
//! 5. Dispute fast-track: a pre-authorization tier may drop to a veto window
//!
//! Conservative overrides (steps 2 and 3) never lower a stricter tier result.

use crate::calendar::CalendarVerdict;
use crate::config::GovernanceConfig;
use crate::store::PolicyStore;
use chrono::{DateTime, Utc};
use custos_core::{
    AgentKind, BreakerConfig, CallError, CircuitBreaker, HealthProbe, HealthReport, Money,
    PortError, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Supervision levels, ascending
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMode {
    /// Execute immediately
    FullAuto,
    /// Execute after a veto window nobody used
    HumanOnTheLoop,
    /// Wait for explicit approval
    HumanInTheLoop,
    /// Wait for two approvals
    DualControl,
}

impl DecisionMode {
    /// Stable tag
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FullAuto => "full_auto",
            Self::HumanOnTheLoop => "human_on_the_loop",
            Self::HumanInTheLoop => "human_in_the_loop",
            Self::DualControl => "dual_control",
        }
    }

    /// Check if a human must act before execution
    #[inline]
    #[must_use]
    pub fn requires_human(self) -> bool {
        matches!(self, Self::HumanInTheLoop | Self::DualControl)
    }
}

impl fmt::Display for DecisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a mode was chosen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionReason {
    /// Master switch is off
    GovernanceDisabled,
    /// Dashboard, notifier or operators unavailable
    SupervisionUnhealthy { detail: String },
    /// Outside business hours
    OutsideBusinessHours,
    /// Weekend or holiday
    RestrictedDay,
    /// Amount band for the agent
    AmountTier,
    /// High-confidence dispute given a veto window
    DisputeFastTrack,
    /// No policy could be loaded
    PolicyUnavailable { detail: String },
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GovernanceDisabled => f.write_str("governance disabled"),
            Self::SupervisionUnhealthy { detail } => write!(f, "supervision unhealthy: {detail}"),
            Self::OutsideBusinessHours => f.write_str("outside business hours"),
            Self::RestrictedDay => f.write_str("restricted day"),
            Self::AmountTier => f.write_str("amount tier"),
            Self::DisputeFastTrack => f.write_str("dispute fast-track"),
            Self::PolicyUnavailable { detail } => write!(f, "policy unavailable: {detail}"),
        }
    }
}

/// Outcome of an evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Supervision level
    pub mode: DecisionMode,
    /// Why
    pub reason: DecisionReason,
    /// Threshold the amount was compared against
    pub applied_threshold: Option<Money>,
    /// Veto window, for `HumanOnTheLoop`
    pub supervision_timeout: Option<Duration>,
    /// Policy version used
    pub policy_version: Option<u64>,
}

impl Decision {
    fn new(mode: DecisionMode, reason: DecisionReason, version: Option<u64>) -> Self {
        Self {
            mode,
            reason,
            applied_threshold: None,
            supervision_timeout: None,
            policy_version: version,
        }
    }

    fn with_threshold(mut self, threshold: Money) -> Self {
        self.applied_threshold = Some(threshold);
        self
    }

    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.supervision_timeout = Some(timeout);
        self
    }

    /// Check if the action may run without waiting on a human
    #[inline]
    #[must_use]
    pub fn is_automatic(&self) -> bool {
        self.mode == DecisionMode::FullAuto
    }

    /// Check if a human must act before execution
    #[inline]
    #[must_use]
    pub fn requires_human(&self) -> bool {
        self.mode.requires_human()
    }
}

/// Decision-mode engine
pub struct GovernanceEngine {
    policy: Arc<PolicyStore>,
    health: Option<Arc<dyn HealthProbe>>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl fmt::Debug for GovernanceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GovernanceEngine")
            .field("policy", &self.policy)
            .field("health_probe", &self.health.is_some())
            .field("breaker", &self.breaker.name())
            .finish_non_exhaustive()
    }
}

impl GovernanceEngine {
    /// Create new engine without a health probe
    #[must_use]
    pub fn new(policy: Arc<PolicyStore>) -> Self {
        Self {
            policy,
            health: None,
            breaker: Arc::new(CircuitBreaker::new("health", BreakerConfig::default())),
            retry: RetryPolicy::default(),
        }
    }

    /// With a health probe
    #[must_use]
    pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.health = Some(probe);
        self
    }

    /// With a shared health breaker
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// With retry policy for health probing
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Policy store
    #[inline]
    #[must_use]
    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.policy
    }

    /// Decide the supervision level for an action
    ///
    /// `confidence` is on a 0.0-1.0 scale and only matters for dispute
    /// fast-tracking.
    pub async fn evaluate(
        &self,
        agent: AgentKind,
        amount: Money,
        confidence: Option<f64>,
        now: DateTime<Utc>,
    ) -> Decision {
        let decision = match self.policy.current().await {
            Ok(config) => self.decide(&config, agent, amount, confidence, now).await,
            Err(err) => Decision::new(
                DecisionMode::HumanInTheLoop,
                DecisionReason::PolicyUnavailable {
                    detail: err.to_string(),
                },
                None,
            ),
        };

        tracing::info!(
            agent = %agent,
            amount = %amount,
            confidence,
            mode = %decision.mode,
            reason = %decision.reason,
            policy_version = decision.policy_version,
            "governance decision"
        );
        metrics::counter!("custos_decisions_total", "agent" => agent.as_str(), "mode" => decision.mode.as_str())
            .increment(1);
        decision
    }

    async fn decide(
        &self,
        config: &GovernanceConfig,
        agent: AgentKind,
        amount: Money,
        confidence: Option<f64>,
        now: DateTime<Utc>,
    ) -> Decision {
        let version = Some(config.version);
        if !config.enabled {
            return Decision::new(DecisionMode::FullAuto, DecisionReason::GovernanceDisabled, version);
        }

        let tier = Self::tier(config, agent, amount, version);

        if amount > config.health_floor {
            let report = self.probe_health().await;
            if !report.healthy {
                let detail = report.reason.unwrap_or_else(|| "unhealthy".to_string());
                return Self::conservative(
                    tier,
                    DecisionReason::SupervisionUnhealthy { detail },
                    config.health_floor,
                    version,
                );
            }
        }

        match config.calendar.check(now) {
            CalendarVerdict::Open => {}
            CalendarVerdict::OutsideBusinessHours => {
                return Self::conservative(
                    tier,
                    DecisionReason::OutsideBusinessHours,
                    amount,
                    version,
                );
            }
            CalendarVerdict::RestrictedDay => {
                return Self::conservative(tier, DecisionReason::RestrictedDay, amount, version);
            }
        }

        if agent == AgentKind::Giulia && tier.mode == DecisionMode::HumanInTheLoop {
            let rule = &config.fast_track;
            if confidence.is_some_and(|c| c >= rule.min_confidence) && amount <= rule.max_amount {
                return Decision::new(
                    DecisionMode::HumanOnTheLoop,
                    DecisionReason::DisputeFastTrack,
                    version,
                )
                .with_threshold(rule.max_amount)
                .with_timeout(Duration::from_secs(rule.timeout_secs));
            }
        }

        tier
    }

    fn tier(config: &GovernanceConfig, agent: AgentKind, amount: Money, version: Option<u64>) -> Decision {
        let t = config.thresholds(agent);
        if amount <= t.full_auto_max {
            Decision::new(DecisionMode::FullAuto, DecisionReason::AmountTier, version)
                .with_threshold(t.full_auto_max)
        } else if amount <= t.veto_window_max {
            Decision::new(DecisionMode::HumanOnTheLoop, DecisionReason::AmountTier, version)
                .with_threshold(t.veto_window_max)
                .with_timeout(t.veto_timeout())
        } else if amount < t.dual_control_min {
            Decision::new(DecisionMode::HumanInTheLoop, DecisionReason::AmountTier, version)
                .with_threshold(t.dual_control_min)
        } else {
            Decision::new(DecisionMode::DualControl, DecisionReason::AmountTier, version)
                .with_threshold(t.dual_control_min)
        }
    }

    fn conservative(
        tier: Decision,
        reason: DecisionReason,
        threshold: Money,
        version: Option<u64>,
    ) -> Decision {
        if tier.mode > DecisionMode::HumanInTheLoop {
            return tier;
        }
        Decision::new(DecisionMode::HumanInTheLoop, reason, version).with_threshold(threshold)
    }

    async fn probe_health(&self) -> HealthReport {
        let Some(probe) = self.health.as_deref() else {
            return HealthReport::healthy();
        };
        let breaker = self.breaker.as_ref();
        let result = self
            .retry
            .run(
                "health_probe",
                move || breaker.call(probe.check()),
                |err: &CallError<PortError>| match err {
                    CallError::Inner(e) => e.is_retryable(),
                    CallError::Timeout { .. } => true,
                    CallError::Open { .. } => false,
                },
            )
            .await;

        match result {
            Ok(report) => report,
            Err(err) => {
                tracing::warn!(error = %err, "health probe unavailable");
                HealthReport::unhealthy(format!("health probe unavailable: {err}"))
            }
        }
    }
}
