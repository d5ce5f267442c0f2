//! Carrier risk classification and the periodic scanner
//!
//! A carrier below the risk threshold is bucketed by fixed cut points:
//!
//! | reliability  | level    |
//! |--------------|----------|
//! | ≥ 0.70       | Low      |
//! | ≥ 0.50       | Medium   |
//! | ≥ 0.30       | High     |
//! | below        | Critical |
//!
//! `High` and `Critical` send every active shipment of the carrier through
//! the governed pipeline.

use crate::agent::{Agent, AgentContext};
use crate::error::Result;
use crate::failover::FailoverAgent;
use crate::pipeline::{GovernedRunner, RunOutcome};
use custos_core::CarrierId;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Reliability cut points between risk levels, descending
pub const RISK_CUT_POINTS: [f64; 3] = [0.70, 0.50, 0.30];

/// Risk level of a carrier below the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Stable tag
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Check if shipments should be moved
    #[inline]
    #[must_use]
    pub const fn triggers_failover(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify `reliability`; `None` when it is at or above `threshold`
#[must_use]
pub fn classify(reliability: f64, threshold: f64) -> Option<RiskLevel> {
    if reliability >= threshold {
        return None;
    }
    let [low, medium, high] = RISK_CUT_POINTS;
    Some(if reliability >= low {
        RiskLevel::Low
    } else if reliability >= medium {
        RiskLevel::Medium
    } else if reliability >= high {
        RiskLevel::High
    } else {
        RiskLevel::Critical
    })
}

/// Carrier found at risk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarrierRisk {
    pub carrier: CarrierId,
    pub reliability: f64,
    pub level: RiskLevel,
}

/// What one scan did
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub risks: Vec<CarrierRisk>,
    pub outcomes: Vec<RunOutcome>,
    /// Runs that ended in an error
    pub errors: usize,
}

/// Periodic risk scan driving failovers through the pipeline
#[derive(Debug)]
pub struct RiskScanner {
    agent: Arc<FailoverAgent>,
    runner: GovernedRunner,
    interval: Duration,
}

impl RiskScanner {
    /// Create new scanner using the agent's configured interval
    #[must_use]
    pub fn new(agent: Arc<FailoverAgent>, runner: GovernedRunner) -> Self {
        let interval = Duration::from_secs(agent.config().scan_interval_secs.max(1));
        Self {
            agent,
            runner,
            interval,
        }
    }

    /// With scan interval
    #[inline]
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one scan
    ///
    /// Shipments of one carrier run concurrently so a veto window on one
    /// does not hold up the rest.
    ///
    /// # Errors
    /// Returns the store error if carriers or shipments cannot be listed
    pub async fn scan_once(&self) -> Result<ScanReport> {
        let risks = self.agent.scan_risks().await?;
        let mut report = ScanReport::default();

        for risk in risks.iter().filter(|risk| risk.level.triggers_failover()) {
            let shipments = self.agent.store().active_shipments_for(&risk.carrier).await?;
            let contexts: Vec<AgentContext> = shipments
                .iter()
                .map(|shipment| {
                    AgentContext::shipment(
                        shipment.id.clone(),
                        format!("carrier {} risk {}", risk.carrier, risk.level),
                    )
                })
                .collect();
            let agent: &dyn Agent = self.agent.as_ref();
            let results = join_all(contexts.iter().map(|context| self.runner.run(agent, context))).await;
            for result in results {
                match result {
                    Ok(outcome) => report.outcomes.push(outcome),
                    Err(err) => {
                        tracing::warn!(carrier = %risk.carrier, error = %err, "failover run failed");
                        report.errors += 1;
                    }
                }
            }
        }

        report.risks = risks;
        Ok(report)
    }

    /// Scan on the interval until the handle is aborted
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self.scan_once().await {
                    Ok(report) => tracing::debug!(
                        at_risk = report.risks.len(),
                        runs = report.outcomes.len(),
                        errors = report.errors,
                        "risk scan complete"
                    ),
                    Err(err) => tracing::error!(error = %err, "risk scan failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn cut_points() {
        assert_eq!(classify(0.90, 0.85), None);
        assert_eq!(classify(0.85, 0.85), None);
        assert_eq!(classify(0.84, 0.85), Some(RiskLevel::Low));
        assert_eq!(classify(0.70, 0.85), Some(RiskLevel::Low));
        assert_eq!(classify(0.69, 0.85), Some(RiskLevel::Medium));
        assert_eq!(classify(0.50, 0.85), Some(RiskLevel::Medium));
        assert_eq!(classify(0.49, 0.85), Some(RiskLevel::High));
        assert_eq!(classify(0.30, 0.85), Some(RiskLevel::High));
        assert_eq!(classify(0.29, 0.85), Some(RiskLevel::Critical));
    }

    proptest! {
        #[test]
        fn lower_reliability_never_lowers_risk(a in 0.0f64..1.0, b in 0.0f64..1.0) {
            let (worse, better) = if a <= b { (a, b) } else { (b, a) };
            let rank = |r: f64| classify(r, 0.85).map_or(0, |level| level as u8 + 1);
            prop_assert!(rank(worse) >= rank(better));
        }
    }
}
