//! End-to-end decision scenarios against the default policy

use chrono::{DateTime, TimeZone, Utc};
use custos_core::{AgentKind, HealthProbe, HealthReport, Money, PortError};
use custos_policy::{DecisionMode, DecisionReason, GovernanceConfig, GovernanceEngine, PolicyStore};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

struct Healthy;

#[async_trait::async_trait]
impl HealthProbe for Healthy {
    async fn check(&self) -> Result<HealthReport, PortError> {
        Ok(HealthReport::healthy())
    }
}

fn business_hours() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 10, 9, 30, 0).unwrap()
}

fn engine() -> GovernanceEngine {
    GovernanceEngine::new(Arc::new(PolicyStore::fixed(GovernanceConfig::default())))
        .with_health_probe(Arc::new(Healthy))
}

#[tokio::test]
async fn failover_of_7500_gets_a_sixty_second_veto_window() {
    let decision = engine()
        .evaluate(AgentKind::Paolo, Money::from_euros(7_500), Some(0.9), business_hours())
        .await;
    assert_eq!(decision.mode, DecisionMode::HumanOnTheLoop);
    assert_eq!(decision.reason, DecisionReason::AmountTier);
    assert_eq!(decision.supervision_timeout, Some(Duration::from_secs(60)));
    assert_eq!(decision.applied_threshold, Some(Money::from_euros(10_000)));
    assert_eq!(decision.policy_version, Some(1));
}

#[tokio::test]
async fn failover_of_60000_needs_dual_control() {
    let decision = engine()
        .evaluate(AgentKind::Paolo, Money::from_euros(60_000), Some(0.99), business_hours())
        .await;
    assert_eq!(decision.mode, DecisionMode::DualControl);
    assert!(decision.requires_human());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn mode_is_monotonic_in_amount(a in 0i64..10_000_000, b in 0i64..10_000_000, paolo in any::<bool>()) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let agent = if paolo { AgentKind::Paolo } else { AgentKind::Giulia };
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let engine = engine();
        let (m_lo, m_hi) = rt.block_on(async {
            let lo = engine.evaluate(agent, Money::from_cents(lo), None, business_hours()).await;
            let hi = engine.evaluate(agent, Money::from_cents(hi), None, business_hours()).await;
            (lo.mode, hi.mode)
        });
        prop_assert!(m_lo <= m_hi);
    }
}
