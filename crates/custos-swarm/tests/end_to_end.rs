//! Services wired from configuration, driven end to end

use async_trait::async_trait;
use custos_agents::{AgentContext, InMemoryShipmentStore, RunOutcome, ShipmentStore};
use custos_core::{CostEvent, CostKind, PortError, TokioClock};
use custos_swarm::{CostSink, CustosConfig, Ports, Services};
use custos_test_utils::{
    add_dispute, add_shipment, policy_without_calendar, seeded_store, FakeLedger, FixedScorer,
    RecordingNotifier, StaticEvidence, StaticHealthProbe,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[derive(Default)]
struct CollectCost {
    events: Mutex<Vec<CostEvent>>,
}

#[async_trait]
impl CostSink for CollectCost {
    async fn flush(&self, batch: Vec<CostEvent>) -> Result<(), PortError> {
        self.events.lock().extend(batch);
        Ok(())
    }
}

impl CollectCost {
    fn count(&self, kind: CostKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

struct World {
    store: Arc<InMemoryShipmentStore>,
    ledger: Arc<FakeLedger>,
    notifier: Arc<RecordingNotifier>,
    cost: Arc<CollectCost>,
    services: Services,
}

async fn world(scorer: FixedScorer) -> World {
    let store = seeded_store().await;
    let ledger = Arc::new(FakeLedger::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let cost = Arc::new(CollectCost::default());
    let ports = Ports {
        store: store.clone(),
        ledger: ledger.clone(),
        evidence: Arc::new(StaticEvidence),
        scorer: Arc::new(scorer),
        health: Arc::new(StaticHealthProbe::healthy()),
        notifier: notifier.clone(),
        cost_sink: cost.clone(),
        clock: Arc::new(TokioClock::new()),
    };
    let config = CustosConfig::default().with_policy(policy_without_calendar());
    let services = Services::bootstrap(config, ports).await.unwrap();
    World {
        store,
        ledger,
        notifier,
        cost,
        services,
    }
}

#[tokio::test(start_paused = true)]
async fn contradicted_deliveries_lead_to_a_blacklist() {
    let w = world(FixedScorer::new(70.0, 20.0, 50.0)).await;
    add_shipment(w.store.as_ref(), "SHP-A", "BRT", 7_500).await;
    add_shipment(w.store.as_ref(), "SHP-B", "BRT", 45_000).await;
    for n in 1..=3 {
        add_dispute(w.store.as_ref(), &format!("DSP-{n}"), "BRT", 900, true).await;
    }
    let swarm = w.services.start().unwrap();

    for n in 1..=3 {
        let outcome = w
            .services
            .runner
            .run(w.services.giulia.as_ref(), &AgentContext::dispute(format!("DSP-{n}")))
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Escalated { .. }));
    }
    w.services.shutdown(swarm).await;

    let reports = w.services.swarm.blacklist_reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].counterparty.as_str(), "BRT");
    assert_eq!(reports[0].moved(), 2);
    assert!(!w.store.get_carrier(&"BRT".into()).await.unwrap().unwrap().active);
    for id in ["SHP-A", "SHP-B"] {
        let shipment = w.store.get_shipment(&id.into()).await.unwrap().unwrap();
        assert_eq!(shipment.carrier.as_str(), "SDA");
    }

    assert_eq!(w.notifier.messages().len(), 3);
    assert_eq!(w.ledger.submission_count(), 2);
    assert_eq!(w.cost.count(CostKind::EvidenceGathering), 3);
    assert_eq!(w.cost.count(CostKind::LedgerSubmission), 2);
}

#[tokio::test(start_paused = true)]
async fn risk_scan_moves_shipments_under_governance() {
    let w = world(FixedScorer::new(90.0, 90.0, 0.0)).await;
    add_shipment(w.store.as_ref(), "SHP-1", "BRT", 7_500).await;
    add_shipment(w.store.as_ref(), "SHP-2", "BRT", 3_000).await;
    let swarm = w.services.start().unwrap();

    let report = w.services.risk_scanner().scan_once().await.unwrap();
    w.services.shutdown(swarm).await;

    assert_eq!(report.errors, 0);
    assert_eq!(report.outcomes.len(), 2);
    assert!(report.outcomes.iter().all(RunOutcome::is_executed));
    assert_eq!(w.ledger.submission_count(), 2);
    assert_eq!(w.cost.count(CostKind::LedgerSubmission), 2);

    let stats = w.services.swarm.stats();
    assert!(stats.blacklisted.is_empty());
    assert_eq!(stats.events_by_kind.get("failover_completed"), Some(&2));
    assert!(w.services.veto.list_active().await.unwrap().is_empty());
}
