//! Pattern thresholds and coordinated blacklists

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use custos_agents::{
    CarrierChange, CarrierRecord, DisputeRecord, FailoverAgent, InMemoryShipmentStore,
    SagaExecutor, ShipmentRecord, ShipmentStore, StoreError,
};
use custos_core::{AgentKind, CarrierId, DisputeId, ShipmentId, SwarmEvent, SwarmEventKind};
use custos_swarm::{SwarmConfig, SwarmOrchestrator};
use custos_test_utils::{add_shipment, business_hours, seeded_store, FakeLedger};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn swarm(store: Arc<dyn ShipmentStore>, ledger: Arc<FakeLedger>) -> Arc<SwarmOrchestrator> {
    let (tx, rx) = SwarmOrchestrator::channel();
    let executor = SagaExecutor::new(store, ledger);
    let paolo = Arc::new(FailoverAgent::new(Arc::new(executor), tx.clone()));
    Arc::new(SwarmOrchestrator::new(tx, rx, paolo, SwarmConfig::default()))
}

fn fraud(carrier: &str, dispute: &str, at: DateTime<Utc>) -> SwarmEvent {
    SwarmEvent::new(
        AgentKind::Giulia,
        SwarmEventKind::FraudSuspected {
            counterparty: CarrierId::new(carrier),
            dispute: Some(DisputeId::new(dispute)),
            detail: "delivery scan contradicted by tracking".into(),
        },
    )
    .at(at)
}

fn incident(carrier: &str, at: DateTime<Utc>) -> SwarmEvent {
    SwarmEvent::new(
        AgentKind::Paolo,
        SwarmEventKind::CarrierIncident {
            carrier: CarrierId::new(carrier),
            detail: "missed pickup".into(),
        },
    )
    .at(at)
}

#[tokio::test]
async fn three_fraud_events_blacklist_exactly_once() {
    let store = seeded_store().await;
    for (id, euros) in [("SHP-1", 7_500), ("SHP-2", 60_000), ("SHP-3", 300)] {
        add_shipment(store.as_ref(), id, "BRT", euros).await;
    }
    add_shipment(store.as_ref(), "SHP-4", "GLS", 1_000).await;
    let ledger = Arc::new(FakeLedger::new());
    let swarm = swarm(store.clone(), ledger.clone());
    let t0 = business_hours();

    assert!(swarm.handle_event(&fraud("BRT", "DSP-1", t0)).await.is_none());
    assert!(swarm
        .handle_event(&fraud("BRT", "DSP-2", t0 + ChronoDuration::hours(1)))
        .await
        .is_none());
    let report = swarm
        .handle_event(&fraud("BRT", "DSP-3", t0 + ChronoDuration::hours(2)))
        .await
        .expect("third suspicion blacklists");
    assert!(swarm
        .handle_event(&fraud("BRT", "DSP-4", t0 + ChronoDuration::hours(3)))
        .await
        .is_none());

    assert_eq!(report.counterparty.as_str(), "BRT");
    assert!(!report.already_blacklisted);
    assert!(report.deactivated);
    assert!(report.errors.is_empty());
    let mut moved: Vec<&str> = report.failovers.iter().map(|f| f.shipment.as_str()).collect();
    moved.sort_unstable();
    assert_eq!(moved, vec!["SHP-1", "SHP-2", "SHP-3"]);
    assert!(report.failovers.iter().all(|f| f.success && f.to.as_str() == "SDA"));

    assert_eq!(swarm.blacklist_reports().len(), 1);
    assert_eq!(ledger.submission_count(), 3);
    assert!(!store.get_carrier(&"BRT".into()).await.unwrap().unwrap().active);
    assert!(store.active_shipments_for(&"BRT".into()).await.unwrap().is_empty());
    let untouched = store.get_shipment(&"SHP-4".into()).await.unwrap().unwrap();
    assert_eq!(untouched.carrier.as_str(), "GLS");
}

#[tokio::test]
async fn failures_outside_the_window_do_not_accumulate() {
    let store = seeded_store().await;
    add_shipment(store.as_ref(), "SHP-1", "TNT", 2_000).await;
    let swarm = swarm(store.clone(), Arc::new(FakeLedger::new()));
    let t0 = business_hours();

    for hours in [0, 6, 12, 18, 24] {
        let at = t0 + ChronoDuration::hours(hours);
        assert!(swarm.handle_event(&incident("TNT", at)).await.is_none());
    }
    let report = swarm
        .handle_event(&incident("TNT", t0 + ChronoDuration::hours(25)))
        .await
        .expect("fifth failure inside 24h blacklists");

    assert_eq!(report.moved(), 1);
    let shipment = store.get_shipment(&"SHP-1".into()).await.unwrap().unwrap();
    assert_eq!(shipment.carrier.as_str(), "SDA");
}

#[tokio::test]
async fn spawned_loop_counts_forced_completions_separately() {
    let store = seeded_store().await;
    add_shipment(store.as_ref(), "SHP-1", "BRT", 7_500).await;
    add_shipment(store.as_ref(), "SHP-2", "BRT", 9_000).await;
    let swarm = swarm(store, Arc::new(FakeLedger::new()));
    let handle = swarm.clone().spawn().unwrap();
    let now = Utc::now();

    for n in 1..=3 {
        swarm.emit(fraud("BRT", &format!("DSP-{n}"), now)).unwrap();
    }
    handle.shutdown().await;

    let stats = swarm.stats();
    assert_eq!(stats.blacklisted, vec![CarrierId::new("BRT")]);
    assert_eq!(stats.forced_failovers, 2);
    assert_eq!(stats.events_by_kind.get("fraud_suspected"), Some(&3));
    assert_eq!(stats.events_by_kind.get("failover_completed"), Some(&2));
    assert_eq!(stats.events_processed, 5);
    assert!(!stats.repeated_failures.contains_key(&CarrierId::new("BRT")));
}

#[tokio::test]
async fn manual_blacklist_is_idempotent() {
    let store = seeded_store().await;
    add_shipment(store.as_ref(), "SHP-1", "TNT", 1_200).await;
    let ledger = Arc::new(FakeLedger::new());
    let swarm = swarm(store, ledger.clone());
    let tnt = CarrierId::new("TNT");

    let first = swarm.blacklist_counterparty(&tnt, "contract terminated").await.unwrap();
    let second = swarm.blacklist_counterparty(&tnt, "contract terminated").await.unwrap();

    assert_eq!(first.moved(), 1);
    assert!(second.already_blacklisted);
    assert!(second.failovers.is_empty());
    assert_eq!(ledger.submission_count(), 1);
    assert_eq!(swarm.blacklist_reports().len(), 1);
}

#[tokio::test]
async fn unknown_counterparty_reports_without_deactivating() {
    let store = seeded_store().await;
    let swarm = swarm(store, Arc::new(FakeLedger::new()));

    let report = swarm
        .blacklist_counterparty(&CarrierId::new("XYZ"), "unregistered carrier")
        .await
        .unwrap();

    assert!(report.failovers.is_empty());
    assert!(!report.deactivated);
}

/// Store whose first `outages` listings of active shipments fail
struct FlakyListing {
    inner: Arc<InMemoryShipmentStore>,
    outages: AtomicU32,
}

#[async_trait]
impl ShipmentStore for FlakyListing {
    async fn get_shipment(&self, id: &ShipmentId) -> Result<Option<ShipmentRecord>, StoreError> {
        self.inner.get_shipment(id).await
    }

    async fn put_shipment(&self, record: ShipmentRecord) -> Result<(), StoreError> {
        self.inner.put_shipment(record).await
    }

    async fn update_shipment(
        &self,
        record: ShipmentRecord,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        self.inner.update_shipment(record, expected_version).await
    }

    async fn active_shipments_for(
        &self,
        carrier: &CarrierId,
    ) -> Result<Vec<ShipmentRecord>, StoreError> {
        let down = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if down {
            return Err(StoreError::Backend("replica unreachable".into()));
        }
        self.inner.active_shipments_for(carrier).await
    }

    async fn get_carrier(&self, id: &CarrierId) -> Result<Option<CarrierRecord>, StoreError> {
        self.inner.get_carrier(id).await
    }

    async fn list_carriers(&self) -> Result<Vec<CarrierRecord>, StoreError> {
        self.inner.list_carriers().await
    }

    async fn put_carrier(&self, record: CarrierRecord) -> Result<(), StoreError> {
        self.inner.put_carrier(record).await
    }

    async fn set_carrier_active(&self, id: &CarrierId, active: bool) -> Result<(), StoreError> {
        self.inner.set_carrier_active(id, active).await
    }

    async fn get_dispute(&self, id: &DisputeId) -> Result<Option<DisputeRecord>, StoreError> {
        self.inner.get_dispute(id).await
    }

    async fn put_dispute(&self, record: DisputeRecord) -> Result<(), StoreError> {
        self.inner.put_dispute(record).await
    }

    async fn update_dispute(
        &self,
        record: DisputeRecord,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        self.inner.update_dispute(record, expected_version).await
    }

    async fn insert_carrier_change(&self, change: CarrierChange) -> Result<(), StoreError> {
        self.inner.insert_carrier_change(change).await
    }

    async fn carrier_changes_for(
        &self,
        shipment: &ShipmentId,
    ) -> Result<Vec<CarrierChange>, StoreError> {
        self.inner.carrier_changes_for(shipment).await
    }
}

#[tokio::test]
async fn failed_containment_leaves_the_counterparty_unmarked() {
    let inner = seeded_store().await;
    add_shipment(inner.as_ref(), "SHP-1", "BRT", 7_500).await;
    let store = Arc::new(FlakyListing {
        inner: inner.clone(),
        outages: AtomicU32::new(2),
    });
    let ledger = Arc::new(FakeLedger::new());
    let swarm = swarm(store, ledger.clone());
    let brt = CarrierId::new("BRT");
    let t0 = business_hours();

    for (n, hours) in [(1, 0), (2, 1), (3, 2)] {
        let event = fraud("BRT", &format!("DSP-{n}"), t0 + ChronoDuration::hours(hours));
        assert!(swarm.handle_event(&event).await.is_none());
    }
    assert!(swarm.stats().blacklisted.is_empty());

    assert!(swarm.blacklist_counterparty(&brt, "manual review").await.is_err());
    assert!(swarm.stats().blacklisted.is_empty());

    let report = swarm
        .handle_event(&fraud("BRT", "DSP-4", t0 + ChronoDuration::hours(3)))
        .await
        .expect("next crossing contains the counterparty");
    assert!(!report.already_blacklisted);
    assert_eq!(report.moved(), 1);
    assert_eq!(swarm.stats().blacklisted, vec![brt.clone()]);
    assert_eq!(ledger.submission_count(), 1);
    assert!(!inner.get_carrier(&brt).await.unwrap().unwrap().active);
}
