//! Testing utilities for the Custos workspace
//!
//! Fakes for the collaborator ports and fixture builders shared by the
//! integration suites.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use custos_agents::{
    CarrierRecord, DisputeRecord, EvidenceSource, InMemoryShipmentStore, ShipmentRecord,
    ShipmentStore,
};
use custos_core::{
    ConfidenceScorer, CostEvent, CostRecorder, EvidenceItem, EvidenceKind, HealthProbe,
    HealthReport, LedgerClient, LedgerHash, LedgerPayload, Money, Notifier, PortError,
    SwarmEvent,
};
use custos_policy::{CalendarRules, GovernanceConfig, GovernanceEngine, PolicyStore};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Ledger that records submissions and hashes them by digest
#[derive(Debug, Default)]
pub struct FakeLedger {
    submissions: Mutex<Vec<LedgerPayload>>,
    failing: AtomicBool,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let ledger = Self::default();
        ledger.set_failing(true);
        ledger
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> Vec<LedgerPayload> {
        self.submissions.lock().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn submit(&self, payload: LedgerPayload) -> Result<LedgerHash, PortError> {
        let hash = LedgerHash::new(format!("0x{}", payload.digest()));
        self.submissions.lock().push(payload);
        if self.failing.load(Ordering::SeqCst) {
            return Err(PortError::unavailable("ledger", "simulated outage"));
        }
        Ok(hash)
    }
}

/// Probe returning a fixed report
#[derive(Debug, Clone)]
pub struct StaticHealthProbe(pub HealthReport);

impl StaticHealthProbe {
    pub fn healthy() -> Self {
        Self(HealthReport::healthy())
    }

    pub fn unhealthy(reason: &str) -> Self {
        Self(HealthReport::unhealthy(reason))
    }
}

#[async_trait]
impl HealthProbe for StaticHealthProbe {
    async fn check(&self) -> Result<HealthReport, PortError> {
        Ok(self.0.clone())
    }
}

/// Notifier that keeps every message
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, channel: &str, message: &str) -> Result<(), PortError> {
        self.messages
            .lock()
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }
}

/// Scorer returning one fixed score per evidence kind
#[derive(Debug, Clone)]
pub struct FixedScorer {
    scores: HashMap<EvidenceKind, f64>,
}

impl FixedScorer {
    pub fn new(authenticity: f64, consistency: f64, damage: f64) -> Self {
        Self {
            scores: HashMap::from([
                (EvidenceKind::Authenticity, authenticity),
                (EvidenceKind::Consistency, consistency),
                (EvidenceKind::Damage, damage),
            ]),
        }
    }
}

#[async_trait]
impl ConfidenceScorer for FixedScorer {
    async fn score(&self, item: &EvidenceItem) -> Result<f64, PortError> {
        self.scores
            .get(&item.kind)
            .copied()
            .ok_or_else(|| PortError::invalid("scorer", "unknown kind"))
    }
}

/// Evidence source with one item per sub-check
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticEvidence;

#[async_trait]
impl EvidenceSource for StaticEvidence {
    async fn gather(&self, dispute: &DisputeRecord) -> Result<Vec<EvidenceItem>, PortError> {
        Ok(vec![
            EvidenceItem::new(EvidenceKind::Authenticity, "photos", json!({"dispute": dispute.id})),
            EvidenceItem::new(EvidenceKind::Consistency, "tracking", json!({"shipment": dispute.shipment})),
            EvidenceItem::new(EvidenceKind::Damage, "inspection", json!({})),
        ])
    }
}

/// Evidence source that is always down
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableEvidence;

#[async_trait]
impl EvidenceSource for UnavailableEvidence {
    async fn gather(&self, _dispute: &DisputeRecord) -> Result<Vec<EvidenceItem>, PortError> {
        Err(PortError::unavailable("evidence", "archive offline"))
    }
}

/// Cost recorder that keeps every event
#[derive(Debug, Default)]
pub struct RecordingCost {
    events: Mutex<Vec<CostEvent>>,
}

impl RecordingCost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CostEvent> {
        self.events.lock().clone()
    }
}

impl CostRecorder for RecordingCost {
    fn record(&self, event: CostEvent) {
        self.events.lock().push(event);
    }
}

/// Monday 2025-03-03 10:00 UTC
pub fn business_hours() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap()
}

/// Default policy without calendar restrictions
pub fn policy_without_calendar() -> GovernanceConfig {
    GovernanceConfig::default().with_calendar(CalendarRules::disabled())
}

/// Engine on a fixed policy with a healthy supervision path
pub fn engine(config: GovernanceConfig) -> Arc<GovernanceEngine> {
    Arc::new(
        GovernanceEngine::new(Arc::new(PolicyStore::fixed(config)))
            .with_health_probe(Arc::new(StaticHealthProbe::healthy())),
    )
}

/// Event channel whose sender implements `EventSink`
pub fn event_channel() -> (
    Arc<mpsc::UnboundedSender<SwarmEvent>>,
    mpsc::UnboundedReceiver<SwarmEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}

/// Drain every event currently queued
pub fn drain(rx: &mut mpsc::UnboundedReceiver<SwarmEvent>) -> Vec<SwarmEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Store with carriers BRT (0.40), GLS (0.91), SDA (0.97), TNT (0.80)
pub async fn seeded_store() -> Arc<InMemoryShipmentStore> {
    let store = Arc::new(InMemoryShipmentStore::new());
    for (id, name, reliability) in [
        ("BRT", "Bartolini", 0.40),
        ("GLS", "GLS Italy", 0.91),
        ("SDA", "SDA Express", 0.97),
        ("TNT", "TNT", 0.80),
    ] {
        store
            .put_carrier(CarrierRecord::new(id, name, reliability))
            .await
            .unwrap();
    }
    store
}

/// Add an in-transit shipment
pub async fn add_shipment(store: &dyn ShipmentStore, id: &str, carrier: &str, euros: i64) -> ShipmentRecord {
    let record = ShipmentRecord::new(id, carrier, Money::from_euros(euros)).with_updated_at(business_hours());
    store.put_shipment(record.clone()).await.unwrap();
    record
}

/// Add an open dispute against `respondent`
pub async fn add_dispute(
    store: &dyn ShipmentStore,
    id: &str,
    respondent: &str,
    euros: i64,
    delivery_verified: bool,
) -> DisputeRecord {
    let record = DisputeRecord::new(id, format!("SHP-{id}"), "acme-retail", respondent, Money::from_euros(euros))
        .with_delivery_verified(delivery_verified);
    store.put_dispute(record.clone()).await.unwrap();
    record
}
