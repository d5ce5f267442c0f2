//! Simulated collaborators and a seeded logistics world
//!
//! Backs `custos simulate`: a ledger with latency and outages, an evidence
//! archive whose signals the scorer passes through, a flaky health probe and
//! an operator who vetoes a share of the windows it sees.

use crate::bootstrap::{Ports, Services};
use crate::config::CustosConfig;
use crate::cost::LoggingCostSink;
use crate::error::Result;
use crate::orchestrator::{BlacklistReport, SwarmStats};
use async_trait::async_trait;
use custos_agents::{
    AgentContext, AgentError, CarrierRecord, DisputeRecord, EvidenceSource, InMemoryShipmentStore,
    RunOutcome, ShipmentRecord, ShipmentStore,
};
use custos_core::{
    BreakerMetrics, ConfidenceScorer, EvidenceItem, EvidenceKind, HealthProbe, HealthReport,
    LedgerClient, LedgerHash, LedgerPayload, Money, Notifier, PortError, SessionId, SystemClock,
};
use futures::future::join_all;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

const CARRIERS: [(&str, &str, f64); 6] = [
    ("BRT", "Bartolini", 0.62),
    ("GLS", "GLS Italy", 0.91),
    ("SDA", "SDA Express", 0.96),
    ("TNT", "TNT", 0.88),
    ("NEX", "Nexive", 0.45),
    ("POS", "Poste Delivery", 0.93),
];

/// Knobs for one simulated run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub shipments: usize,
    pub disputes: usize,
    /// Share of ledger submissions that fail
    pub ledger_failure_rate: f64,
    /// Share of evidence requests that fail
    pub evidence_outage_rate: f64,
    /// Share of veto windows the simulated operator vetoes
    pub veto_rate: f64,
    /// Share of health probes reporting degraded supervision
    pub degraded_rate: f64,
    /// Veto window granted to every agent, shortened so runs finish quickly
    pub window_secs: u64,
    /// Carrier whose disputes carry contradicted delivery scans
    pub suspect_carrier: Option<String>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            shipments: 40,
            disputes: 12,
            ledger_failure_rate: 0.05,
            evidence_outage_rate: 0.05,
            veto_rate: 0.2,
            degraded_rate: 0.0,
            window_secs: 2,
            suspect_carrier: Some("NEX".to_string()),
        }
    }
}

impl SimulationConfig {
    /// Shorten every veto window in `config` to `window_secs`
    pub fn apply_to(&self, config: &mut CustosConfig) {
        let window = self.window_secs.max(1);
        config.policy.paolo.veto_timeout_secs = window;
        config.policy.giulia.veto_timeout_secs = window;
        config.policy.fast_track.timeout_secs = window;
    }
}

fn shared_rng(seed: u64) -> Arc<Mutex<StdRng>> {
    Arc::new(Mutex::new(StdRng::seed_from_u64(seed)))
}

/// Ledger with random latency and outages
#[derive(Debug)]
pub struct SimulatedLedger {
    rng: Arc<Mutex<StdRng>>,
    failure_rate: f64,
}

impl SimulatedLedger {
    #[must_use]
    pub fn new(seed: u64, failure_rate: f64) -> Self {
        Self {
            rng: shared_rng(seed),
            failure_rate,
        }
    }
}

#[async_trait]
impl LedgerClient for SimulatedLedger {
    async fn submit(&self, payload: LedgerPayload) -> std::result::Result<LedgerHash, PortError> {
        let (latency, fail) = {
            let mut rng = self.rng.lock();
            (rng.random_range(5..50), rng.random_bool(self.failure_rate))
        };
        tokio::time::sleep(Duration::from_millis(latency)).await;
        if fail {
            return Err(PortError::unavailable("ledger", "simulated node outage"));
        }
        Ok(LedgerHash::new(format!("0x{}", payload.digest())))
    }
}

/// Evidence archive emitting one item per sub-check with a raw signal
#[derive(Debug)]
pub struct SimulatedEvidence {
    rng: Arc<Mutex<StdRng>>,
    outage_rate: f64,
    suspect: Option<String>,
}

impl SimulatedEvidence {
    #[must_use]
    pub fn new(seed: u64, outage_rate: f64, suspect: Option<String>) -> Self {
        Self {
            rng: shared_rng(seed),
            outage_rate,
            suspect,
        }
    }
}

#[async_trait]
impl EvidenceSource for SimulatedEvidence {
    async fn gather(&self, dispute: &DisputeRecord) -> std::result::Result<Vec<EvidenceItem>, PortError> {
        let suspect = self
            .suspect
            .as_deref()
            .is_some_and(|carrier| carrier == dispute.respondent.as_str());
        let mut rng = self.rng.lock();
        if rng.random_bool(self.outage_rate) {
            return Err(PortError::unavailable("evidence", "document archive timeout"));
        }
        let consistency = if suspect {
            rng.random_range(5.0..25.0)
        } else {
            rng.random_range(70.0..100.0)
        };
        Ok(vec![
            EvidenceItem::new(
                EvidenceKind::Authenticity,
                "photos",
                json!({"dispute": dispute.id, "signal": rng.random_range(75.0..100.0)}),
            ),
            EvidenceItem::new(
                EvidenceKind::Consistency,
                "tracking",
                json!({"shipment": dispute.shipment, "signal": consistency}),
            ),
            EvidenceItem::new(
                EvidenceKind::Damage,
                "inspection",
                json!({"signal": rng.random_range(0.0..20.0)}),
            ),
        ])
    }
}

/// Scorer that reads the `signal` field of the evidence payload
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalScorer;

#[async_trait]
impl ConfidenceScorer for SignalScorer {
    async fn score(&self, item: &EvidenceItem) -> std::result::Result<f64, PortError> {
        item.payload
            .get("signal")
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| PortError::invalid("scorer", format!("{} item has no signal", item.source)))
    }
}

/// Health probe that is degraded a share of the time
#[derive(Debug)]
pub struct SimulatedHealth {
    rng: Arc<Mutex<StdRng>>,
    degraded_rate: f64,
}

impl SimulatedHealth {
    #[must_use]
    pub fn new(seed: u64, degraded_rate: f64) -> Self {
        Self {
            rng: shared_rng(seed),
            degraded_rate,
        }
    }
}

#[async_trait]
impl HealthProbe for SimulatedHealth {
    async fn check(&self) -> std::result::Result<HealthReport, PortError> {
        if self.rng.lock().random_bool(self.degraded_rate) {
            Ok(HealthReport::unhealthy("operator console unreachable"))
        } else {
            Ok(HealthReport::healthy())
        }
    }
}

/// Notifier that writes to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, channel: &str, message: &str) -> std::result::Result<(), PortError> {
        tracing::info!(channel, message, "notification");
        Ok(())
    }
}

/// Collaborators for a simulated run over `store`
#[must_use]
pub fn simulated_ports(config: &SimulationConfig, store: Arc<dyn ShipmentStore>) -> Ports {
    Ports {
        store,
        ledger: Arc::new(SimulatedLedger::new(config.seed, config.ledger_failure_rate)),
        evidence: Arc::new(SimulatedEvidence::new(
            config.seed.wrapping_add(1),
            config.evidence_outage_rate,
            config.suspect_carrier.clone(),
        )),
        scorer: Arc::new(SignalScorer),
        health: Arc::new(SimulatedHealth::new(config.seed.wrapping_add(2), config.degraded_rate)),
        notifier: Arc::new(LogNotifier),
        cost_sink: Arc::new(LoggingCostSink),
        clock: Arc::new(SystemClock),
    }
}

/// Populate carriers, shipments and open disputes
///
/// # Errors
/// Returns the store error if a record cannot be written
pub async fn seed_world(store: &dyn ShipmentStore, config: &SimulationConfig) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(3));
    for (id, name, reliability) in CARRIERS {
        store.put_carrier(CarrierRecord::new(id, name, reliability)).await?;
    }
    for n in 0..config.shipments {
        let (carrier, _, _) = CARRIERS[rng.random_range(0..CARRIERS.len())];
        let value = Money::from_euros(rng.random_range(200..80_000));
        store
            .put_shipment(ShipmentRecord::new(format!("SHP-{n:04}"), carrier, value))
            .await?;
    }
    for n in 0..config.disputes {
        let respondent = match (&config.suspect_carrier, n % 3) {
            (Some(suspect), 0) => suspect.clone(),
            _ => CARRIERS[rng.random_range(0..CARRIERS.len())].0.to_string(),
        };
        let dispute = DisputeRecord::new(
            format!("DSP-{n:04}"),
            format!("SHP-{:04}", rng.random_range(0..config.shipments.max(1))),
            "acme-retail",
            respondent,
            Money::from_euros(rng.random_range(100..7_000)),
        )
        .with_delivery_verified(rng.random_bool(0.7));
        store.put_dispute(dispute).await?;
    }
    tracing::info!(
        carriers = CARRIERS.len(),
        shipments = config.shipments,
        disputes = config.disputes,
        "world seeded"
    );
    Ok(())
}

/// Summary printed by `custos simulate`
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub outcomes: BTreeMap<String, usize>,
    pub run_errors: usize,
    pub vetoes_issued: usize,
    pub swarm: SwarmStats,
    pub blacklists: Vec<BlacklistReport>,
    pub breakers: Vec<BreakerMetrics>,
}

impl SimulationReport {
    /// Human-readable summary
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::from("Custos simulation\n");
        for (label, count) in &self.outcomes {
            out.push_str(&format!("  {label:<10} {count}\n"));
        }
        out.push_str(&format!("  errors     {}\n", self.run_errors));
        out.push_str(&format!("  vetoes     {}\n", self.vetoes_issued));
        out.push_str(&format!(
            "  events     {} ({} forced failovers)\n",
            self.swarm.events_processed, self.swarm.forced_failovers
        ));
        for report in &self.blacklists {
            out.push_str(&format!(
                "  blacklist  {}: {} moved, {} failed ({})\n",
                report.counterparty,
                report.moved(),
                report.errors.len(),
                report.reason
            ));
        }
        for breaker in &self.breakers {
            out.push_str(&format!(
                "  breaker    {} {:?} rejected={}\n",
                breaker.name, breaker.state, breaker.rejected_total
            ));
        }
        out
    }
}

/// Simulated operator watching the veto queue
fn spawn_operator(services: &Services, seed: u64, veto_rate: f64) -> (tokio::task::JoinHandle<()>, Arc<Mutex<usize>>) {
    let veto = services.veto.clone();
    let issued = Arc::new(Mutex::new(0usize));
    let counter = issued.clone();
    let handle = tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut seen: HashSet<SessionId> = HashSet::new();
        loop {
            match veto.list_active().await {
                Ok(sessions) => {
                    for session in sessions {
                        if !seen.insert(session.id) || !rng.random_bool(veto_rate) {
                            continue;
                        }
                        match veto
                            .veto(session.id, "op-sim", "simulated operator review rejected the action")
                            .await
                        {
                            Ok(_) => *counter.lock() += 1,
                            Err(err) => tracing::debug!(session = %session.id, error = %err, "simulated veto refused"),
                        }
                    }
                }
                Err(err) => tracing::warn!(error = %err, "veto queue unavailable"),
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });
    (handle, issued)
}

fn tally(
    outcomes: &mut BTreeMap<String, usize>,
    errors: &mut usize,
    result: std::result::Result<RunOutcome, AgentError>,
) {
    match result {
        Ok(outcome) => *outcomes.entry(outcome.label().to_string()).or_default() += 1,
        Err(err) => {
            tracing::warn!(error = %err, "run failed");
            *errors += 1;
        }
    }
}

/// Seed a world, run every agent through governance and report
///
/// The risk scan moves shipments off unreliable carriers; every open dispute
/// then goes through the dispute agent concurrently.
///
/// # Errors
/// Returns bootstrap or store errors; individual run failures are counted
pub async fn run(services: &Services, config: &SimulationConfig) -> Result<SimulationReport> {
    let swarm = services.start()?;
    let (operator, vetoes) = spawn_operator(services, config.seed.wrapping_add(4), config.veto_rate);

    let mut outcomes: BTreeMap<String, usize> = BTreeMap::new();
    let scan = services.risk_scanner().scan_once().await?;
    let mut run_errors = scan.errors;
    for outcome in scan.outcomes {
        tally(&mut outcomes, &mut run_errors, Ok(outcome));
    }

    let contexts: Vec<AgentContext> = (0..config.disputes)
        .map(|n| AgentContext::dispute(format!("DSP-{n:04}")))
        .collect();
    let giulia = services.giulia.as_ref();
    let results = join_all(contexts.iter().map(|context| services.runner.run(giulia, context))).await;
    for result in results {
        tally(&mut outcomes, &mut run_errors, result);
    }

    operator.abort();
    services.shutdown(swarm).await;

    let vetoes_issued = *vetoes.lock();
    Ok(SimulationReport {
        outcomes,
        run_errors,
        vetoes_issued,
        swarm: services.swarm.stats(),
        blacklists: services.swarm.blacklist_reports(),
        breakers: services.breakers.all_metrics(),
    })
}

/// In-memory store for a simulated run
#[must_use]
pub fn simulation_store() -> Arc<InMemoryShipmentStore> {
    Arc::new(InMemoryShipmentStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use custos_agents::DisputeStatus;

    #[tokio::test]
    async fn seeding_is_deterministic() {
        let config = SimulationConfig::default();
        let first = simulation_store();
        let second = simulation_store();
        seed_world(first.as_ref(), &config).await.unwrap();
        seed_world(second.as_ref(), &config).await.unwrap();

        let a = first.get_shipment(&"SHP-0007".into()).await.unwrap().unwrap();
        let b = second.get_shipment(&"SHP-0007".into()).await.unwrap().unwrap();
        assert_eq!(a.carrier, b.carrier);
        assert_eq!(a.value, b.value);

        let dispute = first.get_dispute(&"DSP-0000".into()).await.unwrap().unwrap();
        assert_eq!(dispute.respondent.as_str(), "NEX");
        assert_eq!(dispute.status, DisputeStatus::Open);
    }

    #[tokio::test]
    async fn signal_scorer_passes_the_signal_through() {
        let item = EvidenceItem::new(EvidenceKind::Damage, "inspection", json!({"signal": 12.5}));
        assert!((SignalScorer.score(&item).await.unwrap() - 12.5).abs() < f64::EPSILON);
        let bare = EvidenceItem::new(EvidenceKind::Damage, "inspection", json!({}));
        assert!(SignalScorer.score(&bare).await.is_err());
    }

    #[tokio::test]
    async fn suspect_carrier_gets_contradicted_scans() {
        let evidence = SimulatedEvidence::new(7, 0.0, Some("NEX".into()));
        let dispute = DisputeRecord::new("DSP-1", "SHP-1", "acme", "NEX", Money::from_euros(900));
        let items = evidence.gather(&dispute).await.unwrap();
        let consistency = items
            .iter()
            .find(|item| item.kind == EvidenceKind::Consistency)
            .and_then(|item| item.payload["signal"].as_f64())
            .unwrap();
        assert!(consistency < 25.0);
    }
}
