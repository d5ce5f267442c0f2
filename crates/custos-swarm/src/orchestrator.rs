//! Swarm orchestrator
//!
//! A single consumer drains the event channel and feeds per-counterparty
//! pattern counters. Crossing a threshold blacklists the counterparty:
//!
//! - every active shipment is failed over through the failover agent,
//!   bypassing governance
//! - the counterparty is then flagged inactive
//!
//! Forced failovers publish their completion events back into the same
//! channel. A counterparty is blacklisted at most once per process.

use crate::error::{Result, SwarmError};
use crate::patterns::{Pattern, PatternTracker};
use chrono::{DateTime, Utc};
use custos_agents::{FailoverAgent, FailoverResult};
use custos_core::{CarrierId, SharedClock, ShipmentId, SwarmEvent, SwarmEventKind, SystemClock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Thresholds for coordinated action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Failures inside the window that trigger a blacklist
    pub failure_threshold: usize,
    /// Fraud suspicions inside the window that trigger a blacklist
    pub fraud_threshold: usize,
    /// Sliding window length
    pub window_secs: u64,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            fraud_threshold: 3,
            window_secs: 24 * 3600,
        }
    }
}

impl SwarmConfig {
    /// With failure threshold
    #[inline]
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// With fraud threshold
    #[inline]
    #[must_use]
    pub fn with_fraud_threshold(mut self, threshold: usize) -> Self {
        self.fraud_threshold = threshold;
        self
    }

    /// With window length
    #[inline]
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window_secs = window.as_secs();
        self
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    fn threshold(&self, pattern: Pattern) -> usize {
        match pattern {
            Pattern::RepeatedFailure => self.failure_threshold,
            Pattern::SuspectedFraud => self.fraud_threshold,
        }
    }
}

/// Outcome of one coordinated blacklist
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlacklistReport {
    /// Blacklisted counterparty
    pub counterparty: CarrierId,
    /// Why it was blacklisted
    pub reason: String,
    /// Forced failovers, one per shipment that was active
    pub failovers: Vec<FailoverResult>,
    /// Shipments that could not be moved
    pub errors: Vec<(ShipmentId, String)>,
    /// Counterparty was flagged inactive
    pub deactivated: bool,
    /// Counterparty had already been blacklisted; nothing was done
    pub already_blacklisted: bool,
    /// When the blacklist ran
    pub at: DateTime<Utc>,
}

impl BlacklistReport {
    fn skipped(counterparty: CarrierId, reason: String, at: DateTime<Utc>) -> Self {
        Self {
            counterparty,
            reason,
            failovers: Vec::new(),
            errors: Vec::new(),
            deactivated: false,
            already_blacklisted: true,
            at,
        }
    }

    /// Shipments that ended on another carrier
    #[must_use]
    pub fn moved(&self) -> usize {
        self.failovers.iter().filter(|f| f.success).count()
    }
}

/// Snapshot of orchestrator state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SwarmStats {
    /// Events consumed since start
    pub events_processed: u64,
    /// Events consumed, by tag
    pub events_by_kind: BTreeMap<String, u64>,
    /// Repeated failures inside the window, per counterparty
    pub repeated_failures: BTreeMap<CarrierId, usize>,
    /// Fraud suspicions inside the window, per counterparty
    pub suspected_fraud: BTreeMap<CarrierId, usize>,
    /// Blacklisted counterparties, ordered
    pub blacklisted: Vec<CarrierId>,
    /// Forced failovers observed
    pub forced_failovers: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: u64,
    by_kind: BTreeMap<String, u64>,
    forced_failovers: u64,
}

/// Running orchestrator loop
#[derive(Debug)]
pub struct SwarmHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SwarmHandle {
    /// Stop after draining queued events and wait for the loop to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            tracing::error!(error = %err, "orchestrator task failed");
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Event consumer and coordinated-action trigger
pub struct SwarmOrchestrator {
    sender: Arc<mpsc::UnboundedSender<SwarmEvent>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<SwarmEvent>>>,
    failover: Arc<FailoverAgent>,
    config: SwarmConfig,
    clock: SharedClock,
    tracker: Mutex<PatternTracker>,
    counters: Mutex<Counters>,
    reports: Mutex<Vec<BlacklistReport>>,
}

impl std::fmt::Debug for SwarmOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SwarmOrchestrator {
    /// Event channel shared by agents and the orchestrator
    ///
    /// Agents publish through the sender; hand both ends to [`Self::new`].
    #[must_use]
    pub fn channel() -> (
        Arc<mpsc::UnboundedSender<SwarmEvent>>,
        mpsc::UnboundedReceiver<SwarmEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(tx), rx)
    }

    /// Create new orchestrator over an existing channel
    #[must_use]
    pub fn new(
        sender: Arc<mpsc::UnboundedSender<SwarmEvent>>,
        receiver: mpsc::UnboundedReceiver<SwarmEvent>,
        failover: Arc<FailoverAgent>,
        config: SwarmConfig,
    ) -> Self {
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            failover,
            tracker: Mutex::new(PatternTracker::new(config.window())),
            config,
            clock: Arc::new(SystemClock),
            counters: Mutex::new(Counters::default()),
            reports: Mutex::new(Vec::new()),
        }
    }

    /// With clock used for blacklist timestamps and stats
    #[inline]
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Queue an event for the consumer loop
    ///
    /// # Errors
    /// Returns `SwarmError::Stopped` if the receiver has been dropped
    pub fn emit(&self, event: SwarmEvent) -> Result<()> {
        self.sender.send(event).map_err(|_| SwarmError::Stopped)
    }

    /// Current counters and blacklist
    #[must_use]
    pub fn stats(&self) -> SwarmStats {
        let now = self.clock.now();
        let counters = self.counters.lock();
        let tracker = self.tracker.lock();
        SwarmStats {
            events_processed: counters.processed,
            events_by_kind: counters.by_kind.clone(),
            repeated_failures: tracker.snapshot(Pattern::RepeatedFailure, now),
            suspected_fraud: tracker.snapshot(Pattern::SuspectedFraud, now),
            blacklisted: tracker.blacklisted(),
            forced_failovers: counters.forced_failovers,
        }
    }

    /// Every blacklist carried out so far, oldest first
    #[must_use]
    pub fn blacklist_reports(&self) -> Vec<BlacklistReport> {
        self.reports.lock().clone()
    }

    /// Blacklist a counterparty now
    ///
    /// A counterparty already blacklisted is left alone and the report says so.
    ///
    /// # Errors
    /// Returns the store error if active shipments cannot be listed; the
    /// counterparty is then not considered blacklisted
    pub async fn blacklist_counterparty(
        &self,
        counterparty: &CarrierId,
        reason: &str,
    ) -> Result<BlacklistReport> {
        if !self.tracker.lock().mark_blacklisted(counterparty) {
            tracing::debug!(%counterparty, "already blacklisted");
            return Ok(BlacklistReport::skipped(
                counterparty.clone(),
                reason.to_string(),
                self.clock.now(),
            ));
        }
        self.contain(counterparty, reason).await
    }

    /// Process one event
    ///
    /// Returns the blacklist report when this event crossed a threshold.
    pub async fn handle_event(&self, event: &SwarmEvent) -> Option<BlacklistReport> {
        {
            let mut counters = self.counters.lock();
            counters.processed += 1;
            *counters.by_kind.entry(event.tag().to_string()).or_default() += 1;
            if matches!(event.kind, SwarmEventKind::FailoverCompleted { forced: true, .. }) {
                counters.forced_failovers += 1;
            }
        }
        metrics::counter!("custos_swarm_events_total", "kind" => event.tag()).increment(1);

        let (counterparty, pattern) = match &event.kind {
            SwarmEventKind::CarrierIncident { carrier, .. } => (carrier, Pattern::RepeatedFailure),
            SwarmEventKind::FailoverCompleted {
                from, forced: false, ..
            } => (from, Pattern::RepeatedFailure),
            SwarmEventKind::DisputeResolved {
                respondent,
                in_favor_of_initiator: true,
                success: true,
                ..
            } => (respondent, Pattern::RepeatedFailure),
            SwarmEventKind::FraudSuspected { counterparty, .. } => {
                (counterparty, Pattern::SuspectedFraud)
            }
            _ => return None,
        };

        let crossed = {
            let mut tracker = self.tracker.lock();
            let count = tracker.record(counterparty, pattern, event.timestamp);
            tracing::debug!(
                %counterparty,
                pattern = pattern.as_str(),
                count,
                "pattern recorded"
            );
            count >= self.config.threshold(pattern) && tracker.mark_blacklisted(counterparty)
        };
        if !crossed {
            return None;
        }

        let reason = format!(
            "{} threshold reached ({} in {}s)",
            pattern.as_str(),
            self.config.threshold(pattern),
            self.config.window_secs
        );
        match self.contain(counterparty, &reason).await {
            Ok(report) => Some(report),
            Err(err) => {
                tracing::error!(%counterparty, error = %err, "blacklist failed");
                None
            }
        }
    }

    async fn contain(&self, counterparty: &CarrierId, reason: &str) -> Result<BlacklistReport> {
        tracing::warn!(%counterparty, reason, "blacklisting counterparty");
        let store = self.failover.store();
        let shipments = match store.active_shipments_for(counterparty).await {
            Ok(shipments) => shipments,
            Err(err) => {
                // Nothing was contained, so a later crossing may try again.
                self.tracker.lock().unmark_blacklisted(counterparty);
                return Err(err.into());
            }
        };

        let mut report = BlacklistReport {
            counterparty: counterparty.clone(),
            reason: reason.to_string(),
            failovers: Vec::with_capacity(shipments.len()),
            errors: Vec::new(),
            deactivated: false,
            already_blacklisted: false,
            at: self.clock.now(),
        };
        let containment = format!("blacklist: {reason}");
        for shipment in shipments {
            match self.failover.force_failover(&shipment.id, &containment).await {
                Ok(result) => report.failovers.push(result),
                Err(err) => {
                    tracing::error!(shipment = %shipment.id, error = %err, "forced failover failed");
                    report.errors.push((shipment.id, err.to_string()));
                }
            }
        }

        match store.set_carrier_active(counterparty, false).await {
            Ok(()) => report.deactivated = true,
            Err(err) => {
                tracing::error!(%counterparty, error = %err, "could not deactivate counterparty");
            }
        }

        metrics::counter!("custos_blacklists_total").increment(1);
        tracing::info!(
            %counterparty,
            moved = report.moved(),
            failed = report.errors.len(),
            deactivated = report.deactivated,
            "blacklist complete"
        );
        self.reports.lock().push(report.clone());
        Ok(report)
    }

    /// Start the consumer loop
    ///
    /// # Errors
    /// Returns `SwarmError::Stopped` if the loop was already started
    pub fn spawn(self: Arc<Self>) -> Result<SwarmHandle> {
        let mut receiver = self.receiver.lock().take().ok_or(SwarmError::Stopped)?;
        let (shutdown, mut stop) = watch::channel(false);

        let join = tokio::spawn(async move {
            tracing::info!("orchestrator started");
            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    event = receiver.recv() => match event {
                        Some(event) => {
                            self.handle_event(&event).await;
                        }
                        None => break,
                    },
                }
            }
            while let Ok(event) = receiver.try_recv() {
                self.handle_event(&event).await;
            }
            tracing::info!("orchestrator stopped");
        });

        Ok(SwarmHandle { shutdown, join })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use custos_agents::{InMemoryShipmentStore, SagaExecutor};
    use custos_core::AgentKind;
    use custos_test_utils::FakeLedger;

    #[test]
    fn defaults_match_the_documented_thresholds() {
        let config = SwarmConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.fraud_threshold, 3);
        assert_eq!(config.window(), Duration::from_secs(86_400));
    }

    #[test]
    fn config_reads_partial_yaml() {
        let config: SwarmConfig = serde_yaml::from_str("fraud_threshold: 2\n").unwrap();
        assert_eq!(config.fraud_threshold, 2);
        assert_eq!(config.failure_threshold, 5);
    }

    fn orchestrator() -> SwarmOrchestrator {
        let (tx, rx) = SwarmOrchestrator::channel();
        let executor = SagaExecutor::new(
            Arc::new(InMemoryShipmentStore::new()),
            Arc::new(FakeLedger::new()),
        );
        let failover = Arc::new(FailoverAgent::new(Arc::new(executor), tx.clone()));
        SwarmOrchestrator::new(tx, rx, failover, SwarmConfig::default())
    }

    fn incident(carrier: &str) -> SwarmEvent {
        SwarmEvent::new(
            AgentKind::Paolo,
            SwarmEventKind::CarrierIncident {
                carrier: CarrierId::new(carrier),
                detail: "missed pickup".into(),
            },
        )
    }

    #[tokio::test]
    async fn events_are_counted_by_kind() {
        let swarm = orchestrator();
        swarm.handle_event(&incident("BRT")).await;
        swarm.handle_event(&incident("BRT")).await;

        let stats = swarm.stats();
        assert_eq!(stats.events_processed, 2);
        assert_eq!(stats.events_by_kind.get("carrier_incident"), Some(&2));
        assert_eq!(stats.repeated_failures.get(&CarrierId::new("BRT")), Some(&2));
        assert!(stats.blacklisted.is_empty());
    }

    #[tokio::test]
    async fn spawn_twice_is_refused() {
        let swarm = Arc::new(orchestrator());
        let handle = swarm.clone().spawn().unwrap();
        assert!(matches!(swarm.clone().spawn(), Err(SwarmError::Stopped)));
        swarm.emit(incident("TNT")).unwrap();
        handle.shutdown().await;
        assert_eq!(swarm.stats().events_processed, 1);
    }
}
