//! Two-step saga: local store write, then ledger submission
//!
//! The local step captures a pre-image of the record it changes. If the
//! ledger step fails, times out, or is rejected by an open circuit, the
//! pre-image is written back through an explicit [`CompensatingAction`] and
//! the outcome carries a [`CompensationRecord`]. On success the local record
//! is finalized with the ledger hash.
//!
//! Executions are idempotent by business key: a repeat after success returns
//! the recorded hash without touching the ledger.

use crate::error::{Result, StoreError};
use crate::store::{DisputeRecord, ShipmentRecord, ShipmentStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use custos_core::{
    AgentKind, BreakerConfig, CallError, CircuitBreaker, CostEvent, CostKind, CostRecorder,
    ErrorKind, LedgerClient, LedgerHash, LedgerPayload, NoopCostRecorder, PortError, SharedClock,
    SystemClock,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Reverts a local write by restoring its pre-image
#[derive(Debug, Clone, PartialEq)]
pub enum CompensatingAction {
    RestoreShipment(ShipmentRecord),
    RestoreDispute(DisputeRecord),
}

impl CompensatingAction {
    /// Human-readable description for the compensation record
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::RestoreShipment(record) => format!(
                "restore shipment {} to carrier {} at version {}",
                record.id, record.carrier, record.version
            ),
            Self::RestoreDispute(record) => format!(
                "restore dispute {} to version {}",
                record.id, record.version
            ),
        }
    }

    /// Write the pre-image back
    ///
    /// # Errors
    /// Returns the store error if the write fails
    pub async fn apply(&self, store: &dyn ShipmentStore) -> std::result::Result<(), StoreError> {
        match self {
            Self::RestoreShipment(record) => store.put_shipment(record.clone()).await,
            Self::RestoreDispute(record) => store.put_dispute(record.clone()).await,
        }
    }
}

/// What a compensation did and whether it worked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationRecord {
    /// Compensating action, as described in the audit trail
    pub action: String,
    /// Local state was restored
    pub success: bool,
    /// Why the compensation failed
    pub error: Option<String>,
    /// When the compensation ran
    pub timestamp: DateTime<Utc>,
}

/// Local half of a saga
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Idempotency key
    fn business_key(&self) -> String;

    /// Agent on whose behalf the saga runs
    fn agent(&self) -> AgentKind;

    /// Apply the local change
    ///
    /// Returns the action that reverts it and the payload to submit.
    async fn apply_local(
        &self,
        store: &dyn ShipmentStore,
        now: DateTime<Utc>,
    ) -> Result<(CompensatingAction, LedgerPayload)>;

    /// Record the ledger hash on the changed record
    async fn finalize(
        &self,
        store: &dyn ShipmentStore,
        ledger_hash: &LedgerHash,
        now: DateTime<Utc>,
    ) -> Result<()>;
}

/// Result of one saga run
#[derive(Debug, Clone, PartialEq)]
pub enum SagaOutcome {
    /// Ledger accepted the change
    Committed {
        ledger_hash: LedgerHash,
        /// Returned from an earlier run; nothing was submitted
        idempotent: bool,
    },
    /// Ledger step failed and the local write was reverted
    RolledBack {
        error: String,
        /// `CircuitOpen` when the breaker rejected the call, else `SagaRollback`
        kind: ErrorKind,
        compensation: CompensationRecord,
    },
}

impl SagaOutcome {
    /// Check if the change is on the ledger
    #[inline]
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Runs sagas against one store and ledger
pub struct SagaExecutor {
    store: Arc<dyn ShipmentStore>,
    ledger: Arc<dyn LedgerClient>,
    breaker: Arc<CircuitBreaker>,
    clock: SharedClock,
    cost: Arc<dyn CostRecorder>,
    completed: DashMap<String, LedgerHash>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for SagaExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaExecutor")
            .field("breaker", &self.breaker.name())
            .field("completed", &self.completed.len())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl SagaExecutor {
    /// Create new executor with a default `ledger` breaker
    #[must_use]
    pub fn new(store: Arc<dyn ShipmentStore>, ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            store,
            ledger,
            breaker: Arc::new(CircuitBreaker::new("ledger", BreakerConfig::default())),
            clock: Arc::new(SystemClock),
            cost: Arc::new(NoopCostRecorder),
            completed: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    /// With a shared ledger breaker
    #[inline]
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// With clock
    #[inline]
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// With cost recorder
    #[inline]
    #[must_use]
    pub fn with_cost(mut self, cost: Arc<dyn CostRecorder>) -> Self {
        self.cost = cost;
        self
    }

    /// Store the sagas write to
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ShipmentStore> {
        &self.store
    }

    /// Ledger breaker
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Clock used to stamp records
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Ledger hash of a completed business key
    #[must_use]
    pub fn receipt(&self, business_key: &str) -> Option<LedgerHash> {
        self.completed.get(business_key).map(|entry| entry.value().clone())
    }

    /// Run `step` to completion
    ///
    /// # Errors
    /// Returns an error only when the local step (or finalization) fails;
    /// ledger failures are compensated and reported as
    /// [`SagaOutcome::RolledBack`].
    pub async fn run(&self, step: &dyn SagaStep) -> Result<SagaOutcome> {
        let key = step.business_key();
        if let Some(ledger_hash) = self.receipt(&key) {
            tracing::debug!(business_key = %key, "saga already committed");
            return Ok(SagaOutcome::Committed {
                ledger_hash,
                idempotent: true,
            });
        }

        let lock = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = InFlight {
            map: &self.in_flight,
            key: &key,
            guard: Some(lock.lock_owned().await),
        };
        if let Some(ledger_hash) = self.receipt(&key) {
            return Ok(SagaOutcome::Committed {
                ledger_hash,
                idempotent: true,
            });
        }

        let (compensation, payload) = step.apply_local(self.store.as_ref(), self.clock.now()).await?;
        tracing::debug!(business_key = %key, digest = %payload.digest(), "local step applied");

        let submitted = self.breaker.call(self.ledger.submit(payload)).await;
        if !matches!(&submitted, Err(err) if err.is_open()) {
            self.cost
                .record(CostEvent::new(CostKind::LedgerSubmission, step.agent(), key.clone()));
        }

        match submitted {
            Ok(ledger_hash) => {
                step.finalize(self.store.as_ref(), &ledger_hash, self.clock.now())
                    .await?;
                self.completed.insert(key.clone(), ledger_hash.clone());
                tracing::info!(business_key = %key, ledger_hash = %ledger_hash, "saga committed");
                metrics::counter!("custos_saga_total", "outcome" => "committed").increment(1);
                Ok(SagaOutcome::Committed {
                    ledger_hash,
                    idempotent: false,
                })
            }
            Err(err) => {
                let kind = if err.is_open() {
                    ErrorKind::CircuitOpen
                } else {
                    ErrorKind::SagaRollback
                };
                let error = describe_ledger_error(&err);
                let record = self.compensate(&key, &compensation).await;
                tracing::warn!(
                    business_key = %key,
                    error = %error,
                    compensated = record.success,
                    "ledger step failed, saga rolled back"
                );
                metrics::counter!("custos_saga_total", "outcome" => "rolled_back").increment(1);
                Ok(SagaOutcome::RolledBack {
                    error,
                    kind,
                    compensation: record,
                })
            }
        }
    }

    async fn compensate(&self, key: &str, action: &CompensatingAction) -> CompensationRecord {
        let result = action.apply(self.store.as_ref()).await;
        if let Err(err) = &result {
            tracing::error!(business_key = %key, error = %err, "compensation failed");
            metrics::counter!("custos_compensation_failures_total").increment(1);
        }
        CompensationRecord {
            action: action.describe(),
            success: result.is_ok(),
            error: result.err().map(|err| err.to_string()),
            timestamp: self.clock.now(),
        }
    }
}

/// Per-key execution lock, forgotten once no other run holds or awaits it
struct InFlight<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.map.remove_if(self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn describe_ledger_error(err: &CallError<PortError>) -> String {
    match err {
        CallError::Inner(inner) => format!("ledger: {inner}"),
        other => other.to_string(),
    }
}
