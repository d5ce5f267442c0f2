//! Circuit breaker for external calls
//!
//! Every ledger submission, health probe and evidence request goes through a
//! [`CircuitBreaker`], so a stalled dependency degrades to fast rejection.
//!
//! ```text
//!            F failures                 now - last_failure > T
//!  Closed ──────────────────▶ Open ─────────────────────────────▶ HalfOpen
//!    ▲                          ▲                                   │  │
//!    │                          └──────────── any failure ──────────┘  │
//!    └─────────────────────── 2 consecutive successes ─────────────────┘
//! ```
//!
//! A success while closed decrements the failure counter instead of zeroing it.
//! At most `H` trial calls are in flight while half-open; a trial gives its
//! slot back when it finishes or is dropped. Counters sit behind one mutex;
//! the wrapped future runs outside it.

use crate::error::CoreError;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Consecutive half-open successes required to close the circuit
pub const SUCCESSES_TO_CLOSE: u32 = 2;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected immediately
    Open,
    /// A bounded number of trial calls is admitted
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures before the circuit opens (`F`)
    pub failure_threshold: u32,
    /// Time the circuit stays open before probing recovery (`T`)
    pub recovery_timeout_ms: u64,
    /// Trial calls admitted while half-open (`H`)
    pub half_open_max_calls: u32,
    /// Per-call timeout; `None` disables it
    pub call_timeout_ms: Option<u64>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_max_calls: 3,
            call_timeout_ms: Some(10_000),
        }
    }
}

impl BreakerConfig {
    /// With failure threshold
    #[inline]
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// With recovery timeout
    #[inline]
    #[must_use]
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With half-open call budget
    #[inline]
    #[must_use]
    pub fn with_half_open_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    /// With per-call timeout
    #[inline]
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout_ms = timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Recovery timeout as a duration
    #[inline]
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// Per-call timeout as a duration
    #[inline]
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Reject budgets under which the circuit can never close
    ///
    /// # Errors
    /// Returns `CoreError::Config` when the failure threshold is zero or the
    /// half-open budget is below [`SUCCESSES_TO_CLOSE`]
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.failure_threshold == 0 {
            return Err(CoreError::Config("failure_threshold must be positive".into()));
        }
        if self.half_open_max_calls < SUCCESSES_TO_CLOSE {
            return Err(CoreError::Config(format!(
                "half_open_max_calls must be at least {SUCCESSES_TO_CLOSE}, got {}",
                self.half_open_max_calls
            )));
        }
        Ok(())
    }
}

/// Outcome of a call that did not produce a value
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// Rejected without calling the dependency
    #[error("circuit '{name}' is open")]
    Open { name: String },

    /// The dependency did not answer within the call timeout
    #[error("call through circuit '{name}' timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    /// The wrapped call failed
    #[error("{0}")]
    Inner(E),
}

impl<E> CallError<E> {
    /// Check whether the breaker rejected the call
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Wrapped error, if the call itself failed
    #[inline]
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Snapshot of breaker counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerMetrics {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Failure counter
    pub failure_count: u32,
    /// Consecutive half-open successes
    pub half_open_successes: u32,
    /// Trial calls in flight in the current half-open period
    pub half_open_admitted: u32,
    /// Calls rejected since creation
    pub rejected_total: u64,
}

#[derive(Debug)]
struct Counters {
    state: CircuitState,
    failures: u32,
    half_open_successes: u32,
    half_open_admitted: u32,
    // Bumped on every entry into half-open so stale trials release nothing.
    period: u64,
    last_failure: Option<Instant>,
    rejected_total: u64,
}

impl Counters {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            half_open_successes: 0,
            half_open_admitted: 0,
            period: 0,
            last_failure: None,
            rejected_total: 0,
        }
    }
}

/// Half-open slot held by an admitted trial call
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    period: Option<u64>,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        let Some(period) = self.period else {
            return;
        };
        let mut counters = self.breaker.counters.lock();
        if counters.state == CircuitState::HalfOpen && counters.period == period {
            counters.half_open_admitted = counters.half_open_admitted.saturating_sub(1);
        }
    }
}

/// Three-state failure-isolation primitive
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    counters: Mutex<Counters>,
}

impl CircuitBreaker {
    /// Create new circuit breaker
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            counters: Mutex::new(Counters::closed()),
        }
    }

    /// Breaker name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Run `fut` through the breaker
    ///
    /// # Errors
    /// - `CallError::Open` if the circuit rejects the call
    /// - `CallError::Timeout` if the call timeout elapses (counted as a failure)
    /// - `CallError::Inner` with the wrapped error (counted as a failure)
    pub async fn call<T, E, F>(&self, fut: F) -> Result<T, CallError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let Some(trial) = self.try_acquire() else {
            return Err(CallError::Open {
                name: self.name.clone(),
            });
        };
        let _slot = TrialSlot {
            breaker: self,
            period: trial,
        };

        let outcome = match self.config.call_timeout() {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result.map_err(CallError::Inner),
                Err(_) => Err(CallError::Timeout {
                    name: self.name.clone(),
                    timeout_ms: self.config.call_timeout_ms.unwrap_or_default(),
                }),
            },
            None => fut.await.map_err(CallError::Inner),
        };

        match &outcome {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        outcome
    }

    /// Current state, applying a pending `Open -> HalfOpen` transition
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut counters = self.counters.lock();
        self.refresh(&mut counters);
        counters.state
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> BreakerMetrics {
        let mut counters = self.counters.lock();
        self.refresh(&mut counters);
        BreakerMetrics {
            name: self.name.clone(),
            state: counters.state,
            failure_count: counters.failures,
            half_open_successes: counters.half_open_successes,
            half_open_admitted: counters.half_open_admitted,
            rejected_total: counters.rejected_total,
        }
    }

    /// Force the circuit closed and clear all counters (operator override)
    pub fn reset(&self) {
        let mut counters = self.counters.lock();
        let (rejected_total, period) = (counters.rejected_total, counters.period);
        *counters = Counters::closed();
        counters.rejected_total = rejected_total;
        counters.period = period;
        tracing::info!(breaker = %self.name, "circuit manually reset to closed");
    }

    /// Force the circuit open (operator override)
    pub fn force_open(&self) {
        let mut counters = self.counters.lock();
        counters.state = CircuitState::Open;
        counters.last_failure = Some(Instant::now());
        counters.half_open_admitted = 0;
        counters.half_open_successes = 0;
        tracing::warn!(breaker = %self.name, "circuit manually opened");
    }

    fn refresh(&self, counters: &mut Counters) {
        if counters.state != CircuitState::Open {
            return;
        }
        let recovered = counters
            .last_failure
            .map_or(true, |at| Instant::now().duration_since(at) > self.config.recovery_timeout());
        if recovered {
            counters.state = CircuitState::HalfOpen;
            counters.period += 1;
            counters.half_open_admitted = 0;
            counters.half_open_successes = 0;
            tracing::info!(breaker = %self.name, "circuit half-open, probing recovery");
        }
    }

    /// `None` rejects; `Some(Some(period))` admits a half-open trial
    fn try_acquire(&self) -> Option<Option<u64>> {
        let mut counters = self.counters.lock();
        self.refresh(&mut counters);
        let admitted = match counters.state {
            CircuitState::Closed => Some(None),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if counters.half_open_admitted < self.config.half_open_max_calls {
                    counters.half_open_admitted += 1;
                    Some(Some(counters.period))
                } else {
                    None
                }
            }
        };
        if admitted.is_none() {
            counters.rejected_total += 1;
            metrics::counter!("custos_breaker_rejections_total", "breaker" => self.name.clone())
                .increment(1);
            tracing::debug!(breaker = %self.name, state = ?counters.state, "call rejected");
        }
        admitted
    }

    fn record_success(&self) {
        let mut counters = self.counters.lock();
        match counters.state {
            CircuitState::Closed => {
                counters.failures = counters.failures.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                counters.half_open_successes += 1;
                if counters.half_open_successes >= SUCCESSES_TO_CLOSE {
                    counters.state = CircuitState::Closed;
                    counters.failures = 0;
                    counters.half_open_admitted = 0;
                    counters.half_open_successes = 0;
                    tracing::info!(breaker = %self.name, "circuit closed, dependency recovered");
                }
            }
            // A call admitted before the circuit re-opened; its success does not count.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut counters = self.counters.lock();
        counters.last_failure = Some(Instant::now());
        match counters.state {
            CircuitState::Closed => {
                counters.failures += 1;
                if counters.failures >= self.config.failure_threshold {
                    counters.state = CircuitState::Open;
                    metrics::counter!("custos_breaker_opened_total", "breaker" => self.name.clone())
                        .increment(1);
                    tracing::warn!(
                        breaker = %self.name,
                        failures = counters.failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                counters.state = CircuitState::Open;
                counters.half_open_admitted = 0;
                counters.half_open_successes = 0;
                tracing::warn!(breaker = %self.name, "trial call failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }
}

/// Named breakers shared by the services of one process
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: BreakerConfig,
}

impl BreakerRegistry {
    /// Create registry with a default configuration for new breakers
    #[must_use]
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    /// Get or create the breaker called `name`
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config.clone())))
            .clone()
    }

    /// Register a breaker with its own configuration, replacing any existing one
    pub fn register(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        self.breakers.insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Metrics of every registered breaker, sorted by name
    #[must_use]
    pub fn all_metrics(&self) -> Vec<BreakerMetrics> {
        let mut metrics: Vec<_> = self.breakers.iter().map(|b| b.value().metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }
}
