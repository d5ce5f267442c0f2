//! Veto service
//!
//! Owns the veto-window lifecycle:
//! - `open` persists a `Reserved` session and arms its timer
//! - `veto`, `commit` and `cancel` resolve it under a per-session lock
//! - the expiry consumer flips `Reserved -> Expired` when the window elapses
//! - `request_compensation` handles a veto that arrives after commit
//!
//! Every transition re-reads the persisted session while holding the session
//! lock and writes with compare-and-set on the status it read.

use crate::audit::{AuditEventType, DecisionAudit, TIMER_ACTOR};
use crate::error::{Result, VetoError};
use crate::repository::VetoRepository;
use crate::session::{OpenParams, VetoSession, VetoStatus};
use crate::state::validate_transition;
use crate::timer::{Expiry, TimerRegistry};
use async_trait::async_trait;
use custos_core::{LedgerHash, Notifier, PortError, SessionId, SharedClock, SystemClock};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

/// Reverses a committed action after a post-commit veto
#[async_trait]
pub trait Compensator: Send + Sync {
    /// Undo the action recorded by `session`, returning the ledger reference
    /// of the compensating transaction
    async fn compensate(&self, session: &VetoSession) -> std::result::Result<LedgerHash, PortError>;
}

/// Veto service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VetoConfig {
    /// Minimum rationale length (characters, after trimming)
    pub min_rationale_len: usize,
    /// Notification channel for opened windows
    pub notify_channel: String,
}

impl Default for VetoConfig {
    fn default() -> Self {
        Self {
            min_rationale_len: 10,
            notify_channel: "veto".to_string(),
        }
    }
}

impl VetoConfig {
    /// With minimum rationale length
    #[inline]
    #[must_use]
    pub fn with_min_rationale_len(mut self, len: usize) -> Self {
        self.min_rationale_len = len;
        self
    }
}

struct Inner {
    repo: Arc<dyn VetoRepository>,
    clock: SharedClock,
    config: VetoConfig,
    notifier: Option<Arc<dyn Notifier>>,
    timers: TimerRegistry,
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
    watchers: DashMap<SessionId, watch::Sender<VetoStatus>>,
    consumer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.consumer.get_mut().take() {
            handle.abort();
        }
    }
}

/// Held session lock; the lock entry is dropped once nobody else holds or
/// waits on it
struct SessionGuard<'a> {
    locks: &'a DashMap<SessionId, Arc<Mutex<()>>>,
    id: SessionId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Builder for [`VetoService`]
pub struct VetoServiceBuilder {
    repo: Arc<dyn VetoRepository>,
    clock: SharedClock,
    config: VetoConfig,
    notifier: Option<Arc<dyn Notifier>>,
}

impl VetoServiceBuilder {
    /// With clock
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// With configuration
    #[must_use]
    pub fn config(mut self, config: VetoConfig) -> Self {
        self.config = config;
        self
    }

    /// With operator notifier
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Build the service and start its expiry consumer
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn build(self) -> VetoService {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            repo: self.repo,
            clock: self.clock,
            config: self.config,
            notifier: self.notifier,
            timers: TimerRegistry::new(expiry_tx),
            locks: DashMap::new(),
            watchers: DashMap::new(),
            consumer: parking_lot::Mutex::new(None),
        });
        let handle = tokio::spawn(expiry_loop(Arc::downgrade(&inner), expiry_rx));
        *inner.consumer.lock() = Some(handle);
        VetoService { inner }
    }
}

async fn expiry_loop(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Expiry>) {
    while let Some(expiry) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.timers.complete(expiry) {
            tracing::trace!(session = %expiry.session, "stale veto timer ignored");
            continue;
        }
        if let Err(err) = inner.handle_expiry(expiry.session).await {
            tracing::error!(session = %expiry.session, error = %err, "failed to expire veto session");
        }
    }
    tracing::debug!("veto expiry consumer stopped");
}

/// Veto-window state machine
#[derive(Clone)]
pub struct VetoService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for VetoService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VetoService")
            .field("config", &self.inner.config)
            .field("live_timers", &self.inner.timers.len())
            .finish_non_exhaustive()
    }
}

impl VetoService {
    /// Start building a service over `repo`
    #[must_use]
    pub fn builder(repo: Arc<dyn VetoRepository>) -> VetoServiceBuilder {
        VetoServiceBuilder {
            repo,
            clock: Arc::new(SystemClock),
            config: VetoConfig::default(),
            notifier: None,
        }
    }

    /// Service with default clock and configuration
    #[must_use]
    pub fn new(repo: Arc<dyn VetoRepository>) -> Self {
        Self::builder(repo).build()
    }

    /// Open a veto window
    ///
    /// # Errors
    /// - `VetoError::InvalidTimeout` for a zero timeout
    /// - `VetoError::Repository` if the session cannot be stored
    pub async fn open(&self, params: OpenParams, timeout: Duration) -> Result<VetoSession> {
        let inner = &self.inner;
        let session = VetoSession::open(params, timeout, inner.clock.now())?;
        let guard = inner.lock_session(session.id).await;
        inner.repo.insert_session(&session).await?;
        inner
            .append_audit(
                DecisionAudit::record(
                    &session,
                    AuditEventType::Opened,
                    session.agent.ai_actor(),
                    session.opened_at,
                ),
            )
            .await?;
        inner
            .watchers
            .insert(session.id, watch::channel(VetoStatus::Reserved).0);
        inner.timers.arm(session.id, timeout);
        drop(guard);

        tracing::info!(
            session = %session.id,
            agent = %session.agent,
            operation = %session.operation,
            amount = %session.amount,
            expires_at = %session.expires_at,
            "veto window opened"
        );
        metrics::counter!("custos_veto_sessions_opened_total", "agent" => session.agent.as_str())
            .increment(1);

        inner.notify_opened(&session).await;
        Ok(session)
    }

    /// Veto a reserved session
    ///
    /// # Errors
    /// - `VetoError::MissingOperator` / `VetoError::RationaleTooShort` on bad input
    /// - `VetoError::WindowExpired` at or after `expires_at`, or once expired
    /// - `VetoError::NotAllowed` from any other non-`Reserved` status
    pub async fn veto(&self, id: SessionId, operator_id: &str, rationale: &str) -> Result<VetoSession> {
        let inner = &self.inner;
        let (operator_id, rationale) = inner.validate_operator_input(operator_id, rationale)?;

        let _guard = inner.lock_session(id).await;
        let mut session = inner.load(id).await?;
        let now = inner.clock.now();

        match session.status {
            VetoStatus::Reserved if !session.window_open_at(now) => {
                inner.expire_locked(&mut session, now).await?;
                Err(VetoError::WindowExpired {
                    id,
                    expires_at: session.expires_at,
                })
            }
            VetoStatus::Reserved => {
                validate_transition(VetoStatus::Reserved, VetoStatus::Vetoed)?;
                session.status = VetoStatus::Vetoed;
                session.vetoed_at = Some(now);
                session.operator_id = Some(operator_id.clone());
                session.rationale = Some(rationale.clone());
                inner.repo.update_session(&session, VetoStatus::Reserved).await?;
                inner.timers.cancel(id);
                inner.publish(&session);

                let elapsed = session.elapsed_ms(now);
                inner
                    .append_audit(
                        DecisionAudit::record(&session, AuditEventType::Vetoed, operator_id, now)
                            .with_action("veto")
                            .with_rationale(rationale)
                            .with_time_to_decision(elapsed),
                    )
                    .await?;
                tracing::info!(session = %id, time_to_decision_ms = elapsed, "action vetoed");
                metrics::counter!("custos_veto_sessions_resolved_total", "status" => "vetoed").increment(1);
                Ok(session)
            }
            VetoStatus::Expired => Err(VetoError::WindowExpired {
                id,
                expires_at: session.expires_at,
            }),
            status => Err(VetoError::NotAllowed {
                id,
                status,
                operation: "veto",
            }),
        }
    }

    /// Commit a reserved or expired session
    ///
    /// # Errors
    /// `VetoError::NotAllowed` unless the session is `Reserved` or `Expired`
    pub async fn commit(&self, id: SessionId, ledger_hash: Option<LedgerHash>) -> Result<VetoSession> {
        let inner = &self.inner;
        let _guard = inner.lock_session(id).await;
        let mut session = inner.load(id).await?;

        let from = session.status;
        if !matches!(from, VetoStatus::Reserved | VetoStatus::Expired) {
            return Err(VetoError::NotAllowed {
                id,
                status: from,
                operation: "commit",
            });
        }

        // `Committing` is never persisted; a failed write leaves `from` in place
        validate_transition(from, VetoStatus::Committing)?;
        validate_transition(VetoStatus::Committing, VetoStatus::Committed)?;
        let now = inner.clock.now();
        session.status = VetoStatus::Committed;
        session.committed_at = Some(now);
        session.ledger_tx_hash = ledger_hash;
        inner.repo.update_session(&session, from).await?;
        inner.timers.cancel(id);
        inner.publish(&session);

        let elapsed = session.elapsed_ms(now);
        inner
            .append_audit(
                DecisionAudit::record(&session, AuditEventType::Committed, session.agent.ai_actor(), now)
                    .with_action(if from == VetoStatus::Expired { "commit_after_expiry" } else { "commit" })
                    .with_time_to_decision(elapsed)
                    .with_ledger_hash(session.ledger_tx_hash.clone()),
            )
            .await?;
        tracing::info!(session = %id, from = %from, ledger_tx_hash = ?session.ledger_tx_hash, "veto session committed");
        metrics::counter!("custos_veto_sessions_resolved_total", "status" => "committed").increment(1);
        Ok(session)
    }

    /// Administratively abort a reserved or expired session
    ///
    /// # Errors
    /// `VetoError::NotAllowed` unless the session is `Reserved` or `Expired`
    pub async fn cancel(&self, id: SessionId, operator_id: &str, reason: &str) -> Result<VetoSession> {
        let inner = &self.inner;
        let operator_id = operator_id.trim();
        if operator_id.is_empty() {
            return Err(VetoError::MissingOperator);
        }

        let _guard = inner.lock_session(id).await;
        let mut session = inner.load(id).await?;
        let from = session.status;
        if !matches!(from, VetoStatus::Reserved | VetoStatus::Expired) {
            return Err(VetoError::NotAllowed {
                id,
                status: from,
                operation: "cancel",
            });
        }

        validate_transition(from, VetoStatus::Cancelled)?;
        session.status = VetoStatus::Cancelled;
        inner.repo.update_session(&session, from).await?;
        inner.timers.cancel(id);
        inner.publish(&session);

        let now = inner.clock.now();
        inner
            .append_audit(
                DecisionAudit::record(&session, AuditEventType::Cancelled, operator_id, now)
                    .with_action("cancel")
                    .with_rationale(reason.trim())
                    .with_time_to_decision(session.elapsed_ms(now)),
            )
            .await?;
        tracing::info!(session = %id, operator = operator_id, "veto session cancelled");
        metrics::counter!("custos_veto_sessions_resolved_total", "status" => "cancelled").increment(1);
        Ok(session)
    }

    /// Veto an already committed action and run its compensation
    ///
    /// The session is marked `Vetoed` with `compensation_pending` before the
    /// compensator runs; the compensator runs outside the session lock.
    ///
    /// # Errors
    /// - `VetoError::NotAllowed` unless the session is `Committed`
    /// - `VetoError::CompensationFailed` if the compensator fails
    pub async fn request_compensation(
        &self,
        id: SessionId,
        operator_id: &str,
        rationale: &str,
        compensator: &dyn Compensator,
    ) -> Result<VetoSession> {
        let inner = &self.inner;
        let (operator_id, rationale) = inner.validate_operator_input(operator_id, rationale)?;

        let session = {
            let _guard = inner.lock_session(id).await;
            let mut session = inner.load(id).await?;
            if session.status != VetoStatus::Committed {
                return Err(VetoError::NotAllowed {
                    id,
                    status: session.status,
                    operation: "request compensation for",
                });
            }
            validate_transition(VetoStatus::Committed, VetoStatus::Vetoed)?;
            let now = inner.clock.now();
            session.status = VetoStatus::Vetoed;
            session.vetoed_at = Some(now);
            session.operator_id = Some(operator_id.clone());
            session.rationale = Some(rationale.clone());
            session.compensation_pending = true;
            inner.repo.update_session(&session, VetoStatus::Committed).await?;
            inner
                .append_audit(
                    DecisionAudit::record(
                        &session,
                        AuditEventType::CompensationRequested,
                        operator_id.clone(),
                        now,
                    )
                    .with_action("post_commit_veto")
                    .with_rationale(rationale)
                    .with_time_to_decision(session.elapsed_ms(now))
                    .with_ledger_hash(session.ledger_tx_hash.clone()),
                )
                .await?;
            inner.publish(&session);
            session
        };

        tracing::warn!(session = %id, operator = %operator_id, "post-commit veto, compensating");
        let outcome = compensator.compensate(&session).await;

        let _guard = inner.lock_session(id).await;
        let mut session = inner.load(id).await?;
        let now = inner.clock.now();
        match outcome {
            Ok(hash) => {
                session.compensation_tx_hash = Some(hash.clone());
                session.compensation_pending = false;
                inner.repo.update_session(&session, VetoStatus::Vetoed).await?;
                inner
                    .append_audit(
                        DecisionAudit::record(&session, AuditEventType::CompensationCompleted, operator_id, now)
                            .with_ledger_hash(Some(hash)),
                    )
                    .await?;
                metrics::counter!("custos_veto_compensations_total", "outcome" => "completed").increment(1);
                Ok(session)
            }
            Err(err) => {
                inner
                    .append_audit(
                        DecisionAudit::record(&session, AuditEventType::CompensationFailed, operator_id, now)
                            .with_rationale(err.to_string()),
                    )
                    .await?;
                tracing::error!(session = %id, error = %err, "compensation failed");
                metrics::counter!("custos_veto_compensations_total", "outcome" => "failed").increment(1);
                Err(VetoError::CompensationFailed {
                    id,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Current persisted session
    ///
    /// # Errors
    /// `VetoError::SessionNotFound` for unknown ids
    pub async fn get_status(&self, id: SessionId) -> Result<VetoSession> {
        self.inner.load(id).await
    }

    /// Sessions still inside their window
    ///
    /// # Errors
    /// Returns repository errors
    pub async fn list_active(&self) -> Result<Vec<VetoSession>> {
        self.inner.repo.list_by_status(VetoStatus::Reserved).await
    }

    /// Audit rows for a session, oldest first
    ///
    /// # Errors
    /// Returns repository errors
    pub async fn audit_trail(&self, id: SessionId) -> Result<Vec<DecisionAudit>> {
        self.inner.repo.audit_for(id).await
    }

    /// Wait until the session leaves `Reserved`/`Committing`
    ///
    /// # Errors
    /// - `VetoError::SessionNotFound` for unknown ids
    /// - `VetoError::ShutDown` if the service stops while waiting
    pub async fn wait_for_resolution(&self, id: SessionId) -> Result<VetoSession> {
        let inner = &self.inner;
        let mut rx = {
            let _guard = inner.lock_session(id).await;
            let session = inner.load(id).await?;
            if !session.status.is_pending() {
                return Ok(session);
            }
            inner
                .watchers
                .entry(id)
                .or_insert_with(|| watch::channel(session.status).0)
                .subscribe()
        };

        let resolved = rx.wait_for(|status| !status.is_pending()).await.is_ok();
        drop(rx);
        let session = inner.load(id).await?;
        if resolved || !session.status.is_pending() {
            Ok(session)
        } else {
            Err(VetoError::ShutDown)
        }
    }

    /// Re-arm timers for sessions left `Reserved` by a previous process
    ///
    /// Windows that already elapsed expire immediately.
    ///
    /// # Errors
    /// Returns repository errors
    pub async fn recover(&self) -> Result<usize> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let pending = inner.repo.list_by_status(VetoStatus::Reserved).await?;
        let count = pending.len();
        for session in pending {
            if inner.timers.is_armed(session.id) {
                continue;
            }
            inner
                .watchers
                .entry(session.id)
                .or_insert_with(|| watch::channel(VetoStatus::Reserved).0);
            inner.timers.arm(session.id, session.remaining_at(now));
        }
        if count > 0 {
            tracing::info!(count, "re-armed veto timers");
        }
        Ok(count)
    }

    /// Number of live timers
    #[must_use]
    pub fn live_timers(&self) -> usize {
        self.inner.timers.len()
    }

    /// Sessions holding a lock entry or a resolution watcher
    #[must_use]
    pub fn tracked_sessions(&self) -> usize {
        self.inner.locks.len().max(self.inner.watchers.len())
    }

    /// Stop every timer and the expiry consumer
    pub fn shutdown(&self) {
        self.inner.timers.shutdown();
        if let Some(handle) = self.inner.consumer.lock().take() {
            handle.abort();
        }
    }
}

impl Inner {
    async fn lock_session(&self, id: SessionId) -> SessionGuard<'_> {
        let lock = self.locks.entry(id).or_default().clone();
        SessionGuard {
            locks: &self.locks,
            id,
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn load(&self, id: SessionId) -> Result<VetoSession> {
        self.repo
            .get_session(id)
            .await?
            .ok_or(VetoError::SessionNotFound(id))
    }

    async fn append_audit(&self, entry: DecisionAudit) -> Result<()> {
        self.repo.append_audit(&entry).await
    }

    /// Wake waiters; a resolved session no longer needs its watcher
    fn publish(&self, session: &VetoSession) {
        if session.status.is_pending() {
            if let Some(tx) = self.watchers.get(&session.id) {
                tx.send_replace(session.status);
            }
        } else if let Some((_, tx)) = self.watchers.remove(&session.id) {
            tx.send_replace(session.status);
        }
    }

    fn validate_operator_input(&self, operator_id: &str, rationale: &str) -> Result<(String, String)> {
        let operator_id = operator_id.trim();
        if operator_id.is_empty() {
            return Err(VetoError::MissingOperator);
        }
        let rationale = rationale.trim();
        let actual = rationale.chars().count();
        if actual < self.config.min_rationale_len {
            return Err(VetoError::RationaleTooShort {
                min: self.config.min_rationale_len,
                actual,
            });
        }
        Ok((operator_id.to_string(), rationale.to_string()))
    }

    /// `Reserved -> Expired`; caller holds the session lock
    async fn expire_locked(&self, session: &mut VetoSession, now: chrono::DateTime<chrono::Utc>) -> Result<()> {
        validate_transition(VetoStatus::Reserved, VetoStatus::Expired)?;
        session.status = VetoStatus::Expired;
        self.repo.update_session(session, VetoStatus::Reserved).await?;
        self.timers.cancel(session.id);
        self.publish(session);
        self.append_audit(
            DecisionAudit::record(session, AuditEventType::Expired, TIMER_ACTOR, now)
                .with_action("expire")
                .with_time_to_decision(session.elapsed_ms(now)),
        )
        .await?;
        tracing::info!(session = %session.id, "veto window expired");
        metrics::counter!("custos_veto_sessions_resolved_total", "status" => "expired").increment(1);
        Ok(())
    }

    async fn handle_expiry(&self, id: SessionId) -> Result<()> {
        let _guard = self.lock_session(id).await;
        let Some(mut session) = self.repo.get_session(id).await? else {
            tracing::warn!(session = %id, "timer fired for unknown session");
            return Ok(());
        };
        if session.status != VetoStatus::Reserved {
            tracing::debug!(session = %id, status = %session.status, "timer fired for resolved session");
            return Ok(());
        }

        let now = self.clock.now();
        if session.window_open_at(now) {
            let remaining = session.remaining_at(now);
            tracing::debug!(
                session = %id,
                remaining_ms = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
                "timer fired early, re-arming"
            );
            self.timers.arm(id, remaining);
            return Ok(());
        }
        self.expire_locked(&mut session, now).await
    }

    async fn notify_opened(&self, session: &VetoSession) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let message = format!(
            "veto window open for {} {} ({}): {} EUR, {}s, session {}",
            session.agent,
            session.operation,
            session
                .shipment_ref
                .as_ref()
                .map_or("-", custos_core::ShipmentId::as_str),
            session.amount,
            session.timeout.as_secs(),
            session.id
        );
        if let Err(err) = notifier.notify(&self.config.notify_channel, &message).await {
            tracing::warn!(session = %session.id, error = %err, "veto notification failed");
        }
    }
}
