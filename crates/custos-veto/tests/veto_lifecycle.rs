//! Veto window lifecycle against the in-memory repository

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use custos_core::{
    AgentKind, CarrierId, LedgerHash, ManualClock, Money, Notifier, OperationKind, PortError,
    ShipmentId, TokioClock,
};
use custos_core::SessionId;
use custos_veto::{
    AuditEventType, Compensator, DecisionAudit, InMemoryVetoRepository, OpenParams, VetoError,
    VetoRepository, VetoService, VetoSession, VetoStatus,
};
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const RATIONALE: &str = "carrier already confirmed pickup by phone";

fn failover(euros: i64) -> OpenParams {
    OpenParams::new(AgentKind::Paolo, OperationKind::CarrierFailover, Money::from_euros(euros))
        .with_shipment(ShipmentId::new("SHP-1001"))
        .with_counterparty(CarrierId::new("BRT"))
        .with_confidence(0.91)
}

fn manual_service() -> (VetoService, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 3, 4, 10, 0, 0).unwrap(),
    ));
    let service = VetoService::builder(Arc::new(InMemoryVetoRepository::new()))
        .clock(clock.clone())
        .build();
    (service, clock)
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, channel: &str, message: &str) -> Result<(), PortError> {
        self.sent.lock().push((channel.to_string(), message.to_string()));
        Ok(())
    }
}

struct DownNotifier;

#[async_trait]
impl Notifier for DownNotifier {
    async fn notify(&self, _channel: &str, _message: &str) -> Result<(), PortError> {
        Err(PortError::unavailable("pager", "connection refused"))
    }
}

struct FixedCompensator(Result<LedgerHash, PortError>);

#[async_trait]
impl Compensator for FixedCompensator {
    async fn compensate(&self, _session: &VetoSession) -> Result<LedgerHash, PortError> {
        self.0.clone()
    }
}

/// Fails every write that would mark a session committed while `fail` is set
#[derive(Default)]
struct CommitFailingRepo {
    inner: InMemoryVetoRepository,
    fail: AtomicBool,
}

#[async_trait]
impl VetoRepository for CommitFailingRepo {
    async fn insert_session(&self, session: &VetoSession) -> custos_veto::Result<()> {
        self.inner.insert_session(session).await
    }

    async fn get_session(&self, id: SessionId) -> custos_veto::Result<Option<VetoSession>> {
        self.inner.get_session(id).await
    }

    async fn update_session(
        &self,
        session: &VetoSession,
        expected: VetoStatus,
    ) -> custos_veto::Result<()> {
        if session.status == VetoStatus::Committed && self.fail.load(Ordering::SeqCst) {
            return Err(VetoError::Repository("disk full".into()));
        }
        self.inner.update_session(session, expected).await
    }

    async fn list_by_status(&self, status: VetoStatus) -> custos_veto::Result<Vec<VetoSession>> {
        self.inner.list_by_status(status).await
    }

    async fn append_audit(&self, entry: &DecisionAudit) -> custos_veto::Result<()> {
        self.inner.append_audit(entry).await
    }

    async fn audit_for(&self, id: SessionId) -> custos_veto::Result<Vec<DecisionAudit>> {
        self.inner.audit_for(id).await
    }
}

#[tokio::test]
async fn veto_inside_window_records_operator_and_rationale() {
    let (service, clock) = manual_service();
    let session = service.open(failover(7_500), Duration::from_secs(60)).await.unwrap();
    assert_eq!(service.live_timers(), 1);

    clock.advance(Duration::from_secs(12));
    let vetoed = service.veto(session.id, "op-anna", RATIONALE).await.unwrap();
    assert_eq!(vetoed.status, VetoStatus::Vetoed);
    assert_eq!(vetoed.operator_id.as_deref(), Some("op-anna"));
    assert_eq!(vetoed.rationale.as_deref(), Some(RATIONALE));
    assert_eq!(service.live_timers(), 0);

    let trail = service.audit_trail(session.id).await.unwrap();
    let events: Vec<_> = trail.iter().map(|row| row.event).collect();
    assert_eq!(events, vec![AuditEventType::Opened, AuditEventType::Vetoed]);
    assert_eq!(trail[0].actor, "ai:paolo");
    assert_eq!(trail[1].time_to_decision_ms, Some(12_000));
    assert!(service.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn veto_input_is_validated() {
    let (service, _clock) = manual_service();
    let session = service.open(failover(7_500), Duration::from_secs(60)).await.unwrap();

    let short = service.veto(session.id, "op-anna", "no").await.unwrap_err();
    assert!(matches!(short, VetoError::RationaleTooShort { min: 10, actual: 2 }));
    let anonymous = service.veto(session.id, "  ", RATIONALE).await.unwrap_err();
    assert!(matches!(anonymous, VetoError::MissingOperator));

    let still = service.get_status(session.id).await.unwrap();
    assert_eq!(still.status, VetoStatus::Reserved);
    assert!(still.operator_id.is_none() && still.rationale.is_none());
}

#[tokio::test]
async fn veto_one_millisecond_before_deadline_succeeds() {
    let (service, clock) = manual_service();
    let session = service.open(failover(7_500), Duration::from_secs(60)).await.unwrap();

    clock.set(session.expires_at - chrono::Duration::milliseconds(1));
    let vetoed = service.veto(session.id, "op-anna", RATIONALE).await.unwrap();
    assert_eq!(vetoed.status, VetoStatus::Vetoed);
}

#[tokio::test]
async fn veto_one_millisecond_after_deadline_fails_before_timer_runs() {
    let (service, clock) = manual_service();
    let session = service.open(failover(7_500), Duration::from_secs(60)).await.unwrap();

    // The real timer is still 60s away
    clock.set(session.expires_at + chrono::Duration::milliseconds(1));
    let err = service.veto(session.id, "op-anna", RATIONALE).await.unwrap_err();
    assert!(matches!(err, VetoError::WindowExpired { .. }));
    assert_eq!(err.kind(), custos_core::ErrorKind::VetoWindowExpired);

    let expired = service.get_status(session.id).await.unwrap();
    assert_eq!(expired.status, VetoStatus::Expired);
    assert!(expired.operator_id.is_none());

    // Once expired, a veto keeps failing with the same error
    let again = service.veto(session.id, "op-anna", RATIONALE).await.unwrap_err();
    assert!(matches!(again, VetoError::WindowExpired { .. }));
}

#[tokio::test(start_paused = true)]
async fn expiry_never_fires_before_deadline() {
    let service = VetoService::builder(Arc::new(InMemoryVetoRepository::new()))
        .clock(Arc::new(TokioClock::new()))
        .build();
    let session = service.open(failover(7_500), Duration::from_secs(60)).await.unwrap();

    tokio::time::advance(Duration::from_millis(59_999)).await;
    tokio::task::yield_now().await;
    assert_eq!(service.get_status(session.id).await.unwrap().status, VetoStatus::Reserved);

    let resolved = service.wait_for_resolution(session.id).await.unwrap();
    assert_eq!(resolved.status, VetoStatus::Expired);

    let trail = service.audit_trail(session.id).await.unwrap();
    let expired = trail
        .iter()
        .find(|row| row.event == AuditEventType::Expired)
        .unwrap();
    assert!(expired.timestamp >= session.expires_at);
    assert_eq!(expired.actor, custos_veto::TIMER_ACTOR);
}

#[tokio::test(start_paused = true)]
async fn early_timer_is_rearmed() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 4, 10, 0, 0).unwrap()));
    let service = VetoService::builder(Arc::new(InMemoryVetoRepository::new()))
        .clock(clock.clone())
        .build();
    let session = service.open(failover(7_500), Duration::from_secs(10)).await.unwrap();

    // Timer fires after 10s of tokio time but the wall clock says 4s
    clock.advance(Duration::from_secs(4));
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(service.get_status(session.id).await.unwrap().status, VetoStatus::Reserved);
    assert_eq!(service.live_timers(), 1);

    clock.advance(Duration::from_secs(6));
    let resolved = service.wait_for_resolution(session.id).await.unwrap();
    assert_eq!(resolved.status, VetoStatus::Expired);
}

#[tokio::test]
async fn commit_after_expiry_is_audited() {
    let (service, clock) = manual_service();
    let session = service.open(failover(7_500), Duration::from_secs(60)).await.unwrap();
    clock.advance(Duration::from_secs(61));
    let _ = service.veto(session.id, "op-anna", RATIONALE).await;

    let committed = service
        .commit(session.id, Some(LedgerHash::new("0xabc")))
        .await
        .unwrap();
    assert_eq!(committed.status, VetoStatus::Committed);
    assert_eq!(committed.ledger_tx_hash, Some(LedgerHash::new("0xabc")));
    assert!(committed.committed_at.is_some());

    let trail = service.audit_trail(session.id).await.unwrap();
    let last = trail.last().unwrap();
    assert_eq!(last.event, AuditEventType::Committed);
    assert_eq!(last.operator_action.as_deref(), Some("commit_after_expiry"));
}

#[tokio::test]
async fn resolved_sessions_are_immutable() {
    let (service, _clock) = manual_service();
    let session = service.open(failover(7_500), Duration::from_secs(60)).await.unwrap();
    service.veto(session.id, "op-anna", RATIONALE).await.unwrap();

    assert!(matches!(
        service.commit(session.id, None).await,
        Err(VetoError::NotAllowed { status: VetoStatus::Vetoed, .. })
    ));
    assert!(matches!(
        service.cancel(session.id, "op-anna", "duplicate").await,
        Err(VetoError::NotAllowed { .. })
    ));
    assert!(matches!(
        service.veto(session.id, "op-marco", RATIONALE).await,
        Err(VetoError::NotAllowed { .. })
    ));
    let unchanged = service.get_status(session.id).await.unwrap();
    assert_eq!(unchanged.operator_id.as_deref(), Some("op-anna"));
}

#[tokio::test]
async fn cancel_from_reserved() {
    let (service, _clock) = manual_service();
    let session = service.open(failover(7_500), Duration::from_secs(60)).await.unwrap();
    let cancelled = service
        .cancel(session.id, "op-admin", "shipment withdrawn")
        .await
        .unwrap();
    assert_eq!(cancelled.status, VetoStatus::Cancelled);
    assert!(cancelled.operator_id.is_none());
    assert_eq!(service.live_timers(), 0);

    let trail = service.audit_trail(session.id).await.unwrap();
    assert_eq!(trail.last().unwrap().rationale.as_deref(), Some("shipment withdrawn"));
}

#[tokio::test]
async fn post_commit_veto_compensates() {
    let (service, _clock) = manual_service();
    let session = service.open(failover(7_500), Duration::from_secs(60)).await.unwrap();
    service.commit(session.id, Some(LedgerHash::new("0x1"))).await.unwrap();

    let compensator = FixedCompensator(Ok(LedgerHash::new("0xreverse")));
    let vetoed = service
        .request_compensation(session.id, "op-anna", RATIONALE, &compensator)
        .await
        .unwrap();
    assert_eq!(vetoed.status, VetoStatus::Vetoed);
    assert!(!vetoed.compensation_pending);
    assert_eq!(vetoed.compensation_tx_hash, Some(LedgerHash::new("0xreverse")));

    let events: Vec<_> = service
        .audit_trail(session.id)
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.event)
        .collect();
    assert_eq!(
        events,
        vec![
            AuditEventType::Opened,
            AuditEventType::Committed,
            AuditEventType::CompensationRequested,
            AuditEventType::CompensationCompleted,
        ]
    );
}

#[tokio::test]
async fn failed_compensation_is_surfaced_and_stays_pending() {
    let (service, _clock) = manual_service();
    let session = service.open(failover(7_500), Duration::from_secs(60)).await.unwrap();
    service.commit(session.id, None).await.unwrap();

    let compensator = FixedCompensator(Err(PortError::unavailable("ledger", "down")));
    let err = service
        .request_compensation(session.id, "op-anna", RATIONALE, &compensator)
        .await
        .unwrap_err();
    assert!(err.requires_human());

    let stored = service.get_status(session.id).await.unwrap();
    assert_eq!(stored.status, VetoStatus::Vetoed);
    assert!(stored.compensation_pending);
    let trail = service.audit_trail(session.id).await.unwrap();
    assert_eq!(trail.last().unwrap().event, AuditEventType::CompensationFailed);
}

#[tokio::test]
async fn compensation_requires_committed() {
    let (service, _clock) = manual_service();
    let session = service.open(failover(7_500), Duration::from_secs(60)).await.unwrap();
    let compensator = FixedCompensator(Ok(LedgerHash::new("0x2")));
    let err = service
        .request_compensation(session.id, "op-anna", RATIONALE, &compensator)
        .await
        .unwrap_err();
    assert!(matches!(err, VetoError::NotAllowed { status: VetoStatus::Reserved, .. }));
}

#[tokio::test]
async fn wait_for_resolution_sees_veto() {
    let (service, _clock) = manual_service();
    let session = service.open(failover(7_500), Duration::from_secs(60)).await.unwrap();

    let waiter = {
        let service = service.clone();
        tokio::spawn(async move { service.wait_for_resolution(session.id).await })
    };
    tokio::task::yield_now().await;
    service.veto(session.id, "op-anna", RATIONALE).await.unwrap();

    let resolved = waiter.await.unwrap().unwrap();
    assert_eq!(resolved.status, VetoStatus::Vetoed);
}

#[tokio::test]
async fn opening_notifies_and_notifier_failure_is_not_fatal() {
    let notifier = Arc::new(RecordingNotifier::default());
    let service = VetoService::builder(Arc::new(InMemoryVetoRepository::new()))
        .notifier(notifier.clone())
        .build();
    service.open(failover(7_500), Duration::from_secs(60)).await.unwrap();
    let sent = notifier.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "veto");
    assert!(sent[0].1.contains("SHP-1001"));

    let flaky = VetoService::builder(Arc::new(InMemoryVetoRepository::new()))
        .notifier(Arc::new(DownNotifier))
        .build();
    assert!(flaky.open(failover(7_500), Duration::from_secs(60)).await.is_ok());
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let (service, _clock) = manual_service();
    let err = service
        .veto(SessionId::new(), "op-anna", RATIONALE)
        .await
        .unwrap_err();
    assert!(matches!(err, VetoError::SessionNotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn recover_rearms_reserved_sessions() {
    let repo = Arc::new(InMemoryVetoRepository::new());
    let clock = Arc::new(TokioClock::new());
    let first = VetoService::builder(repo.clone()).clock(clock.clone()).build();
    let session = first.open(failover(7_500), Duration::from_secs(30)).await.unwrap();
    first.shutdown();
    drop(first);

    let second = VetoService::builder(repo).clock(clock).build();
    assert_eq!(second.recover().await.unwrap(), 1);
    let resolved = second.wait_for_resolution(session.id).await.unwrap();
    assert_eq!(resolved.status, VetoStatus::Expired);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recover_expires_elapsed_windows_on_a_multi_thread_runtime() {
    let repo = Arc::new(InMemoryVetoRepository::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 3, 4, 10, 0, 0).unwrap(),
    ));
    let first = VetoService::builder(repo.clone()).clock(clock.clone()).build();
    let mut ids = Vec::new();
    for _ in 0..200 {
        ids.push(first.open(failover(7_500), Duration::from_secs(1)).await.unwrap().id);
    }
    first.shutdown();
    drop(first);

    clock.advance(Duration::from_secs(30));
    let second = VetoService::builder(repo).clock(clock).build();
    assert_eq!(second.recover().await.unwrap(), 200);
    for id in ids {
        let resolved = tokio::time::timeout(Duration::from_secs(5), second.wait_for_resolution(id))
            .await
            .expect("elapsed window expires")
            .unwrap();
        assert_eq!(resolved.status, VetoStatus::Expired);
    }
    assert!(second.list_active().await.unwrap().is_empty());
    assert_eq!(second.live_timers(), 0);
}

#[tokio::test]
async fn failed_commit_write_leaves_the_session_committable() {
    let repo = Arc::new(CommitFailingRepo::default());
    let service = VetoService::new(repo.clone());
    let session = service.open(failover(7_500), Duration::from_secs(60)).await.unwrap();

    repo.fail.store(true, Ordering::SeqCst);
    let err = service.commit(session.id, Some(LedgerHash::new("0xabc"))).await.unwrap_err();
    assert!(matches!(err, VetoError::Repository(_)));
    let stored = service.get_status(session.id).await.unwrap();
    assert_eq!(stored.status, VetoStatus::Reserved);
    assert_eq!(service.list_active().await.unwrap().len(), 1);

    repo.fail.store(false, Ordering::SeqCst);
    let committed = service.commit(session.id, Some(LedgerHash::new("0xabc"))).await.unwrap();
    assert_eq!(committed.status, VetoStatus::Committed);
    let resolved = service.wait_for_resolution(session.id).await.unwrap();
    assert_eq!(resolved.status, VetoStatus::Committed);
}

#[tokio::test]
async fn resolved_sessions_release_their_bookkeeping() {
    let (service, _clock) = manual_service();
    for n in 0..50 {
        let session = service.open(failover(7_500), Duration::from_secs(60)).await.unwrap();
        if n % 2 == 0 {
            service.commit(session.id, None).await.unwrap();
        } else {
            service.veto(session.id, "op-anna", RATIONALE).await.unwrap();
        }
    }
    assert_eq!(service.tracked_sessions(), 0);

    let open = service.open(failover(7_500), Duration::from_secs(60)).await.unwrap();
    assert_eq!(service.tracked_sessions(), 1);
    service.cancel(open.id, "op-anna", "duplicate proposal").await.unwrap();
    assert_eq!(service.tracked_sessions(), 0);
}
