//! Veto session persistence
//!
//! Updates are compare-and-set on the expected status so a stale writer can
//! never overwrite a resolved session.

use crate::audit::DecisionAudit;
use crate::error::{Result, VetoError};
use crate::session::{VetoSession, VetoStatus};
use async_trait::async_trait;
use custos_core::SessionId;
use dashmap::DashMap;
use parking_lot::Mutex;

/// Storage for sessions and their audit trail
#[async_trait]
pub trait VetoRepository: Send + Sync {
    /// Insert a new session
    async fn insert_session(&self, session: &VetoSession) -> Result<()>;

    /// Fetch a session
    async fn get_session(&self, id: SessionId) -> Result<Option<VetoSession>>;

    /// Replace a session if its stored status is still `expected`
    ///
    /// Fails with `VetoError::Conflict` otherwise.
    async fn update_session(&self, session: &VetoSession, expected: VetoStatus) -> Result<()>;

    /// Sessions in `status`, oldest first
    async fn list_by_status(&self, status: VetoStatus) -> Result<Vec<VetoSession>>;

    /// Append an audit row
    async fn append_audit(&self, entry: &DecisionAudit) -> Result<()>;

    /// Audit rows for a session, oldest first
    async fn audit_for(&self, id: SessionId) -> Result<Vec<DecisionAudit>>;
}

/// Process-local repository
#[derive(Debug, Default)]
pub struct InMemoryVetoRepository {
    sessions: DashMap<SessionId, VetoSession>,
    audit: Mutex<Vec<DecisionAudit>>,
}

impl InMemoryVetoRepository {
    /// Create new empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VetoRepository for InMemoryVetoRepository {
    async fn insert_session(&self, session: &VetoSession) -> Result<()> {
        if self.sessions.contains_key(&session.id) {
            return Err(VetoError::Repository(format!(
                "session {} already exists",
                session.id
            )));
        }
        self.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<VetoSession>> {
        Ok(self.sessions.get(&id).map(|entry| entry.value().clone()))
    }

    async fn update_session(&self, session: &VetoSession, expected: VetoStatus) -> Result<()> {
        let mut entry = self
            .sessions
            .get_mut(&session.id)
            .ok_or(VetoError::SessionNotFound(session.id))?;
        if entry.status != expected {
            return Err(VetoError::Conflict {
                id: session.id,
                expected,
                actual: entry.status,
            });
        }
        *entry = session.clone();
        Ok(())
    }

    async fn list_by_status(&self, status: VetoStatus) -> Result<Vec<VetoSession>> {
        let mut sessions: Vec<VetoSession> = self
            .sessions
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by_key(|s| s.opened_at);
        Ok(sessions)
    }

    async fn append_audit(&self, entry: &DecisionAudit) -> Result<()> {
        self.audit.lock().push(entry.clone());
        Ok(())
    }

    async fn audit_for(&self, id: SessionId) -> Result<Vec<DecisionAudit>> {
        Ok(self
            .audit
            .lock()
            .iter()
            .filter(|row| row.session_id == id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::OpenParams;
    use chrono::Utc;
    use custos_core::{AgentKind, Money, OperationKind};
    use std::time::Duration;

    fn session() -> VetoSession {
        VetoSession::open(
            OpenParams::new(AgentKind::Paolo, OperationKind::CarrierFailover, Money::from_euros(100)),
            Duration::from_secs(60),
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_status() {
        let repo = InMemoryVetoRepository::new();
        let mut s = session();
        repo.insert_session(&s).await.unwrap();

        s.status = VetoStatus::Expired;
        repo.update_session(&s, VetoStatus::Reserved).await.unwrap();

        s.status = VetoStatus::Vetoed;
        let err = repo.update_session(&s, VetoStatus::Reserved).await.unwrap_err();
        assert!(matches!(
            err,
            VetoError::Conflict { actual: VetoStatus::Expired, .. }
        ));
    }

    #[tokio::test]
    async fn duplicate_insert_fails() {
        let repo = InMemoryVetoRepository::new();
        let s = session();
        repo.insert_session(&s).await.unwrap();
        assert!(repo.insert_session(&s).await.is_err());
    }

    #[tokio::test]
    async fn lists_by_status() {
        let repo = InMemoryVetoRepository::new();
        let a = session();
        let mut b = session();
        b.status = VetoStatus::Cancelled;
        repo.insert_session(&a).await.unwrap();
        repo.insert_session(&b).await.unwrap();
        let reserved = repo.list_by_status(VetoStatus::Reserved).await.unwrap();
        assert_eq!(reserved.len(), 1);
        assert_eq!(reserved[0].id, a.id);
    }
}
