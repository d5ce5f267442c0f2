//! Decision audit trail
//!
//! Append-only; one row per lifecycle event.

use crate::session::{VetoSession, VetoStatus};
use chrono::{DateTime, Utc};
use custos_core::{LedgerHash, SessionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Actor recorded for timer-driven transitions
pub const TIMER_ACTOR: &str = "system:timer";

/// Lifecycle event recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Opened,
    Vetoed,
    Expired,
    Committed,
    Cancelled,
    CompensationRequested,
    CompensationCompleted,
    CompensationFailed,
}

impl AuditEventType {
    const ALL: [AuditEventType; 8] = [
        Self::Opened,
        Self::Vetoed,
        Self::Expired,
        Self::Committed,
        Self::Cancelled,
        Self::CompensationRequested,
        Self::CompensationCompleted,
        Self::CompensationFailed,
    ];

    /// Persistence tag
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Vetoed => "vetoed",
            Self::Expired => "expired",
            Self::Committed => "committed",
            Self::Cancelled => "cancelled",
            Self::CompensationRequested => "compensation_requested",
            Self::CompensationCompleted => "compensation_completed",
            Self::CompensationFailed => "compensation_failed",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventType {
    type Err = crate::error::VetoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| crate::error::VetoError::Repository(format!("unknown audit event '{s}'")))
    }
}

/// One audit row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionAudit {
    pub id: Uuid,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub event: AuditEventType,
    /// Operator id, or `ai:<agent>` / `system:timer`
    pub actor: String,
    pub operator_action: Option<String>,
    pub rationale: Option<String>,
    pub time_to_decision_ms: Option<i64>,
    /// Session status after the event
    pub final_state: VetoStatus,
    pub ledger_tx_hash: Option<LedgerHash>,
}

impl DecisionAudit {
    /// Row for `session` as it stands after the event
    #[must_use]
    pub fn record(
        session: &VetoSession,
        event: AuditEventType,
        actor: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session.id,
            timestamp: at,
            event,
            actor: actor.into(),
            operator_action: None,
            rationale: None,
            time_to_decision_ms: None,
            final_state: session.status,
            ledger_tx_hash: None,
        }
    }

    /// With operator action
    #[inline]
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.operator_action = Some(action.into());
        self
    }

    /// With rationale
    #[inline]
    #[must_use]
    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    /// With time from opening to decision
    #[inline]
    #[must_use]
    pub fn with_time_to_decision(mut self, ms: i64) -> Self {
        self.time_to_decision_ms = Some(ms);
        self
    }

    /// With ledger reference
    #[inline]
    #[must_use]
    pub fn with_ledger_hash(mut self, hash: Option<LedgerHash>) -> Self {
        self.ledger_tx_hash = hash;
        self
    }
}
