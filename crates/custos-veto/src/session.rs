//! Veto sessions
//!
//! One session per proposed supervised action. A session opens `Reserved`
//! with a deadline; it is resolved by a human veto, by timer expiry, by an
//! explicit commit, or by administrative cancellation.

use crate::error::VetoError;
use chrono::{DateTime, Utc};
use custos_core::{AgentKind, CarrierId, LedgerHash, Money, OperationKind, SessionId, ShipmentId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Lifecycle status of a veto session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VetoStatus {
    /// Window open, awaiting veto or expiry
    Reserved,
    /// Commit in progress
    Committing,
    /// Action executed and recorded
    Committed,
    /// Human vetoed (before or after commit)
    Vetoed,
    /// Window closed without a veto
    Expired,
    /// Administratively aborted
    Cancelled,
}

impl VetoStatus {
    /// Every status, in lifecycle order
    pub const ALL: [VetoStatus; 6] = [
        VetoStatus::Reserved,
        VetoStatus::Committing,
        VetoStatus::Committed,
        VetoStatus::Vetoed,
        VetoStatus::Expired,
        VetoStatus::Cancelled,
    ];

    /// Persistence tag
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Vetoed => "vetoed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    /// Check if the session still awaits an outcome
    #[inline]
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Reserved | Self::Committing)
    }
}

impl fmt::Display for VetoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VetoStatus {
    type Err = VetoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| VetoError::Repository(format!("unknown veto status '{s}'")))
    }
}

/// Parameters for opening a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenParams {
    /// Proposing agent
    pub agent: AgentKind,
    /// Proposed operation
    pub operation: OperationKind,
    /// Shipment concerned, if any
    pub shipment_ref: Option<ShipmentId>,
    /// Counterparty concerned, if any
    pub counterparty_ref: Option<CarrierId>,
    /// Amount at stake
    pub amount: Money,
    /// Agent confidence (0.0-1.0)
    pub confidence: Option<f64>,
    /// Decision provenance
    pub context: serde_json::Value,
}

impl OpenParams {
    /// Create new parameters
    #[inline]
    #[must_use]
    pub fn new(agent: AgentKind, operation: OperationKind, amount: Money) -> Self {
        Self {
            agent,
            operation,
            shipment_ref: None,
            counterparty_ref: None,
            amount,
            confidence: None,
            context: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// With shipment reference
    #[inline]
    #[must_use]
    pub fn with_shipment(mut self, shipment: ShipmentId) -> Self {
        self.shipment_ref = Some(shipment);
        self
    }

    /// With counterparty reference
    #[inline]
    #[must_use]
    pub fn with_counterparty(mut self, counterparty: CarrierId) -> Self {
        self.counterparty_ref = Some(counterparty);
        self
    }

    /// With confidence
    #[inline]
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// With provenance context
    #[inline]
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// A supervised action awaiting or past its veto window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VetoSession {
    /// Session identifier
    pub id: SessionId,
    /// Agent whose action is supervised
    pub agent: AgentKind,
    /// Operation under supervision
    pub operation: OperationKind,
    /// Affected shipment, if any
    pub shipment_ref: Option<ShipmentId>,
    /// Affected counterparty, if any
    pub counterparty_ref: Option<CarrierId>,
    /// Money at stake
    pub amount: Money,
    /// Agent confidence in `0.0..=1.0`
    pub confidence: Option<f64>,
    /// Lifecycle state
    pub status: VetoStatus,
    /// Window length; `expires_at == opened_at + timeout`
    pub timeout: Duration,
    /// When the window opened
    pub opened_at: DateTime<Utc>,
    /// When the window closes without a veto
    pub expires_at: DateTime<Utc>,
    /// Set once committed
    pub committed_at: Option<DateTime<Utc>>,
    /// Set iff vetoed
    pub vetoed_at: Option<DateTime<Utc>>,
    /// Set iff vetoed
    pub operator_id: Option<String>,
    /// Set iff vetoed
    pub rationale: Option<String>,
    /// Ledger transaction of the committed action
    pub ledger_tx_hash: Option<LedgerHash>,
    /// Ledger transaction that compensated a post-commit veto
    pub compensation_tx_hash: Option<LedgerHash>,
    /// Post-commit veto whose compensation has not completed
    pub compensation_pending: bool,
    /// Provenance shown to the operator
    pub context: serde_json::Value,
}

impl VetoSession {
    /// Create a `Reserved` session opened at `now`
    ///
    /// # Errors
    /// Returns `VetoError::InvalidTimeout` for a zero or unrepresentable timeout
    pub fn open(params: OpenParams, timeout: Duration, now: DateTime<Utc>) -> Result<Self, VetoError> {
        if timeout.is_zero() {
            return Err(VetoError::InvalidTimeout(timeout));
        }
        let window = chrono::Duration::from_std(timeout).map_err(|_| VetoError::InvalidTimeout(timeout))?;
        let expires_at = now
            .checked_add_signed(window)
            .ok_or(VetoError::InvalidTimeout(timeout))?;
        Ok(Self {
            id: SessionId::new(),
            agent: params.agent,
            operation: params.operation,
            shipment_ref: params.shipment_ref,
            counterparty_ref: params.counterparty_ref,
            amount: params.amount,
            confidence: params.confidence,
            status: VetoStatus::Reserved,
            timeout,
            opened_at: now,
            expires_at,
            committed_at: None,
            vetoed_at: None,
            operator_id: None,
            rationale: None,
            ledger_tx_hash: None,
            compensation_tx_hash: None,
            compensation_pending: false,
            context: params.context,
        })
    }

    /// Check if `now` is still inside the window
    #[inline]
    #[must_use]
    pub fn window_open_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Time left in the window at `now`
    #[must_use]
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Milliseconds from opening to `at`
    #[inline]
    #[must_use]
    pub fn elapsed_ms(&self, at: DateTime<Utc>) -> i64 {
        (at - self.opened_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn open_sets_deadline() {
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 10, 0, 0).unwrap();
        let session = VetoSession::open(
            OpenParams::new(AgentKind::Paolo, OperationKind::CarrierFailover, Money::from_euros(7_500)),
            Duration::from_secs(60),
            now,
        )
        .unwrap();
        assert_eq!(session.status, VetoStatus::Reserved);
        assert_eq!(session.expires_at, now + chrono::Duration::seconds(60));
        assert!(session.window_open_at(now + chrono::Duration::milliseconds(59_999)));
        assert!(!session.window_open_at(session.expires_at));
        assert_eq!(session.remaining_at(now + chrono::Duration::seconds(45)), Duration::from_secs(15));
        assert!(session.operator_id.is_none() && session.rationale.is_none());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let result = VetoSession::open(
            OpenParams::new(AgentKind::Giulia, OperationKind::DisputeResolution, Money::ZERO),
            Duration::ZERO,
            Utc::now(),
        );
        assert!(matches!(result, Err(VetoError::InvalidTimeout(_))));
    }

    #[test]
    fn status_tags_round_trip() {
        for status in VetoStatus::ALL {
            assert_eq!(status.as_str().parse::<VetoStatus>().unwrap(), status);
        }
    }
}
