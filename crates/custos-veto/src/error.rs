//! Error types for veto windows

use crate::session::VetoStatus;
use chrono::{DateTime, Utc};
use custos_core::{ErrorKind, SessionId};
use std::time::Duration;

/// Veto service errors
#[derive(Debug, thiserror::Error)]
pub enum VetoError {
    /// Operation not permitted from the session's current status
    #[error("cannot {operation} session {id} in status {status}")]
    NotAllowed {
        id: SessionId,
        status: VetoStatus,
        operation: &'static str,
    },

    /// Transition missing from the table
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: VetoStatus, to: VetoStatus },

    /// Veto arrived after the window closed
    #[error("veto window for session {id} closed at {expires_at}")]
    WindowExpired {
        id: SessionId,
        expires_at: DateTime<Utc>,
    },

    /// Rationale shorter than required
    #[error("rationale must be at least {min} characters, got {actual}")]
    RationaleTooShort { min: usize, actual: usize },

    /// Operator id missing
    #[error("operator id must not be empty")]
    MissingOperator,

    /// Timeout is zero or too large
    #[error("invalid veto timeout {0:?}")]
    InvalidTimeout(Duration),

    /// No session with this id
    #[error("veto session {0} not found")]
    SessionNotFound(SessionId),

    /// Compare-and-set lost against a concurrent writer
    #[error("session {id} changed concurrently: expected {expected}, found {actual}")]
    Conflict {
        id: SessionId,
        expected: VetoStatus,
        actual: VetoStatus,
    },

    /// Compensation callback failed
    #[error("compensation for session {id} failed: {reason}")]
    CompensationFailed { id: SessionId, reason: String },

    /// Persistence failure
    #[error("veto repository error: {0}")]
    Repository(String),

    /// Service has shut down
    #[error("veto service is shut down")]
    ShutDown,
}

impl VetoError {
    /// Taxonomy kind
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotAllowed { .. } | Self::IllegalTransition { .. } | Self::Conflict { .. } => {
                ErrorKind::VetoNotAllowed
            }
            Self::WindowExpired { .. } => ErrorKind::VetoWindowExpired,
            Self::RationaleTooShort { .. } | Self::MissingOperator | Self::InvalidTimeout(_) => {
                ErrorKind::InvalidInput
            }
            Self::SessionNotFound(_) => ErrorKind::NotFound,
            Self::CompensationFailed { .. } => ErrorKind::CompensationFailed,
            Self::Repository(_) | Self::ShutDown => ErrorKind::Storage,
        }
    }

    /// Check if error is retryable
    ///
    /// State-machine violations are final; only storage failures may clear.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Repository(_))
    }

    /// Check if an operator must intervene
    #[inline]
    #[must_use]
    pub fn requires_human(&self) -> bool {
        matches!(self, Self::CompensationFailed { .. })
    }
}

impl From<rusqlite::Error> for VetoError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Repository(err.to_string())
    }
}

/// Result type for veto operations
pub type Result<T> = std::result::Result<T, VetoError>;
