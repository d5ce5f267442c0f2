//! Error types for Custos Core
//!
//! Provides:
//! - [`ErrorKind`], the cross-crate taxonomy every Custos error maps onto
//! - [`PortError`], returned by collaborator ports (ledger, probes, notifier)
//! - [`CoreError`], for parsing, configuration and telemetry failures

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cross-crate error taxonomy
///
/// Callers branch on the kind rather than on concrete error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Wrong state for the requested transition
    VetoNotAllowed,
    /// Veto arrived after the window closed
    VetoWindowExpired,
    /// Ledger step failed after the local write; local change compensated
    SagaRollback,
    /// Dependency isolated by its circuit breaker
    CircuitOpen,
    /// Designed outcome forcing human resolution
    LowConfidenceEscalation,
    /// Input failed validation (short rationale, empty operator, bad amount)
    InvalidInput,
    /// Referenced record does not exist
    NotFound,
    /// Compensation callback failed
    CompensationFailed,
    /// Persistence or store failure
    Storage,
    /// External collaborator failure
    External,
    /// Configuration or policy failure
    Configuration,
}

impl ErrorKind {
    /// Stable tag for logs and CLI output
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VetoNotAllowed => "veto_not_allowed",
            Self::VetoWindowExpired => "veto_window_expired",
            Self::SagaRollback => "saga_rollback",
            Self::CircuitOpen => "circuit_open",
            Self::LowConfidenceEscalation => "low_confidence_escalation",
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::CompensationFailed => "compensation_failed",
            Self::Storage => "storage",
            Self::External => "external",
            Self::Configuration => "configuration",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a collaborator port
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    /// Collaborator could not be reached
    #[error("{service} unavailable: {reason}")]
    Unavailable { service: String, reason: String },

    /// Collaborator refused the request
    #[error("{service} rejected the request: {reason}")]
    Rejected { service: String, reason: String },

    /// Collaborator did not answer in time
    #[error("{service} timed out")]
    Timeout { service: String },

    /// Collaborator answered with something unusable
    #[error("invalid response from {service}: {reason}")]
    InvalidResponse { service: String, reason: String },
}

impl PortError {
    /// Create unavailable error
    #[inline]
    pub fn unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Create rejected error
    #[inline]
    pub fn rejected(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Create invalid response error
    #[inline]
    pub fn invalid(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Check if error is retryable
    ///
    /// Only transport-level failures are retried; an explicit rejection stands.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

/// Core errors (parsing, configuration, telemetry)
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Unparseable amount
    #[error(transparent)]
    InvalidAmount(#[from] crate::types::MoneyParseError),

    /// Unknown enum tag
    #[error("unknown {kind} tag: '{value}'")]
    UnknownTag { kind: &'static str, value: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Tracing subscriber could not be installed
    #[error("telemetry error: {0}")]
    Telemetry(String),
}

impl CoreError {
    /// Taxonomy kind
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAmount(_) | Self::UnknownTag { .. } => ErrorKind::InvalidInput,
            Self::Config(_) | Self::Telemetry(_) => ErrorKind::Configuration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_error_display() {
        let err = PortError::unavailable("ledger", "connection refused");
        assert_eq!(err.to_string(), "ledger unavailable: connection refused");
    }

    #[test]
    fn port_error_is_retryable() {
        assert!(PortError::unavailable("ledger", "down").is_retryable());
        assert!(PortError::Timeout { service: "health".into() }.is_retryable());
        assert!(!PortError::rejected("ledger", "duplicate").is_retryable());
        assert!(!PortError::invalid("scorer", "NaN").is_retryable());
    }

    #[test]
    fn core_error_kinds() {
        let err = CoreError::UnknownTag {
            kind: "agent",
            value: "marco".into(),
        };
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(CoreError::Config("x".into()).kind(), ErrorKind::Configuration);
        assert_eq!(ErrorKind::VetoWindowExpired.to_string(), "veto_window_expired");
    }
}
