//! Error types for the swarm layer and the binary's configuration

use custos_agents::{AgentError, StoreError};
use custos_core::{CoreError, ErrorKind};
use custos_policy::PolicyError;
use custos_veto::VetoError;
use std::path::PathBuf;

/// Swarm errors
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    /// Agent or saga failure
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// Veto service failure
    #[error(transparent)]
    Veto(#[from] VetoError),

    /// Policy failure
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Core failure (telemetry, tags)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Configuration file could not be read
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration is malformed or inconsistent
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Orchestrator loop is gone
    #[error("orchestrator stopped")]
    Stopped,
}

impl From<StoreError> for SwarmError {
    fn from(err: StoreError) -> Self {
        Self::Agent(AgentError::Store(err))
    }
}

impl SwarmError {
    /// Create config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Taxonomy kind
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Agent(err) => err.kind(),
            Self::Veto(err) => err.kind(),
            Self::Policy(err) => err.kind(),
            Self::Core(err) => err.kind(),
            Self::Io { .. } | Self::Config(_) => ErrorKind::Configuration,
            Self::Stopped => ErrorKind::External,
        }
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Agent(err) => err.is_retryable(),
            Self::Veto(err) => err.is_retryable(),
            _ => false,
        }
    }
}

/// Result type for swarm operations
pub type Result<T> = std::result::Result<T, SwarmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_keep_their_kind() {
        let err = SwarmError::from(StoreError::not_found("carrier", "BRT"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!err.is_retryable());
        assert_eq!(SwarmError::config("bad").kind(), ErrorKind::Configuration);
    }
}
