//! Error types for agents and their execution pipeline

use custos_core::{ErrorKind, PortError};
use custos_veto::VetoError;

/// Business-record store failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Record does not exist
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Optimistic version check lost
    #[error("{kind} {id} changed concurrently: expected version {expected}, found {actual}")]
    VersionConflict {
        kind: &'static str,
        id: String,
        expected: u64,
        actual: u64,
    },

    /// Backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Create not-found error
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Agent errors
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Veto session failure
    #[error(transparent)]
    Veto(#[from] VetoError),

    /// Collaborator failure that could not be turned into an outcome
    #[error(transparent)]
    Port(#[from] PortError),

    /// Proposal carries no executable action
    #[error("proposal {business_key} is not executable: {reason}")]
    NotExecutable {
        business_key: String,
        reason: String,
    },

    /// Proposal was built by another agent
    #[error("proposal for {expected} handed to {actual}")]
    WrongAgent {
        expected: &'static str,
        actual: &'static str,
    },

    /// Context does not apply to this agent
    #[error("unsupported context for {agent}: {detail}")]
    UnsupportedContext { agent: &'static str, detail: String },

    /// Record moved since the proposal was built
    #[error("stale proposal {business_key}: {detail}")]
    Stale {
        business_key: String,
        detail: String,
    },
}

impl AgentError {
    /// Taxonomy kind
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(StoreError::NotFound { .. }) => ErrorKind::NotFound,
            Self::Store(_) => ErrorKind::Storage,
            Self::Veto(err) => err.kind(),
            Self::Port(_) => ErrorKind::External,
            Self::NotExecutable { .. }
            | Self::WrongAgent { .. }
            | Self::UnsupportedContext { .. }
            | Self::Stale { .. } => ErrorKind::InvalidInput,
        }
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(StoreError::Backend(_) | StoreError::VersionConflict { .. }) => true,
            Self::Veto(err) => err.is_retryable(),
            Self::Port(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Check if an operator must intervene
    #[inline]
    #[must_use]
    pub fn requires_human(&self) -> bool {
        match self {
            Self::Veto(err) => err.requires_human(),
            Self::Stale { .. } => true,
            _ => false,
        }
    }
}

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;
