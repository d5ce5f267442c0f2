//! Error types for governance policy loading

use custos_core::ErrorKind;
use std::path::PathBuf;

/// Policy loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Policy file could not be read
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Policy document could not be parsed
    #[error("failed to parse {format} policy: {message}")]
    Parse { format: &'static str, message: String },

    /// File extension is neither YAML nor TOML
    #[error("unsupported policy format: '{0}'")]
    UnsupportedFormat(String),

    /// Thresholds are inconsistent
    #[error("invalid policy: {0}")]
    Invalid(String),

    /// Environment override could not be applied
    #[error("invalid override {key}='{value}': {reason}")]
    Override {
        key: String,
        value: String,
        reason: String,
    },

    /// Policy source failed
    #[error("policy source unavailable: {0}")]
    Source(String),
}

impl PolicyError {
    /// Create IO error for path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create override error
    pub fn override_error(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Override {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Taxonomy kind
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }

    /// Check if a later reload might succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Source(_))
    }
}

/// Result type for policy operations
pub type Result<T> = std::result::Result<T, PolicyError>;
