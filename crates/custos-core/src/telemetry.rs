//! Tracing initialisation
//!
//! Filtering follows `RUST_LOG` when set, otherwise the configured default.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Filter used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json: false,
            default_filter: "info".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// With JSON output
    #[inline]
    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// With default filter
    #[inline]
    #[must_use]
    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }
}

/// Install the global tracing subscriber
///
/// # Errors
/// Returns `CoreError::Telemetry` if a subscriber is already installed
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), CoreError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let result = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
    };

    result.map_err(|e| CoreError::Telemetry(format!("failed to initialise tracing: {e}")))
}

/// Initialise tracing for tests; repeated calls are no-ops
pub fn init_test() {
    let _ = init_tracing(&TelemetryConfig::default().with_default_filter("debug"));
}
