//! Custos Core
//!
//! Foundation shared by every Custos crate:
//! - Domain types (agent and operation kinds, fixed-point money, identifiers)
//! - Error taxonomy and collaborator error types
//! - The [`CircuitBreaker`] primitive that wraps every external call
//! - Collaborator ports (ledger, health probe, notifier, confidence scorer, cost)
//! - Swarm events and the sink agents publish them through
//! - Clocks, bounded retry and tracing initialisation
//!
//! # Example
//!
//! ```rust,ignore
//! use custos_core::prelude::*;
//!
//! # async fn example(ledger: std::sync::Arc<dyn LedgerClient>) -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::new("ledger", BreakerConfig::default());
//! let payload = LedgerPayload::new("failover:SHP-1:BRT", OperationKind::CarrierFailover, serde_json::json!({}));
//! let hash = breaker.call(ledger.submit(payload)).await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod breaker;
pub mod clock;
pub mod error;
pub mod events;
pub mod ports;
pub mod retry;
pub mod telemetry;
pub mod types;

pub use breaker::{BreakerConfig, BreakerMetrics, BreakerRegistry, CallError, CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, TokioClock};
pub use error::{CoreError, ErrorKind, PortError};
pub use events::{EventSink, NullSink, SwarmEvent, SwarmEventKind};
pub use ports::{
    ConfidenceScorer, CostEvent, CostKind, CostRecorder, EvidenceItem, EvidenceKind, HealthProbe,
    HealthReport, LedgerClient, LedgerPayload, NoopCostRecorder, Notifier,
};
pub use retry::{with_backoff, RetryPolicy};
pub use telemetry::{init_tracing, TelemetryConfig};
pub use types::{
    AgentKind, CarrierId, DisputeId, LedgerHash, Money, MoneyParseError, OperationKind, SessionId,
    ShipmentId,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Custos Core
    pub use crate::{
        AgentKind, BreakerConfig, CallError, CarrierId, CircuitBreaker, CircuitState, Clock,
        DisputeId, EventSink, LedgerClient, LedgerHash, LedgerPayload, Money, OperationKind,
        PortError, SessionId, ShipmentId, SwarmEvent, SwarmEventKind,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
