//! Custos Swarm
//!
//! Process-level wiring around the agents:
//! - [`SwarmOrchestrator`]: consumes swarm events, tracks repeated failures
//!   and suspected fraud per counterparty, blacklists on threshold
//! - [`CostMeter`]: batches cost events into a [`CostSink`]
//! - [`CustosConfig`]: the whole process configuration
//! - [`Services`]: builds every service from config and collaborator ports
//! - [`sim`]: simulated collaborators behind `custos simulate`

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod cost;
pub mod error;
pub mod orchestrator;
pub mod patterns;
pub mod sim;

pub use bootstrap::{Ports, Services};
pub use config::{BreakersConfig, CustosConfig};
pub use cost::{CostConfig, CostMeter, CostSink, LoggingCostSink};
pub use error::{Result, SwarmError};
pub use orchestrator::{BlacklistReport, SwarmConfig, SwarmHandle, SwarmOrchestrator, SwarmStats};
pub use patterns::{Pattern, PatternTracker};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Custos Swarm
    pub use crate::{
        CostMeter, CustosConfig, Ports, Services, SwarmConfig, SwarmError, SwarmOrchestrator,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
