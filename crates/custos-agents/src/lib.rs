//! Custos Agents
//!
//! The two autonomous agents and the machinery that runs them:
//! - [`FailoverAgent`] (PAOLO): moves shipments off failing carriers
//! - [`DisputeAgent`] (GIULIA): rules on disputes from scored evidence
//! - [`SagaExecutor`]: local write then ledger submit, compensated on failure
//! - [`GovernedRunner`]: routes every proposal through policy and veto windows
//! - [`ShipmentStore`]: port to the business records the agents change
//!
//! # Example
//!
//! ```rust,ignore
//! use custos_agents::prelude::*;
//!
//! let outcome = runner.run(&paolo, &AgentContext::shipment("SHP-1", "missed pickups")).await?;
//! println!("{}", outcome.label());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod agent;
pub mod dispute;
pub mod error;
pub mod evidence;
pub mod failover;
pub mod pipeline;
pub mod risk;
pub mod saga;
pub mod store;

pub use agent::{
    Agent, AgentContext, DisputeOutcome, Escalation, EscalationReason, Outcome, Proposal,
    ProposedAction,
};
pub use dispute::{classify as classify_dispute, dispute_key, DisputeAgent, DisputeConfig, Resolution};
pub use error::{AgentError, Result, StoreError};
pub use evidence::{EvidenceGatherer, EvidenceScores, EvidenceSource};
pub use failover::{failover_key, FailoverAgent, FailoverConfig, FailoverResult};
pub use pipeline::{GovernedRunner, RunOutcome, ESCALATION_CHANNEL};
pub use risk::{classify as classify_risk, CarrierRisk, RiskLevel, RiskScanner, ScanReport, RISK_CUT_POINTS};
pub use saga::{CompensatingAction, CompensationRecord, SagaExecutor, SagaOutcome, SagaStep};
pub use store::{
    CarrierChange, CarrierRecord, DisputeRecord, DisputeStatus, InMemoryShipmentStore, Ruling,
    ShipmentRecord, ShipmentStatus, ShipmentStore,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Custos Agents
    pub use crate::{
        Agent, AgentContext, AgentError, DisputeAgent, DisputeOutcome, FailoverAgent,
        GovernedRunner, Proposal, RunOutcome, SagaExecutor, ShipmentStore,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
