//! Custos Policy
//!
//! Decides how much human supervision an agent action needs.
//!
//! - [`GovernanceConfig`]: versioned thresholds, calendar and fast-track rules
//! - [`PolicyStore`]: TTL-cached, reloadable policy with last-known-good fallback
//! - [`GovernanceEngine`]: maps amount, confidence and time to a [`DecisionMode`]
//!
//! # Example
//!
//! ```rust,ignore
//! use custos_policy::prelude::*;
//!
//! let engine = GovernanceEngine::new(Arc::new(PolicyStore::fixed(GovernanceConfig::default())));
//! let decision = engine.evaluate(AgentKind::Paolo, Money::from_euros(7_500), None, Utc::now()).await;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod calendar;
pub mod config;
pub mod engine;
pub mod error;
pub mod store;

pub use calendar::CalendarVerdict;
pub use config::{AgentThresholds, CalendarRules, FastTrack, GovernanceConfig};
pub use engine::{Decision, DecisionMode, DecisionReason, GovernanceEngine};
pub use error::{PolicyError, Result};
pub use store::{FilePolicySource, PolicySource, PolicyStore, StaticPolicySource, DEFAULT_POLICY_TTL};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Custos Policy
    pub use crate::{
        Decision, DecisionMode, DecisionReason, GovernanceConfig, GovernanceEngine, PolicyStore,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
