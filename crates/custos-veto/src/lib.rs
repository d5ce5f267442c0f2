//! Custos Veto
//!
//! Time-boxed soft locks on proposed actions. A session opens `Reserved`,
//! a human may veto it until the deadline, a timer expires it afterwards,
//! and the executing agent commits it with the ledger reference.
//!
//! - [`VetoService`]: the state machine, timers and audit trail
//! - [`VetoRepository`]: persistence, in memory or on SQLite
//! - [`state`]: the explicit transition table

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod audit;
pub mod error;
pub mod repository;
pub mod service;
pub mod session;
pub mod sqlite;
pub mod state;
pub mod timer;

pub use audit::{AuditEventType, DecisionAudit, TIMER_ACTOR};
pub use error::{Result, VetoError};
pub use repository::{InMemoryVetoRepository, VetoRepository};
pub use service::{Compensator, VetoConfig, VetoService, VetoServiceBuilder};
pub use session::{OpenParams, VetoSession, VetoStatus};
pub use sqlite::SqliteVetoRepository;
pub use state::{allowed_transitions, validate_transition};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Custos Veto
    pub use crate::{
        Compensator, OpenParams, VetoError, VetoRepository, VetoService, VetoSession, VetoStatus,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
