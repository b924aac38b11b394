//! Cadence Core - Entity Types
//!
//! Pure data structures shared by every Cadence crate: identifiers, enums,
//! tasks, agent records, derived reports, workflow state, errors,
//! configuration and health types. Behaviour is limited to validation and
//! state-transition tables.

mod agent;
pub mod config;
pub mod constants;
pub mod duration_ms;
mod enums;
mod error;
mod health;
mod identity;
mod report;
mod task;
mod workflow;

pub use agent::*;
pub use config::*;
pub use enums::*;
pub use error::*;
pub use health::*;
pub use identity::*;
pub use report::*;
pub use task::*;
pub use workflow::*;
