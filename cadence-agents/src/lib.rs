//! Cadence Agents - Agent State and Coordination
//!
//! - `AgentStateStore`: current liveness/progress per agent plus a capped
//!   progress history
//! - `ProgressAggregator`: summaries and trend analysis over the task graph
//!   and the agent store
//! - `Coordinator`: all-or-nothing resource holds for task execution

mod coordinator;
mod progress;
mod state;

pub use coordinator::{Coordinator, ResourceGrant, ResourceHolder};
pub use progress::ProgressAggregator;
pub use state::AgentStateStore;
