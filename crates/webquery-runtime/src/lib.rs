//! Query runtime: plans a query into a step DAG and executes it.
//!
//! The planner is pure; the orchestrator owns scheduling, retries of fetch
//! steps, failure propagation, deadlines and cancellation.

pub mod orchestrator;
pub mod planner;
pub mod prompt;
pub mod types;

pub use orchestrator::{EventSink, Orchestrator};
pub use planner::QueryPlanner;
pub use types::*;
