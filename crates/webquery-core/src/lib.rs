//! WebQuery Core: error taxonomy, configuration, query records.

pub mod config;
pub mod error;
pub mod query;

pub use config::{OrchestrationConfig, WebQueryConfig};
pub use error::{Error, ErrorKind, Result, StepFailure};
pub use query::{Query, QueryId};
