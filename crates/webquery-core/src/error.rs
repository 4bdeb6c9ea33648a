//! Error types for WebQuery.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No browser session available: {0}")]
    PoolExhausted(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Browser automation failure: {0}")]
    AutomationFailure(String),

    #[error("Transient model failure: {0}")]
    ModelTransientFailure(String),

    #[error("Permanent model failure: {0}")]
    ModelPermanentFailure(String),

    #[error("Query cannot be planned: {0}")]
    UnplannableQuery(String),

    #[error("Plan exceeded its deadline")]
    PlanTimeout,

    /// Planner emitted a malformed graph. Never user-facing.
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Serializable error class, carried in step results and API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PoolExhausted,
    Timeout,
    AutomationFailure,
    ModelTransientFailure,
    ModelPermanentFailure,
    UnplannableQuery,
    PlanTimeout,
    InvalidPlan,
    Cancelled,
    Io,
    Json,
    Config,
    Http,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolExhausted(_) => ErrorKind::PoolExhausted,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::AutomationFailure(_) => ErrorKind::AutomationFailure,
            Self::ModelTransientFailure(_) => ErrorKind::ModelTransientFailure,
            Self::ModelPermanentFailure(_) => ErrorKind::ModelPermanentFailure,
            Self::UnplannableQuery(_) => ErrorKind::UnplannableQuery,
            Self::PlanTimeout => ErrorKind::PlanTimeout,
            Self::InvalidPlan(_) => ErrorKind::InvalidPlan,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Json,
            Self::Config(_) => ErrorKind::Config,
            Self::Http(_) => ErrorKind::Http,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a fetch step that failed with this error may be retried on a
    /// fresh session.
    pub fn is_retryable_fetch(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted(_) | Self::Timeout(_) | Self::AutomationFailure(_)
        )
    }

    /// Whether a model backend failure should be retried by the dispatcher.
    pub fn is_transient_model(&self) -> bool {
        matches!(self, Self::ModelTransientFailure(_) | Self::Timeout(_))
    }
}

/// Failure recorded in a step's result slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&Error> for StepFailure {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<Error> for StepFailure {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}
