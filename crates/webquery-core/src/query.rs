//! Query records, created once at ingress and read-only afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of one incoming query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(pub String);

impl QueryId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user request as received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    id: QueryId,
    text: String,
    agent_id: Option<String>,
    session_name: Option<String>,
    received_at: DateTime<Utc>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: QueryId::new(),
            text: text.into(),
            agent_id: None,
            session_name: None,
            received_at: Utc::now(),
        }
    }

    /// Attach the calling agent's identity. Both values are echoed back in
    /// the query outcome; pooled browser sessions are shared across queries
    /// and are not named after either.
    pub fn with_agent(mut self, agent_id: Option<String>, session_name: Option<String>) -> Self {
        self.agent_id = agent_id;
        self.session_name = session_name;
        self
    }

    pub fn id(&self) -> &QueryId {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    pub fn session_name(&self) -> Option<&str> {
        self.session_name.as_deref()
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}
