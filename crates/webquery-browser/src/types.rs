//! Browser session and fetch types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Pool-local session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Health of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionHealth {
    Idle,
    Leased,
    Unhealthy,
}

/// Handle to a live automation context on the browser capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserHandle {
    /// Identifier assigned by the capability.
    pub remote_id: String,
}

/// Outcome of a navigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Navigation {
    pub page_id: String,
    /// Final URL after redirects.
    pub url: String,
}

/// What to pull out of a page once it has loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExtractMode {
    /// Visible text of the document body.
    Text,
    /// Raw HTML.
    Html,
    /// Result of evaluating a script in the page.
    Script { script: String },
    /// Visible text lines containing a keyword.
    Search { keyword: String },
    /// Capture of the rendered page. Content is a short description of the
    /// image, not the image data.
    Screenshot,
}

impl ExtractMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Html => "html",
            Self::Script { .. } => "script",
            Self::Search { .. } => "search",
            Self::Screenshot => "screenshot",
        }
    }
}

/// One page retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSpec {
    pub url: String,
    pub extract: ExtractMode,
}

impl FetchSpec {
    /// Fetch the visible text of a page.
    pub fn text(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            extract: ExtractMode::Text,
        }
    }

    /// Fetch the result page of a search engine for `query`. The template's
    /// `{query}` placeholder receives the form-encoded query.
    pub fn search(template: &str, query: &str) -> Self {
        let encoded: String = url::form_urlencoded::byte_serialize(query.trim().as_bytes()).collect();
        Self::text(template.replace("{query}", &encoded))
    }

    /// Canonical form of the URL: lowercase scheme and host, no fragment.
    /// Unparsable URLs are returned trimmed.
    pub fn normalized_url(&self) -> String {
        match Url::parse(self.url.trim()) {
            Ok(mut url) => {
                url.set_fragment(None);
                url.to_string()
            }
            Err(_) => self.url.trim().to_string(),
        }
    }

    /// Normalized input used to fingerprint this fetch.
    pub fn cache_key(&self) -> String {
        let detail = match &self.extract {
            ExtractMode::Text | ExtractMode::Html | ExtractMode::Screenshot => String::new(),
            ExtractMode::Script { script } => script.trim().to_string(),
            ExtractMode::Search { keyword } => keyword.trim().to_lowercase(),
        };
        format!("{}|{}|{}", self.extract.label(), self.normalized_url(), detail)
    }
}

/// Normalized fetch output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResult {
    /// URL the page settled on.
    pub url: String,
    #[serde(rename = "pageId")]
    pub page_id: String,
    pub content: String,
    /// Whether `content` was cut to the configured maximum.
    pub truncated: bool,
    #[serde(rename = "elapsedMs")]
    pub elapsed_ms: u64,
}

/// Point-in-time view of one pooled session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub health: SessionHealth,
    #[serde(rename = "lastUsed")]
    pub last_used: DateTime<Utc>,
    pub leases: u64,
}

/// Point-in-time pool snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub leased: usize,
    pub unhealthy: usize,
    pub empty: usize,
    pub sessions: Vec<SessionInfo>,
}
