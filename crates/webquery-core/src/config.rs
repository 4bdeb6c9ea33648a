//! Configuration and data directory management.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_SEARCH_URL_TEMPLATE: &str = "https://duckduckgo.com/html/?q={query}";

/// Knobs for the orchestration core. Durations are kept in milliseconds so
/// the struct round-trips through JSON and env vars unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Maximum number of live browser sessions.
    pub session_pool_size: usize,
    /// Idle sessions older than this are retired.
    pub session_idle_ttl_ms: u64,
    /// Maximum number of in-flight model calls, process-wide.
    pub model_concurrency_limit: usize,
    /// Upper bound for one fetch or one model call.
    pub per_call_timeout_ms: u64,
    /// Overall budget for a single plan.
    pub plan_deadline_ms: u64,
    /// Time-to-live of cached step outputs.
    pub cache_ttl_ms: u64,
    /// Fetch step retries on a fresh session.
    pub retry_limit: u32,
    /// Retries the model dispatcher performs on transient failures.
    pub model_retry_limit: u32,
    /// Bounded wait for a session lease.
    pub acquire_timeout_ms: u64,
    /// Time cancelled steps get to exit before being aborted.
    pub reclaim_grace_ms: u64,
    pub cache_max_entries: usize,
    /// Extracted page content is truncated to this many characters.
    pub max_content_chars: usize,
    pub max_query_chars: usize,
    pub max_sub_questions: usize,
    /// Search URL used when a query names no page; `{query}` is replaced by
    /// the encoded sub-question.
    pub search_url_template: String,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            session_pool_size: 4,
            session_idle_ttl_ms: 300_000,
            model_concurrency_limit: 4,
            per_call_timeout_ms: 30_000,
            plan_deadline_ms: 120_000,
            cache_ttl_ms: 600_000,
            retry_limit: 2,
            model_retry_limit: 2,
            acquire_timeout_ms: 10_000,
            reclaim_grace_ms: 2_000,
            cache_max_entries: 1000,
            max_content_chars: 20_000,
            max_query_chars: 4_000,
            max_sub_questions: 4,
            search_url_template: DEFAULT_SEARCH_URL_TEMPLATE.into(),
        }
    }
}

impl OrchestrationConfig {
    /// Build from a key lookup, falling back to defaults for missing or
    /// unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            session_pool_size: parse_or(&lookup, "WEBQUERY_SESSION_POOL_SIZE", d.session_pool_size),
            session_idle_ttl_ms: parse_or(&lookup, "WEBQUERY_SESSION_IDLE_TTL_MS", d.session_idle_ttl_ms),
            model_concurrency_limit: parse_or(
                &lookup,
                "WEBQUERY_MODEL_CONCURRENCY_LIMIT",
                d.model_concurrency_limit,
            ),
            per_call_timeout_ms: parse_or(&lookup, "WEBQUERY_PER_CALL_TIMEOUT_MS", d.per_call_timeout_ms),
            plan_deadline_ms: parse_or(&lookup, "WEBQUERY_PLAN_DEADLINE_MS", d.plan_deadline_ms),
            cache_ttl_ms: parse_or(&lookup, "WEBQUERY_CACHE_TTL_MS", d.cache_ttl_ms),
            retry_limit: parse_or(&lookup, "WEBQUERY_RETRY_LIMIT", d.retry_limit),
            model_retry_limit: parse_or(&lookup, "WEBQUERY_MODEL_RETRY_LIMIT", d.model_retry_limit),
            acquire_timeout_ms: parse_or(&lookup, "WEBQUERY_ACQUIRE_TIMEOUT_MS", d.acquire_timeout_ms),
            reclaim_grace_ms: parse_or(&lookup, "WEBQUERY_RECLAIM_GRACE_MS", d.reclaim_grace_ms),
            cache_max_entries: parse_or(&lookup, "WEBQUERY_CACHE_MAX_ENTRIES", d.cache_max_entries),
            max_content_chars: parse_or(&lookup, "WEBQUERY_MAX_CONTENT_CHARS", d.max_content_chars),
            max_query_chars: parse_or(&lookup, "WEBQUERY_MAX_QUERY_CHARS", d.max_query_chars),
            max_sub_questions: parse_or(&lookup, "WEBQUERY_MAX_SUB_QUESTIONS", d.max_sub_questions),
            search_url_template: lookup("WEBQUERY_SEARCH_URL_TEMPLATE")
                .unwrap_or(d.search_url_template),
        }
    }

    /// Reject settings that would make the pool, dispatcher or scheduler
    /// unable to make progress.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("session_pool_size", self.session_pool_size as u64),
            ("model_concurrency_limit", self.model_concurrency_limit as u64),
            ("per_call_timeout_ms", self.per_call_timeout_ms),
            ("plan_deadline_ms", self.plan_deadline_ms),
            ("acquire_timeout_ms", self.acquire_timeout_ms),
            ("cache_max_entries", self.cache_max_entries as u64),
            ("max_query_chars", self.max_query_chars as u64),
            ("max_sub_questions", self.max_sub_questions as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        if !self.search_url_template.contains("{query}") {
            return Err(Error::Config(
                "search_url_template must contain a {query} placeholder".into(),
            ));
        }
        Ok(())
    }

    pub fn session_idle_ttl(&self) -> Duration {
        Duration::from_millis(self.session_idle_ttl_ms)
    }

    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_millis(self.per_call_timeout_ms)
    }

    pub fn plan_deadline(&self) -> Duration {
        Duration::from_millis(self.plan_deadline_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn reclaim_grace(&self) -> Duration {
        Duration::from_millis(self.reclaim_grace_ms)
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Top-level WebQuery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebQueryConfig {
    /// HTTP server port.
    pub port: u16,
    /// Base URL of the browser infrastructure service.
    pub infrastructure_url: String,
    /// Root data directory (LLM config lives here).
    pub data_dir: PathBuf,
    pub orchestration: OrchestrationConfig,
}

impl WebQueryConfig {
    /// Create configuration from environment and defaults.
    pub fn from_env(data_dir: impl AsRef<Path>) -> Result<Self> {
        Self::from_lookup(data_dir, |key| std::env::var(key).ok())
    }

    pub fn from_lookup(
        data_dir: impl AsRef<Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let port = parse_or(&lookup, "PORT", 3004u16);
        let infrastructure_url = lookup("WEBQUERY_INFRASTRUCTURE_URL")
            .unwrap_or_else(|| "http://localhost:8080".into());

        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let orchestration = OrchestrationConfig::from_lookup(&lookup);
        orchestration.validate()?;

        Ok(Self {
            port,
            infrastructure_url,
            data_dir,
            orchestration,
        })
    }

    /// LLM configuration (`data/llm-config.json`).
    pub fn llm_config_file(&self) -> PathBuf {
        self.data_dir.join("llm-config.json")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestrationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.per_call_timeout(), Duration::from_secs(30));
        assert_eq!(config.retry_limit, 2);
    }

    #[test]
    fn test_lookup_overrides_and_ignores_garbage() {
        let config = OrchestrationConfig::from_lookup(lookup_from(&[
            ("WEBQUERY_SESSION_POOL_SIZE", "8"),
            ("WEBQUERY_PLAN_DEADLINE_MS", "5000"),
            ("WEBQUERY_RETRY_LIMIT", "not-a-number"),
        ]));
        assert_eq!(config.session_pool_size, 8);
        assert_eq!(config.plan_deadline(), Duration::from_secs(5));
        assert_eq!(config.retry_limit, 2);
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let config = OrchestrationConfig {
            session_pool_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_template_without_placeholder() {
        let config = OrchestrationConfig {
            search_url_template: "https://example.com/search".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_top_level_config() {
        let dir = std::env::temp_dir().join(format!("webquery-config-{}", uuid::Uuid::new_v4()));
        let config = WebQueryConfig::from_lookup(
            &dir,
            lookup_from(&[("PORT", "9100"), ("WEBQUERY_INFRASTRUCTURE_URL", "http://infra:8080")]),
        )
        .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.infrastructure_url, "http://infra:8080");
        assert_eq!(config.llm_config_file(), dir.join("llm-config.json"));
        assert!(dir.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
