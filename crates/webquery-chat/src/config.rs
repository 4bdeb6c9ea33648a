//! LLM configuration persistence and backend selection.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use webquery_core::Result;

use crate::backend::ModelBackend;
use crate::providers::{HttpModelBackend, DEFAULT_OLLAMA_URL};
use crate::types::{LLMConfigResponse, LLMProvider};

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_GROQ_MODEL: &str = "llama-3.3-70b-versatile";
pub const DEFAULT_OLLAMA_MODEL: &str = "qwen2.5";

/// Stored LLM configuration (persisted to llm-config.json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// `"auto"` or a provider name.
    #[serde(default = "default_preferred")]
    pub preferred_provider: String,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub groq_api_key: Option<String>,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default = "default_anthropic_model")]
    pub anthropic_model: String,
    #[serde(default = "default_groq_model")]
    pub groq_model: String,
    #[serde(default = "default_ollama_model")]
    pub ollama_model: String,
    #[serde(default = "default_ollama_url")]
    pub ollama_base_url: String,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_preferred() -> String {
    "ollama".into()
}
fn default_openai_model() -> String {
    DEFAULT_OPENAI_MODEL.into()
}
fn default_anthropic_model() -> String {
    DEFAULT_ANTHROPIC_MODEL.into()
}
fn default_groq_model() -> String {
    DEFAULT_GROQ_MODEL.into()
}
fn default_ollama_model() -> String {
    DEFAULT_OLLAMA_MODEL.into()
}
fn default_ollama_url() -> String {
    DEFAULT_OLLAMA_URL.into()
}
fn default_max_tokens() -> usize {
    1024
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            preferred_provider: default_preferred(),
            openai_api_key: None,
            anthropic_api_key: None,
            groq_api_key: None,
            openai_model: default_openai_model(),
            anthropic_model: default_anthropic_model(),
            groq_model: default_groq_model(),
            ollama_model: default_ollama_model(),
            ollama_base_url: default_ollama_url(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            config_path: PathBuf::new(),
        }
    }
}

/// A backend ready to be built: provider, model, credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSpec {
    pub provider: LLMProvider,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl LLMConfig {
    /// Load config from file, falling back to env vars and defaults.
    pub fn load(config_path: &Path) -> Self {
        Self::load_with(config_path, |key| std::env::var(key).ok())
    }

    /// Same as [`LLMConfig::load`] with an explicit env lookup.
    pub fn load_with(config_path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let from_file: Option<LLMConfig> = match std::fs::read_to_string(config_path) {
            Ok(s) => match serde_json::from_str(&s) {
                Ok(cfg) => Some(cfg),
                Err(e) => {
                    warn!("Ignoring malformed {}: {}", config_path.display(), e);
                    None
                }
            },
            Err(_) => None,
        };
        let has_file = from_file.is_some();
        let mut config = from_file.unwrap_or_default();
        config.config_path = config_path.to_path_buf();

        // Deployment env applies only when nothing was saved.
        if !has_file {
            if let Some(p) = lookup("WEBQUERY_LLM_PROVIDER") {
                config.preferred_provider = p.trim().to_lowercase();
            }
            if let Some(m) = lookup("WEBQUERY_LLM_MODEL") {
                config.set_model_for_preferred(m);
            }
            if let Some(url) = lookup("WEBQUERY_LLM_BASE_URL") {
                config.ollama_base_url = url;
            }
        }

        // Env vars as fallback for API keys
        if config.openai_api_key.is_none() {
            config.openai_api_key = lookup("OPENAI_API_KEY");
        }
        if config.anthropic_api_key.is_none() {
            config.anthropic_api_key = lookup("ANTHROPIC_API_KEY");
        }
        if config.groq_api_key.is_none() {
            config.groq_api_key = lookup("GROQ_API_KEY");
        }

        config
    }

    fn set_model_for_preferred(&mut self, model: String) {
        match LLMProvider::parse(&self.preferred_provider) {
            Some(LLMProvider::OpenAI) => self.openai_model = model,
            Some(LLMProvider::Anthropic) => self.anthropic_model = model,
            Some(LLMProvider::Groq) => self.groq_model = model,
            Some(LLMProvider::Ollama) | None => self.ollama_model = model,
        }
    }

    fn spec_for(&self, provider: LLMProvider) -> Option<BackendSpec> {
        let (model, api_key) = match provider {
            LLMProvider::OpenAI => (&self.openai_model, Some(self.openai_api_key.clone()?)),
            LLMProvider::Anthropic => (&self.anthropic_model, Some(self.anthropic_api_key.clone()?)),
            LLMProvider::Groq => (&self.groq_model, Some(self.groq_api_key.clone()?)),
            LLMProvider::Ollama => (&self.ollama_model, None),
        };
        Some(BackendSpec {
            provider,
            model: model.clone(),
            api_key,
            base_url: (provider == LLMProvider::Ollama).then(|| self.ollama_base_url.clone()),
        })
    }

    /// Usable backends, in selection order. The first is what `auto`
    /// resolves to.
    pub fn backend_specs(&self) -> Vec<BackendSpec> {
        // Auto mode: Anthropic > Groq > OpenAI > Ollama
        let mut order = vec![
            LLMProvider::Anthropic,
            LLMProvider::Groq,
            LLMProvider::OpenAI,
            LLMProvider::Ollama,
        ];
        if let Some(preferred) = LLMProvider::parse(&self.preferred_provider) {
            order.retain(|p| *p != preferred);
            order.insert(0, preferred);
        }
        order.into_iter().filter_map(|p| self.spec_for(p)).collect()
    }

    /// Resolve which provider and model `auto` uses.
    pub fn resolve_provider(&self) -> Option<(LLMProvider, String)> {
        self.backend_specs()
            .into_iter()
            .next()
            .map(|spec| (spec.provider, spec.model))
    }

    /// Construct HTTP backends for every usable provider.
    pub fn build_backends(&self, request_timeout: Duration) -> Result<Vec<Arc<dyn ModelBackend>>> {
        let mut backends: Vec<Arc<dyn ModelBackend>> = Vec::new();
        for spec in self.backend_specs() {
            let backend = HttpModelBackend::new(
                spec.provider,
                spec.model,
                spec.api_key,
                spec.base_url,
                request_timeout,
            )?;
            backends.push(Arc::new(backend));
        }
        info!(
            "Configured model backends: {}",
            backends.iter().map(|b| b.name()).collect::<Vec<_>>().join(", ")
        );
        Ok(backends)
    }

    /// Build the public config response (no API keys exposed).
    pub fn to_response(&self) -> LLMConfigResponse {
        let resolved = self.resolve_provider();
        LLMConfigResponse {
            preferred_provider: self.preferred_provider.clone(),
            openai_configured: self.openai_api_key.is_some(),
            anthropic_configured: self.anthropic_api_key.is_some(),
            groq_configured: self.groq_api_key.is_some(),
            ollama_base_url: self.ollama_base_url.clone(),
            active_provider: resolved.as_ref().map(|(p, _)| p.to_string()),
            active_model: resolved.map(|(_, m)| m),
        }
    }
}
