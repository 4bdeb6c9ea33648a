//! Model call types.

use serde::{Deserialize, Serialize};

/// LLM provider identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LLMProvider {
    OpenAI,
    Anthropic,
    Groq,
    Ollama,
}

impl LLMProvider {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "openai" => Some(Self::OpenAI),
            "anthropic" => Some(Self::Anthropic),
            "groq" => Some(Self::Groq),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }
}

impl std::fmt::Display for LLMProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LLMProvider::OpenAI => write!(f, "openai"),
            LLMProvider::Anthropic => write!(f, "anthropic"),
            LLMProvider::Groq => write!(f, "groq"),
            LLMProvider::Ollama => write!(f, "ollama"),
        }
    }
}

/// One message of a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Fully rendered model input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    #[serde(rename = "maxTokens")]
    pub max_tokens: usize,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            temperature: 0.0,
            max_tokens: 1024,
        }
    }

    pub fn with_sampling(mut self, temperature: f64, max_tokens: usize) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Flat text form, used for fingerprinting.
    pub fn render(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("[{}]\n{}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Which backend a model call goes to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BackendSelector {
    /// First configured backend.
    #[default]
    Auto,
    /// Backend by name, e.g. `"anthropic"`.
    Named(String),
}

impl From<String> for BackendSelector {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<&str> for BackendSelector {
    fn from(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("auto") {
            Self::Auto
        } else {
            Self::Named(s.to_lowercase())
        }
    }
}

impl From<BackendSelector> for String {
    fn from(sel: BackendSelector) -> Self {
        sel.to_string()
    }
}

impl std::fmt::Display for BackendSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendSelector::Auto => f.write_str("auto"),
            BackendSelector::Named(name) => f.write_str(name),
        }
    }
}

/// Raw output of one backend call.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub tokens_used: Option<usize>,
}

/// Normalized model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    pub backend: String,
    pub model: String,
    pub content: String,
    #[serde(rename = "tokensUsed")]
    pub tokens_used: Option<usize>,
    pub attempts: u32,
    #[serde(rename = "elapsedMs")]
    pub elapsed_ms: u64,
}

/// Dispatcher counters.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub backends: Vec<String>,
    #[serde(rename = "concurrencyLimit")]
    pub concurrency_limit: usize,
    #[serde(rename = "availableSlots")]
    pub available_slots: usize,
    pub calls: u64,
    pub retries: u64,
    pub failures: u64,
}

/// LLM config summary (keys masked).
#[derive(Debug, Clone, Serialize)]
pub struct LLMConfigResponse {
    #[serde(rename = "preferredProvider")]
    pub preferred_provider: String,
    #[serde(rename = "openaiConfigured")]
    pub openai_configured: bool,
    #[serde(rename = "anthropicConfigured")]
    pub anthropic_configured: bool,
    #[serde(rename = "groqConfigured")]
    pub groq_configured: bool,
    #[serde(rename = "ollamaBaseUrl")]
    pub ollama_base_url: String,
    #[serde(rename = "activeProvider")]
    pub active_provider: Option<String>,
    #[serde(rename = "activeModel")]
    pub active_model: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_round_trips_as_string() {
        let named: BackendSelector = serde_json::from_str("\"Anthropic\"").unwrap();
        assert_eq!(named, BackendSelector::Named("anthropic".into()));
        let auto: BackendSelector = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(auto, BackendSelector::Auto);
        assert_eq!(serde_json::to_string(&named).unwrap(), "\"anthropic\"");
    }

    #[test]
    fn test_prompt_render_is_stable() {
        let prompt = Prompt::new("be brief", "what is rust?");
        assert_eq!(prompt.render(), "[system]\nbe brief\n[user]\nwhat is rust?");
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!(LLMProvider::parse(" Ollama "), Some(LLMProvider::Ollama));
        assert_eq!(LLMProvider::parse("bard"), None);
    }
}
