//! HTTP model backends.
//!
//! OpenAI, Groq and Ollama share the chat-completions wire format (Ollama
//! through its `/v1` compatibility endpoint). Anthropic uses the Messages API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::debug;
use webquery_core::{Error, Result};

use crate::backend::ModelBackend;
use crate::types::{Completion, LLMProvider, Prompt};

pub const OPENAI_URL: &str = "https://api.openai.com/v1";
pub const GROQ_URL: &str = "https://api.groq.com/openai/v1";
pub const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// `ModelBackend` over a provider's HTTP API.
pub struct HttpModelBackend {
    client: Client,
    provider: LLMProvider,
    name: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
}

impl HttpModelBackend {
    pub fn new(
        provider: LLMProvider,
        model: impl Into<String>,
        api_key: Option<String>,
        base_url: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Http(format!("Failed to build HTTP client: {}", e)))?;
        let base_url = base_url
            .unwrap_or_else(|| default_base_url(provider))
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            client,
            provider,
            name: provider.to_string(),
            model: model.into(),
            api_key,
            base_url,
        })
    }

    pub fn provider(&self) -> LLMProvider {
        self.provider
    }

    fn endpoint(&self) -> String {
        match self.provider {
            LLMProvider::Anthropic => format!("{}/messages", self.base_url),
            LLMProvider::Ollama if !self.base_url.ends_with("/v1") => {
                format!("{}/v1/chat/completions", self.base_url)
            }
            _ => format!("{}/chat/completions", self.base_url),
        }
    }

    async fn complete_openai_compat(&self, prompt: &Prompt) -> Result<Completion> {
        let msgs: Vec<Value> = prompt
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();
        let body = json!({
            "model": self.model,
            "messages": msgs,
            "temperature": prompt.temperature,
            "max_tokens": prompt.max_tokens,
            "stream": false,
        });

        let mut req = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        let parsed = send(req).await?;

        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let tokens_used = parsed["usage"]["total_tokens"].as_u64().map(|n| n as usize);
        Ok(Completion { content, tokens_used })
    }

    async fn complete_anthropic(&self, prompt: &Prompt) -> Result<Completion> {
        // System prompt travels outside the message list.
        let system_msg: Option<&str> = prompt
            .messages
            .iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.as_str());
        let conv_msgs: Vec<Value> = prompt
            .messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": conv_msgs,
            "temperature": prompt.temperature,
            "max_tokens": prompt.max_tokens,
        });
        if let Some(sys) = system_msg {
            body["system"] = json!(sys);
        }

        let req = self
            .client
            .post(self.endpoint())
            .header("x-api-key", self.api_key.as_deref().unwrap_or_default())
            .header("anthropic-version", "2023-06-01")
            .json(&body);
        let parsed = send(req).await?;

        let content = parsed["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        let tokens_used = match (
            parsed["usage"]["input_tokens"].as_u64(),
            parsed["usage"]["output_tokens"].as_u64(),
        ) {
            (Some(i), Some(o)) => Some((i + o) as usize),
            (None, Some(o)) => Some(o as usize),
            _ => None,
        };
        Ok(Completion { content, tokens_used })
    }
}

#[async_trait]
impl ModelBackend for HttpModelBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &Prompt) -> Result<Completion> {
        debug!("Calling {} with model {}", self.name, self.model);
        let completion = match self.provider {
            LLMProvider::Anthropic => self.complete_anthropic(prompt).await?,
            _ => self.complete_openai_compat(prompt).await?,
        };
        if completion.content.trim().is_empty() {
            return Err(Error::ModelTransientFailure(format!(
                "{} returned an empty completion",
                self.name
            )));
        }
        Ok(completion)
    }
}

fn default_base_url(provider: LLMProvider) -> String {
    match provider {
        LLMProvider::OpenAI => OPENAI_URL,
        LLMProvider::Groq => GROQ_URL,
        LLMProvider::Anthropic => ANTHROPIC_URL,
        LLMProvider::Ollama => DEFAULT_OLLAMA_URL,
    }
    .to_string()
}

async fn send(req: reqwest::RequestBuilder) -> Result<Value> {
    let response = req.send().await.map_err(map_transport)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| Error::ModelTransientFailure(format!("Malformed response body: {}", e)))
}

/// Map a non-success HTTP status to a transient or permanent failure.
pub fn classify_status(status: StatusCode, body: &str) -> Error {
    let detail = format!(
        "API error {}: {}",
        status,
        body.chars().take(300).collect::<String>()
    );
    match status.as_u16() {
        400 | 401 | 403 | 404 | 422 => Error::ModelPermanentFailure(detail),
        408 | 409 | 425 | 429 => Error::ModelTransientFailure(detail),
        s if s >= 500 => Error::ModelTransientFailure(detail),
        _ => Error::ModelPermanentFailure(detail),
    }
}

fn map_transport(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() {
        Error::ModelTransientFailure(format!("Request failed: {}", e))
    } else {
        Error::ModelPermanentFailure(format!("Request failed: {}", e))
    }
}
