//! Model side of query orchestration.
//!
//! `ModelDispatcher` bounds concurrent calls to the configured LLM backends,
//! retries transient failures, and normalizes responses. Backends are plain
//! (non-streaming) HTTP calls to OpenAI, Groq, Anthropic or a local Ollama.

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod providers;
pub mod types;

pub use backend::ModelBackend;
pub use config::LLMConfig;
pub use dispatcher::{DispatcherConfig, ModelDispatcher};
pub use providers::HttpModelBackend;
pub use types::*;
