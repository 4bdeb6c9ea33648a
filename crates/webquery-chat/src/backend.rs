use async_trait::async_trait;
use webquery_core::Result;

use crate::types::{Completion, Prompt};

/// One AI backend the dispatcher can call.
///
/// Implementations classify their own failures into
/// `ModelTransientFailure` / `ModelPermanentFailure`; the dispatcher retries
/// only the former.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Name selectors match against (`"openai"`, `"ollama"`, ...).
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    async fn complete(&self, prompt: &Prompt) -> Result<Completion>;
}
