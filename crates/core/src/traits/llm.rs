//! Language Model traits

use async_trait::async_trait;

use crate::llm_types::{LlmError, Message};

/// Language Model interface
///
/// All three calls may be slow, may fail, and may return malformed text.
/// Callers wrap them in a retry policy and degrade on failure.
///
/// Implementations:
/// - `OpenAiBackend` - OpenAI-compatible chat completions API
#[async_trait]
pub trait LanguageModel: Send + Sync + 'static {
    /// Short single-label completion for `text` under `prompt`
    async fn classify_text(&self, prompt: &str, text: &str) -> Result<String, LlmError>;

    /// Free-form chat completion
    async fn generate_text(
        &self,
        messages: &[Message],
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String, LlmError>;

    /// Structured (JSON) completion over a rendered conversation
    async fn extract_structured(
        &self,
        prompt: &str,
        conversation_text: &str,
    ) -> Result<String, LlmError>;

    /// Get model name for logging
    fn model_name(&self) -> &str;
}
