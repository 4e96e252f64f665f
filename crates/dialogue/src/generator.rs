//! Assistant reply generation

use std::sync::Arc;

use restaurant_agent_core::{LanguageModel, Message, OrderRecord, Turn};
use restaurant_agent_llm::RetryPolicy;

/// Spoken when the model cannot produce a reply
pub const FALLBACK_UTTERANCE: &str = "I apologize, but I'm experiencing some technical difficulties. \
                                      Let me transfer you to one of our staff members.";

pub struct ResponseGenerator {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    persona: String,
    max_tokens: usize,
    temperature: f32,
}

impl ResponseGenerator {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        retry: RetryPolicy,
        persona: String,
        max_tokens: usize,
        temperature: f32,
    ) -> Self {
        Self {
            model,
            retry,
            persona,
            max_tokens,
            temperature,
        }
    }

    /// Chat messages for one reply: persona, prior turns, the new utterance,
    /// then the caller's open order if known.
    pub fn build_messages(
        &self,
        transcript: &str,
        history: &[Turn],
        order_context: Option<&OrderRecord>,
    ) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() + 3);
        messages.push(Message::system(self.persona.clone()));
        messages.extend(history.iter().map(Message::from));
        messages.push(Message::user(transcript));
        if let Some(order) = order_context {
            messages.push(Message::system(format!(
                "Customer has an existing order: {}",
                order.summary()
            )));
        }
        messages
    }

    /// Generate the next assistant utterance. Always returns speakable text.
    pub async fn generate(
        &self,
        transcript: &str,
        history: &[Turn],
        order_context: Option<&OrderRecord>,
    ) -> String {
        let messages = self.build_messages(transcript, history, order_context);

        let result = self
            .retry
            .run("generate", || {
                self.model
                    .generate_text(&messages, self.max_tokens, self.temperature)
            })
            .await;

        match result {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                tracing::warn!("Language model returned an empty reply");
                FALLBACK_UTTERANCE.to_string()
            },
            Err(e) => {
                tracing::error!(error = %e, "Response generation failed");
                metrics::counter!(
                    "restaurant_agent_llm_failures_total",
                    "operation" => "generate"
                )
                .increment(1);
                FALLBACK_UTTERANCE.to_string()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use restaurant_agent_core::{
        LineItem, LlmError, MenuPricing, OrderDraft, OrderStatus, Role,
    };
    use std::time::Duration;

    struct EchoModel(Result<String, LlmError>);

    #[async_trait]
    impl LanguageModel for EchoModel {
        async fn classify_text(&self, _prompt: &str, _text: &str) -> Result<String, LlmError> {
            unreachable!()
        }

        async fn generate_text(
            &self,
            _messages: &[Message],
            _max_tokens: usize,
            _temperature: f32,
        ) -> Result<String, LlmError> {
            self.0.clone()
        }

        async fn extract_structured(&self, _prompt: &str, _text: &str) -> Result<String, LlmError> {
            unreachable!()
        }

        fn model_name(&self) -> &str {
            "echo"
        }
    }

    struct FlatPricing;

    impl MenuPricing for FlatPricing {
        fn unit_price_cents(&self, _item_name: &str) -> u64 {
            1000
        }
    }

    fn generator(reply: Result<String, LlmError>) -> ResponseGenerator {
        let retry = RetryPolicy {
            max_attempts: 1,
            attempt_timeout: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        ResponseGenerator::new(Arc::new(EchoModel(reply)), retry, "persona".into(), 100, 0.7)
    }

    #[test]
    fn test_message_order() {
        let g = generator(Ok("hi".into()));
        let history = vec![Turn::caller("Hello"), Turn::assistant("Hi there")];
        let draft = OrderDraft {
            items: vec![LineItem::new("Margherita Pizza", 1)],
            ..OrderDraft::default()
        };
        let order =
            OrderRecord::from_draft("CA1", "+1", draft, OrderStatus::Confirmed, &FlatPricing, 0);

        let messages = g.build_messages("Where is my order?", &history, Some(&order));
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User, Role::System]
        );
        assert_eq!(messages[3].content, "Where is my order?");
        assert!(messages[4].content.starts_with("Customer has an existing order:"));
    }

    #[tokio::test]
    async fn test_reply_is_trimmed() {
        let g = generator(Ok("  Sure thing!\n".into()));
        assert_eq!(g.generate("hi", &[], None).await, "Sure thing!");
    }

    #[tokio::test]
    async fn test_fallback_on_failure_or_empty() {
        let g = generator(Err(LlmError::Api("bad".into())));
        assert_eq!(g.generate("hi", &[], None).await, FALLBACK_UTTERANCE);

        let g = generator(Ok("   ".into()));
        assert_eq!(g.generate("hi", &[], None).await, FALLBACK_UTTERANCE);
    }
}
