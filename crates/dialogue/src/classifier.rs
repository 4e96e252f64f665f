//! Intent classification
//!
//! Maps one caller utterance to an [`Intent`]. Classification never fails:
//! empty input, service failures and unknown labels all yield
//! [`Intent::Unclear`].

use std::sync::Arc;

use async_trait::async_trait;
use restaurant_agent_config::INTENT_PROMPT;
use restaurant_agent_core::{Intent, LanguageModel};
use restaurant_agent_llm::RetryPolicy;

/// Intent classifier seam, mockable in tests
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, transcript: &str) -> Intent;
}

/// Classifier backed by the language model's label endpoint
pub struct LlmIntentClassifier {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
}

impl LlmIntentClassifier {
    pub fn new(model: Arc<dyn LanguageModel>, retry: RetryPolicy) -> Self {
        Self { model, retry }
    }
}

#[async_trait]
impl IntentClassifier for LlmIntentClassifier {
    async fn classify(&self, transcript: &str) -> Intent {
        let transcript = transcript.trim();
        if transcript.is_empty() {
            return Intent::Unclear;
        }

        let result = self
            .retry
            .run("classify", || self.model.classify_text(INTENT_PROMPT, transcript))
            .await;

        match result {
            Ok(label) => {
                let intent = Intent::from_label(&label);
                tracing::debug!(label = %label.trim(), intent = %intent, "Classified utterance");
                intent
            },
            Err(e) => {
                tracing::warn!(error = %e, "Intent classification failed");
                metrics::counter!(
                    "restaurant_agent_llm_failures_total",
                    "operation" => "classify"
                )
                .increment(1);
                Intent::Unclear
            },
        }
    }
}
