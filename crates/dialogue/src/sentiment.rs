//! End-of-call sentiment scoring

use std::sync::Arc;

use restaurant_agent_config::SENTIMENT_PROMPT;
use restaurant_agent_core::{LanguageModel, Turn};
use restaurant_agent_llm::RetryPolicy;

use crate::extractor::render_conversation;

pub struct SentimentScorer {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
}

impl SentimentScorer {
    pub fn new(model: Arc<dyn LanguageModel>, retry: RetryPolicy) -> Self {
        Self { model, retry }
    }

    /// Score in `[-1, 1]`. `None` when the model is unreachable, `0.0` when
    /// it answers with something that is not a number.
    pub async fn score(&self, turns: &[Turn]) -> Option<f32> {
        if turns.is_empty() {
            return None;
        }
        let conversation = render_conversation(turns);

        match self
            .retry
            .run("sentiment", || self.model.classify_text(SENTIMENT_PROMPT, &conversation))
            .await
        {
            Ok(raw) => Some(parse_score(&raw)),
            Err(e) => {
                tracing::warn!(error = %e, "Sentiment scoring failed");
                metrics::counter!(
                    "restaurant_agent_llm_failures_total",
                    "operation" => "sentiment"
                )
                .increment(1);
                None
            },
        }
    }
}

fn parse_score(raw: &str) -> f32 {
    raw.split_whitespace()
        .find_map(|token| {
            token
                .trim_matches(|c: char| !(c.is_ascii_digit() || c == '-' || c == '.'))
                .parse::<f32>()
                .ok()
        })
        .filter(|score| score.is_finite())
        .map(|score| score.clamp(-1.0, 1.0))
        .unwrap_or(0.0)
}
