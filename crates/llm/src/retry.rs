//! Retry policy shared by every outbound language-model call
//!
//! Each attempt runs under its own timeout. Only transient failures
//! (timeouts, rate limits, transport and 5xx errors) are retried; a
//! response that arrived but was unusable is surfaced immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use restaurant_agent_config::RetryConfig;
use restaurant_agent_core::LlmError;
use thiserror::Error;

/// A language-model operation that could not be completed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExternalServiceError {
    /// Every attempt failed transiently
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last_error: LlmError,
    },

    /// Non-transient failure, not retried
    #[error("{operation} rejected on attempt {attempts}: {error}")]
    Rejected {
        operation: String,
        attempts: u32,
        error: LlmError,
    },
}

impl ExternalServiceError {
    pub fn operation(&self) -> &str {
        match self {
            Self::Exhausted { operation, .. } | Self::Rejected { operation, .. } => operation,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Rejected { attempts, .. } => *attempts,
        }
    }

    pub fn last_error(&self) -> &LlmError {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
            Self::Rejected { error, .. } => error,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

impl From<ExternalServiceError> for restaurant_agent_core::Error {
    fn from(err: ExternalServiceError) -> Self {
        match err {
            ExternalServiceError::Exhausted { .. } => {
                restaurant_agent_core::Error::TransientService(err.to_string())
            },
            ExternalServiceError::Rejected { error, .. } => error.into(),
        }
    }
}

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Each delay is scaled by a random factor in `[1 - jitter, 1 + jitter]`
    pub jitter: f64,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.2,
            attempt_timeout: Duration::from_secs(4),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `retry` (1-based)
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(30) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }

    fn jittered_delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor)
    }

    /// Run `op` until it succeeds, fails non-transiently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, ExternalServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_error = LlmError::Timeout;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.jittered_delay(attempt - 1);
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "Language model call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }

            let outcome = match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation, attempt, "Language model call recovered");
                    }
                    return Ok(value);
                },
                Err(error) if error.is_transient() => {
                    metrics::counter!(
                        "restaurant_agent_llm_retries_total",
                        "operation" => operation.to_string()
                    )
                    .increment(1);
                    last_error = error;
                },
                Err(error) => {
                    return Err(ExternalServiceError::Rejected {
                        operation: operation.to_string(),
                        attempts: attempt,
                        error,
                    });
                },
            }
        }

        Err(ExternalServiceError::Exhausted {
            operation: operation.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}
