//! Language model integration
//!
//! Features:
//! - OpenAI-compatible chat completions backend
//! - Shared retry policy with exponential backoff, jitter and per-attempt timeout

pub mod backend;
pub mod retry;

pub use backend::{OpenAiBackend, OpenAiConfig};
pub use restaurant_agent_core::LlmError;
pub use retry::{ExternalServiceError, RetryPolicy};
