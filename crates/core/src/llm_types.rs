//! Chat message types and language-model errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation::{Speaker, Turn};

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Chat message sent to a language model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

impl From<&Turn> for Message {
    fn from(turn: &Turn) -> Self {
        match turn.speaker {
            Speaker::Caller => Message::user(turn.text.clone()),
            Speaker::Assistant => Message::assistant(turn.text.clone()),
        }
    }
}

/// Language-model failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Timeout")]
    Timeout,

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl LlmError {
    /// Timeouts, rate limits and transport/5xx failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout | LlmError::RateLimited(_) | LlmError::Network(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::Timeout.is_transient());
        assert!(LlmError::RateLimited("429".into()).is_transient());
        assert!(LlmError::Network("connection reset".into()).is_transient());
        assert!(!LlmError::Api("HTTP 400".into()).is_transient());
        assert!(!LlmError::InvalidResponse("no choices".into()).is_transient());
    }

    #[test]
    fn test_turn_to_message() {
        let msg = Message::from(&Turn::caller("Do you deliver?"));
        assert_eq!(msg.role, Role::User);
        let msg = Message::from(&Turn::assistant("We do, within 5 miles."));
        assert_eq!(msg.role, Role::Assistant);
    }
}
