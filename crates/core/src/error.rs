//! Error types shared across the workspace

use thiserror::Error;

use crate::conversation::CallStatus;
use crate::llm_types::LlmError;

/// Result alias using the core error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error taxonomy
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Mutation attempted on a session that already finished
    #[error("Session {call_id} is already {status}")]
    SessionTerminal { call_id: String, status: CallStatus },

    #[error("Session capacity reached ({0} active calls)")]
    Capacity(usize),

    /// Model answered, but not in a usable shape. Never retried.
    #[error("Malformed model output: {0}")]
    MalformedOutput(String),

    /// Timeout, rate limit or transport failure that survived retries
    #[error("Transient service error: {0}")]
    TransientService(String),

    /// The service refused the request outright (4xx). Retrying won't help.
    #[error("Service rejected request: {0}")]
    ServiceRejected(String),

    #[error("Unknown status '{0}'")]
    UnknownStatus(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_session_terminal(&self) -> bool {
        matches!(self, Error::SessionTerminal { .. })
    }
}

impl From<LlmError> for Error {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::InvalidResponse(msg) => Error::MalformedOutput(msg),
            LlmError::Configuration(msg) => Error::Config(msg),
            LlmError::Api(msg) => Error::ServiceRejected(msg),
            other => Error::TransientService(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_error_mapping() {
        assert!(matches!(
            Error::from(LlmError::Timeout),
            Error::TransientService(_)
        ));
        assert!(matches!(
            Error::from(LlmError::InvalidResponse("not json".into())),
            Error::MalformedOutput(_)
        ));
        assert!(matches!(
            Error::from(LlmError::Api("HTTP 401".into())),
            Error::ServiceRejected(_)
        ));
        assert!(matches!(
            Error::from(LlmError::RateLimited("429".into())),
            Error::TransientService(_)
        ));
    }

    #[test]
    fn test_session_terminal_display() {
        let err = Error::SessionTerminal {
            call_id: "CA123".into(),
            status: CallStatus::Completed,
        };
        assert!(err.is_session_terminal());
        assert_eq!(err.to_string(), "Session CA123 is already completed");
    }
}
