//! Configuration management for the restaurant phone agent
//!
//! Settings are layered from `config/default.*`, an optional
//! `config/{env}.*` overlay, and `RESTAURANT_AGENT__*` environment variables.

pub mod prompts;
pub mod restaurant;
pub mod settings;

pub use prompts::{conversation_persona, INTENT_PROMPT, ORDER_PARSER_PROMPT, SENTIMENT_PROMPT};
pub use restaurant::{MenuItem, RestaurantProfile};
pub use settings::{
    load_settings, load_settings_from, DialogueConfig, LlmSettings, ModelCallConfig, ObservabilityConfig,
    PersistenceConfig, RetryConfig, RetrySettings, RuntimeEnvironment, ServerConfig, Settings,
    TelephonyConfig,
};

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

impl From<ConfigError> for restaurant_agent_core::Error {
    fn from(err: ConfigError) -> Self {
        restaurant_agent_core::Error::Config(err.to_string())
    }
}
