//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{ConfigError, RestaurantProfile};

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    #[default]
    Development,
    Staging,
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub llm: LlmSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub dialogue: DialogueConfig,

    #[serde(default)]
    pub telephony: TelephonyConfig,

    #[serde(default)]
    pub restaurant: RestaurantProfile,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_server()?;
        self.validate_llm()?;
        self.retry.classification.validate("retry.classification")?;
        self.retry.generation.validate("retry.generation")?;
        self.validate_dialogue()?;
        self.validate_turn_budget()?;
        self.validate_restaurant()?;

        if self.environment.is_production() && self.llm.api_key.is_empty() {
            return Err(ConfigError::MissingField("llm.api_key".to_string()));
        }

        Ok(())
    }

    fn validate_server(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.port".to_string(),
                message: "Port cannot be 0".to_string(),
            });
        }
        Ok(())
    }

    fn validate_llm(&self) -> Result<(), ConfigError> {
        for (field, call) in [
            ("llm.classification", &self.llm.classification),
            ("llm.generation", &self.llm.generation),
            ("llm.extraction", &self.llm.extraction),
        ] {
            if call.max_tokens == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.max_tokens", field),
                    message: "Must be greater than 0".to_string(),
                });
            }
            if !(0.0..=2.0).contains(&call.temperature) {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.temperature", field),
                    message: format!("Must be between 0.0 and 2.0, got {}", call.temperature),
                });
            }
        }
        Ok(())
    }

    fn validate_dialogue(&self) -> Result<(), ConfigError> {
        if self.dialogue.max_history_turns < 2 {
            return Err(ConfigError::InvalidValue {
                field: "dialogue.max_history_turns".to_string(),
                message: "Must keep at least the first caller turn and the latest turn".to_string(),
            });
        }
        if self.dialogue.max_sessions == 0 {
            return Err(ConfigError::InvalidValue {
                field: "dialogue.max_sessions".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if self.telephony.gather_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "telephony.gather_timeout_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// A turn must answer before the HTTP timeout, and both model calls of a
    /// turn must fit in the turn budget even when every attempt times out.
    fn validate_turn_budget(&self) -> Result<(), ConfigError> {
        let turn_ms = self.dialogue.turn_timeout_ms;
        if turn_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "dialogue.turn_timeout_ms".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        let server_ms = self.server.timeout_seconds.saturating_mul(1_000);
        if turn_ms >= server_ms {
            return Err(ConfigError::InvalidValue {
                field: "dialogue.turn_timeout_ms".to_string(),
                message: format!(
                    "Must be below server.timeout_seconds ({} ms), got {} ms",
                    server_ms, turn_ms
                ),
            });
        }
        let worst_ms =
            self.retry.classification.worst_case_ms() + self.retry.generation.worst_case_ms();
        if worst_ms > turn_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry".to_string(),
                message: format!(
                    "Classification plus generation can take {} ms, over the {} ms turn budget",
                    worst_ms, turn_ms
                ),
            });
        }
        Ok(())
    }

    fn validate_restaurant(&self) -> Result<(), ConfigError> {
        if self.restaurant.menu.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "restaurant.menu".to_string(),
                message: "Menu cannot be empty".to_string(),
            });
        }
        if let Some(item) = self.restaurant.menu.iter().find(|i| i.price_cents == 0) {
            return Err(ConfigError::InvalidValue {
                field: "restaurant.menu".to_string(),
                message: format!("'{}' has no price", item.name),
            });
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_timeout() -> u64 {
    15
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_seconds: default_timeout(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

/// Model, token cap and temperature for one kind of call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelCallConfig {
    pub model: String,
    pub max_tokens: usize,
    pub temperature: f32,
}

/// Language-model endpoint and per-call configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// OpenAI-compatible base URL
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    /// Falls back to `OPENAI_API_KEY`
    #[serde(default = "default_api_key")]
    pub api_key: String,

    /// HTTP client timeout, a hard ceiling above the per-attempt retry timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_classification_call")]
    pub classification: ModelCallConfig,

    #[serde(default = "default_generation_call")]
    pub generation: ModelCallConfig,

    #[serde(default = "default_extraction_call")]
    pub extraction: ModelCallConfig,
}

fn default_llm_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key() -> String {
    std::env::var("OPENAI_API_KEY").unwrap_or_default()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_classification_call() -> ModelCallConfig {
    ModelCallConfig {
        model: "gpt-3.5-turbo".to_string(),
        max_tokens: 10,
        temperature: 0.3,
    }
}
fn default_generation_call() -> ModelCallConfig {
    ModelCallConfig {
        model: "gpt-3.5-turbo".to_string(),
        max_tokens: 100,
        temperature: 0.7,
    }
}
fn default_extraction_call() -> ModelCallConfig {
    ModelCallConfig {
        model: "gpt-4".to_string(),
        max_tokens: 500,
        temperature: 0.2,
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            api_key: default_api_key(),
            request_timeout_ms: default_request_timeout_ms(),
            classification: default_classification_call(),
            generation: default_generation_call(),
            extraction: default_extraction_call(),
        }
    }
}

impl LlmSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Backoff policy parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Fractional spread applied to each delay, in `[0, 1]`
    pub jitter: f64,
    pub attempt_timeout_ms: u64,
}

impl RetryConfig {
    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.max_attempts", field),
                message: "Must be at least 1".to_string(),
            });
        }
        if self.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.multiplier", field),
                message: format!("Must be at least 1.0, got {}", self.multiplier),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.jitter", field),
                message: format!("Must be between 0.0 and 1.0, got {}", self.jitter),
            });
        }
        if self.attempt_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("{}.attempt_timeout_ms", field),
                message: "Must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Longest a call can take when every attempt times out and every
    /// backoff lands on the top of its jitter range
    pub fn worst_case_ms(&self) -> u64 {
        let attempts = u64::from(self.max_attempts.max(1));
        let mut total = attempts.saturating_mul(self.attempt_timeout_ms);
        let mut delay = self.initial_backoff_ms as f64;
        for _ in 1..attempts {
            let capped = delay.min(self.max_backoff_ms as f64);
            total = total.saturating_add((capped * (1.0 + self.jitter)).ceil() as u64);
            delay *= self.multiplier.max(1.0);
        }
        total
    }
}

/// Classification gets a cheaper, faster policy than generation and extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_classification_retry")]
    pub classification: RetryConfig,

    #[serde(default = "default_generation_retry")]
    pub generation: RetryConfig,
}

fn default_classification_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 2,
        initial_backoff_ms: 100,
        max_backoff_ms: 500,
        multiplier: 2.0,
        jitter: 0.2,
        attempt_timeout_ms: 1_500,
    }
}
fn default_generation_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 2,
        initial_backoff_ms: 200,
        max_backoff_ms: 1_000,
        multiplier: 2.0,
        jitter: 0.2,
        attempt_timeout_ms: 2_500,
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            classification: default_classification_retry(),
            generation: default_generation_retry(),
        }
    }
}

/// Session bounds and dialogue behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    /// Turns handed to the response generator, first caller turn included
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,

    #[serde(default = "default_max_history_chars")]
    pub max_history_chars: usize,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Idle sessions older than this are evicted
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Silent gathers tolerated before hanging up
    #[serde(default = "default_max_no_input")]
    pub max_no_input_prompts: u32,

    /// Deadline for one turn, from the webhook arriving to the reply
    #[serde(default = "default_turn_timeout")]
    pub turn_timeout_ms: u64,
}

fn default_max_history_turns() -> usize {
    10
}
fn default_max_history_chars() -> usize {
    4_000
}
fn default_max_sessions() -> usize {
    1_000
}
fn default_session_timeout() -> u64 {
    3_600
}
fn default_cleanup_interval() -> u64 {
    300
}
fn default_max_no_input() -> u32 {
    2
}
fn default_turn_timeout() -> u64 {
    9_000
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            max_history_turns: default_max_history_turns(),
            max_history_chars: default_max_history_chars(),
            max_sessions: default_max_sessions(),
            session_timeout_secs: default_session_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
            max_no_input_prompts: default_max_no_input(),
            turn_timeout_ms: default_turn_timeout(),
        }
    }
}

impl DialogueConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }
}

/// Telephony document parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelephonyConfig {
    /// Where the provider posts the next recognized speech
    #[serde(default = "default_speech_action")]
    pub speech_action: String,

    /// Redirect target when a gather captures nothing
    #[serde(default = "default_no_input_action")]
    pub no_input_action: String,

    #[serde(default = "default_voice")]
    pub voice: String,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_speech_model")]
    pub speech_model: String,

    #[serde(default = "default_gather_timeout")]
    pub gather_timeout_secs: u32,

    /// Staff line dialed on transfer to a human
    #[serde(default)]
    pub transfer_number: Option<String>,
}

fn default_speech_action() -> String {
    "/api/webhook/speech".to_string()
}
fn default_no_input_action() -> String {
    "/api/webhook/no-input".to_string()
}
fn default_voice() -> String {
    "Polly.Joanna".to_string()
}
fn default_language() -> String {
    "en-US".to_string()
}
fn default_speech_model() -> String {
    "phone_call".to_string()
}
fn default_gather_timeout() -> u32 {
    3
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            speech_action: default_speech_action(),
            no_input_action: default_no_input_action(),
            voice: default_voice(),
            language: default_language(),
            speech_model: default_speech_model(),
            gather_timeout_secs: default_gather_timeout(),
            transfer_number: None,
        }
    }
}

/// Persistence configuration for ScyllaDB
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Enable ScyllaDB persistence (false = in-memory only)
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_scylla_hosts")]
    pub scylla_hosts: Vec<String>,

    #[serde(default = "default_scylla_keyspace")]
    pub keyspace: String,

    #[serde(default = "default_replication_factor")]
    pub replication_factor: u8,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_scylla_hosts() -> Vec<String> {
    std::env::var("SCYLLA_HOSTS")
        .map(|s| s.split(',').map(|h| h.trim().to_string()).collect())
        .unwrap_or_else(|_| vec!["127.0.0.1:9042".to_string()])
}

fn default_scylla_keyspace() -> String {
    std::env::var("SCYLLA_KEYSPACE").unwrap_or_else(|_| "restaurant_agent".to_string())
}

fn default_replication_factor() -> u8 {
    1
}

fn default_connect_timeout() -> u64 {
    5_000
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scylla_hosts: default_scylla_hosts(),
            keyspace: default_scylla_keyspace(),
            replication_factor: default_replication_factor(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl PersistenceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,

    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_enabled: true,
        }
    }
}

/// Load settings from files and environment
///
/// Priority (highest first):
/// 1. Environment variables (RESTAURANT_AGENT__ prefix)
/// 2. config/{env}.yaml (if env specified)
/// 3. config/default.yaml
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    load_settings_from("config", env)
}

/// Same as [`load_settings`] with an explicit config directory
pub fn load_settings_from(config_dir: &str, env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name(&format!("{}/default", config_dir)).required(false));

    if let Some(env_name) = env {
        builder = builder
            .add_source(File::with_name(&format!("{}/{}", config_dir, env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("RESTAURANT_AGENT")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    tracing::debug!(
        environment = ?settings.environment,
        port = settings.server.port,
        persistence = settings.persistence.enabled,
        "Settings loaded"
    );

    Ok(settings)
}
