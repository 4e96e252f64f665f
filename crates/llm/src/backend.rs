//! OpenAI-compatible chat completions backend
//!
//! Works with OpenAI and any server exposing the same `/chat/completions`
//! surface (vLLM, Ollama in OpenAI mode, proxies).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use restaurant_agent_config::{LlmSettings, ModelCallConfig};
use restaurant_agent_core::{LanguageModel, LlmError, Message, Role};
use serde::{Deserialize, Serialize};

/// Backend configuration
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub timeout: Duration,
    pub classification: ModelCallConfig,
    /// Model used by `generate_text`; token cap and temperature come per call
    pub generation_model: String,
    pub extraction: ModelCallConfig,
}

impl From<&LlmSettings> for OpenAiConfig {
    fn from(settings: &LlmSettings) -> Self {
        Self {
            endpoint: settings.endpoint.clone(),
            api_key: settings.api_key.clone(),
            timeout: settings.request_timeout(),
            classification: settings.classification.clone(),
            generation_model: settings.generation.model.clone(),
            extraction: settings.extraction.clone(),
        }
    }
}

/// OpenAI-compatible backend
pub struct OpenAiBackend {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        if config.api_key.is_empty() && !is_local(&config.endpoint) {
            return Err(LlmError::Configuration(
                "API key required for remote endpoints".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Network(e.to_string()))?;

        Ok(Self { config, client })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.config.endpoint.trim_end_matches('/'))
    }

    fn build_headers(&self) -> reqwest::header::HeaderMap {
        use reqwest::header::HeaderValue;

        let mut headers = reqwest::header::HeaderMap::new();
        if !self.config.api_key.is_empty() {
            let auth_value = format!("Bearer {}", self.config.api_key);
            if let Ok(val) = HeaderValue::from_str(&auth_value) {
                headers.insert(reqwest::header::AUTHORIZATION, val);
            }
        }
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers
    }

    async fn complete(&self, request: ChatRequest<'_>) -> Result<String, LlmError> {
        let response = self
            .client
            .post(self.chat_url())
            .headers(self.build_headers())
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("No choices in response".to_string()))?;

        Ok(choice.message.content.unwrap_or_default())
    }
}

fn is_local(endpoint: &str) -> bool {
    endpoint.starts_with("http://localhost") || endpoint.starts_with("http://127.0.0.1")
}

fn map_transport_error(err: reqwest::Error) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Network(err.to_string())
    }
}

/// 429 and 5xx are transient, every other non-success status is final
fn map_status(status: StatusCode, body: String) -> LlmError {
    let detail = format!("HTTP {}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS {
        LlmError::RateLimited(detail)
    } else if status.is_server_error() {
        LlmError::Network(detail)
    } else {
        LlmError::Api(detail)
    }
}

fn to_wire(messages: &[Message]) -> Vec<WireMessage<'_>> {
    messages
        .iter()
        .map(|m| WireMessage {
            role: m.role.as_str(),
            content: &m.content,
        })
        .collect()
}

#[async_trait]
impl LanguageModel for OpenAiBackend {
    async fn classify_text(&self, prompt: &str, text: &str) -> Result<String, LlmError> {
        let call = &self.config.classification;
        let request = ChatRequest {
            model: &call.model,
            messages: vec![
                WireMessage {
                    role: Role::System.as_str(),
                    content: prompt,
                },
                WireMessage {
                    role: Role::User.as_str(),
                    content: text,
                },
            ],
            max_tokens: call.max_tokens,
            temperature: call.temperature,
            response_format: None,
        };
        self.complete(request).await
    }

    async fn generate_text(
        &self,
        messages: &[Message],
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.config.generation_model,
            messages: to_wire(messages),
            max_tokens,
            temperature,
            response_format: None,
        };
        self.complete(request).await
    }

    async fn extract_structured(
        &self,
        prompt: &str,
        conversation_text: &str,
    ) -> Result<String, LlmError> {
        let call = &self.config.extraction;
        let request = ChatRequest {
            model: &call.model,
            messages: vec![
                WireMessage {
                    role: Role::System.as_str(),
                    content: prompt,
                },
                WireMessage {
                    role: Role::User.as_str(),
                    content: conversation_text,
                },
            ],
            max_tokens: call.max_tokens,
            temperature: call.temperature,
            response_format: Some(ResponseFormat {
                kind: "json_object",
            }),
        };
        self.complete(request).await
    }

    fn model_name(&self) -> &str {
        &self.config.generation_model
    }
}

// OpenAI API types
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: &str, api_key: &str) -> OpenAiConfig {
        let mut config = OpenAiConfig::from(&LlmSettings::default());
        config.endpoint = endpoint.to_string();
        config.api_key = api_key.to_string();
        config
    }

    #[test]
    fn test_remote_endpoint_requires_key() {
        assert!(matches!(
            OpenAiBackend::new(config("https://api.openai.com/v1", "")),
            Err(LlmError::Configuration(_))
        ));
        assert!(OpenAiBackend::new(config("http://localhost:11434/v1", "")).is_ok());
    }

    #[test]
    fn test_chat_url_trims_trailing_slash() {
        let backend = OpenAiBackend::new(config("http://localhost:8001/v1/", "")).unwrap();
        assert_eq!(backend.chat_url(), "http://localhost:8001/v1/chat/completions");
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            LlmError::RateLimited(_)
        ));
        assert!(map_status(StatusCode::BAD_GATEWAY, String::new()).is_transient());
        assert!(!map_status(StatusCode::UNAUTHORIZED, String::new()).is_transient());
    }

    #[test]
    fn test_extraction_request_asks_for_json() {
        let messages = [Message::system("extract"), Message::user("Caller: hi")];
        let request = ChatRequest {
            model: "gpt-4",
            messages: to_wire(&messages),
            max_tokens: 500,
            temperature: 0.2,
            response_format: Some(ResponseFormat {
                kind: "json_object",
            }),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["max_tokens"], 500);
    }

    #[test]
    fn test_response_without_content_is_empty() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant"}}]}"#).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }
}
