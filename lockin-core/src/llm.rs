//! LLM client for LockIn — vision descriptions and text reasoning
//!
//! Provides a `LanguageModel` trait with one implementation:
//! - **OpenAI** — chat completions (vision + text) over any OpenAI-compatible endpoint
//!
//! Calls here are single attempts. Retrying is the job of
//! [`ResilientExecutor`](crate::retry::ResilientExecutor); `LlmError` tells it
//! which failures are worth another try.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::OpenAiConfig;
use crate::retry::{CallTimedOut, Classify, FailureKind};

// ============================================================================
// LanguageModel trait
// ============================================================================

/// Abstraction over the remote vision + reasoning capability.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Describe an image. `image_url` is a `data:` URI.
    async fn describe_image(&self, instruction: &str, image_url: &str) -> Result<String, LlmError>;

    /// Plain text completion with a system and a user message.
    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limited: {message}")]
    RateLimited { message: String },

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Unexpected response status {code}: {body}")]
    UnexpectedStatus { code: u16, body: String },

    #[error("Missing completion text in response")]
    MissingCompletion,

    #[error("Missing API key")]
    MissingApiKey,

    #[error("{0}")]
    Deadline(#[from] CallTimedOut),
}

impl Classify for LlmError {
    fn classify(&self) -> FailureKind {
        match self {
            LlmError::Http(e) if e.is_timeout() => FailureKind::Timeout,
            LlmError::Deadline(_) => FailureKind::Timeout,
            LlmError::RateLimited { .. } => FailureKind::RateLimit,
            LlmError::Api { .. } => FailureKind::OtherApiError,
            _ => FailureKind::NonRetryable,
        }
    }
}

// ============================================================================
// Client config
// ============================================================================

#[derive(Debug, Clone)]
pub struct OpenAiClientConfig {
    pub api_key: String,
    pub vision_model: String,
    pub reasoning_model: String,
    pub timeout: Duration,
    pub vision_max_tokens: u32,
    pub nudge_max_tokens: u32,
}

impl OpenAiClientConfig {
    /// Build from the file config. Falls back to `OPENAI_API_KEY` when no key is given.
    pub fn new(api_key: Option<String>, config: &OpenAiConfig) -> Self {
        let api_key = api_key
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();

        Self {
            api_key,
            vision_model: config.vision_model.clone(),
            reasoning_model: config.reasoning_model.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
            vision_max_tokens: config.vision_max_tokens,
            nudge_max_tokens: config.nudge_max_tokens,
        }
    }
}

// ============================================================================
// Chat completions API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
    detail: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorResponse {
    error: OpenAiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorDetail {
    message: String,
}

// ============================================================================
// OpenAiClient
// ============================================================================

/// OpenAI chat-completions client. Cheap to clone; safe to share across requests.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    config: OpenAiClientConfig,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(config: OpenAiClientConfig) -> Result<Self, LlmError> {
        Self::with_base_url(config, "https://api.openai.com/v1".to_string())
    }

    /// Create a client with a custom base URL (for testing / compatible gateways)
    pub fn with_base_url(config: OpenAiClientConfig, base_url: String) -> Result<Self, LlmError> {
        if config.api_key.is_empty() {
            return Err(LlmError::MissingApiKey);
        }

        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            config,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model,
            messages,
            max_tokens,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let envelope = serde_json::from_str::<OpenAiErrorResponse>(&error_body).ok();

            tracing::warn!(code = status.as_u16(), model, "Chat completion API error");

            return Err(match (status, envelope) {
                (StatusCode::TOO_MANY_REQUESTS, envelope) => LlmError::RateLimited {
                    message: envelope.map(|e| e.error.message).unwrap_or(error_body),
                },
                (_, Some(envelope)) => LlmError::Api {
                    code: status.as_u16(),
                    message: envelope.error.message,
                },
                (_, None) => LlmError::UnexpectedStatus {
                    code: status.as_u16(),
                    body: error_body,
                },
            });
        }

        let chat_response: ChatResponse = response.json().await?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(LlmError::MissingCompletion)
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn describe_image(&self, instruction: &str, image_url: &str) -> Result<String, LlmError> {
        let messages = vec![ChatMessage {
            role: "user",
            content: MessageContent::Parts(vec![
                ContentPart::Text {
                    text: instruction.to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image_url.to_string(),
                        detail: "low",
                    },
                },
            ]),
        }];

        self.chat(&self.config.vision_model, messages, self.config.vision_max_tokens)
            .await
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let messages = vec![
            ChatMessage {
                role: "system",
                content: MessageContent::Text(system.to_string()),
            },
            ChatMessage {
                role: "user",
                content: MessageContent::Text(user.to_string()),
            },
        ];

        self.chat(&self.config.reasoning_model, messages, self.config.nudge_max_tokens)
            .await
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::classify;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(api_key: &str) -> OpenAiClientConfig {
        OpenAiClientConfig {
            api_key: api_key.to_string(),
            vision_model: "vision-test".to_string(),
            reasoning_model: "reasoning-test".to_string(),
            timeout: Duration::from_secs(5),
            vision_max_tokens: 300,
            nudge_max_tokens: 150,
        }
    }

    fn completion(text: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": text } }]
        })
    }

    async fn client_for(mock_server: &MockServer, config: OpenAiClientConfig) -> OpenAiClient {
        OpenAiClient::with_base_url(config, mock_server.uri()).expect("Failed to create client")
    }

    #[tokio::test]
    async fn test_describe_image_sends_vision_request() {
        let mock_server = MockServer::start().await;
        let client = client_for(&mock_server, test_config("test-key")).await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_json(serde_json::json!({
                "model": "vision-test",
                "messages": [{
                    "role": "user",
                    "content": [
                        { "type": "text", "text": "describe" },
                        { "type": "image_url", "image_url": {
                            "url": "data:image/png;base64,AAAA",
                            "detail": "low"
                        } }
                    ]
                }],
                "max_tokens": 300
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("an editor")))
            .mount(&mock_server)
            .await;

        let text = client
            .describe_image("describe", "data:image/png;base64,AAAA")
            .await
            .unwrap();
        assert_eq!(text, "an editor");
    }

    #[tokio::test]
    async fn test_complete_sends_system_and_user_messages() {
        let mock_server = MockServer::start().await;
        let client = client_for(&mock_server, test_config("test-key")).await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_json(serde_json::json!({
                "model": "reasoning-test",
                "messages": [
                    { "role": "system", "content": "sys" },
                    { "role": "user", "content": "usr" }
                ],
                "max_tokens": 150
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("null")))
            .mount(&mock_server)
            .await;

        assert_eq!(client.complete("sys", "usr").await.unwrap(), "null");
    }

    #[tokio::test]
    async fn test_429_is_rate_limit() {
        let mock_server = MockServer::start().await;
        let client = client_for(&mock_server, test_config("test-key")).await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": { "message": "Rate limit reached", "type": "requests" }
            })))
            .mount(&mock_server)
            .await;

        let err = client.complete("s", "u").await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimited { ref message } if message == "Rate limit reached"));
        assert_eq!(classify(&err), FailureKind::RateLimit);
    }

    #[tokio::test]
    async fn test_error_envelope_is_other_api_error() {
        let mock_server = MockServer::start().await;
        let client = client_for(&mock_server, test_config("test-key")).await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": { "message": "The server had an error", "type": "server_error" }
            })))
            .mount(&mock_server)
            .await;

        let err = client.complete("s", "u").await.unwrap_err();
        match &err {
            LlmError::Api { code, message } => {
                assert_eq!(*code, 500);
                assert_eq!(message, "The server had an error");
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
        assert_eq!(classify(&err), FailureKind::OtherApiError);
    }

    #[tokio::test]
    async fn test_unrecognised_error_body_is_non_retryable() {
        let mock_server = MockServer::start().await;
        let client = client_for(&mock_server, test_config("test-key")).await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
            .mount(&mock_server)
            .await;

        let err = client.complete("s", "u").await.unwrap_err();
        assert!(matches!(err, LlmError::UnexpectedStatus { code: 502, .. }));
        assert_eq!(classify(&err), FailureKind::NonRetryable);
    }

    #[tokio::test]
    async fn test_slow_response_is_timeout() {
        let mock_server = MockServer::start().await;
        let mut config = test_config("test-key");
        config.timeout = Duration::from_millis(100);
        let client = client_for(&mock_server, config).await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion("late"))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&mock_server)
            .await;

        let err = client.complete("s", "u").await.unwrap_err();
        assert_eq!(classify(&err), FailureKind::Timeout, "got {:?}", err);
    }

    #[tokio::test]
    async fn test_empty_choices_is_missing_completion() {
        let mock_server = MockServer::start().await;
        let client = client_for(&mock_server, test_config("test-key")).await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": []
            })))
            .mount(&mock_server)
            .await;

        let err = client.complete("s", "u").await.unwrap_err();
        assert!(matches!(err, LlmError::MissingCompletion));
        assert_eq!(classify(&err), FailureKind::NonRetryable);
    }

    #[test]
    fn test_executor_deadline_is_timeout() {
        let err = LlmError::from(CallTimedOut {
            limit: Duration::from_secs(30),
        });
        assert_eq!(classify(&err), FailureKind::Timeout);
        assert_eq!(err.to_string(), "call exceeded its 30000ms deadline");
    }

    #[test]
    fn test_missing_api_key_rejected() {
        match OpenAiClient::new(test_config("")) {
            Err(LlmError::MissingApiKey) => {}
            other => panic!("Expected MissingApiKey, got {:?}", other.map(|_| ())),
        }
    }
}
