//! OpenAI chat-completions provider.
//!
//! ## Security
//!
//! The API key is held in an [`ApiCredential`] and only exposed when the
//! `Authorization` header is built.

use super::{
    factory::ProviderFactory,
    secrets::{ApiCredential, CredentialSource},
    ChatMessage, CompletionConfig, CompletionResponse, LlmProvider, ProviderError,
};
use async_trait::async_trait;
use casegrade_core::TokenUsage;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable holding the OpenAI API key.
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI chat-completions provider.
pub struct OpenAiProvider {
    credential: ApiCredential,
    base_url: String,
    organization: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .field("organization", &self.organization)
            .finish()
    }
}

impl OpenAiProvider {
    /// Create a provider with an explicit API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_credential(ApiCredential::new(
            api_key,
            CredentialSource::Programmatic,
            "OpenAI API key",
        ))
    }

    /// Create from `OPENAI_API_KEY`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let credential = ApiCredential::from_env(OPENAI_API_KEY_ENV, "OpenAI API key")?;
        Ok(Self::with_credential(credential))
    }

    /// Create from JSON configuration, falling back to `OPENAI_API_KEY`.
    ///
    /// Recognized keys: `api_key`, `base_url`, `organization`.
    pub fn from_config(config: &JsonValue) -> Result<Self, ProviderError> {
        let credential = ApiCredential::from_config_or_env(
            config,
            "api_key",
            OPENAI_API_KEY_ENV,
            "OpenAI API key",
        )?;

        let mut provider = Self::with_credential(credential);
        if let Some(url) = config.get("base_url").and_then(JsonValue::as_str) {
            provider.base_url = url.trim_end_matches('/').to_string();
        }
        provider.organization = config
            .get("organization")
            .and_then(JsonValue::as_str)
            .map(str::to_string);

        Ok(provider)
    }

    fn with_credential(credential: ApiCredential) -> Self {
        Self {
            credential,
            base_url: DEFAULT_BASE_URL.to_string(),
            organization: None,
            client: reqwest::Client::new(),
        }
    }

    /// Set custom base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    model: Option<String>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl From<ApiUsage> for TokenUsage {
    fn from(usage: ApiUsage) -> Self {
        TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage
                .total_tokens
                .unwrap_or(usage.prompt_tokens.saturating_add(usage.completion_tokens)),
        }
    }
}

fn into_completion(body: ChatResponse) -> CompletionResponse {
    let (content, stop_reason) = body
        .choices
        .into_iter()
        .next()
        .map(|choice| (choice.message.content.unwrap_or_default(), choice.finish_reason))
        .unwrap_or_default();

    CompletionResponse {
        content,
        usage: body.usage.map(TokenUsage::from),
        model: body.model,
        stop_reason,
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        config: &CompletionConfig,
    ) -> Result<CompletionResponse, ProviderError> {
        let request = ChatRequest {
            model: &config.model,
            messages: &messages,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.credential.expose())
            .timeout(config.timeout)
            .json(&request);
        if let Some(org) = &self.organization {
            builder = builder.header("OpenAI-Organization", org);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(config.timeout)
            } else {
                ProviderError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
        }

        if status.as_u16() == 401 {
            return Err(ProviderError::AuthError);
        }

        if !status.is_success() {
            let message = match response.json::<ApiErrorBody>().await {
                Ok(body) => body.error.message,
                Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
            };
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        Ok(into_completion(body))
    }

    async fn health_check(&self) -> bool {
        !self.credential.is_empty()
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// Factory for [`OpenAiProvider`].
///
/// ## Configuration Format
/// ```json
/// {
///   "api_key": "sk-...",            // Optional, falls back to OPENAI_API_KEY
///   "base_url": "https://...",      // Optional, custom endpoint
///   "organization": "org-..."       // Optional
/// }
/// ```
pub struct OpenAiProviderFactory;

impl ProviderFactory for OpenAiProviderFactory {
    fn provider_type(&self) -> &'static str {
        "openai"
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        Ok(Arc::new(OpenAiProvider::from_config(config)?))
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), ProviderError> {
        if !ApiCredential::is_available(config, "api_key", OPENAI_API_KEY_ENV) {
            return Err(ProviderError::NotConfigured(format!(
                "OpenAI API key required: set 'api_key' in config or {} env",
                OPENAI_API_KEY_ENV
            )));
        }

        if let Some(url) = config.get("base_url").and_then(JsonValue::as_str) {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ProviderError::NotConfigured(
                    "base_url must start with http:// or https://".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn default_config(&self) -> JsonValue {
        serde_json::json!({ "base_url": DEFAULT_BASE_URL })
    }

    fn description(&self) -> &'static str {
        "OpenAI chat-completions provider"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_not_in_debug_output() {
        let secret = "sk-proj-very-secret";
        let provider = OpenAiProvider::new(secret);
        let debug = format!("{:?}", provider);

        assert!(!debug.contains(secret));
        assert!(debug.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_health_check_requires_key() {
        assert!(OpenAiProvider::new("sk-test").health_check().await);
        assert!(!OpenAiProvider::new("").health_check().await);
    }

    #[test]
    fn test_from_config() {
        let config = serde_json::json!({
            "api_key": "config-key",
            "base_url": "https://proxy.internal/v1/",
            "organization": "org-42"
        });

        let provider = OpenAiProvider::from_config(&config).unwrap();
        assert_eq!(provider.base_url, "https://proxy.internal/v1");
        assert_eq!(provider.organization.as_deref(), Some("org-42"));
        assert_eq!(provider.credential.source(), CredentialSource::Config);
    }

    #[test]
    fn test_factory_rejects_bad_base_url() {
        let config = serde_json::json!({"api_key": "k", "base_url": "ftp://nope"});
        assert!(OpenAiProviderFactory.validate_config(&config).is_err());
    }

    #[test]
    fn test_response_mapping() {
        let body: ChatResponse = serde_json::from_value(serde_json::json!({
            "model": "gpt-4o-2024-08-06",
            "choices": [{"message": {"content": "{\"criteria\": []}"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1200, "completion_tokens": 300, "total_tokens": 1500}
        }))
        .unwrap();

        let response = into_completion(body);
        assert_eq!(response.content, "{\"criteria\": []}");
        assert_eq!(response.model.as_deref(), Some("gpt-4o-2024-08-06"));
        assert_eq!(response.stop_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.unwrap().total_tokens, 1500);
    }

    #[test]
    fn test_response_without_usage_or_choices() {
        let body: ChatResponse =
            serde_json::from_value(serde_json::json!({"choices": []})).unwrap();
        let response = into_completion(body);
        assert!(response.content.is_empty());
        assert!(response.usage.is_none());
        assert!(response.model.is_none());
    }

    #[test]
    fn test_missing_total_tokens_saturates() {
        let body: ChatResponse = serde_json::from_value(serde_json::json!({
            "choices": [],
            "usage": {"prompt_tokens": u32::MAX, "completion_tokens": 5}
        }))
        .unwrap();
        assert_eq!(into_completion(body).usage.unwrap().total_tokens, u32::MAX);
    }
}
