//! Text-generation service boundary.
//!
//! Stages never talk to a provider directly: they build a typed
//! [`GenerationRequest`] and hand it to a [`TextGenerator`]. The production
//! implementation, [`LlmGenerator`], adapts any `edgequake_llm` provider;
//! tests substitute deterministic stubs.
//!
//! ## Message layout
//!
//! 1. **System message**: the stage's system prompt
//! 2. **User message**: the stage prompt, with the page PNG attached when the
//!    stage re-references the visual source

use crate::config::ConversionConfig;
use crate::error::GenerationServiceError;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, LlmError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// One call to the generation service.
#[derive(Clone)]
pub struct GenerationRequest {
    pub model_id: String,
    pub system: String,
    pub prompt: String,
    pub image: Option<ImageData>,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl std::fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("model_id", &self.model_id)
            .field("prompt_chars", &self.prompt.len())
            .field("has_image", &self.image.is_some())
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl GenerationRequest {
    pub fn new(
        model_id: impl Into<String>,
        system: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            system: system.into(),
            prompt: prompt.into(),
            image: None,
            temperature: 0.1,
            max_tokens: 8192,
        }
    }

    pub fn with_image(mut self, image: Option<ImageData>) -> Self {
        self.image = image;
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: usize) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Reject requests no backend could serve.
    pub fn validate(&self) -> Result<(), GenerationServiceError> {
        if self.model_id.trim().is_empty() {
            return Err(GenerationServiceError::InvalidRequest(
                "model id is empty".into(),
            ));
        }
        if self.prompt.trim().is_empty() {
            return Err(GenerationServiceError::InvalidRequest(
                "prompt is empty".into(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(GenerationServiceError::InvalidRequest(
                "max_tokens must be ≥ 1".into(),
            ));
        }
        Ok(())
    }
}

/// Model and sampling parameters shared by every stage of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub model_id: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl ModelSettings {
    pub fn from_config(config: &ConversionConfig) -> Self {
        Self {
            model_id: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    /// Build a request for one stage call.
    pub fn request(
        &self,
        system: &str,
        prompt: String,
        image: Option<&ImageData>,
    ) -> GenerationRequest {
        GenerationRequest::new(self.model_id.as_str(), system, prompt)
            .with_image(image.cloned())
            .with_sampling(self.temperature, self.max_tokens)
    }
}

/// `generate(model_id, prompt, optional image) -> text`.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationServiceError>;
}

/// [`TextGenerator`] backed by an `edgequake_llm` provider.
pub struct LlmGenerator {
    provider: Arc<dyn LLMProvider>,
    timeout: Duration,
}

impl LlmGenerator {
    pub fn new(provider: Arc<dyn LLMProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }
}

#[async_trait]
impl TextGenerator for LlmGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationServiceError> {
        request.validate()?;

        let user = match request.image {
            Some(ref image) => ChatMessage::user_with_images(request.prompt.as_str(), vec![image.clone()]),
            None => ChatMessage::user(request.prompt.as_str()),
        };
        let messages = vec![ChatMessage::system(request.system.as_str()), user];

        let options = CompletionOptions {
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
            ..Default::default()
        };

        let start = Instant::now();
        let response = tokio::time::timeout(self.timeout, self.provider.chat(&messages, Some(&options)))
            .await
            .map_err(|_| {
                GenerationServiceError::ServiceUnavailable(format!(
                    "request timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| classify_error(&e))?;

        debug!(
            "{}: {} input tokens, {} output tokens, {:?}",
            request.model_id,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        Ok(response.content)
    }
}

/// Map a provider error onto the boundary taxonomy.
///
/// Only errors that cannot succeed on a resend become `InvalidRequest`;
/// everything transient stays retryable.
pub fn classify_error(err: &LlmError) -> GenerationServiceError {
    match err {
        LlmError::RateLimited(_) => GenerationServiceError::RateLimited { retry_after: None },
        LlmError::InvalidRequest(_)
        | LlmError::AuthError(_)
        | LlmError::ModelNotFound(_)
        | LlmError::ConfigError(_)
        | LlmError::NotSupported(_)
        | LlmError::TokenLimitExceeded { .. } => {
            GenerationServiceError::InvalidRequest(err.to_string())
        }
        LlmError::ApiError(message) => classify_api_status(message),
        LlmError::Timeout
        | LlmError::NetworkError(_)
        | LlmError::ProviderError(_)
        | LlmError::SerializationError(_)
        | LlmError::Unknown(_) => GenerationServiceError::ServiceUnavailable(err.to_string()),
    }
}

static RE_HTTP_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([45]\d\d)\b").unwrap());

/// `ApiError` carries the provider's raw message; the HTTP status in it, if
/// any, decides. 408 and 5xx are transient, other 4xx are not.
fn classify_api_status(message: &str) -> GenerationServiceError {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("too many requests") {
        return GenerationServiceError::RateLimited { retry_after: None };
    }
    let status = RE_HTTP_STATUS
        .captures(message)
        .and_then(|c| c[1].parse::<u16>().ok());
    match status {
        Some(429) => GenerationServiceError::RateLimited { retry_after: None },
        Some(408) => GenerationServiceError::ServiceUnavailable(message.to_string()),
        Some(code) if (400..500).contains(&code) => {
            GenerationServiceError::InvalidRequest(message.to_string())
        }
        _ => GenerationServiceError::ServiceUnavailable(message.to_string()),
    }
}
