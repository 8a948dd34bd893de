//! LLM provider client.
//!
//! Speaks to an OpenAI-compatible `/chat/completions` endpoint. Transient
//! provider errors (429 and 5xx) are retried with exponential backoff and
//! jitter up to a configured attempt budget; everything else fails fast.
//! The [`LlmClient`] trait is the seam the worker handler depends on, so
//! tests can substitute a scripted provider.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One generated completion, with whatever usage accounting the provider
/// reported.
#[derive(Debug, Clone)]
pub struct Generation {
    pub output_text: String,
    pub model_name: Option<String>,
    pub prompt_tokens: Option<i32>,
    pub completion_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

/// Errors from the provider client.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM API key is not configured")]
    MissingApiKey,

    #[error("LLM request failed with retryable status {status}: {body}")]
    RetryableStatus { status: u16, body: String },

    #[error("LLM request failed with status {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("LLM request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("LLM response is missing generated content")]
    EmptyResponse,

    #[error("LLM request failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

impl LlmError {
    /// Stable category name recorded as `error_type` on failed attempts.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingApiKey => "MissingApiKey",
            Self::RetryableStatus { .. } => "RetryableStatus",
            Self::BadStatus { .. } => "BadStatus",
            Self::Request(_) => "RequestError",
            Self::EmptyResponse => "EmptyResponse",
            Self::Exhausted { .. } => "LlmError",
        }
    }
}

/// Provider seam used by the worker handler.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a completion for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<Generation, LlmError>;
}

// Compile-time assertion: LlmClient must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn LlmClient) {}
};

/// Configuration for [`ChatClient`].
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible API (no trailing slash needed).
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    /// Total attempts, including the first (minimum 1).
    pub retry_attempts: u32,
    /// Base backoff; doubled per attempt, with jitter.
    pub retry_backoff: Duration,
}

impl LlmConfig {
    /// Build a config from `HERON_LLM_*` environment variables.
    pub fn from_env() -> Self {
        let get = |key: &str| env::var(key).ok();
        Self {
            base_url: get("HERON_LLM_BASE_URL")
                .unwrap_or_else(|| "https://integrate.api.nvidia.com/v1".to_string()),
            api_key: get("HERON_LLM_API_KEY").unwrap_or_default(),
            model: get("HERON_LLM_MODEL")
                .unwrap_or_else(|| "meta/llama-3.1-8b-instruct".to_string()),
            temperature: get("HERON_LLM_TEMPERATURE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.2),
            max_tokens: get("HERON_LLM_MAX_TOKENS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1024),
            timeout: Duration::from_secs(
                get("HERON_LLM_TIMEOUT_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
            retry_attempts: get("HERON_LLM_RETRY_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3)
                .max(1),
            retry_backoff: Duration::from_millis(
                get("HERON_LLM_RETRY_BACKOFF_MS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(500),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    total_tokens: Option<i64>,
}

fn to_non_negative_i32(value: Option<i64>) -> Option<i32> {
    value.filter(|v| *v >= 0).and_then(|v| i32::try_from(v).ok())
}

fn parse_response(response: ChatResponse) -> Result<Generation, LlmError> {
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message)
        .and_then(|message| message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or(LlmError::EmptyResponse)?;

    let usage = response.usage.unwrap_or(ChatUsage {
        prompt_tokens: None,
        completion_tokens: None,
        total_tokens: None,
    });

    Ok(Generation {
        output_text: content,
        model_name: response.model,
        prompt_tokens: to_non_negative_i32(usage.prompt_tokens),
        completion_tokens: to_non_negative_i32(usage.completion_tokens),
        total_tokens: to_non_negative_i32(usage.total_tokens),
    })
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// reqwest-backed [`LlmClient`] for OpenAI-compatible chat completion APIs.
pub struct ChatClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl ChatClient {
    pub fn new(config: LlmConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("failed to build HTTP client");
        Self { config, http }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    async fn attempt(&self, prompt: &str) -> Result<Generation, LlmError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(self.config.api_key.trim())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504) {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::RetryableStatus {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }

        let payload: ChatResponse = response.json().await?;
        parse_response(payload)
    }
}

#[async_trait::async_trait]
impl LlmClient for ChatClient {
    async fn generate(&self, prompt: &str) -> Result<Generation, LlmError> {
        if self.config.api_key.trim().is_empty() {
            return Err(LlmError::MissingApiKey);
        }

        let max_attempts = self.config.retry_attempts;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.attempt(prompt).await {
                Ok(generation) => return Ok(generation),
                // Non-retryable failures propagate immediately.
                Err(err @ (LlmError::BadStatus { .. } | LlmError::EmptyResponse)) => {
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        error = %err,
                        "LLM request attempt failed"
                    );
                    last_error = Some(err);
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(backoff_with_jitter(self.config.retry_backoff, attempt)).await;
            }
        }

        Err(LlmError::Exhausted {
            attempts: max_attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

/// Exponential backoff (`base * 2^(attempt-1)`) with up to 25% jitter.
fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    use rand::Rng;

    let exp = base.saturating_mul(1u32 << (attempt - 1).min(16));
    let jitter = rand::rng().random_range(0.0..0.25);
    exp.mul_f64(1.0 + jitter)
}
