//! The LLM provider seam.
//!
//! Provider HTTP adapters live outside the core; the dispatcher only
//! knows this trait. Transport failures are retried with jittered
//! backoff up to the configured cap; anything else surfaces as a
//! `PROVIDER_ERROR`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use warden_core::retry::{RetryConfig, retry};

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user`, or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

/// A chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Conversation so far.
    pub messages: Vec<ChatMessage>,
    /// Model override.
    #[serde(default)]
    pub model: Option<String>,
    /// Completion token cap.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Stream deltas instead of one response.
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    /// Crude token estimate for rate limiting (chars / 4).
    #[must_use]
    pub fn estimated_tokens(&self) -> u64 {
        let chars: usize = self.messages.iter().map(|m| m.content.len()).sum();
        let estimate = chars.div_euclid(4);
        u64::try_from(estimate.max(1)).unwrap_or(1)
    }
}

/// A chat completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Completion text.
    pub content: String,
    /// Model that produced it.
    pub model: String,
    /// Prompt tokens consumed.
    pub input_tokens: u64,
    /// Completion tokens produced.
    pub output_tokens: u64,
}

/// A provider failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ProviderFailure {
    /// Whether a retry could help (transport/HTTP-level failures).
    pub retryable: bool,
    /// Failure text.
    pub message: String,
}

impl ProviderFailure {
    /// A retryable transport failure.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    /// A permanent failure.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

/// The provider interface the dispatcher routes chat through.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logs and metrics.
    fn name(&self) -> &str;

    /// One-shot completion.
    ///
    /// # Errors
    ///
    /// [`ProviderFailure`] on transport or API failure.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderFailure>;

    /// Streaming completion: returns a channel of content deltas.
    /// The channel closing marks the end of the stream.
    ///
    /// # Errors
    ///
    /// [`ProviderFailure`] when the stream cannot be started.
    async fn stream(
        &self,
        request: &ChatRequest,
    ) -> Result<mpsc::Receiver<String>, ProviderFailure>;
}

/// Run `complete` with the retry policy applied.
///
/// # Errors
///
/// The final [`ProviderFailure`] once retries are exhausted or the
/// failure is permanent.
pub async fn complete_with_retry(
    provider: &dyn LlmProvider,
    request: &ChatRequest,
    config: &RetryConfig,
) -> Result<ChatResponse, ProviderFailure> {
    retry(
        config,
        provider.name(),
        |e: &ProviderFailure| e.retryable,
        || provider.complete(request),
    )
    .await
}

/// Development/test provider: echoes the last user message.
#[derive(Debug, Default)]
pub struct EchoProvider {
    /// When set, fail this many times before succeeding.
    failures_before_success: std::sync::atomic::AtomicU32,
}

impl EchoProvider {
    /// Always-succeeding echo provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo provider that fails (retryably) `n` times first.
    #[must_use]
    pub fn failing(n: u32) -> Self {
        Self {
            failures_before_success: std::sync::atomic::AtomicU32::new(n),
        }
    }

    fn reply_for(request: &ChatRequest) -> ChatResponse {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        ChatResponse {
            content: format!("echo: {last_user}"),
            model: request.model.clone().unwrap_or_else(|| "echo-1".to_string()),
            input_tokens: request.estimated_tokens(),
            output_tokens: u64::try_from(last_user.len().div_euclid(4).max(1)).unwrap_or(1),
        }
    }
}

#[async_trait]
impl LlmProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderFailure> {
        let remaining = self
            .failures_before_success
            .load(std::sync::atomic::Ordering::SeqCst);
        if remaining > 0 {
            self.failures_before_success
                .store(remaining.saturating_sub(1), std::sync::atomic::Ordering::SeqCst);
            return Err(ProviderFailure::transport("simulated transport failure"));
        }
        Ok(Self::reply_for(request))
    }

    async fn stream(
        &self,
        request: &ChatRequest,
    ) -> Result<mpsc::Receiver<String>, ProviderFailure> {
        let response = Self::reply_for(request);
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            // Word-by-word deltas, like a real token stream.
            for word in response.content.split_inclusive(' ') {
                if tx.send(word.to_string()).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}
