//! Model provider abstraction.
//!
//! The chat service talks to the model through [`Provider`], so tests can
//! substitute a scripted provider for the Gemini client.

mod gemini;

pub use gemini::{GeminiProvider, GEMINI_API_BASE};

use crate::session::Turn;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Reply text arriving piece by piece.
pub type FragmentStream = BoxStream<'static, Result<String, ProviderError>>;

// ============================================================================
// Provider Trait
// ============================================================================

/// Interface to a chat model.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &str;

    /// Send the conversation and wait for the whole reply.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Send the conversation and receive the reply as fragments.
    ///
    /// The stream ends when the model is done. Cancelling `cancel` stops
    /// the upstream request and ends the stream without a final item.
    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, ProviderError>;
}

/// Error from a provider.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub provider: String,
    pub model: String,
    pub message: String,
    pub status_code: Option<u16>,
}

impl ProviderError {
    pub fn new(provider: &str, model: &str, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.provider, self.model, self.message)
    }
}

impl std::error::Error for ProviderError {}

impl From<ProviderError> for tutor_common::Error {
    fn from(e: ProviderError) -> Self {
        Self::External(e.to_string())
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// One turn of the conversation sent to the model.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model to use
    pub model: String,
    /// Stored history, seed pair first
    pub history: Vec<Turn>,
    /// The new user message
    pub message: String,
    /// Maximum tokens to generate
    pub max_tokens: Option<i64>,
    /// Sampling temperature
    pub temperature: Option<f64>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, history: Vec<Turn>, message: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            history,
            message: message.into(),
            max_tokens: None,
            temperature: None,
        }
    }

    /// History followed by the new user message.
    pub fn turns(&self) -> impl Iterator<Item = Turn> + '_ {
        self.history
            .iter()
            .cloned()
            .chain(std::iter::once(Turn::user(self.message.clone())))
    }
}

/// Complete reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Provider name
    pub provider: String,
    /// Model used
    pub model: String,
    /// Response content
    pub content: String,
    /// Token usage
    pub usage: TokenUsage,
    /// Finish reason
    pub finish_reason: Option<String>,
    /// Response latency in milliseconds
    pub latency_ms: u64,
}

/// Token usage information.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}
