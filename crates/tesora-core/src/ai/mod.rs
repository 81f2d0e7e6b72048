//! AI backend abstraction
//!
//! The pipeline treats the language model as a black box that turns a
//! prompt into text. Backends:
//! - `ollama` - local Ollama server (`/api/generate`)
//! - `openai_compatible` - any `/v1/chat/completions` endpoint
//! - `mock` - scripted responses for tests
//!
//! Every call names a [`TaskType`] so the model router can pick the model,
//! timeout, and output token budget for that pipeline step.

mod mock;
mod ollama;
mod openai_compatible;
pub mod parsing;

use async_trait::async_trait;

use crate::error::Result;
use crate::model_router::TaskType;

pub use mock::MockBackend;
pub use ollama::OllamaBackend;
pub use openai_compatible::OpenAICompatibleBackend;

/// A single text generation call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub task: TaskType,
    pub system: Option<String>,
    pub prompt: String,
    /// Ask the backend to constrain output to a JSON object
    pub json_object: bool,
}

impl GenerateRequest {
    pub fn new(task: TaskType, prompt: impl Into<String>) -> Self {
        Self {
            task,
            system: None,
            prompt: prompt.into(),
            json_object: false,
        }
    }

    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system;
        self
    }

    pub fn json_object(mut self) -> Self {
        self.json_object = true;
        self
    }
}

/// Backend output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    /// The output hit the token limit and is probably cut mid-document
    pub truncated: bool,
}

impl Generation {
    pub fn complete(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            truncated: false,
        }
    }

    pub fn truncated(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            truncated: true,
        }
    }
}

/// Trait for AI backends
#[async_trait]
pub trait AIBackend: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation>;

    async fn health_check(&self) -> bool;

    /// Default model name
    fn model(&self) -> &str;

    fn host(&self) -> &str;
}

/// AI client that dispatches to the configured backend
#[derive(Clone)]
pub enum AIClient {
    Ollama(OllamaBackend),
    OpenAICompatible(OpenAICompatibleBackend),
    Mock(MockBackend),
}

impl AIClient {
    /// Create an AI client from environment variables
    ///
    /// `AI_BACKEND` selects `ollama` (default) or `openai_compatible`.
    /// Returns `None` when the selected backend has no host configured.
    pub fn from_env() -> Option<Self> {
        let backend = std::env::var("AI_BACKEND").unwrap_or_else(|_| "ollama".to_string());

        match backend.to_lowercase().as_str() {
            "ollama" => OllamaBackend::from_env().map(AIClient::Ollama),
            "openai_compatible" | "openai" => {
                OpenAICompatibleBackend::from_env().map(AIClient::OpenAICompatible)
            }
            _ => {
                tracing::warn!(
                    backend = %backend,
                    "Unknown AI_BACKEND value, falling back to ollama"
                );
                OllamaBackend::from_env().map(AIClient::Ollama)
            }
        }
    }

    pub fn mock(backend: MockBackend) -> Self {
        AIClient::Mock(backend)
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            AIClient::Ollama(_) => "ollama",
            AIClient::OpenAICompatible(_) => "openai_compatible",
            AIClient::Mock(_) => "mock",
        }
    }
}

#[async_trait]
impl AIBackend for AIClient {
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation> {
        match self {
            AIClient::Ollama(b) => b.generate(request).await,
            AIClient::OpenAICompatible(b) => b.generate(request).await,
            AIClient::Mock(b) => b.generate(request).await,
        }
    }

    async fn health_check(&self) -> bool {
        match self {
            AIClient::Ollama(b) => b.health_check().await,
            AIClient::OpenAICompatible(b) => b.health_check().await,
            AIClient::Mock(b) => b.health_check().await,
        }
    }

    fn model(&self) -> &str {
        match self {
            AIClient::Ollama(b) => b.model(),
            AIClient::OpenAICompatible(b) => b.model(),
            AIClient::Mock(b) => b.model(),
        }
    }

    fn host(&self) -> &str {
        match self {
            AIClient::Ollama(b) => b.host(),
            AIClient::OpenAICompatible(b) => b.host(),
            AIClient::Mock(b) => b.host(),
        }
    }
}
