//! Ollama backend implementation
//!
//! HTTP client for the Ollama `/api/generate` endpoint. Uses the model router
//! for per-task model, timeout, and `num_predict` budget.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model_router::ModelRouter;

use super::{AIBackend, GenerateRequest, Generation};

/// Ollama backend with model router integration
#[derive(Clone)]
pub struct OllamaBackend {
    http_client: Client,
    base_url: String,
    router: Arc<RwLock<ModelRouter>>,
    default_model: String,
}

impl OllamaBackend {
    pub fn new(base_url: &str, default_model: &str) -> Self {
        Self::with_router(base_url, default_model, ModelRouter::default())
    }

    pub fn with_router(base_url: &str, default_model: &str, router: ModelRouter) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            router: Arc::new(RwLock::new(router)),
            default_model: default_model.to_string(),
        }
    }

    /// Create from `OLLAMA_HOST` / `OLLAMA_MODEL`
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("OLLAMA_HOST").ok()?;
        let model = std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llama3.2".to_string());
        Some(Self::new(&host, &model))
    }
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    /// "stop" or "length"
    #[serde(default)]
    done_reason: Option<String>,
}

#[async_trait]
impl AIBackend for OllamaBackend {
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation> {
        let (model, config) = {
            let router = self
                .router
                .read()
                .map_err(|_| Error::Ai("Failed to acquire model router lock".into()))?;
            (
                router.model_for_task(request.task).to_string(),
                router.config_for_task(request.task),
            )
        };

        let body = OllamaRequest {
            model: &model,
            prompt: &request.prompt,
            system: request.system.as_deref(),
            stream: false,
            format: request.json_object.then_some("json"),
            options: OllamaOptions {
                temperature: 0.1,
                num_predict: config.max_tokens,
            },
        };

        let mut last_error = None;
        for attempt in 0..=config.max_retries {
            let result = self
                .http_client
                .post(format!("{}/api/generate", self.base_url))
                .timeout(config.timeout)
                .json(&body)
                .send()
                .await
                .and_then(|r| r.error_for_status());

            match result {
                Ok(response) => {
                    let parsed: OllamaResponse = response.json().await?;
                    if let Ok(mut router) = self.router.write() {
                        router.record_success(&model);
                    }
                    let truncated = parsed.done_reason.as_deref() == Some("length");
                    debug!(
                        task = request.task.as_str(),
                        model = %model,
                        chars = parsed.response.len(),
                        truncated,
                        "Ollama response"
                    );
                    return Ok(Generation {
                        text: parsed.response,
                        truncated,
                    });
                }
                Err(e) => {
                    warn!(
                        task = request.task.as_str(),
                        model = %model,
                        attempt,
                        error = %e,
                        "Ollama call failed"
                    );
                    if let Ok(mut router) = self.router.write() {
                        router.record_failure(&model);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.map(Error::Http).unwrap_or_else(|| {
            Error::Ai(format!("Ollama call for {} made no attempts", request.task.as_str()))
        }))
    }

    async fn health_check(&self) -> bool {
        match self
            .http_client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn model(&self) -> &str {
        &self.default_model
    }

    fn host(&self) -> &str {
        &self.base_url
    }
}
