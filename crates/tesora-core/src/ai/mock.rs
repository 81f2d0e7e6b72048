//! Mock AI backend for testing
//!
//! Responses are served from a FIFO queue first, then from an optional
//! responder closure. Every request is recorded so tests can assert on
//! the exact prompts the pipeline sent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::{AIBackend, GenerateRequest, Generation};

type Responder = dyn Fn(&GenerateRequest) -> Result<Generation> + Send + Sync;

#[derive(Clone, Default)]
pub struct MockBackend {
    pub healthy: bool,
    queue: Arc<Mutex<VecDeque<std::result::Result<Generation, String>>>>,
    responder: Option<Arc<Responder>>,
    requests: Arc<Mutex<Vec<GenerateRequest>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            healthy: true,
            ..Default::default()
        }
    }

    pub fn unhealthy() -> Self {
        Self {
            healthy: false,
            ..Default::default()
        }
    }

    /// Answer every unqueued request with `f`
    pub fn with_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&GenerateRequest) -> Result<Generation> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(f));
        self
    }

    pub fn push_response(&self, text: impl Into<String>) {
        self.push(Ok(Generation::complete(text)));
    }

    /// Queue a response that reports hitting the token limit
    pub fn push_truncated(&self, text: impl Into<String>) {
        self.push(Ok(Generation::truncated(text)));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.push(Err(message.into()));
    }

    fn push(&self, item: std::result::Result<Generation, String>) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(item);
        }
    }

    /// Requests received so far, in order
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl AIBackend for MockBackend {
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let queued = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        match queued {
            Some(Ok(generation)) => Ok(generation),
            Some(Err(message)) => Err(Error::Ai(message)),
            None => match &self.responder {
                Some(responder) => responder(request),
                None => Err(Error::Ai("mock backend has no scripted response".into())),
            },
        }
    }

    async fn health_check(&self) -> bool {
        self.healthy
    }

    fn model(&self) -> &str {
        "mock"
    }

    fn host(&self) -> &str {
        "mock://localhost"
    }
}
