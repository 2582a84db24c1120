//! Generator that replays queued answers. For tests and local development.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::generator::{FeedbackGenerator, GenerationRequest, GenerationResponse};
use crate::result::AiError;

/// Answers from a queue, then falls back to a fixed answer.
#[derive(Debug)]
pub struct ScriptedGenerator {
    queue: Mutex<VecDeque<Result<JsonValue, AiError>>>,
    fallback: Result<JsonValue, AiError>,
    configured: bool,
    delay: Duration,
    calls: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    /// Always answers with `fields`.
    pub fn answering(fields: JsonValue) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Ok(fields),
            configured: true,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always fails with `error`.
    pub fn failing(error: AiError) -> Self {
        Self {
            fallback: Err(error),
            ..Self::answering(JsonValue::Null)
        }
    }

    /// Reports itself as missing credentials.
    pub fn unconfigured() -> Self {
        Self {
            configured: false,
            ..Self::answering(JsonValue::Null)
        }
    }

    /// Queue one answer ahead of the fallback.
    pub fn then(self, answer: Result<JsonValue, AiError>) -> Self {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).push_back(answer);
        self
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Requests received so far.
    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl FeedbackGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, AiError> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
            .map(|fields| GenerationResponse::new(fields).with_model("scripted-1"))
    }
}
