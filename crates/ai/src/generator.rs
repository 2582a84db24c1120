use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::result::AiError;

/// Which kind of feedback is being requested.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackTask {
    /// Feedback on a single completed session.
    Session,
    /// Summary feedback over a period of activity.
    Period,
}

impl FeedbackTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackTask::Session => "session",
            FeedbackTask::Period => "period",
        }
    }
}

/// Structured request sent to a [`FeedbackGenerator`].
///
/// `context` is whatever the pipeline gathered from its context providers;
/// `response_shape` describes the JSON object the generator must answer with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub task: FeedbackTask,
    pub context: JsonValue,
    pub response_shape: JsonValue,
}

impl GenerationRequest {
    pub fn new(task: FeedbackTask, context: JsonValue, response_shape: JsonValue) -> Self {
        Self {
            task,
            context,
            response_shape,
        }
    }
}

/// Raw structured answer. Not yet validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub fields: JsonValue,
    /// Model that produced the answer, when the service reports it.
    pub model: Option<String>,
}

impl GenerationResponse {
    pub fn new(fields: JsonValue) -> Self {
        Self {
            fields,
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Remote feedback-generation service.
///
/// Calls may take seconds and occasionally return malformed output; callers are
/// expected to bound them with their own timeout and validate the result.
#[async_trait]
pub trait FeedbackGenerator: Send + Sync {
    /// Short name used in logs and stored result metadata.
    fn name(&self) -> &str;

    /// Whether the generator has the credentials it needs.
    ///
    /// Background workers skip their tick entirely while this is `false`.
    fn is_configured(&self) -> bool;

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, AiError>;
}
