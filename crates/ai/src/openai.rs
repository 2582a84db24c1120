//! Generator backed by any OpenAI-compatible chat-completions API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::generator::{FeedbackGenerator, GenerationRequest, GenerationResponse};
use crate::result::AiError;

/// Connection settings for [`OpenAiCompatibleGenerator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSettings {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub endpoint: String,
    pub model: String,
    /// Bearer token. `None` (or empty) leaves the generator unconfigured.
    pub api_key: Option<String>,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
        }
    }
}

pub struct OpenAiCompatibleGenerator {
    settings: OpenAiSettings,
    client: reqwest::Client,
}

impl OpenAiCompatibleGenerator {
    pub fn new(settings: OpenAiSettings) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
        }
    }

    fn api_key(&self) -> Option<&str> {
        self.settings
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    fn request_body(&self, request: &GenerationRequest) -> JsonValue {
        let instructions = format!(
            "You write {} feedback for an athlete. Answer with a single JSON object \
             matching this shape and nothing else: {}",
            request.task.as_str(),
            request.response_shape
        );
        json!({
            "model": self.settings.model,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": instructions },
                { "role": "user", "content": request.context.to_string() },
            ],
        })
    }
}

#[async_trait]
impl FeedbackGenerator for OpenAiCompatibleGenerator {
    fn name(&self) -> &str {
        "openai_compatible"
    }

    fn is_configured(&self) -> bool {
        self.api_key().is_some()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, AiError> {
        let api_key = self
            .api_key()
            .ok_or_else(|| AiError::NotConfigured("missing generation api key".to_string()))?;

        let url = format!("{}/chat/completions", self.settings.endpoint.trim_end_matches('/'));
        tracing::debug!(task = request.task.as_str(), model = %self.settings.model, "requesting feedback generation");
        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| AiError::InferenceFailed(format!("connection to {url} failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(AiError::InferenceFailed(format!("api error {status}: {text}")));
        }

        let body: JsonValue = resp
            .json()
            .await
            .map_err(|e| AiError::malformed(format!("response body is not JSON: {e}")))?;

        let content = body["choices"]
            .get(0)
            .and_then(|choice| choice["message"]["content"].as_str())
            .ok_or_else(|| AiError::malformed("no message content in response"))?;

        let mut response = GenerationResponse::new(parse_content(content)?);
        if let Some(model) = body["model"].as_str() {
            response = response.with_model(model);
        }
        Ok(response)
    }
}

/// Parse the message content as JSON, tolerating a surrounding code fence.
fn parse_content(content: &str) -> Result<JsonValue, AiError> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);

    serde_json::from_str(unfenced.trim())
        .map_err(|e| AiError::malformed(format!("message content is not a JSON object: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::FeedbackTask;

    fn request() -> GenerationRequest {
        GenerationRequest::new(FeedbackTask::Session, json!({"session": {}}), json!({"headline": "string"}))
    }

    #[test]
    fn parses_plain_and_fenced_content() {
        assert_eq!(parse_content(r#"{"a": 1}"#).unwrap(), json!({"a": 1}));
        assert_eq!(parse_content("```json\n{\"a\": 1}\n```").unwrap(), json!({"a": 1}));
        assert_eq!(parse_content("```\n{\"a\": 2}\n```").unwrap(), json!({"a": 2}));
        assert!(parse_content("sure! here you go").is_err());
    }

    #[test]
    fn blank_key_means_unconfigured() {
        let generator = OpenAiCompatibleGenerator::new(OpenAiSettings {
            api_key: Some("   ".to_string()),
            ..OpenAiSettings::default()
        });
        assert!(!generator.is_configured());
    }

    #[tokio::test]
    async fn generate_without_key_fails_before_any_request() {
        let generator = OpenAiCompatibleGenerator::new(OpenAiSettings::default());
        let err = generator.generate(&request()).await.unwrap_err();
        assert!(matches!(err, AiError::NotConfigured(_)));
    }

    #[test]
    fn request_body_carries_model_and_shape() {
        let generator = OpenAiCompatibleGenerator::new(OpenAiSettings::default());
        let body = generator.request_body(&request());
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["response_format"]["type"], "json_object");
        let system = body["messages"][0]["content"].as_str().unwrap();
        assert!(system.contains("session feedback"));
        assert!(system.contains("headline"));
    }
}
