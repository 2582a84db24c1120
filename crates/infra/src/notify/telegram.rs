//! Telegram Bot API notifier (`sendMessage`).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

use super::{Delivery, Notifier, NotifyError, OutboundMessage};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TelegramNotifier {
    bot_token: String,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            api_base: "https://api.telegram.org".to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point at a different Bot API server (self-hosted or a test double).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn payload(message: &OutboundMessage) -> JsonValue {
        let mut body = json!({
            "chat_id": message.destination,
            "text": message.text,
        });
        if let Some(action) = &message.action_ref {
            body["reply_markup"] = json!({
                "inline_keyboard": [[{ "text": "Open feedback", "callback_data": action }]]
            });
        }
        body
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: &OutboundMessage) -> Result<Delivery, NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base.trim_end_matches('/'), self.bot_token);
        let resp = self
            .client
            .post(&url)
            .json(&Self::payload(message))
            .timeout(SEND_TIMEOUT)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(format!("telegram send failed: {}", e.without_url())))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected(format!("telegram api error {status}: {body}")));
        }

        let body: JsonValue = resp
            .json()
            .await
            .map_err(|e| NotifyError::Transport(format!("unreadable telegram response: {}", e.without_url())))?;
        let reference = body["result"]["message_id"].as_i64().map(|id| id.to_string());
        tracing::debug!(destination = %message.destination, ?reference, "telegram notification sent");
        Ok(Delivery { reference })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_ref_becomes_inline_button() {
        let message = OutboundMessage {
            destination: "42".to_string(),
            text: "hello".to_string(),
            action_ref: Some("session:s1".to_string()),
        };
        let body = TelegramNotifier::payload(&message);
        assert_eq!(body["chat_id"], "42");
        assert_eq!(body["reply_markup"]["inline_keyboard"][0][0]["callback_data"], "session:s1");
    }

    #[test]
    fn plain_message_has_no_markup() {
        let message = OutboundMessage {
            destination: "42".to_string(),
            text: "hello".to_string(),
            action_ref: None,
        };
        assert!(TelegramNotifier::payload(&message).get("reply_markup").is_none());
    }
}
