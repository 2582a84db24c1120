//! Messaging collaborator. Delivery failures never fail a job.

pub mod telegram;

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use telegram::TelegramNotifier;

/// A message to deliver to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Destination identity, e.g. a chat id.
    pub destination: String,
    pub text: String,
    /// Opaque reference the recipient can act on (e.g. open the feedback).
    pub action_ref: Option<String>,
}

/// Delivery acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Provider-side message id, when one is returned.
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Error)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(String),
    #[error("notification rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<Delivery, NotifyError>;
}

/// Records messages instead of sending them. Can be switched to fail.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    sent: Mutex<Vec<OutboundMessage>>,
    failing: Mutex<bool>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner()) = failing;
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn send(&self, message: &OutboundMessage) -> Result<Delivery, NotifyError> {
        if *self.failing.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(NotifyError::Transport("in-memory notifier set to fail".to_string()));
        }
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        sent.push(message.clone());
        Ok(Delivery {
            reference: Some(format!("mem-{}", sent.len())),
        })
    }
}
