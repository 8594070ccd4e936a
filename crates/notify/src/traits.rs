//! Notifier trait definition and shared error types.

use std::collections::HashMap;

use kinspect_core::WebhookReceiver;

use crate::llm::LlmError;

/// Errors that can occur during notification delivery or summarization.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Template rendering failed: {0}")]
    Template(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LLM request failed: {0}")]
    Llm(#[from] LlmError),
}

/// A rendered notification ready for delivery.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Notification {
    /// The rendered subject/title.
    pub subject: String,
    /// The rendered body content.
    pub body: String,
    /// Additional metadata (e.g., run id, cluster).
    pub metadata: HashMap<String, String>,
}

impl Notification {
    /// Plain-text notification; the first line doubles as the subject.
    pub fn text(text: &str) -> Self {
        Self {
            subject: text.lines().next().unwrap_or_default().to_string(),
            body: text.to_string(),
            metadata: HashMap::new(),
        }
    }
}

/// Trait for notification channel implementations.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification through this channel.
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;

    /// Human-readable name for this channel (e.g., "webhook").
    fn channel_name(&self) -> &str;
}

/// Fans a message out to a schedule's receivers.
#[async_trait::async_trait]
pub trait MessagePusher: Send + Sync {
    /// Deliver `text` to every receiver. Failures are reported per receiver
    /// and never retried.
    async fn push_message(&self, text: &str, receivers: &[WebhookReceiver]) -> Vec<SendResult>;
}

/// Result of delivering a notification to a single receiver.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub receiver: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}
