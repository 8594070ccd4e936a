//! Delivers run reports to a schedule's webhook receivers.
//!
//! Receivers are independent: one failing (bad config, non-2xx, timeout)
//! never blocks the others, and nothing is retried.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use kinspect_core::WebhookReceiver;

use crate::templating::TemplateRenderer;
use crate::traits::{MessagePusher, Notification, Notifier, SendResult};
use crate::webhook::WebhookNotifier;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`MessagePusher`] backed by [`WebhookNotifier`]s built per push.
pub struct WebhookPusher {
    client: reqwest::Client,
    renderer: Arc<TemplateRenderer>,
}

impl WebhookPusher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self::with_client(client)
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            renderer: Arc::new(TemplateRenderer::new()),
        }
    }
}

impl Default for WebhookPusher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagePusher for WebhookPusher {
    async fn push_message(&self, text: &str, receivers: &[WebhookReceiver]) -> Vec<SendResult> {
        if receivers.is_empty() {
            tracing::debug!("No webhook receivers configured");
            return Vec::new();
        }

        let mut channels: Vec<Box<dyn Notifier>> = Vec::with_capacity(receivers.len());
        let mut rejected = Vec::new();
        for receiver in receivers {
            match WebhookNotifier::from_receiver(receiver, self.renderer.clone(), self.client.clone()) {
                Ok(notifier) => channels.push(Box::new(notifier)),
                Err(e) => {
                    tracing::warn!(receiver = %receiver.name, error = %e, "Skipping misconfigured receiver");
                    rejected.push(SendResult {
                        receiver: receiver.name.clone(),
                        success: false,
                        error: Some(e.to_string()),
                        duration_ms: 0,
                    });
                }
            }
        }

        let mut results = deliver_all(&channels, &Notification::text(text)).await;
        results.extend(rejected);
        results
    }
}

/// Send one notification through every channel concurrently.
pub(crate) async fn deliver_all(
    channels: &[Box<dyn Notifier>],
    notification: &Notification,
) -> Vec<SendResult> {
    let sends = channels.iter().map(|channel| async move {
        let start = Instant::now();
        let result = channel.send(notification).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (success, error) = match result {
            Ok(()) => {
                tracing::info!(
                    receiver = channel.channel_name(),
                    duration_ms,
                    "Notification delivered"
                );
                (true, None)
            }
            Err(e) => {
                tracing::warn!(
                    receiver = channel.channel_name(),
                    error = %e,
                    duration_ms,
                    "Notification delivery failed"
                );
                (false, Some(e.to_string()))
            }
        };

        SendResult {
            receiver: channel.channel_name().to_string(),
            success,
            error,
            duration_ms,
        }
    });

    join_all(sends).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::NotifyError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockNotifier {
        name: String,
        send_count: Arc<AtomicUsize>,
        should_fail: bool,
    }

    #[async_trait]
    impl Notifier for MockNotifier {
        async fn send(&self, _notification: &Notification) -> Result<(), NotifyError> {
            self.send_count.fetch_add(1, Ordering::SeqCst);
            if self.should_fail {
                Err(NotifyError::Config("mock failure".to_string()))
            } else {
                Ok(())
            }
        }
        fn channel_name(&self) -> &str {
            &self.name
        }
    }

    fn mock(name: &str, count: &Arc<AtomicUsize>, should_fail: bool) -> Box<dyn Notifier> {
        Box::new(MockNotifier {
            name: name.to_string(),
            send_count: count.clone(),
            should_fail,
        })
    }

    #[tokio::test]
    async fn failure_does_not_block_other_receivers() {
        let count = Arc::new(AtomicUsize::new(0));
        let channels = vec![
            mock("failing", &count, true),
            mock("healthy", &count, false),
        ];

        let results = deliver_all(&channels, &Notification::text("report")).await;
        assert_eq!(results.len(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert_eq!(results[0].receiver, "failing");
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("mock failure"));
        assert_eq!(results[1].receiver, "healthy");
        assert!(results[1].success);
    }

    #[tokio::test]
    async fn no_receivers_sends_nothing() {
        let pusher = WebhookPusher::new();
        assert!(pusher.push_message("report", &[]).await.is_empty());
    }

    #[tokio::test]
    async fn misconfigured_receiver_is_reported() {
        let pusher = WebhookPusher::new();
        let receivers = vec![WebhookReceiver {
            name: "broken".into(),
            url: "https://${KINSPECT_PUSHER_UNSET_VAR}/hook".into(),
            method: None,
            headers: None,
            body_template: None,
        }];

        let results = pusher.push_message("report", &receivers).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].receiver, "broken");
        assert!(!results[0].success);
        assert!(results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("KINSPECT_PUSHER_UNSET_VAR"));
    }
}
