//! Generic HTTP webhook notifier.
//!
//! Delivers notifications as JSON payloads to a schedule's webhook receivers
//! with optional custom headers and request body templates.

use std::collections::HashMap;
use std::sync::Arc;

use kinspect_core::WebhookReceiver;

use crate::templating::TemplateRenderer;
use crate::traits::{Notification, Notifier, NotifyError};

/// Delivers notifications over HTTP to one receiver.
///
/// Environment variable references (`${VAR_NAME}`) in the URL and header
/// values are resolved at construction time.
#[derive(Debug)]
pub struct WebhookNotifier {
    name: String,
    /// Target URL (env vars already resolved).
    url: String,
    method: reqwest::Method,
    headers: HashMap<String, String>,
    /// Optional minijinja body template rendered with the notification
    /// (`subject`, `body`, `metadata`); otherwise the notification is sent
    /// as JSON.
    body_template: Option<String>,
    renderer: Arc<TemplateRenderer>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    /// Create a new webhook notifier. `method` defaults to `POST`.
    ///
    /// Missing env vars and invalid body templates produce
    /// [`NotifyError::Config`].
    pub fn new(
        name: String,
        url: String,
        method: Option<reqwest::Method>,
        headers: HashMap<String, String>,
        body_template: Option<String>,
        renderer: Arc<TemplateRenderer>,
        client: reqwest::Client,
    ) -> Result<Self, NotifyError> {
        let resolved_url = resolve_env_vars(&url)?;

        let mut resolved_headers = HashMap::with_capacity(headers.len());
        for (key, value) in &headers {
            resolved_headers.insert(key.clone(), resolve_env_vars(value)?);
        }

        if let Some(ref tmpl) = body_template {
            renderer
                .validate(tmpl)
                .map_err(|e| NotifyError::Config(format!("invalid body template: {e}")))?;
        }

        Ok(Self {
            name,
            url: resolved_url,
            method: method.unwrap_or(reqwest::Method::POST),
            headers: resolved_headers,
            body_template,
            renderer,
            client,
        })
    }

    /// Construct from a schedule's receiver definition.
    pub fn from_receiver(
        receiver: &WebhookReceiver,
        renderer: Arc<TemplateRenderer>,
        client: reqwest::Client,
    ) -> Result<Self, NotifyError> {
        let method = match &receiver.method {
            Some(m) => Some(
                m.to_uppercase()
                    .parse::<reqwest::Method>()
                    .map_err(|_| NotifyError::Config(format!("invalid HTTP method: {m}")))?,
            ),
            None => None,
        };

        Self::new(
            receiver.name.clone(),
            receiver.url.clone(),
            method,
            receiver.headers.clone().unwrap_or_default(),
            receiver.body_template.clone(),
            renderer,
            client,
        )
    }

    fn render_body(&self, notification: &Notification) -> Result<(String, &'static str), NotifyError> {
        match &self.body_template {
            Some(tmpl) => Ok((self.renderer.render(tmpl, notification)?, "text/plain; charset=utf-8")),
            None => serde_json::to_string(notification)
                .map(|b| (b, "application/json"))
                .map_err(|e| NotifyError::Config(format!("failed to serialize notification: {e}"))),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let (body, content_type) = self.render_body(notification)?;

        let mut request = self
            .client
            .request(self.method.clone(), &self.url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body);

        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body_text = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            tracing::warn!(
                receiver = %self.name,
                url = %self.url,
                %status,
                body = %body_text,
                "webhook returned non-2xx status"
            );
            return Err(NotifyError::Config(format!(
                "webhook returned {status}: {body_text}"
            )));
        }

        tracing::debug!(
            receiver = %self.name,
            method = %self.method,
            status = %status,
            "webhook notification delivered"
        );

        Ok(())
    }

    fn channel_name(&self) -> &str {
        &self.name
    }
}

/// Replace every `${VAR_NAME}` in `input` with the variable's value.
///
/// Fails on unset variables and unterminated references.
fn resolve_env_vars(input: &str) -> Result<String, NotifyError> {
    let mut resolved = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        resolved.push_str(&rest[..start]);
        let reference = &rest[start + 2..];
        let end = reference.find('}').ok_or_else(|| {
            NotifyError::Config(format!("unclosed env var reference in: {input}"))
        })?;
        let name = &reference[..end];
        let value = std::env::var(name)
            .map_err(|_| NotifyError::Config(format!("env var not found: {name}")))?;
        resolved.push_str(&value);
        rest = &reference[end + 1..];
    }

    resolved.push_str(rest);
    Ok(resolved)
}
