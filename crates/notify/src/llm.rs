//! Chat-completion providers used for AI run summaries.

pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use kinspect_core::config::{LlmConfig, OllamaConfig};
use serde::{Deserialize, Serialize};

/// A chat message for the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Chat completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and return the assistant's response text.
    async fn complete(
        &self,
        messages: Vec<Message>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("API error {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    ParseError(String),
    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

/// Create the appropriate LLM provider based on config.
pub fn create_provider(
    llm_config: &LlmConfig,
    ollama_config: &OllamaConfig,
) -> Result<Box<dyn LlmProvider>, LlmError> {
    match llm_config.provider.as_str() {
        "openai" => {
            let api_key = llm_config
                .openai_api_key
                .as_ref()
                .ok_or_else(|| LlmError::NotConfigured("OPENAI_API_KEY not set".into()))?;
            let base_url = llm_config
                .openai_base_url
                .as_deref()
                .unwrap_or("https://api.openai.com");
            Ok(Box::new(openai::OpenAiProvider::new(
                api_key.clone(),
                llm_config.openai_model.clone(),
                base_url.to_string(),
            )))
        }
        "ollama" => Ok(Box::new(ollama::OllamaProvider::new(
            ollama_config.url.clone(),
            ollama_config.model.clone(),
        ))),
        other => Err(LlmError::NotConfigured(format!(
            "unknown LLM provider: '{}'",
            other
        ))),
    }
}

/// Upper bound for one completion request.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Wire format shared by the OpenAI and Ollama chat endpoints.
fn wire_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llm_config(provider: &str, key: Option<&str>) -> LlmConfig {
        LlmConfig {
            enabled: true,
            provider: provider.into(),
            openai_api_key: key.map(str::to_string),
            openai_model: "gpt-4o".into(),
            openai_base_url: None,
            temperature: 0.1,
            max_tokens: 512,
        }
    }

    fn ollama() -> OllamaConfig {
        OllamaConfig {
            url: "http://localhost:11434".into(),
            model: "llama3.2".into(),
        }
    }

    #[test]
    fn openai_requires_key() {
        assert!(matches!(
            create_provider(&llm_config("openai", None), &ollama()),
            Err(LlmError::NotConfigured(_))
        ));
        assert!(create_provider(&llm_config("openai", Some("sk-test")), &ollama()).is_ok());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        match create_provider(&llm_config("mystery", None), &ollama()) {
            Err(LlmError::NotConfigured(msg)) => assert!(msg.contains("mystery")),
            _ => panic!("expected NotConfigured"),
        }
    }

    #[test]
    fn wire_messages_use_lowercase_roles() {
        let wire = wire_messages(&[Message::system("s"), Message::user("u")]);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["content"], "u");
    }
}
