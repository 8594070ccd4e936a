//! AI summaries of inspection runs.

use async_trait::async_trait;
use kinspect_core::config::LlmConfig;
use kinspect_core::{CheckEvent, Run};

use crate::llm::{LlmProvider, Message};
use crate::templating::{RunContext, TemplateRenderer};
use crate::traits::NotifyError;

/// Text stored as the run summary when summarization is switched off.
pub const DISABLED_SUMMARY: &str = "AI summary is disabled.";

const SYSTEM_PROMPT: &str = "You summarize Kubernetes inspection results for on-call engineers. \
Be concise and concrete.";

/// Turns a run's findings into a short human-readable summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// `prompt_format` is a minijinja template rendered with the run's
    /// [`RunContext`].
    async fn summarize(
        &self,
        run: &Run,
        findings: &[CheckEvent],
        prompt_format: &str,
    ) -> Result<String, NotifyError>;
}

/// Used when no LLM is configured; never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledSummarizer;

#[async_trait]
impl Summarizer for DisabledSummarizer {
    async fn summarize(
        &self,
        _run: &Run,
        _findings: &[CheckEvent],
        _prompt_format: &str,
    ) -> Result<String, NotifyError> {
        Ok(DISABLED_SUMMARY.to_string())
    }
}

pub struct LlmSummarizer {
    provider: Box<dyn LlmProvider>,
    renderer: TemplateRenderer,
    temperature: f32,
    max_tokens: u32,
}

impl LlmSummarizer {
    pub fn new(provider: Box<dyn LlmProvider>, config: &LlmConfig) -> Self {
        Self {
            provider,
            renderer: TemplateRenderer::new(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(
        &self,
        run: &Run,
        findings: &[CheckEvent],
        prompt_format: &str,
    ) -> Result<String, NotifyError> {
        let prompt = self
            .renderer
            .render(prompt_format, &RunContext::new(run, findings))?;

        tracing::debug!(run_id = run.id, prompt_len = prompt.len(), "Requesting run summary");

        let messages = vec![Message::system(SYSTEM_PROMPT), Message::user(prompt)];
        let text = self
            .provider
            .complete(messages, self.temperature, self.max_tokens)
            .await?;
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, Role};
    use chrono::Utc;
    use kinspect_core::{CheckStatus, ClusterRef, RunStatus, TriggerType};
    use std::sync::{Arc, Mutex};

    struct RecordingProvider {
        seen: Arc<Mutex<Vec<Message>>>,
        reply: Result<String, u16>,
    }

    #[async_trait]
    impl LlmProvider for RecordingProvider {
        async fn complete(
            &self,
            messages: Vec<Message>,
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<String, LlmError> {
            self.seen.lock().unwrap().extend(messages);
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(status) => Err(LlmError::ApiError {
                    status: *status,
                    body: "overloaded".into(),
                }),
            }
        }
    }

    fn llm_config() -> LlmConfig {
        LlmConfig {
            enabled: true,
            provider: "ollama".into(),
            openai_api_key: None,
            openai_model: "gpt-4o".into(),
            openai_base_url: None,
            temperature: 0.2,
            max_tokens: 256,
        }
    }

    fn run() -> Run {
        Run {
            id: 7,
            schedule_id: Some(1),
            schedule_name: "hourly".into(),
            cluster: ClusterRef::from("prod"),
            trigger_type: TriggerType::Cron,
            status: RunStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            error_count: 0,
            ai_summary: None,
        }
    }

    fn failed_event() -> CheckEvent {
        CheckEvent {
            id: 0,
            run_id: 7,
            script_name: "pod-restarts".into(),
            kind: "Pod".into(),
            description: String::new(),
            status: CheckStatus::Failed,
            message: "restarted 12 times".into(),
            extra: serde_json::Map::new(),
            namespace: Some("web".into()),
            name: Some("api-0".into()),
        }
    }

    #[tokio::test]
    async fn disabled_returns_placeholder() {
        let text = DisabledSummarizer
            .summarize(&run(), &[failed_event()], "{{ cluster }}")
            .await
            .unwrap();
        assert_eq!(text, DISABLED_SUMMARY);
    }

    #[tokio::test]
    async fn prompt_is_rendered_from_findings() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let summarizer = LlmSummarizer::new(
            Box::new(RecordingProvider {
                seen: seen.clone(),
                reply: Ok("  One pod is crash looping.\n".into()),
            }),
            &llm_config(),
        );

        let text = summarizer
            .summarize(
                &run(),
                &[failed_event()],
                kinspect_core::config::DEFAULT_AI_PROMPT,
            )
            .await
            .unwrap();
        assert_eq!(text, "One pod is crash looping.");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[1].role, Role::User));
        assert!(seen[1].content.contains("cluster prod (hourly)"));
        assert!(seen[1].content.contains("1 of 1 checks failed"));
        assert!(seen[1].content.contains("pod-restarts: restarted 12 times (web/api-0)"));
    }

    #[tokio::test]
    async fn provider_errors_propagate() {
        let summarizer = LlmSummarizer::new(
            Box::new(RecordingProvider {
                seen: Arc::new(Mutex::new(Vec::new())),
                reply: Err(503),
            }),
            &llm_config(),
        );
        match summarizer.summarize(&run(), &[], "{{ cluster }}").await {
            Err(NotifyError::Llm(LlmError::ApiError { status, .. })) => assert_eq!(status, 503),
            other => panic!("expected LLM error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_prompt_template_is_reported() {
        let summarizer = LlmSummarizer::new(
            Box::new(RecordingProvider {
                seen: Arc::new(Mutex::new(Vec::new())),
                reply: Ok(String::new()),
            }),
            &llm_config(),
        );
        assert!(matches!(
            summarizer.summarize(&run(), &[], "{% if %}").await,
            Err(NotifyError::Template(_))
        ));
    }
}
