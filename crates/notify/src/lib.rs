//! Post-run delivery for inspection results.
//!
//! This crate provides:
//! - `MessagePusher` / `WebhookPusher` fanning a run report out to a
//!   schedule's webhook receivers
//! - `Summarizer` implementations backed by an OpenAI-compatible or Ollama
//!   chat provider
//! - Minijinja template rendering for reports, webhook bodies and prompts

pub mod llm;
pub mod pusher;
pub mod summary;
pub mod templating;
pub mod traits;
pub mod webhook;

pub use pusher::WebhookPusher;
pub use summary::{DisabledSummarizer, LlmSummarizer, Summarizer, DISABLED_SUMMARY};
pub use templating::{RunContext, TemplateRenderer};
pub use traits::{MessagePusher, Notification, Notifier, NotifyError, SendResult};
