//! Minijinja template rendering for run reports, webhook bodies and AI
//! prompts.
//!
//! Templates are arbitrary strings (not pre-registered), so a fresh
//! [`minijinja::Environment`] is created per render call.

use kinspect_core::{CheckEvent, Run};
use serde::Serialize;

use crate::traits::NotifyError;

/// Default plain-text report pushed to webhook receivers after a run.
pub const DEFAULT_REPORT_TEMPLATE: &str = "\
[kinspect] {{ run.schedule_name or 'ad-hoc' }} on {{ run.cluster }}: {{ run.status | upper }} \
({{ failed_count }} of {{ total_count }} checks failed)
{% for f in findings if f.failed %}- {{ f.script_name }}: {{ f.message }}\
{% if f.namespace %} ({{ f.namespace }}/{{ f.name }}){% elif f.name %} ({{ f.name }}){% endif %}
{% endfor %}\
{% if run.ai_summary %}
{{ run.ai_summary }}
{% endif %}";

/// One check event as exposed to templates.
#[derive(Debug, Clone, Serialize)]
pub struct FindingContext {
    pub script_name: String,
    pub kind: String,
    pub status: String,
    pub failed: bool,
    pub message: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

impl From<&CheckEvent> for FindingContext {
    fn from(e: &CheckEvent) -> Self {
        Self {
            script_name: e.script_name.clone(),
            kind: e.kind.clone(),
            status: e.status.to_string(),
            failed: e.status.is_failure(),
            message: e.message.clone(),
            namespace: e.namespace.clone(),
            name: e.name.clone(),
        }
    }
}

/// Context for run reports and summary prompts.
///
/// Fields are available both at the top level (`cluster`, `schedule_name`)
/// and under `run` for report templates.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub run: Run,
    pub cluster: String,
    pub schedule_name: String,
    pub findings: Vec<FindingContext>,
    pub failed_count: usize,
    pub total_count: usize,
    /// Current timestamp in ISO 8601 format.
    pub now: String,
}

impl RunContext {
    pub fn new(run: &Run, events: &[CheckEvent]) -> Self {
        let findings: Vec<FindingContext> = events.iter().map(FindingContext::from).collect();
        Self {
            run: run.clone(),
            cluster: run.cluster.to_string(),
            schedule_name: run.schedule_name.clone(),
            failed_count: findings.iter().filter(|f| f.failed).count(),
            total_count: findings.len(),
            findings,
            now: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Renders templates using minijinja.
#[derive(Debug)]
pub struct TemplateRenderer {
    _private: (),
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// Build a configured minijinja environment with custom filters and globals.
    fn build_env() -> minijinja::Environment<'static> {
        let mut env = minijinja::Environment::new();

        env.add_filter("round", round_filter);

        // `lower` and `upper` are built-in with the "builtins" feature,
        // but we register explicit versions to guarantee availability.
        env.add_filter("lower", lower_filter);
        env.add_filter("upper", upper_filter);

        env.add_function("env", env_function);

        env
    }

    /// Render a template string with any serializable context.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Template`] if the template is invalid or
    /// rendering fails.
    pub fn render<S: Serialize>(&self, template_str: &str, ctx: &S) -> Result<String, NotifyError> {
        let env = Self::build_env();
        env.render_str(template_str, ctx)
            .map_err(|e| NotifyError::Template(e.to_string()))
    }

    /// Validate that a template string parses without errors.
    pub fn validate(&self, template_str: &str) -> Result<(), NotifyError> {
        let env = Self::build_env();
        env.template_from_str(template_str)
            .map_err(|e| NotifyError::Template(e.to_string()))?;
        Ok(())
    }

    /// Plain-text report for a finished run.
    pub fn run_report(&self, run: &Run, events: &[CheckEvent]) -> Result<String, NotifyError> {
        self.render(DEFAULT_REPORT_TEMPLATE, &RunContext::new(run, events))
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Custom filter: round a float to N decimal places.
fn round_filter(value: f64, decimals: Option<u32>) -> String {
    let n = decimals.unwrap_or(0);
    format!("{:.prec$}", value, prec = n as usize)
}

fn lower_filter(value: String) -> String {
    value.to_lowercase()
}

fn upper_filter(value: String) -> String {
    value.to_uppercase()
}

/// Global function: read an environment variable by name.
///
/// Returns an empty string (and logs a warning) when the variable is unset.
fn env_function(name: String) -> String {
    match std::env::var(&name) {
        Ok(val) => val,
        Err(_) => {
            tracing::warn!(var = %name, "Environment variable not found, returning empty string");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kinspect_core::{CheckStatus, ClusterRef, RunStatus, TriggerType};

    fn sample_run() -> Run {
        Run {
            id: 12,
            schedule_id: Some(3),
            schedule_name: "nightly".into(),
            cluster: ClusterRef::from("demo"),
            trigger_type: TriggerType::Cron,
            status: RunStatus::Success,
            start_time: Utc::now(),
            end_time: Some(Utc::now()),
            error_count: 1,
            ai_summary: None,
        }
    }

    fn event(status: CheckStatus, message: &str, name: Option<&str>) -> CheckEvent {
        CheckEvent {
            id: 0,
            run_id: 12,
            script_name: "svc-endpoints".into(),
            kind: "Service".into(),
            description: String::new(),
            status,
            message: message.into(),
            extra: serde_json::Map::new(),
            namespace: name.map(|_| "default".to_string()),
            name: name.map(str::to_string),
        }
    }

    #[test]
    fn run_report_lists_failures_only() {
        let renderer = TemplateRenderer::new();
        let events = vec![
            event(CheckStatus::Failed, "no pods", Some("svc-a")),
            event(CheckStatus::Normal, "all good", None),
        ];
        let text = renderer.run_report(&sample_run(), &events).unwrap();
        assert!(text.starts_with("[kinspect] nightly on demo: SUCCESS (1 of 2 checks failed)"));
        assert!(text.contains("- svc-endpoints: no pods (default/svc-a)"));
        assert!(!text.contains("all good"));
    }

    #[test]
    fn run_report_appends_summary() {
        let renderer = TemplateRenderer::new();
        let mut run = sample_run();
        run.ai_summary = Some("Restart the deployment.".into());
        let text = renderer.run_report(&run, &[]).unwrap();
        assert!(text.contains("(0 of 0 checks failed)"));
        assert!(text.trim_end().ends_with("Restart the deployment."));
    }

    #[test]
    fn render_context_top_level_fields() {
        let renderer = TemplateRenderer::new();
        let ctx = RunContext::new(&sample_run(), &[event(CheckStatus::Failed, "x", None)]);
        let out = renderer
            .render("{{ cluster }}/{{ schedule_name }} {{ failed_count }}/{{ total_count }}", &ctx)
            .unwrap();
        assert_eq!(out, "demo/nightly 1/1");
    }

    #[test]
    fn render_round_filter() {
        let renderer = TemplateRenderer::new();
        let out = renderer
            .render("{{ v | round(2) }}", &serde_json::json!({"v": 0.987654}))
            .unwrap();
        assert_eq!(out, "0.99");
    }

    #[test]
    fn render_env_function() {
        std::env::set_var("KINSPECT_NOTIFY_TEST_VAR", "hello_notify");
        let renderer = TemplateRenderer::new();
        let out = renderer
            .render("Env: {{ env('KINSPECT_NOTIFY_TEST_VAR') }}", &serde_json::json!({}))
            .unwrap();
        assert_eq!(out, "Env: hello_notify");
        std::env::remove_var("KINSPECT_NOTIFY_TEST_VAR");
    }

    #[test]
    fn invalid_template_produces_error() {
        let renderer = TemplateRenderer::new();
        assert!(renderer.validate("{{ unclosed").is_err());
        match renderer.render("{{ unclosed", &serde_json::json!({})).unwrap_err() {
            NotifyError::Template(msg) => assert!(!msg.is_empty()),
            other => panic!("Expected Template error, got: {:?}", other),
        }
    }
}
