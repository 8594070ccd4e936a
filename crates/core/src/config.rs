use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub inspection: InspectionConfig,
    pub clusters: ClustersConfig,
    pub postgres: PostgresConfig,
    pub llm: LlmConfig,
    pub ollama: OllamaConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `KINSPECT_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let profile = env_or("KINSPECT_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Result<Self, ConfigError> {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Ok(Self {
            profile: p.to_string(),
            inspection: InspectionConfig::from_env_profiled(p)?,
            clusters: ClustersConfig::from_env_profiled(p),
            postgres: PostgresConfig::from_env_profiled(p),
            llm: LlmConfig::from_env_profiled(p),
            ollama: OllamaConfig::from_env_profiled(p),
        })
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  inspection:  batch_size={}, status_policy={}, cache_capacity={}",
            self.inspection.batch_size,
            self.inspection.status_policy,
            self.inspection.cache_capacity
        );
        tracing::info!("  clusters:    file={}", self.clusters.file.display());
        tracing::info!(
            "  postgres:    host={}, db={}, configured={}",
            self.postgres.host,
            self.postgres.database,
            self.postgres.is_configured()
        );
        tracing::info!(
            "  llm:         enabled={}, provider={}, configured={}",
            self.llm.enabled,
            self.llm.provider,
            self.llm.is_configured()
        );
        tracing::info!("  ollama:      url={}", self.ollama.url);
    }
}

// ── Inspection engine ─────────────────────────────────────────

/// How a finished run's terminal status is derived.
///
/// `AlwaysSuccess` keeps a run `success` whenever the orchestrator itself
/// completed, regardless of individual script failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatusPolicy {
    #[default]
    AlwaysSuccess,
    /// `failed` when every executed script raised an engine error.
    FailWhenAllScriptsError,
    /// `failed` when at least one script raised an engine error.
    FailOnAnyScriptError,
}

impl RunStatusPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatusPolicy::AlwaysSuccess => "always_success",
            RunStatusPolicy::FailWhenAllScriptsError => "fail_when_all_scripts_error",
            RunStatusPolicy::FailOnAnyScriptError => "fail_on_any_script_error",
        }
    }
}

impl fmt::Display for RunStatusPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatusPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always_success" => Ok(RunStatusPolicy::AlwaysSuccess),
            "fail_when_all_scripts_error" => Ok(RunStatusPolicy::FailWhenAllScriptsError),
            "fail_on_any_script_error" => Ok(RunStatusPolicy::FailOnAnyScriptError),
            other => Err(ConfigError::Invalid {
                key: "INSPECTION_RUN_STATUS_POLICY".to_string(),
                message: format!("unknown policy '{other}'"),
            }),
        }
    }
}

pub const DEFAULT_AI_PROMPT: &str = "You are a Kubernetes operations assistant. \
Summarize the inspection of cluster {{ cluster }} ({{ schedule_name }}). \
{{ failed_count }} of {{ total_count }} checks failed.\n\
{% for f in findings %}- [{{ f.status }}] {{ f.script_name }}: {{ f.message }}\
{% if f.namespace %} ({{ f.namespace }}/{{ f.name }}){% endif %}\n{% endfor %}\
Group the failures by cause and suggest remediation steps.";

/// Upper bound for `batch_size`. Postgres allows 65535 bind parameters per
/// statement and a check event row binds nine.
pub const MAX_BATCH_SIZE: usize = 5000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectionConfig {
    /// Rows per insert when persisting script results and check events.
    pub batch_size: usize,
    pub status_policy: RunStatusPolicy,
    /// Maximum number of cached resource-query responses.
    pub cache_capacity: usize,
    pub default_ai_prompt: String,
}

impl InspectionConfig {
    fn from_env_profiled(p: &str) -> Result<Self, ConfigError> {
        let status_policy = match profiled_env_opt(p, "INSPECTION_RUN_STATUS_POLICY") {
            Some(raw) => raw.parse()?,
            None => RunStatusPolicy::default(),
        };
        Ok(Self {
            batch_size: (profiled_env_u32(p, "INSPECTION_BATCH_SIZE", 100) as usize)
                .clamp(1, MAX_BATCH_SIZE),
            status_policy,
            cache_capacity: profiled_env_u32(p, "INSPECTION_CACHE_CAPACITY", 1024).max(1) as usize,
            default_ai_prompt: profiled_env_or(p, "INSPECTION_AI_PROMPT", DEFAULT_AI_PROMPT),
        })
    }
}

impl Default for InspectionConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            status_policy: RunStatusPolicy::default(),
            cache_capacity: 1024,
            default_ai_prompt: DEFAULT_AI_PROMPT.to_string(),
        }
    }
}

// ── Cluster registry ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClustersConfig {
    pub file: PathBuf,
}

impl ClustersConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            file: PathBuf::from(profiled_env_or(p, "CLUSTERS_FILE", "config/clusters.yaml")),
        }
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "kinspect"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 10),
        }
    }

    pub fn connection_string(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}

// ── LLM (AI summaries) ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Master switch for AI summaries.
    pub enabled: bool,
    /// "openai" or "ollama"
    pub provider: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl LlmConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            enabled: profiled_env_bool(p, "LLM_ENABLED", false),
            provider: profiled_env_or(p, "LLM_PROVIDER", "ollama"),
            openai_api_key: profiled_env_opt(p, "OPENAI_API_KEY"),
            openai_model: profiled_env_or(p, "OPENAI_MODEL", "gpt-4o"),
            openai_base_url: profiled_env_opt(p, "OPENAI_BASE_URL"),
            temperature: profiled_env_or(p, "LLM_TEMPERATURE", "0.1")
                .parse()
                .unwrap_or(0.1),
            max_tokens: profiled_env_u32(p, "LLM_MAX_TOKENS", 2048),
        }
    }

    pub fn is_configured(&self) -> bool {
        match self.provider.as_str() {
            "openai" => self.openai_api_key.is_some(),
            "ollama" => true,
            _ => false,
        }
    }
}

// ── Ollama (local models) ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    pub url: String,
    pub model: String,
}

impl OllamaConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_or(p, "OLLAMA_URL", "http://localhost:11434"),
            model: profiled_env_or(p, "OLLAMA_MODEL", "llama3.2"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_policy_parses_known_names() {
        assert_eq!(
            "fail_on_any_script_error".parse::<RunStatusPolicy>().unwrap(),
            RunStatusPolicy::FailOnAnyScriptError
        );
        assert_eq!(
            " Always_Success ".parse::<RunStatusPolicy>().unwrap(),
            RunStatusPolicy::AlwaysSuccess
        );
        assert!("sometimes".parse::<RunStatusPolicy>().is_err());
    }

    #[test]
    fn profiled_lookup_prefers_prefixed_key() {
        std::env::set_var("KTEST_PG_HOST", "db.internal");
        std::env::set_var("PG_PORT", "6543");
        let pg = PostgresConfig::from_env_profiled("KTEST");
        assert_eq!(pg.host, "db.internal");
        assert_eq!(pg.port, 6543);
        std::env::remove_var("KTEST_PG_HOST");
        std::env::remove_var("PG_PORT");
    }

    #[test]
    fn batch_size_is_never_zero() {
        std::env::set_var("ZEROTEST_INSPECTION_BATCH_SIZE", "0");
        let cfg = InspectionConfig::from_env_profiled("ZEROTEST").unwrap();
        assert_eq!(cfg.batch_size, 1);
        std::env::remove_var("ZEROTEST_INSPECTION_BATCH_SIZE");
    }

    #[test]
    fn batch_size_is_capped() {
        std::env::set_var("BIGTEST_INSPECTION_BATCH_SIZE", "100000");
        let cfg = InspectionConfig::from_env_profiled("BIGTEST").unwrap();
        assert_eq!(cfg.batch_size, MAX_BATCH_SIZE);
        assert!(cfg.batch_size * 9 <= u16::MAX as usize);
        std::env::remove_var("BIGTEST_INSPECTION_BATCH_SIZE");
    }

    #[test]
    fn connection_string_uses_defaults() {
        let pg = PostgresConfig {
            host: "localhost".into(),
            port: 5432,
            database: "kinspect".into(),
            username: None,
            password: None,
            ssl_mode: "prefer".into(),
            max_connections: 10,
        };
        assert_eq!(
            pg.connection_string(),
            "postgres://postgres:@localhost:5432/kinspect?sslmode=prefer"
        );
        assert!(!pg.is_configured());
    }
}
