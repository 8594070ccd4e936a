//! Persisted inspection entities.
//!
//! Scripts and schedules are authored by operators; runs, script results and
//! check events are produced by the orchestrator. Every entity is keyed by a
//! numeric id assigned by the store (`0` means "not yet persisted").

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

pub type ScheduleId = i64;
pub type RunId = i64;

// ── Cluster reference ─────────────────────────────────────────

/// Identifier of a managed cluster (the name used in the cluster registry).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterRef(pub String);

impl ClusterRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClusterRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ── Script definition ─────────────────────────────────────────

/// One operator-authored inspection rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptDefinition {
    pub id: i64,
    pub name: String,
    pub description: String,
    /// Resource kind the rule inspects (e.g. `Pod`, `Service`).
    pub kind: String,
    pub script_body: String,
    pub created_by: String,
}

// ── Schedule ──────────────────────────────────────────────────

/// A webhook target notified after each run of a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookReceiver {
    pub name: String,
    pub url: String,
    /// HTTP method, defaults to POST.
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<std::collections::HashMap<String, String>>,
    /// Optional minijinja body template; JSON payload when absent.
    #[serde(default)]
    pub body_template: Option<String>,
}

/// Operator-defined periodic inspection job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub name: String,
    pub clusters: Vec<ClusterRef>,
    pub cron_expression: String,
    pub enabled: bool,
    /// Scripts to run; empty means every registered script.
    #[serde(default)]
    pub script_ids: Vec<i64>,
    #[serde(default)]
    pub receivers: Vec<WebhookReceiver>,
    #[serde(default)]
    pub ai_enabled: bool,
    /// Prompt template for the AI summary; the configured default when absent.
    #[serde(default)]
    pub ai_prompt: Option<String>,
}

impl Schedule {
    /// Whether `script` is selected by this schedule.
    pub fn applies_to(&self, script: &ScriptDefinition) -> bool {
        self.script_ids.is_empty() || self.script_ids.contains(&script.id)
    }
}

// ── Run ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Cron,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Cron => "cron",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerType::Manual),
            "cron" => Ok(TriggerType::Cron),
            other => Err(ModelError::UnknownVariant {
                field: "trigger_type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(ModelError::UnknownVariant {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Fields needed to open a run; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub schedule_id: Option<ScheduleId>,
    pub schedule_name: String,
    pub cluster: ClusterRef,
    pub trigger_type: TriggerType,
    pub start_time: DateTime<Utc>,
}

/// One execution pass over one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub schedule_id: Option<ScheduleId>,
    /// Schedule name at the time the run started (empty for ad-hoc runs).
    pub schedule_name: String,
    pub cluster: ClusterRef,
    pub trigger_type: TriggerType,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub ai_summary: Option<String>,
}

impl Run {
    pub fn open(id: RunId, new: NewRun) -> Self {
        Self {
            id,
            schedule_id: new.schedule_id,
            schedule_name: new.schedule_name,
            cluster: new.cluster,
            trigger_type: new.trigger_type,
            status: RunStatus::Running,
            start_time: new.start_time,
            end_time: None,
            error_count: 0,
            ai_summary: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status != RunStatus::Running
    }
}

// ── Script result ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptResult {
    pub id: i64,
    pub run_id: RunId,
    pub script_name: String,
    pub kind: String,
    pub description: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub std_output: String,
    pub error_msg: Option<String>,
}

// ── Check event ───────────────────────────────────────────────

/// Outcome reported by a script for one finding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CheckStatus {
    Normal,
    Failed,
    Other(String),
}

impl CheckStatus {
    /// Parse a status as written by a script. Chinese and English spellings
    /// of the two built-in states are accepted; anything else is kept as-is.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "正常" => CheckStatus::Normal,
            "失败" => CheckStatus::Failed,
            other => match other.to_ascii_lowercase().as_str() {
                "normal" | "ok" | "pass" | "passed" => CheckStatus::Normal,
                "failed" | "fail" | "error" => CheckStatus::Failed,
                _ => CheckStatus::Other(other.to_string()),
            },
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, CheckStatus::Failed)
    }

    pub fn as_str(&self) -> &str {
        match self {
            CheckStatus::Normal => "normal",
            CheckStatus::Failed => "failed",
            CheckStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CheckStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CheckStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(CheckStatus::parse(&raw))
    }
}

/// One structured finding emitted by a script through `check_event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckEvent {
    pub id: i64,
    pub run_id: RunId,
    pub script_name: String,
    pub kind: String,
    pub description: String,
    pub status: CheckStatus,
    pub message: String,
    pub extra: serde_json::Map<String, serde_json::Value>,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_status_accepts_both_spellings() {
        assert_eq!(CheckStatus::parse("失败"), CheckStatus::Failed);
        assert_eq!(CheckStatus::parse("failed"), CheckStatus::Failed);
        assert_eq!(CheckStatus::parse("FAIL"), CheckStatus::Failed);
        assert_eq!(CheckStatus::parse("正常"), CheckStatus::Normal);
        assert_eq!(CheckStatus::parse("ok"), CheckStatus::Normal);
        assert_eq!(
            CheckStatus::parse("warning"),
            CheckStatus::Other("warning".to_string())
        );
    }

    #[test]
    fn check_status_serializes_as_plain_string() {
        let json = serde_json::to_string(&CheckStatus::Failed).unwrap();
        assert_eq!(json, "\"failed\"");
        let back: CheckStatus = serde_json::from_str("\"失败\"").unwrap();
        assert!(back.is_failure());
    }

    #[test]
    fn trigger_type_round_trips_through_str() {
        assert_eq!("cron".parse::<TriggerType>().unwrap(), TriggerType::Cron);
        assert_eq!(TriggerType::Manual.to_string(), "manual");
        assert!("hourly".parse::<TriggerType>().is_err());
    }

    #[test]
    fn schedule_with_no_script_ids_applies_to_everything() {
        let script = ScriptDefinition {
            id: 7,
            name: "pods".into(),
            description: String::new(),
            kind: "Pod".into(),
            script_body: String::new(),
            created_by: "ops".into(),
        };
        let mut schedule = Schedule {
            id: 1,
            name: "nightly".into(),
            clusters: vec![ClusterRef::from("demo")],
            cron_expression: "0 2 * * *".into(),
            enabled: true,
            script_ids: vec![],
            receivers: vec![],
            ai_enabled: false,
            ai_prompt: None,
        };
        assert!(schedule.applies_to(&script));
        schedule.script_ids = vec![8];
        assert!(!schedule.applies_to(&script));
    }

    #[test]
    fn new_run_starts_running() {
        let run = Run::open(
            3,
            NewRun {
                schedule_id: None,
                schedule_name: String::new(),
                cluster: ClusterRef::from("demo"),
                trigger_type: TriggerType::Manual,
                start_time: Utc::now(),
            },
        );
        assert_eq!(run.status, RunStatus::Running);
        assert!(!run.is_finished());
        assert!(run.end_time.is_none());
    }
}
