//! PostgreSQL-backed store.
//!
//! Queries are built at runtime (no compile-time checked macros); child rows
//! are written with multi-row `INSERT` statements built by [`QueryBuilder`].

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kinspect_core::config::{PostgresConfig, MAX_BATCH_SIZE};
use kinspect_core::{
    CheckEvent, CheckStatus, ClusterRef, NewRun, Run, RunId, Schedule, ScheduleId,
    ScriptDefinition, ScriptResult, WebhookReceiver,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::{InspectionStore, RunFilter};

// ── Row types ─────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct ScriptRow {
    id: i64,
    name: String,
    description: String,
    kind: String,
    script_body: String,
    created_by: String,
}

impl From<ScriptRow> for ScriptDefinition {
    fn from(r: ScriptRow) -> Self {
        Self {
            id: r.id,
            name: r.name,
            description: r.description,
            kind: r.kind,
            script_body: r.script_body,
            created_by: r.created_by,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ScheduleRow {
    id: i64,
    name: String,
    clusters: Vec<String>,
    cron_expression: String,
    enabled: bool,
    script_ids: Vec<i64>,
    receivers: Json<Vec<WebhookReceiver>>,
    ai_enabled: bool,
    ai_prompt: Option<String>,
}

impl From<ScheduleRow> for Schedule {
    fn from(r: ScheduleRow) -> Self {
        Self {
            id: r.id,
            name: r.name,
            clusters: r.clusters.into_iter().map(ClusterRef::new).collect(),
            cron_expression: r.cron_expression,
            enabled: r.enabled,
            script_ids: r.script_ids,
            receivers: r.receivers.0,
            ai_enabled: r.ai_enabled,
            ai_prompt: r.ai_prompt,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: i64,
    schedule_id: Option<i64>,
    schedule_name: String,
    cluster: String,
    trigger_type: String,
    status: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    error_count: i32,
    ai_summary: Option<String>,
}

impl TryFrom<RunRow> for Run {
    type Error = StoreError;

    fn try_from(r: RunRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            schedule_id: r.schedule_id,
            schedule_name: r.schedule_name,
            cluster: ClusterRef::new(r.cluster),
            trigger_type: r.trigger_type.parse()?,
            status: r.status.parse()?,
            start_time: r.start_time,
            end_time: r.end_time,
            error_count: r.error_count.max(0) as u32,
            ai_summary: r.ai_summary,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ScriptResultRow {
    id: i64,
    run_id: i64,
    script_name: String,
    kind: String,
    description: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    std_output: String,
    error_msg: Option<String>,
}

impl From<ScriptResultRow> for ScriptResult {
    fn from(r: ScriptResultRow) -> Self {
        Self {
            id: r.id,
            run_id: r.run_id,
            script_name: r.script_name,
            kind: r.kind,
            description: r.description,
            start_time: r.start_time,
            end_time: r.end_time,
            std_output: r.std_output,
            error_msg: r.error_msg,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CheckEventRow {
    id: i64,
    run_id: i64,
    script_name: String,
    kind: String,
    description: String,
    status: String,
    message: String,
    extra: Json<serde_json::Map<String, serde_json::Value>>,
    namespace: Option<String>,
    name: Option<String>,
}

impl From<CheckEventRow> for CheckEvent {
    fn from(r: CheckEventRow) -> Self {
        Self {
            id: r.id,
            run_id: r.run_id,
            script_name: r.script_name,
            kind: r.kind,
            description: r.description,
            status: CheckStatus::parse(&r.status),
            message: r.message,
            extra: r.extra.0,
            namespace: r.namespace,
            name: r.name,
        }
    }
}

const RUN_COLUMNS: &str = "id, schedule_id, schedule_name, cluster, trigger_type, status, \
                           start_time, end_time, error_count, ai_summary";
const SCHEDULE_COLUMNS: &str = "id, name, clusters, cron_expression, enabled, script_ids, \
                                receivers, ai_enabled, ai_prompt";

// ── Store ─────────────────────────────────────────────────────

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply pending migrations.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string())
            .await?;
        info!("PostgreSQL connected: {}", config.host);
        sqlx::migrate!("../../migrations").run(&pool).await?;
        info!("Database migrations applied successfully");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl InspectionStore for PgStore {
    async fn list_scripts(&self) -> Result<Vec<ScriptDefinition>, StoreError> {
        let rows = sqlx::query_as::<_, ScriptRow>(
            "SELECT id, name, description, kind, script_body, created_by
             FROM inspection_scripts
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn save_script(&self, script: ScriptDefinition) -> Result<ScriptDefinition, StoreError> {
        let row = if script.id == 0 {
            sqlx::query_as::<_, ScriptRow>(
                "INSERT INTO inspection_scripts (name, description, kind, script_body, created_by)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING id, name, description, kind, script_body, created_by",
            )
            .bind(&script.name)
            .bind(&script.description)
            .bind(&script.kind)
            .bind(&script.script_body)
            .bind(&script.created_by)
            .fetch_one(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, ScriptRow>(
                "UPDATE inspection_scripts
                 SET name = $2, description = $3, kind = $4, script_body = $5,
                     created_by = $6, updated_at = NOW()
                 WHERE id = $1
                 RETURNING id, name, description, kind, script_body, created_by",
            )
            .bind(script.id)
            .bind(&script.name)
            .bind(&script.description)
            .bind(&script.kind)
            .bind(&script.script_body)
            .bind(&script.created_by)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "script",
                id: script.id,
            })?
        };
        Ok(row.into())
    }

    async fn delete_script(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM inspection_scripts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<Schedule>, StoreError> {
        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM inspection_schedules WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM inspection_schedules ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn save_schedule(&self, schedule: Schedule) -> Result<Schedule, StoreError> {
        let clusters: Vec<String> = schedule.clusters.iter().map(|c| c.0.clone()).collect();
        let row = if schedule.id == 0 {
            sqlx::query_as::<_, ScheduleRow>(&format!(
                "INSERT INTO inspection_schedules
                     (name, clusters, cron_expression, enabled, script_ids, receivers, ai_enabled, ai_prompt)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 RETURNING {SCHEDULE_COLUMNS}"
            ))
            .bind(&schedule.name)
            .bind(&clusters)
            .bind(&schedule.cron_expression)
            .bind(schedule.enabled)
            .bind(&schedule.script_ids)
            .bind(Json(&schedule.receivers))
            .bind(schedule.ai_enabled)
            .bind(&schedule.ai_prompt)
            .fetch_one(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, ScheduleRow>(&format!(
                "UPDATE inspection_schedules
                 SET name = $2, clusters = $3, cron_expression = $4, enabled = $5,
                     script_ids = $6, receivers = $7, ai_enabled = $8, ai_prompt = $9,
                     updated_at = NOW()
                 WHERE id = $1
                 RETURNING {SCHEDULE_COLUMNS}"
            ))
            .bind(schedule.id)
            .bind(&schedule.name)
            .bind(&clusters)
            .bind(&schedule.cron_expression)
            .bind(schedule.enabled)
            .bind(&schedule.script_ids)
            .bind(Json(&schedule.receivers))
            .bind(schedule.ai_enabled)
            .bind(&schedule.ai_prompt)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "schedule",
                id: schedule.id,
            })?
        };
        Ok(row.into())
    }

    async fn delete_schedule(&self, id: ScheduleId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM inspection_schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_run(&self, run: NewRun) -> Result<Run, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "INSERT INTO inspection_runs
                 (schedule_id, schedule_name, cluster, trigger_type, status, start_time)
             VALUES ($1, $2, $3, $4, 'running', $5)
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(run.schedule_id)
        .bind(&run.schedule_name)
        .bind(run.cluster.as_str())
        .bind(run.trigger_type.as_str())
        .bind(run.start_time)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn complete_run(&self, run: &Run) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE inspection_runs
             SET status = $2, end_time = $3, error_count = $4, ai_summary = $5
             WHERE id = $1 AND status = 'running'",
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.end_time)
        .bind(run.error_count.min(i32::MAX as u32) as i32)
        .bind(run.ai_summary.as_deref().map(pg_text))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_run(run.id).await? {
                Some(_) => Err(StoreError::RunFinished(run.id)),
                None => Err(StoreError::NotFound {
                    entity: "run",
                    id: run.id,
                }),
            };
        }
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> Result<Option<Run>, StoreError> {
        sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM inspection_runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {RUN_COLUMNS} FROM inspection_runs WHERE TRUE"
        ));
        if let Some(id) = filter.schedule_id {
            qb.push(" AND schedule_id = ").push_bind(id);
        }
        if let Some(cluster) = &filter.cluster {
            qb.push(" AND cluster = ").push_bind(cluster.0.clone());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY start_time DESC, id DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb.build_query_as::<RunRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn batch_save_results(
        &self,
        results: Vec<ScriptResult>,
        batch_size: usize,
    ) -> Result<usize, StoreError> {
        let pool = &self.pool;
        insert_chunks(&results, batch_size, "script results", |chunk| {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO inspection_script_results
                     (run_id, script_name, kind, description, start_time, end_time, std_output, error_msg) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.run_id)
                    .push_bind(pg_text(&r.script_name))
                    .push_bind(pg_text(&r.kind))
                    .push_bind(pg_text(&r.description))
                    .push_bind(r.start_time)
                    .push_bind(r.end_time)
                    .push_bind(pg_text(&r.std_output))
                    .push_bind(r.error_msg.as_deref().map(pg_text));
            });
            async move {
                let done = qb.build().execute(pool).await?;
                Ok::<_, StoreError>(done.rows_affected())
            }
        })
        .await
    }

    async fn batch_save_events(
        &self,
        events: Vec<CheckEvent>,
        batch_size: usize,
    ) -> Result<usize, StoreError> {
        let pool = &self.pool;
        insert_chunks(&events, batch_size, "check events", |chunk| {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO inspection_check_events
                     (run_id, script_name, kind, description, status, message, extra, namespace, name) ",
            );
            qb.push_values(chunk, |mut b, e| {
                b.push_bind(e.run_id)
                    .push_bind(pg_text(&e.script_name))
                    .push_bind(pg_text(&e.kind))
                    .push_bind(pg_text(&e.description))
                    .push_bind(e.status.as_str())
                    .push_bind(pg_text(&e.message))
                    .push_bind(Json(pg_json_map(&e.extra)))
                    .push_bind(e.namespace.as_deref().map(pg_text))
                    .push_bind(e.name.as_deref().map(pg_text));
            });
            async move {
                let done = qb.build().execute(pool).await?;
                Ok::<_, StoreError>(done.rows_affected())
            }
        })
        .await
    }

    async fn list_results(&self, run_id: RunId) -> Result<Vec<ScriptResult>, StoreError> {
        let rows = sqlx::query_as::<_, ScriptResultRow>(
            "SELECT id, run_id, script_name, kind, description, start_time, end_time,
                    std_output, error_msg
             FROM inspection_script_results
             WHERE run_id = $1
             ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_events(&self, run_id: RunId) -> Result<Vec<CheckEvent>, StoreError> {
        let rows = sqlx::query_as::<_, CheckEventRow>(
            "SELECT id, run_id, script_name, kind, description, status, message,
                    extra, namespace, name
             FROM inspection_check_events
             WHERE run_id = $1
             ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// ── Batched writes ────────────────────────────────────────────

/// Write `items` in chunks of `batch_size`, capped at [`MAX_BATCH_SIZE`].
/// A failed chunk is logged and the remaining chunks are still written; the
/// first error is returned once every chunk has been tried.
async fn insert_chunks<'a, T, F, Fut>(
    items: &'a [T],
    batch_size: usize,
    what: &'static str,
    mut insert: F,
) -> Result<usize, StoreError>
where
    F: FnMut(&'a [T]) -> Fut,
    Fut: Future<Output = Result<u64, StoreError>>,
{
    let mut stored = 0;
    let mut first_error = None;
    for (index, chunk) in items.chunks(batch_size.clamp(1, MAX_BATCH_SIZE)).enumerate() {
        match insert(chunk).await {
            Ok(rows) => {
                stored += rows as usize;
                debug!(rows = chunk.len(), what, "batch written");
            }
            Err(e) => {
                warn!(batch = index, rows = chunk.len(), what, error = %e, "batch write failed");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(stored),
    }
}

// ── Text values ───────────────────────────────────────────────

/// TEXT and JSONB columns reject NUL, so it is stored as U+FFFD.
fn pg_text(s: &str) -> String {
    s.replace('\0', "\u{FFFD}")
}

fn pg_json(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(s) => Value::String(pg_text(s)),
        Value::Array(items) => Value::Array(items.iter().map(pg_json).collect()),
        Value::Object(map) => Value::Object(pg_json_map(map)),
        other => other.clone(),
    }
}

fn pg_json_map(
    map: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    map.iter().map(|(k, v)| (pg_text(k), pg_json(v))).collect()
}
