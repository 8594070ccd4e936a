use async_trait::async_trait;
use kinspect_core::{
    CheckEvent, ClusterRef, NewRun, Run, RunId, RunStatus, Schedule, ScheduleId, ScriptDefinition,
    ScriptResult,
};

use crate::error::StoreError;

/// Filter for [`InspectionStore::list_runs`]. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub schedule_id: Option<ScheduleId>,
    pub cluster: Option<ClusterRef>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn matches(&self, run: &Run) -> bool {
        self.schedule_id.map_or(true, |id| run.schedule_id == Some(id))
            && self.cluster.as_ref().map_or(true, |c| &run.cluster == c)
            && self.status.map_or(true, |s| run.status == s)
    }
}

/// Persistence for scripts, schedules and run history.
///
/// `save_*` inserts when the entity's id is `0` and updates otherwise,
/// returning the stored entity. `complete_run` refuses to touch a run that
/// is no longer `running`.
#[async_trait]
pub trait InspectionStore: Send + Sync {
    // ── Scripts ───────────────────────────────────────────────

    async fn list_scripts(&self) -> Result<Vec<ScriptDefinition>, StoreError>;

    async fn save_script(&self, script: ScriptDefinition) -> Result<ScriptDefinition, StoreError>;

    async fn delete_script(&self, id: i64) -> Result<bool, StoreError>;

    // ── Schedules ─────────────────────────────────────────────

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<Schedule>, StoreError>;

    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError>;

    async fn save_schedule(&self, schedule: Schedule) -> Result<Schedule, StoreError>;

    async fn delete_schedule(&self, id: ScheduleId) -> Result<bool, StoreError>;

    // ── Runs ──────────────────────────────────────────────────

    async fn create_run(&self, run: NewRun) -> Result<Run, StoreError>;

    async fn complete_run(&self, run: &Run) -> Result<(), StoreError>;

    async fn get_run(&self, id: RunId) -> Result<Option<Run>, StoreError>;

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError>;

    // ── Run children ──────────────────────────────────────────

    /// Insert results in chunks of `batch_size`; returns the number stored.
    /// A failed chunk does not stop the later ones; the first error is
    /// returned after all chunks were tried.
    async fn batch_save_results(
        &self,
        results: Vec<ScriptResult>,
        batch_size: usize,
    ) -> Result<usize, StoreError>;

    async fn batch_save_events(
        &self,
        events: Vec<CheckEvent>,
        batch_size: usize,
    ) -> Result<usize, StoreError>;

    async fn list_results(&self, run_id: RunId) -> Result<Vec<ScriptResult>, StoreError>;

    async fn list_events(&self, run_id: RunId) -> Result<Vec<CheckEvent>, StoreError>;
}
