//! In-process store. Used by tests and by the worker when no database is
//! configured; nothing survives a restart.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kinspect_core::{
    CheckEvent, NewRun, Run, RunId, RunStatus, Schedule, ScheduleId, ScriptDefinition, ScriptResult,
};

use crate::error::StoreError;
use crate::store::{InspectionStore, RunFilter};

#[derive(Default)]
struct State {
    next_id: i64,
    scripts: BTreeMap<i64, ScriptDefinition>,
    schedules: BTreeMap<ScheduleId, Schedule>,
    runs: BTreeMap<RunId, Run>,
    results: Vec<ScriptResult>,
    events: Vec<CheckEvent>,
    batch_writes: usize,
}

impl State {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of batch insert statements issued so far.
    pub fn batch_writes(&self) -> usize {
        self.state().batch_writes
    }
}

#[async_trait]
impl InspectionStore for MemoryStore {
    async fn list_scripts(&self) -> Result<Vec<ScriptDefinition>, StoreError> {
        Ok(self.state().scripts.values().cloned().collect())
    }

    async fn save_script(&self, mut script: ScriptDefinition) -> Result<ScriptDefinition, StoreError> {
        let mut state = self.state();
        if script.id == 0 {
            script.id = state.allocate();
        } else if !state.scripts.contains_key(&script.id) {
            return Err(StoreError::NotFound {
                entity: "script",
                id: script.id,
            });
        }
        state.scripts.insert(script.id, script.clone());
        Ok(script)
    }

    async fn delete_script(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self.state().scripts.remove(&id).is_some())
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<Schedule>, StoreError> {
        Ok(self.state().schedules.get(&id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        Ok(self.state().schedules.values().cloned().collect())
    }

    async fn save_schedule(&self, mut schedule: Schedule) -> Result<Schedule, StoreError> {
        let mut state = self.state();
        if schedule.id == 0 {
            schedule.id = state.allocate();
        } else if !state.schedules.contains_key(&schedule.id) {
            return Err(StoreError::NotFound {
                entity: "schedule",
                id: schedule.id,
            });
        }
        state.schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn delete_schedule(&self, id: ScheduleId) -> Result<bool, StoreError> {
        Ok(self.state().schedules.remove(&id).is_some())
    }

    async fn create_run(&self, run: NewRun) -> Result<Run, StoreError> {
        let mut state = self.state();
        let id = state.allocate();
        let run = Run::open(id, run);
        state.runs.insert(id, run.clone());
        Ok(run)
    }

    async fn complete_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut state = self.state();
        let stored = state.runs.get_mut(&run.id).ok_or(StoreError::NotFound {
            entity: "run",
            id: run.id,
        })?;
        if stored.status != RunStatus::Running {
            return Err(StoreError::RunFinished(run.id));
        }
        *stored = run.clone();
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> Result<Option<Run>, StoreError> {
        Ok(self.state().runs.get(&id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let state = self.state();
        let mut runs: Vec<Run> = state.runs.values().filter(|r| filter.matches(r)).cloned().collect();
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }

    async fn batch_save_results(
        &self,
        results: Vec<ScriptResult>,
        batch_size: usize,
    ) -> Result<usize, StoreError> {
        let mut state = self.state();
        let count = results.len();
        for chunk in results.chunks(batch_size.max(1)) {
            state.batch_writes += 1;
            for result in chunk {
                let mut result = result.clone();
                result.id = state.allocate();
                state.results.push(result);
            }
        }
        Ok(count)
    }

    async fn batch_save_events(
        &self,
        events: Vec<CheckEvent>,
        batch_size: usize,
    ) -> Result<usize, StoreError> {
        let mut state = self.state();
        let count = events.len();
        for chunk in events.chunks(batch_size.max(1)) {
            state.batch_writes += 1;
            for event in chunk {
                let mut event = event.clone();
                event.id = state.allocate();
                state.events.push(event);
            }
        }
        Ok(count)
    }

    async fn list_results(&self, run_id: RunId) -> Result<Vec<ScriptResult>, StoreError> {
        Ok(self
            .state()
            .results
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn list_events(&self, run_id: RunId) -> Result<Vec<CheckEvent>, StoreError> {
        Ok(self
            .state()
            .events
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }
}
