//! Runs every applicable script for one cluster and persists the outcome
//! as a [`Run`] with its script results and check events.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use kinspect_core::config::{InspectionConfig, RunStatusPolicy};
use kinspect_core::{
    CheckEvent, ClusterRef, NewRun, Run, RunStatus, Schedule, ScheduleId, ScriptDefinition,
    ScriptResult, TriggerType, WebhookReceiver,
};
use kinspect_notify::{DisabledSummarizer, Summarizer};
use kinspect_sandbox::{ResourceBackend, ResponseCache, Sandbox};
use kinspect_store::InspectionStore;
use tracing::{debug, error, info, warn};

use crate::error::InspectionError;

/// A finished run plus what the caller needs to report on it.
#[derive(Debug, Clone)]
pub(crate) struct InspectionOutcome {
    pub run: Run,
    pub events: Vec<CheckEvent>,
    pub receivers: Vec<WebhookReceiver>,
}

type Records = Vec<(ScriptResult, Vec<CheckEvent>)>;

pub struct Orchestrator {
    store: Arc<dyn InspectionStore>,
    backend: Arc<dyn ResourceBackend>,
    cache: Arc<ResponseCache>,
    summarizer: Arc<dyn Summarizer>,
    config: InspectionConfig,
}

impl Orchestrator {
    /// Summaries default to [`DisabledSummarizer`].
    pub fn new(
        store: Arc<dyn InspectionStore>,
        backend: Arc<dyn ResourceBackend>,
        config: InspectionConfig,
    ) -> Self {
        Self {
            store,
            backend,
            cache: Arc::new(ResponseCache::new(config.cache_capacity)),
            summarizer: Arc::new(DisabledSummarizer),
            config,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn store(&self) -> &Arc<dyn InspectionStore> {
        &self.store
    }

    /// Run one inspection of `cluster`.
    ///
    /// Errors only when nothing was persisted (unknown schedule, run row
    /// could not be created). Failures after that finalize the run as
    /// `failed` and still return it.
    pub async fn start_inspection(
        &self,
        schedule_id: Option<ScheduleId>,
        cluster: &ClusterRef,
        trigger_type: TriggerType,
    ) -> Result<Run, InspectionError> {
        Ok(self.inspect(schedule_id, cluster, trigger_type).await?.run)
    }

    pub(crate) async fn inspect(
        &self,
        schedule_id: Option<ScheduleId>,
        cluster: &ClusterRef,
        trigger_type: TriggerType,
    ) -> Result<InspectionOutcome, InspectionError> {
        let schedule = match schedule_id {
            Some(id) => Some(
                self.store
                    .get_schedule(id)
                    .await?
                    .ok_or(InspectionError::ScheduleNotFound(id))?,
            ),
            None => None,
        };

        let run = self
            .store
            .create_run(NewRun {
                schedule_id,
                schedule_name: schedule.as_ref().map(|s| s.name.clone()).unwrap_or_default(),
                cluster: cluster.clone(),
                trigger_type,
                start_time: Utc::now(),
            })
            .await?;

        info!(
            run_id = run.id,
            schedule_id = ?schedule_id,
            cluster = %cluster,
            trigger = %trigger_type,
            "inspection started"
        );

        let (records, run_error) = match self.execute(&run, schedule.as_ref()).await {
            Ok(records) => (records, None),
            Err((records, e)) => (records, Some(e)),
        };

        let outcome = self.finish(run, schedule, records, run_error).await;
        Ok(outcome)
    }

    /// Execute the applicable scripts on the blocking pool. On a run-level
    /// failure, whatever finished before it is returned with the error.
    async fn execute(
        &self,
        run: &Run,
        schedule: Option<&Schedule>,
    ) -> Result<Records, (Records, String)> {
        let scripts: Vec<ScriptDefinition> = match self.store.list_scripts().await {
            Ok(all) => all
                .into_iter()
                .filter(|s| schedule.map_or(true, |sc| sc.applies_to(s)))
                .collect(),
            Err(e) => return Err((Vec::new(), format!("failed to list scripts: {e}"))),
        };

        if scripts.is_empty() {
            debug!(run_id = run.id, "no applicable scripts");
            return Ok(Vec::new());
        }

        let sandbox = Sandbox::for_current_runtime(
            run.cluster.clone(),
            self.backend.clone(),
            self.cache.clone(),
        )
        .map_err(|e| (Vec::new(), e.to_string()))?;

        let collected: Arc<Mutex<Records>> = Arc::new(Mutex::new(Vec::with_capacity(scripts.len())));
        let sink = collected.clone();
        let run_id = run.id;

        let joined = tokio::task::spawn_blocking(move || {
            for script in &scripts {
                let records = sandbox.execute(script).into_records(run_id, script);
                sink.lock().unwrap_or_else(|e| e.into_inner()).push(records);
            }
        })
        .await;

        let records = std::mem::take(&mut *collected.lock().unwrap_or_else(|e| e.into_inner()));
        match joined {
            Ok(()) => Ok(records),
            Err(e) => Err((records, format!("script execution aborted: {e}"))),
        }
    }

    async fn finish(
        &self,
        mut run: Run,
        schedule: Option<Schedule>,
        records: Records,
        run_error: Option<String>,
    ) -> InspectionOutcome {
        let mut results = Vec::with_capacity(records.len());
        let mut events = Vec::new();
        for (result, script_events) in records {
            results.push(result);
            events.extend(script_events);
        }

        let errored_scripts = results.iter().filter(|r| r.error_msg.is_some()).count();
        let total_scripts = results.len();

        if let Err(e) = self
            .store
            .batch_save_results(results, self.config.batch_size)
            .await
        {
            error!(run_id = run.id, error = %e, "failed to persist script results");
        }
        if let Err(e) = self
            .store
            .batch_save_events(events.clone(), self.config.batch_size)
            .await
        {
            error!(run_id = run.id, error = %e, "failed to persist check events");
        }

        run.status = match &run_error {
            Some(e) => {
                warn!(run_id = run.id, error = %e, "inspection failed");
                RunStatus::Failed
            }
            None => run_status(self.config.status_policy, total_scripts, errored_scripts),
        };
        run.error_count = events.iter().filter(|e| e.status.is_failure()).count() as u32;

        if let Some(schedule) = schedule.as_ref().filter(|s| s.ai_enabled) {
            let prompt = schedule
                .ai_prompt
                .as_deref()
                .unwrap_or(&self.config.default_ai_prompt);
            match self.summarizer.summarize(&run, &events, prompt).await {
                Ok(summary) => run.ai_summary = Some(summary),
                Err(e) => warn!(run_id = run.id, error = %e, "AI summary failed"),
            }
        }

        run.end_time = Some(Utc::now());
        if let Err(e) = self.store.complete_run(&run).await {
            error!(run_id = run.id, error = %e, "failed to finalize run");
        }

        info!(
            run_id = run.id,
            cluster = %run.cluster,
            status = %run.status,
            scripts = total_scripts,
            script_errors = errored_scripts,
            error_count = run.error_count,
            "inspection finished"
        );

        InspectionOutcome {
            run,
            events,
            receivers: schedule.map(|s| s.receivers).unwrap_or_default(),
        }
    }
}

/// Terminal status of a run whose orchestration completed.
fn run_status(policy: RunStatusPolicy, total_scripts: usize, errored_scripts: usize) -> RunStatus {
    let failed = match policy {
        RunStatusPolicy::AlwaysSuccess => false,
        RunStatusPolicy::FailWhenAllScriptsError => total_scripts > 0 && errored_scripts == total_scripts,
        RunStatusPolicy::FailOnAnyScriptError => errored_scripts > 0,
    };
    if failed {
        RunStatus::Failed
    } else {
        RunStatus::Success
    }
}
