//! Schedule lifecycle: keeps the set of live cron triggers in line with the
//! persisted schedules.
//!
//! Every installed trigger is paired with a [`TaskToken`]. A firing checks
//! its token before doing anything, so once [`ScheduleManager::remove`]
//! returns no new run is created for that schedule, even by a firing that
//! was already dispatched. A firing that got past the check finishes
//! normally.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use futures::FutureExt;
use kinspect_core::{ClusterRef, Run, Schedule, ScheduleId, TriggerType};
use kinspect_notify::{MessagePusher, TemplateRenderer};
use kinspect_store::InspectionStore;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::InspectionError;
use crate::orchestrator::{InspectionOutcome, Orchestrator};
use crate::task_control::{TaskControl, TaskControlRegistry, TaskToken};
use crate::trigger::{parse_cron, FiringJob, TriggerDriver, TriggerId};

/// Result of [`ScheduleManager::add`].
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    Installed { token: TaskToken, trigger_id: TriggerId },
    /// The schedule is disabled; any trigger it had was removed.
    Disabled,
}

/// What [`ScheduleManager::update_config`] changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub installed: Vec<ScheduleId>,
    pub removed: Vec<ScheduleId>,
    pub failed: Vec<(ScheduleId, String)>,
}

struct Inner {
    store: Arc<dyn InspectionStore>,
    orchestrator: Arc<Orchestrator>,
    registry: TaskControlRegistry,
    driver: Arc<dyn TriggerDriver>,
    /// Taken before the registry whenever both are touched.
    triggers: Mutex<HashMap<ScheduleId, TriggerId>>,
    pusher: Arc<dyn MessagePusher>,
    renderer: TemplateRenderer,
    deliveries: Mutex<JoinSet<()>>,
}

/// Owns the live triggers and task controls of every schedule.
#[derive(Clone)]
pub struct ScheduleManager {
    inner: Arc<Inner>,
}

impl ScheduleManager {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        driver: Arc<dyn TriggerDriver>,
        pusher: Arc<dyn MessagePusher>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: orchestrator.store().clone(),
                orchestrator,
                registry: TaskControlRegistry::new(),
                driver,
                triggers: Mutex::new(HashMap::new()),
                pusher,
                renderer: TemplateRenderer::new(),
                deliveries: Mutex::new(JoinSet::new()),
            }),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Install (or replace) the trigger for a schedule.
    ///
    /// A malformed cron expression leaves the schedule without a trigger.
    pub async fn add(&self, schedule_id: ScheduleId) -> Result<AddOutcome, InspectionError> {
        let schedule = self
            .inner
            .store
            .get_schedule(schedule_id)
            .await?
            .ok_or(InspectionError::ScheduleNotFound(schedule_id))?;
        self.install(&schedule)
    }

    fn install(&self, schedule: &Schedule) -> Result<AddOutcome, InspectionError> {
        if !schedule.enabled {
            self.remove(schedule.id);
            debug!(schedule_id = schedule.id, "schedule disabled, no trigger installed");
            return Ok(AddOutcome::Disabled);
        }

        let cron = match parse_cron(&schedule.cron_expression) {
            Ok(cron) => cron,
            Err(e) => {
                self.remove(schedule.id);
                return Err(e);
            }
        };

        let token_cell = Arc::new(OnceLock::new());
        let job = firing_job(Arc::downgrade(&self.inner), schedule.id, token_cell.clone());

        let mut triggers = self.inner.triggers();
        if let Some(previous) = triggers.remove(&schedule.id) {
            self.inner.registry.mark_deleted(schedule.id);
            self.inner.driver.cancel(previous);
        }
        let trigger_id = self.inner.driver.install(cron, job);
        let token = self.inner.registry.register(schedule.id, trigger_id);
        let _ = token_cell.set(token);
        triggers.insert(schedule.id, trigger_id);
        drop(triggers);

        info!(
            schedule_id = schedule.id,
            schedule = %schedule.name,
            cron = %schedule.cron_expression,
            trigger = %trigger_id,
            token = %token,
            "schedule trigger installed"
        );
        Ok(AddOutcome::Installed { token, trigger_id })
    }

    /// Stop a schedule's trigger and invalidate any firing in flight.
    /// Returns whether anything was live.
    pub fn remove(&self, schedule_id: ScheduleId) -> bool {
        let mut triggers = self.inner.triggers();
        let marked = self.inner.registry.mark_deleted(schedule_id);
        let cancelled = triggers
            .remove(&schedule_id)
            .map(|id| self.inner.driver.cancel(id))
            .unwrap_or(false);
        self.inner.registry.remove(schedule_id);
        drop(triggers);

        if marked || cancelled {
            info!(schedule_id, "schedule trigger removed");
        }
        marked || cancelled
    }

    /// Run one inspection right away. Does not consult task controls.
    pub async fn run_by_cluster(
        &self,
        schedule_id: Option<ScheduleId>,
        cluster: &ClusterRef,
        trigger_type: TriggerType,
    ) -> Result<Run, InspectionError> {
        let outcome = self
            .inner
            .orchestrator
            .inspect(schedule_id, cluster, trigger_type)
            .await?;
        let run = outcome.run.clone();
        self.inner.deliver(outcome);
        Ok(run)
    }

    /// Reconcile live triggers with the stored schedules.
    pub async fn update_config(&self) -> Result<ReconcileReport, InspectionError> {
        let schedules = self.inner.store.list_schedules().await?;
        let mut report = ReconcileReport::default();
        let known: HashSet<ScheduleId> = schedules.iter().map(|s| s.id).collect();

        for schedule in &schedules {
            if schedule.enabled {
                match self.install(schedule) {
                    Ok(_) => report.installed.push(schedule.id),
                    Err(e) => {
                        warn!(schedule_id = schedule.id, error = %e, "failed to install schedule");
                        report.failed.push((schedule.id, e.to_string()));
                    }
                }
            } else if self.remove(schedule.id) {
                report.removed.push(schedule.id);
            }
        }

        let vanished: Vec<ScheduleId> = self
            .inner
            .triggers()
            .keys()
            .filter(|id| !known.contains(id))
            .copied()
            .collect();
        for id in vanished {
            if self.remove(id) {
                report.removed.push(id);
            }
        }

        info!(
            installed = report.installed.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "schedules reconciled"
        );
        Ok(report)
    }

    // ── Diagnostics ───────────────────────────────────────────

    pub fn active_controls(&self) -> Vec<TaskControl> {
        self.inner.registry.list_active()
    }

    pub fn live_trigger_count(&self) -> usize {
        self.inner.driver.live_count()
    }

    /// Wait for run reports still being delivered.
    pub async fn flush_deliveries(&self) {
        let mut pending = std::mem::take(&mut *self.inner.deliveries());
        while pending.join_next().await.is_some() {}
    }

    /// Remove every trigger. Runs already in progress are left to finish.
    pub fn shutdown(&self) {
        let ids: Vec<ScheduleId> = self.inner.triggers().keys().copied().collect();
        for id in &ids {
            self.remove(*id);
        }
        info!(schedules = ids.len(), "schedule manager shut down");
    }
}

impl Inner {
    fn triggers(&self) -> MutexGuard<'_, HashMap<ScheduleId, TriggerId>> {
        self.triggers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deliveries(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.deliveries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One firing: reload the schedule and inspect every cluster concurrently.
    async fn fire(self: Arc<Self>, schedule_id: ScheduleId) {
        let schedule = match self.store.get_schedule(schedule_id).await {
            Ok(Some(schedule)) => schedule,
            Ok(None) => {
                debug!(schedule_id, "schedule vanished before firing");
                return;
            }
            Err(e) => {
                warn!(schedule_id, error = %e, "failed to load schedule for firing");
                return;
            }
        };

        let mut runs = JoinSet::new();
        for cluster in schedule.clusters {
            let inner = self.clone();
            runs.spawn(async move {
                match inner
                    .orchestrator
                    .inspect(Some(schedule_id), &cluster, TriggerType::Cron)
                    .await
                {
                    Ok(outcome) => inner.deliver(outcome),
                    Err(e) => {
                        warn!(schedule_id, cluster = %cluster, error = %e, "scheduled inspection failed")
                    }
                }
            });
        }
        while let Some(joined) = runs.join_next().await {
            if let Err(e) = joined {
                warn!(schedule_id, error = %e, "inspection task panicked");
            }
        }
    }

    /// Push the run report to the schedule's receivers in the background.
    fn deliver(&self, outcome: InspectionOutcome) {
        if outcome.receivers.is_empty() {
            return;
        }
        let text = match self.renderer.run_report(&outcome.run, &outcome.events) {
            Ok(text) => text,
            Err(e) => {
                warn!(run_id = outcome.run.id, error = %e, "failed to render run report");
                return;
            }
        };

        let pusher = self.pusher.clone();
        let run_id = outcome.run.id;
        let receivers = outcome.receivers;
        let mut deliveries = self.deliveries();
        while deliveries.try_join_next().is_some() {}
        deliveries.spawn(async move {
            let results = pusher.push_message(&text, &receivers).await;
            let failed = results.iter().filter(|r| !r.success).count();
            if failed > 0 {
                warn!(run_id, failed, total = results.len(), "run report delivery incomplete");
            } else {
                debug!(run_id, total = results.len(), "run report delivered");
            }
        });
    }
}

fn firing_job(
    inner: Weak<Inner>,
    schedule_id: ScheduleId,
    token: Arc<OnceLock<TaskToken>>,
) -> FiringJob {
    Arc::new(move || {
        let inner = inner.clone();
        let token = token.clone();
        async move {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let live = token.get().is_some_and(|t| !inner.registry.is_deleted(t));
            if !live {
                debug!(schedule_id, "stale firing skipped");
                return;
            }
            inner.fire(schedule_id).await;
        }
        .boxed()
    })
}
