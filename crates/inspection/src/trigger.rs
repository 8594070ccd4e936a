//! Periodic triggers.
//!
//! A [`TriggerDriver`] owns the timing; what happens on each tick is an
//! opaque [`FiringJob`]. Cancelling a trigger stops future firings only:
//! a job that has already been spawned keeps running.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::error::InspectionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TriggerId(pub u64);

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trigger-{}", self.0)
    }
}

/// Work run on each tick. Called once per firing.
pub type FiringJob = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub trait TriggerDriver: Send + Sync {
    /// Start firing `job` at every instant of `schedule`.
    fn install(&self, schedule: Schedule, job: FiringJob) -> TriggerId;

    /// Stop a trigger. Returns whether it was live.
    fn cancel(&self, id: TriggerId) -> bool;

    /// Number of triggers that can still fire.
    fn live_count(&self) -> usize;
}

// ── Cron parsing ──────────────────────────────────────────────

/// Normalize a 5-field cron expression to 6-field by prepending "0 " for seconds.
pub fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

pub fn parse_cron(expr: &str) -> Result<Schedule, InspectionError> {
    Schedule::from_str(&normalize_cron(expr)).map_err(|e| InspectionError::InvalidCron {
        expression: expr.to_string(),
        message: e.to_string(),
    })
}

// ── Tokio driver ──────────────────────────────────────────────

/// One tokio task per trigger that sleeps until the next cron instant and
/// spawns the job on its own task.
///
/// `install` must be called from within a tokio runtime.
#[derive(Default)]
pub struct TokioCronDriver {
    next_id: AtomicU64,
    loops: Mutex<HashMap<TriggerId, AbortHandle>>,
}

impl TokioCronDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn loops(&self) -> MutexGuard<'_, HashMap<TriggerId, AbortHandle>> {
        self.loops.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TriggerDriver for TokioCronDriver {
    fn install(&self, schedule: Schedule, job: FiringJob) -> TriggerId {
        let id = TriggerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);

        let handle = tokio::spawn(async move {
            let mut cursor = Utc::now();
            loop {
                let Some(next) = schedule.after(&cursor).next() else {
                    debug!(trigger = %id, "cron schedule exhausted");
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                cursor = next;
                debug!(trigger = %id, at = %next, "trigger fired");
                tokio::spawn(job());
            }
        });

        self.loops().insert(id, handle.abort_handle());
        id
    }

    fn cancel(&self, id: TriggerId) -> bool {
        match self.loops().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn live_count(&self) -> usize {
        let mut loops = self.loops();
        loops.retain(|_, handle| !handle.is_finished());
        loops.len()
    }
}

impl Drop for TokioCronDriver {
    fn drop(&mut self) {
        for handle in self.loops().values() {
            handle.abort();
        }
    }
}

// ── Manual driver ─────────────────────────────────────────────

/// Driver that never fires on its own; callers fire triggers explicitly.
/// Used for deterministic tests and one-off tooling.
#[derive(Default)]
pub struct ManualDriver {
    next_id: AtomicU64,
    jobs: Mutex<HashMap<TriggerId, (Schedule, FiringJob)>>,
}

impl ManualDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<TriggerId, (Schedule, FiringJob)>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The job installed under `id`, if still live. Holding on to it
    /// simulates a firing that was dispatched before a cancel.
    pub fn job(&self, id: TriggerId) -> Option<FiringJob> {
        self.jobs().get(&id).map(|(_, job)| job.clone())
    }

    pub fn schedule(&self, id: TriggerId) -> Option<Schedule> {
        self.jobs().get(&id).map(|(schedule, _)| schedule.clone())
    }

    pub fn ids(&self) -> Vec<TriggerId> {
        let mut ids: Vec<TriggerId> = self.jobs().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Run one firing of `id` to completion. Returns false if not live.
    pub async fn fire(&self, id: TriggerId) -> bool {
        match self.job(id) {
            Some(job) => {
                job().await;
                true
            }
            None => false,
        }
    }
}

impl TriggerDriver for ManualDriver {
    fn install(&self, schedule: Schedule, job: FiringJob) -> TriggerId {
        let id = TriggerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.jobs().insert(id, (schedule, job));
        id
    }

    fn cancel(&self, id: TriggerId) -> bool {
        self.jobs().remove(&id).is_some()
    }

    fn live_count(&self) -> usize {
        self.jobs().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn counting_job(count: &Arc<AtomicUsize>) -> FiringJob {
        let count = count.clone();
        Arc::new(move || {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[test]
    fn five_field_expressions_get_seconds() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron(" 0 0 * * * * "), "0 0 * * * *");
        assert!(parse_cron("* * * * *").is_ok());
        assert!(parse_cron("0 30 9 * * Mon-Fri").is_ok());
    }

    #[test]
    fn malformed_expression_is_rejected() {
        match parse_cron("not-a-cron") {
            Err(InspectionError::InvalidCron { expression, .. }) => {
                assert_eq!(expression, "not-a-cron")
            }
            other => panic!("expected InvalidCron, got {other:?}"),
        }
        assert!(parse_cron("61 * * * *").is_err());
    }

    #[tokio::test]
    async fn manual_driver_fires_until_cancelled() {
        let driver = ManualDriver::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = driver.install(parse_cron("* * * * *").unwrap(), counting_job(&count));

        assert!(driver.fire(id).await);
        assert!(driver.fire(id).await);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(driver.cancel(id));
        assert!(!driver.cancel(id));
        assert!(!driver.fire(id).await);
        assert_eq!(driver.live_count(), 0);
    }

    #[tokio::test]
    async fn tokio_driver_fires_every_second() {
        let driver = TokioCronDriver::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = driver.install(parse_cron("* * * * * *").unwrap(), counting_job(&count));
        assert_eq!(driver.live_count(), 1);

        tokio::time::sleep(Duration::from_millis(2300)).await;
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 1, "expected at least one firing, got {fired}");

        assert!(driver.cancel(id));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.live_count(), 0);

        let after_cancel = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
    }
}
