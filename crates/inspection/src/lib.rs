//! Periodic inspection engine.
//!
//! [`ScheduleManager`] maps persisted schedules onto live cron triggers,
//! [`TaskControlRegistry`] lets a removal invalidate a firing that is already
//! in flight, and [`Orchestrator`] turns one (schedule, cluster) pair into a
//! persisted run.

pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod task_control;
pub mod trigger;

pub use error::InspectionError;
pub use lifecycle::{AddOutcome, ReconcileReport, ScheduleManager};
pub use orchestrator::Orchestrator;
pub use task_control::{TaskControl, TaskControlRegistry, TaskToken};
pub use trigger::{FiringJob, ManualDriver, TokioCronDriver, TriggerDriver, TriggerId};
