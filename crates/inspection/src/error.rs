use kinspect_core::ScheduleId;
use kinspect_sandbox::SandboxError;
use kinspect_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum InspectionError {
    #[error("schedule {0} not found")]
    ScheduleNotFound(ScheduleId),

    #[error("invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}
