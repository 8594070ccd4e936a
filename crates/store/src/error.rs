use kinspect_core::ModelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },

    /// The run already left `running`; completed runs are immutable.
    #[error("run {0} is already finished")]
    RunFinished(i64),

    #[error("corrupt row: {0}")]
    Corrupt(#[from] ModelError),
}
