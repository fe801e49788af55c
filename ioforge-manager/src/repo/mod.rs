pub mod execution;
pub mod precheck;
pub mod worker;

pub use execution::{DbExecutionRepo, ExecutionRecord, ExecutionRepo, ExecutionUpdate};
pub use precheck::{DbPrecheckRepo, PrecheckRecord, PrecheckRepo};
pub use worker::{DbWorkerRepo, WorkerRecord, WorkerRepo};

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(error: sqlx::Error) -> Self {
        RepoError::Internal(error.to_string())
    }
}
