use thiserror::Error;

use crate::scheduler::job::{JobId, JobState};
use crate::services::ServiceKind;

#[derive(Error, Debug)]
pub enum CaasError {
    /// Persisted counter or alias data could not be read back.
    #[error("Store corruption in {path}: {reason}")]
    StoreCorruption { path: String, reason: String },

    /// A state move lost a race: the job was not in the expected state.
    #[error("Conflict moving job {jobid}: expected {expected}, found {actual:?}")]
    Conflict {
        jobid: JobId,
        expected: JobState,
        actual: Option<JobState>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Job {jobid} is already {state}")]
    AlreadyTerminal { jobid: JobId, state: JobState },

    #[error("Job {jobid} has not finished (currently {state})")]
    NotFinished { jobid: JobId, state: JobState },

    #[error("{kind} service unavailable: {reason}")]
    ServiceUnavailable { kind: ServiceKind, reason: String },

    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CaasError {
    pub fn job_not_found(jobid: JobId) -> Self {
        CaasError::NotFound(format!("job {}", jobid))
    }

    pub fn unavailable(kind: ServiceKind, reason: impl Into<String>) -> Self {
        CaasError::ServiceUnavailable {
            kind,
            reason: reason.into(),
        }
    }

    pub fn corruption(path: &std::path::Path, reason: impl Into<String>) -> Self {
        CaasError::StoreCorruption {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, CaasError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CaasError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, CaasError>;
