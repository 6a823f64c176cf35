pub mod peer_service;
pub mod scheduler_service;
pub mod server;

pub use peer_service::{BatchPeerService, CredsPeerService, DataPeerService};
pub use scheduler_service::SchedulerServiceImpl;
pub use server::GrpcServer;

use tonic::Status;

use crate::error::CaasError;
use crate::proto::{JobInfo, JobState as ProtoJobState};
use crate::scheduler::job::{JobRecord, JobState};

impl From<CaasError> for Status {
    fn from(err: CaasError) -> Self {
        let message = err.to_string();
        match err {
            CaasError::NotFound(_) => Status::not_found(message),
            CaasError::AlreadyTerminal { .. } | CaasError::NotFinished { .. } => {
                Status::failed_precondition(message)
            }
            CaasError::ServiceUnavailable { .. } => Status::unavailable(message),
            CaasError::Conflict { .. } => Status::aborted(message),
            CaasError::StoreCorruption { .. } => Status::data_loss(message),
            CaasError::InvalidArgument(_) | CaasError::InvalidConfig(_) => {
                Status::invalid_argument(message)
            }
            CaasError::ExecutionFailure(_) | CaasError::Io(_) | CaasError::Internal(_) => {
                Status::internal(message)
            }
        }
    }
}

pub fn state_to_proto(state: JobState) -> ProtoJobState {
    match state {
        JobState::Queued => ProtoJobState::Queued,
        JobState::Running => ProtoJobState::Running,
        JobState::Completed => ProtoJobState::Completed,
        JobState::Failed => ProtoJobState::Failed,
        JobState::Canceled => ProtoJobState::Canceled,
    }
}

/// `None` for `JOB_STATE_UNSPECIFIED` and unknown values.
pub fn state_from_proto(value: i32) -> Option<JobState> {
    match ProtoJobState::try_from(value).ok()? {
        ProtoJobState::Unspecified => None,
        ProtoJobState::Queued => Some(JobState::Queued),
        ProtoJobState::Running => Some(JobState::Running),
        ProtoJobState::Completed => Some(JobState::Completed),
        ProtoJobState::Failed => Some(JobState::Failed),
        ProtoJobState::Canceled => Some(JobState::Canceled),
    }
}

pub fn record_to_proto(record: &JobRecord) -> JobInfo {
    let outcome = record.outcome.as_ref();
    JobInfo {
        jobid: record.jobid,
        user: record.user.clone(),
        project: record.project.clone(),
        name: record.name.clone().unwrap_or_default(),
        state: state_to_proto(record.state) as i32,
        created_at_ms: record.created_at.timestamp_millis(),
        transitioned_at_ms: record.transitioned_at.timestamp_millis(),
        exit_code: outcome.and_then(|o| o.exit_code),
        error: outcome.and_then(|o| o.error.clone()).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::Submission;
    use tonic::Code;

    #[test]
    fn state_conversion_is_symmetric() {
        for state in JobState::ALL {
            assert_eq!(state_from_proto(state_to_proto(state) as i32), Some(state));
        }
        assert_eq!(state_from_proto(0), None);
        assert_eq!(state_from_proto(99), None);
    }

    #[test]
    fn errors_map_to_status_codes() {
        let status: Status = CaasError::job_not_found(3).into();
        assert_eq!(status.code(), Code::NotFound);

        let status: Status = CaasError::AlreadyTerminal {
            jobid: 3,
            state: JobState::Completed,
        }
        .into();
        assert_eq!(status.code(), Code::FailedPrecondition);

        let status: Status =
            CaasError::unavailable(crate::services::ServiceKind::Data, "down").into();
        assert_eq!(status.code(), Code::Unavailable);

        let status: Status = CaasError::corruption(std::path::Path::new("/x"), "bad").into();
        assert_eq!(status.code(), Code::DataLoss);
    }

    #[test]
    fn record_conversion() {
        let record = JobRecord::new(5, &Submission::new("alice", "reactors", "<sim/>"));
        let info = record_to_proto(&record);
        assert_eq!(info.jobid, 5);
        assert_eq!(info.state, ProtoJobState::Queued as i32);
        assert!(info.name.is_empty());
        assert!(info.exit_code.is_none());
    }
}
