use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::grpc::{record_to_proto, state_from_proto, state_to_proto};
use crate::proto::scheduler_service_server::SchedulerService;
use crate::proto::{
    AliasTarget as ProtoAliasTarget, CancelJobRequest, Credential as ProtoCredential,
    FetchResultRequest, FetchResultResponse, GetJobStatusRequest, IssueCredentialsRequest,
    JobInfo, JobState as ProtoJobState, ListJobsRequest, ListJobsResponse, ResolveAliasRequest,
    ResolveAliasResponse, SubmitJobRequest, SubmitJobResponse, ValidateCredentialsRequest,
    ValidateCredentialsResponse,
};
use crate::scheduler::job::Submission;
use crate::scheduler::JobManager;

/// gRPC service for the client-facing API
pub struct SchedulerServiceImpl {
    manager: Arc<JobManager>,
}

impl SchedulerServiceImpl {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self { manager }
    }
}

type JobStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<JobInfo, Status>> + Send>>;

#[tonic::async_trait]
impl SchedulerService for SchedulerServiceImpl {
    type StreamJobsStream = JobStream;

    async fn submit_job(
        &self,
        request: Request<SubmitJobRequest>,
    ) -> Result<Response<SubmitJobResponse>, Status> {
        let req = request.into_inner();

        if req.payload.trim().is_empty() {
            return Err(Status::invalid_argument("Payload cannot be empty"));
        }

        let mut submission = Submission::new(req.user, req.project, req.payload);
        if !req.name.trim().is_empty() {
            submission = submission.with_name(req.name);
        }

        let record = self
            .manager
            .blocking(move |m| m.submit(submission).and_then(|jobid| m.status(jobid)))
            .await?;

        Ok(Response::new(SubmitJobResponse {
            jobid: record.jobid,
            created_at_ms: record.created_at.timestamp_millis(),
        }))
    }

    async fn get_job_status(
        &self,
        request: Request<GetJobStatusRequest>,
    ) -> Result<Response<JobInfo>, Status> {
        let jobid = request.into_inner().jobid;
        let record = self.manager.blocking(move |m| m.status(jobid)).await?;
        Ok(Response::new(record_to_proto(&record)))
    }

    async fn cancel_job(
        &self,
        request: Request<CancelJobRequest>,
    ) -> Result<Response<JobInfo>, Status> {
        let jobid = request.into_inner().jobid;
        let record = self.manager.blocking(move |m| m.cancel(jobid)).await?;
        Ok(Response::new(record_to_proto(&record)))
    }

    async fn list_jobs(
        &self,
        request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        let state = state_from_proto(request.into_inner().state);
        let jobs = self
            .manager
            .blocking(move |m| m.list(state))
            .await?
            .iter()
            .map(record_to_proto)
            .collect();
        Ok(Response::new(ListJobsResponse { jobs }))
    }

    async fn stream_jobs(
        &self,
        request: Request<ListJobsRequest>,
    ) -> Result<Response<Self::StreamJobsStream>, Status> {
        let state = state_from_proto(request.into_inner().state);
        let records = self.manager.blocking(move |m| m.list(state)).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(32);

        tokio::spawn(async move {
            for record in records {
                if tx.send(Ok(record_to_proto(&record))).await.is_err() {
                    // Client disconnected
                    break;
                }
            }
        });

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::StreamJobsStream))
    }

    async fn fetch_result(
        &self,
        request: Request<FetchResultRequest>,
    ) -> Result<Response<FetchResultResponse>, Status> {
        let result = self.manager.fetch_result(request.into_inner().jobid).await?;
        let outcome = result.record.outcome.as_ref();

        Ok(Response::new(FetchResultResponse {
            job: Some(record_to_proto(&result.record)),
            output: outcome.and_then(|o| o.output.clone()).unwrap_or_default(),
            error: outcome.and_then(|o| o.error.clone()).unwrap_or_default(),
            has_artifact: result.artifact.is_some(),
            artifact: result.artifact.unwrap_or_default(),
        }))
    }

    async fn resolve_alias(
        &self,
        request: Request<ResolveAliasRequest>,
    ) -> Result<Response<ResolveAliasResponse>, Status> {
        let req = request.into_inner();
        let targets = self
            .manager
            .blocking(move |m| m.resolve_alias(&req.user, &req.project, &req.name))
            .await?
            .into_iter()
            .map(|t| ProtoAliasTarget {
                jobid: t.jobid,
                found: t.state.is_some(),
                state: t
                    .state
                    .map(state_to_proto)
                    .unwrap_or(ProtoJobState::Unspecified) as i32,
            })
            .collect();
        Ok(Response::new(ResolveAliasResponse { targets }))
    }

    async fn issue_credentials(
        &self,
        request: Request<IssueCredentialsRequest>,
    ) -> Result<Response<ProtoCredential>, Status> {
        let user = request.into_inner().user;
        let credential = self.manager.services().creds().issue(&user).await?;
        Ok(Response::new(ProtoCredential {
            token: credential.token,
            user: credential.user,
            issued_at_ms: credential.issued_at.timestamp_millis(),
        }))
    }

    async fn validate_credentials(
        &self,
        request: Request<ValidateCredentialsRequest>,
    ) -> Result<Response<ValidateCredentialsResponse>, Status> {
        let token = request.into_inner().token;
        let user = self.manager.services().creds().validate(&token).await?;
        Ok(Response::new(ValidateCredentialsResponse { user }))
    }
}
