//! Peer services a `caas` process exports so that other processes can bind
//! their `data_url`, `creds_url` or `batch_url` to it. Each one wraps this
//! process's own provider for that kind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::proto::batch_peer_server::BatchPeer;
use crate::proto::creds_peer_server::CredsPeer;
use crate::proto::data_peer_server::DataPeer;
use crate::proto::{
    CancelRunRequest, CancelRunResponse, Credential as ProtoCredential, DataDeleteResponse,
    DataGetResponse, DataKey, DataPutRequest, DataPutResponse, IssueCredentialsRequest,
    RevokeCredentialsRequest, RevokeCredentialsResponse, RunJobRequest, RunJobResponse,
    ValidateCredentialsRequest, ValidateCredentialsResponse,
};
use crate::scheduler::job::{JobRecord, JobState};
use crate::services::{BatchService, CredsService, DataService};

pub struct DataPeerService {
    data: Arc<dyn DataService>,
}

impl DataPeerService {
    pub fn new(data: Arc<dyn DataService>) -> Self {
        Self { data }
    }
}

#[tonic::async_trait]
impl DataPeer for DataPeerService {
    async fn put(
        &self,
        request: Request<DataPutRequest>,
    ) -> Result<Response<DataPutResponse>, Status> {
        let req = request.into_inner();
        self.data.put(&req.key, req.data).await?;
        Ok(Response::new(DataPutResponse {}))
    }

    async fn get(&self, request: Request<DataKey>) -> Result<Response<DataGetResponse>, Status> {
        let data = self.data.get(&request.into_inner().key).await?;
        Ok(Response::new(DataGetResponse { data }))
    }

    async fn delete(
        &self,
        request: Request<DataKey>,
    ) -> Result<Response<DataDeleteResponse>, Status> {
        self.data.delete(&request.into_inner().key).await?;
        Ok(Response::new(DataDeleteResponse {}))
    }
}

pub struct CredsPeerService {
    creds: Arc<dyn CredsService>,
}

impl CredsPeerService {
    pub fn new(creds: Arc<dyn CredsService>) -> Self {
        Self { creds }
    }
}

#[tonic::async_trait]
impl CredsPeer for CredsPeerService {
    async fn issue(
        &self,
        request: Request<IssueCredentialsRequest>,
    ) -> Result<Response<ProtoCredential>, Status> {
        let credential = self.creds.issue(&request.into_inner().user).await?;
        Ok(Response::new(ProtoCredential {
            token: credential.token,
            user: credential.user,
            issued_at_ms: credential.issued_at.timestamp_millis(),
        }))
    }

    async fn validate(
        &self,
        request: Request<ValidateCredentialsRequest>,
    ) -> Result<Response<ValidateCredentialsResponse>, Status> {
        let user = self.creds.validate(&request.into_inner().token).await?;
        Ok(Response::new(ValidateCredentialsResponse { user }))
    }

    async fn revoke(
        &self,
        request: Request<RevokeCredentialsRequest>,
    ) -> Result<Response<RevokeCredentialsResponse>, Status> {
        self.creds.revoke(&request.into_inner().token).await?;
        Ok(Response::new(RevokeCredentialsResponse {}))
    }
}

/// Runs jobs for a remote scheduler on this process's batch provider.
///
/// Runs are tracked by the caller's run id so `CancelRun` can stop them;
/// jobids are only unique per scheduler. A run is also cancelled when its
/// `Run` call is dropped by the caller.
pub struct BatchPeerService {
    batch: Arc<dyn BatchService>,
    runs: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl BatchPeerService {
    pub fn new(batch: Arc<dyn BatchService>) -> Self {
        Self {
            batch,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Cancels and forgets a run when the handler finishes or is dropped.
struct RunGuard {
    run_id: String,
    token: CancellationToken,
    runs: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.token.cancel();
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.run_id);
    }
}

#[tonic::async_trait]
impl BatchPeer for BatchPeerService {
    async fn run(&self, request: Request<RunJobRequest>) -> Result<Response<RunJobResponse>, Status> {
        let req = request.into_inner();
        let run_id = if req.run_id.is_empty() {
            Uuid::new_v4().simple().to_string()
        } else {
            req.run_id
        };
        let now = Utc::now();
        // Only the fields a batch provider reads are meaningful here.
        let job = JobRecord {
            jobid: req.jobid,
            user: req.user,
            project: req.project,
            name: None,
            payload: req.payload,
            state: JobState::Running,
            created_at: now,
            transitioned_at: now,
            outcome: None,
        };

        let token = CancellationToken::new();
        {
            let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
            if runs.contains_key(&run_id) {
                return Err(Status::already_exists(format!("run {} is in progress", run_id)));
            }
            runs.insert(run_id.clone(), token.clone());
        }
        let _guard = RunGuard {
            run_id: run_id.clone(),
            token: token.clone(),
            runs: Arc::clone(&self.runs),
        };

        tracing::info!(jobid = job.jobid, run_id = %run_id, "Running job for remote scheduler");
        let outcome = self.batch.run(&job, token).await?;

        Ok(Response::new(RunJobResponse {
            success: outcome.success,
            exit_code: outcome.exit_code,
            output: outcome.output.unwrap_or_default(),
            error: outcome.error.unwrap_or_default(),
            has_artifact: outcome.artifact.is_some(),
            artifact: outcome.artifact.unwrap_or_default(),
        }))
    }

    async fn cancel_run(
        &self,
        request: Request<CancelRunRequest>,
    ) -> Result<Response<CancelRunResponse>, Status> {
        let req = request.into_inner();
        let token = self
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&req.run_id)
            .cloned();
        let canceled = match token {
            Some(token) => {
                token.cancel();
                tracing::info!(jobid = req.jobid, run_id = %req.run_id, "Remote run canceled");
                true
            }
            None => false,
        };
        Ok(Response::new(CancelRunResponse { canceled }))
    }
}
