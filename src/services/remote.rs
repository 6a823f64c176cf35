use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use uuid::Uuid;

use crate::error::{CaasError, Result};
use crate::proto::batch_peer_client::BatchPeerClient;
use crate::proto::creds_peer_client::CredsPeerClient;
use crate::proto::data_peer_client::DataPeerClient;
use crate::proto::{
    CancelRunRequest, DataKey, DataPutRequest, IssueCredentialsRequest, RevokeCredentialsRequest,
    RunJobRequest, ValidateCredentialsRequest,
};
use crate::scheduler::job::JobRecord;
use crate::services::{
    BatchService, Credential, CredsService, DataService, ExecutionOutcome, ServiceKind,
};

/// Upper bound on a single peer message; simulation databases can be large.
pub const MAX_MESSAGE_BYTES: usize = 256 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A lazily connected channel: nothing is dialled until the first call, so an
/// unreachable peer never blocks startup.
fn lazy_channel(kind: ServiceKind, url: &str, timeout: Option<Duration>) -> Result<Channel> {
    let mut endpoint = Endpoint::from_shared(url.to_string()).map_err(|e| {
        CaasError::InvalidConfig(format!("invalid {} service url '{}': {}", kind, url, e))
    })?;
    endpoint = endpoint.connect_timeout(CONNECT_TIMEOUT);
    if let Some(timeout) = timeout {
        endpoint = endpoint.timeout(timeout);
    }
    Ok(endpoint.connect_lazy())
}

/// Translate a peer's status into the local taxonomy. Anything that is not a
/// definite answer from the peer means the delegate is unavailable.
pub fn status_to_error(kind: ServiceKind, status: Status) -> CaasError {
    match status.code() {
        Code::NotFound => CaasError::NotFound(status.message().to_string()),
        Code::InvalidArgument => CaasError::InvalidArgument(status.message().to_string()),
        code => {
            tracing::warn!(service = %kind, code = ?code, error = %status.message(), "Remote service call failed");
            CaasError::unavailable(kind, format!("{:?}: {}", code, status.message()))
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Data service forwarded to a peer's `DataPeer`.
#[derive(Debug, Clone)]
pub struct RemoteData {
    client: DataPeerClient<Channel>,
}

impl RemoteData {
    pub fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let channel = lazy_channel(ServiceKind::Data, url, Some(timeout))?;
        Ok(Self {
            client: DataPeerClient::new(channel)
                .max_decoding_message_size(MAX_MESSAGE_BYTES)
                .max_encoding_message_size(MAX_MESSAGE_BYTES),
        })
    }
}

#[tonic::async_trait]
impl DataService for RemoteData {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let mut client = self.client.clone();
        client
            .put(DataPutRequest {
                key: key.to_string(),
                data,
            })
            .await
            .map_err(|s| status_to_error(ServiceKind::Data, s))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let mut client = self.client.clone();
        let response = client
            .get(DataKey {
                key: key.to_string(),
            })
            .await
            .map_err(|s| status_to_error(ServiceKind::Data, s))?;
        Ok(response.into_inner().data)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .delete(DataKey {
                key: key.to_string(),
            })
            .await
            .map_err(|s| status_to_error(ServiceKind::Data, s))?;
        Ok(())
    }
}

/// Credential service forwarded to a peer's `CredsPeer`.
#[derive(Debug, Clone)]
pub struct RemoteCreds {
    client: CredsPeerClient<Channel>,
}

impl RemoteCreds {
    pub fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let channel = lazy_channel(ServiceKind::Creds, url, Some(timeout))?;
        Ok(Self {
            client: CredsPeerClient::new(channel),
        })
    }
}

#[tonic::async_trait]
impl CredsService for RemoteCreds {
    async fn issue(&self, user: &str) -> Result<Credential> {
        let mut client = self.client.clone();
        let credential = client
            .issue(IssueCredentialsRequest {
                user: user.to_string(),
            })
            .await
            .map_err(|s| status_to_error(ServiceKind::Creds, s))?
            .into_inner();
        let issued_at = Utc
            .timestamp_millis_opt(credential.issued_at_ms)
            .single()
            .unwrap_or_else(Utc::now);
        Ok(Credential {
            token: credential.token,
            user: credential.user,
            issued_at,
        })
    }

    async fn validate(&self, token: &str) -> Result<String> {
        let mut client = self.client.clone();
        let response = client
            .validate(ValidateCredentialsRequest {
                token: token.to_string(),
            })
            .await
            .map_err(|s| status_to_error(ServiceKind::Creds, s))?;
        Ok(response.into_inner().user)
    }

    async fn revoke(&self, token: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .revoke(RevokeCredentialsRequest {
                token: token.to_string(),
            })
            .await
            .map_err(|s| status_to_error(ServiceKind::Creds, s))?;
        Ok(())
    }
}

/// Batch service forwarded to a peer's `BatchPeer`. Runs can be long, so no
/// request deadline is applied.
#[derive(Debug, Clone)]
pub struct RemoteBatch {
    client: BatchPeerClient<Channel>,
}

impl RemoteBatch {
    pub fn connect(url: &str) -> Result<Self> {
        let channel = lazy_channel(ServiceKind::Batch, url, None)?;
        Ok(Self {
            client: BatchPeerClient::new(channel)
                .max_decoding_message_size(MAX_MESSAGE_BYTES)
                .max_encoding_message_size(MAX_MESSAGE_BYTES),
        })
    }
}

#[tonic::async_trait]
impl BatchService for RemoteBatch {
    async fn run(&self, job: &JobRecord, cancel: CancellationToken) -> Result<ExecutionOutcome> {
        let mut client = self.client.clone();
        let run_id = Uuid::new_v4().simple().to_string();
        let request = RunJobRequest {
            jobid: job.jobid,
            user: job.user.clone(),
            project: job.project.clone(),
            payload: job.payload.clone(),
            run_id: run_id.clone(),
        };

        tokio::select! {
            response = client.run(request) => {
                let response = response
                    .map_err(|s| status_to_error(ServiceKind::Batch, s))?
                    .into_inner();
                Ok(ExecutionOutcome {
                    success: response.success,
                    exit_code: response.exit_code,
                    output: non_empty(response.output),
                    error: non_empty(response.error),
                    artifact: response.has_artifact.then_some(response.artifact),
                })
            }
            _ = cancel.cancelled() => {
                // Abandoning the call already aborts the peer's handler; tell
                // it explicitly as well in case the stream is slow to reset.
                let mut client = self.client.clone();
                let request = CancelRunRequest { jobid: job.jobid, run_id };
                if let Err(status) = client.cancel_run(request).await {
                    tracing::warn!(jobid = job.jobid, error = %status.message(), "Remote cancel failed");
                }
                Ok(ExecutionOutcome::canceled())
            }
        }
    }
}
