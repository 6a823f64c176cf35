use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::CaasError;
use crate::scheduler::job::{JobId, JobRecord, JobState, Submission};
use crate::scheduler::JobManager;

#[derive(Clone)]
pub struct DashboardState {
    pub manager: Arc<JobManager>,
}

#[derive(Serialize)]
struct HealthResponse {
    jobs: BTreeMap<JobState, usize>,
    slots_in_use: usize,
    njobs: usize,
}

#[derive(Deserialize)]
struct ListQuery {
    state: Option<String>,
}

#[derive(Deserialize)]
struct SubmitJobRequest {
    user: String,
    project: String,
    #[serde(default)]
    name: Option<String>,
    payload: String,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    jobid: JobId,
}

#[derive(Serialize)]
struct ResultResponse {
    job: JobRecord,
    /// Artifact size in bytes; the bytes themselves are served over gRPC.
    artifact_bytes: Option<usize>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

struct ApiError(CaasError);

impl From<CaasError> for ApiError {
    fn from(err: CaasError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CaasError::NotFound(_) => StatusCode::NOT_FOUND,
            CaasError::AlreadyTerminal { .. } | CaasError::NotFinished { .. } => {
                StatusCode::CONFLICT
            }
            CaasError::Conflict { .. } => StatusCode::CONFLICT,
            CaasError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CaasError::InvalidArgument(_) | CaasError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route(
            "/api/jobs/:jobid",
            get(job_status_handler).delete(cancel_job_handler),
        )
        .route("/api/jobs/:jobid/result", get(job_result_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    tracing::info!(addr = %addr, "Starting status API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind status API server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "Status API server failed");
    }
}

async fn health_handler(
    State(state): State<DashboardState>,
) -> Result<Json<HealthResponse>, ApiError> {
    let occupancy = state.manager.blocking(|m| m.occupancy()).await?;
    Ok(Json(HealthResponse {
        jobs: occupancy.counts,
        slots_in_use: occupancy.slots_in_use,
        njobs: occupancy.njobs,
    }))
}

async fn list_jobs_handler(
    State(state): State<DashboardState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<JobRecord>>, ApiError> {
    let filter = match query.state.as_deref() {
        None | Some("") | Some("all") => None,
        Some(s) => Some(s.parse::<JobState>()?),
    };
    Ok(Json(state.manager.blocking(move |m| m.list(filter)).await?))
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    if payload.payload.trim().is_empty() {
        return Err(CaasError::InvalidArgument("payload cannot be empty".into()).into());
    }
    let mut submission = Submission::new(payload.user, payload.project, payload.payload);
    if let Some(name) = payload.name.filter(|n| !n.trim().is_empty()) {
        submission = submission.with_name(name);
    }
    let jobid = state.manager.blocking(move |m| m.submit(submission)).await?;
    Ok((StatusCode::CREATED, Json(SubmitJobResponse { jobid })))
}

async fn job_status_handler(
    State(state): State<DashboardState>,
    Path(jobid): Path<JobId>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(state.manager.blocking(move |m| m.status(jobid)).await?))
}

async fn cancel_job_handler(
    State(state): State<DashboardState>,
    Path(jobid): Path<JobId>,
) -> Result<Json<JobRecord>, ApiError> {
    Ok(Json(state.manager.blocking(move |m| m.cancel(jobid)).await?))
}

async fn job_result_handler(
    State(state): State<DashboardState>,
    Path(jobid): Path<JobId>,
) -> Result<Json<ResultResponse>, ApiError> {
    let result = state.manager.fetch_result(jobid).await?;
    Ok(Json(ResultResponse {
        artifact_bytes: result.artifact.as_ref().map(Vec::len),
        job: result.record,
    }))
}
