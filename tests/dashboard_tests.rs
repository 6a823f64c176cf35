mod test_harness;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use caas::dashboard::{router, DashboardState};
use caas::scheduler::job::{JobState, Submission};
use test_harness::{success, StubBatch, TestScheduler};

fn app(sched: &TestScheduler) -> Router {
    router(DashboardState {
        manager: sched.manager.clone(),
    })
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health_reports_occupancy() {
    let sched = TestScheduler::start(2, StubBatch::gated()).await;
    let jobid = sched
        .manager
        .submit(Submission::new("alice", "reactors", "<sim/>"))
        .unwrap();
    assert!(sched.wait_for_started(jobid).await);

    let (status, body) = send(app(&sched), get("/api/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["njobs"], 2);
    assert_eq!(body["slots_in_use"], 1);
    assert_eq!(body["jobs"]["running"], 1);
    assert_eq!(body["jobs"]["queued"], 0);
    assert_eq!(body["jobs"]["canceled"], 0);

    sched.stop().await;
}

#[tokio::test]
async fn test_submit_then_get_job() {
    let sched = TestScheduler::start(1, StubBatch::gated()).await;

    let (status, body) = send(
        app(&sched),
        post_json(
            "/api/jobs",
            json!({"user": "alice", "project": "reactors", "name": "baseline", "payload": "<sim/>"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let jobid = body["jobid"].as_u64().unwrap();

    let (status, body) = send(app(&sched), get(&format!("/api/jobs/{}", jobid))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobid"], jobid);
    assert_eq!(body["user"], "alice");
    assert_eq!(body["name"], "baseline");

    sched.stop().await;
}

#[tokio::test]
async fn test_submit_validation() {
    let sched = TestScheduler::start(1, StubBatch::gated()).await;

    let (status, body) = send(
        app(&sched),
        post_json(
            "/api/jobs",
            json!({"user": "alice", "project": "reactors", "payload": "  "}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("payload"));

    let (status, _) = send(
        app(&sched),
        post_json(
            "/api/jobs",
            json!({"user": "", "project": "reactors", "payload": "<sim/>"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    sched.stop().await;
}

#[tokio::test]
async fn test_list_jobs_with_state_filter() {
    let sched = TestScheduler::start(1, StubBatch::gated()).await;
    let first = sched
        .manager
        .submit(Submission::new("alice", "reactors", "<a/>"))
        .unwrap();
    assert!(sched.wait_for_started(first).await);
    let second = sched
        .manager
        .submit(Submission::new("alice", "reactors", "<b/>"))
        .unwrap();

    let (status, body) = send(app(&sched), get("/api/jobs")).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<u64> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["jobid"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![first, second]);

    let (_, body) = send(app(&sched), get("/api/jobs?state=queued")).await;
    let jobs = body.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["jobid"], second);
    assert_eq!(jobs[0]["state"], "queued");

    let (status, _) = send(app(&sched), get("/api/jobs?state=sleeping")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    sched.stop().await;
}

#[tokio::test]
async fn test_cancel_via_delete() {
    let sched = TestScheduler::start(1, StubBatch::gated()).await;
    let jobid = sched
        .manager
        .submit(Submission::new("alice", "reactors", "<sim/>"))
        .unwrap();
    assert!(sched.wait_for_started(jobid).await);

    let (status, body) = send(app(&sched), delete(&format!("/api/jobs/{}", jobid))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "canceled");

    let (status, _) = send(app(&sched), delete(&format!("/api/jobs/{}", jobid))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(app(&sched), delete("/api/jobs/4040")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    sched.stop().await;
}

#[tokio::test]
async fn test_result_endpoint() {
    let sched = TestScheduler::start(1, StubBatch::gated()).await;
    let jobid = sched
        .manager
        .submit(Submission::new("alice", "reactors", "<sim/>"))
        .unwrap();
    assert!(sched.wait_for_started(jobid).await);

    let uri = format!("/api/jobs/{}/result", jobid);
    let (status, _) = send(app(&sched), get(&uri)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    sched.batch.finish(jobid, success("out"));
    assert!(sched.wait_for_state(jobid, JobState::Completed).await);

    let (status, body) = send(app(&sched), get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job"]["state"], "completed");
    assert_eq!(body["artifact_bytes"], "db for out".len());

    sched.stop().await;
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let sched = TestScheduler::start(1, StubBatch::gated()).await;

    let (status, body) = send(app(&sched), get("/api/jobs/77")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("77"));

    sched.stop().await;
}
