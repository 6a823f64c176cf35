//! End-to-end tests for a whole node: configuration, startup recovery and
//! the served API with the real local providers.

mod test_harness;

use std::fs;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use caas::error::CaasError;
use caas::node::Node;
use caas::proto::scheduler_service_client::SchedulerServiceClient;
use caas::proto::{FetchResultRequest, GetJobStatusRequest, JobState as ProtoJobState, SubmitJobRequest};
use caas::scheduler::job::{JobRecord, JobState, Submission};
use caas::store::{FsStateStore, StateStore};
use test_harness::{assert_eventually, test_config};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn test_node_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir, 1);
    config.njobs = 0;

    assert!(matches!(Node::new(config), Err(CaasError::InvalidConfig(_))));
}

#[test]
fn test_node_startup_recovers_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir, 2);
    config.ensure_dirs().unwrap();

    // Leftovers of a crashed process: a running job, a half-written file and
    // a counter that fell behind
    let store = FsStateStore::open(&config).unwrap();
    let mut record = JobRecord::new(17, &Submission::new("alice", "reactors", "<sim/>"));
    store.put(&record).unwrap();
    record = store
        .move_job(17, JobState::Queued, JobState::Running, None)
        .unwrap();
    fs::write(config.queued_jobs_dir.join(".18.0000.tmp"), b"{").unwrap();
    fs::write(&config.jobid_file, "3\n").unwrap();

    let node = Node::new(config).unwrap();

    assert_eq!(node.recovery.temp_files_removed, 1);
    assert_eq!(node.recovery.orphans_failed, vec![record.jobid]);
    assert_eq!(node.recovery.next_jobid_floor, 17);
    assert_eq!(node.recovery.running, 0);
    assert_eq!(node.manager.status(17).unwrap().state, JobState::Failed);

    let next = node
        .manager
        .submit(Submission::new("alice", "reactors", "<sim/>"))
        .unwrap();
    assert_eq!(next, 18);
}

#[tokio::test]
async fn test_node_serves_simulations() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir, 2);
    config.port = free_port();
    config.runner = vec![
        "sh".to_string(),
        "-c".to_string(),
        "cp {input} {output}".to_string(),
    ];
    let port = config.port;

    let node = Node::new(config).unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(node.run(shutdown.clone()));

    let url = format!("http://127.0.0.1:{}", port);
    let mut client = None;
    for _ in 0..50 {
        match SchedulerServiceClient::connect(url.clone()).await {
            Ok(c) => {
                client = Some(c);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    let mut client = client.expect("node should accept connections");

    let jobid = client
        .submit_job(SubmitJobRequest {
            user: "alice".to_string(),
            project: "reactors".to_string(),
            name: String::new(),
            payload: "<simulation>42</simulation>".to_string(),
        })
        .await
        .unwrap()
        .into_inner()
        .jobid;

    let poller = client.clone();
    assert_eventually(
        || {
            let mut poller = poller.clone();
            async move {
                poller
                    .get_job_status(GetJobStatusRequest { jobid })
                    .await
                    .map(|r| r.into_inner().state == ProtoJobState::Completed as i32)
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(10),
        "simulation should complete",
    )
    .await;

    let result = client
        .fetch_result(FetchResultRequest { jobid })
        .await
        .unwrap()
        .into_inner();
    assert!(result.has_artifact);
    assert_eq!(result.artifact, b"<simulation>42</simulation>");

    shutdown.cancel();
    let served = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("node should stop on shutdown")
        .unwrap();
    assert!(served.is_ok());
}
