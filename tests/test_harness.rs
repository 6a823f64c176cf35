//! Test harness for scheduler integration tests.
//!
//! Provides temp-dir configurations, a controllable batch service and a
//! running scheduler loop.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use caas::config::CaasConfig;
use caas::error::Result;
use caas::scheduler::job::{JobId, JobRecord, JobState};
use caas::scheduler::JobManager;
use caas::services::{
    BatchService, DataService, ExecutionOutcome, LocalCreds, LocalData, ServiceLocator,
};

/// Configuration rooted in a fresh temp dir, with fast loop intervals.
pub fn test_config(dir: &TempDir, njobs: usize) -> CaasConfig {
    let mut config = CaasConfig::with_roots(dir.path().join("config"), dir.path().join("data"));
    config.njobs = njobs;
    config.poll_interval = Duration::from_millis(20);
    config.sweep_interval = Duration::from_secs(3600);
    config.remote_timeout = Duration::from_secs(2);
    config
}

pub fn success(output: &str) -> ExecutionOutcome {
    ExecutionOutcome {
        success: true,
        exit_code: Some(0),
        output: Some(output.to_string()),
        error: None,
        artifact: Some(format!("db for {}", output).into_bytes()),
    }
}

pub fn failure(error: &str) -> ExecutionOutcome {
    ExecutionOutcome {
        success: false,
        exit_code: Some(1),
        output: None,
        error: Some(error.to_string()),
        artifact: None,
    }
}

/// Batch service whose runs block until the test releases them.
///
/// With `auto_complete` every run succeeds immediately instead.
#[derive(Default)]
pub struct StubBatch {
    auto_complete: bool,
    pending: Mutex<HashMap<JobId, oneshot::Sender<ExecutionOutcome>>>,
    started: Mutex<Vec<JobId>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    cancelled: Mutex<Vec<JobId>>,
}

impl StubBatch {
    pub fn gated() -> Self {
        Self::default()
    }

    pub fn auto_complete() -> Self {
        Self {
            auto_complete: true,
            ..Self::default()
        }
    }

    /// Jobids in the order their runs started.
    pub fn started(&self) -> Vec<JobId> {
        self.started.lock().unwrap().clone()
    }

    pub fn is_running(&self, jobid: JobId) -> bool {
        self.pending.lock().unwrap().contains_key(&jobid)
    }

    /// Most runs ever in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> Vec<JobId> {
        self.cancelled.lock().unwrap().clone()
    }

    /// Finish a blocked run. Returns false if `jobid` is not running.
    pub fn finish(&self, jobid: JobId, outcome: ExecutionOutcome) -> bool {
        match self.pending.lock().unwrap().remove(&jobid) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

#[tonic::async_trait]
impl BatchService for StubBatch {
    async fn run(&self, job: &JobRecord, cancel: CancellationToken) -> Result<ExecutionOutcome> {
        self.started.lock().unwrap().push(job.jobid);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let outcome = if self.auto_complete {
            success(&format!("job {}", job.jobid))
        } else {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().unwrap().insert(job.jobid, tx);
            tokio::select! {
                outcome = rx => outcome.unwrap_or_else(|_| failure("dropped")),
                _ = cancel.cancelled() => {
                    self.pending.lock().unwrap().remove(&job.jobid);
                    self.cancelled.lock().unwrap().push(job.jobid);
                    ExecutionOutcome::canceled()
                }
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(outcome)
    }
}

/// A scheduler over a temp dir with the stub batch service, running its loop
/// in the background.
pub struct TestScheduler {
    pub dir: TempDir,
    pub config: CaasConfig,
    pub manager: Arc<JobManager>,
    pub batch: Arc<StubBatch>,
    shutdown: CancellationToken,
    // Not aborted on drop; the test runtime tears the loop down with it.
    handle: JoinHandle<()>,
}

impl TestScheduler {
    pub async fn start(njobs: usize, batch: StubBatch) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, njobs);
        Self::start_with(dir, config, batch).await
    }

    pub async fn start_with(dir: TempDir, config: CaasConfig, batch: StubBatch) -> Self {
        let batch = Arc::new(batch);
        let manager = Arc::new(build_manager(&config, batch.clone(), None));
        manager.recover().unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(manager.clone().run(shutdown.clone()));

        Self {
            dir,
            config,
            manager,
            batch,
            shutdown,
            handle,
        }
    }

    pub fn state(&self, jobid: JobId) -> Option<JobState> {
        self.manager.store().locate(jobid).unwrap()
    }

    pub async fn wait_for_state(&self, jobid: JobId, state: JobState) -> bool {
        wait_for(
            || async { self.state(jobid) == Some(state) },
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
    }

    pub async fn wait_for_started(&self, jobid: JobId) -> bool {
        wait_for(
            || async { self.batch.is_running(jobid) },
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
    }

    /// Stop the loop and wait for it, keeping the temp dir.
    pub async fn stop(self) -> (TempDir, CaasConfig) {
        self.shutdown.cancel();
        let _ = self.handle.await;
        (self.dir, self.config)
    }
}

/// Manager over `config` with local data and creds, the given batch service
/// and optionally a substitute data service.
pub fn build_manager(
    config: &CaasConfig,
    batch: Arc<dyn BatchService>,
    data: Option<Arc<dyn DataService>>,
) -> JobManager {
    config.ensure_dirs().unwrap();
    let data = data.unwrap_or_else(|| {
        Arc::new(LocalData::new(&config.data_dir, &config.paths_dir)) as Arc<dyn DataService>
    });
    let services = ServiceLocator::new(data, Arc::new(LocalCreds::new(&config.creds_dir)), batch);
    JobManager::from_config(config, services).unwrap()
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
