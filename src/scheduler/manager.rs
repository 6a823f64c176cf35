//! The job lifecycle state machine.
//!
//! ```text
//! Queued --admit--> Running --ok--> Completed
//!                   Running --error--> Failed
//! Queued | Running --cancel--> Canceled
//! Completed | Failed | Canceled --sweep--> (deleted)
//! ```
//!
//! Every transition is a [`StateStore::move_job`]; whoever loses a race gets
//! [`CaasError::Conflict`] and backs off, so each job ends in exactly one
//! terminal state. Executions hold no scheduler lock while they run.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::CaasConfig;
use crate::error::{CaasError, Result};
use crate::scheduler::admission::{Admission, AdmissionController, SlotPermit};
use crate::scheduler::aliases::AliasBook;
use crate::scheduler::ids::IdAllocator;
use crate::scheduler::job::{JobId, JobOutcome, JobRecord, JobState, Submission};
use crate::scheduler::sweeper::{RetentionSweeper, SweepReport};
use crate::services::{ExecutionOutcome, ServiceKind, ServiceLocator};
use crate::store::{self, FsStateStore, StateStore};

/// Data service key under which a job's simulation output is stored.
pub fn artifact_key(jobid: JobId) -> String {
    format!("job-{}-output.sqlite", jobid)
}

/// A terminal job together with its stored artifact, if it has one.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub record: JobRecord,
    pub artifact: Option<Vec<u8>>,
}

/// One alias resolution: the job's current state, or `None` if it no longer
/// exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasTarget {
    pub jobid: JobId,
    pub state: Option<JobState>,
}

/// Per-state job counts plus slot usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupancy {
    pub counts: BTreeMap<JobState, usize>,
    pub slots_in_use: usize,
    pub njobs: usize,
}

/// What [`JobManager::recover`] repaired at startup.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub temp_files_removed: usize,
    pub duplicates_resolved: usize,
    pub records_repaired: usize,
    pub orphans_failed: Vec<JobId>,
    pub next_jobid_floor: JobId,
    pub running: usize,
}

pub struct JobManager {
    store: Arc<dyn StateStore>,
    ids: IdAllocator,
    aliases: AliasBook,
    admission: AdmissionController,
    services: ServiceLocator,
    sweeper: RetentionSweeper,
    /// Cancellation tokens of executions in flight, by jobid.
    executions: Mutex<HashMap<JobId, CancellationToken>>,
    wake: Notify,
    shutdown: CancellationToken,
    poll_interval: Duration,
    sweep_interval: Duration,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        ids: IdAllocator,
        aliases: AliasBook,
        services: ServiceLocator,
        njobs: usize,
        holding_time: Duration,
    ) -> Self {
        Self {
            admission: AdmissionController::new(Arc::clone(&store), njobs),
            sweeper: RetentionSweeper::new(Arc::clone(&store), services.data(), holding_time),
            store,
            ids,
            aliases,
            services,
            executions: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            poll_interval: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(60),
        }
    }

    /// Build a manager over the filesystem layout in `config`.
    pub fn from_config(config: &CaasConfig, services: ServiceLocator) -> Result<Self> {
        let store: Arc<dyn StateStore> = Arc::new(FsStateStore::open(config)?);
        let manager = Self::new(
            store,
            IdAllocator::open(&config.jobid_file)?,
            AliasBook::open(&config.job_aliases_file)?,
            services,
            config.njobs,
            config.holding_time,
        )
        .with_intervals(config.poll_interval, config.sweep_interval);
        Ok(manager)
    }

    pub fn with_intervals(mut self, poll: Duration, sweep: Duration) -> Self {
        self.poll_interval = poll;
        self.sweep_interval = sweep;
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn services(&self) -> &ServiceLocator {
        &self.services
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn sweeper(&self) -> &RetentionSweeper {
        &self.sweeper
    }

    /// Run synchronous manager calls (anything touching the store, the
    /// jobid counter or the alias log) off the async runtime.
    pub async fn blocking<T, F>(self: &Arc<Self>, op: F) -> Result<T>
    where
        F: FnOnce(&JobManager) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let manager = Arc::clone(self);
        store::blocking(move || op(&*manager)).await
    }

    /// Repair on-disk state after an unclean stop. Must run before the
    /// scheduler loop starts.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let reconciled = self.store.reconcile()?;

        // Nothing survives a restart, so whatever is still Running is dead.
        let mut orphans_failed = Vec::new();
        for jobid in self.store.list(JobState::Running)? {
            let outcome = JobOutcome::failure(
                CaasError::ExecutionFailure("interrupted by service restart".into()).to_string(),
            );
            match self
                .store
                .move_job(jobid, JobState::Running, JobState::Failed, Some(outcome))
            {
                Ok(_) => {
                    tracing::warn!(jobid, "Orphaned running job marked failed");
                    orphans_failed.push(jobid);
                }
                Err(e) if e.is_conflict() || e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let floor = reconciled.max_jobid.unwrap_or(0);
        let next_jobid_floor = self.ids.reconcile(floor)?;
        let running = self.admission.reconcile()?;

        let report = RecoveryReport {
            temp_files_removed: reconciled.temp_files_removed,
            duplicates_resolved: reconciled.duplicates_resolved.len(),
            records_repaired: reconciled.records_repaired.len(),
            orphans_failed,
            next_jobid_floor,
            running,
        };
        tracing::info!(
            temp_files_removed = report.temp_files_removed,
            duplicates_resolved = report.duplicates_resolved,
            records_repaired = report.records_repaired,
            orphans_failed = report.orphans_failed.len(),
            jobid_floor = report.next_jobid_floor,
            "Store recovered"
        );
        Ok(report)
    }

    /// Queue a new job and return its id.
    pub fn submit(&self, submission: Submission) -> Result<JobId> {
        if submission.user.trim().is_empty() || submission.project.trim().is_empty() {
            return Err(CaasError::InvalidArgument(
                "user and project are required".into(),
            ));
        }

        let jobid = self.ids.next_id()?;
        let record = JobRecord::new(jobid, &submission);
        self.store.put(&record)?;

        if let Some(name) = &submission.name {
            // The job is already queued; a bad alias must not lose it.
            if let Err(e) = self
                .aliases
                .register(&submission.user, &submission.project, name, jobid)
            {
                tracing::warn!(jobid, name, error = %e, "Failed to register alias");
            }
        }

        tracing::info!(jobid, user = %record.user, project = %record.project, "Job submitted");
        self.wake.notify_one();
        Ok(jobid)
    }

    pub fn status(&self, jobid: JobId) -> Result<JobRecord> {
        self.store.find(jobid)
    }

    /// Cancel a queued or running job.
    ///
    /// A running job's record moves to Canceled first and its execution is
    /// then told to stop; whatever it produces afterwards is discarded.
    pub fn cancel(&self, jobid: JobId) -> Result<JobRecord> {
        loop {
            let Some(state) = self.store.locate(jobid)? else {
                return Err(CaasError::job_not_found(jobid));
            };
            if state.is_terminal() {
                return Err(CaasError::AlreadyTerminal { jobid, state });
            }

            let outcome = JobOutcome::failure("canceled by request");
            match self
                .store
                .move_job(jobid, state, JobState::Canceled, Some(outcome))
            {
                Ok(record) => {
                    if state == JobState::Running {
                        if let Some(token) = self.execution_token(jobid) {
                            token.cancel();
                        }
                    }
                    tracing::info!(jobid, from = %state, "Job canceled");
                    self.wake.notify_one();
                    return Ok(record);
                }
                // Moved under us; look again
                Err(e) if e.is_conflict() || e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// All jobs, or those in one state, oldest first.
    pub fn list(&self, state: Option<JobState>) -> Result<Vec<JobRecord>> {
        match state {
            Some(state) => self.store.list_records(state),
            None => {
                let mut records = Vec::new();
                for state in JobState::ALL {
                    records.extend(self.store.list_records(state)?);
                }
                records.sort_by_key(JobRecord::fifo_key);
                records.dedup_by_key(|r| r.jobid);
                Ok(records)
            }
        }
    }

    /// The outcome of a finished job, with its artifact fetched from the data
    /// service.
    pub async fn fetch_result(&self, jobid: JobId) -> Result<JobResult> {
        let jobs = Arc::clone(&self.store);
        let record = store::blocking(move || jobs.find(jobid)).await?;
        if !record.state.is_terminal() {
            return Err(CaasError::NotFinished {
                jobid,
                state: record.state,
            });
        }

        let key = record.outcome.as_ref().and_then(|o| o.artifact.clone());
        let artifact = match key {
            Some(key) => Some(self.services.data().get(&key).await?),
            None => None,
        };
        Ok(JobResult { record, artifact })
    }

    pub fn register_alias(&self, user: &str, project: &str, name: &str, jobid: JobId) -> Result<()> {
        self.aliases.register(user, project, name, jobid)
    }

    pub fn resolve_alias(&self, user: &str, project: &str, name: &str) -> Result<Vec<AliasTarget>> {
        let mut targets = Vec::new();
        for jobid in self.aliases.resolve(user, project, name)? {
            let state = match self.store.find(jobid) {
                // A bare jobid only resolves to that user's own job.
                Ok(record) if record.user == user && record.project == project => Some(record.state),
                Ok(_) => None,
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };
            targets.push(AliasTarget { jobid, state });
        }
        if targets.is_empty() {
            return Err(CaasError::NotFound(format!(
                "alias {}/{}/{}",
                user, project, name
            )));
        }
        Ok(targets)
    }

    pub fn occupancy(&self) -> Result<Occupancy> {
        let mut counts = BTreeMap::new();
        for state in JobState::ALL {
            counts.insert(state, self.store.count(state)?);
        }
        Ok(Occupancy {
            counts,
            slots_in_use: self.admission.in_use(),
            njobs: self.admission.njobs(),
        })
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweeper.sweep(Utc::now()).await
    }

    /// Wake the scheduler loop.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    fn execution_token(&self, jobid: JobId) -> Option<CancellationToken> {
        self.executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&jobid)
            .cloned()
    }

    /// Promote as many queued jobs as there are free slots and start each.
    pub async fn promote(self: &Arc<Self>) -> Result<usize> {
        let mut started = 0;
        while !self.shutdown.is_cancelled() {
            let Some(admission) = self.blocking(|m| m.admission.try_admit()).await? else {
                break;
            };
            let token = self.shutdown.child_token();
            self.executions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(admission.record.jobid, token.clone());

            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.execute(admission, token).await;
            });
            started += 1;
        }
        Ok(started)
    }

    async fn execute(self: Arc<Self>, admission: Admission, token: CancellationToken) {
        let Admission { record, permit } = admission;
        let jobid = record.jobid;
        // A cancel that landed before our token was registered had nothing
        // to signal.
        let result = match self
            .blocking(move |m| m.store.contains(jobid, JobState::Running))
            .await
        {
            Ok(true) => {
                tracing::info!(jobid, "Job started");
                Some(self.services.batch().run(&record, token.clone()).await)
            }
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        };

        let Some(result) = result else {
            tracing::info!(jobid, "Job left Running before it started");
            self.release(jobid, permit);
            return;
        };

        if token.is_cancelled() {
            tracing::info!(jobid, "Execution stopped after cancellation, outcome discarded");
        } else {
            let (to, outcome) = self.settle(jobid, result).await;
            let stored = outcome.artifact.clone();
            let moved = self
                .blocking(move |m| m.store.move_job(jobid, JobState::Running, to, Some(outcome)))
                .await;
            match moved {
                Ok(_) => tracing::info!(jobid, state = %to, "Job finished"),
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    tracing::info!(jobid, error = %e, "Job left Running before finishing, outcome discarded");
                    // Canceled while settling: nothing will reference the artifact
                    if let Some(key) = stored {
                        self.discard_artifact(jobid, &key).await;
                    }
                }
                Err(e) => tracing::error!(jobid, error = %e, "Failed to record job outcome"),
            }
        }

        self.release(jobid, permit);
    }

    async fn discard_artifact(&self, jobid: JobId, key: &str) {
        match self.services.data().delete(key).await {
            Ok(()) => tracing::info!(jobid, key, "Discarded artifact of canceled job"),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(jobid, key, service = %ServiceKind::Data, error = %e, "Failed to discard artifact");
            }
        }
    }

    fn release(&self, jobid: JobId, permit: SlotPermit) {
        self.executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&jobid);
        drop(permit);
        self.wake.notify_one();
    }

    /// Turn an execution result into the terminal state and outcome to record.
    /// A successful run whose artifact cannot be stored still fails the job.
    async fn settle(
        &self,
        jobid: JobId,
        result: Result<ExecutionOutcome>,
    ) -> (JobState, JobOutcome) {
        let run = match result {
            Ok(run) => run,
            Err(e) => {
                tracing::warn!(jobid, error = %e, "Execution failed");
                return (JobState::Failed, JobOutcome::failure(e.to_string()));
            }
        };

        let mut outcome = JobOutcome {
            exit_code: run.exit_code,
            output: run.output,
            error: run.error,
            artifact: None,
            finished_at: Utc::now(),
        };
        if !run.success {
            if outcome.error.is_none() {
                outcome.error = Some(
                    CaasError::ExecutionFailure(format!("exit code {:?}", run.exit_code))
                        .to_string(),
                );
            }
            return (JobState::Failed, outcome);
        }

        if let Some(bytes) = run.artifact {
            let key = artifact_key(jobid);
            match self.services.data().put(&key, bytes).await {
                Ok(()) => outcome.artifact = Some(key),
                Err(e) => {
                    tracing::warn!(jobid, service = %ServiceKind::Data, error = %e, "Failed to store artifact");
                    outcome.error = Some(e.to_string());
                    return (JobState::Failed, outcome);
                }
            }
        }
        (JobState::Completed, outcome)
    }

    /// Drive admission and retention until `shutdown` fires. Executions still
    /// in flight are then cancelled and left Running for the next start to
    /// reconcile.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut poll = tokio::time::interval(self.poll_interval);
        let mut sweep = tokio::time::interval(self.sweep_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(njobs = self.admission.njobs(), holding_time_secs = self.sweeper.holding_time().as_secs(), "Scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = poll.tick() => {}
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "Retention sweep failed");
                    }
                }
            }

            if let Err(e) = self.promote().await {
                tracing::error!(error = %e, "Job promotion failed");
            }
        }

        self.shutdown.cancel();
        let in_flight = self
            .executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        tracing::info!(in_flight, "Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_keys_are_valid_data_keys() {
        let key = artifact_key(17);
        assert_eq!(key, "job-17-output.sqlite");
        assert!(crate::services::data::validate_key(&key).is_ok());
    }
}
