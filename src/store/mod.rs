//! Job state storage.
//!
//! A job's lifecycle state is *where* its record lives: each [`JobState`] maps
//! to a region of the store and a record occupies exactly one region at a
//! time. Moving between regions is the only way state changes.
//!
//! - [`FsStateStore`]: one directory per state, one `<jobid>.json` per job
//! - [`MemoryStateStore`]: in-process maps, used where persistence is not wanted
//!
//! Both implementations detect lost races with [`CaasError::Conflict`] instead
//! of holding locks across a job's execution.
//!
//! Store calls are synchronous and may block on file I/O or `flock`; async
//! callers go through [`blocking`].

pub mod fs;
pub mod memory;

use std::fmt::Debug;

use crate::error::{CaasError, Result};
use crate::scheduler::job::{JobId, JobOutcome, JobRecord, JobState};

pub use fs::FsStateStore;
pub use memory::MemoryStateStore;

/// What startup reconciliation found and repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Leftover temp files from interrupted writes.
    pub temp_files_removed: usize,
    /// Jobs found in more than one state; the older copies were dropped.
    pub duplicates_resolved: Vec<JobId>,
    /// Records whose `state` field disagreed with their location.
    pub records_repaired: Vec<JobId>,
    /// Largest jobid present in any state.
    pub max_jobid: Option<JobId>,
}

/// Run a synchronous store operation on the blocking thread pool.
pub async fn blocking<T, F>(op: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| CaasError::Internal(format!("blocking store task failed: {}", e)))?
}

pub trait StateStore: Send + Sync + Debug {
    /// Persist a new record under `record.state`.
    fn put(&self, record: &JobRecord) -> Result<()>;

    /// Move a job from `from` to `to`, stamping the transition time and
    /// attaching `outcome` when given.
    ///
    /// Returns [`CaasError::Conflict`] when the job exists but not in `from`,
    /// and [`CaasError::NotFound`] when it exists nowhere.
    fn move_job(
        &self,
        jobid: JobId,
        from: JobState,
        to: JobState,
        outcome: Option<JobOutcome>,
    ) -> Result<JobRecord>;

    /// Jobids currently in `state`, in no particular order.
    fn list(&self, state: JobState) -> Result<Vec<JobId>>;

    fn read(&self, jobid: JobId, state: JobState) -> Result<JobRecord>;

    fn contains(&self, jobid: JobId, state: JobState) -> Result<bool>;

    /// Delete the record in `state` if `predicate` holds for it, atomically
    /// with respect to moves. Returns the removed record.
    fn remove_if(
        &self,
        jobid: JobId,
        state: JobState,
        predicate: &dyn Fn(&JobRecord) -> bool,
    ) -> Result<Option<JobRecord>>;

    /// Repair what an interrupted process may have left behind.
    fn reconcile(&self) -> Result<ReconcileReport>;

    /// Current state of a job, if it exists.
    ///
    /// Moves only go forward through [`JobState::ALL`], so probing in that
    /// order cannot miss a job that moves while we look.
    fn locate(&self, jobid: JobId) -> Result<Option<JobState>> {
        for state in JobState::ALL {
            if self.contains(jobid, state)? {
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    /// Read a job wherever it currently is.
    fn find(&self, jobid: JobId) -> Result<JobRecord> {
        // A job can move between locate() and read(); a few retries cover it.
        for _ in 0..4 {
            let Some(state) = self.locate(jobid)? else {
                return Err(CaasError::job_not_found(jobid));
            };
            match self.read(jobid, state) {
                Err(e) if e.is_not_found() => continue,
                other => return other,
            }
        }
        Err(CaasError::job_not_found(jobid))
    }

    /// Records in `state`, oldest first by (creation time, jobid).
    fn list_records(&self, state: JobState) -> Result<Vec<JobRecord>> {
        let mut records = Vec::new();
        for jobid in self.list(state)? {
            match self.read(jobid, state) {
                Ok(record) => records.push(record),
                // Moved away since listing
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        records.sort_by_key(JobRecord::fifo_key);
        Ok(records)
    }

    fn count(&self, state: JobState) -> Result<usize> {
        Ok(self.list(state)?.len())
    }
}

/// Conflict or not-found, depending on whether the job exists elsewhere.
pub(crate) fn missing_from(
    store: &dyn StateStore,
    jobid: JobId,
    expected: JobState,
) -> Result<CaasError> {
    Ok(match store.locate(jobid)? {
        Some(actual) => CaasError::Conflict {
            jobid,
            expected,
            actual: Some(actual),
        },
        None => CaasError::job_not_found(jobid),
    })
}
