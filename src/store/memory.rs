use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::error::{CaasError, Result};
use crate::scheduler::job::{JobId, JobOutcome, JobRecord, JobState};
use crate::store::{ReconcileReport, StateStore};

/// In-process state store: one map per state behind a single mutex.
///
/// Nothing survives a restart, so [`StateStore::reconcile`] only reports the
/// largest jobid.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    regions: Mutex<HashMap<JobState, BTreeMap<JobId, JobRecord>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn regions(&self) -> MutexGuard<'_, HashMap<JobState, BTreeMap<JobId, JobRecord>>> {
        self.regions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total number of jobs across every state.
    pub fn len(&self) -> usize {
        self.regions().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStateStore {
    fn put(&self, record: &JobRecord) -> Result<()> {
        self.regions()
            .entry(record.state)
            .or_default()
            .insert(record.jobid, record.clone());
        Ok(())
    }

    fn move_job(
        &self,
        jobid: JobId,
        from: JobState,
        to: JobState,
        outcome: Option<JobOutcome>,
    ) -> Result<JobRecord> {
        if from == to {
            return Err(CaasError::InvalidArgument(format!(
                "cannot move job {} from {} to itself",
                jobid, from
            )));
        }

        let mut regions = self.regions();
        let Some(mut record) = regions.get_mut(&from).and_then(|r| r.remove(&jobid)) else {
            let actual = JobState::ALL
                .into_iter()
                .find(|s| regions.get(s).is_some_and(|r| r.contains_key(&jobid)));
            return Err(match actual {
                Some(actual) => CaasError::Conflict {
                    jobid,
                    expected: from,
                    actual: Some(actual),
                },
                None => CaasError::job_not_found(jobid),
            });
        };

        record.state = to;
        record.transitioned_at = Utc::now();
        if outcome.is_some() {
            record.outcome = outcome;
        }
        regions.entry(to).or_default().insert(jobid, record.clone());
        Ok(record)
    }

    fn list(&self, state: JobState) -> Result<Vec<JobId>> {
        Ok(self
            .regions()
            .get(&state)
            .map(|r| r.keys().copied().collect())
            .unwrap_or_default())
    }

    fn read(&self, jobid: JobId, state: JobState) -> Result<JobRecord> {
        self.regions()
            .get(&state)
            .and_then(|r| r.get(&jobid))
            .cloned()
            .ok_or_else(|| CaasError::job_not_found(jobid))
    }

    fn contains(&self, jobid: JobId, state: JobState) -> Result<bool> {
        Ok(self
            .regions()
            .get(&state)
            .is_some_and(|r| r.contains_key(&jobid)))
    }

    fn remove_if(
        &self,
        jobid: JobId,
        state: JobState,
        predicate: &dyn Fn(&JobRecord) -> bool,
    ) -> Result<Option<JobRecord>> {
        let mut regions = self.regions();
        let Some(region) = regions.get_mut(&state) else {
            return Ok(None);
        };
        match region.get(&jobid) {
            Some(record) if predicate(record) => Ok(region.remove(&jobid)),
            _ => Ok(None),
        }
    }

    fn reconcile(&self) -> Result<ReconcileReport> {
        let max_jobid = self
            .regions()
            .values()
            .filter_map(|r| r.keys().next_back().copied())
            .max();
        Ok(ReconcileReport {
            max_jobid,
            ..ReconcileReport::default()
        })
    }
}
