use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::scheduler::job::{JobRecord, JobState};
use crate::store::StateStore;

/// One of the `njobs` execution slots. Returned to the budget on drop.
#[derive(Debug)]
pub struct SlotPermit {
    in_use: Arc<AtomicUsize>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A job promoted to Running together with the slot it occupies.
#[derive(Debug)]
pub struct Admission {
    pub record: JobRecord,
    pub permit: SlotPermit,
}

/// Bounds concurrently running jobs to `njobs` and promotes Queued jobs in
/// FIFO order by (creation time, jobid).
///
/// The slot count is a cache of the Running population: [`reconcile`]
/// re-derives it from the store, and a slot is held from promotion until the
/// job's execution returns, so `count(Running) <= in_use <= njobs`.
///
/// [`reconcile`]: AdmissionController::reconcile
#[derive(Debug)]
pub struct AdmissionController {
    store: Arc<dyn StateStore>,
    njobs: usize,
    in_use: Arc<AtomicUsize>,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn StateStore>, njobs: usize) -> Self {
        Self {
            store,
            njobs,
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn njobs(&self) -> usize {
        self.njobs
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn has_capacity(&self) -> bool {
        self.in_use() < self.njobs
    }

    /// Reset the slot count to the Running directory's occupancy.
    pub fn reconcile(&self) -> Result<usize> {
        let running = self.store.count(JobState::Running)?;
        self.in_use.store(running, Ordering::Release);
        if running > self.njobs {
            tracing::warn!(running, njobs = self.njobs, "More jobs running than slots");
        }
        Ok(running)
    }

    fn reserve(&self) -> Option<SlotPermit> {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.njobs).then_some(n + 1)
            })
            .ok()
            .map(|_| SlotPermit {
                in_use: Arc::clone(&self.in_use),
            })
    }

    /// Promote the oldest Queued job if a slot is free.
    ///
    /// A candidate claimed by someone else (cancelled, or promoted by a
    /// concurrent caller) releases the reserved slot and the next candidate
    /// is tried.
    pub fn try_admit(&self) -> Result<Option<Admission>> {
        if !self.has_capacity() {
            return Ok(None);
        }

        for candidate in self.store.list_records(JobState::Queued)? {
            let Some(permit) = self.reserve() else {
                return Ok(None);
            };
            match self
                .store
                .move_job(candidate.jobid, JobState::Queued, JobState::Running, None)
            {
                Ok(record) => {
                    tracing::info!(jobid = record.jobid, in_use = self.in_use(), njobs = self.njobs, "Job admitted");
                    return Ok(Some(Admission { record, permit }));
                }
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    tracing::debug!(jobid = candidate.jobid, error = %e, "Lost promotion race, trying next job");
                    drop(permit);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}
