use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::scheduler::job::{JobId, JobRecord, JobState};
use crate::services::DataService;
use crate::store::{self, StateStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<JobId>,
}

/// Deletes terminal jobs whose last transition is older than the holding
/// time. Queued and Running jobs are never looked at.
pub struct RetentionSweeper {
    store: Arc<dyn StateStore>,
    data: Arc<dyn DataService>,
    holding_time: Duration,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn StateStore>,
        data: Arc<dyn DataService>,
        holding_time: Duration,
    ) -> Self {
        Self {
            store,
            data,
            holding_time,
        }
    }

    pub fn holding_time(&self) -> Duration {
        self.holding_time
    }

    /// Whether a record last moved at `transitioned_at` has outlived the
    /// holding time at `now`. A zero holding time expires everything.
    pub fn is_expired(&self, transitioned_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        expired(self.holding_time, transitioned_at, now)
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let jobs = Arc::clone(&self.store);
        let holding_time = self.holding_time;
        let removed = store::blocking(move || remove_expired(&*jobs, holding_time, now)).await?;

        let mut report = SweepReport::default();
        for record in removed {
            let jobid = record.jobid;
            tracing::info!(jobid, state = %record.state, transitioned_at = %record.transitioned_at, "Expired job removed");
            if let Some(key) = record.outcome.as_ref().and_then(|o| o.artifact.as_deref()) {
                if let Err(e) = self.data.delete(key).await {
                    tracing::warn!(jobid, key, error = %e, "Failed to delete expired artifact");
                }
            }
            report.removed.push(jobid);
        }

        if !report.removed.is_empty() {
            tracing::debug!(removed = report.removed.len(), "Sweep finished");
        }
        Ok(report)
    }
}

fn expired(holding_time: Duration, transitioned_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    if holding_time.is_zero() {
        return true;
    }
    let age = now.signed_duration_since(transitioned_at);
    match age.to_std() {
        Ok(age) => age > holding_time,
        // Transitioned in the future relative to `now`
        Err(_) => false,
    }
}

fn remove_expired(
    store: &dyn StateStore,
    holding_time: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<JobRecord>> {
    let mut removed = Vec::new();
    for state in JobState::TERMINAL {
        for jobid in store.list(state)? {
            // Checked again under the store's exclusion, so a record that
            // moved or was rewritten since listing is judged by its current
            // timestamp.
            let predicate = |record: &JobRecord| expired(holding_time, record.transitioned_at, now);
            if let Some(record) = store.remove_if(jobid, state, &predicate)? {
                removed.push(record);
            }
        }
    }
    Ok(removed)
}
