use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CaasError;

/// Monotonically increasing job identifier issued by the [`IdAllocator`](super::ids::IdAllocator).
pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    /// Every state, in lifecycle order.
    pub const ALL: [JobState; 5] = [
        JobState::Queued,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
        JobState::Canceled,
    ];

    pub const TERMINAL: [JobState; 3] = [JobState::Completed, JobState::Failed, JobState::Canceled];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = CaasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "canceled" | "cancelled" => Ok(JobState::Canceled),
            other => Err(CaasError::InvalidArgument(format!(
                "unknown job state '{}'",
                other
            ))),
        }
    }
}

/// What an execution left behind. Recorded once, on the Running -> terminal move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
    /// Data service key of the stored simulation artifact.
    pub artifact: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            output: None,
            error: Some(error.into()),
            artifact: None,
            finished_at: Utc::now(),
        }
    }
}

/// The persisted form of a job. Its state directory is authoritative; the
/// `state` field is a copy kept for readers of the raw file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub jobid: JobId,
    pub user: String,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub payload: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub transitioned_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<JobOutcome>,
}

impl JobRecord {
    pub fn new(jobid: JobId, submission: &Submission) -> Self {
        let now = Utc::now();
        Self {
            jobid,
            user: submission.user.clone(),
            project: submission.project.clone(),
            name: submission.name.clone(),
            payload: submission.payload.clone(),
            state: JobState::Queued,
            created_at: now,
            transitioned_at: now,
            outcome: None,
        }
    }

    /// Promotion order: creation time, then jobid.
    pub fn fifo_key(&self) -> (DateTime<Utc>, JobId) {
        (self.created_at, self.jobid)
    }
}

/// A request to schedule a simulation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub user: String,
    pub project: String,
    #[serde(default)]
    pub name: Option<String>,
    pub payload: String,
}

impl Submission {
    pub fn new(user: impl Into<String>, project: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            project: project.into(),
            name: None,
            payload: payload.into(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_str() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert_eq!("Cancelled".parse::<JobState>().unwrap(), JobState::Canceled);
        assert!("pending".parse::<JobState>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        for state in JobState::TERMINAL {
            assert!(state.is_terminal());
        }
    }

    #[test]
    fn new_record_starts_queued() {
        let sub = Submission::new("alice", "fuel", "<simulation/>").with_name("baseline");
        let record = JobRecord::new(7, &sub);
        assert_eq!(record.state, JobState::Queued);
        assert_eq!(record.name.as_deref(), Some("baseline"));
        assert_eq!(record.created_at, record.transitioned_at);
        assert!(record.outcome.is_none());
    }

    #[test]
    fn record_json_omits_empty_optionals() {
        let record = JobRecord::new(1, &Submission::new("bob", "p", "x"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["state"], "queued");
        assert!(json.get("outcome").is_none());
        assert!(json.get("name").is_none());
    }
}
