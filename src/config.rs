use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CaasError, Result};
use crate::scheduler::job::JobState;
use crate::services::batch::default_runner;
use crate::services::{ServiceKind, Services};

pub const DEFAULT_PORT: u16 = 4242;
pub const DEFAULT_HOLDING_TIME: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Resolved service configuration.
///
/// Every path is explicit; [`CaasConfig::with_roots`] derives the usual
/// layout from a config directory and a data directory.
#[derive(Debug, Clone)]
pub struct CaasConfig {
    pub port: u16,
    /// HTTP status API port. Disabled when `None`.
    pub dashboard_port: Option<u16>,

    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub jobs_dir: PathBuf,
    pub queued_jobs_dir: PathBuf,
    pub running_jobs_dir: PathBuf,
    pub completed_jobs_dir: PathBuf,
    pub failed_jobs_dir: PathBuf,
    pub canceled_jobs_dir: PathBuf,
    pub jobid_file: PathBuf,
    pub job_aliases_file: PathBuf,
    pub creds_dir: PathBuf,
    pub sims_dir: PathBuf,
    pub paths_dir: PathBuf,
    pub logfile: Option<PathBuf>,

    /// How long terminal jobs are kept.
    pub holding_time: Duration,
    /// Maximum concurrently running jobs.
    pub njobs: usize,

    /// Empty means the in-process provider.
    pub data_url: String,
    pub creds_url: String,
    pub batch_url: String,
    /// Peer services exported by this process.
    pub services: Services,

    /// Simulation command; `{input}`, `{output}` and `{jobid}` are expanded.
    pub runner: Vec<String>,
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    pub remote_timeout: Duration,
}

fn default_njobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl CaasConfig {
    pub fn with_roots(config_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        let config_dir = config_dir.into();
        let data_dir = data_dir.into();
        let jobs_dir = data_dir.join("jobs");
        Self {
            port: DEFAULT_PORT,
            dashboard_port: None,
            queued_jobs_dir: jobs_dir.join(JobState::Queued.as_str()),
            running_jobs_dir: jobs_dir.join(JobState::Running.as_str()),
            completed_jobs_dir: jobs_dir.join(JobState::Completed.as_str()),
            failed_jobs_dir: jobs_dir.join(JobState::Failed.as_str()),
            canceled_jobs_dir: jobs_dir.join(JobState::Canceled.as_str()),
            jobs_dir,
            jobid_file: config_dir.join("jobid"),
            job_aliases_file: config_dir.join("job-aliases.jsonl"),
            creds_dir: config_dir.join("creds"),
            sims_dir: data_dir.join("sims"),
            paths_dir: data_dir.join("paths"),
            logfile: None,
            holding_time: DEFAULT_HOLDING_TIME,
            njobs: default_njobs(),
            data_url: String::new(),
            creds_url: String::new(),
            batch_url: String::new(),
            services: Services::all(),
            runner: default_runner(),
            poll_interval: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(60),
            remote_timeout: Duration::from_secs(10),
            config_dir,
            data_dir,
        }
    }

    /// Point every per-state directory at `jobs_dir/<state>`.
    pub fn with_jobs_dir(mut self, jobs_dir: impl Into<PathBuf>) -> Self {
        self.jobs_dir = jobs_dir.into();
        for state in JobState::ALL {
            *self.state_dir_mut(state) = self.jobs_dir.join(state.as_str());
        }
        self
    }

    pub fn state_dir(&self, state: JobState) -> &Path {
        match state {
            JobState::Queued => &self.queued_jobs_dir,
            JobState::Running => &self.running_jobs_dir,
            JobState::Completed => &self.completed_jobs_dir,
            JobState::Failed => &self.failed_jobs_dir,
            JobState::Canceled => &self.canceled_jobs_dir,
        }
    }

    fn state_dir_mut(&mut self, state: JobState) -> &mut PathBuf {
        match state {
            JobState::Queued => &mut self.queued_jobs_dir,
            JobState::Running => &mut self.running_jobs_dir,
            JobState::Completed => &mut self.completed_jobs_dir,
            JobState::Failed => &mut self.failed_jobs_dir,
            JobState::Canceled => &mut self.canceled_jobs_dir,
        }
    }

    pub fn service_url(&self, kind: ServiceKind) -> &str {
        match kind {
            ServiceKind::Data => &self.data_url,
            ServiceKind::Creds => &self.creds_url,
            ServiceKind::Batch => &self.batch_url,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for state in JobState::ALL {
            if !seen.insert(self.state_dir(state)) {
                return Err(CaasError::InvalidConfig(format!(
                    "{} jobs directory {} is shared with another state",
                    state,
                    self.state_dir(state).display()
                )));
            }
        }

        if self.njobs == 0 {
            return Err(CaasError::InvalidConfig("njobs must be at least 1".into()));
        }
        if self.runner.is_empty() || self.runner[0].trim().is_empty() {
            return Err(CaasError::InvalidConfig("runner command is empty".into()));
        }

        for kind in ServiceKind::ALL {
            let url = self.service_url(kind).trim();
            if url.is_empty() {
                continue;
            }
            let valid = (url.starts_with("http://") || url.starts_with("https://"))
                && url.parse::<tonic::transport::Uri>().is_ok();
            if !valid {
                return Err(CaasError::InvalidConfig(format!(
                    "{}_url '{}' is not an http(s) URL",
                    kind, url
                )));
            }
        }
        Ok(())
    }

    /// Create every directory the service writes to.
    pub fn ensure_dirs(&self) -> Result<()> {
        let mut dirs: Vec<&Path> = JobState::ALL.iter().map(|s| self.state_dir(*s)).collect();
        dirs.extend([
            self.sims_dir.as_path(),
            self.paths_dir.as_path(),
            self.creds_dir.as_path(),
        ]);
        for file in [&self.jobid_file, &self.job_aliases_file] {
            if let Some(parent) = file.parent() {
                dirs.push(parent);
            }
        }
        if let Some(parent) = self.logfile.as_deref().and_then(Path::parent) {
            dirs.push(parent);
        }
        for dir in dirs {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
