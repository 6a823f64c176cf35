use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::fs;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CaasError, Result};
use crate::scheduler::job::{JobId, JobRecord};
use crate::services::{BatchService, ExecutionOutcome};

pub const INPUT_FILE: &str = "input.xml";
pub const OUTPUT_FILE: &str = "output.sqlite";

/// Default simulation command; `{input}`, `{output}` and `{jobid}` are
/// substituted per job.
pub fn default_runner() -> Vec<String> {
    vec![
        "cyclus".to_string(),
        "-o".to_string(),
        "{output}".to_string(),
        "{input}".to_string(),
    ]
}

/// Runs simulations as child processes of this node.
///
/// Each run gets `<sims_dir>/<jobid>-<run>/` as its working directory, so
/// two runs of the same jobid (from different schedulers sharing a batch
/// peer) never touch each other's files. The payload is written to
/// `input.xml`, the runner is expected to leave its database
/// at `output.sqlite`, and the directory is removed once the outcome has been
/// collected. Cancellation kills the child.
#[derive(Debug, Clone)]
pub struct LocalBatch {
    sims_dir: PathBuf,
    runner: Vec<String>,
}

impl LocalBatch {
    pub fn new(sims_dir: impl Into<PathBuf>, runner: Vec<String>) -> Self {
        Self {
            sims_dir: sims_dir.into(),
            runner,
        }
    }

    /// A fresh working directory for one run of `jobid`.
    pub fn run_dir(&self, jobid: JobId) -> PathBuf {
        self.sims_dir.join(format!("{}-{}", jobid, Uuid::new_v4().simple()))
    }

    /// The runner with placeholders filled in for one job.
    pub fn command_line(&self, jobid: JobId, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        let jobid = jobid.to_string();
        self.runner
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{output}", &output)
                    .replace("{jobid}", &jobid)
            })
            .collect()
    }

    /// Everything between creating `workdir` and removing it.
    async fn run_in(
        job: &JobRecord,
        workdir: &Path,
        program: &str,
        args: &[String],
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        fs::write(workdir.join(INPUT_FILE), job.payload.as_bytes()).await?;

        tracing::info!(jobid = job.jobid, program = %program, workdir = %workdir.display(), "Starting simulation");

        let child = Command::new(program)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CaasError::ExecutionFailure(format!("failed to start '{}': {}", program, e))
            })?;

        tokio::select! {
            result = child.wait_with_output() => {
                Self::collect(job.jobid, result, &workdir.join(OUTPUT_FILE)).await
            }
            // Dropping the wait future drops the child, which kills it
            _ = cancel.cancelled() => {
                tracing::info!(jobid = job.jobid, "Simulation cancelled");
                Ok(ExecutionOutcome::canceled())
            }
        }
    }

    async fn collect(
        jobid: JobId,
        result: io::Result<std::process::Output>,
        output_path: &Path,
    ) -> Result<ExecutionOutcome> {
        let output = result.map_err(|e| {
            tracing::error!(jobid, error = %e, "Simulation process failed");
            CaasError::ExecutionFailure(e.to_string())
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();
        let success = output.status.success();

        let error = if success {
            None
        } else if stderr.is_empty() {
            Some(format!("Exit code: {:?}", exit_code))
        } else {
            Some(stderr)
        };

        let artifact = if success {
            match fs::read(output_path).await {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };

        tracing::info!(jobid, success, exit_code = ?exit_code, "Simulation finished");

        Ok(ExecutionOutcome {
            success,
            exit_code,
            output: if stdout.is_empty() { None } else { Some(stdout) },
            error,
            artifact,
        })
    }
}

#[tonic::async_trait]
impl BatchService for LocalBatch {
    async fn run(&self, job: &JobRecord, cancel: CancellationToken) -> Result<ExecutionOutcome> {
        let workdir = self.run_dir(job.jobid);
        let input = workdir.join(INPUT_FILE);
        let output = workdir.join(OUTPUT_FILE);
        let argv = self.command_line(job.jobid, &input, &output);
        let Some((program, args)) = argv.split_first() else {
            return Err(CaasError::InvalidConfig("runner command is empty".into()));
        };

        fs::create_dir_all(&workdir).await?;
        let outcome = Self::run_in(job, &workdir, program, args, cancel).await;

        if let Err(e) = fs::remove_dir_all(&workdir).await {
            tracing::warn!(jobid = job.jobid, error = %e, "Failed to clean simulation directory");
        }
        outcome
    }
}
