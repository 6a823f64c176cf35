use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use uuid::Uuid;

use crate::config::CaasConfig;
use crate::error::{CaasError, Result};
use crate::scheduler::job::{JobId, JobOutcome, JobRecord, JobState};
use crate::store::{missing_from, ReconcileReport, StateStore};

const RECORD_EXT: &str = ".json";
const TEMP_EXT: &str = ".tmp";

/// Directory-per-state job store.
///
/// A job is the file `<state_dir>/<jobid>.json`. A move first relocates the
/// file with `rename(2)`, so the job is never visible in zero or two
/// directories, then rewrites it in place (temp file + rename) with the new
/// state and transition time. Mutations are serialized by a short-lived
/// mutex that is never held across anything but filesystem calls; readers
/// take no lock and always trust the directory over the `state` field.
#[derive(Debug)]
pub struct FsStateStore {
    dirs: HashMap<JobState, PathBuf>,
    mutation: Mutex<()>,
}

impl FsStateStore {
    /// Open the store over the configured state directories, creating them.
    pub fn open(config: &CaasConfig) -> Result<Self> {
        let dirs = JobState::ALL
            .into_iter()
            .map(|state| (state, config.state_dir(state).to_path_buf()))
            .collect();
        Self::with_dirs(dirs)
    }

    /// Open the store with `<root>/<state>` directories.
    pub fn at_root(root: &Path) -> Result<Self> {
        let dirs = JobState::ALL
            .into_iter()
            .map(|state| (state, root.join(state.as_str())))
            .collect();
        Self::with_dirs(dirs)
    }

    fn with_dirs(dirs: HashMap<JobState, PathBuf>) -> Result<Self> {
        for dir in dirs.values() {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            dirs,
            mutation: Mutex::new(()),
        })
    }

    pub fn dir(&self, state: JobState) -> &Path {
        // with_dirs is only ever handed a map covering JobState::ALL
        &self.dirs[&state]
    }

    fn entry_path(&self, jobid: JobId, state: JobState) -> PathBuf {
        self.dir(state).join(format!("{}{}", jobid, RECORD_EXT))
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded data is the directory tree itself; a panic mid-move
        // leaves nothing reconcile() cannot repair.
        self.mutation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_record(&self, record: &JobRecord) -> Result<()> {
        let dir = self.dir(record.state);
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| CaasError::Internal(format!("encode job {}: {}", record.jobid, e)))?;
        let tmp = dir.join(format!(".{}.{}{}", record.jobid, Uuid::new_v4().simple(), TEMP_EXT));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, self.entry_path(record.jobid, record.state)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

fn read_record(path: &Path, jobid: JobId, state: JobState) -> Result<JobRecord> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CaasError::job_not_found(jobid))
        }
        Err(e) => return Err(e.into()),
    };
    let mut record: JobRecord =
        serde_json::from_slice(&bytes).map_err(|e| CaasError::corruption(path, e.to_string()))?;
    if record.jobid != jobid {
        return Err(CaasError::corruption(
            path,
            format!("record holds jobid {}", record.jobid),
        ));
    }
    record.state = state;
    Ok(record)
}

/// Parse `<jobid>.json`; anything else in a state directory is ignored.
fn parse_entry_name(name: &str) -> Option<JobId> {
    if name.starts_with('.') {
        return None;
    }
    name.strip_suffix(RECORD_EXT)?.parse().ok()
}

impl StateStore for FsStateStore {
    fn put(&self, record: &JobRecord) -> Result<()> {
        let _guard = self.lock();
        self.write_record(record)?;
        tracing::debug!(jobid = record.jobid, state = %record.state, "Job record written");
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

        let _guard = self.lock();
        let src = self.entry_path(jobid, from);
        let mut record = match read_record(&src, jobid, from) {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Err(missing_from(self, jobid, from)?),
            Err(e) => return Err(e),
        };

        // Claim: after this the job is only visible under `to`
        if let Err(e) = fs::rename(&src, self.entry_path(jobid, to)) {
            if e.kind() == io::ErrorKind::NotFound {
                return Err(missing_from(self, jobid, from)?);
            }
            return Err(e.into());
        }

        record.state = to;
        record.transitioned_at = Utc::now();
        if outcome.is_some() {
            record.outcome = outcome;
        }
        self.write_record(&record)?;

        tracing::debug!(jobid, from = %from, to = %to, "Job moved");
        Ok(record)
    }

    fn list(&self, state: JobState) -> Result<Vec<JobId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.dir(state))? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(jobid) = parse_entry_name(name) {
                ids.push(jobid);
            }
        }
        Ok(ids)
    }

    fn read(&self, jobid: JobId, state: JobState) -> Result<JobRecord> {
        read_record(&self.entry_path(jobid, state), jobid, state)
    }

    fn contains(&self, jobid: JobId, state: JobState) -> Result<bool> {
        Ok(self.entry_path(jobid, state).try_exists()?)
    }

    fn remove_if(
        &self,
        jobid: JobId,
        state: JobState,
        predicate: &dyn Fn(&JobRecord) -> bool,
    ) -> Result<Option<JobRecord>> {
        let _guard = self.lock();
        let path = self.entry_path(jobid, state);
        let record = match read_record(&path, jobid, state) {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        if !predicate(&record) {
            return Ok(None);
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(Some(record)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn reconcile(&self) -> Result<ReconcileReport> {
        let _guard = self.lock();
        let mut report = ReconcileReport::default();
        // (record as found, whether its state field disagreed with its directory)
        let mut copies: HashMap<JobId, Vec<(JobRecord, bool)>> = HashMap::new();

        for state in JobState::ALL {
            for entry in fs::read_dir(self.dir(state))? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if name.starts_with('.') && name.ends_with(TEMP_EXT) {
                    fs::remove_file(entry.path())?;
                    report.temp_files_removed += 1;
                    continue;
                }
                let Some(jobid) = parse_entry_name(name) else {
                    tracing::warn!(path = %entry.path().display(), "Ignoring stray file in state directory");
                    continue;
                };
                let path = entry.path();
                let bytes = fs::read(&path)?;
                let mut record: JobRecord = serde_json::from_slice(&bytes)
                    .map_err(|e| CaasError::corruption(&path, e.to_string()))?;
                let mismatched = record.state != state;
                record.state = state;
                copies.entry(jobid).or_default().push((record, mismatched));
            }
        }

        for (jobid, mut found) in copies {
            report.max_jobid = Some(report.max_jobid.map_or(jobid, |max| max.max(jobid)));

            // Keep the latest transition; ties go to the later lifecycle state
            found.sort_by_key(|(r, _)| (r.transitioned_at, r.state));
            let Some((mut keep, mismatched)) = found.pop() else {
                continue;
            };
            if !found.is_empty() {
                for (stale, _) in &found {
                    fs::remove_file(self.entry_path(jobid, stale.state))?;
                    tracing::warn!(jobid, dropped = %stale.state, kept = %keep.state, "Resolved job present in two states");
                }
                report.duplicates_resolved.push(jobid);
            }

            if mismatched {
                keep.transitioned_at = Utc::now();
                self.write_record(&keep)?;
                report.records_repaired.push(jobid);
                tracing::warn!(jobid, state = %keep.state, "Repaired job record after interrupted move");
            }
        }

        report.duplicates_resolved.sort_unstable();
        report.records_repaired.sort_unstable();
        Ok(report)
    }
}
