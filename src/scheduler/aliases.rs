use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{CaasError, Result};
use crate::scheduler::job::JobId;

/// One line of the alias log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEntry {
    pub user: String,
    pub project: String,
    pub name: String,
    pub jobid: JobId,
}

/// Append-only alias log (JSON Lines), keyed by user and project.
///
/// Registration appends under an exclusive lock; resolution rereads the
/// whole file under a shared one, so its answer depends only on the file's
/// current contents.
#[derive(Debug, Clone)]
pub struct AliasBook {
    path: PathBuf,
}

impl AliasBook {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn register(&self, user: &str, project: &str, name: &str, jobid: JobId) -> Result<()> {
        validate_name(name)?;
        let entry = AliasEntry {
            user: user.to_string(),
            project: project.to_string(),
            name: name.to_string(),
            jobid,
        };
        let mut line = serde_json::to_string(&entry)
            .map_err(|e| CaasError::Internal(format!("encode alias: {}", e)))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        // Lock released when `file` drops

        tracing::debug!(user, project, name, jobid, "Alias registered");
        Ok(())
    }

    /// Every jobid ever registered under (user, project, name).
    ///
    /// A name made only of digits with no registration of its own is read as
    /// a literal jobid, so `user/project/<jobid>` addresses a job directly.
    pub fn resolve(&self, user: &str, project: &str, name: &str) -> Result<BTreeSet<JobId>> {
        let mut ids: BTreeSet<JobId> = self
            .entries()?
            .into_iter()
            .filter(|e| e.user == user && e.project == project && e.name == name)
            .map(|e| e.jobid)
            .collect();
        if ids.is_empty() {
            if let Ok(jobid) = name.parse::<JobId>() {
                ids.insert(jobid);
            }
        }
        Ok(ids)
    }

    /// All alias entries in registration order.
    ///
    /// Reads under a shared lock, so an append in progress is never seen
    /// half-written.
    pub fn entries(&self) -> Result<Vec<AliasEntry>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        file.lock_shared()?;
        let mut text = String::new();
        file.read_to_string(&mut text)
            .map_err(|e| CaasError::corruption(&self.path, e.to_string()))?;
        drop(file);
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    CaasError::corruption(&self.path, format!("line {}: {}", n + 1, e))
                })
            })
            .collect()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(CaasError::InvalidArgument("alias name cannot be empty".into()));
    }
    if name.contains('/') || name.contains('\n') {
        return Err(CaasError::InvalidArgument(format!(
            "alias name '{}' may not contain '/' or newlines",
            name
        )));
    }
    Ok(())
}
