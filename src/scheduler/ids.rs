use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use fs2::FileExt;

use crate::error::{CaasError, Result};
use crate::scheduler::job::JobId;

/// Issues jobids from a single persisted counter.
///
/// The counter file holds the last issued id as decimal text. Every
/// allocation takes an exclusive `flock` on a sibling `.lock` file, so
/// allocators in other processes sharing the file serialize too, and
/// replaces the counter by temp file + rename so it is never observed
/// half-written.
#[derive(Debug)]
pub struct IdAllocator {
    path: PathBuf,
    lock_path: PathBuf,
    local: Mutex<()>,
}

impl IdAllocator {
    /// Open (creating if absent) the counter at `path`.
    ///
    /// A missing counter starts at zero; an existing unreadable one is an
    /// error on every call rather than being reset.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);

        let allocator = Self {
            path,
            lock_path,
            local: Mutex::new(()),
        };
        {
            let _guard = allocator.exclusive()?;
            if !allocator.path.try_exists()? {
                allocator.store(0)?;
            }
        }
        Ok(allocator)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocate the next jobid.
    pub fn next_id(&self) -> Result<JobId> {
        let _local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = self.exclusive()?;
        let last = self.load()?;
        let next = last
            .checked_add(1)
            .ok_or_else(|| CaasError::corruption(&self.path, "jobid counter exhausted"))?;
        self.store(next)?;
        Ok(next)
    }

    /// Last issued jobid.
    pub fn current(&self) -> Result<JobId> {
        let _local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = self.exclusive()?;
        self.load()
    }

    /// Raise the counter to at least `floor`, e.g. the largest jobid found on
    /// disk. Never lowers it.
    pub fn reconcile(&self, floor: JobId) -> Result<JobId> {
        let _local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = self.exclusive()?;
        let last = self.load()?;
        if floor > last {
            tracing::warn!(
                counter = last,
                floor,
                "Job counter behind stored jobs, advancing"
            );
            self.store(floor)?;
            return Ok(floor);
        }
        Ok(last)
    }

    /// Exclusive lock held until the returned file is dropped.
    fn exclusive(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn load(&self) -> Result<JobId> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(CaasError::corruption(&self.path, "counter is not UTF-8"))
            }
            Err(e) => {
                return Err(CaasError::corruption(
                    &self.path,
                    format!("counter unreadable: {}", e),
                ))
            }
        };
        text.trim()
            .parse::<JobId>()
            .map_err(|e| CaasError::corruption(&self.path, format!("counter '{}': {}", text.trim(), e)))
    }

    fn store(&self, value: JobId) -> Result<()> {
        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = self.path.with_file_name(tmp_name);
        {
            let mut file = File::create(&tmp)?;
            writeln!(file, "{}", value)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_file_sits_next_to_counter() {
        let dir = tempfile::tempdir().unwrap();
        let ids = IdAllocator::open(dir.path().join("jobid")).unwrap();
        assert_eq!(ids.lock_path, dir.path().join("jobid.lock"));
        assert_eq!(ids.current().unwrap(), 0);
    }
}
