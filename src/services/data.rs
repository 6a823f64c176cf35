use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::error::{CaasError, Result};
use crate::services::{DataService, ServiceKind};

const BLOB_DIR: &str = "blobs";

/// In-process data service.
///
/// Bytes live in `<data_dir>/blobs/<key>`. `<paths_dir>/<key>` holds the path
/// of the blob and is what lookups consult, so blobs can be relocated by
/// rewriting the index alone.
#[derive(Debug, Clone)]
pub struct LocalData {
    blob_dir: PathBuf,
    paths_dir: PathBuf,
}

impl LocalData {
    pub fn new(data_dir: impl AsRef<Path>, paths_dir: impl Into<PathBuf>) -> Self {
        Self {
            blob_dir: data_dir.as_ref().join(BLOB_DIR),
            paths_dir: paths_dir.into(),
        }
    }

    fn index_path(&self, key: &str) -> PathBuf {
        self.paths_dir.join(key)
    }

    async fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<()> {
        fs::create_dir_all(dir).await?;
        let tmp = dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));
        fs::write(&tmp, bytes).await?;
        if let Err(e) = fs::rename(&tmp, dir.join(name)).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok(())
    }

    async fn lookup(&self, key: &str) -> Result<PathBuf> {
        match fs::read_to_string(self.index_path(key)).await {
            Ok(path) => Ok(PathBuf::from(path.trim())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CaasError::NotFound(format!("data '{}'", key)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Keys become file names, so they are limited to a safe alphabet.
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(CaasError::InvalidArgument(format!(
            "invalid data key '{}'",
            key
        )))
    }
}

#[tonic::async_trait]
impl DataService for LocalData {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        let size = data.len();
        Self::write_atomic(&self.blob_dir, key, &data).await?;
        let blob_path = self.blob_dir.join(key);
        Self::write_atomic(
            &self.paths_dir,
            key,
            blob_path.to_string_lossy().as_bytes(),
        )
        .await?;
        tracing::debug!(service = %ServiceKind::Data, key, size, "Stored data");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let path = self.lookup(key).await?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CaasError::NotFound(format!(
                "data '{}' (indexed at {})",
                key,
                path.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let path = self.lookup(key).await?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match fs::remove_file(self.index_path(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(service = %ServiceKind::Data, key, "Deleted data");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(validate_key("job-12-output.sqlite").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key(".hidden").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("a/b").is_err());
    }
}
