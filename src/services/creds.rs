use std::io;
use std::path::PathBuf;

use chrono::Utc;
use tokio::fs;
use uuid::Uuid;

use crate::error::{CaasError, Result};
use crate::services::{Credential, CredsService};

/// In-process credential service: one `<token>.json` per issued token under
/// `creds_dir`.
#[derive(Debug, Clone)]
pub struct LocalCreds {
    creds_dir: PathBuf,
}

impl LocalCreds {
    pub fn new(creds_dir: impl Into<PathBuf>) -> Self {
        Self {
            creds_dir: creds_dir.into(),
        }
    }

    fn token_path(&self, token: &str) -> Result<PathBuf> {
        // Issued tokens are simple-format UUIDs; refuse anything else before
        // it reaches the filesystem.
        if token.len() != 32 || !token.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CaasError::NotFound("credential".to_string()));
        }
        Ok(self.creds_dir.join(format!("{}.json", token)))
    }
}

#[tonic::async_trait]
impl CredsService for LocalCreds {
    async fn issue(&self, user: &str) -> Result<Credential> {
        let user = user.trim();
        if user.is_empty() {
            return Err(CaasError::InvalidArgument("user cannot be empty".into()));
        }

        let credential = Credential {
            token: Uuid::new_v4().simple().to_string(),
            user: user.to_string(),
            issued_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&credential)
            .map_err(|e| CaasError::Internal(format!("encode credential: {}", e)))?;
        fs::create_dir_all(&self.creds_dir).await?;
        fs::write(self.token_path(&credential.token)?, bytes).await?;

        tracing::info!(user, "Issued credential");
        Ok(credential)
    }

    async fn validate(&self, token: &str) -> Result<String> {
        let path = self.token_path(token)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CaasError::NotFound("credential".to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let credential: Credential = serde_json::from_slice(&bytes)
            .map_err(|e| CaasError::corruption(&path, e.to_string()))?;
        Ok(credential.user)
    }

    async fn revoke(&self, token: &str) -> Result<()> {
        match fs::remove_file(self.token_path(token)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CaasError::NotFound("credential".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
