//! Delegated services: data storage, credential issuance and batch execution.
//!
//! Each concern is a capability trait with two providers:
//!
//! - **Local**: in-process, backed by this node's directories
//! - **Remote**: a gRPC client forwarding to a peer `caas` process that
//!   exports the matching peer service
//!
//! [`ServiceLocator`] picks one provider per kind at startup from the
//! configured URLs and never changes it afterwards. Callers only ever see the
//! trait objects, so a local and a remote provider are interchangeable.

pub mod batch;
pub mod creds;
pub mod data;
pub mod remote;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::CaasConfig;
use crate::error::{CaasError, Result};
use crate::scheduler::job::JobRecord;

pub use batch::LocalBatch;
pub use creds::LocalCreds;
pub use data::LocalData;
pub use remote::{RemoteBatch, RemoteCreds, RemoteData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Data,
    Creds,
    Batch,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [ServiceKind::Data, ServiceKind::Creds, ServiceKind::Batch];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Data => "data",
            ServiceKind::Creds => "creds",
            ServiceKind::Batch => "batch",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = CaasError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "data" => Ok(ServiceKind::Data),
            "creds" => Ok(ServiceKind::Creds),
            "batch" => Ok(ServiceKind::Batch),
            other => Err(CaasError::InvalidConfig(format!(
                "unknown service '{}', expected data, creds, batch or all",
                other
            ))),
        }
    }
}

/// The set of peer services this process exports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Services(BTreeSet<ServiceKind>);

impl Services {
    pub fn all() -> Self {
        Self(ServiceKind::ALL.into_iter().collect())
    }

    pub fn none() -> Self {
        Self(BTreeSet::new())
    }

    pub fn contains(&self, kind: ServiceKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = ServiceKind> + '_ {
        self.0.iter().copied()
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<ServiceKind> for Services {
    fn from_iter<I: IntoIterator<Item = ServiceKind>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromStr for Services {
    type Err = CaasError;

    /// Parse `all` or a comma-separated subset such as `data,batch`.
    fn from_str(s: &str) -> Result<Self> {
        let mut kinds = BTreeSet::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if part.eq_ignore_ascii_case("all") {
                return Ok(Self::all());
            }
            kinds.insert(part.parse()?);
        }
        Ok(Self(kinds))
    }
}

impl fmt::Display for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(ServiceKind::as_str).collect();
        f.write_str(&names.join(","))
    }
}

/// Where a service kind is provided from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceBinding {
    Local,
    Remote(String),
}

impl ServiceBinding {
    /// An empty URL means the in-process provider.
    pub fn from_url(url: &str) -> Self {
        let url = url.trim();
        if url.is_empty() {
            ServiceBinding::Local
        } else {
            ServiceBinding::Remote(url.to_string())
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ServiceBinding::Local)
    }
}

impl fmt::Display for ServiceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceBinding::Local => f.write_str("local"),
            ServiceBinding::Remote(url) => write!(f, "remote({})", url),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub user: String,
    pub issued_at: DateTime<Utc>,
}

/// What the batch service reports for one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
    /// Simulation output database, if the run produced one.
    pub artifact: Option<Vec<u8>>,
}

impl ExecutionOutcome {
    pub fn canceled() -> Self {
        Self {
            error: Some("canceled".to_string()),
            ..Self::default()
        }
    }
}

/// Stores and retrieves simulation artifacts by key.
#[tonic::async_trait]
pub trait DataService: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Issues and validates access tokens.
#[tonic::async_trait]
pub trait CredsService: Send + Sync {
    async fn issue(&self, user: &str) -> Result<Credential>;
    /// The user a token was issued to.
    async fn validate(&self, token: &str) -> Result<String>;
    async fn revoke(&self, token: &str) -> Result<()>;
}

/// Runs a job's simulation payload.
///
/// Implementations should return promptly once `cancel` fires; the outcome of
/// a cancelled run is discarded by the caller.
#[tonic::async_trait]
pub trait BatchService: Send + Sync {
    async fn run(&self, job: &JobRecord, cancel: CancellationToken) -> Result<ExecutionOutcome>;
}

/// A resolved provider for one service kind.
#[derive(Clone)]
pub enum ServiceHandle {
    Data(Arc<dyn DataService>),
    Creds(Arc<dyn CredsService>),
    Batch(Arc<dyn BatchService>),
}

impl ServiceHandle {
    pub fn kind(&self) -> ServiceKind {
        match self {
            ServiceHandle::Data(_) => ServiceKind::Data,
            ServiceHandle::Creds(_) => ServiceKind::Creds,
            ServiceHandle::Batch(_) => ServiceKind::Batch,
        }
    }
}

/// The per-kind provider choice, fixed for the life of the process.
#[derive(Clone)]
pub struct ServiceLocator {
    data: Arc<dyn DataService>,
    creds: Arc<dyn CredsService>,
    batch: Arc<dyn BatchService>,
    bindings: HashMap<ServiceKind, ServiceBinding>,
}

impl ServiceLocator {
    /// Bind each kind to its local provider, or to a remote client when its
    /// URL is set. Remote clients connect lazily, so an unreachable peer only
    /// shows up as [`CaasError::ServiceUnavailable`] on use.
    pub fn from_config(config: &CaasConfig) -> Result<Self> {
        let mut bindings = HashMap::new();
        for kind in ServiceKind::ALL {
            bindings.insert(kind, ServiceBinding::from_url(config.service_url(kind)));
        }

        let data: Arc<dyn DataService> = match &bindings[&ServiceKind::Data] {
            ServiceBinding::Local => Arc::new(LocalData::new(&config.data_dir, &config.paths_dir)),
            ServiceBinding::Remote(url) => Arc::new(RemoteData::connect(url, config.remote_timeout)?),
        };
        let creds: Arc<dyn CredsService> = match &bindings[&ServiceKind::Creds] {
            ServiceBinding::Local => Arc::new(LocalCreds::new(&config.creds_dir)),
            ServiceBinding::Remote(url) => {
                Arc::new(RemoteCreds::connect(url, config.remote_timeout)?)
            }
        };
        let batch: Arc<dyn BatchService> = match &bindings[&ServiceKind::Batch] {
            ServiceBinding::Local => {
                Arc::new(LocalBatch::new(&config.sims_dir, config.runner.clone()))
            }
            ServiceBinding::Remote(url) => Arc::new(RemoteBatch::connect(url)?),
        };

        for kind in ServiceKind::ALL {
            tracing::info!(service = %kind, binding = %bindings[&kind], "Service bound");
        }

        Ok(Self {
            data,
            creds,
            batch,
            bindings,
        })
    }

    /// Assemble a locator from explicit providers, all reported as local.
    pub fn new(
        data: Arc<dyn DataService>,
        creds: Arc<dyn CredsService>,
        batch: Arc<dyn BatchService>,
    ) -> Self {
        let bindings = ServiceKind::ALL
            .into_iter()
            .map(|kind| (kind, ServiceBinding::Local))
            .collect();
        Self {
            data,
            creds,
            batch,
            bindings,
        }
    }

    pub fn resolve(&self, kind: ServiceKind) -> ServiceHandle {
        match kind {
            ServiceKind::Data => ServiceHandle::Data(Arc::clone(&self.data)),
            ServiceKind::Creds => ServiceHandle::Creds(Arc::clone(&self.creds)),
            ServiceKind::Batch => ServiceHandle::Batch(Arc::clone(&self.batch)),
        }
    }

    pub fn binding(&self, kind: ServiceKind) -> &ServiceBinding {
        &self.bindings[&kind]
    }

    pub fn data(&self) -> Arc<dyn DataService> {
        Arc::clone(&self.data)
    }

    pub fn creds(&self) -> Arc<dyn CredsService> {
        Arc::clone(&self.creds)
    }

    pub fn batch(&self) -> Arc<dyn BatchService> {
        Arc::clone(&self.batch)
    }
}
