use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::CaasConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::{CaasError, Result};
use crate::grpc::GrpcServer;
use crate::scheduler::{JobManager, RecoveryReport};
use crate::services::ServiceLocator;

/// A running caas process: the scheduler plus its gRPC and HTTP fronts.
pub struct Node {
    pub config: CaasConfig,
    pub manager: Arc<JobManager>,
    pub recovery: RecoveryReport,
}

impl Node {
    /// Validate the configuration, create the directory layout, bind services
    /// and repair whatever a previous run left behind.
    pub fn new(config: CaasConfig) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;

        let services = ServiceLocator::from_config(&config)?;
        let manager = JobManager::from_config(&config, services)?;
        let recovery = manager.recover()?;

        Ok(Self {
            config,
            manager: Arc::new(manager),
            recovery,
        })
    }

    /// Run the node until `shutdown` fires.
    ///
    /// 1. Spawns the scheduler loop (admission, execution, retention)
    /// 2. Optionally spawns the HTTP status API
    /// 3. Runs the gRPC server (blocking)
    ///
    /// The scheduler is joined before returning so in-flight executions have
    /// been told to stop.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let manager = Arc::clone(&self.manager);
        let scheduler_shutdown = shutdown.clone();
        let scheduler = tokio::spawn(async move {
            manager.run(scheduler_shutdown).await;
        });

        if let Some(port) = self.config.dashboard_port {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let state = DashboardState {
                manager: Arc::clone(&self.manager),
            };
            tokio::spawn(run_dashboard(addr, state, shutdown.clone()));
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let server = GrpcServer::new(addr, Arc::clone(&self.manager), self.config.services.clone());
        let served = server.run(shutdown.clone()).await;

        // The server may also stop on its own error
        shutdown.cancel();
        if let Err(e) = scheduler.await {
            tracing::error!(error = %e, "Scheduler task panicked");
        }

        served.map_err(|e| CaasError::Internal(format!("gRPC server failed: {}", e)))
    }
}
