use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Router;
use tonic::transport::Server;

use crate::grpc::peer_service::{BatchPeerService, CredsPeerService, DataPeerService};
use crate::grpc::scheduler_service::SchedulerServiceImpl;
use crate::proto::batch_peer_server::BatchPeerServer;
use crate::proto::creds_peer_server::CredsPeerServer;
use crate::proto::data_peer_server::DataPeerServer;
use crate::proto::scheduler_service_server::SchedulerServiceServer;
use crate::scheduler::JobManager;
use crate::services::remote::MAX_MESSAGE_BYTES;
use crate::services::{ServiceHandle, ServiceLocator, Services};

/// Serves the scheduler API plus whichever peer services are exported.
pub struct GrpcServer {
    addr: SocketAddr,
    manager: Arc<JobManager>,
    exported: Services,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, manager: Arc<JobManager>, exported: Services) -> Self {
        Self {
            addr,
            manager,
            exported,
        }
    }

    fn router(&self) -> Router {
        let locator: &ServiceLocator = self.manager.services();
        let mut router = Server::builder().add_service(
            SchedulerServiceServer::new(SchedulerServiceImpl::new(Arc::clone(&self.manager)))
                .max_encoding_message_size(MAX_MESSAGE_BYTES),
        );

        // Each exported kind wraps whichever provider this process resolved
        // for it, local or itself delegated.
        for kind in self.exported.iter() {
            router = match locator.resolve(kind) {
                ServiceHandle::Data(data) => router.add_service(
                    DataPeerServer::new(DataPeerService::new(data))
                        .max_decoding_message_size(MAX_MESSAGE_BYTES)
                        .max_encoding_message_size(MAX_MESSAGE_BYTES),
                ),
                ServiceHandle::Creds(creds) => {
                    router.add_service(CredsPeerServer::new(CredsPeerService::new(creds)))
                }
                ServiceHandle::Batch(batch) => router.add_service(
                    BatchPeerServer::new(BatchPeerService::new(batch))
                        .max_decoding_message_size(MAX_MESSAGE_BYTES)
                        .max_encoding_message_size(MAX_MESSAGE_BYTES),
                ),
            };
        }
        router
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        tracing::info!(addr = %self.addr, services = %self.exported, "Starting gRPC server");
        self.router()
            .serve_with_shutdown(self.addr, shutdown.cancelled_owned())
            .await
    }

    /// Serve on an already bound listener.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        tracing::info!(addr = ?listener.local_addr().ok(), services = %self.exported, "Starting gRPC server");
        self.router()
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown.cancelled_owned(),
            )
            .await
    }
}
