pub mod config;
pub mod dashboard;
pub mod error;
pub mod grpc;
pub mod node;
pub mod scheduler;
pub mod services;
pub mod shutdown;
pub mod store;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("caas");
}
