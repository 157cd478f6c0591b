//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::tollgate::v1::admission_server::AdmissionServer;
use super::service::AdmissionServiceImpl;
use crate::error::{Result, TollgateError};
use crate::ratelimit::CheckOrchestrator;

/// gRPC server for the admission service.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    orchestrator: Arc<CheckOrchestrator>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, orchestrator: Arc<CheckOrchestrator>) -> Self {
        Self { addr, orchestrator }
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = AdmissionServiceImpl::new(self.orchestrator);

        info!(addr = %self.addr, "Starting gRPC server for Admission service");

        Server::builder()
            .add_service(AdmissionServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TollgateError::Grpc(e)
            })
    }
}
