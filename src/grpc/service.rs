//! Admission service implementation.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, error, instrument, warn};

use super::proto::tollgate::v1::{admission_server::Admission, CheckRequest, CheckResponse};
use crate::ratelimit::{CheckError, CheckOrchestrator, Decision};

/// Implementation of the `tollgate.v1.Admission` gRPC interface.
pub struct AdmissionServiceImpl {
    orchestrator: Arc<CheckOrchestrator>,
}

impl AdmissionServiceImpl {
    pub fn new(orchestrator: Arc<CheckOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

/// Map a classified check failure onto a gRPC status.
pub(crate) fn status_for(err: &CheckError) -> Status {
    match err {
        CheckError::ProjectNotFound => Status::unauthenticated("Invalid API key"),
        CheckError::EndpointNotOwned => {
            Status::permission_denied("Endpoint does not belong to this project")
        }
        CheckError::Store(_) | CheckError::EngineConstruction(_) | CheckError::Engine(_) => {
            Status::internal("Internal error")
        }
    }
}

#[tonic::async_trait]
impl Admission for AdmissionServiceImpl {
    /// Admit or reject one downstream request.
    #[instrument(
        skip(self, request),
        fields(
            endpoint = %request.get_ref().endpoint,
        )
    )]
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let req = request.into_inner();

        if req.api_key.is_empty() {
            warn!("Received admission check with empty api_key");
            return Err(Status::invalid_argument("api_key is required"));
        }

        if req.endpoint.is_empty() {
            warn!("Received admission check with empty endpoint");
            return Err(Status::invalid_argument("endpoint is required"));
        }

        match self
            .orchestrator
            .check(&req.api_key, &req.endpoint, &req.key)
            .await
        {
            Ok(Decision::Allowed) => {
                debug!("Request admitted");
                Ok(Response::new(CheckResponse { allowed: true }))
            }
            Ok(Decision::Denied) => Err(Status::resource_exhausted("Rate limit exceeded")),
            Err(err) => {
                if err.is_retryable() {
                    error!(error = %err, "Admission check failed");
                } else {
                    debug!(error = %err, "Admission check rejected");
                }
                Err(status_for(&err))
            }
        }
    }
}
