use std::sync::Arc;

use muninn_engine::CacheEngine;
use muninn_peer::PeerTransport;
use muninn_proto::v1::{
    cache_service_server::CacheService, HealthCheckRequest, HealthCheckResponse,
    InvalidateRequest, InvalidateResponse, ReplicateRequest, ReplicateResponse,
};
use muninn_store::LocalStore;
use tonic::{Request, Response, Status};

use crate::convert::cache_to_status;

pub struct CacheServiceImpl<S, T> {
    engine: Arc<CacheEngine<S, T>>,
}

impl<S: LocalStore, T: PeerTransport> CacheServiceImpl<S, T> {
    pub fn new(engine: Arc<CacheEngine<S, T>>) -> Self {
        CacheServiceImpl { engine }
    }
}

#[tonic::async_trait]
impl<S: LocalStore, T: PeerTransport> CacheService for CacheServiceImpl<S, T> {
    async fn replicate(
        &self,
        request: Request<ReplicateRequest>,
    ) -> Result<Response<ReplicateResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }
        let ttl_secs = if req.ttl_secs == 0 { None } else { Some(req.ttl_secs) };
        let outcome = self
            .engine
            .apply_replicate(&req.key, &req.value, ttl_secs, &req.originator_node_id)
            .await
            .map_err(cache_to_status)?;
        Ok(Response::new(ReplicateResponse {
            success: true,
            message: outcome.message().to_string(),
        }))
    }

    async fn invalidate(
        &self,
        request: Request<InvalidateRequest>,
    ) -> Result<Response<InvalidateResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }
        self.engine
            .apply_invalidate(&req.key, &req.originator_node_id)
            .await
            .map_err(cache_to_status)?;
        Ok(Response::new(InvalidateResponse { success: true, message: "ok".to_string() }))
    }

    async fn health_check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(from = %req.node_id, "health check");
        let status = if self.engine.healthy().await { "ok" } else { "degraded" };
        Ok(Response::new(HealthCheckResponse {
            status: status.to_string(),
            message: self.engine.node_id().to_string(),
        }))
    }
}
