mod cache_service;
mod convert;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use muninn_engine::CacheEngine;
use muninn_peer::PeerTransport;
use muninn_proto::v1::cache_service_server::CacheServiceServer;
use muninn_store::LocalStore;
use tonic_reflection::server::Builder as ReflectionBuilder;

use cache_service::CacheServiceImpl;

/// Serve the peer cache protocol until `shutdown` resolves.
pub async fn serve_peer<S, T>(
    addr: SocketAddr,
    engine: Arc<CacheEngine<S, T>>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()>
where
    S: LocalStore,
    T: PeerTransport,
{
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(muninn_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .expect("failed to build reflection service");
    tracing::info!(%addr, "peer gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(CacheServiceServer::new(CacheServiceImpl::new(engine)))
        .add_service(reflection)
        .serve_with_shutdown(addr, shutdown)
        .await
        .map_err(Into::into)
}
