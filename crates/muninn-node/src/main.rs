use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use muninn_coord::{EtcdConfig, EtcdRegistry, Registry};
use muninn_engine::{run_membership, CacheEngine, EngineConfig};
use muninn_peer::{GrpcTransport, TransportConfig};
use muninn_server::serve_peer;
use muninn_store::{LocalStore, MemStore, RedisStore, TtlSweeper};
use muninn_types::NodeDescriptor;

#[derive(clap::Parser, Debug)]
#[command(name = "muninn-node", about = "Muninn distributed cache node")]
struct Cli {
    #[arg(long)]
    node_id: String,
    /// Host peers use to reach this node's store and RPC endpoints.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Port of this node's backing store (the store channel).
    #[arg(long, default_value_t = 6379)]
    store_port: u16,
    /// Port this node accepts peer RPCs on.
    #[arg(long, default_value_t = 17400)]
    peer_port: u16,
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[derive(Debug, Deserialize)]
struct StoreConfig {
    backend: String,
    endpoint: String,
    mem_sweep_interval_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ClusterConfig {
    replica_factor: usize,
    ring_virtual_slots: usize,
}

#[derive(Debug, Deserialize)]
struct CoordinationConfig {
    endpoints: Vec<String>,
    base_path: String,
    session_ttl_secs: i64,
    poll_interval_ms: u64,
    reconnect_base_ms: u64,
    reconnect_max_attempts: u32,
    event_capacity: usize,
}

#[derive(Debug, Deserialize)]
struct PeerConfig {
    rpc_deadline_ms: u64,
    fanout_deadline_ms: u64,
    secondary_replicate_delay_ms: u64,
    secondary_invalidate_delay_ms: u64,
    max_retries: u32,
    retry_backoff_base_ms: u64,
    keepalive_interval_ms: u64,
    keepalive_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    store: StoreConfig,
    cluster: ClusterConfig,
    coordination: CoordinationConfig,
    peer: PeerConfig,
    observability: ObservabilityConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new()
        .merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let config: Config = figment
        .merge(Env::prefixed("MUNINN_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    tracing::info!(
        node_id = %cli.node_id,
        host = %cli.host,
        store_port = cli.store_port,
        peer_port = cli.peer_port,
        backend = %config.store.backend,
        "node starting"
    );

    match config.store.backend.as_str() {
        "mem" => {
            let store = MemStore::new();
            let sweeper = TtlSweeper::new(
                store.clone(),
                Duration::from_millis(config.store.mem_sweep_interval_ms),
            );
            tokio::spawn(sweeper.run());
            run_node(store, cli, config).await
        }
        _ => {
            let store = RedisStore::connect(&config.store.endpoint)
                .await
                .with_context(|| format!("cannot reach local store at {}", config.store.endpoint))?;
            run_node(store, cli, config).await
        }
    }
}

async fn run_node<S: LocalStore>(store: S, cli: Cli, config: Config) -> anyhow::Result<()> {
    let descriptor = NodeDescriptor {
        node_id: cli.node_id.clone(),
        host: cli.host.clone(),
        port: cli.store_port,
        peer_port: cli.peer_port,
    };

    let transport_cfg = TransportConfig {
        rpc_deadline: Duration::from_millis(config.peer.rpc_deadline_ms),
        max_retries: config.peer.max_retries,
        retry_backoff_base: Duration::from_millis(config.peer.retry_backoff_base_ms),
        keepalive_interval: Duration::from_millis(config.peer.keepalive_interval_ms),
        keepalive_timeout: Duration::from_millis(config.peer.keepalive_timeout_ms),
    };
    let mut engine_cfg = EngineConfig::new(cli.node_id.clone());
    engine_cfg.replica_factor = config.cluster.replica_factor;
    engine_cfg.ring_virtual_slots = config.cluster.ring_virtual_slots;
    engine_cfg.fanout_deadline = Duration::from_millis(config.peer.fanout_deadline_ms);
    engine_cfg.secondary_replicate_delay =
        Duration::from_millis(config.peer.secondary_replicate_delay_ms);
    engine_cfg.secondary_invalidate_delay =
        Duration::from_millis(config.peer.secondary_invalidate_delay_ms);

    let transport = Arc::new(GrpcTransport::new(transport_cfg));
    let engine = Arc::new(CacheEngine::new(engine_cfg, Arc::new(store), transport));

    // Self-only ring first: the node serves in degraded single-node mode
    // until coordination delivers the rest of the cluster.
    engine.add_member(&descriptor).await;

    let etcd_cfg = EtcdConfig {
        endpoints: config.coordination.endpoints.clone(),
        base_path: config.coordination.base_path.clone(),
        session_ttl_secs: config.coordination.session_ttl_secs,
        poll_interval: Duration::from_millis(config.coordination.poll_interval_ms),
        reconnect_base: Duration::from_millis(config.coordination.reconnect_base_ms),
        reconnect_max_attempts: config.coordination.reconnect_max_attempts,
        event_capacity: config.coordination.event_capacity,
    };
    let registry = match EtcdRegistry::connect(etcd_cfg).await {
        Ok(registry) => {
            let registry = Arc::new(registry);
            if let Err(e) = registry.register(&descriptor).await {
                tracing::warn!(error = %e, "registration failed; membership will catch up");
            }
            Some(registry)
        }
        Err(e) => {
            tracing::warn!(error = %e, "coordination unreachable; running degraded single-node");
            None
        }
    };
    let membership_task = registry
        .as_ref()
        .map(|r| tokio::spawn(run_membership(engine.clone(), r.clone())));

    let peer_addr: SocketAddr = format!("0.0.0.0:{}", cli.peer_port)
        .parse()
        .context("invalid peer address")?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(serve_peer(peer_addr, engine.clone(), async {
        let _ = shutdown_rx.await;
    }));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    if let Some(registry) = &registry {
        if let Err(e) = registry.unregister(&descriptor.node_id).await {
            tracing::warn!(error = %e, "unregister failed; session expiry will cover it");
        }
    }
    if let Some(task) = membership_task {
        task.abort();
    }
    let _ = shutdown_tx.send(());
    // Bounded drain of in-flight work before the process exits.
    match tokio::time::timeout(Duration::from_secs(5), server).await {
        Ok(result) => result??,
        Err(_) => tracing::warn!("server drain timed out"),
    }

    tracing::info!("bye");
    Ok(())
}
