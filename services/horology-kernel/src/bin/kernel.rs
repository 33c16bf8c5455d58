use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use horology_kernel::replication::LeaseCoordinator;
use horology_kernel::{
    telemetry, ConsensusSettings, ConsensusSupervisor, HorologyKernel, HorologyKernelService,
    KernelRuntimeOptions, LeaderHandle, LeaseSettings, MemoryTransitionLog, MemoryProjection,
    PostgresProjection, PostgresTransitionLog, RequestSigner, SchedulerConfig,
};
use tokio::signal;
use tonic::transport::Server;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let telemetry = telemetry::init("horology-kernel")?;

    let node_id = std::env::var("KERNEL_NODE_ID")
        .map_err(|_| anyhow::anyhow!("KERNEL_NODE_ID must be set"))?;
    info!(node = %node_id, "starting horology kernel");

    let mut config = SchedulerConfig::default();
    config.jitter_warn_ms = env_u64("KERNEL_JITTER_WARN_MS", 500) as i64;

    let (kernel, supervisor, coordinator) = build_kernel(config, &node_id).await?;

    let metrics_addr: SocketAddr = std::env::var("KERNEL_METRICS_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9464".to_string())
        .parse()?;
    let metrics_task = telemetry.serve_metrics(metrics_addr).await?;

    let mut health = kernel.health();
    tokio::spawn(async move {
        while health.changed().await.is_ok() {
            if let Some(alert) = health.borrow().clone() {
                warn!(reason = %alert.reason, detail = %alert.detail, "kernel health degraded");
            }
        }
    });

    let signer = request_signer_from_env();
    let grpc_addr: SocketAddr = std::env::var("KERNEL_GRPC_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:50051".to_string())
        .parse()?;
    let service = HorologyKernelService::new(kernel, signer);

    info!(%grpc_addr, "serving horology kernel gRPC");
    Server::builder()
        .add_service(service.into_server())
        .serve_with_shutdown(grpc_addr, async {
            signal::ctrl_c()
                .await
                .expect("failed to listen for shutdown signal");
        })
        .await?;

    info!("shutting down horology kernel");
    metrics_task.abort();
    if let Some(supervisor) = supervisor {
        supervisor.shutdown().await.ok();
    }
    if let Some(coordinator) = coordinator {
        coordinator.shutdown().await;
    }
    telemetry.shutdown();
    Ok(())
}

async fn build_kernel(
    config: SchedulerConfig,
    node_id: &str,
) -> anyhow::Result<(
    HorologyKernel,
    Option<ConsensusSupervisor>,
    Option<LeaseCoordinator>,
)> {
    match std::env::var("KERNEL_STORE")
        .unwrap_or_else(|_| "memory".to_string())
        .to_lowercase()
        .as_str()
    {
        "postgres" => {
            let database_url = std::env::var("KERNEL_DATABASE_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!(
                        "KERNEL_DATABASE_URL or DATABASE_URL must be set when KERNEL_STORE=postgres"
                    )
                })?;
            let projection = PostgresProjection::connect(&database_url).await?;
            let pool = projection.pool();
            sqlx::migrate!("./migrations").run(&pool).await?;

            let (supervisor, coordinator, leader) = start_elector(node_id, pool.clone()).await?;
            let options = KernelRuntimeOptions {
                log: Arc::new(PostgresTransitionLog::new(pool, leader.clone())),
                projection: Arc::new(projection),
                leader,
            };
            let kernel = HorologyKernel::start(config, options).await?;
            info!(kernel_store = "postgres", "loaded horology kernel with postgres persistence");
            Ok((kernel, supervisor, coordinator))
        }
        other => {
            if other != "memory" {
                warn!(store = other, "unknown KERNEL_STORE value, defaulting to in-memory");
            }
            let leader = LeaderHandle::resident_leader();
            let options = KernelRuntimeOptions {
                log: Arc::new(MemoryTransitionLog::new(leader.clone())),
                projection: Arc::new(MemoryProjection::new()),
                leader,
            };
            let kernel = HorologyKernel::start(config, options).await?;
            Ok((kernel, None, None))
        }
    }
}

/// Consensus group when a cluster is configured, lease coordinator otherwise.
async fn start_elector(
    node_id: &str,
    pool: sqlx::Pool<sqlx::Postgres>,
) -> anyhow::Result<(
    Option<ConsensusSupervisor>,
    Option<LeaseCoordinator>,
    LeaderHandle,
)> {
    if let Ok(raft_id_raw) = std::env::var("KERNEL_RAFT_NODE_ID") {
        let raft_node_id: u64 = raft_id_raw
            .parse()
            .map_err(|error| anyhow::anyhow!("invalid KERNEL_RAFT_NODE_ID: {error}"))?;
        let rpc_addr: SocketAddr = std::env::var("KERNEL_RAFT_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:7207".to_string())
            .parse()
            .map_err(|error| anyhow::anyhow!("invalid KERNEL_RAFT_ADDR: {error}"))?;
        let peers_env = std::env::var("KERNEL_RAFT_PEERS")
            .unwrap_or_else(|_| format!("{raft_node_id}=http://127.0.0.1:7207"));
        let peers = parse_peer_map(&peers_env)?;
        let election_timeout = env_u64("KERNEL_RAFT_ELECTION_TIMEOUT_MS", 900);
        let heartbeat = env_u64("KERNEL_RAFT_HEARTBEAT_MS", 200);

        match ConsensusSupervisor::start(ConsensusSettings {
            node_id: raft_node_id,
            rpc_addr,
            peers,
            election_timeout_min_ms: election_timeout,
            election_timeout_max_ms: election_timeout * 2,
            heartbeat_interval_ms: heartbeat,
        })
        .await
        {
            Ok((supervisor, leader)) => return Ok((Some(supervisor), None, leader)),
            Err(error) => {
                warn!(?error, "failed to start consensus supervisor; using lease coordinator");
            }
        }
    }

    let settings = LeaseSettings {
        pool,
        node_id: node_id.to_string(),
        heartbeat_interval: Duration::from_millis(env_u64("KERNEL_RAFT_HEARTBEAT_MS", 200)),
        election_timeout: Duration::from_millis(env_u64("KERNEL_RAFT_ELECTION_TIMEOUT_MS", 900)),
    };
    let (coordinator, leader) = LeaseCoordinator::start(settings).await?;
    info!(node = %node_id, "started lease coordinator");
    Ok((None, Some(coordinator), leader))
}

fn request_signer_from_env() -> RequestSigner {
    match std::env::var("KERNEL_GATEWAY_SECRET") {
        Ok(secret) if !secret.trim().is_empty() => RequestSigner::new(secret.as_bytes()),
        _ => {
            warn!("KERNEL_GATEWAY_SECRET not configured; using insecure development secret");
            RequestSigner::insecure_dev()
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_peer_map(value: &str) -> anyhow::Result<HashMap<u64, String>> {
    let mut map = HashMap::new();
    for pair in value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
    {
        let (id_raw, addr) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid KERNEL_RAFT_PEERS entry '{pair}'"))?;
        let id: u64 = id_raw
            .trim()
            .parse()
            .map_err(|error| anyhow::anyhow!("invalid peer id '{id_raw}': {error}"))?;
        map.insert(id, addr.trim().to_string());
    }
    if map.is_empty() {
        return Err(anyhow::anyhow!("KERNEL_RAFT_PEERS produced an empty peer set"));
    }
    Ok(map)
}
