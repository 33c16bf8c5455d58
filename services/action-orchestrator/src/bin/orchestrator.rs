use std::time::Duration;

use action_orchestrator::{ActionRunner, FileCursor, Orchestrator, OrchestratorConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let kernel_endpoint = std::env::var("KERNEL_GRPC_ENDPOINT")
        .unwrap_or_else(|_| "http://127.0.0.1:50051".to_string());
    let secret = std::env::var("KERNEL_GATEWAY_SECRET")
        .unwrap_or_else(|_| "minoots-dev-secret".to_string());
    let cursor_path = std::env::var("ORCHESTRATOR_CURSOR_PATH")
        .unwrap_or_else(|_| "orchestrator-cursor.json".to_string());
    let attempt_timeout = Duration::from_millis(env_u64("ORCHESTRATOR_DEFAULT_TIMEOUT_MS", 10_000));
    let max_inflight = env_u64("ORCHESTRATOR_MAX_INFLIGHT", 64) as usize;

    info!(%kernel_endpoint, %cursor_path, max_inflight, "starting action orchestrator");

    let runner = ActionRunner::new(attempt_timeout)?;
    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            kernel_endpoint,
            secret: secret.into_bytes(),
            cursor: FileCursor::new(cursor_path),
            max_inflight,
            attempt_timeout,
            reconnect_backoff: Duration::from_secs(2),
        },
        runner,
    );

    tokio::select! {
        result = orchestrator.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down action orchestrator");
            Ok(())
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
