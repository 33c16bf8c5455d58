use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use command_gateway::{
    router, AppState, KernelForwarder, QuotaLedger, QuotaLimits, ResolverChain, SharedResolver,
    StaticKeyring,
};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let default_quotas = QuotaLimits::from_env();
    let keyring = StaticKeyring::from_env(default_quotas)?;
    let resolver = ResolverChain::new(vec![Arc::new(keyring) as SharedResolver]);

    let request_timeout =
        Duration::from_millis(env_u64("GATEWAY_REQUEST_TIMEOUT_MS", 10_000));
    let state = Arc::new(AppState {
        resolver,
        ledger: QuotaLedger::new(),
        forwarder: KernelForwarder::from_env(),
        request_timeout,
    });

    let addr: SocketAddr = std::env::var("GATEWAY_HTTP_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "serving command gateway");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            signal::ctrl_c()
                .await
                .expect("failed to listen for shutdown signal");
        })
        .await?;

    info!("shutting down command gateway");
    Ok(())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
