use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use action_orchestrator::{
    ActionRunner, FileCursor, Orchestrator, OrchestratorConfig, IDEMPOTENCY_HEADER,
};
use anyhow::Result;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use horology_kernel::{
    HorologyKernel, HorologyKernelService, RequestSigner, SchedulerConfig, TimerSpec, TimerStatus,
};
use tokio_stream::wrappers::TcpListenerStream;

const SHARED_SECRET: &[u8] = b"minoots-dev-secret";

#[derive(Default)]
struct HookState {
    calls: AtomicU32,
    /// Status to return for call n (1-based); anything past the list is 200.
    plan: Vec<u16>,
    seen_keys: std::sync::Mutex<Vec<String>>,
}

async fn hook(State(state): State<Arc<HookState>>, headers: HeaderMap) -> StatusCode {
    let call = state.calls.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(key) = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        state.seen_keys.lock().unwrap().push(key.to_string());
    }
    let status = state
        .plan
        .get(call as usize - 1)
        .copied()
        .unwrap_or(200);
    StatusCode::from_u16(status).unwrap_or(StatusCode::OK)
}

async fn boot_hook_server(plan: Vec<u16>) -> Result<(String, Arc<HookState>)> {
    let state = Arc::new(HookState {
        calls: AtomicU32::new(0),
        plan,
        seen_keys: std::sync::Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/hook", post(hook))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { axum::serve(listener, app).await });
    Ok((format!("http://{addr}/hook"), state))
}

async fn boot_kernel() -> Result<(HorologyKernel, String)> {
    let kernel = HorologyKernel::in_memory(SchedulerConfig::default());
    let service = HorologyKernelService::new(kernel.clone(), RequestSigner::new(SHARED_SECRET));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(service.into_server())
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
    });
    Ok((kernel, format!("http://{addr}")))
}

fn spawn_orchestrator(kernel_endpoint: String) {
    let cursor_path = std::env::temp_dir().join(format!(
        "orchestrator-test-{}.json",
        uuid::Uuid::new_v4()
    ));
    let runner = ActionRunner::new(Duration::from_secs(5)).expect("runner");
    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            kernel_endpoint,
            secret: SHARED_SECRET.to_vec(),
            cursor: FileCursor::new(cursor_path),
            max_inflight: 8,
            attempt_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_millis(200),
        },
        runner,
    );
    tokio::spawn(async move { orchestrator.run().await });
}

fn webhook_spec(tenant: &str, url: &str, max_attempts: u32) -> TimerSpec {
    let bundle = serde_json::json!({
        "actions": [{
            "id": "hook-1",
            "kind": "webhook",
            "parameters": {"url": url, "method": "POST", "timeoutMs": 2000},
            "retryPolicy": {
                "maxAttempts": max_attempts,
                "initialBackoffMs": 100,
                "multiplier": 2.0
            }
        }]
    });
    TimerSpec {
        id: None,
        tenant_id: tenant.into(),
        requested_by: "orchestrator-tests".into(),
        name: Some("webhook-timer".into()),
        duration_ms: Some(60),
        fire_at: None,
        metadata: None,
        labels: HashMap::new(),
        action_bundle: Some(bundle),
        agent_binding: None,
        idempotency_key: None,
    }
}

async fn wait_for_settlement(
    kernel: &HorologyKernel,
    tenant: &str,
    timer_id: uuid::Uuid,
) -> horology_kernel::TimerRecord {
    for _ in 0..100 {
        if let Some(timer) = kernel.get(tenant, timer_id).await {
            if timer.settled_at.is_some() {
                return timer;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timer was never settled");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn webhook_retries_then_succeeds() -> Result<()> {
    let (kernel, endpoint) = boot_kernel().await?;
    let (hook_url, hook_state) = boot_hook_server(vec![503]).await?;
    spawn_orchestrator(endpoint);

    let timer = kernel
        .schedule(webhook_spec("acme", &hook_url, 3))
        .await
        .expect("schedule");

    let settled = wait_for_settlement(&kernel, "acme", timer.id).await;
    assert_eq!(settled.status, TimerStatus::Fired);
    assert!(settled.failure_reason.is_none(), "retry should have succeeded");
    assert_eq!(hook_state.calls.load(Ordering::SeqCst), 2, "one retry expected");

    // Both attempts carried the same idempotency key.
    let keys = hook_state.seen_keys.lock().unwrap().clone();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0], keys[1]);
    assert!(keys[0].starts_with(&timer.id.to_string()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_retriable_failures_short_circuit_to_dead_letter() -> Result<()> {
    let (kernel, endpoint) = boot_kernel().await?;
    let (hook_url, hook_state) = boot_hook_server(vec![404, 404, 404]).await?;
    spawn_orchestrator(endpoint);

    let timer = kernel
        .schedule(webhook_spec("acme", &hook_url, 5))
        .await
        .expect("schedule");

    let settled = wait_for_settlement(&kernel, "acme", timer.id).await;
    assert_eq!(settled.status, TimerStatus::Fired);
    let reason = settled.failure_reason.expect("dead-letter reason");
    assert!(reason.contains("404"), "reason should carry the status: {reason}");
    assert!(reason.contains("1 attempts"), "no retries for 4xx: {reason}");
    assert_eq!(hook_state.calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_retries_record_the_last_error() -> Result<()> {
    let (kernel, endpoint) = boot_kernel().await?;
    let (hook_url, hook_state) = boot_hook_server(vec![503, 503, 503]).await?;
    spawn_orchestrator(endpoint);

    let timer = kernel
        .schedule(webhook_spec("acme", &hook_url, 2))
        .await
        .expect("schedule");

    let settled = wait_for_settlement(&kernel, "acme", timer.id).await;
    let reason = settled.failure_reason.expect("dead-letter reason");
    assert!(reason.contains("2 attempts"), "attempts should be recorded: {reason}");
    assert!(reason.contains("503"), "last error should be recorded: {reason}");
    assert_eq!(hook_state.calls.load(Ordering::SeqCst), 2);
    Ok(())
}
