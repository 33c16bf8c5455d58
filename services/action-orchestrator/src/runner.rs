use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::Request;
use tracing::{info, warn};

use crate::bundle::{parse_bundle, ActionSpec, RetryPolicy};
use crate::cursor::FileCursor;
use crate::executor::{ActionRunner, AttemptOutcome, FireContext};
use crate::pb;
use crate::pb::horology_kernel_client::HorologyKernelClient;
use crate::retry::backoff_delay;

/// The orchestrator authenticates to the kernel as the internal wildcard
/// principal; it observes every tenant's fired events.
const INTERNAL_TENANT: &str = "__all__";
const PRINCIPAL: &str = "action-orchestrator";

/// Hard cap on any single attempt deadline.
const ATTEMPT_DEADLINE_CAP: Duration = Duration::from_secs(5 * 60);

pub struct OrchestratorConfig {
    pub kernel_endpoint: String,
    pub secret: Vec<u8>,
    pub cursor: FileCursor,
    pub max_inflight: usize,
    pub attempt_timeout: Duration,
    pub reconnect_backoff: Duration,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    runner: Arc<ActionRunner>,
    inflight: Arc<Semaphore>,
}

#[derive(Debug)]
struct ActionResult {
    action_id: String,
    success: bool,
    attempts: u32,
    last_error: Option<String>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, runner: ActionRunner) -> Self {
        let inflight = Arc::new(Semaphore::new(config.max_inflight.max(1)));
        Self {
            config,
            runner: Arc::new(runner),
            inflight,
        }
    }

    /// Consume the fire-event stream forever, reconnecting with the durable
    /// cursor on any stream failure.
    pub async fn run(&self) -> Result<()> {
        loop {
            if let Err(error) = self.consume_stream().await {
                warn!(?error, "event stream interrupted; reconnecting from cursor");
            }
            tokio::time::sleep(self.config.reconnect_backoff).await;
        }
    }

    async fn consume_stream(&self) -> Result<()> {
        let mut client = HorologyKernelClient::connect(self.config.kernel_endpoint.clone())
            .await
            .with_context(|| format!("failed to connect to {}", self.config.kernel_endpoint))?;

        let from = self.config.cursor.load().await?;
        info!(from, "subscribing to fired events");
        let request = self.signed(pb::TimerEventStreamRequest {
            tenant_id: INTERNAL_TENANT.to_string(),
            topics: vec!["timer.fired".to_string()],
            from_cursor: format!("evt-{from:016x}"),
        })?;

        let mut stream = client.stream_timer_events(request).await?.into_inner();
        while let Some(event) = stream.message().await? {
            self.handle_event(&mut client, event).await?;
        }
        Ok(())
    }

    /// Dispatch one fired event's bundle, report outcomes, then advance the
    /// cursor. Replays after a crash re-deliver from the cursor, so every
    /// downstream receives at-least-once.
    async fn handle_event(
        &self,
        client: &mut HorologyKernelClient<Channel>,
        event: pb::TimerEvent,
    ) -> Result<()> {
        let event_id = event.event_id;
        if event.kind == "fired" {
            if let Some(timer) = event.timer {
                if !timer.action_bundle_json.is_empty() {
                    self.dispatch_bundle(client, &event.tenant_id, event_id, timer)
                        .await;
                }
            }
        }
        self.config.cursor.store(event_id).await?;
        Ok(())
    }

    async fn dispatch_bundle(
        &self,
        client: &mut HorologyKernelClient<Channel>,
        tenant_id: &str,
        fire_index: u64,
        timer: pb::Timer,
    ) {
        let context = FireContext {
            tenant_id: tenant_id.to_string(),
            timer_id: timer.id.clone(),
            timer_name: timer.name.clone(),
            fire_index,
            fired_at: parse_instant(&timer.fired_at_iso),
        };

        let bundle = match parse_bundle(&timer.action_bundle_json) {
            Ok(bundle) => bundle,
            Err(error) => {
                warn!(?error, timer_id = %timer.id, "rejecting malformed action bundle");
                self.report(
                    client,
                    &context,
                    ActionResult {
                        action_id: String::new(),
                        success: false,
                        attempts: 0,
                        last_error: Some(format!("malformed action bundle: {error}")),
                    },
                )
                .await;
                return;
            }
        };

        let mut tasks = JoinSet::new();
        for action in bundle.actions.clone() {
            let policy = action.effective_retry(&bundle);
            let runner = Arc::clone(&self.runner);
            let inflight = Arc::clone(&self.inflight);
            let context = context.clone();
            let attempt_timeout = self.config.attempt_timeout.min(ATTEMPT_DEADLINE_CAP);
            tasks.spawn(async move {
                run_action(runner, inflight, action, policy, context, attempt_timeout).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => self.report(client, &context, result).await,
                Err(error) => warn!(?error, "action task panicked"),
            }
        }
    }

    async fn report(
        &self,
        client: &mut HorologyKernelClient<Channel>,
        context: &FireContext,
        result: ActionResult,
    ) {
        if result.success {
            info!(
                timer_id = %context.timer_id,
                action_id = %result.action_id,
                attempts = result.attempts,
                "action succeeded"
            );
        } else {
            warn!(
                timer_id = %context.timer_id,
                action_id = %result.action_id,
                attempts = result.attempts,
                last_error = result.last_error.as_deref().unwrap_or("unknown"),
                "action dead-lettered"
            );
        }

        let request = pb::ActionOutcomeRequest {
            tenant_id: context.tenant_id.clone(),
            timer_id: context.timer_id.clone(),
            fire_index: context.fire_index,
            action_id: result.action_id,
            success: result.success,
            attempts: result.attempts,
            last_error: result.last_error.unwrap_or_default(),
        };
        let request = match self.signed(request) {
            Ok(request) => request,
            Err(error) => {
                warn!(?error, "failed to sign outcome report");
                return;
            }
        };
        if let Err(status) = client.record_action_outcome(request).await {
            // The outcome is advisory on the timer row; the durable cursor
            // still guarantees re-dispatch visibility after a crash.
            warn!(?status, timer_id = %context.timer_id, "failed to record action outcome");
        }
    }

    fn signed<T>(&self, message: T) -> Result<Request<T>> {
        let mut request = Request::new(message);
        let metadata = request.metadata_mut();
        metadata.insert("x-tenant-id", MetadataValue::try_from(INTERNAL_TENANT)?);
        metadata.insert("x-principal-id", MetadataValue::try_from(PRINCIPAL)?);
        metadata.insert(
            "x-signature",
            MetadataValue::try_from(sign(&self.config.secret, PRINCIPAL, INTERNAL_TENANT))?,
        );
        Ok(request)
    }
}

/// One action, retried to completion. Runs as its own task; backoff sleeps
/// never block the event loop or other actions.
async fn run_action(
    runner: Arc<ActionRunner>,
    inflight: Arc<Semaphore>,
    action: ActionSpec,
    policy: RetryPolicy,
    context: FireContext,
    attempt_timeout: Duration,
) -> ActionResult {
    let max_attempts = policy.capped_attempts();
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        let outcome = {
            let _permit = inflight.acquire().await.ok();
            match tokio::time::timeout(attempt_timeout, runner.attempt(&action, &context)).await {
                Ok(outcome) => outcome,
                Err(_) => AttemptOutcome::Retriable("attempt deadline exceeded".to_string()),
            }
        };

        match outcome {
            AttemptOutcome::Success => {
                return ActionResult {
                    action_id: action.id,
                    success: true,
                    attempts: attempt,
                    last_error: None,
                }
            }
            AttemptOutcome::Terminal(reason) => {
                return ActionResult {
                    action_id: action.id,
                    success: false,
                    attempts: attempt,
                    last_error: Some(reason),
                }
            }
            AttemptOutcome::Retriable(reason) => {
                last_error = Some(reason);
                if attempt < max_attempts {
                    tokio::time::sleep(backoff_delay(&policy, attempt)).await;
                }
            }
        }
    }

    ActionResult {
        action_id: action.id,
        success: false,
        attempts: max_attempts,
        last_error,
    }
}

fn sign(secret: &[u8], principal_id: &str, tenant_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(principal_id.as_bytes());
    hasher.update(b":");
    hasher.update(tenant_id.as_bytes());
    hasher.update(b":");
    hasher.update(secret);
    format!("{:x}", hasher.finalize())
}

fn parse_instant(iso: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(iso)
        .map(|instant| instant.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
