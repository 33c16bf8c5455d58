use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use tracing::{info, warn};

use crate::bundle::{ActionSpec, AgentPromptParams, WebhookParams};

/// What one attempt of one action produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    /// Worth retrying: 5xx, 408/429, transport errors, deferred acks.
    Retriable(String),
    /// Dead on arrival: other 4xx, unknown adapters, rejected acks.
    Terminal(String),
}

/// Context shared by every action of one fired timer. `(timer_id,
/// fire_index)` is the idempotency key downstream receivers can use to
/// deduplicate replays.
#[derive(Clone, Debug)]
pub struct FireContext {
    pub tenant_id: String,
    pub timer_id: String,
    pub timer_name: String,
    pub fire_index: u64,
    pub fired_at: DateTime<Utc>,
}

impl FireContext {
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.timer_id, self.fire_index)
    }
}

pub const IDEMPOTENCY_HEADER: &str = "x-minoots-idempotency-key";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentAck {
    Acknowledged,
    Deferred,
    Rejected,
}

/// Transport adapter for `agent_prompt` actions (MCP bridges, queues, ...).
#[async_trait]
pub trait AgentAdapter: Send + Sync + 'static {
    async fn dispatch(
        &self,
        target: &str,
        payload: &serde_json::Value,
        context: &FireContext,
    ) -> anyhow::Result<AgentAck>;
}

/// Dev adapter: logs the prompt and acknowledges.
pub struct LoggingAdapter;

#[async_trait]
impl AgentAdapter for LoggingAdapter {
    async fn dispatch(
        &self,
        target: &str,
        payload: &serde_json::Value,
        context: &FireContext,
    ) -> anyhow::Result<AgentAck> {
        info!(
            target,
            timer_id = %context.timer_id,
            %payload,
            "agent prompt dispatched via logging adapter"
        );
        Ok(AgentAck::Acknowledged)
    }
}

pub struct ActionRunner {
    client: reqwest::Client,
    adapters: HashMap<String, Arc<dyn AgentAdapter>>,
    timeout_cap: Duration,
}

impl ActionRunner {
    pub fn new(timeout_cap: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("minoots-action-orchestrator/0.1")
            .build()?;
        let mut adapters: HashMap<String, Arc<dyn AgentAdapter>> = HashMap::new();
        adapters.insert("log".to_string(), Arc::new(LoggingAdapter));
        Ok(Self {
            client,
            adapters,
            timeout_cap,
        })
    }

    pub fn register_adapter(&mut self, name: &str, adapter: Arc<dyn AgentAdapter>) {
        self.adapters.insert(name.to_string(), adapter);
    }

    /// Execute one attempt of one action.
    pub async fn attempt(&self, action: &ActionSpec, context: &FireContext) -> AttemptOutcome {
        match action.kind.as_str() {
            "webhook" => match serde_json::from_value::<WebhookParams>(action.parameters.clone()) {
                Ok(params) => self.webhook_attempt(&params, context).await,
                Err(err) => AttemptOutcome::Terminal(format!("malformed webhook parameters: {err}")),
            },
            "agent_prompt" => {
                match serde_json::from_value::<AgentPromptParams>(action.parameters.clone()) {
                    Ok(params) => self.agent_attempt(&params, context).await,
                    Err(err) => {
                        AttemptOutcome::Terminal(format!("malformed agent_prompt parameters: {err}"))
                    }
                }
            }
            other => AttemptOutcome::Terminal(format!("unknown action kind '{other}'")),
        }
    }

    async fn webhook_attempt(
        &self,
        params: &WebhookParams,
        context: &FireContext,
    ) -> AttemptOutcome {
        let method = match Method::from_bytes(params.method.to_uppercase().as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                return AttemptOutcome::Terminal(format!("invalid method '{}'", params.method))
            }
        };

        let timeout = Duration::from_millis(params.timeout_ms).min(self.timeout_cap);
        let body = params.body.clone().unwrap_or_else(|| {
            serde_json::json!({
                "event": "timer.fired",
                "timerId": context.timer_id,
                "tenantId": context.tenant_id,
                "timerName": context.timer_name,
                "firedAt": context.fired_at.to_rfc3339(),
            })
        });

        let mut request = self
            .client
            .request(method, &params.url)
            .timeout(timeout)
            .header(IDEMPOTENCY_HEADER, context.idempotency_key())
            .json(&body);
        for (name, value) in &params.headers {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    AttemptOutcome::Success
                } else if status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429
                {
                    AttemptOutcome::Retriable(format!("webhook returned {status}"))
                } else {
                    AttemptOutcome::Terminal(format!("webhook returned {status}"))
                }
            }
            Err(error) => {
                // Transport-level failures (DNS flaps, resets, timeouts) are
                // retriable; a permanently bad URL never got this far.
                warn!(?error, url = %params.url, "webhook attempt failed");
                AttemptOutcome::Retriable(format!("webhook transport error: {error}"))
            }
        }
    }

    async fn agent_attempt(
        &self,
        params: &AgentPromptParams,
        context: &FireContext,
    ) -> AttemptOutcome {
        let Some(adapter) = self.adapters.get(&params.adapter) else {
            return AttemptOutcome::Terminal(format!("unknown adapter '{}'", params.adapter));
        };
        match adapter
            .dispatch(&params.target, &params.payload, context)
            .await
        {
            Ok(AgentAck::Acknowledged) => AttemptOutcome::Success,
            Ok(AgentAck::Deferred) => {
                AttemptOutcome::Retriable(format!("adapter '{}' deferred", params.adapter))
            }
            Ok(AgentAck::Rejected) => {
                AttemptOutcome::Terminal(format!("adapter '{}' rejected", params.adapter))
            }
            Err(error) => AttemptOutcome::Retriable(format!("adapter transport error: {error}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::ActionSpec;

    fn context() -> FireContext {
        FireContext {
            tenant_id: "acme".into(),
            timer_id: "11111111-2222-3333-4444-555555555555".into(),
            timer_name: "t".into(),
            fire_index: 9,
            fired_at: Utc::now(),
        }
    }

    fn action(kind: &str, parameters: serde_json::Value) -> ActionSpec {
        ActionSpec {
            id: "a-1".into(),
            kind: kind.into(),
            parameters,
            retry_policy: None,
        }
    }

    #[tokio::test]
    async fn unknown_kinds_and_adapters_are_terminal() {
        let runner = ActionRunner::new(Duration::from_secs(5)).expect("runner");
        let outcome = runner.attempt(&action("carrier_pigeon", serde_json::json!({})), &context()).await;
        assert!(matches!(outcome, AttemptOutcome::Terminal(_)));

        let outcome = runner
            .attempt(
                &action(
                    "agent_prompt",
                    serde_json::json!({"adapter": "nope", "target": "x"}),
                ),
                &context(),
            )
            .await;
        assert!(matches!(outcome, AttemptOutcome::Terminal(_)));
    }

    #[tokio::test]
    async fn logging_adapter_acknowledges() {
        let runner = ActionRunner::new(Duration::from_secs(5)).expect("runner");
        let outcome = runner
            .attempt(
                &action(
                    "agent_prompt",
                    serde_json::json!({"adapter": "log", "target": "agent-1", "payload": {"hi": 1}}),
                ),
                &context(),
            )
            .await;
        assert_eq!(outcome, AttemptOutcome::Success);
    }

    #[tokio::test]
    async fn malformed_parameters_are_terminal() {
        let runner = ActionRunner::new(Duration::from_secs(5)).expect("runner");
        let outcome = runner
            .attempt(&action("webhook", serde_json::json!({"method": "POST"})), &context())
            .await;
        assert!(matches!(outcome, AttemptOutcome::Terminal(_)));
    }

    #[test]
    fn idempotency_key_combines_timer_and_fire_index() {
        let key = context().idempotency_key();
        assert_eq!(key, "11111111-2222-3333-4444-555555555555:9");
    }
}
