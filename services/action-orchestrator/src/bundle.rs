use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How the orchestrator reads the bundle the kernel carries opaquely.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionBundle {
    pub actions: Vec<ActionSpec>,
    /// Bundle-level default, overridden per action.
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_multiplier() -> f64 {
    2.0
}

pub const MAX_ATTEMPTS_CAP: u32 = 20;

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    pub fn capped_attempts(&self) -> u32 {
        self.max_attempts.clamp(1, MAX_ATTEMPTS_CAP)
    }
}

impl ActionSpec {
    pub fn effective_retry(&self, bundle: &ActionBundle) -> RetryPolicy {
        self.retry_policy
            .or(bundle.retry_policy)
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookParams {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_method() -> String {
    "POST".to_string()
}
fn default_webhook_timeout_ms() -> u64 {
    10_000
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPromptParams {
    pub adapter: String,
    pub target: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

pub fn parse_bundle(raw: &str) -> anyhow::Result<ActionBundle> {
    let bundle: ActionBundle = serde_json::from_str(raw)?;
    if bundle.actions.is_empty() {
        anyhow::bail!("action bundle has no actions");
    }
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bundle_with_per_action_override() {
        let bundle = parse_bundle(
            r#"{
                "actions": [
                    {"id": "hook", "kind": "webhook",
                     "parameters": {"url": "https://example.test/h"},
                     "retryPolicy": {"maxAttempts": 5}},
                    {"id": "wake", "kind": "agent_prompt",
                     "parameters": {"adapter": "mcp", "target": "agent-1"}}
                ],
                "retryPolicy": {"maxAttempts": 2, "initialBackoffMs": 50}
            }"#,
        )
        .expect("bundle");

        let hook = bundle.actions[0].effective_retry(&bundle);
        assert_eq!(hook.max_attempts, 5);
        // Partial policies fall back to field defaults, not the bundle's.
        assert_eq!(hook.initial_backoff_ms, 1_000);

        let wake = bundle.actions[1].effective_retry(&bundle);
        assert_eq!(wake.max_attempts, 2);
        assert_eq!(wake.initial_backoff_ms, 50);
    }

    #[test]
    fn attempts_are_capped() {
        let policy = RetryPolicy {
            max_attempts: 500,
            ..Default::default()
        };
        assert_eq!(policy.capped_attempts(), MAX_ATTEMPTS_CAP);
        let zero = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(zero.capped_attempts(), 1);
    }

    #[test]
    fn empty_bundles_are_rejected() {
        assert!(parse_bundle(r#"{"actions": []}"#).is_err());
        assert!(parse_bundle("not json").is_err());
    }

    #[test]
    fn webhook_params_apply_defaults() {
        let params: WebhookParams =
            serde_json::from_value(serde_json::json!({"url": "https://example.test/h"}))
                .expect("params");
        assert_eq!(params.method, "POST");
        assert_eq!(params.timeout_ms, 10_000);
        assert!(params.headers.is_empty());
    }
}
