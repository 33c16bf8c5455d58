use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TimerStatus {
    Scheduled,
    Armed,
    Fired,
    Cancelled,
    Failed,
}

impl TimerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerStatus::Scheduled => "scheduled",
            TimerStatus::Armed => "armed",
            TimerStatus::Fired => "fired",
            TimerStatus::Cancelled => "cancelled",
            TimerStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(TimerStatus::Scheduled),
            "armed" => Some(TimerStatus::Armed),
            "fired" => Some(TimerStatus::Fired),
            "cancelled" | "canceled" => Some(TimerStatus::Cancelled),
            "failed" => Some(TimerStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TimerStatus::Fired | TimerStatus::Cancelled | TimerStatus::Failed
        )
    }

    /// Legal edges of the status DAG. Terminal states accept nothing.
    pub fn can_transition_to(&self, next: TimerStatus) -> bool {
        match self {
            TimerStatus::Scheduled => matches!(
                next,
                TimerStatus::Armed
                    | TimerStatus::Fired
                    | TimerStatus::Cancelled
                    | TimerStatus::Failed
            ),
            TimerStatus::Armed => matches!(
                next,
                TimerStatus::Fired | TimerStatus::Cancelled | TimerStatus::Failed
            ),
            TimerStatus::Fired | TimerStatus::Cancelled | TimerStatus::Failed => false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionRetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for ActionRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 1000,
            multiplier: 2.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub retry_policy: Option<ActionRetryPolicy>,
}

/// Opaque to the kernel; the orchestrator interprets it on fire.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionBundle {
    pub actions: Vec<Action>,
    pub retry_policy: Option<ActionRetryPolicy>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentBinding {
    pub adapter: String,
    pub target: String,
    #[serde(default)]
    pub payload_template: serde_json::Value,
    #[serde(default = "default_ack_timeout_ms")]
    pub acknowledgement_timeout_ms: u64,
}

fn default_ack_timeout_ms() -> u64 {
    60_000
}

/// Validated input to `HorologyKernel::schedule`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSpec {
    pub id: Option<Uuid>,
    pub tenant_id: String,
    pub requested_by: String,
    pub name: Option<String>,
    pub duration_ms: Option<u64>,
    pub fire_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Raw bundle payload. Admission-checked by the kernel: a rejected
    /// bundle still produces a timer row, in the terminal `failed` status.
    pub action_bundle: Option<serde_json::Value>,
    pub agent_binding: Option<AgentBinding>,
    pub idempotency_key: Option<String>,
}

/// Authoritative timer row. Mutated only through the kernel commit path; every
/// mutation corresponds to one committed transition in the log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub requested_by: String,
    pub name: String,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
    pub fire_at: DateTime<Utc>,
    pub status: TimerStatus,
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub action_bundle: Option<ActionBundle>,
    pub agent_binding: Option<AgentBinding>,
    pub fired_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub failure_reason: Option<String>,
    pub idempotency_key: Option<String>,
    /// Log index of the `scheduled` transition; stable list cursor.
    pub created_index: u64,
    /// Log index of the most recent transition.
    pub last_index: u64,
    /// fired_at - fire_at, recorded at fire time.
    pub observed_jitter_ms: Option<i64>,
}

impl TimerRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Scheduled,
    Armed,
    Fired,
    Cancelled,
    Failed,
    Settled,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Scheduled => "scheduled",
            TransitionKind::Armed => "armed",
            TransitionKind::Fired => "fired",
            TransitionKind::Cancelled => "cancelled",
            TransitionKind::Failed => "failed",
            TransitionKind::Settled => "settled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(TransitionKind::Scheduled),
            "armed" => Some(TransitionKind::Armed),
            "fired" => Some(TransitionKind::Fired),
            "cancelled" => Some(TransitionKind::Cancelled),
            "failed" => Some(TransitionKind::Failed),
            "settled" => Some(TransitionKind::Settled),
            _ => None,
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            TransitionKind::Scheduled => "timer.scheduled",
            TransitionKind::Armed => "timer.armed",
            TransitionKind::Fired => "timer.fired",
            TransitionKind::Cancelled => "timer.cancelled",
            TransitionKind::Failed => "timer.failed",
            TransitionKind::Settled => "timer.settled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_dag_is_monotonic() {
        assert!(TimerStatus::Scheduled.can_transition_to(TimerStatus::Armed));
        assert!(TimerStatus::Scheduled.can_transition_to(TimerStatus::Cancelled));
        assert!(TimerStatus::Armed.can_transition_to(TimerStatus::Fired));
        assert!(!TimerStatus::Fired.can_transition_to(TimerStatus::Cancelled));
        assert!(!TimerStatus::Cancelled.can_transition_to(TimerStatus::Fired));
        assert!(!TimerStatus::Failed.can_transition_to(TimerStatus::Scheduled));
        assert!(!TimerStatus::Armed.can_transition_to(TimerStatus::Scheduled));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            TimerStatus::Scheduled,
            TimerStatus::Armed,
            TimerStatus::Fired,
            TimerStatus::Cancelled,
            TimerStatus::Failed,
        ] {
            assert_eq!(TimerStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TimerStatus::from_str("canceled"), Some(TimerStatus::Cancelled));
        assert_eq!(TimerStatus::from_str("bogus"), None);
    }
}
