use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::log::TransitionRecord;
use crate::model::{TimerRecord, TransitionKind};

/// What subscribers observe. `event_id` is the committed log index, so it is
/// strictly monotonic per tenant and doubles as the resume cursor.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: u64,
    pub tenant_id: String,
    pub timer_id: Uuid,
    pub kind: TransitionKind,
    pub instant: DateTime<Utc>,
    pub reason: Option<String>,
    pub timer: TimerRecord,
}

impl EventEnvelope {
    pub fn from_record(record: &TransitionRecord) -> Self {
        Self {
            event_id: record.log_index,
            tenant_id: record.tenant_id.clone(),
            timer_id: record.timer_id,
            kind: record.kind,
            instant: record.committed_at,
            reason: record.reason.clone(),
            timer: record.timer.clone(),
        }
    }

    pub fn topic(&self) -> &'static str {
        self.kind.topic()
    }

    pub fn cursor_token(&self) -> String {
        encode_cursor(self.event_id)
    }
}

pub fn encode_cursor(event_id: u64) -> String {
    format!("evt-{event_id:016x}")
}

pub fn decode_cursor(token: &str) -> Option<u64> {
    let hex = token.strip_prefix("evt-")?;
    u64::from_str_radix(hex, 16).ok()
}

/// Fan-out bus for committed transitions. Each subscriber gets a bounded
/// queue; a subscriber that falls behind is disconnected by the channel and
/// must reconnect with its last cursor (at-least-once within retention).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(per_subscriber_capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(per_subscriber_capacity.max(16));
        Self { sender }
    }

    pub fn publish(&self, envelope: EventEnvelope) {
        // No subscribers is fine; the log remains the durable record.
        let _ = self.sender.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_tokens_round_trip() {
        for id in [0u64, 1, 42, u64::MAX] {
            assert_eq!(decode_cursor(&encode_cursor(id)), Some(id));
        }
        assert_eq!(decode_cursor("bogus"), None);
        assert_eq!(decode_cursor("evt-zzzz"), None);
    }
}
