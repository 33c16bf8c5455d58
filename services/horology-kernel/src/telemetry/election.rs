use once_cell::sync::Lazy;
use opentelemetry::{global, metrics::Counter, KeyValue};

static ELECTION_METRICS: Lazy<ElectionMetrics> = Lazy::new(|| {
    let meter = global::meter("horology-kernel.election");
    ElectionMetrics {
        attempts: meter
            .u64_counter("kernel.election.attempts")
            .with_description("Election rounds started by this node")
            .init(),
        outcomes: meter
            .u64_counter("kernel.election.outcomes")
            .with_description("Outcome of election rounds")
            .init(),
        heartbeats: meter
            .u64_counter("kernel.election.heartbeats")
            .with_description("Leader heartbeat publication outcomes")
            .init(),
    }
});

struct ElectionMetrics {
    attempts: Counter<u64>,
    outcomes: Counter<u64>,
    heartbeats: Counter<u64>,
}

#[derive(Clone, Copy)]
pub enum ElectionOutcome {
    Retained,
    PeerHealthy,
    Won,
    Contended,
    Initialized,
    Error,
}

#[derive(Clone, Copy)]
pub enum HeartbeatOutcome {
    Ok,
    Lost,
    Error,
}

pub fn record_attempt(node_id: &str) {
    ELECTION_METRICS
        .attempts
        .add(1, &[KeyValue::new("node_id", node_id.to_string())]);
}

pub fn record_outcome(node_id: &str, outcome: ElectionOutcome) {
    ELECTION_METRICS.outcomes.add(
        1,
        &[
            KeyValue::new("node_id", node_id.to_string()),
            KeyValue::new("outcome", outcome_value(outcome)),
        ],
    );
}

pub fn record_heartbeat(node_id: &str, outcome: HeartbeatOutcome) {
    ELECTION_METRICS.heartbeats.add(
        1,
        &[
            KeyValue::new("node_id", node_id.to_string()),
            KeyValue::new("outcome", heartbeat_value(outcome)),
        ],
    );
}

fn outcome_value(outcome: ElectionOutcome) -> &'static str {
    match outcome {
        ElectionOutcome::Retained => "retained",
        ElectionOutcome::PeerHealthy => "peer_healthy",
        ElectionOutcome::Won => "won",
        ElectionOutcome::Contended => "contended",
        ElectionOutcome::Initialized => "initialized",
        ElectionOutcome::Error => "error",
    }
}

fn heartbeat_value(outcome: HeartbeatOutcome) -> &'static str {
    match outcome {
        HeartbeatOutcome::Ok => "ok",
        HeartbeatOutcome::Lost => "lost",
        HeartbeatOutcome::Error => "error",
    }
}
