use once_cell::sync::Lazy;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};

static SCHEDULING_METRICS: Lazy<SchedulingMetrics> = Lazy::new(|| {
    let meter = global::meter("horology-kernel.scheduling");
    SchedulingMetrics {
        transitions: meter
            .u64_counter("kernel.timer.transitions")
            .with_description("Committed timer transitions by kind")
            .init(),
        fire_jitter_ms: meter
            .i64_histogram("kernel.timer.fire_jitter_ms")
            .with_description("Observed fired_at - fire_at per fired timer")
            .init(),
        clock_drift_signals: meter
            .u64_counter("kernel.clock.drift_signals")
            .with_description("ClockDrift health signals raised")
            .init(),
    }
});

struct SchedulingMetrics {
    transitions: Counter<u64>,
    fire_jitter_ms: Histogram<i64>,
    clock_drift_signals: Counter<u64>,
}

pub fn record_transition(kind: &'static str, tenant_id: &str) {
    SCHEDULING_METRICS.transitions.add(
        1,
        &[
            KeyValue::new("kind", kind),
            KeyValue::new("tenant_id", tenant_id.to_string()),
        ],
    );
}

pub fn record_fire_jitter(tenant_id: &str, jitter_ms: i64) {
    SCHEDULING_METRICS
        .fire_jitter_ms
        .record(jitter_ms, &[KeyValue::new("tenant_id", tenant_id.to_string())]);
}

pub fn record_clock_drift(reason: &'static str) {
    SCHEDULING_METRICS
        .clock_drift_signals
        .add(1, &[KeyValue::new("reason", reason)]);
}
