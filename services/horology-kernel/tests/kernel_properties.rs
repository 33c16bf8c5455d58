use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use horology_kernel::{
    HorologyKernel, KernelRuntimeOptions, LeaderHandle, MemoryProjection, MemoryTransitionLog,
    SchedulerConfig, TimerSpec, TimerStatus, TransitionDraft, TransitionKind, TransitionLog,
};
use uuid::Uuid;

fn spec(tenant: &str, duration_ms: u64) -> TimerSpec {
    TimerSpec {
        id: None,
        tenant_id: tenant.into(),
        requested_by: "prop-tests".into(),
        name: None,
        duration_ms: Some(duration_ms),
        fire_at: None,
        metadata: None,
        labels: HashMap::new(),
        action_bundle: None,
        agent_binding: None,
        idempotency_key: None,
    }
}

/// Per-timer transition sequences have strictly increasing log indices and
/// statuses that only move forward along the DAG.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transitions_are_monotonic_per_timer() {
    let kernel = HorologyKernel::in_memory(SchedulerConfig::default());
    let mut events = kernel.subscribe();

    let mut cancel_targets = Vec::new();
    for i in 0..6 {
        let timer = kernel
            .schedule(spec("tenant-a", 40 + i * 10))
            .await
            .expect("schedule");
        if i % 2 == 0 {
            cancel_targets.push(timer.id);
        }
    }
    for id in cancel_targets {
        let _ = kernel.cancel("tenant-a", id, Some("sweep".into()), None).await;
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut per_timer: HashMap<Uuid, Vec<(u64, TimerStatus)>> = HashMap::new();
    while let Ok(event) = events.try_recv() {
        per_timer
            .entry(event.timer_id)
            .or_default()
            .push((event.event_id, event.timer.status));
    }

    assert_eq!(per_timer.len(), 6);
    for (timer_id, transitions) in per_timer {
        let mut terminal_seen = 0;
        for window in transitions.windows(2) {
            let (prev_index, prev_status) = window[0];
            let (next_index, next_status) = window[1];
            assert!(
                next_index > prev_index,
                "timer {timer_id}: log indices not strictly increasing"
            );
            assert!(
                prev_status == next_status || prev_status.can_transition_to(next_status),
                "timer {timer_id}: illegal transition {prev_status:?} -> {next_status:?}"
            );
        }
        for (_, status) in &transitions {
            if status.is_terminal() {
                terminal_seen += 1;
            }
        }
        assert_eq!(terminal_seen, 1, "timer {timer_id}: exactly one terminal event");
    }
}

/// A cancel racing the fire instant: exactly one of the two wins and the
/// loser's response reflects the winner's terminal state.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_and_fire_race_produces_one_winner() {
    let kernel = HorologyKernel::in_memory(SchedulerConfig::default());
    let mut events = kernel.subscribe();

    let mut timers = Vec::new();
    for _ in 0..10 {
        let timer = kernel.schedule(spec("tenant-a", 50)).await.expect("schedule");
        timers.push(timer);
    }

    // Race the cancels right at the fire boundary.
    tokio::time::sleep(Duration::from_millis(45)).await;
    let mut cancel_results = Vec::new();
    for timer in &timers {
        let result = kernel
            .cancel("tenant-a", timer.id, Some("race".into()), None)
            .await
            .expect("cancel call")
            .expect("timer visible");
        cancel_results.push(result);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut terminal_events: HashMap<Uuid, Vec<TimerStatus>> = HashMap::new();
    while let Ok(event) = events.try_recv() {
        if event.timer.status.is_terminal() && event.kind != TransitionKind::Settled {
            terminal_events
                .entry(event.timer_id)
                .or_default()
                .push(event.timer.status);
        }
    }

    for timer in &timers {
        let terminals = terminal_events.get(&timer.id).expect("terminal event");
        assert_eq!(
            terminals.len(),
            1,
            "timer {} produced {} terminal transitions",
            timer.id,
            terminals.len()
        );
        let final_state = kernel.get("tenant-a", timer.id).await.expect("timer");
        assert_eq!(final_state.status, terminals[0]);
    }

    // Every cancel response reported a terminal state (its own win, or the
    // fire that beat it).
    for result in cancel_results {
        assert!(result.status.is_terminal());
    }
}

/// Committed `scheduled` entries whose fire instant passed while the kernel
/// was down fire immediately on recovery.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overdue_timers_fire_on_recovery() {
    let leader = LeaderHandle::resident_leader();
    let log = Arc::new(MemoryTransitionLog::new(leader.clone()));

    // Forge the pre-crash history directly in the log: a timer that became
    // due while no kernel was running.
    let now = Utc::now();
    let mut timer = horology_kernel::TimerRecord {
        id: Uuid::new_v4(),
        tenant_id: "tenant-a".into(),
        requested_by: "prop-tests".into(),
        name: "overdue".into(),
        duration_ms: 100,
        created_at: now - chrono::Duration::seconds(5),
        fire_at: now - chrono::Duration::seconds(4),
        status: TimerStatus::Scheduled,
        metadata: None,
        labels: HashMap::new(),
        action_bundle: None,
        agent_binding: None,
        fired_at: None,
        cancelled_at: None,
        settled_at: None,
        cancel_reason: None,
        cancelled_by: None,
        failure_reason: None,
        idempotency_key: None,
        created_index: 0,
        last_index: 0,
        observed_jitter_ms: None,
    };
    let scheduled = log
        .append(TransitionDraft {
            tenant_id: timer.tenant_id.clone(),
            timer_id: timer.id,
            kind: TransitionKind::Scheduled,
            timer: timer.clone(),
            reason: None,
        })
        .await
        .expect("append scheduled");
    timer.created_index = scheduled.log_index;
    timer.status = TimerStatus::Armed;
    log.append(TransitionDraft {
        tenant_id: timer.tenant_id.clone(),
        timer_id: timer.id,
        kind: TransitionKind::Armed,
        timer: timer.clone(),
        reason: None,
    })
    .await
    .expect("append armed");

    let kernel = HorologyKernel::start(
        SchedulerConfig::default(),
        KernelRuntimeOptions {
            log,
            projection: Arc::new(MemoryProjection::new()),
            leader,
        },
    )
    .await
    .expect("recovery");

    let mut events = kernel.subscribe();
    let fired = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event");
            if event.kind == TransitionKind::Fired && event.timer_id == timer.id {
                break event;
            }
        }
    })
    .await
    .expect("overdue timer fired after recovery");

    assert!(fired.timer.fired_at.expect("fired_at") >= timer.fire_at);
    let jitter = fired.timer.observed_jitter_ms.expect("jitter recorded");
    assert!(jitter >= 4_000, "late fire should record the full delay, got {jitter}");
}

/// No timer ever fires before its fire instant, even under a burst of
/// short-duration schedules.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_premature_fires_under_burst() {
    let kernel = HorologyKernel::in_memory(SchedulerConfig::default());
    let mut events = kernel.subscribe();

    let mut expected: HashMap<Uuid, chrono::DateTime<Utc>> = HashMap::new();
    for i in 0..25 {
        let timer = kernel
            .schedule(spec("tenant-a", 30 + (i % 7) * 15))
            .await
            .expect("schedule");
        expected.insert(timer.id, timer.fire_at);
    }

    let mut fired = 0;
    while fired < 25 {
        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("event timeout")
            .expect("event");
        if event.kind != TransitionKind::Fired {
            continue;
        }
        fired += 1;
        let fire_at = expected.get(&event.timer_id).expect("known timer");
        let fired_at = event.timer.fired_at.expect("fired_at");
        assert!(
            fired_at >= *fire_at,
            "timer {} fired {}ms early",
            event.timer_id,
            (*fire_at - fired_at).num_milliseconds()
        );
    }
}
