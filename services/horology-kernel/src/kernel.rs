use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::clock::TimeJumpDetector;
use crate::error::KernelError;
use crate::events::{EventBus, EventEnvelope};
use crate::log::{SharedTransitionLog, TransitionDraft, TransitionRecord};
use crate::model::{ActionBundle, TimerRecord, TimerSpec, TimerStatus, TransitionKind};
use crate::projection::SharedProjection;
use crate::replication::LeaderHandle;
use crate::telemetry::jitter::JitterWindow;
use crate::telemetry::scheduling;
use crate::wheel::{TimingWheel, WheelEntry};

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub max_duration_ms: Option<u64>,
    /// Target tick cadence of the wheel loop.
    pub tick_interval: Duration,
    pub jitter_warn_ms: i64,
    /// Wall-vs-monotonic delta that counts as a clock step.
    pub drift_threshold_ms: i64,
    /// How long arming and firing pause after a detected clock step.
    pub drift_pause: Duration,
    pub event_queue_capacity: usize,
    pub idempotency_retention: Duration,
    /// How often followers tail the log into their passive projection.
    pub follower_tail_interval: Duration,
    /// Snapshot + compaction cadence on the leader.
    pub compaction_interval: Duration,
    /// Committed entries kept below the snapshot for cursor resume; older
    /// subscribers reconcile from the timer rows.
    pub log_retained_entries: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_duration_ms: Some(1000 * 60 * 60 * 24 * 30), // 30 days
            tick_interval: Duration::from_millis(10),
            jitter_warn_ms: 500,
            drift_threshold_ms: 1_000,
            drift_pause: Duration::from_secs(2),
            event_queue_capacity: 1024,
            idempotency_retention: Duration::from_secs(60 * 60 * 24),
            follower_tail_interval: Duration::from_millis(250),
            compaction_interval: Duration::from_secs(60 * 60),
            log_retained_entries: 500_000,
        }
    }
}

/// Injected infrastructure. Binaries build this from env; tests inject
/// in-memory implementations.
pub struct KernelRuntimeOptions {
    pub log: SharedTransitionLog,
    pub projection: SharedProjection,
    pub leader: LeaderHandle,
}

#[derive(Clone, Debug)]
pub struct ClockDriftAlert {
    pub reason: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct ListQuery {
    pub statuses: Vec<TimerStatus>,
    pub page_size: usize,
    pub cursor: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct ListPage {
    pub timers: Vec<TimerRecord>,
    pub next_cursor: Option<u64>,
}

enum WheelOp {
    Arm(WheelEntry),
    Disarm(Uuid),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ApplyMode {
    Recovery,
    LiveTail,
}

struct IdempotencyEntry {
    timer_id: Uuid,
    recorded_at: Instant,
}

struct KernelInner {
    config: SchedulerConfig,
    log: SharedTransitionLog,
    projection: SharedProjection,
    leader: LeaderHandle,
    timers: RwLock<HashMap<Uuid, TimerRecord>>,
    idempotency: RwLock<HashMap<(String, String), IdempotencyEntry>>,
    /// Serializes transition commits so exactly one of two racing commands
    /// (cancel vs fire) reaches the log first and the other observes it.
    commit_gate: Mutex<()>,
    wheel_ops: mpsc::UnboundedSender<WheelOp>,
    events: EventBus,
    jitter: JitterWindow,
    health: watch::Sender<Option<ClockDriftAlert>>,
    applied_index: AtomicU64,
}

/// The scheduling engine. One logical wheel owner per process; leadership
/// decides whether this instance may commit transitions.
#[derive(Clone)]
pub struct HorologyKernel {
    inner: Arc<KernelInner>,
}

impl HorologyKernel {
    /// Single-node kernel with in-memory log and projection. First-class for
    /// dev deployments; also what the test suites run against.
    pub fn in_memory(config: SchedulerConfig) -> Self {
        let leader = LeaderHandle::resident_leader();
        let options = KernelRuntimeOptions {
            log: Arc::new(crate::log::MemoryTransitionLog::new(leader.clone())),
            projection: Arc::new(crate::projection::MemoryProjection::new()),
            leader,
        };
        // In-memory wiring cannot fail: recovery reads an empty log.
        Self::bootstrap(config, options)
    }

    pub async fn start(config: SchedulerConfig, options: KernelRuntimeOptions) -> AnyResult<Self> {
        let kernel = Self::bootstrap(config, options);
        kernel.recover().await?;
        Ok(kernel)
    }

    fn bootstrap(config: SchedulerConfig, options: KernelRuntimeOptions) -> Self {
        let (wheel_ops, ops_rx) = mpsc::unbounded_channel();
        let (health, _) = watch::channel(None);
        let jitter = JitterWindow::with_warn_threshold(config.jitter_warn_ms);
        let events = EventBus::new(config.event_queue_capacity);

        let kernel = Self {
            inner: Arc::new(KernelInner {
                config,
                log: options.log,
                projection: options.projection,
                leader: options.leader,
                timers: RwLock::new(HashMap::new()),
                idempotency: RwLock::new(HashMap::new()),
                commit_gate: Mutex::new(()),
                wheel_ops,
                events,
                jitter,
                health,
                applied_index: AtomicU64::new(0),
            }),
        };

        tokio::spawn(
            run_tick_loop(kernel.clone(), ops_rx)
                .instrument(tracing::info_span!("kernel_tick_loop")),
        );
        tokio::spawn(run_follower_tail(kernel.clone()));
        tokio::spawn(run_compaction(kernel.clone()));
        kernel
    }

    /// Rebuild the projection from the store snapshot plus the log tail, then
    /// re-arm everything pending. Timers whose fire instant passed while we
    /// were down become due on the next tick.
    async fn recover(&self) -> AnyResult<()> {
        let snapshot = self.inner.projection.load_active().await?;
        {
            let mut timers = self.inner.timers.write().await;
            for timer in snapshot {
                timers.insert(timer.id, timer);
            }
        }

        let mut stream = self.inner.log.read_from(1).await?;
        let mut last_applied = 0u64;
        while let Some(record) = stream.next().await {
            let record = record?;
            last_applied = record.log_index;
            self.apply_observed(record, ApplyMode::Recovery).await;
        }
        self.inner
            .applied_index
            .store(last_applied, Ordering::SeqCst);
        self.inner.log.mark_snapshot(last_applied).await?;

        let pending: Vec<TimerRecord> = {
            let timers = self.inner.timers.read().await;
            timers
                .values()
                .filter(|timer| !timer.is_terminal())
                .cloned()
                .collect()
        };
        let rearmed = pending.len();
        for timer in pending {
            self.send_wheel_op(WheelOp::Arm(wheel_entry(&timer)));
        }
        if rearmed > 0 {
            info!(rearmed, last_applied, "kernel recovery complete");
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.inner.events.subscribe()
    }

    pub fn health(&self) -> watch::Receiver<Option<ClockDriftAlert>> {
        self.inner.health.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.leader.is_leader()
    }

    pub async fn p99_jitter_ms(&self) -> i64 {
        self.inner.jitter.p99_ms().await
    }

    /// Replay committed events from `from_index` for cursor resume. Events
    /// compacted away require the caller to reconcile from the timer rows.
    pub async fn replay_events(&self, from_index: u64) -> Result<Vec<EventEnvelope>, KernelError> {
        let mut stream = self.inner.log.read_from(from_index).await?;
        let mut out = Vec::new();
        while let Some(record) = stream.next().await {
            let record = record?;
            out.push(EventEnvelope::from_record(&record));
        }
        Ok(out)
    }

    pub async fn schedule(&self, spec: TimerSpec) -> Result<TimerRecord, KernelError> {
        if !self.inner.leader.is_leader() {
            return Err(KernelError::NotLeader { retry_after_ms: 250 });
        }
        if spec.tenant_id.trim().is_empty() {
            return Err(KernelError::InvalidInput {
                field: "tenant_id",
                reason: "must not be empty".into(),
            });
        }
        if spec.requested_by.trim().is_empty() {
            return Err(KernelError::InvalidInput {
                field: "requested_by",
                reason: "must not be empty".into(),
            });
        }

        let now = Utc::now();
        let fire_at = match (spec.fire_at, spec.duration_ms) {
            (Some(at), _) => at,
            (None, Some(duration_ms)) => {
                now + chrono::Duration::milliseconds(duration_ms as i64)
            }
            (None, None) => {
                return Err(KernelError::InvalidInput {
                    field: "schedule_time",
                    reason: "either duration_ms or fire_time must be provided".into(),
                })
            }
        };
        if fire_at < now + chrono::Duration::milliseconds(1) {
            return Err(KernelError::PastFireInstant);
        }
        let duration_ms = (fire_at - now).num_milliseconds().max(1) as u64;
        if let Some(max) = self.inner.config.max_duration_ms {
            if duration_ms > max {
                return Err(KernelError::InvalidInput {
                    field: "schedule_time",
                    reason: format!("duration {duration_ms}ms exceeds the {max}ms maximum"),
                });
            }
        }

        let _gate = self.inner.commit_gate.lock().await;

        if let Some(key) = spec.idempotency_key.as_deref() {
            if let Some(existing) = self.lookup_idempotent(&spec.tenant_id, key).await {
                return Ok(existing);
            }
        }

        let timer_id = spec.id.unwrap_or_else(Uuid::new_v4);
        {
            let timers = self.inner.timers.read().await;
            if timers.contains_key(&timer_id) {
                return Err(KernelError::DuplicateTimer);
            }
        }

        // Bundle admission. A rejected bundle does not abort the schedule:
        // the row still commits, then immediately fails, so the rejection is
        // auditable and observable on the event stream.
        let (action_bundle, admission_rejection) = match spec.action_bundle {
            None => (None, None),
            Some(raw) => match admit_action_bundle(raw) {
                Ok(bundle) => (Some(bundle), None),
                Err(reason) => (None, Some(reason)),
            },
        };

        let mut timer = TimerRecord {
            id: timer_id,
            tenant_id: spec.tenant_id.clone(),
            requested_by: spec.requested_by.clone(),
            name: spec
                .name
                .unwrap_or_else(|| format!("timer-{}", now.timestamp_millis())),
            duration_ms,
            created_at: now,
            fire_at,
            status: TimerStatus::Scheduled,
            metadata: spec.metadata,
            labels: spec.labels,
            action_bundle,
            agent_binding: spec.agent_binding,
            fired_at: None,
            cancelled_at: None,
            settled_at: None,
            cancel_reason: None,
            cancelled_by: None,
            failure_reason: None,
            idempotency_key: spec.idempotency_key.clone(),
            created_index: 0,
            last_index: 0,
            observed_jitter_ms: None,
        };

        let record = self
            .append_and_apply(TransitionKind::Scheduled, timer.clone(), None)
            .await?;
        timer.created_index = record.log_index;
        timer.last_index = record.log_index;
        if let Some(key) = spec.idempotency_key {
            self.remember_idempotent(&timer.tenant_id, key, timer_id)
                .await;
        }

        if let Some(reason) = admission_rejection {
            timer.status = TimerStatus::Failed;
            timer.failure_reason = Some(reason.clone());
            let failed = self
                .append_and_apply(TransitionKind::Failed, timer.clone(), Some(reason))
                .await?;
            timer.last_index = failed.log_index;
            return Ok(timer);
        }

        // Place into the wheel and surface the promotion in the event stream.
        timer.status = TimerStatus::Armed;
        let armed = self
            .append_and_apply(TransitionKind::Armed, timer.clone(), None)
            .await?;
        timer.last_index = armed.log_index;
        self.send_wheel_op(WheelOp::Arm(wheel_entry(&timer)));

        Ok(timer)
    }

    pub async fn cancel(
        &self,
        tenant_id: &str,
        timer_id: Uuid,
        reason: Option<String>,
        cancelled_by: Option<String>,
    ) -> Result<Option<TimerRecord>, KernelError> {
        if !self.inner.leader.is_leader() {
            return Err(KernelError::NotLeader { retry_after_ms: 250 });
        }

        let _gate = self.inner.commit_gate.lock().await;
        let current = {
            let timers = self.inner.timers.read().await;
            timers
                .get(&timer_id)
                .filter(|timer| timer.tenant_id == tenant_id)
                .cloned()
        };
        let Some(mut timer) = current else {
            return Ok(None);
        };
        if timer.is_terminal() {
            // Lost the race (or the timer was already settled); report the
            // winner's terminal state unchanged.
            return Ok(Some(timer));
        }

        timer.status = TimerStatus::Cancelled;
        timer.cancelled_at = Some(Utc::now());
        timer.cancel_reason = reason.clone();
        timer.cancelled_by = cancelled_by;
        let record = self
            .append_and_apply(TransitionKind::Cancelled, timer.clone(), reason)
            .await?;
        timer.last_index = record.log_index;
        self.send_wheel_op(WheelOp::Disarm(timer_id));
        Ok(Some(timer))
    }

    pub async fn get(&self, tenant_id: &str, timer_id: Uuid) -> Option<TimerRecord> {
        let timers = self.inner.timers.read().await;
        timers
            .get(&timer_id)
            .filter(|timer| timer.tenant_id == tenant_id)
            .cloned()
    }

    pub async fn list(&self, tenant_id: &str, query: ListQuery) -> ListPage {
        let page_size = if query.page_size == 0 {
            100
        } else {
            query.page_size.min(1000)
        };
        let timers = self.inner.timers.read().await;
        let mut matching: Vec<TimerRecord> = timers
            .values()
            .filter(|timer| timer.tenant_id == tenant_id)
            .filter(|timer| query.statuses.is_empty() || query.statuses.contains(&timer.status))
            .filter(|timer| query.cursor.map_or(true, |c| timer.created_index > c))
            .cloned()
            .collect();
        drop(timers);

        matching.sort_by_key(|timer| timer.created_index);
        let next_cursor = if matching.len() > page_size {
            matching.truncate(page_size);
            matching.last().map(|timer| timer.created_index)
        } else {
            None
        };
        ListPage {
            timers: matching,
            next_cursor,
        }
    }

    /// Non-terminal count; the gateway's burst quota reads this.
    pub async fn active_count(&self, tenant_id: &str) -> usize {
        let timers = self.inner.timers.read().await;
        timers
            .values()
            .filter(|timer| timer.tenant_id == tenant_id && !timer.is_terminal())
            .count()
    }

    /// Terminal action outcome reported by the orchestrator. The timer stays
    /// `fired`; the outcome lands on the row as a `settled` transition.
    pub async fn settle(
        &self,
        tenant_id: &str,
        timer_id: Uuid,
        success: bool,
        attempts: u32,
        last_error: Option<String>,
    ) -> Result<Option<TimerRecord>, KernelError> {
        if !self.inner.leader.is_leader() {
            return Err(KernelError::NotLeader { retry_after_ms: 250 });
        }

        let _gate = self.inner.commit_gate.lock().await;
        let current = {
            let timers = self.inner.timers.read().await;
            timers
                .get(&timer_id)
                .filter(|timer| timer.tenant_id == tenant_id)
                .cloned()
        };
        let Some(mut timer) = current else {
            return Ok(None);
        };
        if timer.status != TimerStatus::Fired {
            return Ok(Some(timer));
        }
        // One settle per timer, except that a failure may still land on a
        // row a sibling action already settled successfully.
        if timer.settled_at.is_some() && (success || timer.failure_reason.is_some()) {
            return Ok(Some(timer));
        }

        timer.settled_at = Some(Utc::now());
        if !success {
            let detail = last_error.unwrap_or_else(|| "action failed".into());
            timer.failure_reason = Some(format!("action_failed after {attempts} attempts: {detail}"));
        }
        let reason = timer.failure_reason.clone();
        let record = self
            .append_and_apply(TransitionKind::Settled, timer.clone(), reason)
            .await?;
        timer.last_index = record.log_index;
        Ok(Some(timer))
    }

    /// Fire one due wheel entry. Returns the entry when the commit could not
    /// reach the log so the tick loop can retry it later.
    async fn fire_due(&self, entry: WheelEntry) -> Option<WheelEntry> {
        let _gate = self.inner.commit_gate.lock().await;
        let current = {
            let timers = self.inner.timers.read().await;
            timers.get(&entry.timer_id).cloned()
        };
        let Some(mut timer) = current else {
            return None;
        };
        if timer.is_terminal() {
            return None;
        }

        let now = Utc::now();
        let jitter_ms = (now - timer.fire_at).num_milliseconds();
        timer.status = TimerStatus::Fired;
        timer.fired_at = Some(now);
        timer.observed_jitter_ms = Some(jitter_ms);

        match self
            .append_and_apply(TransitionKind::Fired, timer.clone(), None)
            .await
        {
            Ok(_) => {
                self.inner
                    .jitter
                    .record(timer.fire_at, now, timer.id, &timer.tenant_id)
                    .await;
                scheduling::record_fire_jitter(&timer.tenant_id, jitter_ms);
                None
            }
            Err(error) => {
                warn!(?error, timer_id = %entry.timer_id, "failed to commit fire; will retry");
                Some(entry)
            }
        }
    }

    /// Append one transition and apply it locally: map, projection, events,
    /// metrics. Callers hold the commit gate.
    async fn append_and_apply(
        &self,
        kind: TransitionKind,
        mut timer: TimerRecord,
        reason: Option<String>,
    ) -> Result<TransitionRecord, KernelError> {
        let record = self
            .inner
            .log
            .append(TransitionDraft {
                tenant_id: timer.tenant_id.clone(),
                timer_id: timer.id,
                kind,
                timer: timer.clone(),
                reason,
            })
            .await?;

        timer.last_index = record.log_index;
        if kind == TransitionKind::Scheduled {
            timer.created_index = record.log_index;
        }
        {
            let mut timers = self.inner.timers.write().await;
            timers.insert(timer.id, timer.clone());
        }
        if let Err(error) = self.inner.projection.upsert(&timer).await {
            // The log already has the commit; the projection catches up on
            // the next write or recovery.
            warn!(?error, timer_id = %timer.id, "failed to persist timer projection");
        }
        self.inner
            .applied_index
            .fetch_max(record.log_index, Ordering::SeqCst);
        scheduling::record_transition(kind.as_str(), &timer.tenant_id);

        let mut enriched = record.clone();
        enriched.timer = timer;
        self.inner
            .events
            .publish(EventEnvelope::from_record(&enriched));
        Ok(record)
    }

    /// Apply a record observed from the log (follower tailing / recovery).
    /// Recovery rebuilds the map only; the caller re-arms from the final
    /// state. Live tailing also keeps the passive wheel and subscribers fed.
    async fn apply_observed(&self, record: TransitionRecord, mode: ApplyMode) {
        {
            let mut timers = self.inner.timers.write().await;
            let mut timer = record.timer.clone();
            timer.last_index = record.log_index;
            if record.kind == TransitionKind::Scheduled && timer.created_index == 0 {
                timer.created_index = record.log_index;
            }
            timers.insert(timer.id, timer);
        }
        if let Some(key) = record.timer.idempotency_key.clone() {
            self.remember_idempotent(&record.tenant_id, key, record.timer_id)
                .await;
        }
        self.inner
            .applied_index
            .fetch_max(record.log_index, Ordering::SeqCst);

        if mode == ApplyMode::LiveTail {
            match record.kind {
                TransitionKind::Armed => {
                    self.send_wheel_op(WheelOp::Arm(wheel_entry(&record.timer)));
                }
                TransitionKind::Fired | TransitionKind::Cancelled | TransitionKind::Failed => {
                    self.send_wheel_op(WheelOp::Disarm(record.timer_id));
                }
                TransitionKind::Scheduled | TransitionKind::Settled => {}
            }
            self.inner
                .events
                .publish(EventEnvelope::from_record(&record));
        }
    }

    async fn lookup_idempotent(&self, tenant_id: &str, key: &str) -> Option<TimerRecord> {
        let retention = self.inner.config.idempotency_retention;
        let timer_id = {
            let mut entries = self.inner.idempotency.write().await;
            entries.retain(|_, entry| entry.recorded_at.elapsed() < retention);
            entries
                .get(&(tenant_id.to_string(), key.to_string()))
                .map(|entry| entry.timer_id)
        }?;
        let timers = self.inner.timers.read().await;
        timers
            .get(&timer_id)
            .filter(|timer| timer.tenant_id == tenant_id)
            .cloned()
    }

    async fn remember_idempotent(&self, tenant_id: &str, key: String, timer_id: Uuid) {
        let mut entries = self.inner.idempotency.write().await;
        entries.insert(
            (tenant_id.to_string(), key),
            IdempotencyEntry {
                timer_id,
                recorded_at: Instant::now(),
            },
        );
    }

    fn send_wheel_op(&self, op: WheelOp) {
        if self.inner.wheel_ops.send(op).is_err() {
            warn!("wheel loop is gone; dropping wheel operation");
        }
    }

    fn raise_clock_drift(&self, reason: &'static str, detail: String) {
        scheduling::record_clock_drift(reason);
        warn!(reason, %detail, "ClockDrift health signal raised");
        let _ = self.inner.health.send(Some(ClockDriftAlert {
            reason: reason.to_string(),
            detail,
            at: Utc::now(),
        }));
    }

    fn applied_index(&self) -> u64 {
        self.inner.applied_index.load(Ordering::SeqCst)
    }
}

fn admit_action_bundle(raw: serde_json::Value) -> Result<ActionBundle, String> {
    let bundle: ActionBundle = serde_json::from_value(raw)
        .map_err(|err| format!("action bundle rejected at admission: {err}"))?;
    if bundle.actions.is_empty() {
        return Err("action bundle rejected at admission: bundle has no actions".to_string());
    }
    Ok(bundle)
}

fn wheel_entry(timer: &TimerRecord) -> WheelEntry {
    WheelEntry {
        fire_at_ms: timer.fire_at.timestamp_millis(),
        log_index: timer.created_index,
        timer_id: timer.id,
    }
}

/// Single owner of the timing wheel. Suspends only at the tick boundary and
/// on the ops channel; log waits happen inside `fire_due` with the commit
/// gate held.
async fn run_tick_loop(kernel: HorologyKernel, mut ops: mpsc::UnboundedReceiver<WheelOp>) {
    let mut wheel = TimingWheel::new(Utc::now().timestamp_millis());
    let mut detector = TimeJumpDetector::new(kernel.inner.config.drift_threshold_ms);
    let mut interval = tokio::time::interval(kernel.inner.config.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut paused_until: Option<Instant> = None;

    loop {
        tokio::select! {
            op = ops.recv() => {
                match op {
                    Some(WheelOp::Arm(entry)) => wheel.insert(entry),
                    Some(WheelOp::Disarm(timer_id)) => wheel.remove(timer_id),
                    None => break,
                }
            }
            _ = interval.tick() => {
                if let Some(anomaly_ms) = detector.observe() {
                    paused_until = Some(Instant::now() + kernel.inner.config.drift_pause);
                    kernel.raise_clock_drift(
                        "time_jump",
                        format!("wall clock stepped {anomaly_ms}ms against the monotonic clock"),
                    );
                }
                if kernel.inner.jitter.observe_tick().await {
                    kernel.raise_clock_drift("jitter_p99", "p99 jitter above warn threshold".into());
                }
                if let Some(until) = paused_until {
                    if Instant::now() < until {
                        continue;
                    }
                    paused_until = None;
                }
                if !kernel.inner.leader.is_leader() {
                    // Followers keep the wheel warm but never advance it.
                    continue;
                }

                let now_ms = Utc::now().timestamp_millis();
                for entry in wheel.advance(now_ms) {
                    if let Some(retry) = kernel.fire_due(entry).await {
                        wheel.insert(retry);
                    }
                }
            }
        }
    }
}

/// Followers tail the log into their passive projection so a new leader can
/// resume firing within the takeover window.
async fn run_follower_tail(kernel: HorologyKernel) {
    let mut interval = tokio::time::interval(kernel.inner.config.follower_tail_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if kernel.inner.leader.is_leader() {
            continue;
        }
        let from = kernel.applied_index() + 1;
        let mut stream = match kernel.inner.log.read_from(from).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(?error, "follower failed to read log tail");
                continue;
            }
        };
        while let Some(next) = stream.next().await {
            match next {
                Ok(record) => kernel.apply_observed(record, ApplyMode::LiveTail).await,
                Err(error) => {
                    warn!(?error, "follower failed to apply log record");
                    break;
                }
            }
        }
    }
}

/// Periodic snapshot + compaction so crash replay stays O(active timers +
/// recent log) instead of O(all history).
async fn run_compaction(kernel: HorologyKernel) {
    let mut interval = tokio::time::interval(kernel.inner.config.compaction_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so a fresh kernel does not
    // compact before serving anything.
    interval.tick().await;
    loop {
        interval.tick().await;
        if !kernel.inner.leader.is_leader() {
            continue;
        }
        let applied = kernel.applied_index();
        if let Err(error) = kernel.inner.log.mark_snapshot(applied).await {
            warn!(?error, "failed to record log snapshot");
            continue;
        }
        let cutoff = applied.saturating_sub(kernel.inner.config.log_retained_entries);
        if cutoff == 0 {
            continue;
        }
        match kernel.inner.log.truncate_before(cutoff).await {
            Ok(dropped) if dropped > 0 => {
                info!(dropped, cutoff, "compacted transition log");
            }
            Ok(_) => {}
            Err(error) => warn!(?error, "log compaction failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn spec(tenant: &str, duration_ms: u64) -> TimerSpec {
        TimerSpec {
            id: None,
            tenant_id: tenant.into(),
            requested_by: "agent-1".into(),
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

    #[tokio::test]
    async fn schedule_and_fire_emits_scheduled_armed_fired() {
        let kernel = HorologyKernel::in_memory(SchedulerConfig::default());
        let mut events = kernel.subscribe();

        let timer = kernel.schedule(spec("tenant-a", 60)).await.expect("schedule");
        assert_eq!(timer.status, TimerStatus::Armed);
        assert!(timer.created_index > 0);

        let scheduled = events.recv().await.expect("scheduled event");
        assert_eq!(scheduled.kind, TransitionKind::Scheduled);
        let armed = events.recv().await.expect("armed event");
        assert_eq!(armed.kind, TransitionKind::Armed);

        let fired = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("fired event timeout")
            .expect("fired event");
        assert_eq!(fired.kind, TransitionKind::Fired);
        assert_eq!(fired.timer_id, timer.id);
        assert!(fired.timer.fired_at.is_some());
        assert!(fired.event_id > armed.event_id);

        // No premature fire: the recorded instant is at or after fire_at.
        assert!(fired.timer.fired_at.expect("fired_at") >= timer.fire_at);
    }

    #[tokio::test]
    async fn cancel_prevents_fire_and_is_terminal() {
        let kernel = HorologyKernel::in_memory(SchedulerConfig::default());
        let mut events = kernel.subscribe();

        let timer = kernel.schedule(spec("tenant-a", 5_000)).await.expect("schedule");
        let cancelled = kernel
            .cancel(
                "tenant-a",
                timer.id,
                Some("user-changed-mind".into()),
                Some("agent-1".into()),
            )
            .await
            .expect("cancel call")
            .expect("timer found");
        assert_eq!(cancelled.status, TimerStatus::Cancelled);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("user-changed-mind"));

        // Cancelling again returns the terminal state unchanged.
        let again = kernel
            .cancel("tenant-a", timer.id, Some("noop".into()), None)
            .await
            .expect("cancel call")
            .expect("timer found");
        assert_eq!(again.cancel_reason.as_deref(), Some("user-changed-mind"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        while let Ok(event) = events.try_recv() {
            assert_ne!(event.kind, TransitionKind::Fired, "cancelled timer fired");
        }
    }

    #[tokio::test]
    async fn cross_tenant_access_is_invisible() {
        let kernel = HorologyKernel::in_memory(SchedulerConfig::default());
        let timer = kernel.schedule(spec("acme", 5_000)).await.expect("schedule");

        assert!(kernel.get("beta", timer.id).await.is_none());
        let cancel = kernel
            .cancel("beta", timer.id, None, None)
            .await
            .expect("cancel call");
        assert!(cancel.is_none());
        let page = kernel.list("beta", ListQuery::default()).await;
        assert!(page.timers.is_empty());

        // The timer is unaffected.
        let still = kernel.get("acme", timer.id).await.expect("still present");
        assert!(!still.is_terminal());
    }

    #[tokio::test]
    async fn idempotency_key_returns_same_timer_without_new_log_entries() {
        let kernel = HorologyKernel::in_memory(SchedulerConfig::default());
        let mut spec_a = spec("tenant-a", 5_000);
        spec_a.idempotency_key = Some("retry-7".into());

        let first = kernel.schedule(spec_a.clone()).await.expect("first schedule");
        let before = kernel.inner.log.last_index().await.expect("last index");
        let second = kernel.schedule(spec_a).await.expect("second schedule");
        let after = kernel.inner.log.last_index().await.expect("last index");

        assert_eq!(first.id, second.id);
        assert_eq!(before, after, "duplicate schedule committed log entries");
    }

    #[tokio::test]
    async fn list_paginates_by_created_index() {
        let kernel = HorologyKernel::in_memory(SchedulerConfig::default());
        for _ in 0..5 {
            kernel.schedule(spec("tenant-a", 60_000)).await.expect("schedule");
        }

        let first = kernel
            .list(
                "tenant-a",
                ListQuery {
                    page_size: 2,
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(first.timers.len(), 2);
        let cursor = first.next_cursor.expect("more pages");

        let second = kernel
            .list(
                "tenant-a",
                ListQuery {
                    page_size: 10,
                    cursor: Some(cursor),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(second.timers.len(), 3);
        assert!(second.next_cursor.is_none());
        assert!(second.timers[0].created_index > cursor);
    }

    #[tokio::test]
    async fn follower_rejects_mutations() {
        let leader = LeaderHandle::new();
        let options = KernelRuntimeOptions {
            log: Arc::new(crate::log::MemoryTransitionLog::new(leader.clone())),
            projection: Arc::new(crate::projection::MemoryProjection::new()),
            leader,
        };
        let kernel = HorologyKernel::start(SchedulerConfig::default(), options)
            .await
            .expect("start");

        let result = kernel.schedule(spec("tenant-a", 1_000)).await;
        assert!(matches!(result, Err(KernelError::NotLeader { .. })));
        let result = kernel.cancel("tenant-a", Uuid::new_v4(), None, None).await;
        assert!(matches!(result, Err(KernelError::NotLeader { .. })));
    }

    #[tokio::test]
    async fn settle_records_outcome_without_changing_status() {
        let kernel = HorologyKernel::in_memory(SchedulerConfig::default());
        let timer = kernel.schedule(spec("tenant-a", 40)).await.expect("schedule");

        // Wait for the fire.
        let mut events = kernel.subscribe();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("event timeout")
                .expect("event");
            if event.kind == TransitionKind::Fired {
                break;
            }
        }

        let settled = kernel
            .settle("tenant-a", timer.id, false, 3, Some("503 from downstream".into()))
            .await
            .expect("settle call")
            .expect("timer found");
        assert_eq!(settled.status, TimerStatus::Fired);
        assert!(settled.settled_at.is_some());
        let reason = settled.failure_reason.expect("failure reason");
        assert!(reason.contains("3 attempts"));
        assert!(reason.contains("503"));
    }

    #[tokio::test]
    async fn rejected_action_bundles_fail_at_admission() {
        let kernel = HorologyKernel::in_memory(SchedulerConfig::default());
        let mut events = kernel.subscribe();

        let mut bad = spec("tenant-a", 40);
        bad.action_bundle = Some(serde_json::json!({"actions": "not-a-list"}));
        let timer = kernel.schedule(bad).await.expect("schedule");
        assert_eq!(timer.status, TimerStatus::Failed);
        let reason = timer.failure_reason.expect("rejection reason");
        assert!(reason.contains("admission"), "unexpected reason: {reason}");

        let scheduled = events.recv().await.expect("scheduled event");
        assert_eq!(scheduled.kind, TransitionKind::Scheduled);
        let failed = events.recv().await.expect("failed event");
        assert_eq!(failed.kind, TransitionKind::Failed);
        assert_eq!(failed.timer_id, timer.id);
        assert_eq!(failed.timer.status, TimerStatus::Failed);
        assert!(failed.event_id > scheduled.event_id);

        // Terminal: the row persists, nothing is armed, nothing fires.
        let row = kernel.get("tenant-a", timer.id).await.expect("row persists");
        assert!(row.is_terminal());
        assert_eq!(kernel.active_count("tenant-a").await, 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        while let Ok(event) = events.try_recv() {
            assert_ne!(event.kind, TransitionKind::Fired, "failed timer fired");
        }

        // An empty bundle is rejected the same way.
        let mut empty = spec("tenant-a", 5_000);
        empty.action_bundle = Some(serde_json::json!({"actions": []}));
        let timer = kernel.schedule(empty).await.expect("schedule");
        assert_eq!(timer.status, TimerStatus::Failed);
    }

    #[tokio::test]
    async fn past_fire_instants_are_rejected() {
        let kernel = HorologyKernel::in_memory(SchedulerConfig::default());
        let mut bad = spec("tenant-a", 0);
        bad.duration_ms = None;
        bad.fire_at = Some(Utc::now() - chrono::Duration::seconds(5));
        assert!(matches!(
            kernel.schedule(bad).await,
            Err(KernelError::PastFireInstant)
        ));
    }
}
