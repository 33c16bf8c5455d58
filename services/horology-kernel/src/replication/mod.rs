use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::telemetry::election::{self, ElectionOutcome, HeartbeatOutcome};

pub mod raft;

pub use raft::{ConsensusSettings, ConsensusSupervisor};

/// Shared view of this node's leadership. Only the holder of leadership may
/// append to the transition log or advance timer state.
#[derive(Clone)]
pub struct LeaderHandle {
    inner: Arc<LeaderInner>,
}

struct LeaderInner {
    is_leader: AtomicBool,
    changes: watch::Sender<bool>,
}

impl LeaderHandle {
    /// Starts as follower; an elector flips it.
    pub fn new() -> Self {
        let (changes, _) = watch::channel(false);
        Self {
            inner: Arc::new(LeaderInner {
                is_leader: AtomicBool::new(false),
                changes,
            }),
        }
    }

    /// Permanent leader for memory mode and tests (quorum of one).
    pub fn resident_leader() -> Self {
        let handle = Self::new();
        handle.set_leader(true);
        handle
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader.load(Ordering::SeqCst)
    }

    pub fn set_leader(&self, value: bool) {
        let previous = self.inner.is_leader.swap(value, Ordering::SeqCst);
        if previous != value {
            let _ = self.inner.changes.send(value);
        }
    }

    /// Observe leadership flips, e.g. to rebuild the wheel on promotion.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.inner.changes.subscribe()
    }
}

impl Default for LeaderHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct LeaseSettings {
    pub pool: Pool<Postgres>,
    pub node_id: String,
    pub heartbeat_interval: Duration,
    pub election_timeout: Duration,
}

/// Lease-based elector over the `kernel_raft_state` row. This is the
/// degraded-mode elector: a single leader row refreshed by heartbeats, taken
/// over by any node that observes the heartbeat go stale for longer than the
/// election timeout. The full consensus supervisor supersedes it when a
/// cluster is configured.
pub struct LeaseCoordinator {
    heartbeat: JoinHandle<()>,
    election: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
    leader: LeaderHandle,
}

impl LeaseCoordinator {
    pub async fn start(settings: LeaseSettings) -> Result<(Self, LeaderHandle)> {
        ensure_lease_table(&settings.pool).await?;

        let leader = LeaderHandle::new();
        let (stop_tx, stop_rx) = watch::channel(false);

        let heartbeat = tokio::spawn(run_heartbeat(
            settings.clone(),
            leader.clone(),
            stop_rx.clone(),
        ));
        let election = tokio::spawn(run_elections(settings, leader.clone(), stop_rx));

        let coordinator = Self {
            heartbeat,
            election,
            stop_tx,
            leader: leader.clone(),
        };
        Ok((coordinator, leader))
    }

    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        self.heartbeat.abort();
        self.election.abort();
        self.leader.set_leader(false);
    }
}

async fn run_heartbeat(settings: LeaseSettings, leader: LeaderHandle, stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            break;
        }
        sleep(settings.heartbeat_interval).await;
        if !leader.is_leader() {
            continue;
        }

        match refresh_heartbeat(&settings.pool, &settings.node_id).await {
            Ok(true) => election::record_heartbeat(&settings.node_id, HeartbeatOutcome::Ok),
            Ok(false) => {
                // Row no longer ours: another node took over.
                warn!(node = %settings.node_id, "lease lost; stepping down");
                leader.set_leader(false);
                election::record_heartbeat(&settings.node_id, HeartbeatOutcome::Lost);
            }
            Err(error) => {
                warn!(?error, "failed to refresh leader heartbeat; stepping down");
                leader.set_leader(false);
                election::record_heartbeat(&settings.node_id, HeartbeatOutcome::Error);
            }
        }
    }
}

async fn run_elections(settings: LeaseSettings, leader: LeaderHandle, stop: watch::Receiver<bool>) {
    let mut next_attempt = Instant::now();
    loop {
        if *stop.borrow() {
            break;
        }
        let now = Instant::now();
        if now < next_attempt {
            sleep(next_attempt - now).await;
        }

        election::record_attempt(&settings.node_id);
        match election_round(&settings, &leader).await {
            Ok(outcome) => election::record_outcome(&settings.node_id, outcome),
            Err(error) => {
                warn!(?error, "election round failed");
                election::record_outcome(&settings.node_id, ElectionOutcome::Error);
            }
        }

        next_attempt = Instant::now() + jittered(settings.election_timeout);
    }
}

async fn election_round(settings: &LeaseSettings, leader: &LeaderHandle) -> Result<ElectionOutcome> {
    let row = sqlx::query(
        "SELECT leader_id, term, heartbeat_at FROM kernel_raft_state WHERE id = TRUE",
    )
    .fetch_optional(&settings.pool)
    .await
    .context("failed to fetch current lease row")?;

    let timeout = ChronoDuration::from_std(settings.election_timeout)?;
    let now = Utc::now();

    let Some(row) = row else {
        let inserted = sqlx::query(
            r#"
            INSERT INTO kernel_raft_state (id, leader_id, term, heartbeat_at)
            VALUES (TRUE, $1, 1, NOW())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&settings.node_id)
        .execute(&settings.pool)
        .await
        .context("failed to insert initial lease row")?;

        if inserted.rows_affected() > 0 {
            leader.set_leader(true);
            info!(node = %settings.node_id, term = 1, "initialized lease as leader");
            return Ok(ElectionOutcome::Initialized);
        }
        return Ok(ElectionOutcome::Contended);
    };

    let leader_id: String = row.get("leader_id");
    let term: i64 = row.get("term");
    let heartbeat_at: DateTime<Utc> = row.get("heartbeat_at");
    let stale = now - heartbeat_at > timeout;

    if leader_id == settings.node_id {
        if stale {
            debug!(node = %settings.node_id, "own heartbeat stale; refreshing lease");
            take_lease(&settings.pool, &settings.node_id, term + 1, true, settings.election_timeout)
                .await?;
        }
        leader.set_leader(true);
        return Ok(ElectionOutcome::Retained);
    }

    if !stale {
        leader.set_leader(false);
        return Ok(ElectionOutcome::PeerHealthy);
    }

    let taken = take_lease(
        &settings.pool,
        &settings.node_id,
        term + 1,
        false,
        settings.election_timeout,
    )
    .await?;
    if taken {
        leader.set_leader(true);
        info!(node = %settings.node_id, term = term + 1, "assumed leadership after stale heartbeat");
        Ok(ElectionOutcome::Won)
    } else {
        leader.set_leader(false);
        Ok(ElectionOutcome::Contended)
    }
}

async fn ensure_lease_table(pool: &Pool<Postgres>) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kernel_raft_state (
            id BOOLEAN PRIMARY KEY DEFAULT TRUE,
            leader_id TEXT NOT NULL,
            term BIGINT NOT NULL,
            heartbeat_at TIMESTAMPTZ NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create kernel_raft_state table")?;
    Ok(())
}

async fn refresh_heartbeat(pool: &Pool<Postgres>, node_id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE kernel_raft_state SET heartbeat_at = NOW() WHERE id = TRUE AND leader_id = $1",
    )
    .bind(node_id)
    .execute(pool)
    .await
    .context("failed to refresh heartbeat")?;
    Ok(result.rows_affected() > 0)
}

async fn take_lease(
    pool: &Pool<Postgres>,
    node_id: &str,
    term: i64,
    allow_current: bool,
    timeout: Duration,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE kernel_raft_state
           SET leader_id = $1,
               term = $2,
               heartbeat_at = NOW()
         WHERE id = TRUE
           AND ($3 OR heartbeat_at < NOW() - $4::INTERVAL)
        "#,
    )
    .bind(node_id)
    .bind(term)
    .bind(allow_current)
    .bind(interval_literal(timeout))
    .execute(pool)
    .await
    .context("failed to update lease row")?;
    Ok(result.rows_affected() > 0)
}

fn jittered(base: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.6..1.2);
    let millis = (base.as_millis() as f64 * factor).max(100.0);
    Duration::from_millis(millis as u64)
}

fn interval_literal(duration: Duration) -> String {
    let millis = duration.as_millis().max(1);
    format!("{millis} milliseconds")
}
