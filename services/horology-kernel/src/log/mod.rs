use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{TimerRecord, TransitionKind};

pub mod memory;
pub mod postgres;

pub use memory::MemoryTransitionLog;
pub use postgres::PostgresTransitionLog;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("this node is not the elected leader")]
    NotLeader { leader_hint: Option<String> },
    #[error("log quorum unavailable: {0}")]
    Unavailable(String),
    #[error("log record {index} failed checksum verification")]
    Corrupt { index: u64 },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// A transition waiting to be committed. The log assigns the index.
#[derive(Clone, Debug)]
pub struct TransitionDraft {
    pub tenant_id: String,
    pub timer_id: Uuid,
    pub kind: TransitionKind,
    /// Timer snapshot after the transition applied.
    pub timer: TimerRecord,
    pub reason: Option<String>,
}

/// A committed transition. `log_index` is strictly monotonic and stable
/// across restarts; it doubles as the event id and the stream cursor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub log_index: u64,
    pub tenant_id: String,
    pub timer_id: Uuid,
    pub kind: TransitionKind,
    pub timer: TimerRecord,
    pub reason: Option<String>,
    pub committed_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct TransitionPayload {
    pub timer: TimerRecord,
    pub reason: Option<String>,
}

pub type TransitionStream = Pin<Box<dyn Stream<Item = Result<TransitionRecord, LogError>> + Send>>;

/// Append-only replicated sequence of timer transitions. Single writer (the
/// elected leader), many readers.
#[async_trait]
pub trait TransitionLog: Send + Sync + 'static {
    /// Atomic append; fails with `NotLeader` when the caller has lost
    /// leadership and `Unavailable` when the quorum is unreachable.
    async fn append(&self, draft: TransitionDraft) -> Result<TransitionRecord, LogError>;

    /// Replay committed records with `log_index >= from_index`, in order.
    /// Records that fail checksum verification refuse to replay.
    async fn read_from(&self, from_index: u64) -> Result<TransitionStream, LogError>;

    /// Compaction below the most recent snapshot. Indices at or above the
    /// snapshot are never dropped.
    async fn truncate_before(&self, index: u64) -> Result<u64, LogError>;

    /// Record that a projection snapshot covers everything up to `index`.
    async fn mark_snapshot(&self, index: u64) -> Result<(), LogError>;

    async fn last_index(&self) -> Result<u64, LogError>;
}

pub type SharedTransitionLog = Arc<dyn TransitionLog>;

pub(crate) fn record_checksum(
    tenant_id: &str,
    timer_id: Uuid,
    kind: TransitionKind,
    payload_json: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update(b"|");
    hasher.update(timer_id.as_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(payload_json.as_bytes());
    format!("{:x}", hasher.finalize())
}
