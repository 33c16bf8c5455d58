use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    record_checksum, LogError, TransitionDraft, TransitionLog, TransitionPayload, TransitionRecord,
    TransitionStream,
};
use crate::replication::LeaderHandle;

struct StoredRecord {
    record: TransitionRecord,
    checksum: String,
}

/// Single-node log used in memory mode and tests. Quorum-of-one: the leader
/// gate still applies so follower behaviour is exercisable.
#[derive(Clone)]
pub struct MemoryTransitionLog {
    inner: Arc<Inner>,
}

struct Inner {
    leader: LeaderHandle,
    entries: RwLock<VecDeque<StoredRecord>>,
    snapshot_index: AtomicU64,
}

impl MemoryTransitionLog {
    pub fn new(leader: LeaderHandle) -> Self {
        Self {
            inner: Arc::new(Inner {
                leader,
                entries: RwLock::new(VecDeque::new()),
                snapshot_index: AtomicU64::new(0),
            }),
        }
    }
}

#[async_trait]
impl TransitionLog for MemoryTransitionLog {
    async fn append(&self, draft: TransitionDraft) -> Result<TransitionRecord, LogError> {
        if !self.inner.leader.is_leader() {
            return Err(LogError::NotLeader { leader_hint: None });
        }

        let mut entries = self.inner.entries.write().await;
        let log_index = entries.back().map(|e| e.record.log_index).unwrap_or(0) + 1;
        let record = TransitionRecord {
            log_index,
            tenant_id: draft.tenant_id,
            timer_id: draft.timer_id,
            kind: draft.kind,
            timer: draft.timer,
            reason: draft.reason,
            committed_at: Utc::now(),
        };
        let payload = serde_json::to_string(&TransitionPayload {
            timer: record.timer.clone(),
            reason: record.reason.clone(),
        })
        .map_err(|err| LogError::Storage(err.into()))?;
        let checksum = record_checksum(&record.tenant_id, record.timer_id, record.kind, &payload);
        entries.push_back(StoredRecord {
            record: record.clone(),
            checksum,
        });
        Ok(record)
    }

    async fn read_from(&self, from_index: u64) -> Result<TransitionStream, LogError> {
        let entries = self.inner.entries.read().await;
        let mut out = Vec::new();
        for stored in entries.iter().filter(|e| e.record.log_index >= from_index) {
            let payload = serde_json::to_string(&TransitionPayload {
                timer: stored.record.timer.clone(),
                reason: stored.record.reason.clone(),
            })
            .map_err(|err| LogError::Storage(err.into()))?;
            let expected = record_checksum(
                &stored.record.tenant_id,
                stored.record.timer_id,
                stored.record.kind,
                &payload,
            );
            if expected != stored.checksum {
                out.push(Err(LogError::Corrupt {
                    index: stored.record.log_index,
                }));
                break;
            }
            out.push(Ok(stored.record.clone()));
        }
        Ok(Box::pin(tokio_stream::iter(out)))
    }

    async fn truncate_before(&self, index: u64) -> Result<u64, LogError> {
        let snapshot = self.inner.snapshot_index.load(Ordering::SeqCst);
        let bound = index.min(snapshot.saturating_add(1));
        let mut entries = self.inner.entries.write().await;
        let mut dropped = 0;
        while entries
            .front()
            .map(|e| e.record.log_index < bound)
            .unwrap_or(false)
        {
            entries.pop_front();
            dropped += 1;
        }
        Ok(dropped)
    }

    async fn mark_snapshot(&self, index: u64) -> Result<(), LogError> {
        self.inner.snapshot_index.fetch_max(index, Ordering::SeqCst);
        Ok(())
    }

    async fn last_index(&self) -> Result<u64, LogError> {
        let entries = self.inner.entries.read().await;
        Ok(entries.back().map(|e| e.record.log_index).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransitionKind;
    use tokio_stream::StreamExt;

    fn draft(tenant: &str, kind: TransitionKind) -> TransitionDraft {
        let timer = crate::log::tests::sample_timer(tenant);
        TransitionDraft {
            tenant_id: tenant.into(),
            timer_id: timer.id,
            kind,
            timer,
            reason: None,
        }
    }

    #[tokio::test]
    async fn appends_assign_strictly_increasing_indices() {
        let leader = LeaderHandle::resident_leader();
        let log = MemoryTransitionLog::new(leader);

        let first = log
            .append(draft("tenant-a", TransitionKind::Scheduled))
            .await
            .unwrap();
        let second = log
            .append(draft("tenant-a", TransitionKind::Fired))
            .await
            .unwrap();
        assert_eq!(first.log_index, 1);
        assert_eq!(second.log_index, 2);
        assert_eq!(log.last_index().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn follower_appends_are_rejected() {
        let leader = LeaderHandle::resident_leader();
        leader.set_leader(false);
        let log = MemoryTransitionLog::new(leader);

        let result = log.append(draft("tenant-a", TransitionKind::Scheduled)).await;
        assert!(matches!(result, Err(LogError::NotLeader { .. })));
    }

    #[tokio::test]
    async fn truncation_respects_snapshot_boundary() {
        let leader = LeaderHandle::resident_leader();
        let log = MemoryTransitionLog::new(leader);
        for _ in 0..5 {
            log.append(draft("tenant-a", TransitionKind::Scheduled))
                .await
                .unwrap();
        }

        // No snapshot yet: nothing may be dropped.
        assert_eq!(log.truncate_before(4).await.unwrap(), 0);

        log.mark_snapshot(3).await.unwrap();
        assert_eq!(log.truncate_before(4).await.unwrap(), 3);

        let mut stream = log.read_from(0).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.log_index, 4);
    }
}
