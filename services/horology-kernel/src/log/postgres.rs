use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};

use super::{
    record_checksum, LogError, TransitionDraft, TransitionLog, TransitionPayload, TransitionRecord,
    TransitionStream,
};
use crate::model::TransitionKind;
use crate::replication::LeaderHandle;

/// Transition log backed by the `timer_command_log` table. `log_index` is a
/// BIGSERIAL, so index assignment is atomic with the insert; durability and
/// replication are delegated to the backing store.
#[derive(Clone)]
pub struct PostgresTransitionLog {
    pool: Pool<Postgres>,
    leader: LeaderHandle,
    snapshot_index: Arc<AtomicU64>,
}

impl PostgresTransitionLog {
    pub fn new(pool: Pool<Postgres>, leader: LeaderHandle) -> Self {
        Self {
            pool,
            leader,
            snapshot_index: Arc::new(AtomicU64::new(0)),
        }
    }
}

fn unavailable(err: sqlx::Error) -> LogError {
    LogError::Unavailable(err.to_string())
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<TransitionRecord, LogError> {
    let log_index: i64 = row.try_get("log_index").map_err(unavailable)?;
    let tenant_id: String = row.try_get("tenant_id").map_err(unavailable)?;
    let timer_id: uuid::Uuid = row.try_get("timer_id").map_err(unavailable)?;
    let kind_raw: String = row.try_get("kind").map_err(unavailable)?;
    let payload: serde_json::Value = row.try_get("payload").map_err(unavailable)?;
    let checksum: String = row.try_get("checksum").map_err(unavailable)?;
    let committed_at = row.try_get("committed_at").map_err(unavailable)?;

    let kind = TransitionKind::from_str(&kind_raw).ok_or(LogError::Corrupt {
        index: log_index as u64,
    })?;
    let payload_json = serde_json::to_string(&payload).map_err(|err| LogError::Storage(err.into()))?;
    if record_checksum(&tenant_id, timer_id, kind, &payload_json) != checksum {
        return Err(LogError::Corrupt {
            index: log_index as u64,
        });
    }

    let payload: TransitionPayload =
        serde_json::from_value(payload).map_err(|_| LogError::Corrupt {
            index: log_index as u64,
        })?;

    Ok(TransitionRecord {
        log_index: log_index as u64,
        tenant_id,
        timer_id,
        kind,
        timer: payload.timer,
        reason: payload.reason,
        committed_at,
    })
}

#[async_trait]
impl TransitionLog for PostgresTransitionLog {
    async fn append(&self, draft: TransitionDraft) -> Result<TransitionRecord, LogError> {
        if !self.leader.is_leader() {
            return Err(LogError::NotLeader { leader_hint: None });
        }

        let payload_value = serde_json::to_value(&TransitionPayload {
            timer: draft.timer.clone(),
            reason: draft.reason.clone(),
        })
        .map_err(|err| LogError::Storage(err.into()))?;
        let payload_json =
            serde_json::to_string(&payload_value).map_err(|err| LogError::Storage(err.into()))?;
        let checksum = record_checksum(&draft.tenant_id, draft.timer_id, draft.kind, &payload_json);

        let row = sqlx::query(
            r#"
            INSERT INTO timer_command_log (tenant_id, timer_id, kind, payload, checksum, committed_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING log_index, committed_at
            "#,
        )
        .bind(&draft.tenant_id)
        .bind(draft.timer_id)
        .bind(draft.kind.as_str())
        .bind(&payload_value)
        .bind(&checksum)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;

        let log_index: i64 = row.try_get("log_index").map_err(unavailable)?;
        let committed_at = row.try_get("committed_at").map_err(unavailable)?;

        Ok(TransitionRecord {
            log_index: log_index as u64,
            tenant_id: draft.tenant_id,
            timer_id: draft.timer_id,
            kind: draft.kind,
            timer: draft.timer,
            reason: draft.reason,
            committed_at,
        })
    }

    async fn read_from(&self, from_index: u64) -> Result<TransitionStream, LogError> {
        let rows = sqlx::query(
            r#"
            SELECT log_index, tenant_id, timer_id, kind, payload, checksum, committed_at
              FROM timer_command_log
             WHERE log_index >= $1
             ORDER BY log_index
            "#,
        )
        .bind(from_index as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            match row_to_record(row) {
                Ok(record) => out.push(Ok(record)),
                Err(err) => {
                    out.push(Err(err));
                    break;
                }
            }
        }
        Ok(Box::pin(tokio_stream::iter(out)))
    }

    async fn truncate_before(&self, index: u64) -> Result<u64, LogError> {
        let snapshot = self.snapshot_index.load(Ordering::SeqCst);
        let bound = index.min(snapshot.saturating_add(1));
        let result = sqlx::query("DELETE FROM timer_command_log WHERE log_index < $1")
            .bind(bound as i64)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected())
    }

    async fn mark_snapshot(&self, index: u64) -> Result<(), LogError> {
        self.snapshot_index.fetch_max(index, Ordering::SeqCst);
        Ok(())
    }

    async fn last_index(&self) -> Result<u64, LogError> {
        let row = sqlx::query("SELECT COALESCE(MAX(log_index), 0) AS last FROM timer_command_log")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;
        let last: i64 = row.try_get("last").map_err(unavailable)?;
        Ok(last as u64)
    }
}
