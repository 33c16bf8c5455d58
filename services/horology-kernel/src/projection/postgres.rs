use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, Pool, Postgres, Row};
use tracing::info;

use super::TimerProjection;
use crate::model::{TimerRecord, TimerStatus};

#[derive(Clone)]
pub struct PostgresProjection {
    pool: Pool<Postgres>,
}

impl PostgresProjection {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(
                std::env::var("PGPOOL_MAX")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            )
            .connect(database_url)
            .await
            .with_context(|| "failed to connect to postgres for timer projection")?;
        info!("connected to postgres for timer projection");
        Ok(Self { pool })
    }

    pub fn with_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> Pool<Postgres> {
        self.pool.clone()
    }
}

fn row_to_timer(row: &sqlx::postgres::PgRow) -> Result<TimerRecord> {
    let status: String = row.try_get("status")?;
    let labels_value: Option<serde_json::Value> = row.try_get("labels")?;
    let labels = labels_value
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default();
    let action_bundle: Option<serde_json::Value> = row.try_get("action_bundle")?;
    let agent_binding: Option<serde_json::Value> = row.try_get("agent_binding")?;

    Ok(TimerRecord {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        requested_by: row.try_get("requested_by")?,
        name: row.try_get("name")?,
        duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
        created_at: row.try_get("created_at")?,
        fire_at: row.try_get("fire_at")?,
        status: TimerStatus::from_str(&status)
            .ok_or_else(|| anyhow::anyhow!("unsupported timer status {status}"))?,
        metadata: row.try_get("metadata")?,
        labels,
        action_bundle: action_bundle
            .map(serde_json::from_value)
            .transpose()
            .context("malformed action_bundle column")?,
        agent_binding: agent_binding
            .map(serde_json::from_value)
            .transpose()
            .context("malformed agent_binding column")?,
        fired_at: row.try_get("fired_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        settled_at: row.try_get("settled_at")?,
        cancel_reason: row.try_get("cancel_reason")?,
        cancelled_by: row.try_get("cancelled_by")?,
        failure_reason: row.try_get("failure_reason")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_index: row.try_get::<i64, _>("created_index")? as u64,
        last_index: 0,
        observed_jitter_ms: None,
    })
}

#[async_trait]
impl TimerProjection for PostgresProjection {
    async fn load_active(&self) -> Result<Vec<TimerRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM timer_records WHERE status = 'scheduled' OR status = 'armed'",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut timers = Vec::with_capacity(rows.len());
        for row in &rows {
            timers.push(row_to_timer(row)?);
        }
        Ok(timers)
    }

    async fn upsert(&self, timer: &TimerRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO timer_records (
                tenant_id, id, requested_by, name, duration_ms, created_at, fire_at, status,
                created_index, metadata, labels, action_bundle, agent_binding,
                fired_at, cancelled_at, settled_at, cancel_reason, cancelled_by, failure_reason,
                idempotency_key
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8,
                $9, $10, $11, $12, $13,
                $14, $15, $16, $17, $18, $19,
                $20
            )
            ON CONFLICT (tenant_id, id) DO UPDATE SET
                status = EXCLUDED.status,
                fire_at = EXCLUDED.fire_at,
                fired_at = EXCLUDED.fired_at,
                cancelled_at = EXCLUDED.cancelled_at,
                settled_at = EXCLUDED.settled_at,
                cancel_reason = EXCLUDED.cancel_reason,
                cancelled_by = EXCLUDED.cancelled_by,
                failure_reason = EXCLUDED.failure_reason,
                metadata = EXCLUDED.metadata,
                labels = EXCLUDED.labels,
                action_bundle = EXCLUDED.action_bundle,
                agent_binding = EXCLUDED.agent_binding
            "#,
        )
        .bind(&timer.tenant_id)
        .bind(timer.id)
        .bind(&timer.requested_by)
        .bind(&timer.name)
        .bind(timer.duration_ms as i64)
        .bind(timer.created_at)
        .bind(timer.fire_at)
        .bind(timer.status.as_str())
        .bind(timer.created_index as i64)
        .bind(timer.metadata.clone())
        .bind(serde_json::to_value(&timer.labels)?)
        .bind(
            timer
                .action_bundle
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(
            timer
                .agent_binding
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(timer.fired_at)
        .bind(timer.cancelled_at)
        .bind(timer.settled_at)
        .bind(timer.cancel_reason.clone())
        .bind(timer.cancelled_by.clone())
        .bind(timer.failure_reason.clone())
        .bind(timer.idempotency_key.clone())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
