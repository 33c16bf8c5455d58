use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::TimerRecord;

pub mod postgres;

pub use postgres::PostgresProjection;

/// Durable read model of timer rows. Written only by the kernel commit path
/// (leader) and the follower log tailer; read by queries and recovery.
#[async_trait]
pub trait TimerProjection: Send + Sync + 'static {
    /// Non-terminal rows, used to rebuild the wheel on start.
    async fn load_active(&self) -> Result<Vec<TimerRecord>>;
    async fn upsert(&self, timer: &TimerRecord) -> Result<()>;
}

pub type SharedProjection = Arc<dyn TimerProjection>;

/// Memory-mode projection. Rows live exactly as long as the process.
#[derive(Default, Clone)]
pub struct MemoryProjection {
    rows: Arc<RwLock<HashMap<(String, Uuid), TimerRecord>>>,
}

impl MemoryProjection {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimerProjection for MemoryProjection {
    async fn load_active(&self) -> Result<Vec<TimerRecord>> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|timer| !timer.is_terminal())
            .cloned()
            .collect())
    }

    async fn upsert(&self, timer: &TimerRecord) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.insert((timer.tenant_id.clone(), timer.id), timer.clone());
        Ok(())
    }
}
