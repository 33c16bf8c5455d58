use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PersistedCursor {
    last_acked_index: u64,
}

/// Durable consumption cursor. Restart resumes from `last_acked_index`;
/// everything after it replays, so downstream deliveries are at-least-once.
#[derive(Clone)]
pub struct FileCursor {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl FileCursor {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: Arc::new(path.into()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn load(&self) -> Result<u64> {
        match fs::read(&*self.path).await {
            Ok(bytes) => {
                let persisted: PersistedCursor =
                    serde_json::from_slice(&bytes).context("failed to parse cursor file")?;
                Ok(persisted.last_acked_index)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn store(&self, last_acked_index: u64) -> Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory for {:?}", self.path))?;
        }
        let bytes = serde_json::to_vec_pretty(&PersistedCursor { last_acked_index })?;
        fs::write(&*self.path, bytes)
            .await
            .with_context(|| format!("failed to write cursor to {:?}", self.path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir().join(format!("orchestrator-cursor-{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn missing_cursor_starts_from_zero() {
        let cursor = FileCursor::new(scratch_path());
        assert_eq!(cursor.load().await.expect("load"), 0);
    }

    #[tokio::test]
    async fn cursor_round_trips_through_disk() {
        let path = scratch_path();
        let cursor = FileCursor::new(path.clone());
        cursor.store(42).await.expect("store");

        let reopened = FileCursor::new(path.clone());
        assert_eq!(reopened.load().await.expect("load"), 42);
        let _ = std::fs::remove_file(path);
    }
}
