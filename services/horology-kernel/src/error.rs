use thiserror::Error;

use crate::log::LogError;

/// Errors surfaced by kernel operations. The gRPC layer maps these onto the
/// boundary taxonomy (`invalid_input`, `not_leader`, `unavailable`, ...).
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },
    #[error("fire instant must be at least 1ms in the future")]
    PastFireInstant,
    #[error("timer id already exists")]
    DuplicateTimer,
    #[error("timer not found")]
    NotFound,
    #[error("this node is not the scheduling leader")]
    NotLeader { retry_after_ms: u64 },
    #[error("scheduling quorum unavailable")]
    Unavailable,
    #[error("internal kernel error: {0}")]
    Internal(String),
}

impl From<LogError> for KernelError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::NotLeader { .. } => KernelError::NotLeader {
                retry_after_ms: 250,
            },
            LogError::Unavailable(_) => KernelError::Unavailable,
            LogError::Corrupt { index } => {
                KernelError::Internal(format!("log record {index} failed checksum verification"))
            }
            LogError::Storage(err) => KernelError::Internal(err.to_string()),
        }
    }
}
