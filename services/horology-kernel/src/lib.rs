pub mod clock;
pub mod error;
pub mod events;
pub mod grpc;
pub mod kernel;
pub mod log;
pub mod model;
pub mod projection;
pub mod replication;
pub mod telemetry;
pub mod test_support;
pub mod wheel;

pub mod pb {
    tonic::include_proto!("minoots.timer.v1");
}

pub use error::KernelError;
pub use events::{decode_cursor, encode_cursor, EventBus, EventEnvelope};
pub use grpc::{HorologyKernelService, RequestSigner};
pub use kernel::{
    ClockDriftAlert, HorologyKernel, KernelRuntimeOptions, ListPage, ListQuery, SchedulerConfig,
};
pub use log::{
    LogError, MemoryTransitionLog, PostgresTransitionLog, SharedTransitionLog, TransitionDraft,
    TransitionLog, TransitionRecord,
};
pub use model::{
    Action, ActionBundle, ActionRetryPolicy, AgentBinding, TimerRecord, TimerSpec, TimerStatus,
    TransitionKind,
};
pub use projection::{MemoryProjection, PostgresProjection, SharedProjection, TimerProjection};
pub use replication::{
    ConsensusSettings, ConsensusSupervisor, LeaderHandle, LeaseCoordinator, LeaseSettings,
};
