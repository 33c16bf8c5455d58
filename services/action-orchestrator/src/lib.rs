pub mod bundle;
pub mod cursor;
pub mod executor;
pub mod retry;
pub mod runner;

pub mod pb {
    tonic::include_proto!("minoots.timer.v1");
}

pub use bundle::{ActionBundle, ActionSpec, AgentPromptParams, RetryPolicy, WebhookParams};
pub use cursor::FileCursor;
pub use executor::{
    ActionRunner, AgentAck, AgentAdapter, AttemptOutcome, FireContext, LoggingAdapter,
    IDEMPOTENCY_HEADER,
};
pub use runner::{Orchestrator, OrchestratorConfig};
