pub mod auth;
pub mod error;
pub mod kernel_client;
pub mod quota;
pub mod rest;

pub mod pb {
    tonic::include_proto!("minoots.timer.v1");
}

pub use auth::{
    AuthContext, Credential, CredentialResolver, KeyringEntry, Permission, QuotaLimits,
    ResolverChain, SharedResolver, StaticKeyring,
};
pub use error::GatewayError;
pub use kernel_client::KernelForwarder;
pub use quota::QuotaLedger;
pub use rest::{router, AppState, SharedState};
