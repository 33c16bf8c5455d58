use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::GatewayError;

/// What a caller may do once authenticated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Permission {
    TimersCreate,
    TimersCancel,
    TimersRead,
    TimersStream,
}

impl Permission {
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "timers:create" => Some(Permission::TimersCreate),
            "timers:cancel" => Some(Permission::TimersCancel),
            "timers:read" => Some(Permission::TimersRead),
            "timers:stream" => Some(Permission::TimersStream),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaLimits {
    #[serde(default = "default_schedule_per_minute")]
    pub schedule_per_minute: u32,
    #[serde(default = "default_cancel_per_minute")]
    pub cancel_per_minute: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_daily")]
    pub daily: u32,
}

fn default_schedule_per_minute() -> u32 {
    120
}
fn default_cancel_per_minute() -> u32 {
    60
}
fn default_burst() -> u32 {
    256
}
fn default_daily() -> u32 {
    10_000
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            schedule_per_minute: default_schedule_per_minute(),
            cancel_per_minute: default_cancel_per_minute(),
            burst: default_burst(),
            daily: default_daily(),
        }
    }
}

impl QuotaLimits {
    pub fn from_env() -> Self {
        Self {
            schedule_per_minute: env_u32(
                "GATEWAY_DEFAULT_SCHEDULE_PER_MINUTE",
                default_schedule_per_minute(),
            ),
            cancel_per_minute: env_u32(
                "GATEWAY_DEFAULT_CANCEL_PER_MINUTE",
                default_cancel_per_minute(),
            ),
            burst: env_u32("GATEWAY_DEFAULT_BURST", default_burst()),
            daily: env_u32("GATEWAY_DEFAULT_DAILY", default_daily()),
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Resolved identity of an authenticated request.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub credential_id: String,
    pub tenant_id: String,
    pub principal_id: String,
    pub permissions: HashSet<Permission>,
    pub quotas: QuotaLimits,
}

impl AuthContext {
    pub fn require(&self, permission: Permission) -> Result<(), GatewayError> {
        if self.permissions.contains(&permission) {
            Ok(())
        } else {
            Err(GatewayError::PermissionDenied)
        }
    }
}

/// A presented credential, before resolution.
#[derive(Clone, Debug)]
pub enum Credential {
    ApiKey(String),
    Bearer(String),
}

impl Credential {
    pub fn secret(&self) -> &str {
        match self {
            Credential::ApiKey(value) | Credential::Bearer(value) => value,
        }
    }
}

/// Pluggable credential resolution. Implementations answer `None` for
/// credentials they do not recognise so a chain can keep looking.
#[async_trait]
pub trait CredentialResolver: Send + Sync + 'static {
    async fn resolve(&self, credential: &Credential) -> Result<Option<AuthContext>, GatewayError>;
}

pub type SharedResolver = Arc<dyn CredentialResolver>;

/// First-match-wins chain of resolvers.
pub struct ResolverChain {
    resolvers: Vec<SharedResolver>,
}

impl ResolverChain {
    pub fn new(resolvers: Vec<SharedResolver>) -> Self {
        Self { resolvers }
    }

    pub async fn authenticate(&self, credential: &Credential) -> Result<AuthContext, GatewayError> {
        for resolver in &self.resolvers {
            if let Some(context) = resolver.resolve(credential).await? {
                return Ok(context);
            }
        }
        Err(GatewayError::Unauthenticated)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyringEntry {
    pub api_key: String,
    pub tenant_id: String,
    pub principal_id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub quotas: Option<QuotaLimits>,
}

struct ResolvedEntry {
    credential_id: String,
    tenant_id: String,
    principal_id: String,
    permissions: HashSet<Permission>,
    quotas: QuotaLimits,
}

/// Keyring seeded from configuration. Keys are stored as SHA-256 digests;
/// lookup hashes the presented secret, so plaintext keys never sit in memory
/// past startup.
pub struct StaticKeyring {
    entries: HashMap<String, ResolvedEntry>,
}

impl StaticKeyring {
    pub fn new(entries: Vec<KeyringEntry>, default_quotas: QuotaLimits) -> Self {
        let mut map = HashMap::new();
        for entry in entries {
            let digest = digest_hex(&entry.api_key);
            let permissions = if entry.permissions.is_empty() {
                all_permissions()
            } else {
                entry
                    .permissions
                    .iter()
                    .filter_map(|raw| Permission::from_str(raw))
                    .collect()
            };
            map.insert(
                digest.clone(),
                ResolvedEntry {
                    credential_id: format!("key-{}", &digest[..12]),
                    tenant_id: entry.tenant_id,
                    principal_id: entry.principal_id,
                    permissions,
                    quotas: entry.quotas.unwrap_or(default_quotas),
                },
            );
        }
        Self { entries: map }
    }

    pub fn from_env(default_quotas: QuotaLimits) -> anyhow::Result<Self> {
        let raw = std::env::var("GATEWAY_API_KEYS").unwrap_or_else(|_| "[]".to_string());
        let entries: Vec<KeyringEntry> = serde_json::from_str(&raw)
            .map_err(|err| anyhow::anyhow!("malformed GATEWAY_API_KEYS: {err}"))?;
        Ok(Self::new(entries, default_quotas))
    }
}

fn all_permissions() -> HashSet<Permission> {
    [
        Permission::TimersCreate,
        Permission::TimersCancel,
        Permission::TimersRead,
        Permission::TimersStream,
    ]
    .into_iter()
    .collect()
}

fn digest_hex(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl CredentialResolver for StaticKeyring {
    async fn resolve(&self, credential: &Credential) -> Result<Option<AuthContext>, GatewayError> {
        let digest = digest_hex(credential.secret());
        Ok(self.entries.get(&digest).map(|entry| AuthContext {
            credential_id: entry.credential_id.clone(),
            tenant_id: entry.tenant_id.clone(),
            principal_id: entry.principal_id.clone(),
            permissions: entry.permissions.clone(),
            quotas: entry.quotas,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyring() -> StaticKeyring {
        StaticKeyring::new(
            vec![
                KeyringEntry {
                    api_key: "acme-key".into(),
                    tenant_id: "acme".into(),
                    principal_id: "ops@acme".into(),
                    permissions: vec!["timers:create".into(), "timers:read".into()],
                    quotas: None,
                },
                KeyringEntry {
                    api_key: "beta-key".into(),
                    tenant_id: "beta".into(),
                    principal_id: "ops@beta".into(),
                    permissions: vec![],
                    quotas: None,
                },
            ],
            QuotaLimits::default(),
        )
    }

    #[tokio::test]
    async fn resolves_known_keys_with_scoped_permissions() {
        let keyring = keyring();
        let context = keyring
            .resolve(&Credential::ApiKey("acme-key".into()))
            .await
            .unwrap()
            .expect("known key");
        assert_eq!(context.tenant_id, "acme");
        assert!(context.require(Permission::TimersCreate).is_ok());
        assert!(context.require(Permission::TimersCancel).is_err());
    }

    #[tokio::test]
    async fn empty_permission_list_grants_everything() {
        let keyring = keyring();
        let context = keyring
            .resolve(&Credential::Bearer("beta-key".into()))
            .await
            .unwrap()
            .expect("known key");
        assert!(context.require(Permission::TimersStream).is_ok());
    }

    #[tokio::test]
    async fn unknown_keys_fall_through_the_chain() {
        let chain = ResolverChain::new(vec![Arc::new(keyring()) as SharedResolver]);
        let err = chain
            .authenticate(&Credential::ApiKey("wrong".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }
}
