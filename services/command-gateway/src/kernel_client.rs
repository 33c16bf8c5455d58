use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::{Request, Streaming};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::GatewayError;
use crate::pb;
use crate::pb::horology_kernel_client::HorologyKernelClient;

/// Forwards admitted commands to the kernel. Holds a connection to one
/// endpoint at a time; a `not_leader` reply rotates to the next endpoint and
/// retries once before surfacing the error to the caller.
pub struct KernelForwarder {
    endpoints: Vec<String>,
    secret: Vec<u8>,
    state: Mutex<ForwarderState>,
}

#[derive(Default)]
struct ForwarderState {
    endpoint_index: usize,
    client: Option<HorologyKernelClient<Channel>>,
}

impl KernelForwarder {
    pub fn new(endpoints: Vec<String>, secret: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            endpoints,
            secret: secret.to_vec(),
            state: Mutex::new(ForwarderState::default()),
        })
    }

    pub fn from_env() -> Arc<Self> {
        let endpoints = std::env::var("KERNEL_GRPC_ENDPOINTS")
            .unwrap_or_else(|_| "http://127.0.0.1:50051".to_string())
            .split(',')
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect();
        let secret = std::env::var("KERNEL_GATEWAY_SECRET")
            .unwrap_or_else(|_| "minoots-dev-secret".to_string());
        Self::new(endpoints, secret.as_bytes())
    }

    async fn client(&self) -> Result<HorologyKernelClient<Channel>, GatewayError> {
        let mut state = self.state.lock().await;
        if let Some(client) = &state.client {
            return Ok(client.clone());
        }
        let endpoint = self.endpoints[state.endpoint_index % self.endpoints.len()].clone();
        debug!(%endpoint, "connecting to kernel");
        let client = HorologyKernelClient::connect(endpoint.clone())
            .await
            .map_err(|error| {
                warn!(?error, %endpoint, "failed to connect to kernel");
                GatewayError::Unavailable
            })?;
        state.client = Some(client.clone());
        Ok(client)
    }

    async fn rotate(&self) {
        let mut state = self.state.lock().await;
        state.client = None;
        state.endpoint_index = (state.endpoint_index + 1) % self.endpoints.len().max(1);
    }

    fn sign(&self, principal_id: &str, tenant_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(principal_id.as_bytes());
        hasher.update(b":");
        hasher.update(tenant_id.as_bytes());
        hasher.update(b":");
        hasher.update(self.secret.as_slice());
        format!("{:x}", hasher.finalize())
    }

    fn signed<T>(&self, context: &AuthContext, message: T) -> Result<Request<T>, GatewayError> {
        let mut request = Request::new(message);
        let metadata = request.metadata_mut();
        metadata.insert(
            "x-tenant-id",
            parse_metadata_value(&context.tenant_id)?,
        );
        metadata.insert(
            "x-principal-id",
            parse_metadata_value(&context.principal_id)?,
        );
        metadata.insert(
            "x-signature",
            parse_metadata_value(&self.sign(&context.principal_id, &context.tenant_id))?,
        );
        metadata.insert(
            "x-request-id",
            parse_metadata_value(&Uuid::new_v4().to_string())?,
        );
        Ok(request)
    }

    pub async fn schedule(
        &self,
        context: &AuthContext,
        request: pb::TimerScheduleRequest,
    ) -> Result<pb::Timer, GatewayError> {
        let mut retried = false;
        loop {
            let mut client = self.client().await?;
            match client
                .schedule_timer(self.signed(context, request.clone())?)
                .await
            {
                Ok(response) => {
                    return response
                        .into_inner()
                        .timer
                        .ok_or_else(|| GatewayError::Internal("kernel returned no timer".into()))
                }
                Err(status) => {
                    let error = GatewayError::from(status);
                    if self.should_retry(&error, &mut retried).await {
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    pub async fn cancel(
        &self,
        context: &AuthContext,
        timer_id: &str,
        reason: Option<String>,
    ) -> Result<pb::Timer, GatewayError> {
        let request = pb::TimerCancelRequest {
            tenant_id: context.tenant_id.clone(),
            timer_id: timer_id.to_string(),
            reason: reason.unwrap_or_default(),
            requested_by: context.principal_id.clone(),
        };
        let mut retried = false;
        loop {
            let mut client = self.client().await?;
            match client.cancel_timer(self.signed(context, request.clone())?).await {
                Ok(response) => return Ok(response.into_inner()),
                Err(status) => {
                    let error = GatewayError::from(status);
                    if self.should_retry(&error, &mut retried).await {
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    pub async fn get(
        &self,
        context: &AuthContext,
        timer_id: &str,
    ) -> Result<pb::Timer, GatewayError> {
        let request = pb::TimerGetRequest {
            tenant_id: context.tenant_id.clone(),
            timer_id: timer_id.to_string(),
        };
        let mut client = self.client().await?;
        match client.get_timer(self.signed(context, request)?).await {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => Err(GatewayError::from(status)),
        }
    }

    pub async fn list(
        &self,
        context: &AuthContext,
        statuses: Vec<String>,
        page_size: u32,
        page_token: String,
    ) -> Result<pb::TimerListResponse, GatewayError> {
        let request = pb::TimerListRequest {
            tenant_id: context.tenant_id.clone(),
            page_size,
            page_token,
            statuses,
        };
        let mut client = self.client().await?;
        match client.list_timers(self.signed(context, request)?).await {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => Err(GatewayError::from(status)),
        }
    }

    pub async fn stream(
        &self,
        context: &AuthContext,
        topics: Vec<String>,
        from_cursor: String,
    ) -> Result<Streaming<pb::TimerEvent>, GatewayError> {
        let request = pb::TimerEventStreamRequest {
            tenant_id: context.tenant_id.clone(),
            topics,
            from_cursor,
        };
        let mut client = self.client().await?;
        match client.stream_timer_events(self.signed(context, request)?).await {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => Err(GatewayError::from(status)),
        }
    }

    /// Current non-terminal count for the tenant, for the burst quota.
    pub async fn active_count(&self, context: &AuthContext) -> Result<usize, GatewayError> {
        let mut count = 0usize;
        let mut page_token = String::new();
        // Bounded sweep; slight undercount past the cap is tolerated the
        // same way slight over-admission is.
        for _ in 0..32 {
            let page = self
                .list(
                    context,
                    vec!["scheduled".into(), "armed".into()],
                    500,
                    page_token.clone(),
                )
                .await?;
            count += page.timers.len();
            if page.next_page_token.is_empty() {
                break;
            }
            page_token = page.next_page_token;
        }
        Ok(count)
    }

    async fn should_retry(&self, error: &GatewayError, retried: &mut bool) -> bool {
        if *retried {
            return false;
        }
        if matches!(error, GatewayError::NotLeader { .. }) {
            *retried = true;
            self.rotate().await;
            return true;
        }
        false
    }
}

fn parse_metadata_value(value: &str) -> Result<MetadataValue<tonic::metadata::Ascii>, GatewayError> {
    MetadataValue::try_from(value).map_err(|_| GatewayError::InvalidInput {
        field: "metadata".into(),
        reason: "header value must be ASCII".into(),
    })
}
