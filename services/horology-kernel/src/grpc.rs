use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_core::Stream;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio_stream::{wrappers::errors::BroadcastStreamRecvError, wrappers::BroadcastStream, StreamExt};
use tonic::{metadata::MetadataMap, Request, Response, Status};
use tracing::warn;
use uuid::Uuid;

use crate::error::KernelError;
use crate::events::{decode_cursor, EventEnvelope};
use crate::kernel::{HorologyKernel, ListQuery};
use crate::model::{AgentBinding, TimerRecord, TimerSpec, TimerStatus};
use crate::pb::horology_kernel_server::{HorologyKernel as HorologyKernelApi, HorologyKernelServer};
use crate::pb::{self, TimerCancelRequest, TimerEventStreamRequest, TimerGetRequest, TimerListRequest, TimerScheduleRequest};

pub type TimerEventStream =
    Pin<Box<dyn Stream<Item = Result<pb::TimerEvent, Status>> + Send + 'static>>;

/// Shared-secret signer for the gateway -> kernel trust boundary. The
/// gateway authenticates tenants; the kernel only verifies that the metadata
/// originated from a party holding the secret.
#[derive(Clone)]
pub struct RequestSigner {
    secret: Arc<Vec<u8>>,
}

impl RequestSigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: Arc::new(secret.to_vec()),
        }
    }

    pub fn insecure_dev() -> Self {
        Self::new(b"minoots-dev-secret")
    }

    pub fn sign(&self, principal_id: &str, tenant_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(principal_id.as_bytes());
        hasher.update(b":");
        hasher.update(tenant_id.as_bytes());
        hasher.update(b":");
        hasher.update(self.secret.as_slice());
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Clone)]
pub struct HorologyKernelService {
    kernel: HorologyKernel,
    signer: RequestSigner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestContext {
    tenant_id: String,
    principal_id: String,
    trace_id: Option<String>,
}

impl HorologyKernelService {
    pub fn new(kernel: HorologyKernel, signer: RequestSigner) -> Self {
        Self { kernel, signer }
    }

    pub fn into_server(self) -> HorologyKernelServer<Self> {
        HorologyKernelServer::new(self)
    }

    fn extract_context(&self, metadata: &MetadataMap) -> Result<RequestContext, Status> {
        let tenant_id = require_ascii_metadata(metadata, "x-tenant-id")?;
        let principal_id = require_ascii_metadata(metadata, "x-principal-id")?;
        let signature = require_ascii_metadata(metadata, "x-signature")?;
        let expected = self.signer.sign(&principal_id, &tenant_id);

        if signature.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
            warn!(
                tenant_id = %tenant_id,
                principal_id = %principal_id,
                "kernel metadata signature mismatch"
            );
            return Err(Status::unauthenticated(
                "invalid signature for kernel request",
            ));
        }

        let trace_id = metadata
            .get("x-trace-id")
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string());

        Ok(RequestContext {
            tenant_id,
            principal_id,
            trace_id,
        })
    }
}

#[tonic::async_trait]
impl HorologyKernelApi for HorologyKernelService {
    async fn schedule_timer(
        &self,
        request: Request<TimerScheduleRequest>,
    ) -> Result<Response<pb::TimerScheduleResponse>, Status> {
        let context = self.extract_context(request.metadata())?;
        let mut payload = request.into_inner();
        payload.tenant_id = enforce_tenant_scope(&payload.tenant_id, &context)?;
        let spec = convert_schedule_request(payload)?;
        let timer = self
            .kernel
            .schedule(spec)
            .await
            .map_err(kernel_error_to_status)?;
        Ok(Response::new(pb::TimerScheduleResponse {
            timer: Some(timer_to_proto(&timer)?),
        }))
    }

    async fn cancel_timer(
        &self,
        request: Request<TimerCancelRequest>,
    ) -> Result<Response<pb::Timer>, Status> {
        let context = self.extract_context(request.metadata())?;
        let payload = request.into_inner();
        let tenant_id = enforce_tenant_scope(&payload.tenant_id, &context)?;
        let timer_id = parse_timer_id(&payload.timer_id)?;

        let cancelled = self
            .kernel
            .cancel(
                &tenant_id,
                timer_id,
                optional_string(payload.reason),
                optional_string(payload.requested_by),
            )
            .await
            .map_err(kernel_error_to_status)?;
        match cancelled {
            Some(timer) => Ok(Response::new(timer_to_proto(&timer)?)),
            None => Err(Status::not_found("timer not found")),
        }
    }

    async fn get_timer(
        &self,
        request: Request<TimerGetRequest>,
    ) -> Result<Response<pb::Timer>, Status> {
        let context = self.extract_context(request.metadata())?;
        let payload = request.into_inner();
        let tenant_id = enforce_tenant_scope(&payload.tenant_id, &context)?;
        let timer_id = parse_timer_id(&payload.timer_id)?;
        match self.kernel.get(&tenant_id, timer_id).await {
            Some(timer) => Ok(Response::new(timer_to_proto(&timer)?)),
            None => Err(Status::not_found("timer not found")),
        }
    }

    async fn list_timers(
        &self,
        request: Request<TimerListRequest>,
    ) -> Result<Response<pb::TimerListResponse>, Status> {
        let context = self.extract_context(request.metadata())?;
        let payload = request.into_inner();
        let tenant_id = enforce_tenant_scope(&payload.tenant_id, &context)?;

        let statuses: Vec<TimerStatus> = payload
            .statuses
            .iter()
            .filter_map(|status| TimerStatus::from_str(&status.to_ascii_lowercase()))
            .collect();
        let cursor = if payload.page_token.is_empty() {
            None
        } else {
            Some(parse_page_token(&payload.page_token)?)
        };

        let page = self
            .kernel
            .list(
                &tenant_id,
                ListQuery {
                    statuses,
                    page_size: payload.page_size as usize,
                    cursor,
                },
            )
            .await;

        Ok(Response::new(pb::TimerListResponse {
            timers: page
                .timers
                .iter()
                .map(timer_to_proto)
                .collect::<Result<Vec<_>, _>>()?,
            next_page_token: page
                .next_cursor
                .map(format_page_token)
                .unwrap_or_default(),
        }))
    }

    type StreamTimerEventsStream = TimerEventStream;

    async fn stream_timer_events(
        &self,
        request: Request<TimerEventStreamRequest>,
    ) -> Result<Response<Self::StreamTimerEventsStream>, Status> {
        let context = self.extract_context(request.metadata())?;
        let payload = request.into_inner();
        // `__all__` is the internal wildcard the action orchestrator runs
        // under; tenants always stream their own scope.
        let tenant_filter = enforce_stream_scope(&payload.tenant_id, &context)?;
        let topics: Arc<HashSet<String>> = Arc::new(payload.topics.into_iter().collect());

        let from_index = if payload.from_cursor.is_empty() {
            None
        } else {
            Some(
                decode_cursor(&payload.from_cursor)
                    .ok_or_else(|| Status::invalid_argument("malformed from_cursor"))?,
            )
        };

        // Subscribe before replaying so nothing committed in between is lost;
        // duplicates across the seam are fine (at-least-once).
        let receiver = self.kernel.subscribe();

        let mut replayed: Vec<Result<pb::TimerEvent, Status>> = Vec::new();
        let mut last_replayed = 0u64;
        if let Some(from) = from_index {
            let events = self
                .kernel
                .replay_events(from.saturating_add(1))
                .await
                .map_err(kernel_error_to_status)?;
            for envelope in events {
                if let Some(tenant) = &tenant_filter {
                    if &envelope.tenant_id != tenant {
                        continue;
                    }
                }
                if !topics.is_empty() && !topics.contains(envelope.topic()) {
                    continue;
                }
                last_replayed = envelope.event_id;
                replayed.push(event_to_proto(&envelope));
            }
        }

        let live = BroadcastStream::new(receiver).filter_map({
            let topics = Arc::clone(&topics);
            let tenant_filter = tenant_filter.clone();
            move |item| match item {
                Ok(envelope) => {
                    if let Some(tenant) = &tenant_filter {
                        if &envelope.tenant_id != tenant {
                            return None;
                        }
                    }
                    if envelope.event_id <= last_replayed {
                        return None;
                    }
                    if !topics.is_empty() && !topics.contains(envelope.topic()) {
                        return None;
                    }
                    Some(event_to_proto(&envelope))
                }
                // Bounded queue overflowed: disconnect, the subscriber
                // resumes from its last cursor.
                Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Err(Status::data_loss(
                    format!("subscriber lagged behind by {skipped} events; resume from cursor"),
                ))),
            }
        });

        let stream = tokio_stream::iter(replayed).chain(live);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn record_action_outcome(
        &self,
        request: Request<pb::ActionOutcomeRequest>,
    ) -> Result<Response<pb::ActionOutcomeResponse>, Status> {
        let context = self.extract_context(request.metadata())?;
        let payload = request.into_inner();
        let tenant_id = if context.tenant_id == "__all__" {
            if payload.tenant_id.is_empty() {
                return Err(Status::invalid_argument("tenant_id is required"));
            }
            payload.tenant_id.clone()
        } else {
            enforce_tenant_scope(&payload.tenant_id, &context)?
        };
        let timer_id = parse_timer_id(&payload.timer_id)?;

        let settled = self
            .kernel
            .settle(
                &tenant_id,
                timer_id,
                payload.success,
                payload.attempts,
                optional_string(payload.last_error),
            )
            .await
            .map_err(kernel_error_to_status)?;
        match settled {
            Some(timer) => Ok(Response::new(pb::ActionOutcomeResponse {
                timer: Some(timer_to_proto(&timer)?),
            })),
            None => Err(Status::not_found("timer not found")),
        }
    }
}

fn kernel_error_to_status(err: KernelError) -> Status {
    match err {
        KernelError::InvalidInput { .. } | KernelError::PastFireInstant => {
            Status::invalid_argument(err.to_string())
        }
        KernelError::DuplicateTimer => Status::already_exists(err.to_string()),
        KernelError::NotFound => Status::not_found(err.to_string()),
        KernelError::NotLeader { retry_after_ms } => {
            let mut status = Status::unavailable("not_leader");
            if let Ok(value) = retry_after_ms.to_string().parse() {
                status.metadata_mut().insert("x-retry-after-ms", value);
            }
            status
        }
        KernelError::Unavailable => Status::unavailable(err.to_string()),
        KernelError::Internal(message) => Status::internal(message),
    }
}

fn require_ascii_metadata(metadata: &MetadataMap, key: &str) -> Result<String, Status> {
    metadata
        .get(key)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
        .ok_or_else(|| Status::unauthenticated(format!("{key} metadata is required")))
}

fn enforce_tenant_scope(requested: &str, context: &RequestContext) -> Result<String, Status> {
    if requested.is_empty() || requested == context.tenant_id {
        Ok(context.tenant_id.clone())
    } else {
        Err(Status::permission_denied(
            "tenant mismatch for kernel request",
        ))
    }
}

/// `None` means unfiltered: only the internal `__all__` principal gets it.
fn enforce_stream_scope(
    requested: &str,
    context: &RequestContext,
) -> Result<Option<String>, Status> {
    if context.tenant_id == "__all__" && (requested.is_empty() || requested == "__all__") {
        return Ok(None);
    }
    enforce_tenant_scope(requested, context).map(Some)
}

fn parse_timer_id(value: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(value).map_err(|_| Status::invalid_argument("timer_id must be a valid UUID"))
}

fn parse_page_token(token: &str) -> Result<u64, Status> {
    token
        .strip_prefix("pt-")
        .and_then(|raw| u64::from_str_radix(raw, 16).ok())
        .ok_or_else(|| Status::invalid_argument("malformed page_token"))
}

fn format_page_token(cursor: u64) -> String {
    format!("pt-{cursor:016x}")
}

fn optional_string(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn parse_iso_instant(value: &str) -> Result<DateTime<Utc>, Status> {
    DateTime::parse_from_rfc3339(value)
        .map(|instant| instant.with_timezone(&Utc))
        .map_err(|_| Status::invalid_argument("fire_time must be RFC 3339"))
}

fn convert_schedule_request(request: TimerScheduleRequest) -> Result<TimerSpec, Status> {
    if request.requested_by.is_empty() {
        return Err(Status::invalid_argument("requested_by is required"));
    }

    let (duration_ms, fire_at) = match request.schedule_time {
        Some(pb::timer_schedule_request::ScheduleTime::DurationMs(duration)) => {
            if duration == 0 {
                return Err(Status::invalid_argument(
                    "duration_ms must be greater than zero",
                ));
            }
            (Some(duration), None)
        }
        Some(pb::timer_schedule_request::ScheduleTime::FireTimeIso(iso)) => {
            (None, Some(parse_iso_instant(&iso)?))
        }
        None => {
            return Err(Status::invalid_argument(
                "either duration_ms or fire_time_iso must be provided",
            ))
        }
    };

    let metadata = parse_json_field(&request.metadata_json, "metadata_json")?;
    // The bundle is opaque here: the kernel admission-checks it, and a
    // rejected bundle becomes a `failed` timer rather than an RPC error.
    // A payload that is not even JSON rides along as a JSON string so the
    // rejection is still auditable on the row.
    let action_bundle: Option<serde_json::Value> = if request.action_bundle_json.is_empty() {
        None
    } else {
        match serde_json::from_str(&request.action_bundle_json) {
            Ok(value) => Some(value),
            Err(_) => Some(serde_json::Value::String(request.action_bundle_json.clone())),
        }
    };
    let agent_binding: Option<AgentBinding> = if request.agent_binding_json.is_empty() {
        None
    } else {
        Some(
            serde_json::from_str(&request.agent_binding_json)
                .map_err(|_| Status::invalid_argument("malformed agent_binding_json"))?,
        )
    };

    Ok(TimerSpec {
        id: None,
        tenant_id: request.tenant_id,
        requested_by: request.requested_by,
        name: optional_string(request.name),
        duration_ms,
        fire_at,
        metadata,
        labels: request.labels,
        action_bundle,
        agent_binding,
        idempotency_key: optional_string(request.idempotency_key),
    })
}

fn parse_json_field(
    raw: &str,
    field: &'static str,
) -> Result<Option<serde_json::Value>, Status> {
    if raw.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|_| Status::invalid_argument(format!("malformed {field}")))
}

fn timer_status_to_proto(status: TimerStatus) -> pb::TimerStatus {
    match status {
        TimerStatus::Scheduled => pb::TimerStatus::Scheduled,
        TimerStatus::Armed => pb::TimerStatus::Armed,
        TimerStatus::Fired => pb::TimerStatus::Fired,
        TimerStatus::Cancelled => pb::TimerStatus::Cancelled,
        TimerStatus::Failed => pb::TimerStatus::Failed,
    }
}

pub fn timer_to_proto(timer: &TimerRecord) -> Result<pb::Timer, Status> {
    let action_bundle_json = timer
        .action_bundle
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|err| Status::internal(format!("failed to encode action bundle: {err}")))?
        .unwrap_or_default();
    let agent_binding_json = timer
        .agent_binding
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|err| Status::internal(format!("failed to encode agent binding: {err}")))?
        .unwrap_or_default();

    Ok(pb::Timer {
        id: timer.id.to_string(),
        tenant_id: timer.tenant_id.clone(),
        requested_by: timer.requested_by.clone(),
        name: timer.name.clone(),
        status: timer_status_to_proto(timer.status) as i32,
        created_at_iso: timer.created_at.to_rfc3339(),
        fire_at_iso: timer.fire_at.to_rfc3339(),
        fired_at_iso: timer
            .fired_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_default(),
        cancelled_at_iso: timer
            .cancelled_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_default(),
        settled_at_iso: timer
            .settled_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_default(),
        cancel_reason: timer.cancel_reason.clone().unwrap_or_default(),
        cancelled_by: timer.cancelled_by.clone().unwrap_or_default(),
        failure_reason: timer.failure_reason.clone().unwrap_or_default(),
        duration_ms: timer.duration_ms,
        metadata_json: timer
            .metadata
            .as_ref()
            .map(|value| value.to_string())
            .unwrap_or_default(),
        action_bundle_json,
        agent_binding_json,
        labels: timer.labels.clone(),
    })
}

pub fn event_to_proto(envelope: &EventEnvelope) -> Result<pb::TimerEvent, Status> {
    Ok(pb::TimerEvent {
        event_id: envelope.event_id,
        tenant_id: envelope.tenant_id.clone(),
        timer_id: envelope.timer_id.to_string(),
        kind: envelope.kind.as_str().to_string(),
        instant_iso: envelope.instant.to_rfc3339(),
        reason: envelope.reason.clone().unwrap_or_default(),
        cursor_token: envelope.cursor_token(),
        timer: Some(timer_to_proto(&envelope.timer)?),
    })
}
