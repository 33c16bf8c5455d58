use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing::warn;

use crate::auth::{AuthContext, Credential, Permission, ResolverChain};
use crate::error::GatewayError;
use crate::kernel_client::KernelForwarder;
use crate::pb;
use crate::quota::{check_burst, QuotaLedger};

pub struct AppState {
    pub resolver: ResolverChain,
    pub ledger: QuotaLedger,
    pub forwarder: Arc<KernelForwarder>,
    pub request_timeout: Duration,
}

pub type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/timers", post(schedule_timer).get(list_timers))
        .route("/timers/:id", get(get_timer))
        .route("/timers/:id/cancel", post(cancel_timer))
        .route("/timers/stream", get(stream_timers))
        .route("/healthz", get(healthz))
        .with_state(state)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub fire_time_iso: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub action_bundle: Option<serde_json::Value>,
    #[serde(default)]
    pub agent_binding: Option<serde_json::Value>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamParams {
    #[serde(default)]
    pub topics: Option<String>,
    #[serde(default)]
    pub from_cursor: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerDto {
    pub id: String,
    pub tenant_id: String,
    pub requested_by: String,
    pub name: String,
    pub status: String,
    pub created_at: String,
    pub fire_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fired_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_bundle: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_binding: Option<serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDto {
    pub timers: Vec<TimerDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventDto {
    event_id: u64,
    tenant_id: String,
    timer_id: String,
    kind: String,
    instant: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    cursor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    timer: Option<TimerDto>,
}

fn timer_dto(timer: pb::Timer) -> TimerDto {
    let status = match pb::TimerStatus::try_from(timer.status) {
        Ok(pb::TimerStatus::Scheduled) => "scheduled",
        Ok(pb::TimerStatus::Armed) => "armed",
        Ok(pb::TimerStatus::Fired) => "fired",
        Ok(pb::TimerStatus::Cancelled) => "cancelled",
        Ok(pb::TimerStatus::Failed) => "failed",
        _ => "unspecified",
    };
    TimerDto {
        id: timer.id,
        tenant_id: timer.tenant_id,
        requested_by: timer.requested_by,
        name: timer.name,
        status: status.to_string(),
        created_at: timer.created_at_iso,
        fire_at: timer.fire_at_iso,
        fired_at: non_empty(timer.fired_at_iso),
        cancelled_at: non_empty(timer.cancelled_at_iso),
        settled_at: non_empty(timer.settled_at_iso),
        cancel_reason: non_empty(timer.cancel_reason),
        cancelled_by: non_empty(timer.cancelled_by),
        failure_reason: non_empty(timer.failure_reason),
        duration_ms: timer.duration_ms,
        metadata: parse_json(timer.metadata_json),
        labels: timer.labels,
        action_bundle: parse_json(timer.action_bundle_json),
        agent_binding: parse_json(timer.agent_binding_json),
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn parse_json(raw: String) -> Option<serde_json::Value> {
    if raw.is_empty() {
        return None;
    }
    serde_json::from_str(&raw).ok()
}

/// Resolve the caller and enforce the tenant claim. A request naming a tenant
/// other than the credential's own is rejected without disclosing anything.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthContext, GatewayError> {
    let credential = extract_credential(headers)?;
    let context = state.resolver.authenticate(&credential).await?;

    if let Some(claimed) = headers
        .get("x-tenant-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    {
        if claimed != context.tenant_id {
            return Err(GatewayError::PermissionDenied);
        }
    }
    Ok(context)
}

fn extract_credential(headers: &HeaderMap) -> Result<Credential, GatewayError> {
    if let Some(key) = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    {
        return Ok(Credential::ApiKey(key.to_string()));
    }
    if let Some(bearer) = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|value| !value.is_empty())
    {
        return Ok(Credential::Bearer(bearer.to_string()));
    }
    Err(GatewayError::Unauthenticated)
}

async fn with_deadline<T>(
    state: &AppState,
    fut: impl std::future::Future<Output = Result<T, GatewayError>>,
) -> Result<T, GatewayError> {
    tokio::time::timeout(state.request_timeout, fut)
        .await
        .map_err(|_| GatewayError::DeadlineExceeded)?
}

async fn schedule_timer(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<ScheduleBody>,
) -> Result<Json<TimerDto>, GatewayError> {
    let context = authenticate(&state, &headers).await?;
    context.require(Permission::TimersCreate)?;

    // Burst admission first: a burst rejection must not spend the caller's
    // per-minute or daily budget, since no timer is created.
    let active = with_deadline(&state, state.forwarder.active_count(&context)).await?;
    check_burst(active, &context.quotas)?;
    state
        .ledger
        .admit_schedule(&context.credential_id, &context.quotas)
        .await?;

    // Normalise to a canonical absolute instant on the server clock; the
    // kernel never trusts client clocks.
    let fire_time_iso = match (body.duration_ms, body.fire_time_iso) {
        (Some(_), Some(_)) => {
            return Err(GatewayError::InvalidInput {
                field: "scheduleTime".into(),
                reason: "provide either durationMs or fireTimeIso, not both".into(),
            })
        }
        (Some(0), None) => {
            return Err(GatewayError::InvalidInput {
                field: "durationMs".into(),
                reason: "must be greater than zero".into(),
            })
        }
        (Some(duration_ms), None) => {
            (Utc::now() + chrono::Duration::milliseconds(duration_ms as i64)).to_rfc3339()
        }
        (None, Some(iso)) => iso,
        (None, None) => {
            return Err(GatewayError::InvalidInput {
                field: "scheduleTime".into(),
                reason: "either durationMs or fireTimeIso is required".into(),
            })
        }
    };

    let mut labels = body.labels;
    if let Some(metadata) = &body.metadata {
        project_ecosystem_labels(metadata, &mut labels);
    }

    let request = pb::TimerScheduleRequest {
        tenant_id: context.tenant_id.clone(),
        requested_by: context.principal_id.clone(),
        name: body.name.unwrap_or_default(),
        schedule_time: Some(pb::timer_schedule_request::ScheduleTime::FireTimeIso(
            fire_time_iso,
        )),
        metadata_json: body
            .metadata
            .map(|value| value.to_string())
            .unwrap_or_default(),
        labels,
        action_bundle_json: body
            .action_bundle
            .map(|value| value.to_string())
            .unwrap_or_default(),
        agent_binding_json: body
            .agent_binding
            .map(|value| value.to_string())
            .unwrap_or_default(),
        idempotency_key: body.idempotency_key.unwrap_or_default(),
    };

    let timer = with_deadline(&state, state.forwarder.schedule(&context, request)).await?;
    Ok(Json(timer_dto(timer)))
}

async fn cancel_timer(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CancelBody>,
) -> Result<Json<TimerDto>, GatewayError> {
    let context = authenticate(&state, &headers).await?;
    context.require(Permission::TimersCancel)?;
    state
        .ledger
        .admit_cancel(&context.credential_id, &context.quotas)
        .await?;

    let timer = with_deadline(&state, state.forwarder.cancel(&context, &id, body.reason)).await?;
    Ok(Json(timer_dto(timer)))
}

async fn get_timer(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TimerDto>, GatewayError> {
    let context = authenticate(&state, &headers).await?;
    context.require(Permission::TimersRead)?;
    let timer = with_deadline(&state, state.forwarder.get(&context, &id)).await?;
    Ok(Json(timer_dto(timer)))
}

async fn list_timers(
    State(state): State<SharedState>,
    Query(params): Query<ListParams>,
    headers: HeaderMap,
) -> Result<Json<ListDto>, GatewayError> {
    let context = authenticate(&state, &headers).await?;
    context.require(Permission::TimersRead)?;

    let statuses = params
        .status
        .map(|raw| {
            raw.split(',')
                .map(|status| status.trim().to_string())
                .filter(|status| !status.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let response = with_deadline(
        &state,
        state.forwarder.list(
            &context,
            statuses,
            params.page_size.unwrap_or(0),
            params.page_token.unwrap_or_default(),
        ),
    )
    .await?;

    Ok(Json(ListDto {
        timers: response.timers.into_iter().map(timer_dto).collect(),
        next_page_token: non_empty(response.next_page_token),
    }))
}

async fn stream_timers(
    State(state): State<SharedState>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    let context = authenticate(&state, &headers).await?;
    context.require(Permission::TimersStream)?;

    let topics = params
        .topics
        .map(|raw| {
            raw.split(',')
                .map(|topic| topic.trim().to_string())
                .filter(|topic| !topic.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let upstream = state
        .forwarder
        .stream(&context, topics, params.from_cursor.unwrap_or_default())
        .await?;

    let events = upstream.map(|item| {
        let event = match item {
            Ok(event) => event,
            Err(status) => {
                warn!(?status, "kernel event stream ended");
                return Ok(Event::default()
                    .event("error")
                    .data(GatewayError::from(status).code()));
            }
        };
        let dto = EventDto {
            event_id: event.event_id,
            tenant_id: event.tenant_id,
            timer_id: event.timer_id,
            kind: event.kind.clone(),
            instant: event.instant_iso,
            reason: non_empty(event.reason),
            cursor: event.cursor_token.clone(),
            timer: event.timer.map(timer_dto),
        };
        let sse = Event::default()
            .id(event.cursor_token)
            .event(event.kind)
            .json_data(&dto)
            .unwrap_or_else(|error| {
                warn!(?error, "failed to encode SSE event");
                Event::default().event("error").data("internal")
            });
        Ok(sse)
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Boundary projection: string entries under `metadata.ecosystem` surface as
/// `ecosystem.<key>` labels. Explicit labels win; the kernel itself treats
/// labels as opaque.
fn project_ecosystem_labels(
    metadata: &serde_json::Value,
    labels: &mut HashMap<String, String>,
) {
    let Some(ecosystem) = metadata.get("ecosystem").and_then(|value| value.as_object()) else {
        return;
    };
    for (key, value) in ecosystem {
        if let Some(value) = value.as_str() {
            labels
                .entry(format!("ecosystem.{key}"))
                .or_insert_with(|| value.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn credential_extraction_prefers_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("key-1"));
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer token-1"),
        );
        match extract_credential(&headers).unwrap() {
            Credential::ApiKey(key) => assert_eq!(key, "key-1"),
            other => panic!("unexpected credential: {other:?}"),
        }
    }

    #[test]
    fn bearer_token_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer token-1"),
        );
        match extract_credential(&headers).unwrap() {
            Credential::Bearer(token) => assert_eq!(token, "token-1"),
            other => panic!("unexpected credential: {other:?}"),
        }
    }

    #[test]
    fn missing_credentials_are_unauthenticated() {
        let headers = HeaderMap::new();
        assert!(matches!(
            extract_credential(&headers),
            Err(GatewayError::Unauthenticated)
        ));
    }

    #[test]
    fn ecosystem_metadata_projects_into_labels() {
        let metadata = serde_json::json!({
            "ecosystem": {"parserator": "job-7", "depth": 3},
            "other": "ignored"
        });
        let mut labels = HashMap::new();
        labels.insert("ecosystem.parserator".to_string(), "explicit".to_string());

        project_ecosystem_labels(&metadata, &mut labels);
        // Explicit labels win; non-string values are skipped.
        assert_eq!(labels.get("ecosystem.parserator").unwrap(), "explicit");
        assert!(!labels.contains_key("ecosystem.depth"));

        let mut fresh = HashMap::new();
        project_ecosystem_labels(&metadata, &mut fresh);
        assert_eq!(fresh.get("ecosystem.parserator").unwrap(), "job-7");
    }
}
