use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Boundary error taxonomy. Every failure the gateway surfaces maps onto one
/// of these kinds; the REST layer renders them as `{ code, message,
/// retryAfterMs?, details? }`.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: String, reason: String },
    #[error("authentication failed")]
    Unauthenticated,
    #[error("permission denied")]
    PermissionDenied,
    #[error("timer not found")]
    NotFound,
    #[error("idempotency key or timer id collision")]
    Duplicate,
    #[error("{kind} quota exceeded")]
    QuotaExceeded { kind: &'static str, retry_after_ms: u64 },
    #[error("kernel leader unavailable")]
    NotLeader { retry_after_ms: u64 },
    #[error("service unavailable")]
    Unavailable,
    #[error("request deadline exceeded")]
    DeadlineExceeded,
    #[error("internal gateway error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidInput { .. } => "invalid_input",
            GatewayError::Unauthenticated => "unauthenticated",
            GatewayError::PermissionDenied => "permission_denied",
            GatewayError::NotFound => "not_found",
            GatewayError::Duplicate => "duplicate",
            GatewayError::QuotaExceeded { .. } => "quota_exceeded",
            GatewayError::NotLeader { .. } => "not_leader",
            GatewayError::Unavailable => "unavailable",
            GatewayError::DeadlineExceeded => "deadline_exceeded",
            GatewayError::Internal(_) => "internal",
        }
    }

    fn http_status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::PermissionDenied => StatusCode::FORBIDDEN,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::Duplicate => StatusCode::CONFLICT,
            GatewayError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NotLeader { .. } | GatewayError::Unavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retry_after_ms(&self) -> Option<u64> {
        match self {
            GatewayError::QuotaExceeded { retry_after_ms, .. }
            | GatewayError::NotLeader { retry_after_ms } => Some(*retry_after_ms),
            GatewayError::Unavailable => Some(1_000),
            _ => None,
        }
    }

    fn details(&self) -> Option<Vec<String>> {
        match self {
            GatewayError::InvalidInput { field, .. } => Some(vec![field.clone()]),
            GatewayError::QuotaExceeded { kind, .. } => Some(vec![(*kind).to_string()]),
            _ => None,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<String>>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
            retry_after_ms: self.retry_after_ms(),
            details: self.details(),
        };
        (self.http_status(), Json(body)).into_response()
    }
}

/// Translate a kernel RPC failure. `not_leader` rides on UNAVAILABLE with a
/// retry hint in metadata.
impl From<tonic::Status> for GatewayError {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;
        match status.code() {
            Code::InvalidArgument => GatewayError::InvalidInput {
                field: "request".into(),
                reason: status.message().to_string(),
            },
            Code::AlreadyExists => GatewayError::Duplicate,
            Code::NotFound => GatewayError::NotFound,
            Code::PermissionDenied => GatewayError::PermissionDenied,
            Code::Unauthenticated => GatewayError::Unauthenticated,
            Code::DeadlineExceeded => GatewayError::DeadlineExceeded,
            Code::Unavailable => {
                if status.message() == "not_leader" {
                    let retry_after_ms = status
                        .metadata()
                        .get("x-retry-after-ms")
                        .and_then(|value| value.to_str().ok())
                        .and_then(|value| value.parse().ok())
                        .unwrap_or(250);
                    GatewayError::NotLeader { retry_after_ms }
                } else {
                    GatewayError::Unavailable
                }
            }
            _ => GatewayError::Internal(status.message().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_status_carries_retry_hint() {
        let mut status = tonic::Status::unavailable("not_leader");
        status
            .metadata_mut()
            .insert("x-retry-after-ms", "500".parse().unwrap());
        let err = GatewayError::from(status);
        assert!(matches!(err, GatewayError::NotLeader { retry_after_ms: 500 }));
    }

    #[test]
    fn quota_errors_render_retry_after() {
        let err = GatewayError::QuotaExceeded {
            kind: "burst",
            retry_after_ms: 1500,
        };
        assert_eq!(err.code(), "quota_exceeded");
        assert_eq!(err.retry_after_ms(), Some(1500));
        assert_eq!(err.http_status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
