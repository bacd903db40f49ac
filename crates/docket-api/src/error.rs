//! API error type and its HTTP mapping.

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use docket_core::{Error, ErrorKind};

#[derive(Debug)]
pub enum ApiError {
    Core(Error),
    Unauthorized(String),
    Forbidden(String),
    BadRequest(String),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Core(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::FeatureDisabled(_) | Error::TenantNotFound(_) => StatusCode::FORBIDDEN,
        Error::QuotaExceeded(_) | Error::InvalidTransition { .. } | Error::LeaseLost(_) => {
            StatusCode::CONFLICT
        }
        Error::NotFound(_) | Error::JobNotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        e => match e.kind() {
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

/// 429 response shared by the per-actor limiter and the global limiter.
pub fn too_many_requests(message: &str, retry_after_secs: u64) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": message,
            "code": "rate_limit_exceeded",
            "retry_after": retry_after_secs,
        })),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
    response
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            ApiError::Core(Error::RateLimited {
                retry_after_secs,
                reason,
            }) => {
                return too_many_requests(&format!("Too many requests: {reason}"), retry_after_secs)
            }
            ApiError::Core(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    tracing::error!(subsystem = "api", error = %err, code = err.reason_code(), "Request failed");
                }
                (status, err.to_string(), err.reason_code())
            }
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg, "unauthorized"),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg, "forbidden"),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "invalid_input"),
        };

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
