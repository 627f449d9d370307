//! HTTP error mapping
//!
//! Handlers return `ApiResult<T>`; every error leaves as
//! `{"detail": "..."}` with the matching status code.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use nebula_console_common::Error;
use tracing::error;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            retry_after: None,
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound { kind, id } => {
                Self::not_found(format!("{} {} not found", capitalize(&kind), id))
            }
            Error::AlreadyExists { kind, id } => {
                Self::new(StatusCode::CONFLICT, format!("{} '{}' already exists", capitalize(&kind), id))
            }
            Error::Validation(msg) | Error::InvalidConfig(msg) => Self::bad_request(msg),
            Error::Conflict(msg) => Self::new(StatusCode::CONFLICT, msg),
            Error::Unauthorized(msg) => Self::unauthorized(msg),
            Error::PermissionDenied(msg) => Self::forbidden(msg),
            Error::Gone(msg) => Self::new(StatusCode::GONE, msg),
            Error::Locked { retry_after_secs } => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                detail: format!(
                    "Too many failed attempts. Try again in {} seconds",
                    retry_after_secs
                ),
                retry_after: Some(retry_after_secs),
            },
            Error::Timeout { seconds } => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                format!("Operation timed out after {}s", seconds),
            ),
            Error::CertTool(msg) => {
                error!("nebula-cert failed: {}", msg);
                Self::new(StatusCode::BAD_GATEWAY, "Certificate tool failed; see server logs")
            }
            other => {
                error!("Internal error: {}", other);
                Self::internal()
            }
        }
    }
}

impl From<nebula_console_common::ValidationError> for ApiError {
    fn from(e: nebula_console_common::ValidationError) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response =
            (self.status, Json(serde_json::json!({ "detail": self.detail }))).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        response
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
