use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, warn};

use crate::protocol::anthropic::{ErrorBody, ErrorEnvelope};

pub const INVALID_REQUEST_ERROR: &str = "invalid_request_error";
pub const AUTHENTICATION_ERROR: &str = "authentication_error";
pub const PERMISSION_ERROR: &str = "permission_error";
pub const NOT_FOUND_ERROR: &str = "not_found_error";
pub const REQUEST_TOO_LARGE: &str = "request_too_large";
pub const RATE_LIMIT_ERROR: &str = "rate_limit_error";
pub const OVERLOADED_ERROR: &str = "overloaded_error";
pub const API_ERROR: &str = "api_error";
pub const TIMEOUT_ERROR: &str = "timeout_error";
pub const CONNECTION_ERROR: &str = "connection_error";
pub const DECODE_ERROR: &str = "decode_error";

/// Failures that end a request with an error envelope.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Authentication(String),

    #[error("Upstream request timed out: {0}")]
    UpstreamTimeout(String),

    #[error("Failed to connect to upstream: {0}")]
    UpstreamConnection(String),

    #[error("{message}")]
    UpstreamStatus { status: StatusCode, message: String },

    #[error("Failed to decode upstream response: {0}")]
    UpstreamProtocol(String),
}

impl ProxyError {
    pub fn validation(message: impl Into<String>) -> Self {
        ProxyError::Validation(message.into())
    }

    /// Classifies a reqwest failure that happened before or while reading a body.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::UpstreamTimeout(err.to_string())
        } else if err.is_decode() {
            ProxyError::UpstreamProtocol(err.to_string())
        } else {
            ProxyError::UpstreamConnection(err.to_string())
        }
    }

    /// Builds the error for a non-2xx backend reply, preferring the backend's
    /// own `error.message` over the raw body.
    pub fn from_upstream_body(status: StatusCode, body: &str) -> Self {
        let parsed = serde_json::from_str::<Value>(body).ok();
        let message = parsed
            .as_ref()
            .and_then(error_message_from_value)
            .or_else(|| {
                let trimmed = body.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            })
            .unwrap_or_else(|| format!("Upstream API error ({})", status.as_u16()));
        ProxyError::UpstreamStatus { status, message }
    }

    /// An `error` object found inside a backend stream chunk.
    pub fn from_stream_error(value: &Value) -> Self {
        let status = value
            .get("code")
            .and_then(Value::as_u64)
            .and_then(|code| u16::try_from(code).ok())
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let message = error_message_from_value(&serde_json::json!({ "error": value }))
            .unwrap_or_else(|| value.to_string());
        ProxyError::UpstreamStatus { status, message }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Validation(_) => StatusCode::BAD_REQUEST,
            ProxyError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamConnection(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamStatus { status, .. } => *status,
            ProxyError::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Validation(_) => INVALID_REQUEST_ERROR,
            ProxyError::Authentication(_) => AUTHENTICATION_ERROR,
            ProxyError::UpstreamTimeout(_) => TIMEOUT_ERROR,
            ProxyError::UpstreamConnection(_) => CONNECTION_ERROR,
            ProxyError::UpstreamStatus { status, .. } => error_type_for_status(*status),
            ProxyError::UpstreamProtocol(_) => DECODE_ERROR,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error_type: self.error_type().to_string(),
            message: self.to_string(),
        }
    }
}

fn error_message_from_value(value: &Value) -> Option<String> {
    let error = value.get("error")?;
    match error {
        Value::String(message) => Some(message.clone()),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn error_type_for_status(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => INVALID_REQUEST_ERROR,
        401 => AUTHENTICATION_ERROR,
        403 => PERMISSION_ERROR,
        404 => NOT_FOUND_ERROR,
        413 => REQUEST_TOO_LARGE,
        429 => RATE_LIMIT_ERROR,
        503 | 529 => OVERLOADED_ERROR,
        _ => API_ERROR,
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "request rejected");
        }
        let envelope = ErrorEnvelope {
            envelope_type: "error".to_string(),
            error: self.to_body(),
        };
        (status, Json(envelope)).into_response()
    }
}

/// Tool-call arguments that cannot become a `tool_use` input object.
#[derive(Error, Debug)]
pub enum ToolArgumentError {
    #[error("tool arguments are not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("tool arguments must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}
