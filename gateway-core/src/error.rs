//! Error types and HTTP response conversion.
//!
//! The taxonomy follows the gateway's error design: validation, authentication,
//! authorization, quota/tier, policy block, upstream, integrity, internal.
//! SSE routes never surface a bare HTTP error after switching to
//! `text/event-stream` — callers there should use [`Error::to_sse_event`]
//! instead of `IntoResponse`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (figment layering, missing required value).
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// JWT decoding/validation error (legacy bearer-token path).
    #[error("JWT error: {0}")]
    Jwt(Box<jsonwebtoken::errors::Error>),

    /// HTTP error constructing a response.
    #[error("HTTP error: {0}")]
    Http(Box<axum::http::Error>),

    /// I/O error (filesystem stores, audit log, sandbox workspace).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No resolvable caller.
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Caller lacks the required capability, tier, or role.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed body, bad path, unknown action.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Validation error with a structured list of field errors.
    #[error("Validation error: {0:?}")]
    Validation(Vec<String>),

    /// Quota or tier limit exhausted.
    #[error("Quota exceeded for {action} (tier {tier}): {used}/{limit}")]
    QuotaExceeded {
        tier: String,
        action: String,
        used: u64,
        limit: u64,
        reset_secs: u64,
    },

    /// Guest-bucket window exhausted.
    #[error("Guest quota exhausted, resets in {reset_secs}s")]
    GuestQuotaExceeded { reset_secs: u64 },

    /// Safety/content-policy denial. Never carries partial content.
    #[error("Blocked by policy: {0}")]
    PolicyBlocked(String),

    /// A connector read fell outside an allowed scope.
    #[error("Read denied: {0}")]
    ReadDenied(String),

    /// A path resolved outside its sandboxed root (upload, sandbox, artifact).
    #[error("Path traversal rejected: {0}")]
    PathTraversal(String),

    /// A shell command matched a denylist pattern or exceeded its allowlist.
    #[error("Command blocked: {0}")]
    CommandBlocked(String),

    /// Backend (LLM inference) or frontier provider unreachable or erroring.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Resource conflict.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Audit chain integrity failure (hash or signature mismatch).
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// Rate limit exceeded (global per-IP limiter, not the tier quota gate).
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Sandbox run failure, mapped to a terminal run state rather than propagated.
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Unexpected internal failure.
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
            errors: None,
            status: status.as_u16(),
        }
    }

    pub fn with_code(status: StatusCode, code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: Some(code.into()),
            errors: None,
            status: status.as_u16(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error {
    /// Category name used for audit metadata and SSE `error`/`blocked`/`gate` events.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::Internal(_) | Error::Http(_) | Error::Io(_) => "internal",
            Error::Jwt(_) | Error::Unauthorized(_) => "authentication",
            Error::Forbidden(_) => "authorization",
            Error::NotFound(_) => "not_found",
            Error::BadRequest(_) | Error::Validation(_) => "validation",
            Error::QuotaExceeded { .. } | Error::GuestQuotaExceeded { .. } | Error::RateLimitExceeded => {
                "quota"
            }
            Error::PolicyBlocked(_) | Error::CommandBlocked(_) => "policy",
            Error::ReadDenied(_) | Error::PathTraversal(_) => "access",
            Error::Upstream(_) => "upstream",
            Error::Conflict(_) => "conflict",
            Error::Integrity(_) => "integrity",
            Error::Sandbox(_) => "sandbox",
        }
    }

    /// Render this error as an SSE payload (`gate`, `blocked`, or `error` frame),
    /// used by the streaming orchestrator once headers have already switched to
    /// `text/event-stream` and a plain HTTP status can no longer be returned.
    pub fn to_sse_event(&self) -> serde_json::Value {
        match self {
            Error::QuotaExceeded {
                tier,
                used,
                limit,
                reset_secs,
                ..
            } => json!({
                "type": "gate",
                "tier": tier,
                "used": used,
                "limit": limit,
                "remaining": limit.saturating_sub(*used),
                "reset_secs": reset_secs,
            }),
            Error::GuestQuotaExceeded { reset_secs } => json!({
                "type": "guest_quota",
                "remaining": 0,
                "reset_secs": reset_secs,
            }),
            Error::PolicyBlocked(reason) => json!({
                "type": "blocked",
                "reason": reason,
            }),
            Error::Unauthorized(msg) => json!({
                "type": "gate",
                "reason": msg,
            }),
            other => json!({
                "type": "error",
                "message": other.to_string(),
            }),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Error::Config(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR", e.to_string()),
            ),
            Error::Jwt(e) => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::with_code(StatusCode::UNAUTHORIZED, "INVALID_TOKEN", e.to_string()),
            ),
            Error::Http(e) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_code(StatusCode::BAD_REQUEST, "HTTP_ERROR", e.to_string()),
            ),
            Error::Io(e) => {
                tracing::error!("I/O error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", "I/O operation failed"),
                )
            }
            Error::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::with_code(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            ),
            Error::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                ErrorResponse::with_code(StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
            ),
            Error::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::with_code(StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ),
            Error::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_code(StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ),
            Error::Validation(errors) => {
                let mut body = ErrorResponse::with_code(
                    StatusCode::BAD_REQUEST,
                    "VALIDATION_ERROR",
                    "Request failed validation",
                );
                body.errors = Some(errors.clone());
                (StatusCode::BAD_REQUEST, body)
            }
            Error::QuotaExceeded { tier, action, used, limit, .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorResponse::with_code(
                    StatusCode::TOO_MANY_REQUESTS,
                    "QUOTA_EXCEEDED",
                    format!("{tier} quota for {action} exhausted ({used}/{limit})"),
                ),
            ),
            Error::GuestQuotaExceeded { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorResponse::with_code(StatusCode::TOO_MANY_REQUESTS, "GUEST_QUOTA_EXCEEDED", "demo limit reached"),
            ),
            Error::PolicyBlocked(msg) => (
                StatusCode::FORBIDDEN,
                ErrorResponse::with_code(StatusCode::FORBIDDEN, "POLICY_BLOCKED", msg.clone()),
            ),
            Error::ReadDenied(msg) => (
                StatusCode::FORBIDDEN,
                ErrorResponse::with_code(StatusCode::FORBIDDEN, "READ_DENIED", msg.clone()),
            ),
            Error::PathTraversal(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_code(StatusCode::BAD_REQUEST, "PATH_TRAVERSAL", msg.clone()),
            ),
            Error::CommandBlocked(msg) => (
                StatusCode::FORBIDDEN,
                ErrorResponse::with_code(StatusCode::FORBIDDEN, "COMMAND_BLOCKED", msg.clone()),
            ),
            Error::Upstream(msg) => {
                tracing::error!("Upstream error: {msg}");
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorResponse::with_code(StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", "Backend temporarily unavailable"),
                )
            }
            Error::Conflict(msg) => (
                StatusCode::CONFLICT,
                ErrorResponse::with_code(StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            ),
            Error::Integrity(msg) => {
                tracing::error!(security_event = true, "Integrity violation: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "INTEGRITY_VIOLATION", "Integrity check failed"),
                )
            }
            Error::RateLimitExceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorResponse::with_code(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMIT_EXCEEDED", "Too many requests"),
            ),
            Error::Sandbox(msg) => (
                StatusCode::BAD_GATEWAY,
                ErrorResponse::with_code(StatusCode::BAD_GATEWAY, "SANDBOX_ERROR", msg.clone()),
            ),
            Error::Internal(msg) => {
                tracing::error!("Internal error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "Internal server error"),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Error::Jwt(Box::new(err))
    }
}

impl From<axum::http::Error> for Error {
    fn from(err: axum::http::Error) -> Self {
        Error::Http(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_basic() {
        let err = ErrorResponse::new(StatusCode::NOT_FOUND, "User not found");
        assert_eq!(err.status, 404);
        assert!(err.code.is_none());
    }

    #[test]
    fn quota_exceeded_maps_to_429() {
        let err = Error::QuotaExceeded {
            tier: "free".into(),
            action: "chat".into(),
            used: 10,
            limit: 10,
            reset_secs: 3600,
        };
        assert_eq!(err.category(), "quota");
        let event = err.to_sse_event();
        assert_eq!(event["type"], "gate");
        assert_eq!(event["remaining"], 0);
    }

    #[test]
    fn policy_blocked_event_has_no_partial_content_field() {
        let err = Error::PolicyBlocked("denylist_match".into());
        let event = err.to_sse_event();
        assert_eq!(event["type"], "blocked");
        assert_eq!(event["reason"], "denylist_match");
    }
}
