//! Type-safe, prefixed, time-sortable identifiers built on UUIDv7.
//!
//! Request IDs are `req_<uuidv7>`; the same shape is reused by callers that
//! need their own prefixed ids (session, run, workspace) by calling
//! [`prefixed_id`] directly.

use http::Request;
use std::fmt;
use std::str::FromStr;
use tower_http::request_id::{MakeRequestId, RequestId as TowerRequestId};
use uuid::Uuid;

/// Build a prefixed, time-sortable identifier, e.g. `prefixed_id("run")` ->
/// `run_01969f3e-...`.
pub fn prefixed_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7())
}

/// A type-safe request identifier for distributed tracing (`req_<uuidv7>`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub const PREFIX: &'static str = "req";

    #[must_use]
    pub fn new() -> Self {
        Self(prefixed_id(Self::PREFIX))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        self.0.split('_').next().unwrap_or_default()
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = RequestIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((prefix, _)) = s.split_once('_') else {
            return Err(RequestIdError::InvalidFormat(s.to_string()));
        };
        if prefix != Self::PREFIX {
            return Err(RequestIdError::InvalidPrefix {
                expected: Self::PREFIX.to_string(),
                actual: prefix.to_string(),
            });
        }
        Ok(Self(s.to_string()))
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<RequestId> for String {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestIdError {
    #[error("invalid request id format: {0}")]
    InvalidFormat(String),

    #[error("invalid prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix { expected: String, actual: String },
}

/// A `MakeRequestId` implementation plugging [`RequestId`] into tower-http.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeTypedRequestId;

impl MakeRequestId for MakeTypedRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<TowerRequestId> {
        let id = RequestId::new();
        let header_value = http::HeaderValue::from_str(id.as_str()).ok()?;
        Some(TowerRequestId::new(header_value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_round_trips() {
        let id = RequestId::new();
        assert!(id.as_str().starts_with("req_"));
        let parsed = RequestId::from_str(id.as_str()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn rejects_wrong_prefix() {
        let err = RequestId::from_str("user_deadbeef").unwrap_err();
        assert!(matches!(err, RequestIdError::InvalidPrefix { .. }));
    }

    #[test]
    fn ids_are_time_ordered() {
        let a = prefixed_id("run");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = prefixed_id("run");
        assert!(a < b);
    }
}
