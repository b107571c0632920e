//! Audit entry types (spec.md §3 data model: "Audit entry").

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Outcome recorded against an audited action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Ok,
    Denied,
    Error,
}

impl std::fmt::Display for AuditResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Denied => write!(f, "denied"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A single append-only audit record.
///
/// `seq`, `prev`, `hash` and `sig` are assigned by [`super::chain::AuditChain`]
/// when the entry is sealed — callers only need to fill in the remaining
/// fields via [`AuditEntry::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub date: NaiveDate,
    pub prev: String,
    pub request_id: Option<String>,
    pub client_fingerprint: Option<String>,
    /// Subsystem that produced the entry, e.g. `"auth"`, `"rag"`, `"sandbox"`.
    pub agent: String,
    pub action: String,
    pub target: Option<String>,
    pub result: AuditResult,
    pub user_id: Option<String>,
    #[serde(default = "default_meta")]
    pub meta: serde_json::Value,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub sig: String,
}

fn default_meta() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl AuditEntry {
    pub fn new(agent: impl Into<String>, action: impl Into<String>, result: AuditResult) -> Self {
        let now = Utc::now();
        Self {
            seq: 0,
            timestamp: now,
            date: now.date_naive(),
            prev: String::new(),
            request_id: None,
            client_fingerprint: None,
            agent: agent.into(),
            action: action.into(),
            target: None,
            result,
            user_id: None,
            meta: default_meta(),
            hash: String::new(),
            sig: String::new(),
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_client_fingerprint(mut self, fp: impl Into<String>) -> Self {
        self.client_fingerprint = Some(fp.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }

    /// The canonical payload hashed into `hash`: every field except `hash`
    /// and `sig` itself, serialized with sorted keys (serde_json's default
    /// map representation is a `BTreeMap`, so key order is deterministic).
    pub(crate) fn canonical_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "seq": self.seq,
            "timestamp": self.timestamp,
            "date": self.date,
            "prev": self.prev,
            "request_id": self.request_id,
            "client_fingerprint": self.client_fingerprint,
            "agent": self.agent,
            "action": self.action,
            "target": self.target,
            "result": self.result,
            "user_id": self.user_id,
            "meta": self.meta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_has_empty_chain_fields() {
        let entry = AuditEntry::new("auth", "session_created", AuditResult::Ok);
        assert_eq!(entry.seq, 0);
        assert!(entry.hash.is_empty());
        assert!(entry.prev.is_empty());
    }

    #[test]
    fn canonical_payload_excludes_hash_and_sig() {
        let entry = AuditEntry::new("rag", "query", AuditResult::Ok).with_target("edubba");
        let payload = entry.canonical_payload();
        assert!(payload.get("hash").is_none());
        assert!(payload.get("sig").is_none());
        assert_eq!(payload["target"], "edubba");
    }

    #[test]
    fn result_display() {
        assert_eq!(AuditResult::Ok.to_string(), "ok");
        assert_eq!(AuditResult::Denied.to_string(), "denied");
        assert_eq!(AuditResult::Error.to_string(), "error");
    }
}
