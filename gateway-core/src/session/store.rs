//! File-backed session records, one JSON file per session id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

use super::csrf::CsrfToken;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::ids::prefixed_id;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: Option<String>,
    pub tier: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub csrf_token: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

pub struct SessionStore {
    root: PathBuf,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>, config: SessionConfig) -> Self {
        Self { root: root.into(), config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.json"))
    }

    pub async fn create(&self, user_id: Option<String>, tier: impl Into<String>) -> Result<SessionRecord> {
        fs::create_dir_all(&self.root).await?;
        let now = Utc::now();
        let record = SessionRecord {
            id: prefixed_id("sess"),
            user_id,
            tier: tier.into(),
            created_at: now,
            last_seen_at: now,
            csrf_token: CsrfToken::generate().into_inner(),
            data: serde_json::Value::Object(Default::default()),
        };
        self.persist(&record).await?;
        Ok(record)
    }

    pub async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        match fs::read_to_string(self.path(session_id)).await {
            Ok(contents) => {
                let record: SessionRecord = serde_json::from_str(&contents)
                    .map_err(|e| Error::Internal(format!("corrupt session record: {e}")))?;
                if self.is_expired(&record) {
                    let _ = self.destroy(session_id).await;
                    return Ok(None);
                }
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Slide the session's `last_seen_at` forward; enforced against
    /// `abs_max_secs` by [`Self::is_expired`] on the next load.
    pub async fn touch(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let Some(mut record) = self.load(session_id).await? else { return Ok(None) };
        record.last_seen_at = Utc::now();
        self.persist(&record).await?;
        Ok(Some(record))
    }

    pub async fn save(&self, record: &SessionRecord) -> Result<()> {
        self.persist(record).await
    }

    pub async fn destroy(&self, session_id: &str) -> Result<()> {
        match fs::remove_file(self.path(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_expired(&self, record: &SessionRecord) -> bool {
        let now = Utc::now();
        let age = (now - record.created_at).num_seconds().max(0) as u64;
        let idle = (now - record.last_seen_at).num_seconds().max(0) as u64;
        age > self.config.abs_max_secs || idle > self.config.inactivity_secs
    }

    async fn persist(&self, record: &SessionRecord) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| Error::Internal(format!("failed to serialize session: {e}")))?;
        let tmp = self.path(&record.id).with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes()).await?;
        fs::rename(&tmp, self.path(&record.id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            cookie_name: "kuro_sid".into(),
            slide_secs: 3600,
            abs_max_secs: 30 * 24 * 3600,
            inactivity_secs: 7200,
            legacy_token_enabled: false,
        }
    }

    #[tokio::test]
    async fn create_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), config());
        let created = store.create(Some("u1".into()), "pro").await.unwrap();

        let loaded = store.load(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded.user_id, Some("u1".into()));
        assert_eq!(loaded.tier, "pro");
    }

    #[tokio::test]
    async fn destroy_removes_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), config());
        let created = store.create(None, "free").await.unwrap();
        store.destroy(&created.id).await.unwrap();
        assert!(store.load(&created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_session_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.inactivity_secs = 0;
        let store = SessionStore::new(dir.path(), cfg);
        let mut created = store.create(None, "free").await.unwrap();
        created.last_seen_at = Utc::now() - chrono::Duration::seconds(10);
        store.save(&created).await.unwrap();

        assert!(store.load(&created.id).await.unwrap().is_none());
    }
}
