//! Append-only JSONL audit storage (spec.md §6: `audit/audit_chain_{YYYYMMDD}.jsonl`,
//! `audit/audit_chain_head.json`, `audit/seal_{YYYYMMDD}.json`).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::event::AuditEntry;
use crate::error::{Error, Result};

#[async_trait]
pub trait AuditStorage: Send + Sync {
    /// Append a sealed entry to the current day's file and rewrite the head
    /// file atomically.
    async fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// Load the persisted head (`hash`, `seq`) if one exists.
    async fn load_head(&self) -> Result<Option<AuditHead>>;

    /// Load every entry for `date`, in `seq` order.
    async fn load_day(&self, date: NaiveDate) -> Result<Vec<AuditEntry>>;

    /// Load the most recent `limit` entries across days, newest last.
    async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>>;

    /// Every day that has a chain file, ascending (spec.md §4.1:
    /// `verifyAll` "runs verifyChain over every day file in chronological
    /// order").
    async fn list_days(&self) -> Result<Vec<NaiveDate>>;

    /// Seal a day's file by recording its final hash/seq into
    /// `seal_{YYYYMMDD}.json`.
    async fn seal_day(&self, date: NaiveDate) -> Result<()>;

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditHead {
    pub hash: String,
    pub seq: u64,
}

/// File-backed implementation rooted at `<data_root>/audit/`.
pub struct FileAuditStorage {
    root: PathBuf,
}

impl FileAuditStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn day_path(&self, date: NaiveDate) -> PathBuf {
        self.root.join(format!("audit_chain_{}.jsonl", date.format("%Y%m%d")))
    }

    fn head_path(&self) -> PathBuf {
        self.root.join("audit_chain_head.json")
    }

    fn seal_path(&self, date: NaiveDate) -> PathBuf {
        self.root.join(format!("seal_{}.json", date.format("%Y%m%d")))
    }

    async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn read_lines(path: &Path) -> Result<Vec<AuditEntry>> {
        match fs::read_to_string(path).await {
            Ok(contents) => contents
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(|line| {
                    serde_json::from_str(line)
                        .map_err(|e| Error::Internal(format!("corrupt audit line: {e}")))
                })
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl AuditStorage for FileAuditStorage {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.ensure_root().await?;

        let line = serde_json::to_string(entry)
            .map_err(|e| Error::Internal(format!("failed to serialize audit entry: {e}")))?;

        let path = self.day_path(entry.date);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        // Atomic head rewrite: write to a temp file then rename.
        let head = AuditHead { hash: entry.hash.clone(), seq: entry.seq };
        let head_json = serde_json::to_string_pretty(&head)
            .map_err(|e| Error::Internal(format!("failed to serialize audit head: {e}")))?;
        let tmp_path = self.head_path().with_extension("json.tmp");
        fs::write(&tmp_path, head_json.as_bytes()).await?;
        fs::rename(&tmp_path, self.head_path()).await?;

        Ok(())
    }

    async fn load_head(&self) -> Result<Option<AuditHead>> {
        match fs::read_to_string(self.head_path()).await {
            Ok(contents) => {
                let head = serde_json::from_str(&contents)
                    .map_err(|e| Error::Internal(format!("corrupt audit head file: {e}")))?;
                Ok(Some(head))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_day(&self, date: NaiveDate) -> Result<Vec<AuditEntry>> {
        Self::read_lines(&self.day_path(date)).await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let today = Utc::now().date_naive();
        let mut collected = Vec::new();
        let mut date = today;

        loop {
            let mut day_entries = self.load_day(date).await?;
            day_entries.reverse();
            collected.extend(day_entries);
            if collected.len() >= limit {
                break;
            }
            date = match date.pred_opt() {
                Some(d) => d,
                None => break,
            };
            // Bound the scan: 30 days is generous for a "recent" query.
            if (today - date).num_days() > 30 {
                break;
            }
        }

        collected.truncate(limit);
        collected.reverse();
        Ok(collected)
    }

    async fn seal_day(&self, date: NaiveDate) -> Result<()> {
        let entries = self.load_day(date).await?;
        let Some(last) = entries.last() else {
            return Ok(());
        };
        let seal = AuditHead { hash: last.hash.clone(), seq: last.seq };
        let json = serde_json::to_string_pretty(&seal)
            .map_err(|e| Error::Internal(format!("failed to serialize seal: {e}")))?;
        fs::write(self.seal_path(date), json.as_bytes()).await?;
        Ok(())
    }

    async fn list_days(&self) -> Result<Vec<NaiveDate>> {
        self.ensure_root().await?;
        let mut days = Vec::new();

        let mut read_dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(date_str) = name.strip_prefix("audit_chain_").and_then(|s| s.strip_suffix(".jsonl")) else {
                continue;
            };
            if let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y%m%d") {
                days.push(date);
            }
        }
        days.sort_unstable();
        Ok(days)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.ensure_root().await?;
        let cutoff_date = cutoff.date_naive();
        let mut purged = 0u64;

        let mut read_dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(date_str) = name
                .strip_prefix("audit_chain_")
                .and_then(|s| s.strip_suffix(".jsonl"))
            else {
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y%m%d") else { continue };
            if date < cutoff_date {
                let count = self.load_day(date).await?.len() as u64;
                fs::remove_file(entry.path()).await?;
                purged += count;
            }
        }

        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::chain::AuditChain;
    use crate::audit::event::AuditResult;

    #[tokio::test]
    async fn append_then_load_day_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileAuditStorage::new(dir.path());
        let mut chain = AuditChain::genesis(None);

        let e1 = chain.seal(AuditEntry::new("auth", "login", AuditResult::Ok));
        storage.append(&e1).await.unwrap();

        let loaded = storage.load_day(e1.date).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].hash, e1.hash);
    }

    #[tokio::test]
    async fn head_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileAuditStorage::new(dir.path());
        let mut chain = AuditChain::genesis(None);

        let e1 = chain.seal(AuditEntry::new("auth", "login", AuditResult::Ok));
        storage.append(&e1).await.unwrap();

        let head = storage.load_head().await.unwrap().unwrap();
        assert_eq!(head.hash, e1.hash);
        assert_eq!(head.seq, 1);
    }

    #[tokio::test]
    async fn list_days_returns_ascending_dates() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileAuditStorage::new(dir.path());
        let mut chain = AuditChain::genesis(None);

        let mut older = AuditEntry::new("auth", "login", AuditResult::Ok);
        older.date = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let e1 = chain.seal(older);
        storage.append(&e1).await.unwrap();

        let mut newer = AuditEntry::new("auth", "login", AuditResult::Ok);
        newer.date = NaiveDate::from_ymd_opt(2026, 1, 3).unwrap();
        let e2 = chain.seal(newer);
        storage.append(&e2).await.unwrap();

        let days = storage.list_days().await.unwrap();
        assert_eq!(days, vec![NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(), NaiveDate::from_ymd_opt(2026, 1, 3).unwrap()]);
    }

    #[tokio::test]
    async fn purge_before_removes_old_days() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileAuditStorage::new(dir.path());
        let old_date = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        let mut entry = AuditEntry::new("auth", "login", AuditResult::Ok);
        entry.date = old_date;
        entry.seq = 1;
        entry.hash = "deadbeef".into();
        entry.sig = "sig".into();
        storage.append(&entry).await.unwrap();

        let purged = storage.purge_before(Utc::now()).await.unwrap();
        assert_eq!(purged, 1);
        assert!(storage.load_day(old_date).await.unwrap().is_empty());
    }
}
