//! Per-tier quota gate and anonymous guest bucket (spec.md §4.3).
//!
//! Counters are buffered in memory and flushed to a single JSON file under
//! the data root on a timer and at shutdown — same durable-then-buffered
//! shape as the audit chain's head file, scaled down since exact counting
//! isn't required (spec.md §5: "last-writer-wins within a flush window").

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::config::{GuestConfig, TierLimits, TiersConfig};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QuotaAction {
    Chat,
    Image,
    Shell,
    FileEdit,
}

impl QuotaAction {
    fn name(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Image => "image",
            Self::Shell => "shell",
            Self::FileEdit => "file_edit",
        }
    }

    /// Periods this action is gated against, most-restrictive first for
    /// reporting purposes (chat has both a weekly ceiling and a daily soft
    /// cap within it).
    fn periods(&self) -> &'static [Period] {
        match self {
            Self::Chat => &[Period::Day, Period::Week],
            Self::Image => &[Period::Week],
            Self::Shell => &[Period::Hour],
            Self::FileEdit => &[Period::Hour],
        }
    }

    fn limit(&self, limits: &TierLimits, period: Period) -> u64 {
        match (self, period) {
            (Self::Chat, Period::Week) => limits.chat_per_week,
            (Self::Chat, Period::Day) => limits.chat_per_day,
            (Self::Image, Period::Week) => limits.image_per_week,
            (Self::Shell, Period::Hour) => limits.shell_per_hour,
            (Self::FileEdit, Period::Hour) => limits.file_edit_per_hour,
            _ => u64::MAX,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Period {
    Hour,
    Day,
    Week,
}

impl Period {
    fn secs(self) -> i64 {
        match self {
            Self::Hour => 3_600,
            Self::Day => 86_400,
            Self::Week => 604_800,
        }
    }

    /// `floor(now / periodLength)`, per spec.md §3 "Quota counter".
    fn key(self, now_unix: i64) -> i64 {
        now_unix.div_euclid(self.secs())
    }

    fn reset_secs(self, now_unix: i64) -> u64 {
        let period_end = (self.key(now_unix) + 1) * self.secs();
        (period_end - now_unix).max(0) as u64
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QuotaStatus {
    pub allowed: bool,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_secs: u64,
}

fn composite_key(user_id: &str, action: QuotaAction, period: Period, period_key: i64) -> String {
    format!("{user_id}:{}:{:?}:{period_key}", action.name(), period)
}

#[derive(Default)]
struct GuestBucket {
    count: u64,
    first_seen_unix: i64,
}

/// Buffered per-tier/guest quota counters, flushed to `{root}/counters.json`.
pub struct QuotaService {
    root: PathBuf,
    tiers: TiersConfig,
    guest: GuestConfig,
    durable: DashMap<String, u64>,
    deltas: DashMap<String, AtomicU64>,
    guest_buckets: DashMap<String, GuestBucket>,
    concurrency: DashMap<String, AtomicU64>,
    flush_lock: Mutex<()>,
}

impl QuotaService {
    pub fn new(root: impl Into<PathBuf>, tiers: TiersConfig, guest: GuestConfig) -> Self {
        Self {
            root: root.into(),
            tiers,
            guest,
            durable: DashMap::new(),
            deltas: DashMap::new(),
            guest_buckets: DashMap::new(),
            concurrency: DashMap::new(),
            flush_lock: Mutex::new(()),
        }
    }

    fn counters_path(&self) -> PathBuf {
        self.root.join("counters.json")
    }

    /// Load the durable counter snapshot from disk; missing file is treated
    /// as an empty snapshot (first run).
    pub async fn load(&self) -> Result<()> {
        match fs::read_to_string(self.counters_path()).await {
            Ok(contents) => {
                let map: HashMap<String, u64> = serde_json::from_str(&contents)
                    .map_err(|e| Error::Internal(format!("corrupt quota counters: {e}")))?;
                for (k, v) in map {
                    self.durable.insert(k, v);
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn tier_limits(&self, tier: &str) -> &TierLimits {
        self.tiers.for_tier(tier)
    }

    fn effective_count(&self, key: &str) -> u64 {
        let durable = self.durable.get(key).map(|v| *v).unwrap_or(0);
        let delta = self.deltas.get(key).map(|d| d.load(Ordering::SeqCst)).unwrap_or(0);
        durable + delta
    }

    /// Read-only: does not mutate state. Returns the most-restrictive period
    /// status among those gating `action` (spec.md §4.3: "chat per week,
    /// chat per day (soft cap within weekly)").
    pub fn check_quota(&self, user_id: &str, tier: &str, action: QuotaAction) -> QuotaStatus {
        let limits = self.tier_limits(tier);
        let now = Utc::now().timestamp();

        let mut tightest: Option<QuotaStatus> = None;
        for &period in action.periods() {
            let limit = action.limit(limits, period);
            let key = composite_key(user_id, action, period, period.key(now));
            let used = self.effective_count(&key);
            let remaining = limit.saturating_sub(used);
            let status = QuotaStatus {
                allowed: used < limit,
                used,
                limit,
                remaining,
                reset_secs: period.reset_secs(now),
            };
            tightest = match tightest {
                Some(best) if best.allowed && !status.allowed => Some(status),
                Some(best) if !best.allowed => Some(best),
                Some(best) if status.remaining < best.remaining => Some(status),
                Some(best) => Some(best),
                None => Some(status),
            };
        }
        tightest.expect("QuotaAction::periods() is never empty")
    }

    /// Record one unit of usage against every period the action is gated by.
    /// Called only on success, never speculatively (spec.md §4.3).
    pub fn record_usage(&self, user_id: &str, action: QuotaAction) {
        let now = Utc::now().timestamp();
        for &period in action.periods() {
            let key = composite_key(user_id, action, period, period.key(now));
            self.deltas.entry(key).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Upsert-add flush: post-flush durable count is exactly `c + delta`
    /// regardless of scheduling (spec.md §8 invariant 9).
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;

        let drained: Vec<(String, u64)> = self
            .deltas
            .iter()
            .map(|e| (e.key().clone(), e.value().swap(0, Ordering::SeqCst)))
            .filter(|(_, delta)| *delta > 0)
            .collect();

        for (key, delta) in &drained {
            *self.durable.entry(key.clone()).or_insert(0) += delta;
        }

        if drained.is_empty() {
            return Ok(());
        }

        let snapshot: HashMap<String, u64> =
            self.durable.iter().map(|e| (e.key().clone(), *e.value())).collect();
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| Error::Internal(format!("failed to serialize quota counters: {e}")))?;

        fs::create_dir_all(&self.root).await?;
        let tmp = self.counters_path().with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes()).await?;
        fs::rename(&tmp, self.counters_path()).await?;
        Ok(())
    }

    /// Acquire a concurrency slot for `user_id`; releases automatically when
    /// the returned guard drops.
    pub fn try_acquire_concurrency(&self, user_id: &str, tier: &str) -> Result<ConcurrencySlot<'_>> {
        let limit = self.tier_limits(tier).max_concurrent;
        let counter = self.concurrency.entry(user_id.to_string()).or_insert_with(|| AtomicU64::new(0));
        let current = counter.fetch_add(1, Ordering::SeqCst);
        if current >= limit {
            counter.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::QuotaExceeded {
                tier: tier.to_string(),
                action: "concurrent_requests".into(),
                used: current,
                limit,
                reset_secs: 0,
            });
        }
        Ok(ConcurrencySlot { service: self, user_id: user_id.to_string() })
    }

    /// Check the anonymous guest bucket for `fingerprint` without consuming it.
    pub fn check_guest(&self, fingerprint: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        if let Some(bucket) = self.guest_buckets.get(fingerprint) {
            if now - bucket.first_seen_unix > self.guest.window_secs as i64 {
                return Ok(());
            }
            if bucket.count >= self.guest.limit {
                let reset_secs = (bucket.first_seen_unix + self.guest.window_secs as i64 - now).max(0) as u64;
                return Err(Error::GuestQuotaExceeded { reset_secs });
            }
        }
        Ok(())
    }

    /// Consume one guest message. Called only after a request has
    /// successfully streamed (spec.md §4.3).
    pub fn consume_guest(&self, fingerprint: &str) {
        let now = Utc::now().timestamp();
        let mut bucket = self.guest_buckets.entry(fingerprint.to_string()).or_default();
        if now - bucket.first_seen_unix > self.guest.window_secs as i64 {
            bucket.count = 0;
            bucket.first_seen_unix = now;
        }
        bucket.count += 1;
    }

    /// Current guest usage count within the active window, for the
    /// `guest_quota` SSE event (spec.md §6). Zero if the window has lapsed
    /// or no bucket exists yet.
    pub fn guest_used(&self, fingerprint: &str) -> u64 {
        let now = Utc::now().timestamp();
        match self.guest_buckets.get(fingerprint) {
            Some(bucket) if now - bucket.first_seen_unix <= self.guest.window_secs as i64 => bucket.count,
            _ => 0,
        }
    }

    /// Lazily evict guest buckets whose window has elapsed.
    pub fn sweep_guest_buckets(&self) {
        let now = Utc::now().timestamp();
        let window = self.guest.window_secs as i64;
        self.guest_buckets.retain(|_, bucket| now - bucket.first_seen_unix <= window);
    }
}

/// RAII concurrency-slot guard; decrements the per-user counter on drop.
pub struct ConcurrencySlot<'a> {
    service: &'a QuotaService,
    user_id: String,
}

impl Drop for ConcurrencySlot<'_> {
    fn drop(&mut self) {
        if let Some(counter) = self.service.concurrency.get(&self.user_id) {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuestConfig;

    fn service(dir: &std::path::Path) -> QuotaService {
        QuotaService::new(dir, TiersConfig::default(), GuestConfig { window_secs: 60, limit: 2 })
    }

    #[test]
    fn check_quota_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let before = svc.check_quota("u1", "free", QuotaAction::Chat);
        let after = svc.check_quota("u1", "free", QuotaAction::Chat);
        assert_eq!(before.used, after.used);
    }

    #[test]
    fn record_usage_increments_effective_count() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.record_usage("u1", QuotaAction::Chat);
        let status = svc.check_quota("u1", "free", QuotaAction::Chat);
        assert_eq!(status.used, 1);
    }

    #[tokio::test]
    async fn flush_is_upsert_add() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.record_usage("u1", QuotaAction::Shell);
        svc.record_usage("u1", QuotaAction::Shell);
        svc.flush().await.unwrap();
        svc.record_usage("u1", QuotaAction::Shell);
        svc.flush().await.unwrap();

        let status = svc.check_quota("u1", "pro", QuotaAction::Shell);
        assert_eq!(status.used, 3);
    }

    #[test]
    fn guest_bucket_gates_after_limit() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.check_guest("fp1").unwrap();
        svc.consume_guest("fp1");
        svc.check_guest("fp1").unwrap();
        svc.consume_guest("fp1");
        assert!(svc.check_guest("fp1").is_err());
    }

    #[test]
    fn concurrency_slot_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        {
            let _slot = svc.try_acquire_concurrency("u1", "free").unwrap();
            assert!(svc.try_acquire_concurrency("u1", "free").is_err());
        }
        assert!(svc.try_acquire_concurrency("u1", "free").is_ok());
    }
}
