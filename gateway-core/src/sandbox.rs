//! Budgeted isolated code execution: workspaces, runs, and artifact
//! serving (spec.md §4.10).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::ids::prefixed_id;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Done,
    Failed,
    Killed,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunBudget {
    pub runtime_secs: u64,
    pub memory_mb: u64,
    pub output_bytes: u64,
    pub files_touched: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRun {
    pub run_id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub status: RunStatus,
    pub entrypoint: String,
    pub exit_code: Option<i32>,
    pub budget: RunBudget,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub logs: String,
}

impl SandboxRun {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RunStatus::Done | RunStatus::Failed | RunStatus::Killed | RunStatus::Timeout)
    }
}

/// Seam over the external sidecar that actually executes code (spec.md
/// §4.10: "delegates to an external sidecar that returns immediately with a
/// sidecar run id").
#[async_trait]
pub trait SandboxSidecar: Send + Sync {
    async fn dispatch(&self, run: &SandboxRun, workspace_root: &Path) -> Result<String>;
}

/// Resolve `relative` under `root`, rejecting any path that would escape it
/// (spec.md §4.10 invariant; same centralized-path-validator approach as
/// the connector gates in spec.md §9).
pub fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = root.join(relative);
    let mut depth: i64 = 0;
    for component in Path::new(relative).components() {
        use std::path::Component;
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return Err(Error::PathTraversal(relative.to_string()));
        }
    }
    Ok(candidate)
}

/// Production sidecar client: posts the run spec to the configured sidecar
/// URL and returns its run id immediately (spec.md §4.10 "delegates to an
/// external sidecar that returns immediately").
pub struct HttpSandboxSidecar {
    client: reqwest::Client,
    sidecar_url: String,
}

impl HttpSandboxSidecar {
    pub fn new(client: reqwest::Client, sidecar_url: String) -> Self {
        Self { client, sidecar_url }
    }
}

#[async_trait]
impl SandboxSidecar for HttpSandboxSidecar {
    async fn dispatch(&self, run: &SandboxRun, workspace_root: &Path) -> Result<String> {
        #[derive(Serialize)]
        struct Req<'a> {
            run_id: &'a str,
            entrypoint: &'a str,
            workspace_root: String,
            timeout_secs: u64,
        }
        #[derive(Deserialize)]
        struct Resp {
            sidecar_run_id: String,
        }

        let resp = self
            .client
            .post(format!("{}/runs", self.sidecar_url))
            .json(&Req {
                run_id: &run.run_id,
                entrypoint: &run.entrypoint,
                workspace_root: workspace_root.display().to_string(),
                timeout_secs: run.budget.runtime_secs,
            })
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("sandbox sidecar unreachable: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::Sandbox(format!("sidecar returned {}", resp.status())));
        }

        resp.json::<Resp>().await.map(|r| r.sidecar_run_id).map_err(|e| Error::Sandbox(format!("malformed sidecar response: {e}")))
    }
}

struct UserThrottle {
    in_flight: u32,
    window_start: DateTime<Utc>,
    window_count: u32,
}

pub struct SandboxRunner {
    config: SandboxConfig,
    base: PathBuf,
    workspaces: DashMap<String, Workspace>,
    runs: DashMap<String, SandboxRun>,
    throttle: DashMap<String, Mutex<UserThrottle>>,
    sidecar: Arc<dyn SandboxSidecar>,
}

impl SandboxRunner {
    pub fn new(config: SandboxConfig, base: impl Into<PathBuf>, sidecar: Arc<dyn SandboxSidecar>) -> Self {
        Self {
            config,
            base: base.into(),
            workspaces: DashMap::new(),
            runs: DashMap::new(),
            throttle: DashMap::new(),
            sidecar,
        }
    }

    fn workspace_count(&self, user_id: &str) -> u32 {
        self.workspaces.iter().filter(|w| w.user_id == user_id).count() as u32
    }

    pub fn files_root(&self, user_id: &str, workspace_id: &str) -> PathBuf {
        self.base.join(user_id).join(workspace_id).join("files")
    }

    pub async fn create_workspace(&self, user_id: &str, name: &str) -> Result<Workspace> {
        if !self.config.enabled {
            return Err(Error::Forbidden("sandbox_disabled".into()));
        }
        if self.workspace_count(user_id) >= self.config.max_workspaces_per_user {
            return Err(Error::QuotaExceeded {
                tier: "n/a".into(),
                action: "sandbox_workspace".into(),
                used: self.workspace_count(user_id) as u64,
                limit: self.config.max_workspaces_per_user as u64,
                reset_secs: 0,
            });
        }

        let workspace = Workspace {
            id: prefixed_id("ws"),
            user_id: user_id.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        fs::create_dir_all(self.files_root(user_id, &workspace.id)).await?;
        self.workspaces.insert(workspace.id.clone(), workspace.clone());
        Ok(workspace)
    }

    pub async fn write_file(&self, user_id: &str, workspace_id: &str, relative_path: &str, content: &[u8]) -> Result<()> {
        if content.len() as u64 > self.config.max_file_bytes {
            return Err(Error::Validation(vec!["file exceeds max_file_bytes".into()]));
        }
        let root = self.files_root(user_id, workspace_id);
        let path = resolve_within(&root, relative_path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, content).await?;

        if let Some(mut workspace) = self.workspaces.get_mut(workspace_id) {
            workspace.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn check_throttle(&self, user_id: &str, tier_max_concurrent: u32) -> Result<()> {
        let entry = self
            .throttle
            .entry(user_id.to_string())
            .or_insert_with(|| Mutex::new(UserThrottle { in_flight: 0, window_start: Utc::now(), window_count: 0 }));
        let mut state = entry.lock().await;

        if state.in_flight >= tier_max_concurrent {
            return Err(Error::QuotaExceeded {
                tier: "n/a".into(),
                action: "sandbox_concurrency".into(),
                used: state.in_flight as u64,
                limit: tier_max_concurrent as u64,
                reset_secs: 0,
            });
        }

        let elapsed = (Utc::now() - state.window_start).num_seconds();
        if elapsed > 60 {
            state.window_start = Utc::now();
            state.window_count = 0;
        }
        const PER_MINUTE_LIMIT: u32 = 10;
        if state.window_count >= PER_MINUTE_LIMIT {
            return Err(Error::RateLimitExceeded);
        }

        state.in_flight += 1;
        state.window_count += 1;
        Ok(())
    }

    fn release_slot(&self, user_id: &str) {
        if let Some(entry) = self.throttle.get(user_id) {
            if let Ok(mut state) = entry.try_lock() {
                state.in_flight = state.in_flight.saturating_sub(1);
            }
        }
    }

    pub async fn enqueue_run(&self, user_id: &str, workspace_id: &str, entrypoint: &str, tier_max_concurrent: u32) -> Result<SandboxRun> {
        if !self.config.enabled {
            return Err(Error::Forbidden("sandbox_disabled".into()));
        }
        if !self.workspaces.contains_key(workspace_id) {
            return Err(Error::NotFound(format!("workspace {workspace_id}")));
        }
        self.check_throttle(user_id, tier_max_concurrent).await?;

        let run = SandboxRun {
            run_id: prefixed_id("run"),
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
            status: RunStatus::Queued,
            entrypoint: entrypoint.to_string(),
            exit_code: None,
            budget: RunBudget {
                runtime_secs: self.config.run_timeout_secs,
                memory_mb: 512,
                output_bytes: self.config.max_output_bytes,
                files_touched: 0,
            },
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            artifacts: Vec::new(),
            logs: String::new(),
        };
        self.runs.insert(run.run_id.clone(), run.clone());

        let workspace_root = self.files_root(user_id, workspace_id);
        match self.sidecar.dispatch(&run, &workspace_root).await {
            Ok(_sidecar_run_id) => {
                if let Some(mut stored) = self.runs.get_mut(&run.run_id) {
                    stored.status = RunStatus::Running;
                    stored.started_at = Some(Utc::now());
                }
            }
            Err(_) => {
                self.finish_run(&run.run_id, RunStatus::Failed, None, Vec::new());
            }
        }

        Ok(self.runs.get(&run.run_id).map(|r| r.clone()).unwrap())
    }

    pub fn get_run(&self, run_id: &str) -> Option<SandboxRun> {
        self.runs.get(run_id).map(|r| r.clone())
    }

    /// Called once the sidecar reports a terminal state; releases the
    /// concurrency slot exactly once (spec.md §4.10 invariant).
    pub fn finish_run(&self, run_id: &str, status: RunStatus, exit_code: Option<i32>, artifacts: Vec<String>) {
        let Some(mut run) = self.runs.get_mut(run_id) else { return };
        if run.is_terminal() {
            return;
        }
        run.status = status;
        run.exit_code = exit_code;
        run.artifacts = artifacts;
        run.finished_at = Some(Utc::now());
        let user_id = run.user_id.clone();
        drop(run);
        self.release_slot(&user_id);
    }

    pub fn artifact_path(&self, user_id: &str, workspace_id: &str, run_id: &str, artifact_path: &str) -> Result<PathBuf> {
        let root = self.base.join(user_id).join(workspace_id).join("runs").join(run_id).join("artifacts");
        resolve_within(&root, artifact_path)
    }
}

/// Strict MIME allowlist for artifact serving (spec.md §4.10).
pub fn allowed_artifact_mime(extension: &str) -> Option<&'static str> {
    let table: HashMap<&str, &str> = HashMap::from([
        ("txt", "text/plain"),
        ("json", "application/json"),
        ("png", "image/png"),
        ("jpg", "image/jpeg"),
        ("jpeg", "image/jpeg"),
        ("csv", "text/csv"),
        ("log", "text/plain"),
    ]);
    table.get(extension).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSidecar;

    #[async_trait]
    impl SandboxSidecar for FakeSidecar {
        async fn dispatch(&self, _run: &SandboxRun, _workspace_root: &Path) -> Result<String> {
            Ok("sidecar-run-1".into())
        }
    }

    fn config() -> SandboxConfig {
        SandboxConfig {
            enabled: true,
            sidecar_url: "http://localhost:9999".into(),
            run_timeout_secs: 30,
            max_output_bytes: 2 * 1024 * 1024,
            max_workspaces_per_user: 2,
            max_workspace_bytes: 1024 * 1024,
            max_file_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn create_workspace_respects_per_user_cap() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SandboxRunner::new(config(), dir.path(), Arc::new(FakeSidecar));
        runner.create_workspace("u1", "a").await.unwrap();
        runner.create_workspace("u1", "b").await.unwrap();
        assert!(runner.create_workspace("u1", "c").await.is_err());
    }

    #[tokio::test]
    async fn write_file_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SandboxRunner::new(config(), dir.path(), Arc::new(FakeSidecar));
        let workspace = runner.create_workspace("u1", "a").await.unwrap();
        let result = runner.write_file("u1", &workspace.id, "../../etc/passwd", b"x").await;
        assert!(matches!(result, Err(Error::PathTraversal(_))));
    }

    #[tokio::test]
    async fn run_releases_slot_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SandboxRunner::new(config(), dir.path(), Arc::new(FakeSidecar));
        let workspace = runner.create_workspace("u1", "a").await.unwrap();
        let run = runner.enqueue_run("u1", &workspace.id, "main.py", 1).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);

        let blocked = runner.enqueue_run("u1", &workspace.id, "main.py", 1).await;
        assert!(blocked.is_err());

        runner.finish_run(&run.run_id, RunStatus::Done, Some(0), vec!["out.txt".into()]);
        let after = runner.enqueue_run("u1", &workspace.id, "main.py", 1).await.unwrap();
        assert_eq!(after.status, RunStatus::Running);
    }

    #[test]
    fn resolve_within_rejects_escape() {
        let root = PathBuf::from("/data/u1/ws1/files");
        assert!(resolve_within(&root, "../../secret").is_err());
        assert!(resolve_within(&root, "notes/today.txt").is_ok());
    }
}
