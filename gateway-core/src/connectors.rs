//! Capability-gated file, shell, and session-history accessors (spec.md §4.4).

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{Error, Result};

const MAX_STREAM_BYTES: usize = 2 * 1024 * 1024;
const SHELL_TIMEOUT_SECS: u64 = 30;

/// Per-tier allowed path prefixes. A deny-list entry always wins over an
/// allow-list match (spec.md §4.4 "Read scopes").
#[derive(Debug, Clone, Default)]
pub struct ReadScopeTable {
    allow: HashMap<String, Vec<String>>,
    deny: Vec<String>,
}

impl ReadScopeTable {
    pub fn new(allow: HashMap<String, Vec<String>>, deny: Vec<String>) -> Self {
        Self { allow, deny }
    }

    pub fn check(&self, tier: &str, relative_path: &str) -> Result<()> {
        if self.deny.iter().any(|prefix| relative_path.starts_with(prefix.as_str())) {
            return Err(Error::ReadDenied(relative_path.to_string()));
        }
        let allowed = self
            .allow
            .get(tier)
            .map(|prefixes| prefixes.iter().any(|prefix| relative_path.starts_with(prefix.as_str())))
            .unwrap_or(false);
        if !allowed {
            return Err(Error::ReadDenied(relative_path.to_string()));
        }
        Ok(())
    }
}

/// Resolve `relative` strictly under `root`; any `..` that would climb past
/// root is a traversal attempt.
fn resolve_under_root(root: &Path, relative: &str) -> Result<PathBuf> {
    let mut depth: i64 = 0;
    for component in Path::new(relative).components() {
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            _ => return Err(Error::PathTraversal(relative.to_string())),
        }
        if depth < 0 {
            return Err(Error::PathTraversal(relative.to_string()));
        }
    }
    Ok(root.join(relative))
}

static REDACTION_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"sk-[A-Za-z0-9]{20,}").unwrap(), "[REDACTED_API_KEY]"),
        (Regex::new(r"(?i)bearer\s+[a-z0-9._-]{10,}").unwrap(), "[REDACTED_TOKEN]"),
        (Regex::new(r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----").unwrap(), "[REDACTED_PRIVATE_KEY]"),
        (Regex::new(r"(?i)(postgres|mysql|mongodb|redis)://[^\s]+").unwrap(), "[REDACTED_CONNECTION_STRING]"),
        (Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap(), "[REDACTED_EMAIL]"),
    ]
});

/// Strip credentials/keys/tokens/connection-strings/emails from file
/// contents before they leave the core (spec.md §4.4 "Redaction").
pub fn redact(content: &str) -> (String, u32) {
    let mut out = content.to_string();
    let mut count = 0u32;
    for (pattern, placeholder) in REDACTION_PATTERNS.iter() {
        let matches = pattern.find_iter(&out).count() as u32;
        count += matches;
        out = pattern.replace_all(&out, *placeholder).into_owned();
    }
    (out, count)
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteRecord {
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
    pub backed_up: bool,
}

pub struct FileConnector {
    data_root: PathBuf,
    audit_dir_name: String,
    scopes: ReadScopeTable,
}

impl FileConnector {
    pub fn new(data_root: impl Into<PathBuf>, audit_dir_name: impl Into<String>, scopes: ReadScopeTable) -> Self {
        Self { data_root: data_root.into(), audit_dir_name: audit_dir_name.into(), scopes }
    }

    pub async fn read(&self, tier: &str, relative_path: &str) -> Result<(String, u32)> {
        self.scopes.check(tier, relative_path)?;
        let path = resolve_under_root(&self.data_root, relative_path)?;
        let raw = fs::read_to_string(&path).await?;
        Ok(redact(&raw))
    }

    pub async fn write(&self, relative_path: &str, content: &[u8]) -> Result<WriteRecord> {
        if relative_path.starts_with(&self.audit_dir_name) {
            return Err(Error::PolicyBlocked("writes into the audit directory are forbidden".into()));
        }
        let path = resolve_under_root(&self.data_root, relative_path)?;

        let mut backed_up = false;
        if fs::metadata(&path).await.is_ok() {
            let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.f");
            let backup = path.with_extension(format!("{stamp}.bak"));
            fs::copy(&path, &backup).await?;
            backed_up = true;
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, content).await?;

        let mut hasher = Sha256::new();
        hasher.update(content);
        let sha256 = hex::encode(hasher.finalize());

        Ok(WriteRecord { path: relative_path.to_string(), bytes: content.len() as u64, sha256, backed_up })
    }

    /// Stage a patch into `patches/{id}/` for out-of-core promotion (spec.md
    /// §4.4 "Patch staging").
    pub async fn stage_patch(&self, patch_id: &str, content: &[u8], description: &str) -> Result<WriteRecord> {
        let relative = format!("patches/{patch_id}/patch.diff");
        let record = self.write(&relative, content).await?;

        #[derive(Serialize)]
        struct Meta<'a> {
            patch_id: &'a str,
            description: &'a str,
            created_at: chrono::DateTime<chrono::Utc>,
        }
        let meta = Meta { patch_id, description, created_at: chrono::Utc::now() };
        let meta_json = serde_json::to_vec_pretty(&meta).map_err(|e| Error::Internal(e.to_string()))?;
        self.write(&format!("patches/{patch_id}/meta.json"), &meta_json).await?;

        Ok(record)
    }
}

#[derive(Debug, Clone)]
pub struct ShellAllowlistEntry {
    pub max_args: usize,
    pub denylist_substrings: Vec<String>,
}

static GLOBAL_DENYLIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\bbash\b|\bsh\b|\bzsh\b|\|\s*bash|\|\s*sh\b|sudo|su\s|chmod\s+777|rm\s+-rf\s+/|:(){ *:\|:& *};:|nmap|masscan|nc\s+-l)").unwrap()
});

pub struct ShellConnector {
    root: PathBuf,
    allowlist: HashMap<String, ShellAllowlistEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShellResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub stdout_sha256: String,
    pub stderr_sha256: String,
}

impl ShellConnector {
    pub fn new(root: impl Into<PathBuf>, allowlist: HashMap<String, ShellAllowlistEntry>) -> Self {
        Self { root: root.into(), allowlist }
    }

    fn check_command(&self, binary: &str, args: &[String], raw_command: &str) -> Result<()> {
        if GLOBAL_DENYLIST.is_match(raw_command) {
            return Err(Error::CommandBlocked(format!("denylisted pattern in: {raw_command}")));
        }
        let entry = self
            .allowlist
            .get(binary)
            .ok_or_else(|| Error::CommandBlocked(format!("binary not in allowlist: {binary}")))?;
        if args.len() > entry.max_args {
            return Err(Error::CommandBlocked(format!("too many args for {binary}")));
        }
        for arg in args {
            if entry.denylist_substrings.iter().any(|bad| arg.contains(bad.as_str())) {
                return Err(Error::CommandBlocked(format!("denylisted arg for {binary}: {arg}")));
            }
        }
        Ok(())
    }

    pub async fn run(&self, binary: &str, args: Vec<String>, working_dir: &str) -> Result<ShellResult> {
        let raw_command = format!("{binary} {}", args.join(" "));
        self.check_command(binary, &args, &raw_command)?;

        let cwd = resolve_under_root(&self.root, working_dir)?;

        let mut child = Command::new(binary)
            .args(&args)
            .current_dir(&cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Sandbox(format!("failed to spawn {binary}: {e}")))?;

        let mut stdout_pipe = child.stdout.take().expect("piped stdout");
        let mut stderr_pipe = child.stderr.take().expect("piped stderr");

        let run = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut stdout_buf).await;
            let _ = stderr_pipe.read_to_end(&mut stderr_buf).await;
            stdout_buf.truncate(MAX_STREAM_BYTES);
            stderr_buf.truncate(MAX_STREAM_BYTES);
            let status = child.wait().await;
            (stdout_buf, stderr_buf, status)
        };

        let (stdout_buf, stderr_buf, status) = timeout(Duration::from_secs(SHELL_TIMEOUT_SECS), run)
            .await
            .map_err(|_| Error::Sandbox(format!("{binary} timed out after {SHELL_TIMEOUT_SECS}s")))?;

        let status = status.map_err(|e| Error::Sandbox(format!("wait failed: {e}")))?;

        Ok(ShellResult {
            exit_code: status.code().unwrap_or(-1),
            stdout_sha256: hex::encode(Sha256::digest(&stdout_buf)),
            stderr_sha256: hex::encode(Sha256::digest(&stderr_buf)),
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_strips_api_key_and_email() {
        let (out, count) = redact("key=sk-abcdefghijklmnopqrstuvwxyz contact me@example.com");
        assert!(out.contains("[REDACTED_API_KEY]"));
        assert!(out.contains("[REDACTED_EMAIL]"));
        assert_eq!(count, 2);
    }

    #[test]
    fn deny_list_wins_over_allow_list() {
        let mut allow = HashMap::new();
        allow.insert("pro".to_string(), vec!["docs/".to_string()]);
        let scopes = ReadScopeTable::new(allow, vec!["docs/secret/".to_string()]);
        assert!(scopes.check("pro", "docs/secret/keys.txt").is_err());
        assert!(scopes.check("pro", "docs/readme.md").is_ok());
    }

    #[test]
    fn read_outside_scope_is_denied() {
        let scopes = ReadScopeTable::default();
        assert!(scopes.check("free", "anything").is_err());
    }

    #[test]
    fn resolve_under_root_rejects_traversal() {
        let root = PathBuf::from("/data/root");
        assert!(resolve_under_root(&root, "../../etc/passwd").is_err());
        assert!(resolve_under_root(&root, "a/b/c.txt").is_ok());
    }

    #[tokio::test]
    async fn write_into_audit_dir_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let connector = FileConnector::new(dir.path(), "audit", ReadScopeTable::default());
        let result = connector.write("audit/entry.jsonl", b"x").await;
        assert!(matches!(result, Err(Error::PolicyBlocked(_))));
    }

    #[tokio::test]
    async fn write_then_overwrite_creates_backup() {
        let dir = tempfile::tempdir().unwrap();
        let connector = FileConnector::new(dir.path(), "audit", ReadScopeTable::default());
        let first = connector.write("notes.txt", b"v1").await.unwrap();
        assert!(!first.backed_up);
        let second = connector.write("notes.txt", b"v2").await.unwrap();
        assert!(second.backed_up);
    }

    #[test]
    fn shell_command_blocked_by_global_denylist() {
        let connector = ShellConnector::new("/data", HashMap::new());
        let result = connector.check_command("bash", &["-c".into(), "ls".into()], "bash -c ls");
        assert!(matches!(result, Err(Error::CommandBlocked(_))));
    }

    #[test]
    fn shell_command_requires_allowlisted_binary() {
        let connector = ShellConnector::new("/data", HashMap::new());
        let result = connector.check_command("git", &["status".into()], "git status");
        assert!(matches!(result, Err(Error::CommandBlocked(_))));
    }

    #[test]
    fn shell_command_rejects_excess_args() {
        let mut allowlist = HashMap::new();
        allowlist.insert("git".to_string(), ShellAllowlistEntry { max_args: 1, denylist_substrings: vec![] });
        let connector = ShellConnector::new("/data", allowlist);
        let result = connector.check_command("git", &["status".into(), "--extra".into()], "git status --extra");
        assert!(matches!(result, Err(Error::CommandBlocked(_))));
    }
}
