// SPDX-License-Identifier: MIT OR Apache-2.0
//! Worker lifecycle: health probing, path resolution, and detached launch.
//!
//! `ensure_worker_running` is the single entry point used by the daemon and
//! the CLI alike: probe health, and if the worker is down, take the startup
//! lock, spawn it detached, and poll until it answers or the attempt times
//! out. The lock is always released, success or failure.
//!
//! [`SessionCheckpoint`] is a lighter-weight sibling: a per-session
//! check-in file a host can consult before paying for a health probe at
//! all.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use ocmem_error::{ErrorCode, OcError};
use ocmem_lock::{ExclusiveLock, LockKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const STARTUP_WAIT_BUDGET: Duration = Duration::from_secs(5);
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Relative paths, checked in order, that a worker install root is
/// recognized by.
const WORKER_ENTRY_CANDIDATES: &[&str] = &["bin/worker", "worker", "dist/worker.js", "index.js"];

/// Everything `ensure_worker_running` needs to find, launch, and address the
/// worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL the worker listens on, e.g. `http://127.0.0.1:37123`.
    pub base_url: String,
    /// Path to the worker-startup lockfile (typically under `~/.oc/locks`).
    pub lock_path: PathBuf,
    /// Explicit override, e.g. from `CLAUDE_MEM_WORKER_BIN`. Highest
    /// priority candidate if present.
    pub env_override: Option<PathBuf>,
    /// Project-local install root, e.g. `<project>/node_modules/.bin`.
    pub project_local: Option<PathBuf>,
    /// Plugin cache root containing version-named subdirectories
    /// (`1.2.0/`, `1.3.0-beta/`, ...), searched in descending semver order.
    pub plugin_cache: Option<PathBuf>,
    /// Marketplace cache root, the last-resort fallback.
    pub marketplace_cache: Option<PathBuf>,
}

impl WorkerConfig {
    /// A minimal config pointing only at `base_url` and `lock_path`, with no
    /// search roots configured. Useful for tests and for hosts that always
    /// set `env_override` explicitly.
    #[must_use]
    pub fn new(base_url: impl Into<String>, lock_path: PathBuf) -> Self {
        Self {
            base_url: base_url.into(),
            lock_path,
            env_override: None,
            project_local: None,
            plugin_cache: None,
            marketplace_cache: None,
        }
    }
}

/// Probe `GET {base_url}/api/health` with a 2 second timeout.
///
/// Returns `true` only on a successful (2xx) response; any network error,
/// timeout, or non-2xx status is treated as unhealthy.
pub async fn probe_health(base_url: &str) -> bool {
    let url = format!("{}/api/health", base_url.trim_end_matches('/'));
    let client = match reqwest::Client::builder().timeout(HEALTH_PROBE_TIMEOUT).build() {
        Ok(c) => c,
        Err(_) => return false,
    };
    match client.get(&url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// Probe health repeatedly at `interval` until `budget` elapses or a probe
/// succeeds.
async fn poll_health_until(base_url: &str, budget: Duration, interval: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if probe_health(base_url).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(interval).await;
    }
}

/// Whether `root` contains a recognizable worker entry point.
fn has_worker_entry(root: &Path) -> bool {
    WORKER_ENTRY_CANDIDATES.iter().any(|rel| root.join(rel).exists())
}

/// Parse a directory name as a dotted-numeric semver prefix for sorting
/// purposes (`"1.12.0"` -> `[1, 12, 0]`; pre-release suffixes sort lowest
/// among equal numeric prefixes since they're simply dropped here and the
/// name comparison stays stable).
fn semver_sort_key(name: &str) -> Vec<u64> {
    name.split(|c: char| c == '.' || c == '-' || c == '+')
        .map(|part| part.parse::<u64>().unwrap_or(0))
        .collect()
}

/// Find the highest-versioned subdirectory of `cache_root` that contains a
/// recognizable worker entry.
fn newest_versioned_entry(cache_root: &Path) -> Option<PathBuf> {
    let mut candidates: Vec<(Vec<u64>, PathBuf)> = std::fs::read_dir(cache_root)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.is_dir())
        .filter_map(|p| {
            let name = p.file_name()?.to_str()?.to_string();
            Some((semver_sort_key(&name), p))
        })
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates.into_iter().map(|(_, p)| p).find(|p| has_worker_entry(p))
}

/// Resolve the worker binary's install root by probing, in priority order:
/// explicit env override, project-local, plugin cache (descending semver),
/// marketplace cache. Returns the first candidate root that contains a
/// recognizable worker entry point.
#[must_use]
pub fn resolve_worker_root(cfg: &WorkerConfig) -> Option<PathBuf> {
    if let Some(ref p) = cfg.env_override {
        if has_worker_entry(p) {
            return Some(p.clone());
        }
    }
    if let Some(ref p) = cfg.project_local {
        if has_worker_entry(p) {
            return Some(p.clone());
        }
    }
    if let Some(ref root) = cfg.plugin_cache {
        if let Some(found) = newest_versioned_entry(root) {
            return Some(found);
        }
    }
    if let Some(ref p) = cfg.marketplace_cache {
        if has_worker_entry(p) {
            return Some(p.clone());
        }
    }
    None
}

/// The resolved entry point within a worker root, i.e. the first candidate
/// relative path that exists.
fn worker_entry_path(root: &Path) -> Option<PathBuf> {
    WORKER_ENTRY_CANDIDATES
        .iter()
        .map(|rel| root.join(rel))
        .find(|p| p.exists())
}

/// Spawn the worker entry point at `entry` as a detached child: stdio
/// discarded, `CLAUDE_MEM_MANAGED=true` set, and not waited on.
fn spawn_detached(entry: &Path, extra_args: &[String]) -> std::io::Result<()> {
    let mut cmd = Command::new(entry);
    cmd.args(extra_args)
        .env("CLAUDE_MEM_MANAGED", "true")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let mut child = cmd.spawn()?;
    // Detached: we deliberately never await the child. Dropping the handle
    // leaves the process running; tokio reaps it via its own signal
    // handler without our involvement.
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
    Ok(())
}

/// Idempotently ensure the worker is running and healthy.
///
/// Protocol: health probe; if healthy, return `true` immediately. Otherwise
/// acquire the worker-startup lock (waiting up to 5s polling health every
/// 500ms if another process already holds it live), spawn the resolved
/// worker binary detached, poll health for up to 5s, and release the lock
/// via guaranteed-finally regardless of outcome.
pub async fn ensure_worker_running(cfg: &WorkerConfig) -> Result<bool, OcError> {
    if probe_health(&cfg.base_url).await {
        return Ok(true);
    }

    let lock = ExclusiveLock::new(cfg.lock_path.clone(), LockKind::WorkerStartup, "worker-launcher");
    let guard = match lock.acquire() {
        Ok(guard) => guard,
        Err(ocmem_lock::LockError::Held { .. }) => {
            debug!("worker startup lock held by another process, waiting for health");
            let became_healthy =
                poll_health_until(&cfg.base_url, STARTUP_WAIT_BUDGET, STARTUP_POLL_INTERVAL).await;
            return Ok(became_healthy);
        }
        Err(e) => {
            return Err(OcError::new(ErrorCode::LockTimeout, "failed to acquire worker startup lock")
                .with_source(e));
        }
    };

    let result = launch_and_wait(cfg).await;
    drop(guard);
    result
}

async fn launch_and_wait(cfg: &WorkerConfig) -> Result<bool, OcError> {
    let root = resolve_worker_root(cfg).ok_or_else(|| {
        OcError::new(ErrorCode::WorkerUnreachable, "no worker install found on any search path")
    })?;
    let entry = worker_entry_path(&root).ok_or_else(|| {
        OcError::new(ErrorCode::WorkerUnreachable, "resolved worker root has no recognizable entry")
            .with_context("root", root.display().to_string())
    })?;

    info!(entry = %entry.display(), "spawning worker");
    spawn_detached(&entry, &[]).map_err(|e| {
        OcError::new(ErrorCode::WorkerUnreachable, "failed to spawn worker process").with_source(e)
    })?;

    let became_healthy =
        poll_health_until(&cfg.base_url, STARTUP_WAIT_BUDGET, STARTUP_POLL_INTERVAL).await;
    if !became_healthy {
        warn!("worker did not become healthy within the startup window");
    }
    Ok(became_healthy)
}

/// Force-restart the worker: acquire the startup lock, spawn with `--force`
/// (the upstream binary's own shutdown-then-restart convention), poll for
/// health, release the lock. Same guaranteed-finally discipline as
/// [`ensure_worker_running`].
pub async fn restart_worker(cfg: &WorkerConfig) -> Result<bool, OcError> {
    let lock = ExclusiveLock::new(cfg.lock_path.clone(), LockKind::WorkerStartup, "worker-launcher");
    let guard = match lock.acquire() {
        Ok(guard) => guard,
        Err(ocmem_lock::LockError::Held { .. }) => {
            let became_healthy =
                poll_health_until(&cfg.base_url, STARTUP_WAIT_BUDGET, STARTUP_POLL_INTERVAL).await;
            return Ok(became_healthy);
        }
        Err(e) => {
            return Err(OcError::new(ErrorCode::LockTimeout, "failed to acquire worker startup lock")
                .with_source(e));
        }
    };

    let result = restart_and_wait(cfg).await;
    drop(guard);
    result
}

async fn restart_and_wait(cfg: &WorkerConfig) -> Result<bool, OcError> {
    let root = resolve_worker_root(cfg).ok_or_else(|| {
        OcError::new(ErrorCode::WorkerUnreachable, "no worker install found on any search path")
    })?;
    let entry = worker_entry_path(&root).ok_or_else(|| {
        OcError::new(ErrorCode::WorkerUnreachable, "resolved worker root has no recognizable entry")
            .with_context("root", root.display().to_string())
    })?;

    info!(entry = %entry.display(), "restarting worker with --force");
    spawn_detached(&entry, &["--force".to_string()]).map_err(|e| {
        OcError::new(ErrorCode::WorkerUnreachable, "failed to spawn worker process").with_source(e)
    })?;

    let became_healthy =
        poll_health_until(&cfg.base_url, STARTUP_WAIT_BUDGET, STARTUP_POLL_INTERVAL).await;
    Ok(became_healthy)
}

/// How long a checkpoint stays fresh before it must be refreshed.
const CHECKPOINT_TTL_MS: i64 = 5 * 60 * 1000;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// A session's last check-in, persisted at a well-known path (typically
/// `~/.claude-mem/checkpoint.json`) alongside the worker startup lockfile.
///
/// Lets a host skip repeat worker-liveness work for a session that already
/// checked in within [`CHECKPOINT_TTL_MS`], rather than probing health on
/// every call into [`ensure_worker_running`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    /// The session this checkpoint belongs to.
    pub session_id: String,
    /// Epoch milliseconds of the last check-in.
    pub timestamp: i64,
}

impl SessionCheckpoint {
    /// Whether this checkpoint is both for `session_id` and still within
    /// the freshness TTL.
    #[must_use]
    pub fn is_fresh_for(&self, session_id: &str) -> bool {
        self.session_id == session_id && now_ms() - self.timestamp <= CHECKPOINT_TTL_MS
    }

    /// Write a fresh checkpoint for `session_id` to `path`, mode 0600.
    /// Creates the parent directory if absent.
    pub fn write(path: &Path, session_id: &str) -> Result<Self, OcError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                OcError::new(ErrorCode::Internal, "failed to create checkpoint directory")
                    .with_source(e)
            })?;
        }
        let checkpoint = Self {
            session_id: session_id.to_string(),
            timestamp: now_ms(),
        };
        let body = serde_json::to_vec(&checkpoint).map_err(|e| {
            OcError::new(ErrorCode::Internal, "failed to serialize checkpoint").with_source(e)
        })?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                OcError::new(ErrorCode::Internal, "failed to open checkpoint file").with_source(e)
            })?;
        restrict_to_owner(&file).map_err(|e| {
            OcError::new(ErrorCode::Internal, "failed to set checkpoint file permissions")
                .with_source(e)
        })?;
        std::io::Write::write_all(&mut file, &body).map_err(|e| {
            OcError::new(ErrorCode::Internal, "failed to write checkpoint file").with_source(e)
        })?;
        Ok(checkpoint)
    }

    /// Read a checkpoint from `path`, if present and parseable. Absent,
    /// unreadable, or corrupt checkpoints are treated as "no checkpoint"
    /// rather than an error — a missing checkpoint just means probe health
    /// as usual.
    #[must_use]
    pub fn read(path: &Path) -> Option<Self> {
        let contents = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }
}

#[cfg(unix)]
fn restrict_to_owner(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_file: &std::fs::File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn semver_sort_key_orders_numerically_not_lexically() {
        let mut names = vec!["1.9.0", "1.10.0", "1.2.0"];
        names.sort_by_key(|n| std::cmp::Reverse(semver_sort_key(n)));
        assert_eq!(names, vec!["1.10.0", "1.9.0", "1.2.0"]);
    }

    #[test]
    fn resolve_prefers_env_override_over_everything() {
        let dir = tempfile::tempdir().unwrap();
        let override_root = dir.path().join("override");
        fs::create_dir_all(&override_root).unwrap();
        fs::write(override_root.join("worker"), b"").unwrap();

        let project_root = dir.path().join("project");
        fs::create_dir_all(&project_root).unwrap();
        fs::write(project_root.join("worker"), b"").unwrap();

        let cfg = WorkerConfig {
            env_override: Some(override_root.clone()),
            project_local: Some(project_root),
            ..WorkerConfig::new("http://127.0.0.1:1", dir.path().join("lock"))
        };
        assert_eq!(resolve_worker_root(&cfg), Some(override_root));
    }

    #[test]
    fn resolve_falls_through_to_project_local_when_no_override() {
        let dir = tempfile::tempdir().unwrap();
        let project_root = dir.path().join("project");
        fs::create_dir_all(&project_root).unwrap();
        fs::write(project_root.join("worker"), b"").unwrap();

        let cfg = WorkerConfig {
            project_local: Some(project_root.clone()),
            ..WorkerConfig::new("http://127.0.0.1:1", dir.path().join("lock"))
        };
        assert_eq!(resolve_worker_root(&cfg), Some(project_root));
    }

    #[test]
    fn resolve_picks_newest_semver_from_plugin_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("plugin-cache");
        for v in ["1.0.0", "2.0.0", "1.9.0"] {
            let root = cache.join(v);
            fs::create_dir_all(&root).unwrap();
            fs::write(root.join("worker"), b"").unwrap();
        }

        let cfg = WorkerConfig {
            plugin_cache: Some(cache.clone()),
            ..WorkerConfig::new("http://127.0.0.1:1", dir.path().join("lock"))
        };
        assert_eq!(resolve_worker_root(&cfg), Some(cache.join("2.0.0")));
    }

    #[test]
    fn plugin_cache_entry_without_recognizable_binary_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("plugin-cache");
        fs::create_dir_all(cache.join("2.0.0")).unwrap(); // no entry file
        let good = cache.join("1.0.0");
        fs::create_dir_all(&good).unwrap();
        fs::write(good.join("worker"), b"").unwrap();

        let cfg = WorkerConfig {
            plugin_cache: Some(cache),
            ..WorkerConfig::new("http://127.0.0.1:1", dir.path().join("lock"))
        };
        assert_eq!(resolve_worker_root(&cfg), Some(good));
    }

    #[test]
    fn resolve_falls_through_to_marketplace_cache_last() {
        let dir = tempfile::tempdir().unwrap();
        let marketplace = dir.path().join("marketplace");
        fs::create_dir_all(&marketplace).unwrap();
        fs::write(marketplace.join("worker"), b"").unwrap();

        let cfg = WorkerConfig {
            marketplace_cache: Some(marketplace.clone()),
            ..WorkerConfig::new("http://127.0.0.1:1", dir.path().join("lock"))
        };
        assert_eq!(resolve_worker_root(&cfg), Some(marketplace));
    }

    #[test]
    fn resolve_returns_none_when_nothing_found() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = WorkerConfig::new("http://127.0.0.1:1", dir.path().join("lock"));
        assert_eq!(resolve_worker_root(&cfg), None);
    }

    #[tokio::test]
    async fn probe_health_is_false_for_unreachable_host() {
        let healthy = probe_health("http://127.0.0.1:1").await;
        assert!(!healthy);
    }

    #[tokio::test]
    async fn ensure_worker_running_fails_gracefully_with_no_install_found() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = WorkerConfig::new("http://127.0.0.1:1", dir.path().join("lock"));
        let err = ensure_worker_running(&cfg).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::WorkerUnreachable);
        // Lock must not be left behind even on failure.
        assert!(!dir.path().join("lock").exists());
    }

    #[test]
    fn checkpoint_round_trips_and_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("claude-mem").join("checkpoint.json");
        let written = SessionCheckpoint::write(&path, "sess-1").unwrap();
        let read = SessionCheckpoint::read(&path).unwrap();
        assert_eq!(written, read);
        assert_eq!(read.session_id, "sess-1");
    }

    #[test]
    fn checkpoint_is_fresh_only_for_matching_session_within_ttl() {
        let fresh = SessionCheckpoint { session_id: "sess-1".to_string(), timestamp: now_ms() };
        assert!(fresh.is_fresh_for("sess-1"));
        assert!(!fresh.is_fresh_for("sess-2"));

        let stale = SessionCheckpoint {
            session_id: "sess-1".to_string(),
            timestamp: now_ms() - CHECKPOINT_TTL_MS - 1,
        };
        assert!(!stale.is_fresh_for("sess-1"));
    }

    #[test]
    fn missing_checkpoint_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SessionCheckpoint::read(&dir.path().join("checkpoint.json")).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn checkpoint_file_is_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        SessionCheckpoint::write(&path, "sess-1").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
