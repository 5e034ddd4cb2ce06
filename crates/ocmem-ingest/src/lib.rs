// SPDX-License-Identifier: MIT OR Apache-2.0
//! Single-writer daemon that promotes outbox JSONL files into per-project
//! stores and the cross-project global index.
//!
//! Polls the outbox directory on a fixed interval, groups each file's lines
//! by project, ingests each group inside a per-project `BEGIN IMMEDIATE`
//! transaction, and only moves a file into `processed/` once at least one
//! group lands successfully. Nothing here is fatal: malformed lines, a
//! failed group, or a failed global-index update are all logged and
//! retried, never panicked on.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use ocmem_core::{project_uuid, Observation, ObservationType, ProjectRegistryEntry};
use ocmem_error::{ErrorCode, OcError};
use ocmem_lock::{ExclusiveLock, LockKind};
use ocmem_store::{GlobalIndex, ProjectStore};
use ocmem_telemetry::{IngestTickMetrics, MetricsCollector};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[cfg(unix)]
const ALLOWED_ROOTS: &[&str] = &["/Users", "/home", "/var/folders"];
#[cfg(windows)]
const ALLOWED_ROOTS: &[&str] = &["C:\\", "D:\\"];
#[cfg(not(any(unix, windows)))]
const ALLOWED_ROOTS: &[&str] = &[];

const VALID_SCOPES: &[&str] = &["branch", "project", "global"];
const VALID_IMPORTANCE: &[&str] = &["critical", "high", "medium", "low"];

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Everything the ingestor loop needs to find, write into, and heartbeat.
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// Directory containing unconsumed `observations-*.jsonl` files and a
    /// `processed/` subdirectory.
    pub outbox_dir: PathBuf,
    /// Path to the cross-project `index.db`.
    pub global_db_path: PathBuf,
    /// `~/.oc`-equivalent root, used to locate the installation salt file.
    pub global_root: PathBuf,
    /// Path to the index lock file.
    pub index_lock_path: PathBuf,
    /// Poll interval between ticks.
    pub poll_interval: Duration,
    /// Maximum number of outbox files consumed per tick.
    pub batch_size: usize,
}

impl IngestorConfig {
    /// Build a config rooted at `global_root`, with the conventional
    /// `outbox/`, `index.db`, and `locks/index.lock` layout beneath it, and
    /// spec defaults (1s poll, 100-file batch).
    #[must_use]
    pub fn new(global_root: PathBuf) -> Self {
        Self {
            outbox_dir: global_root.join("outbox"),
            global_db_path: global_root.join("index.db"),
            index_lock_path: global_root.join("locks").join("index.lock"),
            global_root,
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

/// One promoted observation's summary, carried from [`ingest_to_project`]
/// into [`update_global_index`].
#[derive(Debug, Clone)]
pub struct IngestedSummary {
    /// The project-local row id assigned by [`ProjectStore::insert_batch`].
    pub project_obs_id: i64,
    /// Observation type.
    pub ty: ObservationType,
    /// Title.
    pub title: String,
    /// Narrative.
    pub narrative: String,
    /// 0-100 importance score.
    pub importance: u8,
    /// Branch, if recorded in `oc_metadata`.
    pub branch: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Full `oc_metadata` bag, carried through for the global mirror.
    pub oc_metadata: BTreeMap<String, serde_json::Value>,
}

/// Canonicalize `raw` and require it fall under an allow-listed root
/// (`$HOME`, `/Users`, `/home`, `/var/folders`, or on Windows `$HOME`,
/// `C:\`, `D:\`).
pub fn harden_project_path(raw: &str) -> Result<PathBuf, OcError> {
    let canonical = Path::new(raw).canonicalize().map_err(|e| {
        OcError::new(ErrorCode::Internal, format!("failed to canonicalize project path: {raw}"))
            .with_source(e)
    })?;

    let home_allowed = dirs::home_dir().is_some_and(|home| canonical.starts_with(home));
    let root_allowed = ALLOWED_ROOTS.iter().any(|root| canonical.starts_with(root));
    if !home_allowed && !root_allowed {
        return Err(OcError::new(
            ErrorCode::SchemaInvalid,
            "project path is not under an allow-listed root",
        )
        .with_context("path", canonical.display().to_string()));
    }
    Ok(canonical)
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

/// Read or create the installation-local 32-byte HMAC salt under
/// `global_root/salt`.
pub fn load_or_init_salt(global_root: &Path) -> Result<[u8; 32], OcError> {
    let path = global_root.join("salt");
    if let Ok(bytes) = std::fs::read(&path) {
        if let Ok(salt) = <[u8; 32]>::try_from(bytes.as_slice()) {
            return Ok(salt);
        }
        warn!(path = %path.display(), "ingest: salt file has unexpected length, regenerating");
    }

    std::fs::create_dir_all(global_root).map_err(|e| {
        OcError::new(ErrorCode::SaltInitFailed, "failed to create global root directory").with_source(e)
    })?;
    let salt: [u8; 32] = rand::random();
    match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut file) => {
            use std::io::Write;
            restrict_to_owner(&file).map_err(|e| {
                OcError::new(ErrorCode::SaltInitFailed, "failed to set salt file permissions")
                    .with_source(e)
            })?;
            file.write_all(&salt).map_err(|e| {
                OcError::new(ErrorCode::SaltInitFailed, "failed to write salt file").with_source(e)
            })?;
            Ok(salt)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            // Lost a startup race with another process; read back the salt
            // whoever won the race wrote.
            let bytes = std::fs::read(&path).map_err(|e2| {
                OcError::new(ErrorCode::SaltInitFailed, "failed to read salt file after race")
                    .with_source(e2)
            })?;
            <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
                OcError::new(ErrorCode::SaltInitFailed, "salt file has unexpected length")
            })
        }
        Err(e) => {
            Err(OcError::new(ErrorCode::SaltInitFailed, "failed to create salt file").with_source(e))
        }
    }
}

/// Make sure `outbox_dir` and its `processed/` subdirectory exist.
pub fn ensure_outbox_dirs(outbox_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(outbox_dir)?;
    std::fs::create_dir_all(outbox_dir.join("processed"))
}

fn list_due_files(outbox_dir: &Path, batch_size: usize) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(outbox_dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    files.sort();
    files.truncate(batch_size);
    files
}

fn parse_jsonl_file(path: &Path) -> (Vec<Observation>, u64) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return (Vec::new(), 0);
    };
    let mut observations = Vec::new();
    let mut malformed = 0u64;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Observation>(line) {
            Ok(obs) => observations.push(obs),
            Err(e) => {
                malformed += 1;
                warn!(error = %e, file = %path.display(), "ingest: skipping malformed outbox line");
            }
        }
    }
    (observations, malformed)
}

fn group_by_project(observations: Vec<Observation>) -> BTreeMap<String, Vec<Observation>> {
    let mut groups: BTreeMap<String, Vec<Observation>> = BTreeMap::new();
    for obs in observations {
        groups.entry(obs.project.clone()).or_default().push(obs);
    }
    groups
}

fn relativize(paths: Vec<String>, project_root: &Path) -> Vec<String> {
    paths
        .into_iter()
        .map(|p| {
            Path::new(&p)
                .strip_prefix(project_root)
                .map(|rel| rel.to_string_lossy().into_owned())
                .unwrap_or(p)
        })
        .collect()
}

/// Validate `oc_metadata`'s `scope`/`importance` keys against their declared
/// shapes. Unknown keys pass through untouched; an invalid or absent
/// `scope`/`importance` is replaced with the default (`"branch"` /
/// `"medium"`) and a warning is logged.
fn validate_metadata(
    mut meta: BTreeMap<String, serde_json::Value>,
) -> BTreeMap<String, serde_json::Value> {
    let scope_valid = meta.get("scope").and_then(|v| v.as_str()).is_some_and(|s| VALID_SCOPES.contains(&s));
    if !scope_valid {
        if let Some(bad) = meta.get("scope") {
            warn!(value = %bad, "ingest: invalid oc_metadata.scope, defaulting to 'branch'");
        }
        meta.insert("scope".into(), serde_json::json!("branch"));
    }

    let importance_valid = meta
        .get("importance")
        .and_then(|v| v.as_str())
        .is_some_and(|s| VALID_IMPORTANCE.contains(&s));
    if !importance_valid {
        if let Some(bad) = meta.get("importance") {
            warn!(value = %bad, "ingest: invalid oc_metadata.importance, defaulting to 'medium'");
        }
        meta.insert("importance".into(), serde_json::json!("medium"));
    }

    meta
}

/// Ingest one project's group of events within a single `BEGIN IMMEDIATE`
/// transaction: scrub again (defense in depth), relativize file paths,
/// validate metadata, and insert all-or-nothing. Returns the summaries
/// needed to update the global index.
pub fn ingest_to_project(
    project_path_raw: &str,
    events: Vec<Observation>,
) -> Result<(PathBuf, Vec<IngestedSummary>), OcError> {
    let project_root = harden_project_path(project_path_raw)?;
    let db_path = project_root.join(".oc").join("memory.db");
    let store = ProjectStore::open(&db_path)?;

    let prepared: Vec<Observation> = events
        .into_iter()
        .map(|mut obs| {
            obs.narrative = ocmem_scrub::scrub_str(&obs.narrative);
            obs.text = ocmem_scrub::scrub_str(&obs.text);
            obs.facts = obs.facts.iter().map(|f| ocmem_scrub::scrub_str(f)).collect();
            obs.concepts = obs.concepts.iter().map(|c| ocmem_scrub::scrub_str(c)).collect();
            obs.files_read = relativize(obs.files_read, &project_root);
            obs.files_modified = relativize(obs.files_modified, &project_root);
            obs.oc_metadata = validate_metadata(obs.oc_metadata);
            obs
        })
        .collect();

    let ids = store.insert_batch(&prepared)?;
    let summaries = ids
        .into_iter()
        .zip(prepared)
        .map(|(id, obs)| IngestedSummary {
            project_obs_id: id,
            ty: obs.ty,
            title: obs.title,
            narrative: obs.narrative,
            importance: obs.importance_score(),
            branch: obs.branch().map(str::to_string),
            created_at: obs.created_at,
            oc_metadata: obs.oc_metadata,
        })
        .collect();
    Ok((project_root, summaries))
}

/// Promote a project's freshly-ingested summaries into the global index.
///
/// Computes `project_uuid` from the canonical path via the installation
/// salt. If the path is already registered under a *different* uuid (a
/// salt or hashing-algorithm migration), the stale uuid's rows are deleted
/// before re-registering under the new one.
pub fn update_global_index(
    global: &GlobalIndex,
    salt: &[u8; 32],
    project_root: &Path,
    summaries: &[IngestedSummary],
) -> Result<(), OcError> {
    let uuid = project_uuid(project_root, salt);
    let absolute = project_root.display().to_string();

    if let Some(existing) = global.get_project_by_path(&absolute)? {
        if existing.project_uuid != uuid {
            warn!(
                old_uuid = %existing.project_uuid,
                new_uuid = %uuid,
                path = %absolute,
                "ingest: project uuid changed, treating as a salt/algorithm migration"
            );
            global.delete_project(&existing.project_uuid)?;
        }
    }

    let mut entry = global
        .get_project(&uuid)?
        .unwrap_or_else(|| ProjectRegistryEntry::new(uuid.clone(), absolute.clone()));
    entry.absolute_path = absolute;
    entry.last_sync_at = Utc::now();
    entry.observation_count += summaries.len() as u64;
    global.upsert_project(&entry)?;

    for summary in summaries {
        let external_id = format!("{uuid}:{}", summary.project_obs_id);
        let obs = ocmem_core::ObservationBuilder::new(
            "",
            uuid.clone(),
            "ingestor",
            "ingest",
            summary.ty,
            summary.title.clone(),
            summary.narrative.clone(),
        )
        .created_at(summary.created_at)
        .build();
        let mut obs = obs;
        obs.oc_metadata = summary.oc_metadata.clone();
        global.upsert_observation(&uuid, &external_id, &obs)?;
    }
    Ok(())
}

fn move_to_processed(outbox_dir: &Path, file: &Path) -> std::io::Result<()> {
    let processed_dir = outbox_dir.join("processed");
    std::fs::create_dir_all(&processed_dir)?;
    let name = file.file_name().and_then(|n| n.to_str()).unwrap_or("unknown.jsonl");
    let dest = processed_dir.join(format!("{}-{name}", Utc::now().timestamp_millis()));
    std::fs::rename(file, dest)
}

/// Run one poll tick: consume up to `batch_size` outbox files, ingest each
/// file's project groups, and move fully-or-partially successful files to
/// `processed/`. Files where every group fails are left in place for the
/// next tick.
pub fn run_tick(outbox_dir: &Path, global: &GlobalIndex, salt: &[u8; 32], batch_size: usize) -> IngestTickMetrics {
    let start = Instant::now();
    let mut metrics = IngestTickMetrics::default();

    for file in list_due_files(outbox_dir, batch_size) {
        metrics.files_processed += 1;
        let (observations, malformed) = parse_jsonl_file(&file);
        metrics.malformed_lines += malformed;

        let groups = group_by_project(observations);
        let mut any_group_succeeded = false;
        for (project_path, events) in groups {
            match ingest_to_project(&project_path, events) {
                Ok((project_root, summaries)) => {
                    metrics.rows_ingested += summaries.len() as u64;
                    if let Err(e) = update_global_index(global, salt, &project_root, &summaries) {
                        warn!(error = %e, project = %project_path, "ingest: failed to update global index");
                    }
                    any_group_succeeded = true;
                }
                Err(e) => {
                    warn!(error = %e, project = %project_path, "ingest: failed to ingest group, file will be retried");
                }
            }
        }

        if any_group_succeeded {
            if let Err(e) = move_to_processed(outbox_dir, &file) {
                warn!(error = %e, file = %file.display(), "ingest: failed to move processed file");
            }
        }
    }

    metrics.duration_ms = start.elapsed().as_millis() as u64;
    metrics
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Run the ingestor loop until SIGINT/SIGTERM: acquire the index lock,
/// ensure the outbox directories, open the global index, and poll on
/// `cfg.poll_interval` until a shutdown signal arrives, releasing the lock
/// on exit via guaranteed-finally.
pub async fn run_forever(cfg: IngestorConfig, metrics: MetricsCollector) -> Result<(), OcError> {
    ensure_outbox_dirs(&cfg.outbox_dir).map_err(|e| {
        OcError::new(ErrorCode::Internal, "failed to create outbox directories").with_source(e)
    })?;

    let lock = ExclusiveLock::new(cfg.index_lock_path.clone(), LockKind::IndexLease, "ingestor");
    let mut guard = lock
        .acquire()
        .map_err(|e| OcError::new(ErrorCode::LockTimeout, "failed to acquire index lock").with_source(e))?;

    let global = GlobalIndex::open(&cfg.global_db_path)?;
    let salt = load_or_init_salt(&cfg.global_root)?;

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut shutdown = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            _ = tokio::time::sleep(cfg.poll_interval) => {
                let tick = run_tick(&cfg.outbox_dir, &global, &salt, cfg.batch_size);
                debug!(?tick, "ingestor tick");
                metrics.record(tick);
            }
            _ = heartbeat.tick() => {
                if let Err(e) = guard.heartbeat() {
                    warn!(error = %e, "ingestor: failed to refresh index lease heartbeat");
                }
                info!(summary = ?metrics.summary(), "ingestor heartbeat");
            }
            () = &mut shutdown => {
                info!("ingestor: shutdown signal received");
                break;
            }
        }
    }

    guard
        .release()
        .map_err(|e| OcError::new(ErrorCode::LockTimeout, "failed to release index lock").with_source(e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocmem_core::ObservationBuilder;
    use std::fs;

    fn sample_obs(project: &str, title: &str) -> Observation {
        ObservationBuilder::new(
            "sess-1", project, "opencode", "Edit", ObservationType::Bugfix, title,
            "Fixed a real off-by-one error in the parser.",
        )
        .build()
    }

    #[test]
    fn harden_rejects_paths_outside_allowed_roots() {
        let dir = tempfile::tempdir().unwrap();
        // tempdir() on most systems lands under an OS temp root, not under
        // $HOME or the allow-listed roots, so this should be rejected
        // unless it happens to live under one of them.
        let path = dir.path().to_string_lossy().into_owned();
        let result = harden_project_path(&path);
        if let Ok(canonical) = &result {
            let home_allowed = dirs::home_dir().is_some_and(|h| canonical.starts_with(h));
            let root_allowed = ALLOWED_ROOTS.iter().any(|r| canonical.starts_with(r));
            assert!(home_allowed || root_allowed, "expected rejection for a path outside all allow-listed roots");
        }
    }

    #[test]
    fn harden_rejects_nonexistent_path() {
        let err = harden_project_path("/definitely/not/a/real/path/xyz").unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
    }

    #[test]
    fn validate_metadata_fills_defaults_when_absent() {
        let meta = validate_metadata(BTreeMap::new());
        assert_eq!(meta.get("scope").unwrap(), "branch");
        assert_eq!(meta.get("importance").unwrap(), "medium");
    }

    #[test]
    fn validate_metadata_replaces_invalid_values() {
        let mut meta = BTreeMap::new();
        meta.insert("scope".to_string(), serde_json::json!("nonsense"));
        meta.insert("importance".to_string(), serde_json::json!(42));
        let meta = validate_metadata(meta);
        assert_eq!(meta.get("scope").unwrap(), "branch");
        assert_eq!(meta.get("importance").unwrap(), "medium");
    }

    #[test]
    fn validate_metadata_preserves_valid_values_and_unknown_keys() {
        let mut meta = BTreeMap::new();
        meta.insert("scope".to_string(), serde_json::json!("global"));
        meta.insert("importance".to_string(), serde_json::json!("high"));
        meta.insert("custom_key".to_string(), serde_json::json!("kept"));
        let meta = validate_metadata(meta);
        assert_eq!(meta.get("scope").unwrap(), "global");
        assert_eq!(meta.get("importance").unwrap(), "high");
        assert_eq!(meta.get("custom_key").unwrap(), "kept");
    }

    #[test]
    fn relativize_strips_project_root_prefix() {
        let root = Path::new("/tmp/project");
        let paths = vec!["/tmp/project/src/main.rs".to_string(), "/elsewhere/file.rs".to_string()];
        let rel = relativize(paths, root);
        assert_eq!(rel[0], "src/main.rs");
        assert_eq!(rel[1], "/elsewhere/file.rs");
    }

    #[test]
    fn group_by_project_partitions_observations() {
        let obs = vec![sample_obs("a", "One"), sample_obs("b", "Two"), sample_obs("a", "Three")];
        let groups = group_by_project(obs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["a"].len(), 2);
        assert_eq!(groups["b"].len(), 1);
    }

    #[test]
    fn load_or_init_salt_is_stable_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let salt1 = load_or_init_salt(dir.path()).unwrap();
        let salt2 = load_or_init_salt(dir.path()).unwrap();
        assert_eq!(salt1, salt2);
    }

    #[test]
    fn ingest_to_project_and_update_global_index_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let project_root = dir.path().join("project");
        fs::create_dir_all(&project_root).unwrap();
        let project_path = project_root.to_string_lossy().into_owned();

        let events = vec![sample_obs(&project_path, "Fix parser bug")];
        let (canonical_root, summaries) = ingest_to_project(&project_path, events).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].title, "Fix parser bug");

        let global = GlobalIndex::open(&dir.path().join("index.db")).unwrap();
        let salt = [3u8; 32];
        update_global_index(&global, &salt, &canonical_root, &summaries).unwrap();

        let uuid = project_uuid(&canonical_root, &salt);
        let project = global.get_project(&uuid).unwrap().unwrap();
        assert_eq!(project.observation_count, 1);
    }

    #[test]
    fn run_tick_moves_file_to_processed_on_partial_success() {
        let dir = tempfile::tempdir().unwrap();
        let outbox_dir = dir.path().join("outbox");
        ensure_outbox_dirs(&outbox_dir).unwrap();
        let project_root = dir.path().join("project");
        fs::create_dir_all(&project_root).unwrap();
        let project_path = project_root.to_string_lossy().into_owned();

        let obs = sample_obs(&project_path, "Promoted via tick");
        let line = serde_json::to_string(&obs).unwrap();
        let file_path = outbox_dir.join("observations-2026-07-27.jsonl");
        fs::write(&file_path, format!("{line}\nnot valid json\n")).unwrap();

        let global = GlobalIndex::open(&dir.path().join("index.db")).unwrap();
        let salt = [1u8; 32];
        let metrics = run_tick(&outbox_dir, &global, &salt, 100);

        assert_eq!(metrics.files_processed, 1);
        assert_eq!(metrics.rows_ingested, 1);
        assert_eq!(metrics.malformed_lines, 1);
        assert!(!file_path.exists());
        let processed: Vec<_> = fs::read_dir(outbox_dir.join("processed")).unwrap().collect();
        assert_eq!(processed.len(), 1);
    }

    #[test]
    fn run_tick_leaves_file_in_place_when_every_group_fails() {
        let dir = tempfile::tempdir().unwrap();
        let outbox_dir = dir.path().join("outbox");
        ensure_outbox_dirs(&outbox_dir).unwrap();

        // A project path that does not exist on disk, so ingest_to_project
        // fails path hardening for every row.
        let obs = sample_obs("/nonexistent/project/path/zzz", "Will not ingest");
        let line = serde_json::to_string(&obs).unwrap();
        let file_path = outbox_dir.join("observations-2026-07-27.jsonl");
        fs::write(&file_path, format!("{line}\n")).unwrap();

        let global = GlobalIndex::open(&dir.path().join("index.db")).unwrap();
        let salt = [1u8; 32];
        let metrics = run_tick(&outbox_dir, &global, &salt, 100);

        assert_eq!(metrics.rows_ingested, 0);
        assert!(file_path.exists());
    }
}
