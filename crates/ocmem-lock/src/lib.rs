// SPDX-License-Identifier: MIT OR Apache-2.0
//! Advisory, file-based exclusive locks with heartbeat and staleness
//! detection: the worker startup lock and the Ingestor's index lease.
//!
//! Both locks share one schema (`{pid, hostname, source, timestamp}`) and
//! one acquisition algorithm — check-and-unlink-if-stale, then
//! exclusive-create — distinguished only by their staleness threshold.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use sysinfo::{Pid, System};
use thiserror::Error;

/// Which of the two advisory locks is being taken, determining its
/// staleness threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Prevents duplicate worker process launch across hosts. Stale after
    /// 30 seconds without a heartbeat.
    WorkerStartup,
    /// The Ingestor's exclusive write lease. Stale after 15 seconds without
    /// a heartbeat (refreshed every 5s while held).
    IndexLease,
    /// Serializes appends to one outbox JSONL file. Stale after 30 seconds;
    /// acquisition is retried by the caller with jittered backoff rather
    /// than held across a long-lived guard.
    OutboxJsonl,
}

impl LockKind {
    /// Staleness threshold in milliseconds.
    #[must_use]
    pub fn stale_after_ms(self) -> i64 {
        match self {
            Self::WorkerStartup => 30_000,
            Self::IndexLease => 15_000,
            Self::OutboxJsonl => 30_000,
        }
    }
}

/// On-disk lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// PID of the process holding the lock.
    pub pid: u32,
    /// Hostname of the machine holding the lock.
    pub hostname: String,
    /// Free-form label identifying the lock holder (e.g. `"ingestor"`).
    pub source: String,
    /// Epoch milliseconds of the last heartbeat.
    pub timestamp: i64,
}

/// Errors from lock acquisition, heartbeat, or release.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another process holds the lock and it is not stale.
    #[error("lock at {path} is held by pid {} on {}", holder.pid, holder.hostname)]
    Held {
        /// Path of the contended lockfile.
        path: PathBuf,
        /// The record of the current (live) holder.
        holder: LockRecord,
    },
    /// Exclusive-create raced with another process between the staleness
    /// check and creation; the caller should retry.
    #[error("lock at {0} was taken concurrently, retry")]
    Collision(PathBuf),
    /// I/O error reading, writing, or removing the lockfile.
    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),
    /// The lockfile's contents were not valid JSON — treated as corruption.
    /// Per error-handling policy, a corrupt lockfile is taken rather than
    /// propagated: callers see this only if the forced takeover itself fails.
    #[error("lock file corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn current_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

fn pid_alive(pid: u32) -> bool {
    let system = System::new_all();
    system.process(Pid::from_u32(pid)).is_some()
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

fn is_stale(record: &LockRecord, kind: LockKind, my_hostname: &str) -> bool {
    let too_old = now_ms() - record.timestamp > kind.stale_after_ms();
    let dead_on_same_host = record.hostname == my_hostname && !pid_alive(record.pid);
    too_old || dead_on_same_host
}

#[cfg(unix)]
fn restrict_to_owner(file: &fs::File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_file: &fs::File) -> io::Result<()> {
    Ok(())
}

fn write_record(path: &Path, record: &LockRecord, create_new: bool) -> Result<(), LockError> {
    let body = serde_json::to_vec(record)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(create_new)
        .truncate(!create_new)
        .open(path)?;
    restrict_to_owner(&file)?;
    file.write_all(&body)?;
    Ok(())
}

/// An exclusive file lock, not yet acquired.
#[derive(Debug, Clone)]
pub struct ExclusiveLock {
    path: PathBuf,
    kind: LockKind,
    source: String,
}

impl ExclusiveLock {
    /// Describe a lock at `path` of the given `kind`, identifying this
    /// holder as `source` if acquired.
    #[must_use]
    pub fn new(path: PathBuf, kind: LockKind, source: impl Into<String>) -> Self {
        Self {
            path,
            kind,
            source: source.into(),
        }
    }

    /// Attempt to acquire the lock.
    ///
    /// If an existing lockfile is present but stale — its recorded PID is
    /// dead on the same host, or its heartbeat predates the staleness
    /// threshold, or its contents are unparseable — it is removed and
    /// acquisition proceeds. If a live holder is found, returns
    /// [`LockError::Held`]. Retry on [`LockError::Collision`] is the
    /// caller's responsibility.
    pub fn acquire(&self) -> Result<LockGuard, LockError> {
        let my_hostname = current_hostname();
        match read_record(&self.path) {
            Some(existing) if !is_stale(&existing, self.kind, &my_hostname) => {
                return Err(LockError::Held {
                    path: self.path.clone(),
                    holder: existing,
                });
            }
            Some(_) => {
                // Stale or corrupt: take the lock over.
                let _ = fs::remove_file(&self.path);
            }
            None => {}
        }

        let record = LockRecord {
            pid: std::process::id(),
            hostname: my_hostname,
            source: self.source.clone(),
            timestamp: now_ms(),
        };

        match write_record(&self.path, &record, true) {
            Ok(()) => Ok(LockGuard {
                path: self.path.clone(),
                kind: self.kind,
                record,
                released: false,
            }),
            Err(LockError::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(LockError::Collision(self.path.clone()))
            }
            Err(e) => Err(e),
        }
    }
}

/// A held lock. Dropping it releases the lockfile on a best-effort basis;
/// callers that need to observe release failures should call
/// [`LockGuard::release`] explicitly.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    kind: LockKind,
    record: LockRecord,
    released: bool,
}

impl LockGuard {
    /// Refresh the heartbeat timestamp. Call on the kind's cadence (5s for
    /// [`LockKind::IndexLease`]).
    pub fn heartbeat(&mut self) -> Result<(), LockError> {
        self.record.timestamp = now_ms();
        write_record(&self.path, &self.record, false)
    }

    /// Which kind of lock this guard holds.
    #[must_use]
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// The held lock's current record.
    #[must_use]
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Release the lock, removing the lockfile.
    pub fn release(mut self) -> Result<(), LockError> {
        fs::remove_file(&self.path)?;
        self.released = true;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.lock");
        let lock = ExclusiveLock::new(path.clone(), LockKind::WorkerStartup, "worker");
        let guard = lock.acquire().unwrap();
        assert!(path.exists());
        assert_eq!(guard.record().source, "worker");
        guard.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_while_live_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.lock");
        let lock = ExclusiveLock::new(path.clone(), LockKind::WorkerStartup, "worker");
        let _guard = lock.acquire().unwrap();

        let other = ExclusiveLock::new(path, LockKind::WorkerStartup, "other");
        let err = other.acquire().unwrap_err();
        assert!(matches!(err, LockError::Held { .. }));
    }

    #[test]
    fn stale_heartbeat_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.lock");
        let stale_record = LockRecord {
            pid: std::process::id(),
            hostname: current_hostname(),
            source: "old-holder".to_string(),
            timestamp: now_ms() - 20_000,
        };
        write_record(&path, &stale_record, true).unwrap();

        let lock = ExclusiveLock::new(path, LockKind::IndexLease, "new-holder");
        let guard = lock.acquire().unwrap();
        assert_eq!(guard.record().source, "new-holder");
    }

    #[test]
    fn dead_pid_on_same_host_is_stale_even_within_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.lock");
        // PID 0 is never a real user process; treat as dead.
        let dead_record = LockRecord {
            pid: 0,
            hostname: current_hostname(),
            source: "dead".to_string(),
            timestamp: now_ms(),
        };
        write_record(&path, &dead_record, true).unwrap();

        let lock = ExclusiveLock::new(path, LockKind::IndexLease, "new-holder");
        let guard = lock.acquire().unwrap();
        assert_eq!(guard.record().source, "new-holder");
    }

    #[test]
    fn different_host_record_is_not_declared_dead_by_pid_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.lock");
        let remote_record = LockRecord {
            pid: 0,
            hostname: "some-other-host".to_string(),
            source: "remote".to_string(),
            timestamp: now_ms(),
        };
        write_record(&path, &remote_record, true).unwrap();

        // Fresh heartbeat, different host: liveness can't be verified, and
        // it is not old enough to be stale by timestamp alone.
        let lock = ExclusiveLock::new(path, LockKind::IndexLease, "new-holder");
        let err = lock.acquire().unwrap_err();
        assert!(matches!(err, LockError::Held { .. }));
    }

    #[test]
    fn corrupt_lockfile_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.lock");
        fs::write(&path, b"not json").unwrap();

        let lock = ExclusiveLock::new(path, LockKind::IndexLease, "new-holder");
        let guard = lock.acquire().unwrap();
        assert_eq!(guard.record().source, "new-holder");
    }

    #[test]
    fn heartbeat_updates_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.lock");
        let lock = ExclusiveLock::new(path, LockKind::IndexLease, "worker");
        let mut guard = lock.acquire().unwrap();
        let first = guard.record().timestamp;
        std::thread::sleep(std::time::Duration::from_millis(5));
        guard.heartbeat().unwrap();
        assert!(guard.record().timestamp >= first);
    }

    #[test]
    fn drop_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.lock");
        {
            let lock = ExclusiveLock::new(path.clone(), LockKind::WorkerStartup, "worker");
            let _guard = lock.acquire().unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
