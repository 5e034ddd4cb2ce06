// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dual-path, crash-safe outbox: every observation is appended to a
//! per-day JSONL file (the path every runtime can rely on) and, when a
//! local SQLite mirror is available, also inserted into
//! `pending_observations` for [`drain`](Outbox::drain) to deliver to the
//! worker over HTTP.
//!
//! [`Outbox::push`] never panics and never blocks the caller beyond the
//! lock-wait budget: both write paths are best-effort, and failures are
//! logged rather than propagated.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use ocmem_core::{ImportRequest, Observation, ObservationBuilder, ObservationType, OutboxRecord};
use ocmem_lock::{ExclusiveLock, LockKind};
use ocmem_store::OutboxDb;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

const JSONL_LOCK_BUDGET: Duration = Duration::from_secs(2);
const DRAIN_BATCH_SIZE: i64 = 10;
const DEAD_AFTER_ATTEMPTS: u32 = 10;
const BASE_BACKOFF_MS: i64 = 5000;
const MAX_BACKOFF_MS: i64 = 30 * 60 * 1000;

/// Outcome of one [`Outbox::drain`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Rows successfully delivered and removed from the pending queue.
    pub delivered: usize,
    /// Rows that failed delivery but were rescheduled for retry.
    pub retried: usize,
    /// Rows that exhausted their retry budget or hit a permanent failure.
    pub dead: usize,
}

/// The durable, dual-path observation outbox.
pub struct Outbox {
    jsonl_dir: PathBuf,
    db: Option<OutboxDb>,
    http: reqwest::Client,
    worker_base_url: String,
    draining: Arc<AtomicBool>,
}

impl Outbox {
    /// Build an outbox appending JSONL files under `jsonl_dir` and, if
    /// `db` is `Some`, also mirroring rows there for [`drain`](Self::drain)
    /// to deliver to `worker_base_url`.
    #[must_use]
    pub fn new(jsonl_dir: PathBuf, db: Option<OutboxDb>, worker_base_url: impl Into<String>) -> Self {
        Self {
            jsonl_dir,
            db,
            http: reqwest::Client::new(),
            worker_base_url: worker_base_url.into(),
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Append `obs` to the JSONL log and, if a mirror is configured, to
    /// `pending_observations`. Scrubs the narrative/text/facts/concepts
    /// before either write. Falls back to a stub observation if the
    /// narrative is missing or too short. Never panics; both write paths
    /// are independently best-effort and failures are logged.
    pub fn push(&self, obs: Observation) {
        let obs = normalize_for_push(obs);

        if let Err(e) = self.append_jsonl(&obs) {
            warn!(error = %e, "outbox: failed to append JSONL record");
        }

        if let Some(db) = &self.db {
            if let Err(e) = db.push(&obs) {
                warn!(error = %e, "outbox: failed to mirror observation to sqlite");
            }
        }
    }

    fn append_jsonl(&self, obs: &Observation) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.jsonl_dir)?;
        let path = jsonl_path_for(&self.jsonl_dir, obs.created_at);
        let lock_path = path.with_extension("jsonl.lock");
        let lock = ExclusiveLock::new(lock_path, LockKind::OutboxJsonl, "outbox");

        let guard = acquire_with_jittered_retry(&lock, JSONL_LOCK_BUDGET).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "outbox jsonl lock busy")
        })?;

        let line = serde_json::to_string(obs)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(file, "{line}")?;

        drop(guard);
        Ok(())
    }

    /// Whether a drain is currently in flight; used by callers wiring up
    /// the deduplicated async trigger after every [`push`](Self::push).
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Drain up to 10 due pending rows: POST sessions then observations to
    /// the worker's `/api/import`, delete delivered rows, and reschedule or
    /// kill failures per the retry/backoff policy. A no-op (returning the
    /// default report) if no SQLite mirror is configured or a drain is
    /// already in flight.
    pub async fn drain(&self) -> DrainReport {
        if self.draining.swap(true, Ordering::SeqCst) {
            return DrainReport::default();
        }
        let report = self.drain_inner().await;
        self.draining.store(false, Ordering::SeqCst);
        report
    }

    async fn drain_inner(&self) -> DrainReport {
        let Some(db) = &self.db else {
            return DrainReport::default();
        };

        let due = match db.list_due(Utc::now(), DRAIN_BATCH_SIZE) {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "outbox: failed to list due rows");
                return DrainReport::default();
            }
        };
        if due.is_empty() {
            return DrainReport::default();
        }

        let observations: Vec<Observation> = due.iter().map(|r| r.observation.clone()).collect();
        let result = self.post_import(&observations).await;

        let mut report = DrainReport::default();
        match result {
            Ok(()) => {
                for row in &due {
                    if let Err(e) = db.delete(row.id) {
                        error!(error = %e, row = row.id, "outbox: failed to delete delivered row");
                    }
                }
                report.delivered = due.len();
            }
            Err(failure) => {
                for row in &due {
                    self.handle_delivery_failure(db, row, &failure, &mut report);
                }
            }
        }
        report
    }

    fn handle_delivery_failure(
        &self,
        db: &OutboxDb,
        row: &OutboxRecord,
        failure: &DeliveryFailure,
        report: &mut DrainReport,
    ) {
        let attempts = row.attempts + 1;
        let permanent = attempts >= DEAD_AFTER_ATTEMPTS || failure.is_permanent();
        let next_attempt_at = if permanent {
            None
        } else {
            let backoff_ms = (2i64.pow(attempts.min(20)) * BASE_BACKOFF_MS).min(MAX_BACKOFF_MS);
            Some(Utc::now() + chrono::Duration::milliseconds(backoff_ms))
        };

        if let Err(e) = db.record_failure(row.id, attempts, next_attempt_at, &failure.message) {
            error!(error = %e, row = row.id, "outbox: failed to record delivery failure");
        }

        if permanent {
            report.dead += 1;
        } else {
            report.retried += 1;
        }
    }

    async fn post_import(&self, observations: &[Observation]) -> Result<(), DeliveryFailure> {
        let url = format!("{}/api/import", self.worker_base_url.trim_end_matches('/'));
        // `ImportRequest` serializes `sessions` before `observations`,
        // matching the worker's "sessions first" processing order; the
        // outbox mirror only ever carries observations.
        let payload = ImportRequest {
            sessions: Vec::new(),
            observations: observations.to_vec(),
        };
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DeliveryFailure {
                message: e.to_string(),
                status: None,
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryFailure {
            message: format!("worker returned {status}: {body}"),
            status: Some(status.as_u16()),
        })
    }
}

struct DeliveryFailure {
    message: String,
    status: Option<u16>,
}

impl DeliveryFailure {
    /// A 4xx other than 429 is permanent; everything else (5xx, 429,
    /// network errors) is retried until the attempt cap is reached.
    fn is_permanent(&self) -> bool {
        matches!(self.status, Some(code) if (400..500).contains(&code) && code != 429)
    }
}

fn jsonl_path_for(dir: &Path, at: DateTime<Utc>) -> PathBuf {
    dir.join(format!("observations-{}.jsonl", at.format("%Y-%m-%d")))
}

fn acquire_with_jittered_retry(
    lock: &ExclusiveLock,
    budget: Duration,
) -> Option<ocmem_lock::LockGuard> {
    let deadline = Instant::now() + budget;
    loop {
        match lock.acquire() {
            Ok(guard) => return Some(guard),
            Err(_) if Instant::now() < deadline => {
                let jitter_ms: u64 = rand::thread_rng().gen_range(25..=50);
                std::thread::sleep(Duration::from_millis(jitter_ms));
            }
            Err(_) => return None,
        }
    }
}

/// Validate the narrative per the recording boundary rule; if it's missing
/// or too short for an observation type/tool that doesn't get always-record
/// treatment, synthesize a minimal stub narrative rather than dropping the
/// push entirely. Always scrubs narrative/text/facts/concepts and path
/// lists before anything reaches disk.
fn normalize_for_push(mut obs: Observation) -> Observation {
    if !obs.should_record() {
        obs = stub_narrative(obs);
    }
    obs.narrative = ocmem_scrub::scrub_str(&obs.narrative);
    obs.text = ocmem_scrub::scrub_str(&obs.text);
    obs.facts = obs.facts.iter().map(|f| ocmem_scrub::scrub_str(f)).collect();
    obs.concepts = obs.concepts.iter().map(|c| ocmem_scrub::scrub_str(c)).collect();
    obs.files_read = obs.files_read.iter().map(|f| ocmem_scrub::scrub_str(f)).collect();
    obs.files_modified = obs.files_modified.iter().map(|f| ocmem_scrub::scrub_str(f)).collect();
    obs
}

fn stub_narrative(obs: Observation) -> Observation {
    let narrative = format!("{} ran {} with no further detail captured.", obs.source, obs.tool);
    ObservationBuilder::new(
        obs.session_id,
        obs.project,
        obs.source,
        obs.tool,
        obs.ty,
        obs.title,
        narrative,
    )
    .text(obs.text)
    .facts(obs.facts)
    .concepts(obs.concepts)
    .files_read(obs.files_read)
    .files_modified(obs.files_modified)
    .prompt_number(obs.prompt_number)
    .created_at(obs.created_at)
    .build()
}
