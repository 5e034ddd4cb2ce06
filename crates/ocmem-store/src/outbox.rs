// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `pending_observations` mirror table backing the outbox's durable
//! SQLite leg (the JSONL leg lives in `ocmem-outbox` itself).

use crate::project::{type_from_str, type_str};
use crate::schema::{self, open_with_pragmas, OUTBOX_SCHEMA_V1};
use chrono::{DateTime, Utc};
use ocmem_core::{Observation, ObservationBuilder, OutboxRecord, OutboxStatus};
use ocmem_error::OcError;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

const OUTBOX_SCHEMA_VERSION: i64 = 1;

/// SQLite-backed mirror of the outbox's pending queue.
pub struct OutboxDb {
    conn: Arc<Mutex<Connection>>,
}

impl OutboxDb {
    /// Open (creating if absent) the outbox database at `path`.
    pub fn open(path: &Path) -> Result<Self, OcError> {
        let mut conn = open_with_pragmas(path)?;
        schema::migrate(&mut conn, OUTBOX_SCHEMA_VERSION, OUTBOX_SCHEMA_V1)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append one observation to the pending queue, returning its row id.
    pub fn push(&self, obs: &Observation) -> Result<i64, OcError> {
        let concepts = serde_json::to_string(&obs.concepts)
            .map_err(|e| schema::metadata_corrupt("pending_observations.concepts", e))?;
        let facts = serde_json::to_string(&obs.facts)
            .map_err(|e| schema::metadata_corrupt("pending_observations.facts", e))?;

        let conn = self.conn.lock().expect("outbox mutex poisoned");
        conn.execute(
            "INSERT INTO pending_observations (
                session_id, source, project, cwd, tool, title, type, narrative,
                concepts, facts, content, timestamp, attempts, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0, 'pending')",
            params![
                obs.session_id,
                obs.source,
                obs.project,
                Option::<String>::None,
                obs.tool,
                obs.title,
                type_str(obs.ty),
                obs.narrative,
                concepts,
                facts,
                obs.text,
                obs.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| schema::internal("push pending observation", e))?;
        Ok(conn.last_insert_rowid())
    }

    /// Pending rows due for another delivery attempt (`next_attempt_at` is
    /// unset or in the past), oldest first, capped at `limit`.
    pub fn list_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<OutboxRecord>, OcError> {
        let conn = self.conn.lock().expect("outbox mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, source, project, tool, title, type, narrative,
                        concepts, facts, content, timestamp, attempts, next_attempt_at,
                        last_error, status
                 FROM pending_observations
                 WHERE status = 'pending' AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                 ORDER BY id ASC LIMIT ?2",
            )
            .map_err(|e| schema::internal("prepare list_due", e))?;
        let rows = stmt
            .query_map(params![now.to_rfc3339(), limit], row_to_record)
            .map_err(|e| schema::internal("query list_due", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| schema::internal("read pending rows", e))
    }

    /// Remove a row after successful delivery.
    pub fn delete(&self, id: i64) -> Result<(), OcError> {
        let conn = self.conn.lock().expect("outbox mutex poisoned");
        conn.execute("DELETE FROM pending_observations WHERE id = ?1", params![id])
            .map_err(|e| schema::internal("delete pending observation", e))?;
        Ok(())
    }

    /// Record a failed delivery attempt: bump `attempts`, set the next retry
    /// time (or mark the row `dead` if `next_attempt_at` is `None`), and
    /// store the truncated error message.
    pub fn record_failure(
        &self,
        id: i64,
        attempts: u32,
        next_attempt_at: Option<DateTime<Utc>>,
        last_error: &str,
    ) -> Result<(), OcError> {
        let status = if next_attempt_at.is_some() { "pending" } else { "dead" };
        let conn = self.conn.lock().expect("outbox mutex poisoned");
        conn.execute(
            "UPDATE pending_observations
             SET attempts = ?2, next_attempt_at = ?3, last_error = ?4, status = ?5
             WHERE id = ?1",
            params![
                id,
                attempts,
                next_attempt_at.map(|t| t.to_rfc3339()),
                OutboxRecord::truncate_error(last_error),
                status,
            ],
        )
        .map_err(|e| schema::internal("record delivery failure", e))?;
        Ok(())
    }

    /// Count of rows in `pending` status, for the drain report.
    pub fn pending_count(&self) -> Result<i64, OcError> {
        let conn = self.conn.lock().expect("outbox mutex poisoned");
        conn.query_row(
            "SELECT COUNT(*) FROM pending_observations WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )
        .map_err(|e| schema::internal("count pending observations", e))
    }
}

fn row_to_record(row: &Row) -> rusqlite::Result<OutboxRecord> {
    let id: i64 = row.get(0)?;
    let session_id: String = row.get(1)?;
    let source: String = row.get(2)?;
    let project: String = row.get(3)?;
    let tool: String = row.get(4)?;
    let title: String = row.get(5)?;
    let ty: String = row.get(6)?;
    let narrative: String = row.get(7)?;
    let concepts: String = row.get(8)?;
    let facts: String = row.get(9)?;
    let content: Option<String> = row.get(10)?;
    let timestamp: String = row.get(11)?;
    let attempts: u32 = row.get(12)?;
    let next_attempt_at: Option<String> = row.get(13)?;
    let last_error: Option<String> = row.get(14)?;
    let status: String = row.get(15)?;

    let created_at = DateTime::parse_from_rfc3339(&timestamp)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    let observation = ObservationBuilder::new(
        session_id, project, source, tool, type_from_str(&ty), title, narrative,
    )
    .text(content.unwrap_or_default())
    .concepts(serde_json::from_str(&concepts).unwrap_or_default())
    .facts(serde_json::from_str(&facts).unwrap_or_default())
    .created_at(created_at)
    .build();

    Ok(OutboxRecord {
        id,
        observation,
        attempts,
        next_attempt_at: next_attempt_at.and_then(|s| {
            DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))
        }),
        last_error,
        status: if status == "dead" { OutboxStatus::Dead } else { OutboxStatus::Pending },
    })
}
