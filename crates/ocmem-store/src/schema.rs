// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pragmas, schema DDL, and the version-gated migration runner shared by
//! [`crate::ProjectStore`], [`crate::GlobalIndex`], and [`crate::OutboxDb`].

use ocmem_error::{ErrorCode, OcError};
use rusqlite::{Connection, TransactionBehavior};
use std::path::Path;

pub(crate) fn db_open_failed(path: &Path, source: rusqlite::Error) -> OcError {
    OcError::new(
        ErrorCode::DbOpenFailed,
        format!("failed to open sqlite database at {}", path.display()),
    )
    .with_context("path", path.to_string_lossy().into_owned())
    .with_source(source)
}

pub(crate) fn internal(context: &str, source: rusqlite::Error) -> OcError {
    OcError::new(ErrorCode::Internal, format!("sqlite error during {context}")).with_source(source)
}

pub(crate) fn metadata_corrupt(context: &str, source: serde_json::Error) -> OcError {
    OcError::new(
        ErrorCode::MetadataCorrupt,
        format!("invalid metadata JSON in {context}"),
    )
    .with_source(source)
}

/// Open a connection and apply the standard write-path pragmas: WAL journal
/// mode, `synchronous=NORMAL`, and a 5s busy timeout.
pub(crate) fn open_with_pragmas(path: &Path) -> Result<Connection, OcError> {
    let conn = Connection::open(path).map_err(|e| db_open_failed(path, e))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| internal("pragma journal_mode", e))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|e| internal("pragma synchronous", e))?;
    conn.pragma_update(None, "busy_timeout", 5000)
        .map_err(|e| internal("pragma busy_timeout", e))?;
    Ok(conn)
}

/// Open a read-only connection with the same busy timeout, used by query
/// paths that must never write to a store they don't own.
pub(crate) fn open_read_only(path: &Path) -> Result<Connection, OcError> {
    let conn = Connection::open_with_flags(path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| db_open_failed(path, e))?;
    conn.pragma_update(None, "busy_timeout", 5000)
        .map_err(|e| internal("pragma busy_timeout", e))?;
    Ok(conn)
}

/// Run `statements` (a `;`-separated DDL batch) inside a `BEGIN IMMEDIATE`
/// transaction, gated on `oc_meta.schema_version`. A no-op if the stored
/// version is already `>= target_version` — running migrations twice never
/// re-applies DDL and never decreases the stored version.
pub(crate) fn migrate(
    conn: &mut Connection,
    target_version: i64,
    statements: &str,
) -> Result<(), OcError> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS oc_meta (key TEXT PRIMARY KEY, value TEXT)")
        .map_err(|e| internal("create oc_meta", e))?;

    let current: i64 = conn
        .query_row(
            "SELECT value FROM oc_meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if current >= target_version {
        return Ok(());
    }

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| internal("begin immediate", e))?;
    tx.execute_batch(statements)
        .map_err(|e| internal("apply migration DDL", e))?;
    tx.execute(
        "INSERT INTO oc_meta(key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![target_version.to_string()],
    )
    .map_err(|e| internal("record schema_version", e))?;
    tx.commit().map_err(|e| internal("commit migration", e))?;
    Ok(())
}

/// `oc_metadata` + FTS5 tokenizer shared across project and global
/// observation tables. Not specified precisely by operation semantics;
/// `unicode61 remove_diacritics 2` is the implementer's documented choice
/// (see `DESIGN.md`).
pub(crate) const FTS_TOKENIZER: &str = "unicode61 remove_diacritics 2";

pub(crate) const PROJECT_SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_session_id TEXT NOT NULL,
    project TEXT NOT NULL,
    type TEXT NOT NULL,
    title TEXT NOT NULL,
    subtitle TEXT,
    narrative TEXT NOT NULL,
    text TEXT NOT NULL DEFAULT '',
    facts TEXT NOT NULL DEFAULT '[]',
    concepts TEXT NOT NULL DEFAULT '[]',
    files_read TEXT NOT NULL DEFAULT '[]',
    files_modified TEXT NOT NULL DEFAULT '[]',
    prompt_number INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    created_at_epoch INTEGER NOT NULL,
    oc_metadata TEXT NOT NULL DEFAULT '{}',
    source TEXT NOT NULL,
    tool TEXT NOT NULL,
    meta_branch TEXT GENERATED ALWAYS AS (json_extract(oc_metadata, '$.branch')) STORED,
    meta_importance TEXT GENERATED ALWAYS AS (json_extract(oc_metadata, '$.importance')) STORED,
    meta_scope TEXT GENERATED ALWAYS AS (json_extract(oc_metadata, '$.scope')) STORED,
    meta_promoted_at TEXT GENERATED ALWAYS AS (json_extract(oc_metadata, '$.promoted_at')) STORED,
    meta_archived_at TEXT GENERATED ALWAYS AS (json_extract(oc_metadata, '$.archived_at')) STORED,
    deontic_type TEXT GENERATED ALWAYS AS (json_extract(oc_metadata, '$.deontic_type')) STORED
);
CREATE INDEX IF NOT EXISTS idx_observations_session ON observations(memory_session_id);
CREATE INDEX IF NOT EXISTS idx_observations_project ON observations(project);
CREATE INDEX IF NOT EXISTS idx_observations_type ON observations(type);
CREATE INDEX IF NOT EXISTS idx_observations_created_at ON observations(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_observations_meta_branch ON observations(meta_branch);
CREATE INDEX IF NOT EXISTS idx_observations_meta_importance_high ON observations(meta_importance) WHERE meta_importance = 'high';
CREATE INDEX IF NOT EXISTS idx_observations_deontic_type ON observations(deontic_type);

CREATE VIRTUAL TABLE IF NOT EXISTS observations_fts USING fts5(
    title, subtitle, narrative, text,
    content = 'observations',
    content_rowid = 'id',
    tokenize = 'unicode61 remove_diacritics 2'
);
CREATE TRIGGER IF NOT EXISTS observations_ai AFTER INSERT ON observations BEGIN
    INSERT INTO observations_fts(rowid, title, subtitle, narrative, text)
    VALUES (new.id, new.title, new.subtitle, new.narrative, new.text);
END;

CREATE TABLE IF NOT EXISTS session_summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    request TEXT NOT NULL DEFAULT '',
    investigated TEXT NOT NULL DEFAULT '',
    learned TEXT NOT NULL DEFAULT '',
    completed TEXT NOT NULL DEFAULT '',
    next_steps TEXT NOT NULL DEFAULT '',
    notes TEXT NOT NULL DEFAULT '',
    token_investment INTEGER,
    created_at TEXT NOT NULL,
    created_at_epoch INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_session_summaries_created_at ON session_summaries(created_at_epoch DESC);
"#;

pub(crate) const GLOBAL_SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    project_uuid TEXT PRIMARY KEY,
    absolute_path TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    last_sync_at TEXT,
    observation_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT UNIQUE,
    project_uuid TEXT NOT NULL REFERENCES projects(project_uuid),
    type TEXT NOT NULL,
    title TEXT NOT NULL,
    narrative TEXT NOT NULL,
    importance INTEGER NOT NULL DEFAULT 0,
    branch TEXT,
    created_at TEXT NOT NULL,
    oc_metadata TEXT NOT NULL DEFAULT '{}',
    meta_importance_score INTEGER GENERATED ALWAYS AS (json_extract(oc_metadata, '$.importance_score')) STORED
);
CREATE INDEX IF NOT EXISTS idx_global_observations_type ON observations(type);
CREATE INDEX IF NOT EXISTS idx_global_observations_created_at ON observations(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_global_observations_importance_high ON observations(meta_importance_score) WHERE meta_importance_score >= 70;

CREATE VIRTUAL TABLE IF NOT EXISTS observations_fts USING fts5(
    title, narrative,
    content = 'observations',
    content_rowid = 'id',
    tokenize = 'unicode61 remove_diacritics 2'
);
CREATE TRIGGER IF NOT EXISTS observations_ai AFTER INSERT ON observations BEGIN
    INSERT INTO observations_fts(rowid, title, narrative)
    VALUES (new.id, new.title, new.narrative);
END;

CREATE TABLE IF NOT EXISTS observation_relationships (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL,
    target_id INTEGER NOT NULL,
    relationship_type TEXT NOT NULL CHECK (
        relationship_type IN ('references', 'extends', 'conflicts_with', 'depends_on', 'follows', 'modifies')
    ),
    confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at_epoch INTEGER NOT NULL,
    UNIQUE(source_id, target_id, relationship_type)
);
CREATE INDEX IF NOT EXISTS idx_rel_source ON observation_relationships(source_id);
CREATE INDEX IF NOT EXISTS idx_rel_target ON observation_relationships(target_id);
CREATE INDEX IF NOT EXISTS idx_rel_source_target_confidence ON observation_relationships(source_id, target_id, confidence DESC);
CREATE INDEX IF NOT EXISTS idx_rel_confidence_high ON observation_relationships(confidence) WHERE confidence >= 0.7;
"#;

pub(crate) const OUTBOX_SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS pending_observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    source TEXT NOT NULL,
    project TEXT NOT NULL,
    cwd TEXT,
    tool TEXT NOT NULL,
    title TEXT NOT NULL,
    type TEXT NOT NULL,
    narrative TEXT NOT NULL,
    concepts TEXT NOT NULL DEFAULT '[]',
    facts TEXT NOT NULL DEFAULT '[]',
    content TEXT,
    timestamp TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT,
    last_error TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
);
CREATE INDEX IF NOT EXISTS idx_pending_status ON pending_observations(status);
CREATE INDEX IF NOT EXISTS idx_pending_next_attempt ON pending_observations(next_attempt_at);
"#;
