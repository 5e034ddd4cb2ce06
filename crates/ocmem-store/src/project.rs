// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-project `memory.db`: one `observations` table plus its FTS5
//! shadow, scoped to a single working directory.

use crate::query::ObservationFilter;
use crate::schema::{self, open_read_only, open_with_pragmas, PROJECT_SCHEMA_V1};
use chrono::{DateTime, TimeZone, Utc};
use ocmem_core::{Observation, ObservationBuilder, ObservationType, SessionSummary};
use ocmem_error::OcError;
use rusqlite::{
    params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension, Row,
    TransactionBehavior,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

const PROJECT_SCHEMA_VERSION: i64 = 1;

/// A per-project SQLite store, holding that project's `observations` and
/// their full-text index.
pub struct ProjectStore {
    conn: Arc<Mutex<Connection>>,
}

impl ProjectStore {
    /// Open (creating if absent) the project database at `path`, applying
    /// pragmas and running pending migrations.
    pub fn open(path: &Path) -> Result<Self, OcError> {
        let mut conn = open_with_pragmas(path)?;
        schema::migrate(&mut conn, PROJECT_SCHEMA_VERSION, PROJECT_SCHEMA_V1)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open the same database read-only, for query-path callers that must
    /// never block on or interfere with ingest writes.
    pub fn open_read_only(path: &Path) -> Result<Self, OcError> {
        let conn = open_read_only(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert one observation, returning its assigned row id.
    pub fn insert_observation(&self, obs: &Observation) -> Result<i64, OcError> {
        let conn = self.conn.lock().expect("project store mutex poisoned");
        insert_one(&conn, obs)
    }

    /// Insert a batch of observations within a single `BEGIN IMMEDIATE`
    /// transaction: either every row lands, or (on the first row error) the
    /// whole batch rolls back and nothing is written.
    pub fn insert_batch(&self, observations: &[Observation]) -> Result<Vec<i64>, OcError> {
        let mut conn = self.conn.lock().expect("project store mutex poisoned");
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| schema::internal("begin immediate (insert_batch)", e))?;
        let mut ids = Vec::with_capacity(observations.len());
        for obs in observations {
            ids.push(insert_one(&tx, obs)?);
        }
        tx.commit().map_err(|e| schema::internal("commit insert_batch", e))?;
        Ok(ids)
    }

    /// The `limit` most recent observations for `project`, newest first.
    pub fn list_recent(&self, project: &str, limit: i64) -> Result<Vec<Observation>, OcError> {
        let conn = self.conn.lock().expect("project store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, memory_session_id, project, source, tool, type, title, subtitle,
                        narrative, text, facts, concepts, files_read, files_modified,
                        prompt_number, created_at, created_at_epoch, oc_metadata
                 FROM observations WHERE project = ?1
                 ORDER BY created_at_epoch DESC LIMIT ?2",
            )
            .map_err(|e| schema::internal("prepare list_recent", e))?;
        let rows = stmt
            .query_map(params![project, limit], row_to_observation)
            .map_err(|e| schema::internal("query list_recent", e))?;
        collect_observations(rows)
    }

    /// Full-text search over `title`, `subtitle`, `narrative`, and `text`,
    /// scoped to `project`, ranked by FTS5's default bm25 ordering.
    pub fn search_fts(
        &self,
        project: &str,
        query: &str,
        limit: i64,
    ) -> Result<Vec<Observation>, OcError> {
        let conn = self.conn.lock().expect("project store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT o.id, o.memory_session_id, o.project, o.source, o.tool, o.type, o.title,
                        o.subtitle, o.narrative, o.text, o.facts, o.concepts, o.files_read,
                        o.files_modified, o.prompt_number, o.created_at, o.created_at_epoch,
                        o.oc_metadata
                 FROM observations_fts f
                 JOIN observations o ON o.id = f.rowid
                 WHERE observations_fts MATCH ?1 AND o.project = ?2
                 ORDER BY rank LIMIT ?3",
            )
            .map_err(|e| schema::internal("prepare search_fts", e))?;
        let rows = stmt
            .query_map(params![query, project, limit], row_to_observation)
            .map_err(|e| schema::internal("query search_fts", e))?;
        collect_observations(rows)
    }

    /// Filtered query against this project's store, used by the branch and
    /// project scopes of the query router. Builds parameterized SQL from
    /// `filter`; text matching (when `filter.query` is set) is ranked by
    /// FTS5's bm25 `rank`, otherwise rows are ordered newest-first.
    pub fn search(&self, filter: &ObservationFilter) -> Result<Vec<Observation>, OcError> {
        let mut conditions = vec!["1 = 1".to_string()];
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(project) = &filter.project {
            conditions.push("o.project = ?".to_string());
            args.push(SqlValue::from(project.clone()));
        }

        let uses_fts = filter.query.is_some();
        if let Some(q) = &filter.query {
            conditions.push("observations_fts MATCH ?".to_string());
            args.push(SqlValue::from(q.clone()));
        }
        if !filter.types.is_empty() {
            let placeholders = vec!["?"; filter.types.len()].join(", ");
            conditions.push(format!("o.type IN ({placeholders})"));
            for ty in &filter.types {
                args.push(SqlValue::from(type_str(*ty).to_string()));
            }
        }
        if let Some(branch) = &filter.branch {
            conditions.push("o.meta_branch = ?".to_string());
            args.push(SqlValue::from(branch.clone()));
        }
        if !filter.importance_tiers.is_empty() {
            let placeholders = vec!["?"; filter.importance_tiers.len()].join(", ");
            conditions.push(format!("o.meta_importance IN ({placeholders})"));
            for tier in &filter.importance_tiers {
                args.push(SqlValue::from(tier.clone()));
            }
        }
        if let Some(since) = filter.since {
            conditions.push("o.created_at_epoch >= ?".to_string());
            args.push(SqlValue::from(since.timestamp_millis()));
        }
        if filter.exclude_archived {
            conditions.push("o.meta_archived_at IS NULL".to_string());
        }

        let from_clause = if uses_fts {
            "FROM observations_fts JOIN observations o ON o.id = observations_fts.rowid"
        } else {
            "FROM observations o"
        };
        let order_clause = if uses_fts { "ORDER BY rank" } else { "ORDER BY o.created_at_epoch DESC" };

        let sql = format!(
            "SELECT o.id, o.memory_session_id, o.project, o.source, o.tool, o.type, o.title,
                    o.subtitle, o.narrative, o.text, o.facts, o.concepts, o.files_read,
                    o.files_modified, o.prompt_number, o.created_at, o.created_at_epoch,
                    o.oc_metadata
             {from_clause}
             WHERE {where_clause}
             {order_clause}
             LIMIT ?",
            where_clause = conditions.join(" AND "),
        );
        args.push(SqlValue::from(filter.limit));

        let conn = self.conn.lock().expect("project store mutex poisoned");
        let mut stmt = conn.prepare(&sql).map_err(|e| schema::internal("prepare search", e))?;
        let rows = stmt
            .query_map(params_from_iter(args), row_to_observation)
            .map_err(|e| schema::internal("query search", e))?;
        collect_observations(rows)
    }

    /// The `limit` observations for `project` with the highest
    /// `oc_metadata.importance_score`, ties broken newest-first. Used by the
    /// manifest builder's initial candidate fetch.
    pub fn top_by_importance(&self, project: &str, limit: i64) -> Result<Vec<Observation>, OcError> {
        let conn = self.conn.lock().expect("project store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, memory_session_id, project, source, tool, type, title, subtitle,
                        narrative, text, facts, concepts, files_read, files_modified,
                        prompt_number, created_at, created_at_epoch, oc_metadata
                 FROM observations WHERE project = ?1
                 ORDER BY CAST(json_extract(oc_metadata, '$.importance_score') AS INTEGER) DESC,
                          created_at_epoch DESC
                 LIMIT ?2",
            )
            .map_err(|e| schema::internal("prepare top_by_importance", e))?;
        let rows = stmt
            .query_map(params![project, limit], row_to_observation)
            .map_err(|e| schema::internal("query top_by_importance", e))?;
        collect_observations(rows)
    }

    /// Whether this database has a `session_summaries` table. Read-only
    /// stores opened against a database predating that table should degrade
    /// gracefully rather than error.
    pub fn has_session_summaries_table(&self) -> Result<bool, OcError> {
        let conn = self.conn.lock().expect("project store mutex poisoned");
        conn.query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'session_summaries'",
            [],
            |_| Ok(()),
        )
        .optional()
        .map_err(|e| schema::internal("check session_summaries table", e))
        .map(|found| found.is_some())
    }

    /// Persist a session summary row.
    pub fn insert_session_summary(&self, summary: &SessionSummary) -> Result<i64, OcError> {
        let conn = self.conn.lock().expect("project store mutex poisoned");
        let now = Utc::now();
        conn.execute(
            "INSERT INTO session_summaries (
                session_id, request, investigated, learned, completed, next_steps, notes,
                token_investment, created_at, created_at_epoch
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                summary.session_id,
                summary.request,
                summary.investigated,
                summary.learned,
                summary.completed,
                summary.next_steps,
                summary.notes,
                summary.token_investment.map(|t| t as i64),
                now.to_rfc3339(),
                now.timestamp_millis(),
            ],
        )
        .map_err(|e| schema::internal("insert session summary", e))?;
        Ok(conn.last_insert_rowid())
    }

    /// The `limit` most recent session summaries, newest first. Returns an
    /// empty vec (rather than erroring) when `session_summaries` doesn't
    /// exist yet.
    pub fn latest_session_summaries(&self, limit: i64) -> Result<Vec<SessionSummary>, OcError> {
        if !self.has_session_summaries_table()? {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().expect("project store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT session_id, request, investigated, learned, completed, next_steps, notes,
                        token_investment
                 FROM session_summaries ORDER BY created_at_epoch DESC LIMIT ?1",
            )
            .map_err(|e| schema::internal("prepare latest_session_summaries", e))?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(SessionSummary {
                    session_id: row.get(0)?,
                    request: row.get(1)?,
                    investigated: row.get(2)?,
                    learned: row.get(3)?,
                    completed: row.get(4)?,
                    next_steps: row.get(5)?,
                    notes: row.get(6)?,
                    token_investment: row.get::<_, Option<i64>>(7)?.map(|t| t as u64),
                })
            })
            .map_err(|e| schema::internal("query latest_session_summaries", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| schema::internal("read session summary rows", e))
    }
}

fn insert_one(conn: &Connection, obs: &Observation) -> Result<i64, OcError> {
    let facts = serde_json::to_string(&obs.facts)
        .map_err(|e| schema::metadata_corrupt("observations.facts", e))?;
    let concepts = serde_json::to_string(&obs.concepts)
        .map_err(|e| schema::metadata_corrupt("observations.concepts", e))?;
    let files_read = serde_json::to_string(&obs.files_read)
        .map_err(|e| schema::metadata_corrupt("observations.files_read", e))?;
    let files_modified = serde_json::to_string(&obs.files_modified)
        .map_err(|e| schema::metadata_corrupt("observations.files_modified", e))?;
    let oc_metadata = serde_json::to_string(&obs.oc_metadata)
        .map_err(|e| schema::metadata_corrupt("observations.oc_metadata", e))?;

    conn.execute(
        "INSERT INTO observations (
            memory_session_id, project, type, title, subtitle, narrative, text,
            facts, concepts, files_read, files_modified, prompt_number,
            created_at, created_at_epoch, oc_metadata, source, tool
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            obs.session_id,
            obs.project,
            type_str(obs.ty),
            obs.title,
            obs.subtitle,
            obs.narrative,
            obs.text,
            facts,
            concepts,
            files_read,
            files_modified,
            obs.prompt_number,
            obs.created_at.to_rfc3339(),
            obs.created_at_epoch,
            oc_metadata,
            obs.source,
            obs.tool,
        ],
    )
    .map_err(|e| schema::internal("insert observation", e))?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn type_str(ty: ObservationType) -> &'static str {
    match ty {
        ObservationType::Decision => "decision",
        ObservationType::Bugfix => "bugfix",
        ObservationType::Feature => "feature",
        ObservationType::Refactor => "refactor",
        ObservationType::Discovery => "discovery",
        ObservationType::Change => "change",
        ObservationType::Summary => "summary",
    }
}

pub(crate) fn type_from_str(s: &str) -> ObservationType {
    match s {
        "decision" => ObservationType::Decision,
        "bugfix" => ObservationType::Bugfix,
        "feature" => ObservationType::Feature,
        "refactor" => ObservationType::Refactor,
        "discovery" => ObservationType::Discovery,
        "summary" => ObservationType::Summary,
        _ => ObservationType::Change,
    }
}

fn epoch_ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn row_to_observation(row: &Row) -> rusqlite::Result<Observation> {
    let id: i64 = row.get(0)?;
    let session_id: String = row.get(1)?;
    let project: String = row.get(2)?;
    let source: String = row.get(3)?;
    let tool: String = row.get(4)?;
    let ty: String = row.get(5)?;
    let title: String = row.get(6)?;
    let subtitle: Option<String> = row.get(7)?;
    let narrative: String = row.get(8)?;
    let text: String = row.get(9)?;
    let facts: String = row.get(10)?;
    let concepts: String = row.get(11)?;
    let files_read: String = row.get(12)?;
    let files_modified: String = row.get(13)?;
    let prompt_number: u32 = row.get(14)?;
    let created_at: String = row.get(15)?;
    let created_at_epoch: i64 = row.get(16)?;
    let oc_metadata: String = row.get(17)?;

    let mut builder = ObservationBuilder::new(
        session_id,
        project,
        source,
        tool,
        type_from_str(&ty),
        title,
        narrative,
    )
    .text(text)
    .facts(serde_json::from_str(&facts).unwrap_or_default())
    .concepts(serde_json::from_str(&concepts).unwrap_or_default())
    .files_read(serde_json::from_str(&files_read).unwrap_or_default())
    .files_modified(serde_json::from_str(&files_modified).unwrap_or_default())
    .prompt_number(prompt_number)
    .created_at(
        DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| epoch_ms_to_utc(created_at_epoch)),
    );
    if let Some(subtitle) = subtitle {
        builder = builder.subtitle(subtitle);
    }
    let metadata: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&oc_metadata).unwrap_or_default();
    let mut obs = builder.build();
    obs.id = Some(id);
    obs.oc_metadata = metadata;
    Ok(obs)
}

fn collect_observations(
    rows: rusqlite::MappedRows<impl FnMut(&Row) -> rusqlite::Result<Observation>>,
) -> Result<Vec<Observation>, OcError> {
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| schema::internal("read observation rows", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocmem_core::ObservationBuilder;

    fn sample(project: &str, title: &str, narrative: &str) -> Observation {
        ObservationBuilder::new(
            "sess-1",
            project,
            "opencode",
            "Edit",
            ObservationType::Bugfix,
            title,
            narrative,
        )
        .build()
    }

    #[test]
    fn insert_and_list_recent_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(&dir.path().join("memory.db")).unwrap();
        let id = store.insert_observation(&sample("proj-a", "Fix bug", "Fixed the off-by-one error.")).unwrap();
        assert!(id > 0);

        let recent = store.list_recent("proj-a", 10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].title, "Fix bug");
        assert_eq!(recent[0].ty, ObservationType::Bugfix);
    }

    #[test]
    fn list_recent_is_newest_first_and_scoped_to_project() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(&dir.path().join("memory.db")).unwrap();
        store.insert_observation(&sample("a", "First", "Narrative one goes here.")).unwrap();
        store.insert_observation(&sample("b", "Other project", "Narrative for other project.")).unwrap();
        store.insert_observation(&sample("a", "Second", "Narrative two goes here.")).unwrap();

        let recent = store.list_recent("a", 10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].title, "Second");
        assert_eq!(recent[1].title, "First");
    }

    #[test]
    fn insert_batch_writes_all_rows_in_one_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(&dir.path().join("memory.db")).unwrap();
        let batch = vec![
            sample("proj", "One", "First narrative entry here."),
            sample("proj", "Two", "Second narrative entry here."),
        ];
        let ids = store.insert_batch(&batch).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(store.list_recent("proj", 10).unwrap().len(), 2);
    }

    #[test]
    fn search_fts_matches_narrative_terms() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(&dir.path().join("memory.db")).unwrap();
        store
            .insert_observation(&sample("proj", "Fix parser", "Resolved a tokenizer panic on empty input."))
            .unwrap();
        store
            .insert_observation(&sample("proj", "Add feature", "Implemented streaming output support."))
            .unwrap();

        let hits = store.search_fts("proj", "tokenizer", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Fix parser");
    }

    #[test]
    fn search_filters_by_type_and_text() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(&dir.path().join("memory.db")).unwrap();
        store
            .insert_observation(&sample("proj", "Fix parser", "Resolved a tokenizer panic on empty input."))
            .unwrap();
        let feature = ObservationBuilder::new(
            "sess-1", "proj", "opencode", "Edit", ObservationType::Feature, "Add streaming",
            "Implemented streaming output support.",
        )
        .build();
        store.insert_observation(&feature).unwrap();

        let filter = ObservationFilter {
            types: vec![ObservationType::Feature],
            limit: 10,
            ..Default::default()
        };
        let hits = store.search(&filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Add streaming");
    }

    #[test]
    fn search_with_fts_query_ranks_by_match() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(&dir.path().join("memory.db")).unwrap();
        store
            .insert_observation(&sample("proj", "Fix parser", "Resolved a tokenizer panic on empty input."))
            .unwrap();
        store
            .insert_observation(&sample("proj", "Add feature", "Implemented streaming output support."))
            .unwrap();

        let filter = ObservationFilter {
            query: Some("tokenizer".to_string()),
            limit: 10,
            ..Default::default()
        };
        let hits = store.search(&filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Fix parser");
    }

    #[test]
    fn search_excludes_archived_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(&dir.path().join("memory.db")).unwrap();
        let mut archived = sample("proj", "Old decision", "An old narrative entry here.");
        archived.oc_metadata.insert("archived_at".to_string(), serde_json::json!("2020-01-01T00:00:00Z"));
        store.insert_observation(&archived).unwrap();
        store.insert_observation(&sample("proj", "Fresh one", "A fresh narrative entry here.")).unwrap();

        let filter = ObservationFilter {
            exclude_archived: true,
            limit: 10,
            ..Default::default()
        };
        let hits = store.search(&filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Fresh one");
    }

    #[test]
    fn migrate_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        let store = ProjectStore::open(&path).unwrap();
        store.insert_observation(&sample("proj", "One", "First narrative entry here.")).unwrap();
        drop(store);

        let store_again = ProjectStore::open(&path).unwrap();
        let recent = store_again.list_recent("proj", 10).unwrap();
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn top_by_importance_orders_by_score_then_recency() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(&dir.path().join("memory.db")).unwrap();
        let mut low = sample("proj", "Low importance", "A low importance narrative entry.");
        low.oc_metadata.insert("importance_score".to_string(), serde_json::json!(10));
        let mut high = sample("proj", "High importance", "A high importance narrative entry.");
        high.oc_metadata.insert("importance_score".to_string(), serde_json::json!(95));
        store.insert_observation(&low).unwrap();
        store.insert_observation(&high).unwrap();

        let top = store.top_by_importance("proj", 10).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].title, "High importance");
        assert_eq!(top[1].title, "Low importance");
    }

    #[test]
    fn session_summaries_round_trip_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(&dir.path().join("memory.db")).unwrap();
        assert!(store.has_session_summaries_table().unwrap());
        assert!(store.latest_session_summaries(10).unwrap().is_empty());

        let summary = SessionSummary {
            session_id: "sess-1".to_string(),
            request: "Fix the bug".to_string(),
            investigated: "The parser".to_string(),
            learned: "It was an off-by-one".to_string(),
            completed: "Fixed and tested".to_string(),
            next_steps: "Add a regression test".to_string(),
            notes: String::new(),
            token_investment: Some(1200),
        };
        store.insert_session_summary(&summary).unwrap();

        let fetched = store.latest_session_summaries(10).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].session_id, "sess-1");
        assert_eq!(fetched[0].token_investment, Some(1200));
    }
}
