// SPDX-License-Identifier: MIT OR Apache-2.0
//! The cross-project `index.db`: the project registry, the promoted
//! observation mirror, and the relationship graph between them.

use crate::project::{type_from_str, type_str};
use crate::query::ObservationFilter;
use crate::schema::{self, open_read_only, open_with_pragmas, GLOBAL_SCHEMA_V1};
use chrono::{DateTime, Utc};
use ocmem_core::{
    Observation, ObservationBuilder, ObservationType, ProjectRegistryEntry, Relationship,
    RelationshipType,
};
use ocmem_error::{ErrorCode, OcError};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

const GLOBAL_SCHEMA_VERSION: i64 = 1;

/// Which side of a relationship edge to traverse relative to a given node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Follow edges where the node is the source.
    Outgoing,
    /// Follow edges where the node is the target.
    Incoming,
    /// Follow edges in either direction.
    Both,
}

/// The global, cross-project SQLite index.
pub struct GlobalIndex {
    conn: Arc<Mutex<Connection>>,
}

impl GlobalIndex {
    /// Open (creating if absent) the global index at `path`.
    pub fn open(path: &Path) -> Result<Self, OcError> {
        let mut conn = open_with_pragmas(path)?;
        schema::migrate(&mut conn, GLOBAL_SCHEMA_VERSION, GLOBAL_SCHEMA_V1)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open the same database read-only.
    pub fn open_read_only(path: &Path) -> Result<Self, OcError> {
        let conn = open_read_only(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or refresh a project registry row, keyed by `project_uuid`.
    pub fn upsert_project(&self, entry: &ProjectRegistryEntry) -> Result<(), OcError> {
        let conn = self.conn.lock().expect("global index mutex poisoned");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO projects (
                project_uuid, absolute_path, display_name, last_sync_at,
                observation_count, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(project_uuid) DO UPDATE SET
                absolute_path = excluded.absolute_path,
                display_name = excluded.display_name,
                last_sync_at = excluded.last_sync_at,
                observation_count = excluded.observation_count,
                updated_at = excluded.updated_at",
            params![
                entry.project_uuid,
                entry.absolute_path,
                entry.display_name,
                entry.last_sync_at.to_rfc3339(),
                entry.observation_count,
                now,
            ],
        )
        .map_err(|e| schema::internal("upsert project", e))?;
        Ok(())
    }

    /// Fetch a registered project by its uuid.
    pub fn get_project(&self, project_uuid: &str) -> Result<Option<ProjectRegistryEntry>, OcError> {
        let conn = self.conn.lock().expect("global index mutex poisoned");
        conn.query_row(
            "SELECT project_uuid, absolute_path, display_name, last_sync_at, observation_count
             FROM projects WHERE project_uuid = ?1",
            params![project_uuid],
            |row| {
                let last_sync_at: String = row.get(3)?;
                Ok(ProjectRegistryEntry {
                    project_uuid: row.get(0)?,
                    absolute_path: row.get(1)?,
                    display_name: row.get(2)?,
                    last_sync_at: DateTime::parse_from_rfc3339(&last_sync_at)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    observation_count: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(|e| schema::internal("get project", e))
    }

    /// Insert or replace a promoted observation, keyed by `external_id`.
    ///
    /// Re-promoting the same `external_id` (e.g. after a retry) overwrites
    /// the prior row rather than duplicating it.
    pub fn upsert_observation(
        &self,
        project_uuid: &str,
        external_id: &str,
        obs: &Observation,
    ) -> Result<i64, OcError> {
        let oc_metadata = serde_json::to_string(&obs.oc_metadata)
            .map_err(|e| schema::metadata_corrupt("global observations.oc_metadata", e))?;
        let conn = self.conn.lock().expect("global index mutex poisoned");
        conn.execute(
            "INSERT INTO observations (
                external_id, project_uuid, type, title, narrative, importance, branch,
                created_at, oc_metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(external_id) DO UPDATE SET
                type = excluded.type,
                title = excluded.title,
                narrative = excluded.narrative,
                importance = excluded.importance,
                branch = excluded.branch,
                created_at = excluded.created_at,
                oc_metadata = excluded.oc_metadata",
            params![
                external_id,
                project_uuid,
                type_str(obs.ty),
                obs.title,
                obs.narrative,
                obs.importance_score(),
                obs.branch(),
                obs.created_at.to_rfc3339(),
                oc_metadata,
            ],
        )
        .map_err(|e| schema::internal("upsert global observation", e))?;
        conn.query_row(
            "SELECT id FROM observations WHERE external_id = ?1",
            params![external_id],
            |row| row.get(0),
        )
        .map_err(|e| schema::internal("fetch upserted global observation id", e))
    }

    /// Insert a relationship edge. Violates the idempotence guarantee if the
    /// `(source_id, target_id, relationship_type)` triple already exists;
    /// callers should treat the resulting unique-constraint error as "already
    /// recorded" rather than a failure.
    pub fn insert_relationship(&self, rel: &Relationship) -> Result<i64, OcError> {
        let metadata = serde_json::to_string(&rel.metadata)
            .map_err(|e| schema::metadata_corrupt("observation_relationships.metadata", e))?;
        let conn = self.conn.lock().expect("global index mutex poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO observation_relationships (
                source_id, target_id, relationship_type, confidence, metadata, created_at_epoch
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rel.source_id,
                rel.target_id,
                rel.ty.as_str(),
                rel.confidence,
                metadata,
                Utc::now().timestamp_millis(),
            ],
        )
        .map_err(|e| schema::internal("insert relationship", e))?;
        conn.query_row(
            "SELECT id FROM observation_relationships
             WHERE source_id = ?1 AND target_id = ?2 AND relationship_type = ?3",
            params![rel.source_id, rel.target_id, rel.ty.as_str()],
            |row| row.get(0),
        )
        .map_err(|e| schema::internal("fetch relationship id", e))
    }

    /// All relationships with `observation_id` as source, ordered by
    /// descending confidence.
    pub fn get_related(&self, observation_id: i64) -> Result<Vec<Relationship>, OcError> {
        let conn = self.conn.lock().expect("global index mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, source_id, target_id, relationship_type, confidence, metadata
                 FROM observation_relationships WHERE source_id = ?1
                 ORDER BY confidence DESC",
            )
            .map_err(|e| schema::internal("prepare get_related", e))?;
        let rows = stmt
            .query_map(params![observation_id], row_to_relationship)
            .map_err(|e| schema::internal("query get_related", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| schema::internal("read relationship rows", e))
    }

    /// One-hop neighbors of `observation_id`, filtered by relationship type,
    /// minimum confidence, and direction, ordered by descending confidence
    /// and capped at `limit`.
    pub fn get_related_filtered(
        &self,
        observation_id: i64,
        ty: Option<RelationshipType>,
        min_confidence: f64,
        limit: i64,
        direction: Direction,
    ) -> Result<Vec<Relationship>, OcError> {
        let conn = self.conn.lock().expect("global index mutex poisoned");
        let direction_clause = match direction {
            Direction::Outgoing => "source_id = ?1",
            Direction::Incoming => "target_id = ?1",
            Direction::Both => "(source_id = ?1 OR target_id = ?1)",
        };
        let sql = format!(
            "SELECT id, source_id, target_id, relationship_type, confidence, metadata
             FROM observation_relationships
             WHERE {direction_clause} AND confidence >= ?2 AND (?3 IS NULL OR relationship_type = ?3)
             ORDER BY confidence DESC LIMIT ?4"
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| schema::internal("prepare get_related_filtered", e))?;
        let rows = stmt
            .query_map(
                params![observation_id, min_confidence, ty.map(RelationshipType::as_str), limit],
                row_to_relationship,
            )
            .map_err(|e| schema::internal("query get_related_filtered", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| schema::internal("read filtered relationship rows", e))
    }

    /// Fetch a registered project by its absolute path, used to detect a
    /// salt/algorithm migration (same path, different `project_uuid`).
    pub fn get_project_by_path(&self, absolute_path: &str) -> Result<Option<ProjectRegistryEntry>, OcError> {
        let conn = self.conn.lock().expect("global index mutex poisoned");
        conn.query_row(
            "SELECT project_uuid, absolute_path, display_name, last_sync_at, observation_count
             FROM projects WHERE absolute_path = ?1",
            params![absolute_path],
            |row| {
                let last_sync_at: String = row.get(3)?;
                Ok(ProjectRegistryEntry {
                    project_uuid: row.get(0)?,
                    absolute_path: row.get(1)?,
                    display_name: row.get(2)?,
                    last_sync_at: DateTime::parse_from_rfc3339(&last_sync_at)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    observation_count: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(|e| schema::internal("get project by path", e))
    }

    /// Remove a project and all of its promoted observations, used when a
    /// salt/algorithm migration invalidates a previously-registered
    /// `project_uuid` for a still-valid path.
    pub fn delete_project(&self, project_uuid: &str) -> Result<(), OcError> {
        let conn = self.conn.lock().expect("global index mutex poisoned");
        conn.execute(
            "DELETE FROM observations WHERE project_uuid = ?1",
            params![project_uuid],
        )
        .map_err(|e| schema::internal("delete project observations", e))?;
        conn.execute("DELETE FROM projects WHERE project_uuid = ?1", params![project_uuid])
            .map_err(|e| schema::internal("delete project", e))?;
        Ok(())
    }

    /// Fetch a single promoted observation by its local row id.
    pub fn get_observation(&self, id: i64) -> Result<Option<Observation>, OcError> {
        let conn = self.conn.lock().expect("global index mutex poisoned");
        conn.query_row(
            "SELECT id, external_id, project_uuid, type, title, narrative, created_at, oc_metadata
             FROM observations WHERE id = ?1",
            params![id],
            row_to_global_observation,
        )
        .optional()
        .map_err(|e| schema::internal("get global observation", e))
    }

    /// Filtered query against the materialized global index, used by the
    /// `global` scope of the query router. Joins `projects` to recover each
    /// observation's display name. Importance here is the numeric
    /// `importance` column (0-100), not the project-scope tier string.
    pub fn search(&self, filter: &ObservationFilter) -> Result<Vec<(Observation, String)>, OcError> {
        let mut conditions = vec!["1 = 1".to_string()];
        let mut args: Vec<SqlValue> = Vec::new();

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
        if let Some(min_score) = filter.min_importance_score {
            conditions.push("o.importance >= ?".to_string());
            args.push(SqlValue::from(i64::from(min_score)));
        }
        if let Some(since) = filter.since {
            conditions.push("o.created_at >= ?".to_string());
            args.push(SqlValue::from(since.to_rfc3339()));
        }

        let from_clause = if uses_fts {
            "FROM observations_fts JOIN observations o ON o.id = observations_fts.rowid"
        } else {
            "FROM observations o"
        };
        let order_clause = if uses_fts { "ORDER BY rank" } else { "ORDER BY o.created_at DESC" };

        let sql = format!(
            "SELECT o.id, o.external_id, o.project_uuid, o.type, o.title, o.narrative,
                    o.created_at, o.oc_metadata, p.display_name
             {from_clause}
             JOIN projects p ON p.project_uuid = o.project_uuid
             WHERE {where_clause}
             {order_clause}
             LIMIT ?",
            where_clause = conditions.join(" AND "),
        );
        args.push(SqlValue::from(filter.limit));

        let conn = self.conn.lock().expect("global index mutex poisoned");
        let mut stmt = conn.prepare(&sql).map_err(|e| schema::internal("prepare global search", e))?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                let obs = row_to_global_observation(row)?;
                let display_name: String = row.get(8)?;
                Ok((obs, display_name))
            })
            .map_err(|e| schema::internal("query global search", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| schema::internal("read global search rows", e))
    }
}

fn relationship_type_from_str(s: &str) -> Result<RelationshipType, OcError> {
    RelationshipType::ALL
        .into_iter()
        .find(|t| t.as_str() == s)
        .ok_or_else(|| {
            OcError::new(
                ErrorCode::MetadataCorrupt,
                format!("unknown relationship_type in store: {s}"),
            )
        })
}

fn row_to_relationship(row: &Row) -> rusqlite::Result<Relationship> {
    let ty: String = row.get(3)?;
    Ok(Relationship {
        id: Some(row.get(0)?),
        source_id: row.get(1)?,
        target_id: row.get(2)?,
        ty: relationship_type_from_str(&ty).unwrap_or(RelationshipType::References),
        confidence: row.get(4)?,
        metadata: {
            let raw: String = row.get(5)?;
            serde_json::from_str(&raw).unwrap_or_default()
        },
    })
}

fn row_to_global_observation(row: &Row) -> rusqlite::Result<Observation> {
    let id: i64 = row.get(0)?;
    let external_id: Option<String> = row.get(1)?;
    let project_uuid: String = row.get(2)?;
    let ty: String = row.get(3)?;
    let title: String = row.get(4)?;
    let narrative: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let oc_metadata: String = row.get(7)?;

    let mut obs = ObservationBuilder::new(
        "", project_uuid, "global-index", "unused", type_from_str(&ty), title, narrative,
    )
    .created_at(
        DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    )
    .build();
    obs.id = Some(id);
    obs.external_id = external_id;
    obs.oc_metadata = serde_json::from_str(&oc_metadata).unwrap_or_default();
    Ok(obs)
}
