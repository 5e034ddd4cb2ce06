// SPDX-License-Identifier: MIT OR Apache-2.0
//! The worker process: the one thing on the machine allowed to write the
//! global index, and the HTTP surface the embedding host's core library
//! talks to when it would rather not touch the filesystem directly.
//!
//! Owns an [`Outbox`] for `/api/import` intake (the same dual-path queue any
//! other producer would use — this process is just one more writer into the
//! shared outbox directory, never a direct writer of project or global
//! stores) and exposes read-only context/search endpoints backed by
//! [`ocmem_query`] and [`ocmem_manifest`]. The actual promotion of queued
//! observations into durable storage is [`ocmem_ingest::run_forever`],
//! spawned by the binary alongside this router.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use ocmem_config::MemoryConfig;
use ocmem_core::{ContentEnvelope, ImportRequest, ImportResponse, ObservationType};
use ocmem_error::{ErrorCategory, ErrorCode, OcError, OcErrorDto};
use ocmem_ingest::harden_project_path;
use ocmem_manifest::ManifestOptions;
use ocmem_outbox::Outbox;
use ocmem_query::{QueryOptions, QueryRouter, Scope};
use ocmem_store::{GlobalIndex, ObservationFilter, ProjectStore};
use ocmem_telemetry::MetricsCollector;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Fixed default bind address for the worker HTTP API.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:37777";

/// Shared server state, cloned into every handler via `Arc`.
pub struct AppState {
    config: MemoryConfig,
    outbox: Outbox,
    global_root: PathBuf,
    metrics: MetricsCollector,
    started_at: DateTime<Utc>,
}

impl AppState {
    /// Build state rooted at `config.global_root()`, creating the outbox
    /// directory if absent. The outbox here is producer-only: this process
    /// never calls [`Outbox::drain`] on it, since it never needs to reach
    /// itself over HTTP — the in-process Ingestor drains the shared
    /// directory directly.
    pub fn new(config: MemoryConfig) -> Result<Self, OcError> {
        let global_root = config.global_root();
        let outbox_dir = global_root.join("outbox");
        std::fs::create_dir_all(&outbox_dir).map_err(|e| {
            OcError::new(ErrorCode::Internal, "failed to create outbox directory").with_source(e)
        })?;
        let outbox = Outbox::new(outbox_dir, None, "http://localhost:37777");
        Ok(Self {
            config,
            outbox,
            global_root,
            metrics: MetricsCollector::new(),
            started_at: Utc::now(),
        })
    }

    /// The metrics collector the background Ingestor records ticks into.
    #[must_use]
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// The configuration this state was built from.
    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// When this state (and, practically, the process) started.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// `global_root`-equivalent root this state was built from.
    #[must_use]
    pub fn global_root(&self) -> &std::path::Path {
        &self.global_root
    }

    fn global_db_path(&self) -> PathBuf {
        self.global_root.join("index.db")
    }
}

/// Uniform `{status, code, message, details?}` error response. Wraps an
/// [`OcError`], mapping its [`ErrorCategory`] onto an HTTP status: validation
/// failures are client errors, unavailability and lock contention are
/// retryable server errors, and corruption/fatal errors are opaque 5xxs.
pub struct ApiError(OcError);

impl From<OcError> for ApiError {
    fn from(err: OcError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.category() {
            ErrorCategory::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCategory::ApiError => StatusCode::BAD_GATEWAY,
            ErrorCategory::Unavailable | ErrorCategory::LockContention => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorCategory::Corruption => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCategory::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let dto = OcErrorDto::from(&self.0);
        warn!(code = %self.0.code, message = %self.0.message, "request failed");
        (status, Json(dto)).into_response()
    }
}

/// Build the router. `state` is shared across every request.
#[must_use]
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(cmd_health))
        .route("/api/import", post(cmd_import))
        .route("/api/context/recent", get(cmd_context_recent))
        .route("/api/search", get(cmd_search))
        .route("/api/search/observations", get(cmd_search_observations))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Clone, serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    build: &'static str,
    initialized: bool,
    timestamp: String,
}

async fn cmd_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        build: env!("CARGO_PKG_VERSION"),
        initialized: state.global_db_path().exists(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Accepts sessions and observations. Observations are pushed into the
/// shared outbox for the Ingestor to promote; sessions have no first-class
/// store of their own in this system (no session table exists at either
/// the project or global layer) and are only counted, never persisted.
async fn cmd_import(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ImportRequest>,
) -> Json<ImportResponse> {
    let sessions_accepted = body.sessions.len() as u32;
    let observations_accepted = body.observations.len() as u32;

    if sessions_accepted > 0 {
        info!(count = sessions_accepted, "import: sessions acknowledged (not persisted)");
    }
    for obs in body.observations {
        state.outbox.push(obs);
    }

    Json(ImportResponse {
        sessions_accepted,
        observations_accepted,
    })
}

#[derive(Debug, Deserialize)]
struct ContextRecentParams {
    project: String,
    limit: Option<i64>,
}

async fn cmd_context_recent(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ContextRecentParams>,
) -> Result<Json<ContentEnvelope>, ApiError> {
    let project_root = harden_project_path(&params.project)?;
    let db_path = project_root.join(".oc").join("memory.db");
    if !db_path.exists() {
        return Ok(Json(ContentEnvelope { content: vec![] }));
    }

    let store = ProjectStore::open_read_only(&db_path)?;
    let project_str = project_root.display().to_string();
    let limit = clamp_limit(params.limit);

    // No search prompt to score against: run the manifest builder with an
    // empty prompt so semantic_overlap contributes nothing and ranking
    // falls back to importance + recency alone, then trim to `limit`.
    let mut options = ManifestOptions::default();
    options.full_detail_count = (limit as usize).min(options.full_detail_count);
    options.compact_count = (limit as usize).saturating_sub(options.full_detail_count);

    let text = ocmem_manifest::build_manifest(
        &store,
        &project_str,
        "",
        true,
        &[],
        Utc::now(),
        &options,
    )?;
    Ok(Json(ContentEnvelope::text(text)))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    query: String,
    limit: Option<i64>,
}

async fn cmd_search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<ContentEnvelope>, ApiError> {
    let global_path = state.global_db_path();
    if !global_path.exists() {
        return Ok(Json(ContentEnvelope { content: vec![] }));
    }

    let global = GlobalIndex::open_read_only(&global_path)?;
    let mut filter = ObservationFilter::new(clamp_limit(params.limit));
    if !params.query.trim().is_empty() {
        filter.query = Some(params.query.clone());
    }
    let rows = global.search(&filter)?;
    let text = rows
        .iter()
        .map(|(obs, display_name)| render_hit_line(&obs.ty, &obs.title, &obs.narrative, Some(display_name.as_str())))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(Json(ContentEnvelope::text(text)))
}

#[derive(Debug, Deserialize)]
struct SearchObservationsParams {
    #[serde(default)]
    query: String,
    project: Option<String>,
    limit: Option<i64>,
    types: Option<String>,
}

async fn cmd_search_observations(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchObservationsParams>,
) -> Result<Json<ContentEnvelope>, ApiError> {
    let types = params
        .types
        .as_deref()
        .map(parse_types)
        .unwrap_or_default();

    let Some(project) = params.project.as_deref() else {
        // No project scope: fall back to the same global search the plain
        // `/api/search` endpoint runs, filtered additionally by type.
        let global_path = state.global_db_path();
        if !global_path.exists() {
            return Ok(Json(ContentEnvelope { content: vec![] }));
        }
        let global = GlobalIndex::open_read_only(&global_path)?;
        let mut filter = ObservationFilter::new(clamp_limit(params.limit));
        if !params.query.trim().is_empty() {
            filter.query = Some(params.query.clone());
        }
        filter.types = types;
        let rows = global.search(&filter)?;
        let text = rows
            .iter()
            .map(|(obs, display_name)| {
                render_hit_line(&obs.ty, &obs.title, &obs.narrative, Some(display_name.as_str()))
            })
            .collect::<Vec<_>>()
            .join("\n");
        return Ok(Json(ContentEnvelope::text(text)));
    };

    let project_root = harden_project_path(project)?;
    let db_path = project_root.join(".oc").join("memory.db");
    if !db_path.exists() {
        return Ok(Json(ContentEnvelope { content: vec![] }));
    }

    let router = QueryRouter::open(&db_path, Some(&state.global_db_path()), None)?;
    let mut options = QueryOptions::new(Scope::Project);
    options.limit = clamp_limit(params.limit);
    options.types = types;
    let hits = router.query(&params.query, &options)?;
    let text = hits
        .iter()
        .map(|hit| {
            render_hit_line(
                &hit.observation.ty,
                &hit.observation.title,
                &hit.observation.narrative,
                hit.project_display_name.as_deref(),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    Ok(Json(ContentEnvelope::text(text)))
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(50).clamp(1, 150)
}

fn render_hit_line(ty: &ObservationType, title: &str, narrative: &str, project: Option<&str>) -> String {
    let type_str = serde_json::to_value(ty)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    match project {
        Some(p) => format!("- **[{type_str}] {title}** ({p}) — {narrative}"),
        None => format!("- **[{type_str}] {title}** — {narrative}"),
    }
}

/// Parse a comma-separated `types` query value, silently dropping entries
/// that don't match a known [`ObservationType`] variant name.
fn parse_types(raw: &str) -> Vec<ObservationType> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| serde_json::from_value(serde_json::Value::String(s.to_string())).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ocmem_core::{Observation, ObservationBuilder};
    use tower::ServiceExt;

    fn test_config(root: &std::path::Path) -> MemoryConfig {
        let mut cfg = MemoryConfig::default();
        cfg.global_path = Some(root.display().to_string());
        cfg
    }

    fn sample_obs(project: &str) -> Observation {
        ObservationBuilder::new(
            "sess-1",
            project,
            "opencode",
            "Edit",
            ObservationType::Bugfix,
            "Fixed a bug",
            "Found and fixed a real off-by-one defect in the parser.",
        )
        .build()
    }

    #[tokio::test]
    async fn health_reports_uninitialized_before_any_index_exists() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(AppState::new(test_config(dir.path())).unwrap());
        let app = build_app(state);

        let response = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["initialized"], false);
    }

    #[tokio::test]
    async fn import_pushes_observations_into_the_shared_outbox() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(AppState::new(test_config(dir.path())).unwrap());
        let app = build_app(state);

        let payload = ImportRequest {
            sessions: vec![],
            observations: vec![sample_obs("/tmp/proj")],
        };
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/import")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&payload).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: ImportResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.observations_accepted, 1);
        assert_eq!(parsed.sessions_accepted, 0);

        let outbox_dir = dir.path().join("outbox");
        let has_jsonl = std::fs::read_dir(&outbox_dir)
            .unwrap()
            .filter_map(Result::ok)
            .any(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"));
        assert!(has_jsonl);
    }

    #[tokio::test]
    async fn context_recent_returns_empty_block_for_unknown_project() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(AppState::new(test_config(dir.path())).unwrap());
        let app = build_app(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/context/recent?project={}", dir.path().display()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: ContentEnvelope = serde_json::from_slice(&body).unwrap();
        assert!(parsed.content.is_empty());
    }

    #[tokio::test]
    async fn search_returns_empty_block_when_no_global_index_exists() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(AppState::new(test_config(dir.path())).unwrap());
        let app = build_app(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/search?query=fix")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: ContentEnvelope = serde_json::from_slice(&body).unwrap();
        assert!(parsed.content.is_empty());
    }

    #[test]
    fn clamp_limit_enforces_1_to_150() {
        assert_eq!(clamp_limit(None), 50);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(1000)), 150);
        assert_eq!(clamp_limit(Some(75)), 75);
    }

    #[test]
    fn parse_types_drops_unknown_names() {
        let types = parse_types("bugfix, nonsense ,feature");
        assert_eq!(types, vec![ObservationType::Bugfix, ObservationType::Feature]);
    }
}
