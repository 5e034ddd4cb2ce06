// SPDX-License-Identifier: MIT OR Apache-2.0
//! Read-only query layer: scoped full-text search, hybrid semantic/
//! importance ranking with optional relationship expansion, and graph
//! traversal over `observation_relationships`.
//!
//! Every connection here is opened read-only — this crate never writes to a
//! store. Write access is the Ingestor's alone.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use ocmem_core::{Observation, ObservationType};
use ocmem_error::OcError;
use ocmem_store::{Direction, GlobalIndex, ObservationFilter, ProjectStore};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use tracing::warn;

/// Which store(s) a query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The current project's store, filtered to the current branch.
    Branch,
    /// The current project's store, all branches, excluding archived rows.
    Project,
    /// The cross-project materialized index.
    Global,
}

/// Router-level query options, shared across all three scopes.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Which store(s) to query.
    pub scope: Scope,
    /// Restrict to these observation types; empty means any type.
    pub types: Vec<ObservationType>,
    /// Maximum rows returned. Default 50, hard cap 150.
    pub limit: i64,
    /// Only observations created at or after this time.
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    /// Importance filter. Interpreted as a tier name (`"critical"`, `"high"`,
    /// `"medium"`, `"low"`) for [`Scope::Branch`]/[`Scope::Project`], and as a
    /// minimum 0-100 score for [`Scope::Global`].
    pub importance: Option<String>,
}

impl QueryOptions {
    /// Spec defaults: scope as given, no type/importance/since filter,
    /// `limit=50`.
    #[must_use]
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            types: Vec::new(),
            limit: 50,
            since: None,
            importance: None,
        }
    }

    fn clamped_limit(&self) -> i64 {
        self.limit.clamp(1, 150)
    }
}

/// One search result, carrying the global display name when the scope was
/// [`Scope::Global`].
#[derive(Debug, Clone)]
pub struct QueryHit {
    /// The matched observation.
    pub observation: Observation,
    /// The owning project's display name, set only for global-scope hits.
    pub project_display_name: Option<String>,
}

/// Dispatches `(query_string, options)` to the right store and scope filter.
///
/// Read-only: opens its connections with `busy_timeout=5000` via
/// [`ProjectStore::open_read_only`]/[`GlobalIndex::open_read_only`] and holds
/// them for this router's lifetime.
pub struct QueryRouter {
    project_store: ProjectStore,
    global_index: Option<GlobalIndex>,
    current_branch: Option<String>,
}

impl QueryRouter {
    /// Open the project store at `project_db_path`, and the global index at
    /// `global_db_path` if it exists. A missing global index is not an
    /// error: [`Scope::Global`] queries transparently degrade to
    /// [`Scope::Project`].
    pub fn open(
        project_db_path: &Path,
        global_db_path: Option<&Path>,
        current_branch: Option<String>,
    ) -> Result<Self, OcError> {
        let project_store = ProjectStore::open_read_only(project_db_path)?;
        let global_index = match global_db_path {
            Some(path) if path.exists() => Some(GlobalIndex::open_read_only(path)?),
            _ => None,
        };
        Ok(Self {
            project_store,
            global_index,
            current_branch,
        })
    }

    /// Run a query against the scope named in `options`.
    pub fn query(&self, query_string: &str, options: &QueryOptions) -> Result<Vec<QueryHit>, OcError> {
        match options.scope {
            Scope::Branch => self.query_branch(query_string, options),
            Scope::Project => self.query_project(query_string, options),
            Scope::Global => match &self.global_index {
                Some(global) => Self::query_global(global, query_string, options),
                None => self.query_project(query_string, options),
            },
        }
    }

    fn query_branch(&self, query_string: &str, options: &QueryOptions) -> Result<Vec<QueryHit>, OcError> {
        let mut filter = base_project_filter(query_string, options);
        filter.branch = self.current_branch.clone();
        let observations = self.project_store.search(&filter)?;
        Ok(observations
            .into_iter()
            .map(|observation| QueryHit { observation, project_display_name: None })
            .collect())
    }

    fn query_project(&self, query_string: &str, options: &QueryOptions) -> Result<Vec<QueryHit>, OcError> {
        let mut filter = base_project_filter(query_string, options);
        filter.exclude_archived = true;
        let observations = self.project_store.search(&filter)?;
        Ok(observations
            .into_iter()
            .map(|observation| QueryHit { observation, project_display_name: None })
            .collect())
    }

    fn query_global(global: &GlobalIndex, query_string: &str, options: &QueryOptions) -> Result<Vec<QueryHit>, OcError> {
        let mut filter = ObservationFilter::new(options.clamped_limit());
        if !query_string.trim().is_empty() {
            filter.query = Some(query_string.to_string());
        }
        filter.types = options.types.clone();
        filter.since = options.since;
        if let Some(importance) = &options.importance {
            filter.min_importance_score = importance.parse::<u8>().ok();
        }
        let rows = global.search(&filter)?;
        Ok(rows
            .into_iter()
            .map(|(observation, display_name)| QueryHit {
                observation,
                project_display_name: Some(display_name),
            })
            .collect())
    }

    /// Release the router's read-only connections. A no-op beyond dropping
    /// `self`; kept for symmetry with `open`.
    pub fn close(self) {
        drop(self);
    }
}

fn base_project_filter(query_string: &str, options: &QueryOptions) -> ObservationFilter {
    let mut filter = ObservationFilter::new(options.clamped_limit());
    if !query_string.trim().is_empty() {
        filter.query = Some(query_string.to_string());
    }
    filter.types = options.types.clone();
    filter.since = options.since;
    if let Some(tier) = &options.importance {
        filter.importance_tiers = vec![tier.clone()];
    }
    filter
}

// ---------------------------------------------------------------------
// Hybrid search & relationship expansion (spec 4.9)
// ---------------------------------------------------------------------

/// A semantic search candidate fed into [`hybrid_search`], produced
/// upstream by whatever embedding/similarity index backs semantic recall.
#[derive(Debug, Clone)]
pub struct SemanticCandidate {
    /// The candidate observation's id.
    pub observation_id: i64,
    /// Title, carried through unscored.
    pub title: String,
    /// Narrative, carried through unscored.
    pub narrative: String,
    /// Semantic similarity in `[0, 1]`.
    pub similarity: f64,
    /// Metadata bag; `importance_score` is read from here, default 50.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Direction to expand relationships in, relative to a result's id.
pub use ocmem_store::Direction as ExpansionDirection;

/// Opt-in relationship-expansion parameters.
#[derive(Debug, Clone)]
pub struct ExpansionOptions {
    /// Neighbors fetched per expanded result. Default 3.
    pub neighbors_per_result: usize,
    /// Minimum edge confidence to follow. Default 0.5.
    pub min_confidence: f64,
    /// Which edges to follow. Default `Both`.
    pub direction: ExpansionDirection,
    /// Hard cap on the final result count after expansion. Default 100.
    pub max_expansion_results: usize,
}

impl Default for ExpansionOptions {
    fn default() -> Self {
        Self {
            neighbors_per_result: 3,
            min_confidence: 0.5,
            direction: ExpansionDirection::Both,
            max_expansion_results: 100,
        }
    }
}

/// Hybrid-search parameters.
#[derive(Debug, Clone)]
pub struct HybridOptions {
    /// Minimum `similarity` to keep a candidate. Default 0.3.
    pub min_relevance: f64,
    /// Minimum normalized importance (`importance_score / 100`). Default 0.4.
    pub min_importance: f64,
    /// Results to return after ranking.
    pub limit: usize,
    /// When `false`, skip scoring/filtering/expansion and pass results
    /// through unranked, truncated to `limit`, with `score = similarity`.
    pub use_hybrid_scoring: bool,
    /// `Some` to run relationship expansion after the initial rank.
    pub expansion: Option<ExpansionOptions>,
}

impl Default for HybridOptions {
    fn default() -> Self {
        Self {
            min_relevance: 0.3,
            min_importance: 0.4,
            limit: 10,
            use_hybrid_scoring: true,
            expansion: None,
        }
    }
}

/// A ranked hybrid-search result.
#[derive(Debug, Clone)]
pub struct ScoredResult {
    /// Observation id.
    pub observation_id: i64,
    /// Title.
    pub title: String,
    /// Narrative.
    pub narrative: String,
    /// Combined score used for ranking.
    pub score: f64,
}

fn normalized_importance(metadata: &BTreeMap<String, serde_json::Value>) -> f64 {
    let score = metadata
        .get("importance_score")
        .and_then(serde_json::Value::as_u64)
        .map(|n| n.min(100))
        .unwrap_or(50);
    f64::from(score) / 100.0
}

/// Rank semantic candidates by `0.7*similarity + 0.3*importance`, filter by
/// the relevance/importance floors, optionally expand via relationships,
/// and return the top `options.limit`.
///
/// When `options.use_hybrid_scoring` is `false`, candidates pass through
/// unfiltered and unranked with `score = similarity`, truncated to `limit`
/// (backward-compat mode).
pub fn hybrid_search(
    global: &GlobalIndex,
    candidates: Vec<SemanticCandidate>,
    options: &HybridOptions,
) -> Vec<ScoredResult> {
    if !options.use_hybrid_scoring {
        return candidates
            .into_iter()
            .take(options.limit)
            .map(|c| ScoredResult {
                observation_id: c.observation_id,
                title: c.title,
                narrative: c.narrative,
                score: c.similarity,
            })
            .collect();
    }

    let mut scored: Vec<ScoredResult> = candidates
        .iter()
        .filter(|c| c.similarity >= options.min_relevance)
        .filter(|c| normalized_importance(&c.metadata) >= options.min_importance)
        .map(|c| ScoredResult {
            observation_id: c.observation_id,
            title: c.title.clone(),
            narrative: c.narrative.clone(),
            score: 0.7 * c.similarity + 0.3 * normalized_importance(&c.metadata),
        })
        .collect();
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    if let Some(expansion) = &options.expansion {
        scored = expand_with_relationships(global, scored, expansion, options.limit);
    }

    scored.truncate(options.limit);
    scored
}

fn expand_with_relationships(
    global: &GlobalIndex,
    mut scored: Vec<ScoredResult>,
    expansion: &ExpansionOptions,
    limit: i64,
) -> Vec<ScoredResult> {
    let pre_expansion = scored.clone();
    let seed_count = (limit / 2).max(0) as usize;
    let mut seen: HashSet<i64> = scored.iter().map(|r| r.observation_id).collect();

    for seed in scored.iter().take(seed_count).map(|r| r.observation_id).collect::<Vec<_>>() {
        let related = match global.get_related_filtered(
            seed,
            None,
            expansion.min_confidence,
            expansion.neighbors_per_result as i64,
            expansion.direction,
        ) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, seed, "hybrid search: relationship expansion failed, returning pre-expansion result");
                return pre_expansion;
            }
        };
        for rel in related {
            let neighbor_id = if rel.source_id == seed { rel.target_id } else { rel.source_id };
            if !seen.insert(neighbor_id) {
                continue;
            }
            let Ok(Some(obs)) = global.get_observation(neighbor_id) else {
                continue;
            };
            let score = 0.3 * rel.confidence * obs.importance_score() as f64 / 100.0;
            scored.push(ScoredResult {
                observation_id: neighbor_id,
                title: obs.title,
                narrative: obs.narrative,
                score,
            });
        }
    }

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(expansion.max_expansion_results);
    scored
}

// ---------------------------------------------------------------------
// Graph queries (spec 4.10)
// ---------------------------------------------------------------------

use ocmem_core::Relationship;

/// One node reached during a [`get_relationship_graph`] traversal.
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// The observation id.
    pub observation_id: i64,
    /// Hop distance from the traversal's source.
    pub depth: u32,
    /// The node ids on the path from source to this node.
    pub path: Vec<i64>,
}

/// A breadth-first expansion of the relationship graph rooted at `source`.
#[derive(Debug, Clone, Default)]
pub struct RelationshipGraph {
    /// All nodes reached, including the source at depth 0.
    pub nodes: Vec<GraphNode>,
    /// All edges traversed to reach those nodes.
    pub edges: Vec<Relationship>,
}

/// BFS from `source`, expanding edges with `confidence >= min_confidence`
/// until `depth == max_depth`. Follows edges in both directions.
pub fn get_relationship_graph(
    global: &GlobalIndex,
    source: i64,
    max_depth: u32,
    min_confidence: f64,
) -> Result<RelationshipGraph, OcError> {
    let mut graph = RelationshipGraph {
        nodes: vec![GraphNode { observation_id: source, depth: 0, path: vec![source] }],
        edges: Vec::new(),
    };
    let mut visited: HashSet<i64> = HashSet::from([source]);
    let mut queue: VecDeque<(i64, u32, Vec<i64>)> = VecDeque::from([(source, 0, vec![source])]);

    while let Some((node, depth, path)) = queue.pop_front() {
        if depth == max_depth {
            continue;
        }
        let related = global.get_related_filtered(node, None, min_confidence, 1000, Direction::Both)?;
        for rel in related {
            let neighbor = if rel.source_id == node { rel.target_id } else { rel.source_id };
            graph.edges.push(rel);
            if visited.insert(neighbor) {
                let mut neighbor_path = path.clone();
                neighbor_path.push(neighbor);
                graph.nodes.push(GraphNode { observation_id: neighbor, depth: depth + 1, path: neighbor_path.clone() });
                queue.push_back((neighbor, depth + 1, neighbor_path));
            }
        }
    }

    Ok(graph)
}

/// Result of [`find_path`].
#[derive(Debug, Clone)]
pub struct PathResult {
    /// Whether a path was found within `max_depth`.
    pub found: bool,
    /// Hop count, or `-1` if not found.
    pub distance: i32,
    /// Node ids from source to target, inclusive. Empty if not found.
    pub path: Vec<i64>,
    /// Edges traversed along the path. Empty if not found.
    pub edges: Vec<Relationship>,
}

impl PathResult {
    fn not_found() -> Self {
        Self { found: false, distance: -1, path: Vec::new(), edges: Vec::new() }
    }
}

/// BFS with parent-tracking from `source` to `target`, reconstructing the
/// path on hit. `source == target` is the trivial zero-distance case.
pub fn find_path(
    global: &GlobalIndex,
    source: i64,
    target: i64,
    max_depth: u32,
    min_confidence: f64,
) -> Result<PathResult, OcError> {
    if source == target {
        return Ok(PathResult { found: true, distance: 0, path: vec![source], edges: Vec::new() });
    }

    let mut visited: HashSet<i64> = HashSet::from([source]);
    let mut parent: HashMap<i64, (i64, Relationship)> = HashMap::new();
    let mut queue: VecDeque<(i64, u32)> = VecDeque::from([(source, 0)]);

    while let Some((node, depth)) = queue.pop_front() {
        if depth == max_depth {
            continue;
        }
        let related = global.get_related_filtered(node, None, min_confidence, 1000, Direction::Both)?;
        for rel in related {
            let neighbor = if rel.source_id == node { rel.target_id } else { rel.source_id };
            if !visited.insert(neighbor) {
                continue;
            }
            parent.insert(neighbor, (node, rel));
            if neighbor == target {
                return Ok(reconstruct_path(&parent, source, target, depth + 1));
            }
            queue.push_back((neighbor, depth + 1));
        }
    }

    Ok(PathResult::not_found())
}

fn reconstruct_path(parent: &HashMap<i64, (i64, Relationship)>, source: i64, target: i64, distance: u32) -> PathResult {
    let mut path = vec![target];
    let mut edges = Vec::new();
    let mut current = target;
    while current != source {
        let Some((prev, rel)) = parent.get(&current) else {
            return PathResult::not_found();
        };
        edges.push(rel.clone());
        path.push(*prev);
        current = *prev;
    }
    path.reverse();
    edges.reverse();
    PathResult { found: true, distance: distance as i32, path, edges }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocmem_core::{ObservationBuilder, ObservationType, ProjectRegistryEntry, RelationshipType};
    use ocmem_store::GlobalIndex;

    fn sample_obs(title: &str) -> Observation {
        ObservationBuilder::new("s", "p", "opencode", "Edit", ObservationType::Change, title, "Some narrative text here.")
            .build()
    }

    fn setup_global() -> (tempfile::TempDir, GlobalIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = GlobalIndex::open(&dir.path().join("index.db")).unwrap();
        index.upsert_project(&ProjectRegistryEntry::new("uuid-a", "/tmp/project")).unwrap();
        (dir, index)
    }

    #[test]
    fn router_degrades_global_to_project_when_index_missing() {
        let dir = tempfile::tempdir().unwrap();
        let project_db = dir.path().join("memory.db");
        {
            let store = ProjectStore::open(&project_db).unwrap();
            store.insert_observation(&sample_obs("Only observation")).unwrap();
        }

        let router = QueryRouter::open(&project_db, Some(&dir.path().join("index.db")), None).unwrap();
        let options = QueryOptions::new(Scope::Global);
        let hits = router.query("", &options).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].project_display_name.is_none());
    }

    #[test]
    fn router_branch_scope_filters_by_current_branch() {
        let dir = tempfile::tempdir().unwrap();
        let project_db = dir.path().join("memory.db");
        {
            let store = ProjectStore::open(&project_db).unwrap();
            let mut on_main = sample_obs("On main");
            on_main.oc_metadata.insert("branch".to_string(), serde_json::json!("main"));
            let mut on_feature = sample_obs("On feature");
            on_feature.oc_metadata.insert("branch".to_string(), serde_json::json!("feature-x"));
            store.insert_observation(&on_main).unwrap();
            store.insert_observation(&on_feature).unwrap();
        }

        let router = QueryRouter::open(&project_db, None, Some("main".to_string())).unwrap();
        let hits = router.query("", &QueryOptions::new(Scope::Branch)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].observation.title, "On main");
    }

    #[test]
    fn hybrid_search_ranks_by_combined_score_and_filters_floors() {
        let (_dir, index) = setup_global();
        let mut low_relevance = BTreeMap::new();
        low_relevance.insert("importance_score".to_string(), serde_json::json!(90));
        let candidates = vec![
            SemanticCandidate {
                observation_id: 1,
                title: "Low similarity".to_string(),
                narrative: "n".to_string(),
                similarity: 0.1,
                metadata: low_relevance,
            },
            SemanticCandidate {
                observation_id: 2,
                title: "Balanced".to_string(),
                narrative: "n".to_string(),
                similarity: 0.8,
                metadata: BTreeMap::from([("importance_score".to_string(), serde_json::json!(60))]),
            },
        ];
        let results = hybrid_search(&index, candidates, &HybridOptions::default());
        assert_eq!(results.len(), 1, "the 0.1-similarity candidate should be filtered by min_relevance");
        assert_eq!(results[0].observation_id, 2);
    }

    #[test]
    fn hybrid_search_passthrough_mode_skips_filtering() {
        let (_dir, index) = setup_global();
        let candidates = vec![SemanticCandidate {
            observation_id: 1,
            title: "Anything".to_string(),
            narrative: "n".to_string(),
            similarity: 0.05,
            metadata: BTreeMap::new(),
        }];
        let options = HybridOptions { use_hybrid_scoring: false, ..Default::default() };
        let results = hybrid_search(&index, candidates, &options);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].score, 0.05);
    }

    #[test]
    fn find_path_trivial_case_is_zero_distance() {
        let (_dir, index) = setup_global();
        let result = find_path(&index, 42, 42, 5, 0.4).unwrap();
        assert!(result.found);
        assert_eq!(result.distance, 0);
        assert_eq!(result.path, vec![42]);
    }

    #[test]
    fn find_path_follows_chain_and_reconstructs() {
        let (_dir, index) = setup_global();
        let a = index.upsert_observation("uuid-a", "e:1", &sample_obs("A")).unwrap();
        let b = index.upsert_observation("uuid-a", "e:2", &sample_obs("B")).unwrap();
        let c = index.upsert_observation("uuid-a", "e:3", &sample_obs("C")).unwrap();
        index.insert_relationship(&Relationship::new(a, b, RelationshipType::Follows, 0.9)).unwrap();
        index.insert_relationship(&Relationship::new(b, c, RelationshipType::Follows, 0.9)).unwrap();

        let result = find_path(&index, a, c, 5, 0.4).unwrap();
        assert!(result.found);
        assert_eq!(result.distance, 2);
        assert_eq!(result.path, vec![a, b, c]);
        assert_eq!(result.edges.len(), 2);
    }

    #[test]
    fn find_path_returns_not_found_beyond_max_depth() {
        let (_dir, index) = setup_global();
        let a = index.upsert_observation("uuid-a", "e:1", &sample_obs("A")).unwrap();
        let b = index.upsert_observation("uuid-a", "e:2", &sample_obs("B")).unwrap();
        let c = index.upsert_observation("uuid-a", "e:3", &sample_obs("C")).unwrap();
        index.insert_relationship(&Relationship::new(a, b, RelationshipType::Follows, 0.9)).unwrap();
        index.insert_relationship(&Relationship::new(b, c, RelationshipType::Follows, 0.9)).unwrap();

        let result = find_path(&index, a, c, 1, 0.4).unwrap();
        assert!(!result.found);
        assert_eq!(result.distance, -1);
    }

    #[test]
    fn get_relationship_graph_bfs_respects_max_depth() {
        let (_dir, index) = setup_global();
        let a = index.upsert_observation("uuid-a", "e:1", &sample_obs("A")).unwrap();
        let b = index.upsert_observation("uuid-a", "e:2", &sample_obs("B")).unwrap();
        let c = index.upsert_observation("uuid-a", "e:3", &sample_obs("C")).unwrap();
        index.insert_relationship(&Relationship::new(a, b, RelationshipType::Follows, 0.9)).unwrap();
        index.insert_relationship(&Relationship::new(b, c, RelationshipType::Follows, 0.9)).unwrap();

        let graph = get_relationship_graph(&index, a, 1, 0.4).unwrap();
        let ids: HashSet<i64> = graph.nodes.iter().map(|n| n.observation_id).collect();
        assert!(ids.contains(&a));
        assert!(ids.contains(&b));
        assert!(!ids.contains(&c), "c is 2 hops away, beyond max_depth 1");
    }
}
