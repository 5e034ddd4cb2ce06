// SPDX-License-Identifier: MIT OR Apache-2.0
//! Filter grammar shared by [`crate::ProjectStore::search`] and
//! [`crate::GlobalIndex::search`]: the router builds one of these per
//! request and the store translates it into parameterized SQL.

use chrono::{DateTime, Utc};
use ocmem_core::ObservationType;

/// A scoped, filtered full-text query against one store.
#[derive(Debug, Clone, Default)]
pub struct ObservationFilter {
    /// Restrict to this project's `project` column. `None` means "don't
    /// filter" — appropriate for a per-project store, where every row
    /// already shares one project.
    pub project: Option<String>,
    /// FTS5 `MATCH` expression. `None` means "no text filter" (match all).
    pub query: Option<String>,
    /// Restrict to these types; empty means "any type".
    pub types: Vec<ObservationType>,
    /// Only observations whose `oc_metadata.branch` equals this value.
    pub branch: Option<String>,
    /// Only observations whose `oc_metadata.importance` tier is one of these
    /// (project/branch scope, where importance is stored as a tier string).
    pub importance_tiers: Vec<String>,
    /// Only observations with `importance_score >= this` (global scope,
    /// where importance is a numeric column).
    pub min_importance_score: Option<u8>,
    /// Only observations created at or after this timestamp.
    pub since: Option<DateTime<Utc>>,
    /// Exclude observations with a non-null `oc_metadata.archived_at`
    /// (project scope).
    pub exclude_archived: bool,
    /// Maximum rows to return. Default 50, max 150.
    pub limit: i64,
}

impl ObservationFilter {
    /// A filter with no restrictions beyond the default limit (50).
    #[must_use]
    pub fn new(limit: i64) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }
}
