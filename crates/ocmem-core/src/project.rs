// SPDX-License-Identifier: MIT OR Apache-2.0
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A registered project in the global index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProjectRegistryEntry {
    /// Non-reversible HMAC-SHA256 of the canonical path, see
    /// [`crate::project_uuid`].
    pub project_uuid: String,
    /// Canonicalized absolute path (symlinks resolved, normalized).
    pub absolute_path: String,
    /// Human-friendly display name, usually the last path component.
    pub display_name: String,
    /// Last time the ingestor promoted an observation for this project.
    pub last_sync_at: DateTime<Utc>,
    /// Cumulative observation count, maintained by `ON CONFLICT DO UPDATE`.
    pub observation_count: u64,
}

impl ProjectRegistryEntry {
    /// Build a fresh registry entry for a newly seen project.
    #[must_use]
    pub fn new(project_uuid: impl Into<String>, absolute_path: impl Into<String>) -> Self {
        let absolute_path = absolute_path.into();
        let display_name = absolute_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&absolute_path)
            .to_string();
        Self {
            project_uuid: project_uuid.into(),
            absolute_path,
            display_name,
            last_sync_at: Utc::now(),
            observation_count: 0,
        }
    }
}
