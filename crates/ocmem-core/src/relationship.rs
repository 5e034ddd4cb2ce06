// SPDX-License-Identifier: MIT OR Apache-2.0
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The kind of directed edge between two observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    /// Source references target.
    References,
    /// Source extends target.
    Extends,
    /// Source conflicts with target.
    ConflictsWith,
    /// Source depends on target.
    DependsOn,
    /// Source chronologically follows target.
    Follows,
    /// Source modifies something target also touches.
    Modifies,
}

impl RelationshipType {
    /// All variants, used for `CHECK (... IN (...))` schema generation and
    /// for exhaustiveness tests.
    pub const ALL: [RelationshipType; 6] = [
        Self::References,
        Self::Extends,
        Self::ConflictsWith,
        Self::DependsOn,
        Self::Follows,
        Self::Modifies,
    ];

    /// The lowercase, underscore-separated name used in SQL `CHECK` clauses
    /// and the wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::References => "references",
            Self::Extends => "extends",
            Self::ConflictsWith => "conflicts_with",
            Self::DependsOn => "depends_on",
            Self::Follows => "follows",
            Self::Modifies => "modifies",
        }
    }
}

/// A directed edge between two observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Relationship {
    /// Store-local row id.
    pub id: Option<i64>,
    /// Source observation id.
    pub source_id: i64,
    /// Target observation id.
    pub target_id: i64,
    /// Edge kind.
    #[serde(rename = "type")]
    pub ty: RelationshipType,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Extra edge metadata.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Relationship {
    /// Construct a new relationship, clamping `confidence` to `[0, 1]`.
    #[must_use]
    pub fn new(source_id: i64, target_id: i64, ty: RelationshipType, confidence: f64) -> Self {
        Self {
            id: None,
            source_id,
            target_id,
            ty,
            confidence: confidence.clamp(0.0, 1.0),
            metadata: BTreeMap::new(),
        }
    }
}
