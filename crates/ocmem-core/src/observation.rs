// SPDX-License-Identifier: MIT OR Apache-2.0
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Coarse classification of an [`Observation`]'s subject matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ObservationType {
    /// A decision made during the session.
    Decision,
    /// A bug fix.
    Bugfix,
    /// A new feature.
    Feature,
    /// A refactor with no behavior change.
    Refactor,
    /// A discovery about the codebase or environment.
    Discovery,
    /// A generic change not covered by the other variants.
    Change,
    /// A rendered session summary.
    Summary,
}

/// Coarse importance bucket derived from a 0-100 [`score`](crate::observation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ImportanceTier {
    /// `score >= 90`.
    Critical,
    /// `score >= 70`.
    High,
    /// `score >= 40`.
    Medium,
    /// `score < 40`.
    Low,
}

impl ImportanceTier {
    /// Classify a 0-100 score into its tier, per the scorer's fixed thresholds.
    #[must_use]
    pub fn from_score(score: u8) -> Self {
        match score {
            90..=255 => Self::Critical,
            70..=89 => Self::High,
            40..=69 => Self::Medium,
            _ => Self::Low,
        }
    }
}

/// The central atom of the memory substrate: one structured observation of
/// an agent tool execution, or a synthetic session event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Observation {
    /// Store-local stable id, assigned on ingest. `None` before ingestion.
    pub id: Option<i64>,
    /// `{project_uuid}:{local_id}`, unique across the global index.
    pub external_id: Option<String>,
    /// The session this observation belongs to.
    pub session_id: String,
    /// Project display/path identifier as seen by the producing host.
    pub project: String,
    /// Producing agent host, e.g. `opencode`.
    pub source: String,
    /// Tool invoked, e.g. `Edit`, `Bash`, `user_prompt`.
    pub tool: String,
    /// Observation subject classification.
    #[serde(rename = "type")]
    pub ty: ObservationType,
    /// Short headline, at most 80 chars.
    pub title: String,
    /// Optional secondary headline.
    pub subtitle: Option<String>,
    /// Required prose description, at least 10 chars once filtered.
    pub narrative: String,
    /// Raw captured text, pre-extraction.
    pub text: String,
    /// Extracted facts.
    pub facts: Vec<String>,
    /// Extracted concepts/keywords.
    pub concepts: Vec<String>,
    /// Files read during this tool execution.
    pub files_read: Vec<String>,
    /// Files modified during this tool execution.
    pub files_modified: Vec<String>,
    /// Position within the owning session, monotonic but not globally unique
    /// (see [`crate::CONTRACT_VERSION`] notes — always pair with `session_id`).
    pub prompt_number: u32,
    /// ISO-8601 creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Creation timestamp as epoch milliseconds, redundant with `created_at`
    /// for cheap ordering comparisons.
    pub created_at_epoch: i64,
    /// Extensible metadata bag. Known keys (`importance_score`,
    /// `importance_tier`, `branch`, `scope`, `deontic_type`,
    /// `execution_time_ms`, `success`, `error_message`) have typed accessors;
    /// unknown keys survive read-modify-write untouched.
    pub oc_metadata: BTreeMap<String, serde_json::Value>,
}

impl Observation {
    /// Read `oc_metadata.importance_score`, defaulting to `50` if absent or
    /// not representable as a `u8`.
    #[must_use]
    pub fn importance_score(&self) -> u8 {
        self.oc_metadata
            .get("importance_score")
            .and_then(serde_json::Value::as_u64)
            .map(|n| n.min(100) as u8)
            .unwrap_or(50)
    }

    /// Read `oc_metadata.branch`, if present.
    #[must_use]
    pub fn branch(&self) -> Option<&str> {
        self.oc_metadata.get("branch").and_then(serde_json::Value::as_str)
    }

    /// Read `oc_metadata.deontic_type`, if present.
    #[must_use]
    pub fn deontic_type(&self) -> Option<&str> {
        self.oc_metadata
            .get("deontic_type")
            .and_then(serde_json::Value::as_str)
    }

    /// Whether this observation qualifies to be recorded given the
    /// narrative-length boundary rule.
    #[must_use]
    pub fn should_record(&self) -> bool {
        crate::should_record_observation(self.ty, &self.tool, self.narrative.trim().len())
    }
}

/// Ergonomic builder for [`Observation`].
///
/// Mirrors the fluent, `#[must_use]`-annotated builder style used for wire
/// contract types throughout this workspace.
#[derive(Debug, Clone)]
pub struct ObservationBuilder {
    session_id: String,
    project: String,
    source: String,
    tool: String,
    ty: ObservationType,
    title: String,
    narrative: String,
    subtitle: Option<String>,
    text: String,
    facts: Vec<String>,
    concepts: Vec<String>,
    files_read: Vec<String>,
    files_modified: Vec<String>,
    prompt_number: u32,
    created_at: DateTime<Utc>,
    oc_metadata: BTreeMap<String, serde_json::Value>,
}

impl ObservationBuilder {
    /// Start a new builder with the required fields.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        project: impl Into<String>,
        source: impl Into<String>,
        tool: impl Into<String>,
        ty: ObservationType,
        title: impl Into<String>,
        narrative: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            project: project.into(),
            source: source.into(),
            tool: tool.into(),
            ty,
            title: title.into(),
            narrative: narrative.into(),
            subtitle: None,
            text: String::new(),
            facts: Vec::new(),
            concepts: Vec::new(),
            files_read: Vec::new(),
            files_modified: Vec::new(),
            prompt_number: 0,
            created_at: Utc::now(),
            oc_metadata: BTreeMap::new(),
        }
    }

    /// Set the subtitle.
    #[must_use]
    pub fn subtitle(mut self, subtitle: impl Into<String>) -> Self {
        self.subtitle = Some(subtitle.into());
        self
    }

    /// Set the raw captured text.
    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Set the facts list.
    #[must_use]
    pub fn facts(mut self, facts: Vec<String>) -> Self {
        self.facts = facts;
        self
    }

    /// Set the concepts list.
    #[must_use]
    pub fn concepts(mut self, concepts: Vec<String>) -> Self {
        self.concepts = concepts;
        self
    }

    /// Set the files-read list.
    #[must_use]
    pub fn files_read(mut self, files: Vec<String>) -> Self {
        self.files_read = files;
        self
    }

    /// Set the files-modified list.
    #[must_use]
    pub fn files_modified(mut self, files: Vec<String>) -> Self {
        self.files_modified = files;
        self
    }

    /// Set the prompt number within the owning session.
    #[must_use]
    pub fn prompt_number(mut self, n: u32) -> Self {
        self.prompt_number = n;
        self
    }

    /// Override the creation timestamp (defaults to `Utc::now()`).
    #[must_use]
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Insert one `oc_metadata` key.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.oc_metadata.insert(key.into(), value);
        self
    }

    /// Finish the builder, producing an unpersisted [`Observation`] (`id` and
    /// `external_id` are `None` until the ingestor assigns them).
    #[must_use]
    pub fn build(self) -> Observation {
        Observation {
            id: None,
            external_id: None,
            session_id: self.session_id,
            project: self.project,
            source: self.source,
            tool: self.tool,
            ty: self.ty,
            title: self.title,
            subtitle: self.subtitle,
            narrative: self.narrative,
            text: self.text,
            facts: self.facts,
            concepts: self.concepts,
            files_read: self.files_read,
            files_modified: self.files_modified,
            prompt_number: self.prompt_number,
            created_at: self.created_at,
            created_at_epoch: self.created_at.timestamp_millis(),
            oc_metadata: self.oc_metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_roundtrips_required_fields() {
        let obs = ObservationBuilder::new(
            "sess-1",
            "proj",
            "opencode",
            "Edit",
            ObservationType::Bugfix,
            "Fix off-by-one",
            "Narrative text describing the fix in detail.",
        )
        .build();
        assert_eq!(obs.session_id, "sess-1");
        assert_eq!(obs.ty, ObservationType::Bugfix);
        assert!(obs.id.is_none());
        assert_eq!(obs.created_at_epoch, obs.created_at.timestamp_millis());
    }

    #[test]
    fn importance_score_defaults_to_fifty() {
        let obs = ObservationBuilder::new("s", "p", "src", "tool", ObservationType::Change, "t", "narrative!!")
            .build();
        assert_eq!(obs.importance_score(), 50);
    }

    #[test]
    fn importance_score_reads_metadata() {
        let obs = ObservationBuilder::new("s", "p", "src", "tool", ObservationType::Change, "t", "narrative!!")
            .metadata("importance_score", serde_json::json!(92))
            .build();
        assert_eq!(obs.importance_score(), 92);
    }

    #[test]
    fn tier_thresholds_are_strict() {
        assert_eq!(ImportanceTier::from_score(90), ImportanceTier::Critical);
        assert_eq!(ImportanceTier::from_score(89), ImportanceTier::High);
        assert_eq!(ImportanceTier::from_score(70), ImportanceTier::High);
        assert_eq!(ImportanceTier::from_score(69), ImportanceTier::Medium);
        assert_eq!(ImportanceTier::from_score(40), ImportanceTier::Medium);
        assert_eq!(ImportanceTier::from_score(39), ImportanceTier::Low);
    }

    #[test]
    fn should_record_delegates_to_free_function() {
        let obs = ObservationBuilder::new("s", "p", "src", "bash", ObservationType::Change, "t", "short")
            .build();
        assert!(!obs.should_record());
        let decision = ObservationBuilder::new("s", "p", "src", "bash", ObservationType::Decision, "t", "x")
            .build();
        assert!(decision.should_record());
    }
}
