// SPDX-License-Identifier: MIT OR Apache-2.0
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created on first observation, still receiving events.
    Active,
    /// Closed by an idle timeout or explicit stop event.
    Completed,
}

/// The unit of agent interaction; groups observations by time and source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Session {
    /// Host-assigned session identifier.
    pub session_id: String,
    /// Project this session operates within.
    pub project: String,
    /// Producing agent host.
    pub source: String,
    /// Session start timestamp.
    pub started_at: DateTime<Utc>,
    /// Session end timestamp, set on close.
    pub completed_at: Option<DateTime<Utc>>,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Highest `prompt_number` observed so far, monotonically increasing
    /// within this session only — never assume uniqueness across sessions.
    pub prompt_number: u32,
}

impl Session {
    /// Start a new active session.
    #[must_use]
    pub fn start(session_id: impl Into<String>, project: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            project: project.into(),
            source: source.into(),
            started_at: Utc::now(),
            completed_at: None,
            status: SessionStatus::Active,
            prompt_number: 0,
        }
    }

    /// Record that another prompt was observed.
    pub fn advance_prompt(&mut self) -> u32 {
        self.prompt_number += 1;
        self.prompt_number
    }

    /// Close the session.
    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
        self.status = SessionStatus::Completed;
    }
}

/// Six-field end-of-session summary, stored both as an
/// [`crate::ObservationType::Summary`] observation and as a first-class row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SessionSummary {
    /// Session this summary describes.
    pub session_id: String,
    /// What was asked.
    pub request: String,
    /// What was investigated.
    pub investigated: String,
    /// What was learned.
    pub learned: String,
    /// What was completed.
    pub completed: String,
    /// Suggested next steps.
    pub next_steps: String,
    /// Free-form notes.
    pub notes: String,
    /// Optional token-investment accounting. Vestigial in the source system;
    /// never required, never synthesized if absent.
    pub token_investment: Option<u64>,
}
