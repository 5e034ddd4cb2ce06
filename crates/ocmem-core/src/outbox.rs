// SPDX-License-Identifier: MIT OR Apache-2.0
use crate::Observation;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a pending outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Still eligible for drain.
    Pending,
    /// Exhausted its retry budget or hit a permanent 4xx; excluded from
    /// future drains.
    Dead,
}

/// A pending observation awaiting delivery to the worker, with retry
/// bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutboxRecord {
    /// Row id in the `pending_observations` mirror table.
    pub id: i64,
    /// The full observation payload.
    pub observation: Observation,
    /// Number of delivery attempts so far.
    pub attempts: u32,
    /// Earliest time the next attempt may run.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Last error message, truncated to 500 chars.
    pub last_error: Option<String>,
    /// Current status.
    pub status: OutboxStatus,
}

impl OutboxRecord {
    /// Truncate an error message to the 500-char storage limit.
    #[must_use]
    pub fn truncate_error(msg: &str) -> String {
        if msg.len() <= 500 {
            msg.to_string()
        } else {
            msg.chars().take(500).collect()
        }
    }
}
