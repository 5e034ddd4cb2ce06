// SPDX-License-Identifier: MIT OR Apache-2.0
//! ocmem-core
//!
//! Stable data model for the observation memory substrate. Every other
//! `ocmem-*` crate depends on this one for its row and wire types; nothing
//! here performs I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod hash;
mod observation;
mod outbox;
mod project;
mod relationship;
mod session;
mod wire;

pub use hash::{canonical_json, project_uuid, sha256_hex, CoreError};
pub use observation::{ImportanceTier, Observation, ObservationBuilder, ObservationType};
pub use outbox::{OutboxRecord, OutboxStatus};
pub use project::ProjectRegistryEntry;
pub use relationship::{Relationship, RelationshipType};
pub use session::{Session, SessionStatus, SessionSummary};
pub use wire::{ContentBlock, ContentEnvelope, ErrorEnvelope, ImportRequest, ImportResponse};

/// Version tag for the on-disk/over-the-wire contract these types represent.
///
/// Bump this whenever a breaking change lands in the SQLite schemas or the
/// worker HTTP API; readers may use it to refuse to open an incompatible
/// store.
pub const CONTRACT_VERSION: &str = "ocmem/v1";

/// `type`s that are always recorded regardless of narrative length.
pub const ALWAYS_RECORD_TYPES: [ObservationType; 3] = [
    ObservationType::Decision,
    ObservationType::Bugfix,
    ObservationType::Feature,
];

/// Tool names whose observations are always recorded regardless of narrative
/// length.
pub const ALWAYS_RECORD_TOOLS: [&str; 3] = ["user_prompt", "command", "session_summary"];

/// Minimum narrative length (in chars) for an observation to be recorded,
/// unless it qualifies for always-record treatment.
pub const MIN_NARRATIVE_LEN: usize = 10;

/// Decide whether an observation with the given type, tool, and narrative
/// length should be recorded, per the boundary behavior table.
#[must_use]
pub fn should_record_observation(ty: ObservationType, tool: &str, narrative_len: usize) -> bool {
    if narrative_len >= MIN_NARRATIVE_LEN {
        return true;
    }
    ALWAYS_RECORD_TYPES.contains(&ty) || ALWAYS_RECORD_TOOLS.contains(&tool)
}
