// SPDX-License-Identifier: MIT OR Apache-2.0
//! Orchestration phase state machine.
//!
//! A task moves through a fixed set of [`Phase`]s. Each transition is
//! validated against the legal-next-phase table, bumps a monotonic
//! `version`, merges in new `artifacts`, and persists to
//! `.oc/orchestration-<task_id>.json` under an optimistic-lock check: a
//! write is rejected if the file on disk already carries a version at or
//! past the one being written. [`handle_error`] records the phase a task
//! failed in and, on request, rolls the project back to a clean tree.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use ocmem_error::{ErrorCode, OcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

/// One state in the orchestration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// No task in flight.
    Idle,
    /// Building the context manifest for the task.
    ContextAssembly,
    /// Producing a plan from the assembled context.
    Planning,
    /// Executing the plan.
    Execution,
    /// Checking guardrails before verification.
    GuardrailValidation,
    /// Verifying the executed work.
    Verification,
    /// Human or policy review.
    Review,
    /// Task finished successfully.
    Completion,
    /// A transition or execution step failed.
    Error,
}

impl Phase {
    /// Phases `self` may legally transition to.
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [Phase] {
        match self {
            Self::Idle => &[Self::ContextAssembly, Self::Error],
            Self::ContextAssembly => &[Self::Planning, Self::Error],
            Self::Planning => &[Self::Execution, Self::Error],
            Self::Execution => &[Self::GuardrailValidation, Self::Verification, Self::Completion, Self::Error],
            Self::GuardrailValidation => &[Self::Verification, Self::Review, Self::Error],
            Self::Verification => &[Self::Review, Self::Completion, Self::Error],
            Self::Review => &[Self::Completion, Self::Error],
            Self::Completion => &[Self::Idle, Self::Error],
            Self::Error => &[Self::Idle, Self::ContextAssembly],
        }
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Phase) -> bool {
        self.allowed_transitions().contains(&next)
    }
}

/// Persisted orchestration state for one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestrationState {
    /// Stable task identifier, also the file-naming key.
    pub task_id: String,
    /// Current phase.
    pub phase: Phase,
    /// Monotonic version, bumped on every successful transition.
    pub version: u64,
    /// Accumulated artifacts, merged (not replaced) on each transition.
    pub artifacts: BTreeMap<String, Value>,
    /// The phase the task was in when it last entered [`Phase::Error`].
    pub failed_phase: Option<Phase>,
    /// The error message recorded by the last [`handle_error`] call.
    pub last_error: Option<String>,
}

impl OrchestrationState {
    /// A fresh, idle state for `task_id`.
    #[must_use]
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            phase: Phase::Idle,
            version: 0,
            artifacts: BTreeMap::new(),
            failed_phase: None,
            last_error: None,
        }
    }
}

fn state_path(oc_dir: &Path, task_id: &str) -> PathBuf {
    oc_dir.join(format!("orchestration-{task_id}.json"))
}

/// Load the persisted state for `task_id`, if any.
///
/// # Errors
///
/// Returns [`ErrorCode::Internal`] on I/O failure, or [`ErrorCode::SchemaInvalid`]
/// if the file exists but isn't a valid [`OrchestrationState`].
pub fn load_state(oc_dir: &Path, task_id: &str) -> Result<Option<OrchestrationState>, OcError> {
    let path = state_path(oc_dir, task_id);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| OcError::new(ErrorCode::Internal, "failed to read orchestration state file").with_source(e))?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| OcError::new(ErrorCode::SchemaInvalid, "orchestration state file is not valid JSON").with_source(e))
}

/// Persist `state`, rejecting the write under an optimistic-lock conflict:
/// if a file already exists for this `task_id` with `version >= state.version`,
/// the write is refused rather than silently clobbering a newer state.
///
/// # Errors
///
/// Returns [`ErrorCode::LockTimeout`] on a version conflict, or
/// [`ErrorCode::Internal`] on I/O failure.
pub fn persist(oc_dir: &Path, state: &OrchestrationState) -> Result<(), OcError> {
    std::fs::create_dir_all(oc_dir)
        .map_err(|e| OcError::new(ErrorCode::Internal, "failed to create .oc directory").with_source(e))?;

    if let Some(existing) = load_state(oc_dir, &state.task_id)? {
        if existing.version >= state.version {
            return Err(OcError::new(
                ErrorCode::LockTimeout,
                "optimistic lock conflict: on-disk orchestration state is not older",
            )
            .with_context("task_id", &state.task_id)
            .with_context("existing_version", existing.version)
            .with_context("attempted_version", state.version));
        }
    }

    let json = serde_json::to_string_pretty(state)
        .map_err(|e| OcError::new(ErrorCode::Internal, "failed to serialize orchestration state").with_source(e))?;
    std::fs::write(state_path(oc_dir, &state.task_id), json)
        .map_err(|e| OcError::new(ErrorCode::Internal, "failed to write orchestration state file").with_source(e))
}

/// Validate and apply a phase transition in memory: check legality, bump
/// `version`, and merge `artifacts` (new keys overwrite old ones sharing a
/// name; everything else is kept).
///
/// # Errors
///
/// Returns [`ErrorCode::SchemaInvalid`] if `next` is not a legal transition
/// from the current phase.
pub fn transition(
    state: &mut OrchestrationState,
    next: Phase,
    artifacts: BTreeMap<String, Value>,
) -> Result<(), OcError> {
    if !state.phase.can_transition_to(next) {
        return Err(OcError::new(ErrorCode::SchemaInvalid, "illegal orchestration phase transition")
            .with_context("from", format!("{:?}", state.phase))
            .with_context("to", format!("{:?}", next)));
    }
    state.phase = next;
    state.version += 1;
    state.artifacts.extend(artifacts);
    Ok(())
}

/// Apply a transition and persist the result in one step.
///
/// # Errors
///
/// Propagates [`transition`]'s legality error or [`persist`]'s I/O/lock error.
pub fn transition_and_persist(
    oc_dir: &Path,
    state: &mut OrchestrationState,
    next: Phase,
    artifacts: BTreeMap<String, Value>,
) -> Result<(), OcError> {
    transition(state, next, artifacts)?;
    persist(oc_dir, state)
}

/// Record a task failure: move to [`Phase::Error`], remember which phase it
/// failed in and why, persist, and — if `rollback` is requested and the
/// project tree has tracked or untracked changes — reset it to `HEAD` and
/// remove untracked files. Rollback runs confined to `project_root` via
/// `current_dir`; it never touches anything outside that directory.
///
/// # Errors
///
/// Returns [`persist`]'s error, or an [`ErrorCode::Internal`] error if a git
/// command could not be spawned or exited non-zero.
pub fn handle_error(
    oc_dir: &Path,
    project_root: &Path,
    state: &mut OrchestrationState,
    error: impl Into<String>,
    rollback: bool,
) -> Result<(), OcError> {
    state.failed_phase = Some(state.phase);
    state.last_error = Some(error.into());
    state.phase = Phase::Error;
    state.version += 1;
    persist(oc_dir, state)?;

    if rollback {
        if has_changes(project_root)? {
            warn!(task_id = %state.task_id, "rolling back project tree after task failure");
            rollback_project(project_root)?;
        } else {
            info!(task_id = %state.task_id, "no tracked or untracked changes, skipping rollback");
        }
    }
    Ok(())
}

fn run_git(project_root: &Path, args: &[&str]) -> Result<String, OcError> {
    let out = Command::new("git")
        .args(args)
        .current_dir(project_root)
        .output()
        .map_err(|e| OcError::new(ErrorCode::Internal, "failed to spawn git").with_source(e))?;
    if !out.status.success() {
        return Err(OcError::new(ErrorCode::Internal, "git command exited non-zero")
            .with_context("args", args.join(" "))
            .with_context("stderr", String::from_utf8_lossy(&out.stderr).into_owned()));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Whether `project_root` has any tracked or untracked changes, per
/// `git status --porcelain`.
///
/// # Errors
///
/// Returns [`ErrorCode::Internal`] if git could not be run.
pub fn has_changes(project_root: &Path) -> Result<bool, OcError> {
    let status = run_git(project_root, &["status", "--porcelain"])?;
    Ok(!status.trim().is_empty())
}

fn rollback_project(project_root: &Path) -> Result<(), OcError> {
    run_git(project_root, &["reset", "--hard", "HEAD"])?;
    run_git(project_root, &["clean", "-fd"])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_can_only_reach_context_assembly_or_error() {
        assert!(Phase::Idle.can_transition_to(Phase::ContextAssembly));
        assert!(Phase::Idle.can_transition_to(Phase::Error));
        assert!(!Phase::Idle.can_transition_to(Phase::Completion));
    }

    #[test]
    fn execution_can_reach_any_of_its_three_successors() {
        assert!(Phase::Execution.can_transition_to(Phase::GuardrailValidation));
        assert!(Phase::Execution.can_transition_to(Phase::Verification));
        assert!(Phase::Execution.can_transition_to(Phase::Completion));
        assert!(!Phase::Execution.can_transition_to(Phase::Review));
    }

    #[test]
    fn error_can_only_reach_idle_or_context_assembly() {
        assert!(Phase::Error.can_transition_to(Phase::Idle));
        assert!(Phase::Error.can_transition_to(Phase::ContextAssembly));
        assert!(!Phase::Error.can_transition_to(Phase::Planning));
    }

    #[test]
    fn completion_loops_back_to_idle() {
        assert!(Phase::Completion.can_transition_to(Phase::Idle));
        assert!(!Phase::Completion.can_transition_to(Phase::Planning));
    }

    #[test]
    fn transition_rejects_illegal_jump() {
        let mut state = OrchestrationState::new("t1");
        let err = transition(&mut state, Phase::Execution, BTreeMap::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::SchemaInvalid);
        assert_eq!(state.phase, Phase::Idle);
        assert_eq!(state.version, 0);
    }

    #[test]
    fn transition_bumps_version_and_merges_artifacts() {
        let mut state = OrchestrationState::new("t1");
        let mut artifacts = BTreeMap::new();
        artifacts.insert("plan".to_string(), serde_json::json!("draft"));
        transition(&mut state, Phase::ContextAssembly, BTreeMap::new()).unwrap();
        transition(&mut state, Phase::Planning, artifacts).unwrap();
        assert_eq!(state.phase, Phase::Planning);
        assert_eq!(state.version, 2);
        assert_eq!(state.artifacts.get("plan"), Some(&serde_json::json!("draft")));
    }

    #[test]
    fn persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let oc_dir = dir.path().join(".oc");
        let mut state = OrchestrationState::new("t1");
        transition(&mut state, Phase::ContextAssembly, BTreeMap::new()).unwrap();
        persist(&oc_dir, &state).unwrap();

        let loaded = load_state(&oc_dir, "t1").unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn load_state_returns_none_when_no_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let oc_dir = dir.path().join(".oc");
        assert!(load_state(&oc_dir, "nonexistent").unwrap().is_none());
    }

    #[test]
    fn persist_rejects_stale_version() {
        let dir = tempfile::tempdir().unwrap();
        let oc_dir = dir.path().join(".oc");
        let mut newer = OrchestrationState::new("t1");
        transition(&mut newer, Phase::ContextAssembly, BTreeMap::new()).unwrap();
        transition(&mut newer, Phase::Planning, BTreeMap::new()).unwrap();
        persist(&oc_dir, &newer).unwrap();

        let stale = OrchestrationState::new("t1");
        let err = persist(&oc_dir, &stale).unwrap_err();
        assert_eq!(err.code, ErrorCode::LockTimeout);

        let still_on_disk = load_state(&oc_dir, "t1").unwrap().unwrap();
        assert_eq!(still_on_disk.version, 2);
    }

    #[test]
    fn transition_and_persist_writes_through_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let oc_dir = dir.path().join(".oc");
        let mut state = OrchestrationState::new("t1");
        transition_and_persist(&oc_dir, &mut state, Phase::ContextAssembly, BTreeMap::new()).unwrap();
        let loaded = load_state(&oc_dir, "t1").unwrap().unwrap();
        assert_eq!(loaded.phase, Phase::ContextAssembly);
    }

    #[test]
    fn handle_error_records_failed_phase_and_moves_to_error() {
        let dir = tempfile::tempdir().unwrap();
        let oc_dir = dir.path().join(".oc");
        let project_root = dir.path().join("project");
        std::fs::create_dir_all(&project_root).unwrap();
        let mut state = OrchestrationState::new("t1");
        transition(&mut state, Phase::ContextAssembly, BTreeMap::new()).unwrap();

        // project_root is not a git repo, so has_changes fails before any
        // rollback is attempted; exercise the no-rollback path instead.
        handle_error(&oc_dir, &project_root, &mut state, "boom", false).unwrap();
        assert_eq!(state.phase, Phase::Error);
        assert_eq!(state.failed_phase, Some(Phase::ContextAssembly));
        assert_eq!(state.last_error.as_deref(), Some("boom"));
    }
}
