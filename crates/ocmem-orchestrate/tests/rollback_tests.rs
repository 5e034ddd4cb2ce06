// SPDX-License-Identifier: MIT OR Apache-2.0
//! Integration tests for confined git rollback on task failure.
//!
//! Every test creates its own temp directory with a real git repo; no
//! process outside that directory is ever touched.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

use ocmem_orchestrate::{handle_error, has_changes, transition, OrchestrationState, Phase};

fn git_ok(path: &Path, args: &[&str]) {
    let st = Command::new("git")
        .args(args)
        .current_dir(path)
        .status()
        .expect("git should be on PATH");
    assert!(st.success(), "git {args:?} failed");
}

fn init_repo_with_baseline(path: &Path) {
    git_ok(path, &["init", "-q"]);
    fs::write(path.join("committed.txt"), "original").unwrap();
    git_ok(path, &["add", "-A"]);
    git_ok(
        path,
        &["-c", "user.name=ocmem", "-c", "user.email=ocmem@local", "commit", "-qm", "baseline"],
    );
}

fn tmp() -> TempDir {
    TempDir::new().expect("create temp dir")
}

#[test]
fn has_changes_is_false_on_clean_repo() {
    let dir = tmp();
    init_repo_with_baseline(dir.path());
    assert!(!has_changes(dir.path()).unwrap());
}

#[test]
fn has_changes_detects_untracked_file() {
    let dir = tmp();
    init_repo_with_baseline(dir.path());
    fs::write(dir.path().join("scratch.txt"), "new").unwrap();
    assert!(has_changes(dir.path()).unwrap());
}

#[test]
fn handle_error_rolls_back_modified_and_untracked_files() {
    let dir = tmp();
    let oc_dir = dir.path().join(".oc");
    init_repo_with_baseline(dir.path());

    fs::write(dir.path().join("committed.txt"), "corrupted by a failed task").unwrap();
    fs::write(dir.path().join("untracked.txt"), "left behind").unwrap();
    assert!(has_changes(dir.path()).unwrap());

    let mut state = OrchestrationState::new("rollback-task");
    transition(&mut state, Phase::ContextAssembly, BTreeMap::new()).unwrap();
    transition(&mut state, Phase::Planning, BTreeMap::new()).unwrap();
    transition(&mut state, Phase::Execution, BTreeMap::new()).unwrap();

    handle_error(&oc_dir, dir.path(), &mut state, "tool execution panicked", true).unwrap();

    assert_eq!(state.phase, Phase::Error);
    assert_eq!(state.failed_phase, Some(Phase::Execution));
    assert_eq!(
        fs::read_to_string(dir.path().join("committed.txt")).unwrap(),
        "original"
    );
    assert!(!dir.path().join("untracked.txt").exists());
    assert!(!has_changes(dir.path()).unwrap());
}

#[test]
fn handle_error_skips_rollback_on_clean_tree() {
    let dir = tmp();
    let oc_dir = dir.path().join(".oc");
    init_repo_with_baseline(dir.path());

    let mut state = OrchestrationState::new("clean-task");
    transition(&mut state, Phase::ContextAssembly, BTreeMap::new()).unwrap();

    handle_error(&oc_dir, dir.path(), &mut state, "context assembly failed", true).unwrap();
    assert_eq!(
        fs::read_to_string(dir.path().join("committed.txt")).unwrap(),
        "original"
    );
}

#[test]
fn handle_error_without_rollback_leaves_changes_intact() {
    let dir = tmp();
    let oc_dir = dir.path().join(".oc");
    init_repo_with_baseline(dir.path());
    fs::write(dir.path().join("committed.txt"), "left dirty on purpose").unwrap();

    let mut state = OrchestrationState::new("no-rollback-task");
    transition(&mut state, Phase::ContextAssembly, BTreeMap::new()).unwrap();

    handle_error(&oc_dir, dir.path(), &mut state, "caller opted out of rollback", false).unwrap();
    assert_eq!(
        fs::read_to_string(dir.path().join("committed.txt")).unwrap(),
        "left dirty on purpose"
    );
}
