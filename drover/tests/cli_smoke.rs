//! Binary smoke tests for the `drover` CLI.
//!
//! These run the compiled binary with `assert_cmd` and verify subcommand
//! plumbing and exit codes without driving a full orchestration run.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn drover() -> Command {
    Command::cargo_bin("drover").unwrap()
}

fn git(cwd: &Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .unwrap();
    assert!(status.success());
}

fn git_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    git(dir.path(), &["init", "-q", "-b", "main"]);
    git(dir.path(), &["config", "user.email", "t@e.c"]);
    git(dir.path(), &["config", "user.name", "t"]);
    fs::write(dir.path().join("README.md"), "x\n").unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "-q", "-m", "init"]);
    dir
}

// ── Binary builds and responds ───────────────────────────────────────────────

#[test]
fn version_flag() {
    drover()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("drover"));
}

#[test]
fn help_lists_subcommands() {
    drover()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("parallel"))
        .stdout(predicate::str::contains("resume"))
        .stdout(predicate::str::contains("cleanup"));
}

#[test]
fn unknown_subcommand_is_a_usage_error() {
    drover().arg("frobnicate").assert().code(2);
}

// ── Exit code 2 for configuration/usage errors ───────────────────────────────

#[test]
fn outside_a_repo_exits_with_config_error() {
    let dir = TempDir::new().unwrap();
    drover()
        .arg("status")
        .current_dir(dir.path())
        .env("GIT_CEILING_DIRECTORIES", dir.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("git repository"));
}

#[test]
fn zero_max_workers_rejected() {
    let dir = git_repo();
    drover()
        .args(["parallel", "--max-workers", "0"])
        .current_dir(dir.path())
        .assert()
        .code(2);
}

// ── Status ───────────────────────────────────────────────────────────────────

#[test]
fn status_without_state_reports_none() {
    let dir = git_repo();
    drover()
        .arg("status")
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("no processing state"));
}

#[test]
fn status_renders_recorded_state() {
    let dir = git_repo();
    fs::write(
        dir.path().join(".drover-auto-state.json"),
        r#"{
            "schema_version": 1,
            "completed_issues": ["BUG-1"],
            "failed_issues": {"BUG-2": "worker timed out (idle)"},
            "in_progress": [],
            "phase_by_issue": {},
            "timing_by_issue": {},
            "stash_pop_failures": {}
        }"#,
    )
    .unwrap();

    drover()
        .arg("status")
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("+ BUG-1"))
        .stdout(predicate::str::contains("x BUG-2: worker timed out"));
}

// ── Cleanup ──────────────────────────────────────────────────────────────────

#[test]
fn cleanup_removes_stale_worker_worktrees() {
    let dir = git_repo();
    // A real stale worktree.
    let wt = dir.path().join(".drover/worktrees/worker-bug-1-stale");
    git(
        dir.path(),
        &[
            "worktree",
            "add",
            "-b",
            "parallel/bug-1-stale",
            wt.to_str().unwrap(),
            "main",
        ],
    );
    assert!(wt.exists());

    drover()
        .arg("cleanup")
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("removed 1 stale worktree"));
    assert!(!wt.exists());
}

// ── Empty runs succeed ───────────────────────────────────────────────────────

#[test]
fn parallel_with_no_issues_exits_clean() {
    let dir = git_repo();
    drover()
        .arg("parallel")
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("0 merged"));
}
