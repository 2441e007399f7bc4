//! Worker pool: bounded concurrent execution of issues in isolated
//! worktrees.
//!
//! Each dispatched issue gets a fresh branch and worktree, a worker-CLI run
//! with per-issue timeouts, work verification against the excluded roots,
//! and leak detection against a baseline snapshot of the main repo. The
//! worktree is left in place for the merge coordinator, which may still need
//! it for a rebase.
//!
//! Exception containment is strict: whatever happens inside a worker thread,
//! exactly one `WorkerResult` reaches the completion channel.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{info, warn};

use crate::config::OrchestratorConfig;
use crate::git::{GitRepo, StatusReport};
use crate::issue::Issue;
use crate::runner::{self, RunResult, RunSpec, Termination};

/// Literal stdout prefix by which a worker marks the issue as invalid or
/// already resolved: close it instead of merging.
pub const ISSUE_CLOSE_PREFIX: &str = "ISSUE_CLOSE:";

/// Env var telling the worker CLI to keep the process working directory.
const KEEP_CWD_ENV: &str = "MAINTAIN_PROJECT_WORKING_DIR";

const EXCERPT_LEN: usize = 2000;
const EXCLUDED_SAMPLE: usize = 5;

/// Signals observed on the worker's output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSignals {
    pub context_handoff_emitted: bool,
}

/// Result of one worker run, handed to the merge coordinator.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub issue_id: String,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    pub success: bool,
    /// Close the issue as invalid instead of merging.
    pub should_close: bool,
    /// Committed file changes in the worktree, relative paths.
    pub files_changed: Vec<String>,
    pub stdout_excerpt: String,
    pub stderr_excerpt: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub signals: WorkerSignals,
    /// Set when `success` is false.
    pub failure_reason: Option<String>,
}

impl WorkerResult {
    /// Synthesized failure for crashes and setup errors; always delivered
    /// through the normal completion channel.
    fn synthetic_failure(issue_id: &str, reason: String) -> Self {
        Self {
            issue_id: issue_id.to_string(),
            branch_name: String::new(),
            worktree_path: PathBuf::new(),
            success: false,
            should_close: false,
            files_changed: vec![],
            stdout_excerpt: String::new(),
            stderr_excerpt: String::new(),
            exit_code: None,
            duration: Duration::ZERO,
            signals: WorkerSignals::default(),
            failure_reason: Some(reason),
        }
    }
}

/// Snapshot of the main repo used to detect files leaked by a worker.
#[derive(Debug, Clone, Default)]
struct Baseline {
    tracked: BTreeSet<String>,
    untracked: BTreeSet<String>,
}

impl Baseline {
    fn from_report(report: &StatusReport) -> Self {
        Self {
            tracked: report.entries.iter().map(|e| e.path.clone()).collect(),
            untracked: report.untracked.clone(),
        }
    }
}

/// Bounded executor: one OS thread per dispatched issue.
pub struct WorkerPool {
    config: Arc<OrchestratorConfig>,
    git: GitRepo,
    completions: Sender<WorkerResult>,
    cancel: Arc<AtomicBool>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        git: GitRepo,
        completions: Sender<WorkerResult>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            git,
            completions,
            cancel,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Dispatch one issue on its own thread. The thread always delivers
    /// exactly one result: panics become synthetic failures.
    pub fn spawn(&self, issue: Issue) {
        let config = Arc::clone(&self.config);
        let git = self.git.clone();
        let tx = self.completions.clone();
        let cancel = Arc::clone(&self.cancel);
        let id = issue.id.clone();
        let thread_id = id.clone();

        let handle = std::thread::Builder::new()
            .name(format!("worker-{}", issue.id_slug()))
            .spawn(move || {
                let id = thread_id;
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    run_issue(&config, &git, &issue, &cancel)
                }));
                let result = match outcome {
                    Ok(result) => result,
                    Err(payload) => {
                        let reason = panic_message(payload.as_ref());
                        warn!("worker thread for {id} crashed: {reason}");
                        WorkerResult::synthetic_failure(&id, format!("worker crashed: {reason}"))
                    }
                };
                if tx.send(result).is_err() {
                    warn!("completion channel closed before {id} could report");
                }
            });

        match handle {
            Ok(h) => self.handles.lock().unwrap_or_else(|e| e.into_inner()).push(h),
            Err(e) => {
                // Thread spawn failure still produces the one result.
                let _ = self.completions.send(WorkerResult::synthetic_failure(
                    &id,
                    format!("could not spawn worker thread: {e}"),
                ));
            }
        }
    }

    /// Wait for every dispatched thread to finish.
    pub fn join_all(&self) {
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for h in handles {
            let _ = h.join();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ── The per-issue pipeline ────────────────────────────────────────────────────

fn run_issue(
    config: &OrchestratorConfig,
    git: &GitRepo,
    issue: &Issue,
    cancel: &Arc<AtomicBool>,
) -> WorkerResult {
    // 1. Baseline snapshot of the main repo, under the repo lock.
    let baseline = match git.status() {
        Ok(report) => Baseline::from_report(&report),
        Err(e) => {
            return WorkerResult::synthetic_failure(
                &issue.id,
                format!("baseline status failed: {e}"),
            )
        }
    };

    // 2. Branch + worktree, serialized with the repo lock inside the adapter.
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let branch = format!("parallel/{}-{stamp}", issue.id_slug());
    let worktree = config
        .worktree_base
        .join(format!("worker-{}-{stamp}", issue.id_slug()));

    let base_commit = match git.rev_parse(&config.main_branch) {
        Ok(Some(hash)) => hash.0,
        Ok(None) => {
            return WorkerResult::synthetic_failure(
                &issue.id,
                format!("branch {} not found", config.main_branch),
            )
        }
        Err(e) => {
            return WorkerResult::synthetic_failure(&issue.id, format!("rev-parse failed: {e}"))
        }
    };

    let mut created = git.worktree_add(&worktree, &branch, &config.main_branch);
    if created.is_err() {
        // One retry; transient lock contention is the usual cause.
        warn!("worktree creation for {} failed once, retrying", issue.id);
        std::thread::sleep(Duration::from_millis(500));
        created = git.worktree_add(&worktree, &branch, &config.main_branch);
    }
    if let Err(e) = created {
        return WorkerResult::synthetic_failure(
            &issue.id,
            format!("worktree creation failed: {e}"),
        );
    }

    for rel in &config.copy_into_worktree {
        let src = config.repo_root.join(rel);
        if src.exists() {
            if let Err(e) = copy_recursively(&src, &worktree.join(rel)) {
                warn!("could not copy {rel} into worktree for {}: {e}", issue.id);
            }
        }
    }

    // 3. Run the worker CLI, with at most `max_continuations` continuation
    //    retries after a context-handoff signal. `run` is initialized before
    //    the loop so the paths below stay well-formed even if no attempt ran.
    let verb = config
        .category_for_prefix(&issue.category)
        .map(|c| c.verb.clone())
        .unwrap_or_else(|| "fix".to_string());
    let spec = RunSpec {
        cmd: vec![
            config.worker_cli.clone(),
            "--no-interactive-permissions".to_string(),
            "--print".to_string(),
            format!("/{verb} {}", issue.id),
        ],
        cwd: worktree.clone(),
        env: vec![(KEEP_CWD_ENV.to_string(), "1".to_string())],
        total_timeout: config.issue_timeout,
        idle_timeout: config.idle_timeout,
        no_output_stall: config.no_output_stall,
        cancel: Some(Arc::clone(cancel)),
    };

    let mut run = RunResult::not_run();
    let mut handoff_seen = false;
    for attempt in 0..=config.max_continuations {
        match runner::run(&spec) {
            Ok(result) => {
                handoff_seen = handoff_seen || result.context_handoff;
                let continue_again =
                    result.context_handoff && attempt < config.max_continuations;
                run = result;
                if !continue_again {
                    break;
                }
                info!("{}: context handoff, continuing (attempt {})", issue.id, attempt + 2);
            }
            Err(e) => {
                return finish(
                    issue,
                    &branch,
                    &worktree,
                    RunResult::not_run(),
                    vec![],
                    false,
                    Some(format!("worker launch failed: {e}")),
                    WorkerSignals {
                        context_handoff_emitted: handoff_seen,
                    },
                );
            }
        }
    }

    let should_close = run
        .stdout
        .lines()
        .any(|l| l.starts_with(ISSUE_CLOSE_PREFIX));

    // 4. Work verification: committed changes, classified against the
    //    excluded roots.
    let files_changed = git.changed_files_in(&worktree, &base_commit).unwrap_or_else(|e| {
        warn!("{}: could not list changed files: {e}", issue.id);
        vec![]
    });
    let excluded_prefixes = config.excluded_prefixes();
    let (meaningful, excluded): (Vec<&String>, Vec<&String>) = files_changed
        .iter()
        .partition(|p| !excluded_prefixes.iter().any(|pre| p.starts_with(pre.as_str())));

    // 5. Leak detection against the baseline, cleanup under the repo lock.
    detect_and_clean_leaks(config, git, issue, &baseline);

    // 6. Finalize.
    let signals = WorkerSignals {
        context_handoff_emitted: handoff_seen,
    };

    let failure_reason = if !run.succeeded() {
        Some(match run.terminated_by {
            Termination::TotalTimeout => "worker timed out (total)".to_string(),
            Termination::IdleTimeout => "worker timed out (idle)".to_string(),
            Termination::Zombie => "worker process unkillable (zombie)".to_string(),
            Termination::Signal => "worker killed by signal".to_string(),
            Termination::Normal => match run.exit_code {
                Some(code) => format!("worker exited with code {code}"),
                None => "worker exited without a status code".to_string(),
            },
        })
    } else if should_close {
        None
    } else if meaningful.is_empty() {
        let sample: Vec<&str> = excluded
            .iter()
            .take(EXCLUDED_SAMPLE)
            .map(|s| s.as_str())
            .collect();
        Some(if sample.is_empty() {
            "no meaningful work: no files changed".to_string()
        } else {
            format!(
                "no meaningful work: all {} changed files excluded (e.g. {})",
                files_changed.len(),
                sample.join(", ")
            )
        })
    } else {
        None
    };

    finish(
        issue,
        &branch,
        &worktree,
        run,
        files_changed,
        should_close,
        failure_reason,
        signals,
    )
}

#[allow(clippy::too_many_arguments)]
fn finish(
    issue: &Issue,
    branch: &str,
    worktree: &Path,
    run: RunResult,
    files_changed: Vec<String>,
    should_close: bool,
    failure_reason: Option<String>,
    signals: WorkerSignals,
) -> WorkerResult {
    WorkerResult {
        issue_id: issue.id.clone(),
        branch_name: branch.to_string(),
        worktree_path: worktree.to_path_buf(),
        success: failure_reason.is_none(),
        should_close,
        files_changed,
        stdout_excerpt: tail(&run.stdout, EXCERPT_LEN),
        stderr_excerpt: tail(&run.stderr, EXCERPT_LEN),
        exit_code: run.exit_code,
        duration: run.duration,
        signals,
        failure_reason,
    }
}

/// Compare the main repo against the baseline and scrub leaked paths.
fn detect_and_clean_leaks(
    config: &OrchestratorConfig,
    git: &GitRepo,
    issue: &Issue,
    baseline: &Baseline,
) {
    let report = match git.status() {
        Ok(r) => r,
        Err(e) => {
            warn!("{}: leak check status failed: {e}", issue.id);
            return;
        }
    };

    // Untracked directories come back without a trailing slash ("issues"),
    // file paths with their full relative path ("issues/bugs/X.md"); match
    // the prefixes both ways.
    let leak_prefixes = config.excluded_prefixes();
    let is_leak = |p: &str| {
        let dir_form = format!("{p}/");
        leak_prefixes
            .iter()
            .any(|pre| p.starts_with(pre.as_str()) || dir_form.starts_with(pre.as_str()))
    };

    let mut leaked: Vec<String> = Vec::new();
    for entry in &report.entries {
        // Staged-only entries are lifecycle moves made by the coordinator;
        // a worker can only leak through the working tree.
        if entry.worktree_state == ' ' {
            continue;
        }
        if !baseline.tracked.contains(&entry.path) && is_leak(&entry.path) {
            leaked.push(entry.path.clone());
        }
    }
    for path in &report.untracked {
        if !baseline.untracked.contains(path) && is_leak(path) {
            leaked.push(path.clone());
        }
    }

    if leaked.is_empty() {
        return;
    }
    warn!(
        "{}: worker leaked {} path(s) into the main repo: {}",
        issue.id,
        leaked.len(),
        leaked.join(", ")
    );
    if let Err(e) = git.clean_paths(&leaked) {
        warn!("{}: leak cleanup failed: {e}", issue.id);
    }
}

fn tail(s: &str, n: usize) -> String {
    if s.len() <= n {
        return s.to_string();
    }
    let start = s.len() - n;
    // Snap to a char boundary.
    let start = (start..s.len()).find(|i| s.is_char_boundary(*i)).unwrap_or(0);
    s[start..].to_string()
}

fn copy_recursively(src: &Path, dst: &Path) -> std::io::Result<()> {
    if src.is_dir() {
        std::fs::create_dir_all(dst)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_recursively(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dst)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::new_repo_lock;
    use crate::issue::IssueStatus;
    use crossbeam_channel::unbounded;
    use std::fs;
    use tempfile::TempDir;

    fn test_repo(dir: &Path) -> GitRepo {
        let repo = GitRepo::new(dir, new_repo_lock(), Duration::from_secs(30));
        for args in [
            vec!["init", "-q", "-b", "main"],
            vec!["config", "user.email", "t@e.c"],
            vec!["config", "user.name", "t"],
        ] {
            let status = std::process::Command::new("git")
                .args(&args)
                .current_dir(dir)
                .status()
                .unwrap();
            assert!(status.success());
        }
        fs::write(dir.join("README.md"), "seed\n").unwrap();
        for args in [vec!["add", "."], vec!["commit", "-q", "-m", "init"]] {
            let status = std::process::Command::new("git")
                .args(&args)
                .current_dir(dir)
                .status()
                .unwrap();
            assert!(status.success());
        }
        repo
    }

    /// Install a fake worker CLI: a shell script that ignores its arguments
    /// and runs `body` in the worktree it was invoked in.
    fn fake_worker(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-worker");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_string_lossy().into_owned()
    }

    fn test_issue(id: &str) -> Issue {
        Issue {
            id: id.to_string(),
            category: "BUG".to_string(),
            priority: 2,
            path: PathBuf::from(format!("/tmp/{id}.md")),
            title: id.to_string(),
            status: IssueStatus::Open,
            depends_on: vec![],
            front_matter: None,
            parse_warning: None,
        }
    }

    fn pool_setup(repo_dir: &Path, worker_body: &str) -> (Arc<OrchestratorConfig>, GitRepo) {
        let git = test_repo(repo_dir);
        let mut config = OrchestratorConfig::defaults(repo_dir);
        config.worker_cli = fake_worker(repo_dir.parent().unwrap(), worker_body);
        config.issue_timeout = Duration::from_secs(20);
        config.idle_timeout = Duration::from_secs(20);
        config.no_output_stall = Duration::from_secs(20);
        (Arc::new(config), git)
    }

    fn run_one(config: Arc<OrchestratorConfig>, git: GitRepo, issue: Issue) -> WorkerResult {
        let (tx, rx) = unbounded();
        let pool = WorkerPool::new(config, git, tx, Arc::new(AtomicBool::new(false)));
        pool.spawn(issue);
        let result = rx.recv_timeout(Duration::from_secs(60)).unwrap();
        pool.join_all();
        result
    }

    #[test]
    fn committed_work_yields_success() {
        let outer = TempDir::new().unwrap();
        let repo_dir = outer.path().join("repo");
        fs::create_dir(&repo_dir).unwrap();
        let (config, git) = pool_setup(
            &repo_dir,
            "echo fixing\necho 'fix' > src.rs\ngit add src.rs\ngit commit -q -m 'fix BUG-1'",
        );

        let result = run_one(config, git.clone(), test_issue("BUG-1"));
        assert!(result.success, "reason: {:?}", result.failure_reason);
        assert_eq!(result.files_changed, vec!["src.rs"]);
        assert!(result.branch_name.starts_with("parallel/bug-1-"));
        // Worktree retained for the merge coordinator.
        assert!(result.worktree_path.exists());
        assert!(result.stdout_excerpt.contains("fixing"));
        git.worktree_remove(&result.worktree_path, true).unwrap();
    }

    #[test]
    fn no_changes_is_no_meaningful_work() {
        let outer = TempDir::new().unwrap();
        let repo_dir = outer.path().join("repo");
        fs::create_dir(&repo_dir).unwrap();
        let (config, git) = pool_setup(&repo_dir, "echo looked around, did nothing");

        let result = run_one(config, git.clone(), test_issue("BUG-2"));
        assert!(!result.success);
        assert!(result
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("no meaningful work"));
        git.worktree_remove(&result.worktree_path, true).unwrap();
    }

    #[test]
    fn excluded_only_changes_fail_and_name_the_paths() {
        let outer = TempDir::new().unwrap();
        let repo_dir = outer.path().join("repo");
        fs::create_dir(&repo_dir).unwrap();
        let (config, git) = pool_setup(
            &repo_dir,
            "mkdir -p issues/bugs\necho x > issues/bugs/BUG-3-x.md\ngit add issues\ngit commit -q -m notes",
        );

        let result = run_one(config, git.clone(), test_issue("BUG-3"));
        assert!(!result.success);
        let reason = result.failure_reason.as_deref().unwrap();
        assert!(reason.contains("no meaningful work"), "{reason}");
        assert!(reason.contains("issues/bugs/BUG-3-x.md"), "{reason}");
        git.worktree_remove(&result.worktree_path, true).unwrap();
    }

    #[test]
    fn close_marker_sets_should_close() {
        let outer = TempDir::new().unwrap();
        let repo_dir = outer.path().join("repo");
        fs::create_dir(&repo_dir).unwrap();
        let (config, git) = pool_setup(
            &repo_dir,
            "echo 'ISSUE_CLOSE: already fixed upstream'",
        );

        let result = run_one(config, git.clone(), test_issue("BUG-4"));
        assert!(result.should_close);
        assert!(result.success);
        git.worktree_remove(&result.worktree_path, true).unwrap();
    }

    #[test]
    fn leaked_issue_files_are_scrubbed_from_main_repo() {
        let outer = TempDir::new().unwrap();
        let repo_dir = outer.path().join("repo");
        fs::create_dir(&repo_dir).unwrap();
        let leak_target = repo_dir.join("issues/bugs/LEAK.md");
        let body = format!(
            "mkdir -p {parent}\necho leak > {leak}\necho 'fix' > src.rs\ngit add src.rs\ngit commit -q -m fix",
            parent = leak_target.parent().unwrap().display(),
            leak = leak_target.display(),
        );
        let (config, git) = pool_setup(&repo_dir, &body);

        let result = run_one(config, git.clone(), test_issue("BUG-5"));
        assert!(result.success);
        assert!(!leak_target.exists(), "leaked file must be cleaned up");
        git.worktree_remove(&result.worktree_path, true).unwrap();
    }

    #[test]
    fn spawn_failure_still_delivers_one_result() {
        let outer = TempDir::new().unwrap();
        let repo_dir = outer.path().join("repo");
        fs::create_dir(&repo_dir).unwrap();
        let git = test_repo(&repo_dir);
        let mut config = OrchestratorConfig::defaults(&repo_dir);
        config.worker_cli = "/definitely/not/a/binary".to_string();

        let result = run_one(Arc::new(config), git.clone(), test_issue("BUG-6"));
        assert!(!result.success);
        assert!(result
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("worker launch failed"));
        if result.worktree_path.exists() {
            git.worktree_remove(&result.worktree_path, true).unwrap();
        }
    }

    #[test]
    fn context_handoff_triggers_one_continuation() {
        let outer = TempDir::new().unwrap();
        let repo_dir = outer.path().join("repo");
        fs::create_dir(&repo_dir).unwrap();
        let counter = outer.path().join("attempts");
        let body = format!(
            "echo . >> {c}\nif [ $(wc -l < {c}) -eq 1 ]; then echo 'CONTEXT_HANDOFF: out of context'; exit 0; fi\necho 'fix' > src.rs\ngit add src.rs\ngit commit -q -m fix",
            c = counter.display(),
        );
        let (config, git) = pool_setup(&repo_dir, &body);

        let result = run_one(config, git.clone(), test_issue("BUG-7"));
        assert!(result.success, "reason: {:?}", result.failure_reason);
        assert!(result.signals.context_handoff_emitted);
        assert_eq!(fs::read_to_string(&counter).unwrap().lines().count(), 2);
        git.worktree_remove(&result.worktree_path, true).unwrap();
    }

    #[test]
    fn zero_continuations_still_returns_a_result() {
        let outer = TempDir::new().unwrap();
        let repo_dir = outer.path().join("repo");
        fs::create_dir(&repo_dir).unwrap();
        let (mut config, git) = {
            let (c, g) = pool_setup(&repo_dir, "echo 'CONTEXT_HANDOFF: more please'");
            ((*c).clone(), g)
        };
        config.max_continuations = 0;

        let result = run_one(Arc::new(config), git.clone(), test_issue("BUG-8"));
        // One run, handoff recorded, no meaningful work.
        assert!(result.signals.context_handoff_emitted);
        assert!(!result.success);
        git.worktree_remove(&result.worktree_path, true).unwrap();
    }

    #[test]
    fn tail_keeps_last_bytes_on_char_boundary() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 10), "ab");
        let s = "héllo wörld";
        let t = tail(s, 6);
        assert!(s.ends_with(&t));
    }
}
