//! Orchestrator configuration — loaded from `<repo>/.drover/config` and
//! `DROVER_*` environment variables.
//!
//! File format is one `key = value` entry per line; `#` starts a comment.
//! Environment variables take priority over the config file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_MAX_WORKERS: usize = 3;
const MAX_MAX_WORKERS: usize = 8;
const DEFAULT_TOTAL_TIMEOUT_SECS: u64 = 4 * 3600;
const DEFAULT_ISSUE_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_CONTINUATIONS: u32 = 1;
const DEFAULT_MAX_MERGE_RETRIES: u32 = 3;
const DEFAULT_BREAKER_THRESHOLD: u32 = 3;
pub const DEFAULT_WORKER_CLI: &str = "claude";
pub const STATE_FILE_NAME: &str = ".drover-auto-state.json";

/// One issue category: ID prefix, on-disk directory, and the verb used when
/// asking the worker CLI to act on an issue of this kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategorySpec {
    pub prefix: String,
    pub dir: String,
    pub verb: String,
}

impl CategorySpec {
    fn new(prefix: &str, dir: &str, verb: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            dir: dir.to_string(),
            verb: verb.to_string(),
        }
    }
}

fn default_categories() -> Vec<CategorySpec> {
    vec![
        CategorySpec::new("BUG", "bugs", "fix"),
        CategorySpec::new("ENH", "enhancements", "implement"),
        CategorySpec::new("REF", "refactors", "improve"),
        CategorySpec::new("DOC", "docs", "improve"),
    ]
}

/// Runtime configuration for an orchestrator run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root of the main repository checkout.
    pub repo_root: PathBuf,
    /// Directory containing per-category issue subdirectories and `completed/`.
    pub issues_root: PathBuf,
    /// Where transient worker worktrees are created.
    pub worktree_base: PathBuf,
    /// Where conflicting untracked files are preserved per issue.
    pub backup_root: PathBuf,
    /// Durable processing-state file (atomic replace).
    pub state_file: PathBuf,
    /// Issue categories (prefix → directory + action verb).
    pub categories: Vec<CategorySpec>,
    /// Max parallel workers (1–8).
    pub max_workers: usize,
    /// Process P0 issues strictly sequentially before the parallel phase.
    pub p0_sequential: bool,
    /// Whole-run timeout.
    pub total_timeout: Duration,
    /// Per-issue total timeout for the worker CLI.
    pub issue_timeout: Duration,
    /// Per-issue idle (no output) timeout for the worker CLI.
    pub idle_timeout: Duration,
    /// Stall threshold for workers that have produced no output at all.
    /// Defaults to `idle_timeout`.
    pub no_output_stall: Duration,
    /// Timeout for every individual git subprocess call.
    pub command_timeout: Duration,
    /// Continuation retries allowed after a context-handoff signal.
    pub max_continuations: u32,
    /// Merge attempts per request before terminal failure.
    pub max_merge_retries: u32,
    /// Consecutive merge failures before the coordinator pauses.
    pub circuit_breaker_threshold: u32,
    /// Path prefixes (relative, undotted form) whose changes never count as
    /// meaningful work. The issues root is always included.
    pub excluded_roots: Vec<String>,
    /// Files/directories copied from the main checkout into each worktree.
    pub copy_into_worktree: Vec<String>,
    /// Extra relative paths the merge coordinator never stashes.
    pub stash_exclude: Vec<String>,
    /// Worker CLI executable.
    pub worker_cli: String,
    /// Issues closed without a merge skip the circuit breaker.
    pub close_bypasses_breaker: bool,
    /// Remote name for pulls.
    pub remote: String,
    /// Integration branch name.
    pub main_branch: String,
}

impl OrchestratorConfig {
    /// Build the default configuration rooted at `repo_root`.
    pub fn defaults(repo_root: &Path) -> Self {
        let drover_dir = repo_root.join(".drover");
        Self {
            repo_root: repo_root.to_path_buf(),
            issues_root: repo_root.join("issues"),
            worktree_base: drover_dir.join("worktrees"),
            backup_root: drover_dir.join("backups"),
            state_file: repo_root.join(STATE_FILE_NAME),
            categories: default_categories(),
            max_workers: DEFAULT_MAX_WORKERS,
            p0_sequential: true,
            total_timeout: Duration::from_secs(DEFAULT_TOTAL_TIMEOUT_SECS),
            issue_timeout: Duration::from_secs(DEFAULT_ISSUE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            no_output_stall: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            max_continuations: DEFAULT_MAX_CONTINUATIONS,
            max_merge_retries: DEFAULT_MAX_MERGE_RETRIES,
            circuit_breaker_threshold: DEFAULT_BREAKER_THRESHOLD,
            excluded_roots: vec!["thoughts".to_string()],
            copy_into_worktree: vec![".drover/worker-settings.json".to_string()],
            stash_exclude: vec![".drover/worker-context.json".to_string()],
            worker_cli: DEFAULT_WORKER_CLI.to_string(),
            close_bypasses_breaker: true,
            remote: "origin".to_string(),
            main_branch: "main".to_string(),
        }
    }

    /// Load config from `<repo>/.drover/config` and environment overrides.
    ///
    /// Environment variables take priority over the config file.
    pub fn load(repo_root: &Path) -> Self {
        let mut cfg = Self::defaults(repo_root);

        let config_file = repo_root.join(".drover").join("config");
        if let Ok(contents) = fs::read_to_string(&config_file) {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    cfg.apply(key.trim(), value.trim());
                }
            }
        }

        for (key, env) in [
            ("max_workers", "DROVER_MAX_WORKERS"),
            ("p0_sequential", "DROVER_P0_SEQUENTIAL"),
            ("total_timeout", "DROVER_TOTAL_TIMEOUT"),
            ("issue_timeout", "DROVER_ISSUE_TIMEOUT"),
            ("idle_timeout", "DROVER_IDLE_TIMEOUT"),
            ("no_output_stall", "DROVER_NO_OUTPUT_STALL"),
            ("command_timeout", "DROVER_COMMAND_TIMEOUT"),
            ("max_continuations", "DROVER_MAX_CONTINUATIONS"),
            ("max_merge_retries", "DROVER_MAX_MERGE_RETRIES"),
            ("circuit_breaker_threshold", "DROVER_BREAKER_THRESHOLD"),
            ("worker_cli", "DROVER_WORKER_CLI"),
            ("issues_root", "DROVER_ISSUES_ROOT"),
            ("remote", "DROVER_REMOTE"),
            ("main_branch", "DROVER_MAIN_BRANCH"),
        ] {
            if let Ok(v) = std::env::var(env) {
                cfg.apply(key, &v);
            }
        }

        cfg
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "max_workers" => {
                if let Ok(n) = value.parse::<usize>() {
                    self.max_workers = n.clamp(1, MAX_MAX_WORKERS);
                }
            }
            "p0_sequential" => self.p0_sequential = value == "true" || value == "1",
            "total_timeout" => apply_secs(&mut self.total_timeout, value),
            "issue_timeout" => apply_secs(&mut self.issue_timeout, value),
            "idle_timeout" => {
                // no_output_stall tracks idle_timeout unless set explicitly.
                let before = self.no_output_stall == self.idle_timeout;
                apply_secs(&mut self.idle_timeout, value);
                if before {
                    self.no_output_stall = self.idle_timeout;
                }
            }
            "no_output_stall" => apply_secs(&mut self.no_output_stall, value),
            "command_timeout" => apply_secs(&mut self.command_timeout, value),
            "max_continuations" => apply_u32(&mut self.max_continuations, value),
            "max_merge_retries" => apply_u32(&mut self.max_merge_retries, value),
            "circuit_breaker_threshold" => {
                apply_u32(&mut self.circuit_breaker_threshold, value)
            }
            "worker_cli" => self.worker_cli = value.to_string(),
            "issues_root" => self.issues_root = self.repo_root.join(value),
            "remote" => self.remote = value.to_string(),
            "main_branch" => self.main_branch = value.to_string(),
            "close_bypasses_breaker" => {
                self.close_bypasses_breaker = value == "true" || value == "1"
            }
            "excluded_root" => self.excluded_roots.push(value.to_string()),
            "copy_into_worktree" => self.copy_into_worktree.push(value.to_string()),
            "stash_exclude" => self.stash_exclude.push(value.to_string()),
            key if key.starts_with("category.") => {
                // category.PREFIX = dir:verb
                let prefix = &key["category.".len()..];
                if let Some((dir, verb)) = value.split_once(':') {
                    let spec = CategorySpec::new(prefix, dir.trim(), verb.trim());
                    if let Some(existing) =
                        self.categories.iter_mut().find(|c| c.prefix == spec.prefix)
                    {
                        *existing = spec;
                    } else {
                        self.categories.push(spec);
                    }
                }
            }
            _ => {}
        }
    }

    /// Look up a category by its ID prefix.
    pub fn category_for_prefix(&self, prefix: &str) -> Option<&CategorySpec> {
        self.categories.iter().find(|c| c.prefix == prefix)
    }

    /// Name of the issues root directory (final path component).
    pub fn issues_root_name(&self) -> String {
        self.issues_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "issues".to_string())
    }

    /// Relative path prefixes that identify leaked or excluded files, in both
    /// dotted and undotted forms (`issues/`, `.issues/`, `thoughts/`, …).
    pub fn excluded_prefixes(&self) -> Vec<String> {
        let mut roots = vec![self.issues_root_name()];
        roots.extend(self.excluded_roots.iter().cloned());
        let mut out = Vec::new();
        for root in roots {
            let bare = root.trim_start_matches('.').to_string();
            out.push(format!("{bare}/"));
            out.push(format!(".{bare}/"));
        }
        out.sort();
        out.dedup();
        out
    }

    /// Relative path of the state file within the repo.
    pub fn state_file_name(&self) -> String {
        self.state_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| STATE_FILE_NAME.to_string())
    }
}

fn apply_secs(slot: &mut Duration, value: &str) {
    if let Ok(n) = value.parse::<u64>() {
        *slot = Duration::from_secs(n);
    }
}

fn apply_u32(slot: &mut u32, value: &str) {
    if let Ok(n) = value.parse::<u32>() {
        *slot = n;
    }
}
