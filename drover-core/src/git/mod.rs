//! Repo-ops adapter: a narrow typed interface over the `git` CLI.
//!
//! Every mutating call on the main repository takes the repo lock for its
//! duration; worktree-local calls do not. All subprocess calls are bounded
//! by the configured command timeout and surface [`GitError::TimedOut`]
//! instead of blocking indefinitely.
//!
//! The CLI is used instead of a library binding on purpose: it refuses to
//! clobber uncommitted tracked changes and untracked files during
//! checkout/merge/rebase unless explicitly forced, which is exactly the
//! safety net the merge coordinator depends on.

pub mod outcome;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::warn;

pub use outcome::{
    BackedUpPath, CommitHash, GitError, IndexHealth, MergeBranchOutcome, PopOutcome, PullOutcome,
    PullStrategy, RebaseOutcome, StashHandle, StatusEntry, StatusReport,
};

/// The single process-wide exclusion primitive for main-repo mutation.
pub type RepoLock = Arc<Mutex<()>>;

/// Create a fresh repo lock.
pub fn new_repo_lock() -> RepoLock {
    Arc::new(Mutex::new(()))
}

/// Raw result of one git subprocess call.
#[derive(Debug)]
struct GitOutput {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl GitOutput {
    fn ok(&self) -> bool {
        self.code == Some(0)
    }

    fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Typed wrapper around source-control operations on one repository.
///
/// Clone-safe: the lock is shared, everything else is owned.
#[derive(Clone)]
pub struct GitRepo {
    root: PathBuf,
    lock: RepoLock,
    command_timeout: Duration,
}

impl GitRepo {
    pub fn new(root: &Path, lock: RepoLock, command_timeout: Duration) -> Self {
        Self {
            root: root.to_path_buf(),
            lock,
            command_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock(&self) -> &RepoLock {
        &self.lock
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // A poisoned lock means a holder panicked; the guard itself is still
        // usable and the git state is re-checked by index_health.
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Subprocess plumbing ───────────────────────────────────────────────────

    fn exec_in(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        let mut child = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    GitError::NotAvailable
                } else {
                    GitError::Io(e)
                }
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_handle = std::thread::spawn(move || read_all(stdout));
        let err_handle = std::thread::spawn(move || read_all(stderr));

        let deadline = Instant::now() + self.command_timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(GitError::TimedOut {
                    args: args.join(" "),
                    secs: self.command_timeout.as_secs(),
                });
            }
            std::thread::sleep(Duration::from_millis(20));
        };

        Ok(GitOutput {
            code: status.code(),
            stdout: out_handle.join().unwrap_or_default(),
            stderr: err_handle.join().unwrap_or_default(),
        })
    }

    fn exec(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        self.exec_in(&self.root, args)
    }

    /// Run in the main repo and require exit 0.
    fn exec_ok(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        let out = self.exec(args)?;
        if out.ok() {
            Ok(out)
        } else {
            Err(GitError::CommandFailed {
                args: args.join(" "),
                stderr: first_lines(&out.stderr, 4),
            })
        }
    }

    fn exec_ok_in(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        let out = self.exec_in(cwd, args)?;
        if out.ok() {
            Ok(out)
        } else {
            Err(GitError::CommandFailed {
                args: args.join(" "),
                stderr: first_lines(&out.stderr, 4),
            })
        }
    }

    // ── Status ────────────────────────────────────────────────────────────────

    /// Status of the main repo. Takes the repo lock so the snapshot is a
    /// consistent baseline against concurrent mutation.
    pub fn status(&self) -> Result<StatusReport, GitError> {
        let _g = self.guard();
        self.status_unlocked()
    }

    fn status_unlocked(&self) -> Result<StatusReport, GitError> {
        let out = self.exec_ok(&["status", "--porcelain"])?;
        Ok(parse_porcelain(&out.stdout))
    }

    /// Status of an arbitrary worktree directory. Worktree-local, no lock.
    pub fn status_in(&self, dir: &Path) -> Result<StatusReport, GitError> {
        let out = self.exec_ok_in(dir, &["status", "--porcelain"])?;
        Ok(parse_porcelain(&out.stdout))
    }

    // ── Stash ─────────────────────────────────────────────────────────────────

    /// Stash tracked modifications not rejected by `exclude`.
    ///
    /// Returns `None` when nothing matched. With `include_untracked`,
    /// untracked paths passing the predicate are stashed too.
    pub fn stash(
        &self,
        include_untracked: bool,
        exclude: &dyn Fn(&str) -> bool,
    ) -> Result<Option<StashHandle>, GitError> {
        let _g = self.guard();
        let report = self.status_unlocked()?;

        let mut paths: Vec<String> = report
            .entries
            .iter()
            .filter(|e| !exclude(&e.path))
            .map(|e| e.path.clone())
            .collect();
        if include_untracked {
            paths.extend(report.untracked.iter().filter(|p| !exclude(p)).cloned());
        }
        if paths.is_empty() {
            return Ok(None);
        }

        let marker = format!(
            "drover-stash-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S%3f")
        );
        let mut args: Vec<&str> = vec!["stash", "push", "-m", &marker];
        if include_untracked {
            args.push("-u");
        }
        args.push("--");
        for p in &paths {
            args.push(p);
        }
        self.exec_ok(&args)?;
        Ok(Some(StashHandle { marker }))
    }

    fn find_stash_ref(&self, handle: &StashHandle) -> Result<Option<String>, GitError> {
        let out = self.exec_ok(&["stash", "list", "--format=%gd%x09%gs"])?;
        for line in out.stdout.lines() {
            if let Some((reference, subject)) = line.split_once('\t') {
                if subject.contains(&handle.marker) {
                    return Ok(Some(reference.to_string()));
                }
            }
        }
        Ok(None)
    }

    /// True if the stash entry behind `handle` is still in the stash list.
    pub fn stash_entry_exists(&self, handle: &StashHandle) -> Result<bool, GitError> {
        let _g = self.guard();
        Ok(self.find_stash_ref(handle)?.is_some())
    }

    /// Pop a stash previously taken with [`GitRepo::stash`].
    ///
    /// On conflict the working tree is restored to the pre-pop state without
    /// any destructive reset of HEAD; the stash entry stays in the list so
    /// the caller can decide retention.
    pub fn pop_stash(&self, handle: &StashHandle) -> Result<PopOutcome, GitError> {
        let _g = self.guard();
        let Some(reference) = self.find_stash_ref(handle)? else {
            return Ok(PopOutcome::Missing);
        };

        let stashed_out = self.exec(&["stash", "show", "--name-only", &reference])?;
        let stashed_paths: Vec<String> = stashed_out
            .stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        let out = self.exec(&["stash", "pop", &reference])?;
        if out.ok() {
            return Ok(PopOutcome::Clean);
        }

        // Undo only the pop-induced state: unstage, then restore the stashed
        // paths to their post-merge (HEAD) content. The user's changes stay
        // recoverable in the retained stash entry.
        let _ = self.exec(&["reset", "-q"]);
        for path in &stashed_paths {
            if self.exec(&["checkout", "-q", "HEAD", "--", path])?.ok() {
                continue;
            }
            // Path absent from HEAD (stash introduced it): drop the partial copy.
            let abs = self.root.join(path);
            if abs.is_file() {
                let _ = std::fs::remove_file(&abs);
            }
        }
        Ok(PopOutcome::Conflicted)
    }

    // ── Pull / merge / rebase ─────────────────────────────────────────────────

    /// Pull `remote/branch` into the current branch with the given strategy.
    pub fn pull(
        &self,
        strategy: PullStrategy,
        remote: &str,
        branch: &str,
    ) -> Result<PullOutcome, GitError> {
        let _g = self.guard();
        let flag = match strategy {
            PullStrategy::Rebase => "--rebase",
            PullStrategy::Merge => "--no-rebase",
        };
        let out = self.exec(&["pull", flag, remote, branch])?;
        let combined = out.combined();

        if out.ok() {
            if combined.contains("Already up to date") || combined.contains("Current branch") {
                return Ok(PullOutcome::UpToDate);
            }
            if combined.contains("Fast-forward") {
                return Ok(PullOutcome::FastForwarded);
            }
            return Ok(match strategy {
                PullStrategy::Rebase => PullOutcome::Rebased,
                PullStrategy::Merge => PullOutcome::Merged,
            });
        }

        if combined.contains("CONFLICT") || combined.contains("could not apply") {
            return Ok(PullOutcome::Conflicted(
                self.conflicting_commit_from(&combined),
            ));
        }
        if combined.contains("local changes")
            || combined.contains("Please commit your changes or stash them")
        {
            return Ok(PullOutcome::Failed(format!(
                "local changes would be overwritten: {}",
                first_lines(&out.stderr, 2)
            )));
        }
        Ok(PullOutcome::Failed(first_lines(&combined, 3)))
    }

    /// Extract the upstream commit a rebase stopped on and expand it to a
    /// full 40-character hash. Only real hashes are ever returned.
    fn conflicting_commit_from(&self, output: &str) -> Option<String> {
        let short = output.lines().find_map(|line| {
            let rest = line.trim().strip_prefix("error: could not apply ")?;
            let token: String = rest
                .chars()
                .take_while(|c| c.is_ascii_hexdigit())
                .collect();
            (token.len() >= 7).then_some(token)
        })?;
        let out = self.exec(&["rev-parse", "--verify", &format!("{short}^{{commit}}")]).ok()?;
        if !out.ok() {
            return None;
        }
        let full = out.stdout.trim().to_string();
        (full.len() == 40 && full.chars().all(|c| c.is_ascii_hexdigit())).then_some(full)
    }

    /// Merge `branch` into the current branch.
    pub fn merge_branch(&self, branch: &str) -> Result<MergeBranchOutcome, GitError> {
        let _g = self.guard();
        let out = self.exec(&["merge", "--no-edit", branch])?;
        let combined = out.combined();

        if out.ok() {
            if combined.contains("Fast-forward") || combined.contains("Already up to date") {
                return Ok(MergeBranchOutcome::FastForwarded);
            }
            return Ok(MergeBranchOutcome::Merged);
        }

        if combined.contains("untracked working tree files would be overwritten") {
            return Ok(MergeBranchOutcome::UntrackedWouldBeOverwritten(
                parse_overwrite_paths(&out.stderr),
            ));
        }
        if combined.contains("CONFLICT") || combined.contains("Automatic merge failed") {
            return Ok(MergeBranchOutcome::Conflicted);
        }
        if combined.contains("Not possible to fast-forward") {
            return Ok(MergeBranchOutcome::NonFastForward);
        }
        Err(GitError::CommandFailed {
            args: format!("merge --no-edit {branch}"),
            stderr: first_lines(&combined, 3),
        })
    }

    pub fn merge_abort(&self) -> Result<(), GitError> {
        let _g = self.guard();
        self.exec(&["merge", "--abort"]).map(|_| ())
    }

    pub fn rebase_abort(&self) -> Result<(), GitError> {
        let _g = self.guard();
        self.exec(&["rebase", "--abort"]).map(|_| ())
    }

    /// `reset --hard HEAD` on the main repo. Used only by index recovery.
    pub fn reset_hard_head(&self) -> Result<(), GitError> {
        let _g = self.guard();
        self.exec_ok(&["reset", "--hard", "HEAD"]).map(|_| ())
    }

    /// Fetch `remote/branch` from within `dir`. Worktree-local; failures are
    /// reported but non-fatal for callers that can rebase onto a local ref.
    pub fn fetch_in(&self, dir: &Path, remote: &str, branch: &str) -> Result<(), GitError> {
        let out = self.exec_in(dir, &["fetch", remote, branch])?;
        if !out.ok() {
            return Err(GitError::CommandFailed {
                args: format!("fetch {remote} {branch}"),
                stderr: first_lines(&out.stderr, 2),
            });
        }
        Ok(())
    }

    /// Rebase the branch checked out in `dir` onto `base`. Worktree-local.
    pub fn rebase_in(&self, dir: &Path, base: &str) -> Result<RebaseOutcome, GitError> {
        let out = self.exec_in(dir, &["rebase", base])?;
        if out.ok() {
            return Ok(RebaseOutcome::Success);
        }
        let combined = out.combined();
        if combined.contains("CONFLICT") || combined.contains("could not apply") {
            return Ok(RebaseOutcome::Conflicted);
        }
        Ok(RebaseOutcome::Failed(first_lines(&combined, 3)))
    }

    pub fn rebase_abort_in(&self, dir: &Path) -> Result<(), GitError> {
        self.exec_in(dir, &["rebase", "--abort"]).map(|_| ())
    }

    // ── Worktrees ─────────────────────────────────────────────────────────────

    /// Create branch `branch` at `base` and add a worktree for it at `path`.
    ///
    /// Branch creation and worktree addition happen under one lock
    /// acquisition: concurrent index mutation during worktree setup is a
    /// known source of git state corruption.
    pub fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<(), GitError> {
        let _g = self.guard();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let path_str = path.to_string_lossy();
        self.exec_ok(&["worktree", "add", "-b", branch, &path_str, base])
            .map(|_| ())
    }

    /// Remove a worktree. With `force`, falls back to deleting the directory
    /// and pruning metadata when git refuses.
    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<(), GitError> {
        let _g = self.guard();
        let path_str = path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        let out = self.exec(&args)?;
        if out.ok() {
            return Ok(());
        }
        if !force {
            return Err(GitError::CommandFailed {
                args: args.join(" "),
                stderr: first_lines(&out.stderr, 2),
            });
        }
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        self.exec(&["worktree", "prune"]).map(|_| ())
    }

    pub fn worktree_prune(&self) -> Result<(), GitError> {
        let _g = self.guard();
        self.exec_ok(&["worktree", "prune"]).map(|_| ())
    }

    // ── Index health ──────────────────────────────────────────────────────────

    /// Inspect the main-repo index for unfinished merge/rebase state.
    pub fn index_health(&self) -> Result<IndexHealth, GitError> {
        let _g = self.guard();
        let out = self.exec_ok(&["rev-parse", "--git-dir"])?;
        let git_dir = {
            let p = PathBuf::from(out.stdout.trim());
            if p.is_absolute() {
                p
            } else {
                self.root.join(p)
            }
        };

        if git_dir.join("MERGE_HEAD").exists() {
            return Ok(IndexHealth::MergeHeadPresent);
        }
        if git_dir.join("rebase-merge").exists() || git_dir.join("rebase-apply").exists() {
            return Ok(IndexHealth::RebaseInProgress);
        }
        if self.status_unlocked()?.entries.iter().any(StatusEntry::is_unmerged) {
            return Ok(IndexHealth::UnmergedEntries);
        }
        Ok(IndexHealth::Clean)
    }

    // ── Index flags, moves, commits ───────────────────────────────────────────

    /// Toggle the assume-unchanged flag, suppressing mtime-based change
    /// detection for `path`. Failure (e.g. the path is not tracked yet) is
    /// logged and tolerated: the flag is an optimization, not a correctness
    /// requirement.
    pub fn assume_unchanged(&self, path: &str, on: bool) -> Result<(), GitError> {
        let _g = self.guard();
        let flag = if on {
            "--assume-unchanged"
        } else {
            "--no-assume-unchanged"
        };
        let out = self.exec(&["update-index", flag, "--", path])?;
        if !out.ok() {
            warn!(
                "update-index {flag} {path} failed: {}",
                first_lines(&out.stderr, 1)
            );
        }
        Ok(())
    }

    /// Move a file: tracked rename when `under_vc`, plain filesystem move
    /// plus `git add` of the destination otherwise.
    pub fn mv(&self, src: &Path, dst: &Path, under_vc: bool) -> Result<(), GitError> {
        let _g = self.guard();
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if under_vc {
            let src_s = src.to_string_lossy();
            let dst_s = dst.to_string_lossy();
            self.exec_ok(&["mv", &src_s, &dst_s]).map(|_| ())
        } else {
            std::fs::rename(src, dst)?;
            let dst_s = dst.to_string_lossy();
            self.exec_ok(&["add", "--", &dst_s]).map(|_| ())
        }
    }

    /// True if `path` is tracked in the main repo.
    pub fn is_tracked(&self, path: &Path) -> Result<bool, GitError> {
        let _g = self.guard();
        let p = path.to_string_lossy();
        let out = self.exec(&["ls-files", "--error-unmatch", "--", &p])?;
        Ok(out.ok())
    }

    /// Stage a removal of `path`.
    pub fn rm(&self, path: &Path) -> Result<(), GitError> {
        let _g = self.guard();
        let p = path.to_string_lossy();
        self.exec_ok(&["rm", "-q", "--", &p]).map(|_| ())
    }

    /// Stage `paths` and commit them with `message`.
    pub fn commit(&self, paths: &[String], message: &str) -> Result<CommitHash, GitError> {
        let _g = self.guard();
        let mut add_args: Vec<&str> = vec!["add", "--"];
        for p in paths {
            add_args.push(p);
        }
        self.exec_ok(&add_args)?;

        let mut commit_args: Vec<&str> = vec!["commit", "-m", message, "--"];
        for p in paths {
            commit_args.push(p);
        }
        self.exec_ok(&commit_args)?;

        let out = self.exec_ok(&["rev-parse", "HEAD"])?;
        Ok(CommitHash(out.stdout.trim().to_string()))
    }

    /// Commit everything currently staged (no pathspec).
    pub fn commit_staged(&self, message: &str) -> Result<CommitHash, GitError> {
        let _g = self.guard();
        self.exec_ok(&["commit", "-m", message])?;
        let out = self.exec_ok(&["rev-parse", "HEAD"])?;
        Ok(CommitHash(out.stdout.trim().to_string()))
    }

    /// Commit tracked changes limited to `paths`, without re-staging.
    /// Covers staged renames whose old side no longer exists on disk.
    pub fn commit_pathspec(&self, paths: &[String], message: &str) -> Result<CommitHash, GitError> {
        let _g = self.guard();
        let mut args: Vec<&str> = vec!["commit", "-m", message, "--"];
        for p in paths {
            args.push(p);
        }
        self.exec_ok(&args)?;
        let out = self.exec_ok(&["rev-parse", "HEAD"])?;
        Ok(CommitHash(out.stdout.trim().to_string()))
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// True if a remote with this name is configured.
    pub fn has_remote(&self, name: &str) -> Result<bool, GitError> {
        let out = self.exec(&["remote", "get-url", name])?;
        Ok(out.ok())
    }

    pub fn head_commit(&self) -> Result<CommitHash, GitError> {
        let out = self.exec_ok(&["rev-parse", "HEAD"])?;
        Ok(CommitHash(out.stdout.trim().to_string()))
    }

    pub fn rev_parse(&self, reference: &str) -> Result<Option<CommitHash>, GitError> {
        let out = self.exec(&["rev-parse", "--verify", "--quiet", reference])?;
        if out.ok() {
            Ok(Some(CommitHash(out.stdout.trim().to_string())))
        } else {
            Ok(None)
        }
    }

    /// True if `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        let out = self.exec(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        Ok(out.ok())
    }

    /// Committed file changes in `dir` between `base` and its HEAD.
    pub fn changed_files_in(&self, dir: &Path, base: &str) -> Result<Vec<String>, GitError> {
        let range = format!("{base}..HEAD");
        let out = self.exec_ok_in(dir, &["diff", "--name-only", &range])?;
        Ok(out
            .stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    // ── Cleanup ───────────────────────────────────────────────────────────────

    /// Remove leaked paths from the main working tree: tracked files are
    /// restored from HEAD, untracked files are deleted.
    pub fn clean_paths(&self, paths: &[String]) -> Result<(), GitError> {
        let _g = self.guard();
        for path in paths {
            let tracked = self
                .exec(&["ls-files", "--error-unmatch", "--", path])
                .map(|o| o.ok())
                .unwrap_or(false);
            if tracked {
                let out = self.exec(&["checkout", "-q", "--", path])?;
                if !out.ok() {
                    warn!("could not restore leaked path {path}: {}", first_lines(&out.stderr, 1));
                }
                continue;
            }
            let abs = self.root.join(path);
            let removed = if abs.is_dir() {
                std::fs::remove_dir_all(&abs)
            } else {
                std::fs::remove_file(&abs)
            };
            if let Err(e) = removed {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("could not remove leaked path {path}: {e}");
                }
            }
        }
        Ok(())
    }
}

// ── Parsing helpers ───────────────────────────────────────────────────────────

fn read_all(stream: Option<impl Read>) -> String {
    let mut buf = String::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_string(&mut buf);
    }
    buf
}

fn first_lines(s: &str, n: usize) -> String {
    s.lines()
        .filter(|l| !l.trim().is_empty())
        .take(n)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parse `git status --porcelain` (v1) output.
fn parse_porcelain(out: &str) -> StatusReport {
    let mut report = StatusReport::default();
    for line in out.lines() {
        if line.len() < 4 {
            continue;
        }
        let index_state = line.as_bytes()[0] as char;
        let worktree_state = line.as_bytes()[1] as char;
        let rest = &line[3..];
        if index_state == '?' {
            report.untracked.insert(rest.trim_end_matches('/').to_string());
            continue;
        }
        let (orig_path, path) = match rest.split_once(" -> ") {
            Some((old, new)) => (Some(old.to_string()), new.to_string()),
            None => (None, rest.to_string()),
        };
        report.entries.push(StatusEntry {
            index_state,
            worktree_state,
            path,
            orig_path,
        });
    }
    report
}

/// Extract the path list from a "would be overwritten by merge" error.
fn parse_overwrite_paths(stderr: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut in_list = false;
    for line in stderr.lines() {
        if line.contains("would be overwritten by merge") {
            in_list = true;
            continue;
        }
        if in_list {
            let trimmed = line.trim();
            if trimmed.is_empty()
                || trimmed.starts_with("Please")
                || trimmed.starts_with("Aborting")
                || trimmed.starts_with("Merge with strategy")
            {
                in_list = false;
                continue;
            }
            if line.starts_with('\t') || line.starts_with("  ") {
                paths.push(trimmed.to_string());
            }
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_repo() -> (TempDir, GitRepo) {
        let dir = TempDir::new().unwrap();
        let repo = GitRepo::new(dir.path(), new_repo_lock(), Duration::from_secs(30));
        run(dir.path(), &["init", "-q", "-b", "main"]);
        run(dir.path(), &["config", "user.email", "test@example.com"]);
        run(dir.path(), &["config", "user.name", "test"]);
        fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        run(dir.path(), &["add", "."]);
        run(dir.path(), &["commit", "-q", "-m", "init"]);
        (dir, repo)
    }

    fn run(cwd: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    // ── Porcelain parsing (pure) ─────────────────────────────────────────────

    #[test]
    fn porcelain_parses_modified_untracked_and_renamed() {
        let out = " M src/a.rs\nR  old.md -> new.md\n?? scratch.txt\nUU conflicted.rs\n";
        let report = parse_porcelain(out);
        assert_eq!(report.entries.len(), 3);
        assert_eq!(report.entries[0].path, "src/a.rs");
        assert_eq!(report.entries[1].orig_path.as_deref(), Some("old.md"));
        assert_eq!(report.entries[1].path, "new.md");
        assert!(report.untracked.contains("scratch.txt"));
        assert!(report.entries[2].is_unmerged());
    }

    #[test]
    fn overwrite_paths_parsed_from_merge_error() {
        let stderr = "error: The following untracked working tree files would be overwritten by merge:\n\tbuild/out.bin\n\tbuild/other.bin\nPlease move or remove them before you merge.\nAborting\n";
        let paths = parse_overwrite_paths(stderr);
        assert_eq!(paths, vec!["build/out.bin", "build/other.bin"]);
    }

    // ── Against a real repository ────────────────────────────────────────────

    #[test]
    fn status_reports_clean_and_dirty() {
        let (dir, repo) = test_repo();
        assert!(repo.status().unwrap().is_clean());

        fs::write(dir.path().join("README.md"), "changed\n").unwrap();
        fs::write(dir.path().join("new.txt"), "x\n").unwrap();
        let report = repo.status().unwrap();
        assert_eq!(report.entries.len(), 1);
        assert!(report.untracked.contains("new.txt"));
    }

    #[test]
    fn stash_respects_exclusions_and_pops_clean() {
        let (dir, repo) = test_repo();
        fs::write(dir.path().join("README.md"), "edited\n").unwrap();
        fs::write(dir.path().join("keep.md"), "k\n").unwrap();
        run(dir.path(), &["add", "keep.md"]);
        run(dir.path(), &["commit", "-q", "-m", "keep"]);
        fs::write(dir.path().join("keep.md"), "edited too\n").unwrap();

        let handle = repo
            .stash(false, &|p| p == "keep.md")
            .unwrap()
            .expect("stash taken");

        // keep.md stayed dirty, README.md was stashed.
        let report = repo.status().unwrap();
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].path, "keep.md");

        assert_eq!(repo.pop_stash(&handle).unwrap(), PopOutcome::Clean);
        assert_eq!(
            fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "edited\n"
        );
    }

    #[test]
    fn stash_nothing_returns_none() {
        let (_dir, repo) = test_repo();
        assert!(repo.stash(false, &|_| false).unwrap().is_none());
    }

    #[test]
    fn pop_missing_stash_reports_missing() {
        let (_dir, repo) = test_repo();
        let handle = StashHandle {
            marker: "drover-stash-nope".to_string(),
        };
        assert_eq!(repo.pop_stash(&handle).unwrap(), PopOutcome::Missing);
    }

    #[test]
    fn worktree_add_and_remove_roundtrip() {
        let (dir, repo) = test_repo();
        let wt = dir.path().join("wt").join("worker-x");
        repo.worktree_add(&wt, "parallel/test-x", "main").unwrap();
        assert!(wt.join("README.md").exists());
        repo.worktree_remove(&wt, true).unwrap();
        assert!(!wt.exists());
    }

    #[test]
    fn merge_fast_forwards_worker_branch() {
        let (dir, repo) = test_repo();
        let wt = dir.path().join("wt");
        repo.worktree_add(&wt, "parallel/ff", "main").unwrap();
        fs::write(wt.join("feature.txt"), "f\n").unwrap();
        run(&wt, &["add", "."]);
        run(&wt, &["commit", "-q", "-m", "feature"]);

        let outcome = repo.merge_branch("parallel/ff").unwrap();
        assert_eq!(outcome, MergeBranchOutcome::FastForwarded);
        assert!(dir.path().join("feature.txt").exists());
    }

    #[test]
    fn merge_reports_untracked_overwrite() {
        let (dir, repo) = test_repo();
        let wt = dir.path().join("wt");
        repo.worktree_add(&wt, "parallel/clobber", "main").unwrap();
        fs::write(wt.join("out.bin"), "committed\n").unwrap();
        run(&wt, &["add", "."]);
        run(&wt, &["commit", "-q", "-m", "adds out.bin"]);

        // Same path exists untracked in the main repo.
        fs::write(dir.path().join("out.bin"), "local\n").unwrap();
        match repo.merge_branch("parallel/clobber").unwrap() {
            MergeBranchOutcome::UntrackedWouldBeOverwritten(paths) => {
                assert_eq!(paths, vec!["out.bin"]);
            }
            other => panic!("expected untracked-overwrite, got {other:?}"),
        }
    }

    #[test]
    fn merge_conflict_detected_and_aborted() {
        let (dir, repo) = test_repo();
        let wt = dir.path().join("wt");
        repo.worktree_add(&wt, "parallel/conflict", "main").unwrap();
        fs::write(wt.join("README.md"), "worker side\n").unwrap();
        run(&wt, &["add", "."]);
        run(&wt, &["commit", "-q", "-m", "worker edit"]);

        fs::write(dir.path().join("README.md"), "main side\n").unwrap();
        run(dir.path(), &["add", "."]);
        run(dir.path(), &["commit", "-q", "-m", "main edit"]);

        assert_eq!(
            repo.merge_branch("parallel/conflict").unwrap(),
            MergeBranchOutcome::Conflicted
        );
        assert_eq!(repo.index_health().unwrap(), IndexHealth::MergeHeadPresent);
        repo.merge_abort().unwrap();
        assert_eq!(repo.index_health().unwrap(), IndexHealth::Clean);
    }

    #[test]
    fn mv_tracked_stages_rename() {
        let (dir, repo) = test_repo();
        let src = dir.path().join("README.md");
        let dst = dir.path().join("docs").join("README.md");
        repo.mv(&src, &dst, true).unwrap();
        let report = repo.status().unwrap();
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].index_state, 'R');
    }

    #[test]
    fn mv_untracked_falls_back_to_rename_plus_add() {
        let (dir, repo) = test_repo();
        fs::write(dir.path().join("loose.md"), "l\n").unwrap();
        let src = dir.path().join("loose.md");
        let dst = dir.path().join("kept").join("loose.md");
        repo.mv(&src, &dst, false).unwrap();
        assert!(!src.exists());
        assert!(dst.exists());
        let report = repo.status().unwrap();
        assert!(report.entries.iter().any(|e| e.path == "kept/loose.md"));
    }

    #[test]
    fn commit_returns_head_hash() {
        let (dir, repo) = test_repo();
        fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        let hash = repo
            .commit(&["a.txt".to_string()], "add a")
            .unwrap();
        assert_eq!(hash.0.len(), 40);
        assert_eq!(repo.head_commit().unwrap(), hash);
    }

    #[test]
    fn changed_files_lists_committed_worktree_work() {
        let (dir, repo) = test_repo();
        let base = repo.head_commit().unwrap();
        let wt = dir.path().join("wt");
        repo.worktree_add(&wt, "parallel/diff", "main").unwrap();
        fs::write(wt.join("src.rs"), "fn main() {}\n").unwrap();
        run(&wt, &["add", "."]);
        run(&wt, &["commit", "-q", "-m", "work"]);

        let changed = repo.changed_files_in(&wt, &base.0).unwrap();
        assert_eq!(changed, vec!["src.rs"]);
    }

    #[test]
    fn clean_paths_removes_untracked_and_restores_tracked() {
        let (dir, repo) = test_repo();
        fs::write(dir.path().join("README.md"), "dirty\n").unwrap();
        fs::write(dir.path().join("leak.txt"), "leak\n").unwrap();
        repo.clean_paths(&["README.md".to_string(), "leak.txt".to_string()])
            .unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "hello\n"
        );
        assert!(!dir.path().join("leak.txt").exists());
    }
}
