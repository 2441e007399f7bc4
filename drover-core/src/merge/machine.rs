//! The per-request merge state machine.
//!
//! One request walks: health check → pending-lifecycle commit → stash →
//! pull (adaptive strategy) → merge branch (untracked backup, one retry;
//! conflict → rebase in the worker's worktree and requeue) → pop stash.
//! A successful merge is never undone to tidy up a pop failure.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};

use crate::config::OrchestratorConfig;
use crate::git::{
    BackedUpPath, GitRepo, IndexHealth, MergeBranchOutcome, PopOutcome, PullOutcome, PullStrategy,
    RebaseOutcome,
};

use super::{MergeDisposition, MergeReport, MergeRequest};

/// What the coordinator should do with the request next.
pub(crate) enum Verdict {
    /// Terminal: deliver the report and tear the worktree down.
    Done(MergeReport),
    /// Run the request through the machine again (attempts incremented).
    Requeue(MergeRequest),
}

/// How the pull+merge core ended.
enum Flow {
    Merged {
        commit: String,
        backups: Vec<BackedUpPath>,
    },
    /// The request needs another pass: a first-seen pull conflict, or a
    /// successful rebase of the worker branch in its worktree.
    Retry { why: String },
}

/// Mutable coordinator-thread state shared across requests.
pub(crate) struct MergeMachine {
    git: GitRepo,
    config: Arc<OrchestratorConfig>,
    /// Upstream commits that have caused a pull conflict before. Seeing one
    /// again switches that pull to merge strategy.
    problematic_commits: HashSet<String>,
    /// Issues whose stash pop conflicted; the stash entries are retained.
    pub(crate) stash_pop_failures: BTreeMap<String, String>,
}

impl MergeMachine {
    pub(crate) fn new(git: GitRepo, config: Arc<OrchestratorConfig>) -> Self {
        Self {
            git,
            config,
            problematic_commits: HashSet::new(),
            stash_pop_failures: BTreeMap::new(),
        }
    }

    pub(crate) fn process(&mut self, req: MergeRequest) -> Verdict {
        let issue_id = req.result.issue_id.clone();

        if let Err(reason) = self.ensure_healthy() {
            return Verdict::Done(MergeReport {
                issue_id,
                disposition: MergeDisposition::Failed { reason },
                stash_pop_failure: None,
            });
        }

        if let Err(reason) = self.commit_pending_lifecycle_moves() {
            return Verdict::Done(MergeReport {
                issue_id,
                disposition: MergeDisposition::Failed { reason },
                stash_pop_failure: None,
            });
        }

        // Stash local changes; whatever the core does, the pop runs before
        // the request leaves the machine.
        let stash = match self.git.stash(false, &|path| self.is_stash_excluded(path)) {
            Ok(handle) => handle,
            Err(e) => {
                return Verdict::Done(MergeReport {
                    issue_id,
                    disposition: MergeDisposition::Failed {
                        reason: format!("stash failed: {e}"),
                    },
                    stash_pop_failure: None,
                })
            }
        };

        let core = self.pull_and_merge(&req);

        let stash_pop_failure = match stash {
            Some(handle) => match self.git.pop_stash(&handle) {
                Ok(PopOutcome::Clean) => None,
                Ok(PopOutcome::Missing) => {
                    warn!("{issue_id}: stash entry vanished before pop");
                    None
                }
                Ok(PopOutcome::Conflicted) => Some(
                    "stash pop conflicted; the entry was kept in the stash list — \
                     recover with `git stash list` / `git stash pop`"
                        .to_string(),
                ),
                Err(e) => Some(format!("stash pop failed: {e}; entry kept in stash list")),
            },
            None => None,
        };
        if let Some(msg) = &stash_pop_failure {
            self.stash_pop_failures.insert(issue_id.clone(), msg.clone());
        }

        match core {
            Ok(Flow::Merged { commit, backups }) => {
                if !backups.is_empty() {
                    info!(
                        "{issue_id}: {} conflicting untracked file(s) preserved under {}",
                        backups.len(),
                        self.config.backup_root.join(&issue_id).display()
                    );
                }
                Verdict::Done(MergeReport {
                    issue_id,
                    disposition: MergeDisposition::Merged { commit, backups },
                    stash_pop_failure,
                })
            }
            Ok(Flow::Retry { why }) => {
                let attempts = req.attempts + 1;
                if attempts >= self.config.max_merge_retries {
                    Verdict::Done(MergeReport {
                        issue_id,
                        disposition: MergeDisposition::Failed {
                            reason: format!("{why}; retries exhausted ({attempts})"),
                        },
                        stash_pop_failure,
                    })
                } else {
                    info!("{issue_id}: {why}; requeueing (attempt {attempts})");
                    Verdict::Requeue(MergeRequest {
                        result: req.result,
                        attempts,
                        enqueued_at: req.enqueued_at,
                    })
                }
            }
            Err(reason) => Verdict::Done(MergeReport {
                issue_id,
                disposition: MergeDisposition::Failed { reason },
                stash_pop_failure,
            }),
        }
    }

    // ── Step 1: index health ─────────────────────────────────────────────────

    /// One recovery round; a condition that persists fails the request only.
    fn ensure_healthy(&self) -> Result<(), String> {
        let health = self
            .git
            .index_health()
            .map_err(|e| format!("index health check failed: {e}"))?;
        if health == IndexHealth::Clean {
            return Ok(());
        }

        warn!("index unhealthy ({health:?}), attempting recovery");
        match health {
            IndexHealth::Clean => {}
            IndexHealth::MergeHeadPresent => {
                let _ = self.git.merge_abort();
            }
            IndexHealth::RebaseInProgress => {
                let _ = self.git.rebase_abort();
                let _ = self.git.reset_hard_head();
            }
            IndexHealth::UnmergedEntries => {
                let _ = self.git.reset_hard_head();
            }
        }

        let rechecked = self
            .git
            .index_health()
            .map_err(|e| format!("index health recheck failed: {e}"))?;
        if rechecked == IndexHealth::Clean {
            Ok(())
        } else {
            Err(format!("index irrecoverable: {rechecked:?}"))
        }
    }

    // ── Step 2: pending lifecycle moves ──────────────────────────────────────

    /// Stash exclusions intentionally skip lifecycle renames, so one left
    /// uncommitted would block the next pull. Commit them first.
    fn commit_pending_lifecycle_moves(&self) -> Result<(), String> {
        let report = self
            .git
            .status()
            .map_err(|e| format!("status before lifecycle commit failed: {e}"))?;

        let prefixes = self.issues_prefixes();
        let staged_lifecycle = report.entries.iter().any(|e| {
            e.index_state != ' '
                && e.index_state != '?'
                && prefixes.iter().any(|pre| e.path.starts_with(pre.as_str()))
        });
        if !staged_lifecycle {
            return Ok(());
        }

        let root = self.config.issues_root.to_string_lossy().into_owned();
        self.git
            .commit_pathspec(&[root], "lifecycle: finalize completed issues")
            .map(|_| ())
            .map_err(|e| format!("lifecycle commit failed: {e}"))
    }

    // ── Step 3: stash exclusions ─────────────────────────────────────────────

    fn issues_prefixes(&self) -> Vec<String> {
        let name = self.config.issues_root_name();
        let bare = name.trim_start_matches('.');
        vec![format!("{bare}/"), format!(".{bare}/")]
    }

    fn is_stash_excluded(&self, path: &str) -> bool {
        if path == self.config.state_file_name() {
            return true;
        }
        if self
            .issues_prefixes()
            .iter()
            .any(|pre| path.starts_with(pre.as_str()))
        {
            return true;
        }
        self.config
            .stash_exclude
            .iter()
            .any(|excl| path == excl || path.starts_with(&format!("{excl}/")))
    }

    // ── Steps 4–5: pull + merge ──────────────────────────────────────────────

    fn pull_and_merge(&mut self, req: &MergeRequest) -> Result<Flow, String> {
        let state_rel = self.config.state_file_name();
        let _ = self.git.assume_unchanged(&state_rel, true);
        let pulled = self.pull_adaptive();
        let _ = self.git.assume_unchanged(&state_rel, false);

        let used_merge_strategy = match pulled? {
            Pulled::Done { used_merge } => used_merge,
            Pulled::ConflictFirstSeen { commit } => {
                return Ok(Flow::Retry {
                    why: format!("pull conflicted on new upstream commit {commit}"),
                })
            }
        };

        self.merge_worker_branch(req, used_merge_strategy)
    }

    fn pull_adaptive(&mut self) -> Result<Pulled, String> {
        let remote = self.config.remote.clone();
        let branch = self.config.main_branch.clone();

        let has_remote = self
            .git
            .has_remote(&remote)
            .map_err(|e| format!("remote lookup failed: {e}"))?;
        if !has_remote {
            return Ok(Pulled::Done { used_merge: false });
        }

        let mut strategy = PullStrategy::Rebase;
        let mut retried_lifecycle = false;
        loop {
            let outcome = self
                .git
                .pull(strategy, &remote, &branch)
                .map_err(|e| format!("pull error: {e}"))?;
            match outcome {
                PullOutcome::UpToDate
                | PullOutcome::FastForwarded
                | PullOutcome::Rebased
                | PullOutcome::Merged => {
                    return Ok(Pulled::Done {
                        used_merge: strategy == PullStrategy::Merge,
                    })
                }
                PullOutcome::Conflicted(commit) => match strategy {
                    PullStrategy::Rebase => {
                        let _ = self.git.rebase_abort();
                        match commit {
                            Some(hash) if self.problematic_commits.contains(&hash) => {
                                // Known troublemaker: never silently skip the
                                // upstream change, escalate to merge instead.
                                info!("pull conflict on known commit {hash}, switching to merge strategy");
                                strategy = PullStrategy::Merge;
                            }
                            Some(hash) => {
                                self.problematic_commits.insert(hash.clone());
                                return Ok(Pulled::ConflictFirstSeen { commit: hash });
                            }
                            None => {
                                return Err("pull conflicted on unidentified commit".to_string())
                            }
                        }
                    }
                    PullStrategy::Merge => {
                        let _ = self.git.merge_abort();
                        return Err("pull conflicted under merge strategy".to_string());
                    }
                },
                PullOutcome::Failed(reason)
                    if reason.contains("local changes") && !retried_lifecycle =>
                {
                    // An uncommitted lifecycle rename blocks the pull: commit
                    // it and retry exactly once.
                    retried_lifecycle = true;
                    self.commit_pending_lifecycle_moves()?;
                }
                PullOutcome::Failed(reason) => return Err(format!("pull failed: {reason}")),
            }
        }
    }

    fn merge_worker_branch(
        &mut self,
        req: &MergeRequest,
        pull_used_merge: bool,
    ) -> Result<Flow, String> {
        let branch = &req.result.branch_name;
        let mut backups: Vec<BackedUpPath> = Vec::new();
        let mut retried_untracked = false;

        loop {
            let outcome = self
                .git
                .merge_branch(branch)
                .map_err(|e| format!("merge error: {e}"))?;
            match outcome {
                MergeBranchOutcome::FastForwarded | MergeBranchOutcome::Merged => {
                    let commit = self
                        .git
                        .head_commit()
                        .map_err(|e| format!("merged but HEAD unreadable: {e}"))?;
                    return Ok(Flow::Merged {
                        commit: commit.0,
                        backups,
                    });
                }
                MergeBranchOutcome::UntrackedWouldBeOverwritten(paths) => {
                    if retried_untracked {
                        return Err(format!(
                            "merge still blocked by untracked files after backup: {}",
                            paths.join(", ")
                        ));
                    }
                    retried_untracked = true;
                    backups = self.backup_untracked(&req.result.issue_id, &paths)?;
                }
                MergeBranchOutcome::Conflicted => {
                    let _ = self.git.merge_abort();
                    if pull_used_merge {
                        // A rebase retry would hit the same conflicts.
                        return Err(
                            "merge conflicted after merge-strategy pull; not retrying".to_string()
                        );
                    }
                    return self.rebase_in_worktree(req);
                }
                MergeBranchOutcome::NonFastForward => {
                    return Err("merge refused: non-fast-forward".to_string())
                }
            }
        }
    }

    /// Move conflicting untracked files into `<backup_root>/<issue>/…`,
    /// preserving relative paths.
    fn backup_untracked(
        &self,
        issue_id: &str,
        paths: &[String],
    ) -> Result<Vec<BackedUpPath>, String> {
        let mut backups = Vec::new();
        for rel in paths {
            let src = self.config.repo_root.join(rel);
            let dst = self.config.backup_root.join(issue_id).join(rel);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("backup dir for {rel} failed: {e}"))?;
            }
            std::fs::rename(&src, &dst).map_err(|e| format!("backup of {rel} failed: {e}"))?;
            backups.push(BackedUpPath {
                original: rel.clone(),
                backup: dst,
            });
        }
        Ok(backups)
    }

    /// Rebase the worker branch onto latest main inside its own worktree,
    /// then requeue for another merge pass.
    fn rebase_in_worktree(&self, req: &MergeRequest) -> Result<Flow, String> {
        let worktree: &PathBuf = &req.result.worktree_path;
        if !worktree.exists() {
            return Err("merge conflicted and the worker worktree is gone".to_string());
        }

        let remote = &self.config.remote;
        let main = &self.config.main_branch;
        let remote_ref = format!("{remote}/{main}");
        if let Err(e) = self.git.fetch_in(worktree, remote, main) {
            warn!("fetch before worktree rebase failed (using local {main}): {e}");
        }
        let base = match self.git.rev_parse(&remote_ref) {
            Ok(Some(_)) => remote_ref,
            _ => main.clone(),
        };

        match self.git.rebase_in(worktree, &base) {
            Ok(RebaseOutcome::Success) => Ok(Flow::Retry {
                why: format!("worker branch rebased onto {base} after merge conflict"),
            }),
            Ok(RebaseOutcome::Conflicted) => {
                let _ = self.git.rebase_abort_in(worktree);
                Err("rebase in worktree conflicted".to_string())
            }
            Ok(RebaseOutcome::Failed(reason)) => {
                let _ = self.git.rebase_abort_in(worktree);
                Err(format!("rebase in worktree failed: {reason}"))
            }
            Err(e) => {
                let _ = self.git.rebase_abort_in(worktree);
                Err(format!("rebase in worktree errored: {e}"))
            }
        }
    }

    /// Snapshot of the learned problematic commits (copy-on-read).
    #[cfg(test)]
    pub(crate) fn problematic_commits(&self) -> HashSet<String> {
        self.problematic_commits.clone()
    }
}

enum Pulled {
    Done { used_merge: bool },
    ConflictFirstSeen { commit: String },
}
