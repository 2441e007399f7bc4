//! Typed outcomes for every repo-ops call.
//!
//! Each mutating operation reports an exhaustive enum; callers match every
//! variant. Raw git exit codes and stderr never leak past this module except
//! inside `GitError::CommandFailed`.

use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;

/// Errors from the repo-ops adapter.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git executable not found or not runnable")]
    NotAvailable,
    #[error("git {args} timed out after {secs}s")]
    TimedOut { args: String, secs: u64 },
    #[error("git {args} failed: {stderr}")]
    CommandFailed { args: String, stderr: String },
    #[error("i/o error during git operation: {0}")]
    Io(#[from] std::io::Error),
}

/// One path from `git status --porcelain`, with both the index and the
/// working-tree state characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub index_state: char,
    pub worktree_state: char,
    pub path: String,
    /// Original path for renames (`R old -> new`).
    pub orig_path: Option<String>,
}

impl StatusEntry {
    /// True for the unmerged two-letter codes (UU, AA, DD, AU, UA, DU, UD).
    pub fn is_unmerged(&self) -> bool {
        matches!(
            (self.index_state, self.worktree_state),
            ('U', 'U') | ('A', 'A') | ('D', 'D') | ('A', 'U') | ('U', 'A') | ('D', 'U') | ('U', 'D')
        )
    }
}

/// Snapshot of the working tree: tracked entries plus untracked paths.
#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub entries: Vec<StatusEntry>,
    pub untracked: BTreeSet<String>,
}

impl StatusReport {
    pub fn is_clean(&self) -> bool {
        self.entries.is_empty() && self.untracked.is_empty()
    }

    /// Paths with tracked modifications (anything except untracked).
    pub fn tracked_paths(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.path.clone()).collect()
    }

    /// Staged renames whose destination starts with `prefix`.
    pub fn staged_renames_into(&self, prefix: &str) -> Vec<&StatusEntry> {
        self.entries
            .iter()
            .filter(|e| e.index_state == 'R' && e.path.starts_with(prefix))
            .collect()
    }
}

/// Handle to a stash entry created by [`crate::git::GitRepo::stash`].
///
/// The marker message is used to re-locate the entry in the stash list, so
/// the handle stays valid even if other stashes are pushed on top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashHandle {
    pub marker: String,
}

/// Result of popping a stash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopOutcome {
    Clean,
    /// The pop conflicted. The working tree has been restored to the
    /// pre-pop state; the stash entry is still in the stash list.
    Conflicted,
    /// The handle no longer matches any stash entry.
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStrategy {
    Rebase,
    Merge,
}

impl PullStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            PullStrategy::Rebase => "rebase",
            PullStrategy::Merge => "merge",
        }
    }
}

/// Result of pulling the integration branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    UpToDate,
    FastForwarded,
    Rebased,
    Merged,
    /// Rebase or merge stopped on conflicts. For rebase pulls the upstream
    /// commit that could not be applied is included when git names it.
    Conflicted(Option<String>),
    Failed(String),
}

/// Result of merging a worker branch into the integration branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeBranchOutcome {
    FastForwarded,
    Merged,
    NonFastForward,
    Conflicted,
    UntrackedWouldBeOverwritten(Vec<String>),
}

/// Result of rebasing a worktree onto a base ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    Success,
    Conflicted,
    Failed(String),
}

/// Health of the main-repo index, checked before every merge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexHealth {
    Clean,
    /// `MERGE_HEAD` exists — an unfinished merge.
    MergeHeadPresent,
    /// A rebase directory exists — an unfinished rebase.
    RebaseInProgress,
    /// The index holds unmerged entries.
    UnmergedEntries,
}

/// Hash of a created commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitHash(pub String);

impl std::fmt::Display for CommitHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A path moved aside before a merge retry, with its backup location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackedUpPath {
    pub original: String,
    pub backup: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmerged_codes_detected() {
        for (i, w) in [
            ('U', 'U'),
            ('A', 'A'),
            ('D', 'D'),
            ('A', 'U'),
            ('U', 'A'),
            ('D', 'U'),
            ('U', 'D'),
        ] {
            let entry = StatusEntry {
                index_state: i,
                worktree_state: w,
                path: "x".into(),
                orig_path: None,
            };
            assert!(entry.is_unmerged(), "{i}{w} must be unmerged");
        }
        let clean = StatusEntry {
            index_state: 'M',
            worktree_state: ' ',
            path: "x".into(),
            orig_path: None,
        };
        assert!(!clean.is_unmerged());
    }

    #[test]
    fn staged_renames_filtered_by_destination() {
        let report = StatusReport {
            entries: vec![
                StatusEntry {
                    index_state: 'R',
                    worktree_state: ' ',
                    path: "issues/completed/BUG-1.md".into(),
                    orig_path: Some("issues/bugs/BUG-1.md".into()),
                },
                StatusEntry {
                    index_state: 'M',
                    worktree_state: ' ',
                    path: "src/main.rs".into(),
                    orig_path: None,
                },
            ],
            untracked: BTreeSet::new(),
        };
        let renames = report.staged_renames_into("issues/completed/");
        assert_eq!(renames.len(), 1);
        assert_eq!(renames[0].orig_path.as_deref(), Some("issues/bugs/BUG-1.md"));
    }
}
