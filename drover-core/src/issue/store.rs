//! Issue store: discovery, classification, and lifecycle moves.
//!
//! The store owns every issue file across its whole lifecycle. Reading is
//! tolerant — an unreadable file produces a warning and a partial record,
//! never a discovery failure. Moves are the only mutations, and they go
//! through the repo-ops adapter so renames stay visible to git.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use thiserror::Error;

use crate::config::CategorySpec;
use crate::git::{GitError, GitRepo};

use super::front_matter::{extract_blocked_by, extract_title, split_document, FrontMatter};
use super::naming::parse_file_name;
use super::{Issue, IssueStatus, DEFAULT_PRIORITY};

pub const COMPLETED_DIR: &str = "completed";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The destination of a lifecycle move already exists with different
    /// content. The move is aborted; the run continues.
    #[error("destination already exists with different content: {src} vs {dst}")]
    DestinationConflict { src: PathBuf, dst: PathBuf },
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("i/o error in issue store: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything discovery found in one scan.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Issues still in their category directories.
    pub open: Vec<Issue>,
    /// Issues already under `completed/`.
    pub completed: Vec<Issue>,
    /// Human-readable notes about files that could not be fully read.
    pub warnings: Vec<String>,
}

/// Filesystem-backed issue store rooted at the issues directory.
pub struct IssueStore {
    issues_root: PathBuf,
    categories: Vec<CategorySpec>,
}

impl IssueStore {
    pub fn new(issues_root: &Path, categories: Vec<CategorySpec>) -> Self {
        Self {
            issues_root: issues_root.to_path_buf(),
            categories,
        }
    }

    pub fn issues_root(&self) -> &Path {
        &self.issues_root
    }

    pub fn completed_dir(&self) -> PathBuf {
        self.issues_root.join(COMPLETED_DIR)
    }

    // ── Discovery ─────────────────────────────────────────────────────────────

    /// Scan the issues root, its category subdirectories, and `completed/`.
    ///
    /// Unknown directories are ignored. Files outside the naming grammar are
    /// ignored. Unreadable files yield a warning plus a partial record.
    pub fn discover(&self) -> Discovery {
        let mut discovery = Discovery::default();
        if !self.issues_root.exists() {
            return discovery;
        }

        // Files sitting directly in the root.
        self.scan_dir(&self.issues_root, None, IssueStatus::Open, &mut discovery);

        for category in &self.categories {
            let dir = self.issues_root.join(&category.dir);
            if dir.is_dir() {
                self.scan_dir(&dir, Some(&category.prefix), IssueStatus::Open, &mut discovery);
            }
        }

        let completed = self.completed_dir();
        if completed.is_dir() {
            self.scan_dir(&completed, None, IssueStatus::Completed, &mut discovery);
        }

        discovery.open.sort_by(|a, b| a.id.cmp(&b.id));
        discovery.completed.sort_by(|a, b| a.id.cmp(&b.id));
        discovery
    }

    fn scan_dir(
        &self,
        dir: &Path,
        category_hint: Option<&str>,
        status: IssueStatus,
        discovery: &mut Discovery,
    ) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot read {}: {e}", dir.display());
                discovery
                    .warnings
                    .push(format!("cannot read {}: {e}", dir.display()));
                return;
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        for path in paths {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            let Some(parsed) = parse_file_name(name) else {
                continue;
            };

            // Classification: directory wins, filename prefix otherwise.
            let prefix = category_hint.unwrap_or(&parsed.prefix);
            if self.categories.iter().all(|c| c.prefix != prefix) {
                discovery.warnings.push(format!(
                    "{}: unknown category prefix {prefix}, skipped",
                    path.display()
                ));
                continue;
            }

            let issue = self.read_issue(&path, &parsed, prefix, status);
            if let Some(w) = &issue.parse_warning {
                discovery.warnings.push(format!("{}: {w}", path.display()));
            }
            match status {
                IssueStatus::Completed => discovery.completed.push(issue),
                _ => discovery.open.push(issue),
            }
        }
    }

    fn read_issue(
        &self,
        path: &Path,
        parsed: &super::ParsedName,
        prefix: &str,
        status: IssueStatus,
    ) -> Issue {
        let mut issue = Issue {
            id: parsed.id(),
            category: prefix.to_string(),
            priority: parsed.priority.unwrap_or(DEFAULT_PRIORITY),
            path: path.to_path_buf(),
            title: parsed.slug.replace('-', " "),
            status,
            depends_on: vec![],
            front_matter: None,
            parse_warning: None,
        };

        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("unreadable issue file {}: {e}", path.display());
                issue.parse_warning = Some(format!("unreadable: {e}"));
                return issue;
            }
        };

        let (fm_block, body) = split_document(&content);
        if let Some(block) = fm_block {
            match FrontMatter::parse(block) {
                Ok(fm) => {
                    // Priority: filename wins over front matter.
                    if parsed.priority.is_none() {
                        if let Some(p) = fm.priority() {
                            issue.priority = p;
                        }
                    }
                    issue.front_matter = Some(fm);
                }
                Err(e) => {
                    warn!("bad front matter in {}: {e:#}", path.display());
                    issue.parse_warning = Some(format!("bad front matter: {e:#}"));
                }
            }
        }
        if let Some(title) = extract_title(body) {
            issue.title = title;
        }
        issue.depends_on = extract_blocked_by(body);
        issue
    }

    // ── Lifecycle moves ───────────────────────────────────────────────────────

    /// Move a merged issue into `completed/` and stage the rename. The
    /// commit happens later (merge coordinator or end-of-run).
    pub fn complete(&self, issue: &Issue, git: &GitRepo) -> Result<PathBuf, StoreError> {
        self.relocate(issue, git)
    }

    /// Move an invalid issue into `completed/` and commit immediately with a
    /// message tagged "closed invalid".
    pub fn close_invalid(&self, issue: &Issue, git: &GitRepo) -> Result<PathBuf, StoreError> {
        let dst = self.relocate(issue, git)?;
        let message = format!("lifecycle: {} closed invalid", issue.id);
        let root = self.issues_root.to_string_lossy().into_owned();
        git.commit_pathspec(&[root], &message)?;
        Ok(dst)
    }

    /// The shared move: destination-exists policy, then tracked rename or
    /// filesystem move + add.
    fn relocate(&self, issue: &Issue, git: &GitRepo) -> Result<PathBuf, StoreError> {
        let src = &issue.path;
        let dst = self.completed_dir().join(issue.file_name());

        if dst.exists() {
            let src_bytes = fs::read(src)?;
            let dst_bytes = fs::read(&dst)?;
            if src_bytes == dst_bytes {
                // Identical copy already completed: drop the source.
                if git.is_tracked(src)? {
                    git.rm(src)?;
                } else {
                    fs::remove_file(src)?;
                }
                return Ok(dst);
            }
            return Err(StoreError::DestinationConflict {
                src: src.clone(),
                dst,
            });
        }

        fs::create_dir_all(self.completed_dir())?;
        let tracked = git.is_tracked(src)?;
        git.mv(src, &dst, tracked)?;
        Ok(dst)
    }
}
