//! Issue domain model.
//!
//! Domain model:
//!   - `IssueStatus`    — lifecycle states, directory-backed where noted
//!   - `Issue`          — one task description file plus parsed attributes
//!   - `naming`         — the filename grammar (single regex) and slugs
//!   - `front_matter`   — YAML front matter round trip + section parsing
//!   - `store`          — discovery, classification, lifecycle moves

pub mod front_matter;
pub mod naming;
pub mod store;

pub use front_matter::FrontMatter;
pub use naming::{parse_file_name, slugify, ParsedName};
pub use store::{Discovery, IssueStore, StoreError};

use std::path::PathBuf;

/// Default priority when neither the filename nor the front matter names one.
pub const DEFAULT_PRIORITY: u8 = 2;

/// Lifecycle state of an issue.
///
/// `Open → InProgress → Merged` are in-memory transitions; `Completed` and
/// `ClosedInvalid` correspond to the file living under `completed/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueStatus {
    Open,
    InProgress,
    Merged,
    Completed,
    ClosedInvalid,
    Failed,
}

impl IssueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Merged => "merged",
            IssueStatus::Completed => "completed",
            IssueStatus::ClosedInvalid => "closed_invalid",
            IssueStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work: a task description file plus its parsed attributes.
#[derive(Debug, Clone)]
pub struct Issue {
    /// Unique ID across all categories, e.g. `BUG-419`.
    pub id: String,
    /// Category prefix, e.g. `BUG`.
    pub category: String,
    /// Ordinal priority; lower is more urgent. P0 is critical.
    pub priority: u8,
    /// Absolute path of the description file.
    pub path: PathBuf,
    /// Title from the H1, or the slug when no heading was readable.
    pub title: String,
    pub status: IssueStatus,
    /// IDs this issue is blocked by.
    pub depends_on: Vec<String>,
    /// Front matter, when present and parseable.
    pub front_matter: Option<FrontMatter>,
    /// Set when the file could not be fully read or parsed; discovery still
    /// yields a partial record.
    pub parse_warning: Option<String>,
}

impl Issue {
    /// Lowercased ID for branch and directory names, e.g. `bug-419`.
    pub fn id_slug(&self) -> String {
        slugify(&self.id)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
