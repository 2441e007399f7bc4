//! Durable processing state, enabling `--resume`.
//!
//! Writes are atomic (temp file + rename in the same directory), so readers
//! always see either the old complete file or the new complete file. The
//! orchestrator is the sole writer.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as IoWrite;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: u32 = 1;

/// Wall-clock span of one issue, in seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueTiming {
    pub start: f64,
    pub end: f64,
}

/// Crash-tolerant record of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingState {
    pub schema_version: u32,
    /// Successfully integrated issues, in completion order.
    pub completed_issues: Vec<String>,
    /// Failed issues with human-readable reasons.
    pub failed_issues: BTreeMap<String, String>,
    /// Issues dispatched but not yet settled.
    pub in_progress: Vec<String>,
    pub phase_by_issue: BTreeMap<String, String>,
    pub timing_by_issue: BTreeMap<String, IssueTiming>,
    pub stash_pop_failures: BTreeMap<String, String>,
}

impl Default for ProcessingState {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            completed_issues: Vec::new(),
            failed_issues: BTreeMap::new(),
            in_progress: Vec::new(),
            phase_by_issue: BTreeMap::new(),
            timing_by_issue: BTreeMap::new(),
            stash_pop_failures: BTreeMap::new(),
        }
    }
}

impl ProcessingState {
    /// Load state from `path`; absent file yields `None`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let state: Self = serde_json::from_str(&content)
            .with_context(|| format!("corrupt state file {}", path.display()))?;
        Ok(Some(state))
    }

    /// Persist atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("state not serializable")?;
        atomic_write(path, &content)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    // ── Transitions ───────────────────────────────────────────────────────────

    pub fn mark_started(&mut self, id: &str, now_epoch: f64) {
        if !self.in_progress.iter().any(|i| i == id) {
            self.in_progress.push(id.to_string());
        }
        self.phase_by_issue.insert(id.to_string(), "worker".to_string());
        self.timing_by_issue
            .entry(id.to_string())
            .or_default()
            .start = now_epoch;
    }

    pub fn set_phase(&mut self, id: &str, phase: &str) {
        self.phase_by_issue.insert(id.to_string(), phase.to_string());
    }

    pub fn mark_completed(&mut self, id: &str, now_epoch: f64) {
        self.in_progress.retain(|i| i != id);
        self.failed_issues.remove(id);
        if !self.completed_issues.iter().any(|i| i == id) {
            self.completed_issues.push(id.to_string());
        }
        self.phase_by_issue.remove(id);
        self.timing_by_issue.entry(id.to_string()).or_default().end = now_epoch;
    }

    pub fn mark_failed(&mut self, id: &str, reason: &str, now_epoch: f64) {
        self.in_progress.retain(|i| i != id);
        self.completed_issues.retain(|i| i != id);
        self.failed_issues.insert(id.to_string(), reason.to_string());
        self.phase_by_issue.remove(id);
        self.timing_by_issue.entry(id.to_string()).or_default().end = now_epoch;
    }

    pub fn record_stash_pop_failure(&mut self, id: &str, message: &str) {
        self.stash_pop_failures
            .insert(id.to_string(), message.to_string());
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.completed_issues.iter().any(|i| i == id)
    }

    // ── Resume ────────────────────────────────────────────────────────────────

    /// Reconcile a loaded state for a resume run. Inconsistencies resolve
    /// toward "retry":
    ///   - an id in both `completed_issues` and `in_progress` is retried;
    ///   - everything left in `in_progress` (interrupted work) is retried;
    ///   - failed issues stay in `failed_issues` and are retried by the
    ///     discovery filter (failures never block re-enqueueing).
    ///
    /// Returns the ids that will be retried.
    pub fn reconcile_for_resume(&mut self) -> Vec<String> {
        let mut retry: Vec<String> = Vec::new();
        let interrupted: Vec<String> = self.in_progress.drain(..).collect();
        for id in interrupted {
            self.completed_issues.retain(|i| i != &id);
            self.phase_by_issue.remove(&id);
            retry.push(id);
        }
        retry.extend(self.failed_issues.keys().cloned());
        retry.sort();
        retry.dedup();
        retry
    }
}

/// Write `content` to `path` atomically using a temp file + rename.
///
/// The temp file lives in the same directory so the rename stays on one
/// filesystem.
fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut f = fs::File::create(&tmp)?;
    f.write_all(content.as_bytes())?;
    f.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        assert!(ProcessingState::load(&dir.path().join("state.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let mut state = ProcessingState::default();
        state.mark_started("BUG-1", 1.0);
        state.mark_completed("BUG-1", 2.0);
        state.mark_started("BUG-2", 2.5);
        state.mark_failed("BUG-2", "worker timed out", 3.0);
        state.record_stash_pop_failure("BUG-1", "stash kept in list");
        state.save(&path).unwrap();

        let loaded = ProcessingState::load(&path).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn corrupt_state_is_an_error_not_a_panic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(ProcessingState::load(&path).is_err());
    }

    #[test]
    fn completed_and_failed_are_mutually_exclusive() {
        let mut state = ProcessingState::default();
        state.mark_started("BUG-1", 1.0);
        state.mark_completed("BUG-1", 2.0);
        state.mark_failed("BUG-1", "later failure", 3.0);
        assert!(!state.is_completed("BUG-1"));
        assert!(state.failed_issues.contains_key("BUG-1"));

        state.mark_completed("BUG-1", 4.0);
        assert!(state.is_completed("BUG-1"));
        assert!(!state.failed_issues.contains_key("BUG-1"));
    }

    #[test]
    fn mark_completed_clears_in_progress() {
        let mut state = ProcessingState::default();
        state.mark_started("BUG-1", 1.0);
        assert_eq!(state.in_progress, vec!["BUG-1"]);
        state.mark_completed("BUG-1", 2.0);
        assert!(state.in_progress.is_empty());
        let timing = state.timing_by_issue["BUG-1"];
        assert_eq!(timing.start, 1.0);
        assert_eq!(timing.end, 2.0);
    }

    #[test]
    fn resume_retries_interrupted_and_inconsistent_ids() {
        let mut state = ProcessingState::default();
        state.completed_issues = vec!["BUG-1".to_string(), "BUG-2".to_string()];
        state.in_progress = vec!["BUG-2".to_string(), "BUG-3".to_string()];
        state
            .failed_issues
            .insert("BUG-4".to_string(), "unparseable".to_string());

        let retry = state.reconcile_for_resume();
        assert_eq!(retry, vec!["BUG-2", "BUG-3", "BUG-4"]);
        // BUG-2 was inconsistent: retried, no longer completed.
        assert_eq!(state.completed_issues, vec!["BUG-1"]);
        assert!(state.in_progress.is_empty());
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        ProcessingState::default().save(&path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
