//! The end-of-run summary.
//!
//! Stash-pop failures come first with per-issue recovery instructions, then
//! the circuit-breaker block when it tripped, then per-issue status and
//! timing.

use std::path::Path;

use log::warn;

use crate::orchestrator::RunSummary;

/// Render the run summary as the user-facing report.
pub fn render(summary: &RunSummary) -> String {
    let mut out = String::new();

    if !summary.stash_pop_failures.is_empty() {
        out.push_str("!! STASH POP FAILURES — your local changes need manual recovery\n");
        for (id, msg) in &summary.stash_pop_failures {
            out.push_str(&format!(
                "   {id}: {msg}\n   {id}: run `git stash list` and pop the drover entry for {id}\n"
            ));
        }
        out.push('\n');
    }

    if summary.breaker_open {
        out.push_str("!! CIRCUIT BREAKER OPEN — merging stopped after consecutive failures:\n");
        for failure in &summary.breaker_failures {
            out.push_str(&format!("   {}: {}\n", failure.issue_id, failure.reason));
        }
        out.push_str("   Remaining merge requests were failed fast.\n\n");
    }

    out.push_str(&format!(
        "Run summary: {} merged, {} closed, {} failed, {} blocked{}\n",
        summary.merged.len(),
        summary.closed.len(),
        summary.failed.len(),
        summary.blocked.len(),
        if summary.cancelled { " (cancelled)" } else { "" },
    ));

    if !summary.merged.is_empty() {
        out.push_str("\nMerged:\n");
        for id in &summary.merged {
            out.push_str(&format!("  + {id}{}\n", timing_suffix(summary, id)));
        }
    }
    if !summary.closed.is_empty() {
        out.push_str("\nClosed as invalid:\n");
        for id in &summary.closed {
            out.push_str(&format!("  - {id}\n"));
        }
    }
    if !summary.failed.is_empty() {
        out.push_str("\nFailed:\n");
        for (id, reason) in &summary.failed {
            out.push_str(&format!("  x {id}: {reason}{}\n", timing_suffix(summary, id)));
        }
    }
    if !summary.blocked.is_empty() {
        out.push_str("\nBlocked (not processed):\n");
        for (id, reason) in &summary.blocked {
            out.push_str(&format!("  ~ {id}: {reason}\n"));
        }
    }
    if !summary.warnings.is_empty() {
        out.push_str("\nDiscovery warnings:\n");
        for w in &summary.warnings {
            out.push_str(&format!("  ! {w}\n"));
        }
    }
    out
}

fn timing_suffix(summary: &RunSummary, id: &str) -> String {
    match summary.timing.get(id) {
        Some(t) if t.end > t.start => format!(" ({:.0}s)", t.end - t.start),
        _ => String::new(),
    }
}

/// Print the report and keep a copy on disk so a cancelled terminal still
/// leaves a record.
pub fn emit(summary: &RunSummary, repo_root: &Path) {
    let text = render(summary);
    print!("{text}");
    let path = repo_root.join(".drover").join("last-run.txt");
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(&path, &text) {
        warn!("could not write {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::BreakerFailure;
    use crate::state::IssueTiming;

    fn sample() -> RunSummary {
        let mut summary = RunSummary::default();
        summary.merged = vec!["BUG-1".to_string()];
        summary
            .failed
            .insert("BUG-2".to_string(), "worker timed out (idle)".to_string());
        summary.timing.insert(
            "BUG-1".to_string(),
            IssueTiming {
                start: 10.0,
                end: 73.0,
            },
        );
        summary
    }

    #[test]
    fn per_issue_status_and_timing_listed() {
        let text = render(&sample());
        assert!(text.contains("1 merged"));
        assert!(text.contains("+ BUG-1 (63s)"));
        assert!(text.contains("x BUG-2: worker timed out (idle)"));
    }

    #[test]
    fn stash_pop_failures_lead_the_report() {
        let mut summary = sample();
        summary
            .stash_pop_failures
            .insert("BUG-1".to_string(), "pop conflicted".to_string());
        let text = render(&summary);
        let first_line = text.lines().next().unwrap();
        assert!(first_line.contains("STASH POP FAILURES"), "{first_line}");
        assert!(text.contains("git stash list"));
    }

    #[test]
    fn breaker_block_names_the_last_failures() {
        let mut summary = sample();
        summary.breaker_open = true;
        summary.breaker_failures = vec![
            BreakerFailure {
                issue_id: "BUG-3".to_string(),
                reason: "index irrecoverable".to_string(),
            },
            BreakerFailure {
                issue_id: "BUG-4".to_string(),
                reason: "merge error".to_string(),
            },
        ];
        let text = render(&summary);
        assert!(text.contains("CIRCUIT BREAKER OPEN"));
        assert!(text.contains("BUG-3: index irrecoverable"));
        assert!(text.contains("failed fast"));
    }
}
