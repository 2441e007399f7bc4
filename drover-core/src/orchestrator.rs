//! Top-level scheduler: discover → enqueue → dispatch → route results →
//! lifecycle → persist → report.
//!
//! The orchestrator owns the shared repo lock and the processing state; it
//! is the only writer of the state file. Workers and the merge coordinator
//! communicate with it over channels only.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use log::{info, warn};

use crate::config::OrchestratorConfig;
use crate::git::{new_repo_lock, GitRepo};
use crate::issue::{Issue, IssueStore, StoreError};
use crate::merge::{
    BreakerFailure, MergeCoordinator, MergeDisposition, MergeReport,
};
use crate::pool::{WorkerPool, WorkerResult};
use crate::queue::{IssueQueue, QueueError};
use crate::state::{IssueTiming, ProcessingState};

const DISPATCH_POLL: Duration = Duration::from_millis(50);
const COMPLETION_POLL: Duration = Duration::from_millis(100);
const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Options for one orchestrator run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Re-enter with existing state; interrupted and failed issues retry.
    pub resume: bool,
    /// Force `max_workers = 1` and skip the P0 phase split.
    pub sequential: bool,
    /// Fixed-membership wave: only these issue IDs are processed, and any
    /// member not completed is recorded as failed.
    pub wave: Option<Vec<String>>,
}

/// Final accounting for one run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Issues merged to main this run, in completion order.
    pub merged: Vec<String>,
    /// Issues closed as invalid this run.
    pub closed: Vec<String>,
    pub failed: BTreeMap<String, String>,
    /// Issues skipped because a dependency is not yet completed.
    pub blocked: BTreeMap<String, String>,
    pub stash_pop_failures: BTreeMap<String, String>,
    pub breaker_open: bool,
    pub breaker_failures: Vec<BreakerFailure>,
    pub timing: BTreeMap<String, IssueTiming>,
    pub warnings: Vec<String>,
    pub cancelled: bool,
}

impl RunSummary {
    /// 0 success, 1 partial failure, 130 cancelled.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            130
        } else if self.failed.is_empty() {
            0
        } else {
            1
        }
    }
}

/// Pure classification of discovered issues for one run.
///
/// Splits candidates into ready, blocked-by-unmet-dependency, and members of
/// dependency cycles. `completed` holds IDs that already finished (state
/// file plus `completed/` directory).
pub fn classify_candidates(
    discovered: Vec<Issue>,
    completed: &HashSet<String>,
    wave: Option<&[String]>,
) -> (Vec<Issue>, Vec<(Issue, String)>, Vec<Issue>) {
    let candidates: Vec<Issue> = discovered
        .into_iter()
        .filter(|issue| !completed.contains(&issue.id))
        .filter(|issue| {
            wave.map(|ids| ids.iter().any(|id| id == &issue.id))
                .unwrap_or(true)
        })
        .collect();

    let cycle_ids = cycle_members(&candidates);
    let mut ready = Vec::new();
    let mut blocked = Vec::new();
    let mut cyclic = Vec::new();

    for issue in candidates {
        if cycle_ids.contains(&issue.id) {
            cyclic.push(issue);
            continue;
        }
        let unmet: Vec<&String> = issue
            .depends_on
            .iter()
            .filter(|dep| !completed.contains(dep.as_str()))
            .collect();
        if unmet.is_empty() {
            ready.push(issue);
        } else {
            let reason = format!(
                "blocked by {}",
                unmet.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            );
            blocked.push((issue, reason));
        }
    }
    (ready, blocked, cyclic)
}

/// IDs participating in a `depends_on` cycle, considering only edges within
/// the candidate set. Recorded, never resolved.
fn cycle_members(issues: &[Issue]) -> HashSet<String> {
    let ids: HashSet<&str> = issues.iter().map(|i| i.id.as_str()).collect();
    let edges: HashMap<&str, Vec<&str>> = issues
        .iter()
        .map(|i| {
            (
                i.id.as_str(),
                i.depends_on
                    .iter()
                    .map(String::as_str)
                    .filter(|d| ids.contains(d))
                    .collect(),
            )
        })
        .collect();

    // Color-marking DFS; every node on a back-edge path joins the set.
    let mut members = HashSet::new();
    for start in ids.iter() {
        let mut stack = vec![(*start, 0usize)];
        let mut path: Vec<&str> = Vec::new();
        let mut on_path: HashSet<&str> = HashSet::new();
        let mut visited: HashSet<&str> = HashSet::new();
        while let Some((node, edge_idx)) = stack.pop() {
            if edge_idx == 0 {
                if on_path.contains(node) {
                    continue;
                }
                path.push(node);
                on_path.insert(node);
            }
            let next = edges.get(node).and_then(|deps| deps.get(edge_idx));
            match next {
                Some(dep) => {
                    stack.push((node, edge_idx + 1));
                    if on_path.contains(*dep) {
                        // Back edge: everything from dep to the top of the
                        // path is cyclic.
                        let pos = path.iter().position(|n| n == dep).unwrap_or(0);
                        for n in &path[pos..] {
                            members.insert((*n).to_string());
                        }
                    } else if !visited.contains(*dep) {
                        stack.push((*dep, 0));
                    }
                }
                None => {
                    visited.insert(node);
                    on_path.remove(node);
                    path.pop();
                }
            }
        }
    }
    members
}

/// The top-level scheduler.
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    git: GitRepo,
    store: IssueStore,
    state: ProcessingState,
    cancel: Arc<AtomicBool>,
    issues_by_id: HashMap<String, Issue>,
    summary: RunSummary,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, cancel: Arc<AtomicBool>) -> Self {
        let git = GitRepo::new(&config.repo_root, new_repo_lock(), config.command_timeout);
        let store = IssueStore::new(&config.issues_root, config.categories.clone());
        Self {
            config: Arc::new(config),
            git,
            store,
            state: ProcessingState::default(),
            cancel,
            issues_by_id: HashMap::new(),
            summary: RunSummary::default(),
        }
    }

    pub fn state(&self) -> &ProcessingState {
        &self.state
    }

    /// Run the whole pipeline and return the final summary.
    pub fn run(&mut self, opts: &RunOptions) -> Result<RunSummary> {
        let deadline = Instant::now() + self.config.total_timeout;
        self.summary = RunSummary::default();
        self.issues_by_id.clear();

        // 0. State: fresh or resumed.
        self.state = match ProcessingState::load(&self.config.state_file)? {
            Some(mut loaded) if opts.resume => {
                let retry = loaded.reconcile_for_resume();
                if !retry.is_empty() {
                    info!("resume: retrying {}", retry.join(", "));
                }
                loaded
            }
            _ => ProcessingState::default(),
        };

        // 1. Discover and classify.
        let discovery = self.store.discover();
        self.summary.warnings = discovery.warnings.clone();
        let mut completed: HashSet<String> =
            self.state.completed_issues.iter().cloned().collect();
        completed.extend(discovery.completed.iter().map(|i| i.id.clone()));

        let (ready, blocked, cyclic) =
            classify_candidates(discovery.open, &completed, opts.wave.as_deref());

        for (issue, reason) in blocked {
            info!("{}: {reason}", issue.id);
            self.summary.blocked.insert(issue.id, reason);
        }
        let now = epoch_now();
        for issue in cyclic {
            warn!("{}: BlockedByCycle", issue.id);
            self.state.mark_failed(&issue.id, "BlockedByCycle", now);
            self.summary
                .failed
                .insert(issue.id.clone(), "BlockedByCycle".to_string());
        }

        // Files whose content could not be read at all are skipped as
        // unparseable; a partial record is not worth dispatching a worker.
        let (ready, unreadable): (Vec<Issue>, Vec<Issue>) = ready.into_iter().partition(|i| {
            !i.parse_warning
                .as_deref()
                .is_some_and(|w| w.starts_with("unreadable"))
        });
        for issue in unreadable {
            warn!("{}: unparseable, skipped", issue.id);
            self.state.mark_failed(&issue.id, "unparseable", now);
            self.summary
                .failed
                .insert(issue.id.clone(), "unparseable".to_string());
        }

        for issue in &ready {
            self.issues_by_id.insert(issue.id.clone(), issue.clone());
        }

        // 2. Shared machinery for both phases.
        let (completions_tx, completions_rx) = unbounded::<WorkerResult>();
        let (reports_tx, reports_rx) = unbounded::<MergeReport>();
        let pool = WorkerPool::new(
            Arc::clone(&self.config),
            self.git.clone(),
            completions_tx,
            Arc::clone(&self.cancel),
        );
        let coordinator =
            MergeCoordinator::start(self.git.clone(), Arc::clone(&self.config), reports_tx);

        // 3. Phases: optionally all P0 issues first, strictly sequential.
        let (p0, rest): (Vec<Issue>, Vec<Issue>) = if self.config.p0_sequential && !opts.sequential
        {
            ready.into_iter().partition(|i| i.priority == 0)
        } else {
            (Vec::new(), ready)
        };
        let max_workers = if opts.sequential {
            1
        } else {
            self.config.max_workers
        };

        if !p0.is_empty() {
            info!("critical phase: {} P0 issue(s), sequential", p0.len());
            self.run_phase(p0, 1, &pool, &coordinator, &completions_rx, &reports_rx, deadline)?;
        }
        if !rest.is_empty() {
            self.run_phase(
                rest,
                max_workers,
                &pool,
                &coordinator,
                &completions_rx,
                &reports_rx,
                deadline,
            )?;
        }

        // 4. Drain: workers settle, then the merge queue empties.
        pool.join_all();
        while let Ok(result) = completions_rx.try_recv() {
            self.handle_worker_result(result, &coordinator)?;
        }
        let drain_deadline = deadline.max(Instant::now() + DRAIN_GRACE);
        while coordinator.pending() > 0 && Instant::now() < drain_deadline {
            self.drain_merge_reports(&reports_rx, Some(COMPLETION_POLL))?;
        }
        let coordinator_summary = coordinator.close();
        self.drain_merge_reports(&reports_rx, None)?;

        // 5. Any lifecycle rename still only staged gets its commit now.
        self.commit_remaining_lifecycle_moves();

        // 6. Wave accounting: a failed wave never marks members completed;
        //    unfinished members are recorded as failures so resume retries
        //    them instead of skipping them as done.
        if let Some(wave) = &opts.wave {
            let now = epoch_now();
            for id in wave {
                let settled = self.state.is_completed(id)
                    || self.state.failed_issues.contains_key(id)
                    || self.summary.blocked.contains_key(id);
                if !settled {
                    self.state.mark_failed(id, "wave incomplete", now);
                    self.summary
                        .failed
                        .insert(id.clone(), "wave incomplete".to_string());
                }
            }
        }

        // 7. Final state + summary.
        self.summary.cancelled = self.cancel.load(Ordering::Relaxed);
        self.summary.breaker_open = coordinator_summary.breaker_open;
        self.summary.breaker_failures = coordinator_summary.breaker_failures;
        for (id, msg) in &coordinator_summary.stash_pop_failures {
            self.state.record_stash_pop_failure(id, msg);
        }
        self.summary.stash_pop_failures = self.state.stash_pop_failures.clone();
        self.summary.timing = self.state.timing_by_issue.clone();
        self.persist()?;
        Ok(self.summary.clone())
    }

    /// Dispatch one phase's issues through the pool, routing completions and
    /// merge reports until the phase settles.
    #[allow(clippy::too_many_arguments)]
    fn run_phase(
        &mut self,
        issues: Vec<Issue>,
        cap: usize,
        pool: &WorkerPool,
        coordinator: &MergeCoordinator,
        completions_rx: &Receiver<WorkerResult>,
        reports_rx: &Receiver<MergeReport>,
        deadline: Instant,
    ) -> Result<()> {
        let queue = IssueQueue::new();
        for issue in issues {
            queue.push(issue);
        }
        let mut active: usize = 0;

        loop {
            let cancelled = self.cancel.load(Ordering::Relaxed);
            let timed_out = Instant::now() >= deadline;

            if !cancelled && !timed_out {
                while active < cap {
                    match queue.get(DISPATCH_POLL) {
                        Ok(issue) => {
                            info!("dispatching {} ({})", issue.id, issue.title);
                            self.state.mark_started(&issue.id, epoch_now());
                            self.persist()?;
                            pool.spawn(issue);
                            active += 1;
                        }
                        Err(QueueError::Empty) => break,
                    }
                }
            }

            match completions_rx.recv_timeout(COMPLETION_POLL) {
                Ok(result) => {
                    active = active.saturating_sub(1);
                    queue.mark_done(&result.issue_id);
                    self.handle_worker_result(result, coordinator)?;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.drain_merge_reports(reports_rx, None)?;

            if (cancelled || timed_out) && active == 0 {
                // Anything still queued is abandoned for this run; it stays
                // open on disk and is retried by a later run.
                if timed_out && !cancelled {
                    warn!("total run timeout reached; stopping dispatch");
                }
                break;
            }
            if queue.is_idle() && active == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Route one settled worker: close, fail, or enqueue for merge.
    fn handle_worker_result(
        &mut self,
        result: WorkerResult,
        coordinator: &MergeCoordinator,
    ) -> Result<()> {
        let id = result.issue_id.clone();
        let now = epoch_now();

        if result.should_close && result.success {
            info!("{id}: worker marked the issue invalid; closing without merge");
            self.remove_worktree(&result);
            match self.lookup(&id) {
                Some(issue) => match self.store.close_invalid(&issue, &self.git) {
                    Ok(_) => {
                        self.state.mark_completed(&id, now);
                        self.summary.closed.push(id.clone());
                    }
                    Err(StoreError::DestinationConflict { src, dst }) => {
                        let reason = format!(
                            "lifecycle move conflict: {} vs {}",
                            src.display(),
                            dst.display()
                        );
                        self.state.mark_failed(&id, &reason, now);
                        self.summary.failed.insert(id.clone(), reason);
                    }
                    Err(e) => {
                        let reason = format!("close failed: {e}");
                        self.state.mark_failed(&id, &reason, now);
                        self.summary.failed.insert(id.clone(), reason);
                    }
                },
                None => {
                    let reason = "close requested for unknown issue".to_string();
                    self.state.mark_failed(&id, &reason, now);
                    self.summary.failed.insert(id.clone(), reason);
                }
            }
            return self.persist();
        }

        if !result.success {
            let reason = result
                .failure_reason
                .clone()
                .unwrap_or_else(|| "worker failed".to_string());
            warn!("{id}: {reason}");
            self.remove_worktree(&result);
            self.state.mark_failed(&id, &reason, now);
            self.summary.failed.insert(id.clone(), reason);
            return self.persist();
        }

        self.state.set_phase(&id, "merge");
        self.persist()?;
        coordinator.enqueue(result);
        Ok(())
    }

    /// Apply settled merge reports. With `wait`, block up to that long for
    /// the first report.
    fn drain_merge_reports(
        &mut self,
        reports_rx: &Receiver<MergeReport>,
        wait: Option<Duration>,
    ) -> Result<()> {
        let mut first = true;
        loop {
            let report = if first && wait.is_some() {
                match reports_rx.recv_timeout(wait.unwrap_or_default()) {
                    Ok(r) => r,
                    Err(_) => return Ok(()),
                }
            } else {
                match reports_rx.try_recv() {
                    Ok(r) => r,
                    Err(_) => return Ok(()),
                }
            };
            first = false;
            self.apply_merge_report(report)?;
        }
    }

    fn apply_merge_report(&mut self, report: MergeReport) -> Result<()> {
        let id = report.issue_id.clone();
        let now = epoch_now();
        if let Some(msg) = &report.stash_pop_failure {
            self.state.record_stash_pop_failure(&id, msg);
        }

        match report.disposition {
            MergeDisposition::Merged { commit, backups } => {
                info!("{id}: merged as {commit}");
                for b in &backups {
                    info!("{id}: preserved {} at {}", b.original, b.backup.display());
                }
                match self.lookup(&id) {
                    Some(issue) => match self.store.complete(&issue, &self.git) {
                        Ok(_) => {
                            self.state.mark_completed(&id, now);
                            self.summary.merged.push(id.clone());
                        }
                        Err(StoreError::DestinationConflict { src, dst }) => {
                            let reason = format!(
                                "merged, but lifecycle move conflicted: {} vs {}",
                                src.display(),
                                dst.display()
                            );
                            warn!("{id}: {reason}");
                            self.state.mark_failed(&id, &reason, now);
                            self.summary.failed.insert(id.clone(), reason);
                        }
                        Err(e) => {
                            let reason = format!("merged, but lifecycle move failed: {e}");
                            warn!("{id}: {reason}");
                            self.state.mark_failed(&id, &reason, now);
                            self.summary.failed.insert(id.clone(), reason);
                        }
                    },
                    None => {
                        let reason = "merge report for unknown issue".to_string();
                        self.state.mark_failed(&id, &reason, now);
                        self.summary.failed.insert(id.clone(), reason);
                    }
                }
            }
            MergeDisposition::Failed { reason } => {
                warn!("{id}: merge failed: {reason}");
                self.state.mark_failed(&id, &reason, now);
                self.summary.failed.insert(id.clone(), reason);
            }
        }
        self.persist()
    }

    fn lookup(&self, id: &str) -> Option<Issue> {
        self.issues_by_id.get(id).cloned()
    }

    fn remove_worktree(&self, result: &WorkerResult) {
        let path = &result.worktree_path;
        if path.as_os_str().is_empty() || !path.exists() {
            return;
        }
        if let Err(e) = self.git.worktree_remove(path, true) {
            warn!(
                "could not remove worktree {} for {}: {e}",
                path.display(),
                result.issue_id
            );
        }
    }

    /// Lifecycle renames staged after the last merge request get committed
    /// at the end of the run.
    fn commit_remaining_lifecycle_moves(&self) {
        let report = match self.git.status() {
            Ok(r) => r,
            Err(e) => {
                warn!("final status check failed: {e}");
                return;
            }
        };
        let name = self.config.issues_root_name();
        let bare = name.trim_start_matches('.');
        let prefixes = [format!("{bare}/"), format!(".{bare}/")];
        let staged = report.entries.iter().any(|e| {
            e.index_state != ' '
                && e.index_state != '?'
                && prefixes.iter().any(|p| e.path.starts_with(p.as_str()))
        });
        if !staged {
            return;
        }
        let root = self.config.issues_root.to_string_lossy().into_owned();
        if let Err(e) = self
            .git
            .commit_pathspec(&[root], "lifecycle: finalize completed issues")
        {
            warn!("final lifecycle commit failed: {e}");
        }
    }

    fn persist(&self) -> Result<()> {
        self.state
            .save(&self.config.state_file)
            .context("persisting processing state")
    }
}

fn epoch_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::IssueStatus;
    use std::path::PathBuf;

    fn issue(id: &str, priority: u8, deps: &[&str]) -> Issue {
        Issue {
            id: id.to_string(),
            category: "BUG".to_string(),
            priority,
            path: PathBuf::from(format!("/tmp/{id}.md")),
            title: id.to_string(),
            status: IssueStatus::Open,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            front_matter: None,
            parse_warning: None,
        }
    }

    fn ids(issues: &[Issue]) -> Vec<&str> {
        issues.iter().map(|i| i.id.as_str()).collect()
    }

    // ── classify_candidates ──────────────────────────────────────────────────

    #[test]
    fn completed_issues_are_dropped() {
        let completed: HashSet<String> = ["BUG-1".to_string()].into_iter().collect();
        let (ready, blocked, cyclic) = classify_candidates(
            vec![issue("BUG-1", 2, &[]), issue("BUG-2", 2, &[])],
            &completed,
            None,
        );
        assert_eq!(ids(&ready), vec!["BUG-2"]);
        assert!(blocked.is_empty());
        assert!(cyclic.is_empty());
    }

    #[test]
    fn unmet_dependencies_block() {
        let completed: HashSet<String> = ["ENH-1".to_string()].into_iter().collect();
        let (ready, blocked, _) = classify_candidates(
            vec![
                issue("BUG-1", 2, &["ENH-1"]),       // dep completed: ready
                issue("BUG-2", 2, &["ENH-99"]),      // dep missing: blocked
            ],
            &completed,
            None,
        );
        assert_eq!(ids(&ready), vec!["BUG-1"]);
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].0.id, "BUG-2");
        assert!(blocked[0].1.contains("ENH-99"));
    }

    #[test]
    fn dependency_cycles_are_recorded_not_resolved() {
        let completed = HashSet::new();
        let (ready, blocked, cyclic) = classify_candidates(
            vec![
                issue("BUG-1", 2, &["BUG-2"]),
                issue("BUG-2", 2, &["BUG-1"]),
                issue("BUG-3", 2, &[]),
            ],
            &completed,
            None,
        );
        assert_eq!(ids(&ready), vec!["BUG-3"]);
        assert!(blocked.is_empty());
        let mut cyclic_ids = ids(&cyclic);
        cyclic_ids.sort();
        assert_eq!(cyclic_ids, vec!["BUG-1", "BUG-2"]);
    }

    #[test]
    fn three_node_cycle_detected() {
        let completed = HashSet::new();
        let (_, _, cyclic) = classify_candidates(
            vec![
                issue("BUG-1", 2, &["BUG-2"]),
                issue("BUG-2", 2, &["BUG-3"]),
                issue("BUG-3", 2, &["BUG-1"]),
            ],
            &completed,
            None,
        );
        assert_eq!(cyclic.len(), 3);
    }

    #[test]
    fn chain_without_cycle_is_not_flagged() {
        let completed = HashSet::new();
        let (ready, blocked, cyclic) = classify_candidates(
            vec![
                issue("BUG-1", 2, &[]),
                issue("BUG-2", 2, &["BUG-1"]),
                issue("BUG-3", 2, &["BUG-2"]),
            ],
            &completed,
            None,
        );
        assert!(cyclic.is_empty());
        // BUG-1 has no deps; 2 and 3 wait for earlier completions.
        assert_eq!(ids(&ready), vec!["BUG-1"]);
        assert_eq!(blocked.len(), 2);
    }

    #[test]
    fn wave_restricts_membership() {
        let completed = HashSet::new();
        let wave = vec!["BUG-2".to_string()];
        let (ready, blocked, cyclic) = classify_candidates(
            vec![issue("BUG-1", 2, &[]), issue("BUG-2", 2, &[])],
            &completed,
            Some(&wave),
        );
        assert_eq!(ids(&ready), vec!["BUG-2"]);
        assert!(blocked.is_empty() && cyclic.is_empty());
    }

    #[test]
    fn exit_codes_map_to_outcome() {
        let mut summary = RunSummary::default();
        assert_eq!(summary.exit_code(), 0);
        summary.failed.insert("BUG-1".to_string(), "x".to_string());
        assert_eq!(summary.exit_code(), 1);
        summary.cancelled = true;
        assert_eq!(summary.exit_code(), 130);
    }
}
