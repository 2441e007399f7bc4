//! Merge coordinator: serial integration of worker branches into main.
//!
//! A single background thread drains a FIFO of merge requests. Sequential
//! processing is deliberate — parallel merges caused recurring conflicts and
//! index races; the throughput cost is accepted. A circuit breaker pauses
//! the coordinator after a run of consecutive terminal failures so a broken
//! main branch cannot cascade.

mod machine;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{error, warn};

use crate::config::OrchestratorConfig;
use crate::git::{BackedUpPath, GitRepo};
use crate::pool::WorkerResult;

use machine::{MergeMachine, Verdict};

/// A worker result admitted to the merge queue.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub result: WorkerResult,
    pub attempts: u32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

/// Terminal outcome of one request.
#[derive(Debug, Clone)]
pub enum MergeDisposition {
    Merged {
        /// Hash of the main-branch commit containing the worker's tip.
        commit: String,
        /// Untracked files moved aside to let the merge through.
        backups: Vec<BackedUpPath>,
    },
    Failed {
        reason: String,
    },
}

/// Delivered to the orchestrator for every settled request.
#[derive(Debug, Clone)]
pub struct MergeReport {
    pub issue_id: String,
    pub disposition: MergeDisposition,
    pub stash_pop_failure: Option<String>,
}

/// One of the failures that tripped the circuit breaker.
#[derive(Debug, Clone)]
pub struct BreakerFailure {
    pub issue_id: String,
    pub reason: String,
}

/// Snapshot returned when the coordinator shuts down.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorSummary {
    pub breaker_open: bool,
    pub breaker_failures: Vec<BreakerFailure>,
    pub stash_pop_failures: BTreeMap<String, String>,
}

/// Handle to the coordinator thread.
pub struct MergeCoordinator {
    tx: Option<Sender<MergeRequest>>,
    handle: Option<std::thread::JoinHandle<CoordinatorSummary>>,
    pending: Arc<AtomicUsize>,
}

impl MergeCoordinator {
    /// Start the background thread. Settled requests are delivered on
    /// `reports`.
    pub fn start(
        git: GitRepo,
        config: Arc<OrchestratorConfig>,
        reports: Sender<MergeReport>,
    ) -> Self {
        let (tx, rx) = unbounded::<MergeRequest>();
        let pending = Arc::new(AtomicUsize::new(0));
        let pending_thread = Arc::clone(&pending);

        let handle = std::thread::Builder::new()
            .name("merge-coordinator".to_string())
            .spawn(move || coordinator_loop(git, config, rx, reports, pending_thread))
            .expect("merge coordinator thread spawn");

        Self {
            tx: Some(tx),
            handle: Some(handle),
            pending,
        }
    }

    /// Enqueue a successful worker result for integration.
    pub fn enqueue(&self, result: WorkerResult) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let request = MergeRequest {
            result,
            attempts: 0,
            enqueued_at: chrono::Utc::now(),
        };
        if let Some(tx) = &self.tx {
            if tx.send(request).is_err() {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                error!("merge coordinator is gone; request dropped");
            }
        }
    }

    /// Requests admitted but not yet settled.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Close the queue, drain remaining requests, and return the summary.
    pub fn close(mut self) -> CoordinatorSummary {
        self.tx.take();
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                error!("merge coordinator thread panicked");
                CoordinatorSummary::default()
            }),
            None => CoordinatorSummary::default(),
        }
    }
}

impl Drop for MergeCoordinator {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

const BREAKER_MEMORY: usize = 3;

fn coordinator_loop(
    git: GitRepo,
    config: Arc<OrchestratorConfig>,
    rx: Receiver<MergeRequest>,
    reports: Sender<MergeReport>,
    pending: Arc<AtomicUsize>,
) -> CoordinatorSummary {
    let mut machine = MergeMachine::new(git.clone(), Arc::clone(&config));
    let mut queue: VecDeque<MergeRequest> = VecDeque::new();
    let mut consecutive_failures: u32 = 0;
    let mut breaker_open = false;
    let mut breaker_failures: Vec<BreakerFailure> = Vec::new();

    loop {
        // Keep strict FIFO: drain the channel behind anything already
        // buffered, so requeued requests land at the back.
        while let Ok(req) = rx.try_recv() {
            queue.push_back(req);
        }
        let request = match queue.pop_front() {
            Some(req) => req,
            None => match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(req) => req,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
        };

        // The worktree outlives the machine pass (a rebase retry may need
        // it), but never a settled request.
        let worktree = request.result.worktree_path.clone();

        if breaker_open {
            let report = MergeReport {
                issue_id: request.result.issue_id.clone(),
                disposition: MergeDisposition::Failed {
                    reason: "circuit breaker open".to_string(),
                },
                stash_pop_failure: None,
            };
            settle(&git, &reports, &pending, &worktree, report);
            continue;
        }

        match machine.process(request) {
            Verdict::Requeue(req) => queue.push_back(req),
            Verdict::Done(report) => {
                match &report.disposition {
                    MergeDisposition::Merged { .. } => consecutive_failures = 0,
                    MergeDisposition::Failed { reason } => {
                        consecutive_failures += 1;
                        breaker_failures.push(BreakerFailure {
                            issue_id: report.issue_id.clone(),
                            reason: reason.clone(),
                        });
                        if breaker_failures.len() > BREAKER_MEMORY {
                            breaker_failures.remove(0);
                        }
                        if consecutive_failures >= config.circuit_breaker_threshold {
                            breaker_open = true;
                            error!(
                                "circuit breaker open after {consecutive_failures} consecutive merge failures; \
                                 remaining requests will fail fast"
                            );
                        }
                    }
                }
                settle(&git, &reports, &pending, &worktree, report);
            }
        }
    }

    CoordinatorSummary {
        breaker_open,
        breaker_failures,
        stash_pop_failures: machine.stash_pop_failures.clone(),
    }
}

fn settle(
    git: &GitRepo,
    reports: &Sender<MergeReport>,
    pending: &Arc<AtomicUsize>,
    worktree: &std::path::Path,
    report: MergeReport,
) {
    if !worktree.as_os_str().is_empty() && worktree.exists() {
        if let Err(e) = git.worktree_remove(worktree, true) {
            warn!(
                "could not remove worktree {} for {}: {e}",
                worktree.display(),
                report.issue_id
            );
        }
    }
    pending.fetch_sub(1, Ordering::SeqCst);
    if reports.send(report).is_err() {
        warn!("orchestrator stopped listening for merge reports");
    }
}
