//! Thread-safe priority queue of pending issues.
//!
//! Ordering is (priority ascending, enqueue order ascending): the next issue
//! returned is the highest-priority, earliest-enqueued one that is neither
//! in progress nor done. The `in_progress` and `done` sets make enqueueing
//! idempotent; transitions between them are atomic with respect to `get`.

use std::collections::{BinaryHeap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::issue::Issue;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Raised only when the timeout elapses with nothing available.
    #[error("queue empty")]
    Empty,
}

struct Entry {
    priority: u8,
    seq: u64,
    issue: Issue,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the smallest (priority, seq)
        // pair surfaces first.
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    queued: HashSet<String>,
    in_progress: HashSet<String>,
    done: HashSet<String>,
    seq: u64,
}

/// Min-priority FIFO-within-priority queue with idempotent accounting.
#[derive(Default)]
pub struct IssueQueue {
    inner: Mutex<Inner>,
    available: Condvar,
}

impl IssueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an issue. Idempotent: issues already queued, in progress, or
    /// done are ignored.
    pub fn push(&self, issue: Issue) {
        let mut inner = self.lock();
        let id = issue.id.clone();
        if inner.queued.contains(&id)
            || inner.in_progress.contains(&id)
            || inner.done.contains(&id)
        {
            return;
        }
        inner.seq += 1;
        let seq = inner.seq;
        inner.heap.push(Entry {
            priority: issue.priority,
            seq,
            issue,
        });
        inner.queued.insert(id);
        self.available.notify_one();
    }

    /// Pop the next issue, blocking up to `timeout`. The returned issue is
    /// marked in-progress atomically with the pop.
    ///
    /// [`QueueError::Empty`] is raised only when the timeout elapses.
    pub fn get(&self, timeout: Duration) -> Result<Issue, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(entry) = inner.heap.pop() {
                inner.queued.remove(&entry.issue.id);
                inner.in_progress.insert(entry.issue.id.clone());
                return Ok(entry.issue);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(QueueError::Empty);
            }
            let (guard, _timed_out) = self
                .available
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
        }
    }

    /// Move an issue from in-progress to done. Safe to call for ids that
    /// were never dispatched (no-op accounting for externally settled work).
    pub fn mark_done(&self, id: &str) {
        let mut inner = self.lock();
        inner.in_progress.remove(id);
        inner.done.insert(id.to_string());
    }

    /// Return an in-progress issue to the queue untouched (used when a
    /// dispatch was aborted before any work started).
    pub fn requeue(&self, issue: Issue) {
        let mut inner = self.lock();
        inner.in_progress.remove(&issue.id);
        inner.seq += 1;
        let seq = inner.seq;
        inner.queued.insert(issue.id.clone());
        inner.heap.push(Entry {
            priority: issue.priority,
            seq,
            issue,
        });
        self.available.notify_one();
    }

    pub fn pending_len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn in_progress_len(&self) -> usize {
        self.lock().in_progress.len()
    }

    /// True when nothing is queued and nothing is in progress.
    pub fn is_idle(&self) -> bool {
        let inner = self.lock();
        inner.heap.is_empty() && inner.in_progress.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::IssueStatus;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn issue(id: &str, priority: u8) -> Issue {
        Issue {
            id: id.to_string(),
            category: "BUG".to_string(),
            priority,
            path: PathBuf::from(format!("/tmp/{id}.md")),
            title: id.to_string(),
            status: IssueStatus::Open,
            depends_on: vec![],
            front_matter: None,
            parse_warning: None,
        }
    }

    #[test]
    fn priority_then_fifo_ordering() {
        let q = IssueQueue::new();
        q.push(issue("BUG-1", 2));
        q.push(issue("BUG-2", 0));
        q.push(issue("BUG-3", 2));
        q.push(issue("BUG-4", 1));

        let order: Vec<String> = (0..4)
            .map(|_| q.get(Duration::from_millis(10)).unwrap().id)
            .collect();
        assert_eq!(order, vec!["BUG-2", "BUG-4", "BUG-1", "BUG-3"]);
    }

    #[test]
    fn empty_raised_only_after_timeout() {
        let q = IssueQueue::new();
        let start = Instant::now();
        let err = q.get(Duration::from_millis(50)).unwrap_err();
        assert_eq!(err, QueueError::Empty);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn push_is_idempotent_across_states() {
        let q = IssueQueue::new();
        q.push(issue("BUG-1", 1));
        q.push(issue("BUG-1", 1));
        assert_eq!(q.pending_len(), 1);

        let popped = q.get(Duration::from_millis(10)).unwrap();
        q.push(issue(&popped.id, 1)); // in progress: ignored
        assert_eq!(q.pending_len(), 0);

        q.mark_done(&popped.id);
        q.push(issue(&popped.id, 1)); // done: ignored
        assert_eq!(q.pending_len(), 0);
        assert!(q.is_idle());
    }

    #[test]
    fn get_marks_in_progress_atomically() {
        let q = IssueQueue::new();
        q.push(issue("BUG-1", 1));
        let _ = q.get(Duration::from_millis(10)).unwrap();
        assert_eq!(q.in_progress_len(), 1);
        assert!(!q.is_idle());
        q.mark_done("BUG-1");
        assert!(q.is_idle());
    }

    #[test]
    fn blocked_get_wakes_on_push() {
        let q = Arc::new(IssueQueue::new());
        let q2 = Arc::clone(&q);
        let handle = std::thread::spawn(move || q2.get(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(30));
        q.push(issue("BUG-7", 0));
        let got = handle.join().unwrap().unwrap();
        assert_eq!(got.id, "BUG-7");
    }

    #[test]
    fn requeue_returns_issue_to_pending() {
        let q = IssueQueue::new();
        q.push(issue("BUG-1", 1));
        let popped = q.get(Duration::from_millis(10)).unwrap();
        q.requeue(popped);
        assert_eq!(q.pending_len(), 1);
        assert_eq!(q.in_progress_len(), 0);
        assert_eq!(q.get(Duration::from_millis(10)).unwrap().id, "BUG-1");
    }
}
