//! drover-core — autonomous issue-processing orchestration.
//!
//! Drives an external AI worker CLI through many independent code-change
//! tasks in parallel, then integrates each task's branch back into the main
//! repository with strong isolation, bounded retries, and durable tracking.
//!
//! Module map:
//!   - `config`        — `OrchestratorConfig` (file + env, category table)
//!   - `git`           — repo-ops adapter; the only path to git mutation
//!   - `runner`        — worker-CLI subprocess runner (timeouts, handoff)
//!   - `issue`         — issue files: grammar, front matter, store, moves
//!   - `queue`         — priority FIFO with idempotent accounting
//!   - `pool`          — worktree-isolated worker execution
//!   - `merge`         — sequential merge coordinator + circuit breaker
//!   - `state`         — durable processing state (atomic JSON)
//!   - `orchestrator`  — the top-level scheduler
//!   - `report`        — end-of-run summary
//!   - `lock`          — per-repo process lock

pub mod config;
pub mod git;
pub mod issue;
pub mod lock;
pub mod merge;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod report;
pub mod runner;
pub mod state;

pub use config::OrchestratorConfig;
pub use lock::ProcessLock;
pub use orchestrator::{Orchestrator, RunOptions, RunSummary};
pub use state::ProcessingState;
