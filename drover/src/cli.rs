//! Command-line surface for drover.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "drover",
    version,
    about = "Autonomous issue-processing orchestrator",
    long_about = "drover discovers issue files, drives an AI worker CLI through them in \
                  isolated git worktrees, and integrates each result back into main."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Process open issues in parallel worktrees
    Parallel {
        /// Max concurrent workers (overrides config)
        #[arg(long)]
        max_workers: Option<usize>,

        /// Re-enter with existing state; retry interrupted and failed issues
        #[arg(long)]
        resume: bool,

        /// Process only these issue IDs, as one fixed-membership wave
        #[arg(long, value_name = "ID")]
        wave: Vec<String>,

        /// Take over from a running drover instance
        #[arg(long)]
        force: bool,
    },

    /// Process open issues one at a time
    Run {
        /// Re-enter with existing state
        #[arg(long)]
        resume: bool,

        /// Take over from a running drover instance
        #[arg(long)]
        force: bool,
    },

    /// Re-enter a previous run with existing state (same as `parallel --resume`)
    Resume {
        /// Take over from a running drover instance
        #[arg(long)]
        force: bool,
    },

    /// Show the persisted processing state
    Status,

    /// Remove stale worker worktrees
    Cleanup,
}
