mod cli;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use drover_core::config::OrchestratorConfig;
use drover_core::git::{new_repo_lock, GitRepo};
use drover_core::orchestrator::{Orchestrator, RunOptions};
use drover_core::report;
use drover_core::{ProcessLock, ProcessingState};

use cli::{Cli, Commands};

/// Exit code for configuration and usage errors.
const EXIT_CONFIG: i32 = 2;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let cancel = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    {
        if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&cancel))
        {
            log::warn!("could not install SIGINT handler: {e}");
        }
    }

    let code = match dispatch(cli, cancel) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("drover: {e:#}");
            EXIT_CONFIG
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli, cancel: Arc<AtomicBool>) -> Result<i32> {
    let repo_root = repo_root()?;
    let config = OrchestratorConfig::load(&repo_root);

    match cli.command {
        Commands::Parallel {
            max_workers,
            resume,
            wave,
            force,
        } => {
            let mut config = config;
            if let Some(n) = max_workers {
                if n == 0 {
                    bail!("--max-workers must be at least 1");
                }
                config.max_workers = n.min(8);
            }
            let opts = RunOptions {
                resume,
                sequential: false,
                wave: if wave.is_empty() { None } else { Some(wave) },
            };
            run_orchestrator(config, &opts, force, cancel)
        }
        Commands::Run { resume, force } => {
            let opts = RunOptions {
                resume,
                sequential: true,
                wave: None,
            };
            run_orchestrator(config, &opts, force, cancel)
        }
        Commands::Resume { force } => {
            let opts = RunOptions {
                resume: true,
                sequential: false,
                wave: None,
            };
            run_orchestrator(config, &opts, force, cancel)
        }
        Commands::Status => status(&config),
        Commands::Cleanup => cleanup(&config),
    }
}

fn run_orchestrator(
    config: OrchestratorConfig,
    opts: &RunOptions,
    force: bool,
    cancel: Arc<AtomicBool>,
) -> Result<i32> {
    let _lock = ProcessLock::acquire(&config.repo_root, force)?;
    let repo_root = config.repo_root.clone();
    let mut orchestrator = Orchestrator::new(config, cancel);
    let summary = orchestrator.run(opts)?;
    report::emit(&summary, &repo_root);
    Ok(summary.exit_code())
}

fn status(config: &OrchestratorConfig) -> Result<i32> {
    match ProcessingState::load(&config.state_file)? {
        Some(state) => {
            println!(
                "completed: {}  failed: {}  in progress: {}",
                state.completed_issues.len(),
                state.failed_issues.len(),
                state.in_progress.len()
            );
            for id in &state.completed_issues {
                println!("  + {id}");
            }
            for (id, reason) in &state.failed_issues {
                println!("  x {id}: {reason}");
            }
            for id in &state.in_progress {
                let phase = state
                    .phase_by_issue
                    .get(id)
                    .map(String::as_str)
                    .unwrap_or("worker");
                println!("  … {id} ({phase})");
            }
            if !state.stash_pop_failures.is_empty() {
                println!("stash pop failures:");
                for (id, msg) in &state.stash_pop_failures {
                    println!("  ! {id}: {msg}");
                }
            }
        }
        None => println!("no processing state recorded"),
    }
    Ok(0)
}

/// Remove leftover `worker-*` worktrees under the worktree base and prune
/// git's worktree metadata.
fn cleanup(config: &OrchestratorConfig) -> Result<i32> {
    let git = GitRepo::new(&config.repo_root, new_repo_lock(), config.command_timeout);
    let mut removed = 0usize;
    if config.worktree_base.is_dir() {
        for entry in std::fs::read_dir(&config.worktree_base)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if path.is_dir() && name.starts_with("worker-") {
                match git.worktree_remove(&path, true) {
                    Ok(()) => removed += 1,
                    Err(e) => eprintln!("drover: could not remove {}: {e}", path.display()),
                }
            }
        }
    }
    git.worktree_prune()
        .context("pruning worktree metadata")?;
    println!("removed {removed} stale worktree(s)");
    Ok(0)
}

/// The main checkout drover operates on: the git toplevel of the current
/// directory.
fn repo_root() -> Result<PathBuf> {
    let out = std::process::Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .output()
        .context("running git (is it installed?)")?;
    if !out.status.success() {
        bail!("not inside a git repository");
    }
    let root = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if root.is_empty() {
        bail!("could not determine repository root");
    }
    Ok(Path::new(&root).to_path_buf())
}
