//! Per-repository process lock.
//!
//! Prevents two orchestrator instances from running against the same repo
//! simultaneously. Uses a PID file at `<repo>/.drover/lock`. Stale locks
//! (from crashed processes) are detected by checking whether the recorded
//! PID is still alive.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

/// RAII guard that holds the per-repo lock file and removes it on drop.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
}

impl ProcessLock {
    /// Acquire the lock for the repository at `repo_root`.
    ///
    /// - If no lock exists, writes the current PID and returns the guard.
    /// - If a stale lock exists (PID no longer running), overwrites it.
    /// - If a live lock exists and `force` is false, returns an error with
    ///   the existing PID so the operator knows what to kill.
    /// - If a live lock exists and `force` is true, terminates the old
    ///   process and acquires the lock.
    pub fn acquire(repo_root: &Path, force: bool) -> Result<Self> {
        let dir = repo_root.join(".drover");
        fs::create_dir_all(&dir)?;
        let lock_path = dir.join("lock");

        if lock_path.exists() {
            if let Ok(contents) = fs::read_to_string(&lock_path) {
                if let Ok(pid) = contents.trim().parse::<u32>() {
                    if is_pid_alive(pid) {
                        if force {
                            eprintln!("drover: terminating existing instance (PID {pid})");
                            terminate(pid);
                            std::thread::sleep(std::time::Duration::from_millis(500));
                        } else {
                            bail!(
                                "another drover process (PID {pid}) is already running here.\n\
                                 Use --force to override."
                            );
                        }
                    }
                    // else: stale lock, overwrite below.
                }
            }
        }

        fs::write(&lock_path, format!("{}\n", std::process::id()))?;
        Ok(Self { path: lock_path })
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Signal 0 checks process existence without delivering anything.
fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

fn terminate(pid: u32) {
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
    #[cfg(not(unix))]
    let _ = pid;
}
