//! Subprocess runner for the worker CLI.
//!
//! Launches one worker-CLI invocation, streams stdout and stderr line by
//! line, and enforces both a total and an idle timeout. Killed processes get
//! a bounded grace wait; a child that survives SIGKILL is reported as
//! `Zombie` instead of blocking the pool.
//!
//! The runner also watches for one literal signal on stdout: a line that
//! begins with `CONTEXT_HANDOFF:`. It only records the signal — continuation
//! policy belongs to the caller.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use log::warn;
use thiserror::Error;

/// Literal stdout prefix the worker CLI emits when it wants to be continued
/// in a fresh session.
pub const CONTEXT_HANDOFF_PREFIX: &str = "CONTEXT_HANDOFF:";

const KILL_GRACE: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn {cmd}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error supervising child: {0}")]
    Io(#[from] std::io::Error),
}

/// Why the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Normal,
    TotalTimeout,
    IdleTimeout,
    /// The child survived SIGKILL past the grace period.
    Zombie,
    /// Killed by an external signal, or cancelled.
    Signal,
}

/// One worker-CLI invocation to run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Program followed by its arguments.
    pub cmd: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub total_timeout: Duration,
    pub idle_timeout: Duration,
    /// Stall threshold before the first output line; defaults to
    /// `idle_timeout` when equal.
    pub no_output_stall: Duration,
    /// Cooperative cancellation: when set, the child is killed and the run
    /// reports `Signal`.
    pub cancel: Option<Arc<AtomicBool>>,
}

/// Structured result of one run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// `None` means the child did not exit normally; callers must treat it
    /// as failure, never as success.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub terminated_by: Termination,
    pub context_handoff: bool,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.terminated_by == Termination::Normal && self.exit_code == Some(0)
    }

    /// A well-formed failure value for paths where no attempt ran.
    pub fn not_run() -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            terminated_by: Termination::Normal,
            context_handoff: false,
        }
    }
}

#[derive(Clone, Copy)]
enum StreamKind {
    Out,
    Err,
}

struct LineEvent {
    kind: StreamKind,
    line: String,
}

/// Run one worker-CLI invocation to completion (or kill).
pub fn run(spec: &RunSpec) -> Result<RunResult, RunnerError> {
    let (program, args) = spec
        .cmd
        .split_first()
        .ok_or_else(|| RunnerError::Spawn {
            cmd: "<empty>".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in &spec.env {
        command.env(k, v);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group so a kill takes the whole tree with it.
        command.process_group(0);
    }

    let start = Instant::now();
    let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
        cmd: spec.cmd.join(" "),
        source,
    })?;

    let (tx, rx) = unbounded::<LineEvent>();
    spawn_reader(child.stdout.take(), StreamKind::Out, tx.clone());
    spawn_reader(child.stderr.take(), StreamKind::Err, tx);

    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut context_handoff = false;
    let mut saw_output = false;
    let mut last_output = start;
    let total_deadline = start + spec.total_timeout;

    let mut killed: Option<Termination> = None;
    let mut pipes_closed = false;
    let status = loop {
        if pipes_closed {
            std::thread::sleep(POLL_INTERVAL);
        } else {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(event) => {
                    saw_output = true;
                    last_output = Instant::now();
                    match event.kind {
                        StreamKind::Out => {
                            if event.line.starts_with(CONTEXT_HANDOFF_PREFIX) {
                                context_handoff = true;
                            }
                            stdout.push_str(&event.line);
                            stdout.push('\n');
                        }
                        StreamKind::Err => {
                            stderr.push_str(&event.line);
                            stderr.push('\n');
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                // Both pipes at EOF. The child usually exits right after;
                // if it lingers silently, the idle timeout still applies.
                Err(RecvTimeoutError::Disconnected) => pipes_closed = true,
            }
        }

        if let Some(status) = child.try_wait()? {
            break Some(status);
        }

        let now = Instant::now();
        let cancelled = spec
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed));
        let idle_limit = if saw_output {
            spec.idle_timeout
        } else {
            spec.no_output_stall
        };

        let cause = if cancelled {
            Some(Termination::Signal)
        } else if now >= total_deadline {
            Some(Termination::TotalTimeout)
        } else if now.duration_since(last_output) >= idle_limit {
            Some(Termination::IdleTimeout)
        } else {
            None
        };

        if let Some(cause) = cause {
            kill_process_tree(&child);
            killed = Some(cause);
            break wait_bounded(&mut child, KILL_GRACE)?;
        }
    };

    // Drain whatever the readers produced before the pipes closed.
    while let Ok(event) = rx.try_recv() {
        match event.kind {
            StreamKind::Out => {
                if event.line.starts_with(CONTEXT_HANDOFF_PREFIX) {
                    context_handoff = true;
                }
                stdout.push_str(&event.line);
                stdout.push('\n');
            }
            StreamKind::Err => {
                stderr.push_str(&event.line);
                stderr.push('\n');
            }
        }
    }

    let (exit_code, terminated_by) = match status {
        Some(status) => {
            let code = status.code();
            let cause = match killed {
                Some(cause) => cause,
                // No exit code without a kill of ours: an external signal.
                None if code.is_none() => Termination::Signal,
                None => Termination::Normal,
            };
            (code, cause)
        }
        None => {
            warn!("child survived SIGKILL past grace period: {}", spec.cmd.join(" "));
            (None, Termination::Zombie)
        }
    };

    Ok(RunResult {
        exit_code,
        stdout,
        stderr,
        duration: start.elapsed(),
        terminated_by,
        context_handoff,
    })
}

fn spawn_reader(
    stream: Option<impl std::io::Read + Send + 'static>,
    kind: StreamKind,
    tx: Sender<LineEvent>,
) {
    let Some(stream) = stream else { return };
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if tx.send(LineEvent { kind, line }).is_err() {
                break;
            }
        }
    });
}

/// SIGKILL the child's whole process group (falling back to the child
/// itself off unix).
fn kill_process_tree(child: &Child) {
    #[cfg(unix)]
    {
        let pgid = child.id() as libc::pid_t;
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child;
    }
}

/// Wait for the child, but never longer than `grace`. `None` means it is
/// still alive (zombie).
fn wait_bounded(
    child: &mut Child,
    grace: Duration,
) -> Result<Option<std::process::ExitStatus>, RunnerError> {
    let deadline = Instant::now() + grace;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
