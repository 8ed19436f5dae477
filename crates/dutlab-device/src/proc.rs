//! Bounded subprocess execution
//!
//! Several of the tools this harness leans on (keystroke replay, dfu-util,
//! ssh against a half-booted device) can wedge indefinitely. Every external
//! command therefore runs through [`run_with_deadline`]: output is drained
//! on separate threads while the parent polls for exit, and a child that
//! outlives its deadline is terminated (SIGTERM, short grace, then SIGKILL)
//! rather than waited on forever.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// How often the parent checks whether the child has exited
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period between SIGTERM and SIGKILL
const TERM_GRACE: Duration = Duration::from_millis(500);

/// Result of a deadline-bounded child process run.
#[derive(Debug)]
pub enum DeadlineOutcome {
    /// The child exited on its own
    Finished {
        status: ExitStatus,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    /// The child was still alive at the deadline and has been killed.
    /// Output collected up to that point is preserved for the logs.
    TimedOut { stdout: Vec<u8>, stderr: Vec<u8> },
}

impl DeadlineOutcome {
    pub fn stdout_lossy(&self) -> String {
        match self {
            DeadlineOutcome::Finished { stdout, .. } => String::from_utf8_lossy(stdout).into_owned(),
            DeadlineOutcome::TimedOut { stdout, .. } => String::from_utf8_lossy(stdout).into_owned(),
        }
    }

    pub fn stderr_lossy(&self) -> String {
        match self {
            DeadlineOutcome::Finished { stderr, .. } => String::from_utf8_lossy(stderr).into_owned(),
            DeadlineOutcome::TimedOut { stderr, .. } => String::from_utf8_lossy(stderr).into_owned(),
        }
    }
}

/// Run `command` to completion or kill it at `deadline`.
pub fn run_with_deadline(command: &mut Command, deadline: Duration) -> std::io::Result<DeadlineOutcome> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;

    // Drain the pipes on their own threads so a chatty child can never
    // fill the pipe buffer and stall without exiting.
    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None if started.elapsed() >= deadline => break None,
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    match status {
        Some(status) => {
            let stdout = join_reader(stdout_reader);
            let stderr = join_reader(stderr_reader);
            Ok(DeadlineOutcome::Finished {
                status,
                stdout,
                stderr,
            })
        }
        None => {
            terminate(&mut child);
            let stdout = join_reader(stdout_reader);
            let stderr = join_reader(stderr_reader);
            Ok(DeadlineOutcome::TimedOut { stdout, stderr })
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    source: Option<R>,
) -> Option<thread::JoinHandle<Vec<u8>>> {
    source.map(|mut r| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = r.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_reader(handle: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// SIGTERM, wait a short grace period, then SIGKILL and reap.
fn terminate(child: &mut Child) {
    let pid = Pid::from_raw(child.id() as i32);
    if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
        log::debug!("SIGTERM to {} failed: {}", pid, e);
    }

    let grace_started = Instant::now();
    while grace_started.elapsed() < TERM_GRACE {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(_) => break,
        }
    }

    if let Err(e) = child.kill() {
        log::debug!("SIGKILL failed: {}", e);
    }
    let _ = child.wait();
}
