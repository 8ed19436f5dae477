//! Keystroke injection boundary
//!
//! Mode selection happens by replaying a keystroke sequence into the
//! device's console/keyboard emulation through an external tool. The tool
//! has no timeout of its own and is known to hang when the device side is
//! misbehaving, so every invocation runs inside the deadline harness from
//! [`crate::proc`]; a hang is killed and counted as one failed attempt.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use dutlab_core::error::{Error, Result};

use crate::proc::{run_with_deadline, DeadlineOutcome};

/// Default keystroke replay tool
const DEFAULT_COMMAND: &str = "pem";

/// Default wall-clock budget for a single replay attempt
pub const INJECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Keystroke injection capability. Production code uses [`PemInjector`];
/// tests substitute a recording fake.
pub trait Injector: Send + Sync {
    /// Replay `keystrokes` through the injector at `interface`/`port`.
    ///
    /// Makes up to `attempts` tries, each bounded by `timeout`; a try that
    /// neither succeeds nor fails within the budget is forcibly terminated.
    fn inject(
        &self,
        interface: &str,
        port: &str,
        keystrokes: &Path,
        attempts: u32,
        timeout: Duration,
    ) -> Result<()>;
}

/// Injector backed by the external replay tool.
pub struct PemInjector {
    command: String,
}

impl PemInjector {
    pub fn new() -> Self {
        Self {
            command: DEFAULT_COMMAND.to_string(),
        }
    }

    /// Use a different executable; tests point this at a stub.
    pub fn with_command(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }
}

impl Default for PemInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl Injector for PemInjector {
    fn inject(
        &self,
        interface: &str,
        port: &str,
        keystrokes: &Path,
        attempts: u32,
        timeout: Duration,
    ) -> Result<()> {
        for attempt in 1..=attempts {
            log::info!(
                "keystroke replay attempt {} of {} ({})",
                attempt,
                attempts,
                keystrokes.display()
            );

            let mut command = Command::new(&self.command);
            command
                .arg("--interface")
                .arg(interface)
                .arg("--port")
                .arg(port)
                .arg("--playback")
                .arg(keystrokes);

            match run_with_deadline(&mut command, timeout)? {
                DeadlineOutcome::Finished { status, .. } if status.success() => return Ok(()),
                DeadlineOutcome::Finished { status, .. } => {
                    // The tool itself rejected the request; retrying the
                    // same arguments will not help.
                    return Err(Error::Transient(format!(
                        "keystroke replay exited with {}",
                        status
                    )));
                }
                DeadlineOutcome::TimedOut { .. } => {
                    log::warn!(
                        "keystroke replay hung, killed after {:?} (attempt {}/{})",
                        timeout,
                        attempt,
                        attempts
                    );
                }
            }
        }

        Err(Error::Transient(format!(
            "keystroke replay did not finish in {} attempt(s)",
            attempts
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;

    fn stub_tool(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("pem-stub");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{}", body).unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn test_successful_replay() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stub_tool(dir.path(), "exit 0");
        let injector = PemInjector::with_command(tool.to_str().unwrap());

        injector
            .inject("ttyUSB0", "1", Path::new("keys"), 1, Duration::from_secs(5))
            .unwrap();
    }

    #[test]
    fn test_hanging_replay_is_killed_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stub_tool(dir.path(), "sleep 30");
        let injector = PemInjector::with_command(tool.to_str().unwrap());

        let started = Instant::now();
        let err = injector
            .inject(
                "ttyUSB0",
                "1",
                Path::new("keys"),
                2,
                Duration::from_millis(300),
            )
            .unwrap_err();

        assert!(err.is_transient());
        // Two bounded attempts, not two 30s sleeps.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_tool_rejection_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let tool = stub_tool(
            dir.path(),
            &format!("echo x >> {}\nexit 3", counter.display()),
        );
        let injector = PemInjector::with_command(tool.to_str().unwrap());

        let err = injector
            .inject("ttyUSB0", "1", Path::new("keys"), 4, Duration::from_secs(5))
            .unwrap_err();
        assert!(err.is_transient());

        let runs = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(runs.lines().count(), 1);
    }
}
