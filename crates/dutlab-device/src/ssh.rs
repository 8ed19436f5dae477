//! OpenSSH-backed remote shell
//!
//! Implements the [`RemoteShell`] boundary by spawning `ssh`/`scp` child
//! processes. Lab devices are reinstalled constantly, so host keys are
//! neither checked nor recorded; authentication is key-only (BatchMode
//! refuses to sit on a password prompt). Every invocation is bounded by the
//! deadline harness so a dead network never blocks a polling loop.

use std::net::IpAddr;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use dutlab_core::error::{Error, Result};
use dutlab_core::remote::{RemoteOutput, RemoteShell};

use crate::proc::{run_with_deadline, DeadlineOutcome};

/// ssh reports transport-level failure (no route, refused, auth) as 255
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Budget for a file push
const PUSH_TIMEOUT: Duration = Duration::from_secs(300);

/// Remote shell over OpenSSH client tools.
pub struct OpenSsh {
    ssh_command: String,
    scp_command: String,
}

impl OpenSsh {
    pub fn new() -> Self {
        Self {
            ssh_command: "ssh".to_string(),
            scp_command: "scp".to_string(),
        }
    }

    /// Use different executables; tests point these at stubs.
    pub fn with_commands(ssh: &str, scp: &str) -> Self {
        Self {
            ssh_command: ssh.to_string(),
            scp_command: scp.to_string(),
        }
    }

    fn common_options(command: &mut Command) {
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg("-o")
            .arg("LogLevel=ERROR");
    }
}

impl Default for OpenSsh {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteShell for OpenSsh {
    fn execute(
        &self,
        ip: IpAddr,
        argv: &[&str],
        timeout: Duration,
        user: &str,
    ) -> Result<Option<RemoteOutput>> {
        let mut command = Command::new(&self.ssh_command);
        Self::common_options(&mut command);
        command.arg(format!("{}@{}", user, ip));
        command.args(argv);

        log::debug!("ssh {}@{}: {}", user, ip, argv.join(" "));

        match run_with_deadline(&mut command, timeout)? {
            DeadlineOutcome::Finished { status, stdout, stderr } => {
                let status = status.code().unwrap_or(-1);
                if status == SSH_TRANSPORT_FAILURE {
                    return Ok(None);
                }
                Ok(Some(RemoteOutput {
                    status,
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                }))
            }
            DeadlineOutcome::TimedOut { .. } => Err(Error::Transient(format!(
                "ssh to {} exceeded {:?}",
                ip, timeout
            ))),
        }
    }

    fn push(&self, ip: IpAddr, local: &Path, remote: &str, user: &str) -> Result<()> {
        let mut command = Command::new(&self.scp_command);
        Self::common_options(&mut command);
        command.arg(local);
        command.arg(format!("{}@{}:{}", user, ip, remote));

        log::debug!("scp {} -> {}@{}:{}", local.display(), user, ip, remote);

        match run_with_deadline(&mut command, PUSH_TIMEOUT)? {
            DeadlineOutcome::Finished { status, .. } if status.success() => Ok(()),
            DeadlineOutcome::Finished { status, .. } => Err(Error::Transient(format!(
                "scp to {} exited with {}",
                ip, status
            ))),
            DeadlineOutcome::TimedOut { .. } => Err(Error::Transient(format!(
                "scp to {} exceeded {:?}",
                ip, PUSH_TIMEOUT
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn stub_tool(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{}", body).unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn ip() -> IpAddr {
        "192.168.30.4".parse().unwrap()
    }

    #[test]
    fn test_execute_reports_remote_status_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stub_tool(dir.path(), "ssh", "echo remote-out\nexit 7");
        let shell = OpenSsh::with_commands(tool.to_str().unwrap(), "scp");

        let output = shell
            .execute(ip(), &["anything"], Duration::from_secs(5), "root")
            .unwrap()
            .unwrap();
        assert_eq!(output.status, 7);
        assert_eq!(output.stdout.trim(), "remote-out");
    }

    #[test]
    fn test_transport_failure_maps_to_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stub_tool(dir.path(), "ssh", "exit 255");
        let shell = OpenSsh::with_commands(tool.to_str().unwrap(), "scp");

        let result = shell
            .execute(ip(), &["true"], Duration::from_secs(5), "root")
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_hung_transport_is_transient_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stub_tool(dir.path(), "ssh", "sleep 30");
        let shell = OpenSsh::with_commands(tool.to_str().unwrap(), "scp");

        let err = shell
            .execute(ip(), &["true"], Duration::from_millis(300), "root")
            .unwrap_err();
        assert!(err.is_transient());
    }
}
