//! Remote execution boundary
//!
//! The flashers and the mode verifier talk to booted devices through this
//! trait. The production implementation (OpenSSH child processes) lives in
//! `dutlab-device`; tests substitute a scripted fake.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Captured output of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Remote shell/transfer capability against one device IP.
pub trait RemoteShell: Send + Sync {
    /// Run `argv` on the device as `user`.
    ///
    /// `Ok(None)` means the device was unreachable (connection refused, no
    /// route, transport timeout); `Ok(Some(_))` means the command ran and
    /// its status is whatever the remote reported.
    fn execute(
        &self,
        ip: IpAddr,
        argv: &[&str],
        timeout: Duration,
        user: &str,
    ) -> Result<Option<RemoteOutput>>;

    /// Copy a local file onto the device.
    fn push(&self, ip: IpAddr, local: &Path, remote: &str, user: &str) -> Result<()>;
}

/// Run a remote command and require a zero exit status.
///
/// Statuses listed in `ignore_statuses` are tolerated (mount returning 32
/// for "already mounted" is the classic case). An unreachable device and a
/// rejected command both abort the caller's current attempt.
pub fn execute_checked(
    shell: &dyn RemoteShell,
    ip: IpAddr,
    argv: &[&str],
    timeout: Duration,
    user: &str,
    ignore_statuses: &[i32],
) -> Result<RemoteOutput> {
    let rendered = argv.join(" ");
    match shell.execute(ip, argv, timeout, user)? {
        None => Err(Error::Transient(format!("{} unreachable over ssh", ip))),
        Some(output) => {
            if output.success() || ignore_statuses.contains(&output.status) {
                Ok(output)
            } else {
                Err(Error::RemoteCommand {
                    command: rendered,
                    status: output.status,
                })
            }
        }
    }
}
