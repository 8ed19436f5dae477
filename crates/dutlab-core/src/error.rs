//! Error types for dutlab-core
//!
//! One central taxonomy, split by how callers must react: transient faults
//! are retried locally and never surfaced on their own; everything else
//! bubbles up to the invocation, which logs and exits non-zero.

use thiserror::Error;

/// Central error type shared by all dutlab crates
#[derive(Debug, Error)]
pub enum Error {
    /// A hardware interaction failed in a way that is expected to clear on
    /// retry: a relay command returned non-zero, a DFU unit is not visible
    /// yet, an SSH probe went unanswered. Callers retry up to their attempt
    /// budget and only then escalate to one of the fatal classes.
    #[error("transient hardware fault: {0}")]
    Transient(String),

    /// Mode entry exhausted its attempt budget. The device is handed back in
    /// an unknown mode; callers must not assume it is healthy.
    #[error("device {device} could not be put in {mode} mode")]
    ModeEntry { device: String, mode: String },

    /// Flashing exhausted its per-stage attempt budget or a remote command
    /// failed mid-write. The device storage is in an indeterminate state.
    #[error("flashing failed: {0}")]
    Flashing(String),

    /// No matching free device, or the request conflicts with the blacklist.
    /// Pool state is left untouched.
    #[error("reservation failed: {0}")]
    Reservation(String),

    /// Malformed topology or catalog entry. Detected at load time, before
    /// any hardware interaction.
    #[error("configuration error: {0}")]
    Config(String),

    /// A remote command ran and reported a non-zero exit status.
    #[error("remote command {command:?} exited with status {status}")]
    RemoteCommand { command: String, status: i32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is retriable within a local attempt loop.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

/// Result type alias using the dutlab error type
pub type Result<T> = std::result::Result<T, Error>;
