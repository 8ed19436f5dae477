//! Error types for the Cleware cutter driver

use std::fmt;

/// Result type for Cleware driver setup
pub type Result<T> = std::result::Result<T, ClewareError>;

/// Errors that can occur while opening the Cleware backend
#[derive(Debug)]
pub enum ClewareError {
    /// The clewarecontrol tool is not installed or not executable
    ToolMissing(String),
    /// The tool ran but printed something we do not recognize
    UnexpectedOutput(String),
    /// The tool reported a failure while enumerating
    ProbeFailed(String),
}

impl fmt::Display for ClewareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClewareError::ToolMissing(msg) => {
                write!(f, "clewarecontrol not usable: {}", msg)
            }
            ClewareError::UnexpectedOutput(msg) => {
                write!(f, "unexpected clewarecontrol output: {}", msg)
            }
            ClewareError::ProbeFailed(msg) => write!(f, "cleware probe failed: {}", msg),
        }
    }
}

impl std::error::Error for ClewareError {}
