//! Error types for the usbrelay cutter driver

use std::fmt;

/// Result type for usbrelay driver setup
pub type Result<T> = std::result::Result<T, UsbrelayError>;

/// Errors that can occur while talking to a serial relay
#[derive(Debug)]
pub enum UsbrelayError {
    /// Serial port enumeration failed
    EnumerationFailed(String),
    /// Failed to open the relay's serial port
    OpenFailed(String),
    /// Writing a relay frame failed
    WriteFailed(String),
}

impl fmt::Display for UsbrelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbrelayError::EnumerationFailed(msg) => {
                write!(f, "serial port enumeration failed: {}", msg)
            }
            UsbrelayError::OpenFailed(msg) => write!(f, "failed to open relay port: {}", msg),
            UsbrelayError::WriteFailed(msg) => write!(f, "relay frame write failed: {}", msg),
        }
    }
}

impl std::error::Error for UsbrelayError {}

impl From<serialport::Error> for UsbrelayError {
    fn from(e: serialport::Error) -> Self {
        UsbrelayError::OpenFailed(e.to_string())
    }
}
