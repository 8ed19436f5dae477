//! dutlab-cleware - Cleware GmbH USB cutter support
//!
//! Drives Cleware switches through the vendor `clewarecontrol` CLI. Probing
//! parses the tool's `-l` listing; switching issues one `-as` command per
//! channel. The tool latches the relay, so commands are idempotent beyond
//! the settle delay handled by `PowerChannel`.

mod error;

pub use error::{ClewareError, Result as ClewareResult};

use std::collections::HashMap;
use std::process::Command;
use std::time::Duration;

use dutlab_core::cutter::{lookup_type, CutterBackend, CutterType, CutterUnit};
use dutlab_core::error::{Error, Result};

/// Vendor tool used for all hardware access
const CLEWARE_COMMAND: &str = "clewarecontrol";

/// Supported Cleware models, keyed by the version number the hardware
/// reports. Closing a mains relay takes noticeably longer than opening it,
/// hence the asymmetric settle times.
pub static CLEWARE_TYPES: &[CutterType] = &[
    CutterType {
        version: 5,
        model: "USB",
        channels: 1,
        connect_value: 1,
        disconnect_value: 0,
        connect_settle: Duration::from_secs(3),
        disconnect_settle: Duration::from_secs(1),
    },
    CutterType {
        version: 23,
        model: "MainsSingle",
        channels: 1,
        connect_value: 1,
        disconnect_value: 0,
        connect_settle: Duration::from_secs(5),
        disconnect_settle: Duration::from_secs(3),
    },
    CutterType {
        version: 29,
        model: "MainsQuad",
        channels: 4,
        connect_value: 1,
        disconnect_value: 0,
        connect_settle: Duration::from_secs(5),
        disconnect_settle: Duration::from_secs(3),
    },
    CutterType {
        version: 51,
        model: "MainsSingleNew",
        channels: 4,
        connect_value: 1,
        disconnect_value: 0,
        connect_settle: Duration::from_secs(5),
        disconnect_settle: Duration::from_secs(3),
    },
    CutterType {
        version: 512,
        model: "MainsQuad",
        channels: 4,
        connect_value: 1,
        disconnect_value: 0,
        connect_settle: Duration::from_secs(5),
        disconnect_settle: Duration::from_secs(3),
    },
];

/// Cleware cutter backend.
pub struct ClewareCutter {
    command: String,
    /// Type per probed unit id, filled in by `probe`
    unit_types: HashMap<String, &'static CutterType>,
}

impl ClewareCutter {
    /// Open the backend, verifying the vendor tool answers at all.
    ///
    /// A non-zero exit from `-l` still proves the tool exists; enumeration
    /// problems surface properly during probe.
    pub fn open() -> ClewareResult<Self> {
        let cutter = Self::with_command(CLEWARE_COMMAND);
        if let Err(Error::Io(e)) = cutter.run_tool(&["-l"]) {
            return Err(ClewareError::ToolMissing(e.to_string()));
        }
        Ok(cutter)
    }

    /// Use a different executable; tests point this at a stub script.
    pub fn with_command(command: &str) -> Self {
        Self {
            command: command.to_string(),
            unit_types: HashMap::new(),
        }
    }

    /// Run clewarecontrol with `-c 1` (execute exactly once) plus `args`.
    fn run_tool(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.command)
            .arg("-c")
            .arg("1")
            .args(args)
            .output()?;
        if !output.status.success() {
            return Err(Error::Transient(format!(
                "{} -c 1 {} exited with {}",
                self.command,
                args.join(" "),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl CutterBackend for ClewareCutter {
    fn family(&self) -> &'static str {
        "cleware"
    }

    fn probe(&mut self) -> Result<Vec<CutterUnit>> {
        log::info!("Detecting attached Cleware cutters");
        let stdout = self.run_tool(&["-l"])?;
        let units = parse_probe_output(&stdout)
            .map_err(|e| Error::Transient(format!("cleware probe: {}", e)))?;

        self.unit_types.clear();
        for unit in &units {
            if let Some(t) = lookup_type(CLEWARE_TYPES, unit.version) {
                self.unit_types.insert(unit.id.clone(), t);
            }
        }

        log::info!("Cleware detection complete, {} unit(s)", units.len());
        Ok(units)
    }

    fn set_channel(&mut self, unit_id: &str, channel_id: u32, connected: bool) -> Result<()> {
        let cutter_type = self.unit_types.get(unit_id).ok_or_else(|| {
            Error::Transient(format!("cleware unit {} was not probed", unit_id))
        })?;
        let value = if connected {
            cutter_type.connect_value
        } else {
            cutter_type.disconnect_value
        };

        let channel = channel_id.to_string();
        let value = value.to_string();
        let output = Command::new(&self.command)
            .args(["-d", unit_id, "-c", "1", "-as", channel.as_str(), value.as_str()])
            .output()?;
        if !output.status.success() {
            return Err(Error::Transient(format!(
                "cleware unit {} channel {} switch exited with {}",
                unit_id, channel_id, output.status
            )));
        }
        Ok(())
    }

    fn cutter_type(&self, version: u32) -> Option<&'static CutterType> {
        lookup_type(CLEWARE_TYPES, version)
    }
}

/// Parse the `-l` listing.
///
/// Expected shape:
///
/// ```text
/// Cleware library version: 4.1
/// Number of Cleware devices found: 2
/// Device: 0, type: Switch1 (8), version: 29, serial number: 900142
/// Device: 1, type: Humidity (12), version: 13, serial number: 750331
/// ```
///
/// Only `Switch1` entries are cutters; everything else is ignored.
pub fn parse_probe_output(stdout: &str) -> ClewareResult<Vec<CutterUnit>> {
    let lines: Vec<&str> = stdout.lines().collect();
    if lines.len() < 2
        || !lines[0].contains("Cleware library version:")
        || !lines[1].contains("Number of Cleware devices found:")
    {
        return Err(ClewareError::UnexpectedOutput(stdout.to_string()));
    }

    let mut units = Vec::new();
    for line in &lines[2..] {
        if !line.contains("Switch1") {
            continue;
        }
        // Of the numbers on a Switch1 line, the third is the version and
        // the fourth the serial (the first two are the device index and the
        // parenthesized type code).
        let numbers = digit_runs(line);
        match (numbers.get(2), numbers.get(3)) {
            (Some(version), Some(serial)) => {
                let version: u32 = version
                    .parse()
                    .map_err(|_| ClewareError::UnexpectedOutput((*line).to_string()))?;
                units.push(CutterUnit {
                    version,
                    id: (*serial).to_string(),
                });
            }
            _ => return Err(ClewareError::UnexpectedOutput((*line).to_string())),
        }
    }
    Ok(units)
}

/// Standalone runs of ASCII digits in `s`, in order. A run glued to a
/// letter (the "1" in "Switch1") does not count.
fn digit_runs(s: &str) -> Vec<&str> {
    let mut runs = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            let preceded = start > 0 && bytes[start - 1].is_ascii_alphabetic();
            let followed = i < bytes.len() && bytes[i].is_ascii_alphabetic();
            if !preceded && !followed {
                runs.push(&s[start..i]);
            }
        } else {
            i += 1;
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "Cleware library version: 4.1\n\
                           Number of Cleware devices found: 3\n\
                           Device: 0, type: Switch1 (8), version: 29, serial number: 900142\n\
                           Device: 1, type: Humidity (12), version: 13, serial number: 750331\n\
                           Device: 2, type: Switch1 (8), version: 77, serial number: 900198\n";

    #[test]
    fn test_parse_probe_output() {
        let units = parse_probe_output(LISTING).unwrap();
        // The humidity sensor is not a cutter; the unknown version 77 is
        // still reported here and filtered by the registry.
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], CutterUnit { version: 29, id: "900142".into() });
        assert_eq!(units[1], CutterUnit { version: 77, id: "900198".into() });
    }

    #[test]
    fn test_parse_probe_output_bad_header() {
        assert!(parse_probe_output("whatever\n").is_err());
    }

    #[test]
    fn test_unknown_version_has_no_type() {
        assert!(lookup_type(CLEWARE_TYPES, 77).is_none());
        assert_eq!(lookup_type(CLEWARE_TYPES, 512).unwrap().model, "MainsQuad");
    }

    #[test]
    fn test_digit_runs_skip_glued_digits() {
        assert_eq!(
            digit_runs("Device: 0, type: Switch1 (8), version: 29, serial number: 900142"),
            vec!["0", "8", "29", "900142"]
        );
    }
}
