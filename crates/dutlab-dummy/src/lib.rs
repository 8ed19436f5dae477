//! dutlab-dummy - in-memory cutter emulator
//!
//! Emulates a relay family without hardware. Used by the test suites of the
//! other crates, and registered as the "noop" family for lab hosts that have
//! no power control at all (every switch succeeds and nothing happens).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dutlab_core::cutter::{lookup_type, CutterBackend, CutterType, CutterUnit};
use dutlab_core::error::{Error, Result};

/// Type table for the emulated family. Two entries so tests can cover both
/// the known-version and unknown-version probe paths; settle times are kept
/// short but distinct per direction.
pub static DUMMY_CUTTER_TYPES: &[CutterType] = &[
    CutterType {
        version: 1,
        model: "USB",
        channels: 2,
        connect_value: 1,
        disconnect_value: 0,
        connect_settle: Duration::from_millis(30),
        disconnect_settle: Duration::from_millis(10),
    },
    CutterType {
        version: 4,
        model: "Quad",
        channels: 4,
        connect_value: 1,
        disconnect_value: 0,
        connect_settle: Duration::from_millis(30),
        disconnect_settle: Duration::from_millis(10),
    },
];

/// One recorded switch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchOp {
    pub unit_id: String,
    pub channel_id: u32,
    pub connected: bool,
}

/// Shared, inspectable emulator state.
///
/// The registry takes ownership of the backend, so tests keep a clone of
/// this handle to script failures and read back what happened.
#[derive(Debug, Default)]
pub struct DummyState {
    /// Every switch operation in issue order
    pub switch_log: Vec<SwitchOp>,
    /// Latched state per (unit, channel)
    pub channel_states: HashMap<(String, u32), bool>,
    /// Next N switch operations fail with a transient error
    pub failures_remaining: u32,
}

/// Configuration for the dummy cutter
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Units reported by probe, as (version, unit id)
    pub units: Vec<(u32, String)>,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            units: vec![(1, "dummy-0".to_string())],
        }
    }
}

/// In-memory cutter backend.
pub struct DummyCutter {
    config: DummyConfig,
    state: Arc<Mutex<DummyState>>,
}

impl DummyCutter {
    pub fn new(config: DummyConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(DummyState::default())),
        }
    }

    /// One unit, version 1 (2 channels)
    pub fn new_default() -> Self {
        Self::new(DummyConfig::default())
    }

    /// Handle to the shared state, for inspection after the registry has
    /// taken ownership of the backend.
    pub fn state(&self) -> Arc<Mutex<DummyState>> {
        Arc::clone(&self.state)
    }

    /// Make the next `n` switch operations fail.
    pub fn fail_next(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.failures_remaining = n;
        }
    }
}

impl CutterBackend for DummyCutter {
    fn family(&self) -> &'static str {
        "dummy"
    }

    fn probe(&mut self) -> Result<Vec<CutterUnit>> {
        Ok(self
            .config
            .units
            .iter()
            .map(|(version, id)| CutterUnit {
                version: *version,
                id: id.clone(),
            })
            .collect())
    }

    fn set_channel(&mut self, unit_id: &str, channel_id: u32, connected: bool) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Transient("dummy state mutex poisoned".into()))?;

        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(Error::Transient(format!(
                "dummy cutter {} channel {} refused to switch",
                unit_id, channel_id
            )));
        }

        state.switch_log.push(SwitchOp {
            unit_id: unit_id.to_string(),
            channel_id,
            connected,
        });
        state
            .channel_states
            .insert((unit_id.to_string(), channel_id), connected);
        Ok(())
    }

    fn cutter_type(&self, version: u32) -> Option<&'static CutterType> {
        lookup_type(DUMMY_CUTTER_TYPES, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_reports_configured_units() {
        let mut cutter = DummyCutter::new(DummyConfig {
            units: vec![(1, "a".into()), (4, "b".into())],
        });
        let units = cutter.probe().unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].id, "b");
        assert_eq!(units[1].version, 4);
    }

    #[test]
    fn test_switch_records_and_latches() {
        let mut cutter = DummyCutter::new_default();
        let state = cutter.state();

        cutter.set_channel("dummy-0", 0, true).unwrap();
        cutter.set_channel("dummy-0", 0, false).unwrap();

        let s = state.lock().unwrap();
        assert_eq!(s.switch_log.len(), 2);
        assert_eq!(s.channel_states[&("dummy-0".to_string(), 0)], false);
    }

    #[test]
    fn test_scripted_failures_then_recovery() {
        let mut cutter = DummyCutter::new_default();
        cutter.fail_next(2);

        assert!(cutter.set_channel("dummy-0", 1, true).is_err());
        assert!(cutter.set_channel("dummy-0", 1, true).is_err());
        assert!(cutter.set_channel("dummy-0", 1, true).is_ok());
    }
}
