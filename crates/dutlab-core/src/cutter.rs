//! Power cutter abstraction
//!
//! A *cutter* is a physical USB/relay unit controlling power to one or more
//! channels; a *channel* is one switchable line, typically wired to one
//! device under test. Concrete relay families (Cleware, usbrelay, the dummy
//! emulator) implement [`CutterBackend`]; everything above works with
//! [`PowerChannel`] handles and never sees the vendor tooling.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};

/// Immutable descriptor for one supported relay model.
///
/// Each driver carries a static table of these, looked up by the version
/// number the hardware reports at probe time. An unknown version means the
/// unit is skipped, never that probing fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutterType {
    /// Version number reported by the probed hardware
    pub version: u32,
    /// Relay model name, e.g. "USB" or "MainsQuad"
    pub model: &'static str,
    /// Number of switchable channels on this model
    pub channels: u32,
    /// Value the vendor tool expects for "close the relay"
    pub connect_value: u8,
    /// Value the vendor tool expects for "open the relay"
    pub disconnect_value: u8,
    /// Settle time after closing the relay
    pub connect_settle: Duration,
    /// Settle time after opening the relay; not necessarily the same as
    /// closing, mains relays open faster than they close
    pub disconnect_settle: Duration,
}

/// Look up a cutter type by reported version number.
pub fn lookup_type(table: &'static [CutterType], version: u32) -> Option<&'static CutterType> {
    table.iter().find(|t| t.version == version)
}

/// One physical relay unit found while probing a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CutterUnit {
    /// Version number the hardware reported
    pub version: u32,
    /// Unit identifier, unique within the family (serial number or device
    /// node path, whatever the vendor tooling addresses units by)
    pub id: String,
}

/// Capability interface implemented once per relay hardware family.
///
/// Selected at configuration time through the registry in `dutlab-cutters`,
/// keyed by family name.
pub trait CutterBackend: Send {
    /// Family name this backend is registered under
    fn family(&self) -> &'static str;

    /// Enumerate attached units of this family.
    ///
    /// Units whose version has no entry in the family's type table are NOT
    /// filtered here; the registry logs and skips them.
    fn probe(&mut self) -> Result<Vec<CutterUnit>>;

    /// Drive one channel of one unit to the requested state.
    ///
    /// A non-zero status from the underlying tool maps to
    /// [`Error::Transient`]; the channel state is unknown afterwards and the
    /// caller decides whether to retry.
    fn set_channel(&mut self, unit_id: &str, channel_id: u32, connected: bool) -> Result<()>;

    /// Look up this family's type descriptor for a reported version.
    fn cutter_type(&self, version: u32) -> Option<&'static CutterType>;
}

/// Shared handle to a probed backend, cloned into every [`PowerChannel`]
/// that unit serves.
pub type SharedBackend = Arc<Mutex<Box<dyn CutterBackend>>>;

/// A single switchable power line on a relay unit.
///
/// Created by the cutter registry at probe time. Connect/disconnect issue
/// the hardware command and then block for the type's settle time; the relay
/// itself latches, so repeating a command is a no-op beyond the delay.
pub struct PowerChannel {
    backend: SharedBackend,
    cutter_id: String,
    channel_id: u32,
    cutter_type: &'static CutterType,
    connected: Option<bool>,
}

impl PowerChannel {
    pub fn new(
        backend: SharedBackend,
        cutter_id: String,
        channel_id: u32,
        cutter_type: &'static CutterType,
    ) -> Self {
        Self {
            backend,
            cutter_id,
            channel_id,
            cutter_type,
            connected: None,
        }
    }

    /// Identifier of the cutter unit this channel belongs to
    pub fn cutter_id(&self) -> &str {
        &self.cutter_id
    }

    /// Channel index on the cutter unit
    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Descriptor of the relay model backing this channel
    pub fn cutter_type(&self) -> &'static CutterType {
        self.cutter_type
    }

    /// Last commanded state; `None` until the first successful command or
    /// after a failed one (relay state unknown).
    pub fn is_connected(&self) -> Option<bool> {
        self.connected
    }

    /// Close the relay, then wait out the connect settle time.
    pub fn connect(&mut self) -> Result<()> {
        self.switch(true, self.cutter_type.connect_settle)
    }

    /// Open the relay, then wait out the disconnect settle time.
    pub fn disconnect(&mut self) -> Result<()> {
        self.switch(false, self.cutter_type.disconnect_settle)
    }

    fn switch(&mut self, target: bool, settle: Duration) -> Result<()> {
        let result = {
            let mut backend = self
                .backend
                .lock()
                .map_err(|_| Error::Transient("cutter backend mutex poisoned".into()))?;
            backend.set_channel(&self.cutter_id, self.channel_id, target)
        };

        match result {
            Ok(()) => {
                thread::sleep(settle);
                self.connected = Some(target);
                Ok(())
            }
            Err(e) => {
                self.connected = None;
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for PowerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerChannel")
            .field("cutter_id", &self.cutter_id)
            .field("channel_id", &self.channel_id)
            .field("model", &self.cutter_type.model)
            .field("connected", &self.connected)
            .finish()
    }
}
