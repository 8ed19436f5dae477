//! dutlab-usbrelay - serial USB relay cutter support
//!
//! Drives cheap USB relay boards that show up as a USB serial port and
//! accept fixed on/off frames at 9600 baud. Units are discovered by
//! matching the port's USB vendor/product id against a small allowlist;
//! the port path doubles as the unit id.

mod error;

pub use error::{Result as UsbrelayResult, UsbrelayError};

use std::io::Write;
use std::time::Duration;

use serialport::SerialPortType;

use dutlab_core::cutter::{lookup_type, CutterBackend, CutterType, CutterUnit};
use dutlab_core::error::{Error, Result};

/// (vendor id, product id) pairs of known relay boards
const ACCEPTED_IDS: &[(u16, u16)] = &[(0x0b00, 0x3070), (0x10c4, 0xea60), (0x04d8, 0xffee)];

const BAUD_RATE: u32 = 9600;

/// Relay frames. One preamble byte, then a write-coil frame with its
/// checksum; the board latches until the opposite frame arrives.
const CONNECT_FRAME: (&[u8], &[u8]) = (&[0x64], &[0xFE, 0x05, 0x00, 0x00, 0xFF, 0x00, 0x98, 0x35]);
const DISCONNECT_FRAME: (&[u8], &[u8]) =
    (&[0x6E], &[0xFE, 0x05, 0x00, 0x00, 0x00, 0x00, 0xD9, 0xC5]);

/// The single supported relay board generation.
pub static USBRELAY_TYPES: &[CutterType] = &[CutterType {
    version: 1,
    model: "USB",
    channels: 2,
    connect_value: 1,
    disconnect_value: 0,
    connect_settle: Duration::from_secs(1),
    disconnect_settle: Duration::from_secs(1),
}];

/// Serial USB relay backend.
#[derive(Default)]
pub struct UsbrelayCutter;

impl UsbrelayCutter {
    pub fn open() -> UsbrelayResult<Self> {
        // Nothing to verify up front; enumeration happens at probe time and
        // an empty lab is not an error.
        Ok(Self)
    }

    fn write_frame(&self, port_path: &str, connected: bool) -> UsbrelayResult<()> {
        let (preamble, frame) = if connected {
            CONNECT_FRAME
        } else {
            DISCONNECT_FRAME
        };

        let mut port = serialport::new(port_path, BAUD_RATE)
            .timeout(Duration::from_secs(5))
            .open()?;
        let written = (|| {
            port.write_all(preamble)?;
            port.write_all(frame)?;
            port.flush()
        })();
        written.map_err(|e| UsbrelayError::WriteFailed(format!("{}: {}", port_path, e)))
    }
}

impl CutterBackend for UsbrelayCutter {
    fn family(&self) -> &'static str {
        "usbrelay"
    }

    fn probe(&mut self) -> Result<Vec<CutterUnit>> {
        log::info!("Detecting attached USB relays");
        let ports = serialport::available_ports()
            .map_err(|e| Error::Transient(format!("serial enumeration failed: {}", e)))?;

        let mut units = Vec::new();
        for port in ports {
            if let SerialPortType::UsbPort(usb) = &port.port_type {
                if ACCEPTED_IDS.contains(&(usb.vid, usb.pid)) {
                    log::debug!(
                        "usbrelay at {} (vid {:04x} pid {:04x})",
                        port.port_name,
                        usb.vid,
                        usb.pid
                    );
                    units.push(CutterUnit {
                        version: 1,
                        id: port.port_name.clone(),
                    });
                }
            }
        }
        log::info!("USB relay detection complete, {} unit(s)", units.len());
        Ok(units)
    }

    fn set_channel(&mut self, unit_id: &str, _channel_id: u32, connected: bool) -> Result<()> {
        // The board carries one coil driving its channel pair; the frame
        // does not address individual channels.
        self.write_frame(unit_id, connected)
            .map_err(|e| Error::Transient(e.to_string()))
    }

    fn cutter_type(&self, version: u32) -> Option<&'static CutterType> {
        lookup_type(USBRELAY_TYPES, version)
    }
}
