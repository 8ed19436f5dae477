//! Device model
//!
//! A [`Device`] is one physical unit under test: its topology binding (which
//! cutter channel powers it, which MAC it boots with), its boot modes and the
//! knobs the flashers need. Instances are created once at topology load;
//! `current_mode`/`ip` are only touched by the mode controller actively
//! driving the device, availability only by the reservation pool.

use std::net::IpAddr;
use std::path::PathBuf;

/// Boot configuration a device can be driven into, distinguished by a
/// verifiable signature once booted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Power state and boot mode not trusted (fresh topology load, or a
    /// failed mode entry)
    Unknown,
    /// Maintenance OS with the image store reachable; flashing happens here
    Service,
    /// The freshly written OS image
    Test,
}

impl std::fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceMode::Unknown => write!(f, "unknown"),
            DeviceMode::Service => write!(f, "service"),
            DeviceMode::Test => write!(f, "test"),
        }
    }
}

/// Availability of a device in the reservation pool.
///
/// Owned and mutated exclusively by the reservation manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Free,
    Reserved,
    Blacklisted { reason: String },
}

/// Flashing strategy family a device belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    /// Networked PC-class device; flashed over SSH from its service OS
    Pc,
    /// USB bootloader device; flashed stage by stage over DFU
    Dfu,
}

impl DeviceFamily {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pc" => Some(DeviceFamily::Pc),
            "dfu" => Some(DeviceFamily::Dfu),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceFamily::Pc => "pc",
            DeviceFamily::Dfu => "dfu",
        }
    }
}

/// One boot mode: the keystroke sequence that selects it and the signature
/// string that proves the device ended up in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeSpec {
    /// Mode name, e.g. "service"
    pub name: String,
    /// Keystroke sequence file replayed by the injector to select this mode
    pub keystrokes: PathBuf,
    /// Substring expected in the probe command output once booted, e.g. a
    /// kernel version tag
    pub signature: String,
}

/// Keystroke injector binding for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectorConfig {
    /// Interface the injector hardware is attached to
    pub interface: String,
    /// Port on that interface
    pub port: String,
}

/// Extra settings for DFU-family devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuConfig {
    /// USB topology path the unit enumerates on in DFU mode
    pub usb_path: String,
    /// Filename extension of the boot partition image
    pub boot_extension: String,
    /// Filename extension of the update partition image
    pub update_extension: String,
    /// Filename extension of the root partition image
    pub root_extension: String,
}

/// One physical device under test, as described by the topology file.
#[derive(Debug, Clone)]
pub struct Device {
    /// Unique device name, e.g. "minnow-3"
    pub name: String,
    /// Model name, matched against reservation constraints and the catalog
    pub model: String,
    /// Flashing strategy family
    pub family: DeviceFamily,
    /// Cutter unit powering this device
    pub cutter_id: String,
    /// Channel on that cutter
    pub channel_id: u32,
    /// Hardware identifier used to find the device in the DHCP lease table
    /// (MAC address, lowercase)
    pub hardware_id: String,
    /// DHCP lease table to poll for this device
    pub leases_file: PathBuf,
    /// Keystroke injector binding
    pub injector: InjectorConfig,
    /// Keystroke file used by configuration checks only
    pub check_keystrokes: PathBuf,
    /// Service mode descriptor
    pub service_mode: ModeSpec,
    /// Test mode descriptor
    pub test_mode: ModeSpec,
    /// Block device the image is written to
    pub target_device: String,
    /// Default root partition path, used when the image ships no layout file
    pub root_partition: String,
    /// Probe command whose output carries the mode signature
    pub probe_command: Vec<String>,
    /// DFU settings; present only for the Dfu family
    pub dfu: Option<DfuConfig>,

    /// Mode the device was last verified in
    pub current_mode: DeviceMode,
    /// Responsive address from the last successful boot
    pub ip: Option<IpAddr>,
}

impl Device {
    /// Mode spec by mode, for callers that select modes dynamically.
    pub fn mode_spec(&self, mode: DeviceMode) -> Option<&ModeSpec> {
        match mode {
            DeviceMode::Service => Some(&self.service_mode),
            DeviceMode::Test => Some(&self.test_mode),
            DeviceMode::Unknown => None,
        }
    }
}
