//! dutlab-core - shared types for the dutlab device-lab harness
//!
//! This crate holds everything the other dutlab crates agree on: the device
//! and cutter data model, the central error taxonomy, topology/catalog
//! configuration loading and the trait boundaries behind which the hardware
//! backends (power cutters, remote shells, keystroke injectors) live.

pub mod config;
pub mod cutter;
pub mod device;
pub mod error;
pub mod remote;

pub use cutter::{CutterBackend, CutterType, CutterUnit, PowerChannel};
pub use device::{
    Availability, Device, DeviceFamily, DeviceMode, DfuConfig, InjectorConfig, ModeSpec,
};
pub use error::{Error, Result};
pub use remote::{RemoteOutput, RemoteShell};
