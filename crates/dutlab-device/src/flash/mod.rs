//! Image flashing
//!
//! Two device families, two strategies, one outer contract: write the image
//! or raise. DFU-family devices are flashed stage by stage over the USB
//! bootloader protocol; PC-class devices mount the image store over NFS
//! from their service OS and copy it onto their own storage. Both retry
//! transient faults internally; once image integrity cannot be guaranteed
//! the whole flash aborts.

pub mod dfu;
pub mod remote;

pub use dfu::{inject_image_key, stage_plan, DfuFlasher, DfuStage};
pub use remote::RemoteImageFlasher;
