//! The main flow: reserve, flash, boot into the written image

use std::path::{Path, PathBuf};
use std::time::Duration;

use dutlab_core::config::LabConfig;
use dutlab_core::device::{DeviceFamily, DeviceMode};
use dutlab_core::error::{Error, Result};
use dutlab_cutters::CutterSet;
use dutlab_device::flash::{inject_image_key, DfuFlasher, RemoteImageFlasher};
use dutlab_device::{ModeController, OpenSsh, PemInjector};
use dutlab_pool::{Constraints, FleetState, ReservationManager};

use super::phase_spinner;

/// Public key planted in DFU-family images before flashing
const HARNESS_KEY_FILE: &str = "/etc/dutlab/authorized_keys";

pub struct FlashRequest {
    pub machine: Option<String>,
    pub device: Option<String>,
    pub image: PathBuf,
    pub wait: Option<u64>,
    pub no_poweroff: bool,
    pub no_flash: bool,
}

pub fn run(config: &LabConfig, lock_dir: &Path, request: FlashRequest) -> Result<()> {
    if request.machine.is_none() && request.device.is_none() {
        return Err(Error::Config(
            "either --machine or --device must be given".into(),
        ));
    }

    let cutters = CutterSet::probe_families(&config.cutter_families)?;
    let mut fleet = FleetState::new(config.devices.clone());
    let manager = ReservationManager::new(lock_dir)?;

    let constraints = Constraints {
        model: request.machine.clone(),
        name: request.device.clone(),
    };
    let lease = manager.reserve(
        &fleet,
        &constraints,
        request.wait.map(Duration::from_secs),
    )?;
    println!("Reserved {}", lease.device());

    let device_name = lease.device().to_string();
    let device = fleet
        .device_mut(&device_name)
        .ok_or_else(|| Error::Config(format!("leased device {} not in fleet", device_name)))?;
    let mut channel = cutters.channel(&device.cutter_id, device.channel_id)?;
    let injector = PemInjector::new();
    let shell = OpenSsh::new();

    if request.no_flash {
        log::info!("skipping the flashing step");
    } else {
        match device.family {
            DeviceFamily::Pc => {
                let nfs_dir = config.nfs_dir.as_deref().ok_or_else(|| {
                    Error::Config("topology sets no nfs_dir; flashing needs the NFS export".into())
                })?;

                let pb = phase_spinner(&format!("entering service mode on {}", device_name));
                ModeController::new(&mut channel, &injector, &shell)
                    .enter_mode(device, DeviceMode::Service)?;
                pb.finish_with_message("service mode reached");

                let pb = phase_spinner(&format!("writing {}", request.image.display()));
                RemoteImageFlasher::new(&shell, nfs_dir).flash(device, &request.image)?;
                pb.finish_with_message("image written");
            }
            DeviceFamily::Dfu => {
                let dfu = device.dfu.clone().ok_or_else(|| {
                    Error::Config(format!("device {} has no dfu settings", device_name))
                })?;
                inject_image_key(
                    &request.image,
                    &dfu,
                    Path::new(HARNESS_KEY_FILE),
                    &std::env::temp_dir().join("dutlab-root-mount"),
                )?;

                let pb = phase_spinner(&format!("flashing {} over DFU", device_name));
                DfuFlasher::new(&mut channel).flash(device, &request.image)?;
                pb.finish_with_message("image written");
            }
        }
    }

    // Boot into the freshly written system.
    match device.family {
        DeviceFamily::Pc => {
            let pb = phase_spinner(&format!("entering test mode on {}", device_name));
            ModeController::new(&mut channel, &injector, &shell)
                .enter_mode(device, DeviceMode::Test)?;
            pb.finish_with_message("test mode reached");
        }
        DeviceFamily::Dfu => {
            // The last DFU stage leaves the unit resetting into the new
            // image; a power cycle gives it a clean start.
            ModeController::new(&mut channel, &injector, &shell).power_cycle()?;
        }
    }

    if !request.no_poweroff {
        channel.disconnect()?;
        println!("{} powered off", device_name);
    }

    drop(lease);
    println!("Done.");
    Ok(())
}
