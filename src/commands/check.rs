//! Device configuration checks
//!
//! A lab grows by plugging in hardware and editing the topology, and both
//! steps go wrong silently: a keystroke injector wired to the wrong port, a
//! cutter channel powering a different device. The checks exercise the
//! wiring end to end. The fast check only proves the injector answers once
//! the device is powered; `--accurate` also boots into service mode (with a
//! reduced attempt budget) and verifies the device actually dies when its
//! channel opens.

use std::path::Path;
use std::time::Duration;

use dutlab_core::config::LabConfig;
use dutlab_core::device::{Device, DeviceMode};
use dutlab_core::error::{Error, Result};
use dutlab_cutters::CutterSet;
use dutlab_core::cutter::PowerChannel;
use dutlab_device::injector::Injector;
use dutlab_device::mode::{ModeController, CHECK_RETRY_ATTEMPTS, POWER_OFF_DELAY};
use dutlab_device::{OpenSsh, PemInjector};
use dutlab_pool::{Constraints, FleetState, ReservationManager};

/// Injector attempt budget and per-attempt timeout while checking power
const POWERON_ATTEMPTS: u32 = 2;
const POWERON_TIMEOUT: Duration = Duration::from_secs(60);
/// After power-off the injector must be dead well before this
const POWEROFF_TIMEOUT: Duration = Duration::from_secs(20);

pub fn run_one(config: &LabConfig, lock_dir: &Path, device_name: &str, accurate: bool) -> Result<()> {
    let cutters = CutterSet::probe_families(&config.cutter_families)?;
    let mut fleet = FleetState::new(config.devices.clone());
    let manager = ReservationManager::new(lock_dir)?;

    let lease = manager.reserve(
        &fleet,
        &Constraints {
            name: Some(device_name.to_string()),
            model: None,
        },
        Some(Duration::from_secs(0)),
    )?;

    let device = fleet
        .device_mut(device_name)
        .ok_or_else(|| Error::Config(format!("unknown device {:?}", device_name)))?;
    let mut channel = cutters.channel(&device.cutter_id, device.channel_id)?;

    let result = check_device(device, &mut channel, accurate);
    drop(lease);

    match result {
        Ok(()) => {
            println!("{}: OK", device_name);
            Ok(())
        }
        Err(e) => {
            println!("{}: FAILED ({})", device_name, e);
            Err(e)
        }
    }
}

pub fn run_all(config: &LabConfig, lock_dir: &Path, accurate: bool) -> Result<()> {
    let cutters = CutterSet::probe_families(&config.cutter_families)?;
    let mut fleet = FleetState::new(config.devices.clone());
    let manager = ReservationManager::new(lock_dir)?;

    let names: Vec<String> = fleet.devices().iter().map(|d| d.name.clone()).collect();
    let mut failures = 0;

    for name in names {
        let lease = match manager.reserve(
            &fleet,
            &Constraints {
                name: Some(name.clone()),
                model: None,
            },
            Some(Duration::from_secs(0)),
        ) {
            Ok(lease) => lease,
            Err(e) => {
                println!("{}: SKIPPED ({})", name, e);
                continue;
            }
        };

        let device = fleet
            .device_mut(&name)
            .ok_or_else(|| Error::Config(format!("unknown device {:?}", name)))?;
        let mut channel = cutters.channel(&device.cutter_id, device.channel_id)?;

        match check_device(device, &mut channel, accurate) {
            Ok(()) => println!("{}: OK", name),
            Err(e) => {
                println!("{}: FAILED ({})", name, e);
                failures += 1;
            }
        }
        drop(lease);
    }

    if failures > 0 {
        log::info!("{} device(s) failed their checks", failures);
        std::process::exit(1);
    }
    log::info!("all checks passed");
    Ok(())
}

fn check_device(device: &mut Device, channel: &mut PowerChannel, accurate: bool) -> Result<()> {
    let injector = PemInjector::new();
    let shell = OpenSsh::new();

    check_poweron(device, channel, &injector, &shell)?;
    if accurate {
        check_connection(device, channel, &injector, &shell)?;
        check_poweroff(device, channel, &injector)?;
    }
    Ok(())
}

/// The injector is powered by the device, so a reachable injector after a
/// power cycle is the cheapest proof the device actually came up.
fn check_poweron(
    device: &Device,
    channel: &mut PowerChannel,
    injector: &PemInjector,
    shell: &OpenSsh,
) -> Result<()> {
    log::info!("checking that {} powers on", device.name);
    ModeController::new(channel, injector, shell).power_cycle()?;

    injector
        .inject(
            &device.injector.interface,
            &device.injector.port,
            &device.check_keystrokes,
            POWERON_ATTEMPTS,
            POWERON_TIMEOUT,
        )
        .map_err(|_| {
            Error::Config(format!(
                "cannot reach the injector of {}; check power and injector wiring",
                device.name
            ))
        })
}

/// Boot into service mode with the reduced budget; with the full one a
/// dead device would hold the check for 2 * 8 * 240 seconds.
fn check_connection(
    device: &mut Device,
    channel: &mut PowerChannel,
    injector: &PemInjector,
    shell: &OpenSsh,
) -> Result<()> {
    log::info!("checking that {} reaches service mode", device.name);
    ModeController::new(channel, injector, shell)
        .attempts(CHECK_RETRY_ATTEMPTS)
        .enter_mode(device, DeviceMode::Service)?;
    Ok(())
}

/// With the channel open the injector must go dark; if it still answers,
/// the device is powered from somewhere this harness does not control.
fn check_poweroff(
    device: &Device,
    channel: &mut PowerChannel,
    injector: &PemInjector,
) -> Result<()> {
    log::info!("checking that {} powers off", device.name);
    channel.disconnect()?;
    std::thread::sleep(POWER_OFF_DELAY);

    match injector.inject(
        &device.injector.interface,
        &device.injector.port,
        &device.check_keystrokes,
        1,
        POWEROFF_TIMEOUT,
    ) {
        Err(_) => Ok(()),
        Ok(()) => Err(Error::Config(format!(
            "{} seems to have stayed powered; its injector still answers",
            device.name
        ))),
    }
}
