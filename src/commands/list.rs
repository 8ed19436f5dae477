//! Listing commands

use std::path::Path;

use dutlab_core::config::LabConfig;
use dutlab_core::device::Availability;
use dutlab_core::error::Result;
use dutlab_cutters::{available_families, CutterSet};
use dutlab_pool::{FleetState, ReservationManager};

pub fn cutters(config: &LabConfig) -> Result<()> {
    println!("Supported cutter families:");
    for family in available_families() {
        println!("  {:10} {}", family.name, family.description);
    }
    println!();

    let set = CutterSet::probe_families(&config.cutter_families)?;
    if set.cutters().is_empty() {
        println!("No cutters attached");
        return Ok(());
    }

    println!("Attached cutters:");
    for cutter in set.cutters() {
        println!(
            "  {:16} {:10} {:16} {} channel(s)",
            cutter.id, cutter.family, cutter.cutter_type.model, cutter.cutter_type.channels
        );
    }
    Ok(())
}

pub fn devices(config: &LabConfig, lock_dir: &Path) -> Result<()> {
    let fleet = FleetState::new(config.devices.clone());
    let manager = ReservationManager::new(lock_dir)?;

    println!(
        "{:16} {:16} {:8} {:12} availability",
        "name", "model", "family", "cutter"
    );
    for (device, (_, availability)) in fleet
        .devices()
        .iter()
        .zip(manager.availability(&fleet)?)
    {
        let availability = match availability {
            Availability::Free => "free".to_string(),
            Availability::Reserved => "reserved".to_string(),
            Availability::Blacklisted { reason } => format!("blacklisted ({})", reason),
        };
        println!(
            "{:16} {:16} {:8} {:12} {}",
            device.name,
            device.model,
            device.family.as_str(),
            format!("{}:{}", device.cutter_id, device.channel_id),
            availability
        );
    }
    Ok(())
}
