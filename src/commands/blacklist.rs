//! Blacklist administration

use std::path::Path;

use dutlab_core::config::LabConfig;
use dutlab_core::error::Result;
use dutlab_pool::{FleetState, ReservationManager};

use crate::cli::BlacklistCommands;

pub fn run(config: &LabConfig, lock_dir: &Path, command: BlacklistCommands) -> Result<()> {
    let fleet = FleetState::new(config.devices.clone());
    let manager = ReservationManager::new(lock_dir)?;

    match command {
        BlacklistCommands::Add { device, reason } => {
            manager.blacklist(&fleet, &device, &reason)?;
            println!("{} blacklisted: {}", device, reason);
        }
        BlacklistCommands::Remove { device } => {
            manager.unblacklist(&device)?;
            println!("{} back in rotation", device);
        }
        BlacklistCommands::Show => {
            let entries = manager.list_blacklisted()?;
            if entries.is_empty() {
                println!("Blacklist is empty");
            } else {
                for entry in entries {
                    println!("{:20} {}", entry.device, entry.reason);
                }
            }
        }
    }
    Ok(())
}
