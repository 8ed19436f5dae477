//! Manual cutter channel control

use std::thread;

use dutlab_core::config::LabConfig;
use dutlab_core::error::Result;
use dutlab_cutters::CutterSet;
use dutlab_device::mode::POWER_OFF_DELAY;

use crate::cli::PowerAction;

pub fn run(config: &LabConfig, cutter: &str, channel_id: u32, action: PowerAction) -> Result<()> {
    let cutters = CutterSet::probe_families(&config.cutter_families)?;
    let mut channel = cutters.channel(cutter, channel_id)?;

    match action {
        PowerAction::On => {
            channel.connect()?;
            println!("{}:{} connected", cutter, channel_id);
        }
        PowerAction::Off => {
            channel.disconnect()?;
            println!("{}:{} disconnected", cutter, channel_id);
        }
        PowerAction::Cycle => {
            channel.disconnect()?;
            thread::sleep(POWER_OFF_DELAY);
            channel.connect()?;
            println!("{}:{} power cycled", cutter, channel_id);
        }
    }
    Ok(())
}
