//! CLI argument parsing

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dutlab")]
#[command(author, version, about = "Device-lab flashing and reservation harness", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Topology file describing the physically attached devices
    #[arg(long, global = true, default_value = "/etc/dutlab/topology.toml")]
    pub topology: PathBuf,

    /// Catalog file describing the supported device models
    #[arg(long, global = true, default_value = "/etc/dutlab/catalog.toml")]
    pub catalog: PathBuf,

    /// Directory holding lease files and the blacklist; all invocations
    /// arbitrating over the same devices must share it
    #[arg(long, global = true, default_value = "/var/lock/dutlab")]
    pub lock_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reserve a device, flash an image, boot into it
    Flash {
        /// Model to reserve (any free device of this model)
        #[arg(short, long)]
        machine: Option<String>,

        /// Specific device to reserve, by name
        #[arg(short, long)]
        device: Option<String>,

        /// Image to write; must live under the NFS-exported directory
        #[arg(short, long)]
        image: PathBuf,

        /// Give up reserving after this many seconds (0 = fail at once;
        /// default: wait indefinitely)
        #[arg(long)]
        wait: Option<u64>,

        /// Leave the device powered on afterwards
        #[arg(long)]
        no_poweroff: bool,

        /// Reserve and boot, but skip the flashing step
        #[arg(long)]
        no_flash: bool,
    },

    /// Check that one device is wired and configured correctly
    Check {
        /// Device name from the topology
        device: String,

        /// Also boot into service mode and verify power-off (slow)
        #[arg(long)]
        accurate: bool,
    },

    /// Check every configured device
    CheckAll {
        /// Also boot into service mode and verify power-off (slow)
        #[arg(long)]
        accurate: bool,
    },

    /// Manage the persistent device blacklist
    #[command(subcommand)]
    Blacklist(BlacklistCommands),

    /// Probe and list attached cutters
    ListCutters,

    /// List configured devices and their availability
    ListDevices,

    /// Drive one cutter channel by hand
    Power {
        /// Cutter unit id
        #[arg(long)]
        cutter: String,

        /// Channel on that cutter
        #[arg(long)]
        channel: u32,

        /// What to do with the channel
        action: PowerAction,
    },
}

#[derive(Subcommand)]
pub enum BlacklistCommands {
    /// Take a device out of rotation
    Add {
        /// Device name from the topology
        device: String,

        /// Why the device is being pulled
        #[arg(long, default_value = "no reason given")]
        reason: String,
    },

    /// Put a device back into rotation
    Remove {
        /// Device name from the topology
        device: String,
    },

    /// Print the blacklist
    Show,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PowerAction {
    On,
    Off,
    Cycle,
}
