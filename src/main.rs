//! dutlab - device-lab flashing and reservation harness
//!
//! Operates a lab of power-switched test devices: probes the USB power
//! cutters, forces a reserved device into a verified boot mode, writes an
//! OS image over DFU or through the device's service OS, and arbitrates
//! exclusive device ownership between independent invocations through
//! advisory file locks.
//!
//! # Architecture
//!
//! - `dutlab-core` - data model, error taxonomy, topology/catalog loading
//! - `dutlab-cutters` + one crate per relay family - power control
//! - `dutlab-device` - mode entry, keystroke injection, flashing
//! - `dutlab-pool` - cross-process reservations and the blacklist

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use dutlab_core::config;
use dutlab_core::error::Error;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    if let Err(e) = run(cli) {
        log::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(exit_code(&e));
    }
}

fn run(cli: Cli) -> dutlab_core::error::Result<()> {
    // Configuration problems are fatal before any hardware is touched.
    let config = config::load(&cli.topology, &cli.catalog)?;
    log::info!(
        "loaded {} device(s), {} cutter family(s)",
        config.devices.len(),
        config.cutter_families.len()
    );

    match cli.command {
        Commands::Flash {
            machine,
            device,
            image,
            wait,
            no_poweroff,
            no_flash,
        } => commands::flash::run(
            &config,
            &cli.lock_dir,
            commands::flash::FlashRequest {
                machine,
                device,
                image,
                wait,
                no_poweroff,
                no_flash,
            },
        ),
        Commands::Check { device, accurate } => {
            commands::check::run_one(&config, &cli.lock_dir, &device, accurate)
        }
        Commands::CheckAll { accurate } => {
            commands::check::run_all(&config, &cli.lock_dir, accurate)
        }
        Commands::Blacklist(subcmd) => commands::blacklist::run(&config, &cli.lock_dir, subcmd),
        Commands::ListCutters => commands::list::cutters(&config),
        Commands::ListDevices => commands::list::devices(&config, &cli.lock_dir),
        Commands::Power {
            cutter,
            channel,
            action,
        } => commands::power::run(&config, &cutter, channel, action),
    }
}

/// Each failure class gets its own exit status so callers can tell a busy
/// lab from a dead device without parsing logs.
fn exit_code(e: &Error) -> i32 {
    match e {
        Error::Config(_) => 2,
        Error::Reservation(_) => 3,
        Error::ModeEntry { .. } => 4,
        Error::Flashing(_) => 5,
        _ => 1,
    }
}
