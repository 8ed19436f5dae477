//! Subcommand implementations

pub mod blacklist;
pub mod check;
pub mod flash;
pub mod list;
pub mod power;

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner for the long phases (mode entry, image writing); these can run
/// for minutes with nothing on stdout otherwise.
pub fn phase_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
