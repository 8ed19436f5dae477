//! dutlab-device - driving one device under test
//!
//! Everything that happens to a single, already-reserved device lives here:
//! forcing it into a verified boot mode (power cycle, keystroke injection,
//! DHCP polling, signature check), and writing an OS image to its storage
//! through whichever strategy its family uses (DFU stages or a remote
//! mount-and-copy over SSH).

pub mod flash;
pub mod injector;
pub mod leases;
pub mod mode;
pub mod proc;
pub mod ssh;

pub use injector::{Injector, PemInjector};
pub use mode::ModeController;
pub use ssh::OpenSsh;
