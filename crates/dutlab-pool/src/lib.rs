//! dutlab-pool - exclusive device ownership across harness invocations
//!
//! Every test run is its own OS process, so the pool cannot rely on
//! in-memory synchronization: exclusivity is arbitrated through advisory
//! file locks under a shared lock directory, one lease file per device.
//! The kernel drops a crashed holder's lock with its last file descriptor,
//! which is exactly the stale-lease policy: a lease is valid as long as its
//! holder is alive, and not a second longer.

mod blacklist;
mod fleet;
mod reserve;

pub use blacklist::BlacklistEntry;
pub use fleet::FleetState;
pub use reserve::{Constraints, Lease, ReservationManager, RESERVATION_POLL_INTERVAL};
