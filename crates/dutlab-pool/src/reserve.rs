//! Reservation manager
//!
//! Exclusive ownership of a device is one flocked file under the lock
//! directory. Acquiring the lease is a single non-blocking exclusive flock:
//! whichever process gets the lock owns the device, however many rivals
//! raced it, and there is no separate read-select-mark window to go wrong.
//! The file records the holder's pid for diagnostics; the lock itself dies
//! with the holder, so a crashed run leaves nothing to clean up.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use dutlab_core::device::{Availability, Device};
use dutlab_core::error::{Error, Result};

use crate::blacklist::{self, BlacklistEntry, BlacklistFile};
use crate::fleet::FleetState;

/// How often a blocked reserve() re-scans the pool
pub const RESERVATION_POLL_INTERVAL: Duration = Duration::from_secs(10);

const BLACKLIST_FILE: &str = "blacklist.toml";

/// What the caller is asking for. Empty constraints match every device.
#[derive(Debug, Default, Clone)]
pub struct Constraints {
    /// Restrict to one model
    pub model: Option<String>,
    /// Restrict to one named device
    pub name: Option<String>,
}

impl Constraints {
    pub fn matches(&self, device: &Device) -> bool {
        if let Some(model) = &self.model {
            if !device.model.eq_ignore_ascii_case(model) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if device.name != *name {
                return false;
            }
        }
        true
    }
}

/// An exclusively held device.
///
/// Dropping the lease releases the flock and with it the device. The lease
/// file itself stays behind: unlinking it would let a racing process lock
/// the orphaned inode while a third one re-creates the path, and two
/// holders is the one thing this module exists to prevent.
pub struct Lease {
    device_name: String,
    holder_pid: u32,
    acquired_at: SystemTime,
    _lock: Flock<File>,
}

impl Lease {
    pub fn device(&self) -> &str {
        &self.device_name
    }

    pub fn holder_pid(&self) -> u32 {
        self.holder_pid
    }

    pub fn acquired_at(&self) -> SystemTime {
        self.acquired_at
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("device", &self.device_name)
            .field("holder_pid", &self.holder_pid)
            .finish()
    }
}

/// Grants leases and maintains the blacklist.
pub struct ReservationManager {
    lock_dir: PathBuf,
    blacklist_path: PathBuf,
}

impl ReservationManager {
    pub fn new(lock_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(lock_dir)?;
        Ok(Self {
            lock_dir: lock_dir.to_path_buf(),
            blacklist_path: lock_dir.join(BLACKLIST_FILE),
        })
    }

    /// Reserve a device matching `constraints`.
    ///
    /// `wait = None` blocks until a device frees up; `Some(d)` gives up
    /// after `d` (zero means a single pass). Constraints that match no
    /// configured device at all fail immediately regardless of `wait`, as
    /// does a match set that is entirely blacklisted.
    pub fn reserve(
        &self,
        fleet: &FleetState,
        constraints: &Constraints,
        wait: Option<Duration>,
    ) -> Result<Lease> {
        self.reserve_with_interval(fleet, constraints, wait, RESERVATION_POLL_INTERVAL)
    }

    pub fn reserve_with_interval(
        &self,
        fleet: &FleetState,
        constraints: &Constraints,
        wait: Option<Duration>,
        poll_interval: Duration,
    ) -> Result<Lease> {
        let deadline = wait.map(|w| Instant::now() + w);

        loop {
            let blacklist = blacklist::load(&self.blacklist_path)?;

            let matching: Vec<&Device> = fleet
                .devices()
                .iter()
                .filter(|d| constraints.matches(d))
                .collect();
            if matching.is_empty() {
                return Err(Error::Reservation(format!(
                    "no configured device matches {:?}",
                    constraints
                )));
            }

            let eligible: Vec<&Device> = matching
                .iter()
                .copied()
                .filter(|d| !is_blacklisted(&blacklist, &d.name))
                .collect();
            if eligible.is_empty() {
                return Err(Error::Reservation(format!(
                    "every device matching {:?} is blacklisted",
                    constraints
                )));
            }

            for device in &eligible {
                if let Some(lease) = self.try_acquire(&device.name)? {
                    log::info!("reserved {} (pid {})", lease.device_name, lease.holder_pid);
                    return Ok(lease);
                }
            }

            match deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    return Err(Error::Reservation(format!(
                        "devices matching {:?} stayed busy past the deadline",
                        constraints
                    )));
                }
                _ => {
                    log::debug!("all matching devices busy, retrying");
                    thread::sleep(poll_interval);
                }
            }
        }
    }

    /// One non-blocking exclusive flock on the device's lease file.
    ///
    /// `Ok(None)` means a live process holds the device. A lease file left
    /// behind by a dead holder carries no lock and is taken over here.
    fn try_acquire(&self, device_name: &str) -> Result<Option<Lease>> {
        let path = self.lease_path(device_name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                let holder_pid = std::process::id();
                lock.set_len(0)?;
                let mut writer: &File = &lock;
                writer.write_all(format!("{}\n", holder_pid).as_bytes())?;
                Ok(Some(Lease {
                    device_name: device_name.to_string(),
                    holder_pid,
                    acquired_at: SystemTime::now(),
                    _lock: lock,
                }))
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Ok(None),
            Err((_, errno)) => Err(Error::Reservation(format!(
                "cannot lock {}: {}",
                path.display(),
                errno
            ))),
        }
    }

    /// Whether some live process currently holds the device.
    fn is_leased(&self, device_name: &str) -> bool {
        let path = self.lease_path(device_name);
        let Ok(file) = File::open(&path) else {
            return false;
        };
        match Flock::lock(file, FlockArg::LockSharedNonblock) {
            // lock dropped immediately, we only wanted the answer
            Ok(_) => false,
            Err((_, errno)) => errno == Errno::EWOULDBLOCK,
        }
    }

    fn lease_path(&self, device_name: &str) -> PathBuf {
        self.lock_dir.join(format!("{}.lease", device_name))
    }

    /// Take a device out of rotation. Takes effect for every process on
    /// this host from its next reservation pass.
    pub fn blacklist(&self, fleet: &FleetState, device_name: &str, reason: &str) -> Result<()> {
        if fleet.device(device_name).is_none() {
            return Err(Error::Config(format!(
                "cannot blacklist unknown device {:?}",
                device_name
            )));
        }

        let mut blacklist = blacklist::load(&self.blacklist_path)?;
        if let Some(entry) = blacklist
            .entry
            .iter_mut()
            .find(|e| e.device == device_name)
        {
            log::info!(
                "{} already blacklisted ({}), updating reason",
                device_name,
                entry.reason
            );
            entry.reason = reason.to_string();
        } else {
            blacklist.entry.push(BlacklistEntry {
                device: device_name.to_string(),
                reason: reason.to_string(),
            });
        }
        blacklist::save(&self.blacklist_path, &blacklist)
    }

    /// Put a device back into rotation. Effective immediately, no process
    /// restart needed: reservations re-read the blacklist on every pass.
    pub fn unblacklist(&self, device_name: &str) -> Result<()> {
        let mut blacklist = blacklist::load(&self.blacklist_path)?;
        let before = blacklist.entry.len();
        blacklist.entry.retain(|e| e.device != device_name);
        if blacklist.entry.len() == before {
            log::warn!("{} was not blacklisted", device_name);
            return Ok(());
        }
        blacklist::save(&self.blacklist_path, &blacklist)
    }

    pub fn list_blacklisted(&self) -> Result<Vec<BlacklistEntry>> {
        Ok(blacklist::load(&self.blacklist_path)?.entry)
    }

    /// Availability of every device in the fleet, for listing.
    pub fn availability(&self, fleet: &FleetState) -> Result<Vec<(String, Availability)>> {
        let blacklist = blacklist::load(&self.blacklist_path)?;
        Ok(fleet
            .devices()
            .iter()
            .map(|d| {
                let availability = if let Some(entry) =
                    blacklist.entry.iter().find(|e| e.device == d.name)
                {
                    Availability::Blacklisted {
                        reason: entry.reason.clone(),
                    }
                } else if self.is_leased(&d.name) {
                    Availability::Reserved
                } else {
                    Availability::Free
                };
                (d.name.clone(), availability)
            })
            .collect())
    }
}

fn is_blacklisted(blacklist: &BlacklistFile, device_name: &str) -> bool {
    blacklist.entry.iter().any(|e| e.device == device_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dutlab_core::device::{DeviceFamily, DeviceMode, InjectorConfig, ModeSpec};

    fn device(name: &str, model: &str) -> Device {
        Device {
            name: name.into(),
            model: model.into(),
            family: DeviceFamily::Pc,
            cutter_id: "900142".into(),
            channel_id: 0,
            hardware_id: "98:4f:ee:00:12:34".into(),
            leases_file: "/var/lib/misc/dnsmasq.leases".into(),
            injector: InjectorConfig {
                interface: "ttyUSB0".into(),
                port: "1".into(),
            },
            check_keystrokes: "/keys/enter".into(),
            service_mode: ModeSpec {
                name: "service".into(),
                keystrokes: "/keys/service".into(),
                signature: "-service".into(),
            },
            test_mode: ModeSpec {
                name: "test".into(),
                keystrokes: "/keys/test".into(),
                signature: "-yocto".into(),
            },
            target_device: "/dev/sda".into(),
            root_partition: "/dev/sda2".into(),
            probe_command: vec!["cat".into(), "/proc/version".into()],
            dfu: None,
            current_mode: DeviceMode::Unknown,
            ip: None,
        }
    }

    fn fail_fast() -> Option<Duration> {
        Some(Duration::from_millis(0))
    }

    #[test]
    fn test_mutual_exclusion_on_pool_of_one() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FleetState::new(vec![device("minnow-1", "minnowboard")]);
        let manager = ReservationManager::new(dir.path()).unwrap();
        // a rival invocation sharing the same lock directory
        let rival = ReservationManager::new(dir.path()).unwrap();

        let lease = manager
            .reserve(&fleet, &Constraints::default(), fail_fast())
            .unwrap();
        assert_eq!(lease.device(), "minnow-1");

        let err = rival
            .reserve(&fleet, &Constraints::default(), fail_fast())
            .unwrap_err();
        assert!(matches!(err, Error::Reservation(_)));

        // releasing frees the device for the rival
        drop(lease);
        let lease = rival
            .reserve(&fleet, &Constraints::default(), fail_fast())
            .unwrap();
        assert_eq!(lease.device(), "minnow-1");
    }

    #[test]
    fn test_blacklisted_devices_never_returned() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FleetState::new(vec![
            device("minnow-1", "minnowboard"),
            device("minnow-2", "minnowboard"),
        ]);
        let manager = ReservationManager::new(dir.path()).unwrap();
        manager
            .blacklist(&fleet, "minnow-2", "flaky power")
            .unwrap();

        let constraints = Constraints {
            model: Some("minnowboard".into()),
            name: None,
        };
        let lease = manager.reserve(&fleet, &constraints, fail_fast()).unwrap();
        assert_eq!(lease.device(), "minnow-1");

        // the only remaining match is blacklisted
        let constraints = Constraints {
            model: None,
            name: Some("minnow-2".into()),
        };
        let err = manager
            .reserve(&fleet, &constraints, fail_fast())
            .unwrap_err();
        assert!(matches!(err, Error::Reservation(_)));
    }

    #[test]
    fn test_unblacklist_effective_without_restart() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FleetState::new(vec![device("minnow-1", "minnowboard")]);
        let manager = ReservationManager::new(dir.path()).unwrap();

        manager.blacklist(&fleet, "minnow-1", "under repair").unwrap();
        assert!(manager
            .reserve(&fleet, &Constraints::default(), fail_fast())
            .is_err());

        manager.unblacklist("minnow-1").unwrap();
        let lease = manager
            .reserve(&fleet, &Constraints::default(), fail_fast())
            .unwrap();
        assert_eq!(lease.device(), "minnow-1");
    }

    #[test]
    fn test_blacklist_survives_new_manager() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FleetState::new(vec![device("minnow-1", "minnowboard")]);
        {
            let manager = ReservationManager::new(dir.path()).unwrap();
            manager.blacklist(&fleet, "minnow-1", "dead emmc").unwrap();
        }

        let manager = ReservationManager::new(dir.path()).unwrap();
        let entries = manager.list_blacklisted().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].device, "minnow-1");
        assert_eq!(entries[0].reason, "dead emmc");
    }

    #[test]
    fn test_stale_lease_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FleetState::new(vec![device("minnow-1", "minnowboard")]);
        let manager = ReservationManager::new(dir.path()).unwrap();

        // a dead holder's leftover: the file exists, nothing locks it
        std::fs::write(dir.path().join("minnow-1.lease"), "999999\n").unwrap();

        let lease = manager
            .reserve(&fleet, &Constraints::default(), fail_fast())
            .unwrap();
        assert_eq!(lease.device(), "minnow-1");
    }

    #[test]
    fn test_unknown_constraint_fails_fast_even_when_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FleetState::new(vec![device("minnow-1", "minnowboard")]);
        let manager = ReservationManager::new(dir.path()).unwrap();

        let constraints = Constraints {
            model: Some("no-such-model".into()),
            name: None,
        };
        let started = Instant::now();
        let err = manager
            .reserve(&fleet, &constraints, Some(Duration::from_secs(60)))
            .unwrap_err();
        assert!(matches!(err, Error::Reservation(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_free_and_blacklisted_pool_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FleetState::new(vec![
            device("a", "model-x"),
            device("b", "model-x"),
        ]);
        let manager = ReservationManager::new(dir.path()).unwrap();
        manager.blacklist(&fleet, "b", "bent pins").unwrap();

        let constraints = Constraints {
            model: Some("model-x".into()),
            name: None,
        };
        // matches both, only the free one is eligible
        let lease = manager.reserve(&fleet, &constraints, fail_fast()).unwrap();
        assert_eq!(lease.device(), "a");

        // no other free device of this model
        let err = manager
            .reserve(&fleet, &constraints, fail_fast())
            .unwrap_err();
        assert!(matches!(err, Error::Reservation(_)));
    }

    #[test]
    fn test_availability_listing() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FleetState::new(vec![
            device("a", "model-x"),
            device("b", "model-x"),
            device("c", "model-x"),
        ]);
        let manager = ReservationManager::new(dir.path()).unwrap();
        manager.blacklist(&fleet, "c", "dead").unwrap();
        let _lease = manager
            .reserve(
                &fleet,
                &Constraints {
                    name: Some("a".into()),
                    model: None,
                },
                fail_fast(),
            )
            .unwrap();

        let availability = manager.availability(&fleet).unwrap();
        assert_eq!(availability[0].1, Availability::Reserved);
        assert_eq!(availability[1].1, Availability::Free);
        assert_eq!(
            availability[2].1,
            Availability::Blacklisted {
                reason: "dead".into()
            }
        );
    }

    #[test]
    fn test_blacklist_unknown_device_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = FleetState::new(vec![device("minnow-1", "minnowboard")]);
        let manager = ReservationManager::new(dir.path()).unwrap();

        assert!(matches!(
            manager.blacklist(&fleet, "ghost", "whatever"),
            Err(Error::Config(_))
        ));
    }
}
