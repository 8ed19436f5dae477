//! Mode-entry state machine
//!
//! Boot flakiness on this class of hardware is expected and transient, and
//! the one remedy that reliably clears it is a full power cycle. The
//! controller therefore never tries in-place recovery: an attempt runs the
//! whole ladder (power cycle, keystroke injection, address acquisition,
//! signature check) and any failure restarts from the power cycle, up to a
//! fixed attempt budget.

use std::net::IpAddr;
use std::thread;
use std::time::Duration;

use dutlab_core::cutter::PowerChannel;
use dutlab_core::device::{Device, DeviceMode, ModeSpec};
use dutlab_core::error::{Error, Result};
use dutlab_core::remote::RemoteShell;

use crate::injector::Injector;
use crate::leases::wait_for_responsive_ip;

/// Attempt budget for mode entry
pub const RETRY_ATTEMPTS: u32 = 8;
/// Lower budget for configuration checks: with the full budget, a dead
/// device would tie up the check for 2 * 8 * 240 seconds
pub const CHECK_RETRY_ATTEMPTS: u32 = 3;
/// How long a boot may take before the attempt is written off
pub const BOOT_TIMEOUT: Duration = Duration::from_secs(240);
/// Lease-table polling granularity while waiting for a boot
pub const POLLING_INTERVAL: Duration = Duration::from_secs(10);
/// Wall-clock budget for one keystroke replay
pub const INJECTION_TIMEOUT: Duration = Duration::from_secs(60);
/// Time spent powered off during a cycle
pub const POWER_OFF_DELAY: Duration = Duration::from_secs(1);
/// Budget for the mode verification probe command
const VERIFY_TIMEOUT: Duration = Duration::from_secs(15);

/// Progress of a single boot attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    PoweredOff,
    Booting,
    IpAcquired,
    ModeVerified,
}

impl std::fmt::Display for BootStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootStage::PoweredOff => write!(f, "powered off"),
            BootStage::Booting => write!(f, "booting"),
            BootStage::IpAcquired => write!(f, "ip acquired"),
            BootStage::ModeVerified => write!(f, "mode verified"),
        }
    }
}

/// Drives one device through power-cycle, mode selection and verification.
pub struct ModeController<'a> {
    channel: &'a mut PowerChannel,
    injector: &'a dyn Injector,
    shell: &'a dyn RemoteShell,
    attempts: u32,
    boot_timeout: Duration,
    polling_interval: Duration,
    injection_timeout: Duration,
    off_delay: Duration,
}

impl<'a> ModeController<'a> {
    pub fn new(
        channel: &'a mut PowerChannel,
        injector: &'a dyn Injector,
        shell: &'a dyn RemoteShell,
    ) -> Self {
        Self {
            channel,
            injector,
            shell,
            attempts: RETRY_ATTEMPTS,
            boot_timeout: BOOT_TIMEOUT,
            polling_interval: POLLING_INTERVAL,
            injection_timeout: INJECTION_TIMEOUT,
            off_delay: POWER_OFF_DELAY,
        }
    }

    /// Override the attempt budget (configuration checks use a lower one).
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Override the timing constants; tests shrink these to milliseconds.
    pub fn timings(
        mut self,
        boot_timeout: Duration,
        polling_interval: Duration,
        injection_timeout: Duration,
        off_delay: Duration,
    ) -> Self {
        self.boot_timeout = boot_timeout;
        self.polling_interval = polling_interval;
        self.injection_timeout = injection_timeout;
        self.off_delay = off_delay;
        self
    }

    /// Power-cycle the device. The only reset path there is: these devices
    /// have no soft-reset that can be trusted after a bad boot.
    pub fn power_cycle(&mut self) -> Result<()> {
        self.channel.disconnect()?;
        thread::sleep(self.off_delay);
        self.channel.connect()
    }

    /// Drive `device` into `mode`, retrying up to the attempt budget.
    ///
    /// On success the device's `current_mode` and `ip` are updated and the
    /// responsive address returned. On exhaustion the device is left in
    /// `Unknown` mode and [`Error::ModeEntry`] is raised; the caller must
    /// not assume anything about the device's health.
    pub fn enter_mode(&mut self, device: &mut Device, mode: DeviceMode) -> Result<IpAddr> {
        let spec = device
            .mode_spec(mode)
            .cloned()
            .ok_or_else(|| Error::Config(format!("device {} cannot enter {}", device.name, mode)))?;

        log::info!(
            "entering {} mode on {}, up to {} attempt(s)",
            spec.name,
            device.name,
            self.attempts
        );

        device.current_mode = DeviceMode::Unknown;
        device.ip = None;

        for attempt in 1..=self.attempts {
            match self.attempt(device, &spec) {
                Ok(ip) => {
                    log::info!(
                        "{} reached {} mode at {} (attempt {}/{})",
                        device.name,
                        spec.name,
                        ip,
                        attempt,
                        self.attempts
                    );
                    device.current_mode = mode;
                    device.ip = Some(ip);
                    return Ok(ip);
                }
                Err(e) => {
                    log::warn!(
                        "failed entering {} mode on {} (attempt {}/{}): {}",
                        spec.name,
                        device.name,
                        attempt,
                        self.attempts,
                        e
                    );
                }
            }
        }

        log::error!(
            "unable to get device {} into {} mode",
            device.name,
            spec.name
        );
        Err(Error::ModeEntry {
            device: device.name.clone(),
            mode: spec.name,
        })
    }

    /// One pass through the boot ladder. Any error aborts the attempt; the
    /// next one starts over from the power cycle because the device's
    /// internal state after a failed boot is not trusted.
    fn attempt(&mut self, device: &Device, spec: &ModeSpec) -> Result<IpAddr> {
        let mut stage = BootStage::PoweredOff;
        log::debug!("{}: {}", device.name, stage);
        self.power_cycle()?;

        stage = BootStage::Booting;
        log::debug!("{}: {}", device.name, stage);
        self.injector.inject(
            &device.injector.interface,
            &device.injector.port,
            &spec.keystrokes,
            1,
            self.injection_timeout,
        )?;

        let ip = wait_for_responsive_ip(
            self.shell,
            &device.leases_file,
            &device.hardware_id,
            self.boot_timeout,
            self.polling_interval,
        )
        .ok_or_else(|| {
            Error::Transient(format!("{} acquired no responsive address", device.name))
        })?;
        stage = BootStage::IpAcquired;
        log::debug!("{}: {} ({})", device.name, stage, ip);

        if !self.verify_mode(ip, device, spec) {
            return Err(Error::Transient(format!(
                "{} booted at {} but is not in {} mode",
                device.name, ip, spec.name
            )));
        }
        stage = BootStage::ModeVerified;
        log::debug!("{}: {}", device.name, stage);
        Ok(ip)
    }

    /// Run the probe command and match its output against the mode
    /// signature. A missing or failing probe means "not in this mode".
    fn verify_mode(&self, ip: IpAddr, device: &Device, spec: &ModeSpec) -> bool {
        let argv: Vec<&str> = device.probe_command.iter().map(String::as_str).collect();
        match self.shell.execute(ip, &argv, VERIFY_TIMEOUT, "root") {
            Ok(Some(output)) if output.success() => output.stdout.contains(&spec.signature),
            Ok(_) => false,
            Err(e) => {
                log::debug!("mode probe on {} failed: {}", ip, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dutlab_core::device::{DeviceFamily, InjectorConfig};
    use dutlab_core::remote::RemoteOutput;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use dutlab_dummy::{DummyCutter, DUMMY_CUTTER_TYPES};

    /// Injector that records calls and succeeds.
    #[derive(Default)]
    struct CountingInjector {
        calls: AtomicU32,
    }

    impl Injector for CountingInjector {
        fn inject(
            &self,
            _interface: &str,
            _port: &str,
            _keystrokes: &Path,
            _attempts: u32,
            _timeout: Duration,
        ) -> dutlab_core::error::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Shell whose probe answers are scripted per call.
    struct ScriptedShell {
        /// One entry per execute() call: None = unreachable, Some = output
        script: Mutex<Vec<Option<RemoteOutput>>>,
    }

    impl ScriptedShell {
        fn new(script: Vec<Option<RemoteOutput>>) -> Self {
            Self {
                script: Mutex::new(script),
            }
        }

        fn ok(stdout: &str) -> Option<RemoteOutput> {
            Some(RemoteOutput {
                status: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            })
        }
    }

    impl RemoteShell for ScriptedShell {
        fn execute(
            &self,
            _ip: IpAddr,
            _argv: &[&str],
            _timeout: Duration,
            _user: &str,
        ) -> dutlab_core::error::Result<Option<RemoteOutput>> {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(None)
            } else {
                Ok(script.remove(0))
            }
        }

        fn push(
            &self,
            _ip: IpAddr,
            _local: &Path,
            _remote: &str,
            _user: &str,
        ) -> dutlab_core::error::Result<()> {
            Ok(())
        }
    }

    fn test_channel() -> PowerChannel {
        let backend: Box<dyn dutlab_core::cutter::CutterBackend> =
            Box::new(DummyCutter::new_default());
        PowerChannel::new(
            Arc::new(Mutex::new(backend)),
            "dummy-0".to_string(),
            0,
            &DUMMY_CUTTER_TYPES[0],
        )
    }

    fn test_device(leases_file: PathBuf) -> Device {
        Device {
            name: "minnow-1".into(),
            model: "minnowboard".into(),
            family: DeviceFamily::Pc,
            cutter_id: "dummy-0".into(),
            channel_id: 0,
            hardware_id: "98:4f:ee:00:12:34".into(),
            leases_file,
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

    fn leases_file(dir: &Path) -> PathBuf {
        let path = dir.join("dnsmasq.leases");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "1623760000 98:4f:ee:00:12:34 192.168.30.4 minnow-1 *").unwrap();
        path
    }

    fn fast_timings(controller: ModeController<'_>) -> ModeController<'_> {
        controller.timings(
            Duration::from_millis(50),
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::from_millis(0),
        )
    }

    #[test]
    fn test_enter_mode_first_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = test_device(leases_file(dir.path()));
        let mut channel = test_channel();
        let injector = CountingInjector::default();
        // one responsiveness probe, one verification probe
        let shell = ScriptedShell::new(vec![
            ScriptedShell::ok(""),
            ScriptedShell::ok("Linux version 4.4.3-service"),
        ]);

        let mut controller = fast_timings(ModeController::new(&mut channel, &injector, &shell));
        let ip = controller
            .enter_mode(&mut device, DeviceMode::Service)
            .unwrap();

        assert_eq!(ip, "192.168.30.4".parse::<IpAddr>().unwrap());
        assert_eq!(device.current_mode, DeviceMode::Service);
        assert_eq!(device.ip, Some(ip));
        // success on attempt 1 must not start attempt 2
        assert_eq!(injector.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_enter_mode_succeeds_on_later_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = test_device(leases_file(dir.path()));
        let mut channel = test_channel();
        let injector = CountingInjector::default();
        // Attempt 1: responsive but wrong signature. Attempt 2: responsive
        // and verified.
        let shell = ScriptedShell::new(vec![
            ScriptedShell::ok(""),
            ScriptedShell::ok("Linux version 4.4.3-yocto"),
            ScriptedShell::ok(""),
            ScriptedShell::ok("Linux version 4.4.3-service"),
        ]);

        let mut controller =
            fast_timings(ModeController::new(&mut channel, &injector, &shell)).attempts(3);
        controller
            .enter_mode(&mut device, DeviceMode::Service)
            .unwrap();

        assert_eq!(injector.calls.load(Ordering::SeqCst), 2);
        assert_eq!(device.current_mode, DeviceMode::Service);
    }

    #[test]
    fn test_enter_mode_exhausts_budget_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = test_device(leases_file(dir.path()));
        device.current_mode = DeviceMode::Test;
        let mut channel = test_channel();
        let injector = CountingInjector::default();
        // never reachable
        let shell = ScriptedShell::new(vec![]);

        let mut controller =
            fast_timings(ModeController::new(&mut channel, &injector, &shell)).attempts(3);
        let err = controller
            .enter_mode(&mut device, DeviceMode::Service)
            .unwrap_err();

        assert!(matches!(err, Error::ModeEntry { .. }));
        assert_eq!(injector.calls.load(Ordering::SeqCst), 3);
        // the device is handed back untrusted
        assert_eq!(device.current_mode, DeviceMode::Unknown);
        assert_eq!(device.ip, None);
    }

    #[test]
    fn test_power_cycle_leaves_channel_connected() {
        let mut channel = test_channel();
        let injector = CountingInjector::default();
        let shell = ScriptedShell::new(vec![]);

        let mut controller = fast_timings(ModeController::new(&mut channel, &injector, &shell));
        controller.power_cycle().unwrap();
        drop(controller);
        assert_eq!(channel.is_connected(), Some(true));
    }
}
