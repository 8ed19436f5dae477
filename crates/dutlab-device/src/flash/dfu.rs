//! DFU flashing strategy
//!
//! USB-bootloader devices are written in a fixed stage order: firmware,
//! bootloader, boot partition, update partition, root partition. Each stage
//! waits for the unit to enumerate on its known USB topology path, then
//! runs one `dfu-util` transfer under a large deadline. A transfer that
//! neither completes nor is confirmed dead is force-killed; the stage is
//! retried after a full device reboot, up to a per-stage attempt budget.
//! Exhausting a stage aborts the whole flash. Before any stage runs, the
//! harness SSH key is planted in the image's root filesystem
//! ([`inject_image_key`]) so the flashed system is reachable on first boot.
//!
//! Recovery flashing through the vendor bootstrap tool is not wired up:
//! concurrent invocations race on the tool's device enumeration.
//! TODO: add an inter-process lock around the bootstrap tool, then offer
//! recovery flashing for blacklisted units.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use dutlab_core::cutter::PowerChannel;
use dutlab_core::device::{Device, DfuConfig};
use dutlab_core::error::{Error, Result};

use crate::proc::{run_with_deadline, DeadlineOutcome};

/// How long a unit may take to show up in DFU mode
pub const DEVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(15);
/// Deadline for a single DFU transfer
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);
/// Attempt budget per stage
pub const STAGE_ATTEMPTS: u32 = 4;
/// Time spent powered off when rebooting between attempts
const REBOOT_OFF_DELAY: Duration = Duration::from_secs(1);
/// Poll interval while waiting for DFU enumeration
const ENUM_POLL_INTERVAL: Duration = Duration::from_secs(1);

const DFU_COMMAND: &str = "dfu-util";
const FLASH_LOG: &str = "flash.log";

/// One stage of the DFU flashing plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuStage {
    pub name: &'static str,
    /// DFU altsetting the payload is written to
    pub alt: String,
    /// Payload file, resolved next to the image
    pub source: PathBuf,
    /// Pass `-R` so the unit resets out of DFU mode after this stage
    pub reset_after: bool,
}

/// The fixed stage order for one image.
///
/// The firmware and bootloader payloads ship beside the image under fixed
/// names; the partition payloads share the image's stem with per-device
/// extensions from the topology.
pub fn stage_plan(image: &Path, dfu: &DfuConfig) -> Vec<DfuStage> {
    let dir = image.parent().unwrap_or_else(|| Path::new("."));
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    vec![
        DfuStage {
            name: "firmware",
            alt: "firmware".into(),
            source: dir.join("firmware.bin"),
            reset_after: false,
        },
        DfuStage {
            name: "bootloader",
            alt: "u-boot0".into(),
            source: dir.join("u-boot.bin"),
            reset_after: false,
        },
        DfuStage {
            name: "boot",
            alt: "boot".into(),
            source: dir.join(format!("{}.{}", stem, dfu.boot_extension)),
            reset_after: false,
        },
        DfuStage {
            name: "update",
            alt: "update".into(),
            source: dir.join(format!("{}.{}", stem, dfu.update_extension)),
            reset_after: false,
        },
        DfuStage {
            name: "rootfs",
            alt: "rootfs".into(),
            source: dir.join(format!("{}.{}", stem, dfu.root_extension)),
            reset_after: true,
        },
    ]
}

/// Mount the image's root filesystem locally and plant the harness public
/// key, so the flashed system trusts the harness from its first boot.
///
/// Needs root for the mount; run before [`DfuFlasher::flash`] writes the
/// modified rootfs payload to the device.
pub fn inject_image_key(
    image: &Path,
    dfu: &DfuConfig,
    key_file: &Path,
    mount_dir: &Path,
) -> Result<()> {
    let dir = image.parent().unwrap_or_else(|| Path::new("."));
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let rootfs = dir.join(format!("{}.{}", stem, dfu.root_extension));

    log::info!("mounting {} for key injection", rootfs.display());
    let rootfs_arg = rootfs.to_string_lossy().into_owned();
    let mount_arg = mount_dir.to_string_lossy().into_owned();
    std::fs::create_dir_all(mount_dir)?;
    run_local("mount", &[rootfs_arg.as_str(), mount_arg.as_str()])?;

    let injected = install_key_tree(mount_dir, key_file);

    // Unmount even when the injection failed; the error that matters is
    // whichever came first.
    log::info!("flushing and unmounting the root filesystem");
    let _ = run_local("sync", &[]);
    let unmounted = run_local("umount", &[mount_arg.as_str()]);
    injected.and(unmounted)
}

/// Place `key_file` as root's authorized keys under `mount_root`, with the
/// permissions sshd insists on.
pub fn install_key_tree(mount_root: &Path, key_file: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let ssh_dir = mount_root.join("home/root/.ssh");
    let authorized_keys = ssh_dir.join("authorized_keys");

    std::fs::create_dir_all(&ssh_dir)?;
    std::fs::copy(key_file, &authorized_keys)?;
    std::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700))?;
    std::fs::set_permissions(&authorized_keys, std::fs::Permissions::from_mode(0o600))?;

    for path in [&ssh_dir, &authorized_keys] {
        if let Err(e) = std::os::unix::fs::chown(path, Some(0), Some(0)) {
            log::debug!("chown on {}: {}", path.display(), e);
        }
    }
    Ok(())
}

fn run_local(command: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(command).args(args).status()?;
    if !status.success() {
        return Err(Error::Flashing(format!(
            "{} {} exited with {}",
            command,
            args.join(" "),
            status
        )));
    }
    Ok(())
}

/// Flashes DFU-family devices.
pub struct DfuFlasher<'a> {
    channel: &'a mut PowerChannel,
    dfu_command: String,
    device_wait: Duration,
    transfer_timeout: Duration,
    attempts: u32,
    off_delay: Duration,
    enum_poll: Duration,
    log_path: PathBuf,
}

impl<'a> DfuFlasher<'a> {
    pub fn new(channel: &'a mut PowerChannel) -> Self {
        Self {
            channel,
            dfu_command: DFU_COMMAND.to_string(),
            device_wait: DEVICE_WAIT_TIMEOUT,
            transfer_timeout: TRANSFER_TIMEOUT,
            attempts: STAGE_ATTEMPTS,
            off_delay: REBOOT_OFF_DELAY,
            enum_poll: ENUM_POLL_INTERVAL,
            log_path: PathBuf::from(FLASH_LOG),
        }
    }

    /// Use a different transfer tool; tests point this at a stub.
    pub fn with_command(mut self, command: &str) -> Self {
        self.dfu_command = command.to_string();
        self
    }

    /// Override the timing constants; tests shrink these to milliseconds.
    pub fn timings(
        mut self,
        device_wait: Duration,
        transfer_timeout: Duration,
        off_delay: Duration,
        enum_poll: Duration,
    ) -> Self {
        self.device_wait = device_wait;
        self.transfer_timeout = transfer_timeout;
        self.off_delay = off_delay;
        self.enum_poll = enum_poll;
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn log_to(mut self, path: &Path) -> Self {
        self.log_path = path.to_path_buf();
        self
    }

    /// Write `image` through the full stage plan.
    pub fn flash(&mut self, device: &Device, image: &Path) -> Result<()> {
        let dfu = device.dfu.as_ref().ok_or_else(|| {
            Error::Config(format!("device {} has no dfu settings", device.name))
        })?;

        let plan = stage_plan(image, dfu);
        log::info!(
            "flashing {} over DFU, {} stage(s)",
            device.name,
            plan.len()
        );

        self.reboot()?;
        for stage in &plan {
            self.run_stage(device, &dfu.usb_path, stage)?;
        }

        log::info!("flashing {} complete", device.name);
        Ok(())
    }

    /// Power-cycle the unit back into its DFU enumeration window.
    fn reboot(&mut self) -> Result<()> {
        self.channel.disconnect()?;
        thread::sleep(self.off_delay);
        self.channel.connect()
    }

    /// Poll `dfu-util -l` until the unit shows up on its USB path.
    fn wait_for_unit(&self, usb_path: &str) -> Result<()> {
        let needle = format!("path=\"{}\"", usb_path);
        let deadline = Instant::now() + self.device_wait;
        loop {
            let output = Command::new(&self.dfu_command).arg("-l").output()?;
            if String::from_utf8_lossy(&output.stdout).contains(&needle) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Transient(format!(
                    "no DFU unit on USB path {} within {:?}",
                    usb_path, self.device_wait
                )));
            }
            thread::sleep(self.enum_poll);
        }
    }

    /// Run one stage to completion, rebooting the unit between attempts.
    fn run_stage(&mut self, device: &Device, usb_path: &str, stage: &DfuStage) -> Result<()> {
        for attempt in 1..=self.attempts {
            if let Err(e) = self.wait_for_unit(usb_path) {
                log::warn!(
                    "stage {} on {}: {} (attempt {}/{})",
                    stage.name,
                    device.name,
                    e,
                    attempt,
                    self.attempts
                );
                self.reboot()?;
                continue;
            }

            let mut command = Command::new(&self.dfu_command);
            command
                .arg("-v")
                .arg("--path")
                .arg(usb_path)
                .arg("--alt")
                .arg(&stage.alt)
                .arg("-D")
                .arg(&stage.source);
            if stage.reset_after {
                command.arg("-R");
            }

            let outcome = run_with_deadline(&mut command, self.transfer_timeout)?;
            self.append_log(stage, &outcome);

            match outcome {
                DeadlineOutcome::Finished { status, .. } if status.success() => {
                    log::info!("stage {} on {} written", stage.name, device.name);
                    return Ok(());
                }
                DeadlineOutcome::Finished { status, .. } => {
                    log::warn!(
                        "stage {} on {} exited with {} (attempt {}/{}), rebooting",
                        stage.name,
                        device.name,
                        status,
                        attempt,
                        self.attempts
                    );
                }
                DeadlineOutcome::TimedOut { .. } => {
                    log::warn!(
                        "stage {} on {} neither completed nor died within {:?} \
                         (attempt {}/{}), killed, rebooting",
                        stage.name,
                        device.name,
                        self.transfer_timeout,
                        attempt,
                        self.attempts
                    );
                }
            }
            self.reboot()?;
        }

        Err(Error::Flashing(format!(
            "stage {} on {} failed {} attempt(s)",
            stage.name, device.name, self.attempts
        )))
    }

    /// The transfer tool is chatty and its output is the only forensic
    /// record of a bad write; keep all of it.
    fn append_log(&self, stage: &DfuStage, outcome: &DeadlineOutcome) {
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut f| {
                writeln!(f, "=== stage {} ({}) ===", stage.name, stage.source.display())?;
                f.write_all(outcome.stdout_lossy().as_bytes())?;
                f.write_all(outcome.stderr_lossy().as_bytes())
            });
        if let Err(e) = result {
            log::debug!("cannot append to {}: {}", self.log_path.display(), e);
        }
    }
}
