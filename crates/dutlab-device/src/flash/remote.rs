//! Remote-mount flashing strategy
//!
//! PC-class devices flash themselves: the harness drives their service OS
//! over SSH to mount the NFS-exported image store, copy the image onto the
//! internal storage, and inject the harness key into the freshly written
//! root filesystem. Every remote command must succeed (or be on a stage's
//! explicit ignore list); the first rejected command aborts the attempt,
//! because continuing past a failed write can only produce a device that
//! looks flashed and is not.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dutlab_core::device::{Device, DeviceMode};
use dutlab_core::error::{Error, Result};
use dutlab_core::remote::{execute_checked, RemoteOutput, RemoteShell};

/// Where the service OS mounts the NFS image store
const IMG_NFS_MOUNT_POINT: &str = "/mnt/img_data_nfs";
/// Mount point for the written root filesystem
const ROOT_MOUNT_POINT: &str = "/mnt/target_root";
/// Outer mount point when the image format needs two layers
const SUPER_ROOT_MOUNT_POINT: &str = "/mnt/super_target_root";

/// mount(8) exit status for "already mounted"
const MOUNT_BUSY: i32 = 32;
/// mkdir without -p reports an existing directory as 1
const MKDIR_EXISTS: i32 = 1;

/// Budget for writing the image to the target block device
pub const IMAGE_WRITE_TIMEOUT: Duration = Duration::from_secs(1440);
/// Budget for everything else (mounts, key injection, settling)
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Flashes PC-class devices through their service OS.
///
/// Precondition: the device is in service mode with a responsive address;
/// the mode controller provides both.
pub struct RemoteImageFlasher<'a> {
    shell: &'a dyn RemoteShell,
    /// Local directory exported over NFS; images must live underneath it
    nfs_dir: PathBuf,
    write_timeout: Duration,
}

impl<'a> RemoteImageFlasher<'a> {
    pub fn new(shell: &'a dyn RemoteShell, nfs_dir: &Path) -> Self {
        Self {
            shell,
            nfs_dir: nfs_dir.to_path_buf(),
            write_timeout: IMAGE_WRITE_TIMEOUT,
        }
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Write `image` to the device's storage and inject the harness key.
    pub fn flash(&self, device: &Device, image: &Path) -> Result<()> {
        if device.current_mode != DeviceMode::Service {
            return Err(Error::Flashing(format!(
                "{} is in {} mode, flashing needs service mode",
                device.name, device.current_mode
            )));
        }
        let ip = device.ip.ok_or_else(|| {
            Error::Flashing(format!("{} has no responsive address", device.name))
        })?;

        // Two image formats: a raw disk image mounted in one layer, or a
        // boot-partition image whose rootfs sits one mount deeper.
        let uses_hddimg = image.extension() == Some(std::ffi::OsStr::new("hddimg"));
        let image_on_nfs = self.image_path_on_device(image)?;

        self.write_image(ip, device, image, &image_on_nfs)?;
        self.install_harness_key(ip, device, image, uses_hddimg)?;
        log::info!("flashing {} complete", device.name);
        Ok(())
    }

    /// The image path as the service OS sees it through the NFS mount.
    fn image_path_on_device(&self, image: &Path) -> Result<String> {
        let relative = image.strip_prefix(&self.nfs_dir).map_err(|_| {
            Error::Flashing(format!(
                "image {} is outside the NFS export {}",
                image.display(),
                self.nfs_dir.display()
            ))
        })?;
        Ok(format!("{}/{}", IMG_NFS_MOUNT_POINT, relative.display()))
    }

    fn run(&self, ip: IpAddr, argv: &[&str], ignore: &[i32]) -> Result<RemoteOutput> {
        execute_checked(self.shell, ip, argv, COMMAND_TIMEOUT, "root", ignore)
    }

    fn write_image(
        &self,
        ip: IpAddr,
        device: &Device,
        image: &Path,
        image_on_nfs: &str,
    ) -> Result<()> {
        log::info!("mounting the image store on {}", device.name);
        self.run(ip, &["mount", IMG_NFS_MOUNT_POINT], &[MOUNT_BUSY])?;

        log::info!(
            "writing {} to {} on {}",
            image_on_nfs,
            device.target_device,
            device.name
        );
        let mut copy: Vec<&str> = vec!["bmaptool", "copy"];
        let bmap = image.with_extension(format!(
            "{}.bmap",
            image.extension().unwrap_or_default().to_string_lossy()
        ));
        if bmap.is_file() {
            log::info!("found {}, using it for the copy", bmap.display());
        } else {
            log::info!("no {} next to the image, copying in full", bmap.display());
            copy.push("--nobmap");
        }
        copy.push(image_on_nfs);
        copy.push(&device.target_device);
        execute_checked(self.shell, ip, &copy, self.write_timeout, "root", &[])?;

        // Re-flashing the image the device already has makes the kernel
        // drop and re-create the partition device nodes; everything after
        // this point must not race that.
        log::info!("settling partition device nodes on {}", device.name);
        self.run(ip, &["partprobe", &device.target_device], &[])?;
        self.run(ip, &["sync"], &[])?;
        self.run(ip, &["udevadm", "trigger"], &[])?;
        self.run(ip, &["udevadm", "settle"], &[])?;
        self.run(ip, &["udevadm", "control", "-S"], &[])?;
        Ok(())
    }

    /// Mount the written rootfs and append the harness public key to the
    /// root user's authorized keys.
    fn install_harness_key(
        &self,
        ip: IpAddr,
        device: &Device,
        image: &Path,
        uses_hddimg: bool,
    ) -> Result<()> {
        if uses_hddimg {
            self.mount_two_layers(ip, device)?;
        } else {
            self.mount_single_layer(ip, device, image)?;
        }

        // The root user's home is wherever /etc/passwd on the *written*
        // filesystem says it is.
        let passwd = format!("{}/etc/passwd", ROOT_MOUNT_POINT);
        let output = self.run(
            ip,
            &[
                "cat", &passwd, "|", "grep", "-e", "'^root'", "|", "sed", "-e",
                "'s/root:.*:root://'", "|", "sed", "-e", "'s/:.*//'",
            ],
            &[],
        )?;
        let root_home = output.stdout.trim().trim_start_matches('/').to_string();
        let ssh_dir = format!("{}/{}/.ssh", ROOT_MOUNT_POINT, root_home);
        let authorized_keys = format!("{}/authorized_keys", ssh_dir);

        log::info!("writing the harness key onto {}", device.name);
        self.run(ip, &["mkdir", &ssh_dir], &[MKDIR_EXISTS])?;
        self.run(ip, &["chmod", "700", &ssh_dir], &[])?;
        self.run(
            ip,
            &["cat", "~/.ssh/authorized_keys", ">>", &authorized_keys],
            &[],
        )?;
        self.run(ip, &["chmod", "600", &authorized_keys], &[])?;

        if !uses_hddimg {
            // Integrity-measured images refuse keys without the xattr.
            log::info!("sealing the key with an integrity attribute");
            let value = format!(
                "0x01`sha1sum {} | cut '-d ' -f1`",
                authorized_keys
            );
            self.run(
                ip,
                &["setfattr", "-n", "security.ima", "-v", &value, &authorized_keys],
                &[],
            )?;
        }

        self.run(ip, &["sync"], &[])?;
        self.run(ip, &["umount", ROOT_MOUNT_POINT], &[])?;
        Ok(())
    }

    fn mount_single_layer(&self, ip: IpAddr, device: &Device, image: &Path) -> Result<()> {
        log::info!("mounting the root partition");
        let partition = self.root_partition_path(device, image);
        self.run(ip, &["mount", &partition, ROOT_MOUNT_POINT], &[])?;
        Ok(())
    }

    fn mount_two_layers(&self, ip: IpAddr, device: &Device) -> Result<()> {
        log::info!("mounting both image layers");
        self.run(ip, &["modprobe", "vfat"], &[])?;
        self.run(
            ip,
            &["mount", &device.target_device, SUPER_ROOT_MOUNT_POINT],
            &[],
        )?;
        let inner = format!("{}/rootfs", SUPER_ROOT_MOUNT_POINT);
        self.run(ip, &["mount", &inner, ROOT_MOUNT_POINT], &[])?;
        Ok(())
    }

    /// The root partition to mount: taken from the image's disk-layout
    /// sibling file when one exists, else the topology default.
    fn root_partition_path(&self, device: &Device, image: &Path) -> String {
        let layout_file = image.with_file_name(format!(
            "{}-disk-layout.json",
            image
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));

        let Ok(text) = fs::read_to_string(&layout_file) else {
            log::info!(
                "no disk layout file {}, using the configured root partition",
                layout_file.display()
            );
            return device.root_partition.clone();
        };

        match rootfs_partuuid(&text) {
            Some(uuid) => format!("/dev/disk/by-partuuid/{}", uuid),
            None => {
                log::warn!(
                    "{} has no rootfs entry, using the configured root partition",
                    layout_file.display()
                );
                device.root_partition.clone()
            }
        }
    }
}

/// Pull the partuuid of the partition named "rootfs" out of a disk-layout
/// document.
fn rootfs_partuuid(text: &str) -> Option<String> {
    let layout: serde_json::Value = serde_json::from_str(text).ok()?;
    layout.as_object()?.values().find_map(|entry| {
        let obj = entry.as_object()?;
        if obj.get("name")?.as_str()? == "rootfs" {
            Some(obj.get("uuid")?.as_str()?.to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dutlab_core::device::{DeviceFamily, InjectorConfig, ModeSpec};
    use std::sync::Mutex;

    /// Shell that records every command and fails those starting with a
    /// scripted prefix.
    struct RecordingShell {
        log: Mutex<Vec<String>>,
        fail_prefix: Option<&'static str>,
    }

    impl RecordingShell {
        fn new() -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                fail_prefix: None,
            }
        }

        fn failing_on(prefix: &'static str) -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                fail_prefix: Some(prefix),
            }
        }

        fn commands(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl RemoteShell for RecordingShell {
        fn execute(
            &self,
            _ip: IpAddr,
            argv: &[&str],
            _timeout: Duration,
            _user: &str,
        ) -> dutlab_core::error::Result<Option<RemoteOutput>> {
            let command = argv.join(" ");
            self.log.lock().unwrap().push(command.clone());

            if let Some(prefix) = self.fail_prefix {
                if command.starts_with(prefix) {
                    return Ok(Some(RemoteOutput {
                        status: 1,
                        stdout: String::new(),
                        stderr: "scripted failure".into(),
                    }));
                }
            }

            let stdout = if command.starts_with("cat /mnt/target_root/etc/passwd") {
                "/root\n".to_string()
            } else {
                String::new()
            };
            Ok(Some(RemoteOutput {
                status: 0,
                stdout,
                stderr: String::new(),
            }))
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

    fn pc_device() -> Device {
        Device {
            name: "minnow-1".into(),
            model: "minnowboard".into(),
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
            current_mode: DeviceMode::Service,
            ip: Some("192.168.30.4".parse().unwrap()),
        }
    }

    fn image_in(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"image").unwrap();
        path
    }

    #[test]
    fn test_full_copy_without_bmap() {
        let dir = tempfile::tempdir().unwrap();
        let image = image_in(dir.path(), "os.hdddirect");
        let shell = RecordingShell::new();
        let flasher = RemoteImageFlasher::new(&shell, dir.path());

        flasher.flash(&pc_device(), &image).unwrap();

        let commands = shell.commands();
        let copy = commands.iter().find(|c| c.starts_with("bmaptool")).unwrap();
        assert!(copy.contains("--nobmap"));
        assert!(copy.contains("/mnt/img_data_nfs/os.hdddirect"));
        assert!(copy.ends_with("/dev/sda"));
    }

    #[test]
    fn test_bmap_sibling_enables_accelerated_copy() {
        let dir = tempfile::tempdir().unwrap();
        let image = image_in(dir.path(), "os.hdddirect");
        fs::write(dir.path().join("os.hdddirect.bmap"), b"bmap").unwrap();
        let shell = RecordingShell::new();
        let flasher = RemoteImageFlasher::new(&shell, dir.path());

        flasher.flash(&pc_device(), &image).unwrap();

        let commands = shell.commands();
        let copy = commands.iter().find(|c| c.starts_with("bmaptool")).unwrap();
        assert!(!copy.contains("--nobmap"));
    }

    #[test]
    fn test_settle_sequence_follows_copy() {
        let dir = tempfile::tempdir().unwrap();
        let image = image_in(dir.path(), "os.hdddirect");
        let shell = RecordingShell::new();
        let flasher = RemoteImageFlasher::new(&shell, dir.path());

        flasher.flash(&pc_device(), &image).unwrap();

        let commands = shell.commands();
        let pos = |needle: &str| commands.iter().position(|c| c.starts_with(needle)).unwrap();
        assert!(pos("bmaptool") < pos("partprobe"));
        assert!(pos("partprobe") < pos("udevadm trigger"));
        assert!(pos("udevadm trigger") < pos("udevadm settle"));
        // the key lands only after the nodes settled
        assert!(pos("udevadm settle") < pos("mount /dev/sda2"));
    }

    #[test]
    fn test_failed_remote_command_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let image = image_in(dir.path(), "os.hdddirect");
        let shell = RecordingShell::failing_on("bmaptool");
        let flasher = RemoteImageFlasher::new(&shell, dir.path());

        let err = flasher.flash(&pc_device(), &image).unwrap_err();
        assert!(matches!(err, Error::RemoteCommand { .. }));

        // nothing ran past the failed write
        let commands = shell.commands();
        assert!(!commands.iter().any(|c| c.starts_with("partprobe")));
        assert!(!commands.iter().any(|c| c.contains("authorized_keys")));
    }

    #[test]
    fn test_hddimg_mounts_two_layers_and_skips_xattr() {
        let dir = tempfile::tempdir().unwrap();
        let image = image_in(dir.path(), "os.hddimg");
        let shell = RecordingShell::new();
        let flasher = RemoteImageFlasher::new(&shell, dir.path());

        flasher.flash(&pc_device(), &image).unwrap();

        let commands = shell.commands();
        assert!(commands.iter().any(|c| c.starts_with("modprobe vfat")));
        assert!(commands
            .iter()
            .any(|c| c.starts_with("mount /dev/sda /mnt/super_target_root")));
        assert!(!commands.iter().any(|c| c.starts_with("setfattr")));
    }

    #[test]
    fn test_hdddirect_seals_key_with_xattr() {
        let dir = tempfile::tempdir().unwrap();
        let image = image_in(dir.path(), "os.hdddirect");
        let shell = RecordingShell::new();
        let flasher = RemoteImageFlasher::new(&shell, dir.path());

        flasher.flash(&pc_device(), &image).unwrap();

        let commands = shell.commands();
        let xattr = commands.iter().find(|c| c.starts_with("setfattr")).unwrap();
        assert!(xattr.contains("security.ima"));
        assert!(xattr.contains("/mnt/target_root/root/.ssh/authorized_keys"));
    }

    #[test]
    fn test_disk_layout_sibling_overrides_root_partition() {
        let dir = tempfile::tempdir().unwrap();
        let image = image_in(dir.path(), "os.hdddirect");
        fs::write(
            dir.path().join("os-disk-layout.json"),
            r#"{"1": {"name": "boot", "uuid": "aaa"}, "2": {"name": "rootfs", "uuid": "bbb-ccc"}}"#,
        )
        .unwrap();
        let shell = RecordingShell::new();
        let flasher = RemoteImageFlasher::new(&shell, dir.path());

        flasher.flash(&pc_device(), &image).unwrap();

        let commands = shell.commands();
        assert!(commands
            .iter()
            .any(|c| c.starts_with("mount /dev/disk/by-partuuid/bbb-ccc")));
    }

    #[test]
    fn test_image_outside_nfs_export_refused() {
        let dir = tempfile::tempdir().unwrap();
        let shell = RecordingShell::new();
        let flasher = RemoteImageFlasher::new(&shell, dir.path());

        let err = flasher
            .flash(&pc_device(), Path::new("/elsewhere/os.hdddirect"))
            .unwrap_err();
        assert!(matches!(err, Error::Flashing(_)));
        assert!(shell.commands().is_empty());
    }

    #[test]
    fn test_flash_requires_service_mode() {
        let dir = tempfile::tempdir().unwrap();
        let image = image_in(dir.path(), "os.hdddirect");
        let shell = RecordingShell::new();
        let flasher = RemoteImageFlasher::new(&shell, dir.path());

        let mut device = pc_device();
        device.current_mode = DeviceMode::Test;
        let err = flasher.flash(&device, &image).unwrap_err();
        assert!(matches!(err, Error::Flashing(_)));
    }

    #[test]
    fn test_rootfs_partuuid_parsing() {
        let text = r#"{"p1": {"name": "boot", "uuid": "x"}, "p2": {"name": "rootfs", "uuid": "y"}}"#;
        assert_eq!(rootfs_partuuid(text).unwrap(), "y");
        assert!(rootfs_partuuid(r#"{"p1": {"name": "boot", "uuid": "x"}}"#).is_none());
        assert!(rootfs_partuuid("not json").is_none());
    }
}
