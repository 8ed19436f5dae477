//! Topology and catalog configuration
//!
//! Two TOML files describe the lab: the *catalog* lists the supported device
//! models (boot modes, signatures, flashing family), the *topology* lists
//! the physically attached devices and their wiring (cutter channel, MAC,
//! injector, keystroke files). Both are parsed and cross-validated here,
//! before any hardware is touched; every problem is a fatal
//! [`Error::Config`].

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::device::{Device, DeviceFamily, DeviceMode, DfuConfig, InjectorConfig, ModeSpec};
use crate::error::{Error, Result};

fn default_probe_command() -> Vec<String> {
    vec!["cat".into(), "/proc/version".into()]
}

/// Catalog file: one entry per supported device model.
#[derive(Debug, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub model: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    /// Flashing family: "pc" or "dfu"
    pub family: String,
    pub service_mode: String,
    pub service_signature: String,
    pub test_mode: String,
    pub test_signature: String,
    /// Remote command whose output is matched against mode signatures
    #[serde(default = "default_probe_command")]
    pub probe_command: Vec<String>,
}

/// Topology file: the lab's physically attached devices and cutters.
#[derive(Debug, Deserialize)]
pub struct TopologyFile {
    /// Cutter families to probe at startup, e.g. ["cleware", "usbrelay"]
    #[serde(default)]
    pub cutter_families: Vec<String>,
    /// Directory exported over NFS to service-mode devices; images must
    /// live underneath it
    pub nfs_dir: Option<PathBuf>,
    #[serde(default)]
    pub device: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub name: String,
    pub model: String,
    pub cutter: String,
    pub channel: u32,
    pub mac: String,
    pub leases_file: PathBuf,
    pub injector_interface: String,
    pub injector_port: String,
    pub service_keystrokes: PathBuf,
    pub test_keystrokes: PathBuf,
    pub check_keystrokes: PathBuf,
    pub target_device: String,
    pub root_partition: String,
    pub dfu: Option<DfuEntry>,
}

#[derive(Debug, Deserialize)]
pub struct DfuEntry {
    pub usb_path: String,
    pub boot_extension: String,
    pub update_extension: String,
    pub root_extension: String,
}

/// Parsed and cross-validated lab configuration.
#[derive(Debug)]
pub struct LabConfig {
    pub cutter_families: Vec<String>,
    pub nfs_dir: Option<PathBuf>,
    pub devices: Vec<Device>,
}

pub fn load_catalog(path: &Path) -> Result<CatalogFile> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read catalog {}: {}", path.display(), e)))?;
    parse_catalog(&text)
}

pub fn parse_catalog(text: &str) -> Result<CatalogFile> {
    let catalog: CatalogFile =
        toml::from_str(text).map_err(|e| Error::Config(format!("bad catalog: {}", e)))?;
    for model in &catalog.model {
        if DeviceFamily::parse(&model.family).is_none() {
            return Err(Error::Config(format!(
                "model {}: unknown family {:?} (expected \"pc\" or \"dfu\")",
                model.name, model.family
            )));
        }
        if model.probe_command.is_empty() {
            return Err(Error::Config(format!(
                "model {}: probe_command must not be empty",
                model.name
            )));
        }
    }
    Ok(catalog)
}

pub fn load_topology(path: &Path) -> Result<TopologyFile> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read topology {}: {}", path.display(), e)))?;
    toml::from_str(&text).map_err(|e| Error::Config(format!("bad topology: {}", e)))
}

/// Join topology entries with their catalog models into [`Device`] values.
pub fn build_devices(topology: &TopologyFile, catalog: &CatalogFile) -> Result<Vec<Device>> {
    let mut seen = HashSet::new();
    let mut devices = Vec::with_capacity(topology.device.len());

    for entry in &topology.device {
        if !seen.insert(entry.name.as_str()) {
            return Err(Error::Config(format!(
                "duplicate device name {:?} in topology",
                entry.name
            )));
        }

        let model = catalog
            .model
            .iter()
            .find(|m| m.name == entry.model)
            .ok_or_else(|| {
                Error::Config(format!(
                    "device {}: model {:?} not in catalog",
                    entry.name, entry.model
                ))
            })?;

        // validated in parse_catalog
        let family = DeviceFamily::parse(&model.family)
            .ok_or_else(|| Error::Config(format!("model {}: bad family", model.name)))?;

        let dfu = match (family, &entry.dfu) {
            (DeviceFamily::Dfu, Some(d)) => Some(DfuConfig {
                usb_path: d.usb_path.clone(),
                boot_extension: d.boot_extension.clone(),
                update_extension: d.update_extension.clone(),
                root_extension: d.root_extension.clone(),
            }),
            (DeviceFamily::Dfu, None) => {
                return Err(Error::Config(format!(
                    "device {}: dfu-family device needs a [device.dfu] section",
                    entry.name
                )));
            }
            (DeviceFamily::Pc, Some(_)) => {
                return Err(Error::Config(format!(
                    "device {}: [device.dfu] given for a pc-family device",
                    entry.name
                )));
            }
            (DeviceFamily::Pc, None) => None,
        };

        let mac = normalize_mac(&entry.mac).ok_or_else(|| {
            Error::Config(format!(
                "device {}: {:?} is not a MAC address",
                entry.name, entry.mac
            ))
        })?;

        devices.push(Device {
            name: entry.name.clone(),
            model: entry.model.clone(),
            family,
            cutter_id: entry.cutter.clone(),
            channel_id: entry.channel,
            hardware_id: mac,
            leases_file: entry.leases_file.clone(),
            injector: InjectorConfig {
                interface: entry.injector_interface.clone(),
                port: entry.injector_port.clone(),
            },
            check_keystrokes: entry.check_keystrokes.clone(),
            service_mode: ModeSpec {
                name: model.service_mode.clone(),
                keystrokes: entry.service_keystrokes.clone(),
                signature: model.service_signature.clone(),
            },
            test_mode: ModeSpec {
                name: model.test_mode.clone(),
                keystrokes: entry.test_keystrokes.clone(),
                signature: model.test_signature.clone(),
            },
            target_device: entry.target_device.clone(),
            root_partition: entry.root_partition.clone(),
            probe_command: model.probe_command.clone(),
            dfu,
            current_mode: DeviceMode::Unknown,
            ip: None,
        });
    }

    Ok(devices)
}

/// Load both files and produce the process-wide lab configuration.
pub fn load(topology_path: &Path, catalog_path: &Path) -> Result<LabConfig> {
    let catalog = load_catalog(catalog_path)?;
    let topology = load_topology(topology_path)?;
    let devices = build_devices(&topology, &catalog)?;
    Ok(LabConfig {
        cutter_families: topology.cutter_families.clone(),
        nfs_dir: topology.nfs_dir.clone(),
        devices,
    })
}

/// Lowercase a MAC address, accepting ':' or '-' separators.
fn normalize_mac(s: &str) -> Option<String> {
    let parts: Vec<&str> = s.split([':', '-']).collect();
    if parts.len() != 6 {
        return None;
    }
    if !parts
        .iter()
        .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return None;
    }
    Some(parts.join(":").to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
        [[model]]
        name = "minnowboard"
        family = "pc"
        service_mode = "service"
        service_signature = "-service"
        test_mode = "test"
        test_signature = "-yocto"

        [[model]]
        name = "edison"
        family = "dfu"
        service_mode = "service"
        service_signature = "-service"
        test_mode = "test"
        test_signature = "-edison"
    "#;

    const TOPOLOGY: &str = r#"
        cutter_families = ["cleware"]
        nfs_dir = "/home/tester"

        [[device]]
        name = "minnow-1"
        model = "minnowboard"
        cutter = "900142"
        channel = 0
        mac = "98:4F:EE:00:12:34"
        leases_file = "/var/lib/misc/dnsmasq.leases"
        injector_interface = "ttyUSB3"
        injector_port = "2"
        service_keystrokes = "/etc/dutlab/keys/f2-service"
        test_keystrokes = "/etc/dutlab/keys/boot"
        check_keystrokes = "/etc/dutlab/keys/enter"
        target_device = "/dev/sda"
        root_partition = "/dev/sda2"
    "#;

    #[test]
    fn test_build_devices() {
        let catalog = parse_catalog(CATALOG).unwrap();
        let topology: TopologyFile = toml::from_str(TOPOLOGY).unwrap();
        let devices = build_devices(&topology, &catalog).unwrap();

        assert_eq!(devices.len(), 1);
        let d = &devices[0];
        assert_eq!(d.name, "minnow-1");
        assert_eq!(d.family, DeviceFamily::Pc);
        assert_eq!(d.hardware_id, "98:4f:ee:00:12:34");
        assert_eq!(d.service_mode.signature, "-service");
        assert_eq!(d.probe_command, vec!["cat", "/proc/version"]);
        assert_eq!(d.current_mode, DeviceMode::Unknown);
    }

    #[test]
    fn test_unknown_model_is_config_error() {
        let catalog = parse_catalog(CATALOG).unwrap();
        let mut topology: TopologyFile = toml::from_str(TOPOLOGY).unwrap();
        topology.device[0].model = "no-such-model".into();

        let err = build_devices(&topology, &catalog).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_dfu_family_requires_dfu_section() {
        let catalog = parse_catalog(CATALOG).unwrap();
        let mut topology: TopologyFile = toml::from_str(TOPOLOGY).unwrap();
        topology.device[0].model = "edison".into();

        let err = build_devices(&topology, &catalog).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_bad_family_rejected_at_catalog_parse() {
        let text = CATALOG.replace("\"dfu\"", "\"toaster\"");
        assert!(matches!(parse_catalog(&text), Err(Error::Config(_))));
    }

    #[test]
    fn test_bad_mac_rejected() {
        let catalog = parse_catalog(CATALOG).unwrap();
        let mut topology: TopologyFile = toml::from_str(TOPOLOGY).unwrap();
        topology.device[0].mac = "not-a-mac".into();

        assert!(matches!(
            build_devices(&topology, &catalog),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_duplicate_device_name_rejected() {
        let catalog = parse_catalog(CATALOG).unwrap();
        let doubled = format!("{}\n{}", TOPOLOGY, &TOPOLOGY[TOPOLOGY.find("[[device]]").unwrap()..]);
        let topology: TopologyFile = toml::from_str(&doubled).unwrap();

        assert!(matches!(
            build_devices(&topology, &catalog),
            Err(Error::Config(_))
        ));
    }
}
