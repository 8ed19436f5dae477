//! DHCP lease table polling
//!
//! Devices announce themselves by taking a DHCP lease once booted; the
//! server's lease table (dnsmasq format) is the only place their address
//! shows up. The table is re-read on every poll because it is rewritten
//! externally, and a device can hold several stale entries, so every
//! candidate address is probed until one answers.

use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use dutlab_core::error::Result;
use dutlab_core::remote::RemoteShell;

/// How long a responsiveness probe may take per candidate address
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// All addresses the lease table currently assigns to `hardware_id`.
///
/// Lease lines look like `1623760000 aa:bb:cc:dd:ee:ff 192.168.30.4 host *`;
/// anything that does not parse is skipped (the file is rewritten in place
/// and a torn line is normal).
pub fn addresses_for(leases_file: &Path, hardware_id: &str) -> Result<Vec<IpAddr>> {
    let text = fs::read_to_string(leases_file)?;
    Ok(parse_addresses(&text, hardware_id))
}

fn parse_addresses(text: &str, hardware_id: &str) -> Vec<IpAddr> {
    let mut addresses = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_expiry), Some(mac), Some(ip)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !mac.eq_ignore_ascii_case(hardware_id) {
            continue;
        }
        if let Ok(ip) = ip.parse() {
            addresses.push(ip);
        }
    }
    addresses
}

/// Poll the lease table until one of the device's addresses answers a
/// remote probe, or `boot_timeout` runs out.
///
/// A single unreadable table or unanswered probe is never surfaced; the
/// device is expected to be mid-boot for most of this window.
pub fn wait_for_responsive_ip(
    shell: &dyn RemoteShell,
    leases_file: &Path,
    hardware_id: &str,
    boot_timeout: Duration,
    polling_interval: Duration,
) -> Option<IpAddr> {
    let deadline = Instant::now() + boot_timeout;
    loop {
        let candidates = match addresses_for(leases_file, hardware_id) {
            Ok(addresses) => addresses,
            Err(e) => {
                log::debug!("lease table not readable yet: {}", e);
                Vec::new()
            }
        };

        for ip in candidates {
            if probe(shell, ip) {
                log::info!("device {} responsive at {}", hardware_id, ip);
                return Some(ip);
            }
        }

        if Instant::now() >= deadline {
            log::warn!(
                "no responsive address for {} within {:?}",
                hardware_id,
                boot_timeout
            );
            return None;
        }
        std::thread::sleep(polling_interval);
    }
}

fn probe(shell: &dyn RemoteShell, ip: IpAddr) -> bool {
    match shell.execute(ip, &["true"], PROBE_TIMEOUT, "root") {
        Ok(Some(output)) => output.success(),
        Ok(None) => false,
        Err(e) => {
            log::debug!("probe of {} failed: {}", ip, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
1623760000 98:4f:ee:00:12:34 192.168.30.4 minnow-1 *
1623760900 98:4f:ee:00:12:34 192.168.30.17 minnow-1 *
1623761000 aa:bb:cc:dd:ee:ff 192.168.30.5 other *
garbage line
";

    #[test]
    fn test_parse_addresses_all_candidates_for_mac() {
        let addresses = parse_addresses(TABLE, "98:4f:ee:00:12:34");
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0], "192.168.30.4".parse::<IpAddr>().unwrap());
        assert_eq!(addresses[1], "192.168.30.17".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_parse_addresses_case_insensitive_mac() {
        let addresses = parse_addresses(TABLE, "98:4F:EE:00:12:34");
        assert_eq!(addresses.len(), 2);
    }

    #[test]
    fn test_parse_addresses_ignores_garbage() {
        assert!(parse_addresses(TABLE, "11:22:33:44:55:66").is_empty());
    }
}
