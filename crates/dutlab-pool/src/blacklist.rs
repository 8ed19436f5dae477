//! Persistent device blacklist
//!
//! The blacklist is how a known-defective physical unit is pulled out of
//! rotation without editing the topology. It must survive process
//! restarts, so it lives as a TOML file next to the lease files; updates
//! go through a sibling temp file and an atomic rename so a crashed writer
//! can never leave a half-written list.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use dutlab_core::error::{Error, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct BlacklistFile {
    #[serde(default)]
    pub entry: Vec<BlacklistEntry>,
}

/// One blacklisted device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub device: String,
    pub reason: String,
}

pub(crate) fn load(path: &Path) -> Result<BlacklistFile> {
    match fs::read_to_string(path) {
        Ok(text) => toml::from_str(&text)
            .map_err(|e| Error::Config(format!("bad blacklist {}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BlacklistFile::default()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn save(path: &Path, blacklist: &BlacklistFile) -> Result<()> {
    let text = toml::to_string_pretty(blacklist)
        .map_err(|e| Error::Config(format!("cannot serialize blacklist: {}", e)))?;
    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
