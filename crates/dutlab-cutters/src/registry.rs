//! Backend registry and cutter set construction

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dutlab_core::cutter::{CutterBackend, CutterType, PowerChannel, SharedBackend};
use dutlab_core::error::{Error, Result};

/// Channel descriptor used for the "noop" passthrough family: any lookup
/// succeeds and switching does nothing, for lab hosts without power control.
static NOOP_TYPE: CutterType = CutterType {
    version: 0,
    model: "Noop",
    channels: 0,
    connect_value: 1,
    disconnect_value: 0,
    connect_settle: Duration::from_millis(0),
    disconnect_settle: Duration::from_millis(0),
};

/// Open a cutter backend by family name.
///
/// Families are compiled in behind cargo features; asking for a family that
/// is not built (or not spelled like anything we know) is a configuration
/// error, as is vendor tooling that turns out to be unusable.
pub fn open_family(name: &str) -> Result<Box<dyn CutterBackend>> {
    match name {
        #[cfg(feature = "cleware")]
        "cleware" => {
            let backend = dutlab_cleware::ClewareCutter::open()
                .map_err(|e| Error::Config(format!("cleware family: {}", e)))?;
            Ok(Box::new(backend))
        }

        #[cfg(feature = "usbrelay")]
        "usbrelay" => {
            let backend = dutlab_usbrelay::UsbrelayCutter::open()
                .map_err(|e| Error::Config(format!("usbrelay family: {}", e)))?;
            Ok(Box::new(backend))
        }

        #[cfg(feature = "dummy")]
        "dummy" => Ok(Box::new(dutlab_dummy::DummyCutter::new_default())),

        #[cfg(feature = "dummy")]
        "noop" => Ok(Box::new(dutlab_dummy::DummyCutter::new(
            dutlab_dummy::DummyConfig { units: vec![] },
        ))),

        _ => Err(Error::Config(format!("unknown cutter family: {}", name))),
    }
}

/// One probed, recognized relay unit.
pub struct Cutter {
    pub family: &'static str,
    pub id: String,
    pub cutter_type: &'static CutterType,
    backend: SharedBackend,
}

/// All cutters known to this process.
#[derive(Default)]
pub struct CutterSet {
    cutters: Vec<Cutter>,
    passthrough: Option<SharedBackend>,
}

impl CutterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open and probe every configured family.
    pub fn probe_families(families: &[String]) -> Result<Self> {
        let mut set = Self::new();
        for family in families {
            let backend = open_family(family)?;
            if family == "noop" {
                set.add_passthrough(backend);
            } else {
                set.add_backend(backend)?;
            }
        }
        Ok(set)
    }

    /// Probe one backend and register its recognized units.
    ///
    /// Units reporting a version the family's type table does not know are
    /// logged and skipped; they never fail the probe.
    pub fn add_backend(&mut self, mut backend: Box<dyn CutterBackend>) -> Result<usize> {
        let family = backend.family();
        let units = backend.probe()?;
        let shared: SharedBackend = Arc::new(Mutex::new(backend));

        let mut added = 0;
        for unit in units {
            let cutter_type = {
                let guard = shared
                    .lock()
                    .map_err(|_| Error::Transient("cutter backend mutex poisoned".into()))?;
                guard.cutter_type(unit.version)
            };
            match cutter_type {
                Some(t) => {
                    log::info!(
                        "cutter {} ({} {}, {} channel(s))",
                        unit.id,
                        family,
                        t.model,
                        t.channels
                    );
                    self.cutters.push(Cutter {
                        family,
                        id: unit.id,
                        cutter_type: t,
                        backend: Arc::clone(&shared),
                    });
                    added += 1;
                }
                None => {
                    log::warn!(
                        "skipping unrecognised {} cutter {} (version {})",
                        family,
                        unit.id,
                        unit.version
                    );
                }
            }
        }
        Ok(added)
    }

    /// Register a passthrough backend answering for every channel lookup
    /// that matches no real cutter.
    pub fn add_passthrough(&mut self, backend: Box<dyn CutterBackend>) {
        log::info!("power control disabled: noop cutter registered");
        self.passthrough = Some(Arc::new(Mutex::new(backend)));
    }

    /// The recognized cutters, in probe order.
    pub fn cutters(&self) -> &[Cutter] {
        &self.cutters
    }

    /// Look up the channel a device is wired to.
    pub fn channel(&self, cutter_id: &str, channel_id: u32) -> Result<PowerChannel> {
        if let Some(cutter) = self.cutters.iter().find(|c| c.id == cutter_id) {
            if channel_id >= cutter.cutter_type.channels {
                return Err(Error::Config(format!(
                    "cutter {} has {} channel(s), channel {} requested",
                    cutter_id, cutter.cutter_type.channels, channel_id
                )));
            }
            return Ok(PowerChannel::new(
                Arc::clone(&cutter.backend),
                cutter.id.clone(),
                channel_id,
                cutter.cutter_type,
            ));
        }

        if let Some(backend) = &self.passthrough {
            return Ok(PowerChannel::new(
                Arc::clone(backend),
                cutter_id.to_string(),
                channel_id,
                &NOOP_TYPE,
            ));
        }

        Err(Error::Config(format!(
            "no cutter with id {} attached",
            cutter_id
        )))
    }
}

/// Information about a compiled-in cutter family
pub struct FamilyInfo {
    /// Family name (used in topology files)
    pub name: &'static str,
    /// Short description
    pub description: &'static str,
}

/// All cutter families enabled at compile time
#[allow(unused_mut, clippy::vec_init_then_push)]
pub fn available_families() -> Vec<FamilyInfo> {
    let mut families = Vec::new();

    #[cfg(feature = "cleware")]
    families.push(FamilyInfo {
        name: "cleware",
        description: "Cleware USB/mains switches via clewarecontrol",
    });

    #[cfg(feature = "usbrelay")]
    families.push(FamilyInfo {
        name: "usbrelay",
        description: "Serial USB relay boards (9600 baud coil frames)",
    });

    #[cfg(feature = "dummy")]
    families.push(FamilyInfo {
        name: "dummy",
        description: "In-memory cutter emulator for testing",
    });

    #[cfg(feature = "dummy")]
    families.push(FamilyInfo {
        name: "noop",
        description: "Passthrough for hosts without power control",
    });

    families
}
