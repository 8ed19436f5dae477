//! Process-wide device pool state
//!
//! One `FleetState` is built per process from the parsed topology and
//! passed by reference to whatever needs it. There is deliberately no
//! global: the set of devices a process knows about is an input, not
//! ambient state.

use dutlab_core::device::Device;

/// The devices this process knows about.
#[derive(Debug)]
pub struct FleetState {
    devices: Vec<Device>,
}

impl FleetState {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn device_mut(&mut self, name: &str) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
