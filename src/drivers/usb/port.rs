//! Root ports and enumerated devices

use super::controller::{
    ConfigurationInfo, DeviceDescriptor, Direction, EndpointInfo, UsbSpeed,
};
use crate::platform::DiskId;

/// Root port state machine
///
/// ```text
/// DISCONNECTED --connect--> RESETTING --reset done--> ENABLED --enumerated--> DEVICE_READY
///      ^                        |                        |                         |
///      +------ reset timeout ---+                        +------- disconnect ------+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PortState {
    #[default]
    Disconnected,
    Resetting,
    Enabled,
    DeviceReady,
}

/// Connection state read back from a root port register
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortStatus {
    pub connected: bool,
    pub enabled: bool,
    pub speed: UsbSpeed,
    /// Connect status change latched by the hardware
    pub changed: bool,
}

/// One root port of a controller
#[derive(Debug)]
pub struct Port {
    /// 0-based index on the root hub
    pub index: u8,
    pub state: PortState,
    /// Authoritative "run reset/enumeration" flag
    pub connected: bool,
    pub enabled: bool,
    pub speed: UsbSpeed,
    /// Device enumerated on this port
    pub device: Option<Device>,
    /// Disk record the device manager created for it
    pub disk: Option<DiskId>,
}

impl Port {
    pub fn new(index: u8) -> Self {
        Self {
            index,
            state: PortState::Disconnected,
            connected: false,
            enabled: false,
            speed: UsbSpeed::Full,
            device: None,
            disk: None,
        }
    }

    /// Drop all knowledge of the attached device
    pub fn clear(&mut self) {
        self.state = PortState::Disconnected;
        self.connected = false;
        self.enabled = false;
        self.device = None;
        self.disk = None;
    }
}

/// An enumerated USB peripheral
#[derive(Clone, Debug)]
pub struct Device {
    /// Assigned address (0 until SET_ADDRESS)
    pub address: u8,
    pub speed: UsbSpeed,
    /// Max packet size of endpoint 0
    pub max_packet0: u16,
    pub descriptor: DeviceDescriptor,
    pub config: ConfigurationInfo,
    /// SET_CONFIGURATION was issued
    pub configured: bool,
    pub bulk_in: Option<EndpointInfo>,
    pub bulk_out: Option<EndpointInfo>,
    /// First supported string language (0 if the device has no strings)
    pub language: u16,
    pub product: heapless::String<64>,
    pub serial: heapless::String<32>,
    /// Next data toggle per endpoint number, one bit per endpoint, indexed
    /// by direction
    toggles: [u16; 2],
}

impl Device {
    /// A device in the default state, reachable at address 0
    pub fn new(speed: UsbSpeed) -> Self {
        Self {
            address: 0,
            speed,
            max_packet0: speed.default_max_packet_size(),
            descriptor: DeviceDescriptor::default(),
            config: ConfigurationInfo::default(),
            configured: false,
            bulk_in: None,
            bulk_out: None,
            language: 0,
            product: heapless::String::new(),
            serial: heapless::String::new(),
            toggles: [0; 2],
        }
    }

    /// Toggle the next transaction on `endpoint` must carry
    pub fn toggle(&self, endpoint: u8, direction: Direction) -> bool {
        self.toggles[direction.index()] & (1 << (endpoint & 0xF)) != 0
    }

    pub fn set_toggle(&mut self, endpoint: u8, direction: Direction, toggle: bool) {
        let bit = 1 << (endpoint & 0xF);
        let word = &mut self.toggles[direction.index()];
        if toggle {
            *word |= bit;
        } else {
            *word &= !bit;
        }
    }

    /// Back to DATA0 on every endpoint (after SET_CONFIGURATION)
    pub fn reset_toggles(&mut self) {
        self.toggles = [0; 2];
    }

    pub fn is_mass_storage(&self) -> bool {
        self.config.mass_storage_interface().is_some()
    }
}
