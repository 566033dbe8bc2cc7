//! USB Core Types
//!
//! Common types shared by the transfer engine, the three host controller
//! backends and device enumeration: speeds, endpoint and request encodings,
//! the standard descriptors, per-transaction completion codes and the error
//! type every fallible operation returns.

use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

// ============================================================================
// Controller Family
// ============================================================================

/// The host controller hardware families this crate drives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerFamily {
    /// Open Host Controller Interface (USB 1.1, MMIO)
    Ohci,
    /// Universal Host Controller Interface (USB 1.1, port I/O)
    Uhci,
    /// Enhanced Host Controller Interface (USB 2.0, MMIO)
    Ehci,
}

impl ControllerFamily {
    /// Map a PCI programming interface to a family. xHCI and unknown values
    /// are not handled by this crate.
    pub fn from_prog_if(prog_if: u8) -> Option<Self> {
        use crate::drivers::pci::prog_if;
        match prog_if {
            prog_if::UHCI => Some(Self::Uhci),
            prog_if::OHCI => Some(Self::Ohci),
            prog_if::EHCI => Some(Self::Ehci),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ohci => "OHCI",
            Self::Uhci => "UHCI",
            Self::Ehci => "EHCI",
        }
    }
}

impl core::fmt::Display for ControllerFamily {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// USB Speed
// ============================================================================

/// USB device speed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum UsbSpeed {
    /// Low speed (1.5 Mbps)
    Low = 1,
    /// Full speed (12 Mbps)
    #[default]
    Full = 2,
    /// High speed (480 Mbps)
    High = 3,
}

impl UsbSpeed {
    /// Default max packet size for control endpoint 0 before the device
    /// descriptor has been read
    pub fn default_max_packet_size(self) -> u16 {
        match self {
            UsbSpeed::Low | UsbSpeed::Full => 8,
            UsbSpeed::High => 64,
        }
    }

    /// Speed of a device on an OHCI or UHCI root port
    pub fn from_low_speed_bit(is_low_speed: bool) -> Self {
        if is_low_speed {
            UsbSpeed::Low
        } else {
            UsbSpeed::Full
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UsbSpeed::Low => "low-speed",
            UsbSpeed::Full => "full-speed",
            UsbSpeed::High => "high-speed",
        }
    }
}

// ============================================================================
// Endpoints, Transfers and Tokens
// ============================================================================

/// USB endpoint transfer type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointType {
    /// Create from endpoint descriptor attributes field
    pub fn from_attributes(attr: u8) -> Self {
        match attr & 0x03 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }
}

/// Data direction of an endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Direction::Out => 0,
            Direction::In => 1,
        }
    }
}

/// Transfer type of a logical request. Each type owns its own region of the
/// controller's descriptor pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Bulk,
}

/// Token of one transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pid {
    Setup,
    In,
    Out,
}

impl Pid {
    pub fn name(self) -> &'static str {
        match self {
            Pid::Setup => "SETUP",
            Pid::In => "IN",
            Pid::Out => "OUT",
        }
    }
}

// ============================================================================
// USB Descriptors
// ============================================================================

/// USB descriptor types
pub mod desc_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
}

/// USB Device Descriptor (18 bytes)
#[repr(C, packed)]
#[derive(FromBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Default, Debug)]
pub struct DeviceDescriptor {
    /// Size of this descriptor (18)
    pub length: u8,
    /// Descriptor type (1 = device)
    pub descriptor_type: u8,
    /// USB specification release number (BCD)
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    /// Maximum packet size for endpoint 0
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device release number (BCD)
    pub bcd_device: u16,
    /// Index of manufacturer string descriptor
    pub manufacturer: u8,
    /// Index of product string descriptor
    pub product: u8,
    /// Index of serial number string descriptor
    pub serial_number: u8,
    pub num_configurations: u8,
}

/// USB Configuration Descriptor header (9 bytes)
#[repr(C, packed)]
#[derive(FromBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Default, Debug)]
pub struct ConfigurationDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// Total length of all descriptors for this configuration
    pub total_length: u16,
    pub num_interfaces: u8,
    /// Configuration value for SET_CONFIGURATION
    pub configuration_value: u8,
    pub configuration: u8,
    pub attributes: u8,
    /// Maximum power consumption (in 2mA units)
    pub max_power: u8,
}

/// USB Interface Descriptor (9 bytes)
#[repr(C, packed)]
#[derive(FromBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Default, Debug)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface: u8,
}

/// USB Endpoint Descriptor (7 bytes)
#[repr(C, packed)]
#[derive(FromBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Default, Debug)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// Endpoint address (bit 7 = direction: 1=IN, 0=OUT)
    pub endpoint_address: u8,
    /// Attributes (bits 0-1 = transfer type)
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Get the endpoint number (0-15)
    pub fn endpoint_number(&self) -> u8 {
        self.endpoint_address & 0x0F
    }

    pub fn is_in(&self) -> bool {
        (self.endpoint_address & 0x80) != 0
    }

    pub fn transfer_type(&self) -> EndpointType {
        EndpointType::from_attributes(self.attributes)
    }
}

// ============================================================================
// USB Request Types and Standard Requests
// ============================================================================

/// USB request type fields
pub mod req_type {
    /// Direction: Host to Device
    pub const DIR_OUT: u8 = 0x00;
    /// Direction: Device to Host
    pub const DIR_IN: u8 = 0x80;

    pub const TYPE_STANDARD: u8 = 0x00;
    pub const TYPE_CLASS: u8 = 0x20;

    pub const RCPT_DEVICE: u8 = 0x00;
    pub const RCPT_INTERFACE: u8 = 0x01;
    pub const RCPT_ENDPOINT: u8 = 0x02;
}

/// USB standard requests
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_CONFIGURATION: u8 = 0x09;
}

/// Standard feature selectors
pub mod feature {
    pub const ENDPOINT_HALT: u16 = 0;
}

/// USB device class codes
pub mod class {
    /// Mass Storage
    pub const MASS_STORAGE: u8 = 0x08;
    /// Hub
    pub const HUB: u8 = 0x09;
}

/// Bulk-only transport protocol code of a mass storage interface
pub const MSC_PROTOCOL_BBB: u8 = 0x50;

/// The 8-byte SETUP packet of a control transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// Direction of the data stage
    pub fn direction(&self) -> Direction {
        if self.request_type & req_type::DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Wire format (little endian)
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}

// ============================================================================
// USB Endpoint Info
// ============================================================================

/// Information about a USB endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint number (0-15)
    pub number: u8,
    pub direction: Direction,
    pub transfer_type: EndpointType,
    pub max_packet_size: u16,
    /// Polling interval (for interrupt endpoints)
    pub interval: u8,
}

impl EndpointInfo {
    pub fn from_descriptor(desc: &EndpointDescriptor) -> Self {
        Self {
            number: desc.endpoint_number(),
            direction: if desc.is_in() {
                Direction::In
            } else {
                Direction::Out
            },
            transfer_type: desc.transfer_type(),
            max_packet_size: desc.max_packet_size,
            interval: desc.interval,
        }
    }

    /// Endpoint address as it appears in requests (direction in bit 7)
    pub fn address(&self) -> u8 {
        match self.direction {
            Direction::In => self.number | 0x80,
            Direction::Out => self.number,
        }
    }
}

// ============================================================================
// Completion Codes
// ============================================================================

/// Completion status of one transaction as reported by the hardware.
///
/// The numbering follows the OHCI condition code field; UHCI and EHCI status
/// bits are translated into the closest code by their backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionCode {
    NoError,
    Crc,
    BitStuffing,
    DataToggleMismatch,
    Stall,
    NotResponding,
    PidCheckFailure,
    UnexpectedPid,
    DataOverrun,
    DataUnderrun,
    BufferOverrun,
    BufferUnderrun,
    /// The hardware has not processed the descriptor yet
    NotAccessed,
    /// The device kept transmitting past the end of its packet
    Babble,
}

impl CompletionCode {
    /// Decode an OHCI TD condition code
    pub fn from_ohci(cc: u32) -> Self {
        match cc & 0xF {
            0 => Self::NoError,
            1 => Self::Crc,
            2 => Self::BitStuffing,
            3 => Self::DataToggleMismatch,
            4 => Self::Stall,
            5 => Self::NotResponding,
            6 => Self::PidCheckFailure,
            7 => Self::UnexpectedPid,
            8 => Self::DataOverrun,
            9 => Self::DataUnderrun,
            12 => Self::BufferOverrun,
            13 => Self::BufferUnderrun,
            // 10 and 11 are reserved, 14 and 15 mean "not accessed"
            _ => Self::NotAccessed,
        }
    }

    /// OHCI TD condition code field value
    pub fn to_ohci(self) -> u32 {
        match self {
            Self::NoError => 0,
            Self::Crc => 1,
            Self::BitStuffing => 2,
            Self::DataToggleMismatch => 3,
            Self::Stall => 4,
            Self::NotResponding => 5,
            Self::PidCheckFailure => 6,
            Self::UnexpectedPid => 7,
            Self::DataOverrun | Self::Babble => 8,
            Self::DataUnderrun => 9,
            Self::BufferOverrun => 12,
            Self::BufferUnderrun => 13,
            Self::NotAccessed => 15,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::NoError
    }

    /// Human-readable explanation for diagnostics
    pub fn description(self) -> &'static str {
        match self {
            Self::NoError => "successful completion",
            Self::Crc => "last data packet from endpoint contained a CRC error",
            Self::BitStuffing => "last data packet from endpoint contained a bit stuffing violation",
            Self::DataToggleMismatch => {
                "last packet from endpoint had data toggle PID that did not match the expected value"
            }
            Self::Stall => "TD was moved to the Done Queue because the endpoint returned a STALL PID",
            Self::NotResponding => "device: no response to token (IN) or no handshake (OUT)",
            Self::PidCheckFailure => {
                "check bits on PID from endpoint failed on data PID (IN) or handshake (OUT)"
            }
            Self::UnexpectedPid => "receive PID was not valid when encountered or PID value is not defined",
            Self::DataOverrun => "too much data returned by the endpoint",
            Self::DataUnderrun => "endpoint returned less than MPS",
            Self::BufferOverrun => "buffer overrun",
            Self::BufferUnderrun => "buffer underrun",
            Self::NotAccessed => "not accessed",
            Self::Babble => "babble detected",
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// USB controller error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// Controller not ready
    NotReady,
    /// Operation timed out
    Timeout,
    /// No free device addresses
    NoFreeSlots,
    /// DMA memory allocation failed
    AllocationFailed,
    /// Device not found
    DeviceNotFound,
    /// Invalid parameter
    InvalidParameter,
    /// Controller type or device not supported
    Unsupported,
    /// The descriptor pool still holds an unretired transfer
    PoolBusy,
    /// A transfer needs more descriptors than its pool region holds
    PoolExhausted,
    /// Endpoint stalled
    Stall,
    /// Data toggle mismatch
    ToggleError,
    /// CRC error
    CrcError,
    /// Babble detected
    Babble,
    /// USB transaction error
    TransactionError,
    /// Transfer failed with completion code
    TransferFailed(CompletionCode),
    /// Device disconnected
    Disconnected,
    /// Unrecoverable controller error
    ControllerFailed,
}

impl From<CompletionCode> for UsbError {
    fn from(code: CompletionCode) -> Self {
        match code {
            CompletionCode::Stall => UsbError::Stall,
            CompletionCode::DataToggleMismatch => UsbError::ToggleError,
            CompletionCode::Crc => UsbError::CrcError,
            CompletionCode::Babble => UsbError::Babble,
            other => UsbError::TransferFailed(other),
        }
    }
}

impl core::fmt::Display for UsbError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            UsbError::NotReady => write!(f, "controller not ready"),
            UsbError::Timeout => write!(f, "operation timed out"),
            UsbError::NoFreeSlots => write!(f, "no free device addresses"),
            UsbError::AllocationFailed => write!(f, "DMA allocation failed"),
            UsbError::DeviceNotFound => write!(f, "device not found"),
            UsbError::InvalidParameter => write!(f, "invalid parameter"),
            UsbError::Unsupported => write!(f, "not supported"),
            UsbError::PoolBusy => write!(f, "descriptor pool has an outstanding transfer"),
            UsbError::PoolExhausted => write!(f, "transfer does not fit in the descriptor pool"),
            UsbError::Stall => write!(f, "endpoint stalled"),
            UsbError::ToggleError => write!(f, "data toggle mismatch"),
            UsbError::CrcError => write!(f, "CRC error"),
            UsbError::Babble => write!(f, "babble detected"),
            UsbError::TransactionError => write!(f, "transaction error"),
            UsbError::TransferFailed(code) => write!(f, "transfer failed: {}", code.description()),
            UsbError::Disconnected => write!(f, "device disconnected"),
            UsbError::ControllerFailed => write!(f, "unrecoverable controller error"),
        }
    }
}

/// Result type of the USB stack
pub type Result<T> = core::result::Result<T, UsbError>;

// ============================================================================
// Configuration Descriptor Parser
// ============================================================================

/// Iterator over descriptors in a configuration
pub struct DescriptorIterator<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> DescriptorIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl<'a> Iterator for DescriptorIterator<'a> {
    type Item = (u8, &'a [u8]); // (descriptor_type, descriptor_data)

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.data.get(self.offset..)?;
        let len = *rest.first()? as usize;
        if len < 2 || len > rest.len() {
            return None;
        }

        let desc = &rest[..len];
        self.offset += len;
        Some((desc[1], desc))
    }
}

/// Maximum interfaces kept per configuration
pub const MAX_INTERFACES: usize = 8;
/// Maximum endpoints kept per interface
pub const MAX_ENDPOINTS: usize = 4;

/// Parsed interface information
#[derive(Clone, Debug, Default)]
pub struct InterfaceInfo {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub endpoints: heapless::Vec<EndpointInfo, MAX_ENDPOINTS>,
}

impl InterfaceInfo {
    /// Check if this is a mass storage interface (BBB protocol)
    pub fn is_mass_storage(&self) -> bool {
        self.interface_class == class::MASS_STORAGE
            && self.interface_protocol == MSC_PROTOCOL_BBB
    }

    pub fn find_bulk_in(&self) -> Option<&EndpointInfo> {
        self.endpoints
            .iter()
            .find(|ep| ep.transfer_type == EndpointType::Bulk && ep.direction == Direction::In)
    }

    pub fn find_bulk_out(&self) -> Option<&EndpointInfo> {
        self.endpoints
            .iter()
            .find(|ep| ep.transfer_type == EndpointType::Bulk && ep.direction == Direction::Out)
    }
}

/// Parsed configuration information
#[derive(Clone, Debug, Default)]
pub struct ConfigurationInfo {
    pub configuration_value: u8,
    pub interfaces: heapless::Vec<InterfaceInfo, MAX_INTERFACES>,
}

impl ConfigurationInfo {
    pub fn mass_storage_interface(&self) -> Option<&InterfaceInfo> {
        self.interfaces.iter().find(|iface| iface.is_mass_storage())
    }
}

/// Parse a configuration descriptor set into interfaces and endpoints
pub fn parse_configuration(config_data: &[u8]) -> ConfigurationInfo {
    let mut info = ConfigurationInfo::default();

    let Ok((config, _)) = ConfigurationDescriptor::read_from_prefix(config_data) else {
        return info;
    };
    info.configuration_value = config.configuration_value;

    let mut current: Option<InterfaceInfo> = None;

    for (kind, desc) in DescriptorIterator::new(config_data) {
        match kind {
            desc_type::INTERFACE => {
                if let Some(iface) = current.take() {
                    let _ = info.interfaces.push(iface);
                }
                if let Ok((iface, _)) = InterfaceDescriptor::read_from_prefix(desc) {
                    current = Some(InterfaceInfo {
                        interface_number: iface.interface_number,
                        alternate_setting: iface.alternate_setting,
                        interface_class: iface.interface_class,
                        interface_subclass: iface.interface_subclass,
                        interface_protocol: iface.interface_protocol,
                        endpoints: heapless::Vec::new(),
                    });
                }
            }
            desc_type::ENDPOINT => {
                if let (Some(iface), Ok((ep, _))) =
                    (current.as_mut(), EndpointDescriptor::read_from_prefix(desc))
                {
                    let _ = iface.endpoints.push(EndpointInfo::from_descriptor(&ep));
                }
            }
            _ => {}
        }
    }

    if let Some(iface) = current {
        let _ = info.interfaces.push(iface);
    }

    info
}
