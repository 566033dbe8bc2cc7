//! PCI device records handed to the USB stack
//!
//! Bus enumeration itself belongs to the kernel. The USB stack receives one
//! [`PciDevice`] per function and uses the [`crate::Platform`] to touch its
//! configuration space.

use crate::platform::Platform;

/// Serial bus controller class
pub const CLASS_SERIAL: u8 = 0x0C;
/// USB controller subclass of [`CLASS_SERIAL`]
pub const SUBCLASS_USB: u8 = 0x03;

/// Programming interfaces of USB host controllers
pub mod prog_if {
    pub const UHCI: u8 = 0x00;
    pub const OHCI: u8 = 0x10;
    pub const EHCI: u8 = 0x20;
    pub const XHCI: u8 = 0x30;
}

/// Configuration space offsets used by the drivers
pub mod config {
    pub const COMMAND: u8 = 0x04;
}

/// Command register bits
pub mod command {
    pub const IO_SPACE: u16 = 1 << 0;
    pub const MEMORY_SPACE: u16 = 1 << 1;
    pub const BUS_MASTER: u16 = 1 << 2;
}

/// PCI device location (Bus:Device.Function)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }
}

impl core::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// PCI BAR type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarType {
    #[default]
    Unused,
    Memory32,
    Memory64,
    Io,
}

/// PCI Base Address Register
#[derive(Debug, Clone, Copy, Default)]
pub struct PciBar {
    pub bar_type: BarType,
    pub address: u64,
    pub size: u64,
}

impl PciBar {
    pub const fn memory(address: u64, size: u64) -> Self {
        Self {
            bar_type: BarType::Memory32,
            address,
            size,
        }
    }

    pub const fn io(address: u64, size: u64) -> Self {
        Self {
            bar_type: BarType::Io,
            address,
            size,
        }
    }
}

/// PCI function information
#[derive(Debug, Clone)]
pub struct PciDevice {
    pub address: PciAddress,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub bars: [PciBar; 6],
    pub interrupt_line: u8,
}

impl PciDevice {
    /// Create a device record with no BARs
    pub fn new(address: PciAddress, class_code: u8, subclass: u8, prog_if: u8) -> Self {
        Self {
            address,
            vendor_id: 0,
            device_id: 0,
            class_code,
            subclass,
            prog_if,
            bars: [PciBar::default(); 6],
            interrupt_line: 0,
        }
    }

    /// First memory BAR (OHCI and EHCI registers live in BAR0)
    pub fn mmio_bar(&self) -> Option<&PciBar> {
        self.bars
            .iter()
            .find(|bar| matches!(bar.bar_type, BarType::Memory32 | BarType::Memory64))
    }

    /// First I/O BAR (UHCI registers live in BAR4)
    pub fn io_bar(&self) -> Option<&PciBar> {
        self.bars.iter().find(|bar| bar.bar_type == BarType::Io)
    }

    /// Check if this is a USB host controller
    pub fn is_usb_controller(&self) -> bool {
        self.class_code == CLASS_SERIAL && self.subclass == SUBCLASS_USB
    }
}

/// Enable bus mastering plus memory and I/O decoding for a device
pub fn enable_device(platform: &dyn Platform, dev: &PciDevice) {
    let cmd = platform.pci_read16(dev.address, config::COMMAND);
    let new_cmd = cmd | command::IO_SPACE | command::MEMORY_SPACE | command::BUS_MASTER;

    // Status (upper half) is write-one-to-clear, write zeroes there.
    platform.pci_write32(dev.address, config::COMMAND, new_cmd as u32);

    log::debug!(
        "Enabled device {}: cmd {:#06x} -> {:#06x}",
        dev.address,
        cmd,
        new_cmd
    );
}
