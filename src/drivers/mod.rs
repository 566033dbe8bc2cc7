//! Hardware drivers
//!
//! Register access, PCI configuration and the USB host controllers.

pub mod mmio;
pub mod pci;
#[cfg(target_arch = "x86_64")]
pub mod port_io;
pub mod usb;
