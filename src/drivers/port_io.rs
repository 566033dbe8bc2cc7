//! Port-mapped I/O register window
//!
//! UHCI exposes its registers in I/O space (BAR4) rather than memory space.
//! [`IoPortBlock`] gives that window the same [`RegisterBlock`] interface
//! as an MMIO BAR so the drivers do not care which one they get.

use x86_64::instructions::port::Port;

use crate::platform::RegisterBlock;

/// An I/O port range starting at `base`
#[derive(Clone, Copy, Debug)]
pub struct IoPortBlock {
    base: u16,
}

impl IoPortBlock {
    pub const fn new(base: u16) -> Self {
        Self { base }
    }

    /// First port of the range
    pub const fn base(&self) -> u16 {
        self.base
    }

    #[inline]
    fn port(&self, offset: u32) -> u16 {
        self.base.wrapping_add(offset as u16)
    }
}

impl RegisterBlock for IoPortBlock {
    fn read32(&self, offset: u32) -> u32 {
        let mut port: Port<u32> = Port::new(self.port(offset));
        // SAFETY: the range was assigned to this controller by PCI enumeration
        unsafe { port.read() }
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut port: Port<u32> = Port::new(self.port(offset));
        unsafe { port.write(value) }
    }

    fn read16(&self, offset: u32) -> u16 {
        let mut port: Port<u16> = Port::new(self.port(offset));
        unsafe { port.read() }
    }

    fn write16(&self, offset: u32, value: u16) {
        let mut port: Port<u16> = Port::new(self.port(offset));
        unsafe { port.write(value) }
    }
}
