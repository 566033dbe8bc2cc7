//! Memory-Mapped I/O (MMIO) Register Abstraction
//!
//! This module provides type-safe access to controller MMIO registers using
//! tock-registers. It encapsulates volatile pointer operations and provides
//! bounds checking for register accesses in debug builds.
//!
//! # Example
//!
//! ```rust,ignore
//! use usbhc::drivers::mmio::MmioRegion;
//!
//! let mmio = MmioRegion::new(0xFEBF_0000, 0x1000)?;
//! let revision = mmio.read32(0x00); // HcRevision
//! mmio.write32(0x08, 1 << 1);      // HcCommandStatus.CLF
//! ```

use core::ptr::NonNull;
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::{ReadOnly, WriteOnly};

use crate::drivers::usb::controller::UsbError;
use crate::platform::RegisterBlock;

/// A memory-mapped register window.
#[derive(Clone, Copy)]
pub struct MmioRegion {
    /// Virtual base address of the window
    base: NonNull<u8>,
    /// Size of the window in bytes
    size: usize,
}

// SAFETY: MmioRegion only contains a pointer to controller MMIO space which
// stays mapped for the lifetime of the kernel session. Each access is a single
// volatile load or store.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Create a new MMIO region from a mapped base address and size.
    ///
    /// The caller must pass an address obtained from
    /// [`crate::Platform::map_mmio`] covering `size` bytes.
    pub fn new(base: u64, size: usize) -> Result<Self, UsbError> {
        let base = NonNull::new(base as *mut u8).ok_or(UsbError::NotReady)?;
        Ok(Self { base, size })
    }

    /// Get the base address of this MMIO region.
    #[inline]
    pub fn base(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    #[inline]
    fn check_bounds(&self, offset: u32, access_size: usize) {
        debug_assert!(
            (offset as usize).saturating_add(access_size) <= self.size,
            "MMIO access out of bounds: offset={:#x}, access_size={}, region_size={:#x}",
            offset,
            access_size,
            self.size
        );
    }

    /// Read a 16-bit register at the given offset.
    #[inline]
    pub fn read16(&self, offset: u32) -> u16 {
        self.check_bounds(offset, 2);
        let reg = unsafe { &*(self.base.as_ptr().add(offset as usize) as *const ReadOnly<u16>) };
        reg.get()
    }

    /// Write a 16-bit register at the given offset.
    #[inline]
    pub fn write16(&self, offset: u32, value: u16) {
        self.check_bounds(offset, 2);
        let reg = unsafe { &*(self.base.as_ptr().add(offset as usize) as *const WriteOnly<u16>) };
        reg.set(value);
    }

    /// Read a 32-bit register at the given offset.
    #[inline]
    pub fn read32(&self, offset: u32) -> u32 {
        self.check_bounds(offset, 4);
        let reg = unsafe { &*(self.base.as_ptr().add(offset as usize) as *const ReadOnly<u32>) };
        reg.get()
    }

    /// Write a 32-bit register at the given offset.
    #[inline]
    pub fn write32(&self, offset: u32, value: u32) {
        self.check_bounds(offset, 4);
        let reg = unsafe { &*(self.base.as_ptr().add(offset as usize) as *const WriteOnly<u32>) };
        reg.set(value);
    }
}

impl RegisterBlock for MmioRegion {
    fn read32(&self, offset: u32) -> u32 {
        MmioRegion::read32(self, offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        MmioRegion::write32(self, offset, value)
    }

    fn read16(&self, offset: u32) -> u16 {
        MmioRegion::read16(self, offset)
    }

    fn write16(&self, offset: u32, value: u16) {
        MmioRegion::write16(self, offset, value)
    }
}

impl core::fmt::Debug for MmioRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmioRegion")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}
