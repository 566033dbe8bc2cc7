//! Kernel services consumed by the USB host controller drivers
//!
//! The drivers never touch the PCI bus, the page tables, the timer, the
//! interrupt controller or the scheduler directly. Instead every controller
//! holds an `Arc<dyn Platform>` and asks it for these services. The disk
//! layer that enumerated mass-storage devices are handed to is reached
//! through [`DeviceManager`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ptr::NonNull;

use crate::drivers::mmio::MmioRegion;
use crate::drivers::pci::{BarType, PciAddress, PciBar};
use crate::drivers::usb::controller::{ControllerFamily, UsbError};
use crate::drivers::usb::host::UsbDisk;

/// Interrupt handler installed for a controller's IRQ line
pub type IrqHandler = Box<dyn Fn() + Send + Sync>;

/// Body of a cooperative task
pub type Task = Box<dyn FnOnce() + Send>;

/// Register window of a host controller (MMIO or port I/O)
///
/// Offsets are relative to the BAR. Accesses are volatile and take `&self`
/// so one block can be shared between the transfer path and the interrupt
/// handler.
pub trait RegisterBlock: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
    fn read16(&self, offset: u32) -> u16;
    fn write16(&self, offset: u32, value: u16);
}

/// A DMA-capable memory allocation
///
/// Hardware descriptors store physical addresses, the driver works on the
/// virtual mapping. Both are kept together so a slot's physical address can
/// be recomputed from its offset.
#[derive(Debug)]
pub struct DmaRegion {
    virt: NonNull<u8>,
    phys: u64,
    size: usize,
}

// SAFETY: the region is exclusively owned by one controller and only accessed
// with volatile reads/writes; the hardware is the only other party.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Wrap an allocation.
    ///
    /// # Safety
    ///
    /// `virt` must point to `size` writable bytes that stay mapped for the
    /// lifetime of the region, and `phys` must be the bus address of `virt`.
    pub unsafe fn new(virt: *mut u8, phys: u64, size: usize) -> Option<Self> {
        let virt = NonNull::new(virt)?;
        Some(Self { virt, phys, size })
    }

    /// Virtual base address
    #[inline]
    pub fn virt(&self) -> u64 {
        self.virt.as_ptr() as u64
    }

    /// Physical (bus) base address
    #[inline]
    pub fn phys(&self) -> u64 {
        self.phys
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Virtual pointer at `offset`
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.size, "DMA offset {:#x} out of range", offset);
        // SAFETY: offset is inside the allocation
        unsafe { self.virt.as_ptr().add(offset) }
    }

    /// Physical address at `offset`, truncated to the 32 bits the
    /// controllers can address
    #[inline]
    pub fn phys_at(&self, offset: usize) -> u32 {
        debug_assert!(offset <= self.size);
        (self.phys + offset as u64) as u32
    }

    /// Map a physical address inside this region back to its offset
    pub fn offset_of(&self, phys: u32) -> Option<usize> {
        let phys = phys as u64;
        if phys >= self.phys && phys < self.phys + self.size as u64 {
            Some((phys - self.phys) as usize)
        } else {
            None
        }
    }

    /// Fill the whole region with zeroes
    pub fn zero(&self) {
        // SAFETY: the region is `size` writable bytes
        unsafe { core::ptr::write_bytes(self.virt.as_ptr(), 0, self.size) };
    }
}

/// Services the kernel provides to the USB drivers
pub trait Platform: Send + Sync {
    /// Read a 32-bit PCI configuration register
    fn pci_read32(&self, addr: PciAddress, offset: u8) -> u32;

    /// Write a 32-bit PCI configuration register
    fn pci_write32(&self, addr: PciAddress, offset: u8, value: u32);

    /// Read a 16-bit PCI configuration register
    fn pci_read16(&self, addr: PciAddress, offset: u8) -> u16 {
        let dword = self.pci_read32(addr, offset & 0xFC);
        (dword >> ((offset & 2) * 8)) as u16
    }

    /// Write a 16-bit PCI configuration register
    ///
    /// The default goes through a 32-bit read-modify-write, which writes the
    /// neighbouring word back unchanged.
    fn pci_write16(&self, addr: PciAddress, offset: u8, value: u16) {
        let shift = (offset & 2) * 8;
        let dword = self.pci_read32(addr, offset & 0xFC);
        let dword = (dword & !(0xFFFF << shift)) | ((value as u32) << shift);
        self.pci_write32(addr, offset & 0xFC, dword);
    }

    /// Map a physical MMIO range and return its virtual address
    fn map_mmio(&self, phys: u64, size: usize) -> Result<u64, UsbError>;

    /// Sleep for `ms` milliseconds, yielding to other tasks
    fn sleep_ms(&self, ms: u32);

    /// Busy-wait for `us` microseconds
    fn delay_us(&self, us: u32);

    /// Allocate zeroed DMA memory with the given alignment
    fn alloc_dma(&self, size: usize, align: usize) -> Result<DmaRegion, UsbError>;

    /// Release DMA memory obtained from [`Platform::alloc_dma`]
    fn free_dma(&self, region: DmaRegion);

    /// Translate a virtual address to the physical address the hardware sees
    fn virt_to_phys(&self, virt: u64) -> u64;

    /// Install a handler for a PCI interrupt line
    fn install_irq(&self, irq: u8, handler: IrqHandler) -> Result<(), UsbError>;

    /// Create a cooperative task and make it runnable
    fn spawn_task(&self, name: &str, task: Task);

    /// Build the register window for a controller BAR
    fn register_block(&self, bar: &PciBar) -> Result<Arc<dyn RegisterBlock>, UsbError> {
        match bar.bar_type {
            BarType::Memory32 | BarType::Memory64 => {
                let size = (bar.size as usize).max(0x100);
                let virt = self.map_mmio(bar.address, size)?;
                Ok(Arc::new(MmioRegion::new(virt, size)?))
            }
            #[cfg(target_arch = "x86_64")]
            BarType::Io => Ok(Arc::new(crate::drivers::port_io::IoPortBlock::new(
                bar.address as u16,
            ))),
            _ => Err(UsbError::NotReady),
        }
    }
}

/// Opaque handle the device manager hands back for an attached disk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskId(pub u32);

/// A root port announced to the device manager
#[derive(Clone, Debug)]
pub struct PortInfo {
    /// Display name, e.g. "OHCI-Port 1"
    pub name: heapless::String<16>,
    /// Controller family that owns the port
    pub family: ControllerFamily,
    /// Controller number within its family (1-based)
    pub controller: u8,
    /// Port index on the root hub (0-based)
    pub index: u8,
}

/// The disk/port registry that sits above the USB stack
///
/// Calls arrive while the owning controller is locked, so implementations
/// must not issue I/O on a [`UsbDisk`] from inside `attach_disk`.
pub trait DeviceManager: Send + Sync {
    /// A root port was discovered
    fn attach_port(&self, port: &PortInfo);

    /// A mass-storage device finished enumeration
    fn attach_disk(&self, disk: UsbDisk) -> Option<DiskId>;

    /// The device backing `disk` was unplugged
    fn remove_disk(&self, disk: DiskId);
}
