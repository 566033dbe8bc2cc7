//! Descriptor pool
//!
//! Every controller owns one DMA allocation carved into four parts:
//!
//! ```text
//! +---------+----------------+-------------------+------------------+
//! | scratch | head slots     | element slots     | element buffers  |
//! | (HCCA,  | ED / QH        | TD / qTD          | one per element  |
//! |  lists) | ctrl | bulk    | ctrl    | bulk    |                  |
//! +---------+----------------+-------------------+------------------+
//! ```
//!
//! Heads and elements are fixed-size slots addressed by index; a hardware
//! "next" pointer is just the physical address of a slot, recomputed from
//! the region base. Each transfer type owns a contiguous range of head and
//! element slots with its own cursor.
//!
//! The pool tracks whether a transfer is still outstanding. While one is, the
//! cursors cannot be rewound: `recycle` refuses with [`UsbError::PoolBusy`].

use core::ops::Range;

use super::controller::{Result, TransferKind, UsbError};
use crate::platform::{DmaRegion, Platform};

/// Round `value` up to a multiple of `align` (a power of two)
#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Family-specific sizing of a descriptor pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolLayout {
    /// Total head (ED/QH) slots
    pub heads: usize,
    /// Head slots reserved for control transfers, the rest serve bulk
    pub control_heads: usize,
    /// Bytes per head slot
    pub head_size: usize,
    /// Total element (TD/qTD) slots
    pub elements: usize,
    /// Element slots reserved for control transfers, the rest serve bulk
    pub control_elements: usize,
    /// Bytes per element slot
    pub element_size: usize,
    /// Bytes of DMA buffer paired with each element; also its alignment
    pub buffer_size: usize,
    /// Alignment of head and element slots
    pub align: usize,
    /// Family-owned area at the start of the allocation
    pub scratch_size: usize,
    /// Alignment of the scratch area
    pub scratch_align: usize,
}

impl PoolLayout {
    fn head_base(&self) -> usize {
        align_up(self.scratch_size, self.align)
    }

    fn element_base(&self) -> usize {
        align_up(self.head_base() + self.heads * self.head_size, self.align)
    }

    fn buffer_base(&self) -> usize {
        align_up(
            self.element_base() + self.elements * self.element_size,
            self.buffer_size,
        )
    }

    /// Bytes needed for the whole pool
    pub fn total_size(&self) -> usize {
        self.buffer_base() + self.elements * self.buffer_size
    }

    /// Alignment the allocation must satisfy
    pub fn region_align(&self) -> usize {
        self.align.max(self.scratch_align).max(self.buffer_size)
    }

    /// Head slot range owned by a transfer type
    pub fn head_range(&self, kind: TransferKind) -> Range<usize> {
        match kind {
            TransferKind::Control => 0..self.control_heads,
            TransferKind::Bulk => self.control_heads..self.heads,
        }
    }

    /// Element slot range owned by a transfer type
    pub fn element_range(&self, kind: TransferKind) -> Range<usize> {
        match kind {
            TransferKind::Control => 0..self.control_elements,
            TransferKind::Bulk => self.control_elements..self.elements,
        }
    }
}

/// Fixed-capacity ring of hardware descriptors and DMA buffers
#[derive(Debug)]
pub struct DescriptorPool {
    layout: PoolLayout,
    region: DmaRegion,
    head_cursor: usize,
    element_cursor: usize,
    /// Transfer type the cursors currently serve
    last_kind: Option<TransferKind>,
    /// A published transfer has not been retired yet
    outstanding: bool,
}

impl DescriptorPool {
    /// Allocate and zero the pool. Failure here is the one fatal error of
    /// controller installation.
    pub fn new(platform: &dyn Platform, layout: PoolLayout) -> Result<Self> {
        if layout.control_heads > layout.heads
            || layout.control_elements > layout.elements
            || !layout.buffer_size.is_power_of_two()
            || !layout.align.is_power_of_two()
        {
            return Err(UsbError::InvalidParameter);
        }

        let region = platform.alloc_dma(layout.total_size(), layout.region_align())?;
        region.zero();

        log::debug!(
            "USB pool: {} heads, {} elements, {} byte buffers at phys {:#x}",
            layout.heads,
            layout.elements,
            layout.buffer_size,
            region.phys()
        );

        Ok(Self {
            layout,
            region,
            head_cursor: 0,
            element_cursor: 0,
            last_kind: None,
            outstanding: false,
        })
    }

    pub fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    /// Slot ranges (heads, elements) a transfer type may use
    pub fn allocate_ring(&self, kind: TransferKind) -> (Range<usize>, Range<usize>) {
        (self.layout.head_range(kind), self.layout.element_range(kind))
    }

    pub fn head_cursor(&self) -> usize {
        self.head_cursor
    }

    pub fn element_cursor(&self) -> usize {
        self.element_cursor
    }

    pub fn last_kind(&self) -> Option<TransferKind> {
        self.last_kind
    }

    pub fn is_outstanding(&self) -> bool {
        self.outstanding
    }

    /// Rewind both cursors to the base of `kind`'s region.
    ///
    /// Refused while a transfer is outstanding: its descriptors may still be
    /// owned by the hardware.
    pub fn recycle(&mut self, kind: TransferKind) -> Result<()> {
        if self.outstanding {
            log::warn!("USB pool: recycle refused, a transfer is still outstanding");
            return Err(UsbError::PoolBusy);
        }
        self.head_cursor = self.layout.head_range(kind).start;
        self.element_cursor = self.layout.element_range(kind).start;
        self.last_kind = Some(kind);
        Ok(())
    }

    /// Make room for a transfer of `kind` needing `elements` element slots.
    ///
    /// The pool is recycled when the transfer type changes or when the
    /// cursors are too close to the end of the region to fit the transfer.
    pub fn reset_if_needed(&mut self, kind: TransferKind, elements: usize) -> Result<()> {
        let heads = self.layout.head_range(kind);
        let range = self.layout.element_range(kind);
        if elements > range.len() || heads.is_empty() {
            return Err(UsbError::PoolExhausted);
        }

        let switched = self.last_kind != Some(kind);
        let near_end = !heads.contains(&self.head_cursor)
            || !range.contains(&self.element_cursor)
            || self.element_cursor + elements > range.end;

        if switched || near_end {
            self.recycle(kind)?;
        }
        Ok(())
    }

    /// Hand out the current head slot and move the cursor, wrapping inside
    /// the region of the active transfer type
    pub fn advance_head(&mut self) -> Result<usize> {
        let kind = self.last_kind.ok_or(UsbError::NotReady)?;
        let range = self.layout.head_range(kind);
        let slot = self.head_cursor;
        self.head_cursor = range.start + (slot + 1 - range.start) % range.len();
        Ok(slot)
    }

    /// Hand out the current element slot and move the cursor, wrapping
    /// inside the region of the active transfer type
    pub fn advance_element(&mut self) -> Result<usize> {
        let kind = self.last_kind.ok_or(UsbError::NotReady)?;
        let range = self.layout.element_range(kind);
        let slot = self.element_cursor;
        self.element_cursor = range.start + (slot + 1 - range.start) % range.len();
        Ok(slot)
    }

    /// A transfer was handed to the hardware
    pub fn begin(&mut self) {
        self.outstanding = true;
    }

    /// The hardware no longer references any descriptor of the last transfer
    pub fn retire(&mut self) {
        self.outstanding = false;
    }

    /// Forget all state after a controller reset
    pub fn force_reset(&mut self) {
        self.outstanding = false;
        self.last_kind = None;
        self.head_cursor = 0;
        self.element_cursor = 0;
        self.region.zero();
    }

    // ------------------------------------------------------------------
    // Slot addressing
    // ------------------------------------------------------------------

    fn head_offset(&self, slot: usize) -> usize {
        debug_assert!(slot < self.layout.heads);
        self.layout.head_base() + slot * self.layout.head_size
    }

    fn element_offset(&self, slot: usize) -> usize {
        debug_assert!(slot < self.layout.elements);
        self.layout.element_base() + slot * self.layout.element_size
    }

    fn buffer_offset(&self, slot: usize) -> usize {
        debug_assert!(slot < self.layout.elements);
        self.layout.buffer_base() + slot * self.layout.buffer_size
    }

    pub fn head_ptr(&self, slot: usize) -> *mut u8 {
        self.region.ptr_at(self.head_offset(slot))
    }

    pub fn head_phys(&self, slot: usize) -> u32 {
        self.region.phys_at(self.head_offset(slot))
    }

    pub fn element_ptr(&self, slot: usize) -> *mut u8 {
        self.region.ptr_at(self.element_offset(slot))
    }

    pub fn element_phys(&self, slot: usize) -> u32 {
        self.region.phys_at(self.element_offset(slot))
    }

    pub fn buffer_phys(&self, slot: usize) -> u32 {
        self.region.phys_at(self.buffer_offset(slot))
    }

    pub fn buffer_size(&self) -> usize {
        self.layout.buffer_size
    }

    /// Copy `data` into an element's DMA buffer
    pub fn write_buffer(&mut self, slot: usize, data: &[u8]) {
        let len = data.len().min(self.layout.buffer_size);
        let dst = self.region.ptr_at(self.buffer_offset(slot));
        // SAFETY: the buffer slot is `buffer_size` bytes inside the region
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst, len) };
    }

    /// Copy an element's DMA buffer out into `dest`
    pub fn read_buffer(&self, slot: usize, dest: &mut [u8]) {
        let len = dest.len().min(self.layout.buffer_size);
        let src = self.region.ptr_at(self.buffer_offset(slot));
        // SAFETY: as above, and the hardware has retired this element
        unsafe { core::ptr::copy_nonoverlapping(src, dest.as_mut_ptr(), len) };
    }

    /// Map an element's physical address (e.g. a done-queue entry) back to
    /// its slot
    pub fn element_at_phys(&self, phys: u32) -> Option<usize> {
        let offset = self.region.offset_of(phys)?;
        let base = self.layout.element_base();
        let end = base + self.layout.elements * self.layout.element_size;
        if offset < base || offset >= end || (offset - base) % self.layout.element_size != 0 {
            return None;
        }
        Some((offset - base) / self.layout.element_size)
    }

    pub fn scratch_ptr(&self) -> *mut u8 {
        self.region.ptr_at(0)
    }

    pub fn scratch_phys(&self) -> u32 {
        self.region.phys_at(0)
    }

    // ------------------------------------------------------------------
    // Volatile dword access for the backends
    // ------------------------------------------------------------------

    /// Read dword `index` of a head slot
    #[inline]
    pub fn head_read(&self, slot: usize, index: usize) -> u32 {
        debug_assert!((index + 1) * 4 <= self.layout.head_size);
        // SAFETY: slot and index are inside the head region
        unsafe { core::ptr::read_volatile((self.head_ptr(slot) as *const u32).add(index)) }
    }

    #[inline]
    pub fn head_write(&self, slot: usize, index: usize, value: u32) {
        debug_assert!((index + 1) * 4 <= self.layout.head_size);
        unsafe { core::ptr::write_volatile((self.head_ptr(slot) as *mut u32).add(index), value) }
    }

    /// Read dword `index` of an element slot
    #[inline]
    pub fn element_read(&self, slot: usize, index: usize) -> u32 {
        debug_assert!((index + 1) * 4 <= self.layout.element_size);
        unsafe { core::ptr::read_volatile((self.element_ptr(slot) as *const u32).add(index)) }
    }

    #[inline]
    pub fn element_write(&self, slot: usize, index: usize, value: u32) {
        debug_assert!((index + 1) * 4 <= self.layout.element_size);
        unsafe { core::ptr::write_volatile((self.element_ptr(slot) as *mut u32).add(index), value) }
    }

    /// Read dword `index` of the scratch area
    #[inline]
    pub fn scratch_read(&self, index: usize) -> u32 {
        debug_assert!((index + 1) * 4 <= self.layout.scratch_size);
        unsafe { core::ptr::read_volatile((self.scratch_ptr() as *const u32).add(index)) }
    }

    #[inline]
    pub fn scratch_write(&self, index: usize, value: u32) {
        debug_assert!((index + 1) * 4 <= self.layout.scratch_size);
        unsafe { core::ptr::write_volatile((self.scratch_ptr() as *mut u32).add(index), value) }
    }
}
