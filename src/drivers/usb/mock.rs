//! Test doubles for the host controller drivers
//!
//! [`MockPlatform`] provides a fake physical address space for DMA
//! allocations, PCI configuration space, IRQ lines and a cooperative task
//! queue. Every `sleep_ms` advances the attached controller models by that
//! many milliseconds.
//!
//! [`MockOhci`], [`MockUhci`] and [`MockEhci`] model the register interface
//! of each family closely enough to run the real backends against them.
//! They walk the descriptor lists the backends build and execute every
//! transaction against the [`MockFunction`] plugged into a root port.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use super::controller::{
    desc_type, feature, request, CompletionCode, ControllerFamily, Direction, Pid, TransferKind,
    UsbError, UsbSpeed,
};
use super::host::{HostController, UsbDisk};
use super::{ehci, ohci, uhci};
use crate::config::HostConfig;
use crate::drivers::pci::{self, PciAddress, PciBar, PciDevice};
use crate::platform::{
    DeviceManager, DiskId, DmaRegion, IrqHandler, Platform, PortInfo, RegisterBlock, Task,
};

pub const OHCI_BAR: u64 = 0xFE00_0000;
pub const EHCI_BAR: u64 = 0xFE10_0000;
pub const UHCI_IO_BAR: u64 = 0xC000;

pub const OHCI_PCI: PciAddress = PciAddress::new(0, 0x06, 0);
pub const UHCI_PCI: PciAddress = PciAddress::new(0, 0x1D, 0);
pub const EHCI_PCI: PciAddress = PciAddress::new(0, 0x1D, 7);

/// First address handed out by the fake DMA allocator
const PHYS_BASE: u64 = 0x1000_0000;

/// OHCI TD buffer rounding bit, never set by the driver
const OHCI_TD_ROUNDING: u32 = 1 << 18;
/// UHCI TD NAK received bit
const UHCI_CS_NAK: u32 = 1 << 19;

/// Packets needed to move `len` bytes; a zero-length packet still counts
fn packets(len: usize, max_packet: u16) -> usize {
    len.div_ceil(max_packet.max(1) as usize).max(1)
}

// ============================================================================
// Platform
// ============================================================================

/// A controller model driven by the platform clock
pub trait MockHardware: Send + Sync {
    fn tick(&self, ms: u32);
}

struct HardwareEntry {
    bar: u64,
    regs: Arc<dyn RegisterBlock>,
    model: Arc<dyn MockHardware>,
}

struct MockRegion {
    phys: u64,
    virt: usize,
    size: usize,
}

#[derive(Default)]
struct MockMemory {
    regions: Vec<MockRegion>,
    next_phys: u64,
}

type PciKey = (u8, u8, u8, u8);

/// Kernel services backed by plain memory and recorded calls
pub struct MockPlatform {
    memory: Mutex<MockMemory>,
    pci: Mutex<BTreeMap<PciKey, u32>>,
    hardware: Mutex<Vec<HardwareEntry>>,
    sleeps: Mutex<Vec<u32>>,
    busy_delays: AtomicU32,
    irqs: Mutex<Vec<(u8, Arc<IrqHandler>)>>,
    tasks: Mutex<VecDeque<(String, Task)>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            memory: Mutex::new(MockMemory {
                regions: Vec::new(),
                next_phys: PHYS_BASE,
            }),
            pci: Mutex::new(BTreeMap::new()),
            hardware: Mutex::new(Vec::new()),
            sleeps: Mutex::new(Vec::new()),
            busy_delays: AtomicU32::new(0),
            irqs: Mutex::new(Vec::new()),
            tasks: Mutex::new(VecDeque::new()),
        }
    }

    /// Every `sleep_ms` argument so far
    pub fn sleeps(&self) -> Vec<u32> {
        self.sleeps.lock().clone()
    }

    pub fn clear_sleeps(&self) {
        self.sleeps.lock().clear();
    }

    /// Number of `delay_us` calls
    pub fn busy_delays(&self) -> u32 {
        self.busy_delays.load(Ordering::Relaxed)
    }

    fn pci_key(addr: PciAddress, offset: u8) -> PciKey {
        (addr.bus, addr.device, addr.function, offset & 0xFC)
    }

    pub fn set_pci_config(&self, addr: PciAddress, offset: u8, value: u32) {
        self.pci.lock().insert(Self::pci_key(addr, offset), value);
    }

    pub fn pci_config(&self, addr: PciAddress, offset: u8) -> u32 {
        self.pci
            .lock()
            .get(&Self::pci_key(addr, offset))
            .copied()
            .unwrap_or(0)
    }

    /// Make a controller model reachable through the BAR at `bar`
    pub fn attach_hardware<T: RegisterBlock + MockHardware + 'static>(&self, bar: u64, hw: &Arc<T>) {
        self.hardware.lock().push(HardwareEntry {
            bar,
            regs: hw.clone(),
            model: hw.clone(),
        });
    }

    /// IRQ lines with an installed handler
    pub fn irq_lines(&self) -> Vec<u8> {
        self.irqs.lock().iter().map(|(irq, _)| *irq).collect()
    }

    /// Call every handler installed on `irq`
    pub fn fire_irq(&self, irq: u8) {
        let handlers: Vec<Arc<IrqHandler>> = self
            .irqs
            .lock()
            .iter()
            .filter(|(line, _)| *line == irq)
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler();
        }
    }

    /// Run queued tasks, including ones spawned meanwhile, until the queue
    /// is empty. Returns how many ran.
    pub fn run_tasks(&self) -> usize {
        let mut count = 0;
        loop {
            let next = self.tasks.lock().pop_front();
            let Some((name, task)) = next else {
                return count;
            };
            log::debug!("mock: running task \"{}\"", name);
            task();
            count += 1;
        }
    }

    fn translate(&self, phys: u32, len: usize) -> *mut u8 {
        let phys = phys as u64;
        let memory = self.memory.lock();
        let region = memory
            .regions
            .iter()
            .find(|r| phys >= r.phys && phys + len as u64 <= r.phys + r.size as u64)
            .unwrap_or_else(|| panic!("DMA access to unmapped phys {:#x}+{}", phys, len));
        (region.virt + (phys - region.phys) as usize) as *mut u8
    }

    pub fn read_phys(&self, phys: u32, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }
        let src = self.translate(phys, buf.len());
        unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
    }

    pub fn write_phys(&self, phys: u32, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let dst = self.translate(phys, data.len());
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
    }

    pub fn read32_phys(&self, phys: u32) -> u32 {
        let src = self.translate(phys, 4) as *const u32;
        unsafe { core::ptr::read_volatile(src) }
    }

    pub fn write32_phys(&self, phys: u32, value: u32) {
        let dst = self.translate(phys, 4) as *mut u32;
        unsafe { core::ptr::write_volatile(dst, value) };
    }
}

impl Platform for MockPlatform {
    fn pci_read32(&self, addr: PciAddress, offset: u8) -> u32 {
        self.pci_config(addr, offset)
    }

    fn pci_write32(&self, addr: PciAddress, offset: u8, value: u32) {
        self.set_pci_config(addr, offset, value);
    }

    fn map_mmio(&self, phys: u64, _size: usize) -> Result<u64, UsbError> {
        Ok(phys)
    }

    fn sleep_ms(&self, ms: u32) {
        self.sleeps.lock().push(ms);
        let models: Vec<Arc<dyn MockHardware>> =
            self.hardware.lock().iter().map(|h| h.model.clone()).collect();
        for model in models {
            model.tick(ms);
        }
    }

    fn delay_us(&self, _us: u32) {
        self.busy_delays.fetch_add(1, Ordering::Relaxed);
    }

    fn alloc_dma(&self, size: usize, align: usize) -> Result<DmaRegion, UsbError> {
        let align = align.max(16);
        let layout =
            Layout::from_size_align(size.max(1), align).map_err(|_| UsbError::InvalidParameter)?;
        // SAFETY: the layout has a non-zero size
        let virt = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if virt.is_null() {
            return Err(UsbError::AllocationFailed);
        }

        let mut memory = self.memory.lock();
        let phys = (memory.next_phys + align as u64 - 1) & !(align as u64 - 1);
        memory.next_phys = phys + size as u64;
        memory.regions.push(MockRegion {
            phys,
            virt: virt as usize,
            size,
        });
        // SAFETY: freshly allocated, never freed while the test runs
        unsafe { DmaRegion::new(virt, phys, size) }.ok_or(UsbError::AllocationFailed)
    }

    fn free_dma(&self, region: DmaRegion) {
        self.memory.lock().regions.retain(|r| r.phys != region.phys());
    }

    fn virt_to_phys(&self, virt: u64) -> u64 {
        let memory = self.memory.lock();
        memory
            .regions
            .iter()
            .find(|r| virt >= r.virt as u64 && virt < (r.virt + r.size) as u64)
            .map_or(virt, |r| r.phys + (virt - r.virt as u64))
    }

    fn install_irq(&self, irq: u8, handler: IrqHandler) -> Result<(), UsbError> {
        self.irqs.lock().push((irq, Arc::new(handler)));
        Ok(())
    }

    fn spawn_task(&self, name: &str, task: Task) {
        self.tasks.lock().push_back((String::from(name), task));
    }

    fn register_block(&self, bar: &PciBar) -> Result<Arc<dyn RegisterBlock>, UsbError> {
        self.hardware
            .lock()
            .iter()
            .find(|h| h.bar == bar.address)
            .map(|h| h.regs.clone())
            .ok_or(UsbError::NotReady)
    }
}

// ============================================================================
// Device manager
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManagerEvent {
    DiskAttached(u32),
    DiskRemoved(u32),
}

/// Records ports and disks; disk ids count up from 0
pub struct MockDeviceManager {
    ports: Mutex<Vec<String>>,
    disks: Mutex<Vec<UsbDisk>>,
    events: Mutex<Vec<ManagerEvent>>,
    next_id: AtomicU32,
}

impl MockDeviceManager {
    pub fn new() -> Self {
        Self {
            ports: Mutex::new(Vec::new()),
            disks: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(0),
        }
    }

    pub fn port_names(&self) -> Vec<String> {
        self.ports.lock().clone()
    }

    /// Every disk ever attached, removed ones included
    pub fn disks(&self) -> Vec<UsbDisk> {
        self.disks.lock().clone()
    }

    pub fn events(&self) -> Vec<ManagerEvent> {
        self.events.lock().clone()
    }
}

impl DeviceManager for MockDeviceManager {
    fn attach_port(&self, port: &PortInfo) {
        self.ports.lock().push(String::from(port.name.as_str()));
    }

    fn attach_disk(&self, disk: UsbDisk) -> Option<DiskId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.disks.lock().push(disk);
        self.events.lock().push(ManagerEvent::DiskAttached(id));
        Some(DiskId(id))
    }

    fn remove_disk(&self, disk: DiskId) {
        self.events.lock().push(ManagerEvent::DiskRemoved(disk.0));
    }
}

/// PCI record matching the BAR of the family's mock hardware
pub fn pci_device(family: ControllerFamily, irq: u8) -> PciDevice {
    let (address, prog_if) = match family {
        ControllerFamily::Ohci => (OHCI_PCI, pci::prog_if::OHCI),
        ControllerFamily::Uhci => (UHCI_PCI, pci::prog_if::UHCI),
        ControllerFamily::Ehci => (EHCI_PCI, pci::prog_if::EHCI),
    };
    let mut dev = PciDevice::new(address, pci::CLASS_SERIAL, pci::SUBCLASS_USB, prog_if);
    dev.vendor_id = 0x8086;
    dev.device_id = 0x7020;
    match family {
        ControllerFamily::Ohci => dev.bars[0] = PciBar::memory(OHCI_BAR, 0x1000),
        ControllerFamily::Ehci => dev.bars[0] = PciBar::memory(EHCI_BAR, 0x1000),
        ControllerFamily::Uhci => dev.bars[4] = PciBar::io(UHCI_IO_BAR, 0x20),
    }
    dev.interrupt_line = irq;
    dev
}

/// Controller 1 of `family` without IRQ or task, plus its device manager
pub fn controller_with_manager(
    platform: &Arc<MockPlatform>,
    family: ControllerFamily,
    config: HostConfig,
) -> (HostController, Arc<MockDeviceManager>) {
    let manager = Arc::new(MockDeviceManager::new());
    let hc = HostController::new(
        &pci_device(family, 0),
        1,
        platform.clone(),
        manager.clone(),
        config,
    )
    .expect("mock controller");
    (hc, manager)
}

pub fn controller(platform: &Arc<MockPlatform>, family: ControllerFamily, config: HostConfig) -> HostController {
    controller_with_manager(platform, family, config).0
}

// ============================================================================
// USB function
// ============================================================================

/// One token as the controller model executed it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenRecord {
    pub pid: Pid,
    pub endpoint: u8,
    /// Data toggle of the first packet
    pub toggle: bool,
    /// Bytes the descriptor asked for
    pub len: usize,
}

impl TokenRecord {
    pub fn new(pid: Pid, endpoint: u8, toggle: bool, len: usize) -> Self {
        Self {
            pid,
            endpoint,
            toggle,
            len,
        }
    }
}

/// Result of one transaction on the bus
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Bytes moved
    Ack(usize),
    Nak,
    Fault(CompletionCode),
    /// Bytes moved in whole packets before the fault
    Partial(usize, CompletionCode),
}

#[derive(Debug, Default)]
struct ControlState {
    response: Vec<u8>,
    offset: usize,
    direction_in: bool,
    stalled: bool,
    pending_address: Option<u8>,
}

/// A USB device model answering standard requests and bulk traffic
#[derive(Debug)]
pub struct MockFunction {
    pub speed: UsbSpeed,
    pub address: u8,
    pub configuration: u8,
    /// Data returned on the bulk IN endpoint; empty means NAK
    pub bulk_in_data: VecDeque<u8>,
    /// Everything received on the bulk OUT endpoint
    pub bulk_out_data: Vec<u8>,
    device: [u8; 18],
    config: Vec<u8>,
    strings: Vec<Vec<u8>>,
    /// Bulk endpoint numbers (OUT, IN), 0 if absent
    bulk_endpoints: (u8, u8),
    bulk_max_packet: u16,
    /// Next toggle per endpoint, indexed by direction
    toggles: [u16; 2],
    halted: [u16; 2],
    fault: Option<(Option<Pid>, CompletionCode, u32)>,
    /// Bulk OUT bytes accepted before a transaction fails midway
    fail_after: Option<(usize, CompletionCode)>,
    /// SET_CONFIGURATION stalls
    pub reject_configuration: bool,
    control: ControlState,
}

fn string_descriptor(text: &str) -> Vec<u8> {
    let mut desc = vec![0, desc_type::STRING];
    for unit in text.encode_utf16() {
        desc.extend(unit.to_le_bytes());
    }
    desc[0] = desc.len() as u8;
    desc
}

impl MockFunction {
    /// A bulk-only mass storage stick, endpoints 0x81 and 0x02
    pub fn mass_storage(speed: UsbSpeed) -> Self {
        let bulk_max_packet: u16 = if speed == UsbSpeed::High { 512 } else { 64 };
        let [lo, hi] = bulk_max_packet.to_le_bytes();
        Self {
            speed,
            address: 0,
            configuration: 0,
            bulk_in_data: VecDeque::new(),
            bulk_out_data: Vec::new(),
            device: [
                18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x81, 0x07, 0x51, 0x55, 0x00, 0x01, 1, 2, 3, 1,
            ],
            config: vec![
                9, 2, 32, 0, 1, 1, 0, 0x80, 50, // configuration
                9, 4, 0, 0, 2, 0x08, 0x06, 0x50, 0, // interface: MSC, SCSI, BBB
                7, 5, 0x81, 2, lo, hi, 0, // bulk IN
                7, 5, 0x02, 2, lo, hi, 0, // bulk OUT
            ],
            strings: vec![
                vec![4, desc_type::STRING, 0x09, 0x04],
                string_descriptor("Mock Inc"),
                string_descriptor("Mock Flash"),
                string_descriptor("0123456789"),
            ],
            bulk_endpoints: (2, 1),
            bulk_max_packet,
            toggles: [0; 2],
            halted: [0; 2],
            fault: None,
            fail_after: None,
            reject_configuration: false,
            control: ControlState::default(),
        }
    }

    /// A low-speed boot keyboard without string descriptors
    pub fn keyboard() -> Self {
        Self {
            speed: UsbSpeed::Low,
            address: 0,
            configuration: 0,
            bulk_in_data: VecDeque::new(),
            bulk_out_data: Vec::new(),
            device: [
                18, 1, 0x10, 0x01, 0, 0, 0, 8, 0x6D, 0x04, 0x1C, 0xC3, 0x00, 0x01, 0, 0, 0, 1,
            ],
            config: vec![
                9, 2, 34, 0, 1, 1, 0, 0xA0, 50, // configuration
                9, 4, 0, 0, 1, 3, 1, 1, 0, // interface: HID boot keyboard
                9, 0x21, 0x11, 0x01, 0, 1, 0x22, 63, 0, // HID
                7, 5, 0x81, 3, 8, 0, 10, // interrupt IN
            ],
            strings: vec![vec![4, desc_type::STRING, 0x09, 0x04]],
            bulk_endpoints: (0, 0),
            bulk_max_packet: 8,
            toggles: [0; 2],
            halted: [0; 2],
            fault: None,
            fail_after: None,
            reject_configuration: false,
            control: ControlState::default(),
        }
    }

    pub fn device_descriptor(&self) -> [u8; 18] {
        self.device
    }

    /// Fail the next `count` transactions with `pid` (any pid for `None`)
    pub fn fail_next(&mut self, pid: Option<Pid>, code: CompletionCode, count: u32) {
        self.fault = (count > 0).then_some((pid, code, count));
    }

    /// Accept `bytes` more bulk OUT data, then fail the transaction carrying
    /// the next byte with `code`. `bytes` is a multiple of the packet size.
    pub fn fail_after(&mut self, bytes: usize, code: CompletionCode) {
        self.fail_after = Some((bytes, code));
    }

    pub fn halt(&mut self, endpoint: u8, direction: Direction) {
        self.halted[direction.index()] |= 1 << (endpoint & 0xF);
    }

    /// Back to the default state after a port reset
    pub fn bus_reset(&mut self) {
        self.address = 0;
        self.configuration = 0;
        self.toggles = [0; 2];
        self.halted = [0; 2];
        self.control = ControlState::default();
    }

    pub fn is_low_speed(&self) -> bool {
        self.speed == UsbSpeed::Low
    }

    /// Execute one token. OUT and SETUP data is read from `data`, IN data
    /// is written to its start.
    pub fn transact(&mut self, pid: Pid, address: u8, endpoint: u8, toggle: bool, data: &mut [u8]) -> Outcome {
        if address != self.address {
            return Outcome::Fault(CompletionCode::NotResponding);
        }

        let injected = match self.fault.as_mut() {
            Some((filter, code, count)) if filter.map_or(true, |p| p == pid) => {
                *count -= 1;
                Some((*code, *count == 0))
            }
            _ => None,
        };
        if let Some((code, exhausted)) = injected {
            if exhausted {
                self.fault = None;
            }
            return Outcome::Fault(code);
        }

        if endpoint == 0 {
            self.control_transaction(pid, data)
        } else {
            self.bulk_transaction(pid, endpoint, toggle, data)
        }
    }

    fn control_transaction(&mut self, pid: Pid, data: &mut [u8]) -> Outcome {
        match pid {
            Pid::Setup => {
                if data.len() != 8 {
                    return Outcome::Fault(CompletionCode::DataUnderrun);
                }
                let mut setup = [0u8; 8];
                setup.copy_from_slice(data);
                self.handle_setup(setup);
                Outcome::Ack(8)
            }
            _ if self.control.stalled => Outcome::Fault(CompletionCode::Stall),
            Pid::In if self.control.direction_in => {
                let rest = &self.control.response[self.control.offset..];
                let n = rest.len().min(data.len());
                data[..n].copy_from_slice(&rest[..n]);
                self.control.offset += n;
                Outcome::Ack(n)
            }
            Pid::In => {
                // status stage of a no-data or OUT request
                if let Some(address) = self.control.pending_address.take() {
                    self.address = address;
                }
                Outcome::Ack(0)
            }
            Pid::Out => Outcome::Ack(data.len()),
        }
    }

    fn handle_setup(&mut self, setup: [u8; 8]) {
        let request_type = setup[0];
        let value = u16::from_le_bytes([setup[2], setup[3]]);
        let index = u16::from_le_bytes([setup[4], setup[5]]);
        let length = u16::from_le_bytes([setup[6], setup[7]]) as usize;

        self.control = ControlState {
            direction_in: request_type & 0x80 != 0,
            ..ControlState::default()
        };

        let response = match (request_type, setup[1]) {
            (0x80, request::GET_DESCRIPTOR) => {
                let index_byte = (value & 0xFF) as usize;
                match (value >> 8) as u8 {
                    desc_type::DEVICE => Some(self.device.to_vec()),
                    desc_type::CONFIGURATION => Some(self.config.clone()),
                    desc_type::STRING => self.strings.get(index_byte).cloned(),
                    _ => None,
                }
            }
            (0x00, request::SET_ADDRESS) => {
                self.control.pending_address = Some((value & 0x7F) as u8);
                Some(Vec::new())
            }
            (0x00, request::SET_CONFIGURATION) if self.reject_configuration => None,
            (0x00, request::SET_CONFIGURATION) => {
                self.configuration = value as u8;
                self.toggles = [0; 2];
                Some(Vec::new())
            }
            (0x80 | 0x81, request::GET_STATUS) => Some(vec![0, 0]),
            (0x82, request::GET_STATUS) => self
                .endpoint_bit(index as u8)
                .map(|(dir, bit)| vec![u8::from(self.halted[dir] & bit != 0), 0]),
            (0x02, request::CLEAR_FEATURE) if value == feature::ENDPOINT_HALT => {
                self.endpoint_bit(index as u8).map(|(dir, bit)| {
                    self.halted[dir] &= !bit;
                    self.toggles[dir] &= !bit;
                    Vec::new()
                })
            }
            _ => None,
        };

        match response {
            Some(mut data) => {
                data.truncate(length);
                self.control.response = data;
            }
            None => self.control.stalled = true,
        }
    }

    /// (direction index, endpoint bit) of a bulk endpoint address
    fn endpoint_bit(&self, ep_address: u8) -> Option<(usize, u16)> {
        let number = ep_address & 0xF;
        let (direction, expected) = if ep_address & 0x80 != 0 {
            (Direction::In, self.bulk_endpoints.1)
        } else {
            (Direction::Out, self.bulk_endpoints.0)
        };
        (number != 0 && number == expected).then_some((direction.index(), 1 << number))
    }

    fn bulk_transaction(&mut self, pid: Pid, endpoint: u8, toggle: bool, data: &mut [u8]) -> Outcome {
        let ep_address = match pid {
            Pid::In => endpoint | 0x80,
            Pid::Out => endpoint,
            Pid::Setup => return Outcome::Fault(CompletionCode::Stall),
        };
        let Some((dir, bit)) = self.endpoint_bit(ep_address) else {
            return Outcome::Fault(CompletionCode::Stall);
        };
        if self.halted[dir] & bit != 0 {
            return Outcome::Fault(CompletionCode::Stall);
        }
        let expected = self.toggles[dir] & bit != 0;

        let moved = if pid == Pid::In {
            if self.bulk_in_data.is_empty() {
                return Outcome::Nak;
            }
            if toggle != expected {
                return Outcome::Fault(CompletionCode::DataToggleMismatch);
            }
            let n = data.len().min(self.bulk_in_data.len());
            for (dst, src) in data[..n].iter_mut().zip(self.bulk_in_data.drain(..n)) {
                *dst = src;
            }
            n
        } else {
            if toggle != expected {
                // retransmission of a packet already seen: ACK and drop
                return Outcome::Ack(data.len());
            }
            if let Some((budget, code)) = self.fail_after.take() {
                if data.len() > budget {
                    self.bulk_out_data.extend_from_slice(&data[..budget]);
                    if (budget / self.bulk_max_packet as usize) % 2 == 1 {
                        self.toggles[dir] ^= bit;
                    }
                    return Outcome::Partial(budget, code);
                }
                self.fail_after = Some((budget - data.len(), code));
            }
            self.bulk_out_data.extend_from_slice(data);
            data.len()
        };

        if packets(moved, self.bulk_max_packet) % 2 == 1 {
            self.toggles[dir] ^= bit;
        }
        Outcome::Ack(moved)
    }
}

// ============================================================================
// Root ports
// ============================================================================

#[derive(Debug, Default)]
struct RootPort {
    function: Option<MockFunction>,
    enabled: bool,
    reset: bool,
    powered: bool,
    /// EHCI: released to the companion controller
    companion: bool,
    connect_change: bool,
    enable_change: bool,
    reset_change: bool,
}

impl RootPort {
    fn connected(&self) -> bool {
        self.function.is_some()
    }

    fn low_speed(&self) -> bool {
        self.function.as_ref().is_some_and(MockFunction::is_low_speed)
    }

    fn bus_reset(&mut self) {
        if let Some(function) = self.function.as_mut() {
            function.bus_reset();
        }
    }
}

fn route(ports: &mut [RootPort], address: u8) -> Option<&mut MockFunction> {
    ports
        .iter_mut()
        .filter(|p| !p.companion)
        .filter_map(|p| p.function.as_mut())
        .find(|f| f.address == address)
}

fn execute(ports: &mut [RootPort], pid: Pid, address: u8, endpoint: u8, toggle: bool, data: &mut [u8]) -> Outcome {
    match route(ports, address) {
        Some(function) => function.transact(pid, address, endpoint, toggle, data),
        None => Outcome::Fault(CompletionCode::NotResponding),
    }
}

// ============================================================================
// OHCI
// ============================================================================

struct OhciState {
    control: u32,
    command: u32,
    status: u32,
    enable: u32,
    hcca: u32,
    control_head: u32,
    bulk_head: u32,
    fm_interval: u32,
    frame: u32,
    other: BTreeMap<u32, u32>,
    ports: Vec<RootPort>,
    smm_owned: bool,
    stuck_in_reset: bool,
    sticky_reset: bool,
    frozen: bool,
    control_filled: u32,
    bulk_filled: u32,
    done: Vec<u32>,
    tokens: Vec<TokenRecord>,
}

impl OhciState {
    fn reset(&mut self) {
        self.control = ohci::hccontrol::HCFS_SUSPEND;
        self.command = 0;
        self.status = 0;
        self.enable = 0;
        self.hcca = 0;
        self.control_head = 0;
        self.bulk_head = 0;
        self.fm_interval = 0x2EDF;
        self.done.clear();
        for port in self.ports.iter_mut() {
            port.enabled = false;
        }
    }
}

/// Register model of an OHCI controller
pub struct MockOhci {
    platform: Weak<MockPlatform>,
    state: Mutex<OhciState>,
}

impl MockOhci {
    pub fn new(platform: &Arc<MockPlatform>, ports: u8) -> Arc<Self> {
        let hw = Arc::new(Self {
            platform: Arc::downgrade(platform),
            state: Mutex::new(OhciState {
                control: 0,
                command: 0,
                status: 0,
                enable: 0,
                hcca: 0,
                control_head: 0,
                bulk_head: 0,
                fm_interval: 0,
                frame: 0,
                other: BTreeMap::new(),
                ports: (0..ports).map(|_| RootPort::default()).collect(),
                smm_owned: false,
                stuck_in_reset: false,
                sticky_reset: false,
                frozen: false,
                control_filled: 0,
                bulk_filled: 0,
                done: Vec::new(),
                tokens: Vec::new(),
            }),
        });
        platform.attach_hardware(OHCI_BAR, &hw);
        hw
    }

    pub fn connect(&self, port: usize, function: MockFunction) {
        let mut st = self.state.lock();
        st.ports[port].function = Some(function);
        st.ports[port].connect_change = true;
        st.status |= ohci::intr::RHSC;
    }

    /// Plug a low-speed keyboard into `port`
    pub fn connect_low_speed(&self, port: usize) {
        self.connect(port, MockFunction::keyboard());
    }

    pub fn disconnect(&self, port: usize) {
        let mut st = self.state.lock();
        st.ports[port].function = None;
        st.ports[port].enabled = false;
        st.ports[port].connect_change = true;
        st.status |= ohci::intr::RHSC;
    }

    pub fn with_function<R>(&self, port: usize, f: impl FnOnce(&mut MockFunction) -> R) -> R {
        let mut st = self.state.lock();
        f(st.ports[port].function.as_mut().expect("no function on port"))
    }

    pub fn tokens(&self) -> Vec<TokenRecord> {
        self.state.lock().tokens.clone()
    }

    /// CLF or BLF writes so far
    pub fn list_filled(&self, kind: TransferKind) -> u32 {
        let st = self.state.lock();
        match kind {
            TransferKind::Control => st.control_filled,
            TransferKind::Bulk => st.bulk_filled,
        }
    }

    pub fn reg(&self, offset: u32) -> u32 {
        RegisterBlock::read32(self, offset)
    }

    pub fn set_sticky_reset(&self, sticky: bool) {
        self.state.lock().sticky_reset = sticky;
    }

    /// Stop the frame counter and all list processing
    pub fn set_frozen(&self, frozen: bool) {
        self.state.lock().frozen = frozen;
    }

    /// SMM firmware owns the controller until an ownership change request
    pub fn set_smm_owned(&self, owned: bool) {
        let mut st = self.state.lock();
        st.smm_owned = owned;
        if owned {
            st.control = ohci::hccontrol::IR | ohci::hccontrol::HCFS_OPERATIONAL;
        }
    }

    pub fn set_stuck_in_reset(&self, stuck: bool) {
        self.state.lock().stuck_in_reset = stuck;
    }

    pub fn raise_unrecoverable_error(&self) {
        self.state.lock().status |= ohci::intr::UE;
    }

    fn port_status(port: &RootPort) -> u32 {
        use ohci::rhportstatus::*;
        let mut value = 0;
        if port.connected() {
            value |= CCS;
        }
        if port.enabled {
            value |= PES;
        }
        if port.reset {
            value |= PRS;
        }
        if port.powered {
            value |= PPS;
        }
        if port.connected() && port.low_speed() {
            value |= LSDA;
        }
        if port.connect_change {
            value |= CSC;
        }
        if port.enable_change {
            value |= PESC;
        }
        if port.reset_change {
            value |= PRSC;
        }
        value
    }

    fn write_port(st: &mut OhciState, index: usize, value: u32) {
        use ohci::rhportstatus::*;
        let sticky = st.sticky_reset;
        let Some(port) = st.ports.get_mut(index) else {
            return;
        };
        if value & CCS != 0 {
            port.enabled = false;
        }
        if value & PES != 0 && port.connected() {
            port.enabled = true;
        }
        if value & PRS != 0 {
            port.bus_reset();
            if sticky {
                port.reset = true;
                port.enabled = false;
            } else {
                port.reset = false;
                port.enabled = port.connected();
                port.reset_change = true;
            }
        }
        if value & CSC != 0 {
            port.connect_change = false;
        }
        if value & PESC != 0 {
            port.enable_change = false;
        }
        if value & PRSC != 0 {
            port.reset_change = false;
        }
    }

    fn process_list(&self, st: &mut OhciState, kind: TransferKind) {
        use ohci::hccontrol;
        let (enable, head) = match kind {
            TransferKind::Control => (hccontrol::CLE, st.control_head),
            TransferKind::Bulk => (hccontrol::BLE, st.bulk_head),
        };
        if st.frozen
            || st.control & enable == 0
            || st.control & hccontrol::HCFS_MASK != hccontrol::HCFS_OPERATIONAL
        {
            return;
        }
        let Some(platform) = self.platform.upgrade() else {
            return;
        };

        let mut ed = head & !0xF;
        for _ in 0..16 {
            if ed == 0 {
                break;
            }
            Self::process_ed(&platform, st, ed);
            ed = platform.read32_phys(ed + 12) & !0xF;
        }
        Self::write_back_done(&platform, st);
    }

    fn process_ed(platform: &MockPlatform, st: &mut OhciState, ed_phys: u32) {
        use ohci::{ed, td};
        let control = platform.read32_phys(ed_phys);
        if control & ed::CTRL_K != 0 {
            return;
        }
        let address = (control & ed::CTRL_FA_MASK) as u8;
        let endpoint = ((control & ed::CTRL_EN_MASK) >> ed::CTRL_EN_SHIFT) as u8;
        let max_packet = ((control & ed::CTRL_MPS_MASK) >> ed::CTRL_MPS_SHIFT) as u16;

        for _ in 0..64 {
            let head = platform.read32_phys(ed_phys + 8);
            let tail = platform.read32_phys(ed_phys + 4) & !0xF;
            if head & ed::HEAD_HALTED != 0 || head & !0xF == tail {
                return;
            }
            let td_phys = head & !0xF;
            let carry = head & ed::HEAD_TOGGLE_CARRY != 0;

            let td_control = platform.read32_phys(td_phys);
            let cbp = platform.read32_phys(td_phys + 4);
            let next = platform.read32_phys(td_phys + 8) & !0xF;
            let be = platform.read32_phys(td_phys + 12);

            let pid = match td_control & (td::CTRL_DP_OUT | td::CTRL_DP_IN) {
                td::CTRL_DP_SETUP => Pid::Setup,
                td::CTRL_DP_OUT => Pid::Out,
                _ => Pid::In,
            };
            let toggle = if td_control & (1 << 25) != 0 {
                td_control & (1 << 24) != 0
            } else {
                carry
            };
            let len = if cbp == 0 { 0 } else { (be - cbp + 1) as usize };

            let mut data = vec![0u8; len];
            if pid != Pid::In {
                platform.read_phys(cbp, &mut data);
            }
            let (code, moved) = match execute(&mut st.ports, pid, address, endpoint, toggle, &mut data) {
                Outcome::Nak => return,
                Outcome::Ack(n) if pid == Pid::In && n < len && td_control & OHCI_TD_ROUNDING == 0 => {
                    (CompletionCode::DataUnderrun, n)
                }
                Outcome::Ack(n) => (CompletionCode::NoError, n),
                Outcome::Partial(n, code) => (code, n),
                Outcome::Fault(code) => (code, 0),
            };
            st.tokens.push(TokenRecord::new(pid, endpoint, toggle, len));
            if pid == Pid::In {
                platform.write_phys(cbp, &data[..moved]);
            }

            let new_cbp = if moved == len { 0 } else { cbp + moved as u32 };
            let cc = code.to_ohci() << td::CTRL_CC_SHIFT;
            platform.write32_phys(td_phys, (td_control & !(0xF << td::CTRL_CC_SHIFT)) | cc);
            platform.write32_phys(td_phys + 4, new_cbp);
            st.done.push(td_phys);

            let success = code.is_success();
            let next_toggle = if success || code == CompletionCode::DataUnderrun {
                toggle ^ (packets(moved, max_packet) % 2 == 1)
            } else {
                toggle ^ ((moved / max_packet.max(1) as usize) % 2 == 1)
            };
            let mut new_head = next | ((next_toggle as u32) << 1);
            if !success {
                new_head |= ed::HEAD_HALTED;
            }
            platform.write32_phys(ed_phys + 8, new_head);
            if !success {
                return;
            }
        }
    }

    /// Chain retired TDs into the HCCA done head. While WDH is still set
    /// the batch is dropped instead of held back.
    fn write_back_done(platform: &MockPlatform, st: &mut OhciState) {
        if st.done.is_empty() {
            return;
        }
        if st.status & ohci::intr::WDH != 0 || st.hcca == 0 {
            st.done.clear();
            return;
        }
        let mut head = 0;
        for td in st.done.drain(..) {
            platform.write32_phys(td + 8, head);
            head = td;
        }
        platform.write32_phys(st.hcca + ohci::HCCA_DONE_HEAD as u32, head);
        st.status |= ohci::intr::WDH;
    }
}

impl RegisterBlock for MockOhci {
    fn read32(&self, offset: u32) -> u32 {
        use ohci::regs::*;
        let st = self.state.lock();
        match offset {
            HCREVISION => 0x10,
            HCCONTROL => st.control,
            HCCOMMANDSTATUS => st.command,
            HCINTERRUPTSTATUS => st.status,
            HCINTERRUPTENABLE | HCINTERRUPTDISABLE => st.enable,
            HCHCCA => st.hcca,
            HCCONTROLHEADED | HCCONTROLCURRENTED => st.control_head,
            HCBULKHEADED | HCBULKCURRENTED => st.bulk_head,
            HCFMINTERVAL => st.fm_interval,
            HCFMNUMBER => st.frame & 0xFFFF,
            // POTPGT of 1 (2 ms)
            HCRHDESCRIPTORA => (1 << 24) | st.ports.len() as u32,
            o if o >= HCRHPORTSTATUS => {
                let index = ((o - HCRHPORTSTATUS) / 4) as usize;
                st.ports.get(index).map_or(0, Self::port_status)
            }
            o => st.other.get(&o).copied().unwrap_or(0),
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        use ohci::regs::*;
        use ohci::{hccommandstatus, hccontrol, intr};
        let mut st = self.state.lock();
        match offset {
            HCCONTROL => {
                let ir = if st.smm_owned { hccontrol::IR } else { 0 };
                st.control = value | ir;
            }
            HCCOMMANDSTATUS => {
                if value & hccommandstatus::OCR != 0 && st.smm_owned {
                    st.smm_owned = false;
                    st.control &= !hccontrol::IR;
                    st.status |= intr::OC;
                }
                if value & hccommandstatus::HCR != 0 {
                    if st.stuck_in_reset {
                        st.command |= hccommandstatus::HCR;
                    } else {
                        st.reset();
                    }
                }
                if value & hccommandstatus::CLF != 0 {
                    st.control_filled += 1;
                    self.process_list(&mut st, TransferKind::Control);
                }
                if value & hccommandstatus::BLF != 0 {
                    st.bulk_filled += 1;
                    self.process_list(&mut st, TransferKind::Bulk);
                }
            }
            HCINTERRUPTSTATUS => st.status &= !value,
            HCINTERRUPTENABLE => st.enable |= value,
            HCINTERRUPTDISABLE => st.enable &= !value,
            HCHCCA => st.hcca = value,
            HCCONTROLHEADED | HCCONTROLCURRENTED => st.control_head = value,
            HCBULKHEADED | HCBULKCURRENTED => st.bulk_head = value,
            HCFMINTERVAL => st.fm_interval = value,
            HCRHSTATUS => {
                if value & ohci::rhstatus::LPSC != 0 {
                    for port in st.ports.iter_mut() {
                        port.powered = true;
                    }
                }
            }
            o if o >= HCRHPORTSTATUS => {
                let index = ((o - HCRHPORTSTATUS) / 4) as usize;
                Self::write_port(&mut st, index, value);
            }
            o => {
                st.other.insert(o, value);
            }
        }
    }

    fn read16(&self, offset: u32) -> u16 {
        (RegisterBlock::read32(self, offset & !3) >> ((offset & 2) * 8)) as u16
    }

    fn write16(&self, _offset: u32, _value: u16) {}
}

impl MockHardware for MockOhci {
    fn tick(&self, ms: u32) {
        let mut st = self.state.lock();
        if st.frozen {
            return;
        }
        st.frame = st.frame.wrapping_add(ms);
        self.process_list(&mut st, TransferKind::Control);
        self.process_list(&mut st, TransferKind::Bulk);
    }
}

// ============================================================================
// UHCI
// ============================================================================

struct UhciState {
    command: u16,
    status: u16,
    intr: u16,
    frame: u16,
    frame_list: u32,
    ports: Vec<RootPort>,
    sticky_reset: bool,
    frozen: bool,
    tokens: Vec<TokenRecord>,
}

/// Register model of a UHCI controller
pub struct MockUhci {
    platform: Weak<MockPlatform>,
    state: Mutex<UhciState>,
}

impl MockUhci {
    pub fn new(platform: &Arc<MockPlatform>, ports: u8) -> Arc<Self> {
        let hw = Arc::new(Self {
            platform: Arc::downgrade(platform),
            state: Mutex::new(UhciState {
                command: 0,
                status: uhci::usbsts::HCHALTED,
                intr: 0,
                frame: 0,
                frame_list: 0,
                ports: (0..ports).map(|_| RootPort::default()).collect(),
                sticky_reset: false,
                frozen: false,
                tokens: Vec::new(),
            }),
        });
        platform.attach_hardware(UHCI_IO_BAR, &hw);
        hw
    }

    pub fn pci_address(&self) -> PciAddress {
        UHCI_PCI
    }

    pub fn connect(&self, port: usize, function: MockFunction) {
        let mut st = self.state.lock();
        st.ports[port].function = Some(function);
        st.ports[port].connect_change = true;
    }

    pub fn disconnect(&self, port: usize) {
        let mut st = self.state.lock();
        st.ports[port].function = None;
        st.ports[port].enabled = false;
        st.ports[port].connect_change = true;
    }

    pub fn with_function<R>(&self, port: usize, f: impl FnOnce(&mut MockFunction) -> R) -> R {
        let mut st = self.state.lock();
        f(st.ports[port].function.as_mut().expect("no function on port"))
    }

    pub fn set_sticky_reset(&self, sticky: bool) {
        self.state.lock().sticky_reset = sticky;
    }

    pub fn set_frozen(&self, frozen: bool) {
        self.state.lock().frozen = frozen;
    }

    pub fn tokens(&self) -> Vec<TokenRecord> {
        self.state.lock().tokens.clone()
    }

    pub fn reg32(&self, offset: u32) -> u32 {
        RegisterBlock::read32(self, offset)
    }

    fn port_index(st: &UhciState, offset: u32) -> Option<usize> {
        let index = (offset.checked_sub(uhci::regs::PORTSC1)? / 2) as usize;
        (index < st.ports.len()).then_some(index)
    }

    fn port_status(port: &RootPort) -> u16 {
        use uhci::portsc::*;
        let mut value = RESERVED;
        if port.connected() {
            value |= CCS;
            if port.low_speed() {
                value |= LSDA;
            }
        }
        if port.connect_change {
            value |= CSC;
        }
        if port.enabled {
            value |= PE;
        }
        if port.enable_change {
            value |= PEC;
        }
        if port.reset {
            value |= PR;
        }
        value
    }

    fn write_port(st: &mut UhciState, index: usize, value: u16) {
        use uhci::portsc::*;
        let sticky = st.sticky_reset;
        let port = &mut st.ports[index];
        if value & CSC != 0 {
            port.connect_change = false;
        }
        if value & PEC != 0 {
            port.enable_change = false;
        }
        if value & PR != 0 {
            if !port.reset {
                port.bus_reset();
            }
            port.reset = true;
            port.enabled = false;
        } else if port.reset && !sticky {
            port.reset = false;
        }
        if !port.reset {
            port.enabled = value & PE != 0 && port.connected();
        }
    }

    fn fault_bits(code: CompletionCode) -> u32 {
        use uhci::td::*;
        match code {
            CompletionCode::Stall => 0,
            CompletionCode::Babble | CompletionCode::DataOverrun => CS_BABBLE,
            CompletionCode::BitStuffing => CS_BITSTUFF,
            CompletionCode::BufferOverrun | CompletionCode::BufferUnderrun => CS_DBUF,
            _ => CS_CRC_TIMEOUT,
        }
    }

    fn process(&self, st: &mut UhciState) {
        use uhci::link;
        let Some(platform) = self.platform.upgrade() else {
            return;
        };
        if st.frame_list == 0 {
            return;
        }
        let entry = platform.read32_phys(st.frame_list + (st.frame as u32 & 0x3FF) * 4);
        if entry & link::TERMINATE != 0 || entry & link::QH == 0 {
            return;
        }

        let mut next = platform.read32_phys(entry & !0xF);
        for _ in 0..8 {
            if next & link::TERMINATE != 0 || next & link::QH == 0 {
                break;
            }
            let qh = next & !0xF;
            Self::process_qh(&platform, st, qh);
            next = platform.read32_phys(qh);
        }
    }

    fn process_qh(platform: &MockPlatform, st: &mut UhciState, qh: u32) {
        use uhci::{link, td};
        for _ in 0..64 {
            let element = platform.read32_phys(qh + 4);
            if element & link::TERMINATE != 0 || element & link::QH != 0 {
                return;
            }
            let td_phys = element & !0xF;
            let cs = platform.read32_phys(td_phys + 4);
            if cs & td::CS_ACTIVE == 0 {
                return;
            }
            let token = platform.read32_phys(td_phys + 8);
            let buffer = platform.read32_phys(td_phys + 12);

            let pid = match token & 0xFF {
                td::TOKEN_PID_SETUP => Pid::Setup,
                td::TOKEN_PID_IN => Pid::In,
                _ => Pid::Out,
            };
            let address = ((token >> td::TOKEN_ADDR_SHIFT) & 0x7F) as u8;
            let endpoint = ((token >> td::TOKEN_ENDP_SHIFT) & 0xF) as u8;
            let toggle = token & td::TOKEN_D != 0;
            let len = td::decode_len(token >> td::TOKEN_MAXLEN_SHIFT);

            let mut data = vec![0u8; len];
            if pid != Pid::In {
                platform.read_phys(buffer, &mut data);
            }
            let cleared = cs & !(td::CS_ACTIVE | UHCI_CS_NAK | td::CS_ACTLEN_MASK);
            match execute(&mut st.ports, pid, address, endpoint, toggle, &mut data) {
                Outcome::Nak => {
                    platform.write32_phys(td_phys + 4, cs | UHCI_CS_NAK);
                    return;
                }
                Outcome::Ack(n) => {
                    st.tokens.push(TokenRecord::new(pid, endpoint, toggle, len));
                    if pid == Pid::In {
                        platform.write_phys(buffer, &data[..n]);
                    }
                    platform.write32_phys(td_phys + 4, cleared | td::encode_len(n));
                    if cs & td::CS_IOC != 0 {
                        st.status |= uhci::usbsts::USBINT;
                    }
                    // Short packet detect leaves the queue on this TD
                    if pid == Pid::In && n < len && cs & td::CS_SPD != 0 {
                        return;
                    }
                    platform.write32_phys(qh + 4, platform.read32_phys(td_phys));
                }
                Outcome::Fault(code) | Outcome::Partial(_, code) => {
                    st.tokens.push(TokenRecord::new(pid, endpoint, toggle, len));
                    platform.write32_phys(
                        td_phys + 4,
                        cleared | td::CS_STALLED | Self::fault_bits(code) | td::encode_len(0),
                    );
                    st.status |= uhci::usbsts::USBERRINT;
                    return;
                }
            }
        }
    }
}

impl RegisterBlock for MockUhci {
    fn read32(&self, offset: u32) -> u32 {
        if offset == uhci::regs::FLBASEADD {
            return self.state.lock().frame_list;
        }
        RegisterBlock::read16(self, offset) as u32
            | ((RegisterBlock::read16(self, offset + 2) as u32) << 16)
    }

    fn write32(&self, offset: u32, value: u32) {
        if offset == uhci::regs::FLBASEADD {
            self.state.lock().frame_list = value & !0xFFF;
        } else {
            RegisterBlock::write16(self, offset, value as u16);
        }
    }

    fn read16(&self, offset: u32) -> u16 {
        use uhci::regs::*;
        let st = self.state.lock();
        match offset {
            USBCMD => st.command,
            USBSTS => st.status,
            USBINTR => st.intr,
            FRNUM => st.frame,
            o => match Self::port_index(&st, o) {
                Some(index) => Self::port_status(&st.ports[index]),
                None if o >= PORTSC1 => 0xFFFF,
                None => 0,
            },
        }
    }

    fn write16(&self, offset: u32, value: u16) {
        use uhci::regs::*;
        use uhci::{usbcmd, usbsts};
        let mut st = self.state.lock();
        match offset {
            USBCMD => {
                if value & usbcmd::HCRESET != 0 {
                    st.command = 0;
                    st.status = usbsts::HCHALTED;
                    st.intr = 0;
                    st.frame = 0;
                    st.frame_list = 0;
                    for port in st.ports.iter_mut() {
                        port.enabled = false;
                    }
                } else {
                    st.command = value;
                    if value & usbcmd::RS != 0 {
                        st.status &= !usbsts::HCHALTED;
                    } else {
                        st.status |= usbsts::HCHALTED;
                    }
                }
            }
            USBSTS => st.status &= !(value & usbsts::EVENTS),
            USBINTR => st.intr = value,
            FRNUM => st.frame = value & 0x7FF,
            o => {
                if let Some(index) = Self::port_index(&st, o) {
                    Self::write_port(&mut st, index, value);
                }
            }
        }
    }
}

impl MockHardware for MockUhci {
    fn tick(&self, ms: u32) {
        let mut st = self.state.lock();
        if st.frozen || st.command & uhci::usbcmd::RS == 0 {
            return;
        }
        st.frame = (st.frame + ms as u16) & 0x7FF;
        self.process(&mut st);
    }
}

// ============================================================================
// EHCI
// ============================================================================

/// Operational registers start here
const EHCI_CAPLENGTH: u32 = 0x20;
/// Where [`MockEhci::set_bios_owned`] places USBLEGSUP
const EHCI_EECP: u8 = 0x68;

struct EhciState {
    hccparams: u32,
    command: u32,
    status: u32,
    intr: u32,
    frindex: u32,
    periodic: u32,
    async_list: u32,
    configflag: u32,
    other: BTreeMap<u32, u32>,
    ports: Vec<RootPort>,
    sticky_reset: bool,
    frozen: bool,
    tokens: Vec<TokenRecord>,
}

/// Register model of an EHCI controller
pub struct MockEhci {
    platform: Weak<MockPlatform>,
    state: Mutex<EhciState>,
}

impl MockEhci {
    pub fn new(platform: &Arc<MockPlatform>, ports: u8) -> Arc<Self> {
        let hw = Arc::new(Self {
            platform: Arc::downgrade(platform),
            state: Mutex::new(EhciState {
                hccparams: 0,
                command: 0,
                status: ehci::usbsts::HCHALTED,
                intr: 0,
                frindex: 0,
                periodic: 0,
                async_list: 0,
                configflag: 0,
                other: BTreeMap::new(),
                ports: (0..ports).map(|_| RootPort::default()).collect(),
                sticky_reset: false,
                frozen: false,
                tokens: Vec::new(),
            }),
        });
        platform.attach_hardware(EHCI_BAR, &hw);
        hw
    }

    pub fn pci_address(&self) -> PciAddress {
        EHCI_PCI
    }

    pub fn connect(&self, port: usize, function: MockFunction) {
        let mut st = self.state.lock();
        st.ports[port].function = Some(function);
        st.ports[port].companion = false;
        st.ports[port].connect_change = true;
        st.status |= ehci::usbsts::PCD;
    }

    pub fn disconnect(&self, port: usize) {
        let mut st = self.state.lock();
        let port_state = &mut st.ports[port];
        port_state.function = None;
        port_state.enabled = false;
        port_state.companion = false;
        port_state.connect_change = true;
        st.status |= ehci::usbsts::PCD;
    }

    pub fn with_function<R>(&self, port: usize, f: impl FnOnce(&mut MockFunction) -> R) -> R {
        let mut st = self.state.lock();
        f(st.ports[port].function.as_mut().expect("no function on port"))
    }

    pub fn port_owned_by_companion(&self, port: usize) -> bool {
        self.state.lock().ports[port].companion
    }

    pub fn tokens(&self) -> Vec<TokenRecord> {
        self.state.lock().tokens.clone()
    }

    pub fn set_sticky_reset(&self, sticky: bool) {
        self.state.lock().sticky_reset = sticky;
    }

    pub fn set_frozen(&self, frozen: bool) {
        self.state.lock().frozen = frozen;
    }

    /// Latch status bits as if the hardware raised them
    pub fn raise_status(&self, bits: u32) {
        self.state.lock().status |= bits;
    }

    pub fn op_reg(&self, offset: u32) -> u32 {
        RegisterBlock::read32(self, EHCI_CAPLENGTH + offset)
    }

    /// Publish a USBLEGSUP capability whose BIOS semaphore is never
    /// released. Returns its configuration space offset.
    pub fn set_bios_owned(&self, owned: bool) -> u8 {
        self.state.lock().hccparams = (EHCI_EECP as u32) << ehci::cap::HCC_EECP_SHIFT;
        if let Some(platform) = self.platform.upgrade() {
            let bios = if owned { ehci::usblegsup::HC_BIOS_OWNED } else { 0 };
            platform.set_pci_config(EHCI_PCI, EHCI_EECP, ehci::usblegsup::CAP_ID | bios);
        }
        EHCI_EECP
    }

    fn port_status(port: &RootPort) -> u32 {
        use ehci::portsc::*;
        let mut value = 0;
        if port.connected() {
            value |= CCS;
            if !port.enabled && !port.reset {
                value |= if port.low_speed() { LS_K } else { 2 << 10 };
            }
        }
        if port.connect_change {
            value |= CSC;
        }
        if port.enabled {
            value |= PE;
        }
        if port.enable_change {
            value |= PEC;
        }
        if port.reset {
            value |= PR;
        }
        if port.powered {
            value |= PP;
        }
        if port.companion {
            value |= PO;
        }
        value
    }

    fn write_port(st: &mut EhciState, index: usize, value: u32) {
        use ehci::portsc::*;
        let sticky = st.sticky_reset;
        let Some(port) = st.ports.get_mut(index) else {
            return;
        };
        if value & CSC != 0 {
            port.connect_change = false;
        }
        if value & PEC != 0 {
            port.enable_change = false;
        }
        if value & PO != 0 && !port.companion {
            port.companion = true;
            port.enabled = false;
        }
        port.powered = value & PP != 0;
        if value & PE == 0 {
            port.enabled = false;
        }
        if value & PR != 0 {
            if !port.reset {
                port.bus_reset();
            }
            port.reset = true;
            port.enabled = false;
        } else if port.reset && !sticky {
            port.reset = false;
            port.enabled = !port.companion
                && port
                    .function
                    .as_ref()
                    .is_some_and(|f| f.speed == UsbSpeed::High);
        }
    }

    fn reset(st: &mut EhciState) {
        st.command = 0;
        st.status = ehci::usbsts::HCHALTED;
        st.intr = 0;
        st.periodic = 0;
        st.async_list = 0;
        st.configflag = 0;
        for port in st.ports.iter_mut() {
            port.enabled = false;
        }
    }

    fn fault_bits(code: CompletionCode) -> u32 {
        use ehci::qtd::*;
        match code {
            CompletionCode::Stall => 0,
            CompletionCode::Babble | CompletionCode::DataOverrun => STS_BABBLE,
            CompletionCode::BufferOverrun | CompletionCode::BufferUnderrun => STS_DATA_BUFFER_ERR,
            _ => STS_XACT_ERR,
        }
    }

    fn process(&self, st: &mut EhciState) {
        use ehci::{link, qh};
        let Some(platform) = self.platform.upgrade() else {
            return;
        };
        let head = st.async_list & !0x1F;
        if head == 0 {
            return;
        }

        let mut current = head;
        for _ in 0..16 {
            let characteristics = platform.read32_phys(current + 4);
            if characteristics & qh::CHAR_H == 0 {
                Self::process_qh(&platform, st, current);
            }
            let horizontal = platform.read32_phys(current);
            if horizontal & link::TERMINATE != 0 {
                break;
            }
            current = horizontal & !0x1F;
            if current == head {
                break;
            }
        }
    }

    fn process_qh(platform: &MockPlatform, st: &mut EhciState, qh_phys: u32) {
        use ehci::{link, qh, qtd};
        let characteristics = platform.read32_phys(qh_phys + 4);
        let address = (characteristics & 0x7F) as u8;
        let endpoint = ((characteristics >> qh::CHAR_ENDPT_SHIFT) & 0xF) as u8;
        let max_packet = ((characteristics >> qh::CHAR_MPS_SHIFT) & 0x7FF) as u16;
        let next_ptr = qh_phys + qh::NEXT_QTD as u32 * 4;

        for _ in 0..64 {
            let next = platform.read32_phys(next_ptr);
            if next & link::TERMINATE != 0 {
                return;
            }
            let qtd_phys = next & !0x1F;
            let token = platform.read32_phys(qtd_phys + 8);
            if token & qtd::STS_ACTIVE == 0 {
                return;
            }
            let buffer = platform.read32_phys(qtd_phys + 12);
            let pid = match (token >> qtd::PID_SHIFT) & 3 {
                qtd::PID_OUT => Pid::Out,
                qtd::PID_IN => Pid::In,
                _ => Pid::Setup,
            };
            let len = ((token >> qtd::BYTES_SHIFT) & qtd::BYTES_MASK) as usize;
            let toggle = token & qtd::TOGGLE != 0;

            let mut data = vec![0u8; len];
            if pid != Pid::In {
                platform.read_phys(buffer, &mut data);
            }
            let outcome = execute(&mut st.ports, pid, address, endpoint, toggle, &mut data);
            match outcome {
                Outcome::Nak => return,
                Outcome::Ack(n) => {
                    st.tokens.push(TokenRecord::new(pid, endpoint, toggle, len));
                    if pid == Pid::In {
                        platform.write_phys(buffer, &data[..n]);
                    }
                    let next_toggle = toggle ^ (packets(n, max_packet) % 2 == 1);
                    let token = (token
                        & !(qtd::STS_ACTIVE | (qtd::BYTES_MASK << qtd::BYTES_SHIFT) | qtd::TOGGLE))
                        | (((len - n) as u32) << qtd::BYTES_SHIFT)
                        | if next_toggle { qtd::TOGGLE } else { 0 };
                    platform.write32_phys(qtd_phys + 8, token);
                    if token & qtd::IOC != 0 {
                        st.status |= ehci::usbsts::USBINT;
                    }
                    let alt = platform.read32_phys(qtd_phys + 4);
                    let follow = if n < len && alt & link::TERMINATE == 0 {
                        alt
                    } else {
                        platform.read32_phys(qtd_phys)
                    };
                    platform.write32_phys(next_ptr, follow);
                }
                Outcome::Fault(code) | Outcome::Partial(_, code) => {
                    let moved = match outcome {
                        Outcome::Partial(n, _) => n,
                        _ => 0,
                    };
                    st.tokens.push(TokenRecord::new(pid, endpoint, toggle, len));
                    let token = (token & !(qtd::STS_ACTIVE | (qtd::BYTES_MASK << qtd::BYTES_SHIFT)))
                        | (((len - moved) as u32) << qtd::BYTES_SHIFT)
                        | qtd::STS_HALTED
                        | Self::fault_bits(code);
                    platform.write32_phys(qtd_phys + 8, token);
                    st.status |= ehci::usbsts::USBERRINT;
                    return;
                }
            }
        }
    }
}

impl RegisterBlock for MockEhci {
    fn read32(&self, offset: u32) -> u32 {
        use ehci::op;
        let st = self.state.lock();
        match offset {
            0x00 => EHCI_CAPLENGTH | (0x0100 << 16),
            0x04 => st.ports.len() as u32 | ehci::cap::HCS_PPC,
            0x08 => st.hccparams,
            o if o < EHCI_CAPLENGTH => 0,
            o => match o - EHCI_CAPLENGTH {
                op::USBCMD => st.command,
                op::USBSTS => st.status,
                op::USBINTR => st.intr,
                op::FRINDEX => st.frindex,
                op::PERIODICLISTBASE => st.periodic,
                op::ASYNCLISTADDR => st.async_list,
                op::CONFIGFLAG => st.configflag,
                reg if reg >= op::PORTSC => {
                    let index = ((reg - op::PORTSC) / 4) as usize;
                    st.ports.get(index).map_or(0, Self::port_status)
                }
                reg => st.other.get(&reg).copied().unwrap_or(0),
            },
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        use ehci::{op, usbcmd, usbsts};
        if offset < EHCI_CAPLENGTH {
            return;
        }
        let mut st = self.state.lock();
        match offset - EHCI_CAPLENGTH {
            op::USBCMD => {
                if value & usbcmd::HCRESET != 0 {
                    Self::reset(&mut st);
                    return;
                }
                st.command = value & !usbcmd::IAAD;
                if value & usbcmd::RS != 0 {
                    st.status &= !usbsts::HCHALTED;
                } else {
                    st.status |= usbsts::HCHALTED;
                }
                if value & usbcmd::IAAD != 0 && value & usbcmd::RS != 0 && !st.frozen {
                    st.status |= usbsts::IAA;
                }
            }
            op::USBSTS => st.status &= !(value & usbsts::EVENTS),
            op::USBINTR => st.intr = value,
            op::PERIODICLISTBASE => st.periodic = value,
            op::ASYNCLISTADDR => st.async_list = value,
            op::CONFIGFLAG => st.configflag = value,
            reg if reg >= op::PORTSC => {
                let index = ((reg - op::PORTSC) / 4) as usize;
                Self::write_port(&mut st, index, value);
            }
            reg => {
                st.other.insert(reg, value);
            }
        }
    }

    fn read16(&self, offset: u32) -> u16 {
        (RegisterBlock::read32(self, offset & !3) >> ((offset & 2) * 8)) as u16
    }

    fn write16(&self, _offset: u32, _value: u16) {}
}

impl MockHardware for MockEhci {
    fn tick(&self, ms: u32) {
        let mut st = self.state.lock();
        if st.frozen || st.command & ehci::usbcmd::RS == 0 {
            return;
        }
        st.frindex = st.frindex.wrapping_add(ms * 8) & 0x3FFF;
        if st.command & ehci::usbcmd::ASE != 0 {
            self.process(&mut st);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dma_regions_are_aligned_and_mapped() {
        let platform = MockPlatform::new();
        let a = platform.alloc_dma(100, 4096).unwrap();
        let b = platform.alloc_dma(64, 512).unwrap();
        assert_eq!(a.phys() % 4096, 0);
        assert_eq!(b.phys() % 512, 0);
        assert!(b.phys() >= a.phys() + 100);

        platform.write32_phys(b.phys_at(8), 0xCAFE_F00D);
        let mut raw = [0u8; 4];
        platform.read_phys(b.phys_at(8), &mut raw);
        assert_eq!(u32::from_le_bytes(raw), 0xCAFE_F00D);
        assert_eq!(platform.virt_to_phys(a.virt() + 4), a.phys() + 4);
    }

    #[test]
    fn test_function_answers_only_its_address() {
        let mut f = MockFunction::mass_storage(UsbSpeed::Full);
        let mut setup = [0x00, request::SET_ADDRESS, 5, 0, 0, 0, 0, 0];
        assert_eq!(f.transact(Pid::Setup, 0, 0, false, &mut setup), Outcome::Ack(8));
        assert_eq!(f.transact(Pid::In, 0, 0, true, &mut []), Outcome::Ack(0));
        assert_eq!(f.address, 5);
        assert_eq!(
            f.transact(Pid::In, 0, 0, true, &mut []),
            Outcome::Fault(CompletionCode::NotResponding)
        );
    }

    #[test]
    fn test_bulk_in_naks_without_data() {
        let mut f = MockFunction::mass_storage(UsbSpeed::Full);
        let mut buf = [0u8; 64];
        assert_eq!(f.transact(Pid::In, 0, 1, false, &mut buf), Outcome::Nak);
        f.bulk_in_data.extend([1, 2, 3]);
        assert_eq!(f.transact(Pid::In, 0, 1, false, &mut buf), Outcome::Ack(3));
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }
}
