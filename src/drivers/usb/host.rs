//! Host controller instances
//!
//! [`HostController`] is the per-PCI-function object the rest of the kernel
//! programs against. It owns the backend for its family, the descriptor
//! pool and the root ports, and runs port status changes through reset and
//! enumeration. Installed controllers live behind `Arc<spin::Mutex<_>>`;
//! the init task, the interrupt handler and every [`UsbDisk`] reach them
//! through that handle.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::fmt::Write;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use super::controller::{ControllerFamily, Direction, EndpointInfo, Result, UsbError, UsbSpeed};
use super::ehci::EhciController;
use super::ohci::OhciController;
use super::pool::{DescriptorPool, PoolLayout};
use super::port::{Device, Port, PortState, PortStatus};
use super::transfer::{ElementStatus, Target, Transaction, Transfer};
use super::uhci::UhciController;
use crate::config::HostConfig;
use crate::drivers::pci::{self, PciDevice};
use crate::platform::{DeviceManager, IrqHandler, Platform, PortInfo, RegisterBlock};
use crate::time::wait_until;

/// Root ports tracked per controller
pub const MAX_PORTS: usize = 15;

/// Follow-up work decoded from an interrupt status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InterruptAction {
    /// A root port changed state
    pub rescan: bool,
    /// The controller needs a full re-initialization
    pub reinit: bool,
}

impl InterruptAction {
    fn merge(&mut self, other: InterruptAction) {
        self.rescan |= other.rescan;
        self.reinit |= other.reinit;
    }
}

// ============================================================================
// Backend dispatch
// ============================================================================

/// Family-specific half of a controller
pub enum HostControllerBackend {
    Ohci(OhciController),
    Uhci(UhciController),
    Ehci(EhciController),
}

/// Run `$body` with `$b` bound to the concrete backend
macro_rules! with_backend {
    ($backend:expr, $b:ident => $body:expr) => {
        match $backend {
            HostControllerBackend::Ohci($b) => $body,
            HostControllerBackend::Uhci($b) => $body,
            HostControllerBackend::Ehci($b) => $body,
        }
    };
}

impl HostControllerBackend {
    pub fn new(
        family: ControllerFamily,
        pci: &PciDevice,
        regs: Arc<dyn RegisterBlock>,
        platform: Arc<dyn Platform>,
        config: HostConfig,
    ) -> Self {
        match family {
            ControllerFamily::Ohci => Self::Ohci(OhciController::new(regs, platform, config)),
            ControllerFamily::Uhci => {
                Self::Uhci(UhciController::new(regs, platform, config, pci.address))
            }
            ControllerFamily::Ehci => {
                Self::Ehci(EhciController::new(regs, platform, config, pci.address))
            }
        }
    }

    pub fn family(&self) -> ControllerFamily {
        match self {
            Self::Ohci(_) => ControllerFamily::Ohci,
            Self::Uhci(_) => ControllerFamily::Uhci,
            Self::Ehci(_) => ControllerFamily::Ehci,
        }
    }

    pub fn pool_layout(family: ControllerFamily) -> PoolLayout {
        match family {
            ControllerFamily::Ohci => OhciController::pool_layout(),
            ControllerFamily::Uhci => UhciController::pool_layout(),
            ControllerFamily::Ehci => EhciController::pool_layout(),
        }
    }

    /// Read and acknowledge the interrupt status without the controller lock
    pub fn latch_interrupt(family: ControllerFamily, regs: &dyn RegisterBlock) -> u32 {
        match family {
            ControllerFamily::Ohci => OhciController::latch_interrupt(regs),
            ControllerFamily::Uhci => UhciController::latch_interrupt(regs),
            ControllerFamily::Ehci => EhciController::latch_interrupt(regs),
        }
    }

    pub fn init_hardware(&mut self, pool: &mut DescriptorPool) -> Result<u8> {
        with_backend!(self, b => b.init_hardware(pool))
    }

    pub fn port_status(&self, port: u8) -> PortStatus {
        with_backend!(self, b => b.port_status(port))
    }

    pub fn clear_port_change(&self, port: u8) {
        with_backend!(self, b => b.clear_port_change(port))
    }

    pub fn reset_port(&self, port: u8) -> Result<Option<UsbSpeed>> {
        with_backend!(self, b => b.reset_port(port))
    }

    pub fn enable_port(&self, port: u8) {
        with_backend!(self, b => b.enable_port(port))
    }

    pub fn max_transaction_len(&self, pool: &DescriptorPool, max_packet: u16) -> usize {
        with_backend!(self, b => b.max_transaction_len(pool, max_packet))
    }

    pub fn encode_element(&self, pool: &DescriptorPool, target: &Target, tx: &Transaction<'_>) {
        with_backend!(self, b => b.encode_element(pool, target, tx))
    }

    pub fn link(&self, pool: &DescriptorPool, prev: usize, next: usize) {
        with_backend!(self, b => b.link(pool, prev, next))
    }

    pub fn publish(&mut self, pool: &DescriptorPool, transfer: &Transfer<'_>) {
        with_backend!(self, b => b.publish(pool, transfer))
    }

    pub fn element_status(&self, pool: &DescriptorPool, tx: &Transaction<'_>) -> ElementStatus {
        with_backend!(self, b => b.element_status(pool, tx))
    }

    pub fn end_data_stage(&self, pool: &DescriptorPool, transfer: &Transfer<'_>, next: usize) {
        with_backend!(self, b => b.end_data_stage(pool, transfer, next))
    }

    pub fn unlink(&mut self, pool: &DescriptorPool, transfer: &Transfer<'_>) {
        with_backend!(self, b => b.unlink(pool, transfer))
    }

    pub fn quiesce(&mut self, pool: &DescriptorPool) -> Result<()> {
        with_backend!(self, b => b.quiesce(pool))
    }

    pub fn retry_budget(&self) -> u32 {
        with_backend!(self, b => b.retry_budget())
    }

    pub fn settle_delay_ms(&self) -> u32 {
        with_backend!(self, b => b.settle_delay_ms())
    }

    pub fn dispatch_interrupt(&mut self, status: u32, pool: &mut DescriptorPool) -> InterruptAction {
        with_backend!(self, b => b.dispatch_interrupt(status, pool))
    }
}

// ============================================================================
// Host controller
// ============================================================================

/// One USB host controller
pub struct HostController {
    family: ControllerFamily,
    /// 1-based number within the family
    number: u8,
    name: heapless::String<16>,
    pci: PciDevice,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) manager: Arc<dyn DeviceManager>,
    pub(crate) config: HostConfig,
    regs: Arc<dyn RegisterBlock>,
    pub(crate) backend: HostControllerBackend,
    pub(crate) pool: DescriptorPool,
    pub(crate) ports: heapless::Vec<Port, MAX_PORTS>,
    /// Status latched by the IRQ handler while the controller was locked
    pending: Arc<AtomicU32>,
    this: Weak<Mutex<HostController>>,
    running: bool,
    rescan_requested: bool,
    reinit_requested: bool,
    /// A reinit task has been spawned and not run yet
    reinit_scheduled: bool,
    /// Bit n set: address n is in use
    addresses: u128,
}

impl HostController {
    /// Map the controller's registers and allocate its descriptor pool.
    ///
    /// Pool allocation failure is the one fatal installation error.
    pub fn new(
        pci: &PciDevice,
        number: u8,
        platform: Arc<dyn Platform>,
        manager: Arc<dyn DeviceManager>,
        config: HostConfig,
    ) -> Result<Self> {
        let family = ControllerFamily::from_prog_if(pci.prog_if).ok_or(UsbError::Unsupported)?;

        let bar = match family {
            ControllerFamily::Uhci => pci.io_bar(),
            ControllerFamily::Ohci | ControllerFamily::Ehci => pci.mmio_bar(),
        }
        .ok_or(UsbError::NotReady)?;
        let regs = platform.register_block(bar)?;

        let mut name = heapless::String::new();
        let _ = write!(name, "{} {}", family, number);

        let pool = DescriptorPool::new(&*platform, HostControllerBackend::pool_layout(family))
            .inspect_err(|e| log::error!("{}: descriptor pool allocation failed: {}", name, e))?;

        let backend = HostControllerBackend::new(family, pci, regs.clone(), platform.clone(), config);

        Ok(Self {
            family,
            number,
            name,
            pci: pci.clone(),
            platform,
            manager,
            config,
            regs,
            backend,
            pool,
            ports: heapless::Vec::new(),
            pending: Arc::new(AtomicU32::new(0)),
            this: Weak::new(),
            running: false,
            rescan_requested: false,
            reinit_requested: false,
            reinit_scheduled: false,
            addresses: 0,
        })
    }

    /// Create the controller, hook its IRQ line and spawn its init task.
    ///
    /// Hardware bring-up happens in the task; this returns immediately.
    pub fn install(
        pci: &PciDevice,
        number: u8,
        platform: Arc<dyn Platform>,
        manager: Arc<dyn DeviceManager>,
        config: HostConfig,
    ) -> Result<Arc<Mutex<HostController>>> {
        let controller = Self::new(pci, number, platform.clone(), manager, config)?;
        let family = controller.family;
        let name = controller.name.clone();
        let regs = controller.regs.clone();
        let pending = controller.pending.clone();

        let hc = Arc::new_cyclic(|this| {
            let mut controller = controller;
            controller.this = this.clone();
            Mutex::new(controller)
        });

        let weak = Arc::downgrade(&hc);
        let handler: IrqHandler = Box::new(move || handle_irq(&weak, &*regs, &pending, family));
        if let Err(e) = platform.install_irq(pci.interrupt_line, handler) {
            log::warn!(
                "{}: cannot install handler for IRQ {}: {}, polling only",
                name,
                pci.interrupt_line,
                e
            );
        }

        let weak = Arc::downgrade(&hc);
        platform.spawn_task(
            &name,
            Box::new(move || {
                if let Some(hc) = weak.upgrade() {
                    hc.lock().start();
                }
            }),
        );

        Ok(hc)
    }

    pub fn family(&self) -> ControllerFamily {
        self.family
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pci(&self) -> &PciDevice {
        &self.pci
    }

    /// Hardware came up and the ports are live
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    /// Body of the init task: bring up the hardware, announce the root
    /// ports and enumerate whatever is already plugged in.
    pub fn start(&mut self) {
        self.bring_up(true);
    }

    fn bring_up(&mut self, announce: bool) {
        pci::enable_device(&*self.platform, &self.pci);

        let count = match self.backend.init_hardware(&mut self.pool) {
            Ok(count) => count,
            Err(e) => {
                log::error!("{}: initialization failed: {}, controller left inert", self.name, e);
                self.running = false;
                return;
            }
        };
        self.running = true;

        self.ports.clear();
        for index in 0..count.min(MAX_PORTS as u8) {
            let _ = self.ports.push(Port::new(index));
            if announce {
                let mut name = heapless::String::new();
                let _ = write!(name, "{}-Port {}", self.family.name(), index + 1);
                self.manager.attach_port(&PortInfo {
                    name,
                    family: self.family,
                    controller: self.number,
                    index,
                });
            }
        }

        self.rescan_ports();
        self.poll();
    }

    // ------------------------------------------------------------------
    // Interrupts
    // ------------------------------------------------------------------

    /// Collect interrupt status (latched now or by the IRQ handler) and act
    /// on it. Returns `None` if nothing was pending.
    pub fn on_interrupt(&mut self) -> Option<InterruptAction> {
        let status = HostControllerBackend::latch_interrupt(self.family, &*self.regs)
            | self.pending.swap(0, Ordering::AcqRel);
        if status == 0 {
            return None;
        }

        let action = self.backend.dispatch_interrupt(status, &mut self.pool);
        if action.rescan {
            self.rescan_ports();
        }
        if action.reinit {
            self.request_reinit();
        }
        Some(action)
    }

    /// Dispatch status without acting on port changes; used where a rescan
    /// must not nest (IRQ context, inside a transfer)
    fn service_interrupt(&mut self, status: u32) -> InterruptAction {
        let action = self.backend.dispatch_interrupt(status, &mut self.pool);
        self.rescan_requested |= action.rescan;
        self.reinit_requested |= action.reinit;
        action
    }

    /// Drain status the IRQ handler left behind
    pub(crate) fn service_pending(&mut self) {
        let status = self.pending.swap(0, Ordering::AcqRel);
        if status != 0 {
            self.service_interrupt(status);
        }
    }

    /// Safe point for deferred work: pending interrupts, port changes and
    /// re-initialization requests
    pub fn poll(&mut self) {
        let mut action = InterruptAction::default();
        if let Some(a) = self.on_interrupt() {
            action.merge(a);
        }
        if core::mem::take(&mut self.rescan_requested) && !action.rescan {
            self.rescan_ports();
        }
        if core::mem::take(&mut self.reinit_requested) && !action.reinit {
            self.request_reinit();
        }
    }

    /// Re-initialize from a fresh task holding an explicit reference to
    /// this controller
    pub fn request_reinit(&mut self) {
        self.reinit_requested = false;
        if self.reinit_scheduled {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            log::error!("{}: re-initialization requested on a detached controller", self.name);
            return;
        };
        let mut name: heapless::String<24> = heapless::String::new();
        let _ = write!(name, "{} reinit", self.name);
        let weak = Arc::downgrade(&this);
        self.reinit_scheduled = true;
        self.platform.spawn_task(
            &name,
            Box::new(move || {
                if let Some(hc) = weak.upgrade() {
                    hc.lock().reinit();
                }
            }),
        );
    }

    /// Forget every device, reset the pool and run bring-up again
    pub fn reinit(&mut self) {
        log::warn!("{}: re-initializing controller", self.name);
        for index in 0..self.ports.len() {
            self.detach(index);
        }
        self.pool.force_reset();
        self.addresses = 0;
        self.reinit_requested = false;
        self.reinit_scheduled = false;
        self.bring_up(false);
    }

    // ------------------------------------------------------------------
    // Ports
    // ------------------------------------------------------------------

    /// Compare every root port with its recorded state and attach or detach
    pub fn rescan_ports(&mut self) {
        if !self.running {
            return;
        }
        for index in 0..self.ports.len() {
            let status = self.backend.port_status(index as u8);
            self.backend.clear_port_change(index as u8);

            let state = self.ports[index].state;
            if status.connected && state == PortState::Disconnected {
                self.attach(index);
            } else if !status.connected && state != PortState::Disconnected {
                log::info!("{}: device removed from port {}", self.name, index + 1);
                self.detach(index);
            }
        }
    }

    fn attach(&mut self, index: usize) {
        let port_no = index as u8;
        log::info!("{}: device connected on port {}", self.name, index + 1);
        {
            let port = &mut self.ports[index];
            port.connected = true;
            port.state = PortState::Resetting;
        }

        match self.backend.reset_port(port_no) {
            Err(e) => {
                log::warn!("{}: port {} reset failed: {}", self.name, index + 1, e);
                let port = &mut self.ports[index];
                port.connected = false;
                port.state = PortState::Disconnected;
                self.backend.enable_port(port_no);
            }
            Ok(None) => {
                log::info!("{}: port {} not enabled after reset", self.name, index + 1);
                let port = &mut self.ports[index];
                port.connected = false;
                port.state = PortState::Disconnected;
            }
            Ok(Some(speed)) => {
                log::info!("{}: port {} enabled, {} speed", self.name, index + 1, speed.name());
                {
                    let port = &mut self.ports[index];
                    port.enabled = true;
                    port.speed = speed;
                    port.state = PortState::Enabled;
                }
                match self.setup_device(index, speed) {
                    Ok(()) => self.ports[index].state = PortState::DeviceReady,
                    Err(e) => log::warn!(
                        "{}: enumeration on port {} failed: {}",
                        self.name,
                        index + 1,
                        e
                    ),
                }
            }
        }
    }

    fn detach(&mut self, index: usize) {
        let Some(port) = self.ports.get_mut(index) else {
            return;
        };
        let disk = port.disk.take();
        let address = port.device.as_ref().map(|dev| dev.address);
        port.clear();

        if let Some(disk) = disk {
            self.manager.remove_disk(disk);
        }
        if let Some(address) = address {
            self.free_address(address);
        }
    }

    /// Lowest free device address
    pub(crate) fn alloc_address(&mut self) -> Result<u8> {
        let address = (1..=127u8)
            .find(|&a| self.addresses & (1 << a) == 0)
            .ok_or(UsbError::NoFreeSlots)?;
        self.addresses |= 1 << address;
        Ok(address)
    }

    pub(crate) fn free_address(&mut self, address: u8) {
        if address != 0 && address < 128 {
            self.addresses &= !(1 << address);
        }
    }

    /// Run `f` on the device at `address` behind root port `port`
    pub fn with_device<R>(
        &mut self,
        port: u8,
        address: u8,
        f: impl FnOnce(&mut Self, &mut Device) -> Result<R>,
    ) -> Result<R> {
        let slot = self.ports.get_mut(port as usize).ok_or(UsbError::DeviceNotFound)?;
        let mut device = match slot.device.take() {
            Some(dev) if dev.address == address => dev,
            other => {
                slot.device = other;
                return Err(UsbError::Disconnected);
            }
        };

        let result = f(self, &mut device);

        if let Some(slot) = self.ports.get_mut(port as usize) {
            if slot.state == PortState::DeviceReady && slot.device.is_none() {
                slot.device = Some(device);
            }
        }
        result
    }

    pub(crate) fn this(&self) -> Weak<Mutex<HostController>> {
        self.this.clone()
    }
}

/// IRQ entry point: latch and acknowledge through the shared register
/// block, then dispatch if the controller is free or leave the status for
/// its next safe point
fn handle_irq(
    controller: &Weak<Mutex<HostController>>,
    regs: &dyn RegisterBlock,
    pending: &AtomicU32,
    family: ControllerFamily,
) {
    let status = HostControllerBackend::latch_interrupt(family, regs);
    if status == 0 {
        // shared line, not ours
        return;
    }

    let Some(hc) = controller.upgrade() else {
        return;
    };
    let Some(mut guard) = hc.try_lock() else {
        pending.fetch_or(status, Ordering::AcqRel);
        return;
    };

    let status = status | pending.swap(0, Ordering::AcqRel);
    let action = guard.service_interrupt(status);
    if action.reinit {
        guard.request_reinit();
    } else if action.rescan {
        let mut name: heapless::String<24> = heapless::String::new();
        let _ = write!(name, "{} ports", guard.name());
        let weak = Arc::downgrade(&hc);
        guard.platform.spawn_task(
            &name,
            Box::new(move || {
                if let Some(hc) = weak.upgrade() {
                    hc.lock().poll();
                }
            }),
        );
    }
}

// ============================================================================
// Disk handle
// ============================================================================

/// Lock attempts of 1 ms before a disk request gives up
const LOCK_POLLS: u32 = 1000;

/// A mass-storage device handed to the device manager
///
/// Requests lock the owning controller and run through its transfer engine.
#[derive(Clone)]
pub struct UsbDisk {
    controller: Weak<Mutex<HostController>>,
    platform: Arc<dyn Platform>,
    /// Name of the owning controller, e.g. "EHCI 1"
    pub controller_name: heapless::String<16>,
    /// Root port index
    pub port: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub endpoint_in: EndpointInfo,
    pub endpoint_out: EndpointInfo,
    pub product: heapless::String<64>,
    pub serial: heapless::String<32>,
}

impl UsbDisk {
    pub(crate) fn new(
        hc: &HostController,
        port: u8,
        dev: &Device,
        endpoint_in: EndpointInfo,
        endpoint_out: EndpointInfo,
    ) -> Self {
        Self {
            controller: hc.this(),
            platform: hc.platform.clone(),
            controller_name: hc.name.clone(),
            port,
            address: dev.address,
            vendor_id: dev.descriptor.vendor_id,
            product_id: dev.descriptor.product_id,
            endpoint_in,
            endpoint_out,
            product: dev.product.clone(),
            serial: dev.serial.clone(),
        }
    }

    /// Read from the bulk IN endpoint
    pub fn bulk_in(&self, buf: &mut [u8]) -> Result<usize> {
        let ep = self.endpoint_in;
        self.with_device(|hc, dev| hc.bulk_in(dev, &ep, buf))
    }

    /// Write to the bulk OUT endpoint
    pub fn bulk_out(&self, data: &[u8]) -> Result<usize> {
        let ep = self.endpoint_out;
        self.with_device(|hc, dev| hc.bulk_out(dev, &ep, data))
    }

    /// Clear a stalled bulk endpoint
    pub fn clear_halt(&self, direction: Direction) -> Result<()> {
        let ep = match direction {
            Direction::In => self.endpoint_in,
            Direction::Out => self.endpoint_out,
        };
        self.with_device(|hc, dev| hc.clear_feature_halt(dev, &ep))
    }

    fn with_device<R>(&self, f: impl FnOnce(&mut HostController, &mut Device) -> Result<R>) -> Result<R> {
        let hc = self.controller.upgrade().ok_or(UsbError::Disconnected)?;

        let mut guard = None;
        let _ = wait_until(&*self.platform, LOCK_POLLS, 1, || {
            guard = hc.try_lock();
            guard.is_some()
        });
        let mut guard = guard.ok_or(UsbError::NotReady)?;

        guard.poll();
        guard.with_device(self.port, self.address, f)
    }
}

impl core::fmt::Debug for UsbDisk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UsbDisk")
            .field("controller", &self.controller_name)
            .field("port", &self.port)
            .field("address", &self.address)
            .field("product", &self.product)
            .finish()
    }
}
