//! USB host controller drivers
//!
//! # Host Controllers
//! - EHCI (USB 2.0) - High-speed controller, full/low-speed devices go to
//!   the companion
//! - OHCI (USB 1.1) - Full/Low-speed controller
//! - UHCI (USB 1.1) - Intel's Full/Low-speed controller
//!
//! # Architecture
//!
//! Every controller is a [`HostController`] wrapping a family backend. The
//! backends only translate transactions to and from their descriptor
//! formats; the shared transfer engine in `transfer` builds descriptor
//! chains in a [`pool::DescriptorPool`], waits for them and retries. Root
//! ports are reset and enumerated by the controller, and mass-storage
//! devices are handed to the embedder's [`DeviceManager`] as [`UsbDisk`]s.

pub mod controller;
pub mod ehci;
pub mod enumerate;
pub mod host;
pub mod ohci;
pub mod pool;
pub mod port;
pub mod transfer;
pub mod uhci;

#[cfg(test)]
pub(crate) mod mock;

pub use self::controller::{ControllerFamily, UsbError, UsbSpeed};
pub use self::host::{HostController, UsbDisk};

use alloc::sync::Arc;

use spin::Mutex;

use crate::config::HostConfig;
use crate::drivers::pci::{self, PciDevice};
use crate::platform::{DeviceManager, Platform};

/// Controllers a stack manages
pub const MAX_CONTROLLERS: usize = 8;

/// All host controllers of one system
pub struct UsbStack {
    platform: Arc<dyn Platform>,
    manager: Arc<dyn DeviceManager>,
    config: HostConfig,
    controllers: heapless::Vec<Arc<Mutex<HostController>>, MAX_CONTROLLERS>,
    ehci_count: u8,
    ohci_count: u8,
    uhci_count: u8,
}

impl UsbStack {
    pub fn new(platform: Arc<dyn Platform>, manager: Arc<dyn DeviceManager>, config: HostConfig) -> Self {
        Self {
            platform,
            manager,
            config,
            controllers: heapless::Vec::new(),
            ehci_count: 0,
            ohci_count: 0,
            uhci_count: 0,
        }
    }

    /// Install every supported USB host controller in `devices`
    ///
    /// Matches class 0x0C, subclass 0x03 with prog-if:
    /// - EHCI (USB 2.0) - 0x20
    /// - OHCI (USB 1.1) - 0x10
    /// - UHCI (USB 1.1) - 0x00
    ///
    /// xHCI (0x30) is reported and skipped. Returns the number of
    /// controllers installed by this call.
    pub fn scan_pci(&mut self, devices: &[PciDevice]) -> usize {
        log::info!("Initializing USB controllers...");

        let mut installed = 0;
        for dev in devices.iter().filter(|d| d.is_usb_controller()) {
            if dev.prog_if == pci::prog_if::XHCI {
                log::info!(
                    "Found xHCI controller at {}: {:04x}:{:04x}, not supported",
                    dev.address,
                    dev.vendor_id,
                    dev.device_id
                );
                continue;
            }
            let Some(family) = ControllerFamily::from_prog_if(dev.prog_if) else {
                log::debug!("USB: unknown prog-if {:#04x} at {}", dev.prog_if, dev.address);
                continue;
            };

            log::info!(
                "Found {} controller at {}: {:04x}:{:04x}",
                family,
                dev.address,
                dev.vendor_id,
                dev.device_id
            );

            match self.install(dev, family) {
                Ok(()) => installed += 1,
                Err(e) => log::error!("  Failed to init {}: {}", family, e),
            }
        }

        log::info!(
            "USB: {} EHCI, {} OHCI, {} UHCI controller(s)",
            self.ehci_count,
            self.ohci_count,
            self.uhci_count
        );
        installed
    }

    /// Install one controller; its bring-up runs in a spawned task
    pub fn install(&mut self, dev: &PciDevice, family: ControllerFamily) -> Result<(), UsbError> {
        if self.controllers.is_full() {
            log::warn!("USB: controller limit reached, ignoring {}", dev.address);
            return Err(UsbError::NoFreeSlots);
        }

        let count = match family {
            ControllerFamily::Ehci => &mut self.ehci_count,
            ControllerFamily::Ohci => &mut self.ohci_count,
            ControllerFamily::Uhci => &mut self.uhci_count,
        };
        let number = *count + 1;

        let hc = HostController::install(
            dev,
            number,
            self.platform.clone(),
            self.manager.clone(),
            self.config,
        )?;
        *count = number;
        let _ = self.controllers.push(hc);
        Ok(())
    }

    pub fn controllers(&self) -> &[Arc<Mutex<HostController>>] {
        &self.controllers
    }

    /// Run deferred work on every controller that is not busy
    pub fn poll(&self) {
        for hc in self.controllers.iter() {
            if let Some(mut hc) = hc.try_lock() {
                hc.poll();
            }
        }
    }
}
