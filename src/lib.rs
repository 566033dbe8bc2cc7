//! usbhc - USB host controller transfer engine
//!
//! This library drives the three USB 1.1/2.0 host controller families (OHCI,
//! UHCI and EHCI) through one transfer/transaction abstraction. It owns the
//! per-controller descriptor memory, root port state, device enumeration and
//! the control/bulk transfer engine. Everything else (PCI access, DMA memory,
//! timers, interrupts, tasks, the disk layer) is reached through the
//! [`platform`] traits.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_op_in_unsafe_fn)]
#![allow(clippy::too_many_arguments)] // USB/hardware APIs often require many parameters

extern crate alloc;

pub mod config;
pub mod drivers;
pub mod logger;
pub mod platform;
pub mod time;

pub use config::HostConfig;
pub use drivers::usb::controller::{Result, UsbError};
pub use drivers::usb::UsbStack;
pub use platform::{DeviceManager, Platform};
