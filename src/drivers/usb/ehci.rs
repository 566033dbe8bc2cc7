//! EHCI (USB 2.0) Host Controller Interface backend
//!
//! Only high-speed devices are driven here. Full- and low-speed devices on a
//! root port are handed to the companion OHCI/UHCI controller by setting the
//! port owner bit.
//!
//! # Architecture
//!
//! Control and bulk transfers run on the asynchronous schedule: a circular
//! list of Queue Heads starting at a halted head QH in the scratch area.
//! A transfer is published by linking its own QH behind the head, with the
//! qTD chain on the QH's next-qTD pointer. The chain ends in an inactive
//! dummy qTD, which the controller treats as an empty queue.
//!
//! The periodic schedule is initialized to an all-terminate frame list and
//! never enabled.
//!
//! # References
//! - EHCI Specification 1.0
//! - U-Boot drivers/usb/host/ehci-hcd.c
//! - libpayload ehci.c

use alloc::sync::Arc;
use core::sync::atomic::{fence, Ordering};

use super::controller::{CompletionCode, Pid, Result, TransferKind, UsbError, UsbSpeed};
use super::host::InterruptAction;
use super::pool::{DescriptorPool, PoolLayout};
use super::port::PortStatus;
use super::transfer::{ElementStatus, Target, Transaction, Transfer};
use crate::config::HostConfig;
use crate::drivers::pci::PciAddress;
use crate::platform::{Platform, RegisterBlock};
use crate::time::wait_until;

// ============================================================================
// EHCI Register Definitions
// ============================================================================

/// Capability register offsets
#[allow(dead_code)]
pub(crate) mod cap {
    /// CAPLENGTH (bits 7:0) and HCIVERSION (bits 31:16)
    pub const CAPLENGTH: u32 = 0x00;
    pub const HCSPARAMS: u32 = 0x04;
    pub const HCCPARAMS: u32 = 0x08;

    /// HCSPARAMS: number of ports
    pub const HCS_N_PORTS_MASK: u32 = 0xF;
    /// HCSPARAMS: port power control
    pub const HCS_PPC: u32 = 1 << 4;
    /// HCCPARAMS: 64-bit addressing capability
    pub const HCC_64BIT: u32 = 1 << 0;
    /// HCCPARAMS: EHCI extended capabilities pointer (bits 15:8)
    pub const HCC_EECP_SHIFT: u32 = 8;
}

/// Operational register offsets, relative to CAPLENGTH
#[allow(dead_code)]
pub(crate) mod op {
    pub const USBCMD: u32 = 0x00;
    pub const USBSTS: u32 = 0x04;
    pub const USBINTR: u32 = 0x08;
    pub const FRINDEX: u32 = 0x0C;
    pub const CTRLDSSEGMENT: u32 = 0x10;
    pub const PERIODICLISTBASE: u32 = 0x14;
    pub const ASYNCLISTADDR: u32 = 0x18;
    pub const CONFIGFLAG: u32 = 0x40;
    pub const PORTSC: u32 = 0x44;
}

/// USB Command Register bits
#[allow(dead_code)]
pub(crate) mod usbcmd {
    /// Run/Stop
    pub const RS: u32 = 1 << 0;
    /// Host Controller Reset
    pub const HCRESET: u32 = 1 << 1;
    /// Periodic Schedule Enable
    pub const PSE: u32 = 1 << 4;
    /// Async Schedule Enable
    pub const ASE: u32 = 1 << 5;
    /// Interrupt on Async Advance Doorbell
    pub const IAAD: u32 = 1 << 6;
    /// Interrupt every 8 micro-frames
    pub const ITC_8: u32 = 0x08 << 16;
}

/// USB Status Register bits, also used for USBINTR
#[allow(dead_code)]
pub(crate) mod usbsts {
    /// USB Interrupt
    pub const USBINT: u32 = 1 << 0;
    /// USB Error Interrupt
    pub const USBERRINT: u32 = 1 << 1;
    /// Port Change Detect
    pub const PCD: u32 = 1 << 2;
    /// Frame List Rollover
    pub const FLR: u32 = 1 << 3;
    /// Host System Error
    pub const HSE: u32 = 1 << 4;
    /// Interrupt on Async Advance
    pub const IAA: u32 = 1 << 5;
    /// HC Halted
    pub const HCHALTED: u32 = 1 << 12;

    pub const EVENTS: u32 = USBINT | USBERRINT | PCD | FLR | HSE | IAA;
}

/// Port Status/Control Register bits
#[allow(dead_code)]
pub(crate) mod portsc {
    /// Current Connect Status
    pub const CCS: u32 = 1 << 0;
    /// Connect Status Change
    pub const CSC: u32 = 1 << 1;
    /// Port Enabled
    pub const PE: u32 = 1 << 2;
    /// Port Enable Change
    pub const PEC: u32 = 1 << 3;
    /// Over-current Change
    pub const OCC: u32 = 1 << 5;
    /// Port Reset
    pub const PR: u32 = 1 << 8;
    /// Line Status (bits 11:10)
    pub const LS_MASK: u32 = 3 << 10;
    /// Line Status: K-state, a low-speed device
    pub const LS_K: u32 = 1 << 10;
    /// Port Power
    pub const PP: u32 = 1 << 12;
    /// Port Owner (1 = companion controller)
    pub const PO: u32 = 1 << 13;

    /// Write-clear status bits
    pub const WC_BITS: u32 = CSC | PEC | OCC;
}

/// USBLEGSUP extended capability, in PCI configuration space
#[allow(dead_code)]
pub(crate) mod usblegsup {
    pub const CAP_ID: u32 = 0x01;
    /// HC BIOS Owned Semaphore
    pub const HC_BIOS_OWNED: u32 = 1 << 16;
    /// HC OS Owned Semaphore
    pub const HC_OS_OWNED: u32 = 1 << 24;
    /// USBLEGCTLSTS follows USBLEGSUP
    pub const CTLSTS_OFFSET: u8 = 4;
    /// SMI enables cleared, SMI status bits acknowledged
    pub const CTLSTS_DISABLE_SMI: u32 = 0xE000_0000;
}

// ============================================================================
// EHCI Data Structures
// ============================================================================

/// Link pointer bits of QHs and qTDs
pub(crate) mod link {
    pub const TERMINATE: u32 = 1 << 0;
    /// Typ = QH
    pub const TYPE_QH: u32 = 1 << 1;
}

/// Queue Head dwords (48 bytes used, 64-byte slots, 32-byte aligned)
#[allow(dead_code)]
pub(crate) mod qh {
    pub const HORIZONTAL: usize = 0;
    pub const CHARACTERISTICS: usize = 1;
    pub const CAPABILITIES: usize = 2;
    pub const CURRENT_QTD: usize = 3;
    /// Start of the transfer overlay
    pub const NEXT_QTD: usize = 4;
    pub const ALT_NEXT_QTD: usize = 5;
    pub const TOKEN: usize = 6;
    pub const BUFFER0: usize = 7;
    pub const OVERLAY_END: usize = 12;

    pub const CHAR_ENDPT_SHIFT: u32 = 8;
    pub const CHAR_EPS_SHIFT: u32 = 12;
    pub const EPS_FULL: u32 = 0;
    pub const EPS_LOW: u32 = 1;
    pub const EPS_HIGH: u32 = 2;
    /// Data toggle taken from the qTD
    pub const CHAR_DTC: u32 = 1 << 14;
    /// Head of reclamation list
    pub const CHAR_H: u32 = 1 << 15;
    pub const CHAR_MPS_SHIFT: u32 = 16;
    /// Control endpoint flag (full/low speed only)
    pub const CHAR_C: u32 = 1 << 27;
    /// High-bandwidth pipe multiplier of 1
    pub const CAP_MULT_1: u32 = 1 << 30;
}

/// Queue Element Transfer Descriptor dwords (32 bytes, 32-byte aligned)
#[allow(dead_code)]
pub(crate) mod qtd {
    pub const NEXT: usize = 0;
    pub const ALT_NEXT: usize = 1;
    pub const TOKEN: usize = 2;
    pub const BUFFER0: usize = 3;
    pub const BUFFERS: usize = 5;

    pub const STS_PING: u32 = 1 << 0;
    pub const STS_SPLIT: u32 = 1 << 1;
    pub const STS_MISSED_UFRAME: u32 = 1 << 2;
    pub const STS_XACT_ERR: u32 = 1 << 3;
    pub const STS_BABBLE: u32 = 1 << 4;
    pub const STS_DATA_BUFFER_ERR: u32 = 1 << 5;
    pub const STS_HALTED: u32 = 1 << 6;
    pub const STS_ACTIVE: u32 = 1 << 7;

    pub const PID_SHIFT: u32 = 8;
    pub const PID_OUT: u32 = 0;
    pub const PID_IN: u32 = 1;
    pub const PID_SETUP: u32 = 2;
    /// Error counter, 3 retries
    pub const CERR_3: u32 = 3 << 10;
    pub const IOC: u32 = 1 << 15;
    pub const BYTES_SHIFT: u32 = 16;
    pub const BYTES_MASK: u32 = 0x7FFF;
    pub const TOGGLE: u32 = 1 << 31;
}

/// Frame list entries of the (disabled) periodic schedule
const FRAME_LIST_LEN: usize = 1024;
/// Byte offset of the async head QH inside the scratch area
const ASYNC_HEAD: usize = FRAME_LIST_LEN * 4;
const QH_SIZE: usize = 64;

/// Extended capability entries walked before giving up
const MAX_EXT_CAPS: usize = 32;

// ============================================================================
// EHCI Controller
// ============================================================================

/// EHCI Host Controller
pub struct EhciController {
    regs: Arc<dyn RegisterBlock>,
    platform: Arc<dyn Platform>,
    config: HostConfig,
    pci: PciAddress,
    /// Offset of the operational registers (CAPLENGTH)
    op_base: u32,
    num_ports: u8,
}

impl EhciController {
    pub fn new(
        regs: Arc<dyn RegisterBlock>,
        platform: Arc<dyn Platform>,
        config: HostConfig,
        pci: PciAddress,
    ) -> Self {
        let op_base = regs.read32(cap::CAPLENGTH) & 0xFF;
        Self {
            regs,
            platform,
            config,
            pci,
            op_base,
            num_ports: 0,
        }
    }

    pub fn pool_layout() -> PoolLayout {
        PoolLayout {
            heads: 8,
            control_heads: 4,
            head_size: QH_SIZE,
            elements: 32,
            control_elements: 16,
            element_size: 32,
            buffer_size: 512,
            align: 32,
            scratch_size: ASYNC_HEAD + QH_SIZE,
            scratch_align: 4096,
        }
    }

    #[inline]
    fn read_op(&self, offset: u32) -> u32 {
        self.regs.read32(self.op_base + offset)
    }

    #[inline]
    fn write_op(&self, offset: u32, value: u32) {
        self.regs.write32(self.op_base + offset, value)
    }

    #[inline]
    fn portsc(port: u8) -> u32 {
        op::PORTSC + port as u32 * 4
    }

    /// Dword index of an async head QH field inside the scratch area
    #[inline]
    const fn head_dword(index: usize) -> usize {
        ASYNC_HEAD / 4 + index
    }

    pub fn init_hardware(&mut self, pool: &mut DescriptorPool) -> Result<u8> {
        self.op_base = self.regs.read32(cap::CAPLENGTH) & 0xFF;
        let version = self.regs.read32(cap::CAPLENGTH) >> 16;
        let hcsparams = self.regs.read32(cap::HCSPARAMS);
        let hccparams = self.regs.read32(cap::HCCPARAMS);
        log::info!(
            "EHCI version {:x}.{:02x}, {} ports",
            version >> 8,
            version & 0xFF,
            hcsparams & cap::HCS_N_PORTS_MASK
        );

        let eecp = ((hccparams >> cap::HCC_EECP_SHIFT) & 0xFF) as u8;
        self.take_ownership(eecp);

        // Stop, then reset
        let cmd = self.read_op(op::USBCMD);
        self.write_op(op::USBCMD, cmd & !usbcmd::RS);
        if wait_until(&*self.platform, 20, 1, || {
            self.read_op(op::USBSTS) & usbsts::HCHALTED != 0
        })
        .is_err()
        {
            log::warn!("EHCI: controller did not halt");
        }

        self.write_op(op::USBCMD, usbcmd::HCRESET);
        if wait_until(&*self.platform, 250, 1, || {
            self.read_op(op::USBCMD) & usbcmd::HCRESET == 0
        })
        .is_err()
        {
            log::error!("EHCI: controller did not leave reset");
            return Err(UsbError::Timeout);
        }

        if hccparams & cap::HCC_64BIT != 0 {
            self.write_op(op::CTRLDSSEGMENT, 0);
        }

        // Periodic frame list, all terminate
        for entry in 0..FRAME_LIST_LEN {
            pool.scratch_write(entry, link::TERMINATE);
        }
        self.write_op(op::PERIODICLISTBASE, pool.scratch_phys());

        // Async head: a halted QH pointing at itself
        let head = pool.scratch_phys() + ASYNC_HEAD as u32;
        pool.scratch_write(Self::head_dword(qh::HORIZONTAL), head | link::TYPE_QH);
        pool.scratch_write(
            Self::head_dword(qh::CHARACTERISTICS),
            qh::CHAR_H | (qh::EPS_HIGH << qh::CHAR_EPS_SHIFT),
        );
        pool.scratch_write(Self::head_dword(qh::CAPABILITIES), qh::CAP_MULT_1);
        pool.scratch_write(Self::head_dword(qh::CURRENT_QTD), 0);
        pool.scratch_write(Self::head_dword(qh::NEXT_QTD), link::TERMINATE);
        pool.scratch_write(Self::head_dword(qh::ALT_NEXT_QTD), link::TERMINATE);
        pool.scratch_write(Self::head_dword(qh::TOKEN), qtd::STS_HALTED);
        fence(Ordering::SeqCst);
        self.write_op(op::ASYNCLISTADDR, head);

        self.write_op(op::USBSTS, usbsts::EVENTS);
        self.write_op(
            op::USBINTR,
            usbsts::USBINT | usbsts::USBERRINT | usbsts::PCD | usbsts::HSE | usbsts::IAA,
        );
        self.write_op(op::USBCMD, usbcmd::RS | usbcmd::ASE | usbcmd::ITC_8);

        if wait_until(&*self.platform, 20, 1, || {
            self.read_op(op::USBSTS) & usbsts::HCHALTED == 0
        })
        .is_err()
        {
            log::error!("EHCI: controller did not start");
            return Err(UsbError::Timeout);
        }

        // Route every port to this controller
        self.write_op(op::CONFIGFLAG, 1);

        self.num_ports = ((hcsparams & cap::HCS_N_PORTS_MASK) as u8).min(15);
        if hcsparams & cap::HCS_PPC != 0 {
            for port in 0..self.num_ports {
                let status = self.read_op(Self::portsc(port));
                self.write_op(Self::portsc(port), (status & !portsc::WC_BITS) | portsc::PP);
            }
        }
        self.platform.sleep_ms(self.config.power_wait_floor_ms);

        log::info!("EHCI: {} ports, controller running", self.num_ports);
        Ok(self.num_ports)
    }

    /// BIOS handoff through the USBLEGSUP extended capability
    fn take_ownership(&self, eecp: u8) {
        let mut offset = eecp;
        for _ in 0..MAX_EXT_CAPS {
            if offset < 0x40 {
                return;
            }

            let legsup = self.platform.pci_read32(self.pci, offset);
            if legsup & 0xFF != usblegsup::CAP_ID {
                offset = ((legsup >> 8) & 0xFF) as u8;
                continue;
            }

            if legsup & usblegsup::HC_BIOS_OWNED != 0 {
                log::debug!("EHCI: requesting ownership from BIOS");
                self.platform
                    .pci_write32(self.pci, offset, legsup | usblegsup::HC_OS_OWNED);

                let released = wait_until(
                    &*self.platform,
                    self.config.bios_handoff_polls,
                    10,
                    || self.platform.pci_read32(self.pci, offset) & usblegsup::HC_BIOS_OWNED == 0,
                );
                if released.is_err() {
                    log::warn!("EHCI: BIOS did not release ownership, forcing");
                    let legsup = self.platform.pci_read32(self.pci, offset);
                    self.platform.pci_write32(
                        self.pci,
                        offset,
                        (legsup & !usblegsup::HC_BIOS_OWNED) | usblegsup::HC_OS_OWNED,
                    );
                }
            }

            self.platform.pci_write32(
                self.pci,
                offset + usblegsup::CTLSTS_OFFSET,
                usblegsup::CTLSTS_DISABLE_SMI,
            );
            return;
        }
    }

    /// A port released to the companion controller reads as disconnected
    pub fn port_status(&self, port: u8) -> PortStatus {
        let status = self.read_op(Self::portsc(port));
        let enabled = status & portsc::PE != 0;
        PortStatus {
            connected: status & portsc::CCS != 0 && status & portsc::PO == 0,
            enabled,
            speed: if enabled { UsbSpeed::High } else { UsbSpeed::Full },
            changed: status & portsc::CSC != 0,
        }
    }

    pub fn clear_port_change(&self, port: u8) {
        let reg = Self::portsc(port);
        let status = self.read_op(reg);
        self.write_op(reg, status | portsc::WC_BITS);
    }

    fn release_to_companion(&self, port: u8) {
        let reg = Self::portsc(port);
        let status = self.read_op(reg);
        self.write_op(reg, (status & !portsc::WC_BITS) | portsc::PO);
    }

    /// Reset a root port. Only a high-speed device comes out of reset with
    /// the port enabled; anything slower goes to the companion controller.
    pub fn reset_port(&self, port: u8) -> Result<Option<UsbSpeed>> {
        let reg = Self::portsc(port);
        let status = self.read_op(reg);

        if status & portsc::LS_MASK == portsc::LS_K {
            log::info!("EHCI: low-speed device on port {}, releasing to companion", port + 1);
            self.release_to_companion(port);
            return Ok(None);
        }

        self.write_op(reg, (status & !(portsc::PE | portsc::WC_BITS)) | portsc::PR);
        self.platform.sleep_ms(self.config.port_reset_hold_ms);
        let status = self.read_op(reg);
        self.write_op(reg, status & !(portsc::PR | portsc::WC_BITS));

        wait_until(
            &*self.platform,
            self.config.ehci_reset_polls,
            self.config.ehci_reset_interval_ms,
            || self.read_op(reg) & portsc::PR == 0,
        )?;

        if self.read_op(reg) & portsc::PE == 0 {
            log::info!("EHCI: full-speed device on port {}, releasing to companion", port + 1);
            self.release_to_companion(port);
            return Ok(None);
        }
        Ok(Some(UsbSpeed::High))
    }

    /// Ports can only be enabled through reset
    pub fn enable_port(&self, port: u8) {
        log::debug!("EHCI: port {} left to the next reset", port + 1);
    }

    pub fn max_transaction_len(&self, pool: &DescriptorPool, _max_packet: u16) -> usize {
        pool.buffer_size()
    }

    pub fn retry_budget(&self) -> u32 {
        1
    }

    pub fn settle_delay_ms(&self) -> u32 {
        0
    }

    // ------------------------------------------------------------------
    // Descriptor encoding
    // ------------------------------------------------------------------

    pub fn encode_element(&self, pool: &DescriptorPool, _target: &Target, tx: &Transaction<'_>) {
        let pid = match tx.pid {
            Pid::Setup => qtd::PID_SETUP,
            Pid::In => qtd::PID_IN,
            Pid::Out => qtd::PID_OUT,
        };
        let mut token = (pid << qtd::PID_SHIFT)
            | qtd::CERR_3
            | ((tx.remaining() as u32 & qtd::BYTES_MASK) << qtd::BYTES_SHIFT);
        if tx.start_toggle {
            token |= qtd::TOGGLE;
        }
        if !tx.dummy {
            token |= qtd::STS_ACTIVE | qtd::IOC;
        }

        pool.element_write(tx.slot, qtd::NEXT, link::TERMINATE);
        pool.element_write(tx.slot, qtd::ALT_NEXT, link::TERMINATE);
        pool.element_write(tx.slot, qtd::TOKEN, token);
        let start = tx.start();
        let page = start & !0xFFF;
        pool.element_write(tx.slot, qtd::BUFFER0, start);
        for i in 1..qtd::BUFFERS {
            pool.element_write(tx.slot, qtd::BUFFER0 + i, page + 0x1000 * i as u32);
        }
    }

    pub fn link(&self, pool: &DescriptorPool, prev: usize, next: usize) {
        pool.element_write(prev, qtd::NEXT, pool.element_phys(next));
    }

    /// Build the QH and put it on the async schedule.
    ///
    /// A short packet in an IN data stage makes the controller continue at
    /// the qTD behind the data stage, named by each IN qTD's alternate next.
    pub fn publish(&mut self, pool: &DescriptorPool, transfer: &Transfer<'_>) {
        let target = &transfer.target;
        let head = transfer.head;

        for (i, tx) in transfer.transactions.iter().enumerate().skip(transfer.resume_index()) {
            if tx.pid != Pid::In || tx.dummy {
                continue;
            }
            if let Some(after) = transfer.transactions.get(transfer.data_stage_end(i + 1)) {
                pool.element_write(tx.slot, qtd::ALT_NEXT, pool.element_phys(after.slot));
            }
        }

        let eps = match target.speed {
            UsbSpeed::High => qh::EPS_HIGH,
            UsbSpeed::Full => qh::EPS_FULL,
            UsbSpeed::Low => qh::EPS_LOW,
        };
        let mut characteristics = (target.address as u32 & 0x7F)
            | ((target.endpoint as u32 & 0xF) << qh::CHAR_ENDPT_SHIFT)
            | (eps << qh::CHAR_EPS_SHIFT)
            | qh::CHAR_DTC
            | ((target.max_packet as u32 & 0x7FF) << qh::CHAR_MPS_SHIFT);
        if target.kind == TransferKind::Control && target.speed != UsbSpeed::High {
            characteristics |= qh::CHAR_C;
        }

        let async_head = pool.scratch_phys() + ASYNC_HEAD as u32;
        pool.head_write(head, qh::HORIZONTAL, async_head | link::TYPE_QH);
        pool.head_write(head, qh::CHARACTERISTICS, characteristics);
        pool.head_write(head, qh::CAPABILITIES, qh::CAP_MULT_1);
        pool.head_write(head, qh::CURRENT_QTD, 0);
        for dword in qh::NEXT_QTD..qh::OVERLAY_END {
            pool.head_write(head, dword, 0);
        }
        pool.head_write(head, qh::NEXT_QTD, pool.element_phys(transfer.first_slot()));
        pool.head_write(head, qh::ALT_NEXT_QTD, link::TERMINATE);
        fence(Ordering::SeqCst);

        pool.scratch_write(
            Self::head_dword(qh::HORIZONTAL),
            pool.head_phys(head) | link::TYPE_QH,
        );

        let cmd = self.read_op(op::USBCMD);
        if cmd & usbcmd::ASE == 0 {
            self.write_op(op::USBCMD, cmd | usbcmd::ASE);
        }
    }

    pub fn element_status(&self, pool: &DescriptorPool, tx: &Transaction<'_>) -> ElementStatus {
        let token = pool.element_read(tx.slot, qtd::TOKEN);
        if token & qtd::STS_ACTIVE != 0 {
            return ElementStatus::Active;
        }

        let code = if token & qtd::STS_HALTED == 0 {
            CompletionCode::NoError
        } else if token & qtd::STS_BABBLE != 0 {
            CompletionCode::Babble
        } else if token & qtd::STS_DATA_BUFFER_ERR != 0 {
            if tx.pid == Pid::In {
                CompletionCode::BufferOverrun
            } else {
                CompletionCode::BufferUnderrun
            }
        } else if token & qtd::STS_XACT_ERR != 0 {
            CompletionCode::NotResponding
        } else {
            CompletionCode::Stall
        };

        let remaining = ((token >> qtd::BYTES_SHIFT) & qtd::BYTES_MASK) as usize;
        let actual = tx.len.saturating_sub(remaining);
        ElementStatus::Done { code, actual }
    }

    /// The controller already took the alternate next pointer
    pub fn end_data_stage(&self, _pool: &DescriptorPool, _transfer: &Transfer<'_>, next: usize) {
        log::trace!("EHCI: short packet, continuing at transaction {}", next);
    }

    pub fn unlink(&mut self, pool: &DescriptorPool, _transfer: &Transfer<'_>) {
        if self.quiesce(pool).is_err() {
            log::warn!("EHCI: no async advance after unlinking a transfer");
        }
    }

    /// Point the async head back at itself and ring the doorbell. Once the
    /// controller signals the async advance it holds no cached QH from the
    /// pool.
    pub fn quiesce(&mut self, pool: &DescriptorPool) -> Result<()> {
        let head = pool.scratch_phys() + ASYNC_HEAD as u32;
        pool.scratch_write(Self::head_dword(qh::HORIZONTAL), head | link::TYPE_QH);
        fence(Ordering::SeqCst);

        self.write_op(op::USBSTS, usbsts::IAA);
        let cmd = self.read_op(op::USBCMD);
        self.write_op(op::USBCMD, cmd | usbcmd::IAAD);

        let advanced = wait_until(&*self.platform, self.config.quiesce_polls, 1, || {
            self.read_op(op::USBSTS) & usbsts::IAA != 0
        });

        self.write_op(op::USBSTS, usbsts::IAA);
        let intr = self.read_op(op::USBINTR);
        self.write_op(op::USBINTR, intr | usbsts::IAA);
        advanced.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Interrupts
    // ------------------------------------------------------------------

    /// Read and acknowledge USBSTS.
    ///
    /// IAA is masked instead of acknowledged, [`Self::quiesce`] waits on it
    /// and clears it itself.
    pub fn latch_interrupt(regs: &dyn RegisterBlock) -> u32 {
        let op_base = regs.read32(cap::CAPLENGTH) & 0xFF;
        let status = regs.read32(op_base + op::USBSTS) & usbsts::EVENTS;
        if status == 0 {
            return 0;
        }
        if status & usbsts::IAA != 0 {
            let intr = regs.read32(op_base + op::USBINTR);
            regs.write32(op_base + op::USBINTR, intr & !usbsts::IAA);
        }
        let ack = status & !usbsts::IAA;
        if ack != 0 {
            regs.write32(op_base + op::USBSTS, ack);
        }
        status
    }

    pub fn dispatch_interrupt(&mut self, status: u32, _pool: &mut DescriptorPool) -> InterruptAction {
        let mut action = InterruptAction::default();

        if status & usbsts::USBINT != 0 {
            log::trace!("EHCI: transfer interrupt");
        }
        if status & usbsts::USBERRINT != 0 {
            log::debug!("EHCI: transaction error interrupt");
        }
        if status & usbsts::PCD != 0 {
            action.rescan = true;
        }
        if status & usbsts::FLR != 0 {
            log::trace!("EHCI: frame list rollover");
        }
        if status & usbsts::IAA != 0 {
            log::trace!("EHCI: async advance");
        }
        if status & usbsts::HSE != 0 {
            log::error!("EHCI: host system error");
            action.reinit = true;
        }

        action
    }
}
