//! OHCI (USB 1.1) Host Controller Interface backend
//!
//! Encodes transfers as one Endpoint Descriptor per transfer with a chain of
//! General Transfer Descriptors behind it. The ED's TailP always points at
//! the zero-length dummy TD the engine appends, so HeadP == TailP means the
//! queue has drained.
//!
//! # References
//! - OHCI Specification 1.0a
//! - libpayload ohci.c

use alloc::sync::Arc;

use super::controller::{CompletionCode, Pid, Result, TransferKind, UsbError, UsbSpeed};
use super::host::InterruptAction;
use super::pool::{DescriptorPool, PoolLayout};
use super::port::PortStatus;
use super::transfer::{ElementStatus, Target, Transaction, Transfer};
use crate::config::HostConfig;
use crate::platform::{Platform, RegisterBlock};
use crate::time::{spin_until, wait_until};

// ============================================================================
// OHCI Register Definitions
// ============================================================================

/// OHCI Operational Registers
#[allow(dead_code)]
pub(crate) mod regs {
    pub const HCREVISION: u32 = 0x00;
    pub const HCCONTROL: u32 = 0x04;
    pub const HCCOMMANDSTATUS: u32 = 0x08;
    pub const HCINTERRUPTSTATUS: u32 = 0x0C;
    pub const HCINTERRUPTENABLE: u32 = 0x10;
    pub const HCINTERRUPTDISABLE: u32 = 0x14;
    pub const HCHCCA: u32 = 0x18;
    pub const HCPERIODCURRENTED: u32 = 0x1C;
    pub const HCCONTROLHEADED: u32 = 0x20;
    pub const HCCONTROLCURRENTED: u32 = 0x24;
    pub const HCBULKHEADED: u32 = 0x28;
    pub const HCBULKCURRENTED: u32 = 0x2C;
    pub const HCDONEHEAD: u32 = 0x30;
    pub const HCFMINTERVAL: u32 = 0x34;
    pub const HCFMREMAINING: u32 = 0x38;
    pub const HCFMNUMBER: u32 = 0x3C;
    pub const HCPERIODICSTART: u32 = 0x40;
    pub const HCLSTHRESHOLD: u32 = 0x44;
    pub const HCRHDESCRIPTORA: u32 = 0x48;
    pub const HCRHDESCRIPTORB: u32 = 0x4C;
    pub const HCRHSTATUS: u32 = 0x50;
    /// Root Hub Port Status (base, 4 bytes per port)
    pub const HCRHPORTSTATUS: u32 = 0x54;
}

/// HcControl register bits
#[allow(dead_code)]
pub(crate) mod hccontrol {
    /// Control/Bulk Service Ratio (3 = 4:1)
    pub const CBSR_4_1: u32 = 3 << 0;
    pub const PLE: u32 = 1 << 2;
    pub const IE: u32 = 1 << 3;
    /// Control List Enable
    pub const CLE: u32 = 1 << 4;
    /// Bulk List Enable
    pub const BLE: u32 = 1 << 5;
    /// Host Controller Functional State
    pub const HCFS_MASK: u32 = 3 << 6;
    pub const HCFS_RESET: u32 = 0 << 6;
    pub const HCFS_RESUME: u32 = 1 << 6;
    pub const HCFS_OPERATIONAL: u32 = 2 << 6;
    pub const HCFS_SUSPEND: u32 = 3 << 6;
    /// Interrupt Routing (set while SMM owns the controller)
    pub const IR: u32 = 1 << 8;
    pub const RWC: u32 = 1 << 9;
}

/// HcCommandStatus register bits
pub(crate) mod hccommandstatus {
    /// Host Controller Reset
    pub const HCR: u32 = 1 << 0;
    /// Control List Filled
    pub const CLF: u32 = 1 << 1;
    /// Bulk List Filled
    pub const BLF: u32 = 1 << 2;
    /// Ownership Change Request
    pub const OCR: u32 = 1 << 3;
}

/// HcInterruptStatus / Enable / Disable bits
#[allow(dead_code)]
pub(crate) mod intr {
    /// Scheduling Overrun
    pub const SO: u32 = 1 << 0;
    /// Writeback Done Head
    pub const WDH: u32 = 1 << 1;
    /// Start of Frame
    pub const SF: u32 = 1 << 2;
    /// Resume Detected
    pub const RD: u32 = 1 << 3;
    /// Unrecoverable Error
    pub const UE: u32 = 1 << 4;
    /// Frame Number Overflow
    pub const FNO: u32 = 1 << 5;
    /// Root Hub Status Change
    pub const RHSC: u32 = 1 << 6;
    /// Ownership Change
    pub const OC: u32 = 1 << 30;
    /// Master Interrupt Enable
    pub const MIE: u32 = 1 << 31;

    pub const ALL: u32 = SO | WDH | SF | RD | UE | FNO | RHSC | OC;
}

/// HcRhStatus bits
pub(crate) mod rhstatus {
    /// Set Global Power (write), Local Power Status Change (read)
    pub const LPSC: u32 = 1 << 16;
}

/// Root Hub Port Status bits
#[allow(dead_code)]
pub(crate) mod rhportstatus {
    /// Current Connect Status (read) / Clear Port Enable (write)
    pub const CCS: u32 = 1 << 0;
    /// Port Enable Status (read) / Set Port Enable (write)
    pub const PES: u32 = 1 << 1;
    pub const PSS: u32 = 1 << 2;
    pub const POCI: u32 = 1 << 3;
    /// Port Reset Status (read) / Set Port Reset (write)
    pub const PRS: u32 = 1 << 4;
    /// Port Power Status
    pub const PPS: u32 = 1 << 8;
    /// Low Speed Device Attached
    pub const LSDA: u32 = 1 << 9;
    pub const CSC: u32 = 1 << 16;
    pub const PESC: u32 = 1 << 17;
    pub const PSSC: u32 = 1 << 18;
    pub const OCIC: u32 = 1 << 19;
    pub const PRSC: u32 = 1 << 20;
    /// Write-one-to-clear change bits
    pub const CLEAR_MASK: u32 = CSC | PESC | PSSC | OCIC | PRSC;
}

// ============================================================================
// OHCI Data Structures
// ============================================================================

/// Host Controller Communication Area: byte offset of HccaDoneHead
pub(crate) const HCCA_DONE_HEAD: usize = 0x84;
/// Size and alignment of the HCCA
pub(crate) const HCCA_SIZE: usize = 256;

/// Endpoint Descriptor dwords (16 bytes, 16-byte aligned)
pub(crate) mod ed {
    pub const CONTROL: usize = 0;
    pub const TAIL_TD: usize = 1;
    pub const HEAD_TD: usize = 2;
    pub const NEXT_ED: usize = 3;

    /// Function address
    pub const CTRL_FA_MASK: u32 = 0x7F;
    pub const CTRL_EN_SHIFT: u32 = 7;
    pub const CTRL_EN_MASK: u32 = 0xF << 7;
    /// Speed (1 = low speed)
    pub const CTRL_S: u32 = 1 << 13;
    /// Skip
    pub const CTRL_K: u32 = 1 << 14;
    pub const CTRL_MPS_SHIFT: u32 = 16;
    pub const CTRL_MPS_MASK: u32 = 0x7FF << 16;

    pub const HEAD_HALTED: u32 = 1 << 0;
    pub const HEAD_TOGGLE_CARRY: u32 = 1 << 1;
}

/// General Transfer Descriptor dwords (16 bytes, 16-byte aligned)
pub(crate) mod td {
    pub const CONTROL: usize = 0;
    pub const CBP: usize = 1;
    pub const NEXT_TD: usize = 2;
    pub const BE: usize = 3;

    pub const CTRL_DP_SETUP: u32 = 0 << 19;
    pub const CTRL_DP_OUT: u32 = 1 << 19;
    pub const CTRL_DP_IN: u32 = 2 << 19;
    /// Delay Interrupt: no interrupt
    pub const CTRL_DI_NONE: u32 = 7 << 21;
    /// Data Toggle taken from the TD (MSB set)
    pub const CTRL_T_DATA0: u32 = 2 << 24;
    pub const CTRL_T_DATA1: u32 = 3 << 24;
    pub const CTRL_CC_SHIFT: u32 = 28;
    pub const CTRL_CC_NOT_ACCESSED: u32 = 0xF << 28;
}

// ============================================================================
// OHCI Controller
// ============================================================================

/// Root ports handled per controller
const MAX_PORTS: u8 = 15;

/// OHCI Host Controller
pub struct OhciController {
    regs: Arc<dyn RegisterBlock>,
    platform: Arc<dyn Platform>,
    config: HostConfig,
    num_ports: u8,
}

impl OhciController {
    pub fn new(regs: Arc<dyn RegisterBlock>, platform: Arc<dyn Platform>, config: HostConfig) -> Self {
        Self {
            regs,
            platform,
            config,
            num_ports: 0,
        }
    }

    /// 8 EDs and 32 TDs with 512-byte buffers, split evenly between control
    /// and bulk, plus the HCCA
    pub fn pool_layout() -> PoolLayout {
        PoolLayout {
            heads: 8,
            control_heads: 4,
            head_size: 16,
            elements: 32,
            control_elements: 16,
            element_size: 16,
            buffer_size: 512,
            align: 16,
            scratch_size: HCCA_SIZE,
            scratch_align: HCCA_SIZE,
        }
    }

    #[inline]
    fn read_reg(&self, offset: u32) -> u32 {
        self.regs.read32(offset)
    }

    #[inline]
    fn write_reg(&self, offset: u32, value: u32) {
        self.regs.write32(offset, value)
    }

    fn read_port_reg(&self, port: u8) -> u32 {
        self.read_reg(regs::HCRHPORTSTATUS + port as u32 * 4)
    }

    fn write_port_reg(&self, port: u8, value: u32) {
        self.write_reg(regs::HCRHPORTSTATUS + port as u32 * 4, value)
    }

    /// Take the controller from SMM or a BIOS driver, reset it and bring it
    /// to the OPERATIONAL state. Returns the number of root ports.
    pub fn init_hardware(&mut self, pool: &mut DescriptorPool) -> Result<u8> {
        let revision = self.read_reg(regs::HCREVISION) & 0xFF;
        if revision != 0x10 && revision != 0x11 {
            log::warn!("OHCI: unexpected revision {:#04x}", revision);
        } else {
            log::info!("OHCI version: {}.{}", revision >> 4, revision & 0xF);
        }

        self.take_ownership();

        // Reset, keeping the frame interval the firmware programmed
        let fm_interval = self.read_reg(regs::HCFMINTERVAL);
        self.write_reg(regs::HCCOMMANDSTATUS, hccommandstatus::HCR);
        if spin_until(&*self.platform, 10, 1, || {
            self.read_reg(regs::HCCOMMANDSTATUS) & hccommandstatus::HCR == 0
        })
        .is_err()
        {
            log::error!("OHCI: controller did not leave reset");
            return Err(UsbError::Timeout);
        }

        let frame_interval = fm_interval & 0x3FFF;
        let frame_interval = if frame_interval == 0 { 0x2EDF } else { frame_interval };
        let fs_largest_packet = ((frame_interval - 210) * 6) / 7;
        let toggled_frt = !fm_interval & (1 << 31);
        self.write_reg(
            regs::HCFMINTERVAL,
            toggled_frt | (fs_largest_packet << 16) | frame_interval,
        );

        // Reset leaves the controller in SUSPEND
        if self.read_reg(regs::HCCONTROL) & hccontrol::HCFS_MASK == hccontrol::HCFS_SUSPEND {
            self.write_reg(regs::HCCONTROL, hccontrol::HCFS_RESUME);
            self.platform.sleep_ms(10);
        }

        // HCCA and empty control/bulk lists
        for dword in 0..HCCA_SIZE / 4 {
            pool.scratch_write(dword, 0);
        }
        self.write_reg(regs::HCHCCA, pool.scratch_phys());
        self.write_reg(regs::HCCONTROLHEADED, 0);
        self.write_reg(regs::HCCONTROLCURRENTED, 0);
        self.write_reg(regs::HCBULKHEADED, 0);
        self.write_reg(regs::HCBULKCURRENTED, 0);

        self.write_reg(regs::HCINTERRUPTDISABLE, intr::ALL | intr::MIE);
        self.write_reg(regs::HCINTERRUPTSTATUS, intr::ALL);
        self.write_reg(
            regs::HCINTERRUPTENABLE,
            intr::SO | intr::WDH | intr::RD | intr::UE | intr::FNO | intr::RHSC | intr::OC | intr::MIE,
        );

        self.write_reg(regs::HCPERIODICSTART, (frame_interval * 9) / 10);
        self.write_reg(regs::HCLSTHRESHOLD, 0);

        self.write_reg(
            regs::HCCONTROL,
            hccontrol::CBSR_4_1 | hccontrol::HCFS_OPERATIONAL,
        );

        // Power all ports and wait power-on-to-power-good
        self.write_reg(regs::HCRHSTATUS, rhstatus::LPSC);
        let rh_a = self.read_reg(regs::HCRHDESCRIPTORA);
        let potpgt = (rh_a >> 24) * 2;
        self.platform
            .sleep_ms(potpgt.max(self.config.power_wait_floor_ms));

        self.num_ports = ((rh_a & 0xFF) as u8).min(MAX_PORTS);
        log::info!("OHCI: {} ports, controller operational", self.num_ports);
        Ok(self.num_ports)
    }

    /// SMM handoff or BIOS driver takeover
    fn take_ownership(&self) {
        let control = self.read_reg(regs::HCCONTROL);

        if control & hccontrol::IR != 0 {
            log::debug!("OHCI: SMM owns the controller, requesting ownership change");
            self.write_reg(regs::HCCOMMANDSTATUS, hccommandstatus::OCR);
            let released = wait_until(&*self.platform, self.config.smm_handoff_polls, 1, || {
                self.read_reg(regs::HCCONTROL) & hccontrol::IR == 0
            });
            if released.is_err() {
                log::warn!("OHCI: SMM did not release the controller, clearing IR by force");
                let control = self.read_reg(regs::HCCONTROL);
                self.write_reg(regs::HCCONTROL, control & !hccontrol::IR);
                self.platform.sleep_ms(200);
                if self.read_reg(regs::HCCONTROL) & hccontrol::IR != 0 {
                    log::error!("OHCI: forced ownership change failed");
                }
            }
        } else if control & hccontrol::HCFS_MASK != hccontrol::HCFS_RESET {
            log::debug!("OHCI: BIOS driver active");
            if control & hccontrol::HCFS_MASK != hccontrol::HCFS_OPERATIONAL {
                self.write_reg(regs::HCCONTROL, hccontrol::HCFS_RESUME);
                self.platform.sleep_ms(10);
            }
        }
    }

    pub fn port_status(&self, port: u8) -> PortStatus {
        let status = self.read_port_reg(port);
        PortStatus {
            connected: status & rhportstatus::CCS != 0,
            enabled: status & rhportstatus::PES != 0,
            speed: UsbSpeed::from_low_speed_bit(status & rhportstatus::LSDA != 0),
            changed: status & rhportstatus::CSC != 0,
        }
    }

    pub fn clear_port_change(&self, port: u8) {
        self.write_port_reg(port, rhportstatus::CLEAR_MASK);
    }

    /// Assert reset and poll until the hardware clears PRS.
    ///
    /// Returns the speed of the now enabled port, `None` if the port came
    /// out of reset disabled.
    pub fn reset_port(&self, port: u8) -> Result<Option<UsbSpeed>> {
        self.write_port_reg(port, rhportstatus::PRS);

        wait_until(
            &*self.platform,
            self.config.ohci_reset_polls,
            self.config.ohci_reset_interval_ms,
            || self.read_port_reg(port) & rhportstatus::PRS == 0,
        )?;

        self.write_port_reg(port, rhportstatus::PRSC);

        let status = self.port_status(port);
        if !status.enabled {
            log::warn!("OHCI: port {} not enabled after reset", port + 1);
            return Ok(None);
        }
        Ok(Some(status.speed))
    }

    /// Best-effort "set port enable"
    pub fn enable_port(&self, port: u8) {
        self.write_port_reg(port, rhportstatus::PES);
    }

    pub fn max_transaction_len(&self, pool: &DescriptorPool, _max_packet: u16) -> usize {
        pool.buffer_size()
    }

    pub fn retry_budget(&self) -> u32 {
        self.config.ohci_retries
    }

    pub fn settle_delay_ms(&self) -> u32 {
        0
    }

    // ------------------------------------------------------------------
    // Descriptor encoding
    // ------------------------------------------------------------------

    /// Write a general TD for `tx`, terminated (NextTD = 0).
    ///
    /// Buffer rounding stays off: a short packet halts the ED with
    /// DATAUNDERRUN instead of running the next IN TD of a data stage the
    /// device has already finished.
    pub fn encode_element(&self, pool: &DescriptorPool, _target: &Target, tx: &Transaction<'_>) {
        let dp = match tx.pid {
            Pid::Setup => td::CTRL_DP_SETUP,
            Pid::Out => td::CTRL_DP_OUT,
            Pid::In => td::CTRL_DP_IN,
        };
        let toggle = if tx.start_toggle {
            td::CTRL_T_DATA1
        } else {
            td::CTRL_T_DATA0
        };
        let control = dp | td::CTRL_DI_NONE | toggle | td::CTRL_CC_NOT_ACCESSED;

        let (cbp, be) = if tx.remaining() > 0 {
            (tx.start(), tx.buffer + tx.len as u32 - 1)
        } else {
            (0, 0)
        };

        pool.element_write(tx.slot, td::CONTROL, control);
        pool.element_write(tx.slot, td::CBP, cbp);
        pool.element_write(tx.slot, td::NEXT_TD, 0);
        pool.element_write(tx.slot, td::BE, be);
    }

    /// Chain `next` behind `prev`
    pub fn link(&self, pool: &DescriptorPool, prev: usize, next: usize) {
        pool.element_write(prev, td::NEXT_TD, pool.element_phys(next));
    }

    /// Build the ED, hand it to the controller and set the list-filled bit
    pub fn publish(&mut self, pool: &DescriptorPool, transfer: &Transfer<'_>) {
        let target = &transfer.target;
        let first = transfer.first_slot();
        let tail = transfer.tail_slot();
        let head = transfer.head;

        if pool.head_read(head, ed::HEAD_TD) & ed::HEAD_HALTED != 0 {
            log::debug!("OHCI: clearing halted bit of ED {}", head);
        }

        let mut control = (target.address as u32) & ed::CTRL_FA_MASK;
        control |= ((target.endpoint as u32) << ed::CTRL_EN_SHIFT) & ed::CTRL_EN_MASK;
        control |= ((target.max_packet as u32) << ed::CTRL_MPS_SHIFT) & ed::CTRL_MPS_MASK;
        if target.speed == UsbSpeed::Low {
            control |= ed::CTRL_S;
        }

        pool.head_write(head, ed::CONTROL, control);
        pool.head_write(head, ed::TAIL_TD, pool.element_phys(tail));
        pool.head_write(head, ed::HEAD_TD, pool.element_phys(first));
        pool.head_write(head, ed::NEXT_ED, 0);
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);

        let ed_phys = pool.head_phys(head);
        let (head_reg, current_reg, enable, filled) = match target.kind {
            TransferKind::Control => (
                regs::HCCONTROLHEADED,
                regs::HCCONTROLCURRENTED,
                hccontrol::CLE,
                hccommandstatus::CLF,
            ),
            TransferKind::Bulk => (
                regs::HCBULKHEADED,
                regs::HCBULKCURRENTED,
                hccontrol::BLE,
                hccommandstatus::BLF,
            ),
        };

        self.write_reg(head_reg, ed_phys);
        self.write_reg(current_reg, ed_phys);
        let control = self.read_reg(regs::HCCONTROL);
        self.write_reg(regs::HCCONTROL, control | enable);
        self.write_reg(regs::HCCOMMANDSTATUS, filled);
    }

    pub fn element_status(&self, pool: &DescriptorPool, tx: &Transaction<'_>) -> ElementStatus {
        let control = pool.element_read(tx.slot, td::CONTROL);
        let mut code = CompletionCode::from_ohci(control >> td::CTRL_CC_SHIFT);
        if code == CompletionCode::NotAccessed {
            return ElementStatus::Active;
        }

        let cbp = pool.element_read(tx.slot, td::CBP);
        let actual = if cbp == 0 {
            tx.len
        } else {
            (cbp.saturating_sub(tx.buffer) as usize).min(tx.len)
        };
        // Short packet; the engine restarts the halted ED
        if code == CompletionCode::DataUnderrun && tx.pid == Pid::In {
            code = CompletionCode::NoError;
        }
        ElementStatus::Done { code, actual }
    }

    /// Point the ED halted by a short packet at transaction `next` and let
    /// the controller run it
    pub fn end_data_stage(&self, pool: &DescriptorPool, transfer: &Transfer<'_>, next: usize) {
        let Some(tx) = transfer.transactions.get(next) else {
            return;
        };
        let head = transfer.head;
        let carry = pool.head_read(head, ed::HEAD_TD) & ed::HEAD_TOGGLE_CARRY;
        pool.head_write(head, ed::HEAD_TD, pool.element_phys(tx.slot) | carry);
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);

        let filled = match transfer.target.kind {
            TransferKind::Control => hccommandstatus::CLF,
            TransferKind::Bulk => hccommandstatus::BLF,
        };
        self.write_reg(regs::HCCOMMANDSTATUS, filled);
    }

    /// Take a drained ED off its list
    pub fn unlink(&mut self, pool: &DescriptorPool, transfer: &Transfer<'_>) {
        let control = pool.head_read(transfer.head, ed::CONTROL);
        pool.head_write(transfer.head, ed::CONTROL, control | ed::CTRL_K);

        let (enable, head_reg, current_reg) = match transfer.target.kind {
            TransferKind::Control => (
                hccontrol::CLE,
                regs::HCCONTROLHEADED,
                regs::HCCONTROLCURRENTED,
            ),
            TransferKind::Bulk => (hccontrol::BLE, regs::HCBULKHEADED, regs::HCBULKCURRENTED),
        };
        let control = self.read_reg(regs::HCCONTROL);
        self.write_reg(regs::HCCONTROL, control & !enable);
        self.write_reg(head_reg, 0);
        self.write_reg(current_reg, 0);
    }

    /// Stop both lists and wait for a frame boundary, after which the
    /// controller no longer holds a pointer into the pool
    pub fn quiesce(&mut self, _pool: &DescriptorPool) -> Result<()> {
        let control = self.read_reg(regs::HCCONTROL);
        self.write_reg(regs::HCCONTROL, control & !(hccontrol::CLE | hccontrol::BLE));

        let frame = self.read_reg(regs::HCFMNUMBER) & 0xFFFF;
        wait_until(&*self.platform, self.config.quiesce_polls, 1, || {
            self.read_reg(regs::HCFMNUMBER) & 0xFFFF != frame
        })?;

        for reg in [
            regs::HCCONTROLHEADED,
            regs::HCCONTROLCURRENTED,
            regs::HCBULKHEADED,
            regs::HCBULKCURRENTED,
        ] {
            self.write_reg(reg, 0);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Interrupts
    // ------------------------------------------------------------------

    /// Read and acknowledge HcInterruptStatus.
    ///
    /// WDH is masked instead of acknowledged: the done head in the HCCA is
    /// only valid until WDH is cleared, so it is collected and cleared by
    /// [`Self::dispatch_interrupt`] under the controller lock.
    pub fn latch_interrupt(regs: &dyn RegisterBlock) -> u32 {
        let status = regs.read32(regs::HCINTERRUPTSTATUS) & intr::ALL;
        if status == 0 {
            return 0;
        }
        if status & intr::WDH != 0 {
            regs.write32(regs::HCINTERRUPTDISABLE, intr::WDH);
        }
        let ack = status & !intr::WDH;
        if ack != 0 {
            regs.write32(regs::HCINTERRUPTSTATUS, ack);
        }
        status
    }

    pub fn dispatch_interrupt(&mut self, status: u32, pool: &mut DescriptorPool) -> InterruptAction {
        let mut action = InterruptAction::default();

        // Completion is read from the TDs themselves, the done queue is
        // only handed back to the controller
        if status & intr::WDH != 0 {
            let done = pool.scratch_read(HCCA_DONE_HEAD / 4) & !0xF;
            match pool.element_at_phys(done) {
                Some(slot) => log::trace!("OHCI: done queue starts at TD {}", slot),
                None if done != 0 => log::warn!("OHCI: done head {:#x} is not a pool TD", done),
                None => {}
            }

            pool.scratch_write(HCCA_DONE_HEAD / 4, 0);
            self.write_reg(regs::HCINTERRUPTSTATUS, intr::WDH);
            self.write_reg(regs::HCINTERRUPTENABLE, intr::WDH);
        }

        if status & intr::SO != 0 {
            log::warn!("OHCI: scheduling overrun");
        }
        if status & intr::RD != 0 {
            log::info!("OHCI: resume detected");
        }
        if status & intr::UE != 0 {
            log::error!("OHCI: unrecoverable HC error");
            action.reinit = true;
        }
        if status & intr::FNO != 0 {
            log::trace!("OHCI: frame number overflow");
        }
        if status & intr::RHSC != 0 {
            action.rescan = true;
        }
        if status & intr::OC != 0 {
            log::info!("OHCI: ownership change");
        }

        action
    }
}
