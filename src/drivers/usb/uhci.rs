//! UHCI (USB 1.1) Host Controller Interface backend
//!
//! Registers live in I/O space. Every frame list entry points at one
//! skeleton QH; a transfer is published by hanging its own QH off the
//! skeleton's horizontal link, with the TD chain on the QH's element link.
//! The dummy TD is never activated, so the controller stops on it.
//!
//! # References
//! - UHCI Design Guide Revision 1.1
//! - libpayload uhci.c

use alloc::sync::Arc;

use super::controller::{CompletionCode, Pid, Result, UsbError, UsbSpeed};
use super::host::InterruptAction;
use super::pool::{DescriptorPool, PoolLayout};
use super::port::PortStatus;
use super::transfer::{ElementStatus, Target, Transaction, Transfer};
use crate::config::HostConfig;
use crate::drivers::pci::PciAddress;
use crate::platform::{Platform, RegisterBlock};
use crate::time::{spin_until, wait_until};

// ============================================================================
// UHCI Register Definitions (I/O port based)
// ============================================================================

/// UHCI I/O Registers
#[allow(dead_code)]
pub(crate) mod regs {
    /// USB Command
    pub const USBCMD: u32 = 0x00;
    /// USB Status
    pub const USBSTS: u32 = 0x02;
    /// USB Interrupt Enable
    pub const USBINTR: u32 = 0x04;
    /// Frame Number
    pub const FRNUM: u32 = 0x06;
    /// Frame List Base Address (32-bit)
    pub const FLBASEADD: u32 = 0x08;
    /// Start of Frame Modify
    pub const SOFMOD: u32 = 0x0C;
    /// Port 1 Status/Control, further ports follow every 2 bytes
    pub const PORTSC1: u32 = 0x10;
}

/// USB Command Register bits
#[allow(dead_code)]
pub(crate) mod usbcmd {
    /// Run/Stop
    pub const RS: u16 = 1 << 0;
    /// Host Controller Reset
    pub const HCRESET: u16 = 1 << 1;
    /// Global Reset
    pub const GRESET: u16 = 1 << 2;
    /// Enter Global Suspend Mode
    pub const EGSM: u16 = 1 << 3;
    /// Force Global Resume
    pub const FGR: u16 = 1 << 4;
    /// Configure Flag
    pub const CF: u16 = 1 << 6;
    /// Max Packet (1 = 64 bytes)
    pub const MAXP: u16 = 1 << 7;
}

/// USB Status Register bits
#[allow(dead_code)]
pub(crate) mod usbsts {
    /// USB Interrupt (IOC or short packet)
    pub const USBINT: u16 = 1 << 0;
    /// USB Error Interrupt
    pub const USBERRINT: u16 = 1 << 1;
    /// Resume Detect
    pub const RESDET: u16 = 1 << 2;
    /// Host System Error
    pub const HSERR: u16 = 1 << 3;
    /// Host Controller Process Error
    pub const HCPE: u16 = 1 << 4;
    /// Host Controller Halted
    pub const HCHALTED: u16 = 1 << 5;

    pub const EVENTS: u16 = USBINT | USBERRINT | RESDET | HSERR | HCPE;
}

/// USB Interrupt Enable bits
pub(crate) mod usbintr {
    pub const TIMEOUT_CRC: u16 = 1 << 0;
    pub const RESUME: u16 = 1 << 1;
    pub const IOC: u16 = 1 << 2;
    pub const SHORT_PACKET: u16 = 1 << 3;
}

/// Port Status/Control bits
#[allow(dead_code)]
pub(crate) mod portsc {
    /// Current Connect Status
    pub const CCS: u16 = 1 << 0;
    /// Connect Status Change
    pub const CSC: u16 = 1 << 1;
    /// Port Enabled
    pub const PE: u16 = 1 << 2;
    /// Port Enable Change
    pub const PEC: u16 = 1 << 3;
    /// Resume Detect
    pub const RD: u16 = 1 << 6;
    /// Reserved, always reads 1 on an implemented port
    pub const RESERVED: u16 = 1 << 7;
    /// Low Speed Device Attached
    pub const LSDA: u16 = 1 << 8;
    /// Port Reset
    pub const PR: u16 = 1 << 9;
    /// Suspend
    pub const SUSPEND: u16 = 1 << 12;
    /// Write-clear bits
    pub const WC_BITS: u16 = CSC | PEC;
}

/// PCI legacy support register
const PCI_LEGSUP: u8 = 0xC0;
/// Clear the SMI/trap status bits and route interrupts to PIRQ
const LEGSUP_DEFAULT: u16 = 0x8F00;

/// Frame list entries
const FRAME_LIST_LEN: usize = 1024;
/// Byte offset of the skeleton QH inside the scratch area
const SKELETON_QH: usize = FRAME_LIST_LEN * 4;

/// Implemented root ports are looked for up to this count
const MAX_PORTS: u8 = 8;

// ============================================================================
// UHCI Data Structures
// ============================================================================

/// Link pointer bits shared by frame list entries, QHs and TDs
pub(crate) mod link {
    pub const TERMINATE: u32 = 1 << 0;
    /// Points at a QH rather than a TD
    pub const QH: u32 = 1 << 1;
    /// Depth-first traversal
    pub const DEPTH_FIRST: u32 = 1 << 2;
}

/// Queue Head dwords (16 bytes, 16-byte aligned)
pub(crate) mod qh {
    pub const HEAD_LINK: usize = 0;
    pub const ELEMENT_LINK: usize = 1;
}

/// Transfer Descriptor dwords (32 bytes, 16-byte aligned)
pub(crate) mod td {
    pub const LINK: usize = 0;
    pub const CTRL_STS: usize = 1;
    pub const TOKEN: usize = 2;
    pub const BUFFER: usize = 3;

    pub const CS_ACTLEN_MASK: u32 = 0x7FF;
    pub const CS_BITSTUFF: u32 = 1 << 17;
    pub const CS_CRC_TIMEOUT: u32 = 1 << 18;
    pub const CS_BABBLE: u32 = 1 << 20;
    pub const CS_DBUF: u32 = 1 << 21;
    pub const CS_STALLED: u32 = 1 << 22;
    pub const CS_ACTIVE: u32 = 1 << 23;
    pub const CS_IOC: u32 = 1 << 24;
    pub const CS_LS: u32 = 1 << 26;
    /// Error counter, 3 retries
    pub const CS_C_ERR_3: u32 = 3 << 27;
    /// Short packet detect
    pub const CS_SPD: u32 = 1 << 29;

    pub const TOKEN_PID_SETUP: u32 = 0x2D;
    pub const TOKEN_PID_IN: u32 = 0x69;
    pub const TOKEN_PID_OUT: u32 = 0xE1;
    pub const TOKEN_ADDR_SHIFT: u32 = 8;
    pub const TOKEN_ENDP_SHIFT: u32 = 15;
    pub const TOKEN_D: u32 = 1 << 19;
    pub const TOKEN_MAXLEN_SHIFT: u32 = 21;

    /// Encoded length field: n - 1, 0x7FF for zero bytes
    pub const fn encode_len(len: usize) -> u32 {
        (len as u32).wrapping_sub(1) & 0x7FF
    }

    /// Decode a length field
    pub const fn decode_len(field: u32) -> usize {
        ((field + 1) & 0x7FF) as usize
    }
}

// ============================================================================
// UHCI Controller
// ============================================================================

/// UHCI Host Controller
pub struct UhciController {
    regs: Arc<dyn RegisterBlock>,
    platform: Arc<dyn Platform>,
    config: HostConfig,
    pci: PciAddress,
    num_ports: u8,
}

impl UhciController {
    pub fn new(
        regs: Arc<dyn RegisterBlock>,
        platform: Arc<dyn Platform>,
        config: HostConfig,
        pci: PciAddress,
    ) -> Self {
        Self {
            regs,
            platform,
            config,
            pci,
            num_ports: 0,
        }
    }

    /// One 64-byte buffer per TD; the frame list and skeleton QH share the
    /// page-aligned scratch area
    pub fn pool_layout() -> PoolLayout {
        PoolLayout {
            heads: 8,
            control_heads: 4,
            head_size: 16,
            elements: 64,
            control_elements: 32,
            element_size: 32,
            buffer_size: 64,
            align: 16,
            scratch_size: SKELETON_QH + 16,
            scratch_align: 4096,
        }
    }

    #[inline]
    fn read16(&self, offset: u32) -> u16 {
        self.regs.read16(offset)
    }

    #[inline]
    fn write16(&self, offset: u32, value: u16) {
        self.regs.write16(offset, value)
    }

    #[inline]
    fn port_reg(port: u8) -> u32 {
        regs::PORTSC1 + port as u32 * 2
    }

    pub fn init_hardware(&mut self, pool: &mut DescriptorPool) -> Result<u8> {
        // Take the controller away from legacy keyboard emulation
        let legsup = self.platform.pci_read16(self.pci, PCI_LEGSUP);
        log::debug!("UHCI: legacy support {:#06x}", legsup);
        self.platform.pci_write16(self.pci, PCI_LEGSUP, LEGSUP_DEFAULT);

        self.write16(regs::USBINTR, 0);
        self.write16(regs::USBCMD, usbcmd::GRESET);
        self.platform.sleep_ms(50);
        self.write16(regs::USBCMD, 0);
        self.platform.sleep_ms(10);

        self.write16(regs::USBCMD, usbcmd::HCRESET);
        if spin_until(&*self.platform, 100, 10, || {
            self.read16(regs::USBCMD) & usbcmd::HCRESET == 0
        })
        .is_err()
        {
            log::error!("UHCI: controller did not leave reset");
            return Err(UsbError::Timeout);
        }

        // Every frame visits the skeleton QH, which starts out empty
        let skeleton = pool.scratch_phys() + SKELETON_QH as u32;
        pool.scratch_write(SKELETON_QH / 4 + qh::HEAD_LINK, link::TERMINATE);
        pool.scratch_write(SKELETON_QH / 4 + qh::ELEMENT_LINK, link::TERMINATE);
        for entry in 0..FRAME_LIST_LEN {
            pool.scratch_write(entry, skeleton | link::QH);
        }

        self.regs.write32(regs::FLBASEADD, pool.scratch_phys());
        self.write16(regs::FRNUM, 0);
        self.write16(regs::USBSTS, 0xFFFF);
        self.write16(
            regs::USBINTR,
            usbintr::TIMEOUT_CRC | usbintr::RESUME | usbintr::IOC | usbintr::SHORT_PACKET,
        );
        self.write16(regs::USBCMD, usbcmd::RS | usbcmd::CF | usbcmd::MAXP);

        if wait_until(&*self.platform, 10, 1, || {
            self.read16(regs::USBSTS) & usbsts::HCHALTED == 0
        })
        .is_err()
        {
            log::error!("UHCI: controller did not start");
            return Err(UsbError::Timeout);
        }

        // Bit 7 reads back set only on implemented ports
        self.num_ports = (0..MAX_PORTS)
            .take_while(|&port| {
                let status = self.read16(Self::port_reg(port));
                status != 0xFFFF && status & portsc::RESERVED != 0
            })
            .count() as u8;

        log::info!("UHCI: {} ports, controller running", self.num_ports);
        Ok(self.num_ports)
    }

    pub fn port_status(&self, port: u8) -> PortStatus {
        let status = self.read16(Self::port_reg(port));
        PortStatus {
            connected: status & portsc::CCS != 0,
            enabled: status & portsc::PE != 0,
            speed: UsbSpeed::from_low_speed_bit(status & portsc::LSDA != 0),
            changed: status & portsc::CSC != 0,
        }
    }

    pub fn clear_port_change(&self, port: u8) {
        let reg = Self::port_reg(port);
        let status = self.read16(reg);
        self.write16(reg, (status & portsc::PE) | portsc::WC_BITS);
    }

    /// Hold PR for the reset time, release it and wait for the hardware to
    /// report reset done, then enable the port.
    pub fn reset_port(&self, port: u8) -> Result<Option<UsbSpeed>> {
        let reg = Self::port_reg(port);

        self.write16(reg, portsc::PR);
        self.platform.sleep_ms(self.config.port_reset_hold_ms);
        self.write16(reg, self.read16(reg) & !(portsc::PR | portsc::WC_BITS));

        wait_until(
            &*self.platform,
            self.config.uhci_reset_polls,
            self.config.uhci_reset_interval_ms,
            || self.read16(reg) & portsc::PR == 0,
        )?;

        self.platform.delay_us(10);
        self.write16(reg, portsc::PE | portsc::WC_BITS);
        let _ = spin_until(&*self.platform, 10, 100, || {
            self.read16(reg) & portsc::PE != 0
        });

        let status = self.port_status(port);
        if !status.connected || !status.enabled {
            log::warn!("UHCI: port {} not enabled after reset", port + 1);
            return Ok(None);
        }
        Ok(Some(status.speed))
    }

    pub fn enable_port(&self, port: u8) {
        self.write16(Self::port_reg(port), portsc::PE);
    }

    /// One packet per TD
    pub fn max_transaction_len(&self, pool: &DescriptorPool, max_packet: u16) -> usize {
        (max_packet as usize).clamp(8, pool.buffer_size())
    }

    pub fn retry_budget(&self) -> u32 {
        1
    }

    pub fn settle_delay_ms(&self) -> u32 {
        self.config.uhci_settle_ms
    }

    // ------------------------------------------------------------------
    // Descriptor encoding
    // ------------------------------------------------------------------

    pub fn encode_element(&self, pool: &DescriptorPool, target: &Target, tx: &Transaction<'_>) {
        let pid = match tx.pid {
            Pid::Setup => td::TOKEN_PID_SETUP,
            Pid::In => td::TOKEN_PID_IN,
            Pid::Out => td::TOKEN_PID_OUT,
        };
        let mut token = pid
            | ((target.address as u32 & 0x7F) << td::TOKEN_ADDR_SHIFT)
            | ((target.endpoint as u32 & 0xF) << td::TOKEN_ENDP_SHIFT)
            | (td::encode_len(tx.remaining()) << td::TOKEN_MAXLEN_SHIFT);
        if tx.start_toggle {
            token |= td::TOKEN_D;
        }

        let ctrl_sts = if tx.dummy {
            // inert terminator
            0
        } else {
            let mut cs = td::CS_ACTIVE | td::CS_C_ERR_3 | td::CS_IOC | td::encode_len(0);
            if target.speed == UsbSpeed::Low {
                cs |= td::CS_LS;
            }
            // a short IN keeps the queue on this TD until the engine moves it
            if tx.pid == Pid::In {
                cs |= td::CS_SPD;
            }
            cs
        };

        pool.element_write(tx.slot, td::LINK, link::TERMINATE);
        pool.element_write(tx.slot, td::CTRL_STS, ctrl_sts);
        pool.element_write(tx.slot, td::TOKEN, token);
        pool.element_write(tx.slot, td::BUFFER, tx.start());
    }

    pub fn link(&self, pool: &DescriptorPool, prev: usize, next: usize) {
        pool.element_write(prev, td::LINK, pool.element_phys(next) | link::DEPTH_FIRST);
    }

    pub fn publish(&mut self, pool: &DescriptorPool, transfer: &Transfer<'_>) {
        let head = transfer.head;
        pool.head_write(head, qh::HEAD_LINK, link::TERMINATE);
        pool.head_write(head, qh::ELEMENT_LINK, pool.element_phys(transfer.first_slot()));
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);

        pool.scratch_write(
            SKELETON_QH / 4 + qh::HEAD_LINK,
            pool.head_phys(head) | link::QH,
        );
    }

    pub fn element_status(&self, pool: &DescriptorPool, tx: &Transaction<'_>) -> ElementStatus {
        let cs = pool.element_read(tx.slot, td::CTRL_STS);
        if cs & td::CS_ACTIVE != 0 {
            return ElementStatus::Active;
        }

        let code = if cs & td::CS_STALLED != 0 {
            if cs & td::CS_BABBLE != 0 {
                CompletionCode::Babble
            } else if cs & td::CS_DBUF != 0 {
                if tx.pid == Pid::In {
                    CompletionCode::BufferOverrun
                } else {
                    CompletionCode::BufferUnderrun
                }
            } else if cs & td::CS_CRC_TIMEOUT != 0 {
                CompletionCode::NotResponding
            } else if cs & td::CS_BITSTUFF != 0 {
                CompletionCode::BitStuffing
            } else {
                CompletionCode::Stall
            }
        } else {
            CompletionCode::NoError
        };

        let actual = (tx.offset + td::decode_len(cs & td::CS_ACTLEN_MASK)).min(tx.len);
        ElementStatus::Done { code, actual }
    }

    /// Move the queue head stopped on a short packet to transaction `next`
    pub fn end_data_stage(&self, pool: &DescriptorPool, transfer: &Transfer<'_>, next: usize) {
        let Some(tx) = transfer.transactions.get(next) else {
            return;
        };
        pool.head_write(transfer.head, qh::ELEMENT_LINK, pool.element_phys(tx.slot));
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }

    pub fn unlink(&mut self, pool: &DescriptorPool, _transfer: &Transfer<'_>) {
        pool.scratch_write(SKELETON_QH / 4 + qh::HEAD_LINK, link::TERMINATE);
    }

    /// Unhook the transfer QH and wait for the next frame, after which the
    /// controller holds no pointer into the pool
    pub fn quiesce(&mut self, pool: &DescriptorPool) -> Result<()> {
        pool.scratch_write(SKELETON_QH / 4 + qh::HEAD_LINK, link::TERMINATE);

        let frame = self.read16(regs::FRNUM) & 0x7FF;
        wait_until(&*self.platform, self.config.quiesce_polls, 1, || {
            self.read16(regs::FRNUM) & 0x7FF != frame
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Interrupts
    // ------------------------------------------------------------------

    pub fn latch_interrupt(regs: &dyn RegisterBlock) -> u32 {
        let status = regs.read16(regs::USBSTS) & usbsts::EVENTS;
        if status == 0 {
            return 0;
        }
        regs.write16(regs::USBSTS, status);
        status as u32
    }

    pub fn dispatch_interrupt(&mut self, status: u32, _pool: &mut DescriptorPool) -> InterruptAction {
        let status = status as u16;
        let mut action = InterruptAction::default();

        if status & usbsts::USBINT != 0 {
            log::trace!("UHCI: transfer interrupt");
        }
        if status & usbsts::USBERRINT != 0 {
            log::debug!("UHCI: transaction error interrupt");
        }
        if status & usbsts::RESDET != 0 {
            log::info!("UHCI: resume detected");
            action.rescan = true;
        }
        if status & usbsts::HSERR != 0 {
            log::error!("UHCI: host system error");
            action.reinit = true;
        }
        if status & usbsts::HCPE != 0 {
            log::error!("UHCI: host controller process error");
            action.reinit = true;
        }

        action
    }
}
