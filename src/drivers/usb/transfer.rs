//! Transfer/transaction engine
//!
//! A [`Transfer`] is one logical USB request. It is built as a chain of
//! [`Transaction`]s in descriptor pool slots, terminated by a zero-length
//! dummy, handed to the hardware and then polled until every non-dummy
//! transaction has retired or failed.
//!
//! The engine owns everything that is the same for all three controller
//! families: slot allocation, data toggles, the retry loop and copying IN
//! data back to the caller. The backend only encodes and decodes its own
//! descriptor format.

use alloc::vec::Vec;

use super::controller::{
    CompletionCode, Direction, EndpointInfo, Pid, Result, SetupPacket, TransferKind, UsbError,
    UsbSpeed,
};
use super::host::HostController;
use super::port::Device;
use crate::time::wait_until;

/// Endpoint a transfer is addressed to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Target {
    pub kind: TransferKind,
    pub address: u8,
    pub endpoint: u8,
    pub max_packet: u16,
    pub speed: UsbSpeed,
}

/// One SETUP/IN/OUT phase of a transfer
#[derive(Debug)]
pub struct Transaction<'a> {
    pub pid: Pid,
    /// Data toggle of the first packet
    pub toggle: bool,
    /// Bytes to move
    pub len: usize,
    /// Element slot holding the hardware descriptor
    pub slot: usize,
    /// Physical address of the slot's DMA buffer
    pub buffer: u32,
    /// Where IN data is copied once the transfer succeeded
    pub dest: Option<&'a mut [u8]>,
    /// Chain terminator, never executed
    pub dummy: bool,
    /// Bytes actually moved
    pub actual: usize,
    /// Completed without error
    pub retired: bool,
    /// Never executed, the data stage ended on an earlier short packet
    pub skipped: bool,
    /// Bytes the device acknowledged before this submission
    pub offset: usize,
    /// Toggle of the packet at `offset`
    pub start_toggle: bool,
}

impl<'a> Transaction<'a> {
    pub fn new(pid: Pid, toggle: bool, len: usize, slot: usize, buffer: u32) -> Self {
        Self {
            pid,
            toggle,
            len,
            slot,
            buffer,
            dest: None,
            dummy: false,
            actual: 0,
            retired: false,
            skipped: false,
            offset: 0,
            start_toggle: toggle,
        }
    }

    /// Physical address the hardware starts at
    #[inline]
    pub fn start(&self) -> u32 {
        self.buffer + self.offset as u32
    }

    /// Bytes left for the hardware
    #[inline]
    pub fn remaining(&self) -> usize {
        self.len - self.offset
    }

    /// Toggle the device expects after this transaction. A transaction that
    /// did not retire only got its whole packets acknowledged.
    fn next_toggle(&self, max_packet: u16) -> bool {
        if self.retired {
            return toggle_after(self.toggle, self.actual, max_packet);
        }
        let acked = self.actual - self.actual % max_packet.max(1) as usize;
        if acked == 0 {
            self.toggle
        } else {
            toggle_after(self.toggle, acked, max_packet)
        }
    }
}

/// One logical USB request
#[derive(Debug)]
pub struct Transfer<'a> {
    pub target: Target,
    /// Head slot (ED/QH) bound to this transfer
    pub head: usize,
    pub transactions: Vec<Transaction<'a>>,
    pub success: bool,
    /// Submissions to the hardware so far
    pub attempts: u32,
    /// Condition code that ended the transfer
    pub completion: Option<CompletionCode>,
    /// Index of the first transaction handed to the hardware on (re)submission
    resume: usize,
    /// Element slots reserved by `setup_transfer`
    reserved: usize,
}

impl Transfer<'_> {
    /// Slot of the first transaction the hardware will execute
    pub fn first_slot(&self) -> usize {
        self.transactions.get(self.resume).map_or(0, |tx| tx.slot)
    }

    /// Slot of the dummy terminator
    pub fn tail_slot(&self) -> usize {
        self.transactions.last().map_or(0, |tx| tx.slot)
    }

    pub fn resume_index(&self) -> usize {
        self.resume
    }

    /// Bytes moved by the IN and OUT transactions
    pub fn actual_length(&self) -> usize {
        self.transactions
            .iter()
            .filter(|tx| !tx.dummy && tx.pid != Pid::Setup)
            .map(|tx| tx.actual)
            .sum()
    }

    /// Index of the transaction that runs once a short packet ended the IN
    /// data stage before `index`: the status stage of a control transfer,
    /// the dummy of a bulk transfer.
    pub fn data_stage_end(&self, index: usize) -> usize {
        self.transactions
            .iter()
            .enumerate()
            .skip(index)
            .find(|(_, tx)| tx.pid != Pid::In || tx.dummy)
            .map_or(self.transactions.len(), |(i, _)| i)
    }

    /// Mark the IN transactions from `index` up to the end of the data
    /// stage as skipped. Returns the index of the next one to run.
    fn skip_data_stage(&mut self, index: usize) -> usize {
        let end = self.data_stage_end(index);
        for tx in &mut self.transactions[index..end] {
            tx.skipped = true;
            tx.retired = true;
            tx.actual = 0;
        }
        end
    }
}

/// State of one element as decoded by the backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementStatus {
    /// Still owned by the hardware
    Active,
    Done { code: CompletionCode, actual: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChainState {
    Pending,
    Complete,
    Failed(CompletionCode),
}

/// Packets needed for `len` bytes; a zero-length packet still counts
#[inline]
fn packets(len: usize, max_packet: u16) -> usize {
    len.div_ceil(max_packet.max(1) as usize).max(1)
}

/// Toggle after `len` bytes sent starting with `toggle`
#[inline]
fn toggle_after(toggle: bool, len: usize, max_packet: u16) -> bool {
    toggle ^ (packets(len, max_packet) % 2 == 1)
}

impl HostController {
    // ------------------------------------------------------------------
    // Building transfers
    // ------------------------------------------------------------------

    /// Select the pool region for `target.kind`, recycling it if needed, and
    /// bind a fresh head slot. `elements` includes the dummy.
    pub fn setup_transfer<'a>(&mut self, target: Target, elements: usize) -> Result<Transfer<'a>> {
        if !self.is_running() {
            return Err(UsbError::NotReady);
        }

        if self.pool.is_outstanding() {
            // A timed-out transfer the hardware may still be walking
            match self.backend.quiesce(&self.pool) {
                Ok(()) => {
                    log::info!("{}: stale transfer dropped by the controller", self.name());
                    self.pool.retire();
                }
                Err(_) => {
                    log::warn!("{}: descriptor pool still owned by the controller", self.name());
                    return Err(UsbError::PoolBusy);
                }
            }
        }

        self.pool.reset_if_needed(target.kind, elements)?;
        let head = self.pool.advance_head()?;

        Ok(Transfer {
            target,
            head,
            transactions: Vec::with_capacity(elements),
            success: false,
            attempts: 0,
            completion: None,
            resume: 0,
            reserved: elements,
        })
    }

    /// Append the SETUP stage of a control transfer
    pub fn setup_transaction(&mut self, transfer: &mut Transfer<'_>, setup: &SetupPacket) -> Result<()> {
        let bytes = setup.to_bytes();
        self.push_transaction(transfer, Pid::Setup, false, bytes.len(), Some(&bytes), None, false)
    }

    pub fn in_transaction<'a>(
        &mut self,
        transfer: &mut Transfer<'a>,
        toggle: bool,
        len: usize,
        dest: Option<&'a mut [u8]>,
    ) -> Result<()> {
        self.push_transaction(transfer, Pid::In, toggle, len, None, dest, false)
    }

    pub fn out_transaction(&mut self, transfer: &mut Transfer<'_>, toggle: bool, data: &[u8]) -> Result<()> {
        self.push_transaction(transfer, Pid::Out, toggle, data.len(), Some(data), None, false)
    }

    fn push_transaction<'a>(
        &mut self,
        transfer: &mut Transfer<'a>,
        pid: Pid,
        toggle: bool,
        len: usize,
        out: Option<&[u8]>,
        dest: Option<&'a mut [u8]>,
        dummy: bool,
    ) -> Result<()> {
        // The last reserved slot belongs to the dummy
        if transfer.transactions.len() + usize::from(!dummy) >= transfer.reserved {
            return Err(UsbError::PoolExhausted);
        }
        if len > self.pool.buffer_size() {
            return Err(UsbError::InvalidParameter);
        }

        let slot = self.pool.advance_element()?;
        if let Some(data) = out {
            self.pool.write_buffer(slot, data);
        }

        let mut tx = Transaction::new(pid, toggle, len, slot, self.pool.buffer_phys(slot));
        tx.dest = dest;
        tx.dummy = dummy;
        self.backend.encode_element(&self.pool, &transfer.target, &tx);
        if let Some(prev) = transfer.transactions.last() {
            self.backend.link(&self.pool, prev.slot, slot);
        }
        transfer.transactions.push(tx);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Issuing
    // ------------------------------------------------------------------

    /// Terminate the chain, submit it and block until it completes, fails
    /// or times out.
    ///
    /// IN data reaches the destination buffers only when every transaction
    /// completed cleanly.
    pub fn issue_transfer(&mut self, transfer: &mut Transfer<'_>) -> Result<()> {
        self.push_transaction(transfer, Pid::Out, false, 0, None, None, true)?;
        self.pool.begin();

        let budget = self.backend.retry_budget().max(1);
        let mut outcome = Err(UsbError::Timeout);
        for attempt in 0..budget {
            if attempt > 0 {
                self.rearm_chain(transfer);
            }
            self.backend.publish(&self.pool, transfer);
            transfer.attempts += 1;

            outcome = self.wait_for_transfer(transfer);
            match outcome {
                Ok(()) | Err(UsbError::Timeout) | Err(UsbError::Stall) => break,
                Err(e) => log::debug!(
                    "{}: attempt {}/{} failed: {}",
                    self.name(),
                    attempt + 1,
                    budget,
                    e
                ),
            }
        }

        match outcome {
            Ok(()) => {
                self.backend.unlink(&self.pool, transfer);
                self.pool.retire();
                for tx in transfer.transactions.iter_mut() {
                    if let Some(dest) = tx.dest.as_deref_mut() {
                        let n = tx.actual.min(dest.len());
                        self.pool.read_buffer(tx.slot, &mut dest[..n]);
                    }
                }
                transfer.success = true;
                transfer.completion = Some(CompletionCode::NoError);
                Ok(())
            }
            Err(UsbError::Timeout) => {
                log::warn!(
                    "{}: transfer to {}:{} timed out",
                    self.name(),
                    transfer.target.address,
                    transfer.target.endpoint
                );
                match self.backend.quiesce(&self.pool) {
                    Ok(()) => self.pool.retire(),
                    Err(_) => log::error!(
                        "{}: controller did not release the transfer, pool stays busy",
                        self.name()
                    ),
                }
                Err(UsbError::Timeout)
            }
            Err(e) => {
                self.backend.unlink(&self.pool, transfer);
                self.pool.retire();
                Err(e)
            }
        }
    }

    /// Re-encode the chain for another submission.
    ///
    /// Control transfers restart at SETUP. Bulk transfers resume at the
    /// first transaction that did not complete, the device has already
    /// acknowledged the ones before it. Inside that transaction they resume
    /// after the last whole packet the device acknowledged, with the toggle
    /// it expects there.
    fn rearm_chain(&mut self, transfer: &mut Transfer<'_>) {
        let resume = match transfer.target.kind {
            TransferKind::Control => 0,
            TransferKind::Bulk => transfer
                .transactions
                .iter()
                .position(|tx| !tx.retired && !tx.dummy)
                .unwrap_or(0),
        };
        transfer.resume = resume;

        let target = transfer.target;
        let max_packet = target.max_packet.max(1) as usize;
        for i in resume..transfer.transactions.len() {
            let tx = &mut transfer.transactions[i];
            let acked = if i == resume && target.kind == TransferKind::Bulk && tx.actual < tx.len {
                tx.actual - tx.actual % max_packet
            } else {
                0
            };
            if acked > 0 {
                log::debug!(
                    "{}: resuming transfer after {} acknowledged bytes",
                    self.name(),
                    acked
                );
            }
            tx.offset = acked;
            tx.start_toggle = if acked == 0 {
                tx.toggle
            } else {
                toggle_after(tx.toggle, acked, target.max_packet)
            };
            tx.actual = acked;
            tx.retired = false;
            tx.skipped = false;
            self.backend
                .encode_element(&self.pool, &target, &transfer.transactions[i]);
            if i > resume {
                let prev = transfer.transactions[i - 1].slot;
                self.backend
                    .link(&self.pool, prev, transfer.transactions[i].slot);
            }
        }
    }

    fn wait_for_transfer(&mut self, transfer: &mut Transfer<'_>) -> Result<()> {
        let platform = self.platform.clone();

        let settle = self.backend.settle_delay_ms();
        if settle > 0 {
            platform.sleep_ms(settle);
        }

        let mut state = ChainState::Pending;
        let polls = self.config.transfer_polls;
        let interval = self.config.transfer_poll_interval_ms;
        let _ = wait_until(&*platform, polls, interval, || {
            self.service_pending();
            state = self.scan_chain(transfer);
            state != ChainState::Pending
        });

        match state {
            ChainState::Complete => Ok(()),
            ChainState::Pending => Err(UsbError::Timeout),
            ChainState::Failed(code) => {
                transfer.completion = Some(code);
                log::warn!("{}: {}", self.name(), code.description());
                Err(code.into())
            }
        }
    }

    /// Walk the non-dummy transactions in chain order.
    ///
    /// A short packet ends an IN data stage: the rest of it is skipped and
    /// the hardware is sent on to the status stage or the dummy.
    fn scan_chain(&self, transfer: &mut Transfer<'_>) -> ChainState {
        let mut index = 0;
        while let Some(tx) = transfer.transactions.get_mut(index) {
            index += 1;
            if tx.dummy || tx.retired {
                continue;
            }
            match self.backend.element_status(&self.pool, tx) {
                ElementStatus::Active => return ChainState::Pending,
                ElementStatus::Done { code, actual } if code.is_success() => {
                    tx.actual = actual;
                    tx.retired = true;
                    if tx.pid == Pid::In && actual < tx.len {
                        log::trace!("{}: short packet, {} of {} bytes", self.name(), actual, tx.len);
                        index = transfer.skip_data_stage(index);
                        self.backend.end_data_stage(&self.pool, transfer, index);
                    }
                }
                ElementStatus::Done { code, actual } => {
                    tx.actual = actual;
                    return ChainState::Failed(code);
                }
            }
        }
        ChainState::Complete
    }

    // ------------------------------------------------------------------
    // Control and bulk requests
    // ------------------------------------------------------------------

    /// Run a control request on endpoint 0 of `dev`.
    ///
    /// Returns the number of bytes moved in the data stage.
    pub fn control_transfer(
        &mut self,
        dev: &mut Device,
        setup: SetupPacket,
        data: Option<&mut [u8]>,
    ) -> Result<usize> {
        let max_packet = dev.max_packet0.max(8);
        let chunk = self.backend.max_transaction_len(&self.pool, max_packet);
        let direction = setup.direction();
        let len = data
            .as_ref()
            .map_or(0, |buf| buf.len())
            .min(setup.length as usize);
        let chunks = len.div_ceil(chunk);

        let target = Target {
            kind: TransferKind::Control,
            address: dev.address,
            endpoint: 0,
            max_packet,
            speed: dev.speed,
        };
        // SETUP + data + status + dummy
        let mut transfer = self.setup_transfer(target, chunks + 3)?;
        self.setup_transaction(&mut transfer, &setup)?;

        let mut toggle = true;
        if let Some(buf) = data {
            let (buf, _) = buf.split_at_mut(len);
            for piece in buf.chunks_mut(chunk) {
                let n = piece.len();
                match direction {
                    Direction::In => self.in_transaction(&mut transfer, toggle, n, Some(piece))?,
                    Direction::Out => self.out_transaction(&mut transfer, toggle, piece)?,
                }
                toggle = toggle_after(toggle, n, max_packet);
            }
        }

        // Status stage runs opposite to the data stage, always DATA1
        if direction == Direction::In && len > 0 {
            self.out_transaction(&mut transfer, true, &[])?;
        } else {
            self.in_transaction(&mut transfer, true, 0, None)?;
        }

        self.issue_transfer(&mut transfer)?;

        Ok(transfer
            .transactions
            .iter()
            .skip(1)
            .take(chunks)
            .map(|tx| tx.actual)
            .sum())
    }

    /// Read from a bulk IN endpoint. Large buffers are split over several
    /// transfers; a short packet ends the read early.
    pub fn bulk_in(&mut self, dev: &mut Device, endpoint: &EndpointInfo, buf: &mut [u8]) -> Result<usize> {
        let limit = self.bulk_transfer_limit(endpoint);
        if buf.is_empty() {
            return self.bulk_transfer(dev, endpoint, BulkData::In(buf));
        }

        let mut total = 0;
        for piece in buf.chunks_mut(limit) {
            let want = piece.len();
            let got = self.bulk_transfer(dev, endpoint, BulkData::In(piece))?;
            total += got;
            if got < want {
                break;
            }
        }
        Ok(total)
    }

    /// Write to a bulk OUT endpoint
    pub fn bulk_out(&mut self, dev: &mut Device, endpoint: &EndpointInfo, data: &[u8]) -> Result<usize> {
        let limit = self.bulk_transfer_limit(endpoint);
        if data.is_empty() {
            return self.bulk_transfer(dev, endpoint, BulkData::Out(data));
        }

        let mut total = 0;
        for piece in data.chunks(limit) {
            total += self.bulk_transfer(dev, endpoint, BulkData::Out(piece))?;
        }
        Ok(total)
    }

    /// Bytes one bulk transfer can carry with the dummy reserved
    fn bulk_transfer_limit(&self, endpoint: &EndpointInfo) -> usize {
        let chunk = self
            .backend
            .max_transaction_len(&self.pool, endpoint.max_packet_size.max(1));
        let slots = self.pool.layout().element_range(TransferKind::Bulk).len();
        chunk * slots.saturating_sub(1).max(1)
    }

    fn bulk_transfer(&mut self, dev: &mut Device, endpoint: &EndpointInfo, data: BulkData<'_>) -> Result<usize> {
        let max_packet = endpoint.max_packet_size.max(1);
        let chunk = self.backend.max_transaction_len(&self.pool, max_packet);
        let direction = data.direction();
        let count = data.len().div_ceil(chunk).max(1);

        let target = Target {
            kind: TransferKind::Bulk,
            address: dev.address,
            endpoint: endpoint.number,
            max_packet,
            speed: dev.speed,
        };
        let mut transfer = self.setup_transfer(target, count + 1)?;

        let mut toggle = dev.toggle(endpoint.number, direction);
        match data {
            BulkData::In(buf) if buf.is_empty() => {
                self.in_transaction(&mut transfer, toggle, 0, None)?;
            }
            BulkData::In(buf) => {
                for piece in buf.chunks_mut(chunk) {
                    let n = piece.len();
                    self.in_transaction(&mut transfer, toggle, n, Some(piece))?;
                    toggle = toggle_after(toggle, n, max_packet);
                }
            }
            BulkData::Out(buf) if buf.is_empty() => {
                self.out_transaction(&mut transfer, toggle, &[])?;
            }
            BulkData::Out(buf) => {
                for piece in buf.chunks(chunk) {
                    self.out_transaction(&mut transfer, toggle, piece)?;
                    toggle = toggle_after(toggle, piece.len(), max_packet);
                }
            }
        }

        let result = self.issue_transfer(&mut transfer);

        // The device flipped its toggle once per acknowledged packet
        let mut next = dev.toggle(endpoint.number, direction);
        for tx in transfer.transactions.iter().filter(|tx| !tx.dummy && !tx.skipped) {
            next = tx.next_toggle(max_packet);
            if !tx.retired {
                break;
            }
        }
        dev.set_toggle(endpoint.number, direction, next);

        result.map(|()| transfer.actual_length())
    }
}

enum BulkData<'a> {
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

impl BulkData<'_> {
    fn direction(&self) -> Direction {
        match self {
            BulkData::In(_) => Direction::In,
            BulkData::Out(_) => Direction::Out,
        }
    }

    fn len(&self) -> usize {
        match self {
            BulkData::In(buf) => buf.len(),
            BulkData::Out(buf) => buf.len(),
        }
    }
}
