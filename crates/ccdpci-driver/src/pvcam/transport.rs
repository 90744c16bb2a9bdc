//! PVCAM mailbox transport
//!
//! One write/read transaction:
//!
//! ```text
//!  caller              board gate held                  interrupt
//!  ──────              ───────────────                  ─────────
//!  frame = [class, len_hi, len_lo, data...]
//!  lock = WritePending (if a read follows)
//!  busy = true, take ticket
//!  FIFO ◀── frame as big-endian words
//!  wait for event ............................◀── ack: lock → ReadPending
//!  wait while ReadPending ....................◀── ack: lock → None
//!  reply ◀── FIFO words
//! ```

use crate::board::{IrqShared, LockMode};
use crate::error::{DriverError, Result};
use crate::mmio::Registers;
use crate::user::UserBuffer;
use ccdpci_chip::pvcam::{
    self, mail, FRAME_HEADER_LEN, KEEP_ALIVE_OPCODE, MAX_WRITE_BYTES,
};
use std::time::Duration;

/// The four I/O windows of a PVCAM board.
#[derive(Debug, Clone)]
pub struct PvcamPorts {
    ops: Registers,
    fifo: Registers,
    table: Registers,
    flash: Registers,
}

impl PvcamPorts {
    /// Bundle the windows in BAR order.
    pub const fn new(ops: Registers, fifo: Registers, table: Registers, flash: Registers) -> Self {
        Self {
            ops,
            fifo,
            table,
            flash,
        }
    }

    /// Operation register window.
    pub const fn operation(&self) -> &Registers {
        &self.ops
    }

    /// Reset the mailbox flags and FIFOs, then resume normal bus mastering.
    pub fn reset_mailboxes(&self) {
        self.ops.write32(pvcam::MASTERCSR, pvcam::MASTERRESET);
        self.ops.write32(pvcam::MASTERCSR, pvcam::MASTERSET);
    }

    /// Enable the mailbox-2 interrupt.
    pub fn enable_interrupt(&self) {
        self.ops.write32(pvcam::INTCSR, pvcam::INT_MAILBOX2);
    }

    /// PCI firmware revision.
    pub fn firmware_revision(&self) -> u32 {
        self.ops.read32(pvcam::MAILBOX4)
    }

    /// Push a frame into the FIFO, four bytes per word, big-endian. A short
    /// final chunk is zero-padded.
    pub fn write_frame(&self, frame: &[u8]) {
        for chunk in frame.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.fifo.write32(0, u32::from_be_bytes(word));
        }
    }

    /// Fill `dst` from the FIFO, one big-endian word per four bytes.
    pub fn read_frame(&self, dst: &mut [u8]) {
        for chunk in dst.chunks_mut(4) {
            let word = self.fifo.read32(0).to_be_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    /// Hand the scatter-gather table to the DMA engine.
    pub fn start_dma(&self, table_bus_address: u32) {
        self.table.write32(0, table_bus_address);
    }

    /// Put the board in flash-load mode and stream `image` to the flash
    /// port as little-endian 16-bit words.
    pub fn load_flash(&self, image: &[u8]) {
        self.ops.write32(pvcam::OUTMAILBOX2, pvcam::FLASH_LOAD);
        for pair in image.chunks(2) {
            let word = [pair[0], pair.get(1).copied().unwrap_or(0)];
            self.flash.write16(0, u16::from_le_bytes(word));
        }
    }
}

/// Fixed header of a raw `WRITE_READ` argument buffer. The write payload
/// follows it, then room for the read payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct WriteReadHeader {
    /// Command class byte.
    pub class: u8,
    /// Reserved, zero.
    pub reserved: u8,
    /// Bytes to write.
    pub write_bytes: u16,
    /// Bytes to read back.
    pub read_bytes: u16,
    /// Reserved, zero.
    pub reserved2: u16,
}

/// One typed write/read request.
pub struct WriteRead<'a> {
    /// Command class byte.
    pub class: u8,
    /// Write payload source.
    pub write: &'a dyn UserBuffer,
    /// Bytes of `write` to send.
    pub write_bytes: usize,
    /// Read payload destination.
    pub read: &'a mut dyn UserBuffer,
    /// Bytes to read back into `read`.
    pub read_bytes: usize,
}

impl std::fmt::Debug for WriteRead<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteRead")
            .field("class", &self.class)
            .field("write_bytes", &self.write_bytes)
            .field("read_bytes", &self.read_bytes)
            .finish_non_exhaustive()
    }
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Sent and acknowledged.
    Completed,
    /// Dropped because an image transfer is active; the read payload was
    /// zero-filled.
    Aborted,
}

/// The one command allowed through while an image transfer is active.
const fn is_keep_alive(first: Option<u8>, write_bytes: usize, read_bytes: usize) -> bool {
    matches!(first, Some(KEEP_ALIVE_OPCODE)) && write_bytes == 1 && read_bytes == 0
}

/// Run one write/read transaction. The caller holds the board gate.
pub(crate) fn write_read(
    ports: &PvcamPorts,
    shared: &IrqShared,
    timeout: Duration,
    max_read_bytes: usize,
    xfer_active: bool,
    req: &mut WriteRead<'_>,
) -> Result<Transfer> {
    let (write_bytes, read_bytes) = (req.write_bytes, req.read_bytes);
    if write_bytes > MAX_WRITE_BYTES {
        return Err(DriverError::invalid_argument(format!(
            "{write_bytes} write bytes, at most {MAX_WRITE_BYTES}"
        )));
    }
    if read_bytes > max_read_bytes {
        return Err(DriverError::invalid_argument(format!(
            "{read_bytes} read bytes, at most {max_read_bytes}"
        )));
    }

    let mut frame = vec![0u8; FRAME_HEADER_LEN + write_bytes];
    frame[0] = req.class;
    #[allow(clippy::cast_possible_truncation)]
    frame[1..FRAME_HEADER_LEN].copy_from_slice(&(write_bytes as u16).to_be_bytes());
    req.write.copy_from_user(0, &mut frame[FRAME_HEADER_LEN..])?;

    if xfer_active && !is_keep_alive(frame.get(FRAME_HEADER_LEN).copied(), write_bytes, read_bytes) {
        tracing::warn!(
            "Command class {:#x} ({write_bytes}w/{read_bytes}r) dropped during image transfer",
            req.class
        );
        req.read.copy_to_user(0, &vec![0u8; read_bytes])?;
        shared.set_lock_mode(LockMode::None);
        shared.set_busy(false);
        return Ok(Transfer::Aborted);
    }

    if read_bytes > 0 && write_bytes > 0 {
        shared.set_lock_mode(LockMode::WritePending);
    }

    let events = shared.events();
    if shared.is_busy() && !events.wait_while(timeout, || shared.is_busy()) {
        shared.set_lock_mode(LockMode::None);
        return Err(DriverError::timeout(timeout));
    }

    shared.set_busy(true);
    let ticket = events.ticket();
    ports.write_frame(&frame);
    tracing::debug!("Sent class {:#x}, {write_bytes} bytes", req.class);

    if !events.wait_for_event(ticket, timeout) {
        shared.set_busy(false);
        shared.set_lock_mode(LockMode::None);
        tracing::warn!("No acknowledge for class {:#x} within {timeout:?}", req.class);
        return Err(DriverError::timeout(timeout));
    }

    if read_bytes == 0 {
        return Ok(Transfer::Completed);
    }

    if !events.wait_while(timeout, || shared.lock_mode() == LockMode::ReadPending) {
        shared.set_busy(false);
        shared.set_lock_mode(LockMode::None);
        tracing::warn!("No read acknowledge for class {:#x} within {timeout:?}", req.class);
        return Err(DriverError::timeout(timeout));
    }

    let status = shared.captured_status();
    if status & mail::COMM_ERROR_MASK != 0 {
        shared.set_lock_mode(LockMode::None);
        tracing::warn!("Communication error {status:#x} on class {:#x}", req.class);
        return Err(DriverError::ProtocolError { reply: status });
    }

    let mut reply = vec![0u8; read_bytes];
    ports.read_frame(&mut reply);
    req.read.copy_to_user(0, &reply)?;
    Ok(Transfer::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_signature() {
        assert!(is_keep_alive(Some(0x2E), 1, 0));
        assert!(!is_keep_alive(Some(0x2E), 1, 2));
        assert!(!is_keep_alive(Some(0x26), 5, 10));
        assert!(!is_keep_alive(None, 0, 0));
    }

    #[test]
    fn header_is_eight_packed_bytes() {
        assert_eq!(std::mem::size_of::<WriteReadHeader>(), 8);
        let h: WriteReadHeader = bytemuck::pod_read_unaligned(&[0x01, 0, 5, 0, 10, 0, 0, 0]);
        assert_eq!(h.class, 1);
        assert_eq!(u16::from_le(h.write_bytes), 5);
        assert_eq!(u16::from_le(h.read_bytes), 10);
    }
}
