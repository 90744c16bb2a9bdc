//! PVCAM interface board (AMCC S5933 PCI matchmaker).
//!
//! Commands travel as big-endian byte frames through the FIFO port; the
//! board acknowledges each phase with a mailbox-2 interrupt whose payload
//! carries the command-complete bit. Image data arrives by bus-master DMA
//! into a host scatter-gather list.

// ── Operation registers (offsets into BAR0) ──────────────────────────────────

/// Outgoing mailbox 2 (flash loader handshake).
pub const OUTMAILBOX2: usize = 0x04;
/// Incoming mailbox 1.
pub const MAILBOX1: usize = 0x10;
/// Incoming mailbox 2: interrupt payload.
pub const MAILBOX2: usize = 0x14;
/// Incoming mailbox 3.
pub const MAILBOX3: usize = 0x18;
/// Incoming mailbox 4: PCI firmware revision.
pub const MAILBOX4: usize = 0x1C;
/// Mailbox empty/full status.
pub const MAILSTATUS: usize = 0x34;
/// Interrupt control/status.
pub const INTCSR: usize = 0x38;
/// Bus-master control/status.
pub const MASTERCSR: usize = 0x3C;

// ── Register values ──────────────────────────────────────────────────────────

/// INTCSR: enable (and acknowledge) the mailbox-2 interrupt.
pub const INT_MAILBOX2: u32 = 0x2032_1400;
/// INTCSR: enable the mailbox-1 interrupt.
pub const INT_MAILBOX1: u32 = 0x2032_1000;
/// INTCSR: all interrupts off.
pub const INT_DISABLE: u32 = 0x2032_0000;
/// MASTERCSR: normal bus-master operation.
pub const MASTERSET: u32 = 0x0000_9300;
/// MASTERCSR: reset mailbox flags and FIFOs.
pub const MASTERRESET: u32 = 0x0E00_9300;
/// INTCSR bit set while this board asserts its interrupt.
pub const OUR_PCI_INTERRUPT: u32 = 0x0002_0000;
/// MAILSTATUS bits showing incoming mailbox 2 holds data.
pub const MAIL_FOR_US: u32 = 0x00F0_0000;
/// Outgoing mailbox value that aborts an exposure.
pub const ABORT_EXP: u32 = 0xDEAD_DEAD;
/// Outgoing mailbox byte that puts the board into flash-load mode.
pub const FLASH_LOAD: u32 = b'L' as u32;

/// Mailbox-2 payload bits.
pub mod mail {
    /// A command phase (write or read) completed.
    pub const COMMAND_COMPLETE: u32 = 0x8000;
    /// Low bits of a command-complete payload reporting a link error.
    pub const COMM_ERROR_MASK: u32 = 0x0FFF;
    /// DMA payload bit: frame was short.
    pub const MISSING_DATA: u32 = 0x02;
    /// DMA payload bit: frame was long.
    pub const EXTRA_DATA: u32 = 0x10;
    /// DMA payload bit: frame was long (second source).
    pub const EXTRA_DATA_ALT: u32 = 0x40;
    /// DMA payload bit: board FIFO overflowed.
    pub const FIFO_OVERFLOW: u32 = 0x80;
}

// ── Image status codes ───────────────────────────────────────────────────────

/// Exposure status codes reported by `GET_IMAGE_STATUS`.
pub mod status {
    /// No exposure configured.
    pub const IDLE: i32 = 1;
    /// Active, nothing received yet.
    pub const NO_DATA_A: i32 = 100;
    /// Idle, nothing received.
    pub const NO_DATA_I: i32 = 101;
    /// Active, data arriving.
    pub const COLLECT_OK_A: i32 = 102;
    /// Frame complete.
    pub const COLLECT_DONE_I: i32 = 103;
    /// FIFO overflow during an active exposure.
    pub const FIFO_OVER_A: i32 = 104;
    /// FIFO overflow after the exposure.
    pub const FIFO_OVER_I: i32 = 105;
    /// More data than requested.
    pub const EXTRA_DATA_I: i32 = 107;
    /// No acknowledge during an active exposure.
    pub const NO_ACK_A: i32 = 108;
    /// No acknowledge after the exposure.
    pub const NO_ACK_I: i32 = 109;
    /// Transfer error during an active exposure.
    pub const XFER_ERR_A: i32 = 110;
    /// Transfer error.
    pub const XFER_ERR_I: i32 = 111;
    /// Nothing known yet.
    pub const UNKNOWN: i32 = 113;
    /// Less data than requested.
    pub const MISSING_DATA_I: i32 = 115;
    /// Frame contained no data.
    pub const EMPTY_DATA_I: i32 = 117;
}

// ── Transport limits ─────────────────────────────────────────────────────────

/// Script buffer size, frame header included.
pub const SCRIPT_BUFFER_SIZE: usize = 4100;
/// Frame header: class byte plus a 16-bit big-endian length.
pub const FRAME_HEADER_LEN: usize = 3;
/// Largest write payload one transaction carries.
pub const MAX_WRITE_BYTES: usize = SCRIPT_BUFFER_SIZE - FRAME_HEADER_LEN;
/// Default command timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;
/// Pages per scatter-gather block.
pub const IMAGE_PAGES: usize = 4;
/// Scatter-gather table capacity, terminator included.
pub const TABLE_SIZE: usize = 8192;
/// Bytes per scatter-gather table entry (`u32` bus address, `u32` size).
pub const TABLE_ENTRY_SIZE: usize = 8;
/// Largest flash image accepted.
pub const MAX_FLASH_BYTES: usize = 32 * 1024;
/// Pixel time reported to the library, in nanoseconds.
pub const PIXTIME: u32 = 500;
/// Driver version reported to the library.
pub const DRIVER_VERSION: u32 = 0x0400;
/// Image transfer granularity in bytes.
pub const MIN_XFER_SIZE: u32 = 4;
/// Largest image transfer in bytes.
pub const MAX_XFER_SIZE: u32 = 0x0200_0000;

// ── Keep-alive and status-query signatures ───────────────────────────────────

/// First byte of the keep-alive command allowed during a transfer.
pub const KEEP_ALIVE_OPCODE: u8 = 0x2E;
/// First byte of the camera status query.
pub const STATUS_QUERY_OPCODE: u8 = 0x26;
/// Write length of the camera status query.
pub const STATUS_QUERY_WRITE_BYTES: usize = 5;
/// Read length of the camera status query.
pub const STATUS_QUERY_READ_BYTES: usize = 10;

// ── Control opcodes ──────────────────────────────────────────────────────────

/// ioctl magic number shared by all PVCAM control calls.
pub const IOCTL_MAGIC: u32 = 61;

/// Control-call numbers (the `nr` field of the ioctl request).
pub mod opcode {
    /// Read the retry count.
    pub const GET_MAXRETRIES: u32 = 10;
    /// Set the retry count.
    pub const SET_MAXRETRIES: u32 = 11;
    /// Read the command timeout.
    pub const GET_MAXTIMEOUT: u32 = 12;
    /// Set the command timeout.
    pub const SET_MAXTIMEOUT: u32 = 13;
    /// One write/read command transaction.
    pub const WRITE_READ: u32 = 14;
    /// Arm an exposure.
    pub const SET_IMAGE_ACTIVE: u32 = 15;
    /// Disarm the exposure.
    pub const SET_IMAGE_IDLE: u32 = 16;
    /// Poll exposure status (and collect a finished frame).
    pub const GET_IMAGE_STATUS: u32 = 17;
    /// Read the pixel time.
    pub const GET_PIXTIME: u32 = 18;
    /// Read the driver version.
    pub const GET_DRIVER_VER: u32 = 19;
    /// Read the transfer granularity.
    pub const GET_IMAGE_GRANUL: u32 = 22;
    /// Read the PCI firmware revision.
    pub const GET_PCI_FW_REV: u32 = 30;
    /// Program the PCI flash.
    pub const LOAD_PCI_FLASH: u32 = 32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_limit_leaves_room_for_header() {
        assert_eq!(MAX_WRITE_BYTES, 4097);
        assert_eq!(MAX_WRITE_BYTES + FRAME_HEADER_LEN, SCRIPT_BUFFER_SIZE);
    }

    #[test]
    fn mail_bits_do_not_overlap_command_complete() {
        let dma_bits = mail::MISSING_DATA | mail::EXTRA_DATA | mail::EXTRA_DATA_ALT | mail::FIFO_OVERFLOW;
        assert_eq!(dma_bits & mail::COMMAND_COMPLETE, 0);
    }
}
