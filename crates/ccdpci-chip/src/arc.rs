//! ARC DSP host interface.
//!
//! The host talks to the controller's DSP through five 32-bit registers.
//! Commands are *vectors* written to HCVR; parameters and replies move
//! through a pair of FIFOs behind CMD_DATA and REPLY_BUFFER. The outcome of
//! the last vector is reported in a three-bit reply-flag field of HSTR.
//!
//! ```text
//! HSTR  31            7   6    5  4  3   2      1      0
//!       ───────────────── ─── ───────── ────── ────── ───
//!       reserved          DMA reply     out    in
//!                         irq flags     ready  ready
//! ```

// ── Register offsets ─────────────────────────────────────────────────────────

/// Host control register.
pub const HCTR: usize = 0x10;
/// Host status register.
pub const HSTR: usize = 0x14;
/// Host command vector register.
pub const HCVR: usize = 0x18;
/// Reply FIFO (host side of the DSP's output FIFO).
pub const REPLY_BUFFER: usize = 0x1C;
/// Command data FIFO (host side of the DSP's input FIFO).
pub const CMD_DATA: usize = 0x20;

/// HSTR bit definitions.
pub mod hstr {
    /// Input FIFO has room: a vector or data word may be written.
    pub const INPUT_FIFO_READY: u32 = 1 << 1;
    /// Output FIFO holds at least one reply word.
    pub const OUTPUT_FIFO_READY: u32 = 1 << 2;
    /// Reply-flag field mask (bits 3-5).
    pub const REPLY_FLAGS_MASK: u32 = 0x38;
    /// Reply-flag field shift.
    pub const REPLY_FLAGS_SHIFT: u32 = 3;
    /// The board is raising its image-DMA interrupt.
    pub const DMA_INTERRUPTING: u32 = 1 << 6;

    /// Extract the three-bit reply-flag field.
    #[must_use]
    pub const fn reply_flags(hstr: u32) -> u32 {
        (hstr & REPLY_FLAGS_MASK) >> REPLY_FLAGS_SHIFT
    }
}

/// HCTR bit definitions.
pub mod hctr {
    /// Bits preserved when the driver configures the transfer mode.
    pub const PRESERVE_MASK: u32 = 0xCFF;
    /// 32-bit image transfers with 24-bit reply words.
    pub const IMAGE_32_REPLY_24: u32 = 0x900;

    /// Value written to HCTR on open.
    #[must_use]
    pub const fn configured(current: u32) -> u32 {
        (current & PRESERVE_MASK) | IMAGE_32_REPLY_24
    }
}

/// HCVR bit definitions.
pub mod hcvr {
    /// A previously written vector has not been taken by the DSP yet.
    pub const COMMAND_BUSY: u32 = 1 << 0;
}

// ── Reply-flag field values ──────────────────────────────────────────────────

/// Values of the three-bit HSTR reply-flag field.
pub mod flags {
    /// Nothing to report yet.
    pub const NONE: u32 = 0;
    /// Command completed.
    pub const DONE: u32 = 1;
    /// A reply value waits to be fetched.
    pub const READ_REPLY: u32 = 2;
    /// Command failed.
    pub const ERROR: u32 = 3;
    /// The controller reset itself.
    pub const SYSTEM_RESET: u32 = 4;
    /// The controller is reading out an image.
    pub const READOUT: u32 = 5;
    /// The DSP is still working.
    pub const BUSY: u32 = 6;
}

// ── Vectors ──────────────────────────────────────────────────────────────────

/// Command vectors understood by the PCI DSP firmware.
pub mod vector {
    /// Reset the timing controller.
    pub const RESET_CONTROLLER: u32 = 0x87;
    /// Read the image header.
    pub const READ_HEADER: u32 = 0x81;
    /// Reset the image address counter.
    pub const INITIALIZE_IMAGE_ADDRESS: u32 = 0x91;
    /// Execute the command words queued in CMD_DATA.
    pub const WRITE_COMMAND: u32 = 0xB1;
    /// Start a PCI DSP firmware download.
    pub const PCI_DOWNLOAD: u32 = 0x802F;
    /// Acknowledge the image-DMA interrupt.
    pub const CLEAR_INTERRUPT: u32 = 0x8073;
    /// Move the pending reply value into the reply FIFO.
    pub const READ_REPLY_VALUE: u32 = 0x8075;
    /// Reset the PCI DSP.
    pub const PCI_RESET: u32 = 0x8077;
    /// Stop an image readout in progress.
    pub const ABORT_READOUT: u32 = 0x8079;
    /// Reboot the PCI DSP from its EEPROM.
    pub const BOOT_EEPROM: u32 = 0x807B;
    /// Report the number of frames transferred so far.
    pub const READ_NUMBER_OF_FRAMES_READ: u32 = 0x807D;
    /// Latch the image buffer bus address queued in CMD_DATA.
    pub const WRITE_PCI_ADDRESS: u32 = 0x807F;
    /// Clear the HSTR reply-flag field.
    pub const CLEAR_REPLY_FLAGS: u32 = 0x8081;
    /// Report the number of pixels transferred so far.
    pub const READ_PCI_IMAGE_ADDR: u32 = 0x8083;
}

// ── Reply words ──────────────────────────────────────────────────────────────

/// Reply words are three or four ASCII characters packed big-endian.
pub mod reply {
    /// `DON`
    pub const DONE: u32 = 0x0044_4F4E;
    /// `RDR`
    pub const READ_REPLY: u32 = 0x0052_4452;
    /// `ERR`
    pub const ERROR: u32 = 0x0045_5252;
    /// `SYR`
    pub const SYSTEM_RESET: u32 = 0x0053_5952;
    /// `TOUT`
    pub const TIMEOUT: u32 = 0x544F_5554;
    /// `ROUT`
    pub const READOUT: u32 = 0x524F_5554;
}

// ── Protocol limits ──────────────────────────────────────────────────────────

/// Most words a structured command carries (header included).
pub const MAX_COMMAND_WORDS: usize = 6;

/// Most stale words the driver discards from the reply FIFO.
pub const REPLY_FIFO_DEPTH: usize = 6;

/// Set in a command's first parameter word when it may run during readout.
pub const ALLOWED_DURING_READOUT: u32 = 0x8000;

/// PCI configuration space latency timer offset.
pub const CONFIG_LATENCY_TIMER: u32 = 0x0D;

/// Latency timer value programmed on open.
pub const LATENCY_TIMER_VALUE: u32 = 0xFF;

// ── Control opcodes ──────────────────────────────────────────────────────────

/// Control-call opcodes (low byte of the ioctl number).
pub mod opcode {
    /// Read HCTR.
    pub const GET_HCTR: u32 = 0x01;
    /// Pixel count of the transfer in progress.
    pub const GET_PROGRESS: u32 = 0x02;
    /// Image buffer bus address (low 32 bits).
    pub const GET_DMA_ADDR: u32 = 0x03;
    /// Read HSTR.
    pub const GET_HSTR: u32 = 0x04;
    /// Image buffer size in bytes.
    pub const GET_DMA_SIZE: u32 = 0x06;
    /// Frames transferred in the current sequence.
    pub const GET_FRAMES_READ: u32 = 0x07;
    /// Write one data word to CMD_DATA.
    pub const HCVR_DATA: u32 = 0x10;
    /// Write HCTR.
    pub const SET_HCTR: u32 = 0x11;
    /// Issue a vector and return its reply.
    pub const SET_HCVR: u32 = 0x12;
    /// Start a firmware download (no reply).
    pub const PCI_DOWNLOAD: u32 = 0x13;
    /// Wait for the firmware download to finish.
    pub const PCI_DOWNLOAD_WAIT: u32 = 0x14;
    /// Send a structured command.
    pub const COMMAND: u32 = 0x15;
    /// Image buffer bus address, low 32 bits.
    pub const GET_DMA_LO_ADDR: u32 = 0x21;
    /// Image buffer bus address, high 32 bits.
    pub const GET_DMA_HI_ADDR: u32 = 0x22;
    /// Read a config-space byte.
    pub const GET_CONFIG_BYTE: u32 = 0x30;
    /// Read a config-space word.
    pub const GET_CONFIG_WORD: u32 = 0x31;
    /// Read a config-space dword.
    pub const GET_CONFIG_DWORD: u32 = 0x32;
    /// Write a config-space byte.
    pub const SET_CONFIG_BYTE: u32 = 0x33;
    /// Write a config-space word.
    pub const SET_CONFIG_WORD: u32 = 0x34;
    /// Write a config-space dword.
    pub const SET_CONFIG_DWORD: u32 = 0x35;

    /// Extract the opcode from a full ioctl request number.
    #[must_use]
    pub const fn from_request(request: u32) -> u32 {
        request & 0xFF
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_words_spell_ascii() {
        assert_eq!(&reply::DONE.to_be_bytes()[1..], b"DON");
        assert_eq!(&reply::READ_REPLY.to_be_bytes()[1..], b"RDR");
        assert_eq!(&reply::TIMEOUT.to_be_bytes(), b"TOUT");
        assert_eq!(&reply::READOUT.to_be_bytes(), b"ROUT");
    }

    #[test]
    fn reply_flag_field_extraction() {
        assert_eq!(hstr::reply_flags(0x0000_0010), flags::READ_REPLY);
        assert_eq!(hstr::reply_flags(0x0000_002E), flags::READOUT);
        assert_eq!(hstr::reply_flags(hstr::INPUT_FIFO_READY), flags::NONE);
    }

    #[test]
    fn hctr_configuration_keeps_low_bits() {
        assert_eq!(hctr::configured(0xFFFF_FFFF), 0xDFF);
        assert_eq!(hctr::configured(0), 0x900);
    }
}
