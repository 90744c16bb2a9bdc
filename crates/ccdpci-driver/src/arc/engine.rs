//! ARC host-interface protocol
//!
//! Every exchange with the DSP follows the same shape: wait for the input
//! FIFO, write a vector (and any data words), then poll the HSTR reply-flag
//! field until it settles on a terminal value. A `RDR` outcome means a reply
//! word is waiting and must be fetched with a second vector.
//!
//! All waits are bounded by the engine's [`WaitBudget`].

use crate::error::{DriverError, Result};
use crate::mmio::Registers;
use crate::timing::{poll_until, WaitBudget};
use ccdpci_chip::arc::{
    flags, hcvr, hstr, reply, vector, ALLOWED_DURING_READOUT, CMD_DATA, HCTR, HCVR, HSTR,
    MAX_COMMAND_WORDS, REPLY_BUFFER, REPLY_FIFO_DEPTH,
};

/// Tries at a busy HCVR before an interrupt-context vector is dropped.
const ISR_VECTOR_TRIES: usize = 100;

/// Terminal value of the HSTR reply-flag field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// `DON`
    Done,
    /// `RDR`: a reply value is waiting.
    ReadReplyPending,
    /// `ERR`
    Error,
    /// `SYR`
    SystemReset,
    /// `ROUT`: an image readout is in progress.
    ReadoutBusy,
}

impl ReplyStatus {
    /// Decode the three-bit field; `None` while the DSP is still working.
    pub const fn from_flags(field: u32) -> Option<Self> {
        match field {
            flags::DONE => Some(Self::Done),
            flags::READ_REPLY => Some(Self::ReadReplyPending),
            flags::ERROR => Some(Self::Error),
            flags::SYSTEM_RESET => Some(Self::SystemReset),
            flags::READOUT => Some(Self::ReadoutBusy),
            _ => None,
        }
    }

    /// Reply word reported to callers for this outcome.
    pub const fn reply_word(self) -> u32 {
        match self {
            Self::Done => reply::DONE,
            Self::ReadReplyPending => reply::READ_REPLY,
            Self::Error => reply::ERROR,
            Self::SystemReset => reply::SYSTEM_RESET,
            Self::ReadoutBusy => reply::READOUT,
        }
    }
}

/// Protocol engine for one ARC board.
#[derive(Debug, Clone)]
pub struct ArcEngine {
    regs: Registers,
    budget: WaitBudget,
}

impl ArcEngine {
    /// Engine over a register window.
    pub const fn new(regs: Registers, budget: WaitBudget) -> Self {
        Self { regs, budget }
    }

    /// Underlying register window.
    pub const fn registers(&self) -> &Registers {
        &self.regs
    }

    /// Raw HSTR.
    pub fn hstr(&self) -> u32 {
        self.regs.read32(HSTR)
    }

    /// Raw HCTR.
    pub fn hctr(&self) -> u32 {
        self.regs.read32(HCTR)
    }

    /// Overwrite HCTR.
    pub fn set_hctr(&self, value: u32) {
        self.regs.write32(HCTR, value);
    }

    /// Whether the reply-flag field reports an image readout.
    pub fn readout_active(&self) -> bool {
        hstr::reply_flags(self.hstr()) == flags::READOUT
    }

    fn wait_hstr(&self, mask: u32) -> Result<u32> {
        poll_until(self.regs.clock(), self.budget, || {
            let hstr = self.hstr();
            (hstr & mask != 0).then_some(hstr)
        })
    }

    /// Wait until the DSP input FIFO can take a word.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::Timeout` if the FIFO stays full.
    pub fn wait_input_ready(&self) -> Result<()> {
        self.wait_hstr(hstr::INPUT_FIFO_READY).map(|_| ())
    }

    /// Wait until the reply FIFO holds a word.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::Timeout` if nothing arrives.
    pub fn wait_output_ready(&self) -> Result<()> {
        self.wait_hstr(hstr::OUTPUT_FIFO_READY).map(|_| ())
    }

    /// Write a vector to HCVR.
    ///
    /// # Errors
    ///
    /// - `Timeout` if the input FIFO never becomes ready
    /// - `Busy` if the previous vector has not been taken
    pub fn send_vector(&self, code: u32) -> Result<()> {
        self.wait_input_ready()?;
        if self.regs.read32(HCVR) & hcvr::COMMAND_BUSY != 0 {
            return Err(DriverError::busy(format!("HCVR busy, vector {code:#x} not sent")));
        }
        self.regs.write32(HCVR, code);
        tracing::trace!("Vector {code:#06x} sent");
        Ok(())
    }

    /// Non-blocking vector write for interrupt context. Returns `false` if
    /// HCVR stayed busy.
    pub fn try_send_vector(&self, code: u32) -> bool {
        for _ in 0..ISR_VECTOR_TRIES {
            if self.regs.read32(HCVR) & hcvr::COMMAND_BUSY == 0 {
                self.regs.write32(HCVR, code);
                return true;
            }
        }
        false
    }

    /// Clear the reply-flag field.
    ///
    /// # Errors
    ///
    /// Propagates [`send_vector`](Self::send_vector) failures.
    pub fn clear_reply_flags(&self) -> Result<()> {
        self.send_vector(vector::CLEAR_REPLY_FLAGS)
    }

    /// Poll the reply-flag field until it is terminal, then clear it unless
    /// a readout is in progress.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::Timeout` if the field never settles.
    pub fn check_reply_flags(&self) -> Result<ReplyStatus> {
        let status = poll_until(self.regs.clock(), self.budget, || {
            ReplyStatus::from_flags(hstr::reply_flags(self.hstr()))
        })?;
        if status != ReplyStatus::ReadoutBusy {
            self.clear_reply_flags()?;
        }
        Ok(status)
    }

    /// Discard stale words from the reply FIFO. Returns how many were
    /// dropped.
    pub fn flush_reply_buffer(&self) -> usize {
        let mut flushed = 0;
        while flushed < REPLY_FIFO_DEPTH && self.hstr() & hstr::OUTPUT_FIFO_READY != 0 {
            let stale = self.regs.read32(REPLY_BUFFER);
            tracing::trace!("Flushed stale reply {stale:#x}");
            flushed += 1;
        }
        flushed
    }

    /// Fetch the pending reply value.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or `Busy` from the vector and FIFO waits.
    pub fn read_reply(&self) -> Result<u32> {
        self.flush_reply_buffer();
        self.send_vector(vector::READ_REPLY_VALUE)?;
        self.wait_output_ready()?;
        Ok(self.regs.read32(REPLY_BUFFER))
    }

    /// Issue a counter vector and read its value as two 16-bit halves, low
    /// half first.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or `Busy` from the vector and FIFO waits.
    pub fn read_counter(&self, code: u32) -> Result<u32> {
        self.send_vector(code)?;
        self.wait_output_ready()?;
        let low = u32::from(self.regs.read16(REPLY_BUFFER));
        let high = u32::from(self.regs.read16(REPLY_BUFFER));
        Ok(high << 16 | low)
    }

    /// Map a terminal status to the reply word, fetching it for `RDR`.
    fn resolve(&self, status: ReplyStatus) -> Result<u32> {
        match status {
            ReplyStatus::ReadReplyPending => self.read_reply(),
            ReplyStatus::Done | ReplyStatus::ReadoutBusy => Ok(status.reply_word()),
            ReplyStatus::Error | ReplyStatus::SystemReset => Err(DriverError::ProtocolError {
                reply: status.reply_word(),
            }),
        }
    }

    /// Issue a bare vector and return its reply.
    ///
    /// Reply flags are cleared first, except for `ABORT_READOUT`, which must
    /// not disturb the readout state it is aborting.
    ///
    /// # Errors
    ///
    /// - `ProtocolError` carrying `ERR` or `SYR`
    /// - `Timeout`/`Busy` from the underlying waits
    pub fn vector_command(&self, code: u32) -> Result<u32> {
        if code != vector::ABORT_READOUT {
            self.clear_reply_flags()?;
        }
        self.send_vector(code)?;
        let status = self.check_reply_flags()?;
        self.resolve(status)
    }

    /// Send a structured command: header word plus up to five arguments.
    ///
    /// Commands whose first argument lacks the readout-allowed bit are
    /// refused while the controller is reading out, before anything is
    /// written.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an empty or oversize command
    /// - `ReadoutConflict` during a readout
    /// - `ProtocolError` carrying `ERR` or `SYR`
    /// - `Timeout`/`Busy` from the underlying waits
    pub fn send_command(&self, words: &[u32]) -> Result<u32> {
        if words.is_empty() || words.len() > MAX_COMMAND_WORDS {
            return Err(DriverError::invalid_argument(format!(
                "command carries {} words, 1..={MAX_COMMAND_WORDS} allowed",
                words.len()
            )));
        }

        let first_arg = words.get(1).copied().unwrap_or(0);
        if first_arg & ALLOWED_DURING_READOUT == 0 && self.readout_active() {
            tracing::debug!("Command {:#x} refused during readout", words[0]);
            return Err(DriverError::ReadoutConflict);
        }

        self.clear_reply_flags()?;
        self.wait_input_ready()?;
        for &w in words {
            self.regs.write32(CMD_DATA, w);
        }
        self.send_vector(vector::WRITE_COMMAND)?;

        let status = self.check_reply_flags()?;
        let reply = self.resolve(status);
        tracing::debug!("Command {:#x} → {reply:x?}", words[0]);
        reply
    }

    /// Queue one raw data word.
    pub fn write_data(&self, word: u32) {
        self.regs.write32(CMD_DATA, word);
    }

    /// Tell the DSP where the image buffer lives.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an address above 4 GiB
    /// - `ProtocolError` if the DSP does not answer `DON`
    /// - `Timeout`/`Busy` from the underlying waits
    pub fn set_buffer_address(&self, bus_address: u64) -> Result<()> {
        let addr = u32::try_from(bus_address).map_err(|_| {
            DriverError::invalid_argument(format!("image buffer {bus_address:#x} above 32-bit bus range"))
        })?;

        self.clear_reply_flags()?;
        self.wait_input_ready()?;
        #[allow(clippy::cast_possible_truncation)]
        {
            self.regs.write16(CMD_DATA, (addr & 0xFFFF) as u16);
            self.regs.write16(CMD_DATA, (addr >> 16) as u16);
        }
        self.send_vector(vector::WRITE_PCI_ADDRESS)?;

        match self.check_reply_flags()? {
            ReplyStatus::Done => {
                tracing::debug!("Image buffer address {addr:#x} latched");
                Ok(())
            }
            other => Err(DriverError::ProtocolError {
                reply: other.reply_word(),
            }),
        }
    }

    /// Start a firmware download. No reply is expected.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or `Busy` from the vector write.
    pub fn start_download(&self) -> Result<()> {
        self.send_vector(vector::PCI_DOWNLOAD)
    }

    /// Wait for a firmware download to finish and return its reply word.
    ///
    /// # Errors
    ///
    /// - `ProtocolError` carrying `ERR` or `SYR`
    /// - `Timeout` if the DSP never reports
    pub fn wait_download(&self) -> Result<u32> {
        match self.check_reply_flags()? {
            status @ (ReplyStatus::Error | ReplyStatus::SystemReset) => {
                Err(DriverError::ProtocolError {
                    reply: status.reply_word(),
                })
            }
            status => Ok(status.reply_word()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ArcReply, SimArc};
    use crate::timing::{Clock, VirtualClock};
    use std::sync::Arc;
    use std::time::Duration;

    fn engine(sim: &Arc<SimArc>) -> (ArcEngine, Arc<VirtualClock>) {
        let clock = Arc::new(VirtualClock::new());
        let regs = Registers::new(sim.clone(), clock.clone(), Duration::ZERO);
        let budget = WaitBudget {
            busy_step: Duration::from_micros(1),
            busy_max: Duration::from_micros(20),
            sleep_step: Duration::from_millis(1),
            overall_max: Duration::from_millis(10),
        };
        (ArcEngine::new(regs, budget), clock)
    }

    #[test]
    fn reply_status_decoding() {
        assert_eq!(ReplyStatus::from_flags(flags::NONE), None);
        assert_eq!(ReplyStatus::from_flags(flags::BUSY), None);
        assert_eq!(
            ReplyStatus::from_flags(flags::READOUT),
            Some(ReplyStatus::ReadoutBusy)
        );
        assert_eq!(ReplyStatus::Done.reply_word(), reply::DONE);
    }

    #[test]
    fn busy_hcvr_refuses_vector() {
        let sim = Arc::new(SimArc::new());
        sim.set_hcvr_busy(true);
        let (e, _) = engine(&sim);
        assert!(matches!(
            e.send_vector(vector::RESET_CONTROLLER),
            Err(DriverError::Busy { .. })
        ));
        assert!(sim.vectors().is_empty());
    }

    #[test]
    fn stuck_input_fifo_times_out_within_budget() {
        let sim = Arc::new(SimArc::new());
        sim.set_input_stuck(true);
        let (e, clock) = engine(&sim);
        assert!(matches!(
            e.send_vector(vector::RESET_CONTROLLER),
            Err(DriverError::Timeout { .. })
        ));
        let waited = clock.elapsed();
        assert!(waited >= Duration::from_millis(10));
        assert!(waited < Duration::from_millis(12));
        assert!(clock.sleep_pauses() > 0);
    }

    #[test]
    fn readout_refuses_unflagged_command_without_writing() {
        let sim = Arc::new(SimArc::new());
        sim.set_readout(true);
        let (e, _) = engine(&sim);

        assert!(matches!(
            e.send_command(&[0x0203, 0x0001]),
            Err(DriverError::ReadoutConflict)
        ));
        assert!(sim.vectors().is_empty());
        assert!(sim.commands().is_empty());
    }

    #[test]
    fn oversize_command_rejected() {
        let sim = Arc::new(SimArc::new());
        let (e, _) = engine(&sim);
        assert!(matches!(
            e.send_command(&[0; 7]),
            Err(DriverError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn value_reply_fetched_once() {
        let sim = Arc::new(SimArc::new());
        sim.respond_with(|_| ArcReply::Value(0x1234));
        let (e, _) = engine(&sim);

        assert_eq!(e.send_command(&[0x0202, 0x0000_4444]).unwrap(), 0x1234);
        assert_eq!(sim.reply_reads(), 1);
        assert_eq!(e.check_reply_flags().unwrap(), ReplyStatus::Done);
    }

    #[test]
    fn error_reply_is_protocol_error() {
        let sim = Arc::new(SimArc::new());
        sim.respond_with(|_| ArcReply::Error);
        let (e, _) = engine(&sim);
        assert!(matches!(
            e.send_command(&[0x0202, 0]),
            Err(DriverError::ProtocolError { reply }) if reply == reply::ERROR
        ));
    }

    #[test]
    fn buffer_address_written_low_half_first() {
        let sim = Arc::new(SimArc::new());
        let (e, _) = engine(&sim);
        e.set_buffer_address(0x1234_5678).unwrap();
        assert_eq!(sim.latched_address(), Some(0x1234_5678));
        assert!(e.set_buffer_address(1 << 33).is_err());
    }

    #[test]
    fn flush_is_bounded_by_fifo_depth() {
        let sim = Arc::new(SimArc::new());
        sim.push_stale_replies(10);
        let (e, _) = engine(&sim);
        assert_eq!(e.flush_reply_buffer(), REPLY_FIFO_DEPTH);
    }

    #[test]
    fn counters_combine_halves() {
        let sim = Arc::new(SimArc::new());
        sim.set_pixel_count(0x0003_0010);
        let (e, _) = engine(&sim);
        assert_eq!(e.read_counter(vector::READ_PCI_IMAGE_ADDR).unwrap(), 0x0003_0010);
    }
}
