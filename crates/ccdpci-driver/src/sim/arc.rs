//! ARC DSP host-interface model.

use super::{guard, InterruptLine};
use crate::mmio::RegisterIo;
use ccdpci_chip::arc::{flags, hcvr, hstr, vector, CMD_DATA, HCTR, HCVR, HSTR, REPLY_BUFFER};
use std::collections::VecDeque;
use std::sync::Mutex;

/// How the simulated DSP answers a structured command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcReply {
    /// `DON`
    Done,
    /// `RDR`, then this value on `READ_REPLY_VALUE`.
    Value(u32),
    /// `ERR`
    Error,
    /// `SYR`
    Reset,
    /// Reply flags never settle.
    Silent,
}

type Responder = Box<dyn FnMut(&[u32]) -> ArcReply + Send>;

#[derive(Debug, Default)]
struct Regs {
    hctr: u32,
    flags: u32,
    hcvr_busy: bool,
    input_stuck: bool,
    readout: bool,
    dma_irq: bool,
    /// `RDR` stays up until the value is popped.
    rdr_hold: bool,
    pending_value: u32,
    value_queued: bool,
    reply_fifo: VecDeque<u32>,
    cmd_data: Vec<u32>,
    vectors: Vec<u32>,
    commands: Vec<Vec<u32>>,
    reply_reads: usize,
    latched: Option<u32>,
    pixel_count: u32,
    frames_read: u32,
}

/// Simulated ARC board: the five host-interface registers and the DSP
/// behaviour behind them.
pub struct SimArc {
    regs: Mutex<Regs>,
    responder: Mutex<Responder>,
    line: Mutex<Option<InterruptLine>>,
}

impl std::fmt::Debug for SimArc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimArc")
            .field("regs", &*guard(&self.regs))
            .finish_non_exhaustive()
    }
}

impl Default for SimArc {
    fn default() -> Self {
        Self::new()
    }
}

impl SimArc {
    /// Idle board answering every command with `DON`.
    pub fn new() -> Self {
        Self {
            regs: Mutex::new(Regs::default()),
            responder: Mutex::new(Box::new(|_| ArcReply::Done)),
            line: Mutex::new(None),
        }
    }

    /// Answer structured commands with `f(words)`.
    pub fn respond_with(&self, f: impl FnMut(&[u32]) -> ArcReply + Send + 'static) {
        *guard(&self.responder) = Box::new(f);
    }

    /// Route [`raise_dma_interrupt`](Self::raise_dma_interrupt) through `line`.
    pub fn attach(&self, line: InterruptLine) {
        *guard(&self.line) = Some(line);
    }

    /// Hold HCVR busy.
    pub fn set_hcvr_busy(&self, busy: bool) {
        guard(&self.regs).hcvr_busy = busy;
    }

    /// Keep the input FIFO full.
    pub fn set_input_stuck(&self, stuck: bool) {
        guard(&self.regs).input_stuck = stuck;
    }

    /// Report an image readout in the reply-flag field.
    pub fn set_readout(&self, readout: bool) {
        guard(&self.regs).readout = readout;
    }

    /// Pixel counter reported by `READ_PCI_IMAGE_ADDR`.
    pub fn set_pixel_count(&self, count: u32) {
        guard(&self.regs).pixel_count = count;
    }

    /// Frame counter reported by `READ_NUMBER_OF_FRAMES_READ`.
    pub fn set_frames_read(&self, frames: u32) {
        guard(&self.regs).frames_read = frames;
    }

    /// Leave `n` leftover words in the reply FIFO.
    pub fn push_stale_replies(&self, n: usize) {
        let mut regs = guard(&self.regs);
        for i in 0..n {
            regs.reply_fifo.push_back(0xDEAD_0000 | i as u32);
        }
    }

    /// Vectors written to HCVR, in order.
    pub fn vectors(&self) -> Vec<u32> {
        guard(&self.regs).vectors.clone()
    }

    /// Word lists executed by `WRITE_COMMAND`.
    pub fn commands(&self) -> Vec<Vec<u32>> {
        guard(&self.regs).commands.clone()
    }

    /// `READ_REPLY_VALUE` vectors received.
    pub fn reply_reads(&self) -> usize {
        guard(&self.regs).reply_reads
    }

    /// Image buffer address latched by `WRITE_PCI_ADDRESS`.
    pub fn latched_address(&self) -> Option<u32> {
        guard(&self.regs).latched
    }

    /// Current HCTR.
    pub fn hctr(&self) -> u32 {
        guard(&self.regs).hctr
    }

    /// Whether the image-DMA interrupt is still asserted.
    pub fn dma_interrupt_pending(&self) -> bool {
        guard(&self.regs).dma_irq
    }

    /// Assert the image-DMA interrupt. Returns `true` once the handlers
    /// have run; `false` when no line is attached.
    pub fn raise_dma_interrupt(&self) -> bool {
        guard(&self.regs).dma_irq = true;
        let line = guard(&self.line).clone();
        line.is_some_and(|l| l.raise())
    }

    fn hstr(regs: &Regs) -> u32 {
        let mut v = 0;
        if !regs.input_stuck {
            v |= hstr::INPUT_FIFO_READY;
        }
        if !regs.reply_fifo.is_empty() {
            v |= hstr::OUTPUT_FIFO_READY;
        }
        let field = if regs.readout { flags::READOUT } else { regs.flags };
        v |= field << hstr::REPLY_FLAGS_SHIFT;
        if regs.dma_irq {
            v |= hstr::DMA_INTERRUPTING;
        }
        v
    }

    fn pop_reply(&self) -> u32 {
        let mut regs = guard(&self.regs);
        let word = regs.reply_fifo.pop_front().unwrap_or(0);
        if regs.value_queued && regs.reply_fifo.is_empty() {
            regs.value_queued = false;
            regs.rdr_hold = false;
            regs.flags = flags::DONE;
        }
        word
    }

    fn push_counter(regs: &mut Regs, value: u32) {
        regs.reply_fifo.push_back(value & 0xFFFF);
        regs.reply_fifo.push_back(value >> 16);
        regs.flags = flags::DONE;
    }

    fn execute(&self, code: u32) {
        let mut regs = guard(&self.regs);
        regs.vectors.push(code);
        match code {
            vector::CLEAR_REPLY_FLAGS => {
                if !regs.rdr_hold {
                    regs.flags = flags::NONE;
                }
            }
            vector::WRITE_COMMAND => {
                let words = std::mem::take(&mut regs.cmd_data);
                regs.commands.push(words.clone());
                drop(regs);
                let answer = {
                    let mut respond = guard(&self.responder);
                    (*respond)(&words)
                };
                let mut regs = guard(&self.regs);
                match answer {
                    ArcReply::Done => regs.flags = flags::DONE,
                    ArcReply::Value(v) => {
                        regs.flags = flags::READ_REPLY;
                        regs.rdr_hold = true;
                        regs.pending_value = v;
                    }
                    ArcReply::Error => regs.flags = flags::ERROR,
                    ArcReply::Reset => regs.flags = flags::SYSTEM_RESET,
                    ArcReply::Silent => regs.flags = flags::NONE,
                }
            }
            vector::READ_REPLY_VALUE => {
                let v = regs.pending_value;
                regs.reply_fifo.push_back(v);
                regs.value_queued = true;
                regs.reply_reads += 1;
            }
            vector::WRITE_PCI_ADDRESS => {
                let words = std::mem::take(&mut regs.cmd_data);
                if let [low, high, ..] = words[..] {
                    regs.latched = Some((high & 0xFFFF) << 16 | (low & 0xFFFF));
                    regs.flags = flags::DONE;
                } else {
                    regs.flags = flags::ERROR;
                }
            }
            vector::READ_PCI_IMAGE_ADDR => {
                let v = regs.pixel_count;
                Self::push_counter(&mut regs, v);
            }
            vector::READ_NUMBER_OF_FRAMES_READ => {
                let v = regs.frames_read;
                Self::push_counter(&mut regs, v);
            }
            vector::CLEAR_INTERRUPT => regs.dma_irq = false,
            vector::ABORT_READOUT => {
                regs.readout = false;
                regs.flags = flags::DONE;
            }
            _ => regs.flags = flags::DONE,
        }
    }
}

impl RegisterIo for SimArc {
    fn read32(&self, offset: usize) -> u32 {
        match offset {
            HSTR => Self::hstr(&guard(&self.regs)),
            HCTR => guard(&self.regs).hctr,
            HCVR => {
                if guard(&self.regs).hcvr_busy {
                    hcvr::COMMAND_BUSY
                } else {
                    0
                }
            }
            REPLY_BUFFER => self.pop_reply(),
            _ => 0,
        }
    }

    fn read16(&self, offset: usize) -> u16 {
        #[allow(clippy::cast_possible_truncation)]
        let half = (self.read32(offset) & 0xFFFF) as u16;
        half
    }

    fn write32(&self, offset: usize, value: u32) {
        match offset {
            HCTR => guard(&self.regs).hctr = value,
            HCVR => self.execute(value),
            CMD_DATA => guard(&self.regs).cmd_data.push(value),
            _ => {}
        }
    }

    fn write16(&self, offset: usize, value: u16) {
        self.write32(offset, u32::from(value));
    }
}
