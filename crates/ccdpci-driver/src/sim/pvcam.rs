//! PVCAM interface model: the S5933 operation registers, the command FIFO
//! and a bus-master engine that walks the scatter-gather table.

use super::{guard, InterruptLine, SimBusMemory};
use crate::mmio::RegisterIo;
use ccdpci_chip::bar::pvcam::{BAR_COUNT, FIFO_BAR, FLASH_BAR, OPERATION_BAR, TABLE_BAR};
use ccdpci_chip::pvcam::{
    mail, FLASH_LOAD, FRAME_HEADER_LEN, INTCSR, MAILBOX2, MAILBOX4, MAILSTATUS, MAIL_FOR_US,
    MASTERCSR, MASTERRESET, OUR_PCI_INTERRUPT, OUTMAILBOX2, TABLE_ENTRY_SIZE,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// How the simulated camera answers one command frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimResponse {
    /// Reply bytes; a read acknowledge follows only when non-empty.
    pub reply: Vec<u8>,
    /// Link error bits carried in both acknowledges.
    pub error_bits: u32,
    /// Send no acknowledge at all.
    pub silent: bool,
}

impl SimResponse {
    /// Write acknowledge only.
    pub fn ack() -> Self {
        Self::default()
    }

    /// Write acknowledge, then `bytes` behind a read acknowledge.
    pub fn reply(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            reply: bytes.into(),
            ..Self::default()
        }
    }

    /// Acknowledges carrying link error `bits`, with `reply_len` junk bytes.
    pub fn error(bits: u32, reply_len: usize) -> Self {
        Self {
            reply: vec![0xEE; reply_len],
            error_bits: bits & mail::COMM_ERROR_MASK,
            silent: false,
        }
    }

    /// No acknowledge.
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }
}

/// A command frame as received by the camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimFrame {
    /// Class byte.
    pub class: u8,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

type Responder = Box<dyn FnMut(&SimFrame) -> SimResponse + Send>;

#[derive(Debug, Default)]
struct Regs {
    mail: VecDeque<u32>,
    incoming: Vec<u8>,
    reply_fifo: VecDeque<u32>,
    frames: Vec<SimFrame>,
    table: Option<u32>,
    firmware: u32,
    flash_mode: bool,
    flash: Vec<u16>,
    intcsr: u32,
    master_resets: usize,
}

/// Simulated PVCAM board.
pub struct SimPvcam {
    regs: Mutex<Regs>,
    responder: Mutex<Responder>,
    line: Mutex<Option<InterruptLine>>,
}

impl std::fmt::Debug for SimPvcam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimPvcam")
            .field("regs", &*guard(&self.regs))
            .finish_non_exhaustive()
    }
}

/// One BAR of a [`SimPvcam`].
#[derive(Debug)]
struct SimPort {
    sim: Arc<SimPvcam>,
    bar: usize,
}

impl RegisterIo for SimPort {
    fn read32(&self, offset: usize) -> u32 {
        self.sim.read(self.bar, offset)
    }

    fn read16(&self, offset: usize) -> u16 {
        #[allow(clippy::cast_possible_truncation)]
        let half = (self.sim.read(self.bar, offset) & 0xFFFF) as u16;
        half
    }

    fn write32(&self, offset: usize, value: u32) {
        self.sim.write(self.bar, offset, value, 4);
    }

    fn write16(&self, offset: usize, value: u16) {
        self.sim.write(self.bar, offset, u32::from(value), 2);
    }
}

impl SimPvcam {
    /// Camera acknowledging every command without reply data.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            regs: Mutex::new(Regs {
                firmware: 0x0000_0102,
                ..Regs::default()
            }),
            responder: Mutex::new(Box::new(|_| SimResponse::ack())),
            line: Mutex::new(None),
        })
    }

    /// The four I/O windows, in BAR order.
    pub fn ports(self: &Arc<Self>) -> [Arc<dyn RegisterIo>; BAR_COUNT] {
        [OPERATION_BAR, FIFO_BAR, TABLE_BAR, FLASH_BAR].map(|bar| {
            let port: Arc<dyn RegisterIo> = Arc::new(SimPort {
                sim: Arc::clone(self),
                bar,
            });
            port
        })
    }

    /// Answer command frames with `f(frame)`.
    pub fn respond_with(&self, f: impl FnMut(&SimFrame) -> SimResponse + Send + 'static) {
        *guard(&self.responder) = Box::new(f);
    }

    /// Raise mailbox interrupts through `line`.
    pub fn attach(&self, line: InterruptLine) {
        *guard(&self.line) = Some(line);
    }

    /// Firmware revision shown in mailbox 4.
    pub fn set_firmware_revision(&self, rev: u32) {
        guard(&self.regs).firmware = rev;
    }

    /// Frames received, in order.
    pub fn frames(&self) -> Vec<SimFrame> {
        guard(&self.regs).frames.clone()
    }

    /// Bus address last written to the table port.
    pub fn table_address(&self) -> Option<u32> {
        guard(&self.regs).table
    }

    /// Words streamed to the flash port since flash-load mode was entered.
    pub fn flash_words(&self) -> Vec<u16> {
        guard(&self.regs).flash.clone()
    }

    /// Mailbox resets seen.
    pub fn master_resets(&self) -> usize {
        guard(&self.regs).master_resets
    }

    /// Last value written to INTCSR.
    pub fn intcsr(&self) -> u32 {
        guard(&self.regs).intcsr
    }

    /// DMA `pixels` through the programmed table, then post the
    /// frame-complete mailbox. Returns the bytes written.
    pub fn complete_exposure(&self, memory: &SimBusMemory, pixels: &[u8]) -> usize {
        let Some(table) = self.table_address() else {
            return 0;
        };
        let mut written = 0;
        let mut at = u64::from(table);
        while written < pixels.len() {
            let Some(raw) = memory.read_bus(at, TABLE_ENTRY_SIZE) else {
                break;
            };
            let bus = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let size = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
            if bus == 0 || size == 0 {
                break;
            }
            let n = size.min(pixels.len() - written);
            if !memory.write_bus(u64::from(bus), &pixels[written..written + n]) {
                break;
            }
            written += n;
            at += TABLE_ENTRY_SIZE as u64;
        }
        self.post(&[0]);
        written
    }

    /// Post a DMA-event mailbox carrying `payload`.
    pub fn fail_exposure(&self, payload: u32) {
        self.post(&[payload & !mail::COMMAND_COMPLETE]);
    }

    /// Queue mailbox payloads, raising one interrupt per payload.
    fn post(&self, payloads: &[u32]) {
        let line = guard(&self.line).clone();
        for &payload in payloads {
            guard(&self.regs).mail.push_back(payload);
            if let Some(line) = &line {
                line.raise();
            }
        }
    }

    fn read(&self, bar: usize, offset: usize) -> u32 {
        let mut regs = guard(&self.regs);
        match (bar, offset) {
            (OPERATION_BAR, INTCSR) => {
                if regs.mail.is_empty() {
                    regs.intcsr
                } else {
                    regs.intcsr | OUR_PCI_INTERRUPT
                }
            }
            (OPERATION_BAR, MAILSTATUS) => {
                if regs.mail.is_empty() {
                    0
                } else {
                    MAIL_FOR_US
                }
            }
            (OPERATION_BAR, MAILBOX2) => regs.mail.pop_front().unwrap_or(0),
            (OPERATION_BAR, MAILBOX4) => regs.firmware,
            (FIFO_BAR, _) => regs.reply_fifo.pop_front().unwrap_or(0),
            _ => 0,
        }
    }

    fn write(&self, bar: usize, offset: usize, value: u32, width: usize) {
        let frame = {
            let mut regs = guard(&self.regs);
            match (bar, offset) {
                (OPERATION_BAR, INTCSR) => regs.intcsr = value & !OUR_PCI_INTERRUPT,
                (OPERATION_BAR, MASTERCSR) => {
                    if value == MASTERRESET {
                        regs.master_resets += 1;
                        regs.incoming.clear();
                        regs.reply_fifo.clear();
                    }
                }
                (OPERATION_BAR, OUTMAILBOX2) => {
                    if value == FLASH_LOAD {
                        regs.flash_mode = true;
                        regs.flash.clear();
                    }
                }
                (FIFO_BAR, _) if width == 4 => {
                    regs.incoming.extend_from_slice(&value.to_be_bytes());
                }
                (TABLE_BAR, _) => regs.table = Some(value),
                (FLASH_BAR, _) if regs.flash_mode => {
                    #[allow(clippy::cast_possible_truncation)]
                    regs.flash.push(value as u16);
                }
                _ => {}
            }
            Self::take_frame(&mut regs)
        };
        if let Some(frame) = frame {
            self.answer(frame);
        }
    }

    /// Cut a complete frame (header, payload, word padding) off the
    /// incoming bytes.
    fn take_frame(regs: &mut Regs) -> Option<SimFrame> {
        if regs.incoming.len() < FRAME_HEADER_LEN {
            return None;
        }
        let len = usize::from(u16::from_be_bytes([regs.incoming[1], regs.incoming[2]]));
        let padded = (FRAME_HEADER_LEN + len).div_ceil(4) * 4;
        if regs.incoming.len() < padded {
            return None;
        }
        let bytes: Vec<u8> = regs.incoming.drain(..padded).collect();
        Some(SimFrame {
            class: bytes[0],
            payload: bytes[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec(),
        })
    }

    fn answer(&self, frame: SimFrame) {
        let response = {
            let mut respond = guard(&self.responder);
            (*respond)(&frame)
        };
        guard(&self.regs).frames.push(frame);
        if response.silent {
            return;
        }

        let ack = mail::COMMAND_COMPLETE | response.error_bits;
        if response.reply.is_empty() {
            self.post(&[ack]);
            return;
        }
        {
            let mut regs = guard(&self.regs);
            for chunk in response.reply.chunks(4) {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                regs.reply_fifo.push_back(u32::from_be_bytes(word));
            }
        }
        self.post(&[ack, ack]);
    }
}
