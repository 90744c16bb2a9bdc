//! ARC sessions
//!
//! An [`ArcSession`] is the exclusive handle a caller gets from
//! [`BoardTable::open_arc`]. Dropping it closes the board.

use super::engine::ArcEngine;
use super::mapping::{ImageBuffer, MapAttributes};
use crate::board::{lock, Binding, Board, BoardTable};
use crate::error::{DriverError, Result};
use crate::mmio::MappedRegion;
use crate::pci::ConfigWidth;
use crate::user::UserBuffer;
use ccdpci_chip::arc::{
    hctr, opcode, reply, vector, CONFIG_LATENCY_TIMER, LATENCY_TIMER_VALUE, MAX_COMMAND_WORDS,
};
use std::sync::{Arc, Mutex};

/// Per-board state guarded by the board gate.
#[derive(Debug, Default)]
pub struct ArcState {
    image: Option<ImageBuffer>,
}

/// Exclusive session on one ARC board.
#[derive(Debug)]
pub struct ArcSession {
    table: Arc<BoardTable>,
    board: Arc<Board>,
    engine: ArcEngine,
    state: Arc<Mutex<ArcState>>,
}

impl ArcSession {
    /// Bring up a claimed board. The claim is released on failure.
    pub(crate) fn start(table: Arc<BoardTable>, board: Arc<Board>) -> Result<Self> {
        let Binding::Arc { engine, state } = &board.binding else {
            board.release_claim();
            return Err(DriverError::NoSuchDevice {
                index: board.index(),
            });
        };
        let session = Self {
            engine: engine.clone(),
            state: Arc::clone(state),
            table,
            board,
        };

        {
            let mut st = lock(&session.state);
            session.release_image(&mut st);
            session.board.shared.reset();

            match session.board.config_space() {
                Ok(cfg) => {
                    if let Err(e) = cfg.write(CONFIG_LATENCY_TIMER, ConfigWidth::Byte, LATENCY_TIMER_VALUE) {
                        tracing::warn!("{}: latency timer not set: {e}", session.board.name());
                    }
                }
                Err(e) => tracing::debug!("{e}"),
            }
            session.engine.set_hctr(hctr::configured(session.engine.hctr()));
            session.engine.flush_reply_buffer();
        }

        tracing::info!("Opened {} (board {})", session.board.name(), session.board.index());
        Ok(session)
    }

    /// Board this session owns.
    pub fn board(&self) -> &Board {
        &self.board
    }

    /// Protocol engine, for direct register-level work.
    pub const fn engine(&self) -> &ArcEngine {
        &self.engine
    }

    /// Current image buffer, if one is mapped.
    pub fn image_buffer(&self) -> Option<ImageBuffer> {
        lock(&self.state).image
    }

    /// Read HCTR.
    pub fn hctr(&self) -> u32 {
        let _gate = lock(&self.state);
        self.engine.hctr()
    }

    /// Write HCTR.
    pub fn set_hctr(&self, value: u32) {
        let _gate = lock(&self.state);
        self.engine.set_hctr(value);
    }

    /// Read HSTR.
    pub fn hstr(&self) -> u32 {
        let _gate = lock(&self.state);
        self.engine.hstr()
    }

    /// Issue a vector and return its reply word.
    ///
    /// # Errors
    ///
    /// See [`ArcEngine::vector_command`].
    pub fn vector(&self, code: u32) -> Result<u32> {
        let _gate = lock(&self.state);
        self.engine.vector_command(code)
    }

    /// Send a structured command and return its reply word.
    ///
    /// # Errors
    ///
    /// See [`ArcEngine::send_command`].
    pub fn command(&self, words: &[u32]) -> Result<u32> {
        let _gate = lock(&self.state);
        self.engine.send_command(words)
    }

    /// Queue one data word once the input FIFO has room.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the input FIFO stays full.
    pub fn hcvr_data(&self, word: u32) -> Result<()> {
        let _gate = lock(&self.state);
        self.engine.wait_input_ready()?;
        self.engine.write_data(word);
        Ok(())
    }

    /// Start a firmware download.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or `Busy` from the vector write.
    pub fn download(&self) -> Result<()> {
        let _gate = lock(&self.state);
        self.engine.start_download()
    }

    /// Wait for the download to finish.
    ///
    /// # Errors
    ///
    /// See [`ArcEngine::wait_download`].
    pub fn download_wait(&self) -> Result<u32> {
        let _gate = lock(&self.state);
        self.engine.wait_download()
    }

    /// Pixels transferred so far in the current frame.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or `Busy` from the vector and FIFO waits.
    pub fn progress(&self) -> Result<u32> {
        let _gate = lock(&self.state);
        self.engine.read_counter(vector::READ_PCI_IMAGE_ADDR)
    }

    /// Frames transferred so far in the current sequence.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or `Busy` from the vector and FIFO waits.
    pub fn frames_read(&self) -> Result<u32> {
        let _gate = lock(&self.state);
        self.engine.read_counter(vector::READ_NUMBER_OF_FRAMES_READ)
    }

    /// Read PCI configuration space.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` without a config space, or the access error.
    pub fn config_read(&self, offset: u32, width: ConfigWidth) -> Result<u32> {
        self.board.config_space()?.read(offset, width)
    }

    /// Write PCI configuration space.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` without a config space, or the access error.
    pub fn config_write(&self, offset: u32, width: ConfigWidth, value: u32) -> Result<()> {
        self.board.config_space()?.write(offset, width, value)
    }

    /// Bind `len` bytes at the caller's `virt` to a fresh image buffer and
    /// tell the DSP where it lives.
    ///
    /// Any previous buffer goes back to the region first. On failure no
    /// buffer is recorded and nothing stays claimed.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument`/`OutOfMemory` from the image region
    /// - protocol errors from the address handshake
    pub fn map_image_buffer(&self, virt: usize, len: usize) -> Result<ImageBuffer> {
        self.bind_image(len, |_| Ok(virt))
    }

    /// Map a fresh image buffer into this process through `/dev/mem`.
    ///
    /// # Errors
    ///
    /// As [`map_image_buffer`](Self::map_image_buffer), plus mapping errors.
    pub fn map_host_image_buffer(&self, len: usize) -> Result<(ImageBuffer, MappedRegion)> {
        let mut region = None;
        let image = self.bind_image(len, |phys| {
            let mapped = MappedRegion::map_physical(phys, len)?;
            let virt = mapped.as_ptr() as usize;
            region = Some(mapped);
            Ok(virt)
        })?;
        region.map(|r| (image, r)).ok_or(DriverError::NotMapped)
    }

    fn bind_image(&self, len: usize, map: impl FnOnce(u64) -> Result<usize>) -> Result<ImageBuffer> {
        let mut st = lock(&self.state);
        self.release_image(&mut st);

        let phys = self.table.arena().claim(len)?;
        let bound = map(phys).and_then(|virt| {
            self.engine.set_buffer_address(phys)?;
            Ok(virt)
        });
        let virt = match bound {
            Ok(virt) => virt,
            Err(e) => {
                self.table.arena().release(phys);
                return Err(e);
            }
        };

        let image = ImageBuffer {
            phys,
            virt,
            size: len,
            attributes: MapAttributes::DMA_IMAGE,
        };
        st.image = Some(image);
        tracing::info!(
            "{}: image buffer {len} bytes at bus {phys:#x}",
            self.board.name()
        );
        Ok(image)
    }

    fn release_image(&self, st: &mut ArcState) {
        if let Some(image) = st.image.take() {
            self.table.arena().release(image.phys);
        }
    }

    /// Raw control-call dispatcher. `arg` carries the request words in and
    /// the response words out, native-endian.
    ///
    /// A fault on `arg` resets the protocol state before the error returns.
    /// The image buffer mapping survives the reset, unlike on PVCAM boards
    /// where a fault also drops the DMA chain.
    ///
    /// # Errors
    ///
    /// - `Unsupported` for an unknown opcode
    /// - `UserCopyFault` if `arg` cannot be accessed
    /// - any error of the operation the opcode selects
    pub fn ioctl(&self, op: u32, arg: &mut dyn UserBuffer) -> Result<()> {
        let result = self.dispatch(op, arg);
        if let Err(DriverError::UserCopyFault { .. }) = &result {
            self.reset_after_fault();
        }
        result
    }

    fn dispatch(&self, op: u32, arg: &mut dyn UserBuffer) -> Result<()> {
        let image = self.image_buffer();
        match op {
            opcode::GET_HCTR => arg.put_u32(0, self.hctr()),
            opcode::GET_HSTR => arg.put_u32(0, self.hstr()),
            opcode::GET_PROGRESS => arg.put_u32(0, self.progress()?),
            opcode::GET_FRAMES_READ => arg.put_u32(0, self.frames_read()?),
            opcode::GET_DMA_ADDR | opcode::GET_DMA_LO_ADDR => {
                #[allow(clippy::cast_possible_truncation)]
                let lo = image.map_or(0, |i| i.phys as u32);
                arg.put_u32(0, lo)
            }
            opcode::GET_DMA_HI_ADDR => {
                #[allow(clippy::cast_possible_truncation)]
                let hi = image.map_or(0, |i| (i.phys >> 32) as u32);
                arg.put_u32(0, hi)
            }
            opcode::GET_DMA_SIZE => {
                let size = image.map_or(0, |i| u32::try_from(i.size).unwrap_or(u32::MAX));
                arg.put_u32(0, size)
            }
            opcode::SET_HCTR => {
                let v = arg.get_u32(0)?;
                self.set_hctr(v);
                Ok(())
            }
            opcode::HCVR_DATA => self.hcvr_data(arg.get_u32(0)?),
            opcode::SET_HCVR => {
                let code = arg.get_u32(0)?;
                let reply = self.vector(code);
                write_reply(arg, 0, reply)
            }
            opcode::PCI_DOWNLOAD => self.download(),
            opcode::PCI_DOWNLOAD_WAIT => {
                let reply = self.download_wait();
                write_reply(arg, 0, reply)
            }
            opcode::COMMAND => self.command_ioctl(arg),
            opcode::GET_CONFIG_BYTE | opcode::GET_CONFIG_WORD | opcode::GET_CONFIG_DWORD => {
                let width = config_width(op - opcode::GET_CONFIG_BYTE);
                let value = self.config_read(arg.get_u32(0)?, width)?;
                arg.put_u32(0, value)
            }
            opcode::SET_CONFIG_BYTE | opcode::SET_CONFIG_WORD | opcode::SET_CONFIG_DWORD => {
                let width = config_width(op - opcode::SET_CONFIG_BYTE);
                let offset = arg.get_u32(0)?;
                let value = arg.get_u32(1)?;
                self.config_write(offset, width, value)
            }
            other => Err(DriverError::Unsupported { opcode: other }),
        }
    }

    fn command_ioctl(&self, arg: &mut dyn UserBuffer) -> Result<()> {
        let mut words = [0u32; MAX_COMMAND_WORDS];
        arg.copy_from_user(0, bytemuck::cast_slice_mut(&mut words[..]))?;

        let count = (words[0] & 0xFF) as usize;
        if count > MAX_COMMAND_WORDS {
            return Err(DriverError::invalid_argument(format!(
                "command claims {count} words"
            )));
        }

        let reply = self.command(&words[..count]);
        if let Some(r) = reply_word(&reply) {
            words[0] = r;
            arg.copy_to_user(0, bytemuck::cast_slice(&words[..]))?;
        }
        reply.map(|_| ())
    }

    fn reset_after_fault(&self) {
        let _gate = lock(&self.state);
        self.board.shared.reset();
        self.engine.flush_reply_buffer();
        tracing::warn!("{}: caller buffer fault, protocol state reset", self.board.name());
    }
}

/// Word a caller sees for a finished exchange. Failed waits read back as `TOUT`.
fn reply_word(outcome: &Result<u32>) -> Option<u32> {
    match outcome {
        Ok(r) | Err(DriverError::ProtocolError { reply: r }) => Some(*r),
        Err(DriverError::Timeout { .. } | DriverError::Busy { .. }) => Some(reply::TIMEOUT),
        Err(_) => None,
    }
}

/// Store the reply word of `outcome`, then pass the result on.
fn write_reply(arg: &mut dyn UserBuffer, index: usize, outcome: Result<u32>) -> Result<()> {
    if let Some(r) = reply_word(&outcome) {
        arg.put_u32(index, r)?;
    }
    outcome.map(|_| ())
}

const fn config_width(step: u32) -> ConfigWidth {
    match step {
        0 => ConfigWidth::Byte,
        1 => ConfigWidth::Word,
        _ => ConfigWidth::Dword,
    }
}

impl Drop for ArcSession {
    fn drop(&mut self) {
        {
            let mut st = lock(&self.state);
            self.release_image(&mut st);
        }
        self.board.shared.reset();
        self.board.release_claim();
        tracing::info!("Closed {}", self.board.name());
    }
}
