//! PVCAM sessions

use super::acquisition::{Acquisition, ImageStatusReport};
use super::transport::{self, PvcamPorts, Transfer, WriteRead, WriteReadHeader};
use crate::board::{lock, Binding, Board};
use crate::dma::ScatterGatherTable;
use crate::error::{DriverError, Result};
use crate::user::{PixelSink, UserBuffer};
use ccdpci_chip::pvcam::{
    opcode, DRIVER_VERSION, MAX_FLASH_BYTES, MAX_XFER_SIZE, MIN_XFER_SIZE, PIXTIME,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Retry count reported to the camera library. Retries are not performed.
const MAX_RETRIES: u32 = 1;

/// Per-board state guarded by the board gate.
pub struct PvcamState {
    default_timeout: Duration,
    timeout: Duration,
    max_read_bytes: usize,
    acquisition: Acquisition,
    sg: ScatterGatherTable,
    staged_destination: Option<PixelSink>,
}

impl std::fmt::Debug for PvcamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PvcamState")
            .field("timeout", &self.timeout)
            .field("max_read_bytes", &self.max_read_bytes)
            .field("acquisition", &self.acquisition)
            .field("sg", &self.sg)
            .finish_non_exhaustive()
    }
}

impl PvcamState {
    pub(crate) fn new(sg: ScatterGatherTable, timeout: Duration, max_read_bytes: usize) -> Self {
        Self {
            default_timeout: timeout,
            timeout,
            max_read_bytes,
            acquisition: Acquisition::default(),
            sg,
            staged_destination: None,
        }
    }

    fn reset(&mut self, board: &Board) {
        self.timeout = self.default_timeout;
        self.acquisition.reset();
        self.sg.release();
        self.staged_destination = None;
        board.shared().reset();
    }
}

/// Exclusive session on one PVCAM board.
#[derive(Debug)]
pub struct PvcamSession {
    board: Arc<Board>,
    ports: PvcamPorts,
    state: Arc<Mutex<PvcamState>>,
}

impl PvcamSession {
    /// Bring up a claimed board. The claim is released on failure.
    pub(crate) fn start(board: Arc<Board>) -> Result<Self> {
        let Binding::Pvcam { ports, state } = &board.binding else {
            board.release_claim();
            return Err(DriverError::NoSuchDevice {
                index: board.index(),
            });
        };
        let session = Self {
            ports: ports.clone(),
            state: Arc::clone(state),
            board,
        };

        {
            let mut st = lock(&session.state);
            st.reset(&session.board);
            session.ports.reset_mailboxes();
            session.ports.enable_interrupt();
        }

        tracing::info!("Opened {} (board {})", session.board.name(), session.board.index());
        Ok(session)
    }

    /// Board this session owns.
    pub fn board(&self) -> &Board {
        &self.board
    }

    /// Run `op` under the board gate; a caller-buffer fault resets the
    /// session before the error returns.
    fn gated<T>(&self, op: impl FnOnce(&mut PvcamState) -> Result<T>) -> Result<T> {
        let mut st = lock(&self.state);
        let result = op(&mut st);
        if let Err(DriverError::UserCopyFault { .. }) = &result {
            st.reset(&self.board);
            tracing::warn!("{}: caller buffer fault, session state reset", self.board.name());
        }
        result
    }

    /// Command acknowledge timeout.
    pub fn timeout(&self) -> Duration {
        lock(&self.state).timeout
    }

    /// Change the command acknowledge timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        lock(&self.state).timeout = timeout;
    }

    /// Run one write/read command transaction.
    ///
    /// While an image transfer is active, anything but the keep-alive is
    /// dropped: the read payload is zero-filled and `Transfer::Aborted`
    /// returned.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for oversize payloads
    /// - `Timeout` if an acknowledge does not arrive
    /// - `ProtocolError` for a communication error status
    /// - `UserCopyFault` (session reset)
    pub fn write_read(&self, req: &mut WriteRead<'_>) -> Result<Transfer> {
        self.gated(|st| {
            transport::write_read(
                &self.ports,
                self.board.shared(),
                st.timeout,
                st.max_read_bytes,
                st.acquisition.xfer_active(),
                req,
            )
        })
    }

    /// Arm an exposure of `total` bytes delivered into `destination`.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a zero or oversize total
    /// - `OutOfCapacity`/`OutOfMemory` from the buffer manager (buffer released)
    pub fn arm_exposure(&self, total: usize, destination: PixelSink) -> Result<()> {
        if total > MAX_XFER_SIZE as usize {
            return Err(DriverError::invalid_argument(format!(
                "{total}-byte exposure exceeds {MAX_XFER_SIZE}"
            )));
        }
        self.gated(|st| {
            let PvcamState { acquisition, sg, .. } = st;
            acquisition.arm(&self.ports, self.board.shared(), sg, total, destination)
        })
    }

    /// Disarm the exposure.
    pub fn disarm_exposure(&self) {
        lock(&self.state).acquisition.disarm(self.board.shared());
    }

    /// Poll exposure status. The first poll after the board reports the
    /// frame complete copies it into the destination.
    ///
    /// # Errors
    ///
    /// - `NotMapped` if no destination was given
    /// - `UserCopyFault` (session reset)
    pub fn image_status(&self) -> Result<ImageStatusReport> {
        self.gated(|st| st.acquisition.poll(self.board.shared(), &st.sg))
    }

    /// Destination used by the next raw `SET_IMAGE_ACTIVE` call.
    pub fn stage_destination(&self, destination: PixelSink) {
        lock(&self.state).staged_destination = Some(destination);
    }

    /// PCI firmware revision.
    pub fn firmware_revision(&self) -> u32 {
        let _gate = lock(&self.state);
        self.ports.firmware_revision()
    }

    /// Reprogram the board's PCI flash.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an image over 32 KiB.
    pub fn load_flash(&self, image: &[u8]) -> Result<()> {
        if image.len() > MAX_FLASH_BYTES {
            return Err(DriverError::invalid_argument(format!(
                "{}-byte flash image exceeds {MAX_FLASH_BYTES}",
                image.len()
            )));
        }
        let _gate = lock(&self.state);
        self.ports.load_flash(image);
        tracing::info!("{}: loaded {} flash bytes", self.board.name(), image.len());
        Ok(())
    }

    /// Scatter-gather descriptors currently programmed.
    pub fn dma_entries(&self) -> Vec<crate::dma::SgEntry> {
        lock(&self.state).sg.entries().to_vec()
    }

    /// Raw control-call dispatcher. Scalars are native-endian `u32` words.
    ///
    /// `WRITE_READ` takes a [`WriteReadHeader`], then the write payload, then
    /// room for the read payload. `SET_IMAGE_ACTIVE` takes the byte total and
    /// uses the destination given to [`stage_destination`](Self::stage_destination).
    /// `LOAD_PCI_FLASH` takes the whole buffer as the image.
    ///
    /// # Errors
    ///
    /// - `Unsupported` for an unknown opcode
    /// - `UserCopyFault` if `arg` cannot be accessed (session reset)
    /// - any error of the operation the opcode selects
    pub fn ioctl(&self, op: u32, arg: &mut dyn UserBuffer) -> Result<()> {
        let result = self.dispatch(op, arg);
        if let Err(DriverError::UserCopyFault { .. }) = &result {
            lock(&self.state).reset(&self.board);
            tracing::warn!("{}: caller buffer fault, session state reset", self.board.name());
        }
        result
    }

    fn dispatch(&self, op: u32, arg: &mut dyn UserBuffer) -> Result<()> {
        match op {
            opcode::GET_MAXRETRIES => arg.put_u32(0, MAX_RETRIES),
            opcode::SET_MAXRETRIES => arg.get_u32(0).map(|_| ()),
            opcode::GET_MAXTIMEOUT => {
                let ms = u32::try_from(self.timeout().as_millis()).unwrap_or(u32::MAX);
                arg.put_u32(0, ms)
            }
            opcode::SET_MAXTIMEOUT => {
                let ms = arg.get_u32(0)?;
                self.set_timeout(Duration::from_millis(u64::from(ms)));
                Ok(())
            }
            opcode::WRITE_READ => self.write_read_ioctl(arg),
            opcode::SET_IMAGE_ACTIVE => {
                let total = arg.get_u32(0)? as usize;
                let destination = lock(&self.state)
                    .staged_destination
                    .take()
                    .ok_or(DriverError::NotMapped)?;
                self.arm_exposure(total, destination)
            }
            opcode::SET_IMAGE_IDLE => {
                self.disarm_exposure();
                Ok(())
            }
            opcode::GET_IMAGE_STATUS => {
                let report = self.image_status()?;
                arg.copy_to_user(0, bytemuck::bytes_of(&report))
            }
            opcode::GET_PIXTIME => arg.put_u32(0, PIXTIME),
            opcode::GET_DRIVER_VER => arg.put_u32(0, DRIVER_VERSION),
            opcode::GET_IMAGE_GRANUL => arg.put_u32(0, MIN_XFER_SIZE),
            opcode::GET_PCI_FW_REV => arg.put_u32(0, self.firmware_revision()),
            opcode::LOAD_PCI_FLASH => {
                if arg.len() > MAX_FLASH_BYTES {
                    return Err(DriverError::invalid_argument(format!(
                        "{}-byte flash image exceeds {MAX_FLASH_BYTES}",
                        arg.len()
                    )));
                }
                let mut image = vec![0u8; arg.len()];
                arg.copy_from_user(0, &mut image)?;
                self.load_flash(&image)
            }
            other => Err(DriverError::Unsupported { opcode: other }),
        }
    }

    fn write_read_ioctl(&self, arg: &mut dyn UserBuffer) -> Result<()> {
        let mut header = WriteReadHeader::default();
        arg.copy_from_user(0, bytemuck::bytes_of_mut(&mut header))?;
        let payload_at = std::mem::size_of::<WriteReadHeader>();
        let write_bytes = usize::from(header.write_bytes);
        let read_bytes = usize::from(header.read_bytes);

        let mut write = vec![0u8; write_bytes];
        arg.copy_from_user(payload_at, &mut write)?;
        let mut read = vec![0u8; read_bytes];

        self.write_read(&mut WriteRead {
            class: header.class,
            write: &write,
            write_bytes,
            read: &mut read,
            read_bytes,
        })?;
        arg.copy_to_user(payload_at + write_bytes, &read)
    }
}

impl Drop for PvcamSession {
    fn drop(&mut self) {
        lock(&self.state).reset(&self.board);
        self.board.release_claim();
        tracing::info!("Closed {}", self.board.name());
    }
}
