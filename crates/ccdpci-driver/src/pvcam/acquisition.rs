//! Exposure bookkeeping
//!
//! Arming an exposure sizes the scatter-gather buffer and hands its table
//! to the board. The interrupt handler records the outcome in the board's
//! image status; the first status poll that sees `CollectDone` copies the
//! frame out to the caller's destination.

use super::transport::PvcamPorts;
use super::ImageStatus;
use crate::board::IrqShared;
use crate::dma::ScatterGatherTable;
use crate::error::{DriverError, Result};
use crate::user::PixelSink;

/// `GET_IMAGE_STATUS` response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct ImageStatusReport {
    /// Bytes delivered to the destination.
    pub byte_cnt: u32,
    /// [`ImageStatus`] code.
    pub status: i32,
}

impl ImageStatusReport {
    /// Decoded status.
    pub const fn image_status(&self) -> ImageStatus {
        ImageStatus::from_code(self.status)
    }
}

/// Acquisition state of one board.
#[derive(Default)]
pub(crate) struct Acquisition {
    xfer_active: bool,
    total: usize,
    collected: usize,
    destination: Option<PixelSink>,
}

impl std::fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquisition")
            .field("xfer_active", &self.xfer_active)
            .field("total", &self.total)
            .field("collected", &self.collected)
            .field("has_destination", &self.destination.is_some())
            .finish()
    }
}

impl Acquisition {
    pub(crate) const fn xfer_active(&self) -> bool {
        self.xfer_active
    }

    /// Size the buffer for `total` bytes, program the table and start
    /// the transfer. On failure the buffer is released and the state reset.
    pub(crate) fn arm(
        &mut self,
        ports: &PvcamPorts,
        shared: &IrqShared,
        sg: &mut ScatterGatherTable,
        total: usize,
        destination: PixelSink,
    ) -> Result<()> {
        self.collected = 0;
        shared.set_image_status(ImageStatus::NoDataActive);

        let result = Self::program(ports, sg, total);
        if let Err(e) = result {
            sg.release();
            *self = Self::default();
            return Err(e);
        }

        self.total = total;
        self.destination = Some(destination);
        self.xfer_active = true;
        tracing::debug!(
            "Exposure armed: {total} bytes in {} blocks",
            sg.used_entries()
        );
        Ok(())
    }

    fn program(ports: &PvcamPorts, sg: &mut ScatterGatherTable, total: usize) -> Result<()> {
        if total == 0 {
            return Err(DriverError::invalid_argument("zero-length exposure"));
        }
        if sg.total_bytes() != total {
            sg.release();
            sg.allocate(total)?;
        }
        let table = u32::try_from(sg.table_bus_address()).map_err(|_| {
            DriverError::invalid_argument("scatter-gather table above 32-bit bus range")
        })?;
        ports.start_dma(table);
        Ok(())
    }

    /// Stop treating the board as mid-transfer. The buffer stays allocated
    /// for the next exposure of the same size.
    pub(crate) fn disarm(&mut self, shared: &IrqShared) {
        self.xfer_active = false;
        self.total = 0;
        self.collected = 0;
        self.destination = None;
        shared.set_image_status(ImageStatus::NoDataIdle);
    }

    /// Report status, collecting the frame on the first poll after the
    /// board reports it complete.
    pub(crate) fn poll(&mut self, shared: &IrqShared, sg: &ScatterGatherTable) -> Result<ImageStatusReport> {
        let status = shared.image_status();
        if self.xfer_active && status == ImageStatus::CollectDone {
            let dest = self.destination.as_mut().ok_or(DriverError::NotMapped)?;
            self.collected = sg.collect(self.total, &mut **dest)?;
            self.xfer_active = false;
            tracing::debug!("Collected {} bytes", self.collected);
        }
        Ok(ImageStatusReport {
            byte_cnt: u32::try_from(self.collected).unwrap_or(u32::MAX),
            status: status.code(),
        })
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}
