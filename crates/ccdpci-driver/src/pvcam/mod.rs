//! PVCAM camera interface boards
//!
//! Commands go out as framed byte scripts through the mailbox FIFO port and
//! are acknowledged by mailbox-2 interrupts. Pixel data arrives by DMA into
//! a scatter-gather buffer and is copied out on the first status poll after
//! the board reports the frame complete.

mod acquisition;
mod session;
mod transport;

pub use acquisition::ImageStatusReport;
pub use session::{PvcamSession, PvcamState};
pub use transport::{PvcamPorts, Transfer, WriteRead, WriteReadHeader};

use crate::board::Board;
use crate::irq::IrqReturn;
use ccdpci_chip::pvcam::{self, mail, status};

/// Exposure status as reported by `GET_IMAGE_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    /// No exposure configured.
    Idle,
    /// Armed, nothing received yet.
    NoDataActive,
    /// Idle, nothing received.
    NoDataIdle,
    /// Armed, data arriving.
    CollectOkActive,
    /// Frame complete.
    CollectDone,
    /// FIFO overflow while armed.
    FifoOverflowActive,
    /// FIFO overflow after the exposure.
    FifoOverflowIdle,
    /// More data than requested.
    ExtraData,
    /// No acknowledge while armed.
    NoAckActive,
    /// No acknowledge after the exposure.
    NoAckIdle,
    /// Transfer error while armed.
    XferErrActive,
    /// Transfer error.
    XferErr,
    /// Nothing known yet.
    Unknown,
    /// Less data than requested.
    MissingData,
    /// Frame contained no data.
    EmptyData,
}

impl ImageStatus {
    /// Numeric code seen by the camera library.
    pub const fn code(self) -> i32 {
        match self {
            Self::Idle => status::IDLE,
            Self::NoDataActive => status::NO_DATA_A,
            Self::NoDataIdle => status::NO_DATA_I,
            Self::CollectOkActive => status::COLLECT_OK_A,
            Self::CollectDone => status::COLLECT_DONE_I,
            Self::FifoOverflowActive => status::FIFO_OVER_A,
            Self::FifoOverflowIdle => status::FIFO_OVER_I,
            Self::ExtraData => status::EXTRA_DATA_I,
            Self::NoAckActive => status::NO_ACK_A,
            Self::NoAckIdle => status::NO_ACK_I,
            Self::XferErrActive => status::XFER_ERR_A,
            Self::XferErr => status::XFER_ERR_I,
            Self::Unknown => status::UNKNOWN,
            Self::MissingData => status::MISSING_DATA_I,
            Self::EmptyData => status::EMPTY_DATA_I,
        }
    }

    /// Decode a numeric code; unrecognised codes read as `Unknown`.
    pub const fn from_code(code: i32) -> Self {
        match code {
            status::IDLE => Self::Idle,
            status::NO_DATA_A => Self::NoDataActive,
            status::NO_DATA_I => Self::NoDataIdle,
            status::COLLECT_OK_A => Self::CollectOkActive,
            status::COLLECT_DONE_I => Self::CollectDone,
            status::FIFO_OVER_A => Self::FifoOverflowActive,
            status::FIFO_OVER_I => Self::FifoOverflowIdle,
            status::EXTRA_DATA_I => Self::ExtraData,
            status::NO_ACK_A => Self::NoAckActive,
            status::NO_ACK_I => Self::NoAckIdle,
            status::XFER_ERR_A => Self::XferErrActive,
            status::XFER_ERR_I => Self::XferErr,
            status::MISSING_DATA_I => Self::MissingData,
            status::EMPTY_DATA_I => Self::EmptyData,
            _ => Self::Unknown,
        }
    }

    /// Classify a DMA-event mailbox payload (command-complete bit clear).
    pub const fn from_dma_payload(payload: u32) -> Self {
        if payload == 0 {
            Self::CollectDone
        } else if payload & mail::MISSING_DATA != 0 {
            Self::MissingData
        } else if payload & (mail::EXTRA_DATA | mail::EXTRA_DATA_ALT) != 0 {
            Self::ExtraData
        } else if payload & mail::FIFO_OVERFLOW != 0 {
            Self::FifoOverflowActive
        } else {
            Self::XferErr
        }
    }
}

/// Interrupt-context handling for one PVCAM board.
pub(crate) fn handle_interrupt(board: &Board, ports: &PvcamPorts) -> IrqReturn {
    let ops = ports.operation();
    if ops.read32(pvcam::INTCSR) & pvcam::OUR_PCI_INTERRUPT == 0 {
        return IrqReturn::NotMine;
    }

    ops.write32(pvcam::INTCSR, pvcam::INT_MAILBOX2);
    let mailstatus = ops.read32(pvcam::MAILSTATUS);
    let payload = ops.read32(pvcam::MAILBOX2);
    if mailstatus & pvcam::MAIL_FOR_US == 0 {
        return IrqReturn::Handled;
    }

    let shared = board.shared();
    shared.capture_status(payload);
    if payload & mail::COMMAND_COMPLETE != 0 {
        shared.acknowledge();
    } else {
        let status = ImageStatus::from_dma_payload(payload);
        shared.set_image_status(status);
        tracing::trace!("{}: DMA event {payload:#x} → {status:?}", board.name());
    }
    IrqReturn::Handled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dma_payload_classification() {
        assert_eq!(ImageStatus::from_dma_payload(0), ImageStatus::CollectDone);
        assert_eq!(ImageStatus::from_dma_payload(0x02), ImageStatus::MissingData);
        assert_eq!(ImageStatus::from_dma_payload(0x10), ImageStatus::ExtraData);
        assert_eq!(ImageStatus::from_dma_payload(0x40), ImageStatus::ExtraData);
        assert_eq!(
            ImageStatus::from_dma_payload(0x80),
            ImageStatus::FifoOverflowActive
        );
        assert_eq!(ImageStatus::from_dma_payload(0x01), ImageStatus::XferErr);
    }

    #[test]
    fn codes_round_trip() {
        for s in [
            ImageStatus::Idle,
            ImageStatus::CollectDone,
            ImageStatus::EmptyData,
            ImageStatus::NoAckIdle,
        ] {
            assert_eq!(ImageStatus::from_code(s.code()), s);
        }
        assert_eq!(ImageStatus::from_code(-7), ImageStatus::Unknown);
        assert_eq!(ImageStatus::CollectDone.code(), 103);
    }
}
