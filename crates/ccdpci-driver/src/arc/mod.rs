//! ARC DSP controller boards
//!
//! [`ArcEngine`] speaks the HCVR/HSTR vector protocol, [`ArcSession`] is the
//! per-open handle with the control-call table, and [`ImageArena`] hands out
//! image buffers from the reserved region.

mod engine;
mod mapping;
mod session;

pub use engine::{ArcEngine, ReplyStatus};
pub use mapping::{ImageArena, ImageBuffer, MapAttributes};
pub use session::{ArcSession, ArcState};

use crate::board::{Board, IrqShared};
use crate::irq::IrqReturn;
use ccdpci_chip::arc::{hstr, vector};

/// Interrupt-context handling for one ARC board.
pub(crate) fn handle_interrupt(board: &Board, engine: &ArcEngine) -> IrqReturn {
    let status = engine.hstr();
    if status & hstr::DMA_INTERRUPTING == 0 {
        return IrqReturn::NotMine;
    }

    let shared: &IrqShared = board.shared();
    shared.capture_status(status);
    if !engine.try_send_vector(vector::CLEAR_INTERRUPT) {
        tracing::trace!("{}: HCVR busy, interrupt left pending", board.name());
    }
    shared.events().notify();
    IrqReturn::Handled
}
