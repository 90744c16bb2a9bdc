//! Interrupt dispatch
//!
//! The line may be shared with other devices, so anything that cannot be
//! tied to one of our boards is reported as [`IrqReturn::NotMine`] and
//! otherwise ignored.

use crate::arc;
use crate::board::{Binding, BoardTable, IrqToken};
use crate::pvcam;

/// Outcome of an interrupt delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The board raised it and it was serviced.
    Handled,
    /// Not raised by the board the token names.
    NotMine,
}

impl BoardTable {
    /// Interrupt entry point for line `irq` with the cookie registered for
    /// one board.
    ///
    /// Never blocks and never touches caller memory.
    pub fn handle_interrupt(&self, irq: u32, token: IrqToken) -> IrqReturn {
        let Some(board) = self.boards().get(token.index()) else {
            tracing::trace!("Interrupt token {} names no board", token.raw());
            return IrqReturn::NotMine;
        };
        if board.irq() != Some(irq) {
            return IrqReturn::NotMine;
        }

        let outcome = match &board.binding {
            Binding::Arc { engine, .. } => arc::handle_interrupt(board, engine),
            Binding::Pvcam { ports, .. } => pvcam::handle_interrupt(board, ports),
        };
        if outcome == IrqReturn::Handled {
            board.shared().count_interrupt();
        }
        outcome
    }

    /// Deliver a raw cookie, as an interrupt controller would.
    pub fn handle_raw_interrupt(&self, irq: u32, cookie: u32) -> IrqReturn {
        IrqToken::decode(cookie).map_or(IrqReturn::NotMine, |token| self.handle_interrupt(irq, token))
    }
}
