//! Driver core for ARC and PVCAM CCD camera interface boards.
//!
//! Two PCI frame-grabber families share one board table. ARC boards are
//! driven through a DSP vector protocol over five memory-mapped registers;
//! PVCAM boards through framed byte scripts over an S5933 mailbox FIFO, with
//! pixel data arriving by scatter-gather DMA.
//!
//! # Layering
//!
//! ```text
//!  BoardTable ── open_arc ──▶ ArcSession ──▶ ArcEngine ──┐
//!      │      └─ open_pvcam ▶ PvcamSession ─▶ PvcamPorts ┤
//!      │                           │                     ▼
//!      │                  ScatterGatherTable         Registers ──▶ RegisterIo
//!      │                           │                     │        (MappedRegion,
//!      ▼                           ▼                     ▼         PortRegion, sim)
//!  handle_interrupt ──▶ IrqShared (atomics + WaitChannel) ◀── Clock (HostClock,
//!                                                                 VirtualClock)
//! ```
//!
//! Every caller-facing operation runs under its board's gate. The interrupt
//! handler never takes the gate: it only touches the board's [`IrqShared`]
//! atomics and wakes waiters through the [`WaitChannel`].
//!
//! # Quick start
//!
//! ```no_run
//! use ccdpci_driver::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let bench = SimBench::new(DriverConfig::default(), 1, 1)?;
//! let arc = bench.table.open_arc(0)?;
//! let reply = arc.command(&[0x0203, 0x0000_8000])?;
//! println!("reply {reply:#x}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod arc;
mod board;
pub mod config;
pub mod dma;
mod error;
mod irq;
pub mod mmio;
pub mod pci;
pub mod pvcam;
pub mod sim;
pub mod timing;
pub mod user;

/// Hardware identification constants (re-exported from ccdpci-chip).
pub mod pcie_ids {
    pub use ccdpci_chip::pcie::{
        device_id, BoardVariant, AMCC_VENDOR_ID, ARC_MAX_BOARDS, MOTOROLA_VENDOR_ID,
        PVCAM_MAX_BOARDS,
    };
}

pub use arc::{ArcEngine, ArcSession, ImageArena, ImageBuffer, MapAttributes, ReplyStatus};
pub use board::{
    ArcBinding, Board, BoardTable, BoardTableBuilder, IrqShared, IrqToken, LockMode,
    PvcamBinding, WaitChannel, MAX_BOARDS,
};
pub use config::{DriverConfig, ImageRegion, PvcamConfig, Timing, YieldStrategy};
pub use dma::{BlockAllocator, BlockMemory, HostBlockAllocator, ScatterGatherTable, SgEntry};
pub use error::{status_code, DriverError, Result};
pub use irq::IrqReturn;
pub use mmio::{MappedRegion, PortRegion, RegisterIo, Registers};
pub use pci::{discover, BoardInfo, ConfigSpace, ConfigWidth, SysfsConfigSpace};
pub use pvcam::{
    ImageStatus, ImageStatusReport, PvcamPorts, PvcamSession, Transfer, WriteRead,
    WriteReadHeader,
};
pub use timing::{Clock, HostClock, VirtualClock, WaitBudget};
pub use user::{FaultyBuffer, PixelSink, SharedBuffer, UserBuffer};

/// Commonly used types.
pub mod prelude {
    pub use crate::sim::SimBench;
    pub use crate::{
        ArcSession, BoardTable, ConfigWidth, DriverConfig, DriverError, ImageStatus,
        ImageStatusReport, PvcamSession, Result, SharedBuffer, Transfer, UserBuffer, WriteRead,
    };
}
