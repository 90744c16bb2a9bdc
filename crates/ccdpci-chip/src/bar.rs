//! PCI BAR layout for both boards.
//!
//! ```text
//! Board  BAR  Type        Size    Purpose
//! ─────  ───  ──────────  ──────  ──────────────────────────────────────────
//! ARC     0   MMIO        0x9C    DSP host interface (HCTR/HSTR/HCVR/...)
//! PVCAM   0   I/O ports   64 B    S5933 operation registers (mailboxes)
//! PVCAM   1   I/O ports   4 B     Command/reply FIFO port
//! PVCAM   2   I/O ports   4 B     Scatter-gather table address port
//! PVCAM   3   I/O ports   2 B     Flash programming port
//! ```

/// ARC host-interface window.
pub mod arc {
    /// BAR carrying the DSP host interface.
    pub const REGISTER_BAR: usize = 0;
    /// Bytes of the register window the driver touches.
    pub const REGISTER_WINDOW: usize = 0x9C;
}

/// PVCAM I/O windows.
pub mod pvcam {
    /// S5933 operation registers.
    pub const OPERATION_BAR: usize = 0;
    /// Command/reply FIFO port.
    pub const FIFO_BAR: usize = 1;
    /// Writing a bus address here starts the scatter-gather DMA.
    pub const TABLE_BAR: usize = 2;
    /// Flash programming port.
    pub const FLASH_BAR: usize = 3;
    /// Number of I/O BARs used.
    pub const BAR_COUNT: usize = 4;
    /// Size of the operation register block.
    pub const OPERATION_WINDOW: usize = 0x40;
}
