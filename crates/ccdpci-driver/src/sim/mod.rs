//! Simulated boards
//!
//! Register-level models of both boards, a bus-memory model the simulated
//! DMA engine writes into, and an interrupt line drained by a pump thread
//! into [`BoardTable::handle_interrupt`]. Together they let the whole driver
//! run without hardware.
//!
//! ```text
//!  session ──▶ Registers ──▶ SimArc / SimPvcam ──raise──▶ InterruptLine
//!                                   │                          │
//!                                   ▼ DMA                      ▼
//!                             SimBusMemory              IrqPump thread
//!                                                              │
//!                                       BoardTable::handle_interrupt
//! ```

mod arc;
mod pvcam;

pub use arc::{ArcReply, SimArc};
pub use pvcam::{SimFrame, SimPvcam, SimResponse};

use crate::board::{ArcBinding, BoardTable, IrqToken, PvcamBinding};
use crate::config::DriverConfig;
use crate::dma::{BlockAllocator, BlockMemory};
use crate::error::{DriverError, Result};
use crate::irq::IrqReturn;
use crate::pci::{ConfigSpace, ConfigWidth, CONFIG_SPACE_SIZE};
use crate::timing::Clock;
use ccdpci_chip::pcie::BoardVariant;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Bus memory ───────────────────────────────────────────────────────────────

/// One simulated DMA block.
#[derive(Debug)]
pub struct SimBlock {
    bus: u64,
    data: Mutex<Vec<u8>>,
}

impl BlockMemory for SimBlock {
    fn bus_address(&self) -> u64 {
        self.bus
    }

    fn len(&self) -> usize {
        guard(&self.data).len()
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        dst.copy_from_slice(&guard(&self.data)[offset..offset + dst.len()]);
    }

    fn write(&self, offset: usize, src: &[u8]) {
        guard(&self.data)[offset..offset + src.len()].copy_from_slice(src);
    }
}

/// Bus-addressable memory for simulated DMA.
///
/// Tracks every live block so tests can check for leaks, and can be told to
/// start failing allocations.
#[derive(Debug)]
pub struct SimBusMemory {
    next: AtomicU64,
    blocks: Mutex<BTreeMap<u64, Arc<SimBlock>>>,
    budget: Mutex<Option<usize>>,
}

impl Default for SimBusMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBusMemory {
    /// First bus address handed out.
    pub const BUS_BASE: u64 = 0x1000_0000;

    const ALIGN: u64 = 4096;

    /// Empty memory.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(Self::BUS_BASE),
            blocks: Mutex::new(BTreeMap::new()),
            budget: Mutex::new(None),
        }
    }

    /// Let `n` more allocations succeed, then fail every one after.
    pub fn fail_after(&self, n: usize) {
        *guard(&self.budget) = Some(n);
    }

    /// Live blocks, descriptor tables included.
    pub fn outstanding(&self) -> usize {
        guard(&self.blocks).len()
    }

    fn block_at(&self, addr: u64) -> Option<(Arc<SimBlock>, usize)> {
        let blocks = guard(&self.blocks);
        let (_, block) = blocks.range(..=addr).next_back()?;
        let offset = usize::try_from(addr - block.bus).ok()?;
        (offset < block.len()).then(|| (Arc::clone(block), offset))
    }

    /// Write `data` at bus address `addr`, as a DMA engine would. Returns
    /// `false` if the range is not inside one live block.
    pub fn write_bus(&self, addr: u64, data: &[u8]) -> bool {
        match self.block_at(addr) {
            Some((block, offset)) if offset + data.len() <= block.len() => {
                block.write(offset, data);
                true
            }
            _ => false,
        }
    }

    /// Read `len` bytes at bus address `addr`.
    pub fn read_bus(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let (block, offset) = self.block_at(addr)?;
        if offset + len > block.len() {
            return None;
        }
        let mut out = vec![0; len];
        block.read(offset, &mut out);
        Some(out)
    }
}

impl BlockAllocator for SimBusMemory {
    fn allocate(&self, size: usize) -> Result<Arc<dyn BlockMemory>> {
        {
            let mut budget = guard(&self.budget);
            match budget.as_mut() {
                Some(0) => return Err(DriverError::OutOfMemory { entries: 0 }),
                Some(n) => *n -= 1,
                None => {}
            }
        }
        let span = (size as u64).div_ceil(Self::ALIGN).max(1) * Self::ALIGN;
        let bus = self.next.fetch_add(span, Ordering::Relaxed);
        let block = Arc::new(SimBlock {
            bus,
            data: Mutex::new(vec![0; size]),
        });
        guard(&self.blocks).insert(bus, Arc::clone(&block));
        Ok(block)
    }

    fn free(&self, block: Arc<dyn BlockMemory>) {
        guard(&self.blocks).remove(&block.bus_address());
    }
}

// ── Config space ─────────────────────────────────────────────────────────────

/// In-memory configuration space seeded with a board's IDs.
#[derive(Debug)]
pub struct SimConfigSpace {
    bytes: Mutex<Vec<u8>>,
}

impl SimConfigSpace {
    /// Config space identifying as `variant`.
    pub fn new(variant: BoardVariant) -> Self {
        let mut bytes = vec![0u8; CONFIG_SPACE_SIZE as usize];
        bytes[0..2].copy_from_slice(&variant.vendor_id().to_le_bytes());
        bytes[2..4].copy_from_slice(&variant.device_id().to_le_bytes());
        Self {
            bytes: Mutex::new(bytes),
        }
    }
}

impl ConfigSpace for SimConfigSpace {
    fn read(&self, offset: u32, width: ConfigWidth) -> Result<u32> {
        width.check(offset)?;
        let at = offset as usize;
        let mut word = [0u8; 4];
        word[..width.bytes()].copy_from_slice(&guard(&self.bytes)[at..at + width.bytes()]);
        Ok(u32::from_le_bytes(word))
    }

    fn write(&self, offset: u32, width: ConfigWidth, value: u32) -> Result<()> {
        width.check(offset)?;
        let at = offset as usize;
        guard(&self.bytes)[at..at + width.bytes()].copy_from_slice(&value.to_le_bytes()[..width.bytes()]);
        Ok(())
    }
}

// ── Interrupt line ───────────────────────────────────────────────────────────

enum Signal {
    Raise(mpsc::SyncSender<()>),
    Stop,
}

/// Handle a simulated board raises its interrupt through.
#[derive(Debug, Clone)]
pub struct InterruptLine {
    tx: mpsc::Sender<Signal>,
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Raise(_) => "Raise",
            Self::Stop => "Stop",
        })
    }
}

impl InterruptLine {
    /// Assert the line and wait until the handlers have run. Returns `false`
    /// if the pump is gone.
    pub fn raise(&self) -> bool {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if self.tx.send(Signal::Raise(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv().is_ok()
    }
}

/// Thread standing in for interrupt context: every raise on its line is
/// offered to each registered board in turn, as on a shared line.
#[derive(Debug)]
pub struct IrqPump {
    irq: u32,
    line: InterruptLine,
    handled: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl IrqPump {
    /// Start a pump for line `irq` serving the boards behind `tokens`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn spawn(table: Arc<BoardTable>, irq: u32, tokens: Vec<IrqToken>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let handled = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&handled);

        let thread = thread::Builder::new()
            .name(format!("irq-{irq}"))
            .spawn(move || {
                while let Ok(Signal::Raise(ack)) = rx.recv() {
                    for &token in &tokens {
                        if table.handle_interrupt(irq, token) == IrqReturn::Handled {
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    let _ = ack.send(());
                }
            })?;

        Ok(Self {
            irq,
            line: InterruptLine { tx },
            handled,
            thread: Some(thread),
        })
    }

    /// Interrupt line number.
    pub const fn irq(&self) -> u32 {
        self.irq
    }

    /// Line handle for a simulated board.
    pub fn line(&self) -> InterruptLine {
        self.line.clone()
    }

    /// Deliveries some board claimed.
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }
}

impl Drop for IrqPump {
    fn drop(&mut self) {
        let _ = self.line.tx.send(Signal::Stop);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

// ── Bench ────────────────────────────────────────────────────────────────────

/// First interrupt line given to simulated ARC boards.
pub const ARC_IRQ_BASE: u32 = 10;
/// First interrupt line given to simulated PVCAM boards.
pub const PVCAM_IRQ_BASE: u32 = 20;

/// A board table wired to simulated boards, one interrupt pump per board.
#[derive(Debug)]
pub struct SimBench {
    /// The table under test.
    pub table: Arc<BoardTable>,
    /// ARC models, by board index.
    pub arcs: Vec<Arc<SimArc>>,
    /// PVCAM models, in PVCAM order (table index `arcs.len() + i`).
    pub pvcams: Vec<Arc<SimPvcam>>,
    /// Bus memory backing every DMA block.
    pub memory: Arc<SimBusMemory>,
    pumps: Vec<IrqPump>,
}

impl SimBench {
    /// Bench with `arcs` ARC and `pvcams` PVCAM boards and the host clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be built or a pump cannot start.
    pub fn new(config: DriverConfig, arcs: usize, pvcams: usize) -> Result<Self> {
        Self::build(config, arcs, pvcams, None)
    }

    /// As [`new`](Self::new), with a caller-supplied clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be built or a pump cannot start.
    pub fn with_clock(config: DriverConfig, arcs: usize, pvcams: usize, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::build(config, arcs, pvcams, Some(clock))
    }

    fn build(config: DriverConfig, arcs: usize, pvcams: usize, clock: Option<Arc<dyn Clock>>) -> Result<Self> {
        let memory = Arc::new(SimBusMemory::new());
        let mut builder = BoardTable::builder(config).allocator(memory.clone());
        if let Some(clock) = clock {
            builder = builder.clock(clock);
        }

        let arc_sims: Vec<_> = (0..arcs).map(|_| Arc::new(SimArc::new())).collect();
        for (i, sim) in arc_sims.iter().enumerate() {
            builder = builder.arc(ArcBinding {
                name: format!("sim-arc{i}"),
                irq: Some(ARC_IRQ_BASE + i as u32),
                registers: sim.clone(),
                config_space: Some(Box::new(SimConfigSpace::new(BoardVariant::Arc))),
                pcie_address: None,
            });
        }

        let pvcam_sims: Vec<_> = (0..pvcams).map(|_| SimPvcam::new()).collect();
        for (i, sim) in pvcam_sims.iter().enumerate() {
            builder = builder.pvcam(PvcamBinding {
                name: format!("sim-pvcam{i}"),
                irq: Some(PVCAM_IRQ_BASE + i as u32),
                ports: sim.ports(),
                config_space: Some(Box::new(SimConfigSpace::new(BoardVariant::Pvcam))),
                pcie_address: None,
            });
        }

        let table = builder.build()?;
        let mut pumps = Vec::with_capacity(arcs + pvcams);
        for (i, sim) in arc_sims.iter().enumerate() {
            let pump = IrqPump::spawn(Arc::clone(&table), ARC_IRQ_BASE + i as u32, vec![IrqToken::for_index(i)])?;
            sim.attach(pump.line());
            pumps.push(pump);
        }
        for (i, sim) in pvcam_sims.iter().enumerate() {
            let index = arcs + i;
            let pump = IrqPump::spawn(
                Arc::clone(&table),
                PVCAM_IRQ_BASE + i as u32,
                vec![IrqToken::for_index(index)],
            )?;
            sim.attach(pump.line());
            pumps.push(pump);
        }

        Ok(Self {
            table,
            arcs: arc_sims,
            pvcams: pvcam_sims,
            memory,
            pumps,
        })
    }

    /// Pump serving table index `index`.
    pub fn pump(&self, index: usize) -> Option<&IrqPump> {
        self.pumps.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_memory_tracks_and_fails_on_request() {
        let mem = SimBusMemory::new();
        let a = mem.allocate(100).unwrap();
        let b = mem.allocate(5000).unwrap();
        assert_eq!(a.bus_address(), SimBusMemory::BUS_BASE);
        assert_eq!(b.bus_address(), SimBusMemory::BUS_BASE + 4096);

        assert!(mem.write_bus(b.bus_address() + 10, &[1, 2, 3]));
        assert_eq!(mem.read_bus(b.bus_address() + 10, 3).unwrap(), vec![1, 2, 3]);
        assert!(!mem.write_bus(a.bus_address() + 99, &[0, 0]));

        mem.fail_after(0);
        assert!(matches!(
            mem.allocate(1),
            Err(DriverError::OutOfMemory { .. })
        ));
        mem.free(a);
        assert_eq!(mem.outstanding(), 1);
    }

    #[test]
    fn config_space_identifies_board() {
        let cfg = SimConfigSpace::new(BoardVariant::Pvcam);
        assert_eq!(cfg.read(0, ConfigWidth::Dword).unwrap(), 0x81E6_10E8);
    }
}
