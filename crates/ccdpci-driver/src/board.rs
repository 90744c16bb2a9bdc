//! Board table
//!
//! One record per bound board, indexed by minor number. A record owns the
//! register bindings, the exclusive-open flag, the per-board gate that
//! serialises control calls, and the handful of fields the interrupt
//! handler shares with the issuing call path.
//!
//! ```text
//!  control call ──▶ Mutex<state> ──▶ protocol engine ──▶ registers
//!                        │                                  │
//!                        ▼ waits                            ▼ irq
//!                   WaitChannel ◀── notify ── IrqShared ◀── handler
//! ```
//!
//! The interrupt handler never takes the state gate; it only touches
//! [`IrqShared`], whose atomics are updated before the wait channel is
//! signalled, so a woken waiter always observes the update.

use crate::arc::{ArcEngine, ArcSession, ArcState, ImageArena};
use crate::config::DriverConfig;
use crate::dma::{BlockAllocator, HostBlockAllocator, ScatterGatherTable};
use crate::error::{DriverError, Result};
use crate::mmio::{MappedRegion, PortRegion, RegisterIo, Registers};
use crate::pci::{discover, BoardInfo, ConfigSpace, SysfsConfigSpace};
use crate::pvcam::{ImageStatus, PvcamPorts, PvcamSession, PvcamState};
use crate::timing::{Clock, HostClock, WaitBudget};
use ccdpci_chip::bar;
use ccdpci_chip::pcie::{BoardVariant, ARC_MAX_BOARDS, PVCAM_MAX_BOARDS};
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Total table capacity: both board families side by side.
pub const MAX_BOARDS: usize = ARC_MAX_BOARDS + PVCAM_MAX_BOARDS;

/// Validated interrupt cookie: board index plus one, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IrqToken(NonZeroU32);

impl IrqToken {
    /// Token for the board at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`MAX_BOARDS`].
    pub fn for_index(index: usize) -> Self {
        assert!(index < MAX_BOARDS, "board index {index} outside table");
        #[allow(clippy::cast_possible_truncation)]
        Self(NonZeroU32::MIN.saturating_add(index as u32))
    }

    /// Decode a raw cookie, rejecting zero and out-of-table values.
    pub fn decode(raw: u32) -> Option<Self> {
        let token = NonZeroU32::new(raw)?;
        ((token.get() as usize) <= MAX_BOARDS).then_some(Self(token))
    }

    /// Raw cookie value.
    pub const fn raw(self) -> u32 {
        self.0.get()
    }

    /// Board index this token names.
    pub const fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

/// Command/ack sequencing state shared with the interrupt handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockMode {
    /// No transaction waiting on an acknowledge.
    None = 0,
    /// Write phase sent, waiting for its acknowledge.
    WritePending = 1,
    /// Write acknowledged, waiting for the read acknowledge.
    ReadPending = 2,
}

impl LockMode {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::WritePending,
            2 => Self::ReadPending,
            _ => Self::None,
        }
    }

    /// State after an acknowledge.
    pub const fn acknowledged(self) -> Self {
        match self {
            Self::WritePending => Self::ReadPending,
            Self::ReadPending | Self::None => Self::None,
        }
    }
}

/// Per-board wait/wake channel.
///
/// Every notification bumps a generation counter under the mutex, so a
/// waiter that took a ticket before issuing a command cannot miss an
/// acknowledge that arrives before it starts waiting.
#[derive(Debug, Default)]
pub struct WaitChannel {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl WaitChannel {
    fn guard(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current generation; pass it to [`wait_for_event`](Self::wait_for_event).
    pub fn ticket(&self) -> u64 {
        *self.guard()
    }

    /// Wake every waiter.
    pub fn notify(&self) {
        *self.guard() += 1;
        self.cond.notify_all();
    }

    /// Wait until a notification newer than `ticket` arrives.
    /// Returns `false` on timeout.
    pub fn wait_for_event(&self, ticket: u64, timeout: Duration) -> bool {
        let (guard, _) = self
            .cond
            .wait_timeout_while(self.guard(), timeout, |generation| *generation == ticket)
            .unwrap_or_else(PoisonError::into_inner);
        *guard != ticket
    }

    /// Wait while `pending` holds. Returns `false` if it still holds at the
    /// timeout.
    pub fn wait_while(&self, timeout: Duration, mut pending: impl FnMut() -> bool) -> bool {
        let (_guard, result) = self
            .cond
            .wait_timeout_while(self.guard(), timeout, |_| pending())
            .unwrap_or_else(PoisonError::into_inner);
        !result.timed_out() || !pending()
    }
}

/// Fields written from interrupt context.
#[derive(Debug)]
pub struct IrqShared {
    lock: AtomicU8,
    status: AtomicU32,
    busy: AtomicBool,
    image_status: AtomicI32,
    interrupts: AtomicU64,
    events: WaitChannel,
}

impl Default for IrqShared {
    fn default() -> Self {
        Self {
            lock: AtomicU8::new(LockMode::None as u8),
            status: AtomicU32::new(0),
            busy: AtomicBool::new(false),
            image_status: AtomicI32::new(ImageStatus::Unknown.code()),
            interrupts: AtomicU64::new(0),
            events: WaitChannel::default(),
        }
    }
}

impl IrqShared {
    /// Current lock mode.
    pub fn lock_mode(&self) -> LockMode {
        LockMode::from_u8(self.lock.load(Ordering::SeqCst))
    }

    pub(crate) fn set_lock_mode(&self, mode: LockMode) {
        self.lock.store(mode as u8, Ordering::SeqCst);
    }

    /// Last status word captured by the interrupt handler.
    pub fn captured_status(&self) -> u32 {
        self.status.load(Ordering::SeqCst)
    }

    pub(crate) fn capture_status(&self, status: u32) {
        self.status.store(status, Ordering::SeqCst);
    }

    /// Whether a command is waiting on its acknowledge.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    /// Exposure status as last classified.
    pub fn image_status(&self) -> ImageStatus {
        ImageStatus::from_code(self.image_status.load(Ordering::SeqCst))
    }

    pub(crate) fn set_image_status(&self, status: ImageStatus) {
        self.image_status.store(status.code(), Ordering::SeqCst);
    }

    /// Interrupts this board has claimed.
    pub fn interrupt_count(&self) -> u64 {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub(crate) fn count_interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn events(&self) -> &WaitChannel {
        &self.events
    }

    /// Interrupt-side handling of a command-complete acknowledge: advance the
    /// lock mode, clear busy, then wake the waiter.
    pub(crate) fn acknowledge(&self) {
        let _ = self
            .lock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |m| {
                Some(LockMode::from_u8(m).acknowledged() as u8)
            });
        self.busy.store(false, Ordering::SeqCst);
        self.events.notify();
    }

    /// Return every field to its just-opened value.
    pub(crate) fn reset(&self) {
        self.set_lock_mode(LockMode::None);
        self.capture_status(0);
        self.set_busy(false);
        self.set_image_status(ImageStatus::Unknown);
    }
}

/// Family-specific half of a board record.
#[derive(Debug)]
pub(crate) enum Binding {
    Arc {
        engine: ArcEngine,
        state: Arc<Mutex<ArcState>>,
    },
    Pvcam {
        ports: PvcamPorts,
        state: Arc<Mutex<PvcamState>>,
    },
}

/// One bound board.
#[derive(Debug)]
pub struct Board {
    index: usize,
    name: String,
    pcie_address: Option<String>,
    irq: Option<u32>,
    opened: AtomicBool,
    config_space: Option<Box<dyn ConfigSpace>>,
    pub(crate) shared: IrqShared,
    pub(crate) binding: Binding,
}

impl Board {
    /// Minor number / table index.
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Board family.
    pub const fn variant(&self) -> BoardVariant {
        match self.binding {
            Binding::Arc { .. } => BoardVariant::Arc,
            Binding::Pvcam { .. } => BoardVariant::Pvcam,
        }
    }

    /// PCI address, when bound to real hardware.
    pub fn pcie_address(&self) -> Option<&str> {
        self.pcie_address.as_deref()
    }

    /// Assigned interrupt line.
    pub const fn irq(&self) -> Option<u32> {
        self.irq
    }

    /// Whether a session owns the board.
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// Interrupt-shared fields.
    pub const fn shared(&self) -> &IrqShared {
        &self.shared
    }

    pub(crate) fn config_space(&self) -> Result<&dyn ConfigSpace> {
        self.config_space
            .as_deref()
            .ok_or_else(|| DriverError::invalid_argument(format!("{} has no config space", self.name)))
    }

    fn try_claim(&self) -> Result<()> {
        self.opened
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| DriverError::AlreadyOpen { index: self.index })
    }

    pub(crate) fn release_claim(&self) {
        self.opened.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// ARC board description handed to the builder.
#[derive(Debug)]
pub struct ArcBinding {
    /// Display name.
    pub name: String,
    /// Interrupt line, `None` if the board has none assigned.
    pub irq: Option<u32>,
    /// Host-interface register window.
    pub registers: Arc<dyn RegisterIo>,
    /// PCI configuration space.
    pub config_space: Option<Box<dyn ConfigSpace>>,
    /// PCI address.
    pub pcie_address: Option<String>,
}

/// PVCAM board description handed to the builder.
#[derive(Debug)]
pub struct PvcamBinding {
    /// Display name.
    pub name: String,
    /// Interrupt line, `None` if the board has none assigned.
    pub irq: Option<u32>,
    /// Operation, FIFO, table and flash windows, in BAR order.
    pub ports: [Arc<dyn RegisterIo>; bar::pvcam::BAR_COUNT],
    /// PCI configuration space.
    pub config_space: Option<Box<dyn ConfigSpace>>,
    /// PCI address.
    pub pcie_address: Option<String>,
}

/// Assembles a [`BoardTable`] at load time.
#[derive(Debug)]
pub struct BoardTableBuilder {
    config: DriverConfig,
    clock: Arc<dyn Clock>,
    allocator: Arc<dyn BlockAllocator>,
    arcs: Vec<ArcBinding>,
    pvcams: Vec<PvcamBinding>,
}

impl BoardTableBuilder {
    /// Builder with host clock and host DMA allocator.
    pub fn new(config: DriverConfig) -> Self {
        let clock = Arc::new(HostClock::new(config.timing.yield_strategy));
        let allocator = Arc::new(HostBlockAllocator::new(config.page_size));
        Self {
            config,
            clock,
            allocator,
            arcs: Vec::new(),
            pvcams: Vec::new(),
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the DMA block allocator.
    #[must_use]
    pub fn allocator(mut self, allocator: Arc<dyn BlockAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Add an ARC board.
    #[must_use]
    pub fn arc(mut self, binding: ArcBinding) -> Self {
        self.arcs.push(binding);
        self
    }

    /// Add a PVCAM board.
    #[must_use]
    pub fn pvcam(mut self, binding: PvcamBinding) -> Self {
        self.pvcams.push(binding);
        self
    }

    /// Bind every board. ARC boards take the low indices, PVCAM boards follow.
    ///
    /// # Errors
    ///
    /// Returns an error if a family exceeds its board limit or a scatter-gather
    /// table cannot be allocated.
    pub fn build(self) -> Result<Arc<BoardTable>> {
        if self.arcs.len() > ARC_MAX_BOARDS || self.pvcams.len() > PVCAM_MAX_BOARDS {
            return Err(DriverError::invalid_argument(format!(
                "{} ARC / {} PVCAM boards exceed the {ARC_MAX_BOARDS}/{PVCAM_MAX_BOARDS} limit",
                self.arcs.len(),
                self.pvcams.len()
            )));
        }

        let settle = self.config.timing.settle;
        let budget = WaitBudget::from(&self.config.timing);
        let regs = |io: Arc<dyn RegisterIo>| Registers::new(io, Arc::clone(&self.clock), settle);
        let mut boards = Vec::with_capacity(self.arcs.len() + self.pvcams.len());

        for b in self.arcs {
            let index = boards.len();
            tracing::debug!("Binding {} as board {index}", b.name);
            boards.push(Arc::new(Board {
                index,
                name: b.name,
                pcie_address: b.pcie_address,
                irq: b.irq,
                opened: AtomicBool::new(false),
                config_space: b.config_space,
                shared: IrqShared::default(),
                binding: Binding::Arc {
                    engine: ArcEngine::new(regs(b.registers), budget),
                    state: Arc::new(Mutex::new(ArcState::default())),
                },
            }));
        }

        for b in self.pvcams {
            let index = boards.len();
            tracing::debug!("Binding {} as board {index}", b.name);
            let [ops, fifo, table, flash] = b.ports;
            let sg = ScatterGatherTable::new(
                Arc::clone(&self.allocator),
                self.config.block_size(),
                self.config.pvcam.table_entries,
            )?;
            boards.push(Arc::new(Board {
                index,
                name: b.name,
                pcie_address: b.pcie_address,
                irq: b.irq,
                opened: AtomicBool::new(false),
                config_space: b.config_space,
                shared: IrqShared::default(),
                binding: Binding::Pvcam {
                    ports: PvcamPorts::new(regs(ops), regs(fifo), regs(table), regs(flash)),
                    state: Arc::new(Mutex::new(PvcamState::new(
                        sg,
                        self.config.pvcam.command_timeout,
                        2 * self.config.page_size,
                    ))),
                },
            }));
        }

        tracing::info!("Board table ready: {} board(s)", boards.len());

        Ok(Arc::new(BoardTable {
            boards,
            arena: Mutex::new(ImageArena::new(self.config.image_region, self.config.page_size)),
            config: self.config,
        }))
    }
}

/// All bound boards.
#[derive(Debug)]
pub struct BoardTable {
    boards: Vec<Arc<Board>>,
    arena: Mutex<ImageArena>,
    config: DriverConfig,
}

impl BoardTable {
    /// Start building a table.
    pub fn builder(config: DriverConfig) -> BoardTableBuilder {
        BoardTableBuilder::new(config)
    }

    /// Discover boards under `sysfs_root` and bind them to real hardware.
    ///
    /// Boards that fail to bind are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the PCI device directory cannot be read.
    pub fn probe_host(config: DriverConfig, sysfs_root: &Path) -> Result<Arc<Self>> {
        let mut builder = Self::builder(config);
        for info in discover(sysfs_root)? {
            builder = match bind_host_board(&info, sysfs_root) {
                Ok(HostBinding::Arc(b)) => builder.arc(b),
                Ok(HostBinding::Pvcam(b)) => builder.pvcam(b),
                Err(e) => {
                    tracing::warn!("Skipping {} board {}: {e}", info.kind, info.pcie_address);
                    builder
                }
            };
        }
        builder.build()
    }

    /// Bound boards, by index.
    pub fn boards(&self) -> &[Arc<Board>] {
        &self.boards
    }

    /// Driver configuration in force.
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Validate a minor number and return its board.
    ///
    /// # Errors
    ///
    /// - `BadDeviceNumber` if `index` is outside the table
    /// - `NoSuchDevice` if nothing was bound there
    pub fn board(&self, index: usize) -> Result<&Arc<Board>> {
        if index >= MAX_BOARDS {
            return Err(DriverError::BadDeviceNumber {
                index,
                count: MAX_BOARDS,
            });
        }
        self.boards.get(index).ok_or(DriverError::NoSuchDevice { index })
    }

    fn claim(&self, index: usize, variant: BoardVariant) -> Result<Arc<Board>> {
        let board = self.board(index)?;
        if board.variant() != variant || board.irq.is_none() {
            return Err(DriverError::NoSuchDevice { index });
        }
        board.try_claim()?;
        Ok(Arc::clone(board))
    }

    /// Open an ARC board for exclusive use.
    ///
    /// # Errors
    ///
    /// Returns `BadDeviceNumber`, `NoSuchDevice` or `AlreadyOpen`.
    pub fn open_arc(self: &Arc<Self>, index: usize) -> Result<ArcSession> {
        let board = self.claim(index, BoardVariant::Arc)?;
        ArcSession::start(Arc::clone(self), board)
    }

    /// Open a PVCAM board for exclusive use.
    ///
    /// # Errors
    ///
    /// Returns `BadDeviceNumber`, `NoSuchDevice` or `AlreadyOpen`.
    pub fn open_pvcam(self: &Arc<Self>, index: usize) -> Result<PvcamSession> {
        let board = self.claim(index, BoardVariant::Pvcam)?;
        PvcamSession::start(board)
    }

    pub(crate) fn arena(&self) -> MutexGuard<'_, ImageArena> {
        lock(&self.arena)
    }

    /// Image buffers currently carved from the reserved region.
    pub fn image_claims(&self) -> usize {
        self.arena().outstanding()
    }

    /// Whether any board of `variant` is open.
    pub fn any_open(&self, variant: BoardVariant) -> bool {
        self.boards
            .iter()
            .any(|b| b.variant() == variant && b.is_open())
    }
}

enum HostBinding {
    Arc(ArcBinding),
    Pvcam(PvcamBinding),
}

fn bind_host_board(info: &BoardInfo, sysfs_root: &Path) -> Result<HostBinding> {
    let config_space: Option<Box<dyn ConfigSpace>> =
        Some(Box::new(SysfsConfigSpace::open(sysfs_root, &info.pcie_address)?));
    let name = format!("{} {}", info.kind, info.pcie_address);

    Ok(match info.kind {
        BoardVariant::Arc => HostBinding::Arc(ArcBinding {
            name,
            irq: info.irq,
            registers: Arc::new(MappedRegion::map_bar(
                sysfs_root,
                &info.pcie_address,
                bar::arc::REGISTER_BAR,
            )?),
            config_space,
            pcie_address: Some(info.pcie_address.clone()),
        }),
        BoardVariant::Pvcam => {
            let port = |bar: usize| -> Result<Arc<dyn RegisterIo>> {
                Ok(Arc::new(PortRegion::open(sysfs_root, &info.pcie_address, bar)?))
            };
            HostBinding::Pvcam(PvcamBinding {
                name,
                irq: info.irq,
                ports: [
                    port(bar::pvcam::OPERATION_BAR)?,
                    port(bar::pvcam::FIFO_BAR)?,
                    port(bar::pvcam::TABLE_BAR)?,
                    port(bar::pvcam::FLASH_BAR)?,
                ],
                config_space,
                pcie_address: Some(info.pcie_address.clone()),
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn token_encodes_index_plus_one() {
        let t = IrqToken::for_index(0);
        assert_eq!((t.raw(), t.index()), (1, 0));
        assert_eq!(IrqToken::decode(5).map(IrqToken::index), Some(4));
        assert_eq!(IrqToken::decode(0), None);
        assert_eq!(IrqToken::decode(MAX_BOARDS as u32 + 1), None);
    }

    #[test]
    fn lock_mode_sequence() {
        assert_eq!(LockMode::WritePending.acknowledged(), LockMode::ReadPending);
        assert_eq!(LockMode::ReadPending.acknowledged(), LockMode::None);
        assert_eq!(LockMode::None.acknowledged(), LockMode::None);
    }

    #[test]
    fn acknowledge_before_wait_is_not_lost() {
        let shared = IrqShared::default();
        shared.set_lock_mode(LockMode::WritePending);
        shared.set_busy(true);
        let ticket = shared.events().ticket();

        shared.acknowledge();

        assert!(shared.events().wait_for_event(ticket, Duration::from_millis(1)));
        assert_eq!(shared.lock_mode(), LockMode::ReadPending);
        assert!(!shared.is_busy());
    }

    #[test]
    fn wait_while_wakes_on_cross_thread_update() {
        let shared = Arc::new(IrqShared::default());
        shared.set_lock_mode(LockMode::ReadPending);

        let irq = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                shared.acknowledge();
            })
        };

        let done = shared
            .events()
            .wait_while(Duration::from_secs(5), || shared.lock_mode() == LockMode::ReadPending);
        irq.join().unwrap();
        assert!(done);
        assert_eq!(shared.lock_mode(), LockMode::None);
    }

    #[test]
    fn wait_times_out_without_event() {
        let ch = WaitChannel::default();
        let t = ch.ticket();
        assert!(!ch.wait_for_event(t, Duration::from_millis(2)));
    }
}
