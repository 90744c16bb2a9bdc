//! Scatter-gather DMA buffers
//!
//! An exposure buffer is a chain of physically contiguous blocks. The bus
//! address and length of each block go into a descriptor table that lives
//! in DMA memory of its own; the board walks the table until it meets a
//! zeroed entry.
//!
//! ```text
//! table block (capacity × 8 bytes)          data blocks
//! ┌────────────┬────────────┐
//! │ bus  (u32) │ size (u32) │ ──────────▶ [ block_size bytes ]
//! │ bus  (u32) │ size (u32) │ ──────────▶ [ block_size bytes ]
//! │ bus  (u32) │ size (u32) │ ──────────▶ [ remainder        ]
//! │ 0          │ 0          │  terminator
//! └────────────┴────────────┘
//! ```

use crate::error::{DriverError, Result};
use crate::user::UserBuffer;
use ccdpci_chip::pvcam::TABLE_ENTRY_SIZE;
use rustix::mm::{mlock, munlock};
use std::fmt::Debug;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One physically contiguous block the device can reach.
pub trait BlockMemory: Debug + Send + Sync {
    /// Device-visible address of the first byte.
    fn bus_address(&self) -> u64;

    /// Length in bytes.
    fn len(&self) -> usize;

    /// Whether the block is zero-sized.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy bytes out of the block.
    ///
    /// # Panics
    ///
    /// Panics if `offset + dst.len()` exceeds the block.
    fn read(&self, offset: usize, dst: &mut [u8]);

    /// Copy bytes into the block.
    ///
    /// # Panics
    ///
    /// Panics if `offset + src.len()` exceeds the block.
    fn write(&self, offset: usize, src: &[u8]);
}

/// Source of DMA blocks.
pub trait BlockAllocator: Debug + Send + Sync {
    /// Allocate one zeroed block of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::OutOfMemory` when no block can be provided.
    fn allocate(&self, size: usize) -> Result<Arc<dyn BlockMemory>>;

    /// Return a block.
    fn free(&self, block: Arc<dyn BlockMemory>) {
        drop(block);
    }
}

/// Page-aligned, locked host memory.
///
/// Blocks get bus addresses from a private IOVA counter; the host maps each
/// block at that address in the device's IOMMU domain.
#[derive(Debug)]
pub struct HostBlockAllocator {
    next_iova: AtomicU64,
    page_size: usize,
}

impl HostBlockAllocator {
    /// First bus address handed out.
    pub const IOVA_BASE: u64 = 0x1000_0000;

    /// Allocator for the given page size.
    pub fn new(page_size: usize) -> Self {
        Self {
            next_iova: AtomicU64::new(Self::IOVA_BASE),
            page_size,
        }
    }
}

impl BlockAllocator for HostBlockAllocator {
    fn allocate(&self, size: usize) -> Result<Arc<dyn BlockMemory>> {
        let aligned = size.div_ceil(self.page_size).max(1) * self.page_size;
        let iova = self.next_iova.fetch_add(aligned as u64, Ordering::Relaxed);
        Ok(Arc::new(PinnedBlock::new(aligned, size, iova, self.page_size)?))
    }
}

/// Locked, zeroed, page-aligned heap block.
#[derive(Debug)]
pub struct PinnedBlock {
    ptr: NonNull<u8>,
    layout: std::alloc::Layout,
    len: usize,
    iova: u64,
}

// SAFETY: Send - the block owns its allocation; nothing in it is tied to a thread.
unsafe impl Send for PinnedBlock {}

// SAFETY: Sync - read/write copy whole ranges with bounds checks. Concurrent
// writers are the device and one session, serialised by the board protocol.
unsafe impl Sync for PinnedBlock {}

impl PinnedBlock {
    fn new(aligned: usize, len: usize, iova: u64, page_size: usize) -> Result<Self> {
        let layout = std::alloc::Layout::from_size_align(aligned, page_size)
            .map_err(|e| DriverError::invalid_argument(format!("DMA block layout: {e}")))?;

        // SAFETY: layout has non-zero size (aligned >= page_size) and a power-of-two
        // alignment; the pointer is released in Drop with the same layout.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(DriverError::OutOfMemory { entries: 0 })?;

        // SAFETY: [ptr, ptr+aligned) lies entirely within the allocation above.
        if let Err(e) = unsafe { mlock(ptr.as_ptr().cast(), aligned) } {
            // SAFETY: allocated above with this exact layout.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
            tracing::warn!("Failed to lock DMA block: {e}");
            return Err(DriverError::OutOfMemory { entries: 0 });
        }

        Ok(Self {
            ptr,
            layout,
            len,
            iova,
        })
    }
}

impl BlockMemory for PinnedBlock {
    fn bus_address(&self) -> u64 {
        self.iova
    }

    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.len, "DMA block read out of bounds");
        // SAFETY: range checked above; source and destination never overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    fn write(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len, "DMA block write out of bounds");
        // SAFETY: range checked above; source and destination never overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
    }
}

impl Drop for PinnedBlock {
    fn drop(&mut self) {
        // SAFETY: ptr/layout from new(); the block was locked there and Drop runs once.
        unsafe {
            let _ = munlock(self.ptr.as_ptr().cast(), self.layout.size());
            std::alloc::dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

/// One descriptor: where a block lives and how many bytes of it are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    /// Device-visible address.
    pub bus: u64,
    /// Bytes used.
    pub size: usize,
}

/// Descriptor table plus the blocks it describes.
#[derive(Debug)]
pub struct ScatterGatherTable {
    allocator: Arc<dyn BlockAllocator>,
    block_size: usize,
    capacity: usize,
    table: Arc<dyn BlockMemory>,
    blocks: Vec<Arc<dyn BlockMemory>>,
    entries: Vec<SgEntry>,
}

impl ScatterGatherTable {
    /// Allocate an empty table of `capacity` descriptors (terminator included).
    ///
    /// # Errors
    ///
    /// Returns an error if the table block cannot be allocated.
    pub fn new(allocator: Arc<dyn BlockAllocator>, block_size: usize, capacity: usize) -> Result<Self> {
        if block_size == 0 || capacity < 2 {
            return Err(DriverError::invalid_argument(
                "scatter-gather table needs a block size and room for a terminator",
            ));
        }
        let table = allocator.allocate(capacity * TABLE_ENTRY_SIZE)?;
        Ok(Self {
            allocator,
            block_size,
            capacity,
            table,
            blocks: Vec::new(),
            entries: Vec::new(),
        })
    }

    /// Bytes per full block.
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Most blocks one buffer may use.
    pub const fn max_blocks(&self) -> usize {
        self.capacity - 1
    }

    /// Populated descriptor count.
    pub fn used_entries(&self) -> usize {
        self.blocks.len()
    }

    /// Populated descriptors in table order.
    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    /// Total bytes described.
    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Bus address the board reads the table from.
    pub fn table_bus_address(&self) -> u64 {
        self.table.bus_address()
    }

    /// Build a chain of blocks covering `total_bytes`.
    ///
    /// Any previous chain is released first. On allocation failure the blocks
    /// obtained so far stay recorded (for [`release`](Self::release)) and the
    /// table is left unterminated for the device.
    ///
    /// # Errors
    ///
    /// - `OutOfCapacity` if the chain would not fit the table (the table is left empty)
    /// - `OutOfMemory` if a block allocation fails part way
    pub fn allocate(&mut self, total_bytes: usize) -> Result<()> {
        if total_bytes == 0 {
            return Err(DriverError::invalid_argument("buffer size must be non-zero"));
        }
        self.release();
        let blocks = total_bytes.div_ceil(self.block_size);
        if blocks > self.max_blocks() {
            return Err(DriverError::OutOfCapacity {
                blocks,
                capacity: self.max_blocks(),
            });
        }

        self.table.write(0, &vec![0; self.capacity * TABLE_ENTRY_SIZE]);

        let mut remaining = total_bytes;
        for i in 0..blocks {
            let size = remaining.min(self.block_size);
            let block = match self.allocator.allocate(self.block_size) {
                Ok(block) => block,
                Err(e) => {
                    tracing::warn!("DMA block {i}/{blocks} allocation failed: {e}");
                    return Err(DriverError::OutOfMemory { entries: i });
                }
            };
            let bus = u32::try_from(block.bus_address()).map_err(|_| {
                DriverError::invalid_argument(format!(
                    "block bus address {:#x} beyond 32-bit reach",
                    block.bus_address()
                ))
            });
            let bus = match bus {
                Ok(bus) => bus,
                Err(e) => {
                    self.allocator.free(block);
                    return Err(e);
                }
            };

            let mut descriptor = [0u8; TABLE_ENTRY_SIZE];
            descriptor[..4].copy_from_slice(&bus.to_le_bytes());
            // size <= block_size, far below u32::MAX
            #[allow(clippy::cast_possible_truncation)]
            descriptor[4..].copy_from_slice(&(size as u32).to_le_bytes());
            self.table.write(i * TABLE_ENTRY_SIZE, &descriptor);

            self.entries.push(SgEntry {
                bus: block.bus_address(),
                size,
            });
            self.blocks.push(block);
            remaining -= size;
        }

        tracing::debug!(
            "Built scatter-gather chain: {total_bytes} bytes in {blocks} blocks, table at {:#x}",
            self.table.bus_address()
        );
        Ok(())
    }

    /// Free every block and zero the descriptor count. No-op when empty.
    pub fn release(&mut self) {
        if self.blocks.is_empty() {
            return;
        }
        tracing::debug!("Releasing {} DMA blocks", self.blocks.len());
        for block in self.blocks.drain(..) {
            self.allocator.free(block);
        }
        self.entries.clear();
    }

    /// Copy `total_bytes` of collected data into `dest`, block by block.
    ///
    /// # Errors
    ///
    /// Returns `UserCopyFault` if `dest` cannot take the data.
    pub fn collect(&self, total_bytes: usize, dest: &mut dyn UserBuffer) -> Result<usize> {
        let mut remaining = total_bytes.min(self.total_bytes());
        let mut offset = 0;
        let mut chunk = vec![0u8; self.block_size];

        for (block, entry) in self.blocks.iter().zip(&self.entries) {
            if remaining == 0 {
                break;
            }
            let n = remaining.min(entry.size);
            block.read(0, &mut chunk[..n]);
            dest.copy_to_user(offset, &chunk[..n])?;
            offset += n;
            remaining -= n;
        }
        Ok(offset)
    }

    /// Read descriptor `index` back from the table memory the device sees.
    pub fn descriptor(&self, index: usize) -> SgEntry {
        let mut raw = [0u8; TABLE_ENTRY_SIZE];
        self.table.read(index * TABLE_ENTRY_SIZE, &mut raw);
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        SgEntry {
            bus: u64::from(word(0)),
            size: word(4) as usize,
        }
    }
}

impl Drop for ScatterGatherTable {
    fn drop(&mut self) {
        self.release();
        self.allocator.free(Arc::clone(&self.table));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBusMemory;

    fn table(memory: &Arc<SimBusMemory>, block: usize, capacity: usize) -> ScatterGatherTable {
        ScatterGatherTable::new(memory.clone(), block, capacity).unwrap()
    }

    #[test]
    fn sizes_sum_to_total_with_short_tail() {
        let memory = Arc::new(SimBusMemory::new());
        let mut sg = table(&memory, 16_384, 8192);

        for total in [1, 4096, 16_384, 16_385, 132_000, 1_000_000] {
            sg.allocate(total).unwrap();
            let entries = sg.entries();
            assert_eq!(sg.total_bytes(), total);
            let (last, full) = entries.split_last().unwrap();
            assert!(full.iter().all(|e| e.size == 16_384));
            assert!(last.size > 0 && last.size <= 16_384);
            assert_eq!(sg.used_entries(), total.div_ceil(16_384));
        }
    }

    #[test]
    fn over_capacity_fails_and_leaves_table_empty() {
        let memory = Arc::new(SimBusMemory::new());
        let mut sg = table(&memory, 4096, 4);
        let err = sg.allocate(4 * 4096).unwrap_err();
        assert!(matches!(err, DriverError::OutOfCapacity { blocks: 4, capacity: 3 }));
        assert_eq!(sg.used_entries(), 0);
        sg.allocate(3 * 4096).unwrap();
        assert_eq!(sg.used_entries(), 3);
    }

    #[test]
    fn over_capacity_drops_existing_chain() {
        let memory = Arc::new(SimBusMemory::new());
        let mut sg = table(&memory, 4096, 4);
        sg.allocate(4096).unwrap();
        assert_eq!(memory.outstanding(), 2);

        let err = sg.allocate(4 * 4096).unwrap_err();
        assert!(matches!(err, DriverError::OutOfCapacity { blocks: 4, capacity: 3 }));
        assert_eq!(sg.used_entries(), 0);
        assert!(sg.entries().is_empty());
        // only the table itself stays allocated
        assert_eq!(memory.outstanding(), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let memory = Arc::new(SimBusMemory::new());
        let mut sg = table(&memory, 4096, 16);
        sg.allocate(10_000).unwrap();
        assert_eq!(memory.outstanding(), 4);

        sg.release();
        assert_eq!((sg.used_entries(), memory.outstanding()), (0, 1));
        sg.release();
        assert_eq!((sg.used_entries(), memory.outstanding()), (0, 1));
    }

    #[test]
    fn partial_allocation_records_successes() {
        let memory = Arc::new(SimBusMemory::new());
        let mut sg = table(&memory, 4096, 16);
        memory.fail_after(3);

        let err = sg.allocate(10 * 4096).unwrap_err();
        assert!(matches!(err, DriverError::OutOfMemory { entries: 3 }));
        assert_eq!(sg.used_entries(), 3);

        sg.release();
        assert_eq!(memory.outstanding(), 1);
    }

    #[test]
    fn descriptors_are_terminated_in_device_memory() {
        let memory = Arc::new(SimBusMemory::new());
        let mut sg = table(&memory, 4096, 8);
        sg.allocate(9000).unwrap();

        for (i, e) in sg.entries().iter().enumerate() {
            assert_eq!(sg.descriptor(i), *e);
        }
        assert_eq!(sg.descriptor(3), SgEntry { bus: 0, size: 0 });
    }

    #[test]
    fn collect_copies_blocks_in_order() {
        let memory = Arc::new(SimBusMemory::new());
        let mut sg = table(&memory, 4, 8);
        sg.allocate(10).unwrap();
        for (i, e) in sg.entries().to_vec().into_iter().enumerate() {
            let fill = vec![i as u8 + 1; e.size];
            memory.write_bus(e.bus, &fill);
        }

        let mut dest = vec![0u8; 10];
        assert_eq!(sg.collect(10, &mut dest).unwrap(), 10);
        assert_eq!(dest, [1, 1, 1, 1, 2, 2, 2, 2, 3, 3]);
    }
}
