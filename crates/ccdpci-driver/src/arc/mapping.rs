//! ARC image buffers
//!
//! Image buffers are carved from a reserved, physically contiguous region
//! configured at load time. Every live claim is tracked, so a buffer goes
//! back to the region when it is replaced or its session closes.

use crate::config::ImageRegion;
use crate::error::{DriverError, Result};

/// Page attributes a mapping must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapAttributes {
    /// Caching disabled on the mapped pages.
    pub uncached: bool,
    /// Pages are device memory: not dumped, not swapped, not copied on fork.
    pub io_memory: bool,
}

impl MapAttributes {
    /// Attributes of a DMA image buffer.
    pub const DMA_IMAGE: Self = Self {
        uncached: true,
        io_memory: true,
    };
}

/// Image buffer established by a mapping request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBuffer {
    /// Bus/physical address the DSP writes to.
    pub phys: u64,
    /// Caller's virtual address for the buffer.
    pub virt: usize,
    /// Length in bytes.
    pub size: usize,
    /// Page attributes.
    pub attributes: MapAttributes,
}

/// First-fit allocator over the reserved image region.
#[derive(Debug)]
pub struct ImageArena {
    region: Option<ImageRegion>,
    page_size: u64,
    /// Live claims as `(bus address, length)`, sorted by address.
    claims: Vec<(u64, u64)>,
}

impl ImageArena {
    /// Arena over `region`; with `None`, every claim fails.
    pub fn new(region: Option<ImageRegion>, page_size: usize) -> Self {
        Self {
            region,
            page_size: (page_size as u64).max(1),
            claims: Vec::new(),
        }
    }

    /// Carve `size` bytes, rounded up to whole pages, from the lowest gap
    /// that fits. Returns the bus address.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if no region is configured or `size` is zero
    /// - `OutOfMemory` if no gap is large enough
    pub fn claim(&mut self, size: usize) -> Result<u64> {
        let region = self
            .region
            .ok_or_else(|| DriverError::invalid_argument("no image region reserved"))?;
        if size == 0 {
            return Err(DriverError::invalid_argument("zero-length image buffer"));
        }

        let len = (size as u64).div_ceil(self.page_size) * self.page_size;
        let end = region.base + region.size;
        let mut cursor = region.base;
        let mut slot = self.claims.len();
        for (i, &(addr, used)) in self.claims.iter().enumerate() {
            if addr - cursor >= len {
                slot = i;
                break;
            }
            cursor = addr + used;
        }
        if slot == self.claims.len() && end.saturating_sub(cursor) < len {
            tracing::warn!(
                "Image region exhausted: {len} bytes requested, {} free",
                self.remaining()
            );
            return Err(DriverError::OutOfMemory { entries: 0 });
        }

        self.claims.insert(slot, (cursor, len));
        Ok(cursor)
    }

    /// Return the claim starting at `addr`. Returns false if none does.
    pub fn release(&mut self, addr: u64) -> bool {
        match self.claims.iter().position(|&(a, _)| a == addr) {
            Some(i) => {
                self.claims.remove(i);
                true
            }
            None => false,
        }
    }

    /// Number of live claims.
    pub fn outstanding(&self) -> usize {
        self.claims.len()
    }

    /// Bytes not covered by a live claim.
    pub fn remaining(&self) -> u64 {
        let used: u64 = self.claims.iter().map(|&(_, len)| len).sum();
        self.region.map_or(0, |r| r.size - used)
    }
}
