//! Register access layer
//!
//! [`RegisterIo`] is the raw access seam: a memory-mapped BAR
//! ([`MappedRegion`]), an I/O-port BAR reached through its sysfs resource
//! file ([`PortRegion`]), or a simulated board. [`Registers`] wraps any of
//! them with the settle delay the boards need between accesses.
//!
//! Accesses return no errors. A bad offset is a programming error and
//! panics; a failed port transfer reads as all-ones, as a master abort
//! would on the bus.

// Registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_ptr_alignment)]

use crate::error::{DriverError, Result};
use crate::timing::Clock;
use rustix::fs::OFlags;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsFd;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

/// Raw 16/32-bit register access at byte offsets.
pub trait RegisterIo: Debug + Send + Sync {
    /// Read a 32-bit register.
    fn read32(&self, offset: usize) -> u32;
    /// Read a 16-bit register.
    fn read16(&self, offset: usize) -> u16;
    /// Write a 32-bit register.
    fn write32(&self, offset: usize, value: u32);
    /// Write a 16-bit register.
    fn write16(&self, offset: usize, value: u16);
}

/// Register window with a settle delay before every access.
#[derive(Debug, Clone)]
pub struct Registers {
    io: Arc<dyn RegisterIo>,
    clock: Arc<dyn Clock>,
    settle: Duration,
}

impl Registers {
    /// Wrap a raw window.
    pub fn new(io: Arc<dyn RegisterIo>, clock: Arc<dyn Clock>, settle: Duration) -> Self {
        Self { io, clock, settle }
    }

    /// Clock used for settle delays and poll waits.
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Read a 32-bit register.
    pub fn read32(&self, offset: usize) -> u32 {
        self.clock.settle(self.settle);
        self.io.read32(offset)
    }

    /// Read a 16-bit register.
    pub fn read16(&self, offset: usize) -> u16 {
        self.clock.settle(self.settle);
        self.io.read16(offset)
    }

    /// Write a 32-bit register.
    pub fn write32(&self, offset: usize, value: u32) {
        self.clock.settle(self.settle);
        self.io.write32(offset, value);
    }

    /// Write a 16-bit register.
    pub fn write16(&self, offset: usize, value: u16) {
        self.clock.settle(self.settle);
        self.io.write16(offset, value);
    }
}

/// Memory-mapped window: a PCI BAR, or physical memory through `/dev/mem`.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
    label: String,
}

impl Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("label", &self.label)
            .finish()
    }
}

// SAFETY: Send - MappedRegion owns the mapping exclusively. Moving between threads
// doesn't invalidate the mapping (mmap'd memory is process-wide). No thread-local state.
unsafe impl Send for MappedRegion {}

// SAFETY: Sync - all accesses are single volatile loads/stores of naturally aligned
// words, bounds-checked against the mapping. The hardware serialises them.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map BAR `bar` of the device at `pcie_address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource file cannot be opened, is empty or
    /// cannot be mapped.
    pub fn map_bar(sysfs_root: &Path, pcie_address: &str, bar: usize) -> Result<Self> {
        let path = sysfs_root
            .join("bus/pci/devices")
            .join(pcie_address)
            .join(format!("resource{bar}"));

        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        // Truncation acceptable: BAR sizes fit in usize on 64-bit targets
        #[allow(clippy::cast_possible_truncation)]
        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(DriverError::invalid_argument(format!(
                "{} is empty (device not enabled?)",
                path.display()
            )));
        }

        Self::map_file(file, 0, size, format!("{pcie_address} BAR{bar}"))
    }

    /// Map `size` bytes of physical memory at `phys` through `/dev/mem`.
    ///
    /// The file is opened `O_SYNC`, which makes the mapping uncached.
    ///
    /// # Errors
    ///
    /// Returns an error if `/dev/mem` cannot be opened or mapped.
    pub fn map_physical(phys: u64, size: usize) -> Result<Self> {
        // OFlags::SYNC bits are small positive values
        #[allow(clippy::cast_possible_wrap)]
        let sync_flag = OFlags::SYNC.bits() as i32;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(sync_flag)
            .open("/dev/mem")?;

        Self::map_file(file, phys, size, format!("phys {phys:#x}"))
    }

    fn map_file(file: File, offset: u64, size: usize, label: String) -> Result<Self> {
        // SAFETY: mmap of a device or /dev/mem file. Invariants: (1) file is open
        // read/write and kept alive in the struct for the mapping's lifetime;
        // (2) size is non-zero; (3) MAP_SHARED so stores reach the device;
        // (4) the mapping is unmapped exactly once in Drop.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                offset,
            )
        }
        .map_err(|e| DriverError::invalid_argument(format!("mmap {label} failed: {e}")))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| DriverError::invalid_argument(format!("mmap {label} returned null")))?;

        tracing::info!("Mapped {label} ({size:#x} bytes at {ptr:p})");

        Ok(Self {
            ptr,
            size,
            _file: file,
            label,
        })
    }

    /// Size of the mapping.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Start of the mapping in this process.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn check(&self, offset: usize, width: usize) {
        assert!(
            offset + width <= self.size,
            "register offset {offset:#x} out of bounds for {}",
            self.label
        );
    }
}

impl RegisterIo for MappedRegion {
    fn read32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        // SAFETY: read_volatile for MMIO - hardware can change the value.
        // Invariants: ptr valid for size bytes; offset+4 <= size; aligned.
        unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(offset).cast::<u32>()) }
    }

    fn read16(&self, offset: usize) -> u16 {
        self.check(offset, 2);
        // SAFETY: as read32, two bytes.
        unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(offset).cast::<u16>()) }
    }

    fn write32(&self, offset: usize, value: u32) {
        self.check(offset, 4);
        // SAFETY: write_volatile for MMIO - triggers hardware side effects.
        // Invariants: ptr valid for size bytes; offset+4 <= size; aligned.
        unsafe { std::ptr::write_volatile(self.ptr.as_ptr().add(offset).cast::<u32>(), value) }
    }

    fn write16(&self, offset: usize, value: u16) {
        self.check(offset, 2);
        // SAFETY: as write32, two bytes.
        unsafe { std::ptr::write_volatile(self.ptr.as_ptr().add(offset).cast::<u16>(), value) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from the successful mmap in map_file and Drop
        // runs at most once; no references into the mapping outlive self.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.size);
        }
        tracing::debug!("Unmapped {}", self.label);
    }
}

/// I/O-port BAR accessed with positioned reads and writes on its sysfs
/// resource file. The kernel turns each 2- or 4-byte transfer into one
/// `inw`/`inl` or `outw`/`outl`.
#[derive(Debug)]
pub struct PortRegion {
    file: File,
    label: String,
}

impl PortRegion {
    /// Open I/O BAR `bar` of the device at `pcie_address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource file cannot be opened.
    pub fn open(sysfs_root: &Path, pcie_address: &str, bar: usize) -> Result<Self> {
        let path = sysfs_root
            .join("bus/pci/devices")
            .join(pcie_address)
            .join(format!("resource{bar}"));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        tracing::debug!("Opened I/O window {}", path.display());
        Ok(Self {
            file,
            label: format!("{pcie_address} BAR{bar}"),
        })
    }

    fn read_bytes<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut buf = [0xFF; N];
        if let Err(e) = self.file.read_exact_at(&mut buf, offset as u64) {
            tracing::warn!("{}: port read at {offset:#x} failed: {e}", self.label);
            buf = [0xFF; N];
        }
        buf
    }

    fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        if let Err(e) = self.file.write_all_at(bytes, offset as u64) {
            tracing::warn!("{}: port write at {offset:#x} failed: {e}", self.label);
        }
    }
}

impl RegisterIo for PortRegion {
    fn read32(&self, offset: usize) -> u32 {
        u32::from_ne_bytes(self.read_bytes(offset))
    }

    fn read16(&self, offset: usize) -> u16 {
        u16::from_ne_bytes(self.read_bytes(offset))
    }

    fn write32(&self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_ne_bytes());
    }

    fn write16(&self, offset: usize, value: u16) {
        self.write_bytes(offset, &value.to_ne_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::VirtualClock;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Scratch(Mutex<[u32; 4]>);

    impl RegisterIo for Scratch {
        fn read32(&self, offset: usize) -> u32 {
            self.0.lock().unwrap()[offset / 4]
        }
        fn read16(&self, offset: usize) -> u16 {
            self.read32(offset) as u16
        }
        fn write32(&self, offset: usize, value: u32) {
            self.0.lock().unwrap()[offset / 4] = value;
        }
        fn write16(&self, offset: usize, value: u16) {
            self.write32(offset, u32::from(value));
        }
    }

    #[test]
    fn every_access_pays_the_settle_delay() {
        let clock = Arc::new(VirtualClock::new());
        let regs = Registers::new(
            Arc::new(Scratch::default()),
            clock.clone(),
            Duration::from_nanos(500),
        );

        regs.write32(4, 0xABCD_0123);
        assert_eq!(regs.read32(4), 0xABCD_0123);
        regs.write16(8, 0x55);
        assert_eq!(regs.read16(8), 0x55);

        assert_eq!(clock.elapsed(), Duration::from_nanos(2000));
    }

    #[test]
    fn port_region_uses_positioned_io() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("bus/pci/devices/0000:05:00.0");
        std::fs::create_dir_all(&dev).unwrap();
        std::fs::write(dev.join("resource1"), [0u8; 16]).unwrap();

        let port = PortRegion::open(dir.path(), "0000:05:00.0", 1).unwrap();
        port.write32(4, 0x1122_3344);
        port.write16(8, 0xBEEF);
        assert_eq!(port.read32(4), 0x1122_3344);
        assert_eq!(port.read16(8), 0xBEEF);
        // past the end of the file reads as a master abort
        assert_eq!(port.read32(64), 0xFFFF_FFFF);
    }
}
