//! PCI discovery and configuration space
//!
//! Boards are found by scanning `<sysfs>/bus/pci/devices/*` for the two
//! vendor/device pairs. Nothing is hardcoded beyond the IDs; the sysfs root
//! is a parameter so the scan can run against a fixture tree.

use crate::error::{DriverError, Result};
use ccdpci_chip::pcie::BoardVariant;
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Size of conventional PCI configuration space.
pub const CONFIG_SPACE_SIZE: u32 = 256;

/// `IORESOURCE_IO` flag in a sysfs `resource` line.
const IORESOURCE_IO: u64 = 0x100;

/// Access width for configuration-space reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWidth {
    /// 8 bits.
    Byte,
    /// 16 bits.
    Word,
    /// 32 bits.
    Dword,
}

impl ConfigWidth {
    /// Width in bytes.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
        }
    }

    /// Reject accesses that run past the end or are misaligned.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a bad offset.
    pub fn check(self, offset: u32) -> Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        let n = self.bytes() as u32;
        let past_end = offset.checked_add(n).map_or(true, |end| end > CONFIG_SPACE_SIZE);
        if offset % n != 0 || past_end {
            return Err(DriverError::invalid_argument(format!(
                "{self:?} access at config offset {offset:#x}"
            )));
        }
        Ok(())
    }
}

impl std::str::FromStr for ConfigWidth {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "byte" | "8" => Ok(Self::Byte),
            "word" | "16" => Ok(Self::Word),
            "dword" | "32" => Ok(Self::Dword),
            other => Err(DriverError::invalid_argument(format!(
                "unknown config width '{other}'"
            ))),
        }
    }
}

/// Little-endian PCI configuration space.
pub trait ConfigSpace: Debug + Send + Sync {
    /// Read `width` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a bad offset, or the access error.
    fn read(&self, offset: u32, width: ConfigWidth) -> Result<u32>;

    /// Write the low `width` bytes of `value` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a bad offset, or the access error.
    fn write(&self, offset: u32, width: ConfigWidth, value: u32) -> Result<()>;
}

/// Configuration space through the device's sysfs `config` file.
#[derive(Debug)]
pub struct SysfsConfigSpace {
    file: File,
    path: PathBuf,
}

impl SysfsConfigSpace {
    /// Open `<sysfs_root>/bus/pci/devices/<addr>/config`, read-write when
    /// permitted, read-only otherwise.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened at all.
    pub fn open(sysfs_root: &Path, pcie_address: &str) -> Result<Self> {
        let path = device_dir(sysfs_root, pcie_address).join("config");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .or_else(|_| File::open(&path))?;
        Ok(Self { file, path })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSpace for SysfsConfigSpace {
    fn read(&self, offset: u32, width: ConfigWidth) -> Result<u32> {
        width.check(offset)?;
        let mut bytes = [0u8; 4];
        self.file
            .read_exact_at(&mut bytes[..width.bytes()], u64::from(offset))?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn write(&self, offset: u32, width: ConfigWidth, value: u32) -> Result<()> {
        width.check(offset)?;
        let bytes = value.to_le_bytes();
        self.file
            .write_all_at(&bytes[..width.bytes()], u64::from(offset))?;
        Ok(())
    }
}

/// One line of a sysfs `resource` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarRange {
    /// First address.
    pub start: u64,
    /// Last address (inclusive).
    pub end: u64,
    /// Resource flags.
    pub flags: u64,
}

impl BarRange {
    /// Length in bytes; zero for an unused BAR.
    #[must_use]
    pub const fn len(&self) -> u64 {
        if self.end > self.start {
            self.end - self.start + 1
        } else {
            0
        }
    }

    /// Whether the BAR is unused.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the BAR is an I/O-port window.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        self.flags & IORESOURCE_IO != 0
    }
}

/// A discovered board.
#[derive(Debug, Clone)]
pub struct BoardInfo {
    /// Board family.
    pub kind: BoardVariant,
    /// Position among boards of the same family, by PCI address.
    pub index: usize,
    /// PCI address (`0000:03:00.0`).
    pub pcie_address: String,
    /// Interrupt line; `None` when the kernel assigned none.
    pub irq: Option<u32>,
    /// The six standard BARs.
    pub bars: Vec<BarRange>,
}

fn device_dir(sysfs_root: &Path, pcie_address: &str) -> PathBuf {
    sysfs_root.join("bus/pci/devices").join(pcie_address)
}

fn read_hex_sysfs(path: &Path) -> Option<u16> {
    let content = std::fs::read_to_string(path).ok()?;
    u16::from_str_radix(content.trim().trim_start_matches("0x"), 16).ok()
}

fn read_irq(dir: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(dir.join("irq")).ok()?;
    content.trim().parse().ok().filter(|&irq| irq != 0)
}

fn parse_hex_u64(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

fn read_bars(dir: &Path) -> Vec<BarRange> {
    let Ok(content) = std::fs::read_to_string(dir.join("resource")) else {
        return Vec::new();
    };
    content
        .lines()
        .take(6)
        .filter_map(|line| {
            let mut fields = line.split_whitespace().map(parse_hex_u64);
            Some(BarRange {
                start: fields.next()??,
                end: fields.next()??,
                flags: fields.next()??,
            })
        })
        .collect()
}

/// Scan `<sysfs_root>/bus/pci/devices` for ARC and PVCAM boards.
///
/// Boards are returned sorted by PCI address, ARC boards first, and indexed
/// per family. Families beyond their board limit are truncated.
///
/// # Errors
///
/// Returns an I/O error if the device directory cannot be read.
pub fn discover(sysfs_root: &Path) -> Result<Vec<BoardInfo>> {
    let devices = sysfs_root.join("bus/pci/devices");
    let mut found: Vec<(BoardVariant, String, PathBuf)> = Vec::new();

    for entry in std::fs::read_dir(&devices)?.flatten() {
        let path = entry.path();
        let (Some(vendor), Some(device)) = (
            read_hex_sysfs(&path.join("vendor")),
            read_hex_sysfs(&path.join("device")),
        ) else {
            continue;
        };
        if let Some(kind) = BoardVariant::from_ids(vendor, device) {
            found.push((kind, entry.file_name().to_string_lossy().into_owned(), path));
        }
    }

    found.sort_by(|a, b| {
        let rank = |k: BoardVariant| u8::from(k == BoardVariant::Pvcam);
        (rank(a.0), &a.1).cmp(&(rank(b.0), &b.1))
    });

    let mut boards = Vec::with_capacity(found.len());
    for kind in [BoardVariant::Arc, BoardVariant::Pvcam] {
        let family: Vec<_> = found.iter().filter(|(k, ..)| *k == kind).collect();
        if family.len() > kind.max_boards() {
            tracing::warn!(
                "{} {kind} boards found, binding the first {}",
                family.len(),
                kind.max_boards()
            );
        }
        for (index, (_, addr, path)) in family.into_iter().take(kind.max_boards()).enumerate() {
            let info = BoardInfo {
                kind,
                index,
                pcie_address: addr.clone(),
                irq: read_irq(path),
                bars: read_bars(path),
            };
            tracing::info!("Found {kind} board {index} at {addr} (irq {:?})", info.irq);
            boards.push(info);
        }
    }
    Ok(boards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_device(root: &Path, addr: &str, vendor: &str, device: &str, irq: &str) -> PathBuf {
        let dir = root.join("bus/pci/devices").join(addr);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), format!("{vendor}\n")).unwrap();
        fs::write(dir.join("device"), format!("{device}\n")).unwrap();
        fs::write(dir.join("irq"), format!("{irq}\n")).unwrap();
        fs::write(
            dir.join("resource"),
            "0x00000000fe000000 0x00000000fe00009b 0x0000000000040200\n\
             0x000000000000e000 0x000000000000e03f 0x0000000000040101\n\
             0x0000000000000000 0x0000000000000000 0x0000000000000000\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn discovers_both_families_in_order() {
        let root = tempfile::tempdir().unwrap();
        fake_device(root.path(), "0000:05:00.0", "0x10e8", "0x81e6", "19");
        fake_device(root.path(), "0000:04:00.0", "0x1057", "0x1801", "17");
        fake_device(root.path(), "0000:02:00.0", "0x10e8", "0x81e6", "0");
        fake_device(root.path(), "0000:00:1f.0", "0x8086", "0xa30d", "0");

        let boards = discover(root.path()).unwrap();
        let summary: Vec<_> = boards
            .iter()
            .map(|b| (b.kind, b.index, b.pcie_address.as_str(), b.irq))
            .collect();
        assert_eq!(
            summary,
            vec![
                (BoardVariant::Arc, 0, "0000:04:00.0", Some(17)),
                (BoardVariant::Pvcam, 0, "0000:02:00.0", None),
                (BoardVariant::Pvcam, 1, "0000:05:00.0", Some(19)),
            ]
        );

        let bars = &boards[0].bars;
        assert_eq!(bars[0].len(), 0x9C);
        assert!(!bars[0].is_io());
        assert!(bars[1].is_io());
        assert!(bars[2].is_empty());
    }

    #[test]
    fn config_space_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let dir = fake_device(root.path(), "0000:04:00.0", "0x1057", "0x1801", "17");
        let mut config = vec![0u8; CONFIG_SPACE_SIZE as usize];
        config[..4].copy_from_slice(&[0x57, 0x10, 0x01, 0x18]);
        fs::write(dir.join("config"), &config).unwrap();

        let cfg = SysfsConfigSpace::open(root.path(), "0000:04:00.0").unwrap();
        assert_eq!(cfg.read(0, ConfigWidth::Word).unwrap(), 0x1057);
        assert_eq!(cfg.read(0, ConfigWidth::Dword).unwrap(), 0x1801_1057);

        cfg.write(0x0D, ConfigWidth::Byte, 0xFF).unwrap();
        assert_eq!(cfg.read(0x0C, ConfigWidth::Dword).unwrap(), 0x0000_FF00);

        assert!(cfg.read(0x0D, ConfigWidth::Word).is_err());
        assert!(cfg.read(0xFE, ConfigWidth::Dword).is_err());
    }

    #[test]
    fn width_parses_from_cli_spelling() {
        assert_eq!("word".parse::<ConfigWidth>().unwrap(), ConfigWidth::Word);
        assert!("nibble".parse::<ConfigWidth>().is_err());
    }
}
