//! `ccdpci`: command-line access to ARC and PVCAM frame-grabber boards.
//!
//! ```text
//! USAGE:
//!   ccdpci enumerate                       List ARC and PVCAM boards
//!   ccdpci config <addr> <offset> [-w W]   Read PCI configuration space
//!   ccdpci simulate arc|pvcam              Exercise a simulated board
//! ```

use anyhow::{Context, Result};
use ccdpci_driver::pcie_ids::BoardVariant;
use ccdpci_driver::sim::{ArcReply, SimBench, SimResponse};
use ccdpci_driver::{
    discover, ConfigSpace, ConfigWidth, DriverConfig, SharedBuffer, SysfsConfigSpace, WriteRead,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ccdpci", about = "ARC / PVCAM frame-grabber CLI", version)]
struct Cli {
    /// sysfs mount point.
    #[arg(long, global = true, default_value = "/sys")]
    sysfs: PathBuf,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List ARC and PVCAM boards with their interrupt lines and BARs.
    Enumerate,
    /// Read one configuration-space field of a board.
    Config {
        /// PCIe address (e.g. 0000:03:00.0) or board index (e.g. 0).
        device: String,
        /// Byte offset, decimal or 0x-prefixed hex.
        #[arg(value_parser = parse_offset)]
        offset: u32,
        /// Access width: byte, word or dword.
        #[arg(short, long, default_value = "dword")]
        width: ConfigWidth,
    },
    /// Run one command transaction against a simulated board.
    Simulate {
        /// Board family.
        family: Family,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Family {
    Arc,
    Pvcam,
}

fn parse_offset(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("'{s}': {e}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Enumerate => cmd_enumerate(&cli.sysfs)?,
        Cmd::Config {
            device,
            offset,
            width,
        } => cmd_config(&cli.sysfs, &device, offset, width)?,
        Cmd::Simulate { family } => match family {
            Family::Arc => cmd_simulate_arc()?,
            Family::Pvcam => cmd_simulate_pvcam()?,
        },
    }

    Ok(())
}

fn cmd_enumerate(sysfs: &std::path::Path) -> Result<()> {
    let boards = discover(sysfs)
        .with_context(|| format!("scanning {}", sysfs.join("bus/pci/devices").display()))?;

    println!("Frame-grabber boards: {}", boards.len());
    println!();

    for info in &boards {
        let irq = info
            .irq
            .map_or_else(|| "none".to_string(), |irq| irq.to_string());
        println!(
            "[{} {}] {}  ({})  irq {irq}",
            info.kind,
            info.index,
            info.pcie_address,
            info.kind.lspci_filter()
        );
        for (bar, range) in info.bars.iter().enumerate() {
            if range.end <= range.start {
                continue;
            }
            let space = if range.is_io() { "io " } else { "mem" };
            println!(
                "     BAR{bar} {space} {:#010x}-{:#010x}",
                range.start, range.end
            );
        }
        println!();
    }

    Ok(())
}

fn cmd_config(sysfs: &std::path::Path, device: &str, offset: u32, width: ConfigWidth) -> Result<()> {
    // Accept index or PCIe address
    let address = if let Ok(idx) = device.parse::<usize>() {
        discover(sysfs)?
            .into_iter()
            .nth(idx)
            .map(|b| b.pcie_address)
            .ok_or_else(|| anyhow::anyhow!("No board at index {idx}"))?
    } else {
        device.to_string()
    };

    let space = SysfsConfigSpace::open(sysfs, &address)
        .with_context(|| format!("opening config space of {address}"))?;
    let value = space.read(offset, width)?;
    let digits = width.bytes() * 2;
    println!("{address} @ {offset:#04x} ({width:?}): {value:#0w$x}", w = digits + 2);
    Ok(())
}

fn cmd_simulate_arc() -> Result<()> {
    let bench = SimBench::new(DriverConfig::default(), 1, 0)?;
    // header-only commands read a value back
    bench.arcs[0].respond_with(|words| {
        if words.len() == 1 {
            ArcReply::Value(0x0012_3456)
        } else {
            ArcReply::Done
        }
    });

    let session = bench.table.open_arc(0)?;
    println!("HCTR         : {:#x}", session.hctr());
    println!("HSTR         : {:#x}", session.hstr());
    let reply = session.command(&[0x0203, 0x0000_0001])?;
    println!("TDL reply    : {reply:#x}");
    let reply = session.command(&[0x0201])?;
    println!("Value reply  : {reply:#x}");
    println!("Interrupts   : {}", session.board().shared().interrupt_count());
    Ok(())
}

fn cmd_simulate_pvcam() -> Result<()> {
    let bench = SimBench::new(DriverConfig::default(), 0, 1)?;
    let sim = &bench.pvcams[0];
    sim.respond_with(|frame| SimResponse::reply(vec![frame.payload.first().copied().unwrap_or(0); 10]));

    let session = bench.table.open_pvcam(0)?;
    println!("Variant      : {}", BoardVariant::Pvcam);
    println!("Firmware     : {:#06x}", session.firmware_revision());

    let write = vec![0x26u8, 0, 0, 0, 0];
    let mut read = vec![0u8; 10];
    let outcome = session.write_read(&mut WriteRead {
        class: 0x01,
        write: &write,
        write_bytes: 5,
        read: &mut read,
        read_bytes: 10,
    })?;
    println!("Status query : {outcome:?} {read:02x?}");

    let total = 64 * 1024;
    let dest = SharedBuffer::zeroed(total);
    session.arm_exposure(total, Box::new(dest.clone()))?;
    println!("SG blocks    : {}", session.dma_entries().len());

    let pixels: Vec<u8> = (0..total).map(|i| (i % 256) as u8).collect();
    let moved = sim.complete_exposure(&bench.memory, &pixels);
    let report = session.image_status()?;
    println!(
        "Exposure     : {:?}, {} of {moved} bytes, match={}",
        report.image_status(),
        report.byte_cnt,
        dest.snapshot() == pixels
    );
    Ok(())
}
