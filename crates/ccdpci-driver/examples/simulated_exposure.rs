//! Run one PVCAM exposure against a simulated board
//!
//! Arms a scatter-gather exposure, lets the simulated bus master fill it,
//! then collects the frame through the status poll.

use ccdpci_driver::prelude::*;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("ccdpci_driver=debug")
        .init();

    let bench = SimBench::new(DriverConfig::default(), 0, 1)?;
    let session = bench.table.open_pvcam(0)?;

    let total = 132_000;
    let dest = SharedBuffer::zeroed(total);
    session.arm_exposure(total, Box::new(dest.clone()))?;

    println!("Armed {total} bytes:");
    for (i, entry) in session.dma_entries().iter().enumerate() {
        println!("   [{i}] bus {:#010x}  {:>6} bytes", entry.bus, entry.size);
    }

    let pixels: Vec<u8> = (0..total).map(|i| (i * 7 % 256) as u8).collect();
    bench.pvcams[0].complete_exposure(&bench.memory, &pixels);

    let report = session.image_status()?;
    println!();
    println!("Status:    {:?}", report.image_status());
    println!("Collected: {} bytes", report.byte_cnt);
    println!("Intact:    {}", dest.snapshot() == pixels);

    Ok(())
}
