//! PVCAM board sessions against the simulated camera
//!
//! Covers the mailbox write/read transport, exposure arming and
//! collection through scatter-gather DMA, and the raw control calls.

use ccdpci_chip::pvcam::{opcode, INT_MAILBOX2, MAX_WRITE_BYTES};
use ccdpci_driver::sim::{SimBench, SimResponse};
use ccdpci_driver::{
    DriverConfig, DriverError, FaultyBuffer, ImageStatus, ImageStatusReport, LockMode,
    SharedBuffer, Transfer, WriteRead, WriteReadHeader,
};
use std::time::Duration;

/// One ARC board at index 0, the PVCAM board at index 1.
const PVCAM: usize = 1;

fn bench() -> SimBench {
    SimBench::new(DriverConfig::default(), 1, 1).expect("bench")
}

fn status_query() -> Vec<u8> {
    vec![0x26, 0, 0, 0, 0]
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn word(buf: &[u8], index: usize) -> u32 {
    u32::from_ne_bytes(buf[index * 4..index * 4 + 4].try_into().unwrap())
}

#[test]
fn open_resets_mailboxes_and_enables_interrupt() {
    let bench = bench();
    let sim = &bench.pvcams[0];
    let session = bench.table.open_pvcam(PVCAM).unwrap();

    assert_eq!(sim.master_resets(), 1);
    assert_eq!(sim.intcsr(), INT_MAILBOX2);
    assert_eq!(session.timeout(), Duration::from_millis(2000));
    assert_eq!(session.firmware_revision(), 0x0102);
}

#[test]
fn write_read_round_trip() {
    let bench = bench();
    let sim = &bench.pvcams[0];
    sim.respond_with(|f| SimResponse::reply((1..=10).map(|b| b + f.payload[0]).collect::<Vec<u8>>()));
    let session = bench.table.open_pvcam(PVCAM).unwrap();

    let write = status_query();
    let mut read = vec![0u8; 10];
    let outcome = session
        .write_read(&mut WriteRead {
            class: 0x01,
            write: &write,
            write_bytes: 5,
            read: &mut read,
            read_bytes: 10,
        })
        .unwrap();

    assert_eq!(outcome, Transfer::Completed);
    assert_eq!(read, (0x27..=0x30).collect::<Vec<u8>>());
    let frames = sim.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].class, 0x01);
    assert_eq!(frames[0].payload, write);

    let shared = session.board().shared();
    assert_eq!(shared.lock_mode(), LockMode::None);
    assert!(!shared.is_busy());
    assert_eq!(shared.interrupt_count(), 2);
}

#[test]
fn write_only_command_needs_one_acknowledge() {
    let bench = bench();
    let session = bench.table.open_pvcam(PVCAM).unwrap();

    let write = vec![0x10u8, 0x20, 0x30];
    let mut read: Vec<u8> = Vec::new();
    let outcome = session
        .write_read(&mut WriteRead {
            class: 0x02,
            write: &write,
            write_bytes: 3,
            read: &mut read,
            read_bytes: 0,
        })
        .unwrap();
    assert_eq!(outcome, Transfer::Completed);
    assert_eq!(session.board().shared().interrupt_count(), 1);
}

#[test]
fn oversize_payloads_are_rejected_before_sending() {
    let bench = bench();
    let sim = &bench.pvcams[0];
    let session = bench.table.open_pvcam(PVCAM).unwrap();

    let write = vec![0u8; MAX_WRITE_BYTES + 1];
    let mut read: Vec<u8> = Vec::new();
    assert!(matches!(
        session.write_read(&mut WriteRead {
            class: 1,
            write: &write,
            write_bytes: write.len(),
            read: &mut read,
            read_bytes: 0,
        }),
        Err(DriverError::InvalidArgument { .. })
    ));

    let write = vec![1u8];
    let mut read = vec![0u8; 9000];
    assert!(session
        .write_read(&mut WriteRead {
            class: 1,
            write: &write,
            write_bytes: 1,
            read: &mut read,
            read_bytes: 9000,
        })
        .is_err());
    assert!(sim.frames().is_empty());
}

#[test]
fn missing_acknowledge_times_out_and_clears_lock() {
    let bench = bench();
    bench.pvcams[0].respond_with(|_| SimResponse::silent());
    let session = bench.table.open_pvcam(PVCAM).unwrap();
    session.set_timeout(Duration::from_millis(50));

    let write = status_query();
    let mut read = vec![0u8; 10];
    assert!(matches!(
        session.write_read(&mut WriteRead {
            class: 1,
            write: &write,
            write_bytes: 5,
            read: &mut read,
            read_bytes: 10,
        }),
        Err(DriverError::Timeout { duration_ms: 50 })
    ));
    let shared = session.board().shared();
    assert_eq!(shared.lock_mode(), LockMode::None);
    assert!(!shared.is_busy());
}

#[test]
fn communication_error_status_is_reported() {
    let bench = bench();
    bench.pvcams[0].respond_with(|_| SimResponse::error(0x004, 10));
    let session = bench.table.open_pvcam(PVCAM).unwrap();

    let write = status_query();
    let mut read = vec![0u8; 10];
    assert!(matches!(
        session.write_read(&mut WriteRead {
            class: 1,
            write: &write,
            write_bytes: 5,
            read: &mut read,
            read_bytes: 10,
        }),
        Err(DriverError::ProtocolError { reply: 0x8004 })
    ));
    assert_eq!(read, vec![0u8; 10]);
}

#[test]
fn status_query_during_transfer_is_aborted_unsent() {
    let bench = bench();
    let sim = &bench.pvcams[0];
    let session = bench.table.open_pvcam(PVCAM).unwrap();
    session
        .arm_exposure(4096, Box::new(SharedBuffer::zeroed(4096)))
        .unwrap();

    let write = status_query();
    let mut read = vec![0xFFu8; 10];
    let outcome = session
        .write_read(&mut WriteRead {
            class: 0x01,
            write: &write,
            write_bytes: 5,
            read: &mut read,
            read_bytes: 10,
        })
        .unwrap();
    assert_eq!(outcome, Transfer::Aborted);
    assert_eq!(read, vec![0u8; 10]);
    assert!(sim.frames().is_empty());

    let keep_alive = vec![0x2Eu8];
    let mut nothing: Vec<u8> = Vec::new();
    let outcome = session
        .write_read(&mut WriteRead {
            class: 0x01,
            write: &keep_alive,
            write_bytes: 1,
            read: &mut nothing,
            read_bytes: 0,
        })
        .unwrap();
    assert_eq!(outcome, Transfer::Completed);
    assert_eq!(sim.frames().len(), 1);
}

#[test]
fn buffer_of_132000_bytes_takes_nine_blocks() {
    let bench = bench();
    let session = bench.table.open_pvcam(PVCAM).unwrap();

    session
        .arm_exposure(132_000, Box::new(SharedBuffer::zeroed(132_000)))
        .unwrap();
    let entries = session.dma_entries();
    assert_eq!(entries.len(), 9);
    assert!(entries[..8].iter().all(|e| e.size == 16_384));
    assert_eq!(entries[8].size, 132_000 - 8 * 16_384);
    assert_eq!(entries.iter().map(|e| e.size).sum::<usize>(), 132_000);

    session.disarm_exposure();
    session
        .arm_exposure(132_736, Box::new(SharedBuffer::zeroed(132_736)))
        .unwrap();
    let entries = session.dma_entries();
    assert_eq!(entries.len(), 9);
    assert_eq!(entries[8].size, 1_664);
}

#[test]
fn oversize_exposure_is_refused() {
    let bench = bench();
    let session = bench.table.open_pvcam(PVCAM).unwrap();
    assert!(session
        .arm_exposure(0x0200_0001, Box::new(SharedBuffer::zeroed(1)))
        .is_err());
    assert!(session.dma_entries().is_empty());
}

#[test]
fn completed_frame_is_collected_on_first_poll() {
    let bench = bench();
    let sim = &bench.pvcams[0];
    let session = bench.table.open_pvcam(PVCAM).unwrap();
    let total = 50_000;
    let dest = SharedBuffer::zeroed(total);

    session.arm_exposure(total, Box::new(dest.clone())).unwrap();
    assert_eq!(
        session.image_status().unwrap().image_status(),
        ImageStatus::NoDataActive
    );

    let pixels = pattern(total);
    assert_eq!(sim.complete_exposure(&bench.memory, &pixels), total);

    let report = session.image_status().unwrap();
    assert_eq!(report.image_status(), ImageStatus::CollectDone);
    assert_eq!(report.byte_cnt as usize, total);
    assert_eq!(dest.snapshot(), pixels);

    let again = session.image_status().unwrap();
    assert_eq!(again.byte_cnt as usize, total);
}

#[test]
fn dma_error_payload_is_classified() {
    let bench = bench();
    let sim = &bench.pvcams[0];
    let session = bench.table.open_pvcam(PVCAM).unwrap();
    session
        .arm_exposure(8192, Box::new(SharedBuffer::zeroed(8192)))
        .unwrap();

    sim.fail_exposure(0x02);
    let report = session.image_status().unwrap();
    assert_eq!(report.image_status(), ImageStatus::MissingData);
    assert_eq!(report.byte_cnt, 0);

    session.disarm_exposure();
    assert_eq!(
        session.image_status().unwrap().image_status(),
        ImageStatus::NoDataIdle
    );
}

#[test]
fn faulting_destination_resets_session_state() {
    let bench = bench();
    let sim = &bench.pvcams[0];
    let session = bench.table.open_pvcam(PVCAM).unwrap();

    session
        .arm_exposure(4096, Box::new(FaultyBuffer { len: 4096 }))
        .unwrap();
    sim.complete_exposure(&bench.memory, &pattern(4096));
    assert!(matches!(
        session.image_status(),
        Err(DriverError::UserCopyFault { .. })
    ));

    assert!(session.board().is_open());
    assert!(session.dma_entries().is_empty());
    assert_eq!(session.board().shared().image_status(), ImageStatus::Unknown);

    // no longer mid-transfer: commands go out again
    let write = status_query();
    let mut read: Vec<u8> = Vec::new();
    let outcome = session
        .write_read(&mut WriteRead {
            class: 1,
            write: &write,
            write_bytes: 5,
            read: &mut read,
            read_bytes: 0,
        })
        .unwrap();
    assert_eq!(outcome, Transfer::Completed);
}

#[test]
fn close_releases_dma_blocks() {
    let bench = bench();
    let baseline = bench.memory.outstanding();
    let session = bench.table.open_pvcam(PVCAM).unwrap();
    session
        .arm_exposure(40_000, Box::new(SharedBuffer::zeroed(40_000)))
        .unwrap();
    assert_eq!(bench.memory.outstanding(), baseline + 3);

    drop(session);
    assert_eq!(bench.memory.outstanding(), baseline);
    assert!(bench.table.open_pvcam(PVCAM).is_ok());
}

#[test]
fn raw_scalar_calls() {
    let bench = bench();
    let session = bench.table.open_pvcam(PVCAM).unwrap();
    let mut arg = vec![0u8; 4];

    session.ioctl(opcode::GET_DRIVER_VER, &mut arg).unwrap();
    assert_eq!(word(&arg, 0), 0x0400);
    session.ioctl(opcode::GET_PIXTIME, &mut arg).unwrap();
    assert_eq!(word(&arg, 0), 500);
    session.ioctl(opcode::GET_IMAGE_GRANUL, &mut arg).unwrap();
    assert_eq!(word(&arg, 0), 4);
    session.ioctl(opcode::GET_MAXRETRIES, &mut arg).unwrap();
    assert_eq!(word(&arg, 0), 1);
    session.ioctl(opcode::GET_PCI_FW_REV, &mut arg).unwrap();
    assert_eq!(word(&arg, 0), 0x0102);

    let mut arg = 250u32.to_ne_bytes().to_vec();
    session.ioctl(opcode::SET_MAXTIMEOUT, &mut arg).unwrap();
    assert_eq!(session.timeout(), Duration::from_millis(250));
    session.ioctl(opcode::GET_MAXTIMEOUT, &mut arg).unwrap();
    assert_eq!(word(&arg, 0), 250);

    assert!(matches!(
        session.ioctl(99, &mut arg),
        Err(DriverError::Unsupported { opcode: 99 })
    ));
}

#[test]
fn raw_write_read_layout() {
    let bench = bench();
    bench.pvcams[0].respond_with(|_| SimResponse::reply(vec![9u8, 8, 7, 6]));
    let session = bench.table.open_pvcam(PVCAM).unwrap();

    let header = WriteReadHeader {
        class: 3,
        write_bytes: 2,
        read_bytes: 4,
        ..WriteReadHeader::default()
    };
    let mut arg = bytemuck::bytes_of(&header).to_vec();
    arg.extend_from_slice(&[0xAB, 0xCD]);
    arg.extend_from_slice(&[0; 4]);

    session.ioctl(opcode::WRITE_READ, &mut arg).unwrap();
    assert_eq!(&arg[10..], &[9, 8, 7, 6]);
    assert_eq!(bench.pvcams[0].frames()[0].payload, vec![0xAB, 0xCD]);
}

#[test]
fn raw_exposure_cycle() {
    let bench = bench();
    let sim = &bench.pvcams[0];
    let session = bench.table.open_pvcam(PVCAM).unwrap();
    let total = 20_000u32;

    let mut arg = total.to_ne_bytes().to_vec();
    assert!(matches!(
        session.ioctl(opcode::SET_IMAGE_ACTIVE, &mut arg),
        Err(DriverError::NotMapped)
    ));

    let dest = SharedBuffer::zeroed(total as usize);
    session.stage_destination(Box::new(dest.clone()));
    session.ioctl(opcode::SET_IMAGE_ACTIVE, &mut arg).unwrap();

    let pixels = pattern(total as usize);
    sim.complete_exposure(&bench.memory, &pixels);

    let mut report = vec![0u8; std::mem::size_of::<ImageStatusReport>()];
    session.ioctl(opcode::GET_IMAGE_STATUS, &mut report).unwrap();
    let report: ImageStatusReport = bytemuck::pod_read_unaligned(&report);
    assert_eq!(report.byte_cnt, total);
    assert_eq!(report.image_status(), ImageStatus::CollectDone);
    assert_eq!(dest.snapshot(), pixels);

    session.ioctl(opcode::SET_IMAGE_IDLE, &mut arg).unwrap();
    assert_eq!(
        session.board().shared().image_status(),
        ImageStatus::NoDataIdle
    );
}

#[test]
fn raw_flash_load_streams_little_endian_words() {
    let bench = bench();
    let session = bench.table.open_pvcam(PVCAM).unwrap();

    let mut image = vec![0x01u8, 0x02, 0x03, 0x04, 0x05];
    session.ioctl(opcode::LOAD_PCI_FLASH, &mut image).unwrap();
    assert_eq!(bench.pvcams[0].flash_words(), vec![0x0201, 0x0403, 0x0005]);

    assert!(session.load_flash(&vec![0u8; 32 * 1024 + 1]).is_err());
}
