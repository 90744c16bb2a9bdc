//! Independent boards make progress in parallel, and interrupts for one
//! board never disturb another.

use ccdpci_driver::sim::{ArcReply, SimBench, SimResponse};
use ccdpci_driver::{DriverConfig, IrqReturn, IrqToken, Transfer, WriteRead};
use std::thread;

const ROUNDS: u32 = 50;

fn query(session: &ccdpci_driver::PvcamSession, tag: u8) -> Vec<u8> {
    let write = vec![tag, 1, 2, 3];
    let mut read = vec![0u8; 6];
    let outcome = session
        .write_read(&mut WriteRead {
            class: 0x03,
            write: &write,
            write_bytes: 4,
            read: &mut read,
            read_bytes: 6,
        })
        .unwrap();
    assert_eq!(outcome, Transfer::Completed);
    read
}

#[test]
fn sessions_on_different_boards_run_concurrently() {
    let bench = SimBench::new(DriverConfig::default(), 1, 2).unwrap();
    bench.arcs[0].respond_with(|words| ArcReply::Value(words.get(1).copied().unwrap_or(0)));
    for sim in &bench.pvcams {
        sim.respond_with(|f| SimResponse::reply(vec![f.payload[0]; 6]));
    }

    let arc = bench.table.open_arc(0).unwrap();
    let cam_a = bench.table.open_pvcam(1).unwrap();
    let cam_b = bench.table.open_pvcam(2).unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..ROUNDS {
                assert_eq!(arc.command(&[0x0202, 0x8000 | i]).unwrap(), 0x8000 | i);
            }
        });
        s.spawn(|| {
            for i in 0..ROUNDS {
                let tag = (i % 200) as u8;
                assert_eq!(query(&cam_a, tag), vec![tag; 6]);
            }
        });
        s.spawn(|| {
            for i in 0..ROUNDS {
                let tag = 0xF0 | (i % 8) as u8;
                assert_eq!(query(&cam_b, tag), vec![tag; 6]);
            }
        });
    });

    assert_eq!(bench.pvcams[0].frames().len(), ROUNDS as usize);
    assert_eq!(bench.pvcams[1].frames().len(), ROUNDS as usize);
    assert_eq!(cam_a.board().shared().interrupt_count(), u64::from(2 * ROUNDS));
    assert_eq!(cam_b.board().shared().interrupt_count(), u64::from(2 * ROUNDS));
}

#[test]
fn one_session_serialises_callers() {
    let bench = SimBench::new(DriverConfig::default(), 0, 1).unwrap();
    bench.pvcams[0].respond_with(|f| SimResponse::reply(vec![f.payload[0]; 6]));
    let cam = bench.table.open_pvcam(0).unwrap();

    thread::scope(|s| {
        for t in 0..4u8 {
            let cam = &cam;
            s.spawn(move || {
                for _ in 0..10 {
                    assert_eq!(query(cam, t), vec![t; 6]);
                }
            });
        }
    });
    assert_eq!(bench.pvcams[0].frames().len(), 40);
}

#[test]
fn interrupts_are_routed_by_token_and_line() {
    let bench = SimBench::new(DriverConfig::default(), 1, 1).unwrap();
    let _cam = bench.table.open_pvcam(1).unwrap();
    let arc_irq = bench.table.boards()[0].irq().unwrap();
    let cam_irq = bench.table.boards()[1].irq().unwrap();

    // nothing pending on either board
    assert_eq!(
        bench.table.handle_interrupt(cam_irq, IrqToken::for_index(1)),
        IrqReturn::NotMine
    );
    // right board, wrong line
    assert_eq!(
        bench.table.handle_interrupt(arc_irq, IrqToken::for_index(1)),
        IrqReturn::NotMine
    );
    assert_eq!(bench.table.handle_raw_interrupt(cam_irq, 0), IrqReturn::NotMine);
    assert_eq!(bench.table.handle_raw_interrupt(cam_irq, 77), IrqReturn::NotMine);
}
