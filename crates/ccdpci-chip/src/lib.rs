//! Silicon model for the ARC and PVCAM PCI frame-grabber boards.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the two boards: register offsets, status bit layouts,
//! command vectors, reply words, control opcodes and PCI identifiers.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pcie`] | Vendor/device IDs, board variants, per-driver board limits |
//! | [`bar`] | BAR layout for both boards (one MMIO window vs. four I/O windows) |
//! | [`arc`] | ARC DSP host interface: HCTR/HSTR/HCVR, vectors, reply words, opcodes |
//! | [`pvcam`] | AMCC S5933 mailbox registers, image status codes, PVCAM opcodes |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod arc;
pub mod bar;
pub mod pcie;
pub mod pvcam;
