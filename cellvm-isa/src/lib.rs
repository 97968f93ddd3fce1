//! The pure instruction-set layer of the emulator: big-endian PowerPC (Cell
//! PPU) instruction decoding, the fixed-layout guest CPU state record shared
//! with emitted code, and an append-only AArch64 machine-code encoder.
//!
//! Nothing in this crate touches the OS; everything is testable on any host.

pub mod aarch64;
pub mod ppu;

pub use aarch64::{Assembler, Cond, Reg, VReg};
pub use ppu::{decode, Inst, Op, PpuState};
