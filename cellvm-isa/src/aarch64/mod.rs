//! AArch64 code emission.
//!
//! [`Assembler`] appends bit-exact 32-bit encodings to a buffer; it does no
//! semantic checking beyond field-range assertions. Callers (the translator
//! and the block compiler) own correctness.

mod asm;

pub use asm::Assembler;

/// A general-purpose register, X0..X30 plus XZR/SP (both encode as 31; the
/// instruction decides which one it means).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reg(pub u8);

impl Reg {
    #[inline]
    fn bits(self) -> u32 {
        debug_assert!(self.0 < 32);
        self.0 as u32
    }
}

pub const X0: Reg = Reg(0);
pub const X1: Reg = Reg(1);
pub const X2: Reg = Reg(2);
pub const X3: Reg = Reg(3);
pub const X4: Reg = Reg(4);
pub const X5: Reg = Reg(5);
pub const X6: Reg = Reg(6);
pub const X7: Reg = Reg(7);
pub const X8: Reg = Reg(8);
pub const X9: Reg = Reg(9);
pub const X10: Reg = Reg(10);
pub const X11: Reg = Reg(11);
pub const X12: Reg = Reg(12);
pub const X13: Reg = Reg(13);
pub const X14: Reg = Reg(14);
pub const X15: Reg = Reg(15);
pub const X16: Reg = Reg(16);
pub const X17: Reg = Reg(17);
pub const X19: Reg = Reg(19);
pub const X20: Reg = Reg(20);
pub const X21: Reg = Reg(21);
pub const X29: Reg = Reg(29);
pub const X30: Reg = Reg(30);
pub const XZR: Reg = Reg(31);
pub const SP: Reg = Reg(31);

/// A SIMD/FP register; the instruction selects the S/D/Q view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VReg(pub u8);

impl VReg {
    #[inline]
    fn bits(self) -> u32 {
        debug_assert!(self.0 < 32);
        self.0 as u32
    }
}

pub const D0: VReg = VReg(0);
pub const D1: VReg = VReg(1);
pub const D2: VReg = VReg(2);
pub const D3: VReg = VReg(3);
pub const V0: VReg = VReg(0);
pub const V1: VReg = VReg(1);
pub const V2: VReg = VReg(2);
pub const V3: VReg = VReg(3);

/// Condition codes for `B.cond` / `CSEL` / `CSET`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    Cs = 2,
    Cc = 3,
    Mi = 4,
    Pl = 5,
    Vs = 6,
    Vc = 7,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
    Al = 14,
}

impl Cond {
    /// The condition with the opposite sense.
    #[inline]
    pub fn invert(self) -> Cond {
        // Flipping the low bit inverts every AArch64 condition except AL.
        debug_assert!(self != Cond::Al);
        match self as u8 ^ 1 {
            0 => Cond::Eq,
            1 => Cond::Ne,
            2 => Cond::Cs,
            3 => Cond::Cc,
            4 => Cond::Mi,
            5 => Cond::Pl,
            6 => Cond::Vs,
            7 => Cond::Vc,
            8 => Cond::Hi,
            9 => Cond::Ls,
            10 => Cond::Ge,
            11 => Cond::Lt,
            12 => Cond::Gt,
            _ => Cond::Le,
        }
    }
}
