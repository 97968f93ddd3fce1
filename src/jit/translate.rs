//! Per-instruction lowering of decoded guest instructions to AArch64.
//!
//! Register convention (fixed for the life of the process):
//! - `x19` — guest state base (callee-saved)
//! - `x20` — memory window base (callee-saved)
//! - `x9`–`x14` — integer scratch, free within one guest instruction
//! - `d0`–`d3` / `v0`–`v2` — FP/vector scratch
//!
//! Every guest register lives in the state record at a fixed offset; the
//! baseline tier loads sources and stores results around each instruction,
//! so guest-observable state is exact at every instruction boundary. The
//! optimizing tier may reuse the previous instruction's result register,
//! fold immediate-only chains, and skip CR0 updates that a later
//! instruction in the same block provably overwrites; block-boundary state
//! is identical to baseline.

use cellvm_isa::aarch64::{self, Assembler, Cond, Reg};
use cellvm_isa::ppu::{self, offsets, Inst, Op};

use super::block::{BlockExit, Tier};

/// Guest state base.
pub const STATE: Reg = aarch64::X19;
/// Memory window base.
pub const MEM: Reg = aarch64::X20;

const T0: Reg = aarch64::X9;
const T1: Reg = aarch64::X10;
const T2: Reg = aarch64::X11;
const T3: Reg = aarch64::X12;
const T4: Reg = aarch64::X13;
const T5: Reg = aarch64::X14;

const FT0: aarch64::VReg = aarch64::VReg(0);
const FT1: aarch64::VReg = aarch64::VReg(1);
const FT2: aarch64::VReg = aarch64::VReg(2);
const FT3: aarch64::VReg = aarch64::VReg(3);

/// What the block compiler should do after one lowered instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Next {
    /// Keep going; control falls through to the next guest instruction.
    Fallthrough,
    /// The lowered code ends the block (terminator or translator exit).
    End,
}

enum NextPc {
    Const(u64),
    Reg(Reg),
}

pub struct Translator<'a> {
    asm: &'a mut Assembler,
    tier: Tier,
    /// Guest GPR whose current value is still live in a scratch register
    /// from the previous instruction (optimizing tier only).
    cached: Option<(u8, Reg)>,
    /// Guest GPRs holding compile-time-known constants (optimizing tier).
    const_gpr: [Option<u64>; 32],
    /// Set once the guest rounding mode has been mirrored into FPCR.
    fpcr_synced: bool,
    /// Consumed by the first source load of each instruction.
    cache_armed: bool,
}

impl<'a> Translator<'a> {
    pub fn new(asm: &'a mut Assembler, tier: Tier) -> Self {
        Translator {
            asm,
            tier,
            cached: None,
            const_gpr: [None; 32],
            fpcr_synced: false,
            cache_armed: false,
        }
    }

    /// Emits the lowering of one guest instruction. `skip_cr0` is the
    /// optimizing tier's license to elide this instruction's CR0 update.
    pub fn translate(&mut self, inst: &Inst, skip_cr0: bool) -> Next {
        self.cache_armed = self.tier == Tier::Optimizing;
        let record = inst.rc && !(skip_cr0 && self.tier == Tier::Optimizing);
        match inst.op {
            // ---- immediate arithmetic ----
            Op::Addi | Op::Addis => {
                let imm = if inst.op == Op::Addis {
                    (inst.simm as i64) << 16
                } else {
                    inst.simm as i64
                };
                if inst.ra == 0 {
                    self.asm.mov_imm64(T0, imm as u64);
                    self.store_gpr(inst.rd, T0);
                    self.set_const(inst.rd, imm as u64);
                } else if let Some(base) = self.known_const(inst.ra) {
                    let value = base.wrapping_add(imm as u64);
                    self.asm.mov_imm64(T0, value);
                    self.store_gpr(inst.rd, T0);
                    self.set_const(inst.rd, value);
                } else {
                    self.load_gpr(T0, inst.ra);
                    self.add_signed_imm(T0, T0, imm);
                    self.store_gpr(inst.rd, T0);
                }
                Next::Fallthrough
            }
            Op::Addic | Op::AddicRc => {
                self.load_gpr(T0, inst.ra);
                self.asm.mov_imm64(T1, inst.simm as i64 as u64);
                self.asm.adds(T0, T0, T1);
                self.emit_store_carry();
                self.store_gpr(inst.rd, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Subfic => {
                self.load_gpr(T1, inst.ra);
                self.asm.mov_imm64(T0, inst.simm as i64 as u64);
                self.asm.subs(T0, T0, T1);
                self.emit_store_carry();
                self.store_gpr(inst.rd, T0);
                Next::Fallthrough
            }
            Op::Mulli => {
                self.load_gpr(T0, inst.ra);
                self.asm.mov_imm64(T1, inst.simm as i64 as u64);
                self.asm.mul(T0, T0, T1);
                self.store_gpr(inst.rd, T0);
                Next::Fallthrough
            }

            // ---- register arithmetic ----
            Op::Add => {
                if let (Some(a), Some(b)) =
                    (self.known_const(inst.ra), self.known_const(inst.rb))
                {
                    let value = a.wrapping_add(b);
                    self.asm.mov_imm64(T0, value);
                    self.store_gpr(inst.rd, T0);
                    self.set_const(inst.rd, value);
                } else {
                    self.load_two(inst.ra, inst.rb);
                    self.asm.add(T0, T0, T1);
                    self.store_gpr(inst.rd, T0);
                }
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Subf => {
                // rd = rb - ra
                self.load_two(inst.ra, inst.rb);
                self.asm.sub(T0, T1, T0);
                self.store_gpr(inst.rd, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Neg => {
                self.load_gpr(T0, inst.ra);
                self.asm.neg(T0, T0);
                self.store_gpr(inst.rd, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Addze => {
                self.load_gpr(T0, inst.ra);
                self.emit_load_carry(T1);
                self.asm.adds(T0, T0, T1);
                self.emit_store_carry();
                self.store_gpr(inst.rd, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Mullw => {
                self.load_two(inst.ra, inst.rb);
                self.asm.sxtw(T0, T0);
                self.asm.sxtw(T1, T1);
                self.asm.mul(T0, T0, T1);
                self.store_gpr(inst.rd, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Mulld => {
                self.load_two(inst.ra, inst.rb);
                self.asm.mul(T0, T0, T1);
                self.store_gpr(inst.rd, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Mulhw => {
                self.load_two(inst.ra, inst.rb);
                self.asm.sxtw(T0, T0);
                self.asm.sxtw(T1, T1);
                self.asm.mul(T0, T0, T1);
                self.asm.asr_imm(T0, T0, 32);
                self.store_gpr(inst.rd, T0);
                Next::Fallthrough
            }
            Op::Mulhwu => {
                self.load_two(inst.ra, inst.rb);
                self.asm.mov_w(T0, T0);
                self.asm.mov_w(T1, T1);
                self.asm.mul(T0, T0, T1);
                self.asm.lsr_imm(T0, T0, 32);
                self.store_gpr(inst.rd, T0);
                Next::Fallthrough
            }
            Op::Divw => {
                self.load_two(inst.ra, inst.rb);
                self.asm.sdiv_w(T0, T0, T1);
                self.store_gpr(inst.rd, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Divwu => {
                self.load_two(inst.ra, inst.rb);
                self.asm.udiv_w(T0, T0, T1);
                self.store_gpr(inst.rd, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Divd => {
                self.load_two(inst.ra, inst.rb);
                self.asm.sdiv(T0, T0, T1);
                self.store_gpr(inst.rd, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Divdu => {
                self.load_two(inst.ra, inst.rb);
                self.asm.udiv(T0, T0, T1);
                self.store_gpr(inst.rd, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }

            // ---- logical immediates (rs lives in the rd slot) ----
            Op::Andi | Op::Andis | Op::Ori | Op::Oris | Op::Xori | Op::Xoris => {
                let imm = if matches!(inst.op, Op::Andis | Op::Oris | Op::Xoris) {
                    (inst.uimm as u64) << 16
                } else {
                    inst.uimm as u64
                };
                if let Some(src) = self.known_const(inst.rd) {
                    let value = match inst.op {
                        Op::Andi | Op::Andis => src & imm,
                        Op::Ori | Op::Oris => src | imm,
                        _ => src ^ imm,
                    };
                    self.asm.mov_imm64(T0, value);
                    self.store_gpr(inst.ra, T0);
                    self.set_const(inst.ra, value);
                } else {
                    self.load_gpr(T0, inst.rd);
                    self.asm.mov_imm64(T1, imm);
                    match inst.op {
                        Op::Andi | Op::Andis => self.asm.and(T0, T0, T1),
                        Op::Ori | Op::Oris => self.asm.orr(T0, T0, T1),
                        _ => self.asm.eor(T0, T0, T1),
                    }
                    self.store_gpr(inst.ra, T0);
                }
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }

            // ---- register logic (rs in rd slot, dest is ra) ----
            Op::And | Op::Or | Op::Xor | Op::Nand | Op::Nor | Op::Andc | Op::Orc | Op::Eqv => {
                self.load_two(inst.rd, inst.rb);
                match inst.op {
                    Op::And => self.asm.and(T0, T0, T1),
                    Op::Or => self.asm.orr(T0, T0, T1),
                    Op::Xor => self.asm.eor(T0, T0, T1),
                    Op::Andc => self.asm.bic(T0, T0, T1),
                    Op::Orc => self.asm.orn(T0, T0, T1),
                    Op::Eqv => self.asm.eon(T0, T0, T1),
                    Op::Nand => {
                        self.asm.and(T0, T0, T1);
                        self.asm.mvn(T0, T0);
                    }
                    _ => {
                        self.asm.orr(T0, T0, T1);
                        self.asm.mvn(T0, T0);
                    }
                }
                self.store_gpr(inst.ra, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Extsb | Op::Extsh | Op::Extsw => {
                self.load_gpr(T0, inst.rd);
                match inst.op {
                    Op::Extsb => self.asm.sxtb(T0, T0),
                    Op::Extsh => self.asm.sxth(T0, T0),
                    _ => self.asm.sxtw(T0, T0),
                }
                self.store_gpr(inst.ra, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Cntlzw => {
                self.load_gpr(T0, inst.rd);
                self.asm.mov_w(T0, T0);
                self.asm.clz_w(T0, T0);
                self.store_gpr(inst.ra, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Cntlzd => {
                self.load_gpr(T0, inst.rd);
                self.asm.clz(T0, T0);
                self.store_gpr(inst.ra, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }

            // ---- rotate and mask ----
            Op::Rlwinm => {
                self.load_gpr(T0, inst.rd);
                self.asm.mov_w(T0, T0);
                if inst.sh != 0 {
                    self.asm.ror_w_imm(T0, T0, (32 - inst.sh as u32) & 31);
                }
                let mask = ppu::mask32(inst.mb as u32, inst.me as u32) as u64;
                self.asm.mov_imm64(T1, mask);
                self.asm.and(T0, T0, T1);
                self.store_gpr(inst.ra, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Rlwnm => {
                self.load_two(inst.rd, inst.rb);
                self.asm.mov_w(T0, T0);
                // Left-rotate by n is right-rotate by (32 - n) & 31.
                self.asm.mov_imm64(T2, 31);
                self.asm.and(T1, T1, T2);
                self.asm.mov_imm64(T3, 32);
                self.asm.sub(T1, T3, T1);
                self.asm.and(T1, T1, T2);
                self.asm.rorv_w(T0, T0, T1);
                let mask = ppu::mask32(inst.mb as u32, inst.me as u32) as u64;
                self.asm.mov_imm64(T1, mask);
                self.asm.and(T0, T0, T1);
                self.store_gpr(inst.ra, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Rlwimi => {
                self.load_two(inst.rd, inst.ra);
                self.asm.mov_w(T0, T0);
                if inst.sh != 0 {
                    self.asm.ror_w_imm(T0, T0, (32 - inst.sh as u32) & 31);
                }
                let mask = ppu::mask32(inst.mb as u32, inst.me as u32) as u64;
                self.asm.mov_imm64(T2, mask);
                self.asm.and(T0, T0, T2);
                self.asm.bic(T1, T1, T2);
                self.asm.orr(T0, T0, T1);
                self.store_gpr(inst.ra, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Rldicl | Op::Rldicr => {
                self.load_gpr(T0, inst.rd);
                if inst.sh != 0 {
                    self.asm.ror_imm(T0, T0, (64 - inst.sh as u32) & 63);
                }
                let mask = if inst.op == Op::Rldicl {
                    ppu::mask64(inst.mb as u32, 63)
                } else {
                    ppu::mask64(0, inst.me as u32)
                };
                self.asm.mov_imm64(T1, mask);
                self.asm.and(T0, T0, T1);
                self.store_gpr(inst.ra, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }

            // ---- shifts ----
            Op::Slw => {
                self.load_two(inst.rd, inst.rb);
                self.asm.mov_w(T0, T0);
                self.asm.mov_imm64(T2, 63);
                self.asm.and(T1, T1, T2);
                self.asm.lslv(T0, T0, T1);
                self.asm.mov_w(T0, T0);
                self.store_gpr(inst.ra, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Srw => {
                self.load_two(inst.rd, inst.rb);
                self.asm.mov_w(T0, T0);
                self.asm.mov_imm64(T2, 63);
                self.asm.and(T1, T1, T2);
                self.asm.lsrv(T0, T0, T1);
                self.store_gpr(inst.ra, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Sld => {
                self.load_two(inst.rd, inst.rb);
                self.asm.mov_imm64(T2, 127);
                self.asm.and(T1, T1, T2);
                self.asm.lslv(T0, T0, T1);
                self.asm.cmp_imm(T1, 64);
                self.asm.csel(T0, T0, aarch64::XZR, Cond::Cc);
                self.store_gpr(inst.ra, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Srd => {
                self.load_two(inst.rd, inst.rb);
                self.asm.mov_imm64(T2, 127);
                self.asm.and(T1, T1, T2);
                self.asm.lsrv(T0, T0, T1);
                self.asm.cmp_imm(T1, 64);
                self.asm.csel(T0, T0, aarch64::XZR, Cond::Cc);
                self.store_gpr(inst.ra, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Srawi => {
                self.load_gpr(T0, inst.rd);
                self.asm.sxtw(T0, T0);
                let sh = inst.sh as u32 & 31;
                // CA: source negative and any shifted-out bit set.
                if sh != 0 {
                    self.asm.mov_imm64(T1, (1u64 << sh) - 1);
                    self.asm.tst(T0, T1);
                    self.asm.cset(T1, Cond::Ne);
                    self.asm.lsr_imm(T2, T0, 63);
                    self.asm.and(T1, T1, T2);
                } else {
                    self.asm.movz(T1, 0, 0);
                }
                self.emit_set_carry_from(T1);
                self.asm.asr_imm(T0, T0, sh);
                self.store_gpr(inst.ra, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Sraw => {
                self.emit_sra_variable(inst, 32);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Srad => {
                self.emit_sra_variable(inst, 64);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }
            Op::Sradi => {
                self.load_gpr(T0, inst.rd);
                let sh = inst.sh as u32 & 63;
                if sh != 0 {
                    self.asm.mov_imm64(T1, (1u64 << sh) - 1);
                    self.asm.tst(T0, T1);
                    self.asm.cset(T1, Cond::Ne);
                    self.asm.lsr_imm(T2, T0, 63);
                    self.asm.and(T1, T1, T2);
                } else {
                    self.asm.movz(T1, 0, 0);
                }
                self.emit_set_carry_from(T1);
                self.asm.asr_imm(T0, T0, sh);
                self.store_gpr(inst.ra, T0);
                if record {
                    self.emit_record_cr0(T0);
                }
                Next::Fallthrough
            }

            // ---- compares ----
            Op::Cmpi | Op::Cmp => {
                let signed = true;
                self.emit_compare(inst, signed);
                Next::Fallthrough
            }
            Op::Cmpli | Op::Cmpl => {
                self.emit_compare(inst, false);
                Next::Fallthrough
            }

            // ---- CR and SPR moves ----
            Op::Mfspr => match inst.spr {
                1 => {
                    self.asm.ldr_w_imm(T0, STATE, offsets::XER as u32);
                    self.store_gpr(inst.rd, T0);
                    Next::Fallthrough
                }
                8 => {
                    self.asm.ldr_imm(T0, STATE, offsets::LR as u32);
                    self.store_gpr(inst.rd, T0);
                    Next::Fallthrough
                }
                9 => {
                    self.asm.ldr_imm(T0, STATE, offsets::CTR as u32);
                    self.store_gpr(inst.rd, T0);
                    Next::Fallthrough
                }
                _ => self.emit_unhandled(inst),
            },
            Op::Mtspr => match inst.spr {
                1 => {
                    self.load_gpr(T0, inst.rd);
                    self.asm.str_w_imm(T0, STATE, offsets::XER as u32);
                    Next::Fallthrough
                }
                8 => {
                    self.load_gpr(T0, inst.rd);
                    self.asm.str_imm(T0, STATE, offsets::LR as u32);
                    Next::Fallthrough
                }
                9 => {
                    self.load_gpr(T0, inst.rd);
                    self.asm.str_imm(T0, STATE, offsets::CTR as u32);
                    Next::Fallthrough
                }
                _ => self.emit_unhandled(inst),
            },
            Op::Mfcr => {
                self.asm.ldr_w_imm(T0, STATE, offsets::CR as u32);
                self.store_gpr(inst.rd, T0);
                Next::Fallthrough
            }
            Op::Mtcrf => {
                self.load_gpr(T0, inst.rd);
                if inst.fm == 0xFF {
                    self.asm.str_w_imm(T0, STATE, offsets::CR as u32);
                } else {
                    let mut mask: u32 = 0;
                    for field in 0..8u8 {
                        if inst.fm & (0x80 >> field) != 0 {
                            mask |= 0xF << ppu::cr_field_shift(field);
                        }
                    }
                    self.asm.mov_imm64(T1, mask as u64);
                    self.asm.and(T0, T0, T1);
                    self.asm.ldr_w_imm(T2, STATE, offsets::CR as u32);
                    self.asm.bic(T2, T2, T1);
                    self.asm.orr(T0, T0, T2);
                    self.asm.str_w_imm(T0, STATE, offsets::CR as u32);
                }
                Next::Fallthrough
            }
            Op::Mcrf => {
                self.asm.ldr_w_imm(T0, STATE, offsets::CR as u32);
                self.asm
                    .ubfx_w(T1, T0, ppu::cr_field_shift(inst.bfa), 4);
                self.asm.bfi_w(T0, T1, ppu::cr_field_shift(inst.bf), 4);
                self.asm.str_w_imm(T0, STATE, offsets::CR as u32);
                Next::Fallthrough
            }
            Op::Crand
            | Op::Cror
            | Op::Crxor
            | Op::Crnand
            | Op::Crnor
            | Op::Creqv
            | Op::Crandc
            | Op::Crorc => {
                let (bt, ba, bb) = (inst.rd, inst.ra, inst.rb);
                self.asm.ldr_w_imm(T0, STATE, offsets::CR as u32);
                self.asm.ubfx_w(T1, T0, 31 - ba as u32, 1);
                self.asm.ubfx_w(T2, T0, 31 - bb as u32, 1);
                match inst.op {
                    Op::Crand => self.asm.and(T1, T1, T2),
                    Op::Cror => self.asm.orr(T1, T1, T2),
                    Op::Crxor => self.asm.eor(T1, T1, T2),
                    Op::Crandc => self.asm.bic(T1, T1, T2),
                    Op::Crorc => self.asm.orn(T1, T1, T2),
                    Op::Crnand => {
                        self.asm.and(T1, T1, T2);
                        self.asm.mvn(T1, T1);
                    }
                    Op::Crnor => {
                        self.asm.orr(T1, T1, T2);
                        self.asm.mvn(T1, T1);
                    }
                    _ => {
                        self.asm.eon(T1, T1, T2);
                    }
                }
                self.asm.bfi_w(T0, T1, 31 - bt as u32, 1);
                self.asm.str_w_imm(T0, STATE, offsets::CR as u32);
                Next::Fallthrough
            }

            // ---- branches ----
            Op::B => {
                let target = if inst.aa {
                    inst.li as u32
                } else {
                    inst.pc.wrapping_add(inst.li as u32)
                };
                if inst.lk {
                    self.asm.mov_imm64(T0, inst.pc.wrapping_add(4) as u64);
                    self.asm.str_imm(T0, STATE, offsets::LR as u32);
                }
                self.emit_exit(BlockExit::Continue, NextPc::Const(target as u64));
                Next::End
            }
            Op::Bc => {
                let target = if inst.aa {
                    inst.bd as i32 as u32
                } else {
                    inst.pc.wrapping_add(inst.bd as i32 as u32)
                };
                self.emit_conditional_exit(inst, NextPc::Const(target as u64));
                Next::End
            }
            Op::Bclr => {
                self.asm.ldr_imm(T5, STATE, offsets::LR as u32);
                self.asm.movn(T4, 3, 0);
                self.asm.and(T5, T5, T4);
                self.emit_conditional_exit(inst, NextPc::Reg(T5));
                Next::End
            }
            Op::Bcctr => {
                self.asm.ldr_imm(T5, STATE, offsets::CTR as u32);
                self.asm.movn(T4, 3, 0);
                self.asm.and(T5, T5, T4);
                self.emit_conditional_exit(inst, NextPc::Reg(T5));
                Next::End
            }
            Op::Sc => {
                self.emit_exit(
                    BlockExit::Syscall,
                    NextPc::Const(inst.pc.wrapping_add(4) as u64),
                );
                Next::End
            }
            Op::Rfid => {
                self.emit_exit(
                    BlockExit::ReturnFromInterrupt,
                    NextPc::Const(inst.pc.wrapping_add(4) as u64),
                );
                Next::End
            }

            // ---- barriers and cache ops ----
            Op::Sync => {
                self.asm.dsb_ish();
                Next::Fallthrough
            }
            Op::Lwsync | Op::Eieio => {
                self.asm.dmb_ish();
                Next::Fallthrough
            }
            Op::Isync => {
                self.asm.isb();
                Next::Fallthrough
            }
            Op::Dcbz => {
                // Zeroes the 128-byte cache block containing EA.
                self.emit_ea_indexed(inst);
                self.asm.movn(T1, 127, 0);
                self.asm.and(T0, T0, T1);
                self.asm.add(T1, MEM, T0);
                for off in (0..128).step_by(16) {
                    self.asm.stp_off(aarch64::XZR, aarch64::XZR, T1, off);
                }
                Next::Fallthrough
            }
            Op::Dcbf | Op::Dcbst | Op::Dcbt | Op::Dcbtst | Op::Icbi => {
                // Data-cache hints have no observable effect through the
                // window; instruction-cache coherence is handled by write
                // tracking.
                Next::Fallthrough
            }

            // ---- integer loads ----
            Op::Lbz | Op::Lbzu | Op::Lbzx => {
                self.emit_load(inst, 1, false);
                Next::Fallthrough
            }
            Op::Lhz | Op::Lhzu | Op::Lhzx => {
                self.emit_load(inst, 2, false);
                Next::Fallthrough
            }
            Op::Lha | Op::Lhau | Op::Lhax => {
                self.emit_load(inst, 2, true);
                Next::Fallthrough
            }
            Op::Lwz | Op::Lwzu | Op::Lwzx | Op::Lwarx => {
                self.emit_load(inst, 4, false);
                Next::Fallthrough
            }
            Op::Lwa | Op::Lwax => {
                self.emit_load(inst, 4, true);
                Next::Fallthrough
            }
            Op::Ld | Op::Ldu | Op::Ldx | Op::Ldarx => {
                self.emit_load(inst, 8, false);
                Next::Fallthrough
            }
            Op::Lhbrx => {
                self.emit_ea(inst);
                self.asm.ldrh_reg(T2, MEM, T0);
                self.store_gpr(inst.rd, T2);
                Next::Fallthrough
            }
            Op::Lwbrx => {
                self.emit_ea(inst);
                self.asm.ldr_w_reg(T2, MEM, T0);
                self.store_gpr(inst.rd, T2);
                Next::Fallthrough
            }

            // ---- integer stores ----
            Op::Stb | Op::Stbu | Op::Stbx => {
                self.emit_store(inst, 1);
                Next::Fallthrough
            }
            Op::Sth | Op::Sthu | Op::Sthx => {
                self.emit_store(inst, 2);
                Next::Fallthrough
            }
            Op::Stw | Op::Stwu | Op::Stwx => {
                self.emit_store(inst, 4);
                Next::Fallthrough
            }
            Op::Std | Op::Stdu | Op::Stdx => {
                self.emit_store(inst, 8);
                Next::Fallthrough
            }
            Op::Sthbrx => {
                self.emit_ea(inst);
                self.load_gpr_second(T2, inst.rd);
                self.asm.strh_reg(T2, MEM, T0);
                Next::Fallthrough
            }
            Op::Stwbrx => {
                self.emit_ea(inst);
                self.load_gpr_second(T2, inst.rd);
                self.asm.str_w_reg(T2, MEM, T0);
                Next::Fallthrough
            }
            Op::Stwcx | Op::Stdcx => {
                // The reservation always succeeds: one executor per guest
                // thread serializes guest stores with its own loads.
                if inst.op == Op::Stwcx {
                    self.emit_store(inst, 4);
                } else {
                    self.emit_store(inst, 8);
                }
                // CR0 = 0b001x: EQ set, SO carried in.
                self.asm.ldr_w_imm(T1, STATE, offsets::XER as u32);
                self.asm.lsr_w_imm(T1, T1, 31);
                self.asm.mov_imm64(T2, 0b0010);
                self.asm.orr(T1, T1, T2);
                self.asm.ldr_w_imm(T2, STATE, offsets::CR as u32);
                self.asm.bfi_w(T2, T1, 28, 4);
                self.asm.str_w_imm(T2, STATE, offsets::CR as u32);
                Next::Fallthrough
            }

            // ---- FP loads and stores ----
            Op::Lfs | Op::Lfsx => {
                self.emit_ea(inst);
                self.asm.ldr_w_reg(T2, MEM, T0);
                self.asm.rev_w(T2, T2);
                self.asm.fmov_s_w(FT0, T2);
                self.asm.fcvt_ds(FT0, FT0);
                self.asm
                    .str_d_imm(FT0, STATE, offsets::fpr(inst.rd) as u32);
                Next::Fallthrough
            }
            Op::Lfd | Op::Lfdx => {
                self.emit_ea(inst);
                self.asm.ldr_reg(T2, MEM, T0);
                self.asm.rev(T2, T2);
                self.asm.str_imm(T2, STATE, offsets::fpr(inst.rd) as u32);
                Next::Fallthrough
            }
            Op::Stfs | Op::Stfsx => {
                self.emit_ea(inst);
                self.asm
                    .ldr_d_imm(FT0, STATE, offsets::fpr(inst.rd) as u32);
                self.asm.fcvt_sd(FT0, FT0);
                self.asm.fmov_w_s(T2, FT0);
                self.asm.rev_w(T2, T2);
                self.asm.str_w_reg(T2, MEM, T0);
                Next::Fallthrough
            }
            Op::Stfd | Op::Stfdx => {
                self.emit_ea(inst);
                self.asm.ldr_imm(T2, STATE, offsets::fpr(inst.rd) as u32);
                self.asm.rev(T2, T2);
                self.asm.str_reg(T2, MEM, T0);
                Next::Fallthrough
            }

            // ---- FP arithmetic ----
            Op::Fadd | Op::Fadds | Op::Fsub | Op::Fsubs | Op::Fmul | Op::Fmuls | Op::Fdiv
            | Op::Fdivs => {
                self.sync_fpcr();
                let single = matches!(inst.op, Op::Fadds | Op::Fsubs | Op::Fmuls | Op::Fdivs);
                // fmul takes FRC as its second operand; the rest use FRB.
                let rb = if matches!(inst.op, Op::Fmul | Op::Fmuls) {
                    inst.rc_reg
                } else {
                    inst.rb
                };
                self.asm
                    .ldr_d_imm(FT0, STATE, offsets::fpr(inst.ra) as u32);
                self.asm.ldr_d_imm(FT1, STATE, offsets::fpr(rb) as u32);
                match inst.op {
                    Op::Fadd | Op::Fadds => self.asm.fadd_d(FT0, FT0, FT1),
                    Op::Fsub | Op::Fsubs => self.asm.fsub_d(FT0, FT0, FT1),
                    Op::Fmul | Op::Fmuls => self.asm.fmul_d(FT0, FT0, FT1),
                    _ => self.asm.fdiv_d(FT0, FT0, FT1),
                }
                if single {
                    self.emit_round_to_single(FT0);
                }
                self.asm
                    .str_d_imm(FT0, STATE, offsets::fpr(inst.rd) as u32);
                Next::Fallthrough
            }
            Op::Fmadd | Op::Fmadds | Op::Fmsub | Op::Fmsubs => {
                self.sync_fpcr();
                let single = matches!(inst.op, Op::Fmadds | Op::Fmsubs);
                self.asm
                    .ldr_d_imm(FT0, STATE, offsets::fpr(inst.ra) as u32);
                self.asm
                    .ldr_d_imm(FT1, STATE, offsets::fpr(inst.rc_reg) as u32);
                self.asm
                    .ldr_d_imm(FT2, STATE, offsets::fpr(inst.rb) as u32);
                if matches!(inst.op, Op::Fmadd | Op::Fmadds) {
                    // frt = fra*frc + frb
                    self.asm.fmadd_d(FT3, FT0, FT1, FT2);
                } else {
                    // frt = fra*frc - frb
                    self.asm.fnmsub_d(FT3, FT0, FT1, FT2);
                }
                if single {
                    self.emit_round_to_single(FT3);
                }
                self.asm
                    .str_d_imm(FT3, STATE, offsets::fpr(inst.rd) as u32);
                Next::Fallthrough
            }
            Op::Fmr | Op::Fneg | Op::Fabs => {
                self.asm
                    .ldr_d_imm(FT0, STATE, offsets::fpr(inst.rb) as u32);
                match inst.op {
                    Op::Fneg => self.asm.fneg_d(FT0, FT0),
                    Op::Fabs => self.asm.fabs_d(FT0, FT0),
                    _ => {}
                }
                self.asm
                    .str_d_imm(FT0, STATE, offsets::fpr(inst.rd) as u32);
                Next::Fallthrough
            }
            Op::Frsp => {
                self.sync_fpcr();
                self.asm
                    .ldr_d_imm(FT0, STATE, offsets::fpr(inst.rb) as u32);
                self.emit_round_to_single(FT0);
                self.asm
                    .str_d_imm(FT0, STATE, offsets::fpr(inst.rd) as u32);
                Next::Fallthrough
            }
            Op::Fcmpu => {
                self.asm
                    .ldr_d_imm(FT0, STATE, offsets::fpr(inst.ra) as u32);
                self.asm
                    .ldr_d_imm(FT1, STATE, offsets::fpr(inst.rb) as u32);
                self.asm.fcmp_d(FT0, FT1);
                // LT/GT/EQ/UN, packed like an integer compare nibble with
                // the unordered bit in the SO slot.
                self.asm.cset(T0, Cond::Mi);
                self.asm.lsl_imm(T0, T0, 3);
                self.asm.cset(T1, Cond::Gt);
                self.asm.lsl_imm(T1, T1, 2);
                self.asm.orr(T0, T0, T1);
                self.asm.cset(T1, Cond::Eq);
                self.asm.lsl_imm(T1, T1, 1);
                self.asm.orr(T0, T0, T1);
                self.asm.cset(T1, Cond::Vs);
                self.asm.orr(T0, T0, T1);
                self.asm.ldr_w_imm(T1, STATE, offsets::CR as u32);
                self.asm.bfi_w(T1, T0, ppu::cr_field_shift(inst.bf), 4);
                self.asm.str_w_imm(T1, STATE, offsets::CR as u32);
                Next::Fallthrough
            }
            Op::Fctiwz => {
                self.asm
                    .ldr_d_imm(FT0, STATE, offsets::fpr(inst.rb) as u32);
                self.asm.fcvtzs_w_d(T0, FT0);
                self.asm.str_imm(T0, STATE, offsets::fpr(inst.rd) as u32);
                Next::Fallthrough
            }
            Op::Fcfid => {
                self.sync_fpcr();
                self.asm.ldr_imm(T0, STATE, offsets::fpr(inst.rb) as u32);
                self.asm.scvtf_d_x(FT0, T0);
                self.asm
                    .str_d_imm(FT0, STATE, offsets::fpr(inst.rd) as u32);
                Next::Fallthrough
            }
            Op::Mffs => {
                self.asm.ldr_w_imm(T0, STATE, offsets::FPSCR as u32);
                self.asm.str_imm(T0, STATE, offsets::fpr(inst.rd) as u32);
                Next::Fallthrough
            }
            Op::Mtfsf => {
                self.asm.ldr_imm(T0, STATE, offsets::fpr(inst.rb) as u32);
                if inst.fm == 0xFF {
                    self.asm.str_w_imm(T0, STATE, offsets::FPSCR as u32);
                } else {
                    let mut mask: u32 = 0;
                    for field in 0..8u8 {
                        if inst.fm & (0x80 >> field) != 0 {
                            mask |= 0xF << ppu::cr_field_shift(field);
                        }
                    }
                    self.asm.mov_imm64(T1, mask as u64);
                    self.asm.and(T0, T0, T1);
                    self.asm.ldr_w_imm(T2, STATE, offsets::FPSCR as u32);
                    self.asm.bic(T2, T2, T1);
                    self.asm.orr(T0, T0, T2);
                    self.asm.str_w_imm(T0, STATE, offsets::FPSCR as u32);
                }
                // The guest may have changed the rounding mode.
                self.fpcr_synced = false;
                Next::Fallthrough
            }

            // ---- vector ----
            Op::Lvx => {
                self.emit_ea_indexed(inst);
                self.asm.movn(T1, 15, 0);
                self.asm.and(T0, T0, T1);
                self.asm.ldr_q_reg(FT0, MEM, T0);
                self.emit_vec_byteswap(FT0);
                self.asm
                    .str_q_imm(FT0, STATE, offsets::vr(inst.rd) as u32);
                Next::Fallthrough
            }
            Op::Stvx => {
                self.emit_ea_indexed(inst);
                self.asm.movn(T1, 15, 0);
                self.asm.and(T0, T0, T1);
                self.asm
                    .ldr_q_imm(FT0, STATE, offsets::vr(inst.rd) as u32);
                self.emit_vec_byteswap(FT0);
                self.asm.str_q_reg(FT0, MEM, T0);
                Next::Fallthrough
            }
            Op::Vand | Op::Vor | Op::Vxor | Op::Vadduwm | Op::Vsubuwm | Op::Vaddfp
            | Op::Vsubfp => {
                self.asm
                    .ldr_q_imm(FT0, STATE, offsets::vr(inst.ra) as u32);
                self.asm
                    .ldr_q_imm(FT1, STATE, offsets::vr(inst.rb) as u32);
                match inst.op {
                    Op::Vand => self.asm.and_v16b(FT0, FT0, FT1),
                    Op::Vor => self.asm.orr_v16b(FT0, FT0, FT1),
                    Op::Vxor => self.asm.eor_v16b(FT0, FT0, FT1),
                    Op::Vadduwm => self.asm.add_v4s(FT0, FT0, FT1),
                    Op::Vsubuwm => self.asm.sub_v4s(FT0, FT0, FT1),
                    Op::Vaddfp => self.asm.fadd_v4s(FT0, FT0, FT1),
                    _ => self.asm.fsub_v4s(FT0, FT0, FT1),
                }
                self.asm
                    .str_q_imm(FT0, STATE, offsets::vr(inst.rd) as u32);
                Next::Fallthrough
            }
            Op::Vmaddfp => {
                // vrt = vra*vrc + vrb
                self.asm
                    .ldr_q_imm(FT0, STATE, offsets::vr(inst.rb) as u32);
                self.asm
                    .ldr_q_imm(FT1, STATE, offsets::vr(inst.ra) as u32);
                self.asm
                    .ldr_q_imm(FT2, STATE, offsets::vr(inst.rc_reg) as u32);
                self.asm.fmla_v4s(FT0, FT1, FT2);
                self.asm
                    .str_q_imm(FT0, STATE, offsets::vr(inst.rd) as u32);
                Next::Fallthrough
            }

            Op::Unknown => self.emit_unhandled(inst),
        }
    }

    // ---- helpers ----

    fn known_const(&self, g: u8) -> Option<u64> {
        if self.tier == Tier::Optimizing {
            self.const_gpr[g as usize]
        } else {
            None
        }
    }

    fn set_const(&mut self, g: u8, value: u64) {
        if self.tier == Tier::Optimizing {
            self.const_gpr[g as usize] = Some(value);
        }
    }

    /// Loads guest GPR `g` into `dst`. The first load of an instruction may
    /// be satisfied by the previous instruction's still-live result.
    fn load_gpr(&mut self, dst: Reg, g: u8) {
        let hit = self.cache_armed && self.cached == Some((g, dst));
        self.cache_armed = false;
        if !hit {
            self.asm.ldr_imm(dst, STATE, offsets::gpr(g) as u32);
        }
    }

    /// A load that must never consult the reuse cache (the scratch it would
    /// name may already be clobbered by this instruction's own code).
    fn load_gpr_second(&mut self, dst: Reg, g: u8) {
        self.cache_armed = false;
        self.asm.ldr_imm(dst, STATE, offsets::gpr(g) as u32);
    }

    /// Loads two guest GPRs into T0 and T1.
    fn load_two(&mut self, a: u8, b: u8) {
        if self.cache_armed && self.cached == Some((b, T0)) && a != b {
            self.cache_armed = false;
            self.asm.mov(T1, T0);
            self.asm.ldr_imm(T0, STATE, offsets::gpr(a) as u32);
            return;
        }
        self.load_gpr(T0, a);
        if a == b {
            self.asm.mov(T1, T0);
        } else {
            self.load_gpr_second(T1, b);
        }
    }

    fn store_gpr(&mut self, g: u8, src: Reg) {
        self.asm.str_imm(src, STATE, offsets::gpr(g) as u32);
        if self.tier == Tier::Optimizing {
            self.cached = Some((g, src));
            self.const_gpr[g as usize] = None;
        }
    }

    /// `dst = src + imm`, choosing the immediate form when it fits.
    fn add_signed_imm(&mut self, dst: Reg, src: Reg, imm: i64) {
        if (0..4096).contains(&imm) {
            self.asm.add_imm(dst, src, imm as u32);
        } else if (-4095..0).contains(&imm) {
            self.asm.sub_imm(dst, src, (-imm) as u32);
        } else {
            self.asm.mov_imm64(T4, imm as u64);
            self.asm.add(dst, src, T4);
        }
    }

    /// Computes the guest effective address into T0, truncated to the
    /// 32-bit guest address space. D-form (displacement) encoding.
    fn emit_ea(&mut self, inst: &Inst) {
        if matches!(
            inst.op,
            Op::Lbzx
                | Op::Lhzx
                | Op::Lhax
                | Op::Lwzx
                | Op::Lwax
                | Op::Ldx
                | Op::Stbx
                | Op::Sthx
                | Op::Stwx
                | Op::Stdx
                | Op::Lhbrx
                | Op::Lwbrx
                | Op::Sthbrx
                | Op::Stwbrx
                | Op::Lwarx
                | Op::Ldarx
                | Op::Stwcx
                | Op::Stdcx
                | Op::Lfsx
                | Op::Lfdx
                | Op::Stfsx
                | Op::Stfdx
        ) {
            self.emit_ea_indexed(inst);
            return;
        }
        if inst.ra == 0 {
            self.asm.mov_imm64(T0, inst.simm as i64 as u64 & 0xFFFF_FFFF);
        } else {
            self.load_gpr(T0, inst.ra);
            self.add_signed_imm(T0, T0, inst.simm as i64);
            self.asm.mov_w(T0, T0);
        }
    }

    /// EA for X-form accesses: (ra|0) + rb, truncated to 32 bits.
    fn emit_ea_indexed(&mut self, inst: &Inst) {
        if inst.ra == 0 {
            self.load_gpr(T0, inst.rb);
            self.asm.mov_w(T0, T0);
        } else {
            self.load_two(inst.ra, inst.rb);
            self.asm.add(T0, T0, T1);
            self.asm.mov_w(T0, T0);
        }
    }

    /// Big-endian guest load of `width` bytes into the destination GPR,
    /// with optional sign extension, plus base write-back for update forms.
    fn emit_load(&mut self, inst: &Inst, width: u8, sign: bool) {
        self.emit_ea(inst);
        match width {
            1 => {
                self.asm.ldrb_reg(T2, MEM, T0);
            }
            2 => {
                self.asm.ldrh_reg(T2, MEM, T0);
                self.asm.rev16_w(T2, T2);
                if sign {
                    self.asm.sxth(T2, T2);
                }
            }
            4 => {
                self.asm.ldr_w_reg(T2, MEM, T0);
                self.asm.rev_w(T2, T2);
                if sign {
                    self.asm.sxtw(T2, T2);
                }
            }
            _ => {
                self.asm.ldr_reg(T2, MEM, T0);
                self.asm.rev(T2, T2);
            }
        }
        self.store_gpr(inst.rd, T2);
        if inst.writes_back_base() {
            self.store_gpr(inst.ra, T0);
        }
    }

    /// Big-endian guest store of `width` bytes from the source GPR.
    fn emit_store(&mut self, inst: &Inst, width: u8) {
        self.emit_ea(inst);
        self.load_gpr_second(T2, inst.rd);
        match width {
            1 => {
                self.asm.strb_reg(T2, MEM, T0);
            }
            2 => {
                self.asm.rev16_w(T2, T2);
                self.asm.strh_reg(T2, MEM, T0);
            }
            4 => {
                self.asm.rev_w(T2, T2);
                self.asm.str_w_reg(T2, MEM, T0);
            }
            _ => {
                self.asm.rev(T2, T2);
                self.asm.str_reg(T2, MEM, T0);
            }
        }
        if inst.writes_back_base() {
            self.store_gpr(inst.ra, T0);
        }
    }

    /// Variable-amount arithmetic shift right with exact carry, shared by
    /// `sraw` and `srad`.
    fn emit_sra_variable(&mut self, inst: &Inst, width: u32) {
        self.load_two(inst.rd, inst.rb);
        if width == 32 {
            self.asm.sxtw(T0, T0);
        }
        let amount_mask: u64 = if width == 32 { 63 } else { 127 };
        self.asm.mov_imm64(T2, amount_mask);
        self.asm.and(T1, T1, T2);
        // Clamp the amount: shifting by >= width fills with sign bits.
        self.asm.mov_imm64(T2, (width - 1) as u64);
        self.asm.cmp(T1, T2);
        self.asm.csel(T3, T1, T2, Cond::Ls);
        self.asm.asrv(T4, T0, T3);
        // CA: source negative and any bit shifted out. Recover the lost
        // bits by shifting back and comparing; the clamped amount misses
        // the all-bits-out case, so add an explicit "amount >= width and
        // source nonzero" term.
        self.asm.lslv(T2, T4, T3);
        self.asm.cmp(T2, T0);
        self.asm.cset(T2, Cond::Ne);
        self.asm.mov_imm64(T3, width as u64);
        self.asm.cmp(T1, T3);
        self.asm.cset(T3, Cond::Cs);
        self.asm.cmp_imm(T0, 0);
        self.asm.cset(T1, Cond::Ne);
        self.asm.and(T3, T3, T1);
        self.asm.orr(T2, T2, T3);
        self.asm.lsr_imm(T1, T0, 63);
        self.asm.and(T2, T2, T1);
        self.emit_set_carry_from(T2);
        self.asm.mov(T0, T4);
        self.store_gpr(inst.ra, T0);
    }

    /// Writes the flags' carry into XER.CA.
    fn emit_store_carry(&mut self) {
        self.asm.cset(T3, Cond::Cs);
        self.emit_set_carry_from(T3);
    }

    /// Writes bit 0 of `src` into XER.CA. Clobbers T4.
    fn emit_set_carry_from(&mut self, src: Reg) {
        self.asm.ldr_w_imm(T4, STATE, offsets::XER as u32);
        self.asm.bfi_w(T4, src, 29, 1);
        self.asm.str_w_imm(T4, STATE, offsets::XER as u32);
    }

    /// Loads XER.CA (0 or 1) into `dst`.
    fn emit_load_carry(&mut self, dst: Reg) {
        self.asm.ldr_w_imm(dst, STATE, offsets::XER as u32);
        self.asm.ubfx_w(dst, dst, 29, 1);
    }

    /// CR0 update from a 64-bit result: LT/GT/EQ from a signed compare with
    /// zero, SO copied through from XER. Preserves T0.
    fn emit_record_cr0(&mut self, result: Reg) {
        self.asm.cmp_imm(result, 0);
        self.asm.cset(T1, Cond::Lt);
        self.asm.lsl_imm(T1, T1, 3);
        self.asm.cset(T2, Cond::Gt);
        self.asm.lsl_imm(T2, T2, 2);
        self.asm.orr(T1, T1, T2);
        self.asm.cset(T2, Cond::Eq);
        self.asm.lsl_imm(T2, T2, 1);
        self.asm.orr(T1, T1, T2);
        self.asm.ldr_w_imm(T2, STATE, offsets::XER as u32);
        self.asm.lsr_w_imm(T2, T2, 31);
        self.asm.orr(T1, T1, T2);
        self.asm.ldr_w_imm(T2, STATE, offsets::CR as u32);
        self.asm.bfi_w(T2, T1, 28, 4);
        self.asm.str_w_imm(T2, STATE, offsets::CR as u32);
    }

    /// Compare into CR field `bf`. Immediate and register forms, signed and
    /// unsigned, 32- and 64-bit per the L bit.
    fn emit_compare(&mut self, inst: &Inst, signed: bool) {
        let immediate = matches!(inst.op, Op::Cmpi | Op::Cmpli);
        self.load_gpr(T0, inst.ra);
        if immediate {
            let value = if signed {
                inst.simm as i64 as u64
            } else {
                inst.uimm as u64
            };
            self.asm.mov_imm64(T1, value);
        } else {
            self.load_gpr_second(T1, inst.rb);
        }
        if !inst.l {
            // 32-bit compare: extend both operands to 64 bits first.
            if signed {
                self.asm.sxtw(T0, T0);
                if !immediate {
                    self.asm.sxtw(T1, T1);
                }
            } else {
                self.asm.mov_w(T0, T0);
                if !immediate {
                    self.asm.mov_w(T1, T1);
                }
            }
        }
        self.asm.cmp(T0, T1);
        let (lt, gt) = if signed {
            (Cond::Lt, Cond::Gt)
        } else {
            (Cond::Cc, Cond::Hi)
        };
        self.asm.cset(T1, lt);
        self.asm.lsl_imm(T1, T1, 3);
        self.asm.cset(T2, gt);
        self.asm.lsl_imm(T2, T2, 2);
        self.asm.orr(T1, T1, T2);
        self.asm.cset(T2, Cond::Eq);
        self.asm.lsl_imm(T2, T2, 1);
        self.asm.orr(T1, T1, T2);
        self.asm.ldr_w_imm(T2, STATE, offsets::XER as u32);
        self.asm.lsr_w_imm(T2, T2, 31);
        self.asm.orr(T1, T1, T2);
        self.asm.ldr_w_imm(T2, STATE, offsets::CR as u32);
        self.asm.bfi_w(T2, T1, ppu::cr_field_shift(inst.bf), 4);
        self.asm.str_w_imm(T2, STATE, offsets::CR as u32);
    }

    /// Full 16-byte reversal between guest and host vector byte order:
    /// byte-reverse each doubleword, then swap the two doublewords.
    fn emit_vec_byteswap(&mut self, v: aarch64::VReg) {
        self.asm.rev64_v16b(v, v);
        self.asm.ext_v16b(v, v, v, 8);
    }

    /// Rounds a double scratch through single precision, the semantics of
    /// the guest's single-precision arithmetic forms.
    fn emit_round_to_single(&mut self, v: aarch64::VReg) {
        self.asm.fcvt_sd(v, v);
        self.asm.fcvt_ds(v, v);
    }

    /// Mirrors the guest FPSCR rounding mode into the host FPCR. The
    /// baseline tier re-syncs before every FP instruction; the optimizing
    /// tier syncs once and again after any FPSCR write.
    fn sync_fpcr(&mut self) {
        if self.tier == Tier::Optimizing && self.fpcr_synced {
            return;
        }
        self.asm.ldr_w_imm(T0, STATE, offsets::FPSCR as u32);
        self.asm.mov_imm64(T1, 3);
        self.asm.and(T0, T0, T1);
        self.asm.lsl_imm(T0, T0, 1);
        // Guest RN -> host RMode lookup, packed two bits per entry:
        // nearest->nearest, zero->zero, +inf->+inf, -inf->-inf.
        self.asm.mov_imm64(T1, 0x9C);
        self.asm.lsrv(T1, T1, T0);
        self.asm.mov_imm64(T0, 3);
        self.asm.and(T1, T1, T0);
        self.asm.mrs_fpcr(T0);
        self.asm.bfi_w(T0, T1, 22, 2);
        self.asm.msr_fpcr(T0);
        self.fpcr_synced = true;
    }

    /// Conditional-branch lowering: evaluates BO/BI into a taken flag, then
    /// selects between the target and the fallthrough PC.
    fn emit_conditional_exit(&mut self, inst: &Inst, target: NextPc) {
        if inst.lk {
            self.asm.mov_imm64(T0, inst.pc.wrapping_add(4) as u64);
            self.asm.str_imm(T0, STATE, offsets::LR as u32);
        }
        let ignore_ctr = inst.bo & 0b00100 != 0;
        let ignore_cond = inst.bo & 0b10000 != 0;

        // taken flag accumulates in T3.
        if ignore_ctr && ignore_cond {
            self.emit_exit(BlockExit::Continue, target);
            return;
        }

        let mut have_flag = false;
        if !ignore_ctr {
            self.asm.ldr_imm(T0, STATE, offsets::CTR as u32);
            self.asm.sub_imm(T0, T0, 1);
            self.asm.str_imm(T0, STATE, offsets::CTR as u32);
            self.asm.cmp_imm(T0, 0);
            let want_zero = inst.bo & 0b00010 != 0;
            self.asm
                .cset(T3, if want_zero { Cond::Eq } else { Cond::Ne });
            have_flag = true;
        }
        if !ignore_cond {
            self.asm.ldr_w_imm(T0, STATE, offsets::CR as u32);
            self.asm.ubfx_w(T0, T0, 31 - inst.bi as u32, 1);
            let want_set = inst.bo & 0b01000 != 0;
            self.asm.cmp_imm(T0, if want_set { 1 } else { 0 });
            self.asm.cset(T0, Cond::Eq);
            if have_flag {
                self.asm.and(T3, T3, T0);
            } else {
                self.asm.mov(T3, T0);
            }
        }

        // next_pc = taken ? target : pc + 4
        self.asm.mov_imm64(T2, inst.pc.wrapping_add(4) as u64);
        match target {
            NextPc::Const(t) => self.asm.mov_imm64(T1, t),
            NextPc::Reg(r) => {
                if r != T1 {
                    self.asm.mov(T1, r);
                }
            }
        }
        self.asm.cmp_imm(T3, 0);
        self.asm.csel(T1, T2, T1, Cond::Eq);
        self.emit_exit(BlockExit::Continue, NextPc::Reg(T1));
    }

    fn emit_unhandled(&mut self, inst: &Inst) -> Next {
        log::trace!(
            "unhandled guest instruction {:#010x} at {:#x}",
            inst.raw,
            inst.pc
        );
        self.emit_exit(BlockExit::Unhandled, NextPc::Const(inst.pc as u64));
        Next::End
    }

    /// Publishes the next PC and exit reason, then emits the epilogue.
    fn emit_exit(&mut self, reason: BlockExit, next_pc: NextPc) {
        match next_pc {
            NextPc::Const(v) => {
                self.asm.mov_imm64(T5, v);
                self.asm.str_imm(T5, STATE, offsets::NEXT_PC as u32);
            }
            NextPc::Reg(r) => {
                self.asm.str_imm(r, STATE, offsets::NEXT_PC as u32);
            }
        }
        self.asm.mov_imm64(aarch64::X0, reason as u64);
        emit_epilogue(self.asm);
        self.cached = None;
    }
}

/// Emits the size-cap fallthrough exit: publishes `next_pc`, sets the
/// `Continue` reason, and closes with the epilogue.
pub fn emit_continue_exit(asm: &mut Assembler, next_pc: u64) {
    asm.mov_imm64(T5, next_pc);
    asm.str_imm(T5, STATE, offsets::NEXT_PC as u32);
    asm.mov_imm64(aarch64::X0, BlockExit::Continue as u64);
    emit_epilogue(asm);
}

/// Block prologue: saves the reserved registers, loads the state and window
/// bases, and snapshots the host FPCR for the epilogue to restore.
pub fn emit_prologue(asm: &mut Assembler) {
    asm.stp_pre(aarch64::X29, aarch64::X30, aarch64::SP, -32);
    asm.stp_off(STATE, MEM, aarch64::SP, 16);
    asm.add_imm(aarch64::X29, aarch64::SP, 0);
    asm.mov(STATE, aarch64::X0);
    asm.ldr_imm(MEM, STATE, offsets::MEMBASE as u32);
    asm.mrs_fpcr(T0);
    asm.str_imm(T0, STATE, offsets::HOST_FPCR as u32);
}

/// Block epilogue: restores the host FPCR and the saved registers. The exit
/// reason is already in x0 and `next_pc` already in the state.
pub fn emit_epilogue(asm: &mut Assembler) {
    asm.ldr_imm(T0, STATE, offsets::HOST_FPCR as u32);
    asm.msr_fpcr(T0);
    asm.ldp_off(STATE, MEM, aarch64::SP, 16);
    asm.ldp_post(aarch64::X29, aarch64::X30, aarch64::SP, 32);
    asm.ret();
}
