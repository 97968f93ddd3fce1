//! The interpreter: tier 0 of the execution pipeline.
//!
//! Executes one decoded guest instruction directly against the state record
//! and the memory window. It backs three paths: instructions the translator
//! cannot lower, blocks the compiler cannot place, and entire execution on
//! hosts without an AArch64 JIT. Semantics mirror the translator's lowering
//! choices bit for bit (address masking, undefined-result choices, carry
//! computation), so a block boundary looks the same whichever tier ran.
//!
//! FP arithmetic runs at host rounding (nearest); only translated code
//! mirrors the guest FPSCR rounding mode into the FPCR.

use cellvm_isa::ppu::{self, cr_field_shift, decode, mask32, mask64, Inst, Op, PpuState};
use log::warn;

use crate::memory::MemoryWindow;

/// Outcome of one interpreted step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    Continue,
    Syscall,
    ReturnFromInterrupt,
    /// A guest memory access left the window.
    Fault { guest_addr: u64 },
}

#[inline]
fn ea_mask(addr: u64) -> u64 {
    addr & 0xFFFF_FFFF
}

#[inline]
fn reg_or_zero(state: &PpuState, ra: u8) -> u64 {
    if ra == 0 {
        0
    } else {
        state.gpr[ra as usize]
    }
}

fn set_cr_field(state: &mut PpuState, bf: u8, nibble: u32) {
    state.cr = ppu::cr_set_field(state.cr, bf, nibble);
}

fn record_cr0(state: &mut PpuState, result: u64) {
    let so = state.xer & ppu::XER_SO != 0;
    let nibble = ppu::cr_nibble_signed(result as i64, 0, so);
    set_cr_field(state, 0, nibble);
}

fn set_ca(state: &mut PpuState, carry: bool) {
    if carry {
        state.xer |= ppu::XER_CA;
    } else {
        state.xer &= !ppu::XER_CA;
    }
}

/// Interprets the instruction at `state.pc`, advancing `pc`.
pub fn step(state: &mut PpuState, window: &MemoryWindow) -> StepResult {
    let pc = state.pc as u32;
    let Some(word) = window.read_u32_be(pc) else {
        return StepResult::Fault {
            guest_addr: state.pc,
        };
    };
    let inst = decode(word, pc);
    execute(state, window, &inst)
}

/// Executes one already decoded instruction, advancing `state.pc`.
pub fn execute(state: &mut PpuState, window: &MemoryWindow, inst: &Inst) -> StepResult {
    let mut next_pc = (inst.pc as u64).wrapping_add(4);
    let mut result = StepResult::Continue;

    macro_rules! gpr {
        ($i:expr) => {
            state.gpr[$i as usize]
        };
    }

    match inst.op {
        Op::Addi => {
            gpr!(inst.rd) = reg_or_zero(state, inst.ra).wrapping_add(inst.simm as i64 as u64);
        }
        Op::Addis => {
            gpr!(inst.rd) =
                reg_or_zero(state, inst.ra).wrapping_add(((inst.simm as i64) << 16) as u64);
        }
        Op::Addic | Op::AddicRc => {
            let a = gpr!(inst.ra);
            let b = inst.simm as i64 as u64;
            let (value, carry) = a.overflowing_add(b);
            gpr!(inst.rd) = value;
            set_ca(state, carry);
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Subfic => {
            let a = gpr!(inst.ra);
            let b = inst.simm as i64 as u64;
            let (value, borrow) = b.overflowing_sub(a);
            gpr!(inst.rd) = value;
            set_ca(state, !borrow);
        }
        Op::Mulli => {
            gpr!(inst.rd) = gpr!(inst.ra).wrapping_mul(inst.simm as i64 as u64);
        }
        Op::Add => {
            let value = gpr!(inst.ra).wrapping_add(gpr!(inst.rb));
            gpr!(inst.rd) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Subf => {
            let value = gpr!(inst.rb).wrapping_sub(gpr!(inst.ra));
            gpr!(inst.rd) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Neg => {
            let value = (gpr!(inst.ra) as i64).wrapping_neg() as u64;
            gpr!(inst.rd) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Addze => {
            let carry_in = (state.xer & ppu::XER_CA != 0) as u64;
            let (value, carry) = gpr!(inst.ra).overflowing_add(carry_in);
            gpr!(inst.rd) = value;
            set_ca(state, carry);
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Mullw => {
            let a = gpr!(inst.ra) as u32 as i32 as i64;
            let b = gpr!(inst.rb) as u32 as i32 as i64;
            let value = a.wrapping_mul(b) as u64;
            gpr!(inst.rd) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Mulld => {
            let value = gpr!(inst.ra).wrapping_mul(gpr!(inst.rb));
            gpr!(inst.rd) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Mulhw => {
            let a = gpr!(inst.ra) as u32 as i32 as i64;
            let b = gpr!(inst.rb) as u32 as i32 as i64;
            gpr!(inst.rd) = (a.wrapping_mul(b) >> 32) as u64;
        }
        Op::Mulhwu => {
            let a = gpr!(inst.ra) as u32 as u64;
            let b = gpr!(inst.rb) as u32 as u64;
            gpr!(inst.rd) = a.wrapping_mul(b) >> 32;
        }
        Op::Divw => {
            let a = gpr!(inst.ra) as u32 as i32;
            let b = gpr!(inst.rb) as u32 as i32;
            // Division overflow mirrors the host sdiv: zero divisor gives
            // zero, INT_MIN / -1 wraps.
            let q = if b == 0 { 0 } else { a.wrapping_div(b) };
            let value = q as u32 as u64;
            gpr!(inst.rd) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Divwu => {
            let a = gpr!(inst.ra) as u32;
            let b = gpr!(inst.rb) as u32;
            let value = if b == 0 { 0 } else { (a / b) as u64 };
            gpr!(inst.rd) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Divd => {
            let a = gpr!(inst.ra) as i64;
            let b = gpr!(inst.rb) as i64;
            let value = if b == 0 { 0 } else { a.wrapping_div(b) } as u64;
            gpr!(inst.rd) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Divdu => {
            let a = gpr!(inst.ra);
            let b = gpr!(inst.rb);
            let value = if b == 0 { 0 } else { a / b };
            gpr!(inst.rd) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Andi | Op::Andis | Op::Ori | Op::Oris | Op::Xori | Op::Xoris => {
            let imm = if matches!(inst.op, Op::Andis | Op::Oris | Op::Xoris) {
                (inst.uimm as u64) << 16
            } else {
                inst.uimm as u64
            };
            let src = gpr!(inst.rd);
            let value = match inst.op {
                Op::Andi | Op::Andis => src & imm,
                Op::Ori | Op::Oris => src | imm,
                _ => src ^ imm,
            };
            gpr!(inst.ra) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::And | Op::Or | Op::Xor | Op::Nand | Op::Nor | Op::Andc | Op::Orc | Op::Eqv => {
            let s = gpr!(inst.rd);
            let b = gpr!(inst.rb);
            let value = match inst.op {
                Op::And => s & b,
                Op::Or => s | b,
                Op::Xor => s ^ b,
                Op::Nand => !(s & b),
                Op::Nor => !(s | b),
                Op::Andc => s & !b,
                Op::Orc => s | !b,
                _ => !(s ^ b),
            };
            gpr!(inst.ra) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Extsb => {
            let value = gpr!(inst.rd) as i8 as i64 as u64;
            gpr!(inst.ra) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Extsh => {
            let value = gpr!(inst.rd) as i16 as i64 as u64;
            gpr!(inst.ra) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Extsw => {
            let value = gpr!(inst.rd) as i32 as i64 as u64;
            gpr!(inst.ra) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Cntlzw => {
            let value = (gpr!(inst.rd) as u32).leading_zeros() as u64;
            gpr!(inst.ra) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Cntlzd => {
            let value = gpr!(inst.rd).leading_zeros() as u64;
            gpr!(inst.ra) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Rlwinm | Op::Rlwnm | Op::Rlwimi => {
            let n = if inst.op == Op::Rlwnm {
                (gpr!(inst.rb) & 31) as u32
            } else {
                inst.sh as u32
            };
            let rotated = (gpr!(inst.rd) as u32).rotate_left(n);
            let mask = mask32(inst.mb as u32, inst.me as u32);
            let value = if inst.op == Op::Rlwimi {
                ((rotated & mask) as u64) | (gpr!(inst.ra) & !(mask as u64))
            } else {
                (rotated & mask) as u64
            };
            gpr!(inst.ra) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Rldicl | Op::Rldicr => {
            let rotated = gpr!(inst.rd).rotate_left(inst.sh as u32);
            let mask = if inst.op == Op::Rldicl {
                mask64(inst.mb as u32, 63)
            } else {
                mask64(0, inst.me as u32)
            };
            let value = rotated & mask;
            gpr!(inst.ra) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Slw => {
            let n = gpr!(inst.rb) & 63;
            let value = ((gpr!(inst.rd) as u32 as u64) << n) as u32 as u64;
            gpr!(inst.ra) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Srw => {
            let n = gpr!(inst.rb) & 63;
            let value = (gpr!(inst.rd) as u32 as u64) >> n;
            gpr!(inst.ra) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Sld => {
            let n = gpr!(inst.rb) & 127;
            let value = if n >= 64 { 0 } else { gpr!(inst.rd) << n };
            gpr!(inst.ra) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Srd => {
            let n = gpr!(inst.rb) & 127;
            let value = if n >= 64 { 0 } else { gpr!(inst.rd) >> n };
            gpr!(inst.ra) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Srawi | Op::Sraw => {
            let src = gpr!(inst.rd) as u32 as i32 as i64;
            let n = if inst.op == Op::Srawi {
                inst.sh as u64 & 31
            } else {
                gpr!(inst.rb) & 63
            };
            let shift = n.min(63) as u32;
            let value = (src >> shift.min(63)) as u64;
            let lost = src != ((src >> shift) << shift) || (n >= 32 && src as u32 != 0);
            set_ca(state, src < 0 && lost);
            gpr!(inst.ra) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Sradi | Op::Srad => {
            let src = gpr!(inst.rd) as i64;
            let n = if inst.op == Op::Sradi {
                inst.sh as u64 & 63
            } else {
                gpr!(inst.rb) & 127
            };
            let shift = n.min(63) as u32;
            let value = (src >> shift) as u64;
            let lost = src != ((src >> shift) << shift) || (n >= 64 && src != 0);
            set_ca(state, src < 0 && lost);
            gpr!(inst.ra) = value;
            if inst.rc {
                record_cr0(state, value);
            }
        }
        Op::Cmpi | Op::Cmp | Op::Cmpli | Op::Cmpl => {
            let signed = matches!(inst.op, Op::Cmpi | Op::Cmp);
            let immediate = matches!(inst.op, Op::Cmpi | Op::Cmpli);
            let a = gpr!(inst.ra);
            let b = if immediate {
                if signed {
                    inst.simm as i64 as u64
                } else {
                    inst.uimm as u64
                }
            } else {
                gpr!(inst.rb)
            };
            let so = state.xer & ppu::XER_SO != 0;
            let nibble = if signed {
                // The immediate is already sign-extended to 64 bits; a
                // 32-bit register compare extends the operands first.
                let av = if inst.l { a as i64 } else { a as u32 as i32 as i64 };
                let bv = if inst.l || immediate {
                    b as i64
                } else {
                    b as u32 as i32 as i64
                };
                ppu::cr_nibble_signed(av, bv, so)
            } else {
                let av = if inst.l { a } else { a as u32 as u64 };
                let bv = if inst.l || immediate { b } else { b as u32 as u64 };
                ppu::cr_nibble_unsigned(av, bv, so)
            };
            set_cr_field(state, inst.bf, nibble);
        }
        Op::Mfspr => match inst.spr {
            1 => gpr!(inst.rd) = state.xer as u64,
            8 => gpr!(inst.rd) = state.lr,
            9 => gpr!(inst.rd) = state.ctr,
            other => {
                warn!("mfspr from unmodeled SPR {other}; reading zero");
                gpr!(inst.rd) = 0;
            }
        },
        Op::Mtspr => match inst.spr {
            1 => state.xer = gpr!(inst.rd) as u32,
            8 => state.lr = gpr!(inst.rd),
            9 => state.ctr = gpr!(inst.rd),
            other => warn!("mtspr to unmodeled SPR {other}; dropped"),
        },
        Op::Mfcr => {
            gpr!(inst.rd) = state.cr as u64;
        }
        Op::Mtcrf => {
            let src = gpr!(inst.rd) as u32;
            let mut mask = 0u32;
            for field in 0..8u8 {
                if inst.fm & (0x80 >> field) != 0 {
                    mask |= 0xF << cr_field_shift(field);
                }
            }
            state.cr = (state.cr & !mask) | (src & mask);
        }
        Op::Mcrf => {
            let nibble = ppu::cr_field(state.cr, inst.bfa);
            set_cr_field(state, inst.bf, nibble);
        }
        Op::Crand
        | Op::Cror
        | Op::Crxor
        | Op::Crnand
        | Op::Crnor
        | Op::Creqv
        | Op::Crandc
        | Op::Crorc => {
            let a = ppu::cr_bit(state.cr, inst.ra);
            let b = ppu::cr_bit(state.cr, inst.rb);
            let bit = match inst.op {
                Op::Crand => a & b,
                Op::Cror => a | b,
                Op::Crxor => a ^ b,
                Op::Crnand => !(a & b),
                Op::Crnor => !(a | b),
                Op::Creqv => !(a ^ b),
                Op::Crandc => a & !b,
                _ => a | !b,
            };
            state.cr = ppu::cr_set_bit(state.cr, inst.rd, bit);
        }
        Op::B => {
            if inst.lk {
                state.lr = (inst.pc as u64).wrapping_add(4);
            }
            next_pc = if inst.aa {
                inst.li as u32 as u64
            } else {
                inst.pc.wrapping_add(inst.li as u32) as u64
            };
        }
        Op::Bc | Op::Bclr | Op::Bcctr => {
            let target = match inst.op {
                Op::Bc => {
                    if inst.aa {
                        inst.bd as i64 as u64 & 0xFFFF_FFFF
                    } else {
                        inst.pc.wrapping_add(inst.bd as i32 as u32) as u64
                    }
                }
                Op::Bclr => state.lr & !3,
                _ => state.ctr & !3,
            };
            if inst.lk {
                state.lr = (inst.pc as u64).wrapping_add(4);
            }
            let ctr_ok = if inst.bo & 0b00100 != 0 {
                true
            } else {
                state.ctr = state.ctr.wrapping_sub(1);
                let zero = state.ctr == 0;
                zero == (inst.bo & 0b00010 != 0)
            };
            let cond_ok = if inst.bo & 0b10000 != 0 {
                true
            } else {
                ppu::cr_bit(state.cr, inst.bi) == (inst.bo & 0b01000 != 0)
            };
            if ctr_ok && cond_ok {
                next_pc = target;
            }
        }
        Op::Sc => result = StepResult::Syscall,
        Op::Rfid => result = StepResult::ReturnFromInterrupt,
        Op::Sync | Op::Lwsync | Op::Eieio => {
            std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        }
        Op::Isync | Op::Dcbf | Op::Dcbst | Op::Dcbt | Op::Dcbtst | Op::Icbi => {}
        Op::Dcbz => {
            let ea = ea_mask(reg_or_zero(state, inst.ra).wrapping_add(gpr!(inst.rb))) & !127;
            if window.copy_from_host(ea, &[0u8; 128]).is_err() {
                result = StepResult::Fault { guest_addr: ea };
            }
        }

        // Loads.
        Op::Lbz | Op::Lbzu | Op::Lbzx | Op::Lhz | Op::Lhzu | Op::Lhzx | Op::Lha | Op::Lhau
        | Op::Lhax | Op::Lwz | Op::Lwzu | Op::Lwzx | Op::Lwa | Op::Lwax | Op::Ld | Op::Ldu
        | Op::Ldx | Op::Lwarx | Op::Ldarx | Op::Lhbrx | Op::Lwbrx => {
            let ea = effective_address(state, inst);
            match load_value(window, inst.op, ea) {
                Some(value) => {
                    gpr!(inst.rd) = value;
                    if inst.writes_back_base() {
                        gpr!(inst.ra) = ea;
                    }
                }
                None => result = StepResult::Fault { guest_addr: ea },
            }
        }

        // Stores.
        Op::Stb | Op::Stbu | Op::Stbx | Op::Sth | Op::Sthu | Op::Sthx | Op::Stw | Op::Stwu
        | Op::Stwx | Op::Std | Op::Stdu | Op::Stdx | Op::Sthbrx | Op::Stwbrx | Op::Stwcx
        | Op::Stdcx => {
            let ea = effective_address(state, inst);
            let value = gpr!(inst.rd);
            let stored = match inst.op {
                Op::Stb | Op::Stbu | Op::Stbx => {
                    window.copy_from_host(ea, &[value as u8]).is_ok()
                }
                Op::Sth | Op::Sthu | Op::Sthx => window
                    .copy_from_host(ea, &(value as u16).to_be_bytes())
                    .is_ok(),
                Op::Sthbrx => window
                    .copy_from_host(ea, &(value as u16).to_le_bytes())
                    .is_ok(),
                Op::Stw | Op::Stwu | Op::Stwx | Op::Stwcx => window
                    .copy_from_host(ea, &(value as u32).to_be_bytes())
                    .is_ok(),
                Op::Stwbrx => window
                    .copy_from_host(ea, &(value as u32).to_le_bytes())
                    .is_ok(),
                _ => window.copy_from_host(ea, &value.to_be_bytes()).is_ok(),
            };
            if stored {
                if inst.writes_back_base() {
                    gpr!(inst.ra) = ea;
                }
                if matches!(inst.op, Op::Stwcx | Op::Stdcx) {
                    // The reservation always succeeds; EQ plus carried SO.
                    let so = (state.xer & ppu::XER_SO != 0) as u32;
                    set_cr_field(state, 0, 0b0010 | so);
                }
            } else {
                result = StepResult::Fault { guest_addr: ea };
            }
        }

        // FP loads and stores.
        Op::Lfs | Op::Lfsx => {
            let ea = effective_address(state, inst);
            let mut raw = [0u8; 4];
            if window.copy_to_host(ea, &mut raw).is_ok() {
                state.fpr[inst.rd as usize] = f32::from_be_bytes(raw) as f64;
            } else {
                result = StepResult::Fault { guest_addr: ea };
            }
        }
        Op::Lfd | Op::Lfdx => {
            let ea = effective_address(state, inst);
            let mut raw = [0u8; 8];
            if window.copy_to_host(ea, &mut raw).is_ok() {
                state.fpr[inst.rd as usize] = f64::from_be_bytes(raw);
            } else {
                result = StepResult::Fault { guest_addr: ea };
            }
        }
        Op::Stfs | Op::Stfsx => {
            let ea = effective_address(state, inst);
            let raw = (state.fpr[inst.rd as usize] as f32).to_be_bytes();
            if window.copy_from_host(ea, &raw).is_err() {
                result = StepResult::Fault { guest_addr: ea };
            }
        }
        Op::Stfd | Op::Stfdx => {
            let ea = effective_address(state, inst);
            let raw = state.fpr[inst.rd as usize].to_be_bytes();
            if window.copy_from_host(ea, &raw).is_err() {
                result = StepResult::Fault { guest_addr: ea };
            }
        }

        // FP arithmetic.
        Op::Fadd | Op::Fsub | Op::Fdiv | Op::Fadds | Op::Fsubs | Op::Fdivs => {
            let a = state.fpr[inst.ra as usize];
            let b = state.fpr[inst.rb as usize];
            let mut value = match inst.op {
                Op::Fadd | Op::Fadds => a + b,
                Op::Fsub | Op::Fsubs => a - b,
                _ => a / b,
            };
            if matches!(inst.op, Op::Fadds | Op::Fsubs | Op::Fdivs) {
                value = value as f32 as f64;
            }
            state.fpr[inst.rd as usize] = value;
        }
        Op::Fmul | Op::Fmuls => {
            let value = state.fpr[inst.ra as usize] * state.fpr[inst.rc_reg as usize];
            state.fpr[inst.rd as usize] = if inst.op == Op::Fmuls {
                value as f32 as f64
            } else {
                value
            };
        }
        Op::Fmadd | Op::Fmadds | Op::Fmsub | Op::Fmsubs => {
            let a = state.fpr[inst.ra as usize];
            let c = state.fpr[inst.rc_reg as usize];
            let b = state.fpr[inst.rb as usize];
            let mut value = if matches!(inst.op, Op::Fmadd | Op::Fmadds) {
                a.mul_add(c, b)
            } else {
                a.mul_add(c, -b)
            };
            if matches!(inst.op, Op::Fmadds | Op::Fmsubs) {
                value = value as f32 as f64;
            }
            state.fpr[inst.rd as usize] = value;
        }
        Op::Fmr => state.fpr[inst.rd as usize] = state.fpr[inst.rb as usize],
        Op::Fneg => state.fpr[inst.rd as usize] = -state.fpr[inst.rb as usize],
        Op::Fabs => state.fpr[inst.rd as usize] = state.fpr[inst.rb as usize].abs(),
        Op::Frsp => {
            state.fpr[inst.rd as usize] = state.fpr[inst.rb as usize] as f32 as f64;
        }
        Op::Fcmpu => {
            let a = state.fpr[inst.ra as usize];
            let b = state.fpr[inst.rb as usize];
            let nibble = if a.is_nan() || b.is_nan() {
                0b0001
            } else if a < b {
                0b1000
            } else if a > b {
                0b0100
            } else {
                0b0010
            };
            set_cr_field(state, inst.bf, nibble);
        }
        Op::Fctiwz => {
            let value = state.fpr[inst.rb as usize];
            // Saturating truncation, the host fcvtzs behavior.
            let int = if value.is_nan() {
                0
            } else {
                value.trunc().clamp(i32::MIN as f64, i32::MAX as f64) as i32
            };
            state.fpr[inst.rd as usize] = f64::from_bits(int as u32 as u64);
        }
        Op::Fcfid => {
            let bits = state.fpr[inst.rb as usize].to_bits() as i64;
            state.fpr[inst.rd as usize] = bits as f64;
        }
        Op::Mffs => {
            state.fpr[inst.rd as usize] = f64::from_bits(state.fpscr as u64);
        }
        Op::Mtfsf => {
            let src = state.fpr[inst.rb as usize].to_bits() as u32;
            let mut mask = 0u32;
            for field in 0..8u8 {
                if inst.fm & (0x80 >> field) != 0 {
                    mask |= 0xF << cr_field_shift(field);
                }
            }
            if inst.fm == 0xFF {
                mask = u32::MAX;
            }
            state.fpscr = (state.fpscr & !mask) | (src & mask);
        }

        // Vector.
        Op::Lvx => {
            let ea = ea_mask(reg_or_zero(state, inst.ra).wrapping_add(gpr!(inst.rb))) & !15;
            let mut raw = [0u8; 16];
            if window.copy_to_host(ea, &mut raw).is_ok() {
                raw.reverse();
                state.vr[inst.rd as usize].0 = raw;
            } else {
                result = StepResult::Fault { guest_addr: ea };
            }
        }
        Op::Stvx => {
            let ea = ea_mask(reg_or_zero(state, inst.ra).wrapping_add(gpr!(inst.rb))) & !15;
            let mut raw = state.vr[inst.rd as usize].0;
            raw.reverse();
            if window.copy_from_host(ea, &raw).is_err() {
                result = StepResult::Fault { guest_addr: ea };
            }
        }
        Op::Vand | Op::Vor | Op::Vxor => {
            let a = state.vr[inst.ra as usize].0;
            let b = state.vr[inst.rb as usize].0;
            let mut out = [0u8; 16];
            for i in 0..16 {
                out[i] = match inst.op {
                    Op::Vand => a[i] & b[i],
                    Op::Vor => a[i] | b[i],
                    _ => a[i] ^ b[i],
                };
            }
            state.vr[inst.rd as usize].0 = out;
        }
        Op::Vadduwm | Op::Vsubuwm | Op::Vaddfp | Op::Vsubfp => {
            let a = state.vr[inst.ra as usize].0;
            let b = state.vr[inst.rb as usize].0;
            let mut out = [0u8; 16];
            for lane in 0..4 {
                let i = lane * 4;
                let av = u32::from_le_bytes(a[i..i + 4].try_into().unwrap());
                let bv = u32::from_le_bytes(b[i..i + 4].try_into().unwrap());
                let value = match inst.op {
                    Op::Vadduwm => av.wrapping_add(bv),
                    Op::Vsubuwm => av.wrapping_sub(bv),
                    Op::Vaddfp => (f32::from_bits(av) + f32::from_bits(bv)).to_bits(),
                    _ => (f32::from_bits(av) - f32::from_bits(bv)).to_bits(),
                };
                out[i..i + 4].copy_from_slice(&value.to_le_bytes());
            }
            state.vr[inst.rd as usize].0 = out;
        }
        Op::Vmaddfp => {
            let a = state.vr[inst.ra as usize].0;
            let c = state.vr[inst.rc_reg as usize].0;
            let b = state.vr[inst.rb as usize].0;
            let mut out = [0u8; 16];
            for lane in 0..4 {
                let i = lane * 4;
                let av = f32::from_bits(u32::from_le_bytes(a[i..i + 4].try_into().unwrap()));
                let cv = f32::from_bits(u32::from_le_bytes(c[i..i + 4].try_into().unwrap()));
                let bv = f32::from_bits(u32::from_le_bytes(b[i..i + 4].try_into().unwrap()));
                out[i..i + 4].copy_from_slice(&av.mul_add(cv, bv).to_bits().to_le_bytes());
            }
            state.vr[inst.rd as usize].0 = out;
        }

        Op::Unknown => {
            warn!(
                "interpreting unknown encoding {:#010x} at {:#x} as a no-op",
                inst.raw, inst.pc
            );
        }
    }

    // A faulting access leaves the PC on the faulting instruction.
    if !matches!(result, StepResult::Fault { .. }) {
        state.pc = next_pc;
    }
    result
}

/// D-form and X-form effective address, masked to the guest's 32-bit
/// physical space exactly like the translated path.
fn effective_address(state: &PpuState, inst: &Inst) -> u64 {
    let indexed = matches!(
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
    );
    let base = reg_or_zero(state, inst.ra);
    let offset = if indexed {
        state.gpr[inst.rb as usize]
    } else {
        inst.simm as i64 as u64
    };
    ea_mask(base.wrapping_add(offset))
}

fn load_value(window: &MemoryWindow, op: Op, ea: u64) -> Option<u64> {
    Some(match op {
        Op::Lbz | Op::Lbzu | Op::Lbzx => {
            let mut raw = [0u8; 1];
            window.copy_to_host(ea, &mut raw).ok()?;
            raw[0] as u64
        }
        Op::Lhz | Op::Lhzu | Op::Lhzx => {
            let mut raw = [0u8; 2];
            window.copy_to_host(ea, &mut raw).ok()?;
            u16::from_be_bytes(raw) as u64
        }
        Op::Lha | Op::Lhau | Op::Lhax => {
            let mut raw = [0u8; 2];
            window.copy_to_host(ea, &mut raw).ok()?;
            i16::from_be_bytes(raw) as i64 as u64
        }
        Op::Lhbrx => {
            let mut raw = [0u8; 2];
            window.copy_to_host(ea, &mut raw).ok()?;
            u16::from_le_bytes(raw) as u64
        }
        Op::Lwz | Op::Lwzu | Op::Lwzx | Op::Lwarx => {
            let mut raw = [0u8; 4];
            window.copy_to_host(ea, &mut raw).ok()?;
            u32::from_be_bytes(raw) as u64
        }
        Op::Lwa | Op::Lwax => {
            let mut raw = [0u8; 4];
            window.copy_to_host(ea, &mut raw).ok()?;
            i32::from_be_bytes(raw) as i64 as u64
        }
        Op::Lwbrx => {
            let mut raw = [0u8; 4];
            window.copy_to_host(ea, &mut raw).ok()?;
            u32::from_le_bytes(raw) as u64
        }
        _ => {
            let mut raw = [0u8; 8];
            window.copy_to_host(ea, &mut raw).ok()?;
            u64::from_be_bytes(raw)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::WindowConfig;

    fn harness() -> (PpuState, MemoryWindow) {
        let window = MemoryWindow::new(WindowConfig {
            candidate_sizes: vec![16 * 1024 * 1024],
            mlock_bytes: 0,
        })
        .unwrap();
        (PpuState::new(), window)
    }

    fn run_one(state: &mut PpuState, window: &MemoryWindow, word: u32) -> StepResult {
        window.write_u32_be(state.pc as u32, word).unwrap();
        step(state, window)
    }

    #[test]
    fn addi_then_branch_to_lr() {
        // addi r1, r1, 16 at 0x10000 with r1 = 0x100, then blr with
        // lr = 0x10100.
        let (mut state, window) = harness();
        state.pc = 0x1_0000;
        state.gpr[1] = 0x100;
        state.lr = 0x1_0100;
        assert_eq!(
            run_one(&mut state, &window, 0x3821_0010),
            StepResult::Continue
        );
        assert_eq!(state.gpr[1], 0x110);
        assert_eq!(state.pc, 0x1_0004);
        assert_eq!(state.cr, 0);
        assert_eq!(
            run_one(&mut state, &window, 0x4E80_0020),
            StepResult::Continue
        );
        assert_eq!(state.pc, 0x1_0100);
    }

    #[test]
    fn lwz_byte_swaps() {
        let (mut state, window) = harness();
        window
            .copy_from_host(0x1000, &[0xDE, 0xAD, 0xBE, 0xEF])
            .unwrap();
        state.pc = 0x2_0000;
        // lwz r3, 0x1000(r0)
        run_one(&mut state, &window, 0x8060_1000);
        assert_eq!(state.gpr[3], 0xDEAD_BEEF);
    }

    #[test]
    fn immediates_at_the_extremes() {
        let (mut state, window) = harness();
        state.pc = 0;
        // li r3, -32768
        run_one(&mut state, &window, 0x3860_8000);
        assert_eq!(state.gpr[3], 0xFFFF_FFFF_FFFF_8000);
        // li r4, 32767
        run_one(&mut state, &window, 0x3880_7FFF);
        assert_eq!(state.gpr[4], 0x7FFF);
    }

    #[test]
    fn record_bit_sets_cr0() {
        let (mut state, window) = harness();
        state.pc = 0;
        state.gpr[4] = 5;
        state.gpr[5] = 3;
        // subf. r3, r5, r4 -> 2, GT
        let raw = 0x7C00_0051 | (3 << 21) | (5 << 16) | (4 << 11);
        run_one(&mut state, &window, raw);
        assert_eq!(state.gpr[3], 2);
        assert_eq!(ppu::cr_field(state.cr, 0), 0b0100);
        // subf. r3, r4, r5 -> -2, LT
        state.pc = 0;
        let raw = 0x7C00_0051 | (3 << 21) | (4 << 16) | (5 << 11);
        run_one(&mut state, &window, raw);
        assert_eq!(ppu::cr_field(state.cr, 0), 0b1000);
    }

    #[test]
    fn rotate_and_mask_is_bit_exact() {
        let (mut state, window) = harness();
        state.pc = 0;
        state.gpr[3] = 0x1234_5678;
        // rlwinm r4, r3, 8, 16, 23 -> rotl(0x12345678, 8) = 0x34567812,
        // masked to bits 16..23 = 0x7800.
        let raw = (21u32 << 26) | (3 << 21) | (4 << 16) | (8 << 11) | (16 << 6) | (23 << 1);
        run_one(&mut state, &window, raw);
        assert_eq!(state.gpr[4], 0x7800);
        // Wrapped mask: rlwinm r4, r3, 0, 30, 1 keeps the outer bits.
        state.pc = 0;
        state.gpr[3] = 0xFFFF_FFFF;
        let raw = (21u32 << 26) | (3 << 21) | (4 << 16) | (30 << 6) | (1 << 1);
        run_one(&mut state, &window, raw);
        assert_eq!(state.gpr[4], 0xC000_0003);
    }

    #[test]
    fn srawi_carry() {
        let (mut state, window) = harness();
        state.pc = 0;
        // -5 >> 1 loses a one bit: CA set.
        state.gpr[3] = (-5i64) as u64;
        let raw = (31u32 << 26) | (3 << 21) | (4 << 16) | (1 << 11) | (824 << 1);
        run_one(&mut state, &window, raw);
        assert_eq!(state.gpr[4] as i64, -3);
        assert_ne!(state.xer & ppu::XER_CA, 0);
        // Positive source never sets CA.
        state.pc = 0;
        state.gpr[3] = 5;
        run_one(&mut state, &window, raw);
        assert_eq!(state.xer & ppu::XER_CA, 0);
    }

    #[test]
    fn conditional_branch_decrements_ctr() {
        let (mut state, window) = harness();
        // bdnz .-8 at 0x100: taken while ctr != 0 after decrement.
        state.pc = 0x100;
        state.ctr = 2;
        let raw = (16u32 << 26) | (16 << 21) | (0xFFF8 & 0xFFFC);
        run_one(&mut state, &window, raw);
        assert_eq!(state.ctr, 1);
        assert_eq!(state.pc, 0xF8);
        state.pc = 0x100;
        run_one(&mut state, &window, raw);
        assert_eq!(state.ctr, 0);
        assert_eq!(state.pc, 0x104);
    }

    #[test]
    fn beq_follows_cr0() {
        let (mut state, window) = harness();
        state.pc = 0x200;
        state.gpr[3] = 7;
        // cmpwi r3, 7 -> EQ
        run_one(&mut state, &window, (11u32 << 26) | (3 << 16) | 7);
        assert_eq!(ppu::cr_field(state.cr, 0), 0b0010);
        // beq .+0x10
        let raw = (16u32 << 26) | (12 << 21) | (2 << 16) | 0x10;
        run_one(&mut state, &window, raw);
        assert_eq!(state.pc, 0x204 + 0x10);
    }

    #[test]
    fn unsigned_compare_uses_magnitude() {
        let (mut state, window) = harness();
        state.pc = 0;
        state.gpr[3] = 0xFFFF_FFFF;
        state.gpr[4] = 1;
        // cmplw cr1, r3, r4 -> GT (unsigned)
        let raw = (31u32 << 26) | (1 << 23) | (3 << 16) | (4 << 11) | (32 << 1);
        run_one(&mut state, &window, raw);
        assert_eq!(ppu::cr_field(state.cr, 1), 0b0100);
        // cmpw cr1, r3, r4 -> LT (signed, r3 is -1)
        state.pc = 0;
        let raw = (31u32 << 26) | (1 << 23) | (3 << 16) | (4 << 11);
        run_one(&mut state, &window, raw);
        assert_eq!(ppu::cr_field(state.cr, 1), 0b1000);
    }

    #[test]
    fn load_store_round_trip_all_widths() {
        let (mut state, window) = harness();
        state.gpr[5] = 0x1122_3344_5566_7788;
        state.gpr[1] = 0x4000;
        for (st, ld, expect) in [
            (0x9801_0000u32, 0x8801_0000u32, 0x88u64), // stb/lbz
            (0xB001_0000, 0xA001_0000, 0x7788),        // sth/lhz
            (0x9001_0000, 0x8001_0000, 0x5566_7788),   // stw/lwz
        ] {
            state.pc = 0;
            run_one(&mut state, &window, st | (5 << 21));
            state.pc = 0;
            run_one(&mut state, &window, ld | (3 << 21));
            assert_eq!(state.gpr[3], expect);
        }
        // std/ld
        state.pc = 0;
        let raw = (62u32 << 26) | (5 << 21) | (1 << 16);
        run_one(&mut state, &window, raw);
        state.pc = 0;
        let raw = (58u32 << 26) | (3 << 21) | (1 << 16);
        run_one(&mut state, &window, raw);
        assert_eq!(state.gpr[3], 0x1122_3344_5566_7788);
    }

    #[test]
    fn update_form_writes_back_the_address() {
        let (mut state, window) = harness();
        state.pc = 0;
        state.gpr[1] = 0x5000;
        state.gpr[5] = 0xAB;
        // stbu r5, -16(r1)
        let raw = (39u32 << 26) | (5 << 21) | (1 << 16) | (0xFFF0);
        run_one(&mut state, &window, raw);
        assert_eq!(state.gpr[1], 0x4FF0);
        let mut b = [0u8; 1];
        window.copy_to_host(0x4FF0, &mut b).unwrap();
        assert_eq!(b[0], 0xAB);
    }

    #[test]
    fn out_of_window_access_faults() {
        let (mut state, window) = harness();
        state.pc = 0;
        state.gpr[1] = window.size() as u64 - 2;
        // lwz r3, 0(r1)
        let raw = (32u32 << 26) | (3 << 21) | (1 << 16);
        let result = run_one(&mut state, &window, raw);
        assert!(matches!(result, StepResult::Fault { .. }));
    }

    #[test]
    fn float_single_rounds_through_f32() {
        let (mut state, window) = harness();
        state.pc = 0;
        state.fpr[1] = 1.0e-10;
        state.fpr[2] = 1.0;
        // fadds f3, f1, f2
        let raw = (59u32 << 26) | (3 << 21) | (1 << 16) | (2 << 11) | (21 << 1);
        run_one(&mut state, &window, raw);
        assert_eq!(state.fpr[3], (1.0e-10f64 + 1.0) as f32 as f64);
    }

    #[test]
    fn vector_add_word_modulo() {
        let (mut state, window) = harness();
        state.pc = 0;
        for lane in 0..4 {
            let i = lane * 4;
            state.vr[2].0[i..i + 4].copy_from_slice(&(u32::MAX).to_le_bytes());
            state.vr[3].0[i..i + 4].copy_from_slice(&2u32.to_le_bytes());
        }
        // vadduwm v1, v2, v3
        let raw = (4u32 << 26) | (1 << 21) | (2 << 16) | (3 << 11) | 128;
        run_one(&mut state, &window, raw);
        for lane in 0..4 {
            let i = lane * 4;
            let v = u32::from_le_bytes(state.vr[1].0[i..i + 4].try_into().unwrap());
            assert_eq!(v, 1);
        }
    }

    #[test]
    fn lvx_reverses_guest_bytes() {
        let (mut state, window) = harness();
        state.pc = 0;
        let guest: Vec<u8> = (0u8..16).collect();
        window.copy_from_host(0x6000, &guest).unwrap();
        state.gpr[4] = 0x6000;
        // lvx v1, r0, r4
        let raw = (31u32 << 26) | (1 << 21) | (4 << 11) | (103 << 1);
        run_one(&mut state, &window, raw);
        let expect: Vec<u8> = (0u8..16).rev().collect();
        assert_eq!(&state.vr[1].0[..], &expect[..]);
        // stvx writes the original order back.
        state.pc = 0;
        state.gpr[5] = 0x7000;
        let raw = (31u32 << 26) | (1 << 21) | (5 << 11) | (231 << 1);
        run_one(&mut state, &window, raw);
        let mut back = [0u8; 16];
        window.copy_to_host(0x7000, &mut back).unwrap();
        assert_eq!(&back[..], &guest[..]);
    }

    #[test]
    fn syscall_surfaces_to_the_caller() {
        let (mut state, window) = harness();
        state.pc = 0x300;
        assert_eq!(
            run_one(&mut state, &window, 0x4400_0002),
            StepResult::Syscall
        );
        assert_eq!(state.pc, 0x304);
    }
}
