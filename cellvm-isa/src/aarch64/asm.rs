use super::{Cond, Reg, VReg};

/// Append-only AArch64 instruction encoder.
///
/// Every method pushes exactly the words for one operation; nothing is
/// buffered or reordered. Offsets are in bytes and asserted against the
/// encodable range of the form in use.
#[derive(Debug, Default)]
pub struct Assembler {
    buf: Vec<u32>,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler { buf: Vec::new() }
    }

    pub fn with_capacity(words: usize) -> Self {
        Assembler {
            buf: Vec::with_capacity(words),
        }
    }

    #[inline]
    pub fn emit(&mut self, word: u32) {
        self.buf.push(word);
    }

    /// Number of words emitted so far; doubles as the index of the next
    /// instruction for later patching.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn len_bytes(&self) -> usize {
        self.buf.len() * 4
    }

    #[inline]
    pub fn code(&self) -> &[u32] {
        &self.buf
    }

    pub fn into_words(self) -> Vec<u32> {
        self.buf
    }

    /// Replaces a previously emitted word, for resolving forward branches.
    pub fn patch(&mut self, index: usize, word: u32) {
        self.buf[index] = word;
    }

    // ---- moves ----

    /// `mov xd, xm`
    pub fn mov(&mut self, rd: Reg, rm: Reg) {
        self.emit(0xAA00_03E0 | rm.bits() << 16 | rd.bits());
    }

    /// `mov wd, wm` — also the canonical 32-bit zero-extend.
    pub fn mov_w(&mut self, rd: Reg, rm: Reg) {
        self.emit(0x2A00_03E0 | rm.bits() << 16 | rd.bits());
    }

    pub fn movz(&mut self, rd: Reg, imm16: u16, hw: u32) {
        debug_assert!(hw < 4);
        self.emit(0xD280_0000 | hw << 21 | (imm16 as u32) << 5 | rd.bits());
    }

    pub fn movk(&mut self, rd: Reg, imm16: u16, hw: u32) {
        debug_assert!(hw < 4);
        self.emit(0xF280_0000 | hw << 21 | (imm16 as u32) << 5 | rd.bits());
    }

    pub fn movn(&mut self, rd: Reg, imm16: u16, hw: u32) {
        debug_assert!(hw < 4);
        self.emit(0x9280_0000 | hw << 21 | (imm16 as u32) << 5 | rd.bits());
    }

    /// Materializes an arbitrary 64-bit constant with MOVZ plus up to three
    /// MOVKs, skipping all-zero halfwords.
    pub fn mov_imm64(&mut self, rd: Reg, value: u64) {
        let mut started = false;
        for hw in 0..4 {
            let chunk = ((value >> (16 * hw)) & 0xFFFF) as u16;
            if chunk == 0 {
                continue;
            }
            if started {
                self.movk(rd, chunk, hw);
            } else {
                self.movz(rd, chunk, hw);
                started = true;
            }
        }
        if !started {
            self.movz(rd, 0, 0);
        }
    }

    // ---- arithmetic ----

    pub fn add(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x8B00_0000 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn adds(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0xAB00_0000 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn sub(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0xCB00_0000 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn subs(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0xEB00_0000 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn add_w(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x0B00_0000 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn sub_w(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x4B00_0000 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn add_imm(&mut self, rd: Reg, rn: Reg, imm12: u32) {
        debug_assert!(imm12 < 4096);
        self.emit(0x9100_0000 | imm12 << 10 | rn.bits() << 5 | rd.bits());
    }

    pub fn sub_imm(&mut self, rd: Reg, rn: Reg, imm12: u32) {
        debug_assert!(imm12 < 4096);
        self.emit(0xD100_0000 | imm12 << 10 | rn.bits() << 5 | rd.bits());
    }

    /// `neg xd, xm`
    pub fn neg(&mut self, rd: Reg, rm: Reg) {
        self.emit(0xCB00_03E0 | rm.bits() << 16 | rd.bits());
    }

    pub fn mul(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x9B00_7C00 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn smulh(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x9B40_7C00 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn umulh(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x9BC0_7C00 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn sdiv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x9AC0_0C00 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn udiv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x9AC0_0800 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn sdiv_w(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x1AC0_0C00 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn udiv_w(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x1AC0_0800 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    // ---- compares ----

    /// `cmp xn, xm`
    pub fn cmp(&mut self, rn: Reg, rm: Reg) {
        self.emit(0xEB00_001F | rm.bits() << 16 | rn.bits() << 5);
    }

    /// `cmp wn, wm`
    pub fn cmp_w(&mut self, rn: Reg, rm: Reg) {
        self.emit(0x6B00_001F | rm.bits() << 16 | rn.bits() << 5);
    }

    pub fn cmp_imm(&mut self, rn: Reg, imm12: u32) {
        debug_assert!(imm12 < 4096);
        self.emit(0xF100_001F | imm12 << 10 | rn.bits() << 5);
    }

    /// `tst xn, xm`
    pub fn tst(&mut self, rn: Reg, rm: Reg) {
        self.emit(0xEA00_001F | rm.bits() << 16 | rn.bits() << 5);
    }

    // ---- logic ----

    pub fn and(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x8A00_0000 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn ands(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0xEA00_0000 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn orr(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0xAA00_0000 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn eor(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0xCA00_0000 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn bic(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x8A20_0000 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn orn(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0xAA20_0000 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn eon(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0xCA20_0000 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    /// `mvn xd, xm`
    pub fn mvn(&mut self, rd: Reg, rm: Reg) {
        self.emit(0xAA20_03E0 | rm.bits() << 16 | rd.bits());
    }

    pub fn and_w(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x0A00_0000 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn orr_w(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x2A00_0000 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    // ---- shifts and bitfields ----

    pub fn lslv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x9AC0_2000 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn lsrv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x9AC0_2400 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn asrv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x9AC0_2800 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn rorv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x9AC0_2C00 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn rorv_w(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x1AC0_2C00 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn lsl_imm(&mut self, rd: Reg, rn: Reg, shift: u32) {
        debug_assert!(shift < 64);
        let immr = (64 - shift) & 63;
        let imms = 63 - shift;
        self.emit(0xD340_0000 | immr << 16 | imms << 10 | rn.bits() << 5 | rd.bits());
    }

    pub fn lsr_imm(&mut self, rd: Reg, rn: Reg, shift: u32) {
        debug_assert!(shift < 64);
        self.emit(0xD340_FC00 | shift << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn asr_imm(&mut self, rd: Reg, rn: Reg, shift: u32) {
        debug_assert!(shift < 64);
        self.emit(0x9340_FC00 | shift << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn lsr_w_imm(&mut self, rd: Reg, rn: Reg, shift: u32) {
        debug_assert!(shift < 32);
        self.emit(0x5300_7C00 | shift << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn asr_w_imm(&mut self, rd: Reg, rn: Reg, shift: u32) {
        debug_assert!(shift < 32);
        self.emit(0x1300_7C00 | shift << 16 | rn.bits() << 5 | rd.bits());
    }

    /// `ror xd, xs, #shift` (EXTR with both sources equal).
    pub fn ror_imm(&mut self, rd: Reg, rs: Reg, shift: u32) {
        debug_assert!(shift < 64);
        self.emit(0x93C0_0000 | rs.bits() << 16 | shift << 10 | rs.bits() << 5 | rd.bits());
    }

    /// `ror wd, ws, #shift`
    pub fn ror_w_imm(&mut self, rd: Reg, rs: Reg, shift: u32) {
        debug_assert!(shift < 32);
        self.emit(0x1380_0000 | rs.bits() << 16 | shift << 10 | rs.bits() << 5 | rd.bits());
    }

    /// `ubfx wd, wn, #lsb, #width`
    pub fn ubfx_w(&mut self, rd: Reg, rn: Reg, lsb: u32, width: u32) {
        debug_assert!(lsb < 32 && width >= 1 && lsb + width <= 32);
        self.emit(0x5300_0000 | lsb << 16 | (lsb + width - 1) << 10 | rn.bits() << 5 | rd.bits());
    }

    /// `bfi wd, wn, #lsb, #width`
    pub fn bfi_w(&mut self, rd: Reg, rn: Reg, lsb: u32, width: u32) {
        debug_assert!(lsb < 32 && width >= 1 && lsb + width <= 32);
        let immr = (32 - lsb) & 31;
        self.emit(0x3300_0000 | immr << 16 | (width - 1) << 10 | rn.bits() << 5 | rd.bits());
    }

    // ---- extends and counts ----

    pub fn sxtb(&mut self, rd: Reg, rn: Reg) {
        self.emit(0x9340_1C00 | rn.bits() << 5 | rd.bits());
    }

    pub fn sxth(&mut self, rd: Reg, rn: Reg) {
        self.emit(0x9340_3C00 | rn.bits() << 5 | rd.bits());
    }

    pub fn sxtw(&mut self, rd: Reg, rn: Reg) {
        self.emit(0x9340_7C00 | rn.bits() << 5 | rd.bits());
    }

    pub fn uxtb(&mut self, rd: Reg, rn: Reg) {
        self.emit(0x5300_1C00 | rn.bits() << 5 | rd.bits());
    }

    pub fn uxth(&mut self, rd: Reg, rn: Reg) {
        self.emit(0x5300_3C00 | rn.bits() << 5 | rd.bits());
    }

    pub fn clz(&mut self, rd: Reg, rn: Reg) {
        self.emit(0xDAC0_1000 | rn.bits() << 5 | rd.bits());
    }

    pub fn clz_w(&mut self, rd: Reg, rn: Reg) {
        self.emit(0x5AC0_1000 | rn.bits() << 5 | rd.bits());
    }

    // ---- conditional select ----

    pub fn csel(&mut self, rd: Reg, rn: Reg, rm: Reg, cond: Cond) {
        self.emit(
            0x9A80_0000 | rm.bits() << 16 | (cond as u32) << 12 | rn.bits() << 5 | rd.bits(),
        );
    }

    /// `cset xd, cond`
    pub fn cset(&mut self, rd: Reg, cond: Cond) {
        self.emit(0x9A9F_07E0 | (cond.invert() as u32) << 12 | rd.bits());
    }

    // ---- loads and stores, unsigned scaled immediate ----

    pub fn ldr_imm(&mut self, rt: Reg, rn: Reg, offset: u32) {
        debug_assert!(offset % 8 == 0 && offset / 8 < 4096);
        self.emit(0xF940_0000 | (offset / 8) << 10 | rn.bits() << 5 | rt.bits());
    }

    pub fn str_imm(&mut self, rt: Reg, rn: Reg, offset: u32) {
        debug_assert!(offset % 8 == 0 && offset / 8 < 4096);
        self.emit(0xF900_0000 | (offset / 8) << 10 | rn.bits() << 5 | rt.bits());
    }

    pub fn ldr_w_imm(&mut self, rt: Reg, rn: Reg, offset: u32) {
        debug_assert!(offset % 4 == 0 && offset / 4 < 4096);
        self.emit(0xB940_0000 | (offset / 4) << 10 | rn.bits() << 5 | rt.bits());
    }

    pub fn str_w_imm(&mut self, rt: Reg, rn: Reg, offset: u32) {
        debug_assert!(offset % 4 == 0 && offset / 4 < 4096);
        self.emit(0xB900_0000 | (offset / 4) << 10 | rn.bits() << 5 | rt.bits());
    }

    pub fn ldrh_imm(&mut self, rt: Reg, rn: Reg, offset: u32) {
        debug_assert!(offset % 2 == 0 && offset / 2 < 4096);
        self.emit(0x7940_0000 | (offset / 2) << 10 | rn.bits() << 5 | rt.bits());
    }

    pub fn strh_imm(&mut self, rt: Reg, rn: Reg, offset: u32) {
        debug_assert!(offset % 2 == 0 && offset / 2 < 4096);
        self.emit(0x7900_0000 | (offset / 2) << 10 | rn.bits() << 5 | rt.bits());
    }

    pub fn ldrb_imm(&mut self, rt: Reg, rn: Reg, offset: u32) {
        debug_assert!(offset < 4096);
        self.emit(0x3940_0000 | offset << 10 | rn.bits() << 5 | rt.bits());
    }

    pub fn strb_imm(&mut self, rt: Reg, rn: Reg, offset: u32) {
        debug_assert!(offset < 4096);
        self.emit(0x3900_0000 | offset << 10 | rn.bits() << 5 | rt.bits());
    }

    /// `ldrsw xt, [xn, #offset]`
    pub fn ldrsw_imm(&mut self, rt: Reg, rn: Reg, offset: u32) {
        debug_assert!(offset % 4 == 0 && offset / 4 < 4096);
        self.emit(0xB980_0000 | (offset / 4) << 10 | rn.bits() << 5 | rt.bits());
    }

    // ---- loads and stores, register offset (LSL #0) ----

    pub fn ldr_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit(0xF860_6800 | rm.bits() << 16 | rn.bits() << 5 | rt.bits());
    }

    pub fn str_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit(0xF820_6800 | rm.bits() << 16 | rn.bits() << 5 | rt.bits());
    }

    pub fn ldr_w_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit(0xB860_6800 | rm.bits() << 16 | rn.bits() << 5 | rt.bits());
    }

    pub fn str_w_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit(0xB820_6800 | rm.bits() << 16 | rn.bits() << 5 | rt.bits());
    }

    pub fn ldrh_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit(0x7860_6800 | rm.bits() << 16 | rn.bits() << 5 | rt.bits());
    }

    pub fn strh_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit(0x7820_6800 | rm.bits() << 16 | rn.bits() << 5 | rt.bits());
    }

    pub fn ldrb_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit(0x3860_6800 | rm.bits() << 16 | rn.bits() << 5 | rt.bits());
    }

    pub fn strb_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit(0x3820_6800 | rm.bits() << 16 | rn.bits() << 5 | rt.bits());
    }

    /// `ldrsw xt, [xn, xm]`
    pub fn ldrsw_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit(0xB8A0_6800 | rm.bits() << 16 | rn.bits() << 5 | rt.bits());
    }

    /// `ldrsh xt, [xn, xm]`
    pub fn ldrsh_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit(0x78A0_6800 | rm.bits() << 16 | rn.bits() << 5 | rt.bits());
    }

    /// `ldrsb xt, [xn, xm]`
    pub fn ldrsb_reg(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.emit(0x38A0_6800 | rm.bits() << 16 | rn.bits() << 5 | rt.bits());
    }

    // ---- pairs ----

    /// `stp xt, xt2, [xn, #offset]!`
    pub fn stp_pre(&mut self, rt: Reg, rt2: Reg, rn: Reg, offset: i32) {
        debug_assert!(offset % 8 == 0 && (-512..512).contains(&offset));
        let imm7 = ((offset / 8) & 0x7F) as u32;
        self.emit(0xA980_0000 | imm7 << 15 | rt2.bits() << 10 | rn.bits() << 5 | rt.bits());
    }

    /// `ldp xt, xt2, [xn], #offset`
    pub fn ldp_post(&mut self, rt: Reg, rt2: Reg, rn: Reg, offset: i32) {
        debug_assert!(offset % 8 == 0 && (-512..512).contains(&offset));
        let imm7 = ((offset / 8) & 0x7F) as u32;
        self.emit(0xA8C0_0000 | imm7 << 15 | rt2.bits() << 10 | rn.bits() << 5 | rt.bits());
    }

    /// `stp xt, xt2, [xn, #offset]`
    pub fn stp_off(&mut self, rt: Reg, rt2: Reg, rn: Reg, offset: i32) {
        debug_assert!(offset % 8 == 0 && (-512..512).contains(&offset));
        let imm7 = ((offset / 8) & 0x7F) as u32;
        self.emit(0xA900_0000 | imm7 << 15 | rt2.bits() << 10 | rn.bits() << 5 | rt.bits());
    }

    /// `ldp xt, xt2, [xn, #offset]`
    pub fn ldp_off(&mut self, rt: Reg, rt2: Reg, rn: Reg, offset: i32) {
        debug_assert!(offset % 8 == 0 && (-512..512).contains(&offset));
        let imm7 = ((offset / 8) & 0x7F) as u32;
        self.emit(0xA940_0000 | imm7 << 15 | rt2.bits() << 10 | rn.bits() << 5 | rt.bits());
    }

    // ---- byte reversal ----

    /// `rev xd, xn` — full 64-bit byte reversal.
    pub fn rev(&mut self, rd: Reg, rn: Reg) {
        self.emit(0xDAC0_0C00 | rn.bits() << 5 | rd.bits());
    }

    /// `rev wd, wn` — 32-bit byte reversal, zero-extended.
    pub fn rev_w(&mut self, rd: Reg, rn: Reg) {
        self.emit(0x5AC0_0800 | rn.bits() << 5 | rd.bits());
    }

    /// `rev16 wd, wn` — byte reversal within each halfword.
    pub fn rev16_w(&mut self, rd: Reg, rn: Reg) {
        self.emit(0x5AC0_0400 | rn.bits() << 5 | rd.bits());
    }

    // ---- branches ----

    /// `b .+offset` (bytes, ±128 MiB).
    pub fn b(&mut self, offset: i64) {
        debug_assert!(offset % 4 == 0 && (-(1 << 27)..(1 << 27)).contains(&offset));
        self.emit(0x1400_0000 | ((offset >> 2) as u32 & 0x03FF_FFFF));
    }

    /// `bl .+offset`
    pub fn bl(&mut self, offset: i64) {
        debug_assert!(offset % 4 == 0 && (-(1 << 27)..(1 << 27)).contains(&offset));
        self.emit(0x9400_0000 | ((offset >> 2) as u32 & 0x03FF_FFFF));
    }

    /// `b.cond .+offset` (bytes, ±1 MiB).
    pub fn b_cond(&mut self, cond: Cond, offset: i64) {
        debug_assert!(offset % 4 == 0 && (-(1 << 20)..(1 << 20)).contains(&offset));
        self.emit(0x5400_0000 | ((offset >> 2) as u32 & 0x7FFFF) << 5 | cond as u32);
    }

    pub fn cbz(&mut self, rt: Reg, offset: i64) {
        debug_assert!(offset % 4 == 0 && (-(1 << 20)..(1 << 20)).contains(&offset));
        self.emit(0xB400_0000 | ((offset >> 2) as u32 & 0x7FFFF) << 5 | rt.bits());
    }

    pub fn cbnz(&mut self, rt: Reg, offset: i64) {
        debug_assert!(offset % 4 == 0 && (-(1 << 20)..(1 << 20)).contains(&offset));
        self.emit(0xB500_0000 | ((offset >> 2) as u32 & 0x7FFFF) << 5 | rt.bits());
    }

    pub fn br(&mut self, rn: Reg) {
        self.emit(0xD61F_0000 | rn.bits() << 5);
    }

    pub fn blr(&mut self, rn: Reg) {
        self.emit(0xD63F_0000 | rn.bits() << 5);
    }

    pub fn ret(&mut self) {
        self.emit(0xD65F_03C0);
    }

    // ---- system ----

    pub fn nop(&mut self) {
        self.emit(0xD503_201F);
    }

    pub fn brk(&mut self, imm16: u16) {
        self.emit(0xD420_0000 | (imm16 as u32) << 5);
    }

    pub fn dmb_ish(&mut self) {
        self.emit(0xD503_3BBF);
    }

    pub fn dsb_ish(&mut self) {
        self.emit(0xD503_3B9F);
    }

    pub fn isb(&mut self) {
        self.emit(0xD503_3FDF);
    }

    /// `mrs xt, fpcr`
    pub fn mrs_fpcr(&mut self, rt: Reg) {
        self.emit(0xD53B_4400 | rt.bits());
    }

    /// `msr fpcr, xt`
    pub fn msr_fpcr(&mut self, rt: Reg) {
        self.emit(0xD51B_4400 | rt.bits());
    }

    // ---- scalar FP ----

    pub fn ldr_d_imm(&mut self, vt: VReg, rn: Reg, offset: u32) {
        debug_assert!(offset % 8 == 0 && offset / 8 < 4096);
        self.emit(0xFD40_0000 | (offset / 8) << 10 | rn.bits() << 5 | vt.bits());
    }

    pub fn str_d_imm(&mut self, vt: VReg, rn: Reg, offset: u32) {
        debug_assert!(offset % 8 == 0 && offset / 8 < 4096);
        self.emit(0xFD00_0000 | (offset / 8) << 10 | rn.bits() << 5 | vt.bits());
    }

    pub fn fadd_d(&mut self, vd: VReg, vn: VReg, vm: VReg) {
        self.emit(0x1E60_2800 | vm.bits() << 16 | vn.bits() << 5 | vd.bits());
    }

    pub fn fsub_d(&mut self, vd: VReg, vn: VReg, vm: VReg) {
        self.emit(0x1E60_3800 | vm.bits() << 16 | vn.bits() << 5 | vd.bits());
    }

    pub fn fmul_d(&mut self, vd: VReg, vn: VReg, vm: VReg) {
        self.emit(0x1E60_0800 | vm.bits() << 16 | vn.bits() << 5 | vd.bits());
    }

    pub fn fdiv_d(&mut self, vd: VReg, vn: VReg, vm: VReg) {
        self.emit(0x1E60_1800 | vm.bits() << 16 | vn.bits() << 5 | vd.bits());
    }

    /// `fmadd dd, dn, dm, da` — dd = da + dn*dm.
    pub fn fmadd_d(&mut self, vd: VReg, vn: VReg, vm: VReg, va: VReg) {
        self.emit(0x1F40_0000 | vm.bits() << 16 | va.bits() << 10 | vn.bits() << 5 | vd.bits());
    }

    /// `fmsub dd, dn, dm, da` — dd = da - dn*dm.
    pub fn fmsub_d(&mut self, vd: VReg, vn: VReg, vm: VReg, va: VReg) {
        self.emit(0x1F40_8000 | vm.bits() << 16 | va.bits() << 10 | vn.bits() << 5 | vd.bits());
    }

    /// `fnmsub dd, dn, dm, da` — dd = dn*dm - da.
    pub fn fnmsub_d(&mut self, vd: VReg, vn: VReg, vm: VReg, va: VReg) {
        self.emit(0x1FC0_8000 | vm.bits() << 16 | va.bits() << 10 | vn.bits() << 5 | vd.bits());
    }

    pub fn fneg_d(&mut self, vd: VReg, vn: VReg) {
        self.emit(0x1E61_4000 | vn.bits() << 5 | vd.bits());
    }

    pub fn fabs_d(&mut self, vd: VReg, vn: VReg) {
        self.emit(0x1E60_C000 | vn.bits() << 5 | vd.bits());
    }

    pub fn fmov_d(&mut self, vd: VReg, vn: VReg) {
        self.emit(0x1E60_4000 | vn.bits() << 5 | vd.bits());
    }

    /// `fcmp dn, dm`
    pub fn fcmp_d(&mut self, vn: VReg, vm: VReg) {
        self.emit(0x1E60_2000 | vm.bits() << 16 | vn.bits() << 5);
    }

    /// `fcvt sd, dn` — double to single.
    pub fn fcvt_sd(&mut self, vd: VReg, vn: VReg) {
        self.emit(0x1E62_4000 | vn.bits() << 5 | vd.bits());
    }

    /// `fcvt dd, sn` — single to double.
    pub fn fcvt_ds(&mut self, vd: VReg, vn: VReg) {
        self.emit(0x1E22_C000 | vn.bits() << 5 | vd.bits());
    }

    /// `scvtf dd, xn`
    pub fn scvtf_d_x(&mut self, vd: VReg, rn: Reg) {
        self.emit(0x9E62_0000 | rn.bits() << 5 | vd.bits());
    }

    /// `fcvtzs wd, dn`
    pub fn fcvtzs_w_d(&mut self, rd: Reg, vn: VReg) {
        self.emit(0x1E78_0000 | vn.bits() << 5 | rd.bits());
    }

    /// `fmov xd, dn`
    pub fn fmov_x_d(&mut self, rd: Reg, vn: VReg) {
        self.emit(0x9E66_0000 | vn.bits() << 5 | rd.bits());
    }

    /// `fmov dd, xn`
    pub fn fmov_d_x(&mut self, vd: VReg, rn: Reg) {
        self.emit(0x9E67_0000 | rn.bits() << 5 | vd.bits());
    }

    /// `fmov wd, sn`
    pub fn fmov_w_s(&mut self, rd: Reg, vn: VReg) {
        self.emit(0x1E26_0000 | vn.bits() << 5 | rd.bits());
    }

    /// `fmov sd, wn`
    pub fn fmov_s_w(&mut self, vd: VReg, rn: Reg) {
        self.emit(0x1E27_0000 | rn.bits() << 5 | vd.bits());
    }

    // ---- NEON ----

    pub fn ldr_q_imm(&mut self, vt: VReg, rn: Reg, offset: u32) {
        debug_assert!(offset % 16 == 0 && offset / 16 < 4096);
        self.emit(0x3DC0_0000 | (offset / 16) << 10 | rn.bits() << 5 | vt.bits());
    }

    pub fn str_q_imm(&mut self, vt: VReg, rn: Reg, offset: u32) {
        debug_assert!(offset % 16 == 0 && offset / 16 < 4096);
        self.emit(0x3D80_0000 | (offset / 16) << 10 | rn.bits() << 5 | vt.bits());
    }

    pub fn ldr_q_reg(&mut self, vt: VReg, rn: Reg, rm: Reg) {
        self.emit(0x3CE0_6800 | rm.bits() << 16 | rn.bits() << 5 | vt.bits());
    }

    pub fn str_q_reg(&mut self, vt: VReg, rn: Reg, rm: Reg) {
        self.emit(0x3CA0_6800 | rm.bits() << 16 | rn.bits() << 5 | vt.bits());
    }

    /// `add vd.4s, vn.4s, vm.4s`
    pub fn add_v4s(&mut self, vd: VReg, vn: VReg, vm: VReg) {
        self.emit(0x4EA0_8400 | vm.bits() << 16 | vn.bits() << 5 | vd.bits());
    }

    /// `sub vd.4s, vn.4s, vm.4s`
    pub fn sub_v4s(&mut self, vd: VReg, vn: VReg, vm: VReg) {
        self.emit(0x6EA0_8400 | vm.bits() << 16 | vn.bits() << 5 | vd.bits());
    }

    pub fn and_v16b(&mut self, vd: VReg, vn: VReg, vm: VReg) {
        self.emit(0x4E20_1C00 | vm.bits() << 16 | vn.bits() << 5 | vd.bits());
    }

    pub fn orr_v16b(&mut self, vd: VReg, vn: VReg, vm: VReg) {
        self.emit(0x4EA0_1C00 | vm.bits() << 16 | vn.bits() << 5 | vd.bits());
    }

    pub fn eor_v16b(&mut self, vd: VReg, vn: VReg, vm: VReg) {
        self.emit(0x6E20_1C00 | vm.bits() << 16 | vn.bits() << 5 | vd.bits());
    }

    pub fn fadd_v4s(&mut self, vd: VReg, vn: VReg, vm: VReg) {
        self.emit(0x4E20_D400 | vm.bits() << 16 | vn.bits() << 5 | vd.bits());
    }

    pub fn fsub_v4s(&mut self, vd: VReg, vn: VReg, vm: VReg) {
        self.emit(0x4EA0_D400 | vm.bits() << 16 | vn.bits() << 5 | vd.bits());
    }

    pub fn fmul_v4s(&mut self, vd: VReg, vn: VReg, vm: VReg) {
        self.emit(0x6E20_DC00 | vm.bits() << 16 | vn.bits() << 5 | vd.bits());
    }

    /// `fmla vd.4s, vn.4s, vm.4s` — vd += vn * vm.
    pub fn fmla_v4s(&mut self, vd: VReg, vn: VReg, vm: VReg) {
        self.emit(0x4E20_CC00 | vm.bits() << 16 | vn.bits() << 5 | vd.bits());
    }

    /// `rev64 vd.16b, vn.16b` — byte reversal within each doubleword.
    pub fn rev64_v16b(&mut self, vd: VReg, vn: VReg) {
        self.emit(0x4E20_0800 | vn.bits() << 5 | vd.bits());
    }

    /// `ext vd.16b, vn.16b, vm.16b, #imm`
    pub fn ext_v16b(&mut self, vd: VReg, vn: VReg, vm: VReg, imm: u32) {
        debug_assert!(imm < 16);
        self.emit(0x6E00_0000 | vm.bits() << 16 | imm << 11 | vn.bits() << 5 | vd.bits());
    }
}

#[cfg(test)]
mod tests {
    use super::super::*;

    fn one(f: impl FnOnce(&mut Assembler)) -> u32 {
        let mut asm = Assembler::new();
        f(&mut asm);
        assert_eq!(asm.len(), 1);
        asm.code()[0]
    }

    // Every expected word below was checked against an independent
    // assembler; a mismatch means the encoder, not the test, is wrong.
    #[test]
    fn moves() {
        assert_eq!(one(|a| a.mov(X0, X1)), 0xAA01_03E0);
        assert_eq!(one(|a| a.movz(X0, 0x1234, 0)), 0xD282_4680);
        assert_eq!(one(|a| a.movk(X0, 0xBEEF, 1)), 0xF2B7_DDE0);
        assert_eq!(one(|a| a.movn(X3, 0, 0)), 0x9280_0003);
    }

    #[test]
    fn mov_imm64_splits_into_halfwords() {
        let mut asm = Assembler::new();
        asm.mov_imm64(X9, 0xDEAD_BEEF);
        assert_eq!(asm.code(), &[0xD297_DDE9, 0xF2BB_D5A9]);
        let mut asm = Assembler::new();
        asm.mov_imm64(X9, 0);
        assert_eq!(asm.code(), &[0xD280_0009]);
        let mut asm = Assembler::new();
        asm.mov_imm64(X9, 0x1_0000_0000);
        assert_eq!(asm.code(), &[0xD2C0_0029]);
    }

    #[test]
    fn arithmetic() {
        assert_eq!(one(|a| a.add(X0, X1, X2)), 0x8B02_0020);
        assert_eq!(one(|a| a.sub(X0, X1, X2)), 0xCB02_0020);
        assert_eq!(one(|a| a.add_imm(X0, X1, 16)), 0x9100_4020);
        assert_eq!(one(|a| a.sub_imm(X0, X1, 16)), 0xD100_4020);
        assert_eq!(one(|a| a.mul(X0, X1, X2)), 0x9B02_7C20);
        assert_eq!(one(|a| a.sdiv(X0, X1, X2)), 0x9AC2_0C20);
        assert_eq!(one(|a| a.udiv(X0, X1, X2)), 0x9AC2_0820);
        assert_eq!(one(|a| a.neg(X0, X1)), 0xCB01_03E0);
        assert_eq!(one(|a| a.smulh(X0, X1, X2)), 0x9B42_7C20);
        assert_eq!(one(|a| a.umulh(X0, X1, X2)), 0x9BC2_7C20);
    }

    #[test]
    fn logic_and_shifts() {
        assert_eq!(one(|a| a.and(X0, X1, X2)), 0x8A02_0020);
        assert_eq!(one(|a| a.orr(X0, X1, X2)), 0xAA02_0020);
        assert_eq!(one(|a| a.eor(X0, X1, X2)), 0xCA02_0020);
        assert_eq!(one(|a| a.mvn(X0, X1)), 0xAA21_03E0);
        assert_eq!(one(|a| a.lslv(X0, X1, X2)), 0x9AC2_2020);
        assert_eq!(one(|a| a.lsrv(X0, X1, X2)), 0x9AC2_2420);
        assert_eq!(one(|a| a.asrv(X0, X1, X2)), 0x9AC2_2820);
        assert_eq!(one(|a| a.lsl_imm(X0, X1, 4)), 0xD37C_EC20);
        assert_eq!(one(|a| a.lsr_imm(X0, X1, 4)), 0xD344_FC20);
        assert_eq!(one(|a| a.asr_imm(X0, X1, 4)), 0x9344_FC20);
        assert_eq!(one(|a| a.clz(X0, X1)), 0xDAC0_1020);
        assert_eq!(one(|a| a.sxtw(X0, X1)), 0x9340_7C20);
        assert_eq!(one(|a| a.sxth(X0, X1)), 0x9340_3C20);
        assert_eq!(one(|a| a.bfi_w(X0, X1, 4, 4)), 0x331C_0C20);
        assert_eq!(one(|a| a.ubfx_w(X0, X1, 4, 4)), 0x5304_1C20);
    }

    #[test]
    fn compares_and_selects() {
        assert_eq!(one(|a| a.cmp(X1, X2)), 0xEB02_003F);
        assert_eq!(one(|a| a.cmp_imm(X1, 0)), 0xF100_003F);
        assert_eq!(one(|a| a.cset(X0, Cond::Eq)), 0x9A9F_17E0);
        assert_eq!(one(|a| a.csel(X0, X1, X2, Cond::Lt)), 0x9A82_B020);
    }

    #[test]
    fn loads_and_stores() {
        assert_eq!(one(|a| a.ldr_imm(X0, X1, 16)), 0xF940_0820);
        assert_eq!(one(|a| a.str_imm(X0, X1, 0)), 0xF900_0020);
        assert_eq!(one(|a| a.ldr_w_imm(X0, X1, 16)), 0xB940_1020);
        assert_eq!(one(|a| a.str_w_imm(X0, X1, 16)), 0xB900_1020);
        assert_eq!(one(|a| a.ldrb_imm(X0, X1, 1)), 0x3940_0420);
        assert_eq!(one(|a| a.ldrh_imm(X0, X1, 2)), 0x7940_0420);
        assert_eq!(one(|a| a.ldr_reg(X0, X1, X2)), 0xF862_6820);
        assert_eq!(one(|a| a.str_reg(X0, X1, X2)), 0xF822_6820);
        assert_eq!(one(|a| a.ldr_w_reg(X0, X1, X2)), 0xB862_6820);
        assert_eq!(one(|a| a.ldrsw_reg(X0, X1, X2)), 0xB8A2_6820);
    }

    #[test]
    fn pairs_frame_idiom() {
        assert_eq!(one(|a| a.stp_pre(X29, X30, SP, -32)), 0xA9BE_7BFD);
        assert_eq!(one(|a| a.ldp_post(X29, X30, SP, 32)), 0xA8C2_7BFD);
        assert_eq!(one(|a| a.stp_off(X19, X20, SP, 16)), 0xA901_53F3);
        assert_eq!(one(|a| a.ldp_off(X19, X20, SP, 16)), 0xA941_53F3);
    }

    #[test]
    fn byte_reversal() {
        assert_eq!(one(|a| a.rev(X0, X1)), 0xDAC0_0C20);
        assert_eq!(one(|a| a.rev_w(X0, X1)), 0x5AC0_0820);
        assert_eq!(one(|a| a.rev16_w(X0, X1)), 0x5AC0_0420);
    }

    #[test]
    fn branches() {
        assert_eq!(one(|a| a.b(0)), 0x1400_0000);
        assert_eq!(one(|a| a.b(-4)), 0x17FF_FFFF);
        assert_eq!(one(|a| a.bl(8)), 0x9400_0002);
        assert_eq!(one(|a| a.b_cond(Cond::Eq, 8)), 0x5400_0040);
        assert_eq!(one(|a| a.cbz(X0, 8)), 0xB400_0040);
        assert_eq!(one(|a| a.br(X16)), 0xD61F_0200);
        assert_eq!(one(|a| a.blr(X16)), 0xD63F_0200);
        assert_eq!(one(|a| a.ret()), 0xD65F_03C0);
    }

    #[test]
    fn branch_displacement_extremes() {
        // The 26-bit form at ±128 MiB.
        assert_eq!(one(|a| a.b((1 << 27) - 4)), 0x15FF_FFFF);
        assert_eq!(one(|a| a.b(-(1 << 27))), 0x1600_0000);
        // The 19-bit conditional form at ±1 MiB.
        assert_eq!(one(|a| a.b_cond(Cond::Eq, (1 << 20) - 4)), 0x547F_FFE0);
        assert_eq!(one(|a| a.b_cond(Cond::Eq, -(1 << 20))), 0x5480_0000);
    }

    #[test]
    fn system() {
        assert_eq!(one(|a| a.nop()), 0xD503_201F);
        assert_eq!(one(|a| a.brk(0)), 0xD420_0000);
        assert_eq!(one(|a| a.dmb_ish()), 0xD503_3BBF);
        assert_eq!(one(|a| a.dsb_ish()), 0xD503_3B9F);
        assert_eq!(one(|a| a.isb()), 0xD503_3FDF);
        assert_eq!(one(|a| a.mrs_fpcr(X0)), 0xD53B_4400);
        assert_eq!(one(|a| a.msr_fpcr(X0)), 0xD51B_4400);
    }

    #[test]
    fn scalar_fp() {
        assert_eq!(one(|a| a.fadd_d(D0, D1, D2)), 0x1E62_2820);
        assert_eq!(one(|a| a.fsub_d(D0, D1, D2)), 0x1E62_3820);
        assert_eq!(one(|a| a.fmul_d(D0, D1, D2)), 0x1E62_0820);
        assert_eq!(one(|a| a.fdiv_d(D0, D1, D2)), 0x1E62_1820);
        assert_eq!(one(|a| a.fmadd_d(D0, D1, D2, D3)), 0x1F42_0C20);
        assert_eq!(one(|a| a.fmsub_d(D0, D1, D2, D3)), 0x1F42_8C20);
        assert_eq!(one(|a| a.fnmsub_d(D0, D1, D2, D3)), 0x1FC2_8C20);
        assert_eq!(one(|a| a.fneg_d(D0, D1)), 0x1E61_4020);
        assert_eq!(one(|a| a.fabs_d(D0, D1)), 0x1E60_C020);
        assert_eq!(one(|a| a.fcmp_d(D1, D2)), 0x1E62_2020);
        assert_eq!(one(|a| a.fmov_d_x(D0, X1)), 0x9E67_0020);
        assert_eq!(one(|a| a.fmov_x_d(X0, D1)), 0x9E66_0020);
        assert_eq!(one(|a| a.scvtf_d_x(D0, X1)), 0x9E62_0020);
        assert_eq!(one(|a| a.fcvtzs_w_d(X0, D1)), 0x1E78_0020);
        assert_eq!(one(|a| a.fcvt_sd(D0, D1)), 0x1E62_4020);
        assert_eq!(one(|a| a.fcvt_ds(D0, D1)), 0x1E22_C020);
        assert_eq!(one(|a| a.ldr_d_imm(D0, X1, 8)), 0xFD40_0420);
        assert_eq!(one(|a| a.str_d_imm(D0, X1, 8)), 0xFD00_0420);
    }

    #[test]
    fn neon() {
        assert_eq!(one(|a| a.ldr_q_imm(V0, X1, 16)), 0x3DC0_0420);
        assert_eq!(one(|a| a.str_q_imm(V0, X1, 16)), 0x3D80_0420);
        assert_eq!(one(|a| a.ldr_q_reg(V0, X1, X2)), 0x3CE2_6820);
        assert_eq!(one(|a| a.str_q_reg(V0, X1, X2)), 0x3CA2_6820);
        assert_eq!(one(|a| a.add_v4s(V0, V1, V2)), 0x4EA2_8420);
        assert_eq!(one(|a| a.sub_v4s(V0, V1, V2)), 0x6EA2_8420);
        assert_eq!(one(|a| a.and_v16b(V0, V1, V2)), 0x4E22_1C20);
        assert_eq!(one(|a| a.orr_v16b(V0, V1, V2)), 0x4EA2_1C20);
        assert_eq!(one(|a| a.eor_v16b(V0, V1, V2)), 0x6E22_1C20);
        assert_eq!(one(|a| a.fadd_v4s(V0, V1, V2)), 0x4E22_D420);
        assert_eq!(one(|a| a.fmla_v4s(V0, V1, V2)), 0x4E22_CC20);
        assert_eq!(one(|a| a.rev64_v16b(V0, V1)), 0x4E20_0820);
        assert_eq!(one(|a| a.ext_v16b(V0, V0, V0, 8)), 0x6E00_4000);
    }
}
