//! PowerPC (Cell PPU) instruction decoding.
//!
//! One raw big-endian 32-bit word in, one [`Inst`] out. Decoding never
//! fails: encodings outside the working set come back as [`Op::Unknown`],
//! which downstream layers route to the interpreter fallback.
//!
//! PowerPC numbers bits from the most significant end (bit 0 is the MSB).
//! All of that normalization happens here; the rest of the engine only ever
//! sees little-endian-style field values.

/// Instruction kind. The tag of the decoded record; the translator and the
/// interpreter are both exhaustive over it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    // D-form integer arithmetic.
    Addi,
    Addis,
    Addic,
    AddicRc,
    Subfic,
    Mulli,
    // X/XO-form integer arithmetic.
    Add,
    Subf,
    Neg,
    Addze,
    Mullw,
    Mulld,
    Mulhw,
    Mulhwu,
    Divw,
    Divwu,
    Divd,
    Divdu,
    // Logical.
    Andi,
    Andis,
    Ori,
    Oris,
    Xori,
    Xoris,
    And,
    Or,
    Xor,
    Nand,
    Nor,
    Andc,
    Orc,
    Eqv,
    Extsb,
    Extsh,
    Extsw,
    Cntlzw,
    Cntlzd,
    // Rotate and mask.
    Rlwinm,
    Rlwnm,
    Rlwimi,
    Rldicl,
    Rldicr,
    // Shifts.
    Slw,
    Srw,
    Sraw,
    Srawi,
    Sld,
    Srd,
    Srad,
    Sradi,
    // Compares.
    Cmpi,
    Cmpli,
    Cmp,
    Cmpl,
    // Branches.
    B,
    Bc,
    Bclr,
    Bcctr,
    // CR and SPR moves.
    Mfspr,
    Mtspr,
    Mfcr,
    Mtcrf,
    Mcrf,
    Crand,
    Cror,
    Crxor,
    Crnand,
    Crnor,
    Creqv,
    Crandc,
    Crorc,
    // System.
    Sc,
    Rfid,
    Sync,
    Lwsync,
    Eieio,
    Isync,
    Dcbz,
    Dcbf,
    Dcbst,
    Dcbt,
    Dcbtst,
    Icbi,
    // Integer loads.
    Lbz,
    Lbzu,
    Lbzx,
    Lhz,
    Lhzu,
    Lhzx,
    Lha,
    Lhau,
    Lhax,
    Lwz,
    Lwzu,
    Lwzx,
    Lwa,
    Lwax,
    Ld,
    Ldu,
    Ldx,
    // Integer stores.
    Stb,
    Stbu,
    Stbx,
    Sth,
    Sthu,
    Sthx,
    Stw,
    Stwu,
    Stwx,
    Std,
    Stdu,
    Stdx,
    // Byte-reversed accesses.
    Lhbrx,
    Lwbrx,
    Sthbrx,
    Stwbrx,
    // Reservation pair.
    Lwarx,
    Ldarx,
    Stwcx,
    Stdcx,
    // FP loads and stores.
    Lfs,
    Lfsx,
    Lfd,
    Lfdx,
    Stfs,
    Stfsx,
    Stfd,
    Stfdx,
    // FP arithmetic.
    Fadd,
    Fadds,
    Fsub,
    Fsubs,
    Fmul,
    Fmuls,
    Fdiv,
    Fdivs,
    Fmadd,
    Fmadds,
    Fmsub,
    Fmsubs,
    Fmr,
    Fneg,
    Fabs,
    Frsp,
    Fcmpu,
    Fctiwz,
    Fcfid,
    Mffs,
    Mtfsf,
    // Vector.
    Lvx,
    Stvx,
    Vand,
    Vor,
    Vxor,
    Vadduwm,
    Vsubuwm,
    Vaddfp,
    Vsubfp,
    Vmaddfp,
    /// Recognized by no table. A value, not an error.
    Unknown,
}

/// A decoded instruction: the [`Op`] tag plus every field any form can
/// carry, already normalized to host bit order. Produced without allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inst {
    pub op: Op,
    /// The raw word, kept for logging and for `Unknown` fallback.
    pub raw: u32,
    /// Guest address of the instruction.
    pub pc: u32,
    /// RT/RS/FRT/VRT slot.
    pub rd: u8,
    /// RA/FRA/VRA slot.
    pub ra: u8,
    /// RB/FRB/VRB slot.
    pub rb: u8,
    /// Third source for four-operand forms (FRC / VRC).
    pub rc_reg: u8,
    /// Sign-extended 16-bit immediate.
    pub simm: i16,
    /// Zero-extended 16-bit immediate.
    pub uimm: u16,
    /// I-form branch displacement, sign-extended, in bytes.
    pub li: i32,
    /// B-form branch displacement, sign-extended, in bytes.
    pub bd: i16,
    /// Branch options field.
    pub bo: u8,
    /// CR bit the branch tests.
    pub bi: u8,
    /// Rotate/shift amount (6 bits for the 64-bit forms).
    pub sh: u8,
    /// Mask begin (6 bits for the 64-bit forms).
    pub mb: u8,
    /// Mask end.
    pub me: u8,
    /// Target CR field of compares and `mcrf`.
    pub bf: u8,
    /// Source CR field of `mcrf`.
    pub bfa: u8,
    /// Compare width bit: set for 64-bit compares.
    pub l: bool,
    /// SPR number for `mfspr`/`mtspr` (halves already swapped).
    pub spr: u16,
    /// Field mask of `mtcrf` / `mtfsf`.
    pub fm: u8,
    /// Record bit: update CR0 (CR1 for FP) from the result.
    pub rc: bool,
    /// Branch absolute-address bit.
    pub aa: bool,
    /// Branch link bit.
    pub lk: bool,
}

impl Inst {
    /// True when this instruction ends a block. Depends only on the tag.
    #[inline]
    pub fn is_block_terminator(&self) -> bool {
        matches!(
            self.op,
            Op::B | Op::Bc | Op::Bclr | Op::Bcctr | Op::Sc | Op::Rfid
        )
    }

    /// True for the D/DS/X-form update loads and stores that write the
    /// effective address back into RA.
    #[inline]
    pub fn writes_back_base(&self) -> bool {
        matches!(
            self.op,
            Op::Lbzu
                | Op::Lhzu
                | Op::Lhau
                | Op::Lwzu
                | Op::Ldu
                | Op::Stbu
                | Op::Sthu
                | Op::Stwu
                | Op::Stdu
        )
    }
}

const fn blank(raw: u32, pc: u32) -> Inst {
    Inst {
        op: Op::Unknown,
        raw,
        pc,
        rd: 0,
        ra: 0,
        rb: 0,
        rc_reg: 0,
        simm: 0,
        uimm: 0,
        li: 0,
        bd: 0,
        bo: 0,
        bi: 0,
        sh: 0,
        mb: 0,
        me: 0,
        bf: 0,
        bfa: 0,
        l: false,
        spr: 0,
        fm: 0,
        rc: false,
        aa: false,
        lk: false,
    }
}

#[inline]
fn rt(raw: u32) -> u8 {
    ((raw >> 21) & 0x1F) as u8
}

#[inline]
fn ra(raw: u32) -> u8 {
    ((raw >> 16) & 0x1F) as u8
}

#[inline]
fn rb(raw: u32) -> u8 {
    ((raw >> 11) & 0x1F) as u8
}

/// Decodes one raw instruction word fetched from `pc`.
pub fn decode(raw: u32, pc: u32) -> Inst {
    let mut inst = blank(raw, pc);
    inst.rd = rt(raw);
    inst.ra = ra(raw);
    inst.rb = rb(raw);
    inst.simm = (raw & 0xFFFF) as i16;
    inst.uimm = (raw & 0xFFFF) as u16;
    // Bit 0 is the record bit only in the forms that have one; in D-forms
    // it belongs to the immediate. Each group sets it where it is real.
    inst.rc = false;

    let primary = raw >> 26;
    inst.op = match primary {
        4 => decode_vector(raw, &mut inst),
        7 => Op::Mulli,
        8 => Op::Subfic,
        10 | 11 => {
            inst.bf = ((raw >> 23) & 0x7) as u8;
            inst.l = (raw >> 21) & 1 != 0;
            if primary == 10 {
                Op::Cmpli
            } else {
                Op::Cmpi
            }
        }
        12 => Op::Addic,
        13 => {
            inst.rc = true;
            Op::AddicRc
        }
        14 => Op::Addi,
        15 => Op::Addis,
        16 => {
            inst.bo = rt(raw);
            inst.bi = ra(raw);
            inst.bd = (raw & 0xFFFC) as i16;
            inst.aa = raw & 2 != 0;
            inst.lk = raw & 1 != 0;
            Op::Bc
        }
        17 => Op::Sc,
        18 => {
            let mut li = (raw & 0x03FF_FFFC) as i32;
            if li & 0x0200_0000 != 0 {
                li |= !0x03FF_FFFF;
            }
            inst.li = li;
            inst.aa = raw & 2 != 0;
            inst.lk = raw & 1 != 0;
            Op::B
        }
        19 => decode_group19(raw, &mut inst),
        20 => decode_rlw(raw, &mut inst, Op::Rlwimi),
        21 => decode_rlw(raw, &mut inst, Op::Rlwinm),
        23 => decode_rlw(raw, &mut inst, Op::Rlwnm),
        24 => Op::Ori,
        25 => Op::Oris,
        26 => Op::Xori,
        27 => Op::Xoris,
        28 => {
            inst.rc = true;
            Op::Andi
        }
        29 => {
            inst.rc = true;
            Op::Andis
        }
        30 => decode_group30(raw, &mut inst),
        31 => decode_group31(raw, &mut inst),
        32 => Op::Lwz,
        33 => Op::Lwzu,
        34 => Op::Lbz,
        35 => Op::Lbzu,
        36 => Op::Stw,
        37 => Op::Stwu,
        38 => Op::Stb,
        39 => Op::Stbu,
        40 => Op::Lhz,
        41 => Op::Lhzu,
        42 => Op::Lha,
        43 => Op::Lhau,
        44 => Op::Sth,
        45 => Op::Sthu,
        48 => Op::Lfs,
        50 => Op::Lfd,
        52 => Op::Stfs,
        54 => Op::Stfd,
        58 => {
            // DS-form: the displacement's low two bits select the op.
            inst.simm = (raw & 0xFFFC) as i16;
            match raw & 3 {
                0 => Op::Ld,
                1 => Op::Ldu,
                2 => Op::Lwa,
                _ => Op::Unknown,
            }
        }
        59 => decode_group59(raw, &mut inst),
        62 => {
            inst.simm = (raw & 0xFFFC) as i16;
            match raw & 3 {
                0 => Op::Std,
                1 => Op::Stdu,
                _ => Op::Unknown,
            }
        }
        63 => decode_group63(raw, &mut inst),
        _ => Op::Unknown,
    };
    if inst.op == Op::Unknown {
        inst.rc = false;
    }
    inst
}

fn decode_rlw(raw: u32, inst: &mut Inst, op: Op) -> Op {
    inst.rc = raw & 1 != 0;
    inst.sh = rb(raw);
    inst.mb = ((raw >> 6) & 0x1F) as u8;
    inst.me = ((raw >> 1) & 0x1F) as u8;
    op
}

fn decode_group19(raw: u32, inst: &mut Inst) -> Op {
    let xo = (raw >> 1) & 0x3FF;
    match xo {
        0 => {
            inst.bf = ((raw >> 23) & 0x7) as u8;
            inst.bfa = ((raw >> 18) & 0x7) as u8;
            Op::Mcrf
        }
        16 | 528 => {
            inst.bo = rt(raw);
            inst.bi = ra(raw);
            inst.lk = raw & 1 != 0;
            if xo == 16 {
                Op::Bclr
            } else {
                Op::Bcctr
            }
        }
        18 => Op::Rfid,
        150 => Op::Isync,
        // CR logical: BT/BA/BB ride in the register slots.
        33 => Op::Crnor,
        129 => Op::Crandc,
        193 => Op::Crxor,
        225 => Op::Crnand,
        257 => Op::Crand,
        289 => Op::Creqv,
        417 => Op::Crorc,
        449 => Op::Cror,
        _ => Op::Unknown,
    }
}

fn decode_group30(raw: u32, inst: &mut Inst) -> Op {
    inst.rc = raw & 1 != 0;
    // MD-form: sh and the mask boundary are both split fields.
    inst.sh = (((raw >> 11) & 0x1F) | ((raw & 2) << 4)) as u8;
    let mb6 = (((raw >> 6) & 0x1F) | ((raw >> 5) & 0x20)) as u8;
    match (raw >> 2) & 0x7 {
        0 => {
            inst.mb = mb6;
            Op::Rldicl
        }
        1 => {
            inst.me = mb6;
            Op::Rldicr
        }
        _ => Op::Unknown,
    }
}

fn decode_group31(raw: u32, inst: &mut Inst) -> Op {
    inst.rc = raw & 1 != 0;
    // sradi is XS-form: a 9-bit extended opcode with sh[5] below it.
    if (raw >> 2) & 0x1FF == 413 {
        inst.sh = ((rb(raw) as u32) | ((raw & 2) << 4)) as u8;
        return Op::Sradi;
    }
    let xo = (raw >> 1) & 0x3FF;
    match xo {
        0 | 32 => {
            inst.bf = ((raw >> 23) & 0x7) as u8;
            inst.l = (raw >> 21) & 1 != 0;
            inst.rc = false;
            if xo == 0 {
                Op::Cmp
            } else {
                Op::Cmpl
            }
        }
        11 => Op::Mulhwu,
        19 => {
            inst.rc = false;
            Op::Mfcr
        }
        20 => Op::Lwarx,
        21 => Op::Ldx,
        23 => Op::Lwzx,
        24 => Op::Slw,
        26 => Op::Cntlzw,
        27 => Op::Sld,
        28 => Op::And,
        40 => Op::Subf,
        54 => {
            inst.rc = false;
            Op::Dcbst
        }
        58 => Op::Cntlzd,
        60 => Op::Andc,
        75 => Op::Mulhw,
        84 => Op::Ldarx,
        86 => {
            inst.rc = false;
            Op::Dcbf
        }
        87 => Op::Lbzx,
        103 => {
            inst.rc = false;
            Op::Lvx
        }
        104 => Op::Neg,
        124 => Op::Nor,
        144 => {
            inst.fm = ((raw >> 12) & 0xFF) as u8;
            inst.rc = false;
            Op::Mtcrf
        }
        149 => Op::Stdx,
        150 => {
            // stwcx. always records.
            inst.rc = true;
            Op::Stwcx
        }
        151 => Op::Stwx,
        202 => Op::Addze,
        214 => {
            inst.rc = true;
            Op::Stdcx
        }
        215 => Op::Stbx,
        231 => {
            inst.rc = false;
            Op::Stvx
        }
        233 => Op::Mulld,
        235 => Op::Mullw,
        246 => {
            inst.rc = false;
            Op::Dcbtst
        }
        266 => Op::Add,
        278 => {
            inst.rc = false;
            Op::Dcbt
        }
        279 => Op::Lhzx,
        284 => Op::Eqv,
        316 => Op::Xor,
        339 | 467 => {
            inst.spr = (((raw >> 16) & 0x1F) | (((raw >> 11) & 0x1F) << 5)) as u16;
            inst.rc = false;
            if xo == 339 {
                Op::Mfspr
            } else {
                Op::Mtspr
            }
        }
        341 => Op::Lwax,
        343 => Op::Lhax,
        407 => Op::Sthx,
        412 => Op::Orc,
        444 => Op::Or,
        457 => Op::Divdu,
        459 => Op::Divwu,
        476 => Op::Nand,
        489 => Op::Divd,
        491 => Op::Divw,
        534 => Op::Lwbrx,
        535 => {
            inst.rc = false;
            Op::Lfsx
        }
        536 => Op::Srw,
        539 => Op::Srd,
        598 => {
            inst.rc = false;
            // The L field distinguishes the heavyweight sync from lwsync.
            if (raw >> 21) & 3 == 1 {
                Op::Lwsync
            } else {
                Op::Sync
            }
        }
        599 => {
            inst.rc = false;
            Op::Lfdx
        }
        662 => Op::Stwbrx,
        663 => {
            inst.rc = false;
            Op::Stfsx
        }
        727 => {
            inst.rc = false;
            Op::Stfdx
        }
        790 => Op::Lhbrx,
        792 => Op::Sraw,
        794 => Op::Srad,
        824 => {
            inst.sh = rb(raw);
            Op::Srawi
        }
        854 => {
            inst.rc = false;
            Op::Eieio
        }
        918 => Op::Sthbrx,
        922 => Op::Extsh,
        954 => Op::Extsb,
        982 => {
            inst.rc = false;
            Op::Icbi
        }
        986 => Op::Extsw,
        1014 => {
            inst.rc = false;
            Op::Dcbz
        }
        _ => Op::Unknown,
    }
}

fn decode_group59(raw: u32, inst: &mut Inst) -> Op {
    inst.rc = raw & 1 != 0;
    inst.rc_reg = ((raw >> 6) & 0x1F) as u8;
    match (raw >> 1) & 0x1F {
        18 => Op::Fdivs,
        20 => Op::Fsubs,
        21 => Op::Fadds,
        25 => Op::Fmuls,
        28 => Op::Fmsubs,
        29 => Op::Fmadds,
        _ => Op::Unknown,
    }
}

fn decode_group63(raw: u32, inst: &mut Inst) -> Op {
    // A-form arithmetic decodes on the 5-bit opcode; everything else on the
    // full 10-bit one.
    let xo5 = (raw >> 1) & 0x1F;
    if matches!(xo5, 18 | 20 | 21 | 25 | 28 | 29) {
        inst.rc = raw & 1 != 0;
        inst.rc_reg = ((raw >> 6) & 0x1F) as u8;
        return match xo5 {
            18 => Op::Fdiv,
            20 => Op::Fsub,
            21 => Op::Fadd,
            25 => Op::Fmul,
            28 => Op::Fmsub,
            _ => Op::Fmadd,
        };
    }
    match (raw >> 1) & 0x3FF {
        0 => {
            inst.bf = ((raw >> 23) & 0x7) as u8;
            inst.rc = false;
            Op::Fcmpu
        }
        12 => {
            inst.rc = raw & 1 != 0;
            Op::Frsp
        }
        15 => Op::Fctiwz,
        40 => Op::Fneg,
        72 => Op::Fmr,
        264 => Op::Fabs,
        583 => Op::Mffs,
        711 => {
            inst.fm = ((raw >> 17) & 0xFF) as u8;
            Op::Mtfsf
        }
        846 => Op::Fcfid,
        _ => Op::Unknown,
    }
}

fn decode_vector(raw: u32, inst: &mut Inst) -> Op {
    // VA-form carries a fourth register; check its 6-bit opcode first.
    if raw & 0x3F == 46 {
        inst.rc_reg = ((raw >> 6) & 0x1F) as u8;
        return Op::Vmaddfp;
    }
    match raw & 0x7FF {
        10 => Op::Vaddfp,
        74 => Op::Vsubfp,
        128 => Op::Vadduwm,
        1028 => Op::Vand,
        1152 => Op::Vsubuwm,
        1156 => Op::Vor,
        1220 => Op::Vxor,
        _ => Op::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(raw: u32) -> Inst {
        decode(raw, 0x1_0000)
    }

    #[test]
    fn addi_fields() {
        // addi r1, r1, 16
        let i = d(0x3821_0010);
        assert_eq!(i.op, Op::Addi);
        assert_eq!(i.rd, 1);
        assert_eq!(i.ra, 1);
        assert_eq!(i.simm, 16);
        assert!(!i.is_block_terminator());
    }

    #[test]
    fn immediates_sign_extend_at_the_extremes() {
        // addi r3, r0, -32768
        let i = d(0x3860_8000);
        assert_eq!(i.simm, -32768);
        assert_eq!(i.simm as i64, -32768);
        // addi r3, r0, 32767
        let i = d(0x3860_7FFF);
        assert_eq!(i.simm, 32767);
    }

    #[test]
    fn lwz_and_update_forms() {
        // lwz r3, 0x1000(r0)
        let i = d(0x8060_1000);
        assert_eq!(i.op, Op::Lwz);
        assert_eq!(i.rd, 3);
        assert_eq!(i.ra, 0);
        assert_eq!(i.simm, 0x1000);
        assert!(!i.writes_back_base());
        // stwu r1, -112(r1)
        let i = d(0x9421_FF90);
        assert_eq!(i.op, Op::Stwu);
        assert!(i.writes_back_base());
        assert_eq!(i.simm, -112);
    }

    #[test]
    fn branch_displacement_extremes_round_trip() {
        // b .+0x1FFFFFC — the maximum forward displacement.
        let raw = (18 << 26) | 0x01FF_FFFC;
        let i = d(raw);
        assert_eq!(i.op, Op::B);
        assert_eq!(i.li, 0x01FF_FFFC);
        assert!(i.is_block_terminator());
        // b .-0x2000000 — the maximum backward displacement.
        let raw = (18 << 26) | 0x0200_0000;
        let i = d(raw);
        assert_eq!(i.li, -0x0200_0000);
        // Reconstruct the displacement field and compare: a round-trip
        // through the canonical encoder for the I-form.
        let reencoded = (18 << 26) | ((i.li as u32) & 0x03FF_FFFC);
        assert_eq!(reencoded, raw);
    }

    #[test]
    fn conditional_branch_fields() {
        // bdnz .-8  (bc 16,0,-8)
        let raw = (16 << 26) | (16 << 21) | (0xFFF8 & 0xFFFC);
        let i = d(raw);
        assert_eq!(i.op, Op::Bc);
        assert_eq!(i.bo, 16);
        assert_eq!(i.bi, 0);
        assert_eq!(i.bd, -8);
        // blr
        let i = d(0x4E80_0020);
        assert_eq!(i.op, Op::Bclr);
        assert_eq!(i.bo, 20);
        assert!(!i.lk);
        // bctrl
        let i = d(0x4E80_0421);
        assert_eq!(i.op, Op::Bcctr);
        assert!(i.lk);
    }

    #[test]
    fn group31_extended_opcodes() {
        // add r5, r4, r3
        let i = d(0x7CA4_1A14);
        assert_eq!(i.op, Op::Add);
        assert_eq!((i.rd, i.ra, i.rb), (5, 4, 3));
        assert!(!i.rc);
        // add. r5, r4, r3
        let i = d(0x7CA4_1A15);
        assert_eq!(i.op, Op::Add);
        assert!(i.rc);
        // subf r3, r4, r5
        let i = d(0x7C64_2850);
        assert_eq!(i.op, Op::Subf);
        // or r3, r4, r4 (mr r3, r4)
        let i = d(0x7C83_2378);
        assert_eq!(i.op, Op::Or);
        assert_eq!((i.rd, i.ra, i.rb), (4, 3, 4));
    }

    #[test]
    fn rotate_mask_fields_are_non_adjacent() {
        // rlwinm r4, r3, 8, 16, 23
        let raw = (21u32 << 26) | (3 << 21) | (4 << 16) | (8 << 11) | (16 << 6) | (23 << 1);
        let i = d(raw);
        assert_eq!(i.op, Op::Rlwinm);
        assert_eq!((i.rd, i.ra), (3, 4));
        assert_eq!((i.sh, i.mb, i.me), (8, 16, 23));
    }

    #[test]
    fn sixty_four_bit_rotates_carry_split_fields() {
        // rldicl r3, r4, 32, 16: sh[5]=1 lives in bit 1, mb[5] in bit 5.
        let raw = (30u32 << 26) | (4 << 21) | (3 << 16) | ((32 & 0x1F) << 11) | (16 << 6) | 2;
        let i = d(raw);
        assert_eq!(i.op, Op::Rldicl);
        assert_eq!(i.sh, 32);
        assert_eq!(i.mb, 16);
        // sradi r3, r4, 63
        let raw = (31u32 << 26) | (4 << 21) | (3 << 16) | ((63 & 0x1F) << 11) | (413 << 2) | 2;
        let i = d(raw);
        assert_eq!(i.op, Op::Sradi);
        assert_eq!(i.sh, 63);
    }

    #[test]
    fn compares_surface_bf_and_width() {
        // cmpwi cr7, r3, 5
        let raw = (11u32 << 26) | (7 << 23) | (3 << 16) | 5;
        let i = d(raw);
        assert_eq!(i.op, Op::Cmpi);
        assert_eq!(i.bf, 7);
        assert!(!i.l);
        // cmpld cr0, r3, r4
        let raw = (31u32 << 26) | (1 << 21) | (3 << 16) | (4 << 11) | (32 << 1);
        let i = d(raw);
        assert_eq!(i.op, Op::Cmpl);
        assert!(i.l);
    }

    #[test]
    fn spr_halves_are_swapped() {
        // mflr r0: spr 8 encodes as 0x100 in the instruction field.
        let i = d(0x7C08_02A6);
        assert_eq!(i.op, Op::Mfspr);
        assert_eq!(i.spr, 8);
        // mtctr r12
        let i = d(0x7D89_03A6);
        assert_eq!(i.op, Op::Mtspr);
        assert_eq!(i.spr, 9);
        assert_eq!(i.rd, 12);
    }

    #[test]
    fn sync_variants_split_on_l() {
        // sync 0 (hwsync)
        let raw = (31u32 << 26) | (598 << 1);
        assert_eq!(d(raw).op, Op::Sync);
        // lwsync
        let raw = (31u32 << 26) | (1 << 21) | (598 << 1);
        assert_eq!(d(raw).op, Op::Lwsync);
    }

    #[test]
    fn ds_form_selects_on_low_bits() {
        // ld r3, 0x10(r1)
        let raw = (58u32 << 26) | (3 << 21) | (1 << 16) | 0x10;
        let i = d(raw);
        assert_eq!(i.op, Op::Ld);
        assert_eq!(i.simm, 0x10);
        // std r3, 0x10(r1)
        let raw = (62u32 << 26) | (3 << 21) | (1 << 16) | 0x10;
        assert_eq!(d(raw).op, Op::Std);
        // stdu r1, -0x70(r1)
        let raw = (62u32 << 26) | (1 << 21) | (1 << 16) | (0xFF90 & 0xFFFC) | 1;
        let i = d(raw);
        assert_eq!(i.op, Op::Stdu);
        assert_eq!(i.simm, -0x70);
    }

    #[test]
    fn fp_forms() {
        // fadd f1, f2, f3
        let raw = (63u32 << 26) | (1 << 21) | (2 << 16) | (3 << 11) | (21 << 1);
        let i = d(raw);
        assert_eq!(i.op, Op::Fadd);
        // fmadds f1, f2, f4, f3: FRC sits in the 6..10 slot.
        let raw =
            (59u32 << 26) | (1 << 21) | (2 << 16) | (3 << 11) | (4 << 6) | (29 << 1);
        let i = d(raw);
        assert_eq!(i.op, Op::Fmadds);
        assert_eq!(i.rc_reg, 4);
        // fcmpu cr1, f2, f3
        let raw = (63u32 << 26) | (1 << 23) | (2 << 16) | (3 << 11);
        let i = d(raw);
        assert_eq!(i.op, Op::Fcmpu);
        assert_eq!(i.bf, 1);
    }

    #[test]
    fn vector_forms() {
        // vaddfp v1, v2, v3
        let raw = (4u32 << 26) | (1 << 21) | (2 << 16) | (3 << 11) | 10;
        assert_eq!(d(raw).op, Op::Vaddfp);
        // vmaddfp v1, v2, v4, v3 (VA-form, xo6 = 46)
        let raw = (4u32 << 26) | (1 << 21) | (2 << 16) | (3 << 11) | (4 << 6) | 46;
        let i = d(raw);
        assert_eq!(i.op, Op::Vmaddfp);
        assert_eq!(i.rc_reg, 4);
        // lvx v0, r3, r4
        let raw = (31u32 << 26) | (3 << 16) | (4 << 11) | (103 << 1);
        assert_eq!(d(raw).op, Op::Lvx);
    }

    #[test]
    fn unknown_is_a_value_not_an_error() {
        let i = d(0x0000_0000);
        assert_eq!(i.op, Op::Unknown);
        assert!(!i.rc);
        assert!(!i.is_block_terminator());
        let i = d(0xFFFF_FFFF);
        assert_eq!(i.op, Op::Unknown);
    }

    #[test]
    fn terminator_predicate_is_per_tag() {
        for (raw, term) in [
            (0x4E80_0020u32, true), // blr
            (0x4400_0002u32, true), // sc
            (0x3821_0010u32, false),
            (0x7CA4_1A14u32, false),
        ] {
            assert_eq!(d(raw).is_block_terminator(), term);
        }
    }
}
