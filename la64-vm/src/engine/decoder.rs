//! Instruction decoder.
//!
//! Pure function from a 32-bit instruction word to an `Op`. Encodings are
//! grouped by the major opcode in bits 31:26 and narrowed with the fixed
//! field layouts below. Anything that matches no defined pattern decodes
//! to `None`, which the emitter turns into an INE fault.
//!
//! ```text
//!   2R     | opcode 31:10                     | rj 9:5 | rd 4:0 |
//!   3R     | opcode 31:15          | rk 14:10 | rj     | rd     |
//!   4R     | opcode 31:20 | ra 19:15 | rk     | rj     | rd     |
//!   2RI12  | opcode 31:22 | si12 21:10        | rj     | rd     |
//!   2RI14  | opcode 31:24 | si14 23:10        | rj     | rd     |
//!   2RI16  | op 31:26 | offs16 25:10          | rj     | rd     |
//!   1RI21  | op 31:26 | offs[15:0] 25:10      | rj     | offs[20:16] |
//!   I26    | op 31:26 | offs[15:0] 25:10      | offs[25:16] 9:0 |
//!   1RI20  | op 31:25 | si20 24:5                      | rd     |
//! ```

use crate::bits::sext;
use crate::cpu::fpu::{FBinOp, FCvtKind, FUnOp, FmaKind, FpFmt, IntWidth, RoundMode};

/// Three-register integer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    AddW,
    AddD,
    SubW,
    SubD,
    Slt,
    Sltu,
    Maskeqz,
    Masknez,
    Nor,
    And,
    Or,
    Xor,
    Orn,
    Andn,
    SllW,
    SrlW,
    SraW,
    SllD,
    SrlD,
    SraD,
    RotrW,
    RotrD,
    MulW,
    MulhW,
    MulhWu,
    MulD,
    MulhD,
    MulhDu,
    MulwDW,
    MulwDWu,
    DivW,
    ModW,
    DivWu,
    ModWu,
    DivD,
    ModD,
    DivDu,
    ModDu,
}

/// Register-immediate integer operations. Shift amounts are carried in
/// `imm`; logical immediates are zero-extended, the rest sign-extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluImmOp {
    Slti,
    Sltui,
    AddiW,
    AddiD,
    Andi,
    Ori,
    Xori,
    SlliW,
    SlliD,
    SrliW,
    SrliD,
    SraiW,
    SraiD,
    RotriW,
    RotriD,
}

/// Two-register bit manipulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitOp {
    CloW,
    ClzW,
    CtoW,
    CtzW,
    CloD,
    ClzD,
    CtoD,
    CtzD,
    Revb2h,
    Revb4h,
    Revb2w,
    RevbD,
    Revh2w,
    RevhD,
    Bitrev4b,
    Bitrev8b,
    BitrevW,
    BitrevD,
    ExtWH,
    ExtWB,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlslKind {
    W,
    Wu,
    D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PcRelKind {
    /// rd = pc + (si20 << 2)
    Addi,
    /// rd = pc + (si20 << 12)
    Addu12i,
    /// rd = pc + (si20 << 18)
    Addu18i,
    /// rd = (pc + (si20 << 12)) & !0xfff
    Alau12i,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemSize {
    B,
    H,
    W,
    D,
}

impl MemSize {
    pub fn bytes(self) -> u8 {
        match self {
            MemSize::B => 1,
            MemSize::H => 2,
            MemSize::W => 4,
            MemSize::D => 8,
        }
    }

    fn from_index(index: u32) -> MemSize {
        match index & 3 {
            0 => MemSize::B,
            1 => MemSize::H,
            2 => MemSize::W,
            _ => MemSize::D,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AmoOp {
    Swap,
    Add,
    And,
    Or,
    Xor,
    Max,
    Min,
    MaxU,
    MinU,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchCond {
    Eq,
    Ne,
    Lt,
    Ge,
    Ltu,
    Geu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RdtimeKind {
    LowW,
    HighW,
    D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlbOp {
    Clr,
    Flush,
    Srch,
    Rd,
    Wr,
    Fill,
}

/// Moves between the FP register file, GPRs, FCSR and condition flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FMoveKind {
    /// movgr2fr.w fd, rj
    Gr2FrW,
    /// movgr2fr.d fd, rj
    Gr2FrD,
    /// movgr2frh.w fd, rj
    Gr2FrhW,
    /// movfr2gr.s rd, fj
    Fr2GrS,
    /// movfr2gr.d rd, fj
    Fr2GrD,
    /// movfrh2gr.s rd, fj
    Frh2GrS,
    /// movgr2fcsr fcsr, rj
    Gr2Fcsr,
    /// movfcsr2gr rd, fcsr
    Fcsr2Gr,
    /// movfr2cf cd, fj
    Fr2Cf,
    /// movcf2fr fd, cj
    Cf2Fr,
    /// movgr2cf cd, rj
    Gr2Cf,
    /// movcf2gr rd, cj
    Cf2Gr,
}

/// Decoded instruction. Register fields are raw 5-bit indices; immediates
/// and branch offsets are already sign-extended and scaled to bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Alu { op: AluOp, rd: u8, rj: u8, rk: u8 },
    AluImm { op: AluImmOp, rd: u8, rj: u8, imm: i64 },
    Bit { op: BitOp, rd: u8, rj: u8 },
    Alsl { kind: AlslKind, rd: u8, rj: u8, rk: u8, sa: u8 },
    Bytepick { d: bool, rd: u8, rj: u8, rk: u8, sa: u8 },
    Bstrins { d: bool, rd: u8, rj: u8, msb: u8, lsb: u8 },
    Bstrpick { d: bool, rd: u8, rj: u8, msb: u8, lsb: u8 },
    Lu12iW { rd: u8, imm: i64 },
    Lu32iD { rd: u8, imm: i64 },
    Lu52iD { rd: u8, rj: u8, imm: i64 },
    Addu16iD { rd: u8, rj: u8, imm: i64 },
    PcRel { kind: PcRelKind, rd: u8, imm: i64 },

    Load { size: MemSize, signed: bool, rd: u8, rj: u8, offset: i64 },
    LoadIndexed { size: MemSize, signed: bool, rd: u8, rj: u8, rk: u8 },
    Store { size: MemSize, rd: u8, rj: u8, offset: i64 },
    StoreIndexed { size: MemSize, rd: u8, rj: u8, rk: u8 },
    FLoad { double: bool, fd: u8, rj: u8, offset: i64 },
    FLoadIndexed { double: bool, fd: u8, rj: u8, rk: u8 },
    FStore { double: bool, fd: u8, rj: u8, offset: i64 },
    FStoreIndexed { double: bool, fd: u8, rj: u8, rk: u8 },
    Preld { hint: u8, rj: u8, offset: i64 },
    Preldx { hint: u8, rj: u8, rk: u8 },
    Ll { d: bool, rd: u8, rj: u8, offset: i64 },
    Sc { d: bool, rd: u8, rj: u8, offset: i64 },
    Amo { op: AmoOp, d: bool, db: bool, rd: u8, rj: u8, rk: u8 },
    Dbar { hint: u16 },
    Ibar { hint: u16 },
    /// asrtle.d / asrtgt.d
    BoundCheck { gt: bool, rj: u8, rk: u8 },

    Branch { cond: BranchCond, rj: u8, rd: u8, offset: i64 },
    BranchZero { nez: bool, rj: u8, offset: i64 },
    BranchFcc { nez: bool, cj: u8, offset: i64 },
    Jirl { rd: u8, rj: u8, offset: i64 },
    B { offset: i64 },
    Bl { offset: i64 },

    Syscall { code: u16 },
    Break { code: u16 },
    Csrrd { rd: u8, csr: u16 },
    Csrwr { rd: u8, csr: u16 },
    Csrxchg { rd: u8, rj: u8, csr: u16 },
    Iocsrrd { size: MemSize, rd: u8, rj: u8 },
    Iocsrwr { size: MemSize, rd: u8, rj: u8 },
    Cacop { code: u8, rj: u8, offset: i64 },
    Lddir { rd: u8, rj: u8, level: u8 },
    Ldpte { rj: u8, seq: u8 },
    Tlb(TlbOp),
    Invtlb { op: u8, rj: u8, rk: u8 },
    Ertn,
    Idle { level: u16 },
    Cpucfg { rd: u8, rj: u8 },
    Rdtime { kind: RdtimeKind, rd: u8, rj: u8 },

    FBinary { op: FBinOp, fmt: FpFmt, fd: u8, fj: u8, fk: u8 },
    FUnary { op: FUnOp, fmt: FpFmt, fd: u8, fj: u8 },
    FClass { fmt: FpFmt, fd: u8, fj: u8 },
    FMulAdd { kind: FmaKind, fmt: FpFmt, fd: u8, fj: u8, fk: u8, fa: u8 },
    FCmp { cond: u8, fmt: FpFmt, cd: u8, fj: u8, fk: u8 },
    FSel { fd: u8, fj: u8, fk: u8, ca: u8 },
    FCvt { kind: FCvtKind, fd: u8, fj: u8 },
    FMove { kind: FMoveKind, dst: u8, src: u8 },

    /// LSX (`asx == false`) or LASX instruction; not implemented beyond
    /// the enable check.
    Vector { asx: bool },
}

impl Op {
    /// Needs PLV0.
    pub fn is_privileged(&self) -> bool {
        matches!(
            self,
            Op::Csrrd { .. }
                | Op::Csrwr { .. }
                | Op::Csrxchg { .. }
                | Op::Iocsrrd { .. }
                | Op::Iocsrwr { .. }
                | Op::Cacop { .. }
                | Op::Lddir { .. }
                | Op::Ldpte { .. }
                | Op::Tlb(_)
                | Op::Invtlb { .. }
                | Op::Ertn
                | Op::Idle { .. }
        )
    }

    /// Needs EUEN.FPE.
    pub fn uses_fpu(&self) -> bool {
        matches!(
            self,
            Op::FLoad { .. }
                | Op::FLoadIndexed { .. }
                | Op::FStore { .. }
                | Op::FStoreIndexed { .. }
                | Op::BranchFcc { .. }
                | Op::FBinary { .. }
                | Op::FUnary { .. }
                | Op::FClass { .. }
                | Op::FMulAdd { .. }
                | Op::FCmp { .. }
                | Op::FSel { .. }
                | Op::FCvt { .. }
                | Op::FMove { .. }
        )
    }

    /// Only available with 64-bit addressing enabled.
    pub fn requires_la64(&self) -> bool {
        match *self {
            Op::Alu { op, .. } => matches!(
                op,
                AluOp::AddD
                    | AluOp::SubD
                    | AluOp::SllD
                    | AluOp::SrlD
                    | AluOp::SraD
                    | AluOp::RotrD
                    | AluOp::MulD
                    | AluOp::MulhD
                    | AluOp::MulhDu
                    | AluOp::MulwDW
                    | AluOp::MulwDWu
                    | AluOp::DivD
                    | AluOp::ModD
                    | AluOp::DivDu
                    | AluOp::ModDu
            ),
            Op::AluImm { op, .. } => matches!(
                op,
                AluImmOp::AddiD
                    | AluImmOp::SlliD
                    | AluImmOp::SrliD
                    | AluImmOp::SraiD
                    | AluImmOp::RotriD
            ),
            Op::Bit { op, .. } => matches!(
                op,
                BitOp::CloD
                    | BitOp::ClzD
                    | BitOp::CtoD
                    | BitOp::CtzD
                    | BitOp::Revb4h
                    | BitOp::Revb2w
                    | BitOp::RevbD
                    | BitOp::Revh2w
                    | BitOp::RevhD
                    | BitOp::Bitrev8b
                    | BitOp::BitrevD
            ),
            Op::Alsl { kind, .. } => kind != AlslKind::W,
            Op::Bytepick { d, .. } | Op::Bstrins { d, .. } | Op::Bstrpick { d, .. } => d,
            Op::Lu32iD { .. } | Op::Lu52iD { .. } | Op::Addu16iD { .. } => true,
            Op::PcRel { kind, .. } => kind == PcRelKind::Addu18i,
            Op::Load { size, signed, .. } | Op::LoadIndexed { size, signed, .. } => {
                size == MemSize::D || (size == MemSize::W && !signed)
            }
            Op::Store { size, .. } | Op::StoreIndexed { size, .. } => size == MemSize::D,
            Op::Ll { d, .. } | Op::Sc { d, .. } | Op::Amo { d, .. } => d,
            Op::BoundCheck { .. } => true,
            Op::Rdtime { kind, .. } => kind == RdtimeKind::D,
            Op::Iocsrrd { size, .. } | Op::Iocsrwr { size, .. } => size == MemSize::D,
            Op::FMove { kind, .. } => matches!(kind, FMoveKind::Gr2FrD | FMoveKind::Fr2GrD),
            Op::FCvt { kind, .. } => matches!(
                kind,
                FCvtKind::FromInt {
                    from: IntWidth::L,
                    ..
                } | FCvtKind::ToInt {
                    to: IntWidth::L,
                    ..
                }
            ),
            _ => false,
        }
    }

    /// Unconditionally leaves straight-line flow.
    pub fn is_control_transfer(&self) -> bool {
        matches!(
            self,
            Op::Branch { .. }
                | Op::BranchZero { .. }
                | Op::BranchFcc { .. }
                | Op::Jirl { .. }
                | Op::B { .. }
                | Op::Bl { .. }
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Field extraction
// ═══════════════════════════════════════════════════════════════════════════

#[inline]
fn rd(w: u32) -> u8 {
    (w & 0x1f) as u8
}

#[inline]
fn rj(w: u32) -> u8 {
    ((w >> 5) & 0x1f) as u8
}

#[inline]
fn rk(w: u32) -> u8 {
    ((w >> 10) & 0x1f) as u8
}

#[inline]
fn ra(w: u32) -> u8 {
    ((w >> 15) & 0x1f) as u8
}

#[inline]
fn si12(w: u32) -> i64 {
    sext(((w >> 10) & 0xfff) as u64, 12)
}

#[inline]
fn ui12(w: u32) -> i64 {
    ((w >> 10) & 0xfff) as i64
}

#[inline]
fn si14(w: u32) -> i64 {
    sext(((w >> 10) & 0x3fff) as u64, 14)
}

#[inline]
fn si16(w: u32) -> i64 {
    sext(((w >> 10) & 0xffff) as u64, 16)
}

#[inline]
fn si20(w: u32) -> i64 {
    sext(((w >> 5) & 0xf_ffff) as u64, 20)
}

/// 1RI21 branch offset in bytes.
#[inline]
fn offs21(w: u32) -> i64 {
    let raw = (((w & 0x1f) as u64) << 16) | ((w >> 10) & 0xffff) as u64;
    sext(raw, 21) << 2
}

/// I26 branch offset in bytes.
#[inline]
fn offs26(w: u32) -> i64 {
    let raw = (((w & 0x3ff) as u64) << 16) | ((w >> 10) & 0xffff) as u64;
    sext(raw, 26) << 2
}

/// 2RI16 branch offset in bytes.
#[inline]
fn offs16(w: u32) -> i64 {
    si16(w) << 2
}

// ═══════════════════════════════════════════════════════════════════════════
// Decoder
// ═══════════════════════════════════════════════════════════════════════════

/// Decode one instruction word.
pub fn decode(w: u32) -> Option<Op> {
    match w >> 26 {
        0x00 => decode_arith(w),
        0x01 => decode_privileged(w),
        0x02 => decode_fma(w),
        0x03 => decode_fcmp_fsel(w),
        0x04 => Some(Op::Addu16iD {
            rd: rd(w),
            rj: rj(w),
            imm: si16(w),
        }),
        0x05 => {
            let imm = si20(w);
            Some(if w & (1 << 25) == 0 {
                Op::Lu12iW { rd: rd(w), imm }
            } else {
                Op::Lu32iD { rd: rd(w), imm }
            })
        }
        0x06 | 0x07 => {
            let kind = match (w >> 25) & 3 {
                0 => PcRelKind::Addi,
                1 => PcRelKind::Alau12i,
                2 => PcRelKind::Addu12i,
                _ => PcRelKind::Addu18i,
            };
            Some(Op::PcRel {
                kind,
                rd: rd(w),
                imm: si20(w),
            })
        }
        0x08 => {
            let (rd, rj, offset) = (rd(w), rj(w), si14(w) << 2);
            Some(match (w >> 24) & 3 {
                0 => Op::Ll { d: false, rd, rj, offset },
                1 => Op::Sc { d: false, rd, rj, offset },
                2 => Op::Ll { d: true, rd, rj, offset },
                _ => Op::Sc { d: true, rd, rj, offset },
            })
        }
        0x09 => {
            let (rd, rj, offset) = (rd(w), rj(w), si14(w) << 2);
            Some(match (w >> 24) & 3 {
                0 => Op::Load { size: MemSize::W, signed: true, rd, rj, offset },
                1 => Op::Store { size: MemSize::W, rd, rj, offset },
                2 => Op::Load { size: MemSize::D, signed: true, rd, rj, offset },
                _ => Op::Store { size: MemSize::D, rd, rj, offset },
            })
        }
        0x0a => decode_load_store(w),
        0x0b => match (w >> 22) & 0xf {
            0 | 1 => Some(Op::Vector { asx: false }),
            2 | 3 => Some(Op::Vector { asx: true }),
            _ => None,
        },
        0x0c => Some(Op::Vector {
            asx: (w >> 25) & 1 != 0,
        }),
        0x0e => decode_indexed_atomic(w),
        0x10..=0x1b => decode_branch(w),
        0x1c => Some(Op::Vector { asx: false }),
        0x1d => Some(Op::Vector { asx: true }),
        _ => None,
    }
}

/// 0x00000000..0x03ffffff: integer ALU, bit ops, shifts, FP arithmetic and
/// the 2RI12 immediates.
fn decode_arith(w: u32) -> Option<Op> {
    match w >> 22 {
        0 => decode_alu(w),
        1 => decode_shift_bstr_w(w),
        2 | 3 => {
            let msb = ((w >> 16) & 0x3f) as u8;
            let lsb = ((w >> 10) & 0x3f) as u8;
            let (rd, rj) = (rd(w), rj(w));
            Some(if w >> 22 == 2 {
                Op::Bstrins { d: true, rd, rj, msb, lsb }
            } else {
                Op::Bstrpick { d: true, rd, rj, msb, lsb }
            })
        }
        4 => decode_float(w),
        op @ 0x8..=0xf => {
            let (rd, rj) = (rd(w), rj(w));
            if op == 0xc {
                return Some(Op::Lu52iD { rd, rj, imm: si12(w) });
            }
            let (op, imm) = match op {
                0x8 => (AluImmOp::Slti, si12(w)),
                0x9 => (AluImmOp::Sltui, si12(w)),
                0xa => (AluImmOp::AddiW, si12(w)),
                0xb => (AluImmOp::AddiD, si12(w)),
                0xd => (AluImmOp::Andi, ui12(w)),
                0xe => (AluImmOp::Ori, ui12(w)),
                _ => (AluImmOp::Xori, ui12(w)),
            };
            Some(Op::AluImm { op, rd, rj, imm })
        }
        _ => None,
    }
}

fn decode_alu(w: u32) -> Option<Op> {
    let (rd, rj, rk) = (rd(w), rj(w), rk(w));
    if w >> 15 == 0 {
        return decode_2r_int(w);
    }
    match w >> 15 {
        0x02 | 0x03 if rd == 0 => {
            return Some(Op::BoundCheck {
                gt: w >> 15 == 0x03,
                rj,
                rk,
            });
        }
        0x54 => return Some(Op::Break { code: (w & 0x7fff) as u16 }),
        0x56 => return Some(Op::Syscall { code: (w & 0x7fff) as u16 }),
        _ => {}
    }
    match w >> 17 {
        0x2 | 0x3 | 0x16 => {
            let kind = match w >> 17 {
                0x2 => AlslKind::W,
                0x3 => AlslKind::Wu,
                _ => AlslKind::D,
            };
            return Some(Op::Alsl {
                kind,
                rd,
                rj,
                rk,
                sa: ((w >> 15) & 3) as u8,
            });
        }
        0x4 => {
            return Some(Op::Bytepick {
                d: false,
                rd,
                rj,
                rk,
                sa: ((w >> 15) & 3) as u8,
            });
        }
        0x6 | 0x7 => {
            return Some(Op::Bytepick {
                d: true,
                rd,
                rj,
                rk,
                sa: ((w >> 15) & 7) as u8,
            });
        }
        _ => {}
    }
    let op = match w >> 15 {
        0x20 => AluOp::AddW,
        0x21 => AluOp::AddD,
        0x22 => AluOp::SubW,
        0x23 => AluOp::SubD,
        0x24 => AluOp::Slt,
        0x25 => AluOp::Sltu,
        0x26 => AluOp::Maskeqz,
        0x27 => AluOp::Masknez,
        0x28 => AluOp::Nor,
        0x29 => AluOp::And,
        0x2a => AluOp::Or,
        0x2b => AluOp::Xor,
        0x2c => AluOp::Orn,
        0x2d => AluOp::Andn,
        0x2e => AluOp::SllW,
        0x2f => AluOp::SrlW,
        0x30 => AluOp::SraW,
        0x31 => AluOp::SllD,
        0x32 => AluOp::SrlD,
        0x33 => AluOp::SraD,
        0x36 => AluOp::RotrW,
        0x37 => AluOp::RotrD,
        0x38 => AluOp::MulW,
        0x39 => AluOp::MulhW,
        0x3a => AluOp::MulhWu,
        0x3b => AluOp::MulD,
        0x3c => AluOp::MulhD,
        0x3d => AluOp::MulhDu,
        0x3e => AluOp::MulwDW,
        0x3f => AluOp::MulwDWu,
        0x40 => AluOp::DivW,
        0x41 => AluOp::ModW,
        0x42 => AluOp::DivWu,
        0x43 => AluOp::ModWu,
        0x44 => AluOp::DivD,
        0x45 => AluOp::ModD,
        0x46 => AluOp::DivDu,
        0x47 => AluOp::ModDu,
        _ => return None,
    };
    Some(Op::Alu { op, rd, rj, rk })
}

/// 2R integer space: w >> 10 in 0x04..=0x1b.
fn decode_2r_int(w: u32) -> Option<Op> {
    let (rd, rj) = (rd(w), rj(w));
    let op = match w >> 10 {
        0x04 => BitOp::CloW,
        0x05 => BitOp::ClzW,
        0x06 => BitOp::CtoW,
        0x07 => BitOp::CtzW,
        0x08 => BitOp::CloD,
        0x09 => BitOp::ClzD,
        0x0a => BitOp::CtoD,
        0x0b => BitOp::CtzD,
        0x0c => BitOp::Revb2h,
        0x0d => BitOp::Revb4h,
        0x0e => BitOp::Revb2w,
        0x0f => BitOp::RevbD,
        0x10 => BitOp::Revh2w,
        0x11 => BitOp::RevhD,
        0x12 => BitOp::Bitrev4b,
        0x13 => BitOp::Bitrev8b,
        0x14 => BitOp::BitrevW,
        0x15 => BitOp::BitrevD,
        0x16 => BitOp::ExtWH,
        0x17 => BitOp::ExtWB,
        0x18 => return Some(Op::Rdtime { kind: RdtimeKind::LowW, rd, rj }),
        0x19 => return Some(Op::Rdtime { kind: RdtimeKind::HighW, rd, rj }),
        0x1a => return Some(Op::Rdtime { kind: RdtimeKind::D, rd, rj }),
        0x1b => return Some(Op::Cpucfg { rd, rj }),
        _ => return None,
    };
    Some(Op::Bit { op, rd, rj })
}

/// 0x00400000..0x007fffff: immediate shifts/rotates and bstr*.w.
fn decode_shift_bstr_w(w: u32) -> Option<Op> {
    let (rd, rj) = (rd(w), rj(w));
    if w >> 21 == 0x3 {
        let msb = ((w >> 16) & 0x1f) as u8;
        let lsb = ((w >> 10) & 0x1f) as u8;
        return Some(if w & (1 << 15) == 0 {
            Op::Bstrins { d: false, rd, rj, msb, lsb }
        } else {
            Op::Bstrpick { d: false, rd, rj, msb, lsb }
        });
    }
    let ui5 = ((w >> 10) & 0x1f) as i64;
    let ui6 = ((w >> 10) & 0x3f) as i64;
    let (op, imm) = match (w >> 15, w >> 16) {
        (0x81, _) => (AluImmOp::SlliW, ui5),
        (_, 0x41) => (AluImmOp::SlliD, ui6),
        (0x89, _) => (AluImmOp::SrliW, ui5),
        (_, 0x45) => (AluImmOp::SrliD, ui6),
        (0x91, _) => (AluImmOp::SraiW, ui5),
        (_, 0x49) => (AluImmOp::SraiD, ui6),
        (0x99, _) => (AluImmOp::RotriW, ui5),
        (_, 0x4d) => (AluImmOp::RotriD, ui6),
        _ => return None,
    };
    Some(Op::AluImm { op, rd, rj, imm })
}

/// 0x01000000..0x013fffff: scalar FP arithmetic, moves and conversions.
fn decode_float(w: u32) -> Option<Op> {
    let (fd, fj, fk) = (rd(w), rj(w), rk(w));

    // 3R: fadd .. fcopysign, {s, d} pairs every four opcodes
    let n = (w >> 15).wrapping_sub(0x200);
    if (1..=0x26).contains(&n) {
        let fmt = match n & 3 {
            1 => FpFmt::S,
            2 => FpFmt::D,
            _ => return None,
        };
        let op = match (n - 1) / 4 {
            0 => FBinOp::Add,
            1 => FBinOp::Sub,
            2 => FBinOp::Mul,
            3 => FBinOp::Div,
            4 => FBinOp::Max,
            5 => FBinOp::Min,
            6 => FBinOp::MaxA,
            7 => FBinOp::MinA,
            8 => FBinOp::Scaleb,
            _ => FBinOp::CopySign,
        };
        return Some(Op::FBinary { op, fmt, fd, fj, fk });
    }

    let fmt_of = |code: u32| if code & 1 == 1 { FpFmt::S } else { FpFmt::D };
    let unary = |op: FUnOp, code: u32| Op::FUnary {
        op,
        fmt: fmt_of(code),
        fd,
        fj,
    };
    let mv = |kind: FMoveKind, dst: u8, src: u8| Some(Op::FMove { kind, dst, src });
    let to_int = |to: IntWidth, code: u32, round: Option<RoundMode>| {
        Some(Op::FCvt {
            kind: FCvtKind::ToInt {
                to,
                from: fmt_of(code),
                round,
            },
            fd,
            fj,
        })
    };

    let code = w >> 10;
    match code {
        0x4501 | 0x4502 => Some(unary(FUnOp::Abs, code)),
        0x4505 | 0x4506 => Some(unary(FUnOp::Neg, code)),
        0x4509 | 0x450a => Some(unary(FUnOp::Logb, code)),
        0x450d | 0x450e => Some(Op::FClass {
            fmt: fmt_of(code),
            fd,
            fj,
        }),
        0x4511 | 0x4512 => Some(unary(FUnOp::Sqrt, code)),
        0x4515 | 0x4516 => Some(unary(FUnOp::Recip, code)),
        0x4519 | 0x451a => Some(unary(FUnOp::Rsqrt, code)),
        0x4525 | 0x4526 => Some(unary(FUnOp::Mov, code)),
        0x4529 => mv(FMoveKind::Gr2FrW, fd, fj),
        0x452a => mv(FMoveKind::Gr2FrD, fd, fj),
        0x452b => mv(FMoveKind::Gr2FrhW, fd, fj),
        0x452d => mv(FMoveKind::Fr2GrS, fd, fj),
        0x452e => mv(FMoveKind::Fr2GrD, fd, fj),
        0x452f => mv(FMoveKind::Frh2GrS, fd, fj),
        0x4530 if fd < 4 => mv(FMoveKind::Gr2Fcsr, fd, fj),
        0x4532 if fj < 4 => mv(FMoveKind::Fcsr2Gr, fd, fj),
        0x4534 if fd < 8 => mv(FMoveKind::Fr2Cf, fd, fj),
        0x4535 if fj < 8 => mv(FMoveKind::Cf2Fr, fd, fj),
        0x4536 if fd < 8 => mv(FMoveKind::Gr2Cf, fd, fj),
        0x4537 if fj < 8 => mv(FMoveKind::Cf2Gr, fd, fj),
        0x4646 => Some(Op::FCvt {
            kind: FCvtKind::SingleFromDouble,
            fd,
            fj,
        }),
        0x4649 => Some(Op::FCvt {
            kind: FCvtKind::DoubleFromSingle,
            fd,
            fj,
        }),
        0x4681 | 0x4682 => to_int(IntWidth::W, code, Some(RoundMode::Down)),
        0x4689 | 0x468a => to_int(IntWidth::L, code, Some(RoundMode::Down)),
        0x4691 | 0x4692 => to_int(IntWidth::W, code, Some(RoundMode::Up)),
        0x4699 | 0x469a => to_int(IntWidth::L, code, Some(RoundMode::Up)),
        0x46a1 | 0x46a2 => to_int(IntWidth::W, code, Some(RoundMode::Zero)),
        0x46a9 | 0x46aa => to_int(IntWidth::L, code, Some(RoundMode::Zero)),
        0x46b1 | 0x46b2 => to_int(IntWidth::W, code, Some(RoundMode::NearestEven)),
        0x46b9 | 0x46ba => to_int(IntWidth::L, code, Some(RoundMode::NearestEven)),
        0x46c1 | 0x46c2 => to_int(IntWidth::W, code, None),
        0x46c9 | 0x46ca => to_int(IntWidth::L, code, None),
        0x4744 | 0x4746 | 0x4748 | 0x474a => {
            let to = if code < 0x4748 { FpFmt::S } else { FpFmt::D };
            let from = if code & 2 == 0 { IntWidth::W } else { IntWidth::L };
            Some(Op::FCvt {
                kind: FCvtKind::FromInt { to, from },
                fd,
                fj,
            })
        }
        0x4791 | 0x4792 => Some(unary(FUnOp::Rint, code)),
        _ => None,
    }
}

/// 0x04000000..0x07ffffff: CSR, cache, page walk, IOCSR and TLB.
fn decode_privileged(w: u32) -> Option<Op> {
    let (rd, rj, rk) = (rd(w), rj(w), rk(w));
    if w >> 24 == 0x04 {
        let csr = ((w >> 10) & 0x3fff) as u16;
        return Some(match rj {
            0 => Op::Csrrd { rd, csr },
            1 => Op::Csrwr { rd, csr },
            _ => Op::Csrxchg { rd, rj, csr },
        });
    }
    if w >> 22 == 0x18 {
        return Some(Op::Cacop {
            code: rd,
            rj,
            offset: si12(w),
        });
    }
    match w >> 18 {
        0x190 => {
            return Some(Op::Lddir {
                rd,
                rj,
                level: ((w >> 10) & 0xff) as u8,
            });
        }
        0x191 if rd == 0 => {
            return Some(Op::Ldpte {
                rj,
                seq: ((w >> 10) & 0xff) as u8,
            });
        }
        _ => {}
    }
    match w >> 10 {
        code @ 0x19200..=0x19203 => {
            return Some(Op::Iocsrrd {
                size: MemSize::from_index(code),
                rd,
                rj,
            });
        }
        code @ 0x19204..=0x19207 => {
            return Some(Op::Iocsrwr {
                size: MemSize::from_index(code),
                rd,
                rj,
            });
        }
        _ => {}
    }
    match w {
        0x0648_2000 => return Some(Op::Tlb(TlbOp::Clr)),
        0x0648_2400 => return Some(Op::Tlb(TlbOp::Flush)),
        0x0648_2800 => return Some(Op::Tlb(TlbOp::Srch)),
        0x0648_2c00 => return Some(Op::Tlb(TlbOp::Rd)),
        0x0648_3000 => return Some(Op::Tlb(TlbOp::Wr)),
        0x0648_3400 => return Some(Op::Tlb(TlbOp::Fill)),
        0x0648_3800 => return Some(Op::Ertn),
        _ => {}
    }
    match w >> 15 {
        0xc91 => Some(Op::Idle {
            level: (w & 0x7fff) as u16,
        }),
        0xc93 => Some(Op::Invtlb { op: rd, rj, rk }),
        _ => None,
    }
}

/// 0x08000000..0x0bffffff: fused multiply-add; LSX/LASX 4R.
fn decode_fma(w: u32) -> Option<Op> {
    let kind = match w >> 20 {
        0x081 | 0x082 => FmaKind::MAdd,
        0x085 | 0x086 => FmaKind::MSub,
        0x089 | 0x08a => FmaKind::NMAdd,
        0x08d | 0x08e => FmaKind::NMSub,
        _ => {
            return match w >> 24 {
                0x09 => Some(Op::Vector { asx: false }),
                0x0a => Some(Op::Vector { asx: true }),
                _ => None,
            };
        }
    };
    let fmt = if (w >> 20) & 1 == 1 { FpFmt::S } else { FpFmt::D };
    Some(Op::FMulAdd {
        kind,
        fmt,
        fd: rd(w),
        fj: rj(w),
        fk: rk(w),
        fa: ra(w),
    })
}

/// 0x0c000000..0x0fffffff: fcmp.cond, fsel; LSX/LASX compare and select.
fn decode_fcmp_fsel(w: u32) -> Option<Op> {
    match w >> 20 {
        0x0c1 | 0x0c2 if (w >> 3) & 3 == 0 => {
            let cond = ((w >> 15) & 0x1f) as u8;
            Some(Op::FCmp {
                cond,
                fmt: if w >> 20 == 0x0c1 { FpFmt::S } else { FpFmt::D },
                cd: (w & 7) as u8,
                fj: rj(w),
                fk: rk(w),
            })
        }
        0x0c5 | 0x0d1 | 0x0d5 => Some(Op::Vector { asx: false }),
        0x0c6 | 0x0d2 | 0x0d6 => Some(Op::Vector { asx: true }),
        _ if w >> 18 == 0x340 => Some(Op::FSel {
            fd: rd(w),
            fj: rj(w),
            fk: rk(w),
            ca: ((w >> 15) & 7) as u8,
        }),
        _ => None,
    }
}

/// 0x28000000..0x2bffffff: 2RI12 loads, stores, preld and FP loads/stores.
fn decode_load_store(w: u32) -> Option<Op> {
    let (rd, rj, offset) = (rd(w), rj(w), si12(w));
    let sub = (w >> 22) & 0xf;
    Some(match sub {
        0..=3 => Op::Load {
            size: MemSize::from_index(sub),
            signed: true,
            rd,
            rj,
            offset,
        },
        4..=7 => Op::Store {
            size: MemSize::from_index(sub),
            rd,
            rj,
            offset,
        },
        8..=0xa => Op::Load {
            size: MemSize::from_index(sub),
            signed: false,
            rd,
            rj,
            offset,
        },
        0xb => Op::Preld {
            hint: rd,
            rj,
            offset,
        },
        0xc => Op::FLoad { double: false, fd: rd, rj, offset },
        0xd => Op::FStore { double: false, fd: rd, rj, offset },
        0xe => Op::FLoad { double: true, fd: rd, rj, offset },
        _ => Op::FStore { double: true, fd: rd, rj, offset },
    })
}

/// 0x38000000..0x3bffffff: indexed memory, AM* atomics and barriers.
fn decode_indexed_atomic(w: u32) -> Option<Op> {
    let (rd, rj, rk) = (rd(w), rj(w), rk(w));
    let op15 = w >> 15;

    if (0x70c0..=0x70e3).contains(&op15) {
        let n = op15 - 0x70c0;
        let index = n / 2;
        let op = match index % 9 {
            0 => AmoOp::Swap,
            1 => AmoOp::Add,
            2 => AmoOp::And,
            3 => AmoOp::Or,
            4 => AmoOp::Xor,
            5 => AmoOp::Max,
            6 => AmoOp::Min,
            7 => AmoOp::MaxU,
            _ => AmoOp::MinU,
        };
        return Some(Op::Amo {
            op,
            d: n & 1 == 1,
            db: index >= 9,
            rd,
            rj,
            rk,
        });
    }
    match op15 {
        0x70e4 => return Some(Op::Dbar { hint: (w & 0x7fff) as u16 }),
        0x70e5 => return Some(Op::Ibar { hint: (w & 0x7fff) as u16 }),
        _ => {}
    }

    if (w >> 15) & 7 != 0 {
        return None;
    }
    let sub = (w >> 18).wrapping_sub(0xe00);
    Some(match sub {
        0..=3 => Op::LoadIndexed {
            size: MemSize::from_index(sub),
            signed: true,
            rd,
            rj,
            rk,
        },
        4..=7 => Op::StoreIndexed {
            size: MemSize::from_index(sub),
            rd,
            rj,
            rk,
        },
        8..=0xa => Op::LoadIndexed {
            size: MemSize::from_index(sub),
            signed: false,
            rd,
            rj,
            rk,
        },
        0xb => Op::Preldx { hint: rd, rj, rk },
        0xc => Op::FLoadIndexed { double: false, fd: rd, rj, rk },
        0xd => Op::FLoadIndexed { double: true, fd: rd, rj, rk },
        0xe => Op::FStoreIndexed { double: false, fd: rd, rj, rk },
        0xf => Op::FStoreIndexed { double: true, fd: rd, rj, rk },
        0x10 | 0x11 => Op::Vector { asx: false },
        0x12 | 0x13 => Op::Vector { asx: true },
        _ => return None,
    })
}

/// 0x40000000..0x6fffffff: branches and jumps.
fn decode_branch(w: u32) -> Option<Op> {
    let (rd, rj) = (rd(w), rj(w));
    let cond = |cond: BranchCond| {
        Some(Op::Branch {
            cond,
            rj,
            rd,
            offset: offs16(w),
        })
    };
    match w >> 26 {
        0x10 => Some(Op::BranchZero {
            nez: false,
            rj,
            offset: offs21(w),
        }),
        0x11 => Some(Op::BranchZero {
            nez: true,
            rj,
            offset: offs21(w),
        }),
        0x12 => match (w >> 8) & 3 {
            0 | 1 => Some(Op::BranchFcc {
                nez: (w >> 8) & 1 == 1,
                cj: ((w >> 5) & 7) as u8,
                offset: offs21(w),
            }),
            _ => None,
        },
        0x13 => Some(Op::Jirl {
            rd,
            rj,
            offset: offs16(w),
        }),
        0x14 => Some(Op::B { offset: offs26(w) }),
        0x15 => Some(Op::Bl { offset: offs26(w) }),
        0x16 => cond(BranchCond::Eq),
        0x17 => cond(BranchCond::Ne),
        0x18 => cond(BranchCond::Lt),
        0x19 => cond(BranchCond::Ge),
        0x1a => cond(BranchCond::Ltu),
        0x1b => cond(BranchCond::Geu),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod encode {
    //! Instruction-word builders shared by decoder, emitter and engine tests.

    pub fn r2(op: u32, rd: u32, rj: u32) -> u32 {
        op | (rj << 5) | rd
    }

    pub fn r3(op: u32, rd: u32, rj: u32, rk: u32) -> u32 {
        op | (rk << 10) | (rj << 5) | rd
    }

    pub fn r4(op: u32, rd: u32, rj: u32, rk: u32, ra: u32) -> u32 {
        op | (ra << 15) | (rk << 10) | (rj << 5) | rd
    }

    pub fn ri12(op: u32, rd: u32, rj: u32, imm: i32) -> u32 {
        op | (((imm as u32) & 0xfff) << 10) | (rj << 5) | rd
    }

    pub fn ri14(op: u32, rd: u32, rj: u32, imm: i32) -> u32 {
        op | (((imm as u32) & 0x3fff) << 10) | (rj << 5) | rd
    }

    pub fn ri16(op: u32, rd: u32, rj: u32, imm: i32) -> u32 {
        op | (((imm as u32) & 0xffff) << 10) | (rj << 5) | rd
    }

    pub fn ri20(op: u32, rd: u32, imm: i32) -> u32 {
        op | (((imm as u32) & 0xf_ffff) << 5) | rd
    }

    /// beqz/bnez/bceqz/bcnez with a byte offset.
    pub fn b21(op: u32, rj: u32, offset: i32) -> u32 {
        let words = (offset >> 2) as u32;
        op | ((words & 0xffff) << 10) | (rj << 5) | ((words >> 16) & 0x1f)
    }

    /// b/bl with a byte offset.
    pub fn b26(op: u32, offset: i32) -> u32 {
        let words = (offset >> 2) as u32;
        op | ((words & 0xffff) << 10) | ((words >> 16) & 0x3ff)
    }

    /// beq..bgeu and jirl with a byte offset.
    pub fn b16(op: u32, rj: u32, rd: u32, offset: i32) -> u32 {
        ri16(op, rd, rj, offset >> 2)
    }

    pub fn csr(op: u32, rd: u32, rj: u32, csr: u32) -> u32 {
        op | (csr << 10) | (rj << 5) | rd
    }

    pub const ADD_W: u32 = 0x0010_0000;
    pub const ADD_D: u32 = 0x0010_8000;
    pub const SUB_D: u32 = 0x0011_8000;
    pub const SLT: u32 = 0x0012_0000;
    pub const OR: u32 = 0x0015_0000;
    pub const MUL_D: u32 = 0x001d_8000;
    pub const DIV_D: u32 = 0x0022_0000;
    pub const MOD_DU: u32 = 0x0023_8000;
    pub const ADDI_W: u32 = 0x0280_0000;
    pub const ADDI_D: u32 = 0x02c0_0000;
    pub const ORI: u32 = 0x0380_0000;
    pub const LU12I_W: u32 = 0x1400_0000;
    pub const LU32I_D: u32 = 0x1600_0000;
    pub const LU52I_D: u32 = 0x0300_0000;
    pub const PCADDU12I: u32 = 0x1c00_0000;
    pub const LD_B: u32 = 0x2800_0000;
    pub const LD_W: u32 = 0x2880_0000;
    pub const LD_D: u32 = 0x28c0_0000;
    pub const ST_W: u32 = 0x2980_0000;
    pub const ST_D: u32 = 0x29c0_0000;
    pub const LD_BU: u32 = 0x2a00_0000;
    pub const FLD_D: u32 = 0x2b80_0000;
    pub const FST_D: u32 = 0x2bc0_0000;
    pub const LL_W: u32 = 0x2000_0000;
    pub const SC_W: u32 = 0x2100_0000;
    pub const AMADD_D: u32 = 0x3861_8000;
    pub const AMSWAP_DB_W: u32 = 0x3869_0000;
    pub const BEQZ: u32 = 0x4000_0000;
    pub const BNEZ: u32 = 0x4400_0000;
    pub const BCNEZ: u32 = 0x4800_0100;
    pub const JIRL: u32 = 0x4c00_0000;
    pub const B: u32 = 0x5000_0000;
    pub const BL: u32 = 0x5400_0000;
    pub const BEQ: u32 = 0x5800_0000;
    pub const BNE: u32 = 0x5c00_0000;
    pub const BLT: u32 = 0x6000_0000;
    pub const CSRRD: u32 = 0x0400_0000;
    pub const CSRWR: u32 = 0x0400_0020;
    pub const SYSCALL: u32 = 0x002b_0000;
    pub const BREAK: u32 = 0x002a_0000;
    pub const ERTN: u32 = 0x0648_3800;
    pub const IDLE: u32 = 0x0648_8000;
    pub const TLBFILL: u32 = 0x0648_3400;
    pub const TLBSRCH: u32 = 0x0648_2800;
    pub const INVTLB: u32 = 0x0649_8000;
    pub const CPUCFG: u32 = 0x0000_6c00;
    pub const RDTIME_D: u32 = 0x0000_6800;
    pub const FADD_D: u32 = 0x0101_0000;
    pub const FMUL_S: u32 = 0x0104_8000;
    pub const FSQRT_D: u32 = 0x0114_4800;
    pub const FMADD_D: u32 = 0x0820_0000;
    pub const FCMP_D: u32 = 0x0c20_0000;
    pub const FSEL: u32 = 0x0d00_0000;
    pub const MOVGR2FR_D: u32 = 0x0114_a800;
    pub const MOVFR2GR_D: u32 = 0x0114_b800;
    pub const MOVGR2FCSR: u32 = 0x0114_c000;
    pub const FFINT_D_L: u32 = 0x011d_2800;
    pub const FTINTRZ_W_D: u32 = 0x011a_8800;
    pub const NOP: u32 = 0x0340_0000;
}

#[cfg(test)]
mod tests {
    use super::encode::*;
    use super::*;

    #[test]
    fn test_decode_alu() {
        assert_eq!(
            decode(r3(ADD_W, 4, 5, 6)),
            Some(Op::Alu { op: AluOp::AddW, rd: 4, rj: 5, rk: 6 })
        );
        assert_eq!(
            decode(r3(MOD_DU, 1, 2, 3)),
            Some(Op::Alu { op: AluOp::ModDu, rd: 1, rj: 2, rk: 3 })
        );
        assert_eq!(
            decode(r3(0x001b_8000, 1, 2, 3)),
            Some(Op::Alu { op: AluOp::RotrD, rd: 1, rj: 2, rk: 3 })
        );
        // Gap between sra.d and rotr.w
        assert_eq!(decode(r3(0x001a_0000, 1, 2, 3)), None);
    }

    #[test]
    fn test_decode_immediates() {
        assert_eq!(
            decode(ri12(ADDI_D, 3, 3, -16)),
            Some(Op::AluImm { op: AluImmOp::AddiD, rd: 3, rj: 3, imm: -16 })
        );
        // Logical immediates are zero-extended
        assert_eq!(
            decode(ri12(ORI, 4, 0, 0xfff)),
            Some(Op::AluImm { op: AluImmOp::Ori, rd: 4, rj: 0, imm: 0xfff })
        );
        assert_eq!(
            decode(ri20(LU12I_W, 7, -1)),
            Some(Op::Lu12iW { rd: 7, imm: -1 })
        );
        assert_eq!(
            decode(ri20(LU32I_D, 7, 0x12345)),
            Some(Op::Lu32iD { rd: 7, imm: 0x12345 })
        );
        assert_eq!(
            decode(ri12(LU52I_D, 7, 7, 0x800)),
            Some(Op::Lu52iD { rd: 7, rj: 7, imm: -0x800 })
        );
        assert_eq!(
            decode(ri20(PCADDU12I, 1, 2)),
            Some(Op::PcRel { kind: PcRelKind::Addu12i, rd: 1, imm: 2 })
        );
        assert_eq!(
            decode(ri20(0x1a00_0000, 1, 2)),
            Some(Op::PcRel { kind: PcRelKind::Alau12i, rd: 1, imm: 2 })
        );
    }

    #[test]
    fn test_decode_shifts_and_bitfields() {
        assert_eq!(
            decode(0x0041_0000 | (63 << 10) | (2 << 5) | 1),
            Some(Op::AluImm { op: AluImmOp::SlliD, rd: 1, rj: 2, imm: 63 })
        );
        assert_eq!(
            decode(0x0048_8000 | (31 << 10) | (2 << 5) | 1),
            Some(Op::AluImm { op: AluImmOp::SraiW, rd: 1, rj: 2, imm: 31 })
        );
        // bstrpick.d rd, rj, 47, 12
        assert_eq!(
            decode(0x00c0_0000 | (47 << 16) | (12 << 10) | (2 << 5) | 1),
            Some(Op::Bstrpick { d: true, rd: 1, rj: 2, msb: 47, lsb: 12 })
        );
        // bstrins.w rd, rj, 15, 8
        assert_eq!(
            decode(0x0060_0000 | (15 << 16) | (8 << 10) | (2 << 5) | 1),
            Some(Op::Bstrins { d: false, rd: 1, rj: 2, msb: 15, lsb: 8 })
        );
        assert_eq!(
            decode(r2(0x0000_1400, 1, 2)),
            Some(Op::Bit { op: BitOp::ClzW, rd: 1, rj: 2 })
        );
        assert_eq!(
            decode(r2(0x0000_5c00, 1, 2)),
            Some(Op::Bit { op: BitOp::ExtWB, rd: 1, rj: 2 })
        );
        assert_eq!(
            decode(0x002c_0000 | (2 << 15) | (3 << 10) | (2 << 5) | 1),
            Some(Op::Alsl { kind: AlslKind::D, rd: 1, rj: 2, rk: 3, sa: 2 })
        );
        assert_eq!(
            decode(0x000c_0000 | (5 << 15) | (3 << 10) | (2 << 5) | 1),
            Some(Op::Bytepick { d: true, rd: 1, rj: 2, rk: 3, sa: 5 })
        );
    }

    #[test]
    fn test_decode_memory() {
        assert_eq!(
            decode(ri12(LD_B, 1, 2, -1)),
            Some(Op::Load { size: MemSize::B, signed: true, rd: 1, rj: 2, offset: -1 })
        );
        assert_eq!(
            decode(ri12(LD_BU, 1, 2, 8)),
            Some(Op::Load { size: MemSize::B, signed: false, rd: 1, rj: 2, offset: 8 })
        );
        assert_eq!(
            decode(ri12(ST_D, 1, 2, 16)),
            Some(Op::Store { size: MemSize::D, rd: 1, rj: 2, offset: 16 })
        );
        assert_eq!(
            decode(ri12(FLD_D, 4, 2, 8)),
            Some(Op::FLoad { double: true, fd: 4, rj: 2, offset: 8 })
        );
        // ldptr.d scales by 4
        assert_eq!(
            decode(ri14(0x2600_0000, 1, 2, 3)),
            Some(Op::Load { size: MemSize::D, signed: true, rd: 1, rj: 2, offset: 12 })
        );
        assert_eq!(
            decode(ri14(SC_W, 1, 2, -1)),
            Some(Op::Sc { d: false, rd: 1, rj: 2, offset: -4 })
        );
        assert_eq!(
            decode(r3(0x3828_0000, 1, 2, 3)),
            Some(Op::LoadIndexed { size: MemSize::W, signed: false, rd: 1, rj: 2, rk: 3 })
        );
        assert_eq!(
            decode(r3(0x3834_0000, 1, 2, 3)),
            Some(Op::FLoadIndexed { double: true, fd: 1, rj: 2, rk: 3 })
        );
    }

    #[test]
    fn test_decode_atomics_and_barriers() {
        assert_eq!(
            decode(r3(AMADD_D, 1, 2, 3)),
            Some(Op::Amo { op: AmoOp::Add, d: true, db: false, rd: 1, rj: 2, rk: 3 })
        );
        assert_eq!(
            decode(r3(AMSWAP_DB_W, 1, 2, 3)),
            Some(Op::Amo { op: AmoOp::Swap, d: false, db: true, rd: 1, rj: 2, rk: 3 })
        );
        assert_eq!(
            decode(r3(0x3871_8000, 1, 2, 3)),
            Some(Op::Amo { op: AmoOp::MinU, d: true, db: true, rd: 1, rj: 2, rk: 3 })
        );
        assert_eq!(decode(0x3872_0000), Some(Op::Dbar { hint: 0 }));
        assert_eq!(decode(0x3872_8000), Some(Op::Ibar { hint: 0 }));
    }

    #[test]
    fn test_decode_branches() {
        assert_eq!(
            decode(b21(BEQZ, 4, -8)),
            Some(Op::BranchZero { nez: false, rj: 4, offset: -8 })
        );
        assert_eq!(
            decode(b21(BNEZ, 4, 0x10_0000)),
            Some(Op::BranchZero { nez: true, rj: 4, offset: 0x10_0000 })
        );
        assert_eq!(
            decode(b21(BCNEZ, 2, 64)),
            Some(Op::BranchFcc { nez: true, cj: 2, offset: 64 })
        );
        assert_eq!(decode(b26(B, -4)), Some(Op::B { offset: -4 }));
        assert_eq!(decode(b26(BL, 0x800_0000 - 4)), Some(Op::Bl { offset: 0x800_0000 - 4 }));
        assert_eq!(
            decode(b16(BLT, 5, 6, 32)),
            Some(Op::Branch { cond: BranchCond::Lt, rj: 5, rd: 6, offset: 32 })
        );
        assert_eq!(
            decode(b16(JIRL, 1, 0, 0)),
            Some(Op::Jirl { rd: 0, rj: 1, offset: 0 })
        );
    }

    #[test]
    fn test_decode_privileged() {
        assert_eq!(decode(csr(CSRRD, 4, 0, 0x5)), Some(Op::Csrrd { rd: 4, csr: 5 }));
        assert_eq!(decode(csr(CSRWR, 4, 0, 0x180)), Some(Op::Csrwr { rd: 4, csr: 0x180 }));
        assert_eq!(
            decode(csr(CSRRD, 4, 7, 0x18)),
            Some(Op::Csrxchg { rd: 4, rj: 7, csr: 0x18 })
        );
        assert_eq!(decode(ERTN), Some(Op::Ertn));
        assert_eq!(decode(TLBFILL), Some(Op::Tlb(TlbOp::Fill)));
        assert_eq!(decode(IDLE | 3), Some(Op::Idle { level: 3 }));
        assert_eq!(
            decode(r3(INVTLB, 5, 1, 2)),
            Some(Op::Invtlb { op: 5, rj: 1, rk: 2 })
        );
        assert_eq!(
            decode(0x0640_0000 | (2 << 10) | (5 << 5) | 6),
            Some(Op::Lddir { rd: 6, rj: 5, level: 2 })
        );
        assert_eq!(
            decode(0x0644_0000 | (1 << 10) | (5 << 5)),
            Some(Op::Ldpte { rj: 5, seq: 1 })
        );
        assert_eq!(
            decode(r2(0x0648_0c00, 1, 2)),
            Some(Op::Iocsrrd { size: MemSize::D, rd: 1, rj: 2 })
        );
        assert_eq!(decode(SYSCALL | 0x11), Some(Op::Syscall { code: 0x11 }));
        assert_eq!(decode(BREAK | 1), Some(Op::Break { code: 1 }));
        assert!(decode(ERTN).is_some_and(|op| op.is_privileged()));
    }

    #[test]
    fn test_decode_float() {
        assert_eq!(
            decode(r3(FADD_D, 1, 2, 3)),
            Some(Op::FBinary { op: FBinOp::Add, fmt: FpFmt::D, fd: 1, fj: 2, fk: 3 })
        );
        assert_eq!(
            decode(r3(FMUL_S, 1, 2, 3)),
            Some(Op::FBinary { op: FBinOp::Mul, fmt: FpFmt::S, fd: 1, fj: 2, fk: 3 })
        );
        assert_eq!(
            decode(r3(0x0113_0000, 1, 2, 3)),
            Some(Op::FBinary { op: FBinOp::CopySign, fmt: FpFmt::D, fd: 1, fj: 2, fk: 3 })
        );
        assert_eq!(
            decode(r2(FSQRT_D, 1, 2)),
            Some(Op::FUnary { op: FUnOp::Sqrt, fmt: FpFmt::D, fd: 1, fj: 2 })
        );
        assert_eq!(
            decode(r4(FMADD_D, 1, 2, 3, 4)),
            Some(Op::FMulAdd { kind: FmaKind::MAdd, fmt: FpFmt::D, fd: 1, fj: 2, fk: 3, fa: 4 })
        );
        assert_eq!(
            decode(FCMP_D | (0x4 << 15) | (3 << 10) | (2 << 5) | 1),
            Some(Op::FCmp { cond: 4, fmt: FpFmt::D, cd: 1, fj: 2, fk: 3 })
        );
        assert_eq!(
            decode(FSEL | (2 << 15) | (3 << 10) | (2 << 5) | 1),
            Some(Op::FSel { fd: 1, fj: 2, fk: 3, ca: 2 })
        );
        assert_eq!(
            decode(r2(FTINTRZ_W_D, 1, 2)),
            Some(Op::FCvt {
                kind: FCvtKind::ToInt { to: IntWidth::W, from: FpFmt::D, round: Some(RoundMode::Zero) },
                fd: 1,
                fj: 2
            })
        );
        assert_eq!(
            decode(r2(FFINT_D_L, 1, 2)),
            Some(Op::FCvt {
                kind: FCvtKind::FromInt { to: FpFmt::D, from: IntWidth::L },
                fd: 1,
                fj: 2
            })
        );
        assert_eq!(
            decode(r2(MOVGR2FCSR, 3, 5)),
            Some(Op::FMove { kind: FMoveKind::Gr2Fcsr, dst: 3, src: 5 })
        );
        assert_eq!(decode(r2(MOVGR2FCSR, 4, 5)), None);
    }

    #[test]
    fn test_decode_vector_and_reserved() {
        assert_eq!(decode(0x2c00_0000), Some(Op::Vector { asx: false }));
        assert_eq!(decode(0x2c80_0000), Some(Op::Vector { asx: true }));
        assert_eq!(decode(0x7000_0000), Some(Op::Vector { asx: false }));
        assert_eq!(decode(0x7400_0000), Some(Op::Vector { asx: true }));
        assert_eq!(decode(0x0000_0000), None);
        assert_eq!(decode(0xffff_ffff), None);
        assert_eq!(decode(0x3800_8000), None);
    }

    #[test]
    fn test_la64_only_classification() {
        let add_d = decode(r3(ADD_D, 1, 2, 3)).unwrap();
        let add_w = decode(r3(ADD_W, 1, 2, 3)).unwrap();
        assert!(add_d.requires_la64());
        assert!(!add_w.requires_la64());
        assert!(decode(ri12(LD_D, 1, 2, 0)).unwrap().requires_la64());
        assert!(!decode(ri12(LD_W, 1, 2, 0)).unwrap().requires_la64());
        assert!(decode(r3(FADD_D, 1, 2, 3)).unwrap().uses_fpu());
    }

    #[test]
    fn test_nop_is_andi() {
        assert_eq!(
            decode(NOP),
            Some(Op::AluImm { op: AluImmOp::Andi, rd: 0, rj: 0, imm: 0 })
        );
    }
}
