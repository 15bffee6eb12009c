//! Integer ALU, bit-manipulation and immediate-load instructions.

use super::{BlockState, Translator};
use crate::cpu::Exception;
use crate::engine::decoder::{AluImmOp, AluOp, AlslKind, BitOp, Op, PcRelKind};
use crate::ir::{Backend, BinOp, Cond, IrOp, Operand, Place, UnOp, Width};

fn alu_binop(op: AluOp) -> Option<(BinOp, Width)> {
    use AluOp::*;
    use Width::*;
    Some(match op {
        AddW => (BinOp::Add, W32),
        AddD => (BinOp::Add, W64),
        SubW => (BinOp::Sub, W32),
        SubD => (BinOp::Sub, W64),
        Maskeqz => (BinOp::MaskEqz, W64),
        Masknez => (BinOp::MaskNez, W64),
        Nor => (BinOp::Nor, W64),
        And => (BinOp::And, W64),
        Or => (BinOp::Or, W64),
        Xor => (BinOp::Xor, W64),
        Orn => (BinOp::Orn, W64),
        Andn => (BinOp::Andn, W64),
        SllW => (BinOp::Shl, W32),
        SrlW => (BinOp::Shr, W32),
        SraW => (BinOp::Sar, W32),
        SllD => (BinOp::Shl, W64),
        SrlD => (BinOp::Shr, W64),
        SraD => (BinOp::Sar, W64),
        RotrW => (BinOp::Rotr, W32),
        RotrD => (BinOp::Rotr, W64),
        MulW => (BinOp::Mul, W32),
        MulhW => (BinOp::MulHs, W32),
        MulhWu => (BinOp::MulHu, W32),
        MulD => (BinOp::Mul, W64),
        MulhD => (BinOp::MulHs, W64),
        MulhDu => (BinOp::MulHu, W64),
        DivW => (BinOp::Div, W32),
        ModW => (BinOp::Rem, W32),
        DivWu => (BinOp::DivU, W32),
        ModWu => (BinOp::RemU, W32),
        DivD => (BinOp::Div, W64),
        ModD => (BinOp::Rem, W64),
        DivDu => (BinOp::DivU, W64),
        ModDu => (BinOp::RemU, W64),
        Slt | Sltu | MulwDW | MulwDWu => return None,
    })
}

fn bit_unop(op: BitOp) -> Option<(UnOp, Width)> {
    use BitOp::*;
    use Width::*;
    Some(match op {
        CloW => (UnOp::Clo, W32),
        ClzW => (UnOp::Clz, W32),
        CtoW => (UnOp::Cto, W32),
        CtzW => (UnOp::Ctz, W32),
        CloD => (UnOp::Clo, W64),
        ClzD => (UnOp::Clz, W64),
        CtoD => (UnOp::Cto, W64),
        CtzD => (UnOp::Ctz, W64),
        Revb2h => (UnOp::RevbH, W32),
        Revb4h => (UnOp::RevbH, W64),
        Revb2w => (UnOp::RevbW, W64),
        RevbD => (UnOp::Revb, W64),
        Revh2w => (UnOp::RevhW, W64),
        RevhD => (UnOp::Revh, W64),
        Bitrev4b => (UnOp::BitrevB, W32),
        Bitrev8b => (UnOp::BitrevB, W64),
        BitrevW => (UnOp::Bitrev, W32),
        BitrevD => (UnOp::Bitrev, W64),
        ExtWH | ExtWB => return None,
    })
}

impl<B: Backend> Translator<'_, B> {
    pub(super) fn trans_arith(&mut self, op: Op) -> BlockState {
        match op {
            Op::Alu { op, rd, rj, rk } => self.trans_alu(op, rd, rj, rk),
            Op::AluImm { op, rd, rj, imm } => self.trans_alu_imm(op, rd, rj, imm),
            Op::Bit { op, rd, rj } => self.trans_bit(op, rd, rj),

            Op::Alsl { kind, rd, rj, rk, sa } => {
                let shifted = self.temp();
                self.emit(IrOp::Binary {
                    op: BinOp::Shl,
                    width: Width::W64,
                    dst: shifted.into(),
                    a: Operand::Gpr(rj),
                    b: Operand::Imm(sa as u64 + 1),
                });
                let width = if kind == AlslKind::D { Width::W64 } else { Width::W32 };
                let sum = self.temp();
                self.emit(IrOp::Binary {
                    op: BinOp::Add,
                    width,
                    dst: sum.into(),
                    a: shifted.into(),
                    b: Operand::Gpr(rk),
                });
                let signed = kind != AlslKind::Wu;
                if kind == AlslKind::D {
                    self.emit(IrOp::Mov { dst: Place::Gpr(rd), src: sum.into() });
                } else {
                    self.emit(IrOp::Extract {
                        dst: Place::Gpr(rd),
                        src: sum.into(),
                        lsb: 0,
                        len: 32,
                        signed,
                    });
                }
                BlockState::Running
            }

            Op::Bytepick { d, rd, rj, rk, sa } => {
                let (width, bits) = if d { (Width::W64, 64) } else { (Width::W32, 32) };
                let shift = sa as u64 * 8;
                if shift == 0 {
                    self.emit(IrOp::Binary {
                        op: BinOp::Or,
                        width,
                        dst: Place::Gpr(rd),
                        a: Operand::Gpr(rk),
                        b: Operand::Imm(0),
                    });
                    return BlockState::Running;
                }
                let hi = self.temp();
                let lo = self.temp();
                self.emit(IrOp::Binary {
                    op: BinOp::Shl,
                    width,
                    dst: hi.into(),
                    a: Operand::Gpr(rk),
                    b: Operand::Imm(shift),
                });
                self.emit(IrOp::Binary {
                    op: BinOp::Shr,
                    width,
                    dst: lo.into(),
                    a: Operand::Gpr(rj),
                    b: Operand::Imm(bits - shift),
                });
                self.emit(IrOp::Binary {
                    op: BinOp::Or,
                    width,
                    dst: Place::Gpr(rd),
                    a: hi.into(),
                    b: lo.into(),
                });
                BlockState::Running
            }

            Op::Bstrins { d, rd, rj, msb, lsb } => {
                if msb < lsb {
                    return self.raise(Exception::Ine);
                }
                let merged = self.temp();
                self.emit(IrOp::Deposit {
                    dst: merged.into(),
                    base: Operand::Gpr(rd),
                    field: Operand::Gpr(rj),
                    lsb,
                    len: msb - lsb + 1,
                });
                self.finish_word(d, rd, merged.into());
                BlockState::Running
            }

            Op::Bstrpick { d, rd, rj, msb, lsb } => {
                if msb < lsb {
                    return self.raise(Exception::Ine);
                }
                let field = self.temp();
                self.emit(IrOp::Extract {
                    dst: field.into(),
                    src: Operand::Gpr(rj),
                    lsb,
                    len: msb - lsb + 1,
                    signed: false,
                });
                self.finish_word(d, rd, field.into());
                BlockState::Running
            }

            Op::Lu12iW { rd, imm } => {
                let value = ((imm << 12) as i32) as i64 as u64;
                self.emit(IrOp::Mov { dst: Place::Gpr(rd), src: Operand::Imm(value) });
                BlockState::Running
            }
            Op::Lu32iD { rd, imm } => {
                self.emit(IrOp::Deposit {
                    dst: Place::Gpr(rd),
                    base: Operand::Gpr(rd),
                    field: Operand::Imm(imm as u64),
                    lsb: 32,
                    len: 32,
                });
                BlockState::Running
            }
            Op::Lu52iD { rd, rj, imm } => {
                self.emit(IrOp::Deposit {
                    dst: Place::Gpr(rd),
                    base: Operand::Gpr(rj),
                    field: Operand::Imm(imm as u64),
                    lsb: 52,
                    len: 12,
                });
                BlockState::Running
            }
            Op::Addu16iD { rd, rj, imm } => {
                self.emit(IrOp::Binary {
                    op: BinOp::Add,
                    width: Width::W64,
                    dst: Place::Gpr(rd),
                    a: Operand::Gpr(rj),
                    b: Operand::Imm((imm << 16) as u64),
                });
                BlockState::Running
            }
            Op::PcRel { kind, rd, imm } => {
                let pc = self.ctx.pc;
                let value = match kind {
                    PcRelKind::Addi => pc.wrapping_add((imm << 2) as u64),
                    PcRelKind::Addu12i => pc.wrapping_add((imm << 12) as u64),
                    PcRelKind::Addu18i => pc.wrapping_add((imm << 18) as u64),
                    PcRelKind::Alau12i => pc.wrapping_add((imm << 12) as u64) & !0xfff,
                };
                let value = self.ctx.address(value);
                self.emit(IrOp::Mov { dst: Place::Gpr(rd), src: Operand::Imm(value) });
                BlockState::Running
            }

            _ => self.raise(Exception::Ine),
        }
    }

    /// `.w` forms sign-extend the low word; `.d` forms take all 64 bits.
    fn finish_word(&mut self, d: bool, rd: u8, value: Operand) {
        if d {
            self.emit(IrOp::Mov { dst: Place::Gpr(rd), src: value });
        } else {
            self.emit(IrOp::Extract {
                dst: Place::Gpr(rd),
                src: value,
                lsb: 0,
                len: 32,
                signed: true,
            });
        }
    }

    fn trans_alu(&mut self, op: AluOp, rd: u8, rj: u8, rk: u8) -> BlockState {
        if rd == 0 {
            return BlockState::Running;
        }
        let (a, b) = (Operand::Gpr(rj), Operand::Gpr(rk));
        match op {
            AluOp::Slt | AluOp::Sltu => {
                let cond = if op == AluOp::Slt { Cond::Lt } else { Cond::Ltu };
                self.emit(IrOp::SetCond { cond, dst: Place::Gpr(rd), a, b });
            }
            AluOp::MulwDW | AluOp::MulwDWu => {
                let signed = op == AluOp::MulwDW;
                let x = self.temp();
                let y = self.temp();
                self.emit(IrOp::Extract { dst: x.into(), src: a, lsb: 0, len: 32, signed });
                self.emit(IrOp::Extract { dst: y.into(), src: b, lsb: 0, len: 32, signed });
                self.emit(IrOp::Binary {
                    op: BinOp::Mul,
                    width: Width::W64,
                    dst: Place::Gpr(rd),
                    a: x.into(),
                    b: y.into(),
                });
            }
            _ => {
                if let Some((bin, width)) = alu_binop(op) {
                    self.emit(IrOp::Binary { op: bin, width, dst: Place::Gpr(rd), a, b });
                }
            }
        }
        BlockState::Running
    }

    fn trans_alu_imm(&mut self, op: AluImmOp, rd: u8, rj: u8, imm: i64) -> BlockState {
        if rd == 0 {
            return BlockState::Running;
        }
        let (a, b) = (Operand::Gpr(rj), Operand::Imm(imm as u64));
        let dst = Place::Gpr(rd);
        let (bin, width) = match op {
            AluImmOp::Slti => {
                self.emit(IrOp::SetCond { cond: Cond::Lt, dst, a, b });
                return BlockState::Running;
            }
            AluImmOp::Sltui => {
                self.emit(IrOp::SetCond { cond: Cond::Ltu, dst, a, b });
                return BlockState::Running;
            }
            AluImmOp::AddiW => (BinOp::Add, Width::W32),
            AluImmOp::AddiD => (BinOp::Add, Width::W64),
            AluImmOp::Andi => (BinOp::And, Width::W64),
            AluImmOp::Ori => (BinOp::Or, Width::W64),
            AluImmOp::Xori => (BinOp::Xor, Width::W64),
            AluImmOp::SlliW => (BinOp::Shl, Width::W32),
            AluImmOp::SlliD => (BinOp::Shl, Width::W64),
            AluImmOp::SrliW => (BinOp::Shr, Width::W32),
            AluImmOp::SrliD => (BinOp::Shr, Width::W64),
            AluImmOp::SraiW => (BinOp::Sar, Width::W32),
            AluImmOp::SraiD => (BinOp::Sar, Width::W64),
            AluImmOp::RotriW => (BinOp::Rotr, Width::W32),
            AluImmOp::RotriD => (BinOp::Rotr, Width::W64),
        };
        self.emit(IrOp::Binary { op: bin, width, dst, a, b });
        BlockState::Running
    }

    fn trans_bit(&mut self, op: BitOp, rd: u8, rj: u8) -> BlockState {
        if rd == 0 {
            return BlockState::Running;
        }
        let src = Operand::Gpr(rj);
        let dst = Place::Gpr(rd);
        match op {
            BitOp::ExtWH | BitOp::ExtWB => {
                let len = if op == BitOp::ExtWH { 16 } else { 8 };
                self.emit(IrOp::Extract { dst, src, lsb: 0, len, signed: true });
            }
            _ => {
                if let Some((un, width)) = bit_unop(op) {
                    self.emit(IrOp::Unary { op: un, width, dst, src });
                }
            }
        }
        BlockState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use crate::engine::decoder::encode::*;

    #[test]
    fn test_add_sub_and_immediates() {
        let mut cpu = test_cpu();
        cpu.gpr[2] = 40;
        cpu.gpr[3] = 2;
        run_words(
            &mut cpu,
            &[
                r3(ADD_D, 4, 2, 3),
                r3(SUB_D, 5, 2, 3),
                ri12(ADDI_W, 6, 0, -1),
                ri12(ORI, 7, 0, 0xfff),
                b26(B, 0x100),
            ],
        );
        assert_eq!(cpu.gpr[4], 42);
        assert_eq!(cpu.gpr[5], 38);
        assert_eq!(cpu.gpr[6], u64::MAX);
        assert_eq!(cpu.gpr[7], 0xfff);
    }

    #[test]
    fn test_add_w_sign_extends() {
        let mut cpu = test_cpu();
        cpu.gpr[2] = 0x7fff_ffff;
        cpu.gpr[3] = 1;
        run_words(&mut cpu, &[r3(ADD_W, 4, 2, 3), b26(B, 0x100)]);
        assert_eq!(cpu.gpr[4], 0xffff_ffff_8000_0000);
    }

    #[test]
    fn test_load_immediate_sequence() {
        // lu12i.w / ori / lu32i.d / lu52i.d build 0x1234_5678_9abc_def0
        let mut cpu = test_cpu();
        run_words(
            &mut cpu,
            &[
                ri20(LU12I_W, 4, 0x9abcd),
                ri12(ORI, 4, 4, 0xef0),
                ri20(LU32I_D, 4, 0x45678),
                ri12(LU52I_D, 4, 4, 0x123),
                b26(B, 0x100),
            ],
        );
        assert_eq!(cpu.gpr[4], 0x1234_5678_9abc_def0);
    }

    #[test]
    fn test_pcaddu12i_uses_instruction_pc() {
        let mut cpu = test_cpu();
        run_words(&mut cpu, &[NOP, ri20(PCADDU12I, 4, 1), b26(B, 0x100)]);
        assert_eq!(cpu.gpr[4], CODE_BASE + 4 + 0x1000);
    }

    #[test]
    fn test_slt_and_division() {
        let mut cpu = test_cpu();
        cpu.gpr[2] = (-5i64) as u64;
        cpu.gpr[3] = 3;
        cpu.gpr[8] = 0;
        run_words(
            &mut cpu,
            &[
                r3(SLT, 4, 2, 3),
                r3(DIV_D, 5, 2, 3),
                r3(MOD_DU, 6, 3, 8),
                r3(MUL_D, 7, 2, 3),
                b26(B, 0x100),
            ],
        );
        assert_eq!(cpu.gpr[4], 1);
        assert_eq!(cpu.gpr[5], (-1i64) as u64);
        assert_eq!(cpu.gpr[6], 0, "remainder by zero");
        assert_eq!(cpu.gpr[7], (-15i64) as u64);
    }

    #[test]
    fn test_writes_to_r0_are_dropped() {
        let mut cpu = test_cpu();
        cpu.gpr[2] = 7;
        run_words(&mut cpu, &[r3(OR, 0, 2, 2), b26(B, 0x100)]);
        assert_eq!(cpu.read_gpr(0), 0);
    }
}
