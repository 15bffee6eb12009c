//! Scalar floating point. Arithmetic goes through helpers so IEEE status is
//! folded into FCSR0; register moves and selects are plain IR.

use super::{BlockState, Translator};
use crate::cpu::Exception;
use crate::cpu::fpu::fcmp_cond_valid;
use crate::engine::decoder::{FMoveKind, Op};
use crate::helpers::Helper;
use crate::ir::{Backend, BinOp, IrOp, Operand, Place, Width};

impl<B: Backend> Translator<'_, B> {
    pub(super) fn trans_float(&mut self, op: Op) -> BlockState {
        match op {
            Op::FBinary { op, fmt, fd, fj, fk } => self.fcall(
                Helper::FBinary { op, fmt },
                Place::Fpr(fd),
                vec![Operand::Fpr(fj), Operand::Fpr(fk)],
            ),
            Op::FUnary { op, fmt, fd, fj } => {
                self.fcall(Helper::FUnary { op, fmt }, Place::Fpr(fd), vec![Operand::Fpr(fj)])
            }
            Op::FClass { fmt, fd, fj } => {
                self.fcall(Helper::FClass { fmt }, Place::Fpr(fd), vec![Operand::Fpr(fj)])
            }
            Op::FMulAdd { kind, fmt, fd, fj, fk, fa } => self.fcall(
                Helper::FMulAdd { kind, fmt },
                Place::Fpr(fd),
                vec![Operand::Fpr(fj), Operand::Fpr(fk), Operand::Fpr(fa)],
            ),
            Op::FCmp { cond, fmt, cd, fj, fk } => {
                if !fcmp_cond_valid(cond) {
                    return self.raise(Exception::Ine);
                }
                self.fcall(
                    Helper::FCmp { cond, fmt },
                    Place::Fcc(cd),
                    vec![Operand::Fpr(fj), Operand::Fpr(fk)],
                )
            }
            Op::FSel { fd, fj, fk, ca } => {
                self.emit(IrOp::Select {
                    dst: Place::Fpr(fd),
                    test: Operand::Fcc(ca),
                    if_true: Operand::Fpr(fk),
                    if_false: Operand::Fpr(fj),
                });
                BlockState::Running
            }
            Op::FCvt { kind, fd, fj } => {
                self.fcall(Helper::FCvt { kind }, Place::Fpr(fd), vec![Operand::Fpr(fj)])
            }
            Op::FMove { kind, dst, src } => {
                self.trans_fmove(kind, dst, src);
                BlockState::Running
            }
            _ => self.raise(Exception::Ine),
        }
    }

    fn fcall(&mut self, helper: Helper, dst: Place, args: Vec<Operand>) -> BlockState {
        self.emit(IrOp::Call { helper, dst: Some(dst), args });
        BlockState::Running
    }

    fn trans_fmove(&mut self, kind: FMoveKind, dst: u8, src: u8) {
        let op = match kind {
            FMoveKind::Gr2FrW => IrOp::Deposit {
                dst: Place::Fpr(dst),
                base: Operand::Fpr(dst),
                field: Operand::Gpr(src),
                lsb: 0,
                len: 32,
            },
            FMoveKind::Gr2FrhW => IrOp::Deposit {
                dst: Place::Fpr(dst),
                base: Operand::Fpr(dst),
                field: Operand::Gpr(src),
                lsb: 32,
                len: 32,
            },
            FMoveKind::Gr2FrD => IrOp::Mov { dst: Place::Fpr(dst), src: Operand::Gpr(src) },
            FMoveKind::Fr2GrS => IrOp::Extract {
                dst: Place::Gpr(dst),
                src: Operand::Fpr(src),
                lsb: 0,
                len: 32,
                signed: true,
            },
            FMoveKind::Frh2GrS => IrOp::Extract {
                dst: Place::Gpr(dst),
                src: Operand::Fpr(src),
                lsb: 32,
                len: 32,
                signed: true,
            },
            FMoveKind::Fr2GrD => IrOp::Mov { dst: Place::Gpr(dst), src: Operand::Fpr(src) },
            FMoveKind::Gr2Fcsr => IrOp::Call {
                helper: Helper::WriteFcsr { index: dst },
                dst: None,
                args: vec![Operand::Gpr(src)],
            },
            FMoveKind::Fcsr2Gr => IrOp::Call {
                helper: Helper::ReadFcsr { index: src },
                dst: Some(Place::Gpr(dst)),
                args: Vec::new(),
            },
            FMoveKind::Fr2Cf => IrOp::Binary {
                op: BinOp::And,
                width: Width::W64,
                dst: Place::Fcc(dst),
                a: Operand::Fpr(src),
                b: Operand::Imm(1),
            },
            FMoveKind::Gr2Cf => IrOp::Binary {
                op: BinOp::And,
                width: Width::W64,
                dst: Place::Fcc(dst),
                a: Operand::Gpr(src),
                b: Operand::Imm(1),
            },
            FMoveKind::Cf2Fr => IrOp::Mov { dst: Place::Fpr(dst), src: Operand::Fcc(src) },
            FMoveKind::Cf2Gr => IrOp::Mov { dst: Place::Gpr(dst), src: Operand::Fcc(src) },
        };
        self.emit(op);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use crate::cpu::Exception;
    use crate::cpu::csr::CsrId;
    use crate::engine::decoder::encode::*;
    use crate::ir::interp::BlockExit;

    const ONE: u64 = 0x3ff0_0000_0000_0000;
    const TWO: u64 = 0x4000_0000_0000_0000;
    const THREE: u64 = 0x4008_0000_0000_0000;

    #[test]
    fn test_fadd_and_fmadd() {
        let mut cpu = test_cpu();
        cpu.fpr[1] = ONE;
        cpu.fpr[2] = TWO;
        run_words(
            &mut cpu,
            &[
                r3(FADD_D, 3, 1, 2),
                // f4 = f1 * f2 + f3 = 2 + 3
                r4(FMADD_D, 4, 1, 2, 3),
                b26(B, 0x100),
            ],
        );
        assert_eq!(cpu.fpr[3], THREE);
        assert_eq!(cpu.fpr[4], 0x4014_0000_0000_0000);
    }

    #[test]
    fn test_gpr_fpr_moves() {
        let mut cpu = test_cpu();
        cpu.gpr[4] = TWO;
        run_words(
            &mut cpu,
            &[r2(MOVGR2FR_D, 5, 4), r2(MOVFR2GR_D, 6, 5), b26(B, 0x100)],
        );
        assert_eq!(cpu.fpr[5], TWO);
        assert_eq!(cpu.gpr[6], TWO);
    }

    #[test]
    fn test_fcmp_then_fsel() {
        let mut cpu = test_cpu();
        cpu.fpr[1] = ONE;
        cpu.fpr[2] = TWO;
        run_words(
            &mut cpu,
            &[
                // fcmp.clt.d fcc1, f1, f2
                r3(FCMP_D | (0x2 << 15), 1, 1, 2),
                // fsel f3, f1, f2, fcc1 -> f2
                r4(FSEL, 3, 1, 2, 1),
                b26(B, 0x100),
            ],
        );
        assert!(cpu.fcc[1]);
        assert_eq!(cpu.fpr[3], TWO);
    }

    #[test]
    fn test_reserved_fcmp_condition_is_ine() {
        let mut cpu = test_cpu();
        let out = run_words(&mut cpu, &[r3(FCMP_D | (0x1f << 15), 1, 1, 2)]);
        assert_eq!(out.exit, BlockExit::Exception(Exception::Ine));
    }

    #[test]
    fn test_fp_disabled_traps_fpd() {
        let mut cpu = test_cpu();
        cpu.csr.set(CsrId::Euen, 0);
        cpu.compute_hflags();
        let out = run_words(&mut cpu, &[r3(FADD_D, 3, 1, 2)]);
        assert_eq!(out.exit, BlockExit::Exception(Exception::Fpd));
    }

    #[test]
    fn test_integer_conversions() {
        let mut cpu = test_cpu();
        cpu.fpr[1] = 7;
        cpu.fpr[2] = 0x401c_0000_0000_0000; // 7.0
        run_words(
            &mut cpu,
            &[r2(FFINT_D_L, 3, 1), r2(FTINTRZ_W_D, 4, 2), b26(B, 0x100)],
        );
        assert_eq!(cpu.fpr[3], 0x401c_0000_0000_0000);
        assert_eq!(cpu.fpr[4] & 0xffff_ffff, 7);
    }
}
