//! Branches and jumps. Each records a `PendingBranch`; the block loop turns
//! it into the exit op once the instruction is complete.

use super::{BlockState, PendingBranch, Translator};
use crate::cpu::{Exception, REG_RA};
use crate::engine::decoder::{BranchCond, Op};
use crate::ir::{Backend, BinOp, Cond, IrOp, Operand, Place, Width};

fn cond_of(cond: BranchCond) -> Cond {
    match cond {
        BranchCond::Eq => Cond::Eq,
        BranchCond::Ne => Cond::Ne,
        BranchCond::Lt => Cond::Lt,
        BranchCond::Ge => Cond::Ge,
        BranchCond::Ltu => Cond::Ltu,
        BranchCond::Geu => Cond::Geu,
    }
}

impl<B: Backend> Translator<'_, B> {
    pub(super) fn trans_branch(&mut self, op: Op) -> BlockState {
        let pc = self.ctx.pc;
        let link = self.ctx.address(self.ctx.next_pc());
        let pending = match op {
            Op::Branch { cond, rj, rd, offset } => PendingBranch::Conditional {
                cond: cond_of(cond),
                a: Operand::Gpr(rj),
                b: Operand::Gpr(rd),
                target: pc.wrapping_add(offset as u64),
            },
            Op::BranchZero { nez, rj, offset } => PendingBranch::Conditional {
                cond: if nez { Cond::Ne } else { Cond::Eq },
                a: Operand::Gpr(rj),
                b: Operand::Imm(0),
                target: pc.wrapping_add(offset as u64),
            },
            Op::BranchFcc { nez, cj, offset } => PendingBranch::Conditional {
                cond: if nez { Cond::Ne } else { Cond::Eq },
                a: Operand::Fcc(cj),
                b: Operand::Imm(0),
                target: pc.wrapping_add(offset as u64),
            },
            Op::B { offset } => PendingBranch::Unconditional {
                target: pc.wrapping_add(offset as u64),
            },
            Op::Bl { offset } => {
                self.emit(IrOp::Mov {
                    dst: Place::Gpr(REG_RA as u8),
                    src: Operand::Imm(link),
                });
                PendingBranch::Unconditional {
                    target: pc.wrapping_add(offset as u64),
                }
            }
            Op::Jirl { rd, rj, offset } => {
                // Target first: rd may alias rj
                let target = self.temp();
                self.emit(IrOp::Binary {
                    op: BinOp::Add,
                    width: Width::W64,
                    dst: target.into(),
                    a: Operand::Gpr(rj),
                    b: Operand::Imm(offset as u64),
                });
                self.emit(IrOp::Mov { dst: Place::Gpr(rd), src: Operand::Imm(link) });
                PendingBranch::Indirect { target: target.into() }
            }
            _ => return self.raise(Exception::Ine),
        };
        self.ctx.pending = pending;
        BlockState::Running
    }
}
