//! System and privileged instructions: traps, CSR access, IOCSR, TLB
//! maintenance, the page-walk helpers, ERTN, IDLE, CPUCFG and RDTIME.
//!
//! The PLV0 check has already happened in the dispatcher.

use super::{BlockState, Translator};
use crate::cpu::Exception;
use crate::cpu::csr::CsrId;
use crate::engine::decoder::{MemSize, Op, RdtimeKind, TlbOp};
use crate::helpers::Helper;
use crate::ir::{Backend, IrOp, Operand, Place};

impl<B: Backend> Translator<'_, B> {
    pub(super) fn trans_privileged(&mut self, op: Op) -> BlockState {
        match op {
            Op::Syscall { .. } => self.raise(Exception::Sys),
            Op::Break { .. } => self.raise(Exception::Brk),

            Op::Csrrd { rd, csr } => {
                self.trans_csr(csr, rd, Vec::new(), |csr| Helper::CsrRead { csr });
                BlockState::Running
            }
            Op::Csrwr { rd, csr } => {
                let known = self.trans_csr(csr, rd, vec![Operand::Gpr(rd)], |csr| {
                    Helper::CsrWrite { csr }
                });
                self.after_csr_write(known)
            }
            Op::Csrxchg { rd, rj, csr } => {
                let known = self.trans_csr(csr, rd, vec![Operand::Gpr(rd), Operand::Gpr(rj)], |csr| {
                    Helper::CsrXchg { csr }
                });
                self.after_csr_write(known)
            }

            Op::Iocsrrd { size, rd, rj } => {
                let raw = self.temp();
                self.emit(IrOp::Call {
                    helper: Helper::IocsrRead { size: size.bytes() },
                    dst: Some(raw.into()),
                    args: vec![Operand::Gpr(rj)],
                });
                if size == MemSize::W {
                    self.emit(IrOp::Extract {
                        dst: Place::Gpr(rd),
                        src: raw.into(),
                        lsb: 0,
                        len: 32,
                        signed: true,
                    });
                } else {
                    self.emit(IrOp::Mov { dst: Place::Gpr(rd), src: raw.into() });
                }
                BlockState::Running
            }
            Op::Iocsrwr { size, rd, rj } => {
                self.emit(IrOp::Call {
                    helper: Helper::IocsrWrite { size: size.bytes() },
                    dst: None,
                    args: vec![Operand::Gpr(rj), Operand::Gpr(rd)],
                });
                BlockState::Running
            }

            // Caches are not modelled
            Op::Cacop { .. } => BlockState::Running,

            Op::Lddir { rd, rj, level } => {
                self.emit(IrOp::Call {
                    helper: Helper::Lddir { level },
                    dst: Some(Place::Gpr(rd)),
                    args: vec![Operand::Gpr(rj)],
                });
                BlockState::Running
            }
            Op::Ldpte { rj, seq } => {
                self.emit(IrOp::Call {
                    helper: Helper::Ldpte { odd: seq != 0 },
                    dst: None,
                    args: vec![Operand::Gpr(rj)],
                });
                BlockState::Running
            }

            Op::Tlb(op) => {
                self.emit(IrOp::Call { helper: Helper::Tlb(op), dst: None, args: Vec::new() });
                // tlbsrch/tlbrd only touch CSRs the block does not depend on
                if matches!(op, TlbOp::Srch | TlbOp::Rd) {
                    BlockState::Running
                } else {
                    BlockState::EndAtNext
                }
            }
            Op::Invtlb { op, rj, rk } => {
                self.emit(IrOp::Call {
                    helper: Helper::Invtlb,
                    dst: None,
                    args: vec![Operand::Imm(op as u64), Operand::Gpr(rj), Operand::Gpr(rk)],
                });
                BlockState::EndAtNext
            }

            Op::Ertn => {
                self.emit(IrOp::Call { helper: Helper::Ertn, dst: None, args: Vec::new() });
                self.emit(IrOp::ExitTb);
                BlockState::Exited
            }
            Op::Idle { .. } => {
                let resume = self.ctx.next_pc();
                self.emit(IrOp::Call {
                    helper: Helper::Idle,
                    dst: None,
                    args: vec![Operand::Imm(resume)],
                });
                self.emit(IrOp::ExitTb);
                BlockState::Exited
            }

            Op::Cpucfg { rd, rj } => {
                self.emit(IrOp::Call {
                    helper: Helper::Cpucfg,
                    dst: Some(Place::Gpr(rd)),
                    args: vec![Operand::Gpr(rj)],
                });
                BlockState::Running
            }
            Op::Rdtime { kind, rd, rj } => {
                let counter = self.temp();
                self.emit(IrOp::Call { helper: Helper::Rdtime, dst: Some(counter.into()), args: Vec::new() });
                let dst = Place::Gpr(rd);
                match kind {
                    RdtimeKind::LowW => self.emit(IrOp::Extract {
                        dst,
                        src: counter.into(),
                        lsb: 0,
                        len: 32,
                        signed: true,
                    }),
                    RdtimeKind::HighW => self.emit(IrOp::Extract {
                        dst,
                        src: counter.into(),
                        lsb: 32,
                        len: 32,
                        signed: true,
                    }),
                    RdtimeKind::D => self.emit(IrOp::Mov { dst, src: counter.into() }),
                }
                self.emit(IrOp::Call {
                    helper: Helper::CounterId,
                    dst: Some(Place::Gpr(rj)),
                    args: Vec::new(),
                });
                BlockState::Running
            }

            _ => self.raise(Exception::Ine),
        }
    }

    /// Emit a CSR helper call with `rd` as destination. Unknown CSR numbers
    /// read as zero and ignore writes. Returns the CSR when it is known.
    fn trans_csr(
        &mut self,
        raw: u16,
        rd: u8,
        args: Vec<Operand>,
        helper: impl FnOnce(u16) -> Helper,
    ) -> Option<CsrId> {
        let Some(id) = CsrId::from_raw(raw) else {
            log::trace!("[CSR] Access to unimplemented CSR {:#x} at {:#x}", raw, self.ctx.pc);
            self.emit(IrOp::Mov { dst: Place::Gpr(rd), src: Operand::Imm(0) });
            return None;
        };
        self.emit(IrOp::Call { helper: helper(raw), dst: Some(Place::Gpr(rd)), args });
        Some(id)
    }

    /// Writes to mode-defining CSRs invalidate the flags this block was
    /// translated under.
    fn after_csr_write(&mut self, id: Option<CsrId>) -> BlockState {
        match id {
            Some(id) if id.desc().map_or(true, |desc| desc.ends_block()) => BlockState::EndAtNext,
            _ => BlockState::Running,
        }
    }
}
