//! Loads, stores, LL/SC, AM* atomics, barriers and bound checks.
//!
//! Addresses are computed into a temporary and handed to the memory ops
//! untranslated; the executor runs them through the MMU.

use super::{BlockState, Translator};
use crate::cpu::Exception;
use crate::engine::decoder::{AmoOp, MemSize, Op};
use crate::ir::{Backend, BinOp, Cond, IrOp, Operand, Place, RmwOp, Temp, Width};

/// Upper half of a NaN-boxed single.
const NANBOX: u64 = 0xffff_ffff_0000_0000;

fn rmw_op(op: AmoOp) -> RmwOp {
    match op {
        AmoOp::Swap => RmwOp::Swap,
        AmoOp::Add => RmwOp::Add,
        AmoOp::And => RmwOp::And,
        AmoOp::Or => RmwOp::Or,
        AmoOp::Xor => RmwOp::Xor,
        AmoOp::Max => RmwOp::Max,
        AmoOp::Min => RmwOp::Min,
        AmoOp::MaxU => RmwOp::MaxU,
        AmoOp::MinU => RmwOp::MinU,
    }
}

impl<B: Backend> Translator<'_, B> {
    /// `base + offset` into a fresh temporary.
    fn address(&mut self, base: u8, offset: Operand) -> Temp {
        let addr = self.temp();
        self.emit(IrOp::Binary {
            op: BinOp::Add,
            width: Width::W64,
            dst: addr.into(),
            a: Operand::Gpr(base),
            b: offset,
        });
        addr
    }

    fn imm(offset: i64) -> Operand {
        Operand::Imm(offset as u64)
    }

    pub(super) fn trans_memory(&mut self, op: Op) -> BlockState {
        match op {
            Op::Load { size, signed, rd, rj, offset } => {
                let addr = self.address(rj, Self::imm(offset));
                self.load(size, signed, rd, addr);
            }
            Op::LoadIndexed { size, signed, rd, rj, rk } => {
                let addr = self.address(rj, Operand::Gpr(rk));
                self.load(size, signed, rd, addr);
            }
            Op::Store { size, rd, rj, offset } => {
                let addr = self.address(rj, Self::imm(offset));
                self.emit(IrOp::Store { src: Operand::Gpr(rd), addr: addr.into(), size: size.bytes() });
            }
            Op::StoreIndexed { size, rd, rj, rk } => {
                let addr = self.address(rj, Operand::Gpr(rk));
                self.emit(IrOp::Store { src: Operand::Gpr(rd), addr: addr.into(), size: size.bytes() });
            }

            Op::FLoad { double, fd, rj, offset } => {
                let addr = self.address(rj, Self::imm(offset));
                self.fload(double, fd, addr);
            }
            Op::FLoadIndexed { double, fd, rj, rk } => {
                let addr = self.address(rj, Operand::Gpr(rk));
                self.fload(double, fd, addr);
            }
            Op::FStore { double, fd, rj, offset } => {
                let addr = self.address(rj, Self::imm(offset));
                let size = if double { 8 } else { 4 };
                self.emit(IrOp::Store { src: Operand::Fpr(fd), addr: addr.into(), size });
            }
            Op::FStoreIndexed { double, fd, rj, rk } => {
                let addr = self.address(rj, Operand::Gpr(rk));
                let size = if double { 8 } else { 4 };
                self.emit(IrOp::Store { src: Operand::Fpr(fd), addr: addr.into(), size });
            }

            // Prefetch hints have no architectural effect
            Op::Preld { .. } | Op::Preldx { .. } => {}

            Op::Ll { d, rd, rj, offset } => {
                let addr = self.address(rj, Self::imm(offset));
                let size = if d { 8 } else { 4 };
                self.emit(IrOp::LoadLinked { dst: Place::Gpr(rd), addr: addr.into(), size });
            }
            Op::Sc { d, rd, rj, offset } => {
                let addr = self.address(rj, Self::imm(offset));
                let size = if d { 8 } else { 4 };
                self.emit(IrOp::StoreCond {
                    dst: Place::Gpr(rd),
                    addr: addr.into(),
                    src: Operand::Gpr(rd),
                    size,
                });
            }
            Op::Amo { op, d, db, rd, rj, rk } => {
                if rd != 0 && (rd == rj || rd == rk) {
                    return self.raise(Exception::Ine);
                }
                if db {
                    self.emit(IrOp::Fence);
                }
                self.emit(IrOp::AtomicRmw {
                    op: rmw_op(op),
                    dst: Place::Gpr(rd),
                    addr: Operand::Gpr(rj),
                    src: Operand::Gpr(rk),
                    size: if d { 8 } else { 4 },
                });
                if db {
                    self.emit(IrOp::Fence);
                }
            }

            Op::Dbar { .. } => self.emit(IrOp::Fence),
            Op::Ibar { .. } => {
                // Later instructions may have been rewritten; refetch them
                self.emit(IrOp::Fence);
                return self.end_after();
            }

            Op::BoundCheck { gt, rj, rk } => {
                // asrtle: rj <= rk, asrtgt: rj > rk
                let cond = if gt { Cond::Ltu } else { Cond::Geu };
                self.emit(IrOp::Check {
                    cond,
                    a: Operand::Gpr(rk),
                    b: Operand::Gpr(rj),
                    cause: Exception::Bce,
                });
            }

            _ => return self.raise(Exception::Ine),
        }
        BlockState::Running
    }

    fn load(&mut self, size: MemSize, signed: bool, rd: u8, addr: Temp) {
        self.emit(IrOp::Load {
            dst: Place::Gpr(rd),
            addr: addr.into(),
            size: size.bytes(),
            signed,
        });
    }

    fn fload(&mut self, double: bool, fd: u8, addr: Temp) {
        if double {
            self.emit(IrOp::Load { dst: Place::Fpr(fd), addr: addr.into(), size: 8, signed: false });
            return;
        }
        let word = self.temp();
        self.emit(IrOp::Load { dst: word.into(), addr: addr.into(), size: 4, signed: false });
        self.emit(IrOp::Binary {
            op: BinOp::Or,
            width: Width::W64,
            dst: Place::Fpr(fd),
            a: word.into(),
            b: Operand::Imm(NANBOX),
        });
    }
}
