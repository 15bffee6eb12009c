//! Runtime helpers.
//!
//! Operations too involved to express as plain IR (CSR access with side
//! effects, the TLB instructions, the page walker, IOCSR, ERTN/IDLE and all
//! floating point) are emitted as `IrOp::Call` and land here. A helper
//! either produces a value for the call's destination or asks the executor
//! to raise a guest exception at the current instruction.
//!
//! The executor stores the PC of the running instruction in `cpu.pc` before
//! each instruction, so helpers read it from there for trap entry.

use crate::bits::extract64;
use crate::bus::Bus;
use crate::cpu::csr::*;
use crate::cpu::fpu::{self, FBinOp, FCvtKind, FUnOp, FmaKind, FpFmt};
use crate::cpu::{CpuState, Exception, ExceptionEvent};
use crate::engine::decoder::TlbOp;
use crate::error::CoreResult;
use rustc_apfloat::StatusAnd;

/// Helper selector carried by `IrOp::Call`. Argument order is listed per
/// variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Helper {
    /// `() -> value`
    CsrRead { csr: u16 },
    /// `(value) -> old`
    CsrWrite { csr: u16 },
    /// `(value, mask) -> old`
    CsrXchg { csr: u16 },
    /// `(addr) -> value`
    IocsrRead { size: u8 },
    /// `(addr, value)`
    IocsrWrite { size: u8 },
    Tlb(TlbOp),
    /// `(op, asid, vaddr)`
    Invtlb,
    /// `(base) -> next level`
    Lddir { level: u8 },
    /// `(base)`
    Ldpte { odd: bool },
    Ertn,
    /// `(resume_pc)`
    Idle,
    /// `(index) -> word`
    Cpucfg,
    /// `() -> counter`, or IPE when RDTIME is disabled at this PLV
    Rdtime,
    /// `() -> TID`
    CounterId,
    /// `(fj, fk) -> fd`
    FBinary { op: FBinOp, fmt: FpFmt },
    /// `(fj) -> fd`
    FUnary { op: FUnOp, fmt: FpFmt },
    /// `(fj, fk, fa) -> fd`
    FMulAdd { kind: FmaKind, fmt: FpFmt },
    /// `(fj, fk) -> 0 | 1`
    FCmp { cond: u8, fmt: FpFmt },
    /// `(fj) -> class bits`
    FClass { fmt: FpFmt },
    /// `(fj) -> fd`
    FCvt { kind: FCvtKind },
    /// `() -> fcsrN`
    ReadFcsr { index: u8 },
    /// `(value)`
    WriteFcsr { index: u8 },
}

/// What the executor does after a helper returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue(u64),
    Raise(ExceptionEvent),
}

fn arg(args: &[u64], index: usize) -> u64 {
    args.get(index).copied().unwrap_or(0)
}

/// Run `helper` with already-evaluated `args`.
pub fn call_helper(
    cpu: &mut CpuState,
    bus: &mut dyn Bus,
    helper: Helper,
    args: &[u64],
) -> CoreResult<Flow> {
    let pc = cpu.pc;
    let flow = match helper {
        Helper::CsrRead { csr } => Flow::Continue(cpu.csr_read_raw(csr)?),
        Helper::CsrWrite { csr } => Flow::Continue(cpu.csr_write_raw(csr, arg(args, 0))?),
        Helper::CsrXchg { csr } => {
            Flow::Continue(cpu.csr_xchg_raw(csr, arg(args, 0), arg(args, 1))?)
        }

        Helper::IocsrRead { size } => {
            let addr = arg(args, 0);
            match bus.iocsr_read(addr, size as u64) {
                Ok(value) => Flow::Continue(value),
                Err(e) => {
                    log::warn!("[CPU] IOCSR read at {:#x} failed: {}", addr, e);
                    Flow::Continue(0)
                }
            }
        }
        Helper::IocsrWrite { size } => {
            let addr = arg(args, 0);
            if let Err(e) = bus.iocsr_write(addr, size as u64, arg(args, 1)) {
                log::warn!("[CPU] IOCSR write at {:#x} failed: {}", addr, e);
            }
            Flow::Continue(0)
        }

        Helper::Tlb(op) => {
            match op {
                TlbOp::Clr => cpu.tlbclr(),
                TlbOp::Flush => cpu.tlbflush(),
                TlbOp::Srch => cpu.tlbsrch(),
                TlbOp::Rd => cpu.tlbrd(),
                TlbOp::Wr => cpu.tlbwr(),
                TlbOp::Fill => cpu.tlbfill(),
            }
            cpu.compute_hflags();
            Flow::Continue(0)
        }
        Helper::Invtlb => {
            let op = arg(args, 0) as u32;
            match cpu.invtlb(op, arg(args, 1), arg(args, 2)) {
                Ok(()) => Flow::Continue(0),
                Err(cause) => Flow::Raise(ExceptionEvent::new(cause, pc)),
            }
        }
        Helper::Lddir { level } => match cpu.lddir(bus, arg(args, 0), level as u64) {
            Ok(next) => Flow::Continue(next),
            Err(e) => {
                log::debug!("[TLB] LDDIR bus error: {}", e);
                Flow::Raise(ExceptionEvent::new(Exception::Adem, pc))
            }
        },
        Helper::Ldpte { odd } => match cpu.ldpte(bus, arg(args, 0), odd) {
            Ok(()) => Flow::Continue(0),
            Err(e) => {
                log::debug!("[TLB] LDPTE bus error: {}", e);
                Flow::Raise(ExceptionEvent::new(Exception::Adem, pc))
            }
        },

        Helper::Ertn => {
            cpu.ertn();
            Flow::Continue(0)
        }
        Helper::Idle => {
            cpu.pc = arg(args, 0);
            cpu.idle = true;
            log::trace!("[CPU] IDLE at {:#x}", pc);
            Flow::Continue(0)
        }
        Helper::Cpucfg => Flow::Continue(cpucfg(cpu, arg(args, 0))),
        Helper::Rdtime => {
            let misc = cpu.csr.get(CsrId::Misc);
            if extract64(misc, MISC_DRDTL_SHIFT + cpu.plv() as u32, 1) != 0 {
                Flow::Raise(ExceptionEvent::new(Exception::Ipe, pc))
            } else {
                Flow::Continue(cpu.rdtime())
            }
        }
        Helper::CounterId => Flow::Continue(cpu.csr.get(CsrId::Tid)),

        Helper::FBinary { op, fmt } => {
            let rm = cpu.fp_round();
            fp_result(cpu, fpu::binary(op, fmt, arg(args, 0), arg(args, 1), rm))
        }
        Helper::FUnary { op, fmt } => {
            let rm = cpu.fp_round();
            fp_result(cpu, fpu::unary(op, fmt, arg(args, 0), rm))
        }
        Helper::FMulAdd { kind, fmt } => {
            let rm = cpu.fp_round();
            let result = fpu::mul_add(kind, fmt, arg(args, 0), arg(args, 1), arg(args, 2), rm);
            fp_result(cpu, result)
        }
        Helper::FCmp { cond, fmt } => match fpu::compare(cond, fmt, arg(args, 0), arg(args, 1)) {
            Some(result) => fp_result(cpu, result.map(u64::from)),
            None => Flow::Raise(ExceptionEvent::new(Exception::Ine, pc)),
        },
        Helper::FClass { fmt } => Flow::Continue(fpu::classify(fmt, arg(args, 0))),
        Helper::FCvt { kind } => {
            let rm = cpu.fp_round();
            fp_result(cpu, fpu::convert(kind, arg(args, 0), rm))
        }
        Helper::ReadFcsr { index } => Flow::Continue(cpu.read_fcsr(index as usize) as u64),
        Helper::WriteFcsr { index } => {
            cpu.write_fcsr(index as usize, arg(args, 0) as u32);
            Flow::Continue(0)
        }
    };
    Ok(flow)
}

/// Fold the IEEE status into FCSR0; an enabled cause traps before the
/// destination is written.
fn fp_result(cpu: &mut CpuState, result: StatusAnd<u64>) -> Flow {
    match cpu.fp_fold(result.status) {
        Ok(()) => Flow::Continue(result.value),
        Err(cause) => Flow::Raise(ExceptionEvent::new(cause, cpu.pc)),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CPUCFG
// ═══════════════════════════════════════════════════════════════════════════

// Word 1
const CFG1_ARCH_LA64: u64 = 2;
const CFG1_PGMMU: u64 = 1 << 2;
const CFG1_IOCSR: u64 = 1 << 3;
const CFG1_PALEN_SHIFT: u32 = 4;
const CFG1_VALEN_SHIFT: u32 = 12;
const CFG1_UAL: u64 = 1 << 20;
const CFG1_RI: u64 = 1 << 21;
const CFG1_EP: u64 = 1 << 22;
const CFG1_RPLV: u64 = 1 << 23;
const CFG1_HP: u64 = 1 << 24;
// Word 2
const CFG2_FP: u64 = 1 << 0;
const CFG2_FP_SP: u64 = 1 << 1;
const CFG2_FP_DP: u64 = 1 << 2;
const CFG2_FP_VER: u64 = 1 << 3;
const CFG2_LLFTP: u64 = 1 << 14;
const CFG2_LLFTP_VER: u64 = 1 << 15;
const CFG2_LSPW: u64 = 1 << 21;
const CFG2_LAM: u64 = 1 << 22;
// Word 3
const CFG3_CACHE_BITS: u64 = 0xff;
const CFG3_SPW_LVL_SHIFT: u32 = 8;
const CFG3_SPW_HP_HF: u64 = 1 << 11;
const CFG3_RVA: u64 = 1 << 12;
const CFG3_RVAMAX_SHIFT: u32 = 13;

/// Stable counter frequency reported in word 4.
pub const CC_FREQ: u64 = 100_000_000;

fn cache_geometry(ways: u64, sets_log2: u64, line_log2: u64) -> u64 {
    (ways - 1) | (sets_log2 << 16) | (line_log2 << 24)
}

/// CPUCFG word `index`; unimplemented words read as zero.
pub fn cpucfg(cpu: &CpuState, index: u64) -> u64 {
    let config = &cpu.config;
    match index {
        0 => config.prid as u64,
        1 => {
            CFG1_ARCH_LA64
                | CFG1_PGMMU
                | CFG1_IOCSR
                | ((config.palen as u64 - 1) << CFG1_PALEN_SHIFT)
                | ((config.valen as u64 - 1) << CFG1_VALEN_SHIFT)
                | CFG1_UAL
                | CFG1_RI
                | CFG1_EP
                | CFG1_RPLV
                | CFG1_HP
        }
        2 => {
            CFG2_FP
                | CFG2_FP_SP
                | CFG2_FP_DP
                | CFG2_FP_VER
                | CFG2_LLFTP
                | CFG2_LLFTP_VER
                | CFG2_LSPW
                | CFG2_LAM
        }
        3 => {
            CFG3_CACHE_BITS
                | (4 << CFG3_SPW_LVL_SHIFT)
                | CFG3_SPW_HP_HF
                | CFG3_RVA
                | (7 << CFG3_RVAMAX_SHIFT)
        }
        4 => CC_FREQ,
        // CC_MUL = 1, CC_DIV = 1
        5 => 1 | (1 << 16),
        0x10 => 0x2c3d,
        0x11 | 0x12 => cache_geometry(4, 8, 6),
        0x13 => cache_geometry(16, 8, 6),
        0x14 => cache_geometry(16, 14, 6),
        _ => 0,
    }
}
