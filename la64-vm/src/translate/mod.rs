//! Translation emitter.
//!
//! Walks guest code from a start PC, decodes one instruction at a time and
//! emits its IR fragment into a `Backend`. A block ends at the first control
//! transfer, after `max_insns` instructions, at a 4 KiB page boundary, or at
//! an instruction that changes translation-relevant state (mode CSR writes,
//! TLB maintenance, ERTN, IDLE, IBAR).
//!
//! Per-block context lives in `DisasContext`: the mode flags the block is
//! translated under and the pending branch recorded by the last instruction.
//! The branch is turned into the block's exit op once the instruction that
//! produced it has been fully emitted.
//!
//! Translation never fails. Encodings that decode to nothing, or whose
//! privilege/feature preconditions are not met, become a `Raise` op that
//! faults when the block runs.

mod trans_arith;
mod trans_branch;
mod trans_float;
mod trans_memory;
mod trans_privileged;

use crate::bus::Bus;
use crate::config::GUEST_PAGE_MASK;
use crate::cpu::{Exception, HFlags};
use crate::engine::decoder::{Op, decode};
use crate::ir::{Backend, Cond, IrOp, Operand, Temp};

/// Branch recorded by the current instruction, materialized at block end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingBranch {
    None,
    /// b / bl
    Unconditional { target: u64 },
    /// beq..bgeu, beqz/bnez, bceqz/bcnez
    Conditional { cond: Cond, a: Operand, b: Operand, target: u64 },
    /// jirl
    Indirect { target: Operand },
}

/// Where translation stands after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Keep going with the next instruction
    Running,
    /// Stop here; the block falls through to the next PC
    EndAtNext,
    /// Stop here; an exit op has already been emitted
    Exited,
}

/// Per-block translation context.
#[derive(Debug, Clone)]
pub struct DisasContext {
    /// First guest PC of the block
    pub base_pc: u64,
    /// PC of the instruction being translated
    pub pc: u64,
    /// Mode flags the block is translated under
    pub flags: HFlags,
    /// The only place branch state lives; `HFlags` carries mode bits only
    pub pending: PendingBranch,
    /// Instructions translated so far
    pub num_insns: u32,
    pub max_insns: u32,
}

impl DisasContext {
    pub fn new(pc: u64, flags: HFlags, max_insns: u32) -> Self {
        Self {
            base_pc: pc,
            pc,
            flags,
            pending: PendingBranch::None,
            num_insns: 0,
            max_insns: max_insns.max(1),
        }
    }

    pub fn next_pc(&self) -> u64 {
        self.pc.wrapping_add(4)
    }

    /// Truncate a computed address to 32 bits outside 64-bit mode.
    pub fn address(&self, addr: u64) -> u64 {
        if self.flags.contains(HFlags::MODE64) {
            addr
        } else {
            addr & 0xffff_ffff
        }
    }
}

/// Emits IR for one block into `B`.
pub struct Translator<'a, B: Backend> {
    pub(crate) backend: &'a mut B,
    pub(crate) ctx: DisasContext,
}

impl<'a, B: Backend> Translator<'a, B> {
    pub fn new(backend: &'a mut B, ctx: DisasContext) -> Self {
        Self { backend, ctx }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Emission shorthands
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn emit(&mut self, op: IrOp) {
        self.backend.emit(op);
    }

    pub(crate) fn temp(&mut self) -> Temp {
        self.backend.new_temporary()
    }

    /// Raise `cause` at this instruction and end the block.
    pub(crate) fn raise(&mut self, cause: Exception) -> BlockState {
        self.emit(IrOp::Raise { cause, badv: None });
        BlockState::Exited
    }

    /// Leave the block after this instruction.
    pub(crate) fn end_after(&mut self) -> BlockState {
        let next = self.ctx.next_pc();
        self.emit(IrOp::Goto { target: next });
        BlockState::Exited
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Per-instruction dispatch
    // ═══════════════════════════════════════════════════════════════════════

    /// Emit the fragment for `insn` at `ctx.pc`.
    pub fn translate_insn(&mut self, insn: u32) -> BlockState {
        self.emit(IrOp::InsnStart { pc: self.ctx.pc, insn });

        let Some(op) = decode(insn) else {
            log::trace!("[TB] Undecodable word {:#010x} at {:#x}", insn, self.ctx.pc);
            return self.raise(Exception::Ine);
        };

        if let Some(cause) = self.precondition_fault(&op) {
            return self.raise(cause);
        }

        match op {
            Op::Alu { .. }
            | Op::AluImm { .. }
            | Op::Bit { .. }
            | Op::Alsl { .. }
            | Op::Bytepick { .. }
            | Op::Bstrins { .. }
            | Op::Bstrpick { .. }
            | Op::Lu12iW { .. }
            | Op::Lu32iD { .. }
            | Op::Lu52iD { .. }
            | Op::Addu16iD { .. }
            | Op::PcRel { .. } => self.trans_arith(op),

            Op::Load { .. }
            | Op::LoadIndexed { .. }
            | Op::Store { .. }
            | Op::StoreIndexed { .. }
            | Op::FLoad { .. }
            | Op::FLoadIndexed { .. }
            | Op::FStore { .. }
            | Op::FStoreIndexed { .. }
            | Op::Preld { .. }
            | Op::Preldx { .. }
            | Op::Ll { .. }
            | Op::Sc { .. }
            | Op::Amo { .. }
            | Op::Dbar { .. }
            | Op::Ibar { .. }
            | Op::BoundCheck { .. } => self.trans_memory(op),

            Op::Branch { .. }
            | Op::BranchZero { .. }
            | Op::BranchFcc { .. }
            | Op::Jirl { .. }
            | Op::B { .. }
            | Op::Bl { .. } => self.trans_branch(op),

            Op::FBinary { .. }
            | Op::FUnary { .. }
            | Op::FClass { .. }
            | Op::FMulAdd { .. }
            | Op::FCmp { .. }
            | Op::FSel { .. }
            | Op::FCvt { .. }
            | Op::FMove { .. } => self.trans_float(op),

            // Vector ops that pass the enable checks are not implemented
            Op::Vector { .. } => self.raise(Exception::Ine),

            _ => self.trans_privileged(op),
        }
    }

    /// Privilege, coprocessor-enable and mode checks, in priority order.
    fn precondition_fault(&self, op: &Op) -> Option<Exception> {
        let flags = self.ctx.flags;
        if op.is_privileged() && flags.plv() != 0 {
            return Some(Exception::Ipe);
        }
        if op.uses_fpu() && !flags.contains(HFlags::FPE) {
            return Some(Exception::Fpd);
        }
        if let Op::Vector { asx } = *op {
            if !asx && !flags.contains(HFlags::SXE) {
                return Some(Exception::Sxd);
            }
            if asx && !flags.contains(HFlags::ASXE) {
                return Some(Exception::Asxd);
            }
        }
        if op.requires_la64() && !flags.contains(HFlags::MODE64) {
            return Some(Exception::Ine);
        }
        None
    }

    /// Turn the pending branch into the block's exit op.
    fn materialize_branch(&mut self) -> bool {
        let next = self.ctx.next_pc();
        let exit = match std::mem::replace(&mut self.ctx.pending, PendingBranch::None) {
            PendingBranch::None => return false,
            PendingBranch::Unconditional { target } => IrOp::Goto { target },
            PendingBranch::Conditional { cond, a, b, target } => IrOp::BrCond {
                cond,
                a,
                b,
                taken: target,
                not_taken: next,
            },
            PendingBranch::Indirect { target } => IrOp::GotoIndirect { target },
        };
        self.emit(exit);
        true
    }
}

/// Translate the block starting at guest `pc`, whose first instruction
/// lives at physical `phys_pc`. Instructions are fetched from `bus`; the
/// block never leaves the page of `phys_pc`.
pub fn translate_block<B: Backend>(
    backend: &mut B,
    bus: &mut dyn Bus,
    pc: u64,
    phys_pc: u64,
    flags: HFlags,
    max_insns: u32,
) -> B::Output {
    let mut t = Translator::new(backend, DisasContext::new(pc, flags, max_insns));

    loop {
        let offset = t.ctx.pc.wrapping_sub(t.ctx.base_pc);
        let insn = match bus.read_u32(phys_pc.wrapping_add(offset)) {
            Ok(word) => word,
            Err(e) if t.ctx.num_insns == 0 => {
                log::debug!("[TB] Fetch at {:#x} failed: {}", pc, e);
                t.emit(IrOp::InsnStart { pc, insn: 0 });
                t.emit(IrOp::Raise { cause: Exception::Adef, badv: Some(pc) });
                break;
            }
            Err(_) => {
                // Let the next block lookup fault on this PC
                let here = t.ctx.pc;
                t.emit(IrOp::Goto { target: here });
                break;
            }
        };

        let state = t.translate_insn(insn);
        t.ctx.num_insns += 1;

        if t.materialize_branch() {
            break;
        }
        match state {
            BlockState::Exited => break,
            BlockState::EndAtNext => {
                t.end_after();
                break;
            }
            BlockState::Running => {}
        }

        let next = t.ctx.next_pc();
        if t.ctx.num_insns >= t.ctx.max_insns || next & !GUEST_PAGE_MASK == 0 {
            t.end_after();
            break;
        }
        t.ctx.pc = next;
    }

    log::trace!(
        "[TB] Translated block at {:#x} ({} insns)",
        pc,
        t.ctx.num_insns
    );
    t.backend.finalize_block()
}
