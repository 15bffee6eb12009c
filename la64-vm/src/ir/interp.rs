//! Reference IR executor.
//!
//! Runs an `IrBlock` op by op against the architectural state. Guest
//! memory accesses translate through `CpuState::translate_or_fault`; any
//! guest-visible fault is dispatched through `raise_exception` immediately
//! and ends the block. Only internal-consistency failures come back as
//! `Err`.

use super::{BinOp, IrBlock, IrOp, Operand, Place, RmwOp, UnOp, Width};
use crate::bits::{deposit64, extract64, mask64, sext};
use crate::bus::Bus;
use crate::config::{GUEST_PAGE_MASK, GUEST_PAGE_SIZE};
use crate::cpu::csr::{CsrId, MISC_ALCL_SHIFT};
use crate::cpu::{CpuState, Exception, ExceptionEvent};
use crate::error::{CoreError, CoreResult};
use crate::helpers::{Flow, call_helper};
use crate::mmu::AccessKind;

/// How a block finished. `cpu.pc` always holds the next PC to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    /// Static successor
    Chain(u64),
    /// Computed successor (indirect jump, ERTN, block-ending CSR write)
    Jump,
    /// A trap was taken; `cpu.pc` is the handler entry
    Exception(Exception),
    /// IDLE executed
    Idle,
    /// A store hit a page holding translated code
    CodeModified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit: BlockExit,
    /// Instructions retired by this run
    pub insns: u32,
    /// Physical code pages written by this run
    pub dirty_code: Vec<u64>,
}

/// Execute `block`. `is_code_page` tells whether a physical page holds
/// translated code; stores into such pages end the block at the next
/// instruction boundary.
pub fn execute(
    block: &IrBlock,
    cpu: &mut CpuState,
    bus: &mut dyn Bus,
    is_code_page: &dyn Fn(u64) -> bool,
) -> CoreResult<ExecOutcome> {
    let mut exec = Executor {
        cpu,
        bus,
        temps: vec![None; block.num_temps as usize],
        is_code_page,
        dirty_code: Vec::new(),
        started: 0,
    };
    exec.run(block)
}

struct Executor<'a> {
    cpu: &'a mut CpuState,
    bus: &'a mut dyn Bus,
    temps: Vec<Option<u64>>,
    is_code_page: &'a dyn Fn(u64) -> bool,
    dirty_code: Vec<u64>,
    /// Instructions begun so far
    started: u32,
}

impl Executor<'_> {
    fn run(&mut self, block: &IrBlock) -> CoreResult<ExecOutcome> {
        for op in &block.ops {
            match op {
                IrOp::InsnStart { pc, insn } => {
                    if !self.dirty_code.is_empty() {
                        self.cpu.pc = *pc;
                        return Ok(self.finish(BlockExit::CodeModified, self.started));
                    }
                    self.started += 1;
                    self.cpu.pc = *pc;
                    self.cpu.cur_insn = *insn;
                }
                IrOp::Mov { dst, src } => {
                    let v = self.read(*src)?;
                    self.write(*dst, v)?;
                }
                IrOp::Binary { op, width, dst, a, b } => {
                    let v = binary(*op, *width, self.read(*a)?, self.read(*b)?);
                    self.write(*dst, v)?;
                }
                IrOp::Unary { op, width, dst, src } => {
                    let v = unary(*op, *width, self.read(*src)?);
                    self.write(*dst, v)?;
                }
                IrOp::SetCond { cond, dst, a, b } => {
                    let v = cond.eval(self.read(*a)?, self.read(*b)?) as u64;
                    self.write(*dst, v)?;
                }
                IrOp::Select { dst, test, if_true, if_false } => {
                    let v = if self.read(*test)? != 0 {
                        self.read(*if_true)?
                    } else {
                        self.read(*if_false)?
                    };
                    self.write(*dst, v)?;
                }
                IrOp::Extract { dst, src, lsb, len, signed } => {
                    let raw = extract64(self.read(*src)?, *lsb as u32, *len as u32);
                    let v = if *signed { sext(raw, *len as u32) as u64 } else { raw };
                    self.write(*dst, v)?;
                }
                IrOp::Deposit { dst, base, field, lsb, len } => {
                    let v = deposit64(self.read(*base)?, *lsb as u32, *len as u32, self.read(*field)?);
                    self.write(*dst, v)?;
                }

                IrOp::Load { dst, addr, size, signed } => {
                    let vaddr = self.read(*addr)?;
                    match self.load(vaddr, *size, false) {
                        Ok(raw) => {
                            let v = extend(raw, *size, *signed);
                            self.write(*dst, v)?;
                        }
                        Err(event) => return self.fault(event),
                    }
                }
                IrOp::Store { src, addr, size } => {
                    let vaddr = self.read(*addr)?;
                    let value = self.read(*src)?;
                    if let Err(event) = self.store(vaddr, *size, value, false) {
                        return self.fault(event);
                    }
                }
                IrOp::LoadLinked { dst, addr, size } => {
                    let vaddr = self.cpu.effective_address(self.read(*addr)?);
                    match self.load(vaddr, *size, true) {
                        Ok(raw) => {
                            let v = extend(raw, *size, true);
                            self.cpu.lladdr = vaddr;
                            self.cpu.llval = v;
                            self.cpu.set_llbit(true);
                            self.write(*dst, v)?;
                        }
                        Err(event) => return self.fault(event),
                    }
                }
                IrOp::StoreCond { dst, addr, src, size } => {
                    let vaddr = self.cpu.effective_address(self.read(*addr)?);
                    let value = self.read(*src)?;
                    match self.store_conditional(vaddr, *size, value) {
                        Ok(success) => self.write(*dst, success as u64)?,
                        Err(event) => return self.fault(event),
                    }
                }
                IrOp::AtomicRmw { op, dst, addr, src, size } => {
                    let vaddr = self.read(*addr)?;
                    let operand = self.read(*src)?;
                    match self.atomic(*op, vaddr, *size, operand) {
                        Ok(old) => self.write(*dst, old)?,
                        Err(event) => return self.fault(event),
                    }
                }
                IrOp::Fence => {}

                IrOp::Call { helper, dst, args } => {
                    let mut values = Vec::with_capacity(args.len());
                    for a in args {
                        values.push(self.read(*a)?);
                    }
                    match call_helper(self.cpu, self.bus, *helper, &values)? {
                        Flow::Continue(v) => {
                            if let Some(dst) = dst {
                                self.write(*dst, v)?;
                            }
                        }
                        Flow::Raise(event) => return self.fault(event),
                    }
                }
                IrOp::Raise { cause, badv } => {
                    let event = match badv {
                        Some(va) => ExceptionEvent::with_address(*cause, self.cpu.pc, *va),
                        None => ExceptionEvent::new(*cause, self.cpu.pc),
                    };
                    return self.fault(event);
                }
                IrOp::Check { cond, a, b, cause } => {
                    if !cond.eval(self.read(*a)?, self.read(*b)?) {
                        return self.fault(ExceptionEvent::new(*cause, self.cpu.pc));
                    }
                }

                IrOp::Goto { target } => {
                    self.cpu.pc = self.cpu.effective_address(*target);
                    return Ok(self.finish(BlockExit::Chain(self.cpu.pc), self.started));
                }
                IrOp::GotoIndirect { target } => {
                    let target = self.read(*target)?;
                    self.cpu.pc = self.cpu.effective_address(target);
                    return Ok(self.finish(BlockExit::Jump, self.started));
                }
                IrOp::BrCond { cond, a, b, taken, not_taken } => {
                    let next = if cond.eval(self.read(*a)?, self.read(*b)?) {
                        *taken
                    } else {
                        *not_taken
                    };
                    self.cpu.pc = self.cpu.effective_address(next);
                    return Ok(self.finish(BlockExit::Chain(self.cpu.pc), self.started));
                }
                IrOp::ExitTb => {
                    let exit = if self.cpu.idle { BlockExit::Idle } else { BlockExit::Jump };
                    return Ok(self.finish(exit, self.started));
                }
            }
        }

        // Blocks always end in an exit op; fall through to the next PC anyway.
        self.cpu.pc = block.pc.wrapping_add(block.byte_len());
        Ok(self.finish(BlockExit::Jump, self.started))
    }

    fn finish(&mut self, exit: BlockExit, insns: u32) -> ExecOutcome {
        ExecOutcome {
            exit,
            insns,
            dirty_code: std::mem::take(&mut self.dirty_code),
        }
    }

    /// Take the trap; the faulting instruction does not retire.
    fn fault(&mut self, event: ExceptionEvent) -> CoreResult<ExecOutcome> {
        self.cpu.raise_exception(event)?;
        let retired = self.started.saturating_sub(1);
        Ok(self.finish(BlockExit::Exception(event.cause), retired))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Operands
    // ═══════════════════════════════════════════════════════════════════════

    fn read(&self, operand: Operand) -> CoreResult<u64> {
        Ok(match operand {
            Operand::Gpr(r) => self.cpu.read_gpr(r as usize),
            Operand::Fpr(r) => self.cpu.fpr[(r & 31) as usize],
            Operand::Fcc(r) => self.cpu.fcc[(r & 7) as usize] as u64,
            Operand::Imm(v) => v,
            Operand::Temp(t) => self
                .temps
                .get(t.0 as usize)
                .copied()
                .flatten()
                .ok_or_else(|| {
                    log::error!("[TB] Read of undefined temporary t{}", t.0);
                    CoreError::UndefinedTemp(t.0)
                })?,
        })
    }

    fn write(&mut self, place: Place, value: u64) -> CoreResult<()> {
        match place {
            Place::Gpr(r) => self.cpu.write_gpr(r as usize, value),
            Place::Fpr(r) => self.cpu.fpr[(r & 31) as usize] = value,
            Place::Fcc(r) => self.cpu.fcc[(r & 7) as usize] = value != 0,
            Place::Temp(t) => {
                let slot = self
                    .temps
                    .get_mut(t.0 as usize)
                    .ok_or(CoreError::UndefinedTemp(t.0))?;
                *slot = Some(value);
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Memory
    // ═══════════════════════════════════════════════════════════════════════

    /// MISC.ALCL for the current privilege level.
    fn alignment_checked(&self) -> bool {
        let misc = self.cpu.csr.get(CsrId::Misc);
        extract64(misc, MISC_ALCL_SHIFT + self.cpu.plv() as u32, 1) != 0
    }

    fn check_alignment(&self, vaddr: u64, size: u8, always: bool) -> Result<(), ExceptionEvent> {
        if (always || self.alignment_checked()) && vaddr & (size as u64 - 1) != 0 {
            return Err(ExceptionEvent::with_address(Exception::Ale, self.cpu.pc, vaddr));
        }
        Ok(())
    }

    fn translate(&self, vaddr: u64, access: AccessKind) -> Result<u64, ExceptionEvent> {
        self.cpu.translate_or_fault(vaddr, access, self.cpu.pc)
    }

    fn bus_fault(&self, vaddr: u64) -> ExceptionEvent {
        ExceptionEvent::with_address(Exception::Adem, self.cpu.pc, vaddr)
    }

    fn crosses_page(vaddr: u64, size: u8) -> bool {
        (vaddr & !GUEST_PAGE_MASK) + size as u64 > GUEST_PAGE_SIZE
    }

    fn load(&mut self, vaddr: u64, size: u8, aligned: bool) -> Result<u64, ExceptionEvent> {
        let vaddr = self.cpu.effective_address(vaddr);
        self.check_alignment(vaddr, size, aligned)?;

        if Self::crosses_page(vaddr, size) {
            let mut value = 0;
            for i in 0..size as u64 {
                let va = self.cpu.effective_address(vaddr.wrapping_add(i));
                let paddr = self.translate(va, AccessKind::Load)?;
                let byte = self.bus.load(paddr, 1).map_err(|_| self.bus_fault(va))?;
                value |= byte << (i * 8);
            }
            return Ok(value);
        }

        let paddr = self.translate(vaddr, AccessKind::Load)?;
        self.bus
            .load(paddr, size as u64)
            .map_err(|_| self.bus_fault(vaddr))
    }

    fn store(&mut self, vaddr: u64, size: u8, value: u64, aligned: bool) -> Result<(), ExceptionEvent> {
        let vaddr = self.cpu.effective_address(vaddr);
        self.check_alignment(vaddr, size, aligned)?;

        if Self::crosses_page(vaddr, size) {
            // Translate every byte before writing any of them
            let mut targets = Vec::with_capacity(size as usize);
            for i in 0..size as u64 {
                let va = self.cpu.effective_address(vaddr.wrapping_add(i));
                targets.push((va, self.translate(va, AccessKind::Store)?));
            }
            for (i, (va, paddr)) in targets.into_iter().enumerate() {
                self.bus
                    .store(paddr, 1, value >> (i * 8))
                    .map_err(|_| self.bus_fault(va))?;
                self.note_store(paddr);
            }
            return Ok(());
        }

        let paddr = self.translate(vaddr, AccessKind::Store)?;
        self.bus
            .store(paddr, size as u64, value)
            .map_err(|_| self.bus_fault(vaddr))?;
        self.note_store(paddr);
        Ok(())
    }

    fn note_store(&mut self, paddr: u64) {
        let page = paddr & GUEST_PAGE_MASK;
        if (self.is_code_page)(page) && !self.dirty_code.contains(&page) {
            log::debug!("[TB] Store into code page {:#x}", page);
            self.dirty_code.push(page);
        }
    }

    /// SC: succeeds only while the LL bit is set, the address matches the
    /// LL address and memory still holds the value LL observed. The LL bit
    /// is always cleared.
    fn store_conditional(&mut self, vaddr: u64, size: u8, value: u64) -> Result<bool, ExceptionEvent> {
        self.check_alignment(vaddr, size, true)?;
        let linked = self.cpu.llbit() && self.cpu.lladdr == vaddr;
        self.cpu.set_llbit(false);
        if !linked {
            return Ok(false);
        }
        let paddr = self.translate(vaddr, AccessKind::Store)?;
        let current = self
            .bus
            .load(paddr, size as u64)
            .map_err(|_| self.bus_fault(vaddr))?;
        if extend(current, size, true) != self.cpu.llval {
            return Ok(false);
        }
        self.bus
            .store(paddr, size as u64, value)
            .map_err(|_| self.bus_fault(vaddr))?;
        self.note_store(paddr);
        Ok(true)
    }

    /// AM*: returns the old value, sign-extended for word forms.
    fn atomic(&mut self, op: RmwOp, vaddr: u64, size: u8, operand: u64) -> Result<u64, ExceptionEvent> {
        let vaddr = self.cpu.effective_address(vaddr);
        self.check_alignment(vaddr, size, true)?;
        let paddr = self.translate(vaddr, AccessKind::Store)?;
        let raw = self
            .bus
            .load(paddr, size as u64)
            .map_err(|_| self.bus_fault(vaddr))?;
        let old = extend(raw, size, true);
        let width = if size == 4 { Width::W32 } else { Width::W64 };
        let new = rmw(op, width, old, operand);
        self.bus
            .store(paddr, size as u64, new)
            .map_err(|_| self.bus_fault(vaddr))?;
        self.note_store(paddr);
        Ok(old)
    }
}

fn extend(raw: u64, size: u8, signed: bool) -> u64 {
    let bits = size as u32 * 8;
    if bits >= 64 {
        raw
    } else if signed {
        sext(raw, bits) as u64
    } else {
        raw & mask64(bits)
    }
}

fn sext32(v: u32) -> u64 {
    v as i32 as i64 as u64
}

// ═══════════════════════════════════════════════════════════════════════════
// Arithmetic
// ═══════════════════════════════════════════════════════════════════════════

pub fn binary(op: BinOp, width: Width, a: u64, b: u64) -> u64 {
    match width {
        Width::W64 => binary64(op, a, b),
        Width::W32 => sext32(binary32(op, a as u32, b as u32)),
    }
}

fn binary64(op: BinOp, a: u64, b: u64) -> u64 {
    match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Nor => !(a | b),
        BinOp::Andn => a & !b,
        BinOp::Orn => a | !b,
        BinOp::Shl => a << (b & 63),
        BinOp::Shr => a >> (b & 63),
        BinOp::Sar => ((a as i64) >> (b & 63)) as u64,
        BinOp::Rotr => a.rotate_right((b & 63) as u32),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::MulHs => ((a as i64 as i128 * b as i64 as i128) >> 64) as u64,
        BinOp::MulHu => ((a as u128 * b as u128) >> 64) as u64,
        BinOp::Div => {
            let (x, y) = (a as i64, b as i64);
            if y == 0 || (x == i64::MIN && y == -1) { a } else { (x / y) as u64 }
        }
        BinOp::DivU => if b == 0 { a } else { a / b },
        BinOp::Rem => {
            let (x, y) = (a as i64, b as i64);
            if y == 0 || (x == i64::MIN && y == -1) { 0 } else { (x % y) as u64 }
        }
        BinOp::RemU => if b == 0 { 0 } else { a % b },
        BinOp::MaskEqz => if b == 0 { 0 } else { a },
        BinOp::MaskNez => if b != 0 { 0 } else { a },
    }
}

fn binary32(op: BinOp, a: u32, b: u32) -> u32 {
    match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Nor => !(a | b),
        BinOp::Andn => a & !b,
        BinOp::Orn => a | !b,
        BinOp::Shl => a << (b & 31),
        BinOp::Shr => a >> (b & 31),
        BinOp::Sar => ((a as i32) >> (b & 31)) as u32,
        BinOp::Rotr => a.rotate_right(b & 31),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::MulHs => ((a as i32 as i64 * b as i32 as i64) >> 32) as u32,
        BinOp::MulHu => ((a as u64 * b as u64) >> 32) as u32,
        BinOp::Div => {
            let (x, y) = (a as i32, b as i32);
            if y == 0 || (x == i32::MIN && y == -1) { a } else { (x / y) as u32 }
        }
        BinOp::DivU => if b == 0 { a } else { a / b },
        BinOp::Rem => {
            let (x, y) = (a as i32, b as i32);
            if y == 0 || (x == i32::MIN && y == -1) { 0 } else { (x % y) as u32 }
        }
        BinOp::RemU => if b == 0 { 0 } else { a % b },
        BinOp::MaskEqz => if b == 0 { 0 } else { a },
        BinOp::MaskNez => if b != 0 { 0 } else { a },
    }
}

pub fn unary(op: UnOp, width: Width, a: u64) -> u64 {
    match width {
        Width::W64 => match op {
            UnOp::Clz => a.leading_zeros() as u64,
            UnOp::Ctz => a.trailing_zeros() as u64,
            UnOp::Clo => a.leading_ones() as u64,
            UnOp::Cto => a.trailing_ones() as u64,
            UnOp::RevbH => ((a >> 8) & 0x00ff_00ff_00ff_00ff) | ((a & 0x00ff_00ff_00ff_00ff) << 8),
            UnOp::RevbW => {
                let lo = (a as u32).swap_bytes() as u64;
                let hi = ((a >> 32) as u32).swap_bytes() as u64;
                (hi << 32) | lo
            }
            UnOp::Revb => a.swap_bytes(),
            UnOp::RevhW => ((a >> 16) & 0x0000_ffff_0000_ffff) | ((a & 0x0000_ffff_0000_ffff) << 16),
            UnOp::Revh => {
                let swapped = ((a >> 16) & 0x0000_ffff_0000_ffff) | ((a & 0x0000_ffff_0000_ffff) << 16);
                swapped.rotate_left(32)
            }
            UnOp::BitrevB => a.reverse_bits().swap_bytes(),
            UnOp::Bitrev => a.reverse_bits(),
            UnOp::Not => !a,
        },
        Width::W32 => {
            let x = a as u32;
            sext32(match op {
                UnOp::Clz => x.leading_zeros(),
                UnOp::Ctz => x.trailing_zeros(),
                UnOp::Clo => x.leading_ones(),
                UnOp::Cto => x.trailing_ones(),
                UnOp::RevbH => ((x >> 8) & 0x00ff_00ff) | ((x & 0x00ff_00ff) << 8),
                UnOp::RevbW | UnOp::Revb => x.swap_bytes(),
                UnOp::RevhW | UnOp::Revh => x.rotate_left(16),
                UnOp::BitrevB => x.reverse_bits().swap_bytes(),
                UnOp::Bitrev => x.reverse_bits(),
                UnOp::Not => !x,
            })
        }
    }
}

/// New memory value of an AM* operation on the (already extended) old value.
fn rmw(op: RmwOp, width: Width, old: u64, operand: u64) -> u64 {
    let (o, v) = match width {
        Width::W32 => (sext32(old as u32), sext32(operand as u32)),
        Width::W64 => (old, operand),
    };
    let (uo, uv) = match width {
        Width::W32 => (o & 0xffff_ffff, v & 0xffff_ffff),
        Width::W64 => (o, v),
    };
    match op {
        RmwOp::Swap => v,
        RmwOp::Add => o.wrapping_add(v),
        RmwOp::And => o & v,
        RmwOp::Or => o | v,
        RmwOp::Xor => o ^ v,
        RmwOp::Max => if (o as i64) >= (v as i64) { o } else { v },
        RmwOp::Min => if (o as i64) <= (v as i64) { o } else { v },
        RmwOp::MaxU => if uo >= uv { o } else { v },
        RmwOp::MinU => if uo <= uv { o } else { v },
    }
}
