//! Execution engines.
//!
//! A core runs under exactly one engine, chosen when the core is set up:
//!
//! - **`SoftwareEngine`**: fetch → translate → execute. Instructions are
//!   decoded and emitted as IR blocks, cached by (PC, physical PC, flags),
//!   and run by the IR executor against `CpuState` and the MMU.
//! - **`AcceleratedEngine`**: hands the guest to an external virtual CPU
//!   (`AccelVcpu`). Decode, translation and the TLB belong to the
//!   accelerator; the only contact with this crate's state is the snapshot
//!   exchanged through `export_state`/`import_state`.
//!
//! Both implement `ExecutionEngine`, so the embedding machine drives them the
//! same way.

pub mod decoder;

use crate::bus::Bus;
use crate::cache::{TbCache, TbKey};
use crate::config::CoreConfig;
use crate::cpu::csr::{CsrId, TLBRERA_ISTLBR};
use crate::cpu::{CpuState, Exception, ExceptionEvent};
use crate::error::CoreResult;
use crate::ir::IrBuilder;
use crate::ir::interp::{BlockExit, execute};
use crate::mmu::AccessKind;
use crate::snapshot::CoreSnapshot;
use crate::trace::{TraceBuffer, TraceEvent};
use crate::translate::translate_block;
use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════════
// Engine abstraction
// ═══════════════════════════════════════════════════════════════════════════

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The step budget was used up
    Budget,
    /// Waiting in IDLE with no interrupt pending and no timer armed
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    /// Guest instructions retired
    pub insns: u64,
    pub stop: StopReason,
}

pub trait ExecutionEngine {
    fn name(&self) -> &'static str;

    /// Run for about `budget` instructions. A block that faults before
    /// retiring anything still consumes one unit so trap loops terminate.
    fn run(&mut self, bus: &mut dyn Bus, budget: u64) -> CoreResult<RunResult>;

    fn export_state(&self) -> CoreResult<CoreSnapshot>;

    fn import_state(&mut self, snap: &CoreSnapshot) -> CoreResult<()>;

    /// Drive interrupt line `line` (ESTAT.IS bit) to `level`.
    fn inject_interrupt(&mut self, line: u32, level: bool) -> CoreResult<()>;

    fn inject_reset(&mut self) -> CoreResult<()>;
}

/// Use the accelerator when one is supplied, the software path otherwise.
pub fn select_engine(
    config: CoreConfig,
    accel: Option<Box<dyn AccelVcpu>>,
) -> CoreResult<Box<dyn ExecutionEngine>> {
    match accel {
        Some(vcpu) => {
            log::info!("[ENGINE] Core {} using accelerated engine", config.core_id);
            Ok(Box::new(AcceleratedEngine::new(vcpu)))
        }
        None => {
            log::info!("[ENGINE] Core {} using software engine", config.core_id);
            Ok(Box::new(SoftwareEngine::new(config)?))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Software engine
// ═══════════════════════════════════════════════════════════════════════════

/// Counters kept by the software engine across runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub blocks_executed: u64,
    pub blocks_translated: u64,
    pub exceptions: u64,
    pub interrupts: u64,
    pub code_invalidations: u64,
}

pub struct SoftwareEngine {
    pub cpu: CpuState,
    pub cache: TbCache,
    pub trace: TraceBuffer,
    stats: EngineStats,
}

impl SoftwareEngine {
    pub fn new(config: CoreConfig) -> CoreResult<Self> {
        let mut trace = TraceBuffer::new(config.trace_capacity);
        if config.trace_enabled {
            trace.enable();
        }
        let cache = TbCache::new(config.tb_cache_entries);
        Ok(Self {
            cpu: CpuState::new(config)?,
            cache,
            trace,
            stats: EngineStats::default(),
        })
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Fetch, translate if needed, and execute one block at `cpu.pc`.
    /// Returns the instructions retired.
    pub fn step_block(&mut self, bus: &mut dyn Bus) -> CoreResult<u32> {
        if self.cpu.take_tb_flush() {
            self.cache.flush();
            self.trace.push(TraceEvent::Invalidate { page: None, reason: "tlb flush" });
        }

        if self.cpu.interrupt_deliverable() {
            let pc = self.cpu.pc;
            let pending = self.cpu.pending_interrupts();
            if self.cpu.deliver_interrupt()? {
                self.stats.interrupts += 1;
                self.trace.push(TraceEvent::Interrupt { pc, pending });
            }
        }

        let pc = self.cpu.pc;
        if pc & 3 != 0 {
            self.take_exception(ExceptionEvent::with_address(Exception::Adef, pc, pc))?;
            return Ok(0);
        }
        let vaddr = self.cpu.effective_address(pc);
        let phys_pc = match self.cpu.translate_or_fault(vaddr, AccessKind::Fetch, pc) {
            Ok(paddr) => paddr,
            Err(event) => {
                self.take_exception(event)?;
                return Ok(0);
            }
        };

        let block = self.lookup_or_translate(bus, pc, phys_pc);
        let cache = &self.cache;
        let outcome = execute(&block, &mut self.cpu, bus, &|paddr| cache.is_code_page(paddr))?;

        self.stats.blocks_executed += 1;
        self.cache.record_executed(outcome.insns);
        self.cpu.advance(outcome.insns as u64);
        self.trace.push(TraceEvent::Execute {
            pc,
            next_pc: self.cpu.pc,
            insns: outcome.insns,
        });

        for page in &outcome.dirty_code {
            let dropped = self.cache.invalidate_page(*page);
            if dropped > 0 {
                self.stats.code_invalidations += 1;
                self.trace.push(TraceEvent::Invalidate {
                    page: Some(*page),
                    reason: "code store",
                });
            }
        }

        match outcome.exit {
            BlockExit::Exception(cause) => {
                self.stats.exceptions += 1;
                self.trace.push(TraceEvent::Exception {
                    pc: reported_pc(&self.cpu, cause),
                    cause,
                    handler: self.cpu.pc,
                });
            }
            BlockExit::Idle => self.trace.push(TraceEvent::Idle { pc }),
            BlockExit::Chain(_) | BlockExit::Jump | BlockExit::CodeModified => {}
        }
        Ok(outcome.insns)
    }

    fn lookup_or_translate(&mut self, bus: &mut dyn Bus, pc: u64, phys_pc: u64) -> Arc<crate::ir::IrBlock> {
        let flags = self.cpu.hflags;
        let key = TbKey {
            pc,
            phys_pc,
            flags: flags.tb_flags(),
        };
        if let Some(block) = self.cache.get(&key) {
            self.trace.push(TraceEvent::CacheLookup { pc, hit: true });
            return block;
        }
        self.trace.push(TraceEvent::CacheLookup { pc, hit: false });

        let max_insns = self.cpu.config.max_block_insns as u32;
        let mut builder = IrBuilder::new(pc, phys_pc, key.flags);
        let block = translate_block(&mut builder, bus, pc, phys_pc, flags, max_insns);
        log::trace!(
            "[TB] Translated {:#x} (phys {:#x}): {} insns, {} ops",
            pc,
            phys_pc,
            block.icount,
            block.ops.len()
        );
        self.stats.blocks_translated += 1;
        self.trace.push(TraceEvent::Translate {
            pc,
            phys_pc,
            insns: block.icount,
            ops: block.ops.len(),
        });
        self.cache.insert(block)
    }

    fn take_exception(&mut self, event: ExceptionEvent) -> CoreResult<()> {
        self.cpu.raise_exception(event)?;
        self.stats.exceptions += 1;
        self.trace.push(TraceEvent::Exception {
            pc: event.pc,
            cause: event.cause,
            handler: self.cpu.pc,
        });
        Ok(())
    }

    /// Let time pass while idle. Returns false when nothing can ever wake
    /// the core.
    fn wait_for_interrupt(&mut self, budget_left: u64) -> bool {
        if self.cpu.pending_interrupts() != 0 {
            self.cpu.idle = false;
            return true;
        }
        let ticks_per_insn = self.cpu.config.timer_ticks_per_insn;
        if !self.cpu.timer.is_armed() || ticks_per_insn == 0 {
            return false;
        }
        // Idle time is charged to the instruction counter, which drives the
        // stable counter.
        let remaining = self.cpu.timer.remaining(self.cpu.stable_counter());
        let wait = remaining.div_ceil(ticks_per_insn).clamp(1, budget_left.max(1));
        self.cpu.advance(wait);
        if self.cpu.pending_interrupts() != 0 {
            self.cpu.idle = false;
        }
        true
    }
}

/// PC of the instruction a just-taken exception reported.
fn reported_pc(cpu: &CpuState, cause: Exception) -> u64 {
    if cause.is_refill() {
        cpu.csr.get(CsrId::Tlbrera) & !TLBRERA_ISTLBR
    } else {
        cpu.csr.get(CsrId::Era)
    }
}

impl ExecutionEngine for SoftwareEngine {
    fn name(&self) -> &'static str {
        "software"
    }

    fn run(&mut self, bus: &mut dyn Bus, budget: u64) -> CoreResult<RunResult> {
        let start = self.cpu.icount;
        let mut consumed = 0u64;
        while consumed < budget {
            if self.cpu.idle {
                let before = self.cpu.icount;
                if !self.wait_for_interrupt(budget - consumed) {
                    return Ok(RunResult {
                        insns: self.cpu.icount.wrapping_sub(start),
                        stop: StopReason::Idle,
                    });
                }
                consumed += self.cpu.icount.wrapping_sub(before);
                if self.cpu.idle {
                    continue;
                }
            }
            let retired = self.step_block(bus)?;
            consumed += (retired as u64).max(1);
        }
        Ok(RunResult {
            insns: self.cpu.icount.wrapping_sub(start),
            stop: StopReason::Budget,
        })
    }

    fn export_state(&self) -> CoreResult<CoreSnapshot> {
        Ok(self.cpu.export_state())
    }

    fn import_state(&mut self, snap: &CoreSnapshot) -> CoreResult<()> {
        self.cpu.import_state(snap)
    }

    fn inject_interrupt(&mut self, line: u32, level: bool) -> CoreResult<()> {
        self.cpu.set_irq(line, level);
        Ok(())
    }

    fn inject_reset(&mut self) -> CoreResult<()> {
        self.cpu.reset();
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Accelerated engine
// ═══════════════════════════════════════════════════════════════════════════

/// How an accelerator run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelExit {
    pub insns: u64,
    pub idle: bool,
}

/// Hardware-backed virtual CPU. Guest memory is mapped into the accelerator
/// by the embedding machine, so no `Bus` crosses this boundary.
pub trait AccelVcpu {
    fn run(&mut self, budget: u64) -> CoreResult<AccelExit>;
    fn get_state(&self) -> CoreResult<CoreSnapshot>;
    fn set_state(&mut self, snap: &CoreSnapshot) -> CoreResult<()>;
    fn set_irq(&mut self, line: u32, level: bool) -> CoreResult<()>;
    fn reset(&mut self) -> CoreResult<()>;
}

pub struct AcceleratedEngine {
    vcpu: Box<dyn AccelVcpu>,
}

impl AcceleratedEngine {
    pub fn new(vcpu: Box<dyn AccelVcpu>) -> Self {
        Self { vcpu }
    }
}

impl ExecutionEngine for AcceleratedEngine {
    fn name(&self) -> &'static str {
        "accelerated"
    }

    fn run(&mut self, _bus: &mut dyn Bus, budget: u64) -> CoreResult<RunResult> {
        let exit = self.vcpu.run(budget)?;
        Ok(RunResult {
            insns: exit.insns,
            stop: if exit.idle { StopReason::Idle } else { StopReason::Budget },
        })
    }

    fn export_state(&self) -> CoreResult<CoreSnapshot> {
        self.vcpu.get_state()
    }

    fn import_state(&mut self, snap: &CoreSnapshot) -> CoreResult<()> {
        log::debug!("[ENGINE] Pushing state to accelerator, pc={:#x}", snap.pc);
        self.vcpu.set_state(snap)
    }

    fn inject_interrupt(&mut self, line: u32, level: bool) -> CoreResult<()> {
        self.vcpu.set_irq(line, level)
    }

    fn inject_reset(&mut self) -> CoreResult<()> {
        self.vcpu.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::decoder::encode::*;
    use super::*;
    use crate::bus::Ram;
    use crate::cpu::csr::*;
    use crate::cpu::test_support::make_test_config;
    use crate::mmu::tlb::{TlbIndex, VtlbIndex};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Kernel code window: 0x9000_0000_xxxx_xxxx → physical, PLV0 only.
    const KSEG: u64 = 0x9000_0000_0000_0000;
    const CODE: u64 = 0x1000;
    const HANDLER: u64 = 0x8000;
    const DATA_VA: u64 = 0x40_0000;
    const DATA_PA: u64 = 0x2_0000;

    fn engine() -> SoftwareEngine {
        SoftwareEngine::new(make_test_config()).unwrap()
    }

    fn load(ram: &mut Ram, base: u64, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            ram.store(base + i as u64 * 4, 4, *w as u64).unwrap();
        }
    }

    /// Paging on at PLV0, code and handlers reached through DMW0, handler
    /// body is a self-loop.
    fn paged_engine(ram: &mut Ram, code: &[u32]) -> SoftwareEngine {
        let mut eng = engine();
        let cpu = &mut eng.cpu;
        cpu.csr.set(CsrId::Dmw0, (KSEG) | 1);
        cpu.csr.set(CsrId::Eentry, KSEG | HANDLER);
        cpu.csr.set(CsrId::Tlbrentry, HANDLER + 0x1000);
        cpu.csr_write(CsrId::Crmd, CRMD_PG).unwrap();
        cpu.pc = KSEG | CODE;
        load(ram, CODE, code);
        load(ram, HANDLER, &[b26(B, 0)]);
        load(ram, HANDLER + 0x1000, &[b26(B, 0)]);
        eng
    }

    fn fill(cpu: &mut CpuState, va: u64, ps: u64, lo: u64) {
        cpu.csr_write(CsrId::Tlbehi, va).unwrap();
        cpu.csr_write(CsrId::Tlbelo0, lo).unwrap();
        cpu.csr_write(CsrId::Tlbelo1, lo).unwrap();
        cpu.csr_write(CsrId::Tlbidx, ps << TLBIDX_PS_SHIFT).unwrap();
        cpu.tlbfill();
    }

    fn ecode(cpu: &CpuState) -> u64 {
        (cpu.csr.get(CsrId::Estat) >> ESTAT_ECODE_SHIFT) & 0x3f
    }

    #[test]
    fn test_store_to_clean_page_raises_pme() {
        let mut ram = Ram::new(0, 0x10_0000);
        let mut eng = paged_engine(&mut ram, &[NOP, ri12(ST_W, 5, 4, 0x10)]);
        fill(&mut eng.cpu, DATA_VA, 14, ((DATA_PA >> 12) << TLBELO_PPN_SHIFT) | TLBELO_V);
        eng.cpu.gpr[4] = DATA_VA;

        eng.step_block(&mut ram).unwrap();
        assert_eq!(ecode(&eng.cpu), Exception::Pme.ecode() as u64);
        assert_eq!(eng.cpu.csr.get(CsrId::Badv), DATA_VA + 0x10);
        assert_eq!(eng.cpu.csr.get(CsrId::Era), KSEG | (CODE + 4));
        assert_eq!(eng.cpu.csr.get(CsrId::Tlbrera), 0);
        assert_eq!(eng.cpu.pc, KSEG | HANDLER);
        assert_eq!(eng.stats().exceptions, 1);
    }

    #[test]
    fn test_asid_change_flushes_non_global_entries() {
        let mut ram = Ram::new(0, 0x10_0000);
        let asid = CsrId::Asid.raw() as u32;
        let mut eng = paged_engine(
            &mut ram,
            &[csr(CSRWR, 6, 0, asid), ri12(LD_W, 7, 4, 0), b26(B, 0)],
        );
        eng.cpu.csr_write(CsrId::Asid, 1).unwrap();
        fill(
            &mut eng.cpu,
            DATA_VA,
            14,
            ((DATA_PA >> 12) << TLBELO_PPN_SHIFT) | TLBELO_V | TLBELO_D,
        );
        assert!(eng.cpu.translate(DATA_VA, AccessKind::Load, 0).is_ok());
        eng.cpu.gpr[4] = DATA_VA;
        eng.cpu.gpr[6] = 2;

        // csrwr ends its block; the load runs in the next one
        eng.step_block(&mut ram).unwrap();
        assert_eq!(eng.cpu.csr.get(CsrId::Asid) & ASID_MASK, 2);
        assert_eq!(eng.cpu.tlb.present_count(), 0);
        eng.step_block(&mut ram).unwrap();

        assert_eq!(eng.cpu.pc, HANDLER + 0x1000);
        assert_eq!(eng.cpu.csr.get(CsrId::Tlbrbadv), DATA_VA);
        assert_ne!(eng.cpu.csr.get(CsrId::Tlbrera) & TLBRERA_ISTLBR, 0);
    }

    #[test]
    fn test_tlb_miss_uses_refill_pair_only() {
        let mut ram = Ram::new(0, 0x10_0000);
        let mut eng = paged_engine(&mut ram, &[ri12(LD_D, 5, 4, 0)]);
        eng.cpu.gpr[4] = DATA_VA;
        eng.cpu.csr.set(CsrId::Era, 0x1111);
        eng.cpu.csr.set(CsrId::Badv, 0x2222);

        eng.step_block(&mut ram).unwrap();
        assert_eq!(eng.cpu.pc, HANDLER + 0x1000);
        assert_eq!(eng.cpu.csr.get(CsrId::Tlbrbadv), DATA_VA);
        assert_eq!(eng.cpu.csr.get(CsrId::Tlbrera), (KSEG | CODE) | TLBRERA_ISTLBR);
        assert_eq!(eng.cpu.csr.get(CsrId::Era), 0x1111);
        assert_eq!(eng.cpu.csr.get(CsrId::Badv), 0x2222);
        // Refill handlers run in direct-address mode
        assert_ne!(eng.cpu.csr.get(CsrId::Crmd) & CRMD_DA, 0);
    }

    #[test]
    fn test_impctl2_pwc_bit_flushes_only_vtlb() {
        let mut ram = Ram::new(0, 0x10_0000);
        let impctl2 = CsrId::Impctl2.raw() as u32;
        let mut eng = paged_engine(&mut ram, &[csr(CSRWR, 6, 0, impctl2), b26(B, 0)]);
        let lo = ((DATA_PA >> 12) << TLBELO_PPN_SHIFT) | TLBELO_V;
        // PS equal to STLBPS lands in the FTLB, 4 KiB pages in the VTLB
        fill(&mut eng.cpu, DATA_VA, 14, lo);
        fill(&mut eng.cpu, DATA_VA + 0x10_0000, 12, lo);
        assert_eq!(eng.cpu.tlb.present_count(), 2);
        eng.cpu.gpr[6] = IMPCTL2_INV_PWC;

        eng.step_block(&mut ram).unwrap();
        assert!(eng.cpu.tlb.vtlb_entries().iter().all(|e| !e.present));
        assert_eq!(eng.cpu.tlb.ftlb_entries().iter().filter(|e| e.present).count(), 1);
    }

    #[test]
    fn test_direct_map_window_bypasses_tlb() {
        let mut ram = Ram::new(0, 0x10_0000);
        let mut eng = paged_engine(&mut ram, &[ri12(LD_D, 5, 4, 0), b26(B, 0)]);
        eng.cpu.csr.set(CsrId::Dmw1, 0x8000_0000_0000_0000 | 1);
        ram.store(0x4000, 8, 0x1122_3344_5566_7788).unwrap();
        eng.cpu.gpr[4] = 0x8000_0000_0000_4000;

        eng.step_block(&mut ram).unwrap();
        assert_eq!(eng.cpu.gpr[5], 0x1122_3344_5566_7788);
        assert_eq!(eng.cpu.tlb.present_count(), 0);
        assert_eq!(eng.stats().exceptions, 0);
    }

    #[test]
    fn test_misaligned_pc_raises_adef() {
        let mut ram = Ram::new(0, 0x10_0000);
        let mut eng = paged_engine(&mut ram, &[]);
        eng.cpu.pc = (KSEG | CODE) + 2;
        assert_eq!(eng.step_block(&mut ram).unwrap(), 0);
        assert_eq!(ecode(&eng.cpu), Exception::Adef.ecode() as u64);
        assert_eq!(eng.cpu.csr.get(CsrId::Badv), (KSEG | CODE) + 2);
    }

    #[test]
    fn test_blocks_are_cached() {
        let mut ram = Ram::new(0, 0x10_0000);
        let mut eng = engine();
        load(&mut ram, CODE, &[ri12(ADDI_D, 4, 4, 1), b26(B, -4)]);
        eng.cpu.pc = CODE;
        let result = eng.run(&mut ram, 20).unwrap();
        assert_eq!(result.stop, StopReason::Budget);
        assert!(result.insns >= 20);
        assert_eq!(eng.cpu.gpr[4], result.insns / 2);
        assert_eq!(eng.stats().blocks_translated, 1);
        assert!(eng.cache.stats().hits >= 9);
    }

    #[test]
    fn test_timer_interrupt_at_block_boundary() {
        let mut ram = Ram::new(0, 0x10_0000);
        let mut eng = engine();
        load(&mut ram, CODE, &[ri12(ADDI_D, 4, 4, 1), b26(B, -4)]);
        load(&mut ram, HANDLER, &[b26(B, 0)]);
        let cpu = &mut eng.cpu;
        cpu.pc = CODE;
        cpu.csr.set(CsrId::Eentry, HANDLER);
        cpu.csr.set(CsrId::Ecfg, 1 << IRQ_TIMER);
        cpu.csr.update(CsrId::Crmd, |crmd| crmd | CRMD_IE);
        cpu.csr_write(CsrId::Tcfg, 16 | TCFG_EN).unwrap();

        eng.run(&mut ram, 40).unwrap();
        let cpu = &eng.cpu;
        assert_eq!(ecode(cpu), 0);
        assert_eq!(cpu.pc, HANDLER);
        assert_ne!(cpu.csr.get(CsrId::Prmd) & PRMD_PIE, 0);
        assert_eq!(cpu.csr.get(CsrId::Crmd) & CRMD_IE, 0);
        let era = cpu.csr.get(CsrId::Era);
        assert!(era == CODE || era == CODE + 4);
        assert_eq!(eng.stats().interrupts, 1);
    }

    #[test]
    fn test_idle_wakes_on_timer() {
        let mut ram = Ram::new(0, 0x10_0000);
        let mut eng = engine();
        load(&mut ram, CODE, &[IDLE, ri12(ADDI_D, 4, 0, 7), b26(B, 0)]);
        eng.cpu.pc = CODE;
        eng.cpu.csr_write(CsrId::Tcfg, 100 | TCFG_EN).unwrap();

        let result = eng.run(&mut ram, 1000).unwrap();
        assert_eq!(result.stop, StopReason::Budget);
        // Timer line is pending but masked: execution resumes after IDLE
        assert_eq!(eng.cpu.gpr[4], 7);
        assert!(eng.cpu.icount >= 100);
    }

    #[test]
    fn test_idle_without_wakeup_source_stops() {
        let mut ram = Ram::new(0, 0x10_0000);
        let mut eng = engine();
        load(&mut ram, CODE, &[IDLE]);
        eng.cpu.pc = CODE;
        let result = eng.run(&mut ram, 1000).unwrap();
        assert_eq!(result.stop, StopReason::Idle);
        assert!(eng.cpu.idle);
        assert_eq!(eng.cpu.pc, CODE + 4);

        eng.inject_interrupt(IRQ_HW_BASE, true).unwrap();
        assert!(!eng.cpu.idle);
    }

    #[test]
    fn test_store_into_code_retranslates() {
        let mut ram = Ram::new(0, 0x10_0000);
        let mut eng = engine();
        load(
            &mut ram,
            CODE,
            &[
                ri12(ST_W, 5, 4, 0),
                NOP,
                ri12(ADDI_D, 7, 0, 1),
                b26(B, 0),
            ],
        );
        eng.cpu.pc = CODE;
        eng.cpu.gpr[4] = CODE + 8;
        eng.cpu.gpr[5] = ri12(ADDI_D, 7, 0, 42) as u64;

        eng.run(&mut ram, 10).unwrap();
        assert_eq!(eng.cpu.gpr[7], 42);
        assert_eq!(eng.stats().code_invalidations, 1);
    }

    #[test]
    fn test_trace_records_translation_and_exceptions() {
        let mut ram = Ram::new(0, 0x10_0000);
        let mut config = make_test_config();
        config.trace_enabled = true;
        let mut eng = SoftwareEngine::new(config).unwrap();
        load(&mut ram, CODE, &[SYSCALL]);
        load(&mut ram, HANDLER, &[b26(B, 0)]);
        eng.cpu.pc = CODE;
        eng.cpu.csr.set(CsrId::Eentry, HANDLER);

        eng.step_block(&mut ram).unwrap();
        let stats = eng.trace.stats();
        assert_eq!(stats.translations, 1);
        assert_eq!(stats.exceptions, 1);
        assert_eq!(stats.by_cause.get(Exception::Sys.name()), Some(&1));
        assert!(eng.trace.iter().any(|event| matches!(
            event,
            TraceEvent::Exception { pc: CODE, handler: HANDLER, .. }
        )));
    }

    #[test]
    fn test_reset_restores_reset_vector() {
        let mut eng = engine();
        eng.cpu.pc = 0x1234;
        eng.cpu.gpr[9] = 5;
        eng.inject_reset().unwrap();
        assert_eq!(eng.cpu.pc, make_test_config().reset_pc);
        assert_eq!(eng.cpu.gpr[9], 0);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accelerated engine
    // ═══════════════════════════════════════════════════════════════════════

    #[derive(Default)]
    struct MockLog {
        irqs: Vec<(u32, bool)>,
        resets: u32,
    }

    /// Pretends to run by advancing PC and icount.
    struct MockVcpu {
        state: CoreSnapshot,
        log: Rc<RefCell<MockLog>>,
    }

    impl AccelVcpu for MockVcpu {
        fn run(&mut self, budget: u64) -> CoreResult<AccelExit> {
            self.state.pc += budget * 4;
            self.state.icount += budget;
            Ok(AccelExit { insns: budget, idle: false })
        }

        fn get_state(&self) -> CoreResult<CoreSnapshot> {
            Ok(self.state.clone())
        }

        fn set_state(&mut self, snap: &CoreSnapshot) -> CoreResult<()> {
            self.state = snap.clone();
            Ok(())
        }

        fn set_irq(&mut self, line: u32, level: bool) -> CoreResult<()> {
            self.log.borrow_mut().irqs.push((line, level));
            Ok(())
        }

        fn reset(&mut self) -> CoreResult<()> {
            self.log.borrow_mut().resets += 1;
            Ok(())
        }
    }

    #[test]
    fn test_state_moves_between_engines() {
        let log = Rc::new(RefCell::new(MockLog::default()));
        let mut soft = engine();
        soft.cpu.pc = 0x2000;
        soft.cpu.gpr[12] = 99;
        soft.cpu.tlb.set_entry(
            TlbIndex::Vtlb(VtlbIndex(3)),
            crate::mmu::tlb::TlbEntry {
                vppn: 0x20,
                ps: 12,
                present: true,
                global: true,
                ..Default::default()
            },
        );

        let mut accel: Box<dyn ExecutionEngine> = Box::new(AcceleratedEngine::new(Box::new(
            MockVcpu { state: soft.export_state().unwrap(), log: Rc::clone(&log) },
        )));
        assert_eq!(accel.name(), "accelerated");
        accel.import_state(&soft.export_state().unwrap()).unwrap();
        let mut ram = Ram::new(0, 0x1000);
        let result = accel.run(&mut ram, 10).unwrap();
        assert_eq!(result.insns, 10);
        accel.inject_interrupt(IRQ_IPI, true).unwrap();
        accel.inject_reset().unwrap();

        let snap = accel.export_state().unwrap();
        soft.import_state(&snap).unwrap();
        assert_eq!(soft.cpu.pc, 0x2000 + 40);
        assert_eq!(soft.cpu.gpr[12], 99);
        assert_eq!(soft.cpu.tlb.present_count(), 1);
        assert_eq!(log.borrow().irqs, vec![(IRQ_IPI, true)]);
        assert_eq!(log.borrow().resets, 1);
    }

    #[test]
    fn test_select_engine() {
        let soft = select_engine(make_test_config(), None).unwrap();
        assert_eq!(soft.name(), "software");

        let snap = engine().export_state().unwrap();
        let vcpu = MockVcpu { state: snap, log: Rc::new(RefCell::new(MockLog::default())) };
        let accel = select_engine(make_test_config(), Some(Box::new(vcpu))).unwrap();
        assert_eq!(accel.name(), "accelerated");
    }
}
