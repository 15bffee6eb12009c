//! Architectural state of one core.
//!
//! `CpuState` owns everything the guest can observe: integer and floating
//! registers, PC, the CSR file, both TLB pools and the constant timer. The
//! mode-flag cache (`hflags`) is derived from CRMD/EUEN/MISC and recomputed
//! by every CSR accessor before it returns.

pub mod csr;
mod csr_ops;
pub mod exception;
pub mod fpu;
pub mod timer;
pub mod types;

pub use types::{Exception, ExceptionEvent, HFlags};

use crate::bits::extract64;
use crate::config::CoreConfig;
use crate::error::CoreResult;
use crate::mmu::tlb::Tlb;
use csr::*;
use timer::ConstantTimer;

pub const NUM_GPRS: usize = 32;
pub const NUM_FPRS: usize = 32;
pub const NUM_FCC: usize = 8;

/// Register aliases used by the emitter and tests.
pub const REG_ZERO: usize = 0;
pub const REG_RA: usize = 1;
pub const REG_SP: usize = 3;

#[derive(Debug, Clone)]
pub struct CpuState {
    pub gpr: [u64; NUM_GPRS],
    pub fpr: [u64; NUM_FPRS],
    pub fcc: [bool; NUM_FCC],
    pub fcsr0: u32,
    pub pc: u64,

    pub csr: CsrFile,
    pub hflags: HFlags,
    pub tlb: Tlb,
    pub timer: ConstantTimer,

    /// Address and value captured by the last LL.
    pub lladdr: u64,
    pub llval: u64,

    /// Retired guest instructions.
    pub icount: u64,
    /// Waiting in IDLE for an interrupt.
    pub idle: bool,
    /// Word of the instruction currently executing (BADI source).
    pub cur_insn: u32,

    pub config: CoreConfig,

    /// Set by TLB flushes; the engine drops cached translations.
    pub(crate) tb_flush_pending: bool,
}

impl CpuState {
    pub fn new(config: CoreConfig) -> CoreResult<Self> {
        config.validate()?;
        let mut cpu = Self {
            gpr: [0; NUM_GPRS],
            fpr: [0; NUM_FPRS],
            fcc: [false; NUM_FCC],
            fcsr0: 0,
            pc: config.reset_pc,
            csr: CsrFile::new(),
            hflags: HFlags::empty(),
            tlb: Tlb::new(config.ftlb_sets, config.ftlb_ways, config.vtlb_entries),
            timer: ConstantTimer::new(),
            lladdr: 0,
            llval: 0,
            icount: 0,
            idle: false,
            cur_insn: 0,
            config,
            tb_flush_pending: false,
        };
        cpu.reset();
        Ok(cpu)
    }

    /// Architectural reset: direct-address mode at PLV0, interrupts off,
    /// TLB empty, PC at the reset vector.
    pub fn reset(&mut self) {
        let config = self.config.clone();
        self.gpr = [0; NUM_GPRS];
        self.fpr = [0; NUM_FPRS];
        self.fcc = [false; NUM_FCC];
        self.fcsr0 = 0;
        self.pc = config.reset_pc;
        self.csr = CsrFile::new();
        self.tlb = Tlb::new(config.ftlb_sets, config.ftlb_ways, config.vtlb_entries);
        self.timer = ConstantTimer::new();
        self.lladdr = 0;
        self.llval = 0;
        self.idle = false;
        self.cur_insn = 0;

        // DA=1, DATF=DATM=1 (coherent cached)
        self.csr.set(
            CsrId::Crmd,
            CRMD_DA | (1 << CRMD_DATF_SHIFT) | (1 << CRMD_DATM_SHIFT),
        );
        self.csr.set(CsrId::Cpuid, config.core_id as u64);
        self.csr.set(CsrId::Tid, config.core_id as u64);
        self.csr.set(CsrId::Stlbps, 0xe);
        // SAVE_NUM=8, TIMER_BITS-1, VSMAX=7
        self.csr.set(
            CsrId::Prcfg1,
            8 | (((TIMER_BITS - 1) as u64) << 4) | (7 << 12),
        );
        // Supported page sizes: 4 KiB .. 1 GiB
        self.csr.set(CsrId::Prcfg2, 0x3fff_f000);
        // TLB_TYPE=2 (VTLB+FTLB), MTLB entries-1, STLB ways-1, log2(sets)
        self.csr.set(
            CsrId::Prcfg3,
            2 | (((config.vtlb_entries - 1) as u64 & 0xff) << 4)
                | (((config.ftlb_ways - 1) as u64 & 0xff) << 12)
                | ((config.ftlb_sets.trailing_zeros() as u64 & 0x3f) << 20),
        );
        self.tb_flush_pending = true;
        self.compute_hflags();
        log::debug!("[CPU] Core {} reset, pc={:#x}", config.core_id, self.pc);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Register file
    // ═══════════════════════════════════════════════════════════════════════

    #[inline]
    pub fn read_gpr(&self, reg: usize) -> u64 {
        self.gpr[reg & 31]
    }

    /// r0 is hardwired to zero.
    #[inline]
    pub fn write_gpr(&mut self, reg: usize, value: u64) {
        if reg & 31 != REG_ZERO {
            self.gpr[reg & 31] = value;
        }
    }

    pub fn plv(&self) -> u8 {
        self.hflags.plv()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Mode-flag cache
    // ═══════════════════════════════════════════════════════════════════════

    pub fn compute_hflags(&mut self) {
        let crmd = self.csr.get(CsrId::Crmd);
        let euen = self.csr.get(CsrId::Euen);
        let misc = self.csr.get(CsrId::Misc);
        let plv = (crmd & CRMD_PLV) as u8;

        let mut flags = HFlags::empty().with_plv(plv);
        flags.set(HFlags::PG, crmd & CRMD_PG != 0);
        flags.set(HFlags::FPE, euen & EUEN_FPE != 0);
        flags.set(HFlags::SXE, euen & EUEN_SXE != 0);
        flags.set(HFlags::ASXE, euen & EUEN_ASXE != 0);
        let va32 = plv != 0 && extract64(misc, MISC_VA32_SHIFT + plv as u32, 1) != 0;
        flags.set(HFlags::MODE64, !va32);
        self.hflags = flags;
    }

    /// Effective address as seen by the MMU in the current mode.
    #[inline]
    pub fn effective_address(&self, addr: u64) -> u64 {
        if self.hflags.contains(HFlags::MODE64) {
            addr
        } else {
            addr & 0xffff_ffff
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Interrupt lines and timer
    // ═══════════════════════════════════════════════════════════════════════

    /// Drive interrupt line `line` (ESTAT.IS bit number) to `level`.
    pub fn set_irq(&mut self, line: u32, level: bool) {
        if line > IRQ_IPI {
            log::warn!("[EXC] Ignoring interrupt line {}", line);
            return;
        }
        let bit = 1u64 << line;
        self.csr.update(CsrId::Estat, |estat| {
            if level { estat | bit } else { estat & !bit }
        });
        if level {
            self.idle = false;
        }
    }

    /// ESTAT.IS & ECFG.LIE
    pub fn pending_interrupts(&self) -> u64 {
        self.csr.get(CsrId::Estat) & self.csr.get(CsrId::Ecfg) & ECFG_LIE
    }

    /// An interrupt would be taken at the next instruction boundary.
    pub fn interrupt_deliverable(&self) -> bool {
        self.csr.get(CsrId::Crmd) & CRMD_IE != 0 && self.pending_interrupts() != 0
    }

    /// Stable counter before the CNTC offset.
    pub fn stable_counter(&self) -> u64 {
        self.icount
            .wrapping_mul(self.config.timer_ticks_per_insn)
    }

    /// Value returned by RDTIME*.
    pub fn rdtime(&self) -> u64 {
        self.stable_counter()
            .wrapping_add(self.csr.get(CsrId::Cntc))
    }

    /// Fire the constant timer if its deadline has passed.
    pub fn tick_timer(&mut self) {
        let now = self.stable_counter();
        if self.timer.poll(now) {
            if !self.timer.is_armed() {
                self.csr.update(CsrId::Tcfg, |tcfg| tcfg & !TCFG_EN);
            }
            log::trace!("[TIMER] Expired at {}", now);
            self.set_irq(IRQ_TIMER, true);
        }
    }

    /// Retire `count` instructions and let the timer observe the new time.
    pub fn advance(&mut self, count: u64) {
        self.icount = self.icount.wrapping_add(count);
        self.tick_timer();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LL/SC
    // ═══════════════════════════════════════════════════════════════════════

    pub fn llbit(&self) -> bool {
        self.csr.get(CsrId::Llbctl) & LLBCTL_ROLLB != 0
    }

    pub fn set_llbit(&mut self, value: bool) {
        self.csr.update(CsrId::Llbctl, |v| {
            if value { v | LLBCTL_ROLLB } else { v & !LLBCTL_ROLLB }
        });
    }

    /// Request a translation-cache flush from the engine.
    pub fn request_tb_flush(&mut self) {
        self.tb_flush_pending = true;
    }

    pub fn take_tb_flush(&mut self) -> bool {
        std::mem::take(&mut self.tb_flush_pending)
    }
}
