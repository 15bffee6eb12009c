//! Address translation and the TLB-management instructions.
//!
//! ```text
//!   vaddr ──▶ DA && !PG ? ──yes──▶ identity
//!               │ no
//!               ▼
//!           DMW0..3 hit? ──yes──▶ window arithmetic, full permissions
//!               │ no
//!               ▼
//!           canonical? ──no──▶ ADE
//!               │ yes
//!               ▼
//!           VTLB, then FTLB set ──miss──▶ TLBR (refill)
//!               │ hit
//!               ▼
//!           V ▶ NX ▶ NR ▶ PLV/RPLV ▶ D
//! ```
//!
//! Translation is a pure function of the CSRs and the TLB pools. The
//! TLB-management instructions (TLBSRCH, TLBRD, TLBWR, TLBFILL, TLBCLR,
//! TLBFLUSH, INVTLB) are methods on `CpuState` because they move data
//! between the pools and the shadow CSRs.

pub mod tlb;
pub mod walker;

use crate::bits::{extract64, mask64, sextract64};
use crate::cpu::csr::*;
use crate::cpu::{CpuState, Exception, ExceptionEvent};
use tlb::{TlbEntry, TlbHalf, TlbIndex, lo_global, page_offset_mask};

pub const PROT_READ: u8 = 1 << 0;
pub const PROT_WRITE: u8 = 1 << 1;
pub const PROT_EXEC: u8 = 1 << 2;
pub const PROT_ALL: u8 = PROT_READ | PROT_WRITE | PROT_EXEC;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Fetch,
    Load,
    Store,
}

/// Successful translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub paddr: u64,
    pub prot: u8,
}

/// Why a translation failed. Mapped to a guest exception by `exception()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlbFault {
    /// No entry in either pool (refill class).
    NoMatch,
    /// Matching half has V clear.
    Invalid,
    /// Store to a half with D clear.
    Dirty,
    ExecuteInhibit,
    ReadInhibit,
    Privilege,
    /// Non-canonical address.
    BadAddress,
}

impl TlbFault {
    pub fn exception(self, access: AccessKind) -> Exception {
        match self {
            TlbFault::NoMatch => Exception::Tlbr,
            TlbFault::Invalid => match access {
                AccessKind::Fetch => Exception::Pif,
                AccessKind::Load => Exception::Pil,
                AccessKind::Store => Exception::Pis,
            },
            TlbFault::Dirty => Exception::Pme,
            TlbFault::ExecuteInhibit => Exception::Pnx,
            TlbFault::ReadInhibit => Exception::Pnr,
            TlbFault::Privilege => Exception::Ppi,
            TlbFault::BadAddress => match access {
                AccessKind::Fetch => Exception::Adef,
                _ => Exception::Adem,
            },
        }
    }

    /// Exception event for a fault at `vaddr` raised by the instruction at `pc`.
    pub fn to_event(self, access: AccessKind, vaddr: u64, pc: u64) -> ExceptionEvent {
        ExceptionEvent::with_address(self.exception(access), pc, vaddr)
    }
}

/// Direct-map window match: PLV enable bit set and VSEG equal to the top
/// four address bits.
fn dmw_hit(dmw: u64, vaddr: u64, plv: u8) -> bool {
    dmw & (1 << plv) & DMW_PLV_MASK != 0 && (vaddr >> DMW_VSEG_SHIFT) == (dmw >> DMW_VSEG_SHIFT)
}

impl CpuState {
    /// Translate `vaddr` for an access of kind `access` at privilege `plv`.
    pub fn translate(
        &self,
        vaddr: u64,
        access: AccessKind,
        plv: u8,
    ) -> Result<Translation, TlbFault> {
        let crmd = self.csr.get(CsrId::Crmd);
        let phys_mask = self.config.phys_mask();

        if crmd & CRMD_DA != 0 && crmd & CRMD_PG == 0 {
            return Ok(Translation {
                paddr: vaddr & phys_mask,
                prot: PROT_ALL,
            });
        }

        for i in 0..4 {
            let dmw = self.csr.get(CsrId::dmw(i));
            if dmw_hit(dmw, vaddr, plv) {
                return Ok(Translation {
                    paddr: vaddr & phys_mask,
                    prot: PROT_ALL,
                });
            }
        }

        let valen = self.config.valen;
        if valen < 64 {
            let high = sextract64(vaddr, valen, 64 - valen);
            if high != 0 && high != -1 {
                return Err(TlbFault::BadAddress);
            }
        }

        let index = self.tlb_lookup(vaddr).ok_or(TlbFault::NoMatch)?;
        let entry = self.tlb.entry(index);
        self.check_half(entry, vaddr, access, plv)
    }

    fn check_half(
        &self,
        entry: &TlbEntry,
        vaddr: u64,
        access: AccessKind,
        plv: u8,
    ) -> Result<Translation, TlbFault> {
        let half = TlbHalf::decode(entry.lo[entry.half(vaddr)], self.config.palen);

        if !half.valid {
            return Err(TlbFault::Invalid);
        }
        if access == AccessKind::Fetch && half.no_exec {
            return Err(TlbFault::ExecuteInhibit);
        }
        if access == AccessKind::Load && half.no_read {
            return Err(TlbFault::ReadInhibit);
        }
        let plv_ok = if half.rplv {
            plv == half.plv
        } else {
            plv <= half.plv
        };
        if !plv_ok {
            return Err(TlbFault::Privilege);
        }
        if access == AccessKind::Store && !half.dirty {
            return Err(TlbFault::Dirty);
        }

        let offset = page_offset_mask(entry.ps);
        let paddr = ((half.ppn << TLBELO_PPN_SHIFT) & !offset) | (vaddr & offset);
        let mut prot = PROT_READ;
        if half.dirty {
            prot |= PROT_WRITE;
        }
        if !half.no_exec {
            prot |= PROT_EXEC;
        }
        Ok(Translation {
            paddr: paddr & self.config.phys_mask(),
            prot,
        })
    }

    /// Translate for the current privilege level, producing a ready-to-raise
    /// event on failure.
    pub fn translate_or_fault(
        &self,
        vaddr: u64,
        access: AccessKind,
        pc: u64,
    ) -> Result<u64, ExceptionEvent> {
        self.translate(vaddr, access, self.plv())
            .map(|t| t.paddr)
            .map_err(|fault| {
                log::trace!(
                    "[TLB] {:?} fault on {:?} at {:#x} (pc={:#x})",
                    fault,
                    access,
                    vaddr,
                    pc
                );
                fault.to_event(access, vaddr, pc)
            })
    }

    fn current_asid(&self) -> u16 {
        (self.csr.get(CsrId::Asid) & ASID_MASK) as u16
    }

    fn stlb_ps(&self) -> u8 {
        (self.csr.get(CsrId::Stlbps) & 0x3f) as u8
    }

    /// Pool lookup with the current ASID and FTLB page size.
    pub fn tlb_lookup(&self, vaddr: u64) -> Option<TlbIndex> {
        self.tlb.lookup(
            vaddr,
            self.current_asid(),
            self.stlb_ps(),
            self.config.virt_mask(),
        )
    }

    fn in_refill(&self) -> bool {
        self.csr.get(CsrId::Tlbrera) & TLBRERA_ISTLBR != 0
    }

    // ═══════════════════════════════════════════════════════════════════════
    // TLB-management instructions
    // ═══════════════════════════════════════════════════════════════════════

    /// Entry described by the shadow CSRs: TLBREHI/TLBRELO* inside a refill
    /// handler, TLBEHI/TLBELO*/TLBIDX.PS otherwise.
    fn shadow_entry(&self) -> TlbEntry {
        let (hi, ps, lo0, lo1, present) = if self.in_refill() {
            let hi = self.csr.get(CsrId::Tlbrehi);
            (
                hi,
                extract64(hi, 0, TLBREHI_PS_LEN) as u8,
                self.csr.get(CsrId::Tlbrelo0),
                self.csr.get(CsrId::Tlbrelo1),
                true,
            )
        } else {
            let idx = self.csr.get(CsrId::Tlbidx);
            (
                self.csr.get(CsrId::Tlbehi),
                extract64(idx, TLBIDX_PS_SHIFT, TLBIDX_PS_LEN) as u8,
                self.csr.get(CsrId::Tlbelo0),
                self.csr.get(CsrId::Tlbelo1),
                idx & TLBIDX_NE == 0,
            )
        };
        TlbEntry {
            vppn: (hi & self.config.virt_mask()) >> TLBEHI_VPPN_SHIFT,
            ps,
            asid: self.current_asid(),
            global: lo_global(lo0, lo1),
            present,
            lo: [lo0, lo1],
        }
    }

    fn write_slot(&mut self, index: TlbIndex, mut entry: TlbEntry) {
        if let TlbIndex::Ftlb(_) = index {
            let stlb_ps = self.stlb_ps();
            if entry.ps != stlb_ps {
                log::warn!(
                    "[TLB] FTLB write with PS={} (STLBPS={}), entry left invalid",
                    entry.ps,
                    stlb_ps
                );
                entry.present = false;
            }
        }
        log::trace!(
            "[TLB] Write slot {} vppn={:#x} ps={} asid={} g={} e={}",
            self.tlb.raw_index(index),
            entry.vppn,
            entry.ps,
            entry.asid,
            entry.global,
            entry.present
        );
        self.tlb.set_entry(index, entry);
    }

    /// TLBSRCH: look up the VPPN in TLBEHI (TLBREHI in a refill handler) and
    /// report the slot in TLBIDX.Index, or set TLBIDX.NE.
    pub fn tlbsrch(&mut self) {
        let hi = if self.in_refill() {
            self.csr.get(CsrId::Tlbrehi)
        } else {
            self.csr.get(CsrId::Tlbehi)
        };
        let vaddr = hi & !mask64(TLBEHI_VPPN_SHIFT);
        match self.tlb_lookup(vaddr) {
            Some(index) => {
                let raw = self.tlb.raw_index(index) as u64;
                self.csr.update(CsrId::Tlbidx, |idx| {
                    (idx & !(TLBIDX_NE | mask64(TLBIDX_INDEX_LEN))) | raw
                });
            }
            None => self.csr.update(CsrId::Tlbidx, |idx| idx | TLBIDX_NE),
        }
    }

    /// TLBRD: copy the slot named by TLBIDX.Index into the shadow CSRs.
    pub fn tlbrd(&mut self) {
        let raw = extract64(self.csr.get(CsrId::Tlbidx), 0, TLBIDX_INDEX_LEN) as usize;
        let entry = self
            .tlb
            .index_from_raw(raw)
            .map(|index| *self.tlb.entry(index))
            .filter(|entry| entry.present);

        match entry {
            Some(entry) => {
                self.csr.update(CsrId::Tlbidx, |idx| {
                    let idx = idx & !(TLBIDX_NE | (mask64(TLBIDX_PS_LEN) << TLBIDX_PS_SHIFT));
                    idx | ((entry.ps as u64 & 0x3f) << TLBIDX_PS_SHIFT)
                });
                self.csr.set(CsrId::Tlbehi, entry.vppn << TLBEHI_VPPN_SHIFT);
                self.csr.set(CsrId::Tlbelo0, entry.lo[0]);
                self.csr.set(CsrId::Tlbelo1, entry.lo[1]);
                self.csr.update(CsrId::Asid, |asid| {
                    (asid & !ASID_MASK) | entry.asid as u64
                });
            }
            None => {
                self.csr.update(CsrId::Tlbidx, |idx| {
                    (idx & !(mask64(TLBIDX_PS_LEN) << TLBIDX_PS_SHIFT)) | TLBIDX_NE
                });
                self.csr.set(CsrId::Tlbehi, 0);
                self.csr.set(CsrId::Tlbelo0, 0);
                self.csr.set(CsrId::Tlbelo1, 0);
                self.csr.update(CsrId::Asid, |asid| asid & !ASID_MASK);
            }
        }
    }

    /// TLBWR: write the shadow entry to the slot named by TLBIDX.Index.
    pub fn tlbwr(&mut self) {
        let raw = extract64(self.csr.get(CsrId::Tlbidx), 0, TLBIDX_INDEX_LEN) as usize;
        let Some(index) = self.tlb.index_from_raw(raw) else {
            log::warn!("[TLB] TLBWR to index {} beyond the pools ignored", raw);
            return;
        };
        let entry = self.shadow_entry();
        self.write_slot(index, entry);
        self.request_tb_flush();
    }

    /// TLBFILL: write the shadow entry to a replacement victim. Entries with
    /// the FTLB page size go to a random way of their FTLB set; anything else
    /// goes to a random VTLB slot at or above TLBWIRED.
    pub fn tlbfill(&mut self) {
        let entry = self.shadow_entry();
        let stlb_ps = self.stlb_ps();
        let index = if entry.ps == stlb_ps {
            let vaddr = entry.vppn << TLBEHI_VPPN_SHIFT;
            TlbIndex::Ftlb(self.tlb.ftlb_victim(vaddr, stlb_ps))
        } else {
            let wired = self.csr.get(CsrId::Tlbwired) as usize;
            TlbIndex::Vtlb(self.tlb.vtlb_victim(wired))
        };
        self.write_slot(index, entry);
        self.request_tb_flush();
    }

    /// TLBCLR: invalidate non-global entries of the current ASID. An FTLB
    /// index scopes the operation to one set; a VTLB index covers the VTLB.
    pub fn tlbclr(&mut self) {
        let asid = self.current_asid();
        let pred = move |e: &TlbEntry| !e.global && e.asid == asid;
        let count = self.scoped_invalidate(pred);
        log::debug!("[TLB] TLBCLR asid={} invalidated {}", asid, count);
    }

    /// TLBFLUSH: like TLBCLR but regardless of ASID and G.
    pub fn tlbflush(&mut self) {
        let count = self.scoped_invalidate(|_| true);
        log::debug!("[TLB] TLBFLUSH invalidated {}", count);
    }

    fn scoped_invalidate(&mut self, pred: impl Fn(&TlbEntry) -> bool) -> usize {
        let raw = extract64(self.csr.get(CsrId::Tlbidx), 0, TLBIDX_INDEX_LEN) as usize;
        let count = match self.tlb.index_from_raw(raw) {
            Some(TlbIndex::Ftlb(ftlb)) => self.tlb.invalidate_ftlb_set_where(ftlb.set, pred),
            Some(TlbIndex::Vtlb(_)) => self.tlb.invalidate_vtlb_where(pred),
            None => 0,
        };
        self.request_tb_flush();
        count
    }

    /// INVTLB op, asid, vaddr. Reserved ops raise INE.
    ///
    /// | op  | invalidates                                  |
    /// |-----|----------------------------------------------|
    /// | 0,1 | everything                                   |
    /// | 2   | G=1                                          |
    /// | 3   | G=0                                          |
    /// | 4   | G=0 and ASID match                           |
    /// | 5   | G=0, ASID match and VA match                 |
    /// | 6   | (G=1 or ASID match) and VA match             |
    pub fn invtlb(&mut self, op: u32, asid: u64, vaddr: u64) -> Result<(), Exception> {
        let asid = (asid & ASID_MASK) as u16;
        let vmask = self.config.virt_mask();
        let count = match op {
            0 | 1 => self.tlb.invalidate_where(|_| true),
            2 => self.tlb.invalidate_where(|e| e.global),
            3 => self.tlb.invalidate_where(|e| !e.global),
            4 => self.tlb.invalidate_where(|e| !e.global && e.asid == asid),
            5 => self.tlb.invalidate_where(|e| {
                !e.global && e.asid == asid && e.matches_va(vaddr, vmask)
            }),
            6 => self.tlb.invalidate_where(|e| {
                (e.global || e.asid == asid) && e.matches_va(vaddr, vmask)
            }),
            _ => {
                log::warn!("[TLB] INVTLB with reserved op {}", op);
                return Err(Exception::Ine);
            }
        };
        log::debug!(
            "[TLB] INVTLB op={} asid={} va={:#x} invalidated {}",
            op,
            asid,
            vaddr,
            count
        );
        self.request_tb_flush();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::tlb::{FtlbIndex, VtlbIndex};
    use super::*;
    use crate::cpu::test_support::make_test_cpu;

    const PTE_RW: u64 = TLBELO_V | TLBELO_D | (3 << TLBELO_PLV_SHIFT);

    fn paged_cpu() -> CpuState {
        let mut cpu = make_test_cpu();
        cpu.csr_write(CsrId::Crmd, CRMD_PG).unwrap();
        cpu
    }

    /// Stage a 16 KiB doubled page at `va` in the normal shadow CSRs.
    fn stage(cpu: &mut CpuState, va: u64, ps: u64, lo0: u64, lo1: u64) {
        cpu.csr_write(CsrId::Tlbehi, va).unwrap();
        cpu.csr_write(CsrId::Tlbelo0, lo0).unwrap();
        cpu.csr_write(CsrId::Tlbelo1, lo1).unwrap();
        cpu.csr_write(CsrId::Tlbidx, ps << TLBIDX_PS_SHIFT).unwrap();
    }

    fn ppn(frame: u64) -> u64 {
        frame << TLBELO_PPN_SHIFT
    }

    #[test]
    fn test_direct_address_is_identity() {
        let cpu = make_test_cpu();
        let t = cpu.translate(0x1234_5678, AccessKind::Store, 0).unwrap();
        assert_eq!(t.paddr, 0x1234_5678);
        assert_eq!(t.prot, PROT_ALL);
    }

    #[test]
    fn test_fill_and_translate_both_halves() {
        let mut cpu = paged_cpu();
        stage(&mut cpu, 0x12_0000, 12, PTE_RW | ppn(0x80), PTE_RW | ppn(0x90));
        cpu.tlbfill();

        let even = cpu.translate(0x12_0abc, AccessKind::Load, 0).unwrap();
        assert_eq!(even.paddr, 0x8_0abc);
        let odd = cpu.translate(0x12_1abc, AccessKind::Store, 0).unwrap();
        assert_eq!(odd.paddr, 0x9_0abc);
        assert_eq!(odd.prot, PROT_ALL);
    }

    #[test]
    fn test_fill_picks_pool_by_page_size() {
        let mut cpu = paged_cpu();
        // STLBPS is 14 after reset
        stage(&mut cpu, 0x40_0000, 14, PTE_RW, PTE_RW);
        cpu.tlbfill();
        assert_eq!(cpu.tlb.ftlb_entries().iter().filter(|e| e.present).count(), 1);

        stage(&mut cpu, 0x80_0000, 12, PTE_RW, PTE_RW);
        cpu.tlbfill();
        assert_eq!(cpu.tlb.vtlb_entries().iter().filter(|e| e.present).count(), 1);
    }

    #[test]
    fn test_store_to_clean_page_faults_dirty() {
        // Scenario: FTLB entry without D, then a store
        let mut cpu = paged_cpu();
        let clean = TLBELO_V | (3 << TLBELO_PLV_SHIFT) | ppn(0x100);
        stage(&mut cpu, 0x20_0000, 14, clean, clean);
        cpu.tlbfill();
        assert_eq!(cpu.tlb.ftlb_entries().iter().filter(|e| e.present).count(), 1);

        let fault = cpu.translate(0x20_0010, AccessKind::Store, 0).unwrap_err();
        assert_eq!(fault, TlbFault::Dirty);
        let event = fault.to_event(AccessKind::Store, 0x20_0010, 0x1000);
        assert_eq!(event.cause, Exception::Pme);
        assert!(!event.refill);

        // Loads still work and the page is not writable
        let t = cpu.translate(0x20_0010, AccessKind::Load, 0).unwrap();
        assert_eq!(t.prot & PROT_WRITE, 0);
    }

    #[test]
    fn test_asid_change_turns_hit_into_miss() {
        let mut cpu = paged_cpu();
        cpu.csr_write(CsrId::Asid, 3).unwrap();
        stage(&mut cpu, 0x30_0000, 12, PTE_RW, PTE_RW);
        cpu.tlbfill();
        assert!(cpu.translate(0x30_0000, AccessKind::Load, 0).is_ok());

        cpu.csr_write(CsrId::Asid, 4).unwrap();
        assert_eq!(
            cpu.translate(0x30_0000, AccessKind::Load, 0),
            Err(TlbFault::NoMatch)
        );
    }

    #[test]
    fn test_miss_dispatches_to_refill_vector() {
        let mut cpu = paged_cpu();
        cpu.csr_write(CsrId::Tlbrentry, 0x8000).unwrap();
        cpu.csr_write(CsrId::Eentry, 0x4000).unwrap();

        let fault = cpu.translate(0x7000_0000, AccessKind::Load, 0).unwrap_err();
        assert_eq!(fault, TlbFault::NoMatch);
        let event = fault.to_event(AccessKind::Load, 0x7000_0000, 0x1_0000);
        assert!(event.refill);
        cpu.raise_exception(event).unwrap();

        assert_eq!(cpu.pc, 0x8000);
        assert_eq!(cpu.csr.get(CsrId::Tlbrbadv), 0x7000_0000);
        assert_eq!(cpu.csr.get(CsrId::Tlbrera), 0x1_0000 | TLBRERA_ISTLBR);
        assert_eq!(cpu.csr.get(CsrId::Badv), 0);
        assert_eq!(cpu.csr.get(CsrId::Era), 0);
    }

    #[test]
    fn test_impctl2_pwc_only_clears_vtlb() {
        let mut cpu = paged_cpu();
        stage(&mut cpu, 0x40_0000, 14, PTE_RW, PTE_RW);
        cpu.tlbfill();
        stage(&mut cpu, 0x80_0000, 12, PTE_RW, PTE_RW);
        cpu.tlbfill();

        cpu.csr_write(CsrId::Impctl2, IMPCTL2_INV_PWC).unwrap();
        assert!(cpu.translate(0x40_0000, AccessKind::Load, 0).is_ok());
        assert_eq!(
            cpu.translate(0x80_0000, AccessKind::Load, 0),
            Err(TlbFault::NoMatch)
        );
    }

    #[test]
    fn test_direct_map_window() {
        let mut cpu = paged_cpu();
        // VSEG=0x9, PLV0 only
        cpu.csr_write(CsrId::Dmw0, 0x9000_0000_0000_0001).unwrap();
        let t = cpu
            .translate(0x9000_0000_0020_0000, AccessKind::Store, 0)
            .unwrap();
        assert_eq!(t.paddr, 0x20_0000);
        assert_eq!(t.prot, PROT_ALL);
        assert_eq!(cpu.tlb.present_count(), 0);

        // PLV3 not enabled in the window: falls through to the canonical check
        assert_eq!(
            cpu.translate(0x9000_0000_0020_0000, AccessKind::Load, 3),
            Err(TlbFault::BadAddress)
        );
    }

    #[test]
    fn test_non_canonical_address() {
        let cpu = paged_cpu();
        let fault = cpu
            .translate(0x0001_0000_0000_0000, AccessKind::Fetch, 0)
            .unwrap_err();
        assert_eq!(fault, TlbFault::BadAddress);
        assert_eq!(fault.exception(AccessKind::Fetch), Exception::Adef);
        assert_eq!(fault.exception(AccessKind::Load), Exception::Adem);
        // Sign-extended high half is canonical and simply misses
        assert_eq!(
            cpu.translate(0xffff_8000_0000_0000, AccessKind::Load, 0),
            Err(TlbFault::NoMatch)
        );
    }

    #[test]
    fn test_permission_order() {
        let mut cpu = paged_cpu();
        let lo = TLBELO_V | TLBELO_NX | TLBELO_NR;
        stage(&mut cpu, 0x50_0000, 12, lo, 0);
        cpu.tlbfill();
        assert_eq!(
            cpu.translate(0x50_0000, AccessKind::Fetch, 0),
            Err(TlbFault::ExecuteInhibit)
        );
        assert_eq!(
            cpu.translate(0x50_0000, AccessKind::Load, 0),
            Err(TlbFault::ReadInhibit)
        );
        assert_eq!(
            cpu.translate(0x50_0000, AccessKind::Store, 3),
            Err(TlbFault::Privilege)
        );
        // Odd half has V clear
        assert_eq!(
            cpu.translate(0x50_1000, AccessKind::Load, 0),
            Err(TlbFault::Invalid)
        );
        assert_eq!(TlbFault::Invalid.exception(AccessKind::Store), Exception::Pis);
    }

    #[test]
    fn test_rplv_requires_exact_level() {
        let mut cpu = paged_cpu();
        let lo = PTE_RW & !(3 << TLBELO_PLV_SHIFT) | (2 << TLBELO_PLV_SHIFT) | TLBELO_RPLV;
        stage(&mut cpu, 0x60_0000, 12, lo, lo);
        cpu.tlbfill();
        assert!(cpu.translate(0x60_0000, AccessKind::Load, 2).is_ok());
        assert_eq!(
            cpu.translate(0x60_0000, AccessKind::Load, 0),
            Err(TlbFault::Privilege)
        );
    }

    #[test]
    fn test_tlbsrch_and_tlbrd() {
        let mut cpu = paged_cpu();
        cpu.csr_write(CsrId::Asid, 9).unwrap();
        stage(&mut cpu, 0x70_0000, 12, PTE_RW | ppn(5), PTE_RW | ppn(6));
        cpu.tlbfill();

        cpu.csr_write(CsrId::Tlbehi, 0x70_0000).unwrap();
        cpu.tlbsrch();
        let idx = cpu.csr.get(CsrId::Tlbidx);
        assert_eq!(idx & TLBIDX_NE, 0);
        let raw = (idx & 0xffff) as usize;
        assert!(raw >= cpu.tlb.ftlb_len());

        // Clobber the shadows, then read back
        cpu.csr_write(CsrId::Tlbehi, 0).unwrap();
        cpu.csr_write(CsrId::Tlbelo0, 0).unwrap();
        cpu.csr.set(CsrId::Asid, 1);
        cpu.csr_write(CsrId::Tlbidx, raw as u64).unwrap();
        cpu.tlbrd();
        assert_eq!(cpu.csr.get(CsrId::Tlbehi), 0x70_0000);
        assert_eq!(cpu.csr.get(CsrId::Tlbelo0), PTE_RW | ppn(5));
        assert_eq!(cpu.csr.get(CsrId::Tlbelo1), PTE_RW | ppn(6));
        assert_eq!(cpu.csr.get(CsrId::Asid) & ASID_MASK, 9);
        assert_eq!(extract64(cpu.csr.get(CsrId::Tlbidx), TLBIDX_PS_SHIFT, 6), 12);

        // Miss
        cpu.csr_write(CsrId::Tlbehi, 0x7100_0000).unwrap();
        cpu.tlbsrch();
        assert_ne!(cpu.csr.get(CsrId::Tlbidx) & TLBIDX_NE, 0);
    }

    #[test]
    fn test_tlbrd_of_empty_slot() {
        let mut cpu = paged_cpu();
        cpu.csr_write(CsrId::Tlbehi, 0x1000_0000).unwrap();
        cpu.csr_write(CsrId::Tlbelo0, PTE_RW).unwrap();
        cpu.csr_write(CsrId::Tlbidx, 3).unwrap();
        cpu.tlbrd();
        assert_ne!(cpu.csr.get(CsrId::Tlbidx) & TLBIDX_NE, 0);
        assert_eq!(cpu.csr.get(CsrId::Tlbehi), 0);
        assert_eq!(cpu.csr.get(CsrId::Tlbelo0), 0);
    }

    #[test]
    fn test_tlbwr_indexed_and_ne() {
        let mut cpu = paged_cpu();
        let raw = cpu.tlb.ftlb_len() + 2;
        stage(&mut cpu, 0x90_0000, 12, PTE_RW, PTE_RW);
        cpu.csr_xchg(CsrId::Tlbidx, raw as u64, 0xffff).unwrap();
        cpu.tlbwr();
        assert!(cpu.tlb.entry(TlbIndex::Vtlb(VtlbIndex(2))).present);

        cpu.csr_xchg(CsrId::Tlbidx, TLBIDX_NE, TLBIDX_NE).unwrap();
        cpu.tlbwr();
        assert!(!cpu.tlb.entry(TlbIndex::Vtlb(VtlbIndex(2))).present);
    }

    #[test]
    fn test_tlbwr_ftlb_with_wrong_page_size() {
        let mut cpu = paged_cpu();
        stage(&mut cpu, 0x90_0000, 12, PTE_RW, PTE_RW);
        cpu.csr_xchg(CsrId::Tlbidx, 5, 0xffff).unwrap();
        cpu.tlbwr();
        assert_eq!(cpu.tlb.present_count(), 0);
    }

    #[test]
    fn test_refill_fill_reads_refill_shadows() {
        let mut cpu = paged_cpu();
        cpu.csr_write(CsrId::Tlbrera, TLBRERA_ISTLBR).unwrap();
        cpu.csr_write(CsrId::Tlbrehi, 0xa0_0000 | 12).unwrap();
        cpu.csr_write(CsrId::Tlbrelo0, PTE_RW | ppn(0x33)).unwrap();
        cpu.csr_write(CsrId::Tlbrelo1, PTE_RW | ppn(0x34)).unwrap();
        // Normal shadows say "not present"; refill ignores them
        cpu.csr_write(CsrId::Tlbidx, TLBIDX_NE).unwrap();
        cpu.tlbfill();
        cpu.csr_write(CsrId::Tlbrera, 0).unwrap();

        let t = cpu.translate(0xa0_1004, AccessKind::Load, 0).unwrap();
        assert_eq!(t.paddr, 0x3_4004);
    }

    #[test]
    fn test_fill_never_evicts_wired() {
        let mut cpu = paged_cpu();
        cpu.csr_write(CsrId::Tlbwired, 4).unwrap();
        for i in 0..4 {
            cpu.tlb.set_entry(
                TlbIndex::Vtlb(VtlbIndex(i)),
                TlbEntry {
                    vppn: (0x100_0000 + i as u64 * 0x10_0000) >> TLBEHI_VPPN_SHIFT,
                    ps: 12,
                    global: true,
                    present: true,
                    lo: [PTE_RW, PTE_RW],
                    ..TlbEntry::default()
                },
            );
        }
        let wired: Vec<TlbEntry> = cpu.tlb.vtlb_entries()[..4].to_vec();
        for i in 0..100u64 {
            stage(&mut cpu, 0x4000_0000 + (i << 13), 12, PTE_RW, PTE_RW);
            cpu.tlbfill();
        }
        assert_eq!(&cpu.tlb.vtlb_entries()[..4], wired.as_slice());
    }

    #[test]
    fn test_tlbclr_scopes() {
        let mut cpu = paged_cpu();
        cpu.csr_write(CsrId::Asid, 2).unwrap();
        let mk = |vppn: u64, asid: u16, global: bool| TlbEntry {
            vppn,
            ps: 14,
            asid,
            global,
            present: true,
            lo: [PTE_RW, PTE_RW],
        };
        cpu.tlb.set_entry(TlbIndex::Ftlb(FtlbIndex { set: 1, way: 0 }), mk(0x10, 2, false));
        cpu.tlb.set_entry(TlbIndex::Ftlb(FtlbIndex { set: 1, way: 1 }), mk(0x20, 2, true));
        cpu.tlb.set_entry(TlbIndex::Ftlb(FtlbIndex { set: 2, way: 0 }), mk(0x30, 2, false));
        cpu.tlb.set_entry(TlbIndex::Vtlb(VtlbIndex(0)), mk(0x40, 2, false));
        cpu.tlb.set_entry(TlbIndex::Vtlb(VtlbIndex(1)), mk(0x50, 3, false));

        // FTLB index in set 1: only that set
        cpu.csr_write(CsrId::Tlbidx, 1).unwrap();
        cpu.tlbclr();
        assert!(!cpu.tlb.entry(TlbIndex::Ftlb(FtlbIndex { set: 1, way: 0 })).present);
        assert!(cpu.tlb.entry(TlbIndex::Ftlb(FtlbIndex { set: 1, way: 1 })).present);
        assert!(cpu.tlb.entry(TlbIndex::Ftlb(FtlbIndex { set: 2, way: 0 })).present);
        assert!(cpu.tlb.entry(TlbIndex::Vtlb(VtlbIndex(0))).present);

        // VTLB index: the whole VTLB, current ASID only
        cpu.csr_write(CsrId::Tlbidx, cpu.tlb.ftlb_len() as u64).unwrap();
        cpu.tlbclr();
        assert!(!cpu.tlb.entry(TlbIndex::Vtlb(VtlbIndex(0))).present);
        assert!(cpu.tlb.entry(TlbIndex::Vtlb(VtlbIndex(1))).present);

        cpu.tlbflush();
        assert!(!cpu.tlb.entry(TlbIndex::Vtlb(VtlbIndex(1))).present);
        assert!(cpu.tlb.entry(TlbIndex::Ftlb(FtlbIndex { set: 2, way: 0 })).present);
    }

    fn populate_for_invtlb(cpu: &mut CpuState) {
        let entries = [
            (0, 0x100u64, 1u16, false),
            (1, 0x100, 2, false),
            (2, 0x100, 0, true),
            (3, 0x200, 1, false),
        ];
        for (slot, vppn, asid, global) in entries {
            cpu.tlb.set_entry(
                TlbIndex::Vtlb(VtlbIndex(slot)),
                TlbEntry {
                    vppn,
                    ps: 12,
                    asid,
                    global,
                    present: true,
                    lo: [PTE_RW, PTE_RW],
                },
            );
        }
    }

    fn present_slots(cpu: &CpuState) -> Vec<usize> {
        cpu.tlb
            .vtlb_entries()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.present)
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn test_invtlb_ops() {
        let va = 0x100 << TLBEHI_VPPN_SHIFT;
        let cases: [(u32, Vec<usize>); 7] = [
            (0, vec![]),
            (1, vec![]),
            (2, vec![0, 1, 3]),
            (3, vec![2]),
            (4, vec![1, 2]),
            (5, vec![1, 2, 3]),
            (6, vec![1, 3]),
        ];
        for (op, expect) in cases {
            let mut cpu = paged_cpu();
            populate_for_invtlb(&mut cpu);
            cpu.invtlb(op, 1, va).unwrap();
            assert_eq!(present_slots(&cpu), expect, "op {}", op);
        }
    }

    #[test]
    fn test_invtlb_by_asid_spares_global_and_others() {
        let mut cpu = paged_cpu();
        populate_for_invtlb(&mut cpu);
        cpu.invtlb(4, 1, 0).unwrap();
        let left = present_slots(&cpu);
        assert!(left.contains(&1));
        assert!(left.contains(&2));
        assert!(!left.contains(&0));
        assert!(!left.contains(&3));
    }

    #[test]
    fn test_invtlb_reserved_op() {
        let mut cpu = paged_cpu();
        assert_eq!(cpu.invtlb(7, 0, 0), Err(Exception::Ine));
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let run = || {
            let mut cpu = paged_cpu();
            let mut results = Vec::new();
            for i in 0..32u64 {
                stage(&mut cpu, i << 16, if i % 3 == 0 { 14 } else { 12 }, PTE_RW | ppn(i), PTE_RW);
                cpu.tlbfill();
            }
            for i in 0..32u64 {
                results.push(cpu.translate(i << 16, AccessKind::Load, 0));
            }
            results
        };
        assert_eq!(run(), run());
    }
}
