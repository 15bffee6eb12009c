//! TLB entry pools.
//!
//! Two disjoint arenas of fixed capacity:
//!
//! - **FTLB**: `sets × ways`, one page size (STLBPS.PS), indexed by address
//!   bits above the doubled page.
//! - **VTLB**: small and fully associative, per-entry page size, with the
//!   first `TLBWIRED` slots exempt from random replacement.
//!
//! Slots are addressed by typed indices (`FtlbIndex`, `VtlbIndex`) and the
//! unified `TlbIndex`. Callers hold indices, never references, across
//! operations that may rewrite the pools.

use crate::bits::{extract64, mask64};
use crate::cpu::csr::{
    TLBELO_D, TLBELO_G, TLBELO_NR, TLBELO_NX, TLBELO_PLV_SHIFT, TLBELO_PPN_SHIFT, TLBELO_RPLV,
    TLBELO_V, TLBEHI_VPPN_SHIFT,
};
use serde::{Deserialize, Serialize};

/// One TLB entry: a doubled page with independent even/odd halves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlbEntry {
    /// TLBEHI.VPPN field value: virtual address bits 47:13.
    pub vppn: u64,
    /// log2 of the size of one half.
    pub ps: u8,
    pub asid: u16,
    pub global: bool,
    /// The E bit. Absent entries never match.
    pub present: bool,
    /// Raw TLBELO0/1 layout for the even and odd halves.
    pub lo: [u64; 2],
}

impl TlbEntry {
    /// Tag comparison using this entry's own page size.
    pub fn matches(&self, vaddr: u64, asid: u16, virt_mask: u64) -> bool {
        if !self.present || !(self.global || self.asid == asid) {
            return false;
        }
        self.matches_va(vaddr, virt_mask)
    }

    /// Tag comparison only; ignores E, G and ASID.
    pub fn matches_va(&self, vaddr: u64, virt_mask: u64) -> bool {
        let shift = self.ps as u32 + 1;
        let compare_shift = shift.saturating_sub(TLBEHI_VPPN_SHIFT);
        (vaddr & virt_mask).checked_shr(shift).unwrap_or(0)
            == self.vppn.checked_shr(compare_shift).unwrap_or(0)
    }

    /// Even/odd half selected by the address bit just above the page.
    pub fn half(&self, vaddr: u64) -> usize {
        ((vaddr >> self.ps) & 1) as usize
    }

    pub fn invalidate(&mut self) {
        self.present = false;
    }
}

/// Decoded permission and frame bits of one TLBELO half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbHalf {
    pub valid: bool,
    pub dirty: bool,
    pub plv: u8,
    pub no_read: bool,
    pub no_exec: bool,
    pub rplv: bool,
    pub ppn: u64,
}

impl TlbHalf {
    pub fn decode(lo: u64, palen: u32) -> Self {
        Self {
            valid: lo & TLBELO_V != 0,
            dirty: lo & TLBELO_D != 0,
            plv: extract64(lo, TLBELO_PLV_SHIFT, 2) as u8,
            no_read: lo & TLBELO_NR != 0,
            no_exec: lo & TLBELO_NX != 0,
            rplv: lo & TLBELO_RPLV != 0,
            ppn: extract64(lo, TLBELO_PPN_SHIFT, palen - TLBELO_PPN_SHIFT),
        }
    }
}

/// Both ELO halves must carry G for the entry to be global.
pub fn lo_global(lo0: u64, lo1: u64) -> bool {
    lo0 & lo1 & TLBELO_G != 0
}

// ═══════════════════════════════════════════════════════════════════════════
// Indices
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FtlbIndex {
    pub set: usize,
    pub way: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VtlbIndex(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlbIndex {
    Ftlb(FtlbIndex),
    Vtlb(VtlbIndex),
}

// ═══════════════════════════════════════════════════════════════════════════
// Replacement
// ═══════════════════════════════════════════════════════════════════════════

/// xorshift64 victim selector. Seeded with a constant so two runs of the
/// same guest make the same replacement choices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Xorshift {
    state: u64,
}

impl Xorshift {
    pub const SEED: u64 = 123_456_789;

    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { Self::SEED } else { seed },
        }
    }

    pub fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform-ish value in `[lo, hi)`. `hi` must exceed `lo`.
    pub fn range(&mut self, lo: usize, hi: usize) -> usize {
        lo + (self.next() as usize) % (hi - lo)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Pools
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tlb {
    sets: usize,
    ways: usize,
    /// `way * sets + set`
    ftlb: Vec<TlbEntry>,
    vtlb: Vec<TlbEntry>,
    rng: Xorshift,
}

impl Tlb {
    pub fn new(sets: usize, ways: usize, vtlb_entries: usize) -> Self {
        Self {
            sets,
            ways,
            ftlb: vec![TlbEntry::default(); sets * ways],
            vtlb: vec![TlbEntry::default(); vtlb_entries],
            rng: Xorshift::new(Xorshift::SEED),
        }
    }

    pub fn sets(&self) -> usize {
        self.sets
    }

    pub fn ways(&self) -> usize {
        self.ways
    }

    pub fn ftlb_len(&self) -> usize {
        self.ftlb.len()
    }

    pub fn vtlb_len(&self) -> usize {
        self.vtlb.len()
    }

    pub fn total(&self) -> usize {
        self.ftlb.len() + self.vtlb.len()
    }

    /// Unified TLBIDX.Index → typed index.
    pub fn index_from_raw(&self, raw: usize) -> Option<TlbIndex> {
        if raw < self.ftlb.len() {
            Some(TlbIndex::Ftlb(FtlbIndex {
                set: raw % self.sets,
                way: raw / self.sets,
            }))
        } else if raw < self.total() {
            Some(TlbIndex::Vtlb(VtlbIndex(raw - self.ftlb.len())))
        } else {
            None
        }
    }

    pub fn raw_index(&self, index: TlbIndex) -> usize {
        match index {
            TlbIndex::Ftlb(FtlbIndex { set, way }) => way * self.sets + set,
            TlbIndex::Vtlb(VtlbIndex(i)) => self.ftlb.len() + i,
        }
    }

    pub fn entry(&self, index: TlbIndex) -> &TlbEntry {
        match index {
            TlbIndex::Ftlb(FtlbIndex { set, way }) => &self.ftlb[way * self.sets + set],
            TlbIndex::Vtlb(VtlbIndex(i)) => &self.vtlb[i],
        }
    }

    pub fn entry_mut(&mut self, index: TlbIndex) -> &mut TlbEntry {
        match index {
            TlbIndex::Ftlb(FtlbIndex { set, way }) => &mut self.ftlb[way * self.sets + set],
            TlbIndex::Vtlb(VtlbIndex(i)) => &mut self.vtlb[i],
        }
    }

    pub fn set_entry(&mut self, index: TlbIndex, entry: TlbEntry) {
        *self.entry_mut(index) = entry;
    }

    /// FTLB set selected by the address bits above the doubled page.
    pub fn ftlb_set(&self, vaddr: u64, stlb_ps: u8) -> usize {
        ((vaddr >> (stlb_ps as u32 + 1)) as usize) & (self.sets - 1)
    }

    /// Search the VTLB, then the FTLB set for `vaddr`. First match in scan
    /// order wins.
    pub fn lookup(&self, vaddr: u64, asid: u16, stlb_ps: u8, virt_mask: u64) -> Option<TlbIndex> {
        if let Some(i) = self
            .vtlb
            .iter()
            .position(|e| e.matches(vaddr, asid, virt_mask))
        {
            return Some(TlbIndex::Vtlb(VtlbIndex(i)));
        }
        let set = self.ftlb_set(vaddr, stlb_ps);
        (0..self.ways)
            .find(|&way| self.ftlb[way * self.sets + set].matches(vaddr, asid, virt_mask))
            .map(|way| TlbIndex::Ftlb(FtlbIndex { set, way }))
    }

    /// Replacement victim within the FTLB set for `vaddr`.
    pub fn ftlb_victim(&mut self, vaddr: u64, stlb_ps: u8) -> FtlbIndex {
        let set = self.ftlb_set(vaddr, stlb_ps);
        let way = self.rng.range(0, self.ways);
        FtlbIndex { set, way }
    }

    /// Replacement victim among the VTLB slots at or above `wired`.
    pub fn vtlb_victim(&mut self, wired: usize) -> VtlbIndex {
        let wired = wired.min(self.vtlb.len() - 1);
        VtlbIndex(self.rng.range(wired, self.vtlb.len()))
    }

    /// Invalidate every entry that satisfies `pred`; returns how many.
    pub fn invalidate_where(&mut self, pred: impl Fn(&TlbEntry) -> bool) -> usize {
        let mut count = 0;
        for entry in self.vtlb.iter_mut().chain(self.ftlb.iter_mut()) {
            if entry.present && pred(entry) {
                entry.invalidate();
                count += 1;
            }
        }
        count
    }

    /// Invalidate entries of one FTLB set that satisfy `pred`.
    pub fn invalidate_ftlb_set_where(
        &mut self,
        set: usize,
        pred: impl Fn(&TlbEntry) -> bool,
    ) -> usize {
        let mut count = 0;
        for way in 0..self.ways {
            let entry = &mut self.ftlb[way * self.sets + set];
            if entry.present && pred(entry) {
                entry.invalidate();
                count += 1;
            }
        }
        count
    }

    /// Invalidate VTLB entries that satisfy `pred`.
    pub fn invalidate_vtlb_where(&mut self, pred: impl Fn(&TlbEntry) -> bool) -> usize {
        let mut count = 0;
        for entry in self.vtlb.iter_mut() {
            if entry.present && pred(entry) {
                entry.invalidate();
                count += 1;
            }
        }
        count
    }

    pub fn flush_ftlb(&mut self) {
        self.ftlb.iter_mut().for_each(TlbEntry::invalidate);
    }

    pub fn flush_vtlb(&mut self) {
        self.vtlb.iter_mut().for_each(TlbEntry::invalidate);
    }

    pub fn flush_all(&mut self) {
        self.flush_ftlb();
        self.flush_vtlb();
    }

    pub fn ftlb_entries(&self) -> &[TlbEntry] {
        &self.ftlb
    }

    pub fn vtlb_entries(&self) -> &[TlbEntry] {
        &self.vtlb
    }

    pub fn present_count(&self) -> usize {
        self.ftlb
            .iter()
            .chain(self.vtlb.iter())
            .filter(|e| e.present)
            .count()
    }
}

/// Mask selecting the low `ps` bits (offset within one half).
pub fn page_offset_mask(ps: u8) -> u64 {
    mask64(ps as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const VMASK: u64 = 0x0000_ffff_ffff_ffff;

    fn entry(va: u64, ps: u8, asid: u16, global: bool) -> TlbEntry {
        TlbEntry {
            vppn: (va & VMASK) >> TLBEHI_VPPN_SHIFT,
            ps,
            asid,
            global,
            present: true,
            lo: [TLBELO_V | (0x100 << 12), TLBELO_V | (0x101 << 12)],
        }
    }

    #[test]
    fn test_tag_match_uses_entry_page_size() {
        let e = entry(0x1234_0000, 14, 1, false);
        assert!(e.matches(0x1234_0000, 1, VMASK));
        assert!(e.matches(0x1234_7fff, 1, VMASK));
        assert!(!e.matches(0x1234_8000, 1, VMASK));
        assert!(!e.matches(0x1234_0000, 2, VMASK));
        assert_eq!(e.half(0x1234_3fff), 0);
        assert_eq!(e.half(0x1234_4000), 1);
    }

    #[test]
    fn test_global_ignores_asid() {
        let e = entry(0x4000_0000, 12, 7, true);
        assert!(e.matches(0x4000_0000, 0, VMASK));
        assert!(e.matches(0x4000_1000, 99, VMASK));
    }

    #[test]
    fn test_raw_index_round_trip() {
        let tlb = Tlb::new(256, 8, 64);
        assert_eq!(tlb.total(), 2112);
        let idx = tlb.index_from_raw(2 * 256 + 5).unwrap();
        assert_eq!(idx, TlbIndex::Ftlb(FtlbIndex { set: 5, way: 2 }));
        assert_eq!(tlb.raw_index(idx), 2 * 256 + 5);
        assert_eq!(
            tlb.index_from_raw(2048 + 3),
            Some(TlbIndex::Vtlb(VtlbIndex(3)))
        );
        assert_eq!(tlb.index_from_raw(2112), None);
    }

    #[test]
    fn test_vtlb_searched_before_ftlb() {
        let mut tlb = Tlb::new(16, 2, 4);
        let va = 0x10_0000;
        let set = tlb.ftlb_set(va, 12);
        tlb.set_entry(
            TlbIndex::Ftlb(FtlbIndex { set, way: 1 }),
            entry(va, 12, 0, true),
        );
        assert_eq!(
            tlb.lookup(va, 0, 12, VMASK),
            Some(TlbIndex::Ftlb(FtlbIndex { set, way: 1 }))
        );
        tlb.set_entry(TlbIndex::Vtlb(VtlbIndex(2)), entry(va, 21, 0, true));
        assert_eq!(
            tlb.lookup(va, 0, 12, VMASK),
            Some(TlbIndex::Vtlb(VtlbIndex(2)))
        );
    }

    #[test]
    fn test_first_vtlb_match_wins() {
        let mut tlb = Tlb::new(16, 2, 4);
        tlb.set_entry(TlbIndex::Vtlb(VtlbIndex(3)), entry(0x8000, 12, 0, true));
        tlb.set_entry(TlbIndex::Vtlb(VtlbIndex(1)), entry(0x8000, 14, 0, true));
        assert_eq!(
            tlb.lookup(0x8000, 0, 12, VMASK),
            Some(TlbIndex::Vtlb(VtlbIndex(1)))
        );
    }

    #[test]
    fn test_flush_scopes() {
        let mut tlb = Tlb::new(16, 2, 4);
        tlb.set_entry(TlbIndex::Vtlb(VtlbIndex(0)), entry(0x1000, 12, 0, false));
        tlb.set_entry(
            TlbIndex::Ftlb(FtlbIndex { set: 0, way: 0 }),
            entry(0x0, 12, 0, false),
        );
        tlb.flush_vtlb();
        assert_eq!(tlb.present_count(), 1);
        tlb.flush_ftlb();
        assert_eq!(tlb.present_count(), 0);
    }

    proptest! {
        #[test]
        fn test_vtlb_victim_respects_wired(wired in 0usize..64, draws in 1usize..200) {
            let mut tlb = Tlb::new(16, 2, 64);
            for _ in 0..draws {
                let VtlbIndex(i) = tlb.vtlb_victim(wired);
                prop_assert!(i >= wired.min(63));
                prop_assert!(i < 64);
            }
        }

        #[test]
        fn test_replacement_is_deterministic(draws in 1usize..100) {
            let mut a = Tlb::new(32, 4, 16);
            let mut b = Tlb::new(32, 4, 16);
            for i in 0..draws {
                let va = (i as u64) << 13;
                prop_assert_eq!(a.ftlb_victim(va, 12), b.ftlb_victim(va, 12));
                prop_assert_eq!(a.vtlb_victim(2), b.vtlb_victim(2));
            }
        }
    }
}
