//! LDDIR / LDPTE: the page-walk helpers refill handlers use.
//!
//! Directory geometry comes from PWCL/PWCH; the address being walked is
//! TLBRBADV. LDDIR returns the next-level table base (or tags a huge-page
//! entry with its level), LDPTE loads one half of the leaf pair into
//! TLBRELO0/1 and records the page size in TLBREHI.PS.

use crate::bits::{extract64, mask64};
use crate::bus::Bus;
use crate::cpu::CpuState;
use crate::cpu::csr::*;
use crate::error::MemoryError;

/// Directory entry maps a huge page.
pub const PTE_HUGE: u64 = 1 << 6;
/// Global bit of a huge-page directory entry.
pub const PTE_HGLOBAL: u64 = 1 << 12;
pub const PTE_LEVEL_SHIFT: u32 = 13;
pub const PTE_LEVEL_LEN: u32 = 2;

// PWCL fields
const PWCL_PTBASE_SHIFT: u32 = 0;
const PWCL_PTWIDTH_SHIFT: u32 = 5;
const PWCL_DIR1_BASE_SHIFT: u32 = 10;
const PWCL_DIR1_WIDTH_SHIFT: u32 = 15;
const PWCL_DIR2_BASE_SHIFT: u32 = 20;
const PWCL_DIR2_WIDTH_SHIFT: u32 = 25;
const PWCL_PTEWIDTH_SHIFT: u32 = 30;
// PWCH fields
const PWCH_DIR3_BASE_SHIFT: u32 = 0;
const PWCH_DIR3_WIDTH_SHIFT: u32 = 6;
const PWCH_DIR4_BASE_SHIFT: u32 = 12;
const PWCH_DIR4_WIDTH_SHIFT: u32 = 18;

impl CpuState {
    /// (base bit, width) of directory `level` (1..=4).
    fn dir_geometry(&self, level: u64) -> (u32, u32) {
        let pwcl = self.csr.get(CsrId::Pwcl);
        let pwch = self.csr.get(CsrId::Pwch);
        let (reg, base_shift, width_shift, len) = match level {
            1 => (pwcl, PWCL_DIR1_BASE_SHIFT, PWCL_DIR1_WIDTH_SHIFT, 5),
            2 => (pwcl, PWCL_DIR2_BASE_SHIFT, PWCL_DIR2_WIDTH_SHIFT, 5),
            3 => (pwch, PWCH_DIR3_BASE_SHIFT, PWCH_DIR3_WIDTH_SHIFT, 6),
            _ => (pwch, PWCH_DIR4_BASE_SHIFT, PWCH_DIR4_WIDTH_SHIFT, 6),
        };
        (
            extract64(reg, base_shift, len) as u32,
            extract64(reg, width_shift, len) as u32,
        )
    }

    /// log2 of the table entry size: 8, 16, 24 or 32 bytes.
    fn pte_shift(&self) -> u32 {
        (extract64(self.csr.get(CsrId::Pwcl), PWCL_PTEWIDTH_SHIFT, 2) as u32 + 1) * 3
    }

    /// LDDIR rd, rj, level
    pub fn lddir(&mut self, bus: &mut dyn Bus, base: u64, level: u64) -> Result<u64, MemoryError> {
        if level == 0 || level > 4 {
            log::warn!("[TLB] LDDIR with level {} ignored", level);
            return Ok(base);
        }
        if base & PTE_HUGE != 0 {
            if extract64(base, PTE_LEVEL_SHIFT, PTE_LEVEL_LEN) != 0 {
                return Ok(base);
            }
            let level_field = (level & mask64(PTE_LEVEL_LEN)) << PTE_LEVEL_SHIFT;
            return Ok(base | level_field);
        }

        let phys_mask = self.config.phys_mask();
        let badv = self.csr.get(CsrId::Tlbrbadv);
        let (dir_base, dir_width) = self.dir_geometry(level);
        let index = (badv >> dir_base) & mask64(dir_width);
        let addr = (base & phys_mask) | (index << self.pte_shift());
        let next = bus.load(addr, 8)?;
        log::trace!(
            "[TLB] LDDIR level={} base={:#x} index={:#x} -> {:#x}",
            level,
            base,
            index,
            next
        );
        Ok(next & phys_mask)
    }

    /// LDPTE rj, seq: load the even (`odd == false`) or odd leaf entry.
    pub fn ldpte(&mut self, bus: &mut dyn Bus, base: u64, odd: bool) -> Result<(), MemoryError> {
        let pwcl = self.csr.get(CsrId::Pwcl);
        let ptbase = extract64(pwcl, PWCL_PTBASE_SHIFT, 5) as u32;
        let ptwidth = extract64(pwcl, PWCL_PTWIDTH_SHIFT, 5) as u32;

        let (entry, ps) = if base & PTE_HUGE != 0 {
            // Huge page: `base` already holds the mapping
            let mut entry = base & self.config.phys_mask() & !PTE_HUGE;
            if base & PTE_HGLOBAL != 0 {
                entry = (entry & !PTE_HGLOBAL) | TLBELO_G;
            }
            let level = extract64(base, PTE_LEVEL_SHIFT, PTE_LEVEL_LEN);
            entry &= !(mask64(PTE_LEVEL_LEN) << PTE_LEVEL_SHIFT);
            let (dir_base, dir_width) = self.dir_geometry(level.max(1));
            let ps = (dir_base + dir_width).saturating_sub(1);
            if odd {
                entry = entry.wrapping_add(1u64 << ps);
            }
            (entry, ps)
        } else {
            let badv = self.csr.get(CsrId::Tlbrbadv);
            let index = ((badv >> ptbase) & mask64(ptwidth)) & !1;
            let slot = if odd { index + 1 } else { index };
            let addr = (base & self.config.phys_mask()) | (slot << self.pte_shift());
            (bus.load(addr, 8)?, ptbase)
        };

        let entry = entry & TLBELO_MASK;
        if odd {
            self.csr.set(CsrId::Tlbrelo1, entry);
        } else {
            self.csr.set(CsrId::Tlbrelo0, entry);
        }
        self.csr.update(CsrId::Tlbrehi, |hi| {
            (hi & !mask64(TLBREHI_PS_LEN)) | (ps as u64 & mask64(TLBREHI_PS_LEN))
        });
        log::trace!(
            "[TLB] LDPTE {} entry={:#x} ps={}",
            if odd { "odd" } else { "even" },
            entry,
            ps
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Ram;
    use crate::cpu::test_support::make_test_cpu;

    /// 3-level layout for 16 KiB pages: PT at bit 14, DIR1 at bit 25 and
    /// DIR3 at bit 36, 11 index bits each.
    fn walker_cpu() -> CpuState {
        let mut cpu = make_test_cpu();
        let pwcl = 14 | (11 << 5) | (25 << 10) | (11 << 15);
        cpu.csr_write(CsrId::Pwcl, pwcl).unwrap();
        cpu.csr_write(CsrId::Pwch, 36 | (11 << 6)).unwrap();
        cpu
    }

    #[test]
    fn test_three_level_walk() {
        let mut cpu = walker_cpu();
        let mut ram = Ram::new(0, 0x10_0000);
        let va: u64 = (3 << 36) | (5 << 25) | (9 << 14);
        cpu.csr_write(CsrId::Tlbrbadv, va).unwrap();

        let pgd = 0x1_0000;
        let pmd = 0x2_0000;
        let pt = 0x3_0000;
        ram.store(pgd + 3 * 8, 8, pmd).unwrap();
        ram.store(pmd + 5 * 8, 8, pt).unwrap();
        ram.store(pt + 8 * 8, 8, 0x11_1000 | 0x1f).unwrap();
        ram.store(pt + 9 * 8, 8, 0x22_2000 | 0x1f).unwrap();

        let l3 = cpu.lddir(&mut ram, pgd, 3).unwrap();
        assert_eq!(l3, pmd);
        let l1 = cpu.lddir(&mut ram, l3, 1).unwrap();
        assert_eq!(l1, pt);

        cpu.ldpte(&mut ram, l1, false).unwrap();
        cpu.ldpte(&mut ram, l1, true).unwrap();
        assert_eq!(cpu.csr.get(CsrId::Tlbrelo0), 0x11_1000 | 0x1f);
        assert_eq!(cpu.csr.get(CsrId::Tlbrelo1), 0x22_2000 | 0x1f);
        assert_eq!(cpu.csr.get(CsrId::Tlbrehi) & 0x3f, 14);
    }

    #[test]
    fn test_huge_entry_tagged_with_level() {
        let mut cpu = walker_cpu();
        let mut ram = Ram::new(0, 0x1000);
        let huge = 0x4000_0000 | PTE_HUGE | 0x3;
        let tagged = cpu.lddir(&mut ram, huge, 1).unwrap();
        assert_eq!(extract64(tagged, PTE_LEVEL_SHIFT, PTE_LEVEL_LEN), 1);
        // Already tagged: returned unchanged by outer levels
        assert_eq!(cpu.lddir(&mut ram, tagged, 2).unwrap(), tagged);
    }

    #[test]
    fn test_huge_leaf_split_into_halves() {
        let mut cpu = walker_cpu();
        let mut ram = Ram::new(0, 0x1000);
        let base = 0x4000_0000 | PTE_HUGE | PTE_HGLOBAL | 0x3 | (1 << PTE_LEVEL_SHIFT);
        cpu.ldpte(&mut ram, base, false).unwrap();
        cpu.ldpte(&mut ram, base, true).unwrap();

        // DIR1 base 25 + width 11 - 1 = 35
        assert_eq!(cpu.csr.get(CsrId::Tlbrehi) & 0x3f, 35);
        let lo0 = cpu.csr.get(CsrId::Tlbrelo0);
        let lo1 = cpu.csr.get(CsrId::Tlbrelo1);
        assert_ne!(lo0 & TLBELO_G, 0);
        assert_eq!(lo0 & PTE_HGLOBAL, 0);
        assert_eq!(lo0 & !0xfff, 0x4000_0000);
        assert_eq!(lo1 - lo0, 1 << 35);
    }

    #[test]
    fn test_bad_level_is_passthrough() {
        let mut cpu = walker_cpu();
        let mut ram = Ram::new(0, 0x1000);
        assert_eq!(cpu.lddir(&mut ram, 0x1234, 0).unwrap(), 0x1234);
        assert_eq!(cpu.lddir(&mut ram, 0x1234, 5).unwrap(), 0x1234);
    }

    #[test]
    fn test_walk_outside_ram_reports_error() {
        let mut cpu = walker_cpu();
        let mut ram = Ram::new(0, 0x1000);
        assert!(cpu.lddir(&mut ram, 0x10_0000, 1).is_err());
    }
}
