//! Control and status register definitions.
//!
//! All CSRs are declared once in `define_csrs!`, which produces the `CsrId`
//! enum, the raw-number decoder and the descriptor table (write mask, side
//! effect, flags). Reads, writes and exchanges in `csr_ops.rs` dispatch
//! through that table instead of per-register match arms.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

// ═══════════════════════════════════════════════════════════════════════════
// Field layouts
// ═══════════════════════════════════════════════════════════════════════════

pub const CRMD_PLV: u64 = 0x3;
pub const CRMD_IE: u64 = 1 << 2;
pub const CRMD_DA: u64 = 1 << 3;
pub const CRMD_PG: u64 = 1 << 4;
pub const CRMD_DATF_SHIFT: u32 = 5;
pub const CRMD_DATM_SHIFT: u32 = 7;
pub const CRMD_WE: u64 = 1 << 9;

pub const PRMD_PPLV: u64 = 0x3;
pub const PRMD_PIE: u64 = 1 << 2;
pub const PRMD_PWE: u64 = 1 << 3;

/// TLBRPRMD keeps PWE at bit 4.
pub const TLBRPRMD_PWE: u64 = 1 << 4;

pub const EUEN_FPE: u64 = 1 << 0;
pub const EUEN_SXE: u64 = 1 << 1;
pub const EUEN_ASXE: u64 = 1 << 2;
pub const EUEN_BTE: u64 = 1 << 3;

/// MISC.VA32L1..3 at bits 1..3, DRDTL1..3 at 5..7, ALCL0..3 at 12..15.
pub const MISC_VA32_SHIFT: u32 = 0;
pub const MISC_DRDTL_SHIFT: u32 = 4;
pub const MISC_ALCL_SHIFT: u32 = 12;

pub const ECFG_LIE: u64 = 0x1bff;
pub const ECFG_VS_SHIFT: u32 = 16;
pub const ECFG_VS_LEN: u32 = 3;

pub const ESTAT_IS: u64 = 0x1fff;
/// Software interrupt bits, the only IS bits software may write.
pub const ESTAT_IS_SW: u64 = 0x3;
pub const ESTAT_ECODE_SHIFT: u32 = 16;
pub const ESTAT_ECODE_LEN: u32 = 6;
pub const ESTAT_ESUBCODE_SHIFT: u32 = 22;
pub const ESTAT_ESUBCODE_LEN: u32 = 9;

/// Interrupt line numbers within ESTAT.IS.
pub const IRQ_HW_BASE: u32 = 2;
pub const IRQ_PMI: u32 = 10;
pub const IRQ_TIMER: u32 = 11;
pub const IRQ_IPI: u32 = 12;

pub const TLBIDX_INDEX_LEN: u32 = 16;
pub const TLBIDX_PS_SHIFT: u32 = 24;
pub const TLBIDX_PS_LEN: u32 = 6;
pub const TLBIDX_NE: u64 = 1 << 31;

pub const TLBEHI_VPPN_SHIFT: u32 = 13;

pub const TLBREHI_PS_LEN: u32 = 6;

pub const TLBELO_V: u64 = 1 << 0;
pub const TLBELO_D: u64 = 1 << 1;
pub const TLBELO_PLV_SHIFT: u32 = 2;
pub const TLBELO_MAT_SHIFT: u32 = 4;
pub const TLBELO_G: u64 = 1 << 6;
pub const TLBELO_PPN_SHIFT: u32 = 12;
pub const TLBELO_NR: u64 = 1 << 61;
pub const TLBELO_NX: u64 = 1 << 62;
pub const TLBELO_RPLV: u64 = 1 << 63;

pub const ASID_MASK: u64 = 0x3ff;
pub const ASID_BITS: u64 = 10;
pub const ASIDBITS_SHIFT: u32 = 16;

pub const TLBRERA_ISTLBR: u64 = 1 << 0;

pub const TCFG_EN: u64 = 1 << 0;
pub const TCFG_PERIODIC: u64 = 1 << 1;
pub const TIMER_BITS: u32 = 48;

pub const TICLR_CLR: u64 = 1 << 0;

pub const LLBCTL_ROLLB: u64 = 1 << 0;
pub const LLBCTL_WCLLB: u64 = 1 << 1;
pub const LLBCTL_KLO: u64 = 1 << 2;

pub const IMPCTL2_INV_PWC: u64 = 1 << 0;
pub const IMPCTL2_INV_PTB: u64 = 1 << 1;

pub const DMW_PLV_MASK: u64 = 0xf;
pub const DMW_MAT_SHIFT: u32 = 4;
pub const DMW_VSEG_SHIFT: u32 = 60;

const PAGE_BASE: u64 = !0xfff;
pub const TLBELO_MASK: u64 = 0xe000_ffff_ffff_f07f;
const ALL: u64 = u64::MAX;
const W32: u64 = 0xffff_ffff;

// ═══════════════════════════════════════════════════════════════════════════
// Register table
// ═══════════════════════════════════════════════════════════════════════════

/// What happens besides the masked store when a CSR is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrEffect {
    None,
    /// Writes ignored; value maintained by hardware.
    ReadOnly,
    /// Hardware-owned IS bits survive software writes.
    Estat,
    /// ASIDBITS folded into reads; a changed ASID flushes the TLB.
    Asid,
    /// Derived from PGDL/PGDH and the bad address.
    Pgd,
    /// Rearms the constant timer.
    Tcfg,
    /// Computed from the timer deadline on read.
    Tval,
    /// Writing CLR deasserts the timer interrupt line.
    Ticlr,
    /// ROLLB mirrors the LL bit; WCLLB clears it.
    Llbctl,
    /// Invalidate bits flush the TLB pools.
    Impctl2,
    /// Clamped below the VTLB size.
    Wired,
}

pub const CSRF_EXIT_TB: u8 = 1 << 0;

#[derive(Debug, Clone, Copy)]
pub struct CsrDesc {
    pub id: CsrId,
    pub write_mask: u64,
    pub effect: CsrEffect,
    pub flags: u8,
}

impl CsrDesc {
    /// A write changes state the translator baked into the current block.
    pub fn ends_block(&self) -> bool {
        self.flags & CSRF_EXIT_TB != 0
    }
}

macro_rules! define_csrs {
    ($( $name:ident = $num:literal, $mask:expr, $effect:ident, $flags:expr; )*) => {
        /// Architectural CSR number.
        #[repr(u16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum CsrId {
            $( $name = $num, )*
        }

        impl CsrId {
            pub const ALL: &'static [CsrId] = &[ $( CsrId::$name, )* ];

            pub fn from_raw(raw: u16) -> Option<CsrId> {
                match raw {
                    $( $num => Some(CsrId::$name), )*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( CsrId::$name => stringify!($name), )*
                }
            }
        }

        pub static CSR_TABLE: &[CsrDesc] = &[
            $( CsrDesc {
                id: CsrId::$name,
                write_mask: $mask,
                effect: CsrEffect::$effect,
                flags: $flags,
            }, )*
        ];
    };
}

define_csrs! {
    Crmd      = 0x0,   0x3ff,            None,     CSRF_EXIT_TB;
    Prmd      = 0x1,   0xf,              None,     0;
    Euen      = 0x2,   0xf,              None,     CSRF_EXIT_TB;
    Misc      = 0x3,   0x7_feee,         None,     CSRF_EXIT_TB;
    Ecfg      = 0x4,   0x7_1bff,         None,     CSRF_EXIT_TB;
    Estat     = 0x5,   ESTAT_IS_SW,      Estat,    CSRF_EXIT_TB;
    Era       = 0x6,   ALL,              None,     0;
    Badv      = 0x7,   ALL,              None,     0;
    Badi      = 0x8,   0,                ReadOnly, 0;
    Eentry    = 0xc,   PAGE_BASE,        None,     0;
    Tlbidx    = 0x10,  0xbf00_ffff,      None,     0;
    Tlbehi    = 0x11,  0xffff_ffff_ffff_e000, None, 0;
    Tlbelo0   = 0x12,  TLBELO_MASK,       None,     0;
    Tlbelo1   = 0x13,  TLBELO_MASK,       None,     0;
    Asid      = 0x18,  ASID_MASK,        Asid,     CSRF_EXIT_TB;
    Pgdl      = 0x19,  PAGE_BASE,        None,     0;
    Pgdh      = 0x1a,  PAGE_BASE,        None,     0;
    Pgd       = 0x1b,  0,                Pgd,      0;
    Pwcl      = 0x1c,  W32,              None,     0;
    Pwch      = 0x1d,  0x1ff_ffff,       None,     0;
    Stlbps    = 0x1e,  0x3f,             None,     0;
    Rvacfg    = 0x1f,  0xf,              None,     0;
    Cpuid     = 0x20,  0,                ReadOnly, 0;
    Prcfg1    = 0x21,  0,                ReadOnly, 0;
    Prcfg2    = 0x22,  0,                ReadOnly, 0;
    Prcfg3    = 0x23,  0,                ReadOnly, 0;
    Save0     = 0x30,  ALL,              None,     0;
    Save1     = 0x31,  ALL,              None,     0;
    Save2     = 0x32,  ALL,              None,     0;
    Save3     = 0x33,  ALL,              None,     0;
    Save4     = 0x34,  ALL,              None,     0;
    Save5     = 0x35,  ALL,              None,     0;
    Save6     = 0x36,  ALL,              None,     0;
    Save7     = 0x37,  ALL,              None,     0;
    Save8     = 0x38,  ALL,              None,     0;
    Save9     = 0x39,  ALL,              None,     0;
    Save10    = 0x3a,  ALL,              None,     0;
    Save11    = 0x3b,  ALL,              None,     0;
    Save12    = 0x3c,  ALL,              None,     0;
    Save13    = 0x3d,  ALL,              None,     0;
    Save14    = 0x3e,  ALL,              None,     0;
    Save15    = 0x3f,  ALL,              None,     0;
    Tid       = 0x40,  W32,              None,     0;
    Tcfg      = 0x41,  0xffff_ffff_ffff, Tcfg,     CSRF_EXIT_TB;
    Tval      = 0x42,  0,                Tval,     0;
    Cntc      = 0x43,  ALL,              None,     0;
    Ticlr     = 0x44,  0,                Ticlr,    CSRF_EXIT_TB;
    Llbctl    = 0x60,  LLBCTL_KLO,       Llbctl,   0;
    Impctl1   = 0x80,  W32,              None,     0;
    Impctl2   = 0x81,  0,                Impctl2,  CSRF_EXIT_TB;
    Tlbrentry = 0x88,  PAGE_BASE,        None,     0;
    Tlbrbadv  = 0x89,  ALL,              None,     0;
    Tlbrera   = 0x8a,  ALL,              None,     0;
    Tlbrsave  = 0x8b,  ALL,              None,     0;
    Tlbrelo0  = 0x8c,  TLBELO_MASK,       None,     0;
    Tlbrelo1  = 0x8d,  TLBELO_MASK,       None,     0;
    Tlbrehi   = 0x8e,  0xffff_ffff_ffff_e03f, None, 0;
    Tlbrprmd  = 0x8f,  0x17,             None,     0;
    Merrctl   = 0x90,  ALL,              None,     0;
    Merrinfo1 = 0x91,  ALL,              None,     0;
    Merrinfo2 = 0x92,  ALL,              None,     0;
    Merrentry = 0x93,  PAGE_BASE,        None,     0;
    Merrera   = 0x94,  ALL,              None,     0;
    Merrsave  = 0x95,  ALL,              None,     0;
    Ctag      = 0x98,  ALL,              None,     0;
    Tlbwired  = 0x9f,  0xff,             Wired,    0;
    Msgis0    = 0xa0,  0,                ReadOnly, 0;
    Msgis1    = 0xa1,  0,                ReadOnly, 0;
    Msgis2    = 0xa2,  0,                ReadOnly, 0;
    Msgis3    = 0xa3,  0,                ReadOnly, 0;
    Msgir     = 0xa4,  0,                ReadOnly, 0;
    Msgie     = 0xa5,  0xff,             None,     0;
    Dmw0      = 0x180, 0xf000_0000_0000_003f, None, CSRF_EXIT_TB;
    Dmw1      = 0x181, 0xf000_0000_0000_003f, None, CSRF_EXIT_TB;
    Dmw2      = 0x182, 0xf000_0000_0000_003f, None, CSRF_EXIT_TB;
    Dmw3      = 0x183, 0xf000_0000_0000_003f, None, CSRF_EXIT_TB;
    Pmcfg0    = 0x200, W32,              None,     0;
    Pmcnt0    = 0x201, ALL,              None,     0;
    Pmcfg1    = 0x202, W32,              None,     0;
    Pmcnt1    = 0x203, ALL,              None,     0;
    Pmcfg2    = 0x204, W32,              None,     0;
    Pmcnt2    = 0x205, ALL,              None,     0;
    Pmcfg3    = 0x206, W32,              None,     0;
    Pmcnt3    = 0x207, ALL,              None,     0;
    Mwpc      = 0x300, 0,                ReadOnly, 0;
    Mwps      = 0x301, 0xffff,           None,     0;
    Fwpc      = 0x380, 0,                ReadOnly, 0;
    Fwps      = 0x381, 0xffff,           None,     0;
    Dbg       = 0x500, 0,                ReadOnly, 0;
    Dera      = 0x501, ALL,              None,     0;
    Dsave     = 0x502, ALL,              None,     0;
}

impl CsrId {
    pub fn raw(self) -> u16 {
        self as u16
    }

    pub fn dmw(index: usize) -> CsrId {
        match index & 3 {
            0 => CsrId::Dmw0,
            1 => CsrId::Dmw1,
            2 => CsrId::Dmw2,
            _ => CsrId::Dmw3,
        }
    }

    pub fn desc(self) -> CoreResult<&'static CsrDesc> {
        let slot = csr_map().slot(self.raw())?;
        Ok(&CSR_TABLE[slot])
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Identifier → slot mapping
// ═══════════════════════════════════════════════════════════════════════════

const NO_SLOT: u16 = u16::MAX;
const CSR_SPACE: usize = 1 << 14;

/// Raw CSR number → index into `CSR_TABLE` and `CsrFile`, built once.
pub struct CsrMap {
    slots: Vec<u16>,
}

impl CsrMap {
    fn build() -> Self {
        let mut slots = vec![NO_SLOT; CSR_SPACE];
        for (slot, desc) in CSR_TABLE.iter().enumerate() {
            slots[desc.id.raw() as usize] = slot as u16;
        }
        Self { slots }
    }

    pub fn slot(&self, raw: u16) -> CoreResult<usize> {
        match self.slots.get(raw as usize) {
            Some(&slot) if slot != NO_SLOT => Ok(slot as usize),
            _ => {
                log::error!("[CSR] No slot for CSR {:#x}", raw);
                Err(CoreError::UnknownCsr(raw))
            }
        }
    }

    pub fn len(&self) -> usize {
        CSR_TABLE.len()
    }
}

pub fn csr_map() -> &'static CsrMap {
    static MAP: OnceLock<CsrMap> = OnceLock::new();
    MAP.get_or_init(CsrMap::build)
}

// ═══════════════════════════════════════════════════════════════════════════
// Storage
// ═══════════════════════════════════════════════════════════════════════════

/// Backing storage for every CSR, one slot per table entry.
///
/// `get`/`set` are raw: no masks, no side effects. The architectural
/// accessors live on `CpuState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrFile {
    values: Vec<u64>,
}

impl Default for CsrFile {
    fn default() -> Self {
        Self::new()
    }
}

impl CsrFile {
    pub fn new() -> Self {
        Self {
            values: vec![0; CSR_TABLE.len()],
        }
    }

    #[inline]
    pub fn get(&self, id: CsrId) -> u64 {
        match csr_map().slot(id.raw()) {
            Ok(slot) => self.values[slot],
            Err(_) => 0,
        }
    }

    #[inline]
    pub fn set(&mut self, id: CsrId, value: u64) {
        if let Ok(slot) = csr_map().slot(id.raw()) {
            self.values[slot] = value;
        }
    }

    pub fn update(&mut self, id: CsrId, f: impl FnOnce(u64) -> u64) {
        let value = f(self.get(id));
        self.set(id, value);
    }

    /// (id, value) pairs in table order.
    pub fn iter(&self) -> impl Iterator<Item = (CsrId, u64)> + '_ {
        CSR_TABLE.iter().map(|d| d.id).zip(self.values.iter().copied())
    }

    /// Rebuild from (raw id, value) pairs. Every enumerated CSR must appear.
    pub fn from_pairs(pairs: &[(u16, u64)]) -> CoreResult<Self> {
        let mut file = Self::new();
        let mut seen = vec![false; CSR_TABLE.len()];
        for &(raw, value) in pairs {
            let slot = csr_map().slot(raw)?;
            file.values[slot] = value;
            seen[slot] = true;
        }
        if let Some(missing) = seen.iter().position(|s| !s) {
            return Err(CoreError::Snapshot(format!(
                "CSR {} missing from saved state",
                CSR_TABLE[missing].id.name()
            )));
        }
        Ok(file)
    }

    pub fn crmd_plv(&self) -> u8 {
        (self.get(CsrId::Crmd) & CRMD_PLV) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_every_id_has_a_slot() {
        let map = csr_map();
        assert_eq!(map.len(), CsrId::ALL.len());
        let mut seen = HashSet::new();
        for &id in CsrId::ALL {
            let slot = map.slot(id.raw()).unwrap();
            assert!(seen.insert(slot), "{} shares a slot", id.name());
            assert_eq!(CSR_TABLE[slot].id, id);
            assert_eq!(CsrId::from_raw(id.raw()), Some(id));
        }
    }

    #[test]
    fn test_unknown_raw_id() {
        assert_eq!(CsrId::from_raw(0x9), None);
        assert!(matches!(csr_map().slot(0x9), Err(CoreError::UnknownCsr(0x9))));
        assert!(matches!(
            csr_map().slot(0x3fff),
            Err(CoreError::UnknownCsr(0x3fff))
        ));
    }

    #[test]
    fn test_mode_registers_end_blocks() {
        for id in [CsrId::Crmd, CsrId::Euen, CsrId::Asid, CsrId::Impctl2, CsrId::Tcfg] {
            assert!(id.desc().unwrap().ends_block(), "{}", id.name());
        }
        assert!(!CsrId::Save0.desc().unwrap().ends_block());
    }

    #[test]
    fn test_csr_file_pairs() {
        let mut file = CsrFile::new();
        file.set(CsrId::Save3, 0x1234);
        let pairs: Vec<_> = file.iter().map(|(id, v)| (id.raw(), v)).collect();
        let restored = CsrFile::from_pairs(&pairs).unwrap();
        assert_eq!(restored, file);

        assert!(CsrFile::from_pairs(&pairs[1..]).is_err());
    }
}
