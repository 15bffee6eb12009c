//! Exception causes, exception events and the mode-flag cache.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Every guest-visible exception kind.
///
/// `ecode()`/`subcode()` give the values written to ESTAT.Ecode/EsubCode and
/// select the vector. TLBR is the only refill-class cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exception {
    /// Interrupt
    Int,
    /// Page invalid for load
    Pil,
    /// Page invalid for store
    Pis,
    /// Page invalid for fetch
    Pif,
    /// Page modification (store to clean page)
    Pme,
    /// Page non-readable
    Pnr,
    /// Page non-executable
    Pnx,
    /// Page privilege illegal
    Ppi,
    /// Address error on fetch
    Adef,
    /// Address error on memory access
    Adem,
    /// Address alignment
    Ale,
    /// Bound check
    Bce,
    Sys,
    Brk,
    /// Instruction not exist
    Ine,
    /// Instruction privilege error
    Ipe,
    /// Floating point disabled
    Fpd,
    /// 128-bit vector disabled
    Sxd,
    /// 256-bit vector disabled
    Asxd,
    /// Floating point exception
    Fpe,
    /// TLB refill
    Tlbr,
}

pub const ECODE_TLBR: u32 = 0x3f;

impl Exception {
    pub const fn ecode(self) -> u32 {
        match self {
            Exception::Int => 0x0,
            Exception::Pil => 0x1,
            Exception::Pis => 0x2,
            Exception::Pif => 0x3,
            Exception::Pme => 0x4,
            Exception::Pnr => 0x5,
            Exception::Pnx => 0x6,
            Exception::Ppi => 0x7,
            Exception::Adef | Exception::Adem => 0x8,
            Exception::Ale => 0x9,
            Exception::Bce => 0xa,
            Exception::Sys => 0xb,
            Exception::Brk => 0xc,
            Exception::Ine => 0xd,
            Exception::Ipe => 0xe,
            Exception::Fpd => 0xf,
            Exception::Sxd => 0x10,
            Exception::Asxd => 0x11,
            Exception::Fpe => 0x12,
            Exception::Tlbr => ECODE_TLBR,
        }
    }

    pub const fn subcode(self) -> u32 {
        match self {
            Exception::Adem => 1,
            _ => 0,
        }
    }

    /// Inverse of `ecode()`/`subcode()`. `None` for values no exception uses.
    pub const fn from_code(ecode: u32, subcode: u32) -> Option<Exception> {
        let exc = match (ecode, subcode) {
            (0x0, 0) => Exception::Int,
            (0x1, 0) => Exception::Pil,
            (0x2, 0) => Exception::Pis,
            (0x3, 0) => Exception::Pif,
            (0x4, 0) => Exception::Pme,
            (0x5, 0) => Exception::Pnr,
            (0x6, 0) => Exception::Pnx,
            (0x7, 0) => Exception::Ppi,
            (0x8, 0) => Exception::Adef,
            (0x8, 1) => Exception::Adem,
            (0x9, 0) => Exception::Ale,
            (0xa, 0) => Exception::Bce,
            (0xb, 0) => Exception::Sys,
            (0xc, 0) => Exception::Brk,
            (0xd, 0) => Exception::Ine,
            (0xe, 0) => Exception::Ipe,
            (0xf, 0) => Exception::Fpd,
            (0x10, 0) => Exception::Sxd,
            (0x11, 0) => Exception::Asxd,
            (0x12, 0) => Exception::Fpe,
            (ECODE_TLBR, 0) => Exception::Tlbr,
            _ => return None,
        };
        Some(exc)
    }

    /// Refill-class causes go through TLBRENTRY and the TLBR* shadow CSRs.
    pub const fn is_refill(self) -> bool {
        matches!(self, Exception::Tlbr)
    }

    /// Causes that report a faulting virtual address and update the TLB
    /// entry-hi shadow with its VPPN.
    pub const fn is_tlb_fault(self) -> bool {
        matches!(
            self,
            Exception::Tlbr
                | Exception::Pil
                | Exception::Pis
                | Exception::Pif
                | Exception::Pme
                | Exception::Pnr
                | Exception::Pnx
                | Exception::Ppi
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            Exception::Int => "INT",
            Exception::Pil => "PIL",
            Exception::Pis => "PIS",
            Exception::Pif => "PIF",
            Exception::Pme => "PME",
            Exception::Pnr => "PNR",
            Exception::Pnx => "PNX",
            Exception::Ppi => "PPI",
            Exception::Adef => "ADEF",
            Exception::Adem => "ADEM",
            Exception::Ale => "ALE",
            Exception::Bce => "BCE",
            Exception::Sys => "SYS",
            Exception::Brk => "BRK",
            Exception::Ine => "INE",
            Exception::Ipe => "IPE",
            Exception::Fpd => "FPD",
            Exception::Sxd => "SXD",
            Exception::Asxd => "ASXD",
            Exception::Fpe => "FPE",
            Exception::Tlbr => "TLBR",
        }
    }
}

/// A detected exception or interrupt, consumed by the dispatcher in the same
/// step it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionEvent {
    pub cause: Exception,
    /// Faulting virtual address, when the cause has one.
    pub badvaddr: Option<u64>,
    /// Refill class (dedicated vector and shadow CSRs).
    pub refill: bool,
    /// Raised by an interrupt rather than by the executing instruction.
    pub asynchronous: bool,
    /// PC of the instruction that faulted, or the resume PC for interrupts.
    pub pc: u64,
}

impl ExceptionEvent {
    /// Synchronous exception without an address.
    pub fn new(cause: Exception, pc: u64) -> Self {
        Self {
            cause,
            badvaddr: None,
            refill: cause.is_refill(),
            asynchronous: false,
            pc,
        }
    }

    /// Synchronous exception carrying the faulting address.
    pub fn with_address(cause: Exception, pc: u64, badvaddr: u64) -> Self {
        Self {
            badvaddr: Some(badvaddr),
            ..Self::new(cause, pc)
        }
    }

    pub fn interrupt(pc: u64) -> Self {
        Self {
            cause: Exception::Int,
            badvaddr: None,
            refill: false,
            asynchronous: true,
            pc,
        }
    }
}

bitflags! {
    /// Mode-flag cache.
    ///
    /// Derived from CRMD, EUEN and MISC. Translation blocks are keyed by the
    /// cacheable part of these bits, so a stale value would run code
    /// translated for the wrong privilege or feature set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct HFlags: u32 {
        const PLV_MASK = 0b11;
        const PLV_USER = 0b11;
        /// Paging enabled (CRMD.PG)
        const PG     = 1 << 2;
        /// Floating point enabled (EUEN.FPE)
        const FPE    = 1 << 3;
        /// LSX enabled (EUEN.SXE)
        const SXE    = 1 << 4;
        /// LASX enabled (EUEN.ASXE)
        const ASXE   = 1 << 5;
        /// 64-bit addressing and 64-bit-only instructions available
        const MODE64 = 1 << 6;
        /// Bits that affect how code is translated
        const TB_MASK = Self::PLV_MASK.bits() | Self::PG.bits() | Self::FPE.bits()
            | Self::SXE.bits() | Self::ASXE.bits() | Self::MODE64.bits();
    }
}

impl HFlags {
    pub fn plv(self) -> u8 {
        (self.bits() & Self::PLV_MASK.bits()) as u8
    }

    pub fn with_plv(self, plv: u8) -> Self {
        Self::from_bits_retain((self.bits() & !Self::PLV_MASK.bits()) | (plv as u32 & 3))
    }

    /// Key component for the translation-block cache.
    pub fn tb_flags(self) -> u32 {
        (self & Self::TB_MASK).bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Exception; 21] = [
        Exception::Int,
        Exception::Pil,
        Exception::Pis,
        Exception::Pif,
        Exception::Pme,
        Exception::Pnr,
        Exception::Pnx,
        Exception::Ppi,
        Exception::Adef,
        Exception::Adem,
        Exception::Ale,
        Exception::Bce,
        Exception::Sys,
        Exception::Brk,
        Exception::Ine,
        Exception::Ipe,
        Exception::Fpd,
        Exception::Sxd,
        Exception::Asxd,
        Exception::Fpe,
        Exception::Tlbr,
    ];

    #[test]
    fn test_exception_codes_are_invertible() {
        for exc in ALL {
            assert_eq!(Exception::from_code(exc.ecode(), exc.subcode()), Some(exc));
        }
        assert_eq!(Exception::from_code(0x13, 0), None);
        assert_eq!(Exception::from_code(0x8, 2), None);
    }

    #[test]
    fn test_only_tlbr_is_refill() {
        for exc in ALL {
            assert_eq!(exc.is_refill(), exc == Exception::Tlbr);
        }
        assert!(ExceptionEvent::new(Exception::Tlbr, 0).refill);
        assert!(!ExceptionEvent::new(Exception::Pil, 0).refill);
    }

    #[test]
    fn test_hflags_plv() {
        let flags = HFlags::PG | HFlags::MODE64;
        let user = flags.with_plv(3);
        assert_eq!(user.plv(), 3);
        assert!(user.contains(HFlags::PG));
        assert_eq!(user.with_plv(0).plv(), 0);
        assert_eq!(user.tb_flags(), user.bits());
    }
}
