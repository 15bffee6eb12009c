//! Exception and interrupt dispatch.
//!
//! ```text
//!   running ──(fault | pending & enabled irq)──▶ trap entry ──▶ handler
//!      ▲                                                         │
//!      └──────────────────────────── ERTN ◀──────────────────────┘
//! ```
//!
//! Trap entry comes in two classes. Refill (TLBR) saves into TLBRPRMD,
//! TLBRERA, TLBRBADV and TLBREHI, switches to direct-address mode and
//! vectors to TLBRENTRY. Every other cause saves into PRMD, ERA, BADV and
//! TLBEHI and vectors to `EENTRY + index * vec_size`. ERTN picks the class to
//! return from by TLBRERA.IsTLBR.

use super::csr::*;
use super::types::{Exception, ExceptionEvent};
use super::CpuState;
use crate::bits::{deposit64, extract64};
use crate::error::{CoreError, CoreResult};

/// First vector index used by interrupts.
pub const INT_VECTOR_BASE: u64 = 64;

const TLBEHI_VPPN_MASK: u64 = !((1u64 << TLBEHI_VPPN_SHIFT) - 1);

impl CpuState {
    /// Vector spacing in bytes: `(1 << ECFG.VS) * 4`, or 0 when VS is 0.
    pub fn vector_size(&self) -> u64 {
        let vs = extract64(self.csr.get(CsrId::Ecfg), ECFG_VS_SHIFT, ECFG_VS_LEN);
        if vs == 0 { 0 } else { (1u64 << vs) * 4 }
    }

    /// Enter the handler for `event`.
    pub fn raise_exception(&mut self, event: ExceptionEvent) -> CoreResult<()> {
        let cause = event.cause;
        let era = event.pc;

        let crmd = self.csr.get(CsrId::Crmd);
        let saved = crmd & (CRMD_PLV | CRMD_IE);
        let we = crmd & CRMD_WE != 0;

        if event.refill {
            if let Some(va) = event.badvaddr {
                self.csr.set(CsrId::Tlbrbadv, va);
                self.csr.update(CsrId::Tlbrehi, |hi| {
                    (hi & !TLBEHI_VPPN_MASK) | (va & TLBEHI_VPPN_MASK)
                });
            }
            self.csr.update(CsrId::Tlbrprmd, |prmd| {
                let prmd = (prmd & !(PRMD_PPLV | PRMD_PIE | TLBRPRMD_PWE)) | saved;
                if we { prmd | TLBRPRMD_PWE } else { prmd }
            });
            self.csr.set(CsrId::Tlbrera, (era & !0x3) | TLBRERA_ISTLBR);
            self.csr.update(CsrId::Crmd, |crmd| {
                (crmd & !(CRMD_PLV | CRMD_IE | CRMD_PG | CRMD_WE)) | CRMD_DA
            });
            self.pc = self.csr.get(CsrId::Tlbrentry);
        } else {
            self.csr.update(CsrId::Estat, |estat| {
                let estat = deposit64(
                    estat,
                    ESTAT_ECODE_SHIFT,
                    ESTAT_ECODE_LEN,
                    cause.ecode() as u64,
                );
                deposit64(
                    estat,
                    ESTAT_ESUBCODE_SHIFT,
                    ESTAT_ESUBCODE_LEN,
                    cause.subcode() as u64,
                )
            });
            if let Some(va) = event.badvaddr {
                self.csr.set(CsrId::Badv, va);
                if cause.is_tlb_fault() {
                    self.csr.update(CsrId::Tlbehi, |hi| {
                        (hi & !TLBEHI_VPPN_MASK) | (va & TLBEHI_VPPN_MASK)
                    });
                }
            }
            if !event.asynchronous && !matches!(cause, Exception::Adef | Exception::Pif) {
                self.csr.set(CsrId::Badi, self.cur_insn as u64);
            }
            self.csr.update(CsrId::Prmd, |prmd| {
                let prmd = (prmd & !(PRMD_PPLV | PRMD_PIE | PRMD_PWE)) | saved;
                if we { prmd | PRMD_PWE } else { prmd }
            });
            self.csr.set(CsrId::Era, era);
            self.csr
                .update(CsrId::Crmd, |crmd| crmd & !(CRMD_PLV | CRMD_IE | CRMD_WE));

            let index = match cause {
                Exception::Int => {
                    let pending = self.pending_interrupts();
                    if pending == 0 {
                        0
                    } else {
                        INT_VECTOR_BASE + (63 - pending.leading_zeros() as u64)
                    }
                }
                _ => cause.ecode() as u64,
            };
            self.pc = self
                .csr
                .get(CsrId::Eentry)
                .wrapping_add(index * self.vector_size());
        }

        self.idle = false;
        self.compute_hflags();
        log::debug!(
            "[EXC] {} at pc={:#x} badv={:?} refill={} -> {:#x}",
            cause.name(),
            event.pc,
            event.badvaddr,
            event.refill,
            self.pc
        );
        Ok(())
    }

    /// Enter a handler from a raw cause code (accelerator exits, tests).
    pub fn raise_code(
        &mut self,
        ecode: u32,
        subcode: u32,
        pc: u64,
        badvaddr: Option<u64>,
    ) -> CoreResult<()> {
        let Some(cause) = Exception::from_code(ecode, subcode) else {
            log::error!("[EXC] Unknown cause ecode={:#x} sub={:#x}", ecode, subcode);
            return Err(CoreError::UnknownException(ecode));
        };
        let event = ExceptionEvent {
            badvaddr,
            ..ExceptionEvent::new(cause, pc)
        };
        self.raise_exception(event)
    }

    /// Take a pending interrupt at the current instruction boundary.
    /// Returns whether one was taken.
    pub fn deliver_interrupt(&mut self) -> CoreResult<bool> {
        if !self.interrupt_deliverable() {
            return Ok(false);
        }
        self.raise_exception(ExceptionEvent::interrupt(self.pc))?;
        Ok(true)
    }

    /// ERTN: restore the mode saved by the matching trap class and resume.
    pub fn ertn(&mut self) {
        let tlbrera = self.csr.get(CsrId::Tlbrera);
        if tlbrera & TLBRERA_ISTLBR != 0 {
            let prmd = self.csr.get(CsrId::Tlbrprmd);
            self.csr.update(CsrId::Crmd, |crmd| {
                let mut crmd = (crmd & !(CRMD_PLV | CRMD_IE | CRMD_WE | CRMD_DA))
                    | (prmd & (PRMD_PPLV | PRMD_PIE))
                    | CRMD_PG;
                if prmd & TLBRPRMD_PWE != 0 {
                    crmd |= CRMD_WE;
                }
                crmd
            });
            self.csr.set(CsrId::Tlbrera, tlbrera & !TLBRERA_ISTLBR);
            self.pc = tlbrera & !0x3;
        } else {
            let prmd = self.csr.get(CsrId::Prmd);
            self.csr.update(CsrId::Crmd, |crmd| {
                let mut crmd =
                    (crmd & !(CRMD_PLV | CRMD_IE | CRMD_WE)) | (prmd & (PRMD_PPLV | PRMD_PIE));
                if prmd & PRMD_PWE != 0 {
                    crmd |= CRMD_WE;
                }
                crmd
            });
            self.pc = self.csr.get(CsrId::Era);
        }

        let llbctl = self.csr.get(CsrId::Llbctl);
        if llbctl & LLBCTL_KLO != 0 {
            self.csr.set(CsrId::Llbctl, llbctl & !LLBCTL_KLO);
        } else {
            self.set_llbit(false);
        }
        self.compute_hflags();
        log::debug!("[EXC] ERTN -> {:#x} plv={}", self.pc, self.plv());
    }
}
