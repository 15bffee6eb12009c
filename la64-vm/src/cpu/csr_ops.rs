//! CSR read / write / exchange with side effects.

use super::CpuState;
use super::csr::*;
use crate::error::{CoreError, CoreResult};

impl CpuState {
    /// Read a CSR by architectural number.
    pub fn csr_read_raw(&mut self, raw: u16) -> CoreResult<u64> {
        self.csr_read(resolve(raw)?)
    }

    pub fn csr_write_raw(&mut self, raw: u16, value: u64) -> CoreResult<u64> {
        self.csr_write(resolve(raw)?, value)
    }

    pub fn csr_xchg_raw(&mut self, raw: u16, value: u64, mask: u64) -> CoreResult<u64> {
        self.csr_xchg(resolve(raw)?, value, mask)
    }

    /// CSRRD: current value, computed on demand for live registers.
    pub fn csr_read(&mut self, id: CsrId) -> CoreResult<u64> {
        let desc = id.desc()?;
        let value = self.csr_value(desc);
        self.compute_hflags();
        Ok(value)
    }

    /// CSRWR: store `value` under the write mask, run side effects, return
    /// the previous value.
    pub fn csr_write(&mut self, id: CsrId, value: u64) -> CoreResult<u64> {
        self.csr_xchg(id, value, u64::MAX)
    }

    /// CSRXCHG: replace only the bits selected by `mask`.
    pub fn csr_xchg(&mut self, id: CsrId, value: u64, mask: u64) -> CoreResult<u64> {
        let desc = id.desc()?;
        let old = self.csr_value(desc);
        let new = (old & !mask) | (value & mask);
        self.csr_apply(desc, new);
        self.compute_hflags();
        Ok(old)
    }

    fn csr_value(&self, desc: &CsrDesc) -> u64 {
        let stored = self.csr.get(desc.id);
        match desc.effect {
            CsrEffect::Asid => (stored & ASID_MASK) | (ASID_BITS << ASIDBITS_SHIFT),
            CsrEffect::Tval => self.timer.remaining(self.stable_counter()),
            CsrEffect::Pgd => {
                let badv = if self.csr.get(CsrId::Tlbrera) & TLBRERA_ISTLBR != 0 {
                    self.csr.get(CsrId::Tlbrbadv)
                } else {
                    self.csr.get(CsrId::Badv)
                };
                if badv >> 63 != 0 {
                    self.csr.get(CsrId::Pgdh)
                } else {
                    self.csr.get(CsrId::Pgdl)
                }
            }
            _ => stored,
        }
    }

    fn csr_apply(&mut self, desc: &CsrDesc, new: u64) {
        let id = desc.id;
        let stored = self.csr.get(id);
        let merged = (stored & !desc.write_mask) | (new & desc.write_mask);

        match desc.effect {
            CsrEffect::None | CsrEffect::Estat => self.csr.set(id, merged),
            CsrEffect::ReadOnly | CsrEffect::Pgd | CsrEffect::Tval => {
                if new != stored {
                    log::warn!("[CSR] Write to read-only {} ignored", id.name());
                }
            }
            CsrEffect::Asid => {
                self.csr.set(id, merged);
                if (merged ^ stored) & ASID_MASK != 0 {
                    log::debug!(
                        "[CSR] ASID {:#x} -> {:#x}, flushing TLB",
                        stored & ASID_MASK,
                        merged & ASID_MASK
                    );
                    self.tlb.flush_all();
                    self.request_tb_flush();
                }
            }
            CsrEffect::Tcfg => {
                self.csr.set(id, merged);
                let now = self.stable_counter();
                self.timer.configure(merged, now);
            }
            CsrEffect::Ticlr => {
                if new & TICLR_CLR != 0 {
                    self.set_irq(IRQ_TIMER, false);
                }
            }
            CsrEffect::Llbctl => {
                self.csr.set(id, merged);
                if new & LLBCTL_WCLLB != 0 {
                    self.set_llbit(false);
                }
            }
            CsrEffect::Impctl2 => {
                if new & IMPCTL2_INV_PWC != 0 {
                    log::debug!("[CSR] IMPCTL2: flushing VTLB");
                    self.tlb.flush_vtlb();
                    self.request_tb_flush();
                }
                if new & IMPCTL2_INV_PTB != 0 {
                    log::debug!("[CSR] IMPCTL2: flushing FTLB");
                    self.tlb.flush_ftlb();
                    self.request_tb_flush();
                }
            }
            CsrEffect::Wired => {
                let limit = (self.tlb.vtlb_len() - 1) as u64;
                self.csr.set(id, merged.min(limit));
            }
        }
    }
}

fn resolve(raw: u16) -> CoreResult<CsrId> {
    CsrId::from_raw(raw).ok_or_else(|| {
        log::error!("[CSR] Access to unknown CSR {:#x}", raw);
        CoreError::UnknownCsr(raw)
    })
}
