//! Core configuration.
//!
//! Geometry of the TLB pools, address widths, translation limits and the
//! identification words reported through CPUCFG/PRCFG. The CLI loads this
//! from JSON; tests use `CoreConfig::default()`.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};

/// Guest page size used for block termination and code invalidation.
pub const GUEST_PAGE_BITS: u32 = 12;
pub const GUEST_PAGE_SIZE: u64 = 1 << GUEST_PAGE_BITS;
pub const GUEST_PAGE_MASK: u64 = !(GUEST_PAGE_SIZE - 1);

/// Static configuration of one emulated core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Value reported by CSR.CPUID
    pub core_id: u32,

    /// Number of FTLB sets (power of two)
    pub ftlb_sets: usize,

    /// Number of FTLB ways per set
    pub ftlb_ways: usize,

    /// Number of VTLB entries (fully associative)
    pub vtlb_entries: usize,

    /// Physical address width in bits
    pub palen: u32,

    /// Virtual address width in bits
    pub valen: u32,

    /// Maximum guest instructions per translation block
    pub max_block_insns: usize,

    /// Maximum translation blocks kept in the cache
    pub tb_cache_entries: usize,

    /// Record execution events in the trace ring
    pub trace_enabled: bool,

    /// Capacity of the trace ring
    pub trace_capacity: usize,

    /// Processor id reported by CPUCFG word 0
    pub prid: u32,

    /// Stable-counter ticks advanced per retired guest instruction
    pub timer_ticks_per_insn: u64,

    /// PC loaded on reset
    pub reset_pc: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            core_id: 0,
            ftlb_sets: 256,            // 256 sets ...
            ftlb_ways: 8,              // ... of 8 ways = 2048 entries
            vtlb_entries: 64,
            palen: 48,
            valen: 48,
            max_block_insns: 512,
            tb_cache_entries: 4096,
            trace_enabled: false,
            trace_capacity: 1000,
            prid: 0x0014_c010,         // LA464
            timer_ticks_per_insn: 1,
            reset_pc: 0x1c00_0000,
        }
    }
}

impl CoreConfig {
    /// Load a configuration from JSON text. Missing fields keep defaults.
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        let config: CoreConfig =
            serde_json::from_str(text).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject geometry the TLB and translator cannot work with.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.ftlb_sets == 0 || !self.ftlb_sets.is_power_of_two() {
            return Err(CoreError::Config(format!(
                "ftlb_sets must be a non-zero power of two, got {}",
                self.ftlb_sets
            )));
        }
        if self.ftlb_ways == 0 {
            return Err(CoreError::Config("ftlb_ways must be non-zero".into()));
        }
        if self.vtlb_entries == 0 {
            return Err(CoreError::Config("vtlb_entries must be non-zero".into()));
        }
        if self.total_tlb_entries() > 1 << 16 {
            return Err(CoreError::Config(
                "TLB pools exceed the 16-bit TLBIDX.Index range".into(),
            ));
        }
        if !(32..=64).contains(&self.valen) || !(32..=64).contains(&self.palen) {
            return Err(CoreError::Config(format!(
                "address widths out of range (valen={}, palen={})",
                self.valen, self.palen
            )));
        }
        if self.max_block_insns == 0 {
            return Err(CoreError::Config("max_block_insns must be non-zero".into()));
        }
        Ok(())
    }

    /// Total entries across both pools (size of the TLBIDX index space).
    pub fn total_tlb_entries(&self) -> usize {
        self.ftlb_sets * self.ftlb_ways + self.vtlb_entries
    }

    /// Mask selecting implemented physical address bits.
    pub fn phys_mask(&self) -> u64 {
        crate::bits::mask64(self.palen)
    }

    /// Mask selecting implemented virtual address bits.
    pub fn virt_mask(&self) -> u64 {
        crate::bits::mask64(self.valen)
    }
}
