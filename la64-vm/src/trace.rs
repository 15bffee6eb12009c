//! Execution trace ring.
//!
//! Records block translation and execution, trap entry, interrupt delivery
//! and cache invalidation. Disabled by default; `CoreConfig::trace_enabled`
//! turns it on.

use crate::cpu::Exception;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    /// A block was translated
    Translate {
        pc: u64,
        phys_pc: u64,
        insns: u32,
        ops: usize,
    },
    /// A block ran to its exit
    Execute {
        pc: u64,
        next_pc: u64,
        insns: u32,
    },
    /// Cache lookup for a block start
    CacheLookup { pc: u64, hit: bool },
    /// Synchronous exception taken
    Exception {
        pc: u64,
        cause: Exception,
        handler: u64,
    },
    /// Interrupt taken at a block boundary
    Interrupt { pc: u64, pending: u64 },
    /// Blocks dropped; `page == None` means a full flush
    Invalidate {
        page: Option<u64>,
        reason: &'static str,
    },
    /// Core entered IDLE
    Idle { pc: u64 },
}

/// Bounded event buffer; the oldest event is dropped when full.
pub struct TraceBuffer {
    events: VecDeque<TraceEvent>,
    capacity: usize,
    enabled: bool,
    /// Events ever pushed, including dropped ones
    sequence: u64,
}

impl TraceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            enabled: false,
            sequence: 0,
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn push(&mut self, event: TraceEvent) {
        if !self.enabled || self.capacity == 0 {
            return;
        }
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
        self.sequence += 1;
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Log the last `count` events at info level.
    pub fn dump_recent(&self, count: usize) {
        let start = self.events.len().saturating_sub(count);
        log::info!("═══ Recent {} trace events ═══", self.events.len() - start);
        for (i, event) in self.events.iter().skip(start).enumerate() {
            log::info!("{}", format_event(i, event));
        }
    }

    pub fn stats(&self) -> TraceStats {
        let mut stats = TraceStats {
            recorded: self.sequence,
            dropped: self.sequence - self.events.len() as u64,
            ..TraceStats::default()
        };
        for event in &self.events {
            match event {
                TraceEvent::Translate { insns, .. } => {
                    stats.translations += 1;
                    stats.translated_insns += *insns as u64;
                }
                TraceEvent::Execute { insns, .. } => {
                    stats.executions += 1;
                    stats.executed_insns += *insns as u64;
                }
                TraceEvent::CacheLookup { hit: true, .. } => stats.cache_hits += 1,
                TraceEvent::CacheLookup { hit: false, .. } => stats.cache_misses += 1,
                TraceEvent::Exception { cause, .. } => {
                    stats.exceptions += 1;
                    if cause.is_refill() {
                        stats.tlb_refills += 1;
                    }
                    *stats.by_cause.entry(cause.name()).or_insert(0) += 1;
                }
                TraceEvent::Interrupt { .. } => stats.interrupts += 1,
                TraceEvent::Invalidate { .. } => stats.invalidations += 1,
                TraceEvent::Idle { .. } => stats.idles += 1,
            }
        }
        stats
    }
}

fn format_event(index: usize, event: &TraceEvent) -> String {
    match event {
        TraceEvent::Translate { pc, phys_pc, insns, ops } => format!(
            "[{:4}] XLATE {:016x} (phys {:016x}) {} insns, {} ops",
            index, pc, phys_pc, insns, ops
        ),
        TraceEvent::Execute { pc, next_pc, insns } => format!(
            "[{:4}] EXEC  {:016x} → {:016x} ({} insns)",
            index, pc, next_pc, insns
        ),
        TraceEvent::CacheLookup { pc, hit } => {
            let status = if *hit { "HIT" } else { "MISS" };
            format!("[{:4}] CACHE {} {:016x}", index, status, pc)
        }
        TraceEvent::Exception { pc, cause, handler } => format!(
            "[{:4}] EXC   {:016x} {} → {:016x}",
            index,
            pc,
            cause.name(),
            handler
        ),
        TraceEvent::Interrupt { pc, pending } => {
            format!("[{:4}] INT   {:016x} pending={:#x}", index, pc, pending)
        }
        TraceEvent::Invalidate { page, reason } => match page {
            Some(addr) => format!("[{:4}] INVALIDATE {:016x} ({})", index, addr, reason),
            None => format!("[{:4}] FLUSH ({})", index, reason),
        },
        TraceEvent::Idle { pc } => format!("[{:4}] IDLE  {:016x}", index, pc),
    }
}

#[derive(Debug, Default, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStats {
    /// Events pushed since the ring was created
    pub recorded: u64,
    /// Events pushed out of the ring by newer ones
    pub dropped: u64,
    pub translations: u64,
    pub translated_insns: u64,
    pub executions: u64,
    pub executed_insns: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub exceptions: u64,
    /// Exceptions taken through TLBRENTRY
    pub tlb_refills: u64,
    pub by_cause: BTreeMap<&'static str, u64>,
    pub interrupts: u64,
    pub invalidations: u64,
    pub idles: u64,
}

impl TraceStats {
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Mean guest instructions per executed block.
    pub fn avg_block_insns(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.executed_insns as f64 / self.executions as f64
        }
    }

    /// Multi-line summary for the CLI.
    pub fn format(&self) -> String {
        let causes: Vec<String> = self
            .by_cause
            .iter()
            .map(|(name, count)| format!("{}={}", name, count))
            .collect();
        let mut out = format!(
            "trace: {} events in window ({} older dropped)\n",
            self.recorded - self.dropped,
            self.dropped
        );
        out += &format!(
            "  blocks: translated {} ({} insns), ran {} at {:.1} insns each\n",
            self.translations,
            self.translated_insns,
            self.executions,
            self.avg_block_insns()
        );
        out += &format!(
            "  lookups: {} found / {} translated fresh ({:.3})\n",
            self.cache_hits,
            self.cache_misses,
            self.cache_hit_ratio()
        );
        out += &format!(
            "  traps: {} ({} TLB refill) [{}], interrupts {}\n",
            self.exceptions,
            self.tlb_refills,
            causes.join(" "),
            self.interrupts
        );
        out += &format!(
            "  flushes/invalidations {}, IDLE entries {}",
            self.invalidations, self.idles
        );
        out
    }
}
