//! Translation block cache with LRU eviction.
//!
//! Blocks are keyed by (virtual PC, physical PC, mode flags): the same guest
//! code reached through a different mapping or under a different privilege
//! level is a different block. The cache also tracks which physical pages
//! hold translated code so stores into them can invalidate precisely.
//!
//! ## Invalidation
//!
//! - **Full flush**: any TLB flush or mapping change (`CpuState::take_tb_flush`)
//! - **Page**: a store hit a page that backs cached blocks
//! - **Range**: explicit physical range, e.g. after loading a new image

use crate::config::GUEST_PAGE_MASK;
use crate::ir::IrBlock;
use lru::LruCache;
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Cache key. Blocks never cross a guest page, so `phys_pc` alone names the
/// code page a block depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TbKey {
    pub pc: u64,
    pub phys_pc: u64,
    pub flags: u32,
}

impl TbKey {
    pub fn of(block: &IrBlock) -> Self {
        Self {
            pc: block.pc,
            phys_pc: block.phys_pc,
            flags: block.flags,
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Lookup hits
    pub hits: u64,
    /// Lookup misses
    pub misses: u64,
    /// Blocks inserted
    pub insertions: u64,
    /// Blocks dropped by LRU pressure
    pub evictions: u64,
    /// Blocks dropped by page/range invalidation
    pub invalidations: u64,
    /// Full flushes
    pub flushes: u64,
    /// Guest instructions retired from cached blocks
    pub executed_insns: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct TbCache {
    blocks: LruCache<TbKey, Arc<IrBlock>>,
    /// Physical code page -> number of cached blocks on it
    code_pages: HashMap<u64, usize>,
    stats: CacheStats,
    /// Bumped on every full flush
    pub generation: u32,
}

impl TbCache {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            blocks: LruCache::new(cap),
            code_pages: HashMap::new(),
            stats: CacheStats::default(),
            generation: 0,
        }
    }

    /// Look up a block (updates LRU order).
    pub fn get(&mut self, key: &TbKey) -> Option<Arc<IrBlock>> {
        match self.blocks.get(key) {
            Some(block) => {
                self.stats.hits += 1;
                Some(Arc::clone(block))
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Insert a block, evicting the least recently used one when full.
    pub fn insert(&mut self, block: IrBlock) -> Arc<IrBlock> {
        let key = TbKey::of(&block);
        let block = Arc::new(block);
        self.add_page(key.phys_pc);
        if let Some((old_key, _)) = self.blocks.push(key, Arc::clone(&block)) {
            if old_key != key {
                self.stats.evictions += 1;
                log::trace!("[TB] Evicted block {:#x}", old_key.pc);
            }
            self.remove_page(old_key.phys_pc);
        }
        self.stats.insertions += 1;
        block
    }

    fn add_page(&mut self, phys_pc: u64) {
        *self.code_pages.entry(phys_pc & GUEST_PAGE_MASK).or_insert(0) += 1;
    }

    fn remove_page(&mut self, phys_pc: u64) {
        let page = phys_pc & GUEST_PAGE_MASK;
        if let Some(count) = self.code_pages.get_mut(&page) {
            *count -= 1;
            if *count == 0 {
                self.code_pages.remove(&page);
            }
        }
    }

    /// Whether any cached block was translated from the page holding `paddr`.
    pub fn is_code_page(&self, paddr: u64) -> bool {
        self.code_pages.contains_key(&(paddr & GUEST_PAGE_MASK))
    }

    pub fn invalidate(&mut self, key: &TbKey) -> bool {
        match self.blocks.pop(key) {
            Some(_) => {
                self.remove_page(key.phys_pc);
                self.stats.invalidations += 1;
                true
            }
            None => false,
        }
    }

    /// Drop every block whose code overlaps the physical range `[start, end)`.
    pub fn invalidate_range(&mut self, start: u64, end: u64) -> usize {
        let doomed: Vec<TbKey> = self
            .blocks
            .iter()
            .filter(|(key, block)| {
                let block_end = key.phys_pc.wrapping_add(block.byte_len().max(4));
                key.phys_pc < end && block_end > start
            })
            .map(|(key, _)| *key)
            .collect();
        for key in &doomed {
            self.invalidate(key);
        }
        if !doomed.is_empty() {
            log::debug!(
                "[TB] Invalidated {} blocks in {:#x}..{:#x}",
                doomed.len(),
                start,
                end
            );
        }
        doomed.len()
    }

    /// Drop every block on the guest page holding `paddr`.
    pub fn invalidate_page(&mut self, paddr: u64) -> usize {
        let start = paddr & GUEST_PAGE_MASK;
        self.invalidate_range(start, start + crate::config::GUEST_PAGE_SIZE)
    }

    pub fn flush(&mut self) {
        let count = self.blocks.len();
        self.blocks.clear();
        self.code_pages.clear();
        self.generation = self.generation.wrapping_add(1);
        self.stats.flushes += 1;
        if count > 0 {
            log::debug!("[TB] Flushed {} blocks (generation {})", count, self.generation);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Statistics
    // ═══════════════════════════════════════════════════════════════════════

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn record_executed(&mut self, insns: u32) {
        self.stats.executed_insns += insns as u64;
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
