//! The concurrent guest-address → compiled-block map, with conservative
//! range invalidation for self-modifying code and epoch-based retirement.
//!
//! Executors publish an "executing at epoch E" marker in a per-executor
//! slot for the duration of one block. Retirement (tier promotion, range
//! invalidation) moves blocks out of the map immediately — no new entry is
//! possible — and a drain waits for every marker to move past the
//! retirement epoch before the code arena is reset underneath them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use super::block::{CompiledBlock, Tier};
use super::code_cache::CodeCache;

/// Guest page granularity of the invalidation index.
const PAGE_SHIFT: u32 = 12;
/// Upper bound on a block's guest span, for the invalidation look-back.
pub const MAX_BLOCK_GUEST_BYTES: u32 = super::compiler::MAX_BLOCK_INSTRUCTIONS * 4;

/// One executor's hazard slot: the epoch it entered its current block at,
/// or `IDLE`.
pub struct ExecutorSlot {
    active_epoch: AtomicU64,
}

const IDLE: u64 = u64::MAX;

impl ExecutorSlot {
    fn new() -> Self {
        ExecutorSlot {
            active_epoch: AtomicU64::new(IDLE),
        }
    }
}

/// Scoped "currently executing" marker. Dropping it withdraws the marker.
pub struct ExecutionGuard<'a> {
    slot: &'a ExecutorSlot,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.slot.active_epoch.store(IDLE, Ordering::Release);
    }
}

pub struct BlockCache {
    map: RwLock<FxHashMap<u32, Arc<CompiledBlock>>>,
    /// Guest page -> guest addresses of blocks starting in that page. May
    /// overestimate membership; never underestimates.
    page_index: Mutex<FxHashMap<u32, Vec<u32>>>,
    retired: Mutex<Vec<(u64, Arc<CompiledBlock>)>>,
    epoch: AtomicU64,
    executors: Mutex<Vec<Arc<ExecutorSlot>>>,
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockCache {
    pub fn new() -> BlockCache {
        BlockCache {
            map: RwLock::new(FxHashMap::default()),
            page_index: Mutex::new(FxHashMap::default()),
            retired: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(1),
            executors: Mutex::new(Vec::new()),
        }
    }

    /// Registers an executor thread and returns its hazard slot.
    pub fn register_executor(&self) -> Arc<ExecutorSlot> {
        let slot = Arc::new(ExecutorSlot::new());
        self.executors.lock().push(slot.clone());
        slot
    }

    /// Publishes the executing marker for one block entry.
    pub fn begin_execution<'a>(&self, slot: &'a ExecutorSlot) -> ExecutionGuard<'a> {
        let epoch = self.epoch.load(Ordering::Acquire);
        slot.active_epoch.store(epoch, Ordering::Release);
        ExecutionGuard { slot }
    }

    pub fn lookup(&self, guest_pc: u32) -> Option<Arc<CompiledBlock>> {
        self.map.read().get(&guest_pc).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Publishes a freshly compiled block. Insertion is visible to other
    /// executors immediately.
    pub fn insert(&self, block: CompiledBlock) -> Arc<CompiledBlock> {
        let block = Arc::new(block);
        let guest_pc = block.guest_pc;
        let previous = self.map.write().insert(guest_pc, block.clone());
        if let Some(previous) = previous {
            self.retire(previous);
        }
        self.page_index
            .lock()
            .entry(guest_pc >> PAGE_SHIFT)
            .or_default()
            .push(guest_pc);
        self.collect_retired();
        block
    }

    /// Atomically replaces the entry for `guest_pc` with a higher-tier
    /// block. Re-submitted promotion jobs are harmless: the swap only
    /// happens while the published block is still below the new tier.
    pub fn replace_with_tier(&self, block: CompiledBlock) -> Option<Arc<CompiledBlock>> {
        let guest_pc = block.guest_pc;
        let tier = block.tier;
        let mut map = self.map.write();
        match map.get(&guest_pc) {
            Some(current) if current.tier >= tier => {
                debug!(
                    "promotion for {guest_pc:#x} superseded (already {:?})",
                    current.tier
                );
                None
            }
            _ => {
                let block = Arc::new(block);
                let previous = map.insert(guest_pc, block.clone());
                drop(map);
                if let Some(previous) = previous {
                    self.retire(previous);
                }
                Some(block)
            }
        }
    }

    /// Removes every block whose guest range overlaps `[start, start+len)`.
    /// The page index bounds the candidate set; additional same-page blocks
    /// may be dropped, which is permitted (conservative, never under-
    /// invalidating).
    pub fn invalidate_range(&self, start: u32, len: u32) -> usize {
        let end = start.saturating_add(len);
        let first_page = start.saturating_sub(MAX_BLOCK_GUEST_BYTES) >> PAGE_SHIFT;
        let last_page = end.saturating_sub(1) >> PAGE_SHIFT;

        let mut candidates = Vec::new();
        {
            let mut index = self.page_index.lock();
            for page in first_page..=last_page {
                if let Some(addrs) = index.get_mut(&page) {
                    candidates.append(addrs);
                }
            }
        }

        let mut removed = 0;
        if !candidates.is_empty() {
            let mut map = self.map.write();
            let mut index = self.page_index.lock();
            for addr in candidates {
                let Some(block) = map.get(&addr) else {
                    continue;
                };
                let range = block.guest_range();
                if range.start < end && start < range.end {
                    let block = map.remove(&addr).unwrap();
                    self.retire(block);
                    removed += 1;
                } else {
                    // Keep it indexed; it merely shares a page.
                    index.entry(addr >> PAGE_SHIFT).or_default().push(addr);
                }
            }
        }
        if removed > 0 {
            debug!("invalidated {removed} blocks in [{start:#x}, {end:#x})");
        }
        self.collect_retired();
        removed
    }

    /// Drains everything: swaps in an empty table, retires every block,
    /// waits out every executor that entered before the drain, then resets
    /// the code arena. After this, all execution paths miss and recompile.
    pub fn clear(&self, code_cache: &CodeCache) {
        let drained: Vec<Arc<CompiledBlock>> = {
            let mut map = self.map.write();
            let old = std::mem::take(&mut *map);
            old.into_values().collect()
        };
        self.page_index.lock().clear();
        let count = drained.len();
        for block in drained {
            self.retire(block);
        }
        let fence_epoch = self.epoch.fetch_add(1, Ordering::AcqRel);
        self.wait_for_drain(fence_epoch);
        self.retired.lock().clear();
        code_cache.reset();
        info!("block cache drained ({count} blocks retired)");
    }

    /// Blocks the caller until no executor is still inside a block entered
    /// at or before `fence_epoch`.
    pub fn wait_for_drain(&self, fence_epoch: u64) {
        loop {
            let executors = self.executors.lock();
            let busy = executors
                .iter()
                .any(|slot| slot.active_epoch.load(Ordering::Acquire) <= fence_epoch);
            drop(executors);
            if !busy {
                return;
            }
            std::thread::yield_now();
        }
    }

    fn retire(&self, block: Arc<CompiledBlock>) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel);
        self.retired.lock().push((epoch, block));
    }

    /// Frees retired metadata once every active executor started after the
    /// retirement epoch.
    fn collect_retired(&self) {
        let min_active = {
            let executors = self.executors.lock();
            executors
                .iter()
                .map(|slot| slot.active_epoch.load(Ordering::Acquire))
                .min()
                .unwrap_or(IDLE)
        };
        self.retired.lock().retain(|(epoch, _)| *epoch >= min_active);
    }

    /// Number of blocks waiting in the retirement queue.
    pub fn retired_len(&self) -> usize {
        self.retired.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::super::block::BlockFlags;
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn block(guest_pc: u32, guest_len: u32, tier: Tier) -> CompiledBlock {
        CompiledBlock {
            guest_pc,
            guest_len,
            host_code: std::ptr::null(),
            host_len: 0,
            tier,
            flags: BlockFlags::HAS_TERMINATOR,
            branch_target: 0,
            exec_count: AtomicU32::new(0),
        }
    }

    #[test]
    fn insert_then_lookup() {
        let cache = BlockCache::new();
        cache.insert(block(0x1_0000, 8, Tier::Baseline));
        assert!(cache.lookup(0x1_0000).is_some());
        assert!(cache.lookup(0x1_0004).is_none());
    }

    #[test]
    fn invalidation_covers_any_byte_of_the_span() {
        let cache = BlockCache::new();
        cache.insert(block(0x3_0000, 16, Tier::Baseline));
        // A write to the last byte of the span kills the block.
        assert_eq!(cache.invalidate_range(0x3_000F, 1), 1);
        assert!(cache.lookup(0x3_0000).is_none());
    }

    #[test]
    fn invalidation_reaches_blocks_starting_before_the_written_page() {
        let cache = BlockCache::new();
        // Block starts just under a page boundary and spans across it.
        cache.insert(block(0x0FFC, 16, Tier::Baseline));
        assert_eq!(cache.invalidate_range(0x1004, 4), 1);
        assert!(cache.lookup(0x0FFC).is_none());
    }

    #[test]
    fn invalidation_leaves_non_overlapping_blocks() {
        let cache = BlockCache::new();
        cache.insert(block(0x1_0000, 8, Tier::Baseline));
        cache.insert(block(0x1_0100, 8, Tier::Baseline));
        assert_eq!(cache.invalidate_range(0x1_0000, 8), 1);
        assert!(cache.lookup(0x1_0000).is_none());
        // Same page, no overlap: allowed to survive, and it does here.
        assert!(cache.lookup(0x1_0100).is_some());
        // And it must still be invalidatable through the re-indexed entry.
        assert_eq!(cache.invalidate_range(0x1_0100, 1), 1);
        assert!(cache.lookup(0x1_0100).is_none());
    }

    #[test]
    fn tier_replace_is_idempotent() {
        let cache = BlockCache::new();
        cache.insert(block(0x2_0000, 8, Tier::Baseline));
        assert!(cache
            .replace_with_tier(block(0x2_0000, 8, Tier::Optimizing))
            .is_some());
        // A duplicate promotion job publishes nothing.
        assert!(cache
            .replace_with_tier(block(0x2_0000, 8, Tier::Optimizing))
            .is_none());
        assert_eq!(cache.lookup(0x2_0000).unwrap().tier, Tier::Optimizing);
    }

    #[test]
    fn promotion_retires_the_old_block_until_drain() {
        let cache = BlockCache::new();
        cache.insert(block(0x2_0000, 8, Tier::Baseline));
        let old = cache.lookup(0x2_0000).unwrap();
        let slot = cache.register_executor();
        let guard = cache.begin_execution(&slot);
        cache.replace_with_tier(block(0x2_0000, 8, Tier::Optimizing));
        // The executor that entered before the promotion pins the retired
        // metadata.
        assert!(cache.retired_len() >= 1);
        drop(guard);
        cache.insert(block(0x9_0000, 4, Tier::Baseline));
        assert_eq!(cache.retired_len(), 0);
        drop(old);
    }

    #[test]
    fn clear_empties_map_and_resets_code_cache() {
        let cache = BlockCache::new();
        let code = CodeCache::new(64 * 1024).unwrap();
        code.alloc(&[0; 16]).unwrap();
        cache.insert(block(0x1_0000, 8, Tier::Baseline));
        cache.insert(block(0x2_0000, 8, Tier::Baseline));
        cache.clear(&code);
        assert!(cache.is_empty());
        assert_eq!(code.used_bytes(), 0);
        assert_eq!(cache.retired_len(), 0);
    }

    #[test]
    fn concurrent_lookups_during_insertion() {
        let cache = Arc::new(BlockCache::new());
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..256u32 {
                    let addr = (t << 20) | (i << 4);
                    cache.insert(block(addr, 8, Tier::Baseline));
                    assert!(cache.lookup(addr).is_some());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 4 * 256);
    }
}
