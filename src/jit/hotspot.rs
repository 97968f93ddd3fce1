//! Hot-block detection and tier promotion.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use super::block::{CompiledBlock, Tier};
use super::compiler::BlockCompiler;
use crate::memory::MemoryWindow;
use crate::pool::CompilerPool;

/// Executions of a baseline block before an optimizing recompile is
/// scheduled. Policy, not contract; the only requirement is that promotion
/// is monotonic (demotion never happens).
pub const PROMOTE_EXEC_THRESHOLD: u32 = 512;

pub struct HotspotPromoter {
    compiler: Arc<BlockCompiler>,
    window: Arc<MemoryWindow>,
    pool: Arc<CompilerPool>,
    /// Guest addresses with a promotion in flight, so a hot block crossing
    /// the threshold on several executors enqueues once.
    in_flight: Arc<Mutex<FxHashSet<u32>>>,
}

impl HotspotPromoter {
    pub fn new(
        compiler: Arc<BlockCompiler>,
        window: Arc<MemoryWindow>,
        pool: Arc<CompilerPool>,
    ) -> HotspotPromoter {
        HotspotPromoter {
            compiler,
            window,
            pool,
            in_flight: Arc::new(Mutex::new(FxHashSet::default())),
        }
    }

    /// Called by the executor after every block exit. Crossing the
    /// threshold schedules an optimizing recompile on the pool; the publish
    /// step swaps the cache entry and retires the old block.
    pub fn note_execution(&self, block: &CompiledBlock) {
        let count = block.bump_exec_count();
        if block.tier != Tier::Baseline || count < PROMOTE_EXEC_THRESHOLD {
            return;
        }
        let guest_pc = block.guest_pc;
        if !self.in_flight.lock().insert(guest_pc) {
            return;
        }
        debug!("block {guest_pc:#x} crossed {PROMOTE_EXEC_THRESHOLD} executions, promoting");

        let compiler = self.compiler.clone();
        let window = self.window.clone();
        let in_flight = self.in_flight.clone();
        self.pool.submit(move || {
            match compiler.compile_promoted(&window, guest_pc) {
                Ok(Some(_)) => debug!("block {guest_pc:#x} now optimizing tier"),
                // A newer job won the publish race, or the block was
                // invalidated meanwhile; both are fine.
                Ok(None) => {}
                Err(e) => warn!("promotion of {guest_pc:#x} failed: {e}"),
            }
            in_flight.lock().remove(&guest_pc);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::block_cache::BlockCache;
    use crate::jit::code_cache::CodeCache;
    use crate::memory::WindowConfig;

    fn harness() -> (
        HotspotPromoter,
        Arc<BlockCompiler>,
        Arc<BlockCache>,
        Arc<MemoryWindow>,
    ) {
        let window = Arc::new(
            MemoryWindow::new(WindowConfig {
                candidate_sizes: vec![16 * 1024 * 1024],
                mlock_bytes: 0,
            })
            .unwrap(),
        );
        let code = Arc::new(CodeCache::new(1024 * 1024).unwrap());
        let blocks = Arc::new(BlockCache::new());
        let compiler = Arc::new(BlockCompiler::new(code, blocks.clone()));
        let pool = Arc::new(CompilerPool::new(2, Arc::new(|| {})));
        (
            HotspotPromoter::new(compiler.clone(), window.clone(), pool),
            compiler,
            blocks,
            window,
        )
    }

    fn seed_block(window: &MemoryWindow, blocks: &BlockCache, compiler: &BlockCompiler, pc: u32) {
        // addi r1, r1, 16 ; blr
        window.write_u32_be(pc, 0x3821_0010).unwrap();
        window.write_u32_be(pc + 4, 0x4E80_0020).unwrap();
        compiler.compile_baseline(window, pc).unwrap();
        assert_eq!(blocks.lookup(pc).unwrap().tier, Tier::Baseline);
    }

    #[test]
    fn promotion_happens_exactly_at_the_threshold() {
        let (promoter, compiler, blocks, window) = harness();
        seed_block(&window, &blocks, &compiler, 0x1_0000);
        let block = blocks.lookup(0x1_0000).unwrap();
        // threshold - 1 executions: still baseline, nothing queued.
        for _ in 0..PROMOTE_EXEC_THRESHOLD - 1 {
            promoter.note_execution(&block);
        }
        assert_eq!(blocks.lookup(0x1_0000).unwrap().tier, Tier::Baseline);

        // One more crosses the threshold; the optimizing block replaces
        // the entry once the pool gets to it.
        promoter.note_execution(&block);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if blocks.lookup(0x1_0000).unwrap().tier == Tier::Optimizing {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "promotion never landed");
            std::thread::yield_now();
        }
    }

    #[test]
    fn optimized_blocks_are_not_promoted_again() {
        let (promoter, compiler, blocks, window) = harness();
        seed_block(&window, &blocks, &compiler, 0x2_0000);
        let block = blocks.lookup(0x2_0000).unwrap();
        for _ in 0..PROMOTE_EXEC_THRESHOLD * 2 {
            promoter.note_execution(&block);
        }
        // Drive the replacement block well past the threshold too; its
        // tier must stay Optimizing and nothing panics.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while blocks.lookup(0x2_0000).unwrap().tier != Tier::Optimizing {
            assert!(std::time::Instant::now() < deadline);
            std::thread::yield_now();
        }
        let optimized = blocks.lookup(0x2_0000).unwrap();
        for _ in 0..PROMOTE_EXEC_THRESHOLD * 2 {
            promoter.note_execution(&optimized);
        }
        assert_eq!(blocks.lookup(0x2_0000).unwrap().tier, Tier::Optimizing);
    }
}
