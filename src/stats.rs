use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide counters, updated lock-free from every thread.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub blocks_compiled: AtomicU64,
    pub blocks_executed: AtomicU64,
    pub instructions_interpreted: AtomicU64,
    pub block_cache_hits: AtomicU64,
    pub block_cache_misses: AtomicU64,
    pub interpreter_fallbacks: AtomicU64,
    pub guest_syscalls: AtomicU64,
    pub smc_invalidations: AtomicU64,
}

impl EngineStats {
    pub fn summary(&self) -> String {
        format!(
            "blocks compiled={} executed={} cache hit/miss={}/{} interpreted={} fallbacks={} syscalls={} smc={}",
            self.blocks_compiled.load(Ordering::Relaxed),
            self.blocks_executed.load(Ordering::Relaxed),
            self.block_cache_hits.load(Ordering::Relaxed),
            self.block_cache_misses.load(Ordering::Relaxed),
            self.instructions_interpreted.load(Ordering::Relaxed),
            self.interpreter_fallbacks.load(Ordering::Relaxed),
            self.guest_syscalls.load(Ordering::Relaxed),
            self.smc_invalidations.load(Ordering::Relaxed),
        )
    }
}
