use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

/// Optimization level of a compiled block. The interpreter is "tier 0" and
/// produces no block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Baseline,
    Optimizing,
}

/// Why a block returned to the executor. Emitted code places this value in
/// x0 right before its epilogue; the next guest PC is always published in
/// the state's `next_pc` slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum BlockExit {
    /// Normal control transfer; continue at `next_pc`.
    Continue = 0,
    /// Guest executed `sc`; route to the syscall handler, then continue.
    Syscall = 1,
    /// Guest executed a trap-class instruction.
    Trap = 2,
    /// An instruction the translator cannot lower; `next_pc` holds its
    /// address and the executor steps it on the interpreter path.
    Unhandled = 3,
    /// Guest executed return-from-interrupt.
    ReturnFromInterrupt = 4,
}

impl BlockExit {
    pub fn from_raw(raw: u64) -> Option<BlockExit> {
        Some(match raw {
            0 => BlockExit::Continue,
            1 => BlockExit::Syscall,
            2 => BlockExit::Trap,
            3 => BlockExit::Unhandled,
            4 => BlockExit::ReturnFromInterrupt,
            _ => return None,
        })
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BlockFlags: u32 {
        /// The block ends at a real terminator (not the size cap).
        const HAS_TERMINATOR = 1 << 0;
        /// The terminator's target was known at compile time.
        const KNOWN_TARGET = 1 << 1;
    }
}

/// One compiled block: a linear guest span lowered into the code cache.
///
/// Owned by the block cache; the executor and the promoter only ever hold
/// borrowed references inside an execution guard. The host bytes live in
/// the code cache arena and stay mapped until a drain proves no executor
/// can still be inside them.
#[derive(Debug)]
pub struct CompiledBlock {
    /// Guest address of the first instruction.
    pub guest_pc: u32,
    /// Length of the guest span in bytes.
    pub guest_len: u32,
    /// Entry point inside the code cache.
    pub host_code: *const u32,
    /// Host code size in bytes.
    pub host_len: usize,
    pub tier: Tier,
    pub flags: BlockFlags,
    /// Known branch target, when `KNOWN_TARGET` is set.
    pub branch_target: u32,
    /// Executions recorded by the executor; saturates.
    pub exec_count: AtomicU32,
}

// Blocks are published through the block cache and executed from any
// executor thread; the host pointer targets immutable, never-unmapped
// (until drain) arena bytes.
unsafe impl Send for CompiledBlock {}
unsafe impl Sync for CompiledBlock {}

impl CompiledBlock {
    /// Records one execution and reports the new count.
    pub fn bump_exec_count(&self) -> u32 {
        let prev = self.exec_count.fetch_add(1, Ordering::Relaxed);
        if prev == u32::MAX {
            // Saturate rather than wrap.
            self.exec_count.store(u32::MAX, Ordering::Relaxed);
            return u32::MAX;
        }
        prev + 1
    }

    /// The guest byte range this block was compiled from.
    pub fn guest_range(&self) -> std::ops::Range<u32> {
        self.guest_pc..self.guest_pc.saturating_add(self.guest_len)
    }

    /// Entry point, typed for the executor.
    ///
    /// # Safety
    /// Callable only on an AArch64 host, only while the code cache that owns
    /// the bytes has not been drained past this block's epoch.
    pub unsafe fn entry(&self) -> extern "C" fn(*mut cellvm_isa::PpuState) -> u64 {
        std::mem::transmute(self.host_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_count_saturates() {
        let block = CompiledBlock {
            guest_pc: 0x1_0000,
            guest_len: 8,
            host_code: std::ptr::null(),
            host_len: 0,
            tier: Tier::Baseline,
            flags: BlockFlags::HAS_TERMINATOR,
            branch_target: 0,
            exec_count: AtomicU32::new(u32::MAX - 1),
        };
        assert_eq!(block.bump_exec_count(), u32::MAX);
        assert_eq!(block.bump_exec_count(), u32::MAX);
        assert_eq!(block.bump_exec_count(), u32::MAX);
    }

    #[test]
    fn exit_reason_round_trip() {
        for exit in [
            BlockExit::Continue,
            BlockExit::Syscall,
            BlockExit::Trap,
            BlockExit::Unhandled,
            BlockExit::ReturnFromInterrupt,
        ] {
            assert_eq!(BlockExit::from_raw(exit as u64), Some(exit));
        }
        assert_eq!(BlockExit::from_raw(99), None);
    }

    #[test]
    fn tier_ordering_is_monotonic() {
        assert!(Tier::Baseline < Tier::Optimizing);
    }
}
