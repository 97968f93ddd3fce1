//! The executor: one loop per guest thread.
//!
//! Each iteration runs exactly one compiled block (or one interpreted
//! instruction) and routes its exit. Blocks never run concurrently on the
//! same guest thread; guest pauses happen between blocks, where the stop
//! flag is observed.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cellvm_isa::PpuState;
use log::{debug, trace, warn};
use parking_lot::Mutex;

use super::crash_guard::{self, CrashGuard};
use crate::jit::block::{BlockExit, CompiledBlock};
use crate::jit::block_cache::{BlockCache, ExecutorSlot};
use crate::jit::compiler::BlockCompiler;
use crate::jit::hotspot::HotspotPromoter;
use crate::jit::interp::{self, StepResult};
use crate::memory::{MemoryWindow, Protection};
use crate::stats::EngineStats;

/// Tracked guest ranges whose pages are write-protected so stores from
/// translated code surface self-modifying-code events.
#[derive(Default)]
pub struct WriteTracker {
    ranges: Mutex<Vec<Range<u64>>>,
}

const GUEST_PAGE: u64 = 4096;

impl WriteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write-protects a guest range and remembers it as code-tracked.
    pub fn track(&self, window: &MemoryWindow, range: Range<u64>) -> Result<(), crate::memory::WindowError> {
        window.set_protection(range.clone(), Protection::ReadOnly)?;
        self.ranges.lock().push(range);
        Ok(())
    }

    pub fn covers(&self, guest_addr: u64) -> bool {
        self.ranges
            .lock()
            .iter()
            .any(|range| range.contains(&guest_addr))
    }

    /// Drops tracking for the page containing `guest_addr` and makes it
    /// writable again; the caller has already invalidated the blocks.
    fn release_page(&self, window: &MemoryWindow, guest_addr: u64) {
        let page = guest_addr & !(GUEST_PAGE - 1);
        let mut ranges = self.ranges.lock();
        let mut replacement = Vec::new();
        ranges.retain_mut(|range| {
            let overlaps = range.start < page + GUEST_PAGE && page < range.end;
            if !overlaps {
                return true;
            }
            // Split around the released page.
            if range.start < page {
                replacement.push(range.start..page);
            }
            if range.end > page + GUEST_PAGE {
                replacement.push(page + GUEST_PAGE..range.end);
            }
            false
        });
        ranges.extend(replacement);
        drop(ranges);
        if let Err(e) = window.set_protection(page..page + GUEST_PAGE, Protection::ReadWrite) {
            warn!("could not unprotect guest page {page:#x}: {e}");
        }
    }
}

/// Why an executor loop ended.
#[derive(Debug)]
pub enum ThreadExit {
    /// The stop flag was observed at a block boundary.
    Stopped,
    /// A guest access left the window, or the guest trapped.
    GuestFault { guest_addr: u64 },
    /// A host signal inside translated code that no recovery path claimed.
    HostSignal { signal: i32, scope: &'static str },
    /// The guest executed return-from-interrupt.
    ReturnFromInterrupt,
}

pub type SyscallHandler = Box<dyn FnMut(&mut PpuState) + Send>;

pub struct Executor {
    window: Arc<MemoryWindow>,
    blocks: Arc<BlockCache>,
    compiler: Arc<BlockCompiler>,
    promoter: Arc<HotspotPromoter>,
    tracker: Arc<WriteTracker>,
    stats: Arc<EngineStats>,
    stop: Arc<AtomicBool>,
    jit_enabled: Arc<AtomicBool>,
    syscall: SyscallHandler,
    slot: Arc<ExecutorSlot>,
    pub state: Box<PpuState>,
}

enum Flow {
    Continue,
    Exit(ThreadExit),
}

#[allow(clippy::too_many_arguments)]
impl Executor {
    pub fn new(
        window: Arc<MemoryWindow>,
        blocks: Arc<BlockCache>,
        compiler: Arc<BlockCompiler>,
        promoter: Arc<HotspotPromoter>,
        tracker: Arc<WriteTracker>,
        stats: Arc<EngineStats>,
        stop: Arc<AtomicBool>,
        jit_enabled: Arc<AtomicBool>,
        syscall: SyscallHandler,
        entry_pc: u64,
    ) -> Executor {
        let slot = blocks.register_executor();
        let mut state = Box::new(PpuState::new());
        state.pc = entry_pc;
        state.membase = window.base_ptr();
        Executor {
            window,
            blocks,
            compiler,
            promoter,
            tracker,
            stats,
            stop,
            jit_enabled,
            syscall,
            slot,
            state,
        }
    }

    /// The per-guest-thread loop. Returns when the thread is stopped,
    /// faults, or the guest leaves via return-from-interrupt.
    pub fn run(&mut self) -> ThreadExit {
        crash_guard::install_alt_stack();
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return ThreadExit::Stopped;
            }
            // Translated execution needs an AArch64 host; everywhere else
            // the interpreter is the only tier.
            let use_jit =
                cfg!(target_arch = "aarch64") && self.jit_enabled.load(Ordering::Relaxed);
            let flow = if use_jit {
                self.step_jit()
            } else {
                self.step_interpreter()
            };
            match flow {
                Flow::Continue => {}
                Flow::Exit(exit) => return exit,
            }
        }
    }

    fn step_jit(&mut self) -> Flow {
        let pc = self.state.pc as u32;
        // The executing marker goes up before the lookup: a drain that
        // lands in between either empties the map first (we miss and
        // recompile) or waits for this marker.
        let exec_guard = self.blocks.begin_execution(&self.slot);
        let Some(block) = self.blocks.lookup(pc) else {
            drop(exec_guard);
            self.stats.block_cache_misses.fetch_add(1, Ordering::Relaxed);
            return match self.compiler.compile_baseline(&self.window, pc) {
                Ok(_) => {
                    self.stats.blocks_compiled.fetch_add(1, Ordering::Relaxed);
                    Flow::Continue
                }
                Err(e) => {
                    debug!("compilation at {pc:#x} failed ({e}); interpreter path");
                    self.stats
                        .interpreter_fallbacks
                        .fetch_add(1, Ordering::Relaxed);
                    self.step_interpreter()
                }
            };
        };
        self.stats.block_cache_hits.fetch_add(1, Ordering::Relaxed);

        let entry = unsafe { block.entry() };
        let state_ptr: *mut PpuState = &mut *self.state;
        let (guard, raw_exit) = crash_guard::protect("ppu_block", || entry(state_ptr));
        drop(exec_guard);

        if !guard.ok() {
            return self.handle_block_fault(guard, &block);
        }
        self.stats.blocks_executed.fetch_add(1, Ordering::Relaxed);
        self.promoter.note_execution(&block);

        let raw_exit = raw_exit.unwrap_or(BlockExit::Trap as u64);
        match BlockExit::from_raw(raw_exit) {
            Some(BlockExit::Continue) => {
                self.state.pc = self.state.next_pc;
                Flow::Continue
            }
            Some(BlockExit::Syscall) => {
                self.state.pc = self.state.next_pc;
                self.stats.guest_syscalls.fetch_add(1, Ordering::Relaxed);
                (self.syscall)(&mut self.state);
                Flow::Continue
            }
            Some(BlockExit::Unhandled) => {
                // The block stopped at an instruction the translator could
                // not lower; run exactly that one on tier 0.
                self.state.pc = self.state.next_pc;
                self.stats
                    .interpreter_fallbacks
                    .fetch_add(1, Ordering::Relaxed);
                self.step_interpreter()
            }
            Some(BlockExit::ReturnFromInterrupt) => {
                Flow::Exit(ThreadExit::ReturnFromInterrupt)
            }
            Some(BlockExit::Trap) | None => Flow::Exit(ThreadExit::GuestFault {
                guest_addr: self.state.pc,
            }),
        }
    }

    fn step_interpreter(&mut self) -> Flow {
        let state_ptr: *mut PpuState = &mut *self.state;
        let window = self.window.clone();
        let (guard, result) = crash_guard::protect("ppu_interp", || {
            interp::step(unsafe { &mut *state_ptr }, &window)
        });
        if !guard.ok() {
            return self.handle_interp_fault(guard);
        }
        self.stats
            .instructions_interpreted
            .fetch_add(1, Ordering::Relaxed);
        match result.unwrap_or(StepResult::Continue) {
            StepResult::Continue => Flow::Continue,
            StepResult::Syscall => {
                self.stats.guest_syscalls.fetch_add(1, Ordering::Relaxed);
                (self.syscall)(&mut self.state);
                Flow::Continue
            }
            StepResult::ReturnFromInterrupt => Flow::Exit(ThreadExit::ReturnFromInterrupt),
            StepResult::Fault { guest_addr } => {
                Flow::Exit(ThreadExit::GuestFault { guest_addr })
            }
        }
    }

    fn handle_block_fault(&mut self, guard: CrashGuard, block: &CompiledBlock) -> Flow {
        if guard.wants_self_heal() {
            // SIGILL inside the code cache: drop the offending block and
            // let the next iteration recompile it.
            warn!(
                "self-healing block at {:#x} after SIGILL in emitted code",
                block.guest_pc
            );
            self.blocks.invalidate_range(block.guest_pc, block.guest_len);
            return Flow::Continue;
        }
        self.common_fault(guard)
    }

    fn handle_interp_fault(&mut self, guard: CrashGuard) -> Flow {
        self.common_fault(guard)
    }

    /// Shared signal routing: a fault inside a write-tracked window range
    /// is self-modifying guest code (invalidate, unprotect, retry);
    /// anything else is surfaced for this guest thread.
    fn common_fault(&mut self, guard: CrashGuard) -> Flow {
        if let Some(guest_addr) = self.window.guest_addr_of_host(guard.fault_address()) {
            if self.tracker.covers(guest_addr) {
                trace!("guest code write at {guest_addr:#x}; invalidating");
                let page = guest_addr & !(GUEST_PAGE - 1);
                self.blocks.invalidate_range(page as u32, GUEST_PAGE as u32);
                self.tracker.release_page(&self.window, guest_addr);
                self.stats.smc_invalidations.fetch_add(1, Ordering::Relaxed);
                return Flow::Continue;
            }
            warn!(
                "guest fault: {:?} at guest {guest_addr:#x} (scope {})",
                guard.signal(),
                guard.scope()
            );
            return Flow::Exit(ThreadExit::GuestFault { guest_addr });
        }
        warn!(
            "host signal {} inside {} contained; stopping guest thread",
            guard.signal(),
            guard.scope()
        );
        Flow::Exit(ThreadExit::HostSignal {
            signal: guard.signal(),
            scope: guard.scope(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::block_cache::BlockCache;
    use crate::jit::code_cache::CodeCache;
    use crate::memory::WindowConfig;
    use crate::pool::CompilerPool;

    struct Harness {
        window: Arc<MemoryWindow>,
        blocks: Arc<BlockCache>,
        stop: Arc<AtomicBool>,
        executor: Executor,
    }

    fn harness(entry_pc: u64, jit: bool) -> Harness {
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
        let pool = Arc::new(CompilerPool::new(1, Arc::new(|| {})));
        let promoter = Arc::new(HotspotPromoter::new(
            compiler.clone(),
            window.clone(),
            pool,
        ));
        let stop = Arc::new(AtomicBool::new(false));
        let executor = Executor::new(
            window.clone(),
            blocks.clone(),
            compiler,
            promoter,
            Arc::new(WriteTracker::new()),
            Arc::new(EngineStats::default()),
            stop.clone(),
            Arc::new(AtomicBool::new(jit)),
            Box::new(|state| {
                // Default test syscall: succeed.
                state.gpr[3] = 0;
            }),
            entry_pc,
        );
        Harness {
            window,
            blocks,
            stop,
            executor,
        }
    }

    fn write_insts(window: &MemoryWindow, pc: u32, words: &[u32]) {
        for (i, &w) in words.iter().enumerate() {
            window.write_u32_be(pc + i as u32 * 4, w).unwrap();
        }
    }

    #[test]
    fn interpreter_loop_runs_to_rfid() {
        let mut h = harness(0x1_0000, false);
        // li r3, 1 ; addi r3, r3, 2 ; rfid
        write_insts(
            &h.window,
            0x1_0000,
            &[0x3860_0001, 0x3863_0002, 0x4C00_0024],
        );
        let exit = h.executor.run();
        assert!(matches!(exit, ThreadExit::ReturnFromInterrupt));
        assert_eq!(h.executor.state.gpr[3], 3);
    }

    #[test]
    fn stop_flag_is_observed_between_steps() {
        let mut h = harness(0x2_0000, false);
        // An infinite loop: b .
        write_insts(&h.window, 0x2_0000, &[(18u32 << 26) | 0]);
        h.stop.store(true, Ordering::Relaxed);
        let exit = h.executor.run();
        assert!(matches!(exit, ThreadExit::Stopped));
    }

    #[test]
    fn stop_interrupts_a_running_loop() {
        let mut h = harness(0x2_0000, false);
        write_insts(&h.window, 0x2_0000, &[(18u32 << 26) | 0]);
        let stop = h.stop.clone();
        let handle = std::thread::spawn(move || h.executor.run());
        std::thread::sleep(std::time::Duration::from_millis(50));
        stop.store(true, Ordering::Relaxed);
        let exit = handle.join().unwrap();
        assert!(matches!(exit, ThreadExit::Stopped));
    }

    #[test]
    fn out_of_window_fetch_is_a_guest_fault() {
        let mut h = harness(0x2_0000, false);
        let far = h.window.size() as u64 + 0x1000;
        h.executor.state.pc = far;
        let exit = h.executor.run();
        assert!(matches!(exit, ThreadExit::GuestFault { .. }));
    }

    #[test]
    fn syscall_routes_to_the_handler_and_continues() {
        let mut h = harness(0x3_0000, false);
        // li r3, 99 ; sc ; rfid — the handler rewrites r3 to 0.
        write_insts(
            &h.window,
            0x3_0000,
            &[0x3860_0063, 0x4400_0002, 0x4C00_0024],
        );
        let exit = h.executor.run();
        assert!(matches!(exit, ThreadExit::ReturnFromInterrupt));
        assert_eq!(h.executor.state.gpr[3], 0);
    }

    #[test]
    fn smc_store_into_tracked_page_invalidates_and_retries() {
        let mut h = harness(0x4_0000, false);
        // The guest writes over its own code page at 0x5000, then stops.
        // stw r5, 0(r4) ; rfid
        write_insts(&h.window, 0x4_0000, &[0x90A4_0000, 0x4C00_0024]);
        // Pretend 0x5000 holds compiled code.
        write_insts(&h.window, 0x5000, &[0x3821_0010, 0x4E80_0020]);
        let code = Arc::new(CodeCache::new(64 * 1024).unwrap());
        let compiler = BlockCompiler::new(code, h.blocks.clone());
        compiler.compile_baseline(&h.window, 0x5000).unwrap();
        assert!(h.blocks.lookup(0x5000).is_some());

        let tracker = h.executor.tracker.clone();
        tracker
            .track(&h.window, 0x5000..0x5008)
            .unwrap();
        h.executor.state.gpr[4] = 0x5000;
        h.executor.state.gpr[5] = 0x3863_0001;
        let exit = h.executor.run();
        assert!(matches!(exit, ThreadExit::ReturnFromInterrupt));
        // The store landed after the retry and the block is gone.
        assert_eq!(h.window.read_u32_be(0x5000), Some(0x3863_0001));
        assert!(h.blocks.lookup(0x5000).is_none());
    }

    #[test]
    fn untracked_protected_range_is_a_guest_fault() {
        let mut h = harness(0x6_0000, false);
        // stw r5, 0(r4) against a protection = none range, no tracking.
        write_insts(&h.window, 0x6_0000, &[0x90A4_0000, 0x4C00_0024]);
        h.window
            .set_protection(0x70_0000..0x71_0000, Protection::None)
            .unwrap();
        h.executor.state.gpr[4] = 0x70_0000;
        h.executor.state.gpr[5] = 1;
        let exit = h.executor.run();
        match exit {
            ThreadExit::GuestFault { guest_addr } => assert_eq!(guest_addr, 0x70_0000),
            other => panic!("expected a guest fault, got {other:?}"),
        }
        h.window
            .set_protection(0x70_0000..0x71_0000, Protection::ReadWrite)
            .unwrap();
    }
}
