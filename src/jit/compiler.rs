//! The block compiler: walks forward from a guest PC, drives the translator,
//! and publishes finished blocks into the code arena.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use cellvm_isa::aarch64::Assembler;
use cellvm_isa::ppu::{decode, Inst, Op};
use log::{debug, warn};

use super::block::{BlockFlags, CompiledBlock, Tier};
use super::block_cache::BlockCache;
use super::code_cache::{flush_icache, CodeCache};
use super::translate::{emit_continue_exit, emit_prologue, Next, Translator};
use crate::error::CompileError;
use crate::memory::MemoryWindow;

/// Blocks end at a terminator or after this many guest instructions,
/// whichever comes first.
pub const MAX_BLOCK_INSTRUCTIONS: u32 = 256;

pub struct BlockCompiler {
    code_cache: Arc<CodeCache>,
    block_cache: Arc<BlockCache>,
}

impl BlockCompiler {
    pub fn new(code_cache: Arc<CodeCache>, block_cache: Arc<BlockCache>) -> Self {
        BlockCompiler {
            code_cache,
            block_cache,
        }
    }

    /// Compiles and publishes a baseline block for `guest_pc`.
    pub fn compile_baseline(
        &self,
        window: &MemoryWindow,
        guest_pc: u32,
    ) -> Result<Arc<CompiledBlock>, CompileError> {
        let block = self.build(window, guest_pc, Tier::Baseline)?;
        Ok(self.block_cache.insert(block))
    }

    /// Compiles an optimizing-tier block and swaps it in over the baseline
    /// entry. Returns `None` when a newer job already published this tier.
    pub fn compile_promoted(
        &self,
        window: &MemoryWindow,
        guest_pc: u32,
    ) -> Result<Option<Arc<CompiledBlock>>, CompileError> {
        let block = self.build(window, guest_pc, Tier::Optimizing)?;
        Ok(self.block_cache.replace_with_tier(block))
    }

    fn build(
        &self,
        window: &MemoryWindow,
        guest_pc: u32,
        tier: Tier,
    ) -> Result<CompiledBlock, CompileError> {
        let insts = self.fetch_span(window, guest_pc)?;
        let skip_cr0 = if tier == Tier::Optimizing {
            elidable_cr0_updates(&insts)
        } else {
            vec![false; insts.len()]
        };

        let mut asm = Assembler::with_capacity(insts.len() * 8 + 16);
        emit_prologue(&mut asm);
        let mut translator = Translator::new(&mut asm, tier);
        let mut consumed = 0u32;
        let mut ended = false;
        for (i, inst) in insts.iter().enumerate() {
            consumed += 1;
            if translator.translate(inst, skip_cr0[i]) == Next::End {
                ended = true;
                break;
            }
        }
        if !ended {
            // Size cap: surface the fallthrough PC and return.
            let end_pc = guest_pc.wrapping_add(consumed * 4);
            emit_continue_exit(&mut asm, end_pc as u64);
        }

        let last = &insts[consumed as usize - 1];
        let mut flags = BlockFlags::empty();
        let mut branch_target = 0u32;
        if last.is_block_terminator() {
            flags |= BlockFlags::HAS_TERMINATOR;
            if last.op == Op::B {
                flags |= BlockFlags::KNOWN_TARGET;
                branch_target = if last.aa {
                    last.li as u32
                } else {
                    last.pc.wrapping_add(last.li as u32)
                };
            }
        }

        let words = asm.code();
        let host_code = match self.code_cache.alloc(words) {
            Some(code) => code,
            None => {
                // Out of space: drain everything once, then retry.
                warn!("code cache exhausted; draining before retry");
                self.block_cache.clear(&self.code_cache);
                self.code_cache
                    .alloc(words)
                    .ok_or(CompileError::OutOfSpace { guest_pc })?
            }
        };
        flush_icache(host_code as *const u8, words.len() * 4);

        debug!(
            "compiled {:?} block at {guest_pc:#x}: {} guest insts -> {} host bytes",
            tier,
            consumed,
            words.len() * 4
        );
        Ok(CompiledBlock {
            guest_pc,
            guest_len: consumed * 4,
            host_code,
            host_len: words.len() * 4,
            tier,
            flags,
            branch_target,
            exec_count: AtomicU32::new(0),
        })
    }

    /// Decodes the linear guest span for one block: up to the size cap,
    /// through the first terminator.
    fn fetch_span(
        &self,
        window: &MemoryWindow,
        guest_pc: u32,
    ) -> Result<Vec<Inst>, CompileError> {
        let mut insts = Vec::new();
        let mut pc = guest_pc;
        for _ in 0..MAX_BLOCK_INSTRUCTIONS {
            let Some(word) = window.read_u32_be(pc) else {
                if insts.is_empty() {
                    return Err(CompileError::Fetch { guest_pc });
                }
                break;
            };
            let inst = decode(word, pc);
            let terminator = inst.is_block_terminator();
            insts.push(inst);
            if terminator {
                break;
            }
            pc = pc.wrapping_add(4);
        }
        Ok(insts)
    }
}

/// The optimizing tier's CR0-elision pre-pass: an instruction's CR0 update
/// may be skipped when a later instruction in the same block overwrites CR0
/// unconditionally before anything reads it. Block boundaries always
/// preserve state, so a span that reaches the terminator keeps its update.
fn elidable_cr0_updates(insts: &[Inst]) -> Vec<bool> {
    let mut skip = vec![false; insts.len()];
    for i in 0..insts.len() {
        if !insts[i].rc {
            continue;
        }
        for later in &insts[i + 1..] {
            if reads_cr0(later) {
                break;
            }
            if overwrites_cr0(later) {
                skip[i] = true;
                break;
            }
        }
    }
    skip
}

fn reads_cr0(inst: &Inst) -> bool {
    match inst.op {
        // A conditional branch that actually tests a CR0 bit.
        Op::Bc | Op::Bclr | Op::Bcctr => inst.bo & 0b10000 == 0 && inst.bi < 4,
        Op::Mfcr => true,
        Op::Mcrf => inst.bfa == 0,
        Op::Crand
        | Op::Cror
        | Op::Crxor
        | Op::Crnand
        | Op::Crnor
        | Op::Creqv
        | Op::Crandc
        | Op::Crorc => inst.ra < 4 || inst.rb < 4,
        // A terminator ends the block; boundary state must be exact.
        Op::B | Op::Sc | Op::Rfid => true,
        _ => false,
    }
}

fn overwrites_cr0(inst: &Inst) -> bool {
    if inst.rc {
        return true;
    }
    match inst.op {
        Op::Cmp | Op::Cmpi | Op::Cmpl | Op::Cmpli => inst.bf == 0,
        Op::Stwcx | Op::Stdcx => true,
        Op::Mtcrf => inst.fm & 0x80 != 0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryWindow, WindowConfig};

    fn window() -> MemoryWindow {
        MemoryWindow::new(WindowConfig {
            candidate_sizes: vec![16 * 1024 * 1024],
            ..WindowConfig::default()
        })
        .unwrap()
    }

    fn harness() -> (BlockCompiler, Arc<CodeCache>, Arc<BlockCache>) {
        let code = Arc::new(CodeCache::new(256 * 1024).unwrap());
        let blocks = Arc::new(BlockCache::new());
        (
            BlockCompiler::new(code.clone(), blocks.clone()),
            code,
            blocks,
        )
    }

    fn write_insts(window: &MemoryWindow, pc: u32, words: &[u32]) {
        for (i, &w) in words.iter().enumerate() {
            window.write_u32_be(pc + i as u32 * 4, w).unwrap();
        }
    }

    #[test]
    fn block_ends_at_terminator() {
        let window = window();
        let (compiler, code, _) = harness();
        // addi r1, r1, 16 ; blr ; (junk afterwards must not be consumed)
        write_insts(&window, 0x1_0000, &[0x3821_0010, 0x4E80_0020, 0xFFFF_FFFF]);
        let block = compiler.compile_baseline(&window, 0x1_0000).unwrap();
        assert_eq!(block.guest_len, 8);
        assert!(block.flags.contains(BlockFlags::HAS_TERMINATOR));
        assert!(code.used_bytes() >= block.host_len);
    }

    #[test]
    fn unconditional_branch_records_known_target() {
        let window = window();
        let (compiler, _, _) = harness();
        // b .+0x100
        write_insts(&window, 0x2_0000, &[(18 << 26) | 0x100]);
        let block = compiler.compile_baseline(&window, 0x2_0000).unwrap();
        assert!(block.flags.contains(BlockFlags::KNOWN_TARGET));
        assert_eq!(block.branch_target, 0x2_0100);
    }

    #[test]
    fn size_cap_bounds_unterminated_spans() {
        let window = window();
        let (compiler, _, _) = harness();
        // 512 adds with no terminator: the block must stop at the cap.
        let insts = vec![0x3821_0001u32; 512];
        write_insts(&window, 0x4_0000, &insts);
        let block = compiler.compile_baseline(&window, 0x4_0000).unwrap();
        assert_eq!(block.guest_len, MAX_BLOCK_INSTRUCTIONS * 4);
        assert!(!block.flags.contains(BlockFlags::HAS_TERMINATOR));
    }

    #[test]
    fn out_of_space_drains_and_retries() {
        let window = window();
        let code = Arc::new(CodeCache::new(4 * 1024).unwrap());
        let blocks = Arc::new(BlockCache::new());
        let compiler = BlockCompiler::new(code.clone(), blocks.clone());
        // Each long block takes a large share of the tiny arena; compiling
        // several forces the drain-and-retry path.
        for n in 0..8u32 {
            let pc = 0x1_0000 + n * 0x1000;
            let mut insts = vec![0x3821_0001u32; 60];
            insts.push(0x4E80_0020);
            write_insts(&window, pc, &insts);
            compiler.compile_baseline(&window, pc).unwrap();
        }
        // After drains, at least the most recent block is present.
        assert!(blocks.len() >= 1);
        assert!(code.used_bytes() > 0);
    }

    #[test]
    fn fetch_outside_window_is_an_error() {
        let window = window();
        let (compiler, _, _) = harness();
        let far = window.size() as u32 + 0x1000;
        assert!(matches!(
            compiler.compile_baseline(&window, far),
            Err(CompileError::Fetch { .. })
        ));
    }

    #[test]
    fn cr0_elision_pre_pass() {
        // add. ; add. ; blr — the first update is dead, the second feeds
        // the boundary.
        let insts: Vec<Inst> = [0x7C64_2A15u32, 0x7C64_2A15, 0x4E80_0020]
            .iter()
            .enumerate()
            .map(|(i, &w)| decode(w, i as u32 * 4))
            .collect();
        assert_eq!(elidable_cr0_updates(&insts), vec![true, false, false]);

        // add. ; beq (reads CR0) ; the update must stay.
        let insts: Vec<Inst> = [0x7C64_2A15u32, 0x4182_0008]
            .iter()
            .enumerate()
            .map(|(i, &w)| decode(w, i as u32 * 4))
            .collect();
        assert_eq!(elidable_cr0_updates(&insts), vec![false, false]);

        // add. ; cmpwi cr7 (writes CR7, not CR0) ; cmpwi cr0 — elidable
        // through the CR7 write.
        let insts: Vec<Inst> = [
            0x7C64_2A15u32,
            (11 << 26) | (7 << 23) | (3 << 16),
            (11 << 26) | (3 << 16),
        ]
        .iter()
        .enumerate()
        .map(|(i, &w)| decode(w, i as u32 * 4))
        .collect();
        assert_eq!(elidable_cr0_updates(&insts), vec![true, false, false]);
    }
}
