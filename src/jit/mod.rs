//! The binary translation pipeline: decoded guest instructions are lowered
//! to AArch64 (`translate`), assembled into blocks (`compiler`), stored in
//! the executable arena (`code_cache`), published through the concurrent
//! map (`block_cache`), and promoted between tiers (`hotspot`). `interp` is
//! tier 0, the fallback that needs no emitted code at all.

pub mod block;
pub mod block_cache;
pub mod code_cache;
pub mod compiler;
pub mod hotspot;
pub mod interp;
pub mod translate;

pub use block::{BlockExit, BlockFlags, CompiledBlock, Tier};
pub use block_cache::BlockCache;
pub use code_cache::CodeCache;
pub use compiler::{BlockCompiler, MAX_BLOCK_INSTRUCTIONS};
pub use hotspot::{HotspotPromoter, PROMOTE_EXEC_THRESHOLD};
