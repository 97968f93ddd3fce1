//! cellvm — a Cell PPU → ARM64 emulation core.
//!
//! Three layers turn guest PowerPC machine code into executed work on the
//! host:
//!
//! - a binary translator ([`jit`]) that decodes big-endian PPU instructions
//!   and emits AArch64 into an executable arena, with an interpreter as
//!   tier 0 and a hotspot promoter driving baseline → optimizing
//!   recompiles;
//! - a guest-address → host-address memory window ([`memory`]) over which
//!   translated loads and stores go direct, with byte swap;
//! - persistent artifact caches (the `cellvm-shader-cache` crate) keyed by
//!   content hash and host identity, so upgrades never run stale
//!   artifacts.
//!
//! Around these sit the per-guest-thread executor with its crash guard
//! ([`exec`]), the async compiler pool ([`pool`]), the scheduler policy
//! ([`sched`]), and the lifecycle/ABI surface ([`engine`], [`ffi`]).

pub mod engine;
pub mod error;
pub mod exec;
pub mod ffi;
pub mod jit;
pub mod memory;
pub mod pool;
pub mod sched;
pub mod settings;
pub mod stats;

pub use engine::{Engine, EngineConfig, LifecycleState};
pub use error::{CompileError, EngineError};
pub use exec::{Executor, ThreadExit};
pub use memory::{MemoryWindow, WindowConfig};
