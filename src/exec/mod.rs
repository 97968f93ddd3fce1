//! Execution of translated code: the per-guest-thread executor loop and the
//! crash guard that contains faults raised inside it.

pub mod crash_guard;
mod executor;

pub use executor::{Executor, SyscallHandler, ThreadExit, WriteTracker};
