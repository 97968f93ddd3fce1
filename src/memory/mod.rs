//! Guest physical memory: the single large host mapping ("the window")
//! that translated code indexes directly.

mod window;

pub use window::{
    AccessPattern, MemoryWindow, Protection, WindowConfig, WindowError, GUEST_MAIN_MEMORY_BYTES,
    GUEST_VIDEO_MEMORY_BYTES,
};
