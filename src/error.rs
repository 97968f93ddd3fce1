use thiserror::Error;

/// Engine-level errors surfaced across the library boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is not initialized")]
    NotInitialized,

    #[error("engine is already initialized")]
    AlreadyInitialized,

    #[error("memory window setup failed: {0}")]
    Window(#[from] crate::memory::WindowError),

    #[error("shader cache setup failed: {0}")]
    ShaderCache(#[from] cellvm_shader_cache::CacheError),

    #[error("boot failed: {0}")]
    Boot(String),

    #[error("no title is running")]
    NotRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from compiling one block.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    /// The code cache could not hold the block even after a drain.
    #[error("code cache exhausted while compiling block at {guest_pc:#x}")]
    OutOfSpace { guest_pc: u32 },

    /// The guest PC does not lie inside the memory window.
    #[error("cannot fetch guest instructions at {guest_pc:#x}")]
    Fetch { guest_pc: u32 },
}
