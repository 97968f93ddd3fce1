//! The executable code arena.
//!
//! One RWX anonymous mapping shared by every compiled block, used as a bump
//! allocator. Individual blocks are never freed; when the arena fills up the
//! whole thing is drained (which retires every block at once) and the bump
//! pointer starts over.

use std::io;
use std::ptr;

use log::{debug, info};
use parking_lot::Mutex;

/// Default arena size.
pub const DEFAULT_CODE_CACHE_BYTES: usize = 128 * 1024 * 1024;

pub struct CodeCache {
    base: *mut u8,
    size: usize,
    bump: Mutex<usize>,
}

// The arena is written under the bump lock and executed read-only; the
// mapping itself lives until drop.
unsafe impl Send for CodeCache {}
unsafe impl Sync for CodeCache {}

impl CodeCache {
    pub fn new(size: usize) -> io::Result<CodeCache> {
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        info!("code cache mapped: {} MiB at {base:p}", size / (1024 * 1024));
        Ok(CodeCache {
            base: base as *mut u8,
            size,
            bump: Mutex::new(0),
        })
    }

    /// Copies `words` into the arena and returns the entry pointer, or
    /// `None` when the arena is full. The caller still owns the
    /// instruction-cache flush.
    pub fn alloc(&self, words: &[u32]) -> Option<*const u32> {
        let bytes = words.len() * 4;
        let mut bump = self.bump.lock();
        // Entry points keep 16-byte alignment.
        let offset = (*bump + 15) & !15;
        if offset + bytes > self.size {
            debug!(
                "code cache full: {offset} + {bytes} > {}; drain required",
                self.size
            );
            return None;
        }
        let dst = unsafe { self.base.add(offset) } as *mut u32;
        unsafe {
            ptr::copy_nonoverlapping(words.as_ptr(), dst, words.len());
        }
        *bump = offset + bytes;
        Some(dst as *const u32)
    }

    /// Resets the bump pointer. Every previously returned pointer becomes
    /// conceptually retired; the block cache's drain is responsible for
    /// making sure no executor is still inside.
    pub fn reset(&self) {
        *self.bump.lock() = 0;
        debug!("code cache reset");
    }

    pub fn used_bytes(&self) -> usize {
        *self.bump.lock()
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn base_addr(&self) -> usize {
        self.base as usize
    }

    /// Whether a host address lies inside the arena; the crash guard's JIT
    /// self-heal path uses this to attribute a SIGILL.
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base as usize;
        addr >= base && addr < base + self.size
    }
}

impl Drop for CodeCache {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        /// Makes freshly written code visible to the instruction stream:
        /// clean the data cache to the point of unification, invalidate the
        /// instruction cache over the range, then barrier. Mandatory on
        /// AArch64 between writing instructions and executing them.
        pub fn flush_icache(start: *const u8, len: usize) {
            if len == 0 {
                return;
            }
            unsafe {
                let ctr: u64;
                std::arch::asm!("mrs {}, ctr_el0", out(reg) ctr);
                let dline = 4usize << ((ctr >> 16) & 0xF);
                let iline = 4usize << (ctr & 0xF);
                let end = start as usize + len;

                let mut addr = (start as usize) & !(dline - 1);
                while addr < end {
                    std::arch::asm!("dc cvau, {}", in(reg) addr);
                    addr += dline;
                }
                std::arch::asm!("dsb ish");

                let mut addr = (start as usize) & !(iline - 1);
                while addr < end {
                    std::arch::asm!("ic ivau, {}", in(reg) addr);
                    addr += iline;
                }
                std::arch::asm!("dsb ish");
                std::arch::asm!("isb");
            }
        }
    } else {
        /// Hosts that only ever run the interpreter have nothing to flush.
        pub fn flush_icache(_start: *const u8, _len: usize) {}
    }
}
