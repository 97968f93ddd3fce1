use std::io;
use std::ops::Range;
use std::ptr;

use log::{debug, info, warn};
use thiserror::Error;

/// Guest main memory size.
pub const GUEST_MAIN_MEMORY_BYTES: usize = 256 * 1024 * 1024;
/// Guest GPU-visible memory size.
pub const GUEST_VIDEO_MEMORY_BYTES: usize = 256 * 1024 * 1024;

/// Minimum alignment of the window base. At least 64 KiB regardless of the
/// host page size, for safe JIT memory-protection patterns.
const MIN_ALIGNMENT: usize = 64 * 1024;

/// How much of the window gets pinned with mlock, best effort.
const MLOCK_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("could not map any candidate window size")]
    Exhausted,

    #[error("guest range {guest_addr:#x}+{len:#x} is outside the window")]
    OutOfRange { guest_addr: u64, len: usize },

    #[error("memory protection change failed: {0}")]
    Protect(#[source] io::Error),
}

/// Advisory access-pattern hints for a guest range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessPattern {
    Sequential,
    Random,
    WillNeed,
    DontNeed,
}

/// Enforced protection for a guest range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    ReadOnly,
    None,
}

pub struct WindowConfig {
    /// Mapping sizes to attempt, largest first. Initialization degrades
    /// down this schedule instead of failing outright.
    pub candidate_sizes: Vec<usize>,
    /// Pin the head of the window against swap (0 disables).
    pub mlock_bytes: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        let target = GUEST_MAIN_MEMORY_BYTES + GUEST_VIDEO_MEMORY_BYTES;
        WindowConfig {
            candidate_sizes: vec![
                target,
                384 * 1024 * 1024,
                256 * 1024 * 1024,
                128 * 1024 * 1024,
            ],
            mlock_bytes: MLOCK_BYTES,
        }
    }
}

/// The guest-physical → host mapping. Guest addresses translate by linear
/// offset from the base; translated code adds the base register directly.
///
/// The window owns the mapping for the whole emulator lifetime and is torn
/// down last, after every executor has stopped.
pub struct MemoryWindow {
    base: *mut u8,
    size: usize,
    page_size: usize,
}

unsafe impl Send for MemoryWindow {}
unsafe impl Sync for MemoryWindow {}

fn host_page_size() -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 {
        page as usize
    } else {
        4096
    }
}

/// Maps `size` anonymous bytes with the base aligned to `alignment`
/// (power of two): reserve `size + alignment` with PROT_NONE, trim the
/// misaligned edges, then map the aligned middle read-write in place.
fn map_aligned_rw(size: usize, alignment: usize) -> Option<*mut u8> {
    debug_assert!(alignment.is_power_of_two());
    let reserve_size = size.checked_add(alignment)?;
    let reserve = unsafe {
        libc::mmap(
            ptr::null_mut(),
            reserve_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if reserve == libc::MAP_FAILED {
        return None;
    }
    let reserve_addr = reserve as usize;
    let aligned_addr = (reserve_addr + alignment - 1) & !(alignment - 1);
    let prefix = aligned_addr - reserve_addr;
    let suffix = reserve_size - prefix - size;
    unsafe {
        if prefix != 0 {
            libc::munmap(reserve, prefix);
        }
        if suffix != 0 {
            libc::munmap((aligned_addr + size) as *mut libc::c_void, suffix);
        }
        // MAP_NORESERVE keeps a large window from charging commit upfront
        // where the platform has it.
        #[allow(unused_mut)]
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            flags |= libc::MAP_NORESERVE;
        }
        let mapped = libc::mmap(
            aligned_addr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        );
        if mapped == libc::MAP_FAILED {
            libc::munmap(aligned_addr as *mut libc::c_void, size);
            return None;
        }
        Some(mapped as *mut u8)
    }
}

impl MemoryWindow {
    pub fn new(config: WindowConfig) -> Result<MemoryWindow, WindowError> {
        let page_size = host_page_size();
        let alignment = page_size.max(MIN_ALIGNMENT);

        let mut mapped = None;
        for &candidate in &config.candidate_sizes {
            let size = candidate.div_ceil(alignment) * alignment;
            match map_aligned_rw(size, alignment) {
                Some(base) => {
                    mapped = Some((base, size));
                    break;
                }
                None => {
                    warn!("window mapping of {} MiB failed, degrading", size / (1024 * 1024));
                }
            }
        }
        let Some((base, size)) = mapped else {
            return Err(WindowError::Exhausted);
        };

        unsafe {
            // Advisory tuning; none of these may fail the setup.
            #[cfg(any(target_os = "linux", target_os = "android"))]
            {
                libc::madvise(base as *mut libc::c_void, size, libc::MADV_HUGEPAGE);
            }
            if config.mlock_bytes > 0 {
                let locked = config.mlock_bytes.min(size);
                if libc::mlock(base as *const libc::c_void, locked) != 0 {
                    debug!("mlock of window head not permitted; continuing unpinned");
                }
            }
        }

        info!(
            "memory window mapped: {} MiB at {base:p} (alignment {} KiB)",
            size / (1024 * 1024),
            alignment / 1024
        );
        Ok(MemoryWindow {
            base,
            size,
            page_size,
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Direct guest → host translation. The returned pointer never lies
    /// outside the mapped range.
    #[inline]
    pub fn translate(&self, guest_addr: u64) -> Option<*mut u8> {
        if guest_addr < self.size as u64 {
            Some(unsafe { self.base.add(guest_addr as usize) })
        } else {
            None
        }
    }

    fn check(&self, guest_addr: u64, len: usize) -> Result<usize, WindowError> {
        let end = guest_addr
            .checked_add(len as u64)
            .filter(|&end| end <= self.size as u64);
        match end {
            Some(_) => Ok(guest_addr as usize),
            None => Err(WindowError::OutOfRange { guest_addr, len }),
        }
    }

    /// Reads a big-endian instruction word, as the block compiler fetches
    /// guest code.
    pub fn read_u32_be(&self, guest_addr: u32) -> Option<u32> {
        let mut bytes = [0u8; 4];
        self.copy_to_host(guest_addr as u64, &mut bytes).ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn write_u32_be(&self, guest_addr: u32, value: u32) -> Result<(), WindowError> {
        self.copy_from_host(guest_addr as u64, &value.to_be_bytes())
    }

    pub fn copy_to_host(&self, src_guest: u64, dst: &mut [u8]) -> Result<(), WindowError> {
        let offset = self.check(src_guest, dst.len())?;
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    pub fn copy_from_host(&self, dst_guest: u64, src: &[u8]) -> Result<(), WindowError> {
        let offset = self.check(dst_guest, src.len())?;
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset), src.len());
        }
        Ok(())
    }

    /// Overlap-safe guest-to-guest copy.
    pub fn copy_guest_to_guest(
        &self,
        dst_guest: u64,
        src_guest: u64,
        len: usize,
    ) -> Result<(), WindowError> {
        let src = self.check(src_guest, len)?;
        let dst = self.check(dst_guest, len)?;
        unsafe {
            ptr::copy(self.base.add(src), self.base.add(dst), len);
        }
        Ok(())
    }

    fn page_range(&self, range: &Range<u64>) -> Result<(usize, usize), WindowError> {
        let len = range.end.saturating_sub(range.start) as usize;
        let offset = self.check(range.start, len)?;
        let start = offset & !(self.page_size - 1);
        let end = (offset + len + self.page_size - 1) & !(self.page_size - 1);
        Ok((start, end - start))
    }

    /// Advisory access-pattern hint for a guest range. Failure is logged
    /// and swallowed; hints never break anything.
    pub fn set_access_pattern(
        &self,
        range: Range<u64>,
        pattern: AccessPattern,
    ) -> Result<(), WindowError> {
        let (start, len) = self.page_range(&range)?;
        let advice = match pattern {
            AccessPattern::Sequential => libc::MADV_SEQUENTIAL,
            AccessPattern::Random => libc::MADV_RANDOM,
            AccessPattern::WillNeed => libc::MADV_WILLNEED,
            AccessPattern::DontNeed => libc::MADV_DONTNEED,
        };
        let rc = unsafe {
            libc::madvise(self.base.add(start) as *mut libc::c_void, len, advice)
        };
        if rc != 0 {
            debug!(
                "madvise({pattern:?}) on {start:#x}+{len:#x} failed: {}",
                io::Error::last_os_error()
            );
        }
        Ok(())
    }

    /// Enforced protection change for a guest range, page-granular. This is
    /// the hook behind write-tracking: a store into a read-only range traps
    /// to the crash guard, which routes it to the block cache.
    pub fn set_protection(
        &self,
        range: Range<u64>,
        protection: Protection,
    ) -> Result<(), WindowError> {
        let (start, len) = self.page_range(&range)?;
        let prot = match protection {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadOnly => libc::PROT_READ,
            Protection::None => libc::PROT_NONE,
        };
        let rc = unsafe {
            libc::mprotect(self.base.add(start) as *mut libc::c_void, len, prot)
        };
        if rc != 0 {
            return Err(WindowError::Protect(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Whether a faulting host address belongs to this window, and at which
    /// guest address.
    pub fn guest_addr_of_host(&self, host_addr: usize) -> Option<u64> {
        let base = self.base as usize;
        if host_addr >= base && host_addr < base + self.size {
            Some((host_addr - base) as u64)
        } else {
            None
        }
    }
}

impl Drop for MemoryWindow {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_window() -> MemoryWindow {
        MemoryWindow::new(WindowConfig {
            candidate_sizes: vec![16 * 1024 * 1024],
            mlock_bytes: 0,
        })
        .unwrap()
    }

    #[test]
    fn base_is_aligned_to_64k() {
        let window = small_window();
        assert_eq!(window.base_ptr() as usize % MIN_ALIGNMENT, 0);
    }

    #[test]
    fn translate_never_escapes_the_mapping() {
        let window = small_window();
        let size = window.size() as u64;
        assert!(window.translate(0).is_some());
        assert!(window.translate(size - 1).is_some());
        assert!(window.translate(size).is_none());
        assert!(window.translate(u64::MAX).is_none());
        let base = window.base_ptr() as usize;
        let last = window.translate(size - 1).unwrap() as usize;
        assert_eq!(last, base + window.size() - 1);
    }

    #[test]
    fn degrades_through_the_candidate_schedule() {
        // An impossible first candidate must fall through to the second,
        // not abort.
        let window = MemoryWindow::new(WindowConfig {
            candidate_sizes: vec![1 << 55, 8 * 1024 * 1024],
            mlock_bytes: 0,
        })
        .unwrap();
        assert_eq!(window.size(), 8 * 1024 * 1024);
    }

    #[test]
    fn exhausted_schedule_is_an_error_not_an_abort() {
        let result = MemoryWindow::new(WindowConfig {
            candidate_sizes: vec![1 << 55, 1 << 56],
            mlock_bytes: 0,
        });
        assert!(matches!(result, Err(WindowError::Exhausted)));
    }

    #[test]
    fn big_endian_word_round_trip() {
        let window = small_window();
        window.write_u32_be(0x1000, 0xDEAD_BEEF).unwrap();
        let mut raw = [0u8; 4];
        window.copy_to_host(0x1000, &mut raw).unwrap();
        assert_eq!(raw, [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(window.read_u32_be(0x1000), Some(0xDEAD_BEEF));
        assert_eq!(window.read_u32_be(window.size() as u32 - 2), None);
    }

    #[test]
    fn guest_to_guest_copies_handle_overlap() {
        let window = small_window();
        window.copy_from_host(0x100, b"abcdefgh").unwrap();
        window.copy_guest_to_guest(0x104, 0x100, 8).unwrap();
        let mut out = [0u8; 8];
        window.copy_to_host(0x104, &mut out).unwrap();
        assert_eq!(&out, b"abcdabcd");
    }

    #[test]
    fn out_of_range_accesses_are_errors() {
        let window = small_window();
        let size = window.size() as u64;
        assert!(window.copy_from_host(size - 4, b"12345678").is_err());
        let mut buf = [0u8; 16];
        assert!(window.copy_to_host(u64::MAX - 8, &mut buf).is_err());
        assert!(window
            .copy_guest_to_guest(0, size - 4, 8)
            .is_err());
    }

    #[test]
    fn protection_round_trip() {
        let window = small_window();
        window
            .set_protection(0x1_0000..0x2_0000, Protection::ReadOnly)
            .unwrap();
        window
            .set_protection(0x1_0000..0x2_0000, Protection::ReadWrite)
            .unwrap();
        window.write_u32_be(0x1_0000, 1).unwrap();
        assert_eq!(window.read_u32_be(0x1_0000), Some(1));
    }

    #[test]
    fn access_pattern_hints_are_best_effort() {
        let window = small_window();
        for pattern in [
            AccessPattern::Sequential,
            AccessPattern::Random,
            AccessPattern::WillNeed,
            AccessPattern::DontNeed,
        ] {
            window.set_access_pattern(0..0x1_0000, pattern).unwrap();
        }
    }

    #[test]
    fn host_fault_addresses_map_back_to_guest() {
        let window = small_window();
        let host = window.translate(0x1234).unwrap() as usize;
        assert_eq!(window.guest_addr_of_host(host), Some(0x1234));
        assert_eq!(window.guest_addr_of_host(0x10), None);
    }
}
