//! Fault containment around translated code.
//!
//! Fatal signals raised inside a guarded region (memory faults, bus errors,
//! illegal instructions, FP exceptions) are caught on an alternate stack,
//! recorded, and turned into a non-local return to the innermost guard
//! instead of killing the process. The set-jump/long-jump control flow is
//! deliberately explicit and scoped: the landing pad lives exactly as long
//! as the `protect` frame, and the returned [`CrashGuard`] handle is the
//! only way to observe that a signal fired.

use std::cell::Cell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use libc::c_int;
use log::{error, info, warn};

/// Comfortably larger than any libc's `sigjmp_buf`.
#[repr(C)]
#[repr(align(16))]
struct SigJmpBuf([u64; 64]);

// glibc only exports the two-argument `__sigsetjmp`; bionic and musl export
// `sigsetjmp` itself. `siglongjmp` is universal.
extern "C" {
    #[cfg_attr(target_env = "gnu", link_name = "__sigsetjmp")]
    fn sigsetjmp(env: *mut SigJmpBuf, savemask: c_int) -> c_int;
    fn siglongjmp(env: *mut SigJmpBuf, val: c_int) -> !;
}

const LANDING_SIGNAL: c_int = 1;
const LANDING_SELF_HEAL: c_int = 2;

struct GuardFrame {
    jmp: MaybeUninit<SigJmpBuf>,
    prev: *mut GuardFrame,
    scope: &'static str,
}

thread_local! {
    static ACTIVE_GUARD: Cell<*mut GuardFrame> = const { Cell::new(ptr::null_mut()) };
    static LAST_FAULT: Cell<(c_int, usize)> = const { Cell::new((0, 0)) };
}

static HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);
static SELF_HEAL_ENABLED: AtomicBool = AtomicBool::new(false);
static CODE_CACHE_BASE: AtomicUsize = AtomicUsize::new(0);
static CODE_CACHE_LEN: AtomicUsize = AtomicUsize::new(0);

const GUARDED_SIGNALS: [c_int; 4] = [libc::SIGSEGV, libc::SIGBUS, libc::SIGILL, libc::SIGFPE];
const ALT_STACK_BYTES: usize = 64 * 1024;

/// The outcome of one guarded region.
pub struct CrashGuard {
    ok: bool,
    signal: c_int,
    fault_address: usize,
    scope: &'static str,
    self_heal: bool,
}

impl CrashGuard {
    /// True on the normal execution path; false if control returned here
    /// because a signal fired inside the region.
    pub fn ok(&self) -> bool {
        self.ok
    }

    /// The caught signal number, or 0 on the normal path.
    pub fn signal(&self) -> c_int {
        self.signal
    }

    pub fn fault_address(&self) -> usize {
        self.fault_address
    }

    pub fn scope(&self) -> &'static str {
        self.scope
    }

    /// True when the signal was a SIGILL inside the code cache and JIT
    /// self-healing is enabled: the caller should invalidate and retry.
    pub fn wants_self_heal(&self) -> bool {
        self.self_heal
    }
}

unsafe extern "C" fn fault_handler(sig: c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let addr = if info.is_null() {
        0
    } else {
        (*info).si_addr() as usize
    };
    LAST_FAULT.with(|cell| cell.set((sig, addr)));

    let frame = ACTIVE_GUARD.with(|cell| cell.get());
    if !frame.is_null() {
        let val = if sig == libc::SIGILL && SELF_HEAL_ENABLED.load(Ordering::Relaxed) {
            let base = CODE_CACHE_BASE.load(Ordering::Relaxed);
            let len = CODE_CACHE_LEN.load(Ordering::Relaxed);
            if addr >= base && addr < base + len {
                LANDING_SELF_HEAL
            } else {
                LANDING_SIGNAL
            }
        } else {
            LANDING_SIGNAL
        };
        siglongjmp((*frame).jmp.as_mut_ptr(), val);
    }

    // No guard on this thread: put the default disposition back and
    // re-raise so the process reports the crash normally.
    let msg = b"cellvm: fatal signal outside any crash guard\n";
    libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = libc::SIG_DFL;
    libc::sigaction(sig, &action, ptr::null_mut());
    libc::raise(sig);
}

/// Installs the fault handlers and this thread's alternate stack. Safe to
/// call any number of times; only the first call performs the handler
/// syscalls.
pub fn install_handlers() -> bool {
    install_alt_stack();
    if HANDLERS_INSTALLED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return true;
    }
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    let handler: unsafe extern "C" fn(c_int, *mut libc::siginfo_t, *mut libc::c_void) =
        fault_handler;
    action.sa_sigaction = handler as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
    }
    let ok = GUARDED_SIGNALS
        .iter()
        .all(|&sig| unsafe { libc::sigaction(sig, &action, ptr::null_mut()) == 0 });
    if ok {
        info!("crash signal handlers installed");
    } else {
        error!("failed to install crash signal handlers");
    }
    ok
}

/// Gives the calling thread an alternate signal stack, so the handler
/// survives a corrupted or overflowed regular stack. Per-thread; executor
/// threads call this on startup.
pub fn install_alt_stack() {
    thread_local! {
        static ALT_STACK_READY: Cell<bool> = const { Cell::new(false) };
    }
    if ALT_STACK_READY.with(|cell| cell.replace(true)) {
        return;
    }
    unsafe {
        let stack = libc::mmap(
            ptr::null_mut(),
            ALT_STACK_BYTES,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if stack == libc::MAP_FAILED {
            warn!("could not map an alternate signal stack for this thread");
            return;
        }
        let ss = libc::stack_t {
            ss_sp: stack,
            ss_flags: 0,
            ss_size: ALT_STACK_BYTES,
        };
        if libc::sigaltstack(&ss, ptr::null_mut()) != 0 {
            warn!("sigaltstack failed: {}", std::io::Error::last_os_error());
            libc::munmap(stack, ALT_STACK_BYTES);
        }
    }
}

/// Turns the SIGILL-in-code-cache recovery path on or off.
pub fn set_self_heal(enabled: bool) {
    SELF_HEAL_ENABLED.store(enabled, Ordering::Relaxed);
    info!(
        "JIT self-heal {}",
        if enabled { "enabled" } else { "disabled" }
    );
}

pub fn self_heal_enabled() -> bool {
    SELF_HEAL_ENABLED.load(Ordering::Relaxed)
}

/// Tells the handler which host range holds emitted code, for SIGILL
/// attribution.
pub fn register_code_cache_range(base: usize, len: usize) {
    CODE_CACHE_BASE.store(base, Ordering::Relaxed);
    CODE_CACHE_LEN.store(len, Ordering::Relaxed);
}

/// Runs `f` inside a guarded region named `scope`.
///
/// On the normal path the closure's value comes back alongside an
/// `ok() == true` guard. If a guarded signal fires, the closure is
/// abandoned at the faulting instruction (no unwinding runs across it —
/// callers keep drop-sensitive state out of the region) and the guard
/// reports the signal.
pub fn protect<R>(scope: &'static str, f: impl FnOnce() -> R) -> (CrashGuard, Option<R>) {
    install_handlers();

    let mut frame = GuardFrame {
        jmp: MaybeUninit::uninit(),
        prev: ACTIVE_GUARD.with(|cell| cell.get()),
        scope,
    };
    ACTIVE_GUARD.with(|cell| cell.set(&mut frame));

    // The saved-mask form: the long-jump also restores the signal mask in
    // effect here, so the caught signal is unblocked again afterwards.
    let rc = unsafe { sigsetjmp(frame.jmp.as_mut_ptr(), 1) };
    let result = if rc == 0 { Some(f()) } else { None };

    ACTIVE_GUARD.with(|cell| cell.set(frame.prev));
    let guard = if rc == 0 {
        CrashGuard {
            ok: true,
            signal: 0,
            fault_address: 0,
            scope,
            self_heal: false,
        }
    } else {
        let (signal, fault_address) = LAST_FAULT.with(|cell| cell.get());
        CrashGuard {
            ok: false,
            signal,
            fault_address,
            scope,
            self_heal: rc == LANDING_SELF_HEAL,
        }
    };
    (guard, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryWindow, Protection, WindowConfig};

    #[test]
    fn installation_is_idempotent() {
        assert!(install_handlers());
        assert!(install_handlers());
        assert!(install_handlers());
    }

    #[test]
    fn normal_path_returns_the_value() {
        let (guard, value) = protect("unit", || 40 + 2);
        assert!(guard.ok());
        assert_eq!(guard.signal(), 0);
        assert_eq!(value, Some(42));
        assert_eq!(guard.scope(), "unit");
    }

    #[test]
    fn catches_a_store_into_a_protected_window_range() {
        // A guest store into a protection = none sub-range is caught as a
        // memory fault; the process survives.
        let window = MemoryWindow::new(WindowConfig {
            candidate_sizes: vec![16 * 1024 * 1024],
            mlock_bytes: 0,
        })
        .unwrap();
        window
            .set_protection(0x10_0000..0x11_0000, Protection::None)
            .unwrap();
        let target = window.translate(0x10_0800).unwrap();

        let (guard, value) = protect("test_segv", || unsafe {
            ptr::write_volatile(target, 0xAA);
            7u32
        });
        assert!(!guard.ok());
        assert!(guard.signal() == libc::SIGSEGV || guard.signal() == libc::SIGBUS);
        assert_eq!(guard.scope(), "test_segv");
        assert_eq!(value, None);
        let expected = window.translate(0x10_0800).unwrap() as usize;
        assert_eq!(guard.fault_address(), expected);

        window
            .set_protection(0x10_0000..0x11_0000, Protection::ReadWrite)
            .unwrap();
    }

    #[test]
    fn guards_nest() {
        let (outer, inner_result) = protect("outer", || {
            let (inner, _) = protect("inner", || unsafe {
                ptr::read_volatile(0x10 as *const u8)
            });
            assert!(!inner.ok());
            assert_eq!(inner.scope(), "inner");
            // The outer guard is live again after the inner one returns.
            11
        });
        assert!(outer.ok());
        assert_eq!(inner_result, Some(11));
    }

    #[test]
    fn fault_in_guard_is_repeatable() {
        for _ in 0..3 {
            let (guard, _) =
                protect("repeat", || unsafe { ptr::read_volatile(0x18 as *const u8) });
            assert!(!guard.ok());
            assert_eq!(guard.signal(), libc::SIGSEGV);
        }
    }
}
