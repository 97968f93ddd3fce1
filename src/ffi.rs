//! The C-linkage library surface.
//!
//! A host binding loads this library and resolves these symbols by name;
//! every function's name, argument tuple, and return type is the stable
//! ABI. The engine lives in one documented process-wide slot with explicit
//! initialize/shutdown, and a single-slot last-error string backs
//! `cellvm_last_error`.
//!
//! Returned strings point into a thread-local buffer that stays valid until
//! the next string-returning call on the same thread.

use std::cell::RefCell;
use std::ffi::{c_char, c_int, c_longlong, c_void, CStr, CString};
use std::path::Path;
use std::sync::Arc;

use log::error;
use parking_lot::{Mutex, RwLock};

use crate::engine::{Engine, EngineConfig, PadState};

static ENGINE: RwLock<Option<Arc<Engine>>> = RwLock::new(None);
static LAST_ERROR: Mutex<String> = Mutex::new(String::new());

thread_local! {
    static RETURN_STRING: RefCell<CString> = RefCell::new(CString::default());
}

fn set_last_error(message: impl Into<String>) {
    let message = message.into();
    error!("{message}");
    *LAST_ERROR.lock() = message;
}

fn engine() -> Option<Arc<Engine>> {
    ENGINE.read().clone()
}

fn return_string(value: &str) -> *const c_char {
    let cstring = CString::new(value.as_bytes()).unwrap_or_default();
    RETURN_STRING.with(|slot| {
        *slot.borrow_mut() = cstring;
        slot.borrow().as_ptr()
    })
}

/// # Safety
/// `ptr` must be null or a valid NUL-terminated string.
unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Initializes the engine with the given content root and user. Installs
/// the crash handlers on this first lifecycle call.
///
/// # Safety
/// `root_dir` and `user` must be null or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn cellvm_initialize(
    root_dir: *const c_char,
    user: *const c_char,
) -> bool {
    let _ = env_logger::Builder::from_default_env().try_init();
    let Some(root_dir) = str_arg(root_dir) else {
        set_last_error("initialize: root_dir is not a valid string");
        return false;
    };
    let user = str_arg(user).unwrap_or("00000001");

    let mut slot = ENGINE.write();
    if slot.is_some() {
        set_last_error("initialize: engine is already initialized");
        return false;
    }
    match Engine::new(EngineConfig::new(root_dir, user)) {
        Ok(engine) => {
            *slot = Some(Arc::new(engine));
            true
        }
        Err(e) => {
            set_last_error(format!("initialize failed: {e}"));
            false
        }
    }
}

/// Boots a guest image. Returns 0 on success, a negative code on failure.
///
/// # Safety
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn cellvm_boot(path: *const c_char) -> c_int {
    let Some(engine) = engine() else {
        set_last_error("boot: engine is not initialized");
        return -1;
    };
    let Some(path) = str_arg(path) else {
        set_last_error("boot: path is not a valid string");
        return -2;
    };
    match engine.boot(Path::new(path)) {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(format!("boot failed: {e}"));
            -3
        }
    }
}

#[no_mangle]
pub extern "C" fn cellvm_shutdown() {
    let engine = ENGINE.write().take();
    if let Some(engine) = engine {
        engine.shutdown();
    }
}

#[no_mangle]
pub extern "C" fn cellvm_kill() {
    if let Some(engine) = engine() {
        engine.kill();
    }
}

#[no_mangle]
pub extern "C" fn cellvm_resume() {
    if let Some(engine) = engine() {
        engine.resume();
    }
}

#[no_mangle]
pub extern "C" fn cellvm_get_state() -> c_int {
    engine().map_or(0, |engine| engine.state() as c_int)
}

#[no_mangle]
pub extern "C" fn cellvm_get_title_id() -> *const c_char {
    let title = engine().and_then(|engine| engine.title_id()).unwrap_or_default();
    return_string(&title)
}

#[no_mangle]
pub extern "C" fn cellvm_get_version() -> *const c_char {
    return_string(env!("CARGO_PKG_VERSION"))
}

#[no_mangle]
pub extern "C" fn cellvm_system_info() -> *const c_char {
    let info = engine().map(|engine| engine.system_info()).unwrap_or_default();
    return_string(&info)
}

#[no_mangle]
pub extern "C" fn cellvm_surface_event(surface: *mut c_void, event: c_int) -> bool {
    engine().is_some_and(|engine| engine.surface_event(surface as usize, event))
}

#[no_mangle]
pub extern "C" fn cellvm_usb_device_event(
    fd: c_int,
    vendor_id: c_int,
    product_id: c_int,
    event: c_int,
) -> bool {
    engine().is_some_and(|engine| engine.usb_device_event(fd, vendor_id, product_id, event))
}

#[no_mangle]
pub extern "C" fn cellvm_install(fd: c_int, progress_id: c_longlong) -> bool {
    engine().is_some_and(|engine| engine.install(fd, progress_id))
}

#[no_mangle]
pub extern "C" fn cellvm_install_fw(fd: c_int, progress_id: c_longlong) -> bool {
    engine().is_some_and(|engine| engine.install_firmware(fd, progress_id))
}

#[no_mangle]
pub extern "C" fn cellvm_is_installable_file(fd: c_int) -> bool {
    engine().is_some_and(|engine| engine.is_installable_fd(fd))
}

#[no_mangle]
pub extern "C" fn cellvm_overlay_pad_data(
    digital1: c_int,
    digital2: c_int,
    left_stick_x: c_int,
    left_stick_y: c_int,
    right_stick_x: c_int,
    right_stick_y: c_int,
) -> bool {
    let Some(engine) = engine() else {
        return false;
    };
    engine.overlay_pad_data(PadState {
        digital1: digital1 as u32,
        digital2: digital2 as u32,
        left_stick: (left_stick_x, left_stick_y),
        right_stick: (right_stick_x, right_stick_y),
    });
    true
}

/// # Safety
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn cellvm_settings_get(path: *const c_char) -> *const c_char {
    let value = str_arg(path)
        .and_then(|path| engine().and_then(|engine| engine.settings_get(path)))
        .unwrap_or_default();
    return_string(&value)
}

/// # Safety
/// `path` and `value` must be null or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn cellvm_settings_set(
    path: *const c_char,
    value: *const c_char,
) -> bool {
    let (Some(path), Some(value)) = (str_arg(path), str_arg(value)) else {
        return false;
    };
    engine().is_some_and(|engine| engine.settings_set(path, value))
}

/// # Safety
/// `user_id` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn cellvm_login_user(user_id: *const c_char) {
    if let (Some(user_id), Some(engine)) = (str_arg(user_id), engine()) {
        engine.login_user(user_id);
    }
}

#[no_mangle]
pub extern "C" fn cellvm_get_user() -> *const c_char {
    let user = engine().map(|engine| engine.user()).unwrap_or_default();
    return_string(&user)
}

/// Stores a custom driver handle and returns the previous one.
#[no_mangle]
pub extern "C" fn cellvm_set_custom_driver(handle: *mut c_void) -> *mut c_void {
    engine().map_or(std::ptr::null_mut(), |engine| {
        engine.set_custom_driver(handle as usize) as *mut c_void
    })
}

/// The single-slot last-error string.
#[no_mangle]
pub extern "C" fn cellvm_last_error() -> *const c_char {
    return_string(&LAST_ERROR.lock())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The FFI layer shares one process-wide engine slot, so one test walks
    // the whole surface in order.
    #[test]
    fn lifecycle_over_the_c_abi() {
        let dir = tempfile::tempdir().unwrap();
        let root = CString::new(dir.path().to_str().unwrap()).unwrap();
        let user = CString::new("00000001").unwrap();

        // Nothing initialized yet: queries degrade, no crashes.
        assert_eq!(cellvm_get_state(), 0);
        unsafe {
            assert!(!cellvm_settings_set(
                CString::new("cpu.jit").unwrap().as_ptr(),
                CString::new("true").unwrap().as_ptr()
            ));
        }

        unsafe {
            assert!(cellvm_initialize(root.as_ptr(), user.as_ptr()));
            // Double initialization is refused and reports an error.
            assert!(!cellvm_initialize(root.as_ptr(), user.as_ptr()));
        }
        let err = unsafe { CStr::from_ptr(cellvm_last_error()) };
        assert!(err.to_str().unwrap().contains("already initialized"));

        let version = unsafe { CStr::from_ptr(cellvm_get_version()) };
        assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));

        unsafe {
            let path = CString::new("cpu.jit").unwrap();
            let value = CString::new("false").unwrap();
            assert!(cellvm_settings_set(path.as_ptr(), value.as_ptr()));
            let got = CStr::from_ptr(cellvm_settings_get(path.as_ptr()));
            assert_eq!(got.to_str().unwrap(), "false");
        }

        assert!(cellvm_overlay_pad_data(0x40, 0, 10, -10, 0, 0));
        unsafe {
            cellvm_login_user(CString::new("00000007").unwrap().as_ptr());
            let user = CStr::from_ptr(cellvm_get_user());
            assert_eq!(user.to_str().unwrap(), "00000007");
        }

        // Boot a missing path: negative code plus a last-error string.
        unsafe {
            let missing = CString::new("/nonexistent/image.bin").unwrap();
            assert!(cellvm_boot(missing.as_ptr()) < 0);
        }
        let err = unsafe { CStr::from_ptr(cellvm_last_error()) };
        assert!(err.to_str().unwrap().contains("boot failed"));

        let prev = cellvm_set_custom_driver(0x1234 as *mut c_void);
        assert!(prev.is_null());
        assert_eq!(cellvm_set_custom_driver(std::ptr::null_mut()) as usize, 0x1234);

        cellvm_shutdown();
        assert_eq!(cellvm_get_state(), 0);
    }
}
