//! The engine: owned process-wide state with an explicit initialization and
//! teardown API. Every operation takes a reference; the only global is the
//! FFI layer's documented engine slot.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{info, warn};
use parking_lot::Mutex;

use cellvm_shader_cache::{
    open_pipeline_blob, CacheQuery, CompileOptions, HostIdentity, PipelineBlob, ShaderArtifact,
    ShaderCache, ShaderCacheConfig,
};

use crate::error::EngineError;
use crate::exec::{crash_guard, Executor, ThreadExit, WriteTracker};
use crate::jit::{BlockCache, BlockCompiler, CodeCache, HotspotPromoter};
use crate::memory::{MemoryWindow, WindowConfig};
use crate::pool::CompilerPool;
use crate::sched::{self, CpuClasses, ThreadRole};
use crate::settings::Settings;
use crate::stats::EngineStats;

/// Guest address a boot image is loaded at; execution starts at its first
/// byte.
pub const BOOT_IMAGE_BASE: u32 = 0x1_0000;

/// Guest package file magic.
const PKG_MAGIC: [u8; 4] = [0x7F, b'P', b'K', b'G'];
/// Firmware update package magic.
const PUP_MAGIC: [u8; 5] = *b"SCEUF";

/// Lifecycle states, in the numeric encoding the library boundary exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum LifecycleState {
    Stopped = 0,
    Running = 1,
    Paused = 2,
}

pub struct EngineConfig {
    pub root_dir: PathBuf,
    pub user: String,
    /// Host graphics identity string; pairs with the build id to validate
    /// on-disk caches.
    pub gpu_identity: String,
    pub code_cache_bytes: usize,
}

impl EngineConfig {
    pub fn new(root_dir: impl Into<PathBuf>, user: impl Into<String>) -> EngineConfig {
        EngineConfig {
            root_dir: root_dir.into(),
            user: user.into(),
            gpu_identity: std::env::var("CELLVM_GPU_ID")
                .unwrap_or_else(|_| "unknown-gpu".to_owned()),
            code_cache_bytes: crate::jit::code_cache::DEFAULT_CODE_CACHE_BYTES,
        }
    }
}

struct GuestThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<ThreadExit>,
}

pub struct Engine {
    root_dir: PathBuf,
    settings: Settings,
    stats: Arc<EngineStats>,
    classes: CpuClasses,

    blocks: Arc<BlockCache>,
    compiler: Arc<BlockCompiler>,
    promoter: Arc<HotspotPromoter>,
    tracker: Arc<WriteTracker>,
    pool: Arc<CompilerPool>,
    shader_cache: ShaderCache,
    pipeline_blob: PipelineBlob,

    shader_compiler: Mutex<Option<ShaderCompilerFn>>,
    jit_enabled: Arc<AtomicBool>,
    lifecycle: Mutex<LifecycleState>,
    main_thread: Mutex<Option<GuestThread>>,
    title_id: Mutex<Option<String>>,
    user: Mutex<String>,
    pad: Mutex<PadState>,
    custom_driver: Mutex<usize>,

    code_cache: Arc<CodeCache>,
    // Declared last on purpose: the window must outlive everything that can
    // still be inside JIT code or guest memory, and field order is drop
    // order.
    window: Arc<MemoryWindow>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PadState {
    pub digital1: u32,
    pub digital2: u32,
    pub left_stick: (i32, i32),
    pub right_stick: (i32, i32),
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Engine, EngineError> {
        crash_guard::install_handlers();
        std::fs::create_dir_all(&config.root_dir)?;

        let settings = Settings::load(&config.root_dir);
        let window = Arc::new(MemoryWindow::new(WindowConfig::default())?);
        let code_cache = Arc::new(CodeCache::new(config.code_cache_bytes)?);
        crash_guard::register_code_cache_range(code_cache.base_addr(), code_cache.capacity());
        crash_guard::set_self_heal(settings.get_bool("cpu.jit_self_heal", false));

        let blocks = Arc::new(BlockCache::new());
        let compiler = Arc::new(BlockCompiler::new(code_cache.clone(), blocks.clone()));

        let classes = CpuClasses::detect();
        let worker_classes = classes.clone();
        let pool = Arc::new(CompilerPool::new(
            num_cpus::get().clamp(2, 6),
            Arc::new(move || {
                sched::apply_thread_policy(&worker_classes, ThreadRole::Worker);
            }),
        ));
        let promoter = Arc::new(HotspotPromoter::new(
            compiler.clone(),
            window.clone(),
            pool.clone(),
        ));

        let identity = HostIdentity::new(
            config.gpu_identity.clone(),
            env!("CARGO_PKG_VERSION").to_owned(),
        );
        let cache_dir = config.root_dir.join("cache");
        let shader_cache = ShaderCache::open(ShaderCacheConfig::new(&cache_dir, identity.clone()))?;
        let pipeline_blob = open_pipeline_blob(&cache_dir, &identity);

        let jit_enabled = Arc::new(AtomicBool::new(settings.get_bool("cpu.jit", true)));
        info!(
            "engine initialized at {} (user {}, gpu {})",
            config.root_dir.display(),
            config.user,
            config.gpu_identity
        );
        Ok(Engine {
            root_dir: config.root_dir,
            settings,
            stats: Arc::new(EngineStats::default()),
            classes,
            blocks,
            compiler,
            promoter,
            tracker: Arc::new(WriteTracker::new()),
            pool,
            shader_cache,
            pipeline_blob,
            shader_compiler: Mutex::new(None),
            jit_enabled,
            lifecycle: Mutex::new(LifecycleState::Stopped),
            main_thread: Mutex::new(None),
            title_id: Mutex::new(None),
            user: Mutex::new(config.user),
            pad: Mutex::new(PadState::default()),
            custom_driver: Mutex::new(0),
            code_cache,
            window,
        })
    }

    /// Loads a guest image and starts the primary executor thread pinned to
    /// the prime core.
    pub fn boot(&self, path: &Path) -> Result<(), EngineError> {
        {
            let lifecycle = self.lifecycle.lock();
            if *lifecycle != LifecycleState::Stopped {
                return Err(EngineError::Boot("a title is already running".into()));
            }
        }
        let image = std::fs::read(path)
            .map_err(|e| EngineError::Boot(format!("cannot read {}: {e}", path.display())))?;
        if image.len() < 4 {
            return Err(EngineError::Boot("image is too small to contain code".into()));
        }
        self.window
            .copy_from_host(BOOT_IMAGE_BASE as u64, &image)
            .map_err(|e| EngineError::Boot(format!("image does not fit guest memory: {e}")))?;

        let title = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "UNKNOWN".to_owned());
        *self.title_id.lock() = Some(title.clone());

        let stop = Arc::new(AtomicBool::new(false));
        let mut executor = Executor::new(
            self.window.clone(),
            self.blocks.clone(),
            self.compiler.clone(),
            self.promoter.clone(),
            self.tracker.clone(),
            self.stats.clone(),
            stop.clone(),
            self.jit_enabled.clone(),
            Box::new(default_syscall_handler),
            BOOT_IMAGE_BASE as u64,
        );
        let classes = self.classes.clone();
        let handle = std::thread::Builder::new()
            .name("cellvm-ppu-main".to_owned())
            .spawn(move || {
                sched::apply_thread_policy(&classes, ThreadRole::Executor);
                let exit = executor.run();
                info!("primary guest thread finished: {exit:?}");
                exit
            })
            .map_err(|e| EngineError::Boot(format!("cannot spawn the executor: {e}")))?;

        *self.main_thread.lock() = Some(GuestThread { stop, handle });
        *self.lifecycle.lock() = LifecycleState::Running;
        info!("booted {title} ({} bytes at {BOOT_IMAGE_BASE:#x})", image.len());
        Ok(())
    }

    /// Requests every guest thread to stop and waits for it.
    pub fn kill(&self) {
        if let Some(thread) = self.main_thread.lock().take() {
            thread.stop.store(true, Ordering::Relaxed);
            let _ = thread.handle.join();
        }
        *self.lifecycle.lock() = LifecycleState::Stopped;
    }

    pub fn pause(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle == LifecycleState::Running {
            *lifecycle = LifecycleState::Paused;
        }
    }

    pub fn resume(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle == LifecycleState::Paused {
            *lifecycle = LifecycleState::Running;
        }
    }

    /// Orderly teardown: executors first, then the compile queue, then the
    /// cache flush. The window itself is released by drop, strictly last.
    pub fn shutdown(&self) {
        self.kill();
        // The deferred disk flush is background-class work.
        let cache = self.shader_cache.clone();
        let classes = self.classes.clone();
        let flusher = std::thread::Builder::new()
            .name("cellvm-cache-flush".to_owned())
            .spawn(move || {
                sched::apply_thread_policy(&classes, ThreadRole::Background);
                if let Err(e) = cache.flush() {
                    warn!("shader cache flush failed: {e}");
                }
            });
        if let Ok(flusher) = flusher {
            let _ = flusher.join();
        }
        self.settings.save_best_effort();
        info!("engine stats at shutdown: {}", self.stats.summary());
    }

    pub fn state(&self) -> LifecycleState {
        *self.lifecycle.lock()
    }

    pub fn title_id(&self) -> Option<String> {
        self.title_id.lock().clone()
    }

    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn system_info(&self) -> String {
        format!(
            "cellvm {}; window {} MiB; code cache {} MiB; cpus prime={:?} perf={:?} eff={:?}; {}",
            self.version(),
            self.window.size() / (1024 * 1024),
            self.code_cache.capacity() / (1024 * 1024),
            self.classes.prime,
            self.classes.performance,
            self.classes.efficiency,
            self.stats.summary(),
        )
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn shader_cache(&self) -> &ShaderCache {
        &self.shader_cache
    }

    /// Registers the host-side shader compiler the cache falls back to on a
    /// miss. Without one, misses simply report "no artifact".
    pub fn set_shader_compiler(&self, compiler: ShaderCompilerFn) {
        *self.shader_compiler.lock() = Some(compiler);
    }

    /// Resolves guest shader bytecode to host pipeline bytes: L1 → L2 → L3,
    /// then a compile scheduled on the pool. Concurrent callers for the
    /// same key share one compile; the bounded wait falls back to `None`
    /// and the renderer decides what to do without the artifact.
    pub fn shader_lookup(
        &self,
        bytecode: &[u8],
        options: &CompileOptions,
    ) -> Option<Arc<ShaderArtifact>> {
        match self.shader_cache.query(bytecode, options) {
            CacheQuery::Hit(artifact) => Some(artifact),
            CacheQuery::Pending(wait) => wait.wait(),
            CacheQuery::Miss(ticket) => {
                let Some(compile) = self.shader_compiler.lock().clone() else {
                    ticket.abandon();
                    return None;
                };
                let job_bytecode = bytecode.to_vec();
                let job_options = *options;
                self.pool.submit(move || {
                    let bytes = compile(&job_bytecode, &job_options);
                    ticket.fulfill(bytes);
                });
                match self.shader_cache.query(bytecode, options) {
                    CacheQuery::Hit(artifact) => Some(artifact),
                    CacheQuery::Pending(wait) => wait.wait(),
                    // The pool already finished and the artifact got
                    // evicted in between; treat it as unavailable.
                    CacheQuery::Miss(ticket) => {
                        ticket.abandon();
                        None
                    }
                }
            }
        }
    }

    pub fn pipeline_blob(&self) -> &PipelineBlob {
        &self.pipeline_blob
    }

    pub fn window(&self) -> &MemoryWindow {
        &self.window
    }

    pub fn block_cache(&self) -> &BlockCache {
        &self.blocks
    }

    /// Host-side write into guest memory. Keeps compiled code coherent by
    /// invalidating overlapping blocks before the next entry.
    pub fn guest_write(&self, guest_addr: u64, bytes: &[u8]) -> Result<(), EngineError> {
        self.window.copy_from_host(guest_addr, bytes)?;
        self.blocks
            .invalidate_range(guest_addr as u32, bytes.len() as u32);
        Ok(())
    }

    /// Write-protects a guest range holding code, so stores from the guest
    /// itself trap into the invalidate-and-retry path.
    pub fn track_guest_code(&self, range: std::ops::Range<u64>) -> Result<(), EngineError> {
        self.tracker.track(&self.window, range)?;
        Ok(())
    }

    pub fn settings_get(&self, path: &str) -> Option<String> {
        self.settings.get(path)
    }

    pub fn settings_set(&self, path: &str, value: &str) -> bool {
        let updated = self.settings.set(path, value);
        if updated {
            match path {
                "cpu.jit" => {
                    self.jit_enabled
                        .store(self.settings.get_bool("cpu.jit", true), Ordering::Relaxed);
                }
                "cpu.jit_self_heal" => {
                    crash_guard::set_self_heal(
                        self.settings.get_bool("cpu.jit_self_heal", false),
                    );
                }
                _ => {}
            }
            self.settings.save_best_effort();
        }
        updated
    }

    pub fn login_user(&self, user_id: &str) {
        *self.user.lock() = user_id.to_owned();
        info!("user {user_id} logged in");
    }

    pub fn user(&self) -> String {
        self.user.lock().clone()
    }

    pub fn overlay_pad_data(&self, pad: PadState) {
        *self.pad.lock() = pad;
    }

    pub fn pad_state(&self) -> PadState {
        *self.pad.lock()
    }

    pub fn surface_event(&self, _surface: usize, event: i32) -> bool {
        info!("surface event {event}");
        true
    }

    pub fn usb_device_event(&self, fd: i32, vendor: i32, product: i32, event: i32) -> bool {
        info!("usb device event fd={fd} {vendor:04x}:{product:04x} event={event}");
        true
    }

    /// Swaps in a custom graphics driver handle, returning the previous
    /// one. The engine only stores it; the renderer decides what to load.
    pub fn set_custom_driver(&self, handle: usize) -> usize {
        std::mem::replace(&mut *self.custom_driver.lock(), handle)
    }

    /// Sniffs the head of an open file descriptor for installable-media
    /// magic without taking ownership of the descriptor.
    pub fn is_installable_fd(&self, fd: i32) -> bool {
        matches!(sniff_magic(fd), Some(Media::Package | Media::Firmware))
    }

    pub fn install(&self, fd: i32, progress_id: i64) -> bool {
        match sniff_magic(fd) {
            Some(Media::Package) => {
                info!("package install accepted (fd {fd}, progress {progress_id})");
                true
            }
            _ => {
                warn!("install rejected: fd {fd} is not a guest package");
                false
            }
        }
    }

    pub fn install_firmware(&self, fd: i32, progress_id: i64) -> bool {
        match sniff_magic(fd) {
            Some(Media::Firmware) => {
                info!("firmware install accepted (fd {fd}, progress {progress_id})");
                true
            }
            _ => {
                warn!("firmware install rejected: fd {fd} has no update magic");
                false
            }
        }
    }

    /// Wipes every persistent cache artifact (shader tiers, pipeline blob).
    pub fn purge_all_caches(&self) {
        if let Err(e) = self.shader_cache.purge() {
            warn!("shader cache purge failed: {e}");
        }
        let _ = std::fs::remove_file(self.root_dir.join("cache/pipeline_cache.bin"));
        let _ = std::fs::remove_file(self.root_dir.join("cache/pipeline_cache.meta"));
        info!("all persistent caches purged");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Belt and braces if the host skipped shutdown(): no executor may
        // outlive the window.
        self.kill();
    }
}

pub type ShaderCompilerFn = Arc<dyn Fn(&[u8], &CompileOptions) -> Vec<u8> + Send + Sync>;

#[derive(Debug, PartialEq, Eq)]
enum Media {
    Package,
    Firmware,
}

fn sniff_magic(fd: i32) -> Option<Media> {
    let mut head = [0u8; 8];
    let got = unsafe {
        libc::pread(
            fd,
            head.as_mut_ptr() as *mut libc::c_void,
            head.len(),
            0,
        )
    };
    if got < 5 {
        return None;
    }
    if head[..4] == PKG_MAGIC {
        Some(Media::Package)
    } else if head[..5] == PUP_MAGIC {
        Some(Media::Firmware)
    } else {
        None
    }
}

fn default_syscall_handler(state: &mut cellvm_isa::PpuState) {
    // Platform services live outside the core. The default handler
    // acknowledges the call: r3 = success.
    log::debug!(
        "guest syscall {} at pc {:#x}",
        state.gpr[11],
        state.pc
    );
    state.gpr[3] = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    fn engine(dir: &Path) -> Engine {
        let mut config = EngineConfig::new(dir, "tester");
        config.gpu_identity = "test-gpu".into();
        config.code_cache_bytes = 4 * 1024 * 1024;
        Engine::new(config).unwrap()
    }

    #[test]
    fn lifecycle_boot_run_kill() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        assert_eq!(engine.state(), LifecycleState::Stopped);

        // A tiny guest program: li r3, 1 ; rfid.
        let image_path = dir.path().join("demo.bin");
        let mut words = Vec::new();
        for w in [0x3860_0001u32, 0x4C00_0024] {
            words.extend_from_slice(&w.to_be_bytes());
        }
        std::fs::write(&image_path, words).unwrap();

        engine.boot(&image_path).unwrap();
        assert_eq!(engine.state(), LifecycleState::Running);
        assert_eq!(engine.title_id().as_deref(), Some("demo"));
        // Booting twice is refused while running.
        assert!(engine.boot(&image_path).is_err());
        engine.kill();
        assert_eq!(engine.state(), LifecycleState::Stopped);
        engine.shutdown();
    }

    #[test]
    fn guest_write_invalidates_overlapping_blocks() {
        // Self-modifying code through the host-side write path.
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let pc = 0x3_0000;
        engine
            .guest_write(pc as u64, &0x3863_0001u32.to_be_bytes())
            .unwrap();
        engine
            .guest_write(pc as u64 + 4, &0x4E80_0020u32.to_be_bytes())
            .unwrap();
        engine
            .compiler
            .compile_baseline(&engine.window, pc)
            .unwrap();
        assert!(engine.block_cache().lookup(pc).is_some());

        // Overwrite the first instruction: the block must disappear before
        // the next lookup.
        engine
            .guest_write(pc as u64, &0x3863_0002u32.to_be_bytes())
            .unwrap();
        assert!(engine.block_cache().lookup(pc).is_none());
        engine.shutdown();
    }

    #[test]
    fn pad_and_user_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.overlay_pad_data(PadState {
            digital1: 0x40,
            digital2: 0,
            left_stick: (127, -127),
            right_stick: (0, 64),
        });
        assert_eq!(engine.pad_state().digital1, 0x40);
        engine.login_user("00000002");
        assert_eq!(engine.user(), "00000002");
        engine.shutdown();
    }

    #[test]
    fn installable_media_sniffing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());

        let mut pkg = std::fs::File::create(dir.path().join("game.pkg")).unwrap();
        pkg.write_all(&[0x7F, b'P', b'K', b'G', 0, 0, 0, 1]).unwrap();
        let pkg = std::fs::File::open(dir.path().join("game.pkg")).unwrap();
        assert!(engine.is_installable_fd(pkg.as_raw_fd()));
        assert!(engine.install(pkg.as_raw_fd(), 1));
        assert!(!engine.install_firmware(pkg.as_raw_fd(), 1));

        let mut pup = std::fs::File::create(dir.path().join("update.pup")).unwrap();
        pup.write_all(b"SCEUF\0\0\0").unwrap();
        let pup = std::fs::File::open(dir.path().join("update.pup")).unwrap();
        assert!(engine.is_installable_fd(pup.as_raw_fd()));
        assert!(engine.install_firmware(pup.as_raw_fd(), 2));
        assert!(!engine.install(pup.as_raw_fd(), 2));

        let mut other = std::fs::File::create(dir.path().join("notes.txt")).unwrap();
        other.write_all(b"hello world").unwrap();
        let other = std::fs::File::open(dir.path().join("notes.txt")).unwrap();
        assert!(!engine.is_installable_fd(other.as_raw_fd()));
        engine.shutdown();
    }

    #[test]
    fn shader_miss_compiles_on_the_pool_then_hits() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        // A toy compiler: the "pipeline" is the bytecode, reversed.
        engine.set_shader_compiler(Arc::new(|bytecode, _| {
            let mut out = bytecode.to_vec();
            out.reverse();
            out
        }));
        let options = CompileOptions::default();
        let artifact = engine
            .shader_lookup(b"fragment-shader", &options)
            .expect("compile lands within the wait");
        assert_eq!(artifact.bytes, b"redahs-tnemgarf");
        // Second lookup is a pure cache hit.
        let again = engine.shader_lookup(b"fragment-shader", &options).unwrap();
        assert_eq!(again.key, artifact.key);
        engine.shutdown();
        // The flush persisted it for the next run.
        assert_eq!(engine.shader_cache().disk_artifact_count(), 1);
    }

    #[test]
    fn shader_miss_without_a_compiler_reports_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        assert!(engine
            .shader_lookup(b"orphan", &CompileOptions::default())
            .is_none());
        engine.shutdown();
    }

    #[test]
    fn settings_toggle_reaches_the_jit_switch() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        assert!(engine.jit_enabled.load(Ordering::Relaxed));
        assert!(engine.settings_set("cpu.jit", "false"));
        assert!(!engine.jit_enabled.load(Ordering::Relaxed));
        assert_eq!(engine.settings_get("cpu.jit").as_deref(), Some("false"));
        engine.shutdown();
    }
}
