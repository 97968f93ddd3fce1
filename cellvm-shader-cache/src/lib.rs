//! A three-tier shader artifact cache.
//!
//! Guest graphics programs are expensive to turn into host pipeline objects,
//! so compiled artifacts are kept in three places: a bounded in-process LRU
//! (L1), a directory of per-artifact files (L2), and a compressed
//! append-only archive (L3). The two disk tiers carry a sidecar describing
//! the host identity (graphics device + build) they were written for; a
//! mismatch discards them wholesale so an upgraded process never loads
//! stale pipeline bytes.
//!
//! `ShaderCache` does not compile anything itself. A miss hands the caller
//! a [`CompileTicket`]; concurrent callers for the same key get a
//! [`CompileWait`] instead, which is what makes "at most one compile per
//! key" a property of the cache rather than of its callers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use schnellru::{ByLength, LruMap};
use thiserror::Error;

mod key;
mod store;

pub use key::{artifact_key, CompileFlags, CompileOptions, HostIdentity};
pub use store::{PipelineBlob, Sidecar, CACHE_FORMAT_VERSION};

use store::{ArchiveTier, DiskTier};

/// Default byte budget of the in-process tier.
pub const DEFAULT_L1_MAX_BYTES: usize = 512 * 1024 * 1024;

/// Default bound on a synchronous wait for someone else's in-flight compile.
pub const DEFAULT_SYNC_WAIT: Duration = Duration::from_millis(2000);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("shader cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which tier an artifact was last materialized from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TierOrigin {
    /// Compiled during this run; not yet on disk.
    Fresh,
    Memory,
    Disk,
    Archive,
}

/// Compiled pipeline bytes plus their key and provenance.
#[derive(Debug)]
pub struct ShaderArtifact {
    pub key: u64,
    pub bytes: Vec<u8>,
    pub origin: TierOrigin,
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub l1_hits: AtomicU64,
    pub l2_hits: AtomicU64,
    pub l3_hits: AtomicU64,
    pub misses: AtomicU64,
    pub compiles_deduplicated: AtomicU64,
}

pub struct ShaderCacheConfig {
    /// Directory holding every persistent tier.
    pub cache_dir: PathBuf,
    pub identity: HostIdentity,
    pub l1_max_bytes: usize,
    pub sync_wait: Duration,
}

impl ShaderCacheConfig {
    pub fn new(cache_dir: impl Into<PathBuf>, identity: HostIdentity) -> Self {
        ShaderCacheConfig {
            cache_dir: cache_dir.into(),
            identity,
            l1_max_bytes: DEFAULT_L1_MAX_BYTES,
            sync_wait: DEFAULT_SYNC_WAIT,
        }
    }
}

struct L1 {
    map: LruMap<u64, Arc<ShaderArtifact>, ByLength>,
    bytes: usize,
    max_bytes: usize,
}

impl L1 {
    fn insert(&mut self, artifact: Arc<ShaderArtifact>) {
        self.bytes += artifact.bytes.len();
        if let Some(old) = self.map.peek(&artifact.key) {
            // Replacing counts the old entry out first.
            self.bytes -= old.bytes.len();
        }
        self.map.insert(artifact.key, artifact);
        while self.bytes > self.max_bytes {
            match self.map.pop_oldest() {
                Some((_, evicted)) => {
                    self.bytes -= evicted.bytes.len();
                    debug!("evicted shader {:016x} from L1", evicted.key);
                }
                None => break,
            }
        }
    }
}

struct Inflight {
    slot: Mutex<Option<Option<Arc<ShaderArtifact>>>>,
    done: Condvar,
}

/// Result of a cache probe.
pub enum CacheQuery {
    /// Artifact available now.
    Hit(Arc<ShaderArtifact>),
    /// Nobody is building this key yet; the caller must compile and then
    /// [`CompileTicket::fulfill`] (or [`CompileTicket::abandon`]).
    Miss(CompileTicket),
    /// Another caller is already compiling this key.
    Pending(CompileWait),
}

/// Exclusive permission to produce the artifact for one key.
pub struct CompileTicket {
    cache: Arc<CacheShared>,
    key: u64,
    inflight: Arc<Inflight>,
}

impl CompileTicket {
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Publishes the compiled bytes to L1, wakes every waiter, and retires
    /// the in-flight entry. Duplicate fulfillments of re-submitted jobs are
    /// tolerated because the publish re-checks the tier state.
    pub fn fulfill(self, bytes: Vec<u8>) -> Arc<ShaderArtifact> {
        let artifact = Arc::new(ShaderArtifact {
            key: self.key,
            bytes,
            origin: TierOrigin::Fresh,
        });
        self.cache.l1.lock().insert(artifact.clone());
        self.finish(Some(artifact.clone()));
        artifact
    }

    /// Gives up without producing an artifact; waiters see a timeout-style
    /// miss instead of hanging.
    pub fn abandon(self) {}

    fn finish(&self, value: Option<Arc<ShaderArtifact>>) {
        {
            let mut slot = self.inflight.slot.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(value);
        }
        self.inflight.done.notify_all();
        let mut inflight = self.cache.inflight.lock();
        // Only retire our own entry; a later query may already have opened
        // a fresh one for the same key.
        if let Some(current) = inflight.get(&self.key) {
            if Arc::ptr_eq(current, &self.inflight) {
                inflight.remove(&self.key);
            }
        }
    }
}

// A ticket that goes away without fulfilling (including by panic in the
// compile job) releases the key so waiters unblock and a retry can compile.
impl Drop for CompileTicket {
    fn drop(&mut self) {
        self.finish(None);
    }
}

/// A handle on someone else's compile of the same key.
pub struct CompileWait {
    inflight: Arc<Inflight>,
    timeout: Duration,
}

impl CompileWait {
    /// Blocks until the owning compile publishes, fails, or the documented
    /// timeout elapses. `None` is the "no artifact available" path; the
    /// renderer decides what to do with it.
    pub fn wait(self) -> Option<Arc<ShaderArtifact>> {
        let mut slot = self.inflight.slot.lock();
        let deadline = std::time::Instant::now() + self.timeout;
        while slot.is_none() {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if self
                .inflight
                .done
                .wait_for(&mut slot, remaining)
                .timed_out()
            {
                return None;
            }
        }
        slot.clone().flatten()
    }
}

struct CacheShared {
    identity: HostIdentity,
    l1: Mutex<L1>,
    l2: DiskTier,
    l3: ArchiveTier,
    inflight: Mutex<FxHashMap<u64, Arc<Inflight>>>,
    sync_wait: Duration,
    stats: CacheStats,
}

/// The three-tier cache. Cheap to clone via internal `Arc`.
pub struct ShaderCache {
    shared: Arc<CacheShared>,
}

impl ShaderCache {
    /// Opens every tier under `config.cache_dir`, discarding any whose
    /// sidecar disagrees with the current host identity.
    pub fn open(config: ShaderCacheConfig) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&config.cache_dir)?;
        let l2 = DiskTier::open(
            config.cache_dir.join("shader_cache_l2"),
            config.identity.clone(),
        )?;
        let l3 = ArchiveTier::open(
            config.cache_dir.join("shader_cache_l3.bin"),
            config.identity.clone(),
        )?;
        info!(
            "shader cache open at {} ({} artifacts on disk)",
            config.cache_dir.display(),
            l2.file_count()
        );
        Ok(ShaderCache {
            shared: Arc::new(CacheShared {
                identity: config.identity,
                l1: Mutex::new(L1 {
                    map: LruMap::new(ByLength::new(u32::MAX)),
                    bytes: 0,
                    max_bytes: config.l1_max_bytes,
                }),
                l2,
                l3,
                inflight: Mutex::new(FxHashMap::default()),
                sync_wait: config.sync_wait,
                stats: CacheStats::default(),
            }),
        })
    }

    pub fn identity(&self) -> &HostIdentity {
        &self.shared.identity
    }

    pub fn stats(&self) -> &CacheStats {
        &self.shared.stats
    }

    /// The key this cache would use for `bytecode` under `options`.
    pub fn key_for(&self, bytecode: &[u8], options: &CompileOptions) -> u64 {
        artifact_key(bytecode, options, &self.shared.identity)
    }

    /// Probes L1 → L2 → L3, promoting on hit. On a cold miss the caller
    /// receives the compile ticket for this key; every concurrent caller
    /// for the same key receives a wait handle instead.
    pub fn query(&self, bytecode: &[u8], options: &CompileOptions) -> CacheQuery {
        let key = self.key_for(bytecode, options);
        if let Some(artifact) = self.lookup(key) {
            return CacheQuery::Hit(artifact);
        }
        let mut inflight = self.shared.inflight.lock();
        if let Some(existing) = inflight.get(&key) {
            self.shared
                .stats
                .compiles_deduplicated
                .fetch_add(1, Ordering::Relaxed);
            return CacheQuery::Pending(CompileWait {
                inflight: existing.clone(),
                timeout: self.shared.sync_wait,
            });
        }
        let entry = Arc::new(Inflight {
            slot: Mutex::new(None),
            done: Condvar::new(),
        });
        inflight.insert(key, entry.clone());
        CacheQuery::Miss(CompileTicket {
            cache: self.shared.clone(),
            key,
            inflight: entry,
        })
    }

    /// Direct keyed lookup with tier promotion; no compile bookkeeping.
    pub fn lookup(&self, key: u64) -> Option<Arc<ShaderArtifact>> {
        let stats = &self.shared.stats;
        if let Some(artifact) = self.shared.l1.lock().map.get(&key) {
            stats.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some(artifact.clone());
        }
        if let Some(bytes) = self.shared.l2.load(key) {
            stats.l2_hits.fetch_add(1, Ordering::Relaxed);
            let artifact = Arc::new(ShaderArtifact {
                key,
                bytes,
                origin: TierOrigin::Disk,
            });
            self.shared.l1.lock().insert(artifact.clone());
            return Some(artifact);
        }
        if let Some(bytes) = self.shared.l3.load(key) {
            stats.l3_hits.fetch_add(1, Ordering::Relaxed);
            let artifact = Arc::new(ShaderArtifact {
                key,
                bytes,
                origin: TierOrigin::Archive,
            });
            // An archive hit earns its way back into the faster tiers.
            if let Err(e) = self.shared.l2.store(key, &artifact.bytes) {
                warn!("failed to promote shader {key:016x} to L2: {e}");
            }
            self.shared.l1.lock().insert(artifact.clone());
            return Some(artifact);
        }
        stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Number of artifact files currently in the L2 directory.
    pub fn disk_artifact_count(&self) -> usize {
        self.shared.l2.file_count()
    }

    /// Writes every freshly compiled L1 artifact to L2 and rewrites the
    /// sidecars. Called at shutdown and safe to call at any time.
    pub fn flush(&self) -> Result<(), CacheError> {
        let dirty: Vec<Arc<ShaderArtifact>> = {
            let l1 = self.shared.l1.lock();
            l1.map
                .iter()
                .filter(|(_, a)| a.origin == TierOrigin::Fresh)
                .map(|(_, a)| a.clone())
                .collect()
        };
        for artifact in &dirty {
            if !self.shared.l2.contains(artifact.key) {
                self.shared.l2.store(artifact.key, &artifact.bytes)?;
            }
        }
        self.shared.l2.commit_sidecar()?;
        self.shared.l3.commit_sidecar()?;
        if !dirty.is_empty() {
            info!("flushed {} fresh shader artifacts to disk", dirty.len());
        }
        Ok(())
    }

    /// Moves every L2 artifact into the compressed archive and empties L2.
    /// Long-term storage for rarely used artifacts.
    pub fn consolidate_to_archive(&self) -> Result<(), CacheError> {
        let archived: Vec<u64> = self.shared.l3.keys();
        let mut moved = 0usize;
        for key in self.shared.l2.keys() {
            if archived.contains(&key) {
                continue;
            }
            if let Some(bytes) = self.shared.l2.load(key) {
                self.shared.l3.append(key, &bytes)?;
                moved += 1;
            }
        }
        self.shared.l2.wipe()?;
        self.shared.l3.commit_sidecar()?;
        if moved > 0 {
            info!("consolidated {moved} shader artifacts into the archive");
        }
        Ok(())
    }

    /// Drops every tier, memory and disk.
    pub fn purge(&self) -> Result<(), CacheError> {
        {
            let mut l1 = self.shared.l1.lock();
            l1.map.clear();
            l1.bytes = 0;
        }
        self.shared.l2.wipe()?;
        self.shared.l3.wipe()?;
        info!("shader cache purged");
        Ok(())
    }
}

impl Clone for ShaderCache {
    fn clone(&self) -> Self {
        ShaderCache {
            shared: self.shared.clone(),
        }
    }
}

/// Opens the pipeline-cache blob under the same directory scheme.
pub fn open_pipeline_blob(cache_dir: &Path, identity: &HostIdentity) -> PipelineBlob {
    PipelineBlob::open(cache_dir.join("pipeline_cache.bin"), identity.clone())
}
