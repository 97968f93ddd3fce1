//! The on-disk tiers: per-artifact files (L2), the compressed append-only
//! archive (L3), and the host-identity sidecar both share.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, info, warn};

use crate::key::HostIdentity;
use crate::CacheError;

/// Bumped whenever the record layout changes; part of the sidecar contract.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// The sidecar metadata record that validates an on-disk tier against the
/// current process. Text, one `key=value` per line, then one artifact key
/// per line.
#[derive(Debug, PartialEq, Eq)]
pub struct Sidecar {
    pub version: u32,
    pub identity: HostIdentity,
    pub keys: Vec<u64>,
}

impl Sidecar {
    pub fn new(identity: &HostIdentity) -> Self {
        Sidecar {
            version: CACHE_FORMAT_VERSION,
            identity: identity.clone(),
            keys: Vec::new(),
        }
    }

    pub fn read(path: &Path) -> Option<Sidecar> {
        let text = fs::read_to_string(path).ok()?;
        let mut version = None;
        let mut build = None;
        let mut gpu = None;
        let mut keys = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(v) = line.strip_prefix("version=") {
                version = v.parse().ok();
            } else if let Some(v) = line.strip_prefix("build=") {
                build = Some(v.to_owned());
            } else if let Some(v) = line.strip_prefix("gpu=") {
                gpu = Some(v.to_owned());
            } else {
                keys.push(u64::from_str_radix(line, 16).ok()?);
            }
        }
        Some(Sidecar {
            version: version?,
            identity: HostIdentity {
                gpu: gpu?,
                build: build?,
            },
            keys,
        })
    }

    /// Atomically replaces the sidecar: temp file in the same directory,
    /// then rename over the destination.
    pub fn write(&self, path: &Path) -> Result<(), CacheError> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        writeln!(tmp, "version={}", self.version)?;
        writeln!(tmp, "build={}", self.identity.build)?;
        writeln!(tmp, "gpu={}", self.identity.gpu)?;
        for key in &self.keys {
            writeln!(tmp, "{key:016x}")?;
        }
        tmp.persist(path).map_err(|e| CacheError::Io(e.error))?;
        Ok(())
    }

    /// True when this sidecar was written by the running host.
    pub fn matches(&self, identity: &HostIdentity) -> bool {
        self.version == CACHE_FORMAT_VERSION && self.identity == *identity
    }
}

fn artifact_file_name(key: u64) -> String {
    format!("{key:016x}.bin")
}

/// L2: one uncompressed file per artifact inside a dedicated directory,
/// validated as a whole by the sidecar next to it.
pub struct DiskTier {
    dir: PathBuf,
    sidecar_path: PathBuf,
    identity: HostIdentity,
}

impl DiskTier {
    /// Opens the tier, discarding every stale artifact first if the sidecar
    /// does not match the current host identity.
    pub fn open(dir: PathBuf, identity: HostIdentity) -> Result<Self, CacheError> {
        let sidecar_path = dir.with_extension("meta");
        let tier = DiskTier {
            dir,
            sidecar_path,
            identity,
        };
        fs::create_dir_all(&tier.dir)?;
        match Sidecar::read(&tier.sidecar_path) {
            Some(meta) if meta.matches(&tier.identity) => {
                debug!(
                    "shader cache tier at {} is valid ({} keys listed)",
                    tier.dir.display(),
                    meta.keys.len()
                );
            }
            Some(_) => {
                info!(
                    "host identity changed, discarding shader cache tier at {}",
                    tier.dir.display()
                );
                tier.wipe()?;
            }
            None if tier.dir.read_dir()?.next().is_some() => {
                info!(
                    "shader cache tier at {} has no sidecar, discarding",
                    tier.dir.display()
                );
                tier.wipe()?;
            }
            None => {}
        }
        Ok(tier)
    }

    pub fn load(&self, key: u64) -> Option<Vec<u8>> {
        let path = self.dir.join(artifact_file_name(key));
        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("failed to read {}: {e}", path.display());
                None
            }
        }
    }

    pub fn store(&self, key: u64, bytes: &[u8]) -> Result<(), CacheError> {
        let path = self.dir.join(artifact_file_name(key));
        fs::write(&path, bytes)?;
        Ok(())
    }

    pub fn contains(&self, key: u64) -> bool {
        self.dir.join(artifact_file_name(key)).exists()
    }

    /// Every key currently present, from the files themselves; artifacts are
    /// self-describing and need no cross-file index.
    pub fn keys(&self) -> Vec<u64> {
        let mut keys = Vec::new();
        if let Ok(entries) = self.dir.read_dir() {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(stem) = name.strip_suffix(".bin") {
                    if let Ok(key) = u64::from_str_radix(stem, 16) {
                        keys.push(key);
                    }
                }
            }
        }
        keys
    }

    pub fn file_count(&self) -> usize {
        self.keys().len()
    }

    /// Rewrites the sidecar to describe the current contents.
    pub fn commit_sidecar(&self) -> Result<(), CacheError> {
        let mut sidecar = Sidecar::new(&self.identity);
        sidecar.keys = self.keys();
        sidecar.keys.sort_unstable();
        sidecar.write(&self.sidecar_path)
    }

    pub fn wipe(&self) -> Result<(), CacheError> {
        if self.dir.exists() {
            for entry in self.dir.read_dir()?.flatten() {
                let _ = fs::remove_file(entry.path());
            }
        }
        let _ = fs::remove_file(&self.sidecar_path);
        Ok(())
    }
}

/// L3: a single append-only archive of `{key: u64 LE, length: u32 LE,
/// compressed bytes}` records, for artifacts too cold to keep uncompressed.
pub struct ArchiveTier {
    path: PathBuf,
    sidecar_path: PathBuf,
    identity: HostIdentity,
}

impl ArchiveTier {
    pub fn open(path: PathBuf, identity: HostIdentity) -> Result<Self, CacheError> {
        let sidecar_path = path.with_extension("meta");
        let tier = ArchiveTier {
            path,
            sidecar_path,
            identity,
        };
        match Sidecar::read(&tier.sidecar_path) {
            Some(meta) if meta.matches(&tier.identity) => {}
            Some(_) | None if tier.path.exists() => {
                info!(
                    "discarding stale shader archive at {}",
                    tier.path.display()
                );
                tier.wipe()?;
            }
            _ => {}
        }
        Ok(tier)
    }

    /// Scans the archive for `key` and returns the decompressed artifact.
    /// Linear, which is fine: the archive is the coldest tier and a hit
    /// immediately promotes out of it.
    pub fn load(&self, key: u64) -> Option<Vec<u8>> {
        let mut file = File::open(&self.path).ok()?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).ok()?;
        let mut pos = 0usize;
        while pos + 12 <= data.len() {
            let rec_key = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
            let len = u32::from_le_bytes(data[pos + 8..pos + 12].try_into().unwrap()) as usize;
            pos += 12;
            if pos + len > data.len() {
                warn!("truncated shader archive record at byte {pos}");
                return None;
            }
            if rec_key == key {
                let mut out = Vec::new();
                let mut dec = ZlibDecoder::new(&data[pos..pos + len]);
                if let Err(e) = dec.read_to_end(&mut out) {
                    warn!("corrupt archive record for key {key:016x}: {e}");
                    return None;
                }
                return Some(out);
            }
            pos += len;
        }
        None
    }

    pub fn append(&self, key: u64, bytes: &[u8]) -> Result<(), CacheError> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::fast());
        enc.write_all(bytes)?;
        let compressed = enc.finish()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&key.to_le_bytes())?;
        file.write_all(&(compressed.len() as u32).to_le_bytes())?;
        file.write_all(&compressed)?;
        debug!(
            "archived shader {key:016x}: {} -> {} bytes",
            bytes.len(),
            compressed.len()
        );
        Ok(())
    }

    pub fn keys(&self) -> Vec<u64> {
        let mut keys = Vec::new();
        let Ok(mut file) = File::open(&self.path) else {
            return keys;
        };
        let mut data = Vec::new();
        if file.read_to_end(&mut data).is_err() {
            return keys;
        }
        let mut pos = 0usize;
        while pos + 12 <= data.len() {
            let key = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
            let len = u32::from_le_bytes(data[pos + 8..pos + 12].try_into().unwrap()) as usize;
            keys.push(key);
            pos += 12 + len;
        }
        keys
    }

    pub fn commit_sidecar(&self) -> Result<(), CacheError> {
        let mut sidecar = Sidecar::new(&self.identity);
        sidecar.keys = self.keys();
        sidecar.write(&self.sidecar_path)
    }

    pub fn wipe(&self) -> Result<(), CacheError> {
        let _ = fs::remove_file(&self.path);
        let _ = fs::remove_file(&self.sidecar_path);
        Ok(())
    }
}

/// The persistent pipeline-cache blob handed to the host graphics API as
/// initial data. Same sidecar contract as the artifact tiers: a mismatch
/// deletes both files before anything is loaded.
pub struct PipelineBlob {
    path: PathBuf,
    sidecar_path: PathBuf,
    identity: HostIdentity,
}

impl PipelineBlob {
    pub fn open(path: PathBuf, identity: HostIdentity) -> Self {
        let sidecar_path = path.with_extension("meta");
        let blob = PipelineBlob {
            path,
            sidecar_path,
            identity,
        };
        match Sidecar::read(&blob.sidecar_path) {
            Some(meta) if meta.matches(&blob.identity) => {}
            _ => {
                if blob.path.exists() || blob.sidecar_path.exists() {
                    info!("discarding stale pipeline cache blob");
                }
                let _ = fs::remove_file(&blob.path);
                let _ = fs::remove_file(&blob.sidecar_path);
            }
        }
        blob
    }

    pub fn load(&self) -> Option<Vec<u8>> {
        fs::read(&self.path).ok()
    }

    pub fn save(&self, bytes: &[u8]) -> Result<(), CacheError> {
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.persist(&self.path).map_err(|e| CacheError::Io(e.error))?;
        Sidecar::new(&self.identity).write(&self.sidecar_path)
    }
}
