use bitflags::bitflags;

// FNV-1a, the cheapest stable 64-bit content hash that survives process
// restarts. Keys land in file names, so they must never depend on a seeded
// hasher.
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

pub(crate) struct Fnv1a(u64);

impl Fnv1a {
    pub fn new() -> Self {
        Fnv1a(FNV_OFFSET)
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    pub fn finish(&self) -> u64 {
        self.0
    }
}

bitflags! {
    /// Toggles that change the produced pipeline bytes and therefore belong
    /// in the artifact key.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct CompileFlags: u32 {
        const FAST_MATH = 1 << 0;
        const DEBUG_INFO = 1 << 1;
        const POSITION_INVARIANT = 1 << 2;
    }
}

/// Options a shader is compiled under. Part of the artifact key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct CompileOptions {
    pub flags: CompileFlags,
    pub optimization_level: u8,
}

/// The host the on-disk tiers were written for. A mismatch against the
/// running process invalidates them wholesale.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostIdentity {
    /// Host graphics device identifier.
    pub gpu: String,
    /// Build identifier of this library.
    pub build: String,
}

impl HostIdentity {
    pub fn new(gpu: impl Into<String>, build: impl Into<String>) -> Self {
        HostIdentity {
            gpu: gpu.into(),
            build: build.into(),
        }
    }
}

/// The artifact key: a pure function of the shader bytecode, the compile
/// options, and the host identity.
pub fn artifact_key(bytecode: &[u8], options: &CompileOptions, identity: &HostIdentity) -> u64 {
    let mut h = Fnv1a::new();
    h.update(bytecode);
    h.update(&options.flags.bits().to_le_bytes());
    h.update(&[options.optimization_level]);
    h.update(identity.gpu.as_bytes());
    h.update(&[b';']);
    h.update(identity.build.as_bytes());
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_a_pure_function_of_inputs() {
        let id = HostIdentity::new("adreno-750", "b1");
        let opts = CompileOptions::default();
        let a = artifact_key(b"shader", &opts, &id);
        let b = artifact_key(b"shader", &opts, &id);
        assert_eq!(a, b);
    }

    #[test]
    fn key_distinguishes_every_input() {
        let id = HostIdentity::new("adreno-750", "b1");
        let opts = CompileOptions::default();
        let base = artifact_key(b"shader", &opts, &id);
        assert_ne!(base, artifact_key(b"shader2", &opts, &id));
        let fast = CompileOptions {
            flags: CompileFlags::FAST_MATH,
            ..opts
        };
        assert_ne!(base, artifact_key(b"shader", &fast, &id));
        let other_build = HostIdentity::new("adreno-750", "b2");
        assert_ne!(base, artifact_key(b"shader", &opts, &other_build));
    }

    #[test]
    fn fnv_vector() {
        // Classic FNV-1a test vector.
        let mut h = Fnv1a::new();
        h.update(b"");
        assert_eq!(h.finish(), 0xcbf2_9ce4_8422_2325);
        let mut h = Fnv1a::new();
        h.update(b"a");
        assert_eq!(h.finish(), 0xaf63_dc4c_8601_ec8c);
    }
}
