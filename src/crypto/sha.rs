// crypto/sha.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements a streaming SHA engine. Digests are always handed out in a 32-byte buffer, with
// anything past the end of a shorter digest left as zeroes.

use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256};

pub const SHA_BUFFER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaMode {
    Sha1,
    Sha224,
    Sha256,
}

impl ShaMode {
    /// Gets the size of the digest produced by this mode.
    pub fn digest_size(&self) -> usize {
        match self {
            ShaMode::Sha1 => 20,
            ShaMode::Sha224 => 28,
            ShaMode::Sha256 => 32,
        }
    }
}

#[derive(Clone)]
enum ShaState {
    Sha1(Sha1),
    Sha224(Sha224),
    Sha256(Sha256),
}

impl ShaState {
    fn new(mode: ShaMode) -> Self {
        match mode {
            ShaMode::Sha1 => ShaState::Sha1(Sha1::new()),
            ShaMode::Sha224 => ShaState::Sha224(Sha224::new()),
            ShaMode::Sha256 => ShaState::Sha256(Sha256::new()),
        }
    }
}

/// A stateful hash engine. Data can be fed in with any number of `update` calls of any size
/// before the digest is collected with `get`.
#[derive(Clone)]
pub struct ShaEngine {
    mode: ShaMode,
    state: ShaState,
}

impl ShaEngine {
    pub fn new(mode: ShaMode) -> Self {
        ShaEngine {
            mode,
            state: ShaState::new(mode),
        }
    }

    /// Resets the engine and switches it to the given mode.
    pub fn init(&mut self, mode: ShaMode) {
        self.mode = mode;
        self.state = ShaState::new(mode);
    }

    pub fn mode(&self) -> ShaMode {
        self.mode
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            ShaState::Sha1(hasher) => hasher.update(data),
            ShaState::Sha224(hasher) => hasher.update(data),
            ShaState::Sha256(hasher) => hasher.update(data),
        }
    }

    /// Finalizes the digest and resets the engine for the same mode.
    pub fn get(&mut self) -> [u8; SHA_BUFFER_SIZE] {
        let mut digest = [0u8; SHA_BUFFER_SIZE];
        match &mut self.state {
            ShaState::Sha1(hasher) => digest[..20].copy_from_slice(&hasher.finalize_reset()),
            ShaState::Sha224(hasher) => digest[..28].copy_from_slice(&hasher.finalize_reset()),
            ShaState::Sha256(hasher) => digest.copy_from_slice(&hasher.finalize_reset()),
        }
        digest
    }
}

/// Hashes a buffer in one go.
pub fn sha_quick(data: &[u8], mode: ShaMode) -> [u8; SHA_BUFFER_SIZE] {
    let mut engine = ShaEngine::new(mode);
    engine.update(data);
    engine.get()
}

/// Shorthand for the SHA-256 of a buffer, which is what nearly every container uses.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    sha_quick(data, ShaMode::Sha256)
}

/// Compares a buffer's digest against an expected one. The comparison always covers the full
/// 32-byte buffer, so a shorter expected digest must be zero padded.
pub fn sha_cmp(expected: &[u8; SHA_BUFFER_SIZE], data: &[u8], mode: ShaMode) -> bool {
    sha_quick(data, mode) == *expected
}
