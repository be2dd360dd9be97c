// crypto/mod.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Root for all crypto modules, and the context object that owns all key state.

pub mod aes;
pub mod keydb;
pub mod seed;
pub mod sha;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use crate::crypto::aes::AesEngine;
use crate::crypto::keydb::{KeyDatabase, KeyDbError};
use crate::crypto::seed::SeedResolver;

/// Locations that key material and seeds are loaded from.
#[derive(Debug, Clone, Default)]
pub struct ContextConfig {
    /// Directories searched for aeskeydb.bin, seeddb.bin and legacy key files, in order.
    pub support_dirs: Vec<PathBuf>,
    /// Mounted CTRNAND roots searched for the seed save, in order.
    pub nand_roots: Vec<PathBuf>,
    /// A key database to apply in full when the context is created.
    pub keydb_path: Option<PathBuf>,
}

/// Everything that holds key state: the AES engine with its keyslots, the key database, and the
/// seed resolver. Operations that need keys take a mutable reference to one of these, so only one
/// of them can run against a context at a time.
pub struct CryptoContext {
    pub aes: AesEngine,
    pub keydb: KeyDatabase,
    pub seeds: SeedResolver,
}

/// A context that can be shared between threads.
pub type SharedCryptoContext = Arc<Mutex<CryptoContext>>;

impl CryptoContext {
    /// Creates a context with an empty engine and no key or seed sources.
    pub fn new() -> Self {
        CryptoContext {
            aes: AesEngine::new(),
            keydb: KeyDatabase::new(Vec::new()),
            seeds: SeedResolver::new(Vec::new(), Vec::new()),
        }
    }

    /// Creates a context from a config, applying the configured key database (or the whitelisted
    /// keys of the support directory database when none was given).
    pub fn from_config(config: &ContextConfig) -> Result<Self, KeyDbError> {
        let mut ctx = CryptoContext {
            aes: AesEngine::new(),
            keydb: KeyDatabase::new(config.support_dirs.clone()),
            seeds: SeedResolver::new(config.nand_roots.clone(), config.support_dirs.clone()),
        };
        ctx.keydb.init_key_database(&mut ctx.aes, config.keydb_path.as_deref())?;
        Ok(ctx)
    }

    pub fn into_shared(self) -> SharedCryptoContext {
        Arc::new(Mutex::new(self))
    }
}

impl Default for CryptoContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aes::KeyComponent;
    use std::fs;

    #[test]
    fn test_from_config_applies_keydb() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = vec![0u8; 0x20];
        record[0] = 0x25;
        record[1] = b'X';
        fs::write(dir.path().join(keydb::KEYDB_NAME), &record).unwrap();
        let config = ContextConfig {
            support_dirs: vec![dir.path().to_path_buf()],
            ..Default::default()
        };
        let ctx = CryptoContext::from_config(&config).unwrap();
        assert!(ctx.aes.state().is_loaded(0x25, KeyComponent::X));
    }

    #[test]
    fn test_shared_context() {
        let shared = CryptoContext::new().into_shared();
        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                let mut ctx = shared.lock().unwrap();
                ctx.aes.setup_key(0x11, KeyComponent::Normal, &[1; 16]).unwrap();
            })
        };
        worker.join().unwrap();
        assert!(shared.lock().unwrap().aes.state().is_loaded(0x11, KeyComponent::Normal));
    }
}
