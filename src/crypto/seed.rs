// crypto/seed.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements the structures and methods required for finding and validating the seeds used by
// seed-encrypted NCCHs, from the NAND seed save or from a seeddb.bin file.

use std::fs::{self, File};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};
use thiserror::Error;
use crate::crypto::sha::sha256;
use crate::nand;
use crate::nand::disa;

pub const SEEDDB_NAME: &str = "seeddb.bin";
pub const SEEDSAVE_ID: u32 = 0x0001000F;
pub const SEEDSAVE_AREA_OFFSET: u64 = 0x4000;
pub const SEEDSAVE_MAX_ENTRIES: usize = 2000;
pub const SEEDSAVE_DB_SIZE: usize = 0x1000 + SEEDSAVE_MAX_ENTRIES * (8 + 16);
const SEEDDB_HEADER_SIZE: usize = 0x10;
const SEEDDB_ENTRY_SIZE: usize = 0x20;

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("no valid seed could be found for title {0:016X}")]
    SeedNotFound(u64),
    #[error("seed does not match the seed hash of title {0:016X}")]
    HashMismatch(u64),
    #[error("seed database is not valid (claims {count} entries but only has room for {capacity})")]
    InvalidSeedDb { count: u32, capacity: usize },
    #[error("seed save could not be read")]
    Disa(#[from] disa::DisaError),
    #[error("NAND could not be accessed")]
    Nand(#[from] nand::NandError),
    #[error("seed data is not in a valid format")]
    IO(#[from] std::io::Error),
}

/// Gets the 4-byte seed check value for a seed and title ID, as stored in NCCH headers.
pub fn seed_hash(seed: &[u8; 16], title_id: u64) -> [u8; 4] {
    let mut data = [0u8; 24];
    data[..16].copy_from_slice(seed);
    data[16..].copy_from_slice(&title_id.to_le_bytes());
    let hash = sha256(&data);
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Checks a seed against the seed check value found in a title's NCCH header.
pub fn validate_seed(seed: &[u8; 16], title_id: u64, expected: &[u8; 4]) -> bool {
    seed_hash(seed, title_id) == *expected
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedInfoEntry {
    pub title_id: u64,
    pub seed: [u8; 16],
    reserved: [u8; 8],
}

/// The contents of a seeddb.bin file.
#[derive(Debug, Clone, Default)]
pub struct SeedInfo {
    pub entries: Vec<SeedInfoEntry>,
}

impl SeedInfo {
    pub fn new() -> Self {
        SeedInfo { entries: Vec::new() }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SeedError> {
        let mut buf = Cursor::new(data);
        let count = buf.read_u32::<LittleEndian>()?;
        let capacity = data.len().saturating_sub(SEEDDB_HEADER_SIZE) / SEEDDB_ENTRY_SIZE;
        if count as usize > capacity {
            return Err(SeedError::InvalidSeedDb { count, capacity });
        }
        buf.seek(SeekFrom::Start(SEEDDB_HEADER_SIZE as u64))?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let title_id = buf.read_u64::<LittleEndian>()?;
            let mut seed = [0u8; 16];
            buf.read_exact(&mut seed)?;
            let mut reserved = [0u8; 8];
            buf.read_exact(&mut reserved)?;
            entries.push(SeedInfoEntry { title_id, seed, reserved });
        }
        Ok(SeedInfo { entries })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut buf: Vec<u8> = Vec::with_capacity(SEEDDB_HEADER_SIZE + self.entries.len() * SEEDDB_ENTRY_SIZE);
        buf.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        buf.resize(SEEDDB_HEADER_SIZE, 0);
        for entry in &self.entries {
            buf.write_u64::<LittleEndian>(entry.title_id)?;
            buf.write_all(&entry.seed)?;
            buf.write_all(&entry.reserved)?;
        }
        Ok(buf)
    }

    /// Finds a seed for a title that also matches the title's seed check value.
    pub fn find(&self, title_id: u64, hash_seed: &[u8; 4]) -> Option<[u8; 16]> {
        self.entries.iter()
            .filter(|entry| entry.title_id == title_id)
            .map(|entry| entry.seed)
            .find(|seed| validate_seed(seed, title_id, hash_seed))
    }

    /// Adds a seed, replacing any existing seed for the same title. Returns false if the exact
    /// entry was already present.
    pub fn add(&mut self, title_id: u64, seed: [u8; 16]) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.title_id == title_id) {
            if entry.seed == seed {
                return false;
            }
            entry.seed = seed;
            return true;
        }
        self.entries.push(SeedInfoEntry { title_id, seed, reserved: [0; 8] });
        true
    }
}

/// The fixed 2000 entry seed table stored in the NAND seed save.
#[derive(Debug, Clone)]
pub struct SeedSaveDb {
    pub n_entries: u32,
    pub title_ids: Vec<u64>,
    pub seeds: Vec<[u8; 16]>,
}

impl SeedSaveDb {
    pub fn from_bytes(data: &[u8]) -> Result<Self, SeedError> {
        let mut buf = Cursor::new(data);
        let _unknown = buf.read_u32::<LittleEndian>()?;
        let n_entries = buf.read_u32::<LittleEndian>()?;
        buf.seek(SeekFrom::Start(0x1000))?;
        let mut title_ids = Vec::with_capacity(SEEDSAVE_MAX_ENTRIES);
        for _ in 0..SEEDSAVE_MAX_ENTRIES {
            title_ids.push(buf.read_u64::<LittleEndian>()?);
        }
        let mut seeds = Vec::with_capacity(SEEDSAVE_MAX_ENTRIES);
        for _ in 0..SEEDSAVE_MAX_ENTRIES {
            let mut seed = [0u8; 16];
            buf.read_exact(&mut seed)?;
            seeds.push(seed);
        }
        Ok(SeedSaveDb { n_entries, title_ids, seeds })
    }

    /// Scans every slot of the table, since the entry count is not reliable.
    pub fn find(&self, title_id: u64, hash_seed: &[u8; 4]) -> Option<[u8; 16]> {
        self.title_ids.iter()
            .zip(self.seeds.iter())
            .filter(|(tid, _)| **tid == title_id)
            .map(|(_, seed)| *seed)
            .find(|seed| validate_seed(seed, title_id, hash_seed))
    }
}

/// Resolves seeds for seed-encrypted titles. Sources are tried in order: the last seed found,
/// the seed save of each NAND, then seeddb.bin from the support directories. A seed is only
/// accepted if it matches the title's seed check value.
pub struct SeedResolver {
    cache: Option<(u64, [u8; 16])>,
    nand_roots: Vec<PathBuf>,
    support_dirs: Vec<PathBuf>,
}

impl SeedResolver {
    pub fn new(nand_roots: Vec<PathBuf>, support_dirs: Vec<PathBuf>) -> Self {
        SeedResolver {
            cache: None,
            nand_roots,
            support_dirs,
        }
    }

    /// Gets the NAND roots that seed saves are looked up in.
    pub fn nand_roots(&self) -> &[PathBuf] {
        &self.nand_roots
    }

    fn find_in_nand(nand_root: &Path, title_id: u64, hash_seed: &[u8; 4]) -> Result<Option<[u8; 16]>, SeedError> {
        let path = nand::system_save_path(nand_root, SEEDSAVE_ID)?;
        let mut file = File::open(path)?;
        let mut data = vec![0u8; SEEDSAVE_DB_SIZE];
        disa::read_lvl4(&mut file, SEEDSAVE_AREA_OFFSET, &mut data)?;
        Ok(SeedSaveDb::from_bytes(&data)?.find(title_id, hash_seed))
    }

    fn find_in_seeddb(&self, title_id: u64, hash_seed: &[u8; 4]) -> Option<[u8; 16]> {
        self.support_dirs.iter()
            .map(|dir| dir.join(SEEDDB_NAME))
            .find(|path| path.is_file())
            .and_then(|path| fs::read(path).ok())
            .and_then(|data| SeedInfo::from_bytes(&data).ok())
            .and_then(|seeddb| seeddb.find(title_id, hash_seed))
    }

    pub fn resolve_seed(&mut self, title_id: u64, hash_seed: &[u8; 4]) -> Result<[u8; 16], SeedError> {
        if let Some((cached_tid, seed)) = self.cache {
            if cached_tid == title_id && validate_seed(&seed, title_id, hash_seed) {
                return Ok(seed);
            }
        }
        let mut found = None;
        for root in &self.nand_roots {
            match Self::find_in_nand(root, title_id, hash_seed) {
                Ok(Some(seed)) => {
                    debug!("seed for {:016X} found in seed save of {}", title_id, root.display());
                    found = Some(seed);
                    break;
                },
                Ok(None) => (),
                Err(err) => debug!("skipping seed save of {}: {}", root.display(), err),
            }
        }
        if found.is_none() {
            found = self.find_in_seeddb(title_id, hash_seed);
        }
        let seed = found.ok_or(SeedError::SeedNotFound(title_id))?;
        self.cache = Some((title_id, seed));
        Ok(seed)
    }

    /// Remembers a seed so that following lookups for this title succeed without a database.
    pub fn add_known_seed(&mut self, title_id: u64, seed: [u8; 16]) {
        self.cache = Some((title_id, seed));
    }
}

/// Adds a seed to a seeddb.bin file, creating the file if needed. If the title's seed check value
/// is known the seed is validated against it first.
pub fn install_seed(path: &Path, title_id: u64, seed: [u8; 16], hash_seed: Option<&[u8; 4]>) -> Result<bool, SeedError> {
    if let Some(hash_seed) = hash_seed {
        if !validate_seed(&seed, title_id, hash_seed) {
            return Err(SeedError::HashMismatch(title_id));
        }
    }
    let mut seeddb = if path.exists() {
        SeedInfo::from_bytes(&fs::read(path)?)?
    } else {
        SeedInfo::new()
    };
    let changed = seeddb.add(title_id, seed);
    if changed {
        fs::write(path, seeddb.to_bytes()?)?;
        info!("installed seed for {:016X} to {}", title_id, path.display());
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TITLE_ID: u64 = 0x0004000000123400;

    fn write_seeddb(dir: &Path, entries: &[(u64, [u8; 16])]) {
        let mut seeddb = SeedInfo::new();
        for (tid, seed) in entries {
            seeddb.entries.push(SeedInfoEntry { title_id: *tid, seed: *seed, reserved: [0; 8] });
        }
        fs::write(dir.join(SEEDDB_NAME), seeddb.to_bytes().unwrap()).unwrap();
    }

    fn write_seed_save(nand_root: &Path, entries: &[(u64, [u8; 16])]) {
        let mut table = vec![0u8; SEEDSAVE_DB_SIZE];
        table[4..8].copy_from_slice(&(entries.len() as u32).to_le_bytes());
        for (i, (tid, seed)) in entries.iter().enumerate() {
            table[0x1000 + i * 8..0x1000 + i * 8 + 8].copy_from_slice(&tid.to_le_bytes());
            let seed_offset = 0x1000 + SEEDSAVE_MAX_ENTRIES * 8 + i * 16;
            table[seed_offset..seed_offset + 16].copy_from_slice(seed);
        }
        let mut lvl4 = vec![0u8; SEEDSAVE_AREA_OFFSET as usize];
        lvl4.extend(table);
        fs::create_dir_all(nand_root.join("private")).unwrap();
        fs::write(nand_root.join(nand::MOVABLE_PATH), vec![0u8; 0x140]).unwrap();
        let save_dir = nand_root.join("data").join(nand::id0_from_key_y(&[0; 16])).join("sysdata/0001000f");
        fs::create_dir_all(&save_dir).unwrap();
        fs::write(save_dir.join("00000000"), disa::build_test_disa(&lvl4)).unwrap();
    }

    #[test]
    fn test_seeddb_parse() {
        let mut seeddb = SeedInfo::new();
        assert!(seeddb.add(TITLE_ID, [1; 16]));
        assert!(!seeddb.add(TITLE_ID, [1; 16]));
        assert!(seeddb.add(TITLE_ID, [2; 16]));
        assert!(seeddb.add(TITLE_ID + 0x100, [3; 16]));
        let data = seeddb.to_bytes().unwrap();
        assert_eq!(data.len(), 0x10 + 2 * 0x20);
        let parsed = SeedInfo::from_bytes(&data).unwrap();
        assert_eq!(parsed.entries, seeddb.entries);
    }

    #[test]
    fn test_seeddb_bad_count() {
        let mut data = vec![0u8; 0x30];
        data[0] = 2;
        assert!(matches!(SeedInfo::from_bytes(&data), Err(SeedError::InvalidSeedDb { count: 2, capacity: 1 })));
    }

    #[test]
    fn test_resolve_from_seeddb() {
        let dir = tempfile::tempdir().unwrap();
        let seed = [0x5E; 16];
        write_seeddb(dir.path(), &[(TITLE_ID, seed)]);
        let mut resolver = SeedResolver::new(vec![], vec![dir.path().to_path_buf()]);
        let hash = seed_hash(&seed, TITLE_ID);
        assert_eq!(resolver.resolve_seed(TITLE_ID, &hash).unwrap(), seed);
        // The cached seed is used once the file is gone.
        fs::remove_file(dir.path().join(SEEDDB_NAME)).unwrap();
        assert_eq!(resolver.resolve_seed(TITLE_ID, &hash).unwrap(), seed);
    }

    #[test]
    fn test_hash_gate_keeps_searching() {
        let dir = tempfile::tempdir().unwrap();
        let nand = tempfile::tempdir().unwrap();
        let good = [0x11; 16];
        let stale = [0x22; 16];
        // The NAND seed save has a stale entry for the title, so seeddb.bin has to be used.
        write_seed_save(nand.path(), &[(TITLE_ID, stale)]);
        write_seeddb(dir.path(), &[(TITLE_ID, stale), (TITLE_ID, good)]);
        let mut resolver = SeedResolver::new(vec![nand.path().to_path_buf()], vec![dir.path().to_path_buf()]);
        let hash = seed_hash(&good, TITLE_ID);
        assert_eq!(resolver.resolve_seed(TITLE_ID, &hash).unwrap(), good);
    }

    #[test]
    fn test_hash_gate_fails_without_match() {
        let dir = tempfile::tempdir().unwrap();
        write_seeddb(dir.path(), &[(TITLE_ID, [0x22; 16])]);
        let mut resolver = SeedResolver::new(vec![], vec![dir.path().to_path_buf()]);
        let hash = seed_hash(&[0x11; 16], TITLE_ID);
        assert!(matches!(resolver.resolve_seed(TITLE_ID, &hash), Err(SeedError::SeedNotFound(TITLE_ID))));
    }

    #[test]
    fn test_resolve_from_nand() {
        let nand = tempfile::tempdir().unwrap();
        let seed = [0x77; 16];
        write_seed_save(nand.path(), &[(TITLE_ID + 0x100, [0; 16]), (TITLE_ID, seed)]);
        let mut resolver = SeedResolver::new(vec![nand.path().to_path_buf()], vec![]);
        assert_eq!(resolver.resolve_seed(TITLE_ID, &seed_hash(&seed, TITLE_ID)).unwrap(), seed);
    }

    #[test]
    fn test_install_seed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SEEDDB_NAME);
        let seed = [0x42; 16];
        let bad_hash = seed_hash(&[0x43; 16], TITLE_ID);
        assert!(matches!(install_seed(&path, TITLE_ID, seed, Some(&bad_hash)), Err(SeedError::HashMismatch(_))));
        assert!(install_seed(&path, TITLE_ID, seed, Some(&seed_hash(&seed, TITLE_ID))).unwrap());
        assert!(!install_seed(&path, TITLE_ID, seed, None).unwrap());
        let seeddb = SeedInfo::from_bytes(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(seeddb.find(TITLE_ID, &seed_hash(&seed, TITLE_ID)), Some(seed));
    }
}
