// crypto/keydb.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements the structures and methods required for aeskeydb.bin handling, unit type detection,
// and loading keys into the AES engine.

use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use byteorder::{ReadBytesExt, WriteBytesExt};
use log::{debug, warn};
use thiserror::Error;
use crate::crypto::aes::{AesEngine, AesError, KeyComponent, KEYSLOT_COUNT};

pub const KEYDB_NAME: &str = "aeskeydb.bin";
pub const AES_KEY_INFO_SIZE: usize = 0x20;
/// Keyslot that key database records are protected with.
pub const KEYDB_KEYSLOT: u8 = 0x2C;

// Keyslots that are applied from the default database without being asked for explicitly.
const KEYSLOT_WHITELIST: u64 = (1 << 0x02) | (1 << 0x03) | (1 << 0x05) | (1 << 0x18) | (1 << 0x19) |
    (1 << 0x1A) | (1 << 0x1B) | (1 << 0x1C) | (1 << 0x1D) | (1 << 0x1E) | (1 << 0x1F) | (1 << 0x24) |
    (1 << 0x25) | (1 << 0x2F);

// Slot 0x2C with a zeroed KeyY, encrypting a zeroed block.
const UNIT_SAMPLE_RETAIL: [u8; 16] = [
    0xBC, 0xC4, 0x16, 0x2C, 0x2A, 0x06, 0x91, 0xEE, 0x47, 0x18, 0x86, 0xB8, 0xEB, 0x2F, 0xB5, 0x48,
];

const NCCH_SAMPLES_RETAIL: [(u8, [u8; 16]); 3] = [
    (0x18, [0x78, 0xBB, 0x84, 0xFA, 0xB3, 0xA2, 0x49, 0x83, 0x9E, 0x4F, 0x50, 0x7B, 0x17, 0xA0, 0xDA, 0x23]),
    (0x1B, [0xF3, 0x6F, 0x84, 0x7E, 0x59, 0x43, 0x6E, 0xD5, 0xA0, 0x40, 0x4C, 0x71, 0x19, 0xED, 0xF7, 0x0A]),
    (0x25, [0x34, 0x7D, 0x07, 0x48, 0xAE, 0x5D, 0xFB, 0xB0, 0xF5, 0x86, 0xD6, 0xB5, 0x14, 0x65, 0xF1, 0xFF]),
];

#[derive(Debug, Error)]
pub enum KeyDbError {
    #[error("key database record {0} has an invalid keyslot or key type")]
    InvalidRecord(usize),
    #[error("key database size ({0} bytes) is not a multiple of the record size")]
    InvalidSize(usize),
    #[error("key database `{0}` could not be read")]
    DatabaseNotFound(String),
    #[error("required key (slot 0x{slot:02X}, type {key_type}, id `{id}`) could not be found")]
    KeyNotFound { slot: u8, key_type: char, id: String },
    #[error("`{0}` is not a valid key type (must be X, Y, N, or I)")]
    InvalidKeyType(char),
    #[error("AES engine error")]
    Aes(#[from] AesError),
    #[error("key database data is not in a valid format")]
    IO(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    X,
    Y,
    Normal,
    Iv,
}

impl KeyType {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'X' => Some(KeyType::X),
            'Y' => Some(KeyType::Y),
            'N' => Some(KeyType::Normal),
            'I' => Some(KeyType::Iv),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            KeyType::X => 'X',
            KeyType::Y => 'Y',
            KeyType::Normal => 'N',
            KeyType::Iv => 'I',
        }
    }

    /// Gets the keyslot component this key type is written to. IVs are never programmed.
    pub fn component(&self) -> Option<KeyComponent> {
        match self {
            KeyType::X => Some(KeyComponent::X),
            KeyType::Y => Some(KeyComponent::Y),
            KeyType::Normal => Some(KeyComponent::Normal),
            KeyType::Iv => None,
        }
    }

    fn legacy_name(&self) -> &'static str {
        match self {
            KeyType::X => "X",
            KeyType::Y => "Y",
            KeyType::Normal => "",
            KeyType::Iv => "IV",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitType {
    Unknown,
    Devkit,
    Retail,
}

impl UnitType {
    /// The value used for this unit type in the unit restriction field of key records.
    pub fn as_u8(&self) -> u8 {
        match self {
            UnitType::Unknown => 0,
            UnitType::Devkit => 1,
            UnitType::Retail => 2,
        }
    }
}

/// A single 32-byte record from aeskeydb.bin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AesKeyInfo {
    pub slot: u8,
    pub key_type: KeyType,
    pub id: [u8; 10],
    reserved: [u8; 2],
    pub unit_restriction: u8,
    pub is_encrypted: bool,
    pub key: [u8; 16],
}

impl AesKeyInfo {
    pub fn new(slot: u8, key_type: KeyType, id: Option<&str>, unit_restriction: u8, key: [u8; 16]) -> Self {
        let mut id_bytes = [0u8; 10];
        if let Some(id) = id {
            let len = id.len().min(10);
            id_bytes[..len].copy_from_slice(&id.as_bytes()[..len]);
        }
        AesKeyInfo {
            slot,
            key_type,
            id: id_bytes,
            reserved: [0; 2],
            unit_restriction,
            is_encrypted: false,
            key,
        }
    }

    /// Parses one record. `index` is only used to report which record was malformed.
    pub fn from_bytes(data: &[u8], index: usize) -> Result<Self, KeyDbError> {
        let mut buf = Cursor::new(data);
        let slot = buf.read_u8()?;
        let key_type = KeyType::from_char(buf.read_u8()? as char);
        let key_type = match key_type {
            Some(key_type) if slot < KEYSLOT_COUNT => key_type,
            _ => return Err(KeyDbError::InvalidRecord(index)),
        };
        let mut id = [0u8; 10];
        buf.read_exact(&mut id)?;
        let mut reserved = [0u8; 2];
        buf.read_exact(&mut reserved)?;
        let unit_restriction = buf.read_u8()?;
        let is_encrypted = buf.read_u8()? != 0;
        let mut key = [0u8; 16];
        buf.read_exact(&mut key)?;
        Ok(AesKeyInfo {
            slot,
            key_type,
            id,
            reserved,
            unit_restriction,
            is_encrypted,
            key,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut buf: Vec<u8> = Vec::with_capacity(AES_KEY_INFO_SIZE);
        buf.write_u8(self.slot)?;
        buf.write_u8(self.key_type.as_char() as u8)?;
        buf.write_all(&self.id)?;
        buf.write_all(&self.reserved)?;
        buf.write_u8(self.unit_restriction)?;
        buf.write_u8(self.is_encrypted as u8)?;
        buf.write_all(&self.key)?;
        Ok(buf)
    }

    /// Gets the key ID as a string, stopping at the first NUL.
    pub fn id_str(&self) -> String {
        let end = self.id.iter().position(|&b| b == 0).unwrap_or(self.id.len());
        String::from_utf8_lossy(&self.id[..end]).into_owned()
    }

    fn id_matches(&self, id: Option<&str>) -> bool {
        match id {
            None => self.id[0] == 0,
            Some(id) => {
                let id = if id.len() > 10 { &id[..10] } else { id };
                self.id_str() == id
            }
        }
    }

    fn applies_to(&self, unit: UnitType) -> bool {
        self.unit_restriction == 0 || self.unit_restriction == unit.as_u8()
    }

    /// Toggles the encryption of the key. Records are protected with slot 0x2C under a zeroed
    /// KeyY, with the first 12 bytes of the record as the counter.
    pub fn crypt(&mut self, aes: &mut AesEngine) -> Result<(), KeyDbError> {
        let mut ctr = [0u8; 16];
        ctr[0] = self.slot;
        ctr[1] = self.key_type.as_char() as u8;
        ctr[2..12].copy_from_slice(&self.id);
        aes.load_key(KEYDB_KEYSLOT, KeyComponent::Y, &[0u8; 16])?;
        aes.use_keyslot(KEYDB_KEYSLOT)?;
        aes.ctr_crypt_byte(&mut self.key, 0, &ctr);
        self.is_encrypted = !self.is_encrypted;
        Ok(())
    }
}

/// Parses a whole key database. A database containing a record with an invalid keyslot or key
/// type is rejected entirely.
pub fn parse_key_database(data: &[u8]) -> Result<Vec<AesKeyInfo>, KeyDbError> {
    if data.len() % AES_KEY_INFO_SIZE != 0 {
        return Err(KeyDbError::InvalidSize(data.len()));
    }
    data.chunks_exact(AES_KEY_INFO_SIZE)
        .enumerate()
        .map(|(i, record)| AesKeyInfo::from_bytes(record, i))
        .collect()
}

/// Encrypts or decrypts every record of a key database, leaving records already in the target
/// state untouched.
pub fn crypt_key_database(aes: &mut AesEngine, data: &[u8], encrypt: bool) -> Result<Vec<u8>, KeyDbError> {
    let mut out: Vec<u8> = Vec::with_capacity(data.len());
    for mut info in parse_key_database(data)? {
        if info.is_encrypted != encrypt {
            info.crypt(aes)?;
        }
        out.write_all(&info.to_bytes()?)?;
    }
    Ok(out)
}

/// A known ciphertext used to recognize a key that is already present in a keyslot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySample {
    pub slot: u8,
    pub unit: UnitType,
    pub sample: [u8; 16],
}

/// Reference ciphertexts used for unit type detection and for the KeyX self-test. Each one is
/// the encryption of a zeroed block after writing a zeroed KeyY to the keyslot. Only the retail
/// references are built in. Devkit references are added from the devkit-only KeyX records of the
/// key database (see [`KeySamples::add_devkit_key`]).
#[derive(Debug, Clone)]
pub struct KeySamples {
    pub unit_retail: Option<[u8; 16]>,
    pub unit_devkit: Option<[u8; 16]>,
    pub ncch: Vec<KeySample>,
}

impl Default for KeySamples {
    fn default() -> Self {
        KeySamples {
            unit_retail: Some(UNIT_SAMPLE_RETAIL),
            unit_devkit: None,
            ncch: NCCH_SAMPLES_RETAIL
                .iter()
                .map(|(slot, sample)| KeySample { slot: *slot, unit: UnitType::Retail, sample: *sample })
                .collect(),
        }
    }
}

// The keyslot and the active keyslot are restored afterwards.
impl KeySamples {
    /// Adds the reference ciphertext of a devkit KeyX. Slot 0x2C becomes the devkit unit sample,
    /// the other slots become self-test samples.
    pub fn add_devkit_key(&mut self, slot: u8, key_x: &[u8; 16]) -> Result<(), AesError> {
        let mut scratch = AesEngine::new();
        scratch.load_key(slot, KeyComponent::X, key_x)?;
        let sample = encrypt_zero_sample(&mut scratch, slot)?;
        if slot == KEYDB_KEYSLOT {
            self.unit_devkit.get_or_insert(sample);
        } else if !self.ncch.iter().any(|s| s.slot == slot && s.unit == UnitType::Devkit && s.sample == sample) {
            self.ncch.push(KeySample { slot, unit: UnitType::Devkit, sample });
        }
        Ok(())
    }
}

fn encrypt_zero_sample(aes: &mut AesEngine, slot: u8) -> Result<[u8; 16], AesError> {
    let backup = aes.backup_keyslot(slot)?;
    aes.load_key(slot, KeyComponent::Y, &[0u8; 16])?;
    aes.use_keyslot(slot)?;
    let mut sample = [0u8; 16];
    aes.ecb_encrypt_block(&mut sample);
    aes.restore_keyslot(&backup);
    Ok(sample)
}

/// Key lookup across aeskeydb.bin and legacy single-key files found in the support directories.
pub struct KeyDatabase {
    support_dirs: Vec<PathBuf>,
    samples: KeySamples,
    devkit_samples_loaded: bool,
    unit_type: Option<UnitType>,
}

impl KeyDatabase {
    pub fn new(support_dirs: Vec<PathBuf>) -> Self {
        KeyDatabase {
            support_dirs,
            samples: KeySamples::default(),
            devkit_samples_loaded: false,
            unit_type: None,
        }
    }

    /// Replaces the reference ciphertexts used for unit detection and key self-tests.
    pub fn with_samples(mut self, samples: KeySamples) -> Self {
        self.samples = samples;
        self.devkit_samples_loaded = false;
        self.unit_type = None;
        self
    }

    pub fn support_dirs(&self) -> &[PathBuf] {
        &self.support_dirs
    }

    /// Reads a file from the first support directory that has it.
    pub fn load_support_file(&self, name: &str) -> Option<Vec<u8>> {
        self.support_dirs.iter()
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
            .and_then(|path| fs::read(path).ok())
    }

    // Devkit records of an encrypted database can only be read once the devkit KeyX of slot 0x2C
    // is in the engine, and that KeyX itself is only usable when stored unencrypted.
    fn load_devkit_samples(&mut self, aes: &mut AesEngine) {
        if self.devkit_samples_loaded {
            return;
        }
        self.devkit_samples_loaded = true;
        let records = match self.load_support_file(KEYDB_NAME).map(|data| parse_key_database(&data)) {
            Some(Ok(records)) => records,
            _ => return,
        };
        for mut info in records {
            if info.key_type != KeyType::X || info.id[0] != 0 || info.unit_restriction != UnitType::Devkit.as_u8() {
                continue;
            }
            if info.is_encrypted {
                if info.slot == KEYDB_KEYSLOT {
                    continue;
                }
                let backup = match aes.backup_keyslot(KEYDB_KEYSLOT) {
                    Ok(backup) => backup,
                    Err(_) => continue,
                };
                let decrypted = info.crypt(aes);
                aes.restore_keyslot(&backup);
                if decrypted.is_err() {
                    continue;
                }
            }
            if self.samples.add_devkit_key(info.slot, &info.key).is_ok() {
                debug!("using devkit KeyX record for keyslot 0x{:02X} as a reference", info.slot);
            }
        }
    }

    /// Detects whether the keys present in the engine are retail or devkit keys. Only a positive
    /// result is remembered, so a later call can still succeed once slot 0x2C has its KeyX.
    /// Keyslot 0x2C and the active keyslot are left as they were.
    pub fn unit_type(&mut self, aes: &mut AesEngine) -> UnitType {
        if let Some(unit) = self.unit_type {
            return unit;
        }
        let sample = match encrypt_zero_sample(aes, KEYDB_KEYSLOT) {
            Ok(sample) => sample,
            Err(_) => return UnitType::Unknown,
        };
        if self.samples.unit_retail != Some(sample) {
            self.load_devkit_samples(aes);
        }
        let unit = if self.samples.unit_retail == Some(sample) {
            UnitType::Retail
        } else if self.samples.unit_devkit == Some(sample) {
            UnitType::Devkit
        } else {
            return UnitType::Unknown;
        };
        debug!("detected {:?} unit keys", unit);
        self.unit_type = Some(unit);
        unit
    }

    /// Checks if a key is present in a keyslot. KeyX values for NCCH keyslots that were not
    /// loaded through this database are identified by their reference ciphertext instead.
    pub fn check_keyslot_loaded(&mut self, aes: &mut AesEngine, slot: u8, key_type: KeyType) -> bool {
        if slot >= KEYSLOT_COUNT {
            return false;
        }
        if let Some(component) = key_type.component() {
            if aes.state().is_loaded(slot, component) {
                return true;
            }
        }
        if key_type != KeyType::X {
            return false;
        }
        let unit = self.unit_type(aes);
        if unit == UnitType::Devkit {
            self.load_devkit_samples(aes);
        }
        let candidates: Vec<[u8; 16]> = self.samples.ncch.iter()
            .filter(|s| s.slot == slot && s.unit == unit)
            .map(|s| s.sample)
            .collect();
        for expected in candidates {
            if encrypt_zero_sample(aes, slot).is_ok_and(|sample| sample == expected) {
                debug!("keyslot 0x{:02X} KeyX identified by self-test", slot);
                aes.state_mut().mark(slot, KeyComponent::X);
                return true;
            }
        }
        false
    }

    fn find_key(&mut self, aes: &mut AesEngine, slot: u8, key_type: KeyType, id: Option<&str>) -> Option<[u8; 16]> {
        if let Some(data) = self.load_support_file(KEYDB_NAME) {
            match parse_key_database(&data) {
                Ok(records) => {
                    let unit = self.unit_type(aes);
                    let found = records.into_iter().find(|info| {
                        info.slot == slot && info.key_type == key_type && info.id_matches(id) && info.applies_to(unit)
                    });
                    if let Some(mut info) = found {
                        if info.is_encrypted && info.crypt(aes).is_err() {
                            return None;
                        }
                        return Some(info.key);
                    }
                },
                Err(err) => warn!("ignoring unusable {}: {}", KEYDB_NAME, err),
            }
        }
        if key_type == KeyType::Iv {
            return None;
        }
        let legacy = format!("slot0x{:02X}Key{}{}.bin", slot, key_type.legacy_name(), id.unwrap_or(""));
        self.load_support_file(&legacy)
            .and_then(|data| <[u8; 16]>::try_from(data.as_slice()).ok())
    }

    /// Looks up a key, programs it into its keyslot (unless it is an IV) and returns it.
    pub fn fetch_key(&mut self, aes: &mut AesEngine, slot: u8, key_type: KeyType, id: Option<&str>) -> Result<[u8; 16], KeyDbError> {
        if slot >= KEYSLOT_COUNT {
            return Err(AesError::InvalidKeyslot(slot).into());
        }
        let key = self.find_key(aes, slot, key_type, id).ok_or_else(|| KeyDbError::KeyNotFound {
            slot,
            key_type: key_type.as_char(),
            id: id.unwrap_or_default().to_owned(),
        })?;
        if let Some(component) = key_type.component() {
            aes.setup_key(slot, component, &key)?;
        }
        Ok(key)
    }

    /// Makes sure a key is present in its keyslot, loading it from the support files if needed.
    pub fn load_key(&mut self, aes: &mut AesEngine, slot: u8, key_type: KeyType, id: Option<&str>) -> Result<(), KeyDbError> {
        if id.is_none() && self.check_keyslot_loaded(aes, slot, key_type) {
            return Ok(());
        }
        self.fetch_key(aes, slot, key_type, id)?;
        Ok(())
    }

    /// Applies every applicable record of a key database to the engine. With no path the
    /// database from the support directories is used, and only keyslots that are safe to preload
    /// are applied. Records carrying an ID, IVs, keys for another unit type and keys that are
    /// already loaded are skipped.
    pub fn init_key_database(&mut self, aes: &mut AesEngine, path: Option<&Path>) -> Result<usize, KeyDbError> {
        let data = match path {
            Some(path) => fs::read(path).map_err(|_| KeyDbError::DatabaseNotFound(path.display().to_string()))?,
            None => match self.load_support_file(KEYDB_NAME) {
                Some(data) => data,
                None => return Ok(0),
            },
        };
        let records = parse_key_database(&data)?;
        let mut applied = 0;
        for mut info in records {
            let component = match info.key_type.component() {
                Some(component) => component,
                None => continue,
            };
            if info.id[0] != 0 {
                continue;
            }
            let unit = self.unit_type(aes);
            if !info.applies_to(unit) || self.check_keyslot_loaded(aes, info.slot, info.key_type) {
                continue;
            }
            if path.is_none() && (KEYSLOT_WHITELIST >> info.slot) & 1 == 0 {
                continue;
            }
            if info.is_encrypted {
                info.crypt(aes)?;
            }
            aes.setup_key(info.slot, component, &info.key)?;
            applied += 1;
        }
        debug!("applied {} keys from key database", applied);
        Ok(applied)
    }
}
