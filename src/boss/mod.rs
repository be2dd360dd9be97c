// boss/mod.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements the structures and methods required for handling BOSS (SpotPass) files.

use std::io::{Cursor, Read, Write};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{info, warn};
use thiserror::Error;
use crate::crypto::CryptoContext;
use crate::crypto::aes::AesError;
use crate::crypto::keydb::{KeyDbError, KeyType};
use crate::crypto::sha::{ShaEngine, ShaMode};

pub const BOSS_MAGIC: [u8; 8] = [b'b', b'o', b's', b's', 0x00, 0x01, 0x00, 0x01];
pub const BOSS_KEYSLOT: u8 = 0x38;
pub const BOSS_CRYPT_OFFSET: usize = 0x28;
pub const BOSS_HEADER_SIZE: usize = 0x296;
const BOSS_HASH_TYPE: u16 = 0x0002;
const BOSS_CNTHDR_OFFSET: usize = 0x28;
const BOSS_CNTHDR_HASHED: usize = 0x12;
const BOSS_CNTHDR_HASH_OFFSET: usize = 0x3A;
const BOSS_PAYLOAD_HDR_OFFSET: usize = 0x15A;
const BOSS_PAYLOAD_HDR_HASHED: usize = 0x1C;
const BOSS_PAYLOAD_HASH_OFFSET: usize = 0x176;
const BOSS_PAYLOAD_SIZE_OFFSET: usize = 0x16A;

#[derive(Debug, Error)]
pub enum BossError {
    #[error("data is not a BOSS file (bad magic)")]
    BadMagic,
    #[error("BOSS file declares a size of {declared:#X} bytes but is {actual:#X} bytes")]
    FileSizeMismatch { declared: u64, actual: u64 },
    #[error("BOSS file uses an unsupported hash type or RSA size")]
    UnsupportedHash,
    #[error("BOSS {0} hash does not match")]
    HashMismatch(&'static str),
    #[error("BOSS stream was fed data before its header")]
    StreamNotReady,
    #[error("BOSS key could not be loaded")]
    KeyDb(#[from] KeyDbError),
    #[error("AES engine error")]
    Aes(#[from] AesError),
    #[error("BOSS data is not in a valid format")]
    IO(#[from] std::io::Error),
}

/// The unencrypted part of a BOSS header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BossHeader {
    pub magic: [u8; 8],
    pub file_size: u32,
    pub release_date: u64,
    pub unknown1: u16,
    padding: u16,
    pub hash_type: u16,
    pub rsa_size: u16,
    pub ctr12: [u8; 12],
}

impl BossHeader {
    pub fn from_bytes(data: &[u8]) -> Result<Self, BossError> {
        let mut buf = Cursor::new(data);
        let mut magic = [0u8; 8];
        buf.read_exact(&mut magic)?;
        let file_size = buf.read_u32::<BigEndian>()?;
        let release_date = buf.read_u64::<BigEndian>()?;
        let unknown1 = buf.read_u16::<BigEndian>()?;
        let padding = buf.read_u16::<BigEndian>()?;
        let hash_type = buf.read_u16::<BigEndian>()?;
        let rsa_size = buf.read_u16::<BigEndian>()?;
        let mut ctr12 = [0u8; 12];
        buf.read_exact(&mut ctr12)?;
        Ok(BossHeader { magic, file_size, release_date, unknown1, padding, hash_type, rsa_size, ctr12 })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut buf = Vec::with_capacity(BOSS_CRYPT_OFFSET);
        buf.write_all(&self.magic)?;
        buf.write_u32::<BigEndian>(self.file_size)?;
        buf.write_u64::<BigEndian>(self.release_date)?;
        buf.write_u16::<BigEndian>(self.unknown1)?;
        buf.write_u16::<BigEndian>(self.padding)?;
        buf.write_u16::<BigEndian>(self.hash_type)?;
        buf.write_u16::<BigEndian>(self.rsa_size)?;
        buf.write_all(&self.ctr12)?;
        Ok(buf)
    }

    /// Checks the magic, the hash type and RSA size, and the declared file size. A `file_size`
    /// of 0 skips the check against the real size of the file.
    pub fn validate(&self, file_size: u64) -> Result<(), BossError> {
        if self.magic != BOSS_MAGIC {
            return Err(BossError::BadMagic);
        }
        let declared = self.file_size as u64;
        if declared < BOSS_HEADER_SIZE as u64 || (file_size != 0 && file_size != declared) {
            return Err(BossError::FileSizeMismatch { declared, actual: file_size });
        }
        if self.hash_type != BOSS_HASH_TYPE || self.rsa_size != 0x0002 {
            return Err(BossError::UnsupportedHash);
        }
        Ok(())
    }

    /// Gets the full counter for the encrypted part of the file.
    pub fn ctr(&self) -> [u8; 16] {
        let mut ctr = [0u8; 16];
        ctr[..12].copy_from_slice(&self.ctr12);
        ctr[15] = 0x01;
        ctr
    }
}

fn setup_boss_key(ctx: &mut CryptoContext) -> Result<(), BossError> {
    ctx.keydb.load_key(&mut ctx.aes, BOSS_KEYSLOT, KeyType::Normal, Some("BOSS"))?;
    ctx.aes.use_keyslot(BOSS_KEYSLOT)?;
    Ok(())
}

// Runs CTR over the part of `data` (which starts at `offset` in the file) that is encrypted.
fn crypt_boss_region(ctx: &mut CryptoContext, header: &BossHeader, data: &mut [u8], offset: u64) -> Result<(), BossError> {
    let data_end = offset + data.len() as u64;
    let crypt_start = BOSS_CRYPT_OFFSET as u64;
    let crypt_end = header.file_size as u64;
    if data_end <= crypt_start || offset >= crypt_end {
        return Ok(());
    }
    let start = crypt_start.saturating_sub(offset) as usize;
    let end = (crypt_end.min(data_end) - offset) as usize;
    setup_boss_key(ctx)?;
    ctx.aes.ctr_crypt_byte(&mut data[start..end], offset.saturating_sub(crypt_start), &header.ctr());
    Ok(())
}

/// Checks if a BOSS file is encrypted, by decrypting the start of its content header. `data`
/// has to hold at least the first 0x38 bytes of the file.
pub fn is_boss_encrypted(ctx: &mut CryptoContext, data: &[u8]) -> Result<bool, BossError> {
    let header = BossHeader::from_bytes(data)?;
    let mut probe = data.get(BOSS_CNTHDR_OFFSET..BOSS_CNTHDR_OFFSET + 0x10)
        .ok_or(BossError::StreamNotReady)?
        .to_vec();
    // A plain content header starts with 0x80, followed by zeroes.
    if probe[0] == 0x80 && probe[1..].iter().all(|&b| b == 0) {
        return Ok(false);
    }
    crypt_boss_region(ctx, &header, &mut probe, BOSS_CNTHDR_OFFSET as u64)?;
    if probe[0] != 0x80 || probe[1..].iter().any(|&b| b != 0) {
        warn!("BOSS content header does not decrypt to the expected value");
    }
    Ok(true)
}

/// Encrypts or decrypts a BOSS file while it is read front to back in chunks. Files that are
/// already in the target state pass through untouched.
#[derive(Debug, Clone)]
pub struct BossStream {
    header: Option<BossHeader>,
    encrypt: bool,
    active: bool,
}

impl BossStream {
    pub fn new(encrypt: bool) -> Self {
        BossStream { header: None, encrypt, active: false }
    }

    pub fn header(&self) -> Option<&BossHeader> {
        self.header.as_ref()
    }

    /// Gets whether the stream changes the data it is fed.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn feed(&mut self, ctx: &mut CryptoContext, offset: u64, data: &mut [u8]) -> Result<(), BossError> {
        if offset == 0 && data.len() >= BOSS_CNTHDR_OFFSET + 0x10 {
            self.header = None;
            let header = BossHeader::from_bytes(data)?;
            header.validate(0)?;
            self.active = is_boss_encrypted(ctx, data)? != self.encrypt;
            self.header = Some(header);
        }
        let header = self.header.as_ref().ok_or(BossError::StreamNotReady)?;
        if !self.active {
            return Ok(());
        }
        crypt_boss_region(ctx, header, data, offset)
    }
}

/// Encrypts or decrypts a complete BOSS file in place. Returns false if the file was already in
/// the requested state.
pub fn crypt_boss(ctx: &mut CryptoContext, data: &mut [u8], encrypt: bool) -> Result<bool, BossError> {
    let mut stream = BossStream::new(encrypt);
    stream.feed(ctx, 0, data)?;
    Ok(stream.is_active())
}

fn content_header_hash(plain: &[u8]) -> [u8; 32] {
    let mut sha = ShaEngine::new(ShaMode::Sha256);
    sha.update(&plain[BOSS_CNTHDR_OFFSET..BOSS_CNTHDR_OFFSET + BOSS_CNTHDR_HASHED]);
    sha.update(&BOSS_HASH_TYPE.to_be_bytes());
    sha.get()
}

fn payload_hash(plain: &[u8]) -> Result<[u8; 32], BossError> {
    let mut buf = Cursor::new(&plain[BOSS_PAYLOAD_SIZE_OFFSET..]);
    let payload_size = buf.read_u32::<BigEndian>()? as usize;
    let payload = plain.get(BOSS_HEADER_SIZE..BOSS_HEADER_SIZE + payload_size)
        .ok_or(BossError::FileSizeMismatch { declared: (BOSS_HEADER_SIZE + payload_size) as u64, actual: plain.len() as u64 })?;
    let mut sha = ShaEngine::new(ShaMode::Sha256);
    sha.update(&plain[BOSS_PAYLOAD_HDR_OFFSET..BOSS_PAYLOAD_HDR_OFFSET + BOSS_PAYLOAD_HDR_HASHED]);
    sha.update(&BOSS_HASH_TYPE.to_be_bytes());
    sha.update(payload);
    Ok(sha.get())
}

// Gets a decrypted copy of a complete BOSS file, and whether it was encrypted.
fn plain_copy(ctx: &mut CryptoContext, data: &[u8]) -> Result<(Vec<u8>, bool), BossError> {
    let header = BossHeader::from_bytes(data)?;
    header.validate(data.len() as u64)?;
    let mut plain = data.to_vec();
    let encrypted = crypt_boss(ctx, &mut plain, false)?;
    Ok((plain, encrypted))
}

/// Verifies the content header hash and the payload hash of a complete BOSS file, which may be
/// encrypted or not.
pub fn verify_boss(ctx: &mut CryptoContext, data: &[u8]) -> Result<(), BossError> {
    let (plain, _) = plain_copy(ctx, data)?;
    if content_header_hash(&plain)[..] != plain[BOSS_CNTHDR_HASH_OFFSET..BOSS_CNTHDR_HASH_OFFSET + 32] {
        return Err(BossError::HashMismatch("content header"));
    }
    if payload_hash(&plain)?[..] != plain[BOSS_PAYLOAD_HASH_OFFSET..BOSS_PAYLOAD_HASH_OFFSET + 32] {
        return Err(BossError::HashMismatch("payload"));
    }
    Ok(())
}

/// Checks the hashes of a complete BOSS file and replaces each one that does not match, if
/// `confirm` allows it. The file keeps its crypto state. Returns whether anything was changed.
pub fn fix_boss_hashes<F>(ctx: &mut CryptoContext, data: &mut [u8], mut confirm: F) -> Result<bool, BossError>
where
    F: FnMut(&str) -> bool,
{
    let (mut plain, encrypted) = plain_copy(ctx, data)?;
    let mut fixed = false;
    let hash = content_header_hash(&plain);
    if hash[..] != plain[BOSS_CNTHDR_HASH_OFFSET..BOSS_CNTHDR_HASH_OFFSET + 32] && confirm("content header") {
        plain[BOSS_CNTHDR_HASH_OFFSET..BOSS_CNTHDR_HASH_OFFSET + 32].copy_from_slice(&hash);
        fixed = true;
    }
    let hash = payload_hash(&plain)?;
    if hash[..] != plain[BOSS_PAYLOAD_HASH_OFFSET..BOSS_PAYLOAD_HASH_OFFSET + 32] && confirm("payload") {
        plain[BOSS_PAYLOAD_HASH_OFFSET..BOSS_PAYLOAD_HASH_OFFSET + 32].copy_from_slice(&hash);
        fixed = true;
    }
    if !fixed {
        return Ok(false);
    }
    if encrypted {
        crypt_boss(ctx, &mut plain, true)?;
    }
    data.copy_from_slice(&plain);
    info!("fixed BOSS hashes");
    Ok(true)
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::crypto::ContextConfig;
    use std::fs;

    // Returns the context along with the directory holding its key, which has to stay alive.
    pub fn boss_context() -> (CryptoContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("slot0x38KeyBOSS.bin"), [0x38u8; 16]).unwrap();
        let config = ContextConfig { support_dirs: vec![dir.path().to_path_buf()], ..Default::default() };
        (CryptoContext::from_config(&config).unwrap(), dir)
    }

    pub fn build_test_boss(payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; BOSS_HEADER_SIZE];
        let header = BossHeader {
            magic: BOSS_MAGIC,
            file_size: (BOSS_HEADER_SIZE + payload.len()) as u32,
            release_date: 0x0000014A2C9F1A00,
            unknown1: 1,
            padding: 0,
            hash_type: BOSS_HASH_TYPE,
            rsa_size: 2,
            ctr12: [0x09; 12],
        };
        data[..BOSS_CRYPT_OFFSET].copy_from_slice(&header.to_bytes().unwrap());
        data[BOSS_CNTHDR_OFFSET] = 0x80;
        data[BOSS_PAYLOAD_HDR_OFFSET..BOSS_PAYLOAD_HDR_OFFSET + 8].copy_from_slice(&0x0004013000003402u64.to_be_bytes());
        data[BOSS_PAYLOAD_SIZE_OFFSET..BOSS_PAYLOAD_SIZE_OFFSET + 4].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        data.extend_from_slice(payload);
        let hash = content_header_hash(&data);
        data[BOSS_CNTHDR_HASH_OFFSET..BOSS_CNTHDR_HASH_OFFSET + 32].copy_from_slice(&hash);
        let hash = payload_hash(&data).unwrap();
        data[BOSS_PAYLOAD_HASH_OFFSET..BOSS_PAYLOAD_HASH_OFFSET + 32].copy_from_slice(&hash);
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::test_utils::*;

    #[test]
    fn test_validate_header() {
        let data = build_test_boss(&[0x5A; 0x100]);
        let header = BossHeader::from_bytes(&data).unwrap();
        header.validate(data.len() as u64).unwrap();
        header.validate(0).unwrap();
        assert!(matches!(header.validate(0x10), Err(BossError::FileSizeMismatch { .. })));
        assert_eq!(header.ctr()[12..], [0, 0, 0, 1]);
        let mut bad = header.clone();
        bad.magic[4] = 0x02;
        assert!(matches!(bad.validate(0), Err(BossError::BadMagic)));
        let mut bad = header;
        bad.hash_type = 1;
        assert!(matches!(bad.validate(0), Err(BossError::UnsupportedHash)));
    }

    #[test]
    fn test_crypt_roundtrip() {
        let (mut ctx, _dir) = boss_context();
        let plain = build_test_boss(&[0x5A; 0x123]);
        verify_boss(&mut ctx, &plain).unwrap();
        let mut data = plain.clone();
        assert!(!crypt_boss(&mut ctx, &mut data, false).unwrap());
        assert!(crypt_boss(&mut ctx, &mut data, true).unwrap());
        assert_eq!(data[..BOSS_CRYPT_OFFSET], plain[..BOSS_CRYPT_OFFSET]);
        assert_ne!(data[BOSS_CRYPT_OFFSET..], plain[BOSS_CRYPT_OFFSET..]);
        assert!(is_boss_encrypted(&mut ctx, &data).unwrap());
        verify_boss(&mut ctx, &data).unwrap();
        assert!(!crypt_boss(&mut ctx, &mut data, true).unwrap());
        assert!(crypt_boss(&mut ctx, &mut data, false).unwrap());
        assert_eq!(data, plain);
    }

    #[test]
    fn test_stream_chunking() {
        let (mut ctx, _dir) = boss_context();
        let mut whole = build_test_boss(&[0x17; 0x301]);
        let mut chunked = whole.clone();
        crypt_boss(&mut ctx, &mut whole, true).unwrap();
        let mut stream = BossStream::new(true);
        let mut offset = 0;
        for size in [0x40usize, 0x1F, 0x200, 0x155, 0x1000] {
            let end = (offset + size).min(chunked.len());
            stream.feed(&mut ctx, offset as u64, &mut chunked[offset..end]).unwrap();
            offset = end;
        }
        assert_eq!(offset, chunked.len());
        assert_eq!(chunked, whole);
        assert!(matches!(BossStream::new(true).feed(&mut ctx, 0x40, &mut chunked[0x40..]), Err(BossError::StreamNotReady)));
    }

    #[test]
    fn test_missing_key() {
        let mut ctx = CryptoContext::new();
        let mut data = build_test_boss(&[0; 0x10]);
        assert!(matches!(crypt_boss(&mut ctx, &mut data, true), Err(BossError::KeyDb(_))));
    }

    #[test]
    fn test_fix_hashes() {
        let (mut ctx, _dir) = boss_context();
        let mut data = build_test_boss(&[0x5A; 0x80]);
        crypt_boss(&mut ctx, &mut data, true).unwrap();
        // Flipping a ciphertext bit flips the same payload bit.
        let last = data.len() - 1;
        data[last] ^= 1;
        assert!(matches!(verify_boss(&mut ctx, &data), Err(BossError::HashMismatch("payload"))));
        let mut asked = Vec::new();
        assert!(!fix_boss_hashes(&mut ctx, &mut data, |what| { asked.push(what.to_owned()); false }).unwrap());
        assert_eq!(asked, vec!["payload".to_owned()]);
        assert!(fix_boss_hashes(&mut ctx, &mut data, |_| true).unwrap());
        verify_boss(&mut ctx, &data).unwrap();
        assert!(is_boss_encrypted(&mut ctx, &data).unwrap());
        assert!(!fix_boss_hashes(&mut ctx, &mut data, |_| panic!("nothing to fix")).unwrap());
    }
}
