// firm/mod.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements the structures and methods required for FIRM validation, verification and ARM9
// binary decryption.

use std::io::{Cursor, Read, Write};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};
use thiserror::Error;
use crate::crypto::CryptoContext;
use crate::crypto::aes::{AesError, KeyComponent};
use crate::crypto::keydb::{KeyDbError, KeyType};
use crate::crypto::sha::sha256;

pub const FIRM_MAGIC: [u8; 4] = *b"FIRM";
pub const FIRM_HEADER_SIZE: usize = 0x200;
pub const FIRM_MAX_SIZE: u64 = 0x400000;
pub const FIRM_SECTIONS: usize = 4;
pub const A9L_HEADER_SIZE: usize = 0x200;
pub const A9L_BINARY_OFFSET: u64 = 0x800;

#[derive(Debug, Error)]
pub enum FirmError {
    #[error("data is not a FIRM (bad magic)")]
    BadMagic,
    #[error("FIRM section {0} is misaligned or overlaps an earlier section")]
    InvalidSection(usize),
    #[error("FIRM size {size:#X} exceeds the available {max:#X} bytes")]
    SizeExceeded { size: u64, max: u64 },
    #[error("FIRM {0} entry point is not inside any section")]
    EntryOutsideSections(&'static str),
    #[error("FIRM section {0} does not match its hash")]
    HashMismatch(usize),
    #[error("ARM9 loader binary size does not fit its section")]
    InvalidA9lSize,
    #[error("ARM9 loader header must be contained in a single chunk")]
    A9lHeaderSplit,
    #[error("FIRM stream was fed data before its header")]
    StreamNotReady,
    #[error("ARM9 binary key could not be loaded")]
    KeyDb(#[from] KeyDbError),
    #[error("AES engine error")]
    Aes(#[from] AesError),
    #[error("FIRM data is not in a valid format")]
    IO(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirmSection {
    pub offset: u32,
    pub address: u32,
    pub size: u32,
    pub method: u32,
    pub hash: [u8; 32],
}

impl FirmSection {
    fn contains_address(&self, address: u32) -> bool {
        address >= self.address && (address as u64) < self.address as u64 + self.size as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmHeader {
    pub magic: [u8; 4],
    pub priority: u32,
    pub entry_arm11: u32,
    pub entry_arm9: u32,
    reserved: [u8; 0x30],
    pub sections: [FirmSection; FIRM_SECTIONS],
    pub signature: [u8; 0x100],
}

impl FirmHeader {
    pub fn from_bytes(data: &[u8]) -> Result<Self, FirmError> {
        let mut buf = Cursor::new(data);
        let mut magic = [0u8; 4];
        buf.read_exact(&mut magic)?;
        let priority = buf.read_u32::<LittleEndian>()?;
        let entry_arm11 = buf.read_u32::<LittleEndian>()?;
        let entry_arm9 = buf.read_u32::<LittleEndian>()?;
        let mut reserved = [0u8; 0x30];
        buf.read_exact(&mut reserved)?;
        let mut sections = [FirmSection::default(); FIRM_SECTIONS];
        for section in sections.iter_mut() {
            section.offset = buf.read_u32::<LittleEndian>()?;
            section.address = buf.read_u32::<LittleEndian>()?;
            section.size = buf.read_u32::<LittleEndian>()?;
            section.method = buf.read_u32::<LittleEndian>()?;
            buf.read_exact(&mut section.hash)?;
        }
        let mut signature = [0u8; 0x100];
        buf.read_exact(&mut signature)?;
        Ok(FirmHeader { magic, priority, entry_arm11, entry_arm9, reserved, sections, signature })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut buf = Vec::with_capacity(FIRM_HEADER_SIZE);
        buf.write_all(&self.magic)?;
        buf.write_u32::<LittleEndian>(self.priority)?;
        buf.write_u32::<LittleEndian>(self.entry_arm11)?;
        buf.write_u32::<LittleEndian>(self.entry_arm9)?;
        buf.write_all(&self.reserved)?;
        for section in &self.sections {
            buf.write_u32::<LittleEndian>(section.offset)?;
            buf.write_u32::<LittleEndian>(section.address)?;
            buf.write_u32::<LittleEndian>(section.size)?;
            buf.write_u32::<LittleEndian>(section.method)?;
            buf.write_all(&section.hash)?;
        }
        buf.write_all(&self.signature)?;
        Ok(buf)
    }

    /// Gets the size of the FIRM, which ends with its last section.
    pub fn firm_size(&self) -> u64 {
        self.sections.iter()
            .filter(|s| s.size != 0)
            .map(|s| s.offset as u64 + s.size as u64)
            .max()
            .unwrap_or(FIRM_HEADER_SIZE as u64)
    }

    /// Checks the magic, section alignment and order, the entry points and the total size. A
    /// `data_size` of 0 skips the check against the real size of the data.
    pub fn validate(&self, data_size: u64) -> Result<(), FirmError> {
        if self.magic != FIRM_MAGIC {
            return Err(FirmError::BadMagic);
        }
        let mut firm_size = FIRM_HEADER_SIZE as u64;
        let mut arm11_found = false;
        let mut arm9_found = false;
        for (i, section) in self.sections.iter().enumerate() {
            if section.size == 0 {
                continue;
            }
            if (section.offset as u64) < firm_size
                || section.offset % 512 != 0
                || section.address % 16 != 0
                || section.size % 512 != 0 {
                return Err(FirmError::InvalidSection(i));
            }
            arm11_found |= section.contains_address(self.entry_arm11);
            arm9_found |= section.contains_address(self.entry_arm9);
            firm_size = section.offset as u64 + section.size as u64;
        }
        if firm_size > FIRM_MAX_SIZE {
            return Err(FirmError::SizeExceeded { size: firm_size, max: FIRM_MAX_SIZE });
        }
        if data_size != 0 && firm_size > data_size {
            return Err(FirmError::SizeExceeded { size: firm_size, max: data_size });
        }
        if self.entry_arm11 != 0 && !arm11_found {
            return Err(FirmError::EntryOutsideSections("ARM11"));
        }
        if self.entry_arm9 != 0 && !arm9_found {
            return Err(FirmError::EntryOutsideSections("ARM9"));
        }
        Ok(())
    }

    /// Gets the index of the section holding the ARM9 entry point.
    pub fn arm9_section(&self) -> Option<usize> {
        if self.entry_arm9 == 0 {
            return None;
        }
        self.sections.iter().position(|s| s.size != 0 && s.contains_address(self.entry_arm9))
    }

    /// Checks every section of a complete FIRM image against its hash.
    pub fn verify_sections(&self, data: &[u8]) -> Result<(), FirmError> {
        for (i, section) in self.sections.iter().enumerate() {
            if section.size == 0 {
                continue;
            }
            let start = section.offset as usize;
            let region = data.get(start..start + section.size as usize)
                .ok_or(FirmError::SizeExceeded { size: section.offset as u64 + section.size as u64, max: data.len() as u64 })?;
            if sha256(region) != section.hash {
                return Err(FirmError::HashMismatch(i));
            }
        }
        Ok(())
    }
}

/// The key generation an ARM9 binary is encrypted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum A9lKeyTier {
    /// Before 9.5.0, keyslot 0x15 with a KeyX from the key database.
    Pre95,
    /// 9.5.0, keyslot 0x16 with a KeyX decrypted by the 9.5.0 normal key for keyslot 0x11.
    Firm95,
    /// 9.6.0 and later, like 9.5.0 but with the 9.6.0 key.
    Firm96,
}

/// The header that precedes an encrypted ARM9 binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct A9lHeader {
    pub key_x_15: [u8; 16],
    pub key_y: [u8; 16],
    pub ctr: [u8; 16],
    pub size_ascii: [u8; 8],
    reserved1: [u8; 8],
    pub control: [u8; 16],
    pub k9l: [u8; 16],
    pub key_x_16: [u8; 16],
    reserved2: [u8; 0x190],
}

impl A9lHeader {
    pub fn from_bytes(data: &[u8]) -> Result<Self, FirmError> {
        let mut buf = Cursor::new(data);
        let mut header = A9lHeader {
            key_x_15: [0; 16],
            key_y: [0; 16],
            ctr: [0; 16],
            size_ascii: [0; 8],
            reserved1: [0; 8],
            control: [0; 16],
            k9l: [0; 16],
            key_x_16: [0; 16],
            reserved2: [0; 0x190],
        };
        buf.read_exact(&mut header.key_x_15)?;
        buf.read_exact(&mut header.key_y)?;
        buf.read_exact(&mut header.ctr)?;
        buf.read_exact(&mut header.size_ascii)?;
        buf.read_exact(&mut header.reserved1)?;
        buf.read_exact(&mut header.control)?;
        buf.read_exact(&mut header.k9l)?;
        buf.read_exact(&mut header.key_x_16)?;
        buf.read_exact(&mut header.reserved2)?;
        Ok(header)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut buf = Vec::with_capacity(A9L_HEADER_SIZE);
        buf.write_all(&self.key_x_15)?;
        buf.write_all(&self.key_y)?;
        buf.write_all(&self.ctr)?;
        buf.write_all(&self.size_ascii)?;
        buf.write_all(&self.reserved1)?;
        buf.write_all(&self.control)?;
        buf.write_all(&self.k9l)?;
        buf.write_all(&self.key_x_16)?;
        buf.write_all(&self.reserved2)?;
        Ok(buf)
    }

    /// Decrypted binaries have their encrypted KeyX for keyslot 0x15 zeroed.
    pub fn is_encrypted(&self) -> bool {
        self.key_x_15 != [0; 16]
    }

    pub fn key_tier(&self) -> A9lKeyTier {
        match self.k9l[3] {
            0xFF => A9lKeyTier::Pre95,
            b'1' => A9lKeyTier::Firm95,
            _ => A9lKeyTier::Firm96,
        }
    }

    /// Gets the size of the ARM9 binary, which is stored as a decimal string.
    pub fn binary_size(&self) -> Option<u64> {
        let end = self.size_ascii.iter().position(|&b| b == 0).unwrap_or(self.size_ascii.len());
        let digits = &self.size_ascii[..end];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return None;
        }
        std::str::from_utf8(digits).ok()?.parse().ok()
    }

    /// Programs and selects the keyslot the ARM9 binary is encrypted with. The KeyX of that slot
    /// is carried in the header, encrypted with the keyslot 0x11 normal key of the matching tier.
    pub fn setup_key(&self, ctx: &mut CryptoContext) -> Result<(), FirmError> {
        let (keyslot, id, mut key_x) = match self.key_tier() {
            A9lKeyTier::Pre95 => (0x15, None, self.key_x_15),
            A9lKeyTier::Firm95 => (0x16, Some("95"), self.key_x_16),
            A9lKeyTier::Firm96 => (0x16, Some("96"), self.key_x_16),
        };
        ctx.keydb.load_key(&mut ctx.aes, 0x11, KeyType::Normal, id)?;
        ctx.aes.use_keyslot(0x11)?;
        ctx.aes.ecb_decrypt_block(&mut key_x);
        ctx.aes.setup_key(keyslot, KeyComponent::X, &key_x)?;
        debug!("ARM9 binary uses keyslot 0x{:02X} ({:?})", keyslot, self.key_tier());
        ctx.aes.setup_key(keyslot, KeyComponent::Y, &self.key_y)?;
        ctx.aes.use_keyslot(keyslot)?;
        Ok(())
    }
}

/// Decrypts the ARM9 binary of a FIRM while it is read front to back in chunks. The ARM9 loader
/// header is picked up from the chunk holding it, and its encrypted KeyX is zeroed in the output
/// to mark the binary as decrypted.
#[derive(Debug, Clone, Default)]
pub struct FirmStream {
    header: Option<FirmHeader>,
    arm9: Option<usize>,
    a9l: Option<A9lHeader>,
}

impl FirmStream {
    pub fn new() -> Self {
        FirmStream::default()
    }

    pub fn header(&self) -> Option<&FirmHeader> {
        self.header.as_ref()
    }

    pub fn a9l(&self) -> Option<&A9lHeader> {
        self.a9l.as_ref()
    }

    /// Gets whether the stream has decrypted (or is decrypting) an ARM9 binary.
    pub fn decrypts_arm9(&self) -> bool {
        self.a9l.as_ref().is_some_and(A9lHeader::is_encrypted)
    }

    fn fetch_a9l(&mut self, offset: u64, data: &mut [u8], section: &FirmSection) -> Result<(), FirmError> {
        let a9l_offset = section.offset as u64;
        let end = offset + data.len() as u64;
        if offset > a9l_offset || end <= a9l_offset {
            return Ok(());
        }
        if end < a9l_offset + A9L_HEADER_SIZE as u64 {
            return Err(FirmError::A9lHeaderSplit);
        }
        let start = (a9l_offset - offset) as usize;
        let a9l = A9lHeader::from_bytes(&data[start..start + A9L_HEADER_SIZE])?;
        // Only sections that really carry a loader header get touched.
        let Some(binary_size) = a9l.binary_size() else {
            self.a9l = Some(A9lHeader { key_x_15: [0; 16], ..a9l });
            return Ok(());
        };
        if A9L_BINARY_OFFSET + binary_size > section.size as u64 {
            return Err(FirmError::InvalidA9lSize);
        }
        if a9l.is_encrypted() {
            data[start..start + 16].fill(0);
        }
        self.a9l = Some(a9l);
        Ok(())
    }

    /// Decrypts the next chunk of the FIRM in place.
    pub fn feed(&mut self, ctx: &mut CryptoContext, offset: u64, data: &mut [u8]) -> Result<(), FirmError> {
        if offset == 0 && data.len() >= FIRM_HEADER_SIZE {
            self.header = None;
            self.a9l = None;
            let header = FirmHeader::from_bytes(&data[..FIRM_HEADER_SIZE])?;
            header.validate(0)?;
            self.arm9 = header.arm9_section();
            self.header = Some(header);
        }
        let header = self.header.as_ref().ok_or(FirmError::StreamNotReady)?;
        let Some(arm9) = self.arm9 else {
            return Ok(());
        };
        let section = header.sections[arm9];
        if self.a9l.is_none() {
            self.fetch_a9l(offset, data, &section)?;
        }
        let Some(a9l) = self.a9l.as_ref().filter(|a9l| a9l.is_encrypted()) else {
            return Ok(());
        };
        let binary_offset = section.offset as u64 + A9L_BINARY_OFFSET;
        let binary_end = binary_offset + a9l.binary_size().unwrap_or(0);
        let data_end = offset + data.len() as u64;
        if binary_offset >= data_end || offset >= binary_end {
            return Ok(());
        }
        let start = binary_offset.saturating_sub(offset) as usize;
        let end = (binary_end.min(data_end) - offset) as usize;
        a9l.setup_key(ctx)?;
        ctx.aes.ctr_crypt_byte(&mut data[start..end], offset.saturating_sub(binary_offset), &a9l.ctr);
        Ok(())
    }
}

/// Decrypts the ARM9 binary of a complete FIRM image in place and fixes the hash of its section.
/// Returns false if there was nothing to decrypt.
pub fn decrypt_firm(ctx: &mut CryptoContext, data: &mut [u8]) -> Result<bool, FirmError> {
    let mut stream = FirmStream::new();
    stream.feed(ctx, 0, data)?;
    if !stream.decrypts_arm9() {
        return Ok(false);
    }
    fix_arm9_hash(&stream, data)?;
    Ok(true)
}

/// Recomputes the hash of the ARM9 section in the header at the start of `data`, which has to be
/// the complete image the stream decrypted.
pub fn fix_arm9_hash(stream: &FirmStream, data: &mut [u8]) -> Result<(), FirmError> {
    let (Some(header), Some(arm9)) = (stream.header(), stream.arm9) else {
        return Err(FirmError::StreamNotReady);
    };
    let mut header = header.clone();
    let section = &mut header.sections[arm9];
    let start = section.offset as usize;
    let region = data.get(start..start + section.size as usize)
        .ok_or(FirmError::SizeExceeded { size: section.offset as u64 + section.size as u64, max: data.len() as u64 })?;
    section.hash = sha256(region);
    data[..FIRM_HEADER_SIZE].copy_from_slice(&header.to_bytes()?);
    info!("decrypted ARM9 binary in FIRM section {}", arm9);
    Ok(())
}

/// Validates a complete FIRM image and checks the hashes of all its sections.
pub fn verify_firm(data: &[u8]) -> Result<FirmHeader, FirmError> {
    let header = FirmHeader::from_bytes(data)?;
    header.validate(data.len() as u64)?;
    header.verify_sections(data)?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ContextConfig;
    use crate::crypto::aes::AesEngine;
    use std::fs;

    const ARM9_BINARY_SIZE: usize = 0x400;

    // Builds a FIRM with an ARM11 section and an ARM9 section holding a plain ARM9 binary.
    fn build_test_firm(k9l3: u8) -> Vec<u8> {
        let mut data = vec![0u8; 0x1000];
        data[0x200..0x400].fill(0x33);
        let mut a9l = A9lHeader::from_bytes(&[0u8; A9L_HEADER_SIZE]).unwrap();
        a9l.key_y = [0x42; 16];
        a9l.ctr = [0x07; 16];
        a9l.size_ascii[..4].copy_from_slice(b"1024");
        a9l.k9l[3] = k9l3;
        a9l.key_x_16 = [0x16; 16];
        data[0x400..0x600].copy_from_slice(&a9l.to_bytes().unwrap());
        for (i, b) in data[0xC00..].iter_mut().enumerate() {
            *b = (i * 5) as u8;
        }
        let mut header = FirmHeader::from_bytes(&[0u8; FIRM_HEADER_SIZE]).unwrap();
        header.magic = FIRM_MAGIC;
        header.entry_arm11 = 0x1FF80000;
        header.entry_arm9 = 0x08006800;
        header.sections[0] = FirmSection { offset: 0x200, address: 0x1FF80000, size: 0x200, method: 1, hash: sha256(&data[0x200..0x400]) };
        header.sections[1] = FirmSection { offset: 0x400, address: 0x08006000, size: 0xC00, method: 2, hash: sha256(&data[0x400..0x1000]) };
        data[..FIRM_HEADER_SIZE].copy_from_slice(&header.to_bytes().unwrap());
        data
    }

    // Encrypts the ARM9 binary the way it is shipped, with a nonzero KeyX marker.
    fn encrypt_test_firm(ctx: &mut CryptoContext, data: &mut [u8]) {
        data[0x400..0x410].fill(0xAA);
        let a9l = A9lHeader::from_bytes(&data[0x400..0x600]).unwrap();
        a9l.setup_key(ctx).unwrap();
        ctx.aes.ctr_crypt_byte(&mut data[0xC00..0xC00 + ARM9_BINARY_SIZE], 0, &a9l.ctr);
        let mut header = FirmHeader::from_bytes(data).unwrap();
        header.sections[1].hash = sha256(&data[0x400..0x1000]);
        data[..FIRM_HEADER_SIZE].copy_from_slice(&header.to_bytes().unwrap());
    }

    // Only the keyslot 0x11 normal key is present, as on a console before 9.5.
    fn pre95_context() -> CryptoContext {
        let mut ctx = CryptoContext::new();
        ctx.aes.setup_key(0x11, KeyComponent::Normal, &[0x11; 16]).unwrap();
        ctx
    }

    #[test]
    fn test_validate_firm() {
        let data = build_test_firm(0xFF);
        let header = verify_firm(&data).unwrap();
        assert_eq!(header.arm9_section(), Some(1));
        assert_eq!(header.firm_size(), 0x1000);
        assert!(matches!(header.validate(0x800), Err(FirmError::SizeExceeded { size: 0x1000, max: 0x800 })));

        let mut bad = header.clone();
        bad.magic = *b"FIRN";
        assert!(matches!(bad.validate(0), Err(FirmError::BadMagic)));
        let mut bad = header.clone();
        bad.sections[1].offset = 0x300;
        assert!(matches!(bad.validate(0), Err(FirmError::InvalidSection(1))));
        let mut bad = header.clone();
        bad.sections[1].address = 0x08006008;
        assert!(matches!(bad.validate(0), Err(FirmError::InvalidSection(1))));
        let mut bad = header.clone();
        bad.entry_arm9 = 0x08100000;
        assert!(matches!(bad.validate(0), Err(FirmError::EntryOutsideSections("ARM9"))));
        let mut bad = header;
        bad.sections[1].size = 0x400000;
        assert!(matches!(bad.validate(0), Err(FirmError::SizeExceeded { .. })));
    }

    #[test]
    fn test_pre95_key_x_from_header() {
        let mut a9l = A9lHeader::from_bytes(&[0u8; A9L_HEADER_SIZE]).unwrap();
        a9l.k9l[3] = 0xFF;
        a9l.key_x_15 = [0x5A; 16];
        a9l.key_y = [0x42; 16];
        let mut ctx = pre95_context();
        a9l.setup_key(&mut ctx).unwrap();
        assert_eq!(ctx.aes.active_keyslot(), 0x15);
        assert!(ctx.aes.state().is_loaded(0x15, KeyComponent::X));

        let mut reference = AesEngine::new();
        reference.load_key(0x11, KeyComponent::Normal, &[0x11; 16]).unwrap();
        reference.use_keyslot(0x11).unwrap();
        let mut key_x = [0x5A; 16];
        reference.ecb_decrypt_block(&mut key_x);
        reference.load_key(0x15, KeyComponent::X, &key_x).unwrap();
        reference.load_key(0x15, KeyComponent::Y, &[0x42; 16]).unwrap();
        reference.use_keyslot(0x15).unwrap();
        let mut expected = [0u8; 16];
        reference.ecb_encrypt_block(&mut expected);
        let mut block = [0u8; 16];
        ctx.aes.ecb_encrypt_block(&mut block);
        assert_eq!(block, expected);

        // A different encrypted KeyX in the header gives a different key.
        a9l.key_x_15 = [0x5B; 16];
        a9l.setup_key(&mut ctx).unwrap();
        let mut block = [0u8; 16];
        ctx.aes.ecb_encrypt_block(&mut block);
        assert_ne!(block, expected);
    }

    #[test]
    fn test_verify_section_hashes() {
        let mut data = build_test_firm(0xFF);
        data[0x250] ^= 1;
        assert!(matches!(verify_firm(&data), Err(FirmError::HashMismatch(0))));
    }

    #[test]
    fn test_decrypt_pre95() {
        let plain = build_test_firm(0xFF);
        let mut data = plain.clone();
        encrypt_test_firm(&mut pre95_context(), &mut data);
        assert_ne!(data[0xC00..], plain[0xC00..]);
        verify_firm(&data).unwrap();

        let mut ctx = pre95_context();
        assert!(decrypt_firm(&mut ctx, &mut data).unwrap());
        assert_eq!(data[0x400..], plain[0x400..]);
        verify_firm(&data).unwrap();
        // Already decrypted, so nothing happens the second time.
        assert!(!decrypt_firm(&mut ctx, &mut data).unwrap());
    }

    #[test]
    fn test_stream_chunking() {
        let mut whole = build_test_firm(0xFF);
        encrypt_test_firm(&mut pre95_context(), &mut whole);
        let mut chunked = whole.clone();
        let mut ctx = pre95_context();
        decrypt_firm(&mut ctx, &mut whole).unwrap();

        let mut stream = FirmStream::new();
        for (i, chunk) in chunked.chunks_mut(0x200).enumerate() {
            stream.feed(&mut ctx, i as u64 * 0x200, chunk).unwrap();
        }
        fix_arm9_hash(&stream, &mut chunked).unwrap();
        assert_eq!(chunked, whole);
    }

    #[test]
    fn test_a9l_header_split() {
        let mut data = build_test_firm(0xFF);
        encrypt_test_firm(&mut pre95_context(), &mut data);
        let mut ctx = pre95_context();
        let mut stream = FirmStream::new();
        let (first, rest) = data.split_at_mut(0x500);
        assert!(matches!(stream.feed(&mut ctx, 0, first), Err(FirmError::A9lHeaderSplit)));
        assert!(matches!(FirmStream::new().feed(&mut ctx, 0x500, rest), Err(FirmError::StreamNotReady)));
    }

    #[test]
    fn test_decrypt_needs_key() {
        let mut data = build_test_firm(0xFF);
        encrypt_test_firm(&mut pre95_context(), &mut data);
        let mut ctx = CryptoContext::new();
        assert!(matches!(decrypt_firm(&mut ctx, &mut data), Err(FirmError::KeyDb(_))));
    }

    #[test]
    fn test_decrypt_firm95() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("slot0x11Key95.bin"), [0x95u8; 16]).unwrap();
        let config = ContextConfig { support_dirs: vec![dir.path().to_path_buf()], ..Default::default() };
        let plain = build_test_firm(b'1');
        assert_eq!(A9lHeader::from_bytes(&plain[0x400..0x600]).unwrap().key_tier(), A9lKeyTier::Firm95);
        let mut data = plain.clone();
        encrypt_test_firm(&mut CryptoContext::from_config(&config).unwrap(), &mut data);

        let mut ctx = CryptoContext::from_config(&config).unwrap();
        assert!(decrypt_firm(&mut ctx, &mut data).unwrap());
        assert_eq!(data[0x400..], plain[0x400..]);
        // The 9.6 key is not available.
        let mut data96 = build_test_firm(b'2');
        data96[0x400..0x410].fill(0xAA);
        assert!(matches!(decrypt_firm(&mut ctx, &mut data96), Err(FirmError::KeyDb(_))));
    }

    #[test]
    fn test_a9l_binary_size() {
        let mut a9l = A9lHeader::from_bytes(&[0u8; A9L_HEADER_SIZE]).unwrap();
        assert_eq!(a9l.binary_size(), None);
        a9l.size_ascii = *b"12345678";
        assert_eq!(a9l.binary_size(), Some(12345678));
        a9l.size_ascii[2] = b'x';
        assert_eq!(a9l.binary_size(), None);
    }
}
