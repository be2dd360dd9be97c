// ncch/mod.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements the structures and methods required for parsing, validating and re-encrypting NCCH
// partitions, including the sequential decoder used to process an NCCH in chunks.

pub mod exefs;
pub mod exheader;
pub mod ncchinfo;
pub mod ncsd;

use std::io::{Cursor, Read, Write};
use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use crate::crypto::CryptoContext;
use crate::crypto::aes::{add_ctr, AesError, KeyComponent};
use crate::crypto::keydb::{KeyDbError, KeyType};
use crate::crypto::seed::SeedError;
use crate::crypto::sha::sha256;
use crate::ncch::exefs::{uses_primary_key, ExeFsError, ExeFsHeader, EXEFS_HEADER_SIZE};

pub const NCCH_MEDIA_UNIT: u64 = 0x200;
pub const NCCH_HEADER_SIZE: usize = 0x200;
pub const NCCH_EXTHDR_OFFSET: u64 = 0x200;
pub const NCCH_EXTHDR_SIZE: u64 = 0x800;
const NCCH_FLAG3_OFFSET: u64 = 0x188 + 3;
const NCCH_FLAG7_OFFSET: u64 = 0x188 + 7;
const NCCH_FIXED_KEYSLOT: u8 = 0x11;
const NCCH_PRIMARY_KEYSLOT: u8 = 0x2C;
const FIXED_SYSTEM_KEY: [u8; 16] = [
    0x52, 0x7C, 0xE6, 0x30, 0xA9, 0xCA, 0x30, 0x5F, 0x36, 0x96, 0xF3, 0xCD, 0xE9, 0x54, 0x19, 0x4B,
];

#[derive(Debug, Error)]
pub enum NcchError {
    #[error("NCCH header has bad magic (expected NCCH)")]
    BadMagic,
    #[error("NCCH {0} region overlaps a previous region")]
    Overlap(&'static str),
    #[error("NCCH regions end at 0x{end:X} media units but the NCCH is only 0x{size:X} units")]
    SizeExceeded { end: u64, size: u64 },
    #[error("NCCH declares 0x{declared:X} bytes but only 0x{actual:X} bytes are available")]
    FileSizeMismatch { declared: u64, actual: u64 },
    #[error("NCCH uses unknown secondary crypto 0x{0:02X}")]
    UnknownCrypto(u8),
    #[error("ExeFS data cannot be processed without its header")]
    MissingExeFsHeader,
    #[error("NCCH stream was not started with a valid header")]
    StreamNotReady,
    #[error("NCCH key setup failed")]
    KeyDb(#[from] KeyDbError),
    #[error("NCCH seed lookup failed")]
    Seed(#[from] SeedError),
    #[error("AES engine error")]
    Aes(#[from] AesError),
    #[error("NCCH ExeFS is invalid")]
    ExeFs(#[from] ExeFsError),
    #[error("NCCH data is not in a valid format")]
    IO(#[from] std::io::Error),
}

bitflags! {
    /// The crypto mode bits of NCCH flag byte 7.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NcchFlags: u8 {
        const FIXED_KEY = 0x01;
        const NO_MOUNT_ROMFS = 0x02;
        const NO_CRYPTO = 0x04;
        const SEED_CRYPTO = 0x20;
    }
}

/// The NCCH sections that have their own counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcchSection {
    ExHeader = 1,
    ExeFs = 2,
    RomFs = 3,
}

/// How an NCCH is (or should be) encrypted: the secondary key selector from flag byte 3 and the
/// crypto bits from flag byte 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NcchCrypto {
    pub secondary: u8,
    pub flags: NcchFlags,
}

impl NcchCrypto {
    /// No encryption at all.
    pub const NONE: NcchCrypto = NcchCrypto { secondary: 0, flags: NcchFlags::NO_CRYPTO };
    /// Original (pre-7.x) crypto, using the primary keyslot for everything.
    pub const STANDARD: NcchCrypto = NcchCrypto { secondary: 0, flags: NcchFlags::empty() };

    pub fn new(secondary: u8, flags: NcchFlags) -> Self {
        if flags.contains(NcchFlags::NO_CRYPTO) {
            return Self::NONE;
        }
        NcchCrypto {
            secondary,
            flags: flags & (NcchFlags::FIXED_KEY | NcchFlags::SEED_CRYPTO),
        }
    }

    /// Builds the crypto value from raw flag bytes 3 and 7.
    pub fn from_flags(flag3: u8, flag7: u8) -> Self {
        Self::new(flag3, NcchFlags::from_bits_retain(flag7))
    }

    pub fn is_no_crypto(&self) -> bool {
        self.flags.contains(NcchFlags::NO_CRYPTO)
    }

    pub fn has_fixed_key(&self) -> bool {
        self.flags.contains(NcchFlags::FIXED_KEY)
    }

    pub fn has_seed_crypto(&self) -> bool {
        self.flags.contains(NcchFlags::SEED_CRYPTO)
    }

    /// Gets the keyslot used for content with key ID `keyid` (0 for the primary key, 1 for the
    /// secondary key).
    pub fn keyslot(&self, keyid: u32) -> Result<u8, NcchError> {
        if keyid == 0 || self.secondary == 0 {
            return Ok(NCCH_PRIMARY_KEYSLOT);
        }
        match self.secondary {
            0x01 => Ok(0x25),
            0x0A => Ok(0x18),
            0x0B => Ok(0x1B),
            other => Err(NcchError::UnknownCrypto(other)),
        }
    }

    /// Gets a short description of the crypto, like the ones used by other 3DS tools.
    pub fn describe(&self) -> String {
        if self.is_no_crypto() {
            return String::from("none");
        }
        let mut desc = if self.has_fixed_key() {
            String::from("fixed key")
        } else {
            match self.secondary {
                0x00 => String::from("standard"),
                0x01 => String::from("secure3 (7.x)"),
                0x0A => String::from("secure3"),
                0x0B => String::from("secure4"),
                other => format!("unknown (0x{:02X})", other),
            }
        };
        if self.has_seed_crypto() {
            desc.push_str(" + seed");
        }
        desc
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NcchHeader {
    pub signature: [u8; 0x100],
    pub magic: [u8; 4],
    pub size: u32,
    pub partition_id: u64,
    pub maker_code: u16,
    pub version: u16,
    pub hash_seed: [u8; 4],
    pub program_id: u64,
    reserved0: [u8; 0x10],
    pub hash_logo: [u8; 0x20],
    pub product_code: [u8; 0x10],
    pub hash_exthdr: [u8; 0x20],
    pub size_exthdr: u32,
    reserved1: [u8; 4],
    pub flags: [u8; 8],
    pub offset_plain: u32,
    pub size_plain: u32,
    pub offset_logo: u32,
    pub size_logo: u32,
    pub offset_exefs: u32,
    pub size_exefs: u32,
    pub size_exefs_hash: u32,
    reserved2: [u8; 4],
    pub offset_romfs: u32,
    pub size_romfs: u32,
    pub size_romfs_hash: u32,
    reserved3: [u8; 4],
    pub hash_exefs: [u8; 0x20],
    pub hash_romfs: [u8; 0x20],
}

impl NcchHeader {
    pub fn from_bytes(data: &[u8]) -> Result<Self, NcchError> {
        let mut buf = Cursor::new(data);
        let mut signature = [0u8; 0x100];
        buf.read_exact(&mut signature)?;
        let mut magic = [0u8; 4];
        buf.read_exact(&mut magic)?;
        let size = buf.read_u32::<LittleEndian>()?;
        let partition_id = buf.read_u64::<LittleEndian>()?;
        let maker_code = buf.read_u16::<LittleEndian>()?;
        let version = buf.read_u16::<LittleEndian>()?;
        let mut hash_seed = [0u8; 4];
        buf.read_exact(&mut hash_seed)?;
        let program_id = buf.read_u64::<LittleEndian>()?;
        let mut reserved0 = [0u8; 0x10];
        buf.read_exact(&mut reserved0)?;
        let mut hash_logo = [0u8; 0x20];
        buf.read_exact(&mut hash_logo)?;
        let mut product_code = [0u8; 0x10];
        buf.read_exact(&mut product_code)?;
        let mut hash_exthdr = [0u8; 0x20];
        buf.read_exact(&mut hash_exthdr)?;
        let size_exthdr = buf.read_u32::<LittleEndian>()?;
        let mut reserved1 = [0u8; 4];
        buf.read_exact(&mut reserved1)?;
        let mut flags = [0u8; 8];
        buf.read_exact(&mut flags)?;
        let offset_plain = buf.read_u32::<LittleEndian>()?;
        let size_plain = buf.read_u32::<LittleEndian>()?;
        let offset_logo = buf.read_u32::<LittleEndian>()?;
        let size_logo = buf.read_u32::<LittleEndian>()?;
        let offset_exefs = buf.read_u32::<LittleEndian>()?;
        let size_exefs = buf.read_u32::<LittleEndian>()?;
        let size_exefs_hash = buf.read_u32::<LittleEndian>()?;
        let mut reserved2 = [0u8; 4];
        buf.read_exact(&mut reserved2)?;
        let offset_romfs = buf.read_u32::<LittleEndian>()?;
        let size_romfs = buf.read_u32::<LittleEndian>()?;
        let size_romfs_hash = buf.read_u32::<LittleEndian>()?;
        let mut reserved3 = [0u8; 4];
        buf.read_exact(&mut reserved3)?;
        let mut hash_exefs = [0u8; 0x20];
        buf.read_exact(&mut hash_exefs)?;
        let mut hash_romfs = [0u8; 0x20];
        buf.read_exact(&mut hash_romfs)?;
        Ok(NcchHeader {
            signature,
            magic,
            size,
            partition_id,
            maker_code,
            version,
            hash_seed,
            program_id,
            reserved0,
            hash_logo,
            product_code,
            hash_exthdr,
            size_exthdr,
            reserved1,
            flags,
            offset_plain,
            size_plain,
            offset_logo,
            size_logo,
            offset_exefs,
            size_exefs,
            size_exefs_hash,
            reserved2,
            offset_romfs,
            size_romfs,
            size_romfs_hash,
            reserved3,
            hash_exefs,
            hash_romfs,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut buf: Vec<u8> = Vec::with_capacity(NCCH_HEADER_SIZE);
        buf.write_all(&self.signature)?;
        buf.write_all(&self.magic)?;
        buf.write_u32::<LittleEndian>(self.size)?;
        buf.write_u64::<LittleEndian>(self.partition_id)?;
        buf.write_u16::<LittleEndian>(self.maker_code)?;
        buf.write_u16::<LittleEndian>(self.version)?;
        buf.write_all(&self.hash_seed)?;
        buf.write_u64::<LittleEndian>(self.program_id)?;
        buf.write_all(&self.reserved0)?;
        buf.write_all(&self.hash_logo)?;
        buf.write_all(&self.product_code)?;
        buf.write_all(&self.hash_exthdr)?;
        buf.write_u32::<LittleEndian>(self.size_exthdr)?;
        buf.write_all(&self.reserved1)?;
        buf.write_all(&self.flags)?;
        buf.write_u32::<LittleEndian>(self.offset_plain)?;
        buf.write_u32::<LittleEndian>(self.size_plain)?;
        buf.write_u32::<LittleEndian>(self.offset_logo)?;
        buf.write_u32::<LittleEndian>(self.size_logo)?;
        buf.write_u32::<LittleEndian>(self.offset_exefs)?;
        buf.write_u32::<LittleEndian>(self.size_exefs)?;
        buf.write_u32::<LittleEndian>(self.size_exefs_hash)?;
        buf.write_all(&self.reserved2)?;
        buf.write_u32::<LittleEndian>(self.offset_romfs)?;
        buf.write_u32::<LittleEndian>(self.size_romfs)?;
        buf.write_u32::<LittleEndian>(self.size_romfs_hash)?;
        buf.write_all(&self.reserved3)?;
        buf.write_all(&self.hash_exefs)?;
        buf.write_all(&self.hash_romfs)?;
        Ok(buf)
    }

    /// Gets the current crypto of this NCCH.
    pub fn crypto(&self) -> NcchCrypto {
        NcchCrypto::from_flags(self.flags[3], self.flags[7])
    }

    /// Updates the flag bytes to describe the given crypto.
    pub fn set_crypto(&mut self, crypto: NcchCrypto) {
        self.flags[3] = crypto.secondary;
        self.flags[7] = patched_flag7(self.flags[7], crypto);
    }

    pub fn is_encrypted(&self) -> bool {
        !self.crypto().is_no_crypto()
    }

    /// Checks if the program ID belongs to a system title.
    pub fn is_system_title(&self) -> bool {
        (self.program_id >> 32) & 0x10 != 0
    }

    pub fn product_code(&self) -> String {
        String::from_utf8_lossy(&self.product_code).trim_end_matches('\0').to_owned()
    }

    /// Gets the size of the whole NCCH in bytes.
    pub fn ncch_size(&self) -> u64 {
        self.size as u64 * NCCH_MEDIA_UNIT
    }

    pub fn exefs_offset(&self) -> u64 {
        self.offset_exefs as u64 * NCCH_MEDIA_UNIT
    }

    pub fn exefs_size(&self) -> u64 {
        self.size_exefs as u64 * NCCH_MEDIA_UNIT
    }

    pub fn romfs_offset(&self) -> u64 {
        self.offset_romfs as u64 * NCCH_MEDIA_UNIT
    }

    pub fn romfs_size(&self) -> u64 {
        self.size_romfs as u64 * NCCH_MEDIA_UNIT
    }

    /// Checks that the header is structurally sound. Regions are checked in their canonical order
    /// against a running end marker, so each one has to start after the previous one ends.
    /// `fsize` is the number of bytes actually available, or 0 to skip that check.
    pub fn validate(&self, fsize: u64) -> Result<(), NcchError> {
        if &self.magic != b"NCCH" {
            return Err(NcchError::BadMagic);
        }
        let size = self.size as u64;
        let mut units = (NCCH_EXTHDR_OFFSET + self.size_exthdr as u64) / NCCH_MEDIA_UNIT;
        if self.size_exthdr != 0 && units > size {
            return Err(NcchError::SizeExceeded { end: units, size });
        }
        let regions = [
            ("plain", self.offset_plain, self.size_plain),
            ("logo", self.offset_logo, self.size_logo),
            ("ExeFS", self.offset_exefs, self.size_exefs),
            ("RomFS", self.offset_romfs, self.size_romfs),
        ];
        for (name, offset, region_size) in regions {
            if region_size == 0 {
                continue;
            }
            if (offset as u64) < units {
                return Err(NcchError::Overlap(name));
            }
            units = offset as u64 + region_size as u64;
        }
        if units > size {
            return Err(NcchError::SizeExceeded { end: units, size });
        }
        if fsize != 0 && self.ncch_size() > fsize {
            return Err(NcchError::FileSizeMismatch { declared: self.ncch_size(), actual: fsize });
        }
        Ok(())
    }

    /// Gets the base counter for a section. Version 1 NCCHs count from the partition ID plus the
    /// byte offset of the section, every other version uses the partition ID and section number.
    pub fn get_ctr(&self, section: NcchSection) -> [u8; 16] {
        let mut ctr = [0u8; 16];
        if self.version == 1 {
            ctr[..8].copy_from_slice(&self.partition_id.to_le_bytes());
            let offset = match section {
                NcchSection::ExHeader => NCCH_EXTHDR_OFFSET,
                NcchSection::ExeFs => self.exefs_offset(),
                NcchSection::RomFs => self.romfs_offset(),
            };
            add_ctr(&mut ctr, offset);
        } else {
            ctr[..8].copy_from_slice(&self.partition_id.to_be_bytes());
            ctr[8] = section as u8;
        }
        ctr
    }
}

fn patched_flag7(flag7: u8, crypto: NcchCrypto) -> u8 {
    let mut flag7 = flag7 & !(NcchFlags::FIXED_KEY | NcchFlags::SEED_CRYPTO | NcchFlags::NO_CRYPTO).bits();
    flag7 |= (crypto.flags & (NcchFlags::FIXED_KEY | NcchFlags::SEED_CRYPTO)).bits();
    if crypto.is_no_crypto() {
        flag7 |= NcchFlags::NO_CRYPTO.bits();
    }
    flag7
}

/// Programs and selects the key for NCCH content with key ID `keyid`. A fixed key takes priority
/// over everything else, then the KeyY is taken from the header signature, or derived from the
/// title's seed for seed crypto.
pub fn set_ncch_key(ctx: &mut CryptoContext, header: &NcchHeader, crypto: NcchCrypto, keyid: u32) -> Result<(), NcchError> {
    if crypto.is_no_crypto() {
        return Ok(());
    }
    let keyslot = crypto.keyslot(keyid)?;

    if crypto.has_fixed_key() {
        let key = if header.is_system_title() { FIXED_SYSTEM_KEY } else { [0u8; 16] };
        ctx.aes.setup_key(NCCH_FIXED_KEYSLOT, KeyComponent::Normal, &key)?;
        ctx.aes.use_keyslot(NCCH_FIXED_KEYSLOT)?;
        return Ok(());
    }

    ctx.keydb.load_key(&mut ctx.aes, keyslot, KeyType::X, None)?;
    let mut key_y = [0u8; 16];
    if crypto.has_seed_crypto() {
        let seed = ctx.seeds.resolve_seed(header.program_id, &header.hash_seed)?;
        let mut keydata = [0u8; 32];
        keydata[..16].copy_from_slice(&header.signature[..16]);
        keydata[16..].copy_from_slice(&seed);
        key_y.copy_from_slice(&sha256(&keydata)[..16]);
    } else {
        key_y.copy_from_slice(&header.signature[..16]);
    }
    ctx.aes.setup_key(keyslot, KeyComponent::Y, &key_y)?;
    ctx.aes.use_keyslot(keyslot)?;
    Ok(())
}

// Runs CTR over the part of `data` (which starts at `offset` in the NCCH) that falls inside a
// section. `ctr_offset` is the offset of the section from the start of its counter.
#[allow(clippy::too_many_arguments)]
fn crypt_ncch_section(
    ctx: &mut CryptoContext,
    data: &mut [u8],
    offset: u64,
    section_offset: u64,
    section_size: u64,
    ctr_offset: u64,
    header: &NcchHeader,
    section: NcchSection,
    crypto: NcchCrypto,
    keyid: u32,
) -> Result<(), NcchError> {
    let data_end = offset + data.len() as u64;
    if section_size == 0 || section_offset >= data_end || offset >= section_offset + section_size {
        return Ok(());
    }
    let start = section_offset.saturating_sub(offset) as usize;
    let section_start = offset.saturating_sub(section_offset);
    let end = (section_offset + section_size).min(data_end) - offset;
    set_ncch_key(ctx, header, crypto, keyid)?;
    let ctr = header.get_ctr(section);
    ctx.aes.ctr_crypt_byte(&mut data[start..end as usize], section_start + ctr_offset, &ctr);
    Ok(())
}

// CTR is its own inverse, so this one pass both decrypts content that is encrypted with `crypto`
// and encrypts plain content to `crypto`.
fn crypt_ncch_sections(
    ctx: &mut CryptoContext,
    data: &mut [u8],
    offset: u64,
    header: &NcchHeader,
    exefs: Option<&ExeFsHeader>,
    crypto: NcchCrypto,
) -> Result<(), NcchError> {
    if crypto.is_no_crypto() {
        return Ok(());
    }
    if header.size_exthdr > 0 {
        crypt_ncch_section(ctx, data, offset, NCCH_EXTHDR_OFFSET, NCCH_EXTHDR_SIZE, 0, header, NcchSection::ExHeader, crypto, 0)?;
    }
    if header.size_exefs > 0 {
        let offset_exefs = header.exefs_offset();
        let size_exefs = header.exefs_size();
        let header_size = EXEFS_HEADER_SIZE as u64;
        crypt_ncch_section(ctx, data, offset, offset_exefs, header_size, 0, header, NcchSection::ExeFs, crypto, 0)?;
        if let Some(exefs) = exefs {
            for (_, file) in exefs.present_files() {
                let file_offset = header_size + file.offset as u64;
                let keyid = if uses_primary_key(file) { 0 } else { 1 };
                crypt_ncch_section(
                    ctx,
                    data,
                    offset,
                    offset_exefs + file_offset,
                    (file.size as u64).next_multiple_of(NCCH_MEDIA_UNIT),
                    file_offset,
                    header,
                    NcchSection::ExeFs,
                    crypto,
                    keyid,
                )?;
            }
        } else if offset < offset_exefs + size_exefs && offset + data.len() as u64 > offset_exefs + header_size {
            // Without the file table the whole body can only be handled if every file shares a key.
            if crypto.secondary != 0 {
                return Err(NcchError::MissingExeFsHeader);
            }
            crypt_ncch_section(
                ctx,
                data,
                offset,
                offset_exefs + header_size,
                size_exefs - header_size,
                header_size,
                header,
                NcchSection::ExeFs,
                crypto,
                0,
            )?;
        }
    }
    if header.size_romfs > 0 {
        crypt_ncch_section(ctx, data, offset, header.romfs_offset(), header.romfs_size(), 0, header, NcchSection::RomFs, crypto, 1)?;
    }
    Ok(())
}

/// Decrypts the part of an NCCH held in `data`, which starts `offset` bytes into the NCCH.
pub fn decrypt_ncch(ctx: &mut CryptoContext, data: &mut [u8], offset: u64, header: &NcchHeader, exefs: Option<&ExeFsHeader>) -> Result<(), NcchError> {
    crypt_ncch_sections(ctx, data, offset, header, exefs, header.crypto())
}

/// Encrypts the part of a plain NCCH held in `data` to the given crypto.
pub fn encrypt_ncch(ctx: &mut CryptoContext, data: &mut [u8], offset: u64, header: &NcchHeader, exefs: Option<&ExeFsHeader>, crypto: NcchCrypto) -> Result<(), NcchError> {
    crypt_ncch_sections(ctx, data, offset, header, exefs, crypto)
}

/// Converts the part of an NCCH held in `data` from its current crypto to `target`. Flag bytes that
/// fall inside `data` are patched to the target crypto first. Nothing happens at all if the NCCH
/// already has the target crypto.
pub fn crypt_ncch(
    ctx: &mut CryptoContext,
    data: &mut [u8],
    offset: u64,
    header: &NcchHeader,
    exefs: Option<&ExeFsHeader>,
    target: NcchCrypto,
) -> Result<(), NcchError> {
    let current = header.crypto();
    if current == target {
        return Ok(());
    }
    let end = offset + data.len() as u64;
    if (offset..end).contains(&NCCH_FLAG3_OFFSET) {
        data[(NCCH_FLAG3_OFFSET - offset) as usize] = target.secondary;
    }
    if (offset..end).contains(&NCCH_FLAG7_OFFSET) {
        let flag7 = &mut data[(NCCH_FLAG7_OFFSET - offset) as usize];
        *flag7 = patched_flag7(*flag7, target);
    }
    if !current.is_no_crypto() {
        decrypt_ncch(ctx, data, offset, header, exefs)?;
    }
    if !target.is_no_crypto() {
        encrypt_ncch(ctx, data, offset, header, exefs, target)?;
    }
    Ok(())
}

/// Converts an NCCH to another crypto while it is read front to back in chunks. The header is
/// taken from the chunk that starts at offset 0, and the ExeFS header from the first chunk that
/// holds all of it. Chunks have to be fed in order without gaps.
#[derive(Debug, Clone)]
pub struct NcchStream {
    header: Option<NcchHeader>,
    exefs: Option<ExeFsHeader>,
    target: NcchCrypto,
}

impl NcchStream {
    pub fn new(target: NcchCrypto) -> Self {
        NcchStream {
            header: None,
            exefs: None,
            target,
        }
    }

    /// Gets the header of the NCCH being processed, as it was before conversion.
    pub fn header(&self) -> Option<&NcchHeader> {
        self.header.as_ref()
    }

    pub fn exefs(&self) -> Option<&ExeFsHeader> {
        self.exefs.as_ref()
    }

    pub fn target(&self) -> NcchCrypto {
        self.target
    }

    fn fetch_exefs(&mut self, ctx: &mut CryptoContext, offset: u64, data: &[u8], header: &NcchHeader) -> Result<(), NcchError> {
        let offset_exefs = header.exefs_offset();
        let end = offset + data.len() as u64;
        if header.size_exefs == 0 || offset > offset_exefs || end < offset_exefs + EXEFS_HEADER_SIZE as u64 {
            return Ok(());
        }
        let start = (offset_exefs - offset) as usize;
        let mut raw = data[start..start + EXEFS_HEADER_SIZE].to_vec();
        if header.is_encrypted() {
            decrypt_ncch(ctx, &mut raw, offset_exefs, header, None)?;
        }
        let exefs = ExeFsHeader::from_bytes(&raw)?;
        self.exefs = match exefs.validate(header.exefs_size()) {
            Ok(()) => Some(exefs),
            Err(err) => {
                log::warn!("ignoring invalid ExeFS header: {}", err);
                None
            },
        };
        Ok(())
    }

    /// Converts the next chunk of the NCCH in place.
    pub fn feed(&mut self, ctx: &mut CryptoContext, offset: u64, data: &mut [u8]) -> Result<(), NcchError> {
        if offset == 0 && data.len() >= NCCH_HEADER_SIZE {
            self.header = None;
            self.exefs = None;
            let header = NcchHeader::from_bytes(&data[..NCCH_HEADER_SIZE])?;
            header.validate(0)?;
            self.header = Some(header);
        }
        let header = self.header.clone().ok_or(NcchError::StreamNotReady)?;
        if self.exefs.is_none() {
            self.fetch_exefs(ctx, offset, data, &header)?;
        }
        crypt_ncch(ctx, data, offset, &header, self.exefs.as_ref(), self.target)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::test_utils::*;
    use crate::crypto::seed::seed_hash;
    use rand::Rng;

    fn header_of(data: &[u8]) -> NcchHeader {
        NcchHeader::from_bytes(&data[..NCCH_HEADER_SIZE]).unwrap()
    }

    fn exefs_of(data: &[u8], header: &NcchHeader) -> ExeFsHeader {
        let start = header.exefs_offset() as usize;
        ExeFsHeader::from_bytes(&data[start..start + EXEFS_HEADER_SIZE]).unwrap()
    }

    #[test]
    fn test_header_roundtrip() {
        let data = build_test_ncch(2);
        let header = header_of(&data);
        assert_eq!(header.to_bytes().unwrap(), data[..NCCH_HEADER_SIZE]);
        assert_eq!(header.product_code(), "CTR-P-TEST");
        assert!(!header.is_encrypted());
        assert!(!header.is_system_title());
        header.validate(data.len() as u64).unwrap();
        assert!(matches!(header.validate(0x200), Err(NcchError::FileSizeMismatch { .. })));
    }

    #[test]
    fn test_crypto_flags() {
        assert_eq!(NcchCrypto::from_flags(0x0A, 0x04), NcchCrypto::NONE);
        let crypto = NcchCrypto::from_flags(0x0A, 0x22);
        assert_eq!(crypto.secondary, 0x0A);
        assert!(crypto.has_seed_crypto());
        assert!(!crypto.has_fixed_key());
        assert_eq!(crypto.flags, NcchFlags::SEED_CRYPTO);
        assert_eq!(crypto.keyslot(0).unwrap(), 0x2C);
        assert_eq!(crypto.keyslot(1).unwrap(), 0x18);
        assert_eq!(NcchCrypto::from_flags(0x01, 0).keyslot(1).unwrap(), 0x25);
        assert_eq!(NcchCrypto::from_flags(0x0B, 0).keyslot(1).unwrap(), 0x1B);
        assert!(matches!(NcchCrypto::from_flags(0x05, 0).keyslot(1), Err(NcchError::UnknownCrypto(0x05))));
        assert_eq!(crypto.describe(), "secure3 + seed");
    }

    #[test]
    fn test_ctr() {
        let data = build_test_ncch(2);
        let header = header_of(&data);
        let ctr = header.get_ctr(NcchSection::RomFs);
        assert_eq!(ctr[..8], [0x00, 0x04, 0x00, 0x00, 0x00, 0xAB, 0xCD, 0x00]);
        assert_eq!(ctr[8], 3);
        assert_eq!(ctr[9..], [0u8; 7]);

        let header = header_of(&build_test_ncch(1));
        let ctr = header.get_ctr(NcchSection::ExeFs);
        assert_eq!(ctr[..8], TEST_PROGRAM_ID.to_le_bytes());
        assert_eq!(ctr[12..], 0x1400u32.to_be_bytes());
        let ctr = header.get_ctr(NcchSection::ExHeader);
        assert_eq!(ctr[12..], 0x200u32.to_be_bytes());
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let header = header_of(&build_test_ncch(2));
        let mut bad = header.clone();
        bad.offset_romfs = bad.offset_exefs + 1;
        assert!(matches!(bad.validate(0), Err(NcchError::Overlap("RomFS"))));
        let mut bad = header.clone();
        bad.offset_exefs = 2;
        assert!(matches!(bad.validate(0), Err(NcchError::Overlap("ExeFS"))));
        let mut bad = header.clone();
        bad.size -= 1;
        assert!(matches!(bad.validate(0), Err(NcchError::SizeExceeded { .. })));
        let mut bad = header;
        bad.magic = *b"NCSD";
        assert!(matches!(bad.validate(0), Err(NcchError::BadMagic)));
    }

    #[test]
    fn test_validate_random_layouts() {
        let mut rng = rand::rng();
        let base = header_of(&build_test_ncch(2));
        for _ in 0..200 {
            let mut header = base.clone();
            let exefs_offset: u32 = rng.random_range(5..64);
            let exefs_size: u32 = rng.random_range(1..64);
            let romfs_size: u32 = rng.random_range(1..64);
            let gap: i64 = rng.random_range(-(exefs_size as i64)..8);
            let romfs_offset = (exefs_offset as i64 + exefs_size as i64 + gap) as u32;
            header.offset_exefs = exefs_offset;
            header.size_exefs = exefs_size;
            header.offset_romfs = romfs_offset;
            header.size_romfs = romfs_size;
            header.size = romfs_offset.max(exefs_offset + exefs_size) + romfs_size;
            if gap < 0 {
                assert!(header.validate(0).is_err());
            } else {
                header.validate(0).unwrap();
            }
        }
    }

    #[test]
    fn test_crypt_same_crypto_is_noop() {
        let mut ctx = CryptoContext::new();
        let data = build_test_ncch(2);
        let header = header_of(&data);
        let mut out = data.clone();
        crypt_ncch(&mut ctx, &mut out, 0, &header, None, NcchCrypto::NONE).unwrap();
        assert_eq!(out, data);
        assert_eq!(ctx.aes.state(), CryptoContext::new().aes.state());
    }

    #[test]
    fn test_encrypt_standard_and_back() {
        let mut ctx = ncch_context();
        let plain = build_test_ncch(2);
        let header = header_of(&plain);
        let exefs = exefs_of(&plain, &header);
        let mut data = plain.clone();
        crypt_ncch(&mut ctx, &mut data, 0, &header, Some(&exefs), NcchCrypto::STANDARD).unwrap();

        let encrypted = header_of(&data);
        assert_eq!(encrypted.crypto(), NcchCrypto::STANDARD);
        assert_eq!(encrypted.flags[7] & 0x04, 0);
        encrypted.validate(data.len() as u64).unwrap();
        assert_eq!(data[..0x188], plain[..0x188]);
        assert_ne!(data[0x200..0x600], plain[0x200..0x600]);
        let exefs_start = header.exefs_offset() as usize;
        assert_ne!(data[exefs_start..exefs_start + 0x200], plain[exefs_start..exefs_start + 0x200]);
        let romfs_start = header.romfs_offset() as usize;
        assert_ne!(data[romfs_start..], plain[romfs_start..]);
        // Padding between the ExHeader and the ExeFS is not part of any section.
        assert_eq!(data[0xA00..0x1400], plain[0xA00..0x1400]);

        let encrypted_exefs = exefs_of(&plain, &header);
        crypt_ncch(&mut ctx, &mut data, 0, &encrypted, Some(&encrypted_exefs), NcchCrypto::NONE).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn test_secondary_key_spares_icon() {
        let mut ctx = ncch_context();
        let plain = build_test_ncch(2);
        let header = header_of(&plain);
        let exefs = exefs_of(&plain, &header);
        let mut standard = plain.clone();
        crypt_ncch(&mut ctx, &mut standard, 0, &header, Some(&exefs), NcchCrypto::STANDARD).unwrap();
        let mut secure = plain.clone();
        crypt_ncch(&mut ctx, &mut secure, 0, &header, Some(&exefs), NcchCrypto::from_flags(0x01, 0)).unwrap();

        let body = header.exefs_offset() as usize + EXEFS_HEADER_SIZE;
        let (_, icon) = exefs.find("icon").unwrap();
        let icon_start = body + icon.offset as usize;
        assert_eq!(standard[icon_start..icon_start + 0x100], secure[icon_start..icon_start + 0x100]);
        assert_eq!(standard[0x200..0xA00], secure[0x200..0xA00]);
        assert_ne!(standard[body..body + 0x280], secure[body..body + 0x280]);
        assert_ne!(standard[header.romfs_offset() as usize..], secure[header.romfs_offset() as usize..]);
    }

    #[test]
    fn test_fixed_key_without_keydb() {
        let mut ctx = CryptoContext::new();
        let plain = build_test_ncch(2);
        let header = header_of(&plain);
        let exefs = exefs_of(&plain, &header);
        let mut data = plain.clone();
        let fixed = NcchCrypto::from_flags(0, 0x01);
        crypt_ncch(&mut ctx, &mut data, 0, &header, Some(&exefs), fixed).unwrap();
        assert_eq!(header_of(&data).crypto(), fixed);

        let mut expected = plain[0x200..0xA00].to_vec();
        ctx.aes.setup_key(0x11, KeyComponent::Normal, &[0u8; 16]).unwrap();
        ctx.aes.use_keyslot(0x11).unwrap();
        ctx.aes.ctr_crypt_byte(&mut expected, 0, &header.get_ctr(NcchSection::ExHeader));
        assert_eq!(data[0x200..0xA00], expected);
    }

    #[test]
    fn test_missing_keyx() {
        let mut ctx = CryptoContext::new();
        let mut data = build_test_ncch(2);
        let header = header_of(&data);
        let result = crypt_ncch(&mut ctx, &mut data, 0, &header, None, NcchCrypto::STANDARD);
        assert!(matches!(result, Err(NcchError::KeyDb(KeyDbError::KeyNotFound { slot: 0x2C, .. }))));
    }

    #[test]
    fn test_seed_crypto() {
        let mut ctx = ncch_context();
        let seed = [0x5Eu8; 16];
        let mut plain = build_test_ncch(2);
        let mut header = header_of(&plain);
        header.hash_seed = seed_hash(&seed, TEST_PROGRAM_ID);
        plain[..NCCH_HEADER_SIZE].copy_from_slice(&header.to_bytes().unwrap());
        let seeded = NcchCrypto::from_flags(0, NcchFlags::SEED_CRYPTO.bits());

        let mut data = plain.clone();
        let result = crypt_ncch(&mut ctx, &mut data, 0, &header, None, seeded);
        assert!(matches!(result, Err(NcchError::Seed(SeedError::SeedNotFound(TEST_PROGRAM_ID)))));

        ctx.seeds.add_known_seed(TEST_PROGRAM_ID, seed);
        let mut data = plain.clone();
        crypt_ncch(&mut ctx, &mut data, 0, &header, None, seeded).unwrap();

        let mut keydata = header.signature[..16].to_vec();
        keydata.extend_from_slice(&seed);
        let mut key_y = [0u8; 16];
        key_y.copy_from_slice(&sha256(&keydata)[..16]);
        ctx.aes.setup_key(0x2C, KeyComponent::Y, &key_y).unwrap();
        ctx.aes.use_keyslot(0x2C).unwrap();
        let mut expected = plain[0x200..0xA00].to_vec();
        ctx.aes.ctr_crypt_byte(&mut expected, 0, &header.get_ctr(NcchSection::ExHeader));
        assert_eq!(data[0x200..0xA00], expected);
    }

    #[test]
    fn test_stream_matches_single_pass() {
        let mut ctx = ncch_context();
        let plain = build_test_ncch(1);
        let header = header_of(&plain);
        let exefs = exefs_of(&plain, &header);
        let mut expected = plain.clone();
        crypt_ncch(&mut ctx, &mut expected, 0, &header, Some(&exefs), NcchCrypto::from_flags(0x0B, 0)).unwrap();

        let mut rng = rand::rng();
        for _ in 0..10 {
            let mut stream = NcchStream::new(NcchCrypto::from_flags(0x0B, 0));
            let mut data = plain.clone();
            // The ExeFS header has to arrive in one piece for secondary key crypto.
            let first = header.exefs_offset() as usize + EXEFS_HEADER_SIZE;
            let mut offset = 0;
            while offset < data.len() {
                let len = if offset == 0 { first } else { rng.random_range(1..0x300).min(data.len() - offset) };
                stream.feed(&mut ctx, offset as u64, &mut data[offset..offset + len]).unwrap();
                offset += len;
            }
            assert_eq!(data, expected);
        }
    }

    #[test]
    fn test_stream_needs_header() {
        let mut ctx = ncch_context();
        let mut data = build_test_ncch(2);
        let mut stream = NcchStream::new(NcchCrypto::STANDARD);
        assert!(matches!(stream.feed(&mut ctx, 0x200, &mut data[0x200..0x400]), Err(NcchError::StreamNotReady)));
        data[0x100] = b'X';
        assert!(matches!(stream.feed(&mut ctx, 0, &mut data[..0x400]), Err(NcchError::BadMagic)));
        assert!(matches!(stream.feed(&mut ctx, 0x400, &mut data[0x400..0x600]), Err(NcchError::StreamNotReady)));
        assert!(stream.header().is_none());
    }
}
