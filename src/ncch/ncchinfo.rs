// ncch/ncchinfo.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements parsing of ncchinfo.bin files and generation of the NCCH xorpads they describe.

use std::io::{Cursor, Read};
use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;
use crate::crypto::CryptoContext;
use crate::ncch::{set_ncch_key, NcchCrypto, NcchError, NcchFlags, NcchHeader, NCCH_HEADER_SIZE};

pub const NCCHINFO_HEADER_SIZE: usize = 0x10;
pub const NCCHINFO_V3_ENTRY_SIZE: usize = 160;
pub const NCCHINFO_V4_ENTRY_SIZE: usize = 168;
const NCCHINFO_PADDING: u32 = 0xFFFFFFFF;
const NCCHINFO_V3_MAGIC: u32 = 0xF0000003;
const NCCHINFO_V4_MAGIC: u32 = 0xF0000004;
const NCCHINFO_MAX_ENTRIES: u32 = 1024;
const NCCHINFO_FILENAME_SIZE: usize = 112;

#[derive(Debug, Error)]
pub enum NcchInfoError {
    #[error("ncchinfo.bin has an unknown version or an invalid header")]
    UnknownVersion,
    #[error("ncchinfo.bin is too short for its {0} entries")]
    Truncated(u32),
    #[error("xorpad generation failed")]
    Ncch(#[from] NcchError),
    #[error("ncchinfo.bin data is not in a valid format")]
    IO(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NcchInfoEntry {
    pub ctr: [u8; 16],
    pub key_y: [u8; 16],
    pub size_mb: u32,
    pub size_b: u32,
    pub flag7: u32,
    pub flag3: u32,
    pub title_id: u64,
    pub filename: String,
}

impl NcchInfoEntry {
    fn from_bytes(data: &[u8], version: u32) -> Result<Self, NcchInfoError> {
        let mut buf = Cursor::new(data);
        let mut ctr = [0u8; 16];
        buf.read_exact(&mut ctr)?;
        let mut key_y = [0u8; 16];
        buf.read_exact(&mut key_y)?;
        let size_mb = buf.read_u32::<LittleEndian>()?;
        let mut size_b = buf.read_u32::<LittleEndian>()?;
        let flag7 = buf.read_u32::<LittleEndian>()?;
        let flag3 = buf.read_u32::<LittleEndian>()?;
        // v3 entries have no title ID.
        let title_id = if version == 4 { buf.read_u64::<LittleEndian>()? } else { 0 };
        let mut filename = [0u8; NCCHINFO_FILENAME_SIZE];
        buf.read_exact(&mut filename)?;
        if size_b == 0 {
            size_b = size_mb.wrapping_mul(1024 * 1024);
        }
        Ok(NcchInfoEntry {
            ctr,
            key_y,
            size_mb,
            size_b,
            flag7,
            flag3,
            title_id,
            filename: decode_filename(&filename),
        })
    }

    /// Gets the size of the xorpad in bytes.
    pub fn size(&self) -> u64 {
        if self.size_b != 0 { self.size_b as u64 } else { self.size_mb as u64 * 1024 * 1024 }
    }

    /// Gets the crypto the xorpad is generated with. The KeyY in the entry is final, so seed crypto
    /// is never applied again.
    pub fn crypto(&self) -> NcchCrypto {
        let flags = NcchFlags::from_bits_retain(self.flag7 as u8) - NcchFlags::NO_CRYPTO - NcchFlags::SEED_CRYPTO;
        NcchCrypto::new(self.flag3 as u8, flags)
    }

    fn faux_header(&self) -> Result<NcchHeader, NcchError> {
        let mut header = NcchHeader::from_bytes(&[0u8; NCCH_HEADER_SIZE])?;
        header.signature[..16].copy_from_slice(&self.key_y);
        header.set_crypto(self.crypto());
        header.program_id = self.title_id;
        header.partition_id = self.title_id;
        Ok(header)
    }

    /// Fills `buf` with the part of the xorpad that starts `offset` bytes into it.
    pub fn build_xorpad(&self, ctx: &mut CryptoContext, buf: &mut [u8], offset: u64) -> Result<(), NcchInfoError> {
        let header = self.faux_header()?;
        buf.fill(0);
        // Xorpads always use the secondary key when there is one.
        set_ncch_key(ctx, &header, header.crypto(), 1)?;
        ctx.aes.ctr_crypt_byte(buf, offset, &self.ctr);
        Ok(())
    }
}

// Filenames may be stored as UTF-16, and may carry an `sdmc:` prefix.
fn decode_filename(raw: &[u8; NCCHINFO_FILENAME_SIZE]) -> String {
    let bytes: Vec<u8> = if raw[1] == 0 {
        raw.iter().step_by(2).copied().collect()
    } else {
        raw.to_vec()
    };
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let name = String::from_utf8_lossy(&bytes[..end]).into_owned();
    match name.strip_prefix("sdmc:") {
        Some(stripped) => stripped.to_owned(),
        None => name,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NcchInfo {
    pub version: u32,
    pub entries: Vec<NcchInfoEntry>,
}

impl NcchInfo {
    pub fn from_bytes(data: &[u8]) -> Result<Self, NcchInfoError> {
        let mut buf = Cursor::new(data);
        let padding = buf.read_u32::<LittleEndian>()?;
        let magic = buf.read_u32::<LittleEndian>()?;
        let n_entries = buf.read_u32::<LittleEndian>()?;
        if padding != NCCHINFO_PADDING || n_entries == 0 || n_entries >= NCCHINFO_MAX_ENTRIES {
            return Err(NcchInfoError::UnknownVersion);
        }
        let (version, entry_size) = match magic {
            NCCHINFO_V3_MAGIC => (3, NCCHINFO_V3_ENTRY_SIZE),
            NCCHINFO_V4_MAGIC => (4, NCCHINFO_V4_ENTRY_SIZE),
            _ => return Err(NcchInfoError::UnknownVersion),
        };
        let needed = NCCHINFO_HEADER_SIZE + n_entries as usize * entry_size;
        if data.len() < needed {
            return Err(NcchInfoError::Truncated(n_entries));
        }
        let entries = data[NCCHINFO_HEADER_SIZE..needed]
            .chunks_exact(entry_size)
            .map(|entry| NcchInfoEntry::from_bytes(entry, version))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(NcchInfo { version, entries })
    }
}
