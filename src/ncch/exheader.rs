// ncch/exheader.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements reading and patching the few ExHeader fields needed for title info and installs.

use std::io::{Cursor, Read, Seek, SeekFrom};
use byteorder::{LittleEndian, ReadBytesExt};
use crate::crypto::sha::sha256;

/// The ExHeader hash in the NCCH header only covers this many bytes.
pub const EXTHDR_HASHED_SIZE: usize = 0x400;
const EXTHDR_FLAG_OFFSET: usize = 0x0D;
const EXTHDR_FLAG_SD_APPLICATION: u8 = 1 << 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtHeaderInfo {
    pub name: String,
    pub flags: u8,
    pub remaster_version: u16,
    pub stack_size: u32,
    pub save_size: u64,
    pub jump_id: u64,
    pub program_id: u64,
    pub core_version: u32,
}

impl ExtHeaderInfo {
    pub fn from_bytes(data: &[u8]) -> Result<Self, std::io::Error> {
        let mut buf = Cursor::new(data);
        let mut name = [0u8; 8];
        buf.read_exact(&mut name)?;
        buf.seek(SeekFrom::Start(EXTHDR_FLAG_OFFSET as u64))?;
        let flags = buf.read_u8()?;
        let remaster_version = buf.read_u16::<LittleEndian>()?;
        buf.seek(SeekFrom::Start(0x1C))?;
        let stack_size = buf.read_u32::<LittleEndian>()?;
        buf.seek(SeekFrom::Start(0x1C0))?;
        let save_size = buf.read_u64::<LittleEndian>()?;
        let jump_id = buf.read_u64::<LittleEndian>()?;
        buf.seek(SeekFrom::Start(0x200))?;
        let program_id = buf.read_u64::<LittleEndian>()?;
        let core_version = buf.read_u32::<LittleEndian>()?;
        Ok(ExtHeaderInfo {
            name: String::from_utf8_lossy(&name).trim_end_matches('\0').to_owned(),
            flags,
            remaster_version,
            stack_size,
            save_size,
            jump_id,
            program_id,
            core_version,
        })
    }

    pub fn is_sd_application(&self) -> bool {
        self.flags & EXTHDR_FLAG_SD_APPLICATION != 0
    }
}

/// Gets the save data size from a plain ExHeader.
pub fn exthdr_save_size(exthdr: &[u8]) -> Option<u64> {
    let bytes = exthdr.get(0x1C0..0x1C8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

/// Sets the SD application flag in a plain ExHeader. Returns true if the ExHeader changed, in
/// which case the NCCH header's ExHeader hash has to be updated with [`exthdr_hash`].
pub fn set_sd_application(exthdr: &mut [u8]) -> bool {
    match exthdr.get_mut(EXTHDR_FLAG_OFFSET) {
        Some(flag) if *flag & EXTHDR_FLAG_SD_APPLICATION == 0 => {
            *flag |= EXTHDR_FLAG_SD_APPLICATION;
            true
        },
        _ => false,
    }
}

/// Calculates the hash of a plain ExHeader the way it is stored in the NCCH header.
pub fn exthdr_hash(exthdr: &[u8]) -> [u8; 32] {
    sha256(&exthdr[..EXTHDR_HASHED_SIZE.min(exthdr.len())])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_exthdr() -> Vec<u8> {
        let mut exthdr = vec![0u8; 0x800];
        exthdr[..6].copy_from_slice(b"Tester");
        exthdr[0x0E..0x10].copy_from_slice(&3u16.to_le_bytes());
        exthdr[0x1C0..0x1C8].copy_from_slice(&0x80000u64.to_le_bytes());
        exthdr[0x200..0x208].copy_from_slice(&0x0004000000ABCD00u64.to_le_bytes());
        exthdr
    }

    #[test]
    fn test_parse() {
        let info = ExtHeaderInfo::from_bytes(&test_exthdr()).unwrap();
        assert_eq!(info.name, "Tester");
        assert_eq!(info.remaster_version, 3);
        assert_eq!(info.save_size, 0x80000);
        assert_eq!(info.program_id, 0x0004000000ABCD00);
        assert!(!info.is_sd_application());
        assert_eq!(exthdr_save_size(&test_exthdr()), Some(0x80000));
        assert_eq!(exthdr_save_size(&[0u8; 0x10]), None);
    }

    #[test]
    fn test_sd_flag() {
        let mut exthdr = test_exthdr();
        let before = exthdr_hash(&exthdr);
        assert!(set_sd_application(&mut exthdr));
        assert!(!set_sd_application(&mut exthdr));
        assert!(ExtHeaderInfo::from_bytes(&exthdr).unwrap().is_sd_application());
        assert_ne!(exthdr_hash(&exthdr), before);
        // Only the first 0x400 bytes are hashed.
        let hash = exthdr_hash(&exthdr);
        exthdr[0x500] ^= 0xFF;
        assert_eq!(exthdr_hash(&exthdr), hash);
    }
}
