// ncch/exefs.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements the structures and methods required for parsing and validating ExeFS headers.

use std::io::{Cursor, Read, Write};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use crate::crypto::sha::sha256;

pub const EXEFS_HEADER_SIZE: usize = 0x200;
pub const EXEFS_MAX_FILES: usize = 10;
const EXEFS_MEDIA_UNIT: u64 = 0x200;
const EXEFS_FILE_SIZE_LIMIT: u32 = 0xFFFFFE00;

#[derive(Debug, Error)]
pub enum ExeFsError {
    #[error("ExeFS file {0} has a name containing non-printable characters")]
    InvalidName(usize),
    #[error("ExeFS file {0} has no hash set")]
    MissingHash(usize),
    #[error("ExeFS file {0} overlaps the previous file")]
    Overlap(usize),
    #[error("ExeFS file {0} is not aligned to a media unit")]
    Unaligned(usize),
    #[error("ExeFS file {0} has an invalid size")]
    InvalidSize(usize),
    #[error("ExeFS contents (0x{data_size:X} bytes) do not fit in the ExeFS (0x{size:X} bytes)")]
    SizeExceeded { data_size: u64, size: u64 },
    #[error("ExeFS does not contain any files")]
    Empty,
    #[error("ExeFS file `{0}` could not be found")]
    FileNotFound(String),
    #[error("ExeFS data is not in a valid format")]
    IO(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExeFsFileHeader {
    pub name: [u8; 8],
    pub offset: u32,
    pub size: u32,
}

impl ExeFsFileHeader {
    /// Gets the name of the file as a string.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.name).trim_end_matches('\0').to_owned()
    }

    /// Checks the name against another, with the same rules as an 8 character strncmp.
    pub fn name_is(&self, name: &str) -> bool {
        let mut expected = [0u8; 8];
        let len = name.len().min(8);
        expected[..len].copy_from_slice(&name.as_bytes()[..len]);
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        self.name[..end] == expected[..expected.iter().position(|&b| b == 0).unwrap_or(8)]
    }
}

/// The header of an ExeFS. File offsets are relative to the end of the header, and the hash of
/// file `i` is stored in slot `9 - i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExeFsHeader {
    pub files: [ExeFsFileHeader; EXEFS_MAX_FILES],
    reserved: [u8; 0x20],
    pub hashes: [[u8; 32]; EXEFS_MAX_FILES],
}

impl ExeFsHeader {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ExeFsError> {
        let mut buf = Cursor::new(data);
        let mut files = [ExeFsFileHeader::default(); EXEFS_MAX_FILES];
        for file in files.iter_mut() {
            buf.read_exact(&mut file.name)?;
            file.offset = buf.read_u32::<LittleEndian>()?;
            file.size = buf.read_u32::<LittleEndian>()?;
        }
        let mut reserved = [0u8; 0x20];
        buf.read_exact(&mut reserved)?;
        let mut hashes = [[0u8; 32]; EXEFS_MAX_FILES];
        for hash in hashes.iter_mut() {
            buf.read_exact(hash)?;
        }
        Ok(ExeFsHeader { files, reserved, hashes })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut buf: Vec<u8> = Vec::with_capacity(EXEFS_HEADER_SIZE);
        for file in &self.files {
            buf.write_all(&file.name)?;
            buf.write_u32::<LittleEndian>(file.offset)?;
            buf.write_u32::<LittleEndian>(file.size)?;
        }
        buf.write_all(&self.reserved)?;
        for hash in &self.hashes {
            buf.write_all(hash)?;
        }
        Ok(buf)
    }

    /// Gets the expected SHA-256 of file `index`.
    pub fn file_hash(&self, index: usize) -> &[u8; 32] {
        &self.hashes[EXEFS_MAX_FILES - 1 - index]
    }

    pub fn set_file_hash(&mut self, index: usize, hash: [u8; 32]) {
        self.hashes[EXEFS_MAX_FILES - 1 - index] = hash;
    }

    /// Finds a file by name.
    pub fn find(&self, name: &str) -> Result<(usize, &ExeFsFileHeader), ExeFsError> {
        self.files.iter()
            .enumerate()
            .find(|(_, file)| file.size != 0 && file.name_is(name))
            .ok_or_else(|| ExeFsError::FileNotFound(name.to_owned()))
    }

    /// Iterates over the files that are actually present.
    pub fn present_files(&self) -> impl Iterator<Item = (usize, &ExeFsFileHeader)> {
        self.files.iter().enumerate().filter(|(_, file)| file.size != 0)
    }

    /// Checks that the file table is sane. `size` is the size of the whole ExeFS including this
    /// header, or 0 to skip the size check.
    pub fn validate(&self, size: u64) -> Result<(), ExeFsError> {
        let mut data_size: u64 = 0;
        let mut n_files = 0;
        for (i, file) in self.present_files() {
            let printable = file.name.iter()
                .take_while(|&&c| c != 0)
                .all(|&c| (0x20..=0x7E).contains(&c));
            if !printable {
                return Err(ExeFsError::InvalidName(i));
            }
            if self.file_hash(i).iter().all(|&b| b == 0) {
                return Err(ExeFsError::MissingHash(i));
            }
            if (file.offset as u64) < data_size {
                return Err(ExeFsError::Overlap(i));
            }
            if file.offset as u64 % EXEFS_MEDIA_UNIT != 0 {
                return Err(ExeFsError::Unaligned(i));
            }
            if file.size >= EXEFS_FILE_SIZE_LIMIT {
                return Err(ExeFsError::InvalidSize(i));
            }
            data_size = file.offset as u64 + (file.size as u64).next_multiple_of(EXEFS_MEDIA_UNIT);
            n_files += 1;
        }
        if size != 0 && (size < EXEFS_HEADER_SIZE as u64 || data_size > size - EXEFS_HEADER_SIZE as u64) {
            return Err(ExeFsError::SizeExceeded { data_size, size });
        }
        if n_files == 0 {
            return Err(ExeFsError::Empty);
        }
        Ok(())
    }

    /// Checks a file's data against its stored hash.
    pub fn verify_file(&self, index: usize, data: &[u8]) -> bool {
        sha256(data) == *self.file_hash(index)
    }
}

/// Checks whether an ExeFS file is encrypted with the primary NCCH key regardless of the
/// NCCH's secondary key setting.
pub fn uses_primary_key(file: &ExeFsFileHeader) -> bool {
    file.name_is("icon") || file.name_is("banner")
}

#[cfg(test)]
pub(crate) fn build_test_exefs(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut header = ExeFsHeader {
        files: [ExeFsFileHeader::default(); EXEFS_MAX_FILES],
        reserved: [0; 0x20],
        hashes: [[0; 32]; EXEFS_MAX_FILES],
    };
    let mut body: Vec<u8> = Vec::new();
    for (i, (name, data)) in files.iter().enumerate() {
        header.files[i].name[..name.len()].copy_from_slice(name.as_bytes());
        header.files[i].offset = body.len() as u32;
        header.files[i].size = data.len() as u32;
        header.set_file_hash(i, sha256(data));
        body.extend_from_slice(data);
        body.resize(body.len().next_multiple_of(0x200), 0);
    }
    let mut out = header.to_bytes().unwrap();
    out.extend(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_validate() {
        let data = build_test_exefs(&[(".code", &[1u8; 0x300]), ("icon", &[2u8; 0x10])]);
        let exefs = ExeFsHeader::from_bytes(&data).unwrap();
        assert_eq!(exefs.to_bytes().unwrap(), data[..EXEFS_HEADER_SIZE]);
        exefs.validate(data.len() as u64).unwrap();
        exefs.validate(0).unwrap();
        let (index, icon) = exefs.find("icon").unwrap();
        assert_eq!(index, 1);
        assert_eq!(icon.offset, 0x400);
        assert!(uses_primary_key(icon));
        assert!(!uses_primary_key(&exefs.files[0]));
        assert!(exefs.verify_file(1, &[2u8; 0x10]));
        assert!(matches!(exefs.find("banner"), Err(ExeFsError::FileNotFound(_))));
    }

    #[test]
    fn test_hash_order_is_reversed() {
        let data = build_test_exefs(&[(".code", &[1u8; 0x10])]);
        assert_eq!(data[0x1E0..0x200], sha256(&[1u8; 0x10]));
    }

    #[test]
    fn test_reject_overlap() {
        let data = build_test_exefs(&[(".code", &[1u8; 0x300]), ("icon", &[2u8; 0x10])]);
        let mut exefs = ExeFsHeader::from_bytes(&data).unwrap();
        exefs.files[1].offset = 0x200;
        assert!(matches!(exefs.validate(0), Err(ExeFsError::Overlap(1))));
        exefs.files[1].offset = 0x410;
        assert!(matches!(exefs.validate(0), Err(ExeFsError::Unaligned(1))));
    }

    #[test]
    fn test_reject_bad_entries() {
        let data = build_test_exefs(&[(".code", &[1u8; 0x10])]);
        let mut exefs = ExeFsHeader::from_bytes(&data).unwrap();
        exefs.files[0].name[1] = 0x07;
        assert!(matches!(exefs.validate(0), Err(ExeFsError::InvalidName(0))));
        let mut exefs = ExeFsHeader::from_bytes(&data).unwrap();
        exefs.set_file_hash(0, [0; 32]);
        assert!(matches!(exefs.validate(0), Err(ExeFsError::MissingHash(0))));
        let mut exefs = ExeFsHeader::from_bytes(&data).unwrap();
        exefs.files[0].size = 0xFFFFFE00;
        assert!(matches!(exefs.validate(0), Err(ExeFsError::InvalidSize(0))));
        let exefs = ExeFsHeader::from_bytes(&data).unwrap();
        assert!(matches!(exefs.validate(0x200), Err(ExeFsError::SizeExceeded { .. })));
        assert!(matches!(ExeFsHeader::from_bytes(&[0u8; 0x200]).unwrap().validate(0), Err(ExeFsError::Empty)));
    }
}
