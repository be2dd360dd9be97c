// title/tmd.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements the structures and methods required for 3DS TMD parsing, editing and verification.

use std::io::{Cursor, Read, Write};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use thiserror::Error;
use crate::crypto::sha::sha256;
use crate::title::cert::{verify_signature, CertificateChain, CertificateError, SignatureType};

pub const TMD_SIG_TYPE: u32 = 0x00010004;
pub const TMD_ISSUER: &str = "Root-CA00000003-CP0000000b";
pub const TMD_ISSUER_DEV: &str = "Root-CA00000004-CP0000000a";
pub const TMD_CONTENT_INFO_COUNT: usize = 64;
pub const TMD_CONTENT_INFO_SIZE: usize = 0x24;
pub const TMD_CONTENT_CHUNK_SIZE: usize = 0x30;
pub const TMD_SIZE_MIN: usize = 0xB04;
pub const TMD_MAX_CONTENTS: usize = 383;
const TMD_SIGNED_START: usize = 0x140;

/// Gets the size of a TMD holding the given number of contents.
pub fn tmd_size(content_count: usize) -> usize {
    TMD_SIZE_MIN + content_count * TMD_CONTENT_CHUNK_SIZE
}

#[derive(Debug, Error)]
pub enum TmdError {
    #[error("TMD has unsupported signature type `{0:#010X}`")]
    BadSignatureType(u32),
    #[error("TMD was issued by unknown signer `{0}`")]
    UnknownIssuer(String),
    #[error("TMD lists {0} contents, more than the {max} allowed", max = TMD_MAX_CONTENTS)]
    TooManyContents(usize),
    #[error("signature issuer string must not exceed 64 characters (was {0})")]
    IssuerTooLong(usize),
    #[error("TMD content info hash does not match")]
    InfoHashMismatch,
    #[error("TMD content chunk hashes in bucket {0} do not match")]
    ChunkHashMismatch(usize),
    #[error("TMD signature could not be checked")]
    Certificate(#[from] CertificateError),
    #[error("TMD data is not in a valid format")]
    IO(#[from] std::io::Error),
}

/// One of the 64 hash buckets of a TMD, each covering `cmd_count` consecutive content chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentInfo {
    pub index: u16,
    pub cmd_count: u16,
    pub hash: [u8; 32],
}

/// The metadata of one content in a 3DS title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentChunk {
    pub content_id: u32,
    pub index: u16,
    pub content_type: u16,
    pub size: u64,
    pub hash: [u8; 32],
}

impl ContentChunk {
    pub fn new(content_id: u32, index: u16, size: u64) -> Self {
        ContentChunk {
            content_id,
            index,
            content_type: 0,
            size,
            hash: [0; 32],
        }
    }

    fn from_reader(buf: &mut Cursor<&[u8]>) -> Result<Self, std::io::Error> {
        let content_id = buf.read_u32::<BigEndian>()?;
        let index = buf.read_u16::<BigEndian>()?;
        let content_type = buf.read_u16::<BigEndian>()?;
        let size = buf.read_u64::<BigEndian>()?;
        let mut hash = [0u8; 32];
        buf.read_exact(&mut hash)?;
        Ok(ContentChunk { content_id, index, content_type, size, hash })
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), std::io::Error> {
        buf.write_u32::<BigEndian>(self.content_id)?;
        buf.write_u16::<BigEndian>(self.index)?;
        buf.write_u16::<BigEndian>(self.content_type)?;
        buf.write_u64::<BigEndian>(self.size)?;
        buf.write_all(&self.hash)
    }

    /// Gets whether the content is encrypted with the title key.
    pub fn is_encrypted(&self) -> bool {
        self.content_type & 0x1 != 0
    }

    pub fn set_encrypted(&mut self, encrypted: bool) {
        if encrypted {
            self.content_type |= 0x1;
        } else {
            self.content_type &= !0x1;
        }
    }

    /// Gets whether the content is optional, as DLC contents are.
    pub fn is_optional(&self) -> bool {
        self.content_type & 0x4000 != 0
    }
}

/// A structure that represents a 3DS TMD (Title Metadata) file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tmd {
    pub signature_type: u32,
    pub signature: [u8; 256],
    padding1: [u8; 60],
    pub signature_issuer: [u8; 64],
    pub tmd_version: u8,
    pub ca_crl_version: u8,
    pub signer_crl_version: u8,
    reserved1: u8,
    pub system_version: u64,
    pub title_id: u64,
    pub title_type: [u8; 4],
    pub group_id: u16,
    pub save_size: u32, // Little endian, unlike the rest of the TMD.
    pub twl_privsave_size: u32,
    reserved2: [u8; 4],
    pub twl_flag: u8,
    reserved3: [u8; 0x31],
    pub access_rights: u32,
    pub title_version: u16,
    pub boot_content: u16,
    reserved4: [u8; 2],
    pub contentinfo_hash: [u8; 32],
    pub content_info: Vec<ContentInfo>,
    pub content_chunks: Vec<ContentChunk>,
}

impl Tmd {
    /// Creates a new Tmd instance from the binary data of a TMD file.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TmdError> {
        let mut buf = Cursor::new(data);
        let signature_type = buf.read_u32::<BigEndian>()?;
        if signature_type != TMD_SIG_TYPE {
            return Err(TmdError::BadSignatureType(signature_type));
        }
        let mut signature = [0u8; 256];
        buf.read_exact(&mut signature)?;
        let mut padding1 = [0u8; 60];
        buf.read_exact(&mut padding1)?;
        let mut signature_issuer = [0u8; 64];
        buf.read_exact(&mut signature_issuer)?;
        let tmd_version = buf.read_u8()?;
        let ca_crl_version = buf.read_u8()?;
        let signer_crl_version = buf.read_u8()?;
        let reserved1 = buf.read_u8()?;
        let system_version = buf.read_u64::<BigEndian>()?;
        let title_id = buf.read_u64::<BigEndian>()?;
        let mut title_type = [0u8; 4];
        buf.read_exact(&mut title_type)?;
        let group_id = buf.read_u16::<BigEndian>()?;
        let save_size = buf.read_u32::<LittleEndian>()?;
        let twl_privsave_size = buf.read_u32::<LittleEndian>()?;
        let mut reserved2 = [0u8; 4];
        buf.read_exact(&mut reserved2)?;
        let twl_flag = buf.read_u8()?;
        let mut reserved3 = [0u8; 0x31];
        buf.read_exact(&mut reserved3)?;
        let access_rights = buf.read_u32::<BigEndian>()?;
        let title_version = buf.read_u16::<BigEndian>()?;
        let content_count = buf.read_u16::<BigEndian>()? as usize;
        if content_count > TMD_MAX_CONTENTS {
            return Err(TmdError::TooManyContents(content_count));
        }
        let boot_content = buf.read_u16::<BigEndian>()?;
        let mut reserved4 = [0u8; 2];
        buf.read_exact(&mut reserved4)?;
        let mut contentinfo_hash = [0u8; 32];
        buf.read_exact(&mut contentinfo_hash)?;
        let mut content_info = Vec::with_capacity(TMD_CONTENT_INFO_COUNT);
        for _ in 0..TMD_CONTENT_INFO_COUNT {
            let index = buf.read_u16::<BigEndian>()?;
            let cmd_count = buf.read_u16::<BigEndian>()?;
            let mut hash = [0u8; 32];
            buf.read_exact(&mut hash)?;
            content_info.push(ContentInfo { index, cmd_count, hash });
        }
        let content_chunks = (0..content_count)
            .map(|_| ContentChunk::from_reader(&mut buf))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Tmd {
            signature_type,
            signature,
            padding1,
            signature_issuer,
            tmd_version,
            ca_crl_version,
            signer_crl_version,
            reserved1,
            system_version,
            title_id,
            title_type,
            group_id,
            save_size,
            twl_privsave_size,
            reserved2,
            twl_flag,
            reserved3,
            access_rights,
            title_version,
            boot_content,
            reserved4,
            contentinfo_hash,
            content_info,
            content_chunks,
        })
    }

    /// Dumps the data in a Tmd back into binary data that can be written to a file.
    pub fn to_bytes(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut buf = Vec::with_capacity(self.size());
        self.write_header(&mut buf)?;
        for chunk in &self.content_chunks {
            chunk.write_to(&mut buf)?;
        }
        Ok(buf)
    }

    // Writes everything up to the end of the content info table, which is also where the signed
    // area of the TMD ends.
    fn write_header(&self, buf: &mut Vec<u8>) -> Result<(), std::io::Error> {
        buf.write_u32::<BigEndian>(self.signature_type)?;
        buf.write_all(&self.signature)?;
        buf.write_all(&self.padding1)?;
        buf.write_all(&self.signature_issuer)?;
        buf.write_u8(self.tmd_version)?;
        buf.write_u8(self.ca_crl_version)?;
        buf.write_u8(self.signer_crl_version)?;
        buf.write_u8(self.reserved1)?;
        buf.write_u64::<BigEndian>(self.system_version)?;
        buf.write_u64::<BigEndian>(self.title_id)?;
        buf.write_all(&self.title_type)?;
        buf.write_u16::<BigEndian>(self.group_id)?;
        buf.write_u32::<LittleEndian>(self.save_size)?;
        buf.write_u32::<LittleEndian>(self.twl_privsave_size)?;
        buf.write_all(&self.reserved2)?;
        buf.write_u8(self.twl_flag)?;
        buf.write_all(&self.reserved3)?;
        buf.write_u32::<BigEndian>(self.access_rights)?;
        buf.write_u16::<BigEndian>(self.title_version)?;
        buf.write_u16::<BigEndian>(self.content_chunks.len() as u16)?;
        buf.write_u16::<BigEndian>(self.boot_content)?;
        buf.write_all(&self.reserved4)?;
        buf.write_all(&self.contentinfo_hash)?;
        self.write_content_info(buf)
    }

    fn write_content_info(&self, buf: &mut Vec<u8>) -> Result<(), std::io::Error> {
        for info in &self.content_info {
            buf.write_u16::<BigEndian>(info.index)?;
            buf.write_u16::<BigEndian>(info.cmd_count)?;
            buf.write_all(&info.hash)?;
        }
        Ok(())
    }

    /// Builds an unsigned TMD for the given title with `content_count` empty content chunks, all
    /// covered by the first content info bucket. Chunks are numbered in order and have to be filled
    /// in by the caller, followed by a call to `fix_hashes()`.
    pub fn new_fake(title_id: u64, content_count: usize, save_size: u32, twl_privsave_size: u32) -> Result<Self, TmdError> {
        if content_count > TMD_MAX_CONTENTS {
            return Err(TmdError::TooManyContents(content_count));
        }
        let mut signature_issuer = [0u8; 64];
        signature_issuer[..TMD_ISSUER.len()].copy_from_slice(TMD_ISSUER.as_bytes());
        let mut content_info = vec![ContentInfo { index: 0, cmd_count: 0, hash: [0; 32] }; TMD_CONTENT_INFO_COUNT];
        content_info[0].cmd_count = content_count as u16;
        let content_chunks = (0..content_count)
            .map(|i| ContentChunk::new(i as u32, i as u16, 0))
            .collect();
        let mut tmd = Tmd {
            signature_type: TMD_SIG_TYPE,
            signature: [0xFF; 256],
            padding1: [0; 60],
            signature_issuer,
            tmd_version: 1,
            ca_crl_version: 0,
            signer_crl_version: 0,
            reserved1: 0,
            system_version: 0,
            title_id,
            title_type: [0x00, 0x00, 0x00, 0x40],
            group_id: 0,
            save_size,
            twl_privsave_size,
            reserved2: [0; 4],
            twl_flag: 0,
            reserved3: [0; 0x31],
            access_rights: 0,
            title_version: 0,
            boot_content: 0,
            reserved4: [0; 2],
            contentinfo_hash: [0; 32],
            content_info,
            content_chunks,
        };
        tmd.fix_hashes()?;
        Ok(tmd)
    }

    /// Gets the size of the TMD in bytes.
    pub fn size(&self) -> usize {
        tmd_size(self.content_chunks.len())
    }

    pub fn content_count(&self) -> usize {
        self.content_chunks.len()
    }

    /// Gets the name of the certificate used to sign a TMD as a string.
    pub fn signature_issuer(&self) -> String {
        String::from_utf8_lossy(&self.signature_issuer).trim_end_matches('\0').to_owned()
    }

    /// Sets a new name for the certificate used to sign a TMD.
    pub fn set_signature_issuer(&mut self, signature_issuer: &str) -> Result<(), TmdError> {
        if signature_issuer.len() > 64 {
            return Err(TmdError::IssuerTooLong(signature_issuer.len()));
        }
        self.signature_issuer = [0; 64];
        self.signature_issuer[..signature_issuer.len()].copy_from_slice(signature_issuer.as_bytes());
        Ok(())
    }

    /// Gets whether a TMD was signed for development (true) or retail (false).
    pub fn is_dev(&self) -> bool {
        self.signature_issuer() == TMD_ISSUER_DEV
    }

    /// Finds the content chunk with the given content index.
    pub fn find_content(&self, index: u16) -> Option<&ContentChunk> {
        self.content_chunks.iter().find(|chunk| chunk.index == index)
    }

    /// Checks that the TMD has a known signature type and issuer.
    pub fn validate(&self) -> Result<(), TmdError> {
        if self.signature_type != TMD_SIG_TYPE {
            return Err(TmdError::BadSignatureType(self.signature_type));
        }
        let issuer = self.signature_issuer();
        if issuer != TMD_ISSUER && issuer != TMD_ISSUER_DEV {
            return Err(TmdError::UnknownIssuer(issuer));
        }
        if self.content_chunks.len() > TMD_MAX_CONTENTS {
            return Err(TmdError::TooManyContents(self.content_chunks.len()));
        }
        Ok(())
    }

    fn chunk_bytes(&self, start: usize, count: usize) -> Result<Vec<u8>, std::io::Error> {
        let mut buf = Vec::with_capacity(count * TMD_CONTENT_CHUNK_SIZE);
        for chunk in &self.content_chunks[start..start + count] {
            chunk.write_to(&mut buf)?;
        }
        Ok(buf)
    }

    /// Recalculates the content info bucket hashes and the content info hash. This has to be
    /// called after any content chunk is changed.
    pub fn fix_hashes(&mut self) -> Result<(), TmdError> {
        let content_count = self.content_chunks.len();
        let mut kc = 0;
        for i in 0..TMD_CONTENT_INFO_COUNT {
            if kc >= content_count {
                break;
            }
            // A bucket claiming more chunks than there are only covers what exists.
            let k = (self.content_info[i].cmd_count as usize).min(content_count - kc);
            self.content_info[i].hash = sha256(&self.chunk_bytes(kc, k)?);
            kc += k;
        }
        let mut info = Vec::with_capacity(TMD_CONTENT_INFO_COUNT * TMD_CONTENT_INFO_SIZE);
        self.write_content_info(&mut info)?;
        self.contentinfo_hash = sha256(&info);
        Ok(())
    }

    /// Verifies the content info hash and the hash of every content info bucket.
    pub fn verify_hashes(&self) -> Result<(), TmdError> {
        let mut info = Vec::with_capacity(TMD_CONTENT_INFO_COUNT * TMD_CONTENT_INFO_SIZE);
        self.write_content_info(&mut info)?;
        if sha256(&info) != self.contentinfo_hash {
            return Err(TmdError::InfoHashMismatch);
        }
        let content_count = self.content_chunks.len();
        let mut kc = 0;
        for (i, bucket) in self.content_info.iter().enumerate() {
            if kc >= content_count {
                break;
            }
            let k = bucket.cmd_count as usize;
            if kc + k > content_count || sha256(&self.chunk_bytes(kc, k)?) != bucket.hash {
                return Err(TmdError::ChunkHashMismatch(i));
            }
            kc += k;
        }
        Ok(())
    }

    /// Verifies the RSA signature of the TMD using the matching certificate from the chain.
    pub fn verify_signature(&self, chain: &CertificateChain) -> Result<bool, TmdError> {
        let signer = chain.find_signer(&self.signature_issuer())?;
        let mut header = Vec::with_capacity(TMD_SIZE_MIN);
        self.write_header(&mut header)?;
        debug!("Verifying TMD signature for title {:016X} against {}", self.title_id, signer.full_name());
        Ok(verify_signature(signer, SignatureType::Rsa2048Sha256, &self.signature, &header[TMD_SIGNED_START..])?)
    }

    /// Gets the part of the TMD covered by its signature.
    pub fn signed_data(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut header = Vec::with_capacity(TMD_SIZE_MIN);
        self.write_header(&mut header)?;
        Ok(header.split_off(TMD_SIGNED_START))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::title::cert::test_keys::{sign_sha256, test_chain};

    const TITLE_ID: u64 = 0x0004000000ABCD00;

    fn filled_tmd(count: usize) -> Tmd {
        let mut tmd = Tmd::new_fake(TITLE_ID, count, 0x80000, 0).unwrap();
        for (i, chunk) in tmd.content_chunks.iter_mut().enumerate() {
            chunk.size = 0x1000 * (i as u64 + 1);
            chunk.hash = sha256(&[i as u8; 4]);
        }
        tmd.fix_hashes().unwrap();
        tmd
    }

    #[test]
    fn test_fake_tmd_layout() {
        let tmd = filled_tmd(3);
        let data = tmd.to_bytes().unwrap();
        assert_eq!(data.len(), tmd_size(3));
        assert_eq!(&data[..4], &[0x00, 0x01, 0x00, 0x04]);
        assert_eq!(&data[0x140..0x140 + TMD_ISSUER.len()], TMD_ISSUER.as_bytes());
        // Save size is stored little endian.
        assert_eq!(&data[0x19A..0x19E], &[0x00, 0x00, 0x08, 0x00]);
        assert_eq!(&data[0x1DE..0x1E0], &[0x00, 0x03]);
        assert_eq!(&data[0x206..0x208], &[0x00, 0x03]);
        let parsed = Tmd::from_bytes(&data).unwrap();
        assert_eq!(parsed, tmd);
        parsed.validate().unwrap();
        parsed.verify_hashes().unwrap();
    }

    #[test]
    fn test_fix_hashes_idempotent() {
        let mut tmd = filled_tmd(5);
        let once = tmd.clone();
        tmd.fix_hashes().unwrap();
        assert_eq!(tmd, once);
        tmd.content_chunks[2].size += 1;
        assert!(matches!(tmd.verify_hashes(), Err(TmdError::ChunkHashMismatch(0))));
        tmd.fix_hashes().unwrap();
        tmd.verify_hashes().unwrap();
        tmd.contentinfo_hash[0] ^= 1;
        assert!(matches!(tmd.verify_hashes(), Err(TmdError::InfoHashMismatch)));
    }

    #[test]
    fn test_split_buckets() {
        let mut tmd = filled_tmd(3);
        tmd.content_info[0].cmd_count = 2;
        tmd.content_info[1].index = 2;
        tmd.content_info[1].cmd_count = 1;
        tmd.fix_hashes().unwrap();
        tmd.verify_hashes().unwrap();
        let mut chunk = Vec::new();
        tmd.content_chunks[2].write_to(&mut chunk).unwrap();
        assert_eq!(tmd.content_info[1].hash, sha256(&chunk));
        // A bucket that runs past the last chunk can't verify.
        tmd.content_info[1].cmd_count = 2;
        let mut info = Vec::new();
        tmd.write_content_info(&mut info).unwrap();
        tmd.contentinfo_hash = sha256(&info);
        assert!(matches!(tmd.verify_hashes(), Err(TmdError::ChunkHashMismatch(1))));
    }

    #[test]
    fn test_content_count_bounds() {
        let tmd = Tmd::new_fake(TITLE_ID, TMD_MAX_CONTENTS, 0, 0).unwrap();
        let mut data = tmd.to_bytes().unwrap();
        assert_eq!(data.len(), tmd_size(TMD_MAX_CONTENTS));
        assert_eq!(Tmd::from_bytes(&data).unwrap().content_count(), TMD_MAX_CONTENTS);
        data[0x1DE..0x1E0].copy_from_slice(&384u16.to_be_bytes());
        assert!(matches!(Tmd::from_bytes(&data), Err(TmdError::TooManyContents(384))));
        assert!(matches!(Tmd::new_fake(TITLE_ID, 384, 0, 0), Err(TmdError::TooManyContents(384))));
        let empty = Tmd::new_fake(TITLE_ID, 0, 0, 0).unwrap();
        assert_eq!(empty.to_bytes().unwrap().len(), TMD_SIZE_MIN);
    }

    #[test]
    fn test_validate_issuer() {
        let mut tmd = filled_tmd(1);
        tmd.set_signature_issuer(TMD_ISSUER_DEV).unwrap();
        tmd.validate().unwrap();
        assert!(tmd.is_dev());
        tmd.set_signature_issuer("Root-CA00000003-XS0000000c").unwrap();
        assert!(matches!(tmd.validate(), Err(TmdError::UnknownIssuer(_))));
        let mut data = filled_tmd(1).to_bytes().unwrap();
        data[3] = 0x03;
        assert!(matches!(Tmd::from_bytes(&data), Err(TmdError::BadSignatureType(0x00010003))));
    }

    #[test]
    fn test_verify_signature() {
        let chain = test_chain();
        let mut tmd = filled_tmd(2);
        let signature = sign_sha256(&tmd.signed_data().unwrap());
        tmd.signature.copy_from_slice(&signature);
        assert!(tmd.verify_signature(&chain).unwrap());
        // Content chunks are not covered by the signature, but the info table is.
        tmd.content_chunks[1].size = 1;
        assert!(tmd.verify_signature(&chain).unwrap());
        tmd.fix_hashes().unwrap();
        assert!(!tmd.verify_signature(&chain).unwrap());
        tmd.set_signature_issuer(TMD_ISSUER_DEV).unwrap();
        assert!(matches!(tmd.verify_signature(&chain), Err(TmdError::Certificate(_))));
    }
}
