// pipeline/verify.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements verification of every supported file type. Encrypted data is decrypted in memory
// and checked against the hashes (or CMAC) stored in the file, without writing anything.

use std::fs::{self, File};
use std::io::{Read, Seek};
use std::path::Path;
use log::{debug, info, warn};
use crate::agbsave::verify_agb_save;
use crate::boss::verify_boss;
use crate::crypto::CryptoContext;
use crate::crypto::keydb::parse_key_database;
use crate::crypto::seed::SeedInfo;
use crate::crypto::sha::{ShaEngine, ShaMode};
use crate::filetype::{identify_file, CtrFileType};
use crate::firm::verify_firm;
use crate::ncch::{NcchCrypto, NcchHeader, NcchStream, NCCH_EXTHDR_OFFSET, NCCH_MEDIA_UNIT};
use crate::ncch::exefs::EXEFS_HEADER_SIZE;
use crate::ncch::exheader::EXTHDR_HASHED_SIZE;
use crate::ncch::ncchinfo::NcchInfo;
use crate::ncch::ncsd::{NcsdHeader, NCSD_HEADER_SIZE};
use crate::pipeline::{movable_key_y, path_name, read_at, read_chunks, read_cia_stub, read_ncch_header, PipelineError, Progress};
use crate::title::crypto::ContentCipher;
use crate::title::ticket::Ticket;
use crate::title::tmd::Tmd;

// A running hash over one region of a stream, checked against the hash stored for it.
struct RegionHash {
    name: String,
    start: u64,
    end: u64,
    sha: ShaEngine,
    expected: [u8; 32],
}

impl RegionHash {
    fn new(name: String, start: u64, size: u64, expected: [u8; 32]) -> Self {
        RegionHash { name, start, end: start + size, sha: ShaEngine::new(ShaMode::Sha256), expected }
    }

    fn update(&mut self, offset: u64, data: &[u8]) {
        let data_end = offset + data.len() as u64;
        if data_end <= self.start || offset >= self.end {
            return;
        }
        let from = self.start.saturating_sub(offset) as usize;
        let to = (self.end.min(data_end) - offset) as usize;
        self.sha.update(&data[from..to]);
    }

    fn check(mut self) -> Result<(), PipelineError> {
        if self.sha.get() != self.expected {
            return Err(PipelineError::HashMismatch(self.name));
        }
        debug!("{} hash OK", self.name);
        Ok(())
    }
}

/// Verifies an NCCH while it is read front to back in chunks: the ExHeader, ExeFS and RomFS
/// hashes from the header, and the hash of every ExeFS file. Chunks are decrypted in place.
pub struct NcchVerifier {
    stream: NcchStream,
    regions: Vec<RegionHash>,
    has_exefs: bool,
    exefs_added: bool,
    end: u64,
}

impl NcchVerifier {
    pub fn new(header: &NcchHeader) -> Self {
        let mut regions = Vec::new();
        if header.size_exthdr > 0 {
            regions.push(RegionHash::new(String::from("ExHeader"), NCCH_EXTHDR_OFFSET, EXTHDR_HASHED_SIZE as u64, header.hash_exthdr));
        }
        if header.size_exefs > 0 && header.size_exefs_hash > 0 {
            let size = header.size_exefs_hash as u64 * NCCH_MEDIA_UNIT;
            regions.push(RegionHash::new(String::from("ExeFS"), header.exefs_offset(), size, header.hash_exefs));
        }
        if header.size_romfs > 0 && header.size_romfs_hash > 0 {
            let size = header.size_romfs_hash as u64 * NCCH_MEDIA_UNIT;
            regions.push(RegionHash::new(String::from("RomFS"), header.romfs_offset(), size, header.hash_romfs));
        }
        let mut end = regions.iter().map(|region| region.end).max().unwrap_or(0);
        if header.size_exefs > 0 {
            end = end.max(header.exefs_offset() + header.exefs_size());
        }
        NcchVerifier {
            stream: NcchStream::new(NcchCrypto::NONE),
            regions,
            has_exefs: header.size_exefs > 0,
            exefs_added: false,
            end,
        }
    }

    /// Gets how far into the NCCH data has to be read for all hashes to be checked.
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn feed(&mut self, ctx: &mut CryptoContext, offset: u64, data: &mut [u8]) -> Result<(), PipelineError> {
        if offset >= self.end {
            return Ok(());
        }
        self.stream.feed(ctx, offset, data)?;
        if !self.exefs_added {
            if let (Some(header), Some(exefs)) = (self.stream.header(), self.stream.exefs()) {
                let files_start = header.exefs_offset() + EXEFS_HEADER_SIZE as u64;
                for (i, file) in exefs.present_files() {
                    let name = format!("ExeFS file `{}`", file.name());
                    self.regions.push(RegionHash::new(name, files_start + file.offset as u64, file.size as u64, *exefs.file_hash(i)));
                }
                self.exefs_added = true;
            }
        }
        for region in &mut self.regions {
            region.update(offset, data);
        }
        Ok(())
    }

    /// Checks every hash. All of the NCCH up to [`end`](Self::end) has to have been fed.
    pub fn finish(self) -> Result<(), PipelineError> {
        if self.has_exefs && !self.exefs_added {
            return Err(PipelineError::HashMismatch(String::from("ExeFS header")));
        }
        for region in self.regions {
            region.check()?;
        }
        Ok(())
    }
}

/// Verifies the NCCH that starts at `offset` in `reader` and is `size` bytes long.
pub fn verify_ncch<R: Read + Seek>(ctx: &mut CryptoContext, reader: &mut R, offset: u64, size: u64, progress: &mut Progress) -> Result<(), PipelineError> {
    let header = read_ncch_header(reader, offset)?;
    header.validate(size)?;
    info!("verifying NCCH {:016X} ({}, crypto: {})", header.program_id, header.product_code(), header.crypto().describe());
    let mut verifier = NcchVerifier::new(&header);
    let end = verifier.end();
    read_chunks(reader, offset, end, progress, |pos, chunk| verifier.feed(ctx, pos, chunk))?;
    verifier.finish()
}

/// Verifies every NCCH partition of an NCSD image.
pub fn verify_ncsd<R: Read + Seek>(ctx: &mut CryptoContext, reader: &mut R, size: u64, progress: &mut Progress) -> Result<(), PipelineError> {
    let header = NcsdHeader::from_bytes(&read_at(reader, 0, NCSD_HEADER_SIZE)?)?;
    header.validate()?;
    if header.trimmed_size() > size {
        return Err(PipelineError::Unsupported("truncated NCSD", "verified"));
    }
    for (index, offset, partition_size) in header.present_partitions() {
        debug!("verifying NCSD partition {}", index);
        verify_ncch(ctx, reader, offset, partition_size, progress)?;
    }
    Ok(())
}

/// Verifies a CIA: the TMD hash tree, the hash of every content, and the NCCH hashes of every
/// content that is an NCCH. Signatures are checked too, but only reported, since most CIAs are
/// not legit.
pub fn verify_cia<R: Read + Seek>(ctx: &mut CryptoContext, reader: &mut R, progress: &mut Progress) -> Result<(), PipelineError> {
    let stub = read_cia_stub(reader)?;
    stub.tmd.validate()?;
    stub.tmd.verify_hashes()?;
    stub.ticket.validate()?;
    report_signatures(&stub.ticket, &stub.tmd, stub.cert_chain().ok().as_ref());

    let needs_key = stub.tmd.content_chunks.iter().any(|chunk| chunk.is_encrypted());
    let title_key = if needs_key { Some(stub.ticket.title_key_dec(ctx)?) } else { None };
    for (chunk, offset) in stub.tmd.content_chunks.iter().zip(stub.content_offsets()) {
        let Some(offset) = offset else {
            debug!("content {:08x} is not present", chunk.content_id);
            continue;
        };
        let mut cipher = match title_key {
            Some(key) if chunk.is_encrypted() => Some(ContentCipher::decryptor(key, chunk.index)),
            _ => None,
        };
        let mut sha = ShaEngine::new(ShaMode::Sha256);
        let mut ncch: Option<NcchVerifier> = None;
        read_chunks(reader, offset, chunk.size, progress, |pos, data| {
            if let Some(cipher) = cipher.as_mut() {
                cipher.process(ctx, data)?;
            }
            sha.update(data);
            if pos == 0 && data.len() >= 0x200 && &data[0x100..0x104] == b"NCCH" {
                let header = NcchHeader::from_bytes(&data[..0x200])?;
                header.validate(chunk.size)?;
                ncch = Some(NcchVerifier::new(&header));
            }
            if let Some(ncch) = ncch.as_mut() {
                ncch.feed(ctx, pos, data)?;
            }
            Ok(())
        })?;
        if sha.get() != chunk.hash {
            return Err(PipelineError::HashMismatch(format!("content {:08x}", chunk.content_id)));
        }
        if let Some(ncch) = ncch {
            ncch.finish()?;
        }
        debug!("content {:08x} OK", chunk.content_id);
    }
    Ok(())
}

fn report_signatures(ticket: &Ticket, tmd: &Tmd, chain: Option<&crate::title::cert::CertificateChain>) {
    let Some(chain) = chain else {
        warn!("CIA has no usable certificate chain, signatures can't be checked");
        return;
    };
    let ticket_ok = ticket.verify_signature(chain).unwrap_or(false);
    let tmd_ok = tmd.verify_signature(chain).unwrap_or(false);
    if ticket_ok && tmd_ok {
        info!("ticket and TMD signatures are valid (legit)");
    } else {
        info!("ticket signature valid: {}, TMD signature valid: {}", ticket_ok, tmd_ok);
    }
}

/// Identifies a file and verifies it in whatever way its type allows. Returns the type that was
/// verified.
pub fn verify_file(ctx: &mut CryptoContext, path: &Path, callback: &mut dyn FnMut(u64, u64) -> bool) -> Result<CtrFileType, PipelineError> {
    let file_type = identify_file(path)?.ok_or_else(|| PipelineError::UnknownType(path_name(path)))?;
    let size = fs::metadata(path)?.len();
    let mut progress = Progress::new(callback, size);
    info!("verifying {} as {}", path.display(), file_type.name());
    match file_type {
        CtrFileType::Ncch => verify_ncch(ctx, &mut File::open(path)?, 0, size, &mut progress)?,
        CtrFileType::Ncsd => verify_ncsd(ctx, &mut File::open(path)?, size, &mut progress)?,
        CtrFileType::Cia => verify_cia(ctx, &mut File::open(path)?, &mut progress)?,
        CtrFileType::Tmd => {
            let tmd = Tmd::from_bytes(&fs::read(path)?)?;
            tmd.validate()?;
            tmd.verify_hashes()?;
        },
        CtrFileType::Ticket => Ticket::from_bytes(&fs::read(path)?)?.validate()?,
        CtrFileType::Boss => verify_boss(ctx, &fs::read(path)?)?,
        CtrFileType::Firm => {
            verify_firm(&fs::read(path)?)?;
        },
        CtrFileType::AgbSave => {
            let key_y = movable_key_y(ctx)?;
            verify_agb_save(ctx, &fs::read(path)?, &key_y)?;
        },
        CtrFileType::KeyDb => {
            parse_key_database(&fs::read(path)?)?;
        },
        CtrFileType::SeedDb => {
            SeedInfo::from_bytes(&fs::read(path)?)?;
        },
        CtrFileType::NcchInfo => {
            NcchInfo::from_bytes(&fs::read(path)?)?;
        },
        CtrFileType::LegacyKey => return Err(PipelineError::Unsupported(file_type.name(), "verified")),
    }
    info!("{} verified OK", path.display());
    Ok(file_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use crate::ncch::NCCH_HEADER_SIZE;
    use crate::ncch::ncsd::build_test_ncsd;
    use crate::ncch::test_utils::{build_encrypted_test_ncch, build_test_ncch, ncch_context};
    use crate::pipeline::no_progress;

    fn verify(ctx: &mut CryptoContext, data: &[u8]) -> Result<(), PipelineError> {
        let mut callback = no_progress;
        let mut progress = Progress::new(&mut callback, data.len() as u64);
        verify_ncch(ctx, &mut Cursor::new(data), 0, data.len() as u64, &mut progress)
    }

    #[test]
    fn test_verify_plain_ncch() {
        let mut ctx = ncch_context();
        verify(&mut ctx, &build_test_ncch(0)).unwrap();
    }

    #[test]
    fn test_verify_encrypted_ncch() {
        let mut ctx = ncch_context();
        let data = build_encrypted_test_ncch(&mut ctx);
        verify(&mut ctx, &data).unwrap();
    }

    #[test]
    fn test_verify_detects_corruption() {
        let mut ctx = ncch_context();
        let mut data = build_test_ncch(0);
        data[0x300] ^= 0xFF;
        assert!(matches!(verify(&mut ctx, &data), Err(PipelineError::HashMismatch(name)) if name == "ExHeader"));

        // The first byte of .code lives right after the ExeFS header.
        let mut data = build_test_ncch(0);
        let header = NcchHeader::from_bytes(&data[..NCCH_HEADER_SIZE]).unwrap();
        let code = (header.exefs_offset() as usize) + EXEFS_HEADER_SIZE;
        data[code] ^= 0xFF;
        assert!(matches!(verify(&mut ctx, &data), Err(PipelineError::HashMismatch(name)) if name.contains(".code")));
    }

    #[test]
    fn test_verify_ncsd() {
        let mut ctx = ncch_context();
        let ncch = build_test_ncch(0);
        let data = build_test_ncsd(&[&ncch, &ncch]);
        let mut callback = no_progress;
        let mut progress = Progress::new(&mut callback, data.len() as u64);
        verify_ncsd(&mut ctx, &mut Cursor::new(&data), data.len() as u64, &mut progress).unwrap();
    }
}
