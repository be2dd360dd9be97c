// pipeline/build.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements building CIA files from NCCH and NCSD images, or from a TMD and its contents as they
// are stored on the CDN.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use glob::glob;
use log::{debug, info, warn};
use crate::crypto::CryptoContext;
use crate::crypto::sha::{ShaEngine, ShaMode};
use crate::filetype::{identify_file, CtrFileType};
use crate::ncch::{decrypt_ncch, NcchHeader, NCCH_EXTHDR_OFFSET, NCCH_EXTHDR_SIZE};
use crate::ncch::exefs::{ExeFsHeader, EXEFS_HEADER_SIZE};
use crate::ncch::exheader::exthdr_save_size;
use crate::ncch::ncsd::{NcsdHeader, NCSD_HEADER_SIZE};
use crate::pipeline::{path_name, read_at, read_chunks, read_cia_stub, read_ncch_header, PipelineError, Progress};
use crate::title::cert::{Certificate, CertificateChain};
use crate::title::cia::{CiaMeta, CiaStub, CIA_META_SIZE, SMDH_SIZE};
use crate::title::crypto::ContentCipher;
use crate::title::ticket::{ticket_size, Ticket};
use crate::title::tmd::Tmd;

/// The name of the ticket file in a CDN title directory.
pub const CETK_NAME: &str = "cetk";

// Where the data of one content comes from. `chunk` is the position of its chunk in the TMD, and
// `title_key` is set when the data is encrypted with it.
#[derive(Debug, Clone)]
pub(crate) struct ContentSource {
    pub(crate) chunk: usize,
    pub(crate) path: PathBuf,
    pub(crate) offset: u64,
    pub(crate) title_key: Option<[u8; 16]>,
}

/// Everything needed to write a CIA: its ticket, TMD and certificates, the files its contents
/// are read from, and its meta block.
#[derive(Debug, Clone)]
pub struct TitleSource {
    pub stub: CiaStub,
    pub meta: Option<CiaMeta>,
    /// Whether the ticket and TMD are kept exactly as they are, signatures included.
    pub legit: bool,
    pub(crate) contents: Vec<ContentSource>,
}

fn read_plain_exthdr<R: Read + Seek>(ctx: &mut CryptoContext, reader: &mut R, offset: u64, header: &NcchHeader) -> Result<Vec<u8>, PipelineError> {
    let mut exthdr = read_at(reader, offset + NCCH_EXTHDR_OFFSET, NCCH_EXTHDR_SIZE as usize)?;
    if header.is_encrypted() {
        decrypt_ncch(ctx, &mut exthdr, NCCH_EXTHDR_OFFSET, header, None)?;
    }
    Ok(exthdr)
}

fn read_plain_icon<R: Read + Seek>(ctx: &mut CryptoContext, reader: &mut R, offset: u64, header: &NcchHeader) -> Result<Option<Vec<u8>>, PipelineError> {
    if header.size_exefs == 0 {
        return Ok(None);
    }
    let exefs_offset = header.exefs_offset();
    let mut raw = read_at(reader, offset + exefs_offset, EXEFS_HEADER_SIZE)?;
    if header.is_encrypted() {
        decrypt_ncch(ctx, &mut raw, exefs_offset, header, None)?;
    }
    let exefs = ExeFsHeader::from_bytes(&raw)?;
    let Ok((_, file)) = exefs.find("icon") else {
        return Ok(None);
    };
    let icon_offset = exefs_offset + EXEFS_HEADER_SIZE as u64 + file.offset as u64;
    let mut icon = read_at(reader, offset + icon_offset, file.size as usize)?;
    if header.is_encrypted() {
        decrypt_ncch(ctx, &mut icon, icon_offset, header, Some(&exefs))?;
    }
    Ok(Some(icon))
}

// Gets the save data size and meta block of the NCCH at `offset`, as far as they can be read.
fn ncch_title_info<R: Read + Seek>(ctx: &mut CryptoContext, reader: &mut R, offset: u64, header: &NcchHeader) -> (u32, Option<CiaMeta>) {
    if header.size_exthdr == 0 {
        return (0, None);
    }
    let exthdr = match read_plain_exthdr(ctx, reader, offset, header) {
        Ok(exthdr) => exthdr,
        Err(err) => {
            warn!("ExHeader could not be read, building without save size or meta: {}", err);
            return (0, None);
        },
    };
    let save_size = exthdr_save_size(&exthdr).unwrap_or(0) as u32;
    let icon = match read_plain_icon(ctx, reader, offset, header) {
        Ok(icon) => icon.filter(|icon| icon.len() == SMDH_SIZE),
        Err(err) => {
            debug!("no icon for meta: {}", err);
            None
        },
    };
    let meta = CiaMeta::new(Some(&exthdr), icon.as_deref()).ok();
    (save_size, meta)
}

fn fake_ticket(ctx: &mut CryptoContext, title_id: u64, is_dev: bool) -> Result<Ticket, PipelineError> {
    let mut ticket = Ticket::new_fake(title_id, is_dev);
    ticket.set_title_key_dec(ctx, [0; 16])?;
    Ok(ticket)
}

/// Prepares a CIA holding a single NCCH as content 0.
pub fn title_from_ncch(ctx: &mut CryptoContext, path: &Path) -> Result<TitleSource, PipelineError> {
    let mut reader = File::open(path)?;
    let header = read_ncch_header(&mut reader, 0)?;
    header.validate(fs::metadata(path)?.len())?;
    let (save_size, meta) = ncch_title_info(ctx, &mut reader, 0, &header);
    let mut tmd = Tmd::new_fake(header.program_id, 1, save_size, 0)?;
    tmd.content_chunks[0].size = header.ncch_size();
    let ticket = fake_ticket(ctx, header.program_id, false)?;
    Ok(TitleSource {
        stub: CiaStub::new(ticket, tmd, None)?,
        meta,
        legit: false,
        contents: vec![ContentSource { chunk: 0, path: path.to_path_buf(), offset: 0, title_key: None }],
    })
}

/// Prepares a CIA from an NCSD image, with each of its partitions as the content of the same
/// index.
pub fn title_from_ncsd(ctx: &mut CryptoContext, path: &Path) -> Result<TitleSource, PipelineError> {
    let mut reader = File::open(path)?;
    let ncsd = NcsdHeader::from_bytes(&read_at(&mut reader, 0, NCSD_HEADER_SIZE)?)?;
    ncsd.validate()?;
    let partitions: Vec<(usize, u64, u64)> = ncsd.present_partitions().collect();
    let header = read_ncch_header(&mut reader, partitions[0].1)?;
    header.validate(partitions[0].2)?;
    let (save_size, meta) = ncch_title_info(ctx, &mut reader, partitions[0].1, &header);
    let mut tmd = Tmd::new_fake(header.program_id, partitions.len(), save_size, 0)?;
    let mut contents = Vec::with_capacity(partitions.len());
    for (i, (index, offset, size)) in partitions.into_iter().enumerate() {
        let chunk = &mut tmd.content_chunks[i];
        chunk.content_id = index as u32;
        chunk.index = index as u16;
        chunk.size = size;
        contents.push(ContentSource { chunk: i, path: path.to_path_buf(), offset, title_key: None });
    }
    let ticket = fake_ticket(ctx, header.program_id, false)?;
    Ok(TitleSource {
        stub: CiaStub::new(ticket, tmd, None)?,
        meta,
        legit: false,
        contents,
    })
}

/// Prepares a CIA from another CIA. The contents present in it are taken over, along with its
/// meta block.
pub fn title_from_cia(ctx: &mut CryptoContext, path: &Path, legit: bool) -> Result<TitleSource, PipelineError> {
    let mut reader = File::open(path)?;
    let stub = read_cia_stub(&mut reader)?;
    stub.tmd.validate()?;
    let title_key = if stub.tmd.content_chunks.iter().any(|chunk| chunk.is_encrypted()) {
        Some(stub.ticket.title_key_dec(ctx)?)
    } else {
        None
    };
    let contents = stub.tmd.content_chunks.iter().zip(stub.content_offsets()).enumerate()
        .filter_map(|(i, (chunk, offset))| Some(ContentSource {
            chunk: i,
            path: path.to_path_buf(),
            offset: offset?,
            title_key: title_key.filter(|_| chunk.is_encrypted()),
        }))
        .collect();
    let info = stub.header.info();
    let meta = if info.size_meta != 0 {
        Some(CiaMeta::from_bytes(&read_at(&mut reader, info.offset_meta, info.size_meta as usize)?)?)
    } else {
        None
    };
    Ok(TitleSource { stub, meta, legit, contents })
}

// Collects the certificates appended to a CDN TMD and ticket into a chain ordered the way CIAs
// store it: CA, ticket signer, TMD signer.
fn cdn_cert_chain(tails: &[&[u8]]) -> Option<CertificateChain> {
    let mut certs: Vec<Certificate> = Vec::new();
    for tail in tails {
        let Ok(chain) = CertificateChain::from_bytes(tail) else {
            continue;
        };
        for cert in chain.certs() {
            if !certs.iter().any(|known| known.full_name() == cert.full_name()) {
                certs.push(cert.clone());
            }
        }
    }
    certs.sort_by_key(|cert| {
        let identity = cert.child_cert_identity();
        ["CA", "XS", "CP"].iter().position(|prefix| identity.starts_with(prefix)).unwrap_or(3)
    });
    if certs.len() < 3 {
        warn!("CDN files hold only {} certificates, the CIA will not carry a full chain", certs.len());
    }
    if certs.is_empty() { None } else { Some(CertificateChain::from_certs(certs)) }
}

// Finds the files in a CDN directory that are named like content IDs.
fn cdn_content_files(dir: &Path) -> Result<HashMap<u32, PathBuf>, PipelineError> {
    let pattern = format!("{}/{}", glob::Pattern::escape(&dir.display().to_string()), "[0-9a-fA-F]".repeat(8));
    Ok(glob(&pattern)?
        .filter_map(|entry| entry.ok())
        .filter_map(|path| {
            let id = u32::from_str_radix(path.file_name()?.to_str()?, 16).ok()?;
            Some((id, path))
        })
        .collect())
}

/// Prepares a CIA from a TMD and the content files next to it, laid out the way titles are
/// stored on the CDN. A `cetk` ticket is used when there is one. A legit CIA keeps the ticket,
/// TMD and encrypted contents as they are and can't be built without the ticket; otherwise the
/// contents are decrypted and a fake ticket is used.
pub fn title_from_cdn(ctx: &mut CryptoContext, tmd_path: &Path, legit: bool) -> Result<TitleSource, PipelineError> {
    let dir = tmd_path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let tmd_data = fs::read(tmd_path)?;
    let mut tmd = Tmd::from_bytes(&tmd_data)?;
    tmd.validate()?;
    let cetk_path = dir.join(CETK_NAME);
    let cetk_data = if cetk_path.is_file() { Some(fs::read(&cetk_path)?) } else { None };
    let cdn_ticket = match &cetk_data {
        Some(data) => Some(Ticket::from_bytes(data)?),
        None => None,
    };
    let title_key = match &cdn_ticket {
        Some(ticket) => Some(ticket.title_key_dec(ctx)?),
        None => None,
    };
    if tmd.content_chunks.iter().any(|chunk| chunk.is_encrypted()) && title_key.is_none() {
        return Err(PipelineError::MissingTicket(tmd.title_id));
    }

    let files = cdn_content_files(dir)?;
    let mut contents = Vec::new();
    let mut missing = Vec::new();
    for (i, chunk) in tmd.content_chunks.iter().enumerate() {
        match files.get(&chunk.content_id) {
            Some(path) => contents.push(ContentSource {
                chunk: i,
                path: path.clone(),
                offset: 0,
                title_key: title_key.filter(|_| chunk.is_encrypted()),
            }),
            None if chunk.is_optional() => {
                debug!("optional content {:08x} is not there", chunk.content_id);
                missing.push(i);
            },
            None => return Err(PipelineError::MissingContent(chunk.content_id)),
        }
    }

    if legit {
        let ticket = cdn_ticket.ok_or(PipelineError::MissingTicket(tmd.title_id))?;
        let mut tails: Vec<&[u8]> = vec![&tmd_data[tmd.size().min(tmd_data.len())..]];
        if let Some(data) = &cetk_data {
            tails.push(&data[ticket_size(data)?.min(data.len())..]);
        }
        let chain = cdn_cert_chain(&tails);
        let mut stub = CiaStub::new(ticket, tmd, chain.as_ref())?;
        for i in missing {
            let chunk = &stub.tmd.content_chunks[i];
            stub.header.clear_content(chunk.index);
            stub.header.content_size -= chunk.size;
        }
        return Ok(TitleSource { stub, meta: None, legit: true, contents });
    }

    let is_dev = tmd.is_dev();
    let ticket = fake_ticket(ctx, tmd.title_id, is_dev)?;
    tmd.content_chunks = tmd.content_chunks.into_iter().enumerate()
        .filter(|(i, _)| !missing.contains(i))
        .map(|(_, chunk)| chunk)
        .collect();
    // Dropping chunks shifts the positions of the ones after them.
    for (i, content) in contents.iter_mut().enumerate() {
        content.chunk = i;
    }
    tmd.content_info[0].cmd_count = tmd.content_chunks.len() as u16;
    for info in tmd.content_info.iter_mut().skip(1) {
        info.cmd_count = 0;
        info.index = 0;
    }
    Ok(TitleSource {
        stub: CiaStub::new(ticket, tmd, None)?,
        meta: None,
        legit: false,
        contents,
    })
}

/// Writes a CIA from a prepared source. Contents are streamed into the output and hashed on the
/// way. For non-legit sources, encrypted contents are decrypted and the TMD hashes are rebuilt to
/// match; legit sources are written untouched and have their content hashes checked instead.
pub fn write_cia<W: Write + Seek>(ctx: &mut CryptoContext, source: TitleSource, out: &mut W, progress: &mut Progress) -> Result<CiaStub, PipelineError> {
    let TitleSource { mut stub, meta, legit, contents } = source;
    if !legit {
        stub.update_header();
        stub.header.content_index.fill(0);
        stub.header.content_size = 0;
        for content in &contents {
            let chunk = &stub.tmd.content_chunks[content.chunk];
            stub.header.set_content(chunk.index);
            stub.header.content_size += chunk.size;
        }
    }
    stub.header.meta_size = if meta.is_some() { CIA_META_SIZE } else { 0 };
    out.seek(SeekFrom::Start(0))?;
    out.write_all(&stub.to_bytes()?)?;

    for content in &contents {
        let chunk = &mut stub.tmd.content_chunks[content.chunk];
        let mut reader = File::open(&content.path)?;
        let mut cipher = content.title_key.map(|key| ContentCipher::decryptor(key, chunk.index));
        let mut sha = ShaEngine::new(ShaMode::Sha256);
        read_chunks(&mut reader, content.offset, chunk.size, progress, |_, data| {
            match cipher.as_mut() {
                Some(cipher) if legit => {
                    let mut plain = data.to_vec();
                    cipher.process(ctx, &mut plain)?;
                    sha.update(&plain);
                },
                Some(cipher) => {
                    cipher.process(ctx, data)?;
                    sha.update(data);
                },
                None => sha.update(data),
            }
            out.write_all(data)?;
            Ok(())
        })?;
        let hash = sha.get();
        if legit {
            if hash != chunk.hash {
                return Err(PipelineError::HashMismatch(format!("content {:08x}", chunk.content_id)));
            }
        } else {
            chunk.hash = hash;
            chunk.set_encrypted(false);
        }
        debug!("wrote content {:08x}", chunk.content_id);
    }

    if !legit {
        stub.tmd.fix_hashes()?;
        out.seek(SeekFrom::Start(0))?;
        out.write_all(&stub.to_bytes()?)?;
    }
    if let Some(meta) = meta {
        out.seek(SeekFrom::Start(stub.header.info().offset_meta))?;
        out.write_all(&meta.to_bytes()?)?;
    }
    Ok(stub)
}

/// Builds a CIA from an NCCH, an NCSD, a CDN TMD or another CIA. Legit CIAs can't be built from
/// NCCH or NCSD images.
pub fn build_cia(
    ctx: &mut CryptoContext,
    input: &Path,
    output: &Path,
    legit: bool,
    callback: &mut dyn FnMut(u64, u64) -> bool,
) -> Result<CiaStub, PipelineError> {
    let file_type = identify_file(input)?.ok_or_else(|| PipelineError::UnknownType(path_name(input)))?;
    let source = match file_type {
        CtrFileType::Ncch | CtrFileType::Ncsd if legit => return Err(PipelineError::LegitImpossible(file_type.name())),
        CtrFileType::Ncch => title_from_ncch(ctx, input)?,
        CtrFileType::Ncsd => title_from_ncsd(ctx, input)?,
        CtrFileType::Tmd => title_from_cdn(ctx, input, legit)?,
        CtrFileType::Cia if input == output => return Err(PipelineError::Unsupported("CIA", "rebuilt in place")),
        CtrFileType::Cia => title_from_cia(ctx, input, legit)?,
        _ => return Err(PipelineError::Unsupported(file_type.name(), "built into a CIA")),
    };
    let total = source.contents.iter().map(|content| source.stub.tmd.content_chunks[content.chunk].size).sum();
    let mut progress = Progress::new(callback, total);
    let mut out = File::create(output)?;
    let stub = write_cia(ctx, source, &mut out, &mut progress)?;
    info!("built {}CIA for {:016X} at {}", if legit { "legit " } else { "" }, stub.tmd.title_id, output.display());
    Ok(stub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use crate::crypto::sha::sha256;
    use crate::ncch::ncsd::build_test_ncsd;
    use crate::ncch::test_utils::{build_encrypted_test_ncch, build_test_ncch, ncch_context, TEST_PROGRAM_ID};
    use crate::pipeline::no_progress;
    use crate::pipeline::test_utils::{build_test_cia, TEST_TITLE_KEY};
    use crate::pipeline::verify::verify_cia;

    fn verify(ctx: &mut CryptoContext, data: &[u8]) {
        let mut callback = no_progress;
        let mut progress = Progress::new(&mut callback, 0);
        verify_cia(ctx, &mut Cursor::new(data), &mut progress).unwrap();
    }

    #[test]
    fn test_build_from_ncch() {
        let mut ctx = ncch_context();
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("game.cxi");
        let output = dir.path().join("game.cia");
        let ncch = build_encrypted_test_ncch(&mut ctx);
        fs::write(&input, &ncch).unwrap();

        let stub = build_cia(&mut ctx, &input, &output, false, &mut no_progress).unwrap();
        let data = fs::read(&output).unwrap();
        let info = stub.header.info();
        assert_eq!(stub.tmd.title_id, TEST_PROGRAM_ID);
        assert_eq!(stub.tmd.content_chunks[0].hash, sha256(&ncch));
        assert_eq!(data.len() as u64, info.size_cia);
        assert_eq!(info.size_meta, CIA_META_SIZE as u64);
        let offset = info.offset_content as usize;
        assert_eq!(data[offset..offset + ncch.len()], ncch[..]);
        verify(&mut ctx, &data);
        assert!(matches!(
            build_cia(&mut ctx, &input, &output, true, &mut no_progress),
            Err(PipelineError::LegitImpossible("NCCH"))
        ));
    }

    #[test]
    fn test_build_from_ncsd() {
        let mut ctx = ncch_context();
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("game.3ds");
        let ncch = build_test_ncch(0);
        fs::write(&input, build_test_ncsd(&[&ncch, &ncch])).unwrap();
        let source = title_from_ncsd(&mut ctx, &input).unwrap();
        let indexes: Vec<u16> = source.stub.tmd.content_chunks.iter().map(|chunk| chunk.index).collect();
        assert_eq!(indexes, vec![0, 1]);

        let mut out = Cursor::new(Vec::new());
        let mut callback = no_progress;
        let mut progress = Progress::new(&mut callback, 0);
        let stub = write_cia(&mut ctx, source, &mut out, &mut progress).unwrap();
        assert!(stub.header.has_content(1));
        verify(&mut ctx, out.get_ref());
    }

    #[test]
    fn test_rebuild_decrypts_cia() {
        let mut ctx = ncch_context();
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.cia");
        let output = dir.path().join("out.cia");
        let ncch = build_test_ncch(0);
        fs::write(&input, build_test_cia(&mut ctx, &[&ncch], true)).unwrap();

        let stub = build_cia(&mut ctx, &input, &output, false, &mut no_progress).unwrap();
        assert!(!stub.tmd.content_chunks[0].is_encrypted());
        let data = fs::read(&output).unwrap();
        let offset = stub.header.info().offset_content as usize;
        assert_eq!(data[offset..offset + ncch.len()], ncch[..]);
        verify(&mut ctx, &data);

        let stub = build_cia(&mut ctx, &input, &output, true, &mut no_progress).unwrap();
        assert!(stub.tmd.content_chunks[0].is_encrypted());
        assert_eq!(fs::read(&output).unwrap(), fs::read(&input).unwrap());
    }

    // Lays out a CDN directory for a title with one encrypted content.
    fn cdn_dir(ctx: &mut CryptoContext, with_ticket: bool) -> (tempfile::TempDir, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let plain = build_test_ncch(0);
        let mut tmd = Tmd::new_fake(TEST_PROGRAM_ID, 1, 0, 0).unwrap();
        let chunk = &mut tmd.content_chunks[0];
        chunk.content_id = 0x2A;
        chunk.size = plain.len() as u64;
        chunk.hash = sha256(&plain);
        chunk.set_encrypted(true);
        tmd.fix_hashes().unwrap();
        fs::write(dir.path().join("tmd"), tmd.to_bytes().unwrap()).unwrap();
        let mut encrypted = plain.clone();
        ContentCipher::encryptor(TEST_TITLE_KEY, 0).process(ctx, &mut encrypted).unwrap();
        fs::write(dir.path().join("0000002a"), &encrypted).unwrap();
        if with_ticket {
            let mut ticket = Ticket::new_fake(TEST_PROGRAM_ID, false);
            ticket.set_title_key_dec(ctx, TEST_TITLE_KEY).unwrap();
            fs::write(dir.path().join(CETK_NAME), ticket.to_bytes().unwrap()).unwrap();
        }
        (dir, encrypted)
    }

    #[test]
    fn test_build_from_cdn() {
        let mut ctx = ncch_context();
        let (dir, encrypted) = cdn_dir(&mut ctx, true);
        let output = dir.path().join("title.cia");
        let stub = build_cia(&mut ctx, &dir.path().join("tmd"), &output, false, &mut no_progress).unwrap();
        assert!(!stub.tmd.content_chunks[0].is_encrypted());
        let data = fs::read(&output).unwrap();
        let offset = stub.header.info().offset_content as usize;
        assert_eq!(data[offset..offset + encrypted.len()], build_test_ncch(0)[..]);
        verify(&mut ctx, &data);

        let stub = build_cia(&mut ctx, &dir.path().join("tmd"), &output, true, &mut no_progress).unwrap();
        assert!(stub.tmd.content_chunks[0].is_encrypted());
        let data = fs::read(&output).unwrap();
        assert_eq!(data[offset..offset + encrypted.len()], encrypted[..]);
        assert_eq!(stub.ticket.title_key_dec(&mut ctx).unwrap(), TEST_TITLE_KEY);
        verify(&mut ctx, &data);
    }

    #[test]
    fn test_cdn_needs_ticket_and_contents() {
        let mut ctx = ncch_context();
        let (dir, _) = cdn_dir(&mut ctx, false);
        let tmd = dir.path().join("tmd");
        assert!(matches!(title_from_cdn(&mut ctx, &tmd, false), Err(PipelineError::MissingTicket(TEST_PROGRAM_ID))));
        let (dir, _) = cdn_dir(&mut ctx, true);
        fs::remove_file(dir.path().join("0000002a")).unwrap();
        let tmd = dir.path().join("tmd");
        assert!(matches!(title_from_cdn(&mut ctx, &tmd, true), Err(PipelineError::MissingContent(0x2A))));
    }
}
