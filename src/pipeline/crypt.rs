// pipeline/crypt.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements decrypting and encrypting whole files in place, chunk by chunk.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use log::{debug, info};
use crate::boss::{is_boss_encrypted, BossStream, BOSS_HEADER_SIZE};
use crate::crypto::CryptoContext;
use crate::crypto::keydb::{crypt_key_database, KeyType, KEYDB_KEYSLOT};
use crate::crypto::sha::{ShaEngine, ShaMode};
use crate::filetype::{identify_file, CtrFileType};
use crate::firm::decrypt_firm;
use crate::ncch::{NcchCrypto, NcchHeader, NcchStream, NCCH_HEADER_SIZE};
use crate::ncch::ncsd::{NcsdHeader, NcsdStream, NCSD_HEADER_SIZE};
use crate::pipeline::{path_name, read_at, read_cia_stub, read_ncch_header, rewrite_chunks, PipelineError, Progress};
use crate::title::crypto::ContentCipher;

fn target_crypto(encrypt: bool) -> NcchCrypto {
    if encrypt { NcchCrypto::STANDARD } else { NcchCrypto::NONE }
}

/// Converts the NCCH at the start of `file` to standard crypto or no crypto. Returns false if it
/// already had that crypto.
pub fn crypt_ncch_file<F: Read + Write + Seek>(ctx: &mut CryptoContext, file: &mut F, encrypt: bool, progress: &mut Progress) -> Result<bool, PipelineError> {
    let header = read_ncch_header(file, 0)?;
    header.validate(0)?;
    let target = target_crypto(encrypt);
    if header.crypto() == target {
        return Ok(false);
    }
    let mut stream = NcchStream::new(target);
    rewrite_chunks(file, 0, header.ncch_size(), progress, |pos, data| Ok(stream.feed(ctx, pos, data)?))?;
    Ok(true)
}

/// Converts every partition of the NCSD in `file`. Returns false if all of them already had the
/// requested crypto.
pub fn crypt_ncsd_file<F: Read + Write + Seek>(ctx: &mut CryptoContext, file: &mut F, encrypt: bool, progress: &mut Progress) -> Result<bool, PipelineError> {
    let header = NcsdHeader::from_bytes(&read_at(file, 0, NCSD_HEADER_SIZE)?)?;
    header.validate()?;
    let target = target_crypto(encrypt);
    let mut pending = false;
    for (_, offset, _) in header.present_partitions() {
        pending |= read_ncch_header(file, offset)?.crypto() != target;
    }
    if !pending {
        return Ok(false);
    }
    let mut stream = NcsdStream::new(target);
    rewrite_chunks(file, 0, header.trimmed_size(), progress, |pos, data| Ok(stream.feed(ctx, pos, data)?))?;
    Ok(true)
}

/// Converts the contents of a CIA. Decrypting removes the title key crypto and the NCCH crypto of
/// every content; encrypting applies standard NCCH crypto and keeps the title key crypto of
/// contents that had it. Content hashes and the TMD are updated to match.
pub fn crypt_cia_file<F: Read + Write + Seek>(ctx: &mut CryptoContext, file: &mut F, encrypt: bool, progress: &mut Progress) -> Result<bool, PipelineError> {
    let mut stub = read_cia_stub(file)?;
    let target = target_crypto(encrypt);
    let needs_key = stub.tmd.content_chunks.iter().any(|chunk| chunk.is_encrypted());
    let title_key = if needs_key { Some(stub.ticket.title_key_dec(ctx)?) } else { None };
    let offsets = stub.content_offsets();
    let mut changed = false;
    for (chunk, offset) in stub.tmd.content_chunks.iter_mut().zip(offsets) {
        let Some(offset) = offset else {
            continue;
        };
        let cbc_key = title_key.filter(|_| chunk.is_encrypted());
        let mut decryptor = cbc_key.map(|key| ContentCipher::decryptor(key, chunk.index));
        let mut encryptor = if encrypt { cbc_key.map(|key| ContentCipher::encryptor(key, chunk.index)) } else { None };
        let mut stream: Option<NcchStream> = None;
        let mut ncch_changed = false;
        let mut sha = ShaEngine::new(ShaMode::Sha256);
        rewrite_chunks(file, offset, chunk.size, progress, |pos, data| {
            if let Some(cipher) = decryptor.as_mut() {
                cipher.process(ctx, data)?;
            }
            if pos == 0 && data.len() >= NCCH_HEADER_SIZE && &data[0x100..0x104] == b"NCCH" {
                let header = NcchHeader::from_bytes(&data[..NCCH_HEADER_SIZE])?;
                ncch_changed = header.crypto() != target;
                stream = Some(NcchStream::new(target));
            }
            if let Some(stream) = stream.as_mut() {
                stream.feed(ctx, pos, data)?;
            }
            sha.update(data);
            if let Some(cipher) = encryptor.as_mut() {
                cipher.process(ctx, data)?;
            }
            Ok(())
        })?;
        if !encrypt && chunk.is_encrypted() {
            chunk.set_encrypted(false);
            changed = true;
        }
        changed |= ncch_changed;
        chunk.hash = sha.get();
        debug!("processed content {:08x}", chunk.content_id);
    }
    if !changed {
        return Ok(false);
    }
    stub.tmd.fix_hashes()?;
    file.seek(SeekFrom::Start(stub.header.info().offset_tmd))?;
    file.write_all(&stub.tmd.to_bytes()?)?;
    Ok(true)
}

/// Encrypts or decrypts a BOSS file. Returns false if it was already in the requested state.
pub fn crypt_boss_file<F: Read + Write + Seek>(ctx: &mut CryptoContext, file: &mut F, size: u64, encrypt: bool, progress: &mut Progress) -> Result<bool, PipelineError> {
    if is_boss_encrypted(ctx, &read_at(file, 0, BOSS_HEADER_SIZE)?)? == encrypt {
        return Ok(false);
    }
    let mut stream = BossStream::new(encrypt);
    rewrite_chunks(file, 0, size, progress, |pos, data| Ok(stream.feed(ctx, pos, data)?))?;
    Ok(true)
}

/// Decrypts or encrypts a file of any type that supports it. With an output path the input is
/// copied there first and the copy is processed, otherwise the input is processed in place.
/// Returns false if the file was already in the requested state.
pub fn crypt_file(
    ctx: &mut CryptoContext,
    input: &Path,
    output: Option<&Path>,
    encrypt: bool,
    callback: &mut dyn FnMut(u64, u64) -> bool,
) -> Result<bool, PipelineError> {
    let file_type = identify_file(input)?.ok_or_else(|| PipelineError::UnknownType(path_name(input)))?;
    let action = if encrypt { "encrypted" } else { "decrypted" };
    match file_type {
        CtrFileType::Ncch | CtrFileType::Ncsd | CtrFileType::Cia | CtrFileType::Boss | CtrFileType::KeyDb => (),
        CtrFileType::Firm if !encrypt => (),
        _ => return Err(PipelineError::Unsupported(file_type.name(), action)),
    }
    let path = match output {
        Some(output) if output != input => {
            fs::copy(input, output)?;
            output
        },
        _ => input,
    };
    let size = fs::metadata(path)?.len();
    let mut progress = Progress::new(callback, size);
    let changed = match file_type {
        CtrFileType::Firm => {
            let mut data = fs::read(path)?;
            let changed = decrypt_firm(ctx, &mut data)?;
            if changed {
                fs::write(path, &data)?;
            }
            changed
        },
        CtrFileType::KeyDb => {
            let data = fs::read(path)?;
            ctx.keydb.load_key(&mut ctx.aes, KEYDB_KEYSLOT, KeyType::X, None)?;
            let converted = crypt_key_database(&mut ctx.aes, &data, encrypt)?;
            let changed = converted != data;
            if changed {
                fs::write(path, &converted)?;
            }
            changed
        },
        _ => {
            let mut file = OpenOptions::new().read(true).write(true).open(path)?;
            match file_type {
                CtrFileType::Ncch => crypt_ncch_file(ctx, &mut file, encrypt, &mut progress)?,
                CtrFileType::Ncsd => crypt_ncsd_file(ctx, &mut file, encrypt, &mut progress)?,
                CtrFileType::Cia => crypt_cia_file(ctx, &mut file, encrypt, &mut progress)?,
                _ => crypt_boss_file(ctx, &mut file, size, encrypt, &mut progress)?,
            }
        },
    };
    if changed {
        info!("{} {} {}", file_type.name(), path.display(), action);
    } else {
        info!("{} is already {}", path.display(), action);
    }
    Ok(changed)
}
