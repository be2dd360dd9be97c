// pipeline/install.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements installing titles from CIA, NCCH and NCSD files into an SD-style title tree.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use log::{debug, info};
use crate::crypto::CryptoContext;
use crate::crypto::sha::{ShaEngine, ShaMode};
use crate::filetype::{identify_file, CtrFileType};
use crate::nand::install::{set_ncch_sd_flag, TitleTree};
use crate::ncch::{NcchCrypto, NcchHeader, NcchStream, NCCH_HEADER_SIZE};
use crate::pipeline::build::{title_from_cia, title_from_ncch, title_from_ncsd, TitleSource};
use crate::pipeline::{path_name, read_chunks, PipelineError, Progress};
use crate::title::cia::CiaStub;
use crate::title::crypto::ContentCipher;

/// Installs a prepared title. Every content is written decrypted, content 0 gets the SD
/// application flag, and the TMD is written with hashes that match. Seeds needed by content 0 are
/// added to the tree's seed database.
pub fn install_title(ctx: &mut CryptoContext, source: TitleSource, tree: &TitleTree, progress: &mut Progress) -> Result<CiaStub, PipelineError> {
    let TitleSource { mut stub, contents, .. } = source;
    let title_id = stub.tmd.title_id;
    tree.begin_title(title_id)?;
    let mut seeded: Option<NcchHeader> = None;
    for content in &contents {
        let chunk = &mut stub.tmd.content_chunks[content.chunk];
        let first = chunk.index == 0;
        let mut reader = File::open(&content.path)?;
        let mut out = File::create(tree.content_path(title_id, chunk.content_id))?;
        let mut cipher = content.title_key.map(|key| ContentCipher::decryptor(key, chunk.index));
        let mut stream: Option<NcchStream> = None;
        let mut sha = ShaEngine::new(ShaMode::Sha256);
        read_chunks(&mut reader, content.offset, chunk.size, progress, |pos, data| {
            if let Some(cipher) = cipher.as_mut() {
                cipher.process(ctx, data)?;
            }
            if pos == 0 && data.len() >= NCCH_HEADER_SIZE && &data[0x100..0x104] == b"NCCH" {
                let header = NcchHeader::from_bytes(&data[..NCCH_HEADER_SIZE])?;
                if first && header.crypto().has_seed_crypto() {
                    seeded = Some(header);
                }
                stream = Some(NcchStream::new(NcchCrypto::NONE));
            }
            if let Some(stream) = stream.as_mut() {
                stream.feed(ctx, pos, data)?;
                if pos == 0 && first {
                    set_ncch_sd_flag(data)?;
                }
            }
            sha.update(data);
            out.write_all(data)?;
            Ok(())
        })?;
        chunk.hash = sha.get();
        chunk.set_encrypted(false);
        debug!("installed content {:08x}", chunk.content_id);
    }
    stub.tmd.fix_hashes()?;
    tree.write_tmd(&stub.tmd)?;
    tree.write_ticket(&stub.ticket)?;
    if let Some(header) = seeded {
        let seed = ctx.seeds.resolve_seed(header.program_id, &header.hash_seed)?;
        if tree.install_seed(header.program_id, seed, &header.hash_seed)? {
            info!("added seed for {:016X} to the install root", header.program_id);
        }
    }
    Ok(stub)
}

/// Installs a CIA, NCCH or NCSD file into a title tree.
pub fn install_file(
    ctx: &mut CryptoContext,
    input: &Path,
    tree: &TitleTree,
    callback: &mut dyn FnMut(u64, u64) -> bool,
) -> Result<CiaStub, PipelineError> {
    let file_type = identify_file(input)?.ok_or_else(|| PipelineError::UnknownType(path_name(input)))?;
    let source = match file_type {
        CtrFileType::Cia => title_from_cia(ctx, input, false)?,
        CtrFileType::Ncch => title_from_ncch(ctx, input)?,
        CtrFileType::Ncsd => title_from_ncsd(ctx, input)?,
        _ => return Err(PipelineError::Unsupported(file_type.name(), "installed")),
    };
    let total = source.contents.iter().map(|content| source.stub.tmd.content_chunks[content.chunk].size).sum();
    let mut progress = Progress::new(callback, total);
    let stub = install_title(ctx, source, tree, &mut progress)?;
    info!("installed {:016X} to {}", stub.tmd.title_id, tree.root().display());
    Ok(stub)
}
