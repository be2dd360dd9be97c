// pipeline/mod.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Root for the whole-file operations (verify, decrypt/encrypt, fixing, CIA building, installing and
// xorpad generation), and the chunked I/O they share.

pub mod build;
pub mod crypt;
pub mod fix;
pub mod install;
pub mod verify;
pub mod xorpad;

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;
use crate::agbsave::AgbSaveError;
use crate::boss::BossError;
use crate::crypto::CryptoContext;
use crate::crypto::aes::AesError;
use crate::crypto::keydb::KeyDbError;
use crate::crypto::seed::SeedError;
use crate::firm::FirmError;
use crate::nand::{self, NandError};
use crate::nand::install::InstallError;
use crate::ncch::{NcchError, NcchHeader, NCCH_HEADER_SIZE};
use crate::ncch::exefs::ExeFsError;
use crate::ncch::ncchinfo::NcchInfoError;
use crate::ncch::ncsd::NcsdError;
use crate::title::cert::CertificateError;
use crate::title::cia::{CiaError, CiaHeader, CiaStub, CIA_HEADER_SIZE};
use crate::title::crypto::TitleCryptoError;
use crate::title::ticket::TicketError;
use crate::title::tmd::TmdError;

/// Size of the chunks files are read, processed and written in.
pub const CHUNK_SIZE: usize = 0x100000;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("`{0}` is not a recognized file type")]
    UnknownType(String),
    #[error("{0} files cannot be {1}")]
    Unsupported(&'static str, &'static str),
    #[error("operation was cancelled")]
    Cancelled,
    #[error("a legit CIA cannot be built from {0}")]
    LegitImpossible(&'static str),
    #[error("{0} hash does not match")]
    HashMismatch(String),
    #[error("content {0:08x} could not be found")]
    MissingContent(u32),
    #[error("a ticket is required to decrypt the contents of title {0:016X}")]
    MissingTicket(u64),
    #[error("no NAND with a movable.sed was given, but one is needed for the AGBSAVE CMAC")]
    MissingMovable,
    #[error("invalid file search pattern")]
    Pattern(#[from] glob::PatternError),
    #[error("NCCH processing error")]
    Ncch(#[from] NcchError),
    #[error("NCSD processing error")]
    Ncsd(#[from] NcsdError),
    #[error("ExeFS processing error")]
    ExeFs(#[from] ExeFsError),
    #[error("CIA processing error")]
    Cia(#[from] CiaError),
    #[error("TMD processing error")]
    Tmd(#[from] TmdError),
    #[error("Ticket processing error")]
    Ticket(#[from] TicketError),
    #[error("certificate processing error")]
    Certificate(#[from] CertificateError),
    #[error("title key or content crypto error")]
    TitleCrypto(#[from] TitleCryptoError),
    #[error("BOSS processing error")]
    Boss(#[from] BossError),
    #[error("FIRM processing error")]
    Firm(#[from] FirmError),
    #[error("AGBSAVE processing error")]
    AgbSave(#[from] AgbSaveError),
    #[error("key database error")]
    KeyDb(#[from] KeyDbError),
    #[error("seed error")]
    Seed(#[from] SeedError),
    #[error("NAND error")]
    Nand(#[from] NandError),
    #[error("install error")]
    Install(#[from] InstallError),
    #[error("ncchinfo.bin processing error")]
    NcchInfo(#[from] NcchInfoError),
    #[error("AES engine error")]
    Aes(#[from] AesError),
    #[error("io error occurred during operation")]
    IO(#[from] std::io::Error),
}

/// Tracks progress through an operation and reports it to a callback once per chunk. The
/// callback gets the bytes done so far and the total, and returns false to cancel.
pub struct Progress<'a> {
    callback: &'a mut dyn FnMut(u64, u64) -> bool,
    done: u64,
    total: u64,
}

impl<'a> Progress<'a> {
    pub fn new(callback: &'a mut dyn FnMut(u64, u64) -> bool, total: u64) -> Self {
        Progress { callback, done: 0, total }
    }

    pub fn done(&self) -> u64 {
        self.done
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Records `bytes` more bytes as processed. Fails with `Cancelled` if the callback asks to
    /// stop.
    pub fn advance(&mut self, bytes: u64) -> Result<(), PipelineError> {
        self.done += bytes;
        if !(self.callback)(self.done, self.total) {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }
}

/// A progress callback that never cancels, for callers that don't care.
pub fn no_progress(_done: u64, _total: u64) -> bool {
    true
}

/// Reads `size` bytes starting at `offset` in chunks, and hands every chunk to `process` along
/// with its offset relative to `offset`.
pub(crate) fn read_chunks<R, F>(reader: &mut R, offset: u64, size: u64, progress: &mut Progress, mut process: F) -> Result<(), PipelineError>
where
    R: Read + Seek,
    F: FnMut(u64, &mut [u8]) -> Result<(), PipelineError>,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    reader.seek(SeekFrom::Start(offset))?;
    let mut pos: u64 = 0;
    while pos < size {
        let len = (size - pos).min(CHUNK_SIZE as u64) as usize;
        reader.read_exact(&mut buf[..len])?;
        process(pos, &mut buf[..len])?;
        pos += len as u64;
        progress.advance(len as u64)?;
    }
    Ok(())
}

/// Like [`read_chunks`], but every chunk is written back to where it was read from after
/// `process` is done with it.
pub(crate) fn rewrite_chunks<F, P>(file: &mut F, offset: u64, size: u64, progress: &mut Progress, mut process: P) -> Result<(), PipelineError>
where
    F: Read + Write + Seek,
    P: FnMut(u64, &mut [u8]) -> Result<(), PipelineError>,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut pos: u64 = 0;
    while pos < size {
        let len = (size - pos).min(CHUNK_SIZE as u64) as usize;
        file.seek(SeekFrom::Start(offset + pos))?;
        file.read_exact(&mut buf[..len])?;
        process(pos, &mut buf[..len])?;
        file.seek(SeekFrom::Start(offset + pos))?;
        file.write_all(&buf[..len])?;
        pos += len as u64;
        progress.advance(len as u64)?;
    }
    Ok(())
}

pub(crate) fn read_at<R: Read + Seek>(reader: &mut R, offset: u64, size: usize) -> Result<Vec<u8>, PipelineError> {
    let mut data = vec![0u8; size];
    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(&mut data)?;
    Ok(data)
}

pub(crate) fn read_ncch_header<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<NcchHeader, PipelineError> {
    Ok(NcchHeader::from_bytes(&read_at(reader, offset, NCCH_HEADER_SIZE)?)?)
}

/// Reads everything in a CIA before its first content.
pub(crate) fn read_cia_stub<R: Read + Seek>(reader: &mut R) -> Result<CiaStub, PipelineError> {
    let header = CiaHeader::from_bytes(&read_at(reader, 0, CIA_HEADER_SIZE as usize)?)?;
    header.validate()?;
    let data = read_at(reader, 0, header.info().offset_content as usize)?;
    Ok(CiaStub::from_bytes(&data)?)
}

/// Gets the KeyY from the movable.sed of the first configured NAND that has one.
pub(crate) fn movable_key_y(ctx: &CryptoContext) -> Result<[u8; 16], PipelineError> {
    ctx.seeds.nand_roots().iter()
        .find_map(|root| nand::read_movable_key_y(root).ok())
        .ok_or(PipelineError::MissingMovable)
}

pub(crate) fn path_name(path: &Path) -> String {
    path.display().to_string()
}
