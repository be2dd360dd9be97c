// filetype.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Common code for identifying 3DS file types, mostly by their magic numbers.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use regex::RegexBuilder;
use crate::agbsave::AGBSAVE_MAGIC;
use crate::boss::BOSS_MAGIC;
use crate::crypto::keydb::{parse_key_database, KeyType};
use crate::firm::FIRM_MAGIC;
use crate::ncch::ncchinfo::NcchInfo;
use crate::title::cia::{CiaHeader, CIA_HEADER_SIZE};

/// How many bytes from the start of a file are needed to tell every supported type apart.
pub const IDENTIFY_READ_SIZE: usize = 0x4000;
const SIG_TYPE_RSA2048_SHA256: [u8; 4] = [0x00, 0x01, 0x00, 0x04];
const SIGNED_ISSUER_OFFSET: usize = 0x140;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrFileType {
    Ncch,
    Ncsd,
    Cia,
    Tmd,
    Ticket,
    Boss,
    Firm,
    AgbSave,
    KeyDb,
    LegacyKey,
    SeedDb,
    NcchInfo,
}

impl CtrFileType {
    pub fn name(&self) -> &'static str {
        match self {
            CtrFileType::Ncch => "NCCH",
            CtrFileType::Ncsd => "NCSD",
            CtrFileType::Cia => "CIA",
            CtrFileType::Tmd => "TMD",
            CtrFileType::Ticket => "Ticket",
            CtrFileType::Boss => "BOSS",
            CtrFileType::Firm => "FIRM",
            CtrFileType::AgbSave => "AGBSAVE",
            CtrFileType::KeyDb => "AES key database",
            CtrFileType::LegacyKey => "legacy key file",
            CtrFileType::SeedDb => "seed database",
            CtrFileType::NcchInfo => "ncchinfo.bin",
        }
    }
}

/// A key named the way old key files are, like `slot0x25KeyX.bin` or `slot0x38KeyBOSS.bin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyKeyName {
    pub slot: u8,
    pub key_type: KeyType,
    pub id: Option<String>,
}

/// Parses the name of a legacy key file. A name without a key type is a normal key.
pub fn parse_legacy_key_name(name: &str) -> Option<LegacyKeyName> {
    let re = RegexBuilder::new(r"^slot0x([0-9a-f]{2})key(x|y|iv)?(.*)\.bin$")
        .case_insensitive(true)
        .build()
        .ok()?;
    let caps = re.captures(name)?;
    let slot = u8::from_str_radix(&caps[1], 16).ok()?;
    let key_type = match caps.get(2).map(|m| m.as_str().to_ascii_uppercase()) {
        None => KeyType::Normal,
        Some(t) if t == "IV" => KeyType::Iv,
        Some(t) => KeyType::from_char(t.chars().next()?)?,
    };
    let id = caps.get(3).map(|m| m.as_str()).filter(|id| !id.is_empty()).map(str::to_owned);
    Some(LegacyKeyName { slot, key_type, id })
}

fn signed_issuer(data: &[u8]) -> Option<&str> {
    let issuer = data.get(SIGNED_ISSUER_OFFSET..SIGNED_ISSUER_OFFSET + 0x40)?;
    let end = issuer.iter().position(|&b| b == 0).unwrap_or(issuer.len());
    std::str::from_utf8(&issuer[..end]).ok()
}

fn identify_by_name(name: &str, data: &[u8], file_size: u64) -> Option<CtrFileType> {
    let name = name.to_ascii_lowercase();
    if parse_legacy_key_name(&name).is_some() && file_size == 16 {
        return Some(CtrFileType::LegacyKey);
    }
    let keydb_re = RegexBuilder::new(r"^aeskeydb.*\.bin$").case_insensitive(true).build().ok()?;
    if keydb_re.is_match(&name) && file_size as usize == data.len() && parse_key_database(data).is_ok() {
        return Some(CtrFileType::KeyDb);
    }
    if name == "seeddb.bin" {
        let count = u32::from_le_bytes(data.get(..4)?.try_into().ok()?) as u64;
        if file_size == 0x10 + count * 0x20 {
            return Some(CtrFileType::SeedDb);
        }
    }
    None
}

/// Identifies a file from its first bytes (up to [`IDENTIFY_READ_SIZE`]), its total size and
/// optionally its file name. Names are only needed for the formats that have no magic number.
pub fn identify_data(name: Option<&str>, data: &[u8], file_size: u64) -> Option<CtrFileType> {
    if data.get(0x100..0x104) == Some(&b"NCCH"[..]) {
        return Some(CtrFileType::Ncch);
    }
    if data.get(0x100..0x104) == Some(&b"NCSD"[..]) {
        return Some(CtrFileType::Ncsd);
    }
    if data.starts_with(&BOSS_MAGIC) {
        return Some(CtrFileType::Boss);
    }
    if data.starts_with(&FIRM_MAGIC) {
        return Some(CtrFileType::Firm);
    }
    if data.starts_with(&AGBSAVE_MAGIC) {
        return Some(CtrFileType::AgbSave);
    }
    if data.len() >= CIA_HEADER_SIZE as usize
        && CiaHeader::from_bytes(data).is_ok_and(|header| header.validate().is_ok())
    {
        return Some(CtrFileType::Cia);
    }
    if data.starts_with(&SIG_TYPE_RSA2048_SHA256) {
        if let Some(issuer) = signed_issuer(data) {
            if issuer.starts_with("Root-CA") && issuer.contains("-CP") {
                return Some(CtrFileType::Tmd);
            }
            if issuer.starts_with("Root-CA") && issuer.contains("-XS") {
                return Some(CtrFileType::Ticket);
            }
        }
    }
    if NcchInfo::from_bytes(data).is_ok() {
        return Some(CtrFileType::NcchInfo);
    }
    name.and_then(|name| identify_by_name(name, data, file_size))
}

/// Identifies a file on disk.
pub fn identify_file(path: &Path) -> Result<Option<CtrFileType>, std::io::Error> {
    let file_size = path.metadata()?.len();
    let mut data = Vec::with_capacity(IDENTIFY_READ_SIZE);
    File::open(path)?.take(IDENTIFY_READ_SIZE as u64).read_to_end(&mut data)?;
    let name = path.file_name().and_then(|name| name.to_str());
    Ok(identify_data(name, &data, file_size))
}
