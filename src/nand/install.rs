// nand/install.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements the directory layout used when installing titles to an SD-style title tree.

use std::fs;
use std::path::{Path, PathBuf};
use log::{debug, info};
use thiserror::Error;
use walkdir::WalkDir;
use crate::crypto::seed::{self, SeedError, SEEDDB_NAME};
use crate::ncch::{NcchError, NcchHeader, NCCH_EXTHDR_OFFSET, NCCH_HEADER_SIZE};
use crate::ncch::exheader::{exthdr_hash, set_sd_application, EXTHDR_HASHED_SIZE};
use crate::title::title_id_halves;
use crate::title::ticket::Ticket;
use crate::title::tmd::Tmd;

pub const INSTALL_TMD_NAME: &str = "00000000.tmd";

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("install requires the directory `{0}`, but a file with that name already exists")]
    DirectoryNameConflict(String),
    #[error("install root `{0}` does not exist")]
    RootNotFound(String),
    #[error("content 0 has to be a decrypted NCCH before it can be installed")]
    NotDecrypted,
    #[error("content 0 is too short to hold its NCCH header and ExHeader")]
    ContentTooShort,
    #[error("NCCH processing error")]
    Ncch(#[from] NcchError),
    #[error("seed could not be installed")]
    Seed(#[from] SeedError),
    #[error("io error occurred during install")]
    IO(#[from] std::io::Error),
}

fn safe_create_dir(dir: &Path) -> Result<(), InstallError> {
    if !dir.exists() {
        fs::create_dir(dir)?;
    } else if !dir.is_dir() {
        return Err(InstallError::DirectoryNameConflict(dir.display().to_string()));
    }
    Ok(())
}

/// A title tree that titles can be installed to, laid out as
/// `title/<tid_high>/<tid_low>/content/` for the TMD and contents, plus `ticket/` for tickets
/// and a seeddb.bin at the root for seeds.
pub struct TitleTree {
    root: PathBuf,
}

impl TitleTree {
    /// Opens an install root, creating the `title` and `ticket` directories if they don't exist
    /// yet.
    pub fn open(root: PathBuf) -> Result<Self, InstallError> {
        if !root.is_dir() {
            return Err(InstallError::RootNotFound(root.display().to_string()));
        }
        safe_create_dir(&root.join("title"))?;
        safe_create_dir(&root.join("ticket"))?;
        Ok(TitleTree { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn title_dir(&self, title_id: u64) -> PathBuf {
        let (tid_high, tid_low) = title_id_halves(title_id);
        self.root.join("title").join(tid_high).join(tid_low)
    }

    pub fn content_dir(&self, title_id: u64) -> PathBuf {
        self.title_dir(title_id).join("content")
    }

    pub fn content_path(&self, title_id: u64, content_id: u32) -> PathBuf {
        self.content_dir(title_id).join(format!("{:08x}.app", content_id))
    }

    pub fn ticket_path(&self, title_id: u64) -> PathBuf {
        self.root.join("ticket").join(format!("{:016x}.tik", title_id))
    }

    /// Prepares the directories for a title. Any content installed for it before is removed, so
    /// that an install always starts from an empty content directory.
    pub fn begin_title(&self, title_id: u64) -> Result<PathBuf, InstallError> {
        let (tid_high, _) = title_id_halves(title_id);
        safe_create_dir(&self.root.join("title").join(tid_high))?;
        let title_dir = self.title_dir(title_id);
        safe_create_dir(&title_dir)?;
        safe_create_dir(&title_dir.join("data"))?;
        let content_dir = self.content_dir(title_id);
        if content_dir.exists() {
            debug!("removing old content in {}", content_dir.display());
            fs::remove_dir_all(&content_dir)?;
        }
        fs::create_dir(&content_dir)?;
        Ok(content_dir)
    }

    pub fn write_tmd(&self, tmd: &Tmd) -> Result<(), InstallError> {
        fs::write(self.content_dir(tmd.title_id).join(INSTALL_TMD_NAME), tmd.to_bytes()?)?;
        Ok(())
    }

    pub fn write_ticket(&self, ticket: &Ticket) -> Result<(), InstallError> {
        fs::write(self.ticket_path(ticket.title_id), ticket.to_bytes()?)?;
        Ok(())
    }

    /// Adds a title's seed to the seeddb.bin at the root of the tree.
    pub fn install_seed(&self, title_id: u64, seed: [u8; 16], hash_seed: &[u8; 4]) -> Result<bool, InstallError> {
        Ok(seed::install_seed(&self.root.join(SEEDDB_NAME), title_id, seed, Some(hash_seed))?)
    }

    /// Lists the Title IDs of every title in the tree that has a TMD installed.
    pub fn installed_titles(&self) -> Vec<u64> {
        let mut titles: Vec<u64> = WalkDir::new(self.root.join("title"))
            .min_depth(4)
            .max_depth(4)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name() == INSTALL_TMD_NAME)
            .filter_map(|entry| {
                let content = entry.path().parent()?;
                let tid_low = content.parent()?;
                let tid_high = tid_low.parent()?;
                let high = u32::from_str_radix(tid_high.file_name()?.to_str()?, 16).ok()?;
                let low = u32::from_str_radix(tid_low.file_name()?.to_str()?, 16).ok()?;
                Some(((high as u64) << 32) | low as u64)
            })
            .collect();
        titles.sort_unstable();
        titles
    }
}

/// Marks the NCCH at the start of `data` as an SD application, updating the ExHeader hash in its
/// header to match. `data` has to start at offset 0 of a decrypted NCCH and hold at least the
/// hashed part of the ExHeader. Returns whether anything changed.
pub fn set_ncch_sd_flag(data: &mut [u8]) -> Result<bool, InstallError> {
    let exthdr_start = NCCH_EXTHDR_OFFSET as usize;
    if data.len() < exthdr_start + EXTHDR_HASHED_SIZE {
        return Err(InstallError::ContentTooShort);
    }
    let mut header = NcchHeader::from_bytes(&data[..NCCH_HEADER_SIZE])?;
    header.validate(0)?;
    if header.size_exthdr == 0 {
        return Ok(false);
    }
    if !header.crypto().is_no_crypto() {
        return Err(InstallError::NotDecrypted);
    }
    let exthdr = &mut data[exthdr_start..exthdr_start + EXTHDR_HASHED_SIZE];
    if !set_sd_application(exthdr) {
        return Ok(false);
    }
    header.hash_exthdr = exthdr_hash(exthdr);
    data[..NCCH_HEADER_SIZE].copy_from_slice(&header.to_bytes()?);
    info!("set SD application flag for {:016X}", header.program_id);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::seed::{seed_hash, SeedInfo};
    use crate::ncch::NcchCrypto;
    use crate::ncch::exheader::ExtHeaderInfo;
    use crate::ncch::test_utils::{build_test_ncch, TEST_PROGRAM_ID};

    #[test]
    fn test_open_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let tree = TitleTree::open(dir.path().to_path_buf()).unwrap();
        assert!(dir.path().join("title").is_dir());
        assert!(dir.path().join("ticket").is_dir());
        assert_eq!(
            tree.content_path(TEST_PROGRAM_ID, 0xAB),
            dir.path().join("title/00040000/00abcd00/content/000000ab.app")
        );
        assert!(matches!(TitleTree::open(dir.path().join("missing")), Err(InstallError::RootNotFound(_))));
    }

    #[test]
    fn test_directory_conflict() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ticket"), b"not a directory").unwrap();
        assert!(matches!(
            TitleTree::open(dir.path().to_path_buf()),
            Err(InstallError::DirectoryNameConflict(_))
        ));
    }

    #[test]
    fn test_install_title_files() {
        let dir = tempfile::tempdir().unwrap();
        let tree = TitleTree::open(dir.path().to_path_buf()).unwrap();
        let content_dir = tree.begin_title(TEST_PROGRAM_ID).unwrap();
        fs::write(content_dir.join("stale.app"), b"old").unwrap();

        let content_dir = tree.begin_title(TEST_PROGRAM_ID).unwrap();
        assert!(!content_dir.join("stale.app").exists());
        assert!(tree.title_dir(TEST_PROGRAM_ID).join("data").is_dir());

        let tmd = Tmd::new_fake(TEST_PROGRAM_ID, 1, 0x80000, 0).unwrap();
        tree.write_tmd(&tmd).unwrap();
        let ticket = Ticket::new_fake(TEST_PROGRAM_ID, false);
        tree.write_ticket(&ticket).unwrap();
        assert_eq!(fs::read(content_dir.join(INSTALL_TMD_NAME)).unwrap(), tmd.to_bytes().unwrap());
        assert!(dir.path().join("ticket/0004000000abcd00.tik").is_file());
        assert_eq!(tree.installed_titles(), vec![TEST_PROGRAM_ID]);
    }

    #[test]
    fn test_install_seed() {
        let dir = tempfile::tempdir().unwrap();
        let tree = TitleTree::open(dir.path().to_path_buf()).unwrap();
        let seed = [0x5A; 16];
        let hash = seed_hash(&seed, TEST_PROGRAM_ID);
        assert!(tree.install_seed(TEST_PROGRAM_ID, seed, &hash).unwrap());
        assert!(!tree.install_seed(TEST_PROGRAM_ID, seed, &hash).unwrap());
        assert!(matches!(
            tree.install_seed(TEST_PROGRAM_ID, [0; 16], &hash),
            Err(InstallError::Seed(SeedError::HashMismatch(_)))
        ));
        let seeddb = SeedInfo::from_bytes(&fs::read(dir.path().join(SEEDDB_NAME)).unwrap()).unwrap();
        assert_eq!(seeddb.find(TEST_PROGRAM_ID, &hash), Some(seed));
    }

    #[test]
    fn test_set_sd_flag() {
        let mut data = build_test_ncch(0);
        data[0x20D] &= !0x02;
        assert!(set_ncch_sd_flag(&mut data).unwrap());
        let header = NcchHeader::from_bytes(&data[..NCCH_HEADER_SIZE]).unwrap();
        assert_eq!(header.hash_exthdr, exthdr_hash(&data[0x200..0x600]));
        assert!(ExtHeaderInfo::from_bytes(&data[0x200..0xA00]).unwrap().is_sd_application());
        assert!(!set_ncch_sd_flag(&mut data).unwrap());
    }

    #[test]
    fn test_set_sd_flag_needs_plain_ncch() {
        let mut data = build_test_ncch(0);
        let mut header = NcchHeader::from_bytes(&data[..NCCH_HEADER_SIZE]).unwrap();
        header.set_crypto(NcchCrypto::STANDARD);
        data[..NCCH_HEADER_SIZE].copy_from_slice(&header.to_bytes().unwrap());
        assert!(matches!(set_ncch_sd_flag(&mut data), Err(InstallError::NotDecrypted)));
        assert!(matches!(set_ncch_sd_flag(&mut data[..0x300]), Err(InstallError::ContentTooShort)));
    }
}
