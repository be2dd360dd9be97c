// nand/mod.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Root for all NAND-related modules, and helpers for locating per-console data on a mounted
// CTRNAND partition.

pub mod disa;
pub mod install;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use crate::crypto::sha::sha256;

pub const MOVABLE_PATH: &str = "private/movable.sed";
const MOVABLE_KEY_Y_OFFSET: u64 = 0x110;

#[derive(Debug, Error)]
pub enum NandError {
    #[error("NAND root `{0}` does not contain a readable movable.sed")]
    MovableNotFound(String),
    #[error("system save `{0}` could not be found")]
    SystemSaveNotFound(String),
    #[error("NAND data is not in a valid format")]
    IO(#[from] std::io::Error),
}

/// Reads the console-unique KeyY stored in a NAND's movable.sed.
pub fn read_movable_key_y(nand_root: &Path) -> Result<[u8; 16], NandError> {
    let path = nand_root.join(MOVABLE_PATH);
    let mut file = File::open(&path).map_err(|_| NandError::MovableNotFound(nand_root.display().to_string()))?;
    file.seek(SeekFrom::Start(MOVABLE_KEY_Y_OFFSET))?;
    let mut key_y = [0u8; 16];
    file.read_exact(&mut key_y)?;
    Ok(key_y)
}

/// Gets the ID0 directory name for a movable.sed KeyY. This is the SHA-256 of the KeyY, printed
/// as four little endian words.
pub fn id0_from_key_y(key_y: &[u8; 16]) -> String {
    let hash = sha256(key_y);
    hash[..16]
        .chunks_exact(4)
        .map(|word| format!("{:02x}{:02x}{:02x}{:02x}", word[3], word[2], word[1], word[0]))
        .collect()
}

/// Gets the path to a system save's container file on a mounted NAND.
pub fn system_save_path(nand_root: &Path, save_id: u32) -> Result<PathBuf, NandError> {
    let id0 = id0_from_key_y(&read_movable_key_y(nand_root)?);
    let relative = format!("sysdata/{:08x}/00000000", save_id);
    [id0.clone(), id0.to_uppercase()]
        .iter()
        .map(|id0| nand_root.join("data").join(id0).join(&relative))
        .find(|path| path.is_file())
        .ok_or_else(|| NandError::SystemSaveNotFound(format!("data/{}/{}", id0, relative)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_id0_word_order() {
        let key_y = [0u8; 16];
        // SHA-256 of 16 zero bytes is 374708fff7719dd5979ec875d56cd2286f6d3cf7ec317a3b25632aab28ec37bb.
        assert_eq!(id0_from_key_y(&key_y), "ff084737d59d71f775c89e9728d26cd5");
    }

    #[test]
    fn test_system_save_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut movable = vec![0u8; 0x140];
        movable[0x110..0x120].copy_from_slice(&[0u8; 16]);
        fs::create_dir_all(dir.path().join("private")).unwrap();
        fs::write(dir.path().join(MOVABLE_PATH), movable).unwrap();
        assert!(matches!(system_save_path(dir.path(), 0x0001000F), Err(NandError::SystemSaveNotFound(_))));
        let save_dir = dir.path().join("data/ff084737d59d71f775c89e9728d26cd5/sysdata/0001000f");
        fs::create_dir_all(&save_dir).unwrap();
        fs::write(save_dir.join("00000000"), b"save").unwrap();
        assert_eq!(system_save_path(dir.path(), 0x0001000F).unwrap(), save_dir.join("00000000"));
    }

    #[test]
    fn test_missing_movable() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(read_movable_key_y(dir.path()), Err(NandError::MovableNotFound(_))));
    }
}
