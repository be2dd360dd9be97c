// pipeline/xorpad.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements writing out the xorpads listed in an ncchinfo.bin.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use log::info;
use crate::crypto::CryptoContext;
use crate::ncch::ncchinfo::{NcchInfo, NcchInfoEntry};
use crate::pipeline::{PipelineError, Progress, CHUNK_SIZE};

// Only the final component of the stored name is used, so entries can't write outside `out_dir`.
fn xorpad_path(out_dir: &Path, entry: &NcchInfoEntry) -> PathBuf {
    let name = Path::new(&entry.filename)
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| format!("{:016X}.xorpad", entry.title_id).into());
    out_dir.join(name)
}

/// Writes the xorpad for every entry of an ncchinfo.bin into `out_dir`, and returns the paths
/// that were written.
pub fn generate_xorpads(
    ctx: &mut CryptoContext,
    ncchinfo: &NcchInfo,
    out_dir: &Path,
    callback: &mut dyn FnMut(u64, u64) -> bool,
) -> Result<Vec<PathBuf>, PipelineError> {
    let total = ncchinfo.entries.iter().map(|entry| entry.size()).sum();
    let mut progress = Progress::new(callback, total);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = Vec::with_capacity(ncchinfo.entries.len());
    for entry in &ncchinfo.entries {
        let path = xorpad_path(out_dir, entry);
        let mut out = File::create(&path)?;
        let size = entry.size();
        let mut pos: u64 = 0;
        while pos < size {
            let len = (size - pos).min(CHUNK_SIZE as u64) as usize;
            entry.build_xorpad(ctx, &mut buf[..len], pos)?;
            out.write_all(&buf[..len])?;
            pos += len as u64;
            progress.advance(len as u64)?;
        }
        info!("wrote {:#X} byte xorpad {}", size, path.display());
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use crate::ncch::test_utils::ncch_context;
    use crate::pipeline::no_progress;

    fn entry(filename: &str, size_b: u32) -> NcchInfoEntry {
        NcchInfoEntry {
            ctr: [0x01; 16],
            key_y: [0x02; 16],
            size_mb: 0,
            size_b,
            flag7: 0,
            flag3: 0,
            title_id: 0x0004000000ABCD00,
            filename: filename.to_owned(),
        }
    }

    #[test]
    fn test_generate_xorpads() {
        let mut ctx = ncch_context();
        let dir = tempfile::tempdir().unwrap();
        let size = CHUNK_SIZE as u32 + 0x30;
        let ncchinfo = NcchInfo {
            version: 4,
            entries: vec![entry("/abc.Main.exheader.xorpad", size), entry("../../escape.xorpad", 0x200)],
        };
        let written = generate_xorpads(&mut ctx, &ncchinfo, dir.path(), &mut no_progress).unwrap();
        assert_eq!(written, vec![dir.path().join("abc.Main.exheader.xorpad"), dir.path().join("escape.xorpad")]);

        let mut expected = vec![0u8; size as usize];
        ncchinfo.entries[0].build_xorpad(&mut ctx, &mut expected, 0).unwrap();
        assert_eq!(fs::read(&written[0]).unwrap(), expected);
        assert_eq!(fs::read(&written[1]).unwrap(), expected[..0x200]);
    }

    #[test]
    fn test_cancel() {
        let mut ctx = ncch_context();
        let dir = tempfile::tempdir().unwrap();
        let ncchinfo = NcchInfo { version: 4, entries: vec![entry("pad.xorpad", 0x400)] };
        let mut stop = |_: u64, _: u64| false;
        assert!(matches!(generate_xorpads(&mut ctx, &ncchinfo, dir.path(), &mut stop), Err(PipelineError::Cancelled)));
    }
}
