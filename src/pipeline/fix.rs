// pipeline/fix.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements repairing the hashes of BOSS files and the CMAC of AGBSAVE files.

use std::fs;
use std::path::Path;
use log::info;
use crate::agbsave::{agb_save_cmac, fix_agb_save_cmac, AGBSAVE_CMAC_OFFSET};
use crate::boss::fix_boss_hashes;
use crate::crypto::CryptoContext;
use crate::filetype::{identify_file, CtrFileType};
use crate::pipeline::{movable_key_y, path_name, PipelineError};

/// Repairs whatever is broken in a BOSS or AGBSAVE file. `confirm` is asked about every mismatch
/// by name before it gets replaced. Returns whether the file was changed.
pub fn fix_file(ctx: &mut CryptoContext, path: &Path, confirm: &mut dyn FnMut(&str) -> bool) -> Result<bool, PipelineError> {
    let file_type = identify_file(path)?.ok_or_else(|| PipelineError::UnknownType(path_name(path)))?;
    let mut data = fs::read(path)?;
    let fixed = match file_type {
        CtrFileType::Boss => fix_boss_hashes(ctx, &mut data, |name| confirm(name))?,
        CtrFileType::AgbSave => {
            let key_y = movable_key_y(ctx)?;
            let cmac = agb_save_cmac(ctx, &data, &key_y)?;
            if data[AGBSAVE_CMAC_OFFSET..AGBSAVE_CMAC_OFFSET + 16] != cmac && confirm("CMAC") {
                fix_agb_save_cmac(ctx, &mut data, &key_y)?
            } else {
                false
            }
        },
        _ => return Err(PipelineError::Unsupported(file_type.name(), "fixed")),
    };
    if fixed {
        fs::write(path, &data)?;
        info!("wrote fixed {} to {}", file_type.name(), path.display());
    }
    Ok(fixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agbsave::{verify_agb_save, AgbSaveHeader, AGBSAVE_KEYSLOT};
    use crate::boss::verify_boss;
    use crate::boss::test_utils::{boss_context, build_test_boss};
    use crate::crypto::ContextConfig;
    use crate::crypto::aes::KeyComponent;
    use crate::nand::MOVABLE_PATH;

    #[test]
    fn test_fix_boss() {
        let (mut ctx, dir) = boss_context();
        let path = dir.path().join("boss.bin");
        let mut data = build_test_boss(&[0x77; 0x40]);
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let mut asked = Vec::new();
        let mut decline = |name: &str| {
            asked.push(name.to_owned());
            false
        };
        assert!(!fix_file(&mut ctx, &path, &mut decline).unwrap());
        assert_eq!(asked, vec!["payload".to_owned()]);
        assert_eq!(fs::read(&path).unwrap(), data);

        assert!(fix_file(&mut ctx, &path, &mut |_| true).unwrap());
        verify_boss(&mut ctx, &fs::read(&path).unwrap()).unwrap();
        assert!(!fix_file(&mut ctx, &path, &mut |_| true).unwrap());
    }

    #[test]
    fn test_fix_agb_save() {
        let dir = tempfile::tempdir().unwrap();
        let nand = dir.path().join("nand");
        fs::create_dir_all(nand.join("private")).unwrap();
        let mut movable = vec![0u8; 0x120];
        movable[0x110..].copy_from_slice(&[0x22; 16]);
        fs::write(nand.join(MOVABLE_PATH), movable).unwrap();
        let config = ContextConfig { nand_roots: vec![nand], ..Default::default() };
        let mut ctx = CryptoContext::from_config(&config).unwrap();
        ctx.aes.setup_key(AGBSAVE_KEYSLOT, KeyComponent::X, &[0x11; 16]).unwrap();

        let path = dir.path().join("agbsave.bin");
        let mut data = AgbSaveHeader::new(0x0004000000ABCD00, 0x200).to_bytes().unwrap();
        data.extend([0x42u8; 0x200]);
        fs::write(&path, &data).unwrap();

        assert!(fix_file(&mut ctx, &path, &mut |name| name == "CMAC").unwrap());
        verify_agb_save(&mut ctx, &fs::read(&path).unwrap(), &[0x22; 16]).unwrap();
        assert!(!fix_file(&mut ctx, &path, &mut |_| true).unwrap());
    }

    #[test]
    fn test_fix_agb_save_without_nand() {
        let mut ctx = CryptoContext::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agbsave.bin");
        let mut data = AgbSaveHeader::new(0x0004000000ABCD00, 0x200).to_bytes().unwrap();
        data.extend([0x42u8; 0x200]);
        fs::write(&path, &data).unwrap();
        assert!(matches!(fix_file(&mut ctx, &path, &mut |_| true), Err(PipelineError::MissingMovable)));
    }
}
