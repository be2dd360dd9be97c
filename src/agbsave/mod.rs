// agbsave/mod.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements the structures and methods required for validating and re-signing GBA Virtual
// Console save data (AGBSAVE) as stored on the 3DS.

use std::io::{Cursor, Read, Write};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};
use thiserror::Error;
use crate::crypto::CryptoContext;
use crate::crypto::aes::{AesError, KeyComponent};
use crate::crypto::keydb::{KeyDbError, KeyType};
use crate::crypto::sha::{sha256, ShaEngine, ShaMode};

pub const AGBSAVE_MAGIC: [u8; 4] = *b".SAV";
pub const AGBSAVE_HEADER_SIZE: usize = 0x200;
pub const AGBSAVE_KEYSLOT: u8 = 0x24;
pub const AGBSAVE_MAX_SAVE_SIZE: u32 = 0x20000;
pub const AGBSAVE_MAX_SIZE: usize = AGBSAVE_HEADER_SIZE + AGBSAVE_MAX_SAVE_SIZE as usize;
pub const AGBSAVE_CMAC_OFFSET: usize = 0x10;
const AGBSAVE_HASHED_OFFSET: usize = 0x30;
const VALID_SAVE_SIZES: [u32; 5] = [0x200, 0x2000, 0x8000, 0x10000, 0x20000];

#[derive(Debug, Error)]
pub enum AgbSaveError {
    #[error("data is not an AGBSAVE (bad magic)")]
    BadMagic,
    #[error("AGBSAVE save data starts at {0:#X} instead of 0x200")]
    BadSaveStart(u32),
    #[error("{0:#X} is not a valid GBA save size")]
    InvalidSaveSize(u32),
    #[error("AGBSAVE is truncated: needs {needed:#X} bytes but only {actual:#X} are present")]
    Truncated { needed: usize, actual: usize },
    #[error("AGBSAVE CMAC does not match")]
    CmacMismatch,
    #[error("AGBSAVE key could not be loaded")]
    KeyDb(#[from] KeyDbError),
    #[error("AES engine error")]
    Aes(#[from] AesError),
    #[error("AGBSAVE data is not in a valid format")]
    IO(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgbSaveHeader {
    pub magic: [u8; 4],
    reserved1: [u8; 12],
    pub cmac: [u8; 16],
    reserved2: [u8; 16],
    pub unknown1: u32,
    pub times_saved: u32,
    pub title_id: u64,
    pub sd_cid: [u8; 16],
    pub save_start: u32,
    pub save_size: u32,
    reserved3: [u8; 8],
    pub arm7_cfg1: u32,
    pub arm7_cfg2: u32,
    reserved4: [u8; 0x198],
}

impl AgbSaveHeader {
    /// Creates a fresh header for a save of the given size, with the CMAC left zeroed.
    pub fn new(title_id: u64, save_size: u32) -> Self {
        AgbSaveHeader {
            magic: AGBSAVE_MAGIC,
            reserved1: [0xFF; 12],
            cmac: [0; 16],
            reserved2: [0xFF; 16],
            unknown1: 1,
            times_saved: 0,
            title_id,
            sd_cid: [0; 16],
            save_start: AGBSAVE_HEADER_SIZE as u32,
            save_size,
            reserved3: [0xFF; 8],
            arm7_cfg1: 0,
            arm7_cfg2: 0,
            reserved4: [0xFF; 0x198],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, AgbSaveError> {
        let mut buf = Cursor::new(data);
        let mut magic = [0u8; 4];
        buf.read_exact(&mut magic)?;
        let mut reserved1 = [0u8; 12];
        buf.read_exact(&mut reserved1)?;
        let mut cmac = [0u8; 16];
        buf.read_exact(&mut cmac)?;
        let mut reserved2 = [0u8; 16];
        buf.read_exact(&mut reserved2)?;
        let unknown1 = buf.read_u32::<LittleEndian>()?;
        let times_saved = buf.read_u32::<LittleEndian>()?;
        let title_id = buf.read_u64::<LittleEndian>()?;
        let mut sd_cid = [0u8; 16];
        buf.read_exact(&mut sd_cid)?;
        let save_start = buf.read_u32::<LittleEndian>()?;
        let save_size = buf.read_u32::<LittleEndian>()?;
        let mut reserved3 = [0u8; 8];
        buf.read_exact(&mut reserved3)?;
        let arm7_cfg1 = buf.read_u32::<LittleEndian>()?;
        let arm7_cfg2 = buf.read_u32::<LittleEndian>()?;
        let mut reserved4 = [0u8; 0x198];
        buf.read_exact(&mut reserved4)?;
        Ok(AgbSaveHeader {
            magic,
            reserved1,
            cmac,
            reserved2,
            unknown1,
            times_saved,
            title_id,
            sd_cid,
            save_start,
            save_size,
            reserved3,
            arm7_cfg1,
            arm7_cfg2,
            reserved4,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut buf = Vec::with_capacity(AGBSAVE_HEADER_SIZE);
        buf.write_all(&self.magic)?;
        buf.write_all(&self.reserved1)?;
        buf.write_all(&self.cmac)?;
        buf.write_all(&self.reserved2)?;
        buf.write_u32::<LittleEndian>(self.unknown1)?;
        buf.write_u32::<LittleEndian>(self.times_saved)?;
        buf.write_u64::<LittleEndian>(self.title_id)?;
        buf.write_all(&self.sd_cid)?;
        buf.write_u32::<LittleEndian>(self.save_start)?;
        buf.write_u32::<LittleEndian>(self.save_size)?;
        buf.write_all(&self.reserved3)?;
        buf.write_u32::<LittleEndian>(self.arm7_cfg1)?;
        buf.write_u32::<LittleEndian>(self.arm7_cfg2)?;
        buf.write_all(&self.reserved4)?;
        Ok(buf)
    }

    /// Checks the magic, where the save data starts, and that the save is one of the sizes a GBA
    /// cartridge can have.
    pub fn validate(&self) -> Result<(), AgbSaveError> {
        if self.magic != AGBSAVE_MAGIC {
            return Err(AgbSaveError::BadMagic);
        }
        if self.save_start != AGBSAVE_HEADER_SIZE as u32 {
            return Err(AgbSaveError::BadSaveStart(self.save_start));
        }
        if self.save_size > AGBSAVE_MAX_SAVE_SIZE || !VALID_SAVE_SIZES.contains(&self.save_size) {
            return Err(AgbSaveError::InvalidSaveSize(self.save_size));
        }
        Ok(())
    }

    /// Gets the total size of the header plus the save data it describes.
    pub fn total_size(&self) -> usize {
        AGBSAVE_HEADER_SIZE + self.save_size as usize
    }
}

/// Loads the CMAC key into keyslot 0x24. The KeyX is console-unique and comes from the key
/// database, and the KeyY is the one stored in the console's movable.sed.
pub fn setup_agb_save_key(ctx: &mut CryptoContext, movable_key_y: &[u8; 16]) -> Result<(), AgbSaveError> {
    ctx.keydb.load_key(&mut ctx.aes, AGBSAVE_KEYSLOT, KeyType::X, None)?;
    ctx.aes.setup_key(AGBSAVE_KEYSLOT, KeyComponent::Y, movable_key_y)?;
    ctx.aes.use_keyslot(AGBSAVE_KEYSLOT)?;
    Ok(())
}

// Parses and validates the header, and makes sure all of the save data is actually present.
fn checked_header(data: &[u8]) -> Result<AgbSaveHeader, AgbSaveError> {
    let header = AgbSaveHeader::from_bytes(data)?;
    header.validate()?;
    if data.len() < header.total_size() {
        return Err(AgbSaveError::Truncated { needed: header.total_size(), actual: data.len() });
    }
    Ok(header)
}

/// Computes the CMAC of an AGBSAVE. Everything after the CMAC field's padding plus the save data
/// is hashed, that hash is hashed again with a "CTR-SAV0" prefix, and that one is hashed with a
/// "CTR-SIGN" prefix and the Title ID. The CMAC is taken over the final hash.
pub fn agb_save_cmac(ctx: &mut CryptoContext, data: &[u8], movable_key_y: &[u8; 16]) -> Result<[u8; 16], AgbSaveError> {
    let header = checked_header(data)?;
    let mut hasher = ShaEngine::new(ShaMode::Sha256);
    hasher.update(&data[AGBSAVE_HASHED_OFFSET..header.total_size()]);
    let inner = hasher.get();

    let mut sav0 = Vec::with_capacity(8 + 32);
    sav0.extend_from_slice(b"CTR-SAV0");
    sav0.extend_from_slice(&inner);
    let mut sign = Vec::with_capacity(8 + 8 + 32);
    sign.extend_from_slice(b"CTR-SIGN");
    sign.extend_from_slice(&header.title_id.to_le_bytes());
    sign.extend_from_slice(&sha256(&sav0));
    let digest = sha256(&sign);

    setup_agb_save_key(ctx, movable_key_y)?;
    let cmac = ctx.aes.cmac(&digest);
    debug!("AGBSAVE CMAC for title {:016X}: {}", header.title_id, hex::encode(cmac));
    Ok(cmac)
}

/// Checks that the CMAC stored in an AGBSAVE header matches its contents.
pub fn verify_agb_save(ctx: &mut CryptoContext, data: &[u8], movable_key_y: &[u8; 16]) -> Result<(), AgbSaveError> {
    let cmac = agb_save_cmac(ctx, data, movable_key_y)?;
    if data[AGBSAVE_CMAC_OFFSET..AGBSAVE_CMAC_OFFSET + 16] != cmac {
        return Err(AgbSaveError::CmacMismatch);
    }
    Ok(())
}

/// Recomputes the CMAC of an AGBSAVE and writes it into the header. Returns whether anything
/// changed.
pub fn fix_agb_save_cmac(ctx: &mut CryptoContext, data: &mut [u8], movable_key_y: &[u8; 16]) -> Result<bool, AgbSaveError> {
    let cmac = agb_save_cmac(ctx, data, movable_key_y)?;
    let stored = &mut data[AGBSAVE_CMAC_OFFSET..AGBSAVE_CMAC_OFFSET + 16];
    if *stored == cmac {
        return Ok(false);
    }
    stored.copy_from_slice(&cmac);
    info!("Fixed AGBSAVE CMAC");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_TITLE_ID: u64 = 0x0004000000ABCD00;
    const TEST_KEY_Y: [u8; 16] = [0x22; 16];

    fn test_save() -> Vec<u8> {
        let mut header = AgbSaveHeader::new(TEST_TITLE_ID, 0x200);
        header.times_saved = 3;
        let mut data = header.to_bytes().unwrap();
        data.extend((0..0x200).map(|i| i as u8));
        data
    }

    fn test_context() -> CryptoContext {
        let mut ctx = CryptoContext::new();
        ctx.aes.setup_key(AGBSAVE_KEYSLOT, KeyComponent::X, &[0x11; 16]).unwrap();
        ctx
    }

    #[test]
    fn test_header_layout() {
        let data = test_save();
        assert_eq!(&data[..4], b".SAV");
        assert_eq!(data[0x38..0x40], TEST_TITLE_ID.to_le_bytes());
        assert_eq!(data[0x50..0x54], [0x00, 0x02, 0x00, 0x00]);
        let header = AgbSaveHeader::from_bytes(&data).unwrap();
        assert_eq!(header.to_bytes().unwrap(), data[..AGBSAVE_HEADER_SIZE]);
        assert_eq!(header.total_size(), 0x400);
    }

    #[test]
    fn test_validate() {
        let mut header = AgbSaveHeader::new(TEST_TITLE_ID, 0x8000);
        assert!(header.validate().is_ok());
        header.save_size = 0x4000;
        assert!(matches!(header.validate(), Err(AgbSaveError::InvalidSaveSize(0x4000))));
        header.save_size = 0x40000;
        assert!(matches!(header.validate(), Err(AgbSaveError::InvalidSaveSize(_))));
        header.save_size = 0x2000;
        header.save_start = 0x400;
        assert!(matches!(header.validate(), Err(AgbSaveError::BadSaveStart(0x400))));
        header.save_start = 0x200;
        header.magic = *b"NOPE";
        assert!(matches!(header.validate(), Err(AgbSaveError::BadMagic)));
    }

    #[test]
    fn test_truncated() {
        let mut ctx = test_context();
        let data = test_save();
        assert!(matches!(
            agb_save_cmac(&mut ctx, &data[..0x300], &TEST_KEY_Y),
            Err(AgbSaveError::Truncated { needed: 0x400, actual: 0x300 })
        ));
    }

    #[test]
    fn test_cmac_fix_and_verify() {
        let mut ctx = test_context();
        let mut data = test_save();
        assert!(matches!(verify_agb_save(&mut ctx, &data, &TEST_KEY_Y), Err(AgbSaveError::CmacMismatch)));
        assert!(fix_agb_save_cmac(&mut ctx, &mut data, &TEST_KEY_Y).unwrap());
        assert_eq!(hex::encode(&data[0x10..0x20]), "0280acb28064229d1e0e0d0704b94a1a");
        verify_agb_save(&mut ctx, &data, &TEST_KEY_Y).unwrap();
        assert!(!fix_agb_save_cmac(&mut ctx, &mut data, &TEST_KEY_Y).unwrap());

        // Changing the save data itself has to invalidate the CMAC.
        data[0x300] ^= 0x01;
        assert!(matches!(verify_agb_save(&mut ctx, &data, &TEST_KEY_Y), Err(AgbSaveError::CmacMismatch)));
    }

    #[test]
    fn test_missing_key_x() {
        let mut ctx = CryptoContext::new();
        let data = test_save();
        assert!(matches!(agb_save_cmac(&mut ctx, &data, &TEST_KEY_Y), Err(AgbSaveError::KeyDb(_))));
    }
}
