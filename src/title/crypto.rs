// title/crypto.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements the common crypto functions required to handle 3DS title keys and CIA content
// encryption.

use thiserror::Error;
use crate::crypto::CryptoContext;
use crate::crypto::aes::{AesError, AesMode, KeyComponent};
use crate::crypto::keydb::{KeyDbError, KeyType};
use crate::title::commonkeys::{dev_common_key_id, get_common_key};

pub const TITLEKEY_KEYSLOT: u8 = 0x3D;
pub const CONTENT_KEYSLOT: u8 = 0x11;

#[derive(Debug, Error)]
pub enum TitleCryptoError {
    #[error("common key index {0} does not exist")]
    UnknownCommonKey(u8),
    #[error("devkit common key could not be loaded")]
    KeyDb(#[from] KeyDbError),
    #[error("AES engine error")]
    Aes(#[from] AesError),
}

// Convert a Title ID into the format required for use as the Title Key decryption IV.
fn title_id_to_iv(title_id: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&title_id.to_be_bytes());
    iv
}

fn setup_common_key(ctx: &mut CryptoContext, common_key_index: u8, is_dev: bool) -> Result<(), TitleCryptoError> {
    if is_dev {
        let id = dev_common_key_id(common_key_index);
        ctx.keydb.load_key(&mut ctx.aes, TITLEKEY_KEYSLOT, KeyType::Normal, Some(&id))?;
    } else {
        let key = get_common_key(common_key_index).ok_or(TitleCryptoError::UnknownCommonKey(common_key_index))?;
        ctx.aes.setup_key(TITLEKEY_KEYSLOT, KeyComponent::Normal, &key)?;
    }
    ctx.aes.use_keyslot(TITLEKEY_KEYSLOT)?;
    Ok(())
}

fn crypt_title_key(ctx: &mut CryptoContext, title_key: [u8; 16], common_key_index: u8, title_id: u64, is_dev: bool, mode: AesMode) -> Result<[u8; 16], TitleCryptoError> {
    setup_common_key(ctx, common_key_index, is_dev)?;
    let mut iv = title_id_to_iv(title_id);
    let mut title_key = title_key;
    ctx.aes.crypt_blocks(&mut title_key, &mut iv, mode)?;
    Ok(title_key)
}

/// Decrypts a Title Key using the specified common key.
pub fn decrypt_title_key(ctx: &mut CryptoContext, title_key_enc: [u8; 16], common_key_index: u8, title_id: u64, is_dev: bool) -> Result<[u8; 16], TitleCryptoError> {
    crypt_title_key(ctx, title_key_enc, common_key_index, title_id, is_dev, AesMode::CbcDecrypt)
}

/// Encrypts a Title Key using the specified common key.
pub fn encrypt_title_key(ctx: &mut CryptoContext, title_key_dec: [u8; 16], common_key_index: u8, title_id: u64, is_dev: bool) -> Result<[u8; 16], TitleCryptoError> {
    crypt_title_key(ctx, title_key_dec, common_key_index, title_id, is_dev, AesMode::CbcEncrypt)
}

/// Gets the initial CBC IV for a CIA content, which is its content index followed by zeros.
pub fn content_iv(index: u16) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..2].copy_from_slice(&index.to_be_bytes());
    iv
}

/// AES-CBC over one CIA content with its title key, carried across chunks. Chunks must be fed in
/// order and be multiples of the block size.
#[derive(Debug, Clone)]
pub struct ContentCipher {
    title_key: [u8; 16],
    iv: [u8; 16],
    mode: AesMode,
}

impl ContentCipher {
    pub fn decryptor(title_key: [u8; 16], index: u16) -> Self {
        ContentCipher {
            title_key,
            iv: content_iv(index),
            mode: AesMode::CbcDecrypt,
        }
    }

    pub fn encryptor(title_key: [u8; 16], index: u16) -> Self {
        ContentCipher {
            title_key,
            iv: content_iv(index),
            mode: AesMode::CbcEncrypt,
        }
    }

    /// Processes the next chunk of the content in place.
    pub fn process(&mut self, ctx: &mut CryptoContext, data: &mut [u8]) -> Result<(), TitleCryptoError> {
        // The keyslot is shared with fixed key NCCH crypto, so it is set up again every time.
        ctx.aes.setup_key(CONTENT_KEYSLOT, KeyComponent::Normal, &self.title_key)?;
        ctx.aes.use_keyslot(CONTENT_KEYSLOT)?;
        ctx.aes.crypt_blocks(data, &mut self.iv, self.mode)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_key_roundtrip() {
        let mut ctx = CryptoContext::new();
        let title_id = 0x0004000000055D00;
        let enc = encrypt_title_key(&mut ctx, [0u8; 16], 0, title_id, false).unwrap();
        assert_eq!(enc, [0xcf, 0x9c, 0xf1, 0xd3, 0x38, 0x63, 0xf4, 0xd2, 0x5c, 0x03, 0x7b, 0xda, 0x9f, 0x97, 0x44, 0xab]);
        assert_eq!(decrypt_title_key(&mut ctx, enc, 0, title_id, false).unwrap(), [0u8; 16]);
        // Retail common keys go straight in as normal keys.
        assert!(ctx.aes.state().is_loaded(TITLEKEY_KEYSLOT, KeyComponent::Normal));
        assert!(!ctx.aes.state().is_loaded(TITLEKEY_KEYSLOT, KeyComponent::X));
        assert!(!ctx.aes.state().is_loaded(TITLEKEY_KEYSLOT, KeyComponent::Y));
    }

    #[test]
    fn test_unknown_common_key() {
        let mut ctx = CryptoContext::new();
        assert!(matches!(decrypt_title_key(&mut ctx, [0u8; 16], 9, 0, false), Err(TitleCryptoError::UnknownCommonKey(9))));
        assert!(matches!(decrypt_title_key(&mut ctx, [0u8; 16], 0, 0, true), Err(TitleCryptoError::KeyDb(_))));
    }

    #[test]
    fn test_content_decrypt_vector() {
        let mut ctx = CryptoContext::new();
        let mut data = hex::decode("7aca0fd9bcd6ec7c9f97466616e6a282ecc9b00fdb4e6b30e0a7fcf1c08a892c").unwrap();
        ContentCipher::decryptor([0u8; 16], 0).process(&mut ctx, &mut data).unwrap();
        assert_eq!(data, (0u8..0x20).collect::<Vec<u8>>());
    }

    #[test]
    fn test_content_iv_uses_index() {
        let mut ctx = CryptoContext::new();
        let mut data: Vec<u8> = (0u8..0x20).collect();
        let mut cipher = ContentCipher::encryptor([0u8; 16], 1);
        // Two chunks have to give the same result as one.
        cipher.process(&mut ctx, &mut data[..0x10]).unwrap();
        cipher.process(&mut ctx, &mut data[0x10..]).unwrap();
        assert_eq!(hex::encode(&data), "2e82d46a301a42db8dd3a32e858df73d56620ab86866f68e141709ddc16c38fe");
        assert_eq!(content_iv(0x1234)[..3], [0x12, 0x34, 0x00]);
    }
}
