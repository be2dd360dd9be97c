// crypto/aes.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements a software AES engine with 3DS-style keyslots, the KeyX/KeyY key scrambler, and
// byte-granular AES-CTR for processing files in arbitrarily sized chunks.

use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit, StreamCipher};
use aes::cipher::block_padding::NoPadding;
use aes::cipher::generic_array::GenericArray;
use cmac::{Cmac, Mac};
use thiserror::Error;

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128Ctr = ctr::Ctr128BE<Aes128>;

pub const AES_BLOCK_SIZE: usize = 16;
pub const KEYSLOT_COUNT: u8 = 0x40;

const KEY_SCRAMBLER: u128 = 0x1FF9E9AAC5FE0408024591DC5D52768A;

#[derive(Debug, Error)]
pub enum AesError {
    #[error("keyslot 0x{0:02X} does not exist (must be below 0x40)")]
    InvalidKeyslot(u8),
    #[error("data length {0} is not a multiple of the AES block size")]
    UnalignedLength(usize),
}

/// The three key registers that make up a keyslot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyComponent {
    X,
    Y,
    Normal,
}

/// Block operations supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AesMode {
    CtrCrypt,
    CbcDecrypt,
    CbcEncrypt,
    EcbDecrypt,
    EcbEncrypt,
}

/// Bitmasks tracking which keyslot components currently hold known key material. Bit `n` of
/// each mask refers to keyslot `n`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KeyslotState {
    pub normal: u64,
    pub key_x: u64,
    pub key_y: u64,
}

impl KeyslotState {
    fn mask(&self, component: KeyComponent) -> u64 {
        match component {
            KeyComponent::X => self.key_x,
            KeyComponent::Y => self.key_y,
            KeyComponent::Normal => self.normal,
        }
    }

    /// Checks if the given component of a keyslot has been marked as loaded.
    pub fn is_loaded(&self, slot: u8, component: KeyComponent) -> bool {
        slot < KEYSLOT_COUNT && (self.mask(component) >> slot) & 1 == 1
    }

    /// Marks the given component of a keyslot as loaded.
    pub fn mark(&mut self, slot: u8, component: KeyComponent) {
        if slot >= KEYSLOT_COUNT {
            return;
        }
        let bit = 1u64 << slot;
        match component {
            KeyComponent::X => self.key_x |= bit,
            KeyComponent::Y => self.key_y |= bit,
            KeyComponent::Normal => self.normal |= bit,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Keyslot {
    key_x: [u8; 16],
    key_y: [u8; 16],
    normal: [u8; 16],
}

/// The key material of one keyslot and the active keyslot at the time it was taken. Restoring it
/// undoes any key writes made to that slot in between.
#[derive(Debug, Clone, Copy)]
pub struct KeyslotBackup {
    slot: u8,
    keys: Keyslot,
    active: u8,
}

/// Derives a normal key from a KeyX and a KeyY using the 3DS key scrambler.
pub fn scramble_key(key_x: &[u8; 16], key_y: &[u8; 16]) -> [u8; 16] {
    let x = u128::from_be_bytes(*key_x);
    let y = u128::from_be_bytes(*key_y);
    let normal = (x.rotate_left(2) ^ y).wrapping_add(KEY_SCRAMBLER).rotate_left(87);
    normal.to_be_bytes()
}

/// Adds a number of blocks to a 128-bit big endian counter, wrapping on overflow.
pub fn add_ctr(ctr: &mut [u8; 16], blocks: u64) {
    let value = u128::from_be_bytes(*ctr).wrapping_add(blocks as u128);
    *ctr = value.to_be_bytes();
}

/// A software stand-in for the console's AES engine. Keys are written into one of 64 keyslots,
/// and every block operation runs with the normal key of the active keyslot.
pub struct AesEngine {
    slots: [Keyslot; KEYSLOT_COUNT as usize],
    state: KeyslotState,
    selected: u8,
    active: u8,
}

impl Default for AesEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AesEngine {
    /// Creates a new engine with every keyslot cleared, as after a cold boot.
    pub fn new() -> Self {
        AesEngine {
            slots: [Keyslot::default(); KEYSLOT_COUNT as usize],
            state: KeyslotState::default(),
            selected: 0,
            active: 0,
        }
    }

    pub fn state(&self) -> KeyslotState {
        self.state
    }

    pub fn state_mut(&mut self) -> &mut KeyslotState {
        &mut self.state
    }

    pub fn active_keyslot(&self) -> u8 {
        self.active
    }

    /// Selects the keyslot that subsequent key writes will go to.
    pub fn select_keyslot(&mut self, slot: u8) -> Result<(), AesError> {
        if slot >= KEYSLOT_COUNT {
            return Err(AesError::InvalidKeyslot(slot));
        }
        self.selected = slot;
        Ok(())
    }

    /// Writes a key component into a keyslot. Writing a KeyY regenerates the slot's normal key
    /// from the current KeyX, exactly like the hardware does.
    pub fn load_key(&mut self, slot: u8, component: KeyComponent, key: &[u8; 16]) -> Result<(), AesError> {
        self.select_keyslot(slot)?;
        let keyslot = &mut self.slots[self.selected as usize];
        match component {
            KeyComponent::X => keyslot.key_x = *key,
            KeyComponent::Y => {
                keyslot.key_y = *key;
                keyslot.normal = scramble_key(&keyslot.key_x, &keyslot.key_y);
            },
            KeyComponent::Normal => keyslot.normal = *key,
        }
        Ok(())
    }

    /// Programs a key component and marks it as loaded in the keyslot state.
    pub fn setup_key(&mut self, slot: u8, component: KeyComponent, key: &[u8; 16]) -> Result<(), AesError> {
        self.load_key(slot, component, key)?;
        self.state.mark(slot, component);
        Ok(())
    }

    /// Makes a keyslot active for all following block operations.
    pub fn use_keyslot(&mut self, slot: u8) -> Result<(), AesError> {
        if slot >= KEYSLOT_COUNT {
            return Err(AesError::InvalidKeyslot(slot));
        }
        self.active = slot;
        Ok(())
    }

    pub fn backup_keyslot(&self, slot: u8) -> Result<KeyslotBackup, AesError> {
        if slot >= KEYSLOT_COUNT {
            return Err(AesError::InvalidKeyslot(slot));
        }
        Ok(KeyslotBackup { slot, keys: self.slots[slot as usize], active: self.active })
    }

    /// Puts a keyslot back the way it was when the backup was taken. The keyslot state bitmask is
    /// left alone.
    pub fn restore_keyslot(&mut self, backup: &KeyslotBackup) {
        self.slots[backup.slot as usize] = backup.keys;
        self.active = backup.active;
    }

    fn cipher(&self) -> Aes128 {
        Aes128::new(&self.slots[self.active as usize].normal.into())
    }

    fn active_key(&self) -> [u8; 16] {
        self.slots[self.active as usize].normal
    }

    /// Runs a block operation over `data` in place. For CBC modes `iv` is updated to the value
    /// needed to continue the chain, and for CTR it is advanced past the processed blocks.
    pub fn crypt_blocks(&self, data: &mut [u8], iv: &mut [u8; 16], mode: AesMode) -> Result<(), AesError> {
        if data.len() % AES_BLOCK_SIZE != 0 {
            return Err(AesError::UnalignedLength(data.len()));
        }
        if data.is_empty() {
            return Ok(());
        }
        let key = self.active_key();
        let tail = data.len() - AES_BLOCK_SIZE;
        match mode {
            AesMode::CtrCrypt => {
                let mut cipher = Aes128Ctr::new(&key.into(), &(*iv).into());
                cipher.apply_keystream(data);
                add_ctr(iv, (data.len() / AES_BLOCK_SIZE) as u64);
            },
            AesMode::CbcDecrypt => {
                let len = data.len();
                let mut next_iv = [0u8; 16];
                next_iv.copy_from_slice(&data[tail..]);
                Aes128CbcDec::new(&key.into(), &(*iv).into())
                    .decrypt_padded_mut::<NoPadding>(data)
                    .map_err(|_| AesError::UnalignedLength(len))?;
                *iv = next_iv;
            },
            AesMode::CbcEncrypt => {
                let len = data.len();
                Aes128CbcEnc::new(&key.into(), &(*iv).into())
                    .encrypt_padded_mut::<NoPadding>(data, len)
                    .map_err(|_| AesError::UnalignedLength(len))?;
                iv.copy_from_slice(&data[tail..]);
            },
            AesMode::EcbDecrypt => {
                let cipher = self.cipher();
                for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
                    cipher.decrypt_block(GenericArray::from_mut_slice(block));
                }
            },
            AesMode::EcbEncrypt => {
                let cipher = self.cipher();
                for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
                    cipher.encrypt_block(GenericArray::from_mut_slice(block));
                }
            },
        }
        Ok(())
    }

    /// Encrypts a single block with the active key in ECB mode.
    pub fn ecb_encrypt_block(&self, block: &mut [u8; 16]) {
        self.cipher().encrypt_block(GenericArray::from_mut_slice(block));
    }

    /// Decrypts a single block with the active key in ECB mode.
    pub fn ecb_decrypt_block(&self, block: &mut [u8; 16]) {
        self.cipher().decrypt_block(GenericArray::from_mut_slice(block));
    }

    /// AES-CMAC of `data` under the active key.
    pub fn cmac(&self, data: &[u8]) -> [u8; 16] {
        let mut mac = <Cmac<Aes128> as Mac>::new(&self.active_key().into());
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// AES-CTR over `data`, where `data` starts `offset` bytes into a stream whose first block
    /// uses `ctr`. Neither the offset nor the length need to be block aligned, so a stream can be
    /// processed in chunks of any size and the result is the same as one pass over everything.
    pub fn ctr_crypt_byte(&self, data: &mut [u8], offset: u64, ctr: &[u8; 16]) {
        let mut ctr = *ctr;
        add_ctr(&mut ctr, offset / AES_BLOCK_SIZE as u64);
        let skip = (offset % AES_BLOCK_SIZE as u64) as usize;
        let mut data = data;
        let key = self.active_key();

        if skip != 0 && !data.is_empty() {
            let count = (AES_BLOCK_SIZE - skip).min(data.len());
            let mut block = [0u8; AES_BLOCK_SIZE];
            block[skip..skip + count].copy_from_slice(&data[..count]);
            Aes128Ctr::new(&key.into(), &ctr.into()).apply_keystream(&mut block);
            data[..count].copy_from_slice(&block[skip..skip + count]);
            add_ctr(&mut ctr, 1);
            data = &mut data[count..];
        }

        let aligned = data.len() - data.len() % AES_BLOCK_SIZE;
        let (body, rest) = data.split_at_mut(aligned);
        if !body.is_empty() {
            Aes128Ctr::new(&key.into(), &ctr.into()).apply_keystream(body);
            add_ctr(&mut ctr, (aligned / AES_BLOCK_SIZE) as u64);
        }

        if !rest.is_empty() {
            let mut block = [0u8; AES_BLOCK_SIZE];
            block[..rest.len()].copy_from_slice(rest);
            Aes128Ctr::new(&key.into(), &ctr.into()).apply_keystream(&mut block);
            let len = rest.len();
            rest.copy_from_slice(&block[..len]);
        }
    }
}
