// title/commonkeys.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr

// Retail common keys, one per ticket common key index. Each is the final keyslot 0x3D normal key
// (KeyX and KeyY already scrambled), so no 0x3D KeyX or KeyY is ever written for retail titles.
// Devkit common keys come from the key database.
const COMMON_KEYS: [&str; 6] = [
    "64c5fd55dd3ad988325baaec5243db98", // eShop titles
    "4aaa3d0e27d4d728d0b1b433f0f9cbc8", // system titles
    "fbb0ef8cdbb0d8e453cd99344371697f",
    "25959b7ad0409f72684198ba2ecd7dc6",
    "7ada22caffc476cc8297a0c7ceeeeebe",
    "a5051ca1b37dcf3afbcf8cc1edd9ce02",
];

/// Returns the retail common key for the specified index, or None if the index is not one of the
/// six that exist. The key is written to keyslot 0x3D as a normal key.
pub fn get_common_key(index: u8) -> Option<[u8; 16]> {
    let key = COMMON_KEYS.get(index as usize)?;
    hex::decode(key).ok()?.try_into().ok()
}

/// Gets the key database ID of a devkit common key.
pub fn dev_common_key_id(index: u8) -> String {
    format!("COMMON{}", index)
}
