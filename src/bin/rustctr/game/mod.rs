// game/mod.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Root for the rustctr CLI's commands that work on game and system containers.

pub mod crypt;
pub mod fix;
pub mod verify;
pub mod xorpad;
