// crypto/mod.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Root for the rustctr CLI's key and seed database commands.

pub mod keydb;
pub mod seed;
