// title/mod.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Root for the rustctr CLI's title-related commands.

pub mod cia;
