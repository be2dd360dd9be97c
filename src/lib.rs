// lib.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Root level module that imports the feature modules.

pub mod agbsave;
pub mod boss;
pub mod crypto;
pub mod filetype;
pub mod firm;
pub mod nand;
pub mod ncch;
pub mod pipeline;
pub mod title;
