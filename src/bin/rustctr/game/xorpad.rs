// game/xorpad.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Code for the xorpads command in the rustctr CLI.

use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use rustctr::ncch::ncchinfo::NcchInfo;
use rustctr::pipeline::xorpad;
use crate::GlobalArgs;
use crate::shared::{load_context, progress_printer};

pub fn generate_xorpads(global: &GlobalArgs, input: &str, output: &Option<String>) -> Result<()> {
    let in_path = Path::new(input);
    if !in_path.exists() {
        bail!("Source ncchinfo.bin \"{}\" could not be found.", in_path.display());
    }
    let out_path = output.as_ref().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&out_path)
        .with_context(|| format!("Output directory \"{}\" could not be created.", out_path.display()))?;
    let ncchinfo = NcchInfo::from_bytes(&fs::read(in_path)?)
        .with_context(|| format!("The provided ncchinfo.bin \"{}\" appears to be invalid.", in_path.display()))?;
    let mut ctx = load_context(global)?;
    let mut callback = progress_printer(String::from("xorpads"));
    let written = xorpad::generate_xorpads(&mut ctx, &ncchinfo, &out_path, &mut callback)
        .with_context(|| "Failed to generate xorpads.")?;
    println!("Successfully generated {} xorpad(s) in \"{}\"!", written.len(), out_path.display());
    Ok(())
}
