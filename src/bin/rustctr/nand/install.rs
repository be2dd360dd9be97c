// nand/install.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Code for the install command in the rustctr CLI.

use std::path::Path;
use anyhow::{bail, Context, Result};
use rustctr::nand::install::TitleTree;
use rustctr::pipeline::install::install_file;
use crate::GlobalArgs;
use crate::shared::{load_context, progress_printer};

pub fn install(global: &GlobalArgs, input: &str, sd: &str) -> Result<()> {
    let in_path = Path::new(input);
    if !in_path.exists() {
        bail!("Source file \"{}\" could not be found.", in_path.display());
    }
    let sd_path = Path::new(sd);
    if !sd_path.is_dir() {
        bail!("Target SD directory \"{}\" could not be found.", sd_path.display());
    }
    let tree = TitleTree::open(sd_path.to_path_buf())
        .with_context(|| format!("\"{}\" is not a usable install target.", sd_path.display()))?;
    let mut ctx = load_context(global)?;
    let mut callback = progress_printer(in_path.display().to_string());
    let stub = install_file(&mut ctx, in_path, &tree, &mut callback)
        .with_context(|| format!("Failed to install \"{}\".", in_path.display()))?;
    println!("Successfully installed title {:016X} to \"{}\"!", stub.tmd.title_id, sd_path.display());
    Ok(())
}
