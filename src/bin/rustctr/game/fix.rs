// game/fix.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Code for the fix command in the rustctr CLI.

use std::path::Path;
use anyhow::{bail, Context, Result};
use rustctr::pipeline::fix::fix_file;
use crate::GlobalArgs;
use crate::shared::{confirm, load_context};

pub fn fix(global: &GlobalArgs, input: &str, yes: bool) -> Result<()> {
    let in_path = Path::new(input);
    if !in_path.exists() {
        bail!("Source file \"{}\" could not be found.", in_path.display());
    }
    let mut ctx = load_context(global)?;
    let mut ask = |name: &str| yes || confirm(&format!("The {} hash of \"{}\" does not match. Fix it?", name, in_path.display()));
    let fixed = fix_file(&mut ctx, in_path, &mut ask)
        .with_context(|| format!("Failed to fix \"{}\".", in_path.display()))?;
    if fixed {
        println!("Successfully fixed \"{}\"!", in_path.display());
    } else {
        println!("Nothing was changed in \"{}\".", in_path.display());
    }
    Ok(())
}
