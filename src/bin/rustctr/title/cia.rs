// title/cia.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Code for the buildcia command in the rustctr CLI.

use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use rustctr::pipeline::build;
use crate::GlobalArgs;
use crate::shared::{load_context, progress_printer};

fn default_output(in_path: &Path) -> PathBuf {
    let out_path = in_path.with_extension("cia");
    if out_path != in_path {
        return out_path;
    }
    let stem = in_path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    in_path.with_file_name(format!("{}_rebuilt.cia", stem))
}

pub fn build_cia(global: &GlobalArgs, input: &str, output: &Option<String>, legit: bool) -> Result<()> {
    let in_path = Path::new(input);
    if !in_path.exists() {
        bail!("Source file \"{}\" could not be found.", in_path.display());
    }
    let out_path = match output {
        Some(output) => PathBuf::from(output).with_extension("cia"),
        None => default_output(in_path),
    };
    let mut ctx = load_context(global)?;
    let mut callback = progress_printer(in_path.display().to_string());
    let stub = build::build_cia(&mut ctx, in_path, &out_path, legit, &mut callback)
        .with_context(|| format!("Failed to build a CIA from \"{}\".", in_path.display()))?;
    println!("Successfully built {}CIA \"{}\" for title {:016X}!", if legit { "legit " } else { "" }, out_path.display(), stub.tmd.title_id);
    Ok(())
}
