// game/verify.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Code for the verify command in the rustctr CLI.

use anyhow::{bail, Result};
use rustctr::pipeline::verify::verify_file;
use crate::GlobalArgs;
use crate::shared::{collect_inputs, load_context, progress_printer};

pub fn verify(global: &GlobalArgs, input: &[String]) -> Result<()> {
    let files = collect_inputs(input)?;
    if files.is_empty() {
        bail!("No supported files were found.");
    }
    let mut ctx = load_context(global)?;
    let mut failed = Vec::new();
    for file in &files {
        let mut callback = progress_printer(file.display().to_string());
        match verify_file(&mut ctx, file, &mut callback) {
            Ok(file_type) => println!("{} \"{}\" is valid.", file_type.name(), file.display()),
            Err(e) => {
                eprintln!("\"{}\" failed verification: {:#}", file.display(), anyhow::Error::from(e));
                failed.push(file);
            },
        }
    }
    if !failed.is_empty() {
        bail!("{} of {} files failed verification.", failed.len(), files.len());
    }
    println!("Successfully verified {} file(s)!", files.len());
    Ok(())
}
