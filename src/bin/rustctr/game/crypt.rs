// game/crypt.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Code for the decrypt and encrypt commands in the rustctr CLI.

use std::path::Path;
use anyhow::{bail, Context, Result};
use rustctr::pipeline::crypt;
use crate::GlobalArgs;
use crate::shared::{collect_inputs, load_context, progress_printer};

pub fn crypt(global: &GlobalArgs, input: &[String], output: &Option<String>, encrypt: bool) -> Result<()> {
    let files = collect_inputs(input)?;
    if files.is_empty() {
        bail!("No supported files were found.");
    }
    if output.is_some() && files.len() != 1 {
        bail!("An output name can only be used with a single input file.");
    }
    let action = if encrypt { "encrypt" } else { "decrypt" };
    let mut ctx = load_context(global)?;
    let mut failed = 0;
    for file in &files {
        let out_path = output.as_deref().map(Path::new);
        let mut callback = progress_printer(file.display().to_string());
        let result = crypt::crypt_file(&mut ctx, file, out_path, encrypt, &mut callback)
            .with_context(|| format!("Failed to {} \"{}\".", action, file.display()));
        match result {
            Ok(true) => println!("Successfully {}ed \"{}\"!", action, out_path.unwrap_or(file.as_path()).display()),
            Ok(false) => println!("\"{}\" is already {}ed.", file.display(), action),
            Err(e) => {
                eprintln!("{:#}", e);
                failed += 1;
            },
        }
    }
    if failed != 0 {
        bail!("{} of {} files could not be {}ed.", failed, files.len(), action);
    }
    Ok(())
}
