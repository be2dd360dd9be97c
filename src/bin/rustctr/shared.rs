// shared.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Code shared between the rustctr CLI's commands.

use std::io::Write;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use walkdir::WalkDir;
use rustctr::crypto::{ContextConfig, CryptoContext};
use rustctr::filetype::identify_file;
use crate::GlobalArgs;

/// Creates the crypto context described by the global arguments.
pub fn load_context(global: &GlobalArgs) -> Result<CryptoContext> {
    let support_dirs = if global.support.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        global.support.clone()
    };
    for dir in support_dirs.iter().chain(global.nand.iter()) {
        if !dir.is_dir() {
            bail!("Directory \"{}\" could not be found.", dir.display());
        }
    }
    let config = ContextConfig {
        support_dirs,
        nand_roots: global.nand.clone(),
        keydb_path: global.keydb.clone(),
    };
    CryptoContext::from_config(&config).with_context(|| "The key database could not be loaded.")
}

/// Expands the input arguments into a list of files. Directories are searched recursively, and
/// only files of a known type are taken from them.
pub fn collect_inputs(inputs: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        let path = Path::new(input);
        if path.is_file() {
            files.push(path.to_path_buf());
        } else if path.is_dir() {
            for entry in WalkDir::new(path).sort_by_file_name().into_iter().filter_map(Result::ok) {
                if entry.file_type().is_file() && identify_file(entry.path())?.is_some() {
                    files.push(entry.into_path());
                }
            }
        } else {
            bail!("Input \"{}\" could not be found.", path.display());
        }
    }
    Ok(files)
}

/// Makes a progress callback that prints the percentage done whenever it changes.
pub fn progress_printer(label: String) -> impl FnMut(u64, u64) -> bool {
    let mut last = None;
    move |done, total| {
        let percent = if total == 0 { 100 } else { done * 100 / total };
        if last != Some(percent) {
            last = Some(percent);
            print!("\r{}: {}%", label, percent);
            if done >= total {
                println!();
            }
            let _ = std::io::stdout().flush();
        }
        true
    }
}

/// Asks a yes/no question on the terminal.
pub fn confirm(question: &str) -> bool {
    print!("{} [y/N] ", question);
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}
