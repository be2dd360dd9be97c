// crypto/keydb.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Code for aeskeydb.bin-related commands in the rustctr CLI.

use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use clap::Subcommand;
use rustctr::crypto::keydb::{crypt_key_database, KeyType, KEYDB_KEYSLOT};
use crate::GlobalArgs;
use crate::shared::load_context;

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
pub enum Commands {
    /// Decrypt an aeskeydb.bin
    Decrypt {
        /// The path to the aeskeydb.bin to decrypt
        input: String,
        /// An optional output path; defaults to aeskeydb_dec.bin
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Encrypt an aeskeydb.bin
    Encrypt {
        /// The path to the aeskeydb.bin to encrypt
        input: String,
        /// An optional output path; defaults to aeskeydb_enc.bin
        #[arg(short, long)]
        output: Option<String>,
    }
}

pub fn crypt_keydb(global: &GlobalArgs, input: &str, output: &Option<String>, encrypt: bool) -> Result<()> {
    let in_path = Path::new(input);
    if !in_path.exists() {
        bail!("Source file \"{}\" could not be found.", in_path.display());
    }
    let out_path = match output {
        Some(output) => PathBuf::from(output),
        None if encrypt => PathBuf::from("aeskeydb_enc.bin"),
        None => PathBuf::from("aeskeydb_dec.bin"),
    };
    let mut ctx = load_context(global)?;
    ctx.keydb.load_key(&mut ctx.aes, KEYDB_KEYSLOT, KeyType::X, None)
        .with_context(|| "The keyslot 0x2C KeyX is needed to process key databases, but it could not be found.")?;
    let data = crypt_key_database(&mut ctx.aes, &fs::read(in_path)?, encrypt)
        .with_context(|| "The provided aeskeydb.bin could not be parsed, and is likely invalid.")?;
    fs::write(&out_path, data)?;
    println!("Successfully {} key database \"{}\"!", if encrypt { "encrypted" } else { "decrypted" }, out_path.display());
    Ok(())
}
