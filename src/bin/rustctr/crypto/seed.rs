// crypto/seed.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Code for seeddb.bin-related commands in the rustctr CLI.

use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use clap::Subcommand;
use rustctr::crypto::seed::{self, SeedInfo, SEEDDB_NAME};

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
pub enum Commands {
    /// Add a seed to a seeddb.bin, creating it if it doesn't exist
    Install {
        /// The Title ID the seed belongs to
        tid: String,
        /// The seed, as 32 hex characters
        seed: String,
        /// An optional seeddb.bin path; defaults to seeddb.bin
        #[arg(short, long)]
        seeddb: Option<String>,
        /// The title's seed check value from its NCCH header, used to validate the seed
        #[arg(long)]
        hash: Option<String>,
    },
    /// List the seeds in a seeddb.bin
    List {
        /// An optional seeddb.bin path; defaults to seeddb.bin
        seeddb: Option<String>,
    }
}

fn seeddb_path(seeddb: &Option<String>) -> PathBuf {
    seeddb.as_ref().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(SEEDDB_NAME))
}

fn parse_hex<const N: usize>(value: &str, what: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(value.trim()).with_context(|| format!("The provided {} is not valid hex.", what))?;
    match <[u8; N]>::try_from(bytes.as_slice()) {
        Ok(array) => Ok(array),
        Err(_) => bail!("The provided {} must be {} hex characters long.", what, N * 2),
    }
}

pub fn install_seed(tid: &str, seed: &str, seeddb: &Option<String>, hash: &Option<String>) -> Result<()> {
    let title_id = u64::from_be_bytes(parse_hex::<8>(tid, "Title ID")?);
    let seed_bytes = parse_hex::<16>(seed, "seed")?;
    let hash_seed = match hash {
        Some(hash) => Some(parse_hex::<4>(hash, "seed check value")?),
        None => None,
    };
    let path = seeddb_path(seeddb);
    let changed = seed::install_seed(&path, title_id, seed_bytes, hash_seed.as_ref())
        .with_context(|| format!("Failed to add the seed for {:016X} to \"{}\".", title_id, path.display()))?;
    if changed {
        println!("Successfully installed the seed for {:016X} to \"{}\"!", title_id, path.display());
    } else {
        println!("\"{}\" already has this seed for {:016X}.", path.display(), title_id);
    }
    Ok(())
}

pub fn list_seeds(seeddb: &Option<String>) -> Result<()> {
    let path = seeddb_path(seeddb);
    if !Path::new(&path).exists() {
        bail!("Seed database \"{}\" could not be found.", path.display());
    }
    let seeddb = SeedInfo::from_bytes(&fs::read(&path)?)
        .with_context(|| format!("The provided seed database \"{}\" appears to be invalid.", path.display()))?;
    println!("Seed Database Info");
    println!("  Seed Count: {}", seeddb.entries.len());
    for entry in &seeddb.entries {
        println!("    {:016X}: {}", entry.title_id, hex::encode(entry.seed).to_uppercase());
    }
    Ok(())
}
