// main.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Base for the rustctr CLI that handles argument parsing and directs execution to the proper module.

mod crypto;
mod game;
mod info;
mod nand;
mod shared;
mod title;

use std::io::Write;
use std::path::PathBuf;
use anyhow::Result;
use clap::{Args, Subcommand, Parser};
use log::LevelFilter;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args)]
pub struct GlobalArgs {
    /// Print debug output, including the keyslots and counters used
    #[arg(short, long, global = true)]
    verbose: bool,
    /// A directory to load aeskeydb.bin, seeddb.bin and key files from; defaults to the current directory
    #[arg(long, global = true)]
    support: Vec<PathBuf>,
    /// A mounted CTRNAND to look up seeds and movable.sed in; can be given more than once
    #[arg(long, global = true)]
    nand: Vec<PathBuf>,
    /// A key database to load every key from
    #[arg(long, global = true)]
    keydb: Option<PathBuf>,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Build a CIA from an NCCH, NCSD, CDN TMD or another CIA
    Buildcia {
        /// The path to the NCCH, NCSD, TMD or CIA to build from
        input: String,
        /// An (optional) CIA name; defaults to <input name>.cia
        #[arg(short, long)]
        output: Option<String>,
        /// Keep the original ticket, TMD and content encryption (CDN content and CIAs only)
        #[arg(short, long)]
        legit: bool,
    },
    /// Decrypt NCCH, NCSD, CIA, BOSS or FIRM files and key databases
    Decrypt {
        /// The files or directories to decrypt
        #[arg(required = true)]
        input: Vec<String>,
        /// An (optional) output name, only used with a single input file; defaults to decrypting in place
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Encrypt NCCH, NCSD, CIA or BOSS files and key databases
    Encrypt {
        /// The files or directories to encrypt
        #[arg(required = true)]
        input: Vec<String>,
        /// An (optional) output name, only used with a single input file; defaults to encrypting in place
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Fix the hashes of a BOSS file or the CMAC of an AGBSAVE
    Fix {
        /// The path to the BOSS or AGBSAVE file
        input: String,
        /// Fix everything without asking first
        #[arg(short, long)]
        yes: bool,
    },
    /// Get information about any supported file
    Info {
        /// The path to the file
        input: String,
    },
    /// Install a CIA, NCCH or NCSD to an SD card
    Install {
        /// The path to the CIA, NCCH or NCSD to install
        input: String,
        /// The root of the target SD card's Nintendo 3DS/<id0>/<id1> directory
        sd: String,
    },
    /// Encrypt or decrypt an aeskeydb.bin
    Keydb {
        #[command(subcommand)]
        command: crypto::keydb::Commands,
    },
    /// Manage seeddb.bin
    Seed {
        #[command(subcommand)]
        command: crypto::seed::Commands,
    },
    /// Verify the hashes and structure of any supported file
    Verify {
        /// The files or directories to verify
        #[arg(required = true)]
        input: Vec<String>,
    },
    /// Generate the xorpads listed in an ncchinfo.bin
    Xorpads {
        /// The path to the ncchinfo.bin
        input: String,
        /// The directory to write the xorpads to; defaults to the current directory
        #[arg(short, long)]
        output: Option<String>,
    },
}

fn init_logging(verbose: bool) {
    env_logger::Builder::new()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .filter(None, if verbose { LevelFilter::Debug } else { LevelFilter::Info })
        .parse_default_env()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);

    match &cli.command {
        Some(Commands::Buildcia { input, output, legit }) => {
            title::cia::build_cia(&cli.global, input, output, *legit)?
        },
        Some(Commands::Decrypt { input, output }) => {
            game::crypt::crypt(&cli.global, input, output, false)?
        },
        Some(Commands::Encrypt { input, output }) => {
            game::crypt::crypt(&cli.global, input, output, true)?
        },
        Some(Commands::Fix { input, yes }) => {
            game::fix::fix(&cli.global, input, *yes)?
        },
        Some(Commands::Info { input }) => {
            info::info(input)?
        },
        Some(Commands::Install { input, sd }) => {
            nand::install::install(&cli.global, input, sd)?
        },
        Some(Commands::Keydb { command }) => {
            match command {
                crypto::keydb::Commands::Decrypt { input, output } => {
                    crypto::keydb::crypt_keydb(&cli.global, input, output, false)?
                },
                crypto::keydb::Commands::Encrypt { input, output } => {
                    crypto::keydb::crypt_keydb(&cli.global, input, output, true)?
                },
            }
        },
        Some(Commands::Seed { command }) => {
            match command {
                crypto::seed::Commands::Install { tid, seed, seeddb, hash } => {
                    crypto::seed::install_seed(tid, seed, seeddb, hash)?
                },
                crypto::seed::Commands::List { seeddb } => {
                    crypto::seed::list_seeds(seeddb)?
                },
            }
        },
        Some(Commands::Verify { input }) => {
            game::verify::verify(&cli.global, input)?
        },
        Some(Commands::Xorpads { input, output }) => {
            game::xorpad::generate_xorpads(&cli.global, input, output)?
        },
        None => { /* Clap handles no passed command by itself */}
    }
    Ok(())
}
