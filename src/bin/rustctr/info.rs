// info.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Code for the info command in the rustctr CLI.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use anyhow::{bail, Context, Result};
use rustctr::agbsave::AgbSaveHeader;
use rustctr::boss::BossHeader;
use rustctr::crypto::keydb::parse_key_database;
use rustctr::crypto::seed::SeedInfo;
use rustctr::filetype::{identify_file, parse_legacy_key_name, CtrFileType};
use rustctr::firm::FirmHeader;
use rustctr::ncch::{NcchHeader, NCCH_EXTHDR_OFFSET, NCCH_HEADER_SIZE};
use rustctr::ncch::exefs::{ExeFsHeader, EXEFS_HEADER_SIZE};
use rustctr::ncch::exheader::ExtHeaderInfo;
use rustctr::ncch::ncchinfo::NcchInfo;
use rustctr::ncch::ncsd::{NcsdHeader, NCSD_HEADER_SIZE};
use rustctr::title::cert::CertificateChain;
use rustctr::title::cia::{CiaHeader, CiaStub, CIA_HEADER_SIZE};
use rustctr::title::ticket::Ticket;
use rustctr::title::tmd::Tmd;

fn read_region(path: &Path, offset: u64, size: usize) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut data = vec![0u8; size];
    file.read_exact(&mut data).with_context(|| format!("\"{}\" ends before its headers do.", path.display()))?;
    Ok(data)
}

fn signature_status(result: Option<bool>) -> &'static str {
    match result {
        Some(true) => "Valid",
        Some(false) => "Invalid",
        None => "Unknown (no certificate chain)",
    }
}

fn print_ncch_info(path: &Path, offset: u64, indent: &str) -> Result<()> {
    let header = NcchHeader::from_bytes(&read_region(path, offset, NCCH_HEADER_SIZE)?)
        .with_context(|| "The NCCH header could not be parsed, and is likely invalid.")?;
    let crypto = header.crypto();
    println!("{}Product Code: {}", indent, header.product_code());
    println!("{}Program ID: {:016X}", indent, header.program_id);
    println!("{}Partition ID: {:016X}", indent, header.partition_id);
    println!("{}NCCH Version: {}", indent, header.version);
    println!("{}Size: {} bytes", indent, header.ncch_size());
    println!("{}Crypto: {}", indent, crypto.describe());
    if header.size_exthdr != 0 && crypto.is_no_crypto() {
        let exthdr = ExtHeaderInfo::from_bytes(&read_region(path, offset + NCCH_EXTHDR_OFFSET, 0x400)?)?;
        println!("{}Application Title: {}", indent, exthdr.name);
        println!("{}Save Data Size: {} bytes", indent, exthdr.save_size);
        println!("{}SD Application: {}", indent, exthdr.is_sd_application());
    }
    if header.size_exefs != 0 {
        println!("{}ExeFS: {} bytes at 0x{:X}", indent, header.exefs_size(), header.exefs_offset());
        if crypto.is_no_crypto() {
            let exefs = ExeFsHeader::from_bytes(&read_region(path, offset + header.exefs_offset(), EXEFS_HEADER_SIZE)?)?;
            for file in exefs.files.iter().filter(|file| file.size != 0) {
                println!("{}  {}: {} bytes", indent, file.name(), file.size);
            }
        }
    }
    if header.size_romfs != 0 {
        println!("{}RomFS: {} bytes at 0x{:X}", indent, header.romfs_size(), header.romfs_offset());
    }
    Ok(())
}

fn print_ncsd_info(path: &Path) -> Result<()> {
    let header = NcsdHeader::from_bytes(&read_region(path, 0, NCSD_HEADER_SIZE)?)
        .with_context(|| "The NCSD header could not be parsed, and is likely invalid.")?;
    println!("NCSD Info");
    println!("  Media ID: {:016X}", header.media_id);
    println!("  Image Size: {} bytes", header.size as u64 * 0x200);
    println!("  Trimmed Size: {} bytes", header.trimmed_size());
    for (index, offset, size) in header.present_partitions() {
        println!("  Partition {}: {} bytes at 0x{:X}", index, size, offset);
        print_ncch_info(path, offset, "    ")?;
    }
    Ok(())
}

fn print_ticket_info(ticket: &Ticket, chain: Option<&CertificateChain>) {
    println!("Ticket Info");
    println!("  Title ID: {:016X}", ticket.title_id);
    println!("  Ticket ID: {:016X}", ticket.ticket_id);
    println!("  Ticket Version: {}", ticket.ticket_version);
    println!("  Issuer: {} ({})", ticket.signature_issuer(), if ticket.is_dev() { "Development" } else { "Retail" });
    println!("  Common Key Index: {}", ticket.common_key_index);
    println!("  Title Key (Encrypted): {}", hex::encode(ticket.title_key));
    println!("  Console ID: {:08X}", ticket.console_id);
    let valid = chain.map(|chain| ticket.verify_signature(chain).unwrap_or(false));
    println!("  Signature: {}", signature_status(valid));
}

fn print_tmd_info(tmd: &Tmd, chain: Option<&CertificateChain>) {
    println!("TMD Info");
    println!("  Title ID: {:016X}", tmd.title_id);
    println!("  Title Version: {}", tmd.title_version);
    println!("  Issuer: {} ({})", tmd.signature_issuer(), if tmd.is_dev() { "Development" } else { "Retail" });
    println!("  Save Data Size: {} bytes", tmd.save_size);
    let valid = chain.map(|chain| tmd.verify_signature(chain).unwrap_or(false));
    println!("  Signature: {}", signature_status(valid));
    println!("  Hash Tree: {}", if tmd.verify_hashes().is_ok() { "Valid" } else { "Invalid" });
    println!("  Total Contents: {}", tmd.content_count());
    for chunk in &tmd.content_chunks {
        println!("    Content Index: {}", chunk.index);
        println!("      Content ID: {:08X}", chunk.content_id);
        println!("      Content Type: 0x{:04X}{}{}", chunk.content_type,
            if chunk.is_encrypted() { " (encrypted)" } else { "" },
            if chunk.is_optional() { " (optional)" } else { "" });
        println!("      Content Size: {} bytes", chunk.size);
        println!("      Content Hash: {}", hex::encode(chunk.hash));
    }
}

fn print_cia_info(path: &Path) -> Result<()> {
    let header = CiaHeader::from_bytes(&read_region(path, 0, CIA_HEADER_SIZE as usize)?)
        .with_context(|| "The CIA header could not be parsed, and is likely invalid.")?;
    let info = header.info();
    let stub = CiaStub::from_bytes(&read_region(path, 0, info.offset_content as usize)?)
        .with_context(|| "The CIA could not be parsed, and is likely invalid.")?;
    println!("CIA Info");
    println!("  Size: {} bytes", info.size_cia);
    println!("  Content Size: {} bytes", info.size_content);
    println!("  Has Meta: {}", info.size_meta != 0);
    let chain = stub.cert_chain().ok();
    match &chain {
        Some(chain) => {
            let names: Vec<String> = chain.certs().iter().map(|cert| cert.full_name()).collect();
            println!("  Certificates: {}", names.join(", "));
        },
        None => println!("  Certificates: None"),
    }
    println!();
    print_ticket_info(&stub.ticket, chain.as_ref());
    println!();
    print_tmd_info(&stub.tmd, chain.as_ref());
    Ok(())
}

fn print_firm_info(header: &FirmHeader) {
    println!("FIRM Info");
    println!("  Priority: {}", header.priority);
    println!("  ARM11 Entry: 0x{:08X}", header.entry_arm11);
    println!("  ARM9 Entry: 0x{:08X}", header.entry_arm9);
    println!("  Size: {} bytes", header.firm_size());
    for (index, section) in header.sections.iter().enumerate().filter(|(_, section)| section.size != 0) {
        println!("  Section {}: {} bytes at 0x{:X}, loaded to 0x{:08X}", index, section.size, section.offset, section.address);
    }
    if let Some(index) = header.arm9_section() {
        println!("  ARM9 Section: {}", index);
    }
}

pub fn info(input: &str) -> Result<()> {
    let in_path = Path::new(input);
    if !in_path.exists() {
        bail!("Input file \"{}\" does not exist.", in_path.display());
    }
    let file_type = match identify_file(in_path)? {
        Some(file_type) => file_type,
        None => bail!("Information cannot be displayed for this file type."),
    };
    match file_type {
        CtrFileType::Ncch => {
            println!("NCCH Info");
            print_ncch_info(in_path, 0, "  ")?;
        },
        CtrFileType::Ncsd => print_ncsd_info(in_path)?,
        CtrFileType::Cia => print_cia_info(in_path)?,
        CtrFileType::Tmd => {
            let tmd = Tmd::from_bytes(&fs::read(in_path)?).with_context(|| "The provided TMD file could not be parsed, and is likely invalid.")?;
            print_tmd_info(&tmd, None);
        },
        CtrFileType::Ticket => {
            let ticket = Ticket::from_bytes(&fs::read(in_path)?).with_context(|| "The provided Ticket file could not be parsed, and is likely invalid.")?;
            print_ticket_info(&ticket, None);
        },
        CtrFileType::Boss => {
            let header = BossHeader::from_bytes(&fs::read(in_path)?).with_context(|| "The provided BOSS file could not be parsed, and is likely invalid.")?;
            println!("BOSS Info");
            println!("  File Size: {} bytes", header.file_size);
            println!("  Release Date: {}", header.release_date);
            println!("  Counter: {}", hex::encode(header.ctr()));
        },
        CtrFileType::Firm => {
            let header = FirmHeader::from_bytes(&fs::read(in_path)?).with_context(|| "The provided FIRM could not be parsed, and is likely invalid.")?;
            print_firm_info(&header);
        },
        CtrFileType::AgbSave => {
            let header = AgbSaveHeader::from_bytes(&fs::read(in_path)?).with_context(|| "The provided AGBSAVE could not be parsed, and is likely invalid.")?;
            println!("AGBSAVE Info");
            println!("  Title ID: {:016X}", header.title_id);
            println!("  Times Saved: {}", header.times_saved);
            println!("  Save Size: {} bytes", header.save_size);
            println!("  CMAC: {}", hex::encode(header.cmac));
        },
        CtrFileType::KeyDb => {
            let records = parse_key_database(&fs::read(in_path)?)?;
            println!("Key Database Info");
            println!("  Key Count: {}", records.len());
            for info in &records {
                println!("    Slot 0x{:02X} Key{} {}{}", info.slot, info.key_type.as_char(), info.id_str(),
                    if info.is_encrypted { " (encrypted)" } else { "" });
            }
        },
        CtrFileType::LegacyKey => {
            let name = in_path.file_name().and_then(|name| name.to_str()).and_then(parse_legacy_key_name);
            println!("Key File Info");
            if let Some(name) = name {
                println!("  Slot: 0x{:02X}", name.slot);
                println!("  Key Type: {}", name.key_type.as_char());
                println!("  ID: {}", name.id.unwrap_or_default());
            }
        },
        CtrFileType::SeedDb => {
            let seeddb = SeedInfo::from_bytes(&fs::read(in_path)?)?;
            println!("Seed Database Info");
            println!("  Seed Count: {}", seeddb.entries.len());
        },
        CtrFileType::NcchInfo => {
            let ncchinfo = NcchInfo::from_bytes(&fs::read(in_path)?)?;
            println!("ncchinfo.bin Info");
            println!("  Version: {}", ncchinfo.version);
            for entry in &ncchinfo.entries {
                println!("    {:016X} {}: {} bytes ({})", entry.title_id, entry.filename, entry.size(), entry.crypto().describe());
            }
        },
    }
    Ok(())
}
