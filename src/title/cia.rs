// title/cia.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements the structures and methods required for CIA parsing and building.

use std::io::{Cursor, Read, Write};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use crate::title::cert::{CertificateChain, CertificateError};
use crate::title::ticket::{ticket_size, Ticket, TicketError, TICKET_MAX_SIZE, TICKET_MIN_SIZE};
use crate::title::tmd::{tmd_size, Tmd, TmdError, TMD_MAX_CONTENTS, TMD_SIZE_MIN};

pub const CIA_HEADER_SIZE: u32 = 0x2020;
pub const CIA_CERT_SIZE: u32 = 0xA00;
pub const CIA_META_SIZE: u32 = 0x3AC0;
pub const CIA_ALIGNMENT: u64 = 0x40;
pub const CIA_MAX_CONTENT_INDEX: usize = 0x10000;
const CIA_CONTENT_INDEX_SIZE: usize = 0x2000;
const CIA_DEPENDENCIES: usize = 0x30;
pub const SMDH_SIZE: usize = 0x36C0;

#[derive(Debug, Error)]
pub enum CiaError {
    #[error("CIA header field `{0}` has an invalid value")]
    InvalidHeader(&'static str),
    #[error("CIA meta must be {size:#X} bytes (was {0:#X})", size = CIA_META_SIZE)]
    InvalidMetaSize(usize),
    #[error("CIA SMDH must be {size:#X} bytes (was {0:#X})", size = SMDH_SIZE)]
    InvalidSmdhSize(usize),
    #[error("CIA data is too short to contain its {0}")]
    Truncated(&'static str),
    #[error("CIA ticket is not valid")]
    Ticket(#[from] TicketError),
    #[error("CIA TMD is not valid")]
    Tmd(#[from] TmdError),
    #[error("CIA certificate chain is not valid")]
    Certificate(#[from] CertificateError),
    #[error("CIA data is not in a valid format")]
    IO(#[from] std::io::Error),
}

/// Rounds a size up to the alignment used between CIA regions.
pub fn cia_align(size: u64) -> u64 {
    size.div_ceil(CIA_ALIGNMENT) * CIA_ALIGNMENT
}

/// A structure that represents the header of a CIA file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiaHeader {
    pub header_size: u32,
    pub cia_type: u16,
    pub version: u16,
    pub cert_size: u32,
    pub ticket_size: u32,
    pub tmd_size: u32,
    pub meta_size: u32,
    pub content_size: u64,
    pub content_index: [u8; CIA_CONTENT_INDEX_SIZE],
}

impl CiaHeader {
    /// Creates a header for an empty CIA, with no contents or meta.
    pub fn new(ticket_size: u32, tmd_size: u32) -> Self {
        CiaHeader {
            header_size: CIA_HEADER_SIZE,
            cia_type: 0,
            version: 0,
            cert_size: CIA_CERT_SIZE,
            ticket_size,
            tmd_size,
            meta_size: 0,
            content_size: 0,
            content_index: [0; CIA_CONTENT_INDEX_SIZE],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CiaError> {
        let mut buf = Cursor::new(data);
        let header_size = buf.read_u32::<LittleEndian>()?;
        let cia_type = buf.read_u16::<LittleEndian>()?;
        let version = buf.read_u16::<LittleEndian>()?;
        let cert_size = buf.read_u32::<LittleEndian>()?;
        let ticket_size = buf.read_u32::<LittleEndian>()?;
        let tmd_size = buf.read_u32::<LittleEndian>()?;
        let meta_size = buf.read_u32::<LittleEndian>()?;
        let content_size = buf.read_u64::<LittleEndian>()?;
        let mut content_index = [0u8; CIA_CONTENT_INDEX_SIZE];
        buf.read_exact(&mut content_index)?;
        Ok(CiaHeader {
            header_size,
            cia_type,
            version,
            cert_size,
            ticket_size,
            tmd_size,
            meta_size,
            content_size,
            content_index,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut buf = Vec::with_capacity(CIA_HEADER_SIZE as usize);
        buf.write_u32::<LittleEndian>(self.header_size)?;
        buf.write_u16::<LittleEndian>(self.cia_type)?;
        buf.write_u16::<LittleEndian>(self.version)?;
        buf.write_u32::<LittleEndian>(self.cert_size)?;
        buf.write_u32::<LittleEndian>(self.ticket_size)?;
        buf.write_u32::<LittleEndian>(self.tmd_size)?;
        buf.write_u32::<LittleEndian>(self.meta_size)?;
        buf.write_u64::<LittleEndian>(self.content_size)?;
        buf.write_all(&self.content_index)?;
        Ok(buf)
    }

    /// Checks that all declared region sizes are ones a CIA can have. Content and TMD sizes are
    /// only checked against their bounds here; whether they match the TMD is up to the caller.
    pub fn validate(&self) -> Result<(), CiaError> {
        if self.header_size != CIA_HEADER_SIZE {
            return Err(CiaError::InvalidHeader("header_size"));
        }
        if self.cert_size != CIA_CERT_SIZE {
            return Err(CiaError::InvalidHeader("cert_size"));
        }
        if !(TICKET_MIN_SIZE..=TICKET_MAX_SIZE).contains(&(self.ticket_size as usize)) {
            return Err(CiaError::InvalidHeader("ticket_size"));
        }
        if !(TMD_SIZE_MIN..=tmd_size(TMD_MAX_CONTENTS)).contains(&(self.tmd_size as usize)) {
            return Err(CiaError::InvalidHeader("tmd_size"));
        }
        if self.meta_size != 0 && self.meta_size != CIA_META_SIZE {
            return Err(CiaError::InvalidHeader("meta_size"));
        }
        if self.content_size == 0 {
            return Err(CiaError::InvalidHeader("content_size"));
        }
        Ok(())
    }

    /// Gets whether the content with the given index is marked as present.
    pub fn has_content(&self, index: u16) -> bool {
        let index = index as usize;
        self.content_index[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Marks the content with the given index as present.
    pub fn set_content(&mut self, index: u16) {
        let index = index as usize;
        self.content_index[index / 8] |= 0x80 >> (index % 8);
    }

    pub fn clear_content(&mut self, index: u16) {
        let index = index as usize;
        self.content_index[index / 8] &= !(0x80 >> (index % 8));
    }

    /// Gets the layout of the CIA described by this header.
    pub fn info(&self) -> CiaInfo {
        CiaInfo::from_header(self)
    }
}

/// The layout of every region of a CIA, as derived from the sizes in its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CiaInfo {
    pub offset_cert: u64,
    pub offset_ticket: u64,
    pub offset_tmd: u64,
    pub offset_content: u64,
    pub offset_meta: u64,
    pub offset_content_list: u64,
    pub size_cert: u64,
    pub size_ticket: u64,
    pub size_tmd: u64,
    pub size_content: u64,
    pub size_meta: u64,
    pub size_content_list: u64,
    pub size_cia: u64,
    pub max_contents: u64,
}

impl CiaInfo {
    pub fn from_header(header: &CiaHeader) -> Self {
        let size_cert = header.cert_size as u64;
        let size_ticket = header.ticket_size as u64;
        let size_tmd = header.tmd_size as u64;
        let size_content = header.content_size;
        let size_meta = header.meta_size as u64;
        let offset_cert = cia_align(header.header_size as u64);
        let offset_ticket = offset_cert + cia_align(size_cert);
        let offset_tmd = offset_ticket + cia_align(size_ticket);
        let offset_content = offset_tmd + cia_align(size_tmd);
        let offset_meta = if size_meta != 0 { offset_content + cia_align(size_content) } else { 0 };
        let size_content_list = size_tmd.saturating_sub(TMD_SIZE_MIN as u64);
        let size_cia = if size_meta != 0 { offset_meta + size_meta } else { offset_content + size_content };
        CiaInfo {
            offset_cert,
            offset_ticket,
            offset_tmd,
            offset_content,
            offset_meta,
            offset_content_list: offset_tmd + TMD_SIZE_MIN as u64,
            size_cert,
            size_ticket,
            size_tmd,
            size_content,
            size_meta,
            size_content_list,
            size_cia,
            max_contents: size_content_list / 0x30,
        }
    }
}

/// The optional meta block at the end of a CIA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiaMeta {
    pub dependencies: [u64; CIA_DEPENDENCIES],
    reserved1: [u8; 0x180],
    pub core_version: u32,
    reserved2: [u8; 0xFC],
    pub smdh: Vec<u8>,
}

impl CiaMeta {
    /// Builds a meta block from the dependency list and core version of an NCCH ExtHeader, and
    /// the SMDH stored in its ExeFS icon. Either can be left out.
    pub fn new(exthdr: Option<&[u8]>, smdh: Option<&[u8]>) -> Result<Self, CiaError> {
        let mut dependencies = [0u64; CIA_DEPENDENCIES];
        let mut core_version = 0;
        if let Some(exthdr) = exthdr {
            let mut buf = Cursor::new(exthdr);
            buf.set_position(0x40);
            for dependency in dependencies.iter_mut() {
                *dependency = buf.read_u64::<LittleEndian>()?;
            }
            buf.set_position(0x208);
            core_version = buf.read_u32::<LittleEndian>()?;
        }
        let smdh = match smdh {
            Some(smdh) if smdh.len() != SMDH_SIZE => return Err(CiaError::InvalidSmdhSize(smdh.len())),
            Some(smdh) => smdh.to_vec(),
            None => vec![0; SMDH_SIZE],
        };
        Ok(CiaMeta {
            dependencies,
            reserved1: [0; 0x180],
            core_version,
            reserved2: [0; 0xFC],
            smdh,
        })
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CiaError> {
        if data.len() != CIA_META_SIZE as usize {
            return Err(CiaError::InvalidMetaSize(data.len()));
        }
        let mut buf = Cursor::new(data);
        let mut dependencies = [0u64; CIA_DEPENDENCIES];
        for dependency in dependencies.iter_mut() {
            *dependency = buf.read_u64::<LittleEndian>()?;
        }
        let mut reserved1 = [0u8; 0x180];
        buf.read_exact(&mut reserved1)?;
        let core_version = buf.read_u32::<LittleEndian>()?;
        let mut reserved2 = [0u8; 0xFC];
        buf.read_exact(&mut reserved2)?;
        let mut smdh = vec![0u8; SMDH_SIZE];
        buf.read_exact(&mut smdh)?;
        Ok(CiaMeta { dependencies, reserved1, core_version, reserved2, smdh })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut buf = Vec::with_capacity(CIA_META_SIZE as usize);
        for dependency in &self.dependencies {
            buf.write_u64::<LittleEndian>(*dependency)?;
        }
        buf.write_all(&self.reserved1)?;
        buf.write_u32::<LittleEndian>(self.core_version)?;
        buf.write_all(&self.reserved2)?;
        buf.write_all(&self.smdh)?;
        Ok(buf)
    }
}

/// Everything in a CIA that comes before its contents: the header, the certificate chain, the
/// ticket and the TMD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiaStub {
    pub header: CiaHeader,
    pub cert: Vec<u8>,
    pub ticket: Ticket,
    pub tmd: Tmd,
}

impl CiaStub {
    /// Builds a stub around a ticket and TMD. Without a certificate chain the certificate area is
    /// left zeroed, which means the result can't pass signature checks.
    pub fn new(ticket: Ticket, tmd: Tmd, cert: Option<&CertificateChain>) -> Result<Self, CiaError> {
        let mut cert_data = match cert {
            Some(chain) => chain.to_bytes()?,
            None => Vec::new(),
        };
        if cert_data.len() > CIA_CERT_SIZE as usize {
            return Err(CiaError::InvalidHeader("cert_size"));
        }
        cert_data.resize(CIA_CERT_SIZE as usize, 0);
        let header = CiaHeader::new(ticket.size() as u32, tmd.size() as u32);
        let mut stub = CiaStub { header, cert: cert_data, ticket, tmd };
        stub.update_header();
        Ok(stub)
    }

    /// Parses a stub from the start of a CIA. `data` has to hold at least everything up to the
    /// first content.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CiaError> {
        let header = CiaHeader::from_bytes(data)?;
        header.validate()?;
        let info = header.info();
        if (data.len() as u64) < info.offset_content {
            return Err(CiaError::Truncated("TMD"));
        }
        let cert = data[info.offset_cert as usize..(info.offset_cert + info.size_cert) as usize].to_vec();
        let ticket_data = &data[info.offset_ticket as usize..(info.offset_ticket + info.size_ticket) as usize];
        if ticket_size(ticket_data)? != ticket_data.len() {
            return Err(CiaError::InvalidHeader("ticket_size"));
        }
        let ticket = Ticket::from_bytes(ticket_data)?;
        let tmd = Tmd::from_bytes(&data[info.offset_tmd as usize..(info.offset_tmd + info.size_tmd) as usize])?;
        if tmd.size() as u64 != info.size_tmd {
            return Err(CiaError::InvalidHeader("tmd_size"));
        }
        Ok(CiaStub { header, cert, ticket, tmd })
    }

    /// Dumps the stub into binary data, padded up to where the first content begins.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CiaError> {
        let info = self.header.info();
        let mut buf = vec![0u8; info.offset_content as usize];
        let header = self.header.to_bytes()?;
        buf[..header.len()].copy_from_slice(&header);
        buf[info.offset_cert as usize..(info.offset_cert + info.size_cert) as usize].copy_from_slice(&self.cert);
        let ticket = self.ticket.to_bytes()?;
        if ticket.len() as u64 != info.size_ticket {
            return Err(CiaError::InvalidHeader("ticket_size"));
        }
        buf[info.offset_ticket as usize..(info.offset_ticket + info.size_ticket) as usize].copy_from_slice(&ticket);
        let tmd = self.tmd.to_bytes()?;
        if tmd.len() as u64 != info.size_tmd {
            return Err(CiaError::InvalidHeader("tmd_size"));
        }
        buf[info.offset_tmd as usize..(info.offset_tmd + info.size_tmd) as usize].copy_from_slice(&tmd);
        Ok(buf)
    }

    /// Brings the region sizes and content index of the header in line with the ticket and TMD.
    pub fn update_header(&mut self) {
        self.header.ticket_size = self.ticket.size() as u32;
        self.header.tmd_size = self.tmd.size() as u32;
        self.header.content_size = self.tmd.content_chunks.iter().map(|chunk| chunk.size).sum();
        self.header.content_index = [0; CIA_CONTENT_INDEX_SIZE];
        for chunk in &self.tmd.content_chunks {
            self.header.set_content(chunk.index);
        }
    }

    /// Parses the certificate chain stored in the stub.
    pub fn cert_chain(&self) -> Result<CertificateChain, CiaError> {
        Ok(CertificateChain::from_bytes(&self.cert)?)
    }

    /// Gets the offset of every content inside the CIA, in TMD order. Contents that the header
    /// does not mark as present take up no space and have no offset.
    pub fn content_offsets(&self) -> Vec<Option<u64>> {
        let mut offset = self.header.info().offset_content;
        self.tmd.content_chunks.iter().map(|chunk| {
            if !self.header.has_content(chunk.index) {
                return None;
            }
            let start = offset;
            offset += chunk.size;
            Some(start)
        }).collect()
    }
}
