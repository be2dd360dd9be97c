// ncch/ncsd.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements the structures and methods required for parsing NCSD (game card) images, and the
// sequential decoder that converts every NCCH partition inside one.

use std::io::{Cursor, Read, Write};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use crate::crypto::CryptoContext;
use crate::ncch::{NcchCrypto, NcchError, NcchStream};

pub const NCSD_MEDIA_UNIT: u64 = 0x200;
pub const NCSD_HEADER_SIZE: usize = 0x200;
pub const NCSD_PARTITIONS: usize = 8;

#[derive(Debug, Error)]
pub enum NcsdError {
    #[error("NCSD header has bad magic (expected NCSD)")]
    BadMagic,
    #[error("image has partition filesystem types set, this looks like a NAND image")]
    NandImage,
    #[error("NCSD has no media ID")]
    MissingMediaId,
    #[error("NCSD has no first partition")]
    MissingPartition,
    #[error("NCSD partition {0} overlaps the previous partition")]
    Overlap(usize),
    #[error("NCSD partitions end at 0x{end:X} media units but the image is only 0x{size:X} units")]
    SizeExceeded { end: u64, size: u64 },
    #[error("NCSD stream was not started with a valid header")]
    StreamNotReady,
    #[error("NCCH partition {index} could not be processed")]
    Partition { index: usize, source: NcchError },
    #[error("NCSD data is not in a valid format")]
    IO(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NcsdPartition {
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NcsdHeader {
    pub signature: [u8; 0x100],
    pub magic: [u8; 4],
    pub size: u32,
    pub media_id: u64,
    pub partitions_fs_type: [u8; 8],
    pub partitions_crypto_type: [u8; 8],
    pub partitions: [NcsdPartition; NCSD_PARTITIONS],
    pub hash_exthdr: [u8; 0x20],
    pub size_addhdr: u32,
    pub offset_sector0: u32,
    pub partition_flags: [u8; 8],
    pub partition_ids: [u64; NCSD_PARTITIONS],
    reserved: [u8; 0x30],
}

impl NcsdHeader {
    pub fn from_bytes(data: &[u8]) -> Result<Self, NcsdError> {
        let mut buf = Cursor::new(data);
        let mut signature = [0u8; 0x100];
        buf.read_exact(&mut signature)?;
        let mut magic = [0u8; 4];
        buf.read_exact(&mut magic)?;
        let size = buf.read_u32::<LittleEndian>()?;
        let media_id = buf.read_u64::<LittleEndian>()?;
        let mut partitions_fs_type = [0u8; 8];
        buf.read_exact(&mut partitions_fs_type)?;
        let mut partitions_crypto_type = [0u8; 8];
        buf.read_exact(&mut partitions_crypto_type)?;
        let mut partitions = [NcsdPartition::default(); NCSD_PARTITIONS];
        for partition in partitions.iter_mut() {
            partition.offset = buf.read_u32::<LittleEndian>()?;
            partition.size = buf.read_u32::<LittleEndian>()?;
        }
        let mut hash_exthdr = [0u8; 0x20];
        buf.read_exact(&mut hash_exthdr)?;
        let size_addhdr = buf.read_u32::<LittleEndian>()?;
        let offset_sector0 = buf.read_u32::<LittleEndian>()?;
        let mut partition_flags = [0u8; 8];
        buf.read_exact(&mut partition_flags)?;
        let mut partition_ids = [0u64; NCSD_PARTITIONS];
        for id in partition_ids.iter_mut() {
            *id = buf.read_u64::<LittleEndian>()?;
        }
        let mut reserved = [0u8; 0x30];
        buf.read_exact(&mut reserved)?;
        Ok(NcsdHeader {
            signature,
            magic,
            size,
            media_id,
            partitions_fs_type,
            partitions_crypto_type,
            partitions,
            hash_exthdr,
            size_addhdr,
            offset_sector0,
            partition_flags,
            partition_ids,
            reserved,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut buf: Vec<u8> = Vec::with_capacity(NCSD_HEADER_SIZE);
        buf.write_all(&self.signature)?;
        buf.write_all(&self.magic)?;
        buf.write_u32::<LittleEndian>(self.size)?;
        buf.write_u64::<LittleEndian>(self.media_id)?;
        buf.write_all(&self.partitions_fs_type)?;
        buf.write_all(&self.partitions_crypto_type)?;
        for partition in &self.partitions {
            buf.write_u32::<LittleEndian>(partition.offset)?;
            buf.write_u32::<LittleEndian>(partition.size)?;
        }
        buf.write_all(&self.hash_exthdr)?;
        buf.write_u32::<LittleEndian>(self.size_addhdr)?;
        buf.write_u32::<LittleEndian>(self.offset_sector0)?;
        buf.write_all(&self.partition_flags)?;
        for id in &self.partition_ids {
            buf.write_u64::<LittleEndian>(*id)?;
        }
        buf.write_all(&self.reserved)?;
        Ok(buf)
    }

    /// Checks that the header is a game card image with sane partitions.
    pub fn validate(&self) -> Result<(), NcsdError> {
        if &self.magic != b"NCSD" {
            return Err(NcsdError::BadMagic);
        }
        if self.partitions_fs_type.iter().any(|&b| b != 0) {
            return Err(NcsdError::NandImage);
        }
        if self.media_id == 0 {
            return Err(NcsdError::MissingMediaId);
        }
        let mut units: u64 = 0;
        for (i, partition) in self.partitions.iter().enumerate() {
            if partition.size == 0 {
                if i == 0 {
                    return Err(NcsdError::MissingPartition);
                }
                continue;
            }
            if (partition.offset as u64) < units {
                return Err(NcsdError::Overlap(i));
            }
            units = partition.offset as u64 + partition.size as u64;
        }
        if units > self.size as u64 {
            return Err(NcsdError::SizeExceeded { end: units, size: self.size as u64 });
        }
        Ok(())
    }

    /// Gets the byte offset and size of every partition that is present.
    pub fn present_partitions(&self) -> impl Iterator<Item = (usize, u64, u64)> + '_ {
        self.partitions.iter()
            .enumerate()
            .filter(|(_, p)| p.size != 0)
            .map(|(i, p)| (i, p.offset as u64 * NCSD_MEDIA_UNIT, p.size as u64 * NCSD_MEDIA_UNIT))
    }

    /// Gets the size of the image without the unused space at the end of the card.
    pub fn trimmed_size(&self) -> u64 {
        self.present_partitions()
            .map(|(_, offset, size)| offset + size)
            .max()
            .unwrap_or(NCSD_HEADER_SIZE as u64)
    }
}

/// Converts every NCCH partition of an NCSD image while it is read front to back in chunks.
#[derive(Debug, Clone)]
pub struct NcsdStream {
    header: Option<NcsdHeader>,
    ncch: NcchStream,
}

impl NcsdStream {
    pub fn new(target: NcchCrypto) -> Self {
        NcsdStream {
            header: None,
            ncch: NcchStream::new(target),
        }
    }

    pub fn header(&self) -> Option<&NcsdHeader> {
        self.header.as_ref()
    }

    /// Converts the next chunk of the image in place.
    pub fn feed(&mut self, ctx: &mut CryptoContext, offset: u64, data: &mut [u8]) -> Result<(), NcsdError> {
        if offset == 0 && data.len() >= NCSD_HEADER_SIZE {
            self.header = None;
            let header = NcsdHeader::from_bytes(&data[..NCSD_HEADER_SIZE])?;
            header.validate()?;
            self.header = Some(header);
        }
        let header = self.header.as_ref().ok_or(NcsdError::StreamNotReady)?;
        let end = offset + data.len() as u64;
        for (index, partition_offset, partition_size) in header.present_partitions() {
            if partition_offset >= end || offset >= partition_offset + partition_size {
                continue;
            }
            let start = partition_offset.saturating_sub(offset) as usize;
            let offset_in_partition = offset.saturating_sub(partition_offset);
            let stop = ((partition_offset + partition_size).min(end) - offset) as usize;
            self.ncch.feed(ctx, offset_in_partition, &mut data[start..stop])
                .map_err(|source| NcsdError::Partition { index, source })?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn build_test_ncsd(partitions: &[&[u8]]) -> Vec<u8> {
    let mut header = NcsdHeader::from_bytes(&[0u8; NCSD_HEADER_SIZE]).unwrap();
    header.magic = *b"NCSD";
    header.media_id = 0x0004000000ABCD00;
    let mut body: Vec<u8> = vec![0u8; 0x4000 - NCSD_HEADER_SIZE];
    for (i, data) in partitions.iter().enumerate() {
        let offset = NCSD_HEADER_SIZE + body.len();
        header.partitions[i].offset = (offset as u64 / NCSD_MEDIA_UNIT) as u32;
        header.partitions[i].size = (data.len() as u64 / NCSD_MEDIA_UNIT) as u32;
        body.extend_from_slice(data);
    }
    header.size = ((NCSD_HEADER_SIZE + body.len()) as u64 / NCSD_MEDIA_UNIT) as u32;
    let mut out = header.to_bytes().unwrap();
    out.extend(body);
    out
}
