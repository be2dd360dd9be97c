// nand/disa.rs from rustctr (c) 2025 NinjaCheetah & Contributors
// https://github.com/NinjaCheetah/rustctr
//
// Implements just enough of the DISA/DIFF save container formats to read the level 4 (user data)
// region of a partition stored as external IVFC level 4 data.

use std::io::{Cursor, Read, Seek, SeekFrom};
use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

const CONTAINER_HEADER_OFFSET: u64 = 0x100;

#[derive(Debug, Error)]
pub enum DisaError {
    #[error("save container has unknown magic `{0}` (expected DISA or DIFF)")]
    BadMagic(String),
    #[error("partition descriptor is not valid (bad {0} header)")]
    BadDescriptor(&'static str),
    #[error("partition keeps its level 4 data inside the DPFS tree, which is not supported")]
    UnsupportedLayout,
    #[error("requested range 0x{offset:X}+0x{size:X} is outside of the level 4 region (0x{max:X} bytes)")]
    OutOfRange { offset: u64, size: u64, max: u64 },
    #[error("save container data is not in a valid format")]
    IO(#[from] std::io::Error),
}

/// Where the level 4 data of a save partition lives inside its container file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lvl4Region {
    pub offset: u64,
    pub size: u64,
}

fn read_magic<R: Read>(reader: &mut R) -> Result<[u8; 4], std::io::Error> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    Ok(magic)
}

// Returns the absolute offset of the first partition descriptor and the partition itself.
fn locate_partition<R: Read + Seek>(reader: &mut R) -> Result<(u64, u64), DisaError> {
    reader.seek(SeekFrom::Start(CONTAINER_HEADER_OFFSET))?;
    let mut header = [0u8; 0x100];
    reader.read_exact(&mut header)?;
    let mut buf = Cursor::new(&header[..]);
    let magic = read_magic(&mut buf)?;
    match &magic {
        b"DISA" => {
            buf.seek(SeekFrom::Start(0x10))?;
            let secondary_table = buf.read_u64::<LittleEndian>()?;
            let primary_table = buf.read_u64::<LittleEndian>()?;
            let _table_size = buf.read_u64::<LittleEndian>()?;
            let desc_a_offset = buf.read_u64::<LittleEndian>()?;
            buf.seek(SeekFrom::Start(0x48))?;
            let part_a_offset = buf.read_u64::<LittleEndian>()?;
            buf.seek(SeekFrom::Start(0x68))?;
            let active_table = buf.read_u8()?;
            let table = if active_table == 0 { primary_table } else { secondary_table };
            Ok((table + desc_a_offset, part_a_offset))
        },
        b"DIFF" => {
            buf.seek(SeekFrom::Start(0x08))?;
            let secondary_table = buf.read_u64::<LittleEndian>()?;
            let primary_table = buf.read_u64::<LittleEndian>()?;
            let _table_size = buf.read_u64::<LittleEndian>()?;
            let partition_offset = buf.read_u64::<LittleEndian>()?;
            let _partition_size = buf.read_u64::<LittleEndian>()?;
            let active_table = buf.read_u32::<LittleEndian>()?;
            let table = if active_table == 0 { primary_table } else { secondary_table };
            Ok((table, partition_offset))
        },
        _ => Err(DisaError::BadMagic(String::from_utf8_lossy(&magic).into_owned())),
    }
}

/// Finds the level 4 region of the first partition in a DISA or DIFF container.
pub fn find_lvl4<R: Read + Seek>(reader: &mut R) -> Result<Lvl4Region, DisaError> {
    let (descriptor, partition) = locate_partition(reader)?;
    reader.seek(SeekFrom::Start(descriptor))?;
    if &read_magic(reader)? != b"DIFI" {
        return Err(DisaError::BadDescriptor("DIFI"));
    }
    let _version = reader.read_u32::<LittleEndian>()?;
    let ivfc_offset = reader.read_u64::<LittleEndian>()?;
    reader.seek(SeekFrom::Start(descriptor + 0x38))?;
    let external_lvl4 = reader.read_u8()?;
    reader.seek(SeekFrom::Start(descriptor + 0x3C))?;
    let external_lvl4_offset = reader.read_u64::<LittleEndian>()?;

    reader.seek(SeekFrom::Start(descriptor + ivfc_offset))?;
    if &read_magic(reader)? != b"IVFC" {
        return Err(DisaError::BadDescriptor("IVFC"));
    }
    reader.seek(SeekFrom::Start(descriptor + ivfc_offset + 0x60))?;
    let lvl4_size = reader.read_u64::<LittleEndian>()?;

    if external_lvl4 == 0 {
        return Err(DisaError::UnsupportedLayout);
    }
    Ok(Lvl4Region {
        offset: partition + external_lvl4_offset,
        size: lvl4_size,
    })
}

/// Reads `buf.len()` bytes starting `offset` bytes into the level 4 region of a save container.
pub fn read_lvl4<R: Read + Seek>(reader: &mut R, offset: u64, buf: &mut [u8]) -> Result<(), DisaError> {
    let region = find_lvl4(reader)?;
    let size = buf.len() as u64;
    if offset.checked_add(size).is_none_or(|end| end > region.size) {
        return Err(DisaError::OutOfRange { offset, size, max: region.size });
    }
    reader.seek(SeekFrom::Start(region.offset + offset))?;
    reader.read_exact(buf)?;
    Ok(())
}

/// Builds a minimal DISA container holding `lvl4` as external level 4 data.
#[cfg(test)]
pub(crate) fn build_test_disa(lvl4: &[u8]) -> Vec<u8> {
    use byteorder::WriteBytesExt;
    use std::io::Write;
    let mut out: Vec<u8> = vec![0u8; 0x100];
    out.write_all(b"DISA").unwrap();
    out.write_u32::<LittleEndian>(0x40000).unwrap();
    out.write_u32::<LittleEndian>(1).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
    out.write_u64::<LittleEndian>(0x200).unwrap(); // secondary table
    out.write_u64::<LittleEndian>(0x200).unwrap(); // primary table
    out.write_u64::<LittleEndian>(0x200).unwrap(); // table size
    out.write_u64::<LittleEndian>(0).unwrap(); // descriptor A offset
    out.write_u64::<LittleEndian>(0x130).unwrap(); // descriptor A size
    out.resize(0x148, 0);
    out.write_u64::<LittleEndian>(0x400).unwrap(); // partition A offset
    out.write_u64::<LittleEndian>(lvl4.len() as u64).unwrap();
    out.resize(0x200, 0);
    out.write_all(b"DIFI").unwrap();
    out.write_u32::<LittleEndian>(0x10000).unwrap();
    out.write_u64::<LittleEndian>(0x44).unwrap(); // IVFC descriptor offset
    out.write_u64::<LittleEndian>(0x78).unwrap();
    out.resize(0x238, 0);
    out.write_u8(1).unwrap(); // external level 4
    out.resize(0x23C, 0);
    out.write_u64::<LittleEndian>(0).unwrap();
    out.resize(0x244, 0);
    out.write_all(b"IVFC").unwrap();
    out.write_u32::<LittleEndian>(0x20000).unwrap();
    out.resize(0x244 + 0x60, 0);
    out.write_u64::<LittleEndian>(lvl4.len() as u64).unwrap();
    out.resize(0x400, 0);
    out.write_all(lvl4).unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_external_lvl4() {
        let lvl4: Vec<u8> = (0..0x300u32).map(|i| i as u8).collect();
        let disa = build_test_disa(&lvl4);
        let mut reader = Cursor::new(disa);
        let region = find_lvl4(&mut reader).unwrap();
        assert_eq!(region, Lvl4Region { offset: 0x400, size: 0x300 });
        let mut buf = [0u8; 0x10];
        read_lvl4(&mut reader, 0x100, &mut buf).unwrap();
        assert_eq!(buf[..], lvl4[0x100..0x110]);
    }

    #[test]
    fn test_read_out_of_range() {
        let disa = build_test_disa(&[0u8; 0x100]);
        let mut reader = Cursor::new(disa);
        let mut buf = [0u8; 0x20];
        assert!(matches!(read_lvl4(&mut reader, 0xF0, &mut buf), Err(DisaError::OutOfRange { .. })));
    }

    #[test]
    fn test_internal_lvl4_unsupported() {
        let mut disa = build_test_disa(&[0u8; 0x100]);
        disa[0x238] = 0;
        assert!(matches!(find_lvl4(&mut Cursor::new(disa)), Err(DisaError::UnsupportedLayout)));
    }

    #[test]
    fn test_bad_magic() {
        let mut disa = build_test_disa(&[0u8; 0x100]);
        disa[0x100..0x104].copy_from_slice(b"NOPE");
        assert!(matches!(find_lvl4(&mut Cursor::new(disa)), Err(DisaError::BadMagic(_))));
    }
}
