//! File storage: sequential (PRG/SEQ/USR) and relative (REL) files.
//!
//! Sequential files are a single sector chain carrying 254 data bytes per
//! sector.  Relative files add a chain of "side sectors" indexing every
//! data sector, so records can be located without walking the whole chain.

use std::io::{Read, Write};
use std::{cmp, io};

use log::debug;

use crate::disk::alloc;
use crate::disk::block::{Location, BLOCK_SIZE};
use crate::disk::chain::{self, ChainIterator, ChainLink, ChainReader, ChainWriter, CHAIN_LINK_ZERO};
use crate::disk::directory::{self, Extra, FileAttributes, FileType, RelativeExtra};
use crate::disk::error::DiskError;
use crate::disk::D64;
use crate::petscii::Petscii;

/// Data bytes carried per chained sector, after the two link bytes.
pub const CONTENT_BYTES_PER_BLOCK: usize = BLOCK_SIZE - 2;

/// Sectors held back from file writes, matching the CBM DOS practice of
/// keeping a little slack for housekeeping.
pub(super) const RESERVED_BLOCKS: usize = 2;

/// Each side sector indexes up to 120 data sectors.
pub const SIDE_SECTOR_POINTERS: usize = (BLOCK_SIZE - SIDE_SECTOR_DATA_OFFSET) / 2;

const MAX_SIDE_SECTORS: usize = 6;
const SIDE_SECTOR_INDEX_OFFSET: usize = 0x02;
const SIDE_SECTOR_RECORD_OFFSET: usize = 0x03;
const SIDE_SECTOR_LIST_OFFSET: usize = 0x04;
const SIDE_SECTOR_DATA_OFFSET: usize = 0x10;

/// The number of sectors a payload of `len` bytes occupies.  Zero-length
/// payloads still occupy their initial sector.
pub fn blocks_for(len: usize) -> usize {
    cmp::max(1, (len + CONTENT_BYTES_PER_BLOCK - 1) / CONTENT_BYTES_PER_BLOCK)
}

/// Confirm that no live entry exists with the provided filename.
fn check_name_available(disk: &D64, name: &Petscii) -> io::Result<()> {
    match disk.find_directory_entry(name) {
        Ok(_) => Err(DiskError::Duplicate.into()),
        Err(ref e) if *e == DiskError::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Allocate and initialize the first sector of a new chain as an empty
/// tail, returning its location.
fn provision_first_sector(disk: &mut D64) -> io::Result<Location> {
    let first = {
        let bam = disk.bam();
        let bam = bam.borrow();
        alloc::next_data_sector(disk.layout(), &bam, None)?
    };
    disk.bam().borrow_mut().allocate(first)?;
    let blocks = disk.blocks();
    let mut blocks = blocks.borrow_mut();
    let block = blocks.sector_mut(first)?;
    for b in block.iter_mut() {
        *b = 0;
    }
    CHAIN_LINK_ZERO.to_bytes(block);
    Ok(first)
}

/// Write a payload into a fresh chain beginning at `first`, using the
/// directory entry to track the block count.
fn write_chain(disk: &mut D64, entry: directory::DirectoryEntry, first: Location, data: &[u8]) -> io::Result<()> {
    let mut writer = ChainWriter::new(disk.blocks(), disk.bam(), disk.layout(), entry, first)?;
    writer.write_all(data)?;
    writer.flush()
}

/// Add a sequential (PRG, SEQ, or USR) file.
pub(super) fn add_file(
    disk: &mut D64,
    name: &Petscii,
    file_type: FileType,
    data: &[u8],
) -> io::Result<()> {
    match file_type {
        FileType::PRG | FileType::SEQ | FileType::USR => {}
        FileType::REL => return Err(DiskError::UseAddRel.into()),
        _ => return Err(DiskError::IoError.into()),
    }
    check_name_available(disk, name)?;

    // Check the whole write fits before mutating anything.
    let needed = blocks_for(data.len());
    if disk.free_sector_count() < needed + RESERVED_BLOCKS {
        return Err(DiskError::DiskFull.into());
    }

    let mut entry = directory::next_free_directory_entry(disk)?;
    let first = provision_first_sector(disk)?;

    entry.reset();
    entry.file_attributes.file_type = file_type;
    entry.file_attributes.closed_flag = true;
    entry.first_sector = first;
    entry.filename = name.clone();
    entry.file_size = 1; // One block is allocated for the first sector.
    disk.blocks().borrow_mut().positioned_write(&entry)?;

    write_chain(disk, entry, first, data)
}

/// Add a relative (REL) file with the given record size.  The payload is
/// zero-padded to a whole number of records.
pub(super) fn add_rel_file(
    disk: &mut D64,
    name: &Petscii,
    record_size: u8,
    data: &[u8],
) -> io::Result<()> {
    if record_size < 2 || record_size as usize > CONTENT_BYTES_PER_BLOCK {
        return Err(DiskError::InvalidRecordSize.into());
    }
    check_name_available(disk, name)?;

    let mut padded = data.to_vec();
    let remainder = padded.len() % record_size as usize;
    if remainder != 0 {
        padded.resize(padded.len() + record_size as usize - remainder, 0);
    }

    let data_blocks = blocks_for(padded.len());
    let side_blocks = (data_blocks + SIDE_SECTOR_POINTERS - 1) / SIDE_SECTOR_POINTERS;
    if disk.free_sector_count() < data_blocks + side_blocks + RESERVED_BLOCKS {
        return Err(DiskError::DiskFull.into());
    }

    let mut entry = directory::next_free_directory_entry(disk)?;
    let first = provision_first_sector(disk)?;

    entry.reset();
    entry.file_attributes.file_type = FileType::REL;
    entry.file_attributes.closed_flag = true;
    entry.first_sector = first;
    entry.filename = name.clone();
    entry.file_size = 1;
    disk.blocks().borrow_mut().positioned_write(&entry)?;

    write_chain(disk, entry.clone(), first, &padded)?;

    // The side sector index needs the location of every data sector, in
    // chain order.
    let data_locations = ChainIterator::new(disk.blocks(), first).locations()?;

    // Side sectors continue the interleave from the end of the data chain.
    let mut side_locations: Vec<Location> = Vec::with_capacity(side_blocks);
    let mut previous = *data_locations.last().unwrap();
    for _ in 0..side_blocks {
        let location = {
            let bam = disk.bam();
            let bam = bam.borrow();
            alloc::next_data_sector(disk.layout(), &bam, Some(previous))?
        };
        disk.bam().borrow_mut().allocate(location)?;
        side_locations.push(location);
        previous = location;
    }

    for (i, &location) in side_locations.iter().enumerate() {
        let mut block = [0u8; BLOCK_SIZE];
        let start = i * SIDE_SECTOR_POINTERS;
        let end = cmp::min(start + SIDE_SECTOR_POINTERS, data_locations.len());
        let pointers = end - start;

        if i + 1 < side_locations.len() {
            ChainLink::Next(side_locations[i + 1]).to_bytes(&mut block);
        } else {
            ChainLink::Tail(SIDE_SECTOR_DATA_OFFSET + 2 * pointers).to_bytes(&mut block);
        }
        block[SIDE_SECTOR_INDEX_OFFSET] = i as u8;
        block[SIDE_SECTOR_RECORD_OFFSET] = record_size;
        for (j, &side) in side_locations.iter().enumerate().take(MAX_SIDE_SECTORS) {
            block[SIDE_SECTOR_LIST_OFFSET + 2 * j] = side.0;
            block[SIDE_SECTOR_LIST_OFFSET + 2 * j + 1] = side.1;
        }
        for (j, &data_sector) in data_locations[start..end].iter().enumerate() {
            block[SIDE_SECTOR_DATA_OFFSET + 2 * j] = data_sector.0;
            block[SIDE_SECTOR_DATA_OFFSET + 2 * j + 1] = data_sector.1;
        }

        let blocks = disk.blocks();
        let mut blocks = blocks.borrow_mut();
        blocks.sector_mut(location)?.copy_from_slice(&block);
    }

    // Record the REL metadata and fold the side sectors into the block
    // count, as CBM DOS does.
    let mut entry = disk.find_directory_entry(name)?;
    entry.extra = Extra::Relative(RelativeExtra::new(side_locations[0], record_size));
    entry.file_size += side_blocks as u16;
    disk.blocks().borrow_mut().positioned_write(&entry)?;

    disk.bam().borrow_mut().flush()?;
    debug!(
        "wrote REL {:?}: {} data + {} side sectors, record size {}",
        name, data_blocks, side_blocks, record_size
    );
    Ok(())
}

/// Read a file's payload by walking its chain.
pub(super) fn extract_file(disk: &D64, name: &Petscii) -> io::Result<Vec<u8>> {
    let entry = disk.find_directory_entry(name)?;
    let mut reader = ChainReader::new(disk.blocks(), entry.first_sector);
    let mut data = vec![];
    reader.read_to_end(&mut data)?;
    Ok(data)
}

/// Remove a file: release its data chain (and side sectors, for REL files)
/// and zero the directory entry's type byte.
pub(super) fn remove_file(disk: &mut D64, name: &Petscii) -> io::Result<()> {
    let mut entry = disk.find_directory_entry(name)?;

    chain::remove_chain(disk.blocks(), disk.bam(), entry.first_sector)?;

    if let Extra::Relative(ref extra) = entry.extra {
        if extra.first_side_sector.0 != 0 {
            chain::remove_chain(disk.blocks(), disk.bam(), extra.first_side_sector)?;
        }
    }

    // Zero the type byte; the rest of the entry is left behind, as a real
    // scratch does.
    entry.file_attributes = FileAttributes::from_byte(0);
    disk.blocks().borrow_mut().positioned_write(&entry)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::D64;

    fn fresh_disk() -> D64 {
        let mut disk = D64::open_memory(35).unwrap();
        disk.format(&"test".into(), &"t1".into()).unwrap();
        disk
    }

    #[test]
    fn test_add_and_extract_roundtrip() {
        let mut disk = fresh_disk();
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        disk.add_file(&"data".into(), FileType::PRG, &payload).unwrap();
        assert_eq!(disk.extract_file(&"data".into()).unwrap(), payload);
        let entry = disk.find_directory_entry(&"data".into()).unwrap();
        assert_eq!(entry.file_size as usize, blocks_for(payload.len()));
        assert_eq!(entry.file_attributes.file_type, FileType::PRG);
    }

    #[test]
    fn test_exact_block_boundary() {
        let mut disk = fresh_disk();
        // 254 bytes fit in one sector, whose header is (0, 255).
        let payload = vec![0xAB; CONTENT_BYTES_PER_BLOCK];
        disk.add_file(&"exact".into(), FileType::SEQ, &payload).unwrap();
        let entry = disk.find_directory_entry(&"exact".into()).unwrap();
        assert_eq!(entry.file_size, 1);
        let sector = disk.read_sector(entry.first_sector.0, entry.first_sector.1).unwrap();
        assert_eq!(sector[0], 0);
        assert_eq!(sector[1], 255);
        assert_eq!(disk.extract_file(&"exact".into()).unwrap(), payload);
    }

    #[test]
    fn test_one_byte_over_block_boundary() {
        let mut disk = fresh_disk();
        // 255 bytes spill into a second sector with header (0, 2).
        let payload = vec![0xCD; CONTENT_BYTES_PER_BLOCK + 1];
        disk.add_file(&"spill".into(), FileType::PRG, &payload).unwrap();
        let entry = disk.find_directory_entry(&"spill".into()).unwrap();
        assert_eq!(entry.file_size, 2);
        let chain = ChainIterator::new(disk.blocks(), entry.first_sector)
            .locations()
            .unwrap();
        assert_eq!(chain.len(), 2);
        let tail = disk.read_sector(chain[1].0, chain[1].1).unwrap();
        assert_eq!(tail[0], 0);
        assert_eq!(tail[1], 2);
        assert_eq!(disk.extract_file(&"spill".into()).unwrap(), payload);
    }

    #[test]
    fn test_empty_payload() {
        let mut disk = fresh_disk();
        disk.add_file(&"empty".into(), FileType::SEQ, &[]).unwrap();
        let entry = disk.find_directory_entry(&"empty".into()).unwrap();
        assert_eq!(entry.file_size, 1);
        let sector = disk.read_sector(entry.first_sector.0, entry.first_sector.1).unwrap();
        assert_eq!(sector[0], 0);
        assert_eq!(sector[1], 1);
        assert_eq!(disk.extract_file(&"empty".into()).unwrap(), vec![]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut disk = fresh_disk();
        disk.add_file(&"twice".into(), FileType::PRG, b"one").unwrap();
        let result = disk.add_file(&"twice".into(), FileType::PRG, b"two");
        assert_eq!(result.unwrap_err(), DiskError::Duplicate);
        // The first file is untouched.
        assert_eq!(disk.extract_file(&"twice".into()).unwrap(), b"one".to_vec());
    }

    #[test]
    fn test_rel_rejected_by_add_file() {
        let mut disk = fresh_disk();
        let result = disk.add_file(&"records".into(), FileType::REL, b"data");
        assert_eq!(result.unwrap_err(), DiskError::UseAddRel);
    }

    #[test]
    fn test_rel_record_size_bounds() {
        let mut disk = fresh_disk();
        let result = disk.add_rel_file(&"records".into(), 1, b"data");
        assert_eq!(result.unwrap_err(), DiskError::InvalidRecordSize);
    }

    #[test]
    fn test_rel_roundtrip_and_layout() {
        let mut disk = fresh_disk();
        // 10 records of 100 bytes: 1000 bytes, 4 data sectors, 1 side sector.
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 97) as u8).collect();
        disk.add_rel_file(&"records".into(), 100, &payload).unwrap();

        let entry = disk.find_directory_entry(&"records".into()).unwrap();
        assert_eq!(entry.file_attributes.file_type, FileType::REL);
        assert_eq!(entry.file_size, 5); // 4 data + 1 side

        let (side_location, record_size) = match entry.extra {
            Extra::Relative(ref e) => (e.first_side_sector, e.record_length),
            _ => panic!("expected REL extra"),
        };
        assert_eq!(record_size, 100);

        let side = disk.read_sector(side_location.0, side_location.1).unwrap();
        assert_eq!(side[0], 0); // single side sector
        assert_eq!(side[SIDE_SECTOR_INDEX_OFFSET], 0);
        assert_eq!(side[SIDE_SECTOR_RECORD_OFFSET], 100);
        // The side sector lists itself first.
        assert_eq!(side[SIDE_SECTOR_LIST_OFFSET], side_location.0);
        assert_eq!(side[SIDE_SECTOR_LIST_OFFSET + 1], side_location.1);

        // The indexed data sectors match the chain.
        let chain = ChainIterator::new(disk.blocks(), entry.first_sector)
            .locations()
            .unwrap();
        assert_eq!(chain.len(), 4);
        for (i, location) in chain.iter().enumerate() {
            assert_eq!(side[SIDE_SECTOR_DATA_OFFSET + 2 * i], location.0);
            assert_eq!(side[SIDE_SECTOR_DATA_OFFSET + 2 * i + 1], location.1);
        }

        assert_eq!(disk.extract_file(&"records".into()).unwrap(), payload);
    }

    #[test]
    fn test_rel_payload_padded_to_record_multiple() {
        let mut disk = fresh_disk();
        disk.add_rel_file(&"pad".into(), 10, &[1u8; 25]).unwrap();
        let data = disk.extract_file(&"pad".into()).unwrap();
        assert_eq!(data.len(), 30);
        assert_eq!(&data[..25], &[1u8; 25][..]);
        assert_eq!(&data[25..], &[0u8; 5][..]);
    }

    #[test]
    fn test_remove_restores_free_count() {
        let mut disk = fresh_disk();
        let before = disk.free_sector_count();
        disk.add_file(&"gone".into(), FileType::PRG, &[7u8; 600]).unwrap();
        assert_eq!(disk.free_sector_count(), before - 3);
        disk.remove_file(&"gone".into()).unwrap();
        assert_eq!(disk.free_sector_count(), before);
        let result = disk.extract_file(&"gone".into());
        assert_eq!(result.unwrap_err(), DiskError::NotFound);
    }

    #[test]
    fn test_remove_rel_frees_side_sectors() {
        let mut disk = fresh_disk();
        let before = disk.free_sector_count();
        disk.add_rel_file(&"records".into(), 100, &[3u8; 1000]).unwrap();
        assert_eq!(disk.free_sector_count(), before - 5);
        disk.remove_file(&"records".into()).unwrap();
        assert_eq!(disk.free_sector_count(), before);
    }

    #[test]
    fn test_disk_full_reserve() {
        let mut disk = fresh_disk();
        let free = disk.free_sector_count();
        // A payload needing every free sector fails: two are held back.
        let payload = vec![0u8; free * CONTENT_BYTES_PER_BLOCK];
        let result = disk.add_file(&"huge".into(), FileType::PRG, &payload);
        assert_eq!(result.unwrap_err(), DiskError::DiskFull);
        // Nothing was mutated.
        assert_eq!(disk.free_sector_count(), free);
        assert!(disk.directory().unwrap().is_empty());

        // A payload leaving the reserve intact succeeds.
        let payload = vec![0u8; (free - RESERVED_BLOCKS) * CONTENT_BYTES_PER_BLOCK];
        disk.add_file(&"big".into(), FileType::PRG, &payload).unwrap();
        assert_eq!(disk.free_sector_count(), RESERVED_BLOCKS);
    }
}
