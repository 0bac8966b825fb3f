//! CBM DOS directories
//!
//! The directory is a chain of sectors on track 18 beginning at (18,1).
//! Each sector carries eight 32-byte entries; the first two bytes of the
//! sector double as the chain link, overlapping entry zero's unused lead-in
//! bytes.

use std::fmt;
use std::fmt::Write;
use std::io;

use crate::disk::alloc;
use crate::disk::block::{Location, Position, PositionedData, BLOCK_SIZE};
use crate::disk::chain::{ChainIterator, ChainSector};
use crate::disk::error::DiskError;
use crate::disk::{D64, PADDING_BYTE};
use crate::petscii::Petscii;

const FILE_TYPE_DEL: u8 = 0x00;
const FILE_TYPE_SEQ: u8 = 0x01;
const FILE_TYPE_PRG: u8 = 0x02;
const FILE_TYPE_USR: u8 = 0x03;
const FILE_TYPE_REL: u8 = 0x04;
const FILE_ATTRIB_FILE_TYPE_MASK: u8 = 0x0F;
const FILE_ATTRIB_UNUSED_MASK: u8 = 0x10;
const FILE_ATTRIB_SAVE_WITH_REPLACE_MASK: u8 = 0x20;
const FILE_ATTRIB_LOCKED_MASK: u8 = 0x40;
const FILE_ATTRIB_CLOSED_MASK: u8 = 0x80;

/// A directory entry categorizes files as SEQ, PRG, USR, or REL, along with
/// a pseudo-file-type of DEL to indicate deleted files.
#[derive(PartialEq, Debug, Clone, Copy)]
pub enum FileType {
    DEL,
    SEQ,
    PRG,
    USR,
    REL,
    Unknown(u8),
}

impl FileType {
    pub fn from_string(string: &str) -> Option<FileType> {
        match string.to_uppercase().as_str() {
            "DEL" => Some(FileType::DEL),
            "SEQ" => Some(FileType::SEQ),
            "PRG" => Some(FileType::PRG),
            "USR" => Some(FileType::USR),
            "REL" => Some(FileType::REL),
            _ => None,
        }
    }

    /// The conventional host-file extension for this type.
    pub fn extension(&self) -> &'static str {
        match self {
            FileType::DEL => "del",
            FileType::SEQ => "seq",
            FileType::PRG => "prg",
            FileType::USR => "usr",
            FileType::REL => "rel",
            FileType::Unknown(_) => "bin",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            FileType::DEL => "del",
            FileType::SEQ => "seq",
            FileType::PRG => "prg",
            FileType::USR => "usr",
            FileType::REL => "rel",
            FileType::Unknown(_) => "unk",
        })
    }
}

/// The full 8-bit directory entry field containing the file type along with
/// several flags.
#[derive(Clone)]
pub struct FileAttributes {
    /// Bits 0-3 indicate the file type.
    pub file_type: FileType,
    /// Bit 4 is unused, but we store it anyway so we can reproduce this
    /// field verbatim.
    pub unused_bit: bool,
    /// Bit 5 is the "save with replace" flag.
    pub save_with_replace_flag: bool,
    /// Bit 6 is the "locked" flag, indicated by a "<" in directory listings.
    pub locked_flag: bool,
    /// Bit 7 is the "closed" flag.  Files are normally closed, so this bit
    /// is normally set.  Unclosed files are indicated in directory listings
    /// with a "*" ("splat files").
    pub closed_flag: bool,
}

impl FileAttributes {
    pub fn from_byte(byte: u8) -> FileAttributes {
        let file_type = match byte & FILE_ATTRIB_FILE_TYPE_MASK {
            FILE_TYPE_DEL => FileType::DEL,
            FILE_TYPE_SEQ => FileType::SEQ,
            FILE_TYPE_PRG => FileType::PRG,
            FILE_TYPE_USR => FileType::USR,
            FILE_TYPE_REL => FileType::REL,
            b => FileType::Unknown(b),
        };
        FileAttributes {
            file_type,
            unused_bit: byte & FILE_ATTRIB_UNUSED_MASK != 0,
            save_with_replace_flag: byte & FILE_ATTRIB_SAVE_WITH_REPLACE_MASK != 0,
            locked_flag: byte & FILE_ATTRIB_LOCKED_MASK != 0,
            closed_flag: byte & FILE_ATTRIB_CLOSED_MASK != 0,
        }
    }

    pub fn to_byte(&self) -> u8 {
        let mut byte = match self.file_type {
            FileType::DEL => FILE_TYPE_DEL,
            FileType::SEQ => FILE_TYPE_SEQ,
            FileType::PRG => FILE_TYPE_PRG,
            FileType::USR => FILE_TYPE_USR,
            FileType::REL => FILE_TYPE_REL,
            FileType::Unknown(b) => b,
        };
        if self.unused_bit {
            byte |= FILE_ATTRIB_UNUSED_MASK
        };
        if self.save_with_replace_flag {
            byte |= FILE_ATTRIB_SAVE_WITH_REPLACE_MASK
        };
        if self.locked_flag {
            byte |= FILE_ATTRIB_LOCKED_MASK
        };
        if self.closed_flag {
            byte |= FILE_ATTRIB_CLOSED_MASK
        };
        byte
    }

    /// A live file has its closed flag set.
    pub fn is_live(&self) -> bool {
        self.closed_flag
    }

    /// A slot is reusable when its type byte is fully zeroed, as left
    /// behind by file removal.
    pub fn is_free_slot(&self) -> bool {
        self.to_byte() == 0
    }
}

impl fmt::Display for FileAttributes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.closed_flag { ' ' } else { '*' },
            self.file_type,
            if self.locked_flag { "<" } else { " " },
        )
    }
}

impl fmt::Debug for FileAttributes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.closed_flag {
            f.write_char('*')?;
        }
        <FileType as fmt::Debug>::fmt(&self.file_type, f)?;
        if self.locked_flag {
            f.write_str("<")?;
        }
        Ok(())
    }
}

pub const ENTRY_SIZE: usize = 32;
pub(super) const ENTRIES_PER_SECTOR: usize = BLOCK_SIZE / ENTRY_SIZE;
const ENTRY_FILE_ATTRIBUTE_OFFSET: usize = 0x02;
const ENTRY_FIRST_SECTOR_OFFSET: usize = 0x03;
const ENTRY_FILENAME_OFFSET: usize = 0x05;
const ENTRY_FILENAME_LENGTH: usize = 16;
const ENTRY_EXTRA_OFFSET: usize = 0x15;
const EXTRA_SIZE: usize = 9;
const ENTRY_FILE_SIZE_OFFSET: usize = 0x1E;

/// The nine directory entry bytes 0x15..0x1E are used differently by
/// regular and relative files, hence this enum to encapsulate the two
/// interpretations.
#[derive(Clone, PartialEq)]
pub enum Extra {
    Linear(LinearExtra),
    Relative(RelativeExtra),
}

impl Extra {
    pub fn default() -> Extra {
        Extra::Linear(LinearExtra::from_bytes(&[0u8; EXTRA_SIZE]))
    }

    pub fn from_bytes(relative: bool, bytes: &[u8]) -> Extra {
        assert_eq!(bytes.len(), EXTRA_SIZE);
        if relative {
            Extra::Relative(RelativeExtra::from_bytes(bytes))
        } else {
            Extra::Linear(LinearExtra::from_bytes(bytes))
        }
    }

    pub fn to_bytes(&self, bytes: &mut [u8]) {
        assert_eq!(bytes.len(), EXTRA_SIZE);
        match self {
            Extra::Linear(e) => e.to_bytes(bytes),
            Extra::Relative(e) => e.to_bytes(bytes),
        }
    }
}

impl fmt::Debug for Extra {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Extra::Linear(e) => e.fmt(f),
            Extra::Relative(e) => e.fmt(f),
        }
    }
}

/// The extra directory entry bytes of regular files.  These should all be
/// unused, so we simply preserve whatever bytes are present.
#[derive(Clone, PartialEq)]
pub struct LinearExtra {
    pub unused: Vec<u8>, // 9 bytes
}

impl LinearExtra {
    pub fn from_bytes(bytes: &[u8]) -> LinearExtra {
        assert_eq!(bytes.len(), EXTRA_SIZE);
        LinearExtra {
            unused: bytes.to_vec(),
        }
    }

    pub fn to_bytes(&self, bytes: &mut [u8]) {
        assert_eq!(bytes.len(), EXTRA_SIZE);
        bytes.copy_from_slice(&self.unused);
    }
}

impl fmt::Debug for LinearExtra {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "REGULAR")
    }
}

/// The extra directory entry bytes of relative files: the location of the
/// first side sector and the record length.
#[derive(Clone, PartialEq)]
pub struct RelativeExtra {
    pub first_side_sector: Location,
    pub record_length: u8,
    pub unused: Vec<u8>, // 6 bytes
}

impl RelativeExtra {
    const FIRST_SIDE_SECTOR_OFFSET: usize = 0x00;
    const RECORD_LENGTH_OFFSET: usize = 0x02;
    const UNUSED_OFFSET: usize = 0x03;

    pub fn new(first_side_sector: Location, record_length: u8) -> RelativeExtra {
        RelativeExtra {
            first_side_sector,
            record_length,
            unused: vec![0u8; EXTRA_SIZE - Self::UNUSED_OFFSET],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> RelativeExtra {
        assert_eq!(bytes.len(), EXTRA_SIZE);
        RelativeExtra {
            first_side_sector: Location::from_bytes(
                &bytes[Self::FIRST_SIDE_SECTOR_OFFSET..Self::FIRST_SIDE_SECTOR_OFFSET + 2],
            ),
            record_length: bytes[Self::RECORD_LENGTH_OFFSET],
            unused: bytes[Self::UNUSED_OFFSET..EXTRA_SIZE].to_vec(),
        }
    }

    pub fn to_bytes(&self, bytes: &mut [u8]) {
        assert_eq!(bytes.len(), EXTRA_SIZE);
        bytes[Self::FIRST_SIDE_SECTOR_OFFSET] = self.first_side_sector.0;
        bytes[Self::FIRST_SIDE_SECTOR_OFFSET + 1] = self.first_side_sector.1;
        bytes[Self::RECORD_LENGTH_OFFSET] = self.record_length;
        bytes[Self::UNUSED_OFFSET..EXTRA_SIZE].copy_from_slice(&self.unused);
    }
}

impl fmt::Debug for RelativeExtra {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "REL(side={} rec_len={})",
            self.first_side_sector, self.record_length
        )
    }
}

/// A CBM DOS directory entry.
#[derive(Clone)]
pub struct DirectoryEntry {
    pub file_attributes: FileAttributes,
    pub first_sector: Location,
    pub filename: Petscii,
    pub extra: Extra,
    pub file_size: u16,
    // The disk image position where this entry is stored, if available.
    pub position: Option<Position>,
}

impl DirectoryEntry {
    /// Parse an entry with no recorded position, e.g. from a raw sector
    /// scan.
    pub(super) fn parse_raw(bytes: &[u8]) -> DirectoryEntry {
        Self::parse(bytes, None)
    }

    #[cfg(test)]
    fn from_bytes(bytes: &[u8]) -> DirectoryEntry {
        Self::parse(bytes, None)
    }

    fn from_positioned_bytes(bytes: &[u8], position: Position) -> DirectoryEntry {
        Self::parse(bytes, Some(position))
    }

    fn parse(bytes: &[u8], position: Option<Position>) -> DirectoryEntry {
        assert_eq!(bytes.len(), ENTRY_SIZE);

        let file_attributes = FileAttributes::from_byte(bytes[ENTRY_FILE_ATTRIBUTE_OFFSET]);
        let relative = file_attributes.file_type == FileType::REL;
        let extra = Extra::from_bytes(
            relative,
            &bytes[ENTRY_EXTRA_OFFSET..ENTRY_EXTRA_OFFSET + EXTRA_SIZE],
        );

        DirectoryEntry {
            file_attributes,
            first_sector: Location::from_bytes(&bytes[ENTRY_FIRST_SECTOR_OFFSET..]),
            filename: Petscii::from_padded_bytes(
                &bytes[ENTRY_FILENAME_OFFSET..ENTRY_FILENAME_OFFSET + ENTRY_FILENAME_LENGTH],
                PADDING_BYTE,
            ),
            extra,
            file_size: ((bytes[ENTRY_FILE_SIZE_OFFSET + 1] as u16) << 8)
                | (bytes[ENTRY_FILE_SIZE_OFFSET] as u16),
            position,
        }
    }

    /// Reset all fields to default values, in preparation for a fresh
    /// entry.  The position field is left untouched.
    pub(super) fn reset(&mut self) {
        self.file_attributes = FileAttributes::from_byte(0);
        self.first_sector = Location::new(0, 0);
        self.filename = Petscii::from_bytes(&[]);
        self.extra = Extra::default();
        self.file_size = 0;
    }

    /// Re-read our fields from the serialized form.  This is useful when
    /// reading an updated version of the same entry.
    fn reread_from_bytes(&mut self, bytes: &[u8]) {
        let mut entry = DirectoryEntry::parse(bytes, self.position);
        std::mem::swap(self, &mut entry);
    }

    /// Write the serialized directory entry to the provided mutable byte
    /// slice.  The first two bytes (the sector chain link, in entry zero)
    /// are left untouched.
    pub fn to_bytes(&self, bytes: &mut [u8]) {
        assert_eq!(bytes.len(), ENTRY_SIZE);
        bytes[ENTRY_FILE_ATTRIBUTE_OFFSET] = self.file_attributes.to_byte();
        bytes[ENTRY_FIRST_SECTOR_OFFSET] = self.first_sector.0;
        bytes[ENTRY_FIRST_SECTOR_OFFSET + 1] = self.first_sector.1;
        self.filename.write_bytes_with_padding(
            &mut bytes[ENTRY_FILENAME_OFFSET..ENTRY_FILENAME_OFFSET + ENTRY_FILENAME_LENGTH],
            PADDING_BYTE,
        );
        self.extra
            .to_bytes(&mut bytes[ENTRY_EXTRA_OFFSET..ENTRY_EXTRA_OFFSET + EXTRA_SIZE]);
        bytes[ENTRY_FILE_SIZE_OFFSET] = (self.file_size & 0xFF) as u8;
        bytes[ENTRY_FILE_SIZE_OFFSET + 1] = (self.file_size >> 8) as u8;
    }
}

impl PositionedData for DirectoryEntry {
    fn position(&self) -> io::Result<Position> {
        match self.position {
            Some(p) => Ok(p),
            None => Err(DiskError::IoError.into()),
        }
    }

    fn positioned_read(&mut self, buffer: &[u8]) -> io::Result<()> {
        let position = self.position()?;
        if buffer.len() < position.size as usize {
            return Err(DiskError::IoError.into());
        }
        self.reread_from_bytes(buffer);
        Ok(())
    }

    fn positioned_write(&self, buffer: &mut [u8]) -> io::Result<()> {
        let position = self.position()?;
        if buffer.len() < position.size as usize {
            return Err(DiskError::IoError.into());
        }
        self.to_bytes(buffer);
        Ok(())
    }
}

impl fmt::Display for DirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:<4} {:18}{}",
            self.file_size,
            format!("\"{}\"", self.filename),
            self.file_attributes
        )?;
        if f.alternate() {
            // verbose
            write!(f, " {:?}", self.extra)?;
        }
        Ok(())
    }
}

impl fmt::Debug for DirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?},{},{:?} @ {:?}",
            self.filename, self.file_size, self.file_attributes, self.position
        )
    }
}

/// This iterator processes the entire directory of a disk image and yields
/// the live entries.
pub struct DirectoryIterator {
    block_iter: ChainIterator,
    chunks: std::vec::IntoIter<Vec<u8>>,
    position: Position,
    error: Option<io::Error>,
}

impl DirectoryIterator {
    pub(super) fn new(disk: &D64) -> DirectoryIterator {
        let location = disk.layout().first_directory_location();
        DirectoryIterator {
            block_iter: ChainIterator::new(disk.blocks(), location),
            chunks: vec![].into_iter(), // Arrange to fetch a block on the first call.
            position: Position {
                location,
                offset: 0,
                size: ENTRY_SIZE as u8,
            },
            error: None,
        }
    }
}

impl Iterator for DirectoryIterator {
    type Item = io::Result<DirectoryEntry>;

    fn next(&mut self) -> Option<io::Result<DirectoryEntry>> {
        // Return any pending error, if present.
        if let Some(e) = self.error.take() {
            return Some(Err(e));
        }

        loop {
            match self.chunks.next() {
                Some(chunk) => {
                    if chunk.len() != ENTRY_SIZE {
                        continue;
                    }

                    // Track the position of this entry.  The offset wraps
                    // back to 0x00 when processing the last entry in a
                    // sector.
                    let entry_position = self.position;
                    self.position.offset = self.position.offset.wrapping_add(ENTRY_SIZE as u8);

                    let entry = DirectoryEntry::from_positioned_bytes(&chunk, entry_position);
                    if !entry.file_attributes.is_live() {
                        continue;
                    }
                    return Some(Ok(entry));
                }
                None => match self.block_iter.next() {
                    Some(Ok(block)) => {
                        let chunks: Vec<Vec<u8>> = block
                            .data
                            .chunks(ENTRY_SIZE)
                            .map(|chunk| chunk.to_vec())
                            .collect();
                        self.chunks = chunks.into_iter();
                        self.position.location = block.location;
                        self.position.offset = 0;
                        // Loop back to process the first chunk.
                    }
                    Some(Err(e)) => {
                        return Some(Err(e));
                    }
                    None => {
                        return None;
                    }
                },
            }
        }
    }
}

/// Return a `DirectoryEntry` representing the next free slot on the
/// directory track.  Free slots are reused before the chain is extended
/// with a freshly allocated directory sector.
pub(super) fn next_free_directory_entry(disk: &mut D64) -> io::Result<DirectoryEntry> {
    let first_sector = disk.layout().first_directory_location();
    let mut last_sector: Location = first_sector;

    // Search the existing directory chain for a free slot.
    {
        let chain = ChainIterator::new(disk.blocks(), first_sector);
        for chain_block in chain {
            let ChainSector { data, location } = chain_block?;
            last_sector = location;
            let mut offset: u8 = 0;
            for chunk in data.chunks(ENTRY_SIZE) {
                if chunk.len() == ENTRY_SIZE {
                    let entry = DirectoryEntry::from_positioned_bytes(
                        chunk,
                        Position {
                            location,
                            offset,
                            size: ENTRY_SIZE as u8,
                        },
                    );
                    if entry.file_attributes.is_free_slot() {
                        return Ok(entry);
                    }
                }
                offset = offset.wrapping_add(ENTRY_SIZE as u8);
            }
        }
    }

    // No free slots are available in the currently allocated directory
    // sectors, so we need to create a new one and link to it from the last
    // found sector.
    let bam = disk.bam();
    let new_sector = {
        let bam = bam.borrow();
        match alloc::next_directory_sector(disk.layout(), &bam, last_sector) {
            Ok(location) => location,
            Err(ref e) if *e == DiskError::DiskFull => {
                return Err(DiskError::DirectoryFull.into())
            }
            Err(e) => return Err(e),
        }
    };

    // Write the new directory sector
    let new_entry;
    {
        let blocks = disk.blocks();
        let mut blocks = blocks.borrow_mut();
        let block = blocks.sector_mut(new_sector)?;
        // The link (0x00,0xFF) indicates that this is the last sector in
        // the chain, used in its entirety.
        block[0] = 0x00;
        block[1] = 0xFF;
        for offset in 2..BLOCK_SIZE {
            block[offset] = 0;
        }
        new_entry = DirectoryEntry::from_positioned_bytes(
            &block[0..ENTRY_SIZE],
            Position {
                location: new_sector,
                offset: 0,
                size: ENTRY_SIZE as u8,
            },
        );
    }

    // Allocate the new sector in BAM
    bam.borrow_mut().allocate(new_sector)?;

    // Link to the new sector from the old sector
    {
        let blocks = disk.blocks();
        let mut blocks = blocks.borrow_mut();
        let block = blocks.sector_mut(last_sector)?;
        block[0] = new_sector.0;
        block[1] = new_sector.1;
    }

    Ok(new_entry)
}

/// Rewrite the directory chain so the provided entries occupy consecutive
/// slots from (18,1) slot 0.  Surplus directory sectors are released, and
/// the chain is re-extended sector by sector as slots fill.  Entry bytes
/// other than the slot position are preserved.
pub(super) fn rewrite_directory(disk: &mut D64, entries: &[DirectoryEntry]) -> io::Result<()> {
    let layout = disk.layout();
    let blocks = disk.blocks();
    let bam = disk.bam();
    let first = layout.first_directory_location();

    // Release every chain sector beyond the first.
    let old_locations = ChainIterator::new(blocks.clone(), first).locations()?;
    {
        let mut bam = bam.borrow_mut();
        for location in old_locations.iter().skip(1) {
            bam.free(*location)?;
        }
    }

    // Reset the first directory sector to an empty tail.
    {
        let mut blocks = blocks.borrow_mut();
        let block = blocks.sector_mut(first)?;
        for b in block.iter_mut() {
            *b = 0;
        }
        block[1] = 0xFF;
    }

    let mut current = first;
    for (i, entry) in entries.iter().enumerate() {
        let slot = i % ENTRIES_PER_SECTOR;
        if slot == 0 && i != 0 {
            // This sector is full; chain a fresh one.
            let next = {
                let bam = bam.borrow();
                match alloc::next_directory_sector(layout, &bam, current) {
                    Ok(location) => location,
                    Err(ref e) if *e == DiskError::DiskFull => {
                        return Err(DiskError::DirectoryFull.into())
                    }
                    Err(e) => return Err(e),
                }
            };
            bam.borrow_mut().allocate(next)?;
            let mut blocks = blocks.borrow_mut();
            {
                let block = blocks.sector_mut(next)?;
                for b in block.iter_mut() {
                    *b = 0;
                }
                block[1] = 0xFF;
            }
            {
                let block = blocks.sector_mut(current)?;
                block[0] = next.0;
                block[1] = next.1;
            }
            current = next;
        }

        let mut blocks = blocks.borrow_mut();
        let block = blocks.sector_mut(current)?;
        let offset = slot * ENTRY_SIZE;
        entry.to_bytes(&mut block[offset..offset + ENTRY_SIZE]);
    }

    bam.borrow_mut().flush()?;
    Ok(())
}

/// Pack the live directory entries contiguously from the head of the
/// directory chain, releasing unused trailing directory sectors.
pub(super) fn compact(disk: &mut D64) -> io::Result<()> {
    let entries = disk.directory()?;
    rewrite_directory(disk, &entries)
}

/// Rebuild the directory chain so entries named in `order` come first (in
/// list order), followed by the remaining live entries in their original
/// relative order.  Names not present on the disk are ignored.
pub(super) fn reorder(disk: &mut D64, order: &[Petscii]) -> io::Result<()> {
    let mut remaining = disk.directory()?;
    let mut ordered = Vec::with_capacity(remaining.len());
    for name in order {
        let padded = name.to_padded_name();
        if let Some(index) = remaining
            .iter()
            .position(|e| e.filename.to_padded_name() == padded)
        {
            ordered.push(remaining.remove(index));
        }
    }
    ordered.append(&mut remaining);
    rewrite_directory(disk, &ordered)
}
