//! The Block Availability Map.
//!
//! The 1541 BAM lives in sector (18,0): one four-byte entry per track for
//! tracks 1..=35 starting at offset 0x04, each holding a free-sector count
//! followed by a three-byte bitmap.  Bit `s % 8` of bitmap byte `s / 8`
//! corresponds to sector `s`; a set bit means the sector is free.  40-track
//! images carry entries for tracks 36..=40 in a second region of the same
//! sector.

use std::cell::RefCell;
use std::fmt;
use std::fmt::Write;
use std::io;
use std::rc::Rc;

use crate::disk::block::{BlockDeviceRef, Location};
use crate::disk::error::DiskError;
use crate::disk::geometry::DiskLayout;

/// A BamFormat describes where BAM entries are stored on the disk.
#[derive(Debug)]
pub struct BamFormat {
    /// The list of sections where BAM entries are stored.
    pub sections: &'static [BamSection],
}

impl BamFormat {
    pub(crate) fn tracks(&self) -> usize {
        self.sections.iter().map(|s| s.tracks).sum()
    }
}

/// BAM entries are stored in one or more sections, each covering a
/// contiguous range of tracks.  The standard 35 tracks live in one section;
/// the 40-track extension adds a second.
#[derive(Debug)]
pub struct BamSection {
    /// The track and sector where this section's bitmaps are stored.
    pub bitmap_location: Location,
    /// The offset within the block where bitmaps start.
    pub bitmap_offset: usize,
    /// The size in bytes of each bitmap.
    pub bitmap_size: usize,
    /// How many bytes apart the bitmaps are.  (4 on the 1541: we skip over
    /// the free-count byte when reading the bitmap.)
    pub bitmap_stride: usize,
    /// The track and sector where this section's free sector counts are stored.
    pub free_location: Location,
    /// The offset within the block where free counts start.
    pub free_offset: usize,
    /// How many bytes apart the free sector counts are.
    pub free_stride: usize,
    /// The total number of tracks (and hence entries) in this section.
    pub tracks: usize,
}

/// A BamWriter renders BAM entries onto the disk image according to the
/// provided BamFormat.
#[derive(Debug)]
struct BamWriter {
    blocks: BlockDeviceRef,
    format: &'static BamFormat,
}

impl BamWriter {
    fn new(blocks: BlockDeviceRef, format: &'static BamFormat) -> BamWriter {
        BamWriter { blocks, format }
    }

    fn write(&mut self, entries: &[BamEntry]) -> io::Result<()> {
        let mut previous_tracks = 0; // tracks handled in previous sections.
        for section in self.format.sections {
            let mut block = self
                .blocks
                .borrow()
                .sector(section.bitmap_location)?
                .to_vec();

            // Render our BAM bitmaps into the block
            for i in 0..section.tracks {
                let offset = section.bitmap_offset + i * section.bitmap_stride;
                entries[previous_tracks + i]
                    .write_bitmap(&mut block[offset..offset + section.bitmap_size]);
            }

            // Render our BAM free sector counts into the block.  (On the
            // 1541 the counts live in the same block as the bitmaps.)
            for i in 0..section.tracks {
                let offset = section.free_offset + i * section.free_stride;
                block[offset] = entries[previous_tracks + i].free_sectors;
            }

            self.blocks
                .borrow_mut()
                .sector_mut(section.free_location)?
                .copy_from_slice(&block);

            previous_tracks += section.tracks;
        }
        Ok(())
    }
}

/// The in-memory BAM state for a single track.
#[derive(Clone, Copy, Debug, Default)]
pub struct BamEntry {
    free_sectors: u8,
    sector_map: u32,
    sectors: u8,
}

impl BamEntry {
    /// A fresh entry with every valid sector free.
    pub fn new(sectors: u8) -> BamEntry {
        let mut map = 0;
        for _ in 0..sectors {
            map = (map << 1) | 1;
        }
        BamEntry {
            free_sectors: sectors,
            sector_map: map,
            sectors,
        }
    }

    pub fn from_bytes(free_sectors: u8, bitmap: &[u8], sectors: u8) -> BamEntry {
        // Assemble the LSB-first bitmap bytes into a single bitmap word.
        let mut sector_map: u32 = 0;
        for i in 0..bitmap.len() {
            let byte = bitmap.len() - i - 1;
            sector_map = (sector_map << 8) | bitmap[byte] as u32;
        }

        BamEntry {
            free_sectors,
            sector_map,
            sectors,
        }
    }

    pub fn write_bitmap(&self, bitmap: &mut [u8]) {
        let mut sector_map = self.sector_map;
        for output_byte_ref in bitmap.iter_mut() {
            *output_byte_ref = (sector_map & 0xFF) as u8;
            sector_map >>= 8;
        }
    }

    #[inline]
    pub fn has_availability(&self) -> bool {
        self.free_sectors > 0
    }

    #[inline]
    pub fn free_sectors(&self) -> u8 {
        self.free_sectors
    }

    #[inline]
    pub fn sector_map(&self) -> u32 {
        self.sector_map
    }

    #[inline]
    pub fn is_free(&self, sector: u8) -> bool {
        (self.sector_map >> sector) & 1 == 1
    }

    #[inline]
    pub fn allocate(&mut self, sector: u8) {
        self.sector_map &= !(1u32 << sector);
        self.recount();
    }

    #[inline]
    pub fn free(&mut self, sector: u8) {
        self.sector_map |= 1u32 << sector;
        self.recount();
    }

    /// The popcount of the bitmap restricted to valid sector indices.  The
    /// stored free count must always agree with this.
    pub fn counted_free(&self) -> u8 {
        let valid = (self.sector_map) & ((1u32 << self.sectors) - 1);
        valid.count_ones() as u8
    }

    /// Restore the free-count invariant from the bitmap.
    pub fn recount(&mut self) {
        self.free_sectors = self.counted_free();
    }

    /// Overwrite the stored free count, breaking the invariant.  Exists for
    /// tests that need to fabricate corrupt BAMs.
    #[cfg(test)]
    pub(crate) fn set_free_sectors_raw(&mut self, count: u8) {
        self.free_sectors = count;
    }
}

pub type BamRef = Rc<RefCell<Bam>>;

pub struct Bam {
    writer: BamWriter,
    layout: &'static DiskLayout,
    entries: Vec<BamEntry>,
}

impl Bam {
    /// A fresh BAM with every sector free.  (System sectors are allocated
    /// separately during formatting.)
    pub fn new(blocks: BlockDeviceRef, layout: &'static DiskLayout) -> Bam {
        let mut entries = vec![];
        for track in 1..=layout.bam.tracks() {
            entries.push(BamEntry::new(layout.tracks[track].sectors));
        }
        Bam {
            writer: BamWriter::new(blocks, layout.bam),
            layout,
            entries,
        }
    }

    /// Read the BAM from the image.
    pub fn read(blocks: BlockDeviceRef, layout: &'static DiskLayout) -> io::Result<Bam> {
        let mut entries = Vec::with_capacity(layout.bam.tracks());
        {
            let device = blocks.borrow();
            let mut previous_tracks = 0usize;
            for section in layout.bam.sections {
                let block = device.sector(section.free_location)?;
                for i in 0..section.tracks {
                    let free_sector_count = block[section.free_offset + i * section.free_stride];
                    let offset = section.bitmap_offset + i * section.bitmap_stride;
                    let track = previous_tracks + i + 1;
                    entries.push(BamEntry::from_bytes(
                        free_sector_count,
                        &block[offset..offset + section.bitmap_size],
                        layout.tracks[track].sectors,
                    ));
                }
                previous_tracks += section.tracks;
            }
        }

        Ok(Bam {
            writer: BamWriter::new(blocks, layout.bam),
            layout,
            entries,
        })
    }

    /// Replace this BAM's contents.  Holders of the shared `BamRef` keep
    /// working against the new state.
    pub fn replace_with(&mut self, other: Bam) {
        self.entries = other.entries;
    }

    fn check_track(&self, track: u8) -> io::Result<()> {
        if track < 1 || track > self.layout.last_track {
            return Err(DiskError::InvalidTrackSector.into());
        }
        Ok(())
    }

    fn check_location(&self, location: Location) -> io::Result<()> {
        self.check_track(location.0)?;
        if location.1 >= self.layout.sectors_in_track(location.0) {
            return Err(DiskError::InvalidTrackSector.into());
        }
        Ok(())
    }

    pub fn entry(&self, track: u8) -> io::Result<&BamEntry> {
        self.check_track(track)?;
        Ok(&self.entries[(track - 1) as usize])
    }

    pub fn entry_mut(&mut self, track: u8) -> io::Result<&mut BamEntry> {
        self.check_track(track)?;
        Ok(&mut self.entries[(track - 1) as usize])
    }

    pub fn is_free(&self, location: Location) -> io::Result<bool> {
        self.check_location(location)?;
        Ok(self.entry(location.0)?.is_free(location.1))
    }

    pub fn allocate(&mut self, location: Location) -> io::Result<()> {
        self.check_location(location)?;
        self.entry_mut(location.0)?.allocate(location.1);
        Ok(())
    }

    pub fn free(&mut self, location: Location) -> io::Result<()> {
        self.check_location(location)?;
        self.entry_mut(location.0)?.free(location.1);
        Ok(())
    }

    /// Return the blocks free sans the directory track.  This is the
    /// "blocks free" figure at the bottom of a directory listing, and the
    /// figure file writes are checked against: 664 on a fresh 35-track
    /// disk.
    pub fn blocks_free(&self) -> usize {
        let mut blocks_free = 0usize;
        for track in 0..(self.layout.last_track as usize) {
            if track == (self.layout.directory_track - 1) as usize {
                continue;
            }
            blocks_free += self.entries[track].free_sectors as usize;
        }
        blocks_free
    }

    /// Return the free-sector total over every track, directory track
    /// included.  Equals the popcount over the union of all per-track
    /// bitmaps restricted to valid indices.
    pub fn total_free(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.free_sectors as usize)
            .sum()
    }

    /// Restore every per-track free count from its bitmap.
    pub fn rebuild_counts(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.recount();
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.write(&self.entries)
    }

    pub fn allocated_sectors(&self) -> Vec<Location> {
        let mut locations = vec![];
        for track in 0..(self.layout.last_track as usize) {
            let entry = &self.entries[track];
            for sector in 0..self.layout.tracks[track + 1].sectors {
                if !entry.is_free(sector) {
                    locations.push(Location::new(track as u8 + 1, sector));
                }
            }
        }
        locations
    }

    pub fn free_sectors(&self) -> Vec<Location> {
        let mut locations = vec![];
        for track in 0..(self.layout.last_track as usize) {
            let entry = &self.entries[track];
            for sector in 0..self.layout.tracks[track + 1].sectors {
                if entry.is_free(sector) {
                    locations.push(Location::new(track as u8 + 1, sector));
                }
            }
        }
        locations
    }
}

impl fmt::Debug for Bam {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for track in 0..(self.layout.last_track as usize) {
            write!(
                f,
                "t{:02}: [{:02}/{:02}] ",
                track + 1,
                self.entries[track].free_sectors,
                self.layout.tracks[track + 1].sectors
            )?;
            let mut map = self.entries[track].sector_map;
            for _ in 0..self.layout.tracks[track + 1].sectors {
                let c: char = if map & 1 == 1 { '.' } else { 'x' };
                f.write_char(c)?;
                map >>= 1;
            }
            f.write_char('\n')?;
        }
        writeln!(f, "{} blocks free.", self.blocks_free())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bam_entry_from_bytes() {
        let bytes: [u8; 4] = [0x12, 0xFF, 0xF9, 0x17];
        let bam_entry = BamEntry::from_bytes(bytes[0], &bytes[1..4], 21);
        assert_eq!(bam_entry.free_sectors, 0x12);
        assert_eq!(bam_entry.sector_map, 0x17F9FF);
    }

    #[test]
    fn test_bam_entry_roundtrip() {
        let entry = BamEntry::from_bytes(18, &[0xF0, 0x0F, 0x15], 21);
        let mut bitmap = [0u8; 3];
        entry.write_bitmap(&mut bitmap);
        assert_eq!(bitmap, [0xF0, 0x0F, 0x15]);
    }

    #[test]
    fn test_counted_free_masks_invalid_bits() {
        // A 17-sector track with junk bits above the valid range.
        let entry = BamEntry::from_bytes(0, &[0xFF, 0xFF, 0xFF], 17);
        assert_eq!(entry.counted_free(), 17);
    }

    #[test]
    fn test_allocate_and_free_maintain_count() {
        let mut entry = BamEntry::new(21);
        assert_eq!(entry.free_sectors, 21);
        entry.allocate(0);
        entry.allocate(10);
        assert_eq!(entry.free_sectors, 19);
        assert!(!entry.is_free(10));
        entry.free(10);
        assert_eq!(entry.free_sectors, 20);
        assert!(entry.is_free(10));
    }
}
