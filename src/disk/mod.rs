//! The 1541 disk image engine.
//!
//! Support for disk images is built using a layered scheme:
//!
//! 1. `Image` provides access to the underlying storage containing the
//!    disk image -- either a memory-mapped image file or an in-memory
//!    buffer.
//! 2. `BlockDevice` divides the image into tracks and sectors according to
//!    a `Geometry`.
//! 3. `DiskLayout` describes how CBM DOS uses the tracks and sectors to
//!    store the disk header, Block Availability Map (BAM), and directory.
//! 4. `D64` exposes the high-level operations: formatting, directory
//!    access, file reads and writes, verification and repair, directory
//!    compaction and reordering, and multi-disk backup.
//!
//! CBM DOS tracks start at 1 instead of 0, which causes no end of
//! implementation confusion.  The API provided by this crate reflects this
//! 1-based indexing.
//!
//! In the interest of providing a simple API, several components store
//! their own `Rc<RefCell<_>>` reference to the disk's block storage.  This
//! allows readers, writers, and the BAM to be in use at the same time, and
//! reduces the lifetime puzzling that callers might otherwise need to do.

mod alloc;
mod bam;
mod block;
mod chain;
mod error;
mod file;
mod geometry;
mod header;
mod image;
mod validation;

pub mod backup;
pub mod directory;

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::ops::{Index, IndexMut};
use std::path::Path;
use std::rc::Rc;

use log::debug;

use crate::disk::bam::{Bam, BamRef};
use crate::disk::block::{BlockDevice, BlockDeviceRef, LocationIterator, BLOCK_SIZE};
use crate::disk::directory::{DirectoryEntry, DirectoryIterator};
use crate::disk::geometry::{layout_for, DiskLayout, Geometry};
use crate::disk::header::Header;
use crate::disk::image::Image;
use crate::petscii::Petscii;

pub(crate) use crate::petscii::{NAME_SIZE as DISK_NAME_SIZE, PADDING_BYTE};

pub use self::bam::BamEntry;
pub use self::block::Location;
pub use self::directory::FileType;
pub use self::error::DiskError;
pub use self::validation::{Discrepancy, Verification};

/// Various fields in CBM DOS are two-byte identifiers which are frequently
/// shown as Petscii strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Id([u8; 2]);

impl Id {
    pub fn from_bytes(bytes: &[u8]) -> Id {
        // Best-effort only.  Use the first two bytes for the Id, using
        // zeros for any byte not present.
        Id([
            if !bytes.is_empty() { bytes[0] } else { 0 },
            if bytes.len() > 1 { bytes[1] } else { 0 },
        ])
    }
}

impl<'a> From<&'a str> for Id {
    fn from(string: &str) -> Id {
        Id::from_bytes(Petscii::from_str(string).as_bytes())
    }
}

impl From<Petscii> for Id {
    fn from(petscii: Petscii) -> Id {
        Id::from_bytes(petscii.as_bytes())
    }
}

impl Index<usize> for Id {
    type Output = u8;
    fn index(&self, i: usize) -> &u8 {
        &self.0[i]
    }
}

impl IndexMut<usize> for Id {
    fn index_mut(&mut self, i: usize) -> &mut u8 {
        &mut self.0[i]
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", Petscii::from_bytes(&self.0))
    }
}

/// A 1541 disk image, either 35 or 40 tracks.
#[derive(Debug)]
pub struct D64 {
    blocks: BlockDeviceRef,
    layout: &'static DiskLayout,
    header: Header,
    bam: BamRef,
}

impl D64 {
    fn new(image: Image) -> io::Result<D64> {
        // Determine the disk image geometry from its size.
        let geometry = match Geometry::find_by_size(image.len()) {
            Some(geometry) => geometry,
            None => return Err(DiskError::InvalidImageSize.into()),
        };
        let layout = layout_for(geometry);
        debug!("opening {}-track image", geometry.tracks);

        let blocks: BlockDeviceRef = Rc::new(RefCell::new(BlockDevice::new(image, geometry)));
        let header = Header::read(blocks.clone(), layout.header)?;
        let bam = Rc::new(RefCell::new(Bam::read(blocks.clone(), layout)?));
        Ok(D64 {
            blocks,
            layout,
            header,
            bam,
        })
    }

    /// Take ownership of a disk image held in a byte buffer.  The geometry
    /// is chosen from the buffer length.
    pub fn load(bytes: Vec<u8>) -> io::Result<D64> {
        Self::new(Image::from_bytes(bytes))
    }

    /// Open an existing D64 disk image file as read-only (if `writable` is
    /// false) or read-write (if `writable` is true).
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> io::Result<D64> {
        let image = if writable {
            Image::open_read_write(path)?
        } else {
            Image::open_read_only(path)?
        };
        Self::new(image)
    }

    /// Create a new D64 disk image file with the given track count (35 or
    /// 40).  The image is zero-filled and must still be formatted.
    pub fn create<P: AsRef<Path>>(path: P, tracks: u8) -> io::Result<D64> {
        let geometry = match Geometry::find_by_tracks(tracks) {
            Some(geometry) => geometry,
            None => return Err(DiskError::InvalidImageSize.into()),
        };
        Self::new(Image::create(path, geometry.size(), false)?)
    }

    /// Create a new in-memory D64 disk image with the given track count
    /// (35 or 40).
    pub fn open_memory(tracks: u8) -> io::Result<D64> {
        let geometry = match Geometry::find_by_tracks(tracks) {
            Some(geometry) => geometry,
            None => return Err(DiskError::InvalidImageSize.into()),
        };
        Self::new(Image::open_memory(geometry.size()))
    }

    /// Return the image contents, flushing file-backed storage first.
    pub fn save(&mut self) -> io::Result<Vec<u8>> {
        let mut blocks = self.blocks.borrow_mut();
        if blocks.check_writability().is_ok() {
            blocks.flush()?;
        }
        Ok(blocks.snapshot())
    }

    /// Re-read the format metadata after the underlying bytes changed.
    fn initialize(&mut self) -> io::Result<()> {
        self.header = Header::read(self.blocks.clone(), self.layout.header)?;
        let fresh = Bam::read(self.blocks.clone(), self.layout)?;
        self.bam.borrow_mut().replace_with(fresh);
        Ok(())
    }

    /// Run a mutating operation against a snapshot: if it fails, the image
    /// (and the metadata read from it) is restored, so a failed operation
    /// leaves no partial mutation behind.
    fn with_snapshot<T>(&mut self, f: impl FnOnce(&mut D64) -> io::Result<T>) -> io::Result<T> {
        let snapshot = self.blocks.borrow().snapshot();
        match f(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                let _ = self.blocks.borrow_mut().restore(&snapshot);
                let _ = self.initialize();
                Err(e)
            }
        }
    }

    /// Format the disk image: zero every sector, write a fresh header and
    /// BAM, and initialize the directory chain.
    pub fn format(&mut self, name: &Petscii, id: &Id) -> io::Result<()> {
        let layout = self.layout;

        // Zero all sectors
        {
            let geometry = self.blocks.borrow().geometry();
            for location in LocationIterator::from_geometry(geometry) {
                let mut blocks = self.blocks.borrow_mut();
                let block = blocks.sector_mut(location)?;
                for block_byte in block.iter_mut().take(BLOCK_SIZE) {
                    *block_byte = 0;
                }
            }
        }

        // Write the initial directory sector.  The link (0x00,0xFF)
        // indicates that this is the last sector in the chain, used in its
        // entirety.
        {
            let mut blocks = self.blocks.borrow_mut();
            let block = blocks.sector_mut(layout.first_directory_location())?;
            block[0] = 0x00;
            block[1] = 0xFF;
        }

        // Write a fresh header
        Header::new(layout.header, name, id).write(self.blocks.clone(), layout.header)?;

        // Write a fresh BAM with the initial allocations for this format.
        {
            let mut bam = Bam::new(self.blocks.clone(), layout);
            for location in layout.system_locations() {
                bam.allocate(location)?;
            }
            bam.flush()?;
        }

        self.initialize()
    }

    /// Return an iterator of live directory entries.
    pub fn iter(&self) -> DirectoryIterator {
        DirectoryIterator::new(self)
    }

    /// Return a list of all live directory entries.
    pub fn directory(&self) -> io::Result<Vec<DirectoryEntry>> {
        self.iter().collect::<io::Result<Vec<_>>>()
    }

    /// Locate a directory entry based on its filename.  Matching is
    /// byte-exact on the padded 16-byte form.
    pub fn find_directory_entry(&self, filename: &Petscii) -> io::Result<DirectoryEntry> {
        let padded = filename.to_padded_name();
        self.iter()
            .find(|x| match x {
                Err(_) => true,
                Ok(ref entry) => entry.filename.to_padded_name() == padded,
            })
            .unwrap_or_else(|| Err(DiskError::NotFound.into()))
    }

    /// Add a sequential (PRG, SEQ, or USR) file.  REL files are rejected;
    /// use `add_rel_file`.
    pub fn add_file(&mut self, name: &Petscii, file_type: FileType, data: &[u8]) -> io::Result<()> {
        self.with_snapshot(|disk| file::add_file(disk, name, file_type, data))
    }

    /// Add a relative (REL) file with the given record size (2..=254).
    pub fn add_rel_file(&mut self, name: &Petscii, record_size: u8, data: &[u8]) -> io::Result<()> {
        self.with_snapshot(|disk| file::add_rel_file(disk, name, record_size, data))
    }

    /// Read a file's payload.
    pub fn extract_file(&self, name: &Petscii) -> io::Result<Vec<u8>> {
        file::extract_file(self, name)
    }

    /// Remove a file, releasing its sectors and clearing its directory
    /// entry's type byte.
    pub fn remove_file(&mut self, name: &Petscii) -> io::Result<()> {
        self.with_snapshot(|disk| file::remove_file(disk, name))
    }

    /// Rename a file.
    pub fn rename_file(&mut self, original: &Petscii, new: &Petscii) -> io::Result<()> {
        let mut entry = self.find_directory_entry(original)?;
        match self.find_directory_entry(new) {
            Ok(_) => return Err(DiskError::Duplicate.into()),
            Err(ref e) if *e == DiskError::NotFound => {}
            Err(e) => return Err(e),
        }
        entry.filename = new.clone();
        self.blocks.borrow_mut().positioned_write(&entry)?;
        Ok(())
    }

    /// Set or clear a file's locked flag.  The flag is advisory: it marks
    /// the entry with "<" in listings, and front ends are expected to
    /// refuse removal and renaming of locked files.
    pub fn set_locked(&mut self, name: &Petscii, locked: bool) -> io::Result<()> {
        let mut entry = self.find_directory_entry(name)?;
        entry.file_attributes.locked_flag = locked;
        self.blocks.borrow_mut().positioned_write(&entry)?;
        Ok(())
    }

    /// Rename the disk itself.
    pub fn rename_disk(&mut self, name: &Petscii) -> io::Result<()> {
        self.header.disk_name = name.clone();
        self.header.write(self.blocks.clone(), self.layout.header)
    }

    /// Return the name of this disk as found in the disk header.
    pub fn disk_name(&self) -> &Petscii {
        &self.header.disk_name
    }

    /// Return the disk header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Check the consistency of the image: every sector allocated in the
    /// BAM must be reachable from exactly one chain and vice versa, and
    /// the per-track free counts must match the bitmaps.  With `fix` set,
    /// repairs are applied.
    pub fn verify(&mut self, fix: bool) -> io::Result<Verification> {
        if fix {
            self.with_snapshot(|disk| validation::verify(disk, true))
        } else {
            validation::verify(self, false)
        }
    }

    /// Pack the live directory entries contiguously from the head of the
    /// directory chain, releasing unused trailing directory sectors.
    pub fn compact_directory(&mut self) -> io::Result<()> {
        self.with_snapshot(directory::compact)
    }

    /// Rebuild the directory so entries named in `order` come first, in
    /// list order, followed by the remaining entries in their original
    /// relative order.  Names not present on the disk are ignored.
    pub fn reorder_directory(&mut self, order: &[Petscii]) -> io::Result<()> {
        self.with_snapshot(|disk| directory::reorder(disk, order))
    }

    /// Read a specific 256-byte sector.
    pub fn read_sector(&self, track: u8, sector: u8) -> io::Result<Vec<u8>> {
        self.blocks.borrow().sector_owned(Location(track, sector))
    }

    /// Overwrite a specific 256-byte sector.
    pub fn write_sector(&mut self, track: u8, sector: u8, data: &[u8]) -> io::Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(DiskError::IoError.into());
        }
        let mut blocks = self.blocks.borrow_mut();
        let block = blocks.sector_mut(Location(track, sector))?;
        block.copy_from_slice(data);
        Ok(())
    }

    /// Return the blocks free based on the BAM free sector counts, sans
    /// the directory track -- the "blocks free" figure of a directory
    /// listing.
    pub fn free_sector_count(&self) -> usize {
        self.bam.borrow().blocks_free()
    }

    /// Return one track's BAM state: the free count and bitmap.
    pub fn bam_track(&self, track: u8) -> io::Result<BamEntry> {
        Ok(*self.bam.borrow().entry(track)?)
    }

    /// The number of tracks in this image (35 or 40).
    pub fn tracks(&self) -> u8 {
        self.blocks.borrow().geometry().tracks
    }

    /// The number of sectors in the given track.
    pub fn sectors_in_track(&self, track: u8) -> io::Result<u8> {
        if track < 1 || track > self.layout.last_track {
            return Err(DiskError::InvalidTrackSector.into());
        }
        Ok(self.layout.sectors_in_track(track))
    }

    pub(crate) fn blocks(&self) -> BlockDeviceRef {
        self.blocks.clone()
    }

    pub(crate) fn bam(&self) -> BamRef {
        self.bam.clone()
    }

    pub(crate) fn layout(&self) -> &'static DiskLayout {
        self.layout
    }
}

impl fmt::Display for D64 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} \"{:16}\" {} {}",
            0, self.header.disk_name, self.header.disk_id, self.header.dos_type,
        )
    }
}

impl<'a> IntoIterator for &'a D64 {
    type Item = io::Result<DirectoryEntry>;
    type IntoIter = DirectoryIterator;

    fn into_iter(self) -> Self::IntoIter {
        DirectoryIterator::new(self)
    }
}
