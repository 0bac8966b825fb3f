use std::cell::RefCell;
use std::fmt;
use std::io;
use std::rc::Rc;

use crate::disk::error::DiskError;
use crate::disk::geometry::Geometry;
use crate::disk::image::Image;

pub const BLOCK_SIZE: usize = 256;

pub type BlockDeviceRef = Rc<RefCell<BlockDevice>>;

/// A `BlockDevice` divides an image into 256-byte sectors addressed by
/// track and sector according to a `Geometry`.
#[derive(Debug)]
pub struct BlockDevice {
    image: Image,
    geometry: &'static Geometry,
}

impl BlockDevice {
    pub fn new(image: Image, geometry: &'static Geometry) -> BlockDevice {
        BlockDevice { image, geometry }
    }

    #[inline]
    pub fn geometry(&self) -> &'static Geometry {
        self.geometry
    }

    pub fn get_offset(&self, location: Location) -> io::Result<usize> {
        let track = location.0 as usize;
        let sector = location.1;
        if track < 1 || track > (self.geometry.tracks as usize) {
            return Err(DiskError::InvalidTrackSector.into());
        }
        if sector >= self.geometry.track_layouts[track].sectors {
            return Err(DiskError::InvalidTrackSector.into());
        }
        let offset = self.geometry.track_layouts[track].byte_offset as usize
            + sector as usize * BLOCK_SIZE;
        Ok(offset)
    }

    #[inline]
    pub fn check_writability(&self) -> io::Result<()> {
        self.image.check_writability()
    }

    pub fn sector(&self, location: Location) -> io::Result<&[u8]> {
        let offset = self.get_offset(location)?;
        self.image.slice(offset, BLOCK_SIZE)
    }

    pub fn sector_mut(&mut self, location: Location) -> io::Result<&mut [u8]> {
        self.image.check_writability()?;
        let offset = self.get_offset(location)?;
        self.image.slice_mut(offset, BLOCK_SIZE)
    }

    pub fn sector_owned(&self, location: Location) -> io::Result<Vec<u8>> {
        Ok(self.sector(location)?.to_owned())
    }

    pub fn read_position<'a>(&'a self, position: &Position) -> io::Result<&'a [u8]> {
        let block = self.sector(position.location)?;
        Ok(&block[position.offset as usize..position.offset as usize + position.size as usize])
    }

    pub fn positioned_read(&self, positioned_data: &mut dyn PositionedData) -> io::Result<()> {
        let position = positioned_data.position()?;
        let block = self.sector(position.location)?;
        positioned_data.positioned_read(
            &block[position.offset as usize..position.offset as usize + position.size as usize],
        )?;
        Ok(())
    }

    pub fn positioned_write(&mut self, positioned_data: &dyn PositionedData) -> io::Result<()> {
        let position = positioned_data.position()?;
        let block = self.sector_mut(position.location)?;
        positioned_data.positioned_write(
            &mut block[position.offset as usize..position.offset as usize + position.size as usize],
        )?;
        Ok(())
    }

    /// Copy the full image contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.image.to_vec()
    }

    /// Overwrite the image contents from a snapshot.
    pub fn restore(&mut self, snapshot: &[u8]) -> io::Result<()> {
        self.image.restore(snapshot)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match self.image {
            Image::Memory(_) => Ok(()),
            _ => self.image.flush(),
        }
    }
}

/// Track and sector coordinates.  Tracks are numbered from 1, sectors from 0.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord)]
pub struct Location(pub u8, pub u8);

impl Location {
    #[inline]
    pub fn new(track: u8, sector: u8) -> Location {
        Location(track, sector)
    }

    pub fn from_bytes(bytes: &[u8]) -> Location {
        assert!(bytes.len() >= 2);
        Location(bytes[0], bytes[1])
    }

    pub fn write_bytes(&self, bytes: &mut [u8]) {
        assert!(bytes.len() >= 2);
        bytes[0] = self.0;
        bytes[1] = self.1;
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{})", self.0, self.1)
    }
}

/// A byte range within a specific sector.
#[derive(Clone, Copy, Debug)]
pub struct Position {
    pub location: Location,
    pub offset: u8,
    pub size: u8,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "({},{}@0x{:02x})",
            self.location.0, self.location.1, self.offset
        )
    }
}

/// Data structures that know their own on-disk position implement this trait
/// so they can be re-read and re-written in place.
pub trait PositionedData {
    fn position(&self) -> io::Result<Position>;
    fn positioned_read(&mut self, buffer: &[u8]) -> io::Result<()>;
    fn positioned_write(&self, buffer: &mut [u8]) -> io::Result<()>;
}

/// Iterate every location of a geometry in track-then-sector order.
pub struct LocationIterator {
    last_track: u8,
    tracks: &'static [crate::disk::geometry::Track],
    next: Option<Location>,
}

impl LocationIterator {
    pub fn from_geometry(geometry: &Geometry) -> LocationIterator {
        const FIRST_TRACK: u8 = 1;
        LocationIterator {
            last_track: geometry.tracks,
            tracks: geometry.track_layouts,
            next: Some(Location::new(FIRST_TRACK, 0)),
        }
    }
}

impl Iterator for LocationIterator {
    type Item = Location;

    fn next(&mut self) -> Option<Location> {
        let location = self.next?;

        let mut next_location = location;
        next_location.1 += 1;
        if next_location.1 >= self.tracks[next_location.0 as usize].sectors {
            next_location.0 += 1;
            next_location.1 = 0;
            if next_location.0 > self.last_track {
                self.next = None;
                return Some(location);
            }
        }
        self.next = Some(next_location);
        Some(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::geometry::GEOMETRY_35;

    #[test]
    fn test_offsets() {
        let device = BlockDevice::new(Image::open_memory(GEOMETRY_35.size()), &GEOMETRY_35);
        assert_eq!(device.get_offset(Location(1, 0)).unwrap(), 0);
        assert_eq!(device.get_offset(Location(18, 0)).unwrap(), 0x16500);
        assert_eq!(device.get_offset(Location(18, 1)).unwrap(), 0x16600);
        assert_eq!(device.get_offset(Location(35, 16)).unwrap(), 0x29A00 + 16 * 256);
        assert!(device.get_offset(Location(0, 0)).is_err());
        assert!(device.get_offset(Location(36, 0)).is_err());
        assert!(device.get_offset(Location(1, 21)).is_err());
    }

    #[test]
    fn test_location_iterator_covers_disk() {
        let count = LocationIterator::from_geometry(&GEOMETRY_35).count();
        assert_eq!(count, 683);
    }
}
