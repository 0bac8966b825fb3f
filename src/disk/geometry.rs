//! Track layout tables and disk geometry for 1541 (D64) images.
//!
//! The 1541 records a variable number of sectors per track, so track/sector
//! coordinates map to byte offsets through a precomputed prefix-sum table.
//! D64 images come in two sizes: the standard 35-track image (174,848 bytes)
//! and the 40-track extension (196,608 bytes).

use crate::disk::bam::{BamFormat, BamSection};
use crate::disk::block::{Location, BLOCK_SIZE};
use crate::disk::header::HeaderFormat;

/// Per-track layout parameters.
#[derive(Debug)]
pub struct Track {
    pub sectors: u8,
    pub sector_offset: u16,
    pub byte_offset: u32,
}

#[rustfmt::skip]
pub(crate) static TRACKS: [Track; 41] = [
    Track { sectors: 0,  sector_offset: 0,   byte_offset: 0, }, // There is no track 0.
    Track { sectors: 21, sector_offset: 0,   byte_offset: 0x00000, }, // 1
    Track { sectors: 21, sector_offset: 21,  byte_offset: 0x01500, }, // 2
    Track { sectors: 21, sector_offset: 42,  byte_offset: 0x02A00, }, // 3
    Track { sectors: 21, sector_offset: 63,  byte_offset: 0x03F00, }, // 4
    Track { sectors: 21, sector_offset: 84,  byte_offset: 0x05400, }, // 5
    Track { sectors: 21, sector_offset: 105, byte_offset: 0x06900, }, // 6
    Track { sectors: 21, sector_offset: 126, byte_offset: 0x07E00, }, // 7
    Track { sectors: 21, sector_offset: 147, byte_offset: 0x09300, }, // 8
    Track { sectors: 21, sector_offset: 168, byte_offset: 0x0A800, }, // 9
    Track { sectors: 21, sector_offset: 189, byte_offset: 0x0BD00, }, // 10
    Track { sectors: 21, sector_offset: 210, byte_offset: 0x0D200, }, // 11
    Track { sectors: 21, sector_offset: 231, byte_offset: 0x0E700, }, // 12
    Track { sectors: 21, sector_offset: 252, byte_offset: 0x0FC00, }, // 13
    Track { sectors: 21, sector_offset: 273, byte_offset: 0x11100, }, // 14
    Track { sectors: 21, sector_offset: 294, byte_offset: 0x12600, }, // 15
    Track { sectors: 21, sector_offset: 315, byte_offset: 0x13B00, }, // 16
    Track { sectors: 21, sector_offset: 336, byte_offset: 0x15000, }, // 17
    Track { sectors: 19, sector_offset: 357, byte_offset: 0x16500, }, // 18
    Track { sectors: 19, sector_offset: 376, byte_offset: 0x17800, }, // 19
    Track { sectors: 19, sector_offset: 395, byte_offset: 0x18B00, }, // 20
    Track { sectors: 19, sector_offset: 414, byte_offset: 0x19E00, }, // 21
    Track { sectors: 19, sector_offset: 433, byte_offset: 0x1B100, }, // 22
    Track { sectors: 19, sector_offset: 452, byte_offset: 0x1C400, }, // 23
    Track { sectors: 19, sector_offset: 471, byte_offset: 0x1D700, }, // 24
    Track { sectors: 18, sector_offset: 490, byte_offset: 0x1EA00, }, // 25
    Track { sectors: 18, sector_offset: 508, byte_offset: 0x1FC00, }, // 26
    Track { sectors: 18, sector_offset: 526, byte_offset: 0x20E00, }, // 27
    Track { sectors: 18, sector_offset: 544, byte_offset: 0x22000, }, // 28
    Track { sectors: 18, sector_offset: 562, byte_offset: 0x23200, }, // 29
    Track { sectors: 18, sector_offset: 580, byte_offset: 0x24400, }, // 30
    Track { sectors: 17, sector_offset: 598, byte_offset: 0x25600, }, // 31
    Track { sectors: 17, sector_offset: 615, byte_offset: 0x26700, }, // 32
    Track { sectors: 17, sector_offset: 632, byte_offset: 0x27800, }, // 33
    Track { sectors: 17, sector_offset: 649, byte_offset: 0x28900, }, // 34
    Track { sectors: 17, sector_offset: 666, byte_offset: 0x29A00, }, // 35
    Track { sectors: 17, sector_offset: 683, byte_offset: 0x2AB00, }, // 36
    Track { sectors: 17, sector_offset: 700, byte_offset: 0x2BC00, }, // 37
    Track { sectors: 17, sector_offset: 717, byte_offset: 0x2CD00, }, // 38
    Track { sectors: 17, sector_offset: 734, byte_offset: 0x2DE00, }, // 39
    Track { sectors: 17, sector_offset: 751, byte_offset: 0x2EF00, }, // 40
];

/// A `Geometry` specifies the track and sector layout of a disk image.
#[derive(Copy, Clone)]
#[derive(Debug)]
pub struct Geometry {
    pub(crate) track_layouts: &'static [Track],
    pub tracks: u8,
}

pub(crate) static GEOMETRY_35: Geometry = Geometry {
    track_layouts: &TRACKS,
    tracks: 35,
};

pub(crate) static GEOMETRY_40: Geometry = Geometry {
    track_layouts: &TRACKS,
    tracks: 40,
};

static ALLOWED_GEOMETRIES: [&Geometry; 2] = [&GEOMETRY_35, &GEOMETRY_40];

impl Geometry {
    /// Given a disk image file size, return the matching geometry.
    pub fn find_by_size(size: usize) -> Option<&'static Geometry> {
        ALLOWED_GEOMETRIES
            .iter()
            .find(|geometry| geometry.size() == size)
            .copied()
    }

    /// Return the geometry for a given track count (35 or 40).
    pub fn find_by_tracks(tracks: u8) -> Option<&'static Geometry> {
        ALLOWED_GEOMETRIES
            .iter()
            .find(|geometry| geometry.tracks == tracks)
            .copied()
    }

    /// Return the total number of bytes used to represent a disk image in
    /// this geometry.
    pub fn size(&self) -> usize {
        let tracks = self.tracks as usize;
        self.track_layouts[tracks].byte_offset as usize
            + self.track_layouts[tracks].sectors as usize * BLOCK_SIZE
    }

    /// Return the total number of sectors in this geometry.
    pub fn total_sectors(&self) -> usize {
        let tracks = self.tracks as usize;
        self.track_layouts[tracks].sector_offset as usize
            + self.track_layouts[tracks].sectors as usize
    }
}

/// A description of the header format for 1541 images.
static HEADER_FORMAT: HeaderFormat = HeaderFormat {
    location: Location(18, 0),
    first_directory_offset: 0x00,
    dos_version_offset: 0x02,
    disk_name_offset: 0x90,
    disk_id_offset: 0xA2,
    dos_type_offset: 0xA5,
    padding_offsets: &[0xA0, 0xA1, 0xA4, 0xA7, 0xA8],
    default_dos_version: b'A',
    default_dos_type: [b'2', b'A'],
};

/// The BAM format for 35-track images: one 4-byte entry per track at
/// offset 0x04 of sector (18,0), free count first, then a 3-byte bitmap.
static BAM_FORMAT_35: BamFormat = BamFormat {
    sections: &[BamSection {
        bitmap_location: Location(18, 0),
        bitmap_offset: 0x05,
        bitmap_size: 3,
        bitmap_stride: 4,
        free_location: Location(18, 0),
        free_offset: 0x04,
        free_stride: 4,
        tracks: 35,
    }],
};

/// The BAM format for 40-track images adds entries for tracks 36-40 in the
/// 0xC0..0xEF region of the BAM sector, using the standard 4-byte-per-track
/// encoding.  This matches the layout used by the common 40-track DOS
/// extensions.
static BAM_FORMAT_40: BamFormat = BamFormat {
    sections: &[
        BamSection {
            bitmap_location: Location(18, 0),
            bitmap_offset: 0x05,
            bitmap_size: 3,
            bitmap_stride: 4,
            free_location: Location(18, 0),
            free_offset: 0x04,
            free_stride: 4,
            tracks: 35,
        },
        BamSection {
            bitmap_location: Location(18, 0),
            bitmap_offset: 0xC1,
            bitmap_size: 3,
            bitmap_stride: 4,
            free_location: Location(18, 0),
            free_offset: 0xC0,
            free_stride: 4,
            tracks: 5,
        },
    ],
};

/// A `DiskLayout` describes how the 1541 CBM DOS uses the tracks and sectors
/// of a geometry to store the header, BAM, directory, and file chains.
#[derive(Debug)]
pub struct DiskLayout {
    pub directory_track: u8,
    /// This is also pointed to from the header sector, but the various image
    /// format documents say not to trust that field.
    pub first_directory_sector: u8,
    pub first_track: u8,
    /// The last track in normal use.  (I.e., inclusive -- not the last track
    /// plus one.)
    pub last_track: u8,
    /// The sector stride used when extending file chains.
    pub interleave: u8,
    /// Directory sectors use a tighter interleave, since scanning
    /// directories usually doesn't involve I/O between the host and
    /// peripheral.
    pub directory_interleave: u8,
    /// Per-track parameters (sectors in each track, byte offsets, etc.)
    pub tracks: &'static [Track],
    /// A description of the header layout.
    pub header: &'static HeaderFormat,
    /// A description of the BAM layout.
    pub bam: &'static BamFormat,
}

static LAYOUT_35: DiskLayout = DiskLayout {
    directory_track: 18,
    first_directory_sector: 1,
    first_track: 1,
    last_track: 35,
    interleave: 10,
    directory_interleave: 3,
    tracks: &TRACKS,
    header: &HEADER_FORMAT,
    bam: &BAM_FORMAT_35,
};

static LAYOUT_40: DiskLayout = DiskLayout {
    directory_track: 18,
    first_directory_sector: 1,
    first_track: 1,
    last_track: 40,
    interleave: 10,
    directory_interleave: 3,
    tracks: &TRACKS,
    header: &HEADER_FORMAT,
    bam: &BAM_FORMAT_40,
};

/// Return the layout matching a geometry.
pub fn layout_for(geometry: &Geometry) -> &'static DiskLayout {
    if geometry.tracks == 40 {
        &LAYOUT_40
    } else {
        &LAYOUT_35
    }
}

impl DiskLayout {
    #[inline]
    pub fn sectors_in_track(&self, track: u8) -> u8 {
        self.tracks[track as usize].sectors
    }

    #[inline]
    pub fn first_directory_location(&self) -> Location {
        Location(self.directory_track, self.first_directory_sector)
    }

    #[inline]
    pub fn bam_location(&self) -> Location {
        self.header.location
    }

    /// Return the list of locations which are reserved by CBM DOS and marked
    /// as allocated when a disk image is newly formatted.
    pub fn system_locations(&self) -> Vec<Location> {
        let mut locations = vec![];

        // Header/BAM sector
        locations.push(self.header.location);
        for section in self.bam.sections {
            locations.push(section.bitmap_location);
        }

        // The first directory sector
        locations.push(self.first_directory_location());

        // Remove duplicates.  (On the 1541 the BAM sector and header sector
        // are the same.)
        locations.sort();
        locations.dedup();
        locations
    }

    /// Return the maximum number of directory entries that are possible for
    /// this layout: every directory-track sector except the BAM sector, at
    /// eight entries apiece.
    pub fn max_directory_entries(&self) -> usize {
        use crate::disk::directory::ENTRY_SIZE;
        let directory_sectors = self.sectors_in_track(self.directory_track) as usize - 1;
        directory_sectors * BLOCK_SIZE / ENTRY_SIZE
    }

    /// Return the total number of data blocks available for files on a
    /// freshly formatted disk.  This is the equivalent of the listed "blocks
    /// free" on a blank disk.
    pub fn total_data_blocks(&self) -> usize {
        self.tracks
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                i >= &(self.first_track as usize)
                    && i <= &(self.last_track as usize)
                    && i != &(self.directory_track as usize)
            })
            .map(|(_, t)| t.sectors as usize)
            .sum()
    }

    /// Return the total number of sectors addressable in this layout.
    pub fn total_sectors(&self) -> usize {
        let tracks = self.last_track as usize;
        self.tracks[tracks].sector_offset as usize + self.tracks[tracks].sectors as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_consistency() {
        let mut sector_offset = 0;
        let mut byte_offset = 0;
        for track in TRACKS.iter() {
            assert_eq!(track.sector_offset, sector_offset);
            assert_eq!(track.byte_offset, byte_offset);
            sector_offset += track.sectors as u16;
            byte_offset += track.sectors as u32 * BLOCK_SIZE as u32;
        }
    }

    #[test]
    fn test_image_sizes() {
        assert_eq!(GEOMETRY_35.size(), 174_848);
        assert_eq!(GEOMETRY_40.size(), 196_608);
        assert_eq!(GEOMETRY_35.total_sectors(), 683);
        assert_eq!(GEOMETRY_40.total_sectors(), 768);
    }

    #[test]
    fn test_find_by_size() {
        assert_eq!(Geometry::find_by_size(174_848).map(|g| g.tracks), Some(35));
        assert_eq!(Geometry::find_by_size(196_608).map(|g| g.tracks), Some(40));
        assert!(Geometry::find_by_size(174_849).is_none());
        assert!(Geometry::find_by_size(0).is_none());
    }

    #[test]
    fn test_layout_totals() {
        assert_eq!(LAYOUT_35.total_data_blocks(), 664);
        assert_eq!(LAYOUT_40.total_data_blocks(), 749);
        assert_eq!(LAYOUT_35.max_directory_entries(), 144);
        assert_eq!(LAYOUT_35.system_locations(), vec![Location(18, 0), Location(18, 1)]);
    }
}
