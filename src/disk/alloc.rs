//! Free-sector allocation.
//!
//! File data grows outward from the directory track: a cold start probes
//! track 17, then 19, 16, 20, 15, 21, and so on, alternating below and
//! above track 18 at increasing distance (tracks 36..=40 join the far end
//! of the order on 40-track disks).  A warm start continues on the previous
//! sector's track and falls through to the rest of the spiral when that
//! track fills.  Within a track, the next candidate is the previous sector
//! advanced by the interleave, scanning forward from there.
//!
//! Directory sectors are allocated separately: track 18 only, interleave 3.
//!
//! Both policies are deterministic: identical BAM state and previous
//! location always produce the same result.

use std::io;

use crate::disk::bam::Bam;
use crate::disk::block::Location;
use crate::disk::error::DiskError;
use crate::disk::geometry::DiskLayout;

/// The track search order for data allocations: distance from the directory
/// track ascending, below before above.  Track 18 is never used for data.
pub(crate) fn spiral_order(layout: &DiskLayout) -> Vec<u8> {
    let directory = layout.directory_track;
    let max_distance = (directory - layout.first_track)
        .max(layout.last_track - directory);
    let mut order = Vec::with_capacity(layout.last_track as usize);
    for distance in 1..=max_distance {
        if directory - layout.first_track >= distance {
            order.push(directory - distance);
        }
        if directory + distance <= layout.last_track {
            order.push(directory + distance);
        }
    }
    order
}

/// Scan one track for a free sector, starting at the interleave-advanced
/// candidate and wrapping forward.  The bitmap is authoritative; the stored
/// free count is not consulted.
fn scan_track(layout: &DiskLayout, bam: &Bam, track: u8, prev_sector: u8, interleave: u8) -> Option<Location> {
    let sectors = layout.sectors_in_track(track);
    let entry = match bam.entry(track) {
        Ok(entry) => *entry,
        Err(_) => return None,
    };
    let start = (prev_sector + interleave) % sectors;
    for i in 0..sectors {
        let sector = (start + i) % sectors;
        if entry.is_free(sector) {
            return Some(Location(track, sector));
        }
    }
    None
}

/// Find the next free data sector following the 1541 interleave policy.
/// `previous` is the last sector written to this chain, or None for the
/// first sector of a new file.
pub fn next_data_sector(
    layout: &DiskLayout,
    bam: &Bam,
    previous: Option<Location>,
) -> io::Result<Location> {
    let order = spiral_order(layout);

    let (start_index, prev_sector) = match previous {
        Some(Location(track, sector)) if track != 0 && track != layout.directory_track => {
            match order.iter().position(|&t| t == track) {
                Some(index) => (index, sector),
                None => (0, 0),
            }
        }
        _ => (0, 0),
    };

    for (i, &track) in order.iter().enumerate().skip(start_index) {
        let sector = if i == start_index { prev_sector } else { 0 };
        if let Some(location) = scan_track(layout, bam, track, sector, layout.interleave) {
            return Ok(location);
        }
    }

    // A warm start skips the tracks before the previous track's spiral
    // position, so rescan them before giving up.
    for &track in order.iter().take(start_index) {
        if let Some(location) = scan_track(layout, bam, track, 0, layout.interleave) {
            return Ok(location);
        }
    }

    Err(DiskError::DiskFull.into())
}

/// Find the next free directory sector.  The directory never leaves its
/// track; `previous` is the last sector of the current directory chain.
pub fn next_directory_sector(
    layout: &DiskLayout,
    bam: &Bam,
    previous: Location,
) -> io::Result<Location> {
    let track = layout.directory_track;
    match scan_track(layout, bam, track, previous.1, layout.directory_interleave) {
        Some(location) => Ok(location),
        None => Err(DiskError::DiskFull.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::geometry::{layout_for, GEOMETRY_35, GEOMETRY_40};

    fn fresh_bam(tracks: u8) -> (&'static DiskLayout, Bam) {
        use crate::disk::block::BlockDevice;
        use crate::disk::image::Image;
        use std::cell::RefCell;
        use std::rc::Rc;

        let geometry = if tracks == 40 { &GEOMETRY_40 } else { &GEOMETRY_35 };
        let layout = layout_for(geometry);
        let blocks = Rc::new(RefCell::new(BlockDevice::new(
            Image::open_memory(geometry.size()),
            geometry,
        )));
        let mut bam = Bam::new(blocks, layout);
        for location in layout.system_locations() {
            bam.allocate(location).unwrap();
        }
        (layout, bam)
    }

    #[test]
    fn test_spiral_order_starts_below() {
        let (layout, _) = fresh_bam(35);
        let order = spiral_order(layout);
        assert_eq!(&order[..6], &[17, 19, 16, 20, 15, 21]);
        assert_eq!(order.len(), 34);
        assert!(!order.contains(&18));
    }

    #[test]
    fn test_spiral_order_40_tracks() {
        let (layout, _) = fresh_bam(40);
        let order = spiral_order(layout);
        assert_eq!(order.len(), 39);
        // Tracks 36..=40 have no below-side partner and trail the order.
        assert_eq!(&order[order.len() - 5..], &[36, 37, 38, 39, 40]);
    }

    #[test]
    fn test_cold_start_lands_on_track_17() {
        let (layout, bam) = fresh_bam(35);
        let first = next_data_sector(layout, &bam, None).unwrap();
        assert_eq!(first, Location(17, 10));
    }

    #[test]
    fn test_interleave_within_track() {
        let (layout, bam) = fresh_bam(35);
        let next = next_data_sector(layout, &bam, Some(Location(17, 10))).unwrap();
        assert_eq!(next, Location(17, 20));
        let next = next_data_sector(layout, &bam, Some(Location(17, 20))).unwrap();
        // (20 + 10) % 21 = 9
        assert_eq!(next, Location(17, 9));
    }

    #[test]
    fn test_occupied_candidate_scans_forward() {
        let (layout, mut bam) = fresh_bam(35);
        bam.allocate(Location(17, 20)).unwrap();
        // Candidate (10 + 10) % 21 = 20 is taken; the scan wraps to 0.
        let next = next_data_sector(layout, &bam, Some(Location(17, 10))).unwrap();
        assert_eq!(next, Location(17, 0));
    }

    #[test]
    fn test_determinism() {
        let (layout, bam) = fresh_bam(35);
        let a = next_data_sector(layout, &bam, Some(Location(20, 5))).unwrap();
        let b = next_data_sector(layout, &bam, Some(Location(20, 5))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_full_allocation_count() {
        let (layout, mut bam) = fresh_bam(35);
        let mut previous = None;
        let mut allocated = 0usize;
        loop {
            let next = match next_data_sector(layout, &bam, previous) {
                Ok(location) => location,
                Err(ref e) if *e == DiskError::DiskFull => break,
                Err(e) => panic!("unexpected error: {}", e),
            };
            assert_ne!(next.0, 18);
            bam.allocate(next).unwrap();
            allocated += 1;
            assert!(allocated <= 664, "runaway allocation");
            previous = Some(next);
        }
        assert_eq!(allocated, 664);
    }

    #[test]
    fn test_full_allocation_count_40_tracks() {
        let (layout, mut bam) = fresh_bam(40);
        let mut previous = None;
        let mut allocated = 0usize;
        while let Ok(next) = next_data_sector(layout, &bam, previous) {
            bam.allocate(next).unwrap();
            allocated += 1;
            assert!(allocated <= 749, "runaway allocation");
            previous = Some(next);
        }
        assert_eq!(allocated, 749);
    }

    #[test]
    fn test_directory_allocation() {
        let (layout, mut bam) = fresh_bam(35);
        let mut previous = Location(18, 1);
        // (1 + 3) % 19 = 4
        let next = next_directory_sector(layout, &bam, previous).unwrap();
        assert_eq!(next, Location(18, 4));

        // The directory track has 17 sectors left after the BAM sector and
        // the first directory sector.
        let mut allocated = 0usize;
        loop {
            let next = match next_directory_sector(layout, &bam, previous) {
                Ok(location) => location,
                Err(ref e) if *e == DiskError::DiskFull => break,
                Err(e) => panic!("unexpected error: {}", e),
            };
            assert_eq!(next.0, 18);
            bam.allocate(next).unwrap();
            allocated += 1;
            assert!(allocated <= 17, "runaway allocation");
            previous = next;
        }
        assert_eq!(allocated, 17);
    }
}
