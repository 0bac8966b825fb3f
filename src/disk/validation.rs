//! BAM verification and repair.
//!
//! Verification rebuilds the expected sector occupancy from scratch -- the
//! BAM sector itself, the directory chain, every live file's data chain,
//! and every REL side-sector chain -- and compares it against the BAM.
//! With `fix` enabled, the known repairs are applied: leaked sectors are
//! released, reachable-but-free sectors are allocated, free counts are
//! recomputed, and looping chains are truncated at the first repeated
//! sector.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;

use log::{debug, warn};

use crate::disk::block::Location;
use crate::disk::chain::ChainLink;
use crate::disk::directory::{DirectoryEntry, Extra, ENTRY_SIZE};
use crate::disk::D64;
use crate::petscii::Petscii;

/// An inconsistency between the BAM and the reachable chains.
#[derive(Clone, Debug, PartialEq)]
pub enum Discrepancy {
    /// Allocated in the BAM, but reachable from no chain.
    LeakedSector(Location),
    /// Free in the BAM, but used by the named owner's chain.
    MisoccupiedSector(Location, Petscii),
    /// Claimed by two chains at once.  There is no safe automatic repair.
    OveroccupiedSector(Location, Petscii, Petscii),
    /// The stored free count disagrees with the bitmap popcount.
    FreeCountMismatch { track: u8, stored: u8, actual: u8 },
    /// The named owner's chain loops or runs off the disk at this sector.
    CorruptChain(Petscii, Location),
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Discrepancy::*;
        match self {
            LeakedSector(l) => write!(f, "sector {} allocated but unreachable", l),
            MisoccupiedSector(l, owner) => {
                write!(f, "sector {} used by {:?} but free in BAM", l, owner)
            }
            OveroccupiedSector(l, a, b) => {
                write!(f, "sector {} claimed by both {:?} and {:?}", l, a, b)
            }
            FreeCountMismatch {
                track,
                stored,
                actual,
            } => write!(
                f,
                "track {} free count is {} but bitmap holds {}",
                track, stored, actual
            ),
            CorruptChain(owner, l) => write!(f, "chain of {:?} corrupt at {}", owner, l),
        }
    }
}

/// The result of a verification run.
pub struct Verification {
    /// True when the image is self-consistent (after repairs, if requested).
    pub ok: bool,
    pub discrepancies: Vec<Discrepancy>,
}

/// The working state of one detection pass.
struct Scan {
    discrepancies: Vec<Discrepancy>,
    /// Sectors whose links must be rewritten as chain tails.
    truncations: Vec<Location>,
    occupied: HashMap<Location, Petscii>,
}

impl Scan {
    fn new() -> Scan {
        Scan {
            discrepancies: vec![],
            truncations: vec![],
            occupied: HashMap::new(),
        }
    }

    /// Record ownership of a chain's sectors, flagging sectors already
    /// claimed by someone else.
    fn claim(&mut self, locations: &[Location], owner: &Petscii) {
        for location in locations {
            match self.occupied.entry(*location) {
                MapEntry::Occupied(existing) => {
                    self.discrepancies.push(Discrepancy::OveroccupiedSector(
                        *location,
                        existing.get().clone(),
                        owner.clone(),
                    ));
                }
                MapEntry::Vacant(v) => {
                    v.insert(owner.clone());
                }
            }
        }
    }

    /// Record system sectors without ownership conflict checks.
    fn claim_system(&mut self, locations: &[Location], owner: &Petscii) {
        for location in locations {
            self.occupied.insert(*location, owner.clone());
        }
    }
}

/// Walk one chain defensively, returning the sectors visited in order.
/// Loops, out-of-range links, and invalid tail bytes are recorded as
/// discrepancies, with the sector preceding the fault queued for
/// truncation.
fn walk_chain(disk: &D64, owner: &Petscii, start: Location, scan: &mut Scan) -> Vec<Location> {
    let blocks = disk.blocks();
    let blocks = blocks.borrow();
    let mut locations: Vec<Location> = vec![];
    let mut visited: HashSet<Location> = HashSet::new();
    let mut current = start;

    loop {
        if !visited.insert(current) {
            // The chain loops: the last visited sector links back into the
            // chain.  Truncate there.
            scan.discrepancies
                .push(Discrepancy::CorruptChain(owner.clone(), current));
            if let Some(previous) = locations.last() {
                scan.truncations.push(*previous);
            }
            break;
        }
        let block = match blocks.sector(current) {
            Ok(block) => block,
            Err(_) => {
                // The link points off the disk.
                scan.discrepancies
                    .push(Discrepancy::CorruptChain(owner.clone(), current));
                if let Some(previous) = locations.last() {
                    scan.truncations.push(*previous);
                }
                break;
            }
        };
        locations.push(current);
        match ChainLink::new(block) {
            Err(_) => {
                scan.discrepancies
                    .push(Discrepancy::CorruptChain(owner.clone(), current));
                scan.truncations.push(current);
                break;
            }
            Ok(ChainLink::Tail(_)) => break,
            Ok(ChainLink::Next(next)) => current = next,
        }
    }
    locations
}

/// Parse the live entries out of the walked directory sectors.  This reads
/// the raw sectors rather than using the directory iterator so that a
/// corrupt directory chain still yields the entries it reaches.
fn live_entries(disk: &D64, directory_sectors: &[Location]) -> io::Result<Vec<DirectoryEntry>> {
    let blocks = disk.blocks();
    let blocks = blocks.borrow();
    let mut entries = vec![];
    for location in directory_sectors {
        let block = blocks.sector(*location)?;
        for chunk in block.chunks(ENTRY_SIZE) {
            let entry = DirectoryEntry::parse_raw(chunk);
            if entry.file_attributes.is_live() {
                entries.push(entry);
            }
        }
    }
    Ok(entries)
}

/// One read-only detection pass over the whole image.
fn scan(disk: &D64) -> io::Result<Scan> {
    let layout = disk.layout();
    let mut scan = Scan::new();
    let system_owner = Petscii::from_str("cbm dos");
    let directory_owner = Petscii::from_str("$");

    // System sectors: the BAM/header sector.
    scan.claim_system(&layout.system_locations(), &system_owner);

    // The directory chain.
    let directory_sectors = walk_chain(
        disk,
        &directory_owner,
        layout.first_directory_location(),
        &mut scan,
    );
    scan.claim_system(&directory_sectors, &directory_owner);

    // Every live file's data chain, and side-sector chains for REL files.
    for entry in live_entries(disk, &directory_sectors)? {
        let data_sectors = walk_chain(disk, &entry.filename, entry.first_sector, &mut scan);
        scan.claim(&data_sectors, &entry.filename);

        if let Extra::Relative(ref extra) = entry.extra {
            if extra.first_side_sector.0 != 0 {
                let side_sectors =
                    walk_chain(disk, &entry.filename, extra.first_side_sector, &mut scan);
                scan.claim(&side_sectors, &entry.filename);
            }
        }
    }

    // Compare the reachable set against the BAM.
    let bam = disk.bam();
    let bam = bam.borrow();
    for location in bam.allocated_sectors() {
        if !scan.occupied.contains_key(&location) {
            scan.discrepancies.push(Discrepancy::LeakedSector(location));
        }
    }
    for (location, owner) in scan.occupied.iter() {
        if bam.is_free(*location).unwrap_or(false) {
            scan.discrepancies
                .push(Discrepancy::MisoccupiedSector(*location, owner.clone()));
        }
    }
    for track in layout.first_track..=layout.last_track {
        let entry = bam.entry(track)?;
        let actual = entry.counted_free();
        if entry.free_sectors() != actual {
            scan.discrepancies.push(Discrepancy::FreeCountMismatch {
                track,
                stored: entry.free_sectors(),
                actual,
            });
        }
    }

    Ok(scan)
}

/// Apply every repair the scan knows how to make.  Returns false when the
/// remaining discrepancies have no automatic repair.
fn apply_fixes(disk: &mut D64, scan: &Scan) -> io::Result<bool> {
    let mut repaired = false;

    // Truncate corrupt chains first: the sector preceding the fault
    // becomes the chain tail with all bytes valid.
    for location in &scan.truncations {
        let blocks = disk.blocks();
        let mut blocks = blocks.borrow_mut();
        let block = blocks.sector_mut(*location)?;
        block[0] = 0x00;
        block[1] = 0xFF;
        repaired = true;
        debug!("truncated chain: {} is now a tail sector", location);
    }

    {
        let bam = disk.bam();
        let mut bam = bam.borrow_mut();
        for discrepancy in &scan.discrepancies {
            match discrepancy {
                Discrepancy::LeakedSector(location) => {
                    bam.free(*location)?;
                    repaired = true;
                }
                Discrepancy::MisoccupiedSector(location, _) => {
                    bam.allocate(*location)?;
                    repaired = true;
                }
                Discrepancy::FreeCountMismatch { .. } => {
                    repaired = true;
                }
                Discrepancy::OveroccupiedSector(location, a, b) => {
                    warn!("no automatic repair: {} claimed by {:?} and {:?}", location, a, b);
                }
                Discrepancy::CorruptChain(_, _) => {}
            }
        }
        bam.rebuild_counts();
        bam.flush()?;
    }

    Ok(repaired)
}

/// Check the consistency of the disk image, optionally repairing it.  With
/// `fix` unset, nothing is mutated.  With `fix` set, repairs are applied
/// and re-scanned until the image is clean or only unrepairable
/// discrepancies remain; `ok` reports the final state.
pub(super) fn verify(disk: &mut D64, fix: bool) -> io::Result<Verification> {
    // Repairs can expose follow-on discrepancies (truncating a chain leaks
    // its severed tail), so fixing iterates to a fixed point.  Three rounds
    // cover the worst case; the bound is a backstop.
    const MAX_PASSES: usize = 4;

    let mut report = scan(disk)?;
    if !fix {
        return Ok(Verification {
            ok: report.discrepancies.is_empty(),
            discrepancies: report.discrepancies,
        });
    }

    let mut passes = 0;
    while !report.discrepancies.is_empty() && passes < MAX_PASSES {
        if !apply_fixes(disk, &report)? {
            break;
        }
        report = scan(disk)?;
        passes += 1;
    }

    Ok(Verification {
        ok: report.discrepancies.is_empty(),
        discrepancies: report.discrepancies,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::directory::FileType;
    use crate::disk::D64;

    fn fresh_disk_with_file() -> (D64, Vec<Location>) {
        let mut disk = D64::open_memory(35).unwrap();
        disk.format(&"test".into(), &"t1".into()).unwrap();
        disk.add_file(&"victim".into(), FileType::PRG, &[0x55; 700])
            .unwrap();
        let entry = disk.find_directory_entry(&"victim".into()).unwrap();
        let chain = crate::disk::chain::ChainIterator::new(disk.blocks(), entry.first_sector)
            .locations()
            .unwrap();
        (disk, chain)
    }

    #[test]
    fn test_fresh_disk_verifies_clean() {
        let mut disk = D64::open_memory(35).unwrap();
        disk.format(&"test".into(), &"t1".into()).unwrap();
        let result = disk.verify(false).unwrap();
        assert!(result.ok);
        assert!(result.discrepancies.is_empty());
    }

    #[test]
    fn test_cleared_bit_detected_and_repaired() {
        let (mut disk, chain) = fresh_disk_with_file();
        let target = chain[1];

        // Clear the BAM bit of a sector in the middle of the chain.
        disk.bam().borrow_mut().free(target).unwrap();
        disk.bam().borrow_mut().flush().unwrap();

        let result = disk.verify(false).unwrap();
        assert!(!result.ok);
        assert!(result
            .discrepancies
            .iter()
            .any(|d| matches!(d, Discrepancy::MisoccupiedSector(l, _) if *l == target)));

        let result = disk.verify(true).unwrap();
        assert!(result.ok);
        assert!(!disk.bam().borrow().is_free(target).unwrap());

        // Repair is idempotent.
        let result = disk.verify(false).unwrap();
        assert!(result.ok);
    }

    #[test]
    fn test_leaked_sector_released() {
        let (mut disk, _) = fresh_disk_with_file();
        let stray = Location(5, 7);
        disk.bam().borrow_mut().allocate(stray).unwrap();
        disk.bam().borrow_mut().flush().unwrap();

        let result = disk.verify(false).unwrap();
        assert!(!result.ok);
        assert!(result
            .discrepancies
            .iter()
            .any(|d| matches!(d, Discrepancy::LeakedSector(l) if *l == stray)));

        let result = disk.verify(true).unwrap();
        assert!(result.ok);
        assert!(disk.bam().borrow().is_free(stray).unwrap());
    }

    #[test]
    fn test_free_count_mismatch_rewritten() {
        let (mut disk, _) = fresh_disk_with_file();
        {
            let bam = disk.bam();
            let mut bam = bam.borrow_mut();
            bam.entry_mut(5).unwrap().set_free_sectors_raw(1);
            bam.flush().unwrap();
        }

        let result = disk.verify(false).unwrap();
        assert!(!result.ok);
        assert!(result
            .discrepancies
            .iter()
            .any(|d| matches!(d, Discrepancy::FreeCountMismatch { track: 5, .. })));

        let result = disk.verify(true).unwrap();
        assert!(result.ok);
    }

    #[test]
    fn test_chain_loop_truncated() {
        let (mut disk, chain) = fresh_disk_with_file();
        assert!(chain.len() >= 3);

        // Point the last sector back at the first, forming a cycle.
        let last = chain[chain.len() - 1];
        let first = chain[0];
        {
            let blocks = disk.blocks();
            let mut blocks = blocks.borrow_mut();
            let block = blocks.sector_mut(last).unwrap();
            block[0] = first.0;
            block[1] = first.1;
        }

        let result = disk.verify(false).unwrap();
        assert!(!result.ok);
        assert!(result
            .discrepancies
            .iter()
            .any(|d| matches!(d, Discrepancy::CorruptChain(_, _))));

        let result = disk.verify(true).unwrap();
        assert!(result.ok);

        // The chain terminates again and the file is readable.
        disk.extract_file(&"victim".into()).unwrap();
        let result = disk.verify(false).unwrap();
        assert!(result.ok);
    }
}
