use std::fmt;
use std::io;

use d64img::disk::{DiskError, FileType, D64};
use d64img::Petscii;
use rand::{Rng, SeedableRng, XorShiftRng};

const ITERATIONS: usize = 2;
const MIN_FILE_SIZE: usize = 0;
const MAX_FILE_SIZE: usize = 16 * 1024;
const MAX_ITERATIONS_PER_IMAGE: usize = 2_000;
const DELETE_CHANCE: f32 = 0.33;
const ADD_CHANCE: f32 = 0.66;
const RNG_SEED: [u8; 16] = [
    0x04, 0xC1, 0x1D, 0xB7, 0x1E, 0xDC, 0x6F, 0x41, 0x74, 0x1B, 0x8C, 0xD7, 0x32, 0x58, 0x34, 0x99,
];

const CONTENT_BYTES_PER_BLOCK: usize = 254;

static TRACK_COUNTS: &[u8] = &[35, 40];

fn deterministic_rng() -> XorShiftRng {
    XorShiftRng::from_seed(RNG_SEED)
}

fn blocks_for(len: usize) -> usize {
    std::cmp::max(
        1,
        (len + CONTENT_BYTES_PER_BLOCK - 1) / CONTENT_BYTES_PER_BLOCK,
    )
}

fn random_name(rng: &mut impl Rng) -> Petscii {
    const MIN_NAME_SIZE: usize = 1;
    const MAX_NAME_SIZE: usize = 16;
    let name_size = rng.gen_range(MIN_NAME_SIZE, MAX_NAME_SIZE + 1);
    let bytes: Vec<u8> = (0..name_size)
        .map(|_| rng.gen_range(b'A', b'Z' + 1))
        .collect();
    Petscii::from_bytes(&bytes)
}

fn random_available_name(rng: &mut impl Rng, disk: &D64) -> Petscii {
    loop {
        let name = random_name(rng);
        match disk.find_directory_entry(&name) {
            Ok(_) => continue,
            Err(ref e) if *e == DiskError::NotFound => return name,
            Err(e) => panic!("cannot check filename availability: {}", e),
        }
    }
}

fn random_file_type(rng: &mut impl Rng) -> FileType {
    static LINEAR_FILE_TYPES: &[FileType] = &[FileType::PRG, FileType::SEQ, FileType::USR];
    LINEAR_FILE_TYPES[rng.gen_range(0, LINEAR_FILE_TYPES.len())]
}

fn new_disk(rng: &mut impl Rng, tracks: u8) -> D64 {
    let name = random_name(rng);
    let mut disk = D64::open_memory(tracks).unwrap();
    disk.format(&name, &"t1".into()).unwrap();
    disk
}

struct RandomFile {
    name: Petscii,
    size: usize,
    file_type: FileType,
    contents: Vec<u8>,
}

impl RandomFile {
    fn new(rng: &mut XorShiftRng, disk: &D64) -> RandomFile {
        let name = random_available_name(rng, disk);
        let size: usize = rng.gen_range(MIN_FILE_SIZE, MAX_FILE_SIZE);
        let file_type = random_file_type(rng);
        let mut contents = vec![0u8; size];
        rng.fill(&mut contents[..]);
        RandomFile {
            name,
            size,
            file_type,
            contents,
        }
    }

    fn blocks(&self) -> usize {
        blocks_for(self.size)
    }

    fn write(&self, disk: &mut D64) -> io::Result<()> {
        disk.add_file(&self.name, self.file_type, &self.contents)
    }

    fn verify(&self, disk: &D64) -> io::Result<()> {
        let read_contents = disk.extract_file(&self.name)?;
        assert_eq!(self.contents, read_contents);

        let entry = disk.find_directory_entry(&self.name)?;
        assert_eq!(entry.filename, self.name);
        assert_eq!(entry.file_size, self.blocks() as u16);
        assert_eq!(entry.file_attributes.file_type, self.file_type);
        assert!(!entry.file_attributes.locked_flag);
        assert!(entry.file_attributes.closed_flag);

        Ok(())
    }
}

impl fmt::Debug for RandomFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "RandomFile {{ name: {:?}, size: {}, file_type: {} }}",
            self.name, self.size, self.file_type
        )
    }
}

fn verify_disk_state(disk: &mut D64, files: &[RandomFile], total_data_blocks: usize) {
    let result = disk.verify(false).unwrap();
    assert!(result.ok, "discrepancies: {:?}", result.discrepancies);

    let blocks_written: usize = files.iter().map(|f| f.blocks()).sum();
    assert_eq!(disk.free_sector_count(), total_data_blocks - blocks_written);
}

#[test]
fn random_add_delete_cycles() {
    let mut rng = deterministic_rng();

    for i in 0..ITERATIONS {
        for &tracks in TRACK_COUNTS {
            println!("Iteration: {} tracks: {}", i, tracks);

            let mut disk = new_disk(&mut rng, tracks);
            assert!(disk.directory().unwrap().is_empty());
            let total_data_blocks = disk.free_sector_count();

            let mut written_files: Vec<RandomFile> = vec![];
            let mut disk_full = false;
            for _ in 0..MAX_ITERATIONS_PER_IMAGE {
                // Randomly add files
                if rng.gen::<f32>() < ADD_CHANCE {
                    let random_file = RandomFile::new(&mut rng, &disk);
                    match random_file.write(&mut disk) {
                        Ok(_) => {
                            random_file.verify(&disk).unwrap();
                            written_files.push(random_file);
                        }
                        Err(ref e) if *e == DiskError::DiskFull => {
                            // A failed add must leave no trace.
                            assert!(disk
                                .find_directory_entry(&random_file.name)
                                .is_err());
                            disk_full = true;
                        }
                        Err(ref e) if *e == DiskError::DirectoryFull => {
                            assert_eq!(written_files.len(), 144);
                        }
                        Err(ref e) => panic!("error writing file: {}", e),
                    };
                    verify_disk_state(&mut disk, &written_files, total_data_blocks);
                    if disk_full {
                        break;
                    }
                }

                // Randomly delete files
                if rng.gen::<f32>() < DELETE_CHANCE && !written_files.is_empty() {
                    let target_index = rng.gen_range(0, written_files.len());
                    let target = written_files.remove(target_index);
                    disk.remove_file(&target.name).unwrap();
                    verify_disk_state(&mut disk, &written_files, total_data_blocks);
                }
            }
            assert!(disk_full, "the image never filled up");

            // Re-verify all remaining files.
            for file in written_files.iter() {
                file.verify(&disk).unwrap();
            }

            // Delete all remaining files; the BAM must match a fresh format.
            for file in written_files.drain(..) {
                disk.remove_file(&file.name).unwrap();
            }
            verify_disk_state(&mut disk, &[], total_data_blocks);
            assert_eq!(disk.free_sector_count(), total_data_blocks);
        }
    }
}

#[test]
fn hello_prg_scenario() {
    let mut disk = D64::open_memory(35).unwrap();
    disk.format(&"test".into(), &"01".into()).unwrap();

    let mut payload = vec![0x01u8, 0x08];
    payload.extend_from_slice(&[b'A'; 100]);
    disk.add_file(&"hello".into(), FileType::PRG, &payload)
        .unwrap();

    let entries = disk.directory().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].file_attributes.file_type, FileType::PRG);
    assert_eq!(entries[0].file_size, 1);
    assert_eq!(entries[0].filename.as_bytes(), b"HELLO");

    let data = disk.extract_file(&"hello".into()).unwrap();
    assert_eq!(data.len(), 102);
    assert_eq!(data, payload);
}

#[test]
fn fill_remove_readd_scenario() {
    let mut disk = D64::open_memory(35).unwrap();
    disk.format(&"test".into(), &"01".into()).unwrap();

    // Five-block files keep the sector supply, not the directory, as the
    // limiting resource.
    let payload = vec![0x11u8; 5 * CONTENT_BYTES_PER_BLOCK];
    let mut count = 0usize;
    loop {
        let name = Petscii::from_str(&format!("f{:04}", count + 1));
        match disk.add_file(&name, FileType::PRG, &payload) {
            Ok(_) => count += 1,
            Err(ref e) if *e == DiskError::DiskFull => break,
            Err(e) => panic!("unexpected error: {}", e),
        }
        assert!(count < 200, "the disk never filled up");
    }
    assert_eq!(count, 132); // 660 blocks used, 4 left, 7 needed

    disk.remove_file(&"f0001".into()).unwrap();
    disk.add_file(&"again".into(), FileType::PRG, &payload)
        .unwrap();

    let result = disk.verify(false).unwrap();
    assert!(result.ok, "discrepancies: {:?}", result.discrepancies);
}

#[test]
fn reorder_scenario() {
    let mut disk = D64::open_memory(35).unwrap();
    disk.format(&"test".into(), &"01".into()).unwrap();

    for name in &["a", "b", "c"] {
        disk.add_file(&Petscii::from_str(name), FileType::PRG, b"data")
            .unwrap();
    }

    disk.reorder_directory(&["c".into(), "a".into()]).unwrap();

    let names: Vec<Vec<u8>> = disk
        .directory()
        .unwrap()
        .iter()
        .map(|e| e.filename.as_bytes().to_vec())
        .collect();
    assert_eq!(names, vec![b"C".to_vec(), b"A".to_vec(), b"B".to_vec()]);

    // Contents are untouched by a reorder; names absent from disk are
    // ignored.
    disk.reorder_directory(&["missing".into(), "b".into()])
        .unwrap();
    let names: Vec<Vec<u8>> = disk
        .directory()
        .unwrap()
        .iter()
        .map(|e| e.filename.as_bytes().to_vec())
        .collect();
    assert_eq!(names, vec![b"B".to_vec(), b"C".to_vec(), b"A".to_vec()]);
    assert_eq!(disk.extract_file(&"a".into()).unwrap(), b"data".to_vec());
    assert!(disk.verify(false).unwrap().ok);
}

#[test]
fn compact_scenario() {
    let mut disk = D64::open_memory(35).unwrap();
    disk.format(&"test".into(), &"01".into()).unwrap();

    // Twenty files spread over three directory sectors.
    for i in 0..20 {
        let name = Petscii::from_str(&format!("f{:02}", i));
        let payload = vec![i as u8; 300];
        disk.add_file(&name, FileType::PRG, &payload).unwrap();
    }
    // Punch holes in the directory.
    for i in (0..20).step_by(2) {
        let name = Petscii::from_str(&format!("f{:02}", i));
        disk.remove_file(&name).unwrap();
    }

    let before = disk.free_sector_count();
    disk.compact_directory().unwrap();

    // Ten entries fit in two directory sectors; one was released, but
    // directory sectors never count against the listing figure.
    assert_eq!(disk.free_sector_count(), before);
    let entries = disk.directory().unwrap();
    assert_eq!(entries.len(), 10);

    // The set of (name, payload) pairs survives compaction.
    for i in (1..20).step_by(2) {
        let name = Petscii::from_str(&format!("f{:02}", i));
        assert_eq!(disk.extract_file(&name).unwrap(), vec![i as u8; 300]);
    }
    assert!(disk.verify(false).unwrap().ok);
}

#[test]
fn verify_repair_roundtrip_through_bytes() {
    let mut disk = D64::open_memory(35).unwrap();
    disk.format(&"test".into(), &"01".into()).unwrap();
    disk.add_file(&"victim".into(), FileType::PRG, &[0x77u8; 900])
        .unwrap();

    // Corrupt the BAM in the serialized image: mark the file's first data
    // sector free again.
    let entry = disk.find_directory_entry(&"victim".into()).unwrap();
    let (track, sector) = (entry.first_sector.0, entry.first_sector.1);
    let mut bytes = disk.save().unwrap();
    let bam_offset = 0x16500;
    let entry_offset = bam_offset + 4 + (track as usize - 1) * 4;
    bytes[entry_offset + 1 + (sector as usize / 8)] |= 1 << (sector % 8);
    bytes[entry_offset] += 1;

    let mut corrupted = D64::load(bytes).unwrap();
    assert!(!corrupted.verify(false).unwrap().ok);
    assert!(corrupted.verify(true).unwrap().ok);
    assert!(corrupted.verify(false).unwrap().ok);
    assert_eq!(
        corrupted.extract_file(&"victim".into()).unwrap(),
        vec![0x77u8; 900]
    );
}
