//! Multi-disk backup.
//!
//! A backup copies the live files of one or more source images onto a
//! rolling series of target images.  The first target is named "BACKUP";
//! when a file will not fit, the current target is finalized and a fresh
//! one named BACKUPn (n = 1, 2, ...) continues.  Filename collisions are
//! resolved through an `OverwritePolicy`, so an interactive caller can
//! prompt while batch callers decide up front.

use std::io;

use log::info;

use crate::disk::directory::Extra;
use crate::disk::D64;
use crate::petscii::Petscii;

/// How to resolve a filename collision on the backup target.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Overwrite {
    OverwriteFile,
    SkipFile,
    OverwriteAll,
    SkipAll,
}

/// Consulted whenever a source file already exists on the target.  Sticky
/// decisions (the `*All` variants) are the policy's own responsibility to
/// remember.
pub trait OverwritePolicy {
    fn resolve(&mut self, filename: &Petscii) -> Overwrite;
}

/// A policy that always answers the same way.
pub struct FixedPolicy(pub Overwrite);

impl OverwritePolicy for FixedPolicy {
    fn resolve(&mut self, _filename: &Petscii) -> Overwrite {
        self.0
    }
}

/// A finished backup target, ready to be persisted by the caller.
pub struct BackupDisk {
    /// The host filename this image should be saved under.
    pub name: String,
    pub image: Vec<u8>,
}

/// The rolling state of one backup run: the current target, the disk
/// counter, and the collision policy.
pub struct BackupSession<'a> {
    base_name: String,
    tracks: u8,
    disk_num: u32,
    target: D64,
    finished: Vec<BackupDisk>,
    policy: &'a mut dyn OverwritePolicy,
}

/// Sectors kept free on the target when sizing up a copy.
const TARGET_MARGIN: usize = 2;

impl<'a> BackupSession<'a> {
    /// Start a backup run.  `base_name` is the host filename stem for the
    /// produced images.
    pub fn new(
        base_name: &str,
        tracks: u8,
        policy: &'a mut dyn OverwritePolicy,
    ) -> io::Result<BackupSession<'a>> {
        let mut target = D64::open_memory(tracks)?;
        target.format(&"backup".into(), &"bu".into())?;
        Ok(BackupSession {
            base_name: base_name.to_string(),
            tracks,
            disk_num: 0,
            target,
            finished: vec![],
            policy,
        })
    }

    fn current_name(&self) -> String {
        if self.disk_num == 0 {
            format!("{}.d64", self.base_name)
        } else {
            format!("{}{}.d64", self.base_name, self.disk_num)
        }
    }

    /// Finalize the current target and start a fresh one.
    fn roll_target(&mut self) -> io::Result<()> {
        let name = self.current_name();
        let image = self.target.save()?;
        self.finished.push(BackupDisk { name, image });

        self.disk_num += 1;
        let mut target = D64::open_memory(self.tracks)?;
        target.format(&format!("backup{}", self.disk_num).into(), &"bu".into())?;
        info!("target full, continuing on BACKUP{}", self.disk_num);
        self.target = target;
        Ok(())
    }

    /// Copy every live file of `source` onto the target, rolling to a new
    /// target when a file will not fit.
    pub fn copy_from(&mut self, source: &D64) -> io::Result<()> {
        for entry in source.directory()? {
            let filename = entry.filename.clone();

            if self.target.find_directory_entry(&filename).is_ok() {
                match self.policy.resolve(&filename) {
                    Overwrite::SkipFile | Overwrite::SkipAll => {
                        info!("skipping {:?}", filename);
                        continue;
                    }
                    Overwrite::OverwriteFile | Overwrite::OverwriteAll => {
                        info!("overwriting {:?}", filename);
                        self.target.remove_file(&filename)?;
                    }
                }
            }

            // Keep a safety margin of free sectors on the target.
            let needed = entry.file_size as usize;
            if self.target.free_sector_count() < needed + TARGET_MARGIN {
                self.roll_target()?;
            }

            let data = source.extract_file(&filename)?;
            match entry.extra {
                Extra::Relative(ref extra) => {
                    self.target
                        .add_rel_file(&filename, extra.record_length, &data)?;
                }
                Extra::Linear(_) => {
                    self.target
                        .add_file(&filename, entry.file_attributes.file_type, &data)?;
                }
            }
        }
        Ok(())
    }

    /// Finalize the current target and return every produced image.
    pub fn finish(mut self) -> io::Result<Vec<BackupDisk>> {
        let name = self.current_name();
        let image = self.target.save()?;
        self.finished.push(BackupDisk { name, image });
        Ok(self.finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::directory::FileType;

    fn source_with(files: &[(&str, usize)]) -> D64 {
        let mut disk = D64::open_memory(35).unwrap();
        disk.format(&"source".into(), &"s1".into()).unwrap();
        for (name, blocks) in files {
            let payload = vec![0x42u8; blocks * 254];
            disk.add_file(&Petscii::from_str(name), FileType::PRG, &payload)
                .unwrap();
        }
        disk
    }

    #[test]
    fn test_backup_copies_files() {
        let source = source_with(&[("alpha", 3), ("beta", 2)]);
        let mut policy = FixedPolicy(Overwrite::SkipAll);
        let mut session = BackupSession::new("mybackup", 35, &mut policy).unwrap();
        session.copy_from(&source).unwrap();
        let disks = session.finish().unwrap();
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].name, "mybackup.d64");

        let target = D64::load(disks[0].image.clone()).unwrap();
        assert_eq!(target.disk_name().as_bytes(), b"BACKUP");
        assert_eq!(target.directory().unwrap().len(), 2);
        assert_eq!(
            target.extract_file(&"alpha".into()).unwrap(),
            vec![0x42u8; 3 * 254]
        );
    }

    #[test]
    fn test_backup_policy_skip_and_overwrite() {
        let source_a = source_with(&[("same", 1)]);
        let mut source_b = D64::open_memory(35).unwrap();
        source_b.format(&"other".into(), &"s2".into()).unwrap();
        source_b
            .add_file(&"same".into(), FileType::SEQ, b"different contents")
            .unwrap();

        // Skip: the first copy wins.
        let mut policy = FixedPolicy(Overwrite::SkipAll);
        let mut session = BackupSession::new("b", 35, &mut policy).unwrap();
        session.copy_from(&source_a).unwrap();
        session.copy_from(&source_b).unwrap();
        let disks = session.finish().unwrap();
        let target = D64::load(disks[0].image.clone()).unwrap();
        assert_eq!(
            target.extract_file(&"same".into()).unwrap(),
            vec![0x42u8; 254]
        );

        // Overwrite: the second copy wins.
        let mut policy = FixedPolicy(Overwrite::OverwriteAll);
        let mut session = BackupSession::new("b", 35, &mut policy).unwrap();
        session.copy_from(&source_a).unwrap();
        session.copy_from(&source_b).unwrap();
        let disks = session.finish().unwrap();
        let target = D64::load(disks[0].image.clone()).unwrap();
        assert_eq!(
            target.extract_file(&"same".into()).unwrap(),
            b"different contents".to_vec()
        );
        let entry = target.find_directory_entry(&"same".into()).unwrap();
        assert_eq!(entry.file_attributes.file_type, FileType::SEQ);
    }

    #[test]
    fn test_backup_rolls_to_new_target() {
        let source_a = source_with(&[("first", 400)]);
        let source_b = source_with(&[("second", 400)]);

        let mut policy = FixedPolicy(Overwrite::SkipAll);
        let mut session = BackupSession::new("roll", 35, &mut policy).unwrap();
        session.copy_from(&source_a).unwrap();
        session.copy_from(&source_b).unwrap();
        let disks = session.finish().unwrap();

        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].name, "roll.d64");
        assert_eq!(disks[1].name, "roll1.d64");

        let first = D64::load(disks[0].image.clone()).unwrap();
        assert_eq!(first.disk_name().as_bytes(), b"BACKUP");
        assert!(first.find_directory_entry(&"first".into()).is_ok());
        assert!(first.find_directory_entry(&"second".into()).is_err());

        let second = D64::load(disks[1].image.clone()).unwrap();
        assert_eq!(second.disk_name().as_bytes(), b"BACKUP1");
        assert!(second.find_directory_entry(&"second".into()).is_ok());
    }

    #[test]
    fn test_backup_preserves_rel_files() {
        let mut source = D64::open_memory(35).unwrap();
        source.format(&"source".into(), &"s1".into()).unwrap();
        source
            .add_rel_file(&"records".into(), 50, &[9u8; 500])
            .unwrap();

        let mut policy = FixedPolicy(Overwrite::SkipAll);
        let mut session = BackupSession::new("b", 35, &mut policy).unwrap();
        session.copy_from(&source).unwrap();
        let disks = session.finish().unwrap();

        let target = D64::load(disks[0].image.clone()).unwrap();
        let entry = target.find_directory_entry(&"records".into()).unwrap();
        assert_eq!(entry.file_attributes.file_type, FileType::REL);
        match entry.extra {
            Extra::Relative(ref e) => assert_eq!(e.record_length, 50),
            _ => panic!("expected REL extra"),
        }
        assert_eq!(
            target.extract_file(&"records".into()).unwrap(),
            vec![9u8; 500]
        );
    }
}
