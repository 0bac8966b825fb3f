//! This is a Rust library for manipulating Commodore 1541 (D64) disk
//! images: the on-disk format used by the floppy drive that shipped with
//! the legendary Commodore 64 home computer.
//!
//! Features:
//!
//! * Load and save 35-track and 40-track D64 disk images.
//! * Format disk images.
//! * Iterate directory entries.
//! * Add, extract, rename, lock, and remove files (sequential and
//!   relative).
//! * Emulate the 1541 CBM DOS's "next available track and sector"
//!   interleave when writing files.
//! * Verify the consistency of the Block Availability Map against every
//!   reachable sector chain, and repair the inconsistencies it finds.
//! * Compact and reorder the directory.
//! * Back up the files of several source disks onto a rolling series of
//!   target images.
//! * A `d64` command-line program covering all of the above, with an
//!   interactive shell mode.
//!
//! Non-goals: GCR encoding and bit-level drive emulation, error-info
//! track extensions, and anything beyond the byte-level sector image.
//!
//! # Example
//!
//! The following formats an in-memory disk, stores a program file, and
//! reads it back:
//!
//! ```
//! use d64img::disk::{D64, FileType};
//!
//! # fn demo() -> std::io::Result<()> {
//! let mut disk = D64::open_memory(35)?;
//! disk.format(&"my disk".into(), &"01".into())?;
//! disk.add_file(&"hello".into(), FileType::PRG, b"\x01\x08some program")?;
//! let data = disk.extract_file(&"hello".into())?;
//! assert_eq!(&data[..], b"\x01\x08some program");
//! assert!(disk.verify(false)?.ok);
//! # Ok(())
//! # }
//! ```
//!
//! # Design of disk image access
//!
//! Support for disk images is built using a layered scheme: an `Image`
//! (memory-mapped file or byte buffer) is divided into sectors by a
//! `BlockDevice` according to a `Geometry`; a `DiskLayout` describes how
//! CBM DOS uses those sectors; and the `D64` type exposes the high-level
//! operations.  See the `disk` module documentation for details.

pub mod disk;
pub mod util;

mod petscii;

pub use crate::petscii::Petscii;
